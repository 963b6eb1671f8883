/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Top level interface: options, errors, and the compile pipeline.

use log::info;
use thiserror::Error;

use crate::alu_group::{schedule_block, KCacheLine};
use crate::checker::{check, PinnedSnapshot};
use crate::coloring::{color, commit};
use crate::data_structures::ValueIx;
use crate::interference::Interference;
use crate::live_range::evaluate;
use crate::lower::{lower, lower_lds, SourceProgram};
use crate::shader::Shader;
use crate::value::{Chan, VIRTUAL_BASE};

//=============================================================================
// Configuration

/// The register file of the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterBudget {
  /// General colors are `0..registers_end`.
  pub registers_end: i32,
  /// Colors `clause_local_start..clause_local_end` are reserved for values
  /// that never leave an ALU clause.
  pub clause_local_start: i32,
  pub clause_local_end: i32,
  /// Constant cache banks one ALU clause may lock.
  pub max_kcache_banks: usize,
}

impl Default for RegisterBudget {
  fn default() -> Self {
    Self { registers_end: 124, clause_local_start: 124, clause_local_end: 128, max_kcache_banks: 4 }
  }
}

#[derive(Clone, Debug)]
pub struct Options {
  /// Verify the allocation before writing it back.
  pub run_checker: bool,
  pub budget: RegisterBudget,
  /// Pack ALU instructions into VLIW groups.  Without this every
  /// instruction issues alone and live ranges are computed on the flat
  /// instruction list.
  pub bundle: bool,
  /// The target has a fifth, transcendental lane.  Without it
  /// transcendental ops occupy several vector lanes.
  pub trans_slot: bool,
}

impl Default for Options {
  fn default() -> Self {
    Self { run_checker: true, budget: RegisterBudget::default(), bundle: true, trans_slot: true }
  }
}

//=============================================================================
// Errors

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum BundleError {
  #[error("block {block}: all kcache banks are taken")]
  KCacheExhausted { block: i32 },

  #[error("block {block}: LDS group opened while another one is open")]
  LdsGroupAlreadyOpen { block: i32 },

  #[error("block {block}: LDS group closed but none is open")]
  LdsGroupNotOpen { block: i32 },

  #[error("block {block}: instruction can't be scheduled")]
  UnschedulableInstruction { block: i32 },
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum RegAllocError {
  /// The program needs more registers than the budget provides.
  #[error("out of registers coloring channel {chan} of register {sel}")]
  OutOfRegisters { chan: Chan, sel: i32 },

  #[error("live ranges are not finalized")]
  PartialLiveRanges,
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum CheckerError {
  #[error("chan {chan}: {a:?} and {b:?} interfere but share color {color}")]
  SharedColor { chan: Chan, a: ValueIx, b: ValueIx, color: i32 },

  #[error("chan {chan}: edge {a:?} -> {b:?} has no reverse edge")]
  AsymmetricInterference { chan: Chan, a: ValueIx, b: ValueIx },

  #[error("chan {chan}: {register:?} is live but uncolored")]
  Uncolored { chan: Chan, register: ValueIx },

  #[error("group {sel} was split over colors {colors:?}")]
  SplitGroup { sel: i32, colors: Vec<i32> },

  #[error("fixed register {sel} was moved to {color}")]
  MovedFixedRegister { sel: i32, color: i32 },
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("checker found {} errors", .errors.len())]
pub struct CheckerErrors {
  pub errors: Vec<CheckerError>,
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
  #[error("block {block}, op {index}: unsupported opcode {name}")]
  UnsupportedOpcode { block: usize, index: usize, name: String },

  #[error("block {block}, op {index}: {name} takes {expected} operands, got {found}")]
  MalformedOperands { block: usize, index: usize, name: String, expected: usize, found: usize },

  #[error("block {block}, op {index}: bad operand to {name}: {reason}")]
  BadOperand { block: usize, index: usize, name: String, reason: &'static str },

  #[error("block {block}, op {index}: unsupported {bits}-bit operation")]
  UnsupportedBitSize { block: usize, index: usize, bits: u8 },

  #[error("array {id} is malformed")]
  InvalidArray { id: u32 },

  #[error("block {block}, op {index}: unbalanced {op}")]
  UnbalancedControlFlow { block: usize, index: usize, op: String },

  #[error("bundling failed: {0}")]
  Bundle(#[from] BundleError),

  #[error("register allocation failed: {0}")]
  Alloc(#[from] RegAllocError),

  #[error(transparent)]
  Checker(#[from] CheckerErrors),
}

//=============================================================================
// Output

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArrayInfo {
  pub base_sel: i32,
  pub size: u32,
  pub chan_mask: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockKCache {
  pub block: i32,
  /// Lines locked by each ALU clause, in clause order.
  pub clauses: Vec<Vec<KCacheLine>>,
}

/// What the encoder and the driver need to know besides the instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ShaderInfo {
  pub num_gprs: u32,
  pub arrays: Vec<ArrayInfo>,
  pub kcache: Vec<BlockKCache>,
}

impl ShaderInfo {
  /// Clause-local registers are scratch space of the ALU clauses and are
  /// not part of the count.
  pub fn from_shader(shader: &Shader, budget: &RegisterBudget) -> Self {
    let vf = &shader.vf;
    let clause_local = budget.clause_local_start..budget.clause_local_end;
    let mut num_gprs = vf
      .values()
      .iter()
      .filter(|v| v.is_gpr() && !v.is_virtual() && !clause_local.contains(&v.sel))
      .fold(0, |acc, v| acc.max(v.sel + 1));
    if let Some((_, end)) = vf.array_range() {
      num_gprs = num_gprs.max(end);
    }
    debug_assert!(num_gprs <= VIRTUAL_BASE);
    let arrays = vf
      .arrays()
      .iter()
      .map(|a| ArrayInfo { base_sel: a.base_sel, size: a.size, chan_mask: a.channel_mask() })
      .collect();
    let kcache = shader
      .blocks
      .iter()
      .filter(|b| !b.kcache.iter().all(|c| c.is_empty()))
      .map(|b| BlockKCache { block: b.id, clauses: b.kcache.clone() })
      .collect();
    Self { num_gprs: num_gprs as u32, arrays, kcache }
  }
}

pub struct CompiledShader {
  pub shader: Shader,
  pub info: ShaderInfo,
}

//=============================================================================
// Pipeline

/// Compile `program` down to allocated, bundled instructions.
pub fn compile(program: &SourceProgram, options: &Options) -> Result<CompiledShader, CompileError> {
  info!("compile: begin");
  let mut shader = lower(program, options.trans_slot)?;
  shader.remove_dead_code();
  lower_lds(&mut shader);
  if options.bundle {
    bundle_shader(&mut shader, options)?;
  }
  let info = allocate_registers(&mut shader, options)?;
  info!("compile: end, {} registers", info.num_gprs);
  Ok(CompiledShader { shader, info })
}

/// Pack the ALU instructions of every block into groups.
pub fn bundle_shader(shader: &mut Shader, options: &Options) -> Result<(), BundleError> {
  for b in 0..shader.blocks.len() {
    schedule_block(shader, b, options.trans_slot, options.budget.max_kcache_banks)?;
  }
  Ok(())
}

/// Compute live ranges, color them and write the colors back into the
/// shader's values.
pub fn allocate_registers(shader: &mut Shader, options: &Options) -> Result<ShaderInfo, CompileError> {
  info!("allocate_registers: begin");
  let mut map = evaluate(shader);
  let interference = Interference::new(&map);
  let snapshot =
    if options.run_checker { Some(PinnedSnapshot::take(&map, &shader.vf)) } else { None };
  color(&mut map, &interference, &shader.vf, &options.budget)?;
  if let Some(snapshot) = snapshot {
    check(&map, &interference, &snapshot)?;
  }
  commit(&map, &mut shader.vf);
  info!("allocate_registers: end");
  Ok(ShaderInfo::from_shader(shader, &options.budget))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::lower::{DestKind, OperandKind, SourceBlock, SourceDest, SourceOp, SourceOperand};
  use crate::value_factory::ValueFactory;

  fn input_x() -> SourceOperand {
    SourceOperand::swizzled(OperandKind::Input { sel: 0 }, [0, 0, 0, 0])
  }

  fn ssa(id: u32) -> SourceOperand {
    SourceOperand::swizzled(OperandKind::Ssa(id), [0, 0, 0, 0])
  }

  fn fconst(f: f32) -> SourceOperand {
    SourceOperand::new(OperandKind::Const { bits: [f.to_bits(); 4] })
  }

  fn to_ssa(id: u32) -> Option<SourceDest> {
    Some(SourceDest::new(DestKind::Ssa(id), 1))
  }

  /// `n` values computed from the input, all live until they are summed.
  fn sum_of(n: u32) -> SourceProgram {
    let mut ops = vec![];
    for i in 0..n {
      ops.push(SourceOp::new("add", to_ssa(i), vec![input_x(), fconst(i as f32 + 3.0)]));
    }
    let mut acc = 0;
    for i in 1..n {
      ops.push(SourceOp::new("add", to_ssa(n + i), vec![ssa(acc), ssa(i)]));
      acc = n + i;
    }
    ops.push(SourceOp::new("export_pixel", None, vec![ssa(acc)]));
    SourceProgram { arrays: vec![], blocks: vec![SourceBlock { ops }] }
  }

  #[test]
  fn compile_replaces_every_virtual_register() {
    let compiled = compile(&sum_of(4), &Options::default()).unwrap();
    assert!(compiled.info.num_gprs >= 1);
    assert!(compiled.info.num_gprs < 8);
    let text = compiled.shader.render();
    for tok in text.split_whitespace() {
      let tok = tok.trim_start_matches(|c| c == '-' || c == '|');
      let mut chars = tok.chars();
      let virt = matches!(chars.next(), Some('S') | Some('V'));
      assert!(!(virt && chars.next().map_or(false, |c| c.is_ascii_digit())), "{}", text);
    }
    assert!(compiled.info.arrays.is_empty());
  }

  #[test]
  fn clause_local_registers_are_not_counted() {
    let mut vf = ValueFactory::new();
    vf.physical(2, 0, true);
    vf.physical(125, 3, false);
    let sh = Shader::new(vf);
    assert_eq!(ShaderInfo::from_shader(&sh, &RegisterBudget::default()).num_gprs, 3);
    let no_clause_local = RegisterBudget {
      registers_end: 128,
      clause_local_start: 128,
      clause_local_end: 128,
      ..RegisterBudget::default()
    };
    assert_eq!(ShaderInfo::from_shader(&sh, &no_clause_local).num_gprs, 126);
  }

  #[test]
  fn unbundled_pipeline_allocates_too() {
    let options = Options { bundle: false, ..Options::default() };
    assert!(compile(&sum_of(4), &options).is_ok());
  }

  #[test]
  fn too_small_register_file_is_reported() {
    let budget = RegisterBudget {
      registers_end: 1,
      clause_local_start: 1,
      clause_local_end: 1,
      ..RegisterBudget::default()
    };
    let options = Options { budget, ..Options::default() };
    match compile(&sum_of(8), &options) {
      Err(CompileError::Alloc(RegAllocError::OutOfRegisters { .. })) => {}
      other => panic!("unexpected {:?}", other.map(|c| c.info)),
    }
  }
}
