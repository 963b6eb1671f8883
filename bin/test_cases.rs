/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

/// Test cases.  The list of them is right at the bottom, function
/// |find_test|.  Add new ones there.  Programs in text form live in the
/// `shaders` directory and are found by file stem.
use std::fs;
use std::path::{Path, PathBuf};

use vliwra::value::{Chan, CHAN_MASKED};
use vliwra::{
  DestKind, OperandKind, Shader, SourceArray, SourceBlock, SourceDest, SourceOp, SourceOperand,
  SourceProgram,
};

use crate::parser;

pub const SHADER_DIR: &str = "shaders";

const M: Chan = CHAN_MASKED;

//=============================================================================
// Building blocks

struct Prog {
  name: &'static str,
  arrays: Vec<SourceArray>,
  blocks: Vec<SourceBlock>,
}

impl Prog {
  fn new(name: &'static str) -> Self {
    Self { name, arrays: vec![], blocks: vec![SourceBlock::default()] }
  }

  fn array(&mut self, id: u32, length: u32, ncomponents: u8) {
    self.arrays.push(SourceArray { id, length, ncomponents });
  }

  fn block(&mut self) {
    self.blocks.push(SourceBlock::default());
  }

  fn push(&mut self, op: SourceOp) {
    if let Some(b) = self.blocks.last_mut() {
      b.ops.push(op);
    }
  }

  fn op(&mut self, name: &str, dest: SourceDest, srcs: Vec<SourceOperand>) {
    self.push(SourceOp::new(name, Some(dest), srcs));
  }

  fn effect(&mut self, name: &str, srcs: Vec<SourceOperand>) {
    self.push(SourceOp::new(name, None, srcs));
  }

  fn cf(&mut self, name: &str) {
    self.push(SourceOp::new(name, None, vec![]));
  }

  fn export(&mut self, name: &str, location: u32, src: SourceOperand) {
    self.push(SourceOp::new(name, None, vec![src]).with_imm(location));
  }

  fn finish(self) -> (&'static str, SourceProgram) {
    (self.name, SourceProgram { arrays: self.arrays, blocks: self.blocks })
  }
}

fn all(kind: OperandKind) -> SourceOperand {
  SourceOperand::new(kind)
}

/// Component `c` of `kind`, whatever lane reads it.
fn comp(kind: OperandKind, c: Chan) -> SourceOperand {
  SourceOperand::swizzled(kind, [c; 4])
}

fn ssa(id: u32) -> OperandKind {
  OperandKind::Ssa(id)
}

fn var(id: u32) -> OperandKind {
  OperandKind::Var(id)
}

fn input(sel: i32) -> OperandKind {
  OperandKind::Input { sel }
}

fn fconst(x: f32) -> SourceOperand {
  all(OperandKind::Const { bits: [x.to_bits(); 4] })
}

fn iconst(n: u32) -> SourceOperand {
  all(OperandKind::Const { bits: [n; 4] })
}

fn to(id: u32, mask: u8) -> SourceDest {
  SourceDest::new(DestKind::Ssa(id), mask)
}

fn to_var(id: u32, mask: u8) -> SourceDest {
  SourceDest::new(DestKind::Var(id), mask)
}

fn x(id: u32) -> SourceOperand {
  comp(ssa(id), 0)
}

fn vx(id: u32) -> SourceOperand {
  comp(var(id), 0)
}

//=============================================================================
// Programs

/// Vector and scalar arithmetic feeding two exports.
fn test_straight_line() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("straight_line");
  p.op("mov", to(0, 0xf), vec![all(input(0))]);
  p.op("add", to(1, 0b11), vec![all(ssa(0)), fconst(0.5)]);
  p.op("mul", to(2, 1), vec![x(1), comp(ssa(1), 1)]);
  p.op("recip_ieee", to(3, 1), vec![x(2)]);
  p.op("mov", to(4, 0b01), vec![x(3)]);
  p.op("mov", to(4, 0b10), vec![comp(ssa(0), 3)]);
  p.export("export_pos", 0, all(ssa(0)));
  p.export("export_param", 0, SourceOperand::swizzled(ssa(4), [0, 1, M, M]));
  p.finish()
}

fn test_if_else() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("if_else");
  p.op("setgt", to(0, 1), vec![comp(input(0), 0), fconst(0.5)]);
  p.effect("if", vec![x(0)]);
  p.op("mov", to_var(0, 1), vec![fconst(2.0)]);
  p.cf("else");
  p.op("mov", to_var(0, 1), vec![fconst(3.0)]);
  p.cf("endif");
  p.op("add", to(1, 1), vec![vx(0), fconst(1.0)]);
  p.export("export_param", 0, SourceOperand::swizzled(ssa(1), [0, M, M, M]));
  p.finish()
}

/// Two loop carried variables.
fn test_loop_counter() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("loop_counter");
  p.op("mov", to_var(0, 1), vec![fconst(0.0)]);
  p.op("mov", to_var(1, 1), vec![fconst(1.0)]);
  p.cf("loop");
  p.op("setge", to(0, 1), vec![vx(0), fconst(5.0)]);
  p.effect("break_if", vec![x(0)]);
  p.op("add", to_var(0, 1), vec![vx(0), fconst(1.0)]);
  p.op("mul", to_var(1, 1), vec![vx(1), fconst(2.0)]);
  p.cf("endloop");
  p.op("mov", to(1, 0b01), vec![vx(0)]);
  p.op("mov", to(1, 0b10), vec![vx(1)]);
  p.export("export_param", 0, SourceOperand::swizzled(ssa(1), [0, 1, M, M]));
  p.finish()
}

fn test_nested_loops() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("nested_loops");
  p.op("mov", to_var(0, 1), vec![fconst(0.0)]);
  p.op("mov", to_var(2, 1), vec![fconst(0.0)]);
  p.cf("loop");
  p.op("setge", to(0, 1), vec![vx(0), fconst(3.0)]);
  p.effect("break_if", vec![x(0)]);
  p.op("mov", to_var(1, 1), vec![fconst(0.0)]);
  p.cf("loop");
  p.op("setge", to(1, 1), vec![vx(1), fconst(2.0)]);
  p.effect("break_if", vec![x(1)]);
  p.op("add", to_var(1, 1), vec![vx(1), fconst(1.0)]);
  p.op("sete", to(2, 1), vec![vx(1), fconst(1.0)]);
  p.effect("continue_if", vec![x(2)]);
  p.op("add", to_var(2, 1), vec![vx(2), vx(0)]);
  p.cf("endloop");
  p.op("add", to_var(0, 1), vec![vx(0), fconst(1.0)]);
  p.cf("endloop");
  p.export("export_param", 0, SourceOperand::swizzled(var(2), [0, M, M, M]));
  p.finish()
}

fn test_switch() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("switch");
  p.op("flt_to_int", to(0, 1), vec![comp(input(0), 1)]);
  p.effect("switch", vec![x(0)]);
  p.push(SourceOp::new("case", None, vec![]).with_imm(0));
  p.op("mov", to_var(0, 1), vec![fconst(10.0)]);
  p.cf("break");
  p.push(SourceOp::new("case", None, vec![]).with_imm(1));
  p.op("mov", to_var(0, 1), vec![fconst(20.0)]);
  p.cf("break");
  p.cf("default");
  p.op("mov", to_var(0, 1), vec![fconst(30.0)]);
  p.cf("break");
  p.cf("endswitch");
  p.export("export_param", 0, SourceOperand::swizzled(var(0), [0, M, M, M]));
  p.finish()
}

/// Direct writes, then an indirect read.
fn test_array_indirect() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("array_indirect");
  p.array(0, 4, 1);
  for k in 0..4 {
    let elem = DestKind::Array { id: 0, offset: k, addr: None };
    p.op("mov", SourceDest::new(elem, 1), vec![fconst(k as f32 + 1.0)]);
  }
  p.op("flt_to_int", to(0, 1), vec![comp(input(0), 1)]);
  let indirect = OperandKind::Array { id: 0, offset: 1, addr: Some(0) };
  p.op("mov", to(1, 1), vec![comp(indirect, 0)]);
  p.export("export_param", 0, SourceOperand::swizzled(ssa(1), [0, M, M, M]));
  p.finish()
}

fn test_lds() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("lds");
  p.op("mov", to(0, 1), vec![iconst(4)]);
  p.effect("lds_write", vec![x(0), fconst(7.0)]);
  p.op("lds_atomic_add", to(1, 1), vec![x(0), iconst(3)]);
  p.op("lds_read", to(2, 1), vec![x(0)]);
  p.op("mov", to(3, 0b01), vec![x(1)]);
  p.op("mov", to(3, 0b10), vec![x(2)]);
  p.export("export_param", 0, SourceOperand::swizzled(ssa(3), [0, 1, M, M]));
  p.finish()
}

fn test_fetch_export() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("fetch_export");
  p.push(SourceOp::new("sample", Some(to(0, 0xf)), vec![all(input(1))]).with_imm(2));
  p.push(SourceOp::new("fetch_vtx", Some(to(1, 0b11)), vec![comp(input(0), 0)]).with_imm(1));
  p.op("mul", to(2, 0xf), vec![all(ssa(0)), SourceOperand::swizzled(ssa(1), [0, 1, 0, 1])]);
  p.export("export_pixel", 0, all(ssa(2)));
  p.export("export_param", 1, SourceOperand::swizzled(ssa(1), [0, 1, M, M]));
  p.finish()
}

/// Transcendental ops compete for the trans unit.
fn test_trans_chain() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("trans_chain");
  p.op("recip_ieee", to(0, 1), vec![comp(input(0), 0)]);
  p.op("sqrt_ieee", to(1, 1), vec![comp(input(0), 1)]);
  p.op("sin", to(2, 1), vec![x(0)]);
  p.op("cos", to(3, 1), vec![x(1)]);
  p.op("exp_ieee", to(4, 1), vec![x(2)]);
  p.op("log_ieee", to(5, 1), vec![x(3)]);
  p.op("mullo_int", to(6, 1), vec![iconst(6), iconst(7)]);
  p.op("int_to_flt", to(7, 1), vec![x(6)]);
  p.op("mov", to(8, 0b0001), vec![x(4)]);
  p.op("mov", to(8, 0b0010), vec![x(5)]);
  p.op("mov", to(8, 0b0100), vec![x(7)]);
  p.op("mov", to(8, 0b1000), vec![x(0)]);
  p.export("export_param", 0, all(ssa(8)));
  p.finish()
}

fn test_dot_product() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("dot_product");
  p.op("mov", to(0, 0xf), vec![all(input(0))]);
  p.op("add", to(1, 0xf), vec![all(input(1)), fconst(0.25)]);
  p.op("dot4", to(2, 1), vec![all(ssa(0)), all(ssa(1))]);
  p.op("dot4_ieee", to(3, 0b10), vec![all(ssa(1)), all(ssa(1))]);
  p.op("mov", to(4, 0b01), vec![x(2)]);
  p.op("mov", to(4, 0b10), vec![comp(ssa(3), 1)]);
  p.export("export_param", 0, SourceOperand::swizzled(ssa(4), [0, 1, M, M]));
  p.finish()
}

/// Constant buffer reads, one of them indirect.
fn test_uniforms() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("uniforms");
  let u = |bank, index| all(OperandKind::Uniform { bank, index, buf_addr: None });
  p.op("muladd", to(0, 0xf), vec![u(0, 0), all(input(0)), u(1, 3)]);
  p.op("flt_to_int", to(1, 1), vec![comp(input(0), 1)]);
  let indirect = OperandKind::Uniform { bank: 2, index: 5, buf_addr: Some(1) };
  p.op("add", to(2, 0xf), vec![all(ssa(0)), all(indirect)]);
  p.op("max", to(3, 0xf), vec![all(ssa(2)), u(3, 40)]);
  p.export("export_param", 0, all(ssa(3)));
  p.finish()
}

/// Many values live at once.
fn test_pressure() -> (&'static str, SourceProgram) {
  const N: u32 = 40;
  let mut p = Prog::new("pressure");
  for k in 0..N {
    p.op("add", to(k, 1), vec![comp(input((k / 4) as i32), (k % 4) as Chan), fconst(k as f32)]);
  }
  let mut acc = N;
  p.op("mov", to(acc, 1), vec![x(0)]);
  for k in 1..N {
    p.op("add", to(acc + 1, 1), vec![x(acc), x(k)]);
    acc += 1;
  }
  p.export("export_param", 0, SourceOperand::swizzled(ssa(acc), [0, M, M, M]));
  p.finish()
}

/// Values crossing block boundaries.
fn test_blocks() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("blocks");
  p.op("mov", to(0, 0b11), vec![all(input(0))]);
  p.block();
  p.op("mul", to(1, 0b11), vec![all(ssa(0)), fconst(2.0)]);
  p.block();
  p.op("sub_int", to(2, 1), vec![iconst(10), iconst(3)]);
  p.op("int_to_flt", to(3, 1), vec![x(2)]);
  p.op("add", to(4, 0b11), vec![all(ssa(1)), comp(ssa(3), 0)]);
  p.export("export_param", 0, SourceOperand::swizzled(ssa(4), [0, 1, M, M]));
  p.finish()
}

fn test_kill() -> (&'static str, SourceProgram) {
  let mut p = Prog::new("kill");
  p.op("mov", to(0, 1), vec![comp(input(0), 0)]);
  p.export("export_param", 0, SourceOperand::swizzled(ssa(0), [0, M, M, M]));
  p.effect("killgt", vec![x(0), fconst(0.5)]);
  p.export("export_pixel", 0, SourceOperand::swizzled(ssa(0), [0, 0, 0, 0]));
  p.finish()
}

//=============================================================================
// Lookup

pub enum TestInput {
  Program(SourceProgram),
  /// Already lowered, read from the text form.
  Shader(Shader),
}

fn all_programs() -> Vec<(&'static str, SourceProgram)> {
  vec![
    test_straight_line(),
    test_if_else(),
    test_loop_counter(),
    test_nested_loops(),
    test_switch(),
    test_array_indirect(),
    test_lds(),
    test_fetch_export(),
    test_trans_chain(),
    test_dot_product(),
    test_uniforms(),
    test_pressure(),
    test_blocks(),
    test_kill(),
  ]
}

pub fn program_names() -> Vec<&'static str> {
  all_programs().into_iter().map(|(n, _)| n).collect()
}

pub fn find_program(name: &str) -> Option<SourceProgram> {
  all_programs().into_iter().find(|(n, _)| *n == name).map(|(_, p)| p)
}

/// Text programs of the shader directory, as (stem, path).
pub fn shader_files() -> Vec<(String, PathBuf)> {
  let mut res = vec![];
  let entries = match fs::read_dir(Path::new(SHADER_DIR)) {
    Ok(e) => e,
    Err(_) => return res,
  };
  for entry in entries.flatten() {
    let path = entry.path();
    if path.extension().map_or(true, |e| e != "vsh") {
      continue;
    }
    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
      res.push((stem.to_string(), path.clone()));
    }
  }
  res.sort();
  res
}

pub fn find_test(name: &str) -> Result<TestInput, Vec<String>> {
  if let Some(p) = find_program(name) {
    return Ok(TestInput::Program(p));
  }
  let files = shader_files();
  if let Some((_, path)) = files.iter().find(|(stem, _)| stem == name) {
    return match parser::parse_file(path) {
      Ok(sh) => Ok(TestInput::Shader(sh)),
      Err(e) => Err(vec![format!("{}: {}", path.display(), e)]),
    };
  }
  let mut all_names: Vec<String> = program_names().iter().map(|n| n.to_string()).collect();
  all_names.extend(files.into_iter().map(|(stem, _)| stem));
  all_names.sort();
  Err(all_names)
}
