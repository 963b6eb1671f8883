/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Lowering of front end programs into a [`Shader`].
//!
//! The front end hands over blocks of abstract operations that name their
//! operands by SSA id, variable id, array id or constant.  ALU opcodes are
//! looked up by name in the opcode table; everything else (control flow,
//! LDS access, fetches, exports) has a lower case name of its own, listed
//! in `SPECIAL_OPS`.
//!
//! Scalar ops are emitted once per written component.  Ops spanning several
//! lanes (dot products, interpolation) are emitted as one instruction that
//! writes a single component.  On targets without a transcendental unit,
//! transcendental ops are emitted over three or four vector lanes.

use log::{debug, info, trace};

use crate::data_structures::{InstIx, Map, ValueIx};
use crate::instr::{
  AluCf, AluInstr, CfInstr, ExportInstr, ExportKind, FetchInstr, FetchOp, InstrKind, LdsInstr, Src,
  VecReg,
};
use crate::interface::CompileError;
use crate::opcodes::{AluOp, LdsOp};
use crate::shader::Shader;
use crate::value::{Chan, InlineConstant, Pin, CHAN_MASKED, NUM_CHANNELS, VIRTUAL_BASE};
use crate::value_factory::{SourceKey, ValueFactory};

//=============================================================================
// Front end program

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceArray {
  pub id: u32,
  pub length: u32,
  pub ncomponents: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperandKind {
  Ssa(u32),
  Var(u32),
  /// `addr` names an SSA value whose x component is added to `offset`.
  Array { id: u32, offset: u32, addr: Option<u32> },
  /// One bit pattern per component.
  Const { bits: [u32; 4] },
  Uniform { bank: u32, index: u32, buf_addr: Option<u32> },
  /// Hardware register preloaded before the program starts.
  Input { sel: i32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceOperand {
  pub kind: OperandKind,
  /// Component read for each lane; `CHAN_MASKED` for unused lanes.
  pub swizzle: [Chan; NUM_CHANNELS],
  pub neg: bool,
  pub abs: bool,
}

impl SourceOperand {
  pub fn new(kind: OperandKind) -> Self {
    Self { kind, swizzle: [0, 1, 2, 3], neg: false, abs: false }
  }

  pub fn swizzled(kind: OperandKind, swizzle: [Chan; NUM_CHANNELS]) -> Self {
    Self { kind, swizzle, neg: false, abs: false }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DestKind {
  Ssa(u32),
  Var(u32),
  Array { id: u32, offset: u32, addr: Option<u32> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDest {
  pub kind: DestKind,
  /// Bit `c` set: component `c` is written.
  pub write_mask: u8,
  pub clamp: bool,
}

impl SourceDest {
  pub fn new(kind: DestKind, write_mask: u8) -> Self {
    Self { kind, write_mask, clamp: false }
  }

  fn components(&self) -> impl Iterator<Item = Chan> + '_ {
    (0..NUM_CHANNELS as Chan).filter(move |c| self.write_mask & (1 << c) != 0)
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceOp {
  pub opcode: String,
  pub dest: Option<SourceDest>,
  pub srcs: Vec<SourceOperand>,
  pub bit_size: u8,
  /// Case value, export location or fetch resource.
  pub imm: u32,
}

impl SourceOp {
  pub fn new(opcode: &str, dest: Option<SourceDest>, srcs: Vec<SourceOperand>) -> Self {
    Self { opcode: opcode.to_string(), dest, srcs, bit_size: 32, imm: 0 }
  }

  pub fn with_imm(mut self, imm: u32) -> Self {
    self.imm = imm;
    self
  }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceBlock {
  pub ops: Vec<SourceOp>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceProgram {
  pub arrays: Vec<SourceArray>,
  pub blocks: Vec<SourceBlock>,
}

//=============================================================================
// Opcode classes

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CfOp {
  If,
  Else,
  EndIf,
  Loop,
  EndLoop,
  Break,
  Continue,
  Switch,
  Case,
  Default,
  EndSwitch,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OpClass {
  Alu(AluOp),
  Cf(CfOp),
  /// Predicated loop exit.
  CfIf(AluCf),
  Lds(LdsOp),
  Fetch(FetchOp),
  Export(ExportKind),
}

static SPECIAL_OPS: [(&str, OpClass); 22] = [
  ("if", OpClass::Cf(CfOp::If)),
  ("else", OpClass::Cf(CfOp::Else)),
  ("endif", OpClass::Cf(CfOp::EndIf)),
  ("loop", OpClass::Cf(CfOp::Loop)),
  ("endloop", OpClass::Cf(CfOp::EndLoop)),
  ("break", OpClass::Cf(CfOp::Break)),
  ("continue", OpClass::Cf(CfOp::Continue)),
  ("switch", OpClass::Cf(CfOp::Switch)),
  ("case", OpClass::Cf(CfOp::Case)),
  ("default", OpClass::Cf(CfOp::Default)),
  ("endswitch", OpClass::Cf(CfOp::EndSwitch)),
  ("break_if", OpClass::CfIf(AluCf::Break)),
  ("continue_if", OpClass::CfIf(AluCf::Continue)),
  ("lds_read", OpClass::Lds(LdsOp::Read)),
  ("lds_write", OpClass::Lds(LdsOp::Write)),
  ("lds_atomic_add", OpClass::Lds(LdsOp::AddRet)),
  ("lds_atomic_xchg", OpClass::Lds(LdsOp::XchgRet)),
  ("fetch_vtx", OpClass::Fetch(FetchOp::Vtx)),
  ("sample", OpClass::Fetch(FetchOp::Sample)),
  ("export_pixel", OpClass::Export(ExportKind::Pixel)),
  ("export_pos", OpClass::Export(ExportKind::Pos)),
  ("export_param", OpClass::Export(ExportKind::Param)),
];

/// Open control flow constructs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Construct {
  If,
  Else,
  Loop,
  Switch,
  Case,
}

impl Construct {
  fn name(self) -> &'static str {
    match self {
      Construct::If => "if",
      Construct::Else => "else",
      Construct::Loop => "loop",
      Construct::Switch => "switch",
      Construct::Case => "case",
    }
  }
}

fn const_value(vf: &mut ValueFactory, bits: u32) -> ValueIx {
  let inline = match bits {
    0 => Some(InlineConstant::Zero),
    0x3f80_0000 => Some(InlineConstant::One),
    0x3f00_0000 => Some(InlineConstant::Half),
    1 => Some(InlineConstant::OneInt),
    0xffff_ffff => Some(InlineConstant::MinusOneInt),
    _ => None,
  };
  match inline {
    Some(k) => vf.inline_constant(k),
    None => vf.literal(bits),
  }
}

//=============================================================================
// Lowering

/// Where the op being lowered sits, for error reports.
#[derive(Copy, Clone)]
struct At<'p> {
  block: usize,
  index: usize,
  op: &'p SourceOp,
}

impl<'p> At<'p> {
  fn bad(self, reason: &'static str) -> CompileError {
    CompileError::BadOperand {
      block: self.block,
      index: self.index,
      name: self.op.opcode.clone(),
      reason,
    }
  }

  fn expect_srcs(self, expected: usize) -> Result<(), CompileError> {
    if self.op.srcs.len() != expected {
      return Err(CompileError::MalformedOperands {
        block: self.block,
        index: self.index,
        name: self.op.opcode.clone(),
        expected,
        found: self.op.srcs.len(),
      });
    }
    Ok(())
  }

  fn dest(self) -> Result<&'p SourceDest, CompileError> {
    match &self.op.dest {
      Some(d) if d.write_mask & 0xf != 0 => Ok(d),
      Some(_) => Err(self.bad("empty write mask")),
      None => Err(self.bad("missing destination")),
    }
  }

  fn no_dest(self) -> Result<(), CompileError> {
    match self.op.dest {
      Some(_) => Err(self.bad("takes no destination")),
      None => Ok(()),
    }
  }

  fn unbalanced(self) -> CompileError {
    CompileError::UnbalancedControlFlow {
      block: self.block,
      index: self.index,
      op: self.op.opcode.clone(),
    }
  }
}

struct Lowerer {
  shader: Shader,
  trans_slot: bool,
  /// Opcode names resolved so far.
  classes: Map<String, Option<OpClass>>,
  open: Vec<Construct>,
  last_export: [Option<InstIx>; 3],
}

impl Lowerer {
  fn classify(&mut self, name: &str) -> Option<OpClass> {
    if let Some(c) = self.classes.get(name) {
      return *c;
    }
    let class = SPECIAL_OPS.iter().find(|(n, _)| *n == name).map(|(_, c)| *c).or_else(|| {
      // LDS ALU ops only come out of `lower_lds`.
      AluOp::from_name(name).filter(|op| !op.info().lds).map(OpClass::Alu)
    });
    self.classes.insert(name.to_string(), class);
    class
  }

  fn emit(&mut self, block: usize, kind: InstrKind) -> InstIx {
    self.shader.emit(block, kind)
  }

  fn emit_kept(&mut self, block: usize, kind: InstrKind) -> InstIx {
    let ix = self.shader.emit(block, kind);
    self.shader.instrs[ix].always_keep = true;
    ix
  }

  //===========================================================================
  // Operands

  fn array_value(
    &mut self, at: At, id: u32, offset: u32, comp: Chan, addr: Option<u32>,
  ) -> Result<ValueIx, CompileError> {
    let vf = &mut self.shader.vf;
    let array = vf.array_for_source(id).ok_or_else(|| at.bad("unknown array"))?;
    let addr = addr.map(|a| vf.value_for(SourceKey::Ssa(a), 0));
    vf.array_element(array, offset, comp, addr).ok_or_else(|| at.bad("array access out of bounds"))
  }

  /// Source `s` as read by lane `lane`.
  fn src(&mut self, at: At, s: &SourceOperand, lane: usize) -> Result<Src, CompileError> {
    let comp = s.swizzle[lane];
    if comp as usize >= NUM_CHANNELS {
      return Err(at.bad("masked source component"));
    }
    let value = match &s.kind {
      OperandKind::Ssa(id) => self.shader.vf.value_for(SourceKey::Ssa(*id), comp),
      OperandKind::Var(id) => self.shader.vf.value_for(SourceKey::Var(*id), comp),
      OperandKind::Array { id, offset, addr } => self.array_value(at, *id, *offset, comp, *addr)?,
      OperandKind::Const { bits } => const_value(&mut self.shader.vf, bits[comp as usize]),
      OperandKind::Uniform { bank, index, buf_addr } => {
        let vf = &mut self.shader.vf;
        let buf_addr = buf_addr.map(|a| vf.value_for(SourceKey::Ssa(a), 0));
        vf.uniform(*bank, *index, comp, buf_addr)
      }
      OperandKind::Input { sel } => self.shader.vf.physical(*sel, comp, true),
    };
    Ok(Src { value, neg: s.neg, abs: s.abs })
  }

  fn dest(&mut self, at: At, d: &SourceDest, c: Chan, pin: Pin) -> Result<ValueIx, CompileError> {
    Ok(match &d.kind {
      DestKind::Ssa(id) => self.shader.vf.dest_for(SourceKey::Ssa(*id), c, pin),
      // Variables are written more than once; they can't move.
      DestKind::Var(id) => {
        let pin = if pin == Pin::None { Pin::Chan } else { pin };
        self.shader.vf.dest_for(SourceKey::Var(*id), c, pin)
      }
      DestKind::Array { id, offset, addr } => self.array_value(at, *id, *offset, c, *addr)?,
    })
  }

  /// The four channels of a non-array destination, grouped.
  fn vec_dest(&mut self, at: At, d: &SourceDest) -> Result<VecReg, CompileError> {
    let key = match d.kind {
      DestKind::Ssa(id) => SourceKey::Ssa(id),
      DestKind::Var(id) => SourceKey::Var(id),
      DestKind::Array { .. } => return Err(at.bad("vector destination can't be an array")),
    };
    let mut regs = [ValueIx::new(0); NUM_CHANNELS];
    let mut swizzle = [CHAN_MASKED; NUM_CHANNELS];
    for c in 0..NUM_CHANNELS {
      regs[c] = self.shader.vf.dest_for(key, c as Chan, Pin::Group);
      if d.write_mask & (1 << c) != 0 {
        swizzle[c] = c as Chan;
      }
    }
    Ok(VecReg { regs, swizzle })
  }

  /// Copy the used lanes of `s` into a fresh register group, as fetches
  /// and exports need their operand in one register.
  fn gather(
    &mut self, block: usize, at: At, s: &SourceOperand, lanes: usize,
  ) -> Result<VecReg, CompileError> {
    let regs = self.shader.vf.temp_vec4(Pin::Group);
    let mut swizzle = [CHAN_MASKED; NUM_CHANNELS];
    for lane in 0..lanes {
      if s.swizzle[lane] == CHAN_MASKED {
        continue;
      }
      let src = self.src(at, s, lane)?;
      self.emit(block, InstrKind::Alu(AluInstr::new(AluOp::Mov, Some(regs[lane]), vec![src])));
      swizzle[lane] = lane as Chan;
    }
    Ok(VecReg { regs, swizzle })
  }

  //===========================================================================
  // Ops

  fn lower_alu(&mut self, block: usize, at: At, op: AluOp) -> Result<(), CompileError> {
    let info = op.info();
    at.expect_srcs(info.nsrc as usize)?;
    let srcs_in = &at.op.srcs;

    if info.no_dest {
      at.no_dest()?;
      let mut srcs = vec![];
      for s in srcs_in {
        srcs.push(self.src(at, s, 0)?);
      }
      self.emit_kept(block, InstrKind::Alu(AluInstr::without_dest(op, 0, srcs)));
      return Ok(());
    }

    let d = at.dest()?;
    let ncomp = d.write_mask.count_ones();
    if info.slots > 1 {
      if ncomp != 1 {
        return Err(at.bad("multi-lane op writes one component"));
      }
      let c = d.write_mask.trailing_zeros() as Chan;
      let dest = self.dest(at, d, c, Pin::Chan)?;
      let mut srcs = vec![];
      for lane in 0..info.slots as usize {
        for s in srcs_in {
          srcs.push(self.src(at, s, lane)?);
        }
      }
      let mut alu = AluInstr::multislot(op, Some(dest), srcs, info.slots);
      alu.flags.clamp = d.clamp;
      self.emit(block, InstrKind::Alu(alu));
      return Ok(());
    }

    for c in d.components() {
      let mut alu = if info.transcendental && !self.trans_slot {
        // One lane per vector slot up to the one that is written.
        let slots = (c + 1).max(3);
        let dest = self.dest(at, d, c, Pin::Chan)?;
        let mut srcs = vec![];
        for _ in 0..slots {
          for s in srcs_in {
            srcs.push(self.src(at, s, c as usize)?);
          }
        }
        AluInstr::multislot(op, Some(dest), srcs, slots)
      } else {
        let pin = if ncomp == 1 { Pin::None } else { Pin::Chan };
        let dest = self.dest(at, d, c, pin)?;
        let mut srcs = vec![];
        for s in srcs_in {
          srcs.push(self.src(at, s, c as usize)?);
        }
        AluInstr::new(op, Some(dest), srcs)
      };
      alu.flags.clamp = d.clamp;
      self.emit(block, InstrKind::Alu(alu));
    }
    Ok(())
  }

  fn check_cf(&mut self, at: At, cf: CfOp) -> Result<(), CompileError> {
    let top = self.open.last().cloned();
    let in_loop = self.open.contains(&Construct::Loop);
    match cf {
      CfOp::If => self.open.push(Construct::If),
      CfOp::Loop => self.open.push(Construct::Loop),
      CfOp::Switch => self.open.push(Construct::Switch),
      CfOp::Else => match top {
        Some(Construct::If) => {
          self.open.pop();
          self.open.push(Construct::Else);
        }
        _ => return Err(at.unbalanced()),
      },
      CfOp::EndIf => match top {
        Some(Construct::If) | Some(Construct::Else) => {
          self.open.pop();
        }
        _ => return Err(at.unbalanced()),
      },
      CfOp::EndLoop => match top {
        Some(Construct::Loop) => {
          self.open.pop();
        }
        _ => return Err(at.unbalanced()),
      },
      CfOp::Break => {
        if !in_loop && !self.open.contains(&Construct::Case) {
          return Err(at.unbalanced());
        }
      }
      CfOp::Continue => {
        if !in_loop {
          return Err(at.unbalanced());
        }
      }
      CfOp::Case | CfOp::Default => match top {
        Some(Construct::Switch) => self.open.push(Construct::Case),
        Some(Construct::Case) => {}
        _ => return Err(at.unbalanced()),
      },
      CfOp::EndSwitch => {
        if top == Some(Construct::Case) {
          self.open.pop();
        }
        match self.open.last() {
          Some(Construct::Switch) => {
            self.open.pop();
          }
          _ => return Err(at.unbalanced()),
        }
      }
    }
    Ok(())
  }

  fn lower_cf(&mut self, block: usize, at: At, cf: CfOp) -> Result<(), CompileError> {
    let nsrc = match cf {
      CfOp::If | CfOp::Switch => 1,
      _ => 0,
    };
    at.expect_srcs(nsrc)?;
    at.no_dest()?;
    self.check_cf(at, cf)?;
    let instr = match cf {
      CfOp::If => CfInstr::If(self.src(at, &at.op.srcs[0], 0)?.value),
      CfOp::Switch => CfInstr::Switch(self.src(at, &at.op.srcs[0], 0)?.value),
      CfOp::Else => CfInstr::Else,
      CfOp::EndIf => CfInstr::EndIf,
      CfOp::Loop => CfInstr::LoopBegin,
      CfOp::EndLoop => CfInstr::LoopEnd,
      CfOp::Break => CfInstr::Break,
      CfOp::Continue => CfInstr::Continue,
      CfOp::Case => CfInstr::Case(at.op.imm),
      CfOp::Default => CfInstr::Default,
      CfOp::EndSwitch => CfInstr::EndSwitch,
    };
    self.emit(block, InstrKind::ControlFlow(instr));
    Ok(())
  }

  /// `break_if c` / `continue_if c`: a predicate set that leaves the loop
  /// when `c` is not zero.
  fn lower_cf_if(&mut self, block: usize, at: At, cf: AluCf) -> Result<(), CompileError> {
    at.expect_srcs(1)?;
    at.no_dest()?;
    if !self.open.contains(&Construct::Loop) {
      return Err(at.unbalanced());
    }
    let cond = self.src(at, &at.op.srcs[0], 0)?;
    let zero = self.shader.vf.inline_constant(InlineConstant::Zero);
    let mut alu = AluInstr::without_dest(AluOp::PredSetNe, 0, vec![cond, Src::new(zero)]);
    alu.flags.update_exec = true;
    alu.flags.update_pred = true;
    alu.cf = Some(cf);
    self.emit_kept(block, InstrKind::Alu(alu));
    Ok(())
  }

  fn lower_lds_op(&mut self, block: usize, at: At, op: LdsOp) -> Result<(), CompileError> {
    match op {
      LdsOp::Read => {
        at.expect_srcs(1)?;
        let d = at.dest()?;
        let pin = if d.write_mask.count_ones() == 1 { Pin::None } else { Pin::Chan };
        for c in d.components() {
          let dest = self.dest(at, d, c, pin)?;
          let addr = self.src(at, &at.op.srcs[0], c as usize)?.value;
          let lds = LdsInstr { op, dest: Some(dest), srcs: [addr].iter().cloned().collect() };
          self.emit(block, InstrKind::Lds(lds));
        }
      }
      LdsOp::Write => {
        at.expect_srcs(2)?;
        at.no_dest()?;
        let addr = self.src(at, &at.op.srcs[0], 0)?.value;
        let value = self.src(at, &at.op.srcs[1], 0)?.value;
        let lds = LdsInstr { op, dest: None, srcs: [addr, value].iter().cloned().collect() };
        self.emit(block, InstrKind::Lds(lds));
      }
      LdsOp::AddRet | LdsOp::XchgRet => {
        at.expect_srcs(2)?;
        let d = at.dest()?;
        if d.write_mask.count_ones() != 1 {
          return Err(at.bad("atomic writes one component"));
        }
        let c = d.write_mask.trailing_zeros() as Chan;
        let dest = self.dest(at, d, c, Pin::None)?;
        let addr = self.src(at, &at.op.srcs[0], 0)?.value;
        let value = self.src(at, &at.op.srcs[1], 0)?.value;
        let lds = LdsInstr { op, dest: Some(dest), srcs: [addr, value].iter().cloned().collect() };
        self.emit(block, InstrKind::Lds(lds));
      }
    }
    Ok(())
  }

  fn lower_fetch(&mut self, block: usize, at: At, op: FetchOp) -> Result<(), CompileError> {
    at.expect_srcs(1)?;
    let d = at.dest()?;
    let lanes = match op {
      FetchOp::Vtx => 1,
      FetchOp::Sample => NUM_CHANNELS,
    };
    let src = self.gather(block, at, &at.op.srcs[0], lanes)?;
    let dest = self.vec_dest(at, d)?;
    let fetch = FetchInstr { op, dest, src, resource_id: at.op.imm };
    self.emit(block, InstrKind::Fetch(fetch));
    Ok(())
  }

  fn lower_export(&mut self, block: usize, at: At, kind: ExportKind) -> Result<(), CompileError> {
    at.expect_srcs(1)?;
    at.no_dest()?;
    let value = self.gather(block, at, &at.op.srcs[0], NUM_CHANNELS)?;
    let export = ExportInstr { kind, location: at.op.imm, value, last: false };
    let ix = self.emit_kept(block, InstrKind::Export(export));
    self.last_export[kind as usize] = Some(ix);
    Ok(())
  }

  fn lower_op(&mut self, block: usize, at: At) -> Result<(), CompileError> {
    match at.op.bit_size {
      1 | 32 => {}
      bits => return Err(CompileError::UnsupportedBitSize { block: at.block, index: at.index, bits }),
    }
    let class = match self.classify(&at.op.opcode) {
      Some(c) => c,
      None => {
        return Err(CompileError::UnsupportedOpcode {
          block: at.block,
          index: at.index,
          name: at.op.opcode.clone(),
        })
      }
    };
    trace!("lower {:?}", at.op);
    match class {
      OpClass::Alu(op) => self.lower_alu(block, at, op),
      OpClass::Cf(cf) => self.lower_cf(block, at, cf),
      OpClass::CfIf(cf) => self.lower_cf_if(block, at, cf),
      OpClass::Lds(op) => self.lower_lds_op(block, at, op),
      OpClass::Fetch(op) => self.lower_fetch(block, at, op),
      OpClass::Export(kind) => self.lower_export(block, at, kind),
    }
  }

  /// Hardware inputs and arrays take their registers before anything is
  /// emitted.
  fn declare(&mut self, program: &SourceProgram) -> Result<(), CompileError> {
    for (b, block) in program.blocks.iter().enumerate() {
      for (index, op) in block.ops.iter().enumerate() {
        for s in &op.srcs {
          if let OperandKind::Input { sel } = s.kind {
            if sel < 0 || sel >= VIRTUAL_BASE {
              return Err(At { block: b, index, op }.bad("input register out of range"));
            }
            for comp in s.swizzle.iter().filter(|c| (**c as usize) < NUM_CHANNELS) {
              self.shader.vf.physical(sel, *comp, true);
            }
          }
        }
      }
    }
    let mut seen = vec![];
    for a in &program.arrays {
      if a.length == 0 || a.ncomponents == 0 || a.ncomponents as usize > NUM_CHANNELS {
        return Err(CompileError::InvalidArray { id: a.id });
      }
      if seen.contains(&a.id) {
        return Err(CompileError::InvalidArray { id: a.id });
      }
      seen.push(a.id);
      self.shader.vf.request_array(a.id, a.length, a.ncomponents);
    }
    self.shader.vf.allocate_arrays();
    Ok(())
  }
}

/// Turn a front end program into a shader of unbundled instructions.
pub fn lower(program: &SourceProgram, trans_slot: bool) -> Result<Shader, CompileError> {
  info!("lower: begin");
  let mut l = Lowerer {
    shader: Shader::new(ValueFactory::new()),
    trans_slot,
    classes: Map::default(),
    open: vec![],
    last_export: [None; 3],
  };
  l.declare(program)?;

  for (b, source) in program.blocks.iter().enumerate() {
    let block = l.shader.new_block();
    for (index, op) in source.ops.iter().enumerate() {
      l.lower_op(block, At { block: b, index, op })?;
    }
  }

  if let Some(c) = l.open.last() {
    let block = program.blocks.len().saturating_sub(1);
    let index = program.blocks.last().map_or(0, |b| b.ops.len());
    return Err(CompileError::UnbalancedControlFlow { block, index, op: c.name().to_string() });
  }

  for ix in l.last_export.iter().flatten() {
    if let InstrKind::Export(e) = &mut l.shader.instrs[*ix].kind {
      e.last = true;
    }
  }

  debug!("lower: {} blocks, {} instructions", l.shader.blocks.len(), l.shader.instrs.len());
  info!("lower: end");
  Ok(l.shader)
}

//=============================================================================
// LDS lowering

fn lds_pieces(vf: &mut ValueFactory, lds: &LdsInstr) -> Vec<InstrKind> {
  let srcs = lds.srcs.iter().map(|s| Src::new(*s));
  let mut access = AluInstr::without_dest(lds.op.alu_op(), 0, srcs);
  access.flags.lds_group_start = true;
  match lds.dest {
    Some(d) if lds.op.returns_value() => {
      let pop = vf.inline_constant(InlineConstant::LdsOqAPop);
      let mut fetch = AluInstr::new(AluOp::Mov, Some(d), vec![Src::new(pop)]);
      fetch.flags.lds_group_end = true;
      vec![InstrKind::Alu(access), InstrKind::Alu(fetch)]
    }
    _ => {
      access.flags.lds_group_end = true;
      vec![InstrKind::Alu(access)]
    }
  }
}

/// Replace every LDS instruction by the ALU ops that issue it and pop its
/// result off the output queue.
pub fn lower_lds(shader: &mut Shader) {
  let mut nlowered = 0;
  for b in 0..shader.blocks.len() {
    let items = shader.blocks[b].items.clone();
    let mut changed = false;
    for ix in items {
      if shader.instrs[ix].is_dead() {
        continue;
      }
      let lds = match &shader.instrs[ix].kind {
        InstrKind::Lds(l) => l.clone(),
        _ => continue,
      };
      let pieces = lds_pieces(&mut shader.vf, &lds);
      shader.replace_in_place(ix, pieces);
      changed = true;
      nlowered += 1;
    }
    if changed {
      shader.renumber_block(b);
    }
  }
  debug!("lower_lds: {} accesses lowered", nlowered);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::ValueKind;

  fn ssa(id: u32) -> SourceOperand {
    SourceOperand::new(OperandKind::Ssa(id))
  }

  fn to_ssa(id: u32, mask: u8) -> Option<SourceDest> {
    Some(SourceDest::new(DestKind::Ssa(id), mask))
  }

  fn program(ops: Vec<SourceOp>) -> SourceProgram {
    SourceProgram { arrays: vec![], blocks: vec![SourceBlock { ops }] }
  }

  fn alus(sh: &Shader) -> Vec<AluInstr> {
    sh.blocks[0].items.iter().filter_map(|ix| sh.instrs[*ix].kind.as_alu().cloned()).collect()
  }

  #[test]
  fn scalar_op_is_emitted_per_component() {
    let p = program(vec![SourceOp::new("add", to_ssa(3, 0b0111), vec![ssa(1), ssa(2)])]);
    let sh = lower(&p, true).unwrap();
    let a = alus(&sh);
    assert_eq!(a.len(), 3);
    for (c, alu) in a.iter().enumerate() {
      assert_eq!(alu.op, AluOp::Add);
      let d = sh.vf.value(alu.dest.unwrap());
      assert_eq!(d.chan, c as Chan);
      assert_eq!(d.pin, Pin::Chan);
      assert_eq!(sh.vf.value(alu.srcs[0].value).chan, c as Chan);
    }
  }

  #[test]
  fn unknown_opcode_and_bad_operand_counts_are_reported() {
    let p = program(vec![
      SourceOp::new("mov", to_ssa(1, 1), vec![ssa(0)]),
      SourceOp::new("frobnicate", to_ssa(2, 1), vec![ssa(1)]),
    ]);
    match lower(&p, true) {
      Err(CompileError::UnsupportedOpcode { block: 0, index: 1, name }) => {
        assert_eq!(name, "frobnicate")
      }
      other => panic!("unexpected {:?}", other.map(|_| ())),
    }

    let p = program(vec![SourceOp::new("add", to_ssa(1, 1), vec![ssa(0)])]);
    assert_eq!(
      lower(&p, true).map(|_| ()),
      Err(CompileError::MalformedOperands {
        block: 0,
        index: 0,
        name: "add".to_string(),
        expected: 2,
        found: 1
      })
    );

    // LDS ALU ops are internal.
    let p = program(vec![SourceOp::new("lds_write", None, vec![ssa(0), ssa(1)])]);
    assert!(lower(&p, true).is_ok());
    let p = program(vec![SourceOp::new("LDS_WRITE", None, vec![ssa(0), ssa(1)])]);
    assert!(lower(&p, true).is_err());
  }

  #[test]
  fn well_known_constants_become_inline() {
    let c = SourceOperand::new(OperandKind::Const { bits: [0x3f80_0000, 0x4000_0000, 0, 0] });
    let p = program(vec![SourceOp::new("mov", to_ssa(1, 0b11), vec![c])]);
    let sh = lower(&p, true).unwrap();
    let a = alus(&sh);
    assert_eq!(sh.vf.value(a[0].srcs[0].value).inline_constant(), Some(InlineConstant::One));
    assert_eq!(sh.vf.value(a[1].srcs[0].value).literal_bits(), Some(0x4000_0000));
  }

  #[test]
  fn transcendental_without_trans_unit_spans_vector_lanes() {
    let p = program(vec![SourceOp::new("recip_ieee", to_ssa(1, 0b1001), vec![ssa(0)])]);
    let sh = lower(&p, false).unwrap();
    let a = alus(&sh);
    assert_eq!(a.len(), 2);
    assert_eq!(a[0].slots, 3);
    assert_eq!(a[0].srcs.len(), 3);
    assert!(a[0].is_splittable());
    assert_eq!(a[1].slots, 4);
    assert_eq!(a[1].dest_chan(&sh.vf), 3);

    let sh = lower(&p, true).unwrap();
    assert!(alus(&sh).iter().all(|a| a.is_trans()));
  }

  #[test]
  fn dot_product_reads_one_component_per_lane() {
    let p = program(vec![SourceOp::new("dot4", to_ssa(2, 0b0010), vec![ssa(0), ssa(1)])]);
    let sh = lower(&p, true).unwrap();
    let a = alus(&sh);
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].slots, 4);
    for lane in 0..4 {
      assert_eq!(sh.vf.value(a[0].lane_srcs(lane)[1].value).chan, lane as Chan);
    }
    let p = program(vec![SourceOp::new("dot4", to_ssa(2, 0b0011), vec![ssa(0), ssa(1)])]);
    assert!(lower(&p, true).is_err());
  }

  #[test]
  fn control_flow_must_nest() {
    let cond = || vec![ssa(0)];
    let ok = program(vec![
      SourceOp::new("loop", None, vec![]),
      SourceOp::new("if", None, cond()),
      SourceOp::new("break", None, vec![]),
      SourceOp::new("else", None, vec![]),
      SourceOp::new("break_if", None, cond()),
      SourceOp::new("endif", None, vec![]),
      SourceOp::new("endloop", None, vec![]),
    ]);
    let sh = lower(&ok, true).unwrap();
    let a = alus(&sh);
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].op, AluOp::PredSetNe);
    assert_eq!(a[0].cf, Some(AluCf::Break));
    assert_eq!(a[0].flags.letters(), "EP");

    let stray = program(vec![SourceOp::new("endif", None, vec![])]);
    match lower(&stray, true) {
      Err(CompileError::UnbalancedControlFlow { index: 0, op, .. }) => assert_eq!(op, "endif"),
      other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    let open = program(vec![SourceOp::new("if", None, cond())]);
    match lower(&open, true) {
      Err(CompileError::UnbalancedControlFlow { op, .. }) => assert_eq!(op, "if"),
      other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    let outside = program(vec![SourceOp::new("continue", None, vec![])]);
    assert!(lower(&outside, true).is_err());
  }

  #[test]
  fn exports_gather_into_a_group_and_mark_the_last() {
    let p = program(vec![
      SourceOp::new("export_param", None, vec![ssa(0)]).with_imm(0),
      SourceOp::new("export_param", None, vec![ssa(1)]).with_imm(1),
      SourceOp::new("export_pos", None, vec![ssa(2)]),
    ]);
    let sh = lower(&p, true).unwrap();
    let exports: Vec<&ExportInstr> = sh.blocks[0]
      .items
      .iter()
      .filter_map(|ix| match &sh.instrs[*ix].kind {
        InstrKind::Export(e) => Some(e),
        _ => None,
      })
      .collect();
    assert_eq!(exports.len(), 3);
    assert!(!exports[0].last);
    assert!(exports[1].last);
    assert!(exports[2].last);
    assert_eq!(sh.vf.value(exports[0].value.regs[0]).pin, Pin::Group);
    assert_eq!(alus(&sh).len(), 12);
  }

  #[test]
  fn array_accesses_are_bounds_checked() {
    let mut p = program(vec![SourceOp::new(
      "mov",
      Some(SourceDest::new(DestKind::Array { id: 7, offset: 2, addr: None }, 1)),
      vec![ssa(0)],
    )]);
    p.arrays.push(SourceArray { id: 7, length: 4, ncomponents: 1 });
    let sh = lower(&p, true).unwrap();
    let d = sh.vf.value(alus(&sh)[0].dest.unwrap());
    assert!(match d.kind {
      ValueKind::ArrayElement { offset: 2, .. } => true,
      _ => false,
    });

    p.blocks[0].ops[0].dest = Some(SourceDest::new(DestKind::Array { id: 7, offset: 4, addr: None }, 1));
    match lower(&p, true) {
      Err(CompileError::BadOperand { reason, .. }) => {
        assert_eq!(reason, "array access out of bounds")
      }
      other => panic!("unexpected {:?}", other.map(|_| ())),
    }
  }

  #[test]
  fn lds_read_becomes_queue_access() {
    let p = program(vec![
      SourceOp::new("lds_read", to_ssa(1, 1), vec![ssa(0)]),
      SourceOp::new("add", to_ssa(2, 1), vec![ssa(1), ssa(1)]),
    ]);
    let mut sh = lower(&p, true).unwrap();
    lower_lds(&mut sh);
    let items = sh.blocks[0].items.clone();
    assert_eq!(items.len(), 3);
    let read = sh.instrs[items[0]].kind.as_alu().unwrap();
    assert_eq!(read.op, AluOp::LdsReadRet);
    assert_eq!(read.flags.letters(), "S");
    let pop = sh.instrs[items[1]].kind.as_alu().unwrap();
    assert_eq!(pop.op, AluOp::Mov);
    assert_eq!(pop.flags.letters(), "WT");
    assert_eq!(sh.vf.value(pop.srcs[0].value).inline_constant(), Some(InlineConstant::LdsOqAPop));
    assert!(sh.instrs[items[1]].required.contains(items[0]));
    assert_eq!(sh.instrs[items[1]].index, 1);
    // The consumer now depends on the queue pop.
    let v = pop.dest.unwrap();
    assert!(sh.vf.value(v).usedef().unwrap().parents.contains(items[1]));
  }
}
