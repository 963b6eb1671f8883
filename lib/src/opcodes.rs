/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Opcode metadata.  The tables are immutable statics; name lookups that
//! want caching keep their own per-session memo.

/// Which execution units may issue an op.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AluUnits {
  /// One of the four vector slots; the dest channel selects the slot.
  Vector,
  /// Only the trans slot.
  Trans,
  /// Either.
  Any,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AluOp {
  Mov,
  Add,
  Mul,
  MulIeee,
  MulAdd,
  MulAddIeee,
  Max,
  Min,
  SetE,
  SetGt,
  SetGe,
  SetNe,
  Fract,
  Floor,
  CndE,
  CndGt,
  CndGe,
  AddInt,
  SubInt,
  AndInt,
  OrInt,
  XorInt,
  NotInt,
  LshlInt,
  LshrInt,
  AshrInt,
  MulloInt,
  IntToFlt,
  FltToInt,
  RecipIeee,
  RecipsqrtIeee,
  SqrtIeee,
  Sin,
  Cos,
  ExpIeee,
  LogIeee,
  Dot4,
  Dot4Ieee,
  Cube,
  InterpXY,
  InterpZW,
  PredSetE,
  PredSetNe,
  KillGt,
  KillNe,
  LdsReadRet,
  LdsWrite,
  LdsAddRet,
  LdsXchgRet,
}

#[derive(Copy, Clone, Debug)]
pub struct AluOpInfo {
  pub op: AluOp,
  pub name: &'static str,
  /// Sources per lane.
  pub nsrc: u8,
  pub units: AluUnits,
  /// Lanes the op occupies when issued as a unit.
  pub slots: u8,
  /// Transcendental: runs on the trans unit, or on three vector lanes when
  /// there is no trans slot.
  pub transcendental: bool,
  pub interp: bool,
  /// Has a side effect besides the destination write.
  pub side_effect: bool,
  /// Goes through the local data share queue.
  pub lds: bool,
  /// Writes no register.
  pub no_dest: bool,
}

const fn op(op: AluOp, name: &'static str, nsrc: u8, units: AluUnits) -> AluOpInfo {
  AluOpInfo {
    op,
    name,
    nsrc,
    units,
    slots: 1,
    transcendental: false,
    interp: false,
    side_effect: false,
    lds: false,
    no_dest: false,
  }
}

const fn trans(o: AluOp, name: &'static str, nsrc: u8) -> AluOpInfo {
  let mut info = op(o, name, nsrc, AluUnits::Trans);
  info.transcendental = true;
  info
}

const fn vec4(o: AluOp, name: &'static str, interp: bool) -> AluOpInfo {
  let mut info = op(o, name, 2, AluUnits::Vector);
  info.slots = 4;
  info.interp = interp;
  info
}

const fn effect(o: AluOp, name: &'static str, nsrc: u8, no_dest: bool) -> AluOpInfo {
  let mut info = op(o, name, nsrc, AluUnits::Vector);
  info.side_effect = true;
  info.no_dest = no_dest;
  info
}

const fn lds(o: AluOp, name: &'static str, nsrc: u8, no_dest: bool) -> AluOpInfo {
  let mut info = effect(o, name, nsrc, no_dest);
  info.lds = true;
  info
}

use AluUnits::{Any, Vector};

/// Indexed by `AluOp as usize`.
static ALU_OPS: [AluOpInfo; 49] = [
  op(AluOp::Mov, "MOV", 1, Any),
  op(AluOp::Add, "ADD", 2, Any),
  op(AluOp::Mul, "MUL", 2, Any),
  op(AluOp::MulIeee, "MUL_IEEE", 2, Any),
  op(AluOp::MulAdd, "MULADD", 3, Any),
  op(AluOp::MulAddIeee, "MULADD_IEEE", 3, Any),
  op(AluOp::Max, "MAX", 2, Any),
  op(AluOp::Min, "MIN", 2, Any),
  op(AluOp::SetE, "SETE", 2, Any),
  op(AluOp::SetGt, "SETGT", 2, Any),
  op(AluOp::SetGe, "SETGE", 2, Any),
  op(AluOp::SetNe, "SETNE", 2, Any),
  op(AluOp::Fract, "FRACT", 1, Any),
  op(AluOp::Floor, "FLOOR", 1, Any),
  op(AluOp::CndE, "CNDE", 3, Any),
  op(AluOp::CndGt, "CNDGT", 3, Any),
  op(AluOp::CndGe, "CNDGE", 3, Any),
  op(AluOp::AddInt, "ADD_INT", 2, Any),
  op(AluOp::SubInt, "SUB_INT", 2, Any),
  op(AluOp::AndInt, "AND_INT", 2, Any),
  op(AluOp::OrInt, "OR_INT", 2, Any),
  op(AluOp::XorInt, "XOR_INT", 2, Any),
  op(AluOp::NotInt, "NOT_INT", 1, Any),
  op(AluOp::LshlInt, "LSHL_INT", 2, Any),
  op(AluOp::LshrInt, "LSHR_INT", 2, Any),
  op(AluOp::AshrInt, "ASHR_INT", 2, Any),
  trans(AluOp::MulloInt, "MULLO_INT", 2),
  trans(AluOp::IntToFlt, "INT_TO_FLT", 1),
  op(AluOp::FltToInt, "FLT_TO_INT", 1, Vector),
  trans(AluOp::RecipIeee, "RECIP_IEEE", 1),
  trans(AluOp::RecipsqrtIeee, "RECIPSQRT_IEEE", 1),
  trans(AluOp::SqrtIeee, "SQRT_IEEE", 1),
  trans(AluOp::Sin, "SIN", 1),
  trans(AluOp::Cos, "COS", 1),
  trans(AluOp::ExpIeee, "EXP_IEEE", 1),
  trans(AluOp::LogIeee, "LOG_IEEE", 1),
  vec4(AluOp::Dot4, "DOT4", false),
  vec4(AluOp::Dot4Ieee, "DOT4_IEEE", false),
  vec4(AluOp::Cube, "CUBE", false),
  vec4(AluOp::InterpXY, "INTERP_XY", true),
  vec4(AluOp::InterpZW, "INTERP_ZW", true),
  effect(AluOp::PredSetE, "PRED_SETE", 2, false),
  effect(AluOp::PredSetNe, "PRED_SETNE", 2, false),
  effect(AluOp::KillGt, "KILLGT", 2, true),
  effect(AluOp::KillNe, "KILLNE", 2, true),
  lds(AluOp::LdsReadRet, "LDS_READ_RET", 1, true),
  lds(AluOp::LdsWrite, "LDS_WRITE", 2, true),
  lds(AluOp::LdsAddRet, "LDS_ADD_RET", 2, true),
  lds(AluOp::LdsXchgRet, "LDS_XCHG_RET", 2, true),
];

impl AluOp {
  pub fn info(self) -> &'static AluOpInfo {
    &ALU_OPS[self as usize]
  }

  pub fn name(self) -> &'static str {
    self.info().name
  }

  /// Linear scan over the table; callers on a hot path memoize.
  pub fn from_name(name: &str) -> Option<AluOp> {
    ALU_OPS.iter().find(|i| i.name.eq_ignore_ascii_case(name)).map(|i| i.op)
  }

  pub fn can_use_trans(self) -> bool {
    self.info().units != AluUnits::Vector
  }

  pub fn can_use_vector(self) -> bool {
    self.info().units != AluUnits::Trans
  }
}

/// LDS operations before they are split into queue-addressing ALU ops.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LdsOp {
  Read,
  Write,
  AddRet,
  XchgRet,
}

static LDS_OPS: [(LdsOp, &str, AluOp); 4] = [
  (LdsOp::Read, "READ", AluOp::LdsReadRet),
  (LdsOp::Write, "WRITE", AluOp::LdsWrite),
  (LdsOp::AddRet, "ADD_RET", AluOp::LdsAddRet),
  (LdsOp::XchgRet, "XCHG_RET", AluOp::LdsXchgRet),
];

impl LdsOp {
  pub fn name(self) -> &'static str {
    LDS_OPS.iter().find(|(o, _, _)| *o == self).map(|(_, n, _)| *n).unwrap_or("?")
  }

  pub fn from_name(name: &str) -> Option<LdsOp> {
    LDS_OPS.iter().find(|(_, n, _)| n.eq_ignore_ascii_case(name)).map(|(o, _, _)| *o)
  }

  pub fn alu_op(self) -> AluOp {
    LDS_OPS.iter().find(|(o, _, _)| *o == self).map(|(_, _, a)| *a).unwrap_or(AluOp::LdsReadRet)
  }

  /// Does the op push a result onto the output queue?
  pub fn returns_value(self) -> bool {
    self != LdsOp::Write
  }
}
