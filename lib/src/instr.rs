/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The instruction graph.
//!
//! Instructions live in the instruction arena of a
//! [`Shader`](crate::shader::Shader) and are addressed by [`InstIx`].  Each
//! one carries, besides its payload, explicit ordering edges (`required`:
//! must be scheduled before us; `dependent`: the reverse) and the scheduling
//! state flags.  The payload is a closed sum type; code that needs to treat
//! every kind matches on [`InstrKind`].

use smallvec::SmallVec;
use std::fmt;

use crate::alu_group::{AluGroup, BankSwizzle};
use crate::data_structures::{InstIx, Set, ValueIx};
use crate::opcodes::{AluOp, LdsOp};
use crate::value::{chan_letter, Chan, CHAN_MASKED, NUM_CHANNELS};
use crate::value_factory::ValueFactory;

//=============================================================================
// ALU instructions

/// A source operand with its input modifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Src {
  pub value: ValueIx,
  pub neg: bool,
  pub abs: bool,
}

impl Src {
  pub fn new(value: ValueIx) -> Self {
    Self { value, neg: false, abs: false }
  }
}

impl From<ValueIx> for Src {
  fn from(value: ValueIx) -> Self {
    Src::new(value)
  }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AluFlags {
  /// The destination is written.
  pub write: bool,
  /// Last instruction of its group.
  pub last: bool,
  pub clamp: bool,
  pub update_exec: bool,
  pub update_pred: bool,
  pub lds_group_start: bool,
  pub lds_group_end: bool,
}

impl AluFlags {
  pub fn write() -> Self {
    Self { write: true, ..Self::default() }
  }

  pub fn letters(&self) -> String {
    let mut s = String::new();
    for (set, c) in [
      (self.write, 'W'),
      (self.last, 'L'),
      (self.clamp, 'C'),
      (self.update_exec, 'E'),
      (self.update_pred, 'P'),
      (self.lds_group_start, 'S'),
      (self.lds_group_end, 'T'),
    ]
    .iter()
    {
      if *set {
        s.push(*c);
      }
    }
    s
  }

  pub fn from_letters(s: &str) -> Option<AluFlags> {
    let mut f = AluFlags::default();
    for c in s.chars() {
      let flag = match c {
        'W' => &mut f.write,
        'L' => &mut f.last,
        'C' => &mut f.clamp,
        'E' => &mut f.update_exec,
        'P' => &mut f.update_pred,
        'S' => &mut f.lds_group_start,
        'T' => &mut f.lds_group_end,
        _ => return None,
      };
      *flag = true;
    }
    Some(f)
  }
}

/// Control flow folded into an ALU instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AluCf {
  /// Leave the innermost loop when the predicate holds.
  Break,
  /// Skip to the next iteration of the innermost loop.
  Continue,
}

impl AluCf {
  pub fn name(self) -> &'static str {
    match self {
      AluCf::Break => "BREAK",
      AluCf::Continue => "CONTINUE",
    }
  }

  pub fn from_name(s: &str) -> Option<AluCf> {
    match s {
      "BREAK" => Some(AluCf::Break),
      "CONTINUE" => Some(AluCf::Continue),
      _ => None,
    }
  }
}

#[derive(Clone, Debug)]
pub struct AluInstr {
  pub op: AluOp,
  pub dest: Option<ValueIx>,
  /// Lane of an instruction without destination.
  pub lane: Chan,
  /// `nsrc` operands per lane, lane after lane.
  pub srcs: SmallVec<[Src; 4]>,
  pub flags: AluFlags,
  pub bank_swizzle: Option<BankSwizzle>,
  pub cf: Option<AluCf>,
  /// Number of lanes issued together.
  pub slots: u8,
}

impl AluInstr {
  pub fn new<I: IntoIterator<Item = Src>>(op: AluOp, dest: Option<ValueIx>, srcs: I) -> Self {
    let flags = if dest.is_some() { AluFlags::write() } else { AluFlags::default() };
    Self {
      op,
      dest,
      lane: 0,
      srcs: srcs.into_iter().collect(),
      flags,
      bank_swizzle: None,
      cf: None,
      slots: op.info().slots,
    }
  }

  /// Multi-lane instruction; `srcs` holds the operands of every lane.
  pub fn multislot<I: IntoIterator<Item = Src>>(
    op: AluOp, dest: Option<ValueIx>, srcs: I, slots: u8,
  ) -> Self {
    let mut i = Self::new(op, dest, srcs);
    i.slots = slots;
    i
  }

  pub fn without_dest<I: IntoIterator<Item = Src>>(op: AluOp, lane: Chan, srcs: I) -> Self {
    let mut i = Self::new(op, None, srcs);
    i.lane = lane;
    i
  }

  /// Operands per lane.
  pub fn nsrc(&self) -> usize {
    if self.slots == 0 {
      0
    } else {
      self.srcs.len() / self.slots as usize
    }
  }

  pub fn lane_srcs(&self, lane: usize) -> &[Src] {
    let n = self.nsrc();
    &self.srcs[lane * n..(lane + 1) * n]
  }

  pub fn dest_chan(&self, vf: &ValueFactory) -> Chan {
    match self.dest {
      Some(d) => vf.value(d).chan,
      None => self.lane,
    }
  }

  /// Transcendental op issued on the trans unit.
  pub fn is_trans(&self) -> bool {
    self.op.info().transcendental && self.slots == 1
  }

  /// Transcendental op spread over several vector lanes.  Unlike dot
  /// products the lanes are independent, so it may be split.
  pub fn is_splittable(&self) -> bool {
    self.op.info().transcendental && self.slots > 1
  }

  /// Reads or writes the local data share, including pops of its queue.
  pub fn has_lds_access(&self, vf: &ValueFactory) -> bool {
    self.op.info().lds
      || self
        .srcs
        .iter()
        .any(|s| vf.value(s.value).inline_constant().map_or(false, |k| k.is_lds_queue()))
  }

  /// The one address register the instruction uses for indirect access.
  pub fn indirect_addr(&self, vf: &ValueFactory) -> Option<ValueIx> {
    self
      .dest
      .iter()
      .chain(self.srcs.iter().map(|s| &s.value))
      .filter_map(|v| vf.value(*v).addr())
      .next()
  }

  /// Values read, including address registers of indirect operands.
  pub fn reads(&self, vf: &ValueFactory) -> Vec<ValueIx> {
    let mut res = vec![];
    for s in self.srcs.iter() {
      res.push(s.value);
      if let Some(a) = vf.value(s.value).addr() {
        res.push(a);
      }
    }
    if let Some(d) = self.dest {
      if let Some(a) = vf.value(d).addr() {
        res.push(a);
      }
    }
    res
  }

  pub fn writes(&self) -> Option<ValueIx> {
    if self.flags.write {
      self.dest
    } else {
      None
    }
  }

  /// May the instruction be removed once its result is unused?
  pub fn can_be_deleted(&self, vf: &ValueFactory) -> bool {
    let info = self.op.info();
    if info.side_effect || info.lds || self.cf.is_some() || self.flags.update_exec {
      return false;
    }
    if info.interp && self.flags.clamp {
      return false;
    }
    if self.is_splittable() {
      return false;
    }
    if self.has_lds_access(vf) {
      return false;
    }
    match self.dest {
      None => false,
      Some(d) => {
        let value = vf.value(d);
        value.is_register() && value.is_virtual() && !value.has_uses()
      }
    }
  }

  /// Swap every source operand `old` for `new`.  Returns whether anything
  /// changed.
  pub fn replace_source(&mut self, old: ValueIx, new: ValueIx) -> bool {
    let mut changed = false;
    for s in self.srcs.iter_mut() {
      if s.value == old {
        s.value = new;
        changed = true;
      }
    }
    changed
  }

  pub fn replace_dest(&mut self, new: ValueIx) {
    self.dest = Some(new);
  }

  /// One single-lane instruction per lane.  The lane that carries the real
  /// destination keeps it, the others write into dummies.  Register sources
  /// are pinned to their channel, so that the read port check done for the
  /// pieces stays valid however they end up being placed.
  pub fn split(&self, vf: &mut ValueFactory) -> Vec<AluInstr> {
    let mut res = vec![];
    if self.slots <= 1 {
      return res;
    }
    let dest_chan = self.dest_chan(vf);
    for lane in 0..self.slots as usize {
      let lane_chan = lane as Chan;
      let dest = match self.dest {
        Some(d) if lane_chan == dest_chan => d,
        _ => vf.dummy_dest(lane_chan),
      };
      let srcs: SmallVec<[Src; 4]> = self.lane_srcs(lane).iter().cloned().collect();
      for s in srcs.iter() {
        let v = vf.value_mut(s.value);
        if v.is_register() && v.pin.channel_is_free() {
          v.pin = crate::value::Pin::Chan;
        }
      }
      let mut piece = AluInstr::new(self.op, Some(dest), srcs);
      piece.flags = AluFlags {
        write: self.flags.write && self.dest.is_some() && lane_chan == dest_chan,
        last: self.flags.last && lane + 1 == self.slots as usize,
        ..self.flags
      };
      piece.lane = lane_chan;
      res.push(piece);
    }
    res
  }

  pub fn show(&self, vf: &ValueFactory) -> String {
    let dest = match self.dest {
      Some(d) => vf.show(d),
      None => format!("__.{}", chan_letter(self.lane)),
    };
    let srcs: Vec<String> = self.srcs.iter().map(|s| show_src(vf, s)).collect();
    let mut s = format!("ALU {} {} : {} {{{}}}", self.op.name(), dest, srcs.join(" "), self.flags.letters());
    if let Some(bs) = self.bank_swizzle {
      s.push(' ');
      s.push_str(bs.name());
    }
    if let Some(cf) = self.cf {
      s.push(' ');
      s.push_str(cf.name());
    }
    s
  }
}

pub fn show_src(vf: &ValueFactory, s: &Src) -> String {
  let mut v = vf.show(s.value);
  if s.abs {
    v = format!("|{}|", v);
  }
  if s.neg {
    v = format!("-{}", v);
  }
  v
}

//=============================================================================
// Non-ALU instructions

/// Local data share access, before it is split into queue-addressing ALU ops.
#[derive(Clone, Debug)]
pub struct LdsInstr {
  pub op: LdsOp,
  pub dest: Option<ValueIx>,
  pub srcs: SmallVec<[ValueIx; 3]>,
}

impl LdsInstr {
  pub fn show(&self, vf: &ValueFactory) -> String {
    let dest = match self.dest {
      Some(d) => vf.show(d),
      None => "__".to_string(),
    };
    let srcs: Vec<String> = self.srcs.iter().map(|s| vf.show(*s)).collect();
    format!("LDS {} {} : {}", self.op.name(), dest, srcs.join(" "))
  }
}

/// Four registers sharing one select, with a per-lane component swizzle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VecReg {
  /// The register of each channel.
  pub regs: [ValueIx; NUM_CHANNELS],
  /// Component routed through each lane; `CHAN_MASKED` for unused lanes.
  pub swizzle: [Chan; NUM_CHANNELS],
}

impl VecReg {
  pub fn new(regs: [ValueIx; NUM_CHANNELS]) -> Self {
    Self { regs, swizzle: [0, 1, 2, 3] }
  }

  /// Registers actually touched through the swizzle.
  pub fn used(&self) -> Vec<ValueIx> {
    let mut res: Vec<ValueIx> = vec![];
    for s in self.swizzle.iter() {
      if (*s as usize) < NUM_CHANNELS {
        let r = self.regs[*s as usize];
        if !res.contains(&r) {
          res.push(r);
        }
      }
    }
    res
  }

  /// Registers written when used as a destination: lane `i` lands in
  /// channel `i` unless masked.
  pub fn written(&self) -> Vec<ValueIx> {
    (0..NUM_CHANNELS).filter(|i| self.swizzle[*i] != CHAN_MASKED).map(|i| self.regs[i]).collect()
  }

  pub fn show(&self, vf: &ValueFactory) -> String {
    let r = vf.value(self.regs[0]);
    let prefix = if !r.is_virtual() {
      'R'
    } else if r.is_ssa() {
      'S'
    } else {
      'V'
    };
    let swz: String = self.swizzle.iter().map(|c| chan_letter(*c)).collect();
    format!("{}{}.{}{}", prefix, r.sel, swz, r.pin.suffix())
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FetchOp {
  Vtx,
  Sample,
}

impl FetchOp {
  pub fn name(self) -> &'static str {
    match self {
      FetchOp::Vtx => "VTX",
      FetchOp::Sample => "SAMPLE",
    }
  }
}

#[derive(Clone, Debug)]
pub struct FetchInstr {
  pub op: FetchOp,
  pub dest: VecReg,
  pub src: VecReg,
  pub resource_id: u32,
}

impl FetchInstr {
  pub fn show(&self, vf: &ValueFactory) -> String {
    format!(
      "FETCH {} {} : {} {{RID:{}}}",
      self.op.name(),
      self.dest.show(vf),
      self.src.show(vf),
      self.resource_id
    )
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExportKind {
  Pixel,
  Pos,
  Param,
}

impl ExportKind {
  pub fn name(self) -> &'static str {
    match self {
      ExportKind::Pixel => "PIXEL",
      ExportKind::Pos => "POS",
      ExportKind::Param => "PARAM",
    }
  }
}

#[derive(Clone, Debug)]
pub struct ExportInstr {
  pub kind: ExportKind,
  pub location: u32,
  pub value: VecReg,
  pub last: bool,
}

impl ExportInstr {
  pub fn show(&self, vf: &ValueFactory) -> String {
    let mut s = format!("EXPORT {}{} : {}", self.kind.name(), self.location, self.value.show(vf));
    if self.last {
      s.push_str(" {LAST}");
    }
    s
  }
}

/// Structured control flow markers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CfInstr {
  If(ValueIx),
  Else,
  EndIf,
  LoopBegin,
  LoopEnd,
  Break,
  Continue,
  Switch(ValueIx),
  Case(u32),
  Default,
  EndSwitch,
}

impl CfInstr {
  pub fn show(&self, vf: &ValueFactory) -> String {
    match self {
      CfInstr::If(v) => format!("IF {}", vf.show(*v)),
      CfInstr::Else => "ELSE".to_string(),
      CfInstr::EndIf => "ENDIF".to_string(),
      CfInstr::LoopBegin => "LOOP_BEGIN".to_string(),
      CfInstr::LoopEnd => "LOOP_END".to_string(),
      CfInstr::Break => "BREAK".to_string(),
      CfInstr::Continue => "CONTINUE".to_string(),
      CfInstr::Switch(v) => format!("SWITCH {}", vf.show(*v)),
      CfInstr::Case(n) => format!("CASE {}", n),
      CfInstr::Default => "DEFAULT".to_string(),
      CfInstr::EndSwitch => "ENDSWITCH".to_string(),
    }
  }
}

//=============================================================================
// Instructions

#[derive(Clone, Debug)]
pub enum InstrKind {
  Alu(AluInstr),
  Lds(LdsInstr),
  Fetch(FetchInstr),
  Export(ExportInstr),
  ControlFlow(CfInstr),
  /// A closed VLIW bundle; its members stay in the arena.
  Group(AluGroup),
}

impl InstrKind {
  pub fn is_alu(&self) -> bool {
    match self {
      InstrKind::Alu(_) => true,
      _ => false,
    }
  }

  pub fn as_alu(&self) -> Option<&AluInstr> {
    match self {
      InstrKind::Alu(a) => Some(a),
      _ => None,
    }
  }

  pub fn as_alu_mut(&mut self) -> Option<&mut AluInstr> {
    match self {
      InstrKind::Alu(a) => Some(a),
      _ => None,
    }
  }

  pub fn as_group(&self) -> Option<&AluGroup> {
    match self {
      InstrKind::Group(g) => Some(g),
      _ => None,
    }
  }

  /// Values read by this instruction.  Empty for groups: use/def is
  /// tracked on their members.
  pub fn reads(&self, vf: &ValueFactory) -> Vec<ValueIx> {
    match self {
      InstrKind::Alu(a) => a.reads(vf),
      InstrKind::Lds(l) => {
        let mut res = vec![];
        for s in l.srcs.iter() {
          res.push(*s);
          res.extend(vf.value(*s).addr());
        }
        if let Some(d) = l.dest {
          res.extend(vf.value(d).addr());
        }
        res
      }
      InstrKind::Fetch(f) => f.src.used(),
      InstrKind::Export(e) => e.value.used(),
      InstrKind::ControlFlow(CfInstr::If(v)) | InstrKind::ControlFlow(CfInstr::Switch(v)) => {
        vec![*v]
      }
      InstrKind::ControlFlow(_) | InstrKind::Group(_) => vec![],
    }
  }

  /// Values written by this instruction.
  pub fn writes(&self) -> Vec<ValueIx> {
    match self {
      InstrKind::Alu(a) => a.writes().into_iter().collect(),
      InstrKind::Lds(l) => l.dest.into_iter().collect(),
      InstrKind::Fetch(f) => f.dest.written(),
      InstrKind::Export(_) | InstrKind::ControlFlow(_) | InstrKind::Group(_) => vec![],
    }
  }
}

#[derive(Clone)]
pub struct Instr {
  pub kind: InstrKind,
  /// Instructions that must be scheduled before this one.
  pub required: Set<InstIx>,
  /// Instructions that require this one.
  pub dependent: Set<InstIx>,
  pub dead: bool,
  pub scheduled: bool,
  /// Never removed by dead code elimination.
  pub always_keep: bool,
  pub block_id: i32,
  pub index: i32,
}

impl Instr {
  pub fn new(kind: InstrKind, block_id: i32, index: i32) -> Self {
    Self {
      kind,
      required: Set::empty(),
      dependent: Set::empty(),
      dead: false,
      scheduled: false,
      always_keep: false,
      block_id,
      index,
    }
  }

  pub fn is_dead(&self) -> bool {
    self.dead
  }

  pub fn is_scheduled(&self) -> bool {
    self.scheduled
  }
}

impl fmt::Debug for Instr {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}@{}:{}", self.kind, self.block_id, self.index)?;
    if self.dead {
      write!(fmt, " dead")?;
    }
    if self.scheduled {
      write!(fmt, " scheduled")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::Pin;
  use crate::value_factory::SourceKey;

  #[test]
  fn flags_letters_round_trip() {
    let f = AluFlags { write: true, last: true, update_exec: true, ..AluFlags::default() };
    assert_eq!(f.letters(), "WLE");
    assert_eq!(AluFlags::from_letters("WLE"), Some(f));
    assert_eq!(AluFlags::from_letters(""), Some(AluFlags::default()));
    assert_eq!(AluFlags::from_letters("WX"), None);
  }

  #[test]
  fn alu_prints_in_text_form() {
    let mut vf = ValueFactory::new();
    let d = vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let a = vf.dest_for(SourceKey::Ssa(1), 0, Pin::None);
    let one = vf.literal(0x3f80_0000);
    let mut neg = Src::new(a);
    neg.neg = true;
    neg.abs = true;
    let i = AluInstr::new(AluOp::Add, Some(d), vec![neg, Src::new(one)]);
    assert_eq!(i.show(&vf), "ALU ADD S1024.x : -|S1025.x| L[0x3f800000] {W}");
    let k = AluInstr::without_dest(AluOp::KillGt, 2, vec![Src::new(a), Src::new(one)]);
    assert_eq!(k.show(&vf), "ALU KILLGT __.z : S1025.x L[0x3f800000] {}");
  }

  #[test]
  fn unused_results_can_be_deleted() {
    let mut vf = ValueFactory::new();
    let d = vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let a = vf.dest_for(SourceKey::Ssa(1), 0, Pin::None);
    let mov = AluInstr::new(AluOp::Mov, Some(d), vec![Src::new(a)]);
    assert!(mov.can_be_deleted(&vf));

    let mut interp = AluInstr::new(AluOp::InterpXY, Some(d), vec![Src::new(a); 8]);
    interp.flags.clamp = true;
    assert!(!interp.can_be_deleted(&vf));

    let recip = AluInstr::multislot(AluOp::RecipIeee, Some(d), vec![Src::new(a); 3], 3);
    assert!(!recip.can_be_deleted(&vf));

    let out = vf.physical(0, 0, false);
    let to_hw = AluInstr::new(AluOp::Mov, Some(out), vec![Src::new(a)]);
    assert!(!to_hw.can_be_deleted(&vf));
  }

  #[test]
  fn split_keeps_dest_on_its_lane() {
    let mut vf = ValueFactory::new();
    let d = vf.dest_for(SourceKey::Ssa(0), 1, Pin::None);
    let a = vf.dest_for(SourceKey::Ssa(1), 0, Pin::None);
    let mut recip = AluInstr::multislot(AluOp::RecipIeee, Some(d), vec![Src::new(a); 3], 3);
    recip.flags.last = true;
    let pieces = recip.split(&mut vf);
    assert_eq!(pieces.len(), 3);
    assert_eq!(pieces[1].dest, Some(d));
    assert!(pieces[1].flags.write);
    assert!(!pieces[0].flags.write && !pieces[2].flags.write);
    assert!(pieces[2].flags.last && !pieces[0].flags.last);
    assert_eq!(vf.value(pieces[0].dest.unwrap()).chan, 0);
    assert_eq!(vf.value(a).pin, Pin::Chan);
  }

  #[test]
  fn replace_source_hits_every_occurrence() {
    let mut vf = ValueFactory::new();
    let d = vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let a = vf.dest_for(SourceKey::Ssa(1), 0, Pin::None);
    let b = vf.dest_for(SourceKey::Ssa(2), 0, Pin::None);
    let mut mul = AluInstr::new(AluOp::Mul, Some(d), vec![Src::new(a), Src::new(a)]);
    assert!(mul.replace_source(a, b));
    assert!(mul.srcs.iter().all(|s| s.value == b));
    assert!(!mul.replace_source(a, b));
  }
}
