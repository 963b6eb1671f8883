/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A shader under compilation: the value factory, the instruction arena and
//! the blocks listing instructions in program order.
//!
//! All use/def bookkeeping happens here.  Emitting an instruction registers
//! it as a use of every value it reads and as a parent of every value it
//! writes; indirect array accesses are registered with every element of the
//! addressed channel, since any of them may be the one touched.  Ordering
//! that is not visible through values (array write-after-read and
//! write-after-write, the LDS queue) becomes explicit `required` edges.

use log::{debug, info, trace};
use std::fmt::Write;

use crate::alu_group::{AluGroup, KCacheLine, TRANS_SLOT};
use crate::data_structures::{ArrayIx, InstIx, Map, TypedIxVec, ValueIx};
use crate::instr::{AluInstr, CfInstr, Instr, InstrKind, VecReg};
use crate::value::{chan_letter, value_ready, Chan, ValueKind, NUM_CHANNELS};
use crate::value_factory::ValueFactory;

pub struct Block {
  pub id: i32,
  pub items: Vec<InstIx>,
  /// Kcache lines locked by each ALU clause of the block, in clause order.
  /// Filled in by the bundler.
  pub kcache: Vec<Vec<KCacheLine>>,
}

pub struct Shader {
  pub vf: ValueFactory,
  pub instrs: TypedIxVec<InstIx, Instr>,
  pub blocks: Vec<Block>,

  last_lds_access: Option<InstIx>,
  array_readers: Map<(ArrayIx, Chan), Vec<InstIx>>,
  array_writers: Map<(ArrayIx, Chan), Vec<InstIx>>,
}

impl Shader {
  pub fn new(vf: ValueFactory) -> Self {
    Self {
      vf,
      instrs: TypedIxVec::new(),
      blocks: vec![],
      last_lds_access: None,
      array_readers: Map::default(),
      array_writers: Map::default(),
    }
  }

  pub fn new_block(&mut self) -> usize {
    let id = self.blocks.len() as i32;
    self.blocks.push(Block { id, items: vec![], kcache: vec![] });
    self.blocks.len() - 1
  }

  /// Every live ALU instruction, grouped or not, in program order.
  pub fn alu_instrs(&self) -> Vec<InstIx> {
    let mut res = vec![];
    for b in &self.blocks {
      for ix in &b.items {
        match &self.instrs[*ix].kind {
          InstrKind::Alu(_) => res.push(*ix),
          InstrKind::Group(g) => res.extend(g.members()),
          _ => {}
        }
      }
    }
    res.retain(|ix| !self.instrs[*ix].is_dead());
    res
  }

  //===========================================================================
  // Emission and use/def bookkeeping

  /// Append an instruction to block `block` and register its operands.
  pub fn emit(&mut self, block: usize, kind: InstrKind) -> InstIx {
    let b = &self.blocks[block];
    let index = b.items.len() as i32;
    let ix = self.instrs.push(Instr::new(kind, b.id, index));
    self.blocks[block].items.push(ix);
    self.register_usedef(ix);
    self.add_ordering(ix);
    trace!("emit {:?}: {}", ix, self.show_instr(ix));
    ix
  }

  /// Append a ready-made group.  Members go to the slot their bank swizzle
  /// or destination channel names; `None` if two members collide.
  pub fn emit_group(
    &mut self, block: usize, members: Vec<AluInstr>, has_trans_slot: bool,
  ) -> Option<InstIx> {
    let b = &self.blocks[block];
    let index = b.items.len() as i32;
    let block_id = b.id;
    let mut group = AluGroup::new(has_trans_slot, 0);
    let mut ids = vec![];
    for alu in members {
      let mut lanes: Vec<usize> = if alu.bank_swizzle.map_or(false, |s| s.is_trans()) {
        vec![TRANS_SLOT]
      } else if alu.slots > 1 {
        (0..alu.slots as usize).collect()
      } else {
        vec![alu.dest_chan(&self.vf) as usize]
      };
      lanes.retain(|l| *l <= TRANS_SLOT);
      if lanes.is_empty() || lanes.iter().any(|l| group.slots[*l].is_some()) {
        return None;
      }
      let ix = self.instrs.push(Instr::new(InstrKind::Alu(alu), block_id, index));
      for l in lanes {
        group.slots[l] = Some(ix);
      }
      ids.push(ix);
    }
    for ix in ids {
      self.register_usedef(ix);
      self.add_ordering(ix);
    }
    let gix = self.instrs.push(Instr::new(InstrKind::Group(group), block_id, index));
    self.blocks[block].items.push(gix);
    Some(gix)
  }

  /// Put a group built by the bundler into the arena.  The caller places it
  /// in the block.
  pub fn push_group(&mut self, block: usize, group: AluGroup) -> InstIx {
    let index = group.members().first().map_or(0, |m| self.instrs[*m].index);
    let block_id = self.blocks[block].id;
    self.instrs.push(Instr::new(InstrKind::Group(group), block_id, index))
  }

  /// Program index = position in the block; group members share theirs.
  pub fn renumber_block(&mut self, block: usize) {
    let items = self.blocks[block].items.clone();
    for (i, ix) in items.iter().enumerate() {
      self.instrs[*ix].index = i as i32;
      let members = self.instrs[*ix].kind.as_group().map(|g| g.members()).unwrap_or_default();
      for m in members {
        self.instrs[m].index = i as i32;
      }
    }
  }

  /// The direct elements an access to array element `v` may touch.
  fn fan_out(&self, v: ValueIx) -> Vec<ValueIx> {
    let value = self.vf.value(v);
    match value.kind {
      ValueKind::ArrayElement { array, addr: Some(_), .. } => {
        let arr = self.vf.array(array);
        if arr.covers_chan(value.chan) {
          arr.elements_in_chan(value.chan).to_vec()
        } else {
          vec![]
        }
      }
      _ => vec![],
    }
  }

  fn register_usedef(&mut self, ix: InstIx) {
    let (reads, writes) = {
      let kind = &self.instrs[ix].kind;
      (kind.reads(&self.vf), kind.writes())
    };
    for v in reads {
      for e in std::iter::once(v).chain(self.fan_out(v)) {
        if let Some(ud) = self.vf.value_mut(e).usedef_mut() {
          ud.uses.insert(ix);
        }
      }
    }
    for v in writes {
      for e in std::iter::once(v).chain(self.fan_out(v)) {
        if let Some(ud) = self.vf.value_mut(e).usedef_mut() {
          ud.parents.insert(ix);
        }
      }
    }
  }

  fn unregister_usedef(&mut self, ix: InstIx) {
    let (reads, writes) = {
      let kind = &self.instrs[ix].kind;
      (kind.reads(&self.vf), kind.writes())
    };
    for v in reads {
      for e in std::iter::once(v).chain(self.fan_out(v)) {
        if let Some(ud) = self.vf.value_mut(e).usedef_mut() {
          ud.uses.delete(ix);
        }
      }
    }
    for v in writes {
      for e in std::iter::once(v).chain(self.fan_out(v)) {
        if let Some(ud) = self.vf.value_mut(e).usedef_mut() {
          ud.parents.delete(ix);
        }
      }
    }
  }

  /// `after` may only be scheduled once `before` is.
  pub fn add_dependency(&mut self, before: InstIx, after: InstIx) {
    if before == after {
      return;
    }
    self.instrs[after].required.insert(before);
    self.instrs[before].dependent.insert(after);
  }

  fn array_key(&self, v: ValueIx) -> Option<(ArrayIx, Chan)> {
    let value = self.vf.value(v);
    match value.kind {
      ValueKind::ArrayElement { array, .. } => Some((array, value.chan)),
      _ => None,
    }
  }

  fn add_ordering(&mut self, ix: InstIx) {
    let lds = match &self.instrs[ix].kind {
      InstrKind::Alu(a) => a.has_lds_access(&self.vf),
      InstrKind::Lds(_) => true,
      _ => false,
    };
    if lds {
      if let Some(prev) = self.last_lds_access {
        self.add_dependency(prev, ix);
      }
      self.last_lds_access = Some(ix);
    }

    let (reads, writes) = {
      let kind = &self.instrs[ix].kind;
      (kind.reads(&self.vf), kind.writes())
    };
    let write_keys: Vec<(ArrayIx, Chan)> = writes.iter().filter_map(|v| self.array_key(*v)).collect();
    for key in write_keys {
      let mut before: Vec<InstIx> = self.array_writers.get(&key).cloned().unwrap_or_default();
      before.extend(self.array_readers.get(&key).cloned().unwrap_or_default());
      for b in before {
        self.add_dependency(b, ix);
      }
      self.array_writers.entry(key).or_insert_with(Vec::new).push(ix);
    }
    let read_keys: Vec<(ArrayIx, Chan)> = reads.iter().filter_map(|v| self.array_key(*v)).collect();
    for key in read_keys {
      self.array_readers.entry(key).or_insert_with(Vec::new).push(ix);
    }
  }

  //===========================================================================
  // Readiness

  fn is_older(&self, a: InstIx, b: InstIx) -> bool {
    let (ia, ib) = (&self.instrs[a], &self.instrs[b]);
    ia.block_id < ib.block_id || (ia.block_id == ib.block_id && ia.index < ib.index)
  }

  pub fn value_ready(&self, v: ValueIx, block: i32, index: i32) -> bool {
    value_ready(self.vf.values(), self.vf.arrays(), &self.instrs, v, block, index)
  }

  /// May the instruction be scheduled now?
  pub fn is_ready(&self, ix: InstIx) -> bool {
    let instr = &self.instrs[ix];
    if instr.is_dead() {
      return false;
    }
    for r in instr.required.iter() {
      let req = &self.instrs[*r];
      if req.is_dead() || req.is_scheduled() {
        continue;
      }
      let lds = req.kind.as_alu().map_or(false, |a| a.has_lds_access(&self.vf));
      if self.is_older(*r, ix) || lds {
        return false;
      }
    }
    self.do_ready(ix)
  }

  fn do_ready(&self, ix: InstIx) -> bool {
    let instr = &self.instrs[ix];
    let (block, index) = (instr.block_id, instr.index);
    for v in instr.kind.reads(&self.vf) {
      if !self.value_ready(v, block, index) {
        return false;
      }
    }
    for d in instr.kind.writes() {
      let value = self.vf.value(d);
      if value.is_ssa() {
        continue;
      }
      if let Some(addr) = value.addr() {
        if !self.value_ready(addr, block, index) {
          return false;
        }
      }
      // Readers of the old value must go first.
      let uses = value.usedef().map(|ud| ud.uses.to_vec()).unwrap_or_default();
      for u in uses {
        let user = &self.instrs[u];
        if !user.is_dead() && !user.is_scheduled() && self.is_older(u, ix) {
          return false;
        }
      }
    }
    true
  }

  //===========================================================================
  // Deletion

  pub fn set_dead(&mut self, ix: InstIx) {
    if self.instrs[ix].dead {
      return;
    }
    self.unregister_usedef(ix);
    self.instrs[ix].dead = true;
    trace!("dead {:?}", ix);
  }

  /// Remove ALU instructions whose results nobody reads, until nothing
  /// changes.  Returns the number removed.
  pub fn remove_dead_code(&mut self) -> usize {
    info!("remove_dead_code: begin");
    let mut removed = 0;
    loop {
      let mut changed = false;
      for b in 0..self.blocks.len() {
        for i in (0..self.blocks[b].items.len()).rev() {
          let ix = self.blocks[b].items[i];
          let instr = &self.instrs[ix];
          if instr.dead || instr.always_keep {
            continue;
          }
          let deletable = instr.kind.as_alu().map_or(false, |a| a.can_be_deleted(&self.vf));
          if deletable {
            self.set_dead(ix);
            removed += 1;
            changed = true;
          }
        }
      }
      if !changed {
        break;
      }
    }
    for b in 0..self.blocks.len() {
      let instrs = &self.instrs;
      self.blocks[b].items.retain(|ix| !instrs[*ix].dead);
    }
    info!("remove_dead_code: end, {} removed", removed);
    removed
  }

  //===========================================================================
  // Splitting

  /// Replace a multi-lane instruction by one instruction per lane, in place.
  pub fn split_alu(&mut self, ix: InstIx) -> Vec<InstIx> {
    let alu = match self.instrs[ix].kind.as_alu() {
      Some(a) => a.clone(),
      None => return vec![],
    };
    let pieces = alu.split(&mut self.vf);
    if pieces.is_empty() {
      return vec![];
    }
    let ids = self.replace_in_place(ix, pieces.into_iter().map(InstrKind::Alu).collect());
    debug!("split {:?} into {:?}", ix, ids);
    ids
  }

  /// Kill `ix` and put `pieces` where it was.  The pieces inherit its
  /// ordering edges and run in the given order among themselves when they
  /// touch the LDS queue.
  pub fn replace_in_place(&mut self, ix: InstIx, pieces: Vec<InstrKind>) -> Vec<InstIx> {
    let (block_id, index) = (self.instrs[ix].block_id, self.instrs[ix].index);
    let required = self.instrs[ix].required.to_vec();
    let dependent = self.instrs[ix].dependent.to_vec();
    self.set_dead(ix);

    let mut ids: Vec<InstIx> = vec![];
    let mut prev_lds: Option<InstIx> = None;
    for p in pieces {
      let pix = self.instrs.push(Instr::new(p, block_id, index));
      self.register_usedef(pix);
      for r in &required {
        self.add_dependency(*r, pix);
      }
      for d in &dependent {
        self.instrs[*d].required.delete(ix);
        self.add_dependency(pix, *d);
      }
      let lds = self.instrs[pix].kind.as_alu().map_or(false, |a| a.has_lds_access(&self.vf));
      if lds {
        if let Some(prev) = prev_lds {
          self.add_dependency(prev, pix);
        }
        prev_lds = Some(pix);
      }
      ids.push(pix);
    }
    if self.last_lds_access == Some(ix) {
      self.last_lds_access = prev_lds.or_else(|| ids.last().cloned());
    }
    for b in self.blocks.iter_mut().filter(|b| b.id == block_id) {
      if let Some(pos) = b.items.iter().position(|i| *i == ix) {
        b.items.splice(pos..pos + 1, ids.iter().cloned());
      }
    }
    ids
  }

  //===========================================================================
  // Printing

  pub fn show_instr(&self, ix: InstIx) -> String {
    let vf = &self.vf;
    match &self.instrs[ix].kind {
      InstrKind::Alu(a) => a.show(vf),
      InstrKind::Lds(l) => l.show(vf),
      InstrKind::Fetch(f) => f.show(vf),
      InstrKind::Export(e) => e.show(vf),
      InstrKind::ControlFlow(c) => c.show(vf),
      InstrKind::Group(g) => {
        let mut s = String::from("ALU_GROUP_BEGIN\n");
        for m in g.members() {
          let _ = writeln!(s, "  {}", self.show_instr(m));
        }
        s.push_str("ALU_GROUP_END");
        s
      }
    }
  }

  /// The whole program in text form.
  pub fn render(&self) -> String {
    let mut s = String::new();
    for a in self.vf.arrays().iter() {
      let chans: String = (a.frac..a.frac + a.nchannels).map(chan_letter).collect();
      let _ = writeln!(s, "ARRAY A{} {} {}", a.base_sel, a.size, chans);
    }
    for b in &self.blocks {
      let _ = writeln!(s, "BLOCK_START {}", b.id);
      for ix in &b.items {
        if self.instrs[*ix].is_dead() {
          continue;
        }
        for line in self.show_instr(*ix).lines() {
          let _ = writeln!(s, "  {}", line);
        }
      }
      let _ = writeln!(s, "BLOCK_END");
    }
    s
  }

  //===========================================================================
  // Structural comparison

  fn same_opt(&self, a: Option<ValueIx>, other: &Shader, b: Option<ValueIx>) -> bool {
    match (a, b) {
      (None, None) => true,
      (Some(a), Some(b)) => self.vf.same_value(a, &other.vf, b),
      _ => false,
    }
  }

  fn same_vec(&self, a: &VecReg, other: &Shader, b: &VecReg) -> bool {
    a.swizzle == b.swizzle
      && (0..NUM_CHANNELS).all(|i| self.vf.same_value(a.regs[i], &other.vf, b.regs[i]))
  }

  fn same_alu(&self, a: &AluInstr, other: &Shader, b: &AluInstr) -> bool {
    a.op == b.op
      && a.slots == b.slots
      && a.flags == b.flags
      && a.bank_swizzle == b.bank_swizzle
      && a.cf == b.cf
      && (a.dest.is_some() || a.lane == b.lane)
      && self.same_opt(a.dest, other, b.dest)
      && a.srcs.len() == b.srcs.len()
      && a.srcs.iter().zip(b.srcs.iter()).all(|(x, y)| {
        x.neg == y.neg && x.abs == y.abs && self.vf.same_value(x.value, &other.vf, y.value)
      })
  }

  /// Do `a` here and `b` in `other` denote the same instruction?
  pub fn same_instr(&self, a: InstIx, other: &Shader, b: InstIx) -> bool {
    match (&self.instrs[a].kind, &other.instrs[b].kind) {
      (InstrKind::Alu(x), InstrKind::Alu(y)) => self.same_alu(x, other, y),
      (InstrKind::Lds(x), InstrKind::Lds(y)) => {
        x.op == y.op
          && self.same_opt(x.dest, other, y.dest)
          && x.srcs.len() == y.srcs.len()
          && x.srcs.iter().zip(y.srcs.iter()).all(|(p, q)| self.vf.same_value(*p, &other.vf, *q))
      }
      (InstrKind::Fetch(x), InstrKind::Fetch(y)) => {
        x.op == y.op
          && x.resource_id == y.resource_id
          && self.same_vec(&x.dest, other, &y.dest)
          && self.same_vec(&x.src, other, &y.src)
      }
      (InstrKind::Export(x), InstrKind::Export(y)) => {
        x.kind == y.kind
          && x.location == y.location
          && x.last == y.last
          && self.same_vec(&x.value, other, &y.value)
      }
      (InstrKind::ControlFlow(x), InstrKind::ControlFlow(y)) => match (x, y) {
        (CfInstr::If(p), CfInstr::If(q)) | (CfInstr::Switch(p), CfInstr::Switch(q)) => {
          self.vf.same_value(*p, &other.vf, *q)
        }
        _ => x == y,
      },
      (InstrKind::Group(x), InstrKind::Group(y)) => {
        let (mx, my) = (x.members(), y.members());
        mx.len() == my.len()
          && x.slots.iter().zip(y.slots.iter()).all(|(p, q)| p.is_some() == q.is_some())
          && mx.iter().zip(my.iter()).all(|(p, q)| self.same_instr(*p, other, *q))
      }
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alu_group::schedule_block;
  use crate::instr::Src;
  use crate::opcodes::AluOp;
  use crate::value::{InlineConstant, Pin};
  use crate::value_factory::SourceKey;

  fn mov(dest: ValueIx, src: ValueIx) -> InstrKind {
    InstrKind::Alu(AluInstr::new(AluOp::Mov, Some(dest), vec![Src::new(src)]))
  }

  #[test]
  fn emit_tracks_uses_and_parents() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let x = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let y = sh.vf.dest_for(SourceKey::Ssa(1), 0, Pin::None);
    let one = sh.vf.inline_constant(InlineConstant::One);
    let i0 = sh.emit(b, mov(x, one));
    let i1 = sh.emit(b, mov(y, x));
    assert!(sh.vf.value(x).usedef().unwrap().parents.contains(i0));
    assert!(sh.vf.value(x).usedef().unwrap().uses.contains(i1));
    assert!(sh.is_ready(i0));
    assert!(!sh.is_ready(i1));
    sh.instrs[i0].scheduled = true;
    assert!(sh.is_ready(i1));
  }

  #[test]
  fn dead_code_goes_away_transitively() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let x = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let y = sh.vf.dest_for(SourceKey::Ssa(1), 0, Pin::None);
    let out = sh.vf.physical(0, 0, false);
    let one = sh.vf.inline_constant(InlineConstant::One);
    sh.emit(b, mov(x, one));
    sh.emit(b, mov(y, x));
    let keep = sh.emit(b, mov(out, one));
    assert_eq!(sh.remove_dead_code(), 2);
    assert_eq!(sh.blocks[b].items, vec![keep]);
    assert!(!sh.vf.value(x).has_uses());
  }

  #[test]
  fn indirect_array_write_orders_against_readers() {
    let mut vf = ValueFactory::new();
    vf.request_array(0, 4, 1);
    vf.allocate_arrays();
    let arr = vf.array_for_source(0).unwrap();
    let mut sh = Shader::new(vf);
    let b = sh.new_block();
    let idx = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let t = sh.vf.dest_for(SourceKey::Ssa(1), 0, Pin::None);
    let one = sh.vf.inline_constant(InlineConstant::One);
    let e2 = sh.vf.array_element(arr, 2, 0, None).unwrap();
    let ind = sh.vf.array_element(arr, 0, 0, Some(idx)).unwrap();
    sh.emit(b, mov(idx, one));
    let read = sh.emit(b, mov(t, e2));
    let write = sh.emit(b, mov(ind, one));
    assert!(sh.instrs[write].required.contains(read));
    // The indirect write may hit element 2.
    assert!(sh.vf.value(e2).usedef().unwrap().parents.contains(write));
  }

  #[test]
  fn render_prints_blocks_and_groups() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let x = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let y = sh.vf.dest_for(SourceKey::Ssa(1), 1, Pin::None);
    let one = sh.vf.inline_constant(InlineConstant::One);
    sh.emit(b, mov(x, one));
    sh.emit(b, mov(y, one));
    schedule_block(&mut sh, b, true, 4).unwrap();
    let expected = "BLOCK_START 0\n\
                    \x20 ALU_GROUP_BEGIN\n\
                    \x20   ALU MOV S1024.x@chan : I[ONE] {W} VEC_012\n\
                    \x20   ALU MOV S1025.y@chan : I[ONE] {WL} VEC_012\n\
                    \x20 ALU_GROUP_END\n\
                    BLOCK_END\n";
    assert_eq!(sh.render(), expected);
  }

  #[test]
  fn dependent_instruction_starts_a_new_group() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let x = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let y = sh.vf.dest_for(SourceKey::Ssa(1), 1, Pin::None);
    let one = sh.vf.inline_constant(InlineConstant::One);
    sh.emit(b, mov(x, one));
    sh.emit(b, mov(y, x));
    schedule_block(&mut sh, b, true, 4).unwrap();
    assert_eq!(sh.blocks[b].items.len(), 2);
    assert!(sh.blocks[b].items.iter().all(|g| sh.instrs[*g].kind.as_group().is_some()));
    assert_eq!(sh.instrs[sh.blocks[b].items[1]].index, 1);
  }

  #[test]
  fn kcache_overflow_opens_a_new_clause() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    for bank in 0..5 {
      let d = sh.vf.dest_for(SourceKey::Ssa(bank), 0, Pin::Chan);
      let u = sh.vf.uniform(bank, 0, 0, None);
      sh.emit(b, mov(d, u));
    }
    schedule_block(&mut sh, b, true, 4).unwrap();
    assert_eq!(sh.blocks[b].kcache.len(), 2);
    assert_eq!(sh.blocks[b].kcache[0].len(), 4);
    assert_eq!(sh.blocks[b].kcache[1].len(), 1);
  }

  #[test]
  fn splittable_op_is_split_when_it_does_not_fit() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let a = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let c = sh.vf.dest_for(SourceKey::Ssa(1), 0, Pin::None);
    let d = sh.vf.dest_for(SourceKey::Ssa(2), 1, Pin::None);
    let e = sh.vf.dest_for(SourceKey::Ssa(3), 3, Pin::Chan);
    let one = sh.vf.inline_constant(InlineConstant::One);
    sh.emit(b, mov(e, one));
    // Lanes x and y read different selects in bank x through the same
    // cycle under every shared swizzle.
    let srcs = vec![Src::new(a), Src::new(c), Src::new(c)];
    let recip = sh.emit(b, InstrKind::Alu(AluInstr::multislot(AluOp::RecipIeee, Some(d), srcs, 3)));
    schedule_block(&mut sh, b, false, 4).unwrap();
    assert!(sh.instrs[recip].is_dead());
    let alive = sh.alu_instrs();
    assert_eq!(alive.len(), 4);
    let writer = alive.iter().find(|i| sh.instrs[**i].kind.as_alu().unwrap().dest == Some(d));
    assert!(writer.is_some());
  }
}
