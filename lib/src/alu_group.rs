/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! VLIW bundling.
//!
//! An [`AluGroup`] is one issue bundle: four vector slots, one per channel,
//! and, on targets that have it, a fifth trans slot.  Whether a set of
//! instructions can share a bundle is decided by the operand read-port
//! model in [`ReadPortReservation`]: the register file is banked by channel
//! and each bank can be read once per cycle over three cycles.  Which cycle
//! an operand is read in is given by the bank swizzle of its instruction.
//! Constant-buffer reads go through at most two constant ports per group
//! and a per-clause set of locked cache lines ([`KCacheLine`]).
//!
//! At the bottom of the file is the block bundler, which walks a block in
//! program order and packs ready ALU instructions into groups.

use log::{debug, trace};
use smallvec::SmallVec;

use crate::data_structures::{InstIx, TypedIxVec, ValueIx};
use crate::instr::{AluInstr, Instr, Src};
use crate::interface::BundleError;
use crate::shader::Shader;
use crate::value::{Chan, Pin, ValueKind, NUM_CHANNELS};
use crate::value_factory::ValueFactory;

//=============================================================================
// Bank swizzles

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BankSwizzle {
  Vec012,
  Vec021,
  Vec120,
  Vec102,
  Vec201,
  Vec210,
  Scl210,
  Scl122,
  Scl212,
  Scl221,
}

pub static VEC_SWIZZLES: [BankSwizzle; 6] = [
  BankSwizzle::Vec012,
  BankSwizzle::Vec021,
  BankSwizzle::Vec120,
  BankSwizzle::Vec102,
  BankSwizzle::Vec201,
  BankSwizzle::Vec210,
];

pub static TRANS_SWIZZLES: [BankSwizzle; 4] =
  [BankSwizzle::Scl210, BankSwizzle::Scl122, BankSwizzle::Scl212, BankSwizzle::Scl221];

impl BankSwizzle {
  pub fn name(self) -> &'static str {
    match self {
      BankSwizzle::Vec012 => "VEC_012",
      BankSwizzle::Vec021 => "VEC_021",
      BankSwizzle::Vec120 => "VEC_120",
      BankSwizzle::Vec102 => "VEC_102",
      BankSwizzle::Vec201 => "VEC_201",
      BankSwizzle::Vec210 => "VEC_210",
      BankSwizzle::Scl210 => "SCL_210",
      BankSwizzle::Scl122 => "SCL_122",
      BankSwizzle::Scl212 => "SCL_212",
      BankSwizzle::Scl221 => "SCL_221",
    }
  }

  pub fn from_name(s: &str) -> Option<BankSwizzle> {
    VEC_SWIZZLES.iter().chain(TRANS_SWIZZLES.iter()).find(|b| b.name() == s).cloned()
  }

  pub fn is_trans(self) -> bool {
    TRANS_SWIZZLES.contains(&self)
  }

  /// Read cycle of source operand `src`.
  pub fn cycle(self, src: usize) -> usize {
    const VEC: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    const SCL: [[usize; 3]; 4] = [[2, 1, 0], [1, 2, 2], [2, 1, 2], [2, 2, 1]];
    match self {
      BankSwizzle::Vec012 => VEC[0][src],
      BankSwizzle::Vec021 => VEC[1][src],
      BankSwizzle::Vec120 => VEC[2][src],
      BankSwizzle::Vec102 => VEC[3][src],
      BankSwizzle::Vec201 => VEC[4][src],
      BankSwizzle::Vec210 => VEC[5][src],
      BankSwizzle::Scl210 => SCL[0][src],
      BankSwizzle::Scl122 => SCL[1][src],
      BankSwizzle::Scl212 => SCL[2][src],
      BankSwizzle::Scl221 => SCL[3][src],
    }
  }
}

//=============================================================================
// Read ports

const MAX_GPR_READ_CYCLES: usize = 3;
const MAX_CONST_READS: usize = 2;
pub const MAX_LITERALS: usize = 4;

/// Marks selects read through the address register, so that they never
/// share a port with a direct read of the same select.
const INDIRECT_SEL_BIT: i32 = 1 << 26;

#[derive(Clone, Debug)]
pub struct ReadPortReservation {
  hw_gpr: [[i32; NUM_CHANNELS]; MAX_GPR_READ_CYCLES],
  hw_const: [Option<(u32, u32)>; MAX_CONST_READS],
  literals: SmallVec<[u32; MAX_LITERALS]>,
}

impl ReadPortReservation {
  pub fn new() -> Self {
    Self {
      hw_gpr: [[-1; NUM_CHANNELS]; MAX_GPR_READ_CYCLES],
      hw_const: [None; MAX_CONST_READS],
      literals: SmallVec::new(),
    }
  }

  /// Claim bank `chan` in `cycle` for `sel`.  A port already claimed for
  /// the same select is shared.
  pub fn reserve_gpr(&mut self, sel: i32, chan: Chan, cycle: usize) -> bool {
    let slot = &mut self.hw_gpr[cycle][chan as usize];
    if *slot == -1 {
      *slot = sel;
      true
    } else {
      *slot == sel
    }
  }

  pub fn reserve_const(&mut self, bank: u32, index: u32) -> bool {
    let mut empty = None;
    for (i, c) in self.hw_const.iter().enumerate() {
      match c {
        Some(k) if *k == (bank, index) => return true,
        Some(_) => {}
        None => {
          if empty.is_none() {
            empty = Some(i);
          }
        }
      }
    }
    match empty {
      Some(i) => {
        self.hw_const[i] = Some((bank, index));
        true
      }
      None => false,
    }
  }

  pub fn add_literal(&mut self, bits: u32) -> bool {
    if self.literals.contains(&bits) {
      return true;
    }
    if self.literals.len() < MAX_LITERALS {
      self.literals.push(bits);
      true
    } else {
      false
    }
  }

  pub fn literals(&self) -> &[u32] {
    &self.literals
  }

  fn count_const(trans: Option<(usize, &mut u32)>) -> bool {
    match trans {
      Some((_, n_consts)) => {
        if *n_consts as usize >= MAX_CONST_READS {
          false
        } else {
          *n_consts += 1;
          true
        }
      }
      None => true,
    }
  }

  /// Reserve the read of `v` in `cycle`.  Trans reads pass their operand
  /// position and the running count of constant reads.
  fn reserve_value(
    &mut self, vf: &ValueFactory, v: ValueIx, cycle: usize, trans: Option<(usize, &mut u32)>,
  ) -> bool {
    let value = vf.value(v);
    match &value.kind {
      ValueKind::Register { .. } | ValueKind::ArrayElement { .. } => {
        if value.chan as usize >= NUM_CHANNELS {
          return true;
        }
        if let Some((isrc, _)) = trans {
          if cycle < isrc {
            return false;
          }
        }
        let sel = if value.addr().is_some() { value.sel | INDIRECT_SEL_BIT } else { value.sel };
        self.reserve_gpr(sel, value.chan, cycle)
      }
      ValueKind::Uniform { bank, index, .. } => {
        Self::count_const(trans) && self.reserve_const(*bank, *index)
      }
      ValueKind::Literal { bits } => Self::count_const(trans) && self.add_literal(*bits),
      ValueKind::Inline(_) => Self::count_const(trans),
    }
  }

  /// Reserve the reads of one vector lane.
  pub fn schedule_vec_srcs(&mut self, vf: &ValueFactory, srcs: &[Src], swz: BankSwizzle) -> bool {
    for (i, s) in srcs.iter().enumerate() {
      // The second operand reuses the port of an identical first one.
      if i == 1 && s.value == srcs[0].value {
        continue;
      }
      if !self.reserve_value(vf, s.value, swz.cycle(i), None) {
        return false;
      }
    }
    true
  }

  pub fn schedule_trans_srcs(&mut self, vf: &ValueFactory, srcs: &[Src], swz: BankSwizzle) -> bool {
    let mut n_consts = 0u32;
    for (i, s) in srcs.iter().enumerate() {
      if !self.reserve_value(vf, s.value, swz.cycle(i), Some((i, &mut n_consts))) {
        return false;
      }
    }
    true
  }
}

impl Default for ReadPortReservation {
  fn default() -> Self {
    Self::new()
  }
}

//=============================================================================
// Constant cache lines

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KCacheLock {
  /// One line of 16 constants.
  Lock1,
  /// Two adjacent lines.
  Lock2,
}

/// A constant-buffer window locked for the duration of an ALU clause.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KCacheLine {
  pub bank: u32,
  /// First locked line; constant `index` lives in line `index >> 4`.
  pub addr: u32,
  pub lock: KCacheLock,
  /// Buffer index register, for indirectly selected buffers.
  pub index_reg: Option<ValueIx>,
}

/// Make constant `index` of `bank` available in `lines`, which is kept
/// sorted by bank and line.  Widens an adjacent lock before taking a new
/// bank slot; fails when all `max_banks` slots are taken.
pub fn reserve_kcache(
  lines: &mut Vec<KCacheLine>, max_banks: usize, bank: u32, index: u32,
  index_reg: Option<ValueIx>,
) -> bool {
  let mut line = index >> 4;
  let mut i = 0;
  while i < lines.len() {
    let kc = &mut lines[i];
    if kc.bank < bank {
      i += 1;
      continue;
    }
    if kc.bank == bank && kc.index_reg != index_reg {
      return false;
    }
    if kc.bank > bank || kc.addr > line + 1 {
      if lines.len() >= max_banks {
        return false;
      }
      lines.insert(i, KCacheLine { bank, addr: line, lock: KCacheLock::Lock1, index_reg });
      return true;
    }
    let d = line as i64 - kc.addr as i64;
    if d == -1 {
      kc.addr -= 1;
      match kc.lock {
        KCacheLock::Lock1 => {
          kc.lock = KCacheLock::Lock2;
          return true;
        }
        KCacheLock::Lock2 => {
          // The old second line fell out of the window; it needs a new home.
          line += 2;
        }
      }
    } else if d == 1 {
      kc.lock = KCacheLock::Lock2;
      return true;
    } else if d == 0 {
      return true;
    }
    i += 1;
  }
  if lines.len() >= max_banks {
    return false;
  }
  lines.push(KCacheLine { bank, addr: line, lock: KCacheLock::Lock1, index_reg });
  true
}

/// Uniform operands of an instruction, as `(bank, index, buffer address)`.
fn uniforms_of(vf: &ValueFactory, alu: &AluInstr) -> Vec<(u32, u32, Option<ValueIx>)> {
  alu
    .srcs
    .iter()
    .filter_map(|s| match vf.value(s.value).kind {
      ValueKind::Uniform { bank, index, buf_addr } => Some((bank, index, buf_addr)),
      _ => None,
    })
    .collect()
}

//=============================================================================
// Groups

pub const TRANS_SLOT: usize = 4;

#[derive(Clone, Debug)]
pub struct AluGroup {
  /// Vector slots x, y, z, w, then trans.  A multi-lane instruction
  /// occupies several.
  pub slots: [Option<InstIx>; 5],
  has_trans_slot: bool,
  readports: ReadPortReservation,
  has_lds_op: bool,
  addr_used: Option<ValueIx>,
  /// ALU clause of the block this group belongs to.
  pub clause: u32,
}

impl AluGroup {
  pub fn new(has_trans_slot: bool, clause: u32) -> Self {
    Self {
      slots: [None; 5],
      has_trans_slot,
      readports: ReadPortReservation::new(),
      has_lds_op: false,
      addr_used: None,
      clause,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.slots.iter().all(|s| s.is_none())
  }

  pub fn has_trans_slot(&self) -> bool {
    self.has_trans_slot
  }

  /// Members in slot order, each once.
  pub fn members(&self) -> Vec<InstIx> {
    let mut res: Vec<InstIx> = vec![];
    for s in self.slots.iter().flatten() {
      if !res.contains(s) {
        res.push(*s);
      }
    }
    res
  }

  pub fn literals(&self) -> &[u32] {
    self.readports.literals()
  }

  /// Try to place one more instruction.  On success the instruction's bank
  /// swizzle is set and a free destination gets pinned to its slot's
  /// channel; on failure nothing changes.
  pub fn add_instruction(
    &mut self, ix: InstIx, instrs: &mut TypedIxVec<InstIx, Instr>, vf: &mut ValueFactory,
  ) -> bool {
    self.add(ix, instrs, vf, false)
  }

  /// Same for one lane of a split instruction.  On a part without a trans
  /// unit these are the only transcendentals allowed in a vector slot.
  pub fn add_split_piece(
    &mut self, ix: InstIx, instrs: &mut TypedIxVec<InstIx, Instr>, vf: &mut ValueFactory,
  ) -> bool {
    self.add(ix, instrs, vf, true)
  }

  fn add(
    &mut self, ix: InstIx, instrs: &mut TypedIxVec<InstIx, Instr>, vf: &mut ValueFactory,
    split_piece: bool,
  ) -> bool {
    let alu = match instrs[ix].kind.as_alu() {
      Some(a) => a.clone(),
      None => return false,
    };
    if self.has_lds_op && alu.has_lds_access(vf) {
      return false;
    }
    if alu.slots > 1 {
      return self.add_multislot(ix, &alu, instrs, vf);
    }
    if alu.is_trans() && self.has_trans_slot {
      return self.add_trans_instruction(ix, &alu, instrs, vf);
    }
    if self.add_vec_instruction(ix, &alu, split_piece, instrs, vf) {
      return true;
    }
    alu.op.can_use_trans() && self.add_trans_instruction(ix, &alu, instrs, vf)
  }

  fn update_indirect_access(&mut self, alu: &AluInstr, vf: &ValueFactory) -> bool {
    match alu.indirect_addr(vf) {
      None => true,
      Some(addr) => match self.addr_used {
        None => {
          self.addr_used = Some(addr);
          true
        }
        Some(used) => used == addr,
      },
    }
  }

  fn commit(
    &mut self, ix: InstIx, alu: &AluInstr, readports: ReadPortReservation, swz: BankSwizzle,
    instrs: &mut TypedIxVec<InstIx, Instr>, vf: &mut ValueFactory,
  ) {
    self.readports = readports;
    self.has_lds_op |= alu.has_lds_access(vf);
    if let Some(a) = instrs[ix].kind.as_alu_mut() {
      a.bank_swizzle = Some(swz);
    }
    if let Some(d) = alu.dest {
      let v = vf.value_mut(d);
      if v.is_register() && v.pin == Pin::None {
        v.pin = Pin::Chan;
      }
    }
  }

  fn try_readport(
    &mut self, ix: InstIx, alu: &AluInstr, lane: usize, swz: BankSwizzle,
    instrs: &mut TypedIxVec<InstIx, Instr>, vf: &mut ValueFactory,
  ) -> bool {
    let mut readports = self.readports.clone();
    let saved_addr = self.addr_used;
    if readports.schedule_vec_srcs(vf, alu.lane_srcs(0), swz) && self.update_indirect_access(alu, vf)
    {
      self.slots[lane] = Some(ix);
      self.commit(ix, alu, readports, swz, instrs, vf);
      trace!("group: {:?} in slot {} with {}", ix, lane, swz.name());
      return true;
    }
    self.addr_used = saved_addr;
    false
  }

  fn try_swizzles(
    &mut self, ix: InstIx, alu: &AluInstr, lane: usize, instrs: &mut TypedIxVec<InstIx, Instr>,
    vf: &mut ValueFactory,
  ) -> bool {
    match alu.bank_swizzle {
      Some(swz) if !swz.is_trans() => self.try_readport(ix, alu, lane, swz, instrs, vf),
      _ => VEC_SWIZZLES.iter().any(|swz| self.try_readport(ix, alu, lane, *swz, instrs, vf)),
    }
  }

  fn add_vec_instruction(
    &mut self, ix: InstIx, alu: &AluInstr, split_piece: bool,
    instrs: &mut TypedIxVec<InstIx, Instr>, vf: &mut ValueFactory,
  ) -> bool {
    // Without a trans unit, transcendentals run on the vector lanes, one
    // lane per piece of the split op.
    if !alu.op.can_use_vector() && (self.has_trans_slot || !split_piece) {
      return false;
    }
    let chan = alu.dest_chan(vf) as usize;
    if chan >= NUM_CHANNELS {
      return false;
    }
    if self.slots[chan].is_none() {
      return self.try_swizzles(ix, alu, chan, instrs, vf);
    }

    // The slot is taken; a free SSA destination may move to another one.
    let dest = match alu.dest {
      Some(d) if vf.value(d).is_ssa() && vf.value(d).pin.channel_is_free() => d,
      _ => return false,
    };
    if alu.has_lds_access(vf) {
      return false;
    }
    for lane in 0..NUM_CHANNELS {
      if self.slots[lane].is_some() || !vf.relocate_chan(dest, lane as Chan) {
        continue;
      }
      if self.try_swizzles(ix, alu, lane, instrs, vf) {
        debug!("group: relocated {:?} from chan {} to {}", dest, chan, lane);
        return true;
      }
      vf.relocate_chan(dest, chan as Chan);
    }
    false
  }

  fn add_trans_instruction(
    &mut self, ix: InstIx, alu: &AluInstr, instrs: &mut TypedIxVec<InstIx, Instr>,
    vf: &mut ValueFactory,
  ) -> bool {
    if !self.has_trans_slot || self.slots[TRANS_SLOT].is_some() {
      return false;
    }
    // LDS ops go to the x slot.
    if alu.op.info().lds || !alu.op.can_use_trans() {
      return false;
    }
    // A vector-capable op in the trans slot would be issued as a vector op
    // if its own slot were empty, which the port check here doesn't model.
    if !alu.is_trans() {
      let chan = alu.dest_chan(vf) as usize;
      if chan < NUM_CHANNELS && self.slots[chan].is_none() {
        return false;
      }
    }
    for swz in TRANS_SWIZZLES.iter() {
      let mut readports = self.readports.clone();
      let saved_addr = self.addr_used;
      if readports.schedule_trans_srcs(vf, alu.lane_srcs(0), *swz)
        && self.update_indirect_access(alu, vf)
      {
        self.slots[TRANS_SLOT] = Some(ix);
        self.commit(ix, alu, readports, *swz, instrs, vf);
        trace!("group: {:?} in trans slot with {}", ix, swz.name());
        return true;
      }
      self.addr_used = saved_addr;
    }
    false
  }

  /// Place all lanes of a multi-lane instruction at once, lane `i` in slot
  /// `i`, under one bank swizzle.
  fn add_multislot(
    &mut self, ix: InstIx, alu: &AluInstr, instrs: &mut TypedIxVec<InstIx, Instr>,
    vf: &mut ValueFactory,
  ) -> bool {
    let nlanes = alu.slots as usize;
    if nlanes > NUM_CHANNELS || (0..nlanes).any(|l| self.slots[l].is_some()) {
      return false;
    }
    for swz in VEC_SWIZZLES.iter() {
      let mut readports = self.readports.clone();
      let saved_addr = self.addr_used;
      if (0..nlanes).all(|l| readports.schedule_vec_srcs(vf, alu.lane_srcs(l), *swz))
        && self.update_indirect_access(alu, vf)
      {
        for l in 0..nlanes {
          self.slots[l] = Some(ix);
        }
        self.commit(ix, alu, readports, *swz, instrs, vf);
        trace!("group: {:?} in slots 0..{} with {}", ix, nlanes, swz.name());
        return true;
      }
      self.addr_used = saved_addr;
    }
    false
  }

  /// Uniforms read by all members.
  pub fn uniforms(&self, instrs: &TypedIxVec<InstIx, Instr>, vf: &ValueFactory) -> Vec<ValueIx> {
    let mut res = vec![];
    for m in self.members() {
      if let Some(a) = instrs[m].kind.as_alu() {
        res.extend(a.srcs.iter().map(|s| s.value).filter(|v| vf.value(*v).is_uniform()));
      }
    }
    res
  }
}

//=============================================================================
// The block bundler

struct Bundler {
  has_trans_slot: bool,
  max_kcache_banks: usize,
  block: usize,
  out: Vec<InstIx>,
  clauses: Vec<Vec<KCacheLine>>,
  group: AluGroup,
  lds_open: bool,
}

impl Bundler {
  fn clause(&self) -> u32 {
    (self.clauses.len() - 1) as u32
  }

  /// Close the open group: mark the last member, mark all scheduled and
  /// put the group into the block.
  fn close_group(&mut self, shader: &mut Shader) {
    if self.group.is_empty() {
      return;
    }
    let fresh = AluGroup::new(self.has_trans_slot, self.clause());
    let group = std::mem::replace(&mut self.group, fresh);
    let members = group.members();
    let nmembers = members.len();
    for (i, m) in members.iter().enumerate() {
      let instr = &mut shader.instrs[*m];
      instr.scheduled = true;
      if let Some(a) = instr.kind.as_alu_mut() {
        a.flags.last = i + 1 == nmembers;
      }
    }
    let gix = shader.push_group(self.block, group);
    shader.instrs[gix].scheduled = true;
    self.out.push(gix);
  }

  fn new_clause(&mut self, shader: &mut Shader) {
    self.close_group(shader);
    if !self.clauses.last().map_or(true, |c| c.is_empty()) {
      self.clauses.push(vec![]);
    }
    self.group.clause = self.clause();
  }

  fn reserve_kcache(&mut self, shader: &Shader, alu: &AluInstr) -> bool {
    let mut lines = self.clauses.last().cloned().unwrap_or_default();
    for (bank, index, buf_addr) in uniforms_of(&shader.vf, alu) {
      if !reserve_kcache(&mut lines, self.max_kcache_banks, bank, index, buf_addr) {
        return false;
      }
    }
    if let Some(c) = self.clauses.last_mut() {
      *c = lines;
    }
    true
  }

  /// All pieces or none.  A failed trial leaves the pieces' destinations
  /// with the pin and channel they had before.
  fn add_all(&mut self, shader: &mut Shader, pieces: &[InstIx]) -> bool {
    let dests: Vec<(ValueIx, Pin, Chan)> = pieces
      .iter()
      .filter_map(|p| shader.instrs[*p].kind.as_alu().and_then(|a| a.dest))
      .map(|d| {
        let v = shader.vf.value(d);
        (d, v.pin, v.chan)
      })
      .collect();
    let mut trial = self.group.clone();
    let ok = pieces.iter().all(|p| trial.add_split_piece(*p, &mut shader.instrs, &mut shader.vf));
    if ok {
      self.group = trial;
      return true;
    }
    for p in pieces {
      if let Some(a) = shader.instrs[*p].kind.as_alu_mut() {
        a.bank_swizzle = None;
      }
    }
    for (d, pin, chan) in dests {
      // Unpin first, relocation only moves free registers.
      shader.vf.value_mut(d).pin = Pin::None;
      shader.vf.relocate_chan(d, chan);
      shader.vf.value_mut(d).pin = pin;
    }
    false
  }

  fn schedule_alu(&mut self, shader: &mut Shader, ix: InstIx) -> Result<(), BundleError> {
    let alu = match shader.instrs[ix].kind.as_alu() {
      Some(a) => a.clone(),
      None => return Ok(()),
    };

    if !self.reserve_kcache(shader, &alu) {
      if self.lds_open {
        return Err(BundleError::KCacheExhausted { block: shader.blocks[self.block].id });
      }
      debug!("bundle: kcache full, new clause for {:?}", ix);
      self.new_clause(shader);
      if !self.reserve_kcache(shader, &alu) {
        return Err(BundleError::KCacheExhausted { block: shader.blocks[self.block].id });
      }
    }

    if alu.flags.lds_group_start {
      if self.lds_open {
        return Err(BundleError::LdsGroupAlreadyOpen { block: shader.blocks[self.block].id });
      }
      self.lds_open = true;
    }
    if alu.flags.lds_group_end {
      if !self.lds_open {
        return Err(BundleError::LdsGroupNotOpen { block: shader.blocks[self.block].id });
      }
      self.lds_open = false;
    }

    if !shader.is_ready(ix) {
      self.close_group(shader);
      if !shader.is_ready(ix) {
        return Err(BundleError::UnschedulableInstruction { block: shader.blocks[self.block].id });
      }
    }

    if self.group.add_instruction(ix, &mut shader.instrs, &mut shader.vf) {
      return Ok(());
    }
    if alu.is_splittable() {
      let pieces = shader.split_alu(ix);
      debug!("bundle: split {:?} into {:?}", ix, pieces);
      if self.add_all(shader, &pieces) {
        return Ok(());
      }
      self.close_group(shader);
      if self.add_all(shader, &pieces) {
        return Ok(());
      }
    } else {
      self.close_group(shader);
      if self.group.add_instruction(ix, &mut shader.instrs, &mut shader.vf) {
        return Ok(());
      }
    }
    Err(BundleError::UnschedulableInstruction { block: shader.blocks[self.block].id })
  }
}

/// Pack the ALU instructions of block `block` into groups, in program
/// order.  A group is closed when the next instruction is not ready yet or
/// doesn't fit; non-ALU instructions end the current ALU clause.
pub fn schedule_block(
  shader: &mut Shader, block: usize, has_trans_slot: bool, max_kcache_banks: usize,
) -> Result<(), BundleError> {
  let items = std::mem::take(&mut shader.blocks[block].items);
  let mut b = Bundler {
    has_trans_slot,
    max_kcache_banks,
    block,
    out: Vec::with_capacity(items.len()),
    clauses: vec![vec![]],
    group: AluGroup::new(has_trans_slot, 0),
    lds_open: false,
  };

  for ix in items {
    if shader.instrs[ix].is_dead() {
      continue;
    }
    if shader.instrs[ix].kind.is_alu() {
      b.schedule_alu(shader, ix)?;
      continue;
    }
    let members = shader.instrs[ix].kind.as_group().map(|g| g.members());
    match members {
      // Bundled already.
      Some(members) => {
        b.close_group(shader);
        for m in members {
          shader.instrs[m].scheduled = true;
        }
      }
      None => b.new_clause(shader),
    }
    shader.instrs[ix].scheduled = true;
    b.out.push(ix);
  }
  b.close_group(shader);
  if b.lds_open {
    return Err(BundleError::LdsGroupAlreadyOpen { block: shader.blocks[block].id });
  }
  if b.clauses.len() > 1 && b.clauses.last().map_or(false, |c| c.is_empty()) {
    b.clauses.pop();
  }

  debug!(
    "bundle: block {} has {} items in {} clauses",
    shader.blocks[block].id,
    b.out.len(),
    b.clauses.len()
  );
  shader.blocks[block].items = b.out;
  shader.blocks[block].kcache = b.clauses;
  shader.renumber_block(block);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::instr::InstrKind;
  use crate::opcodes::AluOp;
  use crate::value::InlineConstant;
  use crate::value_factory::SourceKey;

  fn arena_with(instrs: Vec<AluInstr>) -> (TypedIxVec<InstIx, Instr>, Vec<InstIx>) {
    let mut arena = TypedIxVec::new();
    let ids = instrs.into_iter().map(|a| arena.push(Instr::new(InstrKind::Alu(a), 0, 0))).collect();
    (arena, ids)
  }

  fn ssa(vf: &mut ValueFactory, id: u32, chan: Chan) -> ValueIx {
    vf.dest_for(SourceKey::Ssa(id), chan, Pin::None)
  }

  #[test]
  fn swizzle_cycles() {
    assert_eq!(BankSwizzle::Vec120.cycle(0), 1);
    assert_eq!(BankSwizzle::Vec201.cycle(2), 1);
    assert_eq!(BankSwizzle::Scl122.cycle(2), 2);
    assert_eq!(BankSwizzle::from_name("SCL_221"), Some(BankSwizzle::Scl221));
    assert!(BankSwizzle::Scl212.is_trans());
    assert!(!BankSwizzle::Vec012.is_trans());
  }

  #[test]
  fn gpr_ports_are_shared_by_equal_selects_only() {
    let mut rp = ReadPortReservation::new();
    assert!(rp.reserve_gpr(1030, 0, 0));
    assert!(rp.reserve_gpr(1030, 0, 0));
    assert!(!rp.reserve_gpr(1031, 0, 0));
    assert!(rp.reserve_gpr(1031, 1, 0));
    assert!(rp.reserve_gpr(1031, 0, 1));
  }

  #[test]
  fn at_most_two_constants_and_four_literals() {
    let mut rp = ReadPortReservation::new();
    assert!(rp.reserve_const(0, 1));
    assert!(rp.reserve_const(0, 2));
    assert!(rp.reserve_const(0, 1));
    assert!(!rp.reserve_const(1, 1));
    for bits in 0..4 {
      assert!(rp.add_literal(bits));
    }
    assert!(rp.add_literal(2));
    assert!(!rp.add_literal(4));
  }

  #[test]
  fn two_independent_adds_share_a_group() {
    let mut vf = ValueFactory::new();
    let d = vf.temp_vec4(Pin::None);
    let s0 = ssa(&mut vf, 0, 0);
    let s1 = ssa(&mut vf, 1, 0);
    let s2 = ssa(&mut vf, 2, 1);
    let s3 = ssa(&mut vf, 3, 1);
    let (mut arena, ids) = arena_with(vec![
      AluInstr::new(AluOp::Add, Some(d[0]), vec![Src::new(s0), Src::new(s1)]),
      AluInstr::new(AluOp::Add, Some(d[1]), vec![Src::new(s2), Src::new(s3)]),
    ]);
    let mut group = AluGroup::new(true, 0);
    assert!(group.add_instruction(ids[0], &mut arena, &mut vf));
    assert!(group.add_instruction(ids[1], &mut arena, &mut vf));
    assert_eq!(group.members(), ids);
    for ix in ids {
      assert_eq!(arena[ix].kind.as_alu().unwrap().bank_swizzle, Some(BankSwizzle::Vec012));
    }
    assert_eq!(vf.value(d[0]).pin, Pin::Chan);
  }

  #[test]
  fn port_conflict_rejects_the_second_add() {
    let mut vf = ValueFactory::new();
    let d = vf.temp_vec4(Pin::Chan);
    let a = ssa(&mut vf, 0, 0);
    let b = ssa(&mut vf, 1, 0);
    let c = ssa(&mut vf, 2, 0);
    let e = ssa(&mut vf, 3, 0);
    let (mut arena, ids) = arena_with(vec![
      AluInstr::new(AluOp::Add, Some(d[0]), vec![Src::new(a), Src::new(b)]),
      AluInstr::new(AluOp::Add, Some(d[1]), vec![Src::new(c), Src::new(e)]),
    ]);
    let mut group = AluGroup::new(true, 0);
    assert!(group.add_instruction(ids[0], &mut arena, &mut vf));
    // All four operands sit in bank x, which has one free cycle left.  The
    // trans slot only takes ops whose own vector slot is taken.
    assert!(!group.add_instruction(ids[1], &mut arena, &mut vf));
    assert_eq!(group.members(), vec![ids[0]]);
  }

  #[test]
  fn occupied_slot_relocates_a_free_dest() {
    let mut vf = ValueFactory::new();
    let a = ssa(&mut vf, 0, 0);
    let d0 = ssa(&mut vf, 10, 0);
    let d1 = ssa(&mut vf, 11, 0);
    let one = vf.inline_constant(InlineConstant::One);
    let (mut arena, ids) = arena_with(vec![
      AluInstr::new(AluOp::Add, Some(d0), vec![Src::new(a), Src::new(one)]),
      AluInstr::new(AluOp::Mul, Some(d1), vec![Src::new(a), Src::new(one)]),
    ]);
    let mut group = AluGroup::new(false, 0);
    assert!(group.add_instruction(ids[0], &mut arena, &mut vf));
    assert!(group.add_instruction(ids[1], &mut arena, &mut vf));
    assert_eq!(vf.value(d1).chan, 1);
    assert_eq!(group.slots[1], Some(ids[1]));
  }

  #[test]
  fn trans_op_goes_to_the_trans_slot() {
    let mut vf = ValueFactory::new();
    let a = ssa(&mut vf, 0, 0);
    let d = ssa(&mut vf, 1, 0);
    let (mut arena, ids) =
      arena_with(vec![AluInstr::new(AluOp::RecipIeee, Some(d), vec![Src::new(a)])]);
    let mut group = AluGroup::new(true, 0);
    assert!(group.add_instruction(ids[0], &mut arena, &mut vf));
    assert_eq!(group.slots[TRANS_SLOT], Some(ids[0]));
    assert!(arena[ids[0]].kind.as_alu().unwrap().bank_swizzle.unwrap().is_trans());

    let mut vliw4 = AluGroup::new(false, 0);
    assert!(!vliw4.add_instruction(ids[0], &mut arena, &mut vf));
  }

  #[test]
  fn dot4_takes_four_slots() {
    let mut vf = ValueFactory::new();
    let a = vf.temp_vec4(Pin::Chan);
    let b = vf.temp_vec4(Pin::Chan);
    let d = ssa(&mut vf, 0, 0);
    let srcs: Vec<Src> = (0..4).flat_map(|i| vec![Src::new(a[i]), Src::new(b[i])]).collect();
    let (mut arena, ids) =
      arena_with(vec![AluInstr::multislot(AluOp::Dot4, Some(d), srcs, 4)]);
    let mut group = AluGroup::new(true, 0);
    assert!(group.add_instruction(ids[0], &mut arena, &mut vf));
    assert!(group.slots[..4].iter().all(|s| *s == Some(ids[0])));
    assert_eq!(group.members(), ids);
  }

  #[test]
  fn kcache_lines_merge_and_run_out() {
    let mut lines = vec![];
    assert!(reserve_kcache(&mut lines, 4, 0, 5, None));
    assert!(reserve_kcache(&mut lines, 4, 0, 20, None));
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].lock, KCacheLock::Lock2);
    assert!(reserve_kcache(&mut lines, 4, 0, 31, None));
    assert_eq!(lines.len(), 1);
    assert!(reserve_kcache(&mut lines, 4, 1, 0, None));
    assert!(reserve_kcache(&mut lines, 4, 0, 100, None));
    assert!(reserve_kcache(&mut lines, 4, 2, 0, None));
    assert_eq!(lines.len(), 4);
    assert!(!reserve_kcache(&mut lines, 4, 3, 0, None));
    // Still sorted by bank, then line.
    let keys: Vec<(u32, u32)> = lines.iter().map(|l| (l.bank, l.addr)).collect();
    assert_eq!(keys, vec![(0, 0), (0, 6), (1, 0), (2, 0)]);
  }

  #[test]
  fn kcache_prepending_to_a_double_lock_keeps_the_dropped_line() {
    let mut lines = vec![];
    assert!(reserve_kcache(&mut lines, 4, 0, 16, None));
    assert!(reserve_kcache(&mut lines, 4, 0, 32, None));
    assert!(reserve_kcache(&mut lines, 4, 0, 0, None));
    let keys: Vec<(u32, u32, KCacheLock)> = lines.iter().map(|l| (l.bank, l.addr, l.lock)).collect();
    assert_eq!(keys, vec![(0, 0, KCacheLock::Lock2), (0, 2, KCacheLock::Lock1)]);
  }

  #[test]
  fn split_trans_pieces_take_vector_slots_without_trans_unit() {
    let mut vf = ValueFactory::new();
    let a = ssa(&mut vf, 0, 0);
    let d = ssa(&mut vf, 1, 1);
    let (mut arena, ids) =
      arena_with(vec![AluInstr::new(AluOp::RecipIeee, Some(d), vec![Src::new(a)])]);
    let mut vliw4 = AluGroup::new(false, 0);
    assert!(!vliw4.add_instruction(ids[0], &mut arena, &mut vf));
    assert!(vliw4.add_split_piece(ids[0], &mut arena, &mut vf));
    assert_eq!(vliw4.slots[1], Some(ids[0]));
  }

  #[test]
  fn failed_split_trial_restores_pins_and_channels() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let taken = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::Chan);
    let free = sh.vf.dest_for(SourceKey::Ssa(1), 0, Pin::None);
    let pinned = sh.vf.dest_for(SourceKey::Ssa(2), 0, Pin::Chan);
    let mov = |d| InstrKind::Alu(AluInstr::new(AluOp::Mov, Some(d), vec![Src::new(one)]));
    let first = sh.emit(b, mov(taken));
    let pieces = vec![sh.emit(b, mov(free)), sh.emit(b, mov(pinned))];

    let mut bundler = Bundler {
      has_trans_slot: false,
      max_kcache_banks: 4,
      block: b,
      out: vec![],
      clauses: vec![vec![]],
      group: AluGroup::new(false, 0),
      lds_open: false,
    };
    assert!(bundler.group.add_instruction(first, &mut sh.instrs, &mut sh.vf));
    // The first piece moves to y and gets pinned there, the second can't
    // leave the taken x slot.
    assert!(!bundler.add_all(&mut sh, &pieces));
    assert_eq!(sh.vf.value(free).pin, Pin::None);
    assert_eq!(sh.vf.value(free).chan, 0);
    assert_eq!(bundler.group.members(), vec![first]);
    assert!(sh.instrs[pieces[0]].kind.as_alu().unwrap().bank_swizzle.is_none());
  }
}
