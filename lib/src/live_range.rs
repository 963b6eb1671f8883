/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Live range evaluation.
//!
//! One pass over the finished program numbers the lines (a group is one
//! line, reads before writes), pushes and pops program scopes at control
//! flow markers, and feeds every register access to a per-register
//! [`RegisterCompAccess`].  After the pass each accumulator is reduced to
//! the smallest interval over which the register must keep its value.
//!
//! The hard part is writes inside loops.  A register first written in one
//! branch of an if/else inside a loop may or may not hold a value on the
//! next iteration; unless both branches write it (resolved per nesting
//! level, bottom up), or the value is never read outside the branch, it has
//! to live across the whole loop.

use log::{debug, info, trace};
use std::fmt;

use crate::data_structures::{InstIx, Map, ScopeIx, ValueIx};
use crate::instr::{AluCf, CfInstr, InstrKind};
use crate::program_scope::{ScopeKind, ScopeTree};
use crate::shader::Shader;
use crate::value::{Chan, ValueKind, NUM_CHANNELS};

const CONDITIONALITY_UNTOUCHED: i32 = i32::MAX;
const WRITE_IS_UNCONDITIONAL: i32 = i32::MAX - 1;
const WRITE_IS_CONDITIONAL: i32 = -1;
const CONDITIONALITY_UNRESOLVED: i32 = 0;

/// Deeper if/else nesting inside a loop is treated as a conditional write.
const SUPPORTED_IFELSE_NESTING_DEPTH: u32 = 32;

const BLOCK_ID_UNINITIALIZED: i32 = -2;
const BLOCK_ID_NOT_UNIQUE: i32 = -1;

//=============================================================================
// Live ranges

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct LiveRange {
  pub start: i32,
  pub end: i32,
}

impl LiveRange {
  pub fn new(start: i32, end: i32) -> Self {
    Self { start, end }
  }

  pub fn empty() -> Self {
    Self { start: -1, end: -1 }
  }

  pub fn is_empty(&self) -> bool {
    self.start == -1 && self.end == -1
  }

  /// Closed intervals; touching ends overlap.
  pub fn overlaps(&self, other: &LiveRange) -> bool {
    self.end >= other.start && self.start <= other.end
  }

  pub fn len(&self) -> i32 {
    self.end - self.start
  }
}

impl fmt::Debug for LiveRange {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "[{}, {}]", self.start, self.end)
  }
}

/// How a read consumes the value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UseKind {
  Unspecified,
  Export,
}

//=============================================================================
// Per-register access accumulator

pub struct RegisterCompAccess {
  first_write: i32,
  last_write: i32,
  first_read: i32,
  last_read: i32,
  first_write_scope: Option<ScopeIx>,
  first_read_scope: Option<ScopeIx>,
  last_read_scope: Option<ScopeIx>,
  conditionality_in_loop_id: i32,
  if_scope_write_flags: u32,
  next_ifelse_nesting_depth: u32,
  current_unpaired_if_write_scope: Option<ScopeIx>,
  was_written_in_current_else_scope: bool,
  alu_block_id: i32,
  use_export: bool,
}

impl RegisterCompAccess {
  pub fn new() -> Self {
    Self {
      first_write: -1,
      last_write: -1,
      first_read: i32::MAX,
      last_read: -1,
      first_write_scope: None,
      first_read_scope: None,
      last_read_scope: None,
      conditionality_in_loop_id: CONDITIONALITY_UNTOUCHED,
      if_scope_write_flags: 0,
      next_ifelse_nesting_depth: 0,
      current_unpaired_if_write_scope: None,
      was_written_in_current_else_scope: false,
      alu_block_id: BLOCK_ID_UNINITIALIZED,
      use_export: false,
    }
  }

  fn update_block(&mut self, block: i32) {
    if self.alu_block_id == BLOCK_ID_UNINITIALIZED {
      self.alu_block_id = block;
    } else if self.alu_block_id != block {
      self.alu_block_id = BLOCK_ID_NOT_UNIQUE;
    }
  }

  /// Every access happened in one ALU clause.
  pub fn is_alu_clause_local(&self) -> bool {
    self.alu_block_id >= 0
  }

  pub fn record_read(
    &mut self, t: &ScopeTree, block: i32, line: i32, scope: ScopeIx, use_kind: UseKind,
  ) {
    self.update_block(block);
    if use_kind == UseKind::Export {
      self.use_export = true;
    }
    self.last_read_scope = Some(scope);
    if self.last_read < line {
      self.last_read = line;
    }
    if self.first_read > line {
      self.first_read = line;
      self.first_read_scope = Some(scope);
    }

    if self.conditionality_in_loop_id == WRITE_IS_UNCONDITIONAL
      || self.conditionality_in_loop_id == WRITE_IS_CONDITIONAL
    {
      return;
    }

    // A read in a branch inside a loop, before any write that dominates
    // it, sees the value of the previous iteration.
    let ifelse_scope = match t.in_ifelse_scope(scope) {
      Some(s) => s,
      None => return,
    };
    let enclosing_loop = match t.innermost_loop(ifelse_scope) {
      Some(l) => l,
      None => return,
    };
    if self.conditionality_in_loop_id == t.id(enclosing_loop) {
      return;
    }
    if let Some(unpaired) = self.current_unpaired_if_write_scope {
      if t.is_child_of(scope, unpaired) {
        return;
      }
      if t.kind(ifelse_scope) == ScopeKind::If {
        if t.id(unpaired) == t.id(scope) {
          return;
        }
      } else if self.was_written_in_current_else_scope {
        return;
      }
    }
    self.conditionality_in_loop_id = WRITE_IS_CONDITIONAL;
  }

  pub fn record_write(&mut self, t: &ScopeTree, block: i32, line: i32, scope: ScopeIx) {
    self.update_block(block);
    self.last_write = line;

    if self.first_write < 0 {
      self.first_write = line;
      self.first_write_scope = Some(scope);
      // Not in a branch, or a branch not in a loop: dominates everything
      // that follows.
      let in_loop_branch = t
        .enclosing_conditional(scope)
        .map_or(false, |c| t.innermost_loop(c).is_some());
      if !in_loop_branch {
        self.conditionality_in_loop_id = WRITE_IS_UNCONDITIONAL;
      }
    }

    if self.conditionality_in_loop_id == WRITE_IS_UNCONDITIONAL
      || self.conditionality_in_loop_id == WRITE_IS_CONDITIONAL
    {
      return;
    }

    if self.next_ifelse_nesting_depth >= SUPPORTED_IFELSE_NESTING_DEPTH {
      self.conditionality_in_loop_id = WRITE_IS_CONDITIONAL;
      return;
    }

    if let Some(ifelse) = t.in_ifelse_scope(scope) {
      if let Some(l) = t.innermost_loop(ifelse) {
        if t.id(l) != self.conditionality_in_loop_id {
          self.record_ifelse_write(t, ifelse);
        }
      }
    }
  }

  fn record_ifelse_write(&mut self, t: &ScopeTree, scope: ScopeIx) {
    if t.kind(scope) == ScopeKind::If {
      self.conditionality_in_loop_id = CONDITIONALITY_UNRESOLVED;
      self.was_written_in_current_else_scope = false;
      self.record_if_write(t, scope);
    } else {
      self.was_written_in_current_else_scope = true;
      self.record_else_write(t, scope);
    }
  }

  fn record_if_write(&mut self, t: &ScopeTree, scope: ScopeIx) {
    // Only the first write of an if branch counts, and a write in a branch
    // nested in the else of the last unpaired if, which decides the outer
    // pair.
    let record = match self.current_unpaired_if_write_scope {
      None => true,
      Some(u) => t.id(u) != t.id(scope) && t.is_child_of_ifelse_id_sibling(scope, u),
    };
    if record {
      self.if_scope_write_flags |= 1 << self.next_ifelse_nesting_depth;
      self.current_unpaired_if_write_scope = Some(scope);
      self.next_ifelse_nesting_depth += 1;
    }
  }

  fn record_else_write(&mut self, t: &ScopeTree, scope: ScopeIx) {
    let paired = match self.current_unpaired_if_write_scope {
      Some(u) if self.next_ifelse_nesting_depth > 0 => {
        let mask = 1 << (self.next_ifelse_nesting_depth - 1);
        self.if_scope_write_flags & mask != 0 && t.id(scope) == t.id(u)
      }
      _ => false,
    };
    if !paired {
      // The sibling if branch didn't write.
      self.conditionality_in_loop_id = WRITE_IS_CONDITIONAL;
      return;
    }

    self.next_ifelse_nesting_depth -= 1;
    self.if_scope_write_flags &= !(1 << self.next_ifelse_nesting_depth);

    // Both branches wrote.  If this pair sits in the else branch of an
    // outer pair whose if branch wrote too, that outer pair is next.
    let parent_ifelse = t.in_parent_ifelse_scope(scope);
    let outer_pending = self.next_ifelse_nesting_depth > 0
      && self.if_scope_write_flags & (1 << (self.next_ifelse_nesting_depth - 1)) != 0;
    self.current_unpaired_if_write_scope = if outer_pending { parent_ifelse } else { None };

    self.first_write_scope = t.parent(scope);

    match parent_ifelse {
      Some(p) if t.is_in_loop(p) => self.record_ifelse_write(t, p),
      _ => {
        self.conditionality_in_loop_id =
          t.innermost_loop(scope).map_or(WRITE_IS_UNCONDITIONAL, |l| t.id(l));
      }
    }
  }

  fn conditional_ifelse_write_in_loop(&self) -> bool {
    self.conditionality_in_loop_id <= CONDITIONALITY_UNRESOLVED
  }

  fn propagate_live_range_to_dominant_write_scope(&mut self, t: &ScopeTree) {
    if let Some(s) = self.first_write_scope {
      self.first_write = t.begin(s);
      let lr = t.end(s);
      if self.last_read < lr {
        self.last_read = lr;
      }
    }
  }

  /// The smallest interval over which the value must be kept.
  pub fn get_required_live_range(&mut self, t: &ScopeTree) -> LiveRange {
    if self.last_write < 0 {
      return LiveRange::empty();
    }
    let mut first_write_scope = match self.first_write_scope {
      Some(s) => s,
      None => return LiveRange::empty(),
    };
    let mut last_read_scope = match self.last_read_scope {
      Some(s) => s,
      None => return LiveRange::new(self.first_write, self.last_write + 1),
    };
    let first_read_scope = self.first_read_scope.unwrap_or(last_read_scope);

    let mut keep_for_full_loop = false;
    let mut enclosing_scope_first_read = first_read_scope;
    let mut enclosing_scope_first_write = first_write_scope;

    // Read before written in a loop: the value must survive the loop.
    if self.first_read <= self.first_write && t.is_in_loop(first_read_scope) {
      keep_for_full_loop = true;
      if let Some(l) = t.outermost_loop(first_read_scope) {
        enclosing_scope_first_read = l;
      }
    }

    // A conditional write in a loop, read outside its branch, must survive
    // the outermost loop.
    if let Some(conditional) = t.enclosing_conditional(enclosing_scope_first_write) {
      if !t.contains_range_of(conditional, last_read_scope)
        && (t.is_switchcase_scope_in_loop(conditional) || self.conditional_ifelse_write_in_loop())
      {
        if let Some(l) = t.outermost_loop(conditional) {
          keep_for_full_loop = true;
          enclosing_scope_first_write = l;
        }
      }
    }

    // The innermost scope containing first write, first read and last read.
    let mut enclosing_scope = enclosing_scope_first_read;
    if t.contains_range_of(enclosing_scope_first_write, enclosing_scope) {
      enclosing_scope = enclosing_scope_first_write;
    }
    if t.contains_range_of(last_read_scope, enclosing_scope) {
      enclosing_scope = last_read_scope;
    }
    while !t.contains_range_of(enclosing_scope, enclosing_scope_first_write)
      || !t.contains_range_of(enclosing_scope, last_read_scope)
    {
      match t.parent(enclosing_scope) {
        Some(p) => enclosing_scope = p,
        None => break,
      }
    }

    // Lift the last read up to the common scope.  Leaving a loop means the
    // value is read again on the next iteration.
    while t.depth(enclosing_scope) < t.depth(last_read_scope) {
      if t.is_loop(last_read_scope) {
        self.last_read = t.end(last_read_scope);
      }
      match t.parent(last_read_scope) {
        Some(p) => last_read_scope = p,
        None => break,
      }
    }

    if keep_for_full_loop && t.is_loop(first_write_scope) {
      self.first_write_scope = Some(first_write_scope);
      self.propagate_live_range_to_dominant_write_scope(t);
    }

    // Lift the dominant write up to the common scope.
    while t.depth(enclosing_scope) < t.depth(first_write_scope) {
      // A write behind a break only happens on some iterations.
      if t.loop_break_line(first_write_scope) < self.first_write {
        keep_for_full_loop = true;
        self.first_write_scope = Some(first_write_scope);
        self.propagate_live_range_to_dominant_write_scope(t);
      }
      match t.parent(first_write_scope) {
        Some(p) => first_write_scope = p,
        None => break,
      }
      if keep_for_full_loop && t.is_loop(first_write_scope) {
        self.first_write_scope = Some(first_write_scope);
        self.propagate_live_range_to_dominant_write_scope(t);
      }
    }
    self.first_write_scope = Some(first_write_scope);

    // A write past the last read is dead, but the register still may not
    // be reused before it happens.
    if self.last_write >= self.last_read {
      self.last_read = self.last_write + 1;
    }

    LiveRange::new(self.first_write, self.last_read)
  }
}

impl Default for RegisterCompAccess {
  fn default() -> Self {
    Self::new()
  }
}

//=============================================================================
// The live range map

#[derive(Clone, Debug)]
pub struct LiveRangeEntry {
  pub register: ValueIx,
  pub range: LiveRange,
  /// -1 until allocated.
  pub color: i32,
  pub use_export: bool,
  pub clause_local: bool,
}

/// One row of entries per channel, ordered by select.
pub struct LiveRangeMap {
  channels: [Vec<LiveRangeEntry>; NUM_CHANNELS],
  index: Map<ValueIx, (Chan, usize)>,
  finalized: bool,
}

impl LiveRangeMap {
  pub fn new() -> Self {
    Self {
      channels: [vec![], vec![], vec![], vec![]],
      index: Map::default(),
      finalized: false,
    }
  }

  pub fn component(&self, chan: Chan) -> &[LiveRangeEntry] {
    &self.channels[chan as usize]
  }

  pub fn component_mut(&mut self, chan: Chan) -> &mut [LiveRangeEntry] {
    &mut self.channels[chan as usize]
  }

  pub fn lookup(&self, v: ValueIx) -> Option<&LiveRangeEntry> {
    self.index.get(&v).map(|(c, i)| &self.channels[*c as usize][*i])
  }

  pub fn position(&self, v: ValueIx) -> Option<(Chan, usize)> {
    self.index.get(&v).cloned()
  }

  pub fn is_finalized(&self) -> bool {
    self.finalized
  }

  pub fn len(&self) -> usize {
    self.channels.iter().map(|c| c.len()).sum()
  }

  /// Every register and array element of the shader, each in the row of
  /// its channel, with empty ranges.
  fn for_shader(shader: &Shader) -> Self {
    let vf = &shader.vf;
    let mut map = Self::new();
    let mut gprs: Vec<ValueIx> = vf
      .values()
      .indices()
      .filter(|v| {
        let value = vf.value(*v);
        match value.kind {
          ValueKind::Register { .. } => (value.chan as usize) < NUM_CHANNELS,
          // Indirect accesses are accounted to the direct elements.
          ValueKind::ArrayElement { addr: None, .. } => true,
          _ => false,
        }
      })
      .collect();
    gprs.sort_by_key(|v| (vf.value(*v).sel, *v));
    for v in gprs {
      let chan = vf.value(v).chan;
      let row = &mut map.channels[chan as usize];
      map.index.insert(v, (chan, row.len()));
      row.push(LiveRangeEntry {
        register: v,
        range: LiveRange::empty(),
        color: -1,
        use_export: false,
        clause_local: false,
      });
    }
    map
  }
}

impl Default for LiveRangeMap {
  fn default() -> Self {
    Self::new()
  }
}

//=============================================================================
// The evaluator

struct LiveRangeEvaluator<'a> {
  shader: &'a Shader,
  scopes: ScopeTree,
  current: ScopeIx,
  line: i32,
  if_id: i32,
  loop_id: i32,
  switch_id: i32,
  access: Map<ValueIx, RegisterCompAccess>,
}

impl<'a> LiveRangeEvaluator<'a> {
  fn new(shader: &'a Shader) -> Self {
    let scopes = ScopeTree::new();
    let current = scopes.outer();
    Self {
      shader,
      scopes,
      current,
      line: 0,
      if_id: 1,
      loop_id: 1,
      switch_id: 1,
      access: Map::default(),
    }
  }

  /// The accesses a value stands for: itself, or for an indirect array
  /// element, every element of its channel.
  fn targets(&self, v: ValueIx) -> Vec<ValueIx> {
    let vf = &self.shader.vf;
    let value = vf.value(v);
    match value.kind {
      ValueKind::Register { .. } if (value.chan as usize) < NUM_CHANNELS => vec![v],
      ValueKind::ArrayElement { array, addr: Some(_), .. } => {
        let arr = vf.array(array);
        if arr.covers_chan(value.chan) {
          arr.elements_in_chan(value.chan).to_vec()
        } else {
          vec![]
        }
      }
      ValueKind::ArrayElement { .. } => vec![v],
      _ => vec![],
    }
  }

  /// Address registers of indirect operands are recorded by the caller,
  /// they come with the instruction's reads.
  fn record_read(&mut self, block: i32, v: ValueIx, use_kind: UseKind) {
    let (line, scope) = (self.line, self.current);
    for r in self.targets(v) {
      let t = &self.scopes;
      self.access.entry(r).or_insert_with(RegisterCompAccess::new).record_read(
        t, block, line, scope, use_kind,
      );
    }
  }

  fn record_write(&mut self, block: i32, v: ValueIx) {
    let (line, scope) = (self.line, self.current);
    for r in self.targets(v) {
      let t = &self.scopes;
      self.access.entry(r).or_insert_with(RegisterCompAccess::new).record_write(
        t, block, line, scope,
      );
    }
  }

  fn push_scope(&mut self, kind: ScopeKind, id: i32, begin: i32) {
    let depth = self.scopes.depth(self.current) + 1;
    self.current = self.scopes.create(self.current, kind, id, depth, begin);
    trace!("scope: enter {:?}", self.scopes.get(self.current));
  }

  fn pop_scope(&mut self) {
    if let Some(p) = self.scopes.parent(self.current) {
      self.current = p;
    }
  }

  fn is_case(&self, s: ScopeIx) -> bool {
    match self.scopes.kind(s) {
      ScopeKind::SwitchCase | ScopeKind::SwitchDefault => true,
      _ => false,
    }
  }

  fn do_break(&mut self) {
    if self.scopes.break_is_for_switchcase(self.current) {
      let line = self.line;
      self.scopes.set_end(self.current, line - 1);
    } else {
      self.do_loop_exit();
    }
  }

  /// `continue` and predicated exits leave the innermost loop even from
  /// inside a switch case.
  fn do_loop_exit(&mut self) {
    let line = self.line;
    self.scopes.set_loop_break_line(self.current, line);
  }

  fn visit_cf(&mut self, cf: &CfInstr) {
    let line = self.line;
    match cf {
      CfInstr::If(_) => {
        let id = self.if_id;
        self.if_id += 1;
        self.push_scope(ScopeKind::If, id, line + 1);
      }
      CfInstr::Else => {
        let (id, depth) = (self.scopes.id(self.current), self.scopes.depth(self.current));
        self.scopes.set_end(self.current, line - 1);
        let parent = self.scopes.parent(self.current).unwrap_or_else(|| self.scopes.outer());
        self.current = self.scopes.create(parent, ScopeKind::Else, id, depth, line + 1);
      }
      CfInstr::EndIf => {
        self.scopes.set_end(self.current, line - 1);
        self.pop_scope();
      }
      CfInstr::LoopBegin => {
        let id = self.loop_id;
        self.loop_id += 1;
        self.push_scope(ScopeKind::Loop, id, line);
      }
      CfInstr::LoopEnd => {
        self.scopes.set_end(self.current, line);
        self.pop_scope();
      }
      CfInstr::Break => self.do_break(),
      CfInstr::Continue => self.do_loop_exit(),
      CfInstr::Switch(_) => {
        let id = self.switch_id;
        self.switch_id += 1;
        self.push_scope(ScopeKind::SwitchBody, id, line);
      }
      CfInstr::Case(_) | CfInstr::Default => {
        let kind = if *cf == CfInstr::Default { ScopeKind::SwitchDefault } else { ScopeKind::SwitchCase };
        if self.is_case(self.current) {
          // Fall through from the previous case.
          self.scopes.set_end(self.current, line - 1);
          self.pop_scope();
        }
        let id = self.scopes.id(self.current);
        self.push_scope(kind, id, line);
      }
      CfInstr::EndSwitch => {
        if self.is_case(self.current) {
          self.scopes.set_end(self.current, line - 1);
          self.pop_scope();
        }
        self.scopes.set_end(self.current, line);
        self.pop_scope();
      }
    }
  }

  fn visit_alu_members(&mut self, members: &[InstIx], clause: i32) {
    let shader = self.shader;
    let vf = &shader.vf;
    for m in members {
      let instr = &shader.instrs[*m];
      if instr.is_dead() {
        continue;
      }
      for v in instr.kind.reads(vf) {
        self.record_read(clause, v, UseKind::Unspecified);
      }
    }
    for m in members {
      let instr = &shader.instrs[*m];
      if instr.is_dead() {
        continue;
      }
      for v in instr.kind.writes() {
        self.record_write(clause, v);
      }
    }
    let breaks = members.iter().any(|m| {
      shader.instrs[*m].kind.as_alu().map_or(false, |a| {
        a.cf == Some(AluCf::Break) || a.cf == Some(AluCf::Continue)
      })
    });
    if breaks {
      self.do_loop_exit();
    }
  }

  fn run(mut self) -> LiveRangeMap {
    let shader = self.shader;
    let vf = &shader.vf;

    // Inputs are written before the first instruction.
    for v in vf.registers() {
      if vf.value(v).is_input() {
        self.record_write(BLOCK_ID_NOT_UNIQUE, v);
      }
    }

    let mut clause = 0;
    let mut last_clause: Option<(i32, u32)> = None;
    for block in &shader.blocks {
      for ix in &block.items {
        let instr = &shader.instrs[*ix];
        if instr.is_dead() {
          continue;
        }
        self.line += 1;
        match &instr.kind {
          InstrKind::Group(g) => {
            let key = (block.id, g.clause);
            if last_clause != Some(key) {
              clause += 1;
              last_clause = Some(key);
            }
            self.visit_alu_members(&g.members(), clause);
          }
          InstrKind::Alu(_) => {
            let key = (block.id, u32::MAX);
            if last_clause != Some(key) {
              clause += 1;
              last_clause = Some(key);
            }
            self.visit_alu_members(&[*ix], clause);
          }
          other => {
            last_clause = None;
            let use_kind = match other {
              InstrKind::Export(_) => UseKind::Export,
              _ => UseKind::Unspecified,
            };
            for v in other.reads(vf) {
              self.record_read(BLOCK_ID_NOT_UNIQUE, v, use_kind);
            }
            for v in other.writes() {
              self.record_write(BLOCK_ID_NOT_UNIQUE, v);
            }
            if let InstrKind::ControlFlow(cf) = other {
              self.visit_cf(cf);
            }
          }
        }
      }
      last_clause = None;
    }
    self.line += 1;
    let end = self.line;
    self.scopes.close_all(end);
    debug!("live ranges: {} lines, {} scopes", end, self.scopes.len());

    let mut map = LiveRangeMap::for_shader(shader);
    let scopes = &self.scopes;
    for c in 0..NUM_CHANNELS as Chan {
      for entry in map.component_mut(c) {
        if let Some(acc) = self.access.get_mut(&entry.register) {
          entry.range = acc.get_required_live_range(scopes);
          entry.use_export = acc.use_export;
          entry.clause_local = acc.is_alu_clause_local();
          trace!(
            "live range {} = {:?}{}",
            vf.show(entry.register),
            entry.range,
            if entry.clause_local { " clause-local" } else { "" }
          );
        }
      }
    }
    map.finalized = true;
    map
  }
}

/// Compute the live range of every register of the shader.
pub fn evaluate(shader: &Shader) -> LiveRangeMap {
  info!("evaluate live ranges: begin");
  let map = LiveRangeEvaluator::new(shader).run();
  info!("evaluate live ranges: end, {} registers", map.len());
  map
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::instr::{AluInstr, ExportInstr, ExportKind, Src, VecReg};
  use crate::opcodes::AluOp;
  use crate::value::{InlineConstant, Pin};
  use crate::value_factory::{SourceKey, ValueFactory};

  struct Builder {
    sh: Shader,
    b: usize,
  }

  impl Builder {
    fn new() -> Self {
      let mut sh = Shader::new(ValueFactory::new());
      let b = sh.new_block();
      Self { sh, b }
    }

    fn var(&mut self, n: u32) -> ValueIx {
      self.sh.vf.dest_for(SourceKey::Var(n), 0, Pin::Chan)
    }

    fn ssa(&mut self, n: u32) -> ValueIx {
      self.sh.vf.dest_for(SourceKey::Ssa(n), 0, Pin::Chan)
    }

    fn one(&mut self) -> ValueIx {
      self.sh.vf.inline_constant(InlineConstant::One)
    }

    fn mov(&mut self, d: ValueIx, s: ValueIx) {
      let b = self.b;
      self.sh.emit(b, InstrKind::Alu(AluInstr::new(AluOp::Mov, Some(d), vec![Src::new(s)])));
    }

    fn cf(&mut self, c: CfInstr) {
      let b = self.b;
      self.sh.emit(b, InstrKind::ControlFlow(c));
    }

    fn break_if(&mut self, c: ValueIx) {
      let b = self.b;
      let zero = self.sh.vf.inline_constant(InlineConstant::Zero);
      let mut alu = AluInstr::without_dest(AluOp::PredSetNe, 0, vec![Src::new(c), Src::new(zero)]);
      alu.flags.update_exec = true;
      alu.flags.update_pred = true;
      alu.cf = Some(AluCf::Break);
      self.sh.emit(b, InstrKind::Alu(alu));
    }

    fn range(&self, v: ValueIx) -> LiveRange {
      let map = evaluate(&self.sh);
      map.lookup(v).unwrap().range
    }
  }

  #[test]
  fn straight_line_ranges() {
    let mut t = Builder::new();
    let (a, b, c) = (t.ssa(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(a, one); // 1
    t.mov(b, a); //   2
    t.mov(c, one); // 3
    let map = evaluate(&t.sh);
    assert_eq!(map.lookup(a).unwrap().range, LiveRange::new(1, 2));
    // Written, never read: one line wide.
    assert_eq!(map.lookup(b).unwrap().range, LiveRange::new(2, 3));
    assert_eq!(map.lookup(c).unwrap().range, LiveRange::new(3, 4));
  }

  #[test]
  fn read_only_register_has_empty_range() {
    let mut t = Builder::new();
    let (a, b) = (t.var(0), t.ssa(1));
    t.mov(b, a);
    let map = evaluate(&t.sh);
    assert!(map.lookup(a).unwrap().range.is_empty());
    assert!(map.is_finalized());
  }

  #[test]
  fn ifelse_writes_in_loop_resolve_to_unconditional() {
    let mut t = Builder::new();
    let (x, y, c) = (t.var(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(c, one); //            1
    t.cf(CfInstr::LoopBegin); // 2
    t.cf(CfInstr::If(c)); //     3
    t.mov(x, one); //            4
    t.cf(CfInstr::Else); //      5
    t.mov(x, c); //              6
    t.cf(CfInstr::EndIf); //     7
    t.mov(y, x); //              8
    t.cf(CfInstr::LoopEnd); //   9
    // The write is promoted to the loop scope and read in it; the value
    // doesn't need to survive the loop.
    let r = t.range(x);
    assert_eq!(r, LiveRange::new(4, 8));
  }

  #[test]
  fn ifelse_writes_in_loop_read_after_loop() {
    let mut t = Builder::new();
    let (x, y, c) = (t.var(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(c, one); //            1
    t.cf(CfInstr::LoopBegin); // 2
    t.cf(CfInstr::If(c)); //     3
    t.mov(x, one); //            4
    t.cf(CfInstr::Else); //      5
    t.mov(x, c); //              6
    t.cf(CfInstr::EndIf); //     7
    t.cf(CfInstr::LoopEnd); //   8
    t.mov(y, x); //              9
    let r = t.range(x);
    assert_eq!(r, LiveRange::new(4, 9));
  }

  #[test]
  fn conditional_write_in_loop_keeps_value_for_the_whole_loop() {
    let mut t = Builder::new();
    let (x, y, c) = (t.var(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(c, one); //            1
    t.cf(CfInstr::LoopBegin); // 2
    t.cf(CfInstr::If(c)); //     3
    t.mov(x, one); //            4
    t.cf(CfInstr::EndIf); //     5
    t.mov(y, x); //              6
    t.cf(CfInstr::LoopEnd); //   7
    let r = t.range(x);
    assert_eq!(r, LiveRange::new(2, 7));
  }

  #[test]
  fn nested_pairs_propagate_upwards() {
    let mut t = Builder::new();
    let (x, y, c) = (t.var(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(c, one); //            1
    t.cf(CfInstr::LoopBegin); // 2
    t.cf(CfInstr::If(c)); //     3
    t.cf(CfInstr::If(c)); //     4
    t.mov(x, one); //            5
    t.cf(CfInstr::Else); //      6
    t.mov(x, one); //            7
    t.cf(CfInstr::EndIf); //     8
    t.cf(CfInstr::Else); //      9
    t.cf(CfInstr::If(c)); //    10
    t.mov(x, one); //           11
    t.cf(CfInstr::Else); //     12
    t.mov(x, one); //           13
    t.cf(CfInstr::EndIf); //    14
    t.cf(CfInstr::EndIf); //    15
    t.cf(CfInstr::LoopEnd); //  16
    t.mov(y, x); //             17
    let r = t.range(x);
    assert_eq!(r, LiveRange::new(5, 17));
  }

  #[test]
  fn read_before_write_in_loop_spans_the_loop() {
    let mut t = Builder::new();
    let (x, y) = (t.var(0), t.ssa(1));
    let one = t.one();
    t.mov(x, one); //            1
    t.cf(CfInstr::LoopBegin); // 2
    t.mov(y, x); //              3
    t.mov(x, y); //              4
    t.cf(CfInstr::LoopEnd); //   5
    let r = t.range(x);
    assert_eq!(r, LiveRange::new(1, 5));
  }

  #[test]
  fn export_marks_use_and_breaks_clause_locality() {
    let mut t = Builder::new();
    let regs = t.sh.vf.temp_vec4(Pin::Group);
    let one = t.one();
    let (a, b) = (t.ssa(5), t.ssa(6));
    t.mov(a, one);
    t.mov(b, a);
    for r in regs.iter() {
      t.mov(*r, one);
    }
    let blk = t.b;
    t.sh.emit(
      blk,
      InstrKind::Export(ExportInstr {
        kind: ExportKind::Pixel,
        location: 0,
        value: VecReg::new(regs),
        last: true,
      }),
    );
    let map = evaluate(&t.sh);
    let e = map.lookup(regs[0]).unwrap();
    assert!(e.use_export);
    assert!(!e.clause_local);
    let la = map.lookup(a).unwrap();
    assert!(la.clause_local);
    assert!(!la.use_export);
  }

  #[test]
  fn switch_case_write_read_after_switch_in_loop() {
    let mut t = Builder::new();
    let (x, y, c) = (t.var(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(c, one); //              1
    t.cf(CfInstr::LoopBegin); //   2
    t.cf(CfInstr::Switch(c)); //   3
    t.cf(CfInstr::Case(0)); //     4
    t.mov(x, one); //              5
    t.cf(CfInstr::Break); //       6
    t.cf(CfInstr::Default); //     7
    t.cf(CfInstr::Break); //       8
    t.cf(CfInstr::EndSwitch); //   9
    t.mov(y, x); //               10
    t.cf(CfInstr::LoopEnd); //    11
    let r = t.range(x);
    assert_eq!(r, LiveRange::new(2, 11));
  }

  #[test]
  fn write_behind_a_break_survives_the_loop() {
    let mut t = Builder::new();
    let (x, y, c) = (t.var(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(c, one); //            1
    t.cf(CfInstr::LoopBegin); // 2
    t.cf(CfInstr::If(c)); //     3
    t.cf(CfInstr::Break); //     4
    t.cf(CfInstr::EndIf); //     5
    t.mov(x, one); //            6
    t.cf(CfInstr::LoopEnd); //   7
    t.mov(y, x); //              8
    assert_eq!(t.range(x), LiveRange::new(2, 8));
  }

  #[test]
  fn predicated_break_in_a_case_leaves_the_loop() {
    let mut t = Builder::new();
    let (x, y, c) = (t.var(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(c, one); //              1
    t.cf(CfInstr::LoopBegin); //   2
    t.cf(CfInstr::Switch(c)); //   3
    t.cf(CfInstr::Case(0)); //     4
    t.break_if(c); //              5
    t.cf(CfInstr::EndSwitch); //   6
    t.mov(x, one); //              7
    t.cf(CfInstr::LoopEnd); //     8
    t.mov(y, x); //                9
    assert_eq!(t.range(x), LiveRange::new(2, 9));
  }

  #[test]
  fn predicated_break_in_an_if_leaves_the_loop() {
    let mut t = Builder::new();
    let (x, y, c) = (t.var(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(c, one); //            1
    t.cf(CfInstr::LoopBegin); // 2
    t.cf(CfInstr::If(c)); //     3
    t.break_if(c); //            4
    t.cf(CfInstr::EndIf); //     5
    t.mov(x, one); //            6
    t.cf(CfInstr::LoopEnd); //   7
    t.mov(y, x); //              8
    assert_eq!(t.range(x), LiveRange::new(2, 8));
  }

  /// A chain of `levels` if/else pairs in a loop, each nested in the else
  /// branch of the previous one, with both branches of every pair writing
  /// x.  Returns the range of x and the line of the loop end.
  fn else_chain(levels: usize) -> (LiveRange, i32) {
    let mut t = Builder::new();
    let (x, y, c) = (t.var(0), t.ssa(1), t.ssa(2));
    let one = t.one();
    t.mov(c, one);
    t.cf(CfInstr::LoopBegin);
    for _ in 0..levels {
      t.cf(CfInstr::If(c));
      t.mov(x, one);
      t.cf(CfInstr::Else);
    }
    t.mov(x, c);
    for _ in 0..levels {
      t.cf(CfInstr::EndIf);
    }
    t.mov(y, x);
    t.cf(CfInstr::LoopEnd);
    let loop_end = 2 + 3 * levels as i32 + 1 + levels as i32 + 2;
    (t.range(x), loop_end)
  }

  #[test]
  fn shallow_ifelse_chain_is_an_unconditional_write() {
    let (r, loop_end) = else_chain(3);
    // From the first write to the read right before the loop end.
    assert_eq!(r, LiveRange::new(4, loop_end - 1));
  }

  #[test]
  fn too_deep_ifelse_chain_keeps_value_for_the_whole_loop() {
    let (r, loop_end) = else_chain(SUPPORTED_IFELSE_NESTING_DEPTH as usize + 1);
    assert_eq!(r, LiveRange::new(2, loop_end));
  }
}
