/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Greedy graph coloring of the live range map.
//!
//! Order of business:
//!
//! 1. Registers that may not move (hardware registers, fully pinned values,
//!    array elements) keep their select as color.
//! 2. Grouped registers, all channels of one select at once, highest
//!    priority group first.
//! 3. Registers whose live range stays inside one ALU clause, longest range
//!    first, from the small clause-local pool.  A miss here is not fatal.
//! 4. Everything else, channel by channel, in ascending select order, from
//!    the general pool.
//!
//! Colors are only written back to the values by [`commit`].

use log::{debug, info, trace};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::data_structures::Map;
use crate::interface::{RegAllocError, RegisterBudget};
use crate::interference::Interference;
use crate::live_range::LiveRangeMap;
use crate::value::{Chan, Pin, ValueKind, NUM_CHANNELS};
use crate::value_factory::ValueFactory;

/// The colors available for general allocation, in the order tried.
struct ColorPool {
  end: i32,
  array_range: Option<(i32, i32)>,
}

impl ColorPool {
  fn contains(&self, color: i32) -> bool {
    match self.array_range {
      Some((s, e)) if color >= s && color < e => false,
      _ => color >= 0 && color < self.end,
    }
  }

  fn colors(&self) -> impl Iterator<Item = i32> + '_ {
    (0..self.end).filter(move |c| self.contains(*c))
  }
}

fn color_is_free(
  map: &LiveRangeMap, interference: &Interference, chan: Chan, idx: usize, color: i32,
) -> bool {
  let row = map.component(chan);
  interference.row(chan, idx).iter().all(|n| row[*n].color != color)
}

//=============================================================================
// Groups

#[derive(PartialEq, Eq)]
struct Group {
  sel: i32,
  members: [Option<usize>; NUM_CHANNELS],
  use_export: bool,
  start: i32,
}

impl Group {
  fn priority(&self) -> (bool, Reverse<i32>, Reverse<i32>) {
    (self.use_export, Reverse(self.start), Reverse(self.sel))
  }
}

impl Ord for Group {
  fn cmp(&self, other: &Self) -> Ordering {
    self.priority().cmp(&other.priority())
  }
}

impl PartialOrd for Group {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

fn collect_groups(map: &LiveRangeMap, vf: &ValueFactory) -> BinaryHeap<Group> {
  let mut by_sel: Map<i32, Group> = Map::default();
  for c in 0..NUM_CHANNELS as Chan {
    for (i, e) in map.component(c).iter().enumerate() {
      let value = vf.value(e.register);
      if e.color != -1 || value.pin != Pin::Group {
        continue;
      }
      let g = by_sel.entry(value.sel).or_insert_with(|| Group {
        sel: value.sel,
        members: [None; NUM_CHANNELS],
        use_export: false,
        start: i32::MAX,
      });
      g.members[c as usize] = Some(i);
      g.use_export |= e.use_export;
      if !e.range.is_empty() {
        g.start = g.start.min(e.range.start);
      }
    }
  }
  by_sel.into_iter().map(|(_, g)| g).collect()
}

fn group_allocation(
  map: &mut LiveRangeMap, interference: &Interference, pool: &ColorPool, group: &Group,
) -> Result<(), RegAllocError> {
  let members: Vec<(Chan, usize)> = (0..NUM_CHANNELS)
    .filter_map(|c| group.members[c].map(|i| (c as Chan, i)))
    .collect();
  for color in pool.colors() {
    let fits = members.iter().all(|(c, i)| {
      map.component(*c)[*i].range.is_empty() || color_is_free(map, interference, *c, *i, color)
    });
    if fits {
      for (c, i) in &members {
        map.component_mut(*c)[*i].color = color;
      }
      trace!("group {} -> {}", group.sel, color);
      return Ok(());
    }
  }
  let chan = members.first().map_or(0, |(c, _)| *c);
  Err(RegAllocError::OutOfRegisters { chan, sel: group.sel })
}

//=============================================================================
// Scalars

fn clause_local_allocation(
  map: &mut LiveRangeMap, interference: &Interference, budget: &RegisterBudget, chan: Chan,
) {
  let mut candidates: Vec<usize> = map
    .component(chan)
    .iter()
    .enumerate()
    .filter(|(_, e)| e.color == -1 && e.clause_local && !e.range.is_empty() && e.range.len() > 1)
    .map(|(i, _)| i)
    .collect();
  {
    let row = map.component(chan);
    candidates.sort_by_key(|i| (Reverse(row[*i].range.len()), *i));
  }
  for i in candidates {
    for color in budget.clause_local_start..budget.clause_local_end {
      if color_is_free(map, interference, chan, i, color) {
        map.component_mut(chan)[i].color = color;
        trace!("clause local chan {} entry {} -> {}", chan, i, color);
        break;
      }
    }
  }
}

fn scalar_allocation(
  map: &mut LiveRangeMap, interference: &Interference, pool: &ColorPool, vf: &ValueFactory,
  chan: Chan,
) -> Result<(), RegAllocError> {
  let first_color = pool.colors().next().unwrap_or(0);
  for i in 0..map.component(chan).len() {
    let entry = &map.component(chan)[i];
    if entry.color != -1 {
      continue;
    }
    if entry.range.is_empty() {
      map.component_mut(chan)[i].color = first_color;
      continue;
    }
    let color = pool.colors().find(|c| color_is_free(map, interference, chan, i, *c));
    match color {
      Some(color) => map.component_mut(chan)[i].color = color,
      None => {
        let sel = vf.value(map.component(chan)[i].register).sel;
        return Err(RegAllocError::OutOfRegisters { chan, sel });
      }
    }
  }
  Ok(())
}

//=============================================================================
// Top level

/// Color every entry of `map`.  On success each entry has a color in
/// `0..budget.clause_local_end`; nothing is written back yet.
pub fn color(
  map: &mut LiveRangeMap, interference: &Interference, vf: &ValueFactory,
  budget: &RegisterBudget,
) -> Result<(), RegAllocError> {
  info!("color: begin");
  if !map.is_finalized() {
    return Err(RegAllocError::PartialLiveRanges);
  }
  let pool = ColorPool { end: budget.registers_end, array_range: vf.array_range() };

  let mut nfixed = 0;
  for c in 0..NUM_CHANNELS as Chan {
    for e in map.component_mut(c) {
      let value = vf.value(e.register);
      let fixed = match value.pin {
        Pin::Fully | Pin::Array => true,
        _ => !value.is_virtual(),
      };
      if fixed {
        e.color = value.sel;
        nfixed += 1;
      }
    }
  }

  let mut groups = collect_groups(map, vf);
  debug!("color: {} fixed, {} groups", nfixed, groups.len());
  while let Some(g) = groups.pop() {
    group_allocation(map, interference, &pool, &g)?;
  }

  for c in 0..NUM_CHANNELS as Chan {
    clause_local_allocation(map, interference, budget, c);
  }
  for c in 0..NUM_CHANNELS as Chan {
    scalar_allocation(map, interference, &pool, vf, c)?;
  }
  info!("color: end");
  Ok(())
}

/// Write the colors back: registers take their color as select and lose
/// their pin and SSA marker.  Array elements stay where they are.
pub fn commit(map: &LiveRangeMap, vf: &mut ValueFactory) {
  for c in 0..NUM_CHANNELS as Chan {
    for e in map.component(c) {
      let value = vf.value_mut(e.register);
      if let ValueKind::Register { ssa, .. } = &mut value.kind {
        *ssa = false;
        value.sel = e.color;
        value.pin = Pin::None;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::instr::{AluInstr, InstrKind, Src};
  use crate::live_range::evaluate;
  use crate::opcodes::AluOp;
  use crate::shader::Shader;
  use crate::value::InlineConstant;
  use crate::value_factory::SourceKey;

  fn mov(d: crate::data_structures::ValueIx, s: crate::data_structures::ValueIx) -> InstrKind {
    InstrKind::Alu(AluInstr::new(AluOp::Mov, Some(d), vec![Src::new(s)]))
  }

  fn run(sh: &Shader, budget: &RegisterBudget) -> Result<LiveRangeMap, RegAllocError> {
    let mut map = evaluate(sh);
    let ig = Interference::new(&map);
    color(&mut map, &ig, &sh.vf, budget)?;
    Ok(map)
  }

  #[test]
  fn fully_pinned_register_keeps_its_select() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let hw = sh.vf.physical(5, 0, true);
    let mut regs = vec![];
    for n in 0..8 {
      let r = sh.vf.dest_for(SourceKey::Ssa(n), 0, Pin::Chan);
      sh.emit(b, mov(r, one));
      regs.push(r);
    }
    let sink = sh.vf.dest_for(SourceKey::Ssa(100), 0, Pin::Chan);
    for r in &regs {
      sh.emit(b, mov(sink, *r));
    }
    sh.emit(b, mov(sink, hw));
    let map = run(&sh, &RegisterBudget::default()).unwrap();
    assert_eq!(map.lookup(hw).unwrap().color, 5);
    for r in &regs {
      assert_ne!(map.lookup(*r).unwrap().color, 5);
    }
  }

  #[test]
  fn group_shares_one_color() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let blocker = sh.vf.physical(0, 2, true);
    let vec = sh.vf.temp_vec4(Pin::Group);
    for r in vec.iter() {
      sh.emit(b, mov(*r, one));
    }
    let sink = sh.vf.dest_for(SourceKey::Ssa(1), 2, Pin::Chan);
    sh.emit(b, mov(sink, blocker));
    for r in vec.iter() {
      let d = sh.vf.temp_register(0, Pin::Chan);
      sh.emit(b, mov(d, *r));
    }
    let map = run(&sh, &RegisterBudget::default()).unwrap();
    let colors: Vec<i32> = vec.iter().map(|r| map.lookup(*r).unwrap().color).collect();
    assert!(colors.iter().all(|c| *c == colors[0]));
    // R0.z is live across the group's z channel.
    assert_eq!(map.lookup(blocker).unwrap().color, 0);
    assert_eq!(colors[0], 1);
  }

  #[test]
  fn exhausting_the_pool_fails() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let mut regs = vec![];
    for n in 0..3 {
      let r = sh.vf.dest_for(SourceKey::Ssa(n), 0, Pin::Chan);
      sh.emit(b, mov(r, one));
      regs.push(r);
    }
    let sink = sh.vf.dest_for(SourceKey::Ssa(10), 0, Pin::Chan);
    for r in &regs {
      sh.emit(b, mov(sink, *r));
    }
    let budget = RegisterBudget {
      registers_end: 2,
      clause_local_start: 2,
      clause_local_end: 2,
      ..RegisterBudget::default()
    };
    match run(&sh, &budget) {
      Err(RegAllocError::OutOfRegisters { chan: 0, .. }) => {}
      other => panic!("unexpected {:?}", other.map(|_| ())),
    }
  }

  #[test]
  fn clause_local_registers_use_the_reserved_pool() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let a = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::Chan);
    let t = sh.vf.dest_for(SourceKey::Ssa(1), 1, Pin::Chan);
    let c = sh.vf.dest_for(SourceKey::Ssa(2), 0, Pin::Chan);
    sh.emit(b, mov(a, one)); // 1
    sh.emit(b, mov(t, one)); // 2
    sh.emit(b, mov(c, a)); //   3
    let budget = RegisterBudget::default();
    let map = run(&sh, &budget).unwrap();
    let ca = map.lookup(a).unwrap().color;
    assert!(ca >= budget.clause_local_start && ca < budget.clause_local_end);
    // Written only, one line wide: general pool.
    assert_eq!(map.lookup(c).unwrap().color, 0);
  }

  #[test]
  fn arrays_come_before_registers() {
    let mut vf = ValueFactory::new();
    vf.request_array(0, 12, 2);
    vf.allocate_arrays();
    let arr = vf.array_for_source(0).unwrap();
    let mut sh = Shader::new(vf);
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let e = sh.vf.array_element(arr, 3, 0, None).unwrap();
    let r = sh.vf.dest_for(SourceKey::Ssa(0), 2, Pin::Chan);
    sh.emit(b, mov(e, one));
    sh.emit(b, mov(r, e));
    let map = run(&sh, &RegisterBudget::default()).unwrap();
    let base = sh.vf.array(arr).base_sel;
    assert_eq!(base, 0);
    assert_eq!(map.lookup(e).unwrap().color, 3);
    assert!(map.lookup(r).unwrap().color > base);
    assert!(map.lookup(r).unwrap().color >= 12);
  }

  #[test]
  fn commit_writes_colors_back() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let a = sh.vf.dest_for(SourceKey::Ssa(0), 1, Pin::Chan);
    let c = sh.vf.dest_for(SourceKey::Ssa(1), 1, Pin::Chan);
    sh.emit(b, mov(a, one));
    sh.emit(b, mov(c, a));
    let map = run(&sh, &RegisterBudget::default()).unwrap();
    commit(&map, &mut sh.vf);
    let v = sh.vf.value(a);
    assert_eq!(v.sel, map.lookup(a).unwrap().color);
    assert!(!v.is_ssa());
    assert_eq!(v.pin, Pin::None);
    assert_eq!(sh.vf.show(c), format!("R{}.y", map.lookup(c).unwrap().color));
  }
}
