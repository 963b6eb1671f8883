/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Checker: verifies a coloring against the interference graph it was
//! computed from, independently of how the allocator got there.
//!
//! Checked properties:
//!
//!   - the interference rows are symmetric,
//!   - no two interfering entries share a color,
//!   - every live entry got a color,
//!   - the channels of one grouped value share their color,
//!   - fully pinned and hardware registers kept their select.
//!
//! Pin modes are erased when the allocation is committed, so what has to
//! stay put is recorded in a [`PinnedSnapshot`] before coloring starts.

use log::debug;

use crate::data_structures::{Map, ValueIx};
use crate::interface::{CheckerError, CheckerErrors};
use crate::interference::Interference;
use crate::live_range::LiveRangeMap;
use crate::value::{Chan, Pin, NUM_CHANNELS};
use crate::value_factory::ValueFactory;

/// What the allocator must preserve, taken before allocation.
pub struct PinnedSnapshot {
  fixed: Vec<(ValueIx, i32)>,
  groups: Map<i32, Vec<ValueIx>>,
}

impl PinnedSnapshot {
  pub fn take(map: &LiveRangeMap, vf: &ValueFactory) -> Self {
    let mut fixed = vec![];
    let mut groups: Map<i32, Vec<ValueIx>> = Map::default();
    for c in 0..NUM_CHANNELS as Chan {
      for e in map.component(c) {
        let value = vf.value(e.register);
        if value.pin == Pin::Fully || !value.is_virtual() {
          fixed.push((e.register, value.sel));
        } else if value.pin == Pin::Group && !e.range.is_empty() {
          groups.entry(value.sel).or_insert_with(Vec::new).push(e.register);
        }
      }
    }
    Self { fixed, groups }
  }
}

pub fn check(
  map: &LiveRangeMap, interference: &Interference, snapshot: &PinnedSnapshot,
) -> Result<(), CheckerErrors> {
  let mut errors = vec![];

  for c in 0..NUM_CHANNELS as Chan {
    let row = map.component(c);
    for i in 0..row.len() {
      if !row[i].range.is_empty() && row[i].color < 0 {
        errors.push(CheckerError::Uncolored { chan: c, register: row[i].register });
      }
      for j in interference.row(c, i) {
        if !interference.interferes(c, *j, i) {
          errors.push(CheckerError::AsymmetricInterference {
            chan: c,
            a: row[i].register,
            b: row[*j].register,
          });
        }
        // Each pair once.
        if i < *j && row[i].color == row[*j].color {
          errors.push(CheckerError::SharedColor {
            chan: c,
            a: row[i].register,
            b: row[*j].register,
            color: row[i].color,
          });
        }
      }
    }
  }

  let mut sels: Vec<i32> = snapshot.groups.keys().cloned().collect();
  sels.sort_unstable();
  for sel in sels {
    let mut colors: Vec<i32> = snapshot.groups[&sel]
      .iter()
      .filter_map(|r| map.lookup(*r).map(|e| e.color))
      .collect();
    colors.sort_unstable();
    colors.dedup();
    if colors.len() > 1 {
      errors.push(CheckerError::SplitGroup { sel, colors });
    }
  }

  for (r, sel) in &snapshot.fixed {
    if let Some(e) = map.lookup(*r) {
      if e.color != *sel {
        errors.push(CheckerError::MovedFixedRegister { sel: *sel, color: e.color });
      }
    }
  }

  debug!("checker: {} errors", errors.len());
  if errors.is_empty() {
    Ok(())
  } else {
    Err(CheckerErrors { errors })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::coloring::color;
  use crate::instr::{AluInstr, InstrKind, Src};
  use crate::interface::RegisterBudget;
  use crate::live_range::evaluate;
  use crate::opcodes::AluOp;
  use crate::shader::Shader;
  use crate::value::InlineConstant;
  use crate::value_factory::SourceKey;

  fn overlapping_pair() -> (Shader, ValueIx, ValueIx) {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let a = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::Chan);
    let c = sh.vf.dest_for(SourceKey::Ssa(1), 0, Pin::Chan);
    let d = sh.vf.dest_for(SourceKey::Ssa(2), 0, Pin::Chan);
    let mov = |d, s| InstrKind::Alu(AluInstr::new(AluOp::Mov, Some(d), vec![Src::new(s)]));
    sh.emit(b, mov(a, one));
    sh.emit(b, mov(c, one));
    sh.emit(b, mov(d, a));
    sh.emit(b, mov(d, c));
    (sh, a, c)
  }

  #[test]
  fn accepts_a_real_coloring() {
    let (sh, _, _) = overlapping_pair();
    let mut map = evaluate(&sh);
    let ig = Interference::new(&map);
    let snap = PinnedSnapshot::take(&map, &sh.vf);
    color(&mut map, &ig, &sh.vf, &RegisterBudget::default()).unwrap();
    assert!(check(&map, &ig, &snap).is_ok());
  }

  #[test]
  fn flags_shared_colors_and_asymmetry() {
    let (sh, a, c) = overlapping_pair();
    let mut map = evaluate(&sh);
    let mut ig = Interference::new(&map);
    let snap = PinnedSnapshot::take(&map, &sh.vf);
    color(&mut map, &ig, &sh.vf, &RegisterBudget::default()).unwrap();
    let (_, ia) = map.position(a).unwrap();
    let (_, ic) = map.position(c).unwrap();
    let ca = map.component(0)[ia].color;
    map.component_mut(0)[ic].color = ca;
    ig.remove_half_edge(0, ic, ia);
    let errs = check(&map, &ig, &snap).unwrap_err();
    assert!(errs.errors.iter().any(|e| match e {
      CheckerError::SharedColor { .. } => true,
      _ => false,
    }));
    assert!(errs.errors.iter().any(|e| match e {
      CheckerError::AsymmetricInterference { .. } => true,
      _ => false,
    }));
  }
}
