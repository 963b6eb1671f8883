/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Per-channel interference graph over the entries of a [`LiveRangeMap`].
//!
//! Registers of different channels never compete for the same physical
//! slot, so each channel gets its own graph.  Row `i` of channel `c` lists
//! the entries of that channel whose live range overlaps entry `i`'s;
//! rows are kept symmetric.

use log::debug;

use crate::live_range::LiveRangeMap;
use crate::value::{Chan, NUM_CHANNELS};

pub struct Interference {
  rows: [Vec<Vec<usize>>; NUM_CHANNELS],
}

impl Interference {
  pub fn new(map: &LiveRangeMap) -> Self {
    let mut res = Self { rows: [vec![], vec![], vec![], vec![]] };
    let mut nedges = 0;
    for c in 0..NUM_CHANNELS as Chan {
      let entries = map.component(c);
      res.rows[c as usize] = vec![vec![]; entries.len()];
      for i in 0..entries.len() {
        if entries[i].range.is_empty() {
          continue;
        }
        for j in i + 1..entries.len() {
          if entries[j].range.is_empty() {
            continue;
          }
          if entries[i].range.overlaps(&entries[j].range) {
            res.add_edge(c, i, j);
            nedges += 1;
          }
        }
      }
    }
    debug!("interference: {} edges", nedges);
    res
  }

  pub fn add_edge(&mut self, chan: Chan, i: usize, j: usize) {
    let rows = &mut self.rows[chan as usize];
    if !rows[i].contains(&j) {
      rows[i].push(j);
    }
    if !rows[j].contains(&i) {
      rows[j].push(i);
    }
  }

  pub fn row(&self, chan: Chan, i: usize) -> &[usize] {
    &self.rows[chan as usize][i]
  }

  pub fn num_rows(&self, chan: Chan) -> usize {
    self.rows[chan as usize].len()
  }

  pub fn interferes(&self, chan: Chan, i: usize, j: usize) -> bool {
    self.rows[chan as usize][i].contains(&j)
  }

  /// Test helper: drop one direction of an edge.
  #[cfg(test)]
  pub(crate) fn remove_half_edge(&mut self, chan: Chan, i: usize, j: usize) {
    self.rows[chan as usize][i].retain(|x| *x != j);
  }
}
