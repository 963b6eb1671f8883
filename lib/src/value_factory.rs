/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Creation and interning of operands.
//!
//! The factory maps upstream operand references onto values, hands out
//! virtual register selects (monotonically, never reusing one within a
//! compilation), interns literals, inline constants and uniforms, and lays
//! out local arrays.

use log::{debug, trace};
use std::cmp::Reverse;

use crate::data_structures::{ArrayIx, Map, TypedIxVec, ValueIx};
use crate::value::{
  chan_letter, Chan, InlineConstant, LocalArray, Pin, UseDef, Value, ValueKind, NUM_CHANNELS,
  VIRTUAL_BASE,
};

/// How the upstream IR names a value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKey {
  /// Single static assignment value.
  Ssa(u32),
  /// Mutable variable (written any number of times).
  Var(u32),
}

#[derive(Copy, Clone, Debug)]
struct ArrayRequest {
  source_id: u32,
  length: u32,
  ncomponents: u8,
}

pub struct ValueFactory {
  pub(crate) values: TypedIxVec<ValueIx, Value>,
  pub(crate) arrays: TypedIxVec<ArrayIx, LocalArray>,

  next_register_index: i32,
  /// One past the highest hardware register handed out directly.
  physical_end: i32,
  array_range: Option<(i32, i32)>,

  source_sels: Map<SourceKey, i32>,
  registers: Map<(i32, Chan), ValueIx>,
  literals: Map<u32, ValueIx>,
  inlines: Map<InlineConstant, ValueIx>,
  uniforms: Map<(u32, u32, Chan, Option<ValueIx>), ValueIx>,

  pending_arrays: Vec<ArrayRequest>,
  arrays_by_source: Map<u32, ArrayIx>,
  array_values: Map<(ArrayIx, u32, Chan, Option<ValueIx>), ValueIx>,
}

impl ValueFactory {
  pub fn new() -> Self {
    Self {
      values: TypedIxVec::new(),
      arrays: TypedIxVec::new(),
      next_register_index: VIRTUAL_BASE,
      physical_end: 0,
      array_range: None,
      source_sels: Map::default(),
      registers: Map::default(),
      literals: Map::default(),
      inlines: Map::default(),
      uniforms: Map::default(),
      pending_arrays: vec![],
      arrays_by_source: Map::default(),
      array_values: Map::default(),
    }
  }

  // Accessors.

  pub fn value(&self, v: ValueIx) -> &Value {
    &self.values[v]
  }

  pub fn value_mut(&mut self, v: ValueIx) -> &mut Value {
    &mut self.values[v]
  }

  pub fn values(&self) -> &TypedIxVec<ValueIx, Value> {
    &self.values
  }

  pub fn array(&self, a: ArrayIx) -> &LocalArray {
    &self.arrays[a]
  }

  pub fn arrays(&self) -> &TypedIxVec<ArrayIx, LocalArray> {
    &self.arrays
  }

  /// Selects occupied by local arrays, `[start, end)`.
  pub fn array_range(&self) -> Option<(i32, i32)> {
    self.array_range
  }

  /// All registers (not array elements) in creation order.
  pub fn registers(&self) -> impl Iterator<Item = ValueIx> + '_ {
    self.values.indices().filter(move |v| self.values[*v].is_register())
  }

  fn new_value(&mut self, sel: i32, chan: Chan, pin: Pin, kind: ValueKind) -> ValueIx {
    self.values.push(Value { sel, chan, pin, kind })
  }

  fn new_register(&mut self, sel: i32, chan: Chan, pin: Pin, ssa: bool) -> ValueIx {
    let v = self.new_value(
      sel,
      chan,
      pin,
      ValueKind::Register { usedef: UseDef::default(), ssa, input: false },
    );
    self.registers.insert((sel, chan), v);
    trace!("new register {:?} sel {} chan {} {:?}", v, sel, chan, pin);
    v
  }

  fn sel_for_source(&mut self, key: SourceKey) -> i32 {
    if let Some(sel) = self.source_sels.get(&key) {
      return *sel;
    }
    let sel = self.next_register_index;
    self.next_register_index += 1;
    self.source_sels.insert(key, sel);
    sel
  }

  /// The register holding channel `chan` of upstream value `key` as a source
  /// operand.  Reading something that was never defined creates it, which
  /// happens for variables carried around a loop.
  pub fn value_for(&mut self, key: SourceKey, chan: Chan) -> ValueIx {
    self.dest_for(key, chan, Pin::None)
  }

  /// The register receiving channel `chan` of upstream value `key`.
  /// Repeated calls return the same value; a pin request only ever
  /// tightens an unconstrained register.
  pub fn dest_for(&mut self, key: SourceKey, chan: Chan, pin: Pin) -> ValueIx {
    let sel = self.sel_for_source(key);
    if let Some(v) = self.registers.get(&(sel, chan)).cloned() {
      let value = &mut self.values[v];
      if value.pin == Pin::None && pin != Pin::None {
        value.pin = pin;
      }
      return v;
    }
    let ssa = match key {
      SourceKey::Ssa(_) => true,
      SourceKey::Var(_) => false,
    };
    self.new_register(sel, chan, pin, ssa)
  }

  /// A fresh virtual register that no upstream value maps to.
  pub fn temp_register(&mut self, chan: Chan, pin: Pin) -> ValueIx {
    let sel = self.next_register_index;
    self.next_register_index += 1;
    self.new_register(sel, chan, pin, true)
  }

  /// A fresh vec4 register group; returns the four channels.
  pub fn temp_vec4(&mut self, pin: Pin) -> [ValueIx; NUM_CHANNELS] {
    let sel = self.next_register_index;
    self.next_register_index += 1;
    let mut res = [ValueIx::new(0); NUM_CHANNELS];
    for (chan, slot) in res.iter_mut().enumerate() {
      *slot = self.new_register(sel, chan as Chan, pin, true);
    }
    res
  }

  /// Destination for a lane whose result nobody reads.
  pub fn dummy_dest(&mut self, chan: Chan) -> ValueIx {
    self.temp_register(chan, Pin::Chan)
  }

  /// Hardware register, e.g. a system value loaded before the program runs.
  pub fn physical(&mut self, sel: i32, chan: Chan, input: bool) -> ValueIx {
    debug_assert!(sel < VIRTUAL_BASE);
    if let Some(v) = self.registers.get(&(sel, chan)).cloned() {
      return v;
    }
    self.physical_end = self.physical_end.max(sel + 1);
    let v = self.new_value(
      sel,
      chan,
      Pin::Fully,
      ValueKind::Register { usedef: UseDef::default(), ssa: false, input },
    );
    self.registers.insert((sel, chan), v);
    v
  }

  /// Look up or create the register with exactly this select and channel.
  /// Used when rebuilding a shader from its textual form; `None` if the
  /// register exists with a different pin or SSA flag.
  pub fn register_at(&mut self, sel: i32, chan: Chan, pin: Pin, ssa: bool) -> Option<ValueIx> {
    if let Some(v) = self.registers.get(&(sel, chan)).cloned() {
      let value = &self.values[v];
      return if value.pin == pin && value.is_ssa() == ssa { Some(v) } else { None };
    }
    if sel >= VIRTUAL_BASE {
      self.next_register_index = self.next_register_index.max(sel + 1);
    } else {
      self.physical_end = self.physical_end.max(sel + 1);
    }
    Some(self.new_register(sel, chan, pin, ssa))
  }

  pub fn literal(&mut self, bits: u32) -> ValueIx {
    if let Some(v) = self.literals.get(&bits) {
      return *v;
    }
    let v = self.new_value(0, 0, Pin::None, ValueKind::Literal { bits });
    self.literals.insert(bits, v);
    v
  }

  pub fn inline_constant(&mut self, kind: InlineConstant) -> ValueIx {
    if let Some(v) = self.inlines.get(&kind) {
      return *v;
    }
    let v = self.new_value(0, 0, Pin::None, ValueKind::Inline(kind));
    self.inlines.insert(kind, v);
    v
  }

  /// Constant buffer `bank`, vec4 slot `index`, channel `chan`.
  pub fn uniform(
    &mut self, bank: u32, index: u32, chan: Chan, buf_addr: Option<ValueIx>,
  ) -> ValueIx {
    let key = (bank, index, chan, buf_addr);
    if let Some(v) = self.uniforms.get(&key) {
      return *v;
    }
    let v = self.new_value(
      index as i32,
      chan,
      Pin::Fully,
      ValueKind::Uniform { bank, index, buf_addr },
    );
    self.uniforms.insert(key, v);
    v
  }

  //===========================================================================
  // Arrays

  /// Queue an array for layout by `allocate_arrays`.
  pub fn request_array(&mut self, source_id: u32, length: u32, ncomponents: u8) {
    debug_assert!(ncomponents >= 1 && ncomponents as usize <= NUM_CHANNELS);
    debug_assert!(length >= 1);
    self.pending_arrays.push(ArrayRequest { source_id, length, ncomponents });
  }

  /// Lay out all requested arrays in hardware registers above the highest
  /// directly used one.  Wider, then longer arrays go first; an array shares
  /// the select range of the previous one when it fits in its remaining
  /// channels and is not longer.
  pub fn allocate_arrays(&mut self) {
    let mut requests = std::mem::take(&mut self.pending_arrays);
    requests.sort_by_key(|r| (Reverse(r.ncomponents), Reverse(r.length), r.source_id));

    let start = self.physical_end;
    let mut next_sel = start;
    let mut sel = next_sel;
    let mut free_components = 0u8;
    let mut group_length = 0u32;

    for r in requests {
      if r.ncomponents > free_components || r.length > group_length {
        sel = next_sel;
        next_sel += r.length as i32;
        free_components = NUM_CHANNELS as u8;
        group_length = r.length;
      }
      let frac = free_components - r.ncomponents;
      free_components -= r.ncomponents;

      let aix = self.arrays.push(LocalArray {
        base_sel: sel,
        size: r.length,
        nchannels: r.ncomponents,
        frac,
        elements: vec![],
      });
      let mut elements = Vec::with_capacity((r.length * r.ncomponents as u32) as usize);
      for c in 0..r.ncomponents {
        for offset in 0..r.length {
          let v = self.new_value(
            sel + offset as i32,
            frac + c,
            Pin::Array,
            ValueKind::ArrayElement { usedef: UseDef::default(), array: aix, offset, addr: None },
          );
          self.array_values.insert((aix, offset, frac + c, None), v);
          elements.push(v);
        }
      }
      self.arrays[aix].elements = elements;
      self.arrays_by_source.insert(r.source_id, aix);
      debug!(
        "array {} -> {:?}: sel {} len {} chans {}..{}",
        r.source_id,
        aix,
        sel,
        r.length,
        frac,
        frac + r.ncomponents
      );
    }

    if next_sel > start {
      self.array_range = Some((start, next_sel));
      self.physical_end = next_sel;
    }
  }

  pub fn array_for_source(&self, source_id: u32) -> Option<ArrayIx> {
    self.arrays_by_source.get(&source_id).cloned()
  }

  /// Element `offset` (plus `addr`, if indirect) of component `comp` of an
  /// array.  `None` if the element lies outside the array.
  pub fn array_element(
    &mut self, array: ArrayIx, offset: u32, comp: u8, addr: Option<ValueIx>,
  ) -> Option<ValueIx> {
    let (base_sel, size, nchannels, frac) = {
      let a = &self.arrays[array];
      (a.base_sel, a.size, a.nchannels, a.frac)
    };
    if offset >= size || comp >= nchannels {
      return None;
    }
    let chan = frac + comp;
    if let Some(v) = self.array_values.get(&(array, offset, chan, addr)) {
      return Some(*v);
    }
    let v = self.new_value(
      base_sel + offset as i32,
      chan,
      Pin::Array,
      ValueKind::ArrayElement { usedef: UseDef::default(), array, offset, addr },
    );
    self.array_values.insert((array, offset, chan, addr), v);
    Some(v)
  }

  /// Rebuild an array at a known location; used by the text parser.
  pub fn declare_array(&mut self, base_sel: i32, size: u32, chans: u8) -> ArrayIx {
    let frac = chans.trailing_zeros() as u8;
    let nchannels = chans.count_ones() as u8;
    let aix = self.arrays.push(LocalArray { base_sel, size, nchannels, frac, elements: vec![] });
    let mut elements = vec![];
    for c in 0..nchannels {
      for offset in 0..size {
        let v = self.new_value(
          base_sel + offset as i32,
          frac + c,
          Pin::Array,
          ValueKind::ArrayElement { usedef: UseDef::default(), array: aix, offset, addr: None },
        );
        self.array_values.insert((aix, offset, frac + c, None), v);
        elements.push(v);
      }
    }
    self.arrays[aix].elements = elements;
    let end = base_sel + size as i32;
    self.array_range = Some(match self.array_range {
      Some((s, e)) => (s.min(base_sel), e.max(end)),
      None => (base_sel, end),
    });
    self.physical_end = self.physical_end.max(end);
    aix
  }

  pub fn array_by_base(&self, base_sel: i32, chan: Chan) -> Option<ArrayIx> {
    self.arrays.indices().find(|a| {
      let arr = &self.arrays[*a];
      arr.base_sel == base_sel && arr.covers_chan(chan)
    })
  }

  /// Move an unpinned register to another channel.  Fails if the target
  /// channel of the select is already taken by another register.
  pub fn relocate_chan(&mut self, v: ValueIx, chan: Chan) -> bool {
    let (sel, old) = {
      let value = &self.values[v];
      if !value.is_register() || !value.pin.channel_is_free() {
        return false;
      }
      (value.sel, value.chan)
    };
    if old == chan {
      return true;
    }
    if self.registers.contains_key(&(sel, chan)) {
      return false;
    }
    self.registers.remove(&(sel, old));
    self.registers.insert((sel, chan), v);
    self.values[v].chan = chan;
    trace!("relocate {:?} sel {} from chan {} to {}", v, sel, old, chan);
    true
  }

  //===========================================================================
  // Printing

  /// Textual form of a value, as used in rendered programs.
  pub fn show(&self, v: ValueIx) -> String {
    let value = &self.values[v];
    let chan = chan_letter(value.chan);
    match &value.kind {
      ValueKind::Register { ssa, .. } => {
        let prefix = if !value.is_virtual() {
          'R'
        } else if *ssa {
          'S'
        } else {
          'V'
        };
        format!("{}{}.{}{}", prefix, value.sel, chan, value.pin.suffix())
      }
      ValueKind::ArrayElement { array, offset, addr, .. } => {
        let base = self.arrays[*array].base_sel;
        match addr {
          Some(a) => format!("A{}[{}+{}].{}", base, offset, self.show(*a), chan),
          None => format!("A{}[{}].{}", base, offset, chan),
        }
      }
      ValueKind::Literal { bits } => format!("L[0x{:x}]", bits),
      ValueKind::Inline(k) => format!("{}", k),
      ValueKind::Uniform { bank, index, buf_addr } => match buf_addr {
        Some(a) => format!("KC{}[{}+{}].{}", bank, index, self.show(*a), chan),
        None => format!("KC{}[{}].{}", bank, index, chan),
      },
    }
  }

  //===========================================================================
  // Structural comparison

  /// Do `a` here and `b` in `other` denote the same operand?  Compares
  /// select, channel, pin and payload, never use/def sets.
  pub fn same_value(&self, a: ValueIx, other: &ValueFactory, b: ValueIx) -> bool {
    let va = &self.values[a];
    let vb = &other.values[b];
    if va.sel != vb.sel || va.chan != vb.chan || va.pin != vb.pin {
      return false;
    }
    let same_addr = |x: Option<ValueIx>, y: Option<ValueIx>| match (x, y) {
      (None, None) => true,
      (Some(x), Some(y)) => self.same_value(x, other, y),
      _ => false,
    };
    match (&va.kind, &vb.kind) {
      (
        ValueKind::Register { ssa: s1, input: i1, .. },
        ValueKind::Register { ssa: s2, input: i2, .. },
      ) => s1 == s2 && i1 == i2,
      (
        ValueKind::ArrayElement { array: a1, offset: o1, addr: x1, .. },
        ValueKind::ArrayElement { array: a2, offset: o2, addr: x2, .. },
      ) => {
        self.arrays[*a1].base_sel == other.arrays[*a2].base_sel && o1 == o2 && same_addr(*x1, *x2)
      }
      (ValueKind::Literal { bits: b1 }, ValueKind::Literal { bits: b2 }) => b1 == b2,
      (ValueKind::Inline(k1), ValueKind::Inline(k2)) => k1 == k2,
      (
        ValueKind::Uniform { bank: k1, index: i1, buf_addr: x1 },
        ValueKind::Uniform { bank: k2, index: i2, buf_addr: x2 },
      ) => k1 == k2 && i1 == i2 && same_addr(*x1, *x2),
      _ => false,
    }
  }
}

impl Default for ValueFactory {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dest_for_is_stable() {
    let mut vf = ValueFactory::new();
    let a = vf.dest_for(SourceKey::Ssa(3), 1, Pin::None);
    let b = vf.dest_for(SourceKey::Ssa(3), 1, Pin::Chan);
    assert_eq!(a, b);
    assert_eq!(vf.value(a).pin, Pin::Chan);
    // Other channels of the same upstream value share the select.
    let c = vf.dest_for(SourceKey::Ssa(3), 2, Pin::None);
    assert_ne!(a, c);
    assert_eq!(vf.value(a).sel, vf.value(c).sel);
    assert!(vf.value(a).is_virtual());
    assert!(vf.value(a).is_ssa());
    let var = vf.value_for(SourceKey::Var(3), 0);
    assert!(!vf.value(var).is_ssa());
  }

  #[test]
  fn constants_are_interned() {
    let mut vf = ValueFactory::new();
    assert_eq!(vf.literal(0x3f80_0000), vf.literal(0x3f80_0000));
    assert_ne!(vf.literal(1), vf.literal(2));
    assert_eq!(vf.inline_constant(InlineConstant::One), vf.inline_constant(InlineConstant::One));
    assert_eq!(vf.uniform(0, 4, 2, None), vf.uniform(0, 4, 2, None));
  }

  #[test]
  fn virtual_ids_never_reused() {
    let mut vf = ValueFactory::new();
    let a = vf.temp_register(0, Pin::None);
    let b = vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let c = vf.temp_register(0, Pin::None);
    let sels = [vf.value(a).sel, vf.value(b).sel, vf.value(c).sel];
    assert!(sels[0] < sels[1] && sels[1] < sels[2]);
  }

  #[test]
  fn arrays_are_laid_out_before_registers() {
    let mut vf = ValueFactory::new();
    vf.request_array(7, 12, 2);
    let r = vf.dest_for(SourceKey::Var(1), 0, Pin::None);
    vf.allocate_arrays();
    let a = vf.array_for_source(7).unwrap();
    assert!(vf.array(a).base_sel < vf.value(r).sel);
    assert_eq!(vf.array_range(), Some((0, 12)));
  }

  #[test]
  fn arrays_pack_into_free_channels() {
    let mut vf = ValueFactory::new();
    vf.physical(0, 0, true);
    vf.request_array(1, 4, 1);
    vf.request_array(2, 8, 2);
    vf.request_array(3, 8, 1);
    vf.request_array(4, 2, 3);
    vf.allocate_arrays();
    let a1 = vf.array(vf.array_for_source(1).unwrap()).clone();
    let a2 = vf.array(vf.array_for_source(2).unwrap()).clone();
    let a3 = vf.array(vf.array_for_source(3).unwrap()).clone();
    let a4 = vf.array(vf.array_for_source(4).unwrap()).clone();
    // Widest first.  Channels are handed out from the top, so a4 takes yzw
    // and nothing else fits next to it.
    assert_eq!(a4.base_sel, 1);
    assert_eq!(a4.frac, 1);
    assert_eq!(a2.base_sel, 3);
    assert_eq!(a2.frac, 2);
    // a3 fits next to a2: same length, one free channel below.
    assert_eq!(a3.base_sel, 3);
    assert_eq!(a3.frac, 1);
    assert_eq!(a1.base_sel, 3);
    assert_eq!(a1.frac, 0);
    assert_eq!(vf.array_range(), Some((1, 11)));
  }

  #[test]
  fn values_print_in_text_form() {
    let mut vf = ValueFactory::new();
    let s = vf.dest_for(SourceKey::Ssa(0), 1, Pin::Group);
    let v = vf.value_for(SourceKey::Var(0), 3);
    let r = vf.physical(5, 0, true);
    assert_eq!(vf.show(s), "S1024.y@group");
    assert_eq!(vf.show(v), "V1025.w");
    assert_eq!(vf.show(r), "R5.x@fully");
    let lit = vf.literal(0x3f80_0000);
    assert_eq!(vf.show(lit), "L[0x3f800000]");
    let zero = vf.inline_constant(InlineConstant::Zero);
    assert_eq!(vf.show(zero), "I[ZERO]");
    let u = vf.uniform(1, 17, 2, Some(s));
    assert_eq!(vf.show(u), "KC1[17+S1024.y@group].z");
  }

  #[test]
  fn relocation_respects_taken_channels() {
    let mut vf = ValueFactory::new();
    let x = vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    vf.dest_for(SourceKey::Ssa(0), 1, Pin::None);
    assert!(!vf.relocate_chan(x, 1));
    assert!(vf.relocate_chan(x, 2));
    assert_eq!(vf.value(x).chan, 2);
    let pinned = vf.temp_register(0, Pin::Chan);
    assert!(!vf.relocate_chan(pinned, 1));
  }

  #[test]
  fn indirect_elements_are_distinct_values() {
    let mut vf = ValueFactory::new();
    vf.request_array(0, 4, 1);
    vf.allocate_arrays();
    let a = vf.array_for_source(0).unwrap();
    let idx = vf.dest_for(SourceKey::Ssa(9), 0, Pin::None);
    let direct = vf.array_element(a, 1, 0, None).unwrap();
    let indirect = vf.array_element(a, 1, 0, Some(idx)).unwrap();
    assert_ne!(direct, indirect);
    assert_eq!(vf.array_element(a, 1, 0, Some(idx)), Some(indirect));
    assert_eq!(vf.array_element(a, 4, 0, None), None);
  }
}
