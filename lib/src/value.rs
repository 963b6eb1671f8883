/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The operand model: registers, array elements, literals, inline constants
//! and constant-buffer references.
//!
//! Every operand is a [`Value`] living in the value arena of a
//! [`ValueFactory`](crate::value_factory::ValueFactory).  A value carries a
//! register select (`sel`), a channel and a pin mode; the variant-specific
//! payload lives in [`ValueKind`].  Registers additionally keep the sets of
//! instructions that write (`parents`) and read (`uses`) them, which drive
//! readiness during bundling and dead-code propagation.

use std::fmt;

use crate::data_structures::{ArrayIx, InstIx, Set, TypedIxVec, ValueIx};
use crate::instr::Instr;

/// Selects at or above this are virtual and get a color from the allocator;
/// anything below is a hardware register and is never re-colored.
pub const VIRTUAL_BASE: i32 = 1024;

/// Register channel.  0..=3 are x, y, z, w.
pub type Chan = u8;

/// Channel sentinel for "no channel" / masked-out component.
pub const CHAN_MASKED: Chan = 7;

pub const NUM_CHANNELS: usize = 4;

pub fn chan_letter(chan: Chan) -> char {
  match chan {
    0 => 'x',
    1 => 'y',
    2 => 'z',
    3 => 'w',
    _ => '_',
  }
}

pub fn chan_from_letter(c: char) -> Option<Chan> {
  match c {
    'x' => Some(0),
    'y' => Some(1),
    'z' => Some(2),
    'w' => Some(3),
    '_' => Some(CHAN_MASKED),
    _ => None,
  }
}

/// Placement constraint of a value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Pin {
  /// Channel and select are both up for grabs.
  None,
  /// The channel is fixed, the select is not.
  Chan,
  /// Must share one 4-channel register with its siblings of the same select.
  Group,
  /// Hardware slot; neither select nor channel may change.
  Fully,
  /// Element of a pre-allocated local array.
  Array,
}

impl Pin {
  pub fn suffix(self) -> &'static str {
    match self {
      Pin::None => "",
      Pin::Chan => "@chan",
      Pin::Group => "@group",
      Pin::Fully => "@fully",
      Pin::Array => "@array",
    }
  }

  pub fn from_suffix(s: &str) -> Option<Pin> {
    match s {
      "chan" => Some(Pin::Chan),
      "group" => Some(Pin::Group),
      "fully" => Some(Pin::Fully),
      "array" => Some(Pin::Array),
      _ => None,
    }
  }

  /// May the channel of a value with this pin be changed by the bundler?
  pub fn channel_is_free(self) -> bool {
    self == Pin::None
  }
}

//=============================================================================
// Inline constants

/// Well-known operands that the ALU can read without a register or a literal
/// slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InlineConstant {
  Zero,
  One,
  Half,
  OneInt,
  MinusOneInt,
  LdsOqAPop,
  LdsOqBPop,
  LdsDirectA,
}

static INLINE_CONSTANT_NAMES: [(InlineConstant, &str); 8] = [
  (InlineConstant::Zero, "ZERO"),
  (InlineConstant::One, "ONE"),
  (InlineConstant::Half, "HALF"),
  (InlineConstant::OneInt, "ONE_INT"),
  (InlineConstant::MinusOneInt, "M_ONE_INT"),
  (InlineConstant::LdsOqAPop, "LDS_OQ_A_POP"),
  (InlineConstant::LdsOqBPop, "LDS_OQ_B_POP"),
  (InlineConstant::LdsDirectA, "LDS_DIRECT_A"),
];

impl InlineConstant {
  pub fn name(self) -> &'static str {
    INLINE_CONSTANT_NAMES
      .iter()
      .find(|(k, _)| *k == self)
      .map(|(_, n)| *n)
      .unwrap_or("?")
  }

  pub fn from_name(name: &str) -> Option<InlineConstant> {
    INLINE_CONSTANT_NAMES.iter().find(|(_, n)| *n == name).map(|(k, _)| *k)
  }

  /// Reads from the LDS output queue; such reads pop the queue, so the
  /// instructions doing them are ordered.
  pub fn is_lds_queue(self) -> bool {
    match self {
      InlineConstant::LdsOqAPop | InlineConstant::LdsOqBPop => true,
      _ => false,
    }
  }
}

//=============================================================================
// Values

/// Use/def bookkeeping of anything that can be written.
#[derive(Clone, Debug, Default)]
pub struct UseDef {
  /// Instructions that (may) write the value.
  pub parents: Set<InstIx>,
  /// Instructions that read the value.
  pub uses: Set<InstIx>,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
  Register {
    usedef: UseDef,
    /// Single static assignment; cleared on commit of the allocation.
    ssa: bool,
    /// Pre-loaded by the hardware before the program starts.
    input: bool,
  },
  ArrayElement {
    usedef: UseDef,
    array: ArrayIx,
    /// Element index, relative to the array base.
    offset: u32,
    /// Index register for indirect addressing.
    addr: Option<ValueIx>,
  },
  Literal {
    bits: u32,
  },
  Inline(InlineConstant),
  Uniform {
    bank: u32,
    index: u32,
    /// Buffer index register for indirectly selected constant buffers.
    buf_addr: Option<ValueIx>,
  },
}

#[derive(Clone, Debug)]
pub struct Value {
  pub sel: i32,
  pub chan: Chan,
  pub pin: Pin,
  pub kind: ValueKind,
}

impl Value {
  pub fn is_register(&self) -> bool {
    match self.kind {
      ValueKind::Register { .. } => true,
      _ => false,
    }
  }

  pub fn is_array_element(&self) -> bool {
    match self.kind {
      ValueKind::ArrayElement { .. } => true,
      _ => false,
    }
  }

  /// Anything that occupies a general purpose register.
  pub fn is_gpr(&self) -> bool {
    self.is_register() || self.is_array_element()
  }

  pub fn is_virtual(&self) -> bool {
    self.sel >= VIRTUAL_BASE
  }

  pub fn is_ssa(&self) -> bool {
    match self.kind {
      ValueKind::Register { ssa, .. } => ssa,
      _ => false,
    }
  }

  pub fn is_input(&self) -> bool {
    match self.kind {
      ValueKind::Register { input, .. } => input,
      _ => false,
    }
  }

  pub fn usedef(&self) -> Option<&UseDef> {
    match &self.kind {
      ValueKind::Register { usedef, .. } | ValueKind::ArrayElement { usedef, .. } => Some(usedef),
      _ => None,
    }
  }

  pub fn usedef_mut(&mut self) -> Option<&mut UseDef> {
    match &mut self.kind {
      ValueKind::Register { usedef, .. } | ValueKind::ArrayElement { usedef, .. } => Some(usedef),
      _ => None,
    }
  }

  pub fn has_uses(&self) -> bool {
    self.usedef().map(|ud| !ud.uses.is_empty()).unwrap_or(false)
  }

  /// Address operand, for indirectly addressed array elements and uniforms.
  pub fn addr(&self) -> Option<ValueIx> {
    match self.kind {
      ValueKind::ArrayElement { addr, .. } => addr,
      ValueKind::Uniform { buf_addr, .. } => buf_addr,
      _ => None,
    }
  }

  pub fn literal_bits(&self) -> Option<u32> {
    match self.kind {
      ValueKind::Literal { bits } => Some(bits),
      _ => None,
    }
  }

  pub fn inline_constant(&self) -> Option<InlineConstant> {
    match self.kind {
      ValueKind::Inline(k) => Some(k),
      _ => None,
    }
  }

  pub fn is_uniform(&self) -> bool {
    match self.kind {
      ValueKind::Uniform { .. } => true,
      _ => false,
    }
  }
}

//=============================================================================
// Local arrays

/// A block of `size` consecutive registers in which `nchannels` channels,
/// starting at `frac`, are used.
#[derive(Clone, Debug)]
pub struct LocalArray {
  pub base_sel: i32,
  pub size: u32,
  pub nchannels: u8,
  pub frac: u8,
  /// Direct element values, `chan_offset * size + offset`.
  pub elements: Vec<ValueIx>,
}

impl LocalArray {
  pub fn element(&self, offset: u32, chan_offset: u8) -> ValueIx {
    self.elements[(chan_offset as u32 * self.size + offset) as usize]
  }

  /// Every direct element living in channel `chan`.
  pub fn elements_in_chan(&self, chan: Chan) -> &[ValueIx] {
    let c = (chan - self.frac) as usize;
    let size = self.size as usize;
    &self.elements[c * size..(c + 1) * size]
  }

  pub fn covers_chan(&self, chan: Chan) -> bool {
    chan >= self.frac && chan < self.frac + self.nchannels
  }

  pub fn channel_mask(&self) -> u8 {
    ((1u8 << self.nchannels) - 1) << self.frac
  }
}

//=============================================================================
// Readiness

fn textually_before(instr: &Instr, block: i32, index: i32) -> bool {
  instr.block_id < block || (instr.block_id == block && instr.index < index)
}

fn usedef_ready(ud: &UseDef, instrs: &TypedIxVec<InstIx, Instr>, block: i32, index: i32) -> bool {
  ud.parents.iter().all(|p| {
    let parent = &instrs[*p];
    // Writers further down the program (loop back edges) don't gate us.
    parent.is_dead() || !textually_before(parent, block, index) || parent.is_scheduled()
  })
}

/// Can the value be read by an instruction placed at `(block, index)`?
pub fn value_ready(
  values: &TypedIxVec<ValueIx, Value>, arrays: &TypedIxVec<ArrayIx, LocalArray>,
  instrs: &TypedIxVec<InstIx, Instr>, v: ValueIx, block: i32, index: i32,
) -> bool {
  let value = &values[v];
  match &value.kind {
    ValueKind::Register { usedef, .. } => usedef_ready(usedef, instrs, block, index),
    ValueKind::ArrayElement { usedef, array, addr, .. } => {
      if !usedef_ready(usedef, instrs, block, index) {
        return false;
      }
      match addr {
        None => true,
        Some(addr) => {
          if !value_ready(values, arrays, instrs, *addr, block, index) {
            return false;
          }
          // Any element of the channel might be the one addressed.
          arrays[*array].elements_in_chan(value.chan).iter().all(|e| {
            values[*e].usedef().map_or(true, |ud| usedef_ready(ud, instrs, block, index))
          })
        }
      }
    }
    ValueKind::Uniform { buf_addr: Some(addr), .. } => {
      value_ready(values, arrays, instrs, *addr, block, index)
    }
    ValueKind::Uniform { .. } | ValueKind::Literal { .. } | ValueKind::Inline(_) => true,
  }
}

impl fmt::Display for InlineConstant {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "I[{}]", self.name())
  }
}
