/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Implements fuzzing primitives: random but well formed front end
//! programs.  Every generated program terminates and reads only values
//! defined on every path to the read, so running it before and after
//! allocation must give the same exports.

use arbitrary::{Arbitrary, Result, Unstructured};

use vliwra::value::{Chan, CHAN_MASKED};
use vliwra::{
  DestKind, OperandKind, SourceArray, SourceBlock, SourceDest, SourceOp, SourceOperand,
  SourceProgram,
};

/// Variables initialized on entry, free to be written anywhere.
const NUM_VARS: u32 = 4;
const MAX_DEPTH: usize = 3;
const MAX_BODY: u8 = 8;
const NUM_INPUTS: u8 = 4;

const SCALAR_OPS: [(&str, usize); 22] = [
  ("add", 2),
  ("mul", 2),
  ("muladd", 3),
  ("max", 2),
  ("min", 2),
  ("sete", 2),
  ("setgt", 2),
  ("fract", 1),
  ("floor", 1),
  ("cnde", 3),
  ("add_int", 2),
  ("and_int", 2),
  ("xor_int", 2),
  ("not_int", 1),
  ("lshl_int", 2),
  ("recip_ieee", 1),
  ("sqrt_ieee", 1),
  ("sin", 1),
  ("cos", 1),
  ("mullo_int", 2),
  ("int_to_flt", 1),
  ("flt_to_int", 1),
];

const CONSTANTS: [f32; 6] = [0.0, 1.0, 0.5, 2.0, -3.5, 100.25];

/// A generated program.
#[derive(Clone, Debug)]
pub struct FuzzProgram(pub SourceProgram);

struct FuzzingEnv {
  next_ssa: u32,
  /// Next variable id; loop counters come after the free variables.
  next_var: u32,
  /// SSA values visible in each open construct, as (id, write mask).
  scopes: Vec<Vec<(u32, u8)>>,
  arrays: Vec<SourceArray>,
  blocks: Vec<SourceBlock>,
}

impl FuzzingEnv {
  fn push(&mut self, u: &mut Unstructured, op: SourceOp) -> Result<()> {
    // Block boundaries may fall anywhere, inside constructs too.
    if u8::arbitrary(u)? % 16 == 0 {
      self.blocks.push(SourceBlock::default());
    }
    if let Some(b) = self.blocks.last_mut() {
      b.ops.push(op);
    }
    Ok(())
  }

  fn visible(&self) -> Vec<(u32, u8)> {
    self.scopes.iter().flatten().cloned().collect()
  }

  fn define(&mut self, mask: u8) -> u32 {
    let id = self.next_ssa;
    self.next_ssa += 1;
    if let Some(s) = self.scopes.last_mut() {
      s.push((id, mask));
    }
    id
  }

  fn pick<T: Copy>(u: &mut Unstructured, items: &[T]) -> Result<T> {
    Ok(items[usize::arbitrary(u)? % items.len()])
  }

  fn scalar(kind: OperandKind, c: Chan) -> SourceOperand {
    SourceOperand::swizzled(kind, [c; 4])
  }

  fn constant(u: &mut Unstructured) -> Result<SourceOperand> {
    let x = Self::pick(u, &CONSTANTS)?;
    Ok(SourceOperand::new(OperandKind::Const { bits: [x.to_bits(); 4] }))
  }

  fn int_constant(n: u32) -> SourceOperand {
    SourceOperand::new(OperandKind::Const { bits: [n; 4] })
  }

  /// Any readable scalar.
  fn operand(&self, u: &mut Unstructured) -> Result<SourceOperand> {
    let visible = self.visible();
    let mut s = match u8::arbitrary(u)? % 7 {
      0 | 1 if !visible.is_empty() => {
        let (id, mask) = Self::pick(u, &visible)?;
        let comps: Vec<Chan> = (0..4).filter(|c| mask & (1 << c) != 0).collect();
        Self::scalar(OperandKind::Ssa(id), Self::pick(u, &comps)?)
      }
      2 => Self::scalar(OperandKind::Var(u32::arbitrary(u)? % NUM_VARS), 0),
      3 => {
        let sel = (u8::arbitrary(u)? % NUM_INPUTS) as i32;
        Self::scalar(OperandKind::Input { sel }, u8::arbitrary(u)? % 4)
      }
      4 => {
        let bank = u32::arbitrary(u)? % 3;
        let index = u32::arbitrary(u)? % 40;
        Self::scalar(OperandKind::Uniform { bank, index, buf_addr: None }, u8::arbitrary(u)? % 4)
      }
      5 if !self.arrays.is_empty() => {
        let (id, offset, comp) = self.array_slot(u)?;
        Self::scalar(OperandKind::Array { id, offset, addr: None }, comp)
      }
      _ => Self::constant(u)?,
    };
    s.neg = u8::arbitrary(u)? % 8 == 0;
    s.abs = u8::arbitrary(u)? % 8 == 0;
    Ok(s)
  }

  /// Some element of some array, as (id, offset, component).
  fn array_slot(&self, u: &mut Unstructured) -> Result<(u32, u32, Chan)> {
    let a = &self.arrays[usize::arbitrary(u)? % self.arrays.len()];
    let offset = u32::arbitrary(u)? % a.length;
    Ok((a.id, offset, u8::arbitrary(u)? % a.ncomponents))
  }

  fn mask(u: &mut Unstructured) -> Result<u8> {
    Ok(1 + u8::arbitrary(u)? % 15)
  }

  fn dest(&mut self, u: &mut Unstructured) -> Result<SourceDest> {
    Ok(match u8::arbitrary(u)? % 5 {
      0 => SourceDest::new(DestKind::Var(u32::arbitrary(u)? % NUM_VARS), 1),
      1 if !self.arrays.is_empty() => {
        let (id, offset, comp) = self.array_slot(u)?;
        SourceDest::new(DestKind::Array { id, offset, addr: None }, 1 << comp)
      }
      _ => {
        let mask = Self::mask(u)?;
        SourceDest::new(DestKind::Ssa(self.define(mask)), mask)
      }
    })
  }

  fn simple(&mut self, u: &mut Unstructured, in_loop: bool) -> Result<()> {
    match u8::arbitrary(u)? % 12 {
      0 => {
        // A dot product over four defined lanes.
        let a = SourceOperand::new(OperandKind::Input { sel: (u8::arbitrary(u)? % NUM_INPUTS) as i32 });
        let b = self.operand(u)?;
        let c = u8::arbitrary(u)? % 4;
        let dest = SourceDest::new(DestKind::Ssa(self.define(1 << c)), 1 << c);
        self.push(u, SourceOp::new("dot4", Some(dest), vec![a, b]))?;
      }
      1 => {
        let addr = Self::int_constant(u32::arbitrary(u)? % 8 * 4);
        let value = self.operand(u)?;
        self.push(u, SourceOp::new("lds_write", None, vec![addr, value]))?;
      }
      2 => {
        let addr = Self::int_constant(u32::arbitrary(u)? % 8 * 4);
        let value = self.operand(u)?;
        let name = if bool::arbitrary(u)? { "lds_atomic_add" } else { "lds_atomic_xchg" };
        let dest = SourceDest::new(DestKind::Ssa(self.define(1)), 1);
        self.push(u, SourceOp::new(name, Some(dest), vec![addr, value]))?;
      }
      3 => {
        let addr = Self::int_constant(u32::arbitrary(u)? % 8 * 4);
        let mask = Self::mask(u)?;
        let dest = SourceDest::new(DestKind::Ssa(self.define(mask)), mask);
        self.push(u, SourceOp::new("lds_read", Some(dest), vec![addr]))?;
      }
      4 => {
        let src = SourceOperand::new(OperandKind::Input { sel: (u8::arbitrary(u)? % NUM_INPUTS) as i32 });
        let mask = Self::mask(u)?;
        let dest = SourceDest::new(DestKind::Ssa(self.define(mask)), mask);
        let op = SourceOp::new("sample", Some(dest), vec![src]).with_imm(u32::arbitrary(u)? % 4);
        self.push(u, op)?;
      }
      5 if in_loop => {
        let cond = self.operand(u)?;
        let name = if bool::arbitrary(u)? { "break_if" } else { "continue_if" };
        self.push(u, SourceOp::new(name, None, vec![cond]))?;
      }
      _ => {
        let (name, nsrc) = Self::pick(u, &SCALAR_OPS)?;
        let mut srcs = vec![];
        for _ in 0..nsrc {
          srcs.push(self.operand(u)?);
        }
        let mut dest = self.dest(u)?;
        dest.clamp = u8::arbitrary(u)? % 8 == 0;
        self.push(u, SourceOp::new(name, Some(dest), srcs))?;
      }
    }
    Ok(())
  }

  fn cf(&mut self, u: &mut Unstructured, name: &str, srcs: Vec<SourceOperand>) -> Result<()> {
    self.push(u, SourceOp::new(name, None, srcs))
  }

  fn scoped(&mut self, u: &mut Unstructured, depth: usize, in_loop: bool) -> Result<()> {
    self.scopes.push(vec![]);
    self.body(u, depth, in_loop)?;
    self.scopes.pop();
    Ok(())
  }

  fn construct(&mut self, u: &mut Unstructured, depth: usize, in_loop: bool) -> Result<()> {
    match u8::arbitrary(u)? % 3 {
      0 => {
        let cond = self.operand(u)?;
        self.cf(u, "if", vec![cond])?;
        self.scoped(u, depth + 1, in_loop)?;
        if bool::arbitrary(u)? {
          self.cf(u, "else", vec![])?;
          self.scoped(u, depth + 1, in_loop)?;
        }
        self.cf(u, "endif", vec![])?;
      }
      1 => {
        // A counted loop; the counter moves before anything can continue.
        let counter = self.next_var;
        self.next_var += 1;
        let limit = 1 + u8::arbitrary(u)? % 4;
        let zero = Self::int_constant(0);
        let counter_dest = || SourceDest::new(DestKind::Var(counter), 1);
        let counter_src = || Self::scalar(OperandKind::Var(counter), 0);
        self.push(u, SourceOp::new("mov", Some(counter_dest()), vec![zero]))?;
        self.cf(u, "loop", vec![])?;
        self.scopes.push(vec![]);
        let done = self.define(1);
        let done_dest = SourceDest::new(DestKind::Ssa(done), 1);
        let limit = SourceOperand::new(OperandKind::Const { bits: [(limit as f32).to_bits(); 4] });
        self.push(u, SourceOp::new("setge", Some(done_dest), vec![counter_src(), limit]))?;
        self.cf(u, "break_if", vec![Self::scalar(OperandKind::Ssa(done), 0)])?;
        let one = SourceOperand::new(OperandKind::Const { bits: [1.0f32.to_bits(); 4] });
        self.push(u, SourceOp::new("add", Some(counter_dest()), vec![counter_src(), one]))?;
        self.body(u, depth + 1, true)?;
        self.scopes.pop();
        self.cf(u, "endloop", vec![])?;
      }
      _ => {
        let src = self.operand(u)?;
        let id = self.define(1);
        let selector = SourceDest::new(DestKind::Ssa(id), 1);
        self.push(u, SourceOp::new("flt_to_int", Some(selector), vec![src]))?;
        self.cf(u, "switch", vec![Self::scalar(OperandKind::Ssa(id), 0)])?;
        let ncases = 1 + u8::arbitrary(u)? % 3;
        // Predicated loop exits stay out of switch cases.
        for case in 0..ncases {
          self.push(u, SourceOp::new("case", None, vec![]).with_imm(case as u32))?;
          self.scoped(u, depth + 1, false)?;
          self.cf(u, "break", vec![])?;
        }
        if bool::arbitrary(u)? {
          self.cf(u, "default", vec![])?;
          self.scoped(u, depth + 1, false)?;
          self.cf(u, "break", vec![])?;
        }
        self.cf(u, "endswitch", vec![])?;
      }
    }
    Ok(())
  }

  fn body(&mut self, u: &mut Unstructured, depth: usize, in_loop: bool) -> Result<()> {
    let len = u8::arbitrary(u)? % MAX_BODY;
    for _ in 0..len {
      if depth < MAX_DEPTH && u8::arbitrary(u)? % 6 == 0 {
        self.construct(u, depth, in_loop)?;
      } else {
        self.simple(u, in_loop)?;
      }
    }
    Ok(())
  }
}

impl<'a> Arbitrary<'a> for FuzzProgram {
  fn arbitrary(u: &mut Unstructured<'a>) -> Result<FuzzProgram> {
    let mut env = FuzzingEnv {
      next_ssa: 0,
      next_var: NUM_VARS,
      scopes: vec![vec![]],
      arrays: vec![],
      blocks: vec![SourceBlock::default()],
    };

    for id in 0..u8::arbitrary(u)? % 3 {
      let length = 1 + u32::arbitrary(u)? % 6;
      let ncomponents = 1 + u8::arbitrary(u)? % 4;
      env.arrays.push(SourceArray { id: id as u32, length, ncomponents });
    }

    for v in 0..NUM_VARS {
      let init = FuzzingEnv::constant(u)?;
      let dest = SourceDest::new(DestKind::Var(v), 1);
      env.push(u, SourceOp::new("mov", Some(dest), vec![init]))?;
    }

    env.body(u, 0, false)?;

    // Export what is visible at the end, so there is something to compare.
    let mut exported = 0;
    for (id, mask) in env.visible().into_iter().rev().take(4) {
      let mut swizzle = [CHAN_MASKED; 4];
      for c in 0..4 {
        if mask & (1 << c) != 0 {
          swizzle[c] = c as Chan;
        }
      }
      let src = SourceOperand::swizzled(OperandKind::Ssa(id), swizzle);
      env.push(u, SourceOp::new("export_param", None, vec![src]).with_imm(exported))?;
      exported += 1;
    }
    for v in 0..NUM_VARS {
      let src = SourceOperand::swizzled(OperandKind::Var(v), [0, CHAN_MASKED, CHAN_MASKED, CHAN_MASKED]);
      env.push(u, SourceOp::new("export_param", None, vec![src]).with_imm(exported))?;
      exported += 1;
    }

    Ok(FuzzProgram(SourceProgram { arrays: env.arrays, blocks: env.blocks }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use vliwra::{lower, Options};

  #[test]
  fn generated_programs_lower() {
    let seeds: Vec<Vec<u8>> = (0..64u8)
      .map(|s| (0..512u32).map(|i| (i as u8).wrapping_mul(31).wrapping_add(s.wrapping_mul(17))).collect())
      .collect();
    let options = Options::default();
    for data in &seeds {
      let mut u = Unstructured::new(data);
      let p = match FuzzProgram::arbitrary(&mut u) {
        Ok(p) => p,
        Err(_) => continue,
      };
      if let Err(e) = lower(&p.0, options.trans_slot) {
        panic!("{}: {:?}", e, p.0);
      }
    }
  }
}
