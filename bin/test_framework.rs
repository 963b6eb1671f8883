/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A small interpreter for shaders, used to check that allocation preserves
//! what a program computes.  The same shader runs once on virtual registers
//! and once on the registers the allocator picked; the exports of both runs
//! must agree.
//!
//! Registers are keyed by select and channel, so the interpreter needs no
//! knowledge of the allocation itself.  ALU groups read all their operands
//! before any member writes.

use std::collections::VecDeque;
use std::fmt;

use log::{debug, info};
use rustc_hash::FxHashMap;

use vliwra::data_structures::{InstIx, ValueIx};
use vliwra::instr::{AluCf, AluInstr, CfInstr, InstrKind, LdsInstr, Src, VecReg};
use vliwra::opcodes::{AluOp, LdsOp};
use vliwra::value::{Chan, InlineConstant, ValueKind, NUM_CHANNELS};
use vliwra::{
  allocate_registers, bundle_shader, lower, lower_lds, Options, Shader, ShaderInfo, SourceProgram,
};

use crate::test_cases::TestInput;

/// Give up on programs that don't terminate.
const MAX_STEPS: usize = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStage {
  BeforeRegalloc,
  AfterRegalloc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportRecord {
  pub target: &'static str,
  pub location: u32,
  /// Bit pattern of each lane, `None` where the lane is masked.
  pub lanes: [Option<u32>; NUM_CHANNELS],
}

impl fmt::Display for ExportRecord {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}{}:", self.target, self.location)?;
    for l in self.lanes.iter() {
      match l {
        Some(bits) => write!(fmt, " {:#010x}", bits)?,
        None => write!(fmt, " ____")?,
      }
    }
    Ok(())
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunResult {
  pub num_steps: usize,
  pub killed: bool,
  pub exports: Vec<ExportRecord>,
}

//=============================================================================
// Fake memories

/// Preloaded contents of input register `sel`, channel `chan`.
pub fn input_bits(sel: i32, chan: Chan) -> u32 {
  (1.0 + sel as f32 * 0.5 + chan as f32 * 0.125).to_bits()
}

fn uniform_bits(bank: u32, index: u32, chan: Chan) -> u32 {
  (((bank * 31 + index * 7 + chan as u32) % 17) as f32 * 0.25).to_bits()
}

fn fetch_bits(resource: u32, coords: &[u32], comp: usize) -> u32 {
  let sum: f32 = coords.iter().map(|c| f32::from_bits(*c)).sum();
  (sum * (comp as f32 + 1.0) + resource as f32).to_bits()
}

//=============================================================================
// Structured control flow

/// Where each control flow instruction of the flattened program jumps.
#[derive(Default)]
struct Targets {
  /// IF and ELSE: the matching ELSE (for IF) or ENDIF.
  skip: FxHashMap<usize, usize>,
  /// LOOP_END: its LOOP_BEGIN.
  loop_head: FxHashMap<usize, usize>,
  /// Innermost loop or switch around a position: its opening position.
  breakable: FxHashMap<usize, usize>,
  /// Innermost loop around a position.
  innermost_loop: FxHashMap<usize, usize>,
  /// LOOP_BEGIN or SWITCH: the closing position.
  close: FxHashMap<usize, usize>,
  /// SWITCH: positions of its CASE and DEFAULT labels.
  labels: FxHashMap<usize, Vec<usize>>,
  /// CASE and DEFAULT: the enclosing SWITCH.
  switch_of: FxHashMap<usize, usize>,
}

fn compute_targets(shader: &Shader, code: &[InstIx]) -> Result<Targets, String> {
  let mut t = Targets::default();
  // (position, is_loop) of open loops and switches; open ifs separately.
  let mut breakables: Vec<(usize, bool)> = vec![];
  let mut ifs: Vec<usize> = vec![];
  for (pos, ix) in code.iter().enumerate() {
    if let Some((p, _)) = breakables.last() {
      t.breakable.insert(pos, *p);
    }
    if let Some((p, _)) = breakables.iter().rev().find(|(_, is_loop)| *is_loop) {
      t.innermost_loop.insert(pos, *p);
    }
    let cf = match &shader.instrs[*ix].kind {
      InstrKind::ControlFlow(cf) => cf,
      _ => continue,
    };
    match cf {
      CfInstr::If(_) => ifs.push(pos),
      CfInstr::Else => {
        let open = ifs.pop().ok_or("ELSE without IF")?;
        t.skip.insert(open, pos);
        ifs.push(pos);
      }
      CfInstr::EndIf => {
        let open = ifs.pop().ok_or("ENDIF without IF")?;
        t.skip.insert(open, pos);
      }
      CfInstr::LoopBegin => breakables.push((pos, true)),
      CfInstr::Switch(_) => breakables.push((pos, false)),
      CfInstr::LoopEnd | CfInstr::EndSwitch => {
        let is_loop = *cf == CfInstr::LoopEnd;
        match breakables.pop() {
          Some((open, l)) if l == is_loop => {
            t.close.insert(open, pos);
            if is_loop {
              t.loop_head.insert(pos, open);
            }
          }
          _ => return Err(format!("unbalanced {}", cf.show(&shader.vf))),
        }
      }
      CfInstr::Case(_) | CfInstr::Default => match breakables.last() {
        Some((open, false)) => {
          t.labels.entry(*open).or_insert_with(Vec::new).push(pos);
          t.switch_of.insert(pos, *open);
        }
        _ => return Err("case label outside of a switch".to_string()),
      },
      CfInstr::Break | CfInstr::Continue => {}
    }
  }
  if !ifs.is_empty() || !breakables.is_empty() {
    return Err("unterminated control flow".to_string());
  }
  Ok(t)
}

//=============================================================================
// The machine

struct Machine<'a> {
  shader: &'a Shader,
  regs: FxHashMap<(i32, Chan), u32>,
  lds: FxHashMap<u32, u32>,
  queue: VecDeque<u32>,
  predicate: bool,
  killed: bool,
  exports: Vec<ExportRecord>,
}

/// What executing one instruction asks of the control flow.
enum Flow {
  Next,
  Break,
  Continue,
  Stop,
}

fn f(bits: u32) -> f32 {
  f32::from_bits(bits)
}

fn fbits(x: f32) -> u32 {
  x.to_bits()
}

fn bool_bits(b: bool) -> u32 {
  if b {
    fbits(1.0)
  } else {
    0
  }
}

impl<'a> Machine<'a> {
  fn new(shader: &'a Shader) -> Self {
    let mut regs = FxHashMap::default();
    for v in shader.vf.values().iter() {
      if v.is_input() {
        regs.insert((v.sel, v.chan), input_bits(v.sel, v.chan));
      }
    }
    Self {
      shader,
      regs,
      lds: FxHashMap::default(),
      queue: VecDeque::new(),
      predicate: false,
      killed: false,
      exports: vec![],
    }
  }

  /// Register select of an array element after indirection.
  fn element_sel(&mut self, v: ValueIx) -> Result<(i32, Chan), String> {
    let shader = self.shader;
    let value = shader.vf.value(v);
    let (sel, chan) = (value.sel, value.chan);
    if let ValueKind::ArrayElement { array, addr, .. } = &value.kind {
      let mut sel = sel;
      if let Some(a) = addr {
        sel += self.read(*a)? as i32;
      }
      let arr = shader.vf.array(*array);
      if sel < arr.base_sel || sel >= arr.base_sel + arr.size as i32 {
        return Err(format!("array access {} out of bounds", shader.vf.show(v)));
      }
      return Ok((sel, chan));
    }
    Ok((sel, chan))
  }

  fn read(&mut self, v: ValueIx) -> Result<u32, String> {
    let shader = self.shader;
    let value = shader.vf.value(v);
    let chan = value.chan;
    Ok(match &value.kind {
      ValueKind::Register { .. } | ValueKind::ArrayElement { .. } => {
        let key = self.element_sel(v)?;
        *self.regs.get(&key).unwrap_or(&0)
      }
      ValueKind::Literal { bits } => *bits,
      ValueKind::Inline(k) => match k {
        InlineConstant::Zero | InlineConstant::LdsDirectA => 0,
        InlineConstant::One => fbits(1.0),
        InlineConstant::Half => fbits(0.5),
        InlineConstant::OneInt => 1,
        InlineConstant::MinusOneInt => 0xffff_ffff,
        InlineConstant::LdsOqAPop | InlineConstant::LdsOqBPop => {
          self.queue.pop_front().ok_or("LDS output queue is empty")?
        }
      },
      ValueKind::Uniform { bank, index, buf_addr } => {
        let (bank, mut index) = (*bank, *index);
        if let Some(a) = buf_addr {
          index = index.wrapping_add(self.read(*a)?);
        }
        uniform_bits(bank, index, chan)
      }
    })
  }

  fn read_src(&mut self, s: &Src) -> Result<u32, String> {
    let mut bits = self.read(s.value)?;
    if s.abs {
      bits &= 0x7fff_ffff;
    }
    if s.neg {
      bits ^= 0x8000_0000;
    }
    Ok(bits)
  }

  fn write(&mut self, v: ValueIx, bits: u32) -> Result<(), String> {
    let key = self.element_sel(v)?;
    self.regs.insert(key, bits);
    Ok(())
  }

  fn lds_op(&mut self, op: LdsOp, args: &[u32]) -> Option<u32> {
    let addr = args[0];
    let old = *self.lds.get(&addr).unwrap_or(&0);
    match op {
      LdsOp::Read => {}
      LdsOp::Write => {
        self.lds.insert(addr, args[1]);
      }
      LdsOp::AddRet => {
        self.lds.insert(addr, old.wrapping_add(args[1]));
      }
      LdsOp::XchgRet => {
        self.lds.insert(addr, args[1]);
      }
    }
    if op.returns_value() {
      Some(old)
    } else {
      None
    }
  }

  /// Result of one lane of `op`.
  fn lane(&mut self, op: AluOp, a: &[u32]) -> u32 {
    use AluOp::*;
    let x = |i: usize| f(a[i]);
    match op {
      Mov => a[0],
      Add => fbits(x(0) + x(1)),
      Mul | MulIeee | Dot4 | Dot4Ieee | Cube | InterpXY | InterpZW => fbits(x(0) * x(1)),
      MulAdd | MulAddIeee => fbits(x(0) * x(1) + x(2)),
      Max => fbits(x(0).max(x(1))),
      Min => fbits(x(0).min(x(1))),
      SetE => bool_bits(x(0) == x(1)),
      SetGt => bool_bits(x(0) > x(1)),
      SetGe => bool_bits(x(0) >= x(1)),
      SetNe => bool_bits(x(0) != x(1)),
      Fract => fbits(x(0) - x(0).floor()),
      Floor => fbits(x(0).floor()),
      CndE => if x(0) == 0.0 { a[1] } else { a[2] },
      CndGt => if x(0) > 0.0 { a[1] } else { a[2] },
      CndGe => if x(0) >= 0.0 { a[1] } else { a[2] },
      AddInt => a[0].wrapping_add(a[1]),
      SubInt => a[0].wrapping_sub(a[1]),
      AndInt => a[0] & a[1],
      OrInt => a[0] | a[1],
      XorInt => a[0] ^ a[1],
      NotInt => !a[0],
      LshlInt => a[0] << (a[1] & 31),
      LshrInt => a[0] >> (a[1] & 31),
      AshrInt => ((a[0] as i32) >> (a[1] & 31)) as u32,
      MulloInt => a[0].wrapping_mul(a[1]),
      IntToFlt => fbits(a[0] as i32 as f32),
      FltToInt => x(0) as i32 as u32,
      RecipIeee => fbits(1.0 / x(0)),
      RecipsqrtIeee => fbits(1.0 / x(0).sqrt()),
      SqrtIeee => fbits(x(0).sqrt()),
      Sin => fbits(x(0).sin()),
      Cos => fbits(x(0).cos()),
      ExpIeee => fbits(x(0).exp2()),
      LogIeee => fbits(x(0).log2()),
      PredSetE => {
        self.predicate = a[0] == a[1];
        bool_bits(self.predicate)
      }
      PredSetNe => {
        self.predicate = a[0] != a[1];
        bool_bits(self.predicate)
      }
      KillGt => {
        self.killed |= x(0) > x(1);
        0
      }
      KillNe => {
        self.killed |= x(0) != x(1);
        0
      }
      LdsReadRet | LdsWrite | LdsAddRet | LdsXchgRet => {
        let lop = match op {
          LdsReadRet => LdsOp::Read,
          LdsWrite => LdsOp::Write,
          LdsAddRet => LdsOp::AddRet,
          _ => LdsOp::XchgRet,
        };
        if let Some(r) = self.lds_op(lop, a) {
          self.queue.push_back(r);
        }
        0
      }
    }
  }

  /// Evaluate `alu` without writing its destination.
  fn eval_alu(&mut self, alu: &AluInstr) -> Result<Option<(ValueIx, u32)>, String> {
    let info = alu.op.info();
    let mut result = if info.slots > 1 && !info.transcendental {
      // Reductions over all lanes.
      let mut sum = 0.0f32;
      for lane in 0..alu.slots as usize {
        let mut args = vec![];
        for s in alu.lane_srcs(lane) {
          args.push(self.read_src(s)?);
        }
        sum += f(self.lane(alu.op, &args));
      }
      fbits(sum)
    } else {
      // A transcendental op spread over vector lanes computes its result in
      // the lane of its destination.
      let lane = (alu.dest_chan(&self.shader.vf) as usize).min(alu.slots as usize - 1);
      let mut args = vec![];
      for s in alu.lane_srcs(lane) {
        args.push(self.read_src(s)?);
      }
      self.lane(alu.op, &args)
    };
    if alu.flags.clamp && !info.lds {
      result = fbits(f(result).max(0.0).min(1.0));
    }
    Ok(alu.writes().map(|d| (d, result)))
  }

  fn alu_flow(&self, alu: &AluInstr) -> Flow {
    match alu.cf {
      Some(_) if self.killed => Flow::Stop,
      Some(AluCf::Break) if self.predicate => Flow::Break,
      Some(AluCf::Continue) if self.predicate => Flow::Continue,
      _ if self.killed => Flow::Stop,
      _ => Flow::Next,
    }
  }

  fn gather(&mut self, v: &VecReg) -> Result<[Option<u32>; NUM_CHANNELS], String> {
    let mut lanes = [None; NUM_CHANNELS];
    for i in 0..NUM_CHANNELS {
      let s = v.swizzle[i] as usize;
      if s < NUM_CHANNELS {
        lanes[i] = Some(self.read(v.regs[s])?);
      }
    }
    Ok(lanes)
  }

  fn lds(&mut self, lds: &LdsInstr) -> Result<(), String> {
    let mut args = vec![];
    for s in lds.srcs.iter() {
      args.push(self.read(*s)?);
    }
    if let (Some(r), Some(d)) = (self.lds_op(lds.op, &args), lds.dest) {
      self.write(d, r)?;
    }
    Ok(())
  }

  /// Execute a non control flow instruction.
  fn exec(&mut self, ix: InstIx) -> Result<Flow, String> {
    let shader = self.shader;
    match &shader.instrs[ix].kind {
      InstrKind::Alu(alu) => {
        if let Some((d, bits)) = self.eval_alu(alu)? {
          self.write(d, bits)?;
        }
        Ok(self.alu_flow(alu))
      }
      InstrKind::Group(group) => {
        let mut results = vec![];
        let mut flow = Flow::Next;
        for m in group.members() {
          let alu = match shader.instrs[m].kind.as_alu() {
            Some(a) => a,
            None => return Err("group member is not an ALU instruction".to_string()),
          };
          results.extend(self.eval_alu(alu)?);
          if alu.cf.is_some() {
            flow = self.alu_flow(alu);
          }
        }
        for (d, bits) in results {
          self.write(d, bits)?;
        }
        if self.killed {
          flow = Flow::Stop;
        }
        Ok(flow)
      }
      InstrKind::Lds(lds) => {
        self.lds(lds)?;
        Ok(Flow::Next)
      }
      InstrKind::Fetch(fetch) => {
        let coords: Vec<u32> = self.gather(&fetch.src)?.iter().flatten().cloned().collect();
        for i in 0..NUM_CHANNELS {
          let comp = fetch.dest.swizzle[i] as usize;
          if comp < NUM_CHANNELS {
            self.write(fetch.dest.regs[i], fetch_bits(fetch.resource_id, &coords, comp))?;
          }
        }
        Ok(Flow::Next)
      }
      InstrKind::Export(export) => {
        let lanes = self.gather(&export.value)?;
        self.exports.push(ExportRecord { target: export.kind.name(), location: export.location, lanes });
        Ok(Flow::Next)
      }
      InstrKind::ControlFlow(_) => Err("control flow reached exec".to_string()),
    }
  }
}

fn missing(what: &str) -> String {
  format!("no {} for control flow instruction", what)
}

fn break_target(t: &Targets, pos: usize) -> Result<usize, String> {
  let open = *t.breakable.get(&pos).ok_or_else(|| missing("enclosing loop"))?;
  Ok(t.close[&open] + 1)
}

/// Predicated exits always leave the innermost loop.
fn loop_exit(t: &Targets, pos: usize) -> Result<usize, String> {
  let open = *t.innermost_loop.get(&pos).ok_or_else(|| missing("enclosing loop"))?;
  Ok(t.close[&open] + 1)
}

fn continue_target(t: &Targets, pos: usize) -> Result<usize, String> {
  let open = *t.innermost_loop.get(&pos).ok_or_else(|| missing("enclosing loop"))?;
  Ok(open + 1)
}

/// Run `shader` from its first instruction to its end.
pub fn run_shader(shader: &Shader, who: &str, stage: RunStage) -> Result<RunResult, String> {
  let code: Vec<InstIx> = shader
    .blocks
    .iter()
    .flat_map(|b| b.items.iter().cloned())
    .filter(|ix| !shader.instrs[*ix].is_dead())
    .collect();
  let t = compute_targets(shader, &code)?;
  let mut m = Machine::new(shader);

  let mut pc = 0;
  let mut num_steps = 0;
  while pc < code.len() {
    num_steps += 1;
    if num_steps > MAX_STEPS {
      return Err(format!("{}: no termination after {} steps", who, MAX_STEPS));
    }
    let ix = code[pc];
    pc = match &shader.instrs[ix].kind {
      InstrKind::ControlFlow(cf) => match cf {
        CfInstr::If(v) => {
          if m.read(*v)? != 0 {
            pc + 1
          } else {
            t.skip[&pc] + 1
          }
        }
        // Falling into ELSE ends the taken branch.
        CfInstr::Else => t.skip[&pc] + 1,
        CfInstr::EndIf | CfInstr::LoopBegin | CfInstr::EndSwitch => pc + 1,
        CfInstr::LoopEnd => t.loop_head[&pc] + 1,
        CfInstr::Break => break_target(&t, pc)?,
        CfInstr::Continue => continue_target(&t, pc)?,
        CfInstr::Switch(v) => {
          let selector = m.read(*v)?;
          let labels = t.labels.get(&pc).cloned().unwrap_or_default();
          let case = labels.iter().find(|l| match &shader.instrs[code[**l]].kind {
            InstrKind::ControlFlow(CfInstr::Case(n)) => *n == selector,
            _ => false,
          });
          let default = labels.iter().find(|l| match &shader.instrs[code[**l]].kind {
            InstrKind::ControlFlow(CfInstr::Default) => true,
            _ => false,
          });
          match case.or(default) {
            Some(l) => l + 1,
            None => t.close[&pc] + 1,
          }
        }
        // Cases don't fall through.
        CfInstr::Case(_) | CfInstr::Default => t.close[&t.switch_of[&pc]] + 1,
      },
      _ => match m.exec(ix)? {
        Flow::Next => pc + 1,
        Flow::Break => loop_exit(&t, pc)?,
        Flow::Continue => continue_target(&t, pc)?,
        Flow::Stop => code.len(),
      },
    };
  }

  debug!("{} ({:?}): {} steps, {} exports", who, stage, num_steps, m.exports.len());
  Ok(RunResult { num_steps, killed: m.killed, exports: m.exports })
}

/// Both runs must have observed the same thing.
pub fn check_results(
  before: &Result<RunResult, String>, after: &Result<RunResult, String>,
) -> Result<(), String> {
  match (before, after) {
    (Ok(b), Ok(a)) => {
      if b.killed != a.killed {
        return Err(format!("kill state differs: before {}, after {}", b.killed, a.killed));
      }
      if b.exports != a.exports {
        let show = |r: &RunResult| {
          r.exports.iter().map(|e| format!("  {}\n", e)).collect::<String>()
        };
        return Err(format!(
          "different exports before/after allocation:\n- before:\n{}- after:\n{}",
          show(b),
          show(a)
        ));
      }
      Ok(())
    }
    (Err(b), Err(a)) if a == b => Ok(()),
    (b, a) => Err(format!("runs disagree: before {:?}, after {:?}", b, a)),
  }
}

pub struct Outcome {
  pub shader: Shader,
  pub info: ShaderInfo,
  pub before: Result<RunResult, String>,
  pub after: Result<RunResult, String>,
}

/// Compile `program` step by step, running it right before and right after
/// register allocation.
pub fn run_program(program: &SourceProgram, options: &Options) -> Result<Outcome, String> {
  let mut shader = lower(program, options.trans_slot).map_err(|e| e.to_string())?;
  shader.remove_dead_code();
  lower_lds(&mut shader);
  if options.bundle {
    bundle_shader(&mut shader, options).map_err(|e| e.to_string())?;
  }
  allocate_and_run(shader, options)
}

/// Same for a shader read from text.  Shaders that already contain groups
/// are taken as bundled.
pub fn run_parsed(mut shader: Shader, options: &Options) -> Result<Outcome, String> {
  lower_lds(&mut shader);
  let bundled = shader.instrs.iter().any(|i| !i.is_dead() && i.kind.as_group().is_some());
  if options.bundle && !bundled {
    bundle_shader(&mut shader, options).map_err(|e| e.to_string())?;
  }
  allocate_and_run(shader, options)
}

pub fn run_test(input: TestInput, options: &Options) -> Result<Outcome, String> {
  match input {
    TestInput::Program(p) => run_program(&p, options),
    TestInput::Shader(sh) => run_parsed(sh, options),
  }
}

fn allocate_and_run(mut shader: Shader, options: &Options) -> Result<Outcome, String> {
  info!("before allocation:\n{}", shader.render());
  let before = run_shader(&shader, "before allocation", RunStage::BeforeRegalloc);
  let info = allocate_registers(&mut shader, options).map_err(|e| e.to_string())?;
  info!("after allocation:\n{}", shader.render());
  let after = run_shader(&shader, "after allocation", RunStage::AfterRegalloc);
  Ok(Outcome { shader, info, before, after })
}

#[cfg(test)]
mod tests {
  use super::*;
  use vliwra::instr::{ExportInstr, ExportKind};
  use vliwra::value::{Pin, CHAN_MASKED};
  use vliwra::{SourceKey, ValueFactory};

  fn mov(d: ValueIx, s: ValueIx) -> InstrKind {
    InstrKind::Alu(AluInstr::new(AluOp::Mov, Some(d), vec![Src::new(s)]))
  }

  fn export_x(sh: &mut Shader, b: usize, v: ValueIx) {
    let mut regs = sh.vf.temp_vec4(Pin::Group);
    regs[0] = v;
    let mut value = VecReg::new(regs);
    value.swizzle = [0, CHAN_MASKED, CHAN_MASKED, CHAN_MASKED];
    sh.emit(b, InstrKind::Export(ExportInstr { kind: ExportKind::Param, location: 0, value, last: true }));
  }

  #[test]
  fn groups_read_before_writing() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let half = sh.vf.inline_constant(InlineConstant::Half);
    let x = sh.vf.dest_for(SourceKey::Var(0), 0, Pin::Chan);
    let y = sh.vf.dest_for(SourceKey::Var(1), 1, Pin::Chan);
    sh.emit(b, mov(x, one));
    sh.emit(b, mov(y, half));
    // Swap in one group.
    let a = AluInstr::new(AluOp::Mov, Some(x), vec![Src::new(y)]);
    let c = AluInstr::new(AluOp::Mov, Some(y), vec![Src::new(x)]);
    sh.emit_group(b, vec![a, c], true).unwrap();
    export_x(&mut sh, b, x);
    let r = run_shader(&sh, "swap", RunStage::BeforeRegalloc).unwrap();
    assert_eq!(r.exports.len(), 1);
    assert_eq!(r.exports[0].lanes[0], Some(0.5f32.to_bits()));
    assert_eq!(r.exports[0].lanes[1], None);
  }

  #[test]
  fn loops_run_until_break() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let zero = sh.vf.inline_constant(InlineConstant::Zero);
    let one = sh.vf.inline_constant(InlineConstant::One);
    let i = sh.vf.dest_for(SourceKey::Var(0), 0, Pin::Chan);
    let done = sh.vf.dest_for(SourceKey::Ssa(1), 1, Pin::Chan);
    let four = sh.vf.literal(4.0f32.to_bits());
    sh.emit(b, mov(i, zero));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::LoopBegin));
    sh.emit(b, InstrKind::Alu(AluInstr::new(AluOp::SetGe, Some(done), vec![Src::new(i), Src::new(four)])));
    let mut brk = AluInstr::without_dest(AluOp::PredSetNe, 0, vec![Src::new(done), Src::new(zero)]);
    brk.flags.update_pred = true;
    brk.cf = Some(AluCf::Break);
    sh.emit(b, InstrKind::Alu(brk));
    sh.emit(b, InstrKind::Alu(AluInstr::new(AluOp::Add, Some(i), vec![Src::new(i), Src::new(one)])));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::LoopEnd));
    export_x(&mut sh, b, i);
    let r = run_shader(&sh, "loop", RunStage::BeforeRegalloc).unwrap();
    assert_eq!(r.exports[0].lanes[0], Some(4.0f32.to_bits()));
  }

  #[test]
  fn runaway_loops_are_reported() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    sh.emit(b, InstrKind::ControlFlow(CfInstr::LoopBegin));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::LoopEnd));
    assert!(run_shader(&sh, "spin", RunStage::BeforeRegalloc).is_err());
  }

  #[test]
  fn result_comparison() {
    let r = |bits| RunResult {
      num_steps: 1,
      killed: false,
      exports: vec![ExportRecord { target: "PARAM", location: 0, lanes: [Some(bits), None, None, None] }],
    };
    assert!(check_results(&Ok(r(1)), &Ok(r(1))).is_ok());
    assert!(check_results(&Ok(r(1)), &Ok(r(2))).is_err());
    assert!(check_results(&Err("x".to_string()), &Err("x".to_string())).is_ok());
    assert!(check_results(&Ok(r(1)), &Err("x".to_string())).is_err());
  }
}
