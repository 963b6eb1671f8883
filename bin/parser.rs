/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Parser for the text form printed by `Shader::render`.  Every line holds
//! one instruction or one piece of framing; `;` starts a comment.

use std::fmt;
use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::iter::Peekable;
use std::path::Path;
use std::str::CharIndices;

use vliwra::alu_group::BankSwizzle;
use vliwra::data_structures::ValueIx;
use vliwra::instr::{
  AluCf, AluFlags, AluInstr, CfInstr, ExportInstr, ExportKind, FetchInstr, FetchOp, InstrKind,
  LdsInstr, Src, VecReg,
};
use vliwra::opcodes::{AluOp, LdsOp};
use vliwra::value::{chan_from_letter, Chan, InlineConstant, Pin, CHAN_MASKED, NUM_CHANNELS, VIRTUAL_BASE};
use vliwra::{Shader, ValueFactory};

#[derive(Debug)]
pub enum ParseError {
  IoError(io::Error),
  Parse { line: usize, token: String, msg: String },
}

impl From<io::Error> for ParseError {
  fn from(err: io::Error) -> ParseError {
    ParseError::IoError(err)
  }
}

impl fmt::Display for ParseError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      ParseError::IoError(err) => write!(fmt, "io error: {}", err),
      ParseError::Parse { line, token, msg } => {
        write!(fmt, "error at line {} near '{}': {}", line, token, msg)
      }
    }
  }
}

pub type ParseResult<T> = Result<T, ParseError>;

pub fn parse_file(path: &Path) -> ParseResult<Shader> {
  let mut file = File::open(path)?;
  let mut content = String::new();
  file.read_to_string(&mut content)?;
  parse_content(&content)
}

//=============================================================================
// Character level

/// Cursor over one whitespace separated token.
struct Token<'t> {
  text: &'t str,
  iter: Peekable<CharIndices<'t>>,
  line: usize,
}

impl<'t> Token<'t> {
  fn new(text: &'t str, line: usize) -> Self {
    Self { text, iter: text.char_indices().peekable(), line }
  }

  fn peek(&mut self) -> Option<char> {
    self.iter.peek().map(|(_, c)| *c)
  }

  fn advance(&mut self) -> Option<char> {
    self.iter.next().map(|(_, c)| c)
  }

  fn try_read_char(&mut self, expected: char) -> bool {
    if self.peek() == Some(expected) {
      self.advance();
      return true;
    }
    false
  }

  fn expect_char(&mut self, expected: char) -> ParseResult<()> {
    if self.try_read_char(expected) {
      Ok(())
    } else {
      self.error(&format!("expected char '{}'", expected))
    }
  }

  fn read_int(&mut self) -> ParseResult<u32> {
    let mut digits = String::new();
    while let Some(c) = self.peek() {
      if !c.is_ascii_digit() {
        break;
      }
      digits.push(c);
      self.advance();
    }
    match digits.parse::<u32>() {
      Ok(n) => Ok(n),
      Err(_) => self.error("expected integer"),
    }
  }

  fn read_sel(&mut self) -> ParseResult<i32> {
    let n = self.read_int()?;
    if n > i32::MAX as u32 {
      return self.error("select out of range");
    }
    Ok(n as i32)
  }

  fn read_hex(&mut self) -> ParseResult<u32> {
    let mut digits = String::new();
    while let Some(c) = self.peek() {
      if !c.is_ascii_hexdigit() {
        break;
      }
      digits.push(c);
      self.advance();
    }
    match u32::from_str_radix(&digits, 16) {
      Ok(n) => Ok(n),
      Err(_) => self.error("expected hex number"),
    }
  }

  fn read_ident(&mut self) -> String {
    let mut s = String::new();
    while let Some(c) = self.peek() {
      if !c.is_ascii_alphanumeric() && c != '_' {
        break;
      }
      s.push(c);
      self.advance();
    }
    s
  }

  fn read_chan(&mut self) -> ParseResult<Chan> {
    match self.advance().and_then(chan_from_letter) {
      Some(c) => Ok(c),
      None => self.error("expected channel letter"),
    }
  }

  fn read_pin(&mut self) -> ParseResult<Pin> {
    if !self.try_read_char('@') {
      return Ok(Pin::None);
    }
    let name = self.read_ident();
    match Pin::from_suffix(&name) {
      Some(p) => Ok(p),
      None => self.error("unknown pin mode"),
    }
  }

  fn expect_done(&mut self) -> ParseResult<()> {
    if self.peek().is_some() {
      return self.error("trailing characters");
    }
    Ok(())
  }

  fn error<T>(&self, msg: &str) -> ParseResult<T> {
    Err(ParseError::Parse { line: self.line, token: self.text.to_string(), msg: msg.to_string() })
  }
}

//=============================================================================
// Line level

struct Parser {
  shader: Shader,
  line: usize,
  block: Option<usize>,
  group: Option<Vec<AluInstr>>,
}

impl Parser {
  fn new() -> Self {
    Self { shader: Shader::new(ValueFactory::new()), line: 0, block: None, group: None }
  }

  fn vf(&mut self) -> &mut ValueFactory {
    &mut self.shader.vf
  }

  fn error<T>(&self, token: &str, msg: &str) -> ParseResult<T> {
    Err(ParseError::Parse { line: self.line, token: token.to_string(), msg: msg.to_string() })
  }

  fn expect_colon(&self, toks: &[&str], i: usize) -> ParseResult<()> {
    match toks.get(i) {
      Some(&":") => Ok(()),
      Some(t) => self.error(t, "expected ':'"),
      None => self.error("", "expected ':'"),
    }
  }

  fn tok<'a>(&self, toks: &[&'a str], i: usize) -> ParseResult<&'a str> {
    match toks.get(i) {
      Some(t) => Ok(*t),
      None => self.error(toks.last().cloned().unwrap_or(""), "missing operand"),
    }
  }

  // Values.

  fn register(&mut self, t: &Token, prefix: char, sel: i32, chan: Chan, pin: Pin) -> ParseResult<ValueIx> {
    if chan == CHAN_MASKED {
      return t.error("register channel can't be masked");
    }
    let res = match prefix {
      'R' => {
        if sel >= VIRTUAL_BASE {
          return t.error("hardware register out of range");
        }
        if pin == Pin::Fully {
          // Fully pinned hardware registers are the preloaded inputs.
          Some(self.vf().physical(sel, chan, true))
        } else {
          self.vf().register_at(sel, chan, pin, false)
        }
      }
      'S' | 'V' => {
        if sel < VIRTUAL_BASE {
          return t.error("virtual register below the virtual base");
        }
        self.vf().register_at(sel, chan, pin, prefix == 'S')
      }
      _ => return t.error("unknown register kind"),
    };
    match res {
      Some(v) => Ok(v),
      None => t.error("register redeclared with another pin or kind"),
    }
  }

  fn value(&mut self, t: &mut Token) -> ParseResult<ValueIx> {
    match t.advance() {
      Some(prefix @ 'R') | Some(prefix @ 'S') | Some(prefix @ 'V') => {
        let sel = t.read_sel()?;
        t.expect_char('.')?;
        let chan = t.read_chan()?;
        let pin = t.read_pin()?;
        self.register(t, prefix, sel, chan, pin)
      }
      Some('A') => {
        let base = t.read_sel()?;
        t.expect_char('[')?;
        let offset = t.read_int()?;
        let addr = if t.try_read_char('+') { Some(self.value(t)?) } else { None };
        t.expect_char(']')?;
        t.expect_char('.')?;
        let chan = t.read_chan()?;
        let array = match self.shader.vf.array_by_base(base, chan) {
          Some(a) => a,
          None => return t.error("no array at this base and channel"),
        };
        let comp = chan - self.shader.vf.array(array).frac;
        match self.vf().array_element(array, offset, comp, addr) {
          Some(v) => Ok(v),
          None => t.error("array offset out of range"),
        }
      }
      Some('L') => {
        t.expect_char('[')?;
        t.expect_char('0')?;
        t.expect_char('x')?;
        let bits = t.read_hex()?;
        t.expect_char(']')?;
        Ok(self.vf().literal(bits))
      }
      Some('I') => {
        t.expect_char('[')?;
        let name = t.read_ident();
        t.expect_char(']')?;
        match InlineConstant::from_name(&name) {
          Some(k) => Ok(self.vf().inline_constant(k)),
          None => t.error("unknown inline constant"),
        }
      }
      Some('K') => {
        t.expect_char('C')?;
        let bank = t.read_int()?;
        t.expect_char('[')?;
        let index = t.read_int()?;
        let addr = if t.try_read_char('+') { Some(self.value(t)?) } else { None };
        t.expect_char(']')?;
        t.expect_char('.')?;
        let chan = t.read_chan()?;
        Ok(self.vf().uniform(bank, index, chan, addr))
      }
      _ => t.error("expected value"),
    }
  }

  fn whole_value(&mut self, text: &str) -> ParseResult<ValueIx> {
    let mut t = Token::new(text, self.line);
    let v = self.value(&mut t)?;
    t.expect_done()?;
    Ok(v)
  }

  fn src(&mut self, text: &str) -> ParseResult<Src> {
    let mut t = Token::new(text, self.line);
    let neg = t.try_read_char('-');
    let abs = t.try_read_char('|');
    let value = self.value(&mut t)?;
    if abs {
      t.expect_char('|')?;
    }
    t.expect_done()?;
    Ok(Src { value, neg, abs })
  }

  fn vec_reg(&mut self, text: &str) -> ParseResult<VecReg> {
    let mut t = Token::new(text, self.line);
    let prefix = match t.advance() {
      Some(c) => c,
      None => return t.error("expected register"),
    };
    let sel = t.read_sel()?;
    t.expect_char('.')?;
    let mut swizzle = [CHAN_MASKED; NUM_CHANNELS];
    for s in swizzle.iter_mut() {
      *s = t.read_chan()?;
    }
    let pin = t.read_pin()?;
    t.expect_done()?;
    let mut regs = [ValueIx::new(0); NUM_CHANNELS];
    for c in 0..NUM_CHANNELS {
      regs[c] = self.register(&t, prefix, sel, c as Chan, pin)?;
    }
    Ok(VecReg { regs, swizzle })
  }

  // Instructions.

  fn alu(&mut self, toks: &[&str]) -> ParseResult<AluInstr> {
    let name = self.tok(toks, 1)?;
    let op = match AluOp::from_name(name) {
      Some(op) => op,
      None => return self.error(name, "unknown ALU opcode"),
    };
    let dest_text = self.tok(toks, 2)?;
    let (dest, lane) = if let Some(lane) = dest_text.strip_prefix("__.") {
      let mut t = Token::new(lane, self.line);
      let c = t.read_chan()?;
      t.expect_done()?;
      (None, c)
    } else {
      (Some(self.whole_value(dest_text)?), 0)
    };
    self.expect_colon(toks, 3)?;

    let mut i = 4;
    let mut srcs = vec![];
    while i < toks.len() && !toks[i].starts_with('{') {
      srcs.push(self.src(toks[i])?);
      i += 1;
    }
    let flags_text = self.tok(toks, i)?;
    let flags = match flags_text.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
      Some(letters) => AluFlags::from_letters(letters),
      None => None,
    };
    let flags = match flags {
      Some(f) => f,
      None => return self.error(flags_text, "bad flags"),
    };
    i += 1;

    let mut bank_swizzle = None;
    let mut cf = None;
    for t in &toks[i..] {
      if let Some(bs) = BankSwizzle::from_name(t) {
        bank_swizzle = Some(bs);
      } else if let Some(c) = AluCf::from_name(t) {
        cf = Some(c);
      } else {
        return self.error(t, "expected bank swizzle or control flow");
      }
    }

    let nsrc = op.info().nsrc as usize;
    let slots = if nsrc == 0 { op.info().slots as usize } else { srcs.len() / nsrc };
    if slots == 0 || slots * nsrc != srcs.len() || slots > NUM_CHANNELS {
      return self.error(name, "wrong number of operands");
    }
    let mut alu = AluInstr::multislot(op, dest, srcs, slots as u8);
    alu.lane = lane;
    alu.flags = flags;
    alu.bank_swizzle = bank_swizzle;
    alu.cf = cf;
    Ok(alu)
  }

  fn lds(&mut self, toks: &[&str]) -> ParseResult<LdsInstr> {
    let name = self.tok(toks, 1)?;
    let op = match LdsOp::from_name(name) {
      Some(op) => op,
      None => return self.error(name, "unknown LDS opcode"),
    };
    let dest_text = self.tok(toks, 2)?;
    let dest = if dest_text == "__" { None } else { Some(self.whole_value(dest_text)?) };
    self.expect_colon(toks, 3)?;
    let mut srcs = vec![];
    for t in &toks[4..] {
      srcs.push(self.whole_value(t)?);
    }
    Ok(LdsInstr { op, dest, srcs: srcs.into_iter().collect() })
  }

  fn fetch(&mut self, toks: &[&str]) -> ParseResult<FetchInstr> {
    let name = self.tok(toks, 1)?;
    let op = match name {
      "VTX" => FetchOp::Vtx,
      "SAMPLE" => FetchOp::Sample,
      _ => return self.error(name, "unknown fetch"),
    };
    let dest = self.vec_reg(self.tok(toks, 2)?)?;
    self.expect_colon(toks, 3)?;
    let src = self.vec_reg(self.tok(toks, 4)?)?;
    let rid_text = self.tok(toks, 5)?;
    let rid = rid_text.strip_prefix("{RID:").and_then(|s| s.strip_suffix('}'));
    let resource_id = match rid.map(|s| s.parse::<u32>()) {
      Some(Ok(n)) => n,
      _ => return self.error(rid_text, "expected {RID:<n>}"),
    };
    if toks.len() > 6 {
      return self.error(toks[6], "trailing tokens");
    }
    Ok(FetchInstr { op, dest, src, resource_id })
  }

  fn export(&mut self, toks: &[&str]) -> ParseResult<ExportInstr> {
    let target = self.tok(toks, 1)?;
    let split = target.find(|c: char| c.is_ascii_digit()).unwrap_or(target.len());
    let kind = match &target[..split] {
      "PIXEL" => ExportKind::Pixel,
      "POS" => ExportKind::Pos,
      "PARAM" => ExportKind::Param,
      _ => return self.error(target, "unknown export target"),
    };
    let location = match target[split..].parse::<u32>() {
      Ok(n) => n,
      Err(_) => return self.error(target, "expected export location"),
    };
    self.expect_colon(toks, 2)?;
    let value = self.vec_reg(self.tok(toks, 3)?)?;
    let last = match toks.get(4) {
      None => false,
      Some(&"{LAST}") => true,
      Some(t) => return self.error(t, "expected {LAST}"),
    };
    Ok(ExportInstr { kind, location, value, last })
  }

  fn cf(&mut self, toks: &[&str]) -> ParseResult<Option<CfInstr>> {
    let line = self.line;
    let nargs = |n: usize| -> ParseResult<()> {
      if toks.len() != n + 1 {
        return Err(ParseError::Parse {
          line,
          token: toks[0].to_string(),
          msg: format!("expected {} operands", n),
        });
      }
      Ok(())
    };
    let cf = match toks[0] {
      "IF" | "SWITCH" => {
        nargs(1)?;
        let v = self.whole_value(toks[1])?;
        if toks[0] == "IF" {
          CfInstr::If(v)
        } else {
          CfInstr::Switch(v)
        }
      }
      "CASE" => {
        nargs(1)?;
        match toks[1].parse::<u32>() {
          Ok(n) => CfInstr::Case(n),
          Err(_) => return self.error(toks[1], "expected case value"),
        }
      }
      "ELSE" => CfInstr::Else,
      "ENDIF" => CfInstr::EndIf,
      "LOOP_BEGIN" => CfInstr::LoopBegin,
      "LOOP_END" => CfInstr::LoopEnd,
      "BREAK" => CfInstr::Break,
      "CONTINUE" => CfInstr::Continue,
      "DEFAULT" => CfInstr::Default,
      "ENDSWITCH" => CfInstr::EndSwitch,
      _ => return Ok(None),
    };
    match cf {
      CfInstr::If(_) | CfInstr::Switch(_) | CfInstr::Case(_) => {}
      _ => nargs(0)?,
    }
    Ok(Some(cf))
  }

  fn array(&mut self, toks: &[&str]) -> ParseResult<()> {
    if !self.shader.blocks.is_empty() {
      return self.error(toks[0], "arrays must come before the first block");
    }
    let mut t = Token::new(self.tok(toks, 1)?, self.line);
    t.expect_char('A')?;
    let base = t.read_sel()?;
    t.expect_done()?;
    let size = match self.tok(toks, 2)?.parse::<u32>() {
      Ok(n) if n > 0 => n,
      _ => return self.error(toks[2], "expected array length"),
    };
    let mut mask = 0u8;
    let mut t = Token::new(self.tok(toks, 3)?, self.line);
    while t.peek().is_some() {
      let c = t.read_chan()?;
      if c == CHAN_MASKED || mask & (1 << c) != 0 {
        return t.error("bad channel list");
      }
      mask |= 1 << c;
    }
    // Channels must be contiguous.
    let shifted = mask >> mask.trailing_zeros();
    if mask == 0 || shifted & (shifted + 1) != 0 {
      return self.error(toks[3], "array channels must be contiguous");
    }
    self.shader.vf.declare_array(base, size, mask);
    Ok(())
  }

  fn current_block(&self, token: &str) -> ParseResult<usize> {
    match self.block {
      Some(b) => Ok(b),
      None => self.error(token, "instruction outside of a block"),
    }
  }

  fn line(&mut self, toks: &[&str]) -> ParseResult<()> {
    match toks[0] {
      "ARRAY" => return self.array(toks),
      "BLOCK_START" => {
        if self.block.is_some() {
          return self.error(toks[0], "nested block");
        }
        let id = self.shader.blocks.len() as i32;
        match self.tok(toks, 1)?.parse::<i32>() {
          Ok(n) if n == id => {}
          _ => return self.error(toks[0], "blocks must be numbered in order"),
        }
        self.block = Some(self.shader.new_block());
        return Ok(());
      }
      "BLOCK_END" => {
        if self.group.is_some() {
          return self.error(toks[0], "unterminated ALU group");
        }
        if self.block.take().is_none() {
          return self.error(toks[0], "no block to end");
        }
        return Ok(());
      }
      _ => {}
    }

    let block = self.current_block(toks[0])?;
    match toks[0] {
      "ALU_GROUP_BEGIN" => {
        if self.group.is_some() {
          return self.error(toks[0], "nested ALU group");
        }
        self.group = Some(vec![]);
      }
      "ALU_GROUP_END" => {
        let members = match self.group.take() {
          Some(m) => m,
          None => return self.error(toks[0], "no ALU group to end"),
        };
        if self.shader.emit_group(block, members, true).is_none() {
          return self.error(toks[0], "group members collide");
        }
      }
      "ALU" => {
        let alu = self.alu(toks)?;
        match self.group.as_mut() {
          Some(g) => g.push(alu),
          None => {
            self.shader.emit(block, InstrKind::Alu(alu));
          }
        }
      }
      _ if self.group.is_some() => return self.error(toks[0], "only ALU instructions go in a group"),
      "LDS" => {
        let lds = self.lds(toks)?;
        self.shader.emit(block, InstrKind::Lds(lds));
      }
      "FETCH" => {
        let fetch = self.fetch(toks)?;
        self.shader.emit(block, InstrKind::Fetch(fetch));
      }
      "EXPORT" => {
        let export = self.export(toks)?;
        self.shader.emit(block, InstrKind::Export(export));
      }
      _ => match self.cf(toks)? {
        Some(cf) => {
          self.shader.emit(block, InstrKind::ControlFlow(cf));
        }
        None => return self.error(toks[0], "unknown instruction"),
      },
    }
    Ok(())
  }
}

pub fn parse_content(content: &str) -> ParseResult<Shader> {
  let mut p = Parser::new();
  for (n, raw) in content.lines().enumerate() {
    p.line = n + 1;
    let text = match raw.find(';') {
      Some(i) => &raw[..i],
      None => raw,
    };
    let toks: Vec<&str> = text.split_whitespace().collect();
    if toks.is_empty() {
      continue;
    }
    p.line(&toks)?;
  }
  if p.block.is_some() {
    return p.error("BLOCK_START", "missing BLOCK_END");
  }
  Ok(p.shader)
}

#[cfg(test)]
mod tests {
  use super::*;
  use vliwra::data_structures::InstIx;
  use vliwra::SourceKey;

  /// Both shaders hold the same instructions, block by block.
  fn same_program(a: &Shader, b: &Shader) -> bool {
    if a.blocks.len() != b.blocks.len() {
      return false;
    }
    for (ba, bb) in a.blocks.iter().zip(b.blocks.iter()) {
      let live = |sh: &Shader, items: &[InstIx]| -> Vec<InstIx> {
        let mut res = vec![];
        for ix in items {
          if sh.instrs[*ix].is_dead() {
            continue;
          }
          match sh.instrs[*ix].kind.as_group() {
            Some(g) => res.extend(g.members()),
            None => res.push(*ix),
          }
        }
        res
      };
      let (ia, ib) = (live(a, &ba.items), live(b, &bb.items));
      if ia.len() != ib.len() || !ia.iter().zip(ib.iter()).all(|(x, y)| a.same_instr(*x, b, *y)) {
        return false;
      }
    }
    true
  }

  fn round_trip(sh: &Shader) {
    let text = sh.render();
    let parsed = match parse_content(&text) {
      Ok(p) => p,
      Err(e) => panic!("{}\n{}", e, text),
    };
    assert!(same_program(sh, &parsed), "{}", text);
    assert_eq!(parsed.render(), text);
  }

  #[test]
  fn every_instruction_kind_round_trips() {
    let mut vf = ValueFactory::new();
    let input = vf.physical(0, 1, true);
    vf.request_array(0, 4, 2);
    vf.allocate_arrays();
    let mut sh = Shader::new(vf);
    let b = sh.new_block();
    let arr = sh.vf.array_for_source(0).unwrap();
    let a = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::None);
    let c = sh.vf.dest_for(SourceKey::Var(1), 2, Pin::Chan);
    let idx = sh.vf.dest_for(SourceKey::Ssa(2), 0, Pin::Chan);
    let elem = sh.vf.array_element(arr, 1, 0, Some(idx)).unwrap();
    let direct = sh.vf.array_element(arr, 3, 1, None).unwrap();
    let lit = sh.vf.literal(0x4049_0fdb);
    let half = sh.vf.inline_constant(InlineConstant::Half);
    let kc = sh.vf.uniform(1, 17, 3, Some(idx));
    let kc_direct = sh.vf.uniform(0, 2, 0, None);

    let mut add = AluInstr::new(AluOp::Add, Some(a), vec![Src::new(input), Src::new(lit)]);
    add.srcs[1].neg = true;
    add.srcs[0].abs = true;
    sh.emit(b, InstrKind::Alu(add));
    sh.emit(b, InstrKind::Alu(AluInstr::new(AluOp::Mov, Some(idx), vec![Src::new(kc_direct)])));
    let mut muladd = AluInstr::new(
      AluOp::MulAdd,
      Some(c),
      vec![Src::new(elem), Src::new(kc), Src::new(half)],
    );
    muladd.flags.clamp = true;
    sh.emit(b, InstrKind::Alu(muladd));
    sh.emit(b, InstrKind::Alu(AluInstr::new(AluOp::Mov, Some(direct), vec![Src::new(a)])));
    let mut brk = AluInstr::without_dest(AluOp::PredSetNe, 3, vec![Src::new(a), Src::new(half)]);
    brk.flags.update_exec = true;
    brk.flags.update_pred = true;
    brk.cf = Some(AluCf::Break);
    sh.emit(b, InstrKind::ControlFlow(CfInstr::LoopBegin));
    sh.emit(b, InstrKind::Alu(brk));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::LoopEnd));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::If(a)));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::Else));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::EndIf));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::Switch(idx)));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::Case(3)));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::Break));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::Default));
    sh.emit(b, InstrKind::ControlFlow(CfInstr::EndSwitch));

    let b2 = sh.new_block();
    let lds_dest = sh.vf.dest_for(SourceKey::Ssa(5), 1, Pin::None);
    let lds = LdsInstr { op: LdsOp::AddRet, dest: Some(lds_dest), srcs: [a, idx].iter().cloned().collect() };
    sh.emit(b2, InstrKind::Lds(lds));
    let lds_w = LdsInstr { op: LdsOp::Write, dest: None, srcs: [a, lds_dest].iter().cloned().collect() };
    sh.emit(b2, InstrKind::Lds(lds_w));
    let coords = sh.vf.temp_vec4(Pin::Group);
    let texel = sh.vf.temp_vec4(Pin::Group);
    let mut src = VecReg::new(coords);
    src.swizzle[3] = CHAN_MASKED;
    let mut dest = VecReg::new(texel);
    dest.swizzle = [0, 1, CHAN_MASKED, 3];
    sh.emit(b2, InstrKind::Fetch(FetchInstr { op: FetchOp::Sample, dest, src, resource_id: 2 }));
    let value = VecReg::new(texel);
    sh.emit(
      b2,
      InstrKind::Export(ExportInstr { kind: ExportKind::Param, location: 5, value, last: true }),
    );

    round_trip(&sh);
  }

  #[test]
  fn groups_round_trip() {
    let mut sh = Shader::new(ValueFactory::new());
    let b = sh.new_block();
    let one = sh.vf.inline_constant(InlineConstant::One);
    let x = sh.vf.dest_for(SourceKey::Ssa(0), 0, Pin::Chan);
    let y = sh.vf.dest_for(SourceKey::Ssa(1), 1, Pin::Chan);
    let t = sh.vf.dest_for(SourceKey::Ssa(2), 0, Pin::None);
    let mut mx = AluInstr::new(AluOp::Mov, Some(x), vec![Src::new(one)]);
    mx.bank_swizzle = Some(BankSwizzle::Vec012);
    let mut my = AluInstr::new(AluOp::Mov, Some(y), vec![Src::new(one)]);
    my.bank_swizzle = Some(BankSwizzle::Vec012);
    let mut rcp = AluInstr::new(AluOp::RecipIeee, Some(t), vec![Src::new(x)]);
    rcp.bank_swizzle = Some(BankSwizzle::Scl210);
    rcp.flags.last = true;
    sh.emit_group(b, vec![mx, my, rcp], true).unwrap();
    // A multi-lane transcendental outside any group.
    let z = sh.vf.dest_for(SourceKey::Ssa(3), 2, Pin::Chan);
    let srcs = (0..3).map(|_| Src::new(y));
    sh.emit(b, InstrKind::Alu(AluInstr::multislot(AluOp::Cos, Some(z), srcs, 3)));
    round_trip(&sh);
  }

  #[test]
  fn errors_name_line_and_token() {
    let text = "BLOCK_START 0\n  ALU MOV S1024.x : I[ONE] {W}\n  ALU FOO S1025.x : I[ONE] {W}\nBLOCK_END\n";
    match parse_content(text) {
      Err(ParseError::Parse { line, token, .. }) => {
        assert_eq!(line, 3);
        assert_eq!(token, "FOO");
      }
      other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    // Two different pins for one register.
    let text = "BLOCK_START 0\n  ALU MOV S1024.x : I[ONE] {W}\n  ALU MOV S1024.x@chan : I[ONE] {W}\nBLOCK_END\n";
    assert!(parse_content(text).is_err());
    assert!(parse_content("ALU MOV S1024.x : I[ONE] {W}\n").is_err());
    assert!(parse_content("BLOCK_START 0\n").is_err());
    assert!(parse_content("BLOCK_START 0\n  ALU MOV S1024.x : I[NOPE] {W}\nBLOCK_END\n").is_err());
  }
}
