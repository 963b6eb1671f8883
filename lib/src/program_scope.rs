/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The lexical scope tree walked by the live range evaluator.
//!
//! A scope covers the program lines `[begin, end]` of one loop body, if or
//! else branch, switch body or switch case.  Scopes are created in document
//! order while walking the program, and each one is closed exactly once,
//! when its region ends.  An if branch and its else branch share an id;
//! that is how a write in one branch finds the write in its sibling.

use std::fmt;

use crate::data_structures::{ScopeIx, TypedIxVec};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScopeKind {
  Outer,
  Loop,
  If,
  Else,
  SwitchBody,
  SwitchCase,
  SwitchDefault,
}

#[derive(Clone)]
pub struct ProgramScope {
  pub kind: ScopeKind,
  pub id: i32,
  pub depth: i32,
  pub begin: i32,
  /// -1 while the scope is still open.
  pub end: i32,
  /// First line in this loop that leaves it early.
  break_line: i32,
  pub parent: Option<ScopeIx>,
}

impl fmt::Debug for ProgramScope {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(
      fmt,
      "{:?}#{} depth {} [{}, {}]",
      self.kind, self.id, self.depth, self.begin, self.end
    )
  }
}

pub struct ScopeTree {
  scopes: TypedIxVec<ScopeIx, ProgramScope>,
}

impl ScopeTree {
  /// A tree holding just the outermost scope, which starts at line 0.
  pub fn new() -> Self {
    let mut scopes = TypedIxVec::new();
    scopes.push(ProgramScope {
      kind: ScopeKind::Outer,
      id: 0,
      depth: 0,
      begin: 0,
      end: -1,
      break_line: i32::MAX,
      parent: None,
    });
    Self { scopes }
  }

  pub fn outer(&self) -> ScopeIx {
    ScopeIx::new(0)
  }

  pub fn create(
    &mut self, parent: ScopeIx, kind: ScopeKind, id: i32, depth: i32, begin: i32,
  ) -> ScopeIx {
    self.scopes.push(ProgramScope {
      kind,
      id,
      depth,
      begin,
      end: -1,
      break_line: i32::MAX,
      parent: Some(parent),
    })
  }

  pub fn len(&self) -> u32 {
    self.scopes.len()
  }

  pub fn get(&self, s: ScopeIx) -> &ProgramScope {
    &self.scopes[s]
  }

  pub fn kind(&self, s: ScopeIx) -> ScopeKind {
    self.scopes[s].kind
  }

  pub fn id(&self, s: ScopeIx) -> i32 {
    self.scopes[s].id
  }

  pub fn depth(&self, s: ScopeIx) -> i32 {
    self.scopes[s].depth
  }

  pub fn begin(&self, s: ScopeIx) -> i32 {
    self.scopes[s].begin
  }

  pub fn end(&self, s: ScopeIx) -> i32 {
    self.scopes[s].end
  }

  pub fn parent(&self, s: ScopeIx) -> Option<ScopeIx> {
    self.scopes[s].parent
  }

  /// Close a scope.  Only the first call has an effect.
  pub fn set_end(&mut self, s: ScopeIx, end: i32) {
    let scope = &mut self.scopes[s];
    if scope.end == -1 {
      scope.end = end;
    }
  }

  /// Close every scope still open, at `end`.
  pub fn close_all(&mut self, end: i32) {
    for s in self.scopes.iter_mut() {
      if s.end == -1 {
        s.end = end;
      }
    }
  }

  pub fn is_loop(&self, s: ScopeIx) -> bool {
    self.kind(s) == ScopeKind::Loop
  }

  pub fn is_conditional(&self, s: ScopeIx) -> bool {
    match self.kind(s) {
      ScopeKind::If | ScopeKind::Else | ScopeKind::SwitchCase | ScopeKind::SwitchDefault => true,
      _ => false,
    }
  }

  fn is_switch_case(&self, s: ScopeIx) -> bool {
    match self.kind(s) {
      ScopeKind::SwitchCase | ScopeKind::SwitchDefault => true,
      _ => false,
    }
  }

  /// Walk from `s` towards the root, returning the first scope `pred`
  /// accepts.
  fn find_up<P: Fn(ScopeIx) -> bool>(&self, s: ScopeIx, pred: P) -> Option<ScopeIx> {
    let mut cur = Some(s);
    while let Some(c) = cur {
      if pred(c) {
        return Some(c);
      }
      cur = self.parent(c);
    }
    None
  }

  pub fn is_in_loop(&self, s: ScopeIx) -> bool {
    self.innermost_loop(s).is_some()
  }

  pub fn innermost_loop(&self, s: ScopeIx) -> Option<ScopeIx> {
    self.find_up(s, |c| self.is_loop(c))
  }

  pub fn outermost_loop(&self, s: ScopeIx) -> Option<ScopeIx> {
    let mut res = None;
    let mut cur = Some(s);
    while let Some(c) = cur {
      if self.is_loop(c) {
        res = Some(c);
      }
      cur = self.parent(c);
    }
    res
  }

  pub fn enclosing_conditional(&self, s: ScopeIx) -> Option<ScopeIx> {
    self.find_up(s, |c| self.is_conditional(c))
  }

  /// The innermost if or else branch containing `s`, `s` included.
  pub fn in_ifelse_scope(&self, s: ScopeIx) -> Option<ScopeIx> {
    self.find_up(s, |c| match self.kind(c) {
      ScopeKind::If | ScopeKind::Else => true,
      _ => false,
    })
  }

  pub fn in_else_scope(&self, s: ScopeIx) -> Option<ScopeIx> {
    self.find_up(s, |c| self.kind(c) == ScopeKind::Else)
  }

  /// The innermost if or else branch strictly containing `s`.
  pub fn in_parent_ifelse_scope(&self, s: ScopeIx) -> Option<ScopeIx> {
    self.parent(s).and_then(|p| self.in_ifelse_scope(p))
  }

  /// Is `s` strictly nested in `other`?
  pub fn is_child_of(&self, s: ScopeIx, other: ScopeIx) -> bool {
    let mut cur = self.parent(s);
    while let Some(c) = cur {
      if c == other {
        return true;
      }
      cur = self.parent(c);
    }
    false
  }

  /// Is `s` nested in the sibling branch of the if/else branch `other`?
  pub fn is_child_of_ifelse_id_sibling(&self, s: ScopeIx, other: ScopeIx) -> bool {
    let mut cur = self.in_parent_ifelse_scope(s);
    while let Some(c) = cur {
      if self.id(c) == self.id(other) && self.kind(c) != self.kind(other) {
        return true;
      }
      cur = self.in_parent_ifelse_scope(c);
    }
    false
  }

  pub fn contains_range_of(&self, s: ScopeIx, other: ScopeIx) -> bool {
    self.begin(s) <= self.begin(other) && self.end(s) >= self.end(other)
  }

  pub fn is_switchcase_scope_in_loop(&self, s: ScopeIx) -> bool {
    self.is_switch_case(s) && self.is_in_loop(s)
  }

  /// Does a `break` at `s` leave a switch case rather than a loop?
  pub fn break_is_for_switchcase(&self, s: ScopeIx) -> bool {
    let mut cur = Some(s);
    while let Some(c) = cur {
      match self.kind(c) {
        ScopeKind::Loop => return false,
        ScopeKind::SwitchBody | ScopeKind::SwitchCase | ScopeKind::SwitchDefault => return true,
        _ => cur = self.parent(c),
      }
    }
    false
  }

  /// Record an early exit at `line` on the innermost loop around `s`.
  pub fn set_loop_break_line(&mut self, s: ScopeIx, line: i32) {
    if let Some(l) = self.innermost_loop(s) {
      let scope = &mut self.scopes[l];
      scope.break_line = scope.break_line.min(line);
    }
  }

  pub fn loop_break_line(&self, s: ScopeIx) -> i32 {
    self.scopes[s].break_line
  }
}

impl Default for ScopeTree {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // 0: outer
  // 1: LOOP          [1, 9]
  // 3:   IF #1        [3, 4]
  // 6:   ELSE #1      [6, 7]
  fn loop_with_ifelse() -> (ScopeTree, ScopeIx, ScopeIx, ScopeIx) {
    let mut t = ScopeTree::new();
    let outer = t.outer();
    let l = t.create(outer, ScopeKind::Loop, 1, 1, 1);
    let i = t.create(l, ScopeKind::If, 1, 2, 3);
    t.set_end(i, 4);
    let e = t.create(l, ScopeKind::Else, 1, 2, 6);
    t.set_end(e, 7);
    t.set_end(l, 9);
    t.close_all(10);
    (t, l, i, e)
  }

  #[test]
  fn ancestry_queries() {
    let (t, l, i, e) = loop_with_ifelse();
    assert!(t.is_child_of(i, l));
    assert!(t.is_child_of(i, t.outer()));
    assert!(!t.is_child_of(l, i));
    assert!(!t.is_child_of(i, i));
    assert_eq!(t.innermost_loop(e), Some(l));
    assert_eq!(t.outermost_loop(e), Some(l));
    assert_eq!(t.enclosing_conditional(e), Some(e));
    assert_eq!(t.enclosing_conditional(l), None);
    assert_eq!(t.in_ifelse_scope(i), Some(i));
    assert_eq!(t.in_else_scope(i), None);
    assert!(t.contains_range_of(l, e));
    assert!(!t.contains_range_of(i, e));
  }

  #[test]
  fn nested_branch_finds_its_parents_sibling() {
    let (mut t, _, i, e) = loop_with_ifelse();
    let inner = t.create(e, ScopeKind::If, 2, 3, 6);
    assert!(t.is_child_of_ifelse_id_sibling(inner, i));
    assert!(!t.is_child_of_ifelse_id_sibling(inner, e));
  }

  #[test]
  fn breaks_go_to_the_right_construct() {
    let (mut t, l, i, _) = loop_with_ifelse();
    assert!(!t.break_is_for_switchcase(i));
    t.set_loop_break_line(i, 4);
    t.set_loop_break_line(i, 3);
    assert_eq!(t.loop_break_line(l), 3);

    let sw = t.create(l, ScopeKind::SwitchBody, 1, 2, 5);
    let case = t.create(sw, ScopeKind::SwitchCase, 1, 3, 5);
    assert!(t.break_is_for_switchcase(case));
    assert!(t.is_switchcase_scope_in_loop(case));
  }

  #[test]
  fn end_is_set_once() {
    let mut t = ScopeTree::new();
    let outer = t.outer();
    let s = t.create(outer, ScopeKind::If, 1, 1, 2);
    t.set_end(s, 5);
    t.set_end(s, 8);
    assert_eq!(t.end(s), 5);
  }
}
