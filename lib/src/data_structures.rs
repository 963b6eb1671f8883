/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures shared by the whole crate: hashed sets and maps, vectors
//! indexed by typed entity handles, and the handle types themselves.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::slice::{Iter, IterMut};

//=============================================================================
// Maps

pub type Map<K, V> = FxHashMap<K, V>;

//=============================================================================
// Sets of things

#[derive(Clone, PartialEq, Eq)]
pub struct Set<T: Eq + Hash> {
  set: FxHashSet<T>,
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> Set<T> {
  #[inline(never)]
  pub fn empty() -> Self {
    Self { set: FxHashSet::<T>::default() }
  }

  pub fn unit(item: T) -> Self {
    let mut s = Self::empty();
    s.insert(item);
    s
  }

  pub fn card(&self) -> usize {
    self.set.len()
  }

  /// Returns true if the item was not present yet.
  pub fn insert(&mut self, item: T) -> bool {
    self.set.insert(item)
  }

  /// Returns true if the item was present.
  pub fn delete(&mut self, item: T) -> bool {
    self.set.remove(&item)
  }

  pub fn is_empty(&self) -> bool {
    self.set.is_empty()
  }

  pub fn contains(&self, item: T) -> bool {
    self.set.contains(&item)
  }

  pub fn union(&mut self, other: &Self) {
    for item in other.set.iter() {
      self.set.insert(*item);
    }
  }

  pub fn is_subset_of(&self, other: &Self) -> bool {
    self.set.is_subset(&other.set)
  }

  /// The elements in ascending order.  Iterating the set directly gives a
  /// hash order, which must never leak into allocation decisions.
  pub fn to_vec(&self) -> Vec<T> {
    let mut res: Vec<T> = self.set.iter().cloned().collect();
    res.sort_unstable();
    res
  }

  pub fn from_vec(vec: Vec<T>) -> Self {
    let mut res = Set::<T>::empty();
    for x in vec {
      res.insert(x);
    }
    res
  }

  pub fn iter(&self) -> std::collections::hash_set::Iter<T> {
    self.set.iter()
  }
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> fmt::Debug for Set<T> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.to_vec())
  }
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> Default for Set<T> {
  fn default() -> Self {
    Self::empty()
  }
}

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored).

pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  ty_ix: PhantomData<TyIx>,
}

impl<TyIx, Ty> TypedIxVec<TyIx, Ty>
where
  TyIx: From<u32> + Into<u32> + Copy,
{
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn from_vec(vek: Vec<Ty>) -> Self {
    Self { vek, ty_ix: PhantomData::<TyIx> }
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn iter_mut(&mut self) -> IterMut<Ty> {
    self.vek.iter_mut()
  }
  pub fn len(&self) -> u32 {
    self.vek.len() as u32
  }
  pub fn is_empty(&self) -> bool {
    self.vek.is_empty()
  }
  /// Appends an element and hands back its handle.
  pub fn push(&mut self, item: Ty) -> TyIx {
    let ix = TyIx::from(self.vek.len() as u32);
    self.vek.push(item);
    ix
  }
  pub fn get(&self, ix: TyIx) -> Option<&Ty> {
    self.vek.get(ix.into() as usize)
  }
  /// All handles, in allocation order.
  pub fn indices(&self) -> impl Iterator<Item = TyIx> {
    (0..self.vek.len() as u32).map(TyIx::from)
  }
}

impl<TyIx, Ty> Index<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  type Output = Ty;
  fn index(&self, ix: TyIx) -> &Ty {
    &self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> IndexMut<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  fn index_mut(&mut self, ix: TyIx) -> &mut Ty {
    &mut self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> Clone for TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
{
  fn clone(&self) -> Self {
    Self { vek: self.vek.clone(), ty_ix: PhantomData::<TyIx> }
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    fmt.debug_list().entries(self.vek.iter()).finish()
  }
}

//=============================================================================
// Entity handles.  Every entity owned by a compilation session (values,
// instructions, scopes, arrays) lives in an arena and is addressed by one of
// these; use/def sets are sets of handles, so deleting an instruction never
// leaves anything dangling.

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $PrintingPrefix:expr) => {
    #[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
    #[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct $TypeIx(u32);

    impl $TypeIx {
      #[inline(always)]
      pub fn new(n: u32) -> $TypeIx {
        $TypeIx(n)
      }
      #[inline(always)]
      pub fn get(self) -> u32 {
        self.0
      }
      pub fn plus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 + delta)
      }
    }
    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, self.0)
      }
    }
    impl From<u32> for $TypeIx {
      fn from(n: u32) -> Self {
        $TypeIx(n)
      }
    }
    impl From<$TypeIx> for u32 {
      fn from(ix: $TypeIx) -> u32 {
        ix.0
      }
    }
  };
}

generate_boilerplate!(InstIx, "i");

generate_boilerplate!(ValueIx, "v");

generate_boilerplate!(ArrayIx, "a");

generate_boilerplate!(ScopeIx, "s");
