/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the vliwra library: register
//! allocation and VLIW bundling for a banked GPU ALU pipeline.

pub mod alu_group;
pub mod data_structures;
pub mod instr;
pub mod lower;
pub mod opcodes;
pub mod shader;
pub mod value;
pub mod value_factory;

// Make the analysis passes public for fuzzing.
#[cfg(feature = "fuzzing")]
pub mod live_range;
#[cfg(not(feature = "fuzzing"))]
mod live_range;

#[cfg(feature = "fuzzing")]
pub mod program_scope;
#[cfg(not(feature = "fuzzing"))]
mod program_scope;

mod checker;
mod coloring;
mod interface;
mod interference;

pub use crate::interface::*;
pub use crate::lower::{
  lower, lower_lds, DestKind, OperandKind, SourceArray, SourceBlock, SourceDest, SourceOp,
  SourceOperand, SourceProgram,
};
pub use crate::shader::{Block, Shader};
pub use crate::value_factory::{SourceKey, ValueFactory};
