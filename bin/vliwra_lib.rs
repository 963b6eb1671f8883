/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Test support for the vliwra library: the text parser, an interpreter for
//! lowered shaders, the test programs and a random program generator.

pub mod fuzzing;
pub mod parser;
pub mod test_cases;
pub mod test_framework;
