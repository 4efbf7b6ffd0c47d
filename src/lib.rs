//! Mango VM library.
//!
//! An embeddable stack-based bytecode virtual machine that runs inside a
//! single caller-supplied memory block, plus a text assembler for its module
//! images.

pub mod utils;
pub mod virtual_machine;
