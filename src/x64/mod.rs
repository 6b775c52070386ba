//! x86-64 backend.
//!
//! Two stages over the IR produced by the machine-independent pass: a
//! linear-scan register allocator over live ranges, and an instruction
//! selector that maps each IR instruction to native SSE2 code (SSE4.1
//! forms where the host supports them and the caller did not disable
//! them), emitted through the iced-x86 assembler.

pub mod codegen;
pub mod encoder;
pub mod regalloc;

pub use codegen::CodeGenerator;
pub use encoder::X64Encoder;
pub use regalloc::{AsmReg, LinearScan, Location, RegBitSet};
