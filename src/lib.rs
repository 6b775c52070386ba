//! VEXL is an embeddable JIT compiler for a small statically-typed
//! shading language.
//!
//! A host application describes the shape of its input/output records
//! with [`Layout`]s, hands source text to [`Isolate::compile`], and
//! receives a [`Program`] whose entry point computes the shader over
//! those records at near-native speed.
//!
//! ```no_run
//! use vexl::{CompileArgs, Isolate, Layout, Options, Program, TypeInfo};
//!
//! let mut out = Layout::new();
//! out.configure("")?;
//! out.add("@ret", TypeInfo::FLOAT, 0)?;
//!
//! let isolate = Isolate::new();
//! let mut program = Program::new();
//! isolate.compile(
//!     &mut program,
//!     &CompileArgs {
//!         body: "float main() { return 1.0 + 2.0 * 3.0; }",
//!         layouts: &[&out],
//!         options: Options::NONE,
//!     },
//!     None,
//! )?;
//!
//! let mut result = 0f32;
//! unsafe { program.run(&[&mut result as *mut f32 as *mut _])? };
//! assert_eq!(result, 7.0);
//! # Ok::<(), vexl::Error>(())
//! ```
//!
//! # Architecture
//!
//! The pipeline is a straight line with arena-owned intermediates:
//! source → [`parser`] → AST → [`sema`] → [`ast_opt`] → [`ir::lower`] →
//! IR → [`ir::pass`] → [`x64`] backend → machine code. Every
//! intermediate lives in one per-compilation [`session`] arena and is
//! gone when `compile` returns; the only output is the machine code
//! owned by the program handle.

pub mod ast;
pub mod ast_opt;
pub mod error;
pub mod exec;
pub mod ir;
pub mod isolate;
pub mod lang;
pub mod layout;
pub mod lexer;
pub mod output_log;
pub mod parser;
pub mod sema;
pub mod session;
pub mod types;
pub mod x64;

pub use error::{Error, Result};
pub use isolate::{CompileArgs, Isolate, Options, Program, MAX_ARGUMENTS};
pub use layout::{Layout, Member, MAX_IDENTIFIER_LEN, MAX_MEMBERS};
pub use output_log::{Message, MessageKind, OutputLog};
pub use types::{TypeInfo, TypeKind, WidthClass};
