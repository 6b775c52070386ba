//! Compilation contexts, program handles and the compile driver.
//!
//! An [`Isolate`] owns the runtime configuration (detected CPU features)
//! shared by everything compiled through it; a [`Program`] is a
//! reference-counted handle to one compiled entry point plus the pages
//! it lives in. Both are cheaply clonable across threads: the impls are
//! immutable once published, refcounts use acquire/release ordering via
//! `Arc`, and the last release frees the machine code exactly once. A
//! static null impl backs default-constructed and `reset` handles.
//!
//! [`Isolate::compile`] runs the whole pipeline against a fresh
//! per-compilation arena: parse → analyze → optimize → lower → IR pass →
//! code generation, with debug dumps after each phase when requested.
//! The first error aborts the compile; dropping the arena releases every
//! intermediate, and no executable pages survive a failed compile.

use crate::ast::Ast;
use crate::ast_opt;
use crate::error::{Error, Result};
use crate::exec::ExecutableMemory;
use crate::ir::{lower, pass};
use crate::layout::Layout;
use crate::lexer;
use crate::output_log::{ErrorReporter, MessageKind, OutputLog};
use crate::parser;
use crate::sema::Analyzer;
use crate::session::CompilationSession;
use crate::x64::codegen::{self, CodeGenerator};
use bumpalo::Bump;
use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

/// Maximum number of argument records a program can take.
pub const MAX_ARGUMENTS: usize = 4;

/// Compile option flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options(u32);

impl Options {
    pub const NONE: Options = Options(0);
    /// Emit info-level messages through the log sink.
    pub const VERBOSE: Options = Options(1 << 0);
    /// Dump the AST before and after optimization.
    pub const DEBUG_AST: Options = Options(1 << 1);
    /// Dump the IR before and after the machine-independent pass.
    pub const DEBUG_IR: Options = Options(1 << 2);
    /// Dump disassembled machine code.
    pub const DEBUG_ASM: Options = Options(1 << 3);
    /// Suppress SSE4.1 code paths even when the host supports them.
    pub const DISABLE_SSE4_1: Options = Options(1 << 4);

    const DEBUG_MASK: u32 = Options::VERBOSE.0
        | Options::DEBUG_AST.0
        | Options::DEBUG_IR.0
        | Options::DEBUG_ASM.0;

    pub fn contains(self, other: Options) -> bool {
        self.0 & other.0 == other.0
    }

    fn without_debug(self) -> Options {
        Options(self.0 & !Options::DEBUG_MASK)
    }
}

impl std::ops::BitOr for Options {
    type Output = Options;

    fn bitor(self, rhs: Options) -> Options {
        Options(self.0 | rhs.0)
    }
}

/// One compile request.
pub struct CompileArgs<'a> {
    pub body: &'a str,
    pub layouts: &'a [&'a Layout],
    pub options: Options,
}

/// Runtime configuration owned by an isolate and shared by the programs
/// compiled through it.
#[derive(Debug)]
struct RuntimeData {
    sse41_supported: bool,
}

impl RuntimeData {
    fn detect() -> RuntimeData {
        #[cfg(target_arch = "x86_64")]
        let sse41_supported = std::arch::is_x86_feature_detected!("sse4.1");
        #[cfg(not(target_arch = "x86_64"))]
        let sse41_supported = false;
        RuntimeData { sse41_supported }
    }
}

/// A compilation context. Cloning shares the runtime; dropping the last
/// handle releases it.
#[derive(Clone)]
pub struct Isolate {
    runtime: Arc<RuntimeData>,
}

impl Isolate {
    pub fn new() -> Isolate {
        Isolate { runtime: Arc::new(RuntimeData::detect()) }
    }

    /// Deep-copying the runtime is not defined; callers get
    /// [`Error::InvalidState`].
    pub fn deep_clone(&self) -> Result<Isolate> {
        Err(Error::InvalidState("isolate cloning is not defined"))
    }

    /// Freezing the builtin table is not defined; callers get
    /// [`Error::InvalidState`].
    pub fn freeze(&self) -> Result<()> {
        Err(Error::InvalidState("isolate freezing is not defined"))
    }

    /// Compiles `args.body` against the given layouts and atomically
    /// publishes the result into `program` on success.
    pub fn compile(
        &self,
        program: &mut Program,
        args: &CompileArgs<'_>,
        log: Option<&mut dyn OutputLog>,
    ) -> Result<()> {
        let num_args = args.layouts.len();
        if num_args == 0 || num_args > MAX_ARGUMENTS {
            return Err(Error::InvalidArgument("argument record count"));
        }

        // Debug output needs somewhere to go.
        let options = if log.is_some() { args.options } else { args.options.without_debug() };
        let verbose = options.contains(Options::VERBOSE);
        let sse41 =
            self.runtime.sse41_supported && !options.contains(Options::DISABLE_SSE4_1);

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut reporter =
            ErrorReporter::new(args.body.as_bytes(), log, verbose);

        // Parse.
        let tokens = match lexer::tokenize(&session, args.body) {
            Ok(tokens) => tokens,
            Err(err) => return Err(report_syntax(&mut reporter, err)),
        };
        let mut ast = Ast::new();
        if let Err(err) = parser::parse_program(&mut ast, &tokens) {
            return Err(report_syntax(&mut reporter, err));
        }
        session.record_ast_nodes(ast.len());

        // Analyze; the analyzer reports its own diagnostics.
        let info = Analyzer::new(&session, &mut ast, &mut reporter, args.layouts).run()?;

        if options.contains(Options::DEBUG_AST) {
            let dump = ast.dump();
            reporter.dump(MessageKind::AstInitial, &dump);
        }

        ast_opt::optimize(&mut ast)?;

        if options.contains(Options::DEBUG_AST) {
            let dump = ast.dump();
            reporter.dump(MessageKind::AstFinal, &dump);
        }

        // Lower to IR and legalize.
        let mut func = lower::lower(&ast, &info, args.layouts)?;
        session.record_ir_instructions(func.inst_count());

        if options.contains(Options::DEBUG_IR) {
            let dump = func.dump();
            reporter.dump(MessageKind::IrInitial, &dump);
        }

        let pass_info = match pass::run(&mut func) {
            Ok(pass_info) => pass_info,
            Err(err) => {
                // Internal invariant failures have no source position.
                return Err(reporter.error(err, 0, "internal: IR invariant violated"));
            }
        };

        if options.contains(Options::DEBUG_IR) {
            let dump = func.dump();
            reporter.dump(MessageKind::IrFinal, &dump);
        }

        // Generate machine code.
        let code = match CodeGenerator::generate(&func, &pass_info, sse41) {
            Ok(code) => code,
            Err(err) => return Err(reporter.error(err, 0, "machine code generation failed")),
        };
        session.record_code_size(code.code_len);

        if options.contains(Options::DEBUG_ASM) {
            // Disassemble at a fixed base so identical compiles produce
            // identical dumps regardless of where the pages landed.
            let text = codegen::disassemble(&code.bytes, 0);
            reporter.dump(MessageKind::Asm, &text);
        }

        if verbose {
            let stats = session.stats();
            reporter.info(&format!(
                "compiled {} AST nodes, {} IR instructions into {} bytes",
                stats.ast_nodes, stats.ir_instructions, stats.code_size
            ));
        }

        // Publish: the old impl (and its pages) is released when the
        // handle swap drops the previous Arc.
        let entry = code.memory.entry() as usize;
        program.inner = Arc::new(ProgramImpl {
            runtime: Some(self.runtime.clone()),
            memory: Some(code.memory),
            entry,
            num_args,
        });
        Ok(())
    }
}

impl Default for Isolate {
    fn default() -> Self {
        Self::new()
    }
}

fn report_syntax(reporter: &mut ErrorReporter<'_, '_>, err: Error) -> Error {
    let position = match err {
        Error::InvalidSyntax { position } => position,
        _ => 0,
    };
    reporter.error(err, position, "invalid syntax")
}

struct ProgramImpl {
    /// Keeps the runtime alive as long as any program uses it. The null
    /// impl has none.
    #[allow(dead_code)]
    runtime: Option<Arc<RuntimeData>>,
    memory: Option<ExecutableMemory>,
    entry: usize,
    num_args: usize,
}

// Entry and pages are immutable after publication.
unsafe impl Send for ProgramImpl {}
unsafe impl Sync for ProgramImpl {}

fn null_impl() -> Arc<ProgramImpl> {
    static NULL: OnceLock<Arc<ProgramImpl>> = OnceLock::new();
    NULL.get_or_init(|| {
        Arc::new(ProgramImpl { runtime: None, memory: None, entry: 0, num_args: 0 })
    })
    .clone()
}

/// Handle to one compiled program. Clones share the machine code; the
/// underlying pages are released when the last handle drops.
#[derive(Clone)]
pub struct Program {
    inner: Arc<ProgramImpl>,
}

impl Program {
    pub fn new() -> Program {
        Program { inner: null_impl() }
    }

    pub fn is_compiled(&self) -> bool {
        self.inner.memory.is_some()
    }

    pub fn num_args(&self) -> usize {
        self.inner.num_args
    }

    /// Swaps the null impl back in; the previous code is released when
    /// its last handle drops.
    pub fn reset(&mut self) {
        self.inner = null_impl();
    }

    /// Runs the compiled function with one pointer per argument record.
    ///
    /// # Safety
    ///
    /// Each pointer must reference a record laid out exactly as the
    /// corresponding `Layout` described at compile time, writable where
    /// the program stores results.
    pub unsafe fn run(&self, args: &[*mut c_void]) -> Result<()> {
        if !self.is_compiled() {
            return Err(Error::InvalidState("program is not compiled"));
        }
        if args.len() != self.inner.num_args {
            return Err(Error::InvalidArgument("argument pointer count"));
        }
        let entry = self.inner.entry;
        match args.len() {
            1 => {
                let f: unsafe extern "C" fn(*mut c_void) = std::mem::transmute(entry);
                f(args[0]);
            }
            2 => {
                let f: unsafe extern "C" fn(*mut c_void, *mut c_void) =
                    std::mem::transmute(entry);
                f(args[0], args[1]);
            }
            3 => {
                let f: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void) =
                    std::mem::transmute(entry);
                f(args[0], args[1], args[2]);
            }
            _ => {
                let f: unsafe extern "C" fn(
                    *mut c_void,
                    *mut c_void,
                    *mut c_void,
                    *mut c_void,
                ) = std::mem::transmute(entry);
                f(args[0], args[1], args[2], args[3]);
            }
        }
        Ok(())
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_program_refuses_to_run() {
        let program = Program::new();
        assert!(!program.is_compiled());
        let err = unsafe { program.run(&[]) }.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn handles_are_shared_and_resettable() {
        let mut a = Program::new();
        let b = a.clone();
        assert_eq!(Arc::strong_count(&a.inner), Arc::strong_count(&b.inner));
        a.reset();
        assert!(!b.is_compiled());
    }

    #[test]
    fn clone_and_freeze_are_rejected() {
        let isolate = Isolate::new();
        assert!(matches!(isolate.deep_clone(), Err(Error::InvalidState(_))));
        assert!(matches!(isolate.freeze(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn argument_count_is_validated() {
        let isolate = Isolate::new();
        let mut program = Program::new();
        let args = CompileArgs {
            body: "float main() { return 1.0; }",
            layouts: &[],
            options: Options::NONE,
        };
        assert!(matches!(
            isolate.compile(&mut program, &args, None),
            Err(Error::InvalidArgument(_))
        ));
    }
}
