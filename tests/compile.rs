//! End-to-end pipeline tests: compile source against layouts, run the
//! generated code, check results and diagnostics.

#![cfg(all(unix, target_arch = "x86_64"))]

use std::ffi::c_void;
use vexl::{
    CompileArgs, Error, Isolate, Layout, Message, MessageKind, Options, Program, TypeInfo,
    TypeKind,
};

#[derive(Default)]
struct Capture {
    messages: Vec<(MessageKind, u32, u32, String)>,
}

impl vexl::OutputLog for Capture {
    fn log(&mut self, m: &Message<'_>) {
        self.messages
            .push((m.kind, m.line, m.column, m.text.to_string()));
    }
}

impl Capture {
    fn text_of(&self, kind: MessageKind) -> String {
        self.messages
            .iter()
            .filter(|(k, ..)| *k == kind)
            .map(|(_, _, _, t)| t.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Input record used by most tests.
#[repr(C, align(16))]
#[derive(Default)]
struct Input {
    x: f32,       // offset 0
    n: i32,       // offset 4
    _pad: [f32; 2],
    v: [f32; 4],  // offset 16
    iv: [i32; 4], // offset 32
}

fn input_layout() -> Layout {
    let mut layout = Layout::new();
    layout.configure("in").unwrap();
    layout.add("x", TypeInfo::FLOAT, 0).unwrap();
    layout.add("n", TypeInfo::INT, 4).unwrap();
    layout
        .add("v", TypeInfo::vector(TypeKind::Float, 4), 16)
        .unwrap();
    layout
        .add("iv", TypeInfo::vector(TypeKind::Int, 4), 32)
        .unwrap();
    layout
}

/// Output record: 32 bytes so any return type fits at offset 0.
#[repr(C, align(32))]
#[derive(Default)]
struct Output {
    bytes: [u8; 32],
}

impl Output {
    fn f32s(&self) -> [f32; 4] {
        let mut out = [0f32; 4];
        for (i, v) in out.iter_mut().enumerate() {
            *v = f32::from_le_bytes(self.bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        out
    }

    fn f64_at(&self, i: usize) -> f64 {
        f64::from_le_bytes(self.bytes[i * 8..i * 8 + 8].try_into().unwrap())
    }

    fn i32_at(&self, i: usize) -> i32 {
        i32::from_le_bytes(self.bytes[i * 4..i * 4 + 4].try_into().unwrap())
    }
}

fn ret_layout(ty: TypeInfo) -> Layout {
    let mut layout = Layout::new();
    layout.configure("out").unwrap();
    layout.add("@ret", ty, 0).unwrap();
    layout
}

fn compile(src: &str, ret: TypeInfo, options: Options) -> (Program, Capture) {
    let isolate = Isolate::new();
    let mut program = Program::new();
    let input = input_layout();
    let output = ret_layout(ret);
    let mut capture = Capture::default();
    isolate
        .compile(
            &mut program,
            &CompileArgs {
                body: src,
                layouts: &[&input, &output],
                options,
            },
            Some(&mut capture),
        )
        .unwrap_or_else(|e| panic!("compile failed: {e:?}\n{:?}", capture.messages));
    (program, capture)
}

fn compile_err(src: &str, ret: TypeInfo) -> (Error, Capture) {
    let isolate = Isolate::new();
    let mut program = Program::new();
    let input = input_layout();
    let output = ret_layout(ret);
    let mut capture = Capture::default();
    let err = isolate
        .compile(
            &mut program,
            &CompileArgs {
                body: src,
                layouts: &[&input, &output],
                options: Options::NONE,
            },
            Some(&mut capture),
        )
        .unwrap_err();
    assert!(!program.is_compiled());
    (err, capture)
}

fn run(program: &Program, input: &Input, output: &mut Output) {
    unsafe {
        program
            .run(&[
                input as *const Input as *mut c_void,
                output as *mut Output as *mut c_void,
            ])
            .unwrap();
    }
}

fn run_src(src: &str, ret: TypeInfo, input: &Input) -> Output {
    let (program, _) = compile(src, ret, Options::NONE);
    let mut output = Output::default();
    run(&program, input, &mut output);
    output
}

// ---------------------------------------------------------------------
// The scenarios from the design table.
// ---------------------------------------------------------------------

#[test]
fn e1_constant_expression() {
    let out = run_src(
        "float main() { return 1.0 + 2.0 * 3.0; }",
        TypeInfo::FLOAT,
        &Input::default(),
    );
    assert_eq!(out.f32s()[0], 7.0);
}

#[test]
fn e2_swizzle_reverses_lanes() {
    let out = run_src(
        "float4 main() { return float4(1, 2, 3, 4).wzyx; }",
        TypeInfo::vector(TypeKind::Float, 4),
        &Input::default(),
    );
    assert_eq!(out.f32s(), [4.0, 3.0, 2.0, 1.0]);
}

#[test]
fn e3_loop_accumulates_lanes() {
    let input = Input { v: [1.0, 2.0, 3.0, 4.0], ..Input::default() };
    let out = run_src(
        "float main() { float s = 0; for (int i = 0; i < 4; i++) s += in.v[i]; return s; }",
        TypeInfo::FLOAT,
        &input,
    );
    assert_eq!(out.f32s()[0], 10.0);
}

#[test]
fn e4_branch_on_input() {
    let src = "int main() { if (in.n > 0) return 1; else return -1; }";
    let (program, _) = compile(src, TypeInfo::INT, Options::NONE);

    let mut output = Output::default();
    run(&program, &Input { n: 0, ..Input::default() }, &mut output);
    assert_eq!(output.i32_at(0), -1);
    run(&program, &Input { n: 7, ..Input::default() }, &mut output);
    assert_eq!(output.i32_at(0), 1);
}

#[test]
fn e5_string_initializer_is_invalid_cast() {
    let (err, capture) = compile_err(
        "float main() { float x = \"oops\"; return x; }",
        TypeInfo::FLOAT,
    );
    assert_eq!(err, Error::InvalidCast);
    let (kind, line, column, _) = capture
        .messages
        .iter()
        .find(|(k, ..)| *k == MessageKind::Error)
        .expect("error message logged");
    assert_eq!(*kind, MessageKind::Error);
    assert_eq!(*line, 1);
    assert!(*column > 0);
}

#[test]
fn e6_member_limit() {
    let mut layout = Layout::new();
    for i in 0..vexl::MAX_MEMBERS {
        layout
            .add(&format!("m{i}"), TypeInfo::FLOAT, (i * 4) as i32)
            .unwrap();
    }
    assert_eq!(
        layout.add("m32", TypeInfo::FLOAT, 999),
        Err(Error::TooManyMembers)
    );
}

// ---------------------------------------------------------------------
// Broader pipeline coverage.
// ---------------------------------------------------------------------

#[test]
fn runtime_swizzle_of_member() {
    let input = Input { v: [1.0, 2.0, 3.0, 4.0], ..Input::default() };
    let out = run_src(
        "float4 main() { return in.v.wzyx; }",
        TypeInfo::vector(TypeKind::Float, 4),
        &input,
    );
    assert_eq!(out.f32s(), [4.0, 3.0, 2.0, 1.0]);
}

#[test]
fn vector_arithmetic_with_broadcast() {
    let input = Input { v: [1.0, 2.0, 3.0, 4.0], x: 10.0, ..Input::default() };
    let out = run_src(
        "float4 main() { return in.v * 2.0 + in.x; }",
        TypeInfo::vector(TypeKind::Float, 4),
        &input,
    );
    assert_eq!(out.f32s(), [12.0, 14.0, 16.0, 18.0]);
}

#[test]
fn intrinsics_at_runtime() {
    let input = Input { v: [9.0, -2.0, 0.25, 16.0], ..Input::default() };
    let out = run_src(
        "float4 main() { return sqrt(abs(in.v)); }",
        TypeInfo::vector(TypeKind::Float, 4),
        &input,
    );
    assert_eq!(out.f32s(), [3.0, 2.0f32.sqrt(), 0.5, 4.0]);

    let out = run_src(
        "float main() { return dot(in.v, in.v); }",
        TypeInfo::FLOAT,
        &input,
    );
    assert_eq!(out.f32s()[0], 81.0 + 4.0 + 0.0625 + 256.0);

    let out = run_src(
        "float4 main() { return max(in.v, 0.0); }",
        TypeInfo::vector(TypeKind::Float, 4),
        &input,
    );
    assert_eq!(out.f32s(), [9.0, 0.0, 0.25, 16.0]);
}

#[test]
fn rounding_intrinsics_match_reference() {
    let cases = [-2.5f32, -1.5, -0.75, -0.5, 0.0, 0.5, 0.75, 1.5, 2.5];
    for &value in &cases {
        let input = Input { x: value, ..Input::default() };
        for (src, expected) in [
            ("float main() { return floor(in.x); }", value.floor()),
            ("float main() { return ceil(in.x); }", value.ceil()),
            ("float main() { return trunc(in.x); }", value.trunc()),
            (
                "float main() { return round(in.x); }",
                value.round_ties_even(),
            ),
        ] {
            let out = run_src(src, TypeInfo::FLOAT, &input);
            assert_eq!(out.f32s()[0], expected, "{src} of {value}");
        }
    }
}

#[test]
fn user_function_is_inlined() {
    let input = Input { x: 3.0, ..Input::default() };
    let out = run_src(
        "float square(float v) { return v * v; }\
         float main() { return square(in.x) + square(2.0); }",
        TypeInfo::FLOAT,
        &input,
    );
    assert_eq!(out.f32s()[0], 13.0);
}

#[test]
fn short_circuit_avoids_division() {
    // With n == 0 the right-hand side would fault; && must skip it.
    let src = "int main() { if (in.n != 0 && 10 / in.n > 3) return 1; return 0; }";
    let (program, _) = compile(src, TypeInfo::INT, Options::NONE);
    let mut output = Output::default();
    run(&program, &Input { n: 0, ..Input::default() }, &mut output);
    assert_eq!(output.i32_at(0), 0);
    run(&program, &Input { n: 2, ..Input::default() }, &mut output);
    assert_eq!(output.i32_at(0), 1);
}

#[test]
fn while_loop_with_break_and_continue() {
    let out = run_src(
        "int main() {
            int total = 0;
            int i = 0;
            while (true) {
                i++;
                if (i > 10) break;
                if (i % 2 == 0) continue;
                total += i;
            }
            return total;
        }",
        TypeInfo::INT,
        &Input::default(),
    );
    assert_eq!(out.i32_at(0), 1 + 3 + 5 + 7 + 9);
}

#[test]
fn do_while_runs_once() {
    let out = run_src(
        "int main() { int i = 40; do { i += 2; } while (i < 0); return i; }",
        TypeInfo::INT,
        &Input::default(),
    );
    assert_eq!(out.i32_at(0), 42);
}

#[test]
fn swizzle_write_updates_lanes() {
    let input = Input { v: [1.0, 2.0, 3.0, 4.0], ..Input::default() };
    let out = run_src(
        "float4 main() { float4 t = in.v; t.xw = t.wx; return t; }",
        TypeInfo::vector(TypeKind::Float, 4),
        &input,
    );
    assert_eq!(out.f32s(), [4.0, 2.0, 3.0, 1.0]);
}

#[test]
fn integer_vector_division() {
    let input = Input { iv: [8, 9, 10, -11], ..Input::default() };
    let out = run_src(
        "int main() {
            int4 q = in.iv / int4(2, 3, 4, 4);
            return q.x + q.y + q.z + q.w;
        }",
        TypeInfo::INT,
        &input,
    );
    assert_eq!(out.i32_at(0), 4 + 3 + 2 - 2);
}

#[test]
fn integer_vector_multiply() {
    let input = Input { iv: [1, -2, 3, 4], ..Input::default() };
    let src = "int main() {
        int4 p = in.iv * int4(10, 11, 12, 13);
        return p.x + p.y + p.z + p.w;
    }";
    for options in [Options::NONE, Options::DISABLE_SSE4_1] {
        let (program, _) = compile(src, TypeInfo::INT, options);
        let mut output = Output::default();
        run(&program, &input, &mut output);
        assert_eq!(output.i32_at(0), 10 - 22 + 36 + 52);
    }
}

#[test]
fn vector_select_via_ternary() {
    let input = Input { v: [1.0, -2.0, 3.0, -4.0], ..Input::default() };
    let src = "float4 main() {
        bool4 pos = in.v > float4(0, 0, 0, 0);
        return pos ? in.v : float4(0, 0, 0, 0);
    }";
    for options in [Options::NONE, Options::DISABLE_SSE4_1] {
        let (program, _) = compile(src, TypeInfo::vector(TypeKind::Float, 4), options);
        let mut output = Output::default();
        run(&program, &input, &mut output);
        assert_eq!(output.f32s(), [1.0, 0.0, 3.0, 0.0]);
    }
}

#[test]
fn double_precision_math() {
    let input = Input { x: 1.5, ..Input::default() };
    let out = run_src(
        "double main() { double d = double(in.x); return d * 2.0 + 0.25; }",
        TypeInfo::DOUBLE,
        &input,
    );
    assert_eq!(out.f64_at(0), 3.25);
}

#[test]
fn matrix_vector_product() {
    let input = Input { v: [5.0, 7.0, 0.0, 0.0], ..Input::default() };
    let out = run_src(
        "float2 main() {
            float2x2 m = float2x2(float2(0, 1), float2(1, 0));
            return m * in.v.xy;
        }",
        TypeInfo::vector(TypeKind::Float, 2),
        &input,
    );
    let f = out.f32s();
    assert_eq!([f[0], f[1]], [7.0, 5.0]);
}

#[test]
fn global_constants_participate() {
    let input = Input { x: 2.0, ..Input::default() };
    let out = run_src(
        "const float SCALE = 3.0; float main() { return in.x * SCALE; }",
        TypeInfo::FLOAT,
        &input,
    );
    assert_eq!(out.f32s()[0], 6.0);
}

// ---------------------------------------------------------------------
// Invariants: determinism, feature gating, handles, failure hygiene.
// ---------------------------------------------------------------------

#[test]
fn compilation_is_deterministic() {
    let src = "float4 main() { return in.v * in.v + 1.0; }";
    let dump = |options| {
        let (_, capture) = compile(
            src,
            TypeInfo::vector(TypeKind::Float, 4),
            options,
        );
        (
            capture.text_of(MessageKind::AstFinal),
            capture.text_of(MessageKind::IrFinal),
            capture.text_of(MessageKind::Asm),
        )
    };
    let options = Options::DEBUG_AST | Options::DEBUG_IR | Options::DEBUG_ASM;
    assert_eq!(dump(options), dump(options));
}

#[test]
fn disabling_sse41_removes_its_mnemonics() {
    // Exercise the operations with distinct SSE4.1 fast paths.
    let src = "float4 main() {
        float4 r = round(in.v);
        int4 p = in.iv * int4(3, 3, 3, 3);
        bool4 m = in.v > float4(0, 0, 0, 0);
        float4 s = m ? r : in.v;
        return s + float4(p.x, p.y, p.z, p.w);
    }";
    let (_, capture) = compile(
        src,
        TypeInfo::vector(TypeKind::Float, 4),
        Options::DEBUG_ASM | Options::DISABLE_SSE4_1,
    );
    let asm = capture.text_of(MessageKind::Asm);
    assert!(!asm.is_empty());
    for mnemonic in [
        "pmulld", "pminsd", "pmaxsd", "pabsd", "roundps", "roundpd", "insertps", "pinsrd",
        "pextrd", "blendvps", "blendvpd", "pblendvb",
    ] {
        assert!(!asm.contains(mnemonic), "found {mnemonic} in SSE2-only code");
    }

    // And both paths agree on the result.
    let input = Input { v: [1.4, -0.6, 2.5, 0.0], iv: [1, 2, 3, 4], ..Input::default() };
    let mut fast = Output::default();
    let mut baseline = Output::default();
    let (program, _) = compile(src, TypeInfo::vector(TypeKind::Float, 4), Options::NONE);
    run(&program, &input, &mut fast);
    let (program, _) = compile(
        src,
        TypeInfo::vector(TypeKind::Float, 4),
        Options::DISABLE_SSE4_1,
    );
    run(&program, &input, &mut baseline);
    assert_eq!(fast.f32s(), baseline.f32s());
}

#[test]
fn program_handles_share_code() {
    let input = Input { x: 21.0, ..Input::default() };
    let (program, _) = compile(
        "float main() { return in.x * 2.0; }",
        TypeInfo::FLOAT,
        Options::NONE,
    );
    let copy = program.clone();
    drop(program);

    // The clone still runs after the original handle is gone.
    let mut output = Output::default();
    run(&copy, &input, &mut output);
    assert_eq!(output.f32s()[0], 42.0);

    let mut resettable = copy.clone();
    resettable.reset();
    assert!(!resettable.is_compiled());
    assert!(copy.is_compiled());
}

#[test]
fn recompile_replaces_program() {
    let isolate = Isolate::new();
    let mut program = Program::new();
    let input_l = input_layout();
    let output_l = ret_layout(TypeInfo::FLOAT);
    let layouts: [&Layout; 2] = [&input_l, &output_l];

    for (src, expected) in [
        ("float main() { return 1.0; }", 1.0f32),
        ("float main() { return 2.0; }", 2.0),
    ] {
        isolate
            .compile(
                &mut program,
                &CompileArgs { body: src, layouts: &layouts, options: Options::NONE },
                None,
            )
            .unwrap();
        let mut output = Output::default();
        run(&program, &Input::default(), &mut output);
        assert_eq!(output.f32s()[0], expected);
    }
}

#[test]
fn failed_compile_leaves_program_untouched() {
    let isolate = Isolate::new();
    let mut program = Program::new();
    let input_l = input_layout();
    let output_l = ret_layout(TypeInfo::FLOAT);
    let layouts: [&Layout; 2] = [&input_l, &output_l];

    isolate
        .compile(
            &mut program,
            &CompileArgs {
                body: "float main() { return 5.0; }",
                layouts: &layouts,
                options: Options::NONE,
            },
            None,
        )
        .unwrap();

    let err = isolate
        .compile(
            &mut program,
            &CompileArgs {
                body: "float main() { return nonsense; }",
                layouts: &layouts,
                options: Options::NONE,
            },
            None,
        )
        .unwrap_err();
    assert_eq!(err, Error::SymbolNotFound);

    // The previous program is still published and functional.
    let mut output = Output::default();
    run(&program, &Input::default(), &mut output);
    assert_eq!(output.f32s()[0], 5.0);
}

#[test]
fn syntax_errors_carry_positions() {
    let (err, capture) = compile_err("float main() { return 1 + ; }", TypeInfo::FLOAT);
    assert!(matches!(err, Error::InvalidSyntax { .. }));
    let logged = capture
        .messages
        .iter()
        .any(|(k, line, col, _)| *k == MessageKind::Error && *line == 1 && *col > 0);
    assert!(logged);
}

#[test]
fn unnamed_layout_injects_members() {
    let isolate = Isolate::new();
    let mut program = Program::new();
    let mut anon = Layout::new();
    anon.add("x", TypeInfo::FLOAT, 0).unwrap();
    anon.add("@ret", TypeInfo::FLOAT, 4).unwrap();

    isolate
        .compile(
            &mut program,
            &CompileArgs {
                body: "float main() { return x + 1.0; }",
                layouts: &[&anon],
                options: Options::NONE,
            },
            None,
        )
        .unwrap();

    #[repr(C)]
    struct Record {
        x: f32,
        ret: f32,
    }
    let mut record = Record { x: 41.0, ret: 0.0 };
    unsafe {
        program
            .run(&[&mut record as *mut Record as *mut c_void])
            .unwrap();
    }
    assert_eq!(record.ret, 42.0);
}

#[test]
fn verbose_emits_info() {
    let (_, capture) = compile(
        "float main() { return 1.0; }",
        TypeInfo::FLOAT,
        Options::VERBOSE,
    );
    assert!(capture
        .messages
        .iter()
        .any(|(k, ..)| *k == MessageKind::Info));
}
