//! AST-level optimizer.
//!
//! Second top-down pass, run after analysis and before lowering. Only
//! safe transformations: constant folding over literal operands
//! (component-wise for vectors, wrapping integer semantics to match the
//! generated code, IEEE float semantics), dead-code elimination behind
//! unconditional control transfers and constant conditions, and the
//! `x+0` / `x*1` / `x*0` identities. For floats only `x*1` is applied, the one that
//! cannot change NaN or signed-zero behavior. Folded nodes keep the type
//! the analyzer assigned.

use crate::ast::{
    Ast, BinaryOp, ConstVec, LitValue, NodeId, NodeKind, SwizzleMask, UnaryOp,
};
use crate::error::Result;
use crate::lang::Intrinsic;
use crate::types::{TypeInfo, TypeKind};

/// Runs the optimizer over the whole program.
pub fn optimize(ast: &mut Ast<'_>) -> Result<()> {
    let decls = match &ast.node(ast.root).kind {
        NodeKind::Program { decls } => decls.clone(),
        _ => return Ok(()),
    };
    for decl in decls {
        match ast.node(decl).kind.clone() {
            NodeKind::Function { body, .. } => {
                fold_stmt(ast, body)?;
            }
            NodeKind::VarDecl { .. } => {
                fold_stmt(ast, decl)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether a statement unconditionally transfers control away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Terminates,
}

fn fold_stmt(ast: &mut Ast<'_>, id: NodeId) -> Result<Flow> {
    let kind = ast.node(id).kind.clone();
    match kind {
        NodeKind::Block { mut stmts } => {
            let mut flow = Flow::Normal;
            let mut live = 0;
            for (i, &stmt) in stmts.iter().enumerate() {
                flow = fold_stmt(ast, stmt)?;
                live = i + 1;
                if flow == Flow::Terminates {
                    break;
                }
            }
            stmts.truncate(live);
            ast.node_mut(id).kind = NodeKind::Block { stmts };
            Ok(flow)
        }
        NodeKind::VarDecl { is_const, mut decls } => {
            for entry in &mut decls {
                if let Some(init) = entry.init {
                    fold_expr(ast, init)?;
                }
            }
            ast.node_mut(id).kind = NodeKind::VarDecl { is_const, decls };
            Ok(Flow::Normal)
        }
        NodeKind::If { cond, then_stmt, else_stmt } => {
            fold_expr(ast, cond)?;
            if let Some(value) = literal_bool(ast, cond) {
                // Constant condition: the dead branch is dropped.
                let keep = if value { Some(then_stmt) } else { else_stmt };
                return match keep {
                    Some(stmt) => {
                        let flow = fold_stmt(ast, stmt)?;
                        ast.node_mut(id).kind = NodeKind::Block { stmts: vec![stmt] };
                        Ok(flow)
                    }
                    None => {
                        ast.node_mut(id).kind = NodeKind::Block { stmts: vec![] };
                        Ok(Flow::Normal)
                    }
                };
            }
            let then_flow = fold_stmt(ast, then_stmt)?;
            let else_flow = match else_stmt {
                Some(stmt) => fold_stmt(ast, stmt)?,
                None => Flow::Normal,
            };
            if then_flow == Flow::Terminates && else_flow == Flow::Terminates {
                Ok(Flow::Terminates)
            } else {
                Ok(Flow::Normal)
            }
        }
        NodeKind::While { cond, body } => {
            fold_expr(ast, cond)?;
            if literal_bool(ast, cond) == Some(false) {
                ast.node_mut(id).kind = NodeKind::Block { stmts: vec![] };
                return Ok(Flow::Normal);
            }
            fold_stmt(ast, body)?;
            Ok(Flow::Normal)
        }
        NodeKind::DoWhile { body, cond } => {
            fold_stmt(ast, body)?;
            fold_expr(ast, cond)?;
            if literal_bool(ast, cond) == Some(false) && !contains_jump(ast, body) {
                // Runs exactly once.
                ast.node_mut(id).kind = NodeKind::Block { stmts: vec![body] };
            }
            Ok(Flow::Normal)
        }
        NodeKind::For { init, cond, step, body } => {
            if let Some(init) = init {
                fold_stmt(ast, init)?;
            }
            if let Some(cond) = cond {
                fold_expr(ast, cond)?;
                if literal_bool(ast, cond) == Some(false) {
                    let stmts = init.into_iter().collect();
                    ast.node_mut(id).kind = NodeKind::Block { stmts };
                    return Ok(Flow::Normal);
                }
            }
            if let Some(step) = step {
                fold_expr(ast, step)?;
            }
            fold_stmt(ast, body)?;
            Ok(Flow::Normal)
        }
        NodeKind::Break | NodeKind::Continue => Ok(Flow::Terminates),
        NodeKind::Return { value } => {
            if let Some(value) = value {
                fold_expr(ast, value)?;
            }
            Ok(Flow::Terminates)
        }
        NodeKind::ExprStmt { expr } => {
            fold_expr(ast, expr)?;
            Ok(Flow::Normal)
        }
        _ => Ok(Flow::Normal),
    }
}

fn literal_bool(ast: &Ast<'_>, id: NodeId) -> Option<bool> {
    match ast.node(id).kind {
        NodeKind::Literal { value: LitValue::Bool(v) } => Some(v),
        _ => None,
    }
}

/// Whether `break`/`continue` occurs in the statement, not nested inside
/// a deeper loop.
fn contains_jump(ast: &Ast<'_>, id: NodeId) -> bool {
    match &ast.node(id).kind {
        NodeKind::Break | NodeKind::Continue => true,
        NodeKind::Block { stmts } => stmts.iter().any(|&s| contains_jump(ast, s)),
        NodeKind::If { then_stmt, else_stmt, .. } => {
            contains_jump(ast, *then_stmt)
                || else_stmt.map(|e| contains_jump(ast, e)).unwrap_or(false)
        }
        // A nested loop captures its own jumps.
        NodeKind::While { .. } | NodeKind::DoWhile { .. } | NodeKind::For { .. } => false,
        _ => false,
    }
}

// ----------------------------------------------------------------------
// Expression folding
// ----------------------------------------------------------------------

/// One lane of a constant during evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Lane {
    B(bool),
    I(i32),
    F(f32),
    D(f64),
}

impl Lane {
    fn as_f64(self) -> f64 {
        match self {
            Lane::B(v) => v as i32 as f64,
            Lane::I(v) => v as f64,
            Lane::F(v) => v as f64,
            Lane::D(v) => v,
        }
    }

    fn bits(self) -> u64 {
        match self {
            Lane::B(v) => {
                if v {
                    1
                } else {
                    0
                }
            }
            Lane::I(v) => v as u32 as u64,
            Lane::F(v) => v.to_bits() as u64,
            Lane::D(v) => v.to_bits(),
        }
    }
}

/// Expands a literal into per-lane values.
fn lanes_of(value: LitValue<'_>) -> Option<Vec<Lane>> {
    Some(match value {
        LitValue::Bool(v) => vec![Lane::B(v)],
        LitValue::Int(v) => vec![Lane::I(v)],
        LitValue::Float(v) => vec![Lane::F(v)],
        LitValue::Double(v) => vec![Lane::D(v)],
        LitValue::Str(_) => return None,
        LitValue::Vector(v) => (0..v.lanes as usize)
            .map(|i| match v.kind {
                TypeKind::Bool => Lane::B(v.bits[i] != 0),
                TypeKind::Int => Lane::I(v.bits[i] as u32 as i32),
                TypeKind::Float => Lane::F(f32::from_bits(v.bits[i] as u32)),
                _ => Lane::D(f64::from_bits(v.bits[i])),
            })
            .collect(),
    })
}

/// Packs per-lane values back into a literal of the given type.
fn lit_of(ty: TypeInfo, lanes: &[Lane]) -> LitValue<'static> {
    if lanes.len() == 1 {
        return match lanes[0] {
            Lane::B(v) => LitValue::Bool(v),
            Lane::I(v) => LitValue::Int(v),
            Lane::F(v) => LitValue::Float(v),
            Lane::D(v) => LitValue::Double(v),
        };
    }
    let mut bits = [0u64; 4];
    for (i, lane) in lanes.iter().enumerate() {
        bits[i] = lane.bits();
    }
    LitValue::Vector(ConstVec { kind: ty.kind(), lanes: lanes.len() as u8, bits })
}

fn literal_of(ast: &Ast<'_>, id: NodeId) -> Option<LitValue<'static>> {
    match ast.node(id).kind {
        NodeKind::Literal { value } => match value {
            LitValue::Bool(v) => Some(LitValue::Bool(v)),
            LitValue::Int(v) => Some(LitValue::Int(v)),
            LitValue::Float(v) => Some(LitValue::Float(v)),
            LitValue::Double(v) => Some(LitValue::Double(v)),
            LitValue::Vector(v) => Some(LitValue::Vector(v)),
            LitValue::Str(_) => None,
        },
        _ => None,
    }
}

fn replace_with_literal(ast: &mut Ast<'_>, id: NodeId, value: LitValue<'static>) {
    let ty = ast.ty(id);
    ast.node_mut(id).kind = NodeKind::Literal { value };
    // Folding preserves the analyzed type.
    ast.set_ty(id, ty);
}

fn fold_expr(ast: &mut Ast<'_>, id: NodeId) -> Result<()> {
    let kind = ast.node(id).kind.clone();
    match kind {
        NodeKind::Unary { op, expr } => {
            fold_expr(ast, expr)?;
            if op.is_inc_dec() {
                return Ok(());
            }
            if let Some(value) = literal_of(ast, expr) {
                if let Some(folded) = eval_unary(op, value) {
                    replace_with_literal(ast, id, folded);
                }
            }
        }
        NodeKind::Binary { op, lhs, rhs } => {
            fold_expr(ast, lhs)?;
            fold_expr(ast, rhs)?;
            if op.is_assign() {
                return Ok(());
            }
            let lv = literal_of(ast, lhs);
            let rv = literal_of(ast, rhs);
            if let (Some(lv), Some(rv)) = (lv, rv) {
                if let Some(folded) = eval_binary(op, lv, rv, ast.ty(id)) {
                    replace_with_literal(ast, id, folded);
                    return Ok(());
                }
            }
            apply_identity(ast, id, op, lhs, rhs);
        }
        NodeKind::Ternary { cond, then_expr, else_expr } => {
            fold_expr(ast, cond)?;
            fold_expr(ast, then_expr)?;
            fold_expr(ast, else_expr)?;
            if let Some(value) = literal_bool(ast, cond) {
                let keep = if value { then_expr } else { else_expr };
                let kept_kind = ast.node(keep).kind.clone();
                let ty = ast.ty(id);
                ast.node_mut(id).kind = kept_kind;
                ast.set_ty(id, ty);
            }
        }
        NodeKind::Cast { expr } => {
            fold_expr(ast, expr)?;
            if let Some(value) = literal_of(ast, expr) {
                if let Some(folded) = eval_cast(value, ast.ty(id)) {
                    replace_with_literal(ast, id, folded);
                }
            }
        }
        NodeKind::Swizzle { base, mask } => {
            fold_expr(ast, base)?;
            if let Some(value) = literal_of(ast, base) {
                if let Some(folded) = eval_swizzle(value, mask, ast.ty(id)) {
                    replace_with_literal(ast, id, folded);
                }
            }
        }
        NodeKind::Index { base, index } => {
            fold_expr(ast, base)?;
            fold_expr(ast, index)?;
            if let (Some(base_v), Some(LitValue::Int(i))) =
                (literal_of(ast, base), literal_of(ast, index))
            {
                if let Some(lanes) = lanes_of(base_v) {
                    if (i as usize) < lanes.len() && i >= 0 {
                        let folded = lit_of(ast.ty(id), &lanes[i as usize..=i as usize]);
                        replace_with_literal(ast, id, folded);
                    }
                }
            }
        }
        NodeKind::Call { name, args } => {
            for &arg in &args {
                fold_expr(ast, arg)?;
            }
            let ty = ast.ty(id);
            if let Some(intrinsic) = Intrinsic::from_name(name) {
                let values: Option<Vec<_>> =
                    args.iter().map(|&a| literal_of(ast, a)).collect();
                if let Some(values) = values {
                    if let Some(folded) = eval_intrinsic(intrinsic, &values, ty) {
                        replace_with_literal(ast, id, folded);
                    }
                }
            } else if crate::lang::type_by_name(name).is_some()
                && ty.is_vector()
                && args.len() == ty.lanes() as usize
            {
                // Vector constructor from literal scalars.
                let values: Option<Vec<_>> =
                    args.iter().map(|&a| literal_of(ast, a)).collect();
                if let Some(values) = values {
                    let lanes: Option<Vec<Lane>> = values
                        .iter()
                        .map(|v| lanes_of(*v).and_then(|l| l.first().copied()))
                        .collect();
                    if let Some(lanes) = lanes {
                        replace_with_literal(ast, id, lit_of(ty, &lanes));
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// `x+0`, `x*1` (and `x*0` for integers). Float `x+0` and `x*0` would
/// change `-0.0` / NaN results and stay untouched.
fn apply_identity(
    ast: &mut Ast<'_>,
    id: NodeId,
    op: BinaryOp,
    lhs: NodeId,
    rhs: NodeId,
) {
    let ty = ast.ty(id);
    if ty.is_matrix() {
        return;
    }
    let is_int = ty.kind() == TypeKind::Int;
    let is_float = matches!(ty.kind(), TypeKind::Float | TypeKind::Double);
    if !is_int && !is_float {
        return;
    }

    let scalar_value = |ast: &Ast<'_>, id: NodeId| -> Option<f64> {
        match literal_of(ast, id)? {
            LitValue::Int(v) => Some(v as f64),
            LitValue::Float(v) if v == 0.0 || v == 1.0 => Some(v as f64),
            LitValue::Double(v) if v == 0.0 || v == 1.0 => Some(v),
            _ => None,
        }
    };

    let keep_other = |ast: &mut Ast<'_>, keep: NodeId| {
        let kept_kind = ast.node(keep).kind.clone();
        ast.node_mut(id).kind = kept_kind;
        ast.set_ty(id, ty);
    };

    match op {
        BinaryOp::Add if is_int => {
            if scalar_value(ast, rhs) == Some(0.0) {
                keep_other(ast, lhs);
            } else if scalar_value(ast, lhs) == Some(0.0) {
                keep_other(ast, rhs);
            }
        }
        BinaryOp::Mul => {
            if scalar_value(ast, rhs) == Some(1.0) {
                keep_other(ast, lhs);
            } else if scalar_value(ast, lhs) == Some(1.0) {
                keep_other(ast, rhs);
            } else if is_int && scalar_value(ast, rhs) == Some(0.0) {
                replace_with_literal(ast, id, LitValue::Int(0));
            } else if is_int && scalar_value(ast, lhs) == Some(0.0) {
                replace_with_literal(ast, id, LitValue::Int(0));
            }
        }
        _ => {}
    }
}

fn eval_unary(op: UnaryOp, value: LitValue<'_>) -> Option<LitValue<'static>> {
    let lanes = lanes_of(value)?;
    let ty = value.type_info();
    let folded: Option<Vec<Lane>> = lanes
        .into_iter()
        .map(|lane| {
            Some(match (op, lane) {
                (UnaryOp::Plus, lane) => lane,
                (UnaryOp::Neg, Lane::I(v)) => Lane::I(v.wrapping_neg()),
                (UnaryOp::Neg, Lane::F(v)) => Lane::F(-v),
                (UnaryOp::Neg, Lane::D(v)) => Lane::D(-v),
                (UnaryOp::Not, Lane::B(v)) => Lane::B(!v),
                (UnaryOp::BitNot, Lane::I(v)) => Lane::I(!v),
                _ => return None,
            })
        })
        .collect();
    folded.map(|lanes| lit_of(ty, &lanes))
}

fn eval_binary(
    op: BinaryOp,
    lhs: LitValue<'_>,
    rhs: LitValue<'_>,
    result_ty: TypeInfo,
) -> Option<LitValue<'static>> {
    let lv = lanes_of(lhs)?;
    let rv = lanes_of(rhs)?;
    if lv.len() != rv.len() && !op.is_shift() {
        return None;
    }

    if op.is_shift() {
        let count = match rhs {
            LitValue::Int(v) => v as u32,
            _ => return None,
        };
        let folded: Option<Vec<Lane>> = lv
            .into_iter()
            .map(|lane| match lane {
                Lane::I(v) => Some(match op {
                    BinaryOp::Shl => Lane::I(v.wrapping_shl(count)),
                    _ => Lane::I(v.wrapping_shr(count)),
                }),
                _ => None,
            })
            .collect();
        return folded.map(|lanes| lit_of(result_ty, &lanes));
    }

    if op.is_comparison() {
        let folded: Vec<Lane> = lv
            .iter()
            .zip(&rv)
            .map(|(&a, &b)| {
                let (a, b) = (a.as_f64(), b.as_f64());
                Lane::B(match op {
                    BinaryOp::Eq => a == b,
                    BinaryOp::Ne => a != b,
                    BinaryOp::Lt => a < b,
                    BinaryOp::Le => a <= b,
                    BinaryOp::Gt => a > b,
                    _ => a >= b,
                })
            })
            .collect();
        return Some(lit_of(result_ty, &folded));
    }

    let folded: Option<Vec<Lane>> = lv
        .into_iter()
        .zip(rv)
        .map(|(a, b)| eval_arith_lane(op, a, b))
        .collect();
    folded.map(|lanes| lit_of(result_ty, &lanes))
}

fn eval_arith_lane(op: BinaryOp, a: Lane, b: Lane) -> Option<Lane> {
    Some(match (a, b) {
        (Lane::I(a), Lane::I(b)) => Lane::I(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            // Division only folds against a non-zero literal divisor.
            BinaryOp::Div if b != 0 => a.wrapping_div(b),
            BinaryOp::Rem if b != 0 => a.wrapping_rem(b),
            BinaryOp::BitAnd => a & b,
            BinaryOp::BitOr => a | b,
            BinaryOp::BitXor => a ^ b,
            _ => return None,
        }),
        (Lane::F(a), Lane::F(b)) => Lane::F(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            _ => return None,
        }),
        (Lane::D(a), Lane::D(b)) => Lane::D(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            _ => return None,
        }),
        (Lane::B(a), Lane::B(b)) => Lane::B(match op {
            BinaryOp::BitAnd => a & b,
            BinaryOp::BitOr => a | b,
            BinaryOp::BitXor => a ^ b,
            _ => return None,
        }),
        _ => return None,
    })
}

fn eval_cast(value: LitValue<'_>, target: TypeInfo) -> Option<LitValue<'static>> {
    let lanes = lanes_of(value)?;
    let kind = target.kind();
    let convert = |lane: Lane| -> Option<Lane> {
        Some(match kind {
            TypeKind::Int => Lane::I(match lane {
                Lane::I(v) => v,
                Lane::F(v) => v as i32,
                Lane::D(v) => v as i32,
                Lane::B(_) => return None,
            }),
            TypeKind::Float => Lane::F(match lane {
                Lane::I(v) => v as f32,
                Lane::F(v) => v,
                Lane::D(v) => v as f32,
                Lane::B(_) => return None,
            }),
            TypeKind::Double => Lane::D(match lane {
                Lane::I(v) => v as f64,
                Lane::F(v) => v as f64,
                Lane::D(v) => v,
                Lane::B(_) => return None,
            }),
            TypeKind::Bool => match lane {
                Lane::B(v) => Lane::B(v),
                _ => return None,
            },
            _ => return None,
        })
    };

    let converted: Option<Vec<Lane>> = lanes.iter().copied().map(convert).collect();
    let mut converted = converted?;
    // Scalar-to-vector broadcast.
    if converted.len() == 1 && target.lanes() > 1 {
        let lane = converted[0];
        converted = vec![lane; target.lanes() as usize];
    }
    if converted.len() != target.lanes() as usize {
        return None;
    }
    Some(lit_of(target, &converted))
}

fn eval_swizzle(
    value: LitValue<'_>,
    mask: SwizzleMask,
    result_ty: TypeInfo,
) -> Option<LitValue<'static>> {
    let lanes = lanes_of(value)?;
    let mut out = Vec::with_capacity(mask.len as usize);
    for &lane in &mask.idx[..mask.len as usize] {
        out.push(*lanes.get(lane as usize)?);
    }
    Some(lit_of(result_ty, &out))
}

fn eval_intrinsic(
    intrinsic: Intrinsic,
    args: &[LitValue<'_>],
    result_ty: TypeInfo,
) -> Option<LitValue<'static>> {
    let arg_lanes: Option<Vec<Vec<Lane>>> = args.iter().map(|&a| lanes_of(a)).collect();
    let arg_lanes = arg_lanes?;
    let lanes = arg_lanes.iter().map(|l| l.len()).max()?;
    let lane_at = |arg: usize, i: usize| -> Lane {
        let v = &arg_lanes[arg];
        if v.len() == 1 {
            v[0]
        } else {
            v[i]
        }
    };

    if intrinsic == Intrinsic::Dot {
        let sum: f64 = (0..lanes)
            .map(|i| lane_at(0, i).as_f64() * lane_at(1, i).as_f64())
            .sum();
        let lane = match result_ty.kind() {
            TypeKind::Double => Lane::D(sum),
            _ => Lane::F(sum as f32),
        };
        return Some(lit_of(result_ty, &[lane]));
    }

    let kind = result_ty.kind();
    let mut out = Vec::with_capacity(lanes);
    for i in 0..lanes {
        let a = lane_at(0, i);
        let lane = match intrinsic {
            Intrinsic::Abs => match a {
                Lane::I(v) => Lane::I(v.wrapping_abs()),
                Lane::F(v) => Lane::F(v.abs()),
                Lane::D(v) => Lane::D(v.abs()),
                Lane::B(_) => return None,
            },
            Intrinsic::Min | Intrinsic::Max => {
                let b = lane_at(1, i);
                let pick_b = if intrinsic == Intrinsic::Min {
                    b.as_f64() < a.as_f64()
                } else {
                    b.as_f64() > a.as_f64()
                };
                let chosen = if pick_b { b } else { a };
                match kind {
                    TypeKind::Int => Lane::I(chosen.as_f64() as i32),
                    TypeKind::Double => Lane::D(chosen.as_f64()),
                    _ => Lane::F(chosen.as_f64() as f32),
                }
            }
            Intrinsic::Sqrt => float_lane(kind, a.as_f64().sqrt()),
            Intrinsic::Floor => float_lane(kind, a.as_f64().floor()),
            Intrinsic::Ceil => float_lane(kind, a.as_f64().ceil()),
            Intrinsic::Round => {
                // Ties to even, matching the generated rounding code.
                let v = a.as_f64();
                let rounded = v.round();
                let even = if (v - v.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
                    rounded - v.signum()
                } else {
                    rounded
                };
                float_lane(kind, even)
            }
            Intrinsic::Trunc => float_lane(kind, a.as_f64().trunc()),
            Intrinsic::Frac => float_lane(kind, a.as_f64() - a.as_f64().floor()),
            Intrinsic::Lerp => {
                let b = lane_at(1, i).as_f64();
                let t = lane_at(2, i).as_f64();
                let a = a.as_f64();
                float_lane(kind, a + (b - a) * t)
            }
            Intrinsic::Dot => unreachable!(),
        };
        out.push(lane);
    }
    Some(lit_of(result_ty, &out))
}

fn float_lane(kind: TypeKind, v: f64) -> Lane {
    match kind {
        TypeKind::Double => Lane::D(v),
        _ => Lane::F(v as f32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::lexer::tokenize;
    use crate::output_log::ErrorReporter;
    use crate::parser::parse_program;
    use crate::sema::Analyzer;
    use crate::session::CompilationSession;
    use bumpalo::Bump;

    fn optimized(src: &str) -> Ast<'static> {
        let arena = Box::leak(Box::new(Bump::new()));
        let session = Box::leak(Box::new(CompilationSession::new(arena)));
        let tokens = tokenize(session, src).unwrap();
        let mut ast = Ast::new();
        parse_program(&mut ast, &tokens).unwrap();

        let mut input = Layout::new();
        input.configure("in").unwrap();
        input.add("x", TypeInfo::FLOAT, 0).unwrap();
        input
            .add("v", TypeInfo::vector(TypeKind::Float, 4), 16)
            .unwrap();
        let layouts: Vec<&Layout> = vec![&*Box::leak(Box::new(input))];
        let body = src.as_bytes().to_vec().leak();
        let mut reporter = ErrorReporter::new(body, None, false);
        Analyzer::new(session, &mut ast, &mut reporter, &layouts)
            .run()
            .unwrap();
        optimize(&mut ast).unwrap();
        ast
    }

    #[test]
    fn arithmetic_folds() {
        let ast = optimized("float main() { return 1.0 + 2.0 * 3.0; }");
        let dump = ast.dump();
        assert!(dump.contains("Literal 7.0"), "{dump}");
        assert!(!dump.contains("Binary"));
    }

    #[test]
    fn vector_constant_folds_component_wise() {
        let ast = optimized("float4 main() { return float4(1, 2, 3, 4).wzyx; }");
        let dump = ast.dump();
        assert!(dump.contains("Literal <4, 3, 2, 1>"), "{dump}");
    }

    #[test]
    fn constant_if_drops_dead_branch() {
        let ast = optimized("int main() { if (1 > 2) return 1; else return 2; }");
        let dump = ast.dump();
        assert!(!dump.contains("If"), "{dump}");
        assert!(dump.contains("Literal 2"));
        assert!(!dump.contains("Literal 1\n"));
    }

    #[test]
    fn statements_after_return_removed() {
        let ast = optimized("int main() { return 1; return 2; }");
        let dump = ast.dump();
        assert!(!dump.contains("Literal 2"), "{dump}");
    }

    #[test]
    fn false_loop_removed() {
        let ast = optimized("int main() { while (false) { return 9; } return 1; }");
        let dump = ast.dump();
        assert!(!dump.contains("While"), "{dump}");
        assert!(!dump.contains("Literal 9"));
    }

    #[test]
    fn mul_by_one_identity() {
        let ast = optimized("float main() { return in.x * 1.0; }");
        let dump = ast.dump();
        assert!(!dump.contains("Binary"), "{dump}");
        assert!(dump.contains("MemberRef"));
    }

    #[test]
    fn float_add_zero_not_applied() {
        // x + 0.0 may not be dropped for floats (-0.0 + 0.0 == +0.0).
        let ast = optimized("float main() { return in.x + 0.0; }");
        assert!(ast.dump().contains("Binary[+]"));
    }

    #[test]
    fn int_identities() {
        let ast = optimized("int main(){ int n = int(in.x); return n + 0; }");
        assert!(!ast.dump().contains("Binary[+]"));

        let ast = optimized("int main(){ int n = int(in.x); return n * 0; }");
        let dump = ast.dump();
        assert!(!dump.contains("Binary[*]"), "{dump}");
        assert!(dump.contains("Return\n    Literal 0"));
    }

    #[test]
    fn int_division_by_zero_not_folded() {
        let ast = optimized("int main() { return 4 / 0; }");
        assert!(ast.dump().contains("Binary[/]"));
    }

    #[test]
    fn intrinsics_fold() {
        let ast = optimized("float main() { return sqrt(4.0) + abs(-2.0); }");
        assert!(ast.dump().contains("Literal 4.0"));

        let ast = optimized("float main() { return dot(float2(1, 2), float2(3, 4)); }");
        assert!(ast.dump().contains("Literal 11.0"));
    }

    #[test]
    fn ternary_with_constant_condition() {
        let ast = optimized("float main() { return true ? 1.0 : 2.0; }");
        let dump = ast.dump();
        assert!(!dump.contains("Ternary"), "{dump}");
        assert!(dump.contains("Literal 1.0"));
    }

    #[test]
    fn cast_folds_with_broadcast() {
        let ast = optimized("float4 main() { return float4(1,1,1,1) + 2.0; }");
        let dump = ast.dump();
        assert!(dump.contains("Literal <3, 3, 3, 3>"), "{dump}");
    }
}
