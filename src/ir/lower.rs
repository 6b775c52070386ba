//! AST-to-IR lowering.
//!
//! Walks the optimized AST and emits IR into a fresh [`Func`]. Control
//! flow becomes blocks and branches (`if`/`else` a diamond, loops a
//! header/body/latch trio with one back-edge, `break`/`continue` jumps
//! to labels kept on a control-flow stack). Short-circuit `&&`/`||`
//! lower to conditional branches. Layout-member access becomes typed
//! load/store against the slot's base pointer plus the member offset.
//! User function calls are inlined: arguments and the return value flow
//! through variable slots, and the analyzer's no-recursion rule makes
//! the expansion terminate. Matrices are carried as bundles of
//! per-column vector values; linear-algebra products expand into
//! broadcast/multiply/add column sequences here, so the IR and backend
//! only ever see scalar and vector widths.

use super::{BlockId, Func, Inst, Op, Term, VReg, VRegInfo, VarSlot};
use crate::ast::{
    Ast, BinaryOp, ConstVec, LitValue, NodeId, NodeKind, SwizzleMask, UnaryOp,
};
use crate::error::{Error, Result};
use crate::lang::Intrinsic;
use crate::layout::Layout;
use crate::sema::AnalysisInfo;
use crate::types::{TypeInfo, TypeKind};
use std::collections::HashMap;

/// Lowers the analyzed, optimized program into one IR function.
pub fn lower(
    ast: &Ast<'_>,
    info: &AnalysisInfo,
    layouts: &[&Layout],
) -> Result<Func> {
    let mut functions = HashMap::new();
    if let NodeKind::Program { decls } = &ast.node(ast.root).kind {
        for &decl in decls {
            if let NodeKind::Function { name, .. } = &ast.node(decl).kind {
                functions.insert(*name, decl);
            }
        }
    }

    // The value returned by `main` lands in the member named `@ret`,
    // searched across all argument slots.
    let mut ret_member = None;
    for (slot, layout) in layouts.iter().enumerate() {
        if let Some(member) = layout.get("@ret") {
            ret_member = Some((slot as u32, member.offset, member.type_info.deref()));
            break;
        }
    }

    let mut lowerer = Lowerer {
        ast,
        func: Func::new(layouts.len() as u32),
        cur: BlockId(0),
        var_base: HashMap::new(),
        var_types: &info.var_types,
        functions,
        loops: Vec::new(),
        inline: Vec::new(),
        ret_member,
    };
    lowerer.cur = lowerer.func.new_block();

    for &global in &info.globals {
        lowerer.stmt(global)?;
    }

    let NodeKind::Function { body, .. } = &ast.node(info.main).kind else {
        return Err(Error::InvalidState("main is not a function"));
    };
    lowerer.stmt(*body)?;

    // Implicit return on fall-through, plus terminators for any join
    // blocks left unreachable by returning branches.
    for i in 0..lowerer.func.blocks.len() {
        if lowerer.func.blocks[i].term.is_none() {
            lowerer.func.blocks[i].term = Some(Term::Ret);
        }
    }
    Ok(lowerer.func)
}

/// A lowered value: one virtual register per column (exactly one for
/// scalars and vectors).
#[derive(Debug, Clone)]
struct RVal {
    regs: Vec<VReg>,
    ty: TypeInfo,
}

impl RVal {
    fn single(reg: VReg, ty: TypeInfo) -> RVal {
        RVal { regs: vec![reg], ty }
    }

    fn reg(&self) -> VReg {
        self.regs[0]
    }
}

struct LoopCtx {
    break_to: BlockId,
    continue_to: BlockId,
}

struct InlineCtx {
    ret_base: u32,
    end_block: BlockId,
}

struct Lowerer<'a, 's> {
    ast: &'a Ast<'s>,
    func: Func,
    cur: BlockId,
    /// Analyzer variable id → base variable slot (matrices take one slot
    /// per column).
    var_base: HashMap<u32, u32>,
    var_types: &'a [TypeInfo],
    functions: HashMap<&'s str, NodeId>,
    loops: Vec<LoopCtx>,
    inline: Vec<InlineCtx>,
    ret_member: Option<(u32, i32, TypeInfo)>,
}

/// Element info of one column of `ty`.
fn col_info(ty: TypeInfo) -> VRegInfo {
    VRegInfo { kind: ty.kind(), lanes: ty.lanes().max(1) as u8 }
}

fn col_count(ty: TypeInfo) -> u32 {
    ty.cols().max(1)
}

impl<'a, 's> Lowerer<'a, 's> {
    fn emit(&mut self, inst: Inst) {
        self.func.push(self.cur, inst);
    }

    fn emit_to(&mut self, op: Op, info: VRegInfo, srcs: &[VReg]) -> VReg {
        let dst = self.func.new_vreg(info);
        self.emit(Inst::new(op, dst, srcs));
        dst
    }

    fn seal(&mut self, term: Term) {
        self.func.seal(self.cur, term);
    }

    fn sealed(&self) -> bool {
        self.func.is_sealed(self.cur)
    }

    fn switch_to(&mut self, block: BlockId) {
        self.cur = block;
    }

    fn ensure_var(&mut self, var: u32) -> u32 {
        if let Some(&base) = self.var_base.get(&var) {
            return base;
        }
        let ty = self.var_types[var as usize];
        let base = self.alloc_slots(ty);
        self.var_base.insert(var, base);
        base
    }

    fn alloc_slots(&mut self, ty: TypeInfo) -> u32 {
        let info = col_info(ty);
        let base = self.func.new_var(VarSlot { kind: info.kind, lanes: info.lanes });
        for _ in 1..col_count(ty) {
            self.func.new_var(VarSlot { kind: info.kind, lanes: info.lanes });
        }
        base
    }

    fn store_slots(&mut self, base: u32, val: &RVal) {
        for (i, &reg) in val.regs.iter().enumerate() {
            self.emit(Inst::new(Op::StoreVar, VReg::NONE, &[reg]).with_a(base + i as u32));
        }
    }

    fn load_slots(&mut self, base: u32, ty: TypeInfo) -> RVal {
        let info = col_info(ty);
        let mut regs = Vec::new();
        for i in 0..col_count(ty) {
            let reg = self.func.new_vreg(info);
            self.emit(Inst::new(Op::LoadVar, reg, &[]).with_a(base + i));
            regs.push(reg);
        }
        RVal { regs, ty }
    }

    fn imm_scalar(&mut self, kind: TypeKind, bits: i64) -> VReg {
        let dst = self.func.new_vreg(VRegInfo::scalar(kind));
        self.emit(Inst::new(Op::Imm, dst, &[]).with_imm(bits));
        dst
    }

    fn zero_value(&mut self, ty: TypeInfo) -> RVal {
        let info = col_info(ty);
        let mut regs = Vec::new();
        for _ in 0..col_count(ty) {
            let scalar = self.imm_scalar(info.kind, 0);
            let reg = if info.lanes > 1 {
                self.emit_to(Op::Broadcast, info, &[scalar])
            } else {
                scalar
            };
            regs.push(reg);
        }
        RVal { regs, ty }
    }

    fn one_like(&mut self, ty: TypeInfo) -> RVal {
        let info = col_info(ty);
        let bits = match info.kind {
            TypeKind::Float => 1.0f32.to_bits() as i64,
            TypeKind::Double => 1.0f64.to_bits() as i64,
            _ => 1,
        };
        let scalar = self.imm_scalar(info.kind, bits);
        let reg = if info.lanes > 1 {
            self.emit_to(Op::Broadcast, info, &[scalar])
        } else {
            scalar
        };
        RVal::single(reg, ty)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn stmt(&mut self, id: NodeId) -> Result<()> {
        match self.ast.node(id).kind.clone() {
            NodeKind::Block { stmts } => {
                for stmt in stmts {
                    if self.sealed() {
                        break;
                    }
                    self.stmt(stmt)?;
                }
                Ok(())
            }
            NodeKind::VarDecl { decls, .. } => {
                for entry in &decls {
                    let base = self.ensure_var(entry.var);
                    let value = match entry.init {
                        Some(init) => self.value(init)?,
                        None => self.zero_value(entry.ty),
                    };
                    self.store_slots(base, &value);
                }
                Ok(())
            }
            NodeKind::If { cond, then_stmt, else_stmt } => {
                let then_block = self.func.new_block();
                let end_block = self.func.new_block();
                let else_block = match else_stmt {
                    Some(_) => self.func.new_block(),
                    None => end_block,
                };
                self.lower_cond(cond, then_block, else_block)?;

                self.switch_to(then_block);
                self.stmt(then_stmt)?;
                if !self.sealed() {
                    self.seal(Term::Jump(end_block));
                }
                if let Some(else_stmt) = else_stmt {
                    self.switch_to(else_block);
                    self.stmt(else_stmt)?;
                    if !self.sealed() {
                        self.seal(Term::Jump(end_block));
                    }
                }
                self.switch_to(end_block);
                Ok(())
            }
            NodeKind::While { cond, body } => {
                let header = self.func.new_block();
                let body_block = self.func.new_block();
                let latch = self.func.new_block();
                let exit = self.func.new_block();

                self.seal(Term::Jump(header));
                self.switch_to(header);
                self.lower_cond(cond, body_block, exit)?;

                self.switch_to(body_block);
                self.loops.push(LoopCtx { break_to: exit, continue_to: latch });
                self.stmt(body)?;
                self.loops.pop();
                if !self.sealed() {
                    self.seal(Term::Jump(latch));
                }
                self.switch_to(latch);
                self.seal(Term::Jump(header));
                self.switch_to(exit);
                Ok(())
            }
            NodeKind::DoWhile { body, cond } => {
                let body_block = self.func.new_block();
                let latch = self.func.new_block();
                let exit = self.func.new_block();

                self.seal(Term::Jump(body_block));
                self.switch_to(body_block);
                self.loops.push(LoopCtx { break_to: exit, continue_to: latch });
                self.stmt(body)?;
                self.loops.pop();
                if !self.sealed() {
                    self.seal(Term::Jump(latch));
                }
                self.switch_to(latch);
                self.lower_cond(cond, body_block, exit)?;
                self.switch_to(exit);
                Ok(())
            }
            NodeKind::For { init, cond, step, body } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let header = self.func.new_block();
                let body_block = self.func.new_block();
                let latch = self.func.new_block();
                let exit = self.func.new_block();

                self.seal(Term::Jump(header));
                self.switch_to(header);
                match cond {
                    Some(cond) => self.lower_cond(cond, body_block, exit)?,
                    None => self.seal(Term::Jump(body_block)),
                }

                self.switch_to(body_block);
                self.loops.push(LoopCtx { break_to: exit, continue_to: latch });
                self.stmt(body)?;
                self.loops.pop();
                if !self.sealed() {
                    self.seal(Term::Jump(latch));
                }
                self.switch_to(latch);
                if let Some(step) = step {
                    self.value(step)?;
                }
                self.seal(Term::Jump(header));
                self.switch_to(exit);
                Ok(())
            }
            NodeKind::Break => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.break_to)
                    .ok_or(Error::InvalidState("break outside loop"))?;
                self.seal(Term::Jump(target));
                Ok(())
            }
            NodeKind::Continue => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.continue_to)
                    .ok_or(Error::InvalidState("continue outside loop"))?;
                self.seal(Term::Jump(target));
                Ok(())
            }
            NodeKind::Return { value } => {
                if let Some(ctx) = self.inline.last() {
                    let (ret_base, end_block) = (ctx.ret_base, ctx.end_block);
                    if let Some(value) = value {
                        let v = self.value(value)?;
                        self.store_slots(ret_base, &v);
                    }
                    self.seal(Term::Jump(end_block));
                    return Ok(());
                }
                if let Some(value) = value {
                    let v = self.value(value)?;
                    self.store_main_result(&v)?;
                }
                self.seal(Term::Ret);
                Ok(())
            }
            NodeKind::ExprStmt { expr } => {
                self.value(expr)?;
                Ok(())
            }
            _ => Err(Error::InvalidState("statement expected")),
        }
    }

    fn store_main_result(&mut self, value: &RVal) -> Result<()> {
        let Some((slot, offset, member_ty)) = self.ret_member else {
            return Ok(());
        };
        let out = if value.ty.deref() == member_ty {
            value.clone()
        } else if value.ty.deref().explicit_cast_ok(member_ty) {
            self.cast_value(value, member_ty)
        } else {
            return Ok(()); // incompatible return slot is ignored
        };
        self.store_member(slot, offset, &out);
        Ok(())
    }

    fn store_member(&mut self, slot: u32, offset: i32, value: &RVal) {
        let col_size = value.ty.col_size() as i64;
        for (i, &reg) in value.regs.iter().enumerate() {
            self.emit(
                Inst::new(Op::StoreArg, VReg::NONE, &[reg])
                    .with_a(slot)
                    .with_imm(offset as i64 + col_size * i as i64),
            );
        }
    }

    /// Lowers a boolean expression in branch context, wiring `&&`, `||`
    /// and `!` directly into the CFG.
    fn lower_cond(&mut self, id: NodeId, then_block: BlockId, else_block: BlockId) -> Result<()> {
        match self.ast.node(id).kind.clone() {
            NodeKind::Binary { op: BinaryOp::LogAnd, lhs, rhs } => {
                let mid = self.func.new_block();
                self.lower_cond(lhs, mid, else_block)?;
                self.switch_to(mid);
                self.lower_cond(rhs, then_block, else_block)
            }
            NodeKind::Binary { op: BinaryOp::LogOr, lhs, rhs } => {
                let mid = self.func.new_block();
                self.lower_cond(lhs, then_block, mid)?;
                self.switch_to(mid);
                self.lower_cond(rhs, then_block, else_block)
            }
            NodeKind::Unary { op: UnaryOp::Not, expr } => {
                self.lower_cond(expr, else_block, then_block)
            }
            _ => {
                let cond = self.value(id)?;
                self.seal(Term::Branch { cond: cond.reg(), then_block, else_block });
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn value(&mut self, id: NodeId) -> Result<RVal> {
        let ty = self.ast.ty(id).deref();
        match self.ast.node(id).kind.clone() {
            NodeKind::Literal { value } => self.literal(value, ty),
            NodeKind::VarRef { var } => {
                let base = self.ensure_var(var);
                Ok(self.load_slots(base, ty))
            }
            NodeKind::MemberRef { slot, offset } => {
                let info = col_info(ty);
                let col_size = ty.col_size() as i64;
                let mut regs = Vec::new();
                for i in 0..col_count(ty) {
                    let reg = self.func.new_vreg(info);
                    self.emit(
                        Inst::new(Op::LoadArg, reg, &[])
                            .with_a(slot)
                            .with_imm(offset as i64 + col_size * i as i64),
                    );
                    regs.push(reg);
                }
                Ok(RVal { regs, ty })
            }
            NodeKind::Swizzle { base, mask } => {
                let base_val = self.value(base)?;
                Ok(self.swizzle_value(&base_val, mask, ty))
            }
            NodeKind::Index { base, index } => {
                let base_val = self.value(base)?;
                let index_val = self.value(index)?;
                if base_val.ty.is_matrix() {
                    Ok(self.select_column(&base_val, &index_val, ty))
                } else {
                    let dst = self.emit_to(
                        Op::ExtractDyn,
                        VRegInfo::scalar(ty.kind()),
                        &[base_val.reg(), index_val.reg()],
                    );
                    Ok(RVal::single(dst, ty))
                }
            }
            NodeKind::Unary { op, expr } => self.unary(op, expr, ty),
            NodeKind::Binary { op, lhs, rhs } => self.binary(id, op, lhs, rhs, ty),
            NodeKind::Ternary { cond, then_expr, else_expr } => {
                self.ternary(cond, then_expr, else_expr, ty)
            }
            NodeKind::Call { name, args } => self.call(name, &args, ty),
            NodeKind::Cast { expr } => {
                let inner = self.value(expr)?;
                Ok(self.cast_value(&inner, ty))
            }
            _ => Err(Error::InvalidState("expression expected")),
        }
    }

    fn literal(&mut self, value: LitValue<'_>, ty: TypeInfo) -> Result<RVal> {
        let reg = match value {
            LitValue::Bool(v) => self.imm_scalar(TypeKind::Bool, v as i64),
            LitValue::Int(v) => self.imm_scalar(TypeKind::Int, v as i64),
            LitValue::Float(v) => self.imm_scalar(TypeKind::Float, v.to_bits() as i64),
            LitValue::Double(v) => self.imm_scalar(TypeKind::Double, v.to_bits() as i64),
            LitValue::Vector(v) => {
                let idx = self.func.pool.intern(pool_bytes(&v));
                let info = VRegInfo { kind: v.kind, lanes: v.lanes };
                let dst = self.func.new_vreg(info);
                self.emit(Inst::new(Op::ConstPool, dst, &[]).with_a(idx));
                dst
            }
            LitValue::Str(_) => return Err(Error::InvalidState("string escaped analysis")),
        };
        Ok(RVal::single(reg, ty))
    }

    fn swizzle_value(&mut self, base: &RVal, mask: SwizzleMask, ty: TypeInfo) -> RVal {
        if mask.len == 1 {
            let dst = self.emit_to(Op::Extract, VRegInfo::scalar(ty.kind()), &[base.reg()]);
            self.last_inst_a(mask.idx[0] as u32);
            return RVal::single(dst, ty);
        }
        let mut packed = 0u32;
        for i in 0..4 {
            let lane = mask.idx[(i as usize).min(mask.len as usize - 1)];
            packed |= (lane as u32) << (2 * i);
        }
        let info = VRegInfo { kind: ty.kind(), lanes: mask.len };
        let dst = self.emit_to(Op::Shuffle, info, &[base.reg()]);
        self.last_inst_a(packed);
        RVal::single(dst, ty)
    }

    fn last_inst_a(&mut self, a: u32) {
        let block = &mut self.func.blocks[self.cur.index()];
        block.insts.last_mut().unwrap().a = a;
    }

    /// Dynamic matrix column read, lowered branch-free as a select chain.
    fn select_column(&mut self, base: &RVal, index: &RVal, ty: TypeInfo) -> RVal {
        let info = col_info(ty);
        let mask_info = VRegInfo { kind: TypeKind::Bool, lanes: info.lanes };
        let mut acc = base.regs[0];
        for (j, &col) in base.regs.iter().enumerate().skip(1) {
            let j_imm = self.imm_scalar(TypeKind::Int, j as i64);
            let cmp = self.emit_to(
                Op::CmpEq,
                VRegInfo::scalar(TypeKind::Bool),
                &[index.reg(), j_imm],
            );
            let mask = self.emit_to(Op::Broadcast, mask_info, &[cmp]);
            acc = self.emit_to(Op::Select, info, &[mask, col, acc]);
        }
        RVal::single(acc, ty)
    }

    fn unary(&mut self, op: UnaryOp, expr: NodeId, ty: TypeInfo) -> Result<RVal> {
        if op.is_inc_dec() {
            let current = self.value(expr)?;
            let one = self.one_like(current.ty);
            let op_kind = match op {
                UnaryOp::PreInc | UnaryOp::PostInc => Op::Add,
                _ => Op::Sub,
            };
            let info = col_info(current.ty);
            let updated = self.emit_to(op_kind, info, &[current.reg(), one.reg()]);
            let updated = RVal::single(updated, current.ty);
            self.store_lvalue(expr, &updated)?;
            return Ok(match op {
                UnaryOp::PostInc | UnaryOp::PostDec => current,
                _ => updated,
            });
        }

        let inner = self.value(expr)?;
        match op {
            UnaryOp::Plus => Ok(inner),
            UnaryOp::Neg => {
                let info = col_info(ty);
                let regs = inner
                    .regs
                    .iter()
                    .map(|&r| self.emit_to(Op::Neg, info, &[r]))
                    .collect();
                Ok(RVal { regs, ty })
            }
            UnaryOp::Not | UnaryOp::BitNot => {
                let info = col_info(ty);
                let dst = self.emit_to(Op::Not, info, &[inner.reg()]);
                Ok(RVal::single(dst, ty))
            }
            _ => unreachable!(),
        }
    }

    fn binary(
        &mut self,
        id: NodeId,
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
        ty: TypeInfo,
    ) -> Result<RVal> {
        if op == BinaryOp::Assign {
            let value = self.value(rhs)?;
            self.store_lvalue(lhs, &value)?;
            return Ok(value);
        }
        if let Some(base) = op.compound_base() {
            let current = self.value(lhs)?;
            let rhs_val = self.value(rhs)?;
            let updated = self.arith(base, &current, &rhs_val, ty)?;
            self.store_lvalue(lhs, &updated)?;
            return Ok(updated);
        }
        if op.is_logical() {
            return self.logical_value(id);
        }

        let lhs_val = self.value(lhs)?;
        let rhs_val = self.value(rhs)?;

        if op.is_comparison() {
            let cmp_op = match op {
                BinaryOp::Eq => Op::CmpEq,
                BinaryOp::Ne => Op::CmpNe,
                BinaryOp::Lt => Op::CmpLt,
                BinaryOp::Le => Op::CmpLe,
                BinaryOp::Gt => Op::CmpGt,
                _ => Op::CmpGe,
            };
            let dst = self.emit_to(cmp_op, col_info(ty), &[lhs_val.reg(), rhs_val.reg()]);
            return Ok(RVal::single(dst, ty));
        }
        if op.is_bitwise() {
            let bit_op = match op {
                BinaryOp::BitAnd => Op::And,
                BinaryOp::BitOr => Op::Or,
                _ => Op::Xor,
            };
            let dst = self.emit_to(bit_op, col_info(ty), &[lhs_val.reg(), rhs_val.reg()]);
            return Ok(RVal::single(dst, ty));
        }
        if op.is_shift() {
            let shift_op = if op == BinaryOp::Shl { Op::Shl } else { Op::Shr };
            let dst = self.emit_to(shift_op, col_info(ty), &[lhs_val.reg(), rhs_val.reg()]);
            return Ok(RVal::single(dst, ty));
        }

        self.arith(op, &lhs_val, &rhs_val, ty)
    }

    /// Arithmetic over scalars, vectors and matrices.
    fn arith(&mut self, op: BinaryOp, lhs: &RVal, rhs: &RVal, ty: TypeInfo) -> Result<RVal> {
        let ir_op = match op {
            BinaryOp::Add => Op::Add,
            BinaryOp::Sub => Op::Sub,
            BinaryOp::Mul => Op::Mul,
            BinaryOp::Div => Op::Div,
            BinaryOp::Rem => Op::Rem,
            _ => return Err(Error::InvalidState("not an arithmetic operator")),
        };

        if !lhs.ty.is_matrix() && !rhs.ty.is_matrix() {
            let info = col_info(ty);
            let dst = self.emit_to(ir_op, info, &[lhs.reg(), rhs.reg()]);
            return Ok(RVal::single(dst, ty));
        }

        // Matrix forms.
        match op {
            BinaryOp::Add | BinaryOp::Sub => {
                let info = col_info(ty);
                let regs = lhs
                    .regs
                    .iter()
                    .zip(&rhs.regs)
                    .map(|(&a, &b)| self.emit_to(ir_op, info, &[a, b]))
                    .collect();
                Ok(RVal { regs, ty })
            }
            BinaryOp::Mul => {
                if lhs.ty.is_matrix() && rhs.ty.is_scalar() {
                    Ok(self.matrix_scale(lhs, rhs, ty))
                } else if lhs.ty.is_scalar() && rhs.ty.is_matrix() {
                    Ok(self.matrix_scale(rhs, lhs, ty))
                } else if lhs.ty.is_matrix() && rhs.ty.is_vector() {
                    Ok(self.matrix_vector(lhs, rhs, ty))
                } else if lhs.ty.is_vector() && rhs.ty.is_matrix() {
                    Ok(self.vector_matrix(lhs, rhs, ty))
                } else {
                    Ok(self.matrix_matrix(lhs, rhs, ty))
                }
            }
            _ => Err(Error::InvalidState("unsupported matrix operator")),
        }
    }

    fn matrix_scale(&mut self, mat: &RVal, scalar: &RVal, ty: TypeInfo) -> RVal {
        let info = col_info(ty);
        let splat = self.emit_to(Op::Broadcast, info, &[scalar.reg()]);
        let regs = mat
            .regs
            .iter()
            .map(|&col| self.emit_to(Op::Mul, info, &[col, splat]))
            .collect();
        RVal { regs, ty }
    }

    /// `mat * vec`: sum of columns scaled by the vector's lanes.
    fn matrix_vector(&mut self, mat: &RVal, vec: &RVal, ty: TypeInfo) -> RVal {
        let info = col_info(ty);
        let mut acc = None;
        for (j, &col) in mat.regs.iter().enumerate() {
            let lane = self.emit_to(Op::Extract, VRegInfo::scalar(info.kind), &[vec.reg()]);
            self.last_inst_a(j as u32);
            let splat = self.emit_to(Op::Broadcast, info, &[lane]);
            let term = self.emit_to(Op::Mul, info, &[col, splat]);
            acc = Some(match acc {
                None => term,
                Some(prev) => self.emit_to(Op::Add, info, &[prev, term]),
            });
        }
        RVal::single(acc.unwrap(), ty)
    }

    /// `vec * mat`: one dot product per column.
    fn vector_matrix(&mut self, vec: &RVal, mat: &RVal, ty: TypeInfo) -> RVal {
        let info = col_info(ty);
        let vec_info = col_info(vec.ty);
        let scalar_info = VRegInfo::scalar(info.kind);
        let mut result = None;
        for (j, &col) in mat.regs.iter().enumerate() {
            let prod = self.emit_to(Op::Mul, vec_info, &[vec.reg(), col]);
            let sum = self.emit_to(Op::HSum, scalar_info, &[prod]);
            result = Some(match result {
                None => self.emit_to(Op::Broadcast, info, &[sum]),
                Some(prev) => {
                    let ins = self.emit_to(Op::Insert, info, &[prev, sum]);
                    self.last_inst_a(j as u32);
                    ins
                }
            });
        }
        RVal::single(result.unwrap(), ty)
    }

    fn matrix_matrix(&mut self, lhs: &RVal, rhs: &RVal, ty: TypeInfo) -> RVal {
        let col_ty = TypeInfo::vector(ty.kind(), ty.rows());
        let regs = rhs
            .regs
            .iter()
            .map(|&rhs_col| {
                let col_val = RVal::single(rhs_col, TypeInfo::vector(ty.kind(), lhs.ty.cols()));
                self.matrix_vector(lhs, &col_val, col_ty).reg()
            })
            .collect();
        RVal { regs, ty }
    }

    /// Short-circuit `&&`/`||` in value context: branch through
    /// [`lower_cond`] and materialize the result from a temporary slot.
    fn logical_value(&mut self, id: NodeId) -> Result<RVal> {
        let tmp = self.alloc_slots(TypeInfo::BOOL);
        let true_block = self.func.new_block();
        let false_block = self.func.new_block();
        let end_block = self.func.new_block();

        self.lower_cond(id, true_block, false_block)?;

        self.switch_to(true_block);
        let one = self.imm_scalar(TypeKind::Bool, 1);
        self.emit(Inst::new(Op::StoreVar, VReg::NONE, &[one]).with_a(tmp));
        self.seal(Term::Jump(end_block));

        self.switch_to(false_block);
        let zero = self.imm_scalar(TypeKind::Bool, 0);
        self.emit(Inst::new(Op::StoreVar, VReg::NONE, &[zero]).with_a(tmp));
        self.seal(Term::Jump(end_block));

        self.switch_to(end_block);
        Ok(self.load_slots(tmp, TypeInfo::BOOL))
    }

    fn ternary(
        &mut self,
        cond: NodeId,
        then_expr: NodeId,
        else_expr: NodeId,
        ty: TypeInfo,
    ) -> Result<RVal> {
        let cond_ty = self.ast.ty(cond).deref();
        if cond_ty.is_vector() {
            let mask = self.value(cond)?;
            let a = self.value(then_expr)?;
            let b = self.value(else_expr)?;
            let info = col_info(ty);
            let dst = self.emit_to(Op::Select, info, &[mask.reg(), a.reg(), b.reg()]);
            return Ok(RVal::single(dst, ty));
        }

        let tmp = self.alloc_slots(ty);
        let then_block = self.func.new_block();
        let else_block = self.func.new_block();
        let end_block = self.func.new_block();

        self.lower_cond(cond, then_block, else_block)?;

        self.switch_to(then_block);
        let a = self.value(then_expr)?;
        self.store_slots(tmp, &a);
        self.seal(Term::Jump(end_block));

        self.switch_to(else_block);
        let b = self.value(else_expr)?;
        self.store_slots(tmp, &b);
        self.seal(Term::Jump(end_block));

        self.switch_to(end_block);
        Ok(self.load_slots(tmp, ty))
    }

    fn call(&mut self, name: &'s str, args: &[NodeId], ty: TypeInfo) -> Result<RVal> {
        if let Some(intrinsic) = Intrinsic::from_name(name) {
            return self.intrinsic(intrinsic, args, ty);
        }
        if crate::lang::type_by_name(name).is_some() {
            return self.construct(args, ty);
        }
        let Some(&func_node) = self.functions.get(name) else {
            return Err(Error::InvalidState("call to unknown function"));
        };
        self.inline_call(func_node, args)
    }

    fn construct(&mut self, args: &[NodeId], ty: TypeInfo) -> Result<RVal> {
        if ty.is_matrix() {
            let mut regs = Vec::with_capacity(args.len());
            for &arg in args {
                regs.push(self.value(arg)?.reg());
            }
            return Ok(RVal { regs, ty });
        }
        // Vector from scalar lanes: splat the first, insert the rest.
        let info = col_info(ty);
        let first = self.value(args[0])?;
        let mut acc = self.emit_to(Op::Broadcast, info, &[first.reg()]);
        for (lane, &arg) in args.iter().enumerate().skip(1) {
            let v = self.value(arg)?;
            acc = self.emit_to(Op::Insert, info, &[acc, v.reg()]);
            self.last_inst_a(lane as u32);
        }
        Ok(RVal::single(acc, ty))
    }

    fn intrinsic(&mut self, intrinsic: Intrinsic, args: &[NodeId], ty: TypeInfo) -> Result<RVal> {
        let info = col_info(ty);
        match intrinsic {
            Intrinsic::Abs
            | Intrinsic::Sqrt
            | Intrinsic::Floor
            | Intrinsic::Ceil
            | Intrinsic::Round
            | Intrinsic::Trunc => {
                let op = match intrinsic {
                    Intrinsic::Abs => Op::Abs,
                    Intrinsic::Sqrt => Op::Sqrt,
                    Intrinsic::Floor => Op::Floor,
                    Intrinsic::Ceil => Op::Ceil,
                    Intrinsic::Round => Op::Round,
                    _ => Op::Trunc,
                };
                let a = self.value(args[0])?;
                let dst = self.emit_to(op, info, &[a.reg()]);
                Ok(RVal::single(dst, ty))
            }
            Intrinsic::Min | Intrinsic::Max => {
                let op = if intrinsic == Intrinsic::Min { Op::Min } else { Op::Max };
                let a = self.value(args[0])?;
                let b = self.value(args[1])?;
                let dst = self.emit_to(op, info, &[a.reg(), b.reg()]);
                Ok(RVal::single(dst, ty))
            }
            Intrinsic::Frac => {
                let a = self.value(args[0])?;
                let floor = self.emit_to(Op::Floor, info, &[a.reg()]);
                let dst = self.emit_to(Op::Sub, info, &[a.reg(), floor]);
                Ok(RVal::single(dst, ty))
            }
            Intrinsic::Dot => {
                let a = self.value(args[0])?;
                let b = self.value(args[1])?;
                let prod_info = col_info(a.ty);
                let prod = self.emit_to(Op::Mul, prod_info, &[a.reg(), b.reg()]);
                let dst = self.emit_to(Op::HSum, info, &[prod]);
                Ok(RVal::single(dst, ty))
            }
            Intrinsic::Lerp => {
                let a = self.value(args[0])?;
                let b = self.value(args[1])?;
                let t = self.value(args[2])?;
                let t_reg = if t.ty.is_scalar() && !ty.is_scalar() {
                    self.emit_to(Op::Broadcast, info, &[t.reg()])
                } else {
                    t.reg()
                };
                let delta = self.emit_to(Op::Sub, info, &[b.reg(), a.reg()]);
                let scaled = self.emit_to(Op::Mul, info, &[delta, t_reg]);
                let dst = self.emit_to(Op::Add, info, &[a.reg(), scaled]);
                Ok(RVal::single(dst, ty))
            }
        }
    }

    fn inline_call(&mut self, func_node: NodeId, args: &[NodeId]) -> Result<RVal> {
        let NodeKind::Function { ret, params, body, .. } = self.ast.node(func_node).kind.clone()
        else {
            return Err(Error::InvalidState("inlining a non-function"));
        };

        for (param, &arg) in params.iter().zip(args) {
            let value = self.value(arg)?;
            let base = self.ensure_var(param.var);
            self.store_slots(base, &value);
        }

        let ret_ty = ret.deref();
        let ret_base = if ret_ty.is_void() {
            u32::MAX
        } else {
            let base = self.alloc_slots(ret_ty);
            let zero = self.zero_value(ret_ty);
            self.store_slots(base, &zero);
            base
        };

        let end_block = self.func.new_block();
        self.inline.push(InlineCtx { ret_base, end_block });
        self.stmt(body)?;
        let ctx = self.inline.pop().unwrap();
        if !self.sealed() {
            self.seal(Term::Jump(ctx.end_block));
        }
        self.switch_to(ctx.end_block);

        if ret_ty.is_void() {
            Ok(RVal { regs: vec![], ty: TypeInfo::VOID })
        } else {
            Ok(self.load_slots(ctx.ret_base, ret_ty))
        }
    }

    fn cast_value(&mut self, value: &RVal, target: TypeInfo) -> RVal {
        let from = value.ty.deref();
        let target = target.deref();
        if from == target {
            return RVal { regs: value.regs.clone(), ty: target };
        }
        let mut reg = value.reg();
        // Element-kind conversion happens at the source shape, the
        // broadcast afterwards.
        if from.kind() != target.kind() {
            let info = VRegInfo { kind: target.kind(), lanes: from.lanes().max(1) as u8 };
            reg = self.emit_to(Op::Cast, info, &[reg]);
        }
        if from.lanes() == 1 && target.lanes() > 1 {
            let info = col_info(target);
            reg = self.emit_to(Op::Broadcast, info, &[reg]);
        }
        RVal::single(reg, target)
    }

    fn store_lvalue(&mut self, id: NodeId, value: &RVal) -> Result<()> {
        match self.ast.node(id).kind.clone() {
            NodeKind::VarRef { var } => {
                let base = self.ensure_var(var);
                self.store_slots(base, value);
                Ok(())
            }
            NodeKind::MemberRef { slot, offset } => {
                self.store_member(slot, offset, value);
                Ok(())
            }
            NodeKind::Swizzle { base, mask } => {
                // Read-modify-write of the swizzled lanes.
                let base_val = self.value(base)?;
                let info = col_info(base_val.ty);
                let mut acc = base_val.reg();
                for i in 0..mask.len {
                    let lane_val = if value.ty.is_scalar() {
                        value.reg()
                    } else {
                        let scalar = VRegInfo::scalar(value.ty.kind());
                        let v = self.emit_to(Op::Extract, scalar, &[value.reg()]);
                        self.last_inst_a(i as u32);
                        v
                    };
                    acc = self.emit_to(Op::Insert, info, &[acc, lane_val]);
                    self.last_inst_a(mask.idx[i as usize] as u32);
                }
                let updated = RVal::single(acc, base_val.ty);
                self.store_lvalue(base, &updated)
            }
            _ => Err(Error::InvalidState("assignment target is not an lvalue")),
        }
    }
}

/// Serializes a vector constant for the pool: bool lanes widen to full
/// 0/-1 masks, everything else keeps its natural width.
fn pool_bytes(v: &ConstVec) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    for i in 0..v.lanes as usize {
        match v.kind {
            TypeKind::Double => {
                bytes[i * 8..i * 8 + 8].copy_from_slice(&v.bits[i].to_le_bytes());
            }
            TypeKind::Bool => {
                let mask: u32 = if v.bits[i] != 0 { u32::MAX } else { 0 };
                bytes[i * 4..i * 4 + 4].copy_from_slice(&mask.to_le_bytes());
            }
            _ => {
                bytes[i * 4..i * 4 + 4].copy_from_slice(&(v.bits[i] as u32).to_le_bytes());
            }
        }
    }
    bytes
}
