//! Semantic analysis.
//!
//! A single top-down pass over the parsed AST that resolves names,
//! infers and checks types, inserts implicit casts and rewrites
//! identifier/member nodes into their resolved forms (`VarRef`,
//! `ObjectRef`, `MemberRef`, `Swizzle`). The pass only ever adds or
//! rewrites nodes; it never removes any. After it succeeds, every
//! expression node carries a fully-resolved type; reference (lvalue)
//! types survive only on assignment targets.

use crate::ast::{
    Ast, BinaryOp, LitValue, NodeId, NodeKind, SwizzleMask, UnaryOp, VarDeclEntry,
};
use crate::error::{Error, Result};
use crate::lang::{self, Intrinsic};
use crate::layout::Layout;
use crate::output_log::ErrorReporter;
use crate::session::CompilationSession;
use crate::types::{TypeInfo, TypeKind};
use std::collections::HashMap;

/// What a name means in some scope.
#[derive(Debug, Clone)]
enum Symbol<'s> {
    Variable { var: u32, ty: TypeInfo, is_const: bool },
    Function { node: NodeId },
    Constant { value: LitValue<'s> },
    Object { slot: u32 },
    Member { slot: u32, offset: i32, ty: TypeInfo },
}

/// Results of analysis that later pipeline stages need.
#[derive(Debug)]
pub struct AnalysisInfo {
    /// The `main` function node.
    pub main: NodeId,
    /// Type of each variable slot, indexed by the ids stored in
    /// `VarRef`/`VarDeclEntry` nodes.
    pub var_types: Vec<TypeInfo>,
    /// Top-level variable declarations, in source order. Lowered at the
    /// head of `main`.
    pub globals: Vec<NodeId>,
}

pub struct Analyzer<'a, 'src, 'log, 's> {
    session: &'a CompilationSession<'s>,
    ast: &'a mut Ast<'s>,
    reporter: &'a mut ErrorReporter<'src, 'log>,
    layouts: &'a [&'a Layout],
    /// Scope stack; index 0 is the built-in scope, index 1 the program
    /// scope. Built-ins may never be shadowed.
    scopes: Vec<HashMap<&'s str, Symbol<'s>>>,
    var_types: Vec<TypeInfo>,
    globals: Vec<NodeId>,
    loop_depth: u32,
    current_ret: TypeInfo,
    analyzing_fn: Option<&'s str>,
    main: Option<NodeId>,
}

impl<'a, 'src, 'log, 's> Analyzer<'a, 'src, 'log, 's> {
    pub fn new(
        session: &'a CompilationSession<'s>,
        ast: &'a mut Ast<'s>,
        reporter: &'a mut ErrorReporter<'src, 'log>,
        layouts: &'a [&'a Layout],
    ) -> Self {
        Self {
            session,
            ast,
            reporter,
            layouts,
            scopes: vec![HashMap::new()],
            var_types: Vec::new(),
            globals: Vec::new(),
            loop_depth: 0,
            current_ret: TypeInfo::VOID,
            analyzing_fn: None,
            main: None,
        }
    }

    pub fn run(mut self) -> Result<AnalysisInfo> {
        self.install_builtins()?;
        self.install_argument_objects()?;
        self.scopes.push(HashMap::new()); // program scope

        let decls = match &self.ast.node(self.ast.root).kind {
            NodeKind::Program { decls } => decls.clone(),
            _ => return Err(Error::InvalidState("root is not a program")),
        };

        for decl in decls {
            match self.ast.node(decl).kind.clone() {
                NodeKind::Function { .. } => self.function(decl)?,
                NodeKind::VarDecl { .. } => {
                    self.statement(decl)?;
                    self.globals.push(decl);
                }
                _ => return Err(Error::InvalidState("unexpected top-level node")),
            }
        }

        let Some(main) = self.main else {
            return Err(self.error(Error::SymbolNotFound, 0, "no 'main' function defined"));
        };
        Ok(AnalysisInfo {
            main,
            var_types: self.var_types,
            globals: self.globals,
        })
    }

    fn install_builtins(&mut self) -> Result<()> {
        for &(name, value) in lang::CONSTANTS {
            self.scopes[0].insert(name, Symbol::Constant { value: LitValue::Float(value) });
        }
        Ok(())
    }

    fn install_argument_objects(&mut self) -> Result<()> {
        let layouts = self.layouts;
        for (slot, layout) in layouts.iter().enumerate() {
            match layout.name() {
                Some(name) if !name.is_empty() => {
                    let name = self.session.intern_str(name);
                    if self.reserved_name(name) || self.scopes[0].contains_key(name) {
                        return Err(self.error(
                            Error::SymbolCollision,
                            0,
                            &format!("argument object '{name}' collides with an existing symbol"),
                        ));
                    }
                    self.scopes[0].insert(name, Symbol::Object { slot: slot as u32 });
                }
                _ => {
                    // Anonymous layouts inject their members directly into
                    // the root scope.
                    for member in layout.members() {
                        if member.name.starts_with('@') {
                            continue; // return slot, not addressable by name
                        }
                        let name = self.session.intern_str(&member.name);
                        if self.reserved_name(name) || self.scopes[0].contains_key(name) {
                            return Err(self.error(
                                Error::SymbolCollision,
                                0,
                                &format!("member '{name}' collides with an existing symbol"),
                            ));
                        }
                        self.scopes[0].insert(
                            name,
                            Symbol::Member {
                                slot: slot as u32,
                                offset: member.offset,
                                ty: member.type_info,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn reserved_name(&self, name: &str) -> bool {
        lang::type_by_name(name).is_some()
            || Intrinsic::from_name(name).is_some()
            || name == "true"
            || name == "false"
    }

    fn error(&mut self, err: Error, pos: u32, msg: &str) -> Error {
        self.reporter.error(err, pos, msg)
    }

    fn lookup(&self, name: &str) -> Option<Symbol<'s>> {
        for scope in self.scopes.iter().rev() {
            if let Some(sym) = scope.get(name) {
                return Some(sym.clone());
            }
        }
        None
    }

    fn declare(&mut self, name: &'s str, pos: u32, symbol: Symbol<'s>) -> Result<()> {
        if self.reserved_name(name) || self.scopes[0].contains_key(name) {
            return Err(self.error(
                Error::SymbolCollision,
                pos,
                &format!("'{name}' is a built-in name and cannot be redeclared"),
            ));
        }
        let scope = self.scopes.last_mut().unwrap();
        if scope.contains_key(name) {
            return Err(self.error(
                Error::AlreadyExists,
                pos,
                &format!("'{name}' is already declared in this scope"),
            ));
        }
        scope.insert(name, symbol);
        Ok(())
    }

    fn new_var(&mut self, ty: TypeInfo) -> u32 {
        let var = self.var_types.len() as u32;
        self.var_types.push(ty);
        var
    }

    // ------------------------------------------------------------------
    // Declarations and statements
    // ------------------------------------------------------------------

    fn function(&mut self, id: NodeId) -> Result<()> {
        let NodeKind::Function { name, ret, params, body } = self.ast.node(id).kind.clone()
        else {
            unreachable!()
        };
        let pos = self.ast.pos(id);

        self.declare(name, pos, Symbol::Function { node: id })?;
        if name == "main" {
            if !params.is_empty() {
                return Err(self.error(
                    Error::TypeMismatch,
                    pos,
                    "'main' does not take parameters",
                ));
            }
            self.main = Some(id);
        }

        let saved_ret = std::mem::replace(&mut self.current_ret, ret);
        let saved_fn = self.analyzing_fn.replace(name);
        self.scopes.push(HashMap::new());

        // Parameters behave like initialized locals; their slots are
        // rebound per call site during lowering.
        let mut param_vars = Vec::with_capacity(params.len());
        for p in &params {
            if p.ty.is_void() {
                return Err(self.error(Error::TypeMismatch, p.pos, "parameter cannot be void"));
            }
            let var = self.new_var(p.ty);
            param_vars.push(var);
            self.declare(p.name, p.pos, Symbol::Variable { var, ty: p.ty, is_const: false })?;
        }

        self.statement(body)?;

        self.scopes.pop();
        self.analyzing_fn = saved_fn;
        self.current_ret = saved_ret;

        // Record the parameter slots on the node for the lowerer.
        if let NodeKind::Function { params, .. } = &mut self.ast.node_mut(id).kind {
            for (p, var) in params.iter_mut().zip(param_vars) {
                p.var = var;
            }
        }
        self.ast.set_ty(id, ret);
        Ok(())
    }

    fn statement(&mut self, id: NodeId) -> Result<()> {
        let kind = self.ast.node(id).kind.clone();
        match kind {
            NodeKind::Block { stmts } => {
                self.scopes.push(HashMap::new());
                for stmt in stmts {
                    self.statement(stmt)?;
                }
                self.scopes.pop();
                Ok(())
            }
            NodeKind::VarDecl { is_const, mut decls } => {
                for entry in &mut decls {
                    self.var_decl_entry(entry, is_const)?;
                }
                self.ast.node_mut(id).kind = NodeKind::VarDecl { is_const, decls };
                Ok(())
            }
            NodeKind::If { cond, then_stmt, else_stmt } => {
                self.bool_condition(cond)?;
                self.statement(then_stmt)?;
                if let Some(else_stmt) = else_stmt {
                    self.statement(else_stmt)?;
                }
                Ok(())
            }
            NodeKind::While { cond, body } => {
                self.bool_condition(cond)?;
                self.loop_depth += 1;
                self.statement(body)?;
                self.loop_depth -= 1;
                Ok(())
            }
            NodeKind::DoWhile { body, cond } => {
                self.loop_depth += 1;
                self.statement(body)?;
                self.loop_depth -= 1;
                self.bool_condition(cond)?;
                Ok(())
            }
            NodeKind::For { init, cond, step, body } => {
                self.scopes.push(HashMap::new());
                if let Some(init) = init {
                    self.statement(init)?;
                }
                if let Some(cond) = cond {
                    self.bool_condition(cond)?;
                }
                if let Some(step) = step {
                    self.value_expr(step)?;
                }
                self.loop_depth += 1;
                self.statement(body)?;
                self.loop_depth -= 1;
                self.scopes.pop();
                Ok(())
            }
            NodeKind::Break | NodeKind::Continue => {
                if self.loop_depth == 0 {
                    let pos = self.ast.pos(id);
                    let what = if matches!(kind, NodeKind::Break) { "break" } else { "continue" };
                    return Err(self.error(
                        Error::InvalidState("jump outside of loop"),
                        pos,
                        &format!("'{what}' used outside of a loop"),
                    ));
                }
                Ok(())
            }
            NodeKind::Return { value } => {
                let pos = self.ast.pos(id);
                let ret = self.current_ret;
                match value {
                    Some(expr) => {
                        if ret.is_void() {
                            return Err(self.error(
                                Error::TypeMismatch,
                                pos,
                                "void function cannot return a value",
                            ));
                        }
                        self.value_expr(expr)?;
                        let coerced = self.coerce(expr, ret)?;
                        self.ast.node_mut(id).kind = NodeKind::Return { value: Some(coerced) };
                    }
                    None => {
                        if !ret.is_void() {
                            return Err(self.error(
                                Error::TypeMismatch,
                                pos,
                                &format!("function must return a value of type '{ret}'"),
                            ));
                        }
                    }
                }
                Ok(())
            }
            NodeKind::ExprStmt { expr } => {
                self.value_expr(expr)?;
                Ok(())
            }
            _ => Err(Error::InvalidState("statement expected")),
        }
    }

    fn var_decl_entry(&mut self, entry: &mut VarDeclEntry<'s>, is_const: bool) -> Result<()> {
        if is_const && entry.init.is_none() {
            return Err(self.error(
                Error::InvalidState("const without initializer"),
                entry.pos,
                &format!("const '{}' must be initialized", entry.name),
            ));
        }
        if let Some(init) = entry.init {
            self.value_expr(init)?;
            entry.init = Some(self.coerce(init, entry.ty)?);
        }
        let ty = if is_const { entry.ty.with_const() } else { entry.ty };
        let var = self.new_var(entry.ty);
        entry.var = var;
        self.declare(entry.name, entry.pos, Symbol::Variable { var, ty, is_const })?;
        Ok(())
    }

    fn bool_condition(&mut self, cond: NodeId) -> Result<()> {
        let ty = self.value_expr(cond)?;
        if !(ty.kind() == TypeKind::Bool && ty.is_scalar()) {
            let pos = self.ast.pos(cond);
            return Err(self.error(
                Error::TypeMismatch,
                pos,
                &format!("condition must be 'bool', found '{ty}'"),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Analyzes an expression in value context: reference qualifiers do
    /// not survive on the node. Write-only members cannot be read.
    fn value_expr(&mut self, id: NodeId) -> Result<TypeInfo> {
        let ty = self.expr(id)?;
        if matches!(self.ast.node(id).kind, NodeKind::ObjectRef { .. }) {
            let pos = self.ast.pos(id);
            return Err(self.error(
                Error::InvalidOperator,
                pos,
                "argument object used as a value",
            ));
        }
        if ty.is_write_only() {
            let pos = self.ast.pos(id);
            return Err(self.error(
                Error::InvalidOperator,
                pos,
                "write-only member cannot be read",
            ));
        }
        let value_ty = ty.deref();
        self.ast.set_ty(id, value_ty);
        Ok(value_ty)
    }

    /// Analyzes an expression keeping lvalue information on the node.
    fn expr(&mut self, id: NodeId) -> Result<TypeInfo> {
        let kind = self.ast.node(id).kind.clone();
        let pos = self.ast.pos(id);
        let ty = match kind {
            NodeKind::Literal { value } => value.type_info(),
            NodeKind::Ident { name } => return self.ident(id, name, pos),
            NodeKind::Member { base, name } => return self.member(id, base, name, pos),
            NodeKind::Index { base, index } => return self.index(id, base, index, pos),
            NodeKind::Unary { op, expr } => return self.unary(id, op, expr, pos),
            NodeKind::Binary { op, lhs, rhs } => return self.binary(id, op, lhs, rhs, pos),
            NodeKind::Ternary { cond, then_expr, else_expr } => {
                return self.ternary(id, cond, then_expr, else_expr, pos)
            }
            NodeKind::Call { name, args } => return self.call(id, name, args, pos),
            NodeKind::Cast { .. } => self.ast.ty(id),
            // Already-resolved forms keep their type.
            NodeKind::VarRef { .. }
            | NodeKind::ObjectRef { .. }
            | NodeKind::MemberRef { .. }
            | NodeKind::Swizzle { .. } => self.ast.ty(id),
            _ => {
                return Err(self.error(Error::InvalidState("expression expected"), pos, "internal"))
            }
        };
        self.ast.set_ty(id, ty);
        Ok(ty)
    }

    fn ident(&mut self, id: NodeId, name: &'s str, pos: u32) -> Result<TypeInfo> {
        let Some(symbol) = self.lookup(name) else {
            return Err(self.error(
                Error::SymbolNotFound,
                pos,
                &format!("unresolved symbol '{name}'"),
            ));
        };
        let ty = match symbol {
            Symbol::Variable { var, ty, is_const } => {
                self.ast.node_mut(id).kind = NodeKind::VarRef { var };
                let mut t = ty.deref().with_ref();
                if is_const {
                    t = t.with_const();
                }
                t
            }
            Symbol::Constant { value } => {
                self.ast.node_mut(id).kind = NodeKind::Literal { value };
                value.type_info()
            }
            Symbol::Object { slot } => {
                self.ast.node_mut(id).kind = NodeKind::ObjectRef { slot };
                TypeInfo::VOID
            }
            Symbol::Member { slot, offset, ty } => {
                self.ast.node_mut(id).kind = NodeKind::MemberRef { slot, offset };
                ty.deref()
                    .with_ref()
                    .bits_with_access(ty)
            }
            Symbol::Function { .. } => {
                return Err(self.error(
                    Error::InvalidOperator,
                    pos,
                    &format!("function '{name}' used as a value"),
                ));
            }
        };
        self.ast.set_ty(id, ty);
        Ok(ty)
    }

    fn member(&mut self, id: NodeId, base: NodeId, name: &'s str, pos: u32) -> Result<TypeInfo> {
        let base_ty = self.expr(base)?;

        // Member access on an argument object resolves through its layout.
        if let NodeKind::ObjectRef { slot } = self.ast.node(base).kind {
            let layout = self.layouts[slot as usize];
            let Some(member) = layout.get(name) else {
                return Err(self.error(
                    Error::SymbolNotFound,
                    pos,
                    &format!("no member '{name}' in this object"),
                ));
            };
            let (offset, mty) = (member.offset, member.type_info);
            self.ast.node_mut(id).kind = NodeKind::MemberRef { slot, offset };
            let ty = mty.deref().with_ref().bits_with_access(mty);
            self.ast.set_ty(id, ty);
            return Ok(ty);
        }

        // Swizzles on vectors.
        if base_ty.deref().is_vector() {
            let Some(mask) = SwizzleMask::parse(name) else {
                return Err(self.error(
                    Error::SymbolNotFound,
                    pos,
                    &format!("'{name}' is not a component of '{}'", base_ty.deref()),
                ));
            };
            if (mask.max_lane() as u32) >= base_ty.lanes() {
                return Err(self.error(
                    Error::InvalidOperator,
                    pos,
                    &format!("swizzle '.{mask}' exceeds the lanes of '{}'", base_ty.deref()),
                ));
            }
            let kind = base_ty.kind();
            let ty = if mask.len == 1 {
                TypeInfo::scalar(kind)
            } else {
                TypeInfo::vector(kind, mask.len as u32)
            };
            // A swizzle of an lvalue with distinct lanes is itself an
            // lvalue.
            let ty = if base_ty.is_ref() && !base_ty.is_const() && !mask.has_duplicates() {
                ty.with_ref().bits_with_access(base_ty)
            } else {
                ty
            };
            self.ast.node_mut(id).kind = NodeKind::Swizzle { base, mask };
            self.ast.set_ty(id, ty);
            return Ok(ty);
        }

        Err(self.error(
            Error::InvalidOperator,
            pos,
            &format!("'{}' has no members", base_ty.deref()),
        ))
    }

    fn index(&mut self, id: NodeId, base: NodeId, index: NodeId, pos: u32) -> Result<TypeInfo> {
        let base_ty = self.value_expr(base)?;
        let index_ty = self.value_expr(index)?;
        if !(index_ty.kind() == TypeKind::Int && index_ty.is_scalar()) {
            return Err(self.error(
                Error::TypeMismatch,
                pos,
                &format!("index must be 'int', found '{index_ty}'"),
            ));
        }
        let ty = if base_ty.is_vector() {
            TypeInfo::scalar(base_ty.kind())
        } else if base_ty.is_matrix() {
            TypeInfo::vector(base_ty.kind(), base_ty.rows())
        } else {
            return Err(self.error(
                Error::InvalidOperator,
                pos,
                &format!("'{base_ty}' cannot be indexed"),
            ));
        };
        self.ast.set_ty(id, ty);
        Ok(ty)
    }

    fn unary(&mut self, id: NodeId, op: UnaryOp, expr: NodeId, pos: u32) -> Result<TypeInfo> {
        if op.is_inc_dec() {
            let ty = self.expr(expr)?;
            self.require_writable(expr, ty, pos)?;
            let vt = ty.deref();
            if !matches!(vt.kind(), TypeKind::Int | TypeKind::Float | TypeKind::Double)
                || vt.is_matrix()
            {
                return Err(self.error(
                    Error::InvalidOperator,
                    pos,
                    &format!("'{}' cannot be applied to '{vt}'", op.symbol()),
                ));
            }
            self.ast.set_ty(id, vt);
            return Ok(vt);
        }

        let ty = self.value_expr(expr)?;
        let result = match op {
            UnaryOp::Plus | UnaryOp::Neg => {
                if !matches!(ty.kind(), TypeKind::Int | TypeKind::Float | TypeKind::Double) {
                    return Err(self.error(
                        Error::InvalidOperator,
                        pos,
                        &format!("'{}' cannot be applied to '{ty}'", op.symbol()),
                    ));
                }
                ty
            }
            UnaryOp::Not => {
                if ty.kind() != TypeKind::Bool {
                    return Err(self.error(
                        Error::InvalidOperator,
                        pos,
                        &format!("'!' requires 'bool', found '{ty}'"),
                    ));
                }
                ty
            }
            UnaryOp::BitNot => {
                if ty.kind() != TypeKind::Int || ty.is_matrix() {
                    return Err(self.error(
                        Error::InvalidOperator,
                        pos,
                        &format!("'~' requires an integer type, found '{ty}'"),
                    ));
                }
                ty
            }
            _ => unreachable!(),
        };
        self.ast.set_ty(id, result);
        Ok(result)
    }

    fn binary(
        &mut self,
        id: NodeId,
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
        pos: u32,
    ) -> Result<TypeInfo> {
        if op == BinaryOp::Assign {
            let lhs_ty = self.expr(lhs)?;
            self.require_writable(lhs, lhs_ty, pos)?;
            self.value_expr(rhs)?;
            let target = lhs_ty.deref();
            let rhs = self.coerce(rhs, target)?;
            self.ast.node_mut(id).kind = NodeKind::Binary { op, lhs, rhs };
            self.ast.set_ty(id, target);
            return Ok(target);
        }

        if let Some(base) = op.compound_base() {
            let lhs_ty = self.expr(lhs)?;
            self.require_writable(lhs, lhs_ty, pos)?;
            let target = lhs_ty.deref();
            self.value_expr(rhs)?;
            let rhs = if base.is_shift() {
                self.coerce(rhs, TypeInfo::INT)?
            } else {
                let operand = self.binary_operand_type(base, target, self.ast.ty(rhs), pos)?;
                if operand != target {
                    return Err(self.error(
                        Error::InvalidCast,
                        pos,
                        &format!("cannot assign '{operand}' back to '{target}'"),
                    ));
                }
                self.coerce(rhs, target)?
            };
            self.ast.node_mut(id).kind = NodeKind::Binary { op, lhs, rhs };
            self.ast.set_ty(id, target);
            return Ok(target);
        }

        if op.is_logical() {
            for operand in [lhs, rhs] {
                let ty = self.value_expr(operand)?;
                if !(ty.kind() == TypeKind::Bool && ty.is_scalar()) {
                    let opos = self.ast.pos(operand);
                    return Err(self.error(
                        Error::InvalidOperator,
                        opos,
                        &format!("'{}' requires scalar 'bool', found '{ty}'", op.symbol()),
                    ));
                }
            }
            self.ast.set_ty(id, TypeInfo::BOOL);
            return Ok(TypeInfo::BOOL);
        }

        let lhs_ty = self.value_expr(lhs)?;
        let rhs_ty = self.value_expr(rhs)?;

        if op.is_shift() {
            if lhs_ty.kind() != TypeKind::Int || lhs_ty.is_matrix() {
                return Err(self.error(
                    Error::InvalidOperator,
                    pos,
                    &format!("'{}' requires integer operands", op.symbol()),
                ));
            }
            let rhs = self.coerce(rhs, TypeInfo::INT)?;
            self.ast.node_mut(id).kind = NodeKind::Binary { op, lhs, rhs };
            self.ast.set_ty(id, lhs_ty);
            return Ok(lhs_ty);
        }

        if op.is_comparison() {
            let operand = self.comparison_operand_type(op, lhs_ty, rhs_ty, pos)?;
            let lhs = self.coerce(lhs, operand)?;
            let rhs = self.coerce(rhs, operand)?;
            let result = if operand.is_vector() {
                TypeInfo::vector(TypeKind::Bool, operand.lanes())
            } else {
                TypeInfo::BOOL
            };
            self.ast.node_mut(id).kind = NodeKind::Binary { op, lhs, rhs };
            self.ast.set_ty(id, result);
            return Ok(result);
        }

        if op.is_bitwise() {
            let operand = self.bitwise_operand_type(lhs_ty, rhs_ty, pos)?;
            let lhs = self.coerce(lhs, operand)?;
            let rhs = self.coerce(rhs, operand)?;
            self.ast.node_mut(id).kind = NodeKind::Binary { op, lhs, rhs };
            self.ast.set_ty(id, operand);
            return Ok(operand);
        }

        // Arithmetic: + - * / %
        let result = self.binary_operand_type(op, lhs_ty, rhs_ty, pos)?;
        if result.is_matrix() || lhs_ty.is_matrix() || rhs_ty.is_matrix() {
            // Linear-algebra shapes keep their operand shapes; scalar
            // operands are widened to float here and broadcast per column
            // during lowering.
            let scalar = TypeInfo::FLOAT;
            let lhs = if lhs_ty.is_scalar() { self.coerce(lhs, scalar)? } else { lhs };
            let rhs = if rhs_ty.is_scalar() { self.coerce(rhs, scalar)? } else { rhs };
            self.ast.node_mut(id).kind = NodeKind::Binary { op, lhs, rhs };
            self.ast.set_ty(id, result);
            return Ok(result);
        }
        let lhs = self.coerce(lhs, result)?;
        let rhs = self.coerce(rhs, result)?;
        self.ast.node_mut(id).kind = NodeKind::Binary { op, lhs, rhs };
        self.ast.set_ty(id, result);
        Ok(result)
    }

    /// Result type of a component-wise or linear-algebra arithmetic op.
    fn binary_operand_type(
        &mut self,
        op: BinaryOp,
        lhs: TypeInfo,
        rhs: TypeInfo,
        pos: u32,
    ) -> Result<TypeInfo> {
        let fail = |this: &mut Self, code| {
            Err(this.error(
                code,
                pos,
                &format!("operator '{}' is not defined for '{lhs}' and '{rhs}'", op.symbol()),
            ))
        };

        // Matrix algebra first.
        if lhs.is_matrix() || rhs.is_matrix() {
            if lhs.kind() != TypeKind::Float && rhs.kind() != TypeKind::Float {
                return fail(self, Error::InvalidOperator);
            }
            return match op {
                BinaryOp::Add | BinaryOp::Sub => {
                    if lhs.deref() == rhs.deref() {
                        Ok(lhs.deref())
                    } else {
                        fail(self, Error::TypeMismatch)
                    }
                }
                BinaryOp::Mul => {
                    if lhs.is_matrix() && rhs.is_matrix() {
                        if lhs.cols() == rhs.rows() {
                            Ok(TypeInfo::matrix(TypeKind::Float, lhs.rows(), rhs.cols()))
                        } else {
                            fail(self, Error::TypeMismatch)
                        }
                    } else if lhs.is_matrix() && rhs.is_vector() {
                        if lhs.cols() == rhs.lanes() && rhs.kind() == TypeKind::Float {
                            Ok(TypeInfo::vector(TypeKind::Float, lhs.rows()))
                        } else {
                            fail(self, Error::TypeMismatch)
                        }
                    } else if lhs.is_vector() && rhs.is_matrix() {
                        if lhs.lanes() == rhs.rows() && lhs.kind() == TypeKind::Float {
                            Ok(TypeInfo::vector(TypeKind::Float, rhs.cols()))
                        } else {
                            fail(self, Error::TypeMismatch)
                        }
                    } else if lhs.is_matrix() && rhs.is_scalar() {
                        Ok(lhs.deref())
                    } else if lhs.is_scalar() && rhs.is_matrix() {
                        Ok(rhs.deref())
                    } else {
                        fail(self, Error::InvalidOperator)
                    }
                }
                _ => fail(self, Error::InvalidOperator),
            };
        }

        let numeric = |k: TypeKind| matches!(k, TypeKind::Int | TypeKind::Float | TypeKind::Double);
        if !numeric(lhs.kind()) || !numeric(rhs.kind()) {
            return fail(self, Error::InvalidOperator);
        }
        if op == BinaryOp::Rem
            && (lhs.kind() != TypeKind::Int || rhs.kind() != TypeKind::Int)
        {
            return fail(self, Error::InvalidOperator);
        }
        let Some(kind) = TypeInfo::promote_kind(lhs.kind(), rhs.kind()) else {
            return fail(self, Error::InvalidOperator);
        };
        let lanes = match (lhs.lanes(), rhs.lanes()) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return fail(self, Error::TypeMismatch),
        };
        Ok(TypeInfo::vector(kind, lanes))
    }

    fn comparison_operand_type(
        &mut self,
        op: BinaryOp,
        lhs: TypeInfo,
        rhs: TypeInfo,
        pos: u32,
    ) -> Result<TypeInfo> {
        if lhs.is_matrix() || rhs.is_matrix() {
            return Err(self.error(
                Error::InvalidOperator,
                pos,
                "matrices cannot be compared",
            ));
        }
        if lhs.kind() == TypeKind::Bool && rhs.kind() == TypeKind::Bool {
            if matches!(op, BinaryOp::Eq | BinaryOp::Ne) && lhs.deref() == rhs.deref() {
                return Ok(lhs.deref());
            }
            return Err(self.error(
                Error::InvalidOperator,
                pos,
                &format!("cannot order 'bool' values with '{}'", op.symbol()),
            ));
        }
        self.binary_operand_type(BinaryOp::Add, lhs, rhs, pos)
    }

    fn bitwise_operand_type(
        &mut self,
        lhs: TypeInfo,
        rhs: TypeInfo,
        pos: u32,
    ) -> Result<TypeInfo> {
        let ok = |k: TypeKind| matches!(k, TypeKind::Int | TypeKind::Bool);
        if !ok(lhs.kind()) || !ok(rhs.kind()) || lhs.kind() != rhs.kind() {
            return Err(self.error(
                Error::InvalidOperator,
                pos,
                &format!("bitwise operator is not defined for '{lhs}' and '{rhs}'"),
            ));
        }
        let lanes = match (lhs.lanes(), rhs.lanes()) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(self.error(
                    Error::TypeMismatch,
                    pos,
                    &format!("shape mismatch between '{lhs}' and '{rhs}'"),
                ))
            }
        };
        Ok(TypeInfo::vector(lhs.kind(), lanes))
    }

    fn ternary(
        &mut self,
        id: NodeId,
        cond: NodeId,
        then_expr: NodeId,
        else_expr: NodeId,
        pos: u32,
    ) -> Result<TypeInfo> {
        let cond_ty = self.value_expr(cond)?;
        if cond_ty.kind() != TypeKind::Bool || cond_ty.is_matrix() {
            return Err(self.error(
                Error::TypeMismatch,
                pos,
                &format!("ternary condition must be 'bool', found '{cond_ty}'"),
            ));
        }
        let then_ty = self.value_expr(then_expr)?;
        let else_ty = self.value_expr(else_expr)?;
        let result = self.binary_operand_type(BinaryOp::Add, then_ty, else_ty, pos)?;
        // A vector condition selects lane-wise; shapes must agree with it.
        if cond_ty.is_vector() && (result.is_matrix() || result.lanes() != cond_ty.lanes()) {
            return Err(self.error(
                Error::TypeMismatch,
                pos,
                &format!("'{cond_ty}' cannot select between '{result}' values"),
            ));
        }
        let then_expr = self.coerce(then_expr, result)?;
        let else_expr = self.coerce(else_expr, result)?;
        self.ast.node_mut(id).kind = NodeKind::Ternary { cond, then_expr, else_expr };
        self.ast.set_ty(id, result);
        Ok(result)
    }

    fn call(&mut self, id: NodeId, name: &'s str, args: Vec<NodeId>, pos: u32) -> Result<TypeInfo> {
        // Constructor / explicit cast.
        if let Some(target) = lang::type_by_name(name) {
            return self.construct(id, target, args, pos);
        }

        // Intrinsics.
        if let Some(intrinsic) = Intrinsic::from_name(name) {
            return self.intrinsic_call(id, intrinsic, args, pos);
        }

        // User functions.
        match self.lookup(name) {
            Some(Symbol::Function { node }) => {
                if self.analyzing_fn == Some(name) {
                    return Err(self.error(
                        Error::InvalidOperator,
                        pos,
                        &format!("recursive call to '{name}' is not allowed"),
                    ));
                }
                let NodeKind::Function { ret, params, .. } = self.ast.node(node).kind.clone()
                else {
                    unreachable!()
                };
                if params.len() != args.len() {
                    return Err(self.error(
                        Error::TypeMismatch,
                        pos,
                        &format!(
                            "'{name}' takes {} argument(s), {} given",
                            params.len(),
                            args.len()
                        ),
                    ));
                }
                let mut coerced = Vec::with_capacity(args.len());
                for (arg, param) in args.iter().zip(&params) {
                    self.value_expr(*arg)?;
                    coerced.push(self.coerce(*arg, param.ty)?);
                }
                self.ast.node_mut(id).kind = NodeKind::Call { name, args: coerced };
                self.ast.set_ty(id, ret);
                Ok(ret)
            }
            Some(_) => Err(self.error(
                Error::InvalidOperator,
                pos,
                &format!("'{name}' is not callable"),
            )),
            None => Err(self.error(
                Error::SymbolNotFound,
                pos,
                &format!("unresolved function '{name}'"),
            )),
        }
    }

    fn construct(
        &mut self,
        id: NodeId,
        target: TypeInfo,
        args: Vec<NodeId>,
        pos: u32,
    ) -> Result<TypeInfo> {
        if target.is_void() {
            return Err(self.error(Error::InvalidCast, pos, "cannot construct 'void'"));
        }

        // Single argument: explicit cast (with broadcast for vectors).
        if args.len() == 1 && !target.is_matrix() {
            let arg = args[0];
            let from = self.value_expr(arg)?;
            if !from.explicit_cast_ok(target) {
                return Err(self.error(
                    Error::InvalidCast,
                    pos,
                    &format!("cannot cast '{from}' to '{target}'"),
                ));
            }
            self.ast.node_mut(id).kind = NodeKind::Cast { expr: arg };
            self.ast.set_ty(id, target);
            return Ok(target);
        }

        if target.is_matrix() {
            // Column-by-column construction.
            if args.len() != target.cols() as usize {
                return Err(self.error(
                    Error::TypeMismatch,
                    pos,
                    &format!("'{target}' takes {} column arguments", target.cols()),
                ));
            }
            let column = TypeInfo::vector(target.kind(), target.rows());
            let mut coerced = Vec::with_capacity(args.len());
            for arg in &args {
                self.value_expr(*arg)?;
                coerced.push(self.coerce(*arg, column)?);
            }
            let name = self.type_name_str(target);
            self.ast.node_mut(id).kind = NodeKind::Call { name, args: coerced };
            self.ast.set_ty(id, target);
            return Ok(target);
        }

        // Lane-by-lane vector construction.
        if target.is_scalar() || args.len() != target.lanes() as usize {
            return Err(self.error(
                Error::TypeMismatch,
                pos,
                &format!("'{target}' takes {} argument(s)", target.lanes().max(1)),
            ));
        }
        let lane_ty = TypeInfo::scalar(target.kind());
        let mut coerced = Vec::with_capacity(args.len());
        for arg in &args {
            let from = self.value_expr(*arg)?;
            if !from.is_scalar() {
                let apos = self.ast.pos(*arg);
                return Err(self.error(
                    Error::TypeMismatch,
                    apos,
                    &format!("constructor argument must be scalar, found '{from}'"),
                ));
            }
            if from.implicit_cast_cost(lane_ty).is_none() && !from.explicit_cast_ok(lane_ty) {
                let apos = self.ast.pos(*arg);
                return Err(self.error(
                    Error::InvalidCast,
                    apos,
                    &format!("cannot convert '{from}' to '{lane_ty}'"),
                ));
            }
            coerced.push(self.coerce_explicit(*arg, lane_ty)?);
        }
        let name = self.type_name_str(target);
        self.ast.node_mut(id).kind = NodeKind::Call { name, args: coerced };
        self.ast.set_ty(id, target);
        Ok(target)
    }

    fn intrinsic_call(
        &mut self,
        id: NodeId,
        intrinsic: Intrinsic,
        args: Vec<NodeId>,
        pos: u32,
    ) -> Result<TypeInfo> {
        if args.len() != intrinsic.arg_count() {
            return Err(self.error(
                Error::TypeMismatch,
                pos,
                &format!(
                    "'{}' takes {} argument(s), {} given",
                    intrinsic.name(),
                    intrinsic.arg_count(),
                    args.len()
                ),
            ));
        }
        let mut arg_tys = Vec::with_capacity(args.len());
        for &arg in &args {
            arg_tys.push(self.value_expr(arg)?);
        }
        for (&arg, ty) in args.iter().zip(&arg_tys) {
            if ty.is_matrix() || !matches!(ty.kind(), TypeKind::Int | TypeKind::Float | TypeKind::Double) {
                let apos = self.ast.pos(arg);
                return Err(self.error(
                    Error::InvalidOperator,
                    apos,
                    &format!("'{}' cannot be applied to '{ty}'", intrinsic.name()),
                ));
            }
        }

        // Unify the element kind, widening to float when the intrinsic
        // does not accept integers.
        let mut kind = arg_tys
            .iter()
            .try_fold(TypeKind::Int, |acc, t| TypeInfo::promote_kind(acc, t.kind()))
            .ok_or_else(|| self.reporter.error(Error::InvalidOperator, pos, "bad operands"))?;
        if !intrinsic.accepts_kind(kind) {
            if kind == TypeKind::Int && intrinsic.accepts_kind(TypeKind::Float) {
                kind = TypeKind::Float;
            } else {
                return Err(self.error(
                    Error::InvalidOperator,
                    pos,
                    &format!("'{}' is not defined for '{}'", intrinsic.name(), kind.name()),
                ));
            }
        }

        let result = match intrinsic {
            Intrinsic::Dot => {
                let shape = arg_tys[0].deref();
                if !shape.is_vector() || arg_tys[1].lanes() != shape.lanes() {
                    return Err(self.error(
                        Error::TypeMismatch,
                        pos,
                        "'dot' requires two vectors of the same shape",
                    ));
                }
                let operand = TypeInfo::vector(kind, shape.lanes());
                let mut coerced = Vec::new();
                for &arg in &args {
                    coerced.push(self.coerce(arg, operand)?);
                }
                self.rewrite_call(id, intrinsic, coerced);
                TypeInfo::scalar(kind)
            }
            Intrinsic::Lerp => {
                let lanes = arg_tys[..2]
                    .iter()
                    .map(|t| t.lanes())
                    .max()
                    .unwrap_or(1);
                let operand = TypeInfo::vector(kind, lanes);
                let t_ty = if arg_tys[2].is_scalar() {
                    TypeInfo::scalar(kind)
                } else {
                    operand
                };
                let a = self.coerce(args[0], operand)?;
                let b = self.coerce(args[1], operand)?;
                let t = self.coerce(args[2], t_ty)?;
                self.rewrite_call(id, intrinsic, vec![a, b, t]);
                operand
            }
            _ => {
                let lanes = arg_tys.iter().map(|t| t.lanes()).max().unwrap_or(1);
                for ty in &arg_tys {
                    if ty.lanes() != 1 && ty.lanes() != lanes {
                        return Err(self.error(
                            Error::TypeMismatch,
                            pos,
                            &format!("'{}' operand shapes do not match", intrinsic.name()),
                        ));
                    }
                }
                let operand = TypeInfo::vector(kind, lanes);
                let mut coerced = Vec::new();
                for &arg in &args {
                    coerced.push(self.coerce(arg, operand)?);
                }
                self.rewrite_call(id, intrinsic, coerced);
                operand
            }
        };
        self.ast.set_ty(id, result);
        Ok(result)
    }

    fn rewrite_call(&mut self, id: NodeId, intrinsic: Intrinsic, args: Vec<NodeId>) {
        // Intrinsic names are static and interned by construction.
        let name: &'static str = intrinsic.name();
        self.ast.node_mut(id).kind = NodeKind::Call { name, args };
    }

    fn type_name_str(&mut self, ty: TypeInfo) -> &'s str {
        self.session.intern_str(&ty.to_string())
    }

    fn require_writable(&mut self, node: NodeId, ty: TypeInfo, pos: u32) -> Result<()> {
        if !ty.is_ref() {
            let reason = if matches!(self.ast.node(node).kind, NodeKind::Swizzle { .. }) {
                "swizzle with repeated lanes is not assignable"
            } else {
                "expression is not assignable"
            };
            return Err(self.error(Error::InvalidOperator, pos, reason));
        }
        if ty.is_const() {
            return Err(self.error(Error::InvalidOperator, pos, "cannot assign to a constant"));
        }
        if ty.is_read_only() {
            return Err(self.error(
                Error::InvalidOperator,
                pos,
                "cannot assign to a read-only member",
            ));
        }
        Ok(())
    }

    /// Wraps `expr` in a cast node when its value type differs from
    /// `target`, using implicit-cast rules.
    fn coerce(&mut self, expr: NodeId, target: TypeInfo) -> Result<NodeId> {
        let from = self.ast.ty(expr).deref();
        let target = target.deref();
        if from == target {
            return Ok(expr);
        }
        if from.implicit_cast_cost(target).is_none() {
            let pos = self.ast.pos(expr);
            return Err(self.error(
                Error::InvalidCast,
                pos,
                &format!("cannot implicitly convert '{from}' to '{target}'"),
            ));
        }
        Ok(self.insert_cast(expr, target))
    }

    /// Like [`coerce`], but also allows explicit (narrowing) conversions.
    fn coerce_explicit(&mut self, expr: NodeId, target: TypeInfo) -> Result<NodeId> {
        let from = self.ast.ty(expr).deref();
        let target = target.deref();
        if from == target {
            return Ok(expr);
        }
        if from.implicit_cast_cost(target).is_none() && !from.explicit_cast_ok(target) {
            let pos = self.ast.pos(expr);
            return Err(self.error(
                Error::InvalidCast,
                pos,
                &format!("cannot convert '{from}' to '{target}'"),
            ));
        }
        Ok(self.insert_cast(expr, target))
    }

    fn insert_cast(&mut self, expr: NodeId, target: TypeInfo) -> NodeId {
        let pos = self.ast.pos(expr);
        let cast = self.ast.add(NodeKind::Cast { expr }, pos);
        self.ast.set_ty(cast, target);
        cast
    }
}

/// Access-qualifier transfer helper used when deriving member types.
trait AccessBits {
    fn bits_with_access(self, from: TypeInfo) -> TypeInfo;
}

impl AccessBits for TypeInfo {
    fn bits_with_access(self, from: TypeInfo) -> TypeInfo {
        let mut ty = self;
        if from.is_read_only() {
            ty = ty.with_read_only();
        }
        if from.is_write_only() {
            ty = ty.with_write_only();
        }
        ty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_program;
    use crate::session::CompilationSession;
    use bumpalo::Bump;

    fn analyze_with(
        src: &str,
        build: impl FnOnce(&mut Vec<Layout>),
    ) -> Result<(Ast<'static>, AnalysisInfo)> {
        let arena = Box::leak(Box::new(Bump::new()));
        let session = Box::leak(Box::new(CompilationSession::new(arena)));
        let tokens = tokenize(session, src).unwrap();
        let mut ast = Ast::new();
        parse_program(&mut ast, &tokens)?;

        let mut layouts = Vec::new();
        build(&mut layouts);
        let layout_refs: Vec<&Layout> = layouts.iter().collect();
        let body = src.as_bytes().to_vec().leak();
        let mut reporter = ErrorReporter::new(body, None, false);
        let info = Analyzer::new(session, &mut ast, &mut reporter, &layout_refs).run()?;
        Ok((ast, info))
    }

    fn analyze(src: &str) -> Result<(Ast<'static>, AnalysisInfo)> {
        analyze_with(src, |layouts| {
            let mut input = Layout::new();
            input.configure("in").unwrap();
            input.add("x", TypeInfo::FLOAT, 0).unwrap();
            input
                .add("v", TypeInfo::vector(TypeKind::Float, 4), 16)
                .unwrap();
            input.add("n", TypeInfo::INT, 32).unwrap();
            layouts.push(input);
        })
    }

    #[test]
    fn literal_arithmetic_types() {
        let (ast, info) = analyze("float main() { return 1.0 + 2.0 * 3.0; }").unwrap();
        let dump = ast.dump();
        assert!(dump.contains("Binary[+] : float"));
        assert!(!info.var_types.iter().any(|t| t.is_void()));
    }

    #[test]
    fn int_literal_widens_to_float() {
        let (ast, _) = analyze("float main() { return 1 + 2.0; }").unwrap();
        let dump = ast.dump();
        assert!(dump.contains("Cast : float"));
    }

    #[test]
    fn string_initializer_is_invalid_cast() {
        let err = analyze("float main() { float x = \"oops\"; return x; }").unwrap_err();
        assert_eq!(err, Error::InvalidCast);
    }

    #[test]
    fn unresolved_symbol() {
        let err = analyze("float main() { return nope; }").unwrap_err();
        assert_eq!(err, Error::SymbolNotFound);
    }

    #[test]
    fn member_access_resolves_to_offset() {
        let (ast, _) = analyze("float main() { return in.x; }").unwrap();
        assert!(ast.dump().contains("MemberRef slot0+0 : float"));
    }

    #[test]
    fn swizzle_rules() {
        let (ast, _) = analyze("float2 main() { return in.v.xy; }").unwrap();
        assert!(ast.dump().contains("Swizzle .xy : float2"));

        // Reads may repeat lanes.
        assert!(analyze("float2 main() { return in.v.xx; }").is_ok());

        // Lane out of range.
        let err = analyze("float main() { return in.x.y; }").unwrap_err();
        assert_eq!(err, Error::InvalidOperator);

        // Writes require distinct lanes.
        let err = analyze(
            "float main() { float4 t = in.v; t.xx = float2(1.0, 2.0); return t.x; }",
        )
        .unwrap_err();
        assert_eq!(err, Error::InvalidOperator);

        // Distinct-lane writes are fine.
        analyze("float main() { float4 t = in.v; t.yx = t.xy; return t.x; }").unwrap();
    }

    #[test]
    fn boolean_contexts_require_bool() {
        let err = analyze("int main() { if (in.n) return 1; return 0; }").unwrap_err();
        assert_eq!(err, Error::TypeMismatch);
        analyze("int main() { if (in.n != 0) return 1; return 0; }").unwrap();
    }

    #[test]
    fn logical_ops_are_scalar_bool_only() {
        let err = analyze("int main() { if (in.n && 1) return 1; return 0; }").unwrap_err();
        assert!(matches!(err, Error::InvalidOperator));
    }

    #[test]
    fn break_outside_loop() {
        let err = analyze("int main() { break; return 0; }").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn assignment_requires_lvalue() {
        let err = analyze("int main() { 1 = 2; return 0; }").unwrap_err();
        assert_eq!(err, Error::InvalidOperator);

        let err = analyze("int main() { const int k = 1; k = 2; return k; }").unwrap_err();
        assert_eq!(err, Error::InvalidOperator);
    }

    #[test]
    fn narrowing_needs_explicit_cast() {
        let err = analyze("int main() { int x = 1.5; return x; }").unwrap_err();
        assert_eq!(err, Error::InvalidCast);
        analyze("int main() { int x = int(1.5); return x; }").unwrap();
    }

    #[test]
    fn vector_constructor_and_shapes() {
        let (ast, _) = analyze("float4 main() { return float4(1, 2, 3, 4); }").unwrap();
        assert!(ast.dump().contains("Call float4 : float4"));

        let err = analyze("float4 main() { return float4(1, 2); }").unwrap_err();
        assert_eq!(err, Error::TypeMismatch);

        let err =
            analyze("float4 main() { return float4(1,1,1,1) + float2(1,1); }").unwrap_err();
        assert_eq!(err, Error::TypeMismatch);

        // Scalar broadcast works.
        analyze("float4 main() { return float4(1,1,1,1) + 2.0; }").unwrap();
    }

    #[test]
    fn matrix_dimensioning() {
        let src = |expr: &str| {
            format!(
                "float2 main() {{ float2x2 m = float2x2(float2(1,0), float2(0,1)); return {expr}; }}"
            )
        };
        analyze(&src("m * in.v.xy")).unwrap();
        let err = analyze(&src("m * in.v.xyz")).unwrap_err();
        assert_eq!(err, Error::TypeMismatch);
    }

    #[test]
    fn user_function_calls_and_recursion() {
        analyze(
            "float square(float x) { return x * x; } float main() { return square(2.0); }",
        )
        .unwrap();

        // Declared-after-use is unresolved.
        let err = analyze(
            "float main() { return square(2.0); } float square(float x) { return x * x; }",
        )
        .unwrap_err();
        assert_eq!(err, Error::SymbolNotFound);

        // Self recursion is rejected.
        let err = analyze("float f(float x) { return f(x); } float main() { return f(1.0); }")
            .unwrap_err();
        assert_eq!(err, Error::InvalidOperator);
    }

    #[test]
    fn intrinsic_shapes() {
        analyze("float main() { return dot(in.v, in.v); }").unwrap();
        analyze("float4 main() { return max(in.v, 0.0); }").unwrap();
        analyze("float main() { return sqrt(in.n); }").unwrap(); // int widens
        let err = analyze("float main() { return dot(in.v.xy, in.v); }").unwrap_err();
        assert_eq!(err, Error::TypeMismatch);
    }

    #[test]
    fn missing_main() {
        let err = analyze("float helper() { return 1.0; }").unwrap_err();
        assert_eq!(err, Error::SymbolNotFound);
    }

    #[test]
    fn builtin_constants_resolve() {
        let (ast, _) = analyze("float main() { return PI; }").unwrap();
        assert!(ast.dump().contains("Literal 3.14"));
    }

    #[test]
    fn shadowing_builtin_rejected() {
        let err = analyze("float main() { float PI = 3.0; return PI; }").unwrap_err();
        assert_eq!(err, Error::SymbolCollision);
    }
}
