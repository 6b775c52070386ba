//! Abstract syntax tree.
//!
//! Nodes are tagged variants stored in one index-addressed vector owned
//! by [`Ast`]; [`NodeId`] handles replace owning pointers, so the tree
//! can freely contain back-references and the analyzer can rewrite node
//! kinds in place (resolving identifiers, inserting casts) without any
//! ownership juggling. Every node carries a shared header: its kind, its
//! source position and its resolved type (set during analysis).

use crate::types::{TypeInfo, TypeKind};
use std::fmt::Write as _;

/// Handle of a node inside an [`Ast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
    Not,
    BitNot,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::PreInc | UnaryOp::PostInc => "++",
            UnaryOp::PreDec | UnaryOp::PostDec => "--",
        }
    }

    pub fn is_inc_dec(self) -> bool {
        matches!(
            self,
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    LogAnd,
    LogOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    RemAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    ShlAssign,
    ShrAssign,
}

impl BinaryOp {
    pub fn is_assign(self) -> bool {
        self.compound_base().is_some() || self == BinaryOp::Assign
    }

    /// For compound assignments, the underlying arithmetic op.
    pub fn compound_base(self) -> Option<BinaryOp> {
        Some(match self {
            BinaryOp::AddAssign => BinaryOp::Add,
            BinaryOp::SubAssign => BinaryOp::Sub,
            BinaryOp::MulAssign => BinaryOp::Mul,
            BinaryOp::DivAssign => BinaryOp::Div,
            BinaryOp::RemAssign => BinaryOp::Rem,
            BinaryOp::AndAssign => BinaryOp::BitAnd,
            BinaryOp::OrAssign => BinaryOp::BitOr,
            BinaryOp::XorAssign => BinaryOp::BitXor,
            BinaryOp::ShlAssign => BinaryOp::Shl,
            BinaryOp::ShrAssign => BinaryOp::Shr,
            _ => return None,
        })
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogAnd | BinaryOp::LogOr)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor)
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::LogAnd => "&&",
            BinaryOp::LogOr => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Assign => "=",
            BinaryOp::AddAssign => "+=",
            BinaryOp::SubAssign => "-=",
            BinaryOp::MulAssign => "*=",
            BinaryOp::DivAssign => "/=",
            BinaryOp::RemAssign => "%=",
            BinaryOp::AndAssign => "&=",
            BinaryOp::OrAssign => "|=",
            BinaryOp::XorAssign => "^=",
            BinaryOp::ShlAssign => "<<=",
            BinaryOp::ShrAssign => ">>=",
        }
    }
}

/// A folded vector constant: up to four lanes, each stored as raw bits in
/// its own slot (`f32`/`i32`/`bool` in the low 32 bits, `f64` in all 64).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstVec {
    pub kind: TypeKind,
    pub lanes: u8,
    pub bits: [u64; 4],
}

impl ConstVec {
    pub fn lane_f64(&self, lane: usize) -> f64 {
        match self.kind {
            TypeKind::Double => f64::from_bits(self.bits[lane]),
            TypeKind::Float => f32::from_bits(self.bits[lane] as u32) as f64,
            _ => self.bits[lane] as u32 as i32 as f64,
        }
    }
}

/// A literal value as carried by a `Literal` node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LitValue<'s> {
    Bool(bool),
    Int(i32),
    Float(f32),
    Double(f64),
    Str(&'s str),
    Vector(ConstVec),
}

impl<'s> LitValue<'s> {
    pub fn type_info(&self) -> TypeInfo {
        match self {
            LitValue::Bool(_) => TypeInfo::BOOL,
            LitValue::Int(_) => TypeInfo::INT,
            LitValue::Float(_) => TypeInfo::FLOAT,
            LitValue::Double(_) => TypeInfo::DOUBLE,
            LitValue::Str(_) => TypeInfo::STR,
            LitValue::Vector(v) => TypeInfo::vector(v.kind, v.lanes as u32),
        }
    }
}

/// Swizzle selector: a permutation of up to four source lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwizzleMask {
    pub len: u8,
    pub idx: [u8; 4],
}

impl SwizzleMask {
    /// Parses `.xyzw`-style selectors; the `rgba` and `stpq` alphabets
    /// are equivalent. Returns `None` if `text` is not a swizzle.
    pub fn parse(text: &str) -> Option<SwizzleMask> {
        if text.is_empty() || text.len() > 4 {
            return None;
        }
        const SETS: [&[u8; 4]; 3] = [b"xyzw", b"rgba", b"stpq"];
        'set: for set in SETS {
            let mut idx = [0u8; 4];
            for (i, &b) in text.as_bytes().iter().enumerate() {
                match set.iter().position(|&c| c == b) {
                    Some(lane) => idx[i] = lane as u8,
                    None => continue 'set,
                }
            }
            return Some(SwizzleMask { len: text.len() as u8, idx });
        }
        None
    }

    /// The highest source lane referenced.
    pub fn max_lane(&self) -> u8 {
        self.idx[..self.len as usize].iter().copied().max().unwrap_or(0)
    }

    pub fn has_duplicates(&self) -> bool {
        let lanes = &self.idx[..self.len as usize];
        lanes
            .iter()
            .enumerate()
            .any(|(i, l)| lanes[..i].contains(l))
    }
}

impl std::fmt::Display for SwizzleMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &lane in &self.idx[..self.len as usize] {
            f.write_str(match lane {
                0 => "x",
                1 => "y",
                2 => "z",
                _ => "w",
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Param<'s> {
    pub name: &'s str,
    pub ty: TypeInfo,
    pub pos: u32,
    /// Variable slot assigned by the analyzer; `u32::MAX` until resolved.
    pub var: u32,
}

#[derive(Debug, Clone)]
pub struct VarDeclEntry<'s> {
    pub name: &'s str,
    pub ty: TypeInfo,
    pub init: Option<NodeId>,
    pub pos: u32,
    /// Variable slot assigned by the analyzer; `u32::MAX` until resolved.
    pub var: u32,
}

#[derive(Debug, Clone)]
pub enum NodeKind<'s> {
    Program {
        decls: Vec<NodeId>,
    },
    Function {
        name: &'s str,
        ret: TypeInfo,
        params: Vec<Param<'s>>,
        body: NodeId,
    },
    Block {
        stmts: Vec<NodeId>,
    },
    VarDecl {
        is_const: bool,
        decls: Vec<VarDeclEntry<'s>>,
    },
    If {
        cond: NodeId,
        then_stmt: NodeId,
        else_stmt: Option<NodeId>,
    },
    For {
        init: Option<NodeId>,
        cond: Option<NodeId>,
        step: Option<NodeId>,
        body: NodeId,
    },
    While {
        cond: NodeId,
        body: NodeId,
    },
    DoWhile {
        body: NodeId,
        cond: NodeId,
    },
    Break,
    Continue,
    Return {
        value: Option<NodeId>,
    },
    ExprStmt {
        expr: NodeId,
    },

    Literal {
        value: LitValue<'s>,
    },
    Ident {
        name: &'s str,
    },
    Unary {
        op: UnaryOp,
        expr: NodeId,
    },
    Binary {
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Ternary {
        cond: NodeId,
        then_expr: NodeId,
        else_expr: NodeId,
    },
    Call {
        name: &'s str,
        args: Vec<NodeId>,
    },
    /// Conversion to the node's own type; inserted by the analyzer for
    /// implicit widening/broadcast and for constructor casts like
    /// `int(x)`.
    Cast {
        expr: NodeId,
    },
    Swizzle {
        base: NodeId,
        mask: SwizzleMask,
    },
    Member {
        base: NodeId,
        name: &'s str,
    },
    Index {
        base: NodeId,
        index: NodeId,
    },

    // Resolved forms, produced by the analyzer from `Ident`/`Member`.
    /// Reference to a local variable or parameter slot.
    VarRef {
        var: u32,
    },
    /// Reference to an argument object (one layout slot).
    ObjectRef {
        slot: u32,
    },
    /// Reference to a layout member: argument slot + byte offset.
    MemberRef {
        slot: u32,
        offset: i32,
    },
}

#[derive(Debug, Clone)]
pub struct Node<'s> {
    pub kind: NodeKind<'s>,
    pub pos: u32,
    pub ty: TypeInfo,
}

/// The tree itself: an append-only store of nodes plus the root id.
#[derive(Debug)]
pub struct Ast<'s> {
    nodes: Vec<Node<'s>>,
    pub root: NodeId,
}

impl<'s> Ast<'s> {
    pub fn new() -> Ast<'s> {
        Ast { nodes: Vec::new(), root: NodeId(0) }
    }

    pub fn add(&mut self, kind: NodeKind<'s>, pos: u32) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { kind, pos, ty: TypeInfo::VOID });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node<'s> {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node<'s> {
        &mut self.nodes[id.index()]
    }

    pub fn ty(&self, id: NodeId) -> TypeInfo {
        self.nodes[id.index()].ty
    }

    pub fn set_ty(&mut self, id: NodeId, ty: TypeInfo) {
        self.nodes[id.index()].ty = ty;
    }

    pub fn pos(&self, id: NodeId) -> u32 {
        self.nodes[id.index()].pos
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Renders the tree as indented text, one node per line with its
    /// resolved type. This is the payload of the `AstInitial`/`AstFinal`
    /// debug messages.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_node(self.root, 0, &mut out);
        out
    }

    fn dump_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let node = self.node(id);
        for _ in 0..depth {
            out.push_str("  ");
        }
        let ty = node.ty;
        let show_ty = !ty.is_void();
        match &node.kind {
            NodeKind::Program { decls } => {
                out.push_str("Program\n");
                for &d in decls {
                    self.dump_node(d, depth + 1, out);
                }
            }
            NodeKind::Function { name, ret, params, body } => {
                let _ = write!(out, "Function {name}(");
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{} {}", p.ty, p.name);
                }
                let _ = writeln!(out, ") -> {ret}");
                self.dump_node(*body, depth + 1, out);
            }
            NodeKind::Block { stmts } => {
                out.push_str("Block\n");
                for &s in stmts {
                    self.dump_node(s, depth + 1, out);
                }
            }
            NodeKind::VarDecl { is_const, decls } => {
                let _ = writeln!(out, "VarDecl{}", if *is_const { " const" } else { "" });
                for entry in decls {
                    for _ in 0..depth + 1 {
                        out.push_str("  ");
                    }
                    let _ = writeln!(out, "{} {}", entry.ty, entry.name);
                    if let Some(init) = entry.init {
                        self.dump_node(init, depth + 2, out);
                    }
                }
            }
            NodeKind::If { cond, then_stmt, else_stmt } => {
                out.push_str("If\n");
                self.dump_node(*cond, depth + 1, out);
                self.dump_node(*then_stmt, depth + 1, out);
                if let Some(e) = else_stmt {
                    self.dump_node(*e, depth + 1, out);
                }
            }
            NodeKind::For { init, cond, step, body } => {
                out.push_str("For\n");
                for part in [init, cond, step].into_iter().flatten() {
                    self.dump_node(*part, depth + 1, out);
                }
                self.dump_node(*body, depth + 1, out);
            }
            NodeKind::While { cond, body } => {
                out.push_str("While\n");
                self.dump_node(*cond, depth + 1, out);
                self.dump_node(*body, depth + 1, out);
            }
            NodeKind::DoWhile { body, cond } => {
                out.push_str("DoWhile\n");
                self.dump_node(*body, depth + 1, out);
                self.dump_node(*cond, depth + 1, out);
            }
            NodeKind::Break => out.push_str("Break\n"),
            NodeKind::Continue => out.push_str("Continue\n"),
            NodeKind::Return { value } => {
                out.push_str("Return\n");
                if let Some(v) = value {
                    self.dump_node(*v, depth + 1, out);
                }
            }
            NodeKind::ExprStmt { expr } => {
                out.push_str("ExprStmt\n");
                self.dump_node(*expr, depth + 1, out);
            }
            NodeKind::Literal { value } => {
                let _ = match value {
                    LitValue::Bool(v) => write!(out, "Literal {v}"),
                    LitValue::Int(v) => write!(out, "Literal {v}"),
                    LitValue::Float(v) => write!(out, "Literal {v:?}"),
                    LitValue::Double(v) => write!(out, "Literal {v:?}"),
                    LitValue::Str(v) => write!(out, "Literal {v:?}"),
                    LitValue::Vector(v) => {
                        let _ = write!(out, "Literal <");
                        for lane in 0..v.lanes as usize {
                            if lane > 0 {
                                out.push_str(", ");
                            }
                            let _ = write!(out, "{}", v.lane_f64(lane));
                        }
                        write!(out, ">")
                    }
                };
                self.finish_expr_line(show_ty, ty, out);
            }
            NodeKind::Ident { name } => {
                let _ = write!(out, "Ident {name}");
                self.finish_expr_line(show_ty, ty, out);
            }
            NodeKind::Unary { op, expr } => {
                let _ = write!(out, "Unary[{}]", op.symbol());
                self.finish_expr_line(show_ty, ty, out);
                self.dump_node(*expr, depth + 1, out);
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let _ = write!(out, "Binary[{}]", op.symbol());
                self.finish_expr_line(show_ty, ty, out);
                self.dump_node(*lhs, depth + 1, out);
                self.dump_node(*rhs, depth + 1, out);
            }
            NodeKind::Ternary { cond, then_expr, else_expr } => {
                out.push_str("Ternary");
                self.finish_expr_line(show_ty, ty, out);
                self.dump_node(*cond, depth + 1, out);
                self.dump_node(*then_expr, depth + 1, out);
                self.dump_node(*else_expr, depth + 1, out);
            }
            NodeKind::Call { name, args } => {
                let _ = write!(out, "Call {name}");
                self.finish_expr_line(show_ty, ty, out);
                for &a in args {
                    self.dump_node(a, depth + 1, out);
                }
            }
            NodeKind::Cast { expr } => {
                out.push_str("Cast");
                self.finish_expr_line(show_ty, ty, out);
                self.dump_node(*expr, depth + 1, out);
            }
            NodeKind::Swizzle { base, mask } => {
                let _ = write!(out, "Swizzle .{mask}");
                self.finish_expr_line(show_ty, ty, out);
                self.dump_node(*base, depth + 1, out);
            }
            NodeKind::Member { base, name } => {
                let _ = write!(out, "Member .{name}");
                self.finish_expr_line(show_ty, ty, out);
                self.dump_node(*base, depth + 1, out);
            }
            NodeKind::Index { base, index } => {
                out.push_str("Index");
                self.finish_expr_line(show_ty, ty, out);
                self.dump_node(*base, depth + 1, out);
                self.dump_node(*index, depth + 1, out);
            }
            NodeKind::VarRef { var } => {
                let _ = write!(out, "VarRef #{var}");
                self.finish_expr_line(show_ty, ty, out);
            }
            NodeKind::ObjectRef { slot } => {
                let _ = write!(out, "ObjectRef slot{slot}");
                self.finish_expr_line(show_ty, ty, out);
            }
            NodeKind::MemberRef { slot, offset } => {
                let _ = write!(out, "MemberRef slot{slot}+{offset}");
                self.finish_expr_line(show_ty, ty, out);
            }
        }
    }

    fn finish_expr_line(&self, show_ty: bool, ty: TypeInfo, out: &mut String) {
        if show_ty {
            let _ = write!(out, " : {ty}");
        }
        out.push('\n');
    }
}

impl<'s> Default for Ast<'s> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swizzle_parsing() {
        let m = SwizzleMask::parse("wzyx").unwrap();
        assert_eq!(m.len, 4);
        assert_eq!(m.idx, [3, 2, 1, 0]);
        assert!(!m.has_duplicates());

        let m = SwizzleMask::parse("rgb").unwrap();
        assert_eq!(m.idx[..3], [0, 1, 2]);

        let m = SwizzleMask::parse("st").unwrap();
        assert_eq!(m.idx[..2], [0, 1]);

        let m = SwizzleMask::parse("xx").unwrap();
        assert!(m.has_duplicates());
        assert_eq!(m.max_lane(), 0);

        // Mixed alphabets are not a swizzle.
        assert!(SwizzleMask::parse("xg").is_none());
        assert!(SwizzleMask::parse("xyzwx").is_none());
        assert!(SwizzleMask::parse("result").is_none());
    }

    #[test]
    fn node_store_round_trip() {
        let mut ast = Ast::new();
        let lit = ast.add(
            NodeKind::Literal { value: LitValue::Int(7) },
            3,
        );
        ast.set_ty(lit, TypeInfo::INT);
        assert_eq!(ast.pos(lit), 3);
        assert_eq!(ast.ty(lit), TypeInfo::INT);
        assert!(matches!(
            ast.node(lit).kind,
            NodeKind::Literal { value: LitValue::Int(7) }
        ));
    }

    #[test]
    fn dump_is_indented() {
        let mut ast = Ast::new();
        let one = ast.add(NodeKind::Literal { value: LitValue::Float(1.0) }, 0);
        let two = ast.add(NodeKind::Literal { value: LitValue::Float(2.0) }, 4);
        let add = ast.add(NodeKind::Binary { op: BinaryOp::Add, lhs: one, rhs: two }, 2);
        let ret = ast.add(NodeKind::Return { value: Some(add) }, 0);
        let block = ast.add(NodeKind::Block { stmts: vec![ret] }, 0);
        ast.root = block;

        let dump = ast.dump();
        assert!(dump.contains("Block\n  Return\n    Binary[+]"));
    }
}
