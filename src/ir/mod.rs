//! Typed SSA-style intermediate representation.
//!
//! A function is a linear list of basic blocks; each block is an ordered
//! instruction sequence plus one terminator, so blocks form a CFG by
//! terminator alone. Values are virtual registers with a fixed semantic
//! element kind and lane count, from which the register width class
//! derives. Mutable program variables round-trip through typed variable
//! slots (`LoadVar`/`StoreVar`), which keeps every virtual register
//! single-definition without phi nodes. Vector constants too wide to
//! embed in an instruction live in the function's constant pool.

pub mod lower;
pub mod pass;

use crate::types::{TypeKind, WidthClass};
use std::collections::HashMap;
use std::fmt::Write as _;

/// A virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

impl VReg {
    pub const NONE: VReg = VReg(u32::MAX);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_none(self) -> bool {
        self == VReg::NONE
    }
}

/// A basic block handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Semantic type of a virtual register: element kind and lane count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VRegInfo {
    pub kind: TypeKind,
    pub lanes: u8,
}

impl VRegInfo {
    pub fn scalar(kind: TypeKind) -> VRegInfo {
        VRegInfo { kind, lanes: 1 }
    }

    pub fn width(self) -> WidthClass {
        let bits = self.elem_bytes() * 8 * self.lanes as u32;
        match bits {
            0..=32 => WidthClass::B32,
            33..=64 => WidthClass::B64,
            65..=128 => WidthClass::B128,
            _ => WidthClass::B256,
        }
    }

    pub fn elem_bytes(self) -> u32 {
        match self.kind {
            TypeKind::Double => 8,
            _ => 4,
        }
    }

    /// Number of 128-bit register parts the value occupies.
    pub fn parts(self) -> u32 {
        self.width().parts()
    }

    pub fn is_scalar(self) -> bool {
        self.lanes == 1
    }

    pub fn is_float(self) -> bool {
        matches!(self.kind, TypeKind::Float | TypeKind::Double)
    }

    fn short_name(self) -> String {
        let base = match self.kind {
            TypeKind::Bool => "b",
            TypeKind::Int => "i32",
            TypeKind::Float => "f32",
            TypeKind::Double => "f64",
            _ => "?",
        };
        if self.lanes > 1 {
            format!("{base}x{}", self.lanes)
        } else {
            base.to_string()
        }
    }
}

/// Instruction opcodes. Operand meaning is positional: `srcs[0..nsrc]`,
/// with slot/lane/mask/pool payload in `a` and immediates in `imm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// dst = immediate scalar (`imm` holds the raw bits).
    Imm,
    /// dst = constant pool entry `a`.
    ConstPool,
    /// dst = src0.
    Mov,
    /// dst = src0 scalar splat into every lane.
    Broadcast,
    /// dst.lane\[i\] = src0.lane\[(a >> 2i) & 3\].
    Shuffle,
    /// dst scalar = src0.lane\[a\].
    Extract,
    /// dst scalar = src0.lane\[src1\] (dynamic index, masked by lanes).
    ExtractDyn,
    /// dst = src0 with lane `a` replaced by scalar src1.
    Insert,
    /// dst = typed load from argument record `a` at byte offset `imm`.
    LoadArg,
    /// typed store of src0 to argument record `a` at byte offset `imm`.
    StoreArg,
    /// dst = variable slot `a`.
    LoadVar,
    /// variable slot `a` = src0.
    StoreVar,

    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Abs,
    Min,
    Max,
    Sqrt,
    Floor,
    Ceil,
    Round,
    Trunc,

    And,
    Or,
    Xor,
    Not,
    /// dst = src0 << src1 (scalar count).
    Shl,
    /// dst = src0 >> src1 (arithmetic, scalar count).
    Shr,

    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,

    /// dst = src0(mask) ? src1 : src2, lane-wise.
    Select,
    /// dst = src0 converted between element kinds (and broadcast when
    /// dst has more lanes than src).
    Cast,
    /// dst scalar = horizontal sum of src0's lanes.
    HSum,
}

impl Op {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Imm => "imm",
            Op::ConstPool => "const",
            Op::Mov => "mov",
            Op::Broadcast => "bcast",
            Op::Shuffle => "shuf",
            Op::Extract => "extract",
            Op::ExtractDyn => "extract.d",
            Op::Insert => "insert",
            Op::LoadArg => "load.arg",
            Op::StoreArg => "store.arg",
            Op::LoadVar => "load.var",
            Op::StoreVar => "store.var",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Rem => "rem",
            Op::Neg => "neg",
            Op::Abs => "abs",
            Op::Min => "min",
            Op::Max => "max",
            Op::Sqrt => "sqrt",
            Op::Floor => "floor",
            Op::Ceil => "ceil",
            Op::Round => "round",
            Op::Trunc => "trunc",
            Op::And => "and",
            Op::Or => "or",
            Op::Xor => "xor",
            Op::Not => "not",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::CmpEq => "cmp.eq",
            Op::CmpNe => "cmp.ne",
            Op::CmpLt => "cmp.lt",
            Op::CmpLe => "cmp.le",
            Op::CmpGt => "cmp.gt",
            Op::CmpGe => "cmp.ge",
            Op::Select => "select",
            Op::Cast => "cast",
            Op::HSum => "hsum",
        }
    }
}

/// One three-address instruction.
#[derive(Debug, Clone, Copy)]
pub struct Inst {
    pub op: Op,
    pub dst: VReg,
    pub srcs: [VReg; 3],
    pub nsrc: u8,
    /// Slot index, pool index, lane number or packed shuffle mask,
    /// depending on the opcode.
    pub a: u32,
    /// Immediate bits or byte offset, depending on the opcode.
    pub imm: i64,
}

impl Inst {
    pub fn new(op: Op, dst: VReg, srcs: &[VReg]) -> Inst {
        let mut s = [VReg::NONE; 3];
        s[..srcs.len()].copy_from_slice(srcs);
        Inst { op, dst, srcs: s, nsrc: srcs.len() as u8, a: 0, imm: 0 }
    }

    pub fn with_a(mut self, a: u32) -> Inst {
        self.a = a;
        self
    }

    pub fn with_imm(mut self, imm: i64) -> Inst {
        self.imm = imm;
        self
    }

    pub fn sources(&self) -> &[VReg] {
        &self.srcs[..self.nsrc as usize]
    }

    pub fn has_dst(&self) -> bool {
        !self.dst.is_none()
    }
}

/// Block terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    Jump(BlockId),
    Branch { cond: VReg, then_block: BlockId, else_block: BlockId },
    Ret,
}

impl Term {
    pub fn successors(&self) -> Vec<BlockId> {
        match *self {
            Term::Jump(b) => vec![b],
            Term::Branch { then_block, else_block, .. } => vec![then_block, else_block],
            Term::Ret => vec![],
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Block {
    pub insts: Vec<Inst>,
    pub term: Option<Term>,
}

/// Interned pool of wide constants. Entries are 32 bytes, zero-padded;
/// identical payloads share one entry.
#[derive(Debug, Default, Clone)]
pub struct ConstPool {
    entries: Vec<[u8; 32]>,
    map: HashMap<[u8; 32], u32>,
}

impl ConstPool {
    pub fn intern(&mut self, bytes: [u8; 32]) -> u32 {
        if let Some(&idx) = self.map.get(&bytes) {
            return idx;
        }
        let idx = self.entries.len() as u32;
        self.entries.push(bytes);
        self.map.insert(bytes, idx);
        idx
    }

    pub fn entry(&self, idx: u32) -> &[u8; 32] {
        &self.entries[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps only the entries named in `used` (in ascending index order),
    /// returning the old-index → new-index mapping.
    pub fn compact(&mut self, used: &[bool]) -> Vec<u32> {
        let mut remap = vec![u32::MAX; self.entries.len()];
        let mut kept = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if used.get(i).copied().unwrap_or(false) {
                remap[i] = kept.len() as u32;
                kept.push(*entry);
            }
        }
        self.entries = kept;
        self.map.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            self.map.insert(*entry, i as u32);
        }
        remap
    }
}

/// Type of one variable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSlot {
    pub kind: TypeKind,
    pub lanes: u8,
}

impl VarSlot {
    pub fn info(self) -> VRegInfo {
        VRegInfo { kind: self.kind, lanes: self.lanes }
    }
}

/// One lowered function.
#[derive(Debug, Default, Clone)]
pub struct Func {
    pub blocks: Vec<Block>,
    pub vregs: Vec<VRegInfo>,
    pub vars: Vec<VarSlot>,
    pub pool: ConstPool,
    pub num_args: u32,
}

impl Func {
    pub fn new(num_args: u32) -> Func {
        Func { num_args, ..Func::default() }
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::default());
        id
    }

    pub fn new_vreg(&mut self, info: VRegInfo) -> VReg {
        let reg = VReg(self.vregs.len() as u32);
        self.vregs.push(info);
        reg
    }

    pub fn new_var(&mut self, slot: VarSlot) -> u32 {
        let idx = self.vars.len() as u32;
        self.vars.push(slot);
        idx
    }

    pub fn vreg_info(&self, reg: VReg) -> VRegInfo {
        self.vregs[reg.index()]
    }

    pub fn push(&mut self, block: BlockId, inst: Inst) {
        debug_assert!(self.blocks[block.index()].term.is_none());
        self.blocks[block.index()].insts.push(inst);
    }

    pub fn seal(&mut self, block: BlockId, term: Term) {
        let b = &mut self.blocks[block.index()];
        if b.term.is_none() {
            b.term = Some(term);
        }
    }

    pub fn is_sealed(&self, block: BlockId) -> bool {
        self.blocks[block.index()].term.is_some()
    }

    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    /// Renders the function as text; the payload of the `IrInitial` /
    /// `IrFinal` debug messages.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "func(args={}, vars={}, pool={})",
            self.num_args,
            self.vars.len(),
            self.pool.len()
        );
        for (i, block) in self.blocks.iter().enumerate() {
            let _ = writeln!(out, "b{i}:");
            for inst in &block.insts {
                out.push_str("  ");
                if inst.has_dst() {
                    let info = self.vreg_info(inst.dst);
                    let _ = write!(out, "v{}:{} = ", inst.dst.0, info.short_name());
                }
                out.push_str(inst.op.mnemonic());
                let mut first = true;
                let mut sep = |out: &mut String| {
                    out.push_str(if first { " " } else { ", " });
                    first = false;
                };
                match inst.op {
                    Op::Imm => {
                        sep(&mut out);
                        let info = self.vreg_info(inst.dst);
                        match info.kind {
                            TypeKind::Float => {
                                let _ = write!(out, "{:?}", f32::from_bits(inst.imm as u32));
                            }
                            TypeKind::Double => {
                                let _ = write!(out, "{:?}", f64::from_bits(inst.imm as u64));
                            }
                            _ => {
                                let _ = write!(out, "{}", inst.imm);
                            }
                        }
                    }
                    Op::ConstPool => {
                        sep(&mut out);
                        let _ = write!(out, "[{}]", inst.a);
                    }
                    Op::LoadArg | Op::StoreArg => {
                        sep(&mut out);
                        let _ = write!(out, "arg{}+{}", inst.a, inst.imm);
                    }
                    Op::LoadVar | Op::StoreVar => {
                        sep(&mut out);
                        let _ = write!(out, "@{}", inst.a);
                    }
                    Op::Shuffle => {
                        sep(&mut out);
                        let _ = write!(out, "mask={:#x}", inst.a);
                    }
                    Op::Extract | Op::Insert => {
                        sep(&mut out);
                        let _ = write!(out, "lane={}", inst.a);
                    }
                    _ => {}
                }
                for src in inst.sources() {
                    sep(&mut out);
                    let _ = write!(out, "v{}", src.0);
                }
                out.push('\n');
            }
            match self.blocks[i].term {
                Some(Term::Jump(b)) => {
                    let _ = writeln!(out, "  jump b{}", b.0);
                }
                Some(Term::Branch { cond, then_block, else_block }) => {
                    let _ = writeln!(
                        out,
                        "  branch v{}, b{}, b{}",
                        cond.0, then_block.0, else_block.0
                    );
                }
                Some(Term::Ret) => {
                    let _ = writeln!(out, "  ret");
                }
                None => {
                    let _ = writeln!(out, "  <unterminated>");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_follow_kind_and_lanes() {
        assert_eq!(VRegInfo { kind: TypeKind::Int, lanes: 1 }.width(), WidthClass::B32);
        assert_eq!(VRegInfo { kind: TypeKind::Float, lanes: 2 }.width(), WidthClass::B64);
        assert_eq!(VRegInfo { kind: TypeKind::Float, lanes: 4 }.width(), WidthClass::B128);
        assert_eq!(VRegInfo { kind: TypeKind::Double, lanes: 4 }.width(), WidthClass::B256);
        assert_eq!(VRegInfo { kind: TypeKind::Double, lanes: 4 }.parts(), 2);
    }

    #[test]
    fn pool_interns_and_compacts() {
        let mut pool = ConstPool::default();
        let mut a = [0u8; 32];
        a[0] = 1;
        let mut b = [0u8; 32];
        b[0] = 2;

        let ia = pool.intern(a);
        let ib = pool.intern(b);
        assert_eq!(pool.intern(a), ia);
        assert_eq!(pool.len(), 2);

        let remap = pool.compact(&[false, true]);
        assert_eq!(remap[ia as usize], u32::MAX);
        assert_eq!(remap[ib as usize], 0);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.entry(0)[0], 2);
    }

    #[test]
    fn dump_formats_blocks() {
        let mut func = Func::new(1);
        let entry = func.new_block();
        let v0 = func.new_vreg(VRegInfo::scalar(TypeKind::Float));
        func.push(
            entry,
            Inst::new(Op::Imm, v0, &[]).with_imm(1.5f32.to_bits() as i64),
        );
        func.push(entry, Inst::new(Op::StoreArg, VReg::NONE, &[v0]).with_a(0));
        func.seal(entry, Term::Ret);

        let dump = func.dump();
        assert!(dump.contains("v0:f32 = imm 1.5"));
        assert!(dump.contains("store.arg arg0+0, v0"));
        assert!(dump.contains("  ret"));
    }
}
