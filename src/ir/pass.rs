//! Machine-independent IR pass.
//!
//! One linearization + legalization pass over a freshly lowered
//! function:
//!
//! 1. verifies every block is terminated and every instruction's operand
//!    shapes are consistent with its opcode (the backend relies on this
//!    instead of re-checking),
//! 2. drops constant-pool entries that no instruction references and
//!    remaps the surviving indices,
//! 3. numbers the instruction stream and computes per-block live-in /
//!    live-out sets plus one live range per virtual register, the
//!    allocator's input,
//! 4. validates the SSA discipline: exactly one definition per register,
//!    and every use at or after its definition in the linearized order.
//!
//! Violations are internal compiler errors; they surface as
//! [`Error::JitFailed`] and the driver logs them at position 0.

use super::{Func, Op, Term, VReg};
use crate::error::{Error, Result};
use crate::types::TypeKind;

/// Live range of one virtual register over the linearized stream, in
/// inclusive instruction positions. Dead registers keep
/// `start == end == u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: u32,
    pub end: u32,
}

impl LiveRange {
    pub const DEAD: LiveRange = LiveRange { start: u32::MAX, end: u32::MAX };

    pub fn is_dead(&self) -> bool {
        self.start == u32::MAX
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        !self.is_dead() && !other.is_dead() && self.start <= other.end && other.start <= self.end
    }
}

/// Results of the pass, consumed by the register allocator.
#[derive(Debug, PartialEq)]
pub struct PassInfo {
    /// One range per virtual register.
    pub ranges: Vec<LiveRange>,
    /// Linear position of each block's first instruction.
    pub block_start: Vec<u32>,
    /// Position one past each block's terminator.
    pub block_end: Vec<u32>,
}

impl PassInfo {
    /// The registers live at `pos`: the pre-live set of the instruction
    /// at that position.
    pub fn live_at(&self, pos: u32) -> Vec<VReg> {
        self.ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_dead() && r.start <= pos && pos <= r.end)
            .map(|(i, _)| VReg(i as u32))
            .collect()
    }
}

pub fn run(func: &mut Func) -> Result<PassInfo> {
    check_terminated(func)?;
    check_shapes(func)?;
    compact_pool(func);

    let (positions, block_start, block_end) = number(func);
    let (defs, last_use) = scan_defs_uses(func, &positions, &block_end)?;
    let (live_in, live_out) = dataflow(func);

    let nv = func.vregs.len();
    let mut ranges = vec![LiveRange::DEAD; nv];
    for v in 0..nv {
        let Some(def) = defs[v] else { continue };
        let mut start = def;
        let mut end = last_use[v].unwrap_or(def);
        for (b, _) in func.blocks.iter().enumerate() {
            if bit(&live_in[b], v) {
                start = start.min(block_start[b]);
            }
            if bit(&live_out[b], v) {
                end = end.max(block_end[b]);
            }
        }
        ranges[v] = LiveRange { start, end };
    }

    Ok(PassInfo { ranges, block_start, block_end })
}

fn check_terminated(func: &Func) -> Result<()> {
    for block in &func.blocks {
        if block.term.is_none() {
            return Err(Error::JitFailed("unterminated block"));
        }
    }
    if func.blocks.is_empty() {
        return Err(Error::JitFailed("function has no blocks"));
    }
    Ok(())
}

/// Operand-shape legality per opcode. The backend's selector assumes
/// these hold.
fn check_shapes(func: &Func) -> Result<()> {
    let info = |r: VReg| func.vreg_info(r);
    for block in &func.blocks {
        for inst in &block.insts {
            let ok = match inst.op {
                Op::Imm | Op::ConstPool | Op::LoadArg | Op::LoadVar => inst.has_dst(),
                Op::StoreArg | Op::StoreVar => inst.nsrc == 1,
                Op::Mov => info(inst.dst) == info(inst.srcs[0]),
                Op::Broadcast => {
                    info(inst.srcs[0]).is_scalar()
                        && info(inst.dst).kind == info(inst.srcs[0]).kind
                        && info(inst.dst).lanes > 1
                }
                Op::Shuffle => {
                    info(inst.dst).kind == info(inst.srcs[0]).kind
                        && info(inst.srcs[0]).lanes > 1
                }
                Op::Extract => {
                    info(inst.dst).is_scalar()
                        && (inst.a as u8) < info(inst.srcs[0]).lanes
                }
                Op::ExtractDyn => {
                    info(inst.dst).is_scalar() && info(inst.srcs[1]).is_scalar()
                }
                Op::Insert => {
                    info(inst.dst) == info(inst.srcs[0])
                        && info(inst.srcs[1]).is_scalar()
                        && (inst.a as u8) < info(inst.dst).lanes
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem | Op::Min | Op::Max
                | Op::And | Op::Or | Op::Xor => {
                    info(inst.dst) == info(inst.srcs[0]) && info(inst.dst) == info(inst.srcs[1])
                }
                Op::Neg | Op::Abs | Op::Sqrt | Op::Floor | Op::Ceil | Op::Round | Op::Trunc
                | Op::Not => info(inst.dst) == info(inst.srcs[0]),
                Op::Shl | Op::Shr => {
                    info(inst.dst) == info(inst.srcs[0]) && info(inst.srcs[1]).is_scalar()
                }
                Op::CmpEq | Op::CmpNe | Op::CmpLt | Op::CmpLe | Op::CmpGt | Op::CmpGe => {
                    info(inst.dst).kind == TypeKind::Bool
                        && info(inst.srcs[0]) == info(inst.srcs[1])
                        && info(inst.dst).lanes == info(inst.srcs[0]).lanes
                }
                Op::Select => {
                    info(inst.srcs[0]).kind == TypeKind::Bool
                        && info(inst.srcs[0]).lanes == info(inst.dst).lanes
                        && info(inst.dst) == info(inst.srcs[1])
                        && info(inst.dst) == info(inst.srcs[2])
                }
                Op::Cast => {
                    let (d, s) = (info(inst.dst), info(inst.srcs[0]));
                    d.lanes == s.lanes && d.kind != s.kind
                }
                Op::HSum => info(inst.dst).is_scalar() && info(inst.srcs[0]).lanes > 1,
            };
            if !ok {
                log::debug!("shape check failed on {:?}", inst.op);
                return Err(Error::JitFailed("malformed instruction operands"));
            }
        }
    }
    Ok(())
}

/// Drops pool entries nothing references; remaps indices in place.
fn compact_pool(func: &mut Func) {
    let mut used = vec![false; func.pool.len()];
    for block in &func.blocks {
        for inst in &block.insts {
            if inst.op == Op::ConstPool {
                used[inst.a as usize] = true;
            }
        }
    }
    if used.iter().all(|&u| u) {
        return;
    }
    let remap = func.pool.compact(&used);
    for block in &mut func.blocks {
        for inst in &mut block.insts {
            if inst.op == Op::ConstPool {
                inst.a = remap[inst.a as usize];
            }
        }
    }
}

/// Assigns linear positions: instructions get consecutive numbers, each
/// terminator takes the position after its block's last instruction.
fn number(func: &Func) -> (Vec<Vec<u32>>, Vec<u32>, Vec<u32>) {
    let mut positions = Vec::with_capacity(func.blocks.len());
    let mut block_start = Vec::with_capacity(func.blocks.len());
    let mut block_end = Vec::with_capacity(func.blocks.len());
    let mut pos = 0u32;
    for block in &func.blocks {
        block_start.push(pos);
        let mut inst_pos = Vec::with_capacity(block.insts.len());
        for _ in &block.insts {
            inst_pos.push(pos);
            pos += 1;
        }
        positions.push(inst_pos);
        block_end.push(pos); // terminator position
        pos += 1;
    }
    (positions, block_start, block_end)
}

type DefUse = (Vec<Option<u32>>, Vec<Option<u32>>);

/// Records definition and last-use positions, enforcing SSA: single
/// definition, all uses at or after it.
fn scan_defs_uses(func: &Func, positions: &[Vec<u32>], block_end: &[u32]) -> Result<DefUse> {
    let nv = func.vregs.len();
    let mut defs: Vec<Option<u32>> = vec![None; nv];
    let mut last_use: Vec<Option<u32>> = vec![None; nv];

    let use_at = |defs: &[Option<u32>], last_use: &mut [Option<u32>], reg: VReg, pos: u32| {
        let v = reg.index();
        match defs[v] {
            Some(def) if def <= pos => {
                last_use[v] = Some(last_use[v].map_or(pos, |p: u32| p.max(pos)));
                Ok(())
            }
            _ => Err(Error::JitFailed("use without dominating definition")),
        }
    };

    for (b, block) in func.blocks.iter().enumerate() {
        for (i, inst) in block.insts.iter().enumerate() {
            let pos = positions[b][i];
            for &src in inst.sources() {
                use_at(&defs, &mut last_use, src, pos)?;
            }
            if inst.has_dst() {
                let v = inst.dst.index();
                if defs[v].is_some() {
                    return Err(Error::JitFailed("virtual register redefined"));
                }
                defs[v] = Some(pos);
            }
        }
        if let Some(Term::Branch { cond, .. }) = block.term {
            use_at(&defs, &mut last_use, cond, block_end[b])?;
        }
    }
    Ok((defs, last_use))
}

fn words(nv: usize) -> usize {
    nv.div_ceil(64)
}

fn bit(set: &[u64], v: usize) -> bool {
    set[v / 64] & (1 << (v % 64)) != 0
}

fn set_bit(set: &mut [u64], v: usize) {
    set[v / 64] |= 1 << (v % 64);
}

/// Backward iterative live-variable analysis over the CFG.
fn dataflow(func: &Func) -> (Vec<Vec<u64>>, Vec<Vec<u64>>) {
    let nb = func.blocks.len();
    let nv = func.vregs.len();
    let nw = words(nv);

    // Per-block upward-exposed uses and defs.
    let mut gen = vec![vec![0u64; nw]; nb];
    let mut kill = vec![vec![0u64; nw]; nb];
    for (b, block) in func.blocks.iter().enumerate() {
        for inst in &block.insts {
            for &src in inst.sources() {
                if !bit(&kill[b], src.index()) {
                    set_bit(&mut gen[b], src.index());
                }
            }
            if inst.has_dst() {
                set_bit(&mut kill[b], inst.dst.index());
            }
        }
        if let Some(Term::Branch { cond, .. }) = block.term {
            if !bit(&kill[b], cond.index()) {
                set_bit(&mut gen[b], cond.index());
            }
        }
    }

    let mut live_in = vec![vec![0u64; nw]; nb];
    let mut live_out = vec![vec![0u64; nw]; nb];
    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..nb).rev() {
            let mut out = vec![0u64; nw];
            if let Some(term) = &func.blocks[b].term {
                for succ in term.successors() {
                    for w in 0..nw {
                        out[w] |= live_in[succ.index()][w];
                    }
                }
            }
            let mut inn = vec![0u64; nw];
            for w in 0..nw {
                inn[w] = gen[b][w] | (out[w] & !kill[b][w]);
            }
            if out != live_out[b] || inn != live_in[b] {
                changed = true;
                live_out[b] = out;
                live_in[b] = inn;
            }
        }
    }
    (live_in, live_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Inst, Term, VRegInfo};
    use crate::types::TypeKind;

    fn f32_info() -> VRegInfo {
        VRegInfo::scalar(TypeKind::Float)
    }

    #[test]
    fn straight_line_ranges() {
        let mut func = Func::new(1);
        let b0 = func.new_block();
        let a = func.new_vreg(f32_info());
        let b = func.new_vreg(f32_info());
        let c = func.new_vreg(f32_info());
        func.push(b0, Inst::new(Op::Imm, a, &[]).with_imm(0));
        func.push(b0, Inst::new(Op::Imm, b, &[]).with_imm(0));
        func.push(b0, Inst::new(Op::Add, c, &[a, b]));
        func.push(b0, Inst::new(Op::StoreArg, VReg::NONE, &[c]).with_a(0));
        func.seal(b0, Term::Ret);

        let info = run(&mut func).unwrap();
        assert_eq!(info.ranges[a.index()], LiveRange { start: 0, end: 2 });
        assert_eq!(info.ranges[b.index()], LiveRange { start: 1, end: 2 });
        assert_eq!(info.ranges[c.index()], LiveRange { start: 2, end: 3 });
        assert!(info.ranges[a.index()].overlaps(&info.ranges[b.index()]));

        let live = info.live_at(2);
        assert!(live.contains(&a) && live.contains(&b) && live.contains(&c));
    }

    #[test]
    fn value_live_through_loop_blocks() {
        // a defined in b0, used in b1 (placed before the loop blocks in
        // linear order), while b2 loops on itself via a branch. The range
        // of a value live across the loop must cover the loop body.
        let mut func = Func::new(1);
        let b0 = func.new_block();
        let b1 = func.new_block();
        let b2 = func.new_block();
        let a = func.new_vreg(f32_info());
        let cond = func.new_vreg(VRegInfo::scalar(TypeKind::Bool));

        func.push(b0, Inst::new(Op::Imm, a, &[]).with_imm(0));
        func.seal(b0, Term::Jump(b2));

        func.push(b1, Inst::new(Op::StoreArg, VReg::NONE, &[a]).with_a(0));
        func.seal(b1, Term::Ret);

        func.push(b2, Inst::new(Op::Imm, cond, &[]).with_imm(1));
        func.seal(b2, Term::Branch { cond, then_block: b2, else_block: b1 });

        let info = run(&mut func).unwrap();
        let range = info.ranges[a.index()];
        // The store in b1 is position 1; the loop block ends at 4. The
        // range must reach the loop's end because a is live-out there.
        assert_eq!(range.start, 0);
        assert!(range.end >= info.block_end[2] - 1);
    }

    #[test]
    fn rejects_use_before_def() {
        let mut func = Func::new(1);
        let b0 = func.new_block();
        let a = func.new_vreg(f32_info());
        let b = func.new_vreg(f32_info());
        func.push(b0, Inst::new(Op::Mov, b, &[a])); // a never defined
        func.seal(b0, Term::Ret);
        assert_eq!(
            run(&mut func),
            Err(Error::JitFailed("use without dominating definition"))
        );
    }

    #[test]
    fn rejects_redefinition() {
        let mut func = Func::new(1);
        let b0 = func.new_block();
        let a = func.new_vreg(f32_info());
        func.push(b0, Inst::new(Op::Imm, a, &[]).with_imm(0));
        func.push(b0, Inst::new(Op::Imm, a, &[]).with_imm(1));
        func.seal(b0, Term::Ret);
        assert_eq!(run(&mut func), Err(Error::JitFailed("virtual register redefined")));
    }

    #[test]
    fn rejects_unterminated_blocks() {
        let mut func = Func::new(1);
        func.new_block();
        assert_eq!(run(&mut func), Err(Error::JitFailed("unterminated block")));
    }

    #[test]
    fn compacts_unused_pool_entries() {
        let mut func = Func::new(1);
        let b0 = func.new_block();
        let mut bytes_a = [0u8; 32];
        bytes_a[0] = 0xaa;
        let mut bytes_b = [0u8; 32];
        bytes_b[0] = 0xbb;
        let _unused = func.pool.intern(bytes_a);
        let used = func.pool.intern(bytes_b);

        let v = func.new_vreg(VRegInfo { kind: TypeKind::Float, lanes: 4 });
        func.push(b0, Inst::new(Op::ConstPool, v, &[]).with_a(used));
        func.push(b0, Inst::new(Op::StoreArg, VReg::NONE, &[v]).with_a(0));
        func.seal(b0, Term::Ret);

        run(&mut func).unwrap();
        assert_eq!(func.pool.len(), 1);
        assert_eq!(func.pool.entry(0)[0], 0xbb);
        let inst = &func.blocks[0].insts[0];
        assert_eq!(inst.a, 0);
    }

    #[test]
    fn shape_check_rejects_mixed_lanes() {
        let mut func = Func::new(1);
        let b0 = func.new_block();
        let v4 = func.new_vreg(VRegInfo { kind: TypeKind::Float, lanes: 4 });
        let v2 = func.new_vreg(VRegInfo { kind: TypeKind::Float, lanes: 2 });
        let dst = func.new_vreg(VRegInfo { kind: TypeKind::Float, lanes: 4 });
        func.push(b0, Inst::new(Op::ConstPool, v4, &[]).with_a(0));
        func.push(b0, Inst::new(Op::ConstPool, v2, &[]).with_a(0));
        func.push(b0, Inst::new(Op::Add, dst, &[v4, v2]));
        func.seal(b0, Term::Ret);
        func.pool.intern([0u8; 32]);
        assert_eq!(run(&mut func), Err(Error::JitFailed("malformed instruction operands")));
    }
}
