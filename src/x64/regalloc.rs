//! Virtual-to-physical register allocation.
//!
//! Linear scan over the live ranges computed by the IR pass. Two banks:
//! bank 0 holds general-purpose registers (scalar ints and bools), bank
//! 1 the XMM registers (floats and all vectors). A handful of registers
//! per bank stay reserved as selector scratch: they carry spill reloads
//! and the fixed-register sequences (idiv's rax/rdx, shift counts in cl,
//! blendv's xmm0), so allocation itself never has to honor per-opcode
//! constraints. 256-bit values occupy two XMM parts that are assigned
//! (or spilled) together.

use crate::ir::pass::LiveRange;
use crate::ir::{Func, VReg};
use crate::types::TypeKind;

/// Maximum number of register banks supported (GP, XMM).
pub const MAX_REGISTER_BANKS: usize = 2;

pub type RegBank = u8;
pub type RegId = u8;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: RegId) -> Self {
        Self { bank: 0, id }
    }

    pub const fn xmm(id: RegId) -> Self {
        Self { bank: 1, id }
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Default)]
pub struct RegBitSet {
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        self.banks[reg.bank as usize] |= 1u64 << reg.id;
    }

    pub fn clear(&mut self, reg: AsmReg) {
        self.banks[reg.bank as usize] &= !(1u64 << reg.id);
    }

    pub fn find_first_in_bank(&self, bank: RegBank) -> Option<RegId> {
        let bits = self.banks[bank as usize];
        if bits == 0 {
            None
        } else {
            Some(bits.trailing_zeros() as RegId)
        }
    }

    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        self.banks[bank as usize].count_ones()
    }
}

/// Where one 128-bit part of a value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Reg(AsmReg),
    /// Index of a 16-byte spill slot in the frame's spill area.
    Spill(u32),
    None,
}

/// Location of a whole value (one or two parts).
#[derive(Debug, Clone, Copy)]
pub struct ValueLoc {
    pub parts: [Location; 2],
}

impl ValueLoc {
    pub const UNASSIGNED: ValueLoc = ValueLoc { parts: [Location::None; 2] };

    pub fn part(&self, part: u32) -> Location {
        self.parts[part as usize]
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.parts[0], Location::Spill(_))
    }
}

/// Allocation result: one location per virtual register plus the number
/// of 16-byte spill slots the frame must reserve.
#[derive(Debug)]
pub struct Allocation {
    pub locs: Vec<ValueLoc>,
    pub spill_slots: u32,
}

/// General-purpose registers handed to the allocator. RAX and R11 stay
/// scratch; RSP/RBP are the frame; RBX and R12–R15 are callee-saved and
/// left untouched so the prologue stays minimal.
pub const GP_ALLOCATABLE: [RegId; 7] = [1, 2, 6, 7, 8, 9, 10];

/// XMM registers handed to the allocator; XMM0, XMM14 and XMM15 stay
/// scratch.
pub const XMM_ALLOCATABLE: [RegId; 13] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];

/// Register bank a value is allocated in.
pub fn bank_of(func: &Func, reg: VReg) -> RegBank {
    let info = func.vreg_info(reg);
    if info.is_scalar() && matches!(info.kind, TypeKind::Int | TypeKind::Bool) {
        0
    } else {
        1
    }
}

pub struct LinearScan<'a> {
    func: &'a Func,
    ranges: &'a [LiveRange],
    free: RegBitSet,
    /// Active intervals: (end position, vreg).
    active: Vec<(u32, VReg)>,
    locs: Vec<ValueLoc>,
    spill_slots: u32,
}

impl<'a> LinearScan<'a> {
    pub fn new(func: &'a Func, ranges: &'a [LiveRange]) -> Self {
        let mut free = RegBitSet::new();
        for id in GP_ALLOCATABLE {
            free.set(AsmReg::gp(id));
        }
        for id in XMM_ALLOCATABLE {
            free.set(AsmReg::xmm(id));
        }
        Self {
            func,
            ranges,
            free,
            active: Vec::new(),
            locs: vec![ValueLoc::UNASSIGNED; func.vregs.len()],
            spill_slots: 0,
        }
    }

    pub fn run(mut self) -> Allocation {
        let mut order: Vec<usize> = (0..self.ranges.len())
            .filter(|&v| !self.ranges[v].is_dead())
            .collect();
        order.sort_by_key(|&v| (self.ranges[v].start, v));

        for v in order {
            let reg = VReg(v as u32);
            let range = self.ranges[v];
            self.expire(range.start);

            let bank = bank_of(self.func, reg);
            let parts = self.func.vreg_info(reg).parts();

            if self.free.count_in_bank(bank) < parts {
                self.evict(bank, parts, range.end);
            }
            if self.free.count_in_bank(bank) < parts {
                self.spill(reg, parts);
                continue;
            }

            let mut loc = ValueLoc::UNASSIGNED;
            for part in 0..parts {
                let id = self.free.find_first_in_bank(bank).unwrap();
                let r = AsmReg::new(bank, id);
                self.free.clear(r);
                loc.parts[part as usize] = Location::Reg(r);
            }
            self.locs[v] = loc;
            self.active.push((range.end, reg));
        }

        Allocation { locs: self.locs, spill_slots: self.spill_slots }
    }

    /// Frees registers of intervals that ended before `pos`.
    fn expire(&mut self, pos: u32) {
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].0 < pos {
                let (_, reg) = self.active.swap_remove(i);
                self.release(reg);
            } else {
                i += 1;
            }
        }
    }

    fn release(&mut self, reg: VReg) {
        for part in self.locs[reg.index()].parts {
            if let Location::Reg(r) = part {
                self.free.set(r);
            }
        }
    }

    /// Spills active intervals ending after `end` (furthest end first)
    /// until `needed` registers are free in `bank` or no candidate is
    /// left. Spilling long ranges keeps short ones in registers.
    fn evict(&mut self, bank: RegBank, needed: u32, end: u32) {
        while self.free.count_in_bank(bank) < needed {
            let mut candidate: Option<usize> = None;
            for (i, &(active_end, reg)) in self.active.iter().enumerate() {
                if bank_of(self.func, reg) != bank || active_end <= end {
                    continue;
                }
                match candidate {
                    Some(c) if self.active[c].0 >= active_end => {}
                    _ => candidate = Some(i),
                }
            }
            let Some(i) = candidate else { return };
            let (_, victim) = self.active.swap_remove(i);
            self.release(victim);
            let parts = self.func.vreg_info(victim).parts();
            self.spill(victim, parts);
        }
    }

    fn spill(&mut self, reg: VReg, parts: u32) {
        let mut loc = ValueLoc::UNASSIGNED;
        for part in 0..parts {
            loc.parts[part as usize] = Location::Spill(self.spill_slots);
            self.spill_slots += 1;
        }
        self.locs[reg.index()] = loc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Inst, Op, Term, VRegInfo};
    use crate::types::TypeKind;

    fn func_with_vregs(infos: &[VRegInfo]) -> Func {
        let mut func = Func::new(1);
        let b0 = func.new_block();
        for &info in infos {
            let v = func.new_vreg(info);
            func.push(b0, Inst::new(Op::Imm, v, &[]).with_imm(0));
        }
        func.seal(b0, Term::Ret);
        func
    }

    #[test]
    fn disjoint_ranges_share_registers() {
        let info = VRegInfo::scalar(TypeKind::Float);
        let func = func_with_vregs(&[info, info]);
        let ranges = vec![
            LiveRange { start: 0, end: 1 },
            LiveRange { start: 2, end: 3 },
        ];
        let alloc = LinearScan::new(&func, &ranges).run();
        let r0 = alloc.locs[0].part(0);
        let r1 = alloc.locs[1].part(0);
        assert_eq!(r0, r1); // second reuses the expired register
        assert_eq!(alloc.spill_slots, 0);
    }

    #[test]
    fn pressure_forces_spill() {
        let info = VRegInfo::scalar(TypeKind::Float);
        let n = XMM_ALLOCATABLE.len() + 2;
        let infos = vec![info; n];
        let func = func_with_vregs(&infos);
        // All overlap.
        let ranges: Vec<_> = (0..n)
            .map(|i| LiveRange { start: i as u32, end: 100 + i as u32 })
            .collect();
        let alloc = LinearScan::new(&func, &ranges).run();
        let spilled = alloc.locs.iter().filter(|l| l.is_spilled()).count();
        assert_eq!(spilled, 2);
        assert!(alloc.spill_slots >= 2);
    }

    #[test]
    fn gp_and_xmm_use_separate_banks() {
        let func = func_with_vregs(&[
            VRegInfo::scalar(TypeKind::Int),
            VRegInfo::scalar(TypeKind::Float),
        ]);
        let ranges = vec![
            LiveRange { start: 0, end: 10 },
            LiveRange { start: 1, end: 10 },
        ];
        let alloc = LinearScan::new(&func, &ranges).run();
        match (alloc.locs[0].part(0), alloc.locs[1].part(0)) {
            (Location::Reg(a), Location::Reg(b)) => {
                assert_eq!(a.bank, 0);
                assert_eq!(b.bank, 1);
            }
            other => panic!("expected registers, got {other:?}"),
        }
    }

    #[test]
    fn two_part_values_get_two_registers() {
        let func = func_with_vregs(&[VRegInfo { kind: TypeKind::Double, lanes: 4 }]);
        let ranges = vec![LiveRange { start: 0, end: 5 }];
        let alloc = LinearScan::new(&func, &ranges).run();
        match (alloc.locs[0].part(0), alloc.locs[0].part(1)) {
            (Location::Reg(a), Location::Reg(b)) => {
                assert_ne!(a, b);
                assert_eq!(a.bank, 1);
                assert_eq!(b.bank, 1);
            }
            other => panic!("expected two registers, got {other:?}"),
        }
    }

    #[test]
    fn eviction_prefers_furthest_end() {
        let info = VRegInfo::scalar(TypeKind::Float);
        let n = XMM_ALLOCATABLE.len() + 1;
        let mut infos = vec![info; n];
        infos[0] = info;
        let func = func_with_vregs(&infos);
        let mut ranges: Vec<_> = (0..n)
            .map(|i| LiveRange { start: i as u32, end: 50 })
            .collect();
        // The first interval lives far longer than everyone else; it is
        // the one that must end up in memory.
        ranges[0] = LiveRange { start: 0, end: 1000 };
        let alloc = LinearScan::new(&func, &ranges).run();
        assert!(alloc.locs[0].is_spilled());
        assert!(alloc.locs[1..].iter().all(|l| !l.is_spilled()));
    }
}
