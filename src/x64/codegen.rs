//! IR-to-machine-code instruction selection.
//!
//! Walks the linearized blocks and lowers each IR instruction to SSE2
//! machine code, with SSE4.1 forms (pmulld, pminsd/pmaxsd, roundps,
//! insertps/pinsrd/pextrd, blendv) when the host supports them and the
//! caller did not disable them. Operations without direct ISA support
//! are emulated: integer vector multiply via pmuludq and shuffles,
//! integer vector division by lane extraction through the stack,
//! floor/ceil/round/trunc via convert-and-correct and sign-magic
//! sequences, lane inserts via a stack round-trip, select via the
//! and/xor mask trick.
//!
//! Register discipline: allocated values live wherever the linear scan
//! put them; scratch registers (RAX, R11, XMM0, XMM14, XMM15) carry
//! spill reloads and the temporaries of multi-instruction sequences, so
//! emitted code never disturbs an allocated register it does not define.
//! Fixed ISA constraints (idiv's RAX/RDX, shift counts in CL, blendv's
//! XMM0) are satisfied inside the sequences, preserving RDX/RCX with
//! push/pop where they may carry allocated values.
//!
//! The produced function follows the SysV C ABI: one record pointer per
//! argument slot (RDI, RSI, RDX, RCX), saved to the frame in the
//! prologue. The constant pool is emitted behind the code in the same
//! allocation; `finalize` assembles at the final virtual address so
//! RIP-relative pool loads stay valid for the life of the program.

use crate::error::{Error, Result};
use crate::exec::ExecutableMemory;
use crate::ir::pass::PassInfo;
use crate::ir::{Func, Inst, Op, Term, VReg, VRegInfo};
use crate::types::TypeKind;
use crate::x64::encoder::{Cond, X64Encoder};
use crate::x64::regalloc::{AsmReg, LinearScan, Location, ValueLoc};
use iced_x86::code_asm::CodeLabel;

const RAX: AsmReg = AsmReg::gp(0);
const RCX: AsmReg = AsmReg::gp(1);
const RDX: AsmReg = AsmReg::gp(2);
const RSP: AsmReg = AsmReg::gp(4);
const RBP: AsmReg = AsmReg::gp(5);
const R11: AsmReg = AsmReg::gp(11);
const X0: AsmReg = AsmReg::xmm(0);
const X14: AsmReg = AsmReg::xmm(14);
const X15: AsmReg = AsmReg::xmm(15);

/// SysV integer argument registers, one per argument record.
const ARG_REGS: [AsmReg; 4] = [AsmReg::gp(7), AsmReg::gp(6), RDX, RCX];

/// The outcome of a successful code generation.
pub struct CompiledCode {
    pub memory: ExecutableMemory,
    pub code_len: usize,
    /// A plain copy of the emitted bytes, kept for disassembly dumps.
    pub bytes: Vec<u8>,
}

pub struct CodeGenerator<'a> {
    func: &'a Func,
    enc: X64Encoder,
    locs: Vec<ValueLoc>,
    sse41: bool,
    frame_size: i32,
    lane_buf: i32,
    var_offsets: Vec<i32>,
    spill_base: i32,
    pool_labels: Vec<[CodeLabel; 2]>,
    magic_consts: Vec<([u8; 16], CodeLabel)>,
}

impl<'a> CodeGenerator<'a> {
    /// Runs register allocation and emits the whole function, returning
    /// executable memory with the entry at offset zero.
    pub fn generate(func: &'a Func, pass: &PassInfo, sse41: bool) -> Result<CompiledCode> {
        let alloc = LinearScan::new(func, &pass.ranges).run();

        // Frame: saved argument pointers, a 32-byte lane buffer for
        // stack-based lane operations, variable slots, spill slots.
        let args_area = ((func.num_args as i32 * 8) + 15) & !15;
        let lane_buf = -(args_area + 32);
        let mut var_offsets = Vec::with_capacity(func.vars.len());
        let mut offset = args_area + 32;
        for slot in &func.vars {
            offset += slot.info().parts() as i32 * 16;
            var_offsets.push(-offset);
        }
        let spill_base = offset;
        offset += alloc.spill_slots as i32 * 16;
        let frame_size = (offset + 15) & !15;

        let mut gen = CodeGenerator {
            func,
            enc: X64Encoder::new()?,
            locs: alloc.locs,
            sse41,
            frame_size,
            lane_buf,
            var_offsets,
            spill_base,
            pool_labels: Vec::new(),
            magic_consts: Vec::new(),
        };
        for _ in 0..func.pool.len() {
            let lo = gen.enc.new_label();
            let hi = gen.enc.new_label();
            gen.pool_labels.push([lo, hi]);
        }

        gen.prologue()?;
        for (i, block) in func.blocks.iter().enumerate() {
            gen.enc.place_block_label(i)?;
            for inst in &block.insts {
                gen.inst(inst)?;
            }
            gen.term(block.term.expect("pass checked termination"))?;
        }
        gen.emit_data()?;
        gen.finish()
    }

    fn finish(mut self) -> Result<CompiledCode> {
        let data_len = self.func.pool.len() * 32 + self.magic_consts.len() * 16;
        let estimate = self.enc.instruction_count() * 16 + data_len + 64;
        let mut memory = ExecutableMemory::allocate(estimate)?;
        let bytes = self.enc.finalize(memory.addr())?;
        if bytes.len() > memory.len() {
            return Err(Error::JitFailed("code exceeds allocation"));
        }
        memory.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);
        memory.make_executable()?;
        Ok(CompiledCode { memory, code_len: bytes.len(), bytes })
    }

    fn prologue(&mut self) -> Result<()> {
        self.enc.push64(RBP)?;
        self.enc.mov64_rr(RBP, RSP)?;
        if self.frame_size > 0 {
            self.enc.sub64_ri(RSP, self.frame_size)?;
        }
        for i in 0..self.func.num_args as usize {
            self.enc.mov64_mr(RBP, -8 * (i as i32 + 1), ARG_REGS[i])?;
        }
        Ok(())
    }

    fn epilogue(&mut self) -> Result<()> {
        if self.frame_size > 0 {
            self.enc.add64_ri(RSP, self.frame_size)?;
        }
        self.enc.pop64(RBP)?;
        self.enc.ret()
    }

    fn term(&mut self, term: Term) -> Result<()> {
        match term {
            Term::Jump(block) => self.enc.jmp_block(block.index()),
            Term::Branch { cond, then_block, else_block } => {
                let c = self.take_gp(cond, RAX)?;
                self.enc.test32_rr(c, c)?;
                self.enc.jcc_block(Cond::Ne, then_block.index())?;
                self.enc.jmp_block(else_block.index())
            }
            Term::Ret => self.epilogue(),
        }
    }

    // ==== constants behind the code ====

    fn magic(&mut self, bytes: [u8; 16]) -> CodeLabel {
        if let Some((_, label)) = self.magic_consts.iter().find(|(b, _)| *b == bytes) {
            return *label;
        }
        let label = self.enc.new_label();
        self.magic_consts.push((bytes, label));
        label
    }

    fn magic_u32(&mut self, value: u32) -> CodeLabel {
        let mut bytes = [0u8; 16];
        for lane in 0..4 {
            bytes[lane * 4..lane * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        self.magic(bytes)
    }

    fn magic_u64(&mut self, value: u64) -> CodeLabel {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&value.to_le_bytes());
        bytes[8..].copy_from_slice(&value.to_le_bytes());
        self.magic(bytes)
    }

    fn emit_data(&mut self) -> Result<()> {
        for (i, labels) in self.pool_labels.clone().into_iter().enumerate() {
            let entry = *self.func.pool.entry(i as u32);
            let [mut lo, mut hi] = labels;
            self.enc.place_label(&mut lo)?;
            self.enc.db(&entry[..16])?;
            self.enc.place_label(&mut hi)?;
            self.enc.db(&entry[16..])?;
        }
        for (bytes, label) in self.magic_consts.clone() {
            let mut label = label;
            self.enc.place_label(&mut label)?;
            self.enc.db(&bytes)?;
        }
        Ok(())
    }

    // ==== value locations ====

    fn info(&self, reg: VReg) -> VRegInfo {
        self.func.vreg_info(reg)
    }

    fn spill_off(&self, slot: u32) -> i32 {
        -(self.spill_base + 16 * slot as i32 + 16)
    }

    fn loc(&self, reg: VReg) -> ValueLoc {
        self.locs[reg.index()]
    }

    /// Register holding a GP value, reloading spills into `scratch`.
    fn take_gp(&mut self, reg: VReg, scratch: AsmReg) -> Result<AsmReg> {
        match self.loc(reg).part(0) {
            Location::Reg(r) => Ok(r),
            Location::Spill(slot) => {
                self.enc.mov32_rm(scratch, RBP, self.spill_off(slot))?;
                Ok(scratch)
            }
            Location::None => Err(Error::JitFailed("unallocated value")),
        }
    }

    /// Register holding one XMM part, reloading spills into `scratch`.
    fn take_xmm(&mut self, reg: VReg, part: u32, scratch: AsmReg) -> Result<AsmReg> {
        match self.loc(reg).part(part) {
            Location::Reg(r) => Ok(r),
            Location::Spill(slot) => {
                self.enc.movups_xm(scratch, RBP, self.spill_off(slot))?;
                Ok(scratch)
            }
            Location::None => Err(Error::JitFailed("unallocated value")),
        }
    }

    /// Target register for a GP destination (RAX when spilled).
    fn gp_out(&self, reg: VReg) -> AsmReg {
        match self.loc(reg).part(0) {
            Location::Reg(r) => r,
            _ => RAX,
        }
    }

    /// Target register for an XMM destination part (XMM0 when spilled).
    fn xmm_out(&self, reg: VReg, part: u32) -> AsmReg {
        match self.loc(reg).part(part) {
            Location::Reg(r) => r,
            _ => X0,
        }
    }

    /// Routes a computed GP value into the destination's home.
    fn flush_gp(&mut self, dst: VReg, computed: AsmReg) -> Result<()> {
        match self.loc(dst).part(0) {
            Location::Reg(r) => {
                if r != computed {
                    self.enc.mov32_rr(r, computed)?;
                }
                Ok(())
            }
            Location::Spill(slot) => self.enc.mov32_mr(RBP, self.spill_off(slot), computed),
            Location::None => Err(Error::JitFailed("unallocated destination")),
        }
    }

    /// Routes a computed XMM part into the destination's home.
    fn flush_xmm(&mut self, dst: VReg, part: u32, computed: AsmReg) -> Result<()> {
        match self.loc(dst).part(part) {
            Location::Reg(r) => {
                if r != computed {
                    self.enc.movaps_rr(r, computed)?;
                }
                Ok(())
            }
            Location::Spill(slot) => self.enc.movups_mx(RBP, self.spill_off(slot), computed),
            Location::None => Err(Error::JitFailed("unallocated destination")),
        }
    }

    fn is_gp(&self, reg: VReg) -> bool {
        let info = self.info(reg);
        info.is_scalar() && matches!(info.kind, TypeKind::Int | TypeKind::Bool)
    }

    fn parts(&self, reg: VReg) -> u32 {
        self.info(reg).parts()
    }

    // ==== shared emission patterns ====

    /// Two-operand XMM pattern: `dst = src0 OP src1` through the
    /// destructive SSE form (`movaps d, a; op d, b`), with aliasing
    /// fixed up through scratch.
    fn xmm_binop(
        &mut self,
        dst: VReg,
        part: u32,
        s0: VReg,
        s1: VReg,
        op: impl Fn(&mut X64Encoder, AsmReg, AsmReg) -> Result<()>,
    ) -> Result<()> {
        let a = self.take_xmm(s0, part, X14)?;
        let b = self.take_xmm(s1, part, X15)?;
        let d = self.xmm_out(dst, part);
        let b = if d == b && d != a {
            self.enc.movaps_rr(X0, b)?;
            X0
        } else {
            b
        };
        if d != a {
            self.enc.movaps_rr(d, a)?;
        }
        op(&mut self.enc, d, b)?;
        self.flush_xmm(dst, part, d)
    }

    /// Two-operand GP pattern with the same aliasing discipline.
    fn gp_binop(
        &mut self,
        dst: VReg,
        s0: VReg,
        s1: VReg,
        op: impl Fn(&mut X64Encoder, AsmReg, AsmReg) -> Result<()>,
    ) -> Result<()> {
        let a = self.take_gp(s0, RAX)?;
        let b = self.take_gp(s1, R11)?;
        let d = self.gp_out(dst);
        let b = if d == b && d != a {
            self.enc.mov32_rr(R11, b)?;
            R11
        } else {
            b
        };
        if d != a {
            self.enc.mov32_rr(d, a)?;
        }
        op(&mut self.enc, d, b)?;
        self.flush_gp(dst, d)
    }

    /// One-operand XMM pattern for instructions with separate dst/src
    /// encodings (pshufd, sqrtps, conversions).
    fn xmm_unop(
        &mut self,
        dst: VReg,
        part: u32,
        src: VReg,
        src_part: u32,
        op: impl Fn(&mut X64Encoder, AsmReg, AsmReg) -> Result<()>,
    ) -> Result<()> {
        let a = self.take_xmm(src, src_part, X14)?;
        let d = self.xmm_out(dst, part);
        op(&mut self.enc, d, a)?;
        self.flush_xmm(dst, part, d)
    }

    // ==== instruction dispatch ====

    fn inst(&mut self, inst: &Inst) -> Result<()> {
        match inst.op {
            Op::Imm => self.op_imm(inst),
            Op::ConstPool => self.op_const_pool(inst),
            Op::Mov => self.op_mov(inst),
            Op::Broadcast => self.op_broadcast(inst),
            Op::Shuffle => self.op_shuffle(inst),
            Op::Extract => self.op_extract(inst),
            Op::ExtractDyn => self.op_extract_dyn(inst),
            Op::Insert => self.op_insert(inst),
            Op::LoadArg => self.op_load_arg(inst),
            Op::StoreArg => self.op_store_arg(inst),
            Op::LoadVar => self.op_load_var(inst),
            Op::StoreVar => self.op_store_var(inst),
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem => self.op_arith(inst),
            Op::Neg => self.op_neg(inst),
            Op::Abs => self.op_abs(inst),
            Op::Min | Op::Max => self.op_min_max(inst),
            Op::Sqrt => self.op_sqrt(inst),
            Op::Floor | Op::Ceil | Op::Round | Op::Trunc => self.op_round(inst),
            Op::And | Op::Or | Op::Xor => self.op_bitwise(inst),
            Op::Not => self.op_not(inst),
            Op::Shl | Op::Shr => self.op_shift(inst),
            Op::CmpEq | Op::CmpNe | Op::CmpLt | Op::CmpLe | Op::CmpGt | Op::CmpGe => {
                self.op_cmp(inst)
            }
            Op::Select => self.op_select(inst),
            Op::Cast => self.op_cast(inst),
            Op::HSum => self.op_hsum(inst),
        }
    }

    fn op_imm(&mut self, inst: &Inst) -> Result<()> {
        let info = self.info(inst.dst);
        if self.is_gp(inst.dst) {
            let d = self.gp_out(inst.dst);
            self.enc.mov32_ri(d, inst.imm as i32)?;
            return self.flush_gp(inst.dst, d);
        }
        let d = self.xmm_out(inst.dst, 0);
        match info.kind {
            TypeKind::Double => {
                self.enc.mov64_ri(RAX, inst.imm)?;
                self.enc.movq_xr(d, RAX)?;
            }
            _ => {
                self.enc.mov32_ri(RAX, inst.imm as i32)?;
                self.enc.movd_xr(d, RAX)?;
            }
        }
        self.flush_xmm(inst.dst, 0, d)
    }

    fn op_const_pool(&mut self, inst: &Inst) -> Result<()> {
        for part in 0..self.parts(inst.dst) {
            let label = self.pool_labels[inst.a as usize][part as usize];
            let d = self.xmm_out(inst.dst, part);
            self.enc.movups_x_label(d, label)?;
            self.flush_xmm(inst.dst, part, d)?;
        }
        Ok(())
    }

    fn op_mov(&mut self, inst: &Inst) -> Result<()> {
        if self.is_gp(inst.dst) {
            let a = self.take_gp(inst.srcs[0], RAX)?;
            return self.flush_gp(inst.dst, a);
        }
        for part in 0..self.parts(inst.dst) {
            let a = self.take_xmm(inst.srcs[0], part, X14)?;
            self.flush_xmm(inst.dst, part, a)?;
        }
        Ok(())
    }

    fn op_broadcast(&mut self, inst: &Inst) -> Result<()> {
        let dst = inst.dst;
        let src = inst.srcs[0];
        let info = self.info(dst);
        match info.kind {
            TypeKind::Int | TypeKind::Bool => {
                let s = self.take_gp(src, RAX)?;
                if info.kind == TypeKind::Bool {
                    // 0/1 scalar becomes a full 0/-1 lane mask.
                    if s != RAX {
                        self.enc.mov32_rr(RAX, s)?;
                    }
                    self.enc.neg32(RAX)?;
                    self.enc.movd_xr(X0, RAX)?;
                } else {
                    self.enc.movd_xr(X0, s)?;
                }
                let d = self.xmm_out(dst, 0);
                self.enc.pshufd_imm(d, X0, 0)?;
                self.flush_xmm(dst, 0, d)
            }
            TypeKind::Float => {
                self.xmm_unop(dst, 0, src, 0, |e, d, a| e.pshufd_imm(d, a, 0))
            }
            TypeKind::Double => {
                for part in 0..self.parts(dst) {
                    self.xmm_unop(dst, part, src, 0, |e, d, a| e.pshufd_imm(d, a, 0x44))?;
                }
                Ok(())
            }
            _ => Err(Error::JitFailed("broadcast of unsupported kind")),
        }
    }

    fn op_shuffle(&mut self, inst: &Inst) -> Result<()> {
        let dst = inst.dst;
        let src = inst.srcs[0];
        let info = self.info(dst);
        let mask = inst.a;

        if info.kind != TypeKind::Double {
            return self.xmm_unop(dst, 0, src, 0, |e, d, a| e.pshufd_imm(d, a, mask));
        }

        if self.parts(src) == 1 && self.parts(dst) == 1 {
            // double2: turn the qword selectors into a dword pshufd mask.
            let s0 = mask & 3;
            let s1 = (mask >> 2) & 3;
            let order = (2 * s0) | (2 * s0 + 1) << 2 | (2 * s1) << 4 | (2 * s1 + 1) << 6;
            return self.xmm_unop(dst, 0, src, 0, |e, d, a| e.pshufd_imm(d, a, order));
        }

        // Wide doubles go through the lane buffer.
        let buf = self.lane_buf;
        for part in 0..self.parts(src) {
            let s = self.take_xmm(src, part, X14)?;
            self.enc.movups_mx(RBP, buf + 16 * part as i32, s)?;
        }
        let lanes = info.lanes as u32;
        for part in 0..self.parts(dst) {
            let lane0 = (mask >> (2 * (2 * part))) & 3;
            let lane1 = (mask >> (2 * (2 * part + 1))) & 3;
            self.enc.movsd_xm(X0, RBP, buf + 8 * lane0 as i32)?;
            if 2 * part + 1 < lanes {
                self.enc.movhpd_xm(X0, RBP, buf + 8 * lane1 as i32)?;
            }
            self.flush_xmm(dst, part, X0)?;
        }
        Ok(())
    }

    fn op_extract(&mut self, inst: &Inst) -> Result<()> {
        let dst = inst.dst;
        let src = inst.srcs[0];
        let lane = inst.a;
        let dst_info = self.info(dst);

        if self.is_gp(dst) {
            let s = self.take_xmm(src, 0, X14)?;
            let d = self.gp_out(dst);
            if lane == 0 {
                self.enc.movd_rx(d, s)?;
            } else if self.sse41 {
                self.enc.pextrd_imm(d, s, lane)?;
            } else {
                self.enc.pshufd_imm(X0, s, 0x55 * lane)?;
                self.enc.movd_rx(d, X0)?;
            }
            if dst_info.kind == TypeKind::Bool {
                self.enc.and32_ri(d, 1)?;
            }
            return self.flush_gp(dst, d);
        }

        match dst_info.kind {
            TypeKind::Double => {
                let part = lane / 2;
                let s = self.take_xmm(src, part, X14)?;
                let d = self.xmm_out(dst, 0);
                if lane % 2 == 0 {
                    if d != s {
                        self.enc.movaps_rr(d, s)?;
                    }
                } else {
                    self.enc.pshufd_imm(d, s, 0x0E)?;
                }
                self.flush_xmm(dst, 0, d)
            }
            _ => {
                let s = self.take_xmm(src, 0, X14)?;
                let d = self.xmm_out(dst, 0);
                if lane == 0 {
                    if d != s {
                        self.enc.movaps_rr(d, s)?;
                    }
                } else {
                    self.enc.pshufd_imm(d, s, 0x55 * lane)?;
                }
                self.flush_xmm(dst, 0, d)
            }
        }
    }

    fn op_extract_dyn(&mut self, inst: &Inst) -> Result<()> {
        let dst = inst.dst;
        let src = inst.srcs[0];
        let idx = inst.srcs[1];
        let src_info = self.info(src);
        let buf = self.lane_buf;

        for part in 0..self.parts(src) {
            let s = self.take_xmm(src, part, X14)?;
            self.enc.movups_mx(RBP, buf + 16 * part as i32, s)?;
        }
        let i = self.take_gp(idx, RAX)?;
        if i != R11 {
            self.enc.mov32_rr(R11, i)?;
        }
        let mask = (src_info.lanes as u32).next_power_of_two() - 1;
        self.enc.and32_ri(R11, mask as i32)?;

        if self.is_gp(dst) {
            let d = self.gp_out(dst);
            self.enc.mov32_rm_idx(d, RBP, R11, 4, buf)?;
            if self.info(dst).kind == TypeKind::Bool {
                self.enc.and32_ri(d, 1)?;
            }
            self.flush_gp(dst, d)
        } else if src_info.kind == TypeKind::Double {
            let d = self.xmm_out(dst, 0);
            self.enc.movsd_xm_idx(d, RBP, R11, 8, buf)?;
            self.flush_xmm(dst, 0, d)
        } else {
            let d = self.xmm_out(dst, 0);
            self.enc.movss_xm_idx(d, RBP, R11, 4, buf)?;
            self.flush_xmm(dst, 0, d)
        }
    }

    fn op_insert(&mut self, inst: &Inst) -> Result<()> {
        let dst = inst.dst;
        let base = inst.srcs[0];
        let scalar = inst.srcs[1];
        let lane = inst.a;
        let info = self.info(dst);

        if info.kind == TypeKind::Double {
            // Copy all parts, then merge the one containing the lane.
            let target_part = lane / 2;
            for part in 0..self.parts(dst) {
                let b = self.take_xmm(base, part, X14)?;
                if part == target_part {
                    let s = self.take_xmm(scalar, 0, X15)?;
                    let d = self.xmm_out(dst, part);
                    if d != b {
                        self.enc.movaps_rr(d, b)?;
                    }
                    if lane % 2 == 0 {
                        self.enc.movsd_rr(d, s)?;
                    } else {
                        self.enc.movsd_mx(RBP, self.lane_buf, s)?;
                        self.enc.movhpd_xm(d, RBP, self.lane_buf)?;
                    }
                    self.flush_xmm(dst, part, d)?;
                } else {
                    self.flush_xmm(dst, part, b)?;
                }
            }
            return Ok(());
        }

        let b = self.take_xmm(base, 0, X14)?;
        let d = self.xmm_out(dst, 0);
        let is_int_scalar = matches!(self.info(scalar).kind, TypeKind::Int | TypeKind::Bool);
        if self.sse41 {
            if d != b {
                self.enc.movaps_rr(d, b)?;
            }
            if is_int_scalar {
                let s = self.take_gp(scalar, RAX)?;
                let s = if self.info(scalar).kind == TypeKind::Bool {
                    if s != RAX {
                        self.enc.mov32_rr(RAX, s)?;
                    }
                    self.enc.neg32(RAX)?;
                    RAX
                } else {
                    s
                };
                self.enc.pinsrd_imm(d, s, lane)?;
            } else {
                let s = self.take_xmm(scalar, 0, X15)?;
                self.enc.insertps_imm(d, s, lane << 4)?;
            }
            return self.flush_xmm(dst, 0, d);
        }

        // SSE2: round-trip the vector through the lane buffer.
        let buf = self.lane_buf;
        self.enc.movups_mx(RBP, buf, b)?;
        if is_int_scalar {
            let s = self.take_gp(scalar, RAX)?;
            let s = if self.info(scalar).kind == TypeKind::Bool {
                if s != RAX {
                    self.enc.mov32_rr(RAX, s)?;
                }
                self.enc.neg32(RAX)?;
                RAX
            } else {
                s
            };
            self.enc.mov32_mr(RBP, buf + 4 * lane as i32, s)?;
        } else {
            let s = self.take_xmm(scalar, 0, X15)?;
            self.enc.movss_mx(RBP, buf + 4 * lane as i32, s)?;
        }
        self.enc.movups_xm(d, RBP, buf)?;
        self.flush_xmm(dst, 0, d)
    }

    // ==== memory ====

    /// Reloads the record base pointer the prologue saved for `slot`.
    fn arg_base(&mut self, slot: u32) -> Result<AsmReg> {
        self.enc.mov64_rm(RAX, RBP, -8 * (slot as i32 + 1))?;
        Ok(RAX)
    }

    fn op_load_arg(&mut self, inst: &Inst) -> Result<()> {
        let dst = inst.dst;
        let info = self.info(dst);
        let b = self.arg_base(inst.a)?;
        let off = inst.imm as i32;

        if self.is_gp(dst) {
            let d = self.gp_out(dst);
            self.enc.mov32_rm(d, b, off)?;
            return self.flush_gp(dst, d);
        }

        match (info.kind, info.lanes) {
            (TypeKind::Double, 1) => {
                let d = self.xmm_out(dst, 0);
                self.enc.movsd_xm(d, b, off)?;
                self.flush_xmm(dst, 0, d)
            }
            (TypeKind::Double, 2) => {
                let d = self.xmm_out(dst, 0);
                self.enc.movups_xm(d, b, off)?;
                self.flush_xmm(dst, 0, d)
            }
            (TypeKind::Double, lanes) => {
                let d = self.xmm_out(dst, 0);
                self.enc.movups_xm(d, b, off)?;
                self.flush_xmm(dst, 0, d)?;
                let d = self.xmm_out(dst, 1);
                if lanes == 3 {
                    self.enc.movsd_xm(d, b, off + 16)?;
                } else {
                    self.enc.movups_xm(d, b, off + 16)?;
                }
                self.flush_xmm(dst, 1, d)
            }
            (_, 1) => {
                let d = self.xmm_out(dst, 0);
                self.enc.movss_xm(d, b, off)?;
                self.flush_xmm(dst, 0, d)
            }
            (_, 2) => {
                let d = self.xmm_out(dst, 0);
                self.enc.movsd_xm(d, b, off)?;
                self.flush_xmm(dst, 0, d)
            }
            (_, 3) => {
                let d = self.xmm_out(dst, 0);
                self.enc.movsd_xm(d, b, off)?;
                self.enc.movss_xm(X15, b, off + 8)?;
                self.enc.movlhps(d, X15)?;
                self.flush_xmm(dst, 0, d)
            }
            _ => {
                let d = self.xmm_out(dst, 0);
                self.enc.movups_xm(d, b, off)?;
                self.flush_xmm(dst, 0, d)
            }
        }
    }

    fn op_store_arg(&mut self, inst: &Inst) -> Result<()> {
        let src = inst.srcs[0];
        let info = self.info(src);
        let b = self.arg_base(inst.a)?;
        let off = inst.imm as i32;

        if self.is_gp(src) {
            let s = self.take_gp(src, R11)?;
            return self.enc.mov32_mr(b, off, s);
        }

        match (info.kind, info.lanes) {
            (TypeKind::Double, 1) => {
                let s = self.take_xmm(src, 0, X14)?;
                self.enc.movsd_mx(b, off, s)
            }
            (TypeKind::Double, 2) => {
                let s = self.take_xmm(src, 0, X14)?;
                self.enc.movups_mx(b, off, s)
            }
            (TypeKind::Double, lanes) => {
                let s = self.take_xmm(src, 0, X14)?;
                self.enc.movups_mx(b, off, s)?;
                let s = self.take_xmm(src, 1, X14)?;
                if lanes == 3 {
                    self.enc.movsd_mx(b, off + 16, s)
                } else {
                    self.enc.movups_mx(b, off + 16, s)
                }
            }
            (_, 1) => {
                let s = self.take_xmm(src, 0, X14)?;
                self.enc.movss_mx(b, off, s)
            }
            (_, 2) => {
                let s = self.take_xmm(src, 0, X14)?;
                self.enc.movsd_mx(b, off, s)
            }
            (_, 3) => {
                let s = self.take_xmm(src, 0, X14)?;
                self.enc.movsd_mx(b, off, s)?;
                self.enc.pshufd_imm(X0, s, 0x02)?;
                self.enc.movss_mx(b, off + 8, X0)
            }
            _ => {
                let s = self.take_xmm(src, 0, X14)?;
                self.enc.movups_mx(b, off, s)
            }
        }
    }

    fn op_load_var(&mut self, inst: &Inst) -> Result<()> {
        let dst = inst.dst;
        let offset = self.var_offsets[inst.a as usize];
        if self.is_gp(dst) {
            let d = self.gp_out(dst);
            self.enc.mov32_rm(d, RBP, offset)?;
            return self.flush_gp(dst, d);
        }
        for part in 0..self.parts(dst) {
            let d = self.xmm_out(dst, part);
            self.enc.movups_xm(d, RBP, offset + 16 * part as i32)?;
            self.flush_xmm(dst, part, d)?;
        }
        Ok(())
    }

    fn op_store_var(&mut self, inst: &Inst) -> Result<()> {
        let src = inst.srcs[0];
        let offset = self.var_offsets[inst.a as usize];
        if self.is_gp(src) {
            let s = self.take_gp(src, R11)?;
            return self.enc.mov32_mr(RBP, offset, s);
        }
        for part in 0..self.parts(src) {
            let s = self.take_xmm(src, part, X14)?;
            self.enc.movups_mx(RBP, offset + 16 * part as i32, s)?;
        }
        Ok(())
    }

    // ==== arithmetic ====

    fn op_arith(&mut self, inst: &Inst) -> Result<()> {
        let info = self.info(inst.dst);
        let (dst, s0, s1) = (inst.dst, inst.srcs[0], inst.srcs[1]);

        if self.is_gp(dst) {
            return match inst.op {
                Op::Add => self.gp_binop(dst, s0, s1, |e, d, b| e.add32_rr(d, b)),
                Op::Sub => self.gp_binop(dst, s0, s1, |e, d, b| e.sub32_rr(d, b)),
                Op::Mul => self.gp_binop(dst, s0, s1, |e, d, b| e.imul32_rr(d, b)),
                Op::Div | Op::Rem => self.gp_div(inst.op, dst, s0, s1),
                _ => unreachable!(),
            };
        }

        match info.kind {
            TypeKind::Int => match inst.op {
                Op::Add => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.paddd(d, b)),
                Op::Sub => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.psubd(d, b)),
                Op::Mul if self.sse41 => {
                    self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.pmulld(d, b))
                }
                Op::Mul => self.int_vector_mul(dst, s0, s1),
                Op::Div | Op::Rem => self.int_vector_div(inst.op, dst, s0, s1),
                _ => unreachable!(),
            },
            TypeKind::Float if info.is_scalar() => match inst.op {
                Op::Add => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.addss(d, b)),
                Op::Sub => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.subss(d, b)),
                Op::Mul => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.mulss(d, b)),
                Op::Div => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.divss(d, b)),
                _ => Err(Error::JitFailed("float remainder")),
            },
            TypeKind::Float => match inst.op {
                Op::Add => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.addps(d, b)),
                Op::Sub => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.subps(d, b)),
                Op::Mul => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.mulps(d, b)),
                Op::Div => self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.divps(d, b)),
                _ => Err(Error::JitFailed("float remainder")),
            },
            TypeKind::Double => {
                for part in 0..self.parts(dst) {
                    let scalar = info.is_scalar();
                    match (inst.op, scalar) {
                        (Op::Add, true) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.addsd(d, b))?
                        }
                        (Op::Add, false) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.addpd(d, b))?
                        }
                        (Op::Sub, true) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.subsd(d, b))?
                        }
                        (Op::Sub, false) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.subpd(d, b))?
                        }
                        (Op::Mul, true) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.mulsd(d, b))?
                        }
                        (Op::Mul, false) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.mulpd(d, b))?
                        }
                        (Op::Div, true) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.divsd(d, b))?
                        }
                        (Op::Div, false) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.divpd(d, b))?
                        }
                        _ => return Err(Error::JitFailed("double remainder")),
                    }
                }
                Ok(())
            }
            _ => Err(Error::JitFailed("arithmetic on unsupported kind")),
        }
    }

    /// Scalar integer division honors idiv's fixed RAX/RDX pair; RDX is
    /// preserved around the sequence when it may hold a live value.
    fn gp_div(&mut self, op: Op, dst: VReg, s0: VReg, s1: VReg) -> Result<()> {
        let a = self.take_gp(s0, RAX)?;
        let b = self.take_gp(s1, R11)?;
        let divisor = if b == RAX || b == RDX {
            self.enc.mov32_rr(R11, b)?;
            R11
        } else {
            b
        };
        let dst_is_rdx = matches!(self.loc(dst).part(0), Location::Reg(r) if r == RDX);
        if !dst_is_rdx {
            self.enc.push64(RDX)?;
        }
        if a != RAX {
            self.enc.mov32_rr(RAX, a)?;
        }
        self.enc.cdq()?;
        self.enc.idiv32_r(divisor)?;
        let result = if op == Op::Div { RAX } else { RDX };
        self.flush_gp(dst, result)?;
        if !dst_is_rdx {
            self.enc.pop64(RDX)?;
        }
        Ok(())
    }

    /// Integer vector multiply without pmulld: pmuludq on even and odd
    /// lanes, repacked with shuffles.
    fn int_vector_mul(&mut self, dst: VReg, s0: VReg, s1: VReg) -> Result<()> {
        let buf = self.lane_buf;
        let a = self.take_xmm(s0, 0, X14)?;
        self.enc.movups_mx(RBP, buf, a)?;
        let b = self.take_xmm(s1, 0, X15)?;
        self.enc.movups_mx(RBP, buf + 16, b)?;

        self.enc.movups_xm(X0, RBP, buf)?;
        self.enc.pshufd_imm(X0, X0, 0xF5)?;
        self.enc.movups_xm(X14, RBP, buf + 16)?;
        self.enc.pshufd_imm(X14, X14, 0xF5)?;
        self.enc.pmuludq(X0, X14)?;
        self.enc.pshufd_imm(X0, X0, 0x08)?;

        self.enc.movups_xm(X14, RBP, buf)?;
        self.enc.movups_xm(X15, RBP, buf + 16)?;
        self.enc.pmuludq(X14, X15)?;
        self.enc.pshufd_imm(X14, X14, 0x08)?;
        self.enc.punpckldq(X14, X0)?;
        self.flush_xmm(dst, 0, X14)
    }

    /// Integer vector division has no ISA support at all; lanes go
    /// through the stack and scalar idiv.
    fn int_vector_div(&mut self, op: Op, dst: VReg, s0: VReg, s1: VReg) -> Result<()> {
        let buf = self.lane_buf;
        let lanes = self.info(dst).lanes as i32;
        let a = self.take_xmm(s0, 0, X14)?;
        self.enc.movups_mx(RBP, buf, a)?;
        let b = self.take_xmm(s1, 0, X15)?;
        self.enc.movups_mx(RBP, buf + 16, b)?;

        self.enc.push64(RDX)?;
        for lane in 0..lanes {
            self.enc.mov32_rm(RAX, RBP, buf + 4 * lane)?;
            self.enc.cdq()?;
            self.enc.idiv32_m(RBP, buf + 16 + 4 * lane)?;
            let result = if op == Op::Div { RAX } else { RDX };
            self.enc.mov32_mr(RBP, buf + 4 * lane, result)?;
        }
        self.enc.pop64(RDX)?;

        let d = self.xmm_out(dst, 0);
        self.enc.movups_xm(d, RBP, buf)?;
        self.flush_xmm(dst, 0, d)
    }

    fn op_neg(&mut self, inst: &Inst) -> Result<()> {
        let (dst, src) = (inst.dst, inst.srcs[0]);
        let info = self.info(dst);
        if self.is_gp(dst) {
            let a = self.take_gp(src, RAX)?;
            let d = self.gp_out(dst);
            if d != a {
                self.enc.mov32_rr(d, a)?;
            }
            self.enc.neg32(d)?;
            return self.flush_gp(dst, d);
        }
        match info.kind {
            TypeKind::Int => {
                let a = self.take_xmm(src, 0, X14)?;
                self.enc.pxor(X0, X0)?;
                self.enc.psubd(X0, a)?;
                self.flush_xmm(dst, 0, X0)
            }
            TypeKind::Float => {
                let sign = self.magic_u32(0x8000_0000);
                let a = self.take_xmm(src, 0, X14)?;
                self.enc.movups_x_label(X0, sign)?;
                self.enc.xorps(X0, a)?;
                self.flush_xmm(dst, 0, X0)
            }
            TypeKind::Double => {
                let sign = self.magic_u64(0x8000_0000_0000_0000);
                for part in 0..self.parts(dst) {
                    let a = self.take_xmm(src, part, X14)?;
                    self.enc.movups_x_label(X0, sign)?;
                    self.enc.xorps(X0, a)?;
                    self.flush_xmm(dst, part, X0)?;
                }
                Ok(())
            }
            _ => Err(Error::JitFailed("negate of unsupported kind")),
        }
    }

    fn op_abs(&mut self, inst: &Inst) -> Result<()> {
        let (dst, src) = (inst.dst, inst.srcs[0]);
        let info = self.info(dst);
        if self.is_gp(dst) {
            let a = self.take_gp(src, RAX)?;
            if a != RAX {
                self.enc.mov32_rr(RAX, a)?;
            }
            self.enc.mov32_rr(R11, RAX)?;
            self.enc.sar32_ri(R11, 31)?;
            self.enc.xor32_rr(RAX, R11)?;
            self.enc.sub32_rr(RAX, R11)?;
            return self.flush_gp(dst, RAX);
        }
        match info.kind {
            TypeKind::Int => {
                if self.sse41 {
                    return self.xmm_unop(dst, 0, src, 0, |e, d, a| e.pabsd(d, a));
                }
                let a = self.take_xmm(src, 0, X14)?;
                self.enc.movaps_rr(X0, a)?;
                self.enc.psrad_imm(X0, 31)?;
                if a != X15 {
                    self.enc.movaps_rr(X15, a)?;
                }
                self.enc.pxor(X15, X0)?;
                self.enc.psubd(X15, X0)?;
                self.flush_xmm(dst, 0, X15)
            }
            TypeKind::Float => {
                let mask = self.magic_u32(0x7FFF_FFFF);
                let a = self.take_xmm(src, 0, X14)?;
                self.enc.movups_x_label(X0, mask)?;
                self.enc.andps(X0, a)?;
                self.flush_xmm(dst, 0, X0)
            }
            TypeKind::Double => {
                let mask = self.magic_u64(0x7FFF_FFFF_FFFF_FFFF);
                for part in 0..self.parts(dst) {
                    let a = self.take_xmm(src, part, X14)?;
                    self.enc.movups_x_label(X0, mask)?;
                    self.enc.andps(X0, a)?;
                    self.flush_xmm(dst, part, X0)?;
                }
                Ok(())
            }
            _ => Err(Error::JitFailed("abs of unsupported kind")),
        }
    }

    fn op_min_max(&mut self, inst: &Inst) -> Result<()> {
        let (dst, s0, s1) = (inst.dst, inst.srcs[0], inst.srcs[1]);
        let info = self.info(dst);
        let is_min = inst.op == Op::Min;

        if self.is_gp(dst) {
            let a = self.take_gp(s0, RAX)?;
            let b = self.take_gp(s1, R11)?;
            if a != RAX {
                self.enc.mov32_rr(RAX, a)?;
            }
            self.enc.cmp32_rr(RAX, b)?;
            let cond = if is_min { Cond::Gt } else { Cond::Lt };
            self.enc.cmovcc32(cond, RAX, b)?;
            return self.flush_gp(dst, RAX);
        }

        match info.kind {
            TypeKind::Int => {
                if self.sse41 {
                    return if is_min {
                        self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.pminsd(d, b))
                    } else {
                        self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.pmaxsd(d, b))
                    };
                }
                // min = a ^ ((a^b) & (a>b)); max flips which side keeps.
                let buf = self.lane_buf;
                let a = self.take_xmm(s0, 0, X14)?;
                self.enc.movups_mx(RBP, buf, a)?;
                let b = self.take_xmm(s1, 0, X15)?;
                self.enc.movups_mx(RBP, buf + 16, b)?;
                self.enc.movups_xm(X14, RBP, buf)?;
                self.enc.movups_xm(X15, RBP, buf + 16)?;
                self.enc.movaps_rr(X0, X14)?;
                self.enc.pcmpgtd(X0, X15)?;
                if is_min {
                    self.enc.pxor(X15, X14)?;
                    self.enc.pand(X15, X0)?;
                    self.enc.pxor(X15, X14)?;
                    self.flush_xmm(dst, 0, X15)
                } else {
                    self.enc.pxor(X14, X15)?;
                    self.enc.pand(X14, X0)?;
                    self.enc.pxor(X14, X15)?;
                    self.flush_xmm(dst, 0, X14)
                }
            }
            TypeKind::Float if info.is_scalar() => {
                if is_min {
                    self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.minss(d, b))
                } else {
                    self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.maxss(d, b))
                }
            }
            TypeKind::Float => {
                if is_min {
                    self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.minps(d, b))
                } else {
                    self.xmm_binop(dst, 0, s0, s1, |e, d, b| e.maxps(d, b))
                }
            }
            TypeKind::Double => {
                for part in 0..self.parts(dst) {
                    match (is_min, info.is_scalar()) {
                        (true, true) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.minsd(d, b))?
                        }
                        (true, false) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.minpd(d, b))?
                        }
                        (false, true) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.maxsd(d, b))?
                        }
                        (false, false) => {
                            self.xmm_binop(dst, part, s0, s1, |e, d, b| e.maxpd(d, b))?
                        }
                    }
                }
                Ok(())
            }
            _ => Err(Error::JitFailed("min/max of unsupported kind")),
        }
    }

    fn op_sqrt(&mut self, inst: &Inst) -> Result<()> {
        let (dst, src) = (inst.dst, inst.srcs[0]);
        let info = self.info(dst);
        match info.kind {
            TypeKind::Float if info.is_scalar() => {
                self.xmm_unop(dst, 0, src, 0, |e, d, a| e.sqrtss(d, a))
            }
            TypeKind::Float => self.xmm_unop(dst, 0, src, 0, |e, d, a| e.sqrtps(d, a)),
            TypeKind::Double if info.is_scalar() => {
                self.xmm_unop(dst, 0, src, 0, |e, d, a| e.sqrtsd(d, a))
            }
            TypeKind::Double => {
                for part in 0..self.parts(dst) {
                    self.xmm_unop(dst, part, src, part, |e, d, a| e.sqrtpd(d, a))?;
                }
                Ok(())
            }
            _ => Err(Error::JitFailed("sqrt of unsupported kind")),
        }
    }

    fn op_round(&mut self, inst: &Inst) -> Result<()> {
        let (dst, src) = (inst.dst, inst.srcs[0]);
        let info = self.info(dst);
        let is_double = info.kind == TypeKind::Double;

        if self.sse41 {
            let mode = match inst.op {
                Op::Round => 0,
                Op::Floor => 1,
                Op::Ceil => 2,
                _ => 3,
            };
            for part in 0..self.parts(dst) {
                if is_double {
                    self.xmm_unop(dst, part, src, part, |e, d, a| e.roundpd_imm(d, a, mode))?;
                } else {
                    self.xmm_unop(dst, part, src, part, |e, d, a| e.roundps_imm(d, a, mode))?;
                }
            }
            return Ok(());
        }

        for part in 0..self.parts(dst) {
            match inst.op {
                Op::Trunc => self.sse2_trunc(dst, src, part, is_double)?,
                Op::Floor | Op::Ceil => {
                    self.sse2_floor_ceil(dst, src, part, is_double, inst.op == Op::Floor)?
                }
                _ => self.sse2_round_nearest(dst, src, part, is_double)?,
            }
        }
        Ok(())
    }

    fn sse2_trunc(&mut self, dst: VReg, src: VReg, part: u32, is_double: bool) -> Result<()> {
        let a = self.take_xmm(src, part, X14)?;
        if is_double {
            self.enc.cvttpd2dq(X0, a)?;
            self.enc.cvtdq2pd(X0, X0)?;
        } else {
            self.enc.cvttps2dq(X0, a)?;
            self.enc.cvtdq2ps(X0, X0)?;
        }
        self.flush_xmm(dst, part, X0)
    }

    /// floor/ceil: truncate, then subtract/add one where truncation
    /// moved the value in the wrong direction.
    fn sse2_floor_ceil(
        &mut self,
        dst: VReg,
        src: VReg,
        part: u32,
        is_double: bool,
        is_floor: bool,
    ) -> Result<()> {
        let one = if is_double {
            self.magic_u64(1.0f64.to_bits())
        } else {
            self.magic_u32(1.0f32.to_bits())
        };
        let a = self.take_xmm(src, part, X14)?;
        if is_double {
            self.enc.cvttpd2dq(X0, a)?;
            self.enc.cvtdq2pd(X0, X0)?;
        } else {
            self.enc.cvttps2dq(X0, a)?;
            self.enc.cvtdq2ps(X0, X0)?;
        }
        self.enc.movaps_rr(X15, X0)?;
        // floor: t > a means t must come down; ceil: t < a must go up.
        let pred = if is_floor { 6 } else { 1 };
        if is_double {
            self.enc.cmppd_imm(X15, a, pred)?;
        } else {
            self.enc.cmpps_imm(X15, a, pred)?;
        }
        self.enc.movups_x_label(X14, one)?;
        self.enc.andps(X15, X14)?;
        if is_double {
            if is_floor {
                self.enc.subpd(X0, X15)?;
            } else {
                self.enc.addpd(X0, X15)?;
            }
        } else if is_floor {
            self.enc.subps(X0, X15)?;
        } else {
            self.enc.addps(X0, X15)?;
        }
        self.flush_xmm(dst, part, X0)
    }

    /// Round-to-nearest-even via the sign-aware 2^23 / 2^52 magic-number
    /// trick, falling back to the original value where it is too large
    /// to have a fractional part.
    fn sse2_round_nearest(
        &mut self,
        dst: VReg,
        src: VReg,
        part: u32,
        is_double: bool,
    ) -> Result<()> {
        // 2^23 / 2^52: the smallest magnitudes at which the float type
        // has no fractional bits left.
        let (sign, abs, magic) = if is_double {
            (
                self.magic_u64(0x8000_0000_0000_0000),
                self.magic_u64(0x7FFF_FFFF_FFFF_FFFF),
                self.magic_u64(4503599627370496.0f64.to_bits()),
            )
        } else {
            (
                self.magic_u32(0x8000_0000),
                self.magic_u32(0x7FFF_FFFF),
                self.magic_u32(8388608.0f32.to_bits()),
            )
        };
        let buf = self.lane_buf;

        let a = self.take_xmm(src, part, X14)?;
        self.enc.movups_x_label(X0, sign)?;
        self.enc.andps(X0, a)?;
        self.enc.movups_x_label(X15, magic)?;
        self.enc.orps(X0, X15)?;
        self.enc.movaps_rr(X15, a)?;
        if is_double {
            self.enc.addpd(X15, X0)?;
            self.enc.subpd(X15, X0)?;
        } else {
            self.enc.addps(X15, X0)?;
            self.enc.subps(X15, X0)?;
        }
        // Keep the original where |a| >= magic (already integral or NaN).
        self.enc.movups_x_label(X0, abs)?;
        self.enc.andps(X0, a)?;
        self.enc.movups_mx(RBP, buf, X15)?;
        self.enc.movups_x_label(X15, magic)?;
        if is_double {
            self.enc.cmppd_imm(X0, X15, 5)?;
        } else {
            self.enc.cmpps_imm(X0, X15, 5)?;
        }
        self.enc.movups_xm(X15, RBP, buf)?;
        self.enc.xorps(X15, a)?;
        self.enc.andnps(X0, X15)?;
        self.enc.xorps(X0, a)?;
        self.flush_xmm(dst, part, X0)
    }

    fn op_bitwise(&mut self, inst: &Inst) -> Result<()> {
        let (dst, s0, s1) = (inst.dst, inst.srcs[0], inst.srcs[1]);
        if self.is_gp(dst) {
            return match inst.op {
                Op::And => self.gp_binop(dst, s0, s1, |e, d, b| e.and32_rr(d, b)),
                Op::Or => self.gp_binop(dst, s0, s1, |e, d, b| e.or32_rr(d, b)),
                _ => self.gp_binop(dst, s0, s1, |e, d, b| e.xor32_rr(d, b)),
            };
        }
        for part in 0..self.parts(dst) {
            match inst.op {
                Op::And => self.xmm_binop(dst, part, s0, s1, |e, d, b| e.pand(d, b))?,
                Op::Or => self.xmm_binop(dst, part, s0, s1, |e, d, b| e.por(d, b))?,
                _ => self.xmm_binop(dst, part, s0, s1, |e, d, b| e.pxor(d, b))?,
            }
        }
        Ok(())
    }

    fn op_not(&mut self, inst: &Inst) -> Result<()> {
        let (dst, src) = (inst.dst, inst.srcs[0]);
        let info = self.info(dst);
        if self.is_gp(dst) {
            let a = self.take_gp(src, RAX)?;
            let d = self.gp_out(dst);
            if d != a {
                self.enc.mov32_rr(d, a)?;
            }
            if info.kind == TypeKind::Bool {
                self.enc.xor32_ri(d, 1)?;
            } else {
                self.enc.not32(d)?;
            }
            return self.flush_gp(dst, d);
        }
        for part in 0..self.parts(dst) {
            let a = self.take_xmm(src, part, X14)?;
            self.enc.pcmpeqd(X0, X0)?;
            self.enc.pxor(X0, a)?;
            self.flush_xmm(dst, part, X0)?;
        }
        Ok(())
    }

    fn op_shift(&mut self, inst: &Inst) -> Result<()> {
        let (dst, s0, s1) = (inst.dst, inst.srcs[0], inst.srcs[1]);
        if self.is_gp(dst) {
            let a = self.take_gp(s0, RAX)?;
            let c = self.take_gp(s1, R11)?;
            self.enc.push64(RCX)?;
            if a != RAX {
                self.enc.mov32_rr(RAX, a)?;
            }
            if c != RCX {
                self.enc.mov32_rr(RCX, c)?;
            }
            if inst.op == Op::Shl {
                self.enc.shl32_cl(RAX)?;
            } else {
                self.enc.sar32_cl(RAX)?;
            }
            self.enc.pop64(RCX)?;
            return self.flush_gp(dst, RAX);
        }
        // Vector shift by a scalar count.
        let a = self.take_xmm(s0, 0, X14)?;
        let c = self.take_gp(s1, RAX)?;
        self.enc.movd_xr(X0, c)?;
        if a != X15 {
            self.enc.movaps_rr(X15, a)?;
        }
        if inst.op == Op::Shl {
            self.enc.pslld_x(X15, X0)?;
        } else {
            self.enc.psrad_x(X15, X0)?;
        }
        self.flush_xmm(dst, 0, X15)
    }

    fn op_cmp(&mut self, inst: &Inst) -> Result<()> {
        let (dst, s0, s1) = (inst.dst, inst.srcs[0], inst.srcs[1]);
        let operand = self.info(s0);

        // Scalar comparisons produce a 0/1 bool in a GP register.
        if operand.is_scalar() {
            if matches!(operand.kind, TypeKind::Int | TypeKind::Bool) {
                let a = self.take_gp(s0, RAX)?;
                let b = self.take_gp(s1, R11)?;
                self.enc.cmp32_rr(a, b)?;
                let cond = match inst.op {
                    Op::CmpEq => Cond::Eq,
                    Op::CmpNe => Cond::Ne,
                    Op::CmpLt => Cond::Lt,
                    Op::CmpLe => Cond::Le,
                    Op::CmpGt => Cond::Gt,
                    _ => Cond::Ge,
                };
                self.enc.setcc8(cond, RAX)?;
                self.enc.movzx8_32(RAX, RAX)?;
                return self.flush_gp(dst, RAX);
            }
            // Floats: comiss/comisd with NaN-correct orderings.
            let a = self.take_xmm(s0, 0, X14)?;
            let b = self.take_xmm(s1, 0, X15)?;
            let is_double = operand.kind == TypeKind::Double;
            let (lhs, rhs, cond) = match inst.op {
                Op::CmpGt => (a, b, Cond::Above),
                Op::CmpGe => (a, b, Cond::AboveEq),
                Op::CmpLt => (b, a, Cond::Above),
                Op::CmpLe => (b, a, Cond::AboveEq),
                Op::CmpEq => (a, b, Cond::Eq),
                _ => (a, b, Cond::Ne),
            };
            if is_double {
                self.enc.comisd(lhs, rhs)?;
            } else {
                self.enc.comiss(lhs, rhs)?;
            }
            match inst.op {
                Op::CmpEq => {
                    self.enc.setcc8(Cond::Eq, RAX)?;
                    self.enc.setcc8(Cond::NoParity, R11)?;
                    self.enc.and8_rr(RAX, R11)?;
                }
                Op::CmpNe => {
                    self.enc.setcc8(Cond::Ne, RAX)?;
                    self.enc.setcc8(Cond::Parity, R11)?;
                    self.enc.or8_rr(RAX, R11)?;
                }
                _ => self.enc.setcc8(cond, RAX)?,
            }
            self.enc.movzx8_32(RAX, RAX)?;
            return self.flush_gp(dst, RAX);
        }

        // Vector comparisons produce lane masks.
        match operand.kind {
            TypeKind::Int | TypeKind::Bool => {
                let a = self.take_xmm(s0, 0, X14)?;
                let b = self.take_xmm(s1, 0, X15)?;
                match inst.op {
                    Op::CmpEq | Op::CmpNe => {
                        self.enc.movaps_rr(X0, a)?;
                        self.enc.pcmpeqd(X0, b)?;
                        if inst.op == Op::CmpNe {
                            self.enc.pcmpeqd(X15, X15)?;
                            self.enc.pxor(X0, X15)?;
                        }
                    }
                    Op::CmpGt | Op::CmpLe => {
                        self.enc.movaps_rr(X0, a)?;
                        self.enc.pcmpgtd(X0, b)?;
                        if inst.op == Op::CmpLe {
                            self.enc.pcmpeqd(X15, X15)?;
                            self.enc.pxor(X0, X15)?;
                        }
                    }
                    _ => {
                        // Lt / Ge via the swapped compare.
                        self.enc.movaps_rr(X0, b)?;
                        self.enc.pcmpgtd(X0, a)?;
                        if inst.op == Op::CmpGe {
                            self.enc.pcmpeqd(X15, X15)?;
                            self.enc.pxor(X0, X15)?;
                        }
                    }
                }
                self.flush_xmm(dst, 0, X0)
            }
            TypeKind::Float => {
                let a = self.take_xmm(s0, 0, X14)?;
                let b = self.take_xmm(s1, 0, X15)?;
                let (first, second, pred) = match inst.op {
                    Op::CmpEq => (a, b, 0),
                    Op::CmpNe => (a, b, 4),
                    Op::CmpLt => (a, b, 1),
                    Op::CmpLe => (a, b, 2),
                    Op::CmpGt => (b, a, 1),
                    _ => (b, a, 2),
                };
                if first != X0 {
                    self.enc.movaps_rr(X0, first)?;
                }
                self.enc.cmpps_imm(X0, second, pred)?;
                self.flush_xmm(dst, 0, X0)
            }
            TypeKind::Double => {
                // Per-part qword masks, repacked into dword lanes so bool
                // vectors have one canonical layout.
                let parts = self.parts(s0);
                let buf = self.lane_buf;
                for part in 0..parts {
                    let a = self.take_xmm(s0, part, X14)?;
                    let b = self.take_xmm(s1, part, X15)?;
                    let (first, second, pred) = match inst.op {
                        Op::CmpEq => (a, b, 0),
                        Op::CmpNe => (a, b, 4),
                        Op::CmpLt => (a, b, 1),
                        Op::CmpLe => (a, b, 2),
                        Op::CmpGt => (b, a, 1),
                        _ => (b, a, 2),
                    };
                    if first != X0 {
                        self.enc.movaps_rr(X0, first)?;
                    }
                    self.enc.cmppd_imm(X0, second, pred)?;
                    self.enc.pshufd_imm(X0, X0, 0x08)?;
                    self.enc.movsd_mx(RBP, buf + 8 * part as i32, X0)?;
                }
                let d = self.xmm_out(dst, 0);
                if parts == 1 {
                    self.enc.movsd_xm(d, RBP, buf)?;
                } else {
                    self.enc.movups_xm(d, RBP, buf)?;
                }
                self.flush_xmm(dst, 0, d)
            }
            _ => Err(Error::JitFailed("compare of unsupported kind")),
        }
    }

    fn op_select(&mut self, inst: &Inst) -> Result<()> {
        let (dst, mask, a, b) = (inst.dst, inst.srcs[0], inst.srcs[1], inst.srcs[2]);
        let info = self.info(dst);
        let is_double = info.kind == TypeKind::Double;

        for part in 0..self.parts(dst) {
            // The mask is dword-packed; double shapes need qword masks.
            let m = self.take_xmm(mask, 0, X0)?;
            if is_double {
                let sel = if part == 0 { 0x50 } else { 0xFA };
                self.enc.pshufd_imm(X0, m, sel)?;
            } else if m != X0 {
                self.enc.movaps_rr(X0, m)?;
            }

            let av = self.take_xmm(a, part, X14)?;
            let bv = self.take_xmm(b, part, X15)?;

            if self.sse41 {
                if bv != X15 {
                    self.enc.movaps_rr(X15, bv)?;
                }
                match info.kind {
                    TypeKind::Float => self.enc.blendvps(X15, av)?,
                    TypeKind::Double => self.enc.blendvpd(X15, av)?,
                    _ => self.enc.pblendvb(X15, av)?,
                }
                self.flush_xmm(dst, part, X15)?;
            } else {
                // res = b ^ ((a^b) & mask)
                if av != X14 {
                    self.enc.movaps_rr(X14, av)?;
                }
                self.enc.pxor(X14, bv)?;
                self.enc.pand(X14, X0)?;
                self.enc.pxor(X14, bv)?;
                self.flush_xmm(dst, part, X14)?;
            }
        }
        Ok(())
    }

    fn op_cast(&mut self, inst: &Inst) -> Result<()> {
        let (dst, src) = (inst.dst, inst.srcs[0]);
        let from = self.info(src);
        let to = self.info(dst);

        match (from.kind, to.kind) {
            (TypeKind::Int, TypeKind::Float) => {
                if from.is_scalar() {
                    let s = self.take_gp(src, RAX)?;
                    let d = self.xmm_out(dst, 0);
                    self.enc.cvtsi2ss(d, s)?;
                    self.flush_xmm(dst, 0, d)
                } else {
                    self.xmm_unop(dst, 0, src, 0, |e, d, a| e.cvtdq2ps(d, a))
                }
            }
            (TypeKind::Float, TypeKind::Int) => {
                if from.is_scalar() {
                    let s = self.take_xmm(src, 0, X14)?;
                    let d = self.gp_out(dst);
                    self.enc.cvttss2si(d, s)?;
                    self.flush_gp(dst, d)
                } else {
                    self.xmm_unop(dst, 0, src, 0, |e, d, a| e.cvttps2dq(d, a))
                }
            }
            (TypeKind::Int, TypeKind::Double) => {
                if from.is_scalar() {
                    let s = self.take_gp(src, RAX)?;
                    let d = self.xmm_out(dst, 0);
                    self.enc.cvtsi2sd(d, s)?;
                    self.flush_xmm(dst, 0, d)
                } else if to.lanes <= 2 {
                    self.xmm_unop(dst, 0, src, 0, |e, d, a| e.cvtdq2pd(d, a))
                } else {
                    let s = self.take_xmm(src, 0, X14)?;
                    let d = self.xmm_out(dst, 0);
                    self.enc.cvtdq2pd(d, s)?;
                    self.flush_xmm(dst, 0, d)?;
                    let s = self.take_xmm(src, 0, X14)?;
                    self.enc.pshufd_imm(X0, s, 0x0E)?;
                    let d = self.xmm_out(dst, 1);
                    self.enc.cvtdq2pd(d, X0)?;
                    self.flush_xmm(dst, 1, d)
                }
            }
            (TypeKind::Double, TypeKind::Int) => {
                if from.is_scalar() {
                    let s = self.take_xmm(src, 0, X14)?;
                    let d = self.gp_out(dst);
                    self.enc.cvttsd2si(d, s)?;
                    self.flush_gp(dst, d)
                } else if from.lanes <= 2 {
                    self.xmm_unop(dst, 0, src, 0, |e, d, a| e.cvttpd2dq(d, a))
                } else {
                    let p0 = self.take_xmm(src, 0, X14)?;
                    self.enc.cvttpd2dq(X0, p0)?;
                    let p1 = self.take_xmm(src, 1, X14)?;
                    self.enc.cvttpd2dq(X15, p1)?;
                    self.enc.punpcklqdq(X0, X15)?;
                    self.flush_xmm(dst, 0, X0)
                }
            }
            (TypeKind::Float, TypeKind::Double) => {
                if from.is_scalar() {
                    self.xmm_unop(dst, 0, src, 0, |e, d, a| e.cvtss2sd(d, a))
                } else if to.lanes <= 2 {
                    self.xmm_unop(dst, 0, src, 0, |e, d, a| e.cvtps2pd(d, a))
                } else {
                    let s = self.take_xmm(src, 0, X14)?;
                    let d = self.xmm_out(dst, 0);
                    self.enc.cvtps2pd(d, s)?;
                    self.flush_xmm(dst, 0, d)?;
                    let s = self.take_xmm(src, 0, X14)?;
                    self.enc.pshufd_imm(X0, s, 0x0E)?;
                    let d = self.xmm_out(dst, 1);
                    self.enc.cvtps2pd(d, X0)?;
                    self.flush_xmm(dst, 1, d)
                }
            }
            (TypeKind::Double, TypeKind::Float) => {
                if from.is_scalar() {
                    self.xmm_unop(dst, 0, src, 0, |e, d, a| e.cvtsd2ss(d, a))
                } else if from.lanes <= 2 {
                    self.xmm_unop(dst, 0, src, 0, |e, d, a| e.cvtpd2ps(d, a))
                } else {
                    let p0 = self.take_xmm(src, 0, X14)?;
                    self.enc.cvtpd2ps(X0, p0)?;
                    let p1 = self.take_xmm(src, 1, X14)?;
                    self.enc.cvtpd2ps(X15, p1)?;
                    self.enc.movlhps(X0, X15)?;
                    self.flush_xmm(dst, 0, X0)
                }
            }
            _ => Err(Error::JitFailed("unsupported conversion")),
        }
    }

    fn op_hsum(&mut self, inst: &Inst) -> Result<()> {
        let (dst, src) = (inst.dst, inst.srcs[0]);
        let src_info = self.info(src);

        if src_info.kind == TypeKind::Double {
            let p0 = self.take_xmm(src, 0, X14)?;
            self.enc.movaps_rr(X0, p0)?;
            match src_info.lanes {
                2 => {
                    self.enc.pshufd_imm(X15, X0, 0x0E)?;
                    self.enc.addsd(X0, X15)?;
                }
                3 => {
                    self.enc.pshufd_imm(X15, X0, 0x0E)?;
                    self.enc.addsd(X0, X15)?;
                    let p1 = self.take_xmm(src, 1, X14)?;
                    self.enc.addsd(X0, p1)?;
                }
                _ => {
                    let p1 = self.take_xmm(src, 1, X14)?;
                    self.enc.addpd(X0, p1)?;
                    self.enc.pshufd_imm(X15, X0, 0x0E)?;
                    self.enc.addsd(X0, X15)?;
                }
            }
            return self.flush_xmm(dst, 0, X0);
        }

        let a = self.take_xmm(src, 0, X14)?;
        self.enc.movaps_rr(X0, a)?;
        if src_info.lanes == 3 {
            // Lane 3 may hold junk from padded loads; zero it first.
            let mask = self.magic(lane3_mask());
            self.enc.movups_x_label(X15, mask)?;
            self.enc.andps(X0, X15)?;
        }
        if src_info.lanes == 2 {
            self.enc.pshufd_imm(X15, X0, 0x01)?;
            self.enc.addss(X0, X15)?;
        } else {
            self.enc.movaps_rr(X15, X0)?;
            self.enc.movhlps(X15, X0)?;
            self.enc.addps(X0, X15)?;
            self.enc.pshufd_imm(X15, X0, 0x01)?;
            self.enc.addss(X0, X15)?;
        }
        self.flush_xmm(dst, 0, X0)
    }
}

fn lane3_mask() -> [u8; 16] {
    let mut bytes = [0xFFu8; 16];
    bytes[12..].fill(0);
    bytes
}

/// Disassembles generated code for the `Asm` debug dump.
pub fn disassemble(bytes: &[u8], ip: u64) -> String {
    use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};
    use std::fmt::Write as _;

    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut text = String::new();
    let mut line = String::new();
    let mut instruction = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        line.clear();
        formatter.format(&instruction, &mut line);
        let _ = writeln!(text, "{:016x} {}", instruction.ip(), line);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::pass;
    use crate::ir::{Inst, Term, VRegInfo};

    fn run_to_code(func: &mut Func, sse41: bool) -> CompiledCode {
        let info = pass::run(func).unwrap();
        CodeGenerator::generate(func, &info, sse41).unwrap()
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn stores_scalar_float_result() {
        // main(out): out[0] = 7.0f
        let mut func = Func::new(1);
        let b0 = func.new_block();
        let v = func.new_vreg(VRegInfo::scalar(TypeKind::Float));
        func.push(b0, Inst::new(Op::Imm, v, &[]).with_imm(7.0f32.to_bits() as i64));
        func.push(b0, Inst::new(Op::StoreArg, VReg::NONE, &[v]).with_a(0));
        func.seal(b0, Term::Ret);

        let code = run_to_code(&mut func, false);
        let mut out = [0f32; 1];
        let f: extern "C" fn(*mut f32) =
            unsafe { std::mem::transmute(code.memory.entry()) };
        f(out.as_mut_ptr());
        assert_eq!(out[0], 7.0);
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn vector_add_and_store() {
        // out.v = in.v + in.v (float4 at offset 0)
        let mut func = Func::new(2);
        let b0 = func.new_block();
        let v4 = VRegInfo { kind: TypeKind::Float, lanes: 4 };
        let a = func.new_vreg(v4);
        let sum = func.new_vreg(v4);
        func.push(b0, Inst::new(Op::LoadArg, a, &[]).with_a(0));
        func.push(b0, Inst::new(Op::Add, sum, &[a, a]));
        func.push(b0, Inst::new(Op::StoreArg, VReg::NONE, &[sum]).with_a(1));
        func.seal(b0, Term::Ret);

        let code = run_to_code(&mut func, false);
        let input = [1.0f32, 2.0, 3.0, 4.0];
        let mut output = [0f32; 4];
        let f: extern "C" fn(*const f32, *mut f32) =
            unsafe { std::mem::transmute(code.memory.entry()) };
        f(input.as_ptr(), output.as_mut_ptr());
        assert_eq!(output, [2.0, 4.0, 6.0, 8.0]);
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn branch_and_integer_compare() {
        // out[0] = in[0] > 0 ? 1 : -1
        let mut func = Func::new(2);
        let b0 = func.new_block();
        let b_then = func.new_block();
        let b_else = func.new_block();

        let x = func.new_vreg(VRegInfo::scalar(TypeKind::Int));
        let zero = func.new_vreg(VRegInfo::scalar(TypeKind::Int));
        let cond = func.new_vreg(VRegInfo::scalar(TypeKind::Bool));
        func.push(b0, Inst::new(Op::LoadArg, x, &[]).with_a(0));
        func.push(b0, Inst::new(Op::Imm, zero, &[]).with_imm(0));
        func.push(b0, Inst::new(Op::CmpGt, cond, &[x, zero]));
        func.seal(b0, Term::Branch { cond, then_block: b_then, else_block: b_else });

        let one = func.new_vreg(VRegInfo::scalar(TypeKind::Int));
        func.push(b_then, Inst::new(Op::Imm, one, &[]).with_imm(1));
        func.push(b_then, Inst::new(Op::StoreArg, VReg::NONE, &[one]).with_a(1));
        func.seal(b_then, Term::Ret);

        let neg = func.new_vreg(VRegInfo::scalar(TypeKind::Int));
        func.push(b_else, Inst::new(Op::Imm, neg, &[]).with_imm(-1));
        func.push(b_else, Inst::new(Op::StoreArg, VReg::NONE, &[neg]).with_a(1));
        func.seal(b_else, Term::Ret);

        let code = run_to_code(&mut func, false);
        let f: extern "C" fn(*const i32, *mut i32) =
            unsafe { std::mem::transmute(code.memory.entry()) };

        let mut out = 0i32;
        f(&5, &mut out);
        assert_eq!(out, 1);
        f(&0, &mut out);
        assert_eq!(out, -1);
    }

    #[test]
    fn deterministic_bytes() {
        let build = || {
            let mut func = Func::new(1);
            let b0 = func.new_block();
            let v4 = VRegInfo { kind: TypeKind::Float, lanes: 4 };
            let a = func.new_vreg(v4);
            let b = func.new_vreg(v4);
            func.push(b0, Inst::new(Op::LoadArg, a, &[]).with_a(0));
            func.push(b0, Inst::new(Op::Mul, b, &[a, a]));
            func.push(b0, Inst::new(Op::StoreArg, VReg::NONE, &[b]).with_a(0));
            func.seal(b0, Term::Ret);
            func
        };
        let code1 = run_to_code(&mut build(), false);
        let code2 = run_to_code(&mut build(), false);
        assert_eq!(code1.bytes, code2.bytes);
    }
}
