//! x86-64 instruction encoding using iced-x86.
//!
//! [`X64Encoder`] wraps the iced-x86 `CodeAssembler` behind typed
//! methods over [`AsmReg`] operands, manages one label per basic block
//! so forward and backward jumps resolve automatically, and emits the
//! constant pool as `db` data labeled per 16-byte half. Reg-reg vector
//! moves are collapsed to `movaps` and 16/8/4-byte memory accesses to
//! `movups`/`movsd`/`movss`; the remaining methods exist only where the
//! selector actually needs a distinct mnemonic. `finalize` assembles at
//! the target virtual address so RIP-relative pool references land on
//! stable offsets for the life of the program.

use crate::error::{Error, Result};
use crate::x64::regalloc::AsmReg;
use iced_x86::code_asm::{
    byte_ptr, dword_ptr, qword_ptr, xmmword_ptr, AsmRegister32, AsmRegister64, AsmRegister8,
    AsmRegisterXmm, CodeAssembler, CodeLabel,
};
use iced_x86::IcedError;
use std::collections::HashMap;

/// Condition codes used by jumps, set-byte and conditional moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Unsigned orderings, used after comiss/comisd.
    Above,
    AboveEq,
    Below,
    BelowEq,
    Parity,
    NoParity,
}

fn err(_: IcedError) -> Error {
    Error::JitFailed("instruction encoding failed")
}

const GP64: [AsmRegister64; 16] = {
    use iced_x86::code_asm::registers::gpr64::*;
    [rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15]
};

const GP32: [AsmRegister32; 16] = {
    use iced_x86::code_asm::registers::gpr32::*;
    [eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d]
};

const GP8: [AsmRegister8; 16] = {
    use iced_x86::code_asm::registers::gpr8::*;
    [al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b]
};

const XMM: [AsmRegisterXmm; 16] = {
    use iced_x86::code_asm::registers::xmm::*;
    [
        xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12,
        xmm13, xmm14, xmm15,
    ]
};

pub struct X64Encoder {
    asm: CodeAssembler,
    block_labels: HashMap<usize, CodeLabel>,
    placed_blocks: Vec<usize>,
}

impl X64Encoder {
    pub fn new() -> Result<X64Encoder> {
        Ok(X64Encoder {
            asm: CodeAssembler::new(64).map_err(err)?,
            block_labels: HashMap::new(),
            placed_blocks: Vec::new(),
        })
    }

    fn gp64(&self, reg: AsmReg) -> AsmRegister64 {
        debug_assert_eq!(reg.bank, 0);
        GP64[reg.id as usize]
    }

    fn gp32(&self, reg: AsmReg) -> AsmRegister32 {
        debug_assert_eq!(reg.bank, 0);
        GP32[reg.id as usize]
    }

    fn gp8(&self, reg: AsmReg) -> AsmRegister8 {
        debug_assert_eq!(reg.bank, 0);
        GP8[reg.id as usize]
    }

    fn xmm(&self, reg: AsmReg) -> AsmRegisterXmm {
        debug_assert_eq!(reg.bank, 1);
        XMM[reg.id as usize]
    }

    /// Number of instructions emitted so far; the size estimator
    /// multiplies this by the maximum instruction length.
    pub fn instruction_count(&self) -> usize {
        self.asm.instructions().len()
    }

    // ==== labels ====

    pub fn block_label(&mut self, block: usize) -> CodeLabel {
        if let Some(&label) = self.block_labels.get(&block) {
            return label;
        }
        let label = self.asm.create_label();
        self.block_labels.insert(block, label);
        label
    }

    pub fn place_block_label(&mut self, block: usize) -> Result<()> {
        let mut label = self.block_label(block);
        self.asm.set_label(&mut label).map_err(err)?;
        self.placed_blocks.push(block);
        Ok(())
    }

    pub fn new_label(&mut self) -> CodeLabel {
        self.asm.create_label()
    }

    pub fn place_label(&mut self, label: &mut CodeLabel) -> Result<()> {
        self.asm.set_label(label).map_err(err)
    }

    pub fn db(&mut self, data: &[u8]) -> Result<()> {
        self.asm.db(data).map_err(err)
    }

    /// Assembles everything at `base` and returns the final bytes.
    pub fn finalize(&mut self, base: u64) -> Result<Vec<u8>> {
        // Pin any label that was referenced but never placed. Blocks are
        // visited in index order to keep the output deterministic.
        let mut unplaced: Vec<usize> = self
            .block_labels
            .keys()
            .copied()
            .filter(|b| !self.placed_blocks.contains(b))
            .collect();
        unplaced.sort_unstable();
        for block in unplaced {
            let mut label = self.block_labels[&block];
            self.asm.set_label(&mut label).map_err(err)?;
            self.asm.nop().map_err(err)?;
        }
        self.asm.assemble(base).map_err(err)
    }

    // ==== control flow ====

    pub fn jmp_block(&mut self, block: usize) -> Result<()> {
        let label = self.block_label(block);
        self.asm.jmp(label).map_err(err)
    }

    pub fn jcc_block(&mut self, cond: Cond, block: usize) -> Result<()> {
        let label = self.block_label(block);
        match cond {
            Cond::Eq => self.asm.je(label),
            Cond::Ne => self.asm.jne(label),
            Cond::Lt => self.asm.jl(label),
            Cond::Le => self.asm.jle(label),
            Cond::Gt => self.asm.jg(label),
            Cond::Ge => self.asm.jge(label),
            Cond::Above => self.asm.ja(label),
            Cond::AboveEq => self.asm.jae(label),
            Cond::Below => self.asm.jb(label),
            Cond::BelowEq => self.asm.jbe(label),
            Cond::Parity => self.asm.jp(label),
            Cond::NoParity => self.asm.jnp(label),
        }
        .map_err(err)
    }

    pub fn ret(&mut self) -> Result<()> {
        self.asm.ret().map_err(err)
    }

    // ==== general purpose ====

    pub fn push64(&mut self, reg: AsmReg) -> Result<()> {
        self.asm.push(self.gp64(reg)).map_err(err)
    }

    pub fn pop64(&mut self, reg: AsmReg) -> Result<()> {
        self.asm.pop(self.gp64(reg)).map_err(err)
    }

    pub fn mov64_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.mov(self.gp64(dst), self.gp64(src)).map_err(err)
    }

    pub fn mov64_ri(&mut self, dst: AsmReg, imm: i64) -> Result<()> {
        self.asm.mov(self.gp64(dst), imm).map_err(err)
    }

    pub fn mov64_rm(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<()> {
        self.asm
            .mov(self.gp64(dst), qword_ptr(self.gp64(base) + disp))
            .map_err(err)
    }

    pub fn mov64_mr(&mut self, base: AsmReg, disp: i32, src: AsmReg) -> Result<()> {
        self.asm
            .mov(qword_ptr(self.gp64(base) + disp), self.gp64(src))
            .map_err(err)
    }

    pub fn mov32_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.mov(self.gp32(dst), self.gp32(src)).map_err(err)
    }

    pub fn mov32_ri(&mut self, dst: AsmReg, imm: i32) -> Result<()> {
        self.asm.mov(self.gp32(dst), imm).map_err(err)
    }

    pub fn mov32_rm(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<()> {
        self.asm
            .mov(self.gp32(dst), dword_ptr(self.gp64(base) + disp))
            .map_err(err)
    }

    pub fn mov32_mr(&mut self, base: AsmReg, disp: i32, src: AsmReg) -> Result<()> {
        self.asm
            .mov(dword_ptr(self.gp64(base) + disp), self.gp32(src))
            .map_err(err)
    }

    pub fn mov32_rm_idx(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        index: AsmReg,
        scale: u32,
        disp: i32,
    ) -> Result<()> {
        self.asm
            .mov(
                self.gp32(dst),
                dword_ptr(self.gp64(base) + self.gp64(index) * scale + disp),
            )
            .map_err(err)
    }

    pub fn mov32_mr_idx(
        &mut self,
        base: AsmReg,
        index: AsmReg,
        scale: u32,
        disp: i32,
        src: AsmReg,
    ) -> Result<()> {
        self.asm
            .mov(
                dword_ptr(self.gp64(base) + self.gp64(index) * scale + disp),
                self.gp32(src),
            )
            .map_err(err)
    }

    pub fn add32_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.add(self.gp32(dst), self.gp32(src)).map_err(err)
    }

    pub fn add64_ri(&mut self, dst: AsmReg, imm: i32) -> Result<()> {
        self.asm.add(self.gp64(dst), imm).map_err(err)
    }

    pub fn sub32_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.sub(self.gp32(dst), self.gp32(src)).map_err(err)
    }

    pub fn sub64_ri(&mut self, dst: AsmReg, imm: i32) -> Result<()> {
        self.asm.sub(self.gp64(dst), imm).map_err(err)
    }

    pub fn imul32_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.imul_2(self.gp32(dst), self.gp32(src)).map_err(err)
    }

    pub fn neg32(&mut self, dst: AsmReg) -> Result<()> {
        self.asm.neg(self.gp32(dst)).map_err(err)
    }

    pub fn not32(&mut self, dst: AsmReg) -> Result<()> {
        self.asm.not(self.gp32(dst)).map_err(err)
    }

    pub fn and32_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.and(self.gp32(dst), self.gp32(src)).map_err(err)
    }

    pub fn and32_ri(&mut self, dst: AsmReg, imm: i32) -> Result<()> {
        self.asm.and(self.gp32(dst), imm).map_err(err)
    }

    pub fn or32_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.or(self.gp32(dst), self.gp32(src)).map_err(err)
    }

    pub fn xor32_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.xor(self.gp32(dst), self.gp32(src)).map_err(err)
    }

    pub fn xor32_ri(&mut self, dst: AsmReg, imm: i32) -> Result<()> {
        self.asm.xor(self.gp32(dst), imm).map_err(err)
    }

    pub fn sar32_ri(&mut self, dst: AsmReg, imm: u32) -> Result<()> {
        self.asm.sar(self.gp32(dst), imm).map_err(err)
    }

    pub fn shl32_cl(&mut self, dst: AsmReg) -> Result<()> {
        use iced_x86::code_asm::registers::gpr8::cl;
        self.asm.shl(self.gp32(dst), cl).map_err(err)
    }

    pub fn sar32_cl(&mut self, dst: AsmReg) -> Result<()> {
        use iced_x86::code_asm::registers::gpr8::cl;
        self.asm.sar(self.gp32(dst), cl).map_err(err)
    }

    pub fn cmp32_rr(&mut self, lhs: AsmReg, rhs: AsmReg) -> Result<()> {
        self.asm.cmp(self.gp32(lhs), self.gp32(rhs)).map_err(err)
    }

    pub fn test32_rr(&mut self, lhs: AsmReg, rhs: AsmReg) -> Result<()> {
        self.asm.test(self.gp32(lhs), self.gp32(rhs)).map_err(err)
    }

    pub fn cdq(&mut self) -> Result<()> {
        self.asm.cdq().map_err(err)
    }

    pub fn idiv32_r(&mut self, divisor: AsmReg) -> Result<()> {
        self.asm.idiv(self.gp32(divisor)).map_err(err)
    }

    pub fn idiv32_m(&mut self, base: AsmReg, disp: i32) -> Result<()> {
        self.asm
            .idiv(dword_ptr(self.gp64(base) + disp))
            .map_err(err)
    }

    pub fn cmovcc32(&mut self, cond: Cond, dst: AsmReg, src: AsmReg) -> Result<()> {
        let (d, s) = (self.gp32(dst), self.gp32(src));
        match cond {
            Cond::Eq => self.asm.cmove(d, s),
            Cond::Ne => self.asm.cmovne(d, s),
            Cond::Lt => self.asm.cmovl(d, s),
            Cond::Le => self.asm.cmovle(d, s),
            Cond::Gt => self.asm.cmovg(d, s),
            Cond::Ge => self.asm.cmovge(d, s),
            Cond::Above => self.asm.cmova(d, s),
            Cond::AboveEq => self.asm.cmovae(d, s),
            Cond::Below => self.asm.cmovb(d, s),
            Cond::BelowEq => self.asm.cmovbe(d, s),
            Cond::Parity => self.asm.cmovp(d, s),
            Cond::NoParity => self.asm.cmovnp(d, s),
        }
        .map_err(err)
    }

    /// SETcc into the destination's low byte; the caller zero-extends.
    pub fn setcc8(&mut self, cond: Cond, dst: AsmReg) -> Result<()> {
        let d = self.gp8(dst);
        match cond {
            Cond::Eq => self.asm.sete(d),
            Cond::Ne => self.asm.setne(d),
            Cond::Lt => self.asm.setl(d),
            Cond::Le => self.asm.setle(d),
            Cond::Gt => self.asm.setg(d),
            Cond::Ge => self.asm.setge(d),
            Cond::Above => self.asm.seta(d),
            Cond::AboveEq => self.asm.setae(d),
            Cond::Below => self.asm.setb(d),
            Cond::BelowEq => self.asm.setbe(d),
            Cond::Parity => self.asm.setp(d),
            Cond::NoParity => self.asm.setnp(d),
        }
        .map_err(err)
    }

    pub fn movzx8_32(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.movzx(self.gp32(dst), self.gp8(src)).map_err(err)
    }

    pub fn and8_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.and(self.gp8(dst), self.gp8(src)).map_err(err)
    }

    pub fn or8_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.or(self.gp8(dst), self.gp8(src)).map_err(err)
    }

    pub fn mov8_mr(&mut self, base: AsmReg, disp: i32, src: AsmReg) -> Result<()> {
        self.asm
            .mov(byte_ptr(self.gp64(base) + disp), self.gp8(src))
            .map_err(err)
    }

    // ==== GP <-> XMM ====

    pub fn movd_xr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.movd(self.xmm(dst), self.gp32(src)).map_err(err)
    }

    pub fn movd_rx(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.movd(self.gp32(dst), self.xmm(src)).map_err(err)
    }

    pub fn movq_xr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.movq(self.xmm(dst), self.gp64(src)).map_err(err)
    }

    // ==== XMM moves ====

    /// Reg-reg vector move; `movaps` carries any 128-bit payload.
    pub fn movaps_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.movaps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn movups_xm(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<()> {
        self.asm
            .movups(self.xmm(dst), xmmword_ptr(self.gp64(base) + disp))
            .map_err(err)
    }

    pub fn movups_mx(&mut self, base: AsmReg, disp: i32, src: AsmReg) -> Result<()> {
        self.asm
            .movups(xmmword_ptr(self.gp64(base) + disp), self.xmm(src))
            .map_err(err)
    }

    pub fn movups_x_label(&mut self, dst: AsmReg, label: CodeLabel) -> Result<()> {
        self.asm
            .movups(self.xmm(dst), xmmword_ptr(label))
            .map_err(err)
    }

    pub fn movss_xm(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<()> {
        self.asm
            .movss(self.xmm(dst), dword_ptr(self.gp64(base) + disp))
            .map_err(err)
    }

    pub fn movss_mx(&mut self, base: AsmReg, disp: i32, src: AsmReg) -> Result<()> {
        self.asm
            .movss(dword_ptr(self.gp64(base) + disp), self.xmm(src))
            .map_err(err)
    }

    pub fn movss_xm_idx(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        index: AsmReg,
        scale: u32,
        disp: i32,
    ) -> Result<()> {
        self.asm
            .movss(
                self.xmm(dst),
                dword_ptr(self.gp64(base) + self.gp64(index) * scale + disp),
            )
            .map_err(err)
    }

    pub fn movsd_xm(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<()> {
        self.asm
            .movsd_2(self.xmm(dst), qword_ptr(self.gp64(base) + disp))
            .map_err(err)
    }

    pub fn movsd_mx(&mut self, base: AsmReg, disp: i32, src: AsmReg) -> Result<()> {
        self.asm
            .movsd_2(qword_ptr(self.gp64(base) + disp), self.xmm(src))
            .map_err(err)
    }

    pub fn movsd_xm_idx(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        index: AsmReg,
        scale: u32,
        disp: i32,
    ) -> Result<()> {
        self.asm
            .movsd_2(
                self.xmm(dst),
                qword_ptr(self.gp64(base) + self.gp64(index) * scale + disp),
            )
            .map_err(err)
    }

    pub fn movsd_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.movsd_2(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn movhpd_xm(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<()> {
        self.asm
            .movhpd(self.xmm(dst), qword_ptr(self.gp64(base) + disp))
            .map_err(err)
    }

    pub fn movlhps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.movlhps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn movhlps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.movhlps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    // ==== XMM arithmetic ====

    pub fn addps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.addps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn addss(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.addss(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn addpd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.addpd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn addsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.addsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn subps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.subps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn subss(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.subss(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn subpd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.subpd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn subsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.subsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn mulps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.mulps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn mulss(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.mulss(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn mulpd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.mulpd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn mulsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.mulsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn divps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.divps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn divss(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.divss(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn divpd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.divpd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn divsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.divsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn minps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.minps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn minss(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.minss(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn minpd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.minpd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn minsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.minsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn maxps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.maxps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn maxss(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.maxss(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn maxpd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.maxpd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn maxsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.maxsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn sqrtps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.sqrtps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn sqrtss(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.sqrtss(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn sqrtpd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.sqrtpd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn sqrtsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.sqrtsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn andps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.andps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn andnps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.andnps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn orps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.orps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn xorps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.xorps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pand(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pand(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pandn(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pandn(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn por(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.por(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pxor(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pxor(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn paddd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.paddd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn psubd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.psubd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pmuludq(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pmuludq(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pmulld(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pmulld(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pminsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pminsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pmaxsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pmaxsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pabsd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pabsd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pcmpeqd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pcmpeqd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pcmpgtd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pcmpgtd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn cmpps_imm(&mut self, dst: AsmReg, src: AsmReg, pred: u32) -> Result<()> {
        self.asm
            .cmpps(self.xmm(dst), self.xmm(src), pred)
            .map_err(err)
    }

    pub fn cmppd_imm(&mut self, dst: AsmReg, src: AsmReg, pred: u32) -> Result<()> {
        self.asm
            .cmppd(self.xmm(dst), self.xmm(src), pred)
            .map_err(err)
    }

    pub fn comiss(&mut self, lhs: AsmReg, rhs: AsmReg) -> Result<()> {
        self.asm.comiss(self.xmm(lhs), self.xmm(rhs)).map_err(err)
    }

    pub fn comisd(&mut self, lhs: AsmReg, rhs: AsmReg) -> Result<()> {
        self.asm.comisd(self.xmm(lhs), self.xmm(rhs)).map_err(err)
    }

    pub fn pshufd_imm(&mut self, dst: AsmReg, src: AsmReg, order: u32) -> Result<()> {
        self.asm
            .pshufd(self.xmm(dst), self.xmm(src), order)
            .map_err(err)
    }

    pub fn punpckldq(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm
            .punpckldq(self.xmm(dst), self.xmm(src))
            .map_err(err)
    }

    pub fn punpcklqdq(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm
            .punpcklqdq(self.xmm(dst), self.xmm(src))
            .map_err(err)
    }

    pub fn pslld_imm(&mut self, dst: AsmReg, imm: u32) -> Result<()> {
        self.asm.pslld(self.xmm(dst), imm).map_err(err)
    }

    pub fn psrld_imm(&mut self, dst: AsmReg, imm: u32) -> Result<()> {
        self.asm.psrld(self.xmm(dst), imm).map_err(err)
    }

    pub fn psllq_imm(&mut self, dst: AsmReg, imm: u32) -> Result<()> {
        self.asm.psllq(self.xmm(dst), imm).map_err(err)
    }

    pub fn psrlq_imm(&mut self, dst: AsmReg, imm: u32) -> Result<()> {
        self.asm.psrlq(self.xmm(dst), imm).map_err(err)
    }

    pub fn psrad_imm(&mut self, dst: AsmReg, imm: u32) -> Result<()> {
        self.asm.psrad(self.xmm(dst), imm).map_err(err)
    }

    pub fn pslld_x(&mut self, dst: AsmReg, count: AsmReg) -> Result<()> {
        self.asm.pslld(self.xmm(dst), self.xmm(count)).map_err(err)
    }

    pub fn psrad_x(&mut self, dst: AsmReg, count: AsmReg) -> Result<()> {
        self.asm.psrad(self.xmm(dst), self.xmm(count)).map_err(err)
    }

    // ==== conversions ====

    pub fn cvtdq2ps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.cvtdq2ps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn cvttps2dq(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm
            .cvttps2dq(self.xmm(dst), self.xmm(src))
            .map_err(err)
    }

    pub fn cvtdq2pd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.cvtdq2pd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn cvttpd2dq(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm
            .cvttpd2dq(self.xmm(dst), self.xmm(src))
            .map_err(err)
    }

    pub fn cvtps2pd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.cvtps2pd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn cvtpd2ps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.cvtpd2ps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn cvtsi2ss(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.cvtsi2ss(self.xmm(dst), self.gp32(src)).map_err(err)
    }

    pub fn cvtsi2sd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.cvtsi2sd(self.xmm(dst), self.gp32(src)).map_err(err)
    }

    pub fn cvttss2si(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm
            .cvttss2si(self.gp32(dst), self.xmm(src))
            .map_err(err)
    }

    pub fn cvttsd2si(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm
            .cvttsd2si(self.gp32(dst), self.xmm(src))
            .map_err(err)
    }

    pub fn cvtss2sd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.cvtss2sd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn cvtsd2ss(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.cvtsd2ss(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    // ==== SSE4.1 ====

    pub fn roundps_imm(&mut self, dst: AsmReg, src: AsmReg, mode: u32) -> Result<()> {
        self.asm
            .roundps(self.xmm(dst), self.xmm(src), mode)
            .map_err(err)
    }

    pub fn roundpd_imm(&mut self, dst: AsmReg, src: AsmReg, mode: u32) -> Result<()> {
        self.asm
            .roundpd(self.xmm(dst), self.xmm(src), mode)
            .map_err(err)
    }

    pub fn insertps_imm(&mut self, dst: AsmReg, src: AsmReg, sel: u32) -> Result<()> {
        self.asm
            .insertps(self.xmm(dst), self.xmm(src), sel)
            .map_err(err)
    }

    pub fn pinsrd_imm(&mut self, dst: AsmReg, src: AsmReg, lane: u32) -> Result<()> {
        self.asm
            .pinsrd(self.xmm(dst), self.gp32(src), lane)
            .map_err(err)
    }

    pub fn pextrd_imm(&mut self, dst: AsmReg, src: AsmReg, lane: u32) -> Result<()> {
        self.asm
            .pextrd(self.gp32(dst), self.xmm(src), lane)
            .map_err(err)
    }

    /// blendvps/blendvpd/pblendvb select by the sign bit of each lane of
    /// the implicit XMM0 operand.
    pub fn blendvps(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.blendvps(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn blendvpd(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.blendvpd(self.xmm(dst), self.xmm(src)).map_err(err)
    }

    pub fn pblendvb(&mut self, dst: AsmReg, src: AsmReg) -> Result<()> {
        self.asm.pblendvb(self.xmm(dst), self.xmm(src)).map_err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_basic_sequence() {
        let mut enc = X64Encoder::new().unwrap();
        let rax = AsmReg::new(0, 0);
        let rcx = AsmReg::new(0, 1);
        enc.mov32_ri(rax, 42).unwrap();
        enc.add32_rr(rax, rcx).unwrap();
        enc.ret().unwrap();
        let code = enc.finalize(0x1000).unwrap();
        assert!(!code.is_empty());
    }

    #[test]
    fn block_labels_resolve_forward_and_backward() {
        let mut enc = X64Encoder::new().unwrap();
        let rax = AsmReg::new(0, 0);
        enc.place_block_label(0).unwrap();
        enc.mov32_ri(rax, 1).unwrap();
        enc.jcc_block(Cond::Eq, 1).unwrap();
        enc.jmp_block(0).unwrap();
        enc.place_block_label(1).unwrap();
        enc.ret().unwrap();
        let code = enc.finalize(0x1000).unwrap();
        assert!(!code.is_empty());
    }

    #[test]
    fn xmm_round_trip_and_pool_label() {
        let mut enc = X64Encoder::new().unwrap();
        let xmm1 = AsmReg::new(1, 1);
        let xmm2 = AsmReg::new(1, 2);
        let mut pool = enc.new_label();
        enc.movups_x_label(xmm1, pool).unwrap();
        enc.addps(xmm1, xmm2).unwrap();
        enc.ret().unwrap();
        enc.place_label(&mut pool).unwrap();
        enc.db(&[0u8; 16]).unwrap();
        let code = enc.finalize(0x2000).unwrap();
        // 16 data bytes plus at least the three instructions.
        assert!(code.len() > 16);
    }
}
