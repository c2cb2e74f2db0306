// This module lowers one optimized IR block to x86-64 machine code for System V hosts. The
// generated function has the same block ABI as the AArch64 one: `extern "C" fn(*mut
// GuestState, *mut u8) -> u32`. The prologue pushes the callee-saved registers, keeps the
// stack 16-byte aligned for helper calls and parks the arguments in r14 (guest state) and r15
// (guest memory base). Operands are mapped through the register engine before any scratch
// register is touched; rax, rcx, rdx, xmm14 and xmm15 are free for the lowering after that.
//
// Most integer ops are two-operand on this host, so a result whose destination differs from
// the first source is computed in eax and copied out. Guest addresses are always formed in
// eax with 32-bit arithmetic, which zero-extends, and accessed as [r15 + rax]. Exits flush the
// engine first, load the return code into eax and jump to one shared label in front of the
// epilogue. Scalar multiply has no native lowering because the host produces a different NaN
// than the guest for infinity times zero; it goes through the interpreter thunk together
// with the ops the AArch64 backend also leaves to it.

//! x86-64 block compiler.

use super::encoder::{X64Encoder, MEMBASE};
use super::regcache::X64Target;
use crate::core::config::JitOptions;
use crate::core::error::JitResult;
use crate::core::regcache::{MapMode, NativeReg, RegCache, RegCacheConfig};
use crate::core::session::JitSession;
use crate::interp::fallback::{interpret_one, pack_inst};
use crate::interp::state::{DOWNCOUNT_OFFSET, PC_OFFSET, SYSCALL_OFFSET};
use crate::ir::regs::{fpr_slot, vfpu_ctrl_slot, REG_FPCOND, REG_HI, REG_LO};
use crate::ir::{IrInst, IrProgram, Op};
use crate::jit::CompiledBlock;
use iced_x86::code_asm::*;
use iced_x86::IcedError;
use log::{debug, trace, warn};

/// Whether `op` has a native x86-64 lowering.
pub fn lowers_natively(op: Op) -> bool {
    crate::arm64::lowers_natively(op) && !matches!(op, Op::FMul | Op::ReverseBits)
}

/// Guest address of a memory operand once its base is mapped.
#[derive(Debug, Clone, Copy)]
enum AddrPlan {
    Const(u32),
    Reg(AsmRegister32, u32),
}

#[derive(Debug, Clone, Copy)]
enum StoreValue {
    Reg(NativeReg),
    Imm(u32),
}

/// Compiles blocks for x86-64.
pub struct X64Backend {
    cache: RegCache<X64Target>,
    exit: CodeLabel,
    native_ops: usize,
    fallback_ops: usize,
}

impl X64Backend {
    pub fn new(options: &JitOptions) -> JitResult<Self> {
        let config = RegCacheConfig {
            static_alloc: false,
            pointerify: false,
            lookahead_window: options.lookahead_window,
        };
        let mut target = X64Target::new()?;
        let exit = target.enc.create_label();
        Ok(Self {
            cache: RegCache::new(target, config),
            exit,
            native_ops: 0,
            fallback_ops: 0,
        })
    }

    fn enc(&mut self) -> &mut X64Encoder {
        &mut self.cache.target_mut().enc
    }

    fn asm(&mut self) -> &mut CodeAssembler {
        self.cache.target_mut().enc.asm()
    }

    /// Compile `program` into a self-contained function.
    pub fn compile(
        mut self,
        program: &IrProgram,
        session: &JitSession<'_>,
    ) -> JitResult<CompiledBlock> {
        self.cache.start(program.insts());
        self.enc().emit_prologue()?;
        self.asm().mov(r14, rdi)?;
        self.asm().mov(r15, rsi)?;

        for (index, inst) in program.insts().iter().enumerate() {
            if inst.op == Op::Nop {
                continue;
            }
            self.cache.begin_inst(index);
            let constant = program.constant_of(inst).unwrap_or(0);
            let native = lowers_natively(inst.op) && !inst.mixes_vec4_lanes();
            trace!("x64 [{}] {} ({})", index, inst.op, if native { "native" } else { "fallback" });
            if native {
                self.compile_inst(inst, constant)?;
                self.native_ops += 1;
            } else {
                self.compile_fallback(inst, constant)?;
                self.fallback_ops += 1;
            }
            session.record_lowered(inst.op.name(), native);
            if cfg!(debug_assertions) {
                self.cache.check_consistency();
            }
        }

        self.cache.release_locks();
        self.cache.flush_all()?;
        self.asm().xor(eax, eax)?;
        let mut exit = self.exit;
        self.enc().place_label(&mut exit)?;
        self.enc().emit_epilogue()?;

        let spills = self.cache.spills();
        session.record_spills(spills);
        let native_ops = self.native_ops;
        let fallback_ops = self.fallback_ops;
        let code = self.cache.into_target().enc.finalize()?;
        debug!(
            "x64: {} IR ops -> {} bytes ({} native, {} fallback, {} spills)",
            program.len(),
            code.len(),
            native_ops,
            fallback_ops,
            spills
        );
        Ok(CompiledBlock {
            code,
            native_ops,
            fallback_ops,
            spills,
        })
    }

    fn gpr(&mut self, slot: usize, mode: MapMode) -> JitResult<AsmRegister32> {
        let native = self.cache.map_gpr(slot, mode)?;
        Ok(X64Encoder::gp32(native)?)
    }

    fn fpr(&mut self, field: u8, mode: MapMode) -> JitResult<AsmRegisterXmm> {
        let native = self.cache.map_fpr(fpr_slot(field), mode)?;
        Ok(X64Encoder::xmm(native)?)
    }

    fn vec4(&mut self, field: u8, mode: MapMode) -> JitResult<AsmRegisterXmm> {
        let native = self.cache.map_vec4(fpr_slot(field), mode)?;
        Ok(X64Encoder::xmm(native)?)
    }

    fn imm_of(&self, slot: usize) -> Option<u32> {
        match (self.cache.imm(slot), self.cache.is_static(slot)) {
            (Some(value), false) => Some(value),
            _ => None,
        }
    }

    fn move_slot(&mut self, dest: usize, src: usize) -> JitResult<()> {
        if dest == src {
            return Ok(());
        }
        if let Some(value) = self.imm_of(src) {
            return self.cache.set_imm(dest, value);
        }
        let s = self.gpr(src, MapMode::Read)?;
        let d = self.gpr(dest, MapMode::Write)?;
        self.asm().mov(d, s)?;
        Ok(())
    }

    /// `d = a op b` where `op` updates its first operand in place.
    fn alu<F>(&mut self, inst: &IrInst, op: F) -> JitResult<()>
    where
        F: FnOnce(&mut CodeAssembler, AsmRegister32, AsmRegister32) -> Result<(), IcedError>,
    {
        let a = self.gpr(inst.src1 as usize, MapMode::Read)?;
        let b = self.gpr(inst.src2 as usize, MapMode::Read)?;
        let d = self.gpr(inst.dest as usize, MapMode::Write)?;
        let asm = self.asm();
        if d == a {
            op(asm, d, b)?;
        } else {
            asm.mov(eax, a)?;
            op(asm, eax, b)?;
            asm.mov(d, eax)?;
        }
        Ok(())
    }

    /// `d = op(s)` computed in place.
    fn alu_unary<F>(&mut self, inst: &IrInst, op: F) -> JitResult<()>
    where
        F: FnOnce(&mut CodeAssembler, AsmRegister32) -> Result<(), IcedError>,
    {
        let s = self.gpr(inst.src1 as usize, MapMode::Read)?;
        let d = self.gpr(inst.dest as usize, MapMode::Write)?;
        let asm = self.asm();
        if d == s {
            op(asm, d)?;
        } else {
            asm.mov(eax, s)?;
            op(asm, eax)?;
            asm.mov(d, eax)?;
        }
        Ok(())
    }

    /// Variable shift or rotate; the count goes through cl.
    fn shift<F>(&mut self, inst: &IrInst, op: F) -> JitResult<()>
    where
        F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    {
        let a = self.gpr(inst.src1 as usize, MapMode::Read)?;
        let b = self.gpr(inst.src2 as usize, MapMode::Read)?;
        let d = self.gpr(inst.dest as usize, MapMode::Write)?;
        let asm = self.asm();
        asm.mov(ecx, b)?;
        asm.mov(eax, a)?;
        op(asm)?;
        asm.mov(d, eax)?;
        Ok(())
    }

    /// `d = a op b` on xmm registers, through xmm15 unless `d` is `a`.
    fn xmm_binary(
        &mut self,
        a: AsmRegisterXmm,
        b: AsmRegisterXmm,
        d: AsmRegisterXmm,
        op: Emit2,
    ) -> JitResult<()> {
        let asm = self.asm();
        if d == a {
            op(asm, d, b)?;
        } else {
            asm.movaps(xmm15, a)?;
            op(asm, xmm15, b)?;
            asm.movaps(d, xmm15)?;
        }
        Ok(())
    }

    fn fp_binary(&mut self, inst: &IrInst, op: Emit2) -> JitResult<()> {
        let a = self.fpr(inst.src1, MapMode::Read)?;
        let b = self.fpr(inst.src2, MapMode::Read)?;
        let d = self.fpr(inst.dest, MapMode::Write)?;
        self.xmm_binary(a, b, d, op)
    }

    fn vec_binary(&mut self, inst: &IrInst, op: Emit2) -> JitResult<()> {
        let a = self.vec4(inst.src1, MapMode::Read)?;
        let b = self.vec4(inst.src2, MapMode::Read)?;
        let d = self.vec4(inst.dest, MapMode::Write)?;
        self.xmm_binary(a, b, d, op)
    }

    /// Flip or clear the sign bit of a scalar through eax.
    fn fp_sign(&mut self, inst: &IrInst, negate: bool) -> JitResult<()> {
        let s = self.fpr(inst.src1, MapMode::Read)?;
        let d = self.fpr(inst.dest, MapMode::Write)?;
        let asm = self.asm();
        asm.movd(eax, s)?;
        if negate {
            asm.xor(eax, 0x8000_0000u32 as i32)?;
        } else {
            asm.and(eax, 0x7fff_ffff_i32)?;
        }
        asm.movd(d, eax)?;
        Ok(())
    }

    /// Same on all four lanes with a broadcast mask in xmm14.
    fn vec_sign(&mut self, inst: &IrInst, negate: bool) -> JitResult<()> {
        let s = self.vec4(inst.src1, MapMode::Read)?;
        let d = self.vec4(inst.dest, MapMode::Write)?;
        let asm = self.asm();
        let mask = if negate { 0x8000_0000u32 } else { 0x7fff_ffff };
        asm.mov(eax, mask as i32)?;
        asm.movd(xmm14, eax)?;
        asm.pshufd(xmm14, xmm14, 0i32)?;
        asm.movaps(xmm15, s)?;
        if negate {
            asm.xorps(xmm15, xmm14)?;
        } else {
            asm.andps(xmm15, xmm14)?;
        }
        asm.movaps(d, xmm15)?;
        Ok(())
    }

    /// Map the base register of a memory operand. Emits no scratch code.
    fn plan_address(&mut self, base: usize, offset: u32) -> JitResult<AddrPlan> {
        if let Some(value) = self.imm_of(base) {
            return Ok(AddrPlan::Const(value.wrapping_add(offset)));
        }
        let r = self.gpr(base, MapMode::Read)?;
        Ok(AddrPlan::Reg(r, offset))
    }

    /// Form the guest address in eax and return the host operand for it.
    fn address(&mut self, plan: AddrPlan) -> JitResult<AsmMemoryOperand> {
        let asm = self.asm();
        match plan {
            AddrPlan::Const(addr) => {
                asm.mov(eax, addr as i32)?;
            }
            AddrPlan::Reg(base, offset) => {
                asm.mov(eax, base)?;
                if offset != 0 {
                    asm.add(eax, offset as i32)?;
                }
            }
        }
        Ok(X64Encoder::guest(rax))
    }

    fn load_gpr(&mut self, inst: &IrInst, offset: u32) -> JitResult<()> {
        let plan = self.plan_address(inst.src1 as usize, offset)?;
        let d = self.gpr(inst.dest as usize, MapMode::Write)?;
        let mem = self.address(plan)?;
        let asm = self.asm();
        match inst.op {
            Op::Load8 => asm.movzx(d, byte_ptr(mem))?,
            Op::Load8Ext => asm.movsx(d, byte_ptr(mem))?,
            Op::Load16 => asm.movzx(d, word_ptr(mem))?,
            Op::Load16Ext => asm.movsx(d, word_ptr(mem))?,
            _ => asm.mov(d, dword_ptr(mem))?,
        }
        Ok(())
    }

    fn store_gpr(&mut self, inst: &IrInst, offset: u32) -> JitResult<()> {
        let value = match self.imm_of(inst.dest as usize) {
            Some(value) => StoreValue::Imm(value),
            None => StoreValue::Reg(self.cache.map_gpr(inst.dest as usize, MapMode::Read)?),
        };
        let plan = self.plan_address(inst.src1 as usize, offset)?;
        let mem = self.address(plan)?;
        let asm = self.asm();
        match (inst.op, value) {
            (Op::Store8, StoreValue::Reg(r)) => asm.mov(byte_ptr(mem), X64Encoder::gp8(r)?)?,
            (Op::Store8, StoreValue::Imm(v)) => asm.mov(byte_ptr(mem), (v & 0xff) as i32)?,
            (Op::Store16, StoreValue::Reg(r)) => asm.mov(word_ptr(mem), X64Encoder::gp16(r)?)?,
            (Op::Store16, StoreValue::Imm(v)) => asm.mov(word_ptr(mem), (v & 0xffff) as i32)?,
            (_, StoreValue::Reg(r)) => asm.mov(dword_ptr(mem), X64Encoder::gp32(r)?)?,
            (_, StoreValue::Imm(v)) => asm.mov(dword_ptr(mem), v as i32)?,
        }
        Ok(())
    }

    /// Return `code` from the block through the shared epilogue.
    fn leave(&mut self, code: u32) -> JitResult<()> {
        let exit = self.exit;
        self.enc().mov_imm32(eax, code)?;
        self.asm().jmp(exit)?;
        Ok(())
    }

    fn exit_to_const(&mut self, target: u32) -> JitResult<()> {
        self.asm().mov(dword_ptr(X64Encoder::state(PC_OFFSET)), target as i32)?;
        self.leave(1)
    }

    fn conditional_exit(&mut self, inst: &IrInst, target: u32) -> JitResult<()> {
        self.cache.flush_all()?;
        let a = self.gpr(inst.src1 as usize, MapMode::Read)?;
        let b = match inst.op {
            Op::ExitToConstIfEq | Op::ExitToConstIfNeq => {
                Some(self.gpr(inst.src2 as usize, MapMode::Read)?)
            }
            _ => None,
        };
        let mut skip = self.enc().create_label();
        let asm = self.asm();
        match b {
            Some(b) => asm.cmp(a, b)?,
            None => asm.test(a, a)?,
        }
        match inst.op {
            Op::ExitToConstIfEq => asm.jne(skip)?,
            Op::ExitToConstIfNeq => asm.je(skip)?,
            Op::ExitToConstIfGtZ => asm.jle(skip)?,
            Op::ExitToConstIfGeZ => asm.jl(skip)?,
            Op::ExitToConstIfLtZ => asm.jge(skip)?,
            _ => asm.jg(skip)?,
        }
        self.exit_to_const(target)?;
        self.enc().place_label(&mut skip)?;
        Ok(())
    }

    fn compile_fallback(&mut self, inst: &IrInst, constant: u32) -> JitResult<()> {
        warn!("x64: {} lowered as an interpreter call", inst.op);
        let writes = inst.write_slots();
        self.cache.flush_before_call(&writes)?;
        let exit = self.exit;
        let asm = self.asm();
        asm.mov(rdi, r14)?;
        asm.mov(rsi, MEMBASE)?;
        asm.mov(rdx, pack_inst(inst, constant))?;
        asm.mov(rax, interpret_one as *const () as usize as u64)?;
        asm.call(rax)?;
        asm.test(eax, eax)?;
        asm.jne(exit)?;
        self.cache.reload_after_call(&writes)
    }

    fn compile_inst(&mut self, inst: &IrInst, constant: u32) -> JitResult<()> {
        let d = inst.dest as usize;
        let s1 = inst.src1 as usize;
        let imm = constant as i32;
        let shamt = inst.src2 as i32;
        match inst.op {
            Op::SetConst => self.cache.set_imm(d, constant)?,
            Op::SetConstF => {
                let f = self.fpr(inst.dest, MapMode::Write)?;
                self.enc().mov_xmm_imm32(f, constant)?;
            }
            Op::Mov => self.move_slot(d, s1)?,
            Op::Downcount => {
                self.asm().sub(dword_ptr(X64Encoder::state(DOWNCOUNT_OFFSET)), imm)?;
            }
            Op::SetPC => {
                let s = self.gpr(s1, MapMode::Read)?;
                self.asm().mov(dword_ptr(X64Encoder::state(PC_OFFSET)), s)?;
            }
            Op::SetPCConst => {
                self.asm().mov(dword_ptr(X64Encoder::state(PC_OFFSET)), imm)?;
            }

            Op::Add => self.alu(inst, |a, d, s| a.add(d, s))?,
            Op::Sub => self.alu(inst, |a, d, s| a.sub(d, s))?,
            Op::And => self.alu(inst, |a, d, s| a.and(d, s))?,
            Op::Or => self.alu(inst, |a, d, s| a.or(d, s))?,
            Op::Xor => self.alu(inst, |a, d, s| a.xor(d, s))?,
            Op::AddConst => self.alu_unary(inst, |a, d| a.add(d, imm))?,
            Op::SubConst => self.alu_unary(inst, |a, d| a.sub(d, imm))?,
            Op::AndConst => self.alu_unary(inst, |a, d| a.and(d, imm))?,
            Op::OrConst => self.alu_unary(inst, |a, d| a.or(d, imm))?,
            Op::XorConst => self.alu_unary(inst, |a, d| a.xor(d, imm))?,
            Op::Neg => self.alu_unary(inst, |a, d| a.neg(d))?,
            Op::Not => self.alu_unary(inst, |a, d| a.not(d))?,
            Op::BSwap32 => self.alu_unary(inst, |a, d| a.bswap(d))?,
            Op::Ext8to32 => {
                let s = self.cache.map_gpr(s1, MapMode::Read)?;
                let r = self.gpr(d, MapMode::Write)?;
                self.asm().movsx(r, X64Encoder::gp8(s)?)?;
            }
            Op::Ext16to32 => {
                let s = self.cache.map_gpr(s1, MapMode::Read)?;
                let r = self.gpr(d, MapMode::Write)?;
                self.asm().movsx(r, X64Encoder::gp16(s)?)?;
            }
            Op::BSwap16 => {
                let s = self.gpr(s1, MapMode::Read)?;
                let r = self.gpr(d, MapMode::Write)?;
                let asm = self.asm();
                asm.mov(eax, s)?;
                asm.shr(eax, 8i32)?;
                asm.and(eax, 0x00ff_00ff_i32)?;
                asm.mov(ecx, s)?;
                asm.shl(ecx, 8i32)?;
                asm.and(ecx, 0xff00_ff00u32 as i32)?;
                asm.or(eax, ecx)?;
                asm.mov(r, eax)?;
            }
            Op::Clz => {
                let s = self.gpr(s1, MapMode::Read)?;
                let r = self.gpr(d, MapMode::Write)?;
                let asm = self.asm();
                // bsr leaves ZF set for zero; -1 then yields 32.
                asm.mov(ecx, -1i32)?;
                asm.bsr(eax, s)?;
                asm.cmove(eax, ecx)?;
                asm.neg(eax)?;
                asm.add(eax, 31i32)?;
                asm.mov(r, eax)?;
            }

            Op::Shl => self.shift(inst, |a| a.shl(eax, cl))?,
            Op::Shr => self.shift(inst, |a| a.shr(eax, cl))?,
            Op::Sar => self.shift(inst, |a| a.sar(eax, cl))?,
            Op::Ror => self.shift(inst, |a| a.ror(eax, cl))?,
            Op::ShlImm => self.alu_unary(inst, |a, d| a.shl(d, shamt))?,
            Op::ShrImm => self.alu_unary(inst, |a, d| a.shr(d, shamt))?,
            Op::SarImm => self.alu_unary(inst, |a, d| a.sar(d, shamt))?,
            Op::RorImm => self.alu_unary(inst, |a, d| a.ror(d, shamt))?,

            Op::Slt | Op::SltU | Op::SltConst | Op::SltUConst => {
                let a = self.gpr(s1, MapMode::Read)?;
                let b = match inst.op {
                    Op::Slt | Op::SltU => Some(self.gpr(inst.src2 as usize, MapMode::Read)?),
                    _ => None,
                };
                let r = self.gpr(d, MapMode::Write)?;
                let asm = self.asm();
                asm.xor(eax, eax)?;
                match b {
                    Some(b) => asm.cmp(a, b)?,
                    None => asm.cmp(a, imm)?,
                }
                match inst.op {
                    Op::Slt | Op::SltConst => asm.setl(al)?,
                    _ => asm.setb(al)?,
                }
                asm.mov(r, eax)?;
            }
            Op::MovZ | Op::MovNZ => {
                let c = self.gpr(s1, MapMode::Read)?;
                let v = self.gpr(inst.src2 as usize, MapMode::Read)?;
                let r = self.gpr(d, MapMode::ReadWrite)?;
                let asm = self.asm();
                asm.test(c, c)?;
                if inst.op == Op::MovZ {
                    asm.cmove(r, v)?;
                } else {
                    asm.cmovne(r, v)?;
                }
            }
            Op::Max | Op::Min => {
                let a = self.gpr(s1, MapMode::Read)?;
                let b = self.gpr(inst.src2 as usize, MapMode::Read)?;
                let r = self.gpr(d, MapMode::Write)?;
                let asm = self.asm();
                asm.mov(eax, a)?;
                asm.cmp(a, b)?;
                if inst.op == Op::Max {
                    asm.cmovl(eax, b)?;
                } else {
                    asm.cmovg(eax, b)?;
                }
                asm.mov(r, eax)?;
            }

            Op::MtLo => self.move_slot(REG_LO as usize, s1)?,
            Op::MtHi => self.move_slot(REG_HI as usize, s1)?,
            Op::MfLo => self.move_slot(d, REG_LO as usize)?,
            Op::MfHi => self.move_slot(d, REG_HI as usize)?,
            Op::FpCondFromReg => self.move_slot(REG_FPCOND as usize, s1)?,
            Op::FpCondToReg => self.move_slot(d, REG_FPCOND as usize)?,
            Op::SetCtrlVFPU => self.cache.set_imm(vfpu_ctrl_slot(inst.dest), constant)?,
            Op::SetCtrlVFPUReg => self.move_slot(vfpu_ctrl_slot(inst.dest), s1)?,
            Op::Mult | Op::MultU => {
                let a = self.gpr(s1, MapMode::Read)?;
                let b = self.gpr(inst.src2 as usize, MapMode::Read)?;
                let lo = self.gpr(REG_LO as usize, MapMode::Write)?;
                let hi = self.gpr(REG_HI as usize, MapMode::Write)?;
                let asm = self.asm();
                if inst.op == Op::Mult {
                    asm.movsxd(rax, a)?;
                    asm.movsxd(rcx, b)?;
                } else {
                    asm.mov(eax, a)?;
                    asm.mov(ecx, b)?;
                }
                asm.imul_2(rax, rcx)?;
                asm.mov(lo, eax)?;
                asm.shr(rax, 32i32)?;
                asm.mov(hi, eax)?;
            }

            Op::Load8 | Op::Load8Ext | Op::Load16 | Op::Load16Ext | Op::Load32 => {
                self.load_gpr(inst, constant)?
            }
            Op::LoadFloat => {
                let plan = self.plan_address(s1, constant)?;
                let f = self.fpr(inst.dest, MapMode::Write)?;
                let mem = self.address(plan)?;
                self.asm().movss(f, dword_ptr(mem))?;
            }
            Op::LoadVec4 => {
                let plan = self.plan_address(s1, constant)?;
                let v = self.vec4(inst.dest, MapMode::Write)?;
                let mem = self.address(plan)?;
                self.asm().movups(v, xmmword_ptr(mem))?;
            }
            Op::Store8 | Op::Store16 | Op::Store32 => self.store_gpr(inst, constant)?,
            Op::StoreFloat => {
                let f = self.fpr(inst.dest, MapMode::Read)?;
                let plan = self.plan_address(s1, constant)?;
                let mem = self.address(plan)?;
                self.asm().movss(dword_ptr(mem), f)?;
            }
            Op::StoreVec4 => {
                let v = self.vec4(inst.dest, MapMode::Read)?;
                let plan = self.plan_address(s1, constant)?;
                let mem = self.address(plan)?;
                self.asm().movups(xmmword_ptr(mem), v)?;
            }

            Op::FAdd => self.fp_binary(inst, |a, d, s| a.addss(d, s))?,
            Op::FSub => self.fp_binary(inst, |a, d, s| a.subss(d, s))?,
            Op::FDiv => self.fp_binary(inst, |a, d, s| a.divss(d, s))?,
            Op::FSqrt => {
                let s = self.fpr(inst.src1, MapMode::Read)?;
                let f = self.fpr(inst.dest, MapMode::Write)?;
                self.asm().sqrtss(f, s)?;
            }
            Op::FNeg => self.fp_sign(inst, true)?,
            Op::FAbs => self.fp_sign(inst, false)?,
            Op::FMov => {
                let s = self.fpr(inst.src1, MapMode::Read)?;
                let f = self.fpr(inst.dest, MapMode::Write)?;
                if f != s {
                    self.asm().movaps(f, s)?;
                }
            }
            Op::FCvtSW => {
                let s = self.fpr(inst.src1, MapMode::Read)?;
                let f = self.fpr(inst.dest, MapMode::Write)?;
                self.asm().cvtdq2ps(f, s)?;
            }
            Op::FMovFromGPR => {
                let s = self.gpr(s1, MapMode::Read)?;
                let f = self.fpr(inst.dest, MapMode::Write)?;
                self.asm().movd(f, s)?;
            }
            Op::FMovToGPR => {
                let f = self.fpr(inst.src1, MapMode::Read)?;
                let r = self.gpr(d, MapMode::Write)?;
                self.asm().movd(r, f)?;
            }

            Op::Vec4Init => {
                let v = self.vec4(inst.dest, MapMode::Write)?;
                let enc = self.enc();
                match inst.src1 % 7 {
                    0 => enc.asm().xorps(v, v)?,
                    fill @ (1 | 2) => {
                        let one = if fill == 1 { 1.0f32 } else { -1.0f32 };
                        enc.mov_xmm_imm32(v, one.to_bits())?;
                        enc.asm().pshufd(v, v, 0i32)?;
                    }
                    lane => {
                        // lane 0 of xmm15 is 1.0, lanes 1..3 are zero
                        enc.mov_xmm_imm32(xmm15, 1.0f32.to_bits())?;
                        let select = (0..4u8)
                            .filter(|&i| i != lane - 3)
                            .fold(0i32, |acc, i| acc | 1 << (2 * i));
                        enc.asm().pshufd(v, xmm15, select)?;
                    }
                }
            }
            Op::Vec4Shuffle => {
                let s = self.vec4(inst.src1, MapMode::Read)?;
                let v = self.vec4(inst.dest, MapMode::Write)?;
                self.asm().pshufd(v, s, shamt)?;
            }
            Op::Vec4Mov => {
                let s = self.vec4(inst.src1, MapMode::Read)?;
                let v = self.vec4(inst.dest, MapMode::Write)?;
                if v != s {
                    self.asm().movaps(v, s)?;
                }
            }
            Op::Vec4Add => self.vec_binary(inst, |a, d, s| a.addps(d, s))?,
            Op::Vec4Sub => self.vec_binary(inst, |a, d, s| a.subps(d, s))?,
            Op::Vec4Mul => self.vec_binary(inst, |a, d, s| a.mulps(d, s))?,
            Op::Vec4Div => self.vec_binary(inst, |a, d, s| a.divps(d, s))?,
            Op::Vec4Scale => {
                let s = self.vec4(inst.src1, MapMode::Read)?;
                let f = self.fpr(inst.src2, MapMode::Read)?;
                let v = self.vec4(inst.dest, MapMode::Write)?;
                let asm = self.asm();
                asm.movaps(xmm14, f)?;
                asm.shufps(xmm14, xmm14, 0i32)?;
                asm.movaps(xmm15, s)?;
                asm.mulps(xmm15, xmm14)?;
                asm.movaps(v, xmm15)?;
            }
            Op::Vec4Neg => self.vec_sign(inst, true)?,
            Op::Vec4Abs => self.vec_sign(inst, false)?,

            Op::ExitToConst => {
                self.cache.flush_all()?;
                self.exit_to_const(constant)?;
            }
            Op::ExitToReg => {
                self.cache.flush_all()?;
                let s = self.gpr(s1, MapMode::Read)?;
                self.asm().mov(dword_ptr(X64Encoder::state(PC_OFFSET)), s)?;
                self.leave(1)?;
            }
            Op::ExitToConstIfEq
            | Op::ExitToConstIfNeq
            | Op::ExitToConstIfGtZ
            | Op::ExitToConstIfGeZ
            | Op::ExitToConstIfLtZ
            | Op::ExitToConstIfLeZ => self.conditional_exit(inst, constant)?,
            Op::ExitToPC => {
                self.cache.flush_all()?;
                self.leave(1)?;
            }
            Op::Syscall => {
                self.cache.flush_all()?;
                self.asm().mov(dword_ptr(X64Encoder::state(SYSCALL_OFFSET)), imm)?;
                self.leave(1)?;
            }

            op => unreachable!("x64 backend has no native lowering for {}", op),
        }
        Ok(())
    }
}

/// Two-operand xmm instruction updating its first operand.
type Emit2 = fn(&mut CodeAssembler, AsmRegisterXmm, AsmRegisterXmm) -> Result<(), IcedError>;

/// Compile `program` for x86-64.
pub fn compile_block(
    program: &IrProgram,
    options: &JitOptions,
    session: &JitSession<'_>,
) -> JitResult<CompiledBlock> {
    X64Backend::new(options)?.compile(program, session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TargetArch;
    use crate::ir::text::parse_program;
    use bumpalo::Bump;

    fn compile(text: &str) -> CompiledBlock {
        let program = parse_program(text).unwrap();
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let options = JitOptions::for_target(TargetArch::X64);
        compile_block(&program, &options, &session).unwrap()
    }

    fn contains(code: &[u8], needle: &[u8]) -> bool {
        code.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_empty_block_returns_zero() {
        let block = compile("");
        // push rbx ... ; mov r14, rdi; mov r15, rsi
        assert_eq!(block.code[0], 0x53);
        assert!(contains(&block.code, &[0x49, 0x89, 0xfe, 0x49, 0x89, 0xf7]));
        // xor eax, eax in front of the epilogue
        assert!(contains(&block.code, &[0x31, 0xc0, 0x48, 0x83, 0xc4, 0x08]));
        assert_eq!(*block.code.last().unwrap(), 0xc3);
    }

    #[test]
    fn test_constant_store_uses_immediates() {
        let block = compile("SetConst r2, 0x1234\nSetConst r1, 0x100\nStore32 r2, r1, 0x4\n");
        // mov eax, 0x104; mov dword [r15+rax], 0x1234
        assert!(contains(&block.code, &[0xb8, 0x04, 0x01, 0x00, 0x00]));
        assert!(contains(&block.code, &[0x41, 0xc7, 0x04, 0x07, 0x34, 0x12, 0x00, 0x00]));
        assert_eq!(block.fallback_ops, 0);
    }

    #[test]
    fn test_scalar_multiply_falls_back() {
        let block = compile("FMul f1, f2, f3\nFAdd f4, f1, f2\n");
        assert_eq!(block.fallback_ops, 1);
        assert_eq!(block.native_ops, 1);
        // call rax
        assert!(contains(&block.code, &[0xff, 0xd0]));
    }

    #[test]
    fn test_conditional_exit_stores_pc() {
        let block = compile("ExitToConstIfNeq 0x08804000, r1, r2\n");
        // mov dword [r14+pc], 0x08804000
        let mut store = vec![0x41, 0xc7, 0x86];
        store.extend_from_slice(&PC_OFFSET.to_le_bytes());
        store.extend_from_slice(&0x0880_4000u32.to_le_bytes());
        assert!(contains(&block.code, &store));
        assert_eq!(block.native_ops, 1);
    }
}
