// This module lowers one optimized IR block to AArch64 machine code. The generated function
// has the block ABI `extern "C" fn(*mut GuestState, *mut u8) -> u32`: the prologue saves the
// callee-saved registers, parks the two arguments in X27 (guest state) and X28 (guest memory
// base) and loads the statically bound guest registers. Each instruction first maps its
// operands through the register engine (sources, then the destination) and only afterwards
// touches the scratch registers W16/W17 and V0/V1, because mapping may itself emit spill code
// that uses them.
//
// Exits flush the engine before testing their condition, so the taken path finds guest
// storage up to date and only has to store the new pc and return 1. Every return funnels
// through one shared epilogue that expects the result in W0. Ops without a native lowering,
// and vector ops whose operands share lanes in ways one register cannot represent, call the
// interpreter thunk with the instruction packed into a single argument; a nonzero result from
// the thunk leaves the block with that code.

//! AArch64 block compiler.

use super::encoder::{Arm64Encoder, Cond, FixupBranch, FpOp, FpUnary, GReg, LogicOp, MemOp, VecOp, LR, SP, ZR};
use super::regcache::{Arm64Target, CTX, MEMBASE, SCRATCH1, SCRATCH2, VSCRATCH0};
use crate::core::config::JitOptions;
use crate::core::error::JitResult;
use crate::core::regcache::{MapMode, RegCache, RegCacheConfig, RegStatus};
use crate::core::session::JitSession;
use crate::interp::fallback::{interpret_one, pack_inst};
use crate::interp::state::{DOWNCOUNT_OFFSET, PC_OFFSET, SYSCALL_OFFSET};
use crate::ir::regs::{fpr_slot, vfpu_ctrl_slot, REG_FPCOND, REG_HI, REG_LO};
use crate::ir::{IrInst, IrProgram, Op};
use crate::jit::CompiledBlock;
use log::{debug, trace, warn};

/// Bytes of stack the prologue reserves: FP/LR, X19..X28 and D8..D15.
const FRAME_SIZE: i32 = 160;

/// Whether `op` has a native AArch64 lowering.
pub fn lowers_natively(op: Op) -> bool {
    !matches!(
        op,
        Op::Madd
            | Op::MaddU
            | Op::Msub
            | Op::MsubU
            | Op::Div
            | Op::DivU
            | Op::Load32Left
            | Op::Load32Right
            | Op::Load32Linked
            | Op::Store32Left
            | Op::Store32Right
            | Op::Store32Conditional
            | Op::FMin
            | Op::FMax
            | Op::FRound
            | Op::FTrunc
            | Op::FCeil
            | Op::FFloor
            | Op::FCvtWS
            | Op::FCmp
            | Op::Vec4Blend
            | Op::Vec4Dot
            | Op::Vec4ClampToZero
    )
}

/// Where a memory operand lives once its base is mapped.
#[derive(Debug, Clone, Copy)]
enum AddrPlan {
    /// Guest address known at compile time.
    Const(u32),
    /// Base register already holds a host pointer; offset fits the scaled immediate.
    Pointer(GReg, u32),
    /// 32-bit guest address in a register plus an offset.
    Guest(GReg, u32),
}

fn fits_scaled(op: MemOp, offset: u32) -> bool {
    let size = op.size();
    offset % size == 0 && offset / size < 4096
}

/// Compiles blocks for AArch64.
pub struct Arm64Backend {
    cache: RegCache<Arm64Target>,
    exits: Vec<FixupBranch>,
    native_ops: usize,
    fallback_ops: usize,
}

impl Arm64Backend {
    pub fn new(options: &JitOptions) -> Self {
        let config = RegCacheConfig {
            static_alloc: options.static_alloc,
            pointerify: options.static_alloc && options.pointerify,
            lookahead_window: options.lookahead_window,
        };
        Self {
            cache: RegCache::new(Arm64Target::new(), config),
            exits: Vec::new(),
            native_ops: 0,
            fallback_ops: 0,
        }
    }

    fn enc(&mut self) -> &mut Arm64Encoder {
        &mut self.cache.target_mut().enc
    }

    /// Compile `program` into a self-contained function.
    pub fn compile(
        mut self,
        program: &IrProgram,
        session: &JitSession<'_>,
    ) -> JitResult<CompiledBlock> {
        self.cache.start(program.insts());
        self.emit_prologue();
        self.cache.reload_statics()?;

        for (index, inst) in program.insts().iter().enumerate() {
            if inst.op == Op::Nop {
                continue;
            }
            self.cache.begin_inst(index);
            let constant = program.constant_of(inst).unwrap_or(0);
            let native = lowers_natively(inst.op) && !inst.mixes_vec4_lanes();
            trace!("arm64 [{}] {} ({})", index, inst.op, if native { "native" } else { "fallback" });
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
        self.enc().movz(false, 0, 0, 0);
        for branch in std::mem::take(&mut self.exits) {
            self.enc().set_jump_target(branch);
        }
        self.emit_epilogue();

        let spills = self.cache.spills();
        session.record_spills(spills);
        let native_ops = self.native_ops;
        let fallback_ops = self.fallback_ops;
        let code = self.cache.into_target().enc.finish();
        debug!(
            "arm64: {} IR ops -> {} bytes ({} native, {} fallback, {} spills)",
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

    fn emit_prologue(&mut self) {
        let enc = self.enc();
        enc.stp_pre(29, LR, FRAME_SIZE);
        enc.add_imm(true, 29, SP, 0, false);
        enc.stp(19, 20, 16);
        enc.stp(21, 22, 32);
        enc.stp(23, 24, 48);
        enc.stp(25, 26, 64);
        enc.stp(27, 28, 80);
        enc.stp_d(8, 9, 96);
        enc.stp_d(10, 11, 112);
        enc.stp_d(12, 13, 128);
        enc.stp_d(14, 15, 144);
        enc.mov(true, CTX, 0);
        enc.mov(true, MEMBASE, 1);
    }

    fn emit_epilogue(&mut self) {
        let enc = self.enc();
        enc.ldp_d(14, 15, 144);
        enc.ldp_d(12, 13, 128);
        enc.ldp_d(10, 11, 112);
        enc.ldp_d(8, 9, 96);
        enc.ldp(27, 28, 80);
        enc.ldp(25, 26, 64);
        enc.ldp(23, 24, 48);
        enc.ldp(21, 22, 32);
        enc.ldp(19, 20, 16);
        enc.ldp_post(29, LR, FRAME_SIZE);
        enc.ret();
    }

    fn gpr(&mut self, slot: usize, mode: MapMode) -> JitResult<GReg> {
        self.cache.map_gpr(slot, mode)
    }

    fn fpr(&mut self, field: u8, mode: MapMode) -> JitResult<u8> {
        let native = self.cache.map_fpr(fpr_slot(field), mode)?;
        Ok(Arm64Target::vreg(native))
    }

    fn vec4(&mut self, field: u8, mode: MapMode) -> JitResult<u8> {
        let native = self.cache.map_vec4(fpr_slot(field), mode)?;
        Ok(Arm64Target::vreg(native))
    }

    /// Copy one integer slot into another, keeping known immediates symbolic.
    fn move_slot(&mut self, dest: usize, src: usize) -> JitResult<()> {
        if dest == src {
            return Ok(());
        }
        if let (Some(value), false) = (self.cache.imm(src), self.cache.is_static(src)) {
            return self.cache.set_imm(dest, value);
        }
        let s = self.gpr(src, MapMode::Read)?;
        let d = self.gpr(dest, MapMode::Write)?;
        self.enc().mov(false, d, s);
        Ok(())
    }

    fn binary<F>(&mut self, inst: &IrInst, emit: F) -> JitResult<()>
    where
        F: FnOnce(&mut Arm64Encoder, GReg, GReg, GReg),
    {
        let a = self.gpr(inst.src1 as usize, MapMode::Read)?;
        let b = self.gpr(inst.src2 as usize, MapMode::Read)?;
        let d = self.gpr(inst.dest as usize, MapMode::Write)?;
        emit(self.enc(), d, a, b);
        Ok(())
    }

    fn unary<F>(&mut self, inst: &IrInst, emit: F) -> JitResult<()>
    where
        F: FnOnce(&mut Arm64Encoder, GReg, GReg),
    {
        let s = self.gpr(inst.src1 as usize, MapMode::Read)?;
        let d = self.gpr(inst.dest as usize, MapMode::Write)?;
        emit(self.enc(), d, s);
        Ok(())
    }

    fn fp_binary(&mut self, inst: &IrInst, op: FpOp) -> JitResult<()> {
        let a = self.fpr(inst.src1, MapMode::Read)?;
        let b = self.fpr(inst.src2, MapMode::Read)?;
        let d = self.fpr(inst.dest, MapMode::Write)?;
        self.enc().fp_op(op, d, a, b);
        Ok(())
    }

    fn fp_unary(&mut self, inst: &IrInst, op: FpUnary) -> JitResult<()> {
        let s = self.fpr(inst.src1, MapMode::Read)?;
        let d = self.fpr(inst.dest, MapMode::Write)?;
        self.enc().fp_unary(op, d, s);
        Ok(())
    }

    fn vec_binary(&mut self, inst: &IrInst, op: VecOp) -> JitResult<()> {
        let a = self.vec4(inst.src1, MapMode::Read)?;
        let b = self.vec4(inst.src2, MapMode::Read)?;
        let d = self.vec4(inst.dest, MapMode::Write)?;
        self.enc().vec_op(op, d, a, b);
        Ok(())
    }

    fn vec_unary<F>(&mut self, inst: &IrInst, emit: F) -> JitResult<()>
    where
        F: FnOnce(&mut Arm64Encoder, u8, u8),
    {
        let s = self.vec4(inst.src1, MapMode::Read)?;
        let d = self.vec4(inst.dest, MapMode::Write)?;
        emit(self.enc(), d, s);
        Ok(())
    }

    /// Map the base register of a memory operand. Emits no scratch code.
    fn plan_address(&mut self, base: usize, offset: u32, op: MemOp) -> JitResult<AddrPlan> {
        if let (Some(value), false) = (self.cache.imm(base), self.cache.is_static(base)) {
            return Ok(AddrPlan::Const(value.wrapping_add(offset)));
        }
        if self.cache.status(base) == RegStatus::InHostRegisterAsPointer && fits_scaled(op, offset) {
            let r = self.cache.map_gpr_as_pointer(base)?;
            return Ok(AddrPlan::Pointer(r, offset));
        }
        let r = self.gpr(base, MapMode::Read)?;
        Ok(AddrPlan::Guest(r, offset))
    }

    /// Emit the access `op` of register `rt` at `plan`.
    fn access(&mut self, op: MemOp, rt: u8, plan: AddrPlan) {
        let enc = self.enc();
        match plan {
            AddrPlan::Const(addr) => {
                enc.movi2r(SCRATCH1, addr);
                enc.mem_uxtw(op, rt, MEMBASE, SCRATCH1);
            }
            AddrPlan::Pointer(base, offset) => {
                let placed = enc.try_mem_imm(op, rt, base, offset);
                debug_assert!(placed, "pointer offset {:#x} does not fit {:?}", offset, op);
            }
            AddrPlan::Guest(base, 0) => enc.mem_uxtw(op, rt, MEMBASE, base),
            AddrPlan::Guest(base, offset) => {
                enc.add_i2r(SCRATCH1, base, offset, SCRATCH2);
                enc.mem_uxtw(op, rt, MEMBASE, SCRATCH1);
            }
        }
    }

    fn load_gpr(&mut self, inst: &IrInst, offset: u32, op: MemOp) -> JitResult<()> {
        let plan = self.plan_address(inst.src1 as usize, offset, op)?;
        let d = self.gpr(inst.dest as usize, MapMode::Write)?;
        self.access(op, d, plan);
        Ok(())
    }

    fn store_gpr(&mut self, inst: &IrInst, offset: u32, op: MemOp) -> JitResult<()> {
        let value = if self.cache.imm(inst.dest as usize) == Some(0) {
            ZR
        } else {
            self.gpr(inst.dest as usize, MapMode::Read)?
        };
        let plan = self.plan_address(inst.src1 as usize, offset, op)?;
        self.access(op, value, plan);
        Ok(())
    }

    fn store_pc(&mut self, value: GReg) {
        self.enc().mem_imm(MemOp::StrW, value, CTX, PC_OFFSET as u32, SCRATCH1);
    }

    /// Return `code` from the block through the shared epilogue.
    fn leave(&mut self, code: u32) {
        self.enc().movz(false, 0, code as u16, 0);
        let branch = self.enc().b();
        self.exits.push(branch);
    }

    fn exit_to_const(&mut self, target: u32) {
        self.enc().movi2r(SCRATCH2, target);
        self.store_pc(SCRATCH2);
        self.leave(1);
    }

    fn conditional_exit(&mut self, inst: &IrInst, target: u32) -> JitResult<()> {
        self.cache.flush_all()?;
        let a = self.gpr(inst.src1 as usize, MapMode::Read)?;
        let (b, cond) = match inst.op {
            Op::ExitToConstIfEq => (self.gpr(inst.src2 as usize, MapMode::Read)?, Cond::Eq),
            Op::ExitToConstIfNeq => (self.gpr(inst.src2 as usize, MapMode::Read)?, Cond::Ne),
            Op::ExitToConstIfGtZ => (ZR, Cond::Gt),
            Op::ExitToConstIfGeZ => (ZR, Cond::Ge),
            Op::ExitToConstIfLtZ => (ZR, Cond::Lt),
            _ => (ZR, Cond::Le),
        };
        self.enc().cmp(false, a, b);
        let skip = self.enc().b_cond(cond.invert());
        self.exit_to_const(target);
        self.enc().set_jump_target(skip);
        Ok(())
    }

    fn compile_fallback(&mut self, inst: &IrInst, constant: u32) -> JitResult<()> {
        warn!("arm64: {} lowered as an interpreter call", inst.op);
        let writes = inst.write_slots();
        self.cache.flush_before_call(&writes)?;
        let enc = self.enc();
        enc.mov(true, 0, CTX);
        enc.mov(true, 1, MEMBASE);
        enc.movi2r64(2, pack_inst(inst, constant));
        enc.movi2r64(SCRATCH1, interpret_one as *const () as usize as u64);
        enc.blr(SCRATCH1);
        let done = enc.cbnz(false, 0);
        self.exits.push(done);
        self.cache.reload_after_call(&writes)
    }

    fn compile_inst(&mut self, inst: &IrInst, constant: u32) -> JitResult<()> {
        let d = inst.dest as usize;
        let s1 = inst.src1 as usize;
        match inst.op {
            Op::SetConst => self.cache.set_imm(d, constant)?,
            Op::SetConstF => {
                let f = self.fpr(inst.dest, MapMode::Write)?;
                let enc = self.enc();
                if constant == 0 {
                    enc.fmov_from_gpr(f, ZR);
                } else {
                    enc.movi2r(SCRATCH1, constant);
                    enc.fmov_from_gpr(f, SCRATCH1);
                }
            }
            Op::Mov => self.move_slot(d, s1)?,
            Op::Downcount => {
                let enc = self.enc();
                enc.mem_imm(MemOp::LdrW, SCRATCH1, CTX, DOWNCOUNT_OFFSET as u32, SCRATCH2);
                enc.add_i2r(SCRATCH1, SCRATCH1, constant.wrapping_neg(), SCRATCH2);
                enc.mem_imm(MemOp::StrW, SCRATCH1, CTX, DOWNCOUNT_OFFSET as u32, SCRATCH2);
            }
            Op::SetPC => {
                let s = self.gpr(s1, MapMode::Read)?;
                self.store_pc(s);
            }
            Op::SetPCConst => {
                self.enc().movi2r(SCRATCH2, constant);
                self.store_pc(SCRATCH2);
            }

            Op::Add => self.binary(inst, |e, d, a, b| e.add(false, d, a, b))?,
            Op::Sub => self.binary(inst, |e, d, a, b| e.sub(false, d, a, b))?,
            Op::And => self.binary(inst, |e, d, a, b| e.logic(LogicOp::And, d, a, b))?,
            Op::Or => self.binary(inst, |e, d, a, b| e.logic(LogicOp::Orr, d, a, b))?,
            Op::Xor => self.binary(inst, |e, d, a, b| e.logic(LogicOp::Eor, d, a, b))?,
            Op::AddConst => self.unary(inst, |e, d, s| e.add_i2r(d, s, constant, SCRATCH1))?,
            Op::SubConst => {
                self.unary(inst, |e, d, s| e.add_i2r(d, s, constant.wrapping_neg(), SCRATCH1))?
            }
            Op::AndConst => {
                self.unary(inst, |e, d, s| e.logic_i2r(LogicOp::And, d, s, constant, SCRATCH1))?
            }
            Op::OrConst => {
                self.unary(inst, |e, d, s| e.logic_i2r(LogicOp::Orr, d, s, constant, SCRATCH1))?
            }
            Op::XorConst => {
                self.unary(inst, |e, d, s| e.logic_i2r(LogicOp::Eor, d, s, constant, SCRATCH1))?
            }
            Op::Neg => self.unary(inst, |e, d, s| e.neg(false, d, s))?,
            Op::Not => self.unary(inst, |e, d, s| e.mvn(d, s))?,
            Op::Ext8to32 => self.unary(inst, |e, d, s| e.sxtb(d, s))?,
            Op::Ext16to32 => self.unary(inst, |e, d, s| e.sxth(d, s))?,
            Op::BSwap16 => self.unary(inst, |e, d, s| e.rev16(d, s))?,
            Op::BSwap32 => self.unary(inst, |e, d, s| e.rev(d, s))?,
            Op::Clz => self.unary(inst, |e, d, s| e.clz(d, s))?,
            Op::ReverseBits => self.unary(inst, |e, d, s| e.rbit(d, s))?,

            Op::Shl => self.binary(inst, |e, d, a, b| e.lslv(d, a, b))?,
            Op::Shr => self.binary(inst, |e, d, a, b| e.lsrv(d, a, b))?,
            Op::Sar => self.binary(inst, |e, d, a, b| e.asrv(d, a, b))?,
            Op::Ror => self.binary(inst, |e, d, a, b| e.rorv(d, a, b))?,
            Op::ShlImm => self.unary(inst, |e, d, s| e.lsl_imm(d, s, inst.src2 as u32))?,
            Op::ShrImm => self.unary(inst, |e, d, s| e.lsr_imm(d, s, inst.src2 as u32))?,
            Op::SarImm => self.unary(inst, |e, d, s| e.asr_imm(d, s, inst.src2 as u32))?,
            Op::RorImm => self.unary(inst, |e, d, s| e.ror_imm(d, s, inst.src2 as u32))?,

            Op::Slt | Op::SltU => {
                let cond = if inst.op == Op::Slt { Cond::Lt } else { Cond::Lo };
                self.binary(inst, |e, d, a, b| {
                    e.cmp(false, a, b);
                    e.cset(d, cond);
                })?
            }
            Op::SltConst | Op::SltUConst => {
                let cond = if inst.op == Op::SltConst { Cond::Lt } else { Cond::Lo };
                self.unary(inst, |e, d, s| {
                    e.cmp_i2r(s, constant, SCRATCH1);
                    e.cset(d, cond);
                })?
            }
            Op::MovZ | Op::MovNZ => {
                let c = self.gpr(s1, MapMode::Read)?;
                let v = self.gpr(inst.src2 as usize, MapMode::Read)?;
                let r = self.gpr(d, MapMode::ReadWrite)?;
                let cond = if inst.op == Op::MovZ { Cond::Eq } else { Cond::Ne };
                let enc = self.enc();
                enc.cmp(false, c, ZR);
                enc.csel(r, v, r, cond);
            }
            Op::Max | Op::Min => {
                let cond = if inst.op == Op::Max { Cond::Gt } else { Cond::Lt };
                self.binary(inst, |e, d, a, b| {
                    e.cmp(false, a, b);
                    e.csel(d, a, b, cond);
                })?
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
                let enc = self.enc();
                if inst.op == Op::Mult {
                    enc.smull(SCRATCH1, a, b);
                } else {
                    enc.umull(SCRATCH1, a, b);
                }
                enc.mov(false, lo, SCRATCH1);
                enc.lsr_imm64(hi, SCRATCH1, 32);
            }

            Op::Load8 => self.load_gpr(inst, constant, MemOp::Ldrb)?,
            Op::Load8Ext => self.load_gpr(inst, constant, MemOp::Ldrsb)?,
            Op::Load16 => self.load_gpr(inst, constant, MemOp::Ldrh)?,
            Op::Load16Ext => self.load_gpr(inst, constant, MemOp::Ldrsh)?,
            Op::Load32 => self.load_gpr(inst, constant, MemOp::LdrW)?,
            Op::LoadFloat => {
                let plan = self.plan_address(s1, constant, MemOp::LdrS)?;
                let f = self.fpr(inst.dest, MapMode::Write)?;
                self.access(MemOp::LdrS, f, plan);
            }
            Op::LoadVec4 => {
                let plan = self.plan_address(s1, constant, MemOp::LdrQ)?;
                let v = self.vec4(inst.dest, MapMode::Write)?;
                self.access(MemOp::LdrQ, v, plan);
            }
            Op::Store8 => self.store_gpr(inst, constant, MemOp::Strb)?,
            Op::Store16 => self.store_gpr(inst, constant, MemOp::Strh)?,
            Op::Store32 => self.store_gpr(inst, constant, MemOp::StrW)?,
            Op::StoreFloat => {
                let f = self.fpr(inst.dest, MapMode::Read)?;
                let plan = self.plan_address(s1, constant, MemOp::StrS)?;
                self.access(MemOp::StrS, f, plan);
            }
            Op::StoreVec4 => {
                let v = self.vec4(inst.dest, MapMode::Read)?;
                let plan = self.plan_address(s1, constant, MemOp::StrQ)?;
                self.access(MemOp::StrQ, v, plan);
            }

            Op::FAdd => self.fp_binary(inst, FpOp::Add)?,
            Op::FSub => self.fp_binary(inst, FpOp::Sub)?,
            Op::FMul => self.fp_binary(inst, FpOp::Mul)?,
            Op::FDiv => self.fp_binary(inst, FpOp::Div)?,
            Op::FSqrt => self.fp_unary(inst, FpUnary::Sqrt)?,
            Op::FNeg => self.fp_unary(inst, FpUnary::Neg)?,
            Op::FAbs => self.fp_unary(inst, FpUnary::Abs)?,
            Op::FMov => self.fp_unary(inst, FpUnary::Mov)?,
            Op::FCvtSW => {
                let s = self.fpr(inst.src1, MapMode::Read)?;
                let f = self.fpr(inst.dest, MapMode::Write)?;
                self.enc().scvtf_vec(f, s);
            }
            Op::FMovFromGPR => {
                let s = self.gpr(s1, MapMode::Read)?;
                let f = self.fpr(inst.dest, MapMode::Write)?;
                self.enc().fmov_from_gpr(f, s);
            }
            Op::FMovToGPR => {
                let f = self.fpr(inst.src1, MapMode::Read)?;
                let r = self.gpr(d, MapMode::Write)?;
                self.enc().fmov_to_gpr(r, f);
            }

            Op::Vec4Init => {
                let v = self.vec4(inst.dest, MapMode::Write)?;
                let enc = self.enc();
                match inst.src1 % 7 {
                    0 => enc.vec_zero(v),
                    // 1.0 and -1.0 in the 8-bit float immediate encoding.
                    1 => enc.vec_fmov_imm(v, 0x70),
                    2 => enc.vec_fmov_imm(v, 0xF0),
                    lane => {
                        enc.vec_zero(v);
                        enc.movi2r(SCRATCH1, 1.0f32.to_bits());
                        enc.ins_gpr(v, lane - 3, SCRATCH1);
                    }
                }
            }
            Op::Vec4Shuffle => {
                let s = self.vec4(inst.src1, MapMode::Read)?;
                let v = self.vec4(inst.dest, MapMode::Write)?;
                let enc = self.enc();
                let from = if s == v {
                    enc.vec_mov(VSCRATCH0, s);
                    VSCRATCH0
                } else {
                    s
                };
                for lane in 0..4u8 {
                    enc.ins_lane(v, lane, from, (inst.src2 >> (lane * 2)) & 3);
                }
            }
            Op::Vec4Mov => self.vec_unary(inst, |e, d, s| {
                if d != s {
                    e.vec_mov(d, s);
                }
            })?,
            Op::Vec4Add => self.vec_binary(inst, VecOp::Add)?,
            Op::Vec4Sub => self.vec_binary(inst, VecOp::Sub)?,
            Op::Vec4Mul => self.vec_binary(inst, VecOp::Mul)?,
            Op::Vec4Div => self.vec_binary(inst, VecOp::Div)?,
            Op::Vec4Scale => {
                let s = self.vec4(inst.src1, MapMode::Read)?;
                let f = self.fpr(inst.src2, MapMode::Read)?;
                let v = self.vec4(inst.dest, MapMode::Write)?;
                self.enc().vec_fmul_elem(v, s, f, 0);
            }
            Op::Vec4Neg => self.vec_unary(inst, |e, d, s| e.vec_fneg(d, s))?,
            Op::Vec4Abs => self.vec_unary(inst, |e, d, s| e.vec_fabs(d, s))?,

            Op::ExitToConst => {
                self.cache.flush_all()?;
                self.exit_to_const(constant);
            }
            Op::ExitToReg => {
                self.cache.flush_all()?;
                let s = self.gpr(s1, MapMode::Read)?;
                self.store_pc(s);
                self.leave(1);
            }
            Op::ExitToConstIfEq
            | Op::ExitToConstIfNeq
            | Op::ExitToConstIfGtZ
            | Op::ExitToConstIfGeZ
            | Op::ExitToConstIfLtZ
            | Op::ExitToConstIfLeZ => self.conditional_exit(inst, constant)?,
            Op::ExitToPC => {
                self.cache.flush_all()?;
                self.leave(1);
            }
            Op::Syscall => {
                self.cache.flush_all()?;
                let enc = self.enc();
                enc.movi2r(SCRATCH2, constant);
                enc.mem_imm(MemOp::StrW, SCRATCH2, CTX, SYSCALL_OFFSET as u32, SCRATCH1);
                self.leave(1);
            }

            op => unreachable!("arm64 backend has no native lowering for {}", op),
        }
        Ok(())
    }
}

/// Compile `program` for AArch64.
pub fn compile_block(
    program: &IrProgram,
    options: &JitOptions,
    session: &JitSession<'_>,
) -> JitResult<CompiledBlock> {
    Arm64Backend::new(options).compile(program, session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TargetArch;
    use crate::ir::text::parse_program;
    use bumpalo::Bump;

    fn words(text: &str) -> Vec<u32> {
        let program = parse_program(text).unwrap();
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let options = JitOptions::for_target(TargetArch::Arm64).with_static_alloc(false);
        let block = compile_block(&program, &options, &session).unwrap();
        block
            .code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_empty_block_returns_zero() {
        let code = words("");
        assert_eq!(code[0], 0xA9B6_7BFD, "stp x29, x30, [sp, #-160]!");
        assert_eq!(*code.last().unwrap(), 0xD65F_03C0);
        // mov w0, #0 right before the restores
        assert!(code.contains(&0x5280_0000));
    }

    #[test]
    fn test_constant_store_uses_zero_register() {
        let code = words("SetConst r2, 0\nSetConst r1, 0x100\nStore32 r2, r1, 0x4\n");
        // movz w16, #0x104 then str wzr, [x28, w16, uxtw]
        assert!(code.contains(&(0x5280_0000 | 0x104 << 5 | 16)));
        assert!(code.contains(&(0xB820_0800 | 16 << 16 | 0b010 << 13 | 28 << 5 | 31)));
    }

    #[test]
    fn test_fallback_ops_call_interpreter() {
        let program = parse_program("DivU r1, r2\nAdd r3, r1, r2\n").unwrap();
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let options = JitOptions::for_target(TargetArch::Arm64);
        let block = compile_block(&program, &options, &session).unwrap();
        assert_eq!(block.fallback_ops, 1);
        assert_eq!(block.native_ops, 1);
        let stats = session.stats();
        assert_eq!(stats.fallback_calls, 1);
        assert_eq!(stats.op_counts.get("DivU"), Some(&1));
    }

    #[test]
    fn test_partial_vec4_overlap_falls_back() {
        let program = parse_program("Vec4Add f0, f2, f8\n").unwrap();
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let options = JitOptions::for_target(TargetArch::Arm64);
        let block = compile_block(&program, &options, &session).unwrap();
        assert_eq!(block.fallback_ops, 1);
    }

    #[test]
    fn test_conditional_exit_branches_over_stub() {
        let code = words("ExitToConstIfEq 0x08804000, r1, r2\nExitToConst 0x08804010\n");
        // b.ne over the stub, then str w17 to pc, mov w0, #1 and b to the epilogue
        assert!(code.iter().any(|w| w & 0xFF00_001F == 0x5400_0001));
        assert!(code.contains(&(0x5280_0000 | 1 << 5)));
    }
}
