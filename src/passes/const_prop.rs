// This module implements constant propagation over a single block. A symbolic cache records,
// for each integer-class IR register, whether its current value is a known immediate. SetConst
// only updates the cache; arithmetic on known operands is folded into the cache as well, and
// ops with one known operand are rewritten into their register-plus-constant or
// immediate-shift forms. A known value is materialized as a SetConst (a "flush") only when
// some instruction needs it in a register, immediately before that instruction. Flushing
// does not forget the value: the cache also remembers which constant the output has already
// placed in each register, so later reads still fold and a value the register already holds
// is never written again. Loads and
// stores whose base register is known are re-based on r0 with the address folded into the
// offset constant, and conditional exits whose operands are all known either become an
// unconditional exit or disappear. Every exit, barrier and unmodelled op flushes the whole
// cache first, since the guest state must be exact when control leaves the block, and the
// block ends with a final flush. r0 is permanently known to be zero and is never flushed.

//! Constant propagation.

use super::PassContext;
use crate::core::error::JitResult;
use crate::ir::regs::{is_gpr_slot, IrReg, REG_FPCOND, TOTAL_IR_REGS};
use crate::ir::{IrInst, IrProgram, Op};
use log::trace;

/// Fold a two-operand integer op. Shift amounts are masked like the interpreter does.
pub fn evaluate_binary(op: Op, a: u32, b: u32) -> u32 {
    match op {
        Op::Add | Op::AddConst => a.wrapping_add(b),
        Op::Sub | Op::SubConst => a.wrapping_sub(b),
        Op::And | Op::AndConst => a & b,
        Op::Or | Op::OrConst => a | b,
        Op::Xor | Op::XorConst => a ^ b,
        Op::Shl | Op::ShlImm => a << (b & 31),
        Op::Shr | Op::ShrImm => a >> (b & 31),
        Op::Sar | Op::SarImm => ((a as i32) >> (b & 31)) as u32,
        Op::Ror | Op::RorImm => a.rotate_right(b & 31),
        Op::Slt | Op::SltConst => ((a as i32) < (b as i32)) as u32,
        Op::SltU | Op::SltUConst => (a < b) as u32,
        _ => unreachable!("unable to evaluate two-operand {}", op),
    }
}

/// Fold a one-operand integer op.
pub fn evaluate_unary(op: Op, a: u32) -> u32 {
    match op {
        Op::Not => !a,
        Op::Neg => a.wrapping_neg(),
        Op::BSwap16 => ((a & 0xff00_ff00) >> 8) | ((a & 0x00ff_00ff) << 8),
        Op::BSwap32 => a.swap_bytes(),
        Op::Ext8to32 => a as u8 as i8 as i32 as u32,
        Op::Ext16to32 => a as u16 as i16 as i32 as u32,
        Op::ReverseBits => a.reverse_bits(),
        Op::Clz => a.leading_zeros(),
        _ => unreachable!("unable to evaluate one-operand {}", op),
    }
}

/// Known-immediate cache plus the program being written.
struct ImmCache {
    imm: [Option<u32>; TOTAL_IR_REGS],
    /// Constant the output program has already left in each register.
    written: [Option<u32>; TOTAL_IR_REGS],
    out: IrProgram,
}

impl ImmCache {
    fn new(capacity: usize) -> Self {
        let mut imm = [None; TOTAL_IR_REGS];
        imm[0] = Some(0);
        Self {
            imm,
            written: [None; TOTAL_IR_REGS],
            out: IrProgram::with_capacity(capacity),
        }
    }

    fn get(&self, reg: IrReg) -> Option<u32> {
        self.imm[reg as usize]
    }

    fn is_imm(&self, reg: IrReg) -> bool {
        self.imm[reg as usize].is_some()
    }

    fn set_imm(&mut self, reg: IrReg, value: u32) {
        if reg != 0 {
            self.imm[reg as usize] = Some(value);
        }
    }

    /// The register now holds something unknown, in the cache and in the output.
    fn discard(&mut self, reg: IrReg) {
        if reg != 0 {
            self.imm[reg as usize] = None;
            self.written[reg as usize] = None;
        }
    }

    fn flush(&mut self, reg: IrReg) -> JitResult<()> {
        if reg == 0 {
            return Ok(());
        }
        if let Some(value) = self.imm[reg as usize] {
            if self.written[reg as usize] != Some(value) {
                self.out.set_const(reg, value)?;
                self.written[reg as usize] = Some(value);
            }
        }
        Ok(())
    }

    fn flush_all(&mut self) -> JitResult<()> {
        for reg in 1..TOTAL_IR_REGS {
            self.flush(reg as IrReg)?;
        }
        Ok(())
    }

    fn map_dirty_in(&mut self, dest: IrReg, src: IrReg) -> JitResult<()> {
        if dest != src {
            self.discard(dest);
        }
        self.flush(src)
    }

    /// Write `inst` with `constant` as its constant operand, first flushing every known
    /// register it reads and forgetting every register it writes.
    fn emit(&mut self, inst: IrInst, constant: Option<u32>) -> JitResult<()> {
        for slot in inst.read_slots() {
            if is_gpr_slot(slot) {
                self.flush(slot as IrReg)?;
            }
        }
        for slot in inst.write_slots() {
            if is_gpr_slot(slot) {
                self.discard(slot as IrReg);
            }
        }
        let mut inst = inst;
        if let Some(value) = constant {
            inst.set_constant_index(self.out.add_constant(value)?);
        }
        self.out.push(inst);
        Ok(())
    }

    fn write_const_op(&mut self, op: Op, dest: IrReg, src1: IrReg, value: u32) -> JitResult<()> {
        let c = self.out.add_constant(value)?;
        self.out.append(op, dest, src1, c);
        Ok(())
    }

    fn write_mov(&mut self, dest: IrReg, src: IrReg) {
        if dest != src {
            self.out.append(Op::Mov, dest, src, 0);
        }
    }
}

fn exit_taken(op: Op, a: u32, b: u32) -> bool {
    match op {
        Op::ExitToConstIfEq => a == b,
        Op::ExitToConstIfNeq => a != b,
        Op::ExitToConstIfGtZ => (a as i32) > 0,
        Op::ExitToConstIfGeZ => (a as i32) >= 0,
        Op::ExitToConstIfLtZ => (a as i32) < 0,
        Op::ExitToConstIfLeZ => (a as i32) <= 0,
        _ => unreachable!("{} is not a conditional exit", op),
    }
}

/// Run constant propagation over `input`.
pub fn run(input: &IrProgram, cx: &PassContext<'_, '_>) -> JitResult<(IrProgram, bool)> {
    let mut gpr = ImmCache::new(input.len());
    let mut skip_next_exit_to_const = false;
    let constant_limit = input.constants().len() + cx.options.constant_cap;

    let insts = input.insts();
    for (i, original) in insts.iter().enumerate() {
        if gpr.out.constants().len() > constant_limit {
            trace!(
                "const-prop: constant cap reached at instruction {}, passing the rest through",
                i
            );
            gpr.flush_all()?;
            for inst in &insts[i..] {
                gpr.out.append_from(*inst, input)?;
            }
            break;
        }

        let mut inst = *original;
        let constant = input.constant_of(&inst);
        let c = constant.unwrap_or(0);

        match inst.op {
            Op::SetConst => gpr.set_imm(inst.dest, c),

            Op::Sub if gpr.get(inst.src1) == Some(0) && !gpr.is_imm(inst.src2) => {
                gpr.map_dirty_in(inst.dest, inst.src2)?;
                gpr.out.append(Op::Neg, inst.dest, inst.src2, 0);
            }
            Op::Sub if inst.src1 == inst.src2 => gpr.set_imm(inst.dest, 0),

            Op::Add | Op::Sub | Op::And | Op::Or | Op::Xor | Op::Slt | Op::SltU => {
                let symmetric = !matches!(inst.op, Op::Sub | Op::Slt | Op::SltU);
                if symmetric && inst.src2 == inst.dest && inst.src1 != inst.src2 {
                    std::mem::swap(&mut inst.src1, &mut inst.src2);
                }
                let (imm1, imm2) = (gpr.get(inst.src1), gpr.get(inst.src2));
                let zero_is_mov = matches!(inst.op, Op::Add | Op::Sub | Op::Or | Op::Xor);

                match (imm1, imm2) {
                    (Some(a), Some(b)) => gpr.set_imm(inst.dest, evaluate_binary(inst.op, a, b)),
                    (Some(0), _) | (_, Some(0)) if inst.op == Op::And => gpr.set_imm(inst.dest, 0),
                    (_, Some(b)) => {
                        gpr.map_dirty_in(inst.dest, inst.src1)?;
                        if b == 0 && zero_is_mov {
                            gpr.write_mov(inst.dest, inst.src1);
                        } else if let Some(op) = inst.op.to_const_form() {
                            gpr.write_const_op(op, inst.dest, inst.src1, b)?;
                        }
                    }
                    (Some(a), None) if symmetric => {
                        gpr.map_dirty_in(inst.dest, inst.src2)?;
                        if a == 0 && zero_is_mov {
                            gpr.write_mov(inst.dest, inst.src2);
                        } else if let Some(op) = inst.op.to_const_form() {
                            gpr.write_const_op(op, inst.dest, inst.src2, a)?;
                        }
                    }
                    _ => gpr.emit(inst, None)?,
                }
            }

            Op::Neg
            | Op::Not
            | Op::BSwap16
            | Op::BSwap32
            | Op::Ext8to32
            | Op::Ext16to32
            | Op::ReverseBits
            | Op::Clz => match gpr.get(inst.src1) {
                Some(a) => gpr.set_imm(inst.dest, evaluate_unary(inst.op, a)),
                None => gpr.emit(inst, None)?,
            },

            Op::AddConst
            | Op::SubConst
            | Op::AndConst
            | Op::OrConst
            | Op::XorConst
            | Op::SltConst
            | Op::SltUConst => {
                let zero_is_mov =
                    matches!(inst.op, Op::AddConst | Op::SubConst | Op::OrConst | Op::XorConst);
                if inst.op == Op::AndConst && c == 0 {
                    gpr.set_imm(inst.dest, 0);
                } else if let Some(a) = gpr.get(inst.src1) {
                    gpr.set_imm(inst.dest, evaluate_binary(inst.op, a, c));
                } else if c == 0 && zero_is_mov {
                    gpr.map_dirty_in(inst.dest, inst.src1)?;
                    gpr.write_mov(inst.dest, inst.src1);
                } else {
                    gpr.emit(inst, constant)?;
                }
            }

            Op::Shl | Op::Shr | Op::Sar | Op::Ror => {
                match (gpr.get(inst.src1), gpr.get(inst.src2)) {
                    (Some(a), Some(b)) => {
                        gpr.set_imm(inst.dest, evaluate_binary(inst.op, a, b))
                    }
                    (_, Some(b)) => {
                        let sa = (b & 31) as u8;
                        gpr.map_dirty_in(inst.dest, inst.src1)?;
                        if sa == 0 {
                            gpr.write_mov(inst.dest, inst.src1);
                        } else if let Some(op) = inst.op.to_imm_shift() {
                            gpr.out.append(op, inst.dest, inst.src1, sa);
                        }
                    }
                    _ => gpr.emit(inst, None)?,
                }
            }

            Op::ShlImm | Op::ShrImm | Op::SarImm | Op::RorImm => match gpr.get(inst.src1) {
                Some(a) => {
                    gpr.set_imm(inst.dest, evaluate_binary(inst.op, a, inst.src2 as u32))
                }
                None => gpr.emit(inst, None)?,
            },

            Op::Mov => {
                if inst.dest == inst.src1 {
                    // Nothing to do.
                } else if let Some(a) = gpr.get(inst.src1) {
                    gpr.set_imm(inst.dest, a);
                } else {
                    gpr.emit(inst, None)?;
                }
            }

            Op::FMovFromGPR => match gpr.get(inst.src1) {
                Some(a) => {
                    let idx = gpr.out.add_constant(a)?;
                    gpr.out.append(Op::SetConstF, inst.dest, idx, 0);
                }
                None => gpr.emit(inst, None)?,
            },

            Op::Store8
            | Op::Store16
            | Op::Store32
            | Op::Store32Left
            | Op::Store32Right
            | Op::Store32Conditional
            | Op::Load8
            | Op::Load8Ext
            | Op::Load16
            | Op::Load16Ext
            | Op::Load32
            | Op::Load32Linked => match gpr.get(inst.src1) {
                Some(base) if inst.src1 != inst.dest => {
                    inst.src1 = 0;
                    gpr.emit(inst, Some(base.wrapping_add(c)))?;
                }
                _ => gpr.emit(inst, constant)?,
            },

            Op::Load32Left
            | Op::Load32Right
            | Op::LoadFloat
            | Op::LoadVec4
            | Op::StoreFloat
            | Op::StoreVec4 => match gpr.get(inst.src1) {
                Some(base) => {
                    inst.src1 = 0;
                    gpr.emit(inst, Some(base.wrapping_add(c)))?;
                }
                None => gpr.emit(inst, constant)?,
            },

            Op::SetPC => match gpr.get(inst.src1) {
                Some(a) => {
                    let idx = gpr.out.add_constant(a)?;
                    gpr.out.append(Op::SetPCConst, idx, 0, 0);
                }
                None => gpr.emit(inst, None)?,
            },

            Op::SetCtrlVFPUReg => match gpr.get(inst.src1) {
                Some(a) => gpr.emit(IrInst::new(Op::SetCtrlVFPU, inst.dest, 0, 0), Some(a))?,
                None => gpr.emit(inst, None)?,
            },

            Op::FpCondToReg => match gpr.get(REG_FPCOND) {
                Some(a) => gpr.set_imm(inst.dest, a),
                None => gpr.emit(inst, None)?,
            },

            Op::FAdd | Op::FMul => {
                if inst.src2 == inst.dest && inst.src1 != inst.src2 {
                    std::mem::swap(&mut inst.src1, &mut inst.src2);
                }
                gpr.emit(inst, None)?;
            }

            Op::ExitToConstIfEq | Op::ExitToConstIfNeq => {
                match (gpr.get(inst.src1), gpr.get(inst.src2)) {
                    (Some(a), Some(b)) => {
                        if exit_taken(inst.op, a, b) {
                            gpr.flush_all()?;
                            gpr.out.exit_to_const(c)?;
                            skip_next_exit_to_const = true;
                        }
                    }
                    _ => {
                        gpr.flush_all()?;
                        gpr.emit(inst, constant)?;
                    }
                }
            }

            Op::ExitToConstIfGtZ
            | Op::ExitToConstIfGeZ
            | Op::ExitToConstIfLtZ
            | Op::ExitToConstIfLeZ => match gpr.get(inst.src1) {
                Some(a) => {
                    if exit_taken(inst.op, a, 0) {
                        gpr.flush_all()?;
                        gpr.out.exit_to_const(c)?;
                        skip_next_exit_to_const = true;
                    }
                }
                None => {
                    gpr.flush_all()?;
                    gpr.emit(inst, constant)?;
                }
            },

            Op::ExitToConst => {
                if skip_next_exit_to_const {
                    skip_next_exit_to_const = false;
                } else {
                    gpr.flush_all()?;
                    gpr.emit(inst, constant)?;
                }
            }

            Op::ExitToReg => {
                let target = gpr.get(inst.src1);
                gpr.flush_all()?;
                match target {
                    Some(a) => gpr.out.exit_to_const(a)?,
                    None => gpr.emit(inst, None)?,
                }
            }

            // Ops with no integer-register folding: only flush what they read.
            Op::SetConstF
            | Op::Downcount
            | Op::SetPCConst
            | Op::SetCtrlVFPU
            | Op::MovZ
            | Op::MovNZ
            | Op::Max
            | Op::Min
            | Op::MtLo
            | Op::MtHi
            | Op::MfLo
            | Op::MfHi
            | Op::Mult
            | Op::MultU
            | Op::Madd
            | Op::MaddU
            | Op::Msub
            | Op::MsubU
            | Op::Div
            | Op::DivU
            | Op::FSub
            | Op::FDiv
            | Op::FMin
            | Op::FMax
            | Op::FSqrt
            | Op::FNeg
            | Op::FAbs
            | Op::FMov
            | Op::FRound
            | Op::FTrunc
            | Op::FCeil
            | Op::FFloor
            | Op::FCvtWS
            | Op::FCvtSW
            | Op::FCmp
            | Op::FMovToGPR
            | Op::FpCondFromReg
            | Op::Vec4Init
            | Op::Vec4Shuffle
            | Op::Vec4Blend
            | Op::Vec4Mov
            | Op::Vec4Add
            | Op::Vec4Sub
            | Op::Vec4Mul
            | Op::Vec4Div
            | Op::Vec4Scale
            | Op::Vec4Neg
            | Op::Vec4Abs
            | Op::Vec4Dot
            | Op::Vec4ClampToZero => gpr.emit(inst, constant)?,

            Op::Syscall | Op::ExitToPC | Op::Nop => {
                gpr.flush_all()?;
                gpr.emit(inst, constant)?;
            }
        }
    }
    gpr.flush_all()?;

    let changed = gpr.out != *input;
    Ok((gpr.out, changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::JitSession;
    use crate::ir::text::parse_program;
    use crate::passes::PassOptions;
    use bumpalo::Bump;

    fn propagate(text: &str) -> IrProgram {
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let cx = PassContext::new(&session, PassOptions::default());
        let input = parse_program(text).unwrap();
        run(&input, &cx).unwrap().0
    }

    fn expect(text: &str, expected: &str) {
        let out = propagate(text);
        assert_eq!(out, parse_program(expected).unwrap(), "got:\n{}", out);
    }

    #[test]
    fn test_fold_add_const() {
        expect(
            "SetConst r1, 10\nAddConst r2, r1, 5\nExitToConst 0x100\n",
            "SetConst r1, 0xa\nSetConst r2, 0xf\nExitToConst 0x100\n",
        );
    }

    #[test]
    fn test_known_operand_selects_const_form() {
        expect(
            "SetConst r1, 7\nAdd r3, r2, r1\nSub r4, r2, r1\nSlt r5, r1, r2\n",
            "AddConst r3, r2, 0x7\nSubConst r4, r2, 0x7\nSetConst r1, 0x7\nSlt r5, r1, r2\n",
        );
    }

    #[test]
    fn test_sub_from_zero_and_self() {
        expect("Sub r1, r0, r2\nSub r3, r4, r4\n", "Neg r1, r2\nSetConst r3, 0\n");
    }

    #[test]
    fn test_add_zero_becomes_mov() {
        expect("Add r1, r2, r0\nOr r3, r0, r3\n", "Mov r1, r2\n");
    }

    #[test]
    fn test_shift_by_known_amount() {
        expect(
            "SetConst r2, 35\nShl r1, r3, r2\nSetConst r2, 32\nSar r4, r3, r2\n",
            "ShlImm r1, r3, 3\nMov r4, r3\nSetConst r2, 0x20\n",
        );
    }

    #[test]
    fn test_store_rebased_on_r0() {
        expect(
            "SetConst r2, 100\nStore32 r1, r2, 4\n",
            "Store32 r1, r0, 0x68\nSetConst r2, 0x64\n",
        );
    }

    #[test]
    fn test_known_exit_swallows_next_exit() {
        expect(
            "SetConst r1, 3\nSetConst r2, 3\nExitToConstIfEq 0x200, r1, r2\nExitToConst 0x300\n",
            "SetConst r1, 0x3\nSetConst r2, 0x3\nExitToConst 0x200\n",
        );
        expect(
            "SetConst r1, 3\nExitToConstIfLtZ 0x200, r1\nExitToConst 0x300\n",
            "SetConst r1, 0x3\nExitToConst 0x300\n",
        );
    }

    #[test]
    fn test_exit_to_reg_becomes_const() {
        expect(
            "SetConst temp0, 0x400\nExitToReg temp0\n",
            "SetConst temp0, 0x400\nExitToConst 0x400\n",
        );
    }

    #[test]
    fn test_implicit_reads_are_flushed() {
        expect(
            "SetConst fpcond, 1\nFpCondToReg r1\nSetConst fcr31, 1\nFCvtWS f0, f1\n",
            "SetConst fcr31, 0x1\nFCvtWS f0, f1\nSetConst r1, 0x1\nSetConst fpcond, 0x1\n",
        );
    }

    #[test]
    fn test_fmov_from_known_gpr() {
        let out = propagate("SetConst r4, 0x3f800000\nFMovFromGPR f2, r4\n");
        assert_eq!(out.insts()[0].op, Op::SetConstF);
        assert_eq!(out.constant_of(&out.insts()[0]), Some(0x3f80_0000));
    }

    #[test]
    fn test_flushed_value_keeps_folding() {
        expect(
            "SetConst temp0, 0x1f\nShl r7, temp0, r3\nOr r6, temp0, temp0\nXor r3, r6, r5\n",
            "SetConst temp0, 0x1f\nShl r7, temp0, r3\nXorConst r3, r5, 0x1f\nSetConst r6, 0x1f\n",
        );
    }

    #[test]
    fn test_held_value_not_written_again() {
        expect(
            "SetConst r1, 5\nSlt r2, r1, r3\nSetConst r1, 9\nSetConst r1, 5\nSlt r4, r1, r3\n\
             ExitToConst 0x10\n",
            "SetConst r1, 0x5\nSlt r2, r1, r3\nSlt r4, r1, r3\nExitToConst 0x10\n",
        );
        // An unknown write forgets both the value and what the register held.
        expect(
            "SetConst r1, 5\nSlt r2, r1, r3\nLoad32 r1, r4, 0\nSetConst r1, 5\nSlt r5, r1, r3\n",
            "SetConst r1, 0x5\nSlt r2, r1, r3\nLoad32 r1, r4, 0\nSetConst r1, 0x5\n\
             Slt r5, r1, r3\n",
        );
    }

    #[test]
    fn test_idempotent() {
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let cx = PassContext::new(&session, PassOptions::default());
        let input = parse_program(
            "SetConst r2, 100\nAdd r1, r2, r3\nStore32 r1, r2, 4\nLoad32 r5, r1, 0\n\
             Add r6, r6, r5\nExitToConstIfNeq 0x10, r5, r6\nExitToConst 0x20\n",
        )
        .unwrap();
        let (once, changed) = run(&input, &cx).unwrap();
        assert!(changed);
        let (twice, changed_again) = run(&once, &cx).unwrap();
        assert_eq!(once, twice);
        assert!(!changed_again);
    }

    #[test]
    fn test_constant_cap_passes_rest_through() {
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let cx = PassContext::new(&session, PassOptions { constant_cap: 0 });
        let input = parse_program(
            "SetConst r1, 1\nAddConst r2, r1, 1\nAddConst r3, r2, 1\nAddConst r4, r3, 1\n\
             Mult r2, r3\nMult r4, r4\nAddConst r5, r6, 1\nAddConst r7, r1, 1\n",
        )
        .unwrap();
        let (out, _) = run(&input, &cx).unwrap();
        let expected = parse_program(
            "SetConst r2, 2\nSetConst r3, 3\nMult r2, r3\nSetConst r1, 1\nSetConst r4, 4\n\
             Mult r4, r4\nAddConst r5, r6, 1\nAddConst r7, r1, 1\n",
        )
        .unwrap();
        assert_eq!(out, expected, "got:\n{}", out);
    }
}
