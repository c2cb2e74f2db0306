// This module holds the three small peephole passes that do not need any state beyond the
// previous instruction. fp_moves forwards a float that round-trips through an integer
// register straight into the destination float register; the round trip back into the
// source register is dropped and leaves the integer copy available for the next forward.
// three_op_to_two_op rewrites integer and scalar float arithmetic whose destination differs
// from both sources into a move plus a destructive two-operand op, the shape an x86 encoder
// wants. Vector ops are left alone: their operands are four-lane groups that may overlap
// without coinciding, so a move into the destination group could clobber lanes of the
// second source. loads_after_stores drops a reload of the exact location just stored from
// the register that was stored.

//! Peephole simplifications.

use super::PassContext;
use crate::core::error::JitResult;
use crate::ir::{IrInst, IrProgram, Op};

fn finish(out: IrProgram, input: &IrProgram) -> JitResult<(IrProgram, bool)> {
    let changed = out != *input;
    Ok((out, changed))
}

/// Forward `FMovToGPR g, fa` + `FMovFromGPR fb, g` into `FMov fb, fa`.
pub fn fp_moves(input: &IrProgram, _cx: &PassContext<'_, '_>) -> JitResult<(IrProgram, bool)> {
    let mut out = IrProgram::with_capacity(input.len());
    let mut prev: Option<IrInst> = None;

    for inst in input.insts() {
        let mut inst = *inst;
        if let Some(p) = prev {
            if inst.op == Op::FMovFromGPR && p.op == Op::FMovToGPR && p.dest == inst.src1 {
                if inst.dest == p.src1 {
                    // Round trip into the same register; `p` still describes the GPR.
                    continue;
                }
                inst = IrInst::new(Op::FMov, inst.dest, p.src1, 0);
            }
        }
        out.append_from(inst, input)?;
        prev = Some(inst);
    }
    finish(out, input)
}

fn two_op_move(op: Op) -> Option<Op> {
    match op {
        Op::Add | Op::Sub | Op::And | Op::Or | Op::Xor | Op::Slt | Op::SltU => Some(Op::Mov),
        Op::FAdd | Op::FSub | Op::FMul | Op::FDiv => Some(Op::FMov),
        _ => None,
    }
}

/// Split `d = a op b` with `d` distinct from both sources into `d = a; d = d op b`.
pub fn three_op_to_two_op(
    input: &IrProgram,
    _cx: &PassContext<'_, '_>,
) -> JitResult<(IrProgram, bool)> {
    let mut out = IrProgram::with_capacity(input.len() + input.len() / 4);

    for inst in input.insts() {
        match two_op_move(inst.op) {
            Some(mov)
                if inst.dest != inst.src1
                    && inst.dest != inst.src2
                    && !(mov == Op::Mov && inst.dest == 0) =>
            {
                out.append(mov, inst.dest, inst.src1, 0);
                out.append(inst.op, inst.dest, inst.dest, inst.src2);
            }
            _ => out.append_from(*inst, input)?,
        }
    }
    finish(out, input)
}

/// Drop loads that re-read exactly what the previous store wrote.
pub fn loads_after_stores(
    input: &IrProgram,
    _cx: &PassContext<'_, '_>,
) -> JitResult<(IrProgram, bool)> {
    let insts = input.insts();
    let mut out = IrProgram::with_capacity(insts.len());
    let mut i = 0;

    while i < insts.len() {
        let inst = insts[i];
        out.append_from(inst, input)?;
        i += 1;

        let reload = match inst.op {
            Op::Store32 => Op::Load32,
            Op::StoreVec4 => Op::LoadVec4,
            _ => continue,
        };
        let offset = input.constant_of(&inst);
        while i < insts.len() {
            let next = insts[i];
            if next.op != reload
                || next.dest != inst.dest
                || next.src1 != inst.src1
                || input.constant_of(&next) != offset
            {
                break;
            }
            i += 1;
        }
    }
    finish(out, input)
}
