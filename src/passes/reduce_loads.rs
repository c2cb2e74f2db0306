// This module narrows wide loads whose result is immediately masked. A Load32 (or Load16)
// whose destination is next read by an AndConst on the same register, with the mask fitting
// in 8 or 16 bits, can load only the bytes the mask keeps. When the mask is exactly the
// width of the narrower load the AndConst becomes redundant and is dropped as well. The
// forward scan from each load stops at the first exit or barrier, at the first instruction
// that reads the loaded register in any other way, and at the first one that overwrites it.

//! Load narrowing.

use super::PassContext;
use crate::core::error::JitResult;
use crate::ir::{IrInst, IrProgram, Op};

/// Narrowed op for `load` followed by an AND with `mask`, and whether the AND
/// is still needed afterwards.
fn narrow(load: Op, mask: u32) -> Option<(Op, bool)> {
    match load {
        Op::Load32 | Op::Load16 | Op::Load16Ext if mask & !0xff == 0 => {
            Some((Op::Load8, mask != 0xff))
        }
        Op::Load32 if mask & !0xffff == 0 => Some((Op::Load16, mask != 0xffff)),
        _ => None,
    }
}

/// Run load narrowing over `input`.
pub fn run(input: &IrProgram, _cx: &PassContext<'_, '_>) -> JitResult<(IrProgram, bool)> {
    let insts = input.insts();
    let mut rewritten: Vec<IrInst> = insts.to_vec();
    let mut skip = vec![false; insts.len()];

    for (i, load) in insts.iter().enumerate() {
        if !matches!(load.op, Op::Load32 | Op::Load16 | Op::Load16Ext) || load.dest == 0 {
            continue;
        }
        let reg = load.dest;
        for (j, next) in insts.iter().enumerate().skip(i + 1) {
            if next.is_exit() || next.is_barrier() {
                break;
            }
            if next.reads_gpr(reg) {
                if next.op == Op::AndConst && next.src1 == reg && next.dest == reg {
                    let mask = input.constant_of(next).unwrap_or(u32::MAX);
                    if let Some((op, keep_and)) = narrow(load.op, mask) {
                        rewritten[i].op = op;
                        skip[j] = !keep_and;
                    }
                }
                break;
            }
            if next.dest_gpr() == Some(reg) {
                break;
            }
        }
    }

    let mut out = IrProgram::with_capacity(insts.len());
    for (inst, skipped) in rewritten.into_iter().zip(skip) {
        if !skipped {
            out.append_from(inst, input)?;
        }
    }
    let changed = out != *input;
    Ok((out, changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::JitSession;
    use crate::ir::text::parse_program;
    use crate::passes::PassOptions;
    use bumpalo::Bump;

    fn expect(text: &str, expected: &str) {
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let cx = PassContext::new(&session, PassOptions::default());
        let (out, _) = run(&parse_program(text).unwrap(), &cx).unwrap();
        assert_eq!(out, parse_program(expected).unwrap(), "got:\n{}", out);
    }

    #[test]
    fn test_byte_mask_drops_and() {
        expect(
            "Load32 r2, r4, 0x10\nAndConst r2, r2, 0xff\n",
            "Load8 r2, r4, 0x10\n",
        );
    }

    #[test]
    fn test_halfword_mask_drops_and() {
        expect(
            "Load32 r2, r4, 0x10\nAndConst r2, r2, 0xffff\n",
            "Load16 r2, r4, 0x10\n",
        );
    }

    #[test]
    fn test_narrow_mask_keeps_and() {
        expect(
            "Load32 r2, r4, 0\nAdd r5, r6, r7\nAndConst r2, r2, 0x7f\n",
            "Load8 r2, r4, 0\nAdd r5, r6, r7\nAndConst r2, r2, 0x7f\n",
        );
    }

    #[test]
    fn test_sign_extended_halfword_narrowed_to_byte() {
        expect(
            "Load16Ext r2, r4, 0\nAndConst r2, r2, 0xff\n",
            "Load8 r2, r4, 0\n",
        );
        expect(
            "Load16Ext r2, r4, 0\nAndConst r2, r2, 0xfff\n",
            "Load16Ext r2, r4, 0\nAndConst r2, r2, 0xfff\n",
        );
    }

    #[test]
    fn test_scan_stops() {
        // Other reader first.
        expect(
            "Load32 r2, r4, 0\nMov r3, r2\nAndConst r2, r2, 0xff\n",
            "Load32 r2, r4, 0\nMov r3, r2\nAndConst r2, r2, 0xff\n",
        );
        // Mask into another register.
        expect(
            "Load32 r2, r4, 0\nAndConst r3, r2, 0xff\n",
            "Load32 r2, r4, 0\nAndConst r3, r2, 0xff\n",
        );
        // Exit in between.
        expect(
            "Load32 r2, r4, 0\nExitToConstIfEq 0x40, r5, r6\nAndConst r2, r2, 0xff\n",
            "Load32 r2, r4, 0\nExitToConstIfEq 0x40, r5, r6\nAndConst r2, r2, 0xff\n",
        );
    }
}
