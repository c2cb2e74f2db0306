// This module removes dead writes to integer registers. Walking the block forward, every
// instruction that writes an integer register opens a pending check on that register. A
// later read resolves the check as live; a later overwrite with no read in between proves the
// earlier write dead and it is deleted. The IR temporaries are block-scoped: exits do not
// observe them, so a temporary that is never read before the end of the block (or before an
// exit) is dead too. Architectural registers are observed by every exit, so their checks are
// resolved live when an exit is reached, and they are never deleted at the end of the block.
// Special registers above the temporary range (LO, HI, FCR31, FPCOND, LLBIT) are touched
// implicitly by many ops and are not tracked. Writes made by ops with other side effects
// (conditional stores, linked loads) are never deleted. A dead write is overwritten in place
// with a Nop, so indices held by pending checks stay valid. Removing a write can make the write
// that fed it dead in turn, so the walk repeats until it finds nothing new; a final sweep then
// drops every Nop.

//! Dead-temporary purge.

use super::PassContext;
use crate::core::error::JitResult;
use crate::ir::regs::{is_temp, IrReg, TEMP_LR_SHIFT};
use crate::ir::{IrInst, IrProgram, Op};
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

#[derive(Debug, Clone, Copy)]
struct Check {
    /// Register written; 0 once the check is resolved.
    reg: IrReg,
    /// Index of the writing instruction.
    index: usize,
    /// Whether exits observe the register.
    read_by_exit: bool,
}

/// How `inst` reads `reg`: `Some(true)` through an operand or implicit read,
/// `Some(false)` only because it may observe all guest state, `None` not at all.
fn reads_for_purge(inst: &IrInst, reg: IrReg) -> Option<bool> {
    if inst.reads_gpr(reg) {
        Some(true)
    } else if inst.is_barrier() || (inst.is_exit() && !is_temp(reg)) {
        Some(false)
    } else {
        None
    }
}

fn has_side_effects(inst: &IrInst) -> bool {
    matches!(inst.op, Op::Store32Conditional | Op::Load32Linked)
        || !inst.meta().implicit_writes.is_empty()
}

/// One forward walk. Dead writes become `Nop`; returns whether any were found.
fn mark_dead(insts: &mut [IrInst], arena: &Bump) -> bool {
    let mut checks: BumpVec<'_, Check> = BumpVec::with_capacity_in(insts.len() / 2, arena);
    let mut first_check = 0;
    let mut found = false;

    for i in 0..insts.len() {
        let inst = insts[i];
        while first_check < checks.len() && checks[first_check].reg == 0 {
            first_check += 1;
        }

        for check in checks[first_check..].iter_mut() {
            if check.reg == 0 {
                continue;
            }

            if let Some(directly) = reads_for_purge(&inst, check.reg) {
                // An exit that only implicitly observes state keeps temporaries dead.
                if !inst.is_exit() || check.read_by_exit || directly {
                    check.reg = 0;
                }
            } else if check.read_by_exit && inst.is_exit() {
                check.reg = 0;
            } else if inst.dest_gpr() == Some(check.reg) {
                insts[check.index] = IrInst::new(Op::Nop, 0, 0, 0);
                found = true;
                check.reg = 0;
            }
        }

        let Some(dest) = inst.dest_gpr() else {
            continue;
        };
        if dest == 0 || has_side_effects(&inst) {
            continue;
        }
        if is_temp(dest) {
            if !inst.is_barrier() {
                checks.push(Check {
                    reg: dest,
                    index: i,
                    read_by_exit: false,
                });
            }
        } else if dest <= TEMP_LR_SHIFT {
            checks.push(Check {
                reg: dest,
                index: i,
                read_by_exit: true,
            });
        }
    }

    for check in checks.iter() {
        if check.reg != 0 && !check.read_by_exit {
            insts[check.index] = IrInst::new(Op::Nop, 0, 0, 0);
            found = true;
        }
    }
    found
}

/// Run the dead-temporary purge over `input`.
pub fn run(input: &IrProgram, cx: &PassContext<'_, '_>) -> JitResult<(IrProgram, bool)> {
    let arena = cx.session.arena();
    let mut insts: Vec<IrInst> = input.insts().to_vec();
    while mark_dead(&mut insts, arena) {}

    let mut out = IrProgram::with_capacity(insts.len());
    for inst in insts.into_iter().filter(|inst| inst.op != Op::Nop) {
        out.append_from(inst, input)?;
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

    fn purge(text: &str) -> IrProgram {
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let cx = PassContext::new(&session, PassOptions::default());
        run(&parse_program(text).unwrap(), &cx).unwrap().0
    }

    fn expect(text: &str, expected: &str) {
        let out = purge(text);
        assert_eq!(out, parse_program(expected).unwrap(), "got:\n{}", out);
    }

    #[test]
    fn test_overwritten_temp_removed() {
        expect(
            "SetConst temp0, 5\nAdd r1, r2, r3\nSetConst temp0, 6\nStore32 r1, temp0, 0\n",
            "Add r1, r2, r3\nSetConst temp0, 6\nStore32 r1, temp0, 0\n",
        );
    }

    #[test]
    fn test_unread_temp_removed_at_end() {
        expect(
            "AddConst temp1, r2, 4\nExitToConstIfEq 0x10, r2, r3\nExitToConst 0x100\n",
            "ExitToConstIfEq 0x10, r2, r3\nExitToConst 0x100\n",
        );
    }

    #[test]
    fn test_guest_register_survives_exit() {
        expect(
            "SetConst r1, 5\nExitToConstIfEq 0x10, r2, r3\nSetConst r1, 6\nExitToConst 0x20\n",
            "SetConst r1, 5\nExitToConstIfEq 0x10, r2, r3\nSetConst r1, 6\nExitToConst 0x20\n",
        );
        expect(
            "SetConst r1, 5\nSetConst r1, 6\nExitToConst 0x20\n",
            "SetConst r1, 6\nExitToConst 0x20\n",
        );
    }

    #[test]
    fn test_chains_removed_to_fixpoint() {
        expect(
            "SetConst temp0, 1\nAdd temp1, temp0, r2\nExitToConst 0x10\n",
            "ExitToConst 0x10\n",
        );
    }

    #[test]
    fn test_nops_swept() {
        expect(
            "Nop\nSetConst temp0, 1\nNop\nStore32 r1, temp0, 0\nNop\n",
            "SetConst temp0, 1\nStore32 r1, temp0, 0\n",
        );
        // The placeholder left by temp0 must not hide the read of temp1 behind it.
        expect(
            "AddConst temp1, r2, 4\nSetConst temp0, 1\nSetConst temp0, 2\nStore32 temp1, temp0, 0\n",
            "AddConst temp1, r2, 4\nSetConst temp0, 2\nStore32 temp1, temp0, 0\n",
        );
    }

    #[test]
    fn test_temp_read_by_exit_operand_kept() {
        expect(
            "AddConst temp0, r4, 8\nExitToReg temp0\n",
            "AddConst temp0, r4, 8\nExitToReg temp0\n",
        );
    }

    #[test]
    fn test_conditional_store_kept() {
        expect(
            "Store32Conditional temp2, r4, 0\nExitToConst 0x10\n",
            "Store32Conditional temp2, r4, 0\nExitToConst 0x10\n",
        );
    }

    #[test]
    fn test_idempotent() {
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let cx = PassContext::new(&session, PassOptions::default());
        let input = parse_program(
            "SetConst temp0, 1\nAdd temp1, temp0, r2\nMov r3, temp1\nSetConst temp1, 9\n\
             SetConst r5, 1\nSetConst r5, 2\nExitToConst 0x10\n",
        )
        .unwrap();
        let (once, changed) = run(&input, &cx).unwrap();
        assert!(changed);
        let (twice, changed_again) = run(&once, &cx).unwrap();
        assert_eq!(once, twice);
        assert!(!changed_again);
    }
}
