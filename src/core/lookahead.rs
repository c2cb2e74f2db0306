// This module answers the one question the register engine asks when it has to evict
// something: what happens next to this register slot? next_usage scans a bounded window of
// the instructions that follow the current one and reports whether the slot is read first,
// fully overwritten first, provably dead (a temporary reaching an exit or the end of the
// block) or undetermined because the window ran out. It is a pure function of the
// instruction slice so it can be tested without any engine state.

//! Bounded lookahead for spill decisions.

use crate::ir::regs::{is_temp, IrReg, TOTAL_IR_REGS};
use crate::ir::IrInst;

/// Next use of a register slot after the current instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    /// Read before being written.
    Read,
    /// Overwritten before being read; the current value is dead.
    Clobbered,
    /// Never read again.
    Unused,
    /// Not decided within the window.
    Unknown,
}

fn is_temp_slot(slot: usize) -> bool {
    slot < TOTAL_IR_REGS && is_temp(slot as IrReg)
}

/// Classify the next use of `slot` in `insts[start..]`, looking at most `window`
/// instructions ahead.
pub fn next_usage(insts: &[IrInst], start: usize, slot: usize, window: usize) -> Usage {
    let remaining = insts.get(start..).unwrap_or(&[]);

    for inst in remaining.iter().take(window) {
        if inst.reads_slot(slot) || inst.is_barrier() {
            return Usage::Read;
        }
        if inst.writes_slot(slot) {
            return Usage::Clobbered;
        }
        if inst.is_exit() {
            // Exits publish guest state; temporaries die with the block.
            return if is_temp_slot(slot) {
                Usage::Unused
            } else {
                Usage::Read
            };
        }
    }

    if remaining.len() <= window {
        // Fell off the end of the block.
        if is_temp_slot(slot) {
            Usage::Unused
        } else {
            Usage::Read
        }
    } else {
        Usage::Unknown
    }
}

/// Whether every slot in `slots` is overwritten before being read.
pub fn all_clobbered(insts: &[IrInst], start: usize, slots: &[usize], window: usize) -> bool {
    !slots.is_empty()
        && slots
            .iter()
            .all(|slot| next_usage(insts, start, *slot, window) == Usage::Clobbered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::regs::{fpr_slot, TEMP0};
    use crate::ir::text::parse_program;

    fn insts(text: &str) -> Vec<IrInst> {
        parse_program(text).unwrap().insts().to_vec()
    }

    #[test]
    fn test_read_before_write() {
        let code = insts("Add r1, r2, r3\nMov r2, r4\nExitToConst 0x10\n");
        assert_eq!(next_usage(&code, 0, 2, 30), Usage::Read);
        assert_eq!(next_usage(&code, 1, 4, 30), Usage::Read);
    }

    #[test]
    fn test_clobbered() {
        let code = insts("Add r1, r2, r3\nSetConst r2, 5\nExitToConst 0x10\n");
        assert_eq!(next_usage(&code, 1, 2, 30), Usage::Clobbered);
        // Reading and writing in one instruction counts as a read.
        let code = insts("AddConst r2, r2, 1\n");
        assert_eq!(next_usage(&code, 0, 2, 30), Usage::Read);
    }

    #[test]
    fn test_exit_and_end_of_block() {
        let code = insts("Add r1, r2, r3\nExitToConst 0x10\n");
        assert_eq!(next_usage(&code, 0, TEMP0 as usize, 30), Usage::Unused);
        assert_eq!(next_usage(&code, 0, 7, 30), Usage::Read);

        let code = insts("Add r1, r2, r3\n");
        assert_eq!(next_usage(&code, 1, TEMP0 as usize, 30), Usage::Unused);
        assert_eq!(next_usage(&code, 1, 7, 30), Usage::Read);
    }

    #[test]
    fn test_window_runs_out() {
        let code = insts("Add r1, r2, r3\nAdd r1, r2, r3\nAdd r1, r2, r3\nMov r9, r8\n");
        assert_eq!(next_usage(&code, 0, 8, 2), Usage::Unknown);
        assert_eq!(next_usage(&code, 0, 8, 4), Usage::Read);
    }

    #[test]
    fn test_vector_lanes_and_barriers() {
        let code = insts("Vec4Add f8, f12, f16\nSyscall 0x20\n");
        assert_eq!(next_usage(&code, 0, fpr_slot(14), 30), Usage::Read);
        assert_eq!(next_usage(&code, 0, fpr_slot(10), 30), Usage::Clobbered);
        assert_eq!(next_usage(&code, 1, TEMP0 as usize, 30), Usage::Read);
        assert!(all_clobbered(&code, 0, &[fpr_slot(8), fpr_slot(11)], 30));
        assert!(!all_clobbered(&code, 0, &[fpr_slot(8), fpr_slot(12)], 30));
    }
}
