// This module is the bridge compiled code uses for opcodes its backend does not lower
// natively. The backend writes the register engine back to guest storage, then calls
// interpret_one with the guest state pointer, the memory base and the instruction packed into
// one 64-bit argument (opcode and the three fields in the low four bytes, the resolved
// constant in the high four). The thunk decodes the record and runs it through
// interpret_single against the same GuestState the compiled block is using. The engine drops
// or reloads whatever the instruction wrote, so the code that follows sees its effects.
//
// The interpreter needs a bounds-checked GuestMemory, which a raw base pointer cannot provide.
// Callers that execute compiled code install the memory for the current thread with
// with_fallback_memory; the thunk looks it up there. A fault is recorded in a thread-local slot
// and reported to compiled code with FALLBACK_FAULT, which ends the block; the caller then
// collects it with take_fallback_fault.

//! Interpreter fallback for compiled code.

use super::interpreter::interpret_single;
use super::state::{GuestMemory, GuestState};
use crate::core::error::JitError;
use crate::ir::{IrInst, Op};
use log::error;
use std::cell::{Cell, RefCell};
use std::ptr;

/// Instruction finished; continue with the block.
pub const FALLBACK_CONTINUE: u32 = 0;
/// Instruction exited the block; `pc` holds the target.
pub const FALLBACK_EXIT: u32 = 1;
/// Instruction faulted; the fault is waiting in `take_fallback_fault`.
pub const FALLBACK_FAULT: u32 = 2;

thread_local! {
    static ACTIVE_MEMORY: Cell<*mut GuestMemory> = const { Cell::new(ptr::null_mut()) };
    static LAST_FAULT: RefCell<Option<JitError>> = const { RefCell::new(None) };
}

/// Pack an instruction and its resolved constant for `interpret_one`.
pub fn pack_inst(inst: &IrInst, constant: u32) -> u64 {
    (inst.op as u64)
        | (inst.dest as u64) << 8
        | (inst.src1 as u64) << 16
        | (inst.src2 as u64) << 24
        | (constant as u64) << 32
}

/// Inverse of [`pack_inst`].
pub fn unpack_inst(packed: u64) -> Option<(IrInst, u32)> {
    let op = Op::from_u8(packed as u8)?;
    let inst = IrInst::new(op, (packed >> 8) as u8, (packed >> 16) as u8, (packed >> 24) as u8);
    Some((inst, (packed >> 32) as u32))
}

struct MemoryGuard {
    previous: *mut GuestMemory,
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        ACTIVE_MEMORY.with(|cell| cell.set(self.previous));
    }
}

/// Run `f` with `memory` installed as this thread's fallback memory. `f` receives the
/// memory base pointer to hand to compiled code.
pub fn with_fallback_memory<R>(memory: &mut GuestMemory, f: impl FnOnce(*mut u8) -> R) -> R {
    let base = memory.base_ptr();
    let raw: *mut GuestMemory = memory;
    let previous = ACTIVE_MEMORY.with(|cell| cell.replace(raw));
    let _guard = MemoryGuard { previous };
    f(base)
}

/// Fault recorded by the last fallback call that returned `FALLBACK_FAULT`.
pub fn take_fallback_fault() -> Option<JitError> {
    LAST_FAULT.with(|slot| slot.borrow_mut().take())
}

fn record_fault(err: JitError) -> u32 {
    error!("fallback: {}", err);
    LAST_FAULT.with(|slot| *slot.borrow_mut() = Some(err));
    FALLBACK_FAULT
}

/// Execute one packed instruction against `state`. Called from compiled code.
///
/// # Safety contract
/// `state` must point at the live `GuestState` of the running block, and the caller must be
/// inside `with_fallback_memory` for the memory the block was given.
pub extern "C" fn interpret_one(state: *mut GuestState, _membase: *mut u8, packed: u64) -> u32 {
    let Some((inst, constant)) = unpack_inst(packed) else {
        return record_fault(JitError::Unsupported {
            reason: format!("fallback call with bad opcode byte {:#x}", packed as u8),
        });
    };
    let memory = ACTIVE_MEMORY.with(Cell::get);
    if memory.is_null() || state.is_null() {
        return record_fault(JitError::Unsupported {
            reason: format!("fallback for {} outside with_fallback_memory", inst.op),
        });
    }

    // SAFETY: both pointers were installed by the caller of the running block and stay
    // valid for its duration; compiled code does not touch them during this call.
    let (state, memory) = unsafe { (&mut *state, &mut *memory) };
    match interpret_single(&inst, constant, state, memory) {
        Ok(None) => FALLBACK_CONTINUE,
        Ok(Some(target)) => {
            state.pc = target;
            FALLBACK_EXIT
        }
        Err(err) => record_fault(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::regs::{REG_HI, REG_LO};

    #[test]
    fn test_pack_round_trip() {
        let inst = IrInst::new(Op::Load32, 3, 4, 7);
        let packed = pack_inst(&inst, 0xdead_beef);
        assert_eq!(unpack_inst(packed), Some((inst, 0xdead_beef)));
        assert_eq!(unpack_inst(0xff), None);
    }

    #[test]
    fn test_fallback_executes_against_state() {
        let mut state = GuestState::new();
        let mut memory = GuestMemory::new(0x100);
        state.regs[1] = 7;
        state.regs[2] = 0;
        let div = IrInst::new(Op::DivU, 0, 1, 2);
        let result = with_fallback_memory(&mut memory, |base| {
            interpret_one(&mut state, base, pack_inst(&div, 0))
        });
        assert_eq!(result, FALLBACK_CONTINUE);
        assert_eq!(state.regs[REG_LO as usize], 0xffff);
        assert_eq!(state.regs[REG_HI as usize], 7);
    }

    #[test]
    fn test_fallback_reports_faults() {
        let mut state = GuestState::new();
        let mut memory = GuestMemory::new(0x10);
        let load = IrInst::new(Op::Load32, 1, 0, 0);
        let result = with_fallback_memory(&mut memory, |base| {
            interpret_one(&mut state, base, pack_inst(&load, 0x100))
        });
        assert_eq!(result, FALLBACK_FAULT);
        assert!(matches!(
            take_fallback_fault(),
            Some(JitError::MemoryFault { addr: 0x100, size: 4 })
        ));
        assert!(take_fallback_fault().is_none());
    }

    #[test]
    fn test_fallback_without_memory_faults() {
        let mut state = GuestState::new();
        let nop_add = IrInst::new(Op::Add, 1, 2, 3);
        assert_eq!(
            interpret_one(&mut state, ptr::null_mut(), pack_inst(&nop_add, 0)),
            FALLBACK_FAULT
        );
        assert!(take_fallback_fault().is_some());
    }
}
