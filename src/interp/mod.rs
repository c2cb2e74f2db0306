// This module groups the reference execution engine. state.rs defines the guest register file
// and memory shared with compiled code; interpreter.rs executes IR instruction lists directly
// and defines the bit-exact semantics every native lowering must reproduce; fallback.rs is the
// C-ABI entry point compiled code calls for opcodes a backend does not lower natively.

//! IR interpreter and guest state.

pub mod fallback;
pub mod interpreter;
pub mod state;

pub use fallback::{
    interpret_one, pack_inst, take_fallback_fault, with_fallback_memory, FALLBACK_CONTINUE,
    FALLBACK_EXIT, FALLBACK_FAULT,
};
pub use interpreter::{interpret, interpret_program, interpret_single};
pub use state::{GuestMemory, GuestState, DOWNCOUNT_OFFSET, PC_OFFSET, SYSCALL_OFFSET};
