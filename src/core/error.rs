// This module defines the caller-visible error type for irjit using the thiserror crate.
// JitError covers the recoverable failures that propagate out of the library: guest memory
// faults raised by the interpreter, text IR parse errors, unknown block addresses, code
// buffer mapping failures, encoder errors from the x86-64 assembler, constant pool
// exhaustion, object file export failures and requests the configured target cannot serve.
// Backend bugs such as an unmapped opcode or an out-of-range branch are assertions and never
// show up here. JitResult<T> is the convenience alias used across the crate.

//! Error types for irjit.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Main error type for compilation and execution.
#[derive(Error, Debug)]
pub enum JitError {
    #[error("Guest memory fault: {size}-byte access at {addr:#010x}")]
    MemoryFault { addr: u32, size: u32 },

    #[error("IR parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("No IR available for guest address {addr:#010x}")]
    UnknownBlock { addr: u32 },

    #[error("Code buffer failure: {reason}")]
    CodeBuffer { reason: String },

    #[error("Encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("Constant pool full while adding {value:#x}")]
    ConstantPoolFull { value: u32 },

    #[error("Object file export failed: {reason}")]
    Object { reason: String },

    #[error("Unsupported: {reason}")]
    Unsupported { reason: String },
}

/// Result type alias for irjit operations.
pub type JitResult<T> = Result<T, JitError>;
