//! irjit - IR optimization, interpretation and native compilation for emulated guest code.
//!
//! Guest blocks arrive as a flat list of fixed-size IR instructions plus a de-duplicated
//! constant pool. They run through a pipeline of list-to-list optimization passes and are
//! then either executed by the reference interpreter or lowered to AArch64 or x86-64 machine
//! code through one shared register allocation engine.
//!
//! # Primary Usage
//!
//! ```ignore
//! use irjit::core::JitOptions;
//! use irjit::interp::{GuestMemory, GuestState};
//! use irjit::jit::{Jit, MapFrontend};
//!
//! let frontend = MapFrontend::from_text(source)?;
//! let mut jit = Jit::new(frontend, JitOptions::default())?;
//! let block = jit.compile(0x0880_4000)?;
//! let exit = jit.execute(&block, &mut state, &mut memory)?;
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Instructions, opcode metadata, constant pool, text form
//! - [`passes`] - Optimization passes and the pipeline
//! - [`interp`] - Reference interpreter, guest state, fallback thunk
//! - [`core`] - Session, errors, configuration, register engine, code buffer, ELF export
//! - [`arm64`] - AArch64 encoder and backend
//! - [`x64`] - x86-64 encoder (iced-x86) and backend
//! - [`jit`] - Block cache and the compile/execute facade
//! - [`driver`], [`filecheck`] - Text driver shared by the CLI and file tests

pub mod arm64;
pub mod core;
pub mod driver;
pub mod filecheck;
pub mod interp;
pub mod ir;
pub mod jit;
pub mod passes;
pub mod x64;

pub use crate::core::{JitError, JitOptions, JitResult, JitSession, SessionStats, TargetArch};
pub use crate::interp::{GuestMemory, GuestState};
pub use crate::ir::{IrInst, IrProgram, Op};
pub use crate::jit::{BlockEntry, CompiledBlock, Frontend, Jit, MapFrontend};
