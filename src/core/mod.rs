// This module gathers the infrastructure shared by every backend: the compilation session
// (bumpalo arena plus statistics), the error type, configuration, the generic register
// allocation engine and its lookahead, the executable code buffer and the ELF exporter. The
// per-architecture pieces in arm64/ and x64/ plug into the register engine through the
// NativeTarget trait and never touch each other.

//! Core irjit infrastructure
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based scratch allocation using `bumpalo`
//! - Per-unit statistics: blocks, code size, pass changes, fallbacks, spills
//!
//! ## Register Allocation (`regcache`, `lookahead`)
//! - One generic engine over a per-architecture `NativeTarget`
//! - Spill choice guided by a bounded lookahead over the remaining IR
//!
//! ## Code Placement (`codebuf`, `objfile`)
//! - Dual-mapped executable memory with explicit write/execute views
//! - ELF export of compiled blocks for offline disassembly

pub mod codebuf;
pub mod config;
pub mod error;
pub mod lookahead;
pub mod objfile;
pub mod regcache;
pub mod session;

pub use codebuf::{CodeBuffer, CodeRange};
pub use config::{JitOptions, TargetArch};
pub use error::{JitError, JitResult};
pub use regcache::{MapMode, NativeReg, NativeTarget, RegBank, RegCache, RegCacheConfig};
pub use session::{JitSession, SessionStats};
