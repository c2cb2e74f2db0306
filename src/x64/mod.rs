// This module groups the x86-64 backend: the iced-x86 encoder wrapper, the register engine
// target for System V hosts, and the block compiler that lowers IR on top of both.

//! x86-64 backend.

pub mod backend;
pub mod encoder;
pub mod regcache;

pub use backend::{compile_block, lowers_natively, X64Backend};
pub use encoder::{EncodingError, X64Encoder};
pub use regcache::X64Target;
