// This module groups the AArch64 backend: a hand-written instruction encoder with branch
// fixups, the register engine target that describes the host registers and emits moves
// between guest storage and host registers, and the block compiler that lowers IR on top of
// both.

//! AArch64 backend.

pub mod backend;
pub mod encoder;
pub mod regcache;

pub use backend::{compile_block, lowers_natively, Arm64Backend};
pub use encoder::{logical_imm, Arm64Encoder, FixupBranch, LogicalImm};
pub use regcache::Arm64Target;
