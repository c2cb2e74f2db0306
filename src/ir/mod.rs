// This module holds the intermediate representation every other part of irjit consumes: the
// opcode set with its static metadata table, the flat four-byte instruction record with its
// metadata-driven accessors, the register space layout, the de-duplicated constant pool and
// the program that owns both, and the line-oriented text form used by the CLI and the
// file-driven tests.

//! Block intermediate representation.

pub mod inst;
pub mod op;
pub mod regs;
pub mod text;

pub use inst::{ConstPool, IrInst, IrProgram, MAX_CONSTANTS};
pub use op::{metadata, Op, OpMeta, OperandKind};
pub use text::{format_inst, parse_module, parse_program, print_program};
