// This module groups the IR-to-IR optimization passes. Every pass is a pure function from an
// input program to a fresh output program plus a flag saying whether anything changed; passes
// never mutate their input, and each re-interns every constant it emits into the output
// pool, so constant indices from the input are never carried over blindly. PassContext hands
// a pass its session (the scratch arena and statistics) and the tunable PassOptions. The
// Pipeline type in pipeline.rs strings passes together in a configured order.

//! IR optimization passes.
//!
//! - `const_prop`: constant propagation and folding
//! - `purge_temps`: dead write removal for block-scoped temporaries
//! - `reduce_loads`: narrowing of loads followed by a mask
//! - `simplify`: FP move forwarding, three-op splitting, redundant reload removal
//! - `pipeline`: ordered pass lists

pub mod const_prop;
pub mod pipeline;
pub mod purge_temps;
pub mod reduce_loads;
pub mod simplify;

pub use pipeline::{PassKind, Pipeline};

use crate::core::config::DEFAULT_CONSTANT_CAP;
use crate::core::error::JitResult;
use crate::core::session::JitSession;
use crate::ir::IrProgram;

/// Options shared by all passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOptions {
    /// How many constants a single pass may add to the pool.
    pub constant_cap: usize,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            constant_cap: DEFAULT_CONSTANT_CAP,
        }
    }
}

/// Everything a pass may use besides its input.
pub struct PassContext<'s, 'arena> {
    pub session: &'s JitSession<'arena>,
    pub options: PassOptions,
}

impl<'s, 'arena> PassContext<'s, 'arena> {
    pub fn new(session: &'s JitSession<'arena>, options: PassOptions) -> Self {
        Self { session, options }
    }
}

/// Signature shared by every pass.
pub type PassFn = fn(&IrProgram, &PassContext<'_, '_>) -> JitResult<(IrProgram, bool)>;

/// Copy `input` unchanged, re-interning constants.
pub(crate) fn copy_program(input: &IrProgram) -> JitResult<IrProgram> {
    let mut out = IrProgram::with_capacity(input.len());
    for inst in input.insts() {
        out.append_from(*inst, input)?;
    }
    Ok(out)
}
