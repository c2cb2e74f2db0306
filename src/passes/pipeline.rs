// This module strings the optimization passes together. PassKind names each pass once, with
// the short name the CLI accepts and the function that runs it. A Pipeline is an ordered list
// of passes; the default order depends on the target, since only the x86-64 backend wants
// three-operand arithmetic split into destructive two-operand form. Running a pipeline feeds
// each pass the previous pass's output, logs every pass that changed something and records
// the change and the before/after sizes in the session statistics.

//! Ordered pass pipelines.

use super::{const_prop, purge_temps, reduce_loads, simplify, PassContext, PassFn, PassOptions};
use crate::core::config::TargetArch;
use crate::core::error::{JitError, JitResult};
use crate::core::session::JitSession;
use crate::ir::IrProgram;
use log::{debug, trace};

/// One optimization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    FpMoves,
    ConstProp,
    PurgeTemps,
    ReduceLoads,
    ThreeOpToTwoOp,
    LoadsAfterStores,
}

impl PassKind {
    pub const ALL: [PassKind; 6] = [
        PassKind::FpMoves,
        PassKind::ConstProp,
        PassKind::PurgeTemps,
        PassKind::ReduceLoads,
        PassKind::ThreeOpToTwoOp,
        PassKind::LoadsAfterStores,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PassKind::FpMoves => "fp-moves",
            PassKind::ConstProp => "const-prop",
            PassKind::PurgeTemps => "purge-temps",
            PassKind::ReduceLoads => "reduce-loads",
            PassKind::ThreeOpToTwoOp => "three-op",
            PassKind::LoadsAfterStores => "loads-after-stores",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Function implementing this pass.
    pub fn function(self) -> PassFn {
        match self {
            PassKind::FpMoves => simplify::fp_moves,
            PassKind::ConstProp => const_prop::run,
            PassKind::PurgeTemps => purge_temps::run,
            PassKind::ReduceLoads => reduce_loads::run,
            PassKind::ThreeOpToTwoOp => simplify::three_op_to_two_op,
            PassKind::LoadsAfterStores => simplify::loads_after_stores,
        }
    }
}

/// Ordered list of passes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pipeline {
    passes: Vec<PassKind>,
}

impl Pipeline {
    pub fn new(passes: Vec<PassKind>) -> Self {
        Self { passes }
    }

    /// Pipeline that leaves programs untouched.
    pub fn none() -> Self {
        Self::default()
    }

    /// Standard pass order for `target`.
    pub fn default_for(target: TargetArch) -> Self {
        let mut passes = vec![
            PassKind::FpMoves,
            PassKind::ConstProp,
            PassKind::PurgeTemps,
            PassKind::ReduceLoads,
            PassKind::LoadsAfterStores,
        ];
        if target == TargetArch::X64 {
            passes.push(PassKind::ThreeOpToTwoOp);
        }
        Self { passes }
    }

    /// Parse a comma separated list of pass names.
    pub fn from_names(list: &str) -> JitResult<Self> {
        let mut passes = Vec::new();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let kind = PassKind::from_name(name).ok_or_else(|| JitError::Unsupported {
                reason: format!("unknown pass '{}'", name),
            })?;
            passes.push(kind);
        }
        Ok(Self { passes })
    }

    pub fn passes(&self) -> &[PassKind] {
        &self.passes
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Run every pass in order, returning the final program.
    pub fn run(
        &self,
        program: &IrProgram,
        session: &JitSession<'_>,
        options: PassOptions,
    ) -> JitResult<IrProgram> {
        let cx = PassContext::new(session, options);
        let mut current = super::copy_program(program)?;

        for kind in &self.passes {
            let (next, changed) = (kind.function())(&current, &cx)?;
            if changed {
                debug!(
                    "{}: {} -> {} instructions",
                    kind.name(),
                    current.len(),
                    next.len()
                );
                session.record_pass_changed(kind.name());
            } else {
                trace!("{}: no change", kind.name());
            }
            current = next;
        }

        session.record_optimized(program.len(), current.len());
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text::parse_program;
    use bumpalo::Bump;

    #[test]
    fn test_names() {
        for kind in PassKind::ALL {
            assert_eq!(PassKind::from_name(kind.name()), Some(kind));
        }
        let pipeline = Pipeline::from_names("const-prop, purge-temps").unwrap();
        assert_eq!(
            pipeline.passes(),
            &[PassKind::ConstProp, PassKind::PurgeTemps]
        );
        assert!(Pipeline::from_names("inline").is_err());
        assert!(Pipeline::from_names("").unwrap().is_empty());
    }

    #[test]
    fn test_target_defaults() {
        let arm = Pipeline::default_for(TargetArch::Arm64);
        let x64 = Pipeline::default_for(TargetArch::X64);
        assert!(!arm.passes().contains(&PassKind::ThreeOpToTwoOp));
        assert_eq!(x64.passes().last(), Some(&PassKind::ThreeOpToTwoOp));
    }

    #[test]
    fn test_run_records_statistics() {
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let program = parse_program(
            "SetConst temp0, 100\nAddConst temp0, temp0, 5\nSetConst r2, 0x40\n\
             Store32 temp0, r2, 0\nExitToConst 0x200\n",
        )
        .unwrap();
        let out = Pipeline::default_for(TargetArch::Arm64)
            .run(&program, &session, PassOptions::default())
            .unwrap();
        assert!(out.len() < program.len());

        let stats = session.stats();
        assert_eq!(stats.ir_insts_in, 5);
        assert_eq!(stats.ir_insts_out, out.len());
        assert!(stats.pass_changes.contains_key("const-prop"));
    }
}
