// This module holds the configuration knobs of the JIT. TargetArch names the native backend a
// block is compiled for. JitOptions gathers everything a caller can tune: the target, the
// ordered optimization pipeline, the per-pass constant pool growth cap, whether frequently
// used guest registers are statically bound to host registers, whether statically bound
// address registers keep the memory base folded into their upper bits (pointerify), the spill
// lookahead window and the size of the executable code buffer. Defaults follow the host, and
// the with_* builders let the CLI and tests override individual fields.

//! JIT configuration.

use crate::passes::Pipeline;

/// Native code target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArch {
    Arm64,
    X64,
}

impl TargetArch {
    /// Architecture of the machine running this process.
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            TargetArch::Arm64
        } else {
            TargetArch::X64
        }
    }

    /// Whether blocks compiled for this target can run in this process.
    pub fn is_host(self) -> bool {
        self == Self::host()
            && (cfg!(target_arch = "aarch64") || cfg!(target_arch = "x86_64"))
    }

    pub fn name(self) -> &'static str {
        match self {
            TargetArch::Arm64 => "arm64",
            TargetArch::X64 => "x64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "arm64" | "a64" | "aarch64" => Some(TargetArch::Arm64),
            "x64" | "x86_64" | "x86-64" => Some(TargetArch::X64),
            _ => None,
        }
    }
}

/// Default growth cap for constants added by a single pass.
pub const DEFAULT_CONSTANT_CAP: usize = 128;
/// Default number of instructions the spill heuristic looks ahead.
pub const DEFAULT_LOOKAHEAD: usize = 30;
/// Default executable buffer size.
pub const DEFAULT_CODE_SIZE: usize = 4 * 1024 * 1024;

/// Options controlling compilation.
#[derive(Debug, Clone)]
pub struct JitOptions {
    pub target: TargetArch,
    pub pipeline: Pipeline,
    pub constant_cap: usize,
    pub static_alloc: bool,
    pub pointerify: bool,
    pub lookahead_window: usize,
    pub code_size: usize,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self::for_target(TargetArch::host())
    }
}

impl JitOptions {
    pub fn for_target(target: TargetArch) -> Self {
        Self {
            target,
            pipeline: Pipeline::default_for(target),
            constant_cap: DEFAULT_CONSTANT_CAP,
            static_alloc: target == TargetArch::Arm64,
            pointerify: false,
            lookahead_window: DEFAULT_LOOKAHEAD,
            code_size: DEFAULT_CODE_SIZE,
        }
    }

    pub fn with_target(mut self, target: TargetArch) -> Self {
        self.target = target;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_constant_cap(mut self, cap: usize) -> Self {
        self.constant_cap = cap;
        self
    }

    pub fn with_static_alloc(mut self, enabled: bool) -> Self {
        self.static_alloc = enabled;
        self
    }

    pub fn with_pointerify(mut self, enabled: bool) -> Self {
        self.pointerify = enabled;
        self
    }

    pub fn with_lookahead(mut self, window: usize) -> Self {
        self.lookahead_window = window;
        self
    }

    pub fn with_code_size(mut self, size: usize) -> Self {
        self.code_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_names() {
        for target in [TargetArch::Arm64, TargetArch::X64] {
            assert_eq!(TargetArch::from_name(target.name()), Some(target));
        }
        assert_eq!(TargetArch::from_name("mips"), None);
    }

    #[test]
    fn test_defaults() {
        let opts = JitOptions::for_target(TargetArch::Arm64);
        assert!(opts.static_alloc);
        assert_eq!(opts.constant_cap, DEFAULT_CONSTANT_CAP);
        let opts = opts.with_target(TargetArch::X64).with_lookahead(10);
        assert_eq!(opts.target, TargetArch::X64);
        assert_eq!(opts.lookahead_window, 10);
    }
}
