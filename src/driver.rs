// This module is the text-in, text-out front of irjit that the command line tool and the
// file-driven tests share. A module of IR text is parsed into blocks; each block is optimized
// with the selected pipeline and then, depending on the options, printed, compiled (with a
// summary and optional hex dump of the machine code), interpreted, or compiled and executed
// natively on a fresh guest state. Both execution modes report in the same format so a test
// can check the interpreter and the native code against one set of expectations. Compiled
// blocks can additionally be collected into an ELF object file.

//! Shared driver for the CLI and the file tests.

use crate::core::config::{JitOptions, TargetArch};
use crate::core::error::{JitError, JitResult};
use crate::core::objfile::ObjectWriter;
use crate::core::session::JitSession;
use crate::interp::interpreter::interpret_program;
use crate::interp::state::{GuestMemory, GuestState};
use crate::ir::regs::{gpr_name, FPR_BASE, FPR_COUNT, GPR_COUNT, REG_HI, REG_LO};
use crate::ir::text::{parse_module, print_program};
use crate::ir::IrProgram;
use crate::jit::{compile_program, optimize, CompiledBlock, Jit, MapFrontend};
use crate::passes::Pipeline;
use bumpalo::Bump;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Guest memory given to each executed block.
pub const DEFAULT_MEMORY_SIZE: usize = 0x10000;

/// What to do with each block of a module.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub target: TargetArch,
    /// Comma separated pass list replacing the default pipeline.
    pub passes: Option<String>,
    pub no_opt: bool,
    pub print_ir: bool,
    pub compile: bool,
    pub hex: bool,
    pub interpret: bool,
    pub run: bool,
    pub stats: bool,
    pub emit_obj: Option<PathBuf>,
    pub memory_size: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            target: TargetArch::host(),
            passes: None,
            no_opt: false,
            print_ir: false,
            compile: false,
            hex: false,
            interpret: false,
            run: false,
            stats: false,
            emit_obj: None,
            memory_size: DEFAULT_MEMORY_SIZE,
        }
    }
}

impl DriverOptions {
    /// Parse command line style flags, as used by `RUN:` lines.
    pub fn from_args<'a>(args: impl IntoIterator<Item = &'a str>) -> JitResult<Self> {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (arg, None),
            };
            let mut value = |name: &str| -> JitResult<String> {
                inline
                    .map(str::to_string)
                    .or_else(|| args.next().map(str::to_string))
                    .ok_or_else(|| JitError::Unsupported {
                        reason: format!("{} needs a value", name),
                    })
            };
            match flag {
                "--target" => {
                    let name = value("--target")?;
                    options.target =
                        TargetArch::from_name(&name).ok_or_else(|| JitError::Unsupported {
                            reason: format!("unknown target '{}'", name),
                        })?;
                }
                "--passes" => options.passes = Some(value("--passes")?),
                "--no-opt" => options.no_opt = true,
                "--print-ir" => options.print_ir = true,
                "--compile" => options.compile = true,
                "--hex" => options.hex = true,
                "--interpret" => options.interpret = true,
                "--run" => options.run = true,
                "--stats" => options.stats = true,
                "--emit-obj" => options.emit_obj = Some(PathBuf::from(value("--emit-obj")?)),
                _ => {}
            }
        }
        Ok(options)
    }

    /// JIT configuration these options select.
    pub fn jit_options(&self) -> JitResult<JitOptions> {
        let pipeline = if self.no_opt {
            Pipeline::none()
        } else if let Some(list) = &self.passes {
            Pipeline::from_names(list)?
        } else {
            Pipeline::default_for(self.target)
        };
        Ok(JitOptions::for_target(self.target).with_pipeline(pipeline))
    }

    fn wants_code(&self) -> bool {
        self.compile || self.hex || self.emit_obj.is_some()
    }
}

/// Process every block of `text` and return the report.
pub fn run_module(text: &str, options: &DriverOptions) -> JitResult<String> {
    let jit_options = options.jit_options()?;
    let blocks = parse_module(text)?;
    let mut out = String::new();
    let mut object = ObjectWriter::new(options.target);
    let mut totals = crate::core::session::SessionStats::default();

    for (addr, program) in &blocks {
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let optimized = optimize(program, &jit_options, &session)?;

        if options.print_ir {
            let _ = writeln!(
                out,
                "block {:#010x}: {} -> {} instructions",
                addr,
                program.len(),
                optimized.len()
            );
            for line in print_program(&optimized).lines() {
                let _ = writeln!(out, "  {}", line);
            }
        }

        if options.wants_code() {
            let block = compile_program(&optimized, &jit_options, &session)?;
            session.record_block_compiled(*addr, optimized.len(), block.code.len());
            if options.compile || options.hex {
                write_code(&mut out, *addr, &block, options.target, options.hex);
            }
            object.add_block(*addr, &block.code);
        }
        totals.merge(&session.stats());

        if options.interpret {
            let (mut state, mut memory) = fresh_state(*addr, options.memory_size);
            let exit = interpret_program(&optimized, &mut state, &mut memory)?;
            write_outcome(&mut out, *addr, exit, &state, &memory);
        }
        if options.run {
            let (exit, state, memory) = run_native(*addr, program, &jit_options, options)?;
            write_outcome(&mut out, *addr, exit, &state, &memory);
        }
    }

    if let Some(path) = &options.emit_obj {
        let bytes = object.write()?;
        std::fs::write(path, &bytes).map_err(|err| JitError::Object {
            reason: format!("{}: {}", path.display(), err),
        })?;
        let _ = writeln!(out, "wrote {} blocks to {}", object.len(), path.display());
    }
    if options.stats {
        let _ = write!(out, "{}", totals);
    }
    Ok(out)
}

fn fresh_state(addr: u32, memory_size: usize) -> (GuestState, GuestMemory) {
    let mut state = GuestState::new();
    state.pc = addr;
    (state, GuestMemory::new(memory_size))
}

fn run_native(
    addr: u32,
    program: &IrProgram,
    jit_options: &JitOptions,
    options: &DriverOptions,
) -> JitResult<(Option<u32>, GuestState, GuestMemory)> {
    let mut frontend = MapFrontend::new();
    frontend.insert(addr, crate::passes::copy_program(program)?);
    let mut jit = Jit::new(frontend, jit_options.clone().with_code_size(256 * 1024))?;
    let entry = jit.compile(addr)?;
    let (mut state, mut memory) = fresh_state(addr, options.memory_size);
    let exit = jit.execute(&entry, &mut state, &mut memory)?;
    Ok((exit, state, memory))
}

fn write_code(out: &mut String, addr: u32, block: &CompiledBlock, target: TargetArch, hex: bool) {
    let _ = writeln!(
        out,
        "code {:#010x}: {} bytes, {} native, {} fallback, {} spills",
        addr,
        block.code.len(),
        block.native_ops,
        block.fallback_ops,
        block.spills
    );
    if !hex {
        return;
    }
    match target {
        TargetArch::Arm64 => {
            for line in block.code.chunks(16) {
                let words: Vec<String> = line
                    .chunks_exact(4)
                    .map(|w| format!("{:08x}", u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
                    .collect();
                let _ = writeln!(out, "  {}", words.join(" "));
            }
        }
        TargetArch::X64 => {
            for line in block.code.chunks(16) {
                let bytes: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
                let _ = writeln!(out, "  {}", bytes.join(" "));
            }
        }
    }
}

/// Exit, then every nonzero register and memory word.
fn write_outcome(
    out: &mut String,
    addr: u32,
    exit: Option<u32>,
    state: &GuestState,
    memory: &GuestMemory,
) {
    match exit {
        Some(target) => {
            let _ = writeln!(out, "exit {:#010x} -> {:#010x}", addr, target);
        }
        None => {
            let _ = writeln!(out, "fallthrough {:#010x}", addr);
        }
    }
    let gprs = (0..GPR_COUNT).chain([REG_LO as usize, REG_HI as usize]);
    for slot in gprs {
        let value = state.regs[slot];
        if value != 0 {
            let _ = writeln!(out, "  {} = {:#010x}", gpr_name(slot as u8), value);
        }
    }
    for f in 0..FPR_COUNT {
        let value = state.regs[FPR_BASE + f];
        if value != 0 {
            let _ = writeln!(out, "  f{} = {:#010x}", f, value);
        }
    }
    if state.syscall != 0 {
        let _ = writeln!(out, "  syscall = {:#x}", state.syscall);
    }
    for (index, word) in memory.as_slice().chunks_exact(4).enumerate() {
        let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        if value != 0 {
            let _ = writeln!(out, "  [{:#010x}] = {:#010x}", index * 4, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: &str = "\
block 0x100:
  SetConst r2, 0x10
  AddConst r1, r2, 0x20
  Store32 r1, r2, 0x4
  ExitToConst 0x200
";

    #[test]
    fn test_from_args() {
        let options =
            DriverOptions::from_args(["--target", "arm64", "--passes=const-prop", "--hex"])
                .unwrap();
        assert_eq!(options.target, TargetArch::Arm64);
        assert_eq!(options.passes.as_deref(), Some("const-prop"));
        assert!(options.hex);
        assert!(DriverOptions::from_args(["--target", "mips"]).is_err());
        assert!(DriverOptions::from_args(["--passes"]).is_err());
    }

    #[test]
    fn test_interpret_report() {
        let options = DriverOptions {
            interpret: true,
            ..DriverOptions::default()
        };
        let out = run_module(MODULE, &options).unwrap();
        assert!(out.contains("exit 0x00000100 -> 0x00000200"));
        assert!(out.contains("r1 = 0x00000030"));
        assert!(out.contains("[0x00000014] = 0x00000030"));
    }

    #[test]
    fn test_print_and_compile_report() {
        let options = DriverOptions {
            target: TargetArch::Arm64,
            print_ir: true,
            hex: true,
            ..DriverOptions::default()
        };
        let out = run_module(MODULE, &options).unwrap();
        assert!(out.contains("block 0x00000100: 4 -> "));
        assert!(out.contains("code 0x00000100: "));
        assert!(out.contains("a9b67bfd"));
    }
}
