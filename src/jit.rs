// This module is the caller-facing side of irjit. A Frontend produces the IR for a guest
// address; Jit optimizes it with the configured pipeline, hands it to the backend for the
// configured target, copies the machine code into its CodeBuffer and remembers the result
// in a block cache keyed by guest address. Cached blocks are executed through the native
// block ABI with the guest memory installed for interpreter fallback calls, and the
// interpreter itself is available as a drop-in substitute for any program.
//
// Compilation for a target other than the host is allowed: the code is produced, cached and
// can be exported, only execute() refuses to jump into it. Every compile runs in its own
// JitSession whose arena is dropped afterwards; its statistics are folded into the totals
// the Jit keeps.

//! JIT facade: block cache, compilation and execution.

use crate::core::codebuf::{CodeBuffer, CodeRange};
use crate::core::config::{JitOptions, TargetArch};
use crate::core::error::{JitError, JitResult};
use crate::core::session::{JitSession, SessionStats};
use crate::interp::fallback::{take_fallback_fault, with_fallback_memory, FALLBACK_EXIT};
use crate::interp::interpreter::interpret_program;
use crate::interp::state::{GuestMemory, GuestState};
use crate::ir::text::parse_module;
use crate::ir::IrProgram;
use crate::passes::PassOptions;
use bumpalo::Bump;
use hashbrown::HashMap;
use log::{debug, info};

/// Machine code for one block plus what the backend did with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledBlock {
    pub code: Vec<u8>,
    pub native_ops: usize,
    pub fallback_ops: usize,
    pub spills: usize,
}

/// Signature of a compiled block.
pub type BlockFn = unsafe extern "C" fn(*mut GuestState, *mut u8) -> u32;

/// Producer of IR for guest addresses.
pub trait Frontend {
    fn translate(&mut self, guest_addr: u32) -> JitResult<IrProgram>;
}

/// Frontend serving programs from a map.
#[derive(Default)]
pub struct MapFrontend {
    blocks: HashMap<u32, IrProgram>,
}

impl MapFrontend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frontend over every block of a text module.
    pub fn from_text(text: &str) -> JitResult<Self> {
        let mut frontend = Self::new();
        for (addr, program) in parse_module(text)? {
            frontend.insert(addr, program);
        }
        Ok(frontend)
    }

    pub fn insert(&mut self, guest_addr: u32, program: IrProgram) {
        self.blocks.insert(guest_addr, program);
    }

    pub fn get(&self, guest_addr: u32) -> Option<&IrProgram> {
        self.blocks.get(&guest_addr)
    }

    /// Known addresses in ascending order.
    pub fn addresses(&self) -> Vec<u32> {
        let mut addrs: Vec<u32> = self.blocks.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Frontend for MapFrontend {
    fn translate(&mut self, guest_addr: u32) -> JitResult<IrProgram> {
        let program = self
            .blocks
            .get(&guest_addr)
            .ok_or(JitError::UnknownBlock { addr: guest_addr })?;
        crate::passes::copy_program(program)
    }
}

/// A cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub guest_addr: u32,
    pub range: CodeRange,
    /// Instructions after optimization.
    pub ir_len: usize,
    pub native_ops: usize,
    pub fallback_ops: usize,
}

/// Run `program` through the configured pipeline.
pub fn optimize(
    program: &IrProgram,
    options: &JitOptions,
    session: &JitSession<'_>,
) -> JitResult<IrProgram> {
    let pass_options = PassOptions {
        constant_cap: options.constant_cap,
    };
    options.pipeline.run(program, session, pass_options)
}

/// Lower an already optimized program for the configured target.
pub fn compile_program(
    program: &IrProgram,
    options: &JitOptions,
    session: &JitSession<'_>,
) -> JitResult<CompiledBlock> {
    match options.target {
        TargetArch::Arm64 => crate::arm64::compile_block(program, options, session),
        TargetArch::X64 => crate::x64::compile_block(program, options, session),
    }
}

/// Block compiler and cache over a frontend.
pub struct Jit<F: Frontend> {
    frontend: F,
    options: JitOptions,
    code: CodeBuffer,
    blocks: HashMap<u32, BlockEntry>,
    stats: SessionStats,
}

impl<F: Frontend> Jit<F> {
    pub fn new(frontend: F, options: JitOptions) -> JitResult<Self> {
        let code = CodeBuffer::new(options.code_size)?;
        info!(
            "jit: target {}, {} passes, {} byte code buffer",
            options.target.name(),
            options.pipeline.passes().len(),
            code.capacity()
        );
        Ok(Self {
            frontend,
            options,
            code,
            blocks: HashMap::new(),
            stats: SessionStats::default(),
        })
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    /// Totals over every compile so far.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn lookup(&self, guest_addr: u32) -> Option<BlockEntry> {
        self.blocks.get(&guest_addr).copied()
    }

    /// Cached blocks in ascending guest address order.
    pub fn blocks(&self) -> Vec<BlockEntry> {
        let mut entries: Vec<BlockEntry> = self.blocks.values().copied().collect();
        entries.sort_unstable_by_key(|entry| entry.guest_addr);
        entries
    }

    /// Machine code of a cached block.
    pub fn code_bytes(&self, entry: &BlockEntry) -> &[u8] {
        self.code.bytes(entry.range)
    }

    /// Drop every cached block and reuse the code buffer.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.code.reset();
    }

    /// Compile the block at `guest_addr`, or return the cached one.
    pub fn compile(&mut self, guest_addr: u32) -> JitResult<BlockEntry> {
        if let Some(entry) = self.lookup(guest_addr) {
            return Ok(entry);
        }
        let program = self.frontend.translate(guest_addr)?;

        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let optimized = optimize(&program, &self.options, &session)?;
        let block = compile_program(&optimized, &self.options, &session)?;
        let range = self.code.append(&block.code)?;
        session.record_block_compiled(guest_addr, optimized.len(), block.code.len());
        self.stats.merge(&session.stats());

        let entry = BlockEntry {
            guest_addr,
            range,
            ir_len: optimized.len(),
            native_ops: block.native_ops,
            fallback_ops: block.fallback_ops,
        };
        debug!(
            "jit: block {:#010x} cached at +{:#x} ({} bytes)",
            guest_addr, range.offset, range.len
        );
        self.blocks.insert(guest_addr, entry);
        Ok(entry)
    }

    /// Run a cached block. Returns the exit target, or `None` if the block fell through.
    pub fn execute(
        &self,
        entry: &BlockEntry,
        state: &mut GuestState,
        memory: &mut GuestMemory,
    ) -> JitResult<Option<u32>> {
        if !self.options.target.is_host() || !cfg!(unix) {
            return Err(JitError::Unsupported {
                reason: format!(
                    "cannot execute {} code on this host",
                    self.options.target.name()
                ),
            });
        }
        let ptr = self.code.exec_ptr(entry.range.offset);
        // SAFETY: the range holds a committed block produced for this host with the block
        // ABI, and the buffer outlives the call.
        let func: BlockFn = unsafe { std::mem::transmute::<*const u8, BlockFn>(ptr) };
        let state_ptr: *mut GuestState = state;
        // SAFETY: state and memory stay borrowed for the whole call; fallback calls reach
        // memory only through the pointer installed by with_fallback_memory.
        let code = with_fallback_memory(memory, |base| unsafe { func(state_ptr, base) });
        match code {
            0 => Ok(None),
            FALLBACK_EXIT => Ok(Some(state.pc)),
            _ => Err(take_fallback_fault().unwrap_or(JitError::Unsupported {
                reason: format!("block {:#010x} returned {}", entry.guest_addr, code),
            })),
        }
    }

    /// Follow exits from `state.pc` until a block falls through, raises a syscall, runs
    /// the downcount out, or `max_blocks` blocks have run. Returns the number of blocks
    /// executed.
    pub fn run(
        &mut self,
        state: &mut GuestState,
        memory: &mut GuestMemory,
        max_blocks: usize,
    ) -> JitResult<usize> {
        let mut executed = 0;
        while executed < max_blocks {
            let entry = self.compile(state.pc)?;
            let exit = self.execute(&entry, state, memory)?;
            executed += 1;
            match exit {
                Some(target) if state.syscall == 0 && state.downcount > 0 => state.pc = target,
                _ => break,
            }
        }
        Ok(executed)
    }

    /// Interpret `program` directly.
    pub fn interpret(
        &self,
        program: &IrProgram,
        state: &mut GuestState,
        memory: &mut GuestMemory,
    ) -> JitResult<Option<u32>> {
        interpret_program(program, state, memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: &str = "\
block 0x08804000:
  SetConst r1, 0x10
  AddConst r2, r1, 0x20
  ExitToConst 0x08804100

block 0x08804100:
  Add r3, r2, r1
  ExitToConst 0x08804000
";

    fn jit(target: TargetArch) -> Jit<MapFrontend> {
        let frontend = MapFrontend::from_text(MODULE).unwrap();
        let options = JitOptions::for_target(target).with_code_size(64 * 1024);
        Jit::new(frontend, options).unwrap()
    }

    #[test]
    fn test_map_frontend() {
        let mut frontend = MapFrontend::from_text(MODULE).unwrap();
        assert_eq!(frontend.addresses(), vec![0x0880_4000, 0x0880_4100]);
        assert_eq!(frontend.translate(0x0880_4000).unwrap().len(), 3);
        assert!(matches!(
            frontend.translate(0x1234),
            Err(JitError::UnknownBlock { addr: 0x1234 })
        ));
    }

    #[test]
    fn test_compile_caches_blocks() {
        let mut jit = jit(TargetArch::Arm64);
        let first = jit.compile(0x0880_4000).unwrap();
        let again = jit.compile(0x0880_4000).unwrap();
        assert_eq!(first, again);
        assert_eq!(jit.stats().blocks_compiled, 1);

        let second = jit.compile(0x0880_4100).unwrap();
        assert_ne!(first.range.offset, second.range.offset);
        assert_eq!(second.range.offset % 16, 0);
        assert_eq!(jit.blocks().len(), 2);
        assert_eq!(jit.code_bytes(&first).len(), first.range.len);

        jit.clear();
        assert!(jit.lookup(0x0880_4000).is_none());
    }

    #[test]
    fn test_unknown_block() {
        let mut jit = jit(TargetArch::X64);
        assert!(matches!(jit.compile(0x42), Err(JitError::UnknownBlock { addr: 0x42 })));
    }

    #[test]
    fn test_interpret_substitute() {
        let jit = jit(TargetArch::host());
        let program = jit.frontend().get(0x0880_4000).unwrap();
        let mut state = GuestState::new();
        let mut memory = GuestMemory::new(0x1000);
        let exit = jit.interpret(program, &mut state, &mut memory).unwrap();
        assert_eq!(exit, Some(0x0880_4100));
        assert_eq!(state.regs[2], 0x30);
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    #[test]
    fn test_run_follows_exits() {
        let mut jit = jit(TargetArch::X64);
        let mut state = GuestState::new();
        let mut memory = GuestMemory::new(0x1000);
        state.pc = 0x0880_4000;
        state.downcount = 100;
        let executed = jit.run(&mut state, &mut memory, 3).unwrap();
        assert_eq!(executed, 3);
        assert_eq!(state.regs[3], 0x40);
        assert_eq!(state.pc, 0x0880_4100);
    }
}
