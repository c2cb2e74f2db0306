// This module provides arena-based compilation session management using the bumpalo crate.
// A JitSession lives for the compilation of one translation unit: it owns a reference to the
// Bump arena that passes and backends use for short-lived scratch lists (the dead-temporary
// purge's write checks, per-block lowering worklists) and it records statistics about the
// work done. SessionStats counts blocks, IR instructions before and after optimization,
// native code bytes, per-opcode lowering counts split between native lowerings and
// interpreter fallback calls, passes that reported changes, and register engine spills.
// Statistics are merged into the JIT's running totals after each block so the CLI and tests
// can inspect them; the arena itself is dropped or reset with the unit.

//! Arena-based compilation session management.
//!
//! All per-unit scratch data is allocated from the session arena and shares
//! its lifetime.

use bumpalo::Bump;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// Per-unit compilation session.
pub struct JitSession<'arena> {
    /// Arena allocator for scratch data.
    arena: &'arena Bump,

    /// Statistics for this unit.
    stats: RefCell<SessionStats>,
}

impl<'arena> JitSession<'arena> {
    /// Create a new session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T: Copy>(&self, slice: &[T]) -> &'arena [T] {
        self.arena.alloc_slice_copy(slice)
    }

    /// Record that a block was compiled.
    pub fn record_block_compiled(&self, guest_addr: u32, ir_len: usize, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.blocks_compiled += 1;
        stats.ir_insts_compiled += ir_len;
        stats.total_code_size += code_size;

        if stats.largest_block_size < code_size {
            stats.largest_block_size = code_size;
            stats.largest_block_addr = guest_addr;
        }
    }

    /// Record the size of a program before and after the pass pipeline.
    pub fn record_optimized(&self, before: usize, after: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.ir_insts_in += before;
        stats.ir_insts_out += after;
    }

    /// Record that a pass reported a change.
    pub fn record_pass_changed(&self, pass: &'static str) {
        *self
            .stats
            .borrow_mut()
            .pass_changes
            .entry(pass)
            .or_insert(0) += 1;
    }

    /// Record lowering of one IR op.
    pub fn record_lowered(&self, op: &'static str, native: bool) {
        let mut stats = self.stats.borrow_mut();
        if native {
            stats.native_lowerings += 1;
        } else {
            stats.fallback_calls += 1;
        }
        *stats.op_counts.entry(op).or_insert(0) += 1;
    }

    /// Record a register spill.
    pub fn record_spill(&self) {
        self.record_spills(1);
    }

    /// Record `count` register spills.
    pub fn record_spills(&self, count: usize) {
        self.stats.borrow_mut().spills += count;
    }

    /// Get session statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of blocks compiled.
    pub blocks_compiled: usize,

    /// IR instructions handed to the backend.
    pub ir_insts_compiled: usize,

    /// IR instructions entering the pass pipeline.
    pub ir_insts_in: usize,

    /// IR instructions leaving the pass pipeline.
    pub ir_insts_out: usize,

    /// Native code bytes emitted.
    pub total_code_size: usize,

    /// Largest block (bytes) and its guest address.
    pub largest_block_size: usize,
    pub largest_block_addr: u32,

    /// Ops lowered to native code.
    pub native_lowerings: usize,

    /// Ops compiled as interpreter calls.
    pub fallback_calls: usize,

    /// Per-opcode lowering counts.
    pub op_counts: HashMap<&'static str, usize>,

    /// Passes that changed their input.
    pub pass_changes: HashMap<&'static str, usize>,

    /// Register spills.
    pub spills: usize,
}

impl SessionStats {
    /// Fold another set of statistics into this one.
    pub fn merge(&mut self, other: &SessionStats) {
        self.blocks_compiled += other.blocks_compiled;
        self.ir_insts_compiled += other.ir_insts_compiled;
        self.ir_insts_in += other.ir_insts_in;
        self.ir_insts_out += other.ir_insts_out;
        self.total_code_size += other.total_code_size;
        if other.largest_block_size > self.largest_block_size {
            self.largest_block_size = other.largest_block_size;
            self.largest_block_addr = other.largest_block_addr;
        }
        self.native_lowerings += other.native_lowerings;
        self.fallback_calls += other.fallback_calls;
        for (op, count) in &other.op_counts {
            *self.op_counts.entry(*op).or_insert(0) += count;
        }
        for (pass, count) in &other.pass_changes {
            *self.pass_changes.entry(*pass).or_insert(0) += count;
        }
        self.spills += other.spills;
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Blocks compiled: {}", self.blocks_compiled)?;
        writeln!(
            f,
            "  IR instructions: {} in, {} after passes",
            self.ir_insts_in, self.ir_insts_out
        )?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Native lowerings: {}", self.native_lowerings)?;
        writeln!(f, "  Interpreter fallbacks: {}", self.fallback_calls)?;
        writeln!(f, "  Spills: {}", self.spills)?;

        if self.largest_block_size > 0 {
            writeln!(
                f,
                "  Largest block: {:#010x} ({} bytes)",
                self.largest_block_addr, self.largest_block_size
            )?;
        }

        if !self.op_counts.is_empty() {
            writeln!(f, "  Op breakdown:")?;
            let mut sorted: Vec<_> = self.op_counts.iter().collect();
            sorted.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), **name));

            for (op, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", op, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let arena = Bump::new();
        let session = JitSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.blocks_compiled, 0);
        assert_eq!(stats.spills, 0);
    }

    #[test]
    fn test_arena_allocation() {
        let arena = Bump::new();
        let session = JitSession::new(&arena);

        let slice = session.alloc_slice(&[1, 2, 3, 4]);
        assert_eq!(slice, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = JitSession::new(&arena);

        session.record_block_compiled(0x0880_0000, 12, 128);
        session.record_lowered("Add", true);
        session.record_lowered("FSqrt", false);
        session.record_lowered("Add", true);
        session.record_spill();

        let stats = session.stats();
        assert_eq!(stats.blocks_compiled, 1);
        assert_eq!(stats.native_lowerings, 2);
        assert_eq!(stats.fallback_calls, 1);
        assert_eq!(stats.op_counts["Add"], 2);
        assert_eq!(stats.spills, 1);

        let mut total = SessionStats::default();
        total.merge(&stats);
        total.merge(&stats);
        assert_eq!(total.blocks_compiled, 2);
        assert_eq!(total.op_counts["Add"], 4);
        assert_eq!(total.largest_block_addr, 0x0880_0000);
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = JitSession::new(&arena);

        session.record_block_compiled(0x100, 3, 256);
        session.record_lowered("Store32", true);

        let output = format!("{}", session.stats());
        assert!(output.contains("Blocks compiled: 1"));
        assert!(output.contains("0x00000100 (256 bytes)"));
        assert!(output.contains("Store32: 1"));
    }
}
