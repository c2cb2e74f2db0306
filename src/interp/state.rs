// This module defines the guest-visible state that both execution engines operate on.
// GuestState is a #[repr(C)] block of 256 32-bit register slots indexed by IR register number,
// followed by the program counter, the cycle downcount and the pending syscall number; native
// code reaches every field at a fixed offset from its context register, so the layout is part
// of the compiled-code ABI. GuestMemory is the flat little-endian guest address space. The
// interpreter goes through its bounds-checked accessors, while compiled code indexes the raw
// base pointer directly and relies on callers sizing memory for every address a block can
// form.

//! Guest register file and memory.

use crate::core::error::{JitError, JitResult};
use crate::ir::regs::{fpr_slot, TOTAL_IR_REGS};

/// Register file and control state shared by the interpreter and compiled code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct GuestState {
    pub regs: [u32; TOTAL_IR_REGS],
    pub pc: u32,
    pub downcount: i32,
    pub syscall: u32,
}

/// Byte offset of `pc` inside [`GuestState`].
pub const PC_OFFSET: i32 = (TOTAL_IR_REGS * 4) as i32;
/// Byte offset of `downcount` inside [`GuestState`].
pub const DOWNCOUNT_OFFSET: i32 = PC_OFFSET + 4;
/// Byte offset of `syscall` inside [`GuestState`].
pub const SYSCALL_OFFSET: i32 = PC_OFFSET + 8;

/// Byte offset of an IR register slot inside [`GuestState`].
pub const fn slot_offset(slot: usize) -> i32 {
    (slot * 4) as i32
}

impl Default for GuestState {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestState {
    pub fn new() -> Self {
        Self {
            regs: [0; TOTAL_IR_REGS],
            pc: 0,
            downcount: 0,
            syscall: 0,
        }
    }

    /// Float value of FPR field `f`.
    pub fn f(&self, f: u8) -> f32 {
        f32::from_bits(self.regs[fpr_slot(f)])
    }

    pub fn set_f(&mut self, f: u8, value: f32) {
        self.regs[fpr_slot(f)] = value.to_bits();
    }

    /// Raw bits of FPR field `f`.
    pub fn fi(&self, f: u8) -> u32 {
        self.regs[fpr_slot(f)]
    }

    pub fn set_fi(&mut self, f: u8, bits: u32) {
        self.regs[fpr_slot(f)] = bits;
    }

    /// Four consecutive FPR fields starting at `f`, as raw bits.
    pub fn vec4(&self, f: u8) -> [u32; 4] {
        let base = fpr_slot(f);
        [
            self.regs[base],
            self.regs[base + 1],
            self.regs[base + 2],
            self.regs[base + 3],
        ]
    }

    pub fn set_vec4(&mut self, f: u8, lanes: [u32; 4]) {
        let base = fpr_slot(f);
        self.regs[base..base + 4].copy_from_slice(&lanes);
    }
}

/// Flat little-endian guest memory.
#[derive(Debug, Clone)]
pub struct GuestMemory {
    bytes: Box<[u8]>,
}

impl GuestMemory {
    /// Zero-filled memory of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Base pointer handed to compiled code.
    pub fn base_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    fn range(&self, addr: u32, size: u32) -> JitResult<std::ops::Range<usize>> {
        let start = addr as usize;
        let end = start + size as usize;
        if end > self.bytes.len() {
            return Err(JitError::MemoryFault { addr, size });
        }
        Ok(start..end)
    }

    pub fn read_u8(&self, addr: u32) -> JitResult<u8> {
        let r = self.range(addr, 1)?;
        Ok(self.bytes[r.start])
    }

    pub fn read_u16(&self, addr: u32) -> JitResult<u16> {
        let r = self.range(addr, 2)?;
        Ok(u16::from_le_bytes([self.bytes[r.start], self.bytes[r.start + 1]]))
    }

    pub fn read_u32(&self, addr: u32) -> JitResult<u32> {
        let r = self.range(addr, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.bytes[r]);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> JitResult<()> {
        let r = self.range(addr, 1)?;
        self.bytes[r.start] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> JitResult<()> {
        let r = self.range(addr, 2)?;
        self.bytes[r].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> JitResult<()> {
        let r = self.range(addr, 4)?;
        self.bytes[r].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy `data` into memory at `addr`.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> JitResult<()> {
        let r = self.range(addr, data.len() as u32)?;
        self.bytes[r].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        let state = GuestState::new();
        let base = &state as *const GuestState as usize;
        assert_eq!(&state.pc as *const u32 as usize - base, PC_OFFSET as usize);
        assert_eq!(
            &state.downcount as *const i32 as usize - base,
            DOWNCOUNT_OFFSET as usize
        );
        assert_eq!(
            &state.syscall as *const u32 as usize - base,
            SYSCALL_OFFSET as usize
        );
    }

    #[test]
    fn test_memory_little_endian() {
        let mut mem = GuestMemory::new(16);
        mem.write_u32(4, 0x1122_3344).unwrap();
        assert_eq!(mem.read_u8(4).unwrap(), 0x44);
        assert_eq!(mem.read_u16(6).unwrap(), 0x1122);
        assert!(matches!(
            mem.read_u32(14),
            Err(JitError::MemoryFault { addr: 14, size: 4 })
        ));
    }

    #[test]
    fn test_float_accessors() {
        let mut state = GuestState::new();
        state.set_f(3, 1.5);
        assert_eq!(state.regs[35], 1.5f32.to_bits());
        state.set_vec4(32, [1, 2, 3, 4]);
        assert_eq!(state.vec4(32), [1, 2, 3, 4]);
    }
}
