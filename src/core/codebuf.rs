// This module provides the executable memory compiled blocks live in. A CodeBuffer holds two
// views of the same bytes: a writable one the JIT copies code into and an executable one the
// host jumps to. On Linux both views are mappings of one memfd region, so nothing ever needs to
// be writable and executable at once; the pair (exec_base, write_base) is kept explicitly and
// every caller translates between them with the fixed offset. Where a second shared mapping
// cannot be created the buffer falls back to a single anonymous mapping whose protection is
// flipped between read-write and read-execute around each write.
//
// Blocks are appended at 16-byte alignment and never move. commit() makes freshly written bytes
// visible to instruction fetch: on aarch64 that means cleaning the data cache and invalidating
// the instruction cache over the range, on x86-64 the hardware keeps them coherent. The buffer
// is reset as a whole, which invalidates every pointer previously handed out.

//! Executable code buffer with separate write and execute views.

use super::error::{JitError, JitResult};
use log::{debug, warn};
use std::ptr::NonNull;

const BLOCK_ALIGN: usize = 16;

fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

fn os_error(what: &str) -> JitError {
    JitError::CodeBuffer {
        reason: format!("{}: {}", what, std::io::Error::last_os_error()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapping {
    /// Two shared mappings of one memfd, RW and RX.
    Dual { fd: i32 },
    /// One private mapping toggled with mprotect.
    Toggled { writable: bool },
}

/// Location of a committed block inside a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    pub offset: usize,
    pub len: usize,
}

/// Executable memory for compiled blocks.
pub struct CodeBuffer {
    exec: NonNull<u8>,
    write: NonNull<u8>,
    size: usize,
    used: usize,
    mapping: Mapping,
}

impl CodeBuffer {
    /// Map a buffer of at least `size` bytes.
    pub fn new(size: usize) -> JitResult<Self> {
        if size == 0 {
            return Err(JitError::CodeBuffer {
                reason: "zero-sized code buffer".to_string(),
            });
        }
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);

        match Self::map_dual(size) {
            Ok(buffer) => Ok(buffer),
            Err(err) => {
                warn!("dual-mapped code buffer unavailable ({}), toggling protection", err);
                Self::map_toggled(size)
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn map_dual(size: usize) -> JitResult<Self> {
        let name = c"irjit-code";
        // SAFETY: name is NUL terminated; the flags are valid for memfd_create.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(os_error("memfd_create"));
        }
        // SAFETY: fd is a fresh memfd owned by this function.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = os_error("ftruncate");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let map = |prot: libc::c_int| -> JitResult<NonNull<u8>> {
            // SAFETY: mapping a fresh region of a file we own.
            let ptr = unsafe {
                libc::mmap(std::ptr::null_mut(), size, prot, libc::MAP_SHARED, fd, 0)
            };
            if ptr == libc::MAP_FAILED {
                return Err(os_error("mmap"));
            }
            NonNull::new(ptr as *mut u8).ok_or_else(|| os_error("mmap"))
        };

        let write = match map(libc::PROT_READ | libc::PROT_WRITE) {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };
        let exec = match map(libc::PROT_READ | libc::PROT_EXEC) {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe {
                    libc::munmap(write.as_ptr() as *mut libc::c_void, size);
                    libc::close(fd);
                }
                return Err(err);
            }
        };

        debug!(
            "code buffer: {} bytes, exec {:p}, write {:p}",
            size,
            exec.as_ptr(),
            write.as_ptr()
        );
        Ok(Self {
            exec,
            write,
            size,
            used: 0,
            mapping: Mapping::Dual { fd },
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn map_dual(_size: usize) -> JitResult<Self> {
        Err(JitError::CodeBuffer {
            reason: "memfd is only available on Linux".to_string(),
        })
    }

    #[cfg(unix)]
    fn map_toggled(size: usize) -> JitResult<Self> {
        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap"));
        }
        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| os_error("mmap"))?;
        debug!("code buffer: {} bytes at {:p}, single mapping", size, base.as_ptr());
        Ok(Self {
            exec: base,
            write: base,
            size,
            used: 0,
            mapping: Mapping::Toggled { writable: true },
        })
    }

    #[cfg(not(unix))]
    fn map_toggled(_size: usize) -> JitResult<Self> {
        Err(JitError::CodeBuffer {
            reason: "executable memory needs a unix host".to_string(),
        })
    }

    /// Base of the executable view.
    pub fn exec_base(&self) -> *const u8 {
        self.exec.as_ptr()
    }

    /// Base of the writable view.
    pub fn write_base(&self) -> *mut u8 {
        self.write.as_ptr()
    }

    /// `write_base - exec_base`; zero for a single toggled mapping.
    pub fn view_offset(&self) -> isize {
        self.write.as_ptr() as isize - self.exec.as_ptr() as isize
    }

    pub fn is_dual_mapped(&self) -> bool {
        matches!(self.mapping, Mapping::Dual { .. })
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.size - self.used
    }

    fn set_writable(&mut self, writable: bool) -> JitResult<()> {
        let Mapping::Toggled { writable: current } = self.mapping else {
            return Ok(());
        };
        if current == writable {
            return Ok(());
        }
        #[cfg(unix)]
        {
            let prot = if writable {
                libc::PROT_READ | libc::PROT_WRITE
            } else {
                libc::PROT_READ | libc::PROT_EXEC
            };
            // SAFETY: the range is exactly the mapping created in map_toggled.
            if unsafe { libc::mprotect(self.exec.as_ptr() as *mut libc::c_void, self.size, prot) }
                != 0
            {
                return Err(os_error("mprotect"));
            }
        }
        self.mapping = Mapping::Toggled { writable };
        Ok(())
    }

    /// Copy `code` into the buffer and make it executable.
    pub fn append(&mut self, code: &[u8]) -> JitResult<CodeRange> {
        let offset = (self.used + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1);
        if offset + code.len() > self.size {
            return Err(JitError::CodeBuffer {
                reason: format!(
                    "out of space: {} bytes requested, {} left",
                    code.len(),
                    self.size.saturating_sub(offset)
                ),
            });
        }

        self.set_writable(true)?;
        // SAFETY: offset + len is inside the writable view, which does not overlap `code`.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.write.as_ptr().add(offset), code.len());
        }
        self.used = offset + code.len();

        let range = CodeRange {
            offset,
            len: code.len(),
        };
        self.commit(range)?;
        Ok(range)
    }

    /// Make `range` executable and coherent with instruction fetch.
    pub fn commit(&mut self, range: CodeRange) -> JitResult<()> {
        self.set_writable(false)?;
        flush_icache(self.exec_ptr(range.offset), range.len);
        Ok(())
    }

    /// Executable address of `offset`.
    pub fn exec_ptr(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.size, "code offset {:#x} outside the buffer", offset);
        // SAFETY: checked against the mapping size above.
        unsafe { self.exec.as_ptr().add(offset) }
    }

    /// Committed bytes of `range`, read through the executable view.
    pub fn bytes(&self, range: CodeRange) -> &[u8] {
        assert!(range.offset + range.len <= self.used, "code range past the end of the buffer");
        // SAFETY: the range is inside the mapping, and both views are readable.
        unsafe { std::slice::from_raw_parts(self.exec_ptr(range.offset), range.len) }
    }

    /// Forget every block. Pointers into the buffer become dangling.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            // SAFETY: the mappings and fd were created by this buffer and are released once.
            libc::munmap(self.exec.as_ptr() as *mut libc::c_void, self.size);
            if let Mapping::Dual { fd } = self.mapping {
                libc::munmap(self.write.as_ptr() as *mut libc::c_void, self.size);
                libc::close(fd);
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_icache(start: *const u8, len: usize) {
    use std::arch::asm;

    if len == 0 {
        return;
    }
    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from EL0 on Linux and macOS.
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr) };
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);
    let start = start as usize;
    let end = start + len;

    let mut addr = start & !(dline - 1);
    while addr < end {
        // SAFETY: cache maintenance on mapped, readable addresses.
        unsafe { asm!("dc cvau, {}", in(reg) addr) };
        addr += dline;
    }
    unsafe { asm!("dsb ish") };
    let mut addr = start & !(iline - 1);
    while addr < end {
        unsafe { asm!("ic ivau, {}", in(reg) addr) };
        addr += iline;
    }
    unsafe { asm!("dsb ish", "isb") };
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: *const u8, _len: usize) {}
