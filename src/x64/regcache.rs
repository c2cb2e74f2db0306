// This module describes the x86-64 System V host to the generic register engine. r14 holds the
// guest state pointer and r15 the guest memory base for the whole block; rax, rcx and rdx are
// scratch registers for the lowering (rcx because variable shifts take their count in cl, rdx
// because wide multiplies and string ops use it), and rsp is off limits. Allocation prefers
// the callee-saved rbx, r12 and r13 so values survive helper calls, then the argument
// registers and rbp. There are no static bindings on this host.
//
// Float and vector values live in xmm0..xmm13; xmm14 and xmm15 are scratch. Every xmm
// register is caller-saved in this ABI, so a helper call flushes all of them. Lane inserts
// and extracts use the SSE4.1 insertps/extractps forms.

//! x86-64 register engine target.

use super::encoder::{xmm_native, X64Encoder, MEMBASE, NUM_FPRS, NUM_GPRS};
use crate::core::error::JitResult;
use crate::core::regcache::{LaneSource, NativeReg, NativeTarget, RegBank, StaticBinding};
use crate::interp::state::slot_offset;
use iced_x86::code_asm::*;

const RAX: NativeReg = 0;
const RCX: NativeReg = 1;
const RDX: NativeReg = 2;
const RBX: NativeReg = 3;
const RBP: NativeReg = 5;
const RSI: NativeReg = 6;
const RDI: NativeReg = 7;

const GPR_ORDER: [NativeReg; 10] = [RBX, 12, 13, RSI, RDI, 8, 9, 10, 11, RBP];
const FPR_ORDER: [NativeReg; 14] = [
    xmm_native(0),
    xmm_native(1),
    xmm_native(2),
    xmm_native(3),
    xmm_native(4),
    xmm_native(5),
    xmm_native(6),
    xmm_native(7),
    xmm_native(8),
    xmm_native(9),
    xmm_native(10),
    xmm_native(11),
    xmm_native(12),
    xmm_native(13),
];

const REG_NAMES: [&str; 32] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d", "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7",
    "xmm8", "xmm9", "xmm10", "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

/// x86-64 target: the encoder plus the host description.
pub struct X64Target {
    pub enc: X64Encoder,
}

impl X64Target {
    pub fn new() -> JitResult<Self> {
        Ok(Self {
            enc: X64Encoder::new()?,
        })
    }

    fn is_fpr(native: NativeReg) -> bool {
        native as usize >= NUM_GPRS
    }

    fn state(slot: usize) -> AsmMemoryOperand {
        X64Encoder::state(slot_offset(slot))
    }
}

impl NativeTarget for X64Target {
    fn num_gprs(&self) -> usize {
        NUM_GPRS
    }

    fn num_fprs(&self) -> usize {
        NUM_FPRS
    }

    fn allocation_order(&self, bank: RegBank, _static_alloc: bool) -> &'static [NativeReg] {
        match bank {
            RegBank::Gpr => &GPR_ORDER,
            RegBank::Fpr => &FPR_ORDER,
        }
    }

    fn static_bindings(&self) -> &'static [StaticBinding] {
        &[]
    }

    fn is_caller_saved(&self, native: NativeReg) -> bool {
        Self::is_fpr(native) || matches!(native, RAX | RCX | RDX | RSI | RDI | 8..=11)
    }

    fn reg_name(&self, native: NativeReg) -> &'static str {
        REG_NAMES.get(native as usize).copied().unwrap_or("?")
    }

    fn load_native_reg(&mut self, native: NativeReg, slot: usize, lanes: u8) -> JitResult<()> {
        let mem = Self::state(slot);
        if Self::is_fpr(native) {
            let x = X64Encoder::xmm(native)?;
            if lanes == 4 {
                self.enc.asm().movups(x, xmmword_ptr(mem))?;
            } else {
                self.enc.asm().movss(x, dword_ptr(mem))?;
            }
        } else {
            self.enc.asm().mov(X64Encoder::gp32(native)?, dword_ptr(mem))?;
        }
        Ok(())
    }

    fn store_native_reg(
        &mut self,
        native: NativeReg,
        slot: usize,
        lane: u8,
        count: u8,
    ) -> JitResult<()> {
        let mem = Self::state(slot);
        if !Self::is_fpr(native) {
            self.enc.asm().mov(dword_ptr(mem), X64Encoder::gp32(native)?)?;
            return Ok(());
        }
        let x = X64Encoder::xmm(native)?;
        match (count, lane) {
            (4, _) => self.enc.asm().movups(xmmword_ptr(mem), x)?,
            (_, 0) => self.enc.asm().movss(dword_ptr(mem), x)?,
            (_, lane) => self.enc.asm().extractps(dword_ptr(mem), x, lane as i32)?,
        }
        Ok(())
    }

    fn set_native_reg_value(&mut self, native: NativeReg, value: u32) -> JitResult<()> {
        if Self::is_fpr(native) {
            self.enc.mov_xmm_imm32(X64Encoder::xmm(native)?, value)?;
        } else {
            self.enc.mov_imm32(X64Encoder::gp32(native)?, value)?;
        }
        Ok(())
    }

    fn store_reg_value(&mut self, slot: usize, value: u32) -> JitResult<()> {
        self.enc.asm().mov(dword_ptr(Self::state(slot)), value as i32)?;
        Ok(())
    }

    fn adjust_native_reg_as_ptr(&mut self, native: NativeReg, adjust: bool) -> JitResult<()> {
        let r = X64Encoder::gp64(native)?;
        if adjust {
            let r32 = X64Encoder::gp32(native)?;
            self.enc.asm().mov(r32, r32)?;
            self.enc.asm().add(r, MEMBASE)?;
        } else {
            self.enc.asm().sub(r, MEMBASE)?;
        }
        Ok(())
    }

    fn move_native_reg(&mut self, dest: NativeReg, src: NativeReg) -> JitResult<()> {
        match (Self::is_fpr(dest), Self::is_fpr(src)) {
            (false, false) => {
                let (d, s) = (X64Encoder::gp32(dest)?, X64Encoder::gp32(src)?);
                self.enc.asm().mov(d, s)?;
            }
            (true, true) => {
                let (d, s) = (X64Encoder::xmm(dest)?, X64Encoder::xmm(src)?);
                self.enc.asm().movaps(d, s)?;
            }
            (true, false) => {
                let (d, s) = (X64Encoder::xmm(dest)?, X64Encoder::gp32(src)?);
                self.enc.asm().movd(d, s)?;
            }
            (false, true) => {
                let (d, s) = (X64Encoder::gp32(dest)?, X64Encoder::xmm(src)?);
                self.enc.asm().movd(d, s)?;
            }
        }
        Ok(())
    }

    fn extract_lane(&mut self, dest: NativeReg, src: NativeReg, lane: u8) -> JitResult<()> {
        let (d, s) = (X64Encoder::xmm(dest)?, X64Encoder::xmm(src)?);
        self.enc.asm().pshufd(d, s, lane as i32)?;
        Ok(())
    }

    fn compose_lanes(&mut self, dest: NativeReg, sources: &[LaneSource; 4]) -> JitResult<()> {
        let d = X64Encoder::xmm(dest)?;
        for (lane, source) in sources.iter().enumerate() {
            let to = (lane as i32) << 4;
            match *source {
                LaneSource::Keep => {}
                LaneSource::Native { reg, lane: from } => {
                    let s = X64Encoder::xmm(reg)?;
                    self.enc.asm().insertps(d, s, (from as i32) << 6 | to)?;
                }
                LaneSource::Guest(slot) => {
                    self.enc.asm().insertps(d, dword_ptr(Self::state(slot)), to)?;
                }
                LaneSource::Imm(0) => {
                    // zero mask only
                    self.enc.asm().insertps(d, d, to | 1 << lane)?;
                }
                LaneSource::Imm(value) => {
                    self.enc.asm().mov(eax, value as i32)?;
                    self.enc.asm().movd(xmm15, eax)?;
                    self.enc.asm().insertps(d, xmm15, to)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::regcache::{MapMode, RegCache, RegCacheConfig};
    use crate::ir::regs::fpr_slot;
    use crate::ir::text::parse_program;

    fn cache() -> RegCache<X64Target> {
        let mut cache = RegCache::new(X64Target::new().unwrap(), RegCacheConfig::default());
        cache.start(parse_program("Add r1, r2, r3\n").unwrap().insts());
        cache
    }

    #[test]
    fn test_allocation_orders_skip_reserved() {
        let target = X64Target::new().unwrap();
        for reg in target.allocation_order(RegBank::Gpr, false) {
            assert!(![RAX, RCX, RDX, 4, 14, 15].contains(reg));
        }
        for reg in target.allocation_order(RegBank::Fpr, false) {
            assert!(*reg < xmm_native(14));
        }
        assert!(target.static_bindings().is_empty());
    }

    #[test]
    fn test_caller_saved_sets() {
        let target = X64Target::new().unwrap();
        assert!(!target.is_caller_saved(RBX));
        assert!(!target.is_caller_saved(12));
        assert!(!target.is_caller_saved(RBP));
        assert!(target.is_caller_saved(RSI));
        assert!(target.is_caller_saved(11));
        assert!(target.is_caller_saved(xmm_native(0)));
    }

    #[test]
    fn test_loads_use_context() {
        let mut c = cache();
        c.begin_inst(0);
        let r = c.map_gpr(2, MapMode::Read).unwrap();
        assert_eq!(r, RBX);
        let code = c.into_target().enc.finalize().unwrap();
        // mov ebx, [r14+8]
        assert_eq!(code, [0x41, 0x8b, 0x5e, 0x08]);
    }

    #[test]
    fn test_call_flushes_all_vectors() {
        let mut c = cache();
        c.begin_inst(0);
        let v = c.map_vec4(fpr_slot(8), MapMode::Write).unwrap();
        assert_eq!(v, xmm_native(0));
        let r = c.map_gpr(2, MapMode::Read).unwrap();
        c.flush_before_call(&[]).unwrap();
        assert_eq!(c.native_of(fpr_slot(8)), None);
        assert_eq!(c.native_of(2), Some(r));
    }
}
