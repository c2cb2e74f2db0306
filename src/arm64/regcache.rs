// This module describes the AArch64 host to the generic register engine. Native register
// numbers 0..32 are the integer registers by hardware number and 32..64 are V0..V31. X27 holds
// the guest state pointer and X28 the guest memory base for the whole block; W16/W17 and
// V0..V3 are scratch registers the engine never hands out, and X29/X30/SP are off limits.
//
// Allocation prefers the callee-saved W19..W26 so values survive helper calls, then the
// argument registers. With static allocation enabled W19..W24 are pinned to the guest's stack
// pointer (r29, kept as a host pointer when pointerify is on), the argument registers r2..r5
// and the return address r31. Vector registers prefer V8..V31; a call preserves only the low
// 64 bits of V8..V15, so four-lane groups held there are flushed before calls as well.
//
// The emit primitives address guest register slots at fixed offsets from X27. Four-lane groups
// move with 128-bit LDR/STR Q when the slot is 16-byte aligned and through a computed address
// otherwise; single lanes of a group are stored by duplicating the lane into V3 first.

//! AArch64 register engine target.

use super::encoder::{Arm64Encoder, GReg, MemOp, VReg, ZR};
use crate::core::error::JitResult;
use crate::core::regcache::{LaneSource, NativeReg, NativeTarget, RegBank, StaticBinding};
use crate::interp::state::slot_offset;

/// Guest state pointer.
pub const CTX: GReg = 27;
/// Guest memory base.
pub const MEMBASE: GReg = 28;
pub const SCRATCH1: GReg = 16;
pub const SCRATCH2: GReg = 17;
/// Vector scratch registers.
pub const VSCRATCH0: VReg = 0;
pub const VSCRATCH1: VReg = 1;
/// Reserved for lane stores issued by the engine.
const VLANE_SCRATCH: VReg = 3;

pub const NUM_GPRS: usize = 32;
pub const NUM_FPRS: usize = 32;

/// Native number of vector register `v`.
pub const fn fpr_native(v: VReg) -> NativeReg {
    NUM_GPRS as NativeReg + v
}

const GPR_ORDER: [NativeReg; 24] = [
    19, 20, 21, 22, 23, 24, 25, 26, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
];
const GPR_ORDER_STATIC: [NativeReg; 18] = [25, 26, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
const FPR_ORDER: [NativeReg; 28] = [
    fpr_native(8),
    fpr_native(9),
    fpr_native(10),
    fpr_native(11),
    fpr_native(12),
    fpr_native(13),
    fpr_native(14),
    fpr_native(15),
    fpr_native(16),
    fpr_native(17),
    fpr_native(18),
    fpr_native(19),
    fpr_native(20),
    fpr_native(21),
    fpr_native(22),
    fpr_native(23),
    fpr_native(24),
    fpr_native(25),
    fpr_native(26),
    fpr_native(27),
    fpr_native(28),
    fpr_native(29),
    fpr_native(30),
    fpr_native(31),
    fpr_native(4),
    fpr_native(5),
    fpr_native(6),
    fpr_native(7),
];

const STATIC_BINDINGS: [StaticBinding; 6] = [
    StaticBinding { slot: 29, native: 19, pointerify: true },
    StaticBinding { slot: 2, native: 20, pointerify: false },
    StaticBinding { slot: 3, native: 21, pointerify: false },
    StaticBinding { slot: 4, native: 22, pointerify: false },
    StaticBinding { slot: 5, native: 23, pointerify: false },
    StaticBinding { slot: 31, native: 24, pointerify: false },
];

const REG_NAMES: [&str; 64] = [
    "w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7", "w8", "w9", "w10", "w11", "w12", "w13", "w14",
    "w15", "w16", "w17", "w18", "w19", "w20", "w21", "w22", "w23", "w24", "w25", "w26", "w27",
    "w28", "w29", "w30", "wzr", "v0", "v1", "v2", "v3", "v4", "v5", "v6", "v7", "v8", "v9",
    "v10", "v11", "v12", "v13", "v14", "v15", "v16", "v17", "v18", "v19", "v20", "v21", "v22",
    "v23", "v24", "v25", "v26", "v27", "v28", "v29", "v30", "v31",
];

/// AArch64 target: the encoder plus the host description.
pub struct Arm64Target {
    pub enc: Arm64Encoder,
}

impl Default for Arm64Target {
    fn default() -> Self {
        Self::new()
    }
}

impl Arm64Target {
    pub fn new() -> Self {
        Self {
            enc: Arm64Encoder::new(),
        }
    }

    /// Integer register number of a native GPR.
    pub fn gpr(native: NativeReg) -> GReg {
        assert!((native as usize) < NUM_GPRS, "{} is not an integer register", native);
        native
    }

    /// Vector register number of a native FPR.
    pub fn vreg(native: NativeReg) -> VReg {
        assert!(
            (native as usize) >= NUM_GPRS && (native as usize) < NUM_GPRS + NUM_FPRS,
            "{} is not a vector register",
            native
        );
        native - NUM_GPRS as NativeReg
    }

    fn is_fpr(native: NativeReg) -> bool {
        native as usize >= NUM_GPRS
    }
}

impl NativeTarget for Arm64Target {
    fn num_gprs(&self) -> usize {
        NUM_GPRS
    }

    fn num_fprs(&self) -> usize {
        NUM_FPRS
    }

    fn allocation_order(&self, bank: RegBank, static_alloc: bool) -> &'static [NativeReg] {
        match (bank, static_alloc) {
            (RegBank::Gpr, false) => &GPR_ORDER,
            (RegBank::Gpr, true) => &GPR_ORDER_STATIC,
            (RegBank::Fpr, _) => &FPR_ORDER,
        }
    }

    fn static_bindings(&self) -> &'static [StaticBinding] {
        &STATIC_BINDINGS
    }

    fn is_caller_saved(&self, native: NativeReg) -> bool {
        if Self::is_fpr(native) {
            !(8..=15).contains(&Self::vreg(native))
        } else {
            native <= 18 || native == 30
        }
    }

    fn call_preserves_vector(&self, native: NativeReg) -> bool {
        !Self::is_fpr(native)
    }

    fn reg_name(&self, native: NativeReg) -> &'static str {
        REG_NAMES.get(native as usize).copied().unwrap_or("?")
    }

    fn load_native_reg(&mut self, native: NativeReg, slot: usize, lanes: u8) -> JitResult<()> {
        let offset = slot_offset(slot) as u32;
        if Self::is_fpr(native) {
            let op = if lanes == 4 { MemOp::LdrQ } else { MemOp::LdrS };
            self.enc.mem_imm(op, Self::vreg(native), CTX, offset, SCRATCH1);
        } else {
            self.enc.mem_imm(MemOp::LdrW, native, CTX, offset, SCRATCH1);
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
        let offset = slot_offset(slot) as u32;
        if !Self::is_fpr(native) {
            self.enc.mem_imm(MemOp::StrW, native, CTX, offset, SCRATCH1);
            return Ok(());
        }
        let v = Self::vreg(native);
        match (count, lane) {
            (4, _) => self.enc.mem_imm(MemOp::StrQ, v, CTX, offset, SCRATCH1),
            (_, 0) => self.enc.mem_imm(MemOp::StrS, v, CTX, offset, SCRATCH1),
            (_, lane) => {
                self.enc.dup_lane(VLANE_SCRATCH, v, lane);
                self.enc.mem_imm(MemOp::StrS, VLANE_SCRATCH, CTX, offset, SCRATCH1);
            }
        }
        Ok(())
    }

    fn set_native_reg_value(&mut self, native: NativeReg, value: u32) -> JitResult<()> {
        if Self::is_fpr(native) {
            self.enc.movi2r(SCRATCH1, value);
            self.enc.fmov_from_gpr(Self::vreg(native), SCRATCH1);
        } else {
            self.enc.movi2r(native, value);
        }
        Ok(())
    }

    fn store_reg_value(&mut self, slot: usize, value: u32) -> JitResult<()> {
        let offset = slot_offset(slot) as u32;
        if value == 0 {
            self.enc.mem_imm(MemOp::StrW, ZR, CTX, offset, SCRATCH1);
        } else {
            self.enc.movi2r(SCRATCH2, value);
            self.enc.mem_imm(MemOp::StrW, SCRATCH2, CTX, offset, SCRATCH1);
        }
        Ok(())
    }

    fn adjust_native_reg_as_ptr(&mut self, native: NativeReg, adjust: bool) -> JitResult<()> {
        let r = Self::gpr(native);
        if adjust {
            self.enc.add_uxtw(r, MEMBASE, r);
        } else {
            self.enc.sub(true, r, r, MEMBASE);
        }
        Ok(())
    }

    fn move_native_reg(&mut self, dest: NativeReg, src: NativeReg) -> JitResult<()> {
        match (Self::is_fpr(dest), Self::is_fpr(src)) {
            (false, false) => self.enc.mov(false, dest, src),
            (true, true) => self.enc.vec_mov(Self::vreg(dest), Self::vreg(src)),
            (true, false) => self.enc.fmov_from_gpr(Self::vreg(dest), src),
            (false, true) => self.enc.fmov_to_gpr(dest, Self::vreg(src)),
        }
        Ok(())
    }

    fn extract_lane(&mut self, dest: NativeReg, src: NativeReg, lane: u8) -> JitResult<()> {
        self.enc.dup_lane(Self::vreg(dest), Self::vreg(src), lane);
        Ok(())
    }

    fn compose_lanes(&mut self, dest: NativeReg, sources: &[LaneSource; 4]) -> JitResult<()> {
        let d = Self::vreg(dest);
        for (lane, source) in sources.iter().enumerate() {
            let lane = lane as u8;
            match *source {
                LaneSource::Keep => {}
                LaneSource::Native { reg, lane: from } => {
                    self.enc.ins_lane(d, lane, Self::vreg(reg), from);
                }
                LaneSource::Guest(slot) => {
                    let offset = slot_offset(slot) as u32;
                    self.enc.mem_imm(MemOp::LdrS, VLANE_SCRATCH, CTX, offset, SCRATCH1);
                    self.enc.ins_lane(d, lane, VLANE_SCRATCH, 0);
                }
                LaneSource::Imm(value) => {
                    if value == 0 {
                        self.enc.ins_gpr(d, lane, ZR);
                    } else {
                        self.enc.movi2r(SCRATCH1, value);
                        self.enc.ins_gpr(d, lane, SCRATCH1);
                    }
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

    fn cache(static_alloc: bool) -> RegCache<Arm64Target> {
        let mut cache = RegCache::new(
            Arm64Target::new(),
            RegCacheConfig {
                static_alloc,
                pointerify: static_alloc,
                lookahead_window: 30,
            },
        );
        cache.start(parse_program("Add r1, r2, r3\n").unwrap().insts());
        cache
    }

    #[test]
    fn test_allocation_orders_skip_reserved() {
        let target = Arm64Target::new();
        for static_alloc in [false, true] {
            for reg in target.allocation_order(RegBank::Gpr, static_alloc) {
                assert!(![CTX, MEMBASE, SCRATCH1, SCRATCH2, 29, 30, 31].contains(reg));
            }
        }
        for reg in target.allocation_order(RegBank::Fpr, false) {
            assert!(Arm64Target::vreg(*reg) >= 4);
        }
        for binding in target.static_bindings() {
            assert!(!target.allocation_order(RegBank::Gpr, true).contains(&binding.native));
            assert!(!target.is_caller_saved(binding.native));
        }
    }

    #[test]
    fn test_caller_saved_sets() {
        let target = Arm64Target::new();
        assert!(target.is_caller_saved(0));
        assert!(target.is_caller_saved(15));
        assert!(!target.is_caller_saved(19));
        assert!(!target.is_caller_saved(fpr_native(8)));
        assert!(target.is_caller_saved(fpr_native(16)));
        assert!(!target.call_preserves_vector(fpr_native(8)));
    }

    #[test]
    fn test_loads_and_stores_use_context() {
        let mut c = cache(false);
        c.begin_inst(0);
        let r = c.map_gpr(2, MapMode::Read).unwrap();
        assert_eq!(r, 19);
        let words = c.target().enc.words().to_vec();
        // ldr w19, [x27, #8]
        assert_eq!(words, [0xB940_0000 | 2 << 10 | (CTX as u32) << 5 | 19]);
    }

    #[test]
    fn test_vec4_group_spills_before_call() {
        let mut c = cache(false);
        c.begin_inst(0);
        let v = c.map_vec4(fpr_slot(8), MapMode::Write).unwrap();
        assert_eq!(v, fpr_native(8));
        c.flush_before_call(&[]).unwrap();
        assert_eq!(c.native_of(fpr_slot(8)), None);
    }

    #[test]
    fn test_static_pointerify() {
        let mut c = cache(true);
        c.reload_statics().unwrap();
        let words = c.target().enc.words().to_vec();
        // ldr w19, [x27, #116]; add x19, x28, w19, uxtw
        assert_eq!(words[0], 0xB940_0000 | 29 << 10 | (CTX as u32) << 5 | 19);
        assert_eq!(words[1], 0x8B20_4000 | 19 << 16 | (MEMBASE as u32) << 5 | 19);
    }
}
