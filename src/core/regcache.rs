// This module is the native register allocation engine shared by every backend. RegCache owns
// the bookkeeping for both sides of the mapping: one VirtState per IR register slot (where
// the value lives right now, the known immediate if any, lock marks and the static flag) and
// one NativeState per host register (occupant, lane count, dirty, pointerified and
// normalized32 flags, temp lock). Everything that emits code goes through the NativeTarget
// trait, which also describes the host: register counts, allocation order per bank, static
// bindings and the caller-saved set. The engine decides; the target only encodes.
//
// A host FPR holds either one scalar slot (lane 0) or a group of four consecutive slots
// (lanes 0..3, one per slot). Lanes can move out of a group one at a time: a slot that has
// been extracted into its own register stops pointing at the group, and the group register
// then only stores back the lanes that are still resident. Composing a group back together
// reuses the group register when it still holds at least two lanes and pulls every other
// lane in from wherever it lives (another register, a known immediate, or guest storage) in a
// single compose_lanes call, updating all affected slots afterwards in one step.
//
// Victim selection follows the allocation order and consults the lookahead: a register whose
// every resident slot is clobbered before being read is discarded without a store, one whose
// slots are all unused in the window is flushed next, and only then the first unlocked
// candidate is flushed. When every candidate is locked the engine panics: that instruction
// needs more simultaneously live values than the host register file holds.

//! Generic native register cache.

use super::error::JitResult;
use super::lookahead::{next_usage, Usage};
use crate::ir::regs::{is_gpr_slot, FPR_BASE, FPR_COUNT, TOTAL_IR_REGS};
use crate::ir::IrInst;
use log::trace;

/// Index of a host register in the target's numbering. Integer registers come first,
/// followed by the float/vector registers.
pub type NativeReg = u8;

/// Register class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    Gpr,
    Fpr,
}

/// Where a virtual register's current value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegStatus {
    InGuestStorage,
    KnownImmediate,
    InHostRegister,
    InHostRegisterWithImmediate,
    InHostRegisterAsPointer,
}

/// How an instruction uses a mapped register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    /// Fully overwritten; the old value is not loaded.
    Write,
    ReadWrite,
}

impl MapMode {
    pub fn reads(self) -> bool {
        matches!(self, MapMode::Read | MapMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, MapMode::Write | MapMode::ReadWrite)
    }
}

/// Where one lane of a composed vector comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneSource {
    /// Already in place in the destination register.
    Keep,
    /// Lane `lane` of another host register.
    Native { reg: NativeReg, lane: u8 },
    /// Guest storage of the slot.
    Guest(usize),
    /// A known 32-bit value.
    Imm(u32),
}

/// A guest register pinned to one host register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticBinding {
    pub slot: usize,
    pub native: NativeReg,
    /// Kept adjusted as a host pointer when pointerify is enabled.
    pub pointerify: bool,
}

/// Host description and emit primitives for one architecture.
pub trait NativeTarget {
    fn num_gprs(&self) -> usize;
    fn num_fprs(&self) -> usize;
    /// Candidate registers in priority order. With static allocation enabled the
    /// statically bound registers are left out.
    fn allocation_order(&self, bank: RegBank, static_alloc: bool) -> &'static [NativeReg];
    fn static_bindings(&self) -> &'static [StaticBinding];
    fn is_caller_saved(&self, native: NativeReg) -> bool;
    /// Whether a call keeps all 128 bits of a callee-saved vector register.
    fn call_preserves_vector(&self, _native: NativeReg) -> bool {
        true
    }
    fn simd_width(&self) -> usize {
        4
    }
    fn reg_name(&self, native: NativeReg) -> &'static str;

    /// Load `lanes` (1 or 4) consecutive slots starting at `slot` into lane 0 upwards.
    fn load_native_reg(&mut self, native: NativeReg, slot: usize, lanes: u8) -> JitResult<()>;
    /// Store `count` lanes starting at `lane` into the slots starting at `slot`.
    fn store_native_reg(
        &mut self,
        native: NativeReg,
        slot: usize,
        lane: u8,
        count: u8,
    ) -> JitResult<()>;
    fn set_native_reg_value(&mut self, native: NativeReg, value: u32) -> JitResult<()>;
    fn store_reg_value(&mut self, slot: usize, value: u32) -> JitResult<()>;
    /// Add (`true`) or remove (`false`) the guest memory base.
    fn adjust_native_reg_as_ptr(&mut self, native: NativeReg, adjust: bool) -> JitResult<()>;
    fn move_native_reg(&mut self, dest: NativeReg, src: NativeReg) -> JitResult<()>;
    /// Copy lane `lane` of `src` into lane 0 of `dest`.
    fn extract_lane(&mut self, dest: NativeReg, src: NativeReg, lane: u8) -> JitResult<()>;
    /// Fill the lanes of `dest` from `sources`. No source names `dest`.
    fn compose_lanes(&mut self, dest: NativeReg, sources: &[LaneSource; 4]) -> JitResult<()>;
}

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegCacheConfig {
    pub static_alloc: bool,
    pub pointerify: bool,
    pub lookahead_window: usize,
}

impl Default for RegCacheConfig {
    fn default() -> Self {
        Self {
            static_alloc: false,
            pointerify: false,
            lookahead_window: crate::core::config::DEFAULT_LOOKAHEAD,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct VirtState {
    status: RegStatus,
    native: Option<NativeReg>,
    lane: u8,
    imm: u32,
    spill_locked: bool,
    is_static: bool,
}

impl Default for VirtState {
    fn default() -> Self {
        Self {
            status: RegStatus::InGuestStorage,
            native: None,
            lane: 0,
            imm: 0,
            spill_locked: false,
            is_static: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct NativeState {
    /// First slot held; the lowest lane for vector groups.
    occupant: Option<usize>,
    lanes: u8,
    dirty: bool,
    pointerified: bool,
    normalized32: bool,
    temp_locked: bool,
}

/// Register cache over a target `T`.
pub struct RegCache<T: NativeTarget> {
    target: T,
    config: RegCacheConfig,
    virt: Vec<VirtState>,
    native: Vec<NativeState>,
    insts: Vec<IrInst>,
    index: usize,
    spills: usize,
}

impl<T: NativeTarget> RegCache<T> {
    pub fn new(target: T, config: RegCacheConfig) -> Self {
        let total = target.num_gprs() + target.num_fprs();
        let mut cache = Self {
            target,
            config,
            virt: vec![VirtState::default(); TOTAL_IR_REGS],
            native: vec![NativeState::default(); total],
            insts: Vec::new(),
            index: 0,
            spills: 0,
        };
        cache.reset();
        cache
    }

    fn reset(&mut self) {
        self.virt.fill(VirtState::default());
        self.native.fill(NativeState::default());
        if self.config.static_alloc {
            for binding in self.target.static_bindings() {
                self.virt[binding.slot] = VirtState {
                    status: RegStatus::InHostRegister,
                    native: Some(binding.native),
                    is_static: true,
                    ..VirtState::default()
                };
                self.native[binding.native as usize] = NativeState {
                    occupant: Some(binding.slot),
                    lanes: 1,
                    normalized32: true,
                    ..NativeState::default()
                };
            }
        }
    }

    /// Begin a new block. Non-static registers start out in guest storage; static
    /// registers keep their binding.
    pub fn start(&mut self, insts: &[IrInst]) {
        self.insts = insts.to_vec();
        self.index = 0;
        self.spills = 0;
        self.reset();
    }

    /// Move to instruction `index`, dropping the previous instruction's locks.
    pub fn begin_inst(&mut self, index: usize) {
        self.index = index;
        self.release_locks();
    }

    pub fn release_locks(&mut self) {
        for v in self.virt.iter_mut() {
            v.spill_locked = false;
        }
        for n in self.native.iter_mut() {
            n.temp_locked = false;
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }

    pub fn config(&self) -> RegCacheConfig {
        self.config
    }

    /// Evictions performed since `start`.
    pub fn spills(&self) -> usize {
        self.spills
    }

    pub fn status(&self, slot: usize) -> RegStatus {
        self.virt[slot].status
    }

    pub fn native_of(&self, slot: usize) -> Option<NativeReg> {
        self.virt[slot].native
    }

    /// Lane of `slot` inside its host register.
    pub fn lane_of(&self, slot: usize) -> u8 {
        self.virt[slot].lane
    }

    pub fn is_static(&self, slot: usize) -> bool {
        self.virt[slot].is_static
    }

    pub fn is_dirty(&self, native: NativeReg) -> bool {
        self.native[native as usize].dirty
    }

    pub fn is_pointerified(&self, native: NativeReg) -> bool {
        self.native[native as usize].pointerified
    }

    pub fn is_normalized32(&self, native: NativeReg) -> bool {
        self.native[native as usize].normalized32
    }

    /// Slots resident in `native`, with their lanes.
    pub fn occupants(&self, native: NativeReg) -> Vec<(usize, u8)> {
        self.valid_lanes(native)
    }

    /// Known value of an integer slot, if any.
    pub fn imm(&self, slot: usize) -> Option<u32> {
        let v = &self.virt[slot];
        match v.status {
            RegStatus::KnownImmediate | RegStatus::InHostRegisterWithImmediate => Some(v.imm),
            _ => None,
        }
    }

    pub fn spill_lock(&mut self, slot: usize) {
        self.virt[slot].spill_locked = true;
    }

    fn bank_of(&self, native: NativeReg) -> RegBank {
        if (native as usize) < self.target.num_gprs() {
            RegBank::Gpr
        } else {
            RegBank::Fpr
        }
    }

    fn valid_lanes(&self, native: NativeReg) -> Vec<(usize, u8)> {
        let state = &self.native[native as usize];
        let Some(first) = state.occupant else {
            return Vec::new();
        };
        (0..state.lanes.max(1))
            .map(|lane| (first + lane as usize, lane))
            .filter(|(slot, _)| *slot < TOTAL_IR_REGS && self.virt[*slot].native == Some(native))
            .collect()
    }

    fn free_native(&mut self, native: NativeReg) {
        let temp_locked = self.native[native as usize].temp_locked;
        self.native[native as usize] = NativeState {
            temp_locked,
            ..NativeState::default()
        };
    }

    fn clear_virt(&mut self, slot: usize) {
        let v = &mut self.virt[slot];
        v.status = RegStatus::InGuestStorage;
        v.native = None;
        v.lane = 0;
        v.imm = 0;
    }

    /// Detach `slot` from its host register without storing it.
    fn detach(&mut self, slot: usize) {
        let Some(native) = self.virt[slot].native else {
            return;
        };
        self.clear_virt(slot);
        if self.valid_lanes(native).is_empty() {
            self.free_native(native);
        }
    }

    fn describe_current(&self) -> String {
        match self.insts.get(self.index) {
            Some(inst) => format!("IR instruction {} ({})", self.index, inst.op),
            None => format!("IR instruction {}", self.index),
        }
    }

    fn find_free(&self, bank: RegBank) -> Option<NativeReg> {
        self.target
            .allocation_order(bank, self.config.static_alloc)
            .iter()
            .copied()
            .find(|n| {
                let state = &self.native[*n as usize];
                state.occupant.is_none() && !state.temp_locked
            })
    }

    fn usage(&self, slot: usize) -> Usage {
        next_usage(&self.insts, self.index, slot, self.config.lookahead_window)
    }

    /// Pick an eviction victim. Returns the register and whether its contents are
    /// clobbered (dead) so it can be discarded without a store.
    fn find_best_to_spill(&self, bank: RegBank, unused_only: bool) -> Option<(NativeReg, bool)> {
        for native in self
            .target
            .allocation_order(bank, self.config.static_alloc)
            .iter()
            .copied()
        {
            let state = &self.native[native as usize];
            if state.temp_locked || state.occupant.is_none() {
                continue;
            }
            let slots = self.valid_lanes(native);
            if slots
                .iter()
                .any(|(slot, _)| self.virt[*slot].spill_locked || self.virt[*slot].is_static)
            {
                continue;
            }

            let usages: Vec<Usage> = slots.iter().map(|(slot, _)| self.usage(*slot)).collect();
            if usages.iter().all(|u| *u == Usage::Clobbered) {
                return Some((native, true));
            }
            if !unused_only || usages.iter().all(|u| *u == Usage::Unused) {
                return Some((native, false));
            }
        }
        None
    }

    fn alloc(&mut self, bank: RegBank) -> JitResult<NativeReg> {
        if let Some(native) = self.find_free(bank) {
            return Ok(native);
        }

        let victim = self
            .find_best_to_spill(bank, true)
            .or_else(|| self.find_best_to_spill(bank, false));
        let Some((native, clobbered)) = victim else {
            panic!(
                "register allocation exhausted: every {:?} register is locked at {}",
                bank,
                self.describe_current()
            );
        };

        trace!(
            "spill {} ({}) at {}",
            self.target.reg_name(native),
            if clobbered { "discard" } else { "flush" },
            self.describe_current()
        );
        self.spills += 1;
        if clobbered {
            self.discard_native(native);
        } else {
            self.flush_native(native)?;
        }
        Ok(native)
    }

    /// Allocate a scratch register locked until the next `begin_inst`.
    pub fn alloc_temp(&mut self, bank: RegBank) -> JitResult<NativeReg> {
        let native = self.alloc(bank)?;
        self.native[native as usize].temp_locked = true;
        Ok(native)
    }

    /// Forget the contents of `native` without storing them.
    pub fn discard_native(&mut self, native: NativeReg) {
        let slots = self.valid_lanes(native);
        if slots.iter().any(|(slot, _)| self.virt[*slot].is_static) {
            let state = &mut self.native[native as usize];
            state.dirty = false;
            state.pointerified = false;
            return;
        }
        for (slot, _) in slots {
            self.clear_virt(slot);
        }
        self.free_native(native);
    }

    /// Store `native` back to guest storage if dirty and free it.
    pub fn flush_native(&mut self, native: NativeReg) -> JitResult<()> {
        let slots = self.valid_lanes(native);
        if slots.is_empty() {
            self.free_native(native);
            return Ok(());
        }
        assert!(
            !self.virt[slots[0].0].is_static,
            "flush_native on statically bound {}",
            self.target.reg_name(native)
        );

        if self.native[native as usize].dirty {
            self.store_lanes(native, &slots)?;
        }

        for (slot, _) in slots {
            self.clear_virt(slot);
        }
        self.free_native(native);
        Ok(())
    }

    /// Store the valid lanes of `native`. A pointer-adjusted GPR is left un-adjusted.
    fn store_lanes(&mut self, native: NativeReg, slots: &[(usize, u8)]) -> JitResult<()> {
        let state = self.native[native as usize];
        match self.bank_of(native) {
            RegBank::Gpr => {
                if state.pointerified {
                    self.target.adjust_native_reg_as_ptr(native, false)?;
                }
                self.target.store_native_reg(native, slots[0].0, 0, 1)?;
            }
            RegBank::Fpr if state.lanes <= 1 => {
                self.target.store_native_reg(native, slots[0].0, 0, 1)?;
            }
            RegBank::Fpr if slots.len() == 4 => {
                self.target.store_native_reg(native, slots[0].0, 0, 4)?;
            }
            RegBank::Fpr => {
                for (slot, lane) in slots {
                    self.target.store_native_reg(native, *slot, *lane, 1)?;
                }
            }
        }
        Ok(())
    }

    /// Store `native` if dirty and keep it mapped as a clean copy.
    fn write_back_native(&mut self, native: NativeReg) -> JitResult<()> {
        let state = self.native[native as usize];
        let slots = self.valid_lanes(native);
        if !state.dirty || slots.is_empty() {
            return Ok(());
        }
        self.store_lanes(native, &slots)?;
        if state.pointerified {
            self.target.adjust_native_reg_as_ptr(native, true)?;
        }
        self.native[native as usize].dirty = false;
        Ok(())
    }

    /// Write `slot` back to guest storage and drop its mapping.
    pub fn flush_slot(&mut self, slot: usize) -> JitResult<()> {
        let v = self.virt[slot];
        if v.is_static {
            return Ok(());
        }
        match (v.status, v.native) {
            (RegStatus::KnownImmediate, _) => {
                self.target.store_reg_value(slot, v.imm)?;
                self.clear_virt(slot);
            }
            (_, Some(native)) => self.flush_native(native)?,
            _ => {}
        }
        Ok(())
    }

    /// Record that an integer slot now holds `value`.
    pub fn set_imm(&mut self, slot: usize, value: u32) -> JitResult<()> {
        assert!(is_gpr_slot(slot), "set_imm on float slot {}", slot);
        let v = self.virt[slot];
        if let (true, Some(native)) = (v.is_static, v.native) {
            self.target.set_native_reg_value(native, value)?;
            let state = &mut self.native[native as usize];
            state.dirty = true;
            state.pointerified = false;
            state.normalized32 = true;
            let v = &mut self.virt[slot];
            v.status = RegStatus::InHostRegisterWithImmediate;
            v.imm = value;
            return Ok(());
        }
        if v.native.is_some() {
            self.detach(slot);
        }
        let v = &mut self.virt[slot];
        v.status = RegStatus::KnownImmediate;
        v.imm = value;
        Ok(())
    }

    /// Map an integer slot to a host register.
    pub fn map_gpr(&mut self, slot: usize, mode: MapMode) -> JitResult<NativeReg> {
        assert!(is_gpr_slot(slot), "map_gpr on float slot {}", slot);
        self.virt[slot].spill_locked = true;
        let v = self.virt[slot];

        let native = match v.native {
            Some(native) => {
                if v.status == RegStatus::InHostRegisterAsPointer {
                    if mode.reads() {
                        self.target.adjust_native_reg_as_ptr(native, false)?;
                    }
                    self.native[native as usize].pointerified = false;
                    self.native[native as usize].normalized32 = true;
                    self.virt[slot].status = RegStatus::InHostRegister;
                }
                native
            }
            None => {
                let native = self.alloc(RegBank::Gpr)?;
                let mut dirty = false;
                let status = match (v.status, mode.reads()) {
                    (RegStatus::KnownImmediate, true) => {
                        self.target.set_native_reg_value(native, v.imm)?;
                        dirty = true;
                        RegStatus::InHostRegisterWithImmediate
                    }
                    (_, true) => {
                        self.target.load_native_reg(native, slot, 1)?;
                        RegStatus::InHostRegister
                    }
                    (_, false) => RegStatus::InHostRegister,
                };
                let temp_locked = self.native[native as usize].temp_locked;
                self.native[native as usize] = NativeState {
                    occupant: Some(slot),
                    lanes: 1,
                    dirty,
                    pointerified: false,
                    normalized32: true,
                    temp_locked,
                };
                let v = &mut self.virt[slot];
                v.status = status;
                v.native = Some(native);
                v.lane = 0;
                native
            }
        };

        if mode.writes() {
            let state = &mut self.native[native as usize];
            state.dirty = true;
            state.pointerified = false;
            state.normalized32 = true;
            let v = &mut self.virt[slot];
            v.status = RegStatus::InHostRegister;
            v.imm = 0;
        }
        Ok(native)
    }

    /// Map an integer slot holding a guest address as a host pointer.
    pub fn map_gpr_as_pointer(&mut self, slot: usize) -> JitResult<NativeReg> {
        if self.virt[slot].status == RegStatus::InHostRegisterAsPointer {
            self.virt[slot].spill_locked = true;
            if let Some(native) = self.virt[slot].native {
                return Ok(native);
            }
        }
        let native = self.map_gpr(slot, MapMode::Read)?;
        self.target.adjust_native_reg_as_ptr(native, true)?;
        let state = &mut self.native[native as usize];
        state.pointerified = true;
        state.normalized32 = false;
        let v = &mut self.virt[slot];
        v.status = RegStatus::InHostRegisterAsPointer;
        v.imm = 0;
        Ok(native)
    }

    /// Map a single float slot to lane 0 of a host register.
    pub fn map_fpr(&mut self, slot: usize, mode: MapMode) -> JitResult<NativeReg> {
        assert!(!is_gpr_slot(slot), "map_fpr on integer slot {}", slot);
        self.virt[slot].spill_locked = true;
        let v = self.virt[slot];

        if let Some(group) = v.native {
            let state = self.native[group as usize];
            if state.lanes <= 1 {
                if mode.writes() {
                    self.native[group as usize].dirty = true;
                }
                return Ok(group);
            }

            let resident = self.valid_lanes(group);
            if resident.len() == 1 {
                // Last lane of the group: turn the register into a scalar.
                if v.lane != 0 && mode.reads() {
                    self.target.extract_lane(group, group, v.lane)?;
                }
                let state = &mut self.native[group as usize];
                state.occupant = Some(slot);
                state.lanes = 1;
                state.dirty |= mode.writes();
                self.virt[slot].lane = 0;
                return Ok(group);
            }

            // Other lanes stay behind; move this one out.
            let was_locked = self.native[group as usize].temp_locked;
            self.native[group as usize].temp_locked = true;
            let scalar = self.alloc(RegBank::Fpr);
            self.native[group as usize].temp_locked = was_locked;
            let scalar = scalar?;

            if mode.reads() {
                self.target.extract_lane(scalar, group, v.lane)?;
            }
            let dirty = mode.writes() || (mode.reads() && state.dirty);
            self.clear_virt(slot);
            self.bind_scalar(slot, scalar, dirty);
            return Ok(scalar);
        }

        let native = self.alloc(RegBank::Fpr)?;
        if mode.reads() {
            self.target.load_native_reg(native, slot, 1)?;
        }
        self.bind_scalar(slot, native, mode.writes());
        Ok(native)
    }

    fn bind_scalar(&mut self, slot: usize, native: NativeReg, dirty: bool) {
        let temp_locked = self.native[native as usize].temp_locked;
        self.native[native as usize] = NativeState {
            occupant: Some(slot),
            lanes: 1,
            dirty,
            pointerified: false,
            normalized32: false,
            temp_locked,
        };
        let v = &mut self.virt[slot];
        v.status = RegStatus::InHostRegister;
        v.native = Some(native);
        v.lane = 0;
        v.imm = 0;
    }

    /// Existing group register for `first` and how many lanes it still holds.
    fn group_register(&self, first: usize) -> Option<(NativeReg, usize)> {
        let native = self.virt[first..first + 4]
            .iter()
            .filter_map(|v| v.native)
            .find(|n| {
                let state = &self.native[*n as usize];
                state.lanes == 4 && state.occupant == Some(first)
            })?;
        Some((native, self.valid_lanes(native).len()))
    }

    /// Map four consecutive float slots as one vector register.
    pub fn map_vec4(&mut self, first: usize, mode: MapMode) -> JitResult<NativeReg> {
        assert!(
            first >= FPR_BASE && first + 4 <= FPR_BASE + FPR_COUNT,
            "map_vec4 outside the float range at slot {}",
            first
        );
        for slot in first..first + 4 {
            self.virt[slot].spill_locked = true;
        }

        let group = self.group_register(first);
        if let Some((native, 4)) = group {
            if mode.writes() {
                self.native[native as usize].dirty = true;
            }
            return Ok(native);
        }

        // Reuse a group register that still holds two or more of the lanes.
        let base = group.filter(|(_, resident)| *resident >= 2).map(|(n, _)| n);

        if !mode.reads() {
            let native = match base {
                Some(native) => native,
                None => self.alloc(RegBank::Fpr)?,
            };
            for slot in first..first + 4 {
                if let Some(old) = self.virt[slot].native {
                    if old == native {
                        continue;
                    }
                    if self.native[old as usize].lanes <= 1 {
                        self.discard_native(old);
                    } else {
                        self.detach(slot);
                    }
                }
            }
            self.bind_group(first, native, true);
            return Ok(native);
        }

        let native = match base {
            Some(native) => native,
            None => self.alloc(RegBank::Fpr)?,
        };

        let mut sources = [LaneSource::Keep; 4];
        let mut dirty = base.map(|n| self.native[n as usize].dirty).unwrap_or(false);
        for (lane, source) in sources.iter_mut().enumerate() {
            let slot = first + lane;
            let v = self.virt[slot];
            *source = match v.native {
                Some(n) if n == native => LaneSource::Keep,
                Some(n) => {
                    dirty |= self.native[n as usize].dirty;
                    let lane = if self.native[n as usize].lanes <= 1 {
                        0
                    } else {
                        v.lane
                    };
                    LaneSource::Native { reg: n, lane }
                }
                None => LaneSource::Guest(slot),
            };
        }

        if base.is_none() && sources.iter().all(|s| matches!(s, LaneSource::Guest(_))) {
            self.target.load_native_reg(native, first, 4)?;
        } else {
            self.target.compose_lanes(native, &sources)?;
        }

        // All lanes move at once, after the code is emitted.
        for slot in first..first + 4 {
            if let Some(old) = self.virt[slot].native {
                if old != native {
                    self.detach(slot);
                }
            }
        }
        self.bind_group(first, native, dirty || mode.writes());
        Ok(native)
    }

    fn bind_group(&mut self, first: usize, native: NativeReg, dirty: bool) {
        let temp_locked = self.native[native as usize].temp_locked;
        self.native[native as usize] = NativeState {
            occupant: Some(first),
            lanes: 4,
            dirty,
            pointerified: false,
            normalized32: false,
            temp_locked,
        };
        for lane in 0..4u8 {
            let v = &mut self.virt[first + lane as usize];
            v.status = RegStatus::InHostRegister;
            v.native = Some(native);
            v.lane = lane;
            v.imm = 0;
        }
    }

    /// Drop `slot` from the cache without writing it back.
    pub fn discard_slot(&mut self, slot: usize) {
        let v = self.virt[slot];
        if v.is_static {
            return;
        }
        match v.native {
            Some(native) if self.native[native as usize].lanes <= 1 => self.discard_native(native),
            Some(_) => self.detach(slot),
            None => self.clear_virt(slot),
        }
    }

    /// Store every dirty value and immediate back to guest storage and free every
    /// non-static register. Static registers stay bound; pointer-adjusted ones are
    /// un-adjusted for the store and re-adjusted when pointerify is on.
    pub fn flush_all(&mut self) -> JitResult<()> {
        for slot in 0..TOTAL_IR_REGS {
            let v = self.virt[slot];
            if !v.is_static && v.status == RegStatus::KnownImmediate {
                self.target.store_reg_value(slot, v.imm)?;
                self.clear_virt(slot);
            }
        }

        for index in 0..self.native.len() {
            let native = index as NativeReg;
            let Some(first) = self.native[index].occupant else {
                continue;
            };
            if self.virt[first].is_static {
                self.flush_static(first, native)?;
            } else {
                self.flush_native(native)?;
            }
        }
        Ok(())
    }

    fn static_binding(&self, slot: usize) -> Option<StaticBinding> {
        self.target
            .static_bindings()
            .iter()
            .copied()
            .find(|b| b.slot == slot)
    }

    fn flush_static(&mut self, slot: usize, native: NativeReg) -> JitResult<()> {
        let state = self.native[native as usize];
        if state.dirty {
            if state.pointerified {
                self.target.adjust_native_reg_as_ptr(native, false)?;
                self.native[native as usize].pointerified = false;
            }
            self.target.store_native_reg(native, slot, 0, 1)?;
            self.native[native as usize].dirty = false;
        }
        self.virt[slot].status = RegStatus::InHostRegister;
        self.virt[slot].imm = 0;
        if !self.native[native as usize].pointerified {
            self.repointerify(slot, native)?;
        } else {
            self.virt[slot].status = RegStatus::InHostRegisterAsPointer;
        }
        Ok(())
    }

    fn repointerify(&mut self, slot: usize, native: NativeReg) -> JitResult<()> {
        let wants = self.config.pointerify
            && self.static_binding(slot).map(|b| b.pointerify).unwrap_or(false);
        if wants {
            self.target.adjust_native_reg_as_ptr(native, true)?;
            let state = &mut self.native[native as usize];
            state.pointerified = true;
            state.normalized32 = false;
            self.virt[slot].status = RegStatus::InHostRegisterAsPointer;
        }
        Ok(())
    }

    /// Get ready for a call into a helper that works on guest storage and may end the
    /// block. Every dirty value and immediate is written back. Registers the call may
    /// clobber and registers holding a slot in `writes` are released, the rest keep a
    /// clean copy. Static registers stay bound.
    pub fn flush_before_call(&mut self, writes: &[usize]) -> JitResult<()> {
        for slot in 0..TOTAL_IR_REGS {
            let v = self.virt[slot];
            if !v.is_static && v.status == RegStatus::KnownImmediate {
                self.target.store_reg_value(slot, v.imm)?;
                self.clear_virt(slot);
            }
        }

        for index in 0..self.native.len() {
            let native = index as NativeReg;
            let Some(first) = self.native[index].occupant else {
                continue;
            };
            if self.virt[first].is_static {
                self.flush_static(first, native)?;
                continue;
            }
            let clobbered = self.target.is_caller_saved(native)
                || (self.native[index].lanes > 1 && !self.target.call_preserves_vector(native))
                || self
                    .valid_lanes(native)
                    .iter()
                    .any(|(slot, _)| writes.contains(slot));
            if clobbered {
                self.flush_native(native)?;
            } else {
                self.write_back_native(native)?;
            }
        }
        Ok(())
    }

    /// Reload the static registers whose slots a helper call wrote.
    pub fn reload_after_call(&mut self, writes: &[usize]) -> JitResult<()> {
        if !self.config.static_alloc {
            return Ok(());
        }
        for binding in self.target.static_bindings() {
            if writes.contains(&binding.slot) {
                self.reload_static(*binding)?;
            }
        }
        Ok(())
    }

    /// Load every statically bound register from guest storage. Used at block entry.
    pub fn reload_statics(&mut self) -> JitResult<()> {
        if !self.config.static_alloc {
            return Ok(());
        }
        for binding in self.target.static_bindings() {
            self.reload_static(*binding)?;
        }
        Ok(())
    }

    fn reload_static(&mut self, binding: StaticBinding) -> JitResult<()> {
        let native = binding.native;
        self.target.load_native_reg(native, binding.slot, 1)?;
        let state = &mut self.native[native as usize];
        state.dirty = false;
        state.pointerified = false;
        state.normalized32 = true;
        let v = &mut self.virt[binding.slot];
        v.status = RegStatus::InHostRegister;
        v.imm = 0;
        self.repointerify(binding.slot, native)
    }

    /// Check that the slot and register tables agree.
    pub fn check_consistency(&self) {
        for (slot, v) in self.virt.iter().enumerate() {
            if let Some(native) = v.native {
                let state = &self.native[native as usize];
                let first = state
                    .occupant
                    .unwrap_or_else(|| panic!("slot {} points at free register {}", slot, native));
                assert_eq!(
                    first + v.lane as usize,
                    slot,
                    "slot {} has lane {} in a register starting at {}",
                    slot,
                    v.lane,
                    first
                );
                assert!(v.status != RegStatus::KnownImmediate && v.status != RegStatus::InGuestStorage);
            }
        }
        for index in 0..self.native.len() {
            let native = index as NativeReg;
            if let Some(first) = self.native[index].occupant {
                assert!(
                    !self.valid_lanes(native).is_empty(),
                    "register {} occupied by slot {} but holds no lane",
                    self.target.reg_name(native),
                    first
                );
            }
        }
    }
}
