// This module encodes AArch64 instructions as fixed-width 32-bit words. Arm64Encoder appends
// words to a growable buffer and exposes one method per instruction form the backend needs:
// wide moves, add/sub with immediates and shifted or extended registers, logical operations
// with shifted registers or bitmask immediates, bitfield moves, shifts, multiplies and
// divides, conditional selects, loads and stores with scaled immediate or zero-extended
// register offsets, scalar single-precision arithmetic and conversions, and the handful of
// 128-bit vector forms used for four-lane groups.
//
// Logical immediates are the one encoding that needs real work. logical_imm finds the unique
// candidate encoding for a value by locating the lowest run of set bits (a), the bit just
// above it (b) and the start of the next run (c); their distances give the element size and
// run length, and the candidate is accepted only if replicating that run reproduces the
// input. Values with the low bit set are inverted first so a run never wraps around, and
// 32-bit values are duplicated into 64 bits. decode_logical_imm expands an encoding back.
//
// Branches whose target is not known yet are emitted with a zero displacement and return a
// FixupBranch naming the branch kind and the word it lives in. set_jump_target checks that the
// distance fits the kind's displacement field and patches only those bits. A FixupBranch is
// consumed by that call, so it is resolved at most once; finish() asserts that none are left
// outstanding, and dropping an encoder with outstanding fixups asserts in debug builds.

//! AArch64 instruction encoder.

use log::trace;

/// General purpose register number; 31 is SP or ZR depending on the form.
pub type GReg = u8;
/// SIMD/FP register number.
pub type VReg = u8;

pub const SP: GReg = 31;
pub const ZR: GReg = 31;
pub const FP: GReg = 29;
pub const LR: GReg = 30;

/// Condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl Cond {
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Hs => Cond::Lo,
            Cond::Lo => Cond::Hs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => Cond::Al,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Lsl = 0,
    Lsr = 1,
    Asr = 2,
    Ror = 3,
}

/// Logical operations with register or bitmask-immediate operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Orr,
    Eor,
    Ands,
}

impl LogicOp {
    fn opc(self) -> u32 {
        match self {
            LogicOp::And => 0,
            LogicOp::Orr => 1,
            LogicOp::Eor => 2,
            LogicOp::Ands => 3,
        }
    }
}

/// Load/store forms: (unsigned-offset opcode, register-offset opcode, access size).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Strb,
    Ldrb,
    Ldrsb,
    Strh,
    Ldrh,
    Ldrsh,
    StrW,
    LdrW,
    StrX,
    LdrX,
    StrS,
    LdrS,
    StrQ,
    LdrQ,
}

impl MemOp {
    fn encoding(self) -> (u32, u32, u32) {
        match self {
            MemOp::Strb => (0x3900_0000, 0x3820_0800, 1),
            MemOp::Ldrb => (0x3940_0000, 0x3860_0800, 1),
            MemOp::Ldrsb => (0x39C0_0000, 0x38E0_0800, 1),
            MemOp::Strh => (0x7900_0000, 0x7820_0800, 2),
            MemOp::Ldrh => (0x7940_0000, 0x7860_0800, 2),
            MemOp::Ldrsh => (0x79C0_0000, 0x78E0_0800, 2),
            MemOp::StrW => (0xB900_0000, 0xB820_0800, 4),
            MemOp::LdrW => (0xB940_0000, 0xB860_0800, 4),
            MemOp::StrX => (0xF900_0000, 0xF820_0800, 8),
            MemOp::LdrX => (0xF940_0000, 0xF860_0800, 8),
            MemOp::StrS => (0xBD00_0000, 0xBC20_0800, 4),
            MemOp::LdrS => (0xBD40_0000, 0xBC60_0800, 4),
            MemOp::StrQ => (0x3D80_0000, 0x3CA0_0800, 16),
            MemOp::LdrQ => (0x3DC0_0000, 0x3CE0_0800, 16),
        }
    }

    pub fn size(self) -> u32 {
        self.encoding().2
    }
}

/// Scalar single-precision two-operand ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOp {
    Mul = 0,
    Div = 1,
    Add = 2,
    Sub = 3,
    Max = 4,
    Min = 5,
}

/// Scalar single-precision one-operand ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpUnary {
    Mov,
    Abs,
    Neg,
    Sqrt,
}

/// Vector four-lane single-precision ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Branch kinds with a patchable displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    Cbz,
    Cbnz,
    BCond,
    Tbz,
    Tbnz,
    B,
    Bl,
}

impl FixupKind {
    /// Displacement field: (bit position, width in bits).
    fn field(self) -> (u32, u32) {
        match self {
            FixupKind::Cbz | FixupKind::Cbnz | FixupKind::BCond => (5, 19),
            FixupKind::Tbz | FixupKind::Tbnz => (5, 14),
            FixupKind::B | FixupKind::Bl => (0, 26),
        }
    }
}

/// A branch whose displacement is patched later.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a fixup must be resolved with set_jump_target"]
pub struct FixupBranch {
    pub kind: FixupKind,
    /// Word index of the branch.
    pub site: usize,
}

/// Bitmask immediate fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalImm {
    pub n: u8,
    pub imm_s: u8,
    pub imm_r: u8,
}

const MULTIPLIERS: [u64; 6] = [
    0x0000_0000_0000_0001,
    0x0000_0001_0000_0001,
    0x0001_0001_0001_0001,
    0x0101_0101_0101_0101,
    0x1111_1111_1111_1111,
    0x5555_5555_5555_5555,
];

fn lowest_set_bit(value: u64) -> u64 {
    value & value.wrapping_neg()
}

/// Find the bitmask-immediate encoding of `value` for a `width`-bit (32 or 64) operation.
pub fn logical_imm(value: u64, width: u32) -> Option<LogicalImm> {
    assert!(width == 32 || width == 64, "bad logical immediate width {}", width);
    let mut value = if width == 32 { value & 0xffff_ffff } else { value };

    let negate = value & 1 != 0;
    if negate {
        value = !value;
    }
    if width == 32 {
        value <<= 32;
        value |= value >> 32;
    }

    let a = lowest_set_bit(value);
    let value_plus_a = value.wrapping_add(a);
    let b = lowest_set_bit(value_plus_a);
    let value_plus_a_minus_b = value_plus_a.wrapping_sub(b);
    let c = lowest_set_bit(value_plus_a_minus_b);

    let clz_a = a.leading_zeros() as i32;
    let (d, mask, out_n) = if c != 0 {
        let d = clz_a - c.leading_zeros() as i32;
        (d, (1u64 << d) - 1, 0u8)
    } else if a == 0 {
        // Zero, or all ones before the inversion.
        return None;
    } else {
        (64, u64::MAX, 1u8)
    };

    if !(d as u32).is_power_of_two() {
        return None;
    }
    if b.wrapping_sub(a) & !mask != 0 {
        return None;
    }

    let multiplier = MULTIPLIERS[((d as u64).leading_zeros() - 57) as usize];
    let candidate = b.wrapping_sub(a).wrapping_mul(multiplier);
    if value != candidate {
        return None;
    }

    let clz_b = if b == 0 { -1 } else { b.leading_zeros() as i32 };
    let mut s = clz_a - clz_b;
    let r = if negate {
        s = d - s;
        (clz_b + 1) & (d - 1)
    } else {
        (clz_a + 1) & (d - 1)
    };

    Some(LogicalImm {
        n: out_n,
        imm_s: (((-d) << 1) | (s - 1)) as u8 & 0x3f,
        imm_r: r as u8,
    })
}

/// Expand a bitmask immediate back into its value.
pub fn decode_logical_imm(imm: LogicalImm, width: u32) -> Option<u64> {
    if width == 32 && imm.n != 0 {
        return None;
    }
    let combined = ((imm.n as u32) << 6) | (!(imm.imm_s as u32) & 0x3f);
    if combined == 0 {
        return None;
    }
    let len = 31 - combined.leading_zeros();
    if len == 0 {
        return None;
    }
    let size = 1u32 << len;
    let levels = size - 1;
    let s = imm.imm_s as u32 & levels;
    let r = imm.imm_r as u32 & levels;
    if s == levels {
        return None;
    }

    let element_mask = if size == 64 { u64::MAX } else { (1u64 << size) - 1 };
    let ones = (1u64 << (s + 1)) - 1;
    let element = if r == 0 {
        ones
    } else {
        ((ones >> r) | (ones << (size - r))) & element_mask
    };

    let mut value = 0u64;
    let mut shift = 0;
    while shift < width {
        value |= element << shift;
        shift += size;
    }
    Some(if width == 32 { value & 0xffff_ffff } else { value })
}

/// Whether `imm` fits an add/sub immediate: 12 bits, optionally shifted left by 12.
pub fn arith_imm(imm: u64) -> Option<(u32, bool)> {
    if imm < 4096 {
        Some((imm as u32, false))
    } else if imm & 0xff_f000 == imm {
        Some(((imm >> 12) as u32, true))
    } else {
        None
    }
}

/// AArch64 machine code buffer.
pub struct Arm64Encoder {
    code: Vec<u32>,
    pending: usize,
}

impl Default for Arm64Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Arm64Encoder {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            pending: 0,
        }
    }

    /// Word index of the next instruction.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn words(&self) -> &[u32] {
        &self.code
    }

    /// Fixups not yet resolved.
    pub fn pending_fixups(&self) -> usize {
        self.pending
    }

    pub fn emit(&mut self, word: u32) {
        self.code.push(word);
    }

    /// Code bytes. Panics if any branch fixup is still outstanding.
    pub fn finish(mut self) -> Vec<u8> {
        assert_eq!(
            self.pending, 0,
            "{} branch fixups outstanding at end of code",
            self.pending
        );
        let code = std::mem::take(&mut self.code);
        trace!("arm64: finished {} words", code.len());
        code.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    // ==== BRANCHES ====

    fn fixup(&mut self, kind: FixupKind, word: u32) -> FixupBranch {
        let site = self.code.len();
        self.emit(word);
        self.pending += 1;
        FixupBranch { kind, site }
    }

    pub fn cbz(&mut self, sf: bool, rt: GReg) -> FixupBranch {
        self.fixup(FixupKind::Cbz, 0x3400_0000 | (sf as u32) << 31 | rt as u32)
    }

    pub fn cbnz(&mut self, sf: bool, rt: GReg) -> FixupBranch {
        self.fixup(FixupKind::Cbnz, 0x3500_0000 | (sf as u32) << 31 | rt as u32)
    }

    pub fn b_cond(&mut self, cond: Cond) -> FixupBranch {
        self.fixup(FixupKind::BCond, 0x5400_0000 | cond as u32)
    }

    pub fn tbz(&mut self, rt: GReg, bit: u8) -> FixupBranch {
        self.fixup(FixupKind::Tbz, 0x3600_0000 | tb_bits(rt, bit))
    }

    pub fn tbnz(&mut self, rt: GReg, bit: u8) -> FixupBranch {
        self.fixup(FixupKind::Tbnz, 0x3700_0000 | tb_bits(rt, bit))
    }

    pub fn b(&mut self) -> FixupBranch {
        self.fixup(FixupKind::B, 0x1400_0000)
    }

    pub fn bl(&mut self) -> FixupBranch {
        self.fixup(FixupKind::Bl, 0x9400_0000)
    }

    /// Point `branch` at the current position.
    pub fn set_jump_target(&mut self, branch: FixupBranch) {
        let target = self.position();
        self.set_jump_target_to(branch, target);
    }

    /// Point `branch` at word `target`.
    pub fn set_jump_target_to(&mut self, branch: FixupBranch, target: usize) {
        let distance = target as i64 - branch.site as i64;
        let (pos, bits) = branch.kind.field();
        let limit = 1i64 << (bits - 1);
        assert!(
            (-limit..limit).contains(&distance),
            "{:?} at word {}: displacement {} words out of range",
            branch.kind,
            branch.site,
            distance
        );
        let field_mask = ((1u32 << bits) - 1) << pos;
        let word = &mut self.code[branch.site];
        *word = (*word & !field_mask) | (((distance as u32) << pos) & field_mask);
        self.pending -= 1;
    }

    /// Unconditional branch to an already placed word.
    pub fn b_to(&mut self, target: usize) {
        let branch = self.b();
        self.set_jump_target_to(branch, target);
    }

    pub fn br(&mut self, rn: GReg) {
        self.emit(0xD61F_0000 | (rn as u32) << 5);
    }

    pub fn blr(&mut self, rn: GReg) {
        self.emit(0xD63F_0000 | (rn as u32) << 5);
    }

    pub fn ret(&mut self) {
        self.emit(0xD65F_03C0);
    }

    pub fn nop(&mut self) {
        self.emit(0xD503_201F);
    }

    // ==== MOVES AND IMMEDIATES ====

    pub fn movz(&mut self, sf: bool, rd: GReg, imm16: u16, hw: u8) {
        self.emit(0x5280_0000 | sf_bit(sf) | (hw as u32) << 21 | (imm16 as u32) << 5 | rd as u32);
    }

    pub fn movn(&mut self, sf: bool, rd: GReg, imm16: u16, hw: u8) {
        self.emit(0x1280_0000 | sf_bit(sf) | (hw as u32) << 21 | (imm16 as u32) << 5 | rd as u32);
    }

    pub fn movk(&mut self, sf: bool, rd: GReg, imm16: u16, hw: u8) {
        self.emit(0x7280_0000 | sf_bit(sf) | (hw as u32) << 21 | (imm16 as u32) << 5 | rd as u32);
    }

    /// Register move (ORR with the zero register).
    pub fn mov(&mut self, sf: bool, rd: GReg, rm: GReg) {
        self.logic_reg(LogicOp::Orr, sf, rd, ZR, rm, Shift::Lsl, 0, false);
    }

    /// Materialize a 32-bit constant in `rd` with the fewest instructions.
    pub fn movi2r(&mut self, rd: GReg, imm: u32) {
        let lo = (imm & 0xffff) as u16;
        let hi = (imm >> 16) as u16;
        if imm == 0 {
            self.movz(false, rd, 0, 0);
        } else if hi == 0 {
            self.movz(false, rd, lo, 0);
        } else if lo == 0 {
            self.movz(false, rd, hi, 1);
        } else if hi == 0xffff {
            self.movn(false, rd, !lo, 0);
        } else if lo == 0xffff {
            self.movn(false, rd, !hi, 1);
        } else if let Some(li) = logical_imm(imm as u64, 32) {
            self.logic_imm(LogicOp::Orr, false, rd, ZR, li);
        } else {
            self.movz(false, rd, lo, 0);
            self.movk(false, rd, hi, 1);
        }
    }

    /// Materialize a 64-bit constant (pointers).
    pub fn movi2r64(&mut self, rd: GReg, imm: u64) {
        if imm >> 32 == 0 {
            // 32-bit writes zero the upper half.
            self.movi2r(rd, imm as u32);
            return;
        }
        let mut first = true;
        for hw in 0..4u8 {
            let part = (imm >> (hw as u32 * 16)) as u16;
            if part == 0 {
                continue;
            }
            if first {
                self.movz(true, rd, part, hw);
                first = false;
            } else {
                self.movk(true, rd, part, hw);
            }
        }
    }

    // ==== ARITHMETIC ====

    fn add_sub_imm(&mut self, base: u32, sf: bool, rd: GReg, rn: GReg, imm12: u32, shift: bool) {
        assert!(imm12 < 4096, "add/sub immediate {:#x} out of range", imm12);
        self.emit(base | sf_bit(sf) | (shift as u32) << 22 | imm12 << 10 | (rn as u32) << 5 | rd as u32);
    }

    pub fn add_imm(&mut self, sf: bool, rd: GReg, rn: GReg, imm12: u32, shift: bool) {
        self.add_sub_imm(0x1100_0000, sf, rd, rn, imm12, shift);
    }

    pub fn adds_imm(&mut self, sf: bool, rd: GReg, rn: GReg, imm12: u32, shift: bool) {
        self.add_sub_imm(0x3100_0000, sf, rd, rn, imm12, shift);
    }

    pub fn sub_imm(&mut self, sf: bool, rd: GReg, rn: GReg, imm12: u32, shift: bool) {
        self.add_sub_imm(0x5100_0000, sf, rd, rn, imm12, shift);
    }

    pub fn subs_imm(&mut self, sf: bool, rd: GReg, rn: GReg, imm12: u32, shift: bool) {
        self.add_sub_imm(0x7100_0000, sf, rd, rn, imm12, shift);
    }

    fn add_sub_reg(&mut self, base: u32, sf: bool, rd: GReg, rn: GReg, rm: GReg, shift: Shift, amount: u8) {
        assert!(shift != Shift::Ror, "ROR is not an add/sub shift");
        self.emit(
            base | sf_bit(sf)
                | (shift as u32) << 22
                | (rm as u32) << 16
                | (amount as u32 & 0x3f) << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    pub fn add(&mut self, sf: bool, rd: GReg, rn: GReg, rm: GReg) {
        self.add_sub_reg(0x0B00_0000, sf, rd, rn, rm, Shift::Lsl, 0);
    }

    pub fn sub(&mut self, sf: bool, rd: GReg, rn: GReg, rm: GReg) {
        self.add_sub_reg(0x4B00_0000, sf, rd, rn, rm, Shift::Lsl, 0);
    }

    pub fn subs(&mut self, sf: bool, rd: GReg, rn: GReg, rm: GReg) {
        self.add_sub_reg(0x6B00_0000, sf, rd, rn, rm, Shift::Lsl, 0);
    }

    pub fn cmp(&mut self, sf: bool, rn: GReg, rm: GReg) {
        self.subs(sf, ZR, rn, rm);
    }

    pub fn neg(&mut self, sf: bool, rd: GReg, rm: GReg) {
        self.sub(sf, rd, ZR, rm);
    }

    /// `ADD Xd, Xn, Wm, UXTW`: add a zero-extended 32-bit register to a 64-bit base.
    pub fn add_uxtw(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.emit(0x8B20_4000 | (rm as u32) << 16 | (rn as u32) << 5 | rd as u32);
    }

    /// Add an arbitrary 32-bit constant if it fits an immediate form.
    pub fn try_add_imm(&mut self, rd: GReg, rn: GReg, imm: u32) -> bool {
        if imm == 0 {
            if rd != rn {
                self.mov(false, rd, rn);
            }
            return true;
        }
        if let Some((imm12, shift)) = arith_imm(imm as u64) {
            self.add_imm(false, rd, rn, imm12, shift);
            true
        } else if let Some((imm12, shift)) = arith_imm(imm.wrapping_neg() as u64) {
            self.sub_imm(false, rd, rn, imm12, shift);
            true
        } else {
            false
        }
    }

    /// Add a 32-bit constant, going through `scratch` when no immediate form fits.
    pub fn add_i2r(&mut self, rd: GReg, rn: GReg, imm: u32, scratch: GReg) {
        if !self.try_add_imm(rd, rn, imm) {
            self.movi2r(scratch, imm);
            self.add(false, rd, rn, scratch);
        }
    }

    /// Compare a register against a 32-bit constant.
    pub fn cmp_i2r(&mut self, rn: GReg, imm: u32, scratch: GReg) {
        if let Some((imm12, shift)) = arith_imm(imm as u64) {
            self.subs_imm(false, ZR, rn, imm12, shift);
        } else if let Some((imm12, shift)) = arith_imm(imm.wrapping_neg() as u64) {
            self.adds_imm(false, ZR, rn, imm12, shift);
        } else {
            self.movi2r(scratch, imm);
            self.cmp(false, rn, scratch);
        }
    }

    // ==== LOGICAL ====

    #[allow(clippy::too_many_arguments)]
    pub fn logic_reg(
        &mut self,
        op: LogicOp,
        sf: bool,
        rd: GReg,
        rn: GReg,
        rm: GReg,
        shift: Shift,
        amount: u8,
        invert: bool,
    ) {
        self.emit(
            0x0A00_0000
                | sf_bit(sf)
                | op.opc() << 29
                | (shift as u32) << 22
                | (invert as u32) << 21
                | (rm as u32) << 16
                | (amount as u32 & 0x3f) << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    pub fn logic(&mut self, op: LogicOp, rd: GReg, rn: GReg, rm: GReg) {
        self.logic_reg(op, false, rd, rn, rm, Shift::Lsl, 0, false);
    }

    /// `MVN Wd, Wm`.
    pub fn mvn(&mut self, rd: GReg, rm: GReg) {
        self.logic_reg(LogicOp::Orr, false, rd, ZR, rm, Shift::Lsl, 0, true);
    }

    pub fn logic_imm(&mut self, op: LogicOp, sf: bool, rd: GReg, rn: GReg, imm: LogicalImm) {
        assert!(sf || imm.n == 0, "N=1 bitmask immediate on a 32-bit op");
        self.emit(
            0x1200_0000
                | sf_bit(sf)
                | op.opc() << 29
                | (imm.n as u32) << 22
                | (imm.imm_r as u32) << 16
                | (imm.imm_s as u32) << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    /// Logical op with a constant if it is a valid bitmask immediate.
    pub fn try_logic_imm(&mut self, op: LogicOp, rd: GReg, rn: GReg, imm: u32) -> bool {
        match logical_imm(imm as u64, 32) {
            Some(li) => {
                self.logic_imm(op, false, rd, rn, li);
                true
            }
            None => false,
        }
    }

    /// Logical op with a constant, going through `scratch` when needed.
    pub fn logic_i2r(&mut self, op: LogicOp, rd: GReg, rn: GReg, imm: u32, scratch: GReg) {
        if !self.try_logic_imm(op, rd, rn, imm) {
            self.movi2r(scratch, imm);
            self.logic(op, rd, rn, scratch);
        }
    }

    // ==== BITFIELD AND SHIFTS ====

    fn bitfield(&mut self, base: u32, sf: bool, rd: GReg, rn: GReg, immr: u32, imms: u32) {
        self.emit(
            base | sf_bit(sf) | (sf as u32) << 22 | immr << 16 | imms << 10 | (rn as u32) << 5 | rd as u32,
        );
    }

    pub fn sbfm(&mut self, rd: GReg, rn: GReg, immr: u32, imms: u32) {
        self.bitfield(0x1300_0000, false, rd, rn, immr, imms);
    }

    pub fn ubfm(&mut self, rd: GReg, rn: GReg, immr: u32, imms: u32) {
        self.bitfield(0x5300_0000, false, rd, rn, immr, imms);
    }

    pub fn lsl_imm(&mut self, rd: GReg, rn: GReg, amount: u32) {
        let amount = amount & 31;
        self.ubfm(rd, rn, (32 - amount) & 31, 31 - amount);
    }

    pub fn lsr_imm(&mut self, rd: GReg, rn: GReg, amount: u32) {
        self.ubfm(rd, rn, amount & 31, 31);
    }

    pub fn asr_imm(&mut self, rd: GReg, rn: GReg, amount: u32) {
        self.sbfm(rd, rn, amount & 31, 31);
    }

    pub fn ror_imm(&mut self, rd: GReg, rn: GReg, amount: u32) {
        // EXTR Wd, Wn, Wn, #amount
        self.emit(0x1380_0000 | (rn as u32) << 16 | (amount & 31) << 10 | (rn as u32) << 5 | rd as u32);
    }

    /// `LSR Xd, Xn, #amount` on 64-bit registers.
    pub fn lsr_imm64(&mut self, rd: GReg, rn: GReg, amount: u32) {
        self.bitfield(0x5300_0000, true, rd, rn, amount & 63, 63);
    }

    pub fn sxtb(&mut self, rd: GReg, rn: GReg) {
        self.sbfm(rd, rn, 0, 7);
    }

    pub fn sxth(&mut self, rd: GReg, rn: GReg) {
        self.sbfm(rd, rn, 0, 15);
    }

    /// `SXTW Xd, Wn`.
    pub fn sxtw(&mut self, rd: GReg, rn: GReg) {
        self.bitfield(0x1300_0000, true, rd, rn, 0, 31);
    }

    fn dp2(&mut self, opcode: u32, sf: bool, rd: GReg, rn: GReg, rm: GReg) {
        self.emit(0x1AC0_0000 | sf_bit(sf) | (rm as u32) << 16 | opcode << 10 | (rn as u32) << 5 | rd as u32);
    }

    pub fn udiv(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.dp2(0b000010, false, rd, rn, rm);
    }

    pub fn sdiv(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.dp2(0b000011, false, rd, rn, rm);
    }

    pub fn lslv(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.dp2(0b001000, false, rd, rn, rm);
    }

    pub fn lsrv(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.dp2(0b001001, false, rd, rn, rm);
    }

    pub fn asrv(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.dp2(0b001010, false, rd, rn, rm);
    }

    pub fn rorv(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.dp2(0b001011, false, rd, rn, rm);
    }

    fn dp1(&mut self, opcode: u32, rd: GReg, rn: GReg) {
        self.emit(0x5AC0_0000 | opcode << 10 | (rn as u32) << 5 | rd as u32);
    }

    pub fn rbit(&mut self, rd: GReg, rn: GReg) {
        self.dp1(0b000000, rd, rn);
    }

    pub fn rev16(&mut self, rd: GReg, rn: GReg) {
        self.dp1(0b000001, rd, rn);
    }

    pub fn rev(&mut self, rd: GReg, rn: GReg) {
        self.dp1(0b000010, rd, rn);
    }

    pub fn clz(&mut self, rd: GReg, rn: GReg) {
        self.dp1(0b000100, rd, rn);
    }

    // ==== MULTIPLY ====

    pub fn madd(&mut self, rd: GReg, rn: GReg, rm: GReg, ra: GReg) {
        self.emit(0x1B00_0000 | (rm as u32) << 16 | (ra as u32) << 10 | (rn as u32) << 5 | rd as u32);
    }

    pub fn mul(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.madd(rd, rn, rm, ZR);
    }

    /// `SMULL Xd, Wn, Wm`.
    pub fn smull(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.emit(0x9B20_0000 | (rm as u32) << 16 | (ZR as u32) << 10 | (rn as u32) << 5 | rd as u32);
    }

    /// `UMULL Xd, Wn, Wm`.
    pub fn umull(&mut self, rd: GReg, rn: GReg, rm: GReg) {
        self.emit(0x9BA0_0000 | (rm as u32) << 16 | (ZR as u32) << 10 | (rn as u32) << 5 | rd as u32);
    }

    // ==== CONDITIONAL SELECT ====

    pub fn csel(&mut self, rd: GReg, rn: GReg, rm: GReg, cond: Cond) {
        self.emit(0x1A80_0000 | (rm as u32) << 16 | (cond as u32) << 12 | (rn as u32) << 5 | rd as u32);
    }

    pub fn csinc(&mut self, rd: GReg, rn: GReg, rm: GReg, cond: Cond) {
        self.emit(0x1A80_0400 | (rm as u32) << 16 | (cond as u32) << 12 | (rn as u32) << 5 | rd as u32);
    }

    /// `CSET Wd, cond`.
    pub fn cset(&mut self, rd: GReg, cond: Cond) {
        self.csinc(rd, ZR, ZR, cond.invert());
    }

    // ==== LOADS AND STORES ====

    /// Access at a scaled unsigned immediate offset. Returns false if `offset` does not fit.
    pub fn try_mem_imm(&mut self, op: MemOp, rt: u8, rn: GReg, offset: u32) -> bool {
        let (base, _, size) = op.encoding();
        if offset % size != 0 || offset / size >= 4096 {
            return false;
        }
        self.emit(base | (offset / size) << 10 | (rn as u32) << 5 | rt as u32);
        true
    }

    /// Access at a fixed offset from a 64-bit base, falling back to a scratch register.
    pub fn mem_imm(&mut self, op: MemOp, rt: u8, rn: GReg, offset: u32, scratch: GReg) {
        if !self.try_mem_imm(op, rt, rn, offset) {
            self.movi2r(scratch, offset);
            self.add_uxtw(scratch, rn, scratch);
            self.emit(op.encoding().0 | (scratch as u32) << 5 | rt as u32);
        }
    }

    /// Access at `[Xn, Wm, UXTW]`.
    pub fn mem_uxtw(&mut self, op: MemOp, rt: u8, rn: GReg, rm: GReg) {
        let (_, base, _) = op.encoding();
        self.emit(base | (rm as u32) << 16 | 0b010 << 13 | (rn as u32) << 5 | rt as u32);
    }

    /// `STP Xt, Xt2, [SP, #-bytes]!`.
    pub fn stp_pre(&mut self, rt: GReg, rt2: GReg, bytes: i32) {
        self.emit(0xA980_0000 | pair_imm(-bytes) | (rt2 as u32) << 10 | (SP as u32) << 5 | rt as u32);
    }

    /// `LDP Xt, Xt2, [SP], #bytes`.
    pub fn ldp_post(&mut self, rt: GReg, rt2: GReg, bytes: i32) {
        self.emit(0xA8C0_0000 | pair_imm(bytes) | (rt2 as u32) << 10 | (SP as u32) << 5 | rt as u32);
    }

    /// `STP Xt, Xt2, [SP, #offset]`.
    pub fn stp(&mut self, rt: GReg, rt2: GReg, offset: i32) {
        self.emit(0xA900_0000 | pair_imm(offset) | (rt2 as u32) << 10 | (SP as u32) << 5 | rt as u32);
    }

    pub fn ldp(&mut self, rt: GReg, rt2: GReg, offset: i32) {
        self.emit(0xA940_0000 | pair_imm(offset) | (rt2 as u32) << 10 | (SP as u32) << 5 | rt as u32);
    }

    /// `STP Dt, Dt2, [SP, #offset]`.
    pub fn stp_d(&mut self, rt: VReg, rt2: VReg, offset: i32) {
        self.emit(0x6D00_0000 | pair_imm(offset) | (rt2 as u32) << 10 | (SP as u32) << 5 | rt as u32);
    }

    pub fn ldp_d(&mut self, rt: VReg, rt2: VReg, offset: i32) {
        self.emit(0x6D40_0000 | pair_imm(offset) | (rt2 as u32) << 10 | (SP as u32) << 5 | rt as u32);
    }

    // ==== SCALAR FLOAT ====

    pub fn fp_op(&mut self, op: FpOp, rd: VReg, rn: VReg, rm: VReg) {
        self.emit(0x1E20_0800 | (rm as u32) << 16 | (op as u32) << 12 | (rn as u32) << 5 | rd as u32);
    }

    pub fn fp_unary(&mut self, op: FpUnary, rd: VReg, rn: VReg) {
        let opcode = match op {
            FpUnary::Mov => 0x1E20_4000,
            FpUnary::Abs => 0x1E20_C000,
            FpUnary::Neg => 0x1E21_4000,
            FpUnary::Sqrt => 0x1E21_C000,
        };
        self.emit(opcode | (rn as u32) << 5 | rd as u32);
    }

    pub fn fcmp(&mut self, rn: VReg, rm: VReg) {
        self.emit(0x1E20_2000 | (rm as u32) << 16 | (rn as u32) << 5);
    }

    /// `FMOV Sd, Wn`.
    pub fn fmov_from_gpr(&mut self, rd: VReg, rn: GReg) {
        self.emit(0x1E27_0000 | (rn as u32) << 5 | rd as u32);
    }

    /// `FMOV Wd, Sn`.
    pub fn fmov_to_gpr(&mut self, rd: GReg, rn: VReg) {
        self.emit(0x1E26_0000 | (rn as u32) << 5 | rd as u32);
    }

    /// `SCVTF Sd, Wn`.
    pub fn scvtf(&mut self, rd: VReg, rn: GReg) {
        self.emit(0x1E22_0000 | (rn as u32) << 5 | rd as u32);
    }

    /// `SCVTF Sd, Sn`: convert the integer bits held in a float register.
    pub fn scvtf_vec(&mut self, rd: VReg, rn: VReg) {
        self.emit(0x5E21_D800 | (rn as u32) << 5 | rd as u32);
    }

    // ==== VECTOR ====

    pub fn vec_op(&mut self, op: VecOp, rd: VReg, rn: VReg, rm: VReg) {
        let base = match op {
            VecOp::Add => 0x4E20_D400,
            VecOp::Sub => 0x4EA0_D400,
            VecOp::Mul => 0x6E20_DC00,
            VecOp::Div => 0x6E20_FC00,
        };
        self.emit(base | (rm as u32) << 16 | (rn as u32) << 5 | rd as u32);
    }

    pub fn vec_fneg(&mut self, rd: VReg, rn: VReg) {
        self.emit(0x6EA0_F800 | (rn as u32) << 5 | rd as u32);
    }

    pub fn vec_fabs(&mut self, rd: VReg, rn: VReg) {
        self.emit(0x4EA0_F800 | (rn as u32) << 5 | rd as u32);
    }

    /// `FMUL Vd.4S, Vn.4S, Vm.S[lane]`.
    pub fn vec_fmul_elem(&mut self, rd: VReg, rn: VReg, rm: VReg, lane: u8) {
        let h = (lane as u32 >> 1) & 1;
        let l = lane as u32 & 1;
        self.emit(
            0x4F80_9000
                | l << 21
                | ((rm as u32 >> 4) & 1) << 20
                | (rm as u32 & 0xf) << 16
                | h << 11
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    /// `MOV Vd.16B, Vn.16B`.
    pub fn vec_mov(&mut self, rd: VReg, rn: VReg) {
        self.emit(0x4EA0_1C00 | (rn as u32) << 16 | (rn as u32) << 5 | rd as u32);
    }

    /// `MOVI Vd.2D, #0`.
    pub fn vec_zero(&mut self, rd: VReg) {
        self.emit(0x6F00_E400 | rd as u32);
    }

    /// `FMOV Vd.4S, #imm8` with the 8-bit float immediate encoding.
    pub fn vec_fmov_imm(&mut self, rd: VReg, imm8: u8) {
        let abc = (imm8 as u32 >> 5) & 7;
        let defgh = imm8 as u32 & 0x1f;
        self.emit(0x4F00_F400 | abc << 16 | defgh << 5 | rd as u32);
    }

    /// `FMOV Sd, #imm8`.
    pub fn fmov_imm(&mut self, rd: VReg, imm8: u8) {
        self.emit(0x1E20_1000 | (imm8 as u32) << 13 | rd as u32);
    }

    /// `DUP Sd, Vn.S[lane]`: copy one lane into a scalar.
    pub fn dup_lane(&mut self, rd: VReg, rn: VReg, lane: u8) {
        let imm5 = (lane as u32) << 3 | 0b100;
        self.emit(0x5E00_0400 | imm5 << 16 | (rn as u32) << 5 | rd as u32);
    }

    /// `INS Vd.S[dst], Vn.S[src]`.
    pub fn ins_lane(&mut self, rd: VReg, dst: u8, rn: VReg, src: u8) {
        let imm5 = (dst as u32) << 3 | 0b100;
        let imm4 = (src as u32) << 2;
        self.emit(0x6E00_0400 | imm5 << 16 | imm4 << 11 | (rn as u32) << 5 | rd as u32);
    }

    /// `INS Vd.S[dst], Wn`.
    pub fn ins_gpr(&mut self, rd: VReg, dst: u8, rn: GReg) {
        let imm5 = (dst as u32) << 3 | 0b100;
        self.emit(0x4E00_1C00 | imm5 << 16 | (rn as u32) << 5 | rd as u32);
    }
}

impl Drop for Arm64Encoder {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(
                self.pending, 0,
                "encoder dropped with {} unresolved branch fixups",
                self.pending
            );
        }
    }
}

fn sf_bit(sf: bool) -> u32 {
    (sf as u32) << 31
}

fn tb_bits(rt: GReg, bit: u8) -> u32 {
    assert!(bit < 64, "test bit {} out of range", bit);
    ((bit as u32 >> 5) & 1) << 31 | (bit as u32 & 0x1f) << 19 | rt as u32
}

fn pair_imm(bytes: i32) -> u32 {
    assert!(bytes % 8 == 0 && (-512..512).contains(&bytes), "pair offset {} out of range", bytes);
    ((bytes / 8) as u32 & 0x7f) << 15
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(f: impl FnOnce(&mut Arm64Encoder)) -> Vec<u32> {
        let mut enc = Arm64Encoder::new();
        f(&mut enc);
        let words = enc.words().to_vec();
        let _ = enc.finish();
        words
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(words(|e| e.movz(false, 0, 0x1234, 0)), [0x5282_4680]);
        assert_eq!(words(|e| e.add_imm(false, 1, 2, 1, false)), [0x1100_0441]);
        assert_eq!(words(|e| e.ret()), [0xD65F_03C0]);
        assert_eq!(words(|e| e.movi2r(0, 0xff)), [0x5280_1FE0]);
        assert_eq!(
            words(|e| e.logic_imm(LogicOp::Orr, false, 0, ZR, logical_imm(0xff, 32).unwrap())),
            [0x3200_1FE0]
        );
        // orr w0, wzr, #0x00ff00ff
        assert_eq!(words(|e| e.movi2r(0, 0x00ff_00ff)), [0x3200_9FE0]);
        assert_eq!(words(|e| { e.try_mem_imm(MemOp::LdrW, 0, 1, 4); }), [0xB940_0420]);
        assert_eq!(words(|e| e.fp_op(FpOp::Add, 0, 1, 2)), [0x1E22_2820]);
        assert_eq!(words(|e| e.vec_op(VecOp::Add, 0, 1, 2)), [0x4E22_D420]);
        assert_eq!(words(|e| e.mov(false, 3, 4)), [0x2A04_03E3]);
        assert_eq!(words(|e| e.cmp(false, 1, 2)), [0x6B02_003F]);
        assert_eq!(words(|e| e.mul(0, 1, 2)), [0x1B02_7C20]);
        assert_eq!(words(|e| e.stp_pre(FP, LR, 16)), [0xA9BF_7BFD]);
        assert_eq!(words(|e| e.ldp_post(FP, LR, 16)), [0xA8C1_7BFD]);
    }

    #[test]
    fn test_movi2r_forms() {
        assert_eq!(words(|e| e.movi2r(1, 0)), [0x5280_0001]);
        // MOVN for small negatives.
        assert_eq!(words(|e| e.movi2r(2, 0xffff_fffe)), [0x1280_0022]);
        // High half only.
        assert_eq!(words(|e| e.movi2r(3, 0x1234_0000)), [0x52A2_4683]);
        // Neither form: MOVZ + MOVK.
        assert_eq!(words(|e| e.movi2r(4, 0x1234_5678)), [0x528A_CF04, 0x72A2_4684]);
    }

    #[test]
    fn test_try_add_imm() {
        let mut enc = Arm64Encoder::new();
        assert!(enc.try_add_imm(0, 1, 0x10));
        assert!(enc.try_add_imm(0, 1, 0x5000));
        assert!(enc.try_add_imm(0, 1, (-4i32) as u32));
        assert!(!enc.try_add_imm(0, 1, 0x12345));
        assert_eq!(enc.words()[2], 0x5100_1020);
        let _ = enc.finish();
    }

    #[test]
    fn test_branch_patching() {
        let mut enc = Arm64Encoder::new();
        let skip = enc.b_cond(Cond::Ne);
        enc.nop();
        enc.set_jump_target(skip);
        let zero = enc.cbz(false, 3);
        enc.set_jump_target(zero);
        let back = enc.position();
        enc.nop();
        enc.b_to(back);
        assert_eq!(enc.pending_fixups(), 0);
        let code = enc.words().to_vec();
        assert_eq!(code[0], 0x5400_0041);
        assert_eq!(code[2], 0x3400_0023);
        assert_eq!(code[4], 0x17FF_FFFF);
        let _ = enc.finish();
    }

    #[test]
    fn test_logical_imm_basics() {
        let li = logical_imm(0xff, 32).unwrap();
        assert_eq!(li, LogicalImm { n: 0, imm_s: 7, imm_r: 0 });
        assert_eq!(logical_imm(0, 32), None);
        assert_eq!(logical_imm(0xffff_ffff, 32), None);
        assert_eq!(logical_imm(0x1234_5678, 32), None);
        let li = logical_imm(0x8000_0001, 32).unwrap();
        assert_eq!(decode_logical_imm(li, 32), Some(0x8000_0001));
        let li = logical_imm(0x0000_ffff_0000_0000, 64).unwrap();
        assert_eq!(li.n, 1);
        assert_eq!(decode_logical_imm(li, 64), Some(0x0000_ffff_0000_0000));
    }

    #[test]
    #[should_panic(expected = "branch fixups outstanding")]
    fn test_finish_with_pending_fixup() {
        let mut enc = Arm64Encoder::new();
        let _branch = enc.b();
        let _ = enc.finish();
    }
}
