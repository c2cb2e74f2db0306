// This module defines the unified IR register space shared by every other component. Guest
// GPRs, FPU registers, VFPU registers and their temporaries, VFPU control registers, the
// compiler-introduced scratch temporaries and a handful of special registers (LO, HI, FCR31,
// FPCOND, LLBIT) all live in one 256-entry space of 32-bit slots. The interpreter indexes
// guest state by these numbers directly, the passes reason about them when deciding what an
// exit may observe, and the register engine uses them as virtual register ids.

//! Unified IR register numbering.

/// Index into the 256-entry IR register space.
pub type IrReg = u8;

/// Total number of IR register slots.
pub const TOTAL_IR_REGS: usize = 256;

/// Hard-wired zero register.
pub const ZERO_REG: IrReg = 0;

pub const GPR_COUNT: usize = 32;

/// Slot of FPR field 0. FPR field `f` lives in slot `FPR_BASE + f`.
pub const FPR_BASE: usize = 32;
/// Number of FPR fields (FPU 0..32, VFPU 32..160, VFPU temps 160..176).
pub const FPR_COUNT: usize = 176;

pub const VFPU_BASE: usize = 64;
pub const VFPU_TEMP_BASE: usize = 192;

/// Slot of VFPU control register 0.
pub const VFPU_CTRL_BASE: usize = 208;
pub const VFPU_CTRL_COUNT: usize = 16;

pub const TEMP0: IrReg = 224;
pub const TEMP1: IrReg = 225;
pub const TEMP2: IrReg = 226;
pub const TEMP3: IrReg = 227;
pub const TEMP_LHS: IrReg = 228;
pub const TEMP_RHS: IrReg = 229;
pub const TEMP_LR_ADDR: IrReg = 230;
pub const TEMP_LR_VALUE: IrReg = 231;
pub const TEMP_LR_MASK: IrReg = 232;
pub const TEMP_LR_SHIFT: IrReg = 233;

pub const REG_LO: IrReg = 240;
pub const REG_HI: IrReg = 241;
pub const REG_FCR31: IrReg = 242;
pub const REG_FPCOND: IrReg = 243;
pub const REG_LLBIT: IrReg = 244;

/// Whether `reg` is one of the block-scoped scratch temporaries.
pub fn is_temp(reg: IrReg) -> bool {
    (TEMP0..=TEMP_LR_SHIFT).contains(&reg)
}

/// Whether `reg` is an integer-class slot (anything outside the FPR range).
pub fn is_gpr_slot(reg: usize) -> bool {
    reg < FPR_BASE || reg >= FPR_BASE + FPR_COUNT
}

/// Slot holding FPR field `f`.
pub fn fpr_slot(f: u8) -> usize {
    FPR_BASE + f as usize
}

/// Slot holding VFPU control register `n`.
pub fn vfpu_ctrl_slot(n: u8) -> usize {
    VFPU_CTRL_BASE + (n as usize & (VFPU_CTRL_COUNT - 1))
}

const GPR_NAMES: [&str; 32] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26",
    "r27", "r28", "r29", "r30", "r31",
];

const SPECIAL_NAMES: [(IrReg, &str); 15] = [
    (TEMP0, "temp0"),
    (TEMP1, "temp1"),
    (TEMP2, "temp2"),
    (TEMP3, "temp3"),
    (TEMP_LHS, "lhs"),
    (TEMP_RHS, "rhs"),
    (TEMP_LR_ADDR, "lr_addr"),
    (TEMP_LR_VALUE, "lr_value"),
    (TEMP_LR_MASK, "lr_mask"),
    (TEMP_LR_SHIFT, "lr_shift"),
    (REG_LO, "lo"),
    (REG_HI, "hi"),
    (REG_FCR31, "fcr31"),
    (REG_FPCOND, "fpcond"),
    (REG_LLBIT, "llbit"),
];

/// Text name of an integer-class register.
pub fn gpr_name(reg: IrReg) -> String {
    if (reg as usize) < GPR_COUNT {
        return GPR_NAMES[reg as usize].to_string();
    }
    if let Some((_, name)) = SPECIAL_NAMES.iter().find(|(r, _)| *r == reg) {
        return name.to_string();
    }
    format!("g{}", reg)
}

/// Parse an integer-class register name produced by [`gpr_name`].
pub fn parse_gpr_name(name: &str) -> Option<IrReg> {
    if let Some((reg, _)) = SPECIAL_NAMES.iter().find(|(_, n)| *n == name) {
        return Some(*reg);
    }
    if let Some(digits) = name.strip_prefix('r') {
        let value: usize = digits.parse().ok()?;
        return (value < GPR_COUNT).then_some(value as IrReg);
    }
    let value: usize = name.strip_prefix('g')?.parse().ok()?;
    (value < TOTAL_IR_REGS).then_some(value as IrReg)
}
