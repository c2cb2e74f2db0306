// This module is the reference IR interpreter. It executes an instruction slice in order
// against a GuestState and GuestMemory and stops at the first exit that is taken, returning
// the guest address to continue at, or runs off the end and returns None. The numeric
// behaviour here is the definition every native backend is tested against: float-to-int
// conversions saturate the way the guest FPU does (NaN and +inf give i32::MAX, -inf and
// other out-of-range values give i32::MIN), FMul of infinity by zero yields the canonical
// quiet NaN, FMin/FMax fall back to signed-integer ordering when a NaN is involved, shifts are
// masked to five bits, and unaligned Load32Left/Right and Store32Left/Right merge bytes
// exactly as the guest does. interpret_single executes one instruction with a pre-resolved
// constant and is the target of the native fallback call emitted by both backends.

//! Reference IR interpreter.

use super::state::{GuestMemory, GuestState};
use crate::core::error::JitResult;
use crate::ir::inst::{IrInst, IrProgram};
use crate::ir::op::Op;
use crate::ir::regs::{vfpu_ctrl_slot, REG_FCR31, REG_FPCOND, REG_HI, REG_LLBIT, REG_LO};

/// Lane values for the Vec4Init modes.
pub const VEC4_INIT_VALUES: [[f32; 4]; 7] = [
    [0.0, 0.0, 0.0, 0.0],
    [1.0, 1.0, 1.0, 1.0],
    [-1.0, -1.0, -1.0, -1.0],
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Canonical quiet NaN produced by inf * 0.
pub const CANONICAL_NAN: u32 = 0x7fc0_0000;

/// FCmp condition modes (the dest field of FCmp).
pub mod fcmp {
    pub const FALSE: u8 = 0;
    pub const EITHER_UNORDERED: u8 = 1;
    pub const EQUAL_ORDERED: u8 = 2;
    pub const EQUAL_UNORDERED: u8 = 3;
    pub const LESS_EQUAL_ORDERED: u8 = 4;
    pub const LESS_EQUAL_UNORDERED: u8 = 5;
    pub const LESS_ORDERED: u8 = 6;
    pub const LESS_UNORDERED: u8 = 7;
}

/// Run a whole program.
pub fn interpret_program(
    program: &IrProgram,
    state: &mut GuestState,
    memory: &mut GuestMemory,
) -> JitResult<Option<u32>> {
    interpret(program.insts(), program.constants().as_slice(), state, memory)
}

/// Execute `insts` in order. Returns the exit target, or `None` if execution ran off the end.
pub fn interpret(
    insts: &[IrInst],
    constants: &[u32],
    state: &mut GuestState,
    memory: &mut GuestMemory,
) -> JitResult<Option<u32>> {
    for inst in insts {
        let constant = inst
            .constant_index()
            .map(|idx| constants[idx as usize])
            .unwrap_or(0);
        if let Some(target) = interpret_single(inst, constant, state, memory)? {
            return Ok(Some(target));
        }
    }
    Ok(None)
}

/// Saturating float to int conversion with x86 out-of-range behaviour.
fn cvt_i32(value: f32) -> i32 {
    if value >= -2147483648.0 && value < 2147483648.0 {
        value as i32
    } else {
        i32::MIN
    }
}

/// Result for NaN or infinite inputs of the rounding conversions.
fn nan_or_inf_result(value: f32) -> Option<i32> {
    if value.is_nan() || value.is_infinite() {
        Some(if value.is_infinite() && value < 0.0 {
            i32::MIN
        } else {
            i32::MAX
        })
    } else {
        None
    }
}

pub(crate) fn f_round(value: f32) -> i32 {
    nan_or_inf_result(value).unwrap_or_else(|| cvt_i32(value.round_ties_even()))
}

pub(crate) fn f_trunc(value: f32) -> i32 {
    if let Some(special) = nan_or_inf_result(value) {
        return special;
    }
    if value >= 0.0 {
        let result = cvt_i32(value.floor());
        if result == i32::MIN {
            i32::MAX
        } else {
            result
        }
    } else {
        cvt_i32(value.ceil())
    }
}

pub(crate) fn f_ceil(value: f32) -> i32 {
    nan_or_inf_result(value).unwrap_or_else(|| cvt_i32(value.ceil()))
}

pub(crate) fn f_floor(value: f32) -> i32 {
    nan_or_inf_result(value).unwrap_or_else(|| cvt_i32(value.floor()))
}

fn f_cvt_ws(value: f32, fcr31: u32) -> i32 {
    if let Some(special) = nan_or_inf_result(value) {
        return special;
    }
    match fcr31 & 3 {
        0 => cvt_i32(value.round_ties_even()),
        1 => cvt_i32(value.trunc()),
        2 => cvt_i32(value.ceil()),
        _ => cvt_i32(value.floor()),
    }
}

fn f_mul(a: f32, b: f32) -> u32 {
    if (b == 0.0 && a.is_infinite()) || (a == 0.0 && b.is_infinite()) {
        CANONICAL_NAN
    } else {
        (a * b).to_bits()
    }
}

fn f_min(a: u32, b: u32) -> u32 {
    let (fa, fb) = (f32::from_bits(a), f32::from_bits(b));
    if fa.is_nan() || fb.is_nan() {
        let (sa, sb) = (a as i32, b as i32);
        if sa < 0 && sb < 0 {
            sa.max(sb) as u32
        } else {
            sa.min(sb) as u32
        }
    } else if fb < fa {
        b
    } else {
        a
    }
}

fn f_max(a: u32, b: u32) -> u32 {
    let (fa, fb) = (f32::from_bits(a), f32::from_bits(b));
    if fa.is_nan() || fb.is_nan() {
        let (sa, sb) = (a as i32, b as i32);
        if sa < 0 && sb < 0 {
            sa.min(sb) as u32
        } else {
            sa.max(sb) as u32
        }
    } else if fa < fb {
        b
    } else {
        a
    }
}

fn f_cmp(mode: u8, a: f32, b: f32) -> u32 {
    let result = match mode & 7 {
        fcmp::FALSE => false,
        fcmp::EITHER_UNORDERED => a.is_nan() || b.is_nan(),
        fcmp::EQUAL_ORDERED => a == b,
        fcmp::EQUAL_UNORDERED => a == b || a.is_nan() || b.is_nan(),
        fcmp::LESS_EQUAL_ORDERED => a <= b,
        fcmp::LESS_EQUAL_UNORDERED => !(a > b),
        fcmp::LESS_ORDERED => a < b,
        _ => !(a >= b),
    };
    result as u32
}

fn div_signed(num: i32, den: i32) -> (u32, u32) {
    if num == i32::MIN && den == -1 {
        (0x8000_0000, u32::MAX)
    } else if den != 0 {
        ((num / den) as u32, (num % den) as u32)
    } else {
        (if num < 0 { 1 } else { u32::MAX }, num as u32)
    }
}

fn div_unsigned(num: u32, den: u32) -> (u32, u32) {
    if den != 0 {
        (num / den, num % den)
    } else {
        (if num <= 0xffff { 0xffff } else { u32::MAX }, num)
    }
}

fn lohi(state: &GuestState) -> u64 {
    state.regs[REG_LO as usize] as u64 | ((state.regs[REG_HI as usize] as u64) << 32)
}

fn set_lohi(state: &mut GuestState, value: u64) {
    state.regs[REG_LO as usize] = value as u32;
    state.regs[REG_HI as usize] = (value >> 32) as u32;
}

fn read_vec4(memory: &GuestMemory, addr: u32) -> JitResult<[u32; 4]> {
    Ok([
        memory.read_u32(addr)?,
        memory.read_u32(addr.wrapping_add(4))?,
        memory.read_u32(addr.wrapping_add(8))?,
        memory.read_u32(addr.wrapping_add(12))?,
    ])
}

fn vec4_map(state: &mut GuestState, dest: u8, src: u8, f: impl Fn(u32) -> u32) {
    let lanes = state.vec4(src);
    state.set_vec4(dest, lanes.map(f));
}

fn vec4_zip(state: &mut GuestState, inst: &IrInst, f: impl Fn(f32, f32) -> f32) {
    let a = state.vec4(inst.src1);
    let b = state.vec4(inst.src2);
    let mut out = [0u32; 4];
    for i in 0..4 {
        out[i] = f(f32::from_bits(a[i]), f32::from_bits(b[i])).to_bits();
    }
    state.set_vec4(inst.dest, out);
}

/// Execute one instruction whose constant operand (if any) is `constant`.
pub fn interpret_single(
    inst: &IrInst,
    constant: u32,
    state: &mut GuestState,
    memory: &mut GuestMemory,
) -> JitResult<Option<u32>> {
    let d = inst.dest as usize;
    let s1 = inst.src1 as usize;
    let s2 = inst.src2 as usize;
    let r = |state: &GuestState, i: usize| state.regs[i];
    let addr = |state: &GuestState| state.regs[s1].wrapping_add(constant);

    match inst.op {
        Op::SetConst => state.regs[d] = constant,
        Op::SetConstF => state.set_fi(inst.dest, constant),
        Op::Mov => state.regs[d] = r(state, s1),
        Op::Downcount => state.downcount = state.downcount.wrapping_sub(constant as i32),
        Op::SetPC => state.pc = r(state, s1),
        Op::SetPCConst => state.pc = constant,

        Op::Add => state.regs[d] = r(state, s1).wrapping_add(r(state, s2)),
        Op::Sub => state.regs[d] = r(state, s1).wrapping_sub(r(state, s2)),
        Op::And => state.regs[d] = r(state, s1) & r(state, s2),
        Op::Or => state.regs[d] = r(state, s1) | r(state, s2),
        Op::Xor => state.regs[d] = r(state, s1) ^ r(state, s2),
        Op::Neg => state.regs[d] = r(state, s1).wrapping_neg(),
        Op::Not => state.regs[d] = !r(state, s1),
        Op::AddConst => state.regs[d] = r(state, s1).wrapping_add(constant),
        Op::SubConst => state.regs[d] = r(state, s1).wrapping_sub(constant),
        Op::AndConst => state.regs[d] = r(state, s1) & constant,
        Op::OrConst => state.regs[d] = r(state, s1) | constant,
        Op::XorConst => state.regs[d] = r(state, s1) ^ constant,
        Op::Ext8to32 => state.regs[d] = r(state, s1) as u8 as i8 as i32 as u32,
        Op::Ext16to32 => state.regs[d] = r(state, s1) as u16 as i16 as i32 as u32,
        Op::BSwap16 => {
            let x = r(state, s1);
            state.regs[d] = ((x & 0xff00_ff00) >> 8) | ((x & 0x00ff_00ff) << 8);
        }
        Op::BSwap32 => state.regs[d] = r(state, s1).swap_bytes(),
        Op::Clz => state.regs[d] = r(state, s1).leading_zeros(),
        Op::ReverseBits => state.regs[d] = r(state, s1).reverse_bits(),

        Op::Shl => state.regs[d] = r(state, s1) << (r(state, s2) & 31),
        Op::Shr => state.regs[d] = r(state, s1) >> (r(state, s2) & 31),
        Op::Sar => state.regs[d] = ((r(state, s1) as i32) >> (r(state, s2) & 31)) as u32,
        Op::Ror => state.regs[d] = r(state, s1).rotate_right(r(state, s2) & 31),
        Op::ShlImm => state.regs[d] = r(state, s1) << (inst.src2 & 31),
        Op::ShrImm => state.regs[d] = r(state, s1) >> (inst.src2 & 31),
        Op::SarImm => state.regs[d] = ((r(state, s1) as i32) >> (inst.src2 & 31)) as u32,
        Op::RorImm => state.regs[d] = r(state, s1).rotate_right(inst.src2 as u32 & 31),

        Op::Slt => state.regs[d] = ((r(state, s1) as i32) < (r(state, s2) as i32)) as u32,
        Op::SltU => state.regs[d] = (r(state, s1) < r(state, s2)) as u32,
        Op::SltConst => state.regs[d] = ((r(state, s1) as i32) < (constant as i32)) as u32,
        Op::SltUConst => state.regs[d] = (r(state, s1) < constant) as u32,
        Op::MovZ => {
            if r(state, s1) == 0 {
                state.regs[d] = r(state, s2);
            }
        }
        Op::MovNZ => {
            if r(state, s1) != 0 {
                state.regs[d] = r(state, s2);
            }
        }
        Op::Max => state.regs[d] = (r(state, s1) as i32).max(r(state, s2) as i32) as u32,
        Op::Min => state.regs[d] = (r(state, s1) as i32).min(r(state, s2) as i32) as u32,

        Op::MtLo => state.regs[REG_LO as usize] = r(state, s1),
        Op::MtHi => state.regs[REG_HI as usize] = r(state, s1),
        Op::MfLo => state.regs[d] = state.regs[REG_LO as usize],
        Op::MfHi => state.regs[d] = state.regs[REG_HI as usize],
        Op::Mult => {
            let p = (r(state, s1) as i32 as i64).wrapping_mul(r(state, s2) as i32 as i64);
            set_lohi(state, p as u64);
        }
        Op::MultU => {
            let p = (r(state, s1) as u64).wrapping_mul(r(state, s2) as u64);
            set_lohi(state, p);
        }
        Op::Madd => {
            let p = (r(state, s1) as i32 as i64).wrapping_mul(r(state, s2) as i32 as i64);
            let acc = lohi(state).wrapping_add(p as u64);
            set_lohi(state, acc);
        }
        Op::MaddU => {
            let p = (r(state, s1) as u64).wrapping_mul(r(state, s2) as u64);
            let acc = lohi(state).wrapping_add(p);
            set_lohi(state, acc);
        }
        Op::Msub => {
            let p = (r(state, s1) as i32 as i64).wrapping_mul(r(state, s2) as i32 as i64);
            let acc = lohi(state).wrapping_sub(p as u64);
            set_lohi(state, acc);
        }
        Op::MsubU => {
            let p = (r(state, s1) as u64).wrapping_mul(r(state, s2) as u64);
            let acc = lohi(state).wrapping_sub(p);
            set_lohi(state, acc);
        }
        Op::Div => {
            let (lo, hi) = div_signed(r(state, s1) as i32, r(state, s2) as i32);
            state.regs[REG_LO as usize] = lo;
            state.regs[REG_HI as usize] = hi;
        }
        Op::DivU => {
            let (lo, hi) = div_unsigned(r(state, s1), r(state, s2));
            state.regs[REG_LO as usize] = lo;
            state.regs[REG_HI as usize] = hi;
        }

        Op::Load8 => state.regs[d] = memory.read_u8(addr(state))? as u32,
        Op::Load8Ext => state.regs[d] = memory.read_u8(addr(state))? as i8 as i32 as u32,
        Op::Load16 => state.regs[d] = memory.read_u16(addr(state))? as u32,
        Op::Load16Ext => state.regs[d] = memory.read_u16(addr(state))? as i16 as i32 as u32,
        Op::Load32 => state.regs[d] = memory.read_u32(addr(state))?,
        Op::Load32Left => {
            let a = addr(state);
            let shift = (a & 3) * 8;
            let mem = memory.read_u32(a & !3)?;
            let dest_mask = 0x00ff_ffffu32 >> shift;
            state.regs[d] = (state.regs[d] & dest_mask) | (mem << (24 - shift));
        }
        Op::Load32Right => {
            let a = addr(state);
            let shift = (a & 3) * 8;
            let mem = memory.read_u32(a & !3)?;
            let dest_mask = 0xffff_ff00u32 << (24 - shift);
            state.regs[d] = (state.regs[d] & dest_mask) | (mem >> shift);
        }
        Op::Load32Linked => {
            let value = memory.read_u32(addr(state))?;
            if d != 0 {
                state.regs[d] = value;
            }
            state.regs[REG_LLBIT as usize] = 1;
        }
        Op::LoadFloat => {
            let value = memory.read_u32(addr(state))?;
            state.set_fi(inst.dest, value);
        }
        Op::LoadVec4 => {
            let lanes = read_vec4(memory, addr(state))?;
            state.set_vec4(inst.dest, lanes);
        }

        Op::Store8 => memory.write_u8(addr(state), state.regs[d] as u8)?,
        Op::Store16 => memory.write_u16(addr(state), state.regs[d] as u16)?,
        Op::Store32 => memory.write_u32(addr(state), state.regs[d])?,
        Op::Store32Left => {
            let a = addr(state);
            let shift = (a & 3) * 8;
            let mem = memory.read_u32(a & !3)?;
            let mem_mask = 0xffff_ff00u32 << shift;
            let result = (state.regs[d] >> (24 - shift)) | (mem & mem_mask);
            memory.write_u32(a & !3, result)?;
        }
        Op::Store32Right => {
            let a = addr(state);
            let shift = (a & 3) * 8;
            let mem = memory.read_u32(a & !3)?;
            let mem_mask = 0x00ff_ffffu32 >> (24 - shift);
            let result = (state.regs[d] << shift) | (mem & mem_mask);
            memory.write_u32(a & !3, result)?;
        }
        Op::Store32Conditional => {
            if state.regs[REG_LLBIT as usize] != 0 {
                memory.write_u32(addr(state), state.regs[d])?;
                if d != 0 {
                    state.regs[d] = 1;
                }
            } else if d != 0 {
                state.regs[d] = 0;
            }
        }
        Op::StoreFloat => memory.write_u32(addr(state), state.fi(inst.dest))?,
        Op::StoreVec4 => {
            let a = addr(state);
            for (i, lane) in state.vec4(inst.dest).iter().enumerate() {
                memory.write_u32(a.wrapping_add(4 * i as u32), *lane)?;
            }
        }

        Op::FAdd => state.set_f(inst.dest, state.f(inst.src1) + state.f(inst.src2)),
        Op::FSub => state.set_f(inst.dest, state.f(inst.src1) - state.f(inst.src2)),
        Op::FMul => state.set_fi(inst.dest, f_mul(state.f(inst.src1), state.f(inst.src2))),
        Op::FDiv => state.set_f(inst.dest, state.f(inst.src1) / state.f(inst.src2)),
        Op::FMin => state.set_fi(inst.dest, f_min(state.fi(inst.src1), state.fi(inst.src2))),
        Op::FMax => state.set_fi(inst.dest, f_max(state.fi(inst.src1), state.fi(inst.src2))),
        Op::FSqrt => state.set_f(inst.dest, state.f(inst.src1).sqrt()),
        Op::FNeg => state.set_fi(inst.dest, state.fi(inst.src1) ^ 0x8000_0000),
        Op::FAbs => state.set_fi(inst.dest, state.fi(inst.src1) & 0x7fff_ffff),
        Op::FMov => state.set_fi(inst.dest, state.fi(inst.src1)),
        Op::FRound => state.set_fi(inst.dest, f_round(state.f(inst.src1)) as u32),
        Op::FTrunc => state.set_fi(inst.dest, f_trunc(state.f(inst.src1)) as u32),
        Op::FCeil => state.set_fi(inst.dest, f_ceil(state.f(inst.src1)) as u32),
        Op::FFloor => state.set_fi(inst.dest, f_floor(state.f(inst.src1)) as u32),
        Op::FCvtWS => {
            let fcr31 = state.regs[REG_FCR31 as usize];
            state.set_fi(inst.dest, f_cvt_ws(state.f(inst.src1), fcr31) as u32);
        }
        Op::FCvtSW => state.set_f(inst.dest, state.fi(inst.src1) as i32 as f32),
        Op::FCmp => {
            state.regs[REG_FPCOND as usize] =
                f_cmp(inst.dest, state.f(inst.src1), state.f(inst.src2));
        }
        Op::FMovFromGPR => state.set_fi(inst.dest, r(state, s1)),
        Op::FMovToGPR => state.regs[d] = state.fi(inst.src1),
        Op::FpCondFromReg => state.regs[REG_FPCOND as usize] = r(state, s1),
        Op::FpCondToReg => state.regs[d] = state.regs[REG_FPCOND as usize],

        Op::SetCtrlVFPU => state.regs[vfpu_ctrl_slot(inst.dest)] = constant,
        Op::SetCtrlVFPUReg => state.regs[vfpu_ctrl_slot(inst.dest)] = r(state, s1),

        Op::Vec4Init => {
            let values = VEC4_INIT_VALUES[inst.src1 as usize % VEC4_INIT_VALUES.len()];
            state.set_vec4(inst.dest, values.map(f32::to_bits));
        }
        Op::Vec4Shuffle => {
            let src = state.vec4(inst.src1);
            let mut out = [0u32; 4];
            for (i, lane) in out.iter_mut().enumerate() {
                *lane = src[((inst.src2 >> (i * 2)) & 3) as usize];
            }
            state.set_vec4(inst.dest, out);
        }
        Op::Vec4Blend => {
            let src = state.vec4(inst.src1);
            let mut out = state.vec4(inst.dest);
            for (i, lane) in out.iter_mut().enumerate() {
                if (inst.src2 >> i) & 1 != 0 {
                    *lane = src[i];
                }
            }
            state.set_vec4(inst.dest, out);
        }
        Op::Vec4Mov => vec4_map(state, inst.dest, inst.src1, |x| x),
        Op::Vec4Add => vec4_zip(state, inst, |a, b| a + b),
        Op::Vec4Sub => vec4_zip(state, inst, |a, b| a - b),
        Op::Vec4Mul => vec4_zip(state, inst, |a, b| a * b),
        Op::Vec4Div => vec4_zip(state, inst, |a, b| a / b),
        Op::Vec4Scale => {
            let factor = state.f(inst.src2);
            vec4_map(state, inst.dest, inst.src1, |x| {
                (f32::from_bits(x) * factor).to_bits()
            });
        }
        Op::Vec4Neg => vec4_map(state, inst.dest, inst.src1, |x| x ^ 0x8000_0000),
        Op::Vec4Abs => vec4_map(state, inst.dest, inst.src1, |x| x & 0x7fff_ffff),
        Op::Vec4Dot => {
            let a = state.vec4(inst.src1).map(f32::from_bits);
            let b = state.vec4(inst.src2).map(f32::from_bits);
            let mut dot = a[0] * b[0];
            for i in 1..4 {
                dot += a[i] * b[i];
            }
            state.set_f(inst.dest, dot);
        }
        Op::Vec4ClampToZero => vec4_map(state, inst.dest, inst.src1, |x| {
            if (x as i32) >= 0 {
                x
            } else {
                0
            }
        }),

        Op::ExitToConst => return Ok(Some(constant)),
        Op::ExitToReg => return Ok(Some(r(state, s1))),
        Op::ExitToConstIfEq => {
            if r(state, s1) == r(state, s2) {
                return Ok(Some(constant));
            }
        }
        Op::ExitToConstIfNeq => {
            if r(state, s1) != r(state, s2) {
                return Ok(Some(constant));
            }
        }
        Op::ExitToConstIfGtZ => {
            if (r(state, s1) as i32) > 0 {
                return Ok(Some(constant));
            }
        }
        Op::ExitToConstIfGeZ => {
            if (r(state, s1) as i32) >= 0 {
                return Ok(Some(constant));
            }
        }
        Op::ExitToConstIfLtZ => {
            if (r(state, s1) as i32) < 0 {
                return Ok(Some(constant));
            }
        }
        Op::ExitToConstIfLeZ => {
            if (r(state, s1) as i32) <= 0 {
                return Ok(Some(constant));
            }
        }
        Op::ExitToPC => return Ok(Some(state.pc)),
        Op::Syscall => {
            state.syscall = constant;
            return Ok(Some(state.pc));
        }

        Op::Nop => unreachable!("interpreter reached {} (no interpreter case)", inst.op),
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::regs::TEMP0;

    fn run(program: &IrProgram, state: &mut GuestState) -> Option<u32> {
        let mut memory = GuestMemory::new(0x1000);
        interpret_program(program, state, &mut memory).unwrap()
    }

    #[test]
    fn test_add_const_store() {
        let mut prog = IrProgram::new();
        prog.append_const(Op::AddConst, 1, 2, 5).unwrap();
        prog.append_const(Op::Store32, 1, 2, 0).unwrap();
        let mut state = GuestState::new();
        state.regs[2] = 100;
        let mut memory = GuestMemory::new(0x1000);
        assert_eq!(interpret_program(&prog, &mut state, &mut memory).unwrap(), None);
        assert_eq!(memory.read_u32(100).unwrap(), 105);
    }

    #[test]
    fn test_conditional_exit() {
        let mut prog = IrProgram::new();
        prog.set_const(3, 7).unwrap();
        let target = prog.add_constant(0x0880_0000).unwrap();
        prog.append(Op::ExitToConstIfEq, target, 3, 3);
        prog.exit_to_const(0x0880_0100).unwrap();
        let mut state = GuestState::new();
        assert_eq!(run(&prog, &mut state), Some(0x0880_0000));

        let mut prog = IrProgram::new();
        let target = prog.add_constant(0x0880_0000).unwrap();
        prog.append(Op::ExitToConstIfLtZ, target, 4, 0);
        prog.exit_to_const(0x0880_0100).unwrap();
        let mut state = GuestState::new();
        state.regs[4] = 5;
        assert_eq!(run(&prog, &mut state), Some(0x0880_0100));
    }

    #[test]
    fn test_shift_masking() {
        let mut prog = IrProgram::new();
        prog.set_const(1, 0x8000_0001).unwrap();
        prog.set_const(2, 33).unwrap();
        prog.append(Op::Shl, 3, 1, 2);
        prog.append(Op::Sar, 4, 1, 2);
        prog.append(Op::Ror, 5, 1, 2);
        let mut state = GuestState::new();
        run(&prog, &mut state);
        assert_eq!(state.regs[3], 0x0000_0002);
        assert_eq!(state.regs[4], 0xc000_0000);
        assert_eq!(state.regs[5], 0xc000_0000);
    }

    #[test]
    fn test_division_edge_cases() {
        assert_eq!(div_signed(i32::MIN, -1), (0x8000_0000, u32::MAX));
        assert_eq!(div_signed(-5, 0), (1, (-5i32) as u32));
        assert_eq!(div_signed(5, 0), (u32::MAX, 5));
        assert_eq!(div_signed(-7, 2), ((-3i32) as u32, (-1i32) as u32));
        assert_eq!(div_unsigned(0x1234, 0), (0xffff, 0x1234));
        assert_eq!(div_unsigned(0x12345, 0), (u32::MAX, 0x12345));
    }

    #[test]
    fn test_float_conversions() {
        assert_eq!(f_round(2.5), 2);
        assert_eq!(f_round(3.5), 4);
        assert_eq!(f_round(f32::NAN), i32::MAX);
        assert_eq!(f_round(f32::NEG_INFINITY), i32::MIN);
        assert_eq!(f_trunc(3e9), i32::MAX);
        assert_eq!(f_trunc(-3e9), i32::MIN);
        assert_eq!(f_trunc(-1.7), -1);
        assert_eq!(f_ceil(1.2), 2);
        assert_eq!(f_floor(-1.2), -2);
        assert_eq!(f_ceil(3e9), i32::MIN);
        assert_eq!(f_cvt_ws(1.5, 0), 2);
        assert_eq!(f_cvt_ws(1.5, 1), 1);
        assert_eq!(f_cvt_ws(1.5, 2), 2);
        assert_eq!(f_cvt_ws(-1.5, 3), -2);
    }

    #[test]
    fn test_fmul_inf_zero() {
        assert_eq!(f_mul(f32::INFINITY, 0.0), CANONICAL_NAN);
        assert_eq!(f_mul(-0.0, f32::NEG_INFINITY), CANONICAL_NAN);
        assert_eq!(f_mul(2.0, 3.0), 6.0f32.to_bits());
    }

    #[test]
    fn test_fmin_fmax() {
        let nan = f32::NAN.to_bits();
        assert_eq!(f_min(1.0f32.to_bits(), 2.0f32.to_bits()), 1.0f32.to_bits());
        assert_eq!(f_max(1.0f32.to_bits(), 2.0f32.to_bits()), 2.0f32.to_bits());
        assert_eq!(f_min(nan, 1.0f32.to_bits()), 1.0f32.to_bits());
        let neg_nan = nan | 0x8000_0000;
        // Both negative: the larger signed pattern is the smaller float, NaN included.
        assert_eq!(f_min(neg_nan, (-1.0f32).to_bits()), neg_nan);
        assert_eq!(f_max(neg_nan, (-1.0f32).to_bits()), (-1.0f32).to_bits());
        // Equal zeros keep the first operand.
        assert_eq!(f_min(0, 0x8000_0000), 0);
        assert_eq!(f_max(0x8000_0000, 0), 0x8000_0000);
    }

    #[test]
    fn test_fcmp_modes() {
        let nan = f32::NAN;
        assert_eq!(f_cmp(fcmp::EITHER_UNORDERED, nan, 1.0), 1);
        assert_eq!(f_cmp(fcmp::EQUAL_ORDERED, nan, nan), 0);
        assert_eq!(f_cmp(fcmp::EQUAL_UNORDERED, nan, 1.0), 1);
        assert_eq!(f_cmp(fcmp::LESS_EQUAL_UNORDERED, nan, 1.0), 1);
        assert_eq!(f_cmp(fcmp::LESS_ORDERED, 1.0, 2.0), 1);
        assert_eq!(f_cmp(fcmp::LESS_UNORDERED, 2.0, 2.0), 0);
    }

    #[test]
    fn test_unaligned_left_right() {
        let mut memory = GuestMemory::new(64);
        memory.write_u32(16, 0x4433_2211).unwrap();
        let mut state = GuestState::new();
        state.regs[1] = 16;
        state.regs[2] = 0xaabb_ccdd;

        let left = IrInst::new(Op::Load32Left, 2, 1, 0);
        interpret_single(&left, 1, &mut state, &mut memory).unwrap();
        assert_eq!(state.regs[2], 0x2211_ccdd);

        state.regs[3] = 0xaabb_ccdd;
        let right = IrInst::new(Op::Load32Right, 3, 1, 0);
        interpret_single(&right, 1, &mut state, &mut memory).unwrap();
        assert_eq!(state.regs[3], 0xaa44_3322);

        state.regs[4] = 0x1122_3344;
        let store_left = IrInst::new(Op::Store32Left, 4, 1, 0);
        interpret_single(&store_left, 0, &mut state, &mut memory).unwrap();
        assert_eq!(memory.read_u32(16).unwrap(), 0x4433_2211);
        interpret_single(&store_left, 3, &mut state, &mut memory).unwrap();
        assert_eq!(memory.read_u32(16).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_linked_conditional() {
        let mut memory = GuestMemory::new(64);
        let mut state = GuestState::new();
        state.regs[5] = 77;
        let sc = IrInst::new(Op::Store32Conditional, 5, 0, 0);
        interpret_single(&sc, 8, &mut state, &mut memory).unwrap();
        assert_eq!(state.regs[5], 0);
        assert_eq!(memory.read_u32(8).unwrap(), 0);

        let ll = IrInst::new(Op::Load32Linked, 6, 0, 0);
        interpret_single(&ll, 8, &mut state, &mut memory).unwrap();
        state.regs[5] = 77;
        interpret_single(&sc, 8, &mut state, &mut memory).unwrap();
        assert_eq!(state.regs[5], 1);
        assert_eq!(memory.read_u32(8).unwrap(), 77);
    }

    #[test]
    fn test_vec4_ops() {
        let mut state = GuestState::new();
        let init = IrInst::new(Op::Vec4Init, 32, 1, 0);
        let mut memory = GuestMemory::new(16);
        interpret_single(&init, 0, &mut state, &mut memory).unwrap();
        assert_eq!(state.vec4(32), [1.0f32.to_bits(); 4]);

        state.set_vec4(36, [1, 2, 3, 4]);
        let shuffle = IrInst::new(Op::Vec4Shuffle, 40, 36, 0b00_01_10_11);
        interpret_single(&shuffle, 0, &mut state, &mut memory).unwrap();
        assert_eq!(state.vec4(40), [4, 3, 2, 1]);

        let blend = IrInst::new(Op::Vec4Blend, 40, 36, 0b0101);
        interpret_single(&blend, 0, &mut state, &mut memory).unwrap();
        assert_eq!(state.vec4(40), [1, 3, 3, 1]);

        state.set_vec4(44, [1.0f32, 2.0, 3.0, 4.0].map(f32::to_bits));
        let dot = IrInst::new(Op::Vec4Dot, 0, 44, 44);
        interpret_single(&dot, 0, &mut state, &mut memory).unwrap();
        assert_eq!(state.f(0), 30.0);
    }

    #[test]
    fn test_memory_fault_propagates() {
        let mut prog = IrProgram::new();
        prog.set_const(TEMP0, 0x10_0000).unwrap();
        prog.append_const(Op::Load32, 1, TEMP0, 0).unwrap();
        let mut state = GuestState::new();
        let mut memory = GuestMemory::new(64);
        assert!(interpret_program(&prog, &mut state, &mut memory).is_err());
    }

    #[test]
    #[should_panic(expected = "no interpreter case")]
    fn test_nop_is_fatal() {
        let mut prog = IrProgram::new();
        prog.append(Op::Nop, 0, 0, 0);
        let mut state = GuestState::new();
        run(&prog, &mut state);
    }
}
