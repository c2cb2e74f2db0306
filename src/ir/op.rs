// This module defines the IR opcode enumeration and the static per-opcode metadata table.
// Every consumer of an instruction record (the passes, the interpreter, the register engine,
// both native backends and the text printer) interprets operand fields only through this
// table: each of the three fields is tagged with an OperandKind, and flags mark ops whose dest
// field is really a third source (SRC3), is both read and written (SRC3DST), ends the block
// (EXIT), or has effects the passes cannot model (BARRIER). Registers an op touches without
// naming them in a field (LO/HI for multiplies, FPCOND for compares, LLBIT for linked
// loads/stores) are listed as implicit reads and writes. The table is a literal static array
// indexed by the opcode discriminant, so lookup is a single bounds-checked index.

//! IR opcodes and their metadata.

use super::regs::{IrReg, REG_FCR31, REG_FPCOND, REG_HI, REG_LLBIT, REG_LO};

/// What an instruction field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Field unused.
    None,
    /// Integer-class register index.
    Gpr,
    /// Single float register (FPR field numbering).
    Fpr,
    /// First of four consecutive float registers.
    Vec4,
    /// Index into the program's constant pool.
    Const,
    /// Literal embedded in the field.
    Imm,
    /// VFPU control register number.
    VfpuCtrl,
}

/// Dest field is a third source.
pub const SRC3: u8 = 1 << 0;
/// Dest field is read and then written.
pub const SRC3DST: u8 = 1 << 1;
/// Ends the block.
pub const EXIT: u8 = 1 << 2;
/// Has effects the passes cannot see through.
pub const BARRIER: u8 = 1 << 3;

/// Static description of one opcode.
#[derive(Debug)]
pub struct OpMeta {
    pub op: Op,
    pub name: &'static str,
    /// Kinds of dest, src1, src2.
    pub kinds: [OperandKind; 3],
    pub flags: u8,
    pub implicit_reads: &'static [IrReg],
    pub implicit_writes: &'static [IrReg],
}

impl OpMeta {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

macro_rules! define_ops {
    ($($name:ident),* $(,)?) => {
        /// IR opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $($name),*
        }

        /// Every opcode in discriminant order.
        pub const ALL_OPS: &[Op] = &[$(Op::$name),*];
    };
}

define_ops! {
    Nop, Mov, SetConst, SetConstF, Downcount, SetPC, SetPCConst,
    Add, Sub, Neg, Not, And, Or, Xor,
    AddConst, SubConst, AndConst, OrConst, XorConst,
    Ext8to32, Ext16to32, BSwap16, BSwap32, Clz, ReverseBits,
    Shl, Shr, Sar, Ror, ShlImm, ShrImm, SarImm, RorImm,
    Slt, SltConst, SltU, SltUConst, MovZ, MovNZ, Max, Min,
    MtLo, MtHi, MfLo, MfHi, Mult, MultU, Madd, MaddU, Msub, MsubU, Div, DivU,
    Load8, Load8Ext, Load16, Load16Ext, Load32, Load32Left, Load32Right, Load32Linked,
    LoadFloat, LoadVec4,
    Store8, Store16, Store32, Store32Left, Store32Right, Store32Conditional,
    StoreFloat, StoreVec4,
    FAdd, FSub, FMul, FDiv, FMin, FMax, FSqrt, FNeg, FAbs, FMov,
    FRound, FTrunc, FCeil, FFloor, FCvtWS, FCvtSW, FCmp,
    FMovFromGPR, FMovToGPR, FpCondFromReg, FpCondToReg,
    SetCtrlVFPU, SetCtrlVFPUReg,
    Vec4Init, Vec4Shuffle, Vec4Blend, Vec4Mov, Vec4Add, Vec4Sub, Vec4Mul, Vec4Div,
    Vec4Scale, Vec4Neg, Vec4Abs, Vec4Dot, Vec4ClampToZero,
    ExitToConst, ExitToReg, ExitToConstIfEq, ExitToConstIfNeq,
    ExitToConstIfGtZ, ExitToConstIfGeZ, ExitToConstIfLtZ, ExitToConstIfLeZ,
    ExitToPC, Syscall,
}

use OperandKind::{Const as C, Fpr as F, Gpr as G, Imm as I, None as N, Vec4 as V, VfpuCtrl as T};

const NONE: &[IrReg] = &[];
const LO: &[IrReg] = &[REG_LO];
const HI: &[IrReg] = &[REG_HI];
const LOHI: &[IrReg] = &[REG_LO, REG_HI];
const FPCOND: &[IrReg] = &[REG_FPCOND];
const FCR31: &[IrReg] = &[REG_FCR31];
const LLBIT: &[IrReg] = &[REG_LLBIT];

const fn m(op: Op, name: &'static str, kinds: [OperandKind; 3], flags: u8) -> OpMeta {
    OpMeta {
        op,
        name,
        kinds,
        flags,
        implicit_reads: NONE,
        implicit_writes: NONE,
    }
}

const fn mi(
    op: Op,
    name: &'static str,
    kinds: [OperandKind; 3],
    flags: u8,
    implicit_reads: &'static [IrReg],
    implicit_writes: &'static [IrReg],
) -> OpMeta {
    OpMeta {
        op,
        name,
        kinds,
        flags,
        implicit_reads,
        implicit_writes,
    }
}

static META: [OpMeta; ALL_OPS.len()] = [
    m(Op::Nop, "Nop", [N, N, N], 0),
    m(Op::Mov, "Mov", [G, G, N], 0),
    m(Op::SetConst, "SetConst", [G, C, N], 0),
    m(Op::SetConstF, "SetConstF", [F, C, N], 0),
    m(Op::Downcount, "Downcount", [C, N, N], 0),
    m(Op::SetPC, "SetPC", [N, G, N], 0),
    m(Op::SetPCConst, "SetPCConst", [C, N, N], 0),
    m(Op::Add, "Add", [G, G, G], 0),
    m(Op::Sub, "Sub", [G, G, G], 0),
    m(Op::Neg, "Neg", [G, G, N], 0),
    m(Op::Not, "Not", [G, G, N], 0),
    m(Op::And, "And", [G, G, G], 0),
    m(Op::Or, "Or", [G, G, G], 0),
    m(Op::Xor, "Xor", [G, G, G], 0),
    m(Op::AddConst, "AddConst", [G, G, C], 0),
    m(Op::SubConst, "SubConst", [G, G, C], 0),
    m(Op::AndConst, "AndConst", [G, G, C], 0),
    m(Op::OrConst, "OrConst", [G, G, C], 0),
    m(Op::XorConst, "XorConst", [G, G, C], 0),
    m(Op::Ext8to32, "Ext8to32", [G, G, N], 0),
    m(Op::Ext16to32, "Ext16to32", [G, G, N], 0),
    m(Op::BSwap16, "BSwap16", [G, G, N], 0),
    m(Op::BSwap32, "BSwap32", [G, G, N], 0),
    m(Op::Clz, "Clz", [G, G, N], 0),
    m(Op::ReverseBits, "ReverseBits", [G, G, N], 0),
    m(Op::Shl, "Shl", [G, G, G], 0),
    m(Op::Shr, "Shr", [G, G, G], 0),
    m(Op::Sar, "Sar", [G, G, G], 0),
    m(Op::Ror, "Ror", [G, G, G], 0),
    m(Op::ShlImm, "ShlImm", [G, G, I], 0),
    m(Op::ShrImm, "ShrImm", [G, G, I], 0),
    m(Op::SarImm, "SarImm", [G, G, I], 0),
    m(Op::RorImm, "RorImm", [G, G, I], 0),
    m(Op::Slt, "Slt", [G, G, G], 0),
    m(Op::SltConst, "SltConst", [G, G, C], 0),
    m(Op::SltU, "SltU", [G, G, G], 0),
    m(Op::SltUConst, "SltUConst", [G, G, C], 0),
    m(Op::MovZ, "MovZ", [G, G, G], SRC3DST),
    m(Op::MovNZ, "MovNZ", [G, G, G], SRC3DST),
    m(Op::Max, "Max", [G, G, G], 0),
    m(Op::Min, "Min", [G, G, G], 0),
    mi(Op::MtLo, "MtLo", [N, G, N], 0, NONE, LO),
    mi(Op::MtHi, "MtHi", [N, G, N], 0, NONE, HI),
    mi(Op::MfLo, "MfLo", [G, N, N], 0, LO, NONE),
    mi(Op::MfHi, "MfHi", [G, N, N], 0, HI, NONE),
    mi(Op::Mult, "Mult", [N, G, G], 0, NONE, LOHI),
    mi(Op::MultU, "MultU", [N, G, G], 0, NONE, LOHI),
    mi(Op::Madd, "Madd", [N, G, G], 0, LOHI, LOHI),
    mi(Op::MaddU, "MaddU", [N, G, G], 0, LOHI, LOHI),
    mi(Op::Msub, "Msub", [N, G, G], 0, LOHI, LOHI),
    mi(Op::MsubU, "MsubU", [N, G, G], 0, LOHI, LOHI),
    mi(Op::Div, "Div", [N, G, G], 0, NONE, LOHI),
    mi(Op::DivU, "DivU", [N, G, G], 0, NONE, LOHI),
    m(Op::Load8, "Load8", [G, G, C], 0),
    m(Op::Load8Ext, "Load8Ext", [G, G, C], 0),
    m(Op::Load16, "Load16", [G, G, C], 0),
    m(Op::Load16Ext, "Load16Ext", [G, G, C], 0),
    m(Op::Load32, "Load32", [G, G, C], 0),
    m(Op::Load32Left, "Load32Left", [G, G, C], SRC3DST),
    m(Op::Load32Right, "Load32Right", [G, G, C], SRC3DST),
    mi(Op::Load32Linked, "Load32Linked", [G, G, C], 0, NONE, LLBIT),
    m(Op::LoadFloat, "LoadFloat", [F, G, C], 0),
    m(Op::LoadVec4, "LoadVec4", [V, G, C], 0),
    m(Op::Store8, "Store8", [G, G, C], SRC3),
    m(Op::Store16, "Store16", [G, G, C], SRC3),
    m(Op::Store32, "Store32", [G, G, C], SRC3),
    m(Op::Store32Left, "Store32Left", [G, G, C], SRC3),
    m(Op::Store32Right, "Store32Right", [G, G, C], SRC3),
    mi(Op::Store32Conditional, "Store32Conditional", [G, G, C], SRC3DST, LLBIT, NONE),
    m(Op::StoreFloat, "StoreFloat", [F, G, C], SRC3),
    m(Op::StoreVec4, "StoreVec4", [V, G, C], SRC3),
    m(Op::FAdd, "FAdd", [F, F, F], 0),
    m(Op::FSub, "FSub", [F, F, F], 0),
    m(Op::FMul, "FMul", [F, F, F], 0),
    m(Op::FDiv, "FDiv", [F, F, F], 0),
    m(Op::FMin, "FMin", [F, F, F], 0),
    m(Op::FMax, "FMax", [F, F, F], 0),
    m(Op::FSqrt, "FSqrt", [F, F, N], 0),
    m(Op::FNeg, "FNeg", [F, F, N], 0),
    m(Op::FAbs, "FAbs", [F, F, N], 0),
    m(Op::FMov, "FMov", [F, F, N], 0),
    m(Op::FRound, "FRound", [F, F, N], 0),
    m(Op::FTrunc, "FTrunc", [F, F, N], 0),
    m(Op::FCeil, "FCeil", [F, F, N], 0),
    m(Op::FFloor, "FFloor", [F, F, N], 0),
    mi(Op::FCvtWS, "FCvtWS", [F, F, N], 0, FCR31, NONE),
    m(Op::FCvtSW, "FCvtSW", [F, F, N], 0),
    mi(Op::FCmp, "FCmp", [I, F, F], 0, NONE, FPCOND),
    m(Op::FMovFromGPR, "FMovFromGPR", [F, G, N], 0),
    m(Op::FMovToGPR, "FMovToGPR", [G, F, N], 0),
    mi(Op::FpCondFromReg, "FpCondFromReg", [N, G, N], 0, NONE, FPCOND),
    mi(Op::FpCondToReg, "FpCondToReg", [G, N, N], 0, FPCOND, NONE),
    m(Op::SetCtrlVFPU, "SetCtrlVFPU", [T, C, N], 0),
    m(Op::SetCtrlVFPUReg, "SetCtrlVFPUReg", [T, G, N], 0),
    m(Op::Vec4Init, "Vec4Init", [V, I, N], 0),
    m(Op::Vec4Shuffle, "Vec4Shuffle", [V, V, I], 0),
    m(Op::Vec4Blend, "Vec4Blend", [V, V, I], SRC3DST),
    m(Op::Vec4Mov, "Vec4Mov", [V, V, N], 0),
    m(Op::Vec4Add, "Vec4Add", [V, V, V], 0),
    m(Op::Vec4Sub, "Vec4Sub", [V, V, V], 0),
    m(Op::Vec4Mul, "Vec4Mul", [V, V, V], 0),
    m(Op::Vec4Div, "Vec4Div", [V, V, V], 0),
    m(Op::Vec4Scale, "Vec4Scale", [V, V, F], 0),
    m(Op::Vec4Neg, "Vec4Neg", [V, V, N], 0),
    m(Op::Vec4Abs, "Vec4Abs", [V, V, N], 0),
    m(Op::Vec4Dot, "Vec4Dot", [F, V, V], 0),
    m(Op::Vec4ClampToZero, "Vec4ClampToZero", [V, V, N], 0),
    m(Op::ExitToConst, "ExitToConst", [C, N, N], EXIT),
    m(Op::ExitToReg, "ExitToReg", [N, G, N], EXIT),
    m(Op::ExitToConstIfEq, "ExitToConstIfEq", [C, G, G], EXIT),
    m(Op::ExitToConstIfNeq, "ExitToConstIfNeq", [C, G, G], EXIT),
    m(Op::ExitToConstIfGtZ, "ExitToConstIfGtZ", [C, G, N], EXIT),
    m(Op::ExitToConstIfGeZ, "ExitToConstIfGeZ", [C, G, N], EXIT),
    m(Op::ExitToConstIfLtZ, "ExitToConstIfLtZ", [C, G, N], EXIT),
    m(Op::ExitToConstIfLeZ, "ExitToConstIfLeZ", [C, G, N], EXIT),
    m(Op::ExitToPC, "ExitToPC", [N, N, N], EXIT),
    m(Op::Syscall, "Syscall", [C, N, N], EXIT | BARRIER),
];

/// O(1) metadata lookup.
pub fn metadata(op: Op) -> &'static OpMeta {
    &META[op as usize]
}

impl Op {
    /// Decode a raw opcode byte.
    pub fn from_u8(raw: u8) -> Option<Op> {
        ALL_OPS.get(raw as usize).copied()
    }

    pub fn name(self) -> &'static str {
        metadata(self).name
    }

    /// Look up an opcode by its text name.
    pub fn from_name(name: &str) -> Option<Op> {
        META.iter().find(|meta| meta.name == name).map(|meta| meta.op)
    }

    pub fn is_exit(self) -> bool {
        metadata(self).has(EXIT)
    }

    /// Register-plus-constant form of a two-register ALU op.
    pub fn to_const_form(self) -> Option<Op> {
        Some(match self {
            Op::Add => Op::AddConst,
            Op::Sub => Op::SubConst,
            Op::And => Op::AndConst,
            Op::Or => Op::OrConst,
            Op::Xor => Op::XorConst,
            Op::Slt => Op::SltConst,
            Op::SltU => Op::SltUConst,
            _ => return None,
        })
    }

    /// Immediate-amount form of a register shift.
    pub fn to_imm_shift(self) -> Option<Op> {
        Some(match self {
            Op::Shl => Op::ShlImm,
            Op::Shr => Op::ShrImm,
            Op::Sar => Op::SarImm,
            Op::Ror => Op::RorImm,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_order_matches_enum() {
        for (i, op) in ALL_OPS.iter().enumerate() {
            assert_eq!(*op as usize, i);
            assert_eq!(META[i].op, *op, "metadata row {} out of order", i);
        }
    }

    #[test]
    fn test_names_unique() {
        for op in ALL_OPS {
            assert_eq!(Op::from_name(op.name()), Some(*op));
        }
    }

    #[test]
    fn test_store_flags() {
        let meta = metadata(Op::Store32);
        assert!(meta.has(SRC3));
        assert!(!meta.has(SRC3DST));
        assert!(metadata(Op::Load32Left).has(SRC3DST));
        assert!(metadata(Op::Syscall).has(BARRIER));
        assert!(Op::ExitToConstIfEq.is_exit());
    }

    #[test]
    fn test_every_op_has_at_most_one_const_field() {
        for op in ALL_OPS {
            let consts = metadata(*op)
                .kinds
                .iter()
                .filter(|k| **k == OperandKind::Const)
                .count();
            assert!(consts <= 1, "{} has {} constant fields", op, consts);
        }
    }
}
