// This module wraps the iced-x86 CodeAssembler for the x86-64 backend. Register engine native
// numbers map onto hardware registers here: 0..16 are the integer registers in encoding order
// (rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15) and 16..32 are xmm0..xmm15. The encoder
// converts those numbers into iced register values of the width an instruction needs and
// builds the two memory operand shapes compiled blocks use: a guest register slot at a fixed
// offset from the state pointer in r14, and a guest address indexed off the memory base in
// r15. Instructions themselves are emitted straight through the CodeAssembler; iced errors
// convert into the crate error type so backend code can use `?` on every emit. Labels come
// from the assembler too and are resolved when the block is assembled.

//! x86-64 instruction encoding using iced-x86.

use crate::core::error::JitError;
use crate::core::regcache::NativeReg;
use iced_x86::code_asm::*;
use iced_x86::IcedError;

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Native register number has no hardware register of the requested class.
    InvalidRegister(NativeReg),
    /// Assembly error from iced-x86.
    AssemblyError(String),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister(reg) => write!(f, "Invalid register {reg} for operation"),
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<IcedError> for EncodingError {
    fn from(err: IcedError) -> Self {
        EncodingError::AssemblyError(err.to_string())
    }
}

impl From<EncodingError> for JitError {
    fn from(err: EncodingError) -> Self {
        JitError::Encoding {
            reason: err.to_string(),
        }
    }
}

impl From<IcedError> for JitError {
    fn from(err: IcedError) -> Self {
        EncodingError::from(err).into()
    }
}

/// Number of integer registers in the native numbering.
pub const NUM_GPRS: usize = 16;
/// Number of xmm registers in the native numbering.
pub const NUM_FPRS: usize = 16;

/// Native number of `xmm{n}`.
pub const fn xmm_native(n: u8) -> NativeReg {
    NUM_GPRS as NativeReg + n
}

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

const GP16_REGS: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];

const GP8_REGS: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

const XMM_REGS: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

/// Guest state pointer.
pub const CTX: AsmRegister64 = r14;
/// Guest memory base.
pub const MEMBASE: AsmRegister64 = r15;

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64)?;
        Ok(Self { assembler })
    }

    /// The underlying assembler.
    pub fn asm(&mut self) -> &mut CodeAssembler {
        &mut self.assembler
    }

    /// Instructions emitted so far.
    pub fn instruction_count(&self) -> usize {
        self.assembler.instructions().len()
    }

    pub fn gp64(reg: NativeReg) -> Result<AsmRegister64, EncodingError> {
        GP64_REGS
            .get(reg as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister(reg))
    }

    pub fn gp32(reg: NativeReg) -> Result<AsmRegister32, EncodingError> {
        GP32_REGS
            .get(reg as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister(reg))
    }

    pub fn gp16(reg: NativeReg) -> Result<AsmRegister16, EncodingError> {
        GP16_REGS
            .get(reg as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister(reg))
    }

    pub fn gp8(reg: NativeReg) -> Result<AsmRegister8, EncodingError> {
        GP8_REGS
            .get(reg as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister(reg))
    }

    pub fn xmm(reg: NativeReg) -> Result<AsmRegisterXmm, EncodingError> {
        (reg as usize)
            .checked_sub(NUM_GPRS)
            .and_then(|n| XMM_REGS.get(n))
            .copied()
            .ok_or(EncodingError::InvalidRegister(reg))
    }

    /// `[r14 + offset]`: a field of the guest state.
    pub fn state(offset: i32) -> AsmMemoryOperand {
        CTX + offset
    }

    /// `[r15 + index]`: guest memory at the zero-extended address in `index`.
    pub fn guest(index: AsmRegister64) -> AsmMemoryOperand {
        MEMBASE + index
    }

    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    /// Place `label` at the next emitted instruction.
    pub fn place_label(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        self.assembler.set_label(label)?;
        Ok(())
    }

    /// Materialize a 32-bit constant.
    pub fn mov_imm32(&mut self, dst: AsmRegister32, imm: u32) -> Result<(), EncodingError> {
        if imm == 0 {
            self.assembler.xor(dst, dst)?;
        } else {
            self.assembler.mov(dst, imm as i32)?;
        }
        Ok(())
    }

    /// Move a 32-bit constant into an xmm register through `eax`.
    pub fn mov_xmm_imm32(&mut self, dst: AsmRegisterXmm, imm: u32) -> Result<(), EncodingError> {
        if imm == 0 {
            self.assembler.xorps(dst, dst)?;
        } else {
            self.assembler.mov(eax, imm as i32)?;
            self.assembler.movd(dst, eax)?;
        }
        Ok(())
    }

    /// Push the callee-saved registers and align the stack for calls.
    pub fn emit_prologue(&mut self) -> Result<(), EncodingError> {
        for reg in [rbx, rbp, r12, r13, r14, r15] {
            self.assembler.push(reg)?;
        }
        self.assembler.sub(rsp, 8i32)?;
        Ok(())
    }

    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        self.assembler.add(rsp, 8i32)?;
        for reg in [r15, r14, r13, r12, rbp, rbx] {
            self.assembler.pop(reg)?;
        }
        self.assembler.ret()?;
        Ok(())
    }

    /// Assemble into position-independent machine code.
    pub fn finalize(&mut self) -> Result<Vec<u8>, EncodingError> {
        Ok(self.assembler.assemble(0)?)
    }
}
