// This module implements the textual form of the IR, used by the CLI, the file-driven tests
// and debug logging. Every instruction is one line, `Name operand, operand, ...`, listing only
// the fields the opcode metadata marks as used, in dest/src1/src2 order. Operands are spelled
// by kind: integer registers by name (r0..r31, temp0, lhs, lo, fpcond, ...), float and vector
// registers as f<N>, VFPU control registers as vc<N>, immediates in decimal and constants as
// hex literals. Constants are interned into the program's pool while parsing, so a printed
// program parses back to an equal program. A file may hold several blocks, each introduced by
// a `block 0xADDR:` header; text before the first header forms a block at address 0.
// Comments start with `;` and run to the end of the line.

//! IR text parser and printer.

use super::inst::{IrInst, IrProgram};
use super::op::{metadata, Op, OperandKind};
use super::regs::{gpr_name, parse_gpr_name};
use crate::core::error::{JitError, JitResult};
use std::fmt;

/// Parse a single block of IR text.
pub fn parse_program(text: &str) -> JitResult<IrProgram> {
    let mut blocks = parse_module(text)?;
    match blocks.len() {
        0 => Ok(IrProgram::new()),
        1 => Ok(blocks.remove(0).1),
        n => Err(JitError::Parse {
            line: 1,
            reason: format!("expected a single block, found {}", n),
        }),
    }
}

/// Parse IR text holding any number of `block` sections.
pub fn parse_module(text: &str) -> JitResult<Vec<(u32, IrProgram)>> {
    Parser::new(text).parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    blocks: Vec<(u32, IrProgram)>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            blocks: Vec::new(),
        }
    }

    fn parse(mut self) -> JitResult<Vec<(u32, IrProgram)>> {
        self.skip_whitespace(true);

        while !self.is_eof() {
            let name = self.read_identifier()?;
            if name == "block" {
                let addr = self.read_number()?;
                self.expect(':')?;
                self.blocks.push((addr, IrProgram::new()));
            } else {
                self.parse_inst(name)?;
            }
            self.expect_line_end()?;
            self.skip_whitespace(true);
        }

        Ok(self.blocks)
    }

    fn error(&self, reason: impl Into<String>) -> JitError {
        JitError::Parse {
            line: self.text[..self.pos].matches('\n').count() + 1,
            reason: reason.into(),
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Comment runs to the end of the line.
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> JitResult<()> {
        if !self.try_read(ch) {
            return Err(self.error(format!(
                "expected '{}' but found {:?}",
                ch,
                self.current_char()
            )));
        }
        Ok(())
    }

    fn expect_line_end(&mut self) -> JitResult<()> {
        self.skip_whitespace(false);
        match self.current_char() {
            None | Some('\n') => Ok(()),
            Some(ch) => Err(self.error(format!("unexpected '{}' after instruction", ch))),
        }
    }

    fn read_identifier(&mut self) -> JitResult<&'a str> {
        self.skip_whitespace(false);
        let start = self.pos;

        match self.current_char() {
            Some(ch) if ch.is_alphabetic() => {}
            Some(ch) => return Err(self.error(format!("expected identifier but found '{}'", ch))),
            None => return Err(self.error("expected identifier but found end of input")),
        }

        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }

        Ok(&self.text[start..self.pos])
    }

    /// Read a literal: hex (`0x`), decimal (optionally negative) or a float with a '.'.
    fn read_number(&mut self) -> JitResult<u32> {
        self.skip_whitespace(false);
        let start = self.pos;

        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' || ch == '+' {
                self.advance();
            } else {
                break;
            }
        }

        let token = &self.text[start..self.pos];
        if token.is_empty() {
            return Err(self.error("expected number"));
        }

        let parsed = if let Some(hex) = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
        {
            u32::from_str_radix(hex, 16).ok()
        } else if token.contains('.') || token.contains("inf") || token.contains("nan") {
            token.parse::<f32>().ok().map(f32::to_bits)
        } else if let Some(neg) = token.strip_prefix('-') {
            neg.parse::<u32>()
                .ok()
                .filter(|v| *v <= 0x8000_0000)
                .map(|v| v.wrapping_neg())
        } else {
            token.parse::<u32>().ok()
        };

        parsed.ok_or_else(|| self.error(format!("invalid number '{}'", token)))
    }

    fn read_indexed(&mut self, prefix: &str, limit: u32) -> JitResult<u8> {
        let name = self.read_identifier()?;
        name.strip_prefix(prefix)
            .and_then(|digits| digits.parse::<u32>().ok())
            .filter(|v| *v < limit)
            .map(|v| v as u8)
            .ok_or_else(|| self.error(format!("expected {}<N> operand, found '{}'", prefix, name)))
    }

    /// Raw field value of one operand. Constants come back as their value, not an index.
    fn read_operand(&mut self, kind: OperandKind) -> JitResult<u32> {
        match kind {
            OperandKind::Gpr => {
                let name = self.read_identifier()?;
                parse_gpr_name(name)
                    .map(u32::from)
                    .ok_or_else(|| self.error(format!("unknown register '{}'", name)))
            }
            OperandKind::Fpr | OperandKind::Vec4 => self.read_indexed("f", 256).map(u32::from),
            OperandKind::VfpuCtrl => self.read_indexed("vc", 16).map(u32::from),
            OperandKind::Imm => {
                let value = self.read_number()?;
                if value > u8::MAX as u32 {
                    return Err(self.error(format!("immediate {} does not fit a byte", value)));
                }
                Ok(value)
            }
            OperandKind::Const => self.read_number(),
            OperandKind::None => Ok(0),
        }
    }

    fn parse_inst(&mut self, name: &str) -> JitResult<()> {
        let op = Op::from_name(name).ok_or_else(|| self.error(format!("unknown op '{}'", name)))?;
        let meta = metadata(op);

        let mut raw = [0u32; 3];
        let mut first = true;
        for (i, kind) in meta.kinds.iter().enumerate() {
            if *kind == OperandKind::None {
                continue;
            }
            if !first {
                self.expect(',')?;
            }
            first = false;
            raw[i] = self.read_operand(*kind)?;
        }

        if self.blocks.is_empty() {
            self.blocks.push((0, IrProgram::new()));
        }
        let last = self.blocks.len() - 1;
        let program = &mut self.blocks[last].1;

        let mut fields = [0u8; 3];
        for i in 0..3 {
            fields[i] = if meta.kinds[i] == OperandKind::Const {
                program.add_constant(raw[i])?
            } else {
                raw[i] as u8
            };
        }
        program.push(IrInst::new(op, fields[0], fields[1], fields[2]));
        Ok(())
    }
}

/// Write one instruction in text form, resolving constants through `constants`.
pub fn format_inst(inst: &IrInst, constants: &[u32]) -> String {
    let meta = inst.meta();
    let fields = [inst.dest, inst.src1, inst.src2];
    let operands: Vec<String> = meta
        .kinds
        .iter()
        .zip(fields)
        .filter(|(kind, _)| **kind != OperandKind::None)
        .map(|(kind, value)| match kind {
            OperandKind::Gpr => gpr_name(value),
            OperandKind::Fpr | OperandKind::Vec4 => format!("f{}", value),
            OperandKind::VfpuCtrl => format!("vc{}", value),
            OperandKind::Imm => value.to_string(),
            OperandKind::Const => match constants.get(value as usize) {
                Some(c) => format!("{:#x}", c),
                None => format!("<bad const {}>", value),
            },
            OperandKind::None => String::new(),
        })
        .collect();

    if operands.is_empty() {
        meta.name.to_string()
    } else {
        format!("{} {}", meta.name, operands.join(", "))
    }
}

impl fmt::Display for IrProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for inst in self.insts() {
            writeln!(f, "{}", format_inst(inst, self.constants().as_slice()))?;
        }
        Ok(())
    }
}

/// Print a program; the output parses back with [`parse_program`].
pub fn print_program(program: &IrProgram) -> String {
    program.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::regs::TEMP0;

    #[test]
    fn test_parse_simple() {
        let prog = parse_program(
            "; comment line\n\
             SetConst r2, 100\n\
             AddConst r1, r2, 0x5   ; trailing comment\n\
             Store32 r1, r2, 0\n\
             ExitToConst 0x08800010\n",
        )
        .unwrap();
        assert_eq!(prog.len(), 4);
        assert_eq!(prog.insts()[1].op, Op::AddConst);
        assert_eq!(prog.constant_of(&prog.insts()[1]), Some(5));
        assert_eq!(prog.constant_of(&prog.insts()[3]), Some(0x0880_0010));
        // 100, 5, 0, 0x08800010
        assert_eq!(prog.constants().len(), 4);
    }

    #[test]
    fn test_print_parse_roundtrip() {
        let mut prog = IrProgram::new();
        prog.set_const(TEMP0, 0xdead_beef).unwrap();
        prog.append(Op::Mult, 0, 4, 5);
        prog.append(Op::MfLo, 6, 0, 0);
        prog.append(Op::FCmp, 2, 3, 4);
        prog.append(Op::Vec4Shuffle, 32, 36, 0x1b);
        prog.append(Op::SetCtrlVFPUReg, 3, 7, 0);
        prog.append(Op::ShlImm, 1, 2, 31);
        prog.append(Op::ExitToPC, 0, 0, 0);

        let text = print_program(&prog);
        assert!(text.contains("SetConst temp0, 0xdeadbeef"));
        assert!(text.contains("Mult r4, r5"));
        assert!(text.contains("SetCtrlVFPUReg vc3, r7"));
        assert_eq!(parse_program(&text).unwrap(), prog);
    }

    #[test]
    fn test_float_and_negative_literals() {
        let prog = parse_program("SetConstF f3, 1.5\nAddConst r1, r1, -1\n").unwrap();
        assert_eq!(prog.constant_of(&prog.insts()[0]), Some(1.5f32.to_bits()));
        assert_eq!(prog.constant_of(&prog.insts()[1]), Some(u32::MAX));
    }

    #[test]
    fn test_blocks() {
        let blocks = parse_module(
            "block 0x100:\n  SetConst r1, 1\n  ExitToConst 0x200\n\
             block 0x200:\n  ExitToPC\n",
        )
        .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, 0x100);
        assert_eq!(blocks[1].1.insts()[0].op, Op::ExitToPC);
        assert!(parse_program("block 0x1:\nExitToPC\nblock 0x2:\nExitToPC\n").is_err());
    }

    #[test]
    fn test_errors_report_line() {
        let err = parse_program("SetConst r1, 1\nBogus r1\n").unwrap_err();
        assert!(matches!(err, JitError::Parse { line: 2, .. }));
        let err = parse_program("Add r1, r2\n").unwrap_err();
        assert!(matches!(err, JitError::Parse { line: 1, .. }));
        let err = parse_program("Mov r1, r40\n").unwrap_err();
        assert!(err.to_string().contains("unknown register"));
    }
}
