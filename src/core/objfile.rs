// This module writes compiled blocks into a relocatable ELF object so that standard tools
// (objdump, llvm-objdump, gdb) can disassemble what the JIT produced. Every block becomes one
// function symbol named after its guest address, placed in .text at 16-byte alignment. The
// object carries no relocations: blocks reach the guest state and the interpreter fallback
// through registers and absolute addresses baked into the code, so the export is meant for
// inspection rather than linking.

//! ELF export of compiled blocks.

use super::config::TargetArch;
use super::error::{JitError, JitResult};
use log::debug;
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

/// Symbol name used for the block at `guest_addr`.
pub fn block_symbol_name(guest_addr: u32) -> String {
    format!("block_{:08x}", guest_addr)
}

fn architecture(target: TargetArch) -> Architecture {
    match target {
        TargetArch::Arm64 => Architecture::Aarch64,
        TargetArch::X64 => Architecture::X86_64,
    }
}

/// Collects blocks and writes them as one object file.
pub struct ObjectWriter {
    target: TargetArch,
    blocks: Vec<(String, Vec<u8>)>,
}

impl ObjectWriter {
    pub fn new(target: TargetArch) -> Self {
        Self {
            target,
            blocks: Vec::new(),
        }
    }

    /// Add the code of the block at `guest_addr`.
    pub fn add_block(&mut self, guest_addr: u32, code: &[u8]) {
        self.add_function(block_symbol_name(guest_addr), code);
    }

    /// Add code under an arbitrary symbol name.
    pub fn add_function(&mut self, name: String, code: &[u8]) {
        self.blocks.push((name, code.to_vec()));
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Serialize the object.
    pub fn write(&self) -> JitResult<Vec<u8>> {
        let mut obj = Object::new(
            BinaryFormat::Elf,
            architecture(self.target),
            Endianness::Little,
        );
        let text = obj.section_id(StandardSection::Text);

        for (name, code) in &self.blocks {
            let offset = obj.append_section_data(text, code, 16);
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: offset,
                size: code.len() as u64,
                kind: SymbolKind::Text,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
        }

        let bytes = obj.write().map_err(|e| JitError::Object {
            reason: e.to_string(),
        })?;
        debug!(
            "object: {} blocks, {} bytes for {}",
            self.blocks.len(),
            bytes.len(),
            self.target.name()
        );
        Ok(bytes)
    }
}
