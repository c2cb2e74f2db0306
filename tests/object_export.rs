//! Compiled blocks written as ELF objects and read back with the `object` crate.

use bumpalo::Bump;
use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use irjit::core::objfile::block_symbol_name;
use irjit::driver::{run_module, DriverOptions};
use irjit::ir::parse_module;
use irjit::jit::{compile_program, optimize};
use irjit::{JitOptions, JitSession, TargetArch};
use object::{Architecture, File, Object, ObjectSection, ObjectSymbol, SymbolKind};
use std::path::PathBuf;

const MODULE: &str = "\
block 0x08804000:
  SetConst r2, 0x100
  AddConst r1, r2, 5
  Store32 r1, r2, 0
  ExitToConst 0x08804100

block 0x08804100:
  Add r3, r1, r2
  FMul f2, f0, f1
  ExitToConstIfEq 0x08804000, r3, r0
  ExitToConst 0x08804200
";

fn temp_object_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("irjit-{}-{}.o", tag, std::process::id()))
}

/// Code the driver would produce for every block of `MODULE`.
fn compiled_blocks(target: TargetArch) -> Vec<(u32, Vec<u8>)> {
    let options = JitOptions::for_target(target);
    parse_module(MODULE)
        .unwrap()
        .iter()
        .map(|(addr, program)| {
            let arena = Bump::new();
            let session = JitSession::new(&arena);
            let optimized = optimize(program, &options, &session).unwrap();
            let block = compile_program(&optimized, &options, &session).unwrap();
            (*addr, block.code)
        })
        .collect()
}

fn emit(target: TargetArch, tag: &str) -> Vec<u8> {
    let path = temp_object_path(tag);
    let options = DriverOptions {
        target,
        emit_obj: Some(path.clone()),
        ..DriverOptions::default()
    };
    let report = run_module(MODULE, &options).unwrap();
    assert!(report.contains("wrote 2 blocks"), "{}", report);
    let bytes = std::fs::read(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    bytes
}

fn check_object(bytes: &[u8], target: TargetArch, architecture: Architecture) {
    let file = File::parse(bytes).unwrap();
    assert_eq!(file.architecture(), architecture);
    let text = file.section_by_name(".text").unwrap();
    let data = text.data().unwrap();

    for (addr, code) in compiled_blocks(target) {
        let name = block_symbol_name(addr);
        let symbol = file
            .symbol_by_name(&name)
            .unwrap_or_else(|| panic!("missing symbol {}", name));
        assert_eq!(symbol.kind(), SymbolKind::Text);
        assert_eq!(symbol.size(), code.len() as u64);
        assert_eq!(symbol.address() % 16, 0);
        let start = symbol.address() as usize;
        assert_eq!(&data[start..start + code.len()], &code[..], "{}", name);
    }
}

#[test]
fn test_x64_object_round_trip() {
    let bytes = emit(TargetArch::X64, "x64");
    check_object(&bytes, TargetArch::X64, Architecture::X86_64);
}

#[test]
fn test_arm64_object_round_trip() {
    let bytes = emit(TargetArch::Arm64, "arm64");
    check_object(&bytes, TargetArch::Arm64, Architecture::Aarch64);
}

#[test]
fn test_x64_blocks_decode_cleanly() {
    for (addr, code) in compiled_blocks(TargetArch::X64) {
        let mut decoder = Decoder::with_ip(64, &code, 0, DecoderOptions::NONE);
        let mut mnemonics = Vec::new();
        while decoder.can_decode() {
            let inst = decoder.decode();
            assert!(!inst.is_invalid(), "block {:#x}: invalid instruction", addr);
            mnemonics.push(inst.mnemonic());
        }
        assert_eq!(mnemonics.first(), Some(&Mnemonic::Push), "block {:#x}", addr);
        assert_eq!(mnemonics.last(), Some(&Mnemonic::Ret), "block {:#x}", addr);
    }

    let (_, second) = &compiled_blocks(TargetArch::X64)[1];
    let mut decoder = Decoder::with_ip(64, second, 0, DecoderOptions::NONE);
    let calls = decoder
        .iter()
        .filter(|inst| inst.mnemonic() == Mnemonic::Call)
        .count();
    assert_eq!(calls, 1, "FMul should be the only interpreter call");
}
