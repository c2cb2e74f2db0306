//! Spill behaviour around the size of each target's allocatable register set.

use bumpalo::Bump;
use irjit::arm64::Arm64Target;
use irjit::core::{NativeTarget, RegBank};
use irjit::ir::IrProgram;
use irjit::jit::compile_program;
use irjit::passes::Pipeline;
use irjit::x64::X64Target;
use irjit::{JitOptions, JitSession, Op, TargetArch};

fn allocatable_gprs(target: TargetArch) -> usize {
    match target {
        TargetArch::Arm64 => Arm64Target::new().allocation_order(RegBank::Gpr, false).len(),
        TargetArch::X64 => X64Target::new()
            .unwrap()
            .allocation_order(RegBank::Gpr, false)
            .len(),
    }
}

/// Touch `live` guest registers, then read every one of them again so all stay live.
fn pressure_program(live: usize) -> IrProgram {
    let mut program = IrProgram::new();
    for reg in 1..=live as u8 {
        program
            .append_const(Op::AddConst, reg, reg, reg as u32)
            .unwrap();
    }
    for reg in 1..=live as u8 {
        let next = reg % live as u8 + 1;
        program.append(Op::Add, reg, reg, next);
    }
    program.exit_to_const(0x0880_4000).unwrap();
    program
}

fn spills(target: TargetArch, live: usize) -> usize {
    let options = JitOptions::for_target(target)
        .with_pipeline(Pipeline::none())
        .with_static_alloc(false);
    let arena = Bump::new();
    let session = JitSession::new(&arena);
    let block = compile_program(&pressure_program(live), &options, &session).unwrap();
    assert_eq!(session.stats().spills, block.spills);
    block.spills
}

#[test]
fn test_spills_start_past_register_count() {
    for target in [TargetArch::Arm64, TargetArch::X64] {
        let n = allocatable_gprs(target);
        assert!(n >= 8 && n < 31, "{}: {} registers", target.name(), n);

        assert_eq!(spills(target, n - 1), 0, "{}: N-1 live", target.name());
        assert_eq!(spills(target, n), 0, "{}: N live", target.name());
        assert!(spills(target, n + 1) > 0, "{}: N+1 live", target.name());
    }
}

#[test]
fn test_vector_pressure_spills_groups() {
    for target in [TargetArch::Arm64, TargetArch::X64] {
        let mut text = String::new();
        for group in 0..32 {
            text.push_str(&format!("Vec4Add f{}, f{}, f{}\n", group * 4, group * 4, 128));
        }
        for group in 0..32 {
            text.push_str(&format!("Vec4Mul f{}, f{}, f{}\n", group * 4, group * 4, group * 4));
        }
        text.push_str("ExitToConst 0x100\n");

        let program = irjit::ir::parse_program(&text).unwrap();
        let options = JitOptions::for_target(target).with_pipeline(Pipeline::none());
        let arena = Bump::new();
        let session = JitSession::new(&arena);
        let block = compile_program(&program, &options, &session).unwrap();
        assert!(block.spills > 0, "{}: no spills", target.name());
        assert_eq!(block.fallback_ops, 0, "{}", target.name());
    }
}
