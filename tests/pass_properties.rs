//! Properties every optimization pass must keep: running a pass on its own output changes
//! nothing, the guest-visible result of a block is preserved, and constant pools stay free of
//! duplicates.

use bumpalo::Bump;
use hashbrown::HashSet;
use irjit::interp::interpret_program;
use irjit::ir::regs::{is_temp, TOTAL_IR_REGS};
use irjit::ir::{parse_program, IrProgram};
use irjit::passes::{PassContext, PassKind, PassOptions, Pipeline};
use irjit::{GuestMemory, GuestState, JitSession, TargetArch};
use std::fmt::Write;

const PROGRAMS: &[&str] = &[
    "SetConst r2, 100\nAdd r1, r2, r3\nStore32 r1, r2, 4\nLoad32 r5, r1, 0\n\
     Add r6, r6, r5\nExitToConstIfNeq 0x10, r5, r6\nExitToConst 0x20\n",
    "SetConst temp0, 1\nAdd temp1, temp0, r2\nMov r3, temp1\nSetConst temp1, 9\n\
     SetConst r5, 1\nSetConst r5, 2\nExitToConst 0x10\n",
    "Load8 r3, r4, 0x10\nAndConst r3, r3, 0xff\nLoad16 r5, r4, 0x20\nAndConst r6, r5, 0xffff\n\
     Load16Ext r7, r4, 0x22\nAndConst r7, r7, 0xff\nExitToConst 0x40\n",
    "Add r3, r1, r2\nSub r4, r2, r1\nXor r5, r1, r1\nFAdd f2, f0, f1\nVec4Add f8, f0, f4\n\
     SltU r6, r1, r2\nExitToConst 0x80\n",
    "FMovToGPR r3, f0\nFMovFromGPR f1, r3\nFMovToGPR r4, f2\nFMovFromGPR f2, r4\n\
     FMovToGPR r5, f6\nMov r5, r0\nFMovFromGPR f7, r5\nExitToConst 0x90\n",
    "Store32 r2, r1, 0x8\nLoad32 r2, r1, 0x8\nStore16 r3, r1, 0xc\nLoad16 r4, r1, 0xc\n\
     StoreFloat f1, r1, 0x10\nLoadFloat f1, r1, 0x10\nExitToConst 0xa0\n",
    "SetConst r1, 0x200\nShlImm r2, r1, 4\nOrConst r3, r2, 0x7\nSub r4, r3, r3\n\
     SltConst r5, r4, 1\nSetConst r6, 3\nShl r7, r1, r6\nAdd r8, r0, r9\n\
     SetConst r10, 0x08804000\nExitToReg r10\n",
    "Downcount 0x20\nSetConst r4, 0x1f\nAnd r5, r4, r3\nMult r5, r4\nMfLo r6\n\
     ExitToConstIfEq 0x100, r6, r0\nSetPCConst 0x200\nSyscall 0x1c\n",
];

struct XorShift(u32);

impl XorShift {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        self.next() as usize % n
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        items[self.below(items.len())]
    }

    fn constant(&mut self) -> u32 {
        match self.below(6) {
            0 => 0,
            1 => 1,
            2 => 0x1f,
            3 => 0xff,
            4 => 0x8000_0000,
            _ => self.next(),
        }
    }
}

/// Guest memory is only addressed through r1, which nothing in a random block writes.
const RANDOM_BASE: u32 = 0x200;
const RANDOM_DESTS: &[&str] = &["r2", "r3", "r4", "r5", "r6", "temp0", "temp1", "temp2"];
const RANDOM_SOURCES: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "temp0", "temp1", "temp2",
];

/// Straight-line integer block of 4 to 23 instructions ending in an exit.
fn random_program(rng: &mut XorShift) -> IrProgram {
    let mut text = String::new();
    for _ in 0..4 + rng.below(20) {
        let d = rng.pick(RANDOM_DESTS);
        let a = rng.pick(RANDOM_SOURCES);
        let b = rng.pick(RANDOM_SOURCES);
        let offset = rng.below(16) * 4;
        let line = match rng.below(14) {
            0 | 1 => format!("SetConst {}, {:#x}", d, rng.constant()),
            2 | 3 => {
                let op = rng.pick(&["Add", "Sub", "And", "Or", "Xor", "Slt", "SltU"]);
                format!("{} {}, {}, {}", op, d, a, b)
            }
            4 => {
                let op = rng.pick(&["Shl", "Shr", "Sar", "Ror"]);
                format!("{} {}, {}, {}", op, d, a, b)
            }
            5 => {
                let op = rng.pick(&[
                    "AddConst", "SubConst", "AndConst", "OrConst", "XorConst", "SltConst",
                    "SltUConst",
                ]);
                format!("{} {}, {}, {:#x}", op, d, a, rng.constant())
            }
            6 => {
                let op = rng.pick(&["ShlImm", "ShrImm", "SarImm", "RorImm"]);
                format!("{} {}, {}, {}", op, d, a, rng.below(32))
            }
            7 => {
                let op = rng.pick(&["Neg", "Not", "BSwap32", "Ext8to32", "Clz", "Mov"]);
                format!("{} {}, {}", op, d, a)
            }
            8 => {
                let op = rng.pick(&["Load32", "Load16", "Load16Ext", "Load8"]);
                format!("{} {}, r1, {:#x}\nAndConst {}, {}, 0xff", op, d, offset, d, d)
            }
            9 => {
                let op = rng.pick(&["Store32", "Store16", "Store8"]);
                format!("{} {}, r1, {:#x}", op, a, offset)
            }
            10 => format!("Store32 {}, r1, {:#x}\nLoad32 {}, r1, {:#x}", d, offset, d, offset),
            11 => format!("Mult {}, {}\nMfLo {}", a, b, d),
            12 => format!("ExitToConstIfEq 0x08804100, {}, {}", a, b),
            _ => {
                let op = rng.pick(&["ExitToConstIfLtZ", "ExitToConstIfGeZ", "ExitToConstIfGtZ"]);
                format!("{} 0x08804200, {}", op, a)
            }
        };
        writeln!(text, "{}", line).unwrap();
    }
    text.push_str("ExitToConst 0x08804000\n");
    parse_program(&text).unwrap_or_else(|e| panic!("{}\n{}", e, text))
}

fn random_inputs(rng: &mut XorShift) -> Vec<GuestState> {
    (0..3)
        .map(|_| {
            let mut state = GuestState::new();
            state.regs[1] = RANDOM_BASE;
            for reg in 2..=6 {
                state.regs[reg] = rng.constant();
            }
            state
        })
        .collect()
}

fn run_pass(kind: PassKind, program: &IrProgram) -> IrProgram {
    let arena = Bump::new();
    let session = JitSession::new(&arena);
    let cx = PassContext::new(&session, PassOptions::default());
    let (out, _) = (kind.function())(program, &cx).unwrap();
    out
}

fn run_pipeline(pipeline: &Pipeline, program: &IrProgram) -> IrProgram {
    let arena = Bump::new();
    let session = JitSession::new(&arena);
    pipeline
        .run(program, &session, PassOptions::default())
        .unwrap()
}

fn inputs() -> Vec<GuestState> {
    [(0u32, 0u32), (0x100, 7), (0x204, 0xffff_fff0), (0x80, 0x8000_0000)]
        .iter()
        .map(|&(base, value)| {
            let mut state = GuestState::new();
            state.regs[1] = base;
            state.regs[2] = value;
            state.regs[3] = (value.rotate_left(7) & 0x3f) * 4;
            state.regs[4] = base + 4;
            state.regs[6] = value ^ 0x5555;
            state.regs[9] = 0x1234;
            state.set_f(0, 1.25);
            state.set_f(1, -3.5);
            state.set_f(6, 0.75);
            state.downcount = 500;
            state
        })
        .collect()
}

/// Interpret both programs on every input and compare the guest-visible results.
fn assert_equivalent(label: &str, before: &IrProgram, after: &IrProgram) {
    assert_equivalent_on(label, before, after, &inputs());
}

fn assert_equivalent_on(
    label: &str,
    before: &IrProgram,
    after: &IrProgram,
    inputs: &[GuestState],
) {
    for input in inputs {
        let mut expected = input.clone();
        let mut expected_memory = GuestMemory::new(0x1000);
        let expected_exit =
            interpret_program(before, &mut expected, &mut expected_memory).unwrap();

        let mut actual = input.clone();
        let mut actual_memory = GuestMemory::new(0x1000);
        let actual_exit = interpret_program(after, &mut actual, &mut actual_memory).unwrap();

        assert_eq!(expected_exit, actual_exit, "{}: exit", label);
        for slot in (0..TOTAL_IR_REGS).filter(|slot| !is_temp(*slot as u8)) {
            assert_eq!(expected.regs[slot], actual.regs[slot], "{}: slot {}", label, slot);
        }
        assert_eq!(expected.pc, actual.pc, "{}: pc", label);
        assert_eq!(expected.downcount, actual.downcount, "{}: downcount", label);
        assert_eq!(expected.syscall, actual.syscall, "{}: syscall", label);
        assert!(
            expected_memory.as_slice() == actual_memory.as_slice(),
            "{}: memory",
            label
        );
    }
}

fn assert_pool_distinct(label: &str, program: &IrProgram) {
    let pool = program.constants().as_slice();
    let distinct: HashSet<u32> = pool.iter().copied().collect();
    assert_eq!(distinct.len(), pool.len(), "{}: duplicate constants {:?}", label, pool);
    for inst in program.insts() {
        if let Some(index) = inst.constant_index() {
            assert!((index as usize) < pool.len(), "{}: dangling constant", label);
        }
    }
}

#[test]
fn test_every_pass_is_idempotent() {
    for (i, text) in PROGRAMS.iter().enumerate() {
        let program = parse_program(text).unwrap();
        for kind in PassKind::ALL {
            let once = run_pass(kind, &program);
            let twice = run_pass(kind, &once);
            assert_eq!(once, twice, "{} on program {}", kind.name(), i);
        }
    }
}

#[test]
fn test_every_pass_preserves_results() {
    for (i, text) in PROGRAMS.iter().enumerate() {
        let program = parse_program(text).unwrap();
        for kind in PassKind::ALL {
            let out = run_pass(kind, &program);
            assert_equivalent(&format!("{} on program {}", kind.name(), i), &program, &out);
        }
    }
}

#[test]
fn test_default_pipelines_preserve_results() {
    for target in [TargetArch::Arm64, TargetArch::X64] {
        let pipeline = Pipeline::default_for(target);
        for (i, text) in PROGRAMS.iter().enumerate() {
            let program = parse_program(text).unwrap();
            let out = run_pipeline(&pipeline, &program);
            let label = format!("{} pipeline on program {}", target.name(), i);
            assert_equivalent(&label, &program, &out);
            assert!(out.len() <= program.len() * 2, "{}: output grew", label);
        }
    }
}

#[test]
fn test_constant_pools_stay_deduplicated() {
    let program = parse_program(
        "SetConst r1, 0x1234\nSetConst r2, 0x1234\nAddConst r3, r1, 0x1234\n\
         AddConst r4, r2, 4\nStore32 r4, r3, 4\nExitToConst 0x1234\n",
    )
    .unwrap();
    assert_eq!(program.constants().as_slice(), &[0x1234, 4]);
    assert_pool_distinct("parsed", &program);

    for kind in PassKind::ALL {
        assert_pool_distinct(kind.name(), &run_pass(kind, &program));
    }
    for text in PROGRAMS {
        let program = parse_program(text).unwrap();
        let out = run_pipeline(&Pipeline::default_for(TargetArch::X64), &program);
        assert_pool_distinct(text, &out);
    }
}

#[test]
fn test_constant_folding_through_pipeline() {
    let program = parse_program(
        "SetConst r1, 0x10\nAddConst r2, r1, 0x20\nShlImm r3, r2, 2\nStore32 r3, r1, 0\n\
         ExitToConst 0x08804000\n",
    )
    .unwrap();
    let out = run_pipeline(&Pipeline::default_for(TargetArch::Arm64), &program);
    let text = out.to_string();
    assert!(text.contains("SetConst r3, 0xc0"), "{}", text);
    assert!(!text.contains("AddConst"), "{}", text);
    assert!(!text.contains("ShlImm"), "{}", text);
    assert_equivalent("folding", &program, &out);
}

#[test]
fn test_pipeline_from_names() {
    let pipeline = Pipeline::from_names("const-prop, purge-temps,three-op").unwrap();
    assert_eq!(
        pipeline.passes(),
        &[PassKind::ConstProp, PassKind::PurgeTemps, PassKind::ThreeOpToTwoOp]
    );
    assert!(Pipeline::from_names("const-prop,bogus").is_err());
    assert!(Pipeline::from_names("").unwrap().is_empty());
}

#[test]
fn test_random_blocks_every_pass_is_idempotent() {
    let mut rng = XorShift(0x9e37_79b9);
    for case in 0..2000 {
        let program = random_program(&mut rng);
        for kind in PassKind::ALL {
            let once = run_pass(kind, &program);
            let twice = run_pass(kind, &once);
            assert_eq!(
                once, twice,
                "{} on case {}:\n{}\nfirst:\n{}\nsecond:\n{}",
                kind.name(),
                case,
                program,
                once,
                twice
            );
        }
    }
}

#[test]
fn test_random_blocks_keep_their_results() {
    let mut rng = XorShift(0x2545_f491);
    for case in 0..1000 {
        let program = random_program(&mut rng);
        let inputs = random_inputs(&mut rng);
        for target in [TargetArch::Arm64, TargetArch::X64] {
            let out = run_pipeline(&Pipeline::default_for(target), &program);
            let label = format!(
                "{} pipeline on case {}:\n{}\n->\n{}",
                target.name(),
                case,
                program,
                out
            );
            assert_equivalent_on(&label, &program, &out, &inputs);
        }
    }
}

#[test]
fn test_overlapping_vector_groups_keep_their_results() {
    // Each second source overlaps its destination group by two lanes.
    let program =
        parse_program("Vec4Add f8, f4, f10\nVec4Sub f20, f16, f22\nExitToConst 0x100\n").unwrap();
    let mut input = GuestState::new();
    for lane in 0..28u8 {
        input.set_f(lane, lane as f32);
    }
    for target in [TargetArch::Arm64, TargetArch::X64] {
        let out = run_pipeline(&Pipeline::default_for(target), &program);
        assert_eq!(out.len(), program.len(), "{}:\n{}", target.name(), out);
        assert_equivalent_on(target.name(), &program, &out, &[input.clone()]);
    }
}
