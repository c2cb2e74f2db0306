// This module holds the IR data model proper: the flat four-byte instruction record, the
// de-duplicated constant pool and the program that pairs them. IrInst stores its opcode and
// three raw operand bytes and never lets callers guess what a byte means; every typed view
// (dest GPR, third source, constant index, the set of register slots read or written) goes
// through the opcode metadata table. ConstPool keeps insertion order for indexing and a
// hashbrown map for O(1) de-duplication. IrProgram is the unit every pass consumes and
// produces and that the interpreter and backends execute.

//! IR instructions, constants and programs.

use super::op::{metadata, Op, OpMeta, OperandKind, BARRIER, EXIT, SRC3, SRC3DST};
use super::regs::{fpr_slot, vfpu_ctrl_slot, IrReg};
use crate::core::error::{JitError, JitResult};
use hashbrown::HashMap;

/// Maximum pool size: constant indices are a single byte.
pub const MAX_CONSTANTS: usize = 256;

/// One IR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrInst {
    pub op: Op,
    pub dest: u8,
    pub src1: u8,
    pub src2: u8,
}

impl IrInst {
    pub const fn new(op: Op, dest: u8, src1: u8, src2: u8) -> Self {
        Self {
            op,
            dest,
            src1,
            src2,
        }
    }

    pub fn meta(&self) -> &'static OpMeta {
        metadata(self.op)
    }

    fn field(&self, index: usize) -> u8 {
        match index {
            0 => self.dest,
            1 => self.src1,
            _ => self.src2,
        }
    }

    /// Written integer register, if the dest field is a GPR output.
    pub fn dest_gpr(&self) -> Option<IrReg> {
        let meta = self.meta();
        if meta.kinds[0] == OperandKind::Gpr && !meta.has(SRC3) {
            Some(self.dest)
        } else {
            None
        }
    }

    /// Dest field read as a third source (stores, and read-modify-write ops).
    pub fn src3(&self) -> Option<u8> {
        if self.meta().flags & (SRC3 | SRC3DST) != 0 {
            Some(self.dest)
        } else {
            None
        }
    }

    /// Pool index of this instruction's constant operand.
    pub fn constant_index(&self) -> Option<u8> {
        let kinds = self.meta().kinds;
        (0..3)
            .find(|i| kinds[*i] == OperandKind::Const)
            .map(|i| self.field(i))
    }

    /// Rewrite the constant operand field.
    pub fn set_constant_index(&mut self, index: u8) {
        let kinds = self.meta().kinds;
        match (0..3).find(|i| kinds[*i] == OperandKind::Const) {
            Some(0) => self.dest = index,
            Some(1) => self.src1 = index,
            Some(_) => self.src2 = index,
            None => panic!("{} has no constant operand", self.op),
        }
    }

    pub fn is_exit(&self) -> bool {
        self.meta().has(EXIT)
    }

    pub fn is_barrier(&self) -> bool {
        self.meta().has(BARRIER)
    }

    /// Register slots read by this instruction, including implicit ones.
    pub fn read_slots(&self) -> Vec<usize> {
        let meta = self.meta();
        let mut slots = Vec::with_capacity(8);
        for i in 1..3 {
            push_slots(&mut slots, meta.kinds[i], self.field(i));
        }
        if meta.flags & (SRC3 | SRC3DST) != 0 {
            push_slots(&mut slots, meta.kinds[0], self.dest);
        }
        slots.extend(meta.implicit_reads.iter().map(|r| *r as usize));
        slots
    }

    /// Register slots written by this instruction, including implicit ones.
    pub fn write_slots(&self) -> Vec<usize> {
        let meta = self.meta();
        let mut slots = Vec::with_capacity(4);
        if !meta.has(SRC3) {
            push_slots(&mut slots, meta.kinds[0], self.dest);
        }
        slots.extend(meta.implicit_writes.iter().map(|r| *r as usize));
        slots
    }

    pub fn reads_slot(&self, slot: usize) -> bool {
        self.read_slots().contains(&slot)
    }

    pub fn writes_slot(&self, slot: usize) -> bool {
        self.write_slots().contains(&slot)
    }

    /// Whether the integer register is read, directly or implicitly.
    pub fn reads_gpr(&self, reg: IrReg) -> bool {
        self.reads_slot(reg as usize)
    }

    /// Whether two vector operands overlap without coinciding, or a scalar float operand
    /// sits inside a vector operand. Backends cannot keep such lanes in one register.
    pub fn mixes_vec4_lanes(&self) -> bool {
        let kinds = self.meta().kinds;
        let mut groups = Vec::with_capacity(3);
        let mut scalars = Vec::with_capacity(3);
        for (i, kind) in kinds.iter().enumerate() {
            match kind {
                OperandKind::Vec4 => groups.push(fpr_slot(self.field(i))),
                OperandKind::Fpr => scalars.push(fpr_slot(self.field(i))),
                _ => {}
            }
        }
        let partial = groups.iter().any(|a| {
            groups
                .iter()
                .any(|b| a != b && a.abs_diff(*b) < 4)
        });
        let inside = scalars
            .iter()
            .any(|s| groups.iter().any(|g| (*g..*g + 4).contains(s)));
        partial || inside
    }
}

fn push_slots(slots: &mut Vec<usize>, kind: OperandKind, value: u8) {
    match kind {
        OperandKind::Gpr => slots.push(value as usize),
        OperandKind::Fpr => slots.push(fpr_slot(value)),
        OperandKind::Vec4 => slots.extend((0..4).map(|i| fpr_slot(value) + i)),
        OperandKind::VfpuCtrl => slots.push(vfpu_ctrl_slot(value)),
        _ => {}
    }
}

/// Ordered, de-duplicated pool of 32-bit constants.
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    values: Vec<u32>,
    index: HashMap<u32, u8>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `value`, appending it if it is not present yet.
    pub fn add(&mut self, value: u32) -> JitResult<u8> {
        if let Some(&idx) = self.index.get(&value) {
            return Ok(idx);
        }
        if self.values.len() >= MAX_CONSTANTS {
            return Err(JitError::ConstantPoolFull { value });
        }
        let idx = self.values.len() as u8;
        self.values.push(value);
        self.index.insert(value, idx);
        Ok(idx)
    }

    pub fn get(&self, index: u8) -> u32 {
        self.values[index as usize]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.values
    }
}

impl PartialEq for ConstPool {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for ConstPool {}

/// An instruction list paired with its constant pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrProgram {
    insts: Vec<IrInst>,
    constants: ConstPool,
}

impl IrProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            insts: Vec::with_capacity(capacity),
            constants: ConstPool::new(),
        }
    }

    /// Append one instruction.
    pub fn append(&mut self, op: Op, dest: u8, src1: u8, src2: u8) {
        self.insts.push(IrInst::new(op, dest, src1, src2));
    }

    pub fn push(&mut self, inst: IrInst) {
        self.insts.push(inst);
    }

    /// De-duplicating constant insert.
    pub fn add_constant(&mut self, value: u32) -> JitResult<u8> {
        self.constants.add(value)
    }

    /// Resolved constant operand of `inst`.
    pub fn constant_of(&self, inst: &IrInst) -> Option<u32> {
        inst.constant_index().map(|idx| self.constants.get(idx))
    }

    /// Append `inst`, re-interning its constant (if any) from `source`.
    pub fn append_from(&mut self, inst: IrInst, source: &IrProgram) -> JitResult<()> {
        let mut inst = inst;
        if let Some(value) = source.constant_of(&inst) {
            inst.set_constant_index(self.add_constant(value)?);
        }
        self.insts.push(inst);
        Ok(())
    }

    pub fn insts(&self) -> &[IrInst] {
        &self.insts
    }

    pub fn constants(&self) -> &ConstPool {
        &self.constants
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    // Convenience writers used by frontends and tests.

    pub fn set_const(&mut self, dest: IrReg, value: u32) -> JitResult<()> {
        let c = self.add_constant(value)?;
        self.append(Op::SetConst, dest, c, 0);
        Ok(())
    }

    pub fn set_const_f(&mut self, dest: u8, value: f32) -> JitResult<()> {
        let c = self.add_constant(value.to_bits())?;
        self.append(Op::SetConstF, dest, c, 0);
        Ok(())
    }

    /// Append an op whose last field is a constant (AddConst, loads, stores, ...).
    pub fn append_const(&mut self, op: Op, dest: u8, src1: u8, value: u32) -> JitResult<()> {
        let c = self.add_constant(value)?;
        self.append(op, dest, src1, c);
        Ok(())
    }

    pub fn exit_to_const(&mut self, target: u32) -> JitResult<()> {
        let c = self.add_constant(target)?;
        self.append(Op::ExitToConst, c, 0, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::regs::{REG_HI, REG_LO};

    #[test]
    fn test_constant_dedup() {
        let mut prog = IrProgram::new();
        let a = prog.add_constant(0x1234).unwrap();
        for _ in 0..10 {
            assert_eq!(prog.add_constant(0x1234).unwrap(), a);
        }
        assert_eq!(prog.constants().len(), 1);
        let b = prog.add_constant(7).unwrap();
        assert_ne!(a, b);
        assert_eq!(prog.constants().get(a), 0x1234);
    }

    #[test]
    fn test_pool_full() {
        let mut pool = ConstPool::new();
        for v in 0..MAX_CONSTANTS as u32 {
            pool.add(v).unwrap();
        }
        assert!(pool.add(0).is_ok());
        assert!(matches!(
            pool.add(9999),
            Err(JitError::ConstantPoolFull { value: 9999 })
        ));
    }

    #[test]
    fn test_store_fields() {
        let mut prog = IrProgram::new();
        prog.append_const(Op::Store32, 5, 6, 16).unwrap();
        let inst = prog.insts()[0];
        assert_eq!(inst.dest_gpr(), None);
        assert_eq!(inst.src3(), Some(5));
        assert_eq!(prog.constant_of(&inst), Some(16));
        assert!(inst.reads_gpr(5));
        assert!(inst.reads_gpr(6));
        assert!(inst.write_slots().is_empty());
    }

    #[test]
    fn test_vec4_and_implicit_slots() {
        let add = IrInst::new(Op::Vec4Add, 64, 68, 72);
        assert_eq!(add.write_slots(), vec![96, 97, 98, 99]);
        assert!(add.reads_slot(100 + 3));

        let madd = IrInst::new(Op::Madd, 0, 1, 2);
        assert!(madd.reads_slot(REG_LO as usize));
        assert!(madd.writes_slot(REG_HI as usize));
    }

    #[test]
    fn test_vec4_lane_mixing() {
        assert!(!IrInst::new(Op::Vec4Add, 0, 0, 8).mixes_vec4_lanes());
        assert!(IrInst::new(Op::Vec4Add, 0, 2, 8).mixes_vec4_lanes());
        assert!(IrInst::new(Op::Vec4Scale, 0, 4, 5).mixes_vec4_lanes());
        assert!(!IrInst::new(Op::Vec4Scale, 0, 4, 8).mixes_vec4_lanes());
        assert!(IrInst::new(Op::Vec4Dot, 9, 8, 12).mixes_vec4_lanes());
        assert!(!IrInst::new(Op::FAdd, 1, 2, 3).mixes_vec4_lanes());
    }

    #[test]
    fn test_append_from_reinterns() {
        let mut a = IrProgram::new();
        a.add_constant(1).unwrap();
        a.append_const(Op::AddConst, 1, 2, 77).unwrap();
        let mut b = IrProgram::new();
        b.append_from(a.insts()[0], &a).unwrap();
        assert_eq!(b.constants().len(), 1);
        assert_eq!(b.constant_of(&b.insts()[0]), Some(77));
    }
}
