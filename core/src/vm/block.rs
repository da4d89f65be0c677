//! Instruction blocks. Emitted code is collected into a tree of blocks (one
//! implicit root plus one block per procedure); each block owns its
//! instructions, the labels defined inside it, the unresolved label
//! references it produced, and a trivial register allocator per bank. The
//! tree itself lives in an arena owned by the [Assembler](super::Assembler),
//! with blocks referring to each other by index.

use crate::id::{IdPool, LabelRefId};
use crate::vm::instruction::{Instruction, OpCode, OpSize, Operand};
use std::collections::HashMap;

/// A point in the code that can be branched to. The address is assigned by
/// the assembler during layout.
#[derive(Clone, Debug)]
pub struct Label {
    name: String,
    address: u64,
}

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn set_address(&mut self, address: u64) {
        self.address = address;
    }
}

/// A forward reference to a label that may not exist yet. The assembler
/// links it to the target's byte address once layout is complete.
#[derive(Clone, Debug)]
pub struct LabelRef {
    pub id: LabelRefId,
    pub name: String,
    pub resolved: Option<u64>,
}

/// Tracks which registers of one bank are in use. Allocation always picks
/// the smallest free register; exhaustion is a fatal emitter error surfaced
/// by the caller as `P052`.
#[derive(Clone, Debug)]
pub struct RegisterAllocator {
    available: Vec<u8>,
    used: Vec<u8>,
}

impl RegisterAllocator {
    pub fn new() -> Self {
        let mut allocator = Self {
            available: Vec::with_capacity(64),
            used: Vec::new(),
        };
        allocator.reset();
        allocator
    }

    pub fn reset(&mut self) {
        self.used.clear();
        self.available.clear();
        for reg in (0..64).rev() {
            self.available.push(reg);
        }
    }

    pub fn allocate(&mut self) -> Option<u8> {
        let reg = self.available.pop()?;
        self.used.push(reg);
        Some(reg)
    }

    pub fn free(&mut self, reg: u8) {
        if let Some(index) = self.used.iter().position(|used| *used == reg) {
            self.used.remove(index);
            self.available.push(reg);
            self.available.sort_unstable_by(|a, b| b.cmp(a));
        }
    }

    pub fn used(&self) -> &[u8] {
        &self.used
    }
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a block is the implicit module-level stream or a procedure body.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InstructionBlockType {
    Implicit,
    Procedure,
}

/// A patch request: instruction `instruction`, operand `operand` must be
/// filled with the address of label ref `label_ref` after layout.
#[derive(Copy, Clone, Debug)]
pub struct LabelPatch {
    pub instruction: usize,
    pub operand: usize,
    pub label_ref: LabelRefId,
}

pub struct InstructionBlock {
    block_type: InstructionBlockType,
    parent: Option<usize>,
    children: Vec<usize>,
    instructions: Vec<Instruction>,
    labels: HashMap<String, Label>,
    label_to_instruction: HashMap<String, usize>,
    unresolved_labels: HashMap<LabelRefId, LabelRef>,
    label_to_unresolved_id: HashMap<String, LabelRefId>,
    patches: Vec<LabelPatch>,
    integer_registers: RegisterAllocator,
    float_registers: RegisterAllocator,
}

impl InstructionBlock {
    pub fn new(
        parent: Option<usize>,
        block_type: InstructionBlockType,
    ) -> Self {
        Self {
            block_type,
            parent,
            children: Vec::new(),
            instructions: Vec::new(),
            labels: HashMap::new(),
            label_to_instruction: HashMap::new(),
            unresolved_labels: HashMap::new(),
            label_to_unresolved_id: HashMap::new(),
            patches: Vec::new(),
            integer_registers: RegisterAllocator::new(),
            float_registers: RegisterAllocator::new(),
        }
    }

    pub fn block_type(&self) -> InstructionBlockType {
        self.block_type
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn add_child(&mut self, child: usize) {
        self.children.push(child);
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instructions_mut(&mut self) -> &mut [Instruction] {
        &mut self.instructions
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.labels.values()
    }

    pub fn label_instruction_index(&self, name: &str) -> Option<usize> {
        self.label_to_instruction.get(name).copied()
    }

    pub fn unresolved_labels(&self) -> &HashMap<LabelRefId, LabelRef> {
        &self.unresolved_labels
    }

    pub fn unresolved_labels_mut(
        &mut self,
    ) -> &mut HashMap<LabelRefId, LabelRef> {
        &mut self.unresolved_labels
    }

    pub fn patches(&self) -> &[LabelPatch] {
        &self.patches
    }

    pub fn set_label_address(&mut self, name: &str, address: u64) {
        if let Some(label) = self.labels.get_mut(name) {
            label.set_address(address);
        }
    }

    // --------------------------------------------------------------------
    // labels

    /// Define a label at the next instruction index.
    pub fn make_label(&mut self, name: impl Into<String>) -> &Label {
        let name = name.into();
        self.label_to_instruction
            .insert(name.clone(), self.instructions.len());
        self.labels
            .entry(name.clone())
            .or_insert_with(|| Label::new(name.clone()));
        &self.labels[&name]
    }

    /// Get (or create) the unresolved reference for a label name. Repeated
    /// references to the same name share one entry.
    pub fn make_unresolved_label_ref(
        &mut self,
        ids: &mut IdPool,
        name: impl Into<String>,
    ) -> LabelRefId {
        let name = name.into();
        if let Some(id) = self.label_to_unresolved_id.get(&name) {
            return *id;
        }
        let id = ids.next_label_ref_id();
        self.label_to_unresolved_id.insert(name.clone(), id);
        self.unresolved_labels.insert(
            id,
            LabelRef {
                id,
                name,
                resolved: None,
            },
        );
        id
    }

    fn push_label_operand(
        &mut self,
        ids: &mut IdPool,
        instruction: &mut Instruction,
        name: &str,
    ) {
        let label_ref = self.make_unresolved_label_ref(ids, name);
        let operand_index = instruction.operands.len();
        instruction.operands.push(Operand::integer_constant(0));
        self.patches.push(LabelPatch {
            instruction: self.instructions.len(),
            operand: operand_index,
            label_ref,
        });
    }

    fn push_inst(
        &mut self,
        op: OpCode,
        size: OpSize,
        operands: Vec<Operand>,
    ) {
        self.instructions.push(Instruction::new(op, size, operands));
    }

    // --------------------------------------------------------------------
    // register allocation

    pub fn allocate_ireg(&mut self) -> Option<u8> {
        self.integer_registers.allocate()
    }

    pub fn free_ireg(&mut self, reg: u8) {
        self.integer_registers.free(reg);
    }

    pub fn allocate_freg(&mut self) -> Option<u8> {
        self.float_registers.allocate()
    }

    pub fn free_freg(&mut self, reg: u8) {
        self.float_registers.free(reg);
    }

    // --------------------------------------------------------------------
    // simple instructions

    pub fn nop(&mut self) {
        self.push_inst(OpCode::Nop, OpSize::None, vec![]);
    }

    pub fn rts(&mut self) {
        self.push_inst(OpCode::Rts, OpSize::None, vec![]);
    }

    pub fn dup(&mut self) {
        self.push_inst(OpCode::Dup, OpSize::Qword, vec![]);
    }

    pub fn exit(&mut self) {
        self.push_inst(OpCode::Exit, OpSize::None, vec![]);
    }

    pub fn swi(&mut self, index: u8) {
        self.push_inst(
            OpCode::Swi,
            OpSize::Byte,
            vec![Operand::integer_constant(u64::from(index))],
        );
    }

    pub fn trap(&mut self, index: u8) {
        self.push_inst(
            OpCode::Trap,
            OpSize::Byte,
            vec![Operand::integer_constant(u64::from(index))],
        );
    }

    // --------------------------------------------------------------------
    // data movement

    pub fn load_to_ireg(
        &mut self,
        size: OpSize,
        dest_reg: u8,
        address_reg: u8,
        offset: i64,
    ) {
        let mut operands = vec![
            Operand::integer_register(dest_reg),
            Operand::integer_register(address_reg),
        ];
        if offset != 0 {
            let operand =
                Operand::integer_constant(offset.unsigned_abs());
            operands.push(if offset < 0 {
                operand.negative()
            } else {
                operand
            });
        }
        self.push_inst(OpCode::Load, size, operands);
    }

    pub fn store_from_ireg(
        &mut self,
        size: OpSize,
        address_reg: u8,
        src_reg: u8,
        offset: i64,
    ) {
        let mut operands = vec![
            Operand::integer_register(address_reg),
            Operand::integer_register(src_reg),
        ];
        if offset != 0 {
            let operand =
                Operand::integer_constant(offset.unsigned_abs());
            operands.push(if offset < 0 {
                operand.negative()
            } else {
                operand
            });
        }
        self.push_inst(OpCode::Store, size, operands);
    }

    pub fn move_constant_to_ireg(
        &mut self,
        size: OpSize,
        dest_reg: u8,
        value: u64,
    ) {
        self.push_inst(
            OpCode::Move,
            size,
            vec![
                Operand::integer_register(dest_reg),
                Operand::integer_constant(value),
            ],
        );
    }

    pub fn move_constant_to_freg(
        &mut self,
        size: OpSize,
        dest_reg: u8,
        value: f64,
    ) {
        self.push_inst(
            OpCode::Move,
            size,
            vec![
                Operand::float_register(dest_reg),
                Operand::float_constant(value),
            ],
        );
    }

    pub fn move_ireg_to_ireg(&mut self, dest_reg: u8, src_reg: u8) {
        self.move_sized_ireg_to_ireg(OpSize::Qword, dest_reg, src_reg);
    }

    pub fn move_sized_ireg_to_ireg(
        &mut self,
        size: OpSize,
        dest_reg: u8,
        src_reg: u8,
    ) {
        self.push_inst(
            OpCode::Move,
            size,
            vec![
                Operand::integer_register(dest_reg),
                Operand::integer_register(src_reg),
            ],
        );
    }

    /// Move a label's final address into a register; patched at assembly.
    pub fn move_label_to_ireg(
        &mut self,
        ids: &mut IdPool,
        dest_reg: u8,
        label_name: &str,
    ) {
        let mut instruction = Instruction::new(
            OpCode::Move,
            OpSize::Qword,
            vec![Operand::integer_register(dest_reg)],
        );
        self.push_label_operand(ids, &mut instruction, label_name);
        self.instructions.push(instruction);
    }

    // --------------------------------------------------------------------
    // stack

    pub fn push_constant(&mut self, size: OpSize, value: u64) {
        self.push_inst(
            OpCode::Push,
            size,
            vec![Operand::integer_constant(value)],
        );
    }

    pub fn push_float_constant(&mut self, size: OpSize, value: f64) {
        self.push_inst(OpCode::Push, size, vec![Operand::float_constant(value)]);
    }

    pub fn push_ireg(&mut self, size: OpSize, reg: u8) {
        self.push_inst(OpCode::Push, size, vec![Operand::integer_register(reg)]);
    }

    pub fn push_freg(&mut self, size: OpSize, reg: u8) {
        self.push_inst(OpCode::Push, size, vec![Operand::float_register(reg)]);
    }

    pub fn pop_ireg(&mut self, size: OpSize, reg: u8) {
        self.push_inst(OpCode::Pop, size, vec![Operand::integer_register(reg)]);
    }

    pub fn pop_freg(&mut self, size: OpSize, reg: u8) {
        self.push_inst(OpCode::Pop, size, vec![Operand::float_register(reg)]);
    }

    // --------------------------------------------------------------------
    // arithmetic & logic

    pub fn inc(&mut self, size: OpSize, reg: u8) {
        self.push_inst(OpCode::Inc, size, vec![Operand::integer_register(reg)]);
    }

    pub fn dec(&mut self, size: OpSize, reg: u8) {
        self.push_inst(OpCode::Dec, size, vec![Operand::integer_register(reg)]);
    }

    /// Three-operand ALU instruction over integer registers.
    pub fn alu_ireg(
        &mut self,
        op: OpCode,
        size: OpSize,
        dest_reg: u8,
        lhs_reg: u8,
        rhs_reg: u8,
    ) {
        self.push_inst(
            op,
            size,
            vec![
                Operand::integer_register(dest_reg),
                Operand::integer_register(lhs_reg),
                Operand::integer_register(rhs_reg),
            ],
        );
    }

    pub fn neg_ireg(&mut self, size: OpSize, dest_reg: u8, src_reg: u8) {
        self.push_inst(
            OpCode::Neg,
            size,
            vec![
                Operand::integer_register(dest_reg),
                Operand::integer_register(src_reg),
            ],
        );
    }

    pub fn not_ireg(&mut self, size: OpSize, dest_reg: u8, src_reg: u8) {
        self.push_inst(
            OpCode::Not,
            size,
            vec![
                Operand::integer_register(dest_reg),
                Operand::integer_register(src_reg),
            ],
        );
    }

    pub fn swap_ireg(&mut self, size: OpSize, dest_reg: u8, src_reg: u8) {
        self.push_inst(
            OpCode::Swap,
            size,
            vec![
                Operand::integer_register(dest_reg),
                Operand::integer_register(src_reg),
            ],
        );
    }

    pub fn cmp_ireg(&mut self, size: OpSize, lhs_reg: u8, rhs_reg: u8) {
        self.push_inst(
            OpCode::Cmp,
            size,
            vec![
                Operand::integer_register(lhs_reg),
                Operand::integer_register(rhs_reg),
            ],
        );
    }

    pub fn test_ireg(&mut self, size: OpSize, value_reg: u8, mask_reg: u8) {
        self.push_inst(
            OpCode::Test,
            size,
            vec![
                Operand::integer_register(value_reg),
                Operand::integer_register(mask_reg),
            ],
        );
    }

    pub fn setz(&mut self, reg: u8) {
        self.push_inst(
            OpCode::Setz,
            OpSize::Qword,
            vec![Operand::integer_register(reg)],
        );
    }

    pub fn setnz(&mut self, reg: u8) {
        self.push_inst(
            OpCode::Setnz,
            OpSize::Qword,
            vec![Operand::integer_register(reg)],
        );
    }

    // --------------------------------------------------------------------
    // heap

    pub fn alloc(&mut self, size: OpSize, dest_reg: u8, size_reg: u8) {
        self.push_inst(
            OpCode::Alloc,
            size,
            vec![
                Operand::integer_register(dest_reg),
                Operand::integer_register(size_reg),
            ],
        );
    }

    pub fn free(&mut self, address_reg: u8) {
        self.push_inst(
            OpCode::Free,
            OpSize::Qword,
            vec![Operand::integer_register(address_reg)],
        );
    }

    pub fn block_size(&mut self, dest_reg: u8, address_reg: u8) {
        self.push_inst(
            OpCode::Size,
            OpSize::Qword,
            vec![
                Operand::integer_register(dest_reg),
                Operand::integer_register(address_reg),
            ],
        );
    }

    pub fn copy(
        &mut self,
        size: OpSize,
        source_reg: u8,
        target_reg: u8,
        length_reg: u8,
    ) {
        self.push_inst(
            OpCode::Copy,
            size,
            vec![
                Operand::integer_register(source_reg),
                Operand::integer_register(target_reg),
                Operand::integer_register(length_reg),
            ],
        );
    }

    pub fn fill(
        &mut self,
        size: OpSize,
        value_reg: u8,
        address_reg: u8,
        length_reg: u8,
    ) {
        self.push_inst(
            OpCode::Fill,
            size,
            vec![
                Operand::integer_register(value_reg),
                Operand::integer_register(address_reg),
                Operand::integer_register(length_reg),
            ],
        );
    }

    // --------------------------------------------------------------------
    // branches & calls

    pub fn jump_direct(&mut self, ids: &mut IdPool, label_name: &str) {
        let mut instruction =
            Instruction::new(OpCode::Jmp, OpSize::Qword, vec![]);
        self.push_label_operand(ids, &mut instruction, label_name);
        self.instructions.push(instruction);
    }

    pub fn jump_indirect(&mut self, reg: u8) {
        self.push_inst(
            OpCode::Jmp,
            OpSize::Qword,
            vec![Operand::integer_register(reg)],
        );
    }

    pub fn call(&mut self, ids: &mut IdPool, label_name: &str) {
        let mut instruction =
            Instruction::new(OpCode::Jsr, OpSize::Qword, vec![]);
        self.push_label_operand(ids, &mut instruction, label_name);
        self.instructions.push(instruction);
    }

    /// Invoke a registered foreign function by its table index.
    pub fn call_foreign(&mut self, function_index: u64) {
        self.push_inst(
            OpCode::Ffi,
            OpSize::Qword,
            vec![Operand::integer_constant(function_index)],
        );
    }

    pub fn branch_if_zero(
        &mut self,
        ids: &mut IdPool,
        value_reg: u8,
        label_name: &str,
    ) {
        let mut instruction = Instruction::new(
            OpCode::Bz,
            OpSize::Qword,
            vec![Operand::integer_register(value_reg)],
        );
        self.push_label_operand(ids, &mut instruction, label_name);
        self.instructions.push(instruction);
    }

    pub fn branch_if_not_zero(
        &mut self,
        ids: &mut IdPool,
        value_reg: u8,
        label_name: &str,
    ) {
        let mut instruction = Instruction::new(
            OpCode::Bnz,
            OpSize::Qword,
            vec![Operand::integer_register(value_reg)],
        );
        self.push_label_operand(ids, &mut instruction, label_name);
        self.instructions.push(instruction);
    }

    /// Flag-driven conditional branch (`BEQ`, `BNE`, `BG`, `BGE`, `BL`,
    /// `BLE`).
    pub fn branch_on_flags(
        &mut self,
        ids: &mut IdPool,
        op: OpCode,
        label_name: &str,
    ) {
        let mut instruction = Instruction::new(op, OpSize::Qword, vec![]);
        self.push_label_operand(ids, &mut instruction, label_name);
        self.instructions.push(instruction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_allocation_is_smallest_first() {
        let mut allocator = RegisterAllocator::new();
        assert_eq!(allocator.allocate(), Some(0));
        assert_eq!(allocator.allocate(), Some(1));
        allocator.free(0);
        assert_eq!(allocator.allocate(), Some(0));
        assert_eq!(allocator.allocate(), Some(2));
    }

    #[test]
    fn test_register_exhaustion() {
        let mut allocator = RegisterAllocator::new();
        for _ in 0..64 {
            assert!(allocator.allocate().is_some());
        }
        assert_eq!(allocator.allocate(), None);
    }

    #[test]
    fn test_unresolved_refs_are_shared_by_name() {
        let mut ids = IdPool::new();
        let mut block =
            InstructionBlock::new(None, InstructionBlockType::Implicit);
        let first = block.make_unresolved_label_ref(&mut ids, "target");
        let second = block.make_unresolved_label_ref(&mut ids, "target");
        let third = block.make_unresolved_label_ref(&mut ids, "other");
        assert_eq!(first, second);
        assert_ne!(first, third);
        assert_eq!(block.unresolved_labels().len(), 2);
    }

    #[test]
    fn test_labels_track_instruction_index() {
        let mut ids = IdPool::new();
        let mut block =
            InstructionBlock::new(None, InstructionBlockType::Implicit);
        block.nop();
        block.make_label("after_nop");
        block.jump_direct(&mut ids, "after_nop");
        assert_eq!(block.label_instruction_index("after_nop"), Some(1));
        assert_eq!(block.patches().len(), 1);
    }
}
