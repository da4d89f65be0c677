//! The terp: a register-based stack-machine interpreter. Executes encoded
//! instructions over a 64+64 register file and a linear heap whose tail
//! hosts a descending stack. The heap opens with two vector tables:
//!
//! ```text
//! [0   .. 128)  16 × u64 interrupt vectors
//! [128 .. 256)  16 × u64 heap vectors (top/bottom of stack, program start,
//!               free space start)
//! [256 .. bottom_of_stack)   program image (code + data)
//! [bottom_of_stack .. top_of_stack)  the stack, growing downward
//! ```

use crate::error::SessionResult;
use crate::source::SourceLocation;
use crate::vm::ffi::{FfiType, ForeignFunction, SharedLibrary};
use crate::vm::instruction::{
    Instruction, OpCode, OpSize, REGISTER_FP, REGISTER_FR, REGISTER_PC,
    REGISTER_SP, REGISTER_SR,
};
use bitflags::bitflags;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const INTERRUPT_VECTOR_TABLE_START: usize = 0;
pub const INTERRUPT_VECTOR_TABLE_SIZE: usize = 16;
pub const INTERRUPT_VECTOR_TABLE_END: usize =
    INTERRUPT_VECTOR_TABLE_START + INTERRUPT_VECTOR_TABLE_SIZE * 8;

pub const HEAP_VECTOR_TABLE_START: usize = INTERRUPT_VECTOR_TABLE_END;
pub const HEAP_VECTOR_TABLE_SIZE: usize = 16;
pub const HEAP_VECTOR_TABLE_END: usize =
    HEAP_VECTOR_TABLE_START + HEAP_VECTOR_TABLE_SIZE * 8;

/// First byte of the program image.
pub const PROGRAM_START: u64 = HEAP_VECTOR_TABLE_END as u64;

pub const TRAP_OUT_OF_MEMORY: u8 = 0xff;
pub const TRAP_INVALID_FFI_CALL: u8 = 0xfe;

/// Heap blocks smaller than the request by at most this much are used
/// whole instead of being split.
const SPLIT_THRESHOLD: u64 = 64;

bitflags! {
    /// The flag register's bits.
    pub struct StatusFlags: u64 {
        const ZERO     = 0b0000_0001;
        const CARRY    = 0b0000_0010;
        const OVERFLOW = 0b0000_0100;
        const NEGATIVE = 0b0000_1000;
        const EXTENDED = 0b0001_0000;
        const SUBTRACT = 0b0010_0000;
    }
}

/// The indexes into the heap vector table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum HeapVector {
    TopOfStack = 0,
    BottomOfStack = 1,
    ProgramStart = 2,
    FreeSpaceStart = 3,
}

/// The complete register file: 64 integer + 64 float registers plus the
/// special registers.
#[derive(Clone)]
pub struct RegisterFile {
    pub i: [u64; 64],
    pub f: [f64; 64],
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    pub fr: u64,
    pub sr: u64,
}

impl RegisterFile {
    fn new() -> Self {
        Self {
            i: [0; 64],
            f: [0.0; 64],
            pc: 0,
            sp: 0,
            fp: 0,
            fr: 0,
            sr: 0,
        }
    }

    pub fn flag(&self, flag: StatusFlags) -> bool {
        self.fr & flag.bits() != 0
    }

    pub fn set_flag(&mut self, flag: StatusFlags, value: bool) {
        if value {
            self.fr |= flag.bits();
        } else {
            self.fr &= !flag.bits();
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct HeapBlock {
    size: u64,
    allocated: bool,
}

/// The virtual machine.
pub struct Terp {
    heap_size: usize,
    stack_size: usize,
    heap: Vec<u8>,
    registers: RegisterFile,
    icache: HashMap<u64, (Instruction, usize)>,
    exited: bool,
    traps: HashMap<u8, Box<dyn FnMut(&mut RegisterFile)>>,
    blocks: BTreeMap<u64, HeapBlock>,
    foreign_functions: Vec<ForeignFunction>,
    shared_libraries: HashMap<PathBuf, SharedLibrary>,
}

impl Terp {
    pub fn new(heap_size: usize, stack_size: usize) -> Self {
        Self {
            heap_size,
            stack_size,
            heap: Vec::new(),
            registers: RegisterFile::new(),
            icache: HashMap::new(),
            exited: false,
            traps: HashMap::new(),
            blocks: BTreeMap::new(),
            foreign_functions: Vec::new(),
            shared_libraries: HashMap::new(),
        }
    }

    /// Allocate the heap and seed the heap vector table. Idempotent.
    pub fn initialize(&mut self, result: &mut SessionResult) -> bool {
        if !self.heap.is_empty() {
            return true;
        }
        self.heap = vec![0u8; self.heap_size];
        self.set_heap_vector(HeapVector::TopOfStack, self.heap_size as u64);
        self.set_heap_vector(
            HeapVector::BottomOfStack,
            (self.heap_size - self.stack_size) as u64,
        );
        self.set_heap_vector(HeapVector::ProgramStart, PROGRAM_START);
        self.reset();
        !result.is_failed()
    }

    pub fn reset(&mut self) {
        self.registers.pc = self.heap_vector(HeapVector::ProgramStart);
        self.registers.sp = self.heap_vector(HeapVector::TopOfStack);
        self.registers.fp = 0;
        self.registers.fr = 0;
        self.registers.sr = 0;
        self.registers.i = [0; 64];
        self.registers.f = [0.0; 64];
        self.icache.clear();
        self.blocks.clear();
        self.exited = false;
    }

    pub fn heap(&self) -> &[u8] {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut [u8] {
        &mut self.heap
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    pub fn register_file(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn register_file_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    // --------------------------------------------------------------------
    // raw heap access

    pub fn read_u64(&self, address: u64) -> u64 {
        let mut bytes = [0u8; 8];
        let start = address as usize;
        bytes.copy_from_slice(&self.heap[start..start + 8]);
        u64::from_le_bytes(bytes)
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        let start = address as usize;
        self.heap[start..start + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a value of the given op size, zero-extended to 64 bits.
    pub fn read_sized(&self, size: OpSize, address: u64) -> u64 {
        let start = address as usize;
        match size {
            OpSize::Byte => u64::from(self.heap[start]),
            OpSize::Word => {
                let mut bytes = [0u8; 2];
                bytes.copy_from_slice(&self.heap[start..start + 2]);
                u64::from(u16::from_le_bytes(bytes))
            }
            OpSize::Dword => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&self.heap[start..start + 4]);
                u64::from(u32::from_le_bytes(bytes))
            }
            _ => self.read_u64(address),
        }
    }

    /// Write the low bytes of `value` per the given op size.
    pub fn write_sized(&mut self, size: OpSize, address: u64, value: u64) {
        let start = address as usize;
        match size {
            OpSize::Byte => self.heap[start] = value as u8,
            OpSize::Word => self.heap[start..start + 2]
                .copy_from_slice(&(value as u16).to_le_bytes()),
            OpSize::Dword => self.heap[start..start + 4]
                .copy_from_slice(&(value as u32).to_le_bytes()),
            _ => self.write_u64(address, value),
        }
    }

    pub fn heap_vector(&self, vector: HeapVector) -> u64 {
        self.read_u64(
            (HEAP_VECTOR_TABLE_START + (vector as usize) * 8) as u64,
        )
    }

    pub fn set_heap_vector(&mut self, vector: HeapVector, address: u64) {
        self.write_u64(
            (HEAP_VECTOR_TABLE_START + (vector as usize) * 8) as u64,
            address,
        );
    }

    /// Install an interrupt vector.
    pub fn swi(&mut self, index: u8, address: u64) {
        self.write_u64(
            (INTERRUPT_VECTOR_TABLE_START + (index as usize) * 8) as u64,
            address,
        );
    }

    // --------------------------------------------------------------------
    // stack

    pub fn push(&mut self, value: u64) {
        self.registers.sp -= 8;
        self.write_u64(self.registers.sp, value);
    }

    pub fn pop(&mut self) -> u64 {
        let value = self.read_u64(self.registers.sp);
        self.registers.sp += 8;
        value
    }

    pub fn peek(&self) -> u64 {
        self.read_u64(self.registers.sp)
    }

    // --------------------------------------------------------------------
    // user heap allocator

    /// Start the user heap immediately after the program image. Everything
    /// between `address` and the bottom of the stack becomes one free
    /// block.
    pub fn heap_free_space_begin(&mut self, address: u64) {
        self.set_heap_vector(HeapVector::FreeSpaceStart, address);
        let size = self.heap_vector(HeapVector::BottomOfStack) - address;
        self.blocks.clear();
        self.blocks.insert(
            address,
            HeapBlock {
                size,
                allocated: false,
            },
        );
    }

    /// Best-fit allocation. Returns 0 when no block can satisfy the
    /// request. Over-sized winners are split unless the waste is within
    /// [SPLIT_THRESHOLD] bytes.
    pub fn alloc(&mut self, size: u64) -> u64 {
        let mut best: Option<(u64, u64)> = None;
        for (address, block) in &self.blocks {
            if block.allocated || block.size < size {
                continue;
            }
            if block.size == size {
                best = Some((*address, block.size));
                break;
            }
            let delta = block.size - size;
            match best {
                Some((_, best_size)) if best_size - size <= delta => {}
                _ => best = Some((*address, block.size)),
            }
        }

        let (address, block_size) = match best {
            Some(found) => found,
            None => return 0,
        };

        if block_size - size <= SPLIT_THRESHOLD {
            if let Some(block) = self.blocks.get_mut(&address) {
                block.allocated = true;
            }
            return address;
        }

        // split: the low part becomes the allocation, the remainder stays
        // free at a shifted address
        self.blocks.insert(
            address,
            HeapBlock {
                size,
                allocated: true,
            },
        );
        self.blocks.insert(
            address + size,
            HeapBlock {
                size: block_size - size,
                allocated: false,
            },
        );
        address
    }

    /// Free a block and coalesce it with free neighbors. Returns the freed
    /// block's size, or 0 when the address was never allocated.
    pub fn free(&mut self, address: u64) -> u64 {
        let block = match self.blocks.get_mut(&address) {
            Some(block) if block.allocated => block,
            _ => return 0,
        };
        block.allocated = false;
        let freed_size = block.size;

        let mut start = address;
        let mut total = freed_size;

        // merge with the previous block when it is free and adjacent
        if let Some((prev_address, prev)) =
            self.blocks.range(..address).next_back()
        {
            if !prev.allocated && prev_address + prev.size == address {
                start = *prev_address;
                total += prev.size;
            }
        }

        // merge with the next block when it is free and adjacent
        let next_address = address + freed_size;
        if let Some(next) = self.blocks.get(&next_address) {
            if !next.allocated {
                total += next.size;
                self.blocks.remove(&next_address);
            }
        }

        if start != address {
            self.blocks.remove(&address);
        }
        self.blocks.insert(
            start,
            HeapBlock {
                size: total,
                allocated: false,
            },
        );

        freed_size
    }

    /// The allocated size of a block, or 0 for unknown addresses.
    pub fn size(&self, address: u64) -> u64 {
        self.blocks
            .get(&address)
            .map(|block| block.size)
            .unwrap_or(0)
    }

    // --------------------------------------------------------------------
    // traps, libraries, foreign functions

    pub fn register_trap(
        &mut self,
        index: u8,
        callable: Box<dyn FnMut(&mut RegisterFile)>,
    ) {
        self.traps.insert(index, callable);
    }

    pub fn remove_trap(&mut self, index: u8) {
        self.traps.remove(&index);
    }

    /// Invoke the installed callback for `index`. Unknown indexes are a
    /// no-op.
    fn execute_trap(&mut self, index: u8) {
        let Self {
            traps, registers, ..
        } = self;
        if let Some(callable) = traps.get_mut(&index) {
            callable(registers);
        }
    }

    /// Open (or fetch the cached) shared library at `path`.
    pub fn load_shared_library(
        &mut self,
        result: &mut SessionResult,
        path: &Path,
    ) -> bool {
        if self.shared_libraries.contains_key(path) {
            return true;
        }
        match SharedLibrary::load(result, path) {
            Some(library) => {
                self.shared_libraries.insert(path.to_path_buf(), library);
                true
            }
            None => false,
        }
    }

    pub fn shared_library(
        &mut self,
        path: &Path,
    ) -> Option<&mut SharedLibrary> {
        self.shared_libraries.get_mut(path)
    }

    /// Resolve the function's symbol through its library and add it to the
    /// foreign-function table. Returns the table index used by the `FFI`
    /// instruction.
    pub fn register_foreign_function(
        &mut self,
        result: &mut SessionResult,
        mut function: ForeignFunction,
    ) -> Option<usize> {
        let library = match self
            .shared_libraries
            .get_mut(&function.library_path)
        {
            Some(library) => library,
            None => {
                result.error(
                    "B062",
                    format!(
                        "library not loaded: {}",
                        function.library_path.display(),
                    ),
                    SourceLocation::default(),
                );
                return None;
            }
        };
        match library.symbol_address(&function.symbol) {
            Some(address) => {
                function.address = address;
                self.foreign_functions.push(function);
                Some(self.foreign_functions.len() - 1)
            }
            None => {
                result.error(
                    "P004",
                    format!(
                        "unable to find foreign function symbol: {}",
                        function.symbol,
                    ),
                    SourceLocation::default(),
                );
                None
            }
        }
    }

    pub fn foreign_functions(&self) -> &[ForeignFunction] {
        &self.foreign_functions
    }

    // --------------------------------------------------------------------
    // execution

    fn fetch(
        &mut self,
        result: &mut SessionResult,
        address: u64,
    ) -> Option<(Instruction, usize)> {
        if let Some(entry) = self.icache.get(&address) {
            return Some(entry.clone());
        }
        let decoded = Instruction::decode(result, &self.heap, address)?;
        self.icache.insert(address, decoded.clone());
        Some(decoded)
    }

    /// Execute one instruction. Returns false when execution cannot
    /// continue (decode failure, diagnostic, or after `EXIT`).
    pub fn step(&mut self, result: &mut SessionResult) -> bool {
        let (inst, inst_size) = match self.fetch(result, self.registers.pc)
        {
            Some(entry) => entry,
            None => return false,
        };
        let inst_size = inst_size as u64;
        self.registers.pc += inst_size;

        match inst.op {
            OpCode::Nop | OpCode::Meta => {}
            OpCode::Alloc => {
                let count = self.operand_value(&inst, 1);
                let size = count * inst.size.size_in_bytes() as u64;
                let address = self.alloc(size);
                if address == 0 {
                    self.execute_trap(TRAP_OUT_OF_MEMORY);
                    return false;
                }
                if !self.set_target_with_size(
                    result,
                    &inst,
                    0,
                    address,
                    OpSize::Qword,
                ) {
                    return false;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, address == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(address, inst.size),
                );
            }
            OpCode::Free => {
                let address = self.operand_value(&inst, 0);
                let freed_size = self.free(address);
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::NEGATIVE, false);
                self.registers
                    .set_flag(StatusFlags::ZERO, freed_size != 0);
            }
            OpCode::Size => {
                let address = self.operand_value(&inst, 1);
                let block_size = self.size(address);
                if !self.set_target(result, &inst, 0, block_size) {
                    return false;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, block_size == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(block_size, inst.size),
                );
            }
            OpCode::Load => {
                let mut address = self.operand_value(&inst, 1);
                if inst.operands.len() > 2 {
                    address = self.apply_offset(&inst, 2, address);
                }
                let value = self.read_sized(inst.size, address);
                if !self.set_target(result, &inst, 0, value) {
                    return false;
                }
                self.set_value_flags(value, inst.size);
            }
            OpCode::Store => {
                let mut address = self.operand_value(&inst, 0);
                let value = self.operand_value(&inst, 1);
                if inst.operands.len() > 2 {
                    address = self.apply_offset(&inst, 2, address);
                }
                self.write_sized(inst.size, address, value);
                self.set_value_flags(value, inst.size);
            }
            OpCode::Copy => {
                let source = self.operand_value(&inst, 0) as usize;
                let target = self.operand_value(&inst, 1) as usize;
                let length = self.operand_value(&inst, 2) as usize
                    * inst.size.size_in_bytes();
                self.heap.copy_within(source..source + length, target);
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, false);
                self.registers.set_flag(StatusFlags::NEGATIVE, false);
            }
            OpCode::Fill => {
                let value = self.operand_value(&inst, 0);
                let address = self.operand_value(&inst, 1);
                let length = self.operand_value(&inst, 2);
                for index in 0..length {
                    self.write_sized(
                        inst.size,
                        address + index * inst.size.size_in_bytes() as u64,
                        value,
                    );
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, false);
                self.registers.set_flag(StatusFlags::NEGATIVE, false);
            }
            OpCode::Move => {
                if !inst.operands[0].is_integer() {
                    let value = self.operand_float(&inst, 1);
                    let reg = inst.operands[0].register() as usize;
                    self.registers.f[reg] = value;
                    self.clear_arithmetic_flags();
                    self.registers
                        .set_flag(StatusFlags::ZERO, value == 0.0);
                    self.registers
                        .set_flag(StatusFlags::NEGATIVE, value < 0.0);
                } else {
                    let value = self.operand_value(&inst, 1);
                    if !self.set_target(result, &inst, 0, value) {
                        return false;
                    }
                    self.set_value_flags(value, inst.size);
                }
            }
            OpCode::Push => {
                let value = self.operand_value(&inst, 0);
                self.push(value);
                self.set_value_flags(value, inst.size);
            }
            OpCode::Pop => {
                let value = self.pop();
                if !self.set_target(result, &inst, 0, value) {
                    return false;
                }
                self.set_value_flags(value, inst.size);
            }
            OpCode::Dup => {
                let value = self.peek();
                self.push(value);
                self.set_value_flags(value, inst.size);
            }
            OpCode::Inc | OpCode::Dec => {
                let lhs = self.operand_value(&inst, 0);
                let rhs = 1u64;
                let value = if inst.op == OpCode::Inc {
                    lhs.wrapping_add(rhs)
                } else {
                    lhs.wrapping_sub(rhs)
                };
                if !self.set_target(result, &inst, 0, value) {
                    return false;
                }
                self.registers.set_flag(
                    StatusFlags::OVERFLOW,
                    Self::has_overflow(lhs, rhs, value, inst.size),
                );
                self.registers.set_flag(
                    StatusFlags::SUBTRACT,
                    inst.op == OpCode::Dec,
                );
                self.registers.set_flag(StatusFlags::ZERO, value == 0);
                self.registers.set_flag(
                    StatusFlags::CARRY,
                    Self::has_carry(value, inst.size),
                );
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(value, inst.size),
                );
            }
            OpCode::Add => {
                let lhs = self.operand_value(&inst, 1);
                let rhs = self.operand_value(&inst, 2);
                let sum = lhs.wrapping_add(rhs);
                if !self.set_target(result, &inst, 0, sum) {
                    return false;
                }
                self.registers.set_flag(
                    StatusFlags::OVERFLOW,
                    Self::has_overflow(lhs, rhs, sum, inst.size),
                );
                self.registers.set_flag(StatusFlags::SUBTRACT, false);
                self.registers.set_flag(StatusFlags::ZERO, sum == 0);
                self.registers.set_flag(
                    StatusFlags::CARRY,
                    Self::has_carry(sum, inst.size),
                );
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(sum, inst.size),
                );
            }
            OpCode::Sub => {
                let lhs = self.operand_value(&inst, 1);
                let rhs = self.operand_value(&inst, 2);
                let difference = lhs.wrapping_sub(rhs);
                if !self.set_target(result, &inst, 0, difference) {
                    return false;
                }
                self.registers.set_flag(
                    StatusFlags::OVERFLOW,
                    Self::has_overflow(lhs, rhs, difference, inst.size),
                );
                self.registers.set_flag(StatusFlags::SUBTRACT, true);
                self.registers.set_flag(StatusFlags::CARRY, rhs > lhs);
                self.registers
                    .set_flag(StatusFlags::ZERO, difference == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(difference, inst.size),
                );
            }
            OpCode::Mul => {
                let lhs = self.operand_value(&inst, 1);
                let rhs = self.operand_value(&inst, 2);
                let product = lhs.wrapping_mul(rhs);
                if !self.set_target(result, &inst, 0, product) {
                    return false;
                }
                self.registers.set_flag(
                    StatusFlags::OVERFLOW,
                    Self::has_overflow(lhs, rhs, product, inst.size),
                );
                self.registers.set_flag(StatusFlags::CARRY, false);
                self.registers.set_flag(StatusFlags::SUBTRACT, false);
                self.registers.set_flag(StatusFlags::ZERO, product == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(product, inst.size),
                );
            }
            OpCode::Div | OpCode::Mod => {
                let lhs = self.operand_value(&inst, 1);
                let rhs = self.operand_value(&inst, 2);
                let value = if rhs == 0 {
                    0
                } else if inst.op == OpCode::Div {
                    lhs / rhs
                } else {
                    lhs % rhs
                };
                if !self.set_target(result, &inst, 0, value) {
                    return false;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, value == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(value, inst.size),
                );
            }
            OpCode::Neg => {
                let value = self.operand_value(&inst, 1);
                let negated = (value as i64).wrapping_neg() as u64;
                if !self.set_target(result, &inst, 0, negated) {
                    return false;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, negated == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(negated, inst.size),
                );
            }
            OpCode::Shr
            | OpCode::Shl
            | OpCode::Ror
            | OpCode::Rol
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor => {
                let lhs = self.operand_value(&inst, 1);
                let rhs = self.operand_value(&inst, 2);
                let value = match inst.op {
                    OpCode::Shr => lhs.wrapping_shr(rhs as u32),
                    OpCode::Shl => lhs.wrapping_shl(rhs as u32),
                    OpCode::Ror => lhs.rotate_right(rhs as u32),
                    OpCode::Rol => lhs.rotate_left(rhs as u32),
                    OpCode::And => lhs & rhs,
                    OpCode::Or => lhs | rhs,
                    _ => lhs ^ rhs,
                };
                if !self.set_target(result, &inst, 0, value) {
                    return false;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, value == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(value, inst.size),
                );
            }
            OpCode::Not => {
                let value = !self.operand_value(&inst, 1);
                if !self.set_target(result, &inst, 0, value) {
                    return false;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, value == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(value, inst.size),
                );
            }
            OpCode::Bis => {
                let value = self.operand_value(&inst, 1);
                let bit = self.operand_value(&inst, 2);
                let masked = value | (1u64 << (bit & 63));
                if !self.set_target(result, &inst, 0, masked) {
                    return false;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, false);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(masked, inst.size),
                );
            }
            OpCode::Bic => {
                let value = self.operand_value(&inst, 1);
                let bit = self.operand_value(&inst, 2);
                let masked = value & !(1u64 << (bit & 63));
                if !self.set_target(result, &inst, 0, masked) {
                    return false;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, true);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(masked, inst.size),
                );
            }
            OpCode::Test => {
                let value = self.operand_value(&inst, 0);
                let mask = self.operand_value(&inst, 1);
                let masked = value & mask;
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, masked == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(masked, inst.size),
                );
            }
            OpCode::Cmp => {
                let lhs = self.operand_value(&inst, 0);
                let rhs = self.operand_value(&inst, 1);
                let difference = lhs.wrapping_sub(rhs);
                self.registers.set_flag(
                    StatusFlags::OVERFLOW,
                    Self::has_overflow(lhs, rhs, difference, inst.size),
                );
                self.registers.set_flag(StatusFlags::SUBTRACT, true);
                self.registers
                    .set_flag(StatusFlags::ZERO, difference == 0);
                self.registers.set_flag(StatusFlags::CARRY, rhs > lhs);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(difference, inst.size),
                );
            }
            OpCode::Bz => {
                let value = self.operand_value(&inst, 0);
                let address = self.operand_value(&inst, 1);
                if value == 0 {
                    self.registers.pc = address;
                }
                self.registers.set_flag(StatusFlags::ZERO, value == 0);
                self.registers.set_flag(StatusFlags::SUBTRACT, false);
                self.registers.set_flag(StatusFlags::OVERFLOW, false);
                self.registers.set_flag(
                    StatusFlags::CARRY,
                    Self::has_carry(value, inst.size),
                );
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(value, inst.size),
                );
            }
            OpCode::Bnz => {
                let value = self.operand_value(&inst, 0);
                let address = self.operand_value(&inst, 1);
                if value != 0 {
                    self.registers.pc = address;
                }
                self.registers.set_flag(StatusFlags::ZERO, value == 0);
                self.registers.set_flag(StatusFlags::SUBTRACT, false);
                self.registers.set_flag(StatusFlags::OVERFLOW, false);
                self.registers.set_flag(
                    StatusFlags::CARRY,
                    Self::has_carry(value, inst.size),
                );
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(value, inst.size),
                );
            }
            OpCode::Tbz | OpCode::Tbnz => {
                let value = self.operand_value(&inst, 0);
                let mask = self.operand_value(&inst, 1);
                let address = self.operand_value(&inst, 2);
                let masked = value & mask;
                let taken = if inst.op == OpCode::Tbz {
                    masked == 0
                } else {
                    masked != 0
                };
                if taken {
                    self.registers.pc = address;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, masked == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(masked, inst.size),
                );
            }
            OpCode::Bne => {
                let address =
                    self.branch_address(&inst, inst_size);
                if !self.registers.flag(StatusFlags::ZERO) {
                    self.registers.pc = address;
                }
            }
            OpCode::Beq => {
                let address =
                    self.branch_address(&inst, inst_size);
                if self.registers.flag(StatusFlags::ZERO) {
                    self.registers.pc = address;
                }
            }
            OpCode::Bg => {
                let address =
                    self.branch_address(&inst, inst_size);
                if !self.registers.flag(StatusFlags::CARRY)
                    && !self.registers.flag(StatusFlags::ZERO)
                {
                    self.registers.pc = address;
                }
            }
            OpCode::Bge => {
                let address =
                    self.branch_address(&inst, inst_size);
                if !self.registers.flag(StatusFlags::CARRY) {
                    self.registers.pc = address;
                }
            }
            OpCode::Bl => {
                let address =
                    self.branch_address(&inst, inst_size);
                if self.registers.flag(StatusFlags::CARRY)
                    || self.registers.flag(StatusFlags::ZERO)
                {
                    self.registers.pc = address;
                }
            }
            OpCode::Ble => {
                let address =
                    self.branch_address(&inst, inst_size);
                if self.registers.flag(StatusFlags::CARRY) {
                    self.registers.pc = address;
                }
            }
            OpCode::Setz => {
                let value =
                    u64::from(self.registers.flag(StatusFlags::ZERO));
                if !self.set_target(result, &inst, 0, value) {
                    return false;
                }
            }
            OpCode::Setnz => {
                let value =
                    u64::from(!self.registers.flag(StatusFlags::ZERO));
                if !self.set_target(result, &inst, 0, value) {
                    return false;
                }
            }
            OpCode::Jsr => {
                self.push(self.registers.pc);
                let address =
                    self.branch_address(&inst, inst_size);
                self.registers.pc = address;
            }
            OpCode::Rts => {
                let address = self.pop();
                self.registers.pc = address;
            }
            OpCode::Jmp => {
                let address =
                    self.branch_address(&inst, inst_size);
                self.registers.pc = address;
            }
            OpCode::Swi => {
                let index = self.operand_value(&inst, 0);
                let vector_address = self.read_u64(
                    (INTERRUPT_VECTOR_TABLE_START as u64) + index * 8,
                );
                if vector_address != 0 {
                    self.push(self.registers.pc);
                    self.registers.pc = vector_address;
                }
            }
            OpCode::Swap => {
                let value = self.operand_value(&inst, 1);
                let swapped = match inst.size {
                    OpSize::Byte => {
                        let byte = value as u8;
                        u64::from(byte.rotate_left(4))
                    }
                    OpSize::Word => u64::from((value as u16).swap_bytes()),
                    OpSize::Dword => u64::from((value as u32).swap_bytes()),
                    _ => value.swap_bytes(),
                };
                if !self.set_target(result, &inst, 0, swapped) {
                    return false;
                }
                self.clear_arithmetic_flags();
                self.registers.set_flag(StatusFlags::ZERO, swapped == 0);
                self.registers.set_flag(
                    StatusFlags::NEGATIVE,
                    Self::is_negative(swapped, inst.size),
                );
            }
            OpCode::Trap => {
                let index = self.operand_value(&inst, 0);
                self.execute_trap(index as u8);
            }
            OpCode::Ffi => {
                let index = self.operand_value(&inst, 0) as usize;
                if index >= self.foreign_functions.len() {
                    self.execute_trap(TRAP_INVALID_FFI_CALL);
                } else {
                    let argument_count =
                        self.foreign_functions[index].arguments.len();
                    let mut arguments = Vec::with_capacity(argument_count);
                    for _ in 0..argument_count {
                        arguments.push(self.pop());
                    }
                    let function = &self.foreign_functions[index];
                    let returns_value = function.return_value.value_type
                        != FfiType::Void;
                    let value = function.call(&arguments);
                    if returns_value {
                        self.push(value);
                    }
                }
            }
            OpCode::Exit => {
                self.exited = true;
            }
        }

        !result.is_failed() && !self.exited
    }

    /// Run until exit or failure.
    pub fn run(&mut self, result: &mut SessionResult) -> bool {
        while !self.has_exited() {
            if !self.step(result) {
                break;
            }
        }
        !result.is_failed()
    }

    /// Disassemble instructions starting at `address` until an `EXIT` or a
    /// decode failure.
    pub fn disassemble(
        &mut self,
        result: &mut SessionResult,
        mut address: u64,
    ) -> String {
        let mut text = String::new();
        loop {
            let (inst, size) = match self.fetch(result, address) {
                Some(entry) => entry,
                None => break,
            };
            let _ = writeln!(
                text,
                "${:016X}: {} (${:02X} bytes)",
                address,
                inst.disassemble(),
                size,
            );
            if inst.op == OpCode::Exit {
                break;
            }
            address += size as u64;
        }
        text
    }

    // --------------------------------------------------------------------
    // operand helpers

    fn operand_value(&self, inst: &Instruction, index: usize) -> u64 {
        let operand = &inst.operands[index];
        if operand.is_reg() {
            if operand.is_integer() {
                match operand.register() {
                    REGISTER_PC => self.registers.pc,
                    REGISTER_SP => self.registers.sp,
                    REGISTER_FP => self.registers.fp,
                    REGISTER_FR => self.registers.fr,
                    REGISTER_SR => self.registers.sr,
                    reg => self.registers.i[reg as usize],
                }
            } else {
                self.registers.f[operand.register() as usize] as u64
            }
        } else {
            operand.as_integer()
        }
    }

    fn operand_float(&self, inst: &Instruction, index: usize) -> f64 {
        let operand = &inst.operands[index];
        if operand.is_reg() {
            if operand.is_integer() {
                self.registers.i[operand.register() as usize] as f64
            } else {
                self.registers.f[operand.register() as usize]
            }
        } else {
            operand.as_float()
        }
    }

    fn set_target(
        &mut self,
        result: &mut SessionResult,
        inst: &Instruction,
        index: usize,
        value: u64,
    ) -> bool {
        self.set_target_with_size(result, inst, index, value, inst.size)
    }

    /// Like [Self::set_target] but with an explicit width; address-valued
    /// results (`ALLOC`) always write the full register.
    fn set_target_with_size(
        &mut self,
        result: &mut SessionResult,
        inst: &Instruction,
        index: usize,
        value: u64,
        size: OpSize,
    ) -> bool {
        let operand = &inst.operands[index];
        if !operand.is_reg() {
            result.error(
                "B006",
                "constant cannot be a target operand type.",
                SourceLocation::default(),
            );
            return false;
        }
        if operand.is_integer() {
            let zoned =
                |current| Self::set_zoned_value(current, value, size);
            match operand.register() {
                REGISTER_PC => {
                    self.registers.pc = zoned(self.registers.pc)
                }
                REGISTER_SP => {
                    self.registers.sp = zoned(self.registers.sp)
                }
                REGISTER_FP => {
                    self.registers.fp = zoned(self.registers.fp)
                }
                REGISTER_FR => {
                    self.registers.fr = zoned(self.registers.fr)
                }
                REGISTER_SR => {
                    self.registers.sr = zoned(self.registers.sr)
                }
                reg => {
                    let reg = reg as usize;
                    self.registers.i[reg] =
                        zoned(self.registers.i[reg]);
                }
            }
        } else {
            self.registers.f[operand.register() as usize] = value as f64;
        }
        true
    }

    /// Branch target: operand 0 is the absolute address; an optional
    /// second operand applies a PC-relative offset.
    fn branch_address(&self, inst: &Instruction, inst_size: u64) -> u64 {
        let mut address = self.operand_value(inst, 0);
        if inst.operands.len() >= 2 {
            let offset = self.operand_value(inst, 1);
            if inst.operands[1].is_negative() {
                address = address.wrapping_sub(offset + inst_size);
            } else {
                address = address.wrapping_add(offset - inst_size);
            }
        }
        address
    }

    fn apply_offset(
        &self,
        inst: &Instruction,
        index: usize,
        address: u64,
    ) -> u64 {
        let offset = self.operand_value(inst, index);
        if inst.operands[index].is_negative() {
            address.wrapping_sub(offset)
        } else {
            address.wrapping_add(offset)
        }
    }

    fn clear_arithmetic_flags(&mut self) {
        self.registers.set_flag(StatusFlags::CARRY, false);
        self.registers.set_flag(StatusFlags::OVERFLOW, false);
        self.registers.set_flag(StatusFlags::SUBTRACT, false);
    }

    fn set_value_flags(&mut self, value: u64, size: OpSize) {
        self.clear_arithmetic_flags();
        self.registers.set_flag(StatusFlags::ZERO, value == 0);
        self.registers
            .set_flag(StatusFlags::NEGATIVE, Self::is_negative(value, size));
    }

    // --------------------------------------------------------------------
    // size-aware value helpers

    fn sign_mask(size: OpSize) -> u64 {
        match size {
            OpSize::Byte => 0x80,
            OpSize::Word => 0x8000,
            OpSize::Dword => 0x8000_0000,
            _ => 0x8000_0000_0000_0000,
        }
    }

    pub fn is_negative(value: u64, size: OpSize) -> bool {
        value & Self::sign_mask(size) != 0
    }

    pub fn has_carry(value: u64, size: OpSize) -> bool {
        match size {
            OpSize::Byte => value > u64::from(u8::MAX),
            OpSize::Word => value > u64::from(u16::MAX),
            OpSize::Dword => value > u64::from(u32::MAX),
            _ => false,
        }
    }

    /// Signed overflow detection for the declared size:
    /// `(~(lhs^rhs) & (lhs^result) & sign_mask) != 0`.
    pub fn has_overflow(
        lhs: u64,
        rhs: u64,
        result: u64,
        size: OpSize,
    ) -> bool {
        (!(lhs ^ rhs) & (lhs ^ result) & Self::sign_mask(size)) != 0
    }

    /// Mask `value` into the low zone of `source` per the op size, leaving
    /// the high bytes of the target intact.
    pub fn set_zoned_value(source: u64, value: u64, size: OpSize) -> u64 {
        match size {
            OpSize::Byte => (source & !0xffu64) | (value & 0xff),
            OpSize::Word => (source & !0xffffu64) | (value & 0xffff),
            OpSize::Dword => {
                (source & !0xffff_ffffu64) | (value & 0xffff_ffff)
            }
            _ => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized_terp() -> (Terp, SessionResult) {
        let mut result = SessionResult::new();
        let mut terp = Terp::new(1024 * 64, 1024 * 8);
        assert!(terp.initialize(&mut result));
        (terp, result)
    }

    #[test]
    fn test_heap_vectors() {
        let (terp, _) = initialized_terp();
        assert_eq!(terp.heap_vector(HeapVector::TopOfStack), 1024 * 64);
        assert_eq!(
            terp.heap_vector(HeapVector::BottomOfStack),
            (1024 * 64 - 1024 * 8) as u64,
        );
        assert_eq!(
            terp.heap_vector(HeapVector::ProgramStart),
            PROGRAM_START,
        );
        assert_eq!(terp.register_file().pc, PROGRAM_START);
    }

    #[test]
    fn test_push_pop_peek() {
        let (mut terp, _) = initialized_terp();
        let top = terp.register_file().sp;
        terp.push(42);
        assert_eq!(terp.register_file().sp, top - 8);
        assert_eq!(terp.peek(), 42);
        assert_eq!(terp.pop(), 42);
        assert_eq!(terp.register_file().sp, top);
    }

    #[test]
    fn test_alloc_free_reuse() {
        let (mut terp, _) = initialized_terp();
        terp.heap_free_space_begin(4096);

        let first = terp.alloc(256);
        assert_eq!(first, 4096);
        let second = terp.alloc(256);
        assert_eq!(second, 4096 + 256);

        // freeing and reallocating the same size reuses the block
        assert_eq!(terp.free(first), 256);
        let third = terp.alloc(256);
        assert_eq!(third, first);

        // double free returns 0
        assert_eq!(terp.free(9999), 0);
    }

    #[test]
    fn test_free_coalesces_neighbors() {
        let (mut terp, _) = initialized_terp();
        terp.heap_free_space_begin(4096);

        let a = terp.alloc(128);
        let b = terp.alloc(128);
        let c = terp.alloc(128);
        assert!(a != 0 && b != 0 && c != 0);

        terp.free(a);
        terp.free(c);
        terp.free(b);

        // after coalescing, a request spanning all three succeeds at `a`
        let big = terp.alloc(128 * 3);
        assert_eq!(big, a);
    }

    #[test]
    fn test_alloc_exhaustion_returns_zero() {
        let (mut terp, _) = initialized_terp();
        terp.heap_free_space_begin(4096);
        let available =
            terp.heap_vector(HeapVector::BottomOfStack) - 4096;
        assert_eq!(terp.alloc(available + 1), 0);
    }

    #[test]
    fn test_step_add_sets_flags() {
        let (mut terp, mut result) = initialized_terp();
        let pc = terp.register_file().pc;

        let inst = Instruction::new(
            OpCode::Add,
            OpSize::Byte,
            vec![
                crate::vm::instruction::Operand::integer_register(0),
                crate::vm::instruction::Operand::integer_register(1),
                crate::vm::instruction::Operand::integer_register(2),
            ],
        );
        terp.register_file_mut().i[1] = 200;
        terp.register_file_mut().i[2] = 100;
        inst.encode(&mut result, terp.heap_mut(), pc);

        assert!(terp.step(&mut result));
        // 300 masked to byte = 44, carry set
        assert_eq!(terp.register_file().i[0], 44);
        assert!(terp.register_file().flag(StatusFlags::CARRY));
        assert!(!terp.register_file().flag(StatusFlags::ZERO));
    }

    #[test]
    fn test_step_exit() {
        let (mut terp, mut result) = initialized_terp();
        let pc = terp.register_file().pc;
        let inst = Instruction::new(OpCode::Exit, OpSize::None, vec![]);
        inst.encode(&mut result, terp.heap_mut(), pc);

        assert!(!terp.step(&mut result));
        assert!(terp.has_exited());
    }

    #[test]
    fn test_trap_dispatch() {
        use std::cell::Cell;
        use std::rc::Rc;

        let (mut terp, mut result) = initialized_terp();
        let fired = Rc::new(Cell::new(false));
        let observer = Rc::clone(&fired);
        terp.register_trap(
            0x10,
            Box::new(move |_registers| observer.set(true)),
        );

        let pc = terp.register_file().pc;
        let inst = Instruction::new(
            OpCode::Trap,
            OpSize::Byte,
            vec![crate::vm::instruction::Operand::integer_constant(0x10)],
        );
        inst.encode(&mut result, terp.heap_mut(), pc);
        assert!(terp.step(&mut result));
        assert!(fired.get());

        // unknown trap indexes are a silent no-op
        let inst = Instruction::new(
            OpCode::Trap,
            OpSize::Byte,
            vec![crate::vm::instruction::Operand::integer_constant(0x42)],
        );
        let pc = terp.register_file().pc;
        inst.encode(&mut result, terp.heap_mut(), pc);
        assert!(terp.step(&mut result));
    }

    #[test]
    fn test_constant_target_is_an_error() {
        let (mut terp, mut result) = initialized_terp();
        let pc = terp.register_file().pc;
        let inst = Instruction::new(
            OpCode::Move,
            OpSize::Qword,
            vec![
                crate::vm::instruction::Operand::integer_constant(1),
                crate::vm::instruction::Operand::integer_constant(2),
            ],
        );
        inst.encode(&mut result, terp.heap_mut(), pc);
        assert!(!terp.step(&mut result));
        assert!(result.has_code("B006"));
    }

    #[test]
    fn test_zoned_writes_preserve_upper_bytes() {
        assert_eq!(
            Terp::set_zoned_value(0xFFFF_FFFF_FFFF_FFFF, 0xAB, OpSize::Byte),
            0xFFFF_FFFF_FFFF_FFAB,
        );
        assert_eq!(
            Terp::set_zoned_value(0x1122_3344_5566_7788, 0xAAAA, OpSize::Word),
            0x1122_3344_5566_AAAA,
        );
        assert_eq!(
            Terp::set_zoned_value(0x1122_3344_5566_7788, 0x9, OpSize::Qword),
            0x9,
        );
    }
}
