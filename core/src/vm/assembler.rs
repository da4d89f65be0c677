//! The assembler owns the instruction-block tree and the named data
//! segments, computes final addresses for every label and symbol, patches
//! unresolved label references, and writes the encoded program into the
//! terp's heap behind a bootstrap `JMP` to the entry label.

use crate::error::SessionResult;
use crate::source::SourceLocation;
use crate::vm::block::{InstructionBlock, InstructionBlockType};
use crate::vm::instruction::{Instruction, OpCode, OpSize, Operand};
use crate::vm::terp::{HeapVector, Terp};
use std::collections::HashMap;
use std::fmt::Write as _;

/// The kinds of segment the assembler lays out ahead of the code.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SegmentType {
    Code,
    Data,
    Stack,
    Constant,
}

impl SegmentType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Data => "data",
            Self::Stack => "stack",
            Self::Constant => "constant",
        }
    }
}

/// The storage type of one segment symbol.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SymbolType {
    Unknown,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bytes,
}

impl SymbolType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 | Self::F32 => 4,
            Self::U64 | Self::F64 => 8,
            Self::Unknown | Self::Bytes => 0,
        }
    }

    pub fn integer_for_size(size: usize) -> Self {
        match size {
            1 => Self::U8,
            2 => Self::U16,
            4 => Self::U32,
            8 => Self::U64,
            _ => Self::Unknown,
        }
    }

    pub fn float_for_size(size: usize) -> Self {
        match size {
            4 => Self::F32,
            8 => Self::F64,
            _ => Self::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Bytes => "bytes",
        }
    }
}

/// A symbol's initial value, written into the heap at assembly time.
#[derive(Clone, Debug, PartialEq)]
pub enum SymbolValue {
    None,
    Integer(u64),
    Float(f64),
    Bytes(Vec<u8>),
}

/// A named location inside a segment.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub symbol_type: SymbolType,
    /// Offset within the owning segment.
    pub offset: u64,
    /// Final heap address, assigned during assembly.
    pub address: u64,
    pub size: usize,
    pub value: SymbolValue,
}

/// A named region of initialized (or reserved) memory laid out ahead of the
/// code.
#[derive(Clone, Debug)]
pub struct Segment {
    pub name: String,
    pub segment_type: SegmentType,
    pub address: u64,
    pub offset: u64,
    pub initialized: bool,
    symbols: Vec<Symbol>,
    symbol_index: HashMap<String, usize>,
}

impl Segment {
    fn new(name: impl Into<String>, segment_type: SegmentType) -> Self {
        Self {
            name: name.into(),
            segment_type,
            address: 0,
            offset: 0,
            initialized: false,
            symbols: Vec::new(),
            symbol_index: HashMap::new(),
        }
    }

    /// Define (or fetch) a symbol, reserving `size` bytes at the current
    /// segment offset.
    pub fn symbol(
        &mut self,
        name: impl Into<String>,
        symbol_type: SymbolType,
        size: usize,
    ) -> &mut Symbol {
        let name = name.into();
        if let Some(index) = self.symbol_index.get(&name) {
            return &mut self.symbols[*index];
        }
        let size = if size > 0 {
            size
        } else {
            symbol_type.size_in_bytes()
        };
        let symbol = Symbol {
            name: name.clone(),
            symbol_type,
            offset: self.offset,
            address: 0,
            size,
            value: SymbolValue::None,
        };
        self.offset += size as u64;
        self.symbols.push(symbol);
        self.symbol_index.insert(name, self.symbols.len() - 1);
        self.symbols.last_mut().unwrap()
    }

    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbol_index
            .get(name)
            .map(|index| &self.symbols[*index])
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn size(&self) -> u64 {
        self.offset
    }
}

pub struct Assembler {
    blocks: Vec<InstructionBlock>,
    root: usize,
    block_stack: Vec<usize>,
    segments: Vec<Segment>,
    segment_index: HashMap<String, usize>,
    location_counter: u64,
    labels: HashMap<String, u64>,
    listing: String,
}

impl Assembler {
    pub fn new() -> Self {
        let root =
            InstructionBlock::new(None, InstructionBlockType::Implicit);
        Self {
            blocks: vec![root],
            root: 0,
            block_stack: vec![0],
            segments: Vec::new(),
            segment_index: HashMap::new(),
            location_counter: 0,
            labels: HashMap::new(),
            listing: String::new(),
        }
    }

    pub fn root_block(&self) -> usize {
        self.root
    }

    pub fn block(&self, index: usize) -> &InstructionBlock {
        &self.blocks[index]
    }

    pub fn block_mut(&mut self, index: usize) -> &mut InstructionBlock {
        &mut self.blocks[index]
    }

    /// The block new instructions are emitted into.
    pub fn current_block(&mut self) -> &mut InstructionBlock {
        let index = *self.block_stack.last().unwrap();
        &mut self.blocks[index]
    }

    pub fn current_block_index(&self) -> usize {
        *self.block_stack.last().unwrap()
    }

    /// Create a child block of the current block and return its index.
    pub fn make_block(&mut self, block_type: InstructionBlockType) -> usize {
        let parent = self.current_block_index();
        let index = self.blocks.len();
        self.blocks
            .push(InstructionBlock::new(Some(parent), block_type));
        self.blocks[parent].add_child(index);
        index
    }

    pub fn push_block(&mut self, index: usize) {
        self.block_stack.push(index);
    }

    pub fn pop_block(&mut self) -> Option<usize> {
        if self.block_stack.len() > 1 {
            self.block_stack.pop()
        } else {
            None
        }
    }

    // --------------------------------------------------------------------
    // segments

    /// Fetch (or create) a segment by name.
    pub fn segment(
        &mut self,
        name: &str,
        segment_type: SegmentType,
    ) -> &mut Segment {
        if let Some(index) = self.segment_index.get(name) {
            return &mut self.segments[*index];
        }
        self.segments.push(Segment::new(name, segment_type));
        self.segment_index
            .insert(name.to_string(), self.segments.len() - 1);
        self.segments.last_mut().unwrap()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Look a symbol up across all segments.
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        self.segments
            .iter()
            .find_map(|segment| segment.find_symbol(name))
            .map(|symbol| symbol.address)
    }

    pub fn location_counter(&self) -> u64 {
        self.location_counter
    }

    pub fn label_address(&self, name: &str) -> Option<u64> {
        self.labels.get(name).copied()
    }

    pub fn listing(&self) -> &str {
        &self.listing
    }

    // --------------------------------------------------------------------
    // assembly

    /// Lay out segments and code, resolve every label, patch branch
    /// operands, and encode the whole program into the terp's heap. The
    /// image opens with a bootstrap `JMP` to `entry_label`.
    pub fn assemble(
        &mut self,
        result: &mut SessionResult,
        terp: &mut Terp,
        entry_label: &str,
    ) -> bool {
        self.listing.clear();
        self.labels.clear();
        self.location_counter = terp.heap_vector(HeapVector::ProgramStart);

        // reserve room for the bootstrap jump
        let bootstrap_size = Instruction::new(
            OpCode::Jmp,
            OpSize::Qword,
            vec![Operand::integer_constant(0)],
        )
        .encoding_size() as u64;
        let bootstrap_address = self.location_counter;
        self.location_counter += bootstrap_size;

        // segments first: each symbol's final address doubles as a label
        for segment in &mut self.segments {
            self.location_counter =
                Instruction::align(self.location_counter as usize, 8) as u64;
            segment.address = self.location_counter;
            for symbol in &mut segment.symbols {
                symbol.address = segment.address + symbol.offset;
                self.labels
                    .insert(symbol.name.clone(), symbol.address);
            }
            self.location_counter += segment.size();
        }

        // code: walk the block tree in creation order, assigning addresses
        self.location_counter =
            Instruction::align(self.location_counter as usize, 4) as u64;
        let mut layout: Vec<(usize, usize, u64)> = Vec::new();
        let order = self.block_order();
        for block_index in &order {
            let block = &self.blocks[*block_index];
            let mut label_indexes: HashMap<usize, Vec<String>> =
                HashMap::new();
            for label in block.labels() {
                if let Some(index) =
                    block.label_instruction_index(label.name())
                {
                    label_indexes
                        .entry(index)
                        .or_default()
                        .push(label.name().to_string());
                }
            }
            for (index, instruction) in
                block.instructions().iter().enumerate()
            {
                if let Some(names) = label_indexes.get(&index) {
                    for name in names {
                        self.labels
                            .insert(name.clone(), self.location_counter);
                    }
                }
                layout.push((
                    *block_index,
                    index,
                    self.location_counter,
                ));
                self.location_counter +=
                    instruction.encoding_size() as u64;
            }
            // labels defined past the last instruction
            if let Some(names) =
                label_indexes.get(&block.instructions().len())
            {
                for name in names {
                    self.labels.insert(name.clone(), self.location_counter);
                }
            }
        }

        // resolve + patch label references in every block
        for block_index in &order {
            let patches: Vec<_> =
                self.blocks[*block_index].patches().to_vec();
            for patch in patches {
                let name = self.blocks[*block_index].unresolved_labels()
                    [&patch.label_ref]
                    .name
                    .clone();
                match self.labels.get(&name).copied() {
                    Some(address) => {
                        let block = &mut self.blocks[*block_index];
                        if let Some(label_ref) = block
                            .unresolved_labels_mut()
                            .get_mut(&patch.label_ref)
                        {
                            label_ref.resolved = Some(address);
                        }
                        block.set_label_address(&name, address);
                        block.instructions_mut()[patch.instruction]
                            .patch_branch_address(address, patch.operand);
                    }
                    None => {
                        result.error(
                            "P004",
                            format!("unresolved label: {}", name),
                            SourceLocation::default(),
                        );
                    }
                }
            }
        }
        if result.is_failed() {
            return false;
        }

        // bootstrap jump to the entry point
        let entry_address = match self.labels.get(entry_label).copied() {
            Some(address) => address,
            None => {
                result.error(
                    "P004",
                    format!("unresolved label: {}", entry_label),
                    SourceLocation::default(),
                );
                return false;
            }
        };
        let bootstrap = Instruction::new(
            OpCode::Jmp,
            OpSize::Qword,
            vec![Operand::integer_constant(entry_address)],
        );
        if bootstrap.encode(result, terp.heap_mut(), bootstrap_address) == 0 {
            return false;
        }
        let _ = writeln!(
            self.listing,
            "${:016X}: {}",
            bootstrap_address,
            bootstrap.disassemble(),
        );

        // write segment symbol values
        for segment in &self.segments {
            let _ = writeln!(
                self.listing,
                "segment: {} ({}) ${:016X} {} bytes",
                segment.name,
                segment.segment_type.name(),
                segment.address,
                segment.size(),
            );
            for symbol in segment.symbols() {
                let _ = writeln!(
                    self.listing,
                    "  ${:016X}: {} ({}, {} bytes)",
                    symbol.address,
                    symbol.name,
                    symbol.symbol_type.name(),
                    symbol.size,
                );
                match &symbol.value {
                    SymbolValue::None => {}
                    SymbolValue::Integer(value) => {
                        let size = OpSize::for_byte_size(symbol.size);
                        terp.write_sized(size, symbol.address, *value);
                    }
                    SymbolValue::Float(value) => {
                        if symbol.size == 4 {
                            let bits =
                                (*value as f32).to_le_bytes();
                            let start = symbol.address as usize;
                            terp.heap_mut()[start..start + 4]
                                .copy_from_slice(&bits);
                        } else {
                            let bits = value.to_le_bytes();
                            let start = symbol.address as usize;
                            terp.heap_mut()[start..start + 8]
                                .copy_from_slice(&bits);
                        }
                    }
                    SymbolValue::Bytes(bytes) => {
                        let start = symbol.address as usize;
                        terp.heap_mut()[start..start + bytes.len()]
                            .copy_from_slice(bytes);
                    }
                }
            }
        }

        // encode the code blocks
        for (block_index, instruction_index, address) in &layout {
            let instruction = self.blocks[*block_index].instructions()
                [*instruction_index]
                .clone();
            if instruction.encode(result, terp.heap_mut(), *address) == 0 {
                return false;
            }
            let _ = writeln!(
                self.listing,
                "${:016X}: {}",
                address,
                instruction.disassemble(),
            );
        }

        // everything past the image belongs to the user heap
        let free_start =
            Instruction::align(self.location_counter as usize, 8) as u64;
        terp.heap_free_space_begin(free_start);

        !result.is_failed()
    }

    /// Depth-first block order: parents before children, children in
    /// creation order.
    fn block_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            order.push(index);
            for child in self.blocks[index].children().iter().rev() {
                stack.push(*child);
            }
        }
        order
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdPool;

    fn assemble_single_block(
        build: impl FnOnce(&mut IdPool, &mut InstructionBlock),
    ) -> (Assembler, Terp, SessionResult) {
        let mut result = SessionResult::new();
        let mut terp = Terp::new(1024 * 64, 1024 * 8);
        terp.initialize(&mut result);

        let mut assembler = Assembler::new();
        let mut ids = IdPool::new();
        build(&mut ids, assembler.current_block());
        let ok = assembler.assemble(&mut result, &mut terp, "_start");
        assert!(ok, "assembly failed: {}", result);
        (assembler, terp, result)
    }

    #[test]
    fn test_label_resolution_is_sound() {
        let (assembler, terp, mut result) =
            assemble_single_block(|ids, block| {
                block.make_label("_start");
                block.nop();
                block.make_label("loop");
                block.nop();
                block.jump_direct(ids, "loop");
                block.exit();
            });

        let loop_address = assembler.label_address("loop").unwrap();
        // decode the jump and confirm the patched operand matches
        let start = assembler.label_address("_start").unwrap();
        let (nop1, size1) =
            Instruction::decode(&mut result, terp.heap(), start).unwrap();
        assert_eq!(nop1.op, OpCode::Nop);
        let second = start + size1 as u64;
        assert_eq!(second, loop_address);
        let (_, size2) =
            Instruction::decode(&mut result, terp.heap(), second).unwrap();
        let (jmp, _) = Instruction::decode(
            &mut result,
            terp.heap(),
            second + size2 as u64,
        )
        .unwrap();
        assert_eq!(jmp.op, OpCode::Jmp);
        assert_eq!(jmp.operands[0].as_integer(), loop_address);
    }

    #[test]
    fn test_unresolved_label_is_an_error() {
        let mut result = SessionResult::new();
        let mut terp = Terp::new(1024 * 64, 1024 * 8);
        terp.initialize(&mut result);

        let mut assembler = Assembler::new();
        let mut ids = IdPool::new();
        assembler.current_block().make_label("_start");
        assembler.current_block().jump_direct(&mut ids, "nowhere");
        assert!(!assembler.assemble(&mut result, &mut terp, "_start"));
        assert!(result.has_code("P004"));
    }

    #[test]
    fn test_data_symbols_get_addresses_and_values() {
        let mut result = SessionResult::new();
        let mut terp = Terp::new(1024 * 64, 1024 * 8);
        terp.initialize(&mut result);

        let mut assembler = Assembler::new();
        {
            let segment = assembler.segment("data", SegmentType::Data);
            let symbol = segment.symbol("x", SymbolType::U32, 0);
            symbol.value = SymbolValue::Integer(10);
        }
        assembler.current_block().make_label("_start");
        assembler.current_block().exit();
        assert!(assembler.assemble(&mut result, &mut terp, "_start"));

        let address = assembler.symbol_address("x").unwrap();
        assert_eq!(terp.read_sized(OpSize::Dword, address), 10);
        // symbols double as labels
        assert_eq!(assembler.label_address("x"), Some(address));
    }

    #[test]
    fn test_bootstrap_jump_runs_to_exit() {
        let (_, mut terp, mut result) =
            assemble_single_block(|_, block| {
                block.make_label("_start");
                block.move_constant_to_ireg(OpSize::Qword, 5, 99);
                block.exit();
            });

        assert!(terp.run(&mut result), "run failed: {}", result);
        assert!(terp.has_exited());
        assert_eq!(terp.register_file().i[5], 99);
    }
}
