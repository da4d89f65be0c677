//! Variable-length instruction encoding. An encoded instruction is laid out
//! as:
//!
//! ```text
//! +---------+---------+----------+----- operand 0 -----+ ... +----- operand n -----+
//! | size    | opcode  | size_nyb |  type | value bytes |     |  type | value bytes |
//! | u8      | u8      | u8       |  u8   |  1..8 bytes |     |  u8   |  1..8 bytes |
//! +---------+---------+----------+---------------------+-----+---------------------+
//! ```
//!
//! Byte 2 carries the op size in its upper nybble and the operand count in
//! its lower nybble. The whole instruction is padded to 4-byte alignment and
//! must start at a 4-byte aligned address.

use crate::error::SessionResult;
use crate::source::SourceLocation;
use bitflags::bitflags;
use std::convert::TryFrom;
use std::fmt::Write as _;

/// Number of bytes before the first operand.
pub const BASE_SIZE: usize = 3;
/// Instructions are aligned (and padded) to this many bytes.
pub const ALIGNMENT: usize = 4;

/// The integer register bank reserves the five ids above the 64 general
/// registers for the special registers.
pub const REGISTER_PC: u8 = 64;
pub const REGISTER_SP: u8 = 65;
pub const REGISTER_FP: u8 = 66;
pub const REGISTER_FR: u8 = 67;
pub const REGISTER_SR: u8 = 68;

/// Render an integer-bank register id for disassembly.
pub fn register_name(reg: u8) -> String {
    match reg {
        REGISTER_PC => "PC".to_string(),
        REGISTER_SP => "SP".to_string(),
        REGISTER_FP => "FP".to_string(),
        REGISTER_FR => "FR".to_string(),
        REGISTER_SR => "SR".to_string(),
        _ => format!("I{}", reg),
    }
}

/// Every opcode the terp understands.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Nop = 1,
    Alloc,
    Free,
    Size,
    Load,
    Store,
    Copy,
    Fill,
    Move,
    Push,
    Pop,
    Dup,
    Inc,
    Dec,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Shr,
    Shl,
    Ror,
    Rol,
    And,
    Or,
    Xor,
    Not,
    Bis,
    Bic,
    Test,
    Cmp,
    Bz,
    Bnz,
    Tbz,
    Tbnz,
    Bne,
    Beq,
    Bg,
    Bl,
    Bge,
    Ble,
    Setz,
    Setnz,
    Jsr,
    Rts,
    Jmp,
    Swi,
    Swap,
    Trap,
    Ffi,
    Meta,
    Exit,
}

impl OpCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Alloc => "ALLOC",
            Self::Free => "FREE",
            Self::Size => "SIZE",
            Self::Load => "LOAD",
            Self::Store => "STORE",
            Self::Copy => "COPY",
            Self::Fill => "FILL",
            Self::Move => "MOVE",
            Self::Push => "PUSH",
            Self::Pop => "POP",
            Self::Dup => "DUP",
            Self::Inc => "INC",
            Self::Dec => "DEC",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::Neg => "NEG",
            Self::Shr => "SHR",
            Self::Shl => "SHL",
            Self::Ror => "ROR",
            Self::Rol => "ROL",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
            Self::Not => "NOT",
            Self::Bis => "BIS",
            Self::Bic => "BIC",
            Self::Test => "TEST",
            Self::Cmp => "CMP",
            Self::Bz => "BZ",
            Self::Bnz => "BNZ",
            Self::Tbz => "TBZ",
            Self::Tbnz => "TBNZ",
            Self::Bne => "BNE",
            Self::Beq => "BEQ",
            Self::Bg => "BG",
            Self::Bl => "BL",
            Self::Bge => "BGE",
            Self::Ble => "BLE",
            Self::Setz => "SETZ",
            Self::Setnz => "SETNZ",
            Self::Jsr => "JSR",
            Self::Rts => "RTS",
            Self::Jmp => "JMP",
            Self::Swi => "SWI",
            Self::Swap => "SWAP",
            Self::Trap => "TRAP",
            Self::Ffi => "FFI",
            Self::Meta => "META",
            Self::Exit => "EXIT",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        const ALL: &[OpCode] = &[
            OpCode::Nop,
            OpCode::Alloc,
            OpCode::Free,
            OpCode::Size,
            OpCode::Load,
            OpCode::Store,
            OpCode::Copy,
            OpCode::Fill,
            OpCode::Move,
            OpCode::Push,
            OpCode::Pop,
            OpCode::Dup,
            OpCode::Inc,
            OpCode::Dec,
            OpCode::Add,
            OpCode::Sub,
            OpCode::Mul,
            OpCode::Div,
            OpCode::Mod,
            OpCode::Neg,
            OpCode::Shr,
            OpCode::Shl,
            OpCode::Ror,
            OpCode::Rol,
            OpCode::And,
            OpCode::Or,
            OpCode::Xor,
            OpCode::Not,
            OpCode::Bis,
            OpCode::Bic,
            OpCode::Test,
            OpCode::Cmp,
            OpCode::Bz,
            OpCode::Bnz,
            OpCode::Tbz,
            OpCode::Tbnz,
            OpCode::Bne,
            OpCode::Beq,
            OpCode::Bg,
            OpCode::Bl,
            OpCode::Bge,
            OpCode::Ble,
            OpCode::Setz,
            OpCode::Setnz,
            OpCode::Jsr,
            OpCode::Rts,
            OpCode::Jmp,
            OpCode::Swi,
            OpCode::Swap,
            OpCode::Trap,
            OpCode::Ffi,
            OpCode::Meta,
            OpCode::Exit,
        ];
        let first = OpCode::Nop as u8;
        ALL.get((value.wrapping_sub(first)) as usize)
            .copied()
            .filter(|op| *op as u8 == value)
            .ok_or(value)
    }
}

/// The width at which an instruction operates.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum OpSize {
    None = 0,
    Byte = 1,
    Word = 2,
    Dword = 3,
    Qword = 4,
}

impl OpSize {
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::None => 0,
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }

    pub fn from_nybble(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            3 => Some(Self::Dword),
            4 => Some(Self::Qword),
            _ => None,
        }
    }

    /// The smallest op size able to hold a value of `bytes` bytes.
    pub fn for_byte_size(bytes: usize) -> Self {
        match bytes {
            0..=1 => Self::Byte,
            2 => Self::Word,
            3..=4 => Self::Dword,
            _ => Self::Qword,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Byte => ".B",
            Self::Word => ".W",
            Self::Dword => ".DW",
            Self::Qword => ".QW",
        }
    }
}

bitflags! {
    /// Per-operand flag byte. The absence of `REG` marks a constant.
    pub struct OperandFlags: u8 {
        const REG      = 0b0000_0001;
        const INTEGER  = 0b0000_0010;
        const NEGATIVE = 0b0000_0100;
        const PREFIX   = 0b0000_1000;
        const POSTFIX  = 0b0001_0000;
    }
}

/// An operand's payload: either an integer (registers store their id here)
/// or a float constant.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OperandValue {
    Integer(u64),
    Float(f64),
}

/// A single decoded operand.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Operand {
    pub flags: OperandFlags,
    pub value: OperandValue,
}

impl Operand {
    pub fn integer_register(reg: u8) -> Self {
        Self {
            flags: OperandFlags::REG | OperandFlags::INTEGER,
            value: OperandValue::Integer(u64::from(reg)),
        }
    }

    pub fn float_register(reg: u8) -> Self {
        Self {
            flags: OperandFlags::REG,
            value: OperandValue::Integer(u64::from(reg)),
        }
    }

    pub fn integer_constant(value: u64) -> Self {
        Self {
            flags: OperandFlags::INTEGER,
            value: OperandValue::Integer(value),
        }
    }

    pub fn float_constant(value: f64) -> Self {
        Self {
            flags: OperandFlags::empty(),
            value: OperandValue::Float(value),
        }
    }

    pub fn negative(mut self) -> Self {
        self.flags |= OperandFlags::NEGATIVE;
        self
    }

    pub fn is_reg(&self) -> bool {
        self.flags.contains(OperandFlags::REG)
    }

    pub fn is_integer(&self) -> bool {
        self.flags.contains(OperandFlags::INTEGER)
    }

    pub fn is_negative(&self) -> bool {
        self.flags.contains(OperandFlags::NEGATIVE)
    }

    pub fn is_prefix(&self) -> bool {
        self.flags.contains(OperandFlags::PREFIX)
    }

    pub fn is_postfix(&self) -> bool {
        self.flags.contains(OperandFlags::POSTFIX)
    }

    /// Register id for register operands.
    pub fn register(&self) -> u8 {
        match self.value {
            OperandValue::Integer(value) => value as u8,
            OperandValue::Float(_) => 0,
        }
    }

    pub fn as_integer(&self) -> u64 {
        match self.value {
            OperandValue::Integer(value) => value,
            OperandValue::Float(value) => value as u64,
        }
    }

    pub fn as_float(&self) -> f64 {
        match self.value {
            OperandValue::Integer(value) => value as f64,
            OperandValue::Float(value) => value,
        }
    }
}

/// One instruction, decoded or about to be encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    pub size: OpSize,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(op: OpCode, size: OpSize, operands: Vec<Operand>) -> Self {
        debug_assert!(operands.len() <= 4);
        Self { op, size, operands }
    }

    pub fn align(value: usize, alignment: usize) -> usize {
        let offset = value % alignment;
        if offset > 0 {
            value + (alignment - offset)
        } else {
            value
        }
    }

    /// The padded byte length this instruction encodes to.
    pub fn encoding_size(&self) -> usize {
        let mut size = BASE_SIZE;
        for operand in &self.operands {
            size += 1;
            if operand.is_reg() {
                size += 1;
            } else {
                size += match self.size {
                    OpSize::None => 0,
                    OpSize::Byte => 1,
                    OpSize::Word => 2,
                    OpSize::Dword => 4,
                    OpSize::Qword => 8,
                }
            }
        }
        Self::align(size, ALIGNMENT)
    }

    /// Encode into `heap` at `address`. Returns the padded encoded length,
    /// or 0 after reporting a diagnostic.
    pub fn encode(
        &self,
        result: &mut SessionResult,
        heap: &mut [u8],
        address: u64,
    ) -> usize {
        if address % ALIGNMENT as u64 != 0 {
            result.error(
                "B003",
                format!(
                    "instruction alignment violation: alignment = {} bytes, address = ${:016X}",
                    ALIGNMENT, address,
                ),
                SourceLocation::default(),
            );
            return 0;
        }

        let start = address as usize;
        let mut offset = start + BASE_SIZE;

        heap[start + 1] = self.op as u8;
        heap[start + 2] = ((self.size as u8) << 4) | (self.operands.len() as u8 & 0x0f);

        for operand in &self.operands {
            heap[offset] = operand.flags.bits();
            offset += 1;

            if operand.is_reg() {
                heap[offset] = operand.register();
                offset += 1;
                continue;
            }

            match self.size {
                OpSize::Byte => {
                    heap[offset] = operand.as_integer() as u8;
                    offset += 1;
                }
                OpSize::Word => {
                    let bytes = (operand.as_integer() as u16).to_le_bytes();
                    heap[offset..offset + 2].copy_from_slice(&bytes);
                    offset += 2;
                }
                OpSize::Dword => {
                    if operand.is_integer() {
                        let bytes =
                            (operand.as_integer() as u32).to_le_bytes();
                        heap[offset..offset + 4].copy_from_slice(&bytes);
                    } else {
                        let bytes =
                            (operand.as_float() as f32).to_le_bytes();
                        heap[offset..offset + 4].copy_from_slice(&bytes);
                    }
                    offset += 4;
                }
                OpSize::Qword => {
                    if operand.is_integer() {
                        let bytes = operand.as_integer().to_le_bytes();
                        heap[offset..offset + 8].copy_from_slice(&bytes);
                    } else {
                        let bytes = operand.as_float().to_le_bytes();
                        heap[offset..offset + 8].copy_from_slice(&bytes);
                    }
                    offset += 8;
                }
                OpSize::None => {
                    if operand.is_integer() {
                        result.error(
                            "B009",
                            "constant integers cannot have a size of 'none'.",
                            SourceLocation::default(),
                        );
                    } else {
                        result.error(
                            "B009",
                            "constant floats cannot have a size of 'none', 'byte', or 'word'.",
                            SourceLocation::default(),
                        );
                    }
                    return 0;
                }
            }
        }

        let encoded = Self::align(offset - start, ALIGNMENT);
        heap[start] = encoded as u8;
        encoded
    }

    /// Decode the instruction at `address`. Returns the instruction and its
    /// padded encoded length, or `None` after reporting a diagnostic.
    pub fn decode(
        result: &mut SessionResult,
        heap: &[u8],
        address: u64,
    ) -> Option<(Self, usize)> {
        if address % ALIGNMENT as u64 != 0 {
            result.error(
                "B003",
                format!(
                    "instruction alignment violation: alignment = {} bytes, address = ${:016X}",
                    ALIGNMENT, address,
                ),
                SourceLocation::default(),
            );
            return None;
        }

        let start = address as usize;
        let encoded_size = heap[start] as usize;
        let op = match OpCode::try_from(heap[start + 1]) {
            Ok(op) => op,
            Err(value) => {
                result.error(
                    "B001",
                    format!("invalid opcode: ${:02X}", value),
                    SourceLocation::default(),
                );
                return None;
            }
        };
        let size_and_count = heap[start + 2];
        let size = OpSize::from_nybble(size_and_count >> 4)?;
        let count = (size_and_count & 0x0f) as usize;

        let mut operands = Vec::with_capacity(count);
        let mut offset = start + BASE_SIZE;
        for _ in 0..count {
            let flags = OperandFlags::from_bits_truncate(heap[offset]);
            offset += 1;

            if flags.contains(OperandFlags::REG) {
                operands.push(Operand {
                    flags,
                    value: OperandValue::Integer(u64::from(heap[offset])),
                });
                offset += 1;
                continue;
            }

            let value = match size {
                OpSize::Byte => {
                    let value = OperandValue::Integer(u64::from(heap[offset]));
                    offset += 1;
                    value
                }
                OpSize::Word => {
                    let mut bytes = [0u8; 2];
                    bytes.copy_from_slice(&heap[offset..offset + 2]);
                    offset += 2;
                    OperandValue::Integer(u64::from(u16::from_le_bytes(bytes)))
                }
                OpSize::Dword => {
                    let mut bytes = [0u8; 4];
                    bytes.copy_from_slice(&heap[offset..offset + 4]);
                    offset += 4;
                    if flags.contains(OperandFlags::INTEGER) {
                        OperandValue::Integer(u64::from(u32::from_le_bytes(
                            bytes,
                        )))
                    } else {
                        OperandValue::Float(f64::from(f32::from_le_bytes(
                            bytes,
                        )))
                    }
                }
                OpSize::Qword => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&heap[offset..offset + 8]);
                    offset += 8;
                    if flags.contains(OperandFlags::INTEGER) {
                        OperandValue::Integer(u64::from_le_bytes(bytes))
                    } else {
                        OperandValue::Float(f64::from_le_bytes(bytes))
                    }
                }
                OpSize::None => {
                    if flags.contains(OperandFlags::INTEGER) {
                        result.error(
                            "B010",
                            "constant integers cannot have a size of 'none'.",
                            SourceLocation::default(),
                        );
                    } else {
                        result.error(
                            "B010",
                            "constant floats cannot have a size of 'none', 'byte', or 'word'.",
                            SourceLocation::default(),
                        );
                    }
                    return None;
                }
            };
            operands.push(Operand { flags, value });
        }

        Some((Instruction { op, size, operands }, encoded_size))
    }

    /// Patch a branch target operand after label resolution.
    pub fn patch_branch_address(&mut self, address: u64, index: usize) {
        self.operands[index].value = OperandValue::Integer(
            Self::align(address as usize, ALIGNMENT) as u64,
        );
    }

    /// Render the instruction as `MNEMONIC.SZ op0, op1, …`.
    pub fn disassemble(&self) -> String {
        let mut text = String::new();
        let mnemonic =
            format!("{}{}", self.op.mnemonic(), self.size.suffix());
        let _ = write!(text, "{:<10}", mnemonic);

        let mut rendered = String::new();
        for (i, operand) in self.operands.iter().enumerate() {
            if i > 0 {
                rendered.push_str(", ");
            }

            let (prefix, postfix) = if operand.is_negative() {
                (
                    if operand.is_prefix() { "--" } else { "-" },
                    if operand.is_postfix() { "--" } else { "" },
                )
            } else {
                (
                    if operand.is_prefix() { "++" } else { "" },
                    if operand.is_postfix() { "++" } else { "" },
                )
            };

            if operand.is_reg() {
                if operand.is_integer() {
                    let _ = write!(
                        rendered,
                        "{}{}{}",
                        prefix,
                        register_name(operand.register()),
                        postfix,
                    );
                } else {
                    let _ = write!(rendered, "F{}", operand.register());
                }
            } else if operand.is_integer() {
                if prefix == "-" {
                    let _ = write!(
                        rendered,
                        "{}",
                        operand.as_integer() as i64,
                    );
                } else {
                    let constant = match self.size {
                        OpSize::Byte => {
                            format!("#${:02X}", operand.as_integer())
                        }
                        OpSize::Word => {
                            format!("#${:04X}", operand.as_integer())
                        }
                        OpSize::Dword => {
                            format!("#${:08X}", operand.as_integer())
                        }
                        _ => format!("#${:016X}", operand.as_integer()),
                    };
                    let _ =
                        write!(rendered, "{}{}{}", prefix, constant, postfix);
                }
            } else {
                let _ = write!(
                    rendered,
                    "{}{}{}",
                    prefix,
                    operand.as_float(),
                    postfix,
                );
            }
        }

        let _ = write!(text, "{:<24}", rendered);
        text.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_qword_round_trip() {
        let mut result = SessionResult::new();
        let mut heap = vec![0u8; 64];

        let inst = Instruction::new(
            OpCode::Add,
            OpSize::Qword,
            vec![
                Operand::integer_register(0),
                Operand::integer_register(1),
                Operand::integer_register(2),
            ],
        );
        // 3 base bytes + 3 * (flag + register id) = 9, padded to 12
        assert_eq!(inst.encoding_size(), 12);

        let written = inst.encode(&mut result, &mut heap, 0);
        assert_eq!(written, 12);
        assert!(!result.is_failed());

        let (decoded, size) =
            Instruction::decode(&mut result, &heap, 0).unwrap();
        assert_eq!(size, 12);
        assert_eq!(decoded, inst);
        assert_eq!(decoded.operands.len(), 3);
        assert!(decoded.operands.iter().all(Operand::is_reg));
    }

    #[test]
    fn test_constant_operand_round_trip() {
        let mut result = SessionResult::new();
        let mut heap = vec![0u8; 64];

        let inst = Instruction::new(
            OpCode::Move,
            OpSize::Dword,
            vec![
                Operand::integer_register(3),
                Operand::integer_constant(0xDEAD_BEEF),
            ],
        );
        let written = inst.encode(&mut result, &mut heap, 4);
        assert!(written > 0);

        let (decoded, _) =
            Instruction::decode(&mut result, &heap, 4).unwrap();
        assert_eq!(decoded, inst);
        assert_eq!(decoded.operands[1].as_integer(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_float_constant_round_trip() {
        let mut result = SessionResult::new();
        let mut heap = vec![0u8; 64];

        let inst = Instruction::new(
            OpCode::Move,
            OpSize::Qword,
            vec![Operand::float_register(1), Operand::float_constant(2.5)],
        );
        inst.encode(&mut result, &mut heap, 0);
        let (decoded, _) =
            Instruction::decode(&mut result, &heap, 0).unwrap();
        assert_eq!(decoded.operands[1].as_float(), 2.5);
        assert!(!decoded.operands[1].is_integer());
    }

    #[test]
    fn test_misaligned_address_is_an_error() {
        let mut result = SessionResult::new();
        let mut heap = vec![0u8; 64];

        let inst = Instruction::new(OpCode::Nop, OpSize::None, vec![]);
        assert_eq!(inst.encode(&mut result, &mut heap, 2), 0);
        assert!(result.has_code("B003"));
    }

    #[test]
    fn test_constant_with_no_size_is_an_error() {
        let mut result = SessionResult::new();
        let mut heap = vec![0u8; 64];

        let inst = Instruction::new(
            OpCode::Push,
            OpSize::None,
            vec![Operand::integer_constant(1)],
        );
        assert_eq!(inst.encode(&mut result, &mut heap, 0), 0);
        assert!(result.has_code("B009"));
    }

    #[test]
    fn test_disassemble() {
        let inst = Instruction::new(
            OpCode::Add,
            OpSize::Qword,
            vec![
                Operand::integer_register(0),
                Operand::integer_register(1),
                Operand::integer_register(2),
            ],
        );
        assert_eq!(inst.disassemble(), "ADD.QW    I0, I1, I2");
    }
}
