//! Code generation: elements emit VM instructions into the assembler's
//! block tree. Module-level identifiers become data/constant segment
//! symbols (their symbol names double as labels); executable statements
//! emit into the root code block behind the `_start` entry label; each
//! procedure instance emits into its own child block with a minimal
//! FP-saved frame.

use crate::compiler::element::{ElementKind, IntrinsicKind, OperatorKind};
use crate::compiler::session::Session;
use crate::compiler::types::{NumberClass, TypeVariant};
use crate::compiler::BlockKind;
use crate::id::ElementId;
use crate::source::SourceLocation;
use crate::vm::assembler::{SegmentType, SymbolType, SymbolValue};
use crate::vm::block::InstructionBlockType;
use crate::vm::instruction::{OpCode, OpSize};
use std::collections::{HashMap, HashSet};

/// Label of the program entry point; the assembler's bootstrap jump
/// targets it.
pub(crate) const ENTRY_LABEL: &str = "_start";

/// Per-procedure emission state: parameter identifiers and their
/// FP-relative offsets.
#[derive(Default)]
struct EmitFrame {
    parameters: HashMap<ElementId, i64>,
}

impl Session {
    /// Phase 8: emit the whole program.
    pub(crate) fn emit_program(&mut self) -> bool {
        let program_block = match self
            .program
            .and_then(|program| self.elements.find(program))
            .and_then(|element| match &element.kind {
                ElementKind::Program(data) => data.block,
                _ => None,
            }) {
            Some(block) => block,
            None => return false,
        };

        let module_blocks = self.collect_module_blocks(program_block);
        self.build_data_segments(program_block);

        // entry code
        self.assembler.current_block().make_label(ENTRY_LABEL);
        let frame = EmitFrame::default();
        for module_block in &module_blocks {
            let statements = match self.elements.block(*module_block) {
                Some(block) => block.statements.clone(),
                None => continue,
            };
            for statement in statements {
                if !self.emit_statement(statement, &frame) {
                    return false;
                }
            }
        }
        self.assembler.current_block().exit();

        // procedure bodies
        self.emit_procedures()
    }

    /// Module blocks of the program, in elaboration order.
    fn collect_module_blocks(&self, root: ElementId) -> Vec<ElementId> {
        let mut modules = Vec::new();
        let mut stack = vec![root];
        while let Some(block_id) = stack.pop() {
            if let Some(block) = self.elements.block(block_id) {
                if block.kind == BlockKind::Module {
                    modules.push(block_id);
                }
                for child in block.blocks.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        modules
    }

    // --------------------------------------------------------------------
    // data segments

    /// Walk every non-procedure-type block and materialize heap
    /// identifiers as segment symbols. Constant identifiers land in the
    /// `constant` segment, the rest in `data`. Interned string literals
    /// get shared `_str_<n>` entries.
    fn build_data_segments(&mut self, root: ElementId) {
        let mut used_names: HashSet<String> = HashSet::new();
        let mut stack = vec![root];
        let mut identifiers = Vec::new();

        while let Some(block_id) = stack.pop() {
            let block = match self.elements.block(block_id) {
                Some(block) => block,
                None => continue,
            };
            // procedure-type blocks hold parameters and synthetic return
            // slots, which live in the frame, not in data
            if block.kind != BlockKind::ProcType {
                let mut ordered: Vec<ElementId> =
                    block.identifiers.values().copied().collect();
                ordered.sort();
                identifiers.extend(ordered);
            }
            for child in block.blocks.iter().rev() {
                stack.push(*child);
            }
        }

        for identifier in identifiers {
            self.materialize_identifier(identifier, &mut used_names);
        }

        // interned strings share one constant symbol per distinct value
        let mut interned: Vec<String> = self
            .scopes
            .interned_string_literals
            .keys()
            .cloned()
            .collect();
        interned.sort();
        for value in interned {
            let serial = self.elements.id_pool_mut().allocate();
            let label = format!("_str_{}", serial);
            let mut bytes = value.clone().into_bytes();
            bytes.push(0);
            let size = bytes.len();
            let segment =
                self.assembler.segment("constant", SegmentType::Constant);
            segment.initialized = true;
            let symbol =
                segment.symbol(label.clone(), SymbolType::Bytes, size);
            symbol.value = SymbolValue::Bytes(bytes);
            self.string_labels.insert(value, label);
        }
    }

    fn materialize_identifier(
        &mut self,
        identifier: ElementId,
        used_names: &mut HashSet<String>,
    ) {
        let data = match self.elements.identifier(identifier) {
            Some(data) => data.clone(),
            None => return,
        };

        // identifiers bound to types, namespaces, or module references
        // have no runtime storage; procedures get a code label instead
        let initializer_expression = data
            .initializer
            .and_then(|initializer| {
                match &self.elements.find(initializer)?.kind {
                    ElementKind::Initializer(init) => {
                        Some(init.expression)
                    }
                    _ => None,
                }
            });
        if let Some(expression) = initializer_expression {
            match self.elements.find(expression).map(|e| &e.kind) {
                Some(ElementKind::Namespace(_))
                | Some(ElementKind::ModuleReference(_)) => return,
                Some(ElementKind::Type(type_data)) => {
                    if type_data.is_procedure() {
                        let name =
                            self.unique_emit_name(identifier, used_names);
                        self.emit_names.insert(identifier, name);
                    }
                    return;
                }
                _ => {}
            }
        }

        let type_id = match data.type_id {
            Some(type_id) => type_id,
            None => return,
        };
        let type_data = match self.elements.type_data(type_id) {
            Some(type_data) => type_data.clone(),
            None => return,
        };

        let name = self.unique_emit_name(identifier, used_names);
        let segment_name = if data.constant { "constant" } else { "data" };
        let segment_type = if data.constant {
            SegmentType::Constant
        } else {
            SegmentType::Data
        };

        let (symbol_type, size, value) = match &type_data.variant {
            TypeVariant::Numeric { number_class, .. } => {
                match number_class {
                    NumberClass::FloatingPoint => {
                        let symbol_type = SymbolType::float_for_size(
                            type_data.size_in_bytes,
                        );
                        let value = initializer_expression
                            .and_then(|expression| {
                                self.constant_float_value(expression)
                            })
                            .map(SymbolValue::Float)
                            .unwrap_or(SymbolValue::None);
                        (symbol_type, type_data.size_in_bytes, value)
                    }
                    NumberClass::Integer => {
                        let symbol_type = SymbolType::integer_for_size(
                            type_data.size_in_bytes,
                        );
                        let value = initializer_expression
                            .and_then(|expression| {
                                self.constant_integer_value(expression)
                            })
                            .map(SymbolValue::Integer)
                            .unwrap_or(SymbolValue::None);
                        (symbol_type, type_data.size_in_bytes, value)
                    }
                }
            }
            TypeVariant::Bool => {
                let value = initializer_expression
                    .and_then(|expression| {
                        self.constant_integer_value(expression)
                    })
                    .map(SymbolValue::Integer)
                    .unwrap_or(SymbolValue::None);
                (SymbolType::U8, 1, value)
            }
            TypeVariant::String => {
                let value = initializer_expression
                    .and_then(|expression| {
                        self.elements
                            .as_string(expression)
                            .map(str::to_string)
                    })
                    .map(|text| {
                        let mut bytes = text.into_bytes();
                        bytes.push(0);
                        SymbolValue::Bytes(bytes)
                    })
                    .unwrap_or(SymbolValue::None);
                let size = match &value {
                    SymbolValue::Bytes(bytes) => bytes.len(),
                    _ => 8,
                };
                (SymbolType::Bytes, size, value)
            }
            TypeVariant::Pointer { .. } => {
                (SymbolType::U64, 8, SymbolValue::None)
            }
            TypeVariant::Composite { .. } | TypeVariant::Array { .. } => (
                SymbolType::Bytes,
                type_data.size_in_bytes.max(1),
                SymbolValue::None,
            ),
            _ => return,
        };

        let segment = self.assembler.segment(segment_name, segment_type);
        segment.initialized = true;
        let symbol = segment.symbol(name.clone(), symbol_type, size);
        symbol.value = value;
        self.emit_names.insert(identifier, name);
    }

    fn unique_emit_name(
        &mut self,
        identifier: ElementId,
        used_names: &mut HashSet<String>,
    ) -> String {
        let base = self
            .elements
            .identifier_name(identifier)
            .unwrap_or_default()
            .to_string();
        let name = if used_names.contains(&base) {
            format!("{}_{}", base, identifier.0)
        } else {
            base
        };
        used_names.insert(name.clone());
        name
    }

    // --------------------------------------------------------------------
    // statements

    fn emit_statement(
        &mut self,
        statement: ElementId,
        frame: &EmitFrame,
    ) -> bool {
        let (labels, expression) = match self.elements.find(statement) {
            Some(element) => match &element.kind {
                ElementKind::Statement(data) => {
                    (data.labels.clone(), data.expression)
                }
                // bare elements attached directly to a block
                _ => (Vec::new(), Some(statement)),
            },
            None => return true,
        };

        for label in labels {
            if let Some(ElementKind::Label(name)) =
                self.elements.find(label).map(|element| &element.kind)
            {
                let name = name.clone();
                self.assembler.current_block().make_label(name);
            }
        }

        let expression = match expression {
            Some(expression) => expression,
            None => return true,
        };

        match self.elements.find(expression).map(|e| &e.kind) {
            // declarations, types, directives, and comments emit nothing
            Some(ElementKind::Identifier(_))
            | Some(ElementKind::Type(_))
            | Some(ElementKind::Namespace(_))
            | Some(ElementKind::ModuleReference(_))
            | Some(ElementKind::Import(_))
            | Some(ElementKind::Comment(_))
            | Some(ElementKind::Directive(_))
            | Some(ElementKind::Attribute(_))
            | Some(ElementKind::Label(_)) => true,
            Some(_) => {
                match self.emit_expression(expression, frame) {
                    Some(Some(reg)) => {
                        self.assembler.current_block().free_ireg(reg);
                        true
                    }
                    Some(None) => true,
                    None => false,
                }
            }
            None => true,
        }
    }

    // --------------------------------------------------------------------
    // expressions
    //
    // `emit_expression` returns:
    //   None             — emission failed (diagnostic recorded)
    //   Some(None)       — emitted, no value produced
    //   Some(Some(reg))  — emitted, value lives in integer register `reg`

    fn emit_expression(
        &mut self,
        expression: ElementId,
        frame: &EmitFrame,
    ) -> Option<Option<u8>> {
        let location = self
            .elements
            .find(expression)
            .map(|element| element.location)
            .unwrap_or_default();
        let kind = self.elements.find(expression)?.kind.clone();
        match kind {
            ElementKind::IntegerLiteral(value) => {
                let reg = self.allocate_reg(location)?;
                self.assembler
                    .current_block()
                    .move_constant_to_ireg(OpSize::Qword, reg, value);
                Some(Some(reg))
            }
            ElementKind::BooleanLiteral(value) => {
                let reg = self.allocate_reg(location)?;
                self.assembler.current_block().move_constant_to_ireg(
                    OpSize::Qword,
                    reg,
                    u64::from(value),
                );
                Some(Some(reg))
            }
            ElementKind::FloatLiteral(value) => {
                // float expressions move raw bits through the integer
                // bank; runtime float arithmetic is still incomplete
                let reg = self.allocate_reg(location)?;
                self.assembler.current_block().move_constant_to_ireg(
                    OpSize::Qword,
                    reg,
                    value.to_bits(),
                );
                Some(Some(reg))
            }
            ElementKind::StringLiteral(value) => {
                let label = self.string_labels.get(&value)?.clone();
                let reg = self.allocate_reg(location)?;
                let block_index = self.assembler.current_block_index();
                let Session {
                    assembler, elements, ..
                } = self;
                assembler.block_mut(block_index).move_label_to_ireg(
                    elements.id_pool_mut(),
                    reg,
                    &label,
                );
                Some(Some(reg))
            }
            ElementKind::Expression(data) => {
                self.emit_expression(data.root, frame)
            }
            ElementKind::IdentifierReference(data) => {
                let identifier = match data.identifier {
                    Some(identifier) => identifier,
                    None => {
                        self.error(
                            "P051",
                            format!(
                                "missing variable binding: {}",
                                data.symbol,
                            ),
                            location,
                        );
                        return None;
                    }
                };
                self.emit_identifier_read(identifier, frame, location)
            }
            ElementKind::Identifier(_) => {
                self.emit_identifier_read(expression, frame, location)
            }
            ElementKind::UnaryOperator(data) => {
                self.emit_unary_operator(&data, frame, location)
            }
            ElementKind::BinaryOperator(data) => {
                if data.operator == OperatorKind::Assignment {
                    if self.emit_assignment(data.lhs, data.rhs, frame) {
                        Some(None)
                    } else {
                        None
                    }
                } else {
                    self.emit_binary_operator(&data, frame, location)
                }
            }
            ElementKind::Cast(data) => {
                let value = self.emit_expression(data.expression, frame)?;
                let reg = match value {
                    Some(reg) => reg,
                    None => return Some(None),
                };
                let size = self.type_op_size(data.type_id);
                let dest = self.allocate_reg(location)?;
                let block = self.assembler.current_block();
                block.move_constant_to_ireg(OpSize::Qword, dest, 0);
                block.move_sized_ireg_to_ireg(size, dest, reg);
                block.free_ireg(reg);
                Some(Some(dest))
            }
            ElementKind::Transmute(data) => {
                // transmute keeps the raw bits
                self.emit_expression(data.expression, frame)
            }
            ElementKind::Alias(data) => {
                self.emit_expression(data.expression, frame)
            }
            ElementKind::If(data) => {
                if self.emit_if(&data, frame) {
                    Some(None)
                } else {
                    None
                }
            }
            ElementKind::While(data) => {
                if self.emit_while(&data, frame) {
                    Some(None)
                } else {
                    None
                }
            }
            ElementKind::Return(data) => {
                if self.emit_return(&data.expressions, frame) {
                    Some(None)
                } else {
                    None
                }
            }
            ElementKind::ProcedureCall(data) => {
                self.emit_call(&data, frame, location)
            }
            ElementKind::Intrinsic(data) => {
                self.emit_intrinsic(&data, frame, location)
            }
            ElementKind::Block(data) => {
                let statements = data.statements.clone();
                for statement in statements {
                    if !self.emit_statement(statement, frame) {
                        return None;
                    }
                }
                Some(None)
            }
            ElementKind::Statement(_) => {
                if self.emit_statement(expression, frame) {
                    Some(None)
                } else {
                    None
                }
            }
            _ => Some(None),
        }
    }

    fn allocate_reg(&mut self, location: SourceLocation) -> Option<u8> {
        match self.assembler.current_block().allocate_ireg() {
            Some(reg) => Some(reg),
            None => {
                self.error(
                    "P052",
                    "integer registers exhausted during emit",
                    location,
                );
                None
            }
        }
    }

    /// The op size for loads/stores of a type's values.
    fn type_op_size(&self, type_id: ElementId) -> OpSize {
        self.elements
            .type_data(type_id)
            .map(|data| OpSize::for_byte_size(data.size_in_bytes))
            .unwrap_or(OpSize::Qword)
    }

    fn identifier_op_size(&self, identifier: ElementId) -> OpSize {
        self.elements
            .identifier(identifier)
            .and_then(|data| data.type_id)
            .map(|type_id| self.type_op_size(type_id))
            .unwrap_or(OpSize::Qword)
    }

    fn emit_identifier_read(
        &mut self,
        identifier: ElementId,
        frame: &EmitFrame,
        location: SourceLocation,
    ) -> Option<Option<u8>> {
        // procedure parameters read from the frame
        if let Some(offset) = frame.parameters.get(&identifier) {
            let offset = *offset;
            let reg = self.allocate_reg(location)?;
            self.assembler.current_block().load_to_ireg(
                OpSize::Qword,
                reg,
                crate::vm::instruction::REGISTER_FP,
                offset,
            );
            return Some(Some(reg));
        }

        if let Some(label) = self.emit_names.get(&identifier).cloned() {
            // pointer-access types (strings, composites, arrays) yield
            // their address; value-access types load through it
            let access = self
                .elements
                .identifier(identifier)
                .and_then(|data| data.type_id)
                .and_then(|type_id| self.elements.type_data(type_id))
                .map(|type_data| type_data.access_model())
                .unwrap_or(crate::compiler::AccessModel::Value);
            let size = self.identifier_op_size(identifier);
            let address_reg = self.allocate_reg(location)?;

            if access == crate::compiler::AccessModel::Pointer {
                let block_index = self.assembler.current_block_index();
                let Session {
                    assembler, elements, ..
                } = self;
                assembler.block_mut(block_index).move_label_to_ireg(
                    elements.id_pool_mut(),
                    address_reg,
                    &label,
                );
                return Some(Some(address_reg));
            }

            let value_reg = self.allocate_reg(location)?;
            let block_index = self.assembler.current_block_index();
            let Session {
                assembler, elements, ..
            } = self;
            let block = assembler.block_mut(block_index);
            block.move_label_to_ireg(
                elements.id_pool_mut(),
                address_reg,
                &label,
            );
            block.load_to_ireg(size, value_reg, address_reg, 0);
            block.free_ireg(address_reg);
            return Some(Some(value_reg));
        }

        // fall back to the compile-time value of constants
        if let Some(value) = self.constant_integer_value(identifier) {
            let reg = self.allocate_reg(location)?;
            self.assembler
                .current_block()
                .move_constant_to_ireg(OpSize::Qword, reg, value);
            return Some(Some(reg));
        }
        if let Some(value) = self.constant_float_value(identifier) {
            let reg = self.allocate_reg(location)?;
            self.assembler.current_block().move_constant_to_ireg(
                OpSize::Qword,
                reg,
                value.to_bits(),
            );
            return Some(Some(reg));
        }

        let name = self
            .elements
            .identifier_name(identifier)
            .unwrap_or_default()
            .to_string();
        self.error(
            "P051",
            format!("missing variable binding: {}", name),
            location,
        );
        None
    }

    fn emit_assignment(
        &mut self,
        lhs: ElementId,
        rhs: ElementId,
        frame: &EmitFrame,
    ) -> bool {
        let location = self
            .elements
            .find(lhs)
            .map(|element| element.location)
            .unwrap_or_default();

        let value_reg = match self.emit_expression(rhs, frame) {
            Some(Some(reg)) => reg,
            _ => return false,
        };

        let identifier = match self.elements.find(lhs).map(|e| &e.kind) {
            Some(ElementKind::IdentifierReference(data)) => data.identifier,
            Some(ElementKind::Identifier(_)) => Some(lhs),
            _ => None,
        };
        let identifier = match identifier {
            Some(identifier) => identifier,
            None => {
                self.error(
                    "P051",
                    "assignment target is not an identifier",
                    location,
                );
                return false;
            }
        };

        // frame slot or data symbol
        if let Some(offset) = frame.parameters.get(&identifier) {
            let offset = *offset;
            self.assembler.current_block().store_from_ireg(
                OpSize::Qword,
                crate::vm::instruction::REGISTER_FP,
                value_reg,
                offset,
            );
            self.assembler.current_block().free_ireg(value_reg);
            return true;
        }

        let label = match self.emit_names.get(&identifier).cloned() {
            Some(label) => label,
            None => {
                let name = self
                    .elements
                    .identifier_name(identifier)
                    .unwrap_or_default()
                    .to_string();
                self.error(
                    "P051",
                    format!("missing variable binding: {}", name),
                    location,
                );
                return false;
            }
        };

        let size = self.identifier_op_size(identifier);
        let address_reg = match self.allocate_reg(location) {
            Some(reg) => reg,
            None => return false,
        };
        let block_index = self.assembler.current_block_index();
        let Session {
            assembler, elements, ..
        } = self;
        let block = assembler.block_mut(block_index);
        block.move_label_to_ireg(
            elements.id_pool_mut(),
            address_reg,
            &label,
        );
        block.store_from_ireg(size, address_reg, value_reg, 0);
        block.free_ireg(address_reg);
        block.free_ireg(value_reg);
        true
    }

    fn emit_unary_operator(
        &mut self,
        data: &crate::compiler::element::UnaryOperatorData,
        frame: &EmitFrame,
        location: SourceLocation,
    ) -> Option<Option<u8>> {
        let value = match self.emit_expression(data.rhs, frame)? {
            Some(reg) => reg,
            None => return Some(None),
        };
        let dest = self.allocate_reg(location)?;
        let block = self.assembler.current_block();
        match data.operator {
            OperatorKind::Negate => {
                block.neg_ireg(OpSize::Qword, dest, value);
            }
            OperatorKind::BinaryNot => {
                block.not_ireg(OpSize::Qword, dest, value);
            }
            OperatorKind::LogicalNot => {
                block.test_ireg(OpSize::Qword, value, value);
                block.setz(dest);
            }
            _ => {
                block.free_ireg(dest);
                block.free_ireg(value);
                self.error(
                    "P052",
                    "unsupported unary operator in emit",
                    location,
                );
                return None;
            }
        }
        block.free_ireg(value);
        Some(Some(dest))
    }

    fn emit_binary_operator(
        &mut self,
        data: &crate::compiler::element::BinaryOperatorData,
        frame: &EmitFrame,
        location: SourceLocation,
    ) -> Option<Option<u8>> {
        let lhs = match self.emit_expression(data.lhs, frame)? {
            Some(reg) => reg,
            None => return Some(None),
        };
        let rhs = match self.emit_expression(data.rhs, frame)? {
            Some(reg) => reg,
            None => return Some(None),
        };

        let size = self
            .infer_type(data.lhs)
            .map(|type_id| self.type_op_size(type_id))
            .unwrap_or(OpSize::Qword);

        let alu = match data.operator {
            OperatorKind::Add => Some(OpCode::Add),
            OperatorKind::Subtract => Some(OpCode::Sub),
            OperatorKind::Multiply => Some(OpCode::Mul),
            OperatorKind::Divide => Some(OpCode::Div),
            OperatorKind::Modulo => Some(OpCode::Mod),
            OperatorKind::BinaryAnd | OperatorKind::LogicalAnd => {
                Some(OpCode::And)
            }
            OperatorKind::BinaryOr | OperatorKind::LogicalOr => {
                Some(OpCode::Or)
            }
            OperatorKind::BinaryXor => Some(OpCode::Xor),
            OperatorKind::ShiftLeft => Some(OpCode::Shl),
            OperatorKind::ShiftRight => Some(OpCode::Shr),
            OperatorKind::RotateLeft => Some(OpCode::Rol),
            OperatorKind::RotateRight => Some(OpCode::Ror),
            _ => None,
        };

        if let Some(op) = alu {
            let dest = self.allocate_reg(location)?;
            let block = self.assembler.current_block();
            block.alu_ireg(op, size, dest, lhs, rhs);
            block.free_ireg(lhs);
            block.free_ireg(rhs);
            return Some(Some(dest));
        }

        // comparisons: compare, then materialize the flag result
        let dest = self.allocate_reg(location)?;
        match data.operator {
            OperatorKind::Equals => {
                let block = self.assembler.current_block();
                block.cmp_ireg(size, lhs, rhs);
                block.setz(dest);
            }
            OperatorKind::NotEquals => {
                let block = self.assembler.current_block();
                block.cmp_ireg(size, lhs, rhs);
                block.setnz(dest);
            }
            OperatorKind::GreaterThan
            | OperatorKind::GreaterThanOrEqual
            | OperatorKind::LessThan
            | OperatorKind::LessThanOrEqual => {
                let branch = match data.operator {
                    OperatorKind::GreaterThan => OpCode::Bg,
                    OperatorKind::GreaterThanOrEqual => OpCode::Bge,
                    OperatorKind::LessThan => OpCode::Bl,
                    _ => OpCode::Ble,
                };
                let serial = self.elements.id_pool_mut().allocate();
                let true_label = format!("_cmp_true_{}", serial);
                let end_label = format!("_cmp_end_{}", serial);
                let block_index = self.assembler.current_block_index();
                let Session {
                    assembler, elements, ..
                } = self;
                let block = assembler.block_mut(block_index);
                let ids = elements.id_pool_mut();
                block.cmp_ireg(size, lhs, rhs);
                block.branch_on_flags(ids, branch, &true_label);
                block.move_constant_to_ireg(OpSize::Qword, dest, 0);
                block.jump_direct(ids, &end_label);
                block.make_label(true_label);
                block.move_constant_to_ireg(OpSize::Qword, dest, 1);
                block.make_label(end_label);
            }
            _ => {
                self.assembler.current_block().free_ireg(dest);
                self.error(
                    "P052",
                    "unsupported binary operator in emit",
                    location,
                );
                return None;
            }
        }
        let block = self.assembler.current_block();
        block.free_ireg(lhs);
        block.free_ireg(rhs);
        Some(Some(dest))
    }

    fn emit_if(
        &mut self,
        data: &crate::compiler::element::IfData,
        frame: &EmitFrame,
    ) -> bool {
        let serial = self.elements.id_pool_mut().allocate();
        let false_label = format!("_if_false_{}", serial);
        let end_label = format!("_if_end_{}", serial);

        let predicate = match self.emit_expression(data.predicate, frame) {
            Some(Some(reg)) => reg,
            _ => return false,
        };
        {
            let block_index = self.assembler.current_block_index();
            let Session {
                assembler, elements, ..
            } = self;
            let block = assembler.block_mut(block_index);
            block.branch_if_zero(
                elements.id_pool_mut(),
                predicate,
                &false_label,
            );
            block.free_ireg(predicate);
        }

        if self.emit_expression(data.true_branch, frame).is_none() {
            return false;
        }
        {
            let block_index = self.assembler.current_block_index();
            let Session {
                assembler, elements, ..
            } = self;
            let block = assembler.block_mut(block_index);
            block.jump_direct(elements.id_pool_mut(), &end_label);
            block.make_label(false_label);
        }

        if let Some(false_branch) = data.false_branch {
            if self.emit_expression(false_branch, frame).is_none() {
                return false;
            }
        }
        self.assembler.current_block().make_label(end_label);
        true
    }

    fn emit_while(
        &mut self,
        data: &crate::compiler::element::WhileData,
        frame: &EmitFrame,
    ) -> bool {
        let serial = self.elements.id_pool_mut().allocate();
        let top_label = format!("_while_top_{}", serial);
        let exit_label = format!("_while_exit_{}", serial);

        self.assembler.current_block().make_label(top_label.clone());
        let predicate = match self.emit_expression(data.predicate, frame) {
            Some(Some(reg)) => reg,
            _ => return false,
        };
        {
            let block_index = self.assembler.current_block_index();
            let Session {
                assembler, elements, ..
            } = self;
            let block = assembler.block_mut(block_index);
            block.branch_if_zero(
                elements.id_pool_mut(),
                predicate,
                &exit_label,
            );
            block.free_ireg(predicate);
        }

        if self.emit_expression(data.body, frame).is_none() {
            return false;
        }
        {
            let block_index = self.assembler.current_block_index();
            let Session {
                assembler, elements, ..
            } = self;
            let block = assembler.block_mut(block_index);
            block.jump_direct(elements.id_pool_mut(), &top_label);
            block.make_label(exit_label);
        }
        true
    }

    /// Returns leave the first value in I0, restore the caller's frame,
    /// and `RTS`.
    fn emit_return(
        &mut self,
        expressions: &[ElementId],
        frame: &EmitFrame,
    ) -> bool {
        if let Some(first) = expressions.first() {
            let value = match self.emit_expression(*first, frame) {
                Some(Some(reg)) => reg,
                _ => return false,
            };
            let block = self.assembler.current_block();
            block.move_ireg_to_ireg(0, value);
            block.free_ireg(value);
        }
        let block = self.assembler.current_block();
        block.move_ireg_to_ireg(
            crate::vm::instruction::REGISTER_SP,
            crate::vm::instruction::REGISTER_FP,
        );
        block.pop_ireg(OpSize::Qword, crate::vm::instruction::REGISTER_FP);
        block.rts();
        true
    }

    fn emit_call(
        &mut self,
        data: &crate::compiler::element::ProcedureCallData,
        frame: &EmitFrame,
        location: SourceLocation,
    ) -> Option<Option<u8>> {
        let identifier = match self
            .elements
            .find(data.reference)
            .map(|element| &element.kind)
        {
            Some(ElementKind::IdentifierReference(reference)) => {
                reference.identifier
            }
            _ => None,
        };
        let identifier = match identifier {
            Some(identifier) => identifier,
            None => {
                self.error(
                    "P051",
                    "call target is unresolved",
                    location,
                );
                return None;
            }
        };
        let proc_type = match self.procedure_type_of(identifier) {
            Some(proc_type) => proc_type,
            None => {
                self.error(
                    "P051",
                    "call target is not a procedure",
                    location,
                );
                return None;
            }
        };
        let (is_foreign, foreign_index, returns) =
            match &self.elements.type_data(proc_type)?.variant {
                TypeVariant::Procedure {
                    is_foreign,
                    foreign_index,
                    returns,
                    ..
                } => (*is_foreign, *foreign_index, returns.len()),
                _ => return None,
            };

        let arguments = match self
            .elements
            .find(data.arguments)
            .map(|element| &element.kind)
        {
            Some(ElementKind::ArgumentList(list)) => list.elements.clone(),
            _ => Vec::new(),
        };

        // push arguments in reverse declared order: the callee (or the
        // FFI bridge) pops them first-argument-first
        let argument_count = arguments.len() as u64;
        for argument in arguments.iter().rev() {
            let reg = match self.emit_expression(*argument, frame)? {
                Some(reg) => reg,
                None => return None,
            };
            let block = self.assembler.current_block();
            block.push_ireg(OpSize::Qword, reg);
            block.free_ireg(reg);
        }

        if is_foreign {
            let index = match foreign_index {
                Some(index) => index as u64,
                None => {
                    self.error(
                        "P044",
                        "foreign procedure was never registered",
                        location,
                    );
                    return None;
                }
            };
            self.assembler.current_block().call_foreign(index);
            if returns > 0 {
                let reg = self.allocate_reg(location)?;
                self.assembler
                    .current_block()
                    .pop_ireg(OpSize::Qword, reg);
                return Some(Some(reg));
            }
            return Some(None);
        }

        let label = match self.emit_names.get(&identifier).cloned() {
            Some(label) => label,
            None => {
                self.error(
                    "P051",
                    "procedure has no emitted body",
                    location,
                );
                return None;
            }
        };
        {
            let block_index = self.assembler.current_block_index();
            let Session {
                assembler, elements, ..
            } = self;
            assembler
                .block_mut(block_index)
                .call(elements.id_pool_mut(), &label);
        }

        // drop the pushed arguments
        if argument_count > 0 {
            let scratch = self.allocate_reg(location)?;
            let block = self.assembler.current_block();
            block.move_constant_to_ireg(
                OpSize::Qword,
                scratch,
                argument_count * 8,
            );
            block.alu_ireg(
                OpCode::Add,
                OpSize::Qword,
                crate::vm::instruction::REGISTER_SP,
                crate::vm::instruction::REGISTER_SP,
                scratch,
            );
            block.free_ireg(scratch);
        }

        if returns > 0 {
            let reg = self.allocate_reg(location)?;
            self.assembler.current_block().move_ireg_to_ireg(reg, 0);
            return Some(Some(reg));
        }
        Some(None)
    }

    fn emit_intrinsic(
        &mut self,
        data: &crate::compiler::element::IntrinsicData,
        frame: &EmitFrame,
        location: SourceLocation,
    ) -> Option<Option<u8>> {
        let arguments = match self
            .elements
            .find(data.arguments)
            .map(|element| &element.kind)
        {
            Some(ElementKind::ArgumentList(list)) => list.elements.clone(),
            _ => Vec::new(),
        };

        let expect = |count: usize| arguments.len() == count;

        match data.kind {
            IntrinsicKind::Alloc => {
                if !expect(1) {
                    self.intrinsic_arity_error(data.kind, location);
                    return None;
                }
                let size = match self.emit_expression(arguments[0], frame)?
                {
                    Some(reg) => reg,
                    None => return None,
                };
                let dest = self.allocate_reg(location)?;
                let block = self.assembler.current_block();
                block.alloc(OpSize::Byte, dest, size);
                block.free_ireg(size);
                Some(Some(dest))
            }
            IntrinsicKind::Free => {
                if !expect(1) {
                    self.intrinsic_arity_error(data.kind, location);
                    return None;
                }
                let address =
                    match self.emit_expression(arguments[0], frame)? {
                        Some(reg) => reg,
                        None => return None,
                    };
                let block = self.assembler.current_block();
                block.free(address);
                block.free_ireg(address);
                Some(None)
            }
            IntrinsicKind::Copy => {
                if !expect(3) {
                    self.intrinsic_arity_error(data.kind, location);
                    return None;
                }
                let target =
                    match self.emit_expression(arguments[0], frame)? {
                        Some(reg) => reg,
                        None => return None,
                    };
                let source =
                    match self.emit_expression(arguments[1], frame)? {
                        Some(reg) => reg,
                        None => return None,
                    };
                let length =
                    match self.emit_expression(arguments[2], frame)? {
                        Some(reg) => reg,
                        None => return None,
                    };
                let block = self.assembler.current_block();
                block.copy(OpSize::Byte, source, target, length);
                block.free_ireg(target);
                block.free_ireg(source);
                block.free_ireg(length);
                Some(None)
            }
            IntrinsicKind::Fill => {
                if !expect(3) {
                    self.intrinsic_arity_error(data.kind, location);
                    return None;
                }
                let address =
                    match self.emit_expression(arguments[0], frame)? {
                        Some(reg) => reg,
                        None => return None,
                    };
                let value =
                    match self.emit_expression(arguments[1], frame)? {
                        Some(reg) => reg,
                        None => return None,
                    };
                let length =
                    match self.emit_expression(arguments[2], frame)? {
                        Some(reg) => reg,
                        None => return None,
                    };
                let block = self.assembler.current_block();
                block.fill(OpSize::Byte, value, address, length);
                block.free_ireg(address);
                block.free_ireg(value);
                block.free_ireg(length);
                Some(None)
            }
            // size_of / align_of fold before emission; type_of has no
            // runtime form yet
            IntrinsicKind::SizeOf
            | IntrinsicKind::AlignOf
            | IntrinsicKind::TypeOf => {
                self.error(
                    "P091",
                    format!(
                        "{} cannot be emitted at runtime",
                        data.kind.name(),
                    ),
                    location,
                );
                None
            }
        }
    }

    fn intrinsic_arity_error(
        &mut self,
        kind: IntrinsicKind,
        location: SourceLocation,
    ) {
        self.error(
            "P091",
            format!("wrong number of arguments for {}", kind.name()),
            location,
        );
    }

    // --------------------------------------------------------------------
    // procedures

    fn emit_procedures(&mut self) -> bool {
        let proc_types = self
            .elements
            .find_by_tag(crate::compiler::ElementTag::ProcedureType);
        for proc_type in proc_types {
            let (is_foreign, parameters, instances) =
                match &self.elements.type_data(proc_type) {
                    Some(type_data) => match &type_data.variant {
                        TypeVariant::Procedure {
                            is_foreign,
                            parameters,
                            instances,
                            ..
                        } => (
                            *is_foreign,
                            parameters.clone(),
                            instances.clone(),
                        ),
                        _ => continue,
                    },
                    None => continue,
                };
            if is_foreign || instances.is_empty() {
                continue;
            }

            // the label is the owning identifier's emitted name
            let label = match self.proc_label(proc_type) {
                Some(label) => label,
                None => continue,
            };

            let mut frame = EmitFrame::default();
            for (index, field) in parameters.iter().enumerate() {
                if let Some(identifier) = self.field_identifier(*field) {
                    frame
                        .parameters
                        .insert(identifier, 16 + (index as i64) * 8);
                }
            }

            let block_index = self
                .assembler
                .make_block(InstructionBlockType::Procedure);
            self.assembler.push_block(block_index);
            {
                let block = self.assembler.current_block();
                block.make_label(label);
                // prologue: save and establish the frame pointer
                block.push_ireg(
                    OpSize::Qword,
                    crate::vm::instruction::REGISTER_FP,
                );
                block.move_ireg_to_ireg(
                    crate::vm::instruction::REGISTER_FP,
                    crate::vm::instruction::REGISTER_SP,
                );
            }

            for instance in instances {
                let body = match self
                    .elements
                    .find(instance)
                    .map(|element| &element.kind)
                {
                    Some(ElementKind::ProcedureInstance(data)) => {
                        data.scope
                    }
                    _ => continue,
                };
                if self.emit_expression(body, &frame).is_none() {
                    self.assembler.pop_block();
                    return false;
                }
            }

            // fall-through epilogue for bodies without a return
            {
                let block = self.assembler.current_block();
                block.move_ireg_to_ireg(
                    crate::vm::instruction::REGISTER_SP,
                    crate::vm::instruction::REGISTER_FP,
                );
                block.pop_ireg(
                    OpSize::Qword,
                    crate::vm::instruction::REGISTER_FP,
                );
                block.rts();
            }
            self.assembler.pop_block();
        }
        true
    }

    /// The emitted label of the identifier bound to a procedure type.
    fn proc_label(&self, proc_type: ElementId) -> Option<String> {
        for (identifier, name) in &self.emit_names {
            if self.procedure_type_of(*identifier) == Some(proc_type) {
                return Some(name.clone());
            }
        }
        None
    }
}
