//! Constant folding and type inference. `fold_element` replaces an element
//! with a simpler equivalent (a fresh literal) when its operands are
//! directly literal; it never reaches through identifier references, so
//! resolved references survive folding and stay observable. The deeper
//! `constant_*_value` evaluators do traverse constant identifiers and feed
//! data-segment initial values at emit time.

use crate::compiler::element::{ElementKind, IntrinsicKind, OperatorKind};
use crate::compiler::session::Session;
use crate::compiler::types::TypeVariant;
use crate::compiler::QualifiedSymbol;
use crate::id::ElementId;

impl Session {
    // --------------------------------------------------------------------
    // type inference

    pub(crate) fn find_core_type(&self, name: &str) -> Option<ElementId> {
        self.scopes.find_type(
            &self.elements,
            &QualifiedSymbol::unqualified(name, Default::default()),
            None,
        )
    }

    /// Compute the type of an element. Idempotent; allocates only when an
    /// interned array or pointer type has to be materialized.
    pub(crate) fn infer_type(
        &mut self,
        id: ElementId,
    ) -> Option<ElementId> {
        let element = self.elements.find(id)?;
        match &element.kind {
            // TODO: width-aware integer literal inference; u32 for now
            ElementKind::IntegerLiteral(_) => self.find_core_type("u32"),
            ElementKind::FloatLiteral(_) => self.find_core_type("f64"),
            ElementKind::BooleanLiteral(_) => self.find_core_type("bool"),
            ElementKind::StringLiteral(_) => self.find_core_type("string"),
            ElementKind::Identifier(data) => data.type_id,
            ElementKind::IdentifierReference(data) => {
                let identifier = data.identifier?;
                self.elements.identifier(identifier)?.type_id
            }
            ElementKind::TypeReference(data) => data.type_id,
            ElementKind::UnaryOperator(data) => {
                if data.operator == OperatorKind::LogicalNot {
                    self.find_core_type("bool")
                } else {
                    let rhs = data.rhs;
                    self.infer_type(rhs)
                }
            }
            ElementKind::BinaryOperator(data) => {
                if data.operator.is_boolean() {
                    self.find_core_type("bool")
                } else {
                    let (lhs, rhs) = (data.lhs, data.rhs);
                    self.infer_type(lhs).or_else(|| self.infer_type(rhs))
                }
            }
            ElementKind::Cast(data) | ElementKind::Transmute(data) => {
                Some(data.type_id)
            }
            ElementKind::Alias(data) => {
                let expression = data.expression;
                self.infer_type(expression)
            }
            ElementKind::Expression(data) => {
                let root = data.root;
                self.infer_type(root)
            }
            ElementKind::Initializer(data) => {
                let expression = data.expression;
                self.infer_type(expression)
            }
            ElementKind::Intrinsic(data) => match data.kind {
                IntrinsicKind::SizeOf | IntrinsicKind::AlignOf => {
                    self.find_core_type("u32")
                }
                IntrinsicKind::Alloc => self.find_core_type("address"),
                IntrinsicKind::TypeOf => self.find_core_type("type"),
                IntrinsicKind::Free
                | IntrinsicKind::Copy
                | IntrinsicKind::Fill => None,
            },
            ElementKind::ProcedureCall(data) => {
                let reference = data.reference;
                let identifier = match &self.elements.find(reference)?.kind
                {
                    ElementKind::IdentifierReference(reference) => {
                        reference.identifier?
                    }
                    _ => return None,
                };
                let proc_type = self.procedure_type_of(identifier)?;
                let returns =
                    match &self.elements.type_data(proc_type)?.variant {
                        TypeVariant::Procedure { returns, .. } => {
                            returns.clone()
                        }
                        _ => return None,
                    };
                let field = *returns.first()?;
                let return_identifier = self.field_identifier(field)?;
                self.elements.identifier(return_identifier)?.type_id
            }
            ElementKind::Namespace(_) => self.find_core_type("namespace"),
            ElementKind::ModuleReference(_) => {
                self.find_core_type("module")
            }
            // an identifier bound to a type declaration carries the type
            // itself
            ElementKind::Type(_) => Some(id),
            _ => None,
        }
    }

    // --------------------------------------------------------------------
    // shallow literal extraction (does not reach through references)

    fn literal_integer(&self, id: ElementId) -> Option<u64> {
        match &self.elements.find(id)?.kind {
            ElementKind::IntegerLiteral(value) => Some(*value),
            ElementKind::BooleanLiteral(value) => Some(u64::from(*value)),
            ElementKind::Expression(data) => self.literal_integer(data.root),
            _ => None,
        }
    }

    fn literal_float(&self, id: ElementId) -> Option<f64> {
        match &self.elements.find(id)?.kind {
            ElementKind::FloatLiteral(value) => Some(*value),
            ElementKind::IntegerLiteral(value) => Some(*value as f64),
            ElementKind::Expression(data) => self.literal_float(data.root),
            _ => None,
        }
    }

    fn is_float_operand(&self, id: ElementId) -> bool {
        match self.elements.find(id).map(|element| &element.kind) {
            Some(ElementKind::FloatLiteral(_)) => true,
            Some(ElementKind::Expression(data)) => {
                self.is_float_operand(data.root)
            }
            _ => false,
        }
    }

    // --------------------------------------------------------------------
    // folding

    /// Produce a simpler replacement for `id`, or `None` when it cannot
    /// fold. The replacement is registered but not yet spliced into the
    /// parent; the caller installs it and removes the original.
    pub(crate) fn fold_element(
        &mut self,
        id: ElementId,
    ) -> Option<ElementId> {
        let element = self.elements.find(id)?;
        let location = element.location;
        match element.kind.clone() {
            ElementKind::UnaryOperator(data) => {
                match data.operator {
                    OperatorKind::Negate => {
                        if self.is_float_operand(data.rhs) {
                            let value = self.literal_float(data.rhs)?;
                            Some(self.make_float(-value, location))
                        } else {
                            let value = self.literal_integer(data.rhs)?;
                            Some(self.make_integer(
                                (value as i64).wrapping_neg() as u64,
                                location,
                            ))
                        }
                    }
                    OperatorKind::BinaryNot => {
                        let value = self.literal_integer(data.rhs)?;
                        Some(self.make_integer(!value, location))
                    }
                    OperatorKind::LogicalNot => {
                        let value =
                            self.elements.as_bool(data.rhs)?;
                        Some(self.make_bool(!value, location))
                    }
                    _ => None,
                }
            }
            ElementKind::BinaryOperator(data) => {
                if data.operator == OperatorKind::Assignment {
                    return None;
                }
                let float = self.is_float_operand(data.lhs)
                    || self.is_float_operand(data.rhs);
                if float {
                    let lhs = self.literal_float(data.lhs)?;
                    let rhs = self.literal_float(data.rhs)?;
                    self.fold_float_operator(
                        data.operator,
                        lhs,
                        rhs,
                        location,
                    )
                } else {
                    let lhs = self.literal_integer(data.lhs)?;
                    let rhs = self.literal_integer(data.rhs)?;
                    self.fold_integer_operator(
                        data.operator,
                        lhs,
                        rhs,
                        location,
                    )
                }
            }
            ElementKind::Intrinsic(data) => {
                self.fold_intrinsic(data.kind, data.arguments, location)
            }
            ElementKind::Expression(data) => self.fold_element(data.root),
            _ => None,
        }
    }

    fn fold_integer_operator(
        &mut self,
        operator: OperatorKind,
        lhs: u64,
        rhs: u64,
        location: crate::source::SourceLocation,
    ) -> Option<ElementId> {
        let value = match operator {
            OperatorKind::Add => lhs.wrapping_add(rhs),
            OperatorKind::Subtract => lhs.wrapping_sub(rhs),
            OperatorKind::Multiply => lhs.wrapping_mul(rhs),
            OperatorKind::Divide => {
                if rhs == 0 {
                    return None;
                }
                lhs / rhs
            }
            OperatorKind::Modulo => {
                if rhs == 0 {
                    return None;
                }
                lhs % rhs
            }
            OperatorKind::BinaryAnd => lhs & rhs,
            OperatorKind::BinaryOr => lhs | rhs,
            OperatorKind::BinaryXor => lhs ^ rhs,
            OperatorKind::ShiftLeft => lhs.wrapping_shl(rhs as u32),
            OperatorKind::ShiftRight => lhs.wrapping_shr(rhs as u32),
            OperatorKind::RotateLeft => lhs.rotate_left(rhs as u32),
            OperatorKind::RotateRight => lhs.rotate_right(rhs as u32),
            OperatorKind::Equals => {
                return Some(self.make_bool(lhs == rhs, location));
            }
            OperatorKind::NotEquals => {
                return Some(self.make_bool(lhs != rhs, location));
            }
            OperatorKind::GreaterThan => {
                return Some(self.make_bool(lhs > rhs, location));
            }
            OperatorKind::GreaterThanOrEqual => {
                return Some(self.make_bool(lhs >= rhs, location));
            }
            OperatorKind::LessThan => {
                return Some(self.make_bool(lhs < rhs, location));
            }
            OperatorKind::LessThanOrEqual => {
                return Some(self.make_bool(lhs <= rhs, location));
            }
            OperatorKind::LogicalAnd => {
                return Some(
                    self.make_bool(lhs != 0 && rhs != 0, location),
                );
            }
            OperatorKind::LogicalOr => {
                return Some(
                    self.make_bool(lhs != 0 || rhs != 0, location),
                );
            }
            _ => return None,
        };
        Some(self.make_integer(value, location))
    }

    fn fold_float_operator(
        &mut self,
        operator: OperatorKind,
        lhs: f64,
        rhs: f64,
        location: crate::source::SourceLocation,
    ) -> Option<ElementId> {
        let value = match operator {
            OperatorKind::Add => lhs + rhs,
            OperatorKind::Subtract => lhs - rhs,
            OperatorKind::Multiply => lhs * rhs,
            OperatorKind::Divide => {
                if rhs == 0.0 {
                    return None;
                }
                lhs / rhs
            }
            OperatorKind::Equals => {
                return Some(self.make_bool(lhs == rhs, location));
            }
            OperatorKind::NotEquals => {
                return Some(self.make_bool(lhs != rhs, location));
            }
            OperatorKind::GreaterThan => {
                return Some(self.make_bool(lhs > rhs, location));
            }
            OperatorKind::GreaterThanOrEqual => {
                return Some(self.make_bool(lhs >= rhs, location));
            }
            OperatorKind::LessThan => {
                return Some(self.make_bool(lhs < rhs, location));
            }
            OperatorKind::LessThanOrEqual => {
                return Some(self.make_bool(lhs <= rhs, location));
            }
            _ => return None,
        };
        Some(self.make_float(value, location))
    }

    /// Fold the constant intrinsics: `size_of` and `align_of` reduce to
    /// integer literals once their argument names a known type.
    fn fold_intrinsic(
        &mut self,
        kind: IntrinsicKind,
        arguments: ElementId,
        location: crate::source::SourceLocation,
    ) -> Option<ElementId> {
        if !kind.is_constant() {
            return None;
        }
        let elements = match &self.elements.find(arguments)?.kind {
            ElementKind::ArgumentList(data) => data.elements.clone(),
            _ => return None,
        };
        if elements.len() != 1 {
            self.error(
                "P091",
                format!(
                    "{} expects exactly one argument",
                    kind.name(),
                ),
                location,
            );
            return None;
        }

        let type_id = self.intrinsic_argument_type(elements[0]);
        let type_id = match type_id {
            Some(type_id) => type_id,
            None => {
                self.error(
                    "P091",
                    format!(
                        "{} argument does not name a type",
                        kind.name(),
                    ),
                    location,
                );
                return None;
            }
        };

        let type_data = self.elements.type_data(type_id)?;
        let value = match kind {
            IntrinsicKind::SizeOf => type_data.size_in_bytes as u64,
            IntrinsicKind::AlignOf => type_data.alignment() as u64,
            _ => return None,
        };
        Some(self.make_integer(value, location))
    }

    /// The type an intrinsic argument denotes: a type reference's target,
    /// a referenced identifier's type, or a type element directly.
    fn intrinsic_argument_type(
        &mut self,
        argument: ElementId,
    ) -> Option<ElementId> {
        match &self.elements.find(argument)?.kind {
            ElementKind::TypeReference(data) => data.type_id,
            ElementKind::Type(_) => Some(argument),
            ElementKind::IdentifierReference(data) => {
                let identifier = data.identifier?;
                self.elements.identifier(identifier)?.type_id
            }
            ElementKind::Expression(data) => {
                let root = data.root;
                self.intrinsic_argument_type(root)
            }
            _ => None,
        }
    }

    // --------------------------------------------------------------------
    // deep constant evaluation (reaches through constant identifiers);
    // feeds data-segment initial values at emit time

    pub(crate) fn constant_integer_value(
        &self,
        id: ElementId,
    ) -> Option<u64> {
        match &self.elements.find(id)?.kind {
            ElementKind::IntegerLiteral(value) => Some(*value),
            ElementKind::BooleanLiteral(value) => Some(u64::from(*value)),
            ElementKind::Expression(data) => {
                self.constant_integer_value(data.root)
            }
            ElementKind::Initializer(data) => {
                self.constant_integer_value(data.expression)
            }
            ElementKind::Identifier(data) => {
                self.constant_integer_value(data.initializer?)
            }
            ElementKind::IdentifierReference(data) => {
                self.constant_integer_value(data.identifier?)
            }
            ElementKind::UnaryOperator(data) => {
                let value = self.constant_integer_value(data.rhs)?;
                match data.operator {
                    OperatorKind::Negate => {
                        Some((value as i64).wrapping_neg() as u64)
                    }
                    OperatorKind::BinaryNot => Some(!value),
                    OperatorKind::LogicalNot => {
                        Some(u64::from(value == 0))
                    }
                    _ => None,
                }
            }
            ElementKind::BinaryOperator(data) => {
                let lhs = self.constant_integer_value(data.lhs)?;
                let rhs = self.constant_integer_value(data.rhs)?;
                match data.operator {
                    OperatorKind::Add => Some(lhs.wrapping_add(rhs)),
                    OperatorKind::Subtract => Some(lhs.wrapping_sub(rhs)),
                    OperatorKind::Multiply => Some(lhs.wrapping_mul(rhs)),
                    OperatorKind::Divide if rhs != 0 => Some(lhs / rhs),
                    OperatorKind::Modulo if rhs != 0 => Some(lhs % rhs),
                    OperatorKind::BinaryAnd => Some(lhs & rhs),
                    OperatorKind::BinaryOr => Some(lhs | rhs),
                    OperatorKind::BinaryXor => Some(lhs ^ rhs),
                    OperatorKind::ShiftLeft => {
                        Some(lhs.wrapping_shl(rhs as u32))
                    }
                    OperatorKind::ShiftRight => {
                        Some(lhs.wrapping_shr(rhs as u32))
                    }
                    OperatorKind::RotateLeft => {
                        Some(lhs.rotate_left(rhs as u32))
                    }
                    OperatorKind::RotateRight => {
                        Some(lhs.rotate_right(rhs as u32))
                    }
                    _ => None,
                }
            }
            ElementKind::Cast(data) | ElementKind::Transmute(data) => {
                self.constant_integer_value(data.expression)
            }
            _ => None,
        }
    }

    pub(crate) fn constant_float_value(
        &self,
        id: ElementId,
    ) -> Option<f64> {
        match &self.elements.find(id)?.kind {
            ElementKind::FloatLiteral(value) => Some(*value),
            ElementKind::IntegerLiteral(value) => Some(*value as f64),
            ElementKind::Expression(data) => {
                self.constant_float_value(data.root)
            }
            ElementKind::Initializer(data) => {
                self.constant_float_value(data.expression)
            }
            ElementKind::Identifier(data) => {
                self.constant_float_value(data.initializer?)
            }
            ElementKind::IdentifierReference(data) => {
                self.constant_float_value(data.identifier?)
            }
            ElementKind::UnaryOperator(data) => {
                let value = self.constant_float_value(data.rhs)?;
                match data.operator {
                    OperatorKind::Negate => Some(-value),
                    _ => None,
                }
            }
            ElementKind::BinaryOperator(data) => {
                let lhs = self.constant_float_value(data.lhs)?;
                let rhs = self.constant_float_value(data.rhs)?;
                match data.operator {
                    OperatorKind::Add => Some(lhs + rhs),
                    OperatorKind::Subtract => Some(lhs - rhs),
                    OperatorKind::Multiply => Some(lhs * rhs),
                    OperatorKind::Divide if rhs != 0.0 => Some(lhs / rhs),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
