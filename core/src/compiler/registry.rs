//! The element registry: the sole owner of every element created during a
//! session. Insertion assigns a fresh id; removal is permanent and ids are
//! never reused. A secondary index by [ElementTag] supports the driver
//! passes that sweep a whole kind (directives, identifiers, intrinsics).

use crate::compiler::element::{
    BlockData, Element, ElementKind, ElementTag, IdentifierData,
};
use crate::compiler::types::TypeData;
use crate::id::{ElementId, IdPool};
use std::collections::HashMap;

pub struct ElementRegistry {
    elements: HashMap<ElementId, Element>,
    by_tag: HashMap<ElementTag, Vec<ElementId>>,
    ids: IdPool,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self {
            elements: HashMap::new(),
            by_tag: HashMap::new(),
            ids: IdPool::new(),
        }
    }

    pub fn id_pool_mut(&mut self) -> &mut IdPool {
        &mut self.ids
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Insert an element, assigning its id. The registry becomes the
    /// element's owner.
    pub fn add(&mut self, mut element: Element) -> ElementId {
        let id = self.ids.next_element_id();
        element.id = id;
        self.by_tag.entry(element.tag()).or_default().push(id);
        self.elements.insert(id, element);
        id
    }

    /// Remove an element permanently. The id is retired, never reused.
    pub fn remove(&mut self, id: ElementId) -> Option<Element> {
        let element = self.elements.remove(&id)?;
        if let Some(ids) = self.by_tag.get_mut(&element.tag()) {
            ids.retain(|existing| *existing != id);
        }
        Some(element)
    }

    pub fn find(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn find_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        self.elements.get_mut(&id)
    }

    /// All ids of a given tag, in creation order.
    pub fn find_by_tag(&self, tag: ElementTag) -> Vec<ElementId> {
        self.by_tag.get(&tag).cloned().unwrap_or_default()
    }

    /// A block's tag can change when its role is refined; re-index it.
    pub fn reindex(&mut self, id: ElementId, old_tag: ElementTag) {
        let new_tag = match self.elements.get(&id) {
            Some(element) => element.tag(),
            None => return,
        };
        if new_tag == old_tag {
            return;
        }
        if let Some(ids) = self.by_tag.get_mut(&old_tag) {
            ids.retain(|existing| *existing != id);
        }
        self.by_tag.entry(new_tag).or_default().push(id);
    }

    // --------------------------------------------------------------------
    // typed lookup helpers

    pub fn block(&self, id: ElementId) -> Option<&BlockData> {
        self.find(id).and_then(Element::as_block)
    }

    pub fn block_mut(&mut self, id: ElementId) -> Option<&mut BlockData> {
        self.find_mut(id).and_then(Element::as_block_mut)
    }

    pub fn identifier(&self, id: ElementId) -> Option<&IdentifierData> {
        self.find(id).and_then(Element::as_identifier)
    }

    pub fn identifier_mut(
        &mut self,
        id: ElementId,
    ) -> Option<&mut IdentifierData> {
        self.find_mut(id).and_then(Element::as_identifier_mut)
    }

    pub fn type_data(&self, id: ElementId) -> Option<&TypeData> {
        self.find(id).and_then(Element::as_type)
    }

    pub fn type_data_mut(&mut self, id: ElementId) -> Option<&mut TypeData> {
        self.find_mut(id).and_then(Element::as_type_mut)
    }

    /// The plain name of an identifier, through its symbol element.
    pub fn identifier_name(&self, id: ElementId) -> Option<&str> {
        let identifier = self.identifier(id)?;
        match &self.find(identifier.symbol)?.kind {
            ElementKind::Symbol(symbol) => Some(&symbol.name),
            _ => None,
        }
    }

    /// The fully qualified name of an identifier (namespace path included).
    pub fn identifier_qualified_name(&self, id: ElementId) -> Option<String> {
        let identifier = self.identifier(id)?;
        match &self.find(identifier.symbol)?.kind {
            ElementKind::Symbol(symbol) => Some(
                crate::compiler::element::make_fully_qualified_name(
                    &symbol.namespaces,
                    &symbol.name,
                ),
            ),
            _ => None,
        }
    }

    // --------------------------------------------------------------------
    // the capability hooks that need only read access

    /// Compile-time evaluability, defined recursively: literals, labels,
    /// and types are constant; operators are constant iff their operands
    /// are; intrinsics answer per kind; references defer to their target.
    pub fn is_constant(&self, id: ElementId) -> bool {
        let element = match self.find(id) {
            Some(element) => element,
            None => return false,
        };
        match &element.kind {
            ElementKind::IntegerLiteral(_)
            | ElementKind::FloatLiteral(_)
            | ElementKind::BooleanLiteral(_)
            | ElementKind::StringLiteral(_)
            | ElementKind::Label(_)
            | ElementKind::Type(_) => true,
            ElementKind::Expression(expression) => {
                self.is_constant(expression.root)
            }
            ElementKind::Initializer(initializer) => {
                self.is_constant(initializer.expression)
            }
            ElementKind::UnaryOperator(unary) => self.is_constant(unary.rhs),
            ElementKind::BinaryOperator(binary) => {
                binary.operator != crate::compiler::OperatorKind::Assignment
                    && self.is_constant(binary.lhs)
                    && self.is_constant(binary.rhs)
            }
            ElementKind::Cast(cast) | ElementKind::Transmute(cast) => {
                self.is_constant(cast.expression)
            }
            ElementKind::Identifier(identifier) => identifier.constant,
            ElementKind::IdentifierReference(reference) => reference
                .identifier
                .map(|identifier| self.is_constant(identifier))
                .unwrap_or(false),
            ElementKind::TypeReference(_) => true,
            ElementKind::Namespace(_) => true,
            ElementKind::ModuleReference(_) => true,
            ElementKind::Intrinsic(intrinsic) => {
                intrinsic.kind.is_constant()
            }
            _ => false,
        }
    }

    /// Extract a directly held integer value.
    pub fn as_integer(&self, id: ElementId) -> Option<u64> {
        match &self.find(id)?.kind {
            ElementKind::IntegerLiteral(value) => Some(*value),
            ElementKind::BooleanLiteral(value) => Some(u64::from(*value)),
            ElementKind::Expression(expression) => {
                self.as_integer(expression.root)
            }
            ElementKind::Initializer(initializer) => {
                self.as_integer(initializer.expression)
            }
            _ => None,
        }
    }

    /// Extract a directly held float value.
    pub fn as_float(&self, id: ElementId) -> Option<f64> {
        match &self.find(id)?.kind {
            ElementKind::FloatLiteral(value) => Some(*value),
            ElementKind::IntegerLiteral(value) => Some(*value as f64),
            ElementKind::Expression(expression) => {
                self.as_float(expression.root)
            }
            ElementKind::Initializer(initializer) => {
                self.as_float(initializer.expression)
            }
            _ => None,
        }
    }

    /// Extract a directly held boolean value.
    pub fn as_bool(&self, id: ElementId) -> Option<bool> {
        match &self.find(id)?.kind {
            ElementKind::BooleanLiteral(value) => Some(*value),
            ElementKind::Expression(expression) => {
                self.as_bool(expression.root)
            }
            _ => None,
        }
    }

    /// Extract a directly held string value.
    pub fn as_string(&self, id: ElementId) -> Option<&str> {
        match &self.find(id)?.kind {
            ElementKind::StringLiteral(value) => Some(value),
            ElementKind::Expression(expression) => {
                self.as_string(expression.root)
            }
            ElementKind::Initializer(initializer) => {
                self.as_string(initializer.expression)
            }
            ElementKind::Attribute(attribute) => {
                self.as_string(attribute.expression?)
            }
            _ => None,
        }
    }
}

impl Default for ElementRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceLocation;

    fn literal(value: u64) -> Element {
        Element::new(
            ElementKind::IntegerLiteral(value),
            SourceLocation::default(),
        )
    }

    #[test]
    fn test_add_find_remove() {
        let mut registry = ElementRegistry::new();
        let id = registry.add(literal(7));
        assert_eq!(registry.find(id).unwrap().id, id);
        assert_eq!(registry.as_integer(id), Some(7));

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.find(id).is_none());

        // the id is retired: a new element gets a fresh id
        let next = registry.add(literal(8));
        assert_ne!(next, id);
    }

    #[test]
    fn test_find_by_tag() {
        let mut registry = ElementRegistry::new();
        let first = registry.add(literal(1));
        let second = registry.add(literal(2));
        registry.add(Element::new(
            ElementKind::BooleanLiteral(true),
            SourceLocation::default(),
        ));

        let integers = registry.find_by_tag(ElementTag::IntegerLiteral);
        assert_eq!(integers, vec![first, second]);
        assert_eq!(
            registry.find_by_tag(ElementTag::BooleanLiteral).len(),
            1,
        );
        assert!(registry.find_by_tag(ElementTag::Directive).is_empty());
    }

    #[test]
    fn test_is_constant_recursion() {
        use crate::compiler::element::{
            BinaryOperatorData, UnaryOperatorData,
        };
        use crate::compiler::OperatorKind;

        let mut registry = ElementRegistry::new();
        let lhs = registry.add(literal(2));
        let rhs = registry.add(literal(3));
        let sum = registry.add(Element::new(
            ElementKind::BinaryOperator(BinaryOperatorData {
                operator: OperatorKind::Add,
                lhs,
                rhs,
            }),
            SourceLocation::default(),
        ));
        assert!(registry.is_constant(sum));

        let negated = registry.add(Element::new(
            ElementKind::UnaryOperator(UnaryOperatorData {
                operator: OperatorKind::Negate,
                rhs: sum,
            }),
            SourceLocation::default(),
        ));
        assert!(registry.is_constant(negated));
    }
}
