//! The element builder: one constructor per element kind. Every
//! constructor allocates the element, registers it (assigning its id),
//! records the current scope and module, and parents any child elements
//! passed in. Type constructors run their initialization step and are
//! discarded (returning `None`) when it fails. String literals are
//! interned per distinct value; unresolved identifier references and
//! identifiers with unknown types are recorded for the driver's
//! resolution passes.

use crate::compiler::element::{
    AliasData, ArgumentListData, AttributeData, BinaryOperatorData,
    BlockData, CastData, CommentData, CommentKind, DirectiveData, Element,
    ElementKind, ExpressionData, FieldData, IdentifierData,
    IdentifierReferenceData, IfData, ImportData, InitializerData,
    IntrinsicData, IntrinsicKind, ModuleData, ModuleReferenceData,
    NamespaceData, OperatorKind, ProcedureCallData, ProcedureInstanceData,
    QualifiedSymbol, ReturnData, StatementData, SymbolData,
    TypeReferenceData, UnaryOperatorData, WhileData,
};
use crate::compiler::session::Session;
use crate::compiler::types::{
    name_for_array, name_for_pointer, CompositeKind, NumericTypeProperties,
    TypeData, TypeVariant,
};
use crate::compiler::{BlockKind, StorageUsage};
use crate::id::ElementId;
use crate::source::SourceLocation;
use std::path::PathBuf;

impl Session {
    /// Register a freshly built element, stamping the current scope and
    /// module.
    pub(crate) fn add_element(
        &mut self,
        kind: ElementKind,
        location: SourceLocation,
    ) -> ElementId {
        let mut element = Element::new(kind, location);
        element.parent_scope = self.scopes.current_scope();
        element.module = self.scopes.current_module();
        self.elements.add(element)
    }

    /// Set a child's owner. Ownership is assigned when the parent is
    /// built; the evaluator may re-parent a child once when it moves an
    /// expression into a wrapper.
    pub(crate) fn set_parent(&mut self, child: ElementId, parent: ElementId) {
        if let Some(element) = self.elements.find_mut(child) {
            element.parent_element = Some(parent);
        }
    }

    // --------------------------------------------------------------------
    // scopes & modules

    /// Create a block without touching the scope stacks.
    pub(crate) fn make_block(
        &mut self,
        parent_scope: Option<ElementId>,
        kind: BlockKind,
    ) -> ElementId {
        let mut element = Element::new(
            ElementKind::Block(BlockData::new(kind)),
            SourceLocation::default(),
        );
        element.parent_scope =
            parent_scope.or_else(|| self.scopes.current_scope());
        element.module = self.scopes.current_module();
        self.elements.add(element)
    }

    /// Create a block as a child of the current scope, link it in, and
    /// push it.
    pub(crate) fn push_new_block(&mut self, kind: BlockKind) -> ElementId {
        let parent = self.scopes.current_scope();
        let block = self.make_block(parent, kind);
        if let Some(parent) = parent {
            self.set_parent(block, parent);
            if let Some(parent_block) = self.elements.block_mut(parent) {
                parent_block.blocks.push(block);
            }
        }
        self.scopes.push_scope(block);
        block
    }

    pub(crate) fn make_module(
        &mut self,
        scope: ElementId,
        source: PathBuf,
        location: SourceLocation,
    ) -> ElementId {
        let module = self.add_element(
            ElementKind::Module(ModuleData { scope, source }),
            location,
        );
        self.set_parent(scope, module);
        module
    }

    pub(crate) fn make_module_reference(
        &mut self,
        expression: ElementId,
        module: Option<ElementId>,
        location: SourceLocation,
    ) -> ElementId {
        let reference = self.add_element(
            ElementKind::ModuleReference(ModuleReferenceData {
                expression,
                module,
            }),
            location,
        );
        self.set_parent(expression, reference);
        reference
    }

    // --------------------------------------------------------------------
    // symbols, identifiers, references

    pub(crate) fn make_symbol(
        &mut self,
        name: impl Into<String>,
        namespaces: Vec<String>,
        constant: bool,
        location: SourceLocation,
    ) -> ElementId {
        self.add_element(
            ElementKind::Symbol(SymbolData {
                name: name.into(),
                namespaces,
                constant,
            }),
            location,
        )
    }

    pub(crate) fn make_identifier(
        &mut self,
        symbol: ElementId,
        initializer: Option<ElementId>,
        location: SourceLocation,
    ) -> ElementId {
        let usage = if self
            .scopes
            .within_procedure_scope(&self.elements, None)
        {
            StorageUsage::Stack
        } else {
            StorageUsage::Heap
        };
        let constant = match &self.elements.find(symbol).map(|e| &e.kind) {
            Some(ElementKind::Symbol(data)) => data.constant,
            _ => false,
        };
        let identifier = self.add_element(
            ElementKind::Identifier(IdentifierData {
                symbol,
                type_id: None,
                initializer,
                usage,
                inferred_type: false,
                constant,
            }),
            location,
        );
        self.set_parent(symbol, identifier);
        if let Some(initializer) = initializer {
            self.set_parent(initializer, identifier);
        }
        identifier
    }

    /// Build an identifier reference, resolving it immediately when the
    /// symbol is already in scope. Unresolved references go on the pending
    /// list for the driver's resolution pass.
    pub(crate) fn make_identifier_reference(
        &mut self,
        symbol: QualifiedSymbol,
        location: SourceLocation,
    ) -> ElementId {
        let resolved =
            self.scopes.find_identifier(&self.elements, &symbol, None);
        let reference = self.add_element(
            ElementKind::IdentifierReference(IdentifierReferenceData {
                symbol,
                identifier: resolved,
            }),
            location,
        );
        if resolved.is_none() {
            self.scopes.unresolved_identifier_references.push(reference);
        }
        reference
    }

    pub(crate) fn make_type_reference(
        &mut self,
        symbol: QualifiedSymbol,
        type_id: Option<ElementId>,
        location: SourceLocation,
    ) -> ElementId {
        self.add_element(
            ElementKind::TypeReference(TypeReferenceData {
                symbol,
                type_id,
            }),
            location,
        )
    }

    pub(crate) fn make_initializer(
        &mut self,
        expression: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let initializer = self.add_element(
            ElementKind::Initializer(InitializerData { expression }),
            location,
        );
        self.set_parent(expression, initializer);
        initializer
    }

    // --------------------------------------------------------------------
    // literals

    pub(crate) fn make_integer(
        &mut self,
        value: u64,
        location: SourceLocation,
    ) -> ElementId {
        self.add_element(ElementKind::IntegerLiteral(value), location)
    }

    pub(crate) fn make_float(
        &mut self,
        value: f64,
        location: SourceLocation,
    ) -> ElementId {
        self.add_element(ElementKind::FloatLiteral(value), location)
    }

    pub(crate) fn make_bool(
        &mut self,
        value: bool,
        location: SourceLocation,
    ) -> ElementId {
        self.add_element(ElementKind::BooleanLiteral(value), location)
    }

    /// String literals are interned: every occurrence of a distinct value
    /// shares one entry list, so duplicates share a data label.
    pub(crate) fn make_string(
        &mut self,
        value: impl Into<String>,
        location: SourceLocation,
    ) -> ElementId {
        let value = value.into();
        let literal = self.add_element(
            ElementKind::StringLiteral(value.clone()),
            location,
        );
        self.scopes
            .interned_string_literals
            .entry(value)
            .or_default()
            .push(literal);
        literal
    }

    // --------------------------------------------------------------------
    // operators & expressions

    pub(crate) fn make_unary_operator(
        &mut self,
        operator: OperatorKind,
        rhs: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let unary = self.add_element(
            ElementKind::UnaryOperator(UnaryOperatorData { operator, rhs }),
            location,
        );
        self.set_parent(rhs, unary);
        unary
    }

    pub(crate) fn make_binary_operator(
        &mut self,
        operator: OperatorKind,
        lhs: ElementId,
        rhs: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let binary = self.add_element(
            ElementKind::BinaryOperator(BinaryOperatorData {
                operator,
                lhs,
                rhs,
            }),
            location,
        );
        self.set_parent(lhs, binary);
        self.set_parent(rhs, binary);
        binary
    }

    pub(crate) fn make_cast(
        &mut self,
        type_id: ElementId,
        expression: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let cast = self.add_element(
            ElementKind::Cast(CastData {
                type_id,
                expression,
            }),
            location,
        );
        self.set_parent(expression, cast);
        cast
    }

    pub(crate) fn make_transmute(
        &mut self,
        type_id: ElementId,
        expression: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let transmute = self.add_element(
            ElementKind::Transmute(CastData {
                type_id,
                expression,
            }),
            location,
        );
        self.set_parent(expression, transmute);
        transmute
    }

    pub(crate) fn make_alias(
        &mut self,
        expression: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let alias = self.add_element(
            ElementKind::Alias(AliasData { expression }),
            location,
        );
        self.set_parent(expression, alias);
        alias
    }

    pub(crate) fn make_if(
        &mut self,
        predicate: ElementId,
        true_branch: ElementId,
        false_branch: Option<ElementId>,
        location: SourceLocation,
    ) -> ElementId {
        let if_element = self.add_element(
            ElementKind::If(IfData {
                predicate,
                true_branch,
                false_branch,
            }),
            location,
        );
        self.set_parent(predicate, if_element);
        self.set_parent(true_branch, if_element);
        if let Some(false_branch) = false_branch {
            self.set_parent(false_branch, if_element);
        }
        if_element
    }

    pub(crate) fn make_while(
        &mut self,
        predicate: ElementId,
        body: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let while_element = self.add_element(
            ElementKind::While(WhileData { predicate, body }),
            location,
        );
        self.set_parent(predicate, while_element);
        self.set_parent(body, while_element);
        while_element
    }

    pub(crate) fn make_return(
        &mut self,
        location: SourceLocation,
    ) -> ElementId {
        self.add_element(
            ElementKind::Return(ReturnData::default()),
            location,
        )
    }

    pub(crate) fn make_statement(
        &mut self,
        labels: Vec<ElementId>,
        expression: Option<ElementId>,
        location: SourceLocation,
    ) -> ElementId {
        let statement = self.add_element(
            ElementKind::Statement(StatementData {
                labels: labels.clone(),
                expression,
            }),
            location,
        );
        for label in labels {
            self.set_parent(label, statement);
        }
        if let Some(expression) = expression {
            self.set_parent(expression, statement);
        }
        statement
    }

    pub(crate) fn make_expression(
        &mut self,
        root: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let expression = self.add_element(
            ElementKind::Expression(ExpressionData { root }),
            location,
        );
        self.set_parent(root, expression);
        expression
    }

    pub(crate) fn make_label(
        &mut self,
        name: impl Into<String>,
        location: SourceLocation,
    ) -> ElementId {
        self.add_element(ElementKind::Label(name.into()), location)
    }

    pub(crate) fn make_field(
        &mut self,
        identifier: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let field = self.add_element(
            ElementKind::Field(FieldData { identifier }),
            location,
        );
        self.set_parent(identifier, field);
        field
    }

    pub(crate) fn make_argument_list(
        &mut self,
        elements: Vec<ElementId>,
        location: SourceLocation,
    ) -> ElementId {
        let list = self.add_element(
            ElementKind::ArgumentList(ArgumentListData {
                elements: elements.clone(),
            }),
            location,
        );
        for argument in elements {
            self.set_parent(argument, list);
        }
        list
    }

    pub(crate) fn make_procedure_call(
        &mut self,
        reference: ElementId,
        arguments: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let call = self.add_element(
            ElementKind::ProcedureCall(ProcedureCallData {
                reference,
                arguments,
            }),
            location,
        );
        self.set_parent(reference, call);
        self.set_parent(arguments, call);
        call
    }

    pub(crate) fn make_procedure_instance(
        &mut self,
        procedure_type: ElementId,
        scope: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let instance = self.add_element(
            ElementKind::ProcedureInstance(ProcedureInstanceData {
                procedure_type,
                scope,
            }),
            location,
        );
        self.set_parent(scope, instance);
        instance
    }

    pub(crate) fn make_intrinsic(
        &mut self,
        kind: IntrinsicKind,
        arguments: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let intrinsic = self.add_element(
            ElementKind::Intrinsic(IntrinsicData { kind, arguments }),
            location,
        );
        self.set_parent(arguments, intrinsic);
        intrinsic
    }

    pub(crate) fn make_namespace(
        &mut self,
        expression: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let namespace = self.add_element(
            ElementKind::Namespace(NamespaceData { expression }),
            location,
        );
        self.set_parent(expression, namespace);
        namespace
    }

    pub(crate) fn make_import(
        &mut self,
        expression: ElementId,
        from_expression: Option<ElementId>,
        location: SourceLocation,
    ) -> ElementId {
        let import = self.add_element(
            ElementKind::Import(ImportData {
                expression,
                from_expression,
                module: None,
            }),
            location,
        );
        self.set_parent(expression, import);
        if let Some(from_expression) = from_expression {
            self.set_parent(from_expression, import);
        }
        import
    }

    pub(crate) fn make_comment(
        &mut self,
        kind: CommentKind,
        value: impl Into<String>,
        location: SourceLocation,
    ) -> ElementId {
        self.add_element(
            ElementKind::Comment(CommentData {
                kind,
                value: value.into(),
            }),
            location,
        )
    }

    pub(crate) fn make_attribute(
        &mut self,
        name: impl Into<String>,
        expression: Option<ElementId>,
        location: SourceLocation,
    ) -> ElementId {
        let attribute = self.add_element(
            ElementKind::Attribute(AttributeData {
                name: name.into(),
                expression,
            }),
            location,
        );
        if let Some(expression) = expression {
            self.set_parent(expression, attribute);
        }
        attribute
    }

    pub(crate) fn make_directive(
        &mut self,
        name: impl Into<String>,
        expression: Option<ElementId>,
        location: SourceLocation,
    ) -> ElementId {
        let directive = self.add_element(
            ElementKind::Directive(DirectiveData {
                name: name.into(),
                expression,
            }),
            location,
        );
        if let Some(expression) = expression {
            self.set_parent(expression, directive);
        }
        directive
    }

    // --------------------------------------------------------------------
    // types

    fn make_type(
        &mut self,
        name: impl Into<String>,
        size_in_bytes: usize,
        variant: TypeVariant,
    ) -> ElementId {
        self.add_element(
            ElementKind::Type(TypeData::new(name, size_in_bytes, variant)),
            SourceLocation::default(),
        )
    }

    pub(crate) fn make_numeric_type(
        &mut self,
        name: &str,
        properties: NumericTypeProperties,
    ) -> ElementId {
        self.make_type(
            name,
            properties.size_in_bytes,
            TypeVariant::Numeric {
                min: properties.min,
                max: properties.max,
                signed: properties.signed,
                number_class: properties.number_class,
            },
        )
    }

    /// Create a composite type of the given kind with a generated
    /// structural name (`__struct_<n>__` and friends).
    pub(crate) fn make_composite_type(
        &mut self,
        kind: CompositeKind,
        scope: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let serial = self.elements.id_pool_mut().allocate();
        let name = format!("__{}_{}__", kind.name(), serial);
        let composite = self.add_element(
            ElementKind::Type(TypeData::new(
                name,
                0,
                TypeVariant::Composite {
                    kind,
                    fields: Vec::new(),
                    type_params: Default::default(),
                },
            )),
            location,
        );
        self.set_parent(scope, composite);
        composite
    }

    /// Finalize a composite type: lay out its fields and compute the total
    /// size. Enum composites take the size of their `u32` backing type.
    pub(crate) fn initialize_composite_type(
        &mut self,
        composite: ElementId,
    ) -> bool {
        let (kind, fields) =
            match &self.elements.type_data(composite).unwrap().variant {
                TypeVariant::Composite { kind, fields, .. } => {
                    (*kind, fields.clone())
                }
                _ => return false,
            };

        let size = match kind {
            CompositeKind::Enum => 4,
            CompositeKind::Union => {
                let mut largest = 0usize;
                for field in &fields {
                    largest =
                        largest.max(self.field_type_size(*field));
                }
                largest
            }
            CompositeKind::Struct => {
                let mut offset = 0usize;
                let mut alignment = 1usize;
                for field in &fields {
                    let field_size = self.field_type_size(*field);
                    let field_align = field_size.clamp(1, 8);
                    alignment = alignment.max(field_align);
                    offset = align_up(offset, field_align) + field_size;
                }
                align_up(offset, alignment)
            }
        };

        if let Some(type_data) = self.elements.type_data_mut(composite) {
            type_data.size_in_bytes = size;
        }
        true
    }

    fn field_type_size(&self, field: ElementId) -> usize {
        self.field_identifier(field)
            .and_then(|identifier| {
                self.elements.identifier(identifier)?.type_id
            })
            .and_then(|type_id| self.elements.type_data(type_id))
            .map(|type_data| type_data.size_in_bytes)
            .unwrap_or(0)
    }

    pub(crate) fn make_procedure_type(
        &mut self,
        scope: ElementId,
        location: SourceLocation,
    ) -> ElementId {
        let serial = self.elements.id_pool_mut().allocate();
        let name = format!("__proc_{}__", serial);
        let proc_type = self.add_element(
            ElementKind::Type(TypeData::new(
                name,
                8,
                TypeVariant::Procedure {
                    scope,
                    parameters: Vec::new(),
                    returns: Vec::new(),
                    is_foreign: false,
                    foreign_index: None,
                    instances: Vec::new(),
                },
            )),
            location,
        );
        self.set_parent(scope, proc_type);
        proc_type
    }

    /// Create an unknown-type placeholder and record the identifier for
    /// the later resolution pass.
    pub(crate) fn make_unknown_type(
        &mut self,
        identifier: ElementId,
        type_name: impl Into<String>,
        is_array: bool,
        is_pointer: bool,
        array_size: usize,
    ) -> ElementId {
        let type_name = type_name.into();
        let unknown = self.make_type(
            format!("__unknown_{}__", type_name),
            0,
            TypeVariant::Unknown {
                type_name,
                is_array,
                is_pointer,
                array_size,
            },
        );
        self.scopes.identifiers_with_unknown_types.push(identifier);
        unknown
    }

    /// Find or create the interned array type for `entry`/`size`.
    pub(crate) fn intern_array_type(
        &mut self,
        entry: ElementId,
        size: usize,
        scope: Option<ElementId>,
    ) -> ElementId {
        if let Some(existing) = self.scopes.find_array_type(
            &self.elements,
            entry,
            size,
            scope,
        ) {
            return existing;
        }
        let (entry_name, entry_size) = {
            let entry_type = self.elements.type_data(entry).unwrap();
            (entry_type.name.clone(), entry_type.size_in_bytes)
        };
        let name = name_for_array(&entry_name, size);
        let array = self.make_type(
            name.clone(),
            entry_size * size,
            TypeVariant::Array { entry, size },
        );
        self.register_type_in_scope(array, scope);
        array
    }

    /// Find or create the interned pointer type for `base`.
    pub(crate) fn intern_pointer_type(
        &mut self,
        base: ElementId,
        scope: Option<ElementId>,
    ) -> ElementId {
        if let Some(existing) =
            self.scopes.find_pointer_type(&self.elements, base, scope)
        {
            return existing;
        }
        let base_name =
            self.elements.type_data(base).unwrap().name.clone();
        let name = name_for_pointer(&base_name);
        let pointer =
            self.make_type(name, 8, TypeVariant::Pointer { base });
        self.register_type_in_scope(pointer, scope);
        pointer
    }

    /// Insert a type into a scope's type table under its canonical name.
    pub(crate) fn register_type_in_scope(
        &mut self,
        type_id: ElementId,
        scope: Option<ElementId>,
    ) {
        let name = match self.elements.type_data(type_id) {
            Some(type_data) => type_data.name.clone(),
            None => return,
        };
        let target = scope
            .or_else(|| self.scopes.current_scope())
            .or_else(|| self.scopes.current_top_level());
        if let Some(block) =
            target.and_then(|scope| self.elements.block_mut(scope))
        {
            block.types.insert(name, type_id);
        }
    }

    /// Phase 1: create the core types and register them in the top-level
    /// scope.
    pub(crate) fn initialize_core_types(&mut self) {
        let top_level = self.scopes.current_top_level();

        for (name, properties) in crate::compiler::types::NUMERIC_TYPES {
            let type_id = self.make_numeric_type(name, *properties);
            self.register_type_in_scope(type_id, top_level);
        }

        let core = [
            ("bool", 1, TypeVariant::Bool),
            ("string", 8, TypeVariant::String),
            ("namespace", 0, TypeVariant::Namespace),
            ("module", 0, TypeVariant::Module),
            ("tuple", 8, TypeVariant::Tuple),
            ("type", 8, TypeVariant::TypeInfo),
            ("any", 16, TypeVariant::Any),
        ];
        for (name, size, variant) in core {
            let type_id = self.make_type(name, size, variant);
            self.register_type_in_scope(type_id, top_level);
        }
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    let remainder = value % alignment;
    if remainder == 0 {
        value
    } else {
        value + alignment - remainder
    }
}
