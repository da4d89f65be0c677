//! The AST evaluator: the elaboration front-end. Dispatches on raw AST
//! node kinds to build elements, constructing scopes and namespaces,
//! declaring identifiers, and recording unresolved references for the
//! driver's later passes.

use crate::ast::{AstNode, AstNodeKind, NumberType};
use crate::compiler::element::{ElementKind, IntrinsicKind, OperatorKind};
use crate::compiler::session::Session;
use crate::compiler::types::{CompositeKind, TypeVariant};
use crate::compiler::{BlockKind, CommentKind, QualifiedSymbol, StorageUsage};
use crate::id::ElementId;
use crate::parse::parse_module;

/// The outcome of looking for a declaration's annotated type.
#[derive(Clone, Debug, Default)]
struct TypeFindResult {
    type_id: Option<ElementId>,
    type_name: String,
    is_array: bool,
    is_pointer: bool,
    array_size: usize,
}

impl Session {
    /// Parse and elaborate one queued source file into a module element.
    pub(crate) fn compile_module_at(
        &mut self,
        index: usize,
    ) -> Option<ElementId> {
        self.source_file_stack.push(index);
        let ast = match parse_module(&self.source_files[index]) {
            Ok(ast) => ast,
            Err(diagnostic) => {
                self.result.add(diagnostic);
                self.source_file_stack.pop();
                return None;
            }
        };
        let module = self.evaluate_module(&ast, index);
        self.source_file_stack.pop();
        if self.result.is_failed() {
            None
        } else {
            module
        }
    }

    /// Elaborate a parsed module: push a module block as the new top
    /// level, evaluate every child, and attach the results to the block.
    fn evaluate_module(
        &mut self,
        node: &AstNode,
        source_index: usize,
    ) -> Option<ElementId> {
        let scope = self.push_new_block(BlockKind::Module);
        self.scopes.push_top_level(scope);

        let path = self.source_files[source_index].path().to_path_buf();
        let module = self.make_module(scope, path, node.location);
        self.scopes.push_module(module);

        for child in &node.children {
            match self.evaluate(child, BlockKind::Basic) {
                Some(element) => {
                    self.add_expression_to_scope(scope, element);
                    self.set_parent(element, module);
                }
                None => {
                    if self.result.is_failed() {
                        break;
                    }
                }
            }
        }

        self.scopes.pop_module();
        self.scopes.pop_top_level();
        self.scopes.pop_scope();

        if self.result.is_failed() {
            None
        } else {
            Some(module)
        }
    }

    /// Attach an evaluated element to a block by role.
    fn add_expression_to_scope(
        &mut self,
        scope: ElementId,
        element: ElementId,
    ) {
        enum Role {
            Comment,
            Import,
            Attribute(String),
            Statement,
        }
        let role = match self.elements.find(element).map(|e| &e.kind) {
            Some(ElementKind::Comment(_)) => Role::Comment,
            Some(ElementKind::Import(_)) => Role::Import,
            Some(ElementKind::Attribute(data)) => {
                Role::Attribute(data.name.clone())
            }
            _ => Role::Statement,
        };
        match role {
            Role::Comment => {
                if let Some(block) = self.elements.block_mut(scope) {
                    block.comments.push(element);
                }
            }
            Role::Import => {
                if let Some(block) = self.elements.block_mut(scope) {
                    if !block.imports.contains(&element) {
                        block.imports.push(element);
                    }
                }
            }
            Role::Attribute(name) => {
                if let Some(scope_element) = self.elements.find_mut(scope) {
                    scope_element.attributes.add(name, element);
                }
            }
            Role::Statement => {
                if let Some(block) = self.elements.block_mut(scope) {
                    block.statements.push(element);
                }
            }
        }
    }

    // --------------------------------------------------------------------
    // the dispatch

    /// Evaluate one raw AST node into an element. `default_block_kind`
    /// controls what kind of block a nested `basic_block` becomes.
    pub(crate) fn evaluate(
        &mut self,
        node: &AstNode,
        default_block_kind: BlockKind,
    ) -> Option<ElementId> {
        match node.kind {
            AstNodeKind::BasicBlock => {
                let scope = self.push_new_block(default_block_kind);
                for child in &node.children {
                    match self.evaluate(child, BlockKind::Basic) {
                        Some(element) => {
                            self.add_expression_to_scope(scope, element);
                        }
                        None => {
                            self.error(
                                "C024",
                                "invalid statement in basic block",
                                child.location,
                            );
                            self.scopes.pop_scope();
                            return None;
                        }
                    }
                }
                self.scopes.pop_scope();
                Some(scope)
            }
            AstNodeKind::Statement => self.evaluate_statement(node),
            AstNodeKind::Expression => {
                let root = self.evaluate(node.lhs.as_ref()?, BlockKind::Basic)?;
                Some(self.make_expression(root, node.location))
            }
            AstNodeKind::Assignment => self.evaluate_assignment(node),
            AstNodeKind::LineComment => Some(self.make_comment(
                CommentKind::Line,
                node.token.value.clone(),
                node.location,
            )),
            AstNodeKind::BlockComment => Some(self.make_comment(
                CommentKind::Block,
                node.token.value.clone(),
                node.location,
            )),
            AstNodeKind::StringLiteral => Some(
                self.make_string(node.token.value.clone(), node.location),
            ),
            AstNodeKind::NumberLiteral => self.evaluate_number(node),
            AstNodeKind::BooleanLiteral => {
                Some(self.make_bool(node.token.as_bool(), node.location))
            }
            AstNodeKind::NullLiteral => {
                Some(self.make_integer(0, node.location))
            }
            AstNodeKind::IfExpression | AstNodeKind::ElseIfExpression => {
                let predicate =
                    self.evaluate(node.lhs.as_ref()?, BlockKind::Basic)?;
                let true_branch =
                    self.evaluate(&node.children[0], BlockKind::Basic)?;
                let false_branch = match &node.rhs {
                    Some(rhs) => Some(self.evaluate(rhs, BlockKind::Basic)?),
                    None => None,
                };
                Some(self.make_if(
                    predicate,
                    true_branch,
                    false_branch,
                    node.location,
                ))
            }
            AstNodeKind::ElseExpression => {
                self.evaluate(&node.children[0], BlockKind::Basic)
            }
            AstNodeKind::WhileExpression => {
                let predicate =
                    self.evaluate(node.lhs.as_ref()?, BlockKind::Basic)?;
                let body =
                    self.evaluate(&node.children[0], BlockKind::Basic)?;
                Some(self.make_while(predicate, body, node.location))
            }
            AstNodeKind::UnaryOperator => {
                let operator =
                    OperatorKind::from_unary_token(&node.token.value)?;
                let rhs =
                    self.resolve_symbol_or_evaluate(node.rhs.as_ref()?)?;
                Some(self.make_unary_operator(operator, rhs, node.location))
            }
            AstNodeKind::BinaryOperator => {
                let operator =
                    OperatorKind::from_binary_token(&node.token.value)?;
                let lhs =
                    self.resolve_symbol_or_evaluate(node.lhs.as_ref()?)?;
                let rhs =
                    self.resolve_symbol_or_evaluate(node.rhs.as_ref()?)?;
                Some(self.make_binary_operator(
                    operator,
                    lhs,
                    rhs,
                    node.location,
                ))
            }
            AstNodeKind::ProcCall => self.evaluate_proc_call(node),
            AstNodeKind::ArgumentList => {
                let mut arguments = Vec::new();
                for child in &node.children {
                    arguments.push(self.resolve_symbol_or_evaluate(child)?);
                }
                Some(self.make_argument_list(arguments, node.location))
            }
            AstNodeKind::ProcExpression => {
                self.evaluate_proc_expression(node)
            }
            AstNodeKind::StructExpression => {
                self.evaluate_composite(node, CompositeKind::Struct)
            }
            AstNodeKind::UnionExpression => {
                self.evaluate_composite(node, CompositeKind::Union)
            }
            AstNodeKind::EnumExpression => {
                self.evaluate_composite(node, CompositeKind::Enum)
            }
            AstNodeKind::CastExpression => self.evaluate_cast(node, false),
            AstNodeKind::TransmuteExpression => {
                self.evaluate_cast(node, true)
            }
            AstNodeKind::AliasExpression => {
                let expression =
                    self.evaluate(node.lhs.as_ref()?, BlockKind::Basic)?;
                Some(self.make_alias(expression, node.location))
            }
            AstNodeKind::ReturnStatement => {
                let return_element = self.make_return(node.location);
                if let Some(rhs) = &node.rhs {
                    for child in &rhs.children {
                        let expression =
                            self.resolve_symbol_or_evaluate(child)?;
                        self.set_parent(expression, return_element);
                        if let Some(element) =
                            self.elements.find_mut(return_element)
                        {
                            if let ElementKind::Return(data) =
                                &mut element.kind
                            {
                                data.expressions.push(expression);
                            }
                        }
                    }
                }
                Some(return_element)
            }
            AstNodeKind::ImportExpression => self.evaluate_import(node),
            AstNodeKind::NamespaceExpression => {
                let expression =
                    self.evaluate(node.rhs.as_ref()?, BlockKind::Basic)?;
                Some(self.make_namespace(expression, node.location))
            }
            AstNodeKind::ModuleExpression => {
                self.evaluate_module_expression(node)
            }
            AstNodeKind::Directive => self.evaluate_directive(node),
            AstNodeKind::Attribute => {
                let expression = match &node.lhs {
                    Some(lhs) => {
                        Some(self.evaluate(lhs, BlockKind::Basic)?)
                    }
                    None => None,
                };
                Some(self.make_attribute(
                    node.token.value.clone(),
                    expression,
                    node.location,
                ))
            }
            AstNodeKind::Symbol => {
                if node.type_annotation().is_some() {
                    self.add_identifier_to_scope(node, None, None)
                } else {
                    let symbol = self.qualified_symbol_from_node(node);
                    Some(
                        self.make_identifier_reference(
                            symbol,
                            node.location,
                        ),
                    )
                }
            }
            _ => None,
        }
    }

    /// The standard hook for positions where either a reference or a new
    /// expression may appear: symbols become (possibly unresolved)
    /// identifier references, anything else evaluates normally.
    fn resolve_symbol_or_evaluate(
        &mut self,
        node: &AstNode,
    ) -> Option<ElementId> {
        if node.kind == AstNodeKind::Symbol {
            let symbol = self.qualified_symbol_from_node(node);
            Some(self.make_identifier_reference(symbol, node.location))
        } else {
            self.evaluate(node, BlockKind::Basic)
        }
    }

    fn qualified_symbol_from_node(&self, node: &AstNode) -> QualifiedSymbol {
        let mut names: Vec<String> = node
            .children
            .iter()
            .map(|part| part.token.value.clone())
            .collect();
        let name = names.pop().unwrap_or_default();
        QualifiedSymbol::new(names, name, node.location)
    }

    // --------------------------------------------------------------------
    // per-kind helpers

    fn evaluate_statement(&mut self, node: &AstNode) -> Option<ElementId> {
        let mut labels = Vec::new();
        if let Some(label_list) = &node.lhs {
            for label in &label_list.children {
                labels.push(self.make_label(
                    label.token.value.clone(),
                    label.location,
                ));
            }
        }

        let rhs = node.rhs.as_ref()?;
        let expression = if rhs.kind == AstNodeKind::Symbol {
            // a bare symbol statement is a declaration
            self.add_identifier_to_scope(rhs, None, None)?
        } else {
            self.evaluate(rhs, BlockKind::Basic)?
        };

        Some(self.make_statement(labels, Some(expression), node.location))
    }

    fn evaluate_assignment(&mut self, node: &AstNode) -> Option<ElementId> {
        let targets = &node.lhs.as_ref()?.children;
        let sources = &node.rhs.as_ref()?.children;
        if targets.len() != sources.len() {
            self.error(
                "P027",
                format!(
                    "assignment count mismatch: {} targets, {} sources",
                    targets.len(),
                    sources.len(),
                ),
                node.location,
            );
            return None;
        }

        let mut results = Vec::new();
        for (target, source) in targets.iter().zip(sources.iter()) {
            let symbol = self.qualified_symbol_from_node(target);
            let existing = self.scopes.find_identifier(
                &self.elements,
                &symbol,
                None,
            );
            match existing {
                Some(_) => {
                    let reference = self.make_identifier_reference(
                        symbol,
                        target.location,
                    );
                    let rhs = self.resolve_symbol_or_evaluate(source)?;
                    results.push(self.make_binary_operator(
                        OperatorKind::Assignment,
                        reference,
                        rhs,
                        node.location,
                    ));
                }
                None => {
                    results.push(self.add_identifier_to_scope(
                        target,
                        Some(source),
                        None,
                    )?);
                }
            }
        }
        results.into_iter().next()
    }

    fn evaluate_number(&mut self, node: &AstNode) -> Option<ElementId> {
        match node.token.number_type() {
            NumberType::Integer => match node.token.parse_integer() {
                Ok(value) => {
                    // signed literals apply two's-complement conversion
                    let value = if node.token.is_signed() {
                        (value as i64).wrapping_neg() as u64
                    } else {
                        value
                    };
                    Some(self.make_integer(value, node.location))
                }
                Err(_) => {
                    self.error(
                        "P041",
                        format!(
                            "invalid numeric literal: {}",
                            node.token.value,
                        ),
                        node.location,
                    );
                    None
                }
            },
            NumberType::FloatingPoint => match node.token.parse_float() {
                Ok(value) => Some(self.make_float(value, node.location)),
                Err(_) => {
                    self.error(
                        "P041",
                        format!(
                            "invalid numeric literal: {}",
                            node.token.value,
                        ),
                        node.location,
                    );
                    None
                }
            },
            NumberType::None => None,
        }
    }

    fn evaluate_proc_call(&mut self, node: &AstNode) -> Option<ElementId> {
        let callee = node.lhs.as_ref()?;
        let symbol = self.qualified_symbol_from_node(callee);

        // intrinsics are recognized by bare name at the call site
        if !symbol.is_qualified() {
            if let Some(kind) = IntrinsicKind::from_name(&symbol.name) {
                return self.evaluate_intrinsic(node, kind);
            }
        }

        let reference =
            self.make_identifier_reference(symbol, callee.location);
        let arguments = match &node.rhs {
            Some(rhs) => self.evaluate(rhs, BlockKind::Basic)?,
            None => self.make_argument_list(Vec::new(), node.location),
        };
        Some(self.make_procedure_call(reference, arguments, node.location))
    }

    /// Intrinsic call sites resolve type-naming arguments into type
    /// references so that `size_of(u64)` never leaves a dangling
    /// identifier reference behind.
    fn evaluate_intrinsic(
        &mut self,
        node: &AstNode,
        kind: IntrinsicKind,
    ) -> Option<ElementId> {
        let mut arguments = Vec::new();
        if let Some(rhs) = &node.rhs {
            for child in &rhs.children {
                let argument = if child.kind == AstNodeKind::Symbol {
                    let symbol = self.qualified_symbol_from_node(child);
                    match self.scopes.find_type(
                        &self.elements,
                        &symbol,
                        None,
                    ) {
                        Some(type_id) => self.make_type_reference(
                            symbol,
                            Some(type_id),
                            child.location,
                        ),
                        None => self.make_identifier_reference(
                            symbol,
                            child.location,
                        ),
                    }
                } else {
                    self.evaluate(child, BlockKind::Basic)?
                };
                arguments.push(argument);
            }
        }
        let list = self.make_argument_list(arguments, node.location);
        Some(self.make_intrinsic(kind, list, node.location))
    }

    fn evaluate_proc_expression(
        &mut self,
        node: &AstNode,
    ) -> Option<ElementId> {
        let scope = self.make_block(
            self.scopes.current_scope(),
            BlockKind::ProcType,
        );
        let proc_type = self.make_procedure_type(scope, node.location);

        // return types: synthetic identifiers `_0`, `_1`, …
        let mut count = 0usize;
        if let Some(type_list) = &node.lhs {
            for type_node in &type_list.children {
                if type_node.kind != AstNodeKind::Symbol {
                    continue;
                }
                let type_name =
                    type_node.children.first()?.token.value.clone();
                let type_id = self.scopes.find_type(
                    &self.elements,
                    &QualifiedSymbol::unqualified(
                        type_name.clone(),
                        type_node.location,
                    ),
                    None,
                );
                let symbol = self.make_symbol(
                    format!("_{}", count),
                    Vec::new(),
                    false,
                    type_node.location,
                );
                count += 1;
                let identifier =
                    self.make_identifier(symbol, None, type_node.location);
                if let Some(data) =
                    self.elements.identifier_mut(identifier)
                {
                    data.type_id = type_id;
                }
                if type_id.is_none() {
                    let unknown = self.make_unknown_type(
                        identifier,
                        type_name,
                        false,
                        false,
                        0,
                    );
                    if let Some(data) =
                        self.elements.identifier_mut(identifier)
                    {
                        data.type_id = Some(unknown);
                    }
                }
                self.insert_identifier_into_block(scope, identifier);
                let field = self.make_field(identifier, type_node.location);
                self.set_parent(field, proc_type);
                if let Some(type_data) =
                    self.elements.type_data_mut(proc_type)
                {
                    if let TypeVariant::Procedure { returns, .. } =
                        &mut type_data.variant
                    {
                        returns.push(field);
                    }
                }
            }
        }

        // parameters: assignment form declares with a default, bare form
        // just declares
        if let Some(parameter_list) = &node.rhs {
            for parameter in &parameter_list.children {
                let identifier = match parameter.kind {
                    AstNodeKind::Assignment => {
                        let target =
                            parameter.lhs.as_ref()?.children.first()?;
                        let source =
                            parameter.rhs.as_ref()?.children.first()?;
                        self.add_identifier_to_scope(
                            target,
                            Some(source),
                            Some(scope),
                        )?
                    }
                    AstNodeKind::Symbol => self.add_identifier_to_scope(
                        parameter,
                        None,
                        Some(scope),
                    )?,
                    _ => {
                        self.error(
                            "P014",
                            "invalid parameter declaration",
                            parameter.location,
                        );
                        return None;
                    }
                };
                if let Some(data) =
                    self.elements.identifier_mut(identifier)
                {
                    data.usage = StorageUsage::Stack;
                }
                let field =
                    self.make_field(identifier, parameter.location);
                self.set_parent(field, proc_type);
                if let Some(type_data) =
                    self.elements.type_data_mut(proc_type)
                {
                    if let TypeVariant::Procedure { parameters, .. } =
                        &mut type_data.variant
                    {
                        parameters.push(field);
                    }
                }
            }
        }

        self.register_type_in_scope(proc_type, None);
        self.add_procedure_instances(proc_type, scope, node);
        Some(proc_type)
    }

    /// A procedure type may have multiple instances (bodies). Each
    /// `basic_block` child becomes one, evaluated inside the procedure's
    /// own scope.
    fn add_procedure_instances(
        &mut self,
        proc_type: ElementId,
        scope: ElementId,
        node: &AstNode,
    ) {
        for child in &node.children {
            match child.kind {
                AstNodeKind::Attribute => {
                    if let Some(attribute) =
                        self.evaluate(child, BlockKind::Basic)
                    {
                        let name = match self
                            .elements
                            .find(attribute)
                            .map(|element| &element.kind)
                        {
                            Some(ElementKind::Attribute(data)) => {
                                data.name.clone()
                            }
                            _ => continue,
                        };
                        if let Some(element) =
                            self.elements.find_mut(proc_type)
                        {
                            element.attributes.add(name, attribute);
                        }
                    }
                }
                AstNodeKind::BasicBlock => {
                    self.scopes.push_scope(scope);
                    let body =
                        self.evaluate(child, BlockKind::ProcInstance);
                    self.scopes.pop_scope();
                    let body = match body {
                        Some(body) => body,
                        None => continue,
                    };
                    let instance = self.make_procedure_instance(
                        proc_type,
                        body,
                        child.location,
                    );
                    self.set_parent(instance, proc_type);
                    if let Some(type_data) =
                        self.elements.type_data_mut(proc_type)
                    {
                        if let TypeVariant::Procedure {
                            instances, ..
                        } = &mut type_data.variant
                        {
                            instances.push(instance);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn evaluate_composite(
        &mut self,
        node: &AstNode,
        kind: CompositeKind,
    ) -> Option<ElementId> {
        let scope =
            self.make_block(self.scopes.current_scope(), BlockKind::Basic);
        let composite =
            self.make_composite_type(kind, scope, node.location);
        self.register_type_in_scope(composite, None);
        if let Some(block_node) = &node.rhs {
            self.add_composite_type_fields(
                composite, scope, block_node, kind,
            )?;
        }
        if !self.initialize_composite_type(composite) {
            return None;
        }
        Some(composite)
    }

    /// Populate a composite type's fields from its inner block's
    /// statements.
    fn add_composite_type_fields(
        &mut self,
        composite: ElementId,
        scope: ElementId,
        block_node: &AstNode,
        kind: CompositeKind,
    ) -> Option<()> {
        for child in &block_node.children {
            let expression = match child.kind {
                AstNodeKind::Statement => match &child.rhs {
                    Some(rhs) => rhs.as_ref(),
                    None => continue,
                },
                AstNodeKind::LineComment | AstNodeKind::BlockComment => {
                    continue;
                }
                _ => continue,
            };

            let field_identifier = match expression.kind {
                AstNodeKind::Assignment => {
                    let target =
                        expression.lhs.as_ref()?.children.first()?;
                    let source =
                        expression.rhs.as_ref()?.children.first()?;
                    let find_result = self.find_identifier_type(target);
                    let init_expression =
                        self.resolve_symbol_or_evaluate(source)?;
                    let initializer = self
                        .make_initializer(init_expression, source.location);
                    let symbol = self.make_symbol(
                        target.children.first()?.token.value.clone(),
                        Vec::new(),
                        false,
                        target.location,
                    );
                    let identifier = self.make_identifier(
                        symbol,
                        Some(initializer),
                        target.location,
                    );
                    let type_id = match find_result.type_id {
                        Some(type_id) => Some(type_id),
                        None => {
                            let inferred =
                                self.infer_type(init_expression);
                            if let Some(data) =
                                self.elements.identifier_mut(identifier)
                            {
                                data.inferred_type = inferred.is_some();
                            }
                            inferred
                        }
                    };
                    if let Some(data) =
                        self.elements.identifier_mut(identifier)
                    {
                        data.type_id = type_id;
                    }
                    identifier
                }
                AstNodeKind::Symbol => {
                    let find_result =
                        self.find_identifier_type(expression);
                    let symbol = self.make_symbol(
                        expression.children.first()?.token.value.clone(),
                        Vec::new(),
                        false,
                        expression.location,
                    );
                    let identifier = self.make_identifier(
                        symbol,
                        None,
                        expression.location,
                    );
                    let type_id = match find_result.type_id {
                        Some(type_id) => Some(type_id),
                        None if kind == CompositeKind::Enum => {
                            // enum fields default to the backing type
                            self.find_core_type("u32")
                        }
                        None => Some(self.make_unknown_type(
                            identifier,
                            find_result.type_name.clone(),
                            find_result.is_array,
                            find_result.is_pointer,
                            find_result.array_size,
                        )),
                    };
                    if let Some(data) =
                        self.elements.identifier_mut(identifier)
                    {
                        data.type_id = type_id;
                    }
                    identifier
                }
                _ => continue,
            };

            self.insert_identifier_into_block(scope, field_identifier);
            let field =
                self.make_field(field_identifier, expression.location);
            self.set_parent(field, composite);
            self.set_parent(field_identifier, composite);
            if let Some(type_data) = self.elements.type_data_mut(composite)
            {
                if let TypeVariant::Composite { fields, .. } =
                    &mut type_data.variant
                {
                    fields.push(field);
                }
            }
        }
        Some(())
    }

    fn evaluate_cast(
        &mut self,
        node: &AstNode,
        transmute: bool,
    ) -> Option<ElementId> {
        let type_node = node.lhs.as_ref()?;
        let type_name = type_node.token.value.clone();
        let type_id = self.scopes.find_type(
            &self.elements,
            &QualifiedSymbol::unqualified(
                type_name.clone(),
                type_node.location,
            ),
            None,
        );
        let type_id = match type_id {
            Some(type_id) => type_id,
            None => {
                self.error(
                    "P002",
                    format!("unknown type '{}'.", type_name),
                    type_node.location,
                );
                return None;
            }
        };
        let expression =
            self.resolve_symbol_or_evaluate(node.rhs.as_ref()?)?;
        Some(if transmute {
            self.make_transmute(type_id, expression, node.location)
        } else {
            self.make_cast(type_id, expression, node.location)
        })
    }

    fn evaluate_import(&mut self, node: &AstNode) -> Option<ElementId> {
        let symbol_node = node.lhs.as_ref()?;
        let mut symbol = self.qualified_symbol_from_node(symbol_node);

        let from_reference = match &node.rhs {
            Some(from_node) => {
                let reference =
                    self.resolve_symbol_or_evaluate(from_node)?;
                if let Some(ElementKind::IdentifierReference(data)) = self
                    .elements
                    .find(reference)
                    .map(|element| &element.kind)
                {
                    let mut namespaces = vec![data.symbol.name.clone()];
                    namespaces.extend(symbol.namespaces.clone());
                    symbol = QualifiedSymbol::new(
                        namespaces,
                        symbol.name.clone(),
                        symbol.location,
                    );
                }
                Some(reference)
            }
            None => None,
        };

        let reference =
            self.make_identifier_reference(symbol, symbol_node.location);
        let import =
            self.make_import(reference, from_reference, node.location);

        if let Some(scope) = self.scopes.current_scope() {
            if let Some(block) = self.elements.block_mut(scope) {
                block.imports.push(import);
            }
        }
        Some(import)
    }

    fn evaluate_module_expression(
        &mut self,
        node: &AstNode,
    ) -> Option<ElementId> {
        let expression =
            self.evaluate(node.rhs.as_ref()?, BlockKind::Basic)?;
        let path_text = match self.elements.as_string(expression) {
            Some(text) => text.to_string(),
            None => {
                self.error(
                    "C021",
                    "module expects a constant string path",
                    node.location,
                );
                return None;
            }
        };

        // module paths resolve relative to the including source file
        let mut path = std::path::PathBuf::from(&path_text);
        if path.is_relative() {
            if let Some(current) = self.current_source_file() {
                if let Some(parent) = current.path().parent() {
                    path = parent.join(path);
                }
            }
        }

        let index = match self.add_source_file(&path) {
            Ok(index) => index,
            Err(error) => {
                self.error(
                    "C021",
                    format!(
                        "unable to load module: {} ({})",
                        path.display(),
                        error,
                    ),
                    node.location,
                );
                return None;
            }
        };

        let module = self.compile_module_at(index)?;
        if let Some(program) = self.program {
            self.set_parent(module, program);
        }
        Some(self.make_module_reference(
            expression,
            Some(module),
            node.location,
        ))
    }

    fn evaluate_directive(&mut self, node: &AstNode) -> Option<ElementId> {
        let expression = match &node.lhs {
            Some(lhs) => Some(self.evaluate(lhs, BlockKind::Basic)?),
            None => None,
        };
        let directive = self.make_directive(
            node.token.value.clone(),
            expression,
            node.location,
        );

        // nested attributes apply to the directive itself
        for child in &node.children {
            if child.kind != AstNodeKind::Attribute {
                continue;
            }
            if let Some(attribute) = self.evaluate(child, BlockKind::Basic)
            {
                self.set_parent(attribute, directive);
                if let Some(element) = self.elements.find_mut(directive) {
                    element
                        .attributes
                        .add(child.token.value.clone(), attribute);
                }
            }
        }

        if !self.apply_directive_evaluation(directive) {
            self.error(
                "P044",
                format!(
                    "directive failed to execute: {}",
                    node.token.value,
                ),
                node.location,
            );
            return None;
        }
        Some(directive)
    }

    /// The elaboration-time half of directive handling. `#foreign`
    /// promotes the procedure type's declared attributes onto the
    /// directive and marks the type foreign; `#run` and `#load` are
    /// registered but inert.
    fn apply_directive_evaluation(&mut self, directive: ElementId) -> bool {
        let (name, expression) = match self.elements.find(directive) {
            Some(element) => match &element.kind {
                ElementKind::Directive(data) => {
                    (data.name.clone(), data.expression)
                }
                _ => return true,
            },
            None => return true,
        };
        if name != "foreign" {
            return true;
        }

        let identifier = match expression {
            Some(identifier) => identifier,
            None => return false,
        };
        let proc_type = match self.procedure_type_of(identifier) {
            Some(proc_type) => proc_type,
            None => return false,
        };

        // promote the proc type's declared attributes onto the directive
        let promoted: Vec<(String, ElementId)> = self
            .elements
            .find(proc_type)
            .map(|element| {
                element
                    .attributes
                    .iter()
                    .map(|(name, id)| (name.clone(), *id))
                    .collect()
            })
            .unwrap_or_default();
        for (name, attribute) in promoted {
            if let Some(element) = self.elements.find_mut(directive) {
                element.attributes.add(name.clone(), attribute);
            }
            if let Some(element) = self.elements.find_mut(proc_type) {
                element.attributes.remove(&name);
            }
        }

        if let Some(type_data) = self.elements.type_data_mut(proc_type) {
            if let TypeVariant::Procedure { is_foreign, .. } =
                &mut type_data.variant
            {
                *is_foreign = true;
            }
        }
        true
    }

    // --------------------------------------------------------------------
    // identifier-in-scope construction

    fn insert_identifier_into_block(
        &mut self,
        scope: ElementId,
        identifier: ElementId,
    ) {
        let name = self
            .elements
            .identifier_name(identifier)
            .unwrap_or_default()
            .to_string();
        if let Some(block) = self.elements.block_mut(scope) {
            block.identifiers.insert(name, identifier);
        }
    }

    /// Resolve a declaration's annotated type, interning array and
    /// pointer wrappers as needed.
    fn find_identifier_type(&mut self, symbol_node: &AstNode) -> TypeFindResult {
        let annotation = match symbol_node.type_annotation() {
            Some(annotation) => annotation,
            None => return TypeFindResult::default(),
        };
        let mut result = TypeFindResult {
            type_id: None,
            type_name: annotation.token.value.clone(),
            is_array: annotation.is_array,
            is_pointer: annotation.is_pointer,
            array_size: annotation.array_size,
        };
        let found = self.scopes.find_type(
            &self.elements,
            &QualifiedSymbol::unqualified(
                result.type_name.clone(),
                annotation.location,
            ),
            None,
        );
        if let Some(mut type_id) = found {
            if result.is_array {
                type_id = self.intern_array_type(
                    type_id,
                    result.array_size,
                    None,
                );
            }
            if result.is_pointer {
                type_id = self.intern_pointer_type(type_id, None);
            }
            result.type_id = Some(type_id);
        }
        result
    }

    /// Declare an identifier in scope, per the declaration path: determine
    /// the owning scope, materialize any namespace segments, build and
    /// possibly fold the initializer, bind or defer the type, and register
    /// the identifier.
    pub(crate) fn add_identifier_to_scope(
        &mut self,
        symbol_node: &AstNode,
        rhs: Option<&AstNode>,
        parent_scope: Option<ElementId>,
    ) -> Option<ElementId> {
        let find_result = self.find_identifier_type(symbol_node);

        // 1. the owning scope
        let mut scope = if symbol_node.is_qualified_symbol() {
            self.scopes.current_top_level()?
        } else {
            parent_scope
                .or_else(|| self.scopes.current_scope())?
        };

        // 2. materialize namespaces for the qualifying segments
        let segments = &symbol_node.children;
        for segment in &segments[..segments.len().saturating_sub(1)] {
            let segment_name = segment.token.value.clone();
            let existing = self
                .elements
                .block(scope)
                .and_then(|block| {
                    block.identifiers.get(&segment_name).copied()
                });
            match existing {
                Some(identifier) => {
                    let inner = self
                        .elements
                        .identifier(identifier)
                        .and_then(|data| data.initializer)
                        .and_then(|initializer| {
                            match &self.elements.find(initializer)?.kind {
                                ElementKind::Initializer(data) => {
                                    Some(data.expression)
                                }
                                _ => None,
                            }
                        })
                        .and_then(|expression| {
                            match &self.elements.find(expression)?.kind {
                                ElementKind::Namespace(data) => {
                                    Some(data.expression)
                                }
                                _ => None,
                            }
                        });
                    match inner {
                        Some(inner) => scope = inner,
                        None => {
                            self.error(
                                "P018",
                                format!(
                                    "'{}' is not a namespace",
                                    segment_name,
                                ),
                                segment.location,
                            );
                            return None;
                        }
                    }
                }
                None => {
                    let new_scope =
                        self.make_block(Some(scope), BlockKind::Basic);
                    if let Some(block) = self.elements.block_mut(scope) {
                        block.blocks.push(new_scope);
                    }
                    let namespace = self
                        .make_namespace(new_scope, segment.location);
                    let initializer = self
                        .make_initializer(namespace, segment.location);
                    let symbol = self.make_symbol(
                        segment_name.clone(),
                        Vec::new(),
                        false,
                        segment.location,
                    );
                    let identifier = self.make_identifier(
                        symbol,
                        Some(initializer),
                        segment.location,
                    );
                    let namespace_type = self.find_core_type("namespace");
                    if let Some(data) =
                        self.elements.identifier_mut(identifier)
                    {
                        data.type_id = namespace_type;
                        data.inferred_type = true;
                    }
                    self.insert_identifier_into_block(scope, identifier);
                    scope = new_scope;
                }
            }
        }

        let final_name =
            segments.last().map(|part| part.token.value.clone())?;

        // 3. evaluate and (when constant) wrap the initializer
        let init_expression = match rhs {
            Some(rhs) => Some(self.resolve_symbol_or_evaluate(rhs)?),
            None => None,
        };
        let initializer = match init_expression {
            Some(expression) if self.elements.is_constant(expression) => {
                Some(self.make_initializer(expression, symbol_node.location))
            }
            _ => None,
        };

        // 4. the identifier itself
        let symbol = self.make_symbol(
            final_name.clone(),
            Vec::new(),
            symbol_node.is_constant_expression(),
            symbol_node.location,
        );
        let identifier = self.make_identifier(
            symbol,
            initializer,
            symbol_node.location,
        );

        // 5. fold the initializer expression in place
        if let Some(initializer) = initializer {
            let expression = match self.elements.find(initializer) {
                Some(element) => match &element.kind {
                    ElementKind::Initializer(data) => data.expression,
                    _ => unreachable!("initializer payload"),
                },
                None => return None,
            };
            if let Some(folded) = self.fold_element(expression) {
                if let Some(element) = self.elements.find_mut(initializer)
                {
                    if let ElementKind::Initializer(data) =
                        &mut element.kind
                    {
                        data.expression = folded;
                    }
                }
                self.set_parent(folded, initializer);
                self.elements.remove(expression);
            }
        }

        // 6. type binding
        let has_annotation = symbol_node.type_annotation().is_some();
        if let Some(type_id) = find_result.type_id {
            if let Some(data) = self.elements.identifier_mut(identifier) {
                data.type_id = Some(type_id);
            }
        } else if let Some(expression) = init_expression {
            let inferred = self.infer_type(expression);
            match inferred {
                Some(type_id) => {
                    if let Some(data) =
                        self.elements.identifier_mut(identifier)
                    {
                        data.type_id = Some(type_id);
                        data.inferred_type = true;
                    }
                }
                None => {
                    let unknown = self.make_unknown_type(
                        identifier,
                        find_result.type_name.clone(),
                        find_result.is_array,
                        find_result.is_pointer,
                        find_result.array_size,
                    );
                    if let Some(data) =
                        self.elements.identifier_mut(identifier)
                    {
                        data.type_id = Some(unknown);
                    }
                }
            }
        } else if has_annotation {
            let unknown = self.make_unknown_type(
                identifier,
                find_result.type_name.clone(),
                find_result.is_array,
                find_result.is_pointer,
                find_result.array_size,
            );
            if let Some(data) = self.elements.identifier_mut(identifier) {
                data.type_id = Some(unknown);
            }
        } else {
            // no type, no initializer: nothing to infer from
            self.error(
                "P019",
                format!("unable to infer type: {}", final_name),
                symbol_node.location,
            );
        }

        // 7. register
        self.insert_identifier_into_block(scope, identifier);

        // 8. a non-constant right-hand side initializes at runtime
        if initializer.is_none() {
            if let Some(expression) = init_expression {
                let symbol = QualifiedSymbol::unqualified(
                    final_name,
                    symbol_node.location,
                );
                let reference = self.make_identifier_reference(
                    symbol,
                    symbol_node.location,
                );
                let assignment = self.make_binary_operator(
                    OperatorKind::Assignment,
                    reference,
                    expression,
                    symbol_node.location,
                );
                let statement = self.make_statement(
                    Vec::new(),
                    Some(assignment),
                    symbol_node.location,
                );
                if let Some(block) = self.elements.block_mut(scope) {
                    block.statements.push(statement);
                }
            }
        }

        Some(identifier)
    }
}
