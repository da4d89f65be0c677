//! Scope management: the module, top-level, and scope stacks, plus symbol
//! resolution through lexical scope chains, namespaces, and imports. Also
//! home to the session's pending lists (unresolved identifier references,
//! identifiers with unknown types, interned string literals), which the
//! driver's resolution passes drain.

use crate::compiler::element::{ElementKind, QualifiedSymbol};
use crate::compiler::registry::ElementRegistry;
use crate::compiler::types::{name_for_array, name_for_pointer};
use crate::compiler::BlockKind;
use crate::id::ElementId;
use std::collections::HashMap;

#[derive(Default)]
pub struct ScopeManager {
    module_stack: Vec<ElementId>,
    top_level_stack: Vec<ElementId>,
    scope_stack: Vec<ElementId>,
    pub identifiers_with_unknown_types: Vec<ElementId>,
    pub unresolved_identifier_references: Vec<ElementId>,
    pub interned_string_literals: HashMap<String, Vec<ElementId>>,
}

impl ScopeManager {
    pub fn new() -> Self {
        Self::default()
    }

    // --------------------------------------------------------------------
    // stacks

    pub fn push_scope(&mut self, block: ElementId) {
        self.scope_stack.push(block);
    }

    pub fn pop_scope(&mut self) -> Option<ElementId> {
        self.scope_stack.pop()
    }

    pub fn current_scope(&self) -> Option<ElementId> {
        self.scope_stack.last().copied()
    }

    pub fn push_module(&mut self, module: ElementId) {
        self.module_stack.push(module);
    }

    pub fn pop_module(&mut self) -> Option<ElementId> {
        self.module_stack.pop()
    }

    pub fn current_module(&self) -> Option<ElementId> {
        self.module_stack.last().copied()
    }

    pub fn push_top_level(&mut self, block: ElementId) {
        self.top_level_stack.push(block);
    }

    pub fn pop_top_level(&mut self) -> Option<ElementId> {
        self.top_level_stack.pop()
    }

    pub fn current_top_level(&self) -> Option<ElementId> {
        self.top_level_stack.last().copied()
    }

    // --------------------------------------------------------------------
    // walks

    /// Walk the parent-scope chain from `scope`, applying `visit` at each
    /// block until it yields a result.
    pub fn walk_parent_scopes<T>(
        &self,
        registry: &ElementRegistry,
        scope: Option<ElementId>,
        mut visit: impl FnMut(ElementId) -> Option<T>,
    ) -> Option<T> {
        let mut current = scope.or_else(|| self.current_scope());
        while let Some(block_id) = current {
            if let Some(found) = visit(block_id) {
                return Some(found);
            }
            current = registry.find(block_id)?.parent_scope;
        }
        None
    }

    /// Walk the parent-element chain from `element` until `visit` yields.
    pub fn walk_parent_elements<T>(
        &self,
        registry: &ElementRegistry,
        element: ElementId,
        mut visit: impl FnMut(ElementId) -> Option<T>,
    ) -> Option<T> {
        let mut current = Some(element);
        while let Some(id) = current {
            if let Some(found) = visit(id) {
                return Some(found);
            }
            current = registry.find(id)?.parent_element;
        }
        None
    }

    /// Resolve a qualified symbol's namespace path starting at the current
    /// top level (or `scope` when given), then apply `visit` to the final
    /// block. Every intermediate segment must name a namespace or a module
    /// reference.
    pub fn walk_qualified_symbol<T>(
        &self,
        registry: &ElementRegistry,
        symbol: &QualifiedSymbol,
        scope: Option<ElementId>,
        visit: impl FnOnce(ElementId) -> Option<T>,
    ) -> Option<T> {
        let mut block_id = scope.or_else(|| self.current_top_level())?;
        for namespace_name in &symbol.namespaces {
            let block = registry.block(block_id)?;
            let var = *block.identifiers.get(namespace_name)?;
            let identifier = registry.identifier(var)?;
            let initializer = registry.find(identifier.initializer?)?;
            let expression = match &initializer.kind {
                ElementKind::Initializer(data) => data.expression,
                _ => return None,
            };
            match &registry.find(expression)?.kind {
                ElementKind::Namespace(namespace) => {
                    block_id = namespace.expression;
                }
                ElementKind::ModuleReference(module_ref) => {
                    let module = registry.find(module_ref.module?)?;
                    match &module.kind {
                        ElementKind::Module(data) => block_id = data.scope,
                        _ => return None,
                    }
                }
                _ => return None,
            }
        }
        visit(block_id)
    }

    // --------------------------------------------------------------------
    // finders

    /// Find a type by symbol. Qualified symbols walk namespaces from the
    /// top level; unqualified symbols walk the parent-scope chain. An
    /// identifier may itself carry the type (e.g. a composite declared
    /// through a constant binding).
    pub fn find_type(
        &self,
        registry: &ElementRegistry,
        symbol: &QualifiedSymbol,
        scope: Option<ElementId>,
    ) -> Option<ElementId> {
        let lookup = |registry: &ElementRegistry,
                      block_id: ElementId|
         -> Option<ElementId> {
            let block = registry.block(block_id)?;
            if let Some(type_id) = block.types.get(&symbol.name) {
                return Some(*type_id);
            }
            let identifier_id = *block.identifiers.get(&symbol.name)?;
            registry.identifier(identifier_id)?.type_id
        };

        if symbol.is_qualified() {
            self.walk_qualified_symbol(registry, symbol, None, |block| {
                lookup(registry, block).or_else(|| {
                    let identifier =
                        self.find_identifier_in_block(registry, block, symbol)?;
                    registry.identifier(identifier)?.type_id
                })
            })
        } else {
            self.walk_parent_scopes(registry, scope, |block| {
                lookup(registry, block)
            })
        }
    }

    fn find_identifier_in_block(
        &self,
        registry: &ElementRegistry,
        block_id: ElementId,
        symbol: &QualifiedSymbol,
    ) -> Option<ElementId> {
        registry
            .block(block_id)?
            .identifiers
            .get(&symbol.name)
            .copied()
    }

    /// Find an identifier by symbol. Unqualified lookups consult each
    /// import of every block on the chain by rewriting the symbol into the
    /// imported module's namespace.
    pub fn find_identifier(
        &self,
        registry: &ElementRegistry,
        symbol: &QualifiedSymbol,
        scope: Option<ElementId>,
    ) -> Option<ElementId> {
        if symbol.is_qualified() {
            self.walk_qualified_symbol(registry, symbol, scope, |block| {
                self.find_identifier_in_block(registry, block, symbol)
            })
        } else {
            self.walk_parent_scopes(registry, scope, |block_id| {
                if let Some(found) =
                    self.find_identifier_in_block(registry, block_id, symbol)
                {
                    return Some(found);
                }
                // consult each import's target module
                let block = registry.block(block_id)?;
                for import_id in &block.imports {
                    let import = match &registry.find(*import_id)?.kind {
                        ElementKind::Import(import) => import,
                        _ => continue,
                    };
                    let reference =
                        match &registry.find(import.expression)?.kind {
                            ElementKind::IdentifierReference(data) => data,
                            _ => continue,
                        };
                    let mut rewritten = reference.symbol.namespaces.clone();
                    rewritten.push(reference.symbol.name.clone());
                    let rewritten = QualifiedSymbol::new(
                        rewritten,
                        symbol.name.clone(),
                        symbol.location,
                    );
                    let module_scope = import.module.and_then(|module| {
                        match &registry.find(module)?.kind {
                            ElementKind::Module(data) => Some(data.scope),
                            _ => None,
                        }
                    });
                    if let Some(found) = self.find_identifier(
                        registry,
                        &rewritten,
                        module_scope,
                    ) {
                        return Some(found);
                    }
                }
                None
            })
        }
    }

    /// Find the interned pointer type for `base` along the scope chain.
    pub fn find_pointer_type(
        &self,
        registry: &ElementRegistry,
        base: ElementId,
        scope: Option<ElementId>,
    ) -> Option<ElementId> {
        let base_name = registry.type_data(base)?.name.clone();
        let symbol = QualifiedSymbol::unqualified(
            name_for_pointer(&base_name),
            Default::default(),
        );
        self.find_type(registry, &symbol, scope)
    }

    /// Find the interned array type for `entry`/`size` along the scope
    /// chain.
    pub fn find_array_type(
        &self,
        registry: &ElementRegistry,
        entry: ElementId,
        size: usize,
        scope: Option<ElementId>,
    ) -> Option<ElementId> {
        let entry_name = registry.type_data(entry)?.name.clone();
        let symbol = QualifiedSymbol::unqualified(
            name_for_array(&entry_name, size),
            Default::default(),
        );
        self.find_type(registry, &symbol, scope)
    }

    /// The module that defines `element`, found by walking parents.
    pub fn find_module(
        &self,
        registry: &ElementRegistry,
        element: ElementId,
    ) -> Option<ElementId> {
        self.walk_parent_elements(registry, element, |id| {
            match registry.find(id)?.kind {
                ElementKind::Module(_) => Some(id),
                _ => None,
            }
        })
    }

    /// True when any ancestor scope is a procedure block.
    pub fn within_procedure_scope(
        &self,
        registry: &ElementRegistry,
        scope: Option<ElementId>,
    ) -> bool {
        self.walk_parent_scopes(registry, scope, |block_id| {
            let block = registry.block(block_id)?;
            if matches!(
                block.kind,
                BlockKind::ProcType | BlockKind::ProcInstance
            ) {
                Some(())
            } else {
                None
            }
        })
        .is_some()
    }
}
