//! The compile session: owns the terp, the assembler, the element registry,
//! and the scope manager, and drives the phase pipeline:
//!
//! parse → initialize core types → elaborate modules → execute directives →
//! resolve identifier references → resolve unknown types → type check →
//! fold constant intrinsics → emit → assemble → run.
//!
//! Phases short-circuit on failure, but each resolution pass completes
//! fully so the user receives a batch of related diagnostics.

use crate::compiler::element::{
    AttributeData, Element, ElementKind, ElementTag,
};
use crate::compiler::registry::ElementRegistry;
use crate::compiler::scope::ScopeManager;
use crate::compiler::types::{type_check, TypeVariant};
use crate::compiler::{BlockKind, QualifiedSymbol};
use crate::error::SessionResult;
use crate::id::ElementId;
use crate::source::{SourceFile, SourceLocation};
use crate::vm::assembler::Assembler;
use crate::vm::ffi::{CallingMode, FfiType, FfiValue, ForeignFunction};
use crate::vm::terp::Terp;
use std::io;
use std::path::{Path, PathBuf};

/// Where a per-file compile currently stands, for driver callbacks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    Start,
    Success,
    Failed,
}

pub type CompilePhaseCallback = Box<dyn Fn(SessionPhase, &Path)>;

/// Configuration for one compile session.
pub struct SessionOptions {
    pub heap_size: usize,
    pub stack_size: usize,
    pub verbose: bool,
    pub output_ast_graphs: bool,
    pub dom_graph_file: Option<PathBuf>,
    pub compile_callback: Option<CompilePhaseCallback>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            heap_size: 1024 * 1024 * 2,
            stack_size: 1024 * 64,
            verbose: false,
            output_ast_graphs: false,
            dom_graph_file: None,
            compile_callback: None,
        }
    }
}

pub struct Session {
    pub(crate) options: SessionOptions,
    pub(crate) result: SessionResult,
    pub(crate) terp: Terp,
    pub(crate) assembler: Assembler,
    pub(crate) elements: ElementRegistry,
    pub(crate) scopes: ScopeManager,
    pub(crate) source_files: Vec<SourceFile>,
    pub(crate) source_file_stack: Vec<usize>,
    pub(crate) program: Option<ElementId>,
    pub(crate) root_module: Option<ElementId>,
    /// identifier → data/code label name, assigned during emission
    pub(crate) emit_names: std::collections::HashMap<ElementId, String>,
    /// interned string value → constant-segment label name
    pub(crate) string_labels: std::collections::HashMap<String, String>,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        let terp = Terp::new(options.heap_size, options.stack_size);
        Self {
            options,
            result: SessionResult::new(),
            terp,
            assembler: Assembler::new(),
            elements: ElementRegistry::new(),
            scopes: ScopeManager::new(),
            source_files: Vec::new(),
            source_file_stack: Vec::new(),
            program: None,
            root_module: None,
            emit_names: std::collections::HashMap::new(),
            string_labels: std::collections::HashMap::new(),
        }
    }

    /// Queue a source file for compilation.
    pub fn add_source_file(&mut self, path: &Path) -> io::Result<usize> {
        let file = SourceFile::load(path)?;
        self.source_files.push(file);
        Ok(self.source_files.len() - 1)
    }

    /// Queue in-memory source text, mainly for tests.
    pub fn add_source(
        &mut self,
        path: impl Into<PathBuf>,
        source: impl Into<String>,
    ) -> usize {
        self.source_files
            .push(SourceFile::from_source(path.into(), source.into()));
        self.source_files.len() - 1
    }

    pub fn result(&self) -> &SessionResult {
        &self.result
    }

    pub fn terp(&self) -> &Terp {
        &self.terp
    }

    pub fn terp_mut(&mut self) -> &mut Terp {
        &mut self.terp
    }

    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    pub fn elements(&self) -> &ElementRegistry {
        &self.elements
    }

    pub fn scopes(&self) -> &ScopeManager {
        &self.scopes
    }

    pub fn program(&self) -> Option<ElementId> {
        self.program
    }

    /// Find a declared identifier by plain name (first match, in creation
    /// order). A convenience for tests and tooling.
    pub fn find_identifier_element(&self, name: &str) -> Option<ElementId> {
        self.elements
            .find_by_tag(ElementTag::Identifier)
            .into_iter()
            .find(|id| self.elements.identifier_name(*id) == Some(name))
    }

    /// The name of an identifier's bound type, if any.
    pub fn identifier_type_name(&self, id: ElementId) -> Option<String> {
        let type_id = self.elements.identifier(id)?.type_id?;
        Some(self.elements.type_data(type_id)?.name.clone())
    }

    pub fn root_module(&self) -> Option<ElementId> {
        self.root_module
    }

    pub(crate) fn error(
        &mut self,
        code: &'static str,
        message: impl Into<String>,
        location: SourceLocation,
    ) {
        self.result.error(code, message, location);
    }

    pub(crate) fn current_source_file(&self) -> Option<&SourceFile> {
        self.source_file_stack
            .last()
            .map(|index| &self.source_files[*index])
    }

    fn raise_phase(&self, phase: SessionPhase, index: usize) {
        if let Some(callback) = &self.options.compile_callback {
            callback(phase, self.source_files[index].path());
        }
    }

    // --------------------------------------------------------------------
    // the pipeline

    /// Compile every queued source file down to an assembled program in
    /// the terp's heap. Returns overall success.
    pub fn compile(&mut self) -> bool {
        if !self.terp.initialize(&mut self.result) {
            return false;
        }

        // the root program element and its top-level block
        let program_block = self.make_block(None, BlockKind::Basic);
        let program = self.elements.add(Element::new(
            ElementKind::Program(crate::compiler::element::ProgramData {
                block: Some(program_block),
            }),
            SourceLocation::default(),
        ));
        self.elements.find_mut(program_block).unwrap().parent_element =
            Some(program);
        self.program = Some(program);
        self.scopes.push_top_level(program_block);
        self.scopes.push_scope(program_block);

        self.initialize_core_types();

        // module expressions append nested sources during elaboration;
        // only the initially queued files are root modules
        let queued = self.source_files.len();
        for index in 0..queued {
            self.raise_phase(SessionPhase::Start, index);
            match self.compile_module_at(index) {
                Some(module) => {
                    self.elements.find_mut(module).unwrap().parent_element =
                        Some(program);
                    if self.root_module.is_none() {
                        self.root_module = Some(module);
                    }
                    self.raise_phase(SessionPhase::Success, index);
                }
                None => {
                    self.raise_phase(SessionPhase::Failed, index);
                    return false;
                }
            }
        }

        crate::debug!("elaborated {} elements", self.elements.len());

        if !self.execute_directives() {
            return false;
        }
        if !self.resolve_unresolved_identifiers() {
            return false;
        }
        if !self.resolve_unknown_types() {
            return false;
        }
        if !self.type_check() {
            return false;
        }
        if !self.fold_constant_intrinsics() {
            return false;
        }

        if !self.emit_program() {
            return false;
        }
        if !self.assembler.assemble(
            &mut self.result,
            &mut self.terp,
            crate::compiler::emit::ENTRY_LABEL,
        ) {
            return false;
        }
        crate::debug!("{}", self.assembler.listing());

        !self.result.is_failed()
    }

    /// Execute the assembled program until exit or trap.
    pub fn run(&mut self) -> bool {
        self.terp.run(&mut self.result)
    }

    // --------------------------------------------------------------------
    // phase 3: directives

    fn execute_directives(&mut self) -> bool {
        let directives = self.elements.find_by_tag(ElementTag::Directive);
        for directive in directives {
            if !self.execute_directive(directive) {
                let (name, location) = match self.elements.find(directive) {
                    Some(element) => match &element.kind {
                        ElementKind::Directive(data) => {
                            (data.name.clone(), element.location)
                        }
                        _ => continue,
                    },
                    None => continue,
                };
                self.error(
                    "P044",
                    format!("directive failed to execute: {}", name),
                    location,
                );
                return false;
            }
        }
        true
    }

    fn execute_directive(&mut self, directive: ElementId) -> bool {
        let name = match self.elements.find(directive) {
            Some(element) => match &element.kind {
                ElementKind::Directive(data) => data.name.clone(),
                _ => return true,
            },
            None => return true,
        };
        match name.as_str() {
            // scaffolded: declared but inert
            "run" | "load" => true,
            "foreign" => self.execute_foreign_directive(directive),
            _ => true,
        }
    }

    /// `#foreign`: load the named dynamic library, look up the target
    /// symbol, and register it with the terp's foreign-function table.
    fn execute_foreign_directive(&mut self, directive: ElementId) -> bool {
        let element = match self.elements.find(directive) {
            Some(element) => element,
            None => return false,
        };
        let location = element.location;

        let library_name = element
            .attributes
            .find("library")
            .and_then(|attr| self.elements.as_string(attr))
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_FOREIGN_LIBRARY.to_string());

        let expression = match &element.kind {
            ElementKind::Directive(data) => data.expression,
            _ => None,
        };
        let identifier = match expression {
            Some(expression) => expression,
            None => {
                self.error(
                    "P044",
                    "#foreign requires a procedure declaration",
                    location,
                );
                return false;
            }
        };

        let alias = self
            .elements
            .find(directive)
            .and_then(|element| element.attributes.find("alias"))
            .and_then(|attr| self.elements.as_string(attr))
            .map(str::to_string);

        let symbol_name = alias.unwrap_or_else(|| {
            self.elements
                .identifier_name(identifier)
                .unwrap_or_default()
                .to_string()
        });

        let library_path = platform_library_path(&library_name);
        if !self
            .terp
            .load_shared_library(&mut self.result, &library_path)
        {
            return false;
        }

        // the procedure type supplies the signature
        let proc_type = match self.procedure_type_of(identifier) {
            Some(proc_type) => proc_type,
            None => {
                self.error(
                    "P044",
                    "#foreign target is not a procedure",
                    location,
                );
                return false;
            }
        };
        let (parameters, returns) =
            match &self.elements.type_data(proc_type).unwrap().variant {
                TypeVariant::Procedure {
                    parameters,
                    returns,
                    ..
                } => (parameters.clone(), returns.clone()),
                _ => return false,
            };

        let mut arguments = Vec::new();
        for field in parameters {
            let name = self
                .field_identifier(field)
                .and_then(|identifier| {
                    self.elements.identifier_name(identifier)
                })
                .unwrap_or_default()
                .to_string();
            let value_type = self
                .field_identifier(field)
                .and_then(|identifier| {
                    self.elements.identifier(identifier)?.type_id
                })
                .map(|type_id| self.ffi_type_for(type_id))
                .unwrap_or(FfiType::Pointer);
            arguments.push(FfiValue::new(name, value_type));
        }
        let return_value = returns
            .first()
            .and_then(|field| self.field_identifier(*field))
            .and_then(|identifier| {
                self.elements.identifier(identifier)?.type_id
            })
            .map(|type_id| {
                FfiValue::new("", self.ffi_type_for(type_id))
            })
            .unwrap_or_else(FfiValue::void);

        let function = ForeignFunction {
            symbol: symbol_name,
            library_path,
            address: 0,
            return_value,
            arguments,
            calling_mode: CallingMode::CDefault,
        };
        let index = match self
            .terp
            .register_foreign_function(&mut self.result, function)
        {
            Some(index) => index,
            None => return false,
        };

        if let Some(type_data) = self.elements.type_data_mut(proc_type) {
            if let TypeVariant::Procedure {
                foreign_index, ..
            } = &mut type_data.variant
            {
                *foreign_index = Some(index);
            }
        }
        true
    }

    /// The procedure type bound to an identifier through its initializer.
    pub(crate) fn procedure_type_of(
        &self,
        identifier: ElementId,
    ) -> Option<ElementId> {
        let data = self.elements.identifier(identifier)?;
        let initializer = self.elements.find(data.initializer?)?;
        let expression = match &initializer.kind {
            ElementKind::Initializer(init) => init.expression,
            _ => return None,
        };
        let type_data = self.elements.type_data(expression)?;
        if type_data.is_procedure() {
            Some(expression)
        } else {
            None
        }
    }

    pub(crate) fn field_identifier(
        &self,
        field: ElementId,
    ) -> Option<ElementId> {
        match &self.elements.find(field)?.kind {
            ElementKind::Field(data) => Some(data.identifier),
            _ => None,
        }
    }

    fn ffi_type_for(&self, type_id: ElementId) -> FfiType {
        let type_data = match self.elements.type_data(type_id) {
            Some(type_data) => type_data,
            None => return FfiType::Pointer,
        };
        if type_data.name == "address" {
            return FfiType::Pointer;
        }
        match &type_data.variant {
            TypeVariant::Bool => FfiType::Bool,
            TypeVariant::Numeric { number_class, .. } => {
                match number_class {
                    crate::compiler::NumberClass::FloatingPoint => {
                        if type_data.size_in_bytes == 4 {
                            FfiType::Float
                        } else {
                            FfiType::Double
                        }
                    }
                    crate::compiler::NumberClass::Integer => {
                        match type_data.size_in_bytes {
                            1 => FfiType::Char,
                            2 => FfiType::Short,
                            4 => FfiType::Int,
                            _ => FfiType::LongLong,
                        }
                    }
                }
            }
            TypeVariant::Pointer { .. } | TypeVariant::String => {
                FfiType::Pointer
            }
            TypeVariant::Composite { .. } => FfiType::Struct,
            _ => FfiType::Pointer,
        }
    }

    // --------------------------------------------------------------------
    // phase 4: unresolved identifier references

    fn resolve_unresolved_identifiers(&mut self) -> bool {
        let pending: Vec<ElementId> = self
            .scopes
            .unresolved_identifier_references
            .drain(..)
            .collect();
        let mut unresolved = Vec::new();

        for reference in pending {
            let (symbol, scope, resolved) =
                match self.elements.find(reference) {
                    Some(element) => match &element.kind {
                        ElementKind::IdentifierReference(data) => (
                            data.symbol.clone(),
                            element.parent_scope,
                            data.identifier.is_some(),
                        ),
                        _ => continue,
                    },
                    None => continue,
                };
            if resolved {
                continue;
            }
            match self.scopes.find_identifier(
                &self.elements,
                &symbol,
                scope,
            ) {
                Some(identifier) => {
                    if let Some(element) = self.elements.find_mut(reference)
                    {
                        if let ElementKind::IdentifierReference(data) =
                            &mut element.kind
                        {
                            data.identifier = Some(identifier);
                        }
                    }
                }
                None => {
                    self.result.error(
                        "P004",
                        format!(
                            "unable to resolve identifier: {}",
                            symbol,
                        ),
                        symbol.location,
                    );
                    unresolved.push(reference);
                }
            }
        }

        self.scopes.unresolved_identifier_references = unresolved;
        self.scopes.unresolved_identifier_references.is_empty()
            && !self.result.is_failed()
    }

    // --------------------------------------------------------------------
    // phase 5: unknown types

    fn resolve_unknown_types(&mut self) -> bool {
        let pending: Vec<ElementId> = self
            .scopes
            .identifiers_with_unknown_types
            .drain(..)
            .collect();
        let mut unresolved = Vec::new();

        for identifier in pending {
            let (type_id, initializer, scope) =
                match self.elements.identifier(identifier) {
                    Some(data) => (
                        data.type_id,
                        data.initializer,
                        self.elements
                            .find(identifier)
                            .and_then(|element| element.parent_scope),
                    ),
                    None => continue,
                };

            let unknown = match type_id {
                Some(type_id)
                    if self
                        .elements
                        .type_data(type_id)
                        .map(|data| data.is_unknown())
                        .unwrap_or(false) =>
                {
                    type_id
                }
                // already resolved through another path
                _ => continue,
            };

            let resolved = match initializer {
                Some(initializer) => {
                    let expression = match self.elements.find(initializer)
                    {
                        Some(element) => match &element.kind {
                            ElementKind::Initializer(data) => {
                                data.expression
                            }
                            _ => continue,
                        },
                        None => continue,
                    };
                    self.infer_type(expression)
                }
                None => {
                    let (type_name, is_array, is_pointer, array_size) =
                        match &self
                            .elements
                            .type_data(unknown)
                            .unwrap()
                            .variant
                        {
                            TypeVariant::Unknown {
                                type_name,
                                is_array,
                                is_pointer,
                                array_size,
                            } => (
                                type_name.clone(),
                                *is_array,
                                *is_pointer,
                                *array_size,
                            ),
                            _ => continue,
                        };
                    let symbol = QualifiedSymbol::unqualified(
                        type_name,
                        Default::default(),
                    );
                    let base = self.scopes.find_type(
                        &self.elements,
                        &symbol,
                        scope,
                    );
                    base.map(|base| {
                        let mut resolved = base;
                        if is_array {
                            resolved = self
                                .intern_array_type(resolved, array_size, scope);
                        }
                        if is_pointer {
                            resolved =
                                self.intern_pointer_type(resolved, scope);
                        }
                        resolved
                    })
                }
            };

            match resolved {
                Some(resolved) => {
                    if let Some(data) =
                        self.elements.identifier_mut(identifier)
                    {
                        data.type_id = Some(resolved);
                        data.inferred_type = true;
                    }
                    self.elements.remove(unknown);
                }
                None => {
                    let name = self
                        .elements
                        .identifier_name(identifier)
                        .unwrap_or_default()
                        .to_string();
                    self.result.error(
                        "P004",
                        format!(
                            "unable to resolve type for identifier: {}",
                            name,
                        ),
                        self.elements
                            .find(identifier)
                            .map(|element| element.location)
                            .unwrap_or_default(),
                    );
                    unresolved.push(identifier);
                }
            }
        }

        self.scopes.identifiers_with_unknown_types = unresolved;
        self.scopes.identifiers_with_unknown_types.is_empty()
            && !self.result.is_failed()
    }

    // --------------------------------------------------------------------
    // phase 6: type check

    fn type_check(&mut self) -> bool {
        // declarations: initializer expression vs declared type
        for identifier in self.elements.find_by_tag(ElementTag::Identifier)
        {
            let (type_id, initializer) =
                match self.elements.identifier(identifier) {
                    Some(data) => (data.type_id, data.initializer),
                    None => continue,
                };
            let initializer = match initializer {
                Some(initializer) => initializer,
                None => continue,
            };
            let expression = match self.elements.find(initializer) {
                Some(element) => match &element.kind {
                    ElementKind::Initializer(data) => data.expression,
                    _ => continue,
                },
                None => continue,
            };
            let inferred = self.infer_type(expression);
            if let (Some(lhs), Some(rhs)) = (type_id, inferred) {
                if !type_check(&self.elements, lhs, rhs) {
                    self.report_type_mismatch(identifier, lhs, rhs);
                }
            }
        }

        // assignments: right-hand side vs target's declared type
        for operator in
            self.elements.find_by_tag(ElementTag::BinaryOperator)
        {
            let (lhs, rhs) = match self.elements.find(operator) {
                Some(element) => match &element.kind {
                    ElementKind::BinaryOperator(data)
                        if data.operator
                            == crate::compiler::OperatorKind::Assignment =>
                    {
                        (data.lhs, data.rhs)
                    }
                    _ => continue,
                },
                None => continue,
            };
            let lhs_type = self.infer_type(lhs);
            let rhs_type = self.infer_type(rhs);
            if let (Some(lhs_type), Some(rhs_type)) = (lhs_type, rhs_type) {
                if !type_check(&self.elements, lhs_type, rhs_type) {
                    self.report_type_mismatch(operator, lhs_type, rhs_type);
                }
            }
        }

        !self.result.is_failed()
    }

    fn report_type_mismatch(
        &mut self,
        element: ElementId,
        lhs: ElementId,
        rhs: ElementId,
    ) {
        let lhs_name = self
            .elements
            .type_data(lhs)
            .map(|data| data.name.clone())
            .unwrap_or_default();
        let rhs_name = self
            .elements
            .type_data(rhs)
            .map(|data| data.name.clone())
            .unwrap_or_default();
        let location = self
            .elements
            .find(element)
            .map(|element| element.location)
            .unwrap_or_default();
        self.result.error(
            "C051",
            format!(
                "type mismatch: expected {}, found {}",
                lhs_name, rhs_name,
            ),
            location,
        );
    }

    // --------------------------------------------------------------------
    // phase 7: constant intrinsic folding

    fn fold_constant_intrinsics(&mut self) -> bool {
        for intrinsic in self.elements.find_by_tag(ElementTag::Intrinsic) {
            let constant = match self.elements.find(intrinsic) {
                Some(element) => match &element.kind {
                    ElementKind::Intrinsic(data) => {
                        data.kind.is_constant()
                    }
                    _ => continue,
                },
                None => continue,
            };
            if !constant {
                continue;
            }

            let replacement = match self.fold_element(intrinsic) {
                Some(replacement) => replacement,
                None => continue,
            };

            let parent = self
                .elements
                .find(intrinsic)
                .and_then(|element| element.parent_element);
            if let Some(parent) = parent {
                if !self.splice_replacement(parent, intrinsic, replacement)
                {
                    continue;
                }
                let attribute = self.elements.add(Element::new(
                    ElementKind::Attribute(AttributeData {
                        name: "intrinsic_substitution".to_string(),
                        expression: None,
                    }),
                    SourceLocation::default(),
                ));
                if let Some(element) = self.elements.find_mut(replacement)
                {
                    element.parent_element = Some(parent);
                    element
                        .attributes
                        .add("intrinsic_substitution", attribute);
                }
                self.elements.remove(intrinsic);
            }
        }
        !self.result.is_failed()
    }

    /// Install `replacement` where `child` sat inside `parent`.
    fn splice_replacement(
        &mut self,
        parent: ElementId,
        child: ElementId,
        replacement: ElementId,
    ) -> bool {
        let element = match self.elements.find_mut(parent) {
            Some(element) => element,
            None => return false,
        };
        match &mut element.kind {
            ElementKind::Initializer(data) => {
                if data.expression == child {
                    data.expression = replacement;
                    return true;
                }
            }
            ElementKind::ArgumentList(data) => {
                for slot in &mut data.elements {
                    if *slot == child {
                        *slot = replacement;
                        return true;
                    }
                }
            }
            ElementKind::UnaryOperator(data) => {
                if data.rhs == child {
                    data.rhs = replacement;
                    return true;
                }
            }
            ElementKind::BinaryOperator(data) => {
                if data.lhs == child {
                    data.lhs = replacement;
                    return true;
                }
                if data.rhs == child {
                    data.rhs = replacement;
                    return true;
                }
            }
            ElementKind::Expression(data) => {
                if data.root == child {
                    data.root = replacement;
                    return true;
                }
            }
            ElementKind::Statement(data) => {
                if data.expression == Some(child) {
                    data.expression = Some(replacement);
                    return true;
                }
            }
            ElementKind::Return(data) => {
                for slot in &mut data.expressions {
                    if *slot == child {
                        *slot = replacement;
                        return true;
                    }
                }
            }
            _ => {}
        }
        false
    }
}

/// The library used by `#foreign` when no `library` attribute is present.
#[cfg(target_os = "macos")]
const DEFAULT_FOREIGN_LIBRARY: &str = "libSystem";
#[cfg(not(target_os = "macos"))]
const DEFAULT_FOREIGN_LIBRARY: &str = "libc";

/// Render a library name into a platform path: `libc` stays special-cased
/// to the C runtime; bare names grow the platform prefix/suffix.
pub(crate) fn platform_library_path(name: &str) -> PathBuf {
    if name.contains('.') || name.contains('/') {
        return PathBuf::from(name);
    }
    #[cfg(target_os = "macos")]
    {
        if name == "libc" || name == "libSystem" {
            return PathBuf::from("libSystem.dylib");
        }
        if name.starts_with("lib") {
            return PathBuf::from(format!("{}.dylib", name));
        }
        PathBuf::from(format!("lib{}.dylib", name))
    }
    #[cfg(not(target_os = "macos"))]
    {
        if name == "libc" {
            return PathBuf::from("libc.so.6");
        }
        if name.starts_with("lib") {
            return PathBuf::from(format!("{}.so", name));
        }
        PathBuf::from(format!("lib{}.so", name))
    }
}
