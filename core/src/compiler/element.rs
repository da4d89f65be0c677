//! The element: the universal node of the program graph. Every construct a
//! program contains becomes an element with identity, parentage,
//! attributes, and a kind-specific payload. Elements are owned by the
//! [ElementRegistry](crate::compiler::ElementRegistry); all cross
//! references are by [ElementId], never by pointer, so reference cycles
//! between blocks, namespaces, and identifiers are safe.

use crate::compiler::types::TypeData;
use crate::id::ElementId;
use crate::source::SourceLocation;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// An identifier name plus the namespace path that qualifies it. Equality
/// and hashing use only the fully qualified rendering.
#[derive(Clone, Debug)]
pub struct QualifiedSymbol {
    pub namespaces: Vec<String>,
    pub name: String,
    pub fully_qualified: String,
    pub location: SourceLocation,
}

impl QualifiedSymbol {
    pub fn new(
        namespaces: Vec<String>,
        name: impl Into<String>,
        location: SourceLocation,
    ) -> Self {
        let name = name.into();
        let fully_qualified = make_fully_qualified_name(&namespaces, &name);
        Self {
            namespaces,
            name,
            fully_qualified,
            location,
        }
    }

    pub fn unqualified(
        name: impl Into<String>,
        location: SourceLocation,
    ) -> Self {
        Self::new(Vec::new(), name, location)
    }

    pub fn is_qualified(&self) -> bool {
        !self.namespaces.is_empty()
    }
}

impl PartialEq for QualifiedSymbol {
    fn eq(&self, other: &Self) -> bool {
        self.fully_qualified == other.fully_qualified
    }
}

impl Eq for QualifiedSymbol {}

impl std::hash::Hash for QualifiedSymbol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fully_qualified.hash(state);
    }
}

impl fmt::Display for QualifiedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fully_qualified)
    }
}

pub fn make_fully_qualified_name(
    namespaces: &[String],
    name: &str,
) -> String {
    if namespaces.is_empty() {
        name.to_string()
    } else {
        format!("{}::{}", namespaces.join("::"), name)
    }
}

/// Every operator an expression can carry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperatorKind {
    // unary
    Negate,
    BinaryNot,
    LogicalNot,
    // binary
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    LogicalAnd,
    LogicalOr,
    BinaryAnd,
    BinaryOr,
    BinaryXor,
    ShiftLeft,
    ShiftRight,
    RotateLeft,
    RotateRight,
    Assignment,
}

impl OperatorKind {
    /// Map a unary operator token to its kind.
    pub fn from_unary_token(token: &str) -> Option<Self> {
        match token {
            "-" => Some(Self::Negate),
            "~" => Some(Self::BinaryNot),
            "!" => Some(Self::LogicalNot),
            _ => None,
        }
    }

    /// Map a binary operator token to its kind.
    pub fn from_binary_token(token: &str) -> Option<Self> {
        match token {
            "+" => Some(Self::Add),
            "-" => Some(Self::Subtract),
            "*" => Some(Self::Multiply),
            "/" => Some(Self::Divide),
            "%" => Some(Self::Modulo),
            "==" => Some(Self::Equals),
            "!=" => Some(Self::NotEquals),
            ">" => Some(Self::GreaterThan),
            ">=" => Some(Self::GreaterThanOrEqual),
            "<" => Some(Self::LessThan),
            "<=" => Some(Self::LessThanOrEqual),
            "&&" => Some(Self::LogicalAnd),
            "||" => Some(Self::LogicalOr),
            "&" => Some(Self::BinaryAnd),
            "|" => Some(Self::BinaryOr),
            "^" => Some(Self::BinaryXor),
            "<<" => Some(Self::ShiftLeft),
            ">>" => Some(Self::ShiftRight),
            "<<<" => Some(Self::RotateLeft),
            ">>>" => Some(Self::RotateRight),
            ":=" => Some(Self::Assignment),
            _ => None,
        }
    }

    /// True for operators whose result is a boolean.
    pub fn is_boolean(self) -> bool {
        matches!(
            self,
            Self::Equals
                | Self::NotEquals
                | Self::GreaterThan
                | Self::GreaterThanOrEqual
                | Self::LessThan
                | Self::LessThanOrEqual
                | Self::LogicalAnd
                | Self::LogicalOr
                | Self::LogicalNot
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommentKind {
    Line,
    Block,
}

/// Where an identifier's storage lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageUsage {
    Heap,
    Stack,
}

/// Built-in pseudo-procedures recognized by name at call sites.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IntrinsicKind {
    SizeOf,
    AlignOf,
    TypeOf,
    Alloc,
    Free,
    Copy,
    Fill,
}

impl IntrinsicKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "size_of" => Some(Self::SizeOf),
            "align_of" => Some(Self::AlignOf),
            "type_of" => Some(Self::TypeOf),
            "alloc" => Some(Self::Alloc),
            "free" => Some(Self::Free),
            "copy" => Some(Self::Copy),
            "fill" => Some(Self::Fill),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SizeOf => "size_of",
            Self::AlignOf => "align_of",
            Self::TypeOf => "type_of",
            Self::Alloc => "alloc",
            Self::Free => "free",
            Self::Copy => "copy",
            Self::Fill => "fill",
        }
    }

    /// Whether a call to this intrinsic can be folded at compile time.
    pub fn is_constant(self) -> bool {
        matches!(self, Self::SizeOf | Self::AlignOf)
    }
}

/// What role a block plays.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockKind {
    Basic,
    Module,
    ProcType,
    ProcInstance,
}

/// Named attribute metadata attached to an element. Values are ids of
/// `Attribute` elements.
#[derive(Clone, Debug, Default)]
pub struct AttributeMap {
    entries: HashMap<String, ElementId>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First add wins, matching declaration order semantics.
    pub fn add(&mut self, name: impl Into<String>, attribute: ElementId) {
        self.entries.entry(name.into()).or_insert(attribute);
    }

    pub fn find(&self, name: &str) -> Option<ElementId> {
        self.entries.get(name).copied()
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ElementId)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ------------------------------------------------------------------------
// kind payloads

#[derive(Clone, Debug, Default)]
pub struct ProgramData {
    pub block: Option<ElementId>,
}

#[derive(Clone, Debug)]
pub struct ModuleData {
    pub scope: ElementId,
    pub source: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ModuleReferenceData {
    pub expression: ElementId,
    pub module: Option<ElementId>,
}

#[derive(Clone, Debug)]
pub struct BlockData {
    pub kind: BlockKind,
    pub statements: Vec<ElementId>,
    pub identifiers: HashMap<String, ElementId>,
    pub types: HashMap<String, ElementId>,
    pub blocks: Vec<ElementId>,
    pub imports: Vec<ElementId>,
    pub comments: Vec<ElementId>,
}

impl BlockData {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            statements: Vec::new(),
            identifiers: HashMap::new(),
            types: HashMap::new(),
            blocks: Vec::new(),
            imports: Vec::new(),
            comments: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SymbolData {
    pub name: String,
    pub namespaces: Vec<String>,
    pub constant: bool,
}

impl SymbolData {
    pub fn qualified_symbol(
        &self,
        location: SourceLocation,
    ) -> QualifiedSymbol {
        QualifiedSymbol::new(
            self.namespaces.clone(),
            self.name.clone(),
            location,
        )
    }
}

#[derive(Clone, Debug)]
pub struct IdentifierData {
    pub symbol: ElementId,
    pub type_id: Option<ElementId>,
    pub initializer: Option<ElementId>,
    pub usage: StorageUsage,
    pub inferred_type: bool,
    pub constant: bool,
}

#[derive(Clone, Debug)]
pub struct IdentifierReferenceData {
    pub symbol: QualifiedSymbol,
    pub identifier: Option<ElementId>,
}

#[derive(Clone, Debug)]
pub struct TypeReferenceData {
    pub symbol: QualifiedSymbol,
    pub type_id: Option<ElementId>,
}

#[derive(Clone, Debug)]
pub struct InitializerData {
    pub expression: ElementId,
}

#[derive(Clone, Debug)]
pub struct UnaryOperatorData {
    pub operator: OperatorKind,
    pub rhs: ElementId,
}

#[derive(Clone, Debug)]
pub struct BinaryOperatorData {
    pub operator: OperatorKind,
    pub lhs: ElementId,
    pub rhs: ElementId,
}

#[derive(Clone, Debug)]
pub struct CastData {
    pub type_id: ElementId,
    pub expression: ElementId,
}

#[derive(Clone, Debug)]
pub struct AliasData {
    pub expression: ElementId,
}

#[derive(Clone, Debug)]
pub struct IfData {
    pub predicate: ElementId,
    pub true_branch: ElementId,
    pub false_branch: Option<ElementId>,
}

#[derive(Clone, Debug)]
pub struct WhileData {
    pub predicate: ElementId,
    pub body: ElementId,
}

#[derive(Clone, Debug, Default)]
pub struct ReturnData {
    pub expressions: Vec<ElementId>,
}

#[derive(Clone, Debug)]
pub struct StatementData {
    pub labels: Vec<ElementId>,
    pub expression: Option<ElementId>,
}

#[derive(Clone, Debug)]
pub struct ExpressionData {
    pub root: ElementId,
}

#[derive(Clone, Debug)]
pub struct FieldData {
    pub identifier: ElementId,
}

#[derive(Clone, Debug, Default)]
pub struct ArgumentListData {
    pub elements: Vec<ElementId>,
}

#[derive(Clone, Debug)]
pub struct ProcedureCallData {
    pub reference: ElementId,
    pub arguments: ElementId,
}

#[derive(Clone, Debug)]
pub struct ProcedureInstanceData {
    pub procedure_type: ElementId,
    pub scope: ElementId,
}

#[derive(Clone, Debug)]
pub struct IntrinsicData {
    pub kind: IntrinsicKind,
    pub arguments: ElementId,
}

#[derive(Clone, Debug)]
pub struct NamespaceData {
    pub expression: ElementId,
}

#[derive(Clone, Debug)]
pub struct ImportData {
    pub expression: ElementId,
    pub from_expression: Option<ElementId>,
    pub module: Option<ElementId>,
}

#[derive(Clone, Debug)]
pub struct CommentData {
    pub kind: CommentKind,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct AttributeData {
    pub name: String,
    pub expression: Option<ElementId>,
}

#[derive(Clone, Debug)]
pub struct DirectiveData {
    pub name: String,
    pub expression: Option<ElementId>,
}

/// The tagged payload of an element.
#[derive(Clone, Debug)]
pub enum ElementKind {
    Program(ProgramData),
    Module(ModuleData),
    ModuleReference(ModuleReferenceData),
    Block(BlockData),
    Symbol(SymbolData),
    Identifier(IdentifierData),
    IdentifierReference(IdentifierReferenceData),
    TypeReference(TypeReferenceData),
    Initializer(InitializerData),
    IntegerLiteral(u64),
    FloatLiteral(f64),
    BooleanLiteral(bool),
    StringLiteral(String),
    UnaryOperator(UnaryOperatorData),
    BinaryOperator(BinaryOperatorData),
    Cast(CastData),
    Transmute(CastData),
    Alias(AliasData),
    If(IfData),
    While(WhileData),
    Return(ReturnData),
    Statement(StatementData),
    Expression(ExpressionData),
    Label(String),
    Field(FieldData),
    ArgumentList(ArgumentListData),
    ProcedureCall(ProcedureCallData),
    ProcedureInstance(ProcedureInstanceData),
    Intrinsic(IntrinsicData),
    Namespace(NamespaceData),
    Import(ImportData),
    Comment(CommentData),
    Attribute(AttributeData),
    Directive(DirectiveData),
    Type(TypeData),
}

/// The fieldless discriminant used for the registry's secondary index.
/// Blocks and types index under their role-specific tags.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ElementTag {
    Program,
    Module,
    ModuleReference,
    Block,
    ModuleBlock,
    ProcTypeBlock,
    ProcInstanceBlock,
    Symbol,
    Identifier,
    IdentifierReference,
    TypeReference,
    Initializer,
    IntegerLiteral,
    FloatLiteral,
    BooleanLiteral,
    StringLiteral,
    UnaryOperator,
    BinaryOperator,
    Cast,
    Transmute,
    Alias,
    If,
    While,
    Return,
    Statement,
    Expression,
    Label,
    Field,
    ArgumentList,
    ProcedureCall,
    ProcedureInstance,
    Intrinsic,
    Namespace,
    Import,
    Comment,
    Attribute,
    Directive,
    NumericType,
    BoolType,
    StringType,
    AnyType,
    NamespaceType,
    ModuleType,
    TypeInfoType,
    TupleType,
    CompositeType,
    ArrayType,
    PointerType,
    ProcedureType,
    UnknownType,
}

/// One node of the program graph.
#[derive(Clone, Debug)]
pub struct Element {
    pub id: ElementId,
    pub parent_element: Option<ElementId>,
    pub parent_scope: Option<ElementId>,
    pub module: Option<ElementId>,
    pub attributes: AttributeMap,
    pub location: SourceLocation,
    pub kind: ElementKind,
}

impl Element {
    /// Elements are created with a placeholder id; the registry assigns
    /// the real one on insert.
    pub fn new(kind: ElementKind, location: SourceLocation) -> Self {
        Self {
            id: ElementId(0),
            parent_element: None,
            parent_scope: None,
            module: None,
            attributes: AttributeMap::new(),
            location,
            kind,
        }
    }

    pub fn tag(&self) -> ElementTag {
        use crate::compiler::types::TypeVariant;
        match &self.kind {
            ElementKind::Program(_) => ElementTag::Program,
            ElementKind::Module(_) => ElementTag::Module,
            ElementKind::ModuleReference(_) => ElementTag::ModuleReference,
            ElementKind::Block(block) => match block.kind {
                BlockKind::Basic => ElementTag::Block,
                BlockKind::Module => ElementTag::ModuleBlock,
                BlockKind::ProcType => ElementTag::ProcTypeBlock,
                BlockKind::ProcInstance => ElementTag::ProcInstanceBlock,
            },
            ElementKind::Symbol(_) => ElementTag::Symbol,
            ElementKind::Identifier(_) => ElementTag::Identifier,
            ElementKind::IdentifierReference(_) => {
                ElementTag::IdentifierReference
            }
            ElementKind::TypeReference(_) => ElementTag::TypeReference,
            ElementKind::Initializer(_) => ElementTag::Initializer,
            ElementKind::IntegerLiteral(_) => ElementTag::IntegerLiteral,
            ElementKind::FloatLiteral(_) => ElementTag::FloatLiteral,
            ElementKind::BooleanLiteral(_) => ElementTag::BooleanLiteral,
            ElementKind::StringLiteral(_) => ElementTag::StringLiteral,
            ElementKind::UnaryOperator(_) => ElementTag::UnaryOperator,
            ElementKind::BinaryOperator(_) => ElementTag::BinaryOperator,
            ElementKind::Cast(_) => ElementTag::Cast,
            ElementKind::Transmute(_) => ElementTag::Transmute,
            ElementKind::Alias(_) => ElementTag::Alias,
            ElementKind::If(_) => ElementTag::If,
            ElementKind::While(_) => ElementTag::While,
            ElementKind::Return(_) => ElementTag::Return,
            ElementKind::Statement(_) => ElementTag::Statement,
            ElementKind::Expression(_) => ElementTag::Expression,
            ElementKind::Label(_) => ElementTag::Label,
            ElementKind::Field(_) => ElementTag::Field,
            ElementKind::ArgumentList(_) => ElementTag::ArgumentList,
            ElementKind::ProcedureCall(_) => ElementTag::ProcedureCall,
            ElementKind::ProcedureInstance(_) => {
                ElementTag::ProcedureInstance
            }
            ElementKind::Intrinsic(_) => ElementTag::Intrinsic,
            ElementKind::Namespace(_) => ElementTag::Namespace,
            ElementKind::Import(_) => ElementTag::Import,
            ElementKind::Comment(_) => ElementTag::Comment,
            ElementKind::Attribute(_) => ElementTag::Attribute,
            ElementKind::Directive(_) => ElementTag::Directive,
            ElementKind::Type(type_data) => match &type_data.variant {
                TypeVariant::Numeric { .. } => ElementTag::NumericType,
                TypeVariant::Bool => ElementTag::BoolType,
                TypeVariant::String => ElementTag::StringType,
                TypeVariant::Any => ElementTag::AnyType,
                TypeVariant::Namespace => ElementTag::NamespaceType,
                TypeVariant::Module => ElementTag::ModuleType,
                TypeVariant::TypeInfo => ElementTag::TypeInfoType,
                TypeVariant::Tuple => ElementTag::TupleType,
                TypeVariant::Composite { .. } => ElementTag::CompositeType,
                TypeVariant::Array { .. } => ElementTag::ArrayType,
                TypeVariant::Pointer { .. } => ElementTag::PointerType,
                TypeVariant::Procedure { .. } => ElementTag::ProcedureType,
                TypeVariant::Unknown { .. } => ElementTag::UnknownType,
            },
        }
    }

    pub fn is_type(&self) -> bool {
        matches!(self.kind, ElementKind::Type(_))
    }

    /// The children this element owns, in declaration order. Drives
    /// teardown and ownership walks.
    pub fn owned_elements(&self) -> Vec<ElementId> {
        let mut owned = Vec::new();
        match &self.kind {
            ElementKind::Program(program) => {
                owned.extend(program.block);
            }
            ElementKind::Module(module) => owned.push(module.scope),
            ElementKind::ModuleReference(module_ref) => {
                owned.push(module_ref.expression);
            }
            ElementKind::Block(block) => {
                owned.extend(block.statements.iter().copied());
                owned.extend(block.identifiers.values().copied());
                owned.extend(block.types.values().copied());
                owned.extend(block.blocks.iter().copied());
                owned.extend(block.imports.iter().copied());
                owned.extend(block.comments.iter().copied());
            }
            ElementKind::Symbol(_) => {}
            ElementKind::Identifier(identifier) => {
                owned.push(identifier.symbol);
                owned.extend(identifier.initializer);
            }
            ElementKind::IdentifierReference(_) => {}
            ElementKind::TypeReference(_) => {}
            ElementKind::Initializer(initializer) => {
                owned.push(initializer.expression);
            }
            ElementKind::IntegerLiteral(_)
            | ElementKind::FloatLiteral(_)
            | ElementKind::BooleanLiteral(_)
            | ElementKind::StringLiteral(_)
            | ElementKind::Label(_)
            | ElementKind::Comment(_) => {}
            ElementKind::UnaryOperator(unary) => owned.push(unary.rhs),
            ElementKind::BinaryOperator(binary) => {
                owned.push(binary.lhs);
                owned.push(binary.rhs);
            }
            ElementKind::Cast(cast) | ElementKind::Transmute(cast) => {
                owned.push(cast.expression);
            }
            ElementKind::Alias(alias) => owned.push(alias.expression),
            ElementKind::If(if_data) => {
                owned.push(if_data.predicate);
                owned.push(if_data.true_branch);
                owned.extend(if_data.false_branch);
            }
            ElementKind::While(while_data) => {
                owned.push(while_data.predicate);
                owned.push(while_data.body);
            }
            ElementKind::Return(return_data) => {
                owned.extend(return_data.expressions.iter().copied());
            }
            ElementKind::Statement(statement) => {
                owned.extend(statement.labels.iter().copied());
                owned.extend(statement.expression);
            }
            ElementKind::Expression(expression) => {
                owned.push(expression.root);
            }
            ElementKind::Field(field) => owned.push(field.identifier),
            ElementKind::ArgumentList(arguments) => {
                owned.extend(arguments.elements.iter().copied());
            }
            ElementKind::ProcedureCall(call) => {
                owned.push(call.reference);
                owned.push(call.arguments);
            }
            ElementKind::ProcedureInstance(instance) => {
                owned.push(instance.scope);
            }
            ElementKind::Intrinsic(intrinsic) => {
                owned.push(intrinsic.arguments);
            }
            ElementKind::Namespace(namespace) => {
                owned.push(namespace.expression);
            }
            ElementKind::Import(import) => {
                owned.push(import.expression);
                owned.extend(import.from_expression);
            }
            ElementKind::Attribute(attribute) => {
                owned.extend(attribute.expression);
            }
            ElementKind::Directive(directive) => {
                owned.extend(directive.expression);
            }
            ElementKind::Type(type_data) => {
                owned.extend(type_data.owned_elements());
            }
        }
        owned
    }

    // --------------------------------------------------------------------
    // typed accessors

    pub fn as_block(&self) -> Option<&BlockData> {
        match &self.kind {
            ElementKind::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_block_mut(&mut self) -> Option<&mut BlockData> {
        match &mut self.kind {
            ElementKind::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_identifier(&self) -> Option<&IdentifierData> {
        match &self.kind {
            ElementKind::Identifier(identifier) => Some(identifier),
            _ => None,
        }
    }

    pub fn as_identifier_mut(&mut self) -> Option<&mut IdentifierData> {
        match &mut self.kind {
            ElementKind::Identifier(identifier) => Some(identifier),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<&TypeData> {
        match &self.kind {
            ElementKind::Type(type_data) => Some(type_data),
            _ => None,
        }
    }

    pub fn as_type_mut(&mut self) -> Option<&mut TypeData> {
        match &mut self.kind {
            ElementKind::Type(type_data) => Some(type_data),
            _ => None,
        }
    }
}
