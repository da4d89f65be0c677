//! All the node types that can appear in a raw Basecode syntax tree. There
//! is no compiler logic implemented here, just basic types: the parser
//! produces this tree and the AST evaluator consumes it. Every node carries
//! the [SourceLocation] of the text that produced it.

use crate::source::SourceLocation;
use serde::Serialize;

/// The fixed enumeration of raw syntax node kinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum AstNodeKind {
    Module,
    BasicBlock,
    Statement,
    Expression,
    Assignment,
    Symbol,
    SymbolPart,
    Attribute,
    Directive,
    ProcCall,
    ProcExpression,
    ArgumentList,
    TargetList,
    SourceList,
    TypeList,
    ParameterList,
    LabelList,
    Label,
    TypeIdentifier,
    UnaryOperator,
    BinaryOperator,
    IfExpression,
    ElseIfExpression,
    ElseExpression,
    WhileExpression,
    EnumExpression,
    UnionExpression,
    StructExpression,
    ReturnStatement,
    ImportExpression,
    NamespaceExpression,
    ModuleExpression,
    CastExpression,
    TransmuteExpression,
    AliasExpression,
    LineComment,
    BlockComment,
    StringLiteral,
    NumberLiteral,
    BooleanLiteral,
    NullLiteral,
}

/// Number class of a number literal token.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum NumberType {
    None,
    Integer,
    FloatingPoint,
}

impl Default for NumberType {
    fn default() -> Self {
        NumberType::None
    }
}

/// The lexical token attached to a node: its raw text plus enough metadata
/// to interpret literals without re-lexing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Token {
    pub value: String,
    pub number_type: NumberType,
    pub radix: u32,
    pub is_signed: bool,
}

impl Default for Token {
    fn default() -> Self {
        Self::new("")
    }
}

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            number_type: NumberType::None,
            radix: 10,
            is_signed: false,
        }
    }

    pub fn integer(value: impl Into<String>, radix: u32, is_signed: bool) -> Self {
        Self {
            value: value.into(),
            number_type: NumberType::Integer,
            radix,
            is_signed,
        }
    }

    pub fn floating_point(value: impl Into<String>, is_signed: bool) -> Self {
        Self {
            value: value.into(),
            number_type: NumberType::FloatingPoint,
            radix: 10,
            is_signed,
        }
    }

    pub fn number_type(&self) -> NumberType {
        self.number_type
    }

    pub fn is_signed(&self) -> bool {
        self.is_signed
    }

    /// Parse the token text as an unsigned 64-bit integer. For signed
    /// tokens the magnitude is parsed and two's-complement converted by the
    /// caller.
    pub fn parse_integer(&self) -> Result<u64, std::num::ParseIntError> {
        let digits = self.value.trim_start_matches('-');
        u64::from_str_radix(digits, self.radix)
    }

    /// Parse the token text as a 64-bit float.
    pub fn parse_float(&self) -> Result<f64, std::num::ParseFloatError> {
        self.value.parse::<f64>()
    }

    pub fn as_bool(&self) -> bool {
        self.value == "true"
    }
}

/// A single raw syntax node. The meaning of `lhs`, `rhs`, and `children`
/// depends on the node kind; the evaluator documents the contract per kind.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AstNode {
    pub kind: AstNodeKind,
    pub token: Token,
    pub lhs: Option<Box<AstNode>>,
    pub rhs: Option<Box<AstNode>>,
    pub children: Vec<AstNode>,
    pub is_array: bool,
    pub is_spread: bool,
    pub is_pointer: bool,
    pub is_constant: bool,
    pub array_size: usize,
    pub location: SourceLocation,
}

impl AstNode {
    pub fn new(kind: AstNodeKind, location: SourceLocation) -> Self {
        Self {
            kind,
            token: Token::default(),
            lhs: None,
            rhs: None,
            children: Vec::new(),
            is_array: false,
            is_spread: false,
            is_pointer: false,
            is_constant: false,
            array_size: 0,
            location,
        }
    }

    pub fn with_token(
        kind: AstNodeKind,
        token: Token,
        location: SourceLocation,
    ) -> Self {
        Self {
            token,
            ..Self::new(kind, location)
        }
    }

    /// True when this symbol node carries a namespace path, e.g. `math::pi`.
    pub fn is_qualified_symbol(&self) -> bool {
        self.kind == AstNodeKind::Symbol && self.children.len() > 1
    }

    /// True when this declaration was introduced with `::`.
    pub fn is_constant_expression(&self) -> bool {
        self.is_constant
    }

    /// The type annotation attached to a symbol node, if any.
    pub fn type_annotation(&self) -> Option<&AstNode> {
        match self.kind {
            AstNodeKind::Symbol => self.rhs.as_deref(),
            _ => None,
        }
    }
}
