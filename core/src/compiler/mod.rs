//! The semantic elaboration engine: conversion of a raw AST into a graph of
//! typed program elements, the registry that owns them, scope and symbol
//! resolution, the multi-pass session driver, and code generation into the
//! VM's instruction blocks.

pub mod builder;
pub mod element;
pub mod emit;
pub mod evaluator;
pub mod fold;
pub mod registry;
pub mod scope;
pub mod session;
pub mod types;

pub use element::{
    AttributeMap, BlockKind, CommentKind, Element, ElementKind, ElementTag,
    IntrinsicKind, OperatorKind, QualifiedSymbol, StorageUsage,
};
pub use registry::ElementRegistry;
pub use scope::ScopeManager;
pub use session::{Session, SessionOptions, SessionPhase};
pub use types::{
    AccessModel, CompositeKind, NumberClass, TypeData, TypeVariant,
};
