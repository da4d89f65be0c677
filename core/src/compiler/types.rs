//! Type elements: the payloads of `ElementKind::Type` and the static
//! numeric-type table consulted at session initialization. Array and
//! pointer types are interned by canonical name (`__array_<entry>_<n>__`,
//! `__ptr_<base>__`) within the scope chain.

use crate::compiler::registry::ElementRegistry;
use crate::id::ElementId;
use std::collections::HashMap;

/// Whether a numeric type holds integers or floats.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NumberClass {
    Integer,
    FloatingPoint,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompositeKind {
    Struct,
    Union,
    Enum,
}

impl CompositeKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Struct => "struct",
            Self::Union => "union",
            Self::Enum => "enum",
        }
    }
}

/// Whether values of a type are held directly in registers or via a
/// pointer into the heap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessModel {
    Value,
    Pointer,
}

/// Static properties of one numeric primitive.
#[derive(Copy, Clone, Debug)]
pub struct NumericTypeProperties {
    pub min: i64,
    pub max: u64,
    pub size_in_bytes: usize,
    pub signed: bool,
    pub number_class: NumberClass,
}

/// The primitive numeric types, consulted at session initialization.
pub const NUMERIC_TYPES: &[(&str, NumericTypeProperties)] = &[
    (
        "u8",
        NumericTypeProperties {
            min: 0,
            max: u8::MAX as u64,
            size_in_bytes: 1,
            signed: false,
            number_class: NumberClass::Integer,
        },
    ),
    (
        "u16",
        NumericTypeProperties {
            min: 0,
            max: u16::MAX as u64,
            size_in_bytes: 2,
            signed: false,
            number_class: NumberClass::Integer,
        },
    ),
    (
        "u32",
        NumericTypeProperties {
            min: 0,
            max: u32::MAX as u64,
            size_in_bytes: 4,
            signed: false,
            number_class: NumberClass::Integer,
        },
    ),
    (
        "u64",
        NumericTypeProperties {
            min: 0,
            max: u64::MAX,
            size_in_bytes: 8,
            signed: false,
            number_class: NumberClass::Integer,
        },
    ),
    (
        "s8",
        NumericTypeProperties {
            min: i8::MIN as i64,
            max: i8::MAX as u64,
            size_in_bytes: 1,
            signed: true,
            number_class: NumberClass::Integer,
        },
    ),
    (
        "s16",
        NumericTypeProperties {
            min: i16::MIN as i64,
            max: i16::MAX as u64,
            size_in_bytes: 2,
            signed: true,
            number_class: NumberClass::Integer,
        },
    ),
    (
        "s32",
        NumericTypeProperties {
            min: i32::MIN as i64,
            max: i32::MAX as u64,
            size_in_bytes: 4,
            signed: true,
            number_class: NumberClass::Integer,
        },
    ),
    (
        "s64",
        NumericTypeProperties {
            min: i64::MIN,
            max: i64::MAX as u64,
            size_in_bytes: 8,
            signed: true,
            number_class: NumberClass::Integer,
        },
    ),
    (
        "f32",
        NumericTypeProperties {
            min: 0,
            max: u32::MAX as u64,
            size_in_bytes: 4,
            signed: true,
            number_class: NumberClass::FloatingPoint,
        },
    ),
    (
        "f64",
        NumericTypeProperties {
            min: 0,
            max: u64::MAX,
            size_in_bytes: 8,
            signed: true,
            number_class: NumberClass::FloatingPoint,
        },
    ),
    (
        "address",
        NumericTypeProperties {
            min: 0,
            max: u64::MAX,
            size_in_bytes: 8,
            signed: false,
            number_class: NumberClass::Integer,
        },
    ),
];

pub fn numeric_properties(name: &str) -> Option<NumericTypeProperties> {
    NUMERIC_TYPES
        .iter()
        .find(|(type_name, _)| *type_name == name)
        .map(|(_, properties)| *properties)
}

/// The canonical interning name of a pointer type.
pub fn name_for_pointer(base_name: &str) -> String {
    format!("__ptr_{}__", base_name)
}

/// The canonical interning name of an array type.
pub fn name_for_array(entry_name: &str, size: usize) -> String {
    format!("__array_{}_{}__", entry_name, size)
}

/// The structural variant of a type element.
#[derive(Clone, Debug)]
pub enum TypeVariant {
    Numeric {
        min: i64,
        max: u64,
        signed: bool,
        number_class: NumberClass,
    },
    Bool,
    String,
    Any,
    Namespace,
    Module,
    TypeInfo,
    Tuple,
    Composite {
        kind: CompositeKind,
        fields: Vec<ElementId>,
        type_params: HashMap<String, ElementId>,
    },
    Array {
        entry: ElementId,
        size: usize,
    },
    Pointer {
        base: ElementId,
    },
    Procedure {
        scope: ElementId,
        parameters: Vec<ElementId>,
        returns: Vec<ElementId>,
        is_foreign: bool,
        foreign_index: Option<usize>,
        instances: Vec<ElementId>,
    },
    /// Placeholder for a declaration whose type cannot be resolved yet;
    /// must be replaced before type checking completes.
    Unknown {
        type_name: String,
        is_array: bool,
        is_pointer: bool,
        array_size: usize,
    },
}

/// The payload of a `Type` element.
#[derive(Clone, Debug)]
pub struct TypeData {
    pub name: String,
    pub size_in_bytes: usize,
    pub variant: TypeVariant,
}

impl TypeData {
    pub fn new(
        name: impl Into<String>,
        size_in_bytes: usize,
        variant: TypeVariant,
    ) -> Self {
        Self {
            name: name.into(),
            size_in_bytes,
            variant,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.variant, TypeVariant::Unknown { .. })
    }

    pub fn is_procedure(&self) -> bool {
        matches!(self.variant, TypeVariant::Procedure { .. })
    }

    pub fn number_class(&self) -> Option<NumberClass> {
        match &self.variant {
            TypeVariant::Numeric { number_class, .. } => Some(*number_class),
            _ => None,
        }
    }

    /// How values of this type are accessed.
    pub fn access_model(&self) -> AccessModel {
        match &self.variant {
            TypeVariant::Composite { .. }
            | TypeVariant::Array { .. }
            | TypeVariant::String => AccessModel::Pointer,
            _ => AccessModel::Value,
        }
    }

    /// The natural alignment of values of this type.
    pub fn alignment(&self) -> usize {
        match &self.variant {
            TypeVariant::Numeric { .. } => self.size_in_bytes,
            TypeVariant::Bool => 1,
            _ => 8,
        }
    }

    /// Child elements owned through the type structure.
    pub fn owned_elements(&self) -> Vec<ElementId> {
        match &self.variant {
            TypeVariant::Composite { fields, .. } => fields.clone(),
            TypeVariant::Procedure {
                scope,
                parameters,
                returns,
                instances,
                ..
            } => {
                let mut owned = vec![*scope];
                owned.extend(parameters.iter().copied());
                owned.extend(returns.iter().copied());
                owned.extend(instances.iter().copied());
                owned
            }
            _ => Vec::new(),
        }
    }
}

/// Structural compatibility: may a value of `rhs` initialize or be
/// assigned to storage of `lhs`?
pub fn type_check(
    registry: &ElementRegistry,
    lhs: ElementId,
    rhs: ElementId,
) -> bool {
    if lhs == rhs {
        return true;
    }
    let lhs_type = match registry.type_data(lhs) {
        Some(type_data) => type_data,
        None => return false,
    };
    let rhs_type = match registry.type_data(rhs) {
        Some(type_data) => type_data,
        None => return false,
    };

    match (&lhs_type.variant, &rhs_type.variant) {
        (TypeVariant::Any, _) => true,
        (
            TypeVariant::Numeric {
                number_class: lhs_class,
                ..
            },
            TypeVariant::Numeric {
                number_class: rhs_class,
                ..
            },
        ) => lhs_class == rhs_class,
        (
            TypeVariant::Pointer { base: lhs_base },
            TypeVariant::Pointer { base: rhs_base },
        ) => type_check(registry, *lhs_base, *rhs_base),
        (
            TypeVariant::Array {
                entry: lhs_entry,
                size: lhs_size,
            },
            TypeVariant::Array {
                entry: rhs_entry,
                size: rhs_size,
            },
        ) => {
            lhs_size == rhs_size
                && type_check(registry, *lhs_entry, *rhs_entry)
        }
        (TypeVariant::Bool, TypeVariant::Bool) => true,
        (TypeVariant::String, TypeVariant::String) => true,
        _ => false,
    }
}
