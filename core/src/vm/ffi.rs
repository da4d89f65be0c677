//! Foreign-function bridge. Shared libraries are opened with `libloading`
//! and cached per path; call construction goes through `libffi`, pushing
//! each argument per its declared type and returning the result as a raw
//! 64-bit value the VM can push.

use crate::error::SessionResult;
use crate::source::SourceLocation;
use libffi::middle::{Arg, Cif, CodePtr, Type};
use std::collections::HashMap;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};

/// C calling conventions the bridge understands. Ellipsis variants are
/// carried through signatures but currently dispatched like the default
/// convention.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CallingMode {
    CDefault,
    CEllipsis,
    CEllipsisVarArgs,
}

/// The C type of one foreign value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FfiType {
    Void,
    Bool,
    Char,
    Short,
    Int,
    Long,
    LongLong,
    Float,
    Double,
    Pointer,
    Struct,
}

/// A named, typed slot in a foreign signature. Struct values carry their
/// field layout.
#[derive(Clone, Debug)]
pub struct FfiValue {
    pub name: String,
    pub value_type: FfiType,
    pub fields: Vec<FfiValue>,
}

impl FfiValue {
    pub fn new(name: impl Into<String>, value_type: FfiType) -> Self {
        Self {
            name: name.into(),
            value_type,
            fields: Vec::new(),
        }
    }

    pub fn void() -> Self {
        Self::new("", FfiType::Void)
    }

    fn libffi_type(&self) -> Type {
        match self.value_type {
            FfiType::Void => Type::void(),
            FfiType::Bool => Type::u8(),
            FfiType::Char => Type::i8(),
            FfiType::Short => Type::i16(),
            FfiType::Int => Type::i32(),
            FfiType::Long | FfiType::LongLong => Type::i64(),
            FfiType::Float => Type::f32(),
            FfiType::Double => Type::f64(),
            FfiType::Pointer => Type::pointer(),
            FfiType::Struct => Type::structure(
                self.fields.iter().map(FfiValue::libffi_type),
            ),
        }
    }
}

/// One dynamically loaded library plus its cached symbol addresses.
#[derive(Debug)]
pub struct SharedLibrary {
    path: PathBuf,
    library: libloading::Library,
    symbols: HashMap<String, u64>,
}

impl SharedLibrary {
    /// Open the library at `path`. Failure is reported as `B062` with the
    /// attempted path.
    pub fn load(result: &mut SessionResult, path: &Path) -> Option<Self> {
        match unsafe { libloading::Library::new(path) } {
            Ok(library) => Some(Self {
                path: path.to_path_buf(),
                library,
                symbols: HashMap::new(),
            }),
            Err(error) => {
                result.error(
                    "B062",
                    format!(
                        "unable to load library image file: {} ({})",
                        path.display(),
                        error,
                    ),
                    SourceLocation::default(),
                );
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up (and cache) the address of an exported symbol.
    pub fn symbol_address(&mut self, symbol_name: &str) -> Option<u64> {
        if let Some(address) = self.symbols.get(symbol_name) {
            return Some(*address);
        }
        let symbol: libloading::Symbol<unsafe extern "C" fn()> =
            unsafe { self.library.get(symbol_name.as_bytes()).ok()? };
        let address = *symbol as usize as u64;
        self.symbols.insert(symbol_name.to_string(), address);
        Some(address)
    }

    pub fn exports_symbol(&mut self, symbol_name: &str) -> bool {
        self.symbol_address(symbol_name).is_some()
    }
}

/// A fully resolved foreign function: where it lives and how to call it.
#[derive(Clone, Debug)]
pub struct ForeignFunction {
    pub symbol: String,
    pub library_path: PathBuf,
    pub address: u64,
    pub return_value: FfiValue,
    pub arguments: Vec<FfiValue>,
    pub calling_mode: CallingMode,
}

/// Owned storage for one marshalled argument; the [Arg] handed to libffi
/// borrows from this.
enum RawArg {
    U8(u8),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(*mut c_void),
}

impl RawArg {
    /// Convert a raw stack value per its declared type, the way the
    /// original bridge cast each popped value.
    fn from_stack_value(value_type: FfiType, value: u64) -> Self {
        match value_type {
            FfiType::Bool => Self::U8((value != 0) as u8),
            FfiType::Char => Self::I8(value as i8),
            FfiType::Short => Self::I16(value as i16),
            FfiType::Int => Self::I32(value as i32),
            FfiType::Long | FfiType::LongLong => Self::I64(value as i64),
            FfiType::Float => Self::F32(value as f32),
            FfiType::Double => Self::F64(value as f64),
            // structs are passed by address
            FfiType::Void | FfiType::Pointer | FfiType::Struct => {
                Self::Pointer(value as *mut c_void)
            }
        }
    }

    fn as_arg(&self) -> Arg {
        match self {
            Self::U8(value) => Arg::new(value),
            Self::I8(value) => Arg::new(value),
            Self::I16(value) => Arg::new(value),
            Self::I32(value) => Arg::new(value),
            Self::I64(value) => Arg::new(value),
            Self::F32(value) => Arg::new(value),
            Self::F64(value) => Arg::new(value),
            Self::Pointer(value) => Arg::new(value),
        }
    }
}

impl ForeignFunction {
    /// Invoke the function with raw stack values, one per declared
    /// argument. The return value is widened to a raw 64-bit value, or 0
    /// for void returns.
    pub fn call(&self, stack_values: &[u64]) -> u64 {
        let arg_types: Vec<Type> = self
            .arguments
            .iter()
            .map(FfiValue::libffi_type)
            .collect();
        let return_type = match self.return_value.value_type {
            // struct returns come back by address
            FfiType::Struct => Type::pointer(),
            _ => self.return_value.libffi_type(),
        };
        let cif = Cif::new(arg_types.into_iter(), return_type);

        let raw_args: Vec<RawArg> = self
            .arguments
            .iter()
            .zip(stack_values.iter())
            .map(|(argument, value)| {
                RawArg::from_stack_value(argument.value_type, *value)
            })
            .collect();
        let args: Vec<Arg> = raw_args.iter().map(RawArg::as_arg).collect();

        let code = CodePtr(self.address as *mut c_void);
        unsafe {
            match self.return_value.value_type {
                FfiType::Void => {
                    cif.call::<()>(code, &args);
                    0
                }
                FfiType::Bool => u64::from(cif.call::<u8>(code, &args) != 0),
                FfiType::Char => cif.call::<i8>(code, &args) as u64,
                FfiType::Short => cif.call::<i16>(code, &args) as u64,
                FfiType::Int => cif.call::<i32>(code, &args) as u64,
                FfiType::Long | FfiType::LongLong => {
                    cif.call::<i64>(code, &args) as u64
                }
                FfiType::Float => cif.call::<f32>(code, &args) as u64,
                FfiType::Double => cif.call::<f64>(code, &args) as u64,
                FfiType::Pointer | FfiType::Struct => {
                    cif.call::<*mut c_void>(code, &args) as u64
                }
            }
        }
    }
}
