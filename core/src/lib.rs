//! Core implementation of the Basecode bootstrap compiler. The main usage
//! of this crate is to compile and execute Basecode programs from source:
//! source files are parsed into a raw AST, elaborated into a graph of
//! typed program elements, emitted as instructions for the register-based
//! stack-machine VM (the "terp"), assembled into its heap, and executed.
//!
//! ```no_run
//! use basecode::compiler::{Session, SessionOptions};
//! use std::path::Path;
//!
//! let mut session = Session::new(SessionOptions::default());
//! session
//!     .add_source_file(Path::new("hello.bc"))
//!     .expect("source file");
//!
//! if session.compile() {
//!     session.run();
//! } else {
//!     for message in session.result().messages() {
//!         eprintln!("{}", message);
//!     }
//! }
//! ```

#![deny(clippy::all)]

pub mod ast;
pub mod compiler;
pub mod error;
mod id;
pub mod parse;
mod source;
mod util;
pub mod vm;

pub use error::{Diagnostic, SessionResult, Severity};
pub use id::{ElementId, IdPool, LabelRefId};
pub use source::{SourceFile, SourceLocation, SourcePosition};
