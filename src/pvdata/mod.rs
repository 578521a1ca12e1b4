//! Structured process values
//!
//! Provides:
//! - Type descriptors (`Field`, `Structure`) and their wire encoding
//! - Structured values (`PvStructure`) addressed by pre-order field offsets
//! - Dirty-field masks (`BitSet`) and differential (masked) serialization
//! - The per-connection type cache (`IntrospectionRegistry`)
//! - Request-selected views of a value (`PvCopy`)

mod bitset;
mod copy;
mod field;
mod registry;
mod serialize;
mod value;

pub use bitset::*;
pub use copy::*;
pub use field::*;
pub use registry::*;
pub use serialize::*;
pub use value::*;

use thiserror::Error;

/// Errors from building or editing structured values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PvDataError {
    #[error("No such field: {0}")]
    NoSuchField(String),

    #[error("Type mismatch for '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("Structure mismatch: expected '{expected}', found '{found}'")]
    StructureMismatch { expected: String, found: String },

    #[error("Cannot parse '{text}' as {scalar_type}")]
    Parse { text: String, scalar_type: String },
}

pub type PvDataResult<T> = Result<T, PvDataError>;
