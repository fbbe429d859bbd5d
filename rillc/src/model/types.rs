//! Semantic types as seen by the effect passes.
//!
//! The type checker is an external collaborator; the effect passes only need
//! enough of each type to pick a storage representation for captured values
//! and a value kind at the host boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A resolved semantic type.
///
/// In JSON program models scalars are plain strings (`"i32"`) and compound
/// types are single-key objects (`{"array": "i64"}`, `{"record": "Point"}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemType {
    Unit,
    Bool,
    I32,
    I64,
    F32,
    F64,
    Str,
    Bytes,
    Array(Box<SemType>),
    /// A nominal record declared by the front end.
    Record(String),
    Function,
    Continuation,
    /// Statically unknown reference type.
    Any,
    /// Unsubstituted generic parameter.
    Param(String),
}

impl SemType {
    /// True if the type contains no generic parameter.
    pub fn is_concrete(&self) -> bool {
        match self {
            SemType::Param(_) => false,
            SemType::Array(elem) => elem.is_concrete(),
            _ => true,
        }
    }

    /// True for types stored as a reference.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            SemType::Str
                | SemType::Bytes
                | SemType::Array(_)
                | SemType::Record(_)
                | SemType::Function
                | SemType::Continuation
                | SemType::Any
                | SemType::Param(_)
        )
    }
}

impl fmt::Display for SemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemType::Unit => f.write_str("unit"),
            SemType::Bool => f.write_str("bool"),
            SemType::I32 => f.write_str("i32"),
            SemType::I64 => f.write_str("i64"),
            SemType::F32 => f.write_str("f32"),
            SemType::F64 => f.write_str("f64"),
            SemType::Str => f.write_str("str"),
            SemType::Bytes => f.write_str("bytes"),
            SemType::Array(elem) => write!(f, "[{}]", elem),
            SemType::Record(name) => f.write_str(name),
            SemType::Function => f.write_str("fn"),
            SemType::Continuation => f.write_str("cont"),
            SemType::Any => f.write_str("any"),
            SemType::Param(name) => write!(f, "'{}", name),
        }
    }
}
