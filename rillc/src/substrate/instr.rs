//! Structured instructions.
//!
//! Locals, functions, types and fields are referenced by name; the printer
//! and the verifier resolve them against the enclosing function and module.

use super::types::{HeapType, RefType, ValType};

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    LocalGet(String),
    LocalSet(String),
    LocalTee(String),

    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),

    I32Eq,
    I32Ne,
    I32And,
    I32Eqz,

    /// Allocate a struct from all of its fields on the stack.
    StructNew(String),
    StructGet { ty: String, field: String },
    StructSet { ty: String, field: String },

    /// Allocate an array from `len` elements on the stack.
    ArrayNewFixed { ty: String, len: u32 },
    ArrayGet(String),
    ArrayLen,

    RefNull(HeapType),
    RefIsNull,
    RefAsNonNull,
    RefCast(RefType),
    RefTest(RefType),
    RefFunc(String),

    Call(String),
    /// Call a typed function reference; the reference is on top of the stack.
    CallRef(String),

    Block {
        label: String,
        result: Option<ValType>,
        body: Vec<Instr>,
    },
    Loop {
        label: String,
        body: Vec<Instr>,
    },
    If {
        result: Option<ValType>,
        then: Vec<Instr>,
        otherwise: Vec<Instr>,
    },
    Br(String),
    BrIf(String),
    Return,
    Unreachable,
    Drop,
}

impl Instr {
    pub fn local_get(name: &str) -> Self {
        Instr::LocalGet(name.to_string())
    }

    pub fn local_set(name: &str) -> Self {
        Instr::LocalSet(name.to_string())
    }

    pub fn call(name: &str) -> Self {
        Instr::Call(name.to_string())
    }

    pub fn struct_get(ty: &str, field: &str) -> Self {
        Instr::StructGet {
            ty: ty.to_string(),
            field: field.to_string(),
        }
    }

    pub fn struct_set(ty: &str, field: &str) -> Self {
        Instr::StructSet {
            ty: ty.to_string(),
            field: field.to_string(),
        }
    }

    pub fn struct_new(ty: &str) -> Self {
        Instr::StructNew(ty.to_string())
    }

    pub fn ref_null(name: &str) -> Self {
        Instr::RefNull(HeapType::named(name))
    }

    /// Cast to a non-null reference to `name`.
    pub fn ref_cast(name: &str) -> Self {
        Instr::RefCast(RefType::non_null(HeapType::named(name)))
    }

    /// One-armed `if` without a result.
    pub fn when(then: Vec<Instr>) -> Self {
        Instr::If {
            result: None,
            then,
            otherwise: Vec::new(),
        }
    }

    /// Nested instruction lists, for walkers.
    pub fn children(&self) -> Vec<&[Instr]> {
        match self {
            Instr::Block { body, .. } | Instr::Loop { body, .. } => vec![body.as_slice()],
            Instr::If { then, otherwise, .. } => vec![then.as_slice(), otherwise.as_slice()],
            _ => Vec::new(),
        }
    }
}
