//! Value and type definitions of the GC stack-machine target.

use std::fmt;

/// A heap type referenced by a reference type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeapType {
    Any,
    Eq,
    Func,
    Struct,
    /// A named type definition of the module.
    Named(String),
}

impl HeapType {
    pub fn named(name: impl Into<String>) -> Self {
        HeapType::Named(name.into())
    }
}

impl fmt::Display for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapType::Any => f.write_str("any"),
            HeapType::Eq => f.write_str("eq"),
            HeapType::Func => f.write_str("func"),
            HeapType::Struct => f.write_str("struct"),
            HeapType::Named(name) => write!(f, "${}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefType {
    pub nullable: bool,
    pub heap: HeapType,
}

impl RefType {
    pub fn nullable(heap: HeapType) -> Self {
        Self { nullable: true, heap }
    }

    pub fn non_null(heap: HeapType) -> Self {
        Self { nullable: false, heap }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "(ref null {})", self.heap)
        } else {
            write!(f, "(ref {})", self.heap)
        }
    }
}

/// A value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    Ref(RefType),
}

impl ValType {
    pub fn anyref() -> Self {
        ValType::Ref(RefType::nullable(HeapType::Any))
    }

    pub fn funcref() -> Self {
        ValType::Ref(RefType::nullable(HeapType::Func))
    }

    /// `(ref null $name)`
    pub fn ref_null(name: &str) -> Self {
        ValType::Ref(RefType::nullable(HeapType::named(name)))
    }

    /// `(ref $name)`
    pub fn ref_to(name: &str) -> Self {
        ValType::Ref(RefType::non_null(HeapType::named(name)))
    }

    /// Named type this value type points at, if any.
    pub fn named_heap(&self) -> Option<&str> {
        match self {
            ValType::Ref(RefType {
                heap: HeapType::Named(name),
                ..
            }) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
            ValType::Ref(r) => write!(f, "{}", r),
        }
    }
}

/// A struct field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldType {
    pub name: String,
    pub ty: ValType,
    pub mutable: bool,
}

impl FieldType {
    pub fn new(name: impl Into<String>, ty: ValType) -> Self {
        Self {
            name: name.into(),
            ty,
            mutable: false,
        }
    }

    pub fn mutable(name: impl Into<String>, ty: ValType) -> Self {
        Self {
            mutable: true,
            ..Self::new(name, ty)
        }
    }
}

/// A named type definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDef {
    Struct {
        name: String,
        fields: Vec<FieldType>,
        supertype: Option<String>,
        /// Final types cannot be extended.
        is_final: bool,
    },
    Array {
        name: String,
        elem: ValType,
        mutable: bool,
    },
    Func {
        name: String,
        params: Vec<ValType>,
        results: Vec<ValType>,
    },
}

impl TypeDef {
    pub fn name(&self) -> &str {
        match self {
            TypeDef::Struct { name, .. } | TypeDef::Array { name, .. } | TypeDef::Func { name, .. } => name,
        }
    }

    /// Struct field by name, with its index.
    pub fn field(&self, field: &str) -> Option<(usize, &FieldType)> {
        match self {
            TypeDef::Struct { fields, .. } => fields.iter().enumerate().find(|(_, f)| f.name == field),
            _ => None,
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, TypeDef::Struct { .. })
    }

    pub fn is_func(&self) -> bool {
        matches!(self, TypeDef::Func { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, TypeDef::Array { .. })
    }
}

/// Types declared together; recursive groups may refer to each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeGroup {
    pub recursive: bool,
    pub defs: Vec<TypeDef>,
}

impl TypeGroup {
    pub fn rec(defs: Vec<TypeDef>) -> Self {
        Self { recursive: true, defs }
    }

    pub fn single(def: TypeDef) -> Self {
        Self {
            recursive: false,
            defs: vec![def],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_type_text() {
        assert_eq!(ValType::ref_null("rill.HandlerFrame").to_string(), "(ref null $rill.HandlerFrame)");
        assert_eq!(ValType::ref_to("rill.Outcome").to_string(), "(ref $rill.Outcome)");
        assert_eq!(ValType::anyref().to_string(), "(ref null any)");
    }

    #[test]
    fn test_field_lookup() {
        let def = TypeDef::Struct {
            name: "P".into(),
            fields: vec![FieldType::new("x", ValType::I32), FieldType::mutable("y", ValType::I64)],
            supertype: None,
            is_final: true,
        };
        let (index, field) = def.field("y").unwrap();
        assert_eq!(index, 1);
        assert!(field.mutable);
        assert!(def.field("z").is_none());
    }
}
