//! Modules, function builders and the text printer.

use std::fmt::{self, Write as _};

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::instr::Instr;
use super::types::{HeapType, TypeDef, TypeGroup, ValType};

/// Errors raised while assembling a module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error("type `{name}` is already declared with a different definition")]
    TypeConflict { name: String },

    #[error("function `{name}` is already defined")]
    DuplicateFunction { name: String },

    #[error("import `{name}` is already declared with a different signature")]
    ImportConflict { name: String },

    #[error("export `{name}` is already defined")]
    DuplicateExport { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    pub name: String,
    pub ty: ValType,
}

/// An imported function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub field: String,
    /// Local name the module calls it by.
    pub name: String,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Local>,
    pub results: Vec<ValType>,
    pub locals: Vec<Local>,
    pub body: Vec<Instr>,
}

impl Function {
    /// Parameter or local by name.
    pub fn local(&self, name: &str) -> Option<&Local> {
        self.params.iter().chain(self.locals.iter()).find(|l| l.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub func: String,
}

/// Opaque bytes attached to the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSection {
    pub name: String,
    /// Identifier hosts use to find the section.
    pub export: Option<String>,
    pub bytes: Vec<u8>,
}

/// A module of the target.
#[derive(Debug, Clone, Default)]
pub struct Module {
    name: String,
    groups: Vec<TypeGroup>,
    type_index: FxHashMap<String, (usize, usize)>,
    imports: Vec<Import>,
    functions: Vec<Function>,
    exports: Vec<Export>,
    customs: Vec<CustomSection>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a group of types.
    ///
    /// Re-declaring an identical group is a no-op and returns `false`.
    pub fn declare_group(&mut self, group: TypeGroup) -> Result<bool, ModuleError> {
        let mut existing = 0;
        for def in &group.defs {
            if let Some(found) = self.type_def(def.name()) {
                if found != def {
                    return Err(ModuleError::TypeConflict {
                        name: def.name().to_string(),
                    });
                }
                existing += 1;
            }
        }
        if existing == group.defs.len() {
            return Ok(false);
        }
        if existing > 0 {
            // Part of the group is already present under another grouping.
            let name = group
                .defs
                .iter()
                .find(|d| self.type_index.contains_key(d.name()))
                .map(|d| d.name().to_string())
                .unwrap_or_default();
            return Err(ModuleError::TypeConflict { name });
        }

        let group_index = self.groups.len();
        for (i, def) in group.defs.iter().enumerate() {
            self.type_index.insert(def.name().to_string(), (group_index, i));
        }
        self.groups.push(group);
        Ok(true)
    }

    pub fn declare_type(&mut self, def: TypeDef) -> Result<bool, ModuleError> {
        self.declare_group(TypeGroup::single(def))
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        let (group, index) = *self.type_index.get(name)?;
        self.groups.get(group)?.defs.get(index)
    }

    pub fn groups(&self) -> &[TypeGroup] {
        &self.groups
    }

    pub fn type_defs(&self) -> impl Iterator<Item = &TypeDef> {
        self.groups.iter().flat_map(|g| g.defs.iter())
    }

    /// Declare an imported function. Identical re-imports are no-ops.
    pub fn import_func(
        &mut self,
        module: &str,
        field: &str,
        name: &str,
        params: Vec<ValType>,
        results: Vec<ValType>,
    ) -> Result<(), ModuleError> {
        let import = Import {
            module: module.to_string(),
            field: field.to_string(),
            name: name.to_string(),
            params,
            results,
        };
        if let Some(existing) = self.imports.iter().find(|i| i.name == name) {
            if *existing == import {
                return Ok(());
            }
            return Err(ModuleError::ImportConflict { name: name.to_string() });
        }
        if self.functions.iter().any(|f| f.name == name) {
            return Err(ModuleError::DuplicateFunction { name: name.to_string() });
        }
        self.imports.push(import);
        Ok(())
    }

    pub fn add_function(&mut self, function: Function) -> Result<(), ModuleError> {
        if self.has_function(&function.name) {
            return Err(ModuleError::DuplicateFunction { name: function.name });
        }
        self.functions.push(function);
        Ok(())
    }

    pub fn export(&mut self, name: &str, func: &str) -> Result<(), ModuleError> {
        if self.exports.iter().any(|e| e.name == name) {
            return Err(ModuleError::DuplicateExport { name: name.to_string() });
        }
        self.exports.push(Export {
            name: name.to_string(),
            func: func.to_string(),
        });
        Ok(())
    }

    /// Attach a custom section, replacing one of the same name.
    pub fn set_custom(&mut self, section: CustomSection) {
        self.customs.retain(|c| c.name != section.name);
        self.customs.push(section);
    }

    /// Defined or imported function.
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.name == name) || self.imports.iter().any(|i| i.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn import(&self, name: &str) -> Option<&Import> {
        self.imports.iter().find(|i| i.name == name)
    }

    /// Parameter and result types of a defined or imported function.
    pub fn signature(&self, name: &str) -> Option<(Vec<ValType>, Vec<ValType>)> {
        if let Some(f) = self.function(name) {
            return Some((f.params.iter().map(|p| p.ty.clone()).collect(), f.results.clone()));
        }
        self.import(name).map(|i| (i.params.clone(), i.results.clone()))
    }

    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn customs(&self) -> &[CustomSection] {
        &self.customs
    }

    pub fn custom(&self, name: &str) -> Option<&CustomSection> {
        self.customs.iter().find(|c| c.name == name)
    }
}

/// Incrementally builds a [`Function`].
#[derive(Debug)]
pub struct FunctionBuilder {
    function: Function,
    fresh: u32,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            function: Function {
                name: name.into(),
                params: Vec::new(),
                results: Vec::new(),
                locals: Vec::new(),
                body: Vec::new(),
            },
            fresh: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn param(&mut self, name: &str, ty: ValType) -> &mut Self {
        self.function.params.push(Local {
            name: name.to_string(),
            ty,
        });
        self
    }

    pub fn result(&mut self, ty: ValType) -> &mut Self {
        self.function.results.push(ty);
        self
    }

    /// Declare a local unless one of that name already exists.
    pub fn local(&mut self, name: &str, ty: ValType) -> &mut Self {
        if self.function.local(name).is_none() {
            self.function.locals.push(Local {
                name: name.to_string(),
                ty,
            });
        }
        self
    }

    /// Declare a fresh local named after `prefix`.
    pub fn fresh_local(&mut self, prefix: &str, ty: ValType) -> String {
        let name = format!("{}.{}", prefix, self.fresh);
        self.fresh += 1;
        self.local(&name, ty);
        name
    }

    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        self.function.body.push(instr);
        self
    }

    pub fn extend(&mut self, instrs: impl IntoIterator<Item = Instr>) -> &mut Self {
        self.function.body.extend(instrs);
        self
    }

    pub fn finish(self) -> Function {
        self.function
    }
}

// ============================================================
// Text printer
// ============================================================

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "(module ${}", self.name)?;
        for group in &self.groups {
            if group.recursive {
                writeln!(f, "  (rec")?;
                for def in &group.defs {
                    writeln!(f, "    {}", TypeText(def))?;
                }
                writeln!(f, "  )")?;
            } else {
                for def in &group.defs {
                    writeln!(f, "  {}", TypeText(def))?;
                }
            }
        }
        for import in &self.imports {
            writeln!(
                f,
                "  (import \"{}\" \"{}\" (func ${}{}))",
                import.module,
                import.field,
                import.name,
                signature_text(&import.params, &import.results)
            )?;
        }
        for function in &self.functions {
            write_function(f, function)?;
        }
        for export in &self.exports {
            writeln!(f, "  (export \"{}\" (func ${}))", export.name, export.func)?;
        }
        for custom in &self.customs {
            if let Some(export) = &custom.export {
                writeln!(f, "  ;; export \"{}\" = custom section \"{}\"", export, custom.name)?;
            }
            writeln!(f, "  (@custom \"{}\" \"{}\")", custom.name, escape_bytes(&custom.bytes))?;
        }
        writeln!(f, ")")
    }
}

struct TypeText<'a>(&'a TypeDef);

impl fmt::Display for TypeText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            TypeDef::Struct {
                name,
                fields,
                supertype,
                is_final,
            } => {
                let mut body = String::from("(struct");
                for field in fields {
                    if field.mutable {
                        let _ = write!(body, " (field ${} (mut {}))", field.name, field.ty);
                    } else {
                        let _ = write!(body, " (field ${} {})", field.name, field.ty);
                    }
                }
                body.push(')');
                match (supertype, is_final) {
                    (None, true) => write!(f, "(type ${} {})", name, body),
                    (None, false) => write!(f, "(type ${} (sub {}))", name, body),
                    (Some(sup), true) => write!(f, "(type ${} (sub final ${} {}))", name, sup, body),
                    (Some(sup), false) => write!(f, "(type ${} (sub ${} {}))", name, sup, body),
                }
            }
            TypeDef::Array { name, elem, mutable } => {
                if *mutable {
                    write!(f, "(type ${} (array (mut {})))", name, elem)
                } else {
                    write!(f, "(type ${} (array {}))", name, elem)
                }
            }
            TypeDef::Func { name, params, results } => {
                write!(f, "(type ${} (func{}))", name, signature_text(params, results))
            }
        }
    }
}

fn signature_text(params: &[ValType], results: &[ValType]) -> String {
    let mut out = String::new();
    for p in params {
        let _ = write!(out, " (param {})", p);
    }
    for r in results {
        let _ = write!(out, " (result {})", r);
    }
    out
}

fn write_function(f: &mut fmt::Formatter<'_>, function: &Function) -> fmt::Result {
    write!(f, "  (func ${}", function.name)?;
    for p in &function.params {
        write!(f, " (param ${} {})", p.name, p.ty)?;
    }
    for r in &function.results {
        write!(f, " (result {})", r)?;
    }
    writeln!(f)?;
    for l in &function.locals {
        writeln!(f, "    (local ${} {})", l.name, l.ty)?;
    }
    write_instrs(f, &function.body, 2)?;
    writeln!(f, "  )")
}

fn write_instrs(f: &mut fmt::Formatter<'_>, instrs: &[Instr], depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    for instr in instrs {
        match instr {
            Instr::Block { label, result, body } => {
                writeln!(f, "{}block ${}{}", pad, label, result_text(result))?;
                write_instrs(f, body, depth + 1)?;
                writeln!(f, "{}end", pad)?;
            }
            Instr::Loop { label, body } => {
                writeln!(f, "{}loop ${}", pad, label)?;
                write_instrs(f, body, depth + 1)?;
                writeln!(f, "{}end", pad)?;
            }
            Instr::If {
                result,
                then,
                otherwise,
            } => {
                writeln!(f, "{}if{}", pad, result_text(result))?;
                write_instrs(f, then, depth + 1)?;
                if !otherwise.is_empty() {
                    writeln!(f, "{}else", pad)?;
                    write_instrs(f, otherwise, depth + 1)?;
                }
                writeln!(f, "{}end", pad)?;
            }
            other => writeln!(f, "{}{}", pad, flat_text(other))?,
        }
    }
    Ok(())
}

fn result_text(result: &Option<ValType>) -> String {
    match result {
        Some(ty) => format!(" (result {})", ty),
        None => String::new(),
    }
}

fn flat_text(instr: &Instr) -> String {
    match instr {
        Instr::LocalGet(n) => format!("local.get ${}", n),
        Instr::LocalSet(n) => format!("local.set ${}", n),
        Instr::LocalTee(n) => format!("local.tee ${}", n),
        Instr::I32Const(v) => format!("i32.const {}", v),
        Instr::I64Const(v) => format!("i64.const {}", v),
        Instr::F32Const(v) => format!("f32.const {}", v),
        Instr::F64Const(v) => format!("f64.const {}", v),
        Instr::I32Eq => "i32.eq".to_string(),
        Instr::I32Ne => "i32.ne".to_string(),
        Instr::I32And => "i32.and".to_string(),
        Instr::I32Eqz => "i32.eqz".to_string(),
        Instr::StructNew(ty) => format!("struct.new ${}", ty),
        Instr::StructGet { ty, field } => format!("struct.get ${} ${}", ty, field),
        Instr::StructSet { ty, field } => format!("struct.set ${} ${}", ty, field),
        Instr::ArrayNewFixed { ty, len } => format!("array.new_fixed ${} {}", ty, len),
        Instr::ArrayGet(ty) => format!("array.get ${}", ty),
        Instr::ArrayLen => "array.len".to_string(),
        Instr::RefNull(HeapType::Named(n)) => format!("ref.null ${}", n),
        Instr::RefNull(heap) => format!("ref.null {}", heap),
        Instr::RefIsNull => "ref.is_null".to_string(),
        Instr::RefAsNonNull => "ref.as_non_null".to_string(),
        Instr::RefCast(ty) => format!("ref.cast {}", ty),
        Instr::RefTest(ty) => format!("ref.test {}", ty),
        Instr::RefFunc(n) => format!("ref.func ${}", n),
        Instr::Call(n) => format!("call ${}", n),
        Instr::CallRef(ty) => format!("call_ref ${}", ty),
        Instr::Br(l) => format!("br ${}", l),
        Instr::BrIf(l) => format!("br_if ${}", l),
        Instr::Return => "return".to_string(),
        Instr::Unreachable => "unreachable".to_string(),
        Instr::Drop => "drop".to_string(),
        Instr::Block { .. } | Instr::Loop { .. } | Instr::If { .. } => String::new(),
    }
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        let _ = write!(out, "\\{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::types::FieldType;

    fn point() -> TypeDef {
        TypeDef::Struct {
            name: "Point".into(),
            fields: vec![FieldType::new("x", ValType::I32)],
            supertype: None,
            is_final: true,
        }
    }

    #[test]
    fn test_redeclaring_identical_type_is_noop() {
        let mut module = Module::new("m");
        assert!(module.declare_type(point()).unwrap());
        assert!(!module.declare_type(point()).unwrap());
        assert_eq!(module.groups().len(), 1);
    }

    #[test]
    fn test_conflicting_type_is_rejected() {
        let mut module = Module::new("m");
        module.declare_type(point()).unwrap();
        let other = TypeDef::Struct {
            name: "Point".into(),
            fields: vec![FieldType::new("y", ValType::I64)],
            supertype: None,
            is_final: true,
        };
        assert_eq!(
            module.declare_type(other),
            Err(ModuleError::TypeConflict { name: "Point".into() })
        );
    }

    #[test]
    fn test_duplicate_function() {
        let mut module = Module::new("m");
        module.add_function(FunctionBuilder::new("f").finish()).unwrap();
        assert!(module.add_function(FunctionBuilder::new("f").finish()).is_err());
        assert!(module.import_func("env", "f", "f", vec![], vec![]).is_err());
    }

    #[test]
    fn test_printer_output() {
        let mut module = Module::new("m");
        module.declare_type(point()).unwrap();
        let mut f = FunctionBuilder::new("one");
        f.result(ValType::I32);
        f.emit(Instr::I32Const(1));
        module.add_function(f.finish()).unwrap();
        module.export("one", "one").unwrap();
        module.set_custom(CustomSection {
            name: "meta".into(),
            export: None,
            bytes: vec![0, 255],
        });

        let text = module.to_string();
        assert!(text.contains("(type $Point (struct (field $x i32)))"));
        assert!(text.contains("(func $one (result i32)"));
        assert!(text.contains("i32.const 1"));
        assert!(text.contains("(export \"one\" (func $one))"));
        assert!(text.contains("\\00\\ff"));
    }

    #[test]
    fn test_fresh_locals_are_unique() {
        let mut f = FunctionBuilder::new("f");
        let a = f.fresh_local("tmp", ValType::I32);
        let b = f.fresh_local("tmp", ValType::I32);
        assert_ne!(a, b);
        assert_eq!(f.finish().locals.len(), 2);
    }
}
