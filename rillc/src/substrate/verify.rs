//! Structural verifier.
//!
//! Checks that every name an emitted module uses resolves: types, fields,
//! functions, locals and branch labels. Subtypes must extend a non-final
//! struct and repeat its fields as a prefix. Stack typing is left to the
//! target's own validator.

use std::fmt;

use rustc_hash::FxHashSet;
use thiserror::Error;

use super::instr::Instr;
use super::module::{Function, Module};
use super::types::{HeapType, RefType, TypeDef, ValType};

/// A module that failed verification, with every problem found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("module `{module}` failed verification:\n{}", render_issues(.issues))]
pub struct VerifyError {
    pub module: String,
    pub issues: Vec<Issue>,
}

fn render_issues(issues: &[Issue]) -> String {
    issues.iter().map(|i| format!("  {}", i)).collect::<Vec<_>>().join("\n")
}

/// One verification problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// Function the problem was found in, if any.
    pub function: Option<String>,
    pub message: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(func) => write!(f, "in ${}: {}", func, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Verify a module.
pub fn verify(module: &Module) -> Result<(), VerifyError> {
    let mut v = Verifier {
        module,
        issues: Vec::new(),
        function: None,
    };
    v.check_types();
    v.check_imports();
    for function in module.functions() {
        v.check_function(function);
    }
    for export in module.exports() {
        if !module.has_function(&export.func) {
            v.issue(format!("export `{}` names unknown function ${}", export.name, export.func));
        }
    }

    if v.issues.is_empty() {
        Ok(())
    } else {
        Err(VerifyError {
            module: module.name().to_string(),
            issues: v.issues,
        })
    }
}

struct Verifier<'a> {
    module: &'a Module,
    issues: Vec<Issue>,
    function: Option<String>,
}

impl<'a> Verifier<'a> {
    fn issue(&mut self, message: String) {
        self.issues.push(Issue {
            function: self.function.clone(),
            message,
        });
    }

    fn check_types(&mut self) {
        let mut seen = FxHashSet::default();
        for def in self.module.type_defs() {
            if !seen.insert(def.name()) {
                self.issue(format!("type ${} declared twice", def.name()));
            }
            match def {
                TypeDef::Struct {
                    name,
                    fields,
                    supertype,
                    ..
                } => {
                    for field in fields {
                        self.check_valtype(&field.ty);
                    }
                    if let Some(sup) = supertype {
                        self.check_subtype(name, fields, sup);
                    }
                }
                TypeDef::Array { elem, .. } => self.check_valtype(elem),
                TypeDef::Func { params, results, .. } => {
                    for ty in params.iter().chain(results) {
                        self.check_valtype(ty);
                    }
                }
            }
        }
    }

    fn check_subtype(&mut self, name: &str, fields: &[super::types::FieldType], sup: &str) {
        match self.module.type_def(sup) {
            Some(TypeDef::Struct {
                fields: parent_fields,
                is_final,
                ..
            }) => {
                if *is_final {
                    self.issue(format!("${} extends final type ${}", name, sup));
                }
                let prefix_ok =
                    parent_fields.len() <= fields.len() && parent_fields.iter().zip(fields).all(|(p, c)| p == c);
                if !prefix_ok {
                    self.issue(format!("${} does not start with the fields of ${}", name, sup));
                }
            }
            Some(_) => self.issue(format!("${} extends non-struct type ${}", name, sup)),
            None => self.issue(format!("${} extends unknown type ${}", name, sup)),
        }
    }

    fn check_imports(&mut self) {
        for import in self.module.imports() {
            for ty in import.params.iter().chain(&import.results) {
                self.check_valtype(ty);
            }
        }
    }

    fn check_valtype(&mut self, ty: &ValType) {
        if let ValType::Ref(r) = ty {
            self.check_reftype(r);
        }
    }

    fn check_reftype(&mut self, r: &RefType) {
        self.check_heap(&r.heap);
    }

    fn check_heap(&mut self, heap: &HeapType) {
        if let HeapType::Named(name) = heap {
            if self.module.type_def(name).is_none() {
                self.issue(format!("unknown type ${}", name));
            }
        }
    }

    fn check_function(&mut self, function: &Function) {
        self.function = Some(function.name.clone());

        let mut names = FxHashSet::default();
        for local in function.params.iter().chain(&function.locals) {
            if !names.insert(local.name.as_str()) {
                self.issue(format!("local ${} declared twice", local.name));
            }
            self.check_valtype(&local.ty);
        }
        for ty in &function.results {
            self.check_valtype(ty);
        }

        let mut labels = Vec::new();
        self.check_body(function, &function.body, &mut labels);
        self.function = None;
    }

    fn check_body(&mut self, function: &Function, body: &[Instr], labels: &mut Vec<String>) {
        for instr in body {
            match instr {
                Instr::LocalGet(n) | Instr::LocalSet(n) | Instr::LocalTee(n) => {
                    if function.local(n).is_none() {
                        self.issue(format!("unknown local ${}", n));
                    }
                }
                Instr::StructNew(ty) => {
                    self.expect_kind(ty, TypeDef::is_struct, "struct");
                }
                Instr::StructGet { ty, field } => self.check_field(ty, field, false),
                Instr::StructSet { ty, field } => self.check_field(ty, field, true),
                Instr::ArrayNewFixed { ty, .. } | Instr::ArrayGet(ty) => {
                    self.expect_kind(ty, TypeDef::is_array, "array");
                }
                Instr::CallRef(ty) => {
                    self.expect_kind(ty, TypeDef::is_func, "function");
                }
                Instr::RefNull(heap) => self.check_heap(heap),
                Instr::RefCast(r) | Instr::RefTest(r) => self.check_reftype(r),
                Instr::RefFunc(n) | Instr::Call(n) => {
                    if !self.module.has_function(n) {
                        self.issue(format!("unknown function ${}", n));
                    }
                }
                Instr::Br(l) | Instr::BrIf(l) => {
                    if !labels.iter().any(|x| x == l) {
                        self.issue(format!("branch to unknown label ${}", l));
                    }
                }
                Instr::Block { label, result, body } => {
                    if let Some(ty) = result {
                        self.check_valtype(ty);
                    }
                    labels.push(label.clone());
                    self.check_body(function, body, labels);
                    labels.pop();
                }
                Instr::Loop { label, body } => {
                    labels.push(label.clone());
                    self.check_body(function, body, labels);
                    labels.pop();
                }
                Instr::If {
                    result,
                    then,
                    otherwise,
                } => {
                    if let Some(ty) = result {
                        self.check_valtype(ty);
                    }
                    self.check_body(function, then, labels);
                    self.check_body(function, otherwise, labels);
                }
                _ => {}
            }
        }
    }

    fn expect_kind(&mut self, ty: &str, pred: fn(&TypeDef) -> bool, what: &str) -> bool {
        match self.module.type_def(ty) {
            Some(def) if pred(def) => true,
            Some(_) => {
                self.issue(format!("${} is not a {} type", ty, what));
                false
            }
            None => {
                self.issue(format!("unknown type ${}", ty));
                false
            }
        }
    }

    fn check_field(&mut self, ty: &str, field: &str, write: bool) {
        if !self.expect_kind(ty, TypeDef::is_struct, "struct") {
            return;
        }
        match self.module.type_def(ty).and_then(|def| def.field(field)) {
            Some((_, f)) if write && !f.mutable => {
                self.issue(format!("field ${}.${} is immutable", ty, field));
            }
            Some(_) => {}
            None => self.issue(format!("type ${} has no field ${}", ty, field)),
        }
    }
}
