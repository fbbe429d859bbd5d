//! The typed program model consumed by the effect passes.
//!
//! Parsing, name binding and type inference happen upstream. What reaches
//! this crate is a flat, fully resolved view of one module: its effect and
//! operation declarations, its functions with their effect rows, and every
//! call, perform and handler expression with enough context to build a
//! continuation site.
//!
//! [`ProgramModel`] is the serde form of that view and is what the CLI reads
//! from JSON. Front ends embedding the compiler can implement
//! [`TypedProgram`] over their own data instead.

use serde::{Deserialize, Serialize};

use rill_runtime::ResumeKind;

use super::ids::{DefId, ExprId};
use super::row::EffectRow;
use super::types::SemType;
use crate::span::Span;

/// Read-only access to a type-checked module.
pub trait TypedProgram {
    /// Module name, used as the prefix of every emitted symbol.
    fn module_name(&self) -> &str;

    fn effects(&self) -> &[EffectDecl];

    /// Operations in declaration order.
    fn operations(&self) -> &[OperationDecl];

    fn functions(&self) -> &[FunctionDecl];

    fn calls(&self) -> &[CallExpr];

    fn performs(&self) -> &[PerformExpr];

    fn handlers(&self) -> &[HandlerExpr];

    /// Row assumed where the checker supplied none.
    fn default_row(&self) -> EffectRow {
        EffectRow::pure()
    }
}

/// An effect declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectDecl {
    pub def: DefId,
    /// Stable external identifier, e.g. `rill.time`.
    pub name: String,
    /// Source-level name, e.g. `Time`.
    pub label: String,
    /// Serviceable by a host capability.
    #[serde(default)]
    pub host: bool,
    #[serde(default)]
    pub span: Span,
}

/// An operation declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDecl {
    pub def: DefId,
    pub name: String,
    /// Effect whose body lexically contains the declaration.
    #[serde(default)]
    pub lexical_effect: Option<DefId>,
    /// Explicit owner annotation; wins over the lexical effect.
    #[serde(default)]
    pub owner_effect: Option<DefId>,
    pub resume: ResumeKind,
    #[serde(default)]
    pub params: Vec<SemType>,
    #[serde(default = "unit_type")]
    pub ret: SemType,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    #[default]
    Function,
    Lambda,
}

/// A function or lambda definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub def: DefId,
    pub name: String,
    #[serde(default)]
    pub kind: FunctionKind,
    /// Enclosing function of a lambda.
    #[serde(default)]
    pub parent: Option<DefId>,
    /// Row inferred by the checker, if any.
    #[serde(default)]
    pub effect_row: Option<EffectRow>,
    /// Body expression, when the front end hands it to the lowering.
    #[serde(default)]
    pub body: Option<ExprId>,
    #[serde(default)]
    pub span: Span,
}

/// A typed argument expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    pub expr: ExprId,
    pub ty: SemType,
}

/// Origin of a captured value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// A named local.
    Sym(String),
    /// A compiler temporary.
    Tmp(u32),
}

impl CaptureSource {
    /// Field name in a continuation environment.
    pub fn field_name(&self) -> String {
        match self {
            CaptureSource::Sym(name) => format!("sym.{}", name),
            CaptureSource::Tmp(id) => format!("tmp.{}", id),
        }
    }
}

/// A value live across a suspension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    pub source: CaptureSource,
    pub ty: SemType,
    #[serde(default)]
    pub mutable: bool,
}

/// Identifies a clause of a handler expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClauseRef {
    pub handler: ExprId,
    pub clause_index: u32,
}

/// Where a call or perform sits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteContext {
    /// The function or lambda whose body contains the expression.
    pub function: DefId,
    /// Set when the expression is inside a handler clause body.
    #[serde(default)]
    pub clause: Option<ClauseRef>,
    /// Innermost handler expression whose body contains the expression.
    #[serde(default)]
    pub enclosing_handler: Option<ExprId>,
    /// Values live after the expression, in capture order.
    #[serde(default)]
    pub live: Vec<Capture>,
}

/// A call expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallExpr {
    pub expr: ExprId,
    /// Resolved callee; `None` for indirect calls.
    #[serde(default)]
    pub callee: Option<DefId>,
    /// Row attached to the call by the checker.
    #[serde(default)]
    pub effect_row: Option<EffectRow>,
    #[serde(default)]
    pub args: Vec<Operand>,
    #[serde(default = "unit_type")]
    pub result: SemType,
    pub context: SiteContext,
    #[serde(default)]
    pub span: Span,
}

/// A `perform` expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformExpr {
    pub expr: ExprId,
    /// Operation resolved by the binder, if it got that far.
    #[serde(default)]
    pub op: Option<DefId>,
    pub op_name: String,
    /// Effect qualifier written at the site (`Effect.op`).
    #[serde(default)]
    pub effect: Option<DefId>,
    #[serde(default)]
    pub args: Vec<Operand>,
    /// Type of the value the perform resumes with.
    #[serde(default = "unit_type")]
    pub result: SemType,
    pub context: SiteContext,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Proven single tail resumption.
    Static,
    /// Checked by a guard slot at runtime.
    Runtime,
}

/// The checker's verdict on a tail-resuming clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailJudgment {
    pub enforcement: Enforcement,
    /// Resume calls found in the clause body.
    #[serde(default)]
    pub calls: u32,
    /// The continuation escapes the clause.
    #[serde(default)]
    pub escapes: bool,
}

/// A clause parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: SemType,
}

/// One operation clause of a handler expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClauseDecl {
    #[serde(default)]
    pub op: Option<DefId>,
    pub op_name: String,
    #[serde(default)]
    pub effect: Option<DefId>,
    pub resume: ResumeKind,
    #[serde(default)]
    pub params: Vec<Param>,
    pub body: ExprId,
    #[serde(default)]
    pub tail: Option<TailJudgment>,
    #[serde(default)]
    pub span: Span,
}

/// A handler expression (`handle body with { clauses }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerExpr {
    pub expr: ExprId,
    /// Function whose body contains the handler.
    pub owner: DefId,
    pub body: ExprId,
    /// Operations this handler discharges.
    #[serde(default)]
    pub effect_row: EffectRow,
    #[serde(default)]
    pub clauses: Vec<ClauseDecl>,
    /// Requests for operations outside the row pass through untouched.
    #[serde(default)]
    pub forward_unhandled: bool,
    #[serde(default)]
    pub finally: Option<ExprId>,
    /// Next handler expression out in the same body.
    #[serde(default)]
    pub enclosing_handler: Option<ExprId>,
    /// Type produced by the body.
    #[serde(default = "unit_type")]
    pub result: SemType,
    #[serde(default)]
    pub span: Span,
}

fn unit_type() -> SemType {
    SemType::Unit
}

/// Serializable program model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramModel {
    pub module: String,
    pub effects: Vec<EffectDecl>,
    pub operations: Vec<OperationDecl>,
    pub functions: Vec<FunctionDecl>,
    pub calls: Vec<CallExpr>,
    pub performs: Vec<PerformExpr>,
    pub handlers: Vec<HandlerExpr>,
    /// Row used for functions and calls the checker left unannotated.
    pub default_row: EffectRow,
}

impl ProgramModel {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl TypedProgram for ProgramModel {
    fn module_name(&self) -> &str {
        &self.module
    }

    fn effects(&self) -> &[EffectDecl] {
        &self.effects
    }

    fn operations(&self) -> &[OperationDecl] {
        &self.operations
    }

    fn functions(&self) -> &[FunctionDecl] {
        &self.functions
    }

    fn calls(&self) -> &[CallExpr] {
        &self.calls
    }

    fn performs(&self) -> &[PerformExpr] {
        &self.performs
    }

    fn handlers(&self) -> &[HandlerExpr] {
        &self.handlers
    }

    fn default_row(&self) -> EffectRow {
        self.default_row.clone()
    }
}
