//! # Typed Program Model
//!
//! The contract between the front end and the effect passes.
//!
//! - [`ids`]: definition and expression identifiers
//! - [`types`]: semantic types
//! - [`row`]: effect rows
//! - [`program`]: declarations, sites and the [`TypedProgram`] trait

pub mod ids;
pub mod program;
pub mod row;
pub mod types;

pub use ids::{DefId, ExprId};
pub use program::{
    CallExpr, Capture, CaptureSource, ClauseDecl, ClauseRef, EffectDecl, Enforcement, FunctionDecl, FunctionKind,
    HandlerExpr, Operand, OperationDecl, Param, PerformExpr, ProgramModel, SiteContext, TailJudgment, TypedProgram,
};
pub use row::{EffectRow, OpRef, RowVar};
pub use types::SemType;
