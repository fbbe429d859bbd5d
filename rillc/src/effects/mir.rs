//! # Effect Model Builder
//!
//! Builds the per-module effect model from a [`TypedProgram`]:
//!
//! - effects with global ids and their operations regrouped under the
//!   owning effect,
//! - a row and purity verdict for every function,
//! - a row and effectfulness verdict for every call,
//! - resolved performs,
//! - handler expressions with their clauses paired to operations.
//!
//! Global effect ids come from the [`BuildRegistry`], so modules compiled
//! into the same program agree on them.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use rill_runtime::{EffectId, OpId, ResumeKind};

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::model::{
    CallExpr, DefId, EffectRow, Enforcement, ExprId, FunctionKind, HandlerExpr, Operand, OperationDecl, Param,
    RowVar, SemType, SiteContext, TailJudgment, TypedProgram,
};
use crate::span::Span;
use crate::substrate::{BuildRegistry, EffectShape, OpShape, RegistryError};

/// Faults raised while building the effect model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectModelError {
    #[error("operation `{name}` not found{}", in_effect(.effect))]
    OperationNotFound {
        name: String,
        effect: Option<String>,
        span: Span,
    },

    #[error("operation `{name}` is ambiguous: {}", .candidates.join(", "))]
    AmbiguousOperation {
        name: String,
        candidates: Vec<String>,
        span: Span,
    },

    #[error("unknown effect {def}")]
    UnknownEffect { def: DefId, span: Span },

    #[error("operation `{name}` has no owning effect")]
    OrphanOperation { name: String, span: Span },

    #[error("unknown function {def}")]
    UnknownFunction { def: DefId, span: Span },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn in_effect(effect: &Option<String>) -> String {
    match effect {
        Some(label) => format!(" in effect `{}`", label),
        None => String::new(),
    }
}

impl EffectModelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EffectModelError::OperationNotFound { .. } => ErrorCode::OperationNotFound,
            EffectModelError::AmbiguousOperation { .. } => ErrorCode::AmbiguousOperation,
            EffectModelError::UnknownEffect { .. } => ErrorCode::UnknownEffect,
            EffectModelError::OrphanOperation { .. } => ErrorCode::OrphanOperation,
            EffectModelError::UnknownFunction { .. } => ErrorCode::UnknownFunction,
            EffectModelError::Registry(_) => ErrorCode::EffectShapeMismatch,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            EffectModelError::OperationNotFound { span, .. }
            | EffectModelError::AmbiguousOperation { span, .. }
            | EffectModelError::UnknownEffect { span, .. }
            | EffectModelError::OrphanOperation { span, .. }
            | EffectModelError::UnknownFunction { span, .. } => *span,
            EffectModelError::Registry(_) => Span::dummy(),
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.to_string(), self.span()).with_error_code(self.code())
    }
}

pub type Result<T> = std::result::Result<T, EffectModelError>;

/// An effect with its global id.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectInfo {
    pub def: DefId,
    pub id: EffectId,
    pub name: String,
    pub label: String,
    pub host: bool,
    /// Operation defs in op id order.
    pub ops: Vec<DefId>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationInfo {
    pub def: DefId,
    /// Owning effect.
    pub effect: DefId,
    pub effect_id: EffectId,
    pub op_id: OpId,
    /// Program-wide op index.
    pub global_index: u32,
    pub name: String,
    /// `Label.operation`
    pub qualified_name: String,
    pub resume: ResumeKind,
    pub params: Vec<SemType>,
    pub ret: SemType,
    pub span: Span,
}

/// Effect verdict for a function or lambda.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEffectInfo {
    pub symbol: DefId,
    pub name: String,
    /// Symbol base, unique within the module: the name, or `name$d<def>`
    /// when several functions share it.
    pub base: String,
    pub kind: FunctionKind,
    pub effect_row: EffectRow,
    /// `effect_row.is_empty()`
    pub pure: bool,
    pub body: Option<ExprId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallInfo {
    pub call_site: ExprId,
    /// Callee if it resolved to a function of this module.
    pub callee: Option<DefId>,
    pub effect_row: EffectRow,
    pub effectful: bool,
    pub args: Vec<Operand>,
    pub result: SemType,
    pub context: SiteContext,
    pub span: Span,
}

/// A perform resolved to its operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformInfo {
    pub expr: ExprId,
    pub op: DefId,
    pub effect: DefId,
    pub args: Vec<Operand>,
    pub result: SemType,
    pub context: SiteContext,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClauseInfo {
    pub index: u32,
    pub op: DefId,
    pub effect: DefId,
    pub effect_id: EffectId,
    pub op_id: OpId,
    /// Resume kind the clause was written with.
    pub resume: ResumeKind,
    /// Present for `Tail` clauses.
    pub tail: Option<TailJudgment>,
    /// False when a forwarding handler leaves this op to outer handlers.
    pub installs_frame: bool,
    pub params: Vec<Param>,
    pub body: ExprId,
    pub span: Span,
}

impl ClauseInfo {
    /// Tail clause whose single resumption is checked at runtime.
    pub fn needs_tail_guard(&self) -> bool {
        self.resume == ResumeKind::Tail && matches!(self.tail, Some(t) if t.enforcement == Enforcement::Runtime)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerInfo {
    pub expr: ExprId,
    pub owner: DefId,
    pub body: ExprId,
    pub effect_row: EffectRow,
    pub clauses: Vec<ClauseInfo>,
    pub forward_unhandled: bool,
    pub finally: Option<ExprId>,
    pub enclosing_handler: Option<ExprId>,
    pub result: SemType,
    pub span: Span,
}

/// The effect model of one module.
#[derive(Debug, Clone, Default)]
pub struct EffectMir {
    module: String,
    effects: IndexMap<DefId, EffectInfo>,
    operations: IndexMap<DefId, OperationInfo>,
    functions: IndexMap<DefId, FunctionEffectInfo>,
    calls: IndexMap<ExprId, CallInfo>,
    performs: IndexMap<ExprId, PerformInfo>,
    handlers: IndexMap<ExprId, HandlerInfo>,
}

impl EffectMir {
    /// Build the effect model of `program`.
    pub fn build(program: &dyn TypedProgram, registry: &mut BuildRegistry) -> Result<Self> {
        let mut mir = EffectMir {
            module: program.module_name().to_string(),
            ..Self::default()
        };
        mir.collect_effects(program, registry)?;
        mir.collect_performs(program)?;
        mir.collect_functions(program)?;
        mir.collect_calls(program)?;
        mir.collect_handlers(program)?;
        debug!(
            module = %mir.module,
            effects = mir.effects.len(),
            functions = mir.functions.len(),
            performs = mir.performs.len(),
            handlers = mir.handlers.len(),
            "built effect model"
        );
        Ok(mir)
    }

    fn collect_effects(&mut self, program: &dyn TypedProgram, registry: &mut BuildRegistry) -> Result<()> {
        let mut owned: IndexMap<DefId, Vec<&OperationDecl>> =
            program.effects().iter().map(|e| (e.def, Vec::new())).collect();

        for op in program.operations() {
            let owner = op
                .owner_effect
                .or(op.lexical_effect)
                .ok_or_else(|| EffectModelError::OrphanOperation {
                    name: op.name.clone(),
                    span: op.span,
                })?;
            owned
                .get_mut(&owner)
                .ok_or(EffectModelError::UnknownEffect { def: owner, span: op.span })?
                .push(op);
        }

        for decl in program.effects() {
            let ops = owned.get(&decl.def).map(Vec::as_slice).unwrap_or_default();
            let shape = EffectShape {
                name: decl.name.clone(),
                label: decl.label.clone(),
                host: decl.host,
                ops: ops
                    .iter()
                    .map(|op| OpShape {
                        name: op.name.clone(),
                        resume: op.resume,
                    })
                    .collect(),
            };
            let id = registry.register_effect(&self.module, shape)?;

            for (i, op) in ops.iter().enumerate() {
                let op_id = OpId(i as u32);
                let global_index = registry.op_index(id, op_id).unwrap_or_default();
                self.operations.insert(
                    op.def,
                    OperationInfo {
                        def: op.def,
                        effect: decl.def,
                        effect_id: id,
                        op_id,
                        global_index,
                        name: op.name.clone(),
                        qualified_name: format!("{}.{}", decl.label, op.name),
                        resume: op.resume,
                        params: op.params.clone(),
                        ret: op.ret.clone(),
                        span: op.span,
                    },
                );
            }

            self.effects.insert(
                decl.def,
                EffectInfo {
                    def: decl.def,
                    id,
                    name: decl.name.clone(),
                    label: decl.label.clone(),
                    host: decl.host,
                    ops: ops.iter().map(|op| op.def).collect(),
                    span: decl.span,
                },
            );
        }
        Ok(())
    }

    /// Resolve an operation reference: by def, then by name in the named
    /// effect, then by name across all effects.
    fn resolve_op(&self, op: Option<DefId>, name: &str, effect: Option<DefId>, span: Span) -> Result<DefId> {
        if let Some(def) = op {
            if self.operations.contains_key(&def) {
                return Ok(def);
            }
        }

        if let Some(effect) = effect {
            let info = self
                .effects
                .get(&effect)
                .ok_or(EffectModelError::UnknownEffect { def: effect, span })?;
            return info
                .ops
                .iter()
                .copied()
                .find(|def| self.operations[def].name == name)
                .ok_or_else(|| EffectModelError::OperationNotFound {
                    name: name.to_string(),
                    effect: Some(info.label.clone()),
                    span,
                });
        }

        let candidates: Vec<&OperationInfo> = self.operations.values().filter(|op| op.name == name).collect();
        match candidates.as_slice() {
            [] => Err(EffectModelError::OperationNotFound {
                name: name.to_string(),
                effect: None,
                span,
            }),
            [only] => Ok(only.def),
            many => Err(EffectModelError::AmbiguousOperation {
                name: name.to_string(),
                candidates: many.iter().map(|op| op.qualified_name.clone()).collect(),
                span,
            }),
        }
    }

    fn collect_performs(&mut self, program: &dyn TypedProgram) -> Result<()> {
        for perform in program.performs() {
            let op = self.resolve_op(perform.op, &perform.op_name, perform.effect, perform.span)?;
            let effect = self.operations[&op].effect;
            trace!(expr = %perform.expr, op = %self.operations[&op].qualified_name, "resolved perform");
            self.performs.insert(
                perform.expr,
                PerformInfo {
                    expr: perform.expr,
                    op,
                    effect,
                    args: perform.args.clone(),
                    result: perform.result.clone(),
                    context: perform.context.clone(),
                    span: perform.span,
                },
            );
        }
        self.performs.sort_keys();
        Ok(())
    }

    fn collect_functions(&mut self, program: &dyn TypedProgram) -> Result<()> {
        let default_row = program.default_row();
        let mut name_uses: FxHashMap<&str, usize> = FxHashMap::default();
        for decl in program.functions() {
            *name_uses.entry(decl.name.as_str()).or_default() += 1;
        }
        for decl in program.functions() {
            let row = decl.effect_row.clone().unwrap_or_else(|| default_row.clone());
            let base = if name_uses[decl.name.as_str()] > 1 {
                format!("{}$d{}", decl.name, decl.def.0)
            } else {
                decl.name.clone()
            };
            self.functions.insert(
                decl.def,
                FunctionEffectInfo {
                    symbol: decl.def,
                    name: decl.name.clone(),
                    base,
                    kind: decl.kind,
                    effect_row: row,
                    pure: false,
                    body: decl.body,
                },
            );
        }

        let handlers: FxHashMap<ExprId, &HandlerExpr> = program.handlers().iter().map(|h| (h.expr, h)).collect();

        // A perform the checker left out of the row still makes the
        // function effectful unless a handler in the same body discharges it.
        for perform in self.performs.values() {
            let function = perform.context.function;
            let info = self
                .functions
                .get_mut(&function)
                .ok_or(EffectModelError::UnknownFunction {
                    def: function,
                    span: perform.span,
                })?;
            let op_name = self.operations.get(&perform.op).map_or("", |o| o.name.as_str());
            if handled_locally(&handlers, perform.context.enclosing_handler, perform.effect, perform.op, op_name) {
                continue;
            }
            if !info.effect_row.contains_op(perform.effect, perform.op) {
                trace!(function = %info.name, op = %perform.op, "adding missing obligation");
                info.effect_row.add_op(perform.effect, perform.op);
            }
        }

        for info in self.functions.values_mut() {
            info.pure = info.effect_row.is_empty();
        }
        Ok(())
    }

    fn collect_calls(&mut self, program: &dyn TypedProgram) -> Result<()> {
        let default_row = program.default_row();
        for call in program.calls() {
            if !self.functions.contains_key(&call.context.function) {
                return Err(EffectModelError::UnknownFunction {
                    def: call.context.function,
                    span: call.span,
                });
            }
        }

        // Unhandled callee obligations become the caller's. Rows only grow,
        // so this settles; recursion needs more than one pass.
        let handlers: FxHashMap<ExprId, &HandlerExpr> = program.handlers().iter().map(|h| (h.expr, h)).collect();
        let mut passes = 0usize;
        loop {
            passes += 1;
            let mut changed = false;
            for call in program.calls() {
                let (row, effectful) = self.call_row(call, &default_row);
                if !effectful {
                    continue;
                }
                let escaping = self.escaping(&handlers, call.context.enclosing_handler, &row);
                let Some(caller) = self.functions.get_mut(&call.context.function) else {
                    continue;
                };
                let mut grown = caller.effect_row.clone();
                grown.extend(&escaping);
                if grown != caller.effect_row {
                    trace!(function = %caller.name, call = %call.expr, "callee obligations flow into caller");
                    caller.effect_row = grown;
                    caller.pure = caller.effect_row.is_empty();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        trace!(passes, "call rows settled");

        for call in program.calls() {
            let (row, effectful) = self.call_row(call, &default_row);
            let callee = call.callee.filter(|def| self.functions.contains_key(def));
            self.calls.insert(
                call.expr,
                CallInfo {
                    call_site: call.expr,
                    callee,
                    effect_row: row,
                    effectful,
                    args: call.args.clone(),
                    result: call.result.clone(),
                    context: call.context.clone(),
                    span: call.span,
                },
            );
        }
        self.calls.sort_keys();
        Ok(())
    }

    /// Row and effectfulness of a call under the current function verdicts.
    ///
    /// An unresolved callee with no explicit row gets an open row.
    fn call_row(&self, call: &CallExpr, default_row: &EffectRow) -> (EffectRow, bool) {
        let callee = call.callee.and_then(|def| self.functions.get(&def));
        let row = match (&call.effect_row, callee) {
            (Some(row), _) => row.clone(),
            (None, Some(f)) => f.effect_row.clone(),
            (None, None) => {
                let mut row = default_row.clone();
                if row.is_empty() {
                    row.set_row_var(RowVar::UNKNOWN);
                }
                row
            }
        };
        let effectful = match callee {
            Some(f) if f.pure => false,
            _ => !row.is_empty(),
        };
        (row, effectful)
    }

    /// The part of `row` no handler around the call site discharges.
    fn escaping(
        &self,
        handlers: &FxHashMap<ExprId, &HandlerExpr>,
        enclosing: Option<ExprId>,
        row: &EffectRow,
    ) -> EffectRow {
        let op_name = |op: DefId| self.operations.get(&op).map_or("", |o| o.name.as_str());
        let mut escaping = EffectRow::pure();
        for effect in row.effects() {
            let ops = self.effects.get(&effect).map(|e| e.ops.as_slice()).unwrap_or_default();
            let discharged = !ops.is_empty()
                && ops
                    .iter()
                    .all(|op| handled_locally(handlers, enclosing, effect, *op, op_name(*op)));
            if !discharged {
                escaping.add_effect(effect);
            }
        }
        for entry in row.ops() {
            if !handled_locally(handlers, enclosing, entry.effect, entry.op, op_name(entry.op)) {
                escaping.add_op(entry.effect, entry.op);
            }
        }
        // Unknown effects cannot be discharged here.
        if let Some(var) = row.row_var() {
            escaping.set_row_var(var);
        }
        escaping
    }

    fn collect_handlers(&mut self, program: &dyn TypedProgram) -> Result<()> {
        for handler in program.handlers() {
            if !self.functions.contains_key(&handler.owner) {
                return Err(EffectModelError::UnknownFunction {
                    def: handler.owner,
                    span: handler.span,
                });
            }

            let mut clauses = Vec::with_capacity(handler.clauses.len());
            for (index, clause) in handler.clauses.iter().enumerate() {
                let op = self.resolve_op(clause.op, &clause.op_name, clause.effect, clause.span)?;
                let info = &self.operations[&op];

                if clause.resume != info.resume {
                    warn!(
                        handler = %handler.expr,
                        op = %info.qualified_name,
                        clause = %clause.resume,
                        declared = %info.resume,
                        "clause resume kind differs from the operation; it will never match"
                    );
                }

                let tail = match clause.resume {
                    ResumeKind::Tail => {
                        let mut judgment = clause.tail.unwrap_or(TailJudgment {
                            enforcement: Enforcement::Runtime,
                            calls: 0,
                            escapes: false,
                        });
                        if judgment.escapes {
                            judgment.enforcement = Enforcement::Runtime;
                        }
                        Some(judgment)
                    }
                    ResumeKind::Resume => None,
                };

                let installs_frame =
                    !handler.forward_unhandled || handler.effect_row.contains_op(info.effect, info.def);

                clauses.push(ClauseInfo {
                    index: index as u32,
                    op,
                    effect: info.effect,
                    effect_id: info.effect_id,
                    op_id: info.op_id,
                    resume: clause.resume,
                    tail,
                    installs_frame,
                    params: clause.params.clone(),
                    body: clause.body,
                    span: clause.span,
                });
            }

            self.handlers.insert(
                handler.expr,
                HandlerInfo {
                    expr: handler.expr,
                    owner: handler.owner,
                    body: handler.body,
                    effect_row: handler.effect_row.clone(),
                    clauses,
                    forward_unhandled: handler.forward_unhandled,
                    finally: handler.finally,
                    enclosing_handler: handler.enclosing_handler,
                    result: handler.result.clone(),
                    span: handler.span,
                },
            );
        }
        self.handlers.sort_keys();
        Ok(())
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Effect verdict of a function.
    pub fn effect_mir_for(&self, def: DefId) -> Option<&FunctionEffectInfo> {
        self.functions.get(&def)
    }

    pub fn effects(&self) -> impl Iterator<Item = &EffectInfo> {
        self.effects.values()
    }

    pub fn effect(&self, def: DefId) -> Option<&EffectInfo> {
        self.effects.get(&def)
    }

    pub fn operations(&self) -> impl Iterator<Item = &OperationInfo> {
        self.operations.values()
    }

    pub fn operation(&self, def: DefId) -> Option<&OperationInfo> {
        self.operations.get(&def)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionEffectInfo> {
        self.functions.values()
    }

    pub fn calls(&self) -> impl Iterator<Item = &CallInfo> {
        self.calls.values()
    }

    pub fn call(&self, expr: ExprId) -> Option<&CallInfo> {
        self.calls.get(&expr)
    }

    /// Performs in program order.
    pub fn performs(&self) -> impl Iterator<Item = &PerformInfo> {
        self.performs.values()
    }

    pub fn perform(&self, expr: ExprId) -> Option<&PerformInfo> {
        self.performs.get(&expr)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &HandlerInfo> {
        self.handlers.values()
    }

    pub fn handler(&self, expr: ExprId) -> Option<&HandlerInfo> {
        self.handlers.get(&expr)
    }
}

/// True if a handler enclosing the site, in the same body, covers the op.
fn handled_locally(
    handlers: &FxHashMap<ExprId, &HandlerExpr>,
    mut current: Option<ExprId>,
    effect: DefId,
    op: DefId,
    op_name: &str,
) -> bool {
    while let Some(expr) = current {
        let Some(handler) = handlers.get(&expr) else {
            return false;
        };
        let by_clause = handler.clauses.iter().any(|c| match c.op {
            Some(def) => def == op,
            None => c.op_name == op_name && c.effect.map_or(true, |e| e == effect),
        });
        if handler.effect_row.contains_op(effect, op) || by_clause {
            return true;
        }
        current = handler.enclosing_handler;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClauseDecl, EffectDecl, FunctionDecl, OperationDecl, PerformExpr, ProgramModel};

    fn ctx(function: u32) -> SiteContext {
        SiteContext {
            function: DefId(function),
            clause: None,
            enclosing_handler: None,
            live: Vec::new(),
        }
    }

    fn effect(def: u32, name: &str, label: &str) -> EffectDecl {
        EffectDecl {
            def: DefId(def),
            name: name.into(),
            label: label.into(),
            host: false,
            span: Span::dummy(),
        }
    }

    fn op(def: u32, name: &str, lexical: Option<u32>, owner: Option<u32>) -> OperationDecl {
        OperationDecl {
            def: DefId(def),
            name: name.into(),
            lexical_effect: lexical.map(DefId),
            owner_effect: owner.map(DefId),
            resume: ResumeKind::Tail,
            params: vec![],
            ret: SemType::I64,
            span: Span::dummy(),
        }
    }

    fn function(def: u32, name: &str) -> FunctionDecl {
        FunctionDecl {
            def: DefId(def),
            name: name.into(),
            kind: FunctionKind::Function,
            parent: None,
            effect_row: None,
            body: None,
            span: Span::dummy(),
        }
    }

    fn perform(expr: u32, name: &str, function: u32) -> PerformExpr {
        PerformExpr {
            expr: ExprId(expr),
            op: None,
            op_name: name.into(),
            effect: None,
            args: vec![],
            result: SemType::I64,
            context: ctx(function),
            span: Span::dummy(),
        }
    }

    fn sample() -> ProgramModel {
        let mut p = ProgramModel::new("app");
        p.effects = vec![effect(1, "app.ask", "Ask"), effect(2, "app.log", "Log")];
        p.operations = vec![
            op(10, "get", Some(1), None),
            op(11, "info", Some(2), None),
            // Declared inside Ask but owned by Log.
            op(12, "warn", Some(1), Some(2)),
        ];
        p.functions = vec![function(20, "pure_fn"), function(21, "asks"), function(22, "caller")];
        p.performs = vec![perform(100, "get", 21)];
        p
    }

    #[test]
    fn test_owner_annotation_regroups_operations() {
        let mut reg = BuildRegistry::new();
        let mir = EffectMir::build(&sample(), &mut reg).unwrap();

        let warn_op = mir.operation(DefId(12)).unwrap();
        assert_eq!(warn_op.qualified_name, "Log.warn");
        assert_eq!(warn_op.op_id, OpId(1));
        assert_eq!(mir.effect(DefId(2)).unwrap().ops, vec![DefId(11), DefId(12)]);
        assert_eq!(warn_op.global_index, 2);
    }

    #[test]
    fn test_purity_follows_performs() {
        let mut reg = BuildRegistry::new();
        let mir = EffectMir::build(&sample(), &mut reg).unwrap();

        let pure = mir.effect_mir_for(DefId(20)).unwrap();
        assert!(pure.pure && pure.effect_row.is_empty());
        let asks = mir.effect_mir_for(DefId(21)).unwrap();
        assert!(!asks.pure);
        assert!(asks.effect_row.contains_op(DefId(1), DefId(10)));
    }

    #[test]
    fn test_call_effectfulness() {
        let mut p = sample();
        let call = |expr: u32, callee: Option<u32>| CallExpr {
            expr: ExprId(expr),
            callee: callee.map(DefId),
            effect_row: None,
            args: vec![],
            result: SemType::Unit,
            context: ctx(22),
            span: Span::dummy(),
        };
        p.calls = vec![call(200, Some(20)), call(201, Some(21)), call(202, None), call(203, Some(999))];
        let mut explicit = call(204, None);
        explicit.effect_row = Some(EffectRow::pure());
        p.calls.push(explicit);
        let mut pure_callee_with_row = call(205, Some(20));
        pure_callee_with_row.effect_row = Some(EffectRow::single_effect(DefId(1)));
        p.calls.push(pure_callee_with_row);

        let mut reg = BuildRegistry::new();
        let mir = EffectMir::build(&p, &mut reg).unwrap();
        assert!(!mir.call(ExprId(200)).unwrap().effectful);
        assert!(mir.call(ExprId(201)).unwrap().effectful);
        assert!(mir.call(ExprId(202)).unwrap().effectful);
        assert!(mir.call(ExprId(203)).unwrap().effectful);
        assert_eq!(mir.call(ExprId(203)).unwrap().callee, None);
        assert!(!mir.call(ExprId(204)).unwrap().effectful);
        assert!(!mir.call(ExprId(205)).unwrap().effectful);
    }

    fn plain_call(expr: u32, caller: u32, callee: u32) -> CallExpr {
        CallExpr {
            expr: ExprId(expr),
            callee: Some(DefId(callee)),
            effect_row: None,
            args: vec![],
            result: SemType::I64,
            context: ctx(caller),
            span: Span::dummy(),
        }
    }

    #[test]
    fn test_callee_obligations_reach_the_caller() {
        let mut p = sample();
        p.calls = vec![plain_call(200, 22, 21)];

        let mir = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap();
        let caller = mir.effect_mir_for(DefId(22)).unwrap();
        assert!(!caller.pure);
        assert!(caller.effect_row.contains_op(DefId(1), DefId(10)));
        assert!(mir.call(ExprId(200)).unwrap().effectful);
    }

    #[test]
    fn test_obligations_settle_through_call_chains() {
        let mut p = sample();
        p.functions.push(function(23, "middle"));
        p.functions.push(function(24, "outer"));
        // Listed outermost first, so one pass is not enough.
        p.calls = vec![plain_call(200, 24, 23), plain_call(201, 23, 21), plain_call(202, 21, 24)];

        let mir = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap();
        for def in [21, 23, 24] {
            let info = mir.effect_mir_for(DefId(def)).unwrap();
            assert!(!info.pure, "{} should be effectful", info.name);
            assert!(info.effect_row.contains_op(DefId(1), DefId(10)));
        }
        assert!(mir.call(ExprId(200)).unwrap().effectful);
        assert!(mir.effect_mir_for(DefId(20)).unwrap().pure);
    }

    #[test]
    fn test_handled_call_keeps_caller_pure() {
        let mut p = sample();
        let mut call = plain_call(200, 22, 21);
        call.context.enclosing_handler = Some(ExprId(299));
        p.calls = vec![call];
        p.handlers.push(HandlerExpr {
            expr: ExprId(299),
            owner: DefId(22),
            body: ExprId(298),
            effect_row: EffectRow::single_effect(DefId(1)),
            clauses: vec![],
            forward_unhandled: false,
            finally: None,
            enclosing_handler: None,
            result: SemType::I64,
            span: Span::dummy(),
        });

        let mir = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap();
        assert!(mir.effect_mir_for(DefId(22)).unwrap().pure);
        assert!(mir.call(ExprId(200)).unwrap().effectful);
    }

    #[test]
    fn test_unresolved_callee_opens_the_caller_row() {
        let mut p = sample();
        let mut call = plain_call(200, 22, 999);
        call.callee = None;
        p.calls = vec![call];

        let mir = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap();
        let caller = mir.effect_mir_for(DefId(22)).unwrap();
        assert!(!caller.pure);
        assert_eq!(caller.effect_row.row_var(), Some(RowVar::UNKNOWN));
    }

    #[test]
    fn test_perform_not_found() {
        let mut p = sample();
        p.performs.push(perform(101, "nap", 21));
        let err = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OperationNotFound);
    }

    #[test]
    fn test_ambiguous_perform_and_qualified_fix() {
        let mut p = sample();
        p.operations.push(op(13, "get", Some(2), None));
        p.performs.push(perform(101, "get", 21));
        p.performs.retain(|x| x.expr != ExprId(100));
        let err = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap_err();
        assert!(matches!(
            err,
            EffectModelError::AmbiguousOperation { ref candidates, .. } if candidates == &["Ask.get", "Log.get"]
        ));

        p.performs[0].effect = Some(DefId(2));
        let mir = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap();
        assert_eq!(mir.perform(ExprId(101)).unwrap().op, DefId(13));
    }

    #[test]
    fn test_orphan_operation() {
        let mut p = sample();
        p.operations.push(op(14, "lost", None, None));
        let err = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OrphanOperation);
    }

    #[test]
    fn test_locally_handled_perform_keeps_function_pure() {
        let mut p = sample();
        p.functions.push(function(23, "wrapped"));
        let mut inner = perform(300, "get", 23);
        inner.context.enclosing_handler = Some(ExprId(299));
        p.performs.push(inner);
        p.handlers.push(HandlerExpr {
            expr: ExprId(299),
            owner: DefId(23),
            body: ExprId(298),
            effect_row: EffectRow::single_effect(DefId(1)),
            clauses: vec![ClauseDecl {
                op: Some(DefId(10)),
                op_name: "get".into(),
                effect: None,
                resume: ResumeKind::Tail,
                params: vec![],
                body: ExprId(297),
                tail: None,
                span: Span::dummy(),
            }],
            forward_unhandled: false,
            finally: None,
            enclosing_handler: None,
            result: SemType::I64,
            span: Span::dummy(),
        });

        let mir = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap();
        assert!(mir.effect_mir_for(DefId(23)).unwrap().pure);

        let clause = &mir.handler(ExprId(299)).unwrap().clauses[0];
        assert_eq!(clause.tail.unwrap().enforcement, Enforcement::Runtime);
        assert!(clause.needs_tail_guard());
        assert!(clause.installs_frame);
    }

    #[test]
    fn test_escaping_continuation_forces_runtime_check() {
        let mut p = sample();
        p.handlers.push(HandlerExpr {
            expr: ExprId(400),
            owner: DefId(22),
            body: ExprId(401),
            effect_row: EffectRow::pure(),
            clauses: vec![ClauseDecl {
                op: None,
                op_name: "info".into(),
                effect: Some(DefId(2)),
                resume: ResumeKind::Tail,
                params: vec![],
                body: ExprId(402),
                tail: Some(TailJudgment {
                    enforcement: Enforcement::Static,
                    calls: 1,
                    escapes: true,
                }),
                span: Span::dummy(),
            }],
            forward_unhandled: true,
            finally: None,
            enclosing_handler: None,
            result: SemType::Unit,
            span: Span::dummy(),
        });

        let mir = EffectMir::build(&p, &mut BuildRegistry::new()).unwrap();
        let clause = &mir.handler(ExprId(400)).unwrap().clauses[0];
        assert_eq!(clause.tail.unwrap().enforcement, Enforcement::Runtime);
        // Forwarding handler whose row does not list Log.info.
        assert!(!clause.installs_frame);
    }
}
