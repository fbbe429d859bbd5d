//! # Continuation Sites
//!
//! Every perform and every effectful call is a point where the running
//! function may suspend. Each such point gets a [`ContinuationSite`]: an id
//! unique within its owner and a nominal environment record holding what the
//! rest of the function needs after resumption.
//!
//! ```text
//! (type $app.main.k0 (sub $rill.ContEnv (struct
//!   (field $site i32)
//!   (field $handler (ref null $rill.HandlerFrame))
//!   (field $sym.x i64))))
//! ```
//!
//! Sites owned by a tail clause whose single resumption is checked at
//! runtime also carry the clause's `continuation` and a mutable
//! `tail_guard`.

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::trace;

use super::abi::{self, CONT_ENV, CONT_FRAME};
use super::mir::EffectMir;
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::model::{DefId, ExprId, FunctionKind, SemType, SiteContext};
use crate::span::Span;
use crate::substrate::{FieldType, Module, ModuleError, TypeDef, ValType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SiteError {
    #[error("value `{field}` is captured twice at {expr}")]
    DuplicateCapture { field: String, expr: ExprId, span: Span },

    #[error("site {expr} belongs to unknown function {function}")]
    UnknownOwner { function: DefId, expr: ExprId, span: Span },

    #[error("site {expr} refers to unknown handler {handler}")]
    UnknownHandler { handler: ExprId, expr: ExprId, span: Span },
}

impl SiteError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let (code, span) = match self {
            SiteError::DuplicateCapture { span, .. } => (ErrorCode::DuplicateCapture, *span),
            SiteError::UnknownOwner { span, .. } => (ErrorCode::UnknownFunction, *span),
            SiteError::UnknownHandler { span, .. } => (ErrorCode::UnknownFunction, *span),
        };
        Diagnostic::error(self.to_string(), span).with_error_code(code)
    }
}

/// Body a site lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteOwner {
    Function(DefId),
    Lambda(DefId),
    HandlerClause {
        function: DefId,
        handler_expr: ExprId,
        clause_index: u32,
    },
}

/// Handler chain a site performs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAtSite {
    /// The chain the enclosing function was called with.
    Inherited,
    /// The innermost handler expression around the site, in the same body.
    Installed { handler_expr: ExprId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteOrigin {
    Perform,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Site,
    Handler,
    Continuation,
    TailGuard,
    Capture,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvField {
    pub name: String,
    /// Semantic type of a captured value.
    pub sem: Option<SemType>,
    pub storage: ValType,
    pub mutable: bool,
    pub kind: FieldKind,
}

impl EnvField {
    fn base(name: &str, storage: ValType, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            sem: None,
            storage,
            mutable: false,
            kind,
        }
    }
}

/// Layout of a continuation environment record.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvLayout {
    pub type_name: String,
    pub fields: Vec<EnvField>,
}

impl EnvLayout {
    pub fn field(&self, name: &str) -> Option<&EnvField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn captures(&self) -> impl Iterator<Item = &EnvField> {
        self.fields.iter().filter(|f| f.kind == FieldKind::Capture)
    }

    pub fn has_tail_guard(&self) -> bool {
        self.fields.iter().any(|f| f.kind == FieldKind::TailGuard)
    }

    /// The record as a subtype of `rill.ContEnv`.
    pub fn to_type_def(&self) -> TypeDef {
        TypeDef::Struct {
            name: self.type_name.clone(),
            fields: self
                .fields
                .iter()
                .map(|f| FieldType {
                    name: f.name.clone(),
                    ty: f.storage.clone(),
                    mutable: f.mutable,
                })
                .collect(),
            supertype: Some(CONT_ENV.to_string()),
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationSite {
    pub site_id: u32,
    pub expr: ExprId,
    pub owner: SiteOwner,
    pub env: EnvLayout,
    pub handler_at_site: HandlerAtSite,
    pub resume_value_type: SemType,
    pub origin: SiteOrigin,
}

impl ContinuationSite {
    /// Function or lambda whose body contains the site.
    pub fn function(&self) -> DefId {
        match self.owner {
            SiteOwner::Function(def) | SiteOwner::Lambda(def) => def,
            SiteOwner::HandlerClause { function, .. } => function,
        }
    }
}

/// All continuation sites of a module, in program order.
#[derive(Debug, Clone, Default)]
pub struct SiteTable {
    sites: IndexMap<ExprId, ContinuationSite>,
}

impl SiteTable {
    /// Compute a site for every perform and effectful call.
    pub fn materialize(mir: &EffectMir) -> Result<Self, SiteError> {
        let mut pending: Vec<(ExprId, &SiteContext, &SemType, SiteOrigin, Span)> = Vec::new();
        for perform in mir.performs() {
            pending.push((perform.expr, &perform.context, &perform.result, SiteOrigin::Perform, perform.span));
        }
        for call in mir.calls().filter(|c| c.effectful) {
            pending.push((call.call_site, &call.context, &call.result, SiteOrigin::Call, call.span));
        }
        pending.sort_by_key(|(expr, ..)| *expr);

        let mut counters: FxHashMap<SiteOwner, u32> = FxHashMap::default();
        let mut sites = IndexMap::with_capacity(pending.len());

        for (expr, context, result, origin, span) in pending {
            let (owner, base, guarded) = owner_of(mir, context, expr, span)?;
            let counter = counters.entry(owner).or_insert(0);
            let site_id = *counter;
            *counter += 1;

            let env = build_env(mir.module(), &base, site_id, context, guarded, expr, span)?;
            trace!(%expr, env = %env.type_name, captures = context.live.len(), "materialized site");

            let handler_at_site = match context.enclosing_handler {
                Some(handler_expr) => HandlerAtSite::Installed { handler_expr },
                None => HandlerAtSite::Inherited,
            };

            sites.insert(
                expr,
                ContinuationSite {
                    site_id,
                    expr,
                    owner,
                    env,
                    handler_at_site,
                    resume_value_type: result.clone(),
                    origin,
                },
            );
        }

        Ok(Self { sites })
    }

    pub fn site(&self, expr: ExprId) -> Option<&ContinuationSite> {
        self.sites.get(&expr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContinuationSite> {
        self.sites.values()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Declare every environment record in `module`.
    pub fn declare_env_types(&self, module: &mut Module) -> Result<(), ModuleError> {
        for site in self.sites.values() {
            module.declare_type(site.env.to_type_def())?;
        }
        Ok(())
    }
}

/// Owner of a site, the base of its env name and whether it needs the
/// runtime tail guard.
fn owner_of(
    mir: &EffectMir,
    context: &SiteContext,
    expr: ExprId,
    span: Span,
) -> Result<(SiteOwner, String, bool), SiteError> {
    let function = mir
        .effect_mir_for(context.function)
        .ok_or(SiteError::UnknownOwner {
            function: context.function,
            expr,
            span,
        })?;

    if let Some(clause) = context.clause {
        let handler = mir.handler(clause.handler).ok_or(SiteError::UnknownHandler {
            handler: clause.handler,
            expr,
            span,
        })?;
        let guarded = handler
            .clauses
            .get(clause.clause_index as usize)
            .is_some_and(|c| c.needs_tail_guard());
        let owner = SiteOwner::HandlerClause {
            function: context.function,
            handler_expr: clause.handler,
            clause_index: clause.clause_index,
        };
        let base = clause_base(&function.base, clause.handler, clause.clause_index);
        return Ok((owner, base, guarded));
    }

    let owner = match function.kind {
        FunctionKind::Function => SiteOwner::Function(context.function),
        FunctionKind::Lambda => SiteOwner::Lambda(context.function),
    };
    Ok((owner, function.base.clone(), false))
}

/// Symbol base of a handler clause body.
pub fn clause_base(function: &str, handler: ExprId, clause_index: u32) -> String {
    format!("{}.h{}.c{}", function, handler.0, clause_index)
}

fn build_env(
    module: &str,
    base: &str,
    site_id: u32,
    context: &SiteContext,
    guarded: bool,
    expr: ExprId,
    span: Span,
) -> Result<EnvLayout, SiteError> {
    let mut fields: Vec<EnvField> = abi::env_prefix()
        .into_iter()
        .map(|f| {
            let kind = if f.name == "site" {
                FieldKind::Site
            } else {
                FieldKind::Handler
            };
            EnvField::base(&f.name, f.ty, kind)
        })
        .collect();

    if guarded {
        fields.push(EnvField::base(
            "continuation",
            ValType::ref_null(CONT_FRAME),
            FieldKind::Continuation,
        ));
        fields.push(EnvField {
            mutable: true,
            ..EnvField::base("tail_guard", ValType::I32, FieldKind::TailGuard)
        });
    }

    let mut seen = FxHashSet::default();
    for capture in &context.live {
        let name = capture.source.field_name();
        if !seen.insert(name.clone()) {
            return Err(SiteError::DuplicateCapture { field: name, expr, span });
        }
        fields.push(EnvField {
            name,
            sem: Some(capture.ty.clone()),
            storage: abi::lower_storage(&capture.ty),
            mutable: capture.mutable,
            kind: FieldKind::Capture,
        });
    }

    Ok(EnvLayout {
        type_name: format!("{}.{}.k{}", module, base, site_id),
        fields,
    })
}
