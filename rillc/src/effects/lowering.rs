//! # Effect Lowering
//!
//! Turns performs, effectful calls and handler expressions into substrate
//! code over the runtime ABI. General expressions are compiled by an
//! [`ExprCompiler`]; it calls back into a [`LowerCx`] whenever it reaches an
//! effect construct.
//!
//! ## Conventions
//!
//! - Every function that runs effectful code has a local or parameter
//!   `handler` holding the current handler chain.
//! - A captured value lives in a local named like its environment field
//!   (`sym.x`, `tmp.3`).
//! - Clause bodies keep the continuation they may resume in `k`; guarded
//!   clauses track the resumption in `k.resumed`.
//!
//! ## Shapes
//!
//! A perform always suspends: it builds a request, appends a frame that
//! resumes at `<env>.resume` and returns the request to its caller. An
//! effectful call continues inline when the callee returns a value and
//! suspends the same way otherwise.
//!
//! A handler expression `h` owned by `f` becomes
//!
//! ```text
//! f.h<h>.run      push clause frames, run the body, dispatch, finally
//! f.h<h>.body     the handled body under the extended chain
//! f.h<h>.c<i>     one clause function per clause
//! f.h<h>.done     resumption point once the body completes after a bubble
//! f.h<h>.finally  the finally branch, when present
//! ```
//!
//! all prefixed with the module name.

use thiserror::Error;
use tracing::{debug, trace};

use super::abi::{
    self, box_value, lower_storage, unbox_value, CONT_ENV, CONT_FRAME, CONT_PUSH, CONT_RESUME, DISPATCH,
    EFFECT_REQUEST, FRAME_PUSH, HANDLER_FRAME, OUTCOME, OUTCOME_VALUE, PAYLOAD, PERFORM, TAG_REQUEST,
};
use super::mir::{CallInfo, EffectMir, FunctionEffectInfo, HandlerInfo};
use super::sites::{clause_base, ContinuationSite, FieldKind, SiteTable};
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::model::{ExprId, Operand, Param, SemType};
use crate::span::Span;
use crate::substrate::{Function, FunctionBuilder, HeapType, Import, Instr, Module, ModuleError, ValType};

/// Import module of opaque expressions.
pub const EXPR_MODULE: &str = "rill:expr";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoweringError {
    #[error("no continuation site for {expr}")]
    MissingSite { expr: ExprId },

    #[error("{expr} is not a {expected}")]
    NotA { expr: ExprId, expected: &'static str },

    #[error("call at {expr} has no resolved callee")]
    UnresolvedCallee { expr: ExprId, span: Span },

    #[error("handler {expr} belongs to an unknown function")]
    UnknownOwner { expr: ExprId },

    #[error("cannot compile {expr}: {message}")]
    Unsupported { expr: ExprId, message: String },

    #[error(transparent)]
    Module(#[from] ModuleError),
}

impl LoweringError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let span = match self {
            LoweringError::UnresolvedCallee { span, .. } => *span,
            _ => Span::dummy(),
        };
        Diagnostic::error(self.to_string(), span).with_error_code(ErrorCode::InvalidModule)
    }
}

/// What an expression leaves on the stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// A value in the storage type of the semantic type.
    Value(SemType),
    /// A `(ref $rill.Outcome)`.
    Outcome,
}

/// Compiles the expressions the effect lowering does not own.
pub trait ExprCompiler {
    /// Compile `expr` for `target`.
    fn compile_expr(&mut self, cx: &mut LowerCx<'_>, expr: ExprId, target: &Target) -> Result<(), LoweringError>;

    /// Push the function to call for an effectful call; arguments are
    /// already on the stack. Calls a resolved callee by name.
    fn compile_callee(&mut self, cx: &mut LowerCx<'_>, call: &CallInfo) -> Result<(), LoweringError> {
        let name = call
            .callee
            .and_then(|def| cx.lowering.mir.effect_mir_for(def))
            .map(|f| cx.lowering.function_symbol(f))
            .ok_or(LoweringError::UnresolvedCallee {
                expr: call.call_site,
                span: call.span,
            })?;
        cx.builder.emit(Instr::Call(name));
        Ok(())
    }

    /// Continue after `site`; its resumed value is on the stack and an
    /// outcome must be left. Completes with the value by default.
    fn compile_resume(&mut self, cx: &mut LowerCx<'_>, site: &ContinuationSite) -> Result<(), LoweringError> {
        cx.builder.extend(box_value(&site.resume_value_type));
        cx.builder.emit(Instr::call(OUTCOME_VALUE));
        Ok(())
    }
}

/// Lowering state of one module.
#[derive(Debug, Clone, Copy)]
pub struct EffectLowering<'a> {
    mir: &'a EffectMir,
    sites: &'a SiteTable,
}

impl<'a> EffectLowering<'a> {
    pub fn new(mir: &'a EffectMir, sites: &'a SiteTable) -> Self {
        Self { mir, sites }
    }

    pub fn mir(&self) -> &'a EffectMir {
        self.mir
    }

    pub fn sites(&self) -> &'a SiteTable {
        self.sites
    }

    /// `<module>.<function>`
    pub fn function_symbol(&self, function: &FunctionEffectInfo) -> String {
        format!("{}.{}", self.mir.module(), function.base)
    }

    /// Builder for an effectful function: takes the handler chain, returns
    /// an outcome.
    pub fn function_builder(&self, function: &FunctionEffectInfo) -> FunctionBuilder {
        let mut f = FunctionBuilder::new(self.function_symbol(function));
        f.param("handler", ValType::ref_null(HANDLER_FRAME))
            .result(ValType::ref_to(OUTCOME));
        f
    }

    /// Start lowering into `builder`.
    pub fn cx(&self, builder: FunctionBuilder) -> LowerCx<'a> {
        LowerCx {
            lowering: *self,
            builder,
            guarded: false,
            imports: Vec::new(),
        }
    }

    /// `<module>.<function>.h<expr>`
    pub fn handler_prefix(&self, handler: &HandlerInfo) -> Result<String, LoweringError> {
        let owner = self
            .mir
            .effect_mir_for(handler.owner)
            .ok_or(LoweringError::UnknownOwner { expr: handler.expr })?;
        Ok(format!("{}.{}.h{}", self.mir.module(), owner.base, handler.expr.0))
    }

    pub fn clause_fn_name(&self, handler: &HandlerInfo, clause_index: u32) -> Result<String, LoweringError> {
        let owner = self
            .mir
            .effect_mir_for(handler.owner)
            .ok_or(LoweringError::UnknownOwner { expr: handler.expr })?;
        Ok(format!(
            "{}.{}",
            self.mir.module(),
            clause_base(&owner.base, handler.expr, clause_index)
        ))
    }

    /// Emit the effectful function bodies handed over by the front end and
    /// every resume function and handler function of the module.
    ///
    /// The ABI types and the environment records must already be declared.
    pub fn emit(&self, module: &mut Module, compiler: &mut dyn ExprCompiler) -> Result<(), LoweringError> {
        for function in self.mir.functions().filter(|f| !f.pure) {
            if let Some(body) = function.body {
                let mut cx = self.cx(self.function_builder(function));
                compiler.compile_expr(&mut cx, body, &Target::Outcome)?;
                cx.finish(module)?;
            }
        }
        for site in self.sites.iter() {
            self.emit_resume(module, compiler, site)?;
        }
        for handler in self.mir.handlers() {
            self.emit_handler(module, compiler, handler)?;
        }
        debug!(
            module = self.mir.module(),
            sites = self.sites.len(),
            handlers = self.mir.handlers().count(),
            "lowered effect constructs"
        );
        Ok(())
    }

    /// `<env>.resume(env, value)`: reload the environment and continue.
    fn emit_resume(
        &self,
        module: &mut Module,
        compiler: &mut dyn ExprCompiler,
        site: &ContinuationSite,
    ) -> Result<(), LoweringError> {
        let env = &site.env;
        let mut f = FunctionBuilder::new(resume_fn_name(site));
        f.param("env", ValType::ref_to(CONT_ENV))
            .param("value", ValType::anyref())
            .result(ValType::ref_to(OUTCOME))
            .local("e", ValType::ref_null(&env.type_name))
            .local("handler", ValType::ref_null(HANDLER_FRAME));
        f.extend([
            Instr::local_get("env"),
            Instr::ref_cast(&env.type_name),
            Instr::local_set("e"),
        ]);
        for field in &env.fields {
            let local = match field.kind {
                FieldKind::Site => continue,
                FieldKind::Handler => "handler",
                FieldKind::Continuation => "k",
                FieldKind::TailGuard => "k.resumed",
                FieldKind::Capture => field.name.as_str(),
            };
            f.local(local, field.storage.clone());
            f.extend([
                Instr::local_get("e"),
                Instr::struct_get(&env.type_name, &field.name),
                Instr::local_set(local),
            ]);
        }
        f.emit(Instr::local_get("value"));
        f.extend(unbox_value(&site.resume_value_type));

        let mut cx = self.cx(f);
        cx.guarded = env.has_tail_guard();
        compiler.compile_resume(&mut cx, site)?;
        cx.finish(module)
    }

    fn emit_handler(
        &self,
        module: &mut Module,
        compiler: &mut dyn ExprCompiler,
        handler: &HandlerInfo,
    ) -> Result<(), LoweringError> {
        let prefix = self.handler_prefix(handler)?;
        trace!(handler = %handler.expr, %prefix, "lowering handler");

        // Body under the extended chain.
        let mut body = FunctionBuilder::new(format!("{}.body", prefix));
        body.param("handler", ValType::ref_null(HANDLER_FRAME))
            .result(ValType::ref_to(OUTCOME));
        let mut cx = self.cx(body);
        compiler.compile_expr(&mut cx, handler.body, &Target::Outcome)?;
        cx.finish(module)?;

        for clause in &handler.clauses {
            let name = self.clause_fn_name(handler, clause.index)?;
            let mut f = FunctionBuilder::new(name);
            f.param("frame", ValType::ref_to(HANDLER_FRAME))
                .param("env", ValType::anyref())
                .param("request", ValType::ref_to(EFFECT_REQUEST))
                .result(ValType::ref_to(OUTCOME))
                .local("handler", ValType::ref_null(HANDLER_FRAME))
                .local("k", ValType::ref_null(CONT_FRAME));
            f.extend([
                Instr::local_get("env"),
                Instr::ref_cast(CONT_ENV),
                Instr::struct_get(CONT_ENV, "handler"),
                Instr::local_set("handler"),
                Instr::local_get("request"),
                Instr::struct_get(EFFECT_REQUEST, "cont"),
                Instr::local_set("k"),
            ]);
            let guarded = clause.needs_tail_guard();
            if guarded {
                f.local("k.resumed", ValType::I32);
            }
            unpack_params(&mut f, &clause.params);

            let mut cx = self.cx(f);
            cx.guarded = guarded;
            compiler.compile_expr(&mut cx, clause.body, &Target::Outcome)?;
            cx.finish(module)?;
        }

        if let Some(finally) = handler.finally {
            let mut f = FunctionBuilder::new(format!("{}.finally", prefix));
            f.param("handler", ValType::ref_null(HANDLER_FRAME));
            let mut cx = self.cx(f);
            compiler.compile_expr(&mut cx, finally, &Target::Value(SemType::Unit))?;
            cx.builder.emit(Instr::Drop);
            cx.finish(module)?;
        }

        module.add_function(self.handler_done(handler, &prefix))?;
        module.add_function(self.handler_run(handler, &prefix)?)?;
        Ok(())
    }

    /// Resumption point once the handled body completes after a request
    /// escaped the handler.
    fn handler_done(&self, handler: &HandlerInfo, prefix: &str) -> Function {
        let mut f = FunctionBuilder::new(format!("{}.done", prefix));
        f.param("env", ValType::ref_to(CONT_ENV))
            .param("value", ValType::anyref())
            .result(ValType::ref_to(OUTCOME));
        if handler.finally.is_some() {
            f.extend([
                Instr::local_get("env"),
                Instr::struct_get(CONT_ENV, "handler"),
                Instr::Call(format!("{}.finally", prefix)),
            ]);
        }
        f.extend([Instr::local_get("value"), Instr::call(OUTCOME_VALUE)]);
        f.finish()
    }

    fn handler_run(&self, handler: &HandlerInfo, prefix: &str) -> Result<Function, LoweringError> {
        let mut f = FunctionBuilder::new(format!("{}.run", prefix));
        f.param("handler", ValType::ref_null(HANDLER_FRAME))
            .result(ValType::ref_to(OUTCOME))
            .local("chain", ValType::ref_null(HANDLER_FRAME))
            .local("clause.env", ValType::anyref())
            .local("out", ValType::ref_null(OUTCOME));

        // Clauses run under the chain the handler was entered with.
        f.extend([
            Instr::I32Const(-1),
            Instr::local_get("handler"),
            Instr::struct_new(CONT_ENV),
            Instr::local_set("clause.env"),
            Instr::local_get("handler"),
        ]);
        for clause in handler.clauses.iter().filter(|c| c.installs_frame) {
            f.extend([
                Instr::I32Const(clause.effect_id.0 as i32),
                Instr::I32Const(clause.op_id.0 as i32),
                Instr::I32Const(clause.resume.as_u32() as i32),
                Instr::RefFunc(self.clause_fn_name(handler, clause.index)?),
                Instr::local_get("clause.env"),
                Instr::call(FRAME_PUSH),
            ]);
        }
        f.extend([
            Instr::local_set("chain"),
            Instr::local_get("chain"),
            Instr::Call(format!("{}.body", prefix)),
            Instr::local_set("out"),
            Instr::local_get("chain"),
            Instr::local_get("out"),
            Instr::RefAsNonNull,
            Instr::call(DISPATCH),
            Instr::local_set("out"),
            Instr::local_get("out"),
            Instr::struct_get(OUTCOME, "tag"),
            Instr::I32Const(TAG_REQUEST),
            Instr::I32Eq,
            Instr::when(vec![
                Instr::local_get("out"),
                Instr::struct_get(OUTCOME, "request"),
                Instr::RefAsNonNull,
                Instr::RefFunc(format!("{}.done", prefix)),
                Instr::I32Const(-1),
                Instr::local_get("chain"),
                Instr::struct_new(CONT_ENV),
                Instr::ref_null(CONT_FRAME),
                Instr::ref_null(CONT_FRAME),
                Instr::struct_new(CONT_FRAME),
                Instr::call(CONT_PUSH),
                Instr::local_get("out"),
                Instr::RefAsNonNull,
                Instr::Return,
            ]),
        ]);
        if handler.finally.is_some() {
            f.extend([
                Instr::local_get("chain"),
                Instr::Call(format!("{}.finally", prefix)),
            ]);
        }
        f.extend([Instr::local_get("out"), Instr::RefAsNonNull]);
        Ok(f.finish())
    }
}

/// `<env>.resume`
pub fn resume_fn_name(site: &ContinuationSite) -> String {
    format!("{}.resume", site.env.type_name)
}

/// Unpack a request payload into clause parameter locals.
fn unpack_params(f: &mut FunctionBuilder, params: &[Param]) {
    let arity = params.len();
    for (i, param) in params.iter().enumerate() {
        f.local(&param.name, lower_storage(&param.ty));
        f.extend([Instr::local_get("request"), Instr::struct_get(EFFECT_REQUEST, "payload")]);
        if arity > 1 {
            f.extend([
                Instr::ref_cast(PAYLOAD),
                Instr::I32Const(i as i32),
                Instr::ArrayGet(PAYLOAD.to_string()),
            ]);
        }
        f.extend(unbox_value(&param.ty));
        f.emit(Instr::local_set(&param.name));
    }
}

/// Function-level lowering context handed to an [`ExprCompiler`].
#[derive(Debug)]
pub struct LowerCx<'a> {
    lowering: EffectLowering<'a>,
    pub builder: FunctionBuilder,
    /// Resumptions check and set `k.resumed`.
    guarded: bool,
    imports: Vec<Import>,
}

impl<'a> LowerCx<'a> {
    pub fn lowering(&self) -> EffectLowering<'a> {
        self.lowering
    }

    pub fn is_guarded(&self) -> bool {
        self.guarded
    }

    /// Declare an import the function needs.
    pub fn require_import(&mut self, import: Import) {
        if !self.imports.iter().any(|i| i.name == import.name) {
            self.imports.push(import);
        }
    }

    /// Add the imports and the finished function to `module`.
    pub fn finish(self, module: &mut Module) -> Result<(), LoweringError> {
        for import in self.imports {
            module.import_func(&import.module, &import.field, &import.name, import.params, import.results)?;
        }
        module.add_function(self.builder.finish())?;
        Ok(())
    }

    fn site(&self, expr: ExprId) -> Result<&'a ContinuationSite, LoweringError> {
        self.lowering.sites.site(expr).ok_or(LoweringError::MissingSite { expr })
    }

    /// Lower a perform. Control never falls through.
    pub fn lower_perform(&mut self, compiler: &mut dyn ExprCompiler, expr: ExprId) -> Result<(), LoweringError> {
        let mir = self.lowering.mir;
        let perform = mir.perform(expr).ok_or(LoweringError::NotA {
            expr,
            expected: "perform",
        })?;
        let op = mir.operation(perform.op).ok_or(LoweringError::NotA {
            expr,
            expected: "perform of a known operation",
        })?;
        let site = self.site(expr)?;

        self.builder.extend([
            Instr::local_get("handler"),
            Instr::I32Const(op.effect_id.0 as i32),
            Instr::I32Const(op.op_id.0 as i32),
            Instr::I32Const(op.resume.as_u32() as i32),
        ]);
        self.payload(compiler, &perform.args)?;
        self.builder.emit(Instr::call(PERFORM));
        self.suspend(site);
        Ok(())
    }

    /// Lower an effectful call; leaves the callee's value.
    pub fn lower_call(&mut self, compiler: &mut dyn ExprCompiler, expr: ExprId) -> Result<(), LoweringError> {
        let mir = self.lowering.mir;
        let call = mir.call(expr).ok_or(LoweringError::NotA {
            expr,
            expected: "call",
        })?;
        let site = self.site(expr)?;

        self.builder.emit(Instr::local_get("handler"));
        for arg in &call.args {
            compiler.compile_expr(self, arg.expr, &Target::Value(arg.ty.clone()))?;
        }
        compiler.compile_callee(self, call)?;
        self.continue_or_suspend(Some(site), &call.result);
        Ok(())
    }

    /// Lower a handler expression; leaves the handler's value.
    ///
    /// A request escaping every clause propagates out of the current
    /// function.
    pub fn lower_handler(&mut self, expr: ExprId) -> Result<(), LoweringError> {
        let mir = self.lowering.mir;
        let handler = mir.handler(expr).ok_or(LoweringError::NotA {
            expr,
            expected: "handler expression",
        })?;
        let prefix = self.lowering.handler_prefix(handler)?;
        self.builder.extend([
            Instr::local_get("handler"),
            Instr::Call(format!("{}.run", prefix)),
        ]);
        self.continue_or_suspend(None, &handler.result);
        Ok(())
    }

    /// Resume the clause's continuation with the value of `ty` on the
    /// stack; leaves the outcome. Guarded clauses trap on a second
    /// resumption.
    pub fn resume_continuation(&mut self, ty: &SemType) {
        self.builder.local("resume.value", ValType::anyref());
        self.builder.extend(box_value(ty));
        self.builder.emit(Instr::local_set("resume.value"));
        if self.guarded {
            self.builder.extend([
                Instr::local_get("k.resumed"),
                Instr::when(vec![Instr::Unreachable]),
                Instr::I32Const(1),
                Instr::local_set("k.resumed"),
            ]);
        }
        self.builder.extend([
            Instr::local_get("k"),
            Instr::local_get("resume.value"),
            Instr::call(CONT_RESUME),
        ]);
    }

    /// Complete the current body with the value of `ty` on the stack.
    pub fn complete(&mut self, ty: &SemType) {
        self.builder.extend(box_value(ty));
        self.builder.emit(Instr::call(OUTCOME_VALUE));
    }

    /// Zero arguments travel as null, one as itself, more as a payload
    /// array.
    fn payload(&mut self, compiler: &mut dyn ExprCompiler, args: &[Operand]) -> Result<(), LoweringError> {
        if args.is_empty() {
            self.builder.emit(Instr::RefNull(HeapType::Any));
            return Ok(());
        }
        for arg in args {
            compiler.compile_expr(self, arg.expr, &Target::Value(arg.ty.clone()))?;
            self.builder.extend(box_value(&arg.ty));
        }
        if args.len() > 1 {
            self.builder.emit(Instr::ArrayNewFixed {
                ty: PAYLOAD.to_string(),
                len: args.len() as u32,
            });
        }
        Ok(())
    }

    /// With an outcome on the stack: suspend if it is a request, otherwise
    /// leave its value unboxed to `result`.
    fn continue_or_suspend(&mut self, site: Option<&ContinuationSite>, result: &SemType) {
        self.builder.local("suspend.out", ValType::ref_null(OUTCOME));
        let mut on_request = Vec::new();
        if let Some(site) = site {
            on_request.extend(self.push_frame(site));
        }
        on_request.extend([
            Instr::local_get("suspend.out"),
            Instr::RefAsNonNull,
            Instr::Return,
        ]);
        self.builder.extend([
            Instr::local_set("suspend.out"),
            Instr::local_get("suspend.out"),
            Instr::struct_get(OUTCOME, "tag"),
            Instr::I32Const(TAG_REQUEST),
            Instr::I32Eq,
            Instr::when(on_request),
            Instr::local_get("suspend.out"),
            Instr::struct_get(OUTCOME, "value"),
        ]);
        self.builder.extend(unbox_value(result));
    }

    /// With a request outcome on the stack: append the site's frame and
    /// return it.
    fn suspend(&mut self, site: &ContinuationSite) {
        self.builder.local("suspend.out", ValType::ref_null(OUTCOME));
        self.builder.emit(Instr::local_set("suspend.out"));
        let frame = self.push_frame(site);
        self.builder.extend(frame);
        self.builder.extend([
            Instr::local_get("suspend.out"),
            Instr::RefAsNonNull,
            Instr::Return,
        ]);
    }

    /// Save the live state into the site's environment and append its
    /// frame to the request held in `suspend.out`.
    fn push_frame(&mut self, site: &ContinuationSite) -> Vec<Instr> {
        let env = &site.env;
        let mut code = vec![
            Instr::local_get("suspend.out"),
            Instr::struct_get(OUTCOME, "request"),
            Instr::RefAsNonNull,
            Instr::RefFunc(resume_fn_name(site)),
        ];
        for field in &env.fields {
            match field.kind {
                FieldKind::Site => code.push(Instr::I32Const(site.site_id as i32)),
                FieldKind::Handler => code.push(Instr::local_get("handler")),
                FieldKind::Continuation => code.push(Instr::local_get("k")),
                FieldKind::TailGuard => code.push(Instr::local_get("k.resumed")),
                FieldKind::Capture => {
                    self.builder.local(&field.name, field.storage.clone());
                    code.push(Instr::local_get(&field.name));
                }
            }
        }
        code.extend([
            Instr::struct_new(&env.type_name),
            Instr::ref_null(CONT_FRAME),
            Instr::ref_null(CONT_FRAME),
            Instr::struct_new(CONT_FRAME),
            Instr::call(CONT_PUSH),
        ]);
        code
    }
}

/// Compiles every non-effect expression as a call to an import of
/// [`EXPR_MODULE`] named `e<expr>`, and every effect construct through the
/// lowering. Used when the front end hands over only the effect model.
#[derive(Debug, Default)]
pub struct ImportExprCompiler {
    compiled: usize,
}

impl ImportExprCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of expressions compiled as imports.
    pub fn opaque_count(&self) -> usize {
        self.compiled
    }
}

impl ExprCompiler for ImportExprCompiler {
    fn compile_expr(&mut self, cx: &mut LowerCx<'_>, expr: ExprId, target: &Target) -> Result<(), LoweringError> {
        let mir = cx.lowering().mir();
        if mir.perform(expr).is_some() {
            return cx.lower_perform(self, expr);
        }
        if mir.call(expr).is_some_and(|c| c.effectful) {
            cx.lower_call(self, expr)?;
            if target == &Target::Outcome {
                let result = mir.call(expr).map(|c| c.result.clone()).unwrap_or(SemType::Unit);
                cx.complete(&result);
            }
            return Ok(());
        }
        if let Some(handler) = mir.handler(expr) {
            cx.lower_handler(expr)?;
            if target == &Target::Outcome {
                cx.complete(&handler.result);
            }
            return Ok(());
        }

        self.compiled += 1;
        let field = format!("e{}", expr.0);
        let (params, results) = match target {
            Target::Value(ty) => (Vec::new(), vec![lower_storage(ty)]),
            Target::Outcome => (
                vec![ValType::ref_null(HANDLER_FRAME)],
                vec![ValType::ref_to(abi::OUTCOME)],
            ),
        };
        // One import per expression and shape.
        let name = match target {
            Target::Value(_) => format!("rill.expr.{}", field),
            Target::Outcome => format!("rill.expr.{}.outcome", field),
        };
        if target == &Target::Outcome {
            cx.builder.emit(Instr::local_get("handler"));
        }
        cx.builder.emit(Instr::Call(name.clone()));
        cx.require_import(Import {
            module: EXPR_MODULE.to_string(),
            field,
            name,
            params,
            results,
        });
        Ok(())
    }
}
