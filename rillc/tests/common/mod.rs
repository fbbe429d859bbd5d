//! Program fixtures shared by the integration tests.

#![allow(dead_code)]

use rill_runtime::ResumeKind;
use rillc::effects::{ExprCompiler, ImportExprCompiler, LowerCx, LoweringError, Target};
use rillc::model::{
    CallExpr, Capture, CaptureSource, ClauseDecl, DefId, EffectDecl, EffectRow, Enforcement, ExprId, FunctionDecl,
    FunctionKind, HandlerExpr, Operand, OperationDecl, PerformExpr, ProgramModel, SemType, SiteContext,
    TailJudgment,
};
use rillc::span::Span;

fn function(def: u32, name: &str, row: Option<EffectRow>, body: Option<u32>) -> FunctionDecl {
    FunctionDecl {
        def: DefId(def),
        name: name.to_string(),
        kind: FunctionKind::Function,
        parent: None,
        effect_row: row,
        body: body.map(ExprId),
        span: Span::dummy(),
    }
}

fn op(def: u32, name: &str, effect: u32, params: Vec<SemType>, ret: SemType) -> OperationDecl {
    OperationDecl {
        def: DefId(def),
        name: name.to_string(),
        lexical_effect: Some(DefId(effect)),
        owner_effect: None,
        resume: ResumeKind::Tail,
        params,
        ret,
        span: Span::dummy(),
    }
}

fn context(function: u32, handler: Option<u32>, live: Vec<Capture>) -> SiteContext {
    SiteContext {
        function: DefId(function),
        clause: None,
        enclosing_handler: handler.map(ExprId),
        live,
    }
}

/// `Time` is a host effect. `main` sleeps for an i64 duration produced
/// by expression 4; `now` is only declared.
pub fn clock_module(module: &str, sleep_arg: SemType) -> ProgramModel {
    let mut p = ProgramModel::new(module);
    p.effects = vec![EffectDecl {
        def: DefId(1),
        name: "rill.time".into(),
        label: "Time".into(),
        host: true,
        span: Span::dummy(),
    }];
    p.operations = vec![
        op(2, "sleep", 1, vec![SemType::I64], SemType::Unit),
        op(3, "now", 1, vec![], SemType::I64),
    ];
    p.functions = vec![function(10, "main", None, Some(5))];
    p.performs = vec![PerformExpr {
        expr: ExprId(5),
        op: Some(DefId(2)),
        op_name: "sleep".into(),
        effect: None,
        args: vec![Operand {
            expr: ExprId(4),
            ty: sleep_arg,
        }],
        result: SemType::Unit,
        context: context(10, None, vec![]),
        span: Span::new(40, 58),
    }];
    p
}

/// `Store` is a host effect whose ops all cross packed: `main` performs
/// `put(string, i32) -> bool` and `tally` performs `total(i64[]) -> i64`.
pub fn store_module(module: &str) -> ProgramModel {
    let mut p = ProgramModel::new(module);
    p.effects = vec![EffectDecl {
        def: DefId(1),
        name: "app.store".into(),
        label: "Store".into(),
        host: true,
        span: Span::dummy(),
    }];
    let numbers = SemType::Array(Box::new(SemType::I64));
    p.operations = vec![
        op(2, "put", 1, vec![SemType::Str, SemType::I32], SemType::Bool),
        op(3, "total", 1, vec![numbers.clone()], SemType::I64),
    ];
    p.functions = vec![function(10, "main", None, Some(5)), function(11, "tally", None, Some(7))];
    let operand = |expr: u32, ty: SemType| Operand { expr: ExprId(expr), ty };
    p.performs = vec![
        PerformExpr {
            expr: ExprId(5),
            op: Some(DefId(2)),
            op_name: "put".into(),
            effect: None,
            args: vec![operand(3, SemType::Str), operand(4, SemType::I32)],
            result: SemType::Bool,
            context: context(10, None, vec![]),
            span: Span::new(10, 30),
        },
        PerformExpr {
            expr: ExprId(7),
            op: Some(DefId(3)),
            op_name: "total".into(),
            effect: None,
            args: vec![operand(6, numbers)],
            result: SemType::I64,
            context: context(11, None, vec![]),
            span: Span::new(40, 60),
        },
    ];
    p
}

/// `asks` performs `Ask.get`; `run` handles `Ask` around a call to
/// it and keeps a temporary live across the call; `helper` is pure.
pub fn ask_module(module: &str) -> ProgramModel {
    let mut p = ProgramModel::new(module);
    p.effects = vec![EffectDecl {
        def: DefId(1),
        name: "app.ask".into(),
        label: "Ask".into(),
        host: false,
        span: Span::dummy(),
    }];
    p.operations = vec![op(2, "get", 1, vec![], SemType::I32)];
    p.functions = vec![
        function(10, "asks", Some(EffectRow::single_effect(DefId(1))), Some(41)),
        function(11, "run", None, None),
        function(12, "helper", Some(EffectRow::pure()), None),
    ];
    p.performs = vec![PerformExpr {
        expr: ExprId(41),
        op: Some(DefId(2)),
        op_name: "get".into(),
        effect: None,
        args: vec![],
        result: SemType::I32,
        context: context(10, None, vec![]),
        span: Span::new(100, 115),
    }];
    p.calls = vec![
        CallExpr {
            expr: ExprId(32),
            callee: Some(DefId(10)),
            effect_row: None,
            args: vec![],
            result: SemType::I32,
            context: context(
                11,
                Some(30),
                vec![Capture {
                    source: CaptureSource::Tmp(1),
                    ty: SemType::I64,
                    mutable: false,
                }],
            ),
            span: Span::new(200, 211),
        },
        CallExpr {
            expr: ExprId(33),
            callee: Some(DefId(12)),
            effect_row: None,
            args: vec![],
            result: SemType::I32,
            context: context(11, None, vec![]),
            span: Span::new(220, 228),
        },
    ];
    p.handlers = vec![HandlerExpr {
        expr: ExprId(30),
        owner: DefId(11),
        body: ExprId(31),
        effect_row: EffectRow::single_effect(DefId(1)),
        clauses: vec![ClauseDecl {
            op: Some(DefId(2)),
            op_name: "get".into(),
            effect: None,
            resume: ResumeKind::Tail,
            params: vec![],
            body: ExprId(35),
            tail: Some(TailJudgment {
                enforcement: Enforcement::Static,
                calls: 1,
                escapes: false,
            }),
            span: Span::dummy(),
        }],
        forward_unhandled: false,
        finally: None,
        enclosing_handler: None,
        result: SemType::I32,
        span: Span::dummy(),
    }];
    p
}

/// Handler body 31 is the call at 32; everything else goes through the
/// import compiler.
#[derive(Default)]
pub struct BodyCompiler {
    inner: ImportExprCompiler,
}

impl ExprCompiler for BodyCompiler {
    fn compile_expr(&mut self, cx: &mut LowerCx<'_>, expr: ExprId, target: &Target) -> Result<(), LoweringError> {
        let expr = if expr == ExprId(31) { ExprId(32) } else { expr };
        self.inner.compile_expr(cx, expr, target)
    }
}
