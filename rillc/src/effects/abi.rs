//! # Runtime ABI
//!
//! The data types and helper functions every effectful module relies on:
//!
//! ```text
//! (rec
//!   $rill.ContEnv       (sub (struct site handler))
//!   $rill.ClauseFn      (func (ref HandlerFrame) anyref (ref EffectRequest) -> (ref Outcome))
//!   $rill.ResumeFn      (func (ref ContEnv) anyref -> (ref Outcome))
//!   $rill.HandlerFrame  (struct effect_id op_id resume_kind clause clause_env prev)
//!   $rill.ContFrame     (struct resume env (mut next) (mut tail))
//!   $rill.EffectRequest (struct effect_id op_id resume_kind handler payload (mut cont))
//!   $rill.Outcome       (struct tag value request))
//! ```
//!
//! An effectful function takes the current handler chain as its first
//! parameter and returns `(ref $rill.Outcome)`. A `Request` outcome carries
//! the chain it was performed under; `rill.dispatch` walks that chain
//! innermost first and restarts with whatever the matching clause returns.
//!
//! The helper functions are defined by exactly one module of a linked
//! program. Every other module declares the same type group and imports
//! the helpers from the owner.

use tracing::debug;

use crate::model::SemType;
use crate::substrate::{
    AbiOwnership, BuildRegistry, FieldType, FunctionBuilder, HeapType, Instr, Module, ModuleError, RefType, TypeDef,
    TypeGroup, ValType,
};

pub const CONT_ENV: &str = "rill.ContEnv";
pub const CLAUSE_FN: &str = "rill.ClauseFn";
pub const RESUME_FN: &str = "rill.ResumeFn";
pub const HANDLER_FRAME: &str = "rill.HandlerFrame";
pub const CONT_FRAME: &str = "rill.ContFrame";
pub const EFFECT_REQUEST: &str = "rill.EffectRequest";
pub const OUTCOME: &str = "rill.Outcome";
/// Argument tuple of a multi-argument perform.
pub const PAYLOAD: &str = "rill.Payload";

pub const BOX_I32: &str = "rill.Box.i32";
pub const BOX_I64: &str = "rill.Box.i64";
pub const BOX_F32: &str = "rill.Box.f32";
pub const BOX_F64: &str = "rill.Box.f64";
pub const BOX_FUNC: &str = "rill.Box.func";

pub const OUTCOME_VALUE: &str = "rill.outcome.value";
pub const OUTCOME_REQUEST: &str = "rill.outcome.request";
pub const FRAME_PUSH: &str = "rill.frame.push";
pub const PERFORM: &str = "rill.perform";
pub const CONT_PUSH: &str = "rill.cont.push";
pub const CONT_RESUME: &str = "rill.cont.resume";
pub const DISPATCH: &str = "rill.dispatch";
pub const EXPECT_VALUE: &str = "rill.expect_value";

/// Import module of host-provided functions.
pub const HOST_MODULE: &str = "rill:host";
pub const UNHANDLED: &str = "rill.host.unhandled";

pub const TAG_VALUE: i32 = 0;
pub const TAG_REQUEST: i32 = 1;

/// Helper functions in emission order.
pub const HELPERS: [&str; 8] = [
    OUTCOME_VALUE,
    OUTCOME_REQUEST,
    FRAME_PUSH,
    PERFORM,
    CONT_PUSH,
    CONT_RESUME,
    DISPATCH,
    EXPECT_VALUE,
];

fn handler_ref() -> ValType {
    ValType::ref_null(HANDLER_FRAME)
}

fn outcome_ref() -> ValType {
    ValType::ref_to(OUTCOME)
}

/// The recursive ABI type group.
pub fn abi_types() -> TypeGroup {
    TypeGroup::rec(vec![
        TypeDef::Struct {
            name: CONT_ENV.into(),
            fields: env_prefix(),
            supertype: None,
            is_final: false,
        },
        TypeDef::Func {
            name: CLAUSE_FN.into(),
            params: vec![
                ValType::ref_to(HANDLER_FRAME),
                ValType::anyref(),
                ValType::ref_to(EFFECT_REQUEST),
            ],
            results: vec![outcome_ref()],
        },
        TypeDef::Func {
            name: RESUME_FN.into(),
            params: vec![ValType::ref_to(CONT_ENV), ValType::anyref()],
            results: vec![outcome_ref()],
        },
        TypeDef::Struct {
            name: HANDLER_FRAME.into(),
            fields: vec![
                FieldType::new("effect_id", ValType::I32),
                FieldType::new("op_id", ValType::I32),
                FieldType::new("resume_kind", ValType::I32),
                FieldType::new("clause", ValType::ref_to(CLAUSE_FN)),
                FieldType::new("clause_env", ValType::anyref()),
                FieldType::new("prev", handler_ref()),
            ],
            supertype: None,
            is_final: true,
        },
        TypeDef::Struct {
            name: CONT_FRAME.into(),
            fields: vec![
                FieldType::new("resume", ValType::ref_to(RESUME_FN)),
                FieldType::new("env", ValType::ref_to(CONT_ENV)),
                FieldType::mutable("next", ValType::ref_null(CONT_FRAME)),
                FieldType::mutable("tail", ValType::ref_null(CONT_FRAME)),
            ],
            supertype: None,
            is_final: true,
        },
        TypeDef::Struct {
            name: EFFECT_REQUEST.into(),
            fields: vec![
                FieldType::new("effect_id", ValType::I32),
                FieldType::new("op_id", ValType::I32),
                FieldType::new("resume_kind", ValType::I32),
                FieldType::new("handler", handler_ref()),
                FieldType::new("payload", ValType::anyref()),
                FieldType::mutable("cont", ValType::ref_null(CONT_FRAME)),
            ],
            supertype: None,
            is_final: true,
        },
        TypeDef::Struct {
            name: OUTCOME.into(),
            fields: vec![
                FieldType::new("tag", ValType::I32),
                FieldType::new("value", ValType::anyref()),
                FieldType::new("request", ValType::ref_null(EFFECT_REQUEST)),
            ],
            supertype: None,
            is_final: true,
        },
    ])
}

/// Fields every continuation environment starts with.
pub fn env_prefix() -> Vec<FieldType> {
    vec![
        FieldType::new("site", ValType::I32),
        FieldType::new("handler", handler_ref()),
    ]
}

fn box_types() -> Vec<TypeDef> {
    let boxed = |name: &str, ty: ValType| TypeDef::Struct {
        name: name.into(),
        fields: vec![FieldType::new("value", ty)],
        supertype: None,
        is_final: true,
    };
    vec![
        boxed(BOX_I32, ValType::I32),
        boxed(BOX_I64, ValType::I64),
        boxed(BOX_F32, ValType::F32),
        boxed(BOX_F64, ValType::F64),
        boxed(BOX_FUNC, ValType::funcref()),
        TypeDef::Array {
            name: PAYLOAD.into(),
            elem: ValType::anyref(),
            mutable: false,
        },
    ]
}

/// Declare the ABI types in `module`.
pub fn declare_abi_types(module: &mut Module) -> Result<(), ModuleError> {
    module.declare_group(abi_types())?;
    for def in box_types() {
        module.declare_type(def)?;
    }
    Ok(())
}

/// Parameter and result types of each helper.
fn helper_signature(name: &str) -> (Vec<ValType>, Vec<ValType>) {
    match name {
        OUTCOME_VALUE => (vec![ValType::anyref()], vec![outcome_ref()]),
        OUTCOME_REQUEST => (vec![ValType::ref_to(EFFECT_REQUEST)], vec![outcome_ref()]),
        FRAME_PUSH => (
            vec![
                handler_ref(),
                ValType::I32,
                ValType::I32,
                ValType::I32,
                ValType::ref_to(CLAUSE_FN),
                ValType::anyref(),
            ],
            vec![ValType::ref_to(HANDLER_FRAME)],
        ),
        PERFORM => (
            vec![handler_ref(), ValType::I32, ValType::I32, ValType::I32, ValType::anyref()],
            vec![outcome_ref()],
        ),
        CONT_PUSH => (vec![ValType::ref_to(EFFECT_REQUEST), ValType::ref_to(CONT_FRAME)], vec![]),
        CONT_RESUME => (vec![ValType::ref_null(CONT_FRAME), ValType::anyref()], vec![outcome_ref()]),
        DISPATCH => (vec![handler_ref(), outcome_ref()], vec![outcome_ref()]),
        EXPECT_VALUE => (vec![outcome_ref()], vec![ValType::anyref()]),
        _ => (vec![], vec![]),
    }
}

/// Make the runtime ABI available in `module`.
///
/// The first module to ask defines the helpers; later modules import them
/// from it.
pub fn ensure_runtime_abi(module: &mut Module, registry: &mut BuildRegistry) -> Result<AbiOwnership, ModuleError> {
    declare_abi_types(module)?;
    let ownership = registry.claim_abi(module.name());
    match &ownership {
        AbiOwnership::Define => {
            if !module.has_function(DISPATCH) {
                emit_helpers(module)?;
                debug!(module = module.name(), "emitted runtime ABI");
            }
        }
        AbiOwnership::Import { from } => {
            for name in HELPERS {
                let (params, results) = helper_signature(name);
                module.import_func(from, name, name, params, results)?;
            }
        }
    }
    Ok(ownership)
}

fn emit_helpers(module: &mut Module) -> Result<(), ModuleError> {
    module.import_func(
        HOST_MODULE,
        "unhandled",
        UNHANDLED,
        vec![ValType::I32, ValType::I32, ValType::I32],
        vec![],
    )?;
    module.add_function(outcome_value())?;
    module.add_function(outcome_request())?;
    module.add_function(frame_push())?;
    module.add_function(perform())?;
    module.add_function(cont_push())?;
    module.add_function(cont_resume())?;
    module.add_function(dispatch())?;
    module.add_function(expect_value())?;
    for name in HELPERS {
        module.export(name, name)?;
    }
    Ok(())
}

fn builder(name: &str, params: &[&str]) -> FunctionBuilder {
    let (types, results) = helper_signature(name);
    let mut f = FunctionBuilder::new(name);
    for (param, ty) in params.iter().zip(types) {
        f.param(param, ty);
    }
    for ty in results {
        f.result(ty);
    }
    f
}

fn get(name: &str) -> Instr {
    Instr::local_get(name)
}

fn set(name: &str) -> Instr {
    Instr::local_set(name)
}

fn outcome_value() -> crate::substrate::Function {
    let mut f = builder(OUTCOME_VALUE, &["value"]);
    f.extend([
        Instr::I32Const(TAG_VALUE),
        get("value"),
        Instr::ref_null(EFFECT_REQUEST),
        Instr::struct_new(OUTCOME),
    ]);
    f.finish()
}

fn outcome_request() -> crate::substrate::Function {
    let mut f = builder(OUTCOME_REQUEST, &["request"]);
    f.extend([
        Instr::I32Const(TAG_REQUEST),
        Instr::RefNull(HeapType::Any),
        get("request"),
        Instr::struct_new(OUTCOME),
    ]);
    f.finish()
}

fn frame_push() -> crate::substrate::Function {
    let mut f = builder(
        FRAME_PUSH,
        &["prev", "effect_id", "op_id", "resume_kind", "clause", "clause_env"],
    );
    f.extend([
        get("effect_id"),
        get("op_id"),
        get("resume_kind"),
        get("clause"),
        get("clause_env"),
        get("prev"),
        Instr::struct_new(HANDLER_FRAME),
    ]);
    f.finish()
}

fn perform() -> crate::substrate::Function {
    let mut f = builder(PERFORM, &["handler", "effect_id", "op_id", "resume_kind", "payload"]);
    f.extend([
        get("effect_id"),
        get("op_id"),
        get("resume_kind"),
        get("handler"),
        get("payload"),
        Instr::ref_null(CONT_FRAME),
        Instr::struct_new(EFFECT_REQUEST),
        Instr::call(OUTCOME_REQUEST),
    ]);
    f.finish()
}

/// Append `frame` as the outermost frame of the request's continuation.
fn cont_push() -> crate::substrate::Function {
    let mut f = builder(CONT_PUSH, &["request", "frame"]);
    f.extend([
        get("request"),
        Instr::struct_get(EFFECT_REQUEST, "cont"),
        Instr::RefIsNull,
        Instr::If {
            result: None,
            then: vec![
                get("frame"),
                get("frame"),
                Instr::struct_set(CONT_FRAME, "tail"),
                get("request"),
                get("frame"),
                Instr::struct_set(EFFECT_REQUEST, "cont"),
            ],
            otherwise: vec![
                get("request"),
                Instr::struct_get(EFFECT_REQUEST, "cont"),
                Instr::struct_get(CONT_FRAME, "tail"),
                get("frame"),
                Instr::struct_set(CONT_FRAME, "next"),
                get("request"),
                Instr::struct_get(EFFECT_REQUEST, "cont"),
                get("frame"),
                Instr::struct_set(CONT_FRAME, "tail"),
            ],
        },
    ]);
    f.finish()
}

/// Resume a continuation chain innermost first.
///
/// If a frame suspends again, the frames not yet run are appended to the
/// new request so the next resumption picks them up.
fn cont_resume() -> crate::substrate::Function {
    let mut f = builder(CONT_RESUME, &["cont", "value"]);
    f.local("tail", ValType::ref_null(CONT_FRAME))
        .local("out", ValType::ref_null(OUTCOME))
        .local("request", ValType::ref_null(EFFECT_REQUEST));

    let done = || Instr::when(vec![get("value"), Instr::call(OUTCOME_VALUE), Instr::Return]);

    f.extend([
        get("cont"),
        Instr::RefIsNull,
        done(),
        get("cont"),
        Instr::struct_get(CONT_FRAME, "tail"),
        set("tail"),
        Instr::Loop {
            label: "next".into(),
            body: vec![
                get("cont"),
                Instr::RefIsNull,
                done(),
                get("cont"),
                Instr::struct_get(CONT_FRAME, "env"),
                get("value"),
                get("cont"),
                Instr::struct_get(CONT_FRAME, "resume"),
                Instr::CallRef(RESUME_FN.into()),
                set("out"),
                get("cont"),
                Instr::struct_get(CONT_FRAME, "next"),
                set("cont"),
                get("out"),
                Instr::struct_get(OUTCOME, "tag"),
                Instr::I32Eqz,
                Instr::when(vec![
                    get("out"),
                    Instr::struct_get(OUTCOME, "value"),
                    set("value"),
                    Instr::Br("next".into()),
                ]),
                get("out"),
                Instr::struct_get(OUTCOME, "request"),
                set("request"),
                get("cont"),
                Instr::RefIsNull,
                Instr::I32Eqz,
                Instr::when(vec![
                    get("request"),
                    Instr::struct_get(EFFECT_REQUEST, "cont"),
                    Instr::RefIsNull,
                    Instr::If {
                        result: None,
                        then: vec![get("request"), get("cont"), Instr::struct_set(EFFECT_REQUEST, "cont")],
                        otherwise: vec![
                            get("request"),
                            Instr::struct_get(EFFECT_REQUEST, "cont"),
                            Instr::struct_get(CONT_FRAME, "tail"),
                            get("cont"),
                            Instr::struct_set(CONT_FRAME, "next"),
                        ],
                    },
                    get("request"),
                    Instr::struct_get(EFFECT_REQUEST, "cont"),
                    get("tail"),
                    Instr::struct_set(CONT_FRAME, "tail"),
                ]),
                get("out"),
                Instr::RefAsNonNull,
                Instr::Return,
            ],
        },
        Instr::Unreachable,
    ]);
    f.finish()
}

fn field_eq(field: &str) -> [Instr; 5] {
    [
        get("frame"),
        Instr::struct_get(HANDLER_FRAME, field),
        get("request"),
        Instr::struct_get(EFFECT_REQUEST, field),
        Instr::I32Eq,
    ]
}

/// The trampoline: walk the request's handler chain innermost first and
/// restart with the outcome of the first clause matching on
/// `(effect_id, op_id, resume_kind)`. A request nothing matches is returned
/// unchanged.
fn dispatch() -> crate::substrate::Function {
    let mut f = builder(DISPATCH, &["initial", "outcome"]);
    f.local("request", ValType::ref_null(EFFECT_REQUEST))
        .local("frame", handler_ref());

    let mut matches = Vec::new();
    matches.extend(field_eq("effect_id"));
    matches.extend(field_eq("op_id"));
    matches.push(Instr::I32And);
    matches.extend(field_eq("resume_kind"));
    matches.push(Instr::I32And);

    let mut walk = vec![get("frame"), Instr::RefIsNull, Instr::BrIf("bubble".into())];
    walk.extend(matches);
    walk.push(Instr::when(vec![
        get("frame"),
        Instr::RefAsNonNull,
        get("frame"),
        Instr::struct_get(HANDLER_FRAME, "clause_env"),
        get("request"),
        Instr::RefAsNonNull,
        get("frame"),
        Instr::struct_get(HANDLER_FRAME, "clause"),
        Instr::CallRef(CLAUSE_FN.into()),
        set("outcome"),
        Instr::Br("restart".into()),
    ]));
    walk.extend([
        get("frame"),
        Instr::struct_get(HANDLER_FRAME, "prev"),
        set("frame"),
        Instr::Br("walk".into()),
    ]);

    f.extend([
        Instr::Loop {
            label: "restart".into(),
            body: vec![
                get("outcome"),
                Instr::struct_get(OUTCOME, "tag"),
                Instr::I32Eqz,
                Instr::when(vec![get("outcome"), Instr::Return]),
                get("outcome"),
                Instr::struct_get(OUTCOME, "request"),
                set("request"),
                get("request"),
                Instr::struct_get(EFFECT_REQUEST, "handler"),
                set("frame"),
                get("frame"),
                Instr::RefIsNull,
                Instr::when(vec![get("initial"), set("frame")]),
                Instr::Block {
                    label: "bubble".into(),
                    result: None,
                    body: vec![Instr::Loop {
                        label: "walk".into(),
                        body: walk,
                    }],
                },
                get("outcome"),
                Instr::Return,
            ],
        },
        Instr::Unreachable,
    ]);
    f.finish()
}

/// Unwrap a final outcome at the program boundary; an escaping request
/// traps through the host.
fn expect_value() -> crate::substrate::Function {
    let mut f = builder(EXPECT_VALUE, &["outcome"]);
    f.local("request", ValType::ref_null(EFFECT_REQUEST));
    f.extend([
        get("outcome"),
        Instr::struct_get(OUTCOME, "tag"),
        Instr::I32Eqz,
        Instr::when(vec![get("outcome"), Instr::struct_get(OUTCOME, "value"), Instr::Return]),
        get("outcome"),
        Instr::struct_get(OUTCOME, "request"),
        set("request"),
        get("request"),
        Instr::struct_get(EFFECT_REQUEST, "effect_id"),
        get("request"),
        Instr::struct_get(EFFECT_REQUEST, "op_id"),
        get("request"),
        Instr::struct_get(EFFECT_REQUEST, "resume_kind"),
        Instr::call(UNHANDLED),
        Instr::Unreachable,
    ]);
    f.finish()
}

// ============================================================
// Value representation
// ============================================================

/// Storage type of a semantic type in records and locals.
pub fn lower_storage(ty: &SemType) -> ValType {
    match ty {
        SemType::Unit | SemType::Bool | SemType::I32 => ValType::I32,
        SemType::I64 => ValType::I64,
        SemType::F32 => ValType::F32,
        SemType::F64 => ValType::F64,
        SemType::Function => ValType::funcref(),
        SemType::Continuation => ValType::ref_null(CONT_FRAME),
        _ => ValType::anyref(),
    }
}

fn box_for(ty: &SemType) -> Option<&'static str> {
    match ty {
        SemType::Bool | SemType::I32 => Some(BOX_I32),
        SemType::I64 => Some(BOX_I64),
        SemType::F32 => Some(BOX_F32),
        SemType::F64 => Some(BOX_F64),
        SemType::Function => Some(BOX_FUNC),
        _ => None,
    }
}

/// Turn a value of `ty` on the stack into an `anyref`.
pub fn box_value(ty: &SemType) -> Vec<Instr> {
    match (ty, box_for(ty)) {
        (SemType::Unit, _) => vec![Instr::Drop, Instr::RefNull(HeapType::Any)],
        (_, Some(boxed)) => vec![Instr::struct_new(boxed)],
        (_, None) => Vec::new(),
    }
}

/// Turn an `anyref` on the stack back into a value of `ty`.
pub fn unbox_value(ty: &SemType) -> Vec<Instr> {
    match (ty, box_for(ty)) {
        (SemType::Unit, _) => vec![Instr::Drop, Instr::I32Const(0)],
        (_, Some(boxed)) => vec![Instr::ref_cast(boxed), Instr::struct_get(boxed, "value")],
        (SemType::Continuation, _) => vec![Instr::RefCast(RefType::nullable(HeapType::named(CONT_FRAME)))],
        (_, None) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::verify;

    #[test]
    fn test_owner_module_verifies() {
        let mut registry = BuildRegistry::new();
        let mut module = Module::new("main");
        assert_eq!(ensure_runtime_abi(&mut module, &mut registry).unwrap(), AbiOwnership::Define);
        verify(&module).unwrap();
        for name in HELPERS {
            assert!(module.function(name).is_some(), "{} missing", name);
        }
        assert!(module.import(UNHANDLED).is_some());
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let mut registry = BuildRegistry::new();
        let mut module = Module::new("main");
        ensure_runtime_abi(&mut module, &mut registry).unwrap();
        ensure_runtime_abi(&mut module, &mut registry).unwrap();
        assert_eq!(module.functions().len(), HELPERS.len());
    }

    #[test]
    fn test_second_module_imports_helpers() {
        let mut registry = BuildRegistry::new();
        let mut main = Module::new("main");
        let mut lib = Module::new("lib");
        ensure_runtime_abi(&mut main, &mut registry).unwrap();
        let ownership = ensure_runtime_abi(&mut lib, &mut registry).unwrap();

        assert_eq!(ownership, AbiOwnership::Import { from: "main".into() });
        assert!(lib.functions().is_empty());
        let dispatch = lib.import(DISPATCH).unwrap();
        assert_eq!(dispatch.module, "main");
        assert!(lib.type_def(HANDLER_FRAME).is_some());
        verify(&lib).unwrap();
    }

    #[test]
    fn test_dispatch_text_shape() {
        let mut registry = BuildRegistry::new();
        let mut module = Module::new("main");
        ensure_runtime_abi(&mut module, &mut registry).unwrap();
        let text = module.to_string();
        assert!(text.contains("(func $rill.dispatch (param $initial (ref null $rill.HandlerFrame))"));
        assert!(text.contains("call_ref $rill.ClauseFn"));
        assert!(text.contains("br_if $bubble"));
    }

    #[test]
    fn test_storage_lowering() {
        assert_eq!(lower_storage(&SemType::Bool), ValType::I32);
        assert_eq!(lower_storage(&SemType::Str), ValType::anyref());
        assert_eq!(lower_storage(&SemType::Continuation), ValType::ref_null(CONT_FRAME));
        assert_eq!(box_value(&SemType::I64), vec![Instr::struct_new(BOX_I64)]);
        assert!(unbox_value(&SemType::Str).is_empty());
    }
}
