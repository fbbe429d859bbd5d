//! # Host Boundary
//!
//! Operations of host-serviceable effects are implemented outside the
//! program. Each one gets a fixed host signature made of value kinds:
//!
//! | Semantic type | Slot |
//! |---------------|------|
//! | unit | `none` |
//! | bool, i32 | `i32` |
//! | i64 | `i64` |
//! | f32 | `f32` |
//! | f64 | `f64` |
//! | anything else | `packed` |
//!
//! A signature with any packed slot crosses the boundary as one packed
//! call: the import takes the [`codec::encode_args`] bytes of the whole
//! argument list and returns the codec bytes of the result. The host
//! provides `codec.encode` and `codec.decode` so the guest clause can
//! produce and read those bytes. Scalar-only signatures call the import
//! with native values.
//!
//! The canonical
//! text of a signature is `(<param>,...)-><ret>` and its hash, stored in the
//! effect table, is the first four bytes (little-endian) of the blake3
//! digest of that text.
//!
//! Signatures come from perform sites. Ops never performed fall back to
//! their declared types. All sites of one op across the whole program must
//! agree; the registry keeps the first one seen.

use std::fmt;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, trace};

use rill_runtime::codec::{self, CodecError};
use rill_runtime::{EffectId, OpId, ResumeKind, Value};

use super::abi::{self, BOX_F32, BOX_F64, BOX_I32, BOX_I64, PAYLOAD};
use super::mir::{EffectInfo, EffectMir};
use crate::config::BoundaryConfig;
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::model::SemType;
use crate::span::Span;
use crate::substrate::registry::{RecordedSignature, SignatureClash};
use crate::substrate::{BuildRegistry, FunctionBuilder, HeapType, Instr, Module, ModuleError, ValType};

/// Installs a frame for every host op of the module.
pub const HOST_INSTALL: &str = "rill.host.install";
/// Argument array to codec bytes.
pub const CODEC_ENCODE: &str = "rill.host.codec.encode";
/// Codec bytes to a guest value.
pub const CODEC_DECODE: &str = "rill.host.codec.decode";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundaryError {
    #[error("conflicting host signatures for `{op}`: `{existing}` (in `{existing_module}`) and `{incoming}` (in `{incoming_module}`)")]
    SignatureConflict {
        op: String,
        existing: String,
        existing_module: String,
        incoming: String,
        incoming_module: String,
        span: Span,
        first_span: Span,
    },

    #[error("host op {index} is not part of this boundary")]
    UnknownOp { index: u32 },

    #[error("`{op}` takes {expected} arguments, got {found}")]
    ArityMismatch { op: String, expected: usize, found: usize },

    #[error("`{op}` slot {slot} expects {expected}, got {found}")]
    ValueMismatch {
        op: String,
        slot: usize,
        expected: Slot,
        found: String,
    },

    #[error("packed value: {0}")]
    Codec(#[from] CodecError),
}

impl BoundaryError {
    fn conflict(op: &str, clash: SignatureClash) -> Self {
        BoundaryError::SignatureConflict {
            op: op.to_string(),
            existing: clash.existing.signature,
            existing_module: clash.existing.module,
            incoming: clash.incoming.signature,
            incoming_module: clash.incoming.module,
            span: clash.incoming.span,
            first_span: clash.existing.span,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            BoundaryError::SignatureConflict { span, first_span, .. } => Diagnostic::error(self.to_string(), *span)
                .with_error_code(ErrorCode::SignatureConflict)
                .with_note(*first_span, "first signature recorded here"),
            _ => Diagnostic::error(self.to_string(), Span::dummy()).with_error_code(ErrorCode::InvalidModule),
        }
    }
}

/// Scalar value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    None,
    I32,
    I64,
    F32,
    F64,
}

/// One parameter or result position of a host signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Scalar(ValueKind),
    Packed,
}

impl Slot {
    pub fn from_sem(ty: &SemType) -> Self {
        match ty {
            SemType::Unit => Slot::Scalar(ValueKind::None),
            SemType::Bool | SemType::I32 => Slot::Scalar(ValueKind::I32),
            SemType::I64 => Slot::Scalar(ValueKind::I64),
            SemType::F32 => Slot::Scalar(ValueKind::F32),
            SemType::F64 => Slot::Scalar(ValueKind::F64),
            _ => Slot::Packed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Scalar(ValueKind::None) => "none",
            Slot::Scalar(ValueKind::I32) => "i32",
            Slot::Scalar(ValueKind::I64) => "i64",
            Slot::Scalar(ValueKind::F32) => "f32",
            Slot::Scalar(ValueKind::F64) => "f64",
            Slot::Packed => "packed",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "none" => Slot::Scalar(ValueKind::None),
            "i32" => Slot::Scalar(ValueKind::I32),
            "i64" => Slot::Scalar(ValueKind::I64),
            "f32" => Slot::Scalar(ValueKind::F32),
            "f64" => Slot::Scalar(ValueKind::F64),
            "packed" => Slot::Packed,
            _ => return None,
        })
    }

    /// Type at the import boundary; `none` has no representation.
    pub fn val_type(self) -> Option<ValType> {
        match self {
            Slot::Scalar(ValueKind::None) => None,
            Slot::Scalar(ValueKind::I32) => Some(ValType::I32),
            Slot::Scalar(ValueKind::I64) => Some(ValType::I64),
            Slot::Scalar(ValueKind::F32) => Some(ValType::F32),
            Slot::Scalar(ValueKind::F64) => Some(ValType::F64),
            Slot::Packed => Some(ValType::anyref()),
        }
    }

    fn box_type(self) -> Option<&'static str> {
        match self {
            Slot::Scalar(ValueKind::I32) => Some(BOX_I32),
            Slot::Scalar(ValueKind::I64) => Some(BOX_I64),
            Slot::Scalar(ValueKind::F32) => Some(BOX_F32),
            Slot::Scalar(ValueKind::F64) => Some(BOX_F64),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostSignature {
    pub params: Vec<Slot>,
    pub ret: Slot,
}

impl HostSignature {
    pub fn from_types(params: &[SemType], ret: &SemType) -> Self {
        Self {
            params: params.iter().map(Slot::from_sem).collect(),
            ret: Slot::from_sem(ret),
        }
    }

    /// `(i32,packed)->i64`
    pub fn canonical(&self) -> String {
        let params: Vec<&str> = self.params.iter().map(|s| s.as_str()).collect();
        format!("({})->{}", params.join(","), self.ret.as_str())
    }

    /// Parse the canonical text.
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.strip_prefix('(')?;
        let (params, ret) = rest.split_once(")->")?;
        let params = if params.is_empty() {
            Vec::new()
        } else {
            params.split(',').map(Slot::parse).collect::<Option<Vec<_>>>()?
        };
        Some(Self {
            params,
            ret: Slot::parse(ret)?,
        })
    }

    pub fn hash(&self) -> u32 {
        signature_hash(&self.canonical())
    }

    /// Whether calls cross as one packed payload.
    pub fn is_packed(&self) -> bool {
        self.ret == Slot::Packed || self.params.contains(&Slot::Packed)
    }

    /// Parameter and result types of the import.
    pub fn import_types(&self) -> (Vec<ValType>, Vec<ValType>) {
        if self.is_packed() {
            return (vec![ValType::anyref()], vec![ValType::anyref()]);
        }
        let params = self.params.iter().filter_map(|s| s.val_type()).collect();
        (params, self.ret.val_type().into_iter().collect())
    }
}

impl fmt::Display for HostSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Hash of a canonical signature text.
pub fn signature_hash(canonical: &str) -> u32 {
    let digest = blake3::hash(canonical.as_bytes());
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// A value as it crosses the host boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    None,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Packed(Vec<u8>),
}

impl WireValue {
    fn kind_name(&self) -> &'static str {
        match self {
            WireValue::None => "none",
            WireValue::I32(_) => "i32",
            WireValue::I64(_) => "i64",
            WireValue::F32(_) => "f32",
            WireValue::F64(_) => "f64",
            WireValue::Packed(_) => "packed",
        }
    }
}

/// A host-serviceable operation of the module.
#[derive(Debug, Clone, PartialEq)]
pub struct HostOp {
    pub global_index: u32,
    pub effect_id: EffectId,
    pub op_id: OpId,
    pub resume: ResumeKind,
    pub qualified_name: String,
    pub signature: HostSignature,
}

impl HostOp {
    /// Local name of the import.
    pub fn import_name(&self) -> String {
        format!("rill.host.op.{}", self.global_index)
    }

    /// Import field, `op.<index>`.
    pub fn import_field(&self) -> String {
        format!("op.{}", self.global_index)
    }

    pub fn clause_name(&self) -> String {
        format!("rill.host.clause.{}", self.global_index)
    }
}

/// Host operations of one module with their resolved signatures.
#[derive(Debug, Clone, Default)]
pub struct HostBoundary {
    ops: IndexMap<u32, HostOp>,
}

impl HostBoundary {
    /// Record the host signatures of every host op `mir` performs or
    /// declares.
    pub fn resolve(mir: &EffectMir, registry: &mut BuildRegistry, config: &BoundaryConfig) -> Result<Self, BoundaryError> {
        let is_host = |effect: &EffectInfo, registry: &BuildRegistry| {
            effect.host
                || registry.effect(effect.id).is_some_and(|e| e.host)
                || config.host_effects.iter().any(|name| name == &effect.name)
        };

        let mut ops = IndexMap::new();

        for perform in mir.performs() {
            let (Some(op), Some(effect)) = (mir.operation(perform.op), mir.effect(perform.effect)) else {
                continue;
            };
            if !is_host(effect, registry) {
                continue;
            }
            let arg_types: Vec<SemType> = perform.args.iter().map(|a| a.ty.clone()).collect();
            let signature = HostSignature::from_types(&arg_types, &perform.result);
            trace!(op = %op.qualified_name, %signature, "host signature from site");
            registry
                .record_signature(
                    op.global_index,
                    RecordedSignature {
                        signature: signature.canonical(),
                        hash: signature.hash(),
                        module: mir.module().to_string(),
                        span: perform.span,
                        provisional: false,
                    },
                )
                .map_err(|clash| BoundaryError::conflict(&op.qualified_name, clash))?;
            ops.entry(op.global_index).or_insert_with(|| HostOp {
                global_index: op.global_index,
                effect_id: op.effect_id,
                op_id: op.op_id,
                resume: op.resume,
                qualified_name: op.qualified_name.clone(),
                signature,
            });
        }

        for effect in mir.effects() {
            if !is_host(effect, registry) {
                continue;
            }
            for op in effect.ops.iter().filter_map(|def| mir.operation(*def)) {
                if ops.contains_key(&op.global_index) {
                    continue;
                }
                if !op.params.iter().all(SemType::is_concrete) || !op.ret.is_concrete() {
                    continue;
                }
                let signature = HostSignature::from_types(&op.params, &op.ret);
                // Never clashes: provisional signatures yield.
                let _ = registry.record_signature(
                    op.global_index,
                    RecordedSignature {
                        signature: signature.canonical(),
                        hash: signature.hash(),
                        module: mir.module().to_string(),
                        span: op.span,
                        provisional: true,
                    },
                );
                ops.insert(
                    op.global_index,
                    HostOp {
                        global_index: op.global_index,
                        effect_id: op.effect_id,
                        op_id: op.op_id,
                        resume: op.resume,
                        qualified_name: op.qualified_name.clone(),
                        signature,
                    },
                );
            }
        }

        ops.sort_keys();
        debug!(module = mir.module(), ops = ops.len(), "resolved host boundary");
        Ok(Self { ops })
    }

    /// Replace every signature with the program-wide one from the registry.
    pub fn settle(&mut self, registry: &BuildRegistry) {
        for op in self.ops.values_mut() {
            if let Some(parsed) = registry
                .signature(op.global_index)
                .and_then(|recorded| HostSignature::parse(&recorded.signature))
            {
                op.signature = parsed;
            }
        }
    }

    pub fn ops(&self) -> impl Iterator<Item = &HostOp> {
        self.ops.values()
    }

    pub fn op(&self, index: u32) -> Option<&HostOp> {
        self.ops.get(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Encode call arguments for a host op. A packed call yields a single
    /// [`WireValue::Packed`] holding the whole argument array.
    pub fn encode_args(&self, index: u32, args: &[Value]) -> Result<Vec<WireValue>, BoundaryError> {
        let op = self.op(index).ok_or(BoundaryError::UnknownOp { index })?;
        if args.len() != op.signature.params.len() {
            return Err(BoundaryError::ArityMismatch {
                op: op.qualified_name.clone(),
                expected: op.signature.params.len(),
                found: args.len(),
            });
        }
        let wire = op
            .signature
            .params
            .iter()
            .zip(args)
            .enumerate()
            .map(|(slot, (kind, value))| encode_slot(&op.qualified_name, slot, *kind, value))
            .collect::<Result<Vec<_>, _>>()?;
        if !op.signature.is_packed() {
            return Ok(wire);
        }
        Ok(vec![WireValue::Packed(codec::encode_args(args)?)])
    }

    /// Decode a host op's result.
    pub fn decode_result(&self, index: u32, wire: WireValue) -> Result<Value, BoundaryError> {
        let op = self.op(index).ok_or(BoundaryError::UnknownOp { index })?;
        let mismatch = |found: &WireValue| BoundaryError::ValueMismatch {
            op: op.qualified_name.clone(),
            slot: 0,
            expected: op.signature.ret,
            found: found.kind_name().to_string(),
        };
        if op.signature.is_packed() {
            let WireValue::Packed(bytes) = wire else {
                return Err(mismatch(&wire));
            };
            let value = codec::decode_value(&bytes)?;
            if !accepts(op.signature.ret, &value) {
                return Err(BoundaryError::ValueMismatch {
                    op: op.qualified_name.clone(),
                    slot: 0,
                    expected: op.signature.ret,
                    found: value.kind_name().to_string(),
                });
            }
            return Ok(value);
        }
        Ok(match (op.signature.ret, wire) {
            (Slot::Scalar(ValueKind::None), WireValue::None) => Value::Unit,
            (Slot::Scalar(ValueKind::I32), WireValue::I32(v)) => Value::I32(v),
            (Slot::Scalar(ValueKind::I64), WireValue::I64(v)) => Value::I64(v),
            (Slot::Scalar(ValueKind::F32), WireValue::F32(v)) => Value::F32(v),
            (Slot::Scalar(ValueKind::F64), WireValue::F64(v)) => Value::F64(v),
            (Slot::Packed, WireValue::Packed(bytes)) => codec::decode_value(&bytes)?,
            (_, other) => return Err(mismatch(&other)),
        })
    }

    /// Declare the host imports, a clause function per op and
    /// `rill.host.install`.
    pub fn emit(&self, module: &mut Module) -> Result<(), ModuleError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        if self.ops.values().any(|op| op.signature.is_packed()) {
            for (field, name) in [("codec.encode", CODEC_ENCODE), ("codec.decode", CODEC_DECODE)] {
                module.import_func(abi::HOST_MODULE, field, name, vec![ValType::anyref()], vec![ValType::anyref()])?;
            }
        }
        for op in self.ops.values() {
            let (params, results) = op.signature.import_types();
            module.import_func(abi::HOST_MODULE, &op.import_field(), &op.import_name(), params, results)?;
            module.add_function(host_clause(op))?;
        }
        module.add_function(host_install(self.ops.values()))?;
        module.export(HOST_INSTALL, HOST_INSTALL)
    }
}

/// Whether a decoded result fits the slot.
fn accepts(slot: Slot, value: &Value) -> bool {
    matches!(
        (slot, value),
        (Slot::Packed, _)
            | (Slot::Scalar(ValueKind::None), Value::Unit)
            | (Slot::Scalar(ValueKind::I32), Value::I32(_) | Value::Bool(_))
            | (Slot::Scalar(ValueKind::I64), Value::I64(_))
            | (Slot::Scalar(ValueKind::F32), Value::F32(_))
            | (Slot::Scalar(ValueKind::F64), Value::F64(_))
    )
}

fn encode_slot(op: &str, slot: usize, kind: Slot, value: &Value) -> Result<WireValue, BoundaryError> {
    let wire = match (kind, value) {
        (Slot::Scalar(ValueKind::None), Value::Unit) => WireValue::None,
        (Slot::Scalar(ValueKind::I32), Value::I32(v)) => WireValue::I32(*v),
        (Slot::Scalar(ValueKind::I32), Value::Bool(b)) => WireValue::I32(i32::from(*b)),
        (Slot::Scalar(ValueKind::I64), Value::I64(v)) => WireValue::I64(*v),
        (Slot::Scalar(ValueKind::F32), Value::F32(v)) => WireValue::F32(*v),
        (Slot::Scalar(ValueKind::F64), Value::F64(v)) => WireValue::F64(*v),
        (Slot::Packed, value) => WireValue::Packed(codec::encode_value(value)?),
        (expected, found) => {
            return Err(BoundaryError::ValueMismatch {
                op: op.to_string(),
                slot,
                expected,
                found: found.kind_name().to_string(),
            })
        }
    };
    Ok(wire)
}

/// Clause servicing one host op: unpack the payload, call the import and
/// resume the performer with the boxed or decoded result.
fn host_clause(op: &HostOp) -> crate::substrate::Function {
    let mut f = FunctionBuilder::new(op.clause_name());
    f.param("frame", ValType::ref_to(abi::HANDLER_FRAME))
        .param("env", ValType::anyref())
        .param("request", ValType::ref_to(abi::EFFECT_REQUEST))
        .result(ValType::ref_to(abi::OUTCOME))
        .local("payload", ValType::anyref());

    f.extend([
        Instr::local_get("request"),
        Instr::struct_get(abi::EFFECT_REQUEST, "payload"),
        Instr::local_set("payload"),
    ]);

    if op.signature.is_packed() {
        packed_call(&mut f, op);
    } else {
        scalar_call(&mut f, op);
    }

    f.local("result", ValType::anyref());
    f.extend([
        Instr::local_set("result"),
        Instr::local_get("request"),
        Instr::struct_get(abi::EFFECT_REQUEST, "cont"),
        Instr::local_get("result"),
        Instr::call(abi::CONT_RESUME),
    ]);
    f.finish()
}

/// Collect the arguments into a payload array, encode it, call the import
/// and decode the result.
fn packed_call(f: &mut FunctionBuilder, op: &HostOp) {
    match op.signature.params.len() {
        0 => {
            f.emit(Instr::ArrayNewFixed {
                ty: PAYLOAD.to_string(),
                len: 0,
            });
        }
        1 => {
            f.extend([
                Instr::local_get("payload"),
                Instr::ArrayNewFixed {
                    ty: PAYLOAD.to_string(),
                    len: 1,
                },
            ]);
        }
        _ => {
            f.extend([Instr::local_get("payload"), Instr::ref_cast(PAYLOAD)]);
        }
    }
    f.extend([
        Instr::call(CODEC_ENCODE),
        Instr::Call(op.import_name()),
        Instr::call(CODEC_DECODE),
    ]);
}

/// Unbox each scalar argument, call the import and box the result.
fn scalar_call(f: &mut FunctionBuilder, op: &HostOp) {
    let arity = op.signature.params.len();
    for (i, slot) in op.signature.params.iter().enumerate() {
        if slot.val_type().is_none() {
            continue;
        }
        f.emit(Instr::local_get("payload"));
        if arity > 1 {
            f.extend([
                Instr::ref_cast(PAYLOAD),
                Instr::I32Const(i as i32),
                Instr::ArrayGet(PAYLOAD.to_string()),
            ]);
        }
        if let Some(boxed) = slot.box_type() {
            f.extend([Instr::ref_cast(boxed), Instr::struct_get(boxed, "value")]);
        }
    }
    f.emit(Instr::Call(op.import_name()));

    match op.signature.ret.box_type() {
        Some(boxed) => {
            f.emit(Instr::struct_new(boxed));
        }
        None if op.signature.ret == Slot::Scalar(ValueKind::None) => {
            f.emit(Instr::RefNull(HeapType::Any));
        }
        None => {}
    }
}

/// Push a frame for every host op onto `prev`.
fn host_install<'a>(ops: impl Iterator<Item = &'a HostOp>) -> crate::substrate::Function {
    let mut f = FunctionBuilder::new(HOST_INSTALL);
    f.param("prev", ValType::ref_null(abi::HANDLER_FRAME))
        .result(ValType::ref_null(abi::HANDLER_FRAME));
    for op in ops {
        f.extend([
            Instr::local_get("prev"),
            Instr::I32Const(op.effect_id.0 as i32),
            Instr::I32Const(op.op_id.0 as i32),
            Instr::I32Const(op.resume.as_u32() as i32),
            Instr::RefFunc(op.clause_name()),
            Instr::RefNull(HeapType::Any),
            Instr::call(abi::FRAME_PUSH),
            Instr::local_set("prev"),
        ]);
    }
    f.emit(Instr::local_get("prev"));
    f.finish()
}
