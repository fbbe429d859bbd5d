//! Program-lifetime build registry.
//!
//! One registry lives for the whole linked program. It hands out global
//! effect ids keyed by an effect's external name, numbers every operation
//! with a global op index, records which module owns the runtime ABI and
//! keeps the host signature of each op so that modules compiled separately
//! agree on it.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use rill_runtime::{EffectId, OpId, ResumeKind};

use crate::span::Span;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("effect `{name}` is declared with different operations in `{first}` and `{second}`")]
    EffectShapeMismatch { name: String, first: String, second: String },
}

/// Operation as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpShape {
    pub name: String,
    pub resume: ResumeKind,
}

/// Everything needed to register an effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectShape {
    pub name: String,
    pub label: String,
    pub host: bool,
    /// Operations in op id order.
    pub ops: Vec<OpShape>,
}

/// A registered effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredEffect {
    pub id: EffectId,
    pub name: String,
    pub label: String,
    pub host: bool,
    /// Global index of op 0.
    pub first_op: u32,
    pub ops: Vec<OpShape>,
    /// Module that registered it first.
    pub module: String,
}

impl RegisteredEffect {
    pub fn op_index(&self, op: OpId) -> Option<u32> {
        (op.0 < self.ops.len() as u32).then(|| self.first_op + op.0)
    }
}

/// Who emits the runtime ABI functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiOwnership {
    Define,
    Import { from: String },
}

/// Host signature recorded for a global op index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSignature {
    /// Canonical text, e.g. `(i32,packed)->i64`.
    pub signature: String,
    pub hash: u32,
    pub module: String,
    pub span: Span,
    /// Taken from the declaration rather than a perform site; a site
    /// signature replaces it.
    pub provisional: bool,
}

/// Two sites disagree on one op's host signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureClash {
    pub existing: RecordedSignature,
    pub incoming: RecordedSignature,
}

#[derive(Debug, Default)]
pub struct BuildRegistry {
    effects: IndexMap<String, RegisteredEffect>,
    op_count: u32,
    abi_owner: Option<String>,
    signatures: FxHashMap<u32, RecordedSignature>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an effect for `module`, returning its global id.
    ///
    /// A second registration of the same external name must have the same
    /// operations; it then shares the first id.
    pub fn register_effect(&mut self, module: &str, shape: EffectShape) -> Result<EffectId, RegistryError> {
        if let Some(existing) = self.effects.get_mut(&shape.name) {
            if existing.ops != shape.ops {
                return Err(RegistryError::EffectShapeMismatch {
                    name: shape.name,
                    first: existing.module.clone(),
                    second: module.to_string(),
                });
            }
            existing.host |= shape.host;
            return Ok(existing.id);
        }

        let id = EffectId(self.effects.len() as u32);
        let first_op = self.op_count;
        self.op_count += shape.ops.len() as u32;
        debug!(effect = %shape.name, %id, first_op, ops = shape.ops.len(), "registered effect");
        self.effects.insert(
            shape.name.clone(),
            RegisteredEffect {
                id,
                name: shape.name,
                label: shape.label,
                host: shape.host,
                first_op,
                ops: shape.ops,
                module: module.to_string(),
            },
        );
        Ok(id)
    }

    /// Mark an already registered effect as host-serviceable.
    pub fn mark_host(&mut self, name: &str) -> bool {
        match self.effects.get_mut(name) {
            Some(effect) => {
                effect.host = true;
                true
            }
            None => false,
        }
    }

    pub fn effect(&self, id: EffectId) -> Option<&RegisteredEffect> {
        self.effects.get_index(id.0 as usize).map(|(_, e)| e)
    }

    pub fn effect_by_name(&self, name: &str) -> Option<&RegisteredEffect> {
        self.effects.get(name)
    }

    /// Effects in id order.
    pub fn effects(&self) -> impl Iterator<Item = &RegisteredEffect> {
        self.effects.values()
    }

    pub fn op_count(&self) -> u32 {
        self.op_count
    }

    pub fn op_index(&self, effect: EffectId, op: OpId) -> Option<u32> {
        self.effect(effect)?.op_index(op)
    }

    /// Effect and op of a global op index.
    pub fn op_at(&self, index: u32) -> Option<(&RegisteredEffect, OpId)> {
        self.effects
            .values()
            .find(|e| index >= e.first_op && index < e.first_op + e.ops.len() as u32)
            .map(|e| (e, OpId(index - e.first_op)))
    }

    /// Ask whether `module` defines the runtime ABI or imports it.
    pub fn claim_abi(&mut self, module: &str) -> AbiOwnership {
        match &self.abi_owner {
            Some(owner) if owner != module => AbiOwnership::Import { from: owner.clone() },
            Some(_) => AbiOwnership::Define,
            None => {
                debug!(module, "module owns the runtime ABI");
                self.abi_owner = Some(module.to_string());
                AbiOwnership::Define
            }
        }
    }

    pub fn abi_owner(&self) -> Option<&str> {
        self.abi_owner.as_deref()
    }

    /// Record the host signature of a global op index.
    ///
    /// Recording an identical signature again is a no-op. Provisional
    /// signatures never clash: they yield to site signatures and are
    /// ignored once one is recorded.
    pub fn record_signature(&mut self, op_index: u32, incoming: RecordedSignature) -> Result<(), SignatureClash> {
        match self.signatures.get(&op_index) {
            Some(_) if incoming.provisional => Ok(()),
            Some(existing) if existing.provisional => {
                self.signatures.insert(op_index, incoming);
                Ok(())
            }
            Some(existing) if existing.signature != incoming.signature => Err(SignatureClash {
                existing: existing.clone(),
                incoming,
            }),
            Some(_) => Ok(()),
            None => {
                self.signatures.insert(op_index, incoming);
                Ok(())
            }
        }
    }

    pub fn signature(&self, op_index: u32) -> Option<&RecordedSignature> {
        self.signatures.get(&op_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(name: &str, ops: &[&str]) -> EffectShape {
        EffectShape {
            name: name.to_string(),
            label: name.to_string(),
            host: false,
            ops: ops
                .iter()
                .map(|n| OpShape {
                    name: n.to_string(),
                    resume: ResumeKind::Tail,
                })
                .collect(),
        }
    }

    #[test]
    fn test_same_effect_shares_id_across_modules() {
        let mut reg = BuildRegistry::new();
        let a = reg.register_effect("a", shape("app.ask", &["get"])).unwrap();
        let b = reg.register_effect("b", shape("app.log", &["info", "warn"])).unwrap();
        let a2 = reg.register_effect("b", shape("app.ask", &["get"])).unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(reg.op_count(), 3);
        assert_eq!(reg.op_index(b, OpId(1)), Some(2));
        assert_eq!(reg.op_index(b, OpId(2)), None);
        let (effect, op) = reg.op_at(2).unwrap();
        assert_eq!((effect.id, op), (b, OpId(1)));
    }

    #[test]
    fn test_shape_mismatch() {
        let mut reg = BuildRegistry::new();
        reg.register_effect("a", shape("app.ask", &["get"])).unwrap();
        let err = reg.register_effect("b", shape("app.ask", &["get", "put"])).unwrap_err();
        assert!(matches!(err, RegistryError::EffectShapeMismatch { ref first, .. } if first == "a"));
    }

    #[test]
    fn test_abi_claimed_once() {
        let mut reg = BuildRegistry::new();
        assert_eq!(reg.claim_abi("main"), AbiOwnership::Define);
        assert_eq!(reg.claim_abi("main"), AbiOwnership::Define);
        assert_eq!(reg.claim_abi("lib"), AbiOwnership::Import { from: "main".into() });
    }

    #[test]
    fn test_signature_clash() {
        let mut reg = BuildRegistry::new();
        let sig = |text: &str, module: &str| RecordedSignature {
            signature: text.to_string(),
            hash: 0,
            module: module.to_string(),
            span: Span::dummy(),
            provisional: false,
        };
        reg.record_signature(0, sig("(i32)->i64", "a")).unwrap();
        reg.record_signature(0, sig("(i32)->i64", "b")).unwrap();
        let clash = reg.record_signature(0, sig("(i64)->i64", "b")).unwrap_err();
        assert_eq!(clash.existing.module, "a");
    }

    #[test]
    fn test_provisional_signature_yields() {
        let mut reg = BuildRegistry::new();
        let sig = |text: &str, provisional: bool| RecordedSignature {
            signature: text.to_string(),
            hash: 0,
            module: "m".to_string(),
            span: Span::dummy(),
            provisional,
        };
        reg.record_signature(3, sig("()->i64", true)).unwrap();
        reg.record_signature(3, sig("(i32)->i64", false)).unwrap();
        reg.record_signature(3, sig("()->none", true)).unwrap();
        assert_eq!(reg.signature(3).unwrap().signature, "(i32)->i64");
    }
}
