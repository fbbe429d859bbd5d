//! The host protocol table.
//!
//! A flat, host-friendly projection of the binary effect table: one entry
//! per operation with its program-wide index. The op index is what the
//! compiled module passes when it calls into the host, so every
//! registration ends up keyed by it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use rill_runtime::effect_table::EffectTable;
use rill_runtime::{format_signature_hash, ResumeKind};

use crate::error::{HostError, Result};

/// One operation as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolOp {
    /// Position in table order across all effects.
    pub op_index: u32,
    /// External effect name, e.g. `rill.time`.
    pub effect_id: String,
    pub op_id: u32,
    pub op_name: String,
    pub resume_kind: ResumeKind,
    /// `0x%08x`
    pub signature_hash: String,
    pub label: String,
}

/// Selects an operation for registration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EffectOpQuery {
    pub effect_id: String,
    pub op_name: String,
    /// Normalized `0x%08x`; only consulted when the name is ambiguous.
    pub signature_hash: Option<String>,
}

impl EffectOpQuery {
    pub fn new(effect_id: impl Into<String>, op_name: impl Into<String>) -> Self {
        Self {
            effect_id: effect_id.into(),
            op_name: op_name.into(),
            signature_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProtocolTable {
    pub version: u32,
    pub ops: Vec<ProtocolOp>,
}

impl HostProtocolTable {
    pub fn from_effect_table(table: &EffectTable) -> Self {
        let ops = table
            .iter_ops()
            .enumerate()
            .map(|(index, (effect, op))| ProtocolOp {
                op_index: index as u32,
                effect_id: effect.name.clone(),
                op_id: op.op_id,
                op_name: op.name.clone(),
                resume_kind: op.resume_kind,
                signature_hash: format_signature_hash(op.signature_hash),
                label: op.label.clone(),
            })
            .collect::<Vec<_>>();
        debug!(version = table.version, ops = ops.len(), "loaded protocol table");
        Self {
            version: table.version,
            ops,
        }
    }

    /// Decode a binary effect table section.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_effect_table(&EffectTable::decode(bytes)?))
    }

    pub fn op(&self, op_index: u32) -> Option<&ProtocolOp> {
        self.ops.get(op_index as usize)
    }

    /// Distinct effect ids in table order.
    pub fn effect_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for op in &self.ops {
            if !ids.contains(&op.effect_id.as_str()) {
                ids.push(&op.effect_id);
            }
        }
        ids
    }

    /// Every op of `effect_id` named `op_name`.
    pub fn candidates<'a, 'q>(&'a self, effect_id: &'q str, op_name: &'q str) -> impl Iterator<Item = &'a ProtocolOp> + 'q
    where
        'a: 'q,
    {
        self.ops
            .iter()
            .filter(move |op| op.effect_id == effect_id && op.op_name == op_name)
    }

    /// Resolve a query to exactly one op.
    ///
    /// A single match wins whatever its signature. Several matches need the
    /// query's signature hash to pick one.
    pub fn resolve_effect_op(&self, query: &EffectOpQuery) -> Result<&ProtocolOp> {
        let candidates: Vec<&ProtocolOp> = self.candidates(&query.effect_id, &query.op_name).collect();

        if candidates.is_empty() {
            let effect_ops: Vec<String> = self
                .ops
                .iter()
                .filter(|op| op.effect_id == query.effect_id)
                .map(|op| op.op_name.clone())
                .collect();
            if effect_ops.is_empty() {
                return Err(HostError::UnknownEffect {
                    effect_id: query.effect_id.clone(),
                    known: self.effect_ids().into_iter().map(String::from).collect(),
                });
            }
            return Err(HostError::UnknownOp {
                effect_id: query.effect_id.clone(),
                op_name: query.op_name.clone(),
                signature_hash: query.signature_hash.clone(),
                known: dedup(effect_ops),
            });
        }

        if let [only] = candidates.as_slice() {
            return Ok(only);
        }

        let hashes = || dedup(candidates.iter().map(|op| op.signature_hash.clone()).collect());
        match &query.signature_hash {
            None => Err(HostError::AmbiguousHandlerKey {
                effect_id: query.effect_id.clone(),
                op_name: query.op_name.clone(),
                candidates: hashes(),
            }),
            Some(hash) => candidates
                .iter()
                .copied()
                .find(|op| &op.signature_hash == hash)
                .ok_or_else(|| HostError::UnknownOp {
                    effect_id: query.effect_id.clone(),
                    op_name: query.op_name.clone(),
                    signature_hash: Some(hash.clone()),
                    known: hashes(),
                }),
        }
    }

    /// Pretty JSON dump, for diagnostics and tooling.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn dedup(mut items: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(items.len());
    items.retain(|item| {
        if seen.contains(item) {
            false
        } else {
            seen.push(item.clone());
            true
        }
    });
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rill_runtime::effect_table::{EffectEntry, OpEntry, EFFECT_TABLE_V2};

    fn op(op_id: u32, name: &str, hash: u32) -> OpEntry {
        OpEntry {
            op_id,
            name: name.to_string(),
            label: format!("Time.{}", name),
            resume_kind: ResumeKind::Tail,
            signature_hash: hash,
        }
    }

    /// Two generations of `rill.time` linked side by side: `sleep` exists
    /// with two signatures.
    fn table() -> EffectTable {
        EffectTable {
            version: EFFECT_TABLE_V2,
            effects: vec![
                EffectEntry {
                    effect_id: 0,
                    name: "rill.time".into(),
                    label: "Time".into(),
                    ops: vec![op(0, "sleep", 0x12), op(1, "now", 0x99)],
                },
                EffectEntry {
                    effect_id: 1,
                    name: "rill.time".into(),
                    label: "Time".into(),
                    ops: vec![op(0, "sleep", 0x34)],
                },
            ],
        }
    }

    #[test]
    fn test_flattened_in_table_order() {
        let protocol = HostProtocolTable::from_effect_table(&table());
        assert_eq!(protocol.ops.len(), 3);
        assert_eq!(protocol.ops[1].op_name, "now");
        assert_eq!(protocol.ops[2].op_index, 2);
        assert_eq!(protocol.ops[2].signature_hash, "0x00000034");
        assert_eq!(protocol.effect_ids(), vec!["rill.time"]);
    }

    #[test]
    fn test_single_match_ignores_signature() {
        let protocol = HostProtocolTable::from_effect_table(&table());
        let mut query = EffectOpQuery::new("rill.time", "now");
        query.signature_hash = Some("0xdeadbeef".into());
        assert_eq!(protocol.resolve_effect_op(&query).unwrap().op_index, 1);
    }

    #[test]
    fn test_ambiguous_without_signature() {
        let protocol = HostProtocolTable::from_effect_table(&table());
        let err = protocol
            .resolve_effect_op(&EffectOpQuery::new("rill.time", "sleep"))
            .unwrap_err();
        match err {
            HostError::AmbiguousHandlerKey { candidates, .. } => {
                assert_eq!(candidates, vec!["0x00000012", "0x00000034"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_signature_picks_candidate() {
        let protocol = HostProtocolTable::from_effect_table(&table());
        let mut query = EffectOpQuery::new("rill.time", "sleep");
        query.signature_hash = Some("0x00000034".into());
        assert_eq!(protocol.resolve_effect_op(&query).unwrap().op_index, 2);

        query.signature_hash = Some("0x00000056".into());
        match protocol.resolve_effect_op(&query).unwrap_err() {
            HostError::UnknownOp { known, .. } => assert_eq!(known, vec!["0x00000012", "0x00000034"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_name_lists_known_ops() {
        let protocol = HostProtocolTable::from_effect_table(&table());
        match protocol
            .resolve_effect_op(&EffectOpQuery::new("rill.time", "nap"))
            .unwrap_err()
        {
            HostError::UnknownOp { known, .. } => assert_eq!(known, vec!["sleep", "now"]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            protocol.resolve_effect_op(&EffectOpQuery::new("rill.fs", "read")),
            Err(HostError::UnknownEffect { .. })
        ));
    }

    #[test]
    fn test_from_bytes_and_json() {
        let bytes = table().encode().unwrap();
        let protocol = HostProtocolTable::from_bytes(&bytes).unwrap();
        assert_eq!(protocol, HostProtocolTable::from_effect_table(&table()));
        let json = protocol.to_json().unwrap();
        assert!(json.contains("\"signature_hash\": \"0x00000012\""));
        assert!(json.contains("\"resume_kind\": \"tail\""));
    }
}
