//! # Effect Table Wire Format
//!
//! The effect table is the binary sidecar a compiled artifact carries so a
//! host can discover its effect surface without re-running the compiler.
//!
//! ## Layout
//!
//! All integers are little-endian `u32` and read unaligned.
//!
//! ```text
//! header         version, effect_count, op_count
//! effect records effect_id, name_off, ops_off, op_count   [v2: + label_off]
//! op records     op_id, resume_kind, name_off             [v2: + label_off, signature_hash]
//! names blob     interned NUL-terminated UTF-8 strings
//! ```
//!
//! `ops_off` is the byte offset, from the start of the table, of the
//! effect's first op record; an effect's op records are contiguous.
//! Name offsets are relative to the start of the names blob.
//!
//! Version 2 only appends fields, so the v1 prefix of every record keeps
//! its meaning. Decoding a v1 table yields `label == name` and a zero
//! signature hash.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use string_interner::{DefaultStringInterner, DefaultSymbol};
use thiserror::Error;

use crate::abi::ResumeKind;

/// Layout exactly as originally specified: no labels, no signature hashes.
pub const EFFECT_TABLE_V1: u32 = 1;
/// Layout with labels and signature hashes appended to each record.
pub const EFFECT_TABLE_V2: u32 = 2;
/// Version written by default.
pub const CURRENT_VERSION: u32 = EFFECT_TABLE_V2;

/// Size of the table header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Size of one effect record for a table version.
pub fn effect_record_size(version: u32) -> usize {
    if version >= EFFECT_TABLE_V2 {
        20
    } else {
        16
    }
}

/// Size of one op record for a table version.
pub fn op_record_size(version: u32) -> usize {
    if version >= EFFECT_TABLE_V2 {
        20
    } else {
        12
    }
}

fn is_supported(version: u32) -> bool {
    version == EFFECT_TABLE_V1 || version == EFFECT_TABLE_V2
}

// ============================================================================
// Decoded Model
// ============================================================================

/// A decoded (or to-be-encoded) effect table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectTable {
    pub version: u32,
    pub effects: Vec<EffectEntry>,
}

/// One effect and its operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectEntry {
    pub effect_id: u32,
    /// Stable external identifier, e.g. `rill.time`.
    pub name: String,
    /// Display label, e.g. `Time`.
    pub label: String,
    pub ops: Vec<OpEntry>,
}

/// One operation of an effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpEntry {
    pub op_id: u32,
    pub name: String,
    /// Qualified display label, e.g. `Time.sleep`.
    pub label: String,
    pub resume_kind: ResumeKind,
    pub signature_hash: u32,
}

impl EffectTable {
    /// Create an empty table of the given version.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            effects: Vec::new(),
        }
    }

    /// Total number of operations across all effects.
    pub fn op_count(&self) -> usize {
        self.effects.iter().map(|e| e.ops.len()).sum()
    }

    /// Iterate `(effect, op)` pairs in table order.
    pub fn iter_ops(&self) -> impl Iterator<Item = (&EffectEntry, &OpEntry)> {
        self.effects
            .iter()
            .flat_map(|effect| effect.ops.iter().map(move |op| (effect, op)))
    }

    /// Serialize the table.
    pub fn encode(&self) -> Result<Vec<u8>, TableEncodeError> {
        encode_table(self)
    }

    /// Parse a serialized table.
    pub fn decode(bytes: &[u8]) -> Result<Self, TableDecodeError> {
        RawEffectTable::parse(bytes)?.resolve()
    }
}

// ============================================================================
// Names Blob
// ============================================================================

/// Builder for the interned names blob.
///
/// Each distinct string is stored exactly once, however many records refer
/// to it.
#[derive(Debug, Default)]
pub struct NamesBlob {
    interner: DefaultStringInterner,
    offsets: FxHashMap<DefaultSymbol, u32>,
    bytes: Vec<u8>,
}

impl NamesBlob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name and return its byte offset in the blob.
    pub fn intern(&mut self, name: &str) -> Result<u32, TableEncodeError> {
        if name.as_bytes().contains(&0) {
            return Err(TableEncodeError::InteriorNul {
                name: name.to_string(),
            });
        }
        if let Some(symbol) = self.interner.get(name) {
            if let Some(offset) = self.offsets.get(&symbol) {
                return Ok(*offset);
            }
        }
        let offset = u32::try_from(self.bytes.len())
            .map_err(|_| TableEncodeError::Overflow { what: "names blob" })?;
        let symbol = self.interner.get_or_intern(name);
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(symbol, offset);
        Ok(offset)
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Read the NUL-terminated name at `offset` in a names blob.
pub fn read_name(blob: &[u8], offset: u32) -> Result<&str, TableDecodeError> {
    let start = offset as usize;
    if start >= blob.len() {
        return Err(TableDecodeError::NameOffsetOutOfRange { offset });
    }
    let len = blob[start..]
        .iter()
        .position(|b| *b == 0)
        .ok_or(TableDecodeError::UnterminatedName { offset })?;
    std::str::from_utf8(&blob[start..start + len])
        .map_err(|_| TableDecodeError::InvalidUtf8 { offset })
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while serializing a table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableEncodeError {
    #[error("name {name:?} contains an interior NUL byte")]
    InteriorNul { name: String },

    #[error("effect table overflow: {what} exceeds u32 range")]
    Overflow { what: &'static str },

    #[error("unsupported effect table version {0}")]
    UnsupportedVersion(u32),
}

/// Errors raised while parsing a table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableDecodeError {
    #[error("effect table truncated: need {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("unsupported effect table version {0}")]
    UnsupportedVersion(u32),

    #[error("effect {effect_id} has ops offset {offset} outside the op records")]
    BadOpsOffset { effect_id: u32, offset: u32 },

    #[error("effect records claim {claimed} ops but the header declares {declared}")]
    OpCountMismatch { declared: u32, claimed: u64 },

    #[error("name offset {offset} is outside the names blob")]
    NameOffsetOutOfRange { offset: u32 },

    #[error("name at offset {offset} is not NUL-terminated")]
    UnterminatedName { offset: u32 },

    #[error("name at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: u32 },

    #[error("op {op_id} has invalid resume kind {value}")]
    InvalidResumeKind { op_id: u32, value: u32 },
}

// ============================================================================
// Encoding
// ============================================================================

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn to_u32(n: usize, what: &'static str) -> Result<u32, TableEncodeError> {
    u32::try_from(n).map_err(|_| TableEncodeError::Overflow { what })
}

fn encode_table(table: &EffectTable) -> Result<Vec<u8>, TableEncodeError> {
    if !is_supported(table.version) {
        return Err(TableEncodeError::UnsupportedVersion(table.version));
    }
    let v2 = table.version >= EFFECT_TABLE_V2;
    let effect_count = to_u32(table.effects.len(), "effect count")?;
    let op_count = to_u32(table.op_count(), "op count")?;

    let ops_start = HEADER_SIZE + table.effects.len() * effect_record_size(table.version);
    let op_size = op_record_size(table.version);

    let mut names = NamesBlob::new();
    let mut effect_records = Vec::with_capacity(table.effects.len() * effect_record_size(table.version));
    let mut op_records = Vec::with_capacity(table.op_count() * op_size);
    let mut op_index = 0usize;

    for effect in &table.effects {
        let name_off = names.intern(&effect.name)?;
        let ops_off = to_u32(ops_start + op_index * op_size, "ops offset")?;
        put_u32(&mut effect_records, effect.effect_id);
        put_u32(&mut effect_records, name_off);
        put_u32(&mut effect_records, ops_off);
        put_u32(&mut effect_records, to_u32(effect.ops.len(), "op count")?);
        if v2 {
            put_u32(&mut effect_records, names.intern(&effect.label)?);
        }

        for op in &effect.ops {
            put_u32(&mut op_records, op.op_id);
            put_u32(&mut op_records, op.resume_kind.as_u32());
            put_u32(&mut op_records, names.intern(&op.name)?);
            if v2 {
                put_u32(&mut op_records, names.intern(&op.label)?);
                put_u32(&mut op_records, op.signature_hash);
            }
        }
        op_index += effect.ops.len();
    }

    let names = names.into_bytes();
    let mut out = Vec::with_capacity(HEADER_SIZE + effect_records.len() + op_records.len() + names.len());
    put_u32(&mut out, table.version);
    put_u32(&mut out, effect_count);
    put_u32(&mut out, op_count);
    out.extend_from_slice(&effect_records);
    out.extend_from_slice(&op_records);
    out.extend_from_slice(&names);
    Ok(out)
}

// ============================================================================
// Decoding
// ============================================================================

/// An effect record as stored on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEffectRecord {
    pub effect_id: u32,
    pub name_offset: u32,
    pub ops_offset: u32,
    pub op_count: u32,
    pub label_offset: Option<u32>,
}

/// An op record as stored on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOpRecord {
    pub op_id: u32,
    pub resume_kind: u32,
    pub name_offset: u32,
    pub label_offset: Option<u32>,
    pub signature_hash: Option<u32>,
}

/// A table parsed into its records without resolving names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEffectTable {
    pub version: u32,
    pub effects: Vec<RawEffectRecord>,
    pub ops: Vec<RawOpRecord>,
    pub names: Vec<u8>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Result<u32, TableDecodeError> {
        let end = self.pos + 4;
        if end > self.bytes.len() {
            return Err(TableDecodeError::Truncated {
                offset: self.pos,
                needed: 4,
            });
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[self.pos..end]);
        self.pos = end;
        Ok(u32::from_le_bytes(raw))
    }

    fn ensure(&self, needed: usize) -> Result<(), TableDecodeError> {
        if self.bytes.len().saturating_sub(self.pos) < needed {
            return Err(TableDecodeError::Truncated {
                offset: self.pos,
                needed,
            });
        }
        Ok(())
    }
}

impl RawEffectTable {
    /// Parse the header and fixed-size records.
    pub fn parse(bytes: &[u8]) -> Result<Self, TableDecodeError> {
        let mut r = Reader { bytes, pos: 0 };
        let version = r.u32()?;
        if !is_supported(version) {
            return Err(TableDecodeError::UnsupportedVersion(version));
        }
        let v2 = version >= EFFECT_TABLE_V2;
        let effect_count = r.u32()? as usize;
        let op_count = r.u32()?;

        r.ensure(effect_count.saturating_mul(effect_record_size(version)))?;
        let mut effects = Vec::with_capacity(effect_count);
        for _ in 0..effect_count {
            let effect_id = r.u32()?;
            let name_offset = r.u32()?;
            let ops_offset = r.u32()?;
            let count = r.u32()?;
            let label_offset = if v2 { Some(r.u32()?) } else { None };
            effects.push(RawEffectRecord {
                effect_id,
                name_offset,
                ops_offset,
                op_count: count,
                label_offset,
            });
        }

        let claimed: u64 = effects.iter().map(|e| u64::from(e.op_count)).sum();
        if claimed != u64::from(op_count) {
            return Err(TableDecodeError::OpCountMismatch {
                declared: op_count,
                claimed,
            });
        }

        r.ensure((op_count as usize).saturating_mul(op_record_size(version)))?;
        let mut ops = Vec::with_capacity(op_count as usize);
        for _ in 0..op_count {
            let op_id = r.u32()?;
            let resume_kind = r.u32()?;
            let name_offset = r.u32()?;
            let (label_offset, signature_hash) = if v2 {
                (Some(r.u32()?), Some(r.u32()?))
            } else {
                (None, None)
            };
            ops.push(RawOpRecord {
                op_id,
                resume_kind,
                name_offset,
                label_offset,
                signature_hash,
            });
        }

        Ok(Self {
            version,
            effects,
            ops,
            names: bytes[r.pos..].to_vec(),
        })
    }

    /// Byte offset of the first op record.
    pub fn ops_start(&self) -> usize {
        HEADER_SIZE + self.effects.len() * effect_record_size(self.version)
    }

    /// Index range into `ops` covered by an effect record.
    pub fn op_range(&self, effect: &RawEffectRecord) -> Result<std::ops::Range<usize>, TableDecodeError> {
        let bad = TableDecodeError::BadOpsOffset {
            effect_id: effect.effect_id,
            offset: effect.ops_offset,
        };
        let size = op_record_size(self.version);
        let rel = (effect.ops_offset as usize)
            .checked_sub(self.ops_start())
            .ok_or_else(|| bad.clone())?;
        if rel % size != 0 {
            return Err(bad);
        }
        let start = rel / size;
        let end = start + effect.op_count as usize;
        if end > self.ops.len() {
            return Err(bad);
        }
        Ok(start..end)
    }

    /// Resolve names and build the decoded table.
    pub fn resolve(&self) -> Result<EffectTable, TableDecodeError> {
        let mut effects = Vec::with_capacity(self.effects.len());
        for record in &self.effects {
            let name = read_name(&self.names, record.name_offset)?.to_string();
            let label = match record.label_offset {
                Some(offset) => read_name(&self.names, offset)?.to_string(),
                None => name.clone(),
            };
            let mut ops = Vec::with_capacity(record.op_count as usize);
            for raw in &self.ops[self.op_range(record)?] {
                let resume_kind = ResumeKind::from_u32(raw.resume_kind).ok_or(
                    TableDecodeError::InvalidResumeKind {
                        op_id: raw.op_id,
                        value: raw.resume_kind,
                    },
                )?;
                let op_name = read_name(&self.names, raw.name_offset)?.to_string();
                let op_label = match raw.label_offset {
                    Some(offset) => read_name(&self.names, offset)?.to_string(),
                    None => op_name.clone(),
                };
                ops.push(OpEntry {
                    op_id: raw.op_id,
                    name: op_name,
                    label: op_label,
                    resume_kind,
                    signature_hash: raw.signature_hash.unwrap_or(0),
                });
            }
            effects.push(EffectEntry {
                effect_id: record.effect_id,
                name,
                label,
                ops,
            });
        }
        Ok(EffectTable {
            version: self.version,
            effects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(version: u32) -> EffectTable {
        EffectTable {
            version,
            effects: vec![
                EffectEntry {
                    effect_id: 0,
                    name: "rill.time".into(),
                    label: "Time".into(),
                    ops: vec![
                        OpEntry {
                            op_id: 0,
                            name: "sleep".into(),
                            label: "Time.sleep".into(),
                            resume_kind: ResumeKind::Tail,
                            signature_hash: 0xdead_beef,
                        },
                        OpEntry {
                            op_id: 1,
                            name: "now".into(),
                            label: "Time.now".into(),
                            resume_kind: ResumeKind::Resume,
                            signature_hash: 7,
                        },
                    ],
                },
                EffectEntry {
                    effect_id: 3,
                    name: "rill.log".into(),
                    label: "Log".into(),
                    ops: vec![OpEntry {
                        op_id: 0,
                        name: "sleep".into(),
                        label: "Log.sleep".into(),
                        resume_kind: ResumeKind::Tail,
                        signature_hash: 0,
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_v1_layout_matches_fixed_records() {
        let table = sample(EFFECT_TABLE_V1);
        let bytes = table.encode().unwrap();
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &3u32.to_le_bytes());
        // first effect record: id 0, name at 0, ops right after the two effect records
        assert_eq!(&bytes[12..16], &0u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &0u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &((HEADER_SIZE + 2 * 16) as u32).to_le_bytes());
        assert_eq!(&bytes[24..28], &2u32.to_le_bytes());
    }

    #[test]
    fn test_v1_decodes_with_name_labels() {
        let table = sample(EFFECT_TABLE_V1);
        let decoded = EffectTable::decode(&table.encode().unwrap()).unwrap();
        assert_eq!(decoded.effects[0].label, "rill.time");
        assert_eq!(decoded.effects[0].ops[0].label, "sleep");
        assert_eq!(decoded.effects[0].ops[0].signature_hash, 0);
    }

    #[test]
    fn test_v2_roundtrip() {
        let table = sample(EFFECT_TABLE_V2);
        let decoded = EffectTable::decode(&table.encode().unwrap()).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn test_names_are_interned_once() {
        let table = sample(EFFECT_TABLE_V1);
        let raw = RawEffectTable::parse(&table.encode().unwrap()).unwrap();
        // "sleep" is used by two ops but stored once
        assert_eq!(raw.ops[0].name_offset, raw.ops[2].name_offset);
        let occurrences = raw
            .names
            .split(|b| *b == 0)
            .filter(|s| *s == b"sleep")
            .count();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn test_interior_nul_rejected() {
        let mut names = NamesBlob::new();
        assert!(matches!(
            names.intern("a\0b"),
            Err(TableEncodeError::InteriorNul { .. })
        ));
    }

    #[test]
    fn test_truncated_table() {
        let bytes = sample(EFFECT_TABLE_V2).encode().unwrap();
        let err = EffectTable::decode(&bytes[..20]).unwrap_err();
        assert!(matches!(err, TableDecodeError::Truncated { .. }));
    }

    #[test]
    fn test_unknown_version() {
        let mut bytes = sample(EFFECT_TABLE_V2).encode().unwrap();
        bytes[0] = 9;
        assert_eq!(
            EffectTable::decode(&bytes).unwrap_err(),
            TableDecodeError::UnsupportedVersion(9)
        );
    }

    #[test]
    fn test_op_count_mismatch() {
        let mut bytes = sample(EFFECT_TABLE_V1).encode().unwrap();
        bytes[8] = 5;
        assert!(matches!(
            EffectTable::decode(&bytes).unwrap_err(),
            TableDecodeError::OpCountMismatch { declared: 5, claimed: 3 }
        ));
    }

    #[test]
    fn test_bad_ops_offset() {
        let mut bytes = sample(EFFECT_TABLE_V1).encode().unwrap();
        // misalign the first effect's ops offset
        bytes[20] = bytes[20].wrapping_add(1);
        assert!(matches!(
            EffectTable::decode(&bytes).unwrap_err(),
            TableDecodeError::BadOpsOffset { effect_id: 0, .. }
        ));
    }
}
