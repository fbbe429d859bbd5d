//! Property-based tests for the effect table wire format.

use proptest::prelude::*;
use rill_runtime::effect_table::{
    read_name, EffectEntry, EffectTable, OpEntry, RawEffectTable, EFFECT_TABLE_V1, EFFECT_TABLE_V2,
};
use rill_runtime::ResumeKind;

fn ident() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.]{0,12}"
}

fn resume_kind() -> impl Strategy<Value = ResumeKind> {
    prop_oneof![Just(ResumeKind::Tail), Just(ResumeKind::Resume)]
}

fn op(op_id: u32) -> impl Strategy<Value = OpEntry> {
    (ident(), ident(), resume_kind(), any::<u32>()).prop_map(move |(name, label, resume_kind, signature_hash)| OpEntry {
        op_id,
        name,
        label,
        resume_kind,
        signature_hash,
    })
}

fn effect(effect_id: u32) -> impl Strategy<Value = EffectEntry> {
    (ident(), ident(), 0usize..6)
        .prop_flat_map(move |(name, label, n)| {
            let ops: Vec<_> = (0..n as u32).map(op).collect();
            (Just(name), Just(label), ops)
        })
        .prop_map(move |(name, label, ops)| EffectEntry {
            effect_id,
            name,
            label,
            ops,
        })
}

fn table(version: u32) -> impl Strategy<Value = EffectTable> {
    (0usize..6)
        .prop_flat_map(|n| (0..n as u32).map(effect).collect::<Vec<_>>())
        .prop_map(move |effects| EffectTable { version, effects })
}

proptest! {
    /// Decoding an encoded v2 table reproduces it exactly.
    #[test]
    fn v2_roundtrip(t in table(EFFECT_TABLE_V2)) {
        let bytes = t.encode().unwrap();
        prop_assert_eq!(EffectTable::decode(&bytes).unwrap(), t);
    }

    /// v1 keeps ids, names and resume kinds; labels fall back to names.
    #[test]
    fn v1_roundtrip_preserves_core_tuples(t in table(EFFECT_TABLE_V1)) {
        let decoded = EffectTable::decode(&t.encode().unwrap()).unwrap();
        let expected: Vec<_> = t.iter_ops()
            .map(|(e, o)| (e.effect_id, o.op_id, o.name.clone(), o.resume_kind))
            .collect();
        let actual: Vec<_> = decoded.iter_ops()
            .map(|(e, o)| (e.effect_id, o.op_id, o.name.clone(), o.resume_kind))
            .collect();
        prop_assert_eq!(actual, expected);
        for (e, o) in decoded.iter_ops() {
            prop_assert_eq!(&e.label, &e.name);
            prop_assert_eq!(&o.label, &o.name);
        }
    }

    /// Every recorded name offset points at the right string.
    #[test]
    fn names_reachable_by_offset(t in table(EFFECT_TABLE_V2)) {
        let raw = RawEffectTable::parse(&t.encode().unwrap()).unwrap();
        prop_assert_eq!(raw.effects.len(), t.effects.len());
        for (record, entry) in raw.effects.iter().zip(&t.effects) {
            prop_assert_eq!(read_name(&raw.names, record.name_offset).unwrap(), entry.name.as_str());
            let label_offset = record.label_offset.unwrap();
            prop_assert_eq!(read_name(&raw.names, label_offset).unwrap(), entry.label.as_str());
            let range = raw.op_range(record).unwrap();
            for (op_record, op) in raw.ops[range].iter().zip(&entry.ops) {
                prop_assert_eq!(read_name(&raw.names, op_record.name_offset).unwrap(), op.name.as_str());
            }
        }
    }

    /// No string appears twice in the names blob.
    #[test]
    fn names_blob_has_no_duplicates(t in table(EFFECT_TABLE_V2)) {
        let raw = RawEffectTable::parse(&t.encode().unwrap()).unwrap();
        let mut seen = std::collections::HashSet::new();
        for name in raw.names.split(|b| *b == 0).filter(|s| !s.is_empty()) {
            prop_assert!(seen.insert(name.to_vec()));
        }
    }

    /// Truncating a non-empty table anywhere never panics.
    #[test]
    fn truncation_is_an_error(t in table(EFFECT_TABLE_V2), cut in 0usize..64) {
        let bytes = t.encode().unwrap();
        let end = cut.min(bytes.len());
        if end < 12 {
            prop_assert!(EffectTable::decode(&bytes[..end]).is_err());
        } else {
            let _ = EffectTable::decode(&bytes[..end]);
        }
    }
}
