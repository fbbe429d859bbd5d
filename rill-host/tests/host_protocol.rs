//! End-to-end host protocol tests: encoded table in, handlers out.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;

use rill_host::{
    install_capabilities, HandlerKey, HostConfig, HostError, HostHandler, HostProtocolTable, HostRegistry,
};
use rill_runtime::codec::{decode_value, encode_args};
use rill_runtime::effect_table::{EffectEntry, EffectTable, OpEntry, EFFECT_TABLE_V2};
use rill_runtime::{ResumeKind, Value};

fn op(op_id: u32, name: &str, label: &str, hash: u32) -> OpEntry {
    OpEntry {
        op_id,
        name: name.to_string(),
        label: format!("{}.{}", label, name),
        resume_kind: ResumeKind::Tail,
        signature_hash: hash,
    }
}

fn effect(effect_id: u32, name: &str, label: &str, ops: Vec<OpEntry>) -> EffectEntry {
    EffectEntry {
        effect_id,
        name: name.to_string(),
        label: label.to_string(),
        ops,
    }
}

/// What a linked program with a user effect and a few built-ins looks like
/// on the wire.
fn encoded_table() -> Vec<u8> {
    EffectTable {
        version: EFFECT_TABLE_V2,
        effects: vec![
            effect(
                1,
                "app.kv",
                "Kv",
                vec![op(0, "get", "Kv", 0x0000_00a1), op(1, "put", "Kv", 0x0000_00a2)],
            ),
            effect(
                2,
                "rill.log",
                "Log",
                vec![op(0, "info", "Log", 0x10), op(1, "error", "Log", 0x10)],
            ),
            effect(3, "rill.random", "Random", vec![op(0, "next_i64", "Random", 0x20)]),
            // A second generation of app.kv with a different `get`.
            effect(4, "app.kv", "Kv", vec![op(0, "get", "Kv", 0x0000_00b1)]),
        ],
    }
    .encode()
    .unwrap()
}

fn registry() -> HostRegistry {
    HostRegistry::new(HostProtocolTable::from_bytes(&encoded_table()).unwrap())
}

#[test]
fn test_decoded_table_has_program_wide_indices() {
    let table = HostProtocolTable::from_bytes(&encoded_table()).unwrap();
    let labels: Vec<(u32, &str)> = table.ops.iter().map(|op| (op.op_index, op.label.as_str())).collect();
    assert_eq!(
        labels,
        [
            (0, "Kv.get"),
            (1, "Kv.put"),
            (2, "Log.info"),
            (3, "Log.error"),
            (4, "Random.next_i64"),
            (5, "Kv.get"),
        ]
    );
    assert_eq!(table.effect_ids(), ["app.kv", "rill.log", "rill.random"]);
    assert_eq!(table.ops[5].signature_hash, "0x000000b1");
}

#[test]
fn test_ambiguous_key_needs_a_signature() {
    let registry = registry();
    let mut handlers = IndexMap::new();
    handlers.insert("app.kv::get".to_string(), HostHandler::from_fn(|_| Ok(Value::Unit)));
    handlers.insert("app.kv::put".to_string(), HostHandler::from_fn(|_| Ok(Value::Unit)));
    let outcome = registry.register_handlers_by_key(handlers);

    assert_eq!(outcome.registered, 1);
    match &outcome.failures[..] {
        [(key, HostError::AmbiguousHandlerKey { candidates, .. })] => {
            assert_eq!(key, "app.kv::get");
            assert_eq!(candidates, &["0x000000a1", "0x000000b1"]);
        }
        other => panic!("unexpected failures {:?}", other),
    }
}

#[test]
fn test_decimal_signature_selects_one_generation() {
    let registry = registry();
    let mut handlers = IndexMap::new();
    // 177 == 0xb1
    handlers.insert(
        "app.kv::get::177".to_string(),
        HostHandler::from_fn(|_| Ok(Value::Str("new".into()))),
    );
    handlers.insert(
        HandlerKey::new("app.kv", "get").with_signature(0xa1).to_string(),
        HostHandler::from_fn(|_| Ok(Value::Str("old".into()))),
    );
    assert!(registry.register_handlers_by_key(handlers).is_complete());

    assert_eq!(registry.invoke_blocking(0, vec![]).unwrap(), Value::Str("old".into()));
    assert_eq!(registry.invoke_blocking(5, vec![]).unwrap(), Value::Str("new".into()));
}

#[test]
fn test_unknown_effect_and_op_are_distinct_errors() {
    let registry = registry();
    let mut handlers = IndexMap::new();
    handlers.insert("app.nope::get".to_string(), HostHandler::from_fn(|_| Ok(Value::Unit)));
    handlers.insert("app.kv::delete".to_string(), HostHandler::from_fn(|_| Ok(Value::Unit)));
    let outcome = registry.register_handlers_by_key(handlers);

    assert!(matches!(outcome.failures[0].1, HostError::UnknownEffect { .. }));
    match &outcome.failures[1].1 {
        HostError::UnknownOp { known, .. } => assert_eq!(known, &["get", "put"]),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_capabilities_fill_builtin_ops() {
    let registry = registry();
    let config = HostConfig::from_toml("[random]\nseed = 3\n").unwrap();
    let reports = install_capabilities(&registry, &config);

    let registered: Vec<&str> = reports
        .iter()
        .flat_map(|r| r.registered_ops.iter().map(String::as_str))
        .collect();
    assert_eq!(registered, ["Random.next_i64", "Log.info", "Log.error"]);

    let missing: Vec<u32> = registry.missing().iter().map(|op| op.op_index).collect();
    assert_eq!(missing, [0, 1, 5]);
    assert!(matches!(registry.invoke_blocking(4, vec![]).unwrap(), Value::I64(_)));
}

#[tokio::test]
async fn test_packed_call_through_the_registry() {
    let registry = registry();
    let store = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&store);
    registry
        .register_handler(
            "app.kv",
            1,
            "0xa2",
            HostHandler::from_fn(move |args| {
                sink.lock().extend(args.iter().cloned());
                Ok(Value::Bool(true))
            }),
        )
        .unwrap();

    let payload = encode_args(&[Value::Str("k".into()), Value::I32(7)]).unwrap();
    let result = registry.invoke_packed(1, &payload).await.unwrap();
    assert_eq!(decode_value(&result).unwrap(), Value::Bool(true));
    assert_eq!(*store.lock(), [Value::Str("k".into()), Value::I32(7)]);
}
