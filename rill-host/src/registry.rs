//! Handler registration and invocation.
//!
//! Handlers are stored by op index. Registration goes through the protocol
//! table, either with raw ids ([`HostRegistry::register_handler`]) or with
//! human-readable keys ([`HostRegistry::register_handlers_by_key`]).
//! Invocation is asynchronous: a synchronous handler is wrapped in a ready
//! future.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use rill_runtime::codec::{self, encode_value};
use rill_runtime::Value;

use crate::error::{HostError, Result};
use crate::keys::{normalize_signature_hash, HandlerKey};
use crate::protocol::{HostProtocolTable, ProtocolOp};

/// Future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

type HandlerFn = dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync;

/// A host implementation of one operation.
#[derive(Clone)]
pub struct HostHandler {
    f: Arc<HandlerFn>,
}

impl HostHandler {
    /// Wrap a synchronous handler.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(move |args: Vec<Value>| {
                let result = f(&args);
                Box::pin(std::future::ready(result)) as HandlerFuture
            }),
        }
    }

    /// Wrap an asynchronous handler.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |args: Vec<Value>| Box::pin(f(args)) as HandlerFuture),
        }
    }

    pub fn call(&self, args: Vec<Value>) -> HandlerFuture {
        (self.f)(args)
    }
}

impl fmt::Debug for HostHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostHandler")
    }
}

/// Outcome of a keyed registration.
#[derive(Debug, Default)]
pub struct KeyedRegistration {
    /// Number of keys registered.
    pub registered: usize,
    /// Keys that failed, with why.
    pub failures: Vec<(String, HostError)>,
}

impl KeyedRegistration {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Handlers for the ops of one protocol table.
#[derive(Debug)]
pub struct HostRegistry {
    table: HostProtocolTable,
    handlers: Mutex<FxHashMap<u32, HostHandler>>,
}

impl HostRegistry {
    pub fn new(table: HostProtocolTable) -> Self {
        Self {
            table,
            handlers: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn table(&self) -> &HostProtocolTable {
        &self.table
    }

    /// Register `handler` for the op with exactly these ids. Returns its
    /// op index. A previous handler for the op is replaced.
    pub fn register_handler(
        &self,
        effect_id: &str,
        op_id: u32,
        signature_hash: &str,
        handler: HostHandler,
    ) -> Result<u32> {
        let hash = normalize_signature_hash(signature_hash)?;
        let op = self
            .table
            .ops
            .iter()
            .find(|op| op.effect_id == effect_id && op.op_id == op_id && op.signature_hash == hash)
            .ok_or_else(|| HostError::UnknownOp {
                effect_id: effect_id.to_string(),
                op_name: format!("#{}", op_id),
                signature_hash: Some(hash.clone()),
                known: self
                    .table
                    .ops
                    .iter()
                    .filter(|op| op.effect_id == effect_id)
                    .map(|op| format!("#{} {}", op.op_id, op.signature_hash))
                    .collect(),
            })?;
        Ok(self.install(op, handler))
    }

    /// Resolve and register every key independently.
    ///
    /// A key that fails leaves the others untouched.
    pub fn register_handlers_by_key(&self, handlers: IndexMap<String, HostHandler>) -> KeyedRegistration {
        let mut outcome = KeyedRegistration::default();
        for (key, handler) in handlers {
            let resolved = HandlerKey::parse(&key)
                .and_then(|parsed| self.table.resolve_effect_op(&parsed.to_query()).cloned())
                .and_then(|op| self.register_handler(&op.effect_id, op.op_id, &op.signature_hash, handler));
            match resolved {
                Ok(_) => outcome.registered += 1,
                Err(err) => {
                    warn!(%key, error = %err, "handler key rejected");
                    outcome.failures.push((key, err));
                }
            }
        }
        debug!(
            registered = outcome.registered,
            failed = outcome.failures.len(),
            "registered handlers by key"
        );
        outcome
    }

    fn install(&self, op: &ProtocolOp, handler: HostHandler) -> u32 {
        if self.handlers.lock().insert(op.op_index, handler).is_some() {
            debug!(op = %op.label, "replaced host handler");
        } else {
            trace!(op = %op.label, index = op.op_index, "registered host handler");
        }
        op.op_index
    }

    pub fn is_registered(&self, op_index: u32) -> bool {
        self.handlers.lock().contains_key(&op_index)
    }

    pub fn registered_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Ops of the table that still have no handler.
    pub fn missing(&self) -> Vec<&ProtocolOp> {
        let handlers = self.handlers.lock();
        self.table
            .ops
            .iter()
            .filter(|op| !handlers.contains_key(&op.op_index))
            .collect()
    }

    /// Call the handler of `op_index`.
    pub fn invoke(&self, op_index: u32, args: Vec<Value>) -> HandlerFuture {
        // The lock is released before the handler runs.
        let handler = self.handlers.lock().get(&op_index).cloned();
        match handler {
            Some(handler) => handler.call(args),
            None if self.table.op(op_index).is_none() => {
                Box::pin(std::future::ready(Err(HostError::UnknownOpIndex { op_index })))
            }
            None => Box::pin(std::future::ready(Err(HostError::NoHandler { op_index }))),
        }
    }

    /// Call the handler of `op_index` on a fresh current-thread runtime.
    ///
    /// Must not be called from inside a tokio runtime.
    pub fn invoke_blocking(&self, op_index: u32, args: Vec<Value>) -> Result<Value> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        runtime.block_on(self.invoke(op_index, args))
    }

    /// Call with a packed payload and return the packed result.
    ///
    /// The payload is the argument array written by
    /// [`codec::encode_args`]; anything else is rejected.
    pub async fn invoke_packed(&self, op_index: u32, payload: &[u8]) -> Result<Vec<u8>> {
        let args = codec::decode_args(payload)?;
        let result = self.invoke(op_index, args).await?;
        Ok(encode_value(&result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rill_runtime::codec::{decode_value, CodecError};
    use rill_runtime::effect_table::{EffectEntry, EffectTable, OpEntry, EFFECT_TABLE_V2};
    use rill_runtime::ResumeKind;

    fn registry() -> HostRegistry {
        let op = |op_id: u32, name: &str, hash: u32| OpEntry {
            op_id,
            name: name.to_string(),
            label: format!("Math.{}", name),
            resume_kind: ResumeKind::Tail,
            signature_hash: hash,
        };
        let table = EffectTable {
            version: EFFECT_TABLE_V2,
            effects: vec![EffectEntry {
                effect_id: 0,
                name: "app.math".into(),
                label: "Math".into(),
                ops: vec![op(0, "double", 0x12), op(1, "sum", 0x13)],
            }],
        };
        HostRegistry::new(HostProtocolTable::from_effect_table(&table))
    }

    fn double() -> HostHandler {
        HostHandler::from_fn(|args| match args {
            [Value::I32(v)] => Ok(Value::I32(v * 2)),
            _ => Err(HostError::handler("double takes one i32")),
        })
    }

    #[test]
    fn test_register_by_ids() {
        let registry = registry();
        let index = registry.register_handler("app.math", 0, "18", double()).unwrap();
        assert_eq!(index, 0);
        assert!(registry.is_registered(0));
        assert_eq!(registry.missing().len(), 1);

        let err = registry.register_handler("app.math", 0, "0x99", double()).unwrap_err();
        assert!(matches!(err, HostError::UnknownOp { .. }));
    }

    #[test]
    fn test_keys_register_independently() {
        let registry = registry();
        let mut handlers = IndexMap::new();
        handlers.insert("app.math::double".to_string(), double());
        handlers.insert("app.math::halve".to_string(), double());
        handlers.insert("not a key".to_string(), double());
        handlers.insert("app.math::sum::0x13".to_string(), double());

        let outcome = registry.register_handlers_by_key(handlers);
        assert_eq!(outcome.registered, 2);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures[0].0, "app.math::halve");
        assert!(matches!(outcome.failures[1].1, HostError::InvalidKey { .. }));
        assert!(!outcome.is_complete());
        assert_eq!(registry.registered_count(), 2);
    }

    #[test]
    fn test_invoke_blocking() {
        let registry = registry();
        registry.register_handler("app.math", 0, "0x12", double()).unwrap();
        assert_eq!(registry.invoke_blocking(0, vec![Value::I32(21)]).unwrap(), Value::I32(42));
        assert!(matches!(
            registry.invoke_blocking(1, vec![]),
            Err(HostError::NoHandler { op_index: 1 })
        ));
        assert!(matches!(
            registry.invoke_blocking(9, vec![]),
            Err(HostError::UnknownOpIndex { op_index: 9 })
        ));
    }

    #[tokio::test]
    async fn test_async_handler_and_packed_payload() {
        let registry = registry();
        let sum = HostHandler::from_async(|args: Vec<Value>| async move {
            tokio::task::yield_now().await;
            let total = args.iter().filter_map(Value::as_i64).sum::<i64>();
            Ok(Value::I64(total))
        });
        registry.register_handler("app.math", 1, "0x13", sum).unwrap();

        let payload = codec::encode_args(&[Value::I64(40), Value::I64(2)]).unwrap();
        let packed = registry.invoke_packed(1, &payload).await.unwrap();
        assert_eq!(decode_value(&packed).unwrap(), Value::I64(42));
    }

    #[tokio::test]
    async fn test_packed_payload_must_be_an_argument_array() {
        let registry = registry();
        let count = HostHandler::from_fn(|args| Ok(Value::I64(args.len() as i64)));
        registry.register_handler("app.math", 1, "0x13", count).unwrap();

        let single = Value::Array(vec![Value::I64(1), Value::I64(2), Value::I64(3)]);
        let payload = codec::encode_args(&[single]).unwrap();
        let packed = registry.invoke_packed(1, &payload).await.unwrap();
        assert_eq!(decode_value(&packed).unwrap(), Value::I64(1));

        let bare = encode_value(&Value::I64(5)).unwrap();
        assert!(matches!(
            registry.invoke_packed(1, &bare).await,
            Err(HostError::Codec(CodecError::NotArguments { found: "i64" }))
        ));
    }
}
