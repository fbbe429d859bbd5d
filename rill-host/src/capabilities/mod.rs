//! Built-in host capabilities.
//!
//! Each capability implements the operations of one well-known effect and
//! registers a handler for every table op with a matching name, whatever
//! its signature. A capability that cannot run on this host still
//! registers: its handlers fail with [`HostError::Unsupported`] and the
//! registration records the reason.

mod console;
mod env;
mod fs;
mod log;
mod net;
mod random;
mod time;

pub use console::Console;
pub use env::Env;
pub use fs::Fs;
pub use self::log::Log;
pub use net::Net;
pub use random::Random;
pub use time::Time;

use serde::Serialize;
use tracing::{debug, warn};

use rill_runtime::Value;

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::registry::{HostHandler, HostRegistry};

/// What a capability managed to register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityRegistration {
    pub capability: String,
    pub effect_id: String,
    /// Number of table ops that got a handler.
    pub registered: usize,
    /// Labels of those ops, for reports.
    pub registered_ops: Vec<String>,
    pub supported: bool,
    pub reason: Option<String>,
}

/// Handlers of a capability by op name, or why it cannot run here.
pub type CapabilityHandlers = std::result::Result<Vec<(&'static str, HostHandler)>, String>;

pub trait Capability {
    /// Short name, e.g. `fs`.
    fn name(&self) -> &'static str;

    /// Effect the capability implements, e.g. `rill.fs`.
    fn effect_id(&self) -> &'static str;

    fn op_names(&self) -> &'static [&'static str];

    fn handlers(&self) -> CapabilityHandlers;
}

/// Register one capability against every matching op of the table.
pub fn register_capability(registry: &HostRegistry, capability: &dyn Capability) -> CapabilityRegistration {
    let (handlers, reason) = match capability.handlers() {
        Ok(handlers) => (handlers, None),
        Err(reason) => {
            warn!(capability = capability.name(), %reason, "capability unsupported");
            let stubs = capability
                .op_names()
                .iter()
                .map(|op| (*op, unsupported(capability.name(), op, &reason)))
                .collect();
            (stubs, Some(reason))
        }
    };

    let mut registered_ops = Vec::new();
    for (op_name, handler) in handlers {
        let matching: Vec<_> = registry
            .table()
            .candidates(capability.effect_id(), op_name)
            .cloned()
            .collect();
        for op in matching {
            match registry.register_handler(&op.effect_id, op.op_id, &op.signature_hash, handler.clone()) {
                Ok(_) => registered_ops.push(op.label.clone()),
                Err(err) => warn!(op = %op.label, error = %err, "capability op not registered"),
            }
        }
    }

    debug!(
        capability = capability.name(),
        ops = registered_ops.len(),
        supported = reason.is_none(),
        "registered capability"
    );
    CapabilityRegistration {
        capability: capability.name().to_string(),
        effect_id: capability.effect_id().to_string(),
        registered: registered_ops.len(),
        registered_ops,
        supported: reason.is_none(),
        reason,
    }
}

/// Register every built-in capability as configured.
pub fn install_capabilities(registry: &HostRegistry, config: &HostConfig) -> Vec<CapabilityRegistration> {
    let capabilities: Vec<Box<dyn Capability>> = vec![
        Box::new(Fs::new(&config.fs)),
        Box::new(Time::new(&config.time)),
        Box::new(Env::new(&config.env)),
        Box::new(Random::new(&config.random)),
        Box::new(Log::new(&config.log)),
        Box::new(Net::new(&config.net)),
        Box::new(Console::new(&config.console)),
    ];
    capabilities
        .iter()
        .map(|capability| register_capability(registry, capability.as_ref()))
        .collect()
}

/// A handler that always fails with [`HostError::Unsupported`].
pub fn unsupported(capability: &str, op: &str, reason: &str) -> HostHandler {
    let (capability, op, reason) = (capability.to_string(), op.to_string(), reason.to_string());
    HostHandler::from_fn(move |_| {
        Err(HostError::Unsupported {
            capability: capability.clone(),
            op: op.clone(),
            reason: reason.clone(),
        })
    })
}

fn bad_argument(op: &str, args: &[Value], index: usize, expected: &'static str) -> HostError {
    HostError::BadArgument {
        op: op.to_string(),
        index,
        expected,
        found: args.get(index).map_or("nothing", Value::kind_name),
    }
}

pub(crate) fn arg_str<'a>(op: &str, args: &'a [Value], index: usize) -> Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| bad_argument(op, args, index, "string"))
}

pub(crate) fn arg_i64(op: &str, args: &[Value], index: usize) -> Result<i64> {
    match args.get(index) {
        Some(Value::I64(v)) => Ok(*v),
        Some(Value::I32(v)) => Ok(i64::from(*v)),
        _ => Err(bad_argument(op, args, index, "integer")),
    }
}

/// Bytes, or a string's UTF-8 bytes.
pub(crate) fn arg_bytes<'a>(op: &str, args: &'a [Value], index: usize) -> Result<&'a [u8]> {
    match args.get(index) {
        Some(Value::Bytes(bytes)) => Ok(bytes),
        Some(Value::Str(text)) => Ok(text.as_bytes()),
        _ => Err(bad_argument(op, args, index, "bytes")),
    }
}
