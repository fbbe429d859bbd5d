//! `rill.log`: guest log lines as tracing events.

use tracing::{debug, error, info, warn};

use rill_runtime::Value;

use super::{arg_str, Capability, CapabilityHandlers};
use crate::config::LogConfig;
use crate::registry::HostHandler;

const OPS: &[&str] = &["debug", "info", "warn", "error"];

#[derive(Debug, Clone)]
pub struct Log {
    enabled: bool,
}

impl Log {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            enabled: config.enabled,
        }
    }
}

impl Capability for Log {
    fn name(&self) -> &'static str {
        "log"
    }

    fn effect_id(&self) -> &'static str {
        "rill.log"
    }

    fn op_names(&self) -> &'static [&'static str] {
        OPS
    }

    fn handlers(&self) -> CapabilityHandlers {
        if !self.enabled {
            return Err("logging is disabled".to_string());
        }
        let level = |op: &'static str, emit: fn(&str)| {
            (
                op,
                HostHandler::from_fn(move |args| {
                    emit(arg_str(op, args, 0)?);
                    Ok(Value::Unit)
                }),
            )
        };
        Ok(vec![
            level("debug", |m| debug!(target: "rill::guest", "{}", m)),
            level("info", |m| info!(target: "rill::guest", "{}", m)),
            level("warn", |m| warn!(target: "rill::guest", "{}", m)),
            level("error", |m| error!(target: "rill::guest", "{}", m)),
        ])
    }
}
