//! `rill.env`: process environment and arguments.

use std::sync::Arc;

use rill_runtime::Value;

use super::{arg_str, Capability, CapabilityHandlers};
use crate::config::EnvConfig;
use crate::error::HostError;
use crate::registry::HostHandler;

const OPS: &[&str] = &["get", "args"];

#[derive(Debug, Clone)]
pub struct Env {
    allow: Arc<Vec<String>>,
}

impl Env {
    pub fn new(config: &EnvConfig) -> Self {
        Self {
            allow: Arc::new(config.allow.clone()),
        }
    }
}

impl Capability for Env {
    fn name(&self) -> &'static str {
        "env"
    }

    fn effect_id(&self) -> &'static str {
        "rill.env"
    }

    fn op_names(&self) -> &'static [&'static str] {
        OPS
    }

    fn handlers(&self) -> CapabilityHandlers {
        let allow = Arc::clone(&self.allow);
        let get = HostHandler::from_fn(move |args| {
            let name = arg_str("get", args, 0)?;
            if !allow.is_empty() && !allow.iter().any(|a| a == name) {
                return Err(HostError::handler(format!("environment variable `{}` is not readable", name)));
            }
            // Unset reads as unit.
            Ok(std::env::var(name).map(Value::Str).unwrap_or(Value::Unit))
        });
        let args = HostHandler::from_fn(|_| Ok(Value::Array(std::env::args().map(Value::Str).collect())));
        Ok(vec![("get", get), ("args", args)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::register_capability;
    use crate::capabilities::tests::registry_for;

    #[test]
    fn test_allow_list() {
        let registry = registry_for(&[("rill.env", OPS)]);
        let env = Env::new(&EnvConfig {
            allow: vec!["PATH".into(), "RILL_SURELY_UNSET".into()],
        });
        register_capability(&registry, &env);

        assert!(matches!(
            registry.invoke_blocking(0, vec![Value::Str("PATH".into())]).unwrap(),
            Value::Str(_)
        ));
        assert_eq!(
            registry
                .invoke_blocking(0, vec![Value::Str("RILL_SURELY_UNSET".into())])
                .unwrap(),
            Value::Unit
        );
        assert!(registry.invoke_blocking(0, vec![Value::Str("HOME".into())]).is_err());
    }

    #[test]
    fn test_args_are_strings() {
        let registry = registry_for(&[("rill.env", OPS)]);
        register_capability(&registry, &Env::new(&EnvConfig::default()));
        match registry.invoke_blocking(1, vec![]).unwrap() {
            Value::Array(items) => assert!(items.iter().all(|v| matches!(v, Value::Str(_)))),
            other => panic!("unexpected {:?}", other),
        }
    }
}
