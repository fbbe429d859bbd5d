//! Runtime configuration.
//!
//! All settings deserialize from TOML with defaults for missing keys, so a
//! host can embed a `[runtime]` table in its own configuration file.

use serde::{Deserialize, Serialize};

/// Configuration for the deterministic scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of turns a single drain may take before it is
    /// reported as divergent.
    pub max_turns: usize,

    /// System clock value (ms since the epoch) at virtual time zero.
    pub initial_system_ms: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_turns: 10_000,
            initial_system_ms: 0,
        }
    }
}

/// Configuration for the dispatcher trampoline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum clause invocations a single `dispatch` call may perform.
    pub max_steps: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { max_steps: 1_000_000 }
    }
}

/// Configuration for the packed value codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Maximum nesting depth of arrays and maps accepted by the decoder.
    pub max_depth: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self { max_depth: 64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_turns, 10_000);
        assert_eq!(DispatchConfig::default().max_steps, 1_000_000);
        assert_eq!(CodecConfig::default().max_depth, 64);
    }
}
