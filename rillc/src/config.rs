//! Compiler configuration.
//!
//! Loaded from `rill.toml`. Every table and key is optional:
//!
//! ```toml
//! [effects]
//! table_version = 2
//! section_name = "rill.effects"
//! export_name = "__rill_effect_table"
//!
//! [boundary]
//! host_effects = ["app.clock"]
//!
//! [output]
//! verify = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rill_runtime::effect_table::CURRENT_VERSION;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level compiler configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub effects: EffectsConfig,
    pub boundary: BoundaryConfig,
    pub output: OutputConfig,
}

impl CompilerConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }
}

/// Effect table emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    /// Effect table layout version to write.
    pub table_version: u32,

    /// Name of the custom section holding the table.
    pub section_name: String,

    /// Export identifier hosts use to locate the table.
    pub export_name: String,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            table_version: CURRENT_VERSION,
            section_name: "rill.effects".to_string(),
            export_name: "__rill_effect_table".to_string(),
        }
    }
}

/// Host boundary resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// External effect names treated as host-serviceable in addition to
    /// effects declared with `host = true`.
    pub host_effects: Vec<String>,
}

/// Output checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Run the structural verifier on every emitted module.
    pub verify: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { verify: true }
    }
}
