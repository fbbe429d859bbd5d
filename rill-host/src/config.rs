//! Host configuration.
//!
//! Read from TOML; every key has a default so an empty file enables the
//! capabilities that need no setup.
//!
//! ```toml
//! [fs]
//! root = "sandbox"
//!
//! [random]
//! seed = 7
//!
//! [net]
//! enabled = true
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use rill_runtime::RuntimeConfig;

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub fs: FsConfig,
    pub time: TimeConfig,
    pub env: EnvConfig,
    pub random: RandomConfig,
    pub log: LogConfig,
    pub net: NetConfig,
    pub console: ConsoleConfig,
}

impl HostConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub enabled: bool,
    /// Guest paths resolve under this directory.
    pub root: PathBuf,
    pub read_only: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("."),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// Serve time from a virtual clock instead of the wall clock.
    pub virtual_clock: bool,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Variables the guest may read; empty allows all.
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomConfig {
    /// Fixed seed for reproducible runs; otherwise seeded from the OS.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HostConfig::from_toml("").unwrap();
        assert_eq!(config, HostConfig::default());
        assert!(config.fs.enabled);
        assert!(!config.net.enabled);
        assert!(config.random.seed.is_none());
    }

    #[test]
    fn test_partial_tables() {
        let config = HostConfig::from_toml(
            r#"
            [fs]
            root = "sandbox"
            read_only = true

            [random]
            seed = 7

            [time]
            virtual_clock = true
            [time.runtime]
            max_turns = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.fs.root, PathBuf::from("sandbox"));
        assert!(config.fs.read_only && config.fs.enabled);
        assert_eq!(config.random.seed, Some(7));
        assert_eq!(config.time.runtime.max_turns, 50);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "[net]\nenabled = true\n").unwrap();
        assert!(HostConfig::load(&path).unwrap().net.enabled);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(HostConfig::from_toml("[fs]\nenabled = \"yes\"").is_err());
    }
}
