//! Host-side errors.

use thiserror::Error;

use rill_runtime::codec::CodecError;
use rill_runtime::effect_table::TableDecodeError;

/// Result type for host operations.
pub type Result<T> = std::result::Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("`{effect_id}::{op_name}` matches several operations; add a signature hash, one of: {}", .candidates.join(", "))]
    AmbiguousHandlerKey {
        effect_id: String,
        op_name: String,
        candidates: Vec<String>,
    },

    #[error("no operation `{effect_id}::{op_name}`{}; known: {}", signature_suffix(.signature_hash), .known.join(", "))]
    UnknownOp {
        effect_id: String,
        op_name: String,
        signature_hash: Option<String>,
        /// Known signature hashes of the op, or known op names of the
        /// effect when the name itself is unknown.
        known: Vec<String>,
    },

    #[error("effect `{effect_id}` is not in the protocol table; known: {}", .known.join(", "))]
    UnknownEffect { effect_id: String, known: Vec<String> },

    #[error("invalid handler key `{key}`: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("no handler registered for op {op_index}")]
    NoHandler { op_index: u32 },

    #[error("op {op_index} is not in the protocol table")]
    UnknownOpIndex { op_index: u32 },

    #[error("capability `{capability}` cannot run `{op}`: {reason}")]
    Unsupported {
        capability: String,
        op: String,
        reason: String,
    },

    #[error("`{op}` argument {index}: expected {expected}, got {found}")]
    BadArgument {
        op: String,
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("effect table: {0}")]
    Table(#[from] TableDecodeError),

    #[error("packed payload: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid host configuration: {0}")]
    Config(#[from] toml::de::Error),
}

fn signature_suffix(hash: &Option<String>) -> String {
    hash.as_ref().map(|h| format!(" with signature {}", h)).unwrap_or_default()
}

impl HostError {
    pub fn handler(message: impl Into<String>) -> Self {
        HostError::Handler(message.into())
    }
}
