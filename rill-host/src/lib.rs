//! # Rill Host
//!
//! The host side of the Rill effect boundary. A compiled module carries an
//! effect table; the host decodes it into a [`HostProtocolTable`], attaches
//! handlers to its operations and serves the calls the module makes.
//!
//! ## Modules
//!
//! - [`protocol`]: the flat op table and query resolution
//! - [`keys`]: `effect::op[::signature]` handler keys
//! - [`registry`]: handler registration and invocation
//! - [`capabilities`]: built-in handlers for the `rill.*` effects
//! - [`config`]: TOML host configuration
//!
//! ## Example
//!
//! ```rust
//! use indexmap::IndexMap;
//! use rill_host::{HostHandler, HostProtocolTable, HostRegistry};
//! use rill_runtime::effect_table::{EffectEntry, EffectTable, OpEntry, EFFECT_TABLE_V2};
//! use rill_runtime::{ResumeKind, Value};
//!
//! let table = EffectTable {
//!     version: EFFECT_TABLE_V2,
//!     effects: vec![EffectEntry {
//!         effect_id: 0,
//!         name: "app.greet".into(),
//!         label: "Greet".into(),
//!         ops: vec![OpEntry {
//!             op_id: 0,
//!             name: "hello".into(),
//!             label: "Greet.hello".into(),
//!             resume_kind: ResumeKind::Tail,
//!             signature_hash: 0,
//!         }],
//!     }],
//! };
//! let registry = HostRegistry::new(HostProtocolTable::from_effect_table(&table));
//!
//! let mut handlers = IndexMap::new();
//! handlers.insert(
//!     "app.greet::hello".to_string(),
//!     HostHandler::from_fn(|_| Ok(Value::Str("hi".into()))),
//! );
//! assert!(registry.register_handlers_by_key(handlers).is_complete());
//! assert_eq!(registry.invoke_blocking(0, vec![]).unwrap(), Value::Str("hi".into()));
//! ```

pub mod capabilities;
pub mod config;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod registry;

pub use capabilities::{install_capabilities, register_capability, Capability, CapabilityRegistration};
pub use config::HostConfig;
pub use error::{HostError, Result};
pub use keys::HandlerKey;
pub use protocol::{EffectOpQuery, HostProtocolTable, ProtocolOp};
pub use registry::{HandlerFuture, HostHandler, HostRegistry, KeyedRegistration};
