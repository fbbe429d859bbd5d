//! # Rill Runtime
//!
//! Runtime support shared by compiled Rill programs, the `rillc` compiler
//! and host embedders.
//!
//! ## Modules
//!
//! - [`abi`]: effect and operation ids, resume kinds
//! - [`dispatch`]: executable trampoline dispatcher
//! - [`frame`] and [`continuation`]: handler chains and resumable segments
//! - [`effect_table`]: the binary effect table sidecar
//! - [`codec`] and [`value`]: packed payloads for the host boundary
//! - [`scheduler`]: deterministic virtual-time runtime
//!
//! ## Example
//!
//! ```rust
//! use rill_runtime::prelude::*;
//!
//! let mut clauses = ClauseTable::new();
//! let ask = clauses.register(|m, _frame, _env, req| req.resume(m, Value::I64(42)));
//! let mut machine = Machine::new(clauses);
//!
//! let install = HandlerInstall::new(vec![FrameSpec::new(EffectId(0), OpId(0), ResumeKind::Tail, ask)]);
//! let answer = machine
//!     .run(None, |m, h| {
//!         m.handle(h, install, |m, h| {
//!             Ok(m.perform(h, EffectId(0), OpId(0), ResumeKind::Tail, Value::Unit))
//!         })
//!     })
//!     .unwrap();
//! assert_eq!(answer, Value::I64(42));
//! ```

pub mod abi;
pub mod codec;
pub mod config;
pub mod continuation;
pub mod dispatch;
pub mod effect_table;
pub mod error;
pub mod frame;
pub mod scheduler;
pub mod value;

pub use abi::{format_signature_hash, EffectId, OpId, ResumeKind};
pub use config::{CodecConfig, DispatchConfig, RuntimeConfig};
pub use error::RuntimeError;
pub use value::Value;

/// Commonly used items.
pub mod prelude {
    pub use crate::abi::{EffectId, OpId, ResumeKind};
    pub use crate::continuation::{Continuation, Segment, SharedContinuation};
    pub use crate::dispatch::{ClauseTable, EffectRequest, HandlerInstall, Machine, Outcome};
    pub use crate::error::{Result, RuntimeError};
    pub use crate::frame::{ClauseId, FrameRef, FrameSpec, HandlerFrame};
    pub use crate::value::Value;
}
