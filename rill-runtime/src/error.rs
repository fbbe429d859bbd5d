//! Runtime faults.

use thiserror::Error;

use crate::abi::{EffectId, OpId, ResumeKind};
use crate::codec::CodecError;
use crate::frame::ClauseId;

/// Result alias used throughout the executable runtime.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised while running effectful code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// A request bubbled past the outermost installed handler.
    #[error("unhandled effect {effect_id} operation {op_id} ({resume_kind})")]
    UnhandledEffect {
        effect_id: EffectId,
        op_id: OpId,
        resume_kind: ResumeKind,
    },

    #[error("no handler clause registered for {0}")]
    UnknownClause(ClauseId),

    /// A one-shot continuation was resumed twice.
    #[error("continuation already resumed")]
    ContinuationAlreadyResumed,

    #[error("dispatch did not settle within {max_steps} clause invocations")]
    DispatchDivergence { max_steps: usize },

    /// A clause or continuation segment reported its own failure.
    #[error("handler clause failed: {0}")]
    ClauseFault(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl RuntimeError {
    /// Shorthand for a clause-level failure.
    pub fn fault(message: impl Into<String>) -> Self {
        RuntimeError::ClauseFault(message.into())
    }
}
