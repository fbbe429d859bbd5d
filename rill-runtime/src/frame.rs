//! # Handler Frames
//!
//! A handler frame records one `(effect, operation, resume kind)` claim of
//! an installed handler. Frames form a singly linked chain from the most
//! recently installed frame outwards.
//!
//! Frames are immutable and shared. A request that bubbles out of a handler
//! keeps a reference to the chain that was active at its perform site, and
//! the handler that eventually resumes it may do so after the installing
//! scope has returned. The chain therefore cannot live on a LIFO stack; each
//! node is reference counted and "popping" a handler simply means the code
//! after the handler expression goes back to using the outer chain.

use std::fmt;
use std::sync::Arc;

use crate::abi::{EffectId, OpId, ResumeKind};
use crate::value::Value;

/// Stable index of a clause in a [`crate::dispatch::ClauseTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClauseId(pub u32);

impl fmt::Display for ClauseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clause#{}", self.0)
    }
}

/// Shared reference to a frame.
pub type FrameRef = Arc<HandlerFrame>;

/// One installed handler claim.
#[derive(Debug)]
pub struct HandlerFrame {
    pub effect_id: EffectId,
    pub op_id: OpId,
    pub resume_kind: ResumeKind,
    pub clause: ClauseId,
    /// Values captured by the handler expression, passed to the clause.
    pub clause_env: Value,
    pub prev: Option<FrameRef>,
}

/// Everything needed to push a frame, minus the link.
#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub effect_id: EffectId,
    pub op_id: OpId,
    pub resume_kind: ResumeKind,
    pub clause: ClauseId,
    pub clause_env: Value,
}

impl FrameSpec {
    pub fn new(effect_id: EffectId, op_id: OpId, resume_kind: ResumeKind, clause: ClauseId) -> Self {
        Self {
            effect_id,
            op_id,
            resume_kind,
            clause,
            clause_env: Value::Unit,
        }
    }

    pub fn with_env(mut self, env: Value) -> Self {
        self.clause_env = env;
        self
    }
}

impl HandlerFrame {
    /// Link a new frame in front of `prev`.
    pub fn push(prev: Option<FrameRef>, spec: FrameSpec) -> FrameRef {
        Arc::new(HandlerFrame {
            effect_id: spec.effect_id,
            op_id: spec.op_id,
            resume_kind: spec.resume_kind,
            clause: spec.clause,
            clause_env: spec.clause_env,
            prev,
        })
    }

    /// Three-way match used by dispatch.
    pub fn matches(&self, effect_id: EffectId, op_id: OpId, resume_kind: ResumeKind) -> bool {
        self.effect_id == effect_id && self.op_id == op_id && self.resume_kind == resume_kind
    }

    /// Walk this frame and every outer frame.
    pub fn chain(self: &Arc<Self>) -> FrameChain {
        FrameChain {
            next: Some(Arc::clone(self)),
        }
    }
}

/// Iterator over a frame chain, innermost first.
pub struct FrameChain {
    next: Option<FrameRef>,
}

impl FrameChain {
    pub fn from_head(head: Option<&FrameRef>) -> Self {
        Self { next: head.cloned() }
    }
}

impl Iterator for FrameChain {
    type Item = FrameRef;

    fn next(&mut self) -> Option<FrameRef> {
        let current = self.next.take()?;
        self.next = current.prev.clone();
        Some(current)
    }
}
