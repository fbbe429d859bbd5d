//! # Effect Dispatch
//!
//! Executable form of the dispatcher the compiler emits into every program.
//! Effectful code returns an [`Outcome`]: either a final value or a pending
//! [`EffectRequest`]. The dispatcher is a trampoline that services requests
//! by calling handler clauses until a value comes back or no installed frame
//! claims the request.
//!
//! ## Matching
//!
//! The search starts at the frame chain stored on the request, not at the
//! frame of whoever called `dispatch`, and walks it innermost first. A frame
//! claims a request only if effect id, op id and resume kind all agree.
//! The first claiming frame wins, so an inner handler shadows an outer one.
//!
//! ## Bubbling
//!
//! A request no frame claims is returned unchanged. [`Machine::handle`]
//! wraps such a request's continuation so that resuming it re-enters the
//! handler's own dispatch loop before control returns to the outer handler.
//! A request that reaches [`Machine::run`] unclaimed is an unhandled effect.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::abi::{EffectId, OpId, ResumeKind};
use crate::config::DispatchConfig;
use crate::continuation::{Continuation, Segment};
use crate::error::{Result, RuntimeError};
use crate::frame::{ClauseId, FrameChain, FrameRef, FrameSpec, HandlerFrame};
use crate::value::Value;

// ============================================================================
// Requests and Outcomes
// ============================================================================

/// A pending effect operation.
#[derive(Debug)]
pub struct EffectRequest {
    pub effect_id: EffectId,
    pub op_id: OpId,
    pub resume_kind: ResumeKind,
    /// Handler chain active at the perform site.
    pub handler: Option<FrameRef>,
    pub payload: Value,
    /// Rest of the computation that performed the request.
    pub continuation: Continuation,
}

impl EffectRequest {
    /// Resume the performer with `value`.
    pub fn resume(self, machine: &mut Machine, value: Value) -> Result<Outcome> {
        self.continuation.resume(machine, value)
    }

    /// Split off the continuation, leaving the identity in its place.
    pub fn take_continuation(&mut self) -> Continuation {
        std::mem::take(&mut self.continuation)
    }
}

/// Result of running effectful code.
#[derive(Debug)]
pub enum Outcome {
    Value(Value),
    Request(EffectRequest),
}

impl Outcome {
    pub fn value(v: impl Into<Value>) -> Self {
        Outcome::Value(v.into())
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Outcome::Value(v) => Some(v),
            Outcome::Request(_) => None,
        }
    }

    /// Sequence `next` after this outcome.
    ///
    /// A value is passed straight to `next`. A request gets `next` appended
    /// to its continuation, so it runs once the request is resumed.
    pub fn and_then<F>(self, machine: &mut Machine, next: F) -> Result<Outcome>
    where
        F: FnOnce(&mut Machine, Value) -> Result<Outcome> + Send + 'static,
    {
        match self {
            Outcome::Value(v) => next(machine, v),
            Outcome::Request(mut request) => {
                request.continuation.push_outer(Segment::new(next));
                Ok(Outcome::Request(request))
            }
        }
    }
}

// ============================================================================
// Clause Table
// ============================================================================

/// Shared signature of every handler clause.
///
/// Receives the matching frame, its clause environment and the request
/// (which owns the performer's continuation).
pub type ClauseFn =
    Arc<dyn Fn(&mut Machine, &HandlerFrame, &Value, EffectRequest) -> Result<Outcome> + Send + Sync>;

/// Clause bodies indexed by [`ClauseId`].
#[derive(Default, Clone)]
pub struct ClauseTable {
    clauses: Vec<ClauseFn>,
}

impl fmt::Debug for ClauseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClauseTable")
            .field("clauses", &self.clauses.len())
            .finish()
    }
}

impl ClauseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a clause and return its id.
    pub fn register<F>(&mut self, clause: F) -> ClauseId
    where
        F: Fn(&mut Machine, &HandlerFrame, &Value, EffectRequest) -> Result<Outcome> + Send + Sync + 'static,
    {
        let id = ClauseId(self.clauses.len() as u32);
        self.clauses.push(Arc::new(clause));
        id
    }

    pub fn get(&self, id: ClauseId) -> Option<&ClauseFn> {
        self.clauses.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

// ============================================================================
// Machine
// ============================================================================

/// Frames and finalizer installed by one handler expression.
#[derive(Default)]
pub struct HandlerInstall {
    pub frames: Vec<FrameSpec>,
    pub finally: Option<FinallyFn>,
}

/// Runs when a handler expression completes with a value.
pub type FinallyFn = Arc<dyn Fn(&mut Machine, Value) -> Result<Value> + Send + Sync>;

impl HandlerInstall {
    pub fn new(frames: Vec<FrameSpec>) -> Self {
        Self { frames, finally: None }
    }

    pub fn with_finally<F>(mut self, finally: F) -> Self
    where
        F: Fn(&mut Machine, Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.finally = Some(Arc::new(finally));
        self
    }
}

/// Dispatch counters, mostly for tests and benches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub clause_calls: u64,
    pub bubbled: u64,
}

/// The dispatcher and its clause table.
#[derive(Debug, Default)]
pub struct Machine {
    clauses: ClauseTable,
    config: DispatchConfig,
    stats: DispatchStats,
}

impl Machine {
    pub fn new(clauses: ClauseTable) -> Self {
        Self::with_config(clauses, DispatchConfig::default())
    }

    pub fn with_config(clauses: ClauseTable, config: DispatchConfig) -> Self {
        Self {
            clauses,
            config,
            stats: DispatchStats::default(),
        }
    }

    pub fn clauses_mut(&mut self) -> &mut ClauseTable {
        &mut self.clauses
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Build a request for `perform effect.op(payload)` under `handler`.
    pub fn perform(
        &self,
        handler: Option<&FrameRef>,
        effect_id: EffectId,
        op_id: OpId,
        resume_kind: ResumeKind,
        payload: Value,
    ) -> Outcome {
        Outcome::Request(EffectRequest {
            effect_id,
            op_id,
            resume_kind,
            handler: handler.cloned(),
            payload,
            continuation: Continuation::new(),
        })
    }

    /// Service `outcome` against installed frames.
    ///
    /// `initial` is only consulted for requests that carry no handler chain.
    pub fn dispatch(&mut self, initial: Option<&FrameRef>, outcome: Outcome) -> Result<Outcome> {
        let mut current = outcome;
        let mut steps = 0usize;
        loop {
            let request = match current {
                Outcome::Value(_) => return Ok(current),
                Outcome::Request(request) => request,
            };

            let start = request.handler.as_ref().or(initial);
            let matched = FrameChain::from_head(start)
                .find(|frame| frame.matches(request.effect_id, request.op_id, request.resume_kind));

            let frame = match matched {
                Some(frame) => frame,
                None => {
                    debug!(
                        effect = %request.effect_id,
                        op = %request.op_id,
                        "request bubbles past installed frames"
                    );
                    self.stats.bubbled += 1;
                    return Ok(Outcome::Request(request));
                }
            };

            steps += 1;
            if steps > self.config.max_steps {
                return Err(RuntimeError::DispatchDivergence {
                    max_steps: self.config.max_steps,
                });
            }

            let clause = self
                .clauses
                .get(frame.clause)
                .cloned()
                .ok_or(RuntimeError::UnknownClause(frame.clause))?;
            trace!(
                effect = %request.effect_id,
                op = %request.op_id,
                clause = %frame.clause,
                "dispatching to clause"
            );
            self.stats.clause_calls += 1;
            current = clause(self, frame.as_ref(), &frame.clause_env, request)?;
        }
    }

    /// Run `body` under a handler expression.
    ///
    /// Pushes the handler's frames in front of `outer`, runs the body with
    /// the extended chain, dispatches the body's outcome and applies the
    /// finalizer to a final value.
    pub fn handle<B>(&mut self, outer: Option<&FrameRef>, install: HandlerInstall, body: B) -> Result<Outcome>
    where
        B: FnOnce(&mut Machine, Option<&FrameRef>) -> Result<Outcome>,
    {
        let mut inner = outer.cloned();
        for spec in install.frames {
            inner = Some(HandlerFrame::push(inner, spec));
        }
        let outcome = body(self, inner.as_ref())?;
        self.complete(inner, install.finally, outcome)
    }

    fn complete(&mut self, inner: Option<FrameRef>, finally: Option<FinallyFn>, outcome: Outcome) -> Result<Outcome> {
        match self.dispatch(inner.as_ref(), outcome)? {
            Outcome::Value(v) => match &finally {
                Some(finally) => Ok(Outcome::Value(finally(self, v)?)),
                None => Ok(Outcome::Value(v)),
            },
            Outcome::Request(mut request) => {
                let rest = request.take_continuation();
                request.continuation = Continuation::from_segment(Segment::new(move |machine, value| {
                    let resumed = rest.resume(machine, value)?;
                    machine.complete(inner, finally, resumed)
                }));
                Ok(Outcome::Request(request))
            }
        }
    }

    /// Run a top-level computation to a value.
    pub fn run<B>(&mut self, handler: Option<&FrameRef>, body: B) -> Result<Value>
    where
        B: FnOnce(&mut Machine, Option<&FrameRef>) -> Result<Outcome>,
    {
        let outcome = body(self, handler)?;
        match self.dispatch(handler, outcome)? {
            Outcome::Value(v) => Ok(v),
            Outcome::Request(request) => Err(RuntimeError::UnhandledEffect {
                effect_id: request.effect_id,
                op_id: request.op_id,
                resume_kind: request.resume_kind,
            }),
        }
    }
}
