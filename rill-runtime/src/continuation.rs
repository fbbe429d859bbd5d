//! # Continuations
//!
//! A suspended computation is a chain of segments, innermost first. Each
//! segment is the code that runs after one suspend point, with its captured
//! environment closed over. Resuming feeds a value into the innermost
//! segment and threads each result outwards.
//!
//! If a segment produces a new request instead of a value, the segments that
//! have not run yet are appended to that request's continuation, so the new
//! request carries everything needed to finish the original computation.
//!
//! `Continuation` is one-shot by construction: `resume` consumes it.
//! [`SharedContinuation`] is the first-class form handed to clauses that
//! store the continuation as a value; its one-shot rule is checked at
//! runtime.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatch::{Machine, Outcome};
use crate::error::{Result, RuntimeError};
use crate::value::Value;

type SegmentFn = Box<dyn FnOnce(&mut Machine, Value) -> Result<Outcome> + Send>;

/// The code after one suspend point.
pub struct Segment {
    resume: SegmentFn,
}

impl Segment {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&mut Machine, Value) -> Result<Outcome> + Send + 'static,
    {
        Self { resume: Box::new(f) }
    }

    fn run(self, machine: &mut Machine, value: Value) -> Result<Outcome> {
        (self.resume)(machine, value)
    }
}

/// A resumable chain of segments.
#[derive(Default)]
pub struct Continuation {
    segments: VecDeque<Segment>,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl Continuation {
    /// The identity continuation: resuming yields the value unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segment(segment: Segment) -> Self {
        let mut segments = VecDeque::with_capacity(1);
        segments.push_back(segment);
        Self { segments }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Add a segment that runs after every existing one.
    pub fn push_outer(&mut self, segment: Segment) {
        self.segments.push_back(segment);
    }

    /// Add all of `outer`'s segments after the existing ones.
    pub fn append_outer(&mut self, mut outer: Continuation) {
        self.segments.append(&mut outer.segments);
    }

    /// Resume with `value`.
    pub fn resume(mut self, machine: &mut Machine, value: Value) -> Result<Outcome> {
        let mut current = Outcome::Value(value);
        while let Some(segment) = self.segments.pop_front() {
            match current {
                Outcome::Value(v) => current = segment.run(machine, v)?,
                Outcome::Request(mut request) => {
                    self.segments.push_front(segment);
                    request.continuation.append_outer(self);
                    return Ok(Outcome::Request(request));
                }
            }
        }
        Ok(current)
    }
}

/// A one-shot continuation that can be stored and resumed later.
#[derive(Clone, Default)]
pub struct SharedContinuation {
    slot: Arc<Mutex<Option<Continuation>>>,
}

impl fmt::Debug for SharedContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContinuation")
            .field("resumed", &self.is_resumed())
            .finish()
    }
}

impl SharedContinuation {
    pub fn new(continuation: Continuation) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(continuation))),
        }
    }

    pub fn is_resumed(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Resume the continuation; fails if it was already taken.
    pub fn resume(&self, machine: &mut Machine, value: Value) -> Result<Outcome> {
        let continuation = self
            .slot
            .lock()
            .take()
            .ok_or(RuntimeError::ContinuationAlreadyResumed)?;
        continuation.resume(machine, value)
    }

    /// Drop the continuation without resuming it.
    pub fn discard(&self) -> bool {
        self.slot.lock().take().is_some()
    }
}
