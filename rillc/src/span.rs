//! Source spans.
//!
//! The typed program model carries byte ranges into the original source so
//! effect faults can be reported against the code that caused them.

use serde::{Deserialize, Serialize};

/// A byte range `[start, end)` in a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Span for synthesized code.
    pub fn dummy() -> Self {
        Self::default()
    }

    pub fn is_dummy(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest span covering both.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Clamp the span to a source of length `len`.
    pub fn clamp(self, len: usize) -> Span {
        let start = self.start.min(len);
        Span {
            start,
            end: self.end.clamp(start, len),
        }
    }
}
