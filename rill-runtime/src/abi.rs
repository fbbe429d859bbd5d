//! Identifiers shared by the compiler, the runtime and the host.
//!
//! These are the integers that cross every boundary of the effect system:
//! they appear in emitted handler frames, in the effect table sidecar and in
//! host handler registrations, so their numeric encodings are part of the ABI.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Global effect identifier, stable across every module of a linked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectId(pub u32);

impl EffectId {
    /// Get the raw id.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operation identifier, scoped to its effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

impl OpId {
    /// Get the raw id.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a handler clause may resume the continuation of a perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeKind {
    /// Resume at most once, as the last action of the clause.
    Tail,
    /// The continuation is a first-class value; resumed zero or one times.
    Resume,
}

impl ResumeKind {
    /// Wire encoding used by handler frames and the effect table.
    pub fn as_u32(self) -> u32 {
        match self {
            ResumeKind::Tail => 0,
            ResumeKind::Resume => 1,
        }
    }

    /// Decode the wire encoding.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ResumeKind::Tail),
            1 => Some(ResumeKind::Resume),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResumeKind::Tail => "tail",
            ResumeKind::Resume => "resume",
        }
    }
}

impl fmt::Display for ResumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a signature hash the way every protocol surface prints it.
pub fn format_signature_hash(hash: u32) -> String {
    format!("0x{:08x}", hash)
}
