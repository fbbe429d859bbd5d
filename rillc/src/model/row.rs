//! # Effect Row Types
//!
//! Effect rows are sets of effect obligations with an optional row variable:
//!
//! ```text
//! EffectRow ::= {} | {E, E.op, ...} | {E, E.op, ... | ρ}
//! ```
//!
//! A whole-effect entry `E` covers every operation of `E`; an operation
//! entry `E.op` covers just that operation. Row algebra beyond composition
//! belongs to the type checker. The effect passes only ask whether a row is
//! empty and whether it covers an operation, and add obligations for
//! performs the checker left out.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ids::DefId;

/// A row variable for effect polymorphism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowVar(pub u32);

impl RowVar {
    /// Effects of a callee the checker did not resolve and gave no row.
    pub const UNKNOWN: RowVar = RowVar(u32::MAX);

    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// A single-operation obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpRef {
    pub effect: DefId,
    pub op: DefId,
}

impl OpRef {
    pub fn new(effect: DefId, op: DefId) -> Self {
        Self { effect, op }
    }
}

/// An effect row representing a set of obligations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectRow {
    effects: BTreeSet<DefId>,
    ops: BTreeSet<OpRef>,
    row_var: Option<RowVar>,
}

impl EffectRow {
    /// Create an empty effect row (pure).
    pub fn pure() -> Self {
        Self::default()
    }

    /// A row with one whole-effect obligation.
    pub fn single_effect(effect: DefId) -> Self {
        let mut row = Self::pure();
        row.add_effect(effect);
        row
    }

    /// A row with one operation obligation.
    pub fn single_op(effect: DefId, op: DefId) -> Self {
        let mut row = Self::pure();
        row.add_op(effect, op);
        row
    }

    /// Create a polymorphic effect row with just a row variable.
    pub fn polymorphic(row_var: RowVar) -> Self {
        Self {
            row_var: Some(row_var),
            ..Self::default()
        }
    }

    pub fn add_effect(&mut self, effect: DefId) {
        self.effects.insert(effect);
    }

    pub fn add_op(&mut self, effect: DefId, op: DefId) {
        self.ops.insert(OpRef::new(effect, op));
    }

    pub fn set_row_var(&mut self, row_var: RowVar) {
        self.row_var = Some(row_var);
    }

    /// Empty row: no obligations and no row variable.
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.ops.is_empty() && self.row_var.is_none()
    }

    pub fn is_polymorphic(&self) -> bool {
        self.row_var.is_some()
    }

    /// Whole-effect entries.
    pub fn effects(&self) -> impl Iterator<Item = DefId> + '_ {
        self.effects.iter().copied()
    }

    /// Operation entries.
    pub fn ops(&self) -> impl Iterator<Item = OpRef> + '_ {
        self.ops.iter().copied()
    }

    pub fn row_var(&self) -> Option<RowVar> {
        self.row_var
    }

    /// True if the row explicitly covers `effect.op`.
    ///
    /// A row variable does not count: it stands for effects the caller
    /// does not know about.
    pub fn contains_op(&self, effect: DefId, op: DefId) -> bool {
        self.effects.contains(&effect) || self.ops.contains(&OpRef::new(effect, op))
    }

    /// Extend this row with effects from another row.
    pub fn extend(&mut self, other: &EffectRow) {
        self.effects.extend(other.effects.iter().copied());
        self.ops.extend(other.ops.iter().copied());
        if other.row_var.is_some() && self.row_var.is_none() {
            self.row_var = other.row_var;
        }
    }
}
