//! # Effect Compilation
//!
//! The passes that take a typed program's effect model down to substrate
//! code:
//!
//! 1. [`mir`]: effect model (ids, rows, purity, resolved performs, clauses)
//! 2. [`sites`]: continuation sites and their environment records
//! 3. [`abi`]: runtime ABI types and helpers, emitted once per program
//! 4. [`lowering`]: performs, effectful calls and handlers
//! 5. [`boundary`]: host signatures and host imports
//! 6. [`table`]: the effect table custom section

pub mod abi;
pub mod boundary;
pub mod lowering;
pub mod mir;
pub mod sites;
pub mod table;

pub use boundary::{BoundaryError, HostBoundary, HostSignature, Slot, ValueKind, WireValue};
pub use lowering::{EffectLowering, ExprCompiler, ImportExprCompiler, LowerCx, LoweringError, Target};
pub use mir::{EffectMir, EffectModelError};
pub use sites::{ContinuationSite, SiteError, SiteTable};
pub use table::{attach_effect_table, build_effect_table};
