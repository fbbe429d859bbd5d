//! # rillc
//!
//! Effect compilation for the Rill language: the effect model of a typed
//! program, continuation sites, the runtime ABI, effect lowering, the host
//! boundary and the effect table.
//!
//! The front end (parsing, name resolution, type inference) is not part of
//! this crate. It hands over a [`model::TypedProgram`] and, for expressions
//! the effect passes do not own, an [`effects::ExprCompiler`].
//!
//! ## Modules
//!
//! - [`model`]: the typed program contract
//! - [`effects`]: the effect passes
//! - [`substrate`]: the target IR, build registry and verifier
//! - [`driver`]: multi-module compilation
//! - [`diagnostics`], [`span`], [`config`]: ambient support

pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod effects;
pub mod model;
pub mod span;
pub mod substrate;

pub use config::CompilerConfig;
pub use driver::{Compilation, CompiledModule, DriverError, LinkedProgram};
