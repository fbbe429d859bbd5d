//! # Substrate IR
//!
//! A small model of the garbage-collected stack-machine target: struct,
//! array and function types, structured instructions, modules with imports,
//! exports and custom sections.
//!
//! - [`types`]: value and type definitions
//! - [`instr`]: instructions
//! - [`module`]: modules, function builders, text printer
//! - [`registry`]: program-lifetime build registry
//! - [`verify`]: structural verifier

pub mod instr;
pub mod module;
pub mod registry;
pub mod types;
pub mod verify;

pub use instr::Instr;
pub use module::{CustomSection, Function, FunctionBuilder, Import, Module, ModuleError};
pub use registry::{AbiOwnership, BuildRegistry, EffectShape, OpShape, RegisteredEffect, RegistryError};
pub use types::{FieldType, HeapType, RefType, TypeDef, TypeGroup, ValType};
pub use verify::{verify, VerifyError};
