//! Compilation driver for linked Rill programs.
//!
//! A [`Compilation`] owns the build registry for the whole program. Each
//! module is run through the effect passes as it is added; [`Compilation::finish`]
//! then settles the program-wide host signatures, emits the host boundary
//! of every module and attaches the effect table to the module owning the
//! runtime ABI.
//!
//! # Example
//!
//! ```ignore
//! use rillc::driver::Compilation;
//! use rillc::effects::ImportExprCompiler;
//!
//! let mut compilation = Compilation::new(CompilerConfig::default());
//! compilation.compile_program(&program, &mut ImportExprCompiler::new())?;
//! let linked = compilation.finish()?;
//! ```

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info};

use rill_runtime::effect_table::{EffectTable, TableEncodeError};

use crate::config::CompilerConfig;
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::abi::ensure_runtime_abi;
use crate::effects::{
    attach_effect_table, build_effect_table, BoundaryError, EffectLowering, EffectMir, EffectModelError, ExprCompiler,
    HostBoundary, LoweringError, SiteError, SiteTable,
};
use crate::model::TypedProgram;
use crate::span::Span;
use crate::substrate::{verify, AbiOwnership, BuildRegistry, Module, ModuleError, VerifyError};

/// Errors that can occur during compilation.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Model(#[from] EffectModelError),

    #[error(transparent)]
    Sites(#[from] SiteError),

    #[error(transparent)]
    Boundary(#[from] BoundaryError),

    #[error(transparent)]
    Lowering(#[from] LoweringError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("effect table: {0}")]
    Table(#[from] TableEncodeError),

    #[error("module `{0}` is compiled twice")]
    DuplicateModule(String),

    #[error("no modules to link")]
    Empty,
}

impl DriverError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            DriverError::Model(e) => e.to_diagnostic(),
            DriverError::Sites(e) => e.to_diagnostic(),
            DriverError::Boundary(e) => e.to_diagnostic(),
            DriverError::Lowering(e) => e.to_diagnostic(),
            other => Diagnostic::error(other.to_string(), Span::dummy()).with_error_code(ErrorCode::InvalidModule),
        }
    }
}

/// One module after the effect passes.
#[derive(Debug)]
pub struct CompiledModule {
    pub module: Module,
    pub mir: EffectMir,
    pub sites: SiteTable,
    pub boundary: HostBoundary,
    pub abi: AbiOwnership,
}

/// A whole program in progress.
#[derive(Debug)]
pub struct Compilation {
    config: CompilerConfig,
    registry: BuildRegistry,
    modules: IndexMap<String, CompiledModule>,
}

impl Compilation {
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            config,
            registry: BuildRegistry::new(),
            modules: IndexMap::new(),
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn registry(&self) -> &BuildRegistry {
        &self.registry
    }

    pub fn module(&self, name: &str) -> Option<&CompiledModule> {
        self.modules.get(name)
    }

    /// Run the effect passes over one module of the program.
    pub fn compile_program(
        &mut self,
        program: &dyn TypedProgram,
        compiler: &mut dyn ExprCompiler,
    ) -> Result<&CompiledModule, DriverError> {
        let name = program.module_name().to_string();
        if self.modules.contains_key(&name) {
            return Err(DriverError::DuplicateModule(name));
        }

        let mir = EffectMir::build(program, &mut self.registry)?;
        let sites = SiteTable::materialize(&mir)?;
        let boundary = HostBoundary::resolve(&mir, &mut self.registry, &self.config.boundary)?;

        let mut module = Module::new(name.clone());
        let abi = ensure_runtime_abi(&mut module, &mut self.registry)?;
        sites.declare_env_types(&mut module)?;
        EffectLowering::new(&mir, &sites).emit(&mut module, compiler)?;

        debug!(
            module = %name,
            functions = mir.functions().count(),
            sites = sites.len(),
            host_ops = boundary.ops().count(),
            "compiled module"
        );
        self.modules.insert(
            name.clone(),
            CompiledModule {
                module,
                mir,
                sites,
                boundary,
                abi,
            },
        );
        self.modules.get(&name).ok_or(DriverError::Empty)
    }

    /// Link the program: host boundaries, effect table, verification.
    pub fn finish(mut self) -> Result<LinkedProgram, DriverError> {
        if self.modules.is_empty() {
            return Err(DriverError::Empty);
        }
        let table = build_effect_table(&self.registry, self.config.effects.table_version);

        for compiled in self.modules.values_mut() {
            compiled.boundary.settle(&self.registry);
            compiled.boundary.emit(&mut compiled.module)?;
            if compiled.abi == AbiOwnership::Define {
                attach_effect_table(&mut compiled.module, &table, &self.config.effects)?;
            }
            if self.config.output.verify {
                verify(&compiled.module)?;
            }
        }

        info!(
            modules = self.modules.len(),
            effects = table.effects.len(),
            ops = table.op_count(),
            "linked program"
        );
        Ok(LinkedProgram {
            modules: self.modules.into_values().collect(),
            table,
            registry: self.registry,
        })
    }
}

/// The output of a finished compilation.
#[derive(Debug)]
pub struct LinkedProgram {
    pub modules: Vec<CompiledModule>,
    pub table: EffectTable,
    pub registry: BuildRegistry,
}

impl LinkedProgram {
    /// The module defining the runtime ABI and carrying the effect table.
    pub fn main_module(&self) -> Option<&CompiledModule> {
        self.modules.iter().find(|m| m.abi == AbiOwnership::Define)
    }

    pub fn module(&self, name: &str) -> Option<&CompiledModule> {
        self.modules.iter().find(|m| m.module.name() == name)
    }
}
