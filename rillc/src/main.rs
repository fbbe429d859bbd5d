//! Rill effect compiler binary
//!
//! Run with: `rillc [COMMAND]`

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use rill_runtime::effect_table::EffectTable;
use rillc::diagnostics::DiagnosticEmitter;
use rillc::effects::ImportExprCompiler;
use rillc::model::ProgramModel;
use rillc::{Compilation, CompilerConfig, LinkedProgram};

#[derive(Parser)]
#[command(name = "rillc")]
#[command(about = "Effect compiler for Rill")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Compiler configuration (rill.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the effect table of a program
    Table {
        /// Program models, one per module
        #[arg(required = true)]
        programs: Vec<PathBuf>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run the effect passes and print the emitted modules
    Emit {
        /// Program models, one per module
        #[arg(required = true)]
        programs: Vec<PathBuf>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decode an effect table and print it as JSON
    Inspect {
        /// Table file
        table: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => CompilerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => CompilerConfig::default(),
    };
    debug!(?config, "configuration");

    match cli.command {
        Commands::Table { programs, output } => {
            let linked = link(&programs, config)?;
            let bytes = linked.table.encode().context("encoding the effect table")?;
            fs::write(&output, &bytes).with_context(|| format!("writing {}", output.display()))?;
            info!(
                path = %output.display(),
                bytes = bytes.len(),
                effects = linked.table.effects.len(),
                "wrote effect table"
            );
        }
        Commands::Emit { programs, output } => {
            let linked = link(&programs, config)?;
            let text: String = linked.modules.iter().map(|m| m.module.to_string()).collect();
            match output {
                Some(path) => fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?,
                None => print!("{}", text),
            }
        }
        Commands::Inspect { table } => {
            let bytes = fs::read(&table).with_context(|| format!("reading {}", table.display()))?;
            let decoded = EffectTable::decode(&bytes).with_context(|| format!("decoding {}", table.display()))?;
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
    }

    Ok(())
}

fn load_program(path: &Path) -> Result<ProgramModel> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    ProgramModel::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Compile and link every program; report the first failure as a
/// diagnostic.
fn link(paths: &[PathBuf], config: CompilerConfig) -> Result<LinkedProgram> {
    let mut compilation = Compilation::new(config);
    let mut compiler = ImportExprCompiler::new();

    for path in paths {
        let program = load_program(path)?;
        let filename = path.display().to_string();
        if let Err(err) = compilation.compile_program(&program, &mut compiler) {
            DiagnosticEmitter::new(&filename, "").emit(&err.to_diagnostic())?;
            bail!("compilation of {} failed", filename);
        }
    }

    match compilation.finish() {
        Ok(linked) => Ok(linked),
        Err(err) => {
            DiagnosticEmitter::new("<link>", "").emit(&err.to_diagnostic())?;
            bail!("linking failed")
        }
    }
}
