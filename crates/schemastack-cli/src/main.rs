//! SchemaStack CLI
//!
//! Inspect and migrate SchemaStack stores outside of an application.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use schemastack_core::Config;

mod commands;
mod output;

use commands::Target;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "schemastack")]
#[command(about = "SchemaStack - versioned object stores with schema migration")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to ~/.config/schemastack/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing <Model>.models resource folders
    #[arg(long, global = true)]
    bundle: Option<PathBuf>,

    /// Name of the model
    #[arg(long, global = true)]
    model: Option<String>,

    /// Directory holding store files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List bundled model versions in migration order
    Versions,
    /// Show the store on disk and which versions it is compatible with
    Status,
    /// Bring the store up to the current model version
    Migrate,
    /// Count the records of an entity
    Count {
        /// Entity name
        entity: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    if let Err(e) = run(cli, &output).await {
        output.error(&e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    let target = Target::resolve(
        config,
        cli.model.clone(),
        cli.bundle.clone(),
        cli.data_dir.clone(),
    )?;

    match cli.command {
        Commands::Versions => commands::versions::list(&target, output),
        Commands::Status => commands::status::show(&target, output),
        Commands::Migrate => commands::migrate::run(&target, output),
        Commands::Count { entity } => commands::count::run(&target, entity, output).await,
    }
}

/// Log to stderr; RUST_LOG takes precedence over -v
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "schemastack_core={},schemastack_cli={}",
            level, level
        ))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
