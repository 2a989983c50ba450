//! Lumen CLI - Main Entry Point

use clap::{Parser, Subcommand};
use lumen_cli::commands::{catalog, config, env, target, test};
use lumen_cli::output;
use lumen_engine::{Lumen, LumenConfig};
use std::path::PathBuf;

/// Lumen - accessibility test runner
#[derive(Parser)]
#[command(name = "lumen")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "LUMEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage environments and their page trees
    #[command(subcommand)]
    Env(env::EnvCommands),

    /// Import and inspect the test catalog
    #[command(subcommand)]
    Catalog(catalog::CatalogCommands),

    /// Create, run, close and reopen environment tests
    #[command(subcommand)]
    Test(test::TestCommands),

    /// Review targets
    #[command(subcommand)]
    Target(target::TargetCommands),

    /// Show or write the configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| lumen_common::default_store_path().join("config.toml"));
    let config = LumenConfig::load(&config_path)?;
    tracing::debug!("Using config {} (store {})", config_path.display(), config.store_path.display());

    match cli.command {
        Commands::Config(cmd) => config::execute(cmd, &config, &config_path, cli.format)?,
        Commands::Version => {
            println!("Lumen CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Store: {}", config.store_path.display());
        }
        Commands::Env(cmd) => env::execute(cmd, &Lumen::open(config)?, cli.format).await?,
        Commands::Catalog(cmd) => catalog::execute(cmd, &Lumen::open(config)?, cli.format)?,
        Commands::Test(cmd) => test::execute(cmd, &Lumen::open(config)?, cli.format).await?,
        Commands::Target(cmd) => target::execute(cmd, &Lumen::open(config)?, cli.format)?,
    }

    Ok(())
}
