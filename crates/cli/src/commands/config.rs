//! Config Commands

use anyhow::Result;
use clap::Subcommand;
use lumen_engine::LumenConfig;
use std::path::Path;

use crate::output::{print_info, print_success, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the effective configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn execute(cmd: ConfigCommands, config: &LumenConfig, path: &Path, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(config)?),
            OutputFormat::Table | OutputFormat::Plain => {
                print_info(&format!("Config file: {}", path.display()));
                print!("{}", toml::to_string_pretty(config)?);
            }
        },

        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
            }
            config.save(path)?;
            print_success(&format!("Wrote {}", path.display()));
        }
    }

    Ok(())
}
