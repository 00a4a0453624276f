//! Configuration view and validation commands: `docflow config`.

use anyhow::{Context, Result, bail};
use docflow::config::{CONFIG_FILE, DocflowConfig};
use std::path::{Path, PathBuf};

use super::super::{Cli, ConfigCommands};

fn config_path(cli: &Cli, project_dir: &Path) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| project_dir.join(CONFIG_FILE))
}

/// Effective configuration: file (explicit `--config` must exist), then
/// `DOCFLOW_*` environment overrides.
pub fn load_config(cli: &Cli, project_dir: &Path) -> Result<DocflowConfig> {
    let mut config = match &cli.config {
        Some(path) => DocflowConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DocflowConfig::load_or_default(project_dir)?,
    };
    config
        .apply_env()
        .context("Invalid configuration override in environment")?;

    for warning in config.validate() {
        tracing::warn!(%warning, "Configuration warning");
    }
    Ok(config)
}

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let path = config_path(cli, project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Docflow Configuration");
            println!("=====================");
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No {} found at {}; using defaults", CONFIG_FILE, path.display());
            }
            println!("Effective values (with env overrides):");
            println!();

            let config = load_config(cli, project_dir)?;
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let config = load_config(cli, project_dir)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                bail!("{} configuration warning(s)", warnings.len());
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            DocflowConfig::default().save(&path)?;
            println!("Created {}", path.display());
        }
    }

    Ok(())
}
