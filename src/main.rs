use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docflow::logging::{LogFormat, init_logging};
use docflow::ui::UiMode;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "docflow")]
#[command(
    version,
    about = "Run interdependent generation jobs in parallel under a shared quota"
)]
pub struct Cli {
    /// Log filter (e.g. "debug" or "docflow::dag=trace"). Overrides DOCFLOW_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log line format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Path to the config file. Defaults to ./docflow.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve a catalog and print the execution order and waves
    Plan {
        /// Catalog file (.json, .yaml, .yml or .toml)
        catalog: PathBuf,
        /// Items to plan. Plans the whole catalog when omitted.
        ids: Vec<String>,
    },
    /// Execute a catalog against the built-in simulated generator
    Run {
        /// Catalog file (.json, .yaml, .yml or .toml)
        catalog: PathBuf,
        /// Items to run. Runs the whole catalog when omitted.
        ids: Vec<String>,
        /// Project id used for the progress channel
        #[arg(long, default_value = "default")]
        project: String,
        /// Simulated generation time per item
        #[arg(long, default_value = "200")]
        delay_ms: u64,
        /// Items whose generation fails permanently
        #[arg(long = "fail", value_name = "ID")]
        fail: Vec<String>,
        /// Items whose first attempt fails transiently
        #[arg(long = "flaky", value_name = "ID")]
        flaky: Vec<String>,
        /// Override executor.max_concurrency
        #[arg(long)]
        concurrency: Option<usize>,
        /// Progress display: full, minimal or json
        #[arg(long, default_value = "full")]
        ui: UiMode,
        /// Print the run report as JSON when done
        #[arg(long)]
        report: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default docflow.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; anything else in it is a real error.
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        return Err(e).context("Failed to load .env");
    }

    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref(), cli.log_format)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Plan { catalog, ids } => {
            let config = cmd::load_config(&cli, &project_dir)?;
            cmd::cmd_plan(&config, catalog, ids)?;
        }
        Commands::Run {
            catalog,
            ids,
            project,
            delay_ms,
            fail,
            flaky,
            concurrency,
            ui,
            report,
        } => {
            let mut config = cmd::load_config(&cli, &project_dir)?;
            if let Some(max) = concurrency {
                config.executor.max_concurrency = *max;
            }
            let options = cmd::RunOptions {
                catalog: catalog.clone(),
                ids: ids.clone(),
                project: project.clone(),
                delay: std::time::Duration::from_millis(*delay_ms),
                fail: fail.clone(),
                flaky: flaky.clone(),
                ui: *ui,
                print_report: *report,
            };
            let success = cmd::cmd_run(config, options).await?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::Config { command } => {
            cmd::cmd_config(&cli, &project_dir, command.clone())?;
        }
    }

    Ok(())
}
