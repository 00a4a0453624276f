//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `DOCFLOW_LOG` environment variable (full `EnvFilter` directive syntax,
//!    e.g. `docflow::dag=debug,info`)
//! 3. default to `info`
//!
//! Logs always go to stderr so stdout stays free for plans, reports and JSON
//! event lines.

use anyhow::{Result, anyhow};
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted when no CLI level is given.
pub const LOG_ENV: &str = "DOCFLOW_LOG";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

/// Build the filter from the CLI level, then the environment, then `info`.
fn build_filter(cli_level: Option<&str>, env_value: Option<String>) -> Result<EnvFilter> {
    if let Some(level) = cli_level {
        return EnvFilter::try_new(level)
            .map_err(|e| anyhow!("invalid --log-level '{level}': {e}"));
    }

    match env_value {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
            .map_err(|e| anyhow!("invalid {LOG_ENV} '{directives}': {e}")),
        _ => Ok(EnvFilter::new("info")),
    }
}

/// Initialise the global logging subscriber.
///
/// Call once at startup; a second call returns an error instead of panicking.
pub fn init_logging(cli_level: Option<&str>, format: LogFormat) -> Result<()> {
    let filter = build_filter(cli_level, std::env::var(LOG_ENV).ok())?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed.map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}
