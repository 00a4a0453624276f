//! Layered configuration for docflow.
//!
//! Values come from, lowest priority first: built-in defaults, a TOML file
//! (`docflow.toml`), `DOCFLOW_*` environment variables, then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [limits]
//! per_minute = 50
//! period_secs = 60
//! per_day = 1000
//! safety_margin = 0.9
//! warning_threshold = 0.8
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! jitter_ratio = 0.3
//!
//! [executor]
//! max_concurrency = 4
//! shutdown_timeout_secs = 30
//! strict_dependencies = true
//!
//! [notifications]
//! batch_window_ms = 500
//! max_batch_size = 10
//! max_rate_per_project = 5.0
//! idle_timeout_secs = 300
//! backlog_capacity = 100
//! channel_capacity = 256
//! ```

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default config file name.
pub const CONFIG_FILE: &str = "docflow.toml";

/// Quota settings for the external generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Nominal calls allowed per window
    #[serde(default = "default_per_minute")]
    pub per_minute: usize,
    /// Window length in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Nominal calls allowed per calendar day
    #[serde(default = "default_per_day")]
    pub per_day: u64,
    /// Fraction of each nominal limit actually used
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Window utilization that triggers a warning
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

fn default_per_minute() -> usize {
    50
}

fn default_period_secs() -> u64 {
    60
}

fn default_per_day() -> u64 {
    1000
}

fn default_safety_margin() -> f64 {
    0.9
}

fn default_warning_threshold() -> f64 {
    0.8
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            period_secs: default_period_secs(),
            per_day: default_per_day(),
            safety_margin: default_safety_margin(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

impl RateLimitConfig {
    /// A window of `max_count` calls per `period_secs`, other values default.
    pub fn new(max_count: usize, period_secs: u64) -> Self {
        Self {
            per_minute: max_count,
            period_secs,
            ..Default::default()
        }
    }

    pub fn with_per_day(mut self, per_day: u64) -> Self {
        self.per_day = per_day;
        self
    }

    pub fn with_safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Retry/backoff settings for the external call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Ceiling for the exponential delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of random jitter, as a fraction of the delay
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum items executing at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long a cancelled run waits for in-flight items
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Fail resolution on dependency ids missing from the catalog
    #[serde(default = "default_strict_dependencies")]
    pub strict_dependencies: bool,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_strict_dependencies() -> bool {
    true
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            strict_dependencies: default_strict_dependencies(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_secs = timeout.as_secs();
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Progress notification batching and fan-out settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Longest time an event may sit in a batch
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Batch size that forces a flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Publishes per second allowed for one project
    #[serde(default = "default_max_rate_per_project")]
    pub max_rate_per_project: f64,
    /// Idle time after which an empty batch is discarded
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Events kept per project while nobody is subscribed
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
    /// Broadcast channel buffer per project
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_batch_window_ms() -> u64 {
    500
}

fn default_max_batch_size() -> usize {
    10
}

fn default_max_rate_per_project() -> f64 {
    5.0
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_backlog_capacity() -> usize {
    100
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            max_rate_per_project: default_max_rate_per_project(),
            idle_timeout_secs: default_idle_timeout_secs(),
            backlog_capacity: default_backlog_capacity(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl NotificationConfig {
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_rate(mut self, per_second: f64) -> Self {
        self.max_rate_per_project = per_second;
        self
    }

    pub fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity;
        self
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Minimum spacing between publishes for one project.
    ///
    /// Zero (unthrottled) for non-positive or NaN rates.
    pub fn min_publish_interval(&self) -> Duration {
        let rate = self.max_rate_per_project;
        if rate.is_nan() || rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(1.0 / rate).unwrap_or(Duration::MAX)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// The full `docflow.toml` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocflowConfig {
    #[serde(default)]
    pub limits: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl DocflowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `docflow.toml` from `dir`, or defaults if it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `DOCFLOW_*` environment variables on top of the current values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Unparseable values are errors.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_value(&lookup, "DOCFLOW_PER_MINUTE", &mut self.limits.per_minute)?;
        override_value(&lookup, "DOCFLOW_PER_DAY", &mut self.limits.per_day)?;
        override_value(&lookup, "DOCFLOW_SAFETY_MARGIN", &mut self.limits.safety_margin)?;
        override_value(
            &lookup,
            "DOCFLOW_BATCH_WINDOW_MS",
            &mut self.notifications.batch_window_ms,
        )?;
        override_value(
            &lookup,
            "DOCFLOW_BATCH_SIZE",
            &mut self.notifications.max_batch_size,
        )?;
        override_value(
            &lookup,
            "DOCFLOW_MAX_CONCURRENCY",
            &mut self.executor.max_concurrency,
        )?;
        override_value(&lookup, "DOCFLOW_MAX_RETRIES", &mut self.retry.max_retries)?;
        Ok(())
    }

    /// Values a run cannot start with. Empty when the config is usable.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let floats = [
            ("limits.safety_margin", self.limits.safety_margin),
            ("limits.warning_threshold", self.limits.warning_threshold),
            ("retry.jitter_ratio", self.retry.jitter_ratio),
            (
                "notifications.max_rate_per_project",
                self.notifications.max_rate_per_project,
            ),
        ];
        for (key, value) in floats {
            if !value.is_finite() {
                errors.push(format!("{} = {} is not a finite number", key, value));
            }
        }
        errors
    }

    /// Fail with every value listed by [`errors`](Self::errors).
    pub fn check(&self) -> Result<(), ConfigError> {
        let problems = self.errors();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Validate the configuration and return any warnings, hard errors
    /// included.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.errors();

        if !(self.limits.safety_margin > 0.0 && self.limits.safety_margin <= 1.0) {
            warnings.push(format!(
                "limits.safety_margin = {} is outside (0, 1]",
                self.limits.safety_margin
            ));
        }
        if !(0.0..=1.0).contains(&self.limits.warning_threshold) {
            warnings.push(format!(
                "limits.warning_threshold = {} is outside [0, 1]",
                self.limits.warning_threshold
            ));
        }
        if self.limits.per_minute == 0 {
            warnings.push("limits.per_minute = 0 admits no calls".to_string());
        } else if (self.limits.per_minute as f64 * self.limits.safety_margin).floor() < 1.0 {
            warnings.push(format!(
                "limits.per_minute = {} * safety_margin {} floors to 0; 1 call per window is admitted",
                self.limits.per_minute, self.limits.safety_margin
            ));
        }
        if self.limits.period_secs == 0 {
            warnings.push("limits.period_secs = 0 disables the sliding window".to_string());
        }
        if self.executor.max_concurrency == 0 {
            warnings.push("executor.max_concurrency = 0 can never dispatch work".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            warnings.push(format!(
                "retry.jitter_ratio = {} is outside [0, 1]",
                self.retry.jitter_ratio
            ));
        }
        if self.notifications.batch_window_ms == 0 {
            warnings.push(
                "notifications.batch_window_ms = 0 flushes pending batches every millisecond"
                    .to_string(),
            );
        }
        if self.notifications.max_batch_size == 0 {
            warnings.push("notifications.max_batch_size = 0 flushes on every event".to_string());
        }

        warnings
    }
}

fn override_value<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
