//! Application configuration.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{AppError, AppResult};

/// Upper bound on concurrent REST requests, even for high-volume runs.
pub const MAX_CONCURRENT_CEILING: usize = 15;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Target site configuration.
    pub site: SiteConfig,
    /// REST transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Batch scheduler configuration.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Browser driver (fallback transport) configuration.
    #[serde(default)]
    pub driver: DriverConfig,
}

/// Target WordPress site.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site URL (`https://example.com`). A trailing `/wp-admin` is ignored.
    pub url: String,
    /// Login name.
    pub username: String,
    /// Application password for HTTP Basic auth on the REST API.
    #[serde(default)]
    pub application_password: Option<String>,
    /// Account password, used by the browser driver to log in.
    #[serde(default)]
    pub password: Option<String>,
}

impl SiteConfig {
    /// Site root without trailing slash or admin path, with a scheme.
    #[must_use]
    pub fn base_url(&self) -> String {
        let mut url = self.url.trim().trim_end_matches('/').to_string();
        if let Some(idx) = url.find("/wp-admin") {
            url.truncate(idx);
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            url = format!("https://{url}");
        }
        url
    }
}

/// REST transport tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Global ceiling on requests in flight.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Retries per request after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff on 429/5xx.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Cap for exponential backoff.
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// Fixed delay after a network timeout.
    #[serde(default = "default_timeout_retry_secs")]
    pub timeout_retry_secs: u64,
    /// Per-request timeout for media uploads.
    #[serde(default = "default_media_timeout_secs")]
    pub media_timeout_secs: u64,
    /// Per-request timeout for post creation.
    #[serde(default = "default_post_timeout_secs")]
    pub post_timeout_secs: u64,
    /// Idle connections kept per host.
    #[serde(default = "default_pool_idle")]
    pub pool_max_idle_per_host: usize,
    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Preset concurrency profiles for the batch scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// 10 jobs per batch, 2 batches, 3 workers each.
    Conservative,
    /// 20 jobs per batch, 3 batches, 5 workers each.
    #[default]
    Balanced,
    /// 50 jobs per batch, 5 batches, 10 workers each.
    Aggressive,
}

impl UploadMode {
    /// `(batch_size, max_parallel_batches, max_workers_per_batch)`.
    #[must_use]
    pub const fn preset(self) -> (usize, usize, usize) {
        match self {
            Self::Conservative => (10, 2, 3),
            Self::Balanced => (20, 3, 5),
            Self::Aggressive => (50, 5, 10),
        }
    }
}

impl FromStr for UploadMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(AppError::Validation(format!(
                "invalid mode: {other} (use conservative/balanced/aggressive)"
            ))),
        }
    }
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        };
        f.write_str(name)
    }
}

/// Batch scheduler settings.
///
/// Explicit sizes override the values of the selected [`UploadMode`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchConfig {
    /// Concurrency preset.
    #[serde(default)]
    pub mode: UploadMode,
    /// Jobs per batch.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Batches running at once.
    #[serde(default)]
    pub max_parallel_batches: Option<usize>,
    /// Jobs running at once inside one batch.
    #[serde(default)]
    pub max_workers_per_batch: Option<usize>,
    /// Capacity of the retry queue.
    #[serde(default)]
    pub retry_queue_cap: Option<usize>,
    /// Delay between retry-queue attempts, in milliseconds.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// Where the progress checkpoint is written.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

impl BatchConfig {
    /// Effective `(batch_size, max_parallel_batches, max_workers_per_batch)`.
    #[must_use]
    pub fn sizes(&self) -> (usize, usize, usize) {
        let (batch, parallel, workers) = self.mode.preset();
        (
            self.batch_size.unwrap_or(batch),
            self.max_parallel_batches.unwrap_or(parallel),
            self.max_workers_per_batch.unwrap_or(workers),
        )
    }
}

/// Browser driver settings for the fallback transport.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Whether the fallback transport may be used at all.
    #[serde(default)]
    pub enabled: bool,
    /// W3C WebDriver endpoint (chromedriver, geckodriver, ...).
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    /// Run the browser without a window.
    #[serde(default = "default_true")]
    pub headless: bool,
    /// Timeout for a single WebDriver command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            timeout_retry_secs: default_timeout_retry_secs(),
            media_timeout_secs: default_media_timeout_secs(),
            post_timeout_secs: default_post_timeout_secs(),
            pool_max_idle_per_host: default_pool_idle(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webdriver_url: default_webdriver_url(),
            headless: true,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

const fn default_max_concurrent() -> usize {
    5
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_backoff_base_secs() -> u64 {
    2
}

const fn default_backoff_cap_secs() -> u64 {
    30
}

const fn default_timeout_retry_secs() -> u64 {
    2
}

const fn default_media_timeout_secs() -> u64 {
    60
}

const fn default_post_timeout_secs() -> u64 {
    20
}

const fn default_pool_idle() -> usize {
    50
}

fn default_user_agent() -> String {
    format!("wp-batch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}

const fn default_command_timeout_secs() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present, into the process environment)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `WP_BATCH_ENV`)
    /// 4. Environment variables with `WP_BATCH_` prefix (`WP_BATCH_SITE__URL`)
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();
        let env = std::env::var("WP_BATCH_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("WP_BATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("WP_BATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        url::Url::parse(&self.site.base_url())
            .map_err(|e| AppError::Validation(format!("site.url: {e}")))?;

        if self.site.username.trim().is_empty() {
            return Err(AppError::Validation("site.username is empty".to_string()));
        }

        let max = self.transport.max_concurrent;
        if max == 0 || max > MAX_CONCURRENT_CEILING {
            return Err(AppError::Validation(format!(
                "transport.max_concurrent must be between 1 and {MAX_CONCURRENT_CEILING}, got {max}"
            )));
        }

        let (batch, parallel, workers) = self.batch.sizes();
        for (name, value) in [
            ("batch.batch_size", batch),
            ("batch.max_parallel_batches", parallel),
            ("batch.max_workers_per_batch", workers),
        ] {
            if value == 0 {
                return Err(AppError::Validation(format!("{name} must be positive")));
            }
        }

        if self.driver.enabled && self.site.password.is_none() {
            return Err(AppError::Validation(
                "driver.enabled requires site.password for the browser login".to_string(),
            ));
        }

        Ok(())
    }
}
