use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use wp_batch_common::{Config, UploadMode};
use wp_batch_queue::DEFAULT_CHECKPOINT_FILE;

#[derive(Parser)]
#[command(name = "wp-batch")]
#[command(about = "Publish posts to a WordPress site in rate-limited batches.")]
pub(crate) struct Cli {
    /// Configuration file. Without it, config/*.toml and WP_BATCH_* variables are read.
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Write logs as JSON lines.
    #[arg(long, global = true)]
    pub(crate) log_json: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Mode {
    Conservative,
    Balanced,
    Aggressive,
}

impl From<Mode> for UploadMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Conservative => Self::Conservative,
            Mode::Balanced => Self::Balanced,
            Mode::Aggressive => Self::Aggressive,
        }
    }
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Publish every post in a JSON file.
    Run(RunArgs),
    /// Check that the site accepts the configured credentials.
    Verify,
    /// Show the checkpoint left by the last run.
    Status {
        /// Checkpoint file to read.
        #[arg(long, default_value = DEFAULT_CHECKPOINT_FILE)]
        checkpoint: PathBuf,
    },
}

#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    /// JSON array of posts (`title`, `content`, `status`, `image_path`, ...).
    pub(crate) jobs: PathBuf,

    /// Concurrency preset.
    #[arg(long, value_enum)]
    pub(crate) mode: Option<Mode>,

    /// Ceiling on REST requests in flight (1-15).
    #[arg(long)]
    pub(crate) max_concurrent: Option<usize>,

    /// Jobs per batch, overriding the preset.
    #[arg(long)]
    pub(crate) batch_size: Option<usize>,

    /// Where to write the progress checkpoint.
    #[arg(long)]
    pub(crate) checkpoint: Option<PathBuf>,

    /// Where to write the list of failed posts.
    #[arg(long, default_value = "failed_posts.json")]
    pub(crate) failures: PathBuf,

    /// Never fall back to the browser.
    #[arg(long)]
    pub(crate) no_browser: bool,

    /// Load and validate everything, then stop before publishing.
    #[arg(long)]
    pub(crate) dry_run: bool,
}

impl RunArgs {
    /// Fold command-line overrides into `config`.
    pub(crate) fn apply(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.batch.mode = mode.into();
        }
        if let Some(max) = self.max_concurrent {
            config.transport.max_concurrent = max;
        }
        if let Some(size) = self.batch_size {
            config.batch.batch_size = Some(size);
        }
        if let Some(path) = &self.checkpoint {
            config.batch.checkpoint_path = Some(path.clone());
        }
        if self.no_browser {
            config.driver.enabled = false;
        }
    }
}
