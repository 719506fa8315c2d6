//! Error types for wp-batch.

use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
///
/// Per-job failures never surface as `AppError`; they are folded into the
/// job's outcome at the worker boundary. This type covers the
/// infrastructure failures that abort a whole run.
#[derive(Debug, Error)]
pub enum AppError {
    // === Input Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    // === Runtime Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the process exit code for this error.
    ///
    /// Codes follow the BSD `sysexits` convention so wrapper scripts can
    /// distinguish bad input from runtime trouble.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 78,
            Self::Validation(_) | Self::InvalidInput(_) => 65,
            Self::Io(_) => 74,
            Self::Serialization(_) => 65,
            Self::Transport(_) | Self::Driver(_) => 69,
            Self::Scheduler(_) | Self::Internal(_) => 70,
        }
    }

    /// Returns the error code used in logs and reports.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Driver(_) => "DRIVER_ERROR",
            Self::Scheduler(_) => "SCHEDULER_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether the error was caused by operator input rather than
    /// the environment.
    #[must_use]
    pub const fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Validation(_) | Self::InvalidInput(_)
        )
    }
}

// === From implementations ===

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
