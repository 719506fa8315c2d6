//! Transport error taxonomy.

use std::fmt;

use thiserror::Error;

/// Classification that drives retry and fallback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeout, connection reset or exhausted 5xx.
    TransientNetwork,
    /// HTTP 429 after backoff was exhausted.
    RateLimited,
    /// HTTP 401/403; credentials need a resync.
    AuthExpired,
    /// Any other 4xx. The payload is at fault, not the transport.
    PermanentClient,
    /// The fallback transport could not be brought up.
    HeavyTransportUnavailable,
    /// The site answered 2xx but the reply could not be read. The write may
    /// have happened, so the job must not be sent again.
    Unconfirmed,
}

impl ErrorKind {
    /// Whether another transport may still succeed for the same job.
    #[must_use]
    pub const fn allows_fallback(self) -> bool {
        matches!(
            self,
            Self::TransientNetwork | Self::RateLimited | Self::AuthExpired
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::AuthExpired => "auth_expired",
            Self::PermanentClient => "permanent_client",
            Self::HeavyTransportUnavailable => "heavy_transport_unavailable",
            Self::Unconfirmed => "unconfirmed",
        };
        f.write_str(name)
    }
}

/// Error returned by [`crate::RateLimitedTransport`].
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error after {attempts} attempt(s): {message}")]
    TransientNetwork { attempts: u32, message: String },

    #[error("rate limited after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },

    #[error("authentication rejected ({status})")]
    AuthExpired { status: u16 },

    #[error("request rejected ({status}): {body}")]
    PermanentClient { status: u16, body: String },

    #[error("cannot read media {path}: {message}")]
    Media { path: String, message: String },

    #[error("site answered {status} but the reply was unreadable: {body}")]
    Unconfirmed { status: u16, body: String },

    #[error("HTTP client setup failed: {0}")]
    Setup(String),
}

impl TransportError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Self::Unconfirmed { .. } => ErrorKind::Unconfirmed,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::AuthExpired { .. } => ErrorKind::AuthExpired,
            Self::PermanentClient { .. } | Self::Media { .. } | Self::Setup(_) => {
                ErrorKind::PermanentClient
            }
        }
    }

    /// Whether the caller may resubmit the same request.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().allows_fallback()
    }
}
