//! REST transport for wp-batch.
//!
//! This crate talks to the WordPress REST API:
//!
//! - **Client**: [`RateLimitedTransport`] bounds requests in flight with a
//!   process-wide semaphore and retries with backoff
//! - **Retry**: [`RetryPolicy`] for 429/5xx backoff and network timeouts
//! - **Credentials**: [`Credentials`] shared between the REST client and the
//!   browser session it borrows cookies and nonce from
//! - **Errors**: [`TransportError`] classified into an [`ErrorKind`]

pub mod client;
pub mod credentials;
pub mod error;
pub mod request;
pub mod retry;

pub use client::{RateLimitedTransport, TransportOptions};
pub use credentials::{Cookie, Credentials, SharedCredentials};
pub use error::{ErrorKind, TransportError};
pub use request::{ApiRequest, ApiResponse, CreatedPost, MediaItem, PostDraft, detect_mime};
pub use retry::RetryPolicy;
