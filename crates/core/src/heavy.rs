//! Browser-driven fallback transport.
//!
//! The browser is the one scarce resource of a run: it is started lazily on
//! first use, guarded by a single mutex, and at most one job drives it at a
//! time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};
use wp_batch_common::{Metrics, get_metrics};
use wp_batch_transport::{Cookie, ErrorKind, PostDraft};

/// Error raised by a [`HeavyTransport`].
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("driver initialization failed: {0}")]
    Init(String),

    #[error("driver session is gone")]
    Dead,

    #[error("driver command {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("publish rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl DriverError {
    /// Map onto the shared transport classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Init(_) | Self::Dead => ErrorKind::HeavyTransportUnavailable,
            Self::Command { .. } => ErrorKind::TransientNetwork,
            Self::Rejected { status, .. } => match *status {
                401 | 403 => ErrorKind::AuthExpired,
                429 => ErrorKind::RateLimited,
                400..=499 => ErrorKind::PermanentClient,
                _ => ErrorKind::TransientNetwork,
            },
        }
    }
}

/// A logged-in browser session.
#[async_trait]
pub trait HeavyTransport: Send {
    /// Cookies of the current session.
    async fn cookies(&mut self) -> Result<Vec<Cookie>, DriverError>;

    /// Anti-forgery nonce embedded in an admin page, if one can be found.
    async fn page_nonce(&mut self) -> Result<Option<String>, DriverError>;

    /// Publish a post from inside the browser. Returns the post URL.
    async fn publish(&mut self, draft: &PostDraft) -> Result<String, DriverError>;

    /// Whether the session still responds.
    async fn is_alive(&mut self) -> bool;

    /// End the session.
    async fn shutdown(&mut self) -> Result<(), DriverError>;
}

/// Starts browser sessions.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn HeavyTransport>, DriverError>;
}

/// Lifecycle of the shared driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriverState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Failed = 3,
}

impl DriverState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Failed,
            _ => Self::Uninitialized,
        }
    }
}

struct Slot {
    driver: Option<Box<dyn HeavyTransport>>,
    last_error: Option<String>,
}

/// Shared, lazily started driver.
///
/// The state is readable without the lock; the driver itself only through a
/// [`DriverGuard`].
pub struct DriverHandle {
    factory: Arc<dyn DriverFactory>,
    slot: Mutex<Slot>,
    state: AtomicU8,
    metrics: Arc<Metrics>,
}

impl DriverHandle {
    /// Create a handle. Nothing is started until first use.
    #[must_use]
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory,
            slot: Mutex::new(Slot {
                driver: None,
                last_error: None,
            }),
            state: AtomicU8::new(DriverState::Uninitialized as u8),
            metrics: get_metrics().clone(),
        }
    }

    /// Record into `metrics` instead of the global instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Current state, without waiting for the lock.
    #[must_use]
    pub fn state(&self) -> DriverState {
        DriverState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DriverState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Take the driver mutex, starting the driver if needed.
    ///
    /// Initialization runs at most once per successful start: waiters that
    /// queued behind the initializing task find the driver ready when they
    /// get the lock.
    pub async fn acquire(&self) -> Result<DriverGuard<'_>, DriverError> {
        let mut slot = self.slot.lock().await;

        if slot.driver.is_none() {
            self.set_state(DriverState::Initializing);
            info!("Starting browser driver");

            match self.factory.create().await {
                Ok(driver) => {
                    slot.driver = Some(driver);
                    slot.last_error = None;
                    self.metrics.record_driver_init();
                    self.set_state(DriverState::Ready);
                    info!("Browser driver ready");
                }
                Err(e) => {
                    error!(error = %e, "Browser driver failed to start");
                    slot.last_error = Some(e.to_string());
                    self.set_state(DriverState::Failed);
                    return Err(e);
                }
            }
        }

        Ok(DriverGuard { handle: self, slot })
    }

    /// Last initialization or liveness error.
    pub async fn last_error(&self) -> Option<String> {
        self.slot.lock().await.last_error.clone()
    }

    /// Shut the driver down if it is running.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(mut driver) = slot.driver.take() {
            if let Err(e) = driver.shutdown().await {
                warn!(error = %e, "Browser driver shutdown failed");
            }
            info!("Browser driver stopped");
        }
        self.set_state(DriverState::Uninitialized);
    }
}

/// Exclusive access to a running driver.
pub struct DriverGuard<'a> {
    handle: &'a DriverHandle,
    slot: MutexGuard<'a, Slot>,
}

impl DriverGuard<'_> {
    fn driver(&mut self) -> Result<&mut Box<dyn HeavyTransport>, DriverError> {
        self.slot.driver.as_mut().ok_or(DriverError::Dead)
    }

    /// Cookies of the browser session.
    pub async fn cookies(&mut self) -> Result<Vec<Cookie>, DriverError> {
        let result = self.driver()?.cookies().await;
        self.check(result).await
    }

    /// Nonce embedded in the admin pages.
    pub async fn page_nonce(&mut self) -> Result<Option<String>, DriverError> {
        let result = self.driver()?.page_nonce().await;
        self.check(result).await
    }

    /// Publish through the browser.
    pub async fn publish(&mut self, draft: &PostDraft) -> Result<String, DriverError> {
        let result = self.driver()?.publish(draft).await;
        self.check(result).await
    }

    /// On error, drop a driver that no longer responds so the next caller
    /// starts a fresh one.
    async fn check<T>(&mut self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let alive = match self.slot.driver.as_mut() {
            Some(driver) => driver.is_alive().await,
            None => false,
        };
        if alive {
            return Err(err);
        }

        warn!(error = %err, "Browser driver is gone, discarding it");
        self.slot.driver = None;
        self.slot.last_error = Some(err.to_string());
        self.handle.set_state(DriverState::Failed);
        Err(DriverError::Dead)
    }
}
