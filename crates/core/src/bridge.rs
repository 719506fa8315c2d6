//! Copies the browser session into the REST client's credentials.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};
use wp_batch_common::{Metrics, get_metrics};
use wp_batch_transport::SharedCredentials;

use crate::heavy::{DriverError, DriverHandle};

/// Keeps [`SharedCredentials`] in step with the browser session.
///
/// This is the only writer of the shared credentials.
pub struct CredentialBridge {
    driver: Arc<DriverHandle>,
    credentials: SharedCredentials,
    lock: Mutex<()>,
    metrics: Arc<Metrics>,
}

impl CredentialBridge {
    #[must_use]
    pub fn new(driver: Arc<DriverHandle>, credentials: SharedCredentials) -> Self {
        Self {
            driver,
            credentials,
            lock: Mutex::new(()),
            metrics: get_metrics().clone(),
        }
    }

    /// Record into `metrics` instead of the global instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Credentials kept in sync.
    #[must_use]
    pub const fn credentials(&self) -> &SharedCredentials {
        &self.credentials
    }

    /// Copy the browser cookies, and extract a nonce if none is cached.
    ///
    /// Holds the driver mutex for the whole exchange, so it never interleaves
    /// with a browser publish. Starts the browser if it is not running yet.
    pub async fn sync(&self) -> Result<(), DriverError> {
        let _sync = self.lock.lock().await;
        let mut driver = self.driver.acquire().await?;

        let cookies = driver.cookies().await?;
        let needs_nonce = self.credentials.read().await.nonce.is_none();
        let nonce = if needs_nonce {
            driver.page_nonce().await?
        } else {
            None
        };
        drop(driver);

        let mut credentials = self.credentials.write().await;
        credentials.replace_cookies(cookies);
        match nonce {
            Some(nonce) => {
                debug!("Fresh nonce extracted from admin page");
                credentials.set_nonce(nonce);
            }
            None if needs_nonce => debug!("No nonce found; requests go without X-WP-Nonce"),
            None => {}
        }
        self.metrics.record_credential_sync();

        info!(
            cookies = credentials.cookies.len(),
            logged_in = credentials.has_login_cookie(),
            nonce = credentials.nonce.is_some(),
            "Credentials synchronized from browser"
        );
        Ok(())
    }

    /// Force the next [`sync`](Self::sync) to extract a new nonce.
    pub async fn invalidate_nonce(&self) {
        let _sync = self.lock.lock().await;
        self.credentials.write().await.clear_nonce();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::heavy::tests::FakeFactory;
    use std::sync::atomic::Ordering;
    use wp_batch_transport::Credentials;

    fn bridge(factory: Arc<FakeFactory>) -> (CredentialBridge, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let driver = Arc::new(DriverHandle::new(factory).with_metrics(metrics.clone()));
        let bridge =
            CredentialBridge::new(driver, Credentials::shared()).with_metrics(metrics.clone());
        (bridge, metrics)
    }

    #[tokio::test]
    async fn test_sync_copies_cookies_and_nonce() {
        let factory = Arc::new(FakeFactory::working());
        let (bridge, metrics) = bridge(factory.clone());

        bridge.sync().await.unwrap();

        let credentials = bridge.credentials().read().await;
        assert!(credentials.has_login_cookie());
        assert_eq!(credentials.nonce.as_deref(), Some("f00d"));
        assert!(credentials.nonce_fresh_at.is_some());
        assert_eq!(metrics.snapshot().credential_syncs, 1);
    }

    #[tokio::test]
    async fn test_cached_nonce_is_not_reextracted() {
        let factory = Arc::new(FakeFactory::working());
        let (bridge, _) = bridge(factory.clone());

        bridge.sync().await.unwrap();
        bridge.sync().await.unwrap();
        assert_eq!(factory.nonce_reads.load(Ordering::SeqCst), 1);

        bridge.invalidate_nonce().await;
        assert!(bridge.credentials().read().await.nonce.is_none());

        bridge.sync().await.unwrap();
        assert_eq!(factory.nonce_reads.load(Ordering::SeqCst), 2);
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_fails_without_driver() {
        let factory = Arc::new(FakeFactory {
            fail_create: true,
            ..Default::default()
        });
        let (bridge, metrics) = bridge(factory);

        assert!(bridge.sync().await.is_err());
        assert!(bridge.credentials().read().await.cookies.is_empty());
        assert_eq!(metrics.snapshot().credential_syncs, 0);
    }
}
