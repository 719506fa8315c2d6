//! Wiring of transports and stages for one run.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use wp_batch_common::{AppError, AppResult, Config};
use wp_batch_core::{
    CredentialBridge, DriverHandle, DriverState, FallbackPublisher, HeavyStage, PublishStage,
    RestStage, WebDriverFactory, WebDriverOptions,
};
use wp_batch_transport::{Credentials, ErrorKind, RateLimitedTransport, TransportOptions};

pub(crate) struct Pipeline {
    transport: RateLimitedTransport,
    driver: Option<Arc<DriverHandle>>,
    bridge: Option<Arc<CredentialBridge>>,
    uses_app_password: bool,
    pub(crate) publisher: Arc<FallbackPublisher>,
}

impl Pipeline {
    /// REST stage first, then the browser stage when a driver is configured.
    pub(crate) fn build(config: &Config) -> AppResult<Self> {
        let credentials = Credentials::shared();
        let transport =
            RateLimitedTransport::new(TransportOptions::from_config(config), credentials.clone())
                .map_err(|e| AppError::Transport(e.to_string()))?;

        let mut rest = RestStage::new(transport.clone());
        let (driver, bridge) = match WebDriverOptions::from_config(config) {
            Some(options) => {
                let factory =
                    WebDriverFactory::new(options).map_err(|e| AppError::Driver(e.to_string()))?;
                let driver = Arc::new(DriverHandle::new(Arc::new(factory)));
                let bridge = Arc::new(CredentialBridge::new(driver.clone(), credentials));
                rest = rest.with_bridge(bridge.clone());
                (Some(driver), Some(bridge))
            }
            None => (None, None),
        };

        let mut stages: Vec<Arc<dyn PublishStage>> = vec![Arc::new(rest)];
        if let Some(driver) = &driver {
            stages.push(Arc::new(HeavyStage::new(driver.clone())));
        }
        let publisher = Arc::new(FallbackPublisher::new(stages));
        info!(stages = ?publisher.stage_names(), "Publishing pipeline ready");

        Ok(Self {
            transport,
            driver,
            bridge,
            uses_app_password: config.site.application_password.is_some(),
            publisher,
        })
    }

    /// Establish credentials and check that the REST API accepts them.
    ///
    /// Returns the authenticated user, or `None` when only the browser stage
    /// can publish.
    pub(crate) async fn preflight(&self) -> AppResult<Option<Value>> {
        if !self.uses_app_password {
            match &self.bridge {
                Some(bridge) => bridge
                    .sync()
                    .await
                    .map_err(|e| AppError::Driver(format!("browser login failed: {e}")))?,
                None => warn!("No application password or browser configured; requests are anonymous"),
            }
        }

        match self.transport.verify_auth().await {
            Ok(user) => {
                info!(
                    user = user.get("name").and_then(serde_json::Value::as_str).unwrap_or("?"),
                    "REST API accepted credentials"
                );
                Ok(Some(user))
            }
            Err(e) if self.driver.is_some() && e.kind() != ErrorKind::PermanentClient => {
                warn!(error = %e, "REST API check failed; posts will fall back to the browser");
                Ok(None)
            }
            Err(e) => Err(AppError::Transport(format!("REST API check failed: {e}"))),
        }
    }

    /// Close the browser session, if one was started.
    pub(crate) async fn shutdown(&self) {
        if let Some(driver) = &self.driver {
            if driver.state() == DriverState::Failed {
                if let Some(error) = driver.last_error().await {
                    warn!(error = %error, "Browser driver ended in a failed state");
                }
            }
            driver.shutdown().await;
        }
    }
}
