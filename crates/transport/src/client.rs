//! Rate-limited WordPress REST client.
//!
//! Every request first takes a permit from a process-wide semaphore, so the
//! number of requests in flight against the site never exceeds
//! `max_concurrent`, however many workers are waiting on it.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, COOKIE};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;
use wp_batch_common::{Config, Metrics, get_metrics};

use crate::credentials::SharedCredentials;
use crate::error::{ErrorKind, TransportError};
use crate::request::{ApiRequest, ApiResponse, CreatedPost, MediaItem, PostDraft, detect_mime};
use crate::retry::RetryPolicy;

/// Hard ceiling on pooled connections per host.
const POOL_CEILING: usize = 100;

/// Longest error body kept in a [`TransportError::PermanentClient`].
const ERROR_BODY_LIMIT: usize = 500;

/// Transport settings.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Site root, e.g. `https://example.com`.
    pub site_url: String,
    /// Permits in the request semaphore.
    pub max_concurrent: usize,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Timeout for media uploads.
    pub media_timeout: Duration,
    /// Timeout for post creation and other light requests.
    pub post_timeout: Duration,
    /// Idle connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// User agent.
    pub user_agent: String,
    /// Username and application password for HTTP Basic auth.
    pub basic_auth: Option<(String, String)>,
}

impl TransportOptions {
    /// Default settings for `site_url`.
    #[must_use]
    pub fn new(site_url: impl Into<String>) -> Self {
        Self {
            site_url: site_url.into(),
            max_concurrent: 5,
            retry: RetryPolicy::default(),
            media_timeout: Duration::from_secs(60),
            post_timeout: Duration::from_secs(20),
            pool_max_idle_per_host: 50,
            user_agent: format!("wp-batch/{}", env!("CARGO_PKG_VERSION")),
            basic_auth: None,
        }
    }

    /// Settings from the application configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let transport = &config.transport;
        Self {
            site_url: config.site.base_url(),
            max_concurrent: transport.max_concurrent,
            retry: RetryPolicy::from_config(transport),
            media_timeout: Duration::from_secs(transport.media_timeout_secs),
            post_timeout: Duration::from_secs(transport.post_timeout_secs),
            pool_max_idle_per_host: transport.pool_max_idle_per_host,
            user_agent: transport.user_agent.clone(),
            basic_auth: config
                .site
                .application_password
                .as_ref()
                .map(|password| (config.site.username.clone(), password.clone())),
        }
    }
}

/// Keeps the in-flight gauge accurate on every exit path.
struct InFlight<'a>(&'a Metrics);

impl<'a> InFlight<'a> {
    fn start(metrics: &'a Metrics) -> Self {
        metrics.start_request();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.end_request();
    }
}

/// What to do after one attempt.
enum Attempt {
    Done(ApiResponse),
    Fail(TransportError),
    Retry {
        delay: Duration,
        reason: String,
        exhausted: TransportError,
    },
}

/// REST client bounded by a global concurrency ceiling.
///
/// Cloning is cheap and clones share the semaphore, the connection pool
/// and the credentials.
#[derive(Clone)]
pub struct RateLimitedTransport {
    client: Client,
    api_base: String,
    host: String,
    permits: Arc<Semaphore>,
    options: Arc<TransportOptions>,
    credentials: SharedCredentials,
    metrics: Arc<Metrics>,
}

impl RateLimitedTransport {
    /// Create a new transport.
    pub fn new(
        options: TransportOptions,
        credentials: SharedCredentials,
    ) -> Result<Self, TransportError> {
        let site = Url::parse(&options.site_url)
            .map_err(|e| TransportError::Setup(format!("invalid site URL: {e}")))?;
        let host = site
            .host_str()
            .ok_or_else(|| TransportError::Setup("site URL has no host".to_string()))?
            .to_string();

        let client = Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host.min(POOL_CEILING))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(options.user_agent.clone())
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        let api_base = format!("{}/wp-json/wp/v2", options.site_url.trim_end_matches('/'));
        let permits = Arc::new(Semaphore::new(options.max_concurrent.max(1)));

        info!(
            api_base = %api_base,
            max_concurrent = options.max_concurrent,
            "REST transport ready"
        );

        Ok(Self {
            client,
            api_base,
            host,
            permits,
            options: Arc::new(options),
            credentials,
            metrics: get_metrics().clone(),
        })
    }

    /// Record into `metrics` instead of the global instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Credentials this transport authenticates with.
    #[must_use]
    pub const fn credentials(&self) -> &SharedCredentials {
        &self.credentials
    }

    /// Configured request ceiling.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.options.max_concurrent
    }

    /// Permits not currently held.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Send with the configured retry budget.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.send_with_retries(request, self.options.retry.max_retries)
            .await
    }

    /// Send a request, retrying up to `max_retries` times.
    ///
    /// The permit is held across backoff sleeps so a rate-limited site sees
    /// less pressure, not more.
    pub async fn send_with_retries(
        &self,
        request: &ApiRequest,
        max_retries: u32,
    ) -> Result<ApiResponse, TransportError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::TransientNetwork {
                attempts: 0,
                message: "transport closed".to_string(),
            })?;

        let mut attempt: u32 = 0;
        loop {
            let outcome = self.attempt(request, attempt).await;
            match outcome {
                Attempt::Done(response) => return Ok(response),
                Attempt::Fail(err) => return Err(err),
                Attempt::Retry {
                    delay,
                    reason,
                    exhausted,
                } => {
                    if attempt >= max_retries {
                        warn!(
                            operation = request.operation(),
                            attempts = attempt + 1,
                            reason = %reason,
                            "Retries exhausted"
                        );
                        return Err(exhausted);
                    }
                    self.metrics.record_retry();
                    warn!(
                        operation = request.operation(),
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(&self, request: &ApiRequest, attempt: u32) -> Attempt {
        let attempts = attempt + 1;
        let started = Instant::now();

        let result = {
            let _in_flight = InFlight::start(&self.metrics);
            match self.execute(request).await {
                Ok(response) => Ok(read_response(response).await),
                Err(e) => Err(e),
            }
        };

        match result {
            Ok((status, body)) => {
                self.metrics
                    .record_http_request(status, started.elapsed());
                self.classify_status(status, body, attempt)
            }
            Err(e) if e.is_builder() => Attempt::Fail(TransportError::Setup(e.to_string())),
            Err(e) => {
                self.metrics.record_network_error();
                let reason = if e.is_timeout() {
                    "timeout".to_string()
                } else {
                    e.to_string()
                };
                Attempt::Retry {
                    delay: self.options.retry.timeout_delay,
                    exhausted: TransportError::TransientNetwork {
                        attempts,
                        message: reason.clone(),
                    },
                    reason,
                }
            }
        }
    }

    fn classify_status(&self, status: u16, body: Result<Value, String>, attempt: u32) -> Attempt {
        let attempts = attempt + 1;
        match status {
            200..=299 => match body {
                Ok(body) => Attempt::Done(ApiResponse { status, body }),
                Err(text) => {
                    warn!(status, "Request accepted but the reply was unreadable");
                    Attempt::Fail(TransportError::Unconfirmed {
                        status,
                        body: truncate(&text),
                    })
                }
            },
            401 | 403 => {
                self.metrics.record_auth_expired();
                Attempt::Fail(TransportError::AuthExpired { status })
            }
            429 => {
                self.metrics.record_rate_limited();
                Attempt::Retry {
                    delay: self.options.retry.delay_for_attempt(attempt),
                    reason: "429 Too Many Requests".to_string(),
                    exhausted: TransportError::RateLimited { attempts },
                }
            }
            500..=599 => Attempt::Retry {
                delay: self.options.retry.delay_for_attempt(attempt),
                reason: format!("server error {status}"),
                exhausted: TransportError::TransientNetwork {
                    attempts,
                    message: format!("server error {status}"),
                },
            },
            _ => Attempt::Fail(TransportError::PermanentClient {
                status,
                body: truncate(&body.map_or_else(|text| text, |v| v.to_string())),
            }),
        }
    }

    async fn execute(&self, request: &ApiRequest) -> Result<Response, reqwest::Error> {
        let url = format!("{}/{}", self.api_base, request.path());

        let builder = match request {
            ApiRequest::UploadMedia {
                filename,
                mime,
                data,
            } => self
                .client
                .post(&url)
                .header(
                    CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                )
                .header(CONTENT_TYPE, *mime)
                .body(data.clone())
                .timeout(self.options.media_timeout),
            ApiRequest::CreatePost { body } => self
                .client
                .post(&url)
                .json(body)
                .timeout(self.options.post_timeout),
            ApiRequest::CurrentUser => self.client.get(&url).timeout(self.options.post_timeout),
        };

        self.authorize(builder).await.send().await
    }

    async fn authorize(&self, mut builder: RequestBuilder) -> RequestBuilder {
        {
            let credentials = self.credentials.read().await;
            if let Some(cookies) = credentials.cookie_header(&self.host) {
                builder = builder.header(COOKIE, cookies);
            }
            if let Some(nonce) = &credentials.nonce {
                builder = builder.header("X-WP-Nonce", nonce);
            }
        }
        if let Some((user, password)) = &self.options.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        builder
    }

    /// Upload a local image to the media library.
    pub async fn upload_media(&self, path: &Path) -> Result<MediaItem, TransportError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| TransportError::Media {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.jpg")
            .to_string();

        debug!(filename = %filename, bytes = data.len(), "Uploading media");

        let response = self
            .send(&ApiRequest::UploadMedia {
                filename,
                mime: detect_mime(path),
                data: Bytes::from(data),
            })
            .await?;

        parse_created(response)
    }

    /// Create a post, optionally overriding its featured image.
    pub async fn create_post(
        &self,
        draft: &PostDraft,
        featured_media: Option<u64>,
    ) -> Result<CreatedPost, TransportError> {
        let response = self
            .send(&ApiRequest::CreatePost {
                body: draft.request_body(featured_media),
            })
            .await?;

        parse_created(response)
    }

    /// Upload the draft's image if needed, then create the post.
    ///
    /// A failed image upload does not stop the post, except when the
    /// credentials were rejected.
    pub async fn publish_post(&self, draft: &PostDraft) -> Result<CreatedPost, TransportError> {
        let featured = match (&draft.featured_media, &draft.image_path) {
            (None, Some(path)) => match self.upload_media(path).await {
                Ok(media) => {
                    debug!(media_id = media.id, url = %media.source_url, "Featured image uploaded");
                    Some(media.id)
                }
                Err(e) if e.kind() == ErrorKind::AuthExpired => return Err(e),
                Err(e) => {
                    warn!(
                        title = %draft.title,
                        error = %e,
                        "Featured image upload failed, publishing without it"
                    );
                    None
                }
            },
            _ => None,
        };

        self.create_post(draft, featured).await
    }

    /// Check that the current credentials are accepted.
    pub async fn verify_auth(&self) -> Result<Value, TransportError> {
        self.send(&ApiRequest::CurrentUser)
            .await
            .map(|response| response.body)
    }
}

/// Status plus parsed JSON, or the raw text when it is not JSON.
///
/// PHP notices printed ahead of the JSON document are skipped.
async fn read_response(response: Response) -> (u16, Result<Value, String>) {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let body = match serde_json::from_str(&text) {
        Ok(value) => Ok(value),
        Err(_) => salvage_json(&text).ok_or(text),
    };
    (status, body)
}

/// The trailing JSON object of a body that has other output in front of it.
fn salvage_json(text: &str) -> Option<Value> {
    let end = text.rfind('}')?;
    text.match_indices('{')
        .map(|(start, _)| start)
        .take_while(|&start| start < end)
        .find_map(|start| serde_json::from_str::<Value>(&text[start..=end]).ok())
        .filter(Value::is_object)
}

/// Decode a 2xx body. Failing here means the write went through but its
/// result is unknown.
fn parse_created<T: DeserializeOwned>(response: ApiResponse) -> Result<T, TransportError> {
    let status = response.status;
    serde_json::from_value(response.body).map_err(|e| TransportError::Unconfirmed {
        status,
        body: e.to_string(),
    })
}

fn truncate(text: &str) -> String {
    text.chars().take(ERROR_BODY_LIMIT).collect()
}
