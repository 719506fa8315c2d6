//! Fallback publisher integration tests.
//!
//! The REST stage talks to a stub site; the browser stage uses an
//! in-memory driver.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use wp_batch_common::Metrics;
use wp_batch_core::{
    CredentialBridge, DriverError, DriverFactory, DriverHandle, FallbackPublisher, HeavyStage,
    HeavyTransport, Job, PublishOutcome, PublishStage, RestStage,
};
use wp_batch_transport::{
    Cookie, Credentials, ErrorKind, PostDraft, RateLimitedTransport, RetryPolicy, SharedCredentials,
    TransportOptions,
};

/// Stub site behavior.
#[derive(Clone, Copy)]
enum Mode {
    /// 401 unless the browser nonce is presented.
    NeedsNonce,
    /// Always 503.
    Down,
    /// Always 400.
    Rejects,
    /// Creates the post, then answers 201 with an HTML error page.
    Garbled,
}

struct Site {
    mode: Mode,
    hits: AtomicUsize,
}

async fn create_post(State(site): State<Arc<Site>>, headers: HeaderMap) -> Response {
    let n = site.hits.fetch_add(1, Ordering::SeqCst) + 1;
    match site.mode {
        Mode::NeedsNonce => {
            let nonce_ok = headers
                .get("x-wp-nonce")
                .is_some_and(|v| v.as_bytes() == b"f00d");
            if nonce_ok {
                (
                    StatusCode::CREATED,
                    Json(json!({"id": n, "link": format!("https://blog.test/?p={n}")})),
                )
                    .into_response()
            } else {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"code": "rest_not_logged_in"})),
                )
                    .into_response()
            }
        }
        Mode::Down => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"code": "down"})),
        )
            .into_response(),
        Mode::Rejects => (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": "rest_invalid_param"})),
        )
            .into_response(),
        Mode::Garbled => (
            StatusCode::CREATED,
            "<html><body><b>Fatal error</b>: Allowed memory size exhausted</body></html>",
        )
            .into_response(),
    }
}

async fn spawn_site(mode: Mode) -> (String, Arc<Site>) {
    let site = Arc::new(Site {
        mode,
        hits: AtomicUsize::new(0),
    });
    let router = Router::new()
        .route("/wp-json/wp/v2/posts", post(create_post))
        .with_state(site.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), site)
}

struct Browser {
    publishes: Arc<AtomicUsize>,
}

#[async_trait]
impl HeavyTransport for Browser {
    async fn cookies(&mut self) -> Result<Vec<Cookie>, DriverError> {
        Ok(vec![Cookie::new("wordpress_logged_in_x", "editor", "")])
    }

    async fn page_nonce(&mut self) -> Result<Option<String>, DriverError> {
        Ok(Some("f00d".to_string()))
    }

    async fn publish(&mut self, draft: &PostDraft) -> Result<String, DriverError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://blog.test/browser/{}", draft.title))
    }

    async fn is_alive(&mut self) -> bool {
        true
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[derive(Default)]
struct BrowserFactory {
    creates: AtomicUsize,
    publishes: Arc<AtomicUsize>,
}

#[async_trait]
impl DriverFactory for BrowserFactory {
    async fn create(&self) -> Result<Box<dyn HeavyTransport>, DriverError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Browser {
            publishes: self.publishes.clone(),
        }))
    }
}

fn transport(url: &str, credentials: SharedCredentials) -> RateLimitedTransport {
    let mut options = TransportOptions::new(url);
    options.retry = RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        timeout_delay: Duration::from_millis(5),
    };
    RateLimitedTransport::new(options, credentials).unwrap()
}

struct Pipeline {
    publisher: FallbackPublisher,
    factory: Arc<BrowserFactory>,
    metrics: Arc<Metrics>,
}

fn pipeline(url: &str) -> Pipeline {
    let metrics = Arc::new(Metrics::new());
    let credentials = Credentials::shared();
    let factory = Arc::new(BrowserFactory::default());
    let driver = Arc::new(DriverHandle::new(factory.clone()).with_metrics(metrics.clone()));
    let bridge = Arc::new(
        CredentialBridge::new(driver.clone(), credentials.clone()).with_metrics(metrics.clone()),
    );

    let rest = RestStage::new(transport(url, credentials).with_metrics(metrics.clone()))
        .with_bridge(bridge);
    let stages: Vec<Arc<dyn PublishStage>> =
        vec![Arc::new(rest), Arc::new(HeavyStage::new(driver))];

    Pipeline {
        publisher: FallbackPublisher::new(stages).with_metrics(metrics.clone()),
        factory,
        metrics,
    }
}

fn job(title: &str) -> Job {
    Job::new(title, PostDraft::new(title, "<p>body</p>"))
}

#[tokio::test]
async fn test_auth_expired_resyncs_and_succeeds_over_rest() {
    let (url, site) = spawn_site(Mode::NeedsNonce).await;
    let pipeline = pipeline(&url);

    let outcome = pipeline.publisher.publish(&job("first")).await;

    assert!(matches!(outcome, PublishOutcome::Published { stage: "rest", .. }));
    assert_eq!(site.hits.load(Ordering::SeqCst), 2);
    assert_eq!(pipeline.metrics.snapshot().credential_syncs, 1);
    assert_eq!(pipeline.factory.publishes.load(Ordering::SeqCst), 0);

    // The nonce is cached now; no second resync.
    let outcome = pipeline.publisher.publish(&job("second")).await;
    assert!(outcome.is_success());
    assert_eq!(site.hits.load(Ordering::SeqCst), 3);
    assert_eq!(pipeline.metrics.snapshot().credential_syncs, 1);
    assert_eq!(pipeline.factory.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_site_down_falls_back_to_browser() {
    let (url, site) = spawn_site(Mode::Down).await;
    let pipeline = pipeline(&url);

    let outcome = pipeline.publisher.publish(&job("fallback")).await;

    assert_eq!(
        outcome,
        PublishOutcome::Published {
            locator: "https://blog.test/browser/fallback".to_string(),
            stage: "browser",
        }
    );
    // Two stage attempts, each with one transport retry.
    assert_eq!(site.hits.load(Ordering::SeqCst), 4);
    let snapshot = pipeline.metrics.snapshot();
    assert_eq!(snapshot.fallback_attempts, 1);
    assert_eq!(snapshot.fallback_successes, 1);
}

#[tokio::test]
async fn test_rejected_payload_is_final() {
    let (url, site) = spawn_site(Mode::Rejects).await;
    let pipeline = pipeline(&url);

    let first = pipeline.publisher.publish(&job("bad")).await;
    let second = pipeline.publisher.publish(&job("bad")).await;

    assert_eq!(first, second);
    assert!(matches!(
        first,
        PublishOutcome::Failed {
            kind: Some(ErrorKind::PermanentClient),
            ..
        }
    ));
    assert_eq!(site.hits.load(Ordering::SeqCst), 2);
    assert_eq!(pipeline.factory.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreadable_success_is_not_published_twice() {
    let (url, site) = spawn_site(Mode::Garbled).await;
    let pipeline = pipeline(&url);

    let outcome = pipeline.publisher.publish(&job("maybe")).await;

    assert!(matches!(
        outcome,
        PublishOutcome::Failed {
            kind: Some(ErrorKind::Unconfirmed),
            ..
        }
    ));
    assert!(!outcome.is_retryable());
    assert_eq!(site.hits.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.factory.publishes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_auth_expired_without_bridge_goes_straight_to_browser() {
    let (url, site) = spawn_site(Mode::NeedsNonce).await;
    let factory = Arc::new(BrowserFactory::default());
    let driver = Arc::new(DriverHandle::new(factory.clone()));
    let stages: Vec<Arc<dyn PublishStage>> = vec![
        Arc::new(RestStage::new(transport(&url, Credentials::shared()))),
        Arc::new(HeavyStage::new(driver)),
    ];
    let publisher = FallbackPublisher::new(stages);

    let outcome = publisher.publish(&job("no-bridge")).await;

    assert!(matches!(outcome, PublishOutcome::Published { stage: "browser", .. }));
    assert_eq!(site.hits.load(Ordering::SeqCst), 1);
    assert_eq!(factory.publishes.load(Ordering::SeqCst), 1);
}
