//! Shared authentication state.
//!
//! One [`Credentials`] value exists per run. The credential bridge is the
//! only writer; the REST client reads it on every request.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Credentials shared between transports.
pub type SharedCredentials = Arc<RwLock<Credentials>>;

/// A browser cookie.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Cookie domain as reported by the browser (`.example.com` or `example.com`).
    #[serde(default)]
    pub domain: String,
}

impl Cookie {
    /// Create a new cookie.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
        }
    }

    /// Whether the cookie should be sent to `host`.
    #[must_use]
    pub fn matches_host(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        domain.is_empty()
            || host.eq_ignore_ascii_case(domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
    }
}

/// Cookie set plus cached anti-forgery nonce.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub cookies: BTreeSet<Cookie>,
    pub nonce: Option<String>,
    pub nonce_fresh_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Create an empty, shareable credentials value.
    #[must_use]
    pub fn shared() -> SharedCredentials {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Replace the cookie set.
    pub fn replace_cookies(&mut self, cookies: impl IntoIterator<Item = Cookie>) {
        self.cookies = cookies.into_iter().collect();
    }

    /// Cache a freshly extracted nonce.
    pub fn set_nonce(&mut self, nonce: String) {
        self.nonce = Some(nonce);
        self.nonce_fresh_at = Some(Utc::now());
    }

    /// Drop the cached nonce.
    pub fn clear_nonce(&mut self) {
        self.nonce = None;
        self.nonce_fresh_at = None;
    }

    /// Whether the browser session has logged in (WordPress sets
    /// `wordpress_logged_in_*` on success).
    #[must_use]
    pub fn has_login_cookie(&self) -> bool {
        self.cookies
            .iter()
            .any(|c| c.name.starts_with("wordpress_logged_in"))
    }

    /// `Cookie` header value for `host`, if any cookie applies.
    #[must_use]
    pub fn cookie_header(&self, host: &str) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches_host(host))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}
