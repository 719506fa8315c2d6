//! [`HeavyTransport`] backed by a W3C WebDriver server (chromedriver,
//! geckodriver).
//!
//! Login fills `wp-login.php` from a script. Publishing runs a same-origin
//! `fetch` against the REST API inside the logged-in page, so the browser's
//! own cookies and the page nonce authenticate the request.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;
use wp_batch_common::Config;
use wp_batch_transport::{Cookie, PostDraft};

use crate::heavy::{DriverError, DriverFactory, HeavyTransport};

/// How often the login cookie is polled for.
const LOGIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

// Static patterns; they cannot fail to compile
#[allow(clippy::unwrap_used)]
static API_SETTINGS_NONCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""nonce"\s*:\s*"([a-f0-9]+)""#).unwrap());

#[allow(clippy::unwrap_used)]
static FORM_NONCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name="_wpnonce"\s+value="([^"]+)""#).unwrap());

const LOGIN_SCRIPT: &str = r"
const [user, pass] = arguments;
const form = document.getElementById('loginform');
if (!form) { return false; }
document.getElementById('user_login').value = user;
document.getElementById('user_pass').value = pass;
const remember = document.getElementById('rememberme');
if (remember) { remember.checked = true; }
form.submit();
return true;
";

const NONCE_SCRIPT: &str =
    "return (window.wpApiSettings && window.wpApiSettings.nonce) || null;";

const PUBLISH_SCRIPT: &str = r"
const [endpoint, nonce, body] = arguments;
const headers = { 'Content-Type': 'application/json' };
if (nonce) { headers['X-WP-Nonce'] = nonce; }
return fetch(endpoint, {
  method: 'POST',
  credentials: 'same-origin',
  headers,
  body: JSON.stringify(body),
}).then((r) => r.text().then((text) => ({ status: r.status, body: text })));
";

/// Find the REST nonce in an admin page.
///
/// Tries the `wpApiSettings` JSON first, then the `_wpnonce` form field.
#[must_use]
pub fn extract_nonce(html: &str) -> Option<String> {
    [&*API_SETTINGS_NONCE_RE, &*FORM_NONCE_RE]
        .iter()
        .find_map(|re| re.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Settings for browser sessions.
#[derive(Debug, Clone)]
pub struct WebDriverOptions {
    /// WebDriver server, e.g. `http://localhost:9515`.
    pub webdriver_url: String,
    /// Site root.
    pub site_url: String,
    pub username: String,
    pub password: String,
    pub headless: bool,
    /// Timeout for one WebDriver command, and for the login to complete.
    pub command_timeout: Duration,
}

impl WebDriverOptions {
    /// Options from configuration; `None` when the browser is disabled or no
    /// account password is configured.
    #[must_use]
    pub fn from_config(config: &Config) -> Option<Self> {
        if !config.driver.enabled {
            return None;
        }
        let password = config.site.password.clone()?;
        Some(Self {
            webdriver_url: config.driver.webdriver_url.clone(),
            site_url: config.site.base_url(),
            username: config.site.username.clone(),
            password,
            headless: config.driver.headless,
            command_timeout: Duration::from_secs(config.driver.command_timeout_secs),
        })
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--disable-gpu",
            "--window-size=1920,1080",
        ];
        if self.headless {
            args.push("--headless=new");
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args },
                    "moz:firefoxOptions": {
                        "args": if self.headless { vec!["-headless"] } else { Vec::new() }
                    }
                }
            }
        })
    }
}

/// Starts logged-in browser sessions.
pub struct WebDriverFactory {
    options: WebDriverOptions,
    client: Client,
}

impl WebDriverFactory {
    pub fn new(options: WebDriverOptions) -> Result<Self, DriverError> {
        Url::parse(&options.webdriver_url)
            .map_err(|e| DriverError::Init(format!("invalid WebDriver URL: {e}")))?;
        let client = Client::builder()
            .timeout(options.command_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DriverError::Init(e.to_string()))?;
        Ok(Self { options, client })
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn create(&self) -> Result<Box<dyn HeavyTransport>, DriverError> {
        let session = WebDriverSession::start(self.client.clone(), &self.options).await?;
        Ok(Box::new(session))
    }
}

/// One WebDriver session logged into the site.
pub struct WebDriverSession {
    client: Client,
    endpoint: String,
    site_url: String,
    nonce: Option<String>,
}

impl WebDriverSession {
    async fn start(client: Client, options: &WebDriverOptions) -> Result<Self, DriverError> {
        let base = options.webdriver_url.trim_end_matches('/');
        let created = send(
            &client,
            Method::POST,
            &format!("{base}/session"),
            Some(options.capabilities()),
        )
        .await
        .map_err(|e| DriverError::Init(e.to_string()))?;

        let session_id = created
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Init("WebDriver returned no session id".to_string()))?;

        let mut session = Self {
            endpoint: format!("{base}/session/{session_id}"),
            client,
            site_url: options.site_url.trim_end_matches('/').to_string(),
            nonce: None,
        };
        debug!(session_id, "WebDriver session created");

        if let Err(e) = session.login(options).await {
            if let Err(close) = session.shutdown().await {
                warn!(error = %close, "Could not close WebDriver session");
            }
            return Err(DriverError::Init(e.to_string()));
        }
        info!(username = %options.username, "Browser logged in");
        Ok(session)
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, DriverError> {
        let url = if path.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}/{path}", self.endpoint)
        };
        send(&self.client, method, &url, body).await
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn execute(&self, script: &str, args: Value) -> Result<Value, DriverError> {
        self.command(
            Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    async fn login(&mut self, options: &WebDriverOptions) -> Result<(), DriverError> {
        self.navigate(&format!("{}/wp-login.php", self.site_url))
            .await?;
        let submitted = self
            .execute(LOGIN_SCRIPT, json!([options.username, options.password]))
            .await?;
        if submitted != Value::Bool(true) {
            return Err(DriverError::Init("login form not found".to_string()));
        }

        let deadline = Instant::now() + options.command_timeout;
        loop {
            let cookies = self.cookies().await?;
            if cookies
                .iter()
                .any(|c| c.name.starts_with("wordpress_logged_in"))
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Init(
                    "login did not complete, check username and password".to_string(),
                ));
            }
            tokio::time::sleep(LOGIN_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl HeavyTransport for WebDriverSession {
    async fn cookies(&mut self) -> Result<Vec<Cookie>, DriverError> {
        let value = self.command(Method::GET, "cookie", None).await?;
        let cookies = value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(Cookie::new(
                            item.get("name")?.as_str()?,
                            item.get("value")?.as_str()?,
                            item.get("domain").and_then(Value::as_str).unwrap_or(""),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(cookies)
    }

    async fn page_nonce(&mut self) -> Result<Option<String>, DriverError> {
        self.navigate(&format!("{}/wp-admin/post-new.php", self.site_url))
            .await?;

        let from_script = self.execute(NONCE_SCRIPT, json!([])).await?;
        let nonce = match from_script.as_str() {
            Some(nonce) if !nonce.is_empty() => Some(nonce.to_string()),
            _ => {
                let source = self.command(Method::GET, "source", None).await?;
                source.as_str().and_then(extract_nonce)
            }
        };

        if nonce.is_none() {
            warn!("No REST nonce found on the admin page");
        }
        self.nonce = nonce.clone();
        Ok(nonce)
    }

    async fn publish(&mut self, draft: &PostDraft) -> Result<String, DriverError> {
        if self.nonce.is_none() {
            self.page_nonce().await?;
        }
        if draft.image_path.is_some() && draft.featured_media.is_none() {
            debug!(title = %draft.title, "Browser publish skips the local featured image");
        }

        let endpoint = format!("{}/wp-json/wp/v2/posts", self.site_url);
        let result = self
            .execute(
                PUBLISH_SCRIPT,
                json!([endpoint, self.nonce.clone().unwrap_or_default(), draft.request_body(None)]),
            )
            .await?;

        let status = result
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(0);
        let body = result
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if !(200..300).contains(&status) {
            if matches!(status, 401 | 403) {
                self.nonce = None;
            }
            return Err(DriverError::Rejected {
                status,
                body: body.chars().take(500).collect(),
            });
        }

        let post: Value = serde_json::from_str(body).map_err(|e| DriverError::Command {
            command: "publish".to_string(),
            message: format!("unreadable response: {e}"),
        })?;
        let locator = match (post.get("link").and_then(Value::as_str), post.get("id")) {
            (Some(link), _) => link.to_string(),
            (None, Some(id)) => format!("{}/?p={id}", self.site_url),
            (None, None) => {
                return Err(DriverError::Command {
                    command: "publish".to_string(),
                    message: "response has no post id".to_string(),
                });
            }
        };
        Ok(locator)
    }

    async fn is_alive(&mut self) -> bool {
        self.command(Method::GET, "url", None).await.is_ok()
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        self.command(Method::DELETE, "", None).await.map(|_| ())
    }
}

/// Send one WebDriver command and unwrap its `value`.
async fn send(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, DriverError> {
    let command = format!("{method} {url}");
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.map_err(|e| DriverError::Command {
        command: command.clone(),
        message: e.to_string(),
    })?;
    let status = response.status();
    let mut payload: Value = response.json().await.map_err(|e| DriverError::Command {
        command: command.clone(),
        message: format!("invalid JSON: {e}"),
    })?;
    let value = payload
        .get_mut("value")
        .map(Value::take)
        .unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    if error == "invalid session id" {
        return Err(DriverError::Dead);
    }
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Err(DriverError::Command {
        command,
        message: format!("{error}: {message}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wp_batch_common::{BatchConfig, DriverConfig, SiteConfig, TransportConfig};

    #[test]
    fn test_extract_nonce_from_api_settings() {
        let html = r#"<script>var wpApiSettings = {"root":"https:\/\/blog.test\/wp-json\/","nonce":"3f9a1c0b2d","versionString":"wp\/v2\/"};</script>"#;
        assert_eq!(extract_nonce(html).as_deref(), Some("3f9a1c0b2d"));
    }

    #[test]
    fn test_extract_nonce_from_form_field() {
        let html = r#"<form><input type="hidden" id="_wpnonce" name="_wpnonce" value="ab12cd34" /></form>"#;
        assert_eq!(extract_nonce(html).as_deref(), Some("ab12cd34"));
    }

    #[test]
    fn test_extract_nonce_missing() {
        assert!(extract_nonce("<html><body>Log In</body></html>").is_none());
    }

    fn config(enabled: bool, password: Option<&str>) -> Config {
        Config {
            site: SiteConfig {
                url: "blog.test/".to_string(),
                username: "editor".to_string(),
                application_password: None,
                password: password.map(str::to_string),
            },
            transport: TransportConfig::default(),
            batch: BatchConfig::default(),
            driver: DriverConfig {
                enabled,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_options_from_config() {
        assert!(WebDriverOptions::from_config(&config(false, Some("pw"))).is_none());
        assert!(WebDriverOptions::from_config(&config(true, None)).is_none());

        let options = WebDriverOptions::from_config(&config(true, Some("pw"))).unwrap_or_else(|| {
            panic!("driver options expected");
        });
        assert_eq!(options.site_url, "https://blog.test");
        assert_eq!(options.webdriver_url, "http://localhost:9515");
        assert!(options.headless);
    }

    #[test]
    fn test_headless_capabilities() {
        let mut options = WebDriverOptions::from_config(&config(true, Some("pw")))
            .unwrap_or_else(|| panic!("driver options expected"));
        let caps = options.capabilities();
        let args = &caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"];
        assert!(args.as_array().is_some_and(|a| a.contains(&json!("--headless=new"))));

        options.headless = false;
        let caps = options.capabilities();
        let args = &caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"];
        assert!(!args.as_array().is_some_and(|a| a.contains(&json!("--headless=new"))));
    }
}
