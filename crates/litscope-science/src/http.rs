use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{Result, ScienceError};

pub const USER_AGENT: &str = concat!("litscope/", env!("CARGO_PKG_VERSION"));

const RATE_LIMIT_LIMIT: &str = "x-rate-limit-limit";
const RATE_LIMIT_INTERVAL: &str = "x-rate-limit-interval";

// ─── RateLimitedClient ────────────────────────────────────────────────────────

/// HTTP client that spaces requests at least `min_interval` apart, follows
/// the upstream's advertised rate limit and retries 429s and transport
/// failures.
pub struct RateLimitedClient {
    client: reqwest::Client,
    min_interval: Duration,
    /// Interval derived from `x-rate-limit-*` headers of the last response.
    advertised: Arc<Mutex<Option<Duration>>>,
    last_request: Arc<Mutex<Option<Instant>>>,
    max_retries: u32,
}

impl RateLimitedClient {
    pub fn new(min_interval: Duration, max_retries: u32, user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .gzip(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            min_interval,
            advertised: Arc::new(Mutex::new(None)),
            last_request: Arc::new(Mutex::new(None)),
            max_retries,
        })
    }

    /// Current spacing between requests.
    pub async fn interval(&self) -> Duration {
        let advertised = *self.advertised.lock().await;
        advertised.map_or(self.min_interval, |a| a.max(self.min_interval))
    }

    async fn wait_for_rate_limit(&self) {
        let interval = self.interval().await;
        let mut last = self.last_request.lock().await;
        if let Some(t) = *last {
            let elapsed = t.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn observe_rate_limit(&self, headers: &HeaderMap) {
        if let Some(interval) = advertised_interval(headers) {
            let mut advertised = self.advertised.lock().await;
            if *advertised != Some(interval) {
                debug!(?interval, "upstream rate limit");
                *advertised = Some(interval);
            }
        }
    }

    pub async fn get(&self, url: &str) -> Result<String> {
        self.get_with_headers(url, HeaderMap::new()).await
    }

    pub async fn get_with_headers(&self, url: &str, headers: HeaderMap) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            self.wait_for_rate_limit().await;
            let resp = self.client.get(url).headers(headers.clone()).send().await;
            match resp {
                Ok(r) if r.status() == 429 => {
                    let wait = r
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(60);
                    if attempt >= self.max_retries {
                        return Err(ScienceError::RateLimit(host_of(url), wait));
                    }
                    sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                }
                Ok(r) if r.status() == 404 => {
                    return Err(ScienceError::IdentifierNotFound(url.to_string()));
                }
                Ok(r) if !r.status().is_success() => {
                    let status = r.status().as_u16();
                    let body = r.text().await.unwrap_or_default();
                    return Err(ScienceError::ApiError(
                        url.to_string(),
                        format!("HTTP {status}: {}", body.trim()),
                    ));
                }
                Ok(r) => {
                    self.observe_rate_limit(r.headers()).await;
                    return r.text().await.map_err(ScienceError::Http);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(ScienceError::Http(e));
                    }
                    let backoff = 2u64.pow(attempt);
                    sleep(Duration::from_secs(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let text = self.get(url).await?;
        serde_json::from_str(&text).map_err(|e| ScienceError::Parse(e.to_string()))
    }
}

/// `limit` requests per `interval` → spacing of `interval / limit`.
fn advertised_interval(headers: &HeaderMap) -> Option<Duration> {
    let limit: u32 = headers
        .get(RATE_LIMIT_LIMIT)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let interval = parse_interval(headers.get(RATE_LIMIT_INTERVAL)?.to_str().ok()?)?;
    if limit == 0 {
        return None;
    }
    Some(interval / limit)
}

/// Parses `60s`, `1m`, `1h` (a bare number counts as seconds).
pub fn parse_interval(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (number, unit) = match raw.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let n: u64 = number.parse().ok()?;
    let secs = match unit.trim() {
        "s" | "" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

fn host_of(url: &str) -> String {
    url.split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(url)
        .to_string()
}

// ─── BlockingClient ───────────────────────────────────────────────────────────

/// Synchronous facade over [`RateLimitedClient`] for endpoints that run on
/// the operation's worker threads. Must not be used from inside an async
/// context.
pub struct BlockingClient {
    runtime: tokio::runtime::Runtime,
    inner: RateLimitedClient,
}

impl BlockingClient {
    pub fn new(inner: RateLimitedClient) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ScienceError::Runtime(e.to_string()))?;
        Ok(Self { runtime, inner })
    }

    pub fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.runtime.block_on(self.inner.get_json(url))
    }

    pub fn interval(&self) -> Duration {
        self.runtime.block_on(self.inner.interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn client() -> RateLimitedClient {
        RateLimitedClient::new(Duration::ZERO, 1, USER_AGENT, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn intervals_accept_units() {
        assert_eq!(parse_interval("60s"), Some(Duration::from_secs(60)));
        assert_eq!(parse_interval("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_interval("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_interval("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_interval("fast"), None);
    }

    #[tokio::test]
    async fn advertised_limit_slows_requests_down() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/works")
            .with_status(200)
            .with_header("x-rate-limit-limit", "50")
            .with_header("x-rate-limit-interval", "1s")
            .with_body("{}")
            .create_async()
            .await;

        let client = client();
        assert_eq!(client.interval().await, Duration::ZERO);
        let _: serde_json::Value = client.get_json(&format!("{}/works", server.url())).await.unwrap();
        assert_eq!(client.interval().await, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn exhausted_retries_report_rate_limit() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/busy")
            .with_status(429)
            .with_header("retry-after", "0")
            .expect(2)
            .create_async()
            .await;

        let err = client().get(&format!("{}/busy", server.url())).await.unwrap_err();
        assert!(matches!(err, ScienceError::RateLimit(_, 0)));
    }

    #[tokio::test]
    async fn missing_resources_are_not_service_failures() {
        let mut server = Server::new_async().await;
        let _m = server.mock("GET", "/works/none").with_status(404).create_async().await;

        let err = client().get(&format!("{}/works/none", server.url())).await.unwrap_err();
        assert!(matches!(err, ScienceError::IdentifierNotFound(_)));
    }

    #[test]
    fn blocking_client_fetches_json() {
        let mut server = Server::new();
        let _m = server
            .mock("GET", "/ping")
            .with_status(200)
            .with_body(r#"{"ok": true}"#)
            .create();

        let client = BlockingClient::new(client()).unwrap();
        let value: serde_json::Value = client.get_json(&format!("{}/ping", server.url())).unwrap();
        assert_eq!(value["ok"], true);
    }
}
