//! Retrying, throttled HTTP transport underneath the remote analysis API.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

const BODY_SNIPPET_LEN: usize = 200;

/// 5xx and 429 are worth another attempt; every other status is final.
pub fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Capped exponential backoff. A `Retry-After` hint from the server replaces
/// the computed delay but is still capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = || {
            let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        };
        retry_after.unwrap_or_else(computed).min(self.max_delay)
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Basic-auth credentials attached to every request. An API token travels as
/// the username with an empty password.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            username: token.into(),
            password: String::new(),
        }
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &"<redacted>")
            .finish()
    }
}

/// At most `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub burst: u32,
    pub interval: Duration,
}

#[derive(Debug)]
pub struct RequestThrottle {
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

#[derive(Debug)]
struct ThrottleState {
    available: u32,
    refilled_at: Instant,
}

impl RequestThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ThrottleState {
                available: config.burst.max(1),
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits until a request slot is free and claims it.
    pub async fn acquire(&self) {
        let interval = self.config.interval;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if !interval.is_zero() {
                    let elapsed = state.refilled_at.elapsed();
                    let earned = u32::try_from(elapsed.as_nanos() / interval.as_nanos()).unwrap_or(u32::MAX);
                    if earned > 0 {
                        state.available = state
                            .available
                            .saturating_add(earned)
                            .min(self.config.burst.max(1));
                        state.refilled_at += interval.saturating_mul(earned);
                    }
                }
                if state.available > 0 || interval.is_zero() {
                    state.available = state.available.saturating_sub(1);
                    return;
                }
                (state.refilled_at + interval).saturating_duration_since(Instant::now())
            };
            debug!(?wait, "remote request throttled");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} from {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Status { status, .. } => StatusCode::from_u16(*status)
                .map(retryable_status)
                .unwrap_or(false),
            Self::Decode { .. } => false,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    pub throttle: Option<ThrottleConfig>,
    pub auth: Option<BasicAuth>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
            throttle: None,
            auth: None,
        }
    }
}

/// JSON GET client for the remote API.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    throttle: Option<RequestThrottle>,
    auth: Option<BasicAuth>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building remote http client")?;

        Ok(Self {
            client,
            retry: config.retry,
            throttle: config.throttle.map(RequestThrottle::new),
            auth: config.auth,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let span = info_span!("remote_request", url);
        let body = self.get_with_retries(url).instrument(span).await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    async fn get_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0u32;
        loop {
            if let Some(throttle) = &self.throttle {
                throttle.acquire().await;
            }
            let (err, hint) = match self.attempt(url).await {
                Ok(body) => return Ok(body),
                Err(failure) => failure,
            };
            if !err.is_retryable() || attempt >= self.retry.max_retries {
                return Err(err);
            }
            let delay = self.retry.delay_for(attempt, hint);
            warn!(attempt, ?delay, error = %err, "retrying remote request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One request; a failure carries the server's `Retry-After` hint, if any.
    async fn attempt(&self, url: &str) -> Result<Vec<u8>, (FetchError, Option<Duration>)> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let resp = request.send().await.map_err(|e| (transport(e), None))?;
        let status = resp.status();
        let hint = retry_after(resp.headers());
        let body = resp.bytes().await.map_err(|e| (transport(e), None))?;
        if status.is_success() {
            debug!(status = status.as_u16(), bytes = body.len(), "remote response");
            return Ok(body.to_vec());
        }

        let snippet: String = String::from_utf8_lossy(&body)
            .chars()
            .take(BODY_SNIPPET_LEN)
            .collect();
        Err((
            FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: snippet,
            },
            hint,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40, None), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_hint_wins_but_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(60))), Duration::from_secs(5));

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 3 "));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn status_errors_classify_by_code() {
        let status = |code: u16| FetchError::Status {
            status: code,
            url: "http://remote/api".into(),
            body: String::new(),
        };
        assert!(status(502).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(status(403).is_auth_failure());
        assert!(!status(500).is_auth_failure());
    }

    #[test]
    fn token_credentials_use_empty_password_and_are_redacted() {
        let auth = BasicAuth::token("squ_abc");
        assert_eq!(auth.username, "squ_abc");
        assert!(auth.password.is_empty());
        assert!(!format!("{auth:?}").contains("squ_abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_allows_a_burst_then_spaces_requests() {
        let throttle = RequestThrottle::new(ThrottleConfig {
            burst: 2,
            interval: Duration::from_secs(1),
        });
        let started = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(10));

        throttle.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
