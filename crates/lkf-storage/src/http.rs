use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Shutdown,
}

impl FetchError {
    /// Timeouts, connection failures, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                .unwrap_or(false),
            FetchError::Shutdown => false,
        }
    }
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        retries: 0,
        base: Duration::ZERO,
        cap: Duration::ZERO,
    };

    /// Delay before retry number `retry` (zero-based), or `None` once retries are spent.
    pub fn delay(&self, retry: u32) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.cap))
    }
}

/// At most `burst` requests back to back, then one more per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_lane: usize,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_lane: 4,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Token bucket on the tokio clock.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            burst: limit.burst.max(1),
            interval: limit.interval,
        };
        Self {
            limit,
            state: Mutex::new(Bucket {
                tokens: limit.burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits until a request may go out.
    pub async fn acquire(&self) {
        loop {
            let ready_at = {
                let mut bucket = self.state.lock().await;
                let now = Instant::now();
                if !self.limit.interval.is_zero() {
                    let elapsed = now.duration_since(bucket.refilled_at);
                    let earned = elapsed.as_nanos() / self.limit.interval.as_nanos();
                    if earned > 0 {
                        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                        bucket.tokens = bucket.tokens.saturating_add(earned).min(self.limit.burst);
                        bucket.refilled_at += self.limit.interval.saturating_mul(earned);
                    }
                }
                if bucket.tokens > 0 || self.limit.interval.is_zero() {
                    bucket.tokens = bucket.tokens.saturating_sub(1);
                    return;
                }
                bucket.refilled_at + self.limit.interval
            };
            tokio::time::sleep_until(ready_at).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Shared GET client. Every request names a lane ("provider", "images", "plans",
/// "geocoder"); lanes are limited separately under one global limit.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    lanes: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_lane: usize,
    rate_limiter: Option<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            lanes: Mutex::new(HashMap::new()),
            per_lane: config.max_in_flight_per_lane.max(1),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            retry: config.retry,
        })
    }

    async fn lane(&self, name: &str) -> Arc<Semaphore> {
        let mut lanes = self.lanes.lock().await;
        if let Some(lane) = lanes.get(name) {
            return Arc::clone(lane);
        }
        let lane = Arc::new(Semaphore::new(self.per_lane));
        lanes.insert(name.to_string(), Arc::clone(&lane));
        lane
    }

    /// GET with the configured retries on transient failures.
    pub async fn fetch_bytes(&self, lane: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get(lane, url, self.retry).await
    }

    /// Single GET attempt.
    pub async fn fetch_once(&self, lane: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get(lane, url, RetryPolicy::NONE).await
    }

    async fn get(
        &self,
        lane: &str,
        url: &str,
        retry: RetryPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.in_flight.acquire().await.map_err(|_| FetchError::Shutdown)?;
        let lane_limit = self.lane(lane).await;
        let _lane = lane_limit.acquire().await.map_err(|_| FetchError::Shutdown)?;

        async {
            let mut retries = 0;
            loop {
                if let Some(limiter) = &self.rate_limiter {
                    limiter.acquire().await;
                }
                let err = match self.send(url).await {
                    Ok(response) => {
                        debug!(status = %response.status, bytes = response.body.len(), "fetched");
                        return Ok(response);
                    }
                    Err(err) => err,
                };
                match retry.delay(retries).filter(|_| err.is_transient()) {
                    Some(delay) => {
                        warn!(error = %err, retry = retries + 1, ?delay, "transient fetch failure");
                        tokio::time::sleep(delay).await;
                        retries += 1;
                    }
                    None => return Err(err),
                }
            }
        }
        .instrument(info_span!("http_get", lane, url))
        .await
    }

    async fn send(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(FetchedResponse {
            status,
            final_url,
            body: response.bytes().await?.to_vec(),
        })
    }
}
