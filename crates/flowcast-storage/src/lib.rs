//! Rate-limited HTTP fetching and the on-disk response cache.

mod cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use cache::{
    sha256_hex, CacheEntry, CacheError, CacheMode, DiskCache, Fingerprint, MemoryCache,
    ResponseCache,
};

pub const CRATE_NAME: &str = "flowcast-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// What kind of retryable failure an attempt hit; rate limits back off longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Transient,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub rate_limit_base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            rate_limit_base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, kind: FailureKind, attempt_index: usize) -> Duration {
        let base = match kind {
            FailureKind::RateLimited => self.rate_limit_base_delay,
            FailureKind::Transient => self.base_delay,
        };
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(self.max_delay)
    }
}

/// Where a single fetch currently is in its bounded retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: usize },
    BackingOff { attempt: usize, delay: Duration },
    Exhausted { attempts: usize },
}

/// `Attempting -> BackingOff -> Attempting ... -> Exhausted`, at most
/// `max_retries + 1` attempts in total.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: BackoffPolicy,
    state: RetryState,
}

impl RetryMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting { attempt: 0 },
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Record a retryable failure of the current attempt.
    pub fn record_failure(&mut self, kind: FailureKind) -> RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = if attempt < self.policy.max_retries {
                RetryState::BackingOff {
                    attempt,
                    delay: self.policy.delay_for_attempt(kind, attempt),
                }
            } else {
                RetryState::Exhausted {
                    attempts: attempt + 1,
                }
            };
        }
        self.state
    }

    /// Leave the backoff sleep and start the next attempt.
    pub fn resume(&mut self) -> RetryState {
        if let RetryState::BackingOff { attempt, .. } = self.state {
            self.state = RetryState::Attempting {
                attempt: attempt + 1,
            };
        }
        self.state
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Minimum gap between request starts against the same source.
    pub min_spacing: Option<Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            min_spacing: Some(Duration::from_millis(120)),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Hands out request start slots no closer together than `min_spacing`.
#[derive(Debug)]
pub struct RequestPacer {
    min_spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.min_spacing);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Connect,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self.kind {
            TransportErrorKind::Timeout | TransportErrorKind::Connect => RetryDisposition::Retryable,
            TransportErrorKind::Other => RetryDisposition::NonRetryable,
        }
    }
}

/// The network seam. Production uses reqwest; tests plug in stub upstreams.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<RawResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn transport_error_from_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::timeout(err.to_string())
    } else if classify_reqwest_error(&err) == RetryDisposition::Retryable {
        TransportError::connect(err.to_string())
    } else {
        TransportError::other(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<RawResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error_from_reqwest)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp
            .bytes()
            .await
            .map_err(transport_error_from_reqwest)?
            .to_vec();
        Ok(RawResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("gave up on {url} after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: usize,
        last_error: String,
    },
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: Vec<u8>,
    },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Exhausted { attempts, .. } => *attempts,
            FetchError::HttpStatus { .. } | FetchError::Transport { .. } => 1,
        }
    }
}

#[derive(Debug)]
struct SourceLimits {
    semaphore: Semaphore,
    pacer: Option<RequestPacer>,
}

pub struct HttpFetcher {
    transport: Arc<dyn Transport>,
    global_limit: Semaphore,
    per_source_limit: usize,
    min_spacing: Option<Duration>,
    per_source: Mutex<HashMap<String, Arc<SourceLimits>>>,
    request_timeout: Duration,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("per_source_limit", &self.per_source_limit)
            .field("min_spacing", &self.min_spacing)
            .field("request_timeout", &self.request_timeout)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: HttpClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            global_limit: Semaphore::new(config.global_concurrency.max(1)),
            per_source_limit: config.per_source_concurrency.max(1),
            min_spacing: config.min_spacing.filter(|d| !d.is_zero()),
            per_source: Mutex::new(HashMap::new()),
            request_timeout: config.timeout,
            backoff: config.backoff,
        }
    }

    async fn source_limits(&self, source_id: &str) -> Arc<SourceLimits> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| {
                Arc::new(SourceLimits {
                    semaphore: Semaphore::new(self.per_source_limit),
                    pacer: self.min_spacing.map(RequestPacer::new),
                })
            })
            .clone()
    }

    async fn attempt(&self, limits: &SourceLimits, url: &str) -> Result<RawResponse, TransportError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| TransportError::other("global request limiter closed"))?;
        let _source = limits
            .semaphore
            .acquire()
            .await
            .map_err(|_| TransportError::other("source request limiter closed"))?;

        if let Some(pacer) = &limits.pacer {
            pacer.wait_turn().await;
        }

        match tokio::time::timeout(self.request_timeout, self.transport.get(url)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!(
                "no response within {:?}",
                self.request_timeout
            ))),
        }
    }

    /// GET `url` under the concurrency ceilings, retrying retryable failures.
    ///
    /// Permits are held per attempt, not across backoff sleeps.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retry(source_id, url).instrument(span).await
    }

    async fn fetch_with_retry(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let limits = self.source_limits(source_id).await;
        let mut retry = RetryMachine::new(self.backoff);
        let mut last_error = String::new();

        loop {
            match retry.state() {
                RetryState::Attempting { attempt } => match self.attempt(&limits, url).await {
                    Ok(resp) if resp.status.is_success() => {
                        return Ok(FetchedResponse {
                            status: resp.status,
                            final_url: resp.final_url,
                            body: resp.body,
                            attempts: attempt + 1,
                        });
                    }
                    Ok(resp) => {
                        if classify_status(resp.status) == RetryDisposition::NonRetryable {
                            return Err(FetchError::HttpStatus {
                                status: resp.status.as_u16(),
                                url: resp.final_url,
                                body: resp.body,
                            });
                        }
                        let kind = if resp.status == StatusCode::TOO_MANY_REQUESTS {
                            FailureKind::RateLimited
                        } else {
                            FailureKind::Transient
                        };
                        last_error = format!("http status {}", resp.status.as_u16());
                        warn!(attempt, status = resp.status.as_u16(), "retryable upstream status");
                        retry.record_failure(kind);
                    }
                    Err(err) => {
                        if err.disposition() == RetryDisposition::NonRetryable {
                            return Err(FetchError::Transport {
                                url: url.to_string(),
                                message: err.message,
                            });
                        }
                        warn!(attempt, error = %err, "retryable transport failure");
                        last_error = err.message;
                        retry.record_failure(FailureKind::Transient);
                    }
                },
                RetryState::BackingOff { attempt, delay } => {
                    debug!(attempt, ?delay, "backing off before retry");
                    tokio::time::sleep(delay).await;
                    retry.resume();
                }
                RetryState::Exhausted { attempts } => {
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts,
                        last_error,
                    });
                }
            }
        }
    }
}
