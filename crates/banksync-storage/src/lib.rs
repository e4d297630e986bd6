//! Raw capture storage, ledger persistence and provider HTTP utilities.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use banksync_core::ProviderError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub mod ledger;
pub mod postgres;
pub mod raw;

pub use ledger::{LedgerStore, MemoryLedgerStore};
pub use postgres::PgStore;
pub use raw::{FileRawStore, MemoryRawStore, RawCaptureStore, StoredRawRecord};

pub const CRATE_NAME: &str = "banksync-storage";

/// Map a non-success provider status onto the error taxonomy.
pub fn classify_status(
    status: StatusCode,
    retry_after_secs: Option<u64>,
    url: &str,
) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Auth(format!("http status {} for {url}", status.as_u16()))
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            message: format!("http status 429 for {url}"),
            retry_after_secs,
        },
        s if s.is_server_error() => {
            ProviderError::Unavailable(format!("http status {} for {url}", s.as_u16()))
        }
        s => ProviderError::Unavailable(format!("unexpected http status {} for {url}", s.as_u16())),
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Unavailable(format!("request timed out: {err}"))
    } else if err.is_decode() {
        ProviderError::Unavailable(format!("undecodable response body: {err}"))
    } else {
        ProviderError::Unavailable(format!("transport error: {err}"))
    }
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Exponential delay schedule used to push back the next sync after transient failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(15 * 60),
            max_delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_provider_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Outbound request description; adapters build these, the fetcher executes them.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: Method,
    pub url: String,
    pub bearer_token: Option<String>,
    pub query: Vec<(String, String)>,
    pub json_body: Option<JsonValue>,
    pub form_body: Option<Vec<(String, String)>>,
}

impl ProviderRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            bearer_token: None,
            query: Vec::new(),
            json_body: None,
            form_body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            bearer_token: None,
            query: Vec::new(),
            json_body: Some(body),
            form_body: None,
        }
    }

    pub fn post_form(url: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            bearer_token: None,
            query: Vec::new(),
            json_body: None,
            form_body: Some(
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        }
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub status: StatusCode,
    pub request_path: String,
    pub body: JsonValue,
    pub duration: Duration,
}

/// Rate-limited JSON client shared by all provider adapters.
///
/// Requests are never retried here; a failed call surfaces as a `ProviderError`
/// and the orchestrator defers the retry to the next scheduled window.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_buckets: Mutex<HashMap<String, Arc<SimpleTokenBucket>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
            token_buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Install provider-specific limits; call before the first request for that provider.
    pub async fn set_provider_limits(
        &self,
        provider: &str,
        concurrency: Option<usize>,
        bucket: Option<TokenBucketConfig>,
    ) {
        if let Some(concurrency) = concurrency {
            self.per_provider
                .lock()
                .await
                .insert(provider.to_string(), Arc::new(Semaphore::new(concurrency.max(1))));
        }
        if let Some(bucket) = bucket {
            self.token_buckets.lock().await.insert(
                provider.to_string(),
                Arc::new(SimpleTokenBucket::new(bucket.capacity, bucket.refill_every)),
            );
        }
    }

    async fn per_provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    async fn token_bucket(&self, provider: &str) -> Option<Arc<SimpleTokenBucket>> {
        self.token_buckets.lock().await.get(provider).cloned()
    }

    pub async fn send_json(
        &self,
        provider: &str,
        request: ProviderRequest,
    ) -> Result<FetchedJson, ProviderError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("http client shut down".to_string()))?;
        let per_provider = self.per_provider_semaphore(provider).await;
        let _provider = per_provider
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("http client shut down".to_string()))?;

        if let Some(bucket) = self.token_bucket(provider).await {
            bucket.take().await;
        }

        let span = info_span!(
            "provider_http",
            provider,
            method = %request.method,
            url = %request.url
        );
        self.execute(request).instrument(span).await
    }

    async fn execute(&self, request: ProviderRequest) -> Result<FetchedJson, ProviderError> {
        let request_path = reqwest::Url::parse(&request.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| request.url.clone());

        let mut builder = self.client.request(request.method.clone(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }
        if let Some(fields) = &request.form_body {
            builder = builder.form(fields);
        }

        let started = Instant::now();
        let resp = builder.send().await.map_err(|e| classify_reqwest_error(&e))?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            let retry_after = retry_after_secs(resp.headers());
            debug!(status = status.as_u16(), "provider returned non-success status");
            return Err(classify_status(status, retry_after, &final_url));
        }

        let bytes = resp.bytes().await.map_err(|e| classify_reqwest_error(&e))?;
        let body = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).map_err(|e| {
                ProviderError::Unavailable(format!("invalid JSON body from {final_url}: {e}"))
            })?
        };

        Ok(FetchedJson {
            status,
            request_path,
            body,
            duration: started.elapsed(),
        })
    }
}
