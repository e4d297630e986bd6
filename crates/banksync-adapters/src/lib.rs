//! Provider adapter contract, normalizers and the registry that wires providers from config.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use banksync_core::{
    Credentials, NormalizedAccount, NormalizedTransaction, ProviderError, RawFetch, SyncError,
    SyncWindow,
};
use banksync_storage::{HttpFetcher, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub mod gocardless;
pub mod normalize;
pub mod tink;

pub use gocardless::GoCardlessAdapter;
pub use normalize::Normalized;
pub use tink::TinkAdapter;

pub const CRATE_NAME: &str = "banksync-adapters";

/// Per-call context handed to adapters; carried into request spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub job_id: Uuid,
    pub connection_id: Uuid,
    /// Provider-side handle for the connection (requisition id, user id, ...).
    pub provider_reference: Option<String>,
}

/// Raised when a whole raw document is unusable. Single bad records are warnings instead.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("{0} payload is not usable: {1}")]
    Payload(&'static str, String),
}

impl From<NormalizeError> for SyncError {
    fn from(err: NormalizeError) -> Self {
        SyncError::MalformedRecord(err.to_string())
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    fn validate_config(&self) -> Result<(), ProviderError>;

    async fn fetch_raw_accounts(
        &self,
        ctx: &AdapterContext,
        credentials: &Credentials,
    ) -> Result<RawFetch, ProviderError>;

    async fn fetch_raw_transactions(
        &self,
        ctx: &AdapterContext,
        credentials: &Credentials,
        account_external_id: &str,
        window: &SyncWindow,
    ) -> Result<RawFetch, ProviderError>;

    /// Exchange a refresh token for fresh credentials.
    /// `Auth` here means re-authorization is required.
    async fn refresh_credentials(&self, refresh_token: &str) -> Result<Credentials, ProviderError>;

    fn normalize_accounts(
        &self,
        raw: &JsonValue,
    ) -> Result<Normalized<NormalizedAccount>, NormalizeError>;

    fn normalize_transactions(
        &self,
        account_external_id: &str,
        raw: &JsonValue,
    ) -> Result<Normalized<NormalizedTransaction>, NormalizeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gocardless,
    Tink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_every_ms: u64,
}

/// One entry of `providers.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub display_name: String,
    pub kind: ProviderKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Name of the environment variable holding the client secret.
    #[serde(default)]
    pub client_secret_env: Option<String>,
}

fn default_enabled() -> bool {
    true
}

pub(crate) fn validate_base_url(base_url: &str) -> Result<(), ProviderError> {
    let parsed = url::Url::parse(base_url)
        .map_err(|e| ProviderError::InvalidConfig(format!("base_url {base_url:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ProviderError::InvalidConfig(format!(
            "base_url {base_url:?} has unsupported scheme {other}"
        ))),
    }
}

pub fn build_adapter(config: &ProviderConfig, http: Arc<HttpFetcher>) -> Arc<dyn ProviderAdapter> {
    match config.kind {
        ProviderKind::Gocardless => Arc::new(GoCardlessAdapter::new(config.clone(), http)),
        ProviderKind::Tink => Arc::new(TinkAdapter::new(config.clone(), http)),
    }
}

/// Explicit provider lookup built once at startup and handed to the orchestrator.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider_id().to_string(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    /// Build adapters for every enabled provider, validating each and installing its HTTP limits.
    pub async fn from_configs(configs: &[ProviderConfig], http: Arc<HttpFetcher>) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.enabled) {
            let adapter = build_adapter(config, http.clone());
            adapter
                .validate_config()
                .with_context(|| format!("validating provider {}", config.provider_id))?;

            let bucket = config.rate_limit.map(|limit| TokenBucketConfig {
                capacity: limit.capacity.max(1),
                refill_every: Duration::from_millis(limit.refill_every_ms),
            });
            http.set_provider_limits(&config.provider_id, config.max_concurrency, bucket)
                .await;

            info!(provider = %config.provider_id, kind = ?config.kind, "registered provider");
            registry.register(adapter);
        }
        Ok(registry)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.provider_ids())
            .finish()
    }
}
