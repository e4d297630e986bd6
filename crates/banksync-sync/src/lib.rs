use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use banksync_adapters::ProviderRegistry;
use banksync_storage::{
    FileRawStore, HttpClientConfig, HttpFetcher, LedgerStore, MemoryLedgerStore, PgStore,
    RawCaptureStore,
};
use tracing::info;

pub mod config;
pub mod health;
pub mod importer;
pub mod locks;
pub mod matcher;
pub mod orchestrator;
pub mod planner;
pub mod scheduler;

pub use config::{load_providers, parse_providers, StoreKind, SyncConfig};
pub use health::{FailureKind, HealthBand, HealthPolicy, HealthReport, HealthTracker};
pub use importer::{ImportSummary, TransactionImporter};
pub use matcher::{AccountMatcher, MatchedBy, Resolution};
pub use orchestrator::{EngineSettings, SyncEngine, SyncOptions, SyncResult};
pub use planner::{plan_window, PlanOptions, WindowPlan, WindowReason};
pub use scheduler::{maybe_build_scheduler, run_due_syncs, DueRunSummary};

pub const CRATE_NAME: &str = "banksync-sync";

pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub raw: Arc<dyn RawCaptureStore>,
}

pub async fn open_stores(config: &SyncConfig) -> Result<Stores> {
    match config.store {
        StoreKind::Memory => {
            info!(raw_dir = %config.raw_dir.display(), "using in-memory ledger");
            Ok(Stores {
                ledger: Arc::new(MemoryLedgerStore::new()),
                raw: Arc::new(FileRawStore::new(&config.raw_dir)),
            })
        }
        StoreKind::Postgres => {
            let pg = Arc::new(
                PgStore::connect(&config.database_url, 10)
                    .await
                    .context("connecting ledger database")?,
            );
            Ok(Stores {
                ledger: pg.clone(),
                raw: pg,
            })
        }
    }
}

pub async fn build_engine_with_stores(config: &SyncConfig, stores: Stores) -> Result<SyncEngine> {
    let providers = load_providers(&config.providers_file).await?;
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?);
    let registry = ProviderRegistry::from_configs(&providers, http).await?;
    Ok(SyncEngine::new(
        stores.ledger,
        stores.raw,
        registry,
        EngineSettings::from_config(config),
    ))
}

pub async fn build_engine(config: &SyncConfig) -> Result<SyncEngine> {
    let stores = open_stores(config).await?;
    build_engine_with_stores(config, stores).await
}
