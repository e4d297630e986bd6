//! Sync job execution for one connection, plus the connection lifecycle operations around it.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use banksync_adapters::{AdapterContext, ProviderAdapter, ProviderRegistry};
use banksync_core::{
    AccountOutcome, AccountStatus, AccountSyncSummary, Connection, ConnectionStatus, Credentials,
    InternalAccount, LedgerTransaction, NormalizedAccount, ProviderError, RawFetch, RawRecord,
    RawRecordKey, RawRecordKind, SyncCounts, SyncError, SyncJob, SyncJobStatus, SyncWindow,
};
use banksync_storage::{BackoffPolicy, LedgerStore, RawCaptureStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::health::{FailureKind, HealthPolicy, HealthReport, HealthTracker};
use crate::importer::TransactionImporter;
use crate::locks::KeyedLocks;
use crate::matcher::AccountMatcher;
use crate::planner::{plan_window, PlanOptions, WindowPlan};

const ACCOUNTS_RECORD_ID: &str = "accounts";

fn yes() -> bool {
    true
}

/// Caller knobs for `trigger_sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    #[serde(default = "yes")]
    pub sync_accounts: bool,
    #[serde(default = "yes")]
    pub sync_transactions: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub transaction_window_override: Option<SyncWindow>,
    #[serde(default)]
    pub max_transactions: Option<u32>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sync_accounts: true,
            sync_transactions: true,
            force: false,
            transaction_window_override: None,
            max_transactions: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub job_id: Uuid,
    pub connection_id: Uuid,
    pub status: SyncJobStatus,
    pub counts: SyncCounts,
    pub accounts: Vec<AccountSyncSummary>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl From<SyncJob> for SyncResult {
    fn from(job: SyncJob) -> Self {
        Self {
            job_id: job.id,
            connection_id: job.connection_id,
            status: job.status,
            counts: job.counts,
            accounts: job.accounts,
            errors: job.errors,
            warnings: job.warnings,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration_ms: job.duration_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub account_concurrency: usize,
    /// Upper bound for any single adapter call (fetch or refresh).
    pub provider_timeout: Duration,
    /// Refresh credentials this long before they expire.
    pub refresh_skew: chrono::Duration,
    pub sync_interval: chrono::Duration,
    pub health: HealthPolicy,
    pub backoff: BackoffPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            account_concurrency: 4,
            provider_timeout: Duration::from_secs(120),
            refresh_skew: chrono::Duration::seconds(60),
            sync_interval: chrono::Duration::hours(6),
            health: HealthPolicy::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            account_concurrency: config.account_concurrency.max(1),
            provider_timeout: Duration::from_secs(config.provider_call_timeout_secs.max(1)),
            sync_interval: chrono::Duration::minutes(config.sync_interval_mins.max(1)),
            health: config.health,
            ..Self::default()
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
        Err(ProviderError::Unavailable(format!(
            "{what} timed out after {}s",
            limit.as_secs_f32()
        )))
    })
}

enum AccountInput {
    Reported(NormalizedAccount),
    Stored(InternalAccount),
}

impl AccountInput {
    fn external_id(&self) -> Option<&str> {
        match self {
            Self::Reported(account) => Some(account.external_id.as_str()),
            Self::Stored(account) => account.external_id.as_deref(),
        }
    }
}

struct JobContext<'a> {
    tenant_id: Uuid,
    connection: &'a Connection,
    adapter: &'a dyn ProviderAdapter,
    adapter_ctx: AdapterContext,
    credentials: &'a Credentials,
    plan_options: PlanOptions,
    sync_transactions: bool,
    now: DateTime<Utc>,
}

struct AccountRun {
    summary: AccountSyncSummary,
    warnings: Vec<String>,
    failure: Option<FailureKind>,
}

pub struct SyncEngine {
    ledger: Arc<dyn LedgerStore>,
    raw: Arc<dyn RawCaptureStore>,
    registry: ProviderRegistry,
    matcher: AccountMatcher,
    importer: TransactionImporter,
    health: HealthTracker,
    settings: EngineSettings,
    refresh_locks: KeyedLocks,
}

impl SyncEngine {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        raw: Arc<dyn RawCaptureStore>,
        registry: ProviderRegistry,
        settings: EngineSettings,
    ) -> Self {
        Self {
            matcher: AccountMatcher::new(ledger.clone()),
            importer: TransactionImporter::new(ledger.clone()),
            health: HealthTracker::new(settings.health, settings.backoff, settings.sync_interval),
            ledger,
            raw,
            registry,
            settings,
            refresh_locks: KeyedLocks::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub async fn trigger_sync(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        options: SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        let connection = self.require_connection(tenant_id, connection_id).await?;
        let syncable = match connection.status {
            ConnectionStatus::Active => true,
            ConnectionStatus::PendingSetup => connection.credential_ref.is_some(),
            ConnectionStatus::Error | ConnectionStatus::Inactive => false,
        };
        if !syncable {
            return Err(SyncError::ConnectionNotSyncable {
                id: connection.id,
                status: connection.status,
            });
        }
        let adapter = self
            .registry
            .get(&connection.provider)
            .ok_or_else(|| SyncError::UnknownProvider(connection.provider.clone()))?;

        let mut job = SyncJob::start(tenant_id, connection_id, Utc::now());
        self.ledger.insert_job(&job).await?;

        let span = info_span!(
            "sync_job",
            job_id = %job.id,
            %tenant_id,
            %connection_id,
            provider = %connection.provider
        );
        let (status, failure) = self
            .run_job(&mut job, &connection, adapter.as_ref(), &options)
            .instrument(span.clone())
            .await;

        job.finish(status, Utc::now());
        self.ledger.finalize_job(&job).await?;
        let finished_at = job.finished_at.unwrap_or_else(Utc::now);

        // lifecycle calls may have touched the connection while the job ran
        let mut connection = self
            .ledger
            .get_connection(tenant_id, connection_id)
            .await?
            .unwrap_or(connection);
        let outcomes = self
            .ledger
            .job_outcomes_since(tenant_id, connection_id, finished_at - chrono::Duration::days(30))
            .await?;
        let report = if connection.status == ConnectionStatus::Inactive {
            // disabled or disconnected mid-job: keep its status and schedule
            self.health.report(&connection, &outcomes, finished_at)
        } else {
            self.health
                .record_outcome(&mut connection, status, failure, &outcomes, finished_at)
        };
        connection.sync_summary = Some(sync_summary(&job, &report));
        self.ledger.update_connection(&connection).await?;

        span.in_scope(|| {
            info!(
                status = status.as_str(),
                accounts = job.counts.accounts_fetched,
                imported = job.counts.transactions_imported,
                errors = job.errors.len(),
                warnings = job.warnings.len(),
                health = report.score,
                "sync job finished"
            )
        });
        Ok(SyncResult::from(job))
    }

    async fn run_job(
        &self,
        job: &mut SyncJob,
        connection: &Connection,
        adapter: &dyn ProviderAdapter,
        options: &SyncOptions,
    ) -> (SyncJobStatus, Option<FailureKind>) {
        let credentials = match self.ensure_credentials(connection, adapter).await {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(error = %err, "credential step failed");
                job.errors.push(format!("credentials: {err}"));
                return (SyncJobStatus::Failed, Some(FailureKind::of(&err)));
            }
        };

        let ctx = JobContext {
            tenant_id: connection.tenant_id,
            connection,
            adapter,
            adapter_ctx: AdapterContext {
                job_id: job.id,
                connection_id: connection.id,
                provider_reference: connection.provider_reference.clone(),
            },
            credentials: &credentials,
            plan_options: PlanOptions {
                force: options.force,
                window_override: options.transaction_window_override,
                max_count: options.max_transactions,
            },
            sync_transactions: options.sync_transactions,
            now: Utc::now(),
        };

        let mut listing_clean = false;
        let inputs = if options.sync_accounts {
            match self.fetch_accounts(&ctx).await {
                Ok((accounts, warnings)) => {
                    listing_clean = warnings.is_empty();
                    job.warnings.extend(warnings);
                    accounts.into_iter().map(AccountInput::Reported).collect::<Vec<_>>()
                }
                Err(err) => {
                    warn!(error = %err, "account listing failed");
                    job.errors.push(format!("account listing: {err}"));
                    return (SyncJobStatus::Failed, Some(FailureKind::of(&err)));
                }
            }
        } else {
            match self.ledger.list_connection_accounts(ctx.tenant_id, connection.id).await {
                Ok(accounts) => accounts
                    .into_iter()
                    .filter(|a| a.status == AccountStatus::Active)
                    .map(AccountInput::Stored)
                    .collect(),
                Err(err) => {
                    job.errors.push(format!("loading stored accounts: {err:#}"));
                    return (SyncJobStatus::Failed, Some(FailureKind::Other));
                }
            }
        };
        job.counts.accounts_fetched = inputs.len();

        let reported: BTreeSet<String> = inputs
            .iter()
            .filter_map(|input| input.external_id().map(ToString::to_string))
            .collect();

        let pending = inputs
            .into_iter()
            .map(|input| self.process_account(&ctx, input))
            .collect::<Vec<_>>();
        let concurrency = self.settings.account_concurrency.max(1);
        let mut runs = std::pin::pin!(stream::iter(pending).buffered(concurrency));

        let mut auth_failed = false;
        while let Some(run) = runs.next().await {
            match run.failure {
                Some(kind) => {
                    job.counts.failed += 1;
                    job.errors.push(format!(
                        "account {}: {}",
                        run.summary.external_id,
                        run.summary.error.as_deref().unwrap_or("failed")
                    ));
                    auth_failed |= kind == FailureKind::Auth;
                }
                None => job.counts.accounts_processed += 1,
            }
            job.counts.transactions_fetched += run.summary.transactions_fetched;
            job.counts.transactions_imported +=
                run.summary.transactions_inserted + run.summary.transactions_updated;
            job.warnings.extend(run.warnings);
            job.accounts.push(run.summary);
            if auth_failed {
                break;
            }
        }

        if auth_failed {
            job.errors
                .push("provider rejected credentials; remaining accounts not synced".to_string());
            return (SyncJobStatus::Failed, Some(FailureKind::Auth));
        }

        if options.sync_accounts && listing_clean {
            match self.close_unreported(&ctx, &reported).await {
                Ok(0) => {}
                Ok(closed) => job.warnings.push(format!("{closed} account(s) marked closed")),
                Err(err) => job.errors.push(format!("closing unreported accounts: {err}")),
            }
        }

        // credentials and listing succeeded; account failures never fail the job
        if job.counts.failed == 0 {
            (SyncJobStatus::Completed, None)
        } else {
            (SyncJobStatus::Partial, None)
        }
    }

    /// Current credentials for the connection, refreshed under a per-connection lock when expiring.
    async fn ensure_credentials(
        &self,
        connection: &Connection,
        adapter: &dyn ProviderAdapter,
    ) -> Result<Credentials, SyncError> {
        let credential_ref = connection
            .credential_ref
            .ok_or_else(|| {
                ProviderError::Auth("connection has no stored credentials".to_string())
            })?;

        let _guard = self.refresh_locks.lock(&connection.id.to_string()).await;
        let current = self
            .ledger
            .get_credentials(connection.tenant_id, credential_ref)
            .await?
            .ok_or_else(|| ProviderError::Auth("stored credentials are missing".to_string()))?;
        if !current.needs_refresh(Utc::now(), self.settings.refresh_skew) {
            return Ok(current);
        }

        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            ProviderError::Auth("access token expired and no refresh token is stored".to_string())
        })?;
        info!("refreshing provider credentials");
        let fresh = with_timeout(
            self.settings.provider_timeout,
            "credential refresh",
            adapter.refresh_credentials(&refresh_token),
        )
        .await?;
        self.ledger
            .put_credentials(connection.tenant_id, credential_ref, &fresh)
            .await?;
        Ok(fresh)
    }

    async fn fetch_accounts(
        &self,
        ctx: &JobContext<'_>,
    ) -> Result<(Vec<NormalizedAccount>, Vec<String>), SyncError> {
        let raw = with_timeout(
            self.settings.provider_timeout,
            "account listing",
            ctx.adapter.fetch_raw_accounts(&ctx.adapter_ctx, ctx.credentials),
        )
        .await?;
        self.capture(ctx, ACCOUNTS_RECORD_ID, RawRecordKind::Accounts, &raw).await?;
        let normalized = ctx.adapter.normalize_accounts(&raw.payload)?;
        for warning in &normalized.warnings {
            warn!(%warning, "skipped account record");
        }
        Ok((normalized.records, normalized.warnings))
    }

    async fn capture(
        &self,
        ctx: &JobContext<'_>,
        external_id: &str,
        kind: RawRecordKind,
        raw: &RawFetch,
    ) -> Result<(), SyncError> {
        let key = RawRecordKey::new(ctx.connection.id, &ctx.connection.provider, external_id);
        let record = RawRecord::capture(ctx.tenant_id, key, kind, raw);
        self.raw.store(&record).await?;
        Ok(())
    }

    async fn process_account(&self, ctx: &JobContext<'_>, input: AccountInput) -> AccountRun {
        let external_id = input.external_id().unwrap_or_default().to_string();
        let span = info_span!("sync_account", external_id = %external_id);
        async move {
            let mut run = AccountRun {
                summary: AccountSyncSummary::new(external_id),
                warnings: Vec::new(),
                failure: None,
            };
            if let Err(err) = self.sync_account(ctx, input, &mut run).await {
                warn!(error = %err, "account sync failed");
                run.summary.outcome = AccountOutcome::Failed;
                run.summary.error = Some(err.to_string());
                run.failure = Some(FailureKind::of(&err));
            }
            run
        }
        .instrument(span)
        .await
    }

    async fn sync_account(
        &self,
        ctx: &JobContext<'_>,
        input: AccountInput,
        run: &mut AccountRun,
    ) -> Result<(), SyncError> {
        let (mut account, fetch_id) = match input {
            AccountInput::Reported(reported) => {
                let resolution = self
                    .matcher
                    .resolve(ctx.tenant_id, ctx.connection, &reported, ctx.now)
                    .await?;
                run.summary.is_new = resolution.is_new;
                (resolution.account, Some(reported.external_id))
            }
            AccountInput::Stored(stored) => {
                let fetch_id = stored.external_id.clone();
                (stored, fetch_id)
            }
        };
        run.summary.account_id = Some(account.id);

        if !ctx.sync_transactions {
            return Ok(());
        }
        let Some(fetch_id) = fetch_id else {
            run.summary.outcome = AccountOutcome::Skipped;
            return Ok(());
        };

        let plan = plan_window(&account, ctx.now, &ctx.plan_options);
        run.summary.window_reason = Some(plan.reason().as_str().to_string());
        let window = match plan {
            WindowPlan::Skip { .. } => {
                run.summary.outcome = AccountOutcome::Skipped;
                return Ok(());
            }
            WindowPlan::Fetch { window, .. } => window,
        };

        let raw = with_timeout(
            self.settings.provider_timeout,
            "transaction fetch",
            ctx.adapter
                .fetch_raw_transactions(&ctx.adapter_ctx, ctx.credentials, &fetch_id, &window),
        )
        .await?;
        self.capture(ctx, &format!("transactions:{fetch_id}"), RawRecordKind::Transactions, &raw)
            .await?;

        let normalized = ctx.adapter.normalize_transactions(&fetch_id, &raw.payload)?;
        run.warnings
            .extend(normalized.warnings.iter().map(|w| format!("account {fetch_id}: {w}")));
        run.summary.transactions_fetched = normalized.records.len();

        let imported = self
            .importer
            .import_batch(ctx.tenant_id, ctx.connection, &account, &normalized.records, ctx.now)
            .await?;
        run.summary.transactions_inserted = imported.inserted;
        run.summary.transactions_updated = imported.updated;
        run.summary.transactions_failed = imported.failed;
        run.warnings
            .extend(imported.errors.iter().map(|e| format!("account {fetch_id}: {e}")));

        account.last_synced_at = Some(ctx.now);
        account.updated_at = ctx.now;
        self.ledger.update_account(&account).await?;
        Ok(())
    }

    async fn close_unreported(
        &self,
        ctx: &JobContext<'_>,
        reported: &BTreeSet<String>,
    ) -> anyhow::Result<usize> {
        let mut closed = 0;
        for mut account in self
            .ledger
            .list_connection_accounts(ctx.tenant_id, ctx.connection.id)
            .await?
        {
            let still_reported = account
                .external_id
                .as_ref()
                .is_some_and(|id| reported.contains(id));
            if still_reported || account.status == AccountStatus::Closed {
                continue;
            }
            account.status = AccountStatus::Closed;
            account.updated_at = ctx.now;
            self.ledger.update_account(&account).await?;
            info!(account_id = %account.id, "account no longer reported; marked closed");
            closed += 1;
        }
        Ok(closed)
    }

    async fn require_connection(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Connection, SyncError> {
        self.ledger
            .get_connection(tenant_id, connection_id)
            .await?
            .ok_or(SyncError::ConnectionNotFound(connection_id))
    }

    pub async fn get_connection(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Connection, SyncError> {
        self.require_connection(tenant_id, connection_id).await
    }

    pub async fn list_connections(&self, tenant_id: Uuid) -> Result<Vec<Connection>, SyncError> {
        Ok(self.ledger.list_connections(tenant_id).await?)
    }

    pub async fn get_connection_health(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> Result<HealthReport, SyncError> {
        let connection = self.require_connection(tenant_id, connection_id).await?;
        let now = Utc::now();
        let outcomes = self
            .ledger
            .job_outcomes_since(tenant_id, connection_id, now - chrono::Duration::days(30))
            .await?;
        Ok(self.health.report(&connection, &outcomes, now))
    }

    pub async fn list_jobs(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SyncJob>, SyncError> {
        self.require_connection(tenant_id, connection_id).await?;
        Ok(self.ledger.list_jobs(tenant_id, connection_id, limit).await?)
    }

    pub async fn list_accounts(&self, tenant_id: Uuid) -> Result<Vec<InternalAccount>, SyncError> {
        Ok(self.ledger.list_accounts(tenant_id).await?)
    }

    pub async fn list_transactions(
        &self,
        tenant_id: Uuid,
        account_id: Option<Uuid>,
    ) -> Result<Vec<LedgerTransaction>, SyncError> {
        Ok(self.ledger.list_transactions(tenant_id, account_id).await?)
    }

    /// Register a connection. With credentials it is immediately active and due.
    pub async fn create_connection(
        &self,
        tenant_id: Uuid,
        provider: &str,
        provider_reference: Option<String>,
        credentials: Option<Credentials>,
    ) -> Result<Connection, SyncError> {
        if self.registry.get(provider).is_none() {
            return Err(SyncError::UnknownProvider(provider.to_string()));
        }
        let now = Utc::now();
        let mut connection = Connection::new(tenant_id, provider, now);
        connection.provider_reference = provider_reference;
        if let Some(credentials) = credentials {
            let credential_ref = Uuid::new_v4();
            self.ledger.put_credentials(tenant_id, credential_ref, &credentials).await?;
            connection.credential_ref = Some(credential_ref);
            connection.status = ConnectionStatus::Active;
            connection.next_sync_at = Some(now);
        }
        self.ledger.insert_connection(&connection).await?;
        info!(connection_id = %connection.id, %provider, "connection created");
        Ok(connection)
    }

    /// Store new credentials and return the connection to `active` with a clean failure count.
    pub async fn reauthorize_connection(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        credentials: Credentials,
        provider_reference: Option<String>,
    ) -> Result<Connection, SyncError> {
        let mut connection = self.require_connection(tenant_id, connection_id).await?;
        let now = Utc::now();
        let credential_ref = connection.credential_ref.unwrap_or_else(Uuid::new_v4);
        {
            let _guard = self.refresh_locks.lock(&connection.id.to_string()).await;
            self.ledger.put_credentials(tenant_id, credential_ref, &credentials).await?;
        }
        connection.credential_ref = Some(credential_ref);
        if provider_reference.is_some() {
            connection.provider_reference = provider_reference;
        }
        connection.status = ConnectionStatus::Active;
        connection.consecutive_failures = 0;
        connection.next_sync_at = Some(now);
        connection.disconnected_at = None;
        connection.updated_at = now;
        self.ledger.update_connection(&connection).await?;
        info!(%connection_id, "connection re-authorized");
        Ok(connection)
    }

    pub async fn set_connection_enabled(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        enabled: bool,
    ) -> Result<Connection, SyncError> {
        let mut connection = self.require_connection(tenant_id, connection_id).await?;
        let now = Utc::now();
        if enabled {
            match connection.status {
                ConnectionStatus::Active => return Ok(connection),
                ConnectionStatus::Inactive if connection.disconnected_at.is_none() => {
                    connection.status = ConnectionStatus::Active;
                    connection.next_sync_at = Some(now);
                }
                status => {
                    return Err(SyncError::ConnectionNotSyncable {
                        id: connection_id,
                        status,
                    })
                }
            }
        } else {
            if connection.status == ConnectionStatus::Inactive {
                return Ok(connection);
            }
            connection.status = ConnectionStatus::Inactive;
            connection.next_sync_at = None;
        }
        connection.updated_at = now;
        self.ledger.update_connection(&connection).await?;
        info!(%connection_id, enabled, "connection enablement changed");
        Ok(connection)
    }

    /// Soft-retire a connection. Accounts and history stay; only re-authorization revives it.
    pub async fn disconnect(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Connection, SyncError> {
        let mut connection = self.require_connection(tenant_id, connection_id).await?;
        let now = Utc::now();
        connection.status = ConnectionStatus::Inactive;
        connection.credential_ref = None;
        connection.next_sync_at = None;
        connection.disconnected_at = Some(now);
        connection.updated_at = now;
        self.ledger.update_connection(&connection).await?;
        info!(%connection_id, "connection disconnected");
        Ok(connection)
    }
}

fn sync_summary(job: &SyncJob, report: &HealthReport) -> JsonValue {
    json!({
        "job_id": job.id,
        "status": job.status.as_str(),
        "finished_at": job.finished_at,
        "duration_ms": job.duration_ms,
        "counts": job.counts,
        "errors": job.errors,
        "warnings": job.warnings,
        "accounts": job
            .accounts
            .iter()
            .map(|a| json!({
                "external_id": a.external_id,
                "account_id": a.account_id,
                "outcome": a.outcome,
                "window_reason": a.window_reason,
                "transactions_inserted": a.transactions_inserted,
                "transactions_updated": a.transactions_updated,
            }))
            .collect::<Vec<_>>(),
        "health": {
            "score": report.score,
            "band": report.band.as_str(),
        },
    })
}
