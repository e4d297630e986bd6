use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use banksync_adapters::{
    gocardless, AdapterContext, NormalizeError, Normalized, ProviderAdapter, ProviderRegistry,
};
use banksync_core::{
    AccountOutcome, AccountStatus, ConnectionStatus, Credentials, NormalizedAccount,
    NormalizedTransaction, ProviderError, RawFetch, ResponseMeta, SyncError, SyncJobStatus,
    SyncWindow, TransactionStatus,
};
use banksync_storage::{LedgerStore, MemoryLedgerStore, MemoryRawStore};
use banksync_sync::{run_due_syncs, EngineSettings, HealthBand, SyncEngine, SyncOptions};
use chrono::{Duration, Utc};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Notify;
use uuid::Uuid;

/// Serves canned GoCardless-shaped documents and records what the engine asked for.
struct ScriptedAdapter {
    accounts: Mutex<Result<JsonValue, ProviderError>>,
    transactions: Mutex<HashMap<String, Result<JsonValue, ProviderError>>>,
    windows: Mutex<Vec<(String, SyncWindow)>>,
    refreshes: Mutex<usize>,
    /// When set, account listing signals the first notify and waits on the second.
    listing_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl ScriptedAdapter {
    fn new(accounts: Vec<JsonValue>) -> Arc<Self> {
        Arc::new(Self {
            accounts: Mutex::new(Ok(accounts_doc(accounts))),
            transactions: Mutex::new(HashMap::new()),
            windows: Mutex::new(Vec::new()),
            refreshes: Mutex::new(0),
            listing_gate: Mutex::new(None),
        })
    }

    /// Block account listing until the returned `release` is notified.
    /// Returns `(entered, release)`.
    fn hold_listing(&self) -> (Arc<Notify>, Arc<Notify>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.listing_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn set_accounts(&self, accounts: Result<JsonValue, ProviderError>) {
        *self.accounts.lock().unwrap() = accounts;
    }

    fn set_transactions(&self, account: &str, doc: Result<JsonValue, ProviderError>) {
        self.transactions.lock().unwrap().insert(account.to_string(), doc);
    }

    fn windows(&self) -> Vec<(String, SyncWindow)> {
        self.windows.lock().unwrap().clone()
    }

    fn refreshes(&self) -> usize {
        *self.refreshes.lock().unwrap()
    }
}

fn raw(payload: JsonValue) -> RawFetch {
    RawFetch {
        payload,
        response: ResponseMeta {
            status_code: 200,
            duration_ms: 3,
            request_path: "/scripted".to_string(),
        },
        fetched_at: Utc::now(),
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn fetch_raw_accounts(
        &self,
        _ctx: &AdapterContext,
        _credentials: &Credentials,
    ) -> Result<RawFetch, ProviderError> {
        let gate = self.listing_gate.lock().unwrap().clone();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        self.accounts.lock().unwrap().clone().map(raw)
    }

    async fn fetch_raw_transactions(
        &self,
        _ctx: &AdapterContext,
        _credentials: &Credentials,
        account_external_id: &str,
        window: &SyncWindow,
    ) -> Result<RawFetch, ProviderError> {
        self.windows
            .lock()
            .unwrap()
            .push((account_external_id.to_string(), *window));
        self.transactions
            .lock()
            .unwrap()
            .get(account_external_id)
            .cloned()
            .unwrap_or_else(|| Ok(tx_doc(vec![], vec![])))
            .map(raw)
    }

    async fn refresh_credentials(&self, refresh_token: &str) -> Result<Credentials, ProviderError> {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        *self.refreshes.lock().unwrap() += 1;
        if refresh_token == "revoked" {
            return Err(ProviderError::Auth("refresh token revoked".to_string()));
        }
        Ok(Credentials {
            access_token: "fresh-access".to_string(),
            refresh_token: Some(refresh_token.to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        })
    }

    fn normalize_accounts(
        &self,
        raw: &JsonValue,
    ) -> Result<Normalized<NormalizedAccount>, NormalizeError> {
        gocardless::normalize_accounts(raw)
    }

    fn normalize_transactions(
        &self,
        account_external_id: &str,
        raw: &JsonValue,
    ) -> Result<Normalized<NormalizedTransaction>, NormalizeError> {
        gocardless::normalize_transactions(account_external_id, raw)
    }
}

fn account(id: &str, iban: &str) -> JsonValue {
    json!({
        "id": id,
        "details": {"account": {
            "iban": iban,
            "currency": "EUR",
            "name": format!("Account {id}"),
            "cashAccountType": "CACC"
        }},
        "balances": {"balances": [
            {
                "balanceAmount": {"amount": "100.00", "currency": "EUR"},
                "balanceType": "closingBooked"
            }
        ]}
    })
}

fn accounts_doc(accounts: Vec<JsonValue>) -> JsonValue {
    json!({
        "requisition": {"id": "req-1", "institution_id": "SANDBOXFINANCE_SFIN0000"},
        "accounts": accounts
    })
}

fn tx(id: &str, amount: &str, date: &str) -> JsonValue {
    json!({
        "transactionId": id,
        "bookingDate": date,
        "transactionAmount": {"amount": amount, "currency": "EUR"},
        "remittanceInformationUnstructured": format!("payment {id}")
    })
}

fn tx_doc(booked: Vec<JsonValue>, pending: Vec<JsonValue>) -> JsonValue {
    json!({"transactions": {"booked": booked, "pending": pending}})
}

fn valid_credentials() -> Credentials {
    Credentials {
        access_token: "access".to_string(),
        refresh_token: Some("refresh".to_string()),
        expires_at: Some(Utc::now() + Duration::hours(1)),
    }
}

struct Harness {
    engine: Arc<SyncEngine>,
    ledger: Arc<MemoryLedgerStore>,
    raw: Arc<MemoryRawStore>,
    adapter: Arc<ScriptedAdapter>,
    tenant: Uuid,
}

impl Harness {
    fn new(adapter: Arc<ScriptedAdapter>) -> Self {
        let ledger = Arc::new(MemoryLedgerStore::new());
        let raw = Arc::new(MemoryRawStore::new());
        let mut registry = ProviderRegistry::new();
        registry.register(adapter.clone());
        let engine = SyncEngine::new(
            ledger.clone(),
            raw.clone(),
            registry,
            EngineSettings {
                account_concurrency: 2,
                ..EngineSettings::default()
            },
        );
        Self {
            engine: Arc::new(engine),
            ledger,
            raw,
            adapter,
            tenant: Uuid::new_v4(),
        }
    }

    async fn connect(&self, credentials: Credentials) -> Uuid {
        self.engine
            .create_connection(
                self.tenant,
                "scripted",
                Some("req-1".to_string()),
                Some(credentials),
            )
            .await
            .unwrap()
            .id
    }

    async fn sync(&self, connection_id: Uuid, options: SyncOptions) -> banksync_sync::SyncResult {
        self.engine.trigger_sync(self.tenant, connection_id, options).await.unwrap()
    }
}

fn forced() -> SyncOptions {
    SyncOptions {
        force: true,
        ..SyncOptions::default()
    }
}

#[tokio::test]
async fn first_sync_backfills_and_imports_everything() {
    let adapter = ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]);
    adapter.set_transactions(
        "acc-1",
        Ok(tx_doc(
            vec![tx("t-1", "-12.50", "2026-03-01"), tx("t-2", "2450.00", "2026-03-02")],
            vec![],
        )),
    );
    let h = Harness::new(adapter);
    let connection_id = h.connect(valid_credentials()).await;

    let result = h.sync(connection_id, SyncOptions::default()).await;
    assert_eq!(result.status, SyncJobStatus::Completed);
    assert_eq!(result.counts.accounts_fetched, 1);
    assert_eq!(result.counts.transactions_imported, 2);
    assert!(result.accounts[0].is_new);
    assert_eq!(result.accounts[0].window_reason.as_deref(), Some("initial_backfill"));

    let windows = h.adapter.windows();
    assert_eq!(windows.len(), 1);
    assert_eq!((windows[0].1.end - windows[0].1.start).num_days(), 90);

    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert!(connection.last_sync_at.is_some());
    assert!(connection.next_sync_at.unwrap() > Utc::now());
    let summary = connection.sync_summary.unwrap();
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["counts"]["transactions_imported"], 2);

    let accounts = h.engine.list_accounts(h.tenant).await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert!(accounts[0].last_synced_at.is_some());
    assert_eq!(h.engine.list_transactions(h.tenant, Some(accounts[0].id)).await.unwrap().len(), 2);
    // account listing plus one transaction document
    assert_eq!(h.raw.len().await, 2);
}

#[tokio::test]
async fn recent_sync_is_skipped_unless_forced() {
    let h = Harness::new(ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]));
    let connection_id = h.connect(valid_credentials()).await;
    h.sync(connection_id, SyncOptions::default()).await;

    let again = h.sync(connection_id, SyncOptions::default()).await;
    assert_eq!(again.status, SyncJobStatus::Completed);
    assert_eq!(again.accounts[0].outcome, AccountOutcome::Skipped);
    assert_eq!(again.accounts[0].window_reason.as_deref(), Some("recently_synced"));

    let forced_run = h.sync(connection_id, forced()).await;
    assert_eq!(forced_run.accounts[0].outcome, AccountOutcome::Synced);
    assert_eq!(forced_run.accounts[0].window_reason.as_deref(), Some("incremental"));
    assert_eq!(h.adapter.windows().len(), 2);
}

#[tokio::test]
async fn pending_transaction_is_updated_in_place_when_booked() {
    let adapter = ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]);
    adapter.set_transactions("acc-1", Ok(tx_doc(vec![], vec![tx("t-1", "-5.50", "2026-03-02")])));
    let h = Harness::new(adapter);
    let connection_id = h.connect(valid_credentials()).await;

    h.sync(connection_id, SyncOptions::default()).await;
    let before = h.engine.list_transactions(h.tenant, None).await.unwrap();
    assert_eq!(before[0].status, TransactionStatus::Pending);

    h.adapter
        .set_transactions("acc-1", Ok(tx_doc(vec![tx("t-1", "-5.50", "2026-03-02")], vec![])));
    let result = h.sync(connection_id, forced()).await;
    assert_eq!(result.accounts[0].transactions_updated, 1);
    assert_eq!(result.accounts[0].transactions_inserted, 0);

    let after = h.engine.list_transactions(h.tenant, None).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].status, TransactionStatus::Booked);
}

#[tokio::test]
async fn one_failing_account_makes_the_job_partial() {
    let adapter = ScriptedAdapter::new(vec![
        account("acc-1", "DE89370400440532013000"),
        account("acc-2", "DE02120300000000202051"),
        account("acc-3", "GB33BUKB20201555555555"),
    ]);
    adapter.set_transactions("acc-1", Ok(tx_doc(vec![tx("a-1", "-1.00", "2026-03-01")], vec![])));
    adapter.set_transactions("acc-2", Err(ProviderError::Unavailable("upstream 503".to_string())));
    adapter.set_transactions("acc-3", Ok(tx_doc(vec![tx("c-1", "-3.00", "2026-03-01")], vec![])));
    let h = Harness::new(adapter);
    let connection_id = h.connect(valid_credentials()).await;

    let result = h.sync(connection_id, SyncOptions::default()).await;
    assert_eq!(result.status, SyncJobStatus::Partial);
    assert_eq!(result.counts.accounts_processed, 2);
    assert_eq!(result.counts.failed, 1);
    assert_eq!(result.counts.transactions_imported, 2);
    assert!(result.errors.iter().any(|e| e.contains("acc-2")));
    let failed: Vec<_> = result
        .accounts
        .iter()
        .filter(|a| a.outcome == AccountOutcome::Failed)
        .map(|a| a.external_id.as_str())
        .collect();
    assert_eq!(failed, vec!["acc-2"]);

    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert_eq!(connection.consecutive_failures, 0);
    let summary = connection.sync_summary.unwrap();
    assert_eq!(summary["status"], "partial");
    let errors = summary["errors"].as_array().unwrap();
    assert_eq!(errors.len(), result.errors.len());
    assert!(errors.iter().any(|e| e.as_str().unwrap().contains("acc-2")));
    assert!(summary["warnings"].is_array());
}

#[tokio::test]
async fn accounts_failing_transiently_never_fail_the_job() {
    let adapter = ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]);
    adapter.set_transactions(
        "acc-1",
        Err(ProviderError::Unavailable("upstream 503".to_string())),
    );
    let h = Harness::new(adapter);
    let connection_id = h.connect(valid_credentials()).await;

    for _ in 0..3 {
        let result = h.sync(connection_id, forced()).await;
        assert_eq!(result.status, SyncJobStatus::Partial);
        assert_eq!(result.counts.failed, 1);
    }

    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert_eq!(connection.consecutive_failures, 0);
    assert!(connection.next_sync_at.is_some());
}

#[tokio::test]
async fn auth_failure_puts_connection_into_error() {
    let h = Harness::new(ScriptedAdapter::new(vec![]));
    h.adapter
        .set_accounts(Err(ProviderError::Auth("consent expired".to_string())));
    let connection_id = h.connect(valid_credentials()).await;

    let result = h.sync(connection_id, SyncOptions::default()).await;
    assert_eq!(result.status, SyncJobStatus::Failed);

    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    assert_eq!(connection.status, ConnectionStatus::Error);
    assert_eq!(connection.next_sync_at, None);

    let err = h
        .engine
        .trigger_sync(h.tenant, connection_id, SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConnectionNotSyncable { .. }));

    let health = h.engine.get_connection_health(h.tenant, connection_id).await.unwrap();
    assert_eq!(health.status, ConnectionStatus::Error);
    assert_eq!(health.consecutive_failures, 1);
    assert!(health.score < 1.0);
}

#[tokio::test]
async fn rate_limit_backs_off_then_escalates_after_threshold() {
    let h = Harness::new(ScriptedAdapter::new(vec![]));
    h.adapter.set_accounts(Err(ProviderError::RateLimited {
        message: "slow down".to_string(),
        retry_after_secs: Some(7200),
    }));
    let connection_id = h.connect(valid_credentials()).await;

    let before = Utc::now();
    h.sync(connection_id, SyncOptions::default()).await;
    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert_eq!(connection.consecutive_failures, 1);
    assert!(connection.next_sync_at.unwrap() >= before + Duration::hours(2));

    h.sync(connection_id, SyncOptions::default()).await;
    h.sync(connection_id, SyncOptions::default()).await;
    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    assert_eq!(connection.consecutive_failures, 3);
    assert_eq!(connection.status, ConnectionStatus::Error);

    let health = h.engine.get_connection_health(h.tenant, connection_id).await.unwrap();
    assert_eq!(health.success_rate_7d, 0.0);
    assert_eq!(health.band, HealthBand::Critical);
}

#[tokio::test]
async fn expiring_credentials_are_refreshed_once_for_concurrent_jobs() {
    let h = Harness::new(ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]));
    let connection_id = h
        .connect(Credentials {
            access_token: "stale".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() - Duration::minutes(5)),
        })
        .await;

    let (first, second) = tokio::join!(
        h.engine.trigger_sync(h.tenant, connection_id, forced()),
        h.engine.trigger_sync(h.tenant, connection_id, forced()),
    );
    assert_eq!(first.unwrap().status, SyncJobStatus::Completed);
    assert_eq!(second.unwrap().status, SyncJobStatus::Completed);
    assert_eq!(h.adapter.refreshes(), 1);

    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    let stored = h
        .ledger
        .get_credentials(h.tenant, connection.credential_ref.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.access_token, "fresh-access");
}

#[tokio::test]
async fn revoked_refresh_token_fails_the_job_as_auth() {
    let h = Harness::new(ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]));
    let connection_id = h
        .connect(Credentials {
            access_token: "stale".to_string(),
            refresh_token: Some("revoked".to_string()),
            expires_at: Some(Utc::now() - Duration::minutes(5)),
        })
        .await;

    let result = h.sync(connection_id, SyncOptions::default()).await;
    assert_eq!(result.status, SyncJobStatus::Failed);
    assert!(result.errors[0].starts_with("credentials:"));
    assert!(h.adapter.windows().is_empty());
    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    assert_eq!(connection.status, ConnectionStatus::Error);
}

#[tokio::test]
async fn accounts_missing_from_listing_are_marked_closed() {
    let h = Harness::new(ScriptedAdapter::new(vec![
        account("acc-1", "DE89370400440532013000"),
        account("acc-2", "DE02120300000000202051"),
    ]));
    let connection_id = h.connect(valid_credentials()).await;
    h.sync(connection_id, SyncOptions::default()).await;

    h.adapter
        .set_accounts(Ok(accounts_doc(vec![account("acc-1", "DE89370400440532013000")])));
    let result = h.sync(connection_id, forced()).await;
    assert!(result.warnings.iter().any(|w| w == "1 account(s) marked closed"));

    let accounts = h.engine.list_accounts(h.tenant).await.unwrap();
    let closed = accounts
        .iter()
        .find(|a| a.external_id.as_deref() == Some("acc-2"))
        .unwrap();
    assert_eq!(closed.status, AccountStatus::Closed);
}

#[tokio::test]
async fn transactions_only_run_uses_stored_accounts() {
    let h = Harness::new(ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]));
    let connection_id = h.connect(valid_credentials()).await;
    h.sync(connection_id, SyncOptions::default()).await;

    h.adapter
        .set_accounts(Err(ProviderError::Unavailable("listing is down".to_string())));
    let result = h
        .sync(
            connection_id,
            SyncOptions {
                sync_accounts: false,
                force: true,
                ..SyncOptions::default()
            },
        )
        .await;
    assert_eq!(result.status, SyncJobStatus::Completed);
    assert_eq!(result.accounts.len(), 1);
    assert_eq!(h.adapter.windows().len(), 2);
}

#[tokio::test]
async fn window_override_is_passed_through() {
    let h = Harness::new(ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]));
    let connection_id = h.connect(valid_credentials()).await;
    let end = Utc::now();
    let start = end - Duration::days(400);

    let result = h
        .sync(
            connection_id,
            SyncOptions {
                transaction_window_override: Some(SyncWindow {
                    start: end,
                    end: start,
                    max_count: Some(500),
                }),
                ..SyncOptions::default()
            },
        )
        .await;
    assert_eq!(result.accounts[0].window_reason.as_deref(), Some("override"));
    let window = h.adapter.windows()[0].1;
    assert_eq!(window.start, start);
    assert_eq!(window.end, end);
    assert_eq!(window.max_count, Some(500));
}

#[tokio::test]
async fn connections_are_scoped_to_their_tenant() {
    let h = Harness::new(ScriptedAdapter::new(vec![]));
    let connection_id = h.connect(valid_credentials()).await;

    let err = h
        .engine
        .trigger_sync(Uuid::new_v4(), connection_id, SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConnectionNotFound(id) if id == connection_id));
    assert!(h.engine.list_jobs(Uuid::new_v4(), connection_id, 10).await.is_err());
}

#[tokio::test]
async fn lifecycle_disable_disconnect_and_reauthorize() {
    let h = Harness::new(ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]));
    let connection_id = h.connect(valid_credentials()).await;

    let disabled = h.engine.set_connection_enabled(h.tenant, connection_id, false).await.unwrap();
    assert_eq!(disabled.status, ConnectionStatus::Inactive);
    assert!(h.engine.trigger_sync(h.tenant, connection_id, SyncOptions::default()).await.is_err());

    let enabled = h.engine.set_connection_enabled(h.tenant, connection_id, true).await.unwrap();
    assert_eq!(enabled.status, ConnectionStatus::Active);

    let gone = h.engine.disconnect(h.tenant, connection_id).await.unwrap();
    assert!(gone.disconnected_at.is_some());
    assert_eq!(gone.credential_ref, None);
    assert!(h.engine.set_connection_enabled(h.tenant, connection_id, true).await.is_err());

    let back = h
        .engine
        .reauthorize_connection(h.tenant, connection_id, valid_credentials(), None)
        .await
        .unwrap();
    assert_eq!(back.status, ConnectionStatus::Active);
    assert_eq!(back.consecutive_failures, 0);
    assert_eq!(back.disconnected_at, None);
    assert_eq!(back.provider_reference.as_deref(), Some("req-1"));

    let result = h.sync(connection_id, SyncOptions::default()).await;
    assert_eq!(result.status, SyncJobStatus::Completed);
}

#[tokio::test]
async fn unknown_provider_is_rejected_at_creation() {
    let h = Harness::new(ScriptedAdapter::new(vec![]));
    let err = h
        .engine
        .create_connection(h.tenant, "nordigen-legacy", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownProvider(_)));
}

#[tokio::test]
async fn scheduler_pass_syncs_due_connections_only() {
    let h = Harness::new(ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]));
    h.connect(valid_credentials()).await;
    let paused = h.connect(valid_credentials()).await;
    h.engine.set_connection_enabled(h.tenant, paused, false).await.unwrap();
    // registered without credentials: pending setup, never picked by the scheduler
    h.engine
        .create_connection(h.tenant, "scripted", None, None)
        .await
        .unwrap();

    let first = run_due_syncs(&h.engine, Utc::now() + Duration::seconds(1), 10, 2)
        .await
        .unwrap();
    assert_eq!(first.due, 1);
    assert_eq!(first.completed, 1);

    let second = run_due_syncs(&h.engine, Utc::now() + Duration::seconds(1), 10, 2)
        .await
        .unwrap();
    assert_eq!(second.due, 0);

    let connections = h.engine.list_connections(h.tenant).await.unwrap();
    assert_eq!(connections.len(), 3);
}

#[tokio::test]
async fn connection_disconnected_mid_job_stays_inactive() {
    let h = Harness::new(ScriptedAdapter::new(vec![]));
    h.adapter
        .set_accounts(Err(ProviderError::Auth("consent revoked".to_string())));
    let (entered, release) = h.adapter.hold_listing();
    let connection_id = h.connect(valid_credentials()).await;

    let job = tokio::spawn({
        let engine = h.engine.clone();
        let tenant = h.tenant;
        async move {
            engine
                .trigger_sync(tenant, connection_id, SyncOptions::default())
                .await
        }
    });
    entered.notified().await;
    h.engine.disconnect(h.tenant, connection_id).await.unwrap();
    release.notify_one();

    let result = job.await.unwrap().unwrap();
    assert_eq!(result.status, SyncJobStatus::Failed);
    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    assert_eq!(connection.status, ConnectionStatus::Inactive);
    assert_eq!(connection.next_sync_at, None);
    assert_eq!(connection.consecutive_failures, 0);
    assert!(connection.disconnected_at.is_some());
    assert_eq!(connection.sync_summary.unwrap()["status"], "failed");
}

#[tokio::test]
async fn connection_disabled_mid_job_is_not_rescheduled() {
    let h = Harness::new(ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]));
    let (entered, release) = h.adapter.hold_listing();
    let connection_id = h.connect(valid_credentials()).await;

    let job = tokio::spawn({
        let engine = h.engine.clone();
        let tenant = h.tenant;
        async move {
            engine
                .trigger_sync(tenant, connection_id, SyncOptions::default())
                .await
        }
    });
    entered.notified().await;
    h.engine
        .set_connection_enabled(h.tenant, connection_id, false)
        .await
        .unwrap();
    release.notify_one();

    assert_eq!(job.await.unwrap().unwrap().status, SyncJobStatus::Completed);
    let connection = h.engine.get_connection(h.tenant, connection_id).await.unwrap();
    assert_eq!(connection.status, ConnectionStatus::Inactive);
    assert_eq!(connection.next_sync_at, None);
}

#[tokio::test]
async fn overlapping_scheduler_pass_skips_claimed_connections() {
    let h = Harness::new(ScriptedAdapter::new(vec![account("acc-1", "DE89370400440532013000")]));
    let (entered, release) = h.adapter.hold_listing();
    h.connect(valid_credentials()).await;

    let first = tokio::spawn({
        let engine = h.engine.clone();
        async move { run_due_syncs(&engine, Utc::now() + Duration::seconds(1), 10, 2).await }
    });
    entered.notified().await;

    let overlapping = run_due_syncs(&h.engine, Utc::now() + Duration::seconds(1), 10, 2)
        .await
        .unwrap();
    assert_eq!(overlapping.due, 0);

    release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.due, 1);
    assert_eq!(first.completed, 1);
}
