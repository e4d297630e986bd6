//! Postgres-backed ledger and raw capture store.

use anyhow::{bail, Context};
use async_trait::async_trait;
use banksync_core::{
    AccountKind, AccountStatus, Connection, ConnectionStatus, Credentials, Direction,
    InternalAccount, LedgerTransaction, RawRecord, RawRecordKey, RawRecordKind, ResponseMeta,
    SyncCounts, SyncJob, SyncJobStatus, TransactionStatus, UpsertOutcome,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::ledger::LedgerStore;
use crate::raw::{payload_hash, RawCaptureStore, StoredRawRecord};

const CONNECTION_COLUMNS: &str = "id, tenant_id, provider, provider_reference, status, \
     credential_ref, last_sync_at, next_sync_at, consecutive_failures, health_score, \
     sync_summary, created_at, updated_at, disconnected_at";

const ACCOUNT_COLUMNS: &str = "id, tenant_id, connection_id, provider, external_id, iban, bic, \
     bank_name, account_number, display_name, holder_name, kind, currency, balance, status, \
     last_synced_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, tenant_id, account_id, connection_id, provider, \
     external_id, amount, currency, direction, booked_date, value_date, description, \
     counterparty, category, status, created_at, updated_at";

const JOB_COLUMNS: &str = "id, tenant_id, connection_id, status, counts, errors, warnings, \
     accounts, started_at, finished_at, duration_ms";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }
}

fn connection_from_row(row: &PgRow) -> anyhow::Result<Connection> {
    let status: String = row.try_get("status")?;
    let failures: i32 = row.try_get("consecutive_failures")?;
    let summary: Option<Json<serde_json::Value>> = row.try_get("sync_summary")?;
    Ok(Connection {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        provider: row.try_get("provider")?,
        provider_reference: row.try_get("provider_reference")?,
        status: ConnectionStatus::parse(&status)
            .with_context(|| format!("unknown connection status {status}"))?,
        credential_ref: row.try_get("credential_ref")?,
        last_sync_at: row.try_get("last_sync_at")?,
        next_sync_at: row.try_get("next_sync_at")?,
        consecutive_failures: failures.max(0) as u32,
        health_score: row.try_get("health_score")?,
        sync_summary: summary.map(|j| j.0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        disconnected_at: row.try_get("disconnected_at")?,
    })
}

fn account_from_row(row: &PgRow) -> anyhow::Result<InternalAccount> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(InternalAccount {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        connection_id: row.try_get("connection_id")?,
        provider: row.try_get("provider")?,
        external_id: row.try_get("external_id")?,
        iban: row.try_get("iban")?,
        bic: row.try_get("bic")?,
        bank_name: row.try_get("bank_name")?,
        account_number: row.try_get("account_number")?,
        display_name: row.try_get("display_name")?,
        holder_name: row.try_get("holder_name")?,
        kind: AccountKind::parse(&kind).with_context(|| format!("unknown account kind {kind}"))?,
        currency: row.try_get("currency")?,
        balance: row.try_get("balance")?,
        status: AccountStatus::parse(&status)
            .with_context(|| format!("unknown account status {status}"))?,
        last_synced_at: row.try_get("last_synced_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> anyhow::Result<LedgerTransaction> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    Ok(LedgerTransaction {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        account_id: row.try_get("account_id")?,
        connection_id: row.try_get("connection_id")?,
        provider: row.try_get("provider")?,
        external_id: row.try_get("external_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        direction: Direction::parse(&direction)
            .with_context(|| format!("unknown direction {direction}"))?,
        booked_date: row.try_get("booked_date")?,
        value_date: row.try_get("value_date")?,
        description: row.try_get("description")?,
        counterparty: row.try_get("counterparty")?,
        category: row.try_get("category")?,
        status: TransactionStatus::parse(&status)
            .with_context(|| format!("unknown transaction status {status}"))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> anyhow::Result<SyncJob> {
    let status: String = row.try_get("status")?;
    let counts: Json<SyncCounts> = row.try_get("counts")?;
    let errors: Json<Vec<String>> = row.try_get("errors")?;
    let warnings: Json<Vec<String>> = row.try_get("warnings")?;
    let accounts: Json<Vec<banksync_core::AccountSyncSummary>> = row.try_get("accounts")?;
    let duration_ms: Option<i64> = row.try_get("duration_ms")?;
    Ok(SyncJob {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        connection_id: row.try_get("connection_id")?,
        status: SyncJobStatus::parse(&status)
            .with_context(|| format!("unknown job status {status}"))?,
        counts: counts.0,
        errors: errors.0,
        warnings: warnings.0,
        accounts: accounts.0,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: duration_ms.map(|d| d.max(0) as u64),
    })
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn insert_connection(&self, c: &Connection) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO connections ({CONNECTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(c.id)
        .bind(c.tenant_id)
        .bind(&c.provider)
        .bind(&c.provider_reference)
        .bind(c.status.as_str())
        .bind(c.credential_ref)
        .bind(c.last_sync_at)
        .bind(c.next_sync_at)
        .bind(c.consecutive_failures as i32)
        .bind(c.health_score)
        .bind(c.sync_summary.clone().map(Json))
        .bind(c.created_at)
        .bind(c.updated_at)
        .bind(c.disconnected_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting connection {}", c.id))?;
        Ok(())
    }

    async fn get_connection(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> anyhow::Result<Option<Connection>> {
        let row = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM connections WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("loading connection")?;
        row.as_ref().map(connection_from_row).transpose()
    }

    async fn update_connection(&self, c: &Connection) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE connections SET provider_reference = $3, status = $4, credential_ref = $5, \
             last_sync_at = $6, next_sync_at = $7, consecutive_failures = $8, health_score = $9, \
             sync_summary = $10, updated_at = $11, disconnected_at = $12 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(c.tenant_id)
        .bind(c.id)
        .bind(&c.provider_reference)
        .bind(c.status.as_str())
        .bind(c.credential_ref)
        .bind(c.last_sync_at)
        .bind(c.next_sync_at)
        .bind(c.consecutive_failures as i32)
        .bind(c.health_score)
        .bind(c.sync_summary.clone().map(Json))
        .bind(c.updated_at)
        .bind(c.disconnected_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating connection {}", c.id))?;
        if result.rows_affected() == 0 {
            bail!("connection {} not found", c.id);
        }
        Ok(())
    }

    async fn list_connections(&self, tenant_id: Uuid) -> anyhow::Result<Vec<Connection>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM connections WHERE tenant_id = $1 ORDER BY created_at"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .context("listing connections")?;
        rows.iter().map(connection_from_row).collect()
    }

    async fn claim_due_connections(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Connection>> {
        let rows = sqlx::query(&format!(
            "UPDATE connections SET next_sync_at = $2 WHERE id IN ( \
                 SELECT id FROM connections \
                 WHERE status = 'active' AND (next_sync_at IS NULL OR next_sync_at <= $1) \
                 ORDER BY next_sync_at NULLS FIRST LIMIT $3 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {CONNECTION_COLUMNS}"
        ))
        .bind(now)
        .bind(lease_until)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("claiming due connections")?;
        rows.iter().map(connection_from_row).collect()
    }

    async fn get_credentials(
        &self,
        tenant_id: Uuid,
        credential_ref: Uuid,
    ) -> anyhow::Result<Option<Credentials>> {
        let row = sqlx::query(
            "SELECT access_token, refresh_token, expires_at FROM credentials \
             WHERE tenant_id = $1 AND credential_ref = $2",
        )
        .bind(tenant_id)
        .bind(credential_ref)
        .fetch_optional(&self.pool)
        .await
        .context("loading credentials")?;
        row.map(|row| -> anyhow::Result<Credentials> {
            Ok(Credentials {
                access_token: row.try_get("access_token")?,
                refresh_token: row.try_get("refresh_token")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    async fn put_credentials(
        &self,
        tenant_id: Uuid,
        credential_ref: Uuid,
        credentials: &Credentials,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO credentials \
             (tenant_id, credential_ref, access_token, refresh_token, expires_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, now()) \
             ON CONFLICT (tenant_id, credential_ref) DO UPDATE SET \
             access_token = EXCLUDED.access_token, refresh_token = EXCLUDED.refresh_token, \
             expires_at = EXCLUDED.expires_at, updated_at = now()",
        )
        .bind(tenant_id)
        .bind(credential_ref)
        .bind(&credentials.access_token)
        .bind(&credentials.refresh_token)
        .bind(credentials.expires_at)
        .execute(&self.pool)
        .await
        .context("storing credentials")?;
        Ok(())
    }

    async fn get_account(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> anyhow::Result<Option<InternalAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM internal_accounts WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("loading account")?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_account_by_iban(
        &self,
        tenant_id: Uuid,
        iban: &str,
    ) -> anyhow::Result<Option<InternalAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM internal_accounts WHERE tenant_id = $1 AND iban = $2"
        ))
        .bind(tenant_id)
        .bind(iban)
        .fetch_optional(&self.pool)
        .await
        .context("finding account by iban")?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_account_by_external_id(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        external_id: &str,
    ) -> anyhow::Result<Option<InternalAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM internal_accounts \
             WHERE tenant_id = $1 AND connection_id = $2 AND external_id = $3"
        ))
        .bind(tenant_id)
        .bind(connection_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("finding account by external id")?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_accounts_by_bank_number(
        &self,
        tenant_id: Uuid,
        bank_name: &str,
        account_number: &str,
    ) -> anyhow::Result<Vec<InternalAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM internal_accounts \
             WHERE tenant_id = $1 AND bank_name = $2 AND account_number = $3 ORDER BY created_at"
        ))
        .bind(tenant_id)
        .bind(bank_name)
        .bind(account_number)
        .fetch_all(&self.pool)
        .await
        .context("finding accounts by bank and number")?;
        rows.iter().map(account_from_row).collect()
    }

    async fn insert_account(&self, a: &InternalAccount) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO internal_accounts ({ACCOUNT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
             $16, $17, $18)"
        ))
        .bind(a.id)
        .bind(a.tenant_id)
        .bind(a.connection_id)
        .bind(&a.provider)
        .bind(&a.external_id)
        .bind(&a.iban)
        .bind(&a.bic)
        .bind(&a.bank_name)
        .bind(&a.account_number)
        .bind(&a.display_name)
        .bind(&a.holder_name)
        .bind(a.kind.as_str())
        .bind(&a.currency)
        .bind(a.balance)
        .bind(a.status.as_str())
        .bind(a.last_synced_at)
        .bind(a.created_at)
        .bind(a.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting account {}", a.id))?;
        Ok(())
    }

    async fn update_account(&self, a: &InternalAccount) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE internal_accounts SET iban = $3, bic = $4, bank_name = $5, \
             account_number = $6, display_name = $7, holder_name = $8, kind = $9, \
             currency = $10, balance = $11, status = $12, last_synced_at = $13, updated_at = $14 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(a.tenant_id)
        .bind(a.id)
        .bind(&a.iban)
        .bind(&a.bic)
        .bind(&a.bank_name)
        .bind(&a.account_number)
        .bind(&a.display_name)
        .bind(&a.holder_name)
        .bind(a.kind.as_str())
        .bind(&a.currency)
        .bind(a.balance)
        .bind(a.status.as_str())
        .bind(a.last_synced_at)
        .bind(a.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating account {}", a.id))?;
        if result.rows_affected() == 0 {
            bail!("account {} not found", a.id);
        }
        Ok(())
    }

    async fn list_accounts(&self, tenant_id: Uuid) -> anyhow::Result<Vec<InternalAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM internal_accounts \
             WHERE tenant_id = $1 ORDER BY created_at"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .context("listing accounts")?;
        rows.iter().map(account_from_row).collect()
    }

    async fn list_connection_accounts(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> anyhow::Result<Vec<InternalAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM internal_accounts \
             WHERE tenant_id = $1 AND connection_id = $2 ORDER BY created_at"
        ))
        .bind(tenant_id)
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .context("listing connection accounts")?;
        rows.iter().map(account_from_row).collect()
    }

    async fn upsert_transaction(&self, t: &LedgerTransaction) -> anyhow::Result<UpsertOutcome> {
        let row = sqlx::query(&format!(
            "INSERT INTO transactions ({TRANSACTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             ON CONFLICT (tenant_id, connection_id, external_id) DO UPDATE SET \
             account_id = EXCLUDED.account_id, amount = EXCLUDED.amount, \
             currency = EXCLUDED.currency, \
             direction = EXCLUDED.direction, booked_date = EXCLUDED.booked_date, \
             value_date = EXCLUDED.value_date, description = EXCLUDED.description, \
             counterparty = EXCLUDED.counterparty, category = EXCLUDED.category, \
             status = EXCLUDED.status, updated_at = EXCLUDED.updated_at \
             WHERE (transactions.account_id, transactions.amount, transactions.currency, \
                    transactions.direction, transactions.booked_date, transactions.value_date, \
                    transactions.description, transactions.counterparty, transactions.category, \
                    transactions.status) \
             IS DISTINCT FROM (EXCLUDED.account_id, EXCLUDED.amount, EXCLUDED.currency, \
                    EXCLUDED.direction, EXCLUDED.booked_date, EXCLUDED.value_date, \
                    EXCLUDED.description, EXCLUDED.counterparty, EXCLUDED.category, \
                    EXCLUDED.status) \
             RETURNING (xmax = 0) AS inserted"
        ))
        .bind(t.id)
        .bind(t.tenant_id)
        .bind(t.account_id)
        .bind(t.connection_id)
        .bind(&t.provider)
        .bind(&t.external_id)
        .bind(t.amount)
        .bind(&t.currency)
        .bind(t.direction.as_str())
        .bind(t.booked_date)
        .bind(t.value_date)
        .bind(&t.description)
        .bind(&t.counterparty)
        .bind(&t.category)
        .bind(t.status.as_str())
        .bind(t.created_at)
        .bind(t.updated_at)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("upserting transaction {}", t.external_id))?;

        match row {
            None => Ok(UpsertOutcome::Unchanged),
            Some(row) if row.try_get::<bool, _>("inserted")? => Ok(UpsertOutcome::Inserted),
            Some(_) => Ok(UpsertOutcome::Updated),
        }
    }

    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        account_id: Option<Uuid>,
    ) -> anyhow::Result<Vec<LedgerTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE tenant_id = $1 AND ($2::uuid IS NULL OR account_id = $2) \
             ORDER BY booked_date DESC, external_id"
        ))
        .bind(tenant_id)
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("listing transactions")?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn insert_job(&self, job: &SyncJob) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO sync_jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(job.connection_id)
        .bind(job.status.as_str())
        .bind(Json(&job.counts))
        .bind(Json(&job.errors))
        .bind(Json(&job.warnings))
        .bind(Json(&job.accounts))
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.duration_ms.map(|d| d as i64))
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting sync job {}", job.id))?;
        Ok(())
    }

    async fn finalize_job(&self, job: &SyncJob) -> anyhow::Result<()> {
        if !job.status.is_terminal() {
            bail!("sync job {} finalized with non-terminal status {:?}", job.id, job.status);
        }
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = $3, counts = $4, errors = $5, warnings = $6, \
             accounts = $7, finished_at = $8, duration_ms = $9 \
             WHERE tenant_id = $1 AND id = $2 AND status IN ('pending', 'running')",
        )
        .bind(job.tenant_id)
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(Json(&job.counts))
        .bind(Json(&job.errors))
        .bind(Json(&job.warnings))
        .bind(Json(&job.accounts))
        .bind(job.finished_at)
        .bind(job.duration_ms.map(|d| d as i64))
        .execute(&self.pool)
        .await
        .with_context(|| format!("finalizing sync job {}", job.id))?;
        if result.rows_affected() == 0 {
            bail!("sync job {} is missing or already finalized", job.id);
        }
        Ok(())
    }

    async fn list_jobs(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<SyncJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE tenant_id = $1 AND connection_id = $2 \
             ORDER BY started_at DESC LIMIT $3"
        ))
        .bind(tenant_id)
        .bind(connection_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("listing sync jobs")?;
        rows.iter().map(job_from_row).collect()
    }

    async fn job_outcomes_since(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<(DateTime<Utc>, SyncJobStatus)>> {
        let rows = sqlx::query(
            "SELECT finished_at, status FROM sync_jobs \
             WHERE tenant_id = $1 AND connection_id = $2 AND finished_at >= $3 \
             AND status IN ('completed', 'failed', 'partial') ORDER BY finished_at DESC",
        )
        .bind(tenant_id)
        .bind(connection_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("loading job outcomes")?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let status = SyncJobStatus::parse(&status)
                    .with_context(|| format!("unknown job status {status}"))?;
                Ok((row.try_get("finished_at")?, status))
            })
            .collect()
    }
}

#[async_trait]
impl RawCaptureStore for PgStore {
    async fn store(&self, record: &RawRecord) -> anyhow::Result<StoredRawRecord> {
        let (content_hash, byte_size) = payload_hash(record)?;
        let row = sqlx::query(
            "INSERT INTO raw_records (id, tenant_id, connection_id, provider, external_id, kind, \
             payload, status_code, duration_ms, request_path, content_hash, fetched_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (connection_id, provider, external_id) DO UPDATE SET \
             kind = EXCLUDED.kind, payload = EXCLUDED.payload, status_code = EXCLUDED.status_code, \
             duration_ms = EXCLUDED.duration_ms, request_path = EXCLUDED.request_path, \
             content_hash = EXCLUDED.content_hash, fetched_at = EXCLUDED.fetched_at \
             RETURNING (xmax <> 0) AS replaced",
        )
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(record.key.connection_id)
        .bind(&record.key.provider)
        .bind(&record.key.external_id)
        .bind(record.kind.as_str())
        .bind(Json(&record.payload))
        .bind(record.response.status_code as i32)
        .bind(record.response.duration_ms as i64)
        .bind(&record.response.request_path)
        .bind(&content_hash)
        .bind(record.fetched_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("storing raw record {}", record.key.external_id))?;

        Ok(StoredRawRecord {
            record_id: record.id,
            content_hash,
            byte_size,
            replaced: row.try_get("replaced")?,
        })
    }

    async fn latest(
        &self,
        tenant_id: Uuid,
        key: &RawRecordKey,
    ) -> anyhow::Result<Option<RawRecord>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, kind, payload, status_code, duration_ms, request_path, \
             fetched_at FROM raw_records \
             WHERE tenant_id = $1 AND connection_id = $2 AND provider = $3 AND external_id = $4",
        )
        .bind(tenant_id)
        .bind(key.connection_id)
        .bind(&key.provider)
        .bind(&key.external_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading raw record")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind: String = row.try_get("kind")?;
        let payload: Json<serde_json::Value> = row.try_get("payload")?;
        let status_code: i32 = row.try_get("status_code")?;
        let duration_ms: i64 = row.try_get("duration_ms")?;
        Ok(Some(RawRecord {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            key: key.clone(),
            kind: RawRecordKind::parse(&kind).with_context(|| format!("unknown raw kind {kind}"))?,
            payload: payload.0,
            response: ResponseMeta {
                status_code: status_code.max(0) as u16,
                duration_ms: duration_ms.max(0) as u64,
                request_path: row.try_get("request_path")?,
            },
            fetched_at: row.try_get("fetched_at")?,
        }))
    }
}
