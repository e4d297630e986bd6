//! Tenant-scoped ledger persistence: connections, accounts, transactions, sync jobs.

use std::collections::HashMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use banksync_core::{
    Connection, Credentials, InternalAccount, LedgerTransaction, SyncJob, SyncJobStatus,
    UpsertOutcome,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Durable collections behind the engine. Every tenant-scoped call filters on `tenant_id`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_connection(&self, connection: &Connection) -> anyhow::Result<()>;
    async fn get_connection(&self, tenant_id: Uuid, id: Uuid) -> anyhow::Result<Option<Connection>>;
    async fn update_connection(&self, connection: &Connection) -> anyhow::Result<()>;
    async fn list_connections(&self, tenant_id: Uuid) -> anyhow::Result<Vec<Connection>>;
    /// Cross-tenant scan used by the scheduler only.
    /// Active connections due at `now`, with `next_sync_at` moved to `lease_until` so an
    /// overlapping pass does not pick them up again.
    async fn claim_due_connections(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Connection>>;

    async fn get_credentials(
        &self,
        tenant_id: Uuid,
        credential_ref: Uuid,
    ) -> anyhow::Result<Option<Credentials>>;
    async fn put_credentials(
        &self,
        tenant_id: Uuid,
        credential_ref: Uuid,
        credentials: &Credentials,
    ) -> anyhow::Result<()>;

    async fn get_account(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> anyhow::Result<Option<InternalAccount>>;
    async fn find_account_by_iban(
        &self,
        tenant_id: Uuid,
        iban: &str,
    ) -> anyhow::Result<Option<InternalAccount>>;
    async fn find_account_by_external_id(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        external_id: &str,
    ) -> anyhow::Result<Option<InternalAccount>>;
    async fn find_accounts_by_bank_number(
        &self,
        tenant_id: Uuid,
        bank_name: &str,
        account_number: &str,
    ) -> anyhow::Result<Vec<InternalAccount>>;
    async fn insert_account(&self, account: &InternalAccount) -> anyhow::Result<()>;
    async fn update_account(&self, account: &InternalAccount) -> anyhow::Result<()>;
    async fn list_accounts(&self, tenant_id: Uuid) -> anyhow::Result<Vec<InternalAccount>>;
    async fn list_connection_accounts(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> anyhow::Result<Vec<InternalAccount>>;

    /// Insert or update keyed by (tenant, connection, external id). The stored id never changes.
    async fn upsert_transaction(&self, tx: &LedgerTransaction) -> anyhow::Result<UpsertOutcome>;
    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        account_id: Option<Uuid>,
    ) -> anyhow::Result<Vec<LedgerTransaction>>;

    async fn insert_job(&self, job: &SyncJob) -> anyhow::Result<()>;
    /// Writes the terminal state of a running job exactly once.
    async fn finalize_job(&self, job: &SyncJob) -> anyhow::Result<()>;
    async fn list_jobs(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<SyncJob>>;
    /// Terminal job statuses finished at or after `since`, newest first.
    async fn job_outcomes_since(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<(DateTime<Utc>, SyncJobStatus)>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    connections: HashMap<Uuid, Connection>,
    credentials: HashMap<(Uuid, Uuid), Credentials>,
    accounts: HashMap<Uuid, InternalAccount>,
    transactions: HashMap<(Uuid, Uuid, String), LedgerTransaction>,
    jobs: Vec<SyncJob>,
}

/// In-process store used by tests and single-node local runs.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: RwLock<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn account_conflicts(
    existing: &InternalAccount,
    candidate: &InternalAccount,
) -> Option<&'static str> {
    if existing.id == candidate.id || existing.tenant_id != candidate.tenant_id {
        return None;
    }
    if existing.iban.is_some() && existing.iban == candidate.iban {
        return Some("iban");
    }
    if existing.connection_id.is_some()
        && existing.connection_id == candidate.connection_id
        && existing.external_id.is_some()
        && existing.external_id == candidate.external_id
    {
        return Some("connection external id");
    }
    None
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_connection(&self, connection: &Connection) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.connections.contains_key(&connection.id) {
            bail!("connection {} already exists", connection.id);
        }
        state.connections.insert(connection.id, connection.clone());
        Ok(())
    }

    async fn get_connection(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> anyhow::Result<Option<Connection>> {
        Ok(self
            .state
            .read()
            .await
            .connections
            .get(&id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn update_connection(&self, connection: &Connection) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .connections
            .get_mut(&connection.id)
            .filter(|c| c.tenant_id == connection.tenant_id)
            .with_context(|| format!("connection {} not found", connection.id))?;
        *slot = connection.clone();
        Ok(())
    }

    async fn list_connections(&self, tenant_id: Uuid) -> anyhow::Result<Vec<Connection>> {
        let state = self.state.read().await;
        let mut out = state
            .connections
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn claim_due_connections(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Connection>> {
        let mut state = self.state.write().await;
        let mut due = state
            .connections
            .values_mut()
            .filter(|c| c.is_auto_syncable(now))
            .collect::<Vec<_>>();
        due.sort_by_key(|c| c.next_sync_at);
        due.truncate(limit);
        Ok(due
            .into_iter()
            .map(|c| {
                c.next_sync_at = Some(lease_until);
                c.clone()
            })
            .collect())
    }

    async fn get_credentials(
        &self,
        tenant_id: Uuid,
        credential_ref: Uuid,
    ) -> anyhow::Result<Option<Credentials>> {
        Ok(self
            .state
            .read()
            .await
            .credentials
            .get(&(tenant_id, credential_ref))
            .cloned())
    }

    async fn put_credentials(
        &self,
        tenant_id: Uuid,
        credential_ref: Uuid,
        credentials: &Credentials,
    ) -> anyhow::Result<()> {
        self.state
            .write()
            .await
            .credentials
            .insert((tenant_id, credential_ref), credentials.clone());
        Ok(())
    }

    async fn get_account(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> anyhow::Result<Option<InternalAccount>> {
        Ok(self
            .state
            .read()
            .await
            .accounts
            .get(&id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_account_by_iban(
        &self,
        tenant_id: Uuid,
        iban: &str,
    ) -> anyhow::Result<Option<InternalAccount>> {
        Ok(self
            .state
            .read()
            .await
            .accounts
            .values()
            .find(|a| a.tenant_id == tenant_id && a.iban.as_deref() == Some(iban))
            .cloned())
    }

    async fn find_account_by_external_id(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        external_id: &str,
    ) -> anyhow::Result<Option<InternalAccount>> {
        Ok(self
            .state
            .read()
            .await
            .accounts
            .values()
            .find(|a| {
                a.tenant_id == tenant_id
                    && a.connection_id == Some(connection_id)
                    && a.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn find_accounts_by_bank_number(
        &self,
        tenant_id: Uuid,
        bank_name: &str,
        account_number: &str,
    ) -> anyhow::Result<Vec<InternalAccount>> {
        let state = self.state.read().await;
        let mut out = state
            .accounts
            .values()
            .filter(|a| {
                a.tenant_id == tenant_id
                    && a.bank_name.as_deref() == Some(bank_name)
                    && a.account_number.as_deref() == Some(account_number)
            })
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|a| a.created_at);
        Ok(out)
    }

    async fn insert_account(&self, account: &InternalAccount) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if let Some(kind) = state
            .accounts
            .values()
            .find_map(|existing| account_conflicts(existing, account))
        {
            bail!("account violates unique {kind} constraint for tenant {}", account.tenant_id);
        }
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn update_account(&self, account: &InternalAccount) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if let Some(kind) = state
            .accounts
            .values()
            .find_map(|existing| account_conflicts(existing, account))
        {
            bail!("account update violates unique {kind} constraint");
        }
        let slot = state
            .accounts
            .get_mut(&account.id)
            .filter(|a| a.tenant_id == account.tenant_id)
            .with_context(|| format!("account {} not found", account.id))?;
        *slot = account.clone();
        Ok(())
    }

    async fn list_accounts(&self, tenant_id: Uuid) -> anyhow::Result<Vec<InternalAccount>> {
        let state = self.state.read().await;
        let mut out = state
            .accounts
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|a| a.created_at);
        Ok(out)
    }

    async fn list_connection_accounts(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> anyhow::Result<Vec<InternalAccount>> {
        Ok(self
            .list_accounts(tenant_id)
            .await?
            .into_iter()
            .filter(|a| a.connection_id == Some(connection_id))
            .collect())
    }

    async fn upsert_transaction(&self, tx: &LedgerTransaction) -> anyhow::Result<UpsertOutcome> {
        let mut state = self.state.write().await;
        let key = (tx.tenant_id, tx.connection_id, tx.external_id.clone());
        match state.transactions.get_mut(&key) {
            Some(existing) if existing.same_content(tx) => Ok(UpsertOutcome::Unchanged),
            Some(existing) => {
                let id = existing.id;
                let created_at = existing.created_at;
                *existing = LedgerTransaction {
                    id,
                    created_at,
                    ..tx.clone()
                };
                Ok(UpsertOutcome::Updated)
            }
            None => {
                state.transactions.insert(key, tx.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        account_id: Option<Uuid>,
    ) -> anyhow::Result<Vec<LedgerTransaction>> {
        let state = self.state.read().await;
        let mut out = state
            .transactions
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .filter(|t| account_id.map(|id| t.account_id == id).unwrap_or(true))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            b.booked_date
                .cmp(&a.booked_date)
                .then_with(|| a.external_id.cmp(&b.external_id))
        });
        Ok(out)
    }

    async fn insert_job(&self, job: &SyncJob) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.jobs.iter().any(|j| j.id == job.id) {
            bail!("sync job {} already recorded", job.id);
        }
        state.jobs.push(job.clone());
        Ok(())
    }

    async fn finalize_job(&self, job: &SyncJob) -> anyhow::Result<()> {
        if !job.status.is_terminal() {
            bail!("sync job {} finalized with non-terminal status {:?}", job.id, job.status);
        }
        let mut state = self.state.write().await;
        let slot = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id && j.tenant_id == job.tenant_id)
            .with_context(|| format!("sync job {} not found", job.id))?;
        if slot.status.is_terminal() {
            bail!("sync job {} is already finalized", job.id);
        }
        *slot = job.clone();
        Ok(())
    }

    async fn list_jobs(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<SyncJob>> {
        let state = self.state.read().await;
        let mut out = state
            .jobs
            .iter()
            .filter(|j| j.tenant_id == tenant_id && j.connection_id == connection_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn job_outcomes_since(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<(DateTime<Utc>, SyncJobStatus)>> {
        let state = self.state.read().await;
        let mut out = state
            .jobs
            .iter()
            .filter(|j| j.tenant_id == tenant_id && j.connection_id == connection_id)
            .filter(|j| j.status.is_terminal())
            .filter_map(|j| j.finished_at.filter(|at| *at >= since).map(|at| (at, j.status)))
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banksync_core::{AccountKind, AccountStatus, Direction, TransactionStatus};
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn account(
        tenant_id: Uuid,
        connection_id: Uuid,
        external_id: &str,
        iban: Option<&str>,
    ) -> InternalAccount {
        InternalAccount {
            id: Uuid::new_v4(),
            tenant_id,
            connection_id: Some(connection_id),
            provider: Some("tink".into()),
            external_id: Some(external_id.into()),
            iban: iban.map(ToString::to_string),
            bic: None,
            bank_name: None,
            account_number: None,
            display_name: "Main".into(),
            holder_name: None,
            kind: AccountKind::Checking,
            currency: "EUR".into(),
            balance: None,
            status: AccountStatus::Active,
            last_synced_at: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn tx(
        tenant_id: Uuid,
        account_id: Uuid,
        connection_id: Uuid,
        status: TransactionStatus,
    ) -> LedgerTransaction {
        LedgerTransaction {
            id: Uuid::new_v4(),
            tenant_id,
            account_id,
            connection_id,
            provider: "tink".into(),
            external_id: "tx-1".into(),
            amount: Decimal::new(1250, 2),
            currency: "EUR".into(),
            direction: Direction::Debit,
            booked_date: NaiveDate::from_ymd_opt(2026, 2, 27).unwrap(),
            value_date: None,
            description: Some("Coffee".into()),
            counterparty: None,
            category: None,
            status,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[tokio::test]
    async fn duplicate_iban_within_tenant_is_rejected() {
        let store = MemoryLedgerStore::new();
        let tenant = Uuid::new_v4();
        store
            .insert_account(&account(tenant, Uuid::new_v4(), "a", Some("DE001")))
            .await
            .expect("first insert");
        assert!(store
            .insert_account(&account(tenant, Uuid::new_v4(), "b", Some("DE001")))
            .await
            .is_err());
        store
            .insert_account(&account(Uuid::new_v4(), Uuid::new_v4(), "a", Some("DE001")))
            .await
            .expect("other tenant may reuse the iban");
    }

    #[tokio::test]
    async fn upsert_keeps_id_and_reports_outcome() {
        let store = MemoryLedgerStore::new();
        let (tenant, account_id, connection_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let pending = tx(tenant, account_id, connection_id, TransactionStatus::Pending);
        let booked = tx(tenant, account_id, connection_id, TransactionStatus::Booked);

        assert_eq!(store.upsert_transaction(&pending).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_transaction(&pending).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.upsert_transaction(&booked).await.unwrap(), UpsertOutcome::Updated);

        let rows = store.list_transactions(tenant, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, pending.id);
        assert_eq!(rows[0].status, TransactionStatus::Booked);
        assert!(store.list_transactions(Uuid::new_v4(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jobs_are_finalized_once() {
        let store = MemoryLedgerStore::new();
        let mut job = SyncJob::start(Uuid::new_v4(), Uuid::new_v4(), now());
        store.insert_job(&job).await.unwrap();
        job.finish(SyncJobStatus::Completed, now());
        store.finalize_job(&job).await.unwrap();
        assert!(store.finalize_job(&job).await.is_err());

        let outcomes = store
            .job_outcomes_since(job.tenant_id, job.connection_id, now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(outcomes, vec![(now(), SyncJobStatus::Completed)]);
    }

    #[tokio::test]
    async fn due_connections_are_claimed_once() {
        let store = MemoryLedgerStore::new();
        let mut due = Connection::new(Uuid::new_v4(), "tink", now());
        due.status = banksync_core::ConnectionStatus::Active;
        due.next_sync_at = Some(now() - chrono::Duration::minutes(1));
        store.insert_connection(&due).await.unwrap();
        let lease = now() + chrono::Duration::hours(1);

        let claimed = store.claim_due_connections(now(), lease, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].next_sync_at, Some(lease));
        assert!(store
            .claim_due_connections(now(), lease, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
