//! Core domain model and error taxonomy for the banking sync engine.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "banksync-core";

/// Namespace for deterministic raw record ids.
const RAW_RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_2a4e_95c3_4d7a_8e0f_3c2b_1a9d_7e55);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    PendingSetup,
    Active,
    Error,
    Inactive,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingSetup => "pending_setup",
            Self::Active => "active",
            Self::Error => "error",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_setup" => Some(Self::PendingSetup),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// A tenant's configured link to one external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    /// Provider-side identifier of the authorized relationship (requisition, credentials id).
    pub provider_reference: Option<String>,
    pub status: ConnectionStatus,
    pub credential_ref: Option<Uuid>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub health_score: f64,
    pub sync_summary: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn new(tenant_id: Uuid, provider: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            provider: provider.into(),
            provider_reference: None,
            status: ConnectionStatus::PendingSetup,
            credential_ref: None,
            last_sync_at: None,
            next_sync_at: None,
            consecutive_failures: 0,
            health_score: 1.0,
            sync_summary: None,
            created_at: now,
            updated_at: now,
            disconnected_at: None,
        }
    }

    /// Whether the scheduler may start a job for this connection on its own.
    pub fn is_auto_syncable(&self, now: DateTime<Utc>) -> bool {
        self.status == ConnectionStatus::Active
            && self.next_sync_at.map(|at| at <= now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + skew,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawRecordKind {
    Accounts,
    Transactions,
}

impl RawRecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Transactions => "transactions",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accounts" => Some(Self::Accounts),
            "transactions" => Some(Self::Transactions),
            _ => None,
        }
    }
}

/// Transport metadata captured alongside a raw provider response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status_code: u16,
    pub duration_ms: u64,
    pub request_path: String,
}

/// What an adapter hands back from a fetch: the untouched document plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFetch {
    pub payload: JsonValue,
    pub response: ResponseMeta,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawRecordKey {
    pub connection_id: Uuid,
    pub provider: String,
    pub external_id: String,
}

impl RawRecordKey {
    pub fn new(connection_id: Uuid, provider: &str, external_id: &str) -> Self {
        Self {
            connection_id,
            provider: provider.to_string(),
            external_id: external_id.to_string(),
        }
    }

    /// Stable id for the key, identical across processes and stores.
    pub fn record_id(&self) -> Uuid {
        let source = format!("{}:{}:{}", self.connection_id, self.provider, self.external_id);
        Uuid::new_v5(&RAW_RECORD_NAMESPACE, source.as_bytes())
    }
}

/// Immutable capture of one provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub key: RawRecordKey,
    pub kind: RawRecordKind,
    pub payload: JsonValue,
    pub response: ResponseMeta,
    pub fetched_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn capture(
        tenant_id: Uuid,
        key: RawRecordKey,
        kind: RawRecordKind,
        fetch: &RawFetch,
    ) -> Self {
        Self {
            id: key.record_id(),
            tenant_id,
            key,
            kind,
            payload: fetch.payload.clone(),
            response: fetch.response.clone(),
            fetched_at: fetch.fetched_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Checking,
    Operating,
    Savings,
    CreditCard,
    Loan,
    Other,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Operating => "operating",
            Self::Savings => "savings",
            Self::CreditCard => "credit_card",
            Self::Loan => "loan",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "checking" => Some(Self::Checking),
            "operating" => Some(Self::Operating),
            "savings" => Some(Self::Savings),
            "credit_card" => Some(Self::CreditCard),
            "loan" => Some(Self::Loan),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Canonical account produced by a normalizer; consumed by the matcher, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAccount {
    pub external_id: String,
    pub display_name: String,
    pub kind: AccountKind,
    pub currency: String,
    pub balance: Option<Decimal>,
    pub iban: Option<String>,
    pub bic: Option<String>,
    pub bank_name: Option<String>,
    pub account_number: Option<String>,
    pub holder_name: Option<String>,
    pub status: AccountStatus,
}

/// Tenant-scoped account entity read by the rest of the product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalAccount {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub connection_id: Option<Uuid>,
    pub provider: Option<String>,
    pub external_id: Option<String>,
    pub iban: Option<String>,
    pub bic: Option<String>,
    pub bank_name: Option<String>,
    pub account_number: Option<String>,
    pub display_name: String,
    pub holder_name: Option<String>,
    pub kind: AccountKind,
    pub currency: String,
    pub balance: Option<Decimal>,
    pub status: AccountStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InternalAccount {
    pub fn from_normalized(
        tenant_id: Uuid,
        connection: &Connection,
        account: &NormalizedAccount,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            connection_id: Some(connection.id),
            provider: Some(connection.provider.clone()),
            external_id: Some(account.external_id.clone()),
            iban: account.iban.as_deref().and_then(normalize_iban),
            bic: account.bic.clone(),
            bank_name: account.bank_name.clone(),
            account_number: account.account_number.clone(),
            display_name: account.display_name.clone(),
            holder_name: account.holder_name.clone(),
            kind: account.kind,
            currency: account.currency.clone(),
            balance: account.balance,
            status: account.status,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "credit" | "crdt" | "c" | "cr" => Some(Self::Credit),
            "debit" | "dbit" | "d" | "dr" => Some(Self::Debit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Booked,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Booked => "booked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "booked" => Some(Self::Booked),
            _ => None,
        }
    }
}

/// Transaction as reported by a provider, in canonical shape.
///
/// `amount` is always absolute; `direction` carries the sign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub external_id: String,
    pub account_external_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub direction: Direction,
    pub booked_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub description: Option<String>,
    pub counterparty: Option<String>,
    pub category: Option<String>,
    pub status: TransactionStatus,
}

/// Canonical ledger row, shared by the ledger and its provider link via `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub account_id: Uuid,
    pub connection_id: Uuid,
    pub provider: String,
    pub external_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub direction: Direction,
    pub booked_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub description: Option<String>,
    pub counterparty: Option<String>,
    pub category: Option<String>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerTransaction {
    /// Signed amount for reporting; credits positive, debits negative.
    pub fn signed_amount(&self) -> Decimal {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => -self.amount,
        }
    }

    /// True when the mutable provider-reported fields equal the other row's.
    pub fn same_content(&self, other: &LedgerTransaction) -> bool {
        self.amount == other.amount
            && self.currency == other.currency
            && self.direction == other.direction
            && self.booked_date == other.booked_date
            && self.value_date == other.value_date
            && self.description == other.description
            && self.counterparty == other.counterparty
            && self.category == other.category
            && self.status == other.status
            && self.account_id == other.account_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl SyncJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Partial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountOutcome {
    Synced,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSyncSummary {
    pub external_id: String,
    pub account_id: Option<Uuid>,
    pub outcome: AccountOutcome,
    pub is_new: bool,
    pub window_reason: Option<String>,
    pub transactions_fetched: usize,
    pub transactions_inserted: usize,
    pub transactions_updated: usize,
    pub transactions_failed: usize,
    pub error: Option<String>,
}

impl AccountSyncSummary {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            account_id: None,
            outcome: AccountOutcome::Synced,
            is_new: false,
            window_reason: None,
            transactions_fetched: 0,
            transactions_inserted: 0,
            transactions_updated: 0,
            transactions_failed: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub accounts_fetched: usize,
    pub accounts_processed: usize,
    pub transactions_fetched: usize,
    pub transactions_imported: usize,
    pub failed: usize,
}

/// One orchestrated run for one connection; append-only once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub connection_id: Uuid,
    pub status: SyncJobStatus,
    pub counts: SyncCounts,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub accounts: Vec<AccountSyncSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl SyncJob {
    pub fn start(tenant_id: Uuid, connection_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            connection_id,
            status: SyncJobStatus::Running,
            counts: SyncCounts::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            accounts: Vec::new(),
            started_at: now,
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn finish(&mut self, status: SyncJobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}

/// Date range for a transaction fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max_count: Option<u32>,
}

impl SyncWindow {
    pub fn start_date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end.date_naive()
    }
}

/// Failures an adapter can report. Everything else is the adapter's own bug.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited by provider: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("account match conflict: {0}")]
    MatchConflict(String),
    #[error("connection {0} not found")]
    ConnectionNotFound(Uuid),
    #[error("connection {id} is {status:?} and cannot sync until re-authorized")]
    ConnectionNotSyncable { id: Uuid, status: ConnectionStatus },
    #[error("no adapter registered for provider {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Auth(_)))
    }
}

/// Canonical IBAN form: whitespace removed, upper-cased. Empty input yields `None`.
pub fn normalize_iban(raw: &str) -> Option<String> {
    let compact = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    if compact.is_empty() {
        None
    } else {
        Some(compact)
    }
}
