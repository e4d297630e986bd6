use std::sync::Arc;

use banksync_core::{
    Connection, InternalAccount, LedgerTransaction, NormalizedTransaction, SyncError, UpsertOutcome,
};
use banksync_storage::LedgerStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl ImportSummary {
    pub fn imported(&self) -> usize {
        self.inserted + self.updated
    }
}

fn validate(tx: &NormalizedTransaction) -> Result<(), String> {
    if tx.external_id.trim().is_empty() {
        return Err("empty external id".to_string());
    }
    if tx.currency.len() != 3 || !tx.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(format!("currency {:?} is not an ISO 4217 code", tx.currency));
    }
    if tx.amount.is_sign_negative() && !tx.amount.is_zero() {
        return Err(format!("negative amount {}", tx.amount));
    }
    Ok(())
}

pub struct TransactionImporter {
    store: Arc<dyn LedgerStore>,
}

impl TransactionImporter {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Upsert a batch keyed by (tenant, connection, external id). Invalid rows are counted
    /// and skipped; a storage failure aborts the batch.
    pub async fn import_batch(
        &self,
        tenant_id: Uuid,
        connection: &Connection,
        account: &InternalAccount,
        transactions: &[NormalizedTransaction],
        now: DateTime<Utc>,
    ) -> Result<ImportSummary, SyncError> {
        let mut summary = ImportSummary::default();

        for tx in transactions {
            if let Err(reason) = validate(tx) {
                warn!(external_id = %tx.external_id, %reason, "rejected transaction");
                summary.failed += 1;
                summary.errors.push(format!("transaction {:?}: {reason}", tx.external_id));
                continue;
            }

            let row = LedgerTransaction {
                id: Uuid::new_v4(),
                tenant_id,
                account_id: account.id,
                connection_id: connection.id,
                provider: connection.provider.clone(),
                external_id: tx.external_id.trim().to_string(),
                amount: tx.amount,
                currency: tx.currency.clone(),
                direction: tx.direction,
                booked_date: tx.booked_date,
                value_date: tx.value_date,
                description: tx.description.clone(),
                counterparty: tx.counterparty.clone(),
                category: tx.category.clone(),
                status: tx.status,
                created_at: now,
                updated_at: now,
            };

            match self.store.upsert_transaction(&row).await? {
                UpsertOutcome::Inserted => summary.inserted += 1,
                UpsertOutcome::Updated => summary.updated += 1,
                UpsertOutcome::Unchanged => summary.unchanged += 1,
            }
        }

        Ok(summary)
    }
}
