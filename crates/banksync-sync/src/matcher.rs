//! Resolve-or-create of internal accounts.
//!
//! Priority, first hit wins: tenant IBAN, then (connection, external id), then
//! (bank name, account number), then a new account.

use std::collections::BTreeSet;
use std::sync::Arc;

use banksync_core::{normalize_iban, Connection, InternalAccount, NormalizedAccount, SyncError};
use banksync_storage::LedgerStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::locks::KeyedLocks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Iban,
    ExternalId,
    BankNumber,
    Created,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub account: InternalAccount,
    pub is_new: bool,
    pub matched_by: MatchedBy,
}

pub struct AccountMatcher {
    store: Arc<dyn LedgerStore>,
    locks: KeyedLocks,
}

fn lock_keys(
    tenant_id: Uuid,
    connection_id: Uuid,
    account: &NormalizedAccount,
    iban: Option<&str>,
) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    if let Some(iban) = iban {
        keys.insert(format!("{tenant_id}/iban/{iban}"));
    }
    keys.insert(format!("{tenant_id}/ext/{connection_id}/{}", account.external_id));
    if let (Some(bank), Some(number)) = (&account.bank_name, &account.account_number) {
        keys.insert(format!("{tenant_id}/bank/{bank}/{number}"));
    }
    keys
}

fn iban_conflict(stored: &InternalAccount, incoming: Option<&str>) -> Option<String> {
    match (stored.iban.as_deref(), incoming) {
        (Some(stored_iban), Some(incoming)) if stored_iban != incoming => Some(format!(
            "account {} has IBAN {stored_iban} but provider reports {incoming}",
            stored.id
        )),
        _ => None,
    }
}

/// Refresh the mutable fields of a matched account. Identifiers are only ever filled in.
///
/// The connection link is kept by the first connection that reported the account. A match by
/// IBAN from another connection still syncs its transactions during full runs, but
/// transactions-only runs and closing of unreported accounts only see it through its owner.
fn merge_into(
    existing: &mut InternalAccount,
    connection: &Connection,
    incoming: &NormalizedAccount,
    iban: Option<String>,
    now: DateTime<Utc>,
) {
    existing.display_name = incoming.display_name.clone();
    existing.status = incoming.status;
    if incoming.balance.is_some() {
        existing.balance = incoming.balance;
    }
    if incoming.holder_name.is_some() {
        existing.holder_name = incoming.holder_name.clone();
    }
    if existing.iban.is_none() {
        existing.iban = iban;
    }
    if existing.bic.is_none() {
        existing.bic = incoming.bic.clone();
    }
    if existing.bank_name.is_none() {
        existing.bank_name = incoming.bank_name.clone();
    }
    if existing.account_number.is_none() {
        existing.account_number = incoming.account_number.clone();
    }
    if existing.connection_id.is_none() {
        existing.connection_id = Some(connection.id);
        existing.provider = Some(connection.provider.clone());
        existing.external_id = Some(incoming.external_id.clone());
    }
    existing.updated_at = now;
}

impl AccountMatcher {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        connection: &Connection,
        incoming: &NormalizedAccount,
        now: DateTime<Utc>,
    ) -> Result<Resolution, SyncError> {
        let iban = incoming.iban.as_deref().and_then(normalize_iban);
        let _guard = self
            .locks
            .lock_all(lock_keys(tenant_id, connection.id, incoming, iban.as_deref()))
            .await;

        if let Some(iban) = iban.as_deref() {
            if let Some(existing) = self.store.find_account_by_iban(tenant_id, iban).await? {
                let iban = Some(iban.to_string());
                return self
                    .update(existing, connection, incoming, iban, MatchedBy::Iban, now)
                    .await;
            }
        }

        if let Some(existing) = self
            .store
            .find_account_by_external_id(tenant_id, connection.id, &incoming.external_id)
            .await?
        {
            if let Some(conflict) = iban_conflict(&existing, iban.as_deref()) {
                return Err(SyncError::MatchConflict(conflict));
            }
            return self
                .update(existing, connection, incoming, iban, MatchedBy::ExternalId, now)
                .await;
        }

        if let (Some(bank), Some(number)) = (
            incoming.bank_name.as_deref(),
            incoming.account_number.as_deref(),
        ) {
            let mut candidates = self
                .store
                .find_accounts_by_bank_number(tenant_id, bank, number)
                .await?;
            if candidates.len() > 1 {
                return Err(SyncError::MatchConflict(format!(
                    "{} accounts share bank {bank} and number {number}",
                    candidates.len()
                )));
            }
            if let Some(existing) = candidates.pop() {
                if let Some(conflict) = iban_conflict(&existing, iban.as_deref()) {
                    return Err(SyncError::MatchConflict(conflict));
                }
                return self
                    .update(existing, connection, incoming, iban, MatchedBy::BankNumber, now)
                    .await;
            }
        }

        let account = InternalAccount::from_normalized(tenant_id, connection, incoming, now);
        self.store.insert_account(&account).await?;
        debug!(
            account_id = %account.id,
            external_id = %incoming.external_id,
            "created internal account"
        );
        Ok(Resolution {
            account,
            is_new: true,
            matched_by: MatchedBy::Created,
        })
    }

    async fn update(
        &self,
        mut existing: InternalAccount,
        connection: &Connection,
        incoming: &NormalizedAccount,
        iban: Option<String>,
        matched_by: MatchedBy,
        now: DateTime<Utc>,
    ) -> Result<Resolution, SyncError> {
        merge_into(&mut existing, connection, incoming, iban, now);
        self.store.update_account(&existing).await?;
        debug!(account_id = %existing.id, ?matched_by, "matched internal account");
        Ok(Resolution {
            account: existing,
            is_new: false,
            matched_by,
        })
    }
}
