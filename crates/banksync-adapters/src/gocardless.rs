//! Berlin-Group style aggregator (GoCardless Bank Account Data API v2).
//!
//! Account listing takes several calls (requisition, then details and balances per
//! account); the raw document is an envelope holding every response body verbatim.

use std::sync::Arc;

use async_trait::async_trait;
use banksync_core::{
    AccountStatus, Credentials, NormalizedAccount, NormalizedTransaction, ProviderError,
    RawFetch, ResponseMeta, SyncWindow, TransactionStatus,
};
use banksync_storage::{HttpFetcher, ProviderRequest};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};

use crate::normalize::{
    account_kind, currency_code, decimal_from_json, json_at, json_date, json_id, json_str,
    json_text, split_amount, Normalized,
};
use crate::{validate_base_url, AdapterContext, NormalizeError, ProviderAdapter, ProviderConfig};

/// Balance types in order of preference for the reported account balance.
const BALANCE_PREFERENCE: &[&str] = &[
    "interimBooked",
    "closingBooked",
    "expected",
    "interimAvailable",
    "openingBooked",
];

pub struct GoCardlessAdapter {
    config: ProviderConfig,
    http: Arc<HttpFetcher>,
}

impl GoCardlessAdapter {
    pub fn new(config: ProviderConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get(
        &self,
        path: &str,
        token: &str,
    ) -> Result<(JsonValue, ResponseMeta), ProviderError> {
        let fetched = self
            .http
            .send_json(&self.config.provider_id, ProviderRequest::get(self.url(path)).bearer(token))
            .await?;
        Ok((
            fetched.body,
            ResponseMeta {
                status_code: fetched.status.as_u16(),
                duration_ms: fetched.duration.as_millis() as u64,
                request_path: fetched.request_path,
            },
        ))
    }
}

#[async_trait]
impl ProviderAdapter for GoCardlessAdapter {
    fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        validate_base_url(&self.config.base_url)
    }

    async fn fetch_raw_accounts(
        &self,
        ctx: &AdapterContext,
        credentials: &Credentials,
    ) -> Result<RawFetch, ProviderError> {
        let requisition_id = ctx.provider_reference.as_deref().ok_or_else(|| {
            ProviderError::InvalidConfig("connection has no requisition id".to_string())
        })?;
        let token = credentials.access_token.as_str();

        let (requisition, mut meta) = self
            .get(&format!("requisitions/{requisition_id}/"), token)
            .await?;
        let account_ids = requisition
            .get("accounts")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();

        let mut accounts = Vec::with_capacity(account_ids.len());
        for account_id in account_ids.iter().filter_map(JsonValue::as_str) {
            let (details, details_meta) =
                self.get(&format!("accounts/{account_id}/details/"), token).await?;
            let (balances, balances_meta) =
                self.get(&format!("accounts/{account_id}/balances/"), token).await?;
            meta.duration_ms += details_meta.duration_ms + balances_meta.duration_ms;
            accounts.push(json!({
                "id": account_id,
                "details": details,
                "balances": balances,
            }));
        }

        Ok(RawFetch {
            payload: json!({
                "requisition": requisition,
                "accounts": accounts,
            }),
            response: meta,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_raw_transactions(
        &self,
        _ctx: &AdapterContext,
        credentials: &Credentials,
        account_external_id: &str,
        window: &SyncWindow,
    ) -> Result<RawFetch, ProviderError> {
        let path = format!("accounts/{account_external_id}/transactions/");
        let request = ProviderRequest::get(self.url(&path))
            .bearer(credentials.access_token.as_str())
            .query("date_from", window.start_date().format("%Y-%m-%d").to_string())
            .query("date_to", window.end_date().format("%Y-%m-%d").to_string());
        let fetched = self.http.send_json(&self.config.provider_id, request).await?;
        let mut payload = fetched.body;
        if let Some(max) = window.max_count {
            cap_transactions(&mut payload, max as usize);
        }
        Ok(RawFetch {
            payload,
            response: ResponseMeta {
                status_code: fetched.status.as_u16(),
                duration_ms: fetched.duration.as_millis() as u64,
                request_path: fetched.request_path,
            },
            fetched_at: Utc::now(),
        })
    }

    async fn refresh_credentials(&self, refresh_token: &str) -> Result<Credentials, ProviderError> {
        let request = ProviderRequest::post_json(
            self.url("token/refresh/"),
            json!({ "refresh": refresh_token }),
        );
        let fetched = self.http.send_json(&self.config.provider_id, request).await?;
        let access = json_text(&fetched.body, &["access"])
            .ok_or_else(|| {
                ProviderError::Auth("token refresh returned no access token".to_string())
            })?;
        let expires_at = fetched
            .body
            .get("access_expires")
            .and_then(JsonValue::as_i64)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Ok(Credentials {
            access_token: access,
            refresh_token: Some(refresh_token.to_string()),
            expires_at,
        })
    }

    fn normalize_accounts(
        &self,
        raw: &JsonValue,
    ) -> Result<Normalized<NormalizedAccount>, NormalizeError> {
        normalize_accounts(raw)
    }

    fn normalize_transactions(
        &self,
        account_external_id: &str,
        raw: &JsonValue,
    ) -> Result<Normalized<NormalizedTransaction>, NormalizeError> {
        normalize_transactions(account_external_id, raw)
    }
}

pub fn normalize_accounts(
    raw: &JsonValue,
) -> Result<Normalized<NormalizedAccount>, NormalizeError> {
    let entries = raw
        .get("accounts")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| NormalizeError::Payload("accounts", "missing accounts array".to_string()))?;
    let institution = json_text(raw, &["requisition", "institution_id"]);

    let mut out = Normalized::default();
    for (index, entry) in entries.iter().enumerate() {
        out.push_result("account", index, normalize_account(entry, institution.as_deref()));
    }
    Ok(out)
}

fn normalize_account(
    entry: &JsonValue,
    institution: Option<&str>,
) -> Result<NormalizedAccount, String> {
    let external_id = json_id(entry, &["id"]).ok_or("missing account id")?;
    let details = json_at(entry, &["details", "account"]).unwrap_or(&JsonValue::Null);

    let balance = pick_balance(entry);
    let currency = json_str(details, &["currency"])
        .or_else(|| balance.and_then(|b| json_str(b, &["balanceAmount", "currency"])))
        .and_then(currency_code)
        .ok_or("missing or invalid currency")?;
    let amount = balance
        .and_then(|b| json_at(b, &["balanceAmount", "amount"]))
        .and_then(decimal_from_json);

    let status = match json_str(details, &["status"]).map(str::to_ascii_lowercase).as_deref() {
        Some("deleted") | Some("blocked") | Some("closed") => AccountStatus::Closed,
        _ => AccountStatus::Active,
    };

    let display_name = json_text(details, &["displayName"])
        .or_else(|| json_text(details, &["name"]))
        .or_else(|| json_text(details, &["product"]))
        .unwrap_or_else(|| external_id.clone());

    Ok(NormalizedAccount {
        display_name,
        kind: account_kind(json_str(details, &["cashAccountType"])),
        currency,
        balance: amount,
        iban: json_text(details, &["iban"]),
        bic: json_text(details, &["bic"]),
        bank_name: institution.map(ToString::to_string),
        account_number: json_text(details, &["bban"])
            .or_else(|| json_text(details, &["resourceId"])),
        holder_name: json_text(details, &["ownerName"]),
        status,
        external_id,
    })
}

fn pick_balance(entry: &JsonValue) -> Option<&JsonValue> {
    let balances = json_at(entry, &["balances", "balances"])?.as_array()?;
    BALANCE_PREFERENCE
        .iter()
        .find_map(|wanted| {
            balances
                .iter()
                .find(|b| json_str(b, &["balanceType"]) == Some(*wanted))
        })
        .or_else(|| balances.first())
}

pub fn normalize_transactions(
    account_external_id: &str,
    raw: &JsonValue,
) -> Result<Normalized<NormalizedTransaction>, NormalizeError> {
    let lists = raw
        .get("transactions")
        .filter(|v| v.is_object())
        .ok_or_else(|| {
            NormalizeError::Payload("transactions", "missing transactions object".to_string())
        })?;

    let mut out = Normalized::default();
    for (list, status) in [
        ("booked", TransactionStatus::Booked),
        ("pending", TransactionStatus::Pending),
    ] {
        let Some(entries) = lists.get(list).and_then(JsonValue::as_array) else {
            continue;
        };
        for (index, entry) in entries.iter().enumerate() {
            out.push_result(
                &format!("{list} transaction"),
                index,
                normalize_transaction(account_external_id, entry, status),
            );
        }
    }
    Ok(out)
}

fn normalize_transaction(
    account_external_id: &str,
    entry: &JsonValue,
    status: TransactionStatus,
) -> Result<NormalizedTransaction, String> {
    let external_id = json_id(entry, &["transactionId"])
        .or_else(|| json_id(entry, &["internalTransactionId"]))
        .ok_or("missing transaction id")?;
    let raw_amount = json_at(entry, &["transactionAmount", "amount"])
        .and_then(decimal_from_json)
        .ok_or("missing or invalid amount")?;
    let currency = json_str(entry, &["transactionAmount", "currency"])
        .and_then(currency_code)
        .ok_or("missing or invalid currency")?;
    let (amount, direction) = split_amount(raw_amount, json_str(entry, &["creditDebitIndicator"]))?;

    let value_date = json_date(entry, &["valueDate"]);
    let booked_date = json_date(entry, &["bookingDate"])
        .or(value_date)
        .ok_or("missing booking and value date")?;

    let counterparty = match direction {
        banksync_core::Direction::Debit => json_text(entry, &["creditorName"]),
        banksync_core::Direction::Credit => json_text(entry, &["debtorName"]),
    }
    .or_else(|| json_text(entry, &["creditorName"]))
    .or_else(|| json_text(entry, &["debtorName"]));

    let description = json_text(entry, &["remittanceInformationUnstructured"])
        .or_else(|| {
            json_at(entry, &["remittanceInformationUnstructuredArray"])
                .and_then(JsonValue::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(JsonValue::as_str)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .filter(|s| !s.trim().is_empty())
        })
        .or_else(|| json_text(entry, &["additionalInformation"]));

    Ok(NormalizedTransaction {
        external_id,
        account_external_id: account_external_id.to_string(),
        amount,
        currency,
        direction,
        booked_date,
        value_date,
        description,
        counterparty,
        category: json_text(entry, &["proprietaryBankTransactionCode"])
            .or_else(|| json_text(entry, &["bankTransactionCode"])),
        status,
    })
}

/// The API has no page size; keep at most `max` entries, booked first, then pending.
fn cap_transactions(body: &mut JsonValue, max: usize) {
    let mut left = max;
    for list in ["booked", "pending"] {
        if let Some(entries) = body
            .pointer_mut(&format!("/transactions/{list}"))
            .and_then(JsonValue::as_array_mut)
        {
            entries.truncate(left);
            left -= entries.len();
        }
    }
}
