//! Tink Data API v2.
//!
//! Amounts arrive as `{unscaledValue, scale}` pairs and are signed; transactions are paged with
//! `nextPageToken`. A multi-page fetch is captured as `{"pages": [...]}` so no page is reshaped.

use std::sync::Arc;

use async_trait::async_trait;
use banksync_core::{
    AccountStatus, Credentials, NormalizedAccount, NormalizedTransaction, ProviderError,
    RawFetch, ResponseMeta, SyncWindow, TransactionStatus,
};
use banksync_storage::{HttpFetcher, ProviderRequest};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::normalize::{
    account_kind, currency_code, decimal_from_scaled, json_at, json_date, json_id, json_str,
    json_text, split_amount, Normalized,
};
use crate::{validate_base_url, AdapterContext, NormalizeError, ProviderAdapter, ProviderConfig};

const MAX_PAGES: usize = 50;
const PAGE_SIZE: u32 = 100;

pub struct TinkAdapter {
    config: ProviderConfig,
    http: Arc<HttpFetcher>,
}

impl TinkAdapter {
    pub fn new(config: ProviderConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn client_secret(&self) -> Option<String> {
        self.config
            .client_secret_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
    }
}

fn meta_from(fetched: &banksync_storage::FetchedJson) -> ResponseMeta {
    ResponseMeta {
        status_code: fetched.status.as_u16(),
        duration_ms: fetched.duration.as_millis() as u64,
        request_path: fetched.request_path.clone(),
    }
}

fn next_page_token(body: &JsonValue) -> Option<String> {
    json_text(body, &["nextPageToken"])
}

#[async_trait]
impl ProviderAdapter for TinkAdapter {
    fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        validate_base_url(&self.config.base_url)?;
        if self.config.client_secret_env.is_some() && self.config.client_id.is_none() {
            return Err(ProviderError::InvalidConfig(
                "client_secret_env is set without client_id".to_string(),
            ));
        }
        Ok(())
    }

    async fn fetch_raw_accounts(
        &self,
        _ctx: &AdapterContext,
        credentials: &Credentials,
    ) -> Result<RawFetch, ProviderError> {
        let request = ProviderRequest::get(self.url("data/v2/accounts"))
            .bearer(credentials.access_token.as_str());
        let fetched = self.http.send_json(&self.config.provider_id, request).await?;
        if next_page_token(&fetched.body).is_some() {
            warn!(
                provider = %self.config.provider_id,
                "account listing is paged; only the first page is used"
            );
        }
        Ok(RawFetch {
            response: meta_from(&fetched),
            payload: fetched.body,
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
        let page_size = window.max_count.map_or(PAGE_SIZE, |max| max.clamp(1, PAGE_SIZE));
        let mut pages = Vec::new();
        let mut meta: Option<ResponseMeta> = None;
        let mut token: Option<String> = None;
        let mut fetched_count = 0usize;

        for _ in 0..MAX_PAGES {
            let mut request = ProviderRequest::get(self.url("data/v2/transactions"))
                .bearer(credentials.access_token.as_str())
                .query("accountIdIn", account_external_id)
                .query("bookedDateGte", window.start_date().format("%Y-%m-%d").to_string())
                .query("bookedDateLte", window.end_date().format("%Y-%m-%d").to_string())
                .query("pageSize", page_size.to_string());
            if let Some(token) = &token {
                request = request.query("pageToken", token.clone());
            }

            let fetched = self.http.send_json(&self.config.provider_id, request).await?;
            match meta.as_mut() {
                Some(meta) => meta.duration_ms += fetched.duration.as_millis() as u64,
                None => meta = Some(meta_from(&fetched)),
            }
            fetched_count += fetched
                .body
                .get("transactions")
                .and_then(JsonValue::as_array)
                .map_or(0, Vec::len);
            token = next_page_token(&fetched.body);
            pages.push(fetched.body);

            let reached_max = window.max_count.is_some_and(|max| fetched_count >= max as usize);
            if token.is_none() || reached_max {
                break;
            }
        }

        let payload = if pages.len() == 1 {
            pages.pop().unwrap_or(JsonValue::Null)
        } else {
            json!({ "pages": pages })
        };
        Ok(RawFetch {
            payload,
            response: meta.unwrap_or(ResponseMeta {
                status_code: 200,
                duration_ms: 0,
                request_path: "/data/v2/transactions".to_string(),
            }),
            fetched_at: Utc::now(),
        })
    }

    async fn refresh_credentials(&self, refresh_token: &str) -> Result<Credentials, ProviderError> {
        let secret = self.client_secret();
        let mut fields = vec![("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
        if let Some(client_id) = self.config.client_id.as_deref() {
            fields.push(("client_id", client_id));
        }
        if let Some(secret) = secret.as_deref() {
            fields.push(("client_secret", secret));
        }

        let request = ProviderRequest::post_form(self.url("api/v1/oauth/token"), &fields);
        let fetched = self.http.send_json(&self.config.provider_id, request).await?;
        let access = json_text(&fetched.body, &["access_token"])
            .ok_or_else(|| {
                ProviderError::Auth("token refresh returned no access token".to_string())
            })?;
        let expires_at = fetched
            .body
            .get("expires_in")
            .and_then(JsonValue::as_i64)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Ok(Credentials {
            access_token: access,
            refresh_token: json_text(&fetched.body, &["refresh_token"])
                .or_else(|| Some(refresh_token.to_string())),
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

fn scaled_amount(value: &JsonValue, path: &[&str]) -> Option<rust_decimal::Decimal> {
    let amount = json_at(value, path)?;
    decimal_from_scaled(amount.get("unscaledValue")?, amount.get("scale")?)
}

pub fn normalize_accounts(
    raw: &JsonValue,
) -> Result<Normalized<NormalizedAccount>, NormalizeError> {
    let entries = raw
        .get("accounts")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| NormalizeError::Payload("accounts", "missing accounts array".to_string()))?;

    let mut out = Normalized::default();
    for (index, entry) in entries.iter().enumerate() {
        out.push_result("account", index, normalize_account(entry));
    }
    Ok(out)
}

fn normalize_account(entry: &JsonValue) -> Result<NormalizedAccount, String> {
    let external_id = json_id(entry, &["id"]).ok_or("missing account id")?;
    let balance_amount = json_at(entry, &["balances", "booked", "amount"])
        .or_else(|| json_at(entry, &["balances", "available", "amount"]));
    let currency = balance_amount
        .and_then(|amount| json_str(amount, &["currencyCode"]))
        .and_then(currency_code)
        .ok_or("missing or invalid currency")?;
    let balance = balance_amount.and_then(|amount| scaled_amount(amount, &["value"]));

    let closed = entry
        .get("flags")
        .and_then(JsonValue::as_array)
        .is_some_and(|flags| flags.iter().any(|f| f.as_str() == Some("CLOSED")));

    Ok(NormalizedAccount {
        display_name: json_text(entry, &["name"]).unwrap_or_else(|| external_id.clone()),
        kind: account_kind(json_str(entry, &["type"])),
        currency,
        balance,
        iban: json_text(entry, &["identifiers", "iban", "iban"]),
        bic: json_text(entry, &["identifiers", "iban", "bic"]),
        bank_name: json_text(entry, &["financialInstitutionId"]),
        account_number: json_text(entry, &["identifiers", "iban", "bban"])
            .or_else(|| {
                json_text(
                    entry,
                    &["identifiers", "financialInstitution", "accountNumber"],
                )
            }),
        holder_name: json_text(entry, &["holderName"]),
        status: if closed {
            AccountStatus::Closed
        } else {
            AccountStatus::Active
        },
        external_id,
    })
}

/// Accepts a single transactions page or a `{"pages": [...]}` envelope.
pub fn normalize_transactions(
    account_external_id: &str,
    raw: &JsonValue,
) -> Result<Normalized<NormalizedTransaction>, NormalizeError> {
    let pages: Vec<&JsonValue> = match raw.get("pages").and_then(JsonValue::as_array) {
        Some(pages) => pages.iter().collect(),
        None => vec![raw],
    };

    let mut out = Normalized::default();
    let mut index = 0usize;
    for page in pages {
        let entries = page.get("transactions").and_then(JsonValue::as_array).ok_or_else(|| {
            NormalizeError::Payload("transactions", "missing transactions array".to_string())
        })?;
        for entry in entries {
            out.push_result(
                "transaction",
                index,
                normalize_transaction(account_external_id, entry),
            );
            index += 1;
        }
    }
    Ok(out)
}

fn normalize_transaction(
    account_external_id: &str,
    entry: &JsonValue,
) -> Result<NormalizedTransaction, String> {
    let external_id = json_id(entry, &["id"]).ok_or("missing transaction id")?;
    if let Some(owner) = json_str(entry, &["accountId"]) {
        if owner != account_external_id {
            return Err(format!("belongs to account {owner}"));
        }
    }

    let raw_amount = scaled_amount(entry, &["amount", "value"]).ok_or("missing or invalid amount")?;
    let currency = json_str(entry, &["amount", "currencyCode"])
        .and_then(currency_code)
        .ok_or("missing or invalid currency")?;
    let (amount, direction) = split_amount(raw_amount, None)?;

    let value_date = json_date(entry, &["dates", "value"]);
    let booked_date = json_date(entry, &["dates", "booked"])
        .or(value_date)
        .ok_or("missing booked and value date")?;

    let status = match json_str(entry, &["status"]) {
        Some("PENDING") => TransactionStatus::Pending,
        Some("BOOKED") | None => TransactionStatus::Booked,
        Some(other) => return Err(format!("unknown status {other:?}")),
    };

    let counterparty = json_text(entry, &["merchantInformation", "merchantName"])
        .or_else(|| match direction {
            banksync_core::Direction::Debit => {
                json_text(entry, &["counterparties", "payee", "name"])
            }
            banksync_core::Direction::Credit => {
                json_text(entry, &["counterparties", "payer", "name"])
            }
        });

    Ok(NormalizedTransaction {
        external_id,
        account_external_id: account_external_id.to_string(),
        amount,
        currency,
        direction,
        booked_date,
        value_date,
        description: json_text(entry, &["descriptions", "display"])
            .or_else(|| json_text(entry, &["descriptions", "original"])),
        counterparty,
        category: json_text(entry, &["categories", "pfm", "name"]),
        status,
    })
}
