use std::sync::Arc;

use banksync_adapters::{
    AdapterContext, GoCardlessAdapter, ProviderAdapter, ProviderConfig, ProviderKind, TinkAdapter,
};
use banksync_core::{Credentials, ProviderError, SyncWindow};
use banksync_storage::{HttpClientConfig, HttpFetcher};
use chrono::{TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(provider_id: &str, kind: ProviderKind, base_url: String) -> ProviderConfig {
    ProviderConfig {
        provider_id: provider_id.to_string(),
        display_name: provider_id.to_string(),
        kind,
        enabled: true,
        base_url,
        max_concurrency: Some(2),
        rate_limit: None,
        client_id: Some("client-1".to_string()),
        client_secret_env: None,
    }
}

fn http() -> Arc<HttpFetcher> {
    Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client"))
}

fn ctx(reference: Option<&str>) -> AdapterContext {
    AdapterContext {
        job_id: Uuid::new_v4(),
        connection_id: Uuid::new_v4(),
        provider_reference: reference.map(ToString::to_string),
    }
}

fn creds() -> Credentials {
    Credentials {
        access_token: "token-abc".to_string(),
        refresh_token: Some("refresh-abc".to_string()),
        expires_at: None,
    }
}

fn window() -> SyncWindow {
    SyncWindow {
        start: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap(),
        end: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        max_count: None,
    }
}

#[tokio::test]
async fn gocardless_account_listing_keeps_every_response_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/requisitions/req-1/"))
        .and(header("authorization", "Bearer token-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "req-1",
            "institution_id": "SANDBOX",
            "accounts": ["acc-1"],
            "vendorExtra": {"nested": [1, 2, 3]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/accounts/acc-1/details/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "account": {
                "iban": "DE89370400440532013000",
                "currency": "EUR",
                "cashAccountType": "CACC"
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/accounts/acc-1/balances/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "balances": [{
                "balanceAmount": {"amount": "12.00", "currency": "EUR"},
                "balanceType": "expected"
            }]
        })))
        .mount(&server)
        .await;

    let adapter = GoCardlessAdapter::new(
        config("gocardless", ProviderKind::Gocardless, server.uri()),
        http(),
    );
    let raw = adapter.fetch_raw_accounts(&ctx(Some("req-1")), &creds()).await.unwrap();

    assert_eq!(raw.response.status_code, 200);
    assert_eq!(raw.response.request_path, "/api/v2/requisitions/req-1/");
    assert_eq!(raw.payload["requisition"]["vendorExtra"]["nested"], json!([1, 2, 3]));

    let normalized = adapter.normalize_accounts(&raw.payload).unwrap();
    assert_eq!(normalized.records.len(), 1);
    assert_eq!(normalized.records[0].bank_name.as_deref(), Some("SANDBOX"));
}

#[tokio::test]
async fn gocardless_without_requisition_is_a_config_error() {
    let adapter = GoCardlessAdapter::new(
        config("gocardless", ProviderKind::Gocardless, "http://127.0.0.1:9".to_string()),
        http(),
    );
    let err = adapter.fetch_raw_accounts(&ctx(None), &creds()).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidConfig(_)));
}

#[tokio::test]
async fn http_statuses_map_onto_provider_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/accounts/expired/transactions/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/accounts/busy/transactions/"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/accounts/down/transactions/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let adapter = GoCardlessAdapter::new(
        config("gocardless", ProviderKind::Gocardless, server.uri()),
        http(),
    );
    let ctx = ctx(Some("req-1"));

    let auth = adapter
        .fetch_raw_transactions(&ctx, &creds(), "expired", &window())
        .await
        .unwrap_err();
    assert!(matches!(auth, ProviderError::Auth(_)));

    let limited = adapter
        .fetch_raw_transactions(&ctx, &creds(), "busy", &window())
        .await
        .unwrap_err();
    assert!(matches!(
        limited,
        ProviderError::RateLimited {
            retry_after_secs: Some(30),
            ..
        }
    ));

    let down = adapter
        .fetch_raw_transactions(&ctx, &creds(), "down", &window())
        .await
        .unwrap_err();
    assert!(matches!(down, ProviderError::Unavailable(_)));
    assert!(down.is_transient());
}

#[tokio::test]
async fn gocardless_transactions_use_window_dates() {
    let server = MockServer::start().await;
    let entry = |id: &str, date: &str| {
        json!({
            "transactionId": id,
            "bookingDate": date,
            "transactionAmount": {"amount": "-4.20", "currency": "EUR"}
        })
    };
    Mock::given(method("GET"))
        .and(path("/api/v2/accounts/acc-1/transactions/"))
        .and(query_param("date_from", "2026-02-01"))
        .and(query_param("date_to", "2026-03-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "transactions": {
                "booked": [entry("b-1", "2026-02-20"), entry("b-2", "2026-02-21")],
                "pending": [entry("p-1", "2026-02-28")]
            }
        })))
        .mount(&server)
        .await;

    let adapter = GoCardlessAdapter::new(
        config("gocardless", ProviderKind::Gocardless, server.uri()),
        http(),
    );
    let raw = adapter
        .fetch_raw_transactions(&ctx(Some("req-1")), &creds(), "acc-1", &window())
        .await
        .unwrap();
    let normalized = adapter.normalize_transactions("acc-1", &raw.payload).unwrap();
    assert_eq!(normalized.records.len(), 3);
    assert!(normalized.warnings.is_empty());

    let capped = SyncWindow {
        max_count: Some(2),
        ..window()
    };
    let raw = adapter
        .fetch_raw_transactions(&ctx(Some("req-1")), &creds(), "acc-1", &capped)
        .await
        .unwrap();
    assert_eq!(raw.payload["transactions"]["booked"].as_array().unwrap().len(), 2);
    assert!(raw.payload["transactions"]["pending"].as_array().unwrap().is_empty());
    let normalized = adapter.normalize_transactions("acc-1", &raw.payload).unwrap();
    assert_eq!(normalized.records.len(), 2);
}

#[tokio::test]
async fn tink_pages_are_collected_into_an_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data/v2/transactions"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "transactions": [{
                "id": "t-2",
                "accountId": "acc-1",
                "amount": {"value": {"unscaledValue": "500", "scale": "2"}, "currencyCode": "SEK"},
                "dates": {"booked": "2026-02-10"},
                "status": "BOOKED"
            }],
            "nextPageToken": ""
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/v2/transactions"))
        .and(query_param("accountIdIn", "acc-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "transactions": [{
                "id": "t-1",
                "accountId": "acc-1",
                "amount": {
                    "value": {"unscaledValue": "-1200", "scale": "2"},
                    "currencyCode": "SEK"
                },
                "dates": {"booked": "2026-02-09"},
                "status": "BOOKED"
            }],
            "nextPageToken": "page-2"
        })))
        .mount(&server)
        .await;

    let adapter = TinkAdapter::new(config("tink", ProviderKind::Tink, server.uri()), http());
    let raw = adapter
        .fetch_raw_transactions(&ctx(None), &creds(), "acc-1", &window())
        .await
        .unwrap();
    assert_eq!(raw.payload["pages"].as_array().map(Vec::len), Some(2));

    let normalized = adapter.normalize_transactions("acc-1", &raw.payload).unwrap();
    let ids = normalized
        .records
        .iter()
        .map(|t| t.external_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["t-1", "t-2"]);
}

#[tokio::test]
async fn tink_refresh_posts_a_form_and_keeps_old_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("client_id=client-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "expires_in": 3600,
            "token_type": "bearer"
        })))
        .mount(&server)
        .await;

    let adapter = TinkAdapter::new(config("tink", ProviderKind::Tink, server.uri()), http());
    let refreshed = adapter.refresh_credentials("refresh-abc").await.unwrap();
    assert_eq!(refreshed.access_token, "fresh");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-abc"));
    assert!(refreshed.expires_at.is_some());
}

#[tokio::test]
async fn rejected_refresh_token_is_an_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/token/refresh/"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "token invalid"})))
        .mount(&server)
        .await;

    let adapter = GoCardlessAdapter::new(
        config("gocardless", ProviderKind::Gocardless, server.uri()),
        http(),
    );
    let err = adapter.refresh_credentials("stale").await.unwrap_err();
    assert!(matches!(err, ProviderError::Auth(_)));
}
