//! JSON API over the sync engine. Every route is scoped by the tenant in its path.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use banksync_core::{Credentials, SyncError};
use banksync_sync::{SyncEngine, SyncOptions};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "banksync-web";

const DEFAULT_JOB_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("invalid request body: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        let err = match self {
            Self::BadRequest(_) => return (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Sync(err) => err,
        };
        match err {
            SyncError::ConnectionNotFound(_) => (StatusCode::NOT_FOUND, "connection_not_found"),
            SyncError::ConnectionNotSyncable { .. } => {
                (StatusCode::CONFLICT, "connection_not_syncable")
            }
            SyncError::UnknownProvider(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unknown_provider"),
            SyncError::MatchConflict(_) => (StatusCode::CONFLICT, "match_conflict"),
            SyncError::MalformedRecord(_) => (StatusCode::BAD_GATEWAY, "malformed_record"),
            SyncError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
            SyncError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string(), "code": code }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(err.to_string()))
}

#[derive(Debug, Deserialize)]
struct CreateConnectionBody {
    provider: String,
    #[serde(default)]
    provider_reference: Option<String>,
    #[serde(default)]
    credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
struct ReauthorizeBody {
    credentials: Credentials,
    #[serde(default)]
    provider_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct JobsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct TransactionsQuery {
    account_id: Option<Uuid>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route(
            "/tenants/{tenant_id}/connections",
            get(list_connections_handler).post(create_connection_handler),
        )
        .route("/tenants/{tenant_id}/connections/{connection_id}", get(get_connection_handler))
        .route("/tenants/{tenant_id}/connections/{connection_id}/sync", post(trigger_sync_handler))
        .route("/tenants/{tenant_id}/connections/{connection_id}/health", get(health_handler))
        .route("/tenants/{tenant_id}/connections/{connection_id}/jobs", get(jobs_handler))
        .route(
            "/tenants/{tenant_id}/connections/{connection_id}/reauthorize",
            post(reauthorize_handler),
        )
        .route("/tenants/{tenant_id}/connections/{connection_id}/enabled", post(enabled_handler))
        .route(
            "/tenants/{tenant_id}/connections/{connection_id}/disconnect",
            post(disconnect_handler),
        )
        .route("/tenants/{tenant_id}/accounts", get(accounts_handler))
        .route("/tenants/{tenant_id}/transactions", get(transactions_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Arc<SyncEngine>, bind: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "serving banksync api");
    axum::serve(listener, app(AppState::new(engine)))
        .await
        .context("serving http")?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "service": CRATE_NAME,
        "providers": state.engine.registry().provider_ids(),
    }))
    .into_response()
}

async fn list_connections_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Response> {
    let connections = state.engine.list_connections(tenant_id).await?;
    Ok(Json(connections).into_response())
}

async fn create_connection_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Response> {
    let body: CreateConnectionBody =
        serde_json::from_slice(&body).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let connection = state
        .engine
        .create_connection(tenant_id, &body.provider, body.provider_reference, body.credentials)
        .await?;
    Ok((StatusCode::CREATED, Json(connection)).into_response())
}

async fn get_connection_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Response> {
    let connection = state.engine.get_connection(tenant_id, connection_id).await?;
    Ok(Json(connection).into_response())
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
    body: Bytes,
) -> ApiResult<Response> {
    let options: SyncOptions = parse_body(&body)?;
    let result = state.engine.trigger_sync(tenant_id, connection_id, options).await?;
    Ok(Json(result).into_response())
}

async fn health_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Response> {
    let report = state.engine.get_connection_health(tenant_id, connection_id).await?;
    Ok(Json(report).into_response())
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Response> {
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, 200);
    let jobs = state.engine.list_jobs(tenant_id, connection_id, limit).await?;
    Ok(Json(jobs).into_response())
}

async fn reauthorize_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
    body: Bytes,
) -> ApiResult<Response> {
    let body: ReauthorizeBody =
        serde_json::from_slice(&body).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let connection = state
        .engine
        .reauthorize_connection(tenant_id, connection_id, body.credentials, body.provider_reference)
        .await?;
    Ok(Json(connection).into_response())
}

async fn enabled_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
    body: Bytes,
) -> ApiResult<Response> {
    let body: EnabledBody =
        serde_json::from_slice(&body).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let connection = state
        .engine
        .set_connection_enabled(tenant_id, connection_id, body.enabled)
        .await?;
    Ok(Json(connection).into_response())
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Response> {
    let connection = state.engine.disconnect(tenant_id, connection_id).await?;
    Ok(Json(connection).into_response())
}

async fn accounts_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Response> {
    let accounts = state.engine.list_accounts(tenant_id).await?;
    Ok(Json(accounts).into_response())
}

async fn transactions_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<TransactionsQuery>,
) -> ApiResult<Response> {
    let transactions = state.engine.list_transactions(tenant_id, query.account_id).await?;
    Ok(Json(transactions).into_response())
}
