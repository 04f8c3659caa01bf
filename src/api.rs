use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tally_core::{
    dead_letter_queue, Account, BalanceStore, LedgerStore, StoreError, TaskQueue, TransactionKind,
    TransactionRecord, ACCOUNT_CREATION_QUEUE, TRANSACTION_QUEUE,
};

use crate::{
    backends::Backends,
    intake::{Intake, IntakeError},
};

#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<Intake>,
    pub balances: Arc<dyn BalanceStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(backends: &Backends, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            intake: Arc::new(Intake::new(backends.queue.clone())),
            balances: backends.balances.clone(),
            ledger: backends.ledger.clone(),
            queue: backends.queue.clone(),
            metrics,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub name: String,
    #[serde(default)]
    pub initial_amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TransactionRequest {
    pub account_id: String,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
}

#[derive(Debug, Serialize)]
pub struct AccountAccepted {
    pub account_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TransactionAccepted {
    pub reference_id: String,
    pub status: &'static str,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        if status.is_server_error() {
            tracing::error!(%status, error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        match e {
            IntakeError::Validation(m) => ApiError::BadRequest(m),
            IntakeError::Broker(e) => ApiError::Unavailable(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AccountNotFound(id) => ApiError::NotFound(format!("account not found: {}", id)),
            e if e.is_transient() => ApiError::Unavailable(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

/// Runs blocking store or broker work off the async workers.
async fn blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(Into::into)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/accounts", post(create_account))
        .route("/accounts/:id", get(get_account))
        .route("/accounts/:id/transactions", get(list_transactions))
        .route("/transactions", post(submit_transaction))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn create_account(
    State(state): State<AppState>,
    request: Result<Json<CreateAccountRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AccountAccepted>), ApiError> {
    let Json(request) = request?;
    let intake = state.intake.clone();
    let account_id =
        blocking(move || intake.submit_account_creation(&request.name, request.initial_amount)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AccountAccepted {
            account_id,
            status: "accepted",
        }),
    ))
}

async fn submit_transaction(
    State(state): State<AppState>,
    request: Result<Json<TransactionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TransactionAccepted>), ApiError> {
    let Json(request) = request?;
    let intake = state.intake.clone();
    let reference_id =
        blocking(move || intake.submit_transaction(&request.account_id, request.amount, request.kind)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TransactionAccepted {
            reference_id,
            status: "accepted",
        }),
    ))
}

async fn get_account(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Account>, ApiError> {
    let balances = state.balances.clone();
    let account = blocking(move || balances.get(&id)).await?;
    Ok(Json(account))
}

async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TransactionRecord>>, ApiError> {
    let ledger = state.ledger.clone();
    let records = blocking(move || ledger.list_by_account(&id)).await?;
    Ok(Json(records))
}

async fn health(State(state): State<AppState>) -> Response {
    let queue = state.queue.clone();
    let depths = tokio::task::spawn_blocking(move || {
        let mut depths = serde_json::Map::new();
        for name in [ACCOUNT_CREATION_QUEUE, TRANSACTION_QUEUE] {
            for name in [name.to_string(), dead_letter_queue(name)] {
                let depth = queue.depth(&name)?;
                depths.insert(name, json!({ "ready": depth.ready, "in_flight": depth.in_flight }));
            }
        }
        Ok::<_, tally_core::QueueError>(depths)
    })
    .await;

    match depths {
        Ok(Ok(queues)) => (StatusCode::OK, Json(json!({ "status": "ok", "queues": queues }))).into_response(),
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => ApiError::Internal(e.to_string()).into_response(),
    }
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => ApiError::NotFound("metrics are not enabled".to_string()).into_response(),
    }
}
