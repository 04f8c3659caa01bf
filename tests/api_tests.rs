use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use tally::{
    api::{build_router, AppState},
    backends::Backends,
    orchestrator::{AccountProcessor, TaskHandler, TransactionProcessor},
};
use tally_core::{BalanceStore, NewAccount, TaskQueue, ACCOUNT_CREATION_QUEUE, TRANSACTION_QUEUE};

fn app() -> (Router, Backends) {
    let backends = Backends::in_memory();
    (build_router(AppState::new(&backends, None)), backends)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn drain(backends: &Backends, queue: &str, handler: &dyn TaskHandler) {
    while let Some(delivery) = backends.queue.receive(queue, Duration::ZERO).unwrap() {
        handler.handle(&delivery.body);
        backends.queue.ack(&delivery).unwrap();
    }
}

#[tokio::test]
async fn test_account_lifecycle() {
    let (app, backends) = app();

    let (status, body) = send(&app, post_json("/accounts", json!({ "name": "Alice", "initial_amount": "100.00" }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    let account_id = body["account_id"].as_str().unwrap().to_string();

    // Not visible until a worker processes the task.
    let (status, _) = send(&app, get(&format!("/accounts/{}", account_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    drain(&backends, ACCOUNT_CREATION_QUEUE, &AccountProcessor::new(backends.balances.clone()));

    let (status, body) = send(&app, get(&format!("/accounts/{}", account_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Alice");
    assert_eq!(body["balance"], "100.00");
}

#[tokio::test]
async fn test_transaction_flow() {
    let (app, backends) = app();
    backends
        .balances
        .create(NewAccount {
            id: "acc-1".into(),
            name: "A".into(),
            opening_balance: dec!(100.00),
        })
        .unwrap();

    let (status, body) = send(
        &app,
        post_json("/transactions", json!({ "account_id": "acc-1", "amount": 50, "type": "credit" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let reference_id = body["reference_id"].as_str().unwrap().to_string();

    let processor = TransactionProcessor::new(backends.balances.clone(), backends.ledger.clone());
    drain(&backends, TRANSACTION_QUEUE, &processor);

    let (status, body) = send(&app, get("/accounts/acc-1/transactions")).await;
    assert_eq!(status, StatusCode::OK);
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["reference_id"], reference_id.as_str());
    assert_eq!(records[0]["type"], "credit");
    assert_eq!(records[0]["previous_balance"], "100.00");
    assert_eq!(records[0]["new_balance"], "150.00");

    let (_, body) = send(&app, get("/accounts/acc-1")).await;
    assert_eq!(body["balance"], "150.00");
}

#[tokio::test]
async fn test_validation_errors() {
    let (app, backends) = app();

    let (status, body) = send(
        &app,
        post_json("/transactions", json!({ "account_id": "a", "amount": "-1", "type": "debit" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("amount"));

    let (status, _) = send(
        &app,
        post_json("/transactions", json!({ "account_id": "a", "amount": "1", "type": "refund" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post_json("/accounts", json!({ "initial_amount": "1" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(backends.queue.depth(TRANSACTION_QUEUE).unwrap().ready, 0);
    assert_eq!(backends.queue.depth(ACCOUNT_CREATION_QUEUE).unwrap().ready, 0);
}

#[tokio::test]
async fn test_unknown_account_history_is_empty() {
    let (app, _) = app();
    let (status, body) = send(&app, get("/accounts/nobody/transactions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_health_reports_queue_depths() {
    let (app, _) = app();
    send(&app, post_json("/accounts", json!({ "name": "B", "initial_amount": 0 }))).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queues"]["account_creation"]["ready"], 1);
    assert_eq!(body["queues"]["transaction.dead_letter"]["ready"], 0);
}

#[tokio::test]
async fn test_metrics_disabled_without_recorder() {
    let (app, _) = app();
    let (status, _) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
