//! Integration tests for the API server.

use std::sync::Arc;
use std::sync::OnceLock;

use api::config::Config;
use api::{AppState, Application, Stores};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::SagaId;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemoryInventoryService, InMemoryOrderService, InMemoryPaymentService, SaleServices};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: axum::Router,
    state: Arc<AppState>,
    inventory: InMemoryInventoryService,
    payment: InMemoryPaymentService,
}

fn setup() -> TestApp {
    let inventory = InMemoryInventoryService::new();
    inventory.set_stock("P1", 10);
    let payment = InMemoryPaymentService::new();
    let services = SaleServices::in_memory(
        inventory.clone(),
        payment.clone(),
        InMemoryOrderService::new(),
    );
    let config = Config {
        retry_base_delay_ms: 1,
        ..Config::default()
    };
    let application = Application::new(Stores::in_memory(), services, &config);
    application.subscribe().unwrap();
    let state = application.state.clone();
    let app = api::create_app(application.state, get_metrics_handle());
    TestApp {
        app,
        state,
        inventory,
        payment,
    }
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn sale_body(quantity: u32) -> serde_json::Value {
    serde_json::json!({
        "customerId": "C1",
        "productId": "P1",
        "quantity": quantity,
        "amount": 50.00
    })
}

#[tokio::test]
async fn test_health_check() {
    let t = setup();
    let (status, json) = send(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["deadLetters"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = setup();
    send(&t.app, post_json("/saga/sales", sale_body(1))).await;

    let response = t.app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("saga_executions_total"));
}

#[tokio::test]
async fn test_create_sale_confirms() {
    let t = setup();
    let (status, json) = send(&t.app, post_json("/saga/sales", sale_body(2))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["state"], "CONFIRMED");

    let saga_id = json["sagaId"].as_str().unwrap().to_string();
    let (status, sale) = send(&t.app, get(&format!("/saga/sales/{saga_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sale["state"], "CONFIRMED");
    assert_eq!(sale["quantity"], 2);
    assert_eq!(sale["amount"], 50.0);
    assert_eq!(sale["reservationId"], "R1");
    assert_eq!(sale["paymentTransactionId"], "T1");
    assert_eq!(sale["orderId"], "O1");
    assert_eq!(t.inventory.stock_level("P1"), 8);
}

#[tokio::test]
async fn test_rejected_sale_is_bad_request() {
    let t = setup();
    let (status, json) = send(&t.app, post_json("/saga/sales", sale_body(11))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["state"], "FAILED");
    assert!(json["errorMessage"].as_str().is_some());
    assert_eq!(t.payment.process_calls(), 0);
}

#[tokio::test]
async fn test_invalid_sale_requests() {
    let t = setup();

    let (status, json) = send(&t.app, post_json("/saga/sales", sale_body(0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().is_some());

    let mut negative = sale_body(1);
    negative["amount"] = serde_json::json!(-5.0);
    let (status, _) = send(&t.app, post_json("/saga/sales", negative)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut blank = sale_body(1);
    blank["customerId"] = serde_json::json!("  ");
    let (status, _) = send(&t.app, post_json("/saga/sales", blank)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_sale_not_found_and_malformed() {
    let t = setup();

    let (status, json) = send(&t.app, get(&format!("/saga/sales/{}", SagaId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().is_some());

    let (status, _) = send(&t.app, get("/saga/sales/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_choreographed_sale_is_tracked() {
    let t = setup();
    let (status, json) = send(
        &t.app,
        post_json("/saga/choreography/sales", sale_body(2)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let correlation_id = json["correlationId"].as_str().unwrap().to_string();
    assert_eq!(json["sagaId"].as_str(), Some(correlation_id.as_str()));

    t.state.bus.drain().await;

    let (status, tracked) = send(
        &t.app,
        get(&format!("/saga/choreography/{correlation_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tracked["status"], "COMPLETED");
    assert_eq!(
        tracked["completedSteps"],
        serde_json::json!(["PaymentProcessed", "InventoryReserved", "OrderFulfilled"])
    );

    let (status, stats) = send(&t.app, get("/saga/choreography/statistics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["byStatus"]["COMPLETED"], 1);

    let (status, _) = send(&t.app, get("/saga/choreography/unknown-correlation")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_audit_endpoints() {
    let t = setup();
    let (_, json) = send(&t.app, post_json("/saga/sales", sale_body(2))).await;
    let saga_id = json["sagaId"].as_str().unwrap().to_string();
    t.state.bus.drain().await;

    let (status, trail) = send(&t.app, get(&format!("/audit/trail/{saga_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let events = trail["events"].as_array().unwrap();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0]["eventType"], "SaleStockVerified");
    assert_eq!(events[3]["eventType"], "SaleConfirmed");

    let event_id = events[0]["eventId"].as_str().unwrap().to_string();
    let (status, event) = send(&t.app, get(&format!("/audit/event/{event_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["correlationId"], saga_id.as_str());

    let (status, history) = send(&t.app, get(&format!("/audit/aggregate/{saga_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 4);

    let (status, recent) = send(&t.app, get("/audit/recent?page=0&size=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(recent["total"], 4);
    assert_eq!(recent["items"].as_array().unwrap().len(), 2);

    let (status, stats) = send(&t.app, get("/audit/statistics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 4);

    let (status, found) = send(
        &t.app,
        get("/audit/search?eventType=SaleConfirmed&size=10"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["total"], 1);

    let (status, _) = send(&t.app, get("/audit/search?level=LOUD")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, critical) = send(&t.app, get("/audit/critical")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(critical.as_array().unwrap().is_empty());

    let (status, _) = send(&t.app, get("/audit/compliance")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&t.app, get("/audit/event/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
