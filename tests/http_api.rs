use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tower::ServiceExt;
use ulid::Ulid;

use deskhub::engine::{Engine, EngineSettings, now_ms};
use deskhub::http::{self, AppState};
use deskhub::model::{HOUR, MINUTE, Ms};
use deskhub::observability::{self, RecordingSink, WEBHOOK_SIGNATURE_FAILURES_TOTAL};
use deskhub::payment::PaymentProcessor;
use deskhub::payment::gateway::{GatewayCharge, GatewayFault, GatewayRefund, GatewayReply, PaymentGateway};
use deskhub::payment::retry::RetryPolicy;
use deskhub::sealed::FieldCipher;
use deskhub::signature;

const IOT_SECRET: &str = "iot-test-secret";

// ── Test infrastructure ──────────────────────────────────────

/// Answers every call from a queue; an empty queue approves.
#[derive(Default)]
struct QueueGateway {
    captures: Mutex<VecDeque<Result<GatewayReply, GatewayFault>>>,
    capture_calls: AtomicUsize,
    refund_calls: AtomicUsize,
}

fn approved(tx: &str) -> GatewayReply {
    GatewayReply {
        transaction_id: Some(tx.to_string()),
        status: Some("captured".into()),
        message: None,
        raw: format!(r#"{{"success":true,"transaction_id":"{tx}"}}"#),
    }
}

#[async_trait]
impl PaymentGateway for QueueGateway {
    fn name(&self) -> &str {
        "queue"
    }

    async fn capture(&self, charge: &GatewayCharge) -> Result<GatewayReply, GatewayFault> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.captures.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(approved(&format!("tx-{}", charge.reference))))
    }

    async fn refund(&self, refund: &GatewayRefund) -> Result<GatewayReply, GatewayFault> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        Ok(approved(&format!("rf-{}", refund.transaction_id)))
    }

    async fn query_status(&self, transaction_id: &str) -> Result<GatewayReply, GatewayFault> {
        Ok(approved(transaction_id))
    }
}

struct TestApp {
    router: Router,
    engine: Arc<Engine>,
    gateway: Arc<QueueGateway>,
    metrics: Arc<RecordingSink>,
    admin: Ulid,
}

fn start_test_app(gateway: QueueGateway) -> TestApp {
    let dir = std::env::temp_dir().join(format!("deskhub_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let metrics = Arc::new(RecordingSink::default());
    let engine = Arc::new(
        Engine::new(dir.join("deskhub.wal"), EngineSettings::default(), metrics.clone()).unwrap(),
    );
    let gateway = Arc::new(gateway);
    let payments = Arc::new(PaymentProcessor::new(
        engine.clone(),
        gateway.clone(),
        RetryPolicy::immediate(3),
        Arc::new(FieldCipher::ephemeral()),
    ));
    let router = http::router(AppState {
        engine: engine.clone(),
        payments,
        iot_secret: Some(Arc::from(IOT_SECRET)),
        payment_webhook_secret: None,
        metrics: metrics.clone(),
    });
    TestApp {
        router,
        engine,
        gateway,
        metrics,
        admin: Ulid::new(),
    }
}

fn rfc3339(t: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(t).unwrap().to_rfc3339()
}

/// Whole minute `hours` from now.
fn ahead(hours: Ms) -> Ms {
    (now_ms() / MINUTE + 1) * MINUTE + hours * HOUR
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let res = self.router.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn call(&self, method: Method, uri: &str, user: Ulid, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", user.to_string());
        if user == self.admin {
            req = req.header("x-user-role", "admin");
        }
        let req = match body {
            Some(b) => req
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        self.send(req).await
    }

    async fn pay(&self, user: Ulid, booking: &str, key: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/payments")
            .header("x-user-id", user.to_string())
            .header("idempotency-key", key)
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "booking_id": booking, "payment_method": "card", "card_last4": "4242" }).to_string(),
            ))
            .unwrap();
        self.send(req).await
    }

    async fn iot(&self, body: &Value, signature: Option<String>) -> (StatusCode, Value) {
        let raw = body.to_string();
        let mut req = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/iot")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            req = req.header("x-iot-signature", sig);
        }
        self.send(req.body(Body::from(raw)).unwrap()).await
    }

    async fn space(&self, venue: Ulid, hourly: &str) -> Ulid {
        let id = Ulid::new();
        let (status, _) = self
            .call(
                Method::PUT,
                &format!("/spaces/{id}"),
                self.admin,
                Some(json!({ "venue_id": venue, "hourly_rate": hourly })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        id
    }

    async fn book(&self, user: Ulid, venue: Ulid, space: Ulid, start: Ms, end: Ms) -> (StatusCode, Value) {
        self.call(
            Method::POST,
            "/bookings",
            user,
            Some(json!({
                "venue_id": venue,
                "space_id": space,
                "start_time": rfc3339(start),
                "end_time": rfc3339(end),
            })),
        )
        .await
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn full_booking_flow() {
    let app = start_test_app(QueueGateway::default());
    let venue = Ulid::new();
    let space = app.space(venue, "20.00").await;
    let user = Ulid::new();
    let start = ahead(48);

    let (status, booking) = app.book(user, venue, space, start, start + 2 * HOUR).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(booking["total_price"], "40.00");
    assert_eq!(booking["status"], "Pending");
    let booking_id = booking["id"].as_str().unwrap().to_string();

    // Someone else wants an overlapping slot.
    let (status, body) = app
        .book(Ulid::new(), venue, space, start + HOUR, start + 3 * HOUR)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "BOOKING_CONFLICT");
    assert_eq!(body["conflicting_booking_id"], booking_id.as_str());

    let (status, body) = app
        .call(Method::POST, &format!("/bookings/{booking_id}/confirm"), user, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "PAYMENT_REQUIRED");

    let (status, payment) = app.pay(user, &booking_id, "order-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payment["success"], true);
    assert_eq!(payment["status"], "Paid");
    assert_eq!(payment["amount"], "40.00");
    let payment_id = payment["payment_id"].as_str().unwrap().to_string();

    // Same key: the recorded outcome comes back, the gateway is not called again.
    let (status, again) = app.pay(user, &booking_id, "order-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["payment_id"], payment_id.as_str());
    assert_eq!(app.gateway.capture_calls.load(Ordering::SeqCst), 1);

    let (status, confirmed) = app
        .call(Method::POST, &format!("/bookings/{booking_id}/confirm"), user, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "Confirmed");
    assert_eq!(confirmed["payment_status"], "Paid");

    let (status, _) = app
        .call(
            Method::POST,
            "/sensors",
            app.admin,
            Some(json!({
                "sensor_id": "desk-occ-1",
                "venue_id": venue,
                "space_id": space,
                "sensor_type": "occupancy",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    for (offset, count) in [(5 * MINUTE, 2), (115 * MINUTE, 1)] {
        let reading = json!({
            "sensor_id": "desk-occ-1",
            "sensor_type": "occupancy",
            "timestamp": rfc3339(start + offset),
            "value": count,
            "metadata": { "motion_detected": true },
        });
        let sig = signature::sign(IOT_SECRET.as_bytes(), reading.to_string().as_bytes());
        let (status, body) = app.iot(&reading, Some(sig)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["message"], "Data processed successfully");
    }

    let (status, v) = app
        .call(Method::GET, &format!("/bookings/{booking_id}/verification"), user, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["status"], "verified");
    assert_eq!(v["occupancy_verified"], true);
    assert_eq!(v["metadata"]["event_count"], 2);
    assert_eq!(v["metadata"]["max_occupancy"], 2);

    let (status, refund) = app
        .call(
            Method::POST,
            &format!("/payments/{payment_id}/refund"),
            user,
            Some(json!({ "reason": "plans changed" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refund["status"], "Refunded");
    assert_eq!(refund["amount"], "40.00");

    let (_, booking) = app
        .call(Method::GET, &format!("/bookings/{booking_id}"), user, None)
        .await;
    assert_eq!(booking["status"], "Cancelled");
    assert_eq!(booking["payment_status"], "Refunded");

    let (status, audit) = app
        .call(Method::GET, &format!("/payments/{payment_id}/audit"), user, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = audit
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["INITIATED", "CAPTURED", "REFUNDED"]);

    // The slot is free again.
    let (status, _) = app
        .book(Ulid::new(), venue, space, start + HOUR, start + 3 * HOUR)
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn bad_iot_signature_writes_nothing() {
    let app = start_test_app(QueueGateway::default());
    let venue = Ulid::new();
    let space = app.space(venue, "10").await;
    let (_, sensor) = app
        .call(
            Method::POST,
            "/sensors",
            app.admin,
            Some(json!({
                "sensor_id": "temp-7",
                "venue_id": venue,
                "space_id": space,
                "sensor_type": "temperature",
            })),
        )
        .await;
    let sensor_id = sensor["id"].as_str().unwrap().to_string();

    let reading = json!({
        "sensor_id": "temp-7",
        "sensor_type": "temperature",
        "timestamp": rfc3339(now_ms()),
        "value": 22.0,
        "unit": "C",
    });
    let forged = signature::sign(b"wrong-secret", reading.to_string().as_bytes());
    let (status, body) = app.iot(&reading, Some(forged)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid signature");

    let (status, _) = app.iot(&reading, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        app.metrics
            .count(WEBHOOK_SIGNATURE_FAILURES_TOTAL, ("source", "iot")),
        2
    );

    let (_, readings) = app
        .call(Method::GET, &format!("/sensors/{sensor_id}/readings?hours=1"), app.admin, None)
        .await;
    assert_eq!(readings.as_array().unwrap().len(), 0);
    let status = app.engine.occupancy_status(space).await.unwrap();
    assert!(status.environment.is_none());
}

#[tokio::test]
async fn unknown_sensor_is_not_found() {
    let app = start_test_app(QueueGateway::default());
    let reading = json!({
        "sensor_id": "ghost",
        "sensor_type": "occupancy",
        "timestamp": rfc3339(now_ms()),
        "value": 1,
    });
    let sig = signature::sign(IOT_SECRET.as_bytes(), reading.to_string().as_bytes());
    let (status, body) = app.iot(&reading, Some(sig)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn policy_violation_names_the_policy() {
    let app = start_test_app(QueueGateway::default());
    let venue = Ulid::new();
    let space = app.space(venue, "15").await;
    let (status, policy) = app
        .call(
            Method::POST,
            "/policies",
            app.admin,
            Some(json!({ "venue_id": venue, "policy_type": "max_duration", "max_hours": 4 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let start = ahead(2);
    let (status, body) = app.book(Ulid::new(), venue, space, start, start + 5 * HOUR).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "POLICY_VIOLATION");
    assert_eq!(body["error"], "Maximum booking duration is 4 hours");
    assert_eq!(body["policy_type"], "max_duration");
    assert_eq!(body["policy_id"], policy["id"]);

    // Members may not manage policies.
    let (status, _) = app
        .call(
            Method::DELETE,
            &format!("/policies/{}", policy["id"].as_str().unwrap()),
            Ulid::new(),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn declined_payment_is_reported() {
    let gateway = QueueGateway::default();
    gateway.captures.lock().unwrap().push_back(Err(GatewayFault::Rejected {
        status: 400,
        message: "card declined".into(),
        body: r#"{"message":"card declined"}"#.into(),
    }));
    let app = start_test_app(gateway);
    let venue = Ulid::new();
    let space = app.space(venue, "20").await;
    let user = Ulid::new();
    let start = ahead(3);
    let (_, booking) = app.book(user, venue, space, start, start + HOUR).await;
    let booking_id = booking["id"].as_str().unwrap();

    let (status, body) = app.pay(user, booking_id, "declined-1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "PAYMENT_FAILED");
    assert_eq!(body["success"], false);
    assert_eq!(body["status"], "Failed");

    let (_, booking) = app
        .call(Method::GET, &format!("/bookings/{booking_id}"), user, None)
        .await;
    assert_eq!(booking["payment_status"], "Failed");
}

#[tokio::test]
async fn unknown_outcome_keeps_payment_pending() {
    let gateway = QueueGateway::default();
    for _ in 0..3 {
        gateway.captures.lock().unwrap().push_back(Err(GatewayFault::Timeout));
    }
    let app = start_test_app(gateway);
    let venue = Ulid::new();
    let space = app.space(venue, "20").await;
    let user = Ulid::new();
    let start = ahead(3);
    let (_, booking) = app.book(user, venue, space, start, start + HOUR).await;
    let booking_id = booking["id"].as_str().unwrap();

    let (status, body) = app.pay(user, booking_id, "flaky-1").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "PAYMENT_STATUS_UNKNOWN");
    assert!(body["error"].as_str().unwrap().contains("same idempotency key"));
    assert_eq!(app.gateway.capture_calls.load(Ordering::SeqCst), 3);

    // A retry with the same key reports the pending payment instead of charging again.
    let (status, body) = app.pay(user, booking_id, "flaky-1").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "Pending");
    assert_eq!(app.gateway.capture_calls.load(Ordering::SeqCst), 3);
    let payment_id = body["payment_id"].as_str().unwrap().to_string();

    // A fresh key can't start a second charge while this one is unresolved.
    let (status, body) = app.pay(user, booking_id, "flaky-2").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE");
    assert_eq!(app.gateway.capture_calls.load(Ordering::SeqCst), 3);

    // The gateway's callback carries our reference and settles it.
    let req = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/payments")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "transaction_id": "gw-late", "status": "paid", "reference": payment_id }).to_string(),
        ))
        .unwrap();
    let (status, body) = app.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["payment_id"], payment_id.as_str());
    assert_eq!(body["status"], "Paid");

    let (status, body) = app.pay(user, booking_id, "flaky-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Paid");
    assert_eq!(body["transaction_id"], "gw-late");
    let (status, _) = app
        .call(Method::POST, &format!("/bookings/{booking_id}/confirm"), user, None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn requests_need_identity() {
    let app = start_test_app(QueueGateway::default());
    let req = Request::builder()
        .method(Method::GET)
        .uri("/bookings")
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHENTICATED");

    let (status, body) = app.call(Method::GET, "/health", Ulid::new(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn payment_callback_updates_status() {
    let app = start_test_app(QueueGateway::default());
    let venue = Ulid::new();
    let space = app.space(venue, "20").await;
    let user = Ulid::new();
    let start = ahead(3);
    let (_, booking) = app.book(user, venue, space, start, start + HOUR).await;
    let booking_id = booking["id"].as_str().unwrap();
    let (_, payment) = app.pay(user, booking_id, "cb-1").await;
    let tx = payment["transaction_id"].as_str().unwrap().to_string();

    let req = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/payments")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "transaction_id": tx, "status": "failed" }).to_string()))
        .unwrap();
    let (status, body) = app.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["previous_status"], "Paid");
    assert_eq!(body["status"], "Failed");

    let (_, booking) = app
        .call(Method::GET, &format!("/bookings/{booking_id}"), user, None)
        .await;
    assert_eq!(booking["payment_status"], "Failed");
}
