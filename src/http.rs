//! HTTP ingress: JSON over axum.
//!
//! Handlers translate between the wire shapes (RFC 3339 times, string
//! decimals) and engine calls. Every error leaves as `{error, code}`.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{MatchedPath, Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::warn;
use ulid::Ulid;

use crate::auth::{Admin, Principal};
use crate::engine::{
    AvailableSpace, BookingPatch, Engine, EngineError, NewBooking, OccupancyStatus, ReadingInput,
    SensorSpec, now_ms,
};
use crate::limits::MAX_WEBHOOK_BODY_BYTES;
use crate::model::*;
use crate::observability::{HTTP_REQUESTS_TOTAL, Metrics, WEBHOOK_SIGNATURE_FAILURES_TOTAL};
use crate::payment::{CaptureRequest, PaymentProcessor};
use crate::signature;

pub const IOT_SIGNATURE_HEADER: &str = "x-iot-signature";
pub const PAYMENT_SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub payments: Arc<PaymentProcessor>,
    /// Unset means every IoT delivery is refused.
    pub iot_secret: Option<Arc<str>>,
    /// Unset means payment callbacks are accepted unsigned.
    pub payment_webhook_secret: Option<Arc<str>>,
    pub metrics: Metrics,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bookings", post(create_booking).get(list_bookings))
        .route(
            "/bookings/:id",
            get(get_booking).patch(update_booking).delete(cancel_booking),
        )
        .route("/bookings/:id/confirm", post(confirm_booking))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .route("/bookings/:id/verification", get(get_verification))
        .route("/availability", post(availability))
        .route("/payments", post(create_payment))
        .route("/payments/:id", get(get_payment))
        .route("/payments/:id/refund", post(refund_payment))
        .route("/payments/:id/audit", get(payment_audit))
        .route("/spaces/:id", put(register_space))
        .route("/spaces/:id/occupancy", get(occupancy_status))
        .route("/spaces/:id/events", get(occupancy_events))
        .route("/policies", post(add_policy).get(list_policies))
        .route("/policies/:id", delete(deactivate_policy))
        .route("/sensors", post(register_sensor).get(list_sensors))
        .route("/sensors/:id", patch(set_sensor_active))
        .route("/sensors/:id/readings", get(sensor_readings))
        .route("/webhooks/iot", post(iot_webhook))
        .route("/webhooks/payments", post(payment_webhook))
        .route_layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn count_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());
    let response = next.run(req).await;
    state.metrics.increment(
        HTTP_REQUESTS_TOTAL,
        &[("route", route.as_str()), ("status", response.status().as_str())],
    );
    response
}

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    Unauthorized(&'static str),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

fn status_of(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Validation(_)
        | EngineError::PolicyViolation(_)
        | EngineError::PaymentRequired
        | EngineError::GatewayRejected { .. }
        | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
        EngineError::Conflict(_) | EngineError::InvalidState(_) => StatusCode::CONFLICT,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::GatewayUnknownOutcome { .. } => StatusCode::BAD_GATEWAY,
        EngineError::InvalidSignature => StatusCode::UNAUTHORIZED,
        EngineError::WalError(_) | EngineError::Seal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Engine(e) => {
                let status = status_of(&e);
                if status.is_server_error() {
                    tracing::error!(error = %e, "request failed");
                }
                let message = match &e {
                    EngineError::GatewayUnknownOutcome { .. } => format!(
                        "{e}; retry with the same idempotency key"
                    ),
                    EngineError::WalError(_) | EngineError::Seal(_) => {
                        "internal storage error".to_string()
                    }
                    _ => e.to_string(),
                };
                let mut body = json!({ "error": message, "code": e.code() });
                if let EngineError::PolicyViolation(v) = &e {
                    body["policy_id"] = json!(v.policy_id);
                    body["policy_type"] = json!(v.rule);
                }
                if let EngineError::Conflict(id) = &e {
                    body["conflicting_booking_id"] = json!(id);
                }
                (status, body)
            }
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": message, "code": "BAD_REQUEST" }),
            ),
            ApiError::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": message, "code": "INVALID_SIGNATURE" }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse<T: FromStr<Err = String>>(raw: &str) -> ApiResult<T> {
    raw.parse().map_err(|e: String| ApiError::Engine(EngineError::Validation(e)))
}

// ── Wire conversions ─────────────────────────────────────────────

fn at(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn ms(t: DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

fn text_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Money arrives as a JSON string or number; both end up as an exact
/// decimal. Clients that care about precision send strings.
fn decimal_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Decimal>, D::Error> {
    let raw = match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "expected a decimal, got {other}"
            )));
        }
    };
    Decimal::from_str(raw.trim())
        .or_else(|_| Decimal::from_scientific(raw.trim()))
        .map(Some)
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Serialize)]
pub struct BookingView {
    pub id: Ulid,
    pub user_id: Ulid,
    pub venue_id: Ulid,
    pub space_id: Option<Ulid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BookingStatus,
    pub total_price: Decimal,
    pub payment_status: PaymentStatus,
    pub company_id: Option<Ulid>,
    pub iot_verified: bool,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Booking> for BookingView {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            user_id: b.user_id,
            venue_id: b.venue_id,
            space_id: b.space_id,
            start_time: at(b.span.start),
            end_time: at(b.span.end),
            status: b.status,
            total_price: b.total_price,
            payment_status: b.payment_status,
            company_id: b.company_id,
            iot_verified: b.iot_verified,
            actual_start_time: b.actual_start.map(at),
            actual_end_time: b.actual_end.map(at),
            created_at: at(b.created_at),
            updated_at: at(b.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentView {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub transaction_ref: Option<String>,
    pub status: PaymentStatus,
    pub gateway_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<Payment> for PaymentView {
    fn from(p: Payment) -> Self {
        Self {
            id: p.id,
            booking_id: p.booking_id,
            amount: p.amount,
            currency: p.currency,
            payment_method: p.method,
            transaction_ref: p.transaction_ref,
            status: p.status,
            gateway_payload: p.gateway_payload.as_deref().map(text_json),
            created_at: at(p.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
struct AuditView {
    id: Ulid,
    action: String,
    amount: Decimal,
    reason: Option<String>,
    actor: Option<Ulid>,
    timestamp: DateTime<Utc>,
    snapshot: Option<Value>,
}

impl From<AuditEntry> for AuditView {
    fn from(a: AuditEntry) -> Self {
        Self {
            id: a.id,
            action: a.action.to_string(),
            amount: a.amount,
            reason: a.reason,
            actor: a.actor,
            timestamp: at(a.at),
            snapshot: a.snapshot.as_deref().map(text_json),
        }
    }
}

#[derive(Debug, Serialize)]
struct VerificationView {
    booking_id: Ulid,
    status: &'static str,
    actual_start_time: Option<DateTime<Utc>>,
    actual_end_time: Option<DateTime<Utc>>,
    occupancy_verified: bool,
    metadata: Value,
}

impl From<BookingVerification> for VerificationView {
    fn from(v: BookingVerification) -> Self {
        Self {
            booking_id: v.booking_id,
            status: v.status.as_str(),
            actual_start_time: v.actual_start.map(at),
            actual_end_time: v.actual_end.map(at),
            occupancy_verified: v.occupancy_verified,
            metadata: json!({
                "event_count": v.event_count,
                "max_occupancy": v.max_occupancy,
                "verified_at": v.verified_at.map(at),
            }),
        }
    }
}

fn occupancy_view(s: OccupancyStatus) -> Value {
    json!({
        "space_id": s.space_id,
        "venue_id": s.venue_id,
        "current_occupancy": s.current_occupancy,
        "last_updated": s.last_updated.map(at),
        "current_booking": s.current_booking.map(|b| json!({
            "booking_id": b.booking_id,
            "user_id": b.user_id,
            "end_time": at(b.end),
        })),
        "environmental_data": s.environment.map(|e| json!({
            "date": e.day,
            "temperature": e.temperature,
            "humidity": e.humidity,
            "air_quality_index": e.air_quality_index,
            "noise_level": e.noise_level,
        })),
    })
}

fn occupancy_event_view(e: OccupancyEvent) -> Value {
    json!({
        "id": e.id,
        "space_id": e.space_id,
        "event_type": e.kind,
        "occupancy_count": e.count,
        "timestamp": at(e.timestamp),
        "booking_id": e.booking_id,
        "metadata": text_json(&e.metadata),
    })
}

fn sensor_view(s: Sensor) -> Value {
    json!({
        "id": s.id,
        "sensor_id": s.external_id,
        "venue_id": s.venue_id,
        "space_id": s.space_id,
        "sensor_type": s.kind.as_str(),
        "is_active": s.active,
        "last_heartbeat": s.last_heartbeat.map(at),
    })
}

fn reading_view(r: SensorReading) -> Value {
    json!({
        "id": r.id,
        "timestamp": at(r.timestamp),
        "value": r.value,
        "unit": r.unit,
        "metadata": text_json(&r.metadata),
    })
}

fn policy_view(p: BookingPolicy) -> Value {
    let config = match p.rule {
        PolicyRule::AdvanceBooking { min_hours } => json!({ "min_hours": min_hours }),
        PolicyRule::MaxDuration { max_hours } => json!({ "max_hours": max_hours }),
        PolicyRule::CorporateOnly => json!({}),
    };
    json!({
        "id": p.id,
        "venue_id": p.venue_id,
        "space_id": p.space_id,
        "policy_type": p.rule.label(),
        "config": config,
        "is_active": p.active,
    })
}

// ── Bookings ─────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct CreateBookingBody {
    venue_id: Ulid,
    #[serde(default)]
    space_id: Option<Ulid>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    #[serde(default)]
    company_id: Option<Ulid>,
}

async fn create_booking(
    State(state): State<AppState>,
    principal: Principal,
    body: Result<Json<CreateBookingBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<BookingView>)> {
    let Json(body) = body?;
    let booking = state
        .engine
        .create_booking(NewBooking {
            user_id: principal.user_id,
            venue_id: body.venue_id,
            space_id: body.space_id,
            start: ms(body.start_time),
            end: ms(body.end_time),
            company_id: body.company_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(booking.into())))
}

#[derive(Debug, Deserialize)]
struct ListBookingsQuery {
    status: Option<String>,
}

async fn list_bookings(
    State(state): State<AppState>,
    principal: Principal,
    Query(q): Query<ListBookingsQuery>,
) -> ApiResult<Json<Vec<BookingView>>> {
    let status = q.status.as_deref().map(parse::<BookingStatus>).transpose()?;
    let bookings = state.engine.list_bookings(&principal, status).await;
    Ok(Json(bookings.into_iter().map(BookingView::from).collect()))
}

async fn get_booking(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<BookingView>> {
    let booking = state.engine.get_booking(&principal, id).await?;
    Ok(Json(booking.into()))
}

#[derive(Debug, Deserialize)]
struct UpdateBookingBody {
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    space_id: Option<Ulid>,
    #[serde(default)]
    company_id: Option<Ulid>,
}

async fn update_booking(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Ulid>,
    body: Result<Json<UpdateBookingBody>, JsonRejection>,
) -> ApiResult<Json<BookingView>> {
    let Json(body) = body?;
    let patch = BookingPatch {
        start: body.start_time.map(ms),
        end: body.end_time.map(ms),
        space_id: body.space_id,
        company_id: body.company_id,
    };
    let booking = state.engine.update_booking(&principal, id, patch).await?;
    Ok(Json(booking.into()))
}

async fn cancel_booking(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<BookingView>> {
    let booking = state.engine.cancel_booking(&principal, id).await?;
    Ok(Json(booking.into()))
}

async fn confirm_booking(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<BookingView>> {
    let booking = state.engine.confirm_booking(&principal, id).await?;
    Ok(Json(booking.into()))
}

async fn get_verification(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<VerificationView>> {
    let v = state.engine.verification(&principal, id).await?;
    Ok(Json(v.into()))
}

#[derive(Debug, Deserialize)]
struct AvailabilityBody {
    venue_id: Ulid,
    #[serde(default)]
    space_id: Option<Ulid>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

async fn availability(
    State(state): State<AppState>,
    _principal: Principal,
    body: Result<Json<AvailabilityBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let spaces: Vec<AvailableSpace> = state
        .engine
        .availability(
            body.venue_id,
            body.space_id,
            ms(body.start_time),
            ms(body.end_time),
        )
        .await?;
    Ok(Json(json!({
        "available_spaces": spaces,
        "start_time": body.start_time,
        "end_time": body.end_time,
    })))
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreatePaymentBody {
    booking_id: Ulid,
    payment_method: String,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default)]
    card_last4: Option<String>,
}

fn default_currency() -> String {
    "USD".into()
}

async fn create_payment(
    State(state): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
    body: Result<Json<CreatePaymentBody>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| EngineError::validation("Idempotency-Key header is required"))?
        .to_string();
    let method = parse::<PaymentMethod>(&body.payment_method)?;

    let outcome = state
        .payments
        .capture(
            &principal,
            CaptureRequest {
                booking_id: body.booking_id,
                method,
                currency: body.currency,
                idempotency_key,
                card_last4: body.card_last4,
            },
        )
        .await?;

    let response = match outcome.status {
        PaymentStatus::Paid | PaymentStatus::Refunded => (StatusCode::OK, Json(json!(outcome))),
        PaymentStatus::Pending => (StatusCode::ACCEPTED, Json(json!(outcome))),
        PaymentStatus::Failed => {
            let mut body = json!(outcome);
            body["error"] = json!("Payment processing failed");
            body["code"] = json!("PAYMENT_FAILED");
            (StatusCode::BAD_REQUEST, Json(body))
        }
    };
    Ok(response.into_response())
}

async fn get_payment(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<PaymentView>> {
    let payment = state.engine.get_payment(&principal, id).await?;
    Ok(Json(payment.into()))
}

#[derive(Debug, Default, Deserialize)]
struct RefundBody {
    #[serde(default, deserialize_with = "decimal_opt")]
    amount: Option<Decimal>,
    #[serde(default)]
    reason: Option<String>,
}

async fn refund_payment(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Ulid>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let body: RefundBody = if body.is_empty() {
        RefundBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let outcome = state
        .payments
        .refund(&principal, id, body.amount, body.reason)
        .await?;
    Ok(Json(json!({
        "message": "Refund processed successfully",
        "payment_id": outcome.payment_id,
        "amount": outcome.amount,
        "status": outcome.status,
        "refund_transaction_id": outcome.refund_transaction_id,
    })))
}

async fn payment_audit(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Vec<AuditView>>> {
    let rows = state.engine.audit_trail(&principal, id).await?;
    Ok(Json(rows.into_iter().map(AuditView::from).collect()))
}

// ── Inventory, policies, sensors (admin) ─────────────────────────

#[derive(Debug, Deserialize)]
struct SpaceBody {
    venue_id: Ulid,
    #[serde(default, deserialize_with = "decimal_opt")]
    hourly_rate: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    daily_rate: Option<Decimal>,
}

async fn register_space(
    State(state): State<AppState>,
    Admin(_): Admin,
    Path(id): Path<Ulid>,
    body: Result<Json<SpaceBody>, JsonRejection>,
) -> ApiResult<Json<SpaceInfo>> {
    let Json(body) = body?;
    let info = state
        .engine
        .register_space(SpaceInfo {
            id,
            venue_id: body.venue_id,
            hourly_rate: body.hourly_rate,
            daily_rate: body.daily_rate,
        })
        .await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "policy_type", rename_all = "snake_case")]
enum PolicyRuleBody {
    AdvanceBooking { min_hours: u32 },
    MaxDuration { max_hours: u32 },
    CorporateOnly,
}

#[derive(Debug, Deserialize)]
struct PolicyBody {
    #[serde(default)]
    venue_id: Option<Ulid>,
    #[serde(default)]
    space_id: Option<Ulid>,
    #[serde(flatten)]
    rule: PolicyRuleBody,
}

async fn add_policy(
    State(state): State<AppState>,
    Admin(_): Admin,
    body: Result<Json<PolicyBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = body?;
    let rule = match body.rule {
        PolicyRuleBody::AdvanceBooking { min_hours } => PolicyRule::AdvanceBooking { min_hours },
        PolicyRuleBody::MaxDuration { max_hours } => PolicyRule::MaxDuration { max_hours },
        PolicyRuleBody::CorporateOnly => PolicyRule::CorporateOnly,
    };
    let policy = state
        .engine
        .add_policy(body.venue_id, body.space_id, rule)
        .await?;
    Ok((StatusCode::CREATED, Json(policy_view(policy))))
}

async fn list_policies(State(state): State<AppState>, _principal: Principal) -> Json<Vec<Value>> {
    Json(state.engine.list_policies().into_iter().map(policy_view).collect())
}

async fn deactivate_policy(
    State(state): State<AppState>,
    Admin(_): Admin,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Value>> {
    let policy = state.engine.deactivate_policy(id).await?;
    Ok(Json(policy_view(policy)))
}

#[derive(Debug, Deserialize)]
struct SensorBody {
    sensor_id: String,
    venue_id: Ulid,
    #[serde(default)]
    space_id: Option<Ulid>,
    sensor_type: String,
}

async fn register_sensor(
    State(state): State<AppState>,
    Admin(_): Admin,
    body: Result<Json<SensorBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = body?;
    let sensor = state
        .engine
        .register_sensor(SensorSpec {
            external_id: body.sensor_id,
            venue_id: body.venue_id,
            space_id: body.space_id,
            kind: parse(&body.sensor_type)?,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(sensor_view(sensor))))
}

#[derive(Debug, Deserialize)]
struct SensorQuery {
    venue_id: Option<Ulid>,
}

async fn list_sensors(
    State(state): State<AppState>,
    Admin(_): Admin,
    Query(q): Query<SensorQuery>,
) -> Json<Vec<Value>> {
    Json(
        state
            .engine
            .list_sensors(q.venue_id)
            .into_iter()
            .map(sensor_view)
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
struct SensorActiveBody {
    is_active: bool,
}

async fn set_sensor_active(
    State(state): State<AppState>,
    Admin(_): Admin,
    Path(id): Path<Ulid>,
    body: Result<Json<SensorActiveBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let sensor = state.engine.set_sensor_active(id, body.is_active).await?;
    Ok(Json(sensor_view(sensor)))
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    hours: Option<i64>,
}

impl WindowQuery {
    fn since(&self) -> ApiResult<Ms> {
        let hours = self.hours.unwrap_or(24);
        if !(0..=24 * 366).contains(&hours) {
            return Err(EngineError::LimitExceeded("hours").into());
        }
        Ok(now_ms() - hours * HOUR)
    }
}

async fn sensor_readings(
    State(state): State<AppState>,
    Admin(_): Admin,
    Path(id): Path<Ulid>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    let readings = state.engine.sensor_readings(id, q.since()?)?;
    Ok(Json(readings.into_iter().map(reading_view).collect()))
}

async fn occupancy_status(
    State(state): State<AppState>,
    _principal: Principal,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Value>> {
    let status = state.engine.occupancy_status(id).await?;
    Ok(Json(occupancy_view(status)))
}

async fn occupancy_events(
    State(state): State<AppState>,
    _principal: Principal,
    Path(id): Path<Ulid>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    let events = state.engine.occupancy_events(id, q.since()?).await?;
    Ok(Json(events.into_iter().map(occupancy_event_view).collect()))
}

// ── Webhooks ─────────────────────────────────────────────────────

fn check_signature(
    state: &AppState,
    source: &'static str,
    secret: &str,
    header: Option<&str>,
    body: &[u8],
) -> ApiResult<()> {
    if signature::verify(secret.as_bytes(), body, header) {
        return Ok(());
    }
    state
        .metrics
        .increment(WEBHOOK_SIGNATURE_FAILURES_TOTAL, &[("source", source)]);
    warn!(source, "webhook signature rejected");
    Err(ApiError::Unauthorized("Invalid signature"))
}

#[derive(Debug, Deserialize)]
struct IotReadingBody {
    sensor_id: String,
    sensor_type: String,
    timestamp: DateTime<Utc>,
    value: f64,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    metadata: Value,
}

async fn iot_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    if body.len() > MAX_WEBHOOK_BODY_BYTES {
        return Err(EngineError::LimitExceeded("webhook body too large").into());
    }
    let header = headers.get(IOT_SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    match state.iot_secret.as_deref() {
        Some(secret) => check_signature(&state, "iot", secret, header, &body)?,
        None => {
            warn!("IoT webhook secret not configured; delivery refused");
            return Err(ApiError::Unauthorized("Invalid signature"));
        }
    }

    let reading: IotReadingBody =
        serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("Invalid JSON".into()))?;
    let metadata = match reading.metadata {
        Value::Null => json!({}),
        other => other,
    };
    let data_id = state
        .engine
        .ingest_reading(ReadingInput {
            sensor_external_id: reading.sensor_id,
            sensor_type: parse(&reading.sensor_type)?,
            timestamp: ms(reading.timestamp),
            value: reading.value,
            unit: reading.unit,
            metadata,
        })
        .await?;
    Ok(Json(json!({
        "message": "Data processed successfully",
        "data_id": data_id,
    })))
}

#[derive(Debug, Deserialize)]
struct PaymentCallbackBody {
    transaction_id: String,
    status: String,
    /// Our payment id, as sent in the capture request.
    #[serde(default)]
    reference: Option<String>,
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    if body.len() > MAX_WEBHOOK_BODY_BYTES {
        return Err(EngineError::LimitExceeded("webhook body too large").into());
    }
    if let Some(secret) = state.payment_webhook_secret.as_deref() {
        let header = headers
            .get(PAYMENT_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        check_signature(&state, "payments", secret, header, &body)?;
    }

    let callback: PaymentCallbackBody =
        serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("Invalid JSON".into()))?;
    let status = parse::<PaymentStatus>(&callback.status)?;
    let reference = callback
        .reference
        .as_deref()
        .and_then(|r| Ulid::from_string(r).ok());
    let payload = String::from_utf8_lossy(&body).into_owned();
    let outcome = state
        .engine
        .apply_payment_webhook(&callback.transaction_id, reference, status, payload)
        .await?;
    Ok(Json(json!({
        "message": "Webhook processed successfully",
        "payment_id": outcome.payment_id,
        "previous_status": outcome.previous,
        "status": outcome.current,
    })))
}
