//! Payment processing against an external gateway.
//!
//! The engine owns payment state; this layer owns the conversation with the
//! gateway. A capture is persisted Pending before the first gateway call and
//! only moves to a terminal status once the gateway gave a definite answer.

pub mod gateway;
pub mod http;
pub mod retry;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::Principal;
use crate::engine::{CaptureSettlement, Engine, EngineError, PaymentDraft};
use crate::model::{Payment, PaymentMethod, PaymentStatus};
use crate::sealed::FieldCipher;

use self::gateway::{GatewayCharge, GatewayFault, GatewayRefund, GatewayReply, PaymentGateway};
use self::retry::{RetryError, RetryPolicy, with_retry};

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub booking_id: Ulid,
    pub method: PaymentMethod,
    pub currency: String,
    pub idempotency_key: String,
    /// Plaintext last four card digits; sealed before it is stored.
    pub card_last4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureOutcome {
    pub success: bool,
    pub payment_id: Ulid,
    pub transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub raw_response: Option<Value>,
}

impl CaptureOutcome {
    fn of(payment: &Payment) -> Self {
        Self {
            success: matches!(payment.status, PaymentStatus::Paid | PaymentStatus::Refunded),
            payment_id: payment.id,
            transaction_id: payment.transaction_ref.clone(),
            status: payment.status,
            amount: payment.amount,
            raw_response: payment.gateway_payload.as_deref().map(raw_json),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundOutcome {
    pub payment_id: Ulid,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub refund_transaction_id: Option<String>,
}

/// Gateway bodies are kept as text; hand them back as JSON when they parse.
fn raw_json(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn unknown(err: RetryError<GatewayFault>) -> EngineError {
    EngineError::GatewayUnknownOutcome {
        attempts: err.attempts,
        cause: err.error.to_string(),
    }
}

pub struct PaymentProcessor {
    engine: Arc<Engine>,
    gateway: Arc<dyn PaymentGateway>,
    retry: RetryPolicy,
    cipher: Arc<FieldCipher>,
}

impl PaymentProcessor {
    pub fn new(
        engine: Arc<Engine>,
        gateway: Arc<dyn PaymentGateway>,
        retry: RetryPolicy,
        cipher: Arc<FieldCipher>,
    ) -> Self {
        Self {
            engine,
            gateway,
            retry,
            cipher,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Charge a booking. A repeated (user, idempotency key) returns the first
    /// attempt's current state and never reaches the gateway again.
    pub async fn capture(
        &self,
        principal: &Principal,
        req: CaptureRequest,
    ) -> Result<CaptureOutcome, EngineError> {
        let lock = self
            .engine
            .idempotency_lock(principal.user_id, &req.idempotency_key);
        let _held = lock.lock().await;

        if let Some(id) = self
            .engine
            .find_idempotent(principal.user_id, &req.idempotency_key)
        {
            let payment = self.engine.get_payment(principal, id).await?;
            info!(payment = %payment.id, "idempotent replay; gateway not called");
            return Ok(CaptureOutcome::of(&payment));
        }

        let card_last4 = match req.card_last4.as_deref() {
            Some(digits) if digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_digit()) => {
                Some(self.cipher.seal(digits)?)
            }
            Some(_) => return Err(EngineError::validation("card_last4 must be 4 digits")),
            None => None,
        };
        let payment = self
            .engine
            .open_payment(
                principal,
                PaymentDraft {
                    booking_id: req.booking_id,
                    method: req.method,
                    currency: req.currency,
                    idempotency_key: req.idempotency_key,
                    card_last4,
                },
            )
            .await?;

        let charge = GatewayCharge {
            amount: payment.amount,
            currency: payment.currency.clone(),
            payment_method: payment.method.as_str().to_string(),
            reference: payment.id.to_string(),
            customer_id: principal.user_id.to_string(),
            description: format!("Booking {}", payment.booking_id),
            idempotency_key: payment.idempotency_key.clone(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let attempts = AtomicUsize::new(0);
        let result = {
            let gateway = &self.gateway;
            let charge = &charge;
            let attempts = &attempts;
            with_retry(
                self.retry,
                move |attempt| {
                    attempts.store(attempt, Ordering::Relaxed);
                    info!(payment = %charge.reference, attempt, gateway = gateway.name(), "capture attempt");
                    gateway.capture(charge)
                },
                GatewayFault::is_retryable,
            )
            .await
        };

        let settlement = match result {
            Ok(GatewayReply {
                transaction_id: Some(transaction_id),
                raw,
                ..
            }) => CaptureSettlement::Paid {
                transaction_id,
                payload: raw,
            },
            Ok(_) => {
                warn!(payment = %payment.id, "gateway accepted capture without a transaction id");
                return Err(EngineError::GatewayUnknownOutcome {
                    attempts: attempts.load(Ordering::Relaxed),
                    cause: "gateway reply carried no transaction id".into(),
                });
            }
            Err(RetryError {
                error: GatewayFault::Rejected { message, body, .. },
                ..
            }) => CaptureSettlement::Failed {
                message,
                payload: body,
            },
            Err(err) => {
                warn!(payment = %payment.id, attempts = err.attempts, error = %err.error, "capture outcome unknown; payment left pending");
                return Err(unknown(err));
            }
        };

        let settled = self
            .engine
            .settle_capture(payment.id, settlement, Some(principal.user_id))
            .await?;
        Ok(CaptureOutcome::of(&settled))
    }

    /// Refund a Paid payment, in full unless `amount` is given. Nothing
    /// changes locally unless the gateway accepts.
    pub async fn refund(
        &self,
        principal: &Principal,
        payment_id: Ulid,
        amount: Option<Decimal>,
        reason: Option<String>,
    ) -> Result<RefundOutcome, EngineError> {
        let (payment, amount) = self
            .engine
            .prepare_refund(principal, payment_id, amount)
            .await?;
        let transaction_id = payment
            .transaction_ref
            .clone()
            .ok_or_else(|| EngineError::InvalidState("payment has no gateway transaction".into()))?;
        let reason = reason.unwrap_or_else(|| "Customer requested refund".to_string());
        let request = GatewayRefund {
            transaction_id,
            amount,
            reason: reason.clone(),
        };

        let result = {
            let gateway = &self.gateway;
            let request = &request;
            with_retry(
                self.retry,
                move |_| gateway.refund(request),
                GatewayFault::is_retryable,
            )
            .await
        };
        let reply = match result {
            Ok(reply) => reply,
            Err(RetryError {
                error: GatewayFault::Rejected { status, message, .. },
                ..
            }) => {
                warn!(payment = %payment_id, status, %message, "refund rejected by gateway");
                return Err(EngineError::GatewayRejected { status, message });
            }
            Err(err) => return Err(unknown(err)),
        };

        let refunded = self
            .engine
            .settle_refund(principal, payment_id, amount, reason, reply.raw)
            .await?;
        Ok(RefundOutcome {
            payment_id: refunded.id,
            amount,
            status: refunded.status,
            refund_transaction_id: reply.transaction_id,
        })
    }

    /// Ask the gateway what it knows about a transaction.
    pub async fn query_status(&self, transaction_id: &str) -> Result<GatewayReply, EngineError> {
        self.gateway
            .query_status(transaction_id)
            .await
            .map_err(|fault| match fault {
                GatewayFault::Rejected { status, message, .. } => {
                    EngineError::GatewayRejected { status, message }
                }
                other => EngineError::GatewayUnknownOutcome {
                    attempts: 1,
                    cause: other.to_string(),
                },
            })
    }

    /// Decrypt the stored card digits of a payment.
    pub fn card_last4(&self, payment: &Payment) -> Result<Option<String>, EngineError> {
        payment
            .card_last4
            .as_ref()
            .map(|sealed| self.cipher.open(sealed))
            .transpose()
            .map_err(EngineError::from)
    }
}
