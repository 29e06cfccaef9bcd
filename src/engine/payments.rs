use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::Principal;
use crate::limits::{MAX_CURRENCY_LEN, MAX_IDEMPOTENCY_KEY_LEN, MAX_REASON_LEN};
use crate::model::*;
use crate::observability::PAYMENTS_TOTAL;
use crate::sealed::Sealed;

use super::conflict::now_ms;
use super::{Engine, EngineError};

/// A new payment attempt, before anything is persisted.
#[derive(Debug, Clone)]
pub struct PaymentDraft {
    pub booking_id: Ulid,
    pub method: PaymentMethod,
    pub currency: String,
    pub idempotency_key: String,
    pub card_last4: Option<Sealed>,
}

/// How a capture attempt ended at the gateway.
#[derive(Debug, Clone)]
pub enum CaptureSettlement {
    Paid {
        transaction_id: String,
        payload: String,
    },
    Failed {
        message: String,
        payload: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookOutcome {
    pub payment_id: Ulid,
    pub previous: PaymentStatus,
    pub current: PaymentStatus,
}

fn audit(
    payment: &Payment,
    action: AuditAction,
    amount: Decimal,
    reason: Option<String>,
    actor: Option<Ulid>,
    snapshot: Option<String>,
) -> Event {
    Event::AuditAppended(AuditEntry {
        id: Ulid::new(),
        payment_id: payment.id,
        action,
        amount,
        reason,
        actor,
        at: now_ms(),
        snapshot,
    })
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

impl Engine {
    pub fn find_idempotent(&self, user_id: Ulid, key: &str) -> Option<Ulid> {
        self.idempotency
            .get(&(user_id, key.to_string()))
            .map(|e| *e.value())
    }

    pub async fn payment_snapshot(&self, id: Ulid) -> Option<Payment> {
        let arc = self.payment_arc(&id)?;
        let payment = arc.lock().await.clone();
        Some(payment)
    }

    /// Lock a payment together with its booking (booking first).
    async fn lock_payment(
        &self,
        id: Ulid,
    ) -> Result<(OwnedMutexGuard<Booking>, OwnedMutexGuard<Payment>), EngineError> {
        let arc = self
            .payment_arc(&id)
            .ok_or_else(|| EngineError::not_found("payment", id))?;
        let booking_id = arc.lock().await.booking_id;
        let booking = self
            .booking(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?
            .lock_owned()
            .await;
        let payment = arc.lock_owned().await;
        Ok((booking, payment))
    }

    /// Status of every other attempt on a booking. The caller holds the
    /// booking lock; payment locks nest under it.
    async fn sibling_attempts(&self, booking_id: Ulid, exclude: Option<Ulid>) -> Vec<(Ulid, PaymentStatus)> {
        let ids = self
            .booking_payments
            .get(&booking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids.into_iter().filter(|id| Some(*id) != exclude) {
            if let Some(arc) = self.payment_arc(&id) {
                out.push((id, arc.lock().await.status));
            }
        }
        out
    }

    async fn paid_sibling(&self, booking_id: Ulid, payment_id: Ulid) -> Option<Ulid> {
        self.sibling_attempts(booking_id, Some(payment_id))
            .await
            .into_iter()
            .find(|(_, status)| *status == PaymentStatus::Paid)
            .map(|(id, _)| id)
    }

    /// Persist a Pending payment for the booking plus its `Initiated` audit row.
    /// The caller must hold the (user, key) idempotency lock.
    pub async fn open_payment(
        &self,
        principal: &Principal,
        draft: PaymentDraft,
    ) -> Result<Payment, EngineError> {
        if draft.idempotency_key.is_empty() {
            return Err(EngineError::validation("Idempotency-Key header is required"));
        }
        if draft.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EngineError::LimitExceeded("idempotency key too long"));
        }
        if draft.currency.len() != MAX_CURRENCY_LEN
            || !draft.currency.bytes().all(|b| b.is_ascii_alphabetic())
        {
            return Err(EngineError::validation("currency must be a 3-letter ISO code"));
        }

        let _gate = self.commit_gate.read().await;
        if self
            .find_idempotent(principal.user_id, &draft.idempotency_key)
            .is_some()
        {
            return Err(EngineError::InvalidState(
                "idempotency key already used".into(),
            ));
        }
        let mut booking = self
            .booking(&draft.booking_id)
            .ok_or_else(|| EngineError::not_found("booking", draft.booking_id))?
            .lock_owned()
            .await;
        if !principal.can_access(booking.user_id) || booking.status != BookingStatus::Pending {
            return Err(EngineError::not_found("booking", draft.booking_id));
        }
        if booking.payment_status == PaymentStatus::Paid {
            return Err(EngineError::validation("Booking already paid"));
        }
        // One attempt in flight per booking, so two keys can't both capture.
        for (id, status) in self.sibling_attempts(booking.id, None).await {
            match status {
                PaymentStatus::Paid => return Err(EngineError::validation("Booking already paid")),
                PaymentStatus::Pending => {
                    return Err(EngineError::InvalidState(format!(
                        "payment {id} for this booking is still pending; retry it with its idempotency key"
                    )));
                }
                _ => {}
            }
        }

        let payment = Payment {
            id: Ulid::new(),
            booking_id: booking.id,
            user_id: principal.user_id,
            amount: booking.total_price,
            currency: draft.currency.to_ascii_uppercase(),
            method: draft.method,
            transaction_ref: None,
            status: PaymentStatus::Pending,
            idempotency_key: draft.idempotency_key,
            gateway_payload: None,
            card_last4: draft.card_last4,
            created_at: now_ms(),
        };
        let commit = [
            Event::PaymentCreated(payment.clone()),
            audit(
                &payment,
                AuditAction::Initiated,
                payment.amount,
                None,
                Some(principal.user_id),
                None,
            ),
        ];
        self.persist_and_apply(&commit, &mut [], &mut [&mut *booking], &mut [])
            .await?;
        info!(payment = %payment.id, booking = %payment.booking_id, amount = %payment.amount, "payment initiated");
        Ok(payment)
    }

    /// Record the terminal outcome of a capture. A payment that already left
    /// Pending is returned unchanged. A capture for a booking another
    /// payment already paid is recorded Failed with its transaction kept,
    /// so the duplicate charge can be refunded.
    pub async fn settle_capture(
        &self,
        payment_id: Ulid,
        settlement: CaptureSettlement,
        actor: Option<Ulid>,
    ) -> Result<Payment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (mut booking, mut payment) = self.lock_payment(payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Ok(payment.clone());
        }

        let at = now_ms();
        let duplicate_of = match settlement {
            CaptureSettlement::Paid { .. } => self.paid_sibling(booking.id, payment.id).await,
            CaptureSettlement::Failed { .. } => None,
        };
        let commit = match (settlement, duplicate_of) {
            (
                CaptureSettlement::Paid {
                    transaction_id,
                    payload,
                },
                Some(other),
            ) => {
                warn!(payment = %payment.id, %other, %transaction_id, "duplicate capture; refund required");
                let reason = format!(
                    "Duplicate capture {transaction_id}: booking already paid by payment {other}; refund required"
                );
                vec![
                    Event::PaymentSettled {
                        id: payment.id,
                        status: PaymentStatus::Failed,
                        transaction_ref: Some(transaction_id),
                        gateway_payload: Some(payload.clone()),
                    },
                    audit(
                        &payment,
                        AuditAction::Failed,
                        payment.amount,
                        Some(truncate(reason, MAX_REASON_LEN)),
                        actor,
                        Some(payload),
                    ),
                ]
            }
            (
                CaptureSettlement::Paid {
                    transaction_id,
                    payload,
                },
                None,
            ) => vec![
                Event::PaymentSettled {
                    id: payment.id,
                    status: PaymentStatus::Paid,
                    transaction_ref: Some(transaction_id),
                    gateway_payload: Some(payload.clone()),
                },
                Event::BookingPaymentStatusChanged {
                    id: booking.id,
                    payment_status: PaymentStatus::Paid,
                    at,
                },
                audit(&payment, AuditAction::Captured, payment.amount, None, actor, Some(payload)),
            ],
            (CaptureSettlement::Failed { message, payload }, _) => vec![
                Event::PaymentSettled {
                    id: payment.id,
                    status: PaymentStatus::Failed,
                    transaction_ref: None,
                    gateway_payload: Some(payload.clone()),
                },
                Event::BookingPaymentStatusChanged {
                    id: booking.id,
                    payment_status: PaymentStatus::Failed,
                    at,
                },
                audit(
                    &payment,
                    AuditAction::Failed,
                    payment.amount,
                    Some(truncate(message, MAX_REASON_LEN)),
                    actor,
                    Some(payload),
                ),
            ],
        };
        self.persist_and_apply(&commit, &mut [], &mut [&mut *booking], &mut [&mut *payment])
            .await?;
        self.metrics.increment(
            PAYMENTS_TOTAL,
            &[
                ("method", payment.method.as_str()),
                ("status", payment.status.as_str()),
                ("currency", payment.currency.as_str()),
            ],
        );
        info!(payment = %payment.id, status = %payment.status, "payment settled");
        Ok(payment.clone())
    }

    /// Validate a refund request against current state. Returns the payment
    /// and the amount to refund.
    pub async fn prepare_refund(
        &self,
        principal: &Principal,
        payment_id: Ulid,
        amount: Option<Decimal>,
    ) -> Result<(Payment, Decimal), EngineError> {
        let payment = self
            .payment_snapshot(payment_id)
            .await
            .filter(|p| principal.can_access(p.user_id))
            .ok_or_else(|| EngineError::not_found("payment", payment_id))?;
        if payment.status != PaymentStatus::Paid {
            return Err(EngineError::validation("Payment not in paid status"));
        }
        let amount = amount.unwrap_or(payment.amount);
        if amount <= Decimal::ZERO || amount > payment.amount {
            return Err(EngineError::validation(format!(
                "Refund amount must be greater than 0 and at most {}",
                payment.amount
            )));
        }
        Ok((payment, amount))
    }

    /// Apply a refund the gateway accepted: payment Refunded, booking
    /// payment status Refunded, booking Cancelled unless already Completed.
    pub async fn settle_refund(
        &self,
        principal: &Principal,
        payment_id: Ulid,
        amount: Decimal,
        reason: String,
        payload: String,
    ) -> Result<Payment, EngineError> {
        let booking_id = self
            .payment_snapshot(payment_id)
            .await
            .map(|p| p.booking_id)
            .ok_or_else(|| EngineError::not_found("payment", payment_id))?;

        let _gate = self.commit_gate.read().await;
        let (mut space, mut booking) = self.lock_booking(booking_id).await?;
        let mut payment = self
            .payment_arc(&payment_id)
            .ok_or_else(|| EngineError::not_found("payment", payment_id))?
            .lock_owned()
            .await;
        if payment.status != PaymentStatus::Paid {
            return Err(EngineError::InvalidState(format!(
                "payment is {} and can no longer be refunded",
                payment.status
            )));
        }

        let at = now_ms();
        let mut commit = vec![
            Event::PaymentSettled {
                id: payment.id,
                status: PaymentStatus::Refunded,
                transaction_ref: None,
                gateway_payload: Some(payload.clone()),
            },
            Event::BookingPaymentStatusChanged {
                id: booking.id,
                payment_status: PaymentStatus::Refunded,
                at,
            },
        ];
        if booking.status.is_active() {
            commit.push(Event::BookingStatusChanged {
                id: booking.id,
                space_id: booking.space_id,
                status: BookingStatus::Cancelled,
                at,
            });
        }
        commit.push(audit(
            &payment,
            AuditAction::Refunded,
            amount,
            Some(truncate(reason, MAX_REASON_LEN)),
            Some(principal.user_id),
            Some(payload),
        ));

        let mut spaces: Vec<&mut SpaceState> = space.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&commit, &mut spaces, &mut [&mut *booking], &mut [&mut *payment])
            .await?;
        self.metrics.increment(
            PAYMENTS_TOTAL,
            &[
                ("method", payment.method.as_str()),
                ("status", payment.status.as_str()),
                ("currency", payment.currency.as_str()),
            ],
        );
        info!(payment = %payment.id, %amount, "payment refunded");
        Ok(payment.clone())
    }

    /// Status pushed by the gateway. The payment is found by transaction id,
    /// or by `reference` (our payment id, echoed from the capture request)
    /// when the capture outcome never reached us. Paid and Failed cascade to
    /// the booking's payment status; every delivery leaves an audit row.
    pub async fn apply_payment_webhook(
        &self,
        transaction_id: &str,
        reference: Option<Ulid>,
        status: PaymentStatus,
        payload: String,
    ) -> Result<WebhookOutcome, EngineError> {
        let payment_id = self
            .transactions
            .get(transaction_id)
            .map(|e| *e.value())
            .or_else(|| reference.filter(|id| self.payments.contains_key(id)))
            .ok_or_else(|| EngineError::not_found("payment", transaction_id))?;

        let _gate = self.commit_gate.read().await;
        let (mut booking, mut payment) = self.lock_payment(payment_id).await?;
        if payment
            .transaction_ref
            .as_deref()
            .is_some_and(|known| known != transaction_id)
        {
            return Err(EngineError::not_found("payment", transaction_id));
        }
        let previous = payment.status;
        let learned = (payment.transaction_ref.is_none() && !transaction_id.is_empty())
            .then(|| transaction_id.to_string());
        let duplicate_of = if status == PaymentStatus::Paid && previous != PaymentStatus::Paid {
            self.paid_sibling(booking.id, payment.id).await
        } else {
            None
        };

        let (current, reason) = match duplicate_of {
            Some(other) => {
                warn!(payment = %payment.id, %other, transaction_id, "duplicate capture reported by webhook; refund required");
                (
                    previous,
                    format!(
                        "Duplicate capture {transaction_id}: booking already paid by payment {other}; refund required"
                    ),
                )
            }
            None => (status, format!("Webhook update from {previous} to {status}")),
        };
        let mut commit = vec![Event::PaymentSettled {
            id: payment.id,
            status: current,
            transaction_ref: learned,
            gateway_payload: Some(payload.clone()),
        }];
        if duplicate_of.is_none() && matches!(status, PaymentStatus::Paid | PaymentStatus::Failed) {
            commit.push(Event::BookingPaymentStatusChanged {
                id: booking.id,
                payment_status: status,
                at: now_ms(),
            });
        }
        commit.push(audit(
            &payment,
            AuditAction::Webhook(status),
            payment.amount,
            Some(truncate(reason, MAX_REASON_LEN)),
            None,
            Some(payload),
        ));
        self.persist_and_apply(&commit, &mut [], &mut [&mut *booking], &mut [&mut *payment])
            .await?;
        info!(payment = %payment.id, from = %previous, to = %current, "payment webhook applied");
        Ok(WebhookOutcome {
            payment_id,
            previous,
            current,
        })
    }
}
