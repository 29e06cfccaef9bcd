use std::sync::atomic::Ordering;

use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::auth::Principal;
use crate::limits::{MAX_POLICIES, MAX_POLICY_HOURS};
use crate::model::*;
use crate::observability::{BOOKING_TRANSITIONS_TOTAL, BOOKINGS_TOTAL};

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::policy::{self, Candidate};
use super::pricing::quote;
use super::{Engine, EngineError};

/// A booking request after the principal has been resolved.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub user_id: Ulid,
    pub venue_id: Ulid,
    pub space_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub company_id: Option<Ulid>,
}

/// Fields a Pending booking may change. `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct BookingPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub space_id: Option<Ulid>,
    pub company_id: Option<Ulid>,
}

impl Engine {
    fn record_outcome(&self, result: &Result<Booking, EngineError>) {
        let outcome = match result {
            Ok(_) => "created",
            Err(EngineError::Conflict(_)) => "conflict",
            Err(EngineError::PolicyViolation(_)) => "policy_violation",
            Err(_) => "rejected",
        };
        self.metrics.increment(BOOKINGS_TOTAL, &[("outcome", outcome)]);
    }

    /// Active policies scoped to the venue or the space, in creation order.
    pub(super) fn policies_for(&self, venue_id: Ulid, space_id: Option<Ulid>) -> Vec<BookingPolicy> {
        let mut out: Vec<BookingPolicy> = self
            .policies
            .iter()
            .filter(|p| policy::applies_to(p.value(), venue_id, space_id))
            .map(|p| p.value().clone())
            .collect();
        out.sort_by_key(|p| p.seq);
        out
    }

    fn check_policies(&self, candidate: &Candidate, now: Ms) -> Result<(), EngineError> {
        let policies = self.policies_for(candidate.venue_id, candidate.space_id);
        policy::evaluate(&policies, candidate, now).map_err(EngineError::PolicyViolation)
    }

    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let result = self.create_booking_inner(req).await;
        self.record_outcome(&result);
        result
    }

    async fn create_booking_inner(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let span = validate_span(req.start, req.end)?;
        let now = now_ms();
        if span.start < now {
            return Err(EngineError::validation("Booking cannot be in the past"));
        }
        let candidate = Candidate {
            venue_id: req.venue_id,
            space_id: req.space_id,
            span,
            company_id: req.company_id,
        };

        let _gate = self.commit_gate.read().await;
        let mut guards = match req.space_id {
            Some(sid) => self.lock_spaces(&[sid]).await?,
            None => Vec::new(),
        };

        let mut total_price = Decimal::ZERO;
        if let Some(space) = guards.first() {
            if space.info.venue_id != req.venue_id {
                return Err(EngineError::validation(
                    "Space does not belong to the selected venue",
                ));
            }
            check_no_conflict(space, &span, None)?;
            total_price = quote(&space.info, &span);
        }
        self.check_policies(&candidate, now)?;

        let booking = Booking {
            id: Ulid::new(),
            user_id: req.user_id,
            venue_id: req.venue_id,
            space_id: req.space_id,
            span,
            status: BookingStatus::Pending,
            total_price,
            payment_status: PaymentStatus::Pending,
            company_id: req.company_id,
            iot_verified: false,
            actual_start: None,
            actual_end: None,
            created_at: now,
            updated_at: now,
        };
        let mut spaces: Vec<&mut SpaceState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&[Event::BookingCreated(booking.clone())], &mut spaces, &mut [], &mut [])
            .await?;
        info!(booking = %booking.id, user = %booking.user_id, price = %booking.total_price, "booking created");
        Ok(booking)
    }

    /// Reschedule, move, or re-scope a Pending booking. Re-runs every
    /// creation check against the new shape, excluding the booking itself.
    pub async fn update_booking(
        &self,
        principal: &Principal,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        let arc = self
            .booking(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let _gate = self.commit_gate.read().await;

        loop {
            let from_space = arc.lock().await.space_id;
            let to_space = patch.space_id.or(from_space);
            let ids: Vec<Ulid> = from_space.into_iter().chain(to_space).collect();
            let mut guards = self.lock_spaces(&ids).await?;
            let mut booking = arc.clone().lock_owned().await;
            if booking.space_id != from_space {
                continue;
            }

            if !principal.can_access(booking.user_id) {
                return Err(EngineError::not_found("booking", id));
            }
            if booking.status != BookingStatus::Pending {
                return Err(EngineError::InvalidState(
                    "Cannot modify confirmed booking".into(),
                ));
            }

            let now = now_ms();
            let span = validate_span(
                patch.start.unwrap_or(booking.span.start),
                patch.end.unwrap_or(booking.span.end),
            )?;
            if (patch.start.is_some() || patch.end.is_some()) && span.start < now {
                return Err(EngineError::validation("Start time cannot be in the past"));
            }
            let company_id = patch.company_id.or(booking.company_id);

            let mut total_price = Decimal::ZERO;
            if let Some(sid) = to_space
                && let Some(space) = guards.iter().find(|g| g.info.id == sid)
            {
                if space.info.venue_id != booking.venue_id {
                    return Err(EngineError::validation(
                        "Space does not belong to the selected venue",
                    ));
                }
                check_no_conflict(space, &span, Some(id))?;
                total_price = quote(&space.info, &span);
            }
            self.check_policies(
                &Candidate {
                    venue_id: booking.venue_id,
                    space_id: to_space,
                    span,
                    company_id,
                },
                now,
            )?;

            let event = Event::BookingRescheduled {
                id,
                from_space,
                space_id: to_space,
                span,
                company_id,
                total_price,
                at: now,
            };
            let mut spaces: Vec<&mut SpaceState> = guards.iter_mut().map(|g| &mut **g).collect();
            self.persist_and_apply(&[event], &mut spaces, &mut [&mut *booking], &mut [])
                .await?;
            info!(booking = %id, "booking updated");
            return Ok(booking.clone());
        }
    }

    /// Cancel anything but a Completed booking. Cancelling twice is a no-op.
    pub async fn cancel_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (mut space, mut booking) = self.lock_booking(id).await?;
        if !principal.can_access(booking.user_id) {
            return Err(EngineError::not_found("booking", id));
        }
        match booking.status {
            BookingStatus::Cancelled => return Ok(booking.clone()),
            BookingStatus::Completed => {
                return Err(EngineError::InvalidState(
                    "Completed bookings cannot be cancelled".into(),
                ));
            }
            BookingStatus::Pending | BookingStatus::Confirmed => {}
        }
        self.transition(&mut space, &mut booking, BookingStatus::Cancelled)
            .await?;
        Ok(booking.clone())
    }

    /// Pending → Confirmed, only once the booking has been paid for.
    pub async fn confirm_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (mut space, mut booking) = self.lock_booking(id).await?;
        if !principal.can_access(booking.user_id) || booking.status != BookingStatus::Pending {
            return Err(EngineError::not_found("booking", id));
        }
        if booking.payment_status != PaymentStatus::Paid {
            return Err(EngineError::PaymentRequired);
        }
        self.transition(&mut space, &mut booking, BookingStatus::Confirmed)
            .await?;
        Ok(booking.clone())
    }

    /// Confirmed → Completed once the booked interval is over. Returns
    /// `false` when the booking is not (yet) eligible.
    pub async fn complete_booking(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (mut space, mut booking) = self.lock_booking(id).await?;
        if booking.status != BookingStatus::Confirmed || booking.span.end > now {
            return Ok(false);
        }
        self.transition(&mut space, &mut booking, BookingStatus::Completed)
            .await?;
        Ok(true)
    }

    /// Complete every Confirmed booking whose end has passed.
    pub async fn complete_elapsed(&self, now: Ms) -> Result<usize, EngineError> {
        let candidates: Vec<_> = self
            .bookings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut due = Vec::new();
        for (id, arc) in candidates {
            let b = arc.lock().await;
            if b.status == BookingStatus::Confirmed && b.span.end <= now {
                due.push(id);
            }
        }
        let mut completed = 0;
        for id in due {
            if self.complete_booking(id, now).await? {
                completed += 1;
            }
        }
        Ok(completed)
    }

    async fn transition(
        &self,
        space: &mut Option<tokio::sync::OwnedRwLockWriteGuard<SpaceState>>,
        booking: &mut Booking,
        to: BookingStatus,
    ) -> Result<(), EngineError> {
        let event = Event::BookingStatusChanged {
            id: booking.id,
            space_id: booking.space_id,
            status: to,
            at: now_ms(),
        };
        let mut spaces: Vec<&mut SpaceState> = space.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&[event], &mut spaces, &mut [&mut *booking], &mut [])
            .await?;
        self.metrics
            .increment(BOOKING_TRANSITIONS_TOTAL, &[("to", to.as_str())]);
        info!(booking = %booking.id, status = %to, "booking status changed");
        Ok(())
    }

    // ── Inventory & policy registration ─────────────────────

    /// Insert or replace a space's inventory record.
    pub async fn register_space(&self, info: SpaceInfo) -> Result<SpaceInfo, EngineError> {
        if info.hourly_rate.is_some_and(|r| r.is_sign_negative())
            || info.daily_rate.is_some_and(|r| r.is_sign_negative())
        {
            return Err(EngineError::validation("rates must not be negative"));
        }
        let _gate = self.commit_gate.read().await;
        let existing = self.space(&info.id);
        let mut guard = match &existing {
            Some(space) => Some(space.clone().write_owned().await),
            None => None,
        };
        if let Some(g) = &guard
            && g.info.venue_id != info.venue_id
            && !g.active.is_empty()
        {
            return Err(EngineError::InvalidState(
                "space has active bookings and cannot change venue".into(),
            ));
        }
        let mut spaces: Vec<&mut SpaceState> = guard.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&[Event::SpaceRegistered(info.clone())], &mut spaces, &mut [], &mut [])
            .await?;
        Ok(info)
    }

    pub async fn add_policy(
        &self,
        venue_id: Option<Ulid>,
        space_id: Option<Ulid>,
        rule: PolicyRule,
    ) -> Result<BookingPolicy, EngineError> {
        if venue_id.is_none() && space_id.is_none() {
            return Err(EngineError::validation(
                "a policy needs a venue or a space scope",
            ));
        }
        let hours = match rule {
            PolicyRule::AdvanceBooking { min_hours } => Some(min_hours),
            PolicyRule::MaxDuration { max_hours } => Some(max_hours),
            PolicyRule::CorporateOnly => None,
        };
        if hours.is_some_and(|h| h > MAX_POLICY_HOURS) {
            return Err(EngineError::LimitExceeded("policy hours"));
        }
        if matches!(rule, PolicyRule::MaxDuration { max_hours: 0 }) {
            return Err(EngineError::validation("max_hours must be positive"));
        }
        if self.policies.len() >= MAX_POLICIES {
            return Err(EngineError::LimitExceeded("too many policies"));
        }

        let _gate = self.commit_gate.read().await;
        let policy = BookingPolicy {
            id: Ulid::new(),
            venue_id,
            space_id,
            rule,
            active: true,
            seq: self.policy_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.persist_and_apply(&[Event::PolicyAdded(policy.clone())], &mut [], &mut [], &mut [])
            .await?;
        info!(policy = %policy.id, rule = policy.rule.label(), "policy added");
        Ok(policy)
    }

    pub async fn deactivate_policy(&self, id: Ulid) -> Result<BookingPolicy, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut policy = self
            .policies
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| EngineError::not_found("policy", id))?;
        if policy.active {
            self.persist_and_apply(&[Event::PolicyDeactivated { id }], &mut [], &mut [], &mut [])
                .await?;
            policy.active = false;
        }
        Ok(policy)
    }
}
