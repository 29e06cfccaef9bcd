use rust_decimal::Decimal;
use serde::Serialize;
use ulid::Ulid;

use crate::auth::Principal;
use crate::model::*;

use super::conflict::{has_conflict, now_ms, validate_span};
use super::pricing::quote;
use super::{Engine, EngineError, SharedSpace};

/// A space with no active booking in the requested window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableSpace {
    pub space_id: Ulid,
    pub hourly_rate: Option<Decimal>,
    pub daily_rate: Option<Decimal>,
    /// What booking the window would cost.
    pub quote: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentBooking {
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub end: Ms,
}

/// Live view of a space: last reported head count, the booking running
/// now, and the most recent environmental snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccupancyStatus {
    pub space_id: Ulid,
    pub venue_id: Ulid,
    pub current_occupancy: u32,
    pub last_updated: Option<Ms>,
    pub current_booking: Option<CurrentBooking>,
    pub environment: Option<EnvironmentalRecord>,
}

impl Engine {
    pub async fn get_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        let arc = self
            .booking(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let booking = arc.lock().await.clone();
        if !principal.can_access(booking.user_id) {
            return Err(EngineError::not_found("booking", id));
        }
        Ok(booking)
    }

    /// The principal's bookings, newest first. Admins see every booking.
    pub async fn list_bookings(
        &self,
        principal: &Principal,
        status: Option<BookingStatus>,
    ) -> Vec<Booking> {
        let arcs: Vec<_> = if principal.is_admin() {
            self.bookings.iter().map(|e| e.value().clone()).collect()
        } else {
            let ids = self
                .user_bookings
                .get(&principal.user_id)
                .map(|ids| ids.value().clone())
                .unwrap_or_default();
            ids.iter().filter_map(|id| self.booking(id)).collect()
        };
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let b = arc.lock().await;
            if status.is_none_or(|s| b.status == s) {
                out.push(b.clone());
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Spaces of a venue (or just `space_id`) free for the whole window.
    pub async fn availability(
        &self,
        venue_id: Ulid,
        space_id: Option<Ulid>,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<AvailableSpace>, EngineError> {
        let span = validate_span(start, end)?;
        if span.start < now_ms() {
            return Err(EngineError::validation("Start time cannot be in the past"));
        }

        let mut candidates: Vec<(Ulid, SharedSpace)> = self
            .spaces
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .filter(|(id, _)| space_id.is_none_or(|want| *id == want))
            .collect();
        candidates.sort_by_key(|(id, _)| *id);

        let mut venue_seen = false;
        let mut out = Vec::new();
        for (_, arc) in candidates {
            let space = arc.read().await;
            if space.info.venue_id != venue_id {
                continue;
            }
            venue_seen = true;
            if !has_conflict(&space, &span, None) {
                out.push(AvailableSpace {
                    space_id: space.info.id,
                    hourly_rate: space.info.hourly_rate,
                    daily_rate: space.info.daily_rate,
                    quote: quote(&space.info, &span),
                });
            }
        }
        if !venue_seen && space_id.is_none() {
            return Err(EngineError::not_found("venue", venue_id));
        }
        Ok(out)
    }

    pub async fn get_payment(&self, principal: &Principal, id: Ulid) -> Result<Payment, EngineError> {
        self.payment_snapshot(id)
            .await
            .filter(|p| principal.can_access(p.user_id))
            .ok_or_else(|| EngineError::not_found("payment", id))
    }

    /// Audit rows for a payment, oldest first.
    pub async fn audit_trail(
        &self,
        principal: &Principal,
        payment_id: Ulid,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        self.get_payment(principal, payment_id).await?;
        Ok(self
            .audit
            .get(&payment_id)
            .map(|rows| rows.value().clone())
            .unwrap_or_default())
    }

    pub async fn verification(
        &self,
        principal: &Principal,
        booking_id: Ulid,
    ) -> Result<BookingVerification, EngineError> {
        self.get_booking(principal, booking_id).await?;
        self.verifications
            .get(&booking_id)
            .map(|v| v.value().clone())
            .ok_or_else(|| EngineError::not_found("verification", booking_id))
    }

    pub async fn occupancy_status(&self, space_id: Ulid) -> Result<OccupancyStatus, EngineError> {
        let arc = self
            .space(&space_id)
            .ok_or_else(|| EngineError::not_found("space", space_id))?;
        let now = now_ms();
        let (venue_id, latest, running) = {
            let space = arc.read().await;
            let latest = space.occupancy.last().map(|e| (e.count, e.timestamp));
            let running = space.confirmed_around(now, 0).next().map(|s| s.booking_id);
            (space.info.venue_id, latest, running)
        };

        let mut current_booking = None;
        if let Some(id) = running
            && let Some(b) = self.booking(&id)
        {
            let b = b.lock().await;
            current_booking = Some(CurrentBooking {
                booking_id: b.id,
                user_id: b.user_id,
                end: b.span.end,
            });
        }

        let environment = self
            .environment
            .iter()
            .filter(|r| r.key().0 == space_id)
            .max_by_key(|r| r.key().1)
            .map(|r| r.value().clone());

        Ok(OccupancyStatus {
            space_id,
            venue_id,
            current_occupancy: latest.map(|(count, _)| count).unwrap_or(0),
            last_updated: latest.map(|(_, ts)| ts),
            current_booking,
            environment,
        })
    }

    /// Occupancy events for a space at or after `since`, newest first.
    pub async fn occupancy_events(
        &self,
        space_id: Ulid,
        since: Ms,
    ) -> Result<Vec<OccupancyEvent>, EngineError> {
        let arc = self
            .space(&space_id)
            .ok_or_else(|| EngineError::not_found("space", space_id))?;
        let space = arc.read().await;
        let mut out = space.occupancy_between(since, Ms::MAX).to_vec();
        out.reverse();
        Ok(out)
    }

    pub fn list_sensors(&self, venue_id: Option<Ulid>) -> Vec<Sensor> {
        let mut out: Vec<Sensor> = self
            .sensors
            .iter()
            .filter(|s| venue_id.is_none_or(|v| s.venue_id == v))
            .map(|s| s.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Readings of a sensor taken at or after `since`, newest first.
    pub fn sensor_readings(&self, sensor_id: Ulid, since: Ms) -> Result<Vec<SensorReading>, EngineError> {
        if !self.sensors.contains_key(&sensor_id) {
            return Err(EngineError::not_found("sensor", sensor_id));
        }
        let mut out: Vec<SensorReading> = self
            .readings
            .get(&sensor_id)
            .map(|r| r.iter().filter(|r| r.timestamp >= since).cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    pub fn list_policies(&self) -> Vec<BookingPolicy> {
        let mut out: Vec<BookingPolicy> = self.policies.iter().map(|p| p.value().clone()).collect();
        out.sort_by_key(|p| p.seq);
        out
    }

    pub async fn space_info(&self, id: Ulid) -> Result<SpaceInfo, EngineError> {
        let arc = self
            .space(&id)
            .ok_or_else(|| EngineError::not_found("space", id))?;
        let info = arc.read().await.info.clone();
        Ok(info)
    }
}
