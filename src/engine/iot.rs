use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::{MAX_EXTERNAL_ID_LEN, MAX_METADATA_BYTES, MAX_UNIT_LEN, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;
use crate::observability::{IOT_READINGS_TOTAL, VERIFICATIONS_TOTAL};

use super::conflict::now_ms;
use super::verification;
use super::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct SensorSpec {
    pub external_id: String,
    pub venue_id: Ulid,
    pub space_id: Option<Ulid>,
    pub kind: SensorKind,
}

/// One reading as delivered by the sensor webhook.
#[derive(Debug, Clone)]
pub struct ReadingInput {
    pub sensor_external_id: String,
    pub sensor_type: SensorKind,
    pub timestamp: Ms,
    pub value: f64,
    pub unit: String,
    pub metadata: Value,
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Entry/Exit only when the sensor also reports motion.
pub(crate) fn classify(count: u32, metadata: &Value) -> OccupancyKind {
    if truthy(metadata.get("motion_detected")) {
        if count > 0 {
            OccupancyKind::Entry
        } else {
            OccupancyKind::Exit
        }
    } else {
        OccupancyKind::OccupancyChange
    }
}

fn utc_day(ts: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(ts)
        .unwrap_or_default()
        .date_naive()
}

impl Engine {
    pub async fn register_sensor(&self, spec: SensorSpec) -> Result<Sensor, EngineError> {
        if spec.external_id.is_empty() || spec.external_id.len() > MAX_EXTERNAL_ID_LEN {
            return Err(EngineError::validation(format!(
                "sensor id must be 1..={MAX_EXTERNAL_ID_LEN} bytes"
            )));
        }
        if let Some(sid) = spec.space_id {
            let space = self
                .space(&sid)
                .ok_or_else(|| EngineError::not_found("space", sid))?;
            if space.read().await.info.venue_id != spec.venue_id {
                return Err(EngineError::validation(
                    "Space does not belong to the selected venue",
                ));
            }
        }

        let _gate = self.commit_gate.read().await;
        if self.sensor_ids.contains_key(&spec.external_id) {
            return Err(EngineError::validation(format!(
                "sensor {} is already registered",
                spec.external_id
            )));
        }
        let sensor = Sensor {
            id: Ulid::new(),
            external_id: spec.external_id,
            venue_id: spec.venue_id,
            space_id: spec.space_id,
            kind: spec.kind,
            active: true,
            last_heartbeat: None,
        };
        self.persist_and_apply(&[Event::SensorRegistered(sensor.clone())], &mut [], &mut [], &mut [])
            .await?;
        info!(sensor = %sensor.id, external_id = %sensor.external_id, "sensor registered");
        Ok(sensor)
    }

    pub async fn set_sensor_active(&self, id: Ulid, active: bool) -> Result<Sensor, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut sensor = self
            .sensors
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| EngineError::not_found("sensor", id))?;
        if sensor.active != active {
            sensor.active = active;
            self.persist_and_apply(&[Event::SensorRegistered(sensor.clone())], &mut [], &mut [], &mut [])
                .await?;
        }
        Ok(sensor)
    }

    /// Store a reading, then route it: occupancy readings feed booking
    /// verification, environmental readings update the space's daily record.
    /// Everything one reading causes lands in a single commit.
    pub async fn ingest_reading(&self, input: ReadingInput) -> Result<Ulid, EngineError> {
        if !input.value.is_finite() {
            return Err(EngineError::validation("value must be a finite number"));
        }
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&input.timestamp) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if input.unit.len() > MAX_UNIT_LEN {
            return Err(EngineError::LimitExceeded("unit too long"));
        }
        let metadata = input.metadata.to_string();
        if metadata.len() > MAX_METADATA_BYTES {
            return Err(EngineError::LimitExceeded("metadata too large"));
        }

        let sensor = self
            .sensor_ids
            .get(&input.sensor_external_id)
            .and_then(|id| self.sensors.get(id.value()).map(|s| s.value().clone()))
            .filter(|s| s.active)
            .ok_or_else(|| EngineError::not_found("sensor", &input.sensor_external_id))?;

        let now = now_ms();
        let reading = SensorReading {
            id: Ulid::new(),
            sensor_id: sensor.id,
            timestamp: input.timestamp,
            value: input.value,
            unit: input.unit.clone(),
            metadata: metadata.clone(),
        };
        let data_id = reading.id;
        let mut commit = vec![Event::SensorReadingStored {
            reading,
            heartbeat: Some(now),
        }];

        let _gate = self.commit_gate.read().await;
        let Some(space_id) = sensor.space_id else {
            self.persist_and_apply(&commit, &mut [], &mut [], &mut []).await?;
            self.count_reading(input.sensor_type);
            return Ok(data_id);
        };
        let mut guards = self.lock_spaces(&[space_id]).await?;
        let Some(space) = guards.first_mut() else {
            return Err(EngineError::not_found("space", space_id));
        };

        let mut held: Vec<OwnedMutexGuard<Booking>> = Vec::new();
        match input.sensor_type {
            SensorKind::Occupancy => {
                if input.value < 0.0 {
                    return Err(EngineError::validation("occupancy count must not be negative"));
                }
                let count = input.value.min(u32::MAX as f64) as u32;
                held = self
                    .correlate_occupancy(&**space, &input, count, metadata, now, &mut commit)
                    .await;
            }
            kind => {
                commit.push(self.environment_update(space_id, kind, &input, now));
            }
        }

        let mut bookings: Vec<&mut Booking> = held.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&commit, &mut [&mut **space], &mut bookings, &mut [])
            .await?;
        self.count_reading(input.sensor_type);
        for event in &commit {
            if let Event::VerificationUpdated(v) = event {
                self.metrics
                    .increment(VERIFICATIONS_TOTAL, &[("status", v.status.as_str())]);
                info!(booking = %v.booking_id, status = v.status.as_str(), "booking verification updated");
            }
        }
        Ok(data_id)
    }

    fn count_reading(&self, kind: SensorKind) {
        self.metrics
            .increment(IOT_READINGS_TOTAL, &[("sensor_type", kind.as_str())]);
    }

    /// Build the occupancy event and re-evaluate every confirmed booking it
    /// bears on. Returns the booking locks the commit needs.
    async fn correlate_occupancy(
        &self,
        space: &SpaceState,
        input: &ReadingInput,
        count: u32,
        metadata: String,
        now: Ms,
        commit: &mut Vec<Event>,
    ) -> Vec<OwnedMutexGuard<Booking>> {
        let watch = self.settings.overstay_watch;
        let mut event = OccupancyEvent {
            id: Ulid::new(),
            space_id: space.info.id,
            kind: classify(count, &input.metadata),
            count,
            timestamp: input.timestamp,
            booking_id: None,
            metadata,
        };

        let mut affected: Vec<(Ulid, Span)> = space
            .confirmed_around(input.timestamp, watch)
            .map(|slot| (slot.booking_id, slot.span))
            .collect();
        affected.sort_by_key(|(id, _)| *id);
        if let Some(freeze) = self.settings.freeze_after {
            affected.retain(|(id, span)| {
                let frozen = now > span.end + freeze;
                if frozen {
                    debug!(booking = %id, "verification frozen; event ignored");
                }
                !frozen
            });
        }

        // The event belongs to the booking whose closed interval contains it.
        event.booking_id = affected
            .iter()
            .filter(|(_, span)| span.contains_closed(input.timestamp))
            .map(|(id, _)| *id)
            .last();

        let mut held = Vec::with_capacity(affected.len());
        let mut verdicts = Vec::with_capacity(affected.len());
        for (booking_id, span) in &affected {
            let Some(arc) = self.booking(booking_id) else {
                continue;
            };
            let guard = arc.lock_owned().await;

            let mut window: Vec<OccupancyEvent> = space
                .occupancy_between(span.start, span.end + watch)
                .to_vec();
            let pos = window.partition_point(|e| e.timestamp <= event.timestamp);
            window.insert(pos, event.clone());

            let prior = self
                .verifications
                .get(booking_id)
                .map(|v| v.value().clone())
                .unwrap_or_else(|| BookingVerification::pending(*booking_id));
            let next = verification::evaluate(&prior, span, &window, now);
            verdicts.push(Event::BookingUsageRecorded {
                id: *booking_id,
                actual_start: next.actual_start,
                actual_end: next.actual_end,
                at: now,
            });
            verdicts.push(Event::VerificationUpdated(next));
            held.push(guard);
        }

        commit.push(Event::OccupancyRecorded(event));
        commit.extend(verdicts);
        held
    }

    fn environment_update(&self, space_id: Ulid, kind: SensorKind, input: &ReadingInput, now: Ms) -> Event {
        let day = utc_day(input.timestamp);
        let mut record = self
            .environment
            .get(&(space_id, day))
            .map(|r| r.value().clone())
            .unwrap_or(EnvironmentalRecord {
                space_id,
                day,
                temperature: None,
                humidity: None,
                air_quality_index: None,
                noise_level: None,
                updated_at: now,
            });
        match kind {
            SensorKind::Temperature => record.temperature = Some(input.value),
            SensorKind::Humidity => record.humidity = Some(input.value),
            SensorKind::AirQuality => record.air_quality_index = Some(input.value.round() as i32),
            SensorKind::NoiseLevel => record.noise_level = Some(input.value),
            SensorKind::Occupancy => {}
        }
        record.updated_at = now;
        Event::EnvironmentUpdated(record)
    }
}
