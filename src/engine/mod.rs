mod bookings;
mod conflict;
mod error;
mod iot;
mod payments;
mod policy;
mod pricing;
mod queries;
pub mod verification;

pub use bookings::{BookingPatch, NewBooking};
pub use conflict::{has_conflict, now_ms};
pub use error::{EngineError, PolicyViolation};
pub use iot::{ReadingInput, SensorSpec};
pub use payments::{CaptureSettlement, PaymentDraft, WebhookOutcome};
pub use policy::Candidate;
pub use pricing::quote;
pub use queries::{AvailableSpace, CurrentBooking, OccupancyStatus};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{self, Metrics};
use crate::wal::{Commit, Wal};

pub type SharedSpace = Arc<RwLock<SpaceState>>;
pub type SharedBooking = Arc<Mutex<Booking>>;
pub type SharedPayment = Arc<Mutex<Payment>>;

/// Tunables for the IoT reconciliation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// How long after a booking's end occupancy events still re-evaluate it.
    pub overstay_watch: Ms,
    /// Once `now > end + freeze_after`, a verification no longer changes.
    pub freeze_after: Option<Ms>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            overstay_watch: 60 * MINUTE,
            freeze_after: None,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Commit, oneshot::Sender<io::Result<()>>);

/// Commands taken off the channel per wake-up.
const WAL_BATCH_LIMIT: usize = 256;

/// Owns the WAL. Appends received together share one fsync; other
/// commands run in arrival order between batches.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>, metrics: Metrics) {
    let mut inbox = Vec::with_capacity(WAL_BATCH_LIMIT);
    let mut batch: Vec<PendingAppend> = Vec::new();
    while rx.recv_many(&mut inbox, WAL_BATCH_LIMIT).await > 0 {
        for cmd in inbox.drain(..) {
            match cmd {
                WalCommand::Append { commit, response } => batch.push((commit, response)),
                WalCommand::Compact { snapshot, response } => {
                    commit_batch(&mut wal, &mut batch, &metrics);
                    let _ = response.send(wal.rewrite(&snapshot));
                }
                WalCommand::AppendsSinceCompact { response } => {
                    commit_batch(&mut wal, &mut batch, &metrics);
                    let _ = response.send(wal.appends_since_compact());
                }
            }
        }
        commit_batch(&mut wal, &mut batch, &metrics);
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>, metrics: &Metrics) {
    if batch.is_empty() {
        return;
    }
    metrics.record(observability::WAL_FLUSH_BATCH_SIZE, batch.len() as f64, &[]);
    let started = Instant::now();
    let staged = batch.iter().try_for_each(|(commit, _)| wal.stage(commit));
    // Sync even after a failed stage so no bytes leak into the next batch.
    let synced = wal.sync();
    metrics.record(
        observability::WAL_FLUSH_DURATION_SECONDS,
        started.elapsed().as_secs_f64(),
        &[],
    );
    let outcome = staged.and(synced);
    for (_, response) in batch.drain(..) {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

pub struct Engine {
    pub(super) spaces: DashMap<Ulid, SharedSpace>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    /// user id → booking ids, creation order.
    pub(super) user_bookings: DashMap<Ulid, Vec<Ulid>>,
    pub(super) policies: DashMap<Ulid, BookingPolicy>,
    pub(super) policy_seq: AtomicU64,
    pub(super) payments: DashMap<Ulid, SharedPayment>,
    /// (user, idempotency key) → payment id.
    pub(super) idempotency: DashMap<(Ulid, String), Ulid>,
    pub(super) idempotency_locks: DashMap<(Ulid, String), Arc<Mutex<()>>>,
    /// Gateway transaction reference → payment id.
    pub(super) transactions: DashMap<String, Ulid>,
    /// booking id → payment attempts, creation order.
    pub(super) booking_payments: DashMap<Ulid, Vec<Ulid>>,
    pub(super) audit: DashMap<Ulid, Vec<AuditEntry>>,
    pub(super) sensors: DashMap<Ulid, Sensor>,
    pub(super) sensor_ids: DashMap<String, Ulid>,
    pub(super) readings: DashMap<Ulid, Vec<SensorReading>>,
    pub(super) verifications: DashMap<Ulid, BookingVerification>,
    pub(super) environment: DashMap<(Ulid, NaiveDate), EnvironmentalRecord>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold a read guard from WAL append until in-memory apply;
    /// compaction takes the write guard so a snapshot never misses a commit.
    pub(super) commit_gate: RwLock<()>,
    pub(super) settings: EngineSettings,
    pub(super) metrics: Metrics,
}

// ── Apply: pure state transitions on already-locked values ───────

/// Apply an event to one space. Events for other spaces are ignored.
fn apply_to_space(space: &mut SpaceState, event: &Event) {
    let sid = space.info.id;
    match event {
        Event::SpaceRegistered(info) if info.id == sid => {
            space.info = info.clone();
        }
        Event::BookingCreated(b) if b.space_id == Some(sid) && b.status.is_active() => {
            let slot = ActiveSlot {
                booking_id: b.id,
                span: b.span,
                confirmed: b.status == BookingStatus::Confirmed,
            };
            if let Err(other) = space.insert_slot(slot) {
                tracing::warn!(booking = %b.id, %other, "overlapping slot in log; skipped");
            }
        }
        Event::BookingCreated(b) if b.space_id == Some(sid) && b.status == BookingStatus::Completed => {
            space.insert_completed(ActiveSlot {
                booking_id: b.id,
                span: b.span,
                confirmed: true,
            });
        }
        Event::BookingRescheduled {
            id,
            from_space,
            space_id,
            span,
            ..
        } => {
            if *from_space == Some(sid) && *space_id != Some(sid) {
                space.remove_slot(*id);
            }
            if *space_id == Some(sid) {
                let slot = ActiveSlot {
                    booking_id: *id,
                    span: *span,
                    confirmed: false,
                };
                if let Err(other) = space.insert_slot(slot) {
                    tracing::warn!(booking = %id, %other, "overlapping slot in log; skipped");
                }
            }
        }
        Event::BookingStatusChanged {
            id,
            space_id: Some(s),
            status,
            ..
        } if *s == sid => {
            if status.is_active() {
                if let Some(slot) = space.slot_mut(*id) {
                    slot.confirmed = *status == BookingStatus::Confirmed;
                }
            } else if *status == BookingStatus::Completed {
                space.retire_slot(*id);
            } else {
                space.remove_slot(*id);
            }
        }
        Event::OccupancyRecorded(e) if e.space_id == sid => {
            space.insert_occupancy(e.clone());
        }
        _ => {}
    }
}

fn apply_to_booking(booking: &mut Booking, event: &Event) {
    match event {
        Event::BookingRescheduled {
            id,
            space_id,
            span,
            company_id,
            total_price,
            at,
            ..
        } if *id == booking.id => {
            booking.space_id = *space_id;
            booking.span = *span;
            booking.company_id = *company_id;
            booking.total_price = *total_price;
            booking.updated_at = *at;
        }
        Event::BookingStatusChanged { id, status, at, .. } if *id == booking.id => {
            booking.status = *status;
            booking.updated_at = *at;
        }
        Event::BookingPaymentStatusChanged {
            id,
            payment_status,
            at,
        } if *id == booking.id => {
            booking.payment_status = *payment_status;
            booking.updated_at = *at;
        }
        Event::BookingUsageRecorded {
            id,
            actual_start,
            actual_end,
            at,
        } if *id == booking.id => {
            booking.actual_start = *actual_start;
            booking.actual_end = *actual_end;
            booking.iot_verified = true;
            booking.updated_at = *at;
        }
        _ => {}
    }
}

fn apply_to_payment(payment: &mut Payment, event: &Event) {
    if let Event::PaymentSettled {
        id,
        status,
        transaction_ref,
        gateway_payload,
    } = event
        && *id == payment.id
    {
        payment.status = *status;
        if transaction_ref.is_some() {
            payment.transaction_ref = transaction_ref.clone();
        }
        if gateway_payload.is_some() {
            payment.gateway_payload = gateway_payload.clone();
        }
    }
}

/// Locks a single event needs during replay.
struct Touched {
    spaces: Vec<Ulid>,
    booking: Option<Ulid>,
    payment: Option<Ulid>,
}

fn touched(event: &Event) -> Touched {
    let mut t = Touched {
        spaces: Vec::new(),
        booking: None,
        payment: None,
    };
    match event {
        Event::SpaceRegistered(info) => t.spaces.push(info.id),
        Event::BookingCreated(b) => t.spaces.extend(b.space_id),
        Event::BookingRescheduled {
            id,
            from_space,
            space_id,
            ..
        } => {
            t.spaces.extend(*from_space);
            t.spaces.extend(*space_id);
            t.booking = Some(*id);
        }
        Event::BookingStatusChanged { id, space_id, .. } => {
            t.spaces.extend(*space_id);
            t.booking = Some(*id);
        }
        Event::BookingPaymentStatusChanged { id, .. } | Event::BookingUsageRecorded { id, .. } => {
            t.booking = Some(*id);
        }
        Event::PaymentSettled { id, .. } => t.payment = Some(*id),
        Event::OccupancyRecorded(e) => t.spaces.push(e.space_id),
        Event::PolicyAdded(_)
        | Event::PolicyDeactivated { .. }
        | Event::PaymentCreated(_)
        | Event::AuditAppended(_)
        | Event::SensorRegistered(_)
        | Event::SensorReadingStored { .. }
        | Event::VerificationUpdated(_)
        | Event::EnvironmentUpdated(_) => {}
    }
    t.spaces.sort();
    t.spaces.dedup();
    t
}

fn contended() -> io::Error {
    io::Error::other("replay: contended state")
}

impl Engine {
    pub fn new(wal_path: PathBuf, settings: EngineSettings, metrics: Metrics) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            tracing::warn!(
                bytes = replay.discarded_bytes,
                path = %wal_path.display(),
                "discarded torn or corrupt WAL tail"
            );
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx, metrics.clone()));

        let engine = Self {
            spaces: DashMap::new(),
            bookings: DashMap::new(),
            user_bookings: DashMap::new(),
            policies: DashMap::new(),
            policy_seq: AtomicU64::new(0),
            payments: DashMap::new(),
            idempotency: DashMap::new(),
            idempotency_locks: DashMap::new(),
            transactions: DashMap::new(),
            booking_payments: DashMap::new(),
            audit: DashMap::new(),
            sensors: DashMap::new(),
            sensor_ids: DashMap::new(),
            readings: DashMap::new(),
            verifications: DashMap::new(),
            environment: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            settings,
            metrics,
        };

        // Sole owner of every Arc here, so try_write/try_lock never contend.
        // Blocking variants would panic if this runs inside a runtime.
        let mut replayed = 0usize;
        for commit in &replay.commits {
            for event in commit {
                engine.replay_event(event)?;
            }
            replayed += 1;
        }
        tracing::info!(
            commits = replayed,
            spaces = engine.spaces.len(),
            bookings = engine.bookings.len(),
            payments = engine.payments.len(),
            "engine state restored"
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let t = touched(event);
        let mut space_guards = Vec::with_capacity(t.spaces.len());
        for id in &t.spaces {
            if let Some(space) = self.space(id) {
                space_guards.push(space.try_write_owned().map_err(|_| contended())?);
            }
        }
        if let Some(id) = t.booking
            && let Some(booking) = self.booking(&id)
        {
            let mut guard = booking.try_lock_owned().map_err(|_| contended())?;
            apply_to_booking(&mut guard, event);
        }
        if let Some(id) = t.payment
            && let Some(payment) = self.payment_arc(&id)
        {
            let mut guard = payment.try_lock_owned().map_err(|_| contended())?;
            apply_to_payment(&mut guard, event);
        }
        for guard in &mut space_guards {
            apply_to_space(guard, event);
        }
        self.apply_indexes(event);
        Ok(())
    }

    /// Maintain the lock-free maps: creation of new entries and everything
    /// that isn't guarded by a space/booking/payment lock.
    fn apply_indexes(&self, event: &Event) {
        match event {
            Event::SpaceRegistered(info) => {
                if !self.spaces.contains_key(&info.id) {
                    let space = SpaceState::new(info.clone());
                    self.spaces.insert(info.id, Arc::new(RwLock::new(space)));
                }
            }
            Event::PolicyAdded(p) => {
                self.policy_seq.fetch_max(p.seq + 1, Ordering::Relaxed);
                self.policies.insert(p.id, p.clone());
            }
            Event::PolicyDeactivated { id } => {
                if let Some(mut p) = self.policies.get_mut(id) {
                    p.active = false;
                }
            }
            Event::BookingCreated(b) => {
                self.bookings.insert(b.id, Arc::new(Mutex::new(b.clone())));
                self.user_bookings.entry(b.user_id).or_default().push(b.id);
            }
            Event::PaymentCreated(p) => {
                self.idempotency
                    .insert((p.user_id, p.idempotency_key.clone()), p.id);
                if let Some(tx) = &p.transaction_ref {
                    self.transactions.insert(tx.clone(), p.id);
                }
                self.booking_payments.entry(p.booking_id).or_default().push(p.id);
                self.payments.insert(p.id, Arc::new(Mutex::new(p.clone())));
            }
            Event::PaymentSettled {
                id,
                transaction_ref: Some(tx),
                ..
            } => {
                self.transactions.insert(tx.clone(), *id);
            }
            Event::AuditAppended(entry) => {
                self.audit
                    .entry(entry.payment_id)
                    .or_default()
                    .push(entry.clone());
            }
            Event::SensorRegistered(sensor) => {
                self.sensor_ids.insert(sensor.external_id.clone(), sensor.id);
                self.sensors.insert(sensor.id, sensor.clone());
            }
            Event::SensorReadingStored { reading, heartbeat } => {
                if let Some(mut sensor) = self.sensors.get_mut(&reading.sensor_id) {
                    sensor.last_heartbeat = sensor.last_heartbeat.max(*heartbeat);
                }
                self.readings
                    .entry(reading.sensor_id)
                    .or_default()
                    .push(reading.clone());
            }
            Event::VerificationUpdated(v) => {
                self.verifications.insert(v.booking_id, v.clone());
            }
            Event::EnvironmentUpdated(rec) => {
                self.environment.insert((rec.space_id, rec.day), rec.clone());
            }
            _ => {}
        }
    }

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply every event to the locked values the caller
    /// holds and to the indexes. The caller must hold a `commit_gate` read guard.
    pub(super) async fn persist_and_apply(
        &self,
        commit: &[Event],
        spaces: &mut [&mut SpaceState],
        bookings: &mut [&mut Booking],
        payments: &mut [&mut Payment],
    ) -> Result<(), EngineError> {
        if commit.is_empty() {
            return Ok(());
        }
        self.wal_append(commit).await?;
        for event in commit {
            for space in spaces.iter_mut() {
                apply_to_space(space, event);
            }
            for booking in bookings.iter_mut() {
                apply_to_booking(booking, event);
            }
            for payment in payments.iter_mut() {
                apply_to_payment(payment, event);
            }
            self.apply_indexes(event);
        }
        Ok(())
    }

    // ── Lookups ───────────────────────────────────────────────

    pub(super) fn space(&self, id: &Ulid) -> Option<SharedSpace> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub(super) fn booking(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub(super) fn payment_arc(&self, id: &Ulid) -> Option<SharedPayment> {
        self.payments.get(id).map(|e| e.value().clone())
    }

    /// Write-lock several spaces in ascending id order.
    pub(super) async fn lock_spaces(
        &self,
        ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<SpaceState>>, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut arcs = Vec::with_capacity(ids.len());
        for id in &ids {
            arcs.push(self.space(id).ok_or_else(|| EngineError::not_found("space", id))?);
        }
        let mut guards = Vec::with_capacity(arcs.len());
        for arc in arcs {
            guards.push(arc.write_owned().await);
        }
        Ok(guards)
    }

    /// Lock a booking together with its current space, in lock order
    /// (space before booking). Retries if the booking moved in between.
    pub(super) async fn lock_booking(
        &self,
        id: Ulid,
    ) -> Result<(Option<OwnedRwLockWriteGuard<SpaceState>>, OwnedMutexGuard<Booking>), EngineError>
    {
        let arc = self
            .booking(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        loop {
            let space_id = arc.lock().await.space_id;
            let space_guard = match space_id {
                Some(sid) => Some(
                    self.space(&sid)
                        .ok_or_else(|| EngineError::not_found("space", sid))?
                        .write_owned()
                        .await,
                ),
                None => None,
            };
            let guard = arc.clone().lock_owned().await;
            if guard.space_id == space_id {
                return Ok((space_guard, guard));
            }
        }
    }

    pub(crate) fn idempotency_lock(&self, user_id: Ulid, key: &str) -> Arc<Mutex<()>> {
        self.idempotency_locks
            .entry((user_id, key.to_string()))
            .or_default()
            .clone()
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    // ── Compaction ────────────────────────────────────────────

    /// Events that rebuild the current state from an empty engine.
    async fn snapshot(&self) -> Vec<Event> {
        let mut out = Vec::new();

        let spaces: Vec<SharedSpace> = self.spaces.iter().map(|e| e.value().clone()).collect();
        let mut occupancy = Vec::new();
        for space in &spaces {
            let guard = space.read().await;
            out.push(Event::SpaceRegistered(guard.info.clone()));
            occupancy.extend(guard.occupancy.iter().cloned().map(Event::OccupancyRecorded));
        }

        let mut policies: Vec<BookingPolicy> =
            self.policies.iter().map(|e| e.value().clone()).collect();
        policies.sort_by_key(|p| p.seq);
        out.extend(policies.into_iter().map(Event::PolicyAdded));

        let sensors: Vec<Sensor> = self.sensors.iter().map(|e| e.value().clone()).collect();
        out.extend(sensors.into_iter().map(Event::SensorRegistered));

        let bookings: Vec<SharedBooking> =
            self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::with_capacity(bookings.len());
        for b in &bookings {
            rows.push(b.lock().await.clone());
        }
        rows.sort_by_key(|b| b.id);
        out.extend(rows.into_iter().map(Event::BookingCreated));

        let payments: Vec<SharedPayment> =
            self.payments.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::with_capacity(payments.len());
        for p in &payments {
            rows.push(p.lock().await.clone());
        }
        rows.sort_by_key(|p| p.id);
        out.extend(rows.into_iter().map(Event::PaymentCreated));

        for entry in self.audit.iter() {
            out.extend(entry.value().iter().cloned().map(Event::AuditAppended));
        }
        for entry in self.readings.iter() {
            out.extend(entry.value().iter().map(|r| Event::SensorReadingStored {
                reading: r.clone(),
                heartbeat: None,
            }));
        }
        out.extend(occupancy);
        out.extend(
            self.verifications
                .iter()
                .map(|v| Event::VerificationUpdated(v.value().clone())),
        );
        out.extend(
            self.environment
                .iter()
                .map(|r| Event::EnvironmentUpdated(r.value().clone())),
        );
        out
    }

    /// Rewrite the WAL as a snapshot of current state. Blocks all mutations
    /// for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let snapshot = self.snapshot().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                snapshot,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
