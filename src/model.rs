use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_BOOKING_SPAN_MS;
use crate::sealed::Sealed;

/// Unix milliseconds (UTC). The only time type inside the engine.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Closed-interval membership: both endpoints count.
    pub fn contains_closed(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

// ── Status enums ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Pending and Confirmed bookings hold their slot.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::Cancelled => "Cancelled",
            BookingStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Paid => "Paid",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Refunded => "Refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" | "captured" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Card,
    Mpesa,
    PayPal,
    Wallet,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Card => "Card",
            PaymentMethod::Mpesa => "Mpesa",
            PaymentMethod::PayPal => "PayPal",
            PaymentMethod::Wallet => "Wallet",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "card" => Ok(PaymentMethod::Card),
            "mpesa" => Ok(PaymentMethod::Mpesa),
            "paypal" => Ok(PaymentMethod::PayPal),
            "wallet" => Ok(PaymentMethod::Wallet),
            other => Err(format!("unsupported payment method: {other}")),
        }
    }
}

// ── Inventory & policy ───────────────────────────────────────────

/// What the inventory collaborator tells us about a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub id: Ulid,
    pub venue_id: Ulid,
    pub hourly_rate: Option<Decimal>,
    pub daily_rate: Option<Decimal>,
}

/// Typed configuration for each policy kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyRule {
    AdvanceBooking { min_hours: u32 },
    MaxDuration { max_hours: u32 },
    CorporateOnly,
}

impl PolicyRule {
    pub fn label(&self) -> &'static str {
        match self {
            PolicyRule::AdvanceBooking { .. } => "advance_booking",
            PolicyRule::MaxDuration { .. } => "max_duration",
            PolicyRule::CorporateOnly => "corporate_only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPolicy {
    pub id: Ulid,
    pub venue_id: Option<Ulid>,
    pub space_id: Option<Ulid>,
    pub rule: PolicyRule,
    pub active: bool,
    /// Creation order; evaluation walks policies by ascending `seq`.
    pub seq: u64,
}

// ── Booking ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub venue_id: Ulid,
    pub space_id: Option<Ulid>,
    pub span: Span,
    pub status: BookingStatus,
    pub total_price: Decimal,
    pub payment_status: PaymentStatus,
    pub company_id: Option<Ulid>,
    pub iot_verified: bool,
    pub actual_start: Option<Ms>,
    pub actual_end: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Slot held by an active booking in its space's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSlot {
    pub booking_id: Ulid,
    pub span: Span,
    pub confirmed: bool,
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub transaction_ref: Option<String>,
    pub status: PaymentStatus,
    pub idempotency_key: String,
    /// Last gateway response body, kept verbatim as JSON text.
    pub gateway_payload: Option<String>,
    pub card_last4: Option<Sealed>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Initiated,
    Captured,
    Failed,
    Refunded,
    Cancelled,
    /// Status pushed by the gateway's callback.
    Webhook(PaymentStatus),
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::Initiated => f.write_str("INITIATED"),
            AuditAction::Captured => f.write_str("CAPTURED"),
            AuditAction::Failed => f.write_str("FAILED"),
            AuditAction::Refunded => f.write_str("REFUNDED"),
            AuditAction::Cancelled => f.write_str("CANCELLED"),
            AuditAction::Webhook(status) => {
                write!(f, "{}", status.as_str().to_ascii_uppercase())
            }
        }
    }
}

/// One row of the payment audit trail. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub payment_id: Ulid,
    pub action: AuditAction,
    pub amount: Decimal,
    pub reason: Option<String>,
    /// `None` when the system (gateway callback, sweeper) acted.
    pub actor: Option<Ulid>,
    pub at: Ms,
    pub snapshot: Option<String>,
}

// ── IoT ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Occupancy,
    Temperature,
    Humidity,
    AirQuality,
    NoiseLevel,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Occupancy => "occupancy",
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::AirQuality => "air_quality",
            SensorKind::NoiseLevel => "noise_level",
        }
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "occupancy" => Ok(SensorKind::Occupancy),
            "temperature" => Ok(SensorKind::Temperature),
            "humidity" => Ok(SensorKind::Humidity),
            "air_quality" => Ok(SensorKind::AirQuality),
            "noise" | "noise_level" => Ok(SensorKind::NoiseLevel),
            other => Err(format!("unknown sensor type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: Ulid,
    pub external_id: String,
    pub venue_id: Ulid,
    pub space_id: Option<Ulid>,
    pub kind: SensorKind,
    pub active: bool,
    pub last_heartbeat: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: Ulid,
    pub sensor_id: Ulid,
    pub timestamp: Ms,
    pub value: f64,
    pub unit: String,
    pub metadata: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyKind {
    Entry,
    Exit,
    OccupancyChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyEvent {
    pub id: Ulid,
    pub space_id: Ulid,
    pub kind: OccupancyKind,
    pub count: u32,
    pub timestamp: Ms,
    /// Set when the event falls inside a confirmed booking.
    pub booking_id: Option<Ulid>,
    pub metadata: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    Pending,
    Verified,
    NoShow,
    EarlyDeparture,
    Overstay,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::NoShow => "no_show",
            VerificationStatus::EarlyDeparture => "early_departure",
            VerificationStatus::Overstay => "overstay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingVerification {
    pub booking_id: Ulid,
    pub status: VerificationStatus,
    pub actual_start: Option<Ms>,
    pub actual_end: Option<Ms>,
    pub occupancy_verified: bool,
    pub event_count: u32,
    pub max_occupancy: u32,
    pub verified_at: Option<Ms>,
}

impl BookingVerification {
    pub fn pending(booking_id: Ulid) -> Self {
        Self {
            booking_id,
            status: VerificationStatus::Pending,
            actual_start: None,
            actual_end: None,
            occupancy_verified: false,
            event_count: 0,
            max_occupancy: 0,
            verified_at: None,
        }
    }
}

/// Per-space, per-day environmental snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalRecord {
    pub space_id: Ulid,
    pub day: NaiveDate,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub air_quality_index: Option<i32>,
    pub noise_level: Option<f64>,
    pub updated_at: Ms,
}

// ── Per-space state ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SpaceState {
    pub info: SpaceInfo,
    /// Pending/Confirmed bookings, sorted by `span.start`.
    pub active: Vec<ActiveSlot>,
    /// Completed bookings, sorted by `span.start`. They no longer block
    /// new bookings but late occupancy can still reach them.
    pub completed: Vec<ActiveSlot>,
    /// Occupancy events, sorted by `timestamp`.
    pub occupancy: Vec<OccupancyEvent>,
}

impl SpaceState {
    pub fn new(info: SpaceInfo) -> Self {
        Self {
            info,
            active: Vec::new(),
            completed: Vec::new(),
            occupancy: Vec::new(),
        }
    }

    /// Insert a slot keeping start order. Refuses a slot that would overlap
    /// another active booking and returns the id it collides with.
    pub fn insert_slot(&mut self, slot: ActiveSlot) -> Result<(), Ulid> {
        if let Some(hit) = self
            .overlapping(&slot.span)
            .find(|s| s.booking_id != slot.booking_id)
        {
            return Err(hit.booking_id);
        }
        self.remove_slot(slot.booking_id);
        let pos = self
            .active
            .partition_point(|s| s.span.start <= slot.span.start);
        self.active.insert(pos, slot);
        Ok(())
    }

    pub fn remove_slot(&mut self, booking_id: Ulid) -> Option<ActiveSlot> {
        let pos = self.active.iter().position(|s| s.booking_id == booking_id)?;
        Some(self.active.remove(pos))
    }

    pub fn slot_mut(&mut self, booking_id: Ulid) -> Option<&mut ActiveSlot> {
        self.active.iter_mut().find(|s| s.booking_id == booking_id)
    }

    /// Active slots whose half-open span overlaps `query`.
    /// Binary search skips slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ActiveSlot> {
        let right_bound = self.active.partition_point(|s| s.span.start < query.end);
        self.active[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    /// Move a booking's slot from the active index to the completed one.
    pub fn retire_slot(&mut self, booking_id: Ulid) {
        if let Some(slot) = self.remove_slot(booking_id) {
            self.insert_completed(slot);
        }
    }

    pub fn insert_completed(&mut self, slot: ActiveSlot) {
        let pos = self
            .completed
            .partition_point(|s| s.span.start <= slot.span.start);
        self.completed.insert(pos, ActiveSlot { confirmed: true, ..slot });
    }

    /// Confirmed or completed slots whose span, extended by `trailing` after
    /// the end, contains `t` (closed on both ends).
    pub fn confirmed_around(&self, t: Ms, trailing: Ms) -> impl Iterator<Item = &ActiveSlot> {
        let right_bound = self.active.partition_point(|s| s.span.start <= t);
        let active = self.active[..right_bound].iter().filter(|s| s.confirmed);
        // No booking is longer than MAX_BOOKING_SPAN_MS, so older
        // completed slots cannot reach `t`.
        let horizon = t.saturating_sub(trailing).saturating_sub(MAX_BOOKING_SPAN_MS);
        let lo = self.completed.partition_point(|s| s.span.start < horizon);
        let hi = self.completed.partition_point(|s| s.span.start <= t);
        let completed = self.completed[lo..hi.max(lo)].iter();
        active
            .chain(completed)
            .filter(move |s| t <= s.span.end + trailing)
    }

    pub fn insert_occupancy(&mut self, event: OccupancyEvent) {
        let pos = self
            .occupancy
            .partition_point(|e| e.timestamp <= event.timestamp);
        self.occupancy.insert(pos, event);
    }

    /// Occupancy events with `from <= timestamp <= to`, oldest first.
    pub fn occupancy_between(&self, from: Ms, to: Ms) -> &[OccupancyEvent] {
        let lo = self.occupancy.partition_point(|e| e.timestamp < from);
        let hi = self.occupancy.partition_point(|e| e.timestamp <= to);
        &self.occupancy[lo..hi.max(lo)]
    }
}

/// WAL record payload. Every variant is a fact; one commit is a `Vec<Event>`
/// written and replayed atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SpaceRegistered(SpaceInfo),
    PolicyAdded(BookingPolicy),
    PolicyDeactivated {
        id: Ulid,
    },
    BookingCreated(Booking),
    BookingRescheduled {
        id: Ulid,
        from_space: Option<Ulid>,
        space_id: Option<Ulid>,
        span: Span,
        company_id: Option<Ulid>,
        total_price: Decimal,
        at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        space_id: Option<Ulid>,
        status: BookingStatus,
        at: Ms,
    },
    BookingPaymentStatusChanged {
        id: Ulid,
        payment_status: PaymentStatus,
        at: Ms,
    },
    BookingUsageRecorded {
        id: Ulid,
        actual_start: Option<Ms>,
        actual_end: Option<Ms>,
        at: Ms,
    },
    PaymentCreated(Payment),
    PaymentSettled {
        id: Ulid,
        status: PaymentStatus,
        transaction_ref: Option<String>,
        gateway_payload: Option<String>,
    },
    AuditAppended(AuditEntry),
    SensorRegistered(Sensor),
    SensorReadingStored {
        reading: SensorReading,
        /// Ingest time. `None` for snapshot rows, where the sensor record
        /// already carries its heartbeat.
        heartbeat: Option<Ms>,
    },
    OccupancyRecorded(OccupancyEvent),
    VerificationUpdated(BookingVerification),
    EnvironmentUpdated(EnvironmentalRecord),
}
