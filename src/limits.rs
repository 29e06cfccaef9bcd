//! Hard limits enforced at the engine boundary.

use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not span more than a year.
pub const MAX_BOOKING_SPAN_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_POLICIES: usize = 10_000;
pub const MAX_POLICY_HOURS: u32 = 24 * 366;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_CURRENCY_LEN: usize = 3;

pub const MAX_EXTERNAL_ID_LEN: usize = 100;
pub const MAX_UNIT_LEN: usize = 20;
pub const MAX_METADATA_BYTES: usize = 16 * 1024;

/// Webhook bodies larger than this are rejected before signature checks.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 64 * 1024;
