use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// `end > start`, both inside the supported range, and not absurdly long.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if end <= start {
        return Err(EngineError::validation("End time must be after start time"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_BOOKING_SPAN_MS {
        return Err(EngineError::LimitExceeded("booking span too wide"));
    }
    Ok(span)
}

/// Some Pending/Confirmed booking other than `exclude` overlaps `span`.
/// Touching endpoints do not conflict.
pub fn has_conflict(space: &SpaceState, span: &Span, exclude: Option<Ulid>) -> bool {
    first_conflict(space, span, exclude).is_some()
}

fn first_conflict(space: &SpaceState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    space
        .overlapping(span)
        .map(|slot| slot.booking_id)
        .find(|id| Some(*id) != exclude)
}

pub(crate) fn check_no_conflict(
    space: &SpaceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match first_conflict(space, span, exclude) {
        Some(id) => Err(EngineError::Conflict(id)),
        None => Ok(()),
    }
}
