//! Occupancy-based booking verification.

use crate::model::*;

/// Arrivals up to this long after the booked start still count as on time.
pub const ARRIVAL_GRACE: Ms = 15 * MINUTE;
/// Activity up to this long after the booked end is not an overstay.
pub const DEPARTURE_GRACE: Ms = 15 * MINUTE;

/// Re-derive a verification from the space's occupancy events in
/// `[span.start, span.end + watch]`, oldest first.
///
/// A late first arrival is reported as `NoShow`. Fields the verdict does not
/// touch keep their previous values.
pub fn evaluate(
    prior: &BookingVerification,
    span: &Span,
    events: &[OccupancyEvent],
    now: Ms,
) -> BookingVerification {
    let mut next = prior.clone();
    next.event_count = u32::try_from(events.len()).unwrap_or(u32::MAX);
    next.max_occupancy = events.iter().map(|e| e.count).max().unwrap_or(0);
    next.verified_at = Some(now);

    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        next.status = VerificationStatus::NoShow;
        return next;
    };

    if first.timestamp > span.start + ARRIVAL_GRACE {
        next.status = VerificationStatus::NoShow;
        return next;
    }

    next.actual_start = Some(first.timestamp);
    next.occupancy_verified = true;
    if last.timestamp > span.end + DEPARTURE_GRACE {
        next.status = VerificationStatus::Overstay;
    } else {
        next.status = VerificationStatus::Verified;
        next.actual_end = Some(last.timestamp);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const START: Ms = 1_800_000_000_000;

    fn span() -> Span {
        Span::new(START, START + 2 * HOUR)
    }

    fn at(t: Ms, count: u32) -> OccupancyEvent {
        OccupancyEvent {
            id: Ulid::new(),
            space_id: Ulid::nil(),
            kind: OccupancyKind::OccupancyChange,
            count,
            timestamp: t,
            booking_id: None,
            metadata: "{}".into(),
        }
    }

    fn run(events: &[OccupancyEvent]) -> BookingVerification {
        evaluate(&BookingVerification::pending(Ulid::new()), &span(), events, START + 3 * HOUR)
    }

    #[test]
    fn attended_booking_is_verified() {
        let events = [at(START + 5 * MINUTE, 1), at(START + 115 * MINUTE, 2)];
        let v = run(&events);
        assert_eq!(v.status, VerificationStatus::Verified);
        assert_eq!(v.actual_start, Some(START + 5 * MINUTE));
        assert_eq!(v.actual_end, Some(START + 115 * MINUTE));
        assert!(v.occupancy_verified);
        assert_eq!(v.event_count, 2);
        assert_eq!(v.max_occupancy, 2);
        assert_eq!(v.verified_at, Some(START + 3 * HOUR));
    }

    #[test]
    fn no_events_is_no_show() {
        let v = run(&[]);
        assert_eq!(v.status, VerificationStatus::NoShow);
        assert!(!v.occupancy_verified);
        assert_eq!(v.event_count, 0);
    }

    #[test]
    fn late_arrival_is_no_show() {
        let v = run(&[at(START + 16 * MINUTE, 1)]);
        assert_eq!(v.status, VerificationStatus::NoShow);
        assert_eq!(v.actual_start, None);
    }

    #[test]
    fn arrival_at_grace_edge_counts() {
        let v = run(&[at(START + ARRIVAL_GRACE, 1)]);
        assert_eq!(v.status, VerificationStatus::Verified);
    }

    #[test]
    fn activity_past_grace_is_overstay() {
        let events = [at(START, 1), at(START + 2 * HOUR + 20 * MINUTE, 1)];
        let v = run(&events);
        assert_eq!(v.status, VerificationStatus::Overstay);
        assert_eq!(v.actual_start, Some(START));
        assert!(v.occupancy_verified);
    }

    #[test]
    fn overstay_keeps_previous_actual_end() {
        let first = run(&[at(START, 1), at(START + HOUR, 1)]);
        let events = [at(START, 1), at(START + HOUR, 1), at(START + 3 * HOUR, 1)];
        let v = evaluate(&first, &span(), &events, START + 4 * HOUR);
        assert_eq!(v.status, VerificationStatus::Overstay);
        assert_eq!(v.actual_end, Some(START + HOUR));
    }
}
