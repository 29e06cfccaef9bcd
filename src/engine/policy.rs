//! Booking policy evaluation.
//!
//! A candidate is checked against every active policy scoped to its venue or
//! its space, in creation order. The first violation wins.

use ulid::Ulid;

use crate::model::*;

use super::error::PolicyViolation;

/// The parts of a booking that policies look at.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub venue_id: Ulid,
    pub space_id: Option<Ulid>,
    pub span: Span,
    pub company_id: Option<Ulid>,
}

pub(crate) fn applies_to(policy: &BookingPolicy, venue_id: Ulid, space_id: Option<Ulid>) -> bool {
    policy.active
        && (policy.venue_id == Some(venue_id)
            || (space_id.is_some() && policy.space_id == space_id))
}

fn check(policy: &BookingPolicy, candidate: &Candidate, now: Ms) -> Result<(), PolicyViolation> {
    let reason = match policy.rule {
        PolicyRule::AdvanceBooking { min_hours } => {
            if candidate.span.start - now < Ms::from(min_hours) * HOUR {
                format!("Booking must be made at least {min_hours} hours in advance")
            } else {
                return Ok(());
            }
        }
        PolicyRule::MaxDuration { max_hours } => {
            if candidate.span.duration_ms() > Ms::from(max_hours) * HOUR {
                format!("Maximum booking duration is {max_hours} hours")
            } else {
                return Ok(());
            }
        }
        PolicyRule::CorporateOnly => {
            if candidate.company_id.is_none() {
                "This space is only available for corporate bookings".to_string()
            } else {
                return Ok(());
            }
        }
    };
    Err(PolicyViolation {
        policy_id: policy.id,
        rule: policy.rule.label(),
        reason,
    })
}

/// `policies` must already be filtered to the candidate's scope and sorted
/// by `seq`.
pub fn evaluate(
    policies: &[BookingPolicy],
    candidate: &Candidate,
    now: Ms,
) -> Result<(), PolicyViolation> {
    policies.iter().try_for_each(|p| check(p, candidate, now))
}
