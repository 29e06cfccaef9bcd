use rust_decimal::{Decimal, RoundingStrategy};

use crate::model::*;

/// Length of one billable day when a space only has a daily rate.
const BILLABLE_DAY: Ms = 8 * HOUR;

/// Price of holding `info` for `span`: hourly rate × hours when the space
/// has one, otherwise daily rate × started 8-hour blocks for stays of at
/// least 8 hours, otherwise free. Rounded half-up to cents.
pub fn quote(info: &SpaceInfo, span: &Span) -> Decimal {
    let duration = span.duration_ms();
    let raw = match (info.hourly_rate, info.daily_rate) {
        (Some(hourly), _) => hourly * Decimal::from(duration) / Decimal::from(HOUR),
        (None, Some(daily)) if duration >= BILLABLE_DAY => {
            let days = (duration + BILLABLE_DAY - 1) / BILLABLE_DAY;
            daily * Decimal::from(days)
        }
        _ => Decimal::ZERO,
    };
    let mut price = raw.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    price.rescale(2);
    price
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use ulid::Ulid;

    fn space(hourly: Option<Decimal>, daily: Option<Decimal>) -> SpaceInfo {
        SpaceInfo {
            id: Ulid::new(),
            venue_id: Ulid::new(),
            hourly_rate: hourly,
            daily_rate: daily,
        }
    }

    fn hours(h: Ms) -> Span {
        Span::new(0, h)
    }

    #[test]
    fn hourly_rate_times_hours() {
        assert_eq!(quote(&space(Some(dec!(20.00)), None), &hours(2 * HOUR)), dec!(40.00));
    }

    #[test]
    fn partial_hours_are_prorated() {
        let s = space(Some(dec!(10.00)), None);
        assert_eq!(quote(&s, &hours(90 * MINUTE)), dec!(15.00));
        assert_eq!(quote(&s, &hours(20 * MINUTE)), dec!(3.33));
    }

    #[test]
    fn hourly_wins_over_daily() {
        let s = space(Some(dec!(5)), Some(dec!(100)));
        assert_eq!(quote(&s, &hours(10 * HOUR)), dec!(50.00));
    }

    #[test]
    fn daily_rate_counts_started_blocks() {
        let s = space(None, Some(dec!(100)));
        assert_eq!(quote(&s, &hours(8 * HOUR)), dec!(100));
        assert_eq!(quote(&s, &hours(9 * HOUR)), dec!(200));
        assert_eq!(quote(&s, &hours(7 * HOUR)), Decimal::ZERO);
    }

    #[test]
    fn no_rates_is_free() {
        assert_eq!(quote(&space(None, None), &hours(3 * HOUR)), Decimal::ZERO);
    }
}
