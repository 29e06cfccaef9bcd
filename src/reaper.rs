use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::{Engine, now_ms};

/// Background task that completes Confirmed bookings whose interval is over.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

async fn sweep_once(engine: &Engine) -> usize {
    match engine.complete_elapsed(now_ms()).await {
        Ok(0) => {
            debug!("sweep: nothing to complete");
            0
        }
        Ok(n) => {
            info!(completed = n, "sweep completed bookings");
            n
        }
        Err(e) => {
            error!("sweep failed: {e}");
            0
        }
    }
}

/// Background task that rewrites the WAL once enough commits piled up
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::engine::{CaptureSettlement, EngineSettings, NewBooking, PaymentDraft};
    use crate::model::*;
    use crate::observability;
    use rust_decimal_macros::dec;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("deskhub_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_completes_only_elapsed_confirmed_bookings() {
        let path = test_wal_path("sweep.wal");
        let engine = Engine::new(path, EngineSettings::default(), observability::noop()).unwrap();

        let venue_id = Ulid::new();
        let space_id = Ulid::new();
        engine
            .register_space(SpaceInfo {
                id: space_id,
                venue_id,
                hourly_rate: Some(dec!(10)),
                daily_rate: None,
            })
            .await
            .unwrap();
        let user = Principal::member(Ulid::new());
        let start = now_ms() + HOUR;
        let booking = engine
            .create_booking(NewBooking {
                user_id: user.user_id,
                venue_id,
                space_id: Some(space_id),
                start,
                end: start + HOUR,
                company_id: None,
            })
            .await
            .unwrap();
        let payment = engine
            .open_payment(
                &user,
                PaymentDraft {
                    booking_id: booking.id,
                    method: PaymentMethod::Wallet,
                    currency: "USD".into(),
                    idempotency_key: "k".into(),
                    card_last4: None,
                },
            )
            .await
            .unwrap();
        engine
            .settle_capture(
                payment.id,
                CaptureSettlement::Paid {
                    transaction_id: "tx".into(),
                    payload: "{}".into(),
                },
                None,
            )
            .await
            .unwrap();
        engine.confirm_booking(&user, booking.id).await.unwrap();

        // Not over yet.
        assert_eq!(sweep_once(&engine).await, 0);

        assert_eq!(engine.complete_elapsed(start + 2 * HOUR).await.unwrap(), 1);
        let done = engine.get_booking(&user, booking.id).await.unwrap();
        assert_eq!(done.status, BookingStatus::Completed);
        assert_eq!(engine.complete_elapsed(start + 3 * HOUR).await.unwrap(), 0);
    }
}
