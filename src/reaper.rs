use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// One completion pass. Returns how many bookings moved to completed.
pub async fn complete_ended(engine: &Engine, now: i64) -> usize {
    let mut completed = 0;
    for booking_id in engine.collect_completable(now) {
        match engine.complete_booking(booking_id).await {
            Ok(_) => completed += 1,
            // May have been cancelled in between, that's fine
            Err(e) => debug!("completer skip {booking_id}: {e}"),
        }
    }
    completed
}

/// One retention pass: history that ended more than `retention` before
/// `now` is dropped.
pub async fn purge_expired(engine: &Engine, now: i64, retention: Duration) -> usize {
    let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
    match engine.purge_history(now.saturating_sub(retention_ms)).await {
        Ok(n) => n,
        Err(e) => {
            warn!("history purge failed: {e}");
            0
        }
    }
}

/// Background task that moves confirmed bookings to completed once they
/// end, then drops history older than `retention`.
pub async fn run_completer(engine: Arc<Engine>, every: Duration, retention: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = chrono::Utc::now().timestamp_millis();
        let n = complete_ended(&engine, now).await;
        if n > 0 {
            info!(completed = n, "completion sweep");
        }
        let purged = purge_expired(&engine, now, retention).await;
        if purged > 0 {
            info!(purged, "retention sweep");
        }
    }
}

/// Background task that compacts the journal once it has grown past
/// `threshold` appends, and prunes abandoned change-feed channels.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        engine.notify.prune();
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!("journal compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AdmissionRequest;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::{TimeZone, Utc};
    use chrono_tz::Tz;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotgate_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn completes_only_after_the_end() {
        let path = test_wal_path("complete_after_end.wal");
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());

        let host = Ulid::new();
        engine.create_host(host, None).await.unwrap();
        engine
            .create_schedule(
                Schedule::new(Ulid::new(), host, "Mondays", Tz::UTC).with_rule(1, hm(9, 0), hm(17, 0)),
            )
            .await
            .unwrap();
        let et = EventType::new(Ulid::new(), host, "Intro", 30);
        let et_id = et.id;
        engine.save_event_type(et).await.unwrap();

        // 2030-06-03 is a Monday.
        let start = Utc.with_ymd_and_hms(2030, 6, 3, 10, 0, 0).unwrap().timestamp_millis();
        let booking = engine
            .admit(AdmissionRequest::new(
                et_id,
                Invitee::new("Ada", "ada@example.com"),
                Span::new(start, start + 30 * MINUTE_MS),
            ))
            .await
            .unwrap();

        // Sweeps run with a pretend clock.
        assert_eq!(complete_ended(&engine, start + 29 * MINUTE_MS).await, 0);
        assert_eq!(complete_ended(&engine, start + 30 * MINUTE_MS).await, 1);
        assert_eq!(
            engine.get_booking(booking.id).await.unwrap().status,
            BookingStatus::Completed
        );
        assert_eq!(complete_ended(&engine, start + 60 * MINUTE_MS).await, 0);

        // Completed history stays until the retention window has passed.
        let day = Duration::from_secs(24 * 60 * 60);
        let end = start + 30 * MINUTE_MS;
        assert_eq!(purge_expired(&engine, end + 60 * MINUTE_MS, day).await, 0);
        assert!(engine.get_booking(booking.id).await.is_some());
        assert_eq!(purge_expired(&engine, end + 24 * 60 * MINUTE_MS, day).await, 1);
        assert!(engine.get_booking(booking.id).await.is_none());
    }
}
