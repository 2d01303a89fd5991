use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that releases reservations whose payment capture
/// deadline lapsed. Students who abandon checkout stop blocking the slot
/// within one tick.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let now = chrono::Local::now().naive_local();
        let lapsed = engine.collect_lapsed_groups(now).await;
        for group_id in lapsed {
            match engine.release_reservation(group_id).await {
                Ok(()) => info!("reaped lapsed reservation {group_id}"),
                Err(e) => {
                    // May already have been released or captured in the meantime
                    tracing::debug!("reaper skip {group_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once append churn crosses the
/// threshold.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(300));
    loop {
        interval.tick().await;
        match engine.wal_appends_since_compact().await {
            Ok(n) if n >= threshold => {
                if let Err(e) = engine.compact_wal().await {
                    tracing::warn!("WAL compaction failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("WAL status check failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::payment::AlwaysCapture;
    use chrono::{Duration as ChronoDuration, NaiveTime, Weekday};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessonslot_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open_policy() -> BookingPolicy {
        BookingPolicy {
            enabled: true,
            buffer_minutes: 0,
            min_notice_hours: 0,
            max_horizon_days: 365,
            auto_approve: true,
        }
    }

    #[tokio::test]
    async fn reaper_collects_lapsed_groups() {
        let path = test_wal_path("reaper_collect.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let teacher = engine.register_teacher(open_policy()).await.unwrap();
        for day in [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri,
            Weekday::Sat, Weekday::Sun]
        {
            engine
                .add_weekly_hours(
                    teacher,
                    day,
                    NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
                )
                .await
                .unwrap();
        }

        let start = (chrono::Local::now().naive_local() + ChronoDuration::days(7))
            .date()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let receipt = engine
            .submit_booking(
                teacher,
                Ulid::new(),
                &[Selection {
                    subject_id: Ulid::new(),
                    start,
                    duration_minutes: 60,
                }],
                None,
                None,
                5_000,
                &AlwaysCapture,
            )
            .await
            .unwrap();

        // Captured group never lapses
        let now = chrono::Local::now().naive_local();
        let lapsed = engine.collect_lapsed_groups(now + ChronoDuration::days(1)).await;
        assert!(lapsed.is_empty());

        // Force the group back to awaiting capture with a past deadline
        {
            let ts = engine.get_teacher(&teacher).unwrap();
            let mut guard = ts.write().await;
            for lesson in &mut guard.lessons {
                lesson.payment = PaymentState::AwaitingCapture {
                    deadline: now - ChronoDuration::minutes(1),
                };
            }
        }
        let lapsed = engine.collect_lapsed_groups(now).await;
        assert_eq!(lapsed, vec![receipt.group_id]);

        engine.release_reservation(receipt.group_id).await.unwrap();
        let lapsed_after = engine.collect_lapsed_groups(now).await;
        assert!(lapsed_after.is_empty());
    }
}
