use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;

/// Background task that rewrites the WAL once enough appends have piled up
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => debug!("compaction skipped: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessond_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compaction_preserves_state_across_restart() {
        let path = test_wal_path("compact_restart.wal");
        let lid = Ulid::new();
        let user = Ulid::new();

        {
            let engine = Engine::new(path.clone()).unwrap();
            engine
                .create_lesson(
                    lid,
                    Span::new(2_000_000_000_000, 2_000_003_600_000),
                    1,
                    0,
                    LessonStatus::Published,
                    LessonDetails::default(),
                )
                .await
                .unwrap();
            // Churn: fill the seat, then waitlist a second user
            engine.request_booking(Ulid::new(), lid, user).await.unwrap();
            engine.request_booking(Ulid::new(), lid, Ulid::new()).await.unwrap();
            assert!(engine.wal_appends_since_compact().await >= 3);

            engine.compact_wal().await.unwrap();
            assert_eq!(engine.wal_appends_since_compact().await, 0);
        }

        let engine = Engine::new(path.clone()).unwrap();
        let bookings = engine.get_bookings(lid).await.unwrap();
        assert_eq!(bookings.len(), 2);
        let waitlist = engine.get_waitlist(lid).await.unwrap();
        assert_eq!(waitlist.len(), 1);
        assert_eq!(waitlist[0].position, 1);

        let _ = std::fs::remove_file(&path);
    }
}
