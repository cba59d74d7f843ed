use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that rewrites the WAL once `threshold` appends piled up.
/// Also drops change-feed channels nobody listens to anymore.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
        engine.notify.prune();
        debug!(channels = engine.notify.channel_count(), "pruned listener channels");
    }
}

/// One compactor step. Returns whether the WAL was rewritten.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewEquipment;
    use crate::notification::Outbox;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("ftv_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let (outbox, _rx) = Outbox::channel();
        let engine = Engine::new(test_wal_path("threshold.wal"), Arc::new(NotifyHub::new()), outbox).unwrap();
        for i in 0..3 {
            engine
                .create_equipment(NewEquipment {
                    nickname: format!("cam {i}"),
                    serial_number: None,
                    equipment_type: None,
                    functional: true,
                })
                .await
                .unwrap();
        }

        assert!(!compact_if_needed(&engine, 4).await);
        assert!(compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(!compact_if_needed(&engine, 3).await);
    }
}
