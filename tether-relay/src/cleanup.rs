//! Background cleanup task.
//!
//! Runs periodically to drop undelivered events past their TTL and to evict
//! idle rate-limiter keys.

use crate::config::CleanupConfig;
use crate::limits::RateLimits;
use crate::storage::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    store: Arc<SqliteStore>,
    rate_limits: RateLimits,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            match store.cleanup_expired().await {
                Ok(deleted) => {
                    if deleted > 0 {
                        tracing::info!("Cleanup: deleted {} expired undelivered events", deleted);
                    } else {
                        tracing::debug!("Cleanup: no expired undelivered events");
                    }
                }
                Err(e) => {
                    tracing::error!("Cleanup error: {}", e);
                }
            }

            rate_limits.shrink();
        }
    })
}
