use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::presence::PresenceTracker;
use crate::processor::ActionProcessor;

/// Periodically hard-deletes expired notifications. A failed run is logged
/// and simply retried on the next tick.
pub fn spawn_cleanup(
    processor: ActionProcessor,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = processor.cleanup_expired(OffsetDateTime::now_utc()).await {
                        error!("Error during expired notification cleanup: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Cleanup job stopped");
    })
}

pub fn spawn_presence_sweep(
    presence: PresenceTracker,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = presence.sweep().await;
                    if evicted > 0 {
                        info!(evicted, "Evicted stale presence entries");
                    } else {
                        debug!("Presence sweep found nothing stale");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
