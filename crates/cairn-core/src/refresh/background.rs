use super::orchestrator::RefreshOrchestrator;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawns a task that refreshes configuration every `poll_interval` until
/// `shutdown` is cancelled.
///
/// Each tick also gives the replica pool a chance to re-run discovery; the
/// pool rate-limits that on its own. Refresh failures are logged and the loop
/// keeps going.
#[must_use]
pub fn spawn_refresh_loop(
    orchestrator: Arc<RefreshOrchestrator>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the initial load already ran.
        ticker.tick().await;

        info!(poll_interval_ms = poll_interval.as_millis(), "background refresh started");

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    info!("background refresh shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    if orchestrator.executor().pool().refresh_discovered().await {
                        debug!("replica membership refreshed");
                    }
                    orchestrator.try_refresh(&shutdown).await;
                }
            }
        }
    })
}
