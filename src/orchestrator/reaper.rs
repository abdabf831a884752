//! Background task that force-fails stuck jobs and releases idle per-job state.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Orchestrator;

/// Check interval for a given staleness threshold: a quarter of it, at least one second.
pub fn reap_interval(stale_after: Duration) -> Duration {
    (stale_after / 4).max(Duration::from_secs(1))
}

pub fn spawn_reaper(
    orchestrator: Arc<Orchestrator>,
    stale_after: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = reap_interval(stale_after);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(?stale_after, ?period, "stale job reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match orchestrator.reap_once(stale_after).await {
                        Ok(reaped) if !reaped.is_empty() => {
                            warn!(count = reaped.len(), "reaped stale jobs");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "stale job sweep failed"),
                    }
                    orchestrator.release_idle().await;
                }
            }
        }
        debug!("stale job reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reap_interval_is_quarter_with_floor() {
        assert_eq!(reap_interval(Duration::from_secs(600)), Duration::from_secs(150));
        assert_eq!(reap_interval(Duration::from_secs(2)), Duration::from_secs(1));
    }
}
