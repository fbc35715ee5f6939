use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::registry::FileBufferManager;

/// Shortest interval the sweeper runs at
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically drop expired messages from every buffer of `manager`.
/// Abort the returned handle to stop sweeping. Intervals below
/// [`MIN_SWEEP_INTERVAL`] are raised to it.
pub fn spawn_expiry_sweeper(manager: Arc<FileBufferManager>, every: Duration) -> JoinHandle<()> {
    if every < MIN_SWEEP_INTERVAL {
        warn!(interval = ?every, "Expiry interval too short, using the minimum");
    }
    let every = every.max(MIN_SWEEP_INTERVAL);
    info!(interval_ms = every.as_millis() as u64, "Starting expiry sweeper");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let expired = manager.expire_all().await;
            debug!(expired = expired, "Expiry sweep finished");
        }
    })
}
