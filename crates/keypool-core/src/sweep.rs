use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::pool::KeyPool;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the periodic housekeeping task for a pool.
///
/// The pool stays correct without it (window resets and cooldown expiry
/// are checked lazily at the point of use); the sweeper reclaims leaked
/// reservations and keeps the audit trail honest about them. Abort the
/// returned handle to stop sweeping.
pub fn spawn_sweeper(pool: Arc<KeyPool>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        // The first tick fires immediately; skip it so a freshly spawned
        // sweeper does not race pool setup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = pool.sweep_once();
            if report.leaked_released > 0 || report.windows_reset > 0 {
                debug!(
                    leaked = report.leaked_released,
                    resets = report.windows_reset,
                    "housekeeping sweep"
                );
            }
        }
    })
}
