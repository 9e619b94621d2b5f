//! Periodic removal of expired sessions and login states.

use portcullis_access::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Spawns a task that sweeps `sessions` every `every`.
///
/// The task runs until aborted or the runtime shuts down.
pub fn spawn_cleanup(sessions: Arc<SessionManager>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = sessions.cleanup_expired();
            if report.total() > 0 {
                debug!(
                    sessions = report.sessions,
                    pending_logins = report.pending_logins,
                    "expired entries removed"
                );
            }
        }
    })
}
