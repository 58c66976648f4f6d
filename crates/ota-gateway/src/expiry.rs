use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::progress::Outcome;
use crate::registry::SessionRegistry;
use crate::session::Session;

/// Watchdog that expires `session` if no device has connected within
/// `window`. Stops early once the session ends for any other reason.
pub fn spawn_expiry(
    registry: SessionRegistry,
    session: Arc<Session>,
    window: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = session.cancel_token().cancelled() => {}
            _ = tokio::time::sleep(window) => {
                // Only legal while still Idle/Invited; a connected session is left alone.
                if registry.conclude(&session, Outcome::Expired).await {
                    info!(
                        "Session {} for {} expired after {:?}",
                        session.id(),
                        session.address(),
                        window
                    );
                }
            }
        }
    })
}
