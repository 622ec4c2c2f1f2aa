//! Session teardown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, warn};

use super::session::ToolSession;

/// Default bound on closing one session (5 seconds).
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Close every session concurrently. Failures and timeouts are logged and
/// swallowed; one stuck session never delays the others past `timeout`.
pub async fn close_all(sessions: &[Arc<dyn ToolSession>], timeout: Duration) {
    if sessions.is_empty() {
        return;
    }

    let closes = sessions.iter().map(|session| async move {
        match tokio::time::timeout(timeout, session.close()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(
                    integration = %session.integration(),
                    connection_id = %session.connection_id(),
                    "Failed to close tool session: {e}"
                );
                false
            }
            Err(_) => {
                warn!(
                    integration = %session.integration(),
                    connection_id = %session.connection_id(),
                    timeout_secs = timeout.as_secs(),
                    "Timed out closing tool session"
                );
                false
            }
        }
    });

    let results = join_all(closes).await;
    let closed = results.iter().filter(|ok| **ok).count();
    debug!(closed, total = sessions.len(), "Closed tool sessions");
}
