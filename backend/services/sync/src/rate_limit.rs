use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum gap between the starts of consecutive outbound calls.
///
/// One spacer is owned by a connector and shared by every caller of it, so the
/// spacing holds process-wide rather than per worker.
#[derive(Debug)]
pub struct RequestSpacer {
    min_spacing: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RequestSpacer {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Wait until this caller may issue its call. The lock is held across the
    /// sleep so waiters are released one spacing apart.
    pub async fn wait_turn(&self) {
        let mut last_call = self.last_call.lock().await;

        if let Some(previous) = *last_call {
            let ready_at = previous + self.min_spacing;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last_call = Some(Instant::now());
    }
}
