//! Periodic maintenance loops owned by the tagging service.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Run `tick` every `period` until `cancel` fires. The first run happens one
/// full period after start. Errors are logged and the loop continues.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::debug!(sweeper = name, ?period, "Sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = tick().await {
                        tracing::warn!(sweeper = name, error = %e, "Sweeper pass failed");
                    }
                }
            }
        }
        tracing::debug!(sweeper = name, "Sweeper stopped");
    })
}
