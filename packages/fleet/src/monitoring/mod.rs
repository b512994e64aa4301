// packages/fleet/src/monitoring/mod.rs
//! Health and heartbeat monitoring
//!
//! - **Health**: periodic four-component scoring, restart budget
//! - **Heartbeat**: detection of agents that stopped reporting
//!
//! Both monitors only compute verdicts. The manager runs them on
//! cancellable intervals (see `spawn_periodic`) and applies the results.

pub mod health;
pub mod heartbeat;

pub use health::{HealthMonitor, HealthReport, RestartBudget};
pub use heartbeat::{HeartbeatMonitor, HeartbeatTimeout};

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run `tick` every `period` until `token` is cancelled.
///
/// The first tick fires one full period after spawning. A slow tick delays
/// the next one instead of bursting to catch up.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }

        debug!(task = name, "Periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_periodic_stops_on_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = count.clone();
        let handle = spawn_periodic("test", Duration::from_millis(10), token.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();

        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }
}
