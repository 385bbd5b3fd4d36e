use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::Coordinator;

/// Runs [`Coordinator::run_cleanup_pass`] on a fixed interval until the
/// process shuts down.
pub async fn run(coordinator: Arc<Coordinator>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let cleaned = coordinator.run_cleanup_pass().await;
        if cleaned > 0 {
            log::info!("cleanup pass cleared {cleaned} run result(s)");
        }
    }
}
