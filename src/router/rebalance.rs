//! The rebalance loop.
//!
//! A single cooperative task snapshots backend scores on a short tick and
//! requests redirections away from overloaded backends. Convergence is damped
//! by the score-ratio threshold; as sessions move, `conn_score` transfers with
//! them and further movement stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Router;

pub fn spawn_rebalancer(router: Arc<Router>, shutdown: CancellationToken) -> JoinHandle<()> {
    let interval = Duration::from_millis(router.balance.rebalance_interval_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("rebalancer shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    router.rebalance_once();
                }
            }
        }
    })
}
