use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument};

use super::orchestrator::LobbyOrchestrator;

/// Starts the background task that applies lobby timeouts and retries
/// pending reconciliation writes
pub fn start_sweeper(orchestrator: LobbyOrchestrator, sweep_interval: Duration) -> JoinHandle<()> {
    info!(
        sweep_interval_ms = sweep_interval.as_millis() as u64,
        "Starting lobby sweeper background task"
    );

    tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            run_sweep(&orchestrator).await;
        }
    })
}

/// One sweeper pass. Returns (lobbies checked, lobbies reconciled).
#[instrument(skip(orchestrator))]
pub async fn run_sweep(orchestrator: &LobbyOrchestrator) -> (usize, usize) {
    let checked = orchestrator.sweep().await;

    let reconciled = if orchestrator.pending_reconciliation().await > 0 {
        orchestrator.reconcile().await
    } else {
        0
    };

    if reconciled > 0 {
        info!(checked, reconciled, "Lobby sweep completed");
    } else {
        debug!(checked, "Lobby sweep completed");
    }
    (checked, reconciled)
}
