//! Background tasks driving the coordinator: the single dispatcher that
//! feeds the active slot, its watchdog, and the retention purge.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep_until};
use tracing::{debug, error, info, warn};

use super::coordinator::{Claim, Coordinator};

/// Handles of the tasks started by [`Coordinator::start`].
pub struct Workers {
    dispatcher: JoinHandle<()>,
    purger: JoinHandle<()>,
}

impl Workers {
    /// Wait for both tasks to wind down after shutdown.
    pub async fn join(self) {
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "dispatcher watchdog ended abnormally");
        }
        if let Err(e) = self.purger.await {
            warn!(error = %e, "purge task ended abnormally");
        }
    }
}

impl Coordinator {
    /// Spawn the dispatcher (under a watchdog) and the retention purge.
    pub fn start(&self) -> Workers {
        Workers {
            dispatcher: tokio::spawn(watchdog(self.clone())),
            purger: tokio::spawn(purge_loop(self.clone())),
        }
    }
}

/// Restarts the dispatcher when it panics, settling whatever it left in the
/// active slot first.
async fn watchdog(coordinator: Coordinator) {
    let shutdown = coordinator.shutdown_token();
    loop {
        let handle = tokio::spawn(dispatch_loop(coordinator.clone()));
        match handle.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                error!("dispatcher panicked, recovering active job");
                coordinator.recover_active();
                if shutdown.is_cancelled() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "dispatcher task cancelled");
                break;
            }
        }
    }
    debug!("dispatcher watchdog stopped");
}

async fn dispatch_loop(coordinator: Coordinator) {
    let shutdown = coordinator.shutdown_token();
    info!("dispatcher started");

    while !shutdown.is_cancelled() {
        match coordinator.claim_next() {
            Claim::Run(request) => coordinator.run_claimed(request).await,
            Claim::WaitUntil(at) => {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = coordinator.wake().notified() => {}
                    () = sleep_until(at) => {}
                }
            }
            Claim::Idle => {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = coordinator.wake().notified() => {}
                }
            }
        }
    }
    info!("dispatcher stopped");
}

async fn purge_loop(coordinator: Coordinator) {
    let shutdown = coordinator.shutdown_token();
    let period = coordinator
        .retention()
        .clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                coordinator.purge_expired(Utc::now());
            }
        }
    }
    debug!("purge task stopped");
}
