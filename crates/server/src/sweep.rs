use std::sync::Arc;
use std::time::Duration;

use charter_core::ComplianceMonitor;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};
use uuid::Uuid;

/// Runs a compliance sweep over every stored calendar on each tick until
/// `shutdown` flips to `true`. The first sweep runs immediately.
pub fn spawn(
    monitor: Arc<ComplianceMonitor>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => run_once(&monitor).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            event_name = "compliance.sweep.stopped",
            correlation_id = "shutdown",
            "background compliance sweep stopped"
        );
    })
}

async fn run_once(monitor: &ComplianceMonitor) {
    let correlation_id = format!("sweep-{}", Uuid::new_v4().simple());
    match monitor.sweep_all(Utc::now(), &correlation_id).await {
        Ok(summary) => info!(
            event_name = "compliance.sweep.completed",
            correlation_id = %correlation_id,
            calendars = summary.reports.len(),
            failures = summary.failures.len(),
            "background compliance sweep finished"
        ),
        Err(error) => error!(
            event_name = "compliance.sweep.error",
            correlation_id = %correlation_id,
            error = %error,
            "background compliance sweep could not list calendars"
        ),
    }
}
