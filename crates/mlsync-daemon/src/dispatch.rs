//! Fired-trigger dispatcher: one task per fired trigger.
//!
//! Overlapping runs of one sync type are not filtered here; the executor's
//! lease turns the later one into a skip.

use std::sync::Arc;

use mlsync_ampre::ListingSource;
use mlsync_executor::{RunOutcome, SyncExecutor, SyncRequest};
use mlsync_scheduler::FiredTrigger;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

pub fn spawn<S>(
    executor: Arc<SyncExecutor<S>>,
    mut fired_rx: mpsc::Receiver<FiredTrigger>,
) -> JoinHandle<()>
where
    S: ListingSource + 'static,
{
    tokio::spawn(async move {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                fired = fired_rx.recv() => {
                    let Some(fired) = fired else { break };
                    let executor = Arc::clone(&executor);
                    in_flight.spawn(async move { run_trigger(&executor, fired).await });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "sync task panicked");
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "waiting for in-flight sync runs");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "sync task panicked");
            }
        }
        info!("dispatcher stopped");
    })
}

async fn run_trigger<S: ListingSource>(executor: &SyncExecutor<S>, fired: FiredTrigger) {
    let trigger = fired.trigger;
    let req = SyncRequest {
        sync_type: trigger.sync_type,
        limit: trigger.limit,
        skip_existing: trigger.skip_existing,
    };

    match executor.run(req).await {
        Ok(RunOutcome::Skipped { held_by, .. }) => {
            info!(trigger = %trigger.name, ?held_by, "scheduled run skipped");
        }
        Ok(RunOutcome::Completed(log)) => {
            info!(
                trigger = %trigger.name,
                run_id = log.id,
                upserted = log.records_upserted,
                "scheduled run completed"
            );
        }
        Ok(RunOutcome::Failed(log)) => {
            warn!(trigger = %trigger.name, run_id = log.id, message = ?log.message, "scheduled run failed");
        }
        Err(e) => {
            error!(trigger = %trigger.name, error = %e, "scheduled run could not be recorded");
        }
    }
}
