//! The polling loop: ask the API for pending work, fan it out, acknowledge
//! the batch, sleep when the region is quiet.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use workers::Deps;

use crate::robot;

const POLL_SLEEP: Duration = Duration::from_secs(15);

pub async fn run(deps: Deps, mut shutdown: watch::Receiver<bool>) {
    info!("commencing robot loop");
    loop {
        if *shutdown.borrow() {
            info!("shutdown requested, leaving the robot loop");
            return;
        }
        deps.metrics.heartbeat();
        debug!("fetching the status of run_robot from the api");

        match deps.api.run_robot().await {
            Ok(Some(work)) => {
                robot::dispatch(&work, deps.queue.as_ref());
                // Acknowledge so the API stops re-offering this batch
                if let Err(err) = deps.api.ack_run_robot(&work.project_ids).await {
                    error!(error = %err, "could not acknowledge dispatched projects");
                }
                debug!(projects = ?work.project_ids, "acknowledged dispatched projects");
            }
            Ok(None) => {
                debug!("no changes in the region, sleeping");
                sleep_or_shutdown(&mut shutdown).await;
            }
            Err(err) => {
                error!(error = %err, "run_robot poll failed");
                sleep_or_shutdown(&mut shutdown).await;
            }
        }
    }
}

async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(POLL_SLEEP) => {}
        _ = shutdown.changed() => {}
    }
}
