//! The daily scrub sweep, run at local midnight on its own (heartbeat)
//! task: everything sitting in SCRUB_QUEUE gets its scrub dispatched, in
//! production only once it has been there for a week.

use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, TimeZone};
use tokio::sync::watch;
use tracing::info;

use iaas::client::service;
use iaas::resource::{VirtualRouter, Vm};
use iaas::State;
use workers::{Deps, Job, JobOp, JobQueue, ResourceKind};

/// Resources younger than this survive the production sweep.
const SCRUB_AGE_DAYS: i64 = 7;

pub async fn run(deps: Deps, mut shutdown: watch::Receiver<bool>) {
    loop {
        let wait = until_next_midnight(Local::now());
        tokio::select! {
            _ = tokio::time::sleep(wait) => sweep(&deps).await,
            _ = shutdown.changed() => {
                info!("shutdown requested, leaving the scrub sweep");
                return;
            }
        }
    }
}

/// Time left until the next local midnight.
pub fn until_next_midnight(now: DateTime<Local>) -> std::time::Duration {
    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return std::time::Duration::from_secs(24 * 60 * 60);
    };
    let midnight = tomorrow.and_hms_opt(0, 0, 0).expect("midnight is a valid time");
    let next = match Local.from_local_datetime(&midnight) {
        LocalResult::Single(next) | LocalResult::Ambiguous(next, _) => next,
        // The midnight hour got skipped by a DST jump
        LocalResult::None => now + ChronoDuration::hours(24),
    };
    (next - now).to_std().unwrap_or_default()
}

async fn sweep(deps: &Deps) {
    let timestamp = deps.settings.in_production.then(|| {
        (chrono::Utc::now() - ChronoDuration::days(SCRUB_AGE_DAYS))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string()
    });
    info!(updated__lte = ?timestamp, "commencing scrub checks");

    let mut params = vec![("search[state]", State::ScrubQueue.code().to_string())];
    if let Some(ref timestamp) = timestamp {
        params.push(("search[updated__lte]", timestamp.clone()));
    }

    let vms: Vec<Vm> = deps.api.list(service::VM, &params).await;
    for vm in &vms {
        deps.queue.enqueue(Job::new(ResourceKind::Vm, JobOp::Scrub, vm.id));
    }

    let routers: Vec<VirtualRouter> = deps.api.list(service::VIRTUAL_ROUTER, &params).await;
    for router in &routers {
        deps.queue.enqueue(Job::new(ResourceKind::VirtualRouter, JobOp::Scrub, router.id));
    }

    info!(vms = vms.len(), virtual_routers = routers.len(), "scrub sweep dispatched");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn wait_is_positive_and_lands_on_midnight() {
        let now = Local::now();
        let wait = until_next_midnight(now);
        assert!(wait > std::time::Duration::ZERO);
        assert!(wait <= std::time::Duration::from_secs(24 * 60 * 60 + 1));

        let next = now + ChronoDuration::from_std(wait).unwrap();
        assert_eq!(next.hour(), 0);
        assert_eq!(next.minute(), 0);
    }
}
