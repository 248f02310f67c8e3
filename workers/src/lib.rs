//! Resource workers: one entry point per (kind, operation).
//!
//! Every worker follows the same skeleton: read the resource, abort
//! silently if its live state no longer matches the expected trigger, move
//! it to the in-progress state, do the remote work, then record success or
//! quarantine the resource in UNRESOURCED and notify. The helpers in
//! [`lifecycle`] carry the shared steps; the per-kind modules own the
//! remote semantics.

use std::sync::Arc;
use std::time::Duration;

use tracing::info_span;
use tracing::Instrument;

pub mod backup;
pub mod context;
pub mod lifecycle;
pub mod snapshot;
pub mod stager;
pub mod virtual_router;
pub mod vm;
pub mod vpn_map;

pub use iaas::state::{Operation, ResourceKind};

/// One unit of dispatched work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub kind: ResourceKind,
    pub op: JobOp,
    pub id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOp {
    Build,
    Update,
    Quiesce,
    Restart,
    Scrub,
    /// Delayed reset of a virtual router's firewall debug logging.
    DebugReset,
}

impl Job {
    pub fn new(kind: ResourceKind, op: JobOp, id: i64) -> Self {
        Self { kind, op, id }
    }
}

/// The queue contract the dispatcher provides: fire-and-forget enqueue with
/// at-least-once delivery, plus delayed re-dispatch for the gate
/// reschedules.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job);
    fn enqueue_after(&self, job: Job, delay: Duration);
}

/// Everything a worker needs, shared behind Arcs so jobs can run
/// concurrently across queues.
#[derive(Clone)]
pub struct Deps {
    pub api: Arc<iaas::Client>,
    pub settings: Arc<settings::Settings>,
    pub notifier: Arc<notifier::EmailNotifier>,
    pub metrics: notifier::Metrics,
    pub queue: Arc<dyn JobQueue>,
}

/// Run one job to completion. Never returns an error: failures are
/// reconciled into resource state and notifications by the workers
/// themselves.
pub async fn run(job: Job, deps: Deps) {
    let span = info_span!(
        "worker",
        kind = %job.kind,
        op = ?job.op,
        resource_id = job.id,
    );
    async {
        match job.kind {
            ResourceKind::VirtualRouter => virtual_router::run(job, &deps).await,
            ResourceKind::Vm => vm::run(job, &deps).await,
            ResourceKind::Snapshot => snapshot::run(job, &deps).await,
            ResourceKind::Backup => backup::run(job, &deps).await,
        }
    }
    .instrument(span)
    .await;
}
