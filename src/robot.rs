//! The work selector: turns one run_robot payload into dispatched jobs.
//!
//! Buckets are merged the way the lifecycle expects them: both update
//! triggers feed the update workers, and SCRUB joins QUIESCE because the
//! pre-scrub step is a quiesce (the worker tells them apart by live
//! state). Backup and snapshot scrubs run every loop; VM and router scrubs
//! wait for the midnight sweep.

use tracing::info;

use iaas::resource::RunRobot;
use workers::{Job, JobOp, JobQueue, ResourceKind};

pub fn dispatch(work: &RunRobot, queue: &dyn JobQueue) {
    info!(projects = work.project_ids.len(), "dispatching region work");

    // Build
    for &id in &work.backups.build {
        queue.enqueue(Job::new(ResourceKind::Backup, JobOp::Build, id));
    }
    for &id in &work.snapshots.build {
        queue.enqueue(Job::new(ResourceKind::Snapshot, JobOp::Build, id));
    }
    for &id in &work.virtual_routers.build {
        queue.enqueue(Job::new(ResourceKind::VirtualRouter, JobOp::Build, id));
    }
    for &id in &work.vms.build {
        queue.enqueue(Job::new(ResourceKind::Vm, JobOp::Build, id));
    }

    // Quiesce, including the pre-scrub quiesce of SCRUB resources
    for &id in work.virtual_routers.quiesce.iter().chain(&work.virtual_routers.scrub) {
        queue.enqueue(Job::new(ResourceKind::VirtualRouter, JobOp::Quiesce, id));
    }
    for &id in work.vms.quiesce.iter().chain(&work.vms.scrub) {
        queue.enqueue(Job::new(ResourceKind::Vm, JobOp::Quiesce, id));
    }

    // Update, both running and quiesced triggers
    for &id in work.backups.running_update.iter().chain(&work.backups.quiesced_update) {
        queue.enqueue(Job::new(ResourceKind::Backup, JobOp::Update, id));
    }
    for &id in work.snapshots.running_update.iter().chain(&work.snapshots.quiesced_update) {
        queue.enqueue(Job::new(ResourceKind::Snapshot, JobOp::Update, id));
    }
    for &id in work
        .virtual_routers
        .running_update
        .iter()
        .chain(&work.virtual_routers.quiesced_update)
    {
        queue.enqueue(Job::new(ResourceKind::VirtualRouter, JobOp::Update, id));
    }
    for &id in work.vms.running_update.iter().chain(&work.vms.quiesced_update) {
        queue.enqueue(Job::new(ResourceKind::Vm, JobOp::Update, id));
    }

    // Restart
    for &id in &work.virtual_routers.restart {
        queue.enqueue(Job::new(ResourceKind::VirtualRouter, JobOp::Restart, id));
    }
    for &id in &work.vms.restart {
        queue.enqueue(Job::new(ResourceKind::Vm, JobOp::Restart, id));
    }

    // Leaf scrubs run on every loop
    for &id in &work.backups.scrub {
        queue.enqueue(Job::new(ResourceKind::Backup, JobOp::Scrub, id));
    }
    for &id in &work.snapshots.scrub {
        queue.enqueue(Job::new(ResourceKind::Snapshot, JobOp::Scrub, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingQueue {
        jobs: Mutex<Vec<Job>>,
    }

    impl JobQueue for RecordingQueue {
        fn enqueue(&self, job: Job) {
            self.jobs.lock().unwrap().push(job);
        }

        fn enqueue_after(&self, job: Job, _delay: Duration) {
            self.jobs.lock().unwrap().push(job);
        }
    }

    fn work() -> RunRobot {
        serde_json::from_str(
            r#"{
            "project_ids": [12],
            "backups": {"build": [1], "running_update": [2], "quiesced_update": [3], "scrub": [4]},
            "snapshots": {"build": [], "running_update": [], "quiesced_update": [], "scrub": [5]},
            "virtual_routers": {"build": [9], "running_update": [10], "quiesced_update": [],
                                "quiesce": [11], "restart": [12], "scrub": [13]},
            "vms": {"build": [42], "running_update": [], "quiesced_update": [43],
                    "quiesce": [], "restart": [44], "scrub": [45]}
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn buckets_fan_out_with_merging() {
        let queue = RecordingQueue::default();
        dispatch(&work(), &queue);
        let jobs = queue.jobs.lock().unwrap();

        let find = |kind: ResourceKind, op: JobOp| -> Vec<i64> {
            jobs.iter().filter(|j| j.kind == kind && j.op == op).map(|j| j.id).collect()
        };

        assert_eq!(find(ResourceKind::Backup, JobOp::Build), vec![1]);
        // Both update triggers land on the update worker
        assert_eq!(find(ResourceKind::Backup, JobOp::Update), vec![2, 3]);
        // Backup/snapshot scrubs dispatch every loop
        assert_eq!(find(ResourceKind::Backup, JobOp::Scrub), vec![4]);
        assert_eq!(find(ResourceKind::Snapshot, JobOp::Scrub), vec![5]);

        // SCRUB merges into the quiesce bucket for routers and VMs
        assert_eq!(find(ResourceKind::VirtualRouter, JobOp::Quiesce), vec![11, 13]);
        assert_eq!(find(ResourceKind::Vm, JobOp::Quiesce), vec![45]);
        // and never into a per-loop scrub job
        assert!(find(ResourceKind::VirtualRouter, JobOp::Scrub).is_empty());
        assert!(find(ResourceKind::Vm, JobOp::Scrub).is_empty());

        assert_eq!(find(ResourceKind::Vm, JobOp::Build), vec![42]);
        assert_eq!(find(ResourceKind::Vm, JobOp::Update), vec![43]);
        assert_eq!(find(ResourceKind::Vm, JobOp::Restart), vec![44]);
        assert_eq!(find(ResourceKind::VirtualRouter, JobOp::Restart), vec![12]);
    }
}
