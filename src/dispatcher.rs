//! Named in-process queues feeding the worker pools.
//!
//! Virtual router operations serialize less well against everything else,
//! so they get their own queue; the daily scrub sweep runs on its own task
//! (the heartbeat queue); every other job shares the default queue.
//! Enqueues are fire-and-forget with at-least-once delivery; the workers'
//! state guard makes duplicate dispatch harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use workers::{Deps, Job, JobQueue, ResourceKind};

/// Concurrent workers on the default queue.
const DEFAULT_POOL: usize = 4;
/// Concurrent workers on the virtual router queue.
const VIRTUAL_ROUTER_POOL: usize = 2;

pub struct Dispatcher {
    default_tx: UnboundedSender<Job>,
    virtual_router_tx: UnboundedSender<Job>,
    default_rx: Mutex<Option<UnboundedReceiver<Job>>>,
    virtual_router_rx: Mutex<Option<UnboundedReceiver<Job>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (default_tx, default_rx) = unbounded_channel();
        let (virtual_router_tx, virtual_router_rx) = unbounded_channel();
        Self {
            default_tx,
            virtual_router_tx,
            default_rx: Mutex::new(Some(default_rx)),
            virtual_router_rx: Mutex::new(Some(virtual_router_rx)),
        }
    }

    /// Start the consumer pools. Called once, after the shared deps (which
    /// include this dispatcher as the queue handle) exist.
    pub async fn spawn_consumers(&self, deps: Deps) {
        let default_rx = self
            .default_rx
            .lock()
            .await
            .take()
            .expect("consumers spawned once");
        let virtual_router_rx = self
            .virtual_router_rx
            .lock()
            .await
            .take()
            .expect("consumers spawned once");

        spawn_pool("default", default_rx, DEFAULT_POOL, deps.clone());
        spawn_pool("virtual_router", virtual_router_rx, VIRTUAL_ROUTER_POOL, deps);
    }
}

fn spawn_pool(queue: &'static str, rx: UnboundedReceiver<Job>, size: usize, deps: Deps) {
    let rx = Arc::new(Mutex::new(rx));
    for worker in 0..size {
        let rx = rx.clone();
        let deps = deps.clone();
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                match job {
                    Some(job) => {
                        debug!(queue, worker, ?job, "job picked up");
                        workers::run(job, deps.clone()).await;
                    }
                    None => break,
                }
            }
        });
    }
}

impl JobQueue for Dispatcher {
    fn enqueue(&self, job: Job) {
        debug!(?job, "passing job to its queue");
        let result = match job.kind {
            ResourceKind::VirtualRouter => self.virtual_router_tx.send(job),
            _ => self.default_tx.send(job),
        };
        if result.is_err() {
            warn!(?job, "queue is closed, job dropped");
        }
    }

    fn enqueue_after(&self, job: Job, delay: Duration) {
        debug!(?job, ?delay, "scheduling delayed job");
        let tx = match job.kind {
            ResourceKind::VirtualRouter => self.virtual_router_tx.clone(),
            _ => self.default_tx.clone(),
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(job).is_err() {
                warn!(?job, "queue is closed, delayed job dropped");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workers::JobOp;

    #[tokio::test]
    async fn routes_virtual_router_jobs_to_their_own_queue() {
        let dispatcher = Dispatcher::new();
        dispatcher.enqueue(Job::new(ResourceKind::VirtualRouter, JobOp::Build, 9));
        dispatcher.enqueue(Job::new(ResourceKind::Vm, JobOp::Build, 42));
        dispatcher.enqueue(Job::new(ResourceKind::Backup, JobOp::Scrub, 7));

        let mut vr_rx = dispatcher.virtual_router_rx.lock().await.take().unwrap();
        let mut default_rx = dispatcher.default_rx.lock().await.take().unwrap();

        assert_eq!(vr_rx.recv().await.unwrap().id, 9);
        assert_eq!(default_rx.recv().await.unwrap().id, 42);
        assert_eq!(default_rx.recv().await.unwrap().id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_jobs_arrive_after_the_delay() {
        let dispatcher = Dispatcher::new();
        dispatcher.enqueue_after(
            Job::new(ResourceKind::Vm, JobOp::Build, 42),
            Duration::from_secs(10),
        );
        let mut default_rx = dispatcher.default_rx.lock().await.take().unwrap();

        // Nothing before the delay elapses
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(default_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(default_rx.recv().await.unwrap().id, 42);
    }
}
