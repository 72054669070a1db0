//! Bounded worker pool dispatching command containers onto leased
//! environments.
//!
//! The [`Threader`] owns a set of worker tasks sized at twice the pool cap.
//! Workers pull jobs off a priority queue, lease an environment, drive the
//! container's executor and release the environment. Any unexpected error
//! lands in the container's failure path; nothing escapes a worker.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::command::CommandContainer;
use crate::config::DEFAULT_DELAY;
use crate::error::ToolkitError;
use crate::session::{EnvironmentController, EnvironmentPool};

/// How long a worker sleeps in its idle loop before re-checking shutdown.
const WORKER_IDLE_WAKE: Duration = Duration::from_secs(1);

/// The execution backend handed to containers: the pool to lease from, the
/// controller for escalations, and a handle back to the threader for
/// submitting batched children.
pub struct ExecBackend {
    pool: Arc<EnvironmentPool>,
    threader: StdMutex<Weak<Threader>>,
}

impl ExecBackend {
    pub fn new(pool: Arc<EnvironmentPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            threader: StdMutex::new(Weak::new()),
        })
    }

    pub fn pool(&self) -> &Arc<EnvironmentPool> {
        &self.pool
    }

    pub fn controller(&self) -> &Arc<EnvironmentController> {
        self.pool.controller()
    }

    pub(crate) fn attach_threader(&self, threader: &Arc<Threader>) {
        if let Ok(mut guard) = self.threader.lock() {
            *guard = Arc::downgrade(threader);
        }
    }

    /// Submits a container to the worker pool.
    pub fn submit(&self, container: Arc<CommandContainer>) -> Result<(), ToolkitError> {
        let threader = self
            .threader
            .lock()
            .ok()
            .and_then(|guard| guard.upgrade())
            .ok_or_else(|| {
                ToolkitError::ExecutionFailure("the worker pool has shut down".to_string())
            })?;
        threader.submit(container);
        Ok(())
    }
}

struct Job {
    priority: i32,
    seq: u64,
    container: Arc<CommandContainer>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    // BinaryHeap is a max-heap; invert so lower priority values (and earlier
    // submissions within a priority) pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct JobQueue {
    heap: StdMutex<BinaryHeap<Job>>,
    notify: Notify,
    pending: AtomicUsize,
    running: AtomicUsize,
    seq: AtomicU64,
    shutdown: AtomicBool,
}

impl JobQueue {
    fn push(&self, priority: i32, container: Arc<CommandContainer>) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        if let Ok(mut heap) = self.heap.lock() {
            heap.push(Job {
                priority,
                seq,
                container,
            });
        }
        self.pending.fetch_add(1, AtomicOrdering::SeqCst);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        let job = self.heap.lock().ok()?.pop()?;
        self.pending.fetch_sub(1, AtomicOrdering::SeqCst);
        Some(job)
    }

    fn is_idle(&self) -> bool {
        self.pending.load(AtomicOrdering::SeqCst) == 0
            && self.running.load(AtomicOrdering::SeqCst) == 0
    }
}

/// The bounded worker pool (C6).
pub struct Threader {
    backend: Arc<ExecBackend>,
    queue: Arc<JobQueue>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl Threader {
    /// Spawns `2 × pool cap` workers over a shared priority queue.
    pub fn new(backend: Arc<ExecBackend>) -> Arc<Self> {
        let worker_count = backend.pool().max_sessions() * 2;
        let queue = Arc::new(JobQueue {
            heap: StdMutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            pending: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue = queue.clone();
            let backend = backend.clone();
            workers.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, queue, backend).await;
            }));
        }
        info!("threader started with {} workers", worker_count);

        let threader = Arc::new(Self {
            backend: backend.clone(),
            queue,
            workers: StdMutex::new(workers),
        });
        backend.attach_threader(&threader);
        threader
    }

    /// Enqueues a container at its own priority.
    pub fn submit(&self, container: Arc<CommandContainer>) {
        self.submit_with_priority(container.options().priority, container);
    }

    /// Enqueues a container at an explicit priority. The queue orders by
    /// ascending priority, so higher values are scheduled later.
    pub fn submit_with_priority(&self, priority: i32, container: Arc<CommandContainer>) {
        debug!(
            "submitting {} at priority {}",
            container.key(),
            priority
        );
        self.queue.push(priority, container);
    }

    async fn worker_loop(worker_id: usize, queue: Arc<JobQueue>, backend: Arc<ExecBackend>) {
        loop {
            let job = loop {
                if queue.shutdown.load(AtomicOrdering::SeqCst) {
                    debug!("worker {} shutting down", worker_id);
                    return;
                }
                if let Some(job) = queue.pop() {
                    break job;
                }
                let _ = tokio::time::timeout(WORKER_IDLE_WAKE, queue.notify.notified()).await;
            };
            queue.running.fetch_add(1, AtomicOrdering::SeqCst);
            Self::run_job(&backend, job.container).await;
            queue.running.fetch_sub(1, AtomicOrdering::SeqCst);
        }
    }

    /// One job: lease an environment for leaf commands, drive the container,
    /// release. Containers with children orchestrate their own environments.
    async fn run_job(backend: &Arc<ExecBackend>, container: Arc<CommandContainer>) {
        debug!("running job for: {}", container.key());
        if container.has_children() {
            container.execute(backend, None).await;
            return;
        }

        let opts = container.options().clone();
        let lease = backend
            .pool()
            .lease(
                true,
                opts.label.as_deref(),
                opts.environment_id,
                opts.timeout,
                DEFAULT_DELAY.max(Duration::from_millis(100)),
            )
            .await;
        match lease {
            Ok(Some(mut lease)) => {
                container.execute(backend, Some(&mut lease)).await;
                backend.pool().release(lease);
            }
            Ok(None) => {
                warn!("no environment available for {}", container.key());
                container.abort(ToolkitError::ExecutionFailure(format!(
                    "no environment became available within {:?}",
                    opts.timeout
                )));
            }
            Err(e) => {
                warn!("environment lease failed for {}: {}", container.key(), e);
                container.abort(e);
            }
        }
    }

    /// Whether no job is queued or running.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    /// Blocks until the pool is idle or the timeout expires. Returns whether
    /// idle was reached.
    pub async fn wait_idle(&self, timeout: Duration, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.queue.is_idle() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(delay).await;
        }
        true
    }

    /// Quiesces the pool: waits for outstanding work, disconnects every
    /// environment (non-main first, then main and the transport), then stops
    /// the workers.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("shutting down the threader");
        if !self.wait_idle(timeout, Duration::from_millis(100)).await {
            warn!("threader still busy after {:?}, shutting down anyway", timeout);
        }
        self.backend.pool().disconnect_all().await;

        self.queue.shutdown.store(true, AtomicOrdering::SeqCst);
        self.queue.notify.notify_waiters();
        let workers = self
            .workers
            .lock()
            .map(|mut guard| guard.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for worker in workers {
            let _ = tokio::time::timeout(WORKER_IDLE_WAKE * 2, worker).await;
        }
        debug!("threader shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(priority: i32, seq: u64) -> Job {
        let container = CommandContainer::new(
            format!("echo {seq}"),
            crate::config::ExecuteOptions::default(),
            crate::command::HookSet::default(),
        )
        .expect("container");
        Job {
            priority,
            seq,
            container,
        }
    }

    #[test]
    fn queue_orders_by_ascending_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(job(10, 0));
        heap.push(job(1, 1));
        heap.push(job(5, 2));
        heap.push(job(5, 3));

        let order: Vec<(i32, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|j| (j.priority, j.seq))
            .collect();
        assert_eq!(order, vec![(1, 1), (5, 2), (5, 3), (10, 0)]);
    }
}
