//! Per-owner ordered execution of blocking storage work.
//!
//! Every owner gets a lane: a FIFO of jobs drained by one task at a time, so
//! jobs for the same owner never overlap and run in submission order. Lanes
//! for different owners run in parallel, bounded by a shared worker
//! semaphore. A lane exists only while it has work.

use crate::core::{Result, VaultError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tracing::{Level, event};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub active_lanes: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Shared {
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    workers: Arc<Semaphore>,
    counters: Counters,
    idle: Notify,
}

/// Handle to a submitted operation. Resolves to the operation's own result.
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(VaultError::ExecutionError(
                    "sequenced operation aborted before completing".to_string(),
                ))
            })
        })
    }
}

#[derive(Clone)]
pub struct TaskSequencer {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl TaskSequencer {
    /// Creates a sequencer bound to the current tokio runtime.
    pub fn new(workers: usize) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            VaultError::ExecutionError(format!("task sequencer needs a tokio runtime: {}", err))
        })?;
        Ok(Self::with_runtime(workers, runtime))
    }

    pub fn with_runtime(workers: usize, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                lanes: Mutex::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(workers.max(1))),
                counters: Counters::default(),
                idle: Notify::new(),
            }),
            runtime,
        }
    }

    /// Queues `op` behind every earlier operation for `owner_id`.
    ///
    /// The job is enqueued before this returns, so submission order is call
    /// order even if the returned future is polled later.
    pub fn submit<T, F>(&self, owner_id: &str, op: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        let job: Job = Box::new(move || {
            let result = op();
            if result.is_err() {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            let _ = tx.send(result);
        });

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if let Err(job) = self.enqueue(owner_id, job) {
            // Only reachable with a poisoned lane map; fail the caller instead of the scheduler.
            drop(job);
            event!(Level::ERROR, owner = owner_id, "task sequencer lane map poisoned");
        }
        Completion { rx }
    }

    fn enqueue(&self, owner_id: &str, job: Job) -> std::result::Result<(), Job> {
        let Ok(mut lanes) = self.shared.lanes.lock() else {
            return Err(job);
        };

        if let Some(lane) = lanes.get(owner_id) {
            match lane.send(job) {
                Ok(()) => return Ok(()),
                // The drain task is gone; fall through and start a fresh lane.
                Err(mpsc::error::SendError(job)) => return self.start_lane(&mut lanes, owner_id, job),
            }
        }
        self.start_lane(&mut lanes, owner_id, job)
    }

    fn start_lane(
        &self,
        lanes: &mut HashMap<String, mpsc::UnboundedSender<Job>>,
        owner_id: &str,
        job: Job,
    ) -> std::result::Result<(), Job> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(mpsc::error::SendError(job)) = tx.send(job) {
            return Err(job);
        }
        lanes.insert(owner_id.to_string(), tx);
        self.runtime
            .spawn(drain_lane(self.shared.clone(), owner_id.to_string(), rx));
        Ok(())
    }

    /// Resolves once no lane has queued or running work.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let idle = self
                .shared
                .lanes
                .lock()
                .map(|lanes| lanes.is_empty())
                .unwrap_or(true);
            if idle {
                return;
            }
            notified.await;
        }
    }

    pub fn available_workers(&self) -> usize {
        self.shared.workers.available_permits()
    }

    pub fn stats(&self) -> SequencerStats {
        let counters = &self.shared.counters;
        SequencerStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            active_lanes: self.shared.lanes.lock().map(|lanes| lanes.len()).unwrap_or(0),
        }
    }
}

async fn drain_lane(shared: Arc<Shared>, owner_id: String, mut rx: mpsc::UnboundedReceiver<Job>) {
    loop {
        let job = match rx.try_recv() {
            Ok(job) => job,
            Err(_) => {
                // Submitters send while holding the lane map, so an empty
                // queue seen under the same lock stays empty until we retire.
                let Ok(mut lanes) = shared.lanes.lock() else {
                    return;
                };
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        lanes.remove(&owner_id);
                        drop(lanes);
                        shared.idle.notify_waiters();
                        return;
                    }
                }
            }
        };

        let Ok(permit) = shared.workers.clone().acquire_owned().await else {
            return;
        };
        if let Err(err) = tokio::task::spawn_blocking(job).await {
            event!(Level::ERROR, owner = %owner_id, error = %err, "sequenced operation panicked");
        }
        drop(permit);
    }
}
