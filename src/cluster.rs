//! # Cluster runtime abstraction
//!
//! The distributed manager submits worker tasks to, and shares state
//! through, an external compute cluster. This module defines the narrow
//! trait surface the distributed manager actually needs (task submission,
//! named byte queues, named shared variables) plus [`LocalCluster`], an
//! in-process stand-in used by the demo binary and the test suite so the
//! dispatch core can be exercised without a real cluster dependency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Per-trial worker lifecycle state, published through a
/// [`ClusterVariable`] so a supervisor thread running inside the worker
/// can observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Waiting,
    Running,
    Finished,
}

/// Terminal outcome of a worker task, translated into exactly one
/// closing message by [`crate::message::Message::from_task_outcome`].
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(Vec<f64>),
    Pruned(String),
    Failed { message: String, diagnostic: String },
    /// The task observed a cooperative interrupt and unwound without
    /// producing a result; the main side learns about the exit through
    /// future cancellation instead.
    Interrupted,
}

/// Status of a submitted cluster future, as reported to done-callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    Pending,
    Finished,
    Error,
    Cancelled,
}

/// How a [`ClusterQueue::get`] caller is willing to wait. Specifying both
/// a fixed timeout and a retry budget is a configuration error — the two
/// are mutually exclusive.
#[derive(Debug, Clone, Copy)]
pub enum WaitPolicy {
    Timeout(Duration),
    /// Exponential backoff: attempt `k` waits `2^k` seconds, up to
    /// `max_attempts`, after which a timeout is reported.
    Backoff { max_attempts: u32 },
}

/// A named, many-writer/reader-counted byte queue.
pub trait ClusterQueue: Send + Sync {
    fn put(&self, payload: Vec<u8>);
    fn get(&self, wait: WaitPolicy) -> Result<Vec<u8>>;
}

/// A named shared variable with last-writer-wins semantics — sufficient
/// for the stop flag and per-task state, both of which tolerate a
/// monotonic overwrite.
pub trait ClusterVariable<T>: Send + Sync {
    fn get(&self) -> T;
    fn set(&self, value: T);
}

/// A handle to a submitted task's execution.
pub trait ClusterFuture: Send + Sync {
    fn status(&self) -> FutureStatus;
    /// Request cancellation. Best-effort: a task already running may not
    /// observe this unless it cooperates via a [`crate::cancellation::CancellationToken`].
    fn cancel(&self);
    /// Register a callback invoked once the task reaches a terminal
    /// status. May fire immediately if the task is already terminal.
    fn on_done(&self, callback: Box<dyn FnOnce(FutureStatus) + Send>);
}

pub type BoxedTask = Box<dyn FnOnce() -> TaskOutcome + Send>;

/// The external cluster collaborator's client surface.
pub trait ClusterClient: Send + Sync {
    fn new_queue(&self, name: &str) -> Arc<dyn ClusterQueue>;
    fn new_bool_variable(&self, name: &str, initial: bool) -> Arc<dyn ClusterVariable<bool>>;
    fn new_state_variable(&self, name: &str, initial: TaskState) -> Arc<dyn ClusterVariable<TaskState>>;
    /// Submit independent tasks for concurrent execution, returning one
    /// future per task in submission order.
    fn submit(&self, tasks: Vec<BoxedTask>) -> Vec<Arc<dyn ClusterFuture>>;
}

// ---------------------------------------------------------------------
// In-process reference implementation
// ---------------------------------------------------------------------

struct LocalQueueState {
    sender: crossbeam::channel::Sender<Vec<u8>>,
    receiver: Mutex<crossbeam::channel::Receiver<Vec<u8>>>,
}

struct LocalQueue {
    state: Arc<LocalQueueState>,
}

impl ClusterQueue for LocalQueue {
    fn put(&self, payload: Vec<u8>) {
        // An in-process stand-in queue never has a full buffer worth
        // rejecting; a real cluster queue would apply backpressure here.
        let _ = self.state.sender.send(payload);
    }

    fn get(&self, wait: WaitPolicy) -> Result<Vec<u8>> {
        let receiver = self.state.receiver.lock().unwrap();
        match wait {
            WaitPolicy::Timeout(timeout) => receiver
                .recv_timeout(timeout)
                .map_err(|_| Error::Timeout("cluster queue get".to_string())),
            WaitPolicy::Backoff { max_attempts } => {
                for attempt in 0..max_attempts {
                    let backoff = Duration::from_secs(1u64 << attempt.min(20));
                    if let Ok(payload) = receiver.recv_timeout(backoff) {
                        return Ok(payload);
                    }
                }
                Err(Error::Timeout("cluster queue get (backoff exhausted)".to_string()))
            }
        }
    }
}

struct LocalVariable<T> {
    value: RwLock<T>,
}

impl<T: Clone + Send + Sync> ClusterVariable<T> for LocalVariable<T> {
    fn get(&self) -> T {
        self.value.read().clone()
    }

    fn set(&self, value: T) {
        *self.value.write() = value;
    }
}

struct LocalFuture {
    status: Arc<Mutex<FutureStatus>>,
    callbacks: Arc<Mutex<Vec<Box<dyn FnOnce(FutureStatus) + Send>>>>,
}

impl ClusterFuture for LocalFuture {
    fn status(&self) -> FutureStatus {
        *self.status.lock().unwrap()
    }

    fn cancel(&self) {
        let mut status = self.status.lock().unwrap();
        if *status == FutureStatus::Pending {
            *status = FutureStatus::Cancelled;
        }
    }

    fn on_done(&self, callback: Box<dyn FnOnce(FutureStatus) + Send>) {
        let current = *self.status.lock().unwrap();
        if current != FutureStatus::Pending {
            callback(current);
        } else {
            self.callbacks.lock().unwrap().push(callback);
        }
    }
}

fn finish_future(status_slot: &Arc<Mutex<FutureStatus>>, callbacks: &Arc<Mutex<Vec<Box<dyn FnOnce(FutureStatus) + Send>>>>, terminal: FutureStatus) {
    {
        let mut status = status_slot.lock().unwrap();
        if *status == FutureStatus::Cancelled {
            // Already marked cancelled ahead of execution; don't downgrade.
        } else {
            *status = terminal;
        }
    }
    let observed = *status_slot.lock().unwrap();
    for cb in callbacks.lock().unwrap().drain(..) {
        cb(observed);
    }
}

/// An in-process, thread-backed stand-in for a real compute cluster.
/// Queues are `crossbeam` channels, variables are `parking_lot`-guarded
/// cells, and "submission" spawns one OS thread per task — enough
/// structure to exercise the distributed manager's protocol end to end
/// without an actual cluster dependency.
pub struct LocalCluster {
    queues: Mutex<HashMap<String, Arc<LocalQueueState>>>,
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCluster {
    pub fn new() -> Self {
        Self { queues: Mutex::new(HashMap::new()) }
    }

    fn queue_state(&self, name: &str) -> Arc<LocalQueueState> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = crossbeam::channel::unbounded();
                Arc::new(LocalQueueState { sender, receiver: Mutex::new(receiver) })
            })
            .clone()
    }
}

impl ClusterClient for LocalCluster {
    fn new_queue(&self, name: &str) -> Arc<dyn ClusterQueue> {
        Arc::new(LocalQueue { state: self.queue_state(name) })
    }

    fn new_bool_variable(&self, _name: &str, initial: bool) -> Arc<dyn ClusterVariable<bool>> {
        Arc::new(LocalVariable { value: RwLock::new(initial) })
    }

    fn new_state_variable(&self, _name: &str, initial: TaskState) -> Arc<dyn ClusterVariable<TaskState>> {
        Arc::new(LocalVariable { value: RwLock::new(initial) })
    }

    fn submit(&self, tasks: Vec<BoxedTask>) -> Vec<Arc<dyn ClusterFuture>> {
        tasks
            .into_iter()
            .map(|task| {
                let status = Arc::new(Mutex::new(FutureStatus::Pending));
                let callbacks: Arc<Mutex<Vec<Box<dyn FnOnce(FutureStatus) + Send>>>> =
                    Arc::new(Mutex::new(Vec::new()));
                let thread_status = status.clone();
                let thread_callbacks = callbacks.clone();
                std::thread::spawn(move || {
                    if *thread_status.lock().unwrap() == FutureStatus::Cancelled {
                        finish_future(&thread_status, &thread_callbacks, FutureStatus::Cancelled);
                        return;
                    }
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
                    let terminal = match outcome {
                        Ok(TaskOutcome::Failed { .. }) => FutureStatus::Error,
                        Ok(_) => FutureStatus::Finished,
                        Err(_) => FutureStatus::Error,
                    };
                    finish_future(&thread_status, &thread_callbacks, terminal);
                });
                Arc::new(LocalFuture { status, callbacks }) as Arc<dyn ClusterFuture>
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_round_trips_with_a_fixed_timeout() {
        let cluster = LocalCluster::new();
        let q = cluster.new_queue("public");
        q.put(vec![1, 2, 3]);
        let got = q.get(WaitPolicy::Timeout(Duration::from_secs(1))).unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn queue_get_times_out_when_empty() {
        let cluster = LocalCluster::new();
        let q = cluster.new_queue("empty");
        let result = q.get(WaitPolicy::Timeout(Duration::from_millis(20)));
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn variable_set_is_visible_to_other_handles() {
        let cluster = LocalCluster::new();
        let var = cluster.new_bool_variable("stop", true);
        var.set(false);
        assert!(!var.get());
    }

    #[test]
    fn submitted_task_runs_and_notifies_done_callback() {
        let cluster = LocalCluster::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let futures = cluster.submit(vec![Box::new(|| TaskOutcome::Completed(vec![1.0]))]);
        futures[0].on_done(Box::new(move |status| {
            tx.send(status).unwrap();
        }));
        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, FutureStatus::Finished);
    }

    #[test]
    fn failed_task_is_reported_as_error_status() {
        let cluster = LocalCluster::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let futures = cluster.submit(vec![Box::new(|| TaskOutcome::Failed {
            message: "boom".into(),
            diagnostic: "trace".into(),
        })]);
        futures[0].on_done(Box::new(move |status| {
            tx.send(status).unwrap();
        }));
        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, FutureStatus::Error);
    }
}
