//! # Cluster-backed distributed manager
//!
//! Every worker publishes requests onto one shared `"public"` queue and
//! reads its own responses from a private queue the manager mints per
//! trial (`uuid`-named, so two trials never collide even across
//! restarts) — this is exactly the role [`crate::ipc::queue::Queue`] was
//! written for from the worker's side. The manager side instead talks to
//! the [`ClusterClient`] primitives directly, since it has the opposite
//! role: it *reads* the shared public queue and *writes* to whichever
//! trial's private queue a response belongs to.
//!
//! Workers run as cluster tasks rather than OS processes. Cancellation
//! has no asynchronous-exception equivalent to lean on, so each task
//! also runs a small supervisor thread that polls a per-trial
//! `ClusterVariable<bool>` stop flag and trips a local
//! [`CancellationToken`] when the manager asks the task to stop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cancellation::CancellationToken;
use crate::cluster::{BoxedTask, ClusterClient, ClusterFuture, ClusterQueue, ClusterVariable, FutureStatus, WaitPolicy};
use crate::error::{Error, Result};
use crate::ipc::queue::{Queue, Timeout};
use crate::manager::OptimizationManager;
use crate::message::{Message, ResponseData, TrialId};
use crate::study::Study;
use crate::trial::Objective;
use crate::worker;

const PUBLIC_CHANNEL: &str = "trial-mux-public";
const SUPERVISOR_POLL: Duration = Duration::from_millis(100);

struct Worker {
    private_queue: Arc<dyn ClusterQueue>,
    stop_flag: Arc<dyn ClusterVariable<bool>>,
    cancellation: CancellationToken,
    future: Arc<dyn ClusterFuture>,
}

pub struct DistributedManager {
    client: Arc<dyn ClusterClient>,
    public_queue: Arc<dyn ClusterQueue>,
    n_trials_total: u64,
    issued: u64,
    max_concurrency: usize,
    workers: HashMap<TrialId, Worker>,
    finished: HashSet<TrialId>,
    heartbeat_interval: Duration,
    /// Trials whose future ended `Error`/`Cancelled`, handed off by a
    /// done-callback running on the task's own thread. `register_trial_exit`
    /// mutates `workers`/`finished` and so can only run on the event-loop
    /// thread; `recv_message` drains this before waiting on the next message.
    anonymous_exits: Arc<Mutex<Vec<TrialId>>>,
}

impl DistributedManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        n_trials: u64,
        max_concurrency: usize,
        heartbeat_interval: Duration,
    ) -> Self {
        let public_queue = client.new_queue(PUBLIC_CHANNEL);
        Self {
            client,
            public_queue,
            n_trials_total: n_trials,
            issued: 0,
            max_concurrency: max_concurrency.max(1),
            workers: HashMap::new(),
            finished: HashSet::new(),
            heartbeat_interval,
            anonymous_exits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn drain_anonymous_exits(&mut self) {
        let pending: Vec<TrialId> = self.anonymous_exits.lock().unwrap().drain(..).collect();
        for trial_id in pending {
            self.register_trial_exit(trial_id);
        }
    }

    fn spawn_one(&mut self, trial_id: TrialId, objective: Objective) {
        let private_name = format!("trial-mux-private-{}", uuid::Uuid::new_v4());
        let private_queue = self.client.new_queue(&private_name);
        let stop_flag = self.client.new_bool_variable(&format!("trial-mux-stop-{}", trial_id.0), false);
        let cancellation = CancellationToken::new();

        let task_client = self.client.clone();
        let task_stop_flag = stop_flag.clone();
        let task_cancellation = cancellation.clone();
        let task: BoxedTask = Box::new(move || {
            let supervisor_cancellation = task_cancellation.clone();
            let supervisor_flag = task_stop_flag.clone();
            let supervisor = std::thread::spawn(move || {
                while !supervisor_cancellation.is_cancelled() {
                    if supervisor_flag.get() {
                        supervisor_cancellation.cancel();
                        break;
                    }
                    std::thread::sleep(SUPERVISOR_POLL);
                }
            });

            let connection = Queue::new(
                task_client,
                PUBLIC_CHANNEL,
                Some(private_name),
                Timeout::Fixed(Duration::from_secs(60)),
            );
            let outcome = worker::run_worker(trial_id, Box::new(connection), task_cancellation.clone(), objective);
            task_cancellation.cancel();
            let _ = supervisor.join();
            outcome
        });

        let future = self.client.submit(vec![task]).into_iter().next().expect("submitted exactly one task");

        let done_public_queue = self.public_queue.clone();
        let done_exits = self.anonymous_exits.clone();
        future.on_done(Box::new(move |status| {
            if matches!(status, FutureStatus::Error | FutureStatus::Cancelled) {
                done_exits.lock().unwrap().push(trial_id);
                if let Ok(bytes) = Message::Heartbeat.to_bytes() {
                    done_public_queue.put(bytes);
                }
            }
        }));

        self.workers.insert(trial_id, Worker { private_queue, stop_flag, cancellation, future });
    }
}

impl OptimizationManager for DistributedManager {
    fn fill_workers(&mut self, study: &mut dyn Study, objective: &Objective) -> Result<()> {
        while self.issued < self.n_trials_total && self.workers.len() < self.max_concurrency {
            let trial_id = study.ask();
            self.issued += 1;
            self.spawn_one(trial_id, objective.clone());
        }
        Ok(())
    }

    fn recv_message(&mut self, poll_timeout: Duration) -> Result<Message> {
        self.drain_anonymous_exits();
        if self.workers.is_empty() {
            std::thread::sleep(poll_timeout);
            return Ok(Message::Heartbeat);
        }
        let wait = poll_timeout.min(self.heartbeat_interval);
        match self.public_queue.get(WaitPolicy::Timeout(wait)) {
            Ok(bytes) => Message::from_bytes(&bytes),
            Err(Error::Timeout(_)) => Ok(Message::Heartbeat),
            Err(e) => Err(e),
        }
    }

    fn respond(&mut self, trial_id: TrialId, data: ResponseData) -> Result<()> {
        let worker = self.workers.get(&trial_id).ok_or(Error::UnknownTrial(trial_id))?;
        let bytes = Message::response(trial_id, data).to_bytes()?;
        worker.private_queue.put(bytes);
        Ok(())
    }

    fn register_trial_exit(&mut self, trial_id: TrialId) {
        self.finished.insert(trial_id);
        self.workers.remove(&trial_id);
    }

    fn stop_optimization(&mut self, patience: Duration) -> Result<()> {
        for worker in self.workers.values() {
            worker.stop_flag.set(true);
            worker.cancellation.cancel();
            worker.future.cancel();
        }
        let deadline = Instant::now() + patience;
        for worker in self.workers.values() {
            loop {
                if worker.future.status() != FutureStatus::Pending {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(Error::StopTimeout(patience));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        self.workers.clear();
        Ok(())
    }

    fn should_end_optimization(&self) -> bool {
        self.issued >= self.n_trials_total && self.workers.is_empty()
    }

    fn is_repeated(&self, trial_id: TrialId) -> bool {
        self.finished.contains(&trial_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::study::InMemoryStudy;
    use std::sync::Arc;

    #[test]
    fn runs_trials_to_completion_over_a_local_cluster() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(LocalCluster::new());
        let mut manager = DistributedManager::new(cluster, 2, 2, Duration::from_secs(60));
        let mut study = InMemoryStudy::new();
        let objective: Objective = Arc::new(|trial: &mut crate::trial::RemoteTrial| {
            let x = trial.suggest_float("x", 0.0, 1.0)?;
            Ok(vec![x])
        });

        manager.fill_workers(&mut study, &objective).unwrap();
        let mut completed = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while completed < 2 && Instant::now() < deadline {
            let message = manager.recv_message(Duration::from_millis(200)).unwrap();
            message.process(&mut study, &mut manager).unwrap();
            if message.closing() {
                completed += 1;
            }
            manager.fill_workers(&mut study, &objective).unwrap();
        }
        assert_eq!(completed, 2);
        assert!(manager.should_end_optimization());
    }
}
