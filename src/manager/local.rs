//! # Fork-based local manager
//!
//! One OS process per trial, talking over a duplex Unix domain socket.
//!
//! Python's default multiprocessing start method is `fork`, so a worker
//! process inherits the parent's entire address space — including
//! whatever closures the objective captures. `std::process::Command`
//! cannot reproduce that (it re-execs a separate binary); `nix::unistd::fork`
//! forks the running process in place instead, the same technique the
//! PVF prepare-worker reference file uses to sandbox a single compiled
//! artifact. Duplex IPC comes from `UnixStream::pair()` rather than that
//! file's one-way `os_pipe`, since the objective needs bidirectional
//! request/response traffic, not just a result handoff.
//!
//! Only available on Unix: `fork` has no portable equivalent, so
//! constructing this manager on another platform is a
//! [`crate::error::Error::Platform`] error.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};
use crate::manager::OptimizationManager;
use crate::message::{Message, ResponseData, TrialId};
use crate::study::Study;
use crate::trial::Objective;

/// The manager's own bounded wait between polls, independent of whatever
/// the event loop asks for.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::os::unix::io::AsRawFd;

    use nix::sys::signal::{self, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{fork, ForkResult, Pid};

    use crate::cancellation::CancellationToken;
    use crate::ipc::pipe::Pipe;
    use crate::worker;

    struct Worker {
        pipe: Pipe,
        pid: Pid,
        cancellation: CancellationToken,
    }

    pub struct LocalManager {
        n_trials_total: u64,
        issued: u64,
        n_jobs: usize,
        workers: HashMap<TrialId, Worker>,
        finished: HashSet<TrialId>,
        poll: Poll,
        next_token: usize,
        tokens: HashMap<Token, TrialId>,
    }

    impl LocalManager {
        pub fn new(n_trials: u64, n_jobs: i64) -> Result<Self> {
            let n_jobs = if n_jobs <= 0 { num_cpus::get() } else { n_jobs as usize };
            Ok(Self {
                n_trials_total: n_trials,
                issued: 0,
                n_jobs: n_jobs.max(1),
                workers: HashMap::new(),
                finished: HashSet::new(),
                poll: Poll::new().map_err(|e| Error::Process(format!("failed to create poller: {e}")))?,
                next_token: 0,
                tokens: HashMap::new(),
            })
        }

        fn spawn_one(&mut self, trial_id: TrialId, objective: Objective) -> Result<()> {
            let (mut main_end, worker_end) =
                Pipe::pair().map_err(|e| Error::Process(format!("socketpair failed: {e}")))?;
            let cancellation = CancellationToken::new();

            // SAFETY: this process has not spawned any other threads
            // that hold locks the child might deadlock on by the time we
            // fork here; the child only ever touches its own end of the
            // freshly-created socketpair and then execs the objective.
            let fork_result =
                unsafe { fork() }.map_err(|errno| Error::Process(format!("fork failed: {errno}")))?;

            match fork_result {
                ForkResult::Child => {
                    drop(main_end);
                    worker::run_worker(trial_id, Box::new(worker_end), cancellation, objective);
                    std::process::exit(0);
                }
                ForkResult::Parent { child } => {
                    drop(worker_end);
                    main_end
                        .set_read_timeout(Some(Duration::from_millis(50)))
                        .map_err(|e| Error::Process(format!("failed to set read timeout: {e}")))?;
                    let raw_fd = main_end.as_raw_fd();
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&raw_fd), token, Interest::READABLE)
                        .map_err(|e| Error::Process(format!("failed to register worker fd: {e}")))?;
                    self.tokens.insert(token, trial_id);
                    self.workers.insert(trial_id, Worker { pipe: main_end, pid: child, cancellation });
                    Ok(())
                }
            }
        }

        fn deregister(&mut self, trial_id: TrialId) -> Option<Worker> {
            let worker = self.workers.remove(&trial_id)?;
            let raw_fd = worker.pipe.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&raw_fd));
            self.tokens.retain(|_, id| *id != trial_id);
            Some(worker)
        }
    }

    impl OptimizationManager for LocalManager {
        fn fill_workers(&mut self, study: &mut dyn Study, objective: &Objective) -> Result<()> {
            while self.issued < self.n_trials_total && self.workers.len() < self.n_jobs {
                let trial_id = study.ask();
                self.issued += 1;
                self.spawn_one(trial_id, objective.clone())?;
            }
            Ok(())
        }

        fn recv_message(&mut self, poll_timeout: Duration) -> Result<Message> {
            if self.workers.is_empty() {
                std::thread::sleep(poll_timeout.min(MAX_POLL_INTERVAL));
                return Ok(Message::Heartbeat);
            }

            let mut events = Events::with_capacity(self.workers.len().max(1));
            let wait = poll_timeout.min(MAX_POLL_INTERVAL);
            self.poll
                .poll(&mut events, Some(wait))
                .map_err(|e| Error::Process(format!("poll failed: {e}")))?;

            for event in events.iter() {
                let Some(&trial_id) = self.tokens.get(&event.token()) else { continue };
                let Some(worker) = self.workers.get_mut(&trial_id) else { continue };
                match worker.pipe.get() {
                    Ok(message) => return Ok(message),
                    Err(Error::Timeout(_)) => continue,
                    Err(Error::Closed) => {
                        // The worker exited without posting a closing message
                        // (crash, OOM-kill, bare `exit`). Treated as an
                        // anonymous exit rather than a re-raising failure, so
                        // one ungraceful worker doesn't tear down the whole
                        // run: absorb it and let the other trials finish.
                        tracing::warn!(
                            trial = trial_id.0,
                            "worker process exited without posting a result"
                        );
                        self.register_trial_exit(trial_id);
                        return Ok(Message::Heartbeat);
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(Message::Heartbeat)
        }

        fn respond(&mut self, trial_id: TrialId, data: ResponseData) -> Result<()> {
            let worker = self.workers.get_mut(&trial_id).ok_or(Error::UnknownTrial(trial_id))?;
            worker.pipe.put(Message::response(trial_id, data))
        }

        fn register_trial_exit(&mut self, trial_id: TrialId) {
            self.finished.insert(trial_id);
            if let Some(worker) = self.deregister(trial_id) {
                // The closing message we just processed was the last
                // thing the worker does before `process::exit`, so a
                // blocking wait here is brief.
                let _ = waitpid(worker.pid, None);
            }
        }

        fn stop_optimization(&mut self, patience: Duration) -> Result<()> {
            let pids: Vec<Pid> = self.workers.values().map(|w| w.pid).collect();
            for worker in self.workers.values() {
                worker.cancellation.cancel();
                let _ = signal::kill(worker.pid, Signal::SIGKILL);
            }

            let deadline = Instant::now() + patience;
            for pid in pids {
                let mut reaped = false;
                while Instant::now() < deadline {
                    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(20)),
                        _ => {
                            reaped = true;
                            break;
                        }
                    }
                }
                if !reaped {
                    return Err(Error::StopTimeout(patience));
                }
            }
            self.workers.clear();
            self.tokens.clear();
            Ok(())
        }

        fn should_end_optimization(&self) -> bool {
            self.issued >= self.n_trials_total && self.workers.is_empty()
        }

        fn is_repeated(&self, trial_id: TrialId) -> bool {
            self.finished.contains(&trial_id)
        }
    }
}

#[cfg(unix)]
pub use unix_impl::LocalManager;

/// On non-Unix targets there is no `fork`, so the local backend cannot
/// exist at all; the facade rejects it at construction.
#[cfg(not(unix))]
pub struct LocalManager(());

#[cfg(not(unix))]
impl LocalManager {
    pub fn new(_n_trials: u64, _n_jobs: i64) -> Result<Self> {
        Err(Error::Platform(
            "the local backend requires fork(), which is unavailable on this platform".to_string(),
        ))
    }
}

#[cfg(not(unix))]
impl OptimizationManager for LocalManager {
    fn fill_workers(&mut self, _study: &mut dyn Study, _objective: &Objective) -> Result<()> {
        unreachable!("LocalManager::new always fails on non-Unix targets")
    }
    fn recv_message(&mut self, _poll_timeout: Duration) -> Result<Message> {
        unreachable!("LocalManager::new always fails on non-Unix targets")
    }
    fn respond(&mut self, _trial_id: TrialId, _data: ResponseData) -> Result<()> {
        unreachable!("LocalManager::new always fails on non-Unix targets")
    }
    fn register_trial_exit(&mut self, _trial_id: TrialId) {}
    fn stop_optimization(&mut self, _patience: Duration) -> Result<()> {
        unreachable!("LocalManager::new always fails on non-Unix targets")
    }
    fn should_end_optimization(&self) -> bool {
        true
    }
    fn is_repeated(&self, _trial_id: TrialId) -> bool {
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::study::InMemoryStudy;
    use std::sync::Arc;

    #[test]
    fn runs_two_trials_to_completion() {
        let mut manager = LocalManager::new(2, 2).unwrap();
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
