//! # Event loop
//!
//! Everything in this crate funnels through one synchronous loop, on one
//! thread: ask the manager to fill its worker budget, block for the next
//! message, dispatch it against the study, repeat. Uncaught trial
//! failures and optimization timeouts both end the run the same way —
//! fail whatever is still in flight, ask the manager to stop, and
//! surface (or swallow, per `catch`) the error.

use std::time::{Duration, Instant};

use crate::error::{CatchPredicate, Result};
use crate::manager::OptimizationManager;
use crate::message::Message;
use crate::study::Study;
use crate::terminal::ProgressReporter;
use crate::trial::Objective;

/// How often the loop re-checks its own timeout and worker budget when
/// no message is otherwise ready.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct EventLoop<'a, M: OptimizationManager> {
    study: &'a mut dyn Study,
    manager: M,
}

impl<'a, M: OptimizationManager> EventLoop<'a, M> {
    pub fn new(study: &'a mut dyn Study, manager: M) -> Self {
        Self { study, manager }
    }

    /// Drives trials to completion: `n_trials` worth of `objective` runs,
    /// bounded by `timeout` if given. `catch` decides which trial
    /// failures are swallowed rather than ending the run.
    pub fn run(
        &mut self,
        objective: Objective,
        terminal: &dyn ProgressReporter,
        timeout: Option<Duration>,
        catch: CatchPredicate,
        stop_patience: Duration,
    ) -> Result<()> {
        let start = Instant::now();

        loop {
            self.manager.fill_workers(&mut *self.study, &objective)?;

            if self.manager.should_end_optimization() {
                break;
            }

            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    tracing::warn!(?timeout, "optimization timed out, stopping in-flight trials");
                    let _ = self.study.fail_unfinished_trials();
                    self.manager.stop_optimization(stop_patience)?;
                    terminal.finish();
                    return Ok(());
                }
            }

            let message = self.manager.recv_message(POLL_INTERVAL)?;

            if message.closing() {
                if let Some(trial_id) = message.trial_id() {
                    if self.manager.is_repeated(trial_id) {
                        tracing::debug!(trial = trial_id.0, "dropping duplicate closing message");
                        continue;
                    }
                }
            }

            match message.process(&mut *self.study, &mut self.manager) {
                Ok(()) => {
                    if message.closing() {
                        terminal.advance();
                    }
                }
                Err(e) if catch(&e) => {
                    tracing::warn!(error = %e, "caught trial failure, continuing optimization");
                    if message.closing() {
                        terminal.advance();
                    }
                }
                Err(e) => {
                    let _ = self.study.fail_unfinished_trials();
                    self.manager.stop_optimization(stop_patience)?;
                    terminal.finish();
                    return Err(e);
                }
            }
        }

        terminal.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterClient, LocalCluster};
    use crate::manager::distributed::DistributedManager;
    use crate::study::InMemoryStudy;
    use std::sync::Arc;

    struct SilentTerminal;
    impl ProgressReporter for SilentTerminal {
        fn advance(&self) {}
        fn finish(&self) {}
    }

    #[test]
    fn drives_every_trial_to_completion() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(LocalCluster::new());
        let manager = DistributedManager::new(cluster, 3, 3, Duration::from_secs(60));
        let mut study = InMemoryStudy::new();
        let objective: Objective = Arc::new(|trial: &mut crate::trial::RemoteTrial| {
            let x = trial.suggest_float("x", 0.0, 1.0)?;
            Ok(vec![x])
        });

        let mut event_loop = EventLoop::new(&mut study, manager);
        event_loop
            .run(objective, &SilentTerminal, Some(Duration::from_secs(5)), crate::error::catch_none, Duration::from_secs(2))
            .unwrap();

        assert_eq!(study.trial_count(), 3);
    }

    #[test]
    fn uncaught_failure_stops_the_run_and_propagates() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(LocalCluster::new());
        let manager = DistributedManager::new(cluster, 2, 2, Duration::from_secs(60));
        let mut study = InMemoryStudy::new();
        let objective: Objective = Arc::new(|_trial: &mut crate::trial::RemoteTrial| {
            Err(crate::trial::ObjectiveError::Failed {
                message: "deliberate".to_string(),
                diagnostic: "test".to_string(),
            })
        });

        let mut event_loop = EventLoop::new(&mut study, manager);
        let result = event_loop.run(
            objective,
            &SilentTerminal,
            Some(Duration::from_secs(5)),
            crate::error::catch_none,
            Duration::from_secs(2),
        );
        assert!(result.is_err());
    }
}
