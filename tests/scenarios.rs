//! End-to-end scenarios exercising `DistributedStudy::optimize` over both
//! backends, plus the worker-level dedup guard that only shows up under a
//! simulated cluster retry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use trial_mux::cancellation::CancellationToken;
use trial_mux::cluster::{ClusterClient, LocalCluster, TaskOutcome};
use trial_mux::error::Error;
use trial_mux::ipc::pipe::Pipe;
use trial_mux::message::{Message, ResponseData, TrialId};
use trial_mux::study::{DistributedStudy, InMemoryStudy, OptimizeConfig, TrialState};
use trial_mux::trial::{Objective, ObjectiveError, RemoteTrial};
use trial_mux::worker;

#[cfg(unix)]
#[test]
fn ten_trials_over_two_workers_all_complete_with_the_reported_value() {
    let objective: Objective = Arc::new(|_trial: &mut RemoteTrial| Ok(vec![1.0]));
    let mut study = DistributedStudy::from_study(InMemoryStudy::new(), None);

    study
        .optimize(
            objective,
            OptimizeConfig { n_trials: 10, n_jobs: 2, ..Default::default() },
        )
        .unwrap();

    assert_eq!(study.trial_count(), 10);
    assert_eq!(study.best_value(), Some(1.0));
    for id in 0..10 {
        assert_eq!(study.study().trial_state(TrialId(id)), Some(TrialState::Complete));
    }
}

#[cfg(unix)]
#[test]
fn an_uncaught_failure_stops_the_run_and_fails_whatever_is_in_flight() {
    let objective: Objective = Arc::new(|_trial: &mut RemoteTrial| {
        Err(ObjectiveError::Failed { message: "deliberate".to_string(), diagnostic: "test".to_string() })
    });
    let mut study = DistributedStudy::from_study(InMemoryStudy::new(), None);

    let result = study.optimize(
        objective,
        OptimizeConfig { n_trials: 5, n_jobs: 1, ..Default::default() },
    );

    assert!(matches!(result, Err(Error::TrialFailed { .. })));
    assert!(study.trial_count() >= 1);
    for id in 0..study.trial_count() as u64 {
        assert_eq!(study.study().trial_state(TrialId(id)), Some(TrialState::Fail));
    }
}

#[cfg(unix)]
#[test]
fn a_caught_failure_lets_every_trial_run_and_end_failed() {
    fn catch_everything(_: &Error) -> bool {
        true
    }

    let objective: Objective = Arc::new(|_trial: &mut RemoteTrial| {
        Err(ObjectiveError::Failed { message: "deliberate".to_string(), diagnostic: "test".to_string() })
    });
    let mut study = DistributedStudy::from_study(InMemoryStudy::new(), None);

    study
        .optimize(
            objective,
            OptimizeConfig { n_trials: 5, n_jobs: 1, catch: catch_everything, ..Default::default() },
        )
        .unwrap();

    assert_eq!(study.trial_count(), 5);
    assert_eq!(study.best_value(), None);
    for id in 0..5 {
        assert_eq!(study.study().trial_state(TrialId(id)), Some(TrialState::Fail));
    }
}

#[cfg(unix)]
#[test]
fn a_timeout_ends_the_run_before_a_slow_objective_finishes() {
    let objective: Objective = Arc::new(|_trial: &mut RemoteTrial| {
        std::thread::sleep(Duration::from_secs(5));
        Ok(vec![0.0])
    });
    let mut study = DistributedStudy::from_study(InMemoryStudy::new(), None);

    let start = Instant::now();
    study
        .optimize(
            objective,
            OptimizeConfig {
                n_trials: 1,
                n_jobs: 1,
                timeout: Some(Duration::from_millis(200)),
                interrupt_patience: Duration::from_secs(2),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(4), "optimize should return well before the objective sleeps out");
    assert_eq!(study.study().trial_state(TrialId(0)), Some(TrialState::Fail));
    assert_eq!(study.best_value(), None);
}

#[test]
fn distributed_trials_each_receive_their_own_suggested_value_back() {
    let cluster: Arc<dyn ClusterClient> = Arc::new(LocalCluster::new());
    let objective: Objective = Arc::new(|trial: &mut RemoteTrial| {
        let id = trial.number().0 as i64;
        let value = trial.suggest_int("x", id, id)?;
        Ok(vec![value as f64])
    });
    let mut study = DistributedStudy::from_study(InMemoryStudy::new(), Some(cluster));

    study
        .optimize(objective, OptimizeConfig { n_trials: 6, n_jobs: 3, ..Default::default() })
        .unwrap();

    assert_eq!(study.trial_count(), 6);
    for id in 0..6 {
        assert_eq!(study.study().trial_value(TrialId(id)), Some(id as f64));
    }
}

#[test]
fn a_worker_retried_after_finishing_does_not_rerun_the_objective() {
    let run_count = Arc::new(AtomicUsize::new(0));
    let objective: Objective = {
        let run_count = run_count.clone();
        Arc::new(move |_trial: &mut RemoteTrial| {
            run_count.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.0])
        })
    };

    let (mut first_main, first_worker) = Pipe::pair().unwrap();
    first_main.put(Message::response(TrialId(42), ResponseData::Bool(false))).unwrap();
    let first_outcome =
        worker::run_worker(TrialId(42), Box::new(first_worker), CancellationToken::new(), objective.clone());
    assert!(matches!(first_outcome, TaskOutcome::Completed(values) if values == vec![0.0]));

    // A cluster retry of the same task: the manager now reports the trial
    // as already finished, so the worker must skip the objective entirely.
    let (mut second_main, second_worker) = Pipe::pair().unwrap();
    second_main.put(Message::response(TrialId(42), ResponseData::Bool(true))).unwrap();
    let second_outcome =
        worker::run_worker(TrialId(42), Box::new(second_worker), CancellationToken::new(), objective);
    assert!(matches!(second_outcome, TaskOutcome::Interrupted));

    assert_eq!(run_count.load(Ordering::SeqCst), 1);
}
