//! # Shared worker entry point
//!
//! Both backends run the same sequence inside a worker — local process
//! or cluster task: check the `RepeatedTrial` dedup guard, run the
//! objective under `catch_unwind`, and post exactly one closing message.
//! Keeping this in one place guarantees the invariant holds regardless
//! of which manager spawned the worker.

use crate::cancellation::CancellationToken;
use crate::cluster::TaskOutcome;
use crate::ipc::Connection;
use crate::message::{Message, TrialId};
use crate::trial::{Objective, ObjectiveError, RemoteTrial};

/// Runs `objective` against a freshly-constructed [`RemoteTrial`],
/// posting its outcome on `connection` before returning. The return
/// value is also handed back to callers that track worker state through
/// something other than the message stream (the distributed manager's
/// cluster future).
pub fn run_worker(
    trial_id: TrialId,
    connection: Box<dyn Connection>,
    cancellation: CancellationToken,
    objective: Objective,
) -> TaskOutcome {
    let mut trial = RemoteTrial::new(trial_id, connection, cancellation);

    match trial.check_repeated() {
        Ok(true) => {
            tracing::debug!(trial = trial_id.0, "worker observed an already-finished trial, exiting without rerunning");
            return TaskOutcome::Interrupted;
        }
        Ok(false) => {}
        Err(_) => {
            // The main side is gone or misbehaving; nothing useful left
            // to do but exit as if interrupted.
            return TaskOutcome::Interrupted;
        }
    }

    let outcome = run_catching(&objective, &mut trial);
    if let Some(message) = Message::from_task_outcome(trial_id, outcome.clone()) {
        trial.post_closing(message);
    }
    outcome
}

fn run_catching(objective: &Objective, trial: &mut RemoteTrial) -> TaskOutcome {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| objective(trial)));
    match result {
        Ok(Ok(values)) => TaskOutcome::Completed(values),
        Ok(Err(ObjectiveError::Pruned(reason))) => TaskOutcome::Pruned(reason),
        Ok(Err(ObjectiveError::Interrupted)) => TaskOutcome::Interrupted,
        Ok(Err(ObjectiveError::Failed { message, diagnostic })) => {
            TaskOutcome::Failed { message, diagnostic }
        }
        Err(panic) => TaskOutcome::Failed {
            message: panic_message(&panic),
            diagnostic: "objective panicked".to_string(),
        },
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "objective panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::pipe::Pipe;
    use std::sync::Arc;

    #[test]
    fn successful_objective_posts_a_completed_message() {
        let (mut main_side, worker_side) = Pipe::pair().unwrap();
        main_side.put(Message::response(TrialId(1), crate::message::ResponseData::Bool(false))).unwrap();

        let objective: Objective = Arc::new(|_trial: &mut RemoteTrial| Ok(vec![1.5]));
        let outcome = run_worker(TrialId(1), Box::new(worker_side), CancellationToken::new(), objective);
        assert!(matches!(outcome, TaskOutcome::Completed(values) if values == vec![1.5]));

        match main_side.get().unwrap() {
            Message::Completed { values, .. } => assert_eq!(values, vec![1.5]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn panicking_objective_posts_a_failed_message() {
        let (mut main_side, worker_side) = Pipe::pair().unwrap();
        main_side.put(Message::response(TrialId(2), crate::message::ResponseData::Bool(false))).unwrap();

        let objective: Objective = Arc::new(|_trial: &mut RemoteTrial| panic!("boom"));
        let outcome = run_worker(TrialId(2), Box::new(worker_side), CancellationToken::new(), objective);
        assert!(matches!(outcome, TaskOutcome::Failed { .. }));

        match main_side.get().unwrap() {
            Message::Failed { message, .. } => assert_eq!(message, "boom"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn already_finished_trial_exits_without_posting() {
        let (mut main_side, worker_side) = Pipe::pair().unwrap();
        main_side.put(Message::response(TrialId(3), crate::message::ResponseData::Bool(true))).unwrap();

        let objective: Objective = Arc::new(|_trial: &mut RemoteTrial| Ok(vec![0.0]));
        let outcome = run_worker(TrialId(3), Box::new(worker_side), CancellationToken::new(), objective);
        assert!(matches!(outcome, TaskOutcome::Interrupted));
    }
}
