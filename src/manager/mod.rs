//! # Optimization manager
//!
//! An `OptimizationManager` owns every live per-trial connection and
//! decides how workers come into being — forked local processes
//! ([`local::LocalManager`]) or cluster tasks
//! ([`distributed::DistributedManager`]). The event loop is written
//! against this trait alone, so it never needs to know which backend is
//! in play.

pub mod distributed;
pub mod local;

use std::time::Duration;

use crate::error::Result;
use crate::message::{Message, ResponseData, TrialId};
use crate::study::Study;
use crate::trial::Objective;

/// The event loop's view of whatever is running trials.
///
/// All methods are called only from the event-loop thread.
pub trait OptimizationManager: Send {
    /// Launch as many new trials as the current concurrency budget
    /// allows, asking `study` for a fresh `TrialId` per trial. The
    /// manager, not the study, decides how many trials run concurrently.
    fn fill_workers(&mut self, study: &mut dyn Study, objective: &Objective) -> Result<()>;

    /// Block up to `poll_timeout` for the next message across every live
    /// connection. Returns [`Message::Heartbeat`] if nothing arrives in
    /// time, so the event loop can re-check its own timeout and
    /// concurrency budget on a bounded cadence.
    fn recv_message(&mut self, poll_timeout: Duration) -> Result<Message>;

    /// Send a reply back down the connection that issued a request.
    fn respond(&mut self, trial_id: TrialId, data: ResponseData) -> Result<()>;

    /// Record that a trial reached a closing message; frees its
    /// connection and concurrency slot.
    fn register_trial_exit(&mut self, trial_id: TrialId);

    /// Best-effort: interrupt every still-running trial and wait up to
    /// `patience` for it to reach a terminal state before giving up.
    fn stop_optimization(&mut self, patience: Duration) -> Result<()>;

    /// `true` once every requested trial has exited and no more will be
    /// started.
    fn should_end_optimization(&self) -> bool;

    /// `true` if a `RepeatedTrial` dedup guard has already seen this
    /// trial id reach a closing message — used to drop a cluster retry
    /// that re-delivers an already-finished task.
    fn is_repeated(&self, trial_id: TrialId) -> bool;
}
