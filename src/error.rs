//! Crate-wide error taxonomy.
//!
//! The dispatch core distinguishes a handful of operational failure
//! modes: configuration mistakes caught at construction time,
//! transport-level timeouts, a closed peer, and the "trial failed because
//! the objective raised" case that the event loop re-raises unless the
//! caller asked to catch it.

use crate::message::TrialId;

/// Errors that can surface out of the dispatch core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An `ipc::queue::Queue` was built with both a fixed timeout and a
    /// retry count, or some other mutually exclusive configuration was
    /// requested.
    #[error("configuration error: {0}")]
    Config(String),

    /// The local backend was requested on a platform without `fork`
    /// (non-Unix), or some other host capability the selected manager
    /// needs is missing.
    #[error("platform error: {0}")]
    Platform(String),

    /// A transport wait exceeded its configured timeout.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The peer end of a pipe or queue was closed.
    #[error("connection closed")]
    Closed,

    /// `stop_optimization` did not observe every worker reach a terminal
    /// state within the patience budget.
    #[error("stop_optimization timed out after {0:?}")]
    StopTimeout(std::time::Duration),

    /// Serialization/deserialization of a message failed.
    #[error("(de)serialization failed: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),

    /// The objective function raised for the given trial. Carries enough
    /// context for the event loop to log and re-raise, unless caught.
    #[error("trial {trial_id} failed: {message}")]
    TrialFailed {
        trial_id: TrialId,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A request referenced a `TrialId` the manager has no connection for.
    #[error("no connection registered for trial {0}")]
    UnknownTrial(TrialId),

    /// Forwarded from the `Study` collaborator (e.g. storage access
    /// failure). Opaque by design since storage is an external
    /// collaborator, not part of this crate's scope.
    #[error("study error: {0}")]
    Study(String),

    /// A worker process could not be spawned or reaped.
    #[error("process error: {0}")]
    Process(String),
}

impl Error {
    pub fn trial_failed(
        trial_id: TrialId,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::TrialFailed {
            trial_id,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn trial_failed_message(trial_id: TrialId, message: impl Into<String>) -> Self {
        Error::TrialFailed {
            trial_id,
            message: message.into(),
            source: None,
        }
    }

    /// The trial this error is attached to, if any. Used by the event loop
    /// to fail the right trial in storage after an uncaught error.
    pub fn trial_id(&self) -> Option<TrialId> {
        match self {
            Error::TrialFailed { trial_id, .. } => Some(*trial_id),
            _ => None,
        }
    }
}

/// A predicate over errors, standing in for Python's `catch: Tuple[Type[Exception], ...]`.
///
/// Rust has no exception hierarchy to match against, so `EventLoop::run`
/// takes a predicate instead of a tuple of types; the default (`catch_none`)
/// catches nothing, matching `catch=()`.
pub type CatchPredicate = fn(&Error) -> bool;

pub fn catch_none(_: &Error) -> bool {
    false
}

pub type Result<T> = std::result::Result<T, Error>;
