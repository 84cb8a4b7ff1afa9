//! # Trial Mux
//!
//! A dispatch core for running hyperparameter-tuning trials concurrently
//! against a single, non-thread-safe study: one event-loop thread
//! mediates every trial's requests over a per-trial channel, whether the
//! trial runs as a forked local process or a task on a compute cluster.

pub mod cancellation;
pub mod cli;
pub mod cluster;
pub mod error;
pub mod eventloop;
pub mod ipc;
pub mod logging;
pub mod manager;
pub mod message;
pub mod study;
pub mod terminal;
pub mod trial;
pub mod worker;

pub use error::{Error, Result};
pub use message::{Message, TrialId};
pub use study::{DistributedStudy, InMemoryStudy, OptimizeConfig, Study};
pub use trial::{Objective, ObjectiveError, RemoteTrial};

/// The current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
