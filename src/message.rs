//! # Message Taxonomy
//!
//! This module defines the tagged-union message format exchanged between
//! the event loop and workers, and the `process` dispatch that ties a
//! message back into study/manager state.
//!
//! Every message carries a shared header (`trial_id`, `closing`) and a
//! per-variant payload: a single sum type rather than one struct per kind
//! avoids both stringly-typed dispatch and a trait-object zoo for
//! something this small and closed.

use serde::{Deserialize, Serialize};

use crate::cluster::TaskOutcome;
use crate::error::{Error, Result};
use crate::manager::OptimizationManager;
use crate::study::Study;

/// Trial identifier, issued by the study and immutable for the life of a
/// trial. Workers cannot invent these; they only ever see the id handed
/// to them at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrialId(pub u64);

impl std::fmt::Display for TrialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The hyperparameter distribution a `Suggest` request is sampling from.
///
/// Mirrors Optuna's `FloatDistribution` / `IntDistribution` /
/// `CategoricalDistribution`, trimmed to the fields the sampler needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Distribution {
    Float {
        low: f64,
        high: f64,
        step: Option<f64>,
        log: bool,
    },
    Int {
        low: i64,
        high: i64,
        step: i64,
        log: bool,
    },
    Categorical { choices: Vec<CategoricalValue> },
}

/// A categorical choice. Distributions are serialized across a process or
/// machine boundary, so the value set is closed rather than `dyn Any`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CategoricalValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
}

/// Namespace for `SetAttribute`: a closed variant instead of a namespace
/// string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    User,
    System,
}

/// A closed enumeration of readable trial properties, addressed by tag
/// rather than by reflecting field names over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialProperty {
    Params,
    Distributions,
    UserAttrs,
    SystemAttrs,
    DatetimeStart,
    Number,
}

/// Arbitrary attribute/property payload. Storage treats these opaquely;
/// it is the caller's responsibility that embedded values are
/// serializable.
pub type AttrValue = serde_json::Value;

/// Opaque reply payload carried by a `Response` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    Float(f64),
    Int(i64),
    Bool(bool),
    Categorical(CategoricalValue),
    Attr(AttrValue),
    Unit,
}

/// Shared header carried by every message: the owning trial and whether
/// this message ends that trial's contribution to the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub trial_id: TrialId,
    pub closing: bool,
}

/// The full message taxonomy exchanged between a worker and the event loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// W→M: ask the study/sampler for a suggested value under `name`.
    Suggest {
        header: Header,
        name: String,
        distribution: Distribution,
    },
    /// M→W: opaque reply to a request, consumed only by worker-side `get`.
    Response { header: Header, data: ResponseData },
    /// W→M: an intermediate value for a pruning step.
    Report {
        header: Header,
        value: f64,
        step: u64,
    },
    /// W→M: ask the pruner whether this trial should stop early.
    ShouldPrune { header: Header },
    /// W→M: sets a user- or system-namespaced attribute.
    SetAttribute {
        header: Header,
        kind: AttributeKind,
        key: String,
        value: AttrValue,
    },
    /// W→M: read one closed-enum property of the trial.
    TrialPropertyRequest {
        header: Header,
        property: TrialProperty,
    },
    /// Sent by the worker entry point before running the objective, as a
    /// dedup guard against a cluster re-delivering an already-completed
    /// task.
    RepeatedTrial { header: Header },
    /// Internal, never sent over the wire: wakes the event loop when no
    /// worker traffic has arrived within the poll window.
    Heartbeat,
    /// W→M, closing: the objective returned a value (or, for
    /// multi-objective studies, a sequence of values).
    Completed {
        header: Header,
        values: Vec<f64>,
    },
    /// W→M, closing: the objective raised a pruning signal.
    Pruned { header: Header, reason: String },
    /// W→M, closing: the objective raised an uncaught error.
    Failed {
        header: Header,
        message: String,
        diagnostic: String,
    },
}

impl Message {
    /// `true` iff this message terminates the owning trial's contribution
    /// to the stream. Exactly one closing message is observed by the
    /// event loop per trial in a successful run.
    pub fn closing(&self) -> bool {
        match self {
            Message::Heartbeat => false,
            Message::Suggest { header, .. }
            | Message::Response { header, .. }
            | Message::Report { header, .. }
            | Message::ShouldPrune { header }
            | Message::SetAttribute { header, .. }
            | Message::TrialPropertyRequest { header, .. }
            | Message::RepeatedTrial { header }
            | Message::Completed { header, .. }
            | Message::Pruned { header, .. }
            | Message::Failed { header, .. } => header.closing,
        }
    }

    /// The trial this message belongs to, if any (`Heartbeat` has none).
    pub fn trial_id(&self) -> Option<TrialId> {
        match self {
            Message::Heartbeat => None,
            Message::Suggest { header, .. }
            | Message::Response { header, .. }
            | Message::Report { header, .. }
            | Message::ShouldPrune { header }
            | Message::SetAttribute { header, .. }
            | Message::TrialPropertyRequest { header, .. }
            | Message::RepeatedTrial { header }
            | Message::Completed { header, .. }
            | Message::Pruned { header, .. }
            | Message::Failed { header, .. } => Some(header.trial_id),
        }
    }

    pub fn suggest(trial_id: TrialId, name: impl Into<String>, distribution: Distribution) -> Self {
        Message::Suggest {
            header: Header { trial_id, closing: false },
            name: name.into(),
            distribution,
        }
    }

    pub fn response(trial_id: TrialId, data: ResponseData) -> Self {
        Message::Response {
            header: Header { trial_id, closing: false },
            data,
        }
    }

    pub fn report(trial_id: TrialId, value: f64, step: u64) -> Self {
        Message::Report {
            header: Header { trial_id, closing: false },
            value,
            step,
        }
    }

    pub fn should_prune(trial_id: TrialId) -> Self {
        Message::ShouldPrune {
            header: Header { trial_id, closing: false },
        }
    }

    pub fn set_attribute(
        trial_id: TrialId,
        kind: AttributeKind,
        key: impl Into<String>,
        value: AttrValue,
    ) -> Self {
        Message::SetAttribute {
            header: Header { trial_id, closing: false },
            kind,
            key: key.into(),
            value,
        }
    }

    pub fn trial_property(trial_id: TrialId, property: TrialProperty) -> Self {
        Message::TrialPropertyRequest {
            header: Header { trial_id, closing: false },
            property,
        }
    }

    pub fn repeated_trial(trial_id: TrialId) -> Self {
        Message::RepeatedTrial {
            header: Header { trial_id, closing: false },
        }
    }

    pub fn completed(trial_id: TrialId, values: Vec<f64>) -> Self {
        Message::Completed {
            header: Header { trial_id, closing: true },
            values,
        }
    }

    pub fn pruned(trial_id: TrialId, reason: impl Into<String>) -> Self {
        Message::Pruned {
            header: Header { trial_id, closing: true },
            reason: reason.into(),
        }
    }

    pub fn failed(trial_id: TrialId, message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Message::Failed {
            header: Header { trial_id, closing: true },
            message: message.into(),
            diagnostic: diagnostic.into(),
        }
    }

    /// Serialize to the stable binary wire format shared by both backends.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from the stable binary wire format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Translate a worker task's terminal outcome into its one closing
    /// message. Interrupted tasks post nothing; the main side learns
    /// about them through cancellation bookkeeping.
    pub fn from_task_outcome(trial_id: TrialId, outcome: TaskOutcome) -> Option<Message> {
        match outcome {
            TaskOutcome::Completed(values) => Some(Message::completed(trial_id, values)),
            TaskOutcome::Pruned(reason) => Some(Message::pruned(trial_id, reason)),
            TaskOutcome::Failed { message, diagnostic } => {
                Some(Message::failed(trial_id, message, diagnostic))
            }
            TaskOutcome::Interrupted => None,
        }
    }

    /// Dispatch this message against the study and manager. Invoked
    /// synchronously on the single event-loop thread.
    pub fn process(&self, study: &mut dyn Study, manager: &mut dyn OptimizationManager) -> Result<()> {
        match self {
            Message::Suggest { header, name, distribution } => {
                process_suggest(study, manager, header.trial_id, name, distribution)
            }
            Message::Response { .. } => Ok(()),
            Message::Report { header, value, step } => {
                study.report(header.trial_id, *value, *step)
            }
            Message::ShouldPrune { header } => {
                let should_prune = study.should_prune(header.trial_id)?;
                manager.respond(header.trial_id, ResponseData::Bool(should_prune))
            }
            Message::SetAttribute { header, kind, key, value } => {
                study.set_attribute(header.trial_id, *kind, key, value.clone())
            }
            Message::TrialPropertyRequest { header, property } => {
                let value = study.get_property(header.trial_id, *property)?;
                manager.respond(header.trial_id, ResponseData::Attr(value))
            }
            Message::RepeatedTrial { header } => {
                let already_finished = study.is_finished(header.trial_id)?;
                manager.respond(header.trial_id, ResponseData::Bool(already_finished))
            }
            Message::Heartbeat => Ok(()),
            Message::Completed { header, values } => {
                let result = study.tell_completed(header.trial_id, values);
                manager.register_trial_exit(header.trial_id);
                match result {
                    Ok(summary) => {
                        tracing::info!(
                            trial = header.trial_id.0,
                            %summary,
                            best_value = ?study.best_value(),
                            "trial finished"
                        );
                        Ok(())
                    }
                    Err(_) => {
                        tracing::warn!(
                            trial = header.trial_id.0,
                            "tell failed to postprocess trial, state may be inconsistent"
                        );
                        Ok(())
                    }
                }
            }
            Message::Pruned { header, reason } => {
                study.tell_pruned(header.trial_id)?;
                manager.register_trial_exit(header.trial_id);
                tracing::info!(trial = header.trial_id.0, %reason, "trial pruned");
                Ok(())
            }
            Message::Failed { header, message, diagnostic } => {
                study.tell_failed(header.trial_id)?;
                manager.register_trial_exit(header.trial_id);
                tracing::warn!(
                    trial = header.trial_id.0,
                    error = %message,
                    %diagnostic,
                    "trial failed"
                );
                Err(Error::trial_failed_message(header.trial_id, message.clone()))
            }
        }
    }
}

fn process_suggest(
    study: &mut dyn Study,
    manager: &mut dyn OptimizationManager,
    trial_id: TrialId,
    name: &str,
    distribution: &Distribution,
) -> Result<()> {
    let data = match distribution {
        Distribution::Float { low, high, step, log } => {
            ResponseData::Float(study.suggest_float(trial_id, name, *low, *high, *step, *log)?)
        }
        Distribution::Int { low, high, step, log } => {
            ResponseData::Int(study.suggest_int(trial_id, name, *low, *high, *step, *log)?)
        }
        Distribution::Categorical { choices } => {
            ResponseData::Categorical(study.suggest_categorical(trial_id, name, choices)?)
        }
    };
    manager.respond(trial_id, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_messages_are_tagged_correctly() {
        let t = TrialId(1);
        assert!(Message::completed(t, vec![1.0]).closing());
        assert!(Message::pruned(t, "pruned").closing());
        assert!(Message::failed(t, "boom", "trace").closing());
        assert!(!Message::should_prune(t).closing());
        assert!(!Message::report(t, 0.5, 0).closing());
        assert!(!Message::repeated_trial(t).closing());
        assert!(!Message::Heartbeat.closing());
    }

    #[test]
    fn heartbeat_has_no_trial_id() {
        assert_eq!(Message::Heartbeat.trial_id(), None);
        assert_eq!(Message::should_prune(TrialId(7)).trial_id(), Some(TrialId(7)));
    }

    #[test]
    fn round_trips_through_bincode() {
        let msg = Message::suggest(
            TrialId(3),
            "x",
            Distribution::Float { low: 0.0, high: 1.0, step: None, log: false },
        );
        let bytes = msg.to_bytes().unwrap();
        let back = Message::from_bytes(&bytes).unwrap();
        assert_eq!(back.trial_id(), Some(TrialId(3)));
        assert!(!back.closing());
    }
}
