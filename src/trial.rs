//! # Remote trial proxy
//!
//! The objective closure never touches the study directly: every
//! `suggest_*`/`report`/`should_prune`/attribute call is a blocking
//! request over the trial's [`crate::ipc::Connection`], answered by the
//! event loop on the other end. Rust has no asynchronous-exception
//! mechanism, so a cooperative [`CancellationToken`] check replaces
//! exception injection at each suspension point.

use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::error::Error;
use crate::ipc::Connection;
use crate::message::{AttrValue, AttributeKind, CategoricalValue, Distribution, Message, ResponseData, TrialId, TrialProperty};

/// Why an objective call did not produce a result.
#[derive(Debug)]
pub enum ObjectiveError {
    /// The objective asked to be pruned, via [`RemoteTrial::should_prune`]
    /// returning `true` and the objective choosing to stop early.
    Pruned(String),
    /// The objective raised and the error was not requested to propagate
    /// as a Rust panic.
    Failed { message: String, diagnostic: String },
    /// The worker observed [`CancellationToken::is_cancelled`] at a
    /// suspension point and unwound without a result.
    Interrupted,
}

impl std::fmt::Display for ObjectiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectiveError::Pruned(reason) => write!(f, "pruned: {reason}"),
            ObjectiveError::Failed { message, .. } => write!(f, "objective failed: {message}"),
            ObjectiveError::Interrupted => write!(f, "objective interrupted"),
        }
    }
}

impl std::error::Error for ObjectiveError {}

/// Lets user objectives use `?` against [`crate::error::Error`] (a
/// suggest/report call whose connection is closed or cancelled) and have
/// it surface as a normal objective failure.
impl From<Error> for ObjectiveError {
    fn from(err: Error) -> Self {
        match err {
            Error::Closed => ObjectiveError::Interrupted,
            other => ObjectiveError::Failed {
                message: other.to_string(),
                diagnostic: format!("{other:?}"),
            },
        }
    }
}

pub type ObjectiveResult = std::result::Result<Vec<f64>, ObjectiveError>;

/// A user-supplied objective function. Cheaply cloneable so the manager
/// can hand the same closure to every worker it spawns.
pub type Objective = Arc<dyn Fn(&mut RemoteTrial) -> ObjectiveResult + Send + Sync>;

/// The worker-side handle an objective function receives. Every method
/// round-trips to the event loop over `connection`.
pub struct RemoteTrial {
    trial_id: TrialId,
    connection: Box<dyn Connection>,
    cancellation: CancellationToken,
}

impl RemoteTrial {
    pub fn new(trial_id: TrialId, connection: Box<dyn Connection>, cancellation: CancellationToken) -> Self {
        Self { trial_id, connection, cancellation }
    }

    pub fn number(&self) -> TrialId {
        self.trial_id
    }

    fn request(&mut self, message: Message) -> Result<ResponseData, ObjectiveError> {
        self.connection.put(message)?;
        loop {
            if self.cancellation.is_cancelled() {
                return Err(ObjectiveError::Interrupted);
            }
            match self.connection.get() {
                Ok(Message::Response { data, .. }) => return Ok(data),
                Ok(_) => continue, // a stray non-response frame; keep waiting for ours
                Err(Error::Timeout(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn suggest_float(&mut self, name: &str, low: f64, high: f64) -> Result<f64, ObjectiveError> {
        self.suggest_float_with(name, low, high, None, false)
    }

    pub fn suggest_float_with(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        step: Option<f64>,
        log: bool,
    ) -> Result<f64, ObjectiveError> {
        let data = self.request(Message::suggest(
            self.trial_id,
            name,
            Distribution::Float { low, high, step, log },
        ))?;
        match data {
            ResponseData::Float(v) => Ok(v),
            other => Err(unexpected_response("float", other)),
        }
    }

    /// Non-log-scale float suggestion without a discretization step.
    pub fn suggest_uniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64, ObjectiveError> {
        self.suggest_float(name, low, high)
    }

    /// Log-scale float suggestion without a discretization step.
    pub fn suggest_loguniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64, ObjectiveError> {
        self.suggest_float_with(name, low, high, None, true)
    }

    /// Non-log-scale float suggestion discretized to steps of `q`.
    pub fn suggest_discrete_uniform(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        q: f64,
    ) -> Result<f64, ObjectiveError> {
        self.suggest_float_with(name, low, high, Some(q), false)
    }

    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64, ObjectiveError> {
        self.suggest_int_with(name, low, high, 1, false)
    }

    pub fn suggest_int_with(
        &mut self,
        name: &str,
        low: i64,
        high: i64,
        step: i64,
        log: bool,
    ) -> Result<i64, ObjectiveError> {
        let data = self.request(Message::suggest(
            self.trial_id,
            name,
            Distribution::Int { low, high, step, log },
        ))?;
        match data {
            ResponseData::Int(v) => Ok(v),
            other => Err(unexpected_response("int", other)),
        }
    }

    pub fn suggest_categorical(
        &mut self,
        name: &str,
        choices: Vec<CategoricalValue>,
    ) -> Result<CategoricalValue, ObjectiveError> {
        let data = self.request(Message::suggest(
            self.trial_id,
            name,
            Distribution::Categorical { choices },
        ))?;
        match data {
            ResponseData::Categorical(v) => Ok(v),
            other => Err(unexpected_response("categorical", other)),
        }
    }

    pub fn report(&mut self, value: f64, step: u64) -> Result<(), ObjectiveError> {
        self.connection.put(Message::report(self.trial_id, value, step))?;
        Ok(())
    }

    pub fn should_prune(&mut self) -> Result<bool, ObjectiveError> {
        let data = self.request(Message::should_prune(self.trial_id))?;
        match data {
            ResponseData::Bool(v) => Ok(v),
            other => Err(unexpected_response("bool", other)),
        }
    }

    pub fn set_user_attr(&mut self, key: &str, value: AttrValue) -> Result<(), ObjectiveError> {
        self.connection
            .put(Message::set_attribute(self.trial_id, AttributeKind::User, key, value))?;
        Ok(())
    }

    pub fn set_system_attr(&mut self, key: &str, value: AttrValue) -> Result<(), ObjectiveError> {
        self.connection
            .put(Message::set_attribute(self.trial_id, AttributeKind::System, key, value))?;
        Ok(())
    }

    fn property(&mut self, property: TrialProperty) -> Result<AttrValue, ObjectiveError> {
        let data = self.request(Message::trial_property(self.trial_id, property))?;
        match data {
            ResponseData::Attr(v) => Ok(v),
            other => Err(unexpected_response("attr", other)),
        }
    }

    pub fn params(&mut self) -> Result<AttrValue, ObjectiveError> {
        self.property(TrialProperty::Params)
    }

    pub fn distributions(&mut self) -> Result<AttrValue, ObjectiveError> {
        self.property(TrialProperty::Distributions)
    }

    pub fn user_attrs(&mut self) -> Result<AttrValue, ObjectiveError> {
        self.property(TrialProperty::UserAttrs)
    }

    pub fn system_attrs(&mut self) -> Result<AttrValue, ObjectiveError> {
        self.property(TrialProperty::SystemAttrs)
    }

    pub fn datetime_start(&mut self) -> Result<AttrValue, ObjectiveError> {
        self.property(TrialProperty::DatetimeStart)
    }

    pub fn trial_number(&mut self) -> Result<AttrValue, ObjectiveError> {
        self.property(TrialProperty::Number)
    }

    /// Checked by long-running objectives that do not otherwise suspend
    /// on the connection, per the caveat documented on
    /// [`crate::cancellation::CancellationToken`].
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Dedup guard run before the objective: asks whether this trial id
    /// already reached a closing message. A worker observing `true` here
    /// was retried by the cluster after already finishing and should
    /// exit without re-running the objective.
    pub(crate) fn check_repeated(&mut self) -> Result<bool, ObjectiveError> {
        let data = self.request(Message::repeated_trial(self.trial_id))?;
        match data {
            ResponseData::Bool(v) => Ok(v),
            other => Err(unexpected_response("bool", other)),
        }
    }

    /// Best-effort post of a trial's final message. Errors are swallowed:
    /// if the connection is already gone there is nothing more useful to
    /// do than exit.
    pub(crate) fn post_closing(&mut self, message: Message) {
        let _ = self.connection.put(message);
    }
}

fn unexpected_response(expected: &str, got: ResponseData) -> ObjectiveError {
    ObjectiveError::Failed {
        message: format!("expected a {expected} response, got {got:?}"),
        diagnostic: "protocol desynchronization between worker and event loop".to_string(),
    }
}
