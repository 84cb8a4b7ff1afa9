//! # Study facade and the `Study` collaborator trait
//!
//! The study, its storage, sampler and pruner are an external
//! collaborator: a synchronous library accessed only from the
//! event-loop thread. This module defines the narrow [`Study`] trait the
//! dispatch core depends on, an [`InMemoryStudy`] reference
//! implementation sufficient to exercise it end to end, and
//! [`DistributedStudy`], a thin facade over `from_study` / `optimize` /
//! passthrough accessors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::cluster::ClusterClient;
use crate::error::{CatchPredicate, Error, Result};
use crate::eventloop::EventLoop;
use crate::manager::distributed::DistributedManager;
use crate::manager::local::LocalManager;
use crate::manager::OptimizationManager;
use crate::message::{AttrValue, AttributeKind, CategoricalValue, TrialId, TrialProperty};
use crate::terminal::Terminal;
use crate::trial::{Objective, RemoteTrial};

/// Outcome of a single trial as recorded in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Waiting,
    Running,
    Complete,
    Pruned,
    Fail,
}

impl TrialState {
    pub fn is_finished(self) -> bool {
        matches!(self, TrialState::Complete | TrialState::Pruned | TrialState::Fail)
    }
}

/// The study/storage/sampler/pruner collaborator. All methods are
/// invoked only from the event-loop thread, a single-writer invariant —
/// implementations need no internal synchronization on that account,
/// though `InMemoryStudy` uses interior mutability for ergonomic sharing
/// with `DistributedStudy`.
pub trait Study: Send {
    fn ask(&mut self) -> TrialId;

    fn suggest_float(
        &mut self,
        trial_id: TrialId,
        name: &str,
        low: f64,
        high: f64,
        step: Option<f64>,
        log: bool,
    ) -> Result<f64>;

    fn suggest_int(
        &mut self,
        trial_id: TrialId,
        name: &str,
        low: i64,
        high: i64,
        step: i64,
        log: bool,
    ) -> Result<i64>;

    fn suggest_categorical(
        &mut self,
        trial_id: TrialId,
        name: &str,
        choices: &[CategoricalValue],
    ) -> Result<CategoricalValue>;

    fn report(&mut self, trial_id: TrialId, value: f64, step: u64) -> Result<()>;

    fn should_prune(&mut self, trial_id: TrialId) -> Result<bool>;

    fn set_attribute(
        &mut self,
        trial_id: TrialId,
        kind: AttributeKind,
        key: &str,
        value: AttrValue,
    ) -> Result<()>;

    fn get_property(&mut self, trial_id: TrialId, property: TrialProperty) -> Result<AttrValue>;

    fn is_finished(&mut self, trial_id: TrialId) -> Result<bool>;

    /// Tells the study the trial completed with the given (possibly
    /// multi-objective) values. Returns a one-line summary on success,
    /// suitable for a "best-so-far" log line.
    fn tell_completed(&mut self, trial_id: TrialId, values: &[f64]) -> Result<String>;

    fn tell_pruned(&mut self, trial_id: TrialId) -> Result<()>;

    fn tell_failed(&mut self, trial_id: TrialId) -> Result<()>;

    /// Marks every trial still in `Waiting`/`Running` state as failed.
    /// Invoked after an uncaught error, a timeout, or user-initiated
    /// abort.
    fn fail_unfinished_trials(&mut self) -> Result<()>;

    fn release_storage_session(&mut self);

    fn best_value(&self) -> Option<f64>;

    fn trial_count(&self) -> usize;
}

struct TrialRecord {
    state: TrialState,
    params: HashMap<String, CategoricalValue>,
    user_attrs: HashMap<String, AttrValue>,
    system_attrs: HashMap<String, AttrValue>,
    values: Vec<f64>,
    started_at: chrono::DateTime<chrono::Utc>,
    number: u64,
}

/// A minimal, single-process `Study` implementation: a uniform-random
/// sampler, a pruner that never prunes, and a `HashMap`-backed storage.
/// This is the external collaborator stub the dispatch core is tested
/// against; it is not a faithful reimplementation of a real sampler or
/// storage backend, which is explicitly out of this crate's scope.
pub struct InMemoryStudy {
    trials: HashMap<TrialId, TrialRecord>,
    next_id: u64,
    direction_minimize: bool,
}

impl Default for InMemoryStudy {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStudy {
    pub fn new() -> Self {
        Self { trials: HashMap::new(), next_id: 0, direction_minimize: true }
    }

    pub fn maximize() -> Self {
        Self { direction_minimize: false, ..Self::new() }
    }

    fn record(&self, trial_id: TrialId) -> Result<&TrialRecord> {
        self.trials.get(&trial_id).ok_or(Error::UnknownTrial(trial_id))
    }

    fn record_mut(&mut self, trial_id: TrialId) -> Result<&mut TrialRecord> {
        self.trials.get_mut(&trial_id).ok_or(Error::UnknownTrial(trial_id))
    }

    pub fn best_trial_number(&self) -> Option<u64> {
        self.trials
            .values()
            .filter(|t| t.state == TrialState::Complete)
            .min_by(|a, b| {
                let av = a.values.first().copied().unwrap_or(f64::INFINITY);
                let bv = b.values.first().copied().unwrap_or(f64::INFINITY);
                if self.direction_minimize {
                    av.partial_cmp(&bv).unwrap()
                } else {
                    bv.partial_cmp(&av).unwrap()
                }
            })
            .map(|t| t.number)
    }

    pub fn trial_state(&self, trial_id: TrialId) -> Option<TrialState> {
        self.trials.get(&trial_id).map(|t| t.state)
    }

    /// The first reported value for a given trial, if it has one.
    pub fn trial_value(&self, trial_id: TrialId) -> Option<f64> {
        self.trials.get(&trial_id).and_then(|t| t.values.first().copied())
    }
}

impl Study for InMemoryStudy {
    fn ask(&mut self) -> TrialId {
        let id = TrialId(self.next_id);
        self.next_id += 1;
        self.trials.insert(
            id,
            TrialRecord {
                state: TrialState::Waiting,
                params: HashMap::new(),
                user_attrs: HashMap::new(),
                system_attrs: HashMap::new(),
                values: Vec::new(),
                started_at: chrono::Utc::now(),
                number: id.0,
            },
        );
        id
    }

    fn suggest_float(
        &mut self,
        trial_id: TrialId,
        name: &str,
        low: f64,
        high: f64,
        step: Option<f64>,
        log: bool,
    ) -> Result<f64> {
        let value = {
            let mut rng = rand::thread_rng();
            if log {
                let (lo, hi) = (low.ln(), high.ln());
                rng.gen_range(lo..=hi).exp()
            } else if let Some(step) = step {
                let steps = ((high - low) / step).floor() as i64;
                let k = rng.gen_range(0..=steps.max(0));
                low + (k as f64) * step
            } else {
                rng.gen_range(low..=high)
            }
        };
        let record = self.record_mut(trial_id)?;
        record.state = TrialState::Running;
        record.params.insert(name.to_string(), CategoricalValue::Float(value));
        Ok(value)
    }

    fn suggest_int(
        &mut self,
        trial_id: TrialId,
        name: &str,
        low: i64,
        high: i64,
        step: i64,
        log: bool,
    ) -> Result<i64> {
        let value = {
            let mut rng = rand::thread_rng();
            if log {
                let (lo, hi) = ((low.max(1) as f64).ln(), (high as f64).ln());
                rng.gen_range(lo..=hi).exp().round() as i64
            } else {
                let steps = (high - low) / step.max(1);
                let k = rng.gen_range(0..=steps.max(0));
                low + k * step.max(1)
            }
        };
        let record = self.record_mut(trial_id)?;
        record.state = TrialState::Running;
        record.params.insert(name.to_string(), CategoricalValue::Int(value));
        Ok(value)
    }

    fn suggest_categorical(
        &mut self,
        trial_id: TrialId,
        name: &str,
        choices: &[CategoricalValue],
    ) -> Result<CategoricalValue> {
        if choices.is_empty() {
            return Err(Error::Config(format!("suggest_categorical({name}) called with no choices")));
        }
        let idx = rand::thread_rng().gen_range(0..choices.len());
        let value = choices[idx].clone();
        let record = self.record_mut(trial_id)?;
        record.state = TrialState::Running;
        record.params.insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn report(&mut self, trial_id: TrialId, _value: f64, _step: u64) -> Result<()> {
        // Intermediate values live with the pruner in a full
        // implementation; the in-memory stub only needs the trial to
        // exist, since it never prunes.
        self.record(trial_id)?;
        Ok(())
    }

    fn should_prune(&mut self, trial_id: TrialId) -> Result<bool> {
        self.record(trial_id)?;
        Ok(false)
    }

    fn set_attribute(
        &mut self,
        trial_id: TrialId,
        kind: AttributeKind,
        key: &str,
        value: AttrValue,
    ) -> Result<()> {
        let record = self.record_mut(trial_id)?;
        match kind {
            AttributeKind::User => record.user_attrs.insert(key.to_string(), value),
            AttributeKind::System => record.system_attrs.insert(key.to_string(), value),
        };
        Ok(())
    }

    fn get_property(&mut self, trial_id: TrialId, property: TrialProperty) -> Result<AttrValue> {
        let record = self.record(trial_id)?;
        let value = match property {
            TrialProperty::Params => serde_json::to_value(&record.params)
                .map_err(|e| Error::Study(format!("failed to serialize trial params: {e}")))?,
            TrialProperty::Distributions => serde_json::Value::Null,
            TrialProperty::UserAttrs => serde_json::to_value(&record.user_attrs).unwrap(),
            TrialProperty::SystemAttrs => serde_json::to_value(&record.system_attrs).unwrap(),
            TrialProperty::DatetimeStart => serde_json::Value::String(record.started_at.to_rfc3339()),
            TrialProperty::Number => serde_json::Value::from(record.number),
        };
        Ok(value)
    }

    fn is_finished(&mut self, trial_id: TrialId) -> Result<bool> {
        Ok(self.record(trial_id)?.state.is_finished())
    }

    fn tell_completed(&mut self, trial_id: TrialId, values: &[f64]) -> Result<String> {
        let record = self.record_mut(trial_id)?;
        record.state = TrialState::Complete;
        record.values = values.to_vec();
        let number = record.number;
        Ok(format!("trial {number} finished with value(s) {values:?}"))
    }

    fn tell_pruned(&mut self, trial_id: TrialId) -> Result<()> {
        self.record_mut(trial_id)?.state = TrialState::Pruned;
        Ok(())
    }

    fn tell_failed(&mut self, trial_id: TrialId) -> Result<()> {
        self.record_mut(trial_id)?.state = TrialState::Fail;
        Ok(())
    }

    fn fail_unfinished_trials(&mut self) -> Result<()> {
        for record in self.trials.values_mut() {
            if matches!(record.state, TrialState::Waiting | TrialState::Running) {
                record.state = TrialState::Fail;
            }
        }
        Ok(())
    }

    fn release_storage_session(&mut self) {
        // No external session to release for the in-memory stub.
    }

    fn best_value(&self) -> Option<f64> {
        let number = self.best_trial_number()?;
        self.trials
            .values()
            .find(|t| t.number == number)
            .and_then(|t| t.values.first().copied())
    }

    fn trial_count(&self) -> usize {
        self.trials.len()
    }
}

/// Configuration accepted by [`DistributedStudy::optimize`].
pub struct OptimizeConfig {
    pub n_trials: u64,
    pub timeout: Option<Duration>,
    /// Worker concurrency. `<= 0` means "one per CPU" for the local
    /// backend; used directly as a cluster task budget for the
    /// distributed backend.
    pub n_jobs: i64,
    pub catch: CatchPredicate,
    pub show_progress_bar: bool,
    pub interrupt_patience: Duration,
    /// Upper bound on how long the distributed manager waits on the
    /// shared public queue before re-checking its own timeout and
    /// concurrency budget. Unused by the local backend, which has its
    /// own fixed poll ceiling.
    pub heartbeat_interval: Duration,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            n_trials: 1,
            timeout: None,
            n_jobs: -1,
            catch: crate::error::catch_none,
            show_progress_bar: false,
            interrupt_patience: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// Thin extension over a [`Study`], able to distribute trials across
/// local processes or a cluster.
pub struct DistributedStudy<S: Study> {
    study: S,
    client: Option<Arc<dyn ClusterClient>>,
}

impl<S: Study> DistributedStudy<S> {
    pub fn from_study(study: S, client: Option<Arc<dyn ClusterClient>>) -> Self {
        Self { study, client }
    }

    pub fn best_value(&self) -> Option<f64> {
        self.study.best_value()
    }

    pub fn trial_count(&self) -> usize {
        self.study.trial_count()
    }

    /// Passthrough access to the wrapped study, for callers that need
    /// more than `best_value`/`trial_count` (e.g. per-trial inspection).
    pub fn study(&self) -> &S {
        &self.study
    }

    /// Optimize `objective` for `config.n_trials` trials.
    pub fn optimize(&mut self, objective: Objective, config: OptimizeConfig) -> Result<()> {
        if config.n_trials == 0 {
            return Err(Error::Config("n_trials must be a positive, finite integer".into()));
        }

        let max_concurrency = if config.n_jobs <= 0 { num_cpus::get() } else { config.n_jobs as usize };

        let result = match &self.client {
            Some(client) => {
                let manager = DistributedManager::new(
                    client.clone(),
                    config.n_trials,
                    max_concurrency,
                    config.heartbeat_interval,
                );
                self.run_with_manager(manager, objective, &config)
            }
            None => {
                let manager = LocalManager::new(config.n_trials, config.n_jobs)?;
                self.run_with_manager(manager, objective, &config)
            }
        };

        self.study.release_storage_session();
        result
    }

    fn run_with_manager<M: OptimizationManager + 'static>(
        &mut self,
        manager: M,
        objective: Objective,
        config: &OptimizeConfig,
    ) -> Result<()> {
        let terminal = Terminal::new(config.show_progress_bar, config.n_trials, config.timeout);
        let mut event_loop = EventLoop::new(&mut self.study, manager);
        event_loop.run(objective, &terminal, config.timeout, config.catch, config.interrupt_patience)
    }
}
