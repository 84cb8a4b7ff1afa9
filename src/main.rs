//! # Trial Mux Demo - Main Entry Point
//!
//! A small demo binary exercising the trial dispatch core against a
//! quadratic objective: minimize `x^2 + y` over `x` in `[-100, 100]` and
//! `y` in `{-1, 0, 1}`, whose minimum is `-1` at `(x, y) = (0, -1)`.
//!
//! ## Architecture Overview
//!
//! 1. **Initialize logging**: structured logging via `tracing`
//! 2. **Parse arguments**: backend selection, concurrency, timeout
//! 3. **Build a study**: an in-memory `Study` plus the chosen backend
//! 4. **Optimize**: run `n_trials`, optionally bounded by a timeout
//! 5. **Report**: print the best value found

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use trial_mux::cli::{Args, Backend};
use trial_mux::cluster::LocalCluster;
use trial_mux::logging;
use trial_mux::message::CategoricalValue;
use trial_mux::study::{DistributedStudy, InMemoryStudy, OptimizeConfig};
use trial_mux::trial::{Objective, RemoteTrial};

fn quadratic_objective(trial: &mut RemoteTrial) -> trial_mux::trial::ObjectiveResult {
    let x = trial.suggest_float("x", -100.0, 100.0)?;
    let y = match trial.suggest_categorical(
        "y",
        vec![CategoricalValue::Int(-1), CategoricalValue::Int(0), CategoricalValue::Int(1)],
    )? {
        CategoricalValue::Int(v) => v as f64,
        other => {
            return Err(trial_mux::trial::ObjectiveError::Failed {
                message: format!("unexpected categorical value: {other:?}"),
                diagnostic: "suggest_categorical returned a non-int variant".to_string(),
            })
        }
    };

    trial.set_user_attr("worker_pid", serde_json::json!(std::process::id()))?;
    Ok(vec![x * x + y])
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_file.as_deref(), args.quiet, args.verbose);

    tracing::info!(n_trials = args.n_trials, backend = ?args.backend, "starting optimization");

    let client: Option<Arc<dyn trial_mux::cluster::ClusterClient>> = match args.backend {
        Backend::Local => None,
        Backend::Cluster => Some(Arc::new(LocalCluster::new())),
    };
    let mut study = DistributedStudy::from_study(InMemoryStudy::new(), client);

    let objective: Objective = Arc::new(quadratic_objective);
    let config = OptimizeConfig {
        n_trials: args.n_trials,
        n_jobs: args.n_jobs,
        timeout: args.timeout,
        show_progress_bar: args.progress,
        ..OptimizeConfig::default()
    };

    study
        .optimize(objective, config)
        .context("optimization run failed")?;

    match study.best_value() {
        Some(value) => println!("Best value: {value} (after {} trials)", study.trial_count()),
        None => println!("No trial completed successfully (ran {} trials)", study.trial_count()),
    }

    tracing::info!("optimization finished");
    logging::shutdown();
    Ok(())
}
