//! # Command-line interface for the demo binary
//!
//! Parses arguments for a small optimizer demo that exercises the
//! dispatch core end to end against a quadratic objective.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};
use std::time::Duration;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Which manager backend runs the trials.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Fork a local OS process per trial.
    Local,
    /// Submit each trial as a task on an in-process `LocalCluster`
    /// stand-in for a real compute cluster.
    Cluster,
}

/// Demo optimizer for the trial dispatch core.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Number of trials to run.
    #[arg(short = 'n', long, default_value_t = 20)]
    pub n_trials: u64,

    /// Worker concurrency. `0` or negative means one worker per CPU.
    #[arg(short = 'j', long, default_value_t = -1)]
    pub n_jobs: i64,

    /// Which backend runs the trials.
    #[arg(short = 'b', long, value_enum, default_value_t = Backend::Local)]
    pub backend: Backend,

    /// Overall optimization timeout, e.g. "30s", "2m". Unset runs until
    /// `n_trials` complete.
    #[arg(short = 't', long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Show a live progress bar.
    #[arg(long, default_value_t = false)]
    pub progress: bool,

    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress the colorized stdout log layer.
    #[arg(short = 'q', long, default_value_t = false)]
    pub quiet: bool,

    /// Write the detailed log layer to this path, or "stderr".
    #[arg(long)]
    pub log_file: Option<String>,
}

/// Parses a human-friendly duration: a bare number is seconds, or a
/// number suffixed with `ms`/`s`/`m`/`h`.
///
/// ```rust
/// # use std::time::Duration;
/// # use trial_mux::cli::parse_duration;
/// assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => unreachable!("every branch above sets a known unit"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_supported_unit() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn rejects_empty_and_negative() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
