// filepath: src/logging.rs
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use colored::*;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// This formatter is designed to provide clean, user-facing output where the
/// entire log line is colored according to its severity level, without any
/// extra metadata like timestamps or log levels printed.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Tracks whether `init` has already installed the global subscriber;
/// `tracing_subscriber::registry().init()` panics if called twice.
static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Holds the file-appender worker guard alive until `shutdown` is
/// called; dropping it stops flushing buffered log lines.
static LOG_GUARD: Mutex<Option<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(None);

/// Verbosity as counted by repeated `-v` flags.
pub fn level_for_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Installs the global subscriber: a detailed layer (file, or stderr if
/// `log_file` is `"stderr"`) plus an optional colorized stdout layer
/// unless `quiet`. Idempotent — a second call is a no-op, since
/// `tracing_subscriber::registry().init()` panics if called twice.
pub fn init(log_file: Option<&str>, quiet: bool, verbose: u8) {
    if INITIALIZED.set(()).is_err() {
        return;
    }

    let log_level = level_for_verbosity(verbose);

    let (detailed_log_layer, guard) = if log_file == Some("stderr") {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        (layer, None)
    } else {
        let appender = match log_file {
            Some(path_str) => {
                let log_path = Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("trial-mux.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "trial-mux.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        (layer, Some(file_guard))
    };

    let stdout_log = if !quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    if let Some(guard) = guard {
        *LOG_GUARD.lock().unwrap() = Some(guard);
    }
}

/// Flushes and drops the file-appender worker, if logging to a file was
/// initialized. The global `tracing` subscriber itself is never torn
/// down — `tracing` only allows installing one per process — so this
/// only stops buffered file writes, it does not silence `tracing::*`
/// calls made afterward.
pub fn shutdown() {
    LOG_GUARD.lock().unwrap().take();
}
