use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Crates that log one line per primitive sent or received.
const WIRE_TARGETS: [&str; 2] = ["rvpu_frame", "rvpu_peer"];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Per-target filter: `level` everywhere, but primitive traffic stays at
/// `debug` or quieter unless `trace_wire` is set.
pub fn log_targets(level: LogLevel, trace_wire: bool) -> Targets {
    let level = LevelFilter::from(level);
    let wire = if trace_wire {
        level
    } else {
        level.min(LevelFilter::DEBUG)
    };
    WIRE_TARGETS
        .iter()
        .fold(Targets::new().with_default(level), |targets, target| {
            targets.with_target(*target, wire)
        })
}

/// Install the stderr subscriber. Worker threads are told apart by thread
/// name, since `serve` runs one per channel.
pub fn init_logging(format: LogFormat, level: LogLevel, trace_wire: bool) {
    let targets = log_targets(level, trace_wire);
    let installed = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_names(true),
            )
            .with(targets)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_thread_names(true),
            )
            .with(targets)
            .try_init(),
    };
    if let Err(err) = installed {
        eprintln!("warning: logging not initialized: {err}");
    }
}
