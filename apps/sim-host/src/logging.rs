//! Subscriber setup for the host binary.
//!
//! Every host event is emitted under a dotted `sim.<subsystem>` target, so the
//! default filter is assembled from [`Subsystem`]s rather than crate names.
//! `SIM_HOST_LOG_FILTER` replaces the assembled filter outright.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const FILTER_ENV: &str = "SIM_HOST_LOG_FILTER";
const TRACE_DEPS_ENV: &str = "SIM_HOST_TRACE_DEPS";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Parts of the host that log under their own target.
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum Subsystem {
    /// Frame binding and inbound message pump.
    Channel,
    /// Session state machine and commands.
    Session,
    /// Victory reconciliation into learner progress.
    Reconcile,
    /// WebSocket bridge to the browser shim.
    Bridge,
    /// Binary startup and event log.
    Host,
    Catalog,
    Api,
}

impl Subsystem {
    pub const ALL: [Subsystem; 7] = [
        Subsystem::Channel,
        Subsystem::Session,
        Subsystem::Reconcile,
        Subsystem::Bridge,
        Subsystem::Host,
        Subsystem::Catalog,
        Subsystem::Api,
    ];

    pub fn target(self) -> &'static str {
        match self {
            Subsystem::Channel => "sim.channel",
            Subsystem::Session => "sim.session",
            Subsystem::Reconcile => "sim.reconcile",
            Subsystem::Bridge => "sim.bridge",
            Subsystem::Host => "sim.host",
            Subsystem::Catalog => "sim.catalog",
            Subsystem::Api => "sim.api",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    /// Subsystems raised to at least debug regardless of `level`.
    pub verbose: Vec<Subsystem>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (filter, throttled) = match std::env::var(FILTER_ENV) {
        Ok(filter) => (filter, false),
        Err(_) => default_filter(config, allow_dependency_traces()),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    // Targets name the subsystem, which is only worth printing once more than one is chatty.
    let show_targets = config.level >= LogLevel::Debug || config.verbose.len() > 1;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(show_targets)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);

    if throttled {
        eprintln!(
            "[sim-host] suppressing dependency trace noise; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
        );
    }
    Ok(())
}

fn allow_dependency_traces() -> bool {
    std::env::var(TRACE_DEPS_ENV)
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
}

/// Crates whose trace output drowns the bridge and channel events.
const TRACE_DEP_TARGETS: &[&str] = &[
    "hyper",
    "hyper_util",
    "tokio_tungstenite",
    "tungstenite",
    "reqwest",
    "rustls",
    "mio",
];

/// Builds the filter for `config`. The flag reports whether dependency traces were capped.
fn default_filter(config: &LogConfig, allow_deps: bool) -> (String, bool) {
    let level = config.level;
    let mut directives = Vec::new();
    if level >= LogLevel::Debug {
        directives.push("info".to_string());
        for subsystem in Subsystem::ALL {
            directives.push(format!("{}={}", subsystem.target(), level.directive()));
        }
    } else {
        directives.push(level.directive().to_string());
        for subsystem in &config.verbose {
            directives.push(format!("{}=debug", subsystem.target()));
        }
    }

    let throttled = level == LogLevel::Trace && !allow_deps;
    if throttled {
        for target in TRACE_DEP_TARGETS {
            directives.push(format!("{target}=info"));
        }
    }
    (directives.join(","), throttled)
}
