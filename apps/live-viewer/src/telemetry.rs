//! Process-wide `tracing` setup for the viewer binary.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FILTER: &str = "LIVE_VIEWER_LOG_FILTER";

/// Our own log targets.
const TARGETS: &[&str] = &["live_viewer", "viewer", "signaling", "media"];

/// Verbosity for the viewer's own targets. Dependencies stay at `info` or
/// quieter whatever is picked here.
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
    /// `EnvFilter` directives for this level.
    pub fn directives(self) -> String {
        let ours = match self {
            LogLevel::Error => return "error".to_owned(),
            LogLevel::Warn => return "warn".to_owned(),
            LogLevel::Info => return "info,tungstenite=warn,tokio_tungstenite=warn".to_owned(),
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        let mut directives = String::from("info");
        for target in TARGETS {
            directives.push_str(&format!(",{target}={ours}"));
        }
        directives
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    /// Raw `EnvFilter` directives replacing the ones derived from `level`.
    pub filter: Option<String>,
}

impl LogConfig {
    fn directives(&self) -> String {
        self.filter
            .as_deref()
            .map(str::trim)
            .filter(|filter| !filter.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| self.level.directives())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot open log file {path:?}: {source}")]
    OpenLogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter {filter:?}: {message}")]
    Filter { filter: String, message: String },
    #[error(transparent)]
    Install(#[from] SetGlobalDefaultError),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once one is installed, later calls return
/// `Ok(())` without touching it.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let directives = config.directives();
    let filter = EnvFilter::try_new(&directives).map_err(|err| InitError::Filter {
        filter: directives.clone(),
        message: err.to_string(),
    })?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::OpenLogFile {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let verbose = config.level >= LogLevel::Debug;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Dropping the guard would stop the writer thread.
    let _ = GUARD.set(guard);
    tracing::debug!(target: "viewer", %directives, "logging initialised");
    Ok(())
}
