use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser};
use live_viewer::config::optional_millis;
use live_viewer::media::LoopbackEngine;
use live_viewer::signaling::SignalingClient;
use live_viewer::telemetry::{self, LogConfig, LogLevel, ENV_LOG_FILTER};
use live_viewer::{
    ConnectionState, MediaSink, MediaStreamHandle, PlaybackBlocked, SessionNegotiator,
    ViewerConfig, ViewerSurface,
};
use tokio::signal;

/// Joins a live stream as a viewer and reports the session's progress.
#[derive(Parser, Debug)]
#[command(name = "live-viewer")]
struct Cli {
    /// Signaling server (host, host:port or URL). Defaults to LIVE_VIEWER_SIGNALING_URL.
    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    path: Option<String>,

    /// Stream id to join.
    #[arg(long, short = 's')]
    stream: Option<String>,

    /// Comma separated transport preference list.
    #[arg(long, value_delimiter = ',')]
    transports: Option<Vec<String>>,

    #[arg(long)]
    reconnect_attempts: Option<u32>,

    #[arg(long)]
    reconnect_delay_ms: Option<u64>,

    /// 0 disables the per-request deadline.
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// How long to wait for a broadcaster; 0 waits forever.
    #[arg(long)]
    producer_wait_ms: Option<u64>,

    /// Start with audio muted.
    #[arg(long)]
    muted: bool,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "LIVE_VIEWER_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "LIVE_VIEWER_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,

    #[arg(
        long = "log-filter",
        value_name = "DIRECTIVES",
        env = ENV_LOG_FILTER,
        help = "Raw tracing filter directives; overrides --log-level"
    )]
    filter: Option<String>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            filter: self.filter.clone(),
        }
    }
}

impl Cli {
    fn apply(&self, config: &mut ViewerConfig) {
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if let Some(stream) = &self.stream {
            config.stream = Some(stream.clone());
        }
        if let Some(transports) = &self.transports {
            config.transports = transports
                .iter()
                .map(|entry| entry.trim().to_ascii_lowercase())
                .collect();
        }
        if let Some(attempts) = self.reconnect_attempts {
            config.reconnect_attempts = attempts;
        }
        if let Some(delay) = self.reconnect_delay_ms {
            config.reconnect_delay = std::time::Duration::from_millis(delay);
        }
        if let Some(timeout) = self.request_timeout_ms {
            config.request_timeout = optional_millis(timeout);
        }
        if let Some(wait) = self.producer_wait_ms {
            config.producer_wait_timeout = optional_millis(wait);
        }
    }
}

/// Stands in for a video element: nothing is decoded, attach/play are logged.
#[derive(Default)]
struct LogSink {
    muted: bool,
}

impl MediaSink for LogSink {
    fn attach(&mut self, stream: Option<&MediaStreamHandle>) {
        match stream {
            Some(stream) => tracing::info!(
                target: "viewer",
                stream = %stream.id,
                track = %stream.track.id,
                kind = %stream.track.kind,
                "stream attached"
            ),
            None => tracing::info!(target: "viewer", "stream detached"),
        }
    }

    fn play(&mut self) -> Result<(), PlaybackBlocked> {
        tracing::info!(target: "viewer", muted = self.muted, "playback started");
        Ok(())
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("live-viewer: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let mut config = ViewerConfig::from_env().context("invalid environment configuration")?;
    cli.apply(&mut config);
    let signaling_config = config
        .signaling_config()
        .context("invalid signaling endpoint")?;
    tracing::info!(target: "viewer", url = %signaling_config.url, "joining stream");

    let negotiator = SessionNegotiator::new(
        Arc::new(SignalingClient::new(signaling_config)),
        Arc::new(LoopbackEngine::new()),
        config.negotiation_options(),
    );
    negotiator.mute(cli.muted);
    negotiator.start().await;

    let mut terminal = negotiator.subscribe();
    let shutdown = async move {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!(target: "viewer", "interrupted");
            }
            _ = terminal.wait_for(|snapshot| snapshot.state.is_terminal()) => {}
        }
    };

    let mut surface = ViewerSurface::new(negotiator.clone(), LogSink::default());
    let mut last_status = String::new();
    surface
        .run(shutdown, |view| {
            if view.status != last_status {
                println!("[{}] {}", view.state, view.status);
                last_status = view.status.clone();
            }
        })
        .await;

    let outcome = negotiator.snapshot();
    let view = surface.render(&outcome);
    if view.status != last_status {
        println!("[{}] {}", view.state, view.status);
    }
    negotiator.disconnect().await;
    Ok(if outcome.state == ConnectionState::Error {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}
