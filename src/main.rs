//! camhls - live HLS session supervisor
//!
//! **Server mode** (`camhls serve`): supervises ffmpeg transcoders behind an
//! HTTP API and serves the resulting playlists and segments under `/hls`.
//!
//! **Command mode** (`camhls command <uri>`): prints the transcoder command
//! line that `serve` would run for a source, without starting anything.

use camhls::{
    api,
    config::{ConfigError, SupervisorConfig},
    process::Launcher,
    session::SessionEvent,
    source::redact_credentials,
    supervisor::{Supervisor, SupervisorError},
};
use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// camhls - live HLS session supervisor
///
/// Turns RTSP camera feeds into HLS playlists on demand.
#[derive(ClapParser, Debug)]
#[command(name = "camhls", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every subcommand that needs a supervisor config.
#[derive(clap::Args, Debug)]
struct ConfigArgs {
    /// Path to a TOML config file
    #[arg(long, env = "CAMHLS_CONFIG")]
    config: Option<PathBuf>,

    /// Directory under which per-session output directories are created
    #[arg(long, env = "HLS_ROOT")]
    hls_root: Option<PathBuf>,

    /// Transcoder binary (name on PATH or absolute path)
    #[arg(long, env = "FFMPEG_PATH")]
    ffmpeg: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the supervisor daemon
    Serve {
        #[command(flatten)]
        config: ConfigArgs,

        /// Address to bind the HTTP API server
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Authentication token for non-localhost bindings
        #[arg(long, env = "CAMHLS_TOKEN")]
        token: Option<String>,

        /// Allowed CORS origin (repeatable)
        #[arg(long = "cors-origin")]
        cors_origins: Vec<String>,

        /// Requests per second per client IP on the stream API
        #[arg(long)]
        rate_limit: Option<u32>,
    },

    /// Print the transcoder invocation for a source URI
    Command {
        #[command(flatten)]
        config: ConfigArgs,

        /// Source URI to read from
        source_uri: String,

        /// Session id used for the output directory
        #[arg(long, default_value = "example")]
        id: String,

        /// Maximum lifetime in seconds
        #[arg(long)]
        duration: Option<u64>,
    },
}

#[derive(Debug, Error)]
enum CamhlsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

fn resolve_token(bind: &SocketAddr, user_token: &Option<String>) -> Option<String> {
    if is_loopback(bind) {
        return user_token.clone();
    }
    match user_token {
        Some(token) => Some(token.clone()),
        None => {
            use rand::Rng;
            let token: String = rand::thread_rng()
                .sample_iter(&rand::distributions::Alphanumeric)
                .take(32)
                .map(char::from)
                .collect();
            eprintln!("camhls: API token (required for non-localhost): {}", token);
            Some(token)
        }
    }
}

/// File values first, then CLI/env overrides.
fn load_config(args: &ConfigArgs) -> Result<SupervisorConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => SupervisorConfig::load(path)?.unwrap_or_else(|| {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            SupervisorConfig::default()
        }),
        None => SupervisorConfig::default(),
    };
    if let Some(root) = &args.hls_root {
        config.hls_root = root.clone();
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.ffmpeg_path = ffmpeg.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), CamhlsError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            token,
            cors_origins,
            rate_limit,
        } => {
            let config = load_config(&config)?;
            run_server(config, bind, token, cors_origins, rate_limit).await
        }
        Commands::Command {
            config,
            source_uri,
            id,
            duration,
        } => {
            let config = load_config(&config)?;
            print_command(&config, &source_uri, &id, duration);
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "camhls=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_command(config: &SupervisorConfig, source_uri: &str, id: &str, duration: Option<u64>) {
    let launcher = Launcher::from_config(config);
    let output_dir = config.hls_root.join(id);
    let args = launcher.build_args(
        source_uri,
        &output_dir,
        duration.unwrap_or(config.default_duration_secs),
    );
    let program = launcher
        .locate_binary()
        .unwrap_or_else(|_| config.ffmpeg_path.clone());
    println!("{} {}", program.display(), shell_join(&args));
}

fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if !a.is_empty()
                && a
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./:%=@".contains(c))
            {
                a.clone()
            } else {
                format!("'{}'", a.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Server mode ────────────────────────────────────────────────────

/// Run the daemon until Ctrl+C, then stop HTTP and every session.
async fn run_server(
    config: SupervisorConfig,
    bind: SocketAddr,
    token: Option<String>,
    cors_origins: Vec<String>,
    rate_limit: Option<u32>,
) -> Result<(), CamhlsError> {
    tracing::info!("camhls server starting");

    let token = resolve_token(&bind, &token);
    if token.is_some() {
        tracing::info!("auth token configured");
    }

    if let Err(e) = Launcher::from_config(&config).locate_binary() {
        tracing::warn!(error = %e, "transcoder not found, starts will fail until it is installed");
    }

    let supervisor = Supervisor::new(config).await?;
    let mut events = supervisor.subscribe_events();
    let events_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Started {
                    id,
                    source_uri,
                    playlist_url,
                }) => tracing::debug!(
                    session = %id,
                    source = %redact_credentials(&source_uri),
                    %playlist_url,
                    "session event: started"
                ),
                Ok(SessionEvent::Stopping { id }) => {
                    tracing::debug!(session = %id, "session event: stopping")
                }
                Ok(SessionEvent::Ended {
                    id,
                    state,
                    exit_code,
                }) => tracing::debug!(session = %id, ?state, ?exit_code, "session event: ended"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "session event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let app = api::router(
        api::AppState::new(supervisor.clone()),
        api::RouterConfig {
            token,
            bind,
            cors_origins,
            rate_limit,
        },
    );

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| CamhlsError::Bind { addr: bind, source })?;
    tracing::info!(addr = %bind, "HTTP server listening");

    // Oneshot channel for server shutdown on Ctrl+C
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let http_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            server_shutdown_rx.await.ok();
        })
        .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for Ctrl+C, shutting down");
    } else {
        tracing::info!("received Ctrl+C");
    }

    let _ = server_shutdown_tx.send(());
    let served = http_handle.await;

    supervisor.shutdown().await;
    drop(supervisor);
    events_handle.abort();

    served??;
    tracing::info!("camhls server stopped");
    Ok(())
}
