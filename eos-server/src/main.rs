//! EOS — transparent HLS/DASH subtitling proxy.
//!
//! Rewrites an origin HLS/DASH manifest to advertise machine-translated
//! or transcribed subtitle renditions, time-shifts live content to give
//! transcription a delay window to catch up, and serves the synthesized
//! subtitle segments on demand.

mod collaborators;
mod config;
mod dispatch;
mod error;
mod pipeline;
mod request_client;
mod router;
mod session;
mod state;
mod stats;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::router::create_router;
use crate::session::manager::SESSION_IDLE_TTL;
use crate::state::AppState;

const APP_NAME: &str = "eos";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI (spec.md §6): a single `--config-file` flag, defaulting to
/// `eos.ini`, with no other required arguments.
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION)]
struct Cli {
    #[arg(long, default_value = "eos.ini")]
    config_file: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(&cli.config_file);

    init_logging(&config);
    tracing::info!(version = VERSION, config_file = %cli.config_file, "{} starting", APP_NAME);
    tracing::info!(threads = config.app.number_of_threads, port = config.http_server.port, "configuration loaded");

    let state = Arc::new(AppState::new(config.clone()));
    spawn_idle_session_sweep(state.clone());

    let app = create_router(state.clone());
    let addr: SocketAddr = config
        .socket_addr()
        .parse()
        .expect("socket_addr() always produces a valid 0.0.0.0:{port} string");

    tracing::info!(%addr, "listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("axum::serve only returns on a fatal listener error after bind succeeded");

    // Teardown order per §9's "Singletons" design note: HTTP has already
    // stopped accepting by the time graceful_shutdown resolves, so only
    // the pipelines/pollers/pool (all owned transitively by `dispatch`)
    // remain to drain.
    shutdown_state.shutdown().await;
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Background sweep reaping sessions idle longer than
/// [`SESSION_IDLE_TTL`] (SPEC_FULL.md §C, resolving spec.md §9 Open
/// Question 2).
fn spawn_idle_session_sweep(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SESSION_IDLE_TTL / 4);
        loop {
            tick.tick().await;
            let removed = state.sweep_idle_sessions();
            if removed > 0 {
                tracing::info!(removed, "reaped idle sessions");
            }
        }
    });
}

fn init_logging(config: &Config) {
    let default_filter = format!("{}={},tower_http=info", APP_NAME, config.app.stdout_log_level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_eos_ini() {
        let cli = Cli::parse_from(["eos"]);
        assert_eq!(cli.config_file, "eos.ini");
    }

    #[test]
    fn cli_accepts_explicit_config_file() {
        let cli = Cli::parse_from(["eos", "--config-file", "/etc/eos/custom.ini"]);
        assert_eq!(cli.config_file, "/etc/eos/custom.ini");
    }
}
