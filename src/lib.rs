//! Library entry point: tracing setup and the top-level `run` loop that
//! owns the agent and (optionally) its admin HTTP surface for the
//! lifetime of the process.

mod admin;
mod agent;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
pub use logagent_config::{LogFormat, RuntimeConfig};
use tokio::signal;
use tokio::sync::RwLock;
use tracing::info;

use agent::Agent;

/// Bounded wait for in-flight batches to drain before the process exits.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Initialize the global tracing subscriber from config. Idempotent: a
/// second call (e.g. the CLI calling it before `run` does again) is a
/// harmless no-op, since `set_global_default` ignores an already-set
/// subscriber.
pub fn init_tracing(config: &RuntimeConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_new(&config.admin.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    let _ = match config.admin.log_format {
        LogFormat::Json => tracing::subscriber::set_global_default(registry.with(fmt::layer().json())),
        LogFormat::Text => tracing::subscriber::set_global_default(registry.with(fmt::layer())),
    };
}

/// Builds the agent from `config`, optionally starts the admin server, and
/// runs until a shutdown signal (Ctrl-C or SIGTERM) arrives, then drains
/// and exits.
pub async fn run(config: RuntimeConfig) -> Result<()> {
    let admin_enabled = config.admin.enabled;
    let admin_listen_addr = config.admin.listen_addr.clone();

    let agent = Agent::build(config).await?;
    let agent = Arc::new(RwLock::new(agent));

    let admin_handle = if admin_enabled {
        let state = admin::AdminState { agent: agent.clone() };
        let listener = tokio::net::TcpListener::bind(&admin_listen_addr).await?;
        info!(addr = %admin_listen_addr, "admin HTTP surface listening");
        Some(tokio::spawn(async move {
            axum::serve(listener, admin::router(state)).await
        }))
    } else {
        None
    };

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    if let Some(handle) = admin_handle {
        handle.abort();
    }

    agent.write().await.stop(SHUTDOWN_DRAIN_DEADLINE).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
