use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use logagent::RuntimeConfig;
use logagent_config::{load_from_path, load_or_default};

/// Tails log sources, batches, and delivers them to configured sinks with
/// retry, circuit-breaking, and dead-letter durability.
#[derive(Parser)]
#[command(name = "logagent")]
#[command(version)]
#[command(about = "Log collection agent: tail, batch, deliver", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Enable the admin HTTP surface (overrides config file)
    #[arg(long)]
    admin: bool,

    /// Admin HTTP listen address (overrides config file)
    #[arg(long, value_name = "ADDR")]
    admin_listen_addr: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(path) = &cli.config {
        load_from_path(path).with_context(|| format!("failed to load config from {}", path.display()))?
    } else {
        load_or_default().context("failed to load configuration")?
    };

    apply_cli_overrides(&mut config, &cli);

    logagent::init_tracing(&config);

    tracing::info!(
        sinks = config.sinks.len(),
        admin_enabled = config.admin.enabled,
        "starting logagent"
    );

    logagent::run(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    if let Some(level) = &cli.log_level {
        config.admin.log_level = level.clone();
    }
    if cli.admin {
        config.admin.enabled = true;
    }
    if let Some(addr) = &cli.admin_listen_addr {
        config.admin.listen_addr = addr.clone();
    }
}
