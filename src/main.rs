//! # Fleet controller
//!
//! ## Startup
//!
//! 1. **Configuration** - load the TOML file, apply `FLEET_*` overrides, validate
//! 2. **Fleet** - wire native process management, the control plane and alert sinks
//! 3. **Control loop** - synchronization, scanning, health checks and due restarts
//! 4. **Control surface** - the HTTP API and webhook ingress
//!
//! ## Shutdown
//!
//! SIGTERM/SIGINT stop the HTTP server first, then the shutdown coordinator
//! halts the control loop and stops every worker within its deadline.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fleet_orchestrator::process::{NativeProcessManager, ProcessManager, TaggedProcess, top_level};
use fleet_orchestrator::scanner::group_by_bot;
use fleet_orchestrator::shutdown::{install_signal_handlers, wait_for_signal};
use fleet_orchestrator::{Fleet, FleetConfig, ShutdownCoordinator};
use fleet_web::AppState;

use cli::{Cli, Commands, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Run { bind } => run(&cli.config, bind).await,
        Commands::CheckConfig => {
            println!("{}", render_config(&cli.config)?);
            Ok(())
        }
        Commands::Scan => scan(&cli.config).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn load_config(path: &Path) -> Result<FleetConfig> {
    FleetConfig::load(path).with_context(|| format!("Invalid configuration in {}", path.display()))
}

/// Effective configuration as TOML, secrets redacted.
fn render_config(path: &Path) -> Result<String> {
    let config = load_config(path)?;
    toml::to_string_pretty(&config.redacted()).context("Failed to render configuration")
}

async fn run(config_path: &Path, bind: Option<String>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let bind = config.server.bind.clone();
    if config.server.webhook_secret.is_none() {
        warn!("No webhook secret configured, every webhook will be rejected");
    }

    let fleet = Arc::new(Fleet::from_config(config).context("Failed to assemble the fleet")?);
    info!(mode = %fleet.config().server.mode, "Fleet assembled");

    fleet
        .spawn_control_loop()
        .await
        .context("Failed to start the control loop")?;

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let _signals = install_signal_handlers(Arc::clone(&coordinator));

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    let state = AppState::new(Arc::clone(&fleet)).context("Invalid control surface settings")?;
    let receiver = coordinator.subscribe();
    fleet_web::serve(listener, state, async move {
        let signal = wait_for_signal(receiver).await;
        info!(signal = %signal, "Stopping control surface");
    })
    .await
    .context("Control surface failed")?;

    let stats = coordinator
        .wait_with_timeout(&fleet)
        .await
        .context("Shutdown did not complete in time")?;
    info!(
        workers_stopped = stats.workers_stopped,
        workers_escalated = stats.workers_escalated,
        workers_unresponsive = stats.workers_unresponsive,
        duration_ms = stats.total_duration_ms,
        "Fleet controller stopped"
    );
    Ok(())
}

async fn scan(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let processes = NativeProcessManager::new(
        config.scanner.proc_root.clone(),
        config.supervisor.tag_env.clone(),
    );
    let tagged = processes
        .scan()
        .await
        .context("Failed to read the process table")?;

    let roots = top_level(tagged.clone())
        .into_iter()
        .map(|p| p.pid)
        .collect::<Vec<_>>();
    let by_bot = group_by_bot(tagged);
    if by_bot.is_empty() {
        println!("no tagged worker processes");
        return Ok(());
    }

    for (bot_id, group) in by_bot {
        let (top, children): (Vec<&TaggedProcess>, Vec<&TaggedProcess>) =
            group.iter().partition(|p| roots.contains(&p.pid));
        let marker = if top.len() > 1 { "  DUPLICATE" } else { "" };
        println!(
            "bot {bot_id}: workers [{}] children [{}]{marker}",
            top.iter().map(|p| p.pid).join(", "),
            children.iter().map(|p| p.pid).join(", "),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::io::Write;

    #[test]
    fn test_render_config_redacts_secrets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nwebhook_secret = \"hunter2\"\nbind = \"127.0.0.1:9000\"").unwrap();

        let rendered = render_config(file.path()).unwrap();

        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("127.0.0.1:9000"));
    }

    #[test]
    fn test_render_config_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is = = not toml").unwrap();

        assert!(render_config(file.path()).is_err());
    }
}
