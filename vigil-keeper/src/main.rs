//! The vigil keeper.
//!
//! Per-node agent of the vigil automated failover system: reports the local
//! postgres health and replication position to the monitor, receives an
//! assigned goal state, and drives the local database through the matching
//! state transitions. Operator commands against the monitor live in `cli`.

mod app;
mod cli;
mod config;
#[cfg(test)]
mod config_test;
mod error;
mod fsm;
#[cfg(test)]
mod fsm_test;
mod keeper;
mod monitor;
mod pidfile;
mod postgres;
mod retry;
#[cfg(test)]
mod retry_test;
mod signals;
mod state;
#[cfg(test)]
mod state_test;
mod utils;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::cli::{Args, Command};
use crate::config::KeeperConfig;
use crate::error::{exit_code_of, EXIT_CODE_BAD_CONFIG};

/// Fallback configuration file path; `--config` or `VIGIL_CONFIG` override
/// it.
const DEFAULT_CONFIG_PATH: &str = "/etc/vigil/keeper.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing()?;

    let config_path = config_path(&args);
    let config = match KeeperConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, path = ?config_path, "failed to load the configuration");
            exit(EXIT_CODE_BAD_CONFIG);
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_keeper(config).await,
        command => {
            if let Err(err) = cli::run_command(command, config).await {
                tracing::error!(error = %err);
                exit(exit_code_of(&err));
            }
            Ok(())
        }
    }
}

/// Run the keeper services until shutdown.
async fn run_keeper(config: KeeperConfig) -> Result<()> {
    tracing::info!(
        formation = %config.formation,
        name = %config.name,
        hostname = %config.hostname,
        monitor = %config.monitor,
        pgdata = ?config.postgres.pgdata,
        port = %config.postgres.port,
        "starting the vigil keeper",
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    if let Err(err) = App::new(config, shutdown_tx.clone())
        .spawn()
        .await
        .context("error joining the application task")
        .and_then(|res| res)
    {
        tracing::error!(error = ?err);
        let _ = shutdown_tx.send(());
        exit(exit_code_of(&err));
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}

/// Setup the tracing/logging system. `RUST_LOG` drives the filter; the
/// `VIGIL_DEBUG` environment toggle lowers the default level instead.
fn setup_tracing() -> Result<()> {
    let default_directives = if std::env::var("VIGIL_DEBUG").as_deref() == Ok("1") {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directives));
    tracing_subscriber::registry()
        .with(filter)
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        .try_init()
        .context("error initializing logging/tracing system")?;
    Ok(())
}

fn config_path(args: &Args) -> PathBuf {
    if let Some(path) = &args.config {
        return path.clone();
    }
    match std::env::var("VIGIL_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

fn exit(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(code)
}
