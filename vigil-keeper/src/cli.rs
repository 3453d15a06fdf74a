//! Operator commands.
//!
//! Besides running the keeper services, the binary exposes the monitor
//! operations an operator drives by hand: maintenance toggles, replication
//! settings, and a manual failover. Commands which trigger a state
//! transition open the notification listener before issuing the call, then
//! wait until a node of the group reports the expected state.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};

use vigil_core::NodeState;

use crate::config::KeeperConfig;
use crate::monitor::Monitor;
use crate::retry::RetryPolicy;
use crate::signals::Flags;
use crate::state::KeeperState;

#[derive(Parser, Debug)]
#[command(name = "vigil-keeper")]
#[command(version)]
#[command(about = "vigil keeper - automated failover agent for postgres")]
pub struct Args {
    /// Path of the keeper configuration file; VIGIL_CONFIG is used when
    /// this is not given.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the keeper services (the default).
    Run,
    /// Put this node into maintenance on the monitor.
    EnableMaintenance {
        /// Proceed even though maintenance on a primary causes a failover.
        #[arg(long)]
        allow_failover: bool,
    },
    /// Bring this node back from maintenance.
    DisableMaintenance,
    /// Change this node's candidate priority on the monitor.
    SetCandidatePriority { priority: i32 },
    /// Change this node's replication quorum membership on the monitor.
    SetReplicationQuorum {
        #[arg(action = clap::ArgAction::Set)]
        quorum: bool,
    },
    /// Change the formation's number of synchronous standbys.
    SetNumberSyncStandbys { number: i32 },
    /// Ask the monitor to orchestrate a failover of this node's group.
    PerformFailover,
    /// List the nodes of the formation as known by the monitor.
    ShowNodes,
    /// Show the formation's coordinator node, if any.
    ShowCoordinator,
}

/// Run one operator command against the monitor.
pub async fn run_command(command: Command, config: KeeperConfig) -> Result<()> {
    let state = KeeperState::read(&config.state_file_path())?.ok_or_else(|| {
        anyhow!(
            "this node is not registered: no state file at {:?}",
            config.state_file_path()
        )
    })?;

    let mut monitor = Monitor::new(config.monitor.clone(), config.connect_timeout(), Flags::default());
    monitor.set_retry_policy(RetryPolicy::monitor_interactive());
    let wait_timeout = Duration::from_secs(config.timeout.listen_notifications);

    match command {
        Command::Run => bail!("BUG: the run command is handled by the service entry point"),

        Command::EnableMaintenance { allow_failover } => {
            if state.current_role == NodeState::Primary && !allow_failover {
                bail!(
                    "enabling maintenance on a primary causes a failover, \
                     use --allow-failover to proceed"
                );
            }
            if state.current_role == NodeState::Maintenance {
                tracing::info!("this node is already in the \"maintenance\" state");
                monitor.start_maintenance(state.current_node_id).await?;
                monitor.close().await;
                return Ok(());
            }

            let mut notifications = monitor.notifications().await?;
            let accepted = monitor.start_maintenance(state.current_node_id).await?;
            if !accepted {
                bail!("the monitor refused to put node {} into maintenance", state.current_node_id);
            }
            let reached = notifications
                .wait_until_some_node_reported_state(
                    &config.formation,
                    state.current_group,
                    NodeState::Maintenance,
                    wait_timeout,
                )
                .await?;
            if !reached {
                bail!("timed out waiting for a node to report the \"maintenance\" state");
            }
            tracing::info!("this node is now in the \"maintenance\" state");
        }

        Command::DisableMaintenance => {
            let mut notifications = monitor.notifications().await?;
            let accepted = monitor.stop_maintenance(state.current_node_id).await?;
            if !accepted {
                bail!("the monitor refused to stop maintenance of node {}", state.current_node_id);
            }
            let reached = notifications
                .wait_until_some_node_reported_state(
                    &config.formation,
                    state.current_group,
                    NodeState::Secondary,
                    wait_timeout,
                )
                .await?;
            if !reached {
                bail!("timed out waiting for this node to report the \"secondary\" state");
            }
            tracing::info!("this node is out of maintenance");
        }

        Command::SetCandidatePriority { priority } => {
            monitor
                .set_node_candidate_priority(
                    state.current_node_id,
                    &config.hostname,
                    config.postgres.port,
                    priority,
                )
                .await?;
            tracing::info!(priority, "candidate priority updated on the monitor");
        }

        Command::SetReplicationQuorum { quorum } => {
            monitor
                .set_node_replication_quorum(
                    state.current_node_id,
                    &config.hostname,
                    config.postgres.port,
                    quorum,
                )
                .await?;
            tracing::info!(quorum, "replication quorum updated on the monitor");
        }

        Command::SetNumberSyncStandbys { number } => {
            monitor
                .set_formation_number_sync_standbys(&config.formation, number)
                .await?;
            tracing::info!(number, formation = %config.formation, "number_sync_standbys updated on the monitor");
        }

        Command::PerformFailover => {
            let mut notifications = monitor.notifications().await?;
            monitor.perform_failover(&config.formation, state.current_group).await?;
            tracing::info!(
                formation = %config.formation,
                group_id = state.current_group,
                "failover started, waiting for a new primary",
            );
            let reached = notifications
                .wait_until_some_node_reported_state(
                    &config.formation,
                    state.current_group,
                    NodeState::Primary,
                    wait_timeout,
                )
                .await?;
            if !reached {
                bail!("timed out waiting for a node to report the \"primary\" state");
            }
            tracing::info!("failover is complete");
        }

        Command::ShowNodes => {
            let nodes = monitor.get_nodes(&config.formation, None).await?;
            for node in &nodes {
                println!(
                    "{:>5} | {:<20} | {:<25} | {:>12} | {}",
                    node.node_id,
                    node.name,
                    format!("{}:{}", node.host, node.port),
                    node.lsn.to_string(),
                    if node.is_primary { "primary" } else { "standby" },
                );
            }
        }

        Command::ShowCoordinator => match monitor.get_coordinator(&config.formation).await? {
            Some(node) => println!("{}:{}", node.host, node.port),
            None => bail!("formation \"{}\" has no coordinator", config.formation),
        },
    }

    monitor.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_default_command_is_run() {
        let args = Args::try_parse_from(["vigil-keeper"]).expect("bare invocation must parse");
        assert!(args.command.is_none(), "no subcommand means run");
        assert!(args.config.is_none());
    }

    #[test]
    fn maintenance_takes_the_failover_guard() {
        let args = Args::try_parse_from(["vigil-keeper", "enable-maintenance", "--allow-failover"])
            .expect("enable-maintenance must parse");
        assert!(args.command == Some(Command::EnableMaintenance { allow_failover: true }));

        let args = Args::try_parse_from(["vigil-keeper", "enable-maintenance"]).expect("the guard is optional");
        assert!(args.command == Some(Command::EnableMaintenance { allow_failover: false }));
    }

    #[test]
    fn settings_commands_parse_their_values() {
        let args = Args::try_parse_from(["vigil-keeper", "set-candidate-priority", "0"]).unwrap();
        assert!(args.command == Some(Command::SetCandidatePriority { priority: 0 }));

        let args = Args::try_parse_from(["vigil-keeper", "set-replication-quorum", "false"]).unwrap();
        assert!(args.command == Some(Command::SetReplicationQuorum { quorum: false }));

        let args = Args::try_parse_from(["vigil-keeper", "set-number-sync-standbys", "2"]).unwrap();
        assert!(args.command == Some(Command::SetNumberSyncStandbys { number: 2 }));

        assert!(
            Args::try_parse_from(["vigil-keeper", "set-replication-quorum", "maybe"]).is_err(),
            "a non-boolean quorum value must be rejected"
        );
    }

    #[test]
    fn the_config_option_is_global() {
        let args = Args::try_parse_from(["vigil-keeper", "--config", "/etc/vigil/keeper.toml", "show-nodes"])
            .expect("--config before the subcommand must parse");
        assert!(args.config.as_deref() == Some(std::path::Path::new("/etc/vigil/keeper.toml")));
        assert!(args.command == Some(Command::ShowNodes));
    }
}
