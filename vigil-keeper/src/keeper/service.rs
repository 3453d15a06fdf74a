//! The node-active loop.
//!
//! One cooperative loop drives the whole keeper: reload configuration when
//! signalled, re-read the on-disk state, sample the local database, exchange
//! states with the monitor, run at most one FSM transition, persist. The
//! strict ordering persist-before-report is what keeps the monitor's view
//! consistent with ours across crashes.

use anyhow::{anyhow, Result};
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use vigil_core::{AppError, NodeState};

use crate::config::{KeeperConfig, KEEPER_TICK};
use crate::error::{FatalError, EXIT_CODE_INTERNAL, EXIT_CODE_PG_SETUP};
use crate::fsm;
use crate::keeper::Keeper;
use crate::pidfile;
use crate::retry::RetryPolicy;
use crate::signals::Flags;
use crate::state::KeeperState;
use crate::utils::epoch_seconds;

/// The keeper's node-active service, a permanent child of the supervisor.
pub struct KeeperService {
    keeper: Keeper,
    flags: Flags,
    shutdown: BroadcastStream<()>,
}

impl KeeperService {
    pub fn new(keeper: Keeper, flags: Flags, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            keeper,
            flags,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // First boot: no state file yet means we have never registered.
        if KeeperState::read(&self.keeper.config.state_file_path())?.is_none() {
            tracing::info!("no state file found, registering with the monitor");
            if let Err(err) = self.keeper.register_and_init(NodeState::Init).await {
                return Err(fatalize(err));
            }
        }
        self.keeper.load_state()?;
        self.node_active_loop().await
    }

    async fn node_active_loop(&mut self) -> Result<()> {
        let mut do_sleep = false;
        let mut could_contact_monitor = false;
        let mut first_loop = true;

        tracing::debug!("the keeper node-active service is starting");

        loop {
            // A reload is only honored here, at the start of an iteration;
            // never in the middle of a write or a monitor exchange.
            if self.flags.asked_to_reload() || first_loop {
                self.reload_configuration(first_loop).await;
            }
            if self.flags.asked_to_stop() || self.flags.asked_to_stop_fast() {
                break;
            }

            if do_sleep {
                self.tick_sleep().await;
            }
            do_sleep = true;

            if let Err(err) = pidfile::check_ownership(&self.keeper.config.pid_file_path()) {
                return Err(anyhow!(FatalError::new(EXIT_CODE_INTERNAL, err)));
            }

            if self.flags.asked_to_stop_fast() {
                break;
            }

            // Re-read the state file every iteration: if the previous write
            // failed, the monitor was never told, and starting over from
            // disk keeps both sides consistent.
            if let Err(err) = self.keeper.load_state() {
                tracing::error!(error = %err, "failed to read the keeper state file, retrying");
                continue;
            }

            if first_loop {
                tracing::info!(
                    state = %self.keeper.state.current_role,
                    "the keeper service is running",
                );
            }

            if let Err(err) = self.keeper.update_pg_state().await {
                if is_identity_error(&err) {
                    return Err(anyhow!(FatalError::new(EXIT_CODE_PG_SETUP, err)));
                }
                tracing::warn!(error = %err, "failed to update the keeper's view of the local postgres");
            }

            if self.flags.asked_to_stop_fast() {
                break;
            }

            let could_contact_this_round = self.node_active().await?;
            if !could_contact_monitor && could_contact_this_round && !first_loop {
                tracing::info!("successfully got the goal state from the monitor");
            }
            could_contact_monitor = could_contact_this_round;

            let need_state_change = self.keeper.state.assigned_role != self.keeper.state.current_role;
            if need_state_change {
                if could_contact_monitor {
                    tracing::info!(state = %self.keeper.state.assigned_role, "monitor assigned new state");
                } else {
                    tracing::info!(state = %self.keeper.state.assigned_role, "reaching new state");
                }
            }

            if self.flags.asked_to_stop_fast() {
                break;
            }

            let mut transition_failed = false;
            if need_state_change {
                // Normalize the current state first: the transition may rely
                // on postgres being up (or down) for the role we are in.
                // Skipped around the demotion states, where starting
                // postgres first would be a split-brain hazard.
                if fsm::should_ensure_current_state(
                    self.keeper.state.current_role,
                    self.keeper.state.assigned_role,
                ) {
                    if let Err(err) = self.keeper.ensure_current_state().await {
                        tracing::warn!(
                            error = %err,
                            state = %self.keeper.state.current_role,
                            "failed to ensure the current state before the transition",
                        );
                    }
                }
                if let Err(err) = self.keeper.reach_assigned_state().await {
                    tracing::error!(
                        error = %err,
                        state = %self.keeper.state.assigned_role,
                        "failed to transition to the assigned state, retrying",
                    );
                    transition_failed = true;
                }
            } else if could_contact_monitor {
                if let Err(err) = self.keeper.ensure_current_state().await {
                    tracing::warn!(
                        error = %err,
                        state = %self.keeper.state.current_role,
                        "failed to ensure the current state",
                    );
                }
            }

            // Short-lived connections: drop them before the tick sleep.
            self.keeper.monitor.close().await;
            self.keeper.postgres.close().await;

            if self.flags.asked_to_stop_fast() {
                break;
            }

            // Even when the transition failed we persist, so that the
            // contact timestamps feeding the partition check move forward.
            if let Err(err) = self.keeper.store_state() {
                tracing::error!(error = %err, "failed to write the keeper state file");
                transition_failed = true;
            }

            if need_state_change && !transition_failed {
                // Cycle faster while walking a multi-step path.
                do_sleep = false;
            }

            if self.keeper.state.current_role == NodeState::Dropped
                && self.keeper.state.assigned_role == NodeState::Dropped
            {
                self.keeper.drop_node().await?;
                tracing::info!("this node has been dropped, stopping the keeper");
                break;
            }

            first_loop = false;
        }

        tracing::debug!("the keeper node-active service is stopping");
        Ok(())
    }

    /// Sleep one tick, waking up early on shutdown.
    async fn tick_sleep(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(KEEPER_TICK) => {}
            _ = self.shutdown.next() => {}
        }
    }

    /// One exchange with the monitor. Returns whether the monitor could be
    /// contacted; fatal conditions (extension version mismatch, identity
    /// mismatch) surface as errors and stop the service.
    async fn node_active(&mut self) -> Result<bool> {
        // An upgrade on the monitor may have happened between two loops.
        match self.keeper.check_monitor_extension_version().await {
            Ok(true) => {}
            Ok(false) => {
                self.handle_failed_monitor_exchange().await;
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        let report_pg_is_running = self.keeper.report_pg_is_running();
        tracing::debug!(
            formation = %self.keeper.config.formation,
            node_id = self.keeper.state.current_node_id,
            group_id = self.keeper.state.current_group,
            state = %self.keeper.state.current_role,
            pg_is_running = report_pg_is_running,
            sync_state = %self.keeper.postgres.facts.sync_state,
            lsn = %self.keeper.postgres.facts.current_lsn,
            "calling node_active",
        );

        self.keeper.monitor.set_retry_policy(RetryPolicy::main_loop());
        let formation = self.keeper.config.formation.clone();
        let result = self
            .keeper
            .monitor
            .node_active(
                &formation,
                self.keeper.state.current_node_id,
                self.keeper.state.current_group,
                self.keeper.state.current_role,
                report_pg_is_running,
                self.keeper.postgres.facts.current_lsn,
                &self.keeper.postgres.facts.sync_state,
            )
            .await;

        let assigned = match result {
            Ok(assigned) => assigned,
            Err(err) => {
                tracing::error!(error = %err, "failed to get the goal state from the monitor");
                self.handle_failed_monitor_exchange().await;
                return Ok(false);
            }
        };

        if let Err(err) = self.keeper.state.update_from_monitor(&assigned, true) {
            if is_identity_error(&err) {
                return Err(anyhow!(FatalError::new(EXIT_CODE_PG_SETUP, err)));
            }
            return Err(err);
        }

        if let Err(err) = self.keeper.refresh_other_nodes(false).await {
            tracing::error!(error = %err, "failed to update our list of other nodes");
            return Ok(false);
        }

        // The monitor may have moved us to another group, and the slot name
        // follows the node id; both are cached in the configuration file.
        match self
            .keeper
            .config
            .update_node_cache(assigned.node_id, assigned.group_id)
        {
            Ok(true) => {
                if let Err(err) = self.keeper.ensure_configuration(false).await {
                    tracing::error!(
                        error = %err,
                        "failed to reapply the postgres configuration after a group change",
                    );
                    return Ok(false);
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(error = %err, "failed to update the configuration file");
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// The monitor could not be contacted this round: on a primary, check
    /// for a network partition and self-demote when isolated.
    async fn handle_failed_monitor_exchange(&mut self) {
        if self.keeper.state.current_role != NodeState::Primary {
            return;
        }
        tracing::warn!("checking for network partitions");
        if self.is_network_healthy().await {
            tracing::info!("network is healthy");
        } else {
            self.keeper.state.assigned_role = NodeState::DemoteTimeout;
            tracing::info!(
                state = %self.keeper.state.assigned_role,
                "network is not healthy, switching state",
            );
        }
    }

    /// A primary is considered partitioned once it can reach neither the
    /// monitor nor any standby for the configured timeout. The other side of
    /// the partition promotes after that same timeout, so we must be gone.
    async fn is_network_healthy(&mut self) -> bool {
        if self.keeper.state.current_role != NodeState::Primary {
            return true;
        }
        match self.keeper.postgres.has_connected_replica().await {
            Ok(true) => {
                self.keeper.state.last_secondary_contact = epoch_seconds();
                tracing::warn!(
                    "lost the monitor but still have a standby: not in a network partition, continuing"
                );
                return true;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(error = %err, "failed to check for connected replicas");
            }
        }
        let timeout = self.keeper.config.timeout.network_partition;
        if !in_network_partition(
            self.keeper.state.last_monitor_contact,
            self.keeper.state.last_secondary_contact,
            epoch_seconds(),
            timeout,
        ) {
            return true;
        }
        tracing::error!(
            seconds = epoch_seconds() - self.keeper.state.last_monitor_contact,
            timeout,
            "failed to contact the monitor or any standby, shutting postgres down to prevent a split brain",
        );
        false
    }

    /// Re-read the configuration file and integrate the accepted changes.
    async fn reload_configuration(&mut self, postgres_not_running_ok: bool) {
        let path = self.keeper.config.path.clone();

        // Disconnect from the current monitor so that a new URI takes
        // effect from the next exchange on.
        self.keeper.monitor.close().await;

        match KeeperConfig::load(&path) {
            Ok(new_config) => match self.keeper.config.accept_new(new_config) {
                Ok(changes) => {
                    tracing::info!(path = ?path, "reloaded the configuration");
                    if changes.monitor_uri {
                        let uri = self.keeper.config.monitor.clone();
                        self.keeper.monitor.reinit(uri).await;
                    }
                    if changes.node_metadata {
                        if let Err(err) = self.keeper.set_node_metadata().await {
                            tracing::warn!(error = %err, "failed to update the node metadata on the monitor");
                        }
                    }
                    if let Err(err) = self.keeper.ensure_configuration(postgres_not_running_ok).await {
                        tracing::warn!(error = %err, "failed to reapply the configuration");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "rejected the new configuration, continuing with the current one");
                }
            },
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    path = ?path,
                    "failed to read the configuration file, continuing with the current one",
                );
            }
        }

        self.flags.clear_reload();
    }
}

/// The partition predicate: both contact timestamps must exist and both must
/// be older than the timeout. A timeout of zero disables the check, and a
/// primary which never saw a standby (no secondary contact recorded) never
/// self-demotes.
pub fn in_network_partition(last_monitor_contact: i64, last_secondary_contact: i64, now: i64, timeout_secs: u64) -> bool {
    if timeout_secs == 0 {
        return false;
    }
    let timeout = timeout_secs as i64;
    last_monitor_contact > 0
        && last_secondary_contact > 0
        && (now - last_monitor_contact) > timeout
        && (now - last_secondary_contact) > timeout
}

fn is_identity_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<AppError>(), Some(AppError::IdentityMismatch(_)))
}

/// Promote a typed application error into a fatal one carrying its exit
/// code, so that the supervisor does not blindly restart it.
fn fatalize(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<AppError>() {
        Ok(app_err) => anyhow!(FatalError::from(app_err)),
        Err(err) => err,
    }
}
