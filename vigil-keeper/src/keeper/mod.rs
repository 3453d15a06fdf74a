//! Keeper state functions.
//!
//! The `Keeper` ties the monitor client, the local postgres instance and the
//! on-disk state together: it samples local facts, normalizes the database
//! to the current role, and executes FSM transitions. The control loop
//! driving it lives in `service`.

pub mod service;

#[cfg(test)]
mod mod_test;
#[cfg(test)]
mod service_test;

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};

use vigil_core::protocol::{AssignedNodeState, NodeAddress};
use vigil_core::{AppError, NodeState};

use crate::config::{KeeperConfig, MAX_OTHER_NODES};
use crate::error::{FatalError, EXIT_CODE_MONITOR_INCOMPATIBLE};
use crate::fsm::{self, TransitionAction};
use crate::monitor::{Monitor, RegistrationParams};
use crate::postgres::ctl::PostgresCtlHandle;
use crate::postgres::standby::{
    ensure_standby_conf_include, write_standby_configuration, ReplicationSource,
};
use crate::postgres::{hba, ControlData, LocalPostgres};
use crate::retry::RetryPolicy;
use crate::signals::Flags;
use crate::state::KeeperState;
use crate::utils::epoch_seconds;

/// The keeper manages one postgres instance according to the monitor's
/// assignments.
pub struct Keeper {
    pub config: KeeperConfig,
    pub state: KeeperState,
    pub monitor: Monitor,
    pub postgres: LocalPostgres,
    /// Cached addresses of the other nodes in our group, refreshed after
    /// each successful monitor exchange. Bounded by `MAX_OTHER_NODES`.
    pub other_nodes: Vec<NodeAddress>,
    pub flags: Flags,
}

impl Keeper {
    pub fn new(config: KeeperConfig, flags: Flags, ctl: PostgresCtlHandle) -> Self {
        let monitor = Monitor::new(config.monitor.clone(), config.connect_timeout(), flags.clone());
        let postgres = LocalPostgres::new(&config, ctl);
        Self {
            config,
            state: KeeperState::default(),
            monitor,
            postgres,
            other_nodes: Vec::new(),
            flags,
        }
    }

    /// Re-read the state from disk. The loop never trusts its in-memory
    /// copy across iterations: re-reading keeps us consistent with what was
    /// actually persisted if a previous write failed.
    pub fn load_state(&mut self) -> Result<()> {
        match KeeperState::read(&self.config.state_file_path())? {
            Some(state) => {
                self.state = state;
                Ok(())
            }
            None => bail!("state file {:?} does not exist", self.config.state_file_path()),
        }
    }

    pub fn store_state(&self) -> Result<()> {
        self.state.write(&self.config.state_file_path())
    }

    /// Register this node with the monitor and create the on-disk state.
    ///
    /// The remote registration transaction is committed only once the local
    /// state file has been written: failing to persist the assigned node id
    /// locally would lose it forever, so in that case we roll back and the
    /// monitor forgets us.
    pub async fn register_and_init(&mut self, initial_state: NodeState) -> Result<()> {
        let state_path = self.config.state_file_path();
        KeeperState::default()
            .write(&state_path)
            .context("failed to create a state file prior to registering the node")?;

        // Learn our database identity before talking to the monitor.
        let cached = self.cached_control();
        if let Err(err) = self.postgres.update_facts(&cached).await {
            tracing::warn!(error = %err, "could not sample the local postgres before registration");
        }

        self.monitor.set_retry_policy(RetryPolicy::init());
        let params = RegistrationParams {
            formation: self.config.formation.clone(),
            name: self.config.name.clone(),
            host: self.config.hostname.clone(),
            port: self.config.postgres.port,
            system_identifier: self.postgres.facts.control.system_identifier,
            dbname: self.config.postgres.dbname.clone(),
            desired_group_id: self.config.group_id,
            initial_state,
            node_kind: self.config.node_kind.clone(),
            candidate_priority: self.config.candidate_priority,
            replication_quorum: self.config.replication_quorum,
        };

        let assigned = match self.monitor.register_begin(&params).await {
            Ok(assigned) => assigned,
            Err(err) => {
                let _ = KeeperState::unlink(&state_path);
                return Err(err);
            }
        };

        if let Err(err) = self.finish_registration(&assigned) {
            self.monitor.register_rollback().await;
            self.monitor.close().await;
            let _ = KeeperState::unlink(&state_path);
            return Err(err);
        }

        if let Err(err) = self.monitor.register_commit().await {
            // A failed COMMIT cannot be rolled back; drop the local state so
            // that the next attempt starts clean.
            self.monitor.close().await;
            let _ = KeeperState::unlink(&state_path);
            return Err(err);
        }
        self.monitor.close().await;

        tracing::info!(
            node_id = self.state.current_node_id,
            group_id = self.state.current_group,
            name = %self.config.name,
            formation = %self.config.formation,
            assigned = %self.state.assigned_role,
            "registered with the monitor",
        );
        Ok(())
    }

    /// The local part of the registration: persist the assigned identity,
    /// then cache group id and slot name in the configuration file.
    fn finish_registration(&mut self, assigned: &AssignedNodeState) -> Result<()> {
        self.state.update_from_monitor(assigned, true)?;
        if let Some(name) = &assigned.name {
            if !name.is_empty() && *name != self.config.name {
                self.config.name = name.clone();
            }
        }
        tracing::info!(path = ?self.config.state_file_path(), "writing the keeper state file");
        self.store_state()?;
        self.config
            .update_node_cache(assigned.node_id, assigned.group_id)
            .context("failed to cache the assigned group in the configuration file")?;
        Ok(())
    }

    fn cached_control(&self) -> ControlData {
        ControlData {
            pg_control_version: self.state.pg_control_version,
            catalog_version_no: self.state.catalog_version_no,
            system_identifier: self.state.system_identifier,
        }
    }

    /// Sample the local postgres facts and check them against expectations.
    ///
    /// An identity mismatch (changed system identifier) or a port mismatch
    /// is a serious problem; other failures simply mean the facts could not
    /// be refreshed this round.
    pub async fn update_pg_state(&mut self) -> Result<()> {
        let cached = self.cached_control();
        self.postgres.update_facts(&cached).await?;
        let facts = &self.postgres.facts;

        if facts.pg_is_running {
            if let Some(port) = facts.postmaster_port {
                if port != self.config.postgres.port {
                    return Err(AppError::BadPgSetup(format!(
                        "postgres is expected to run on port {}, found it on port {}",
                        self.config.postgres.port, port
                    ))
                    .into());
                }
            }
            let system_identifier = facts.control.system_identifier;
            let first_observation = self.state.system_identifier == 0 && system_identifier != 0;
            self.state.check_system_identifier(system_identifier)?;
            self.state.pg_control_version = facts.control.pg_control_version;
            self.state.catalog_version_no = facts.control.catalog_version_no;

            // A node registered from an empty data directory reported a zero
            // identifier; now that the base backup gave us a real one, the
            // monitor's record has to follow.
            if first_observation && self.state.current_node_id != -1 {
                if let Err(err) = self
                    .monitor
                    .set_node_system_identifier(self.state.current_node_id, system_identifier)
                    .await
                {
                    tracing::warn!(error = %err, "failed to update the system identifier on the monitor");
                }
            }
        }

        // Role-based expectations on the sampled facts.
        let facts = &self.postgres.facts;
        match self.state.current_role {
            NodeState::WaitPrimary => {
                anyhow::ensure!(facts.pg_is_running, "postgres is not running while in state wait_primary");
            }
            NodeState::Primary => {
                if facts.sync_state.is_empty() {
                    tracing::error!(
                        "no standby connected in pg_stat_replication; \
                         check keeper and postgres logs on the standby nodes"
                    );
                }
                anyhow::ensure!(
                    facts.pg_is_running && !facts.sync_state.is_empty(),
                    "replication is not established while in state primary"
                );
            }
            NodeState::Secondary | NodeState::Catchingup => {
                anyhow::ensure!(
                    facts.pg_is_running,
                    "postgres is not running while in state {}",
                    self.state.current_role
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// What to tell the monitor about postgres being up.
    pub fn report_pg_is_running(&self) -> bool {
        report_pg_is_running(
            self.state.current_role,
            self.postgres.facts.pg_is_running,
            self.postgres.first_start_failure,
            self.postgres.start_retries,
            self.config.timeout.postgres_restart_failure,
            self.config.timeout.postgres_restart_max_retries,
            epoch_seconds(),
        )
    }

    /// Normalize the local database to the current role: postgres runs when
    /// the role needs it, is stopped when the role forbids it, and the
    /// replication slots follow the peer set.
    pub async fn ensure_current_state(&mut self) -> Result<()> {
        tracing::debug!(role = %self.state.current_role, "ensuring current state");
        match self.state.current_role {
            // A primary which cannot start postgres gets a grace period of
            // local retries before the failure is reported to the monitor,
            // hence the retry accounting.
            NodeState::Primary => {
                self.postgres.ensure_running(true).await?;
                let peers = self.other_nodes.clone();
                self.postgres.replication_slot_create_and_drop(&peers).await
            }
            NodeState::Single => {
                self.postgres.ensure_running(false).await?;
                let peers = self.other_nodes.clone();
                self.postgres.replication_slot_create_and_drop(&peers).await
            }
            NodeState::WaitPrimary | NodeState::PreparePromotion | NodeState::StopReplication => {
                self.postgres.ensure_running(false).await
            }
            NodeState::Secondary => {
                self.postgres.ensure_running(false).await?;
                self.maintain_replication_slots().await
            }
            // No slot maintenance here: advancing a slot can fail against a
            // restart point older than the other standbys' positions.
            NodeState::Catchingup => self.postgres.ensure_running(false).await,
            NodeState::Demoted | NodeState::DemoteTimeout | NodeState::Draining => {
                if self.postgres.facts.pg_is_running {
                    tracing::warn!(
                        role = %self.state.current_role,
                        "postgres is running in a state which forbids it, stopping postgres",
                    );
                    self.postgres.ensure_stopped().await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// On a standby, keep one physical slot per peer so that WAL needed by
    /// any of them survives a failover. Skipped entirely on server versions
    /// which cannot advance slots safely.
    async fn maintain_replication_slots(&mut self) -> Result<()> {
        if !self.postgres.slot_advance_supported() {
            tracing::debug!(
                version = self.postgres.facts.server_version_num,
                "skipping replication slot maintenance on this server version",
            );
            return Ok(());
        }
        let node_id = self.state.current_node_id;
        let peers = self
            .monitor
            .get_other_nodes(node_id, None)
            .await
            .context("failed to refresh the peer list for slot maintenance")?;
        self.postgres.replication_slot_maintain(&peers).await
    }

    /// Refresh the cached peer list from the monitor, updating HBA rules for
    /// new peers and changed hostnames. With `force` every peer is treated
    /// as new, which is needed right after a base backup copied the
    /// primary's HBA file over ours.
    pub async fn refresh_other_nodes(&mut self, force: bool) -> Result<()> {
        let node_id = self.state.current_node_id;
        let new_nodes = self.monitor.get_other_nodes(node_id, None).await?;
        anyhow::ensure!(
            new_nodes.len() <= MAX_OTHER_NODES,
            "the monitor returned {} peers, more than the supported {}",
            new_nodes.len(),
            MAX_OTHER_NODES
        );

        let diff = if force {
            new_nodes.clone()
        } else {
            hba::diff_node_arrays(&self.other_nodes, &new_nodes)
        };
        if new_nodes.is_empty() || diff.is_empty() {
            self.other_nodes = new_nodes;
            return Ok(());
        }

        tracing::info!(
            nodes = new_nodes.len(),
            changes = diff.len(),
            "fetched the current list of peer nodes, updating HBA rules",
        );
        let edited = hba::ensure_host_rules_exist(
            &self.hba_path(),
            &diff,
            self.config.ssl.active,
            &self.config.postgres.dbname,
            &self.config.replication.username,
            &self.config.postgres.auth_method,
        )
        .await?;
        if edited && self.postgres.facts.pg_is_running {
            self.postgres
                .reload_conf()
                .await
                .context("failed to reload postgres after editing HBA rules")?;
        }

        self.other_nodes = new_nodes;
        Ok(())
    }

    /// Check that the monitor runs the extension version we were built for.
    ///
    /// `Ok(false)` means the monitor could not be reached and the loop
    /// should treat this round as a failed contact; an incompatible version
    /// is fatal and makes the supervisor re-execute the binary.
    pub async fn check_monitor_extension_version(&mut self) -> Result<bool> {
        let version = match self.monitor.get_extension_version().await {
            Ok(version) => version,
            Err(err) => {
                if !self.monitor.connection_ok() {
                    return Ok(false);
                }
                return Err(anyhow!(FatalError::new(
                    EXIT_CODE_MONITOR_INCOMPATIBLE,
                    err.context("failed to check version compatibility with the monitor extension"),
                )));
            }
        };
        let required = expected_extension_version();
        if version.installed_version != required {
            return Err(anyhow!(FatalError::from(AppError::MonitorIncompatible {
                installed: version.installed_version,
                required,
            })));
        }
        tracing::trace!(version = %version.installed_version, "monitor extension version is compatible");
        Ok(true)
    }

    /// Execute the transition toward the assigned role, and persist the new
    /// current role before anyone reports it.
    pub async fn reach_assigned_state(&mut self) -> Result<()> {
        let (current, assigned) = (self.state.current_role, self.state.assigned_role);
        let transition = fsm::find_transition(current, assigned)
            .ok_or_else(|| anyhow!("no transition from \"{}\" to \"{}\"", current, assigned))?;

        tracing::debug!(
            from = %current,
            to = %assigned,
            action = ?transition.action,
            "running transition",
        );
        self.apply_transition(transition.action).await?;

        self.state.current_role = self.state.assigned_role;
        self.store_state()
            .context("transition succeeded but the state file could not be written")?;
        Ok(())
    }

    async fn apply_transition(&mut self, action: TransitionAction) -> Result<()> {
        match action {
            TransitionAction::Confirm => Ok(()),
            TransitionAction::StartAsSingle => {
                ensure_standby_conf_include(&self.config.postgres.pgdata).await?;
                self.postgres.ensure_running(false).await
            }
            TransitionAction::InitFromBackup => {
                let source = self.replication_source().await?;
                self.postgres.basebackup(&source).await?;
                // The backup brought the primary's HBA file with it; treat
                // every peer as new on the next refresh.
                self.other_nodes.clear();
                ensure_standby_conf_include(&self.config.postgres.pgdata).await?;
                write_standby_configuration(&self.config.postgres.pgdata, &source).await?;
                self.postgres.ensure_running(false).await
            }
            TransitionAction::FollowPrimary => {
                let source = self.replication_source().await?;
                ensure_standby_conf_include(&self.config.postgres.pgdata).await?;
                let changed = write_standby_configuration(&self.config.postgres.pgdata, &source).await?;
                if changed && self.postgres.facts.pg_is_running {
                    if let Err(err) = self.postgres.checkpoint().await {
                        tracing::warn!(error = %err, "failed to checkpoint before restarting");
                    }
                    self.postgres.restart().await
                } else {
                    self.postgres.ensure_running(false).await
                }
            }
            TransitionAction::EnableSyncRep => {
                let value = self
                    .monitor
                    .synchronous_standby_names(&self.config.formation, self.state.current_group)
                    .await?;
                self.postgres.set_synchronous_standby_names(&value).await
            }
            TransitionAction::DisableSyncRep => self.postgres.set_synchronous_standby_names("").await,
            TransitionAction::StopPostgres | TransitionAction::ConfirmStopped | TransitionAction::DropNode => {
                self.postgres.ensure_stopped().await
            }
            TransitionAction::RestartAsStandby => {
                let source = self.replication_source().await?;
                ensure_standby_conf_include(&self.config.postgres.pgdata).await?;
                write_standby_configuration(&self.config.postgres.pgdata, &source).await?;
                self.postgres.ensure_running(false).await
            }
            TransitionAction::RejoinAsStandby => {
                let source = self.replication_source().await?;
                if let Err(err) = self.postgres.rewind(&source).await {
                    tracing::warn!(error = %err, "rewind failed, falling back to a base backup");
                    self.postgres.basebackup(&source).await?;
                    self.other_nodes.clear();
                }
                ensure_standby_conf_include(&self.config.postgres.pgdata).await?;
                write_standby_configuration(&self.config.postgres.pgdata, &source).await?;
                self.postgres.ensure_running(false).await
            }
            TransitionAction::ResumeAsSingle => {
                self.postgres.ensure_running(false).await?;
                self.postgres.set_synchronous_standby_names("").await
            }
            TransitionAction::CatchupAndCheckpoint => {
                self.wait_for_walreceiver_to_settle().await?;
                self.postgres.checkpoint().await
            }
            TransitionAction::PromoteReadOnly => {
                self.postgres.set_default_transaction_read_only(true).await?;
                self.postgres.promote().await
            }
            TransitionAction::Promote => {
                self.postgres.promote().await?;
                self.postgres.set_default_transaction_read_only(false).await
            }
            TransitionAction::MakeReadWrite => self.postgres.set_default_transaction_read_only(false).await,
            TransitionAction::ReportLastLsn => {
                // The LSN itself travels with the next node_active call;
                // all we owe here is a running standby to read it from.
                self.postgres.ensure_running(false).await
            }
            TransitionAction::FastForwardWal => {
                let standby = self
                    .monitor
                    .get_most_advanced_standby(&self.config.formation, self.state.current_group)
                    .await?;
                tracing::info!(source = %standby, "fast forwarding from the most advanced standby");
                let source = self.replication_source_for(standby, String::new());
                ensure_standby_conf_include(&self.config.postgres.pgdata).await?;
                write_standby_configuration(&self.config.postgres.pgdata, &source).await?;
                self.postgres.restart().await
            }
        }
    }

    /// Let the WAL receiver settle before promoting: wait until the received
    /// position stops moving, bounded by the configured catchup timeout.
    async fn wait_for_walreceiver_to_settle(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(self.config.timeout.prepare_promotion_catchup);
        let pause = std::time::Duration::from_secs(self.config.timeout.prepare_promotion_walreceiver.max(1));

        let mut last = self.postgres.last_receive_lsn().await?;
        while tokio::time::Instant::now() < deadline {
            if self.flags.asked_to_stop_fast() {
                bail!("fast shutdown requested while waiting for the WAL receiver");
            }
            tokio::time::sleep(pause).await;
            let current = self.postgres.last_receive_lsn().await?;
            if current == last {
                return Ok(());
            }
            tracing::debug!(lsn = %current, "still receiving WAL ahead of promotion");
            last = current;
        }
        tracing::warn!(lsn = %last, "WAL receiver did not settle in time, promoting anyway");
        Ok(())
    }

    /// The replication source toward the current primary, asking the monitor
    /// when our peer cache does not know one.
    async fn replication_source(&mut self) -> Result<ReplicationSource> {
        let primary = match self.other_nodes.iter().find(|node| node.is_primary) {
            Some(primary) => primary.clone(),
            None => {
                self.monitor
                    .get_primary(&self.config.formation, self.state.current_group)
                    .await?
            }
        };
        let slot_name = self.config.replication.slot_name.clone();
        Ok(self.replication_source_for(primary, slot_name))
    }

    fn replication_source_for(&self, primary: NodeAddress, slot_name: String) -> ReplicationSource {
        ReplicationSource {
            primary,
            username: self.config.replication.username.clone(),
            password: self.config.replication.password.clone(),
            slot_name,
            ssl_mode: self.config.ssl.mode.clone(),
            application_name: self.config.name.clone(),
            maximum_backup_rate: self.config.replication.maximum_backup_rate.clone(),
            backup_directory: self.config.backup_directory(),
        }
    }

    /// Reapply the configuration to the local database: connection settings,
    /// the standby configuration on a standby, and a reload when running.
    /// Called after a configuration reload and after the monitor assigned a
    /// new group id or slot name.
    pub async fn ensure_configuration(&mut self, postgres_not_running_ok: bool) -> Result<()> {
        self.postgres.update_settings(&self.config);

        let edited = ensure_standby_conf_include(&self.config.postgres.pgdata).await?;
        if self.postgres.facts.pg_is_running {
            if edited {
                self.postgres.reload_conf().await?;
            }
        } else if !postgres_not_running_ok {
            bail!("postgres is not running, cannot reapply its configuration");
        }

        if matches!(
            self.state.current_role,
            NodeState::Catchingup | NodeState::Secondary | NodeState::Maintenance
        ) {
            let source = self.replication_source().await?;
            let changed = write_standby_configuration(&self.config.postgres.pgdata, &source).await?;
            if changed && self.postgres.facts.pg_is_running {
                tracing::info!("replication settings have changed, restarting postgres");
                if let Err(err) = self.postgres.checkpoint().await {
                    tracing::warn!(error = %err, "failed to checkpoint before restarting");
                }
                self.postgres.restart().await?;
            }
        }
        Ok(())
    }

    /// Push changed node metadata (name, hostname, port) to the monitor.
    pub async fn set_node_metadata(&mut self) -> Result<()> {
        self.monitor
            .update_node_metadata(
                self.state.current_node_id,
                &self.config.name,
                &self.config.hostname,
                self.config.postgres.port,
            )
            .await
    }

    /// Drop this node: ask the monitor to forget us, then remove the local
    /// state. Monitor errors are logged and ignored so that a half-done drop
    /// can complete.
    pub async fn drop_node(&mut self) -> Result<()> {
        tracing::info!("removing this node from the monitor");
        self.monitor.set_retry_policy(RetryPolicy::monitor_interactive());
        if let Err(err) = self
            .monitor
            .remove_node(&self.config.hostname, self.config.postgres.port)
            .await
        {
            tracing::warn!(error = %err, "failed to remove the node from the monitor, removing local state anyway");
        }
        self.monitor.close().await;

        tracing::info!(path = ?self.config.state_file_path(), "removing the local state file");
        KeeperState::unlink(&self.config.state_file_path())
    }

    fn hba_path(&self) -> PathBuf {
        self.config.postgres.pgdata.join("pg_hba.conf")
    }
}

/// The expected monitor extension version, with the test-only environment
/// override taking precedence over the compiled-in value.
pub fn expected_extension_version() -> String {
    std::env::var("VIGIL_EXTENSION_VERSION").unwrap_or_else(|_| vigil_core::EXTENSION_VERSION.to_string())
}

/// What to report to the monitor about postgres being up.
///
/// A primary which just failed to start is reported as still running for a
/// grace period: announcing the failure immediately would trigger a failover
/// while a local restart might still win. Any other role reports the truth,
/// the monitor is free to act on it at once.
pub fn report_pg_is_running(
    current_role: NodeState,
    pg_is_running: bool,
    first_start_failure: i64,
    start_retries: u32,
    restart_failure_timeout: u64,
    restart_failure_max_retries: u32,
    now: i64,
) -> bool {
    if current_role != NodeState::Primary {
        return pg_is_running;
    }
    if pg_is_running {
        return true;
    }
    if first_start_failure == 0 {
        // Not running, and no restart has been attempted yet.
        return true;
    }
    if (now - first_start_failure) > restart_failure_timeout as i64
        || start_retries >= restart_failure_max_retries
    {
        tracing::error!(
            retries = start_retries,
            seconds = now - first_start_failure,
            "failed to restart postgres, reporting it as not running to the monitor",
        );
        return false;
    }
    tracing::warn!(
        retries = start_retries,
        max_retries = restart_failure_max_retries,
        "postgres failed to start, retrying before reporting to the monitor",
    );
    true
}
