//! Keeper runtime configuration.
//!
//! The configuration lives in a TOML file and is re-read on SIGHUP. Each
//! field has a reload policy: most values are accepted hot, a monitor URI
//! change reinitializes the monitor client, node metadata changes are pushed
//! to the monitor, and the postgres data directory can never change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Seconds slept between two iterations of the node-active loop.
pub const KEEPER_TICK: Duration = Duration::from_secs(5);

/// Maximum number of peer nodes kept in the keeper's cache.
pub const MAX_OTHER_NODES: usize = 12;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KeeperConfig {
    /// Path of the file this configuration was loaded from.
    #[serde(skip)]
    pub path: PathBuf,

    /// The formation this node belongs to.
    #[serde(default = "default_formation")]
    pub formation: String,
    /// Node name; assigned by the monitor at registration when empty.
    #[serde(default)]
    pub name: String,
    /// The hostname other nodes and the monitor use to reach us.
    pub hostname: String,
    /// Connection URI of the monitor.
    pub monitor: String,
    /// Desired group at registration; -1 lets the monitor pick, and the
    /// monitor-assigned value is written back after registration.
    #[serde(default = "default_group_id")]
    pub group_id: i32,
    /// Node kind reported at registration.
    #[serde(default = "default_node_kind")]
    pub node_kind: String,
    /// Candidate priority reported at registration.
    #[serde(default = "default_candidate_priority")]
    pub candidate_priority: i32,
    /// Replication quorum membership reported at registration.
    #[serde(default = "default_replication_quorum")]
    pub replication_quorum: bool,
    /// Directory holding the keeper state and pid files.
    #[serde(default = "default_run_directory")]
    pub run_directory: PathBuf,

    pub postgres: PostgresConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
}

/// The local postgres instance.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PostgresConfig {
    /// The postgres data directory. This may never change across reloads.
    pub pgdata: PathBuf,
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_dbname")]
    pub dbname: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    /// Path of the pg_ctl executable used by the controller service.
    #[serde(default = "default_pg_ctl")]
    pub pg_ctl: String,
    /// Authentication method written into HBA rules for peers.
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
}

/// Streaming replication settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ReplicationConfig {
    /// Role peers use for replication connections.
    #[serde(default = "default_replication_username")]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Our replication slot name on the primary; derived from the node id
    /// after registration and cached here.
    #[serde(default)]
    pub slot_name: String,
    /// Transfer rate cap handed to the base backup tooling.
    #[serde(default = "default_maximum_backup_rate")]
    pub maximum_backup_rate: String,
    /// Scratch directory for base backups; empty means a sibling of pgdata.
    #[serde(default)]
    pub backup_directory: PathBuf,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            username: default_replication_username(),
            password: None,
            slot_name: String::new(),
            maximum_backup_rate: default_maximum_backup_rate(),
            backup_directory: PathBuf::new(),
        }
    }
}

/// SSL settings, cascading into connection strings and the standby
/// configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SslConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default = "default_ssl_mode")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
}

/// Timeouts and retry counts, all accepted hot on reload.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TimeoutConfig {
    /// Seconds without monitor nor standby contact after which a primary
    /// self-demotes. Zero disables the check entirely.
    #[serde(default = "default_network_partition_timeout")]
    pub network_partition: u64,
    /// Grace period during which a primary failing to restart postgres is
    /// still reported as running.
    #[serde(default = "default_restart_failure_timeout")]
    pub postgres_restart_failure: u64,
    /// Start attempts before a primary reports postgres as not running.
    #[serde(default = "default_restart_failure_max_retries")]
    pub postgres_restart_max_retries: u32,
    /// Seconds a promoted standby may spend catching up on received WAL.
    #[serde(default = "default_prepare_promotion_catchup")]
    pub prepare_promotion_catchup: u64,
    /// Seconds to wait for the WAL receiver to settle before promotion.
    #[serde(default = "default_prepare_promotion_walreceiver")]
    pub prepare_promotion_walreceiver: u64,
    /// Overall timeout of notification waits, generous on purpose.
    #[serde(default = "default_listen_notifications_timeout")]
    pub listen_notifications: u64,
    /// Connection timeout in seconds; `PGCONNECT_TIMEOUT` overrides it.
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            network_partition: default_network_partition_timeout(),
            postgres_restart_failure: default_restart_failure_timeout(),
            postgres_restart_max_retries: default_restart_failure_max_retries(),
            prepare_promotion_catchup: default_prepare_promotion_catchup(),
            prepare_promotion_walreceiver: default_prepare_promotion_walreceiver(),
            listen_notifications: default_listen_notifications_timeout(),
            connect: default_connect_timeout(),
        }
    }
}

fn default_formation() -> String {
    "default".into()
}
fn default_group_id() -> i32 {
    -1
}
fn default_node_kind() -> String {
    "standalone".into()
}
fn default_candidate_priority() -> i32 {
    50
}
fn default_replication_quorum() -> bool {
    true
}
fn default_run_directory() -> PathBuf {
    PathBuf::from("/var/lib/vigil")
}
fn default_pg_host() -> String {
    "localhost".into()
}
fn default_pg_port() -> u16 {
    5432
}
fn default_pg_dbname() -> String {
    "postgres".into()
}
fn default_pg_user() -> String {
    "postgres".into()
}
fn default_pg_ctl() -> String {
    "pg_ctl".into()
}
fn default_auth_method() -> String {
    "trust".into()
}
fn default_replication_username() -> String {
    "vigil_replicator".into()
}
fn default_maximum_backup_rate() -> String {
    "100M".into()
}
fn default_ssl_mode() -> String {
    "prefer".into()
}
fn default_network_partition_timeout() -> u64 {
    20
}
fn default_restart_failure_timeout() -> u64 {
    20
}
fn default_restart_failure_max_retries() -> u32 {
    3
}
fn default_prepare_promotion_catchup() -> u64 {
    30
}
fn default_prepare_promotion_walreceiver() -> u64 {
    5
}
fn default_listen_notifications_timeout() -> u64 {
    120
}
fn default_connect_timeout() -> u64 {
    2
}

/// What a successful reload changed, for the caller to act upon.
#[derive(Debug, Default, PartialEq)]
pub struct ConfigChanges {
    /// The monitor URI changed; the monitor client must be reinitialized.
    pub monitor_uri: bool,
    /// Name, hostname or port changed; the monitor metadata must be updated.
    pub node_metadata: bool,
    /// Any SSL option changed; postgres settings and the standby
    /// configuration must be reapplied.
    pub ssl: bool,
}

/// The managed replication slot name for a given node id.
pub fn replication_slot_name(node_id: i64) -> String {
    format!("vigil_{}", node_id)
}

/// The pattern matching slot names managed by vigil keepers.
pub const REPLICATION_SLOT_PATTERN: &str = "^vigil_[0-9]+$";

impl KeeperConfig {
    /// Load the configuration from the given TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("error reading configuration file {:?}", path))?;
        let mut config: KeeperConfig = toml::from_str(&contents)
            .with_context(|| format!("error parsing configuration file {:?}", path))?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    /// Write the configuration back to its file, via temp-file-then-rename.
    pub fn write(&self) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("error serializing configuration")?;
        let temp = self.path.with_extension("toml.new");
        std::fs::write(&temp, contents).with_context(|| format!("error writing {:?}", temp))?;
        std::fs::rename(&temp, &self.path)
            .with_context(|| format!("error installing configuration file {:?}", self.path))?;
        Ok(())
    }

    /// Integrate a freshly re-read configuration, applying the per-field
    /// reload policy. Returns what changed; errors reject the whole reload.
    pub fn accept_new(&mut self, mut new: KeeperConfig) -> Result<ConfigChanges> {
        if new.postgres.pgdata != self.postgres.pgdata {
            bail!(
                "refusing to change postgres.pgdata from {:?} to {:?}",
                self.postgres.pgdata,
                new.postgres.pgdata
            );
        }

        if new.formation != self.formation {
            tracing::warn!(
                formation = %self.formation,
                "changing the formation at run-time requires a new registration, keeping the current one",
            );
            new.formation = self.formation.clone();
        }

        let mut changes = ConfigChanges::default();
        if new.monitor != self.monitor {
            tracing::info!(old = %self.monitor, new = %new.monitor, "monitor uri has changed");
            changes.monitor_uri = true;
        }
        if new.name != self.name || new.hostname != self.hostname || new.postgres.port != self.postgres.port {
            tracing::info!(
                name = %new.name,
                hostname = %new.hostname,
                port = %new.postgres.port,
                "node metadata has changed, the monitor will be updated",
            );
            changes.node_metadata = true;
        }
        if new.ssl != self.ssl {
            tracing::info!("ssl options have changed, postgres settings will be reapplied");
            changes.ssl = true;
        }
        if new.timeout != self.timeout {
            tracing::info!("timeouts have been updated");
        }

        // The monitor-assigned node cache never comes from the edited file.
        new.path = self.path.clone();
        new.group_id = self.group_id;
        new.replication.slot_name = self.replication.slot_name.clone();

        *self = new;
        Ok(changes)
    }

    /// Cache the monitor-assigned group id and the derived replication slot
    /// name, writing the file when either changed.
    pub fn update_node_cache(&mut self, node_id: i64, group_id: i32) -> Result<bool> {
        let slot_name = replication_slot_name(node_id);
        if self.group_id == group_id && self.replication.slot_name == slot_name {
            return Ok(false);
        }
        self.group_id = group_id;
        self.replication.slot_name = slot_name;
        self.write()?;
        Ok(true)
    }

    /// Connection string for the local postgres instance.
    pub fn local_pguri(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.postgres.user, self.postgres.host, self.postgres.port, self.postgres.dbname
        )
    }

    /// The connect timeout, with `PGCONNECT_TIMEOUT` taking precedence over
    /// the configured value.
    pub fn connect_timeout(&self) -> Duration {
        let seconds = std::env::var("PGCONNECT_TIMEOUT")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(self.timeout.connect);
        Duration::from_secs(seconds.max(1))
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.run_directory.join("keeper.state")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.run_directory.join("keeper.pid")
    }

    /// The base backup scratch directory, defaulting to a sibling of pgdata.
    pub fn backup_directory(&self) -> PathBuf {
        if self.replication.backup_directory.as_os_str().is_empty() {
            let mut dir = self.postgres.pgdata.clone();
            dir.set_extension("backup");
            dir
        } else {
            self.replication.backup_directory.clone()
        }
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test(dir: &Path) -> Self {
        Self {
            path: dir.join("keeper.toml"),
            formation: "default".into(),
            name: "node_1".into(),
            hostname: "10.0.0.1".into(),
            monitor: "postgres://autoctl@monitor/vigil".into(),
            group_id: -1,
            node_kind: default_node_kind(),
            candidate_priority: 50,
            replication_quorum: true,
            run_directory: dir.join("run"),
            postgres: PostgresConfig {
                pgdata: dir.join("pgdata"),
                host: "localhost".into(),
                port: 5432,
                dbname: "postgres".into(),
                user: "postgres".into(),
                pg_ctl: "pg_ctl".into(),
                auth_method: "trust".into(),
            },
            replication: ReplicationConfig::default(),
            ssl: SslConfig::default(),
            timeout: TimeoutConfig::default(),
        }
    }
}
