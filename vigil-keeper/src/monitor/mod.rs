//! Monitor client.
//!
//! Typed wrappers around the SQL functions exposed by the vigil extension on
//! the monitor. The client owns at most one connection, re-established on
//! demand under the currently installed retry policy, and closed by the
//! control loop at the end of every iteration: short-lived connections keep
//! failure handling simple.
//!
//! The node-active loop drives the state exchange; the maintenance toggles,
//! replication settings and failover calls are reached through the operator
//! commands in `cli`.

mod notify;

pub use notify::MonitorNotifications;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{ConnectOptions, Connection, Row};

use vigil_core::protocol::{AssignedNodeState, ExtensionVersion, Lsn, NodeAddress};
use vigil_core::{AppError, NodeState};

use crate::retry::RetryPolicy;
use crate::signals::Flags;

/// SQLSTATE raised by the monitor while another standby is registering.
pub const SQLSTATE_OBJECT_IN_USE: &str = "55006";
/// SQLSTATE raised when a node registers into a group whose members carry a
/// different database system identifier.
pub const SQLSTATE_EXCLUSION_VIOLATION: &str = "23P01";

/// Whether an error with this SQLSTATE is worth retrying: serialization
/// failures, unknown statement completion, deadlocks, and the
/// insufficient-resources / program-limit-exceeded classes.
pub fn retryable_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40003" | "40P01") || code.starts_with("53") || code.starts_with("54")
}

/// The SQLSTATE of a database-side error, if any.
pub fn sqlstate_of(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.to_string()),
        _ => None,
    }
}

/// Arguments of the one-time node registration.
#[derive(Clone, Debug)]
pub struct RegistrationParams {
    pub formation: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub system_identifier: u64,
    pub dbname: String,
    pub desired_group_id: i32,
    pub initial_state: NodeState,
    pub node_kind: String,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
}

/// A client for the vigil monitor.
pub struct Monitor {
    uri: String,
    conn: Option<PgConnection>,
    policy: RetryPolicy,
    flags: Flags,
    connect_timeout: Duration,
    connection_ok: bool,
}

impl Monitor {
    pub fn new(uri: impl Into<String>, connect_timeout: Duration, flags: Flags) -> Self {
        Self {
            uri: uri.into(),
            conn: None,
            policy: RetryPolicy::interactive(connect_timeout),
            flags,
            connect_timeout,
            connection_ok: false,
        }
    }

    /// Install a different retry policy; the policy is orthogonal to the
    /// operations and chosen per call site.
    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Point the client at a new monitor URI, dropping the current
    /// connection. Used when a reload changes the monitor.
    pub async fn reinit(&mut self, uri: impl Into<String>) {
        self.close().await;
        self.uri = uri.into();
    }

    /// Whether the last connection attempt reached the monitor. Used to
    /// distinguish "monitor unreachable" from "monitor said no".
    pub fn connection_ok(&self) -> bool {
        self.connection_ok
    }

    /// Close the current connection, if any.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(uri = %self.uri, "disconnecting from the monitor");
            let _ = conn.close().await;
        }
    }

    /// Get the open connection, establishing one under the retry policy.
    async fn connection(&mut self) -> Result<&mut PgConnection> {
        if self.conn.is_none() {
            let options = PgConnectOptions::from_str(&self.uri)
                .with_context(|| format!("invalid monitor connection string \"{}\"", self.uri))?
                .application_name("vigil-keeper");
            self.policy.start();
            loop {
                let attempt = tokio::time::timeout(self.connect_timeout, options.clone().connect()).await;
                let err = match attempt {
                    Ok(Ok(conn)) => {
                        self.connection_ok = true;
                        self.conn = Some(conn);
                        break;
                    }
                    Ok(Err(err)) => anyhow!(err),
                    Err(_) => anyhow!("connection attempt timed out after {:?}", self.connect_timeout),
                };
                self.connection_ok = false;
                if !self.policy.retries() || self.policy.expired(&self.flags) {
                    return Err(err.context(format!("failed to connect to the monitor at \"{}\"", self.uri)));
                }
                let nap = self.policy.next_sleep();
                tracing::warn!(
                    error = %err,
                    attempt = self.policy.attempts(),
                    sleep_ms = nap.as_millis() as u64,
                    "failed to connect to the monitor, retrying",
                );
                tokio::time::sleep(nap).await;
            }
        }
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(anyhow!("BUG: no monitor connection after a successful connect")),
        }
    }

    /// Open the registration transaction and call `register_node`.
    ///
    /// The transaction is committed by the caller only once the local state
    /// file is durable; a crash or rollback in between leaves the monitor
    /// without the node, free to be registered again. While the monitor is
    /// busy registering another standby it raises object-in-use, which is
    /// retried under the active policy.
    pub async fn register_begin(&mut self, params: &RegistrationParams) -> Result<AssignedNodeState> {
        loop {
            let conn = self.connection().await?;
            sqlx::query("BEGIN")
                .execute(&mut *conn)
                .await
                .context("error opening the registration transaction")?;

            let result = sqlx::query(
                "SELECT assigned_node_id, assigned_group_id, assigned_node_state::text, \
                        candidate_priority, replication_quorum, assigned_node_name \
                   FROM vigil.register_node($1, $2, $3, $4, $5, $6, $7, \
                        $8::vigil.replication_state, $9, $10, $11)",
            )
            .bind(&params.formation)
            .bind(&params.host)
            .bind(params.port as i32)
            .bind(&params.dbname)
            .bind(&params.name)
            .bind(params.system_identifier as i64)
            .bind(params.desired_group_id)
            .bind(params.initial_state.as_str())
            .bind(&params.node_kind)
            .bind(params.candidate_priority)
            .bind(params.replication_quorum)
            .fetch_one(&mut *conn)
            .await;

            match result {
                Ok(row) => return parse_assigned_state(&row),
                Err(err) => {
                    let sqlstate = sqlstate_of(&err);
                    self.register_rollback().await;
                    match sqlstate.as_deref() {
                        Some(SQLSTATE_OBJECT_IN_USE) => {
                            if self.policy.expired(&self.flags) {
                                return Err(anyhow!(err)
                                    .context("the monitor kept registering other standby nodes"));
                            }
                            let nap = self.policy.next_sleep();
                            tracing::warn!(
                                sleep_ms = nap.as_millis() as u64,
                                "the monitor is registering another standby, retrying",
                            );
                            tokio::time::sleep(nap).await;
                            continue;
                        }
                        Some(SQLSTATE_EXCLUSION_VIOLATION) => {
                            return Err(AppError::IdentityMismatch(format!(
                                "another node of group {} in formation \"{}\" reports a \
                                 different database system identifier",
                                params.desired_group_id, params.formation
                            ))
                            .into());
                        }
                        Some(code) if retryable_sqlstate(code) => {
                            if self.policy.expired(&self.flags) {
                                return Err(anyhow!(err).context(
                                    "the monitor kept answering with transient errors during registration",
                                ));
                            }
                            let nap = self.policy.next_sleep();
                            tracing::warn!(
                                sqlstate = code,
                                sleep_ms = nap.as_millis() as u64,
                                "transient monitor error during registration, retrying",
                            );
                            tokio::time::sleep(nap).await;
                            continue;
                        }
                        _ => {
                            return Err(anyhow!(err).context(format!(
                                "failed to register node {}:{} in formation \"{}\"",
                                params.host, params.port, params.formation
                            )))
                        }
                    }
                }
            }
        }
    }

    /// Commit the registration transaction.
    pub async fn register_commit(&mut self) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .context("error committing the registration transaction")?;
        Ok(())
    }

    /// Roll the registration transaction back, best effort: a dropped
    /// connection aborts it on the server side anyway.
    pub async fn register_rollback(&mut self) {
        let failure = match self.conn.as_mut() {
            Some(conn) => sqlx::query("ROLLBACK").execute(&mut *conn).await.err(),
            None => None,
        };
        if let Some(err) = failure {
            tracing::warn!(error = %err, "failed to roll back the registration transaction");
            self.close().await;
        }
    }

    /// The per-tick exchange: report our state, receive the assigned one.
    pub async fn node_active(
        &mut self,
        formation: &str,
        node_id: i64,
        group_id: i32,
        current_state: NodeState,
        pg_is_running: bool,
        current_lsn: Lsn,
        sync_state: &str,
    ) -> Result<AssignedNodeState> {
        let conn = self.connection().await?;
        let row = sqlx::query(
            "SELECT assigned_node_id, assigned_group_id, assigned_node_state::text, \
                    candidate_priority, replication_quorum, assigned_node_name \
               FROM vigil.node_active($1, $2, $3, $4::vigil.replication_state, $5, $6::pg_lsn, $7)",
        )
        .bind(formation)
        .bind(node_id as i32)
        .bind(group_id)
        .bind(current_state.as_str())
        .bind(pg_is_running)
        .bind(current_lsn.to_string())
        .bind(sync_state)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| {
            format!(
                "failed to call node_active for node {} in group {} of formation \"{}\"",
                node_id, group_id, formation
            )
        })?;
        parse_assigned_state(&row)
    }

    /// All nodes of a formation, optionally restricted to one group.
    pub async fn get_nodes(&mut self, formation: &str, group_id: Option<i32>) -> Result<Vec<NodeAddress>> {
        let conn = self.connection().await?;
        let rows = match group_id {
            Some(group_id) => {
                sqlx::query(
                    "SELECT node_id, node_name, node_host, node_port, node_lsn::text, node_is_primary \
                       FROM vigil.get_nodes($1, $2) ORDER BY node_id",
                )
                .bind(formation)
                .bind(group_id)
                .fetch_all(&mut *conn)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT node_id, node_name, node_host, node_port, node_lsn::text, node_is_primary \
                       FROM vigil.get_nodes($1) ORDER BY node_id",
                )
                .bind(formation)
                .fetch_all(&mut *conn)
                .await
            }
        }
        .context("failed to list the formation's nodes on the monitor")?;
        rows.iter().map(parse_node_address).collect()
    }

    /// The other nodes of our group, ordered by node id.
    pub async fn get_other_nodes(&mut self, node_id: i64, state: Option<NodeState>) -> Result<Vec<NodeAddress>> {
        let conn = self.connection().await?;
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT node_id, node_name, node_host, node_port, node_lsn::text, node_is_primary \
                       FROM vigil.get_other_nodes($1, $2::vigil.replication_state) ORDER BY node_id",
                )
                .bind(node_id as i32)
                .bind(state.as_str())
                .fetch_all(&mut *conn)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT node_id, node_name, node_host, node_port, node_lsn::text, node_is_primary \
                       FROM vigil.get_other_nodes($1) ORDER BY node_id",
                )
                .bind(node_id as i32)
                .fetch_all(&mut *conn)
                .await
            }
        }
        .context("failed to call get_other_nodes() on the monitor")?;
        rows.iter().map(parse_node_address).collect()
    }

    /// The current primary of the given group.
    pub async fn get_primary(&mut self, formation: &str, group_id: i32) -> Result<NodeAddress> {
        let conn = self.connection().await?;
        let row = sqlx::query(
            "SELECT primary_node_id, primary_name, primary_host, primary_port \
               FROM vigil.get_primary($1, $2)",
        )
        .bind(formation)
        .bind(group_id)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("failed to get the primary of formation \"{}\" group {}", formation, group_id))?;
        Ok(NodeAddress {
            node_id: row.try_get::<i32, _>(0)? as i64,
            name: row.try_get(1)?,
            host: row.try_get(2)?,
            port: row.try_get::<i32, _>(3)? as u16,
            lsn: Lsn::ZERO,
            is_primary: true,
        })
    }

    /// The coordinator node of the formation, when one exists.
    pub async fn get_coordinator(&mut self, formation: &str) -> Result<Option<NodeAddress>> {
        let conn = self.connection().await?;
        let row = sqlx::query(
            "SELECT node_id, node_name, node_host, node_port FROM vigil.get_coordinator($1)",
        )
        .bind(formation)
        .fetch_optional(&mut *conn)
        .await
        .context("failed to get the formation's coordinator from the monitor")?;
        row.map(|row| {
            Ok(NodeAddress {
                node_id: row.try_get::<i32, _>(0)? as i64,
                name: row.try_get(1)?,
                host: row.try_get(2)?,
                port: row.try_get::<i32, _>(3)? as u16,
                lsn: Lsn::ZERO,
                is_primary: true,
            })
        })
        .transpose()
    }

    /// The standby which reported the most advanced LSN, used as the WAL
    /// source for fast-forwarding.
    pub async fn get_most_advanced_standby(&mut self, formation: &str, group_id: i32) -> Result<NodeAddress> {
        let conn = self.connection().await?;
        let row = sqlx::query(
            "SELECT node_id, node_name, node_host, node_port, node_lsn::text, node_is_primary \
               FROM vigil.get_most_advanced_standby($1, $2)",
        )
        .bind(formation)
        .bind(group_id)
        .fetch_one(&mut *conn)
        .await
        .context("failed to get the most advanced standby from the monitor")?;
        parse_node_address(&row)
    }

    pub async fn start_maintenance(&mut self, node_id: i64) -> Result<bool> {
        let conn = self.connection().await?;
        let row = sqlx::query("SELECT vigil.start_maintenance($1)")
            .bind(node_id as i32)
            .fetch_one(&mut *conn)
            .await
            .context("failed to start maintenance on the monitor")?;
        Ok(row.try_get(0)?)
    }

    pub async fn stop_maintenance(&mut self, node_id: i64) -> Result<bool> {
        let conn = self.connection().await?;
        let row = sqlx::query("SELECT vigil.stop_maintenance($1)")
            .bind(node_id as i32)
            .fetch_one(&mut *conn)
            .await
            .context("failed to stop maintenance on the monitor")?;
        Ok(row.try_get(0)?)
    }

    pub async fn set_node_candidate_priority(&mut self, node_id: i64, host: &str, port: u16, priority: i32) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::query("SELECT vigil.set_node_candidate_priority($1, $2, $3, $4)")
            .bind(node_id as i32)
            .bind(host)
            .bind(port as i32)
            .bind(priority)
            .execute(&mut *conn)
            .await
            .context("failed to set the candidate priority on the monitor")?;
        Ok(())
    }

    pub async fn set_node_replication_quorum(&mut self, node_id: i64, host: &str, port: u16, quorum: bool) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::query("SELECT vigil.set_node_replication_quorum($1, $2, $3, $4)")
            .bind(node_id as i32)
            .bind(host)
            .bind(port as i32)
            .bind(quorum)
            .execute(&mut *conn)
            .await
            .context("failed to set the replication quorum on the monitor")?;
        Ok(())
    }

    pub async fn set_formation_number_sync_standbys(&mut self, formation: &str, number: i32) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::query("SELECT vigil.set_formation_number_sync_standbys($1, $2)")
            .bind(formation)
            .bind(number)
            .execute(&mut *conn)
            .await
            .context("failed to set number_sync_standbys on the monitor")?;
        Ok(())
    }

    /// The value the primary should install as synchronous_standby_names.
    pub async fn synchronous_standby_names(&mut self, formation: &str, group_id: i32) -> Result<String> {
        let conn = self.connection().await?;
        let row = sqlx::query("SELECT vigil.synchronous_standby_names($1, $2)")
            .bind(formation)
            .bind(group_id)
            .fetch_one(&mut *conn)
            .await
            .context("failed to compute synchronous_standby_names on the monitor")?;
        Ok(row.try_get(0)?)
    }

    pub async fn set_node_system_identifier(&mut self, node_id: i64, system_identifier: u64) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::query("SELECT vigil.set_node_system_identifier($1, $2)")
            .bind(node_id as i32)
            .bind(system_identifier as i64)
            .execute(&mut *conn)
            .await
            .context("failed to set the node system identifier on the monitor")?;
        Ok(())
    }

    pub async fn update_node_metadata(&mut self, node_id: i64, name: &str, hostname: &str, port: u16) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::query("SELECT vigil.update_node_metadata($1, $2, $3, $4)")
            .bind(node_id as i32)
            .bind(name)
            .bind(hostname)
            .bind(port as i32)
            .execute(&mut *conn)
            .await
            .context("failed to update the node metadata on the monitor")?;
        Ok(())
    }

    /// Ask the monitor to forget about a node. Removing an already removed
    /// node succeeds, so a half-done drop can be run again.
    pub async fn remove_node(&mut self, host: &str, port: u16) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::query("SELECT vigil.remove_node($1, $2)")
            .bind(host)
            .bind(port as i32)
            .execute(&mut *conn)
            .await
            .context("failed to remove the node from the monitor")?;
        Ok(())
    }

    pub async fn perform_failover(&mut self, formation: &str, group_id: i32) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::query("SELECT vigil.perform_failover($1, $2)")
            .bind(formation)
            .bind(group_id)
            .execute(&mut *conn)
            .await
            .context("failed to ask the monitor for a failover")?;
        Ok(())
    }

    /// Default and installed versions of the vigil extension on the monitor.
    pub async fn get_extension_version(&mut self) -> Result<ExtensionVersion> {
        let conn = self.connection().await?;
        let row = sqlx::query(
            "SELECT default_version, coalesce(installed_version, '') \
               FROM pg_available_extensions WHERE name = $1",
        )
        .bind(vigil_core::EXTENSION_NAME)
        .fetch_one(&mut *conn)
        .await
        .context("failed to read the extension version from the monitor")?;
        Ok(ExtensionVersion {
            default_version: row.try_get(0)?,
            installed_version: row.try_get(1)?,
        })
    }

    /// Open a notification listener on this monitor. Callers which wait for
    /// a state transition they are about to trigger must open the listener
    /// first, so the notification cannot be missed.
    pub async fn notifications(&self) -> Result<MonitorNotifications> {
        MonitorNotifications::connect(&self.uri).await
    }
}

fn parse_assigned_state(row: &PgRow) -> Result<AssignedNodeState> {
    let state_text: String = row.try_get(2)?;
    Ok(AssignedNodeState {
        node_id: row.try_get::<i32, _>(0)? as i64,
        group_id: row.try_get(1)?,
        state: state_text
            .parse()
            .with_context(|| format!("the monitor assigned an unknown state \"{}\"", state_text))?,
        candidate_priority: row.try_get(3)?,
        replication_quorum: row.try_get(4)?,
        name: row.try_get(5).ok(),
    })
}

fn parse_node_address(row: &PgRow) -> Result<NodeAddress> {
    let lsn_text: Option<String> = row.try_get(4)?;
    Ok(NodeAddress {
        node_id: row.try_get::<i32, _>(0)? as i64,
        name: row.try_get(1)?,
        host: row.try_get(2)?,
        port: row.try_get::<i32, _>(3)? as u16,
        lsn: match lsn_text.as_deref() {
            None | Some("") => Lsn::ZERO,
            Some(text) => text
                .parse()
                .with_context(|| format!("the monitor returned an invalid lsn \"{}\"", text))?,
        },
        is_primary: row.try_get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_sqlstates() {
        for code in &["40001", "40003", "40P01", "53100", "53200", "53300", "54000"] {
            assert!(retryable_sqlstate(code), "{} must be retryable", code);
        }
        for code in &["23505", "23P01", "55006", "42883", "08006"] {
            assert!(!retryable_sqlstate(code), "{} must not be retryable", code);
        }
    }
}
