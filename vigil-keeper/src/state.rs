//! The crash-safe on-disk keeper state.
//!
//! The state file is the keeper's durable memory: the monitor must never
//! learn of a state that is not persisted here first. The file is only ever
//! written via write-temp-then-rename so that readers never observe a partial
//! document.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use vigil_core::{AppError, NodeState};

use crate::utils::epoch_seconds;
use vigil_core::protocol::AssignedNodeState;

/// Version of the on-disk layout; readers reject anything else.
pub const STATE_FILE_VERSION: u32 = 1;

/// The keeper's durable state.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KeeperState {
    /// On-disk layout version, always written first.
    pub version: u32,
    /// Node id assigned by the monitor at registration; set exactly once and
    /// never changed for the life of this file. -1 until assigned.
    pub current_node_id: i64,
    /// Group id assigned by the monitor. -1 until assigned.
    pub current_group: i32,
    /// The state we have last reached.
    pub current_role: NodeState,
    /// The goal state assigned by the monitor (or self-assigned during a
    /// network partition).
    pub assigned_role: NodeState,
    /// Epoch seconds of the last successful monitor exchange, 0 for never.
    pub last_monitor_contact: i64,
    /// Epoch seconds of the last observed standby connection, 0 for never.
    pub last_secondary_contact: i64,
    /// Cached control data of the local database.
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    /// The 64-bit database system identifier; 0 until first observed, fatal
    /// to change afterwards.
    pub system_identifier: u64,
}

impl Default for KeeperState {
    fn default() -> Self {
        Self {
            version: STATE_FILE_VERSION,
            current_node_id: -1,
            current_group: -1,
            current_role: NodeState::Init,
            assigned_role: NodeState::Init,
            last_monitor_contact: 0,
            last_secondary_contact: 0,
            pg_control_version: 0,
            catalog_version_no: 0,
            system_identifier: 0,
        }
    }
}

impl KeeperState {
    /// Read the state file. Returns `None` when the file does not exist,
    /// which is only legitimate before the first registration.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("error reading state file {:?}", path))
            }
        };
        let state: KeeperState = serde_json::from_str(&contents)
            .with_context(|| format!("error parsing state file {:?}", path))?;
        anyhow::ensure!(
            state.version == STATE_FILE_VERSION,
            "state file {:?} has version {}, this build reads version {}",
            path,
            state.version,
            STATE_FILE_VERSION
        );
        Ok(Some(state))
    }

    /// Write the state file atomically: serialize to `<path>.new`, then
    /// rename over the destination.
    pub fn write(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("error serializing keeper state")?;
        let temp = path.with_extension("state.new");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("error creating state directory {:?}", parent))?;
        }
        std::fs::write(&temp, contents).with_context(|| format!("error writing {:?}", temp))?;
        std::fs::rename(&temp, path)
            .with_context(|| format!("error installing state file {:?}", path))?;
        Ok(())
    }

    /// Remove the state file, as part of dropping the node.
    pub fn unlink(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("error removing state file {:?}", path)),
        }
    }

    /// Integrate a monitor answer: node identity and assigned goal state.
    ///
    /// The node id is fixed once set; the monitor answering with a different
    /// one means we are talking to the wrong monitor or the wrong state file,
    /// and there is no safe way to continue.
    pub fn update_from_monitor(&mut self, assigned: &AssignedNodeState, update_contact: bool) -> Result<()> {
        if self.current_node_id != -1 && self.current_node_id != assigned.node_id {
            return Err(AppError::IdentityMismatch(format!(
                "monitor assigned node id {} but this node is registered as {}",
                assigned.node_id, self.current_node_id
            ))
            .into());
        }
        if update_contact {
            self.last_monitor_contact = epoch_seconds();
        }
        self.current_node_id = assigned.node_id;
        self.current_group = assigned.group_id;
        self.assigned_role = assigned.state;
        Ok(())
    }

    /// Check and cache the database system identifier. Once nonzero it may
    /// never change: a different identifier means a different database
    /// entirely, a physical replication deal breaker.
    pub fn check_system_identifier(&mut self, system_identifier: u64) -> Result<()> {
        if self.system_identifier != 0 && self.system_identifier != system_identifier {
            return Err(AppError::IdentityMismatch(format!(
                "database system identifier is {}, expected {}",
                system_identifier, self.system_identifier
            ))
            .into());
        }
        self.system_identifier = system_identifier;
        Ok(())
    }
}
