//! Node states of the vigil finite state machine.
//!
//! The textual names are part of the wire protocol with the monitor: they are
//! the values sent to and received from the monitor's SQL functions, and must
//! never change for a given state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A state a database node can be in, as assigned by the monitor and reported
/// by the keeper.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Initial state of a freshly registered node.
    Init,
    /// A primary without any standby.
    Single,
    /// A primary waiting for its standby to catch up before enabling
    /// synchronous replication.
    WaitPrimary,
    /// A primary with synchronous replication to at least one standby.
    Primary,
    /// A primary re-applying replication settings assigned by the monitor.
    ApplySettings,
    /// A standby selected for promotion, catching up on the last of the WAL.
    PreparePromotion,
    /// A promoting standby that is writable-pending: replication has stopped
    /// but writes are not accepted yet.
    StopReplication,
    /// A registered standby waiting for the primary to allow connections.
    WaitStandby,
    /// A standby replaying WAL but not yet considered in sync.
    Catchingup,
    /// A standby in steady state.
    Secondary,
    /// A node parked for maintenance, postgres stopped.
    Maintenance,
    /// A primary stepping down in order to enter maintenance.
    PrepareMaintenance,
    /// A standby waiting for the primary to adjust before maintenance.
    WaitMaintenance,
    /// A demoting primary draining its connections.
    Draining,
    /// A primary that lost both the monitor and its standby and steps down to
    /// avoid a split brain.
    DemoteTimeout,
    /// A former primary, postgres stopped, waiting to rejoin.
    Demoted,
    /// A standby reporting its last received LSN during a failover election.
    ReportLsn,
    /// A standby fetching missed WAL from the most advanced standby.
    FastForward,
    /// Terminal state: the node has been removed from the monitor.
    Dropped,
    /// Sentinel: no state known.
    Unknown,
    /// Sentinel: matches any state in FSM table lookups.
    Any,
}

impl NodeState {
    /// States in which the local database must not run.
    ///
    /// Starting postgres while current or assigned role is one of these would
    /// create a split-brain hazard, so `ensure_current_state` is skipped
    /// around transitions involving them.
    pub fn keeps_postgres_down(&self) -> bool {
        matches!(self, NodeState::Draining | NodeState::DemoteTimeout | NodeState::Demoted)
    }

    /// True for the terminal state of the FSM.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Dropped)
    }

    /// The stable wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Init => "init",
            NodeState::Single => "single",
            NodeState::WaitPrimary => "wait_primary",
            NodeState::Primary => "primary",
            NodeState::ApplySettings => "apply_settings",
            NodeState::PreparePromotion => "prepare_promotion",
            NodeState::StopReplication => "stop_replication",
            NodeState::WaitStandby => "wait_standby",
            NodeState::Catchingup => "catchingup",
            NodeState::Secondary => "secondary",
            NodeState::Maintenance => "maintenance",
            NodeState::PrepareMaintenance => "prepare_maintenance",
            NodeState::WaitMaintenance => "wait_maintenance",
            NodeState::Draining => "draining",
            NodeState::DemoteTimeout => "demote_timeout",
            NodeState::Demoted => "demoted",
            NodeState::ReportLsn => "report_lsn",
            NodeState::FastForward => "fast_forward",
            NodeState::Dropped => "dropped",
            NodeState::Unknown => "unknown",
            NodeState::Any => "any",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let state = match value {
            "init" => NodeState::Init,
            "single" => NodeState::Single,
            "wait_primary" => NodeState::WaitPrimary,
            "primary" => NodeState::Primary,
            "apply_settings" => NodeState::ApplySettings,
            "prepare_promotion" => NodeState::PreparePromotion,
            "stop_replication" => NodeState::StopReplication,
            "wait_standby" => NodeState::WaitStandby,
            "catchingup" => NodeState::Catchingup,
            "secondary" => NodeState::Secondary,
            "maintenance" => NodeState::Maintenance,
            "prepare_maintenance" => NodeState::PrepareMaintenance,
            "wait_maintenance" => NodeState::WaitMaintenance,
            "draining" => NodeState::Draining,
            "demote_timeout" => NodeState::DemoteTimeout,
            "demoted" => NodeState::Demoted,
            "report_lsn" => NodeState::ReportLsn,
            "fast_forward" => NodeState::FastForward,
            "dropped" => NodeState::Dropped,
            "unknown" => NodeState::Unknown,
            "any" => NodeState::Any,
            other => anyhow::bail!("unknown node state \"{}\"", other),
        };
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[NodeState] = &[
        NodeState::Init,
        NodeState::Single,
        NodeState::WaitPrimary,
        NodeState::Primary,
        NodeState::ApplySettings,
        NodeState::PreparePromotion,
        NodeState::StopReplication,
        NodeState::WaitStandby,
        NodeState::Catchingup,
        NodeState::Secondary,
        NodeState::Maintenance,
        NodeState::PrepareMaintenance,
        NodeState::WaitMaintenance,
        NodeState::Draining,
        NodeState::DemoteTimeout,
        NodeState::Demoted,
        NodeState::ReportLsn,
        NodeState::FastForward,
        NodeState::Dropped,
        NodeState::Unknown,
        NodeState::Any,
    ];

    #[test]
    fn wire_names_round_trip() {
        for state in ALL {
            let parsed: NodeState = state.as_str().parse().expect("known wire name must parse");
            assert!(parsed == *state, "round trip failed for {}, got {}", state, parsed);
        }
    }

    #[test]
    fn wire_names_are_stable() {
        // These names are exchanged with the monitor, changing any of them is
        // a protocol break.
        assert!(NodeState::WaitPrimary.as_str() == "wait_primary");
        assert!(NodeState::DemoteTimeout.as_str() == "demote_timeout");
        assert!(NodeState::Catchingup.as_str() == "catchingup");
        assert!(NodeState::ReportLsn.as_str() == "report_lsn");
        assert!(NodeState::PreparePromotion.as_str() == "prepare_promotion");
    }

    #[test]
    fn down_states() {
        for state in &[NodeState::Draining, NodeState::DemoteTimeout, NodeState::Demoted] {
            assert!(state.keeps_postgres_down(), "{} must keep postgres down", state);
        }
        assert!(!NodeState::Primary.keeps_postgres_down());
        assert!(!NodeState::Maintenance.keeps_postgres_down());
    }
}
