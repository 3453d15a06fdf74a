//! Data model of the monitor protocol.
//!
//! These are the row shapes returned by the monitor's SQL functions and the
//! payloads delivered over its notification channels.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nodestate::NodeState;

/// A log sequence number, the monotonic position in the database write-ahead
/// log used to compare replication progress between nodes.
///
/// The textual form is the usual pair of hex halves, `1/4E2B8C0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero LSN, `0/0`, reported when a position is unknown.
    pub const ZERO: Lsn = Lsn(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl PartialOrd for Lsn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Lsn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Error parsing a textual LSN.
#[derive(Debug, Error)]
#[error("invalid lsn \"{0}\"")]
pub struct ParseLsnError(String);

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = value.split_once('/').ok_or_else(|| ParseLsnError(value.to_string()))?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| ParseLsnError(value.to_string()))?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| ParseLsnError(value.to_string()))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(ParseLsnError(value.to_string()));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl Serialize for Lsn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Address and replication position of a peer node, as returned by the
/// monitor's `get_nodes` and `get_other_nodes` functions.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NodeAddress {
    pub node_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Last position reported by this node, `0/0` when unknown.
    #[serde(default)]
    pub lsn: Lsn,
    #[serde(default)]
    pub is_primary: bool,
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} \"{}\" ({}:{})", self.node_id, self.name, self.host, self.port)
    }
}

/// The monitor's answer to `register_node` and `node_active`: the identity of
/// the node together with its assigned goal state and replication settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AssignedNodeState {
    pub node_id: i64,
    pub group_id: i32,
    pub state: NodeState,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
    /// Node name, possibly generated by the monitor at registration.
    #[serde(default)]
    pub name: Option<String>,
}

/// Default and installed versions of the monitor-side extension.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtensionVersion {
    pub default_version: String,
    pub installed_version: String,
}

/// A state-transition event published by the monitor on its `state`
/// notification channel, as a JSON payload.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct StateNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub formation: String,
    #[serde(rename = "groupId")]
    pub group_id: i32,
    #[serde(rename = "nodeId")]
    pub node_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "reportedState")]
    pub reported_state: NodeState,
    #[serde(rename = "goalState")]
    pub goal_state: NodeState,
}

impl StateNotification {
    /// Parse a `state` channel payload.
    pub fn parse(payload: &str) -> anyhow::Result<Self> {
        let notification: StateNotification = serde_json::from_str(payload)?;
        anyhow::ensure!(
            notification.kind == "state",
            "notification payload type is \"{}\", expected \"state\"",
            notification.kind
        );
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_text_round_trip() {
        for text in &["0/0", "0/1", "1/4E2B8C0", "FFFFFFFF/FFFFFFFF"] {
            let lsn: Lsn = text.parse().expect("valid lsn must parse");
            assert!(
                lsn.to_string() == *text,
                "lsn round trip failed, got {}, expected {}",
                lsn,
                text
            );
        }
    }

    #[test]
    fn lsn_rejects_garbage() {
        for text in &["", "0", "1/", "/1", "nope/1", "100000000/0"] {
            assert!(text.parse::<Lsn>().is_err(), "\"{}\" must not parse as lsn", text);
        }
    }

    #[test]
    fn lsn_ordering_follows_wal_position() {
        let low: Lsn = "0/5000060".parse().unwrap();
        let high: Lsn = "1/0".parse().unwrap();
        assert!(low < high);
        assert!(Lsn::ZERO < low);
        assert!(Lsn::ZERO.is_zero());
    }

    #[test]
    fn state_notification_parses() {
        let payload = r#"{"type": "state", "formation": "default", "groupId": 0,
                          "nodeId": 2, "name": "node_2", "host": "10.0.0.2", "port": 5432,
                          "reportedState": "primary", "goalState": "draining"}"#;
        let parsed = StateNotification::parse(payload).expect("valid payload must parse");
        assert!(parsed.node_id == 2);
        assert!(parsed.reported_state == NodeState::Primary);
        assert!(parsed.goal_state == NodeState::Draining);
    }

    #[test]
    fn state_notification_rejects_other_types() {
        let payload = r#"{"type": "log", "formation": "default", "groupId": 0,
                          "nodeId": 2, "name": "n", "host": "h", "port": 5432,
                          "reportedState": "primary", "goalState": "primary"}"#;
        assert!(StateNotification::parse(payload).is_err());
    }
}
