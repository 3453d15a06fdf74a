//! Host-based-access rules for the peer nodes of our group.
//!
//! After each refresh of the peer list, the keeper makes sure every peer can
//! open regular connections to the configured database and replication
//! connections as the replication role. Rules are only ever added; pruning
//! rules for removed peers is left to the operator, an absent node does no
//! harm in HBA.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};

use vigil_core::protocol::NodeAddress;

/// Compute the peers whose HBA rules need attention: nodes absent from the
/// previous snapshot, and nodes whose hostname changed. Both inputs are
/// ordered by node id, as the monitor returns them.
pub fn diff_node_arrays(previous: &[NodeAddress], current: &[NodeAddress]) -> Vec<NodeAddress> {
    let mut diff = Vec::new();
    let mut previous_iter = previous.iter().peekable();

    for node in current {
        loop {
            match previous_iter.peek() {
                Some(known) if known.node_id < node.node_id => {
                    // A node we knew is gone; HBA rules are not pruned.
                    previous_iter.next();
                }
                Some(known) if known.node_id == node.node_id => {
                    if known.host != node.host {
                        diff.push(node.clone());
                    }
                    previous_iter.next();
                    break;
                }
                _ => {
                    diff.push(node.clone());
                    break;
                }
            }
        }
    }
    diff
}

/// The HBA address forms for a host: literal addresses get their exact CIDR
/// form, `localhost` covers both families, and hostnames are written as-is
/// (postgres resolves both address families for names).
pub fn hba_host_forms(host: &str) -> Vec<String> {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => vec![format!("{}/32", addr)],
        Ok(IpAddr::V6(addr)) => vec![format!("{}/128", addr)],
        Err(_) if host == "localhost" => vec!["127.0.0.1/32".to_string(), "::1/128".to_string()],
        Err(_) => vec![host.to_string()],
    }
}

/// The two rules granting a peer access: regular connections to the
/// configured database, and replication connections as the replication role.
pub fn rules_for_node(
    node: &NodeAddress,
    ssl_active: bool,
    dbname: &str,
    replication_username: &str,
    auth_method: &str,
) -> Vec<String> {
    let connection = if ssl_active { "hostssl" } else { "host" };
    let mut rules = Vec::new();
    for form in hba_host_forms(&node.host) {
        rules.push(format!("{} \"{}\" all {} {}", connection, dbname, form, auth_method));
        rules.push(format!(
            "{} replication \"{}\" {} {}",
            connection, replication_username, form, auth_method
        ));
    }
    rules
}

/// Make sure the rules for every given node exist in the HBA file, appending
/// the missing ones. Returns whether the file was edited, in which case the
/// caller asks postgres for a configuration reload (when it runs at all; an
/// edit while postgres is down takes effect at the next start).
pub async fn ensure_host_rules_exist(
    hba_path: &Path,
    nodes: &[NodeAddress],
    ssl_active: bool,
    dbname: &str,
    replication_username: &str,
    auth_method: &str,
) -> Result<bool> {
    let contents = tokio::fs::read_to_string(hba_path)
        .await
        .with_context(|| format!("error reading HBA file {:?}", hba_path))?;

    let mut missing = Vec::new();
    for node in nodes {
        for rule in rules_for_node(node, ssl_active, dbname, replication_username, auth_method) {
            let exists = contents.lines().any(|line| line.trim() == rule) || missing.contains(&rule);
            if !exists {
                missing.push(rule);
            }
        }
    }
    if missing.is_empty() {
        return Ok(false);
    }

    tracing::info!(hba = ?hba_path, rules = missing.len(), "adding HBA rules for peer nodes");
    let mut new_contents = contents;
    if !new_contents.ends_with('\n') && !new_contents.is_empty() {
        new_contents.push('\n');
    }
    for rule in &missing {
        new_contents.push_str(rule);
        new_contents.push('\n');
    }

    let temp = hba_path.with_extension("conf.new");
    tokio::fs::write(&temp, new_contents)
        .await
        .with_context(|| format!("error writing {:?}", temp))?;
    tokio::fs::rename(&temp, hba_path)
        .await
        .with_context(|| format!("error installing HBA file {:?}", hba_path))?;
    Ok(true)
}
