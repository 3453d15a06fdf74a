use anyhow::Result;

use vigil_core::protocol::NodeAddress;

use super::hba::{diff_node_arrays, ensure_host_rules_exist, hba_host_forms, rules_for_node};

fn node(node_id: i64, host: &str) -> NodeAddress {
    NodeAddress {
        node_id,
        name: format!("node_{}", node_id),
        host: host.to_string(),
        port: 5432,
        ..Default::default()
    }
}

#[test]
fn diff_of_identical_arrays_is_empty() {
    let nodes = vec![node(2, "10.0.0.2"), node(3, "10.0.0.3")];
    assert!(diff_node_arrays(&nodes, &nodes).is_empty(), "diff(A, A) must be empty");
}

#[test]
fn diff_detects_new_nodes() {
    let previous = vec![node(2, "10.0.0.2")];
    let current = vec![node(2, "10.0.0.2"), node(3, "10.0.0.3"), node(5, "10.0.0.5")];
    let diff = diff_node_arrays(&previous, &current);
    assert!(diff.len() == 2, "expected 2 new nodes, got {:?}", diff);
    assert!(diff[0].node_id == 3);
    assert!(diff[1].node_id == 5);
}

#[test]
fn diff_detects_changed_hostnames() {
    let previous = vec![node(2, "10.0.0.2"), node(3, "10.0.0.3")];
    let current = vec![node(2, "10.0.0.2"), node(3, "10.0.1.99")];
    let diff = diff_node_arrays(&previous, &current);
    assert!(diff.len() == 1, "expected 1 changed node, got {:?}", diff);
    assert!(diff[0].node_id == 3);
    assert!(diff[0].host == "10.0.1.99");
}

#[test]
fn diff_ignores_removed_nodes() {
    // Removals are not pruned from HBA, so they do not show in the diff.
    let previous = vec![node(2, "10.0.0.2"), node(3, "10.0.0.3")];
    let current = vec![node(3, "10.0.0.3")];
    assert!(diff_node_arrays(&previous, &current).is_empty());
}

#[test]
fn diff_from_an_empty_snapshot_returns_everything() {
    let current = vec![node(2, "10.0.0.2"), node(3, "10.0.0.3")];
    let diff = diff_node_arrays(&[], &current);
    assert!(diff.len() == 2, "all nodes are new on first refresh, got {:?}", diff);
}

#[test]
fn host_forms_for_literals_and_names() {
    assert!(hba_host_forms("10.0.0.2") == vec!["10.0.0.2/32"]);
    assert!(hba_host_forms("fe80::1") == vec!["fe80::1/128"]);
    assert!(hba_host_forms("localhost") == vec!["127.0.0.1/32", "::1/128"]);
    assert!(hba_host_forms("db2.example.com") == vec!["db2.example.com"]);
}

#[test]
fn rules_cover_database_and_replication() {
    let rules = rules_for_node(&node(2, "10.0.0.2"), false, "appdb", "vigil_replicator", "trust");
    assert!(rules.len() == 2, "expected 2 rules, got {:?}", rules);
    assert!(rules[0] == "host \"appdb\" all 10.0.0.2/32 trust");
    assert!(rules[1] == "host replication \"vigil_replicator\" 10.0.0.2/32 trust");
}

#[test]
fn ssl_switches_the_connection_type() {
    let rules = rules_for_node(&node(2, "10.0.0.2"), true, "appdb", "vigil_replicator", "scram-sha-256");
    assert!(rules[0].starts_with("hostssl "), "ssl rules must use hostssl, got {}", rules[0]);
}

#[tokio::test]
async fn editing_is_idempotent() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let hba_path = tmpdir.path().join("pg_hba.conf");
    std::fs::write(&hba_path, "local all all trust\n")?;

    let nodes = vec![node(2, "10.0.0.2"), node(3, "10.0.0.3")];
    let edited = ensure_host_rules_exist(&hba_path, &nodes, false, "appdb", "vigil_replicator", "trust").await?;
    assert!(edited, "the first pass must edit the file");

    let first_pass = std::fs::read_to_string(&hba_path)?;
    let edited = ensure_host_rules_exist(&hba_path, &nodes, false, "appdb", "vigil_replicator", "trust").await?;
    assert!(!edited, "the second pass must be a no-op");
    assert!(std::fs::read_to_string(&hba_path)? == first_pass);

    // The original contents are still in place, ahead of our rules.
    assert!(first_pass.starts_with("local all all trust\n"));
    assert!(first_pass.contains("host \"appdb\" all 10.0.0.2/32 trust\n"));
    assert!(first_pass.contains("host replication \"vigil_replicator\" 10.0.0.3/32 trust\n"));
    Ok(())
}
