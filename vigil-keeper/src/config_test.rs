use anyhow::Result;

use super::config::{replication_slot_name, ConfigChanges, KeeperConfig};

#[test]
fn config_parses_a_minimal_file() -> Result<()> {
    let config: KeeperConfig = toml::from_str(
        r#"
        hostname = "10.0.0.1"
        monitor = "postgres://autoctl@monitor/vigil"

        [postgres]
        pgdata = "/var/lib/postgres/data"
        "#,
    )?;

    assert!(config.formation == "default", "unexpected formation, got {}", config.formation);
    assert!(config.group_id == -1, "unexpected group_id, got {}", config.group_id);
    assert!(config.postgres.port == 5432, "unexpected port, got {}", config.postgres.port);
    assert!(
        config.replication.username == "vigil_replicator",
        "unexpected replication user, got {}",
        config.replication.username
    );
    assert!(
        config.timeout.network_partition == 20,
        "unexpected partition timeout, got {}",
        config.timeout.network_partition
    );
    assert!(
        config.timeout.postgres_restart_max_retries == 3,
        "unexpected restart retries, got {}",
        config.timeout.postgres_restart_max_retries
    );
    Ok(())
}

#[test]
fn config_round_trips_through_toml() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let config = KeeperConfig::new_test(tmpdir.path());
    let encoded = toml::to_string_pretty(&config)?;
    let decoded: KeeperConfig = toml::from_str(&encoded)?;
    // The path is skipped by serde and re-attached at load time.
    assert!(decoded.hostname == config.hostname);
    assert!(decoded.postgres == config.postgres);
    assert!(decoded.timeout == config.timeout);
    Ok(())
}

#[test]
fn reload_refuses_a_pgdata_change() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let mut config = KeeperConfig::new_test(tmpdir.path());
    let mut new = config.clone();
    new.postgres.pgdata = tmpdir.path().join("elsewhere");

    let before = config.clone();
    assert!(config.accept_new(new).is_err(), "a pgdata change must be refused");
    assert!(config == before, "a refused reload must leave the configuration untouched");
    Ok(())
}

#[test]
fn reload_keeps_the_old_formation() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let mut config = KeeperConfig::new_test(tmpdir.path());
    let mut new = config.clone();
    new.formation = "other".into();

    let changes = config.accept_new(new)?;
    assert!(config.formation == "default", "formation must be kept, got {}", config.formation);
    assert!(changes == ConfigChanges::default());
    Ok(())
}

#[test]
fn reload_flags_a_monitor_uri_change() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let mut config = KeeperConfig::new_test(tmpdir.path());
    let mut new = config.clone();
    new.monitor = "postgres://autoctl@monitor2/vigil".into();

    let changes = config.accept_new(new)?;
    assert!(changes.monitor_uri, "a monitor uri change must be flagged");
    assert!(!changes.node_metadata);
    assert!(config.monitor == "postgres://autoctl@monitor2/vigil");
    Ok(())
}

#[test]
fn reload_flags_metadata_and_ssl_changes() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let mut config = KeeperConfig::new_test(tmpdir.path());
    let mut new = config.clone();
    new.hostname = "10.0.0.99".into();
    new.ssl.active = true;

    let changes = config.accept_new(new)?;
    assert!(changes.node_metadata, "a hostname change must be flagged");
    assert!(changes.ssl, "an ssl change must be flagged");
    Ok(())
}

#[test]
fn reload_keeps_the_assigned_node_cache() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let mut config = KeeperConfig::new_test(tmpdir.path());
    std::fs::create_dir_all(tmpdir.path())?;
    config.group_id = 3;
    config.replication.slot_name = replication_slot_name(7);

    let mut new = config.clone();
    new.group_id = -1;
    new.replication.slot_name = String::new();

    let _changes = config.accept_new(new)?;
    assert!(config.group_id == 3, "the assigned group must survive a reload, got {}", config.group_id);
    assert!(
        config.replication.slot_name == "vigil_7",
        "the slot name must survive a reload, got {}",
        config.replication.slot_name
    );
    Ok(())
}

#[test]
fn node_cache_update_writes_the_file_once() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let mut config = KeeperConfig::new_test(tmpdir.path());

    assert!(config.update_node_cache(2, 0)?, "the first update must write the file");
    assert!(config.path.exists(), "the configuration file must exist after an update");
    assert!(config.replication.slot_name == "vigil_2");
    assert!(!config.update_node_cache(2, 0)?, "an unchanged update must be a no-op");

    let reloaded = KeeperConfig::load(&config.path)?;
    assert!(reloaded.group_id == 0, "unexpected group after reload, got {}", reloaded.group_id);
    Ok(())
}

#[test]
fn slot_names_embed_the_node_id() {
    assert!(replication_slot_name(1) == "vigil_1");
    assert!(replication_slot_name(12) == "vigil_12");
}
