use anyhow::Result;

use vigil_core::protocol::NodeAddress;

use super::standby::{
    ensure_standby_conf_include, standby_file_contents, write_standby_configuration, ReplicationSource,
    STANDBY_CONF_FILENAME,
};

fn source(host: &str, slot: &str) -> ReplicationSource {
    ReplicationSource {
        primary: NodeAddress {
            node_id: 1,
            name: "node_1".into(),
            host: host.into(),
            port: 5432,
            ..Default::default()
        },
        username: "vigil_replicator".into(),
        password: None,
        slot_name: slot.into(),
        ssl_mode: "prefer".into(),
        application_name: "node_2".into(),
        maximum_backup_rate: "100M".into(),
        backup_directory: "/tmp/backup".into(),
    }
}

#[test]
fn conninfo_names_the_upstream() {
    let conninfo = source("10.0.0.1", "vigil_2").primary_conninfo();
    assert!(
        conninfo == "host=10.0.0.1 port=5432 user=vigil_replicator application_name=node_2 sslmode=prefer",
        "unexpected conninfo: {}",
        conninfo
    );
}

#[test]
fn conninfo_quotes_awkward_values() {
    let mut src = source("10.0.0.1", "vigil_2");
    src.password = Some("s3cret pass".into());
    let conninfo = src.primary_conninfo();
    assert!(
        conninfo.ends_with("password='s3cret pass'"),
        "passwords with spaces must be quoted, got: {}",
        conninfo
    );
}

#[test]
fn file_contents_carry_conninfo_and_slot() {
    let contents = standby_file_contents(&source("10.0.0.1", "vigil_2"));
    assert!(contents.contains("primary_conninfo = "), "missing primary_conninfo: {}", contents);
    assert!(contents.contains("primary_slot_name = 'vigil_2'"), "missing slot name: {}", contents);
}

#[tokio::test]
async fn rewrites_only_on_content_change() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let pgdata = tmpdir.path().join("pgdata");
    std::fs::create_dir_all(&pgdata)?;

    let changed = write_standby_configuration(&pgdata, &source("10.0.0.1", "vigil_2")).await?;
    assert!(changed, "the first write must report a change");
    assert!(pgdata.join("standby.signal").exists(), "the standby signal must be created");

    let changed = write_standby_configuration(&pgdata, &source("10.0.0.1", "vigil_2")).await?;
    assert!(!changed, "an identical rewrite must not report a change");

    let changed = write_standby_configuration(&pgdata, &source("10.0.0.9", "vigil_2")).await?;
    assert!(changed, "a new upstream host must report a change");

    let contents = std::fs::read_to_string(pgdata.join(STANDBY_CONF_FILENAME))?;
    assert!(contents.contains("10.0.0.9"), "the new host must be in the file: {}", contents);
    Ok(())
}

#[tokio::test]
async fn include_line_is_added_once() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let pgdata = tmpdir.path().join("pgdata");
    std::fs::create_dir_all(&pgdata)?;
    std::fs::write(pgdata.join("postgresql.conf"), "max_connections = 100\n")?;

    let edited = ensure_standby_conf_include(&pgdata).await?;
    assert!(edited, "the include line must be added");
    assert!(pgdata.join(STANDBY_CONF_FILENAME).exists(), "the included file must exist");

    let edited = ensure_standby_conf_include(&pgdata).await?;
    assert!(!edited, "the include line must be added only once");

    let contents = std::fs::read_to_string(pgdata.join("postgresql.conf"))?;
    let occurrences = contents.matches(STANDBY_CONF_FILENAME).count();
    assert!(occurrences == 1, "expected one include line, found {}", occurrences);
    Ok(())
}
