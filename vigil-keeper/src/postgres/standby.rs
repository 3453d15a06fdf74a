//! Standby replication-source configuration.
//!
//! A standby follows its upstream through a small configuration file owned
//! by the keeper, included from postgresql.conf. The file is rewritten
//! whenever the upstream changes; postgres is restarted only when the new
//! contents differ byte for byte from what is already on disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use vigil_core::protocol::NodeAddress;

/// Name of the keeper-owned standby configuration file inside pgdata.
pub const STANDBY_CONF_FILENAME: &str = "postgresql-vigil-standby.conf";

/// Everything needed to follow an upstream node.
#[derive(Clone, Debug)]
pub struct ReplicationSource {
    pub primary: NodeAddress,
    pub username: String,
    pub password: Option<String>,
    pub slot_name: String,
    pub ssl_mode: String,
    /// Our node name, advertised as application_name so that the primary's
    /// synchronous_standby_names can refer to us.
    pub application_name: String,
    pub maximum_backup_rate: String,
    pub backup_directory: PathBuf,
}

impl ReplicationSource {
    /// The primary_conninfo value pointing at the upstream.
    pub fn primary_conninfo(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_conninfo_value(&self.primary.host)),
            format!("port={}", self.primary.port),
            format!("user={}", quote_conninfo_value(&self.username)),
            format!("application_name={}", quote_conninfo_value(&self.application_name)),
            format!("sslmode={}", self.ssl_mode),
        ];
        if let Some(password) = &self.password {
            parts.push(format!("password={}", quote_conninfo_value(password)));
        }
        parts.join(" ")
    }

    /// A conninfo for tools that need a regular database connection to the
    /// upstream, such as the rewind.
    pub fn source_server_conninfo(&self) -> String {
        format!(
            "host={} port={} user={} dbname=postgres sslmode={}",
            quote_conninfo_value(&self.primary.host),
            self.primary.port,
            quote_conninfo_value(&self.username),
            self.ssl_mode,
        )
    }
}

/// Quote a conninfo value when it contains characters the keyword=value
/// syntax would misread.
fn quote_conninfo_value(value: &str) -> String {
    if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\') {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    } else {
        value.to_string()
    }
}

/// The contents of the standby configuration file for this source. The slot
/// line is omitted when no slot applies, as when fast-forwarding from
/// another standby.
pub fn standby_file_contents(source: &ReplicationSource) -> String {
    let mut contents = format!(
        "# Managed by vigil-keeper, changes will be overwritten.\n\
         primary_conninfo = '{}'\n",
        source.primary_conninfo().replace('\'', "''"),
    );
    if !source.slot_name.is_empty() {
        contents.push_str(&format!("primary_slot_name = '{}'\n", source.slot_name));
    }
    contents
}

/// Write the standby configuration and make sure the standby signal file
/// exists. Returns whether the configuration file changed, in which case the
/// caller issues a checkpoint and restarts postgres.
pub async fn write_standby_configuration(pgdata: &Path, source: &ReplicationSource) -> Result<bool> {
    let conf_path = pgdata.join(STANDBY_CONF_FILENAME);
    let new_contents = standby_file_contents(source);

    let current_contents = match tokio::fs::read_to_string(&conf_path).await {
        Ok(contents) => Some(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(err).with_context(|| format!("error reading standby configuration {:?}", conf_path))
        }
    };
    let changed = current_contents.as_deref() != Some(new_contents.as_str());

    if changed {
        let temp = conf_path.with_extension("conf.new");
        tokio::fs::write(&temp, &new_contents)
            .await
            .with_context(|| format!("error writing {:?}", temp))?;
        tokio::fs::rename(&temp, &conf_path)
            .await
            .with_context(|| format!("error installing standby configuration {:?}", conf_path))?;
    }

    let signal_path = pgdata.join("standby.signal");
    if !signal_path.exists() {
        tokio::fs::write(&signal_path, "")
            .await
            .with_context(|| format!("error creating {:?}", signal_path))?;
    }
    Ok(changed)
}

/// Make sure postgresql.conf includes our standby configuration file.
/// Returns whether the file was edited.
pub async fn ensure_standby_conf_include(pgdata: &Path) -> Result<bool> {
    let conf_path = pgdata.join("postgresql.conf");
    let include_line = format!("include '{}'", STANDBY_CONF_FILENAME);

    let contents = tokio::fs::read_to_string(&conf_path)
        .await
        .with_context(|| format!("error reading {:?}", conf_path))?;
    if contents.lines().any(|line| line.trim() == include_line) {
        return Ok(false);
    }

    // The standby file must not be included before it exists, or postgres
    // refuses to start.
    let standby_conf = pgdata.join(STANDBY_CONF_FILENAME);
    if !standby_conf.exists() {
        tokio::fs::write(&standby_conf, "")
            .await
            .with_context(|| format!("error creating {:?}", standby_conf))?;
    }

    let mut new_contents = contents;
    if !new_contents.ends_with('\n') && !new_contents.is_empty() {
        new_contents.push('\n');
    }
    new_contents.push_str(&include_line);
    new_contents.push('\n');

    let temp = conf_path.with_extension("conf.new");
    tokio::fs::write(&temp, new_contents)
        .await
        .with_context(|| format!("error writing {:?}", temp))?;
    tokio::fs::rename(&temp, &conf_path)
        .await
        .with_context(|| format!("error installing {:?}", conf_path))?;
    Ok(true)
}
