//! The postgres controller service.
//!
//! Start and stop of the local database belong to exactly one task: this
//! one. The keeper loop addresses it through `PostgresCtlHandle`, a typed
//! request channel; a restart of the service (it runs as a permanent child
//! of the supervisor) re-attaches to whatever postgres is doing on disk.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use futures::stream::StreamExt;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::KeeperConfig;

/// Seconds pg_ctl waits for a start or stop to complete.
const PG_CTL_TIMEOUT_SECS: u32 = 30;

/// What the controller knows about the postmaster.
#[derive(Clone, Copy, Debug, Default)]
pub struct PgStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub port: Option<u16>,
}

enum CtlRequest {
    EnsureRunning(oneshot::Sender<Result<()>>),
    EnsureStopped(oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<Result<PgStatus>>),
}

/// A cheap-to-clone handle used to address the controller service.
#[derive(Clone)]
pub struct PostgresCtlHandle {
    tx: mpsc::Sender<CtlRequest>,
}

impl PostgresCtlHandle {
    pub async fn ensure_running(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CtlRequest::EnsureRunning(tx))
            .await
            .context("the postgres controller is gone")?;
        rx.await.context("the postgres controller dropped the request")?
    }

    pub async fn ensure_stopped(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CtlRequest::EnsureStopped(tx))
            .await
            .context("the postgres controller is gone")?;
        rx.await.context("the postgres controller dropped the request")?
    }

    pub async fn status(&self) -> Result<PgStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CtlRequest::Status(tx))
            .await
            .context("the postgres controller is gone")?;
        rx.await.context("the postgres controller dropped the request")?
    }
}

/// The controller service itself.
pub struct PostgresCtl {
    pgdata: PathBuf,
    pg_ctl: String,
    logfile: PathBuf,
    requests: ReceiverStream<CtlRequest>,
    shutdown: BroadcastStream<()>,
}

impl PostgresCtl {
    /// Create a new instance along with its request handle.
    pub fn new(config: &KeeperConfig, shutdown: broadcast::Receiver<()>) -> (Self, PostgresCtlHandle) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                pgdata: config.postgres.pgdata.clone(),
                pg_ctl: config.postgres.pg_ctl.clone(),
                logfile: config.run_directory.join("postgres.log"),
                requests: ReceiverStream::new(rx),
                shutdown: BroadcastStream::new(shutdown),
            },
            PostgresCtlHandle { tx },
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(pgdata = ?self.pgdata, "postgres controller has started");
        loop {
            tokio::select! {
                Some(request) = self.requests.next() => self.handle_request(request).await,
                _ = self.shutdown.next() => break,
            }
        }
        tracing::debug!("postgres controller is shutting down");
        Ok(())
    }

    async fn handle_request(&mut self, request: CtlRequest) {
        match request {
            CtlRequest::EnsureRunning(reply) => {
                let _ = reply.send(self.ensure_running().await);
            }
            CtlRequest::EnsureStopped(reply) => {
                let _ = reply.send(self.ensure_stopped().await);
            }
            CtlRequest::Status(reply) => {
                let _ = reply.send(self.status().await);
            }
        }
    }

    async fn status(&self) -> Result<PgStatus> {
        let output = Command::new(&self.pg_ctl)
            .arg("status")
            .arg("-D")
            .arg(&self.pgdata)
            .output()
            .await
            .with_context(|| format!("error running {} status", self.pg_ctl))?;

        // pg_ctl status exits 0 when the postmaster runs, 3 when it does
        // not, 4 when pgdata is not a database directory.
        match output.status.code() {
            Some(0) => {
                let (pid, port) = read_postmaster_pid(&self.pgdata).await;
                Ok(PgStatus { running: true, pid, port })
            }
            Some(3) => Ok(PgStatus::default()),
            Some(4) => bail!("{:?} is not a postgres data directory", self.pgdata),
            _ => bail!(
                "pg_ctl status failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    async fn ensure_running(&self) -> Result<()> {
        if self.status().await?.running {
            return Ok(());
        }
        tracing::info!(pgdata = ?self.pgdata, "starting postgres");
        let output = Command::new(&self.pg_ctl)
            .arg("start")
            .arg("-D")
            .arg(&self.pgdata)
            .arg("-w")
            .arg("-t")
            .arg(PG_CTL_TIMEOUT_SECS.to_string())
            .arg("-l")
            .arg(&self.logfile)
            .output()
            .await
            .with_context(|| format!("error running {} start", self.pg_ctl))?;
        if !output.status.success() {
            bail!(
                "pg_ctl start failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn ensure_stopped(&self) -> Result<()> {
        if !self.status().await?.running {
            return Ok(());
        }
        tracing::info!(pgdata = ?self.pgdata, "stopping postgres");
        let output = Command::new(&self.pg_ctl)
            .arg("stop")
            .arg("-D")
            .arg(&self.pgdata)
            .arg("-w")
            .arg("-t")
            .arg(PG_CTL_TIMEOUT_SECS.to_string())
            .arg("-m")
            .arg("fast")
            .output()
            .await
            .with_context(|| format!("error running {} stop", self.pg_ctl))?;
        if !output.status.success() {
            bail!(
                "pg_ctl stop failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Read the postmaster pid and port out of `postmaster.pid`, best effort.
async fn read_postmaster_pid(pgdata: &Path) -> (Option<u32>, Option<u16>) {
    match tokio::fs::read_to_string(pgdata.join("postmaster.pid")).await {
        Ok(contents) => parse_postmaster_pid(&contents),
        Err(_) => (None, None),
    }
}

/// The postmaster.pid layout: pid on the first line, the port on the fourth.
fn parse_postmaster_pid(contents: &str) -> (Option<u32>, Option<u16>) {
    let mut lines = contents.lines();
    let pid = lines.next().and_then(|line| line.trim().parse().ok());
    let port = lines.nth(2).and_then(|line| line.trim().parse().ok());
    (pid, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postmaster_pid_parses() {
        let contents = "1234\n/var/lib/postgres/data\n1690000000\n5432\n/tmp\nlocalhost\n";
        let (pid, port) = parse_postmaster_pid(contents);
        assert!(pid == Some(1234), "unexpected pid {:?}", pid);
        assert!(port == Some(5432), "unexpected port {:?}", port);
    }

    #[test]
    fn postmaster_pid_tolerates_short_files() {
        let (pid, port) = parse_postmaster_pid("1234\n");
        assert!(pid == Some(1234));
        assert!(port.is_none());

        let (pid, port) = parse_postmaster_pid("");
        assert!(pid.is_none());
        assert!(port.is_none());
    }
}
