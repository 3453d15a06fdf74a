//! The application supervisor.
//!
//! Two permanent services run under the supervisor: the postgres controller
//! and the keeper node-active loop. Both are restarted when they exit
//! unexpectedly. A keeper exit caused by a monitor extension version
//! mismatch instead re-executes the whole binary from disk, so that an
//! upgraded executable is picked up.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::config::KeeperConfig;
use crate::error::{exit_code_of, FatalError, EXIT_CODE_MONITOR_INCOMPATIBLE};
use crate::keeper::service::KeeperService;
use crate::keeper::Keeper;
use crate::pidfile;
use crate::postgres::ctl::{PostgresCtl, PostgresCtlHandle};
use crate::signals::{spawn_signal_watcher, Flags};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Pause before restarting a crashed service.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// The application object for when vigil runs as the keeper.
pub struct App {
    config: KeeperConfig,
    flags: Flags,
    shutdown_tx: broadcast::Sender<()>,
}

impl App {
    pub fn new(config: KeeperConfig, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            config,
            flags: Flags::default(),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        pidfile::create(&self.config.pid_file_path())?;
        let signal_task = spawn_signal_watcher(self.flags.clone(), self.shutdown_tx.clone())?;

        let (ctl, mut ctl_handle) = PostgresCtl::new(&self.config, self.shutdown_tx.subscribe());
        let mut postgres_task = ctl.spawn();
        let mut keeper_task = self.spawn_keeper(ctl_handle.clone());

        let result = loop {
            tokio::select! {
                res = &mut keeper_task => {
                    match flatten(res) {
                        Ok(()) => break Ok(()),
                        // A fatal error is never restarted: either the
                        // operator has to act, or (for a version mismatch)
                        // the binary itself has to be replaced.
                        Err(err) if err.downcast_ref::<FatalError>().is_some() => {
                            tracing::error!(error = %err, "the keeper service hit a fatal error");
                            break Err(err);
                        }
                        Err(err) => {
                            if self.stopping() {
                                break Ok(());
                            }
                            tracing::error!(error = %err, "the keeper service failed, restarting it");
                            tokio::time::sleep(RESTART_DELAY).await;
                            if self.stopping() {
                                break Ok(());
                            }
                            keeper_task = self.spawn_keeper(ctl_handle.clone());
                        }
                    }
                }
                res = &mut postgres_task => {
                    if self.stopping() {
                        // Let the keeper finish its iteration; it stops on
                        // its own flags.
                        postgres_task = tokio::spawn(std::future::pending());
                        continue;
                    }
                    if let Err(err) = flatten(res) {
                        tracing::error!(error = %err, "the postgres controller failed");
                    }
                    tracing::info!("restarting the postgres controller");
                    tokio::time::sleep(RESTART_DELAY).await;
                    let (ctl, new_handle) = PostgresCtl::new(&self.config, self.shutdown_tx.subscribe());
                    postgres_task = ctl.spawn();
                    ctl_handle = new_handle;
                    // The keeper holds a handle to the dead controller; give
                    // it a fresh one by restarting it too.
                    keeper_task.abort();
                    let _ = (&mut keeper_task).await;
                    keeper_task = self.spawn_keeper(ctl_handle.clone());
                }
            }
        };

        // Shut the remaining tasks down and clean up.
        let _ = self.shutdown_tx.send(());
        signal_task.abort();
        let _ = postgres_task.await;
        if let Err(err) = pidfile::remove(&self.config.pid_file_path()) {
            tracing::warn!(error = %err, "failed to remove the pid file");
        }

        match result {
            Ok(()) => {
                tracing::debug!("vigil keeper shutdown complete");
                Ok(())
            }
            Err(err) if exit_code_of(&err) == EXIT_CODE_MONITOR_INCOMPATIBLE => {
                // Replace this process with the binary currently on disk;
                // after a rolling upgrade that binary speaks the monitor's
                // new extension version.
                reexec_self()
            }
            Err(err) => Err(err),
        }
    }

    fn spawn_keeper(&self, ctl_handle: PostgresCtlHandle) -> JoinHandle<Result<()>> {
        let keeper = Keeper::new(self.config.clone(), self.flags.clone(), ctl_handle);
        KeeperService::new(keeper, self.flags.clone(), self.shutdown_tx.subscribe()).spawn()
    }

    fn stopping(&self) -> bool {
        self.flags.asked_to_stop() || self.flags.asked_to_stop_fast()
    }
}

fn flatten(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(join_err) if join_err.is_cancelled() => Ok(()),
        Err(join_err) => Err(anyhow!(join_err).context("service task panicked")),
    }
}

/// Replace the current process image with the executable on disk, keeping
/// the pid (and with it the pid file) intact.
fn reexec_self() -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("failed to locate the current executable")?;
    tracing::info!(binary = ?exe, "re-executing the keeper to catch up with the monitor");
    let err = std::process::Command::new(&exe).args(std::env::args_os().skip(1)).exec();
    Err(anyhow!(FatalError::new(
        EXIT_CODE_MONITOR_INCOMPATIBLE,
        anyhow!(err).context(format!("failed to re-execute {:?}", exe)),
    )))
}
