//! Process-wide signal flags.
//!
//! Signals are translated into atomic booleans which the control loop and the
//! retry loops consult at their safe points. The flags are never acted upon in
//! the middle of a state-file write or a monitor transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Shared signal flags, cheap to clone.
#[derive(Clone, Default)]
pub struct Flags(Arc<FlagsInner>);

#[derive(Default)]
struct FlagsInner {
    stop: AtomicBool,
    stop_fast: AtomicBool,
    reload: AtomicBool,
}

impl Flags {
    /// A graceful stop was requested: finish the current iteration, then exit.
    pub fn asked_to_stop(&self) -> bool {
        self.0.stop.load(Ordering::SeqCst)
    }

    /// A fast stop was requested: exit at the next checkpoint, without
    /// writing half-done state.
    pub fn asked_to_stop_fast(&self) -> bool {
        self.0.stop_fast.load(Ordering::SeqCst)
    }

    /// A configuration reload was requested; honored at the start of the next
    /// loop iteration.
    pub fn asked_to_reload(&self) -> bool {
        self.0.reload.load(Ordering::SeqCst)
    }

    /// Any flag at all: reason enough to break out of a retry loop.
    pub fn should_abort(&self) -> bool {
        self.asked_to_stop() || self.asked_to_stop_fast() || self.asked_to_reload()
    }

    pub fn request_stop(&self) {
        self.0.stop.store(true, Ordering::SeqCst);
    }

    pub fn request_stop_fast(&self) {
        self.0.stop_fast.store(true, Ordering::SeqCst);
    }

    pub fn request_reload(&self) {
        self.0.reload.store(true, Ordering::SeqCst);
    }

    pub fn clear_reload(&self) {
        self.0.reload.store(false, Ordering::SeqCst);
    }
}

/// Spawn the signal watcher task.
///
/// SIGTERM and SIGINT request a graceful stop, SIGQUIT a fast stop, SIGHUP a
/// configuration reload. Stop signals also fire the shutdown broadcast so
/// that tasks suspended in `select!` wake up.
pub fn spawn_signal_watcher(flags: Flags, shutdown_tx: broadcast::Sender<()>) -> Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate()).context("error building SIGTERM stream")?;
    let mut sigint = signal(SignalKind::interrupt()).context("error building SIGINT stream")?;
    let mut sigquit = signal(SignalKind::quit()).context("error building SIGQUIT stream")?;
    let mut sighup = signal(SignalKind::hangup()).context("error building SIGHUP stream")?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, stopping gracefully");
                    flags.request_stop();
                    let _ = shutdown_tx.send(());
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, stopping gracefully");
                    flags.request_stop();
                    let _ = shutdown_tx.send(());
                }
                _ = sigquit.recv() => {
                    tracing::info!("received SIGQUIT, stopping now");
                    flags.request_stop_fast();
                    let _ = shutdown_tx.send(());
                }
                _ = sighup.recv() => {
                    tracing::info!("received SIGHUP, will reload configuration");
                    flags.request_reload();
                }
            }
        }
    }))
}
