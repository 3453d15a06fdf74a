//! Asynchronous notifications from the monitor.
//!
//! The monitor publishes on two channels: `state` carries JSON-encoded state
//! transition events, `log` carries free-form strings which we forward to our
//! own log. Notifications are drained fully before a wait returns.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgListener;
use tokio::time::Instant;

use vigil_core::protocol::StateNotification;
use vigil_core::NodeState;

/// The monitor's notification channels.
const CHANNEL_STATE: &str = "state";
const CHANNEL_LOG: &str = "log";

/// A listener on the monitor's notification channels.
pub struct MonitorNotifications {
    listener: PgListener,
}

impl MonitorNotifications {
    /// Connect to the monitor and LISTEN on both channels.
    pub async fn connect(uri: &str) -> Result<Self> {
        let mut listener = PgListener::connect(uri)
            .await
            .context("error connecting the notification listener to the monitor")?;
        listener
            .listen_all([CHANNEL_STATE, CHANNEL_LOG])
            .await
            .context("error listening on the monitor notification channels")?;
        Ok(Self { listener })
    }

    /// The next state event, or `None` once the timeout elapses. Log channel
    /// messages are forwarded as they arrive and do not reset the timeout.
    pub async fn next_state(&mut self, timeout: Duration) -> Result<Option<StateNotification>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let notification = match tokio::time::timeout(remaining, self.listener.recv()).await {
                Err(_elapsed) => return Ok(None),
                Ok(result) => result.context("error receiving monitor notifications")?,
            };
            match notification.channel() {
                CHANNEL_LOG => {
                    tracing::info!(monitor = true, "{}", notification.payload());
                }
                CHANNEL_STATE => match StateNotification::parse(notification.payload()) {
                    Ok(event) => {
                        tracing::debug!(
                            node_id = event.node_id,
                            reported = %event.reported_state,
                            goal = %event.goal_state,
                            "state notification",
                        );
                        return Ok(Some(event));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, payload = notification.payload(), "failed to parse state notification");
                    }
                },
                other => {
                    tracing::warn!(channel = other, "received notification on an unexpected channel");
                }
            }
        }
    }

    /// Consume state events until the predicate holds or the overall timeout
    /// elapses. Returns whether the predicate was satisfied.
    pub async fn wait_for<F>(&mut self, mut predicate: F, timeout: Duration) -> Result<bool>
    where
        F: FnMut(&StateNotification) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match self.next_state(remaining).await? {
                Some(event) if predicate(&event) => return Ok(true),
                Some(_event) => continue,
                None => return Ok(false),
            }
        }
    }

    /// Wait until some node of the given group reports the target state.
    pub async fn wait_until_some_node_reported_state(
        &mut self,
        formation: &str,
        group_id: i32,
        target: NodeState,
        timeout: Duration,
    ) -> Result<bool> {
        self.wait_for(
            |event| event.formation == formation && event.group_id == group_id && event.reported_state == target,
            timeout,
        )
        .await
    }
}
