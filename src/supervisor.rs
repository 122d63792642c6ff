//! Health supervisor.
//!
//! Periodically scans the pool for connections the client library has given
//! up on (`Closed`), opens replacements, replays the subscriptions recorded
//! for each dead connection onto its replacement, and swaps them into the
//! pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::pool::{ConnectionId, ConnectionPool};
use crate::transport::Connection;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of one health check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections found closed.
    pub closed: usize,
    /// Closed connections swapped for a working replacement.
    pub replaced: usize,
    /// Closed connections left in place until the next tick.
    pub failed: usize,
}

/// Replaces closed pool connections on a fixed schedule.
pub struct HealthSupervisor {
    pool: Arc<ConnectionPool>,
    initial_delay: Duration,
    interval: Duration,
}

impl HealthSupervisor {
    pub fn new(pool: Arc<ConnectionPool>, initial_delay: Duration, interval: Duration) -> Self {
        Self {
            pool,
            initial_delay,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Supervisor using the schedule from `config.health_check`.
    pub fn from_config(pool: Arc<ConnectionPool>, config: &PoolConfig) -> Self {
        Self::new(
            pool,
            config.health_check.initial_delay(),
            config.health_check.interval(),
        )
    }

    /// Run one health check.
    ///
    /// Replacements are opened before any lock is taken; the pool then
    /// resubscribes and swaps all of them in one step.
    pub async fn tick(&self) -> TickReport {
        let closed = self.pool.closed_connections();
        let mut report = TickReport {
            closed: closed.len(),
            ..Default::default()
        };
        if closed.is_empty() {
            debug!("All pool connections healthy");
            return report;
        }

        info!(closed = closed.len(), "Replacing closed connections");

        let mut candidates: Vec<(ConnectionId, Arc<dyn Connection>)> = Vec::new();
        for dead in &closed {
            match self.pool.connector().connect().await {
                Ok(connection) => candidates.push((dead.id(), connection)),
                Err(e) => {
                    warn!(
                        connection = %dead.id(),
                        error = %e,
                        "Failed to open replacement connection, retrying next check"
                    );
                    report.failed += 1;
                }
            }
        }

        for result in self.pool.replace_batch(candidates).await {
            match result {
                Ok(_) => report.replaced += 1,
                Err(_) => report.failed += 1,
            }
        }

        if report.failed > 0 {
            warn!(
                replaced = report.replaced,
                failed = report.failed,
                "Health check left closed connections in the pool"
            );
        }
        report
    }

    /// Run the check loop in the background.
    ///
    /// The first check runs after `initial_delay`, then every `interval`.
    /// The supervisor runs while the returned handle is alive; dropping the
    /// handle stops it like [`SupervisorHandle::stop`].
    pub fn spawn(self) -> SupervisorHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                initial_delay_ms = self.initial_delay.as_millis() as u64,
                interval_ms = self.interval.as_millis() as u64,
                "Health supervisor started"
            );

            let mut delay = self.initial_delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let report = self.tick().await;
                        if report.closed > 0 {
                            debug!(?report, "Health check finished");
                        }
                        delay = self.interval;
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            info!("Health supervisor stopped");
                            break;
                        }
                    }
                }
            }
        });

        SupervisorHandle {
            cancel: cancel_tx,
            task,
        }
    }
}

/// Handle to a running [`HealthSupervisor`].
///
/// Keep it for as long as the supervisor should run.
#[must_use = "dropping the handle stops the supervisor"]
pub struct SupervisorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Signal the supervisor to stop after its current check.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop the supervisor and wait for its task to finish.
    pub async fn join(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Health supervisor task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
