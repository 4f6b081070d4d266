//! # Sync Agent
//!
//! Background task that keeps one device converging with the remote.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  every `interval` (missed ticks are delayed, never burst):              │
//! │                                                                         │
//! │    1. push_pending()   local mutations out first, so a pull cannot      │
//! │                        overwrite stock sold offline for long            │
//! │    2. pull_catalog()   remote catalog in                                │
//! │                                                                         │
//! │  Failures are logged and the loop keeps going. The loop ends when the  │
//! │  handle sends shutdown or is dropped.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::pos::PosCore;
use crate::queue::DrainReport;

/// Outcome of the most recent cycle.
#[derive(Debug, Clone, Default)]
pub struct AgentStatus {
    pub cycles: u64,
    pub last_push: Option<DrainReport>,
    pub last_error: Option<String>,
}

pub struct SyncAgent {
    core: Arc<PosCore>,
    interval: Duration,
    status: Arc<RwLock<AgentStatus>>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl SyncAgent {
    /// Spawns the agent on the current runtime.
    pub fn spawn(core: Arc<PosCore>, interval: Duration) -> SyncAgentHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let status = Arc::new(RwLock::new(AgentStatus::default()));
        let agent = SyncAgent {
            core,
            interval,
            status: status.clone(),
            shutdown_rx,
        };
        let task = tokio::spawn(agent.run());
        SyncAgentHandle {
            shutdown_tx,
            status,
            task,
        }
    }

    async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Sync agent started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cycle().await;
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Sync agent received shutdown");
                    break;
                }
            }
        }

        info!("Sync agent stopped");
    }

    async fn cycle(&self) {
        let mut last_error = None;

        let push = match self.core.push_pending().await {
            Ok(report) => {
                debug!(synced = report.synced, retried = report.retried, "Push finished");
                Some(report)
            }
            Err(e) => {
                log_failure("push", &e);
                last_error = Some(e.to_string());
                None
            }
        };

        if let Err(e) = self.core.pull_catalog().await {
            log_failure("pull", &e);
            last_error = Some(e.to_string());
        }

        let mut status = self.status.write().await;
        status.cycles += 1;
        if push.is_some() {
            status.last_push = push;
        }
        status.last_error = last_error;
    }
}

fn log_failure(phase: &'static str, error: &SyncError) {
    match error {
        SyncError::TenantUnresolved => debug!(phase, "Skipped: no tenant yet"),
        e if e.is_retryable() => debug!(phase, error = %e, "Remote unreachable; will retry"),
        e => warn!(phase, error = %e, "Sync cycle failed"),
    }
}

/// Controls a running [`SyncAgent`].
pub struct SyncAgentHandle {
    shutdown_tx: mpsc::Sender<()>,
    status: Arc<RwLock<AgentStatus>>,
    task: JoinHandle<()>,
}

impl SyncAgentHandle {
    pub async fn status(&self) -> AgentStatus {
        self.status.read().await.clone()
    }

    /// Signals the agent and waits for the current cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sync agent task ended abnormally");
        }
    }
}
