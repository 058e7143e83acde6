//! Startup reconciliation of tasks stranded in intermediate saga states.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use optroll_broker::{CredentialSource, ExchangePort};
use optroll_core::{Job, Task, TaskState};
use optroll_store::TaskStore;

/// Counts of what the scan did, for startup logging.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Tasks re-entered at the opening leg.
    pub resumed: usize,
    /// Tasks rewound to `IDLE` for the normal trigger path.
    pub reset: usize,
    /// Tasks left untouched because the probe itself failed.
    pub skipped: usize,
}

/// Runs once at startup, before the dispatcher begins draining prices.
pub struct RecoveryScan {
    store: Arc<dyn TaskStore>,
    exchange: Arc<dyn ExchangePort>,
    credentials: Arc<dyn CredentialSource>,
    job_tx: mpsc::Sender<Job>,
}

impl RecoveryScan {
    pub fn new(
        store: Arc<dyn TaskStore>,
        exchange: Arc<dyn ExchangePort>,
        credentials: Arc<dyn CredentialSource>,
        job_tx: mpsc::Sender<Job>,
    ) -> Self {
        Self {
            store,
            exchange,
            credentials,
            job_tx,
        }
    }

    pub async fn run(&self) -> Result<RecoveryReport> {
        let tasks = self
            .store
            .list_active()
            .context("failed to load tasks for recovery")?;
        let mut report = RecoveryReport::default();
        for task in tasks {
            match task.status {
                TaskState::Leg1Closed => {
                    info!(task_id = task.id, "resuming interrupted roll at open leg");
                    self.enqueue(task).await?;
                    report.resumed += 1;
                }
                TaskState::RollInitiated => match self.reconcile_initiated(task).await {
                    Ok(resumed) => {
                        if resumed {
                            report.resumed += 1;
                        } else {
                            report.reset += 1;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "recovery probe failed, leaving task untouched");
                        report.skipped += 1;
                    }
                },
                _ => {}
            }
        }
        info!(
            resumed = report.resumed,
            reset = report.reset,
            skipped = report.skipped,
            "recovery scan finished"
        );
        Ok(report)
    }

    /// We do not know whether the close order landed; the position is the
    /// arbiter. Gone -> the close succeeded, resume at the open leg. Still
    /// there -> rewind and let the next tick re-attempt from the top.
    async fn reconcile_initiated(&self, mut task: Task) -> Result<bool> {
        let cred = self
            .credentials
            .credentials(task.credential_id)
            .await
            .with_context(|| format!("credentials for task {}", task.id))?;
        let position = self
            .exchange
            .position(&cred, &task.current_option_symbol)
            .await
            .with_context(|| format!("position probe for task {}", task.id))?;

        if position.is_flat() {
            self.store
                .update_state(task.id, TaskState::Leg1Closed, task.version)
                .context("failed to advance to checkpoint")?;
            task.status = TaskState::Leg1Closed;
            task.version += 1;
            info!(task_id = task.id, "close had landed, resuming at open leg");
            self.enqueue(task).await?;
            Ok(true)
        } else {
            self.store
                .update_state(task.id, TaskState::Idle, task.version)
                .context("failed to rewind task")?;
            warn!(
                task_id = task.id,
                "close outcome unknown but position remains, rewound to idle"
            );
            Ok(false)
        }
    }

    /// Synthetic job: the recovery short-circuit ignores the price anyway.
    async fn enqueue(&self, task: Task) -> Result<()> {
        let price = task.trigger_price;
        self.job_tx
            .send(Job::new(task, price))
            .await
            .context("job queue closed during recovery")
    }
}
