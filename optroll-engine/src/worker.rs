//! Fixed-size pool of executors draining the job queue.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use optroll_broker::CredentialSource;
use optroll_core::Job;

use crate::saga::RollSaga;
use crate::shutdown::ShutdownSignal;

/// Spawns `size` workers sharing one receiver. Credentials are fetched per
/// job so key rotation never requires flushing the queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        size: usize,
        job_rx: mpsc::Receiver<Job>,
        saga: Arc<RollSaga>,
        credentials: Arc<dyn CredentialSource>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let job_rx = Arc::new(Mutex::new(job_rx));
        let handles = (0..size.max(1))
            .map(|worker_id| {
                let job_rx = job_rx.clone();
                let saga = saga.clone();
                let credentials = credentials.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, job_rx, saga, credentials, shutdown).await;
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to finish draining.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    saga: Arc<RollSaga>,
    credentials: Arc<dyn CredentialSource>,
    shutdown: ShutdownSignal,
) {
    loop {
        let job = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                _ = shutdown.wait() => return,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            return;
        };

        let cred = match credentials.credentials(job.task.credential_id).await {
            Ok(cred) => cred,
            Err(err) => {
                error!(
                    worker_id,
                    task_id = job.task.id,
                    credential_id = job.task.credential_id,
                    error = %err,
                    "failed to resolve credentials, skipping job"
                );
                continue;
            }
        };

        match saga.execute(&cred, &job.task, job.observed_price).await {
            Ok(outcome) => {
                debug!(worker_id, task_id = job.task.id, ?outcome, "job finished");
            }
            Err(err) => {
                error!(
                    worker_id,
                    task_id = job.task.id,
                    error = %err,
                    "roll execution failed"
                );
            }
        }
    }
}
