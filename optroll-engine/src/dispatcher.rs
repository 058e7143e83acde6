//! Fan-out from price events to affected tasks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use optroll_broker::MarketFeed;
use optroll_core::{Job, PriceEvent, Symbol, Task};
use optroll_store::TaskStore;

use crate::observer::EngineObserver;
use crate::shutdown::ShutdownSignal;

/// Owns the authoritative in-memory snapshot of active tasks, keyed by
/// underlying symbol. Readers dominate: every price tick scans under a read
/// lock, while `reload_tasks` swaps the whole snapshot under a write lock.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    feed: Arc<dyn MarketFeed>,
    snapshot: RwLock<HashMap<Symbol, Vec<Task>>>,
    job_tx: mpsc::Sender<Job>,
    observer: Arc<dyn EngineObserver>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        feed: Arc<dyn MarketFeed>,
        job_tx: mpsc::Sender<Job>,
        observer: Arc<dyn EngineObserver>,
    ) -> Self {
        Self {
            store,
            feed,
            snapshot: RwLock::new(HashMap::new()),
            job_tx,
            observer,
        }
    }

    /// Re-read active tasks, replace the snapshot, and make sure every
    /// underlying present is subscribed on the market stream. Returns the
    /// number of active tasks once both the store read and the subscribe
    /// frame have succeeded.
    pub async fn reload_tasks(&self) -> Result<usize> {
        let tasks = self
            .store
            .list_active()
            .context("failed to load active tasks")?;
        let count = tasks.len();

        let mut map: HashMap<Symbol, Vec<Task>> = HashMap::new();
        for task in tasks {
            map.entry(task.underlying_symbol.clone())
                .or_default()
                .push(task);
        }
        let symbols: Vec<Symbol> = map.keys().cloned().collect();

        {
            let mut guard = self.snapshot.write().expect("task snapshot poisoned");
            *guard = map;
        }

        self.feed
            .add_subscriptions(symbols)
            .await
            .context("failed to subscribe underlyings")?;

        info!(active_tasks = count, "task snapshot refreshed");
        Ok(count)
    }

    /// Drain the price feed until shutdown or the stream closes.
    pub async fn run(&self, mut price_rx: mpsc::Receiver<PriceEvent>, shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                event = price_rx.recv() => match event {
                    Some(event) => self.dispatch(&event),
                    None => {
                        warn!("price feed closed, dispatcher stopping");
                        break;
                    }
                },
            }
        }
    }

    /// Match one price event against the snapshot and enqueue jobs.
    ///
    /// Stale snapshots can only cause spurious enqueues: the saga re-reads
    /// the row and the version CAS is the real concurrency boundary.
    fn dispatch(&self, event: &PriceEvent) {
        self.observer.price_event();
        let guard = self.snapshot.read().expect("task snapshot poisoned");
        let Some(tasks) = guard.get(&event.symbol) else {
            return;
        };
        for task in tasks {
            if !task.should_roll(event.price) {
                continue;
            }
            match self
                .job_tx
                .try_send(Job::new(task.clone(), event.price))
            {
                Ok(()) => {
                    self.observer.job_enqueued();
                    debug!(task_id = task.id, price = %event.price, "job enqueued");
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Losing this tick is fine; the next one re-triggers.
                    self.observer.job_dropped();
                    warn!(task_id = task.id, "job queue full, dropping price event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("job queue closed, dropping price event");
                    return;
                }
            }
        }
    }
}
