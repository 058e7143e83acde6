//! Event-driven price dispatch and the per-task roll state machine.
//!
//! Data flows `market stream -> dispatcher -> job queue -> worker pool ->
//! saga`, with the task store's optimistic lock as the single concurrency
//! boundary between workers (and between processes, if ever run multi-node).

mod dispatcher;
mod observer;
mod recovery;
mod saga;
mod shutdown;
mod worker;

pub use dispatcher::Dispatcher;
pub use observer::{EngineObserver, NoopObserver};
pub use recovery::{RecoveryReport, RecoveryScan};
pub use saga::{next_strike, NextStrikeError, RollOutcome, RollSaga, SagaConfig};
pub use shutdown::ShutdownSignal;
pub use worker::WorkerPool;
