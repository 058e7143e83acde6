//! Hook points for runtime telemetry.

/// Counters the binary exports as Prometheus metrics. Default methods are
/// no-ops so library users pay nothing for unused hooks.
pub trait EngineObserver: Send + Sync {
    fn price_event(&self) {}
    fn job_enqueued(&self) {}
    fn job_dropped(&self) {}
    fn roll_completed(&self) {}
    fn task_completed(&self) {}
    fn order_failure(&self) {}
    /// The market stream's physical connection went up or down.
    fn stream_connected(&self, _connected: bool) {}
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl EngineObserver for NoopObserver {}
