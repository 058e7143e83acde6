//! Tracing setup and the Prometheus counters the agent exports.

use std::convert::Infallible;
use std::fs::{self, File, OpenOptions};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use prometheus::{Encoder, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the non-blocking writer flushing for the process lifetime.
static LOG_WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("cannot create log directory {}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))
}

/// Install the global subscriber: a compact stdout layer always, plus a JSON
/// file layer when `log_path` is configured.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    let stdout = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    let base = tracing_subscriber::registry().with(stdout);

    let Some(path) = log_path else {
        base.try_init().context("tracing already initialized")?;
        return Ok(());
    };

    let (writer, guard) = tracing_appender::non_blocking(open_log_file(path)?);
    let _ = LOG_WRITER_GUARD.set(guard);
    let json = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(EnvFilter::new(filter));
    base.with(json)
        .try_init()
        .context("tracing already initialized")?;
    Ok(())
}

const STREAM_LABEL: &str = "bybit-ticker";

/// Prometheus series collected while the agent runs.
pub struct AgentMetrics {
    registry: Registry,
    price_events_total: IntCounter,
    jobs_enqueued_total: IntCounter,
    jobs_dropped_total: IntCounter,
    rolls_total: IntCounter,
    tasks_completed_total: IntCounter,
    order_failures_total: IntCounter,
    stream_status: GaugeVec,
}

impl AgentMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let counter = IntCounter::new(name, help).expect("valid counter definition");
            registry
                .register(Box::new(counter.clone()))
                .expect("unique counter registration");
            counter
        }

        let price_events_total =
            counter(&registry, "price_events_total", "Price events processed");
        let jobs_enqueued_total = counter(
            &registry,
            "jobs_enqueued_total",
            "Jobs handed to the worker pool",
        );
        let jobs_dropped_total = counter(
            &registry,
            "jobs_dropped_total",
            "Jobs dropped because the queue was full",
        );
        let rolls_total = counter(&registry, "rolls_total", "Rolls completed end to end");
        let tasks_completed_total = counter(
            &registry,
            "tasks_completed_total",
            "Tasks finished by expiry or vanished position",
        );
        let order_failures_total = counter(
            &registry,
            "order_failures_total",
            "Order submissions that failed",
        );
        let stream_status = GaugeVec::new(
            Opts::new(
                "stream_connected",
                "Market stream connectivity (1 = connected, 0 = down)",
            ),
            &["stream"],
        )
        .expect("valid gauge definition");
        registry
            .register(Box::new(stream_status.clone()))
            .expect("unique gauge registration");

        Self {
            registry,
            price_events_total,
            jobs_enqueued_total,
            jobs_dropped_total,
            rolls_total,
            tasks_completed_total,
            order_failures_total,
            stream_status,
        }
    }

    /// Serve the registry over HTTP; only `/metrics` is routed.
    pub fn serve(&self, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let service = make_service_fn(move |_| {
                let registry = registry.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                        let registry = registry.clone();
                        async move { Ok::<_, Infallible>(render_scrape(&req, &registry)) }
                    }))
                }
            });
            if let Err(err) = hyper::Server::bind(&addr).serve(service).await {
                error!(error = %err, %addr, "metrics endpoint stopped");
            }
        })
    }
}

fn render_scrape(req: &Request<Body>, registry: &Registry) -> Response<Body> {
    if req.uri().path() != "/metrics" {
        return plain_response(StatusCode::NOT_FOUND, "not found");
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %err, "metrics scrape could not be encoded");
        return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed");
    }
    let mut response = Response::new(Body::from(buffer));
    let content_type = HeaderValue::from_str(encoder.format_type())
        .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    response
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl optroll_engine::EngineObserver for AgentMetrics {
    fn price_event(&self) {
        self.price_events_total.inc();
    }

    fn job_enqueued(&self) {
        self.jobs_enqueued_total.inc();
    }

    fn job_dropped(&self) {
        self.jobs_dropped_total.inc();
    }

    fn roll_completed(&self) {
        self.rolls_total.inc();
    }

    fn task_completed(&self) {
        self.tasks_completed_total.inc();
    }

    fn order_failure(&self) {
        self.order_failures_total.inc();
    }

    fn stream_connected(&self, connected: bool) {
        self.stream_status
            .with_label_values(&[STREAM_LABEL])
            .set(if connected { 1.0 } else { 0.0 });
    }
}
