//! Wiring for the long-running agent process.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use optroll_broker::{
    CredentialSource, Credentials, ExchangeError, ExchangePort, ExchangeResult, MarketFeed,
};
use optroll_bybit::{
    BybitClient, BybitConfig, BybitMarketStream, ConnectionHook, StreamConfig, MAINNET_REST_URL,
    MAINNET_WS_URL, TESTNET_REST_URL, TESTNET_WS_URL,
};
use optroll_config::AppConfig;
use optroll_core::Job;
use optroll_engine::{
    Dispatcher, EngineObserver, RecoveryScan, RollSaga, SagaConfig, ShutdownSignal, WorkerPool,
};
use optroll_store::{SqliteTaskStore, TaskStore};

use crate::telemetry::AgentMetrics;

/// Credential table sourced from the configuration files.
struct ConfigCredentials {
    entries: HashMap<i64, Credentials>,
}

impl ConfigCredentials {
    fn from_config(config: &AppConfig) -> Self {
        let entries = config
            .credentials
            .iter()
            .map(|entry| {
                (
                    entry.id,
                    Credentials {
                        api_key: entry.api_key.clone(),
                        api_secret: entry.api_secret.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }
}

#[async_trait]
impl CredentialSource for ConfigCredentials {
    async fn credentials(&self, credential_id: i64) -> ExchangeResult<Credentials> {
        self.entries.get(&credential_id).cloned().ok_or_else(|| {
            ExchangeError::Authentication(format!("no credentials configured for {credential_id}"))
        })
    }
}

/// REST endpoint chosen from the override or the testnet flag.
pub fn rest_url(config: &AppConfig) -> String {
    config.exchange.rest_url.clone().unwrap_or_else(|| {
        if config.exchange.testnet {
            TESTNET_REST_URL.into()
        } else {
            MAINNET_REST_URL.into()
        }
    })
}

/// Build the REST exchange port from the configuration.
pub fn build_exchange(config: &AppConfig) -> Arc<dyn ExchangePort> {
    Arc::new(BybitClient::new(BybitConfig {
        base_url: rest_url(config),
        recv_window: config.exchange.recv_window,
        http_timeout: config.exchange.http_timeout(),
    }))
}

/// Run the agent until ctrl-c: recovery scan, then dispatch until shutdown.
pub async fn run_agent(config: AppConfig) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let metrics = Arc::new(AgentMetrics::new());
    let observer: Arc<dyn EngineObserver> = metrics.clone();

    let metrics_addr = config
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics address {}", config.metrics_addr))?;
    metrics.serve(metrics_addr);

    if let Some(dir) = config.store.path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store directory {dir:?}"))?;
    }
    let store: Arc<dyn TaskStore> = Arc::new(
        SqliteTaskStore::open(&config.store.path)
            .with_context(|| format!("failed to open task store at {:?}", config.store.path))?,
    );

    let ws_url = config.exchange.ws_url.clone().unwrap_or_else(|| {
        if config.exchange.testnet {
            TESTNET_WS_URL.into()
        } else {
            MAINNET_WS_URL.into()
        }
    });
    info!(rest_url = %rest_url(&config), ws_url = %ws_url, "connecting to exchange");

    let exchange = build_exchange(&config);
    let credentials: Arc<dyn CredentialSource> = Arc::new(ConfigCredentials::from_config(&config));
    if config.credentials.is_empty() {
        warn!("no credentials configured, private calls will fail");
    }

    let initial_symbols: BTreeSet<String> = store
        .list_active()
        .context("failed to load initial tasks")?
        .into_iter()
        .map(|task| task.underlying_symbol)
        .collect();
    let status_observer = observer.clone();
    let status_hook: ConnectionHook = Arc::new(move |up| status_observer.stream_connected(up));
    let (stream, price_rx) = BybitMarketStream::connect_with_status(
        StreamConfig {
            url: ws_url,
            reconnect_delay: config.stream.reconnect_delay(),
            ping_interval: config.stream.ping_interval(),
            output_capacity: config.stream.output_capacity,
        },
        initial_symbols.into_iter().collect(),
        Some(status_hook),
    );
    let feed: Arc<dyn MarketFeed> = Arc::new(stream);

    let (job_tx, job_rx) = mpsc::channel::<Job>(config.engine.job_queue_capacity.max(1));
    let saga = Arc::new(RollSaga::new(
        exchange.clone(),
        store.clone(),
        SagaConfig {
            expiry_grace: chrono::Duration::seconds(config.engine.expiry_grace_secs),
            aggressive_limit_slippage: config.engine.aggressive_limit_slippage,
            leg2_retry_delay: config.engine.leg2_retry_delay(),
        },
        shutdown.clone(),
        observer.clone(),
    ));
    let pool = WorkerPool::spawn(
        config.engine.worker_pool_size,
        job_rx,
        saga,
        credentials.clone(),
        shutdown.clone(),
    );

    // Reconcile interrupted sagas before any price event is processed.
    RecoveryScan::new(
        store.clone(),
        exchange.clone(),
        credentials.clone(),
        job_tx.clone(),
    )
    .run()
    .await?;

    let dispatcher = Dispatcher::new(store, feed.clone(), job_tx, observer);
    dispatcher.reload_tasks().await?;

    info!("agent running, press ctrl-c to stop");
    dispatcher.run(price_rx, shutdown.clone()).await;

    info!("shutting down");
    feed.close();
    drop(dispatcher);
    pool.join().await;
    Ok(())
}
