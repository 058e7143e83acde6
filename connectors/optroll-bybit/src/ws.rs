//! Resilient public ticker stream.
//!
//! A single background task owns the socket. The active subscription set
//! outlives any one connection: it is replayed after every reconnect, and
//! incremental additions are pushed onto the live socket as they arrive.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use optroll_broker::{ExchangeError, ExchangeErrorKind, ExchangeResult, MarketFeed};
use optroll_core::{PriceEvent, Symbol};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tuning knobs for the streaming session.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub output_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: crate::TESTNET_WS_URL.into(),
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            output_capacity: 100,
        }
    }
}

/// Callback fired whenever the physical connection goes up or down, so the
/// runtime can expose connectivity without reaching into the session task.
pub type ConnectionHook = Arc<dyn Fn(bool) + Send + Sync>;

enum StreamCommand {
    Subscribe {
        symbols: Vec<Symbol>,
        ack: oneshot::Sender<ExchangeResult<()>>,
    },
    Shutdown,
}

/// Handle onto the background streaming task.
pub struct BybitMarketStream {
    command_tx: mpsc::UnboundedSender<StreamCommand>,
}

impl BybitMarketStream {
    /// Spawn the session and return the handle plus the bounded price feed.
    ///
    /// The session connects lazily in the background; `initial_symbols` seed
    /// the subscription set before the first connection attempt.
    pub fn connect(
        config: StreamConfig,
        initial_symbols: Vec<Symbol>,
    ) -> (Self, mpsc::Receiver<PriceEvent>) {
        Self::connect_with_status(config, initial_symbols, None)
    }

    /// Like [`BybitMarketStream::connect`], with a hook observing every
    /// connect and disconnect of the underlying socket.
    pub fn connect_with_status(
        config: StreamConfig,
        initial_symbols: Vec<Symbol>,
        status: Option<ConnectionHook>,
    ) -> (Self, mpsc::Receiver<PriceEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(config.output_capacity.max(1));
        let active: BTreeSet<Symbol> = initial_symbols.into_iter().collect();
        tokio::spawn(maintain_connection(config, active, command_rx, out_tx, status));
        (Self { command_tx }, out_rx)
    }
}

#[async_trait]
impl MarketFeed for BybitMarketStream {
    async fn add_subscriptions(&self, symbols: Vec<Symbol>) -> ExchangeResult<()> {
        let (ack, done) = oneshot::channel();
        self.command_tx
            .send(StreamCommand::Subscribe { symbols, ack })
            .map_err(|_| ExchangeError::Transport("market stream task is gone".into()))?;
        done.await
            .map_err(|_| ExchangeError::Transport("market stream task is gone".into()))?
    }

    fn close(&self) {
        let _ = self.command_tx.send(StreamCommand::Shutdown);
    }
}

impl Drop for BybitMarketStream {
    fn drop(&mut self) {
        let _ = self.command_tx.send(StreamCommand::Shutdown);
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected(String),
}

async fn maintain_connection(
    config: StreamConfig,
    mut active: BTreeSet<Symbol>,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    out_tx: mpsc::Sender<PriceEvent>,
    status: Option<ConnectionHook>,
) {
    let report = |connected: bool| {
        if let Some(hook) = &status {
            hook(connected);
        }
    };
    loop {
        match connect_async(config.url.as_str()).await {
            Ok((socket, _)) => {
                info!(url = %config.url, "connected to ticker stream");
                report(true);
                match run_session(socket, &config, &mut active, &mut commands, &out_tx).await {
                    SessionEnd::Shutdown => {
                        report(false);
                        return;
                    }
                    SessionEnd::Disconnected(reason) => {
                        report(false);
                        warn!(reason = %reason, "ticker stream connection lost");
                    }
                }
            }
            Err(err) => {
                report(false);
                warn!(error = %err, url = %config.url, "ticker stream connect failed");
            }
        }

        if !wait_for_reconnect(config.reconnect_delay, &mut active, &mut commands).await {
            return;
        }
        info!("reconnecting ticker stream");
    }
}

/// Absorb commands during the backoff window. Returns `false` on shutdown.
async fn wait_for_reconnect(
    delay: Duration,
    active: &mut BTreeSet<Symbol>,
    commands: &mut mpsc::UnboundedReceiver<StreamCommand>,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            cmd = commands.recv() => match cmd {
                Some(StreamCommand::Subscribe { symbols, ack }) => {
                    // Offline: the set is updated and replayed on reconnect.
                    merge_new_symbols(active, symbols);
                    let _ = ack.send(Ok(()));
                }
                Some(StreamCommand::Shutdown) | None => return false,
            },
        }
    }
}

fn merge_new_symbols(active: &mut BTreeSet<Symbol>, symbols: Vec<Symbol>) -> Vec<Symbol> {
    let mut fresh = Vec::new();
    for symbol in symbols {
        if active.insert(symbol.clone()) {
            fresh.push(symbol);
        }
    }
    fresh
}

async fn run_session(
    mut socket: WsStream,
    config: &StreamConfig,
    active: &mut BTreeSet<Symbol>,
    commands: &mut mpsc::UnboundedReceiver<StreamCommand>,
    out_tx: &mpsc::Sender<PriceEvent>,
) -> SessionEnd {
    // Replay the full subscription set on every new connection.
    if !active.is_empty() {
        let symbols: Vec<Symbol> = active.iter().cloned().collect();
        if let Err(err) = send_subscribe(&mut socket, &symbols).await {
            return SessionEnd::Disconnected(err.to_string());
        }
    }

    let mut heartbeat = interval(config.ping_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of `interval` fires immediately; skip it.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(StreamCommand::Subscribe { symbols, ack }) => {
                        let fresh = merge_new_symbols(active, symbols);
                        let result = if fresh.is_empty() {
                            Ok(())
                        } else {
                            send_subscribe(&mut socket, &fresh).await
                        };
                        let failed = result.is_err();
                        let reason = result.as_ref().err().map(ToString::to_string);
                        let _ = ack.send(result);
                        if failed {
                            return SessionEnd::Disconnected(
                                reason.unwrap_or_else(|| "subscribe failed".into()),
                            );
                        }
                    }
                    Some(StreamCommand::Shutdown) | None => {
                        let _ = socket.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            return SessionEnd::Disconnected(err.to_string());
                        }
                    }
                    Some(Ok(Message::Text(text))) => handle_text_message(&text, out_tx),
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(text) = String::from_utf8(bytes) {
                            handle_text_message(&text, out_tx);
                        } else {
                            warn!("received non UTF-8 binary payload from ticker stream");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Disconnected(format!("server close: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Disconnected(err.to_string()),
                    None => return SessionEnd::Disconnected("stream ended".into()),
                }
            }
            _ = heartbeat.tick() => {
                if let Err(err) = send_ping(&mut socket).await {
                    return SessionEnd::Disconnected(err.to_string());
                }
            }
        }
    }
}

async fn send_subscribe(socket: &mut WsStream, symbols: &[Symbol]) -> ExchangeResult<()> {
    let args: Vec<String> = symbols.iter().map(|s| format!("tickers.{s}")).collect();
    info!(topics = ?args, "sending subscription request");
    let payload = json!({
        "op": "subscribe",
        "args": args,
    });
    socket
        .send(Message::Text(payload.to_string()))
        .await
        .map_err(|err| ExchangeError::from_display(err, ExchangeErrorKind::Transport))
}

async fn send_ping(socket: &mut WsStream) -> ExchangeResult<()> {
    let payload = json!({ "op": "ping" });
    socket
        .send(Message::Text(payload.to_string()))
        .await
        .map_err(|err| ExchangeError::from_display(err, ExchangeErrorKind::Transport))
}

fn handle_text_message(text: &str, out_tx: &mpsc::Sender<PriceEvent>) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        warn!(payload = text, "failed to parse ticker stream payload");
        return;
    };

    if let Some(op) = value.get("op").and_then(|v| v.as_str()) {
        match op {
            "subscribe" => {
                let success = value
                    .get("success")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                if success {
                    debug!("subscription acknowledged");
                } else {
                    let msg = value
                        .get("ret_msg")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    warn!(message = msg, "subscription rejected");
                }
            }
            "ping" | "pong" => debug!("heartbeat ack"),
            _ => debug!(payload = ?value, "command response"),
        }
        return;
    }

    let Some(topic) = value.get("topic").and_then(|t| t.as_str()) else {
        return;
    };
    if !topic.starts_with("tickers.") {
        debug!(topic, "ignoring unsupported topic");
        return;
    }
    if let Some(event) = extract_price_event(topic, &value) {
        // A full channel means the consumer is behind; a stale price is
        // worse than no price, so drop this tick and let the next one win.
        if let Err(mpsc::error::TrySendError::Full(event)) = out_tx.try_send(event) {
            debug!(symbol = %event.symbol, "price channel full, dropping tick");
        }
    }
}

/// Pull `(symbol, price)` out of a ticker push, preferring the mark price and
/// falling back to the last trade when the mark is zero or absent.
fn extract_price_event(topic: &str, value: &Value) -> Option<PriceEvent> {
    let data = value.get("data")?;
    // Snapshots arrive as an object, some venues batch them into an array.
    let data = if let Some(first) = data.as_array().and_then(|items| items.first()) {
        first
    } else {
        data
    };
    let symbol = data
        .get("symbol")
        .and_then(|s| s.as_str())
        .unwrap_or_else(|| topic.trim_start_matches("tickers."));
    let mark = field_price(data, "markPrice");
    let last = field_price(data, "lastPrice");
    let price = match mark {
        Some(mark) if !mark.is_zero() => mark,
        _ => last.filter(|p| !p.is_zero())?,
    };
    Some(PriceEvent {
        symbol: symbol.to_string(),
        price,
        observed_at: Utc::now(),
    })
}

fn field_price(data: &Value, field: &str) -> Option<Decimal> {
    data.get(field)?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn mark_price_is_preferred() {
        let value = json!({
            "topic": "tickers.BTCUSDT",
            "data": {"symbol": "BTCUSDT", "markPrice": "100500.5", "lastPrice": "100499"}
        });
        let event = extract_price_event("tickers.BTCUSDT", &value).unwrap();
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.price, dec!(100500.5));
    }

    #[test]
    fn zero_mark_falls_back_to_last() {
        let value = json!({
            "topic": "tickers.ETHUSDT",
            "data": {"symbol": "ETHUSDT", "markPrice": "0", "lastPrice": "2990"}
        });
        let event = extract_price_event("tickers.ETHUSDT", &value).unwrap();
        assert_eq!(event.price, dec!(2990));
    }

    #[test]
    fn ticks_without_any_price_are_skipped() {
        let value = json!({
            "topic": "tickers.ETHUSDT",
            "data": {"symbol": "ETHUSDT", "markPrice": "0", "lastPrice": "0"}
        });
        assert!(extract_price_event("tickers.ETHUSDT", &value).is_none());
    }

    #[test]
    fn array_batched_data_uses_first_entry() {
        let value = json!({
            "topic": "tickers.BTCUSDT",
            "data": [{"symbol": "BTCUSDT", "markPrice": "42000"}]
        });
        let event = extract_price_event("tickers.BTCUSDT", &value).unwrap();
        assert_eq!(event.price, dec!(42000));
    }

    #[test]
    fn merge_dedupes_against_active_set() {
        let mut active: BTreeSet<Symbol> = ["BTCUSDT".to_string()].into();
        let fresh = merge_new_symbols(
            &mut active,
            vec!["BTCUSDT".into(), "ETHUSDT".into(), "ETHUSDT".into()],
        );
        assert_eq!(fresh, vec!["ETHUSDT".to_string()]);
        assert_eq!(active.len(), 2);
    }
}
