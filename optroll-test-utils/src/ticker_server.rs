//! Accept-side websocket double speaking the public ticker dialect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::warn;

struct ServerState {
    subscriptions: Mutex<Vec<String>>,
    frames: broadcast::Sender<(String, String)>,
    kill: broadcast::Sender<()>,
    connections: AtomicUsize,
}

/// Mock ticker endpoint: acknowledges subscribe frames, answers pings, and
/// forwards pushed ticker frames to connections subscribed to their topic.
pub struct MockTickerServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockTickerServer {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (frames, _) = broadcast::channel(64);
        let (kill, _) = broadcast::channel(4);
        let state = Arc::new(ServerState {
            subscriptions: Mutex::new(Vec::new()),
            frames,
            kill,
            connections: AtomicUsize::new(0),
        });
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let state = accept_state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(state, stream).await {
                                    warn!(error = %err, "mock ticker connection ended with error");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "mock ticker accept failed");
                            break;
                        }
                    },
                }
            }
        });
        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Push one ticker frame to every connection subscribed to the symbol.
    pub fn push_ticker(&self, symbol: &str, mark_price: Decimal, last_price: Decimal) {
        let topic = format!("tickers.{symbol}");
        let frame = json!({
            "topic": topic,
            "type": "snapshot",
            "data": {
                "symbol": symbol,
                "markPrice": mark_price.normalize().to_string(),
                "lastPrice": last_price.normalize().to_string(),
            }
        });
        let _ = self.state.frames.send((topic, frame.to_string()));
    }

    /// All topics ever subscribed, in arrival order (duplicates included).
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().unwrap().clone()
    }

    /// Poll until `topic` shows up among the subscriptions.
    pub async fn wait_for_subscription(&self, topic: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.subscriptions().iter().any(|t| t == topic) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `topic` has been subscribed at least `count` times.
    pub async fn wait_for_subscription_count(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.subscriptions().iter().filter(|t| *t == topic).count() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Hard-drop every live connection to exercise reconnect paths.
    pub fn drop_connections(&self) {
        let _ = self.state.kill.send(());
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for MockTickerServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream) -> Result<()> {
    let mut socket = accept_async(stream).await?;
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut frames = state.frames.subscribe();
    let mut kill = state.kill.subscribe();
    let mut subscribed: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            _ = kill.recv() => {
                let _ = socket.close(None).await;
                break;
            }
            frame = frames.recv() => {
                if let Ok((topic, payload)) = frame {
                    if subscribed.iter().any(|t| *t == topic)
                        && socket.send(Message::Text(payload)).await.is_err()
                    {
                        break;
                    }
                }
            }
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_command(&state, &mut socket, &mut subscribed, &text).await?;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "mock ticker read failed");
                        break;
                    }
                }
            }
        }
    }

    state.connections.fetch_sub(1, Ordering::SeqCst);
    Ok(())
}

async fn handle_command(
    state: &ServerState,
    socket: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    subscribed: &mut Vec<String>,
    text: &str,
) -> Result<()> {
    let value: Value = serde_json::from_str(text)?;
    match value.get("op").and_then(|op| op.as_str()) {
        Some("ping") => {
            socket
                .send(Message::Text(json!({"op": "pong"}).to_string()))
                .await?;
        }
        Some("subscribe") => {
            if let Some(args) = value.get("args").and_then(|v| v.as_array()) {
                for topic in args.iter().filter_map(|entry| entry.as_str()) {
                    subscribed.push(topic.to_string());
                    state
                        .subscriptions
                        .lock()
                        .unwrap()
                        .push(topic.to_string());
                }
            }
            let ack = json!({"op": "subscribe", "success": true});
            socket.send(Message::Text(ack.to_string())).await?;
        }
        _ => {}
    }
    Ok(())
}
