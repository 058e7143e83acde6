//! In-process exchange double with scripted responses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;

use optroll_broker::{
    CredentialSource, Credentials, ExchangeError, ExchangePort, ExchangeResult, MarketFeed,
};
use optroll_core::{OrderId, OrderRequest, Position, Price, Side, Symbol};

/// One order accepted by the mock, with its synthetic exchange id.
#[derive(Clone, Debug)]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub request: OrderRequest,
}

#[derive(Default)]
struct ExchangeInner {
    index_prices: HashMap<String, Price>,
    mark_prices: HashMap<String, Price>,
    chains: HashMap<(String, NaiveDate), Vec<Decimal>>,
    positions: HashMap<String, Position>,
    orders: Vec<PlacedOrder>,
    seen_link_ids: HashSet<String>,
    order_failures: VecDeque<ExchangeError>,
    failing_link_prefix: Option<(String, String)>,
    position_failures: VecDeque<ExchangeError>,
    mark_failures: VecDeque<ExchangeError>,
    order_seq: u64,
}

/// Scripted [`ExchangePort`] double. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MockExchange {
    inner: Arc<Mutex<ExchangeInner>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_index_price(&self, symbol: &str, price: Price) {
        self.inner
            .lock()
            .unwrap()
            .index_prices
            .insert(symbol.into(), price);
    }

    pub fn set_mark_price(&self, symbol: &str, price: Price) {
        self.inner
            .lock()
            .unwrap()
            .mark_prices
            .insert(symbol.into(), price);
    }

    pub fn set_chain(&self, base: &str, expiry: NaiveDate, strikes: Vec<Decimal>) {
        self.inner
            .lock()
            .unwrap()
            .chains
            .insert((base.into(), expiry), strikes);
    }

    pub fn set_position(&self, symbol: &str, side: Side, quantity: Decimal) {
        self.inner.lock().unwrap().positions.insert(
            symbol.into(),
            Position {
                symbol: symbol.into(),
                side: Some(side),
                quantity,
                entry_price: None,
                mark_price: None,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn clear_position(&self, symbol: &str) {
        self.inner.lock().unwrap().positions.remove(symbol);
    }

    /// Fail the next order submission with `error`, then recover.
    pub fn queue_order_failure(&self, error: ExchangeError) {
        self.inner.lock().unwrap().order_failures.push_back(error);
    }

    /// Keep failing every order whose client id starts with `prefix`.
    pub fn fail_orders_matching(&self, prefix: &str, message: &str) {
        self.inner.lock().unwrap().failing_link_prefix =
            Some((prefix.to_string(), message.to_string()));
    }

    pub fn queue_position_failure(&self, error: ExchangeError) {
        self.inner
            .lock()
            .unwrap()
            .position_failures
            .push_back(error);
    }

    pub fn queue_mark_failure(&self, error: ExchangeError) {
        self.inner.lock().unwrap().mark_failures.push_back(error);
    }

    /// All orders accepted so far, in submission order.
    pub fn orders(&self) -> Vec<PlacedOrder> {
        self.inner.lock().unwrap().orders.clone()
    }
}

#[async_trait]
impl ExchangePort for MockExchange {
    async fn index_price(&self, symbol: &str) -> ExchangeResult<Price> {
        self.inner
            .lock()
            .unwrap()
            .index_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Exchange(format!("index price not found for {symbol}")))
    }

    async fn option_chain(&self, base: &str, expiry: NaiveDate) -> ExchangeResult<Vec<Decimal>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .chains
            .get(&(base.to_string(), expiry))
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_price(&self, option_symbol: &str) -> ExchangeResult<Price> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.mark_failures.pop_front() {
            return Err(err);
        }
        inner
            .mark_prices
            .get(option_symbol)
            .copied()
            .ok_or_else(|| {
                ExchangeError::Exchange(format!("mark price not found for {option_symbol}"))
            })
    }

    async fn position(&self, _cred: &Credentials, option_symbol: &str) -> ExchangeResult<Position> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.position_failures.pop_front() {
            return Err(err);
        }
        Ok(inner
            .positions
            .get(option_symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(option_symbol)))
    }

    async fn positions(&self, _cred: &Credentials) -> ExchangeResult<Vec<Position>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect())
    }

    async fn place_order(
        &self,
        _cred: &Credentials,
        request: OrderRequest,
    ) -> ExchangeResult<OrderId> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.order_failures.pop_front() {
            return Err(err);
        }
        if let Some((prefix, message)) = inner.failing_link_prefix.clone() {
            if request.client_order_id.starts_with(&prefix) {
                return Err(ExchangeError::Exchange(message));
            }
        }
        // Duplicate idempotency keys are accepted without a second execution.
        if !inner.seen_link_ids.insert(request.client_order_id.clone()) {
            let existing = inner
                .orders
                .iter()
                .find(|o| o.request.client_order_id == request.client_order_id)
                .map(|o| o.order_id.clone())
                .unwrap_or_else(|| request.client_order_id.clone());
            return Ok(existing);
        }
        inner.order_seq += 1;
        let order_id = format!("mock-{}", inner.order_seq);
        if request.reduce_only {
            // A filled reduce-only IOC leaves the book flat.
            if let Some(position) = inner.positions.get_mut(&request.symbol) {
                position.quantity = Decimal::ZERO;
                position.side = None;
            }
        }
        inner.orders.push(PlacedOrder {
            order_id: order_id.clone(),
            request,
        });
        Ok(order_id)
    }
}

/// Credential table backed by a plain map.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    entries: Arc<Mutex<HashMap<i64, Credentials>>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, id: i64, api_key: &str, api_secret: &str) -> Self {
        self.entries.lock().unwrap().insert(
            id,
            Credentials {
                api_key: api_key.into(),
                api_secret: api_secret.into(),
            },
        );
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credentials(&self, credential_id: i64) -> ExchangeResult<Credentials> {
        self.entries
            .lock()
            .unwrap()
            .get(&credential_id)
            .cloned()
            .ok_or_else(|| {
                ExchangeError::Authentication(format!("unknown credential id {credential_id}"))
            })
    }
}

/// [`MarketFeed`] double that records subscription requests.
#[derive(Clone, Default)]
pub struct RecordingFeed {
    calls: Arc<Mutex<Vec<Vec<Symbol>>>>,
}

impl RecordingFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `add_subscriptions` call, in order.
    pub fn calls(&self) -> Vec<Vec<Symbol>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MarketFeed for RecordingFeed {
    async fn add_subscriptions(&self, symbols: Vec<Symbol>) -> ExchangeResult<()> {
        self.calls.lock().unwrap().push(symbols);
        Ok(())
    }

    fn close(&self) {}
}
