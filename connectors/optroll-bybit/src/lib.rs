//! Bybit REST connector targeting the public v5 API.
//!
//! Credentials are supplied per call so that multi-tenant workers always sign
//! with the freshest key material for the task they are executing.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;

use optroll_broker::{
    Credentials, ExchangeError, ExchangeErrorKind, ExchangePort, ExchangeResult,
};
use optroll_core::{
    OptionSymbol, OrderId, OrderRequest, OrderType, Position, Price, Side, TimeInForce,
};

pub mod ws;

pub use ws::{BybitMarketStream, ConnectionHook, StreamConfig};

type HmacSha256 = Hmac<Sha256>;

pub const MAINNET_REST_URL: &str = "https://api.bybit.com";
pub const TESTNET_REST_URL: &str = "https://api-testnet.bybit.com";
pub const MAINNET_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
pub const TESTNET_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";

/// Bybit rejects order creation that reuses a known `orderLinkId`.
const DUPLICATE_ORDER_LINK_ID: i64 = 110072;

/// Configuration for the Bybit REST client.
#[derive(Clone, Debug)]
pub struct BybitConfig {
    pub base_url: String,
    pub recv_window: u64,
    pub http_timeout: Duration,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            base_url: TESTNET_REST_URL.into(),
            recv_window: 5_000,
            http_timeout: Duration::from_secs(5),
        }
    }
}

/// A thin wrapper over the Bybit v5 REST API.
pub struct BybitClient {
    http: Client,
    config: BybitConfig,
}

impl BybitClient {
    /// Build a new client from its configuration.
    pub fn new(config: BybitConfig) -> Self {
        let http = Client::builder()
            .connect_timeout(config.http_timeout)
            .timeout(config.http_timeout)
            .build()
            .expect("failed to create reqwest client");
        Self { http, config }
    }

    /// Convenience helper for the Bybit testnet.
    pub fn testnet() -> Self {
        Self::new(BybitConfig::default())
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn ensure_success<T>(&self, resp: &ApiResponse<T>) -> ExchangeResult<()> {
        if resp.ret_code == 0 {
            Ok(())
        } else {
            Err(ExchangeError::Exchange(format!(
                "{} (code {})",
                resp.ret_msg, resp.ret_code
            )))
        }
    }

    async fn public_get<T>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> ExchangeResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let resp = self
            .http
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|err| ExchangeError::from_display(err, ExchangeErrorKind::Transport))?
            .json::<ApiResponse<T>>()
            .await
            .map_err(|err| ExchangeError::from_display(err, ExchangeErrorKind::Serialization))?;
        self.ensure_success(&resp)?;
        Ok(resp)
    }

    async fn signed_request<T>(
        &self,
        cred: &Credentials,
        method: Method,
        path: &str,
        body: Value,
        query: Option<Vec<(String, String)>>,
    ) -> ExchangeResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let timestamp = Utc::now().timestamp_millis();
        let query_string = query
            .as_ref()
            .map(|pairs| serde_urlencoded::to_string(pairs).unwrap_or_default())
            .unwrap_or_default();
        let payload = if method == Method::GET {
            format!(
                "{timestamp}{}{}{}",
                cred.api_key, self.config.recv_window, query_string
            )
        } else {
            format!(
                "{timestamp}{}{}{}",
                cred.api_key,
                self.config.recv_window,
                body.to_string()
            )
        };
        let mut mac = HmacSha256::new_from_slice(cred.api_secret.as_bytes())
            .map_err(|err| ExchangeError::Other(format!("failed to create signing key: {err}")))?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let mut request = self.http.request(
            method.clone(),
            if query_string.is_empty() {
                self.url(path)
            } else {
                format!("{}?{}", self.url(path), query_string)
            },
        );
        request = request
            .header("X-BAPI-API-KEY", &cred.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", self.config.recv_window.to_string())
            .header("Content-Type", "application/json");
        if method != Method::GET {
            request = request.json(&body);
        }
        let resp = request
            .send()
            .await
            .map_err(|err| ExchangeError::from_display(err, ExchangeErrorKind::Transport))?
            .json::<ApiResponse<T>>()
            .await
            .map_err(|err| ExchangeError::from_display(err, ExchangeErrorKind::Serialization))?;
        Ok(resp)
    }

    fn map_time_in_force(tif: Option<TimeInForce>) -> &'static str {
        match tif.unwrap_or(TimeInForce::GoodTilCanceled) {
            TimeInForce::GoodTilCanceled => "GTC",
            TimeInForce::ImmediateOrCancel => "IOC",
            TimeInForce::FillOrKill => "FOK",
        }
    }

    fn map_order_type(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }

    fn parse_price(raw: &str, field: &str) -> ExchangeResult<Price> {
        Decimal::from_str(raw).map_err(|err| {
            ExchangeError::Serialization(format!("failed to parse {field} '{raw}': {err}"))
        })
    }
}

/// Bare underlyings are quoted against USDT on the linear market.
fn index_ticker(symbol: &str) -> String {
    if symbol.ends_with("USDT") || symbol.ends_with("USD") {
        symbol.to_string()
    } else {
        format!("{symbol}USDT")
    }
}

#[async_trait]
impl ExchangePort for BybitClient {
    async fn index_price(&self, symbol: &str) -> ExchangeResult<Price> {
        let target = index_ticker(symbol);
        let query = vec![
            ("category".to_string(), "linear".to_string()),
            ("symbol".to_string(), target.clone()),
        ];
        let resp: ApiResponse<TickerResult> = self.public_get("/v5/market/tickers", &query).await?;
        let ticker = resp
            .result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Exchange(format!("index price not found for {target}")))?;
        Self::parse_price(&ticker.mark_price, "markPrice")
    }

    async fn option_chain(&self, base: &str, expiry: NaiveDate) -> ExchangeResult<Vec<Decimal>> {
        let query = vec![
            ("category".to_string(), "option".to_string()),
            ("baseCoin".to_string(), base.to_string()),
            ("limit".to_string(), "1000".to_string()),
        ];
        let resp: ApiResponse<InstrumentsResult> = self
            .public_get("/v5/market/instruments-info", &query)
            .await?;
        let mut strikes = BTreeSet::new();
        for item in resp.result.list {
            if item.status != "Trading" {
                continue;
            }
            let Ok(parsed) = item.symbol.parse::<OptionSymbol>() else {
                continue;
            };
            if parsed.expiry == expiry {
                strikes.insert(parsed.strike);
            }
        }
        Ok(strikes.into_iter().collect())
    }

    async fn mark_price(&self, option_symbol: &str) -> ExchangeResult<Price> {
        let query = vec![
            ("category".to_string(), "option".to_string()),
            ("symbol".to_string(), option_symbol.to_string()),
        ];
        let resp: ApiResponse<TickerResult> = self.public_get("/v5/market/tickers", &query).await?;
        let ticker = resp.result.list.into_iter().next().ok_or_else(|| {
            ExchangeError::Exchange(format!("mark price not found for {option_symbol}"))
        })?;
        Self::parse_price(&ticker.mark_price, "markPrice")
    }

    async fn position(&self, cred: &Credentials, option_symbol: &str) -> ExchangeResult<Position> {
        let query = vec![
            ("category".to_string(), "option".to_string()),
            ("symbol".to_string(), option_symbol.to_string()),
        ];
        let resp: ApiResponse<PositionResult> = self
            .signed_request(cred, Method::GET, "/v5/position/list", Value::Null, Some(query))
            .await?;
        self.ensure_success(&resp)?;
        let Some(item) = resp.result.list.into_iter().next() else {
            return Ok(Position::flat(option_symbol));
        };
        item.into_position()
    }

    async fn positions(&self, cred: &Credentials) -> ExchangeResult<Vec<Position>> {
        let query = vec![
            ("category".to_string(), "option".to_string()),
            ("limit".to_string(), "200".to_string()),
        ];
        let resp: ApiResponse<PositionResult> = self
            .signed_request(cred, Method::GET, "/v5/position/list", Value::Null, Some(query))
            .await?;
        self.ensure_success(&resp)?;
        let mut positions = Vec::new();
        for item in resp.result.list {
            let position = item.into_position()?;
            if !position.is_flat() {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn place_order(
        &self,
        cred: &Credentials,
        request: OrderRequest,
    ) -> ExchangeResult<OrderId> {
        let link_id = request.client_order_id.clone();
        let mut payload = serde_json::json!({
            "category": "option",
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": Self::map_order_type(request.order_type),
            "qty": request.quantity.normalize().to_string(),
            "timeInForce": Self::map_time_in_force(request.time_in_force),
            "orderLinkId": request.client_order_id,
        });
        if let Some(price) = request.price {
            payload["price"] = serde_json::json!(price.normalize().to_string());
        }
        if request.reduce_only {
            payload["reduceOnly"] = serde_json::json!(true);
        }
        let resp: ApiResponse<CreateOrderResult> = self
            .signed_request(cred, Method::POST, "/v5/order/create", payload, None)
            .await?;
        if resp.ret_code == DUPLICATE_ORDER_LINK_ID {
            // The attempt already landed; reusing the idempotency key is a no-op.
            warn!(
                order_link_id = %link_id,
                "duplicate orderLinkId accepted as already placed"
            );
            return Ok(link_id);
        }
        self.ensure_success(&resp)?;
        Ok(resp.result.order_id)
    }
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: T,
}

#[derive(Deserialize)]
struct TickerResult {
    list: Vec<TickerItem>,
}

#[derive(Deserialize)]
struct TickerItem {
    #[serde(rename = "markPrice")]
    mark_price: String,
}

#[derive(Deserialize)]
struct InstrumentsResult {
    list: Vec<InstrumentItem>,
}

#[derive(Deserialize)]
struct InstrumentItem {
    symbol: String,
    status: String,
}

#[derive(Deserialize)]
struct PositionResult {
    list: Vec<PositionItem>,
}

#[derive(Deserialize)]
struct PositionItem {
    symbol: String,
    side: String,
    size: String,
    #[serde(rename = "avgPrice")]
    avg_price: String,
    #[serde(rename = "markPrice", default)]
    mark_price: String,
}

impl PositionItem {
    fn into_position(self) -> ExchangeResult<Position> {
        let quantity = Decimal::from_str(&self.size)
            .map_err(|err| ExchangeError::from_display(err, ExchangeErrorKind::Serialization))?;
        Ok(Position {
            symbol: self.symbol,
            side: Side::from_exchange(&self.side),
            quantity,
            entry_price: Decimal::from_str(&self.avg_price).ok(),
            mark_price: Decimal::from_str(&self.mark_price).ok(),
            updated_at: Utc::now(),
        })
    }
}

#[derive(Deserialize, Default)]
struct CreateOrderResult {
    #[serde(rename = "orderId", default)]
    order_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_underlyings_promote_to_linear_tickers() {
        assert_eq!(index_ticker("BTC"), "BTCUSDT");
        assert_eq!(index_ticker("ETHUSDT"), "ETHUSDT");
        assert_eq!(index_ticker("BTCUSD"), "BTCUSD");
    }

    #[test]
    fn signature_payload_is_hex_encoded_sha256() {
        let secret = "sec".repeat(10);
        let payload = format!("{}{}{}{}", 1_658_385_579_423i64, "XXXXXXXXXX", 5_000, "{}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("init mac");
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        assert_eq!(signature.len(), 64, "signature should be 256-bit hex encoded");
    }
}
