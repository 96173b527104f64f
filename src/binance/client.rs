// =============================================================================
// Binance USD-M Futures client - market data + HMAC-SHA256 signed orders
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the runner and Binance servers.
//
// Prices and quantities are truncated to the symbol's PRICE_FILTER tick and
// LOT_SIZE step before they are sent; callers pass raw values.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use super::rate_limit::WeightTracker;
use crate::execution::{BracketOrder, ExecutionProvider, OrderAck, OrderLeg};
use crate::market_data::live::{connect_kline_stream, parse_string_f64};
use crate::market_data::{Candle, LiveCandleStream};
use crate::provider::MarketDataProvider;
use crate::types::{now_ms, Side};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Maximum rows per /fapi/v1/klines page.
const KLINES_PAGE_LIMIT: usize = 1500;

/// Request weight of a full klines page (limit > 1000).
const KLINES_PAGE_WEIGHT: u32 = 10;
const ORDER_WEIGHT: u32 = 1;
const EXCHANGE_INFO_WEIGHT: u32 = 1;

// ---------------------------------------------------------------------------
// Symbol filters
// ---------------------------------------------------------------------------

/// Tick and lot rules for one symbol, from exchangeInfo.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
    price_decimals: usize,
    qty_decimals: usize,
}

impl SymbolFilters {
    fn from_steps(tick_size: &str, step_size: &str) -> Result<Self> {
        Ok(Self {
            tick_size: tick_size
                .parse()
                .with_context(|| format!("invalid tickSize {tick_size}"))?,
            step_size: step_size
                .parse()
                .with_context(|| format!("invalid stepSize {step_size}"))?,
            price_decimals: decimals_of(tick_size),
            qty_decimals: decimals_of(step_size),
        })
    }

    pub fn price(&self, raw: f64) -> f64 {
        truncate_to_step(raw, self.tick_size, self.price_decimals)
    }

    pub fn quantity(&self, raw: f64) -> f64 {
        truncate_to_step(raw, self.step_size, self.qty_decimals)
    }

    fn format_price(&self, raw: f64) -> String {
        format!("{:.*}", self.price_decimals, self.price(raw))
    }

    fn format_quantity(&self, raw: f64) -> String {
        format!("{:.*}", self.qty_decimals, self.quantity(raw))
    }
}

/// Significant fractional digits of a step string such as `"0.00100000"`.
fn decimals_of(step: &str) -> usize {
    match step.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len(),
        None => 0,
    }
}

/// Round `value` down to a multiple of `step`.
fn truncate_to_step(value: f64, step: f64, decimals: usize) -> f64 {
    if step <= 0.0 || !value.is_finite() {
        return value;
    }
    // The epsilon keeps exact multiples (0.3 / 0.1 = 2.9999..) from losing a step.
    let steps = (value / step + 1e-9).floor();
    let scale = 10f64.powi(decimals as i32);
    (steps * step * scale).round() / scale
}

fn parse_symbol_filters(entry: &Value) -> Result<SymbolFilters> {
    let filters = entry["filters"]
        .as_array()
        .context("symbol entry missing 'filters' array")?;
    let find = |kind: &str, field: &str| -> Result<String> {
        filters
            .iter()
            .find(|f| f["filterType"].as_str() == Some(kind))
            .and_then(|f| f[field].as_str())
            .map(str::to_string)
            .with_context(|| format!("{kind}.{field} missing"))
    };
    SymbolFilters::from_steps(&find("PRICE_FILTER", "tickSize")?, &find("LOT_SIZE", "stepSize")?)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Binance futures client with HMAC-SHA256 request signing.
pub struct BinanceClient {
    secret: String,
    base_url: String,
    ws_base_url: String,
    client: reqwest::Client,
    weights: WeightTracker,
    filters: RwLock<HashMap<String, SymbolFilters>>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// # Arguments
    /// * `api_key`     - sent as a header, never in query params. May be
    ///   empty when only public market data is needed.
    /// * `secret`      - used exclusively for HMAC signing.
    /// * `base_url`    - REST root, e.g. `https://fapi.binance.com`.
    /// * `ws_base_url` - WebSocket root, e.g. `wss://fstream.binance.com`.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        ws_base_url: impl Into<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        // Instances run on their own runtimes; pooled connections would be
        // bound to whichever runtime opened them.
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(0)
            .build()
            .context("failed to build HTTP client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            secret: secret.into(),
            base_url,
            ws_base_url: ws_base_url.into(),
            client,
            weights: WeightTracker::new(),
            filters: RwLock::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid HMAC key: {e}"))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Append timestamp, recvWindow and signature to `params`.
    fn signed_query(&self, params: &str) -> Result<String> {
        let ts = now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    /// Send a request and return its JSON body, failing on non-2xx.
    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
        weight: u32,
    ) -> Result<Value> {
        if !self.weights.can_send(weight) {
            bail!("request weight limit reached, refusing {method} {path}");
        }
        let query = if signed {
            self.signed_query(params)?
        } else {
            params.to_string()
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        self.weights.update_from_headers(resp.headers());
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            bail!("Binance {method} {path} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/klines for one page starting at `start_ms`.
    #[instrument(skip(self), name = "binance::get_klines_page")]
    pub async fn get_klines_page(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let params = format!(
            "symbol={symbol}&interval={interval}&startTime={start_ms}&endTime={end_ms}&limit={KLINES_PAGE_LIMIT}"
        );
        let body = self
            .send(Method::GET, "/fapi/v1/klines", &params, false, KLINES_PAGE_WEIGHT)
            .await?;
        let rows = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_kline_row(symbol, interval, row) {
                Ok(candle) => candles.push(candle),
                Err(e) => warn!(error = %e, "skipping malformed kline row"),
            }
        }
        Ok(candles)
    }

    /// Every closed kline with `start_ms <= open_time <= end_ms`, paging
    /// forward until a short page or the end of the range.
    #[instrument(skip(self), name = "binance::get_klines_range")]
    pub async fn get_klines_range(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let now = now_ms();
        let end = end_ms.map_or(now, |e| e.min(now));

        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start_ms;
        while cursor <= end {
            let page = self.get_klines_page(symbol, interval, cursor, end).await?;
            let page_len = page.len();
            let Some(last_open) = page.last().map(|c| c.open_time) else {
                break;
            };
            // The bar still forming at `now` is mutable; only closed bars go out.
            candles.extend(page.into_iter().filter(|c| c.close_time < now));
            if page_len < KLINES_PAGE_LIMIT {
                break;
            }
            cursor = last_open + 1;
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Tick/lot filters for `symbol`, cached after the first lookup.
    #[instrument(skip(self), name = "binance::symbol_filters")]
    pub async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if let Some(filters) = self.filters.read().get(symbol) {
            return Ok(filters.clone());
        }

        let body = self
            .send(Method::GET, "/fapi/v1/exchangeInfo", "", false, EXCHANGE_INFO_WEIGHT)
            .await?;
        let symbols = body["symbols"]
            .as_array()
            .context("exchangeInfo response missing 'symbols'")?;

        let mut cache = self.filters.write();
        for entry in symbols {
            let Some(name) = entry["symbol"].as_str() else {
                continue;
            };
            match parse_symbol_filters(entry) {
                Ok(filters) => {
                    cache.insert(name.to_string(), filters);
                }
                Err(e) => debug!(symbol = name, error = %e, "no usable filters"),
            }
        }
        cache
            .get(symbol)
            .cloned()
            .with_context(|| format!("symbol {symbol} not found in exchangeInfo"))
    }

    // -------------------------------------------------------------------------
    // Orders (signed)
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order.
    #[instrument(skip(self, params), name = "binance::place_order")]
    async fn place_order(&self, symbol: &str, params: &[(&str, String)]) -> Result<Value> {
        let mut query = format!("symbol={symbol}");
        for (key, value) in params {
            query.push_str(&format!("&{key}={value}"));
        }
        debug!(symbol, query = %query, "placing order");
        self.send(Method::POST, "/fapi/v1/order", &query, true, ORDER_WEIGHT)
            .await
    }

    /// DELETE /fapi/v1/allOpenOrders.
    #[instrument(skip(self), name = "binance::cancel_all_open_orders")]
    pub async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &format!("symbol={symbol}"),
            true,
            ORDER_WEIGHT,
        )
        .await?;
        debug!(symbol, "open orders cancelled");
        Ok(())
    }

    /// Reduce-only MARKET order against a position opened in `side`.
    async fn market_reduce(&self, symbol: &str, side: Side, quantity: &str) -> Result<Value> {
        self.place_order(
            symbol,
            &[
                ("side", side.exit_order_side().to_string()),
                ("type", "MARKET".to_string()),
                ("quantity", quantity.to_string()),
                ("reduceOnly", "true".to_string()),
            ],
        )
        .await
    }
}

/// Binance kline row: `[openTime, open, high, low, close, volume, closeTime, ...]`.
fn parse_kline_row(symbol: &str, interval: &str, row: &Value) -> Result<Candle> {
    let arr = row.as_array().context("kline row is not an array")?;
    if arr.len() < 7 {
        bail!("kline row has {} elements", arr.len());
    }
    Ok(Candle {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time: arr[0].as_i64().context("kline openTime")?,
        open: parse_string_f64(&arr[1], "open")?,
        high: parse_string_f64(&arr[2], "high")?,
        low: parse_string_f64(&arr[3], "low")?,
        close: parse_string_f64(&arr[4], "close")?,
        volume: parse_string_f64(&arr[5], "volume")?,
        close_time: arr[6].as_i64().context("kline closeTime")?,
    })
}

/// Turn an order response into an ack. Falls back to the requested price
/// while the order has no average fill price.
fn ack_from_response(leg: OrderLeg, side: &str, requested_price: f64, quantity: f64, body: &Value) -> OrderAck {
    let order_id = match &body["orderId"] {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => String::new(),
    };
    let avg_price = body["avgPrice"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|p| *p > 0.0);
    OrderAck {
        leg,
        order_id,
        side: side.to_string(),
        price: avg_price.unwrap_or(requested_price),
        quantity,
        status: body["status"].as_str().unwrap_or("NEW").to_string(),
        timestamp: body["updateTime"].as_i64().unwrap_or_else(now_ms),
    }
}

// ---------------------------------------------------------------------------
// Provider impls
// ---------------------------------------------------------------------------

#[async_trait]
impl MarketDataProvider for BinanceClient {
    async fn historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>> {
        self.get_klines_range(symbol, interval, start_ms, end_ms).await
    }

    async fn subscribe_live(&self, symbol: &str, interval: &str) -> Result<LiveCandleStream> {
        connect_kline_stream(&self.ws_base_url, symbol, interval).await
    }
}

#[async_trait]
impl ExecutionProvider for BinanceClient {
    /// MARKET entry, then a reduce-only STOP_MARKET stop and a reduce-only
    /// GTC LIMIT target. If either protective leg is rejected the entry is
    /// flattened before the error is returned.
    async fn place_bracket_order(
        &self,
        symbol: &str,
        side: Side,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        quantity: f64,
    ) -> Result<BracketOrder> {
        let filters = self.symbol_filters(symbol).await?;
        let qty = filters.quantity(quantity);
        if qty <= 0.0 {
            bail!(
                "quantity {quantity} truncates to zero for {symbol} (step {})",
                filters.step_size
            );
        }
        let qty_str = filters.format_quantity(quantity);
        let entry_side = side.entry_order_side();
        let exit_side = side.exit_order_side();

        let entry = self
            .place_order(
                symbol,
                &[
                    ("side", entry_side.to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", qty_str.clone()),
                ],
            )
            .await
            .context("entry order rejected")?;

        let protective = async {
            let stop = self
                .place_order(
                    symbol,
                    &[
                        ("side", exit_side.to_string()),
                        ("type", "STOP_MARKET".to_string()),
                        ("stopPrice", filters.format_price(stop_loss)),
                        ("quantity", qty_str.clone()),
                        ("reduceOnly", "true".to_string()),
                    ],
                )
                .await
                .context("stop-loss order rejected")?;
            let target = self
                .place_order(
                    symbol,
                    &[
                        ("side", exit_side.to_string()),
                        ("type", "LIMIT".to_string()),
                        ("price", filters.format_price(take_profit)),
                        ("quantity", qty_str.clone()),
                        ("timeInForce", "GTC".to_string()),
                        ("reduceOnly", "true".to_string()),
                    ],
                )
                .await
                .context("take-profit order rejected")?;
            Ok::<_, anyhow::Error>((stop, target))
        };

        let (stop, target) = match protective.await {
            Ok(legs) => legs,
            Err(e) => {
                warn!(symbol, %side, error = %e, "protective leg failed, flattening entry");
                if let Err(cancel_err) = self.cancel_all_open_orders(symbol).await {
                    warn!(symbol, error = %cancel_err, "cancel after failed bracket failed");
                }
                if let Err(flat_err) = self.market_reduce(symbol, side, &qty_str).await {
                    warn!(symbol, error = %flat_err, "flatten after failed bracket failed");
                }
                return Err(e);
            }
        };

        let bracket = BracketOrder {
            entry: ack_from_response(OrderLeg::Entry, entry_side, entry_price, qty, &entry),
            stop: ack_from_response(OrderLeg::StopLoss, exit_side, filters.price(stop_loss), qty, &stop),
            target: ack_from_response(OrderLeg::TakeProfit, exit_side, filters.price(take_profit), qty, &target),
        };
        info!(
            symbol,
            %side,
            quantity = qty,
            entry_id = %bracket.entry.order_id,
            stop_id = %bracket.stop.order_id,
            target_id = %bracket.target.order_id,
            "bracket placed"
        );
        Ok(bracket)
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        reference_price: f64,
    ) -> Result<OrderAck> {
        if let Err(e) = self.cancel_all_open_orders(symbol).await {
            warn!(symbol, error = %e, "failed to cancel resting orders before close");
        }
        let filters = self.symbol_filters(symbol).await?;
        let qty = filters.quantity(quantity);
        let body = self
            .market_reduce(symbol, side, &filters.format_quantity(quantity))
            .await
            .context("close order rejected")?;
        info!(symbol, %side, quantity = qty, "position closed");
        Ok(ack_from_response(OrderLeg::Close, side.exit_order_side(), reference_price, qty, &body))
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("ws_base_url", &self.ws_base_url)
            .field("weights", &self.weights)
            .finish()
    }
}
