use anyhow::{Context, Result};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use super::candle::Candle;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One kline update from the live stream. The same bar is reported many
/// times while it forms; `is_closed` is set on its final update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveCandle {
    pub symbol: String,
    pub interval: String,
    pub is_closed: bool,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl LiveCandle {
    pub fn from_candle(candle: &Candle, is_closed: bool) -> Self {
        Self {
            symbol: candle.symbol.clone(),
            interval: candle.interval.clone(),
            is_closed,
            open_time: candle.open_time,
            close_time: candle.close_time,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }

    pub fn to_candle(&self) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            interval: self.interval.clone(),
            open_time: self.open_time,
            close_time: self.close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// A live kline subscription. Dropping the stream closes the subscription.
pub type LiveCandleStream = BoxStream<'static, Result<LiveCandle>>;

// ---------------------------------------------------------------------------
// Kline WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the kline WebSocket for a single (symbol, interval) pair.
///
/// Non-text frames are skipped (tungstenite answers pings itself) and
/// unparseable payloads are logged and dropped. Transport errors are
/// surfaced as `Err` items so the consumer can decide to reconnect.
pub async fn connect_kline_stream(
    ws_base_url: &str,
    symbol: &str,
    interval: &str,
) -> Result<LiveCandleStream> {
    let url = build_kline_url(ws_base_url, symbol, interval);
    info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .with_context(|| format!("failed to connect to kline WebSocket {url}"))?;

    info!(symbol = %symbol, interval = %interval, "kline WebSocket connected");

    let stream = ws_stream.filter_map(|msg| {
        let item = match msg {
            Ok(Message::Text(text)) => match parse_kline_message(&text) {
                Ok(candle) => Some(Ok(candle)),
                Err(e) => {
                    warn!(error = %e, "failed to parse kline message");
                    None
                }
            },
            Ok(_) => None,
            Err(e) => Some(Err(anyhow::Error::new(e).context("kline WebSocket read error"))),
        };
        futures_util::future::ready(item)
    });

    Ok(stream.boxed())
}

fn build_kline_url(ws_base_url: &str, symbol: &str, interval: &str) -> String {
    format!(
        "{}/ws/{}@kline_{}",
        ws_base_url.trim_end_matches('/'),
        symbol.to_lowercase(),
        interval
    )
}

/// Parse a kline message. Accepts both the combined-stream envelope
/// (`{"stream": .., "data": {..}}`) and the direct single-stream payload.
///
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": .., "T": .., "i": "1m", "o": "..", "x": false } }
/// ```
pub fn parse_kline_message(text: &str) -> Result<LiveCandle> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];

    let interval = k["i"].as_str().context("missing field k.i")?.to_string();
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;

    let open = parse_string_f64(&k["o"], "k.o")?;
    let high = parse_string_f64(&k["h"], "k.h")?;
    let low = parse_string_f64(&k["l"], "k.l")?;
    let close = parse_string_f64(&k["c"], "k.c")?;
    let volume = parse_string_f64(&k["v"], "k.v")?;

    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok(LiveCandle {
        symbol,
        interval,
        is_closed,
        open_time,
        close_time,
        open,
        high,
        low,
        close,
        volume,
    })
}

/// Binance sends numeric values as JSON strings inside kline objects.
pub(crate) fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"{
        "e": "kline",
        "s": "btcusdt",
        "k": {
            "t": 1700000000000,
            "T": 1700000059999,
            "i": "1m",
            "o": "37000.00",
            "h": "37050.00",
            "l": "36990.00",
            "c": "37020.00",
            "v": "123.456",
            "x": true
        }
    }"#;

    #[test]
    fn parse_single_stream_payload() {
        let candle = parse_kline_message(SINGLE).expect("should parse");
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.interval, "1m");
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert!(candle.is_closed);

        let bar = candle.to_candle();
        assert_eq!(bar.close_time, 1_700_000_059_999);
        assert!((bar.volume - 123.456).abs() < 1e-9);
    }

    #[test]
    fn parse_combined_stream_envelope() {
        let json = format!(r#"{{ "stream": "btcusdt@kline_1m", "data": {SINGLE} }}"#);
        let candle = parse_kline_message(&json).expect("should parse");
        assert_eq!(candle.symbol, "BTCUSDT");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let json = r#"{ "e": "kline", "s": "BTCUSDT", "k": { "t": 1 } }"#;
        assert!(parse_kline_message(json).is_err());
    }

    #[test]
    fn parse_numeric_fields_as_numbers() {
        let v = serde_json::json!(12.5);
        assert_eq!(parse_string_f64(&v, "x").unwrap(), 12.5);
        let v = serde_json::json!(true);
        assert!(parse_string_f64(&v, "x").is_err());
    }

    #[test]
    fn kline_url_format() {
        let url = build_kline_url("wss://fstream.binance.com/", "BTCUSDT", "15m");
        assert_eq!(url, "wss://fstream.binance.com/ws/btcusdt@kline_15m");
    }
}
