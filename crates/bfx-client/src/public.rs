//! Public REST client: markets, ticker, trades, funding book, candles.

use crate::error::{ClientError, ClientResult};
use crate::http::{build_client, check_json, send_with_retry};
use bfx_core::{wire, Amount, Candle, Market, OrderBook, Side, Trade};
use chrono::{DateTime, Utc};
use serde_json::Value;

const PUBLIC_API_URL: &str = "https://api-pub.bitfinex.com";

/// One-shot REST book depth.
const REST_BOOK_DEPTH: u32 = 25;
/// Depth of the deep one-shot book variant.
const REST_MAX_BOOK_DEPTH: u32 = 100;

pub struct BfxPublicClient {
    http: reqwest::Client,
    base: String,
}

impl BfxPublicClient {
    pub fn new() -> ClientResult<Self> {
        Self::with_base(PUBLIC_API_URL)
    }

    pub fn with_base(base: impl Into<String>) -> ClientResult<Self> {
        Ok(Self {
            http: build_client()?,
            base: base.into(),
        })
    }

    async fn get_json(&self, path: &str, what: &str) -> ClientResult<Value> {
        let url = format!("{}/{}", self.base, path);
        let resp = send_with_retry(|| self.http.get(&url)).await?;
        check_json(resp, what).await
    }

    /// The exchange's trading-pair directory.
    pub async fn get_markets(&self) -> ClientResult<Vec<Market>> {
        let v = self
            .get_json("v2/conf/pub:list:pair:exchange", "get markets")
            .await?;
        let outer = wire::array_at_least(&v, 1).map_err(ClientError::Core)?;
        let pairs = wire::as_array(&outer[0]).map_err(ClientError::Core)?;
        pairs
            .iter()
            .map(|p| {
                let name = wire::get_str(p)?;
                Market::from_symbol(&name)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(ClientError::Core)
    }

    /// Last traded price of a trading pair.
    pub async fn get_market_price(&self, market: &str) -> ClientResult<Amount> {
        let v = self
            .get_json(&format!("v2/ticker/t{market}"), "get ticker")
            .await?;
        let arr = wire::array_at_least(&v, 7).map_err(ClientError::Core)?;
        Ok(wire::get_amount(&arr[6])?)
    }

    /// Funding trade history, oldest first.
    pub async fn get_trades(
        &self,
        currency: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> ClientResult<Vec<Trade>> {
        let mut path = format!("v2/trades/f{currency}/hist?limit={limit}");
        if let Some(t) = since {
            path.push_str(&format!("&start={}", t.timestamp_millis()));
        }
        let v = self.get_json(&path, "get trades").await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        // The wire is newest-first.
        let mut trades = arr
            .iter()
            .map(wire::trade)
            .collect::<Result<Vec<_>, _>>()?;
        trades.reverse();
        Ok(trades)
    }

    async fn fetch_book(&self, currency: &str, depth: u32) -> ClientResult<OrderBook> {
        let v = self
            .get_json(
                &format!("v2/book/f{currency}/P0?len={depth}"),
                "get orderbook",
            )
            .await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        let mut book = OrderBook::new();
        for level in arr {
            let (entry, side, _count) = wire::book_level(level)?;
            match side {
                Side::Bid => book.bid.push(entry),
                Side::Offer => book.ask.push(entry),
            }
        }
        book.sort_sides();
        Ok(book)
    }

    /// One-shot funding book at the realtime depth.
    pub async fn get_order_book(&self, currency: &str) -> ClientResult<OrderBook> {
        self.fetch_book(currency, REST_BOOK_DEPTH).await
    }

    /// Deep one-shot funding book.
    pub async fn get_max_order_book(&self, currency: &str) -> ClientResult<OrderBook> {
        self.fetch_book(currency, REST_MAX_BOOK_DEPTH).await
    }

    /// Funding rate candles, oldest first.
    pub async fn get_candles(
        &self,
        currency: &str,
        period_secs: u32,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> ClientResult<Vec<Candle>> {
        let period = candle_period_str(period_secs)?;
        let since = since.unwrap_or_else(|| {
            Utc::now() - chrono::Duration::seconds(i64::from(limit) * i64::from(period_secs))
        });
        let path = format!(
            "v2/candles/trade:{period}:f{currency}:a30:p2:p30/hist?sort=1&start={}&limit={limit}",
            since.timestamp_millis()
        );
        let v = self.get_json(&path, "get candles").await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        arr.iter().map(candle_from_wire).collect()
    }
}

fn candle_period_str(period_secs: u32) -> ClientResult<&'static str> {
    Ok(match period_secs {
        60 => "1m",
        300 => "5m",
        900 => "15m",
        1800 => "30m",
        3600 => "1h",
        10800 => "3h",
        21600 => "6h",
        43200 => "12h",
        86400 => "1D",
        604800 => "7D",
        1209600 => "14D",
        2592000 => "1M",
        other => {
            return Err(ClientError::Protocol(format!(
                "unsupported candle period: {other}s"
            )))
        }
    })
}

/// Wire candle `[mts, open, close, high, low, volume]`.
fn candle_from_wire(v: &Value) -> ClientResult<Candle> {
    let arr = wire::array_at_least(v, 6).map_err(ClientError::Core)?;
    Ok(Candle {
        timestamp: wire::get_time_ms(&arr[0])?,
        open: wire::get_rate(&arr[1])?,
        close: wire::get_rate(&arr[2])?,
        high: wire::get_rate(&arr[3])?,
        low: wire::get_rate(&arr[4])?,
        volume: wire::get_amount(&arr[5])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candle_period_strings() {
        assert_eq!(candle_period_str(60).unwrap(), "1m");
        assert_eq!(candle_period_str(86400).unwrap(), "1D");
        assert!(candle_period_str(61).is_err());
    }

    #[test]
    fn test_candle_from_wire() {
        let v = json!([1631633820000i64, 0.00041, 0.00043, 0.00044, 0.0004, 125000.5]);
        let c = candle_from_wire(&v).unwrap();
        assert_eq!(c.open.units(), 410_000_000);
        assert_eq!(c.close.units(), 430_000_000);
        assert_eq!(c.high.units(), 440_000_000);
        assert_eq!(c.low.units(), 400_000_000);
        assert_eq!(c.volume.units(), 12_500_050_000_000);
    }
}
