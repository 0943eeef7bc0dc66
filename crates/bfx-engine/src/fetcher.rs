//! Unified market-data view for one funding currency.
//!
//! Caches the USD-equivalent price, the funding book and the last trade
//! from the realtime plane, and falls back to REST whenever an axis has
//! gone stale. One handler per axis can be registered; it is invoked
//! from whichever path refreshed the value, so it must be thread-safe.

use crate::error::{EngineError, EngineResult};
use bfx_client::BfxPublicClient;
use bfx_core::{Amount, Market, OrderBook, Trade};
use bfx_ws::RtPublicClient;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// REST fallback cadence.
const UPDATE_PERIOD: Duration = Duration::from_secs(10);
/// An axis older than this is refreshed over REST.
const MAX_RT_AGE_SECS: i64 = 5 * 60;

pub type PriceHandler = Arc<dyn Fn(Amount) + Send + Sync>;
pub type BookHandler = Arc<dyn Fn(OrderBook) + Send + Sync>;
pub type TradeHandler = Arc<dyn Fn(Trade) + Send + Sync>;

/// How the configured currency resolves to a USD price.
enum UsdPricing {
    /// The currency is itself a dollar token; price is a fixed unit.
    Fiat,
    /// Price comes from the named trading pair.
    Market(String),
    /// No USD market exists; price requests fail.
    None,
}

struct Inner {
    currency: String,
    pricing: UsdPricing,
    public: Arc<BfxPublicClient>,
    rt: RtPublicClient,
    stop: CancellationToken,
    markets: Vec<Market>,

    market_price: RwLock<Amount>,
    order_book: RwLock<Arc<OrderBook>>,
    last_trade: RwLock<Option<Trade>>,

    // Per-axis timestamps of the last realtime refresh (unix seconds).
    price_rt_update: AtomicI64,
    book_rt_update: AtomicI64,
    trade_rt_update: AtomicI64,

    price_handler: RwLock<Option<PriceHandler>>,
    book_handler: RwLock<Option<BookHandler>>,
    trade_handler: RwLock<Option<TradeHandler>>,
}

/// Data fetcher for one currency. Cheap to clone.
#[derive(Clone)]
pub struct DataFetcher {
    inner: Arc<Inner>,
}

impl DataFetcher {
    /// Resolve the USD market directory and build the fetcher.
    ///
    /// The directory prefers a `<currency>USD` pair and falls back to
    /// `<currency>UST`; dollar tokens price at par.
    pub async fn new(
        public: Arc<BfxPublicClient>,
        rt: RtPublicClient,
        currency: impl Into<String>,
        stop: CancellationToken,
    ) -> EngineResult<Self> {
        let currency = currency.into();
        let markets = public.get_markets().await?;
        let pricing = resolve_usd_pricing(&markets, &currency);

        Ok(Self {
            inner: Arc::new(Inner {
                currency,
                pricing,
                public,
                rt,
                stop,
                markets,
                market_price: RwLock::new(Amount::ZERO),
                order_book: RwLock::new(Arc::new(OrderBook::new())),
                last_trade: RwLock::new(None),
                price_rt_update: AtomicI64::new(0),
                book_rt_update: AtomicI64::new(0),
                trade_rt_update: AtomicI64::new(0),
                price_handler: RwLock::new(None),
                book_handler: RwLock::new(None),
                trade_handler: RwLock::new(None),
            }),
        })
    }

    /// The full market directory loaded at construction.
    pub fn markets(&self) -> &[Market] {
        &self.inner.markets
    }

    pub fn currency(&self) -> &str {
        &self.inner.currency
    }

    pub fn set_usd_price_handler(&self, h: Option<PriceHandler>) {
        *self.inner.price_handler.write() = h;
    }

    pub fn set_order_book_handler(&self, h: Option<BookHandler>) {
        *self.inner.book_handler.write() = h;
    }

    pub fn set_last_trade_handler(&self, h: Option<TradeHandler>) {
        *self.inner.trade_handler.write() = h;
    }

    /// Subscribe the realtime channels and start the fallback updater.
    pub async fn start(&self) -> EngineResult<()> {
        if let UsdPricing::Market(market) = &self.inner.pricing {
            let this = self.clone();
            self.inner
                .rt
                .subscribe_market_price(
                    market,
                    Arc::new(move |price| this.on_rt_price(price)),
                )
                .await?;
        }
        {
            let this = self.clone();
            self.inner
                .rt
                .subscribe_order_book(
                    &self.inner.currency,
                    Arc::new(move |book| this.on_rt_book(book)),
                )
                .await?;
        }
        {
            let this = self.clone();
            self.inner
                .rt
                .subscribe_trades(
                    &self.inner.currency,
                    Arc::new(move |trade| this.on_rt_trade(trade)),
                )
                .await?;
        }

        let this = self.clone();
        tokio::spawn(async move { this.updater().await });
        Ok(())
    }

    /// USD-equivalent price of the configured currency.
    pub fn get_usd_price(&self) -> EngineResult<Amount> {
        match self.inner.pricing {
            UsdPricing::Fiat => Ok(Amount::new(Decimal::ONE)),
            UsdPricing::Market(_) => Ok(*self.inner.market_price.read()),
            UsdPricing::None => Err(EngineError::NoUsdPrice),
        }
    }

    /// Latest funding book snapshot.
    pub fn get_order_book(&self) -> Arc<OrderBook> {
        Arc::clone(&self.inner.order_book.read())
    }

    /// Latest funding trade, if any was seen.
    pub fn get_last_trade(&self) -> Option<Trade> {
        self.inner.last_trade.read().clone()
    }

    fn now_secs() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn on_rt_price(&self, price: Amount) {
        *self.inner.market_price.write() = price;
        self.inner
            .price_rt_update
            .store(Self::now_secs(), Ordering::Release);
        if let Some(h) = self.inner.price_handler.read().clone() {
            h(price);
        }
    }

    fn on_rt_book(&self, book: OrderBook) {
        *self.inner.order_book.write() = Arc::new(book.clone());
        self.inner
            .book_rt_update
            .store(Self::now_secs(), Ordering::Release);
        if let Some(h) = self.inner.book_handler.read().clone() {
            h(book);
        }
    }

    fn on_rt_trade(&self, trade: Trade) {
        *self.inner.last_trade.write() = Some(trade.clone());
        self.inner
            .trade_rt_update
            .store(Self::now_secs(), Ordering::Release);
        if let Some(h) = self.inner.trade_handler.read().clone() {
            h(trade);
        }
    }

    fn stale(&self, axis: &AtomicI64) -> bool {
        Self::now_secs() - axis.load(Ordering::Acquire) >= MAX_RT_AGE_SECS
    }

    /// REST fallback for every stale axis.
    async fn update(&self) -> EngineResult<()> {
        if let UsdPricing::Market(market) = &self.inner.pricing {
            if self.stale(&self.inner.price_rt_update) {
                let price = self.inner.public.get_market_price(market).await?;
                *self.inner.market_price.write() = price;
                debug!(%price, "USD price refreshed over REST");
                if let Some(h) = self.inner.price_handler.read().clone() {
                    h(price);
                }
            }
        }

        if self.stale(&self.inner.book_rt_update) {
            let book = self.inner.public.get_order_book(&self.inner.currency).await?;
            *self.inner.order_book.write() = Arc::new(book.clone());
            debug!(
                bids = book.bid.len(),
                asks = book.ask.len(),
                "funding book refreshed over REST"
            );
            if let Some(h) = self.inner.book_handler.read().clone() {
                h(book);
            }
        }

        if self.stale(&self.inner.trade_rt_update) {
            let trades = self
                .inner
                .public
                .get_trades(&self.inner.currency, None, 1)
                .await?;
            if let Some(trade) = trades.into_iter().next_back() {
                *self.inner.last_trade.write() = Some(trade.clone());
                if let Some(h) = self.inner.trade_handler.read().clone() {
                    h(trade);
                }
            }
        }
        Ok(())
    }

    async fn updater(&self) {
        let mut ticker = tokio::time::interval(UPDATE_PERIOD);
        // First tick fires immediately and fills the caches.
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.update().await {
                        error!(error = %e, "data fetcher update failed");
                    }
                }
                () = self.inner.stop.cancelled() => {
                    info!("data fetcher stopped");
                    return;
                }
            }
        }
    }
}

/// Pick the USD pricing source for a currency: dollar tokens are fiat,
/// otherwise a `<currency>USD` pair wins over `<currency>UST`.
fn resolve_usd_pricing(markets: &[Market], currency: &str) -> UsdPricing {
    if currency == "USD" || currency == "UST" {
        return UsdPricing::Fiat;
    }
    let mut usd_markets: HashMap<&str, &Market> = HashMap::new();
    for m in markets {
        if m.quote == "USD" || m.quote == "UST" {
            let entry = usd_markets.entry(m.base.as_str()).or_insert(m);
            if m.quote == "USD" {
                *entry = m;
            }
        }
    }
    match usd_markets.get(currency) {
        Some(m) => UsdPricing::Market(m.name.clone()),
        None => UsdPricing::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markets() -> Vec<Market> {
        ["BTCUST", "BTCUSD", "ADAUST", "ETHBTC"]
            .iter()
            .map(|s| Market::from_symbol(s).unwrap())
            .collect()
    }

    #[test]
    fn test_dollar_tokens_price_at_par() {
        assert!(matches!(
            resolve_usd_pricing(&markets(), "USD"),
            UsdPricing::Fiat
        ));
        assert!(matches!(
            resolve_usd_pricing(&markets(), "UST"),
            UsdPricing::Fiat
        ));
    }

    #[test]
    fn test_usd_pair_preferred_over_ust() {
        match resolve_usd_pricing(&markets(), "BTC") {
            UsdPricing::Market(name) => assert_eq!(name, "BTCUSD"),
            _ => panic!("expected a market"),
        }
        match resolve_usd_pricing(&markets(), "ADA") {
            UsdPricing::Market(name) => assert_eq!(name, "ADAUST"),
            _ => panic!("expected a market"),
        }
    }

    #[test]
    fn test_no_usd_market() {
        assert!(matches!(
            resolve_usd_pricing(&markets(), "XYZ"),
            UsdPricing::None
        ));
    }
}
