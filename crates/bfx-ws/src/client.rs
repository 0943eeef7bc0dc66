//! Realtime public client.
//!
//! Maintains one duplex connection to the public realtime endpoint and
//! multiplexes logical channels over it: trading-pair tickers (USD
//! price), funding trades, and the sequence-numbered funding book.
//! Handles reconnection with resubscription of every known channel.

use crate::book::{BookFeed, BookHandler, BookMaintainer};
use crate::error::{WsError, WsResult};
use crate::message::{decode_channel, parse_frame, ChannelKind, ChannelMessage, Event, Frame};
use bfx_core::{Amount, Trade};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback receiving ticker last-price updates.
pub type PriceHandler = Arc<dyn Fn(Amount) + Send + Sync>;
/// Callback receiving public funding trades.
pub type TradeHandler = Arc<dyn Fn(Trade) + Send + Sync>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wait before redialing after a dropped connection.
const SOFT_RECONNECT_WAIT: Duration = Duration::from_secs(10);
/// Wait after a dial that failed outright.
const HARD_RECONNECT_WAIT: Duration = Duration::from_secs(60);
/// Bound on dial plus protocol handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// Dial attempts before initial startup gives up.
const DIAL_TRIALS: u32 = 5;
/// Conf flag asking the server to stamp frames with sequence numbers.
const FLAG_SEQ_ALL: u64 = 65536;

#[derive(Default)]
struct ChannelEntry {
    /// Set once the subscribe reply binds the server channel id.
    binding: Option<(ChannelKind, String)>,
    /// Data frames that beat the subscribe reply.
    first_msgs: Vec<Vec<Value>>,
}

struct Inner {
    url: String,
    stop: CancellationToken,
    /// Serializes subscribe/unsubscribe; one command awaits a reply at a time.
    call_lock: TokioMutex<()>,
    pending_cmd: Mutex<Option<oneshot::Sender<WsResult<Event>>>>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: TokioMutex<mpsc::Receiver<String>>,
    /// Server channel id -> logical channel.
    channels: DashMap<u64, ChannelEntry>,
    price_handlers: DashMap<String, PriceHandler>,
    trade_handlers: DashMap<String, TradeHandler>,
    books: DashMap<String, Arc<Mutex<BookMaintainer>>>,
    chan_ids: Mutex<HashMap<(ChannelKind, String), u64>>,
}

/// Handle to the realtime plane. Cheap to clone.
#[derive(Clone)]
pub struct RtPublicClient {
    inner: Arc<Inner>,
}

impl RtPublicClient {
    pub fn new(url: impl Into<String>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                stop: CancellationToken::new(),
                call_lock: TokioMutex::new(()),
                pending_cmd: Mutex::new(None),
                outbound_tx,
                outbound_rx: TokioMutex::new(outbound_rx),
                channels: DashMap::new(),
                price_handlers: DashMap::new(),
                trade_handlers: DashMap::new(),
                books: DashMap::new(),
                chan_ids: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Stop the client; wakes any command awaiter and ends `run`.
    pub fn stop(&self) {
        self.inner.stop.cancel();
        self.fail_pending(WsError::Stopped);
    }

    /// Drive the connection until stopped.
    ///
    /// The initial dial tries a bounded number of times and surfaces a
    /// fatal error; once connected, drops are retried forever with
    /// bounded backoff and full resubscription.
    pub async fn run(&self) -> WsResult<()> {
        let mut initial = true;
        loop {
            if self.inner.stop.is_cancelled() {
                return Ok(());
            }
            let stream = if initial {
                match self.dial_initial().await {
                    Ok(s) => s,
                    Err(e) => {
                        // A queued command would otherwise wait forever.
                        self.fail_pending(WsError::Disconnected);
                        return Err(e);
                    }
                }
            } else {
                match self.redial().await {
                    Ok(s) => s,
                    Err(WsError::Stopped) => return Ok(()),
                    Err(e) => {
                        self.fail_pending(WsError::Disconnected);
                        return Err(e);
                    }
                }
            };
            initial = false;

            match self.session(stream).await {
                Ok(()) => return Ok(()), // clean stop
                Err(e) => {
                    error!(error = %e, "realtime connection lost");
                    self.fail_pending(WsError::Disconnected);
                }
            }

            if !self.sleep_cancellable(SOFT_RECONNECT_WAIT).await {
                return Ok(());
            }
        }
    }

    async fn dial(&self) -> WsResult<WsStream> {
        let fut = connect_async(&self.inner.url);
        let (stream, _resp) = tokio::time::timeout(HANDSHAKE_TIMEOUT, fut)
            .await
            .map_err(|_| WsError::ConnectionFailed("websocket handshake timed out".into()))??;
        Ok(stream)
    }

    async fn dial_initial(&self) -> WsResult<WsStream> {
        let mut last = None;
        for attempt in 1..=DIAL_TRIALS {
            match self.dial().await {
                Ok(s) => return Ok(s),
                Err(e) => {
                    warn!(attempt, error = %e, "realtime dial failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| WsError::ConnectionFailed("no dial attempt made".into())))
    }

    /// Redial forever with bounded backoff until success or stop.
    async fn redial(&self) -> WsResult<WsStream> {
        loop {
            match self.dial().await {
                Ok(s) => return Ok(s),
                Err(e) => {
                    warn!(error = %e, "redial failed, backing off");
                    if !self.sleep_cancellable(HARD_RECONNECT_WAIT).await {
                        return Err(WsError::Stopped);
                    }
                }
            }
        }
    }

    async fn sleep_cancellable(&self, d: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(d) => true,
            () = self.inner.stop.cancelled() => false,
        }
    }

    /// Opening exchange: the server greets with an info event, then the
    /// conf message enables sequence numbers and must come back OK.
    async fn handshake(&self, stream: &mut WsStream) -> WsResult<()> {
        let info = self.read_event(stream).await?;
        match info {
            Event::Info { version } => debug!(version, "realtime endpoint greeted"),
            other => {
                return Err(WsError::Handshake(format!(
                    "expected info event, got {other:?}"
                )))
            }
        }
        stream
            .send(Message::Text(format!(
                r#"{{"event":"conf","flags":{FLAG_SEQ_ALL}}}"#
            )))
            .await?;
        loop {
            match self.read_event(stream).await? {
                Event::Conf { status } if status == "OK" => return Ok(()),
                Event::Conf { status } => {
                    return Err(WsError::Handshake(format!("conf rejected: {status}")))
                }
                other => debug!(?other, "event before conf reply"),
            }
        }
    }

    /// Read frames until the next lifecycle event, skipping data noise.
    async fn read_event(&self, stream: &mut WsStream) -> WsResult<Event> {
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let msg = tokio::time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| WsError::Handshake("timed out waiting for event".into()))?;
            match msg {
                Some(Ok(Message::Text(text))) => match parse_frame(&text)? {
                    Frame::Event(ev) => return Ok(ev),
                    _ => continue,
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(WsError::ConnectionClosed("stream ended".into())),
            }
        }
    }

    async fn session(&self, mut stream: WsStream) -> WsResult<()> {
        self.handshake(&mut stream).await?;
        info!(url = %self.inner.url, "realtime connected");

        // Per-connection derived state is void; rebuild it.
        self.inner.channels.clear();
        self.inner.chan_ids.lock().clear();
        for book in self.inner.books.iter() {
            book.value().lock().clear();
        }
        self.spawn_resubscribe();

        let (mut write, mut read) = stream.split();
        let mut outbound = self.inner.outbound_rx.lock().await;

        loop {
            tokio::select! {
                () = self.inner.stop.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    self.fail_pending(WsError::Stopped);
                    return Ok(());
                }

                cmd = outbound.recv() => {
                    if let Some(text) = cmd {
                        write.send(Message::Text(text)).await?;
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text)?,
                        Some(Ok(Message::Ping(p))) => write.send(Message::Pong(p)).await?,
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "closed by server".into());
                            return Err(WsError::ConnectionClosed(reason));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(WsError::ConnectionClosed("stream ended".into())),
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) -> WsResult<()> {
        match parse_frame(text)? {
            Frame::Heartbeat => Ok(()),
            Frame::Event(ev) => {
                self.handle_event(ev);
                Ok(())
            }
            Frame::Channel { chan_id, body } => self.dispatch_channel(chan_id, body),
        }
    }

    fn handle_event(&self, ev: Event) {
        match ev {
            Event::Subscribed { .. } | Event::Unsubscribed { .. } | Event::Conf { .. } => {
                self.complete_pending(Ok(ev));
            }
            Event::Error { msg, code } => {
                self.complete_pending(Err(WsError::Command(format!("{msg} (code {code})"))));
            }
            Event::Info { version } => debug!(version, "info event"),
            Event::Other(name) => debug!(event = %name, "ignoring event"),
        }
    }

    fn complete_pending(&self, reply: WsResult<Event>) {
        if let Some(tx) = self.inner.pending_cmd.lock().take() {
            let _ = tx.send(reply);
        } else if let Err(e) = reply {
            warn!(error = %e, "exchange error with no command in flight");
        }
    }

    fn fail_pending(&self, err: WsError) {
        if let Some(tx) = self.inner.pending_cmd.lock().take() {
            let _ = tx.send(Err(err));
        }
    }

    fn dispatch_channel(&self, chan_id: u64, body: Vec<Value>) -> WsResult<()> {
        let binding = {
            let mut entry = self.inner.channels.entry(chan_id).or_default();
            match &entry.binding {
                Some(b) => Some(b.clone()),
                None => {
                    // Subscription reply not processed yet; queue for replay.
                    entry.first_msgs.push(body.clone());
                    None
                }
            }
        };
        if let Some((kind, key)) = binding {
            self.handle_channel(kind, &key, body)?;
        }
        Ok(())
    }

    fn handle_channel(&self, kind: ChannelKind, key: &str, body: Vec<Value>) -> WsResult<()> {
        match decode_channel(kind, &body)? {
            ChannelMessage::Heartbeat | ChannelMessage::TradeSnapshot => {}
            ChannelMessage::MarketPrice(price) => {
                if let Some(h) = self.inner.price_handlers.get(key) {
                    let h = Arc::clone(h.value());
                    tokio::spawn(async move { h(price) });
                }
            }
            ChannelMessage::Trade(trade) => {
                if let Some(h) = self.inner.trade_handlers.get(key) {
                    let h = Arc::clone(h.value());
                    tokio::spawn(async move { h(trade) });
                }
            }
            ChannelMessage::BookSnapshot { seq, book } => {
                if let Some(m) = self.inner.books.get(key) {
                    m.value().lock().push_snapshot(seq, book);
                }
            }
            ChannelMessage::BookDiff { seq, diff } => {
                let feed = self
                    .inner
                    .books
                    .get(key)
                    .map(|m| m.value().lock().push_diff(seq, diff));
                if feed == Some(BookFeed::NeedsResync) {
                    let this = self.clone();
                    let key = key.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = this.resubscribe_order_book(&key).await {
                            error!(key = %key, error = %e, "book resubscription failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Bind a server channel id and optionally replay queued first frames.
    fn bind_channel(&self, chan_id: u64, kind: ChannelKind, key: &str, replay_firsts: bool) {
        let firsts = {
            let mut entry = self.inner.channels.entry(chan_id).or_default();
            entry.binding = Some((kind, key.to_string()));
            std::mem::take(&mut entry.first_msgs)
        };
        if replay_firsts && !firsts.is_empty() {
            let this = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                for body in firsts {
                    if let Err(e) = this.handle_channel(kind, &key, body) {
                        warn!(key = %key, error = %e, "queued first frame dropped");
                    }
                }
            });
        }
    }

    /// Send one command and await the server's echo.
    async fn command(&self, cmd: String) -> WsResult<Event> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending_cmd.lock();
            if pending.is_some() {
                return Err(WsError::Command("command already in flight".into()));
            }
            *pending = Some(tx);
        }
        if self.inner.outbound_tx.send(cmd).await.is_err() {
            self.inner.pending_cmd.lock().take();
            return Err(WsError::Stopped);
        }
        tokio::select! {
            () = self.inner.stop.cancelled() => {
                self.inner.pending_cmd.lock().take();
                Err(WsError::Stopped)
            }
            reply = rx => reply.map_err(|_| WsError::Disconnected)?,
        }
    }

    async fn subscribe_command(&self, cmd: String) -> WsResult<u64> {
        match self.command(cmd).await? {
            Event::Subscribed { chan_id } => Ok(chan_id),
            other => Err(WsError::Protocol(format!(
                "expected subscribed reply, got {other:?}"
            ))),
        }
    }

    fn unsubscribe_cmd(chan_id: u64) -> String {
        format!(r#"{{"event":"unsubscribe","chanId":{chan_id}}}"#)
    }

    /// Subscribe to a trading-pair ticker for its last price.
    pub async fn subscribe_market_price(&self, market: &str, handler: PriceHandler) -> WsResult<()> {
        let _guard = self.inner.call_lock.lock().await;
        self.subscribe_market_price_int(market, Some(handler)).await
    }

    async fn subscribe_market_price_int(
        &self,
        market: &str,
        handler: Option<PriceHandler>,
    ) -> WsResult<()> {
        let cmd = format!(r#"{{"event":"subscribe","channel":"ticker","symbol":"t{market}"}}"#);
        let chan_id = self.subscribe_command(cmd).await?;
        if let Some(h) = handler {
            self.inner.price_handlers.insert(market.to_string(), h);
        }
        self.inner
            .chan_ids
            .lock()
            .insert((ChannelKind::Ticker, market.to_string()), chan_id);
        self.bind_channel(chan_id, ChannelKind::Ticker, market, false);
        Ok(())
    }

    pub async fn unsubscribe_market_price(&self, market: &str) -> WsResult<()> {
        let _guard = self.inner.call_lock.lock().await;
        self.unsubscribe_int(ChannelKind::Ticker, market).await?;
        self.inner.price_handlers.remove(market);
        Ok(())
    }

    /// Subscribe to public funding trades for a currency.
    pub async fn subscribe_trades(&self, currency: &str, handler: TradeHandler) -> WsResult<()> {
        let _guard = self.inner.call_lock.lock().await;
        self.subscribe_trades_int(currency, Some(handler)).await
    }

    async fn subscribe_trades_int(
        &self,
        currency: &str,
        handler: Option<TradeHandler>,
    ) -> WsResult<()> {
        let cmd = format!(r#"{{"event":"subscribe","channel":"trades","symbol":"f{currency}"}}"#);
        let chan_id = self.subscribe_command(cmd).await?;
        if let Some(h) = handler {
            self.inner.trade_handlers.insert(currency.to_string(), h);
        }
        self.inner
            .chan_ids
            .lock()
            .insert((ChannelKind::Trades, currency.to_string()), chan_id);
        self.bind_channel(chan_id, ChannelKind::Trades, currency, false);
        Ok(())
    }

    pub async fn unsubscribe_trades(&self, currency: &str) -> WsResult<()> {
        let _guard = self.inner.call_lock.lock().await;
        self.unsubscribe_int(ChannelKind::Trades, currency).await?;
        self.inner.trade_handlers.remove(currency);
        Ok(())
    }

    /// Subscribe to the funding book for a currency. Snapshots are
    /// replicated through diffs and published to `handler`.
    pub async fn subscribe_order_book(&self, currency: &str, handler: BookHandler) -> WsResult<()> {
        let _guard = self.inner.call_lock.lock().await;
        self.subscribe_order_book_int(currency, Some(handler)).await
    }

    async fn subscribe_order_book_int(
        &self,
        currency: &str,
        handler: Option<BookHandler>,
    ) -> WsResult<()> {
        match handler {
            Some(h) => {
                self.inner.books.insert(
                    currency.to_string(),
                    Arc::new(Mutex::new(BookMaintainer::new(currency, h))),
                );
            }
            None => {
                // Resubscription keeps the handler; derived state restarts.
                if let Some(m) = self.inner.books.get(currency) {
                    m.value().lock().clear();
                }
            }
        }
        let cmd = format!(
            r#"{{"event":"subscribe","channel":"book","symbol":"f{currency}","prec":"P0","freq":"F0","len":"25"}}"#
        );
        let chan_id = self.subscribe_command(cmd).await?;
        self.inner
            .chan_ids
            .lock()
            .insert((ChannelKind::Book, currency.to_string()), chan_id);
        self.bind_channel(chan_id, ChannelKind::Book, currency, true);
        Ok(())
    }

    pub async fn unsubscribe_order_book(&self, currency: &str) -> WsResult<()> {
        let _guard = self.inner.call_lock.lock().await;
        self.unsubscribe_int(ChannelKind::Book, currency).await?;
        self.inner.books.remove(currency);
        Ok(())
    }

    async fn unsubscribe_int(&self, kind: ChannelKind, key: &str) -> WsResult<()> {
        let chan_id = self
            .inner
            .chan_ids
            .lock()
            .remove(&(kind, key.to_string()))
            .ok_or_else(|| WsError::Command(format!("not subscribed: {key}")))?;
        self.command(Self::unsubscribe_cmd(chan_id)).await?;
        self.inner.channels.remove(&chan_id);
        Ok(())
    }

    /// Rebuild a broken book subscription to obtain a fresh snapshot.
    async fn resubscribe_order_book(&self, currency: &str) -> WsResult<()> {
        let _guard = self.inner.call_lock.lock().await;
        warn!(key = %currency, "resubscribing funding book after sequence loss");
        let old = self
            .inner
            .chan_ids
            .lock()
            .remove(&(ChannelKind::Book, currency.to_string()));
        if let Some(chan_id) = old {
            if let Err(e) = self.command(Self::unsubscribe_cmd(chan_id)).await {
                warn!(error = %e, "unsubscribe of broken book failed");
            }
            self.inner.channels.remove(&chan_id);
        }
        self.subscribe_order_book_int(currency, None).await
    }

    /// After a reconnect, restore every known subscription.
    fn spawn_resubscribe(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = this.inner.call_lock.lock().await;
            let prices: Vec<String> = this
                .inner
                .price_handlers
                .iter()
                .map(|e| e.key().clone())
                .collect();
            for market in prices {
                if let Err(e) = this.subscribe_market_price_int(&market, None).await {
                    error!(market = %market, error = %e, "ticker resubscription failed");
                }
            }
            let trades: Vec<String> = this
                .inner
                .trade_handlers
                .iter()
                .map(|e| e.key().clone())
                .collect();
            for currency in trades {
                if let Err(e) = this.subscribe_trades_int(&currency, None).await {
                    error!(currency = %currency, error = %e, "trades resubscription failed");
                }
            }
            let books: Vec<String> = this.inner.books.iter().map(|e| e.key().clone()).collect();
            for currency in books {
                if let Err(e) = this.subscribe_order_book_int(&currency, None).await {
                    error!(currency = %currency, error = %e, "book resubscription failed");
                }
            }
        });
    }
}
