//! Frame parsing for the public realtime endpoint (protocol v2).
//!
//! Two frame shapes exist: JSON objects are lifecycle events (info,
//! conf, subscribed, error), JSON arrays are channel data prefixed by
//! the server-assigned channel id. With sequence numbering enabled the
//! server appends a per-channel sequence number to every data frame.

use crate::book::BookDiff;
use crate::error::{WsError, WsResult};
use bfx_core::{wire, Amount, OrderBook, Side, Trade};
use serde_json::Value;

/// Logical channel types multiplexed over the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Trading-pair ticker used for the USD price.
    Ticker,
    /// Funding trades for a currency.
    Trades,
    /// Funding order book (price-aggregated, sequence-numbered diffs).
    Book,
}

/// Lifecycle event frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Info { version: u64 },
    Conf { status: String },
    Subscribed { chan_id: u64 },
    Unsubscribed { chan_id: u64 },
    Error { msg: String, code: i64 },
    /// Events the agent has no use for (e.g. pong).
    Other(String),
}

/// A parsed frame.
#[derive(Debug)]
pub enum Frame {
    Event(Event),
    Channel { chan_id: u64, body: Vec<Value> },
    /// Keep-alive noise, dropped before dispatch.
    Heartbeat,
}

/// Decoded payload of one channel frame.
#[derive(Debug)]
pub enum ChannelMessage {
    Heartbeat,
    /// Last price from a trading-pair ticker.
    MarketPrice(Amount),
    Trade(Trade),
    /// Trade history snapshots carry no live information.
    TradeSnapshot,
    BookSnapshot { seq: u64, book: OrderBook },
    BookDiff { seq: u64, diff: BookDiff },
}

/// Parse one raw text frame.
pub fn parse_frame(text: &str) -> WsResult<Frame> {
    // Keep-alive frames are a bare empty object.
    if text == "{}" {
        return Ok(Frame::Heartbeat);
    }
    let v: Value = serde_json::from_str(text)?;
    match v {
        Value::Array(body) => {
            let arr = &body;
            if arr.len() < 2 {
                return Err(WsError::Protocol("channel frame too short".into()));
            }
            let chan_id = wire::get_u64(&arr[0])?;
            Ok(Frame::Channel {
                chan_id,
                body: body[1..].to_vec(),
            })
        }
        Value::Object(ref obj) => {
            let event = obj
                .get("event")
                .and_then(Value::as_str)
                .ok_or_else(|| WsError::Protocol("object frame without event".into()))?;
            let ev = match event {
                "info" => Event::Info {
                    version: obj.get("version").and_then(Value::as_u64).unwrap_or(0),
                },
                "conf" => Event::Conf {
                    status: obj
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
                "subscribed" => Event::Subscribed {
                    chan_id: obj
                        .get("chanId")
                        .and_then(Value::as_u64)
                        .ok_or_else(|| WsError::Protocol("subscribed without chanId".into()))?,
                },
                "unsubscribed" => Event::Unsubscribed {
                    chan_id: obj.get("chanId").and_then(Value::as_u64).unwrap_or(0),
                },
                "error" => Event::Error {
                    msg: obj
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    code: obj.get("code").and_then(Value::as_i64).unwrap_or(0),
                },
                other => Event::Other(other.to_string()),
            };
            Ok(Frame::Event(ev))
        }
        _ => Err(WsError::Protocol("frame is neither array nor object".into())),
    }
}

/// Decode a channel frame body according to its channel type.
///
/// `body` is the frame with the channel id stripped.
pub fn decode_channel(kind: ChannelKind, body: &[Value]) -> WsResult<ChannelMessage> {
    if body.first().and_then(Value::as_str) == Some("hb") {
        return Ok(ChannelMessage::Heartbeat);
    }
    match kind {
        ChannelKind::Ticker => decode_ticker(body),
        ChannelKind::Trades => decode_trades(body),
        ChannelKind::Book => decode_book(body),
    }
}

fn seq_of(body: &[Value], idx: usize) -> WsResult<u64> {
    let v = body
        .get(idx)
        .ok_or_else(|| WsError::Protocol("missing sequence number".into()))?;
    Ok(wire::get_u64(v)?)
}

fn decode_ticker(body: &[Value]) -> WsResult<ChannelMessage> {
    let fields = wire::array_at_least(
        body.first()
            .ok_or_else(|| WsError::Protocol("empty ticker frame".into()))?,
        7,
    )?;
    // Field 7 of the trading ticker is the last price.
    let price = wire::get_amount(&fields[6])?;
    Ok(ChannelMessage::MarketPrice(price))
}

fn decode_trades(body: &[Value]) -> WsResult<ChannelMessage> {
    match body.first() {
        // "te" executed / "tu" updated, trade payload follows.
        Some(Value::String(_)) => {
            let payload = body
                .get(1)
                .ok_or_else(|| WsError::Protocol("trade event without payload".into()))?;
            Ok(ChannelMessage::Trade(wire::trade(payload)?))
        }
        Some(Value::Array(_)) => Ok(ChannelMessage::TradeSnapshot),
        _ => Err(WsError::Protocol("malformed trades frame".into())),
    }
}

fn decode_book(body: &[Value]) -> WsResult<ChannelMessage> {
    let payload = body
        .first()
        .ok_or_else(|| WsError::Protocol("empty book frame".into()))?;
    let arr = wire::as_array(payload).map_err(WsError::Core)?;
    if arr.first().map_or(false, Value::is_array) {
        // Initial snapshot: a list of levels.
        let seq = seq_of(body, 1)?;
        let mut book = OrderBook::new();
        for level in arr {
            let (entry, side, _count) = wire::book_level(level)?;
            match side {
                Side::Bid => book.bid.push(entry),
                Side::Offer => book.ask.push(entry),
            }
        }
        book.sort_sides();
        Ok(ChannelMessage::BookSnapshot { seq, book })
    } else {
        // Single price-level diff.
        let seq = seq_of(body, 1)?;
        let (mut entry, side, count) = wire::book_level(payload)?;
        if count == 0 {
            // A zero count removes the level.
            entry.amount = Amount::ZERO;
        }
        Ok(ChannelMessage::BookDiff {
            seq,
            diff: BookDiff { side, entry },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_event_frames() {
        match parse_frame(r#"{"event":"info","version":2}"#).unwrap() {
            Frame::Event(Event::Info { version }) => assert_eq!(version, 2),
            other => panic!("unexpected frame: {other:?}"),
        }
        match parse_frame(r#"{"event":"conf","status":"OK","flags":65536}"#).unwrap() {
            Frame::Event(Event::Conf { status }) => assert_eq!(status, "OK"),
            other => panic!("unexpected frame: {other:?}"),
        }
        match parse_frame(r#"{"event":"subscribed","channel":"book","chanId":266343,"symbol":"fUST"}"#)
            .unwrap()
        {
            Frame::Event(Event::Subscribed { chan_id }) => assert_eq!(chan_id, 266343),
            other => panic!("unexpected frame: {other:?}"),
        }
        match parse_frame(r#"{"event":"error","msg":"symbol: invalid","code":10300}"#).unwrap() {
            Frame::Event(Event::Error { msg, code }) => {
                assert_eq!(msg, "symbol: invalid");
                assert_eq!(code, 10300);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_empty_object_is_heartbeat() {
        assert!(matches!(parse_frame("{}").unwrap(), Frame::Heartbeat));
    }

    #[test]
    fn test_channel_hb_payload() {
        let Frame::Channel { chan_id, body } = parse_frame(r#"[266343,"hb",42]"#).unwrap() else {
            panic!("expected channel frame");
        };
        assert_eq!(chan_id, 266343);
        assert!(matches!(
            decode_channel(ChannelKind::Book, &body).unwrap(),
            ChannelMessage::Heartbeat
        ));
    }

    #[test]
    fn test_decode_ticker_last_price() {
        let body = vec![
            json!([60210.0, 12.1, 60211.0, 9.7, -120.0, -0.002, 60215.5, 1000.0, 60900.0, 59800.0]),
            json!(17),
        ];
        let ChannelMessage::MarketPrice(price) = decode_channel(ChannelKind::Ticker, &body).unwrap()
        else {
            panic!("expected market price");
        };
        assert_eq!(price.units(), 6_021_550_000_000);
    }

    #[test]
    fn test_decode_trade_event() {
        let body = vec![
            json!("te"),
            json!([133323543, 1631633831000i64, -51.25, 0.00041052, 30]),
            json!(5),
        ];
        let ChannelMessage::Trade(trade) = decode_channel(ChannelKind::Trades, &body).unwrap()
        else {
            panic!("expected trade");
        };
        assert_eq!(trade.id, 133323543);
        assert_eq!(trade.side, Side::Bid);
        assert_eq!(trade.amount.units(), 5_125_000_000);
        assert_eq!(trade.rate.units(), 410_520_000);
        assert_eq!(trade.period, 30);
    }

    #[test]
    fn test_decode_book_snapshot_splits_sides() {
        let body = vec![
            json!([
                [0.00041, 2, 3, 150.0],
                [0.00042, 2, 1, -80.0],
                [0.00040, 30, 2, 60.0]
            ]),
            json!(1),
        ];
        let ChannelMessage::BookSnapshot { seq, book } =
            decode_channel(ChannelKind::Book, &body).unwrap()
        else {
            panic!("expected snapshot");
        };
        assert_eq!(seq, 1);
        assert_eq!(book.ask.len(), 2);
        assert_eq!(book.bid.len(), 1);
        assert_eq!(book.top_ask().unwrap().rate.units(), 400_000_000);
    }

    #[test]
    fn test_decode_book_diff_zero_count_deletes() {
        let body = vec![json!([0.00041, 2, 0, 1.0]), json!(9)];
        let ChannelMessage::BookDiff { seq, diff } =
            decode_channel(ChannelKind::Book, &body).unwrap()
        else {
            panic!("expected diff");
        };
        assert_eq!(seq, 9);
        assert!(diff.is_delete());
    }
}
