//! Credentialed REST client.
//!
//! Every call is a signed POST; responses are positional arrays mapped
//! to typed records. Write operations return the exchange's
//! notification envelope decoded into [`OpResult`] / [`CloseResult`].

use crate::error::{ClientError, ClientResult};
use crate::http::{build_client, check_json, send_with_retry};
use crate::sign::{sign_request, NonceGen};
use bfx_core::{wire, Amount, Balance, Credit, Loan, Order, OrderStatus, Position, Rate, Side};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use zeroize::Zeroizing;

const PRIVATE_API_URL: &str = "https://api.bitfinex.com";

/// Result of a funding offer submit/cancel.
#[derive(Debug, Clone)]
pub struct OpResult {
    pub success: bool,
    pub status: String,
    pub text: String,
    pub order: Option<Order>,
}

/// Result of a funding close.
#[derive(Debug, Clone)]
pub struct CloseResult {
    pub success: bool,
    pub status: String,
    pub text: String,
}

pub struct BfxPrivateClient {
    http: reqwest::Client,
    base: String,
    api_key: String,
    api_secret: Zeroizing<Vec<u8>>,
    nonce: NonceGen,
}

impl BfxPrivateClient {
    pub fn new(api_key: impl Into<String>, api_secret: Vec<u8>) -> ClientResult<Self> {
        Self::with_base(PRIVATE_API_URL, api_key, api_secret)
    }

    pub fn with_base(
        base: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: Vec<u8>,
    ) -> ClientResult<Self> {
        Ok(Self {
            http: build_client()?,
            base: base.into(),
            api_key: api_key.into(),
            api_secret: Zeroizing::new(api_secret),
            nonce: NonceGen::new(),
        })
    }

    /// Signed POST. The query string rides on the URL but stays out of
    /// the signed payload.
    async fn post_signed(
        &self,
        path: &str,
        query: &str,
        body: &str,
        what: &str,
    ) -> ClientResult<Value> {
        let url = format!("{}/{}{}", self.base, path, query);
        debug!(%path, what, "signed request");
        let resp = send_with_retry(|| {
            let nonce = self.nonce.next();
            let sig = sign_request(&self.api_secret, path, nonce, body);
            self.http
                .post(&url)
                .header("bfx-nonce", nonce.to_string())
                .header("bfx-apikey", &self.api_key)
                .header("bfx-signature", sig)
                .header("content-type", "application/json")
                .body(body.to_string())
        })
        .await?;
        check_json(resp, what).await
    }

    /// Margin wallet balances.
    pub async fn get_margin_balances(&self) -> ClientResult<Vec<Balance>> {
        let v = self
            .post_signed("v2/auth/r/wallets", "", "{}", "get wallets")
            .await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        let mut out = Vec::new();
        for row in arr {
            let b = balance_from_wire(row)?;
            if b.wallet == "margin" {
                out.push(b);
            }
        }
        Ok(out)
    }

    /// Open margin positions.
    pub async fn get_positions(&self) -> ClientResult<Vec<Position>> {
        let v = self
            .post_signed("v2/auth/r/positions", "", "{}", "get positions")
            .await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        arr.iter().map(position_from_wire).collect()
    }

    /// Active credits (borrowing side) for a currency.
    pub async fn get_credits(&self, currency: &str) -> ClientResult<Vec<Credit>> {
        let path = format!("v2/auth/r/funding/credits/f{currency}");
        let v = self.post_signed(&path, "", "{}", "get credits").await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        arr.iter().map(credit_from_wire).collect()
    }

    /// Active loans (lending side) for a currency.
    pub async fn get_loans(&self, currency: &str) -> ClientResult<Vec<Loan>> {
        let path = format!("v2/auth/r/funding/loans/f{currency}");
        let v = self.post_signed(&path, "", "{}", "get loans").await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        arr.iter().map(loan_from_wire).collect()
    }

    pub async fn get_credits_history(
        &self,
        currency: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> ClientResult<Vec<Credit>> {
        let path = format!("v2/auth/r/funding/credits/f{currency}/hist");
        let v = self
            .post_signed(&path, &hist_query(since, limit), "{}", "get credits history")
            .await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        arr.iter().map(credit_from_wire).collect()
    }

    pub async fn get_loans_history(
        &self,
        currency: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> ClientResult<Vec<Loan>> {
        let path = format!("v2/auth/r/funding/loans/f{currency}/hist");
        let v = self
            .post_signed(&path, &hist_query(since, limit), "{}", "get loans history")
            .await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        arr.iter().map(loan_from_wire).collect()
    }

    /// Place a funding bid (borrow demand) as a limit offer.
    pub async fn submit_bid_order(
        &self,
        currency: &str,
        amount: Amount,
        rate: Rate,
        period: u32,
    ) -> ClientResult<OpResult> {
        // Bids carry a negative amount on the wire.
        let body = format!(
            r#"{{"type":"LIMIT","symbol":"f{currency}","amount":"-{}","rate":"{}","period":{period},"flags":0}}"#,
            amount.inner(),
            rate.inner(),
        );
        let v = self
            .post_signed("v2/auth/w/funding/offer/submit", "", &body, "submit order")
            .await?;
        op_result_from_wire(&v)
    }

    /// Cancel an active funding offer.
    pub async fn cancel_order(&self, id: u64) -> ClientResult<OpResult> {
        let body = format!(r#"{{"id":{id}}}"#);
        let v = self
            .post_signed("v2/auth/w/funding/offer/cancel", "", &body, "cancel order")
            .await?;
        op_result_from_wire(&v)
    }

    /// Close a funded loan or credit by id.
    pub async fn close_funding(&self, loan_id: u64) -> ClientResult<CloseResult> {
        let body = format!(r#"{{"id":{loan_id}}}"#);
        let v = self
            .post_signed("v2/auth/w/funding/close", "", &body, "close funding")
            .await?;
        close_result_from_wire(&v)
    }

    /// Active funding offers for a currency.
    pub async fn get_active_orders(&self, currency: &str) -> ClientResult<Vec<Order>> {
        let path = format!("v2/auth/r/funding/offers/f{currency}");
        let v = self.post_signed(&path, "", "{}", "get active orders").await?;
        let arr = wire::as_array(&v).map_err(ClientError::Core)?;
        arr.iter().map(order_from_wire).collect()
    }
}

fn hist_query(since: Option<DateTime<Utc>>, limit: u32) -> String {
    match since {
        Some(t) => format!("?limit={limit}&start={}", t.timestamp_millis()),
        None => format!("?limit={limit}"),
    }
}

/// Strip the `f`/`t` symbol prefix.
fn strip_symbol(s: &str) -> String {
    s.get(1..).unwrap_or_default().to_string()
}

/// Wallet row `[type, currency, balance, unsettled, available, …]`.
fn balance_from_wire(v: &Value) -> ClientResult<Balance> {
    let arr = wire::array_at_least(v, 5).map_err(ClientError::Core)?;
    Ok(Balance {
        wallet: wire::get_str(&arr[0])?,
        currency: wire::get_str(&arr[1])?,
        total: wire::get_amount(&arr[2])?,
        available: wire::get_amount(&arr[4])?,
    })
}

/// Position row; the amount's sign encodes long/short.
fn position_from_wire(v: &Value) -> ClientResult<Position> {
    let arr = wire::array_at_least(v, 12).map_err(ClientError::Core)?;
    let (amount, neg) = wire::get_amount_signed(&arr[2])?;
    Ok(Position {
        market: strip_symbol(&wire::get_str(&arr[0])?),
        status: wire::get_str(&arr[1])?,
        amount,
        long: !neg,
        base_price: wire::get_amount(&arr[3])?,
        funding: wire::get_amount(&arr[4])?,
        liq_price: wire::get_amount(&arr[8])?,
        id: wire::get_u64(&arr[11])?,
    })
}

fn loan_from_wire(v: &Value) -> ClientResult<Loan> {
    let arr = wire::array_at_least(v, 21).map_err(ClientError::Core)?;
    Ok(Loan {
        id: wire::get_u64(&arr[0])?,
        currency: strip_symbol(&wire::get_str(&arr[1])?),
        side: wire::get_i32(&arr[2])?,
        create_time: wire::get_time_ms(&arr[3])?,
        update_time: wire::get_time_ms(&arr[4])?,
        amount: wire::get_amount(&arr[5])?,
        status: wire::get_str(&arr[7])?,
        rate: wire::get_rate(&arr[11])?,
        period: wire::get_u32(&arr[12])?,
        renew: wire::get_flag(&arr[18])?,
        no_close: wire::get_flag(&arr[20])?,
    })
}

/// A credit is a loan annotated with the market its funds back.
fn credit_from_wire(v: &Value) -> ClientResult<Credit> {
    let arr = wire::array_at_least(v, 22).map_err(ClientError::Core)?;
    Ok(Credit {
        loan: loan_from_wire(v)?,
        market: strip_symbol(&wire::get_str(&arr[21])?),
    })
}

/// Funding offer row `[id, symbol, mtsCreate, mtsUpdate, amount,
/// amountOrig, type, …, status(10), …, rate(14), period(15), …]`.
fn order_from_wire(v: &Value) -> ClientResult<Order> {
    let arr = wire::array_at_least(v, 16).map_err(ClientError::Core)?;
    let (amount, neg) = wire::get_amount_signed(&arr[4])?;
    let (amount_orig, orig_neg) = wire::get_amount_signed(&arr[5])?;
    let status = OrderStatus::parse(&wire::get_str(&arr[10])?)?;
    Ok(Order {
        id: wire::get_u64(&arr[0])?,
        currency: strip_symbol(&wire::get_str(&arr[1])?),
        create_time: wire::get_time_ms(&arr[2])?,
        update_time: wire::get_time_ms(&arr[3])?,
        amount,
        amount_orig,
        side: Side::from_negative(neg || orig_neg),
        status,
        rate: wire::get_rate(&arr[14])?,
        period: wire::get_u32(&arr[15])?,
    })
}

/// Notification envelope `[mts, type, msgId, null, payload, code,
/// status, text]`.
fn notification_parts(v: &Value) -> ClientResult<(bool, String, String, Option<Value>)> {
    let arr = wire::array_at_least(v, 8).map_err(ClientError::Core)?;
    let status = wire::get_str(&arr[6])?;
    let text = wire::get_str(&arr[7])?;
    let payload = match &arr[4] {
        Value::Null => None,
        other => Some(other.clone()),
    };
    Ok((status == "SUCCESS", status, text, payload))
}

fn op_result_from_wire(v: &Value) -> ClientResult<OpResult> {
    let (success, status, text, payload) = notification_parts(v)?;
    let order = match payload {
        Some(p) if p.is_array() && !p.as_array().map_or(true, Vec::is_empty) => {
            Some(order_from_wire(&p)?)
        }
        _ => None,
    };
    Ok(OpResult {
        success,
        status,
        text,
        order,
    })
}

fn close_result_from_wire(v: &Value) -> ClientResult<CloseResult> {
    let (success, status, text, _payload) = notification_parts(v)?;
    Ok(CloseResult {
        success,
        status,
        text,
    })
}
