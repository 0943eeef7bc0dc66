//! Helpers for the exchange's positional-array JSON wire format.
//!
//! Responses are arrays indexed by position rather than keyed objects.
//! Every accessor returns a protocol error on a shape mismatch; `null`
//! decodes to the type's empty value, matching the exchange's habit of
//! nulling unused slots.

use crate::book::{OrderBookEntry, Side};
use crate::decimal::{Amount, Rate};
use crate::error::{CoreError, Result};
use crate::funding::Trade;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

fn protocol(what: &str, v: &Value) -> CoreError {
    CoreError::Protocol(format!("expected {what}, got {v}"))
}

pub fn as_array(v: &Value) -> Result<&Vec<Value>> {
    v.as_array().ok_or_else(|| protocol("array", v))
}

/// Array accessor with a length guard.
pub fn array_at_least(v: &Value, len: usize) -> Result<&Vec<Value>> {
    let arr = as_array(v)?;
    if arr.len() < len {
        return Err(CoreError::Protocol(format!(
            "array too short: {} < {len}",
            arr.len()
        )));
    }
    Ok(arr)
}

pub fn get_str(v: &Value) -> Result<String> {
    if v.is_null() {
        return Ok(String::new());
    }
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| protocol("string", v))
}

pub fn get_u64(v: &Value) -> Result<u64> {
    if v.is_null() {
        return Ok(0);
    }
    v.as_u64().ok_or_else(|| protocol("unsigned integer", v))
}

pub fn get_u32(v: &Value) -> Result<u32> {
    let n = get_u64(v)?;
    u32::try_from(n).map_err(|_| protocol("u32", v))
}

pub fn get_i64(v: &Value) -> Result<i64> {
    if v.is_null() {
        return Ok(0);
    }
    v.as_i64().ok_or_else(|| protocol("integer", v))
}

pub fn get_i32(v: &Value) -> Result<i32> {
    let n = get_i64(v)?;
    i32::try_from(n).map_err(|_| protocol("i32", v))
}

/// Integers double as booleans on the wire (renew / no-close flags).
pub fn get_flag(v: &Value) -> Result<bool> {
    Ok(get_i64(v)? != 0)
}

fn get_decimal(v: &Value) -> Result<Decimal> {
    let n = match v {
        Value::Null => return Ok(Decimal::ZERO),
        Value::Number(n) => n,
        _ => return Err(protocol("number", v)),
    };
    let s = n.to_string();
    s.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(&s))
        .map_err(|_| protocol("decimal number", v))
}

pub fn get_amount(v: &Value) -> Result<Amount> {
    Ok(Amount::new(get_decimal(v)?))
}

/// Signed wire amount: magnitude plus whether it was negative.
pub fn get_amount_signed(v: &Value) -> Result<(Amount, bool)> {
    let d = get_decimal(v)?;
    Ok((Amount::new(d.abs()), d.is_sign_negative() && !d.is_zero()))
}

pub fn get_rate(v: &Value) -> Result<Rate> {
    Ok(Rate::new(get_decimal(v)?))
}

/// Millisecond unix timestamp.
pub fn get_time_ms(v: &Value) -> Result<DateTime<Utc>> {
    let ms = get_i64(v)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| protocol("unix millis", v))
}

/// Wire trade `[id, mts, amount, rate, period]`; the amount's sign
/// encodes the side.
pub fn trade(v: &Value) -> Result<Trade> {
    let arr = array_at_least(v, 5)?;
    let (amount, neg) = get_amount_signed(&arr[2])?;
    Ok(Trade {
        id: get_u64(&arr[0])?,
        timestamp: get_time_ms(&arr[1])?,
        side: Side::from_negative(neg),
        amount,
        rate: get_rate(&arr[3])?,
        period: get_u32(&arr[4])?,
    })
}

/// Wire funding-book level `[rate, period, count, amount]`.
///
/// Returns the entry, the side derived from the amount's sign, and the
/// order count (zero marks a deleted level in diff frames).
pub fn book_level(v: &Value) -> Result<(OrderBookEntry, Side, u64)> {
    let arr = array_at_least(v, 4)?;
    let rate = get_rate(&arr[0])?;
    let period = get_u32(&arr[1])?;
    let count = get_u64(&arr[2])?;
    let (amount, neg) = get_amount_signed(&arr[3])?;
    Ok((
        OrderBookEntry {
            rate,
            period,
            amount,
        },
        Side::from_negative(neg),
        count,
    ))
}
