//! Shared HTTP plumbing for the REST adapters.

use crate::error::{ClientError, ClientResult};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Read timeout on every REST call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
/// Connection attempts before a call is surfaced as fatal.
const DIAL_TRIALS: u32 = 5;

const USER_AGENT: &str = concat!("bfx-funding-agent/", env!("CARGO_PKG_VERSION"));

pub fn build_client() -> ClientResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?)
}

/// Send a request, retrying connection-level failures a bounded number
/// of times. The builder closure is re-invoked per attempt so signed
/// requests get a fresh nonce.
pub async fn send_with_retry<F>(build: F) -> ClientResult<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last: Option<reqwest::Error> = None;
    for attempt in 1..=DIAL_TRIALS {
        match build().send().await {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_connect() || e.is_timeout() => {
                warn!(attempt, error = %e, "HTTP dial failed");
                last = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last.expect("at least one attempt was made").into())
}

/// Decode the response body, translating error payloads.
///
/// The exchange reports failures either as `["error", code, message]`
/// or as `{"message": …}`, with an HTTP error status.
pub async fn check_json(resp: reqwest::Response, what: &str) -> ClientResult<Value> {
    let status = resp.status();
    let text = resp.text().await?;
    let body: Option<Value> = serde_json::from_str(&text).ok();

    if status.is_client_error() || status.is_server_error() {
        return Err(exchange_error(what, status.as_u16(), body.as_ref()));
    }
    body.ok_or_else(|| ClientError::Protocol(format!("{what}: response is not JSON")))
}

fn exchange_error(what: &str, status: u16, body: Option<&Value>) -> ClientError {
    match body {
        Some(Value::Array(arr))
            if arr.first().and_then(Value::as_str) == Some("error") && arr.len() >= 2 =>
        {
            ClientError::Exchange {
                code: arr[1].as_i64().unwrap_or(0),
                message: format!(
                    "{what}: {}",
                    arr.get(2).and_then(Value::as_str).unwrap_or_default()
                ),
            }
        }
        Some(Value::Object(obj)) => ClientError::Exchange {
            code: i64::from(status),
            message: format!(
                "{what}: {}",
                obj.get("message").and_then(Value::as_str).unwrap_or_default()
            ),
        },
        _ => ClientError::Status(status),
    }
}
