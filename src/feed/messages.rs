use crate::error::FeedError;
use crate::models::{normalize_security_id, Tick};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubscriptionParams {
    pub mode: String,
    pub instruments: Vec<String>,
}

/// Outgoing control frame
///
/// ```json
/// {"msg_type":"subscribe","instrument_type":"security",
///  "params":{"mode":"FULL","instruments":["49081"]}}
/// ```
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubscriptionRequest {
    pub msg_type: MessageType,
    pub instrument_type: String,
    pub params: SubscriptionParams,
}

impl SubscriptionRequest {
    pub fn subscribe<I, S>(mode: &str, instruments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MessageType::Subscribe, mode, instruments)
    }

    pub fn unsubscribe<I, S>(mode: &str, instruments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MessageType::Unsubscribe, mode, instruments)
    }

    fn new<I, S>(msg_type: MessageType, mode: &str, instruments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            msg_type,
            instrument_type: "security".to_string(),
            params: SubscriptionParams {
                mode: mode.to_string(),
                instruments: instruments.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, FeedError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }

    fn as_id(&self) -> Option<String> {
        let raw = match self {
            Scalar::Number(n) if n.fract() == 0.0 && *n >= 0.0 => format!("{}", *n as u64),
            Scalar::Number(_) => return None,
            Scalar::Text(s) => s.trim().to_string(),
        };
        let id = normalize_security_id(&raw);
        (!id.is_empty()).then_some(id)
    }
}

#[derive(Debug, Deserialize)]
struct RawQuote {
    #[serde(
        default,
        alias = "securityId",
        alias = "instrument",
        alias = "symbol"
    )]
    security_id: Option<Scalar>,
    #[serde(default, alias = "last_price", alias = "LTP")]
    ltp: Option<Scalar>,
    #[serde(default, alias = "ltt")]
    timestamp: Option<Scalar>,
}

/// Decode a feed frame into zero or more ticks.
///
/// Accepts a single quote object, an array of them, or either wrapped in a
/// `data` envelope. Frames without a recognisable id and positive price
/// (acks, heartbeats) produce no ticks. Quotes without a numeric timestamp
/// are stamped with `received_at`.
pub fn decode_ticks(text: &str, received_at: DateTime<Utc>) -> Result<Vec<Tick>, FeedError> {
    let value: Value = serde_json::from_str(text)?;
    let mut ticks = Vec::new();
    collect_ticks(value, received_at, &mut ticks);
    Ok(ticks)
}

fn collect_ticks(value: Value, received_at: DateTime<Utc>, out: &mut Vec<Tick>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_ticks(item, received_at, out);
            }
        }
        Value::Object(mut map) => {
            if let Some(inner) = map.remove("data") {
                if inner.is_object() || inner.is_array() {
                    collect_ticks(inner, received_at, out);
                    return;
                }
            }
            if let Ok(quote) = serde_json::from_value::<RawQuote>(Value::Object(map)) {
                if let Some(tick) = quote_to_tick(quote, received_at) {
                    out.push(tick);
                }
            }
        }
        _ => {}
    }
}

fn quote_to_tick(quote: RawQuote, received_at: DateTime<Utc>) -> Option<Tick> {
    let instrument = quote.security_id.as_ref()?.as_id()?;
    let price = quote.ltp.as_ref()?.as_f64()?;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }

    let timestamp = quote
        .timestamp
        .as_ref()
        .and_then(Scalar::as_f64)
        .and_then(epoch_to_datetime)
        .unwrap_or(received_at);

    Some(Tick {
        instrument,
        timestamp,
        price,
    })
}

/// Seconds, or milliseconds when the value is too large to be seconds
fn epoch_to_datetime(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    if value > 1e12 {
        DateTime::<Utc>::from_timestamp_millis(value as i64)
    } else {
        DateTime::<Utc>::from_timestamp(value as i64, 0)
    }
}
