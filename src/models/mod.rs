use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque broker token identifying a tradable security
pub type InstrumentId = String;

/// Strip an exchange prefix ("NSE|49081" -> "49081") so configured ids and
/// feed ids compare equal
pub fn normalize_security_id(raw: &str) -> InstrumentId {
    let raw = raw.trim();
    raw.rsplit('|').next().unwrap_or(raw).trim().to_string()
}

fn deserialize_security_id<'de, D>(deserializer: D) -> Result<InstrumentId, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(normalize_security_id(&raw))
}

/// A tradable instrument from the configured watchlist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instrument {
    #[serde(deserialize_with = "deserialize_security_id")]
    pub security_id: InstrumentId,
    #[serde(default = "default_exchange_segment")]
    pub exchange_segment: String,
    /// Chart API instrument type, e.g. OPTIDX, FUTIDX, EQUITY
    #[serde(default = "default_instrument_type")]
    pub instrument_type: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

impl Instrument {
    pub fn new(security_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            security_id: normalize_security_id(&security_id.into()),
            exchange_segment: default_exchange_segment(),
            instrument_type: default_instrument_type(),
            quantity,
        }
    }
}

fn default_exchange_segment() -> String {
    "NSE_FNO".to_string()
}

fn default_instrument_type() -> String {
    "OPTIDX".to_string()
}

fn default_quantity() -> u32 {
    1
}

/// A single last-traded-price update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub instrument: InstrumentId,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// OHLC candle, either aggregated from ticks or loaded from the chart API.
/// `timestamp` is the end of the candle window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub instrument: InstrumentId,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Directional leg of a trade.
///
/// `Ce` is the call-equivalent (long) leg and `Pe` the put-equivalent
/// (short) leg, both taken on the signalled instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    #[serde(rename = "CE")]
    Ce,
    #[serde(rename = "PE")]
    Pe,
}

impl Direction {
    /// Order side that opens a trade in this direction
    pub fn entry_side(self) -> Side {
        match self {
            Direction::Ce => Side::Buy,
            Direction::Pe => Side::Sell,
        }
    }

    /// Order side that closes a trade in this direction
    pub fn exit_side(self) -> Side {
        self.entry_side().opposite()
    }

    /// Favourable price move in points for this direction
    pub fn directional_move(self, entry_price: f64, current_price: f64) -> f64 {
        match self {
            Direction::Ce => current_price - entry_price,
            Direction::Pe => entry_price - current_price,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ce => write!(f, "CE"),
            Direction::Pe => write!(f, "PE"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    Intraday,
    Cnc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Validity {
    Day,
    Ioc,
}

/// An order as handed to a gateway
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub correlation_id: String,
    pub security_id: InstrumentId,
    pub exchange_segment: String,
    pub side: Side,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub validity: Validity,
    pub quantity: u32,
    pub price: f64,
}

/// Outcome of a signal evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDecision {
    pub direction: Option<Direction>,
    pub reason: String,
}

impl SignalDecision {
    pub fn enter(direction: Direction, reason: impl Into<String>) -> Self {
        Self {
            direction: Some(direction),
            reason: reason.into(),
        }
    }

    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            direction: None,
            reason: reason.into(),
        }
    }

    pub fn fired(&self) -> bool {
        self.direction.is_some()
    }
}

/// Broker acknowledgment of an accepted order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Broker-side lifecycle of an order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Transit,
    Pending,
    PartTraded,
    Traded,
    Rejected,
    Cancelled,
    Expired,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            OrderStatus::Rejected | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }
}

/// Snapshot of an order as reported by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    pub average_price: Option<f64>,
    pub filled_quantity: u32,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Ce.entry_side(), Side::Buy);
        assert_eq!(Direction::Ce.exit_side(), Side::Sell);
        assert_eq!(Direction::Pe.entry_side(), Side::Sell);
        assert_eq!(Direction::Pe.exit_side(), Side::Buy);
    }

    #[test]
    fn test_directional_move() {
        assert_eq!(Direction::Ce.directional_move(100.0, 110.0), 10.0);
        assert_eq!(Direction::Pe.directional_move(100.0, 110.0), -10.0);
        assert_eq!(Direction::Pe.directional_move(100.0, 90.0), 10.0);
    }

    #[test]
    fn test_order_status_wire_names() {
        let status: OrderStatus = serde_json::from_str("\"PART_TRADED\"").unwrap();
        assert_eq!(status, OrderStatus::PartTraded);

        let status: OrderStatus = serde_json::from_str("\"TRIGGERED\"").unwrap();
        assert_eq!(status, OrderStatus::Unknown);
        assert!(OrderStatus::Rejected.is_terminal_failure());
        assert!(!OrderStatus::Traded.is_terminal_failure());
    }

    #[test]
    fn test_prefixed_ids_match_feed_ids() {
        let instrument: Instrument =
            serde_json::from_str(r#"{"security_id": "NSE|12599298", "quantity": 75}"#).unwrap();
        assert_eq!(instrument.security_id, "12599298");
        assert_eq!(Instrument::new(" NSE_FNO|49081 ", 50).security_id, "49081");
        assert_eq!(normalize_security_id("49081"), "49081");
    }

    #[test]
    fn test_instrument_defaults() {
        let instrument: Instrument =
            serde_json::from_str(r#"{"security_id": "49081"}"#).unwrap();
        assert_eq!(instrument.exchange_segment, "NSE_FNO");
        assert_eq!(instrument.instrument_type, "OPTIDX");
        assert_eq!(instrument.quantity, 1);
    }
}
