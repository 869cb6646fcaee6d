use crate::error::ConfigError;
use crate::models::Instrument;
use crate::risk::CircuitBreakers;
use crate::strategy::StrategyConfig;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;

pub const CLIENT_ID_VAR: &str = "CLIENT_ID";
pub const ACCESS_TOKEN_VAR: &str = "ACCESS_TOKEN";

/// Broker credentials, read from the process environment
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub access_token: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            access_token: access_token.into(),
        }
    }

    /// Load `CLIENT_ID` and `ACCESS_TOKEN`. Missing or empty values are fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = non_empty_env(CLIENT_ID_VAR)?;
        let access_token = non_empty_env(ACCESS_TOKEN_VAR)?;
        Ok(Self::new(client_id, access_token))
    }

    /// Token with only the first and last six characters visible
    pub fn masked_token(&self) -> String {
        let chars: Vec<char> = self.access_token.chars().collect();
        if chars.len() <= 12 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..6].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{head}...{tail}")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("access_token", &self.masked_token())
            .finish()
    }
}

fn non_empty_env(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::MissingCredential(name)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub rest_url: String,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.dhan.co/v2".to_string(),
            request_timeout_secs: 10,
            requests_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    pub mode: String,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
    /// Consecutive failed connection attempts before giving up. None retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub ready_timeout_secs: u64,
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.dhan.co/market/feed".to_string(),
            mode: "FULL".to_string(),
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 60,
            max_reconnect_attempts: None,
            ready_timeout_secs: 10,
            channel_capacity: 4096,
        }
    }
}

/// Where the loop is relative to the trading window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    WaitingForWindow,
    Active,
    Closed,
}

/// Daily time-of-day window in a fixed UTC offset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingWindow {
    #[serde(serialize_with = "serialize_hhmm", deserialize_with = "deserialize_hhmm")]
    pub start: NaiveTime,
    #[serde(serialize_with = "serialize_hhmm", deserialize_with = "deserialize_hhmm")]
    pub end: NaiveTime,
    /// Exchange local time offset, +05:30 for NSE
    pub utc_offset_minutes: i32,
}

impl Default for TradingWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(9, 20, 0).expect("valid time of day"),
            end: NaiveTime::from_hms_opt(15, 15, 0).expect("valid time of day"),
            utc_offset_minutes: 330,
        }
    }
}

impl TradingWindow {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
    }

    pub fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        now.with_timezone(&self.offset()).time()
    }

    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset()).date_naive()
    }

    /// Start is inclusive, end exclusive
    pub fn phase(&self, now: DateTime<Utc>) -> SessionPhase {
        let t = self.local_time(now);
        if t < self.start {
            SessionPhase::WaitingForWindow
        } else if t < self.end {
            SessionPhase::Active
        } else {
            SessionPhase::Closed
        }
    }

    /// Time until the window opens, zero if already open or closed
    pub fn until_start(&self, now: DateTime<Utc>) -> Duration {
        let t = self.local_time(now);
        if t < self.start {
            self.start - t
        } else {
            Duration::zero()
        }
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

fn deserialize_hhmm<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hhmm(s.trim())
        .ok_or_else(|| serde::de::Error::custom(format!("invalid time of day '{s}', expected HH:MM")))
}

fn serialize_hhmm<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&time.format("%H:%M").to_string())
}

/// Entry/exit parameters for the loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub window: TradingWindow,
    pub poll_interval_secs: u64,
    /// Limit price offset from the last traded price
    pub price_buffer: f64,
    pub stop_loss_points: f64,
    pub target_points: f64,
    pub trailing_step: f64,
    /// Cancel entry and exit orders not filled within this many seconds
    pub fill_timeout_secs: i64,
    /// Stream prices older than this are refreshed from the quote endpoint
    pub stale_quote_secs: i64,
    pub square_off_on_close: bool,
    /// Seed tick history from the intraday chart endpoint at startup
    pub warm_up: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            window: TradingWindow::default(),
            poll_interval_secs: 15,
            price_buffer: 0.05,
            stop_loss_points: 50.0,
            target_points: 25.0,
            trailing_step: 5.0,
            fill_timeout_secs: 120,
            stale_quote_secs: 60,
            square_off_on_close: true,
            warm_up: true,
        }
    }
}

/// Full application configuration, built once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub broker: BrokerConfig,
    pub feed: FeedConfig,
    pub strategy: StrategyConfig,
    pub trading: TradingConfig,
    pub risk: CircuitBreakers,
    pub instruments: Vec<Instrument>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "dhanbot=info".to_string(),
            broker: BrokerConfig::default(),
            feed: FeedConfig::default(),
            strategy: StrategyConfig::default(),
            trading: TradingConfig::default(),
            risk: CircuitBreakers::default(),
            instruments: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Layer an optional TOML file and `DHANBOT__*` environment variables
    /// over the defaults.
    ///
    /// # Example
    /// `DHANBOT__TRADING__POLL_INTERVAL_SECS=30` overrides `trading.poll_interval_secs`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(p) => builder.add_source(config::File::from(p).required(true)),
            None => builder.add_source(config::File::with_name("dhanbot").required(false)),
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("DHANBOT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.instruments.is_empty() {
            return invalid("at least one instrument must be configured".into());
        }
        if self.instruments.iter().any(|i| i.security_id.trim().is_empty()) {
            return invalid("instrument security_id must not be empty".into());
        }
        if self.instruments.iter().any(|i| i.quantity == 0) {
            return invalid("instrument quantity must be positive".into());
        }
        if self.trading.window.start >= self.trading.window.end {
            return invalid(format!(
                "trading window start {} must be before end {}",
                self.trading.window.start, self.trading.window.end
            ));
        }
        if self.strategy.min_samples < 30 {
            return invalid(format!(
                "strategy.min_samples must be at least 30, got {}",
                self.strategy.min_samples
            ));
        }
        if self.strategy.candle_interval_secs <= 0 {
            return invalid("strategy.candle_interval_secs must be positive".into());
        }
        if self.trading.poll_interval_secs == 0 {
            return invalid("trading.poll_interval_secs must be positive".into());
        }
        if self.trading.stop_loss_points <= 0.0
            || self.trading.target_points <= 0.0
            || self.trading.trailing_step <= 0.0
        {
            return invalid("stop_loss_points, target_points and trailing_step must be positive".into());
        }
        if !(self.trading.price_buffer.is_finite() && self.trading.price_buffer > 0.0) {
            return invalid(format!(
                "trading.price_buffer must be positive, got {}",
                self.trading.price_buffer
            ));
        }
        if self.trading.fill_timeout_secs <= 0 {
            return invalid(format!(
                "trading.fill_timeout_secs must be positive, got {}",
                self.trading.fill_timeout_secs
            ));
        }
        if self.trading.stale_quote_secs <= 0 {
            return invalid("trading.stale_quote_secs must be positive".into());
        }
        if self.risk.max_consecutive_failures == 0 {
            return invalid("risk.max_consecutive_failures must be positive".into());
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.trading.poll_interval_secs)
    }
}
