use thiserror::Error;

/// Startup configuration failures. All of these are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingCredential(&'static str),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures from the broker REST API
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("order rejected by broker: {0}")]
    Rejected(String),

    #[error("broker returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("could not decode broker response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid order: {0}")]
    Invalid(String),
}

/// Failures from the quote stream
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid credential header: {0}")]
    InvalidHeader(String),

    #[error("could not decode feed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("gave up after {0} consecutive connection attempts")]
    RetriesExhausted(u32),

    #[error("quote stream already started")]
    AlreadyStarted,
}
