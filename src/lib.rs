// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use api::{DhanClient, Profile};
pub use config::{AppConfig, Credentials};
pub use error::{BrokerError, ConfigError, FeedError};
pub use models::*;
pub use strategy::SignalPolicy;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
