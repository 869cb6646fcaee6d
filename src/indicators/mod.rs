// Technical indicators used by the signal policies

pub mod macd;
pub mod moving_average;
pub mod rsi;

pub use macd::{calculate_macd, Macd};
pub use moving_average::{calculate_ema, calculate_ema_series};
pub use rsi::calculate_rsi;
