// Signal policies and the evaluator that feeds them
pub mod ema_macd;
pub mod evaluator;
pub mod multi_timeframe_rsi;

pub use ema_macd::{EmaMacdConfig, EmaMacdPolicy, EmaMacdSnapshot};
pub use evaluator::SignalEvaluator;
pub use multi_timeframe_rsi::{MtfRsiConfig, MultiTimeframeRsiPolicy};

use crate::models::{Candle, SignalDecision};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// A trading rule evaluated over recent candles
pub trait SignalPolicy: Send + Sync {
    /// Policy name, used in logs
    fn name(&self) -> &str;

    /// Minimum close prices required before the rule is evaluated
    fn min_samples(&self) -> usize;

    /// How much history the evaluator should aggregate for this policy.
    /// Default is twice the minimum sample count at the given candle size.
    fn lookback(&self, candle_interval: Duration) -> Duration {
        candle_interval * (self.min_samples() as i32 * 2)
    }

    /// Decide whether to enter, and in which direction
    fn evaluate(&self, candles: &[Candle]) -> SignalDecision;
}

/// Which signal policy the loop runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    EmaMacd,
    MtfRsi,
}

/// Signal evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub policy: PolicyKind,
    pub candle_interval_secs: i64,
    /// Global floor on close prices before any policy runs
    pub min_samples: usize,
    /// Ticks kept per instrument
    pub history_capacity: usize,
    pub ema_macd: EmaMacdConfig,
    pub mtf_rsi: MtfRsiConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::EmaMacd,
            candle_interval_secs: 60,
            min_samples: 30,
            history_capacity: 20_000,
            ema_macd: EmaMacdConfig::default(),
            mtf_rsi: MtfRsiConfig::default(),
        }
    }
}

impl StrategyConfig {
    pub fn candle_interval(&self) -> Duration {
        Duration::seconds(self.candle_interval_secs)
    }

    /// Instantiate the configured policy
    pub fn build_policy(&self) -> Box<dyn SignalPolicy> {
        match self.policy {
            PolicyKind::EmaMacd => Box::new(EmaMacdPolicy::new(self.ema_macd.clone())),
            PolicyKind::MtfRsi => Box::new(MultiTimeframeRsiPolicy::new(self.mtf_rsi.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_policy_by_kind() {
        let mut config = StrategyConfig::default();
        assert_eq!(config.build_policy().name(), "ema-macd");

        config.policy = PolicyKind::MtfRsi;
        assert_eq!(config.build_policy().name(), "mtf-rsi");
    }

    #[test]
    fn test_policy_kind_wire_name() {
        let kind: PolicyKind = serde_json::from_str("\"mtf-rsi\"").unwrap();
        assert_eq!(kind, PolicyKind::MtfRsi);
    }

    #[test]
    fn test_default_lookback() {
        let policy = EmaMacdPolicy::default();
        assert_eq!(policy.lookback(Duration::minutes(1)), Duration::minutes(60));
    }
}
