use super::SignalPolicy;
use crate::indicators::calculate_rsi;
use crate::models::{Candle, Direction, SignalDecision};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Parameters for the multi-timeframe momentum + RSI policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtfRsiConfig {
    /// Timeframes in minutes, each must show a move beyond the threshold
    pub timeframes_minutes: Vec<i64>,
    pub move_threshold_pct: f64,
    pub rsi_period: usize,
    /// RSI band is (rsi_lower, rsi_upper]
    pub rsi_lower: f64,
    pub rsi_upper: f64,
    pub min_samples: usize,
    pub allow_short: bool,
}

impl Default for MtfRsiConfig {
    fn default() -> Self {
        Self {
            timeframes_minutes: vec![3, 15, 60],
            move_threshold_pct: 1.0,
            rsi_period: 14,
            rsi_lower: 35.0,
            rsi_upper: 65.0,
            min_samples: 30,
            allow_short: true,
        }
    }
}

/// Requires price to have moved the same way across every timeframe, with RSI
/// still inside a neutral band (not yet overbought/oversold).
#[derive(Debug, Clone, Default)]
pub struct MultiTimeframeRsiPolicy {
    config: MtfRsiConfig,
}

impl MultiTimeframeRsiPolicy {
    pub fn new(config: MtfRsiConfig) -> Self {
        Self { config }
    }

    fn longest_timeframe(&self) -> Duration {
        Duration::minutes(self.config.timeframes_minutes.iter().copied().max().unwrap_or(60))
    }

    /// Percent move from the open of the first candle in
    /// `[last - timeframe, last]` to the last close. None if the history does
    /// not reach back to the start of the timeframe.
    pub fn timeframe_move_pct(candles: &[Candle], timeframe: Duration) -> Option<f64> {
        let last = candles.last()?;
        let start = last.timestamp - timeframe;
        if candles.first()?.timestamp > start {
            return None;
        }

        let first = candles.iter().find(|c| c.timestamp >= start)?;
        if first.open == 0.0 {
            return None;
        }

        Some((last.close - first.open) / first.open * 100.0)
    }

    fn rsi_in_band(&self, rsi: f64) -> bool {
        rsi > self.config.rsi_lower && rsi <= self.config.rsi_upper
    }
}

impl SignalPolicy for MultiTimeframeRsiPolicy {
    fn name(&self) -> &str {
        "mtf-rsi"
    }

    fn min_samples(&self) -> usize {
        self.config.min_samples.max(self.config.rsi_period + 1)
    }

    fn lookback(&self, candle_interval: Duration) -> Duration {
        let by_samples = candle_interval * (self.min_samples() as i32 * 2);
        let by_timeframe = self.longest_timeframe() + candle_interval * 2;
        by_samples.max(by_timeframe)
    }

    fn evaluate(&self, candles: &[Candle]) -> SignalDecision {
        if candles.len() < self.min_samples() {
            return SignalDecision::none(format!(
                "insufficient data: {} closes, need {}",
                candles.len(),
                self.min_samples()
            ));
        }

        let mut moves = Vec::with_capacity(self.config.timeframes_minutes.len());
        for &minutes in &self.config.timeframes_minutes {
            match Self::timeframe_move_pct(candles, Duration::minutes(minutes)) {
                Some(m) => moves.push((minutes, m)),
                None => {
                    return SignalDecision::none(format!(
                        "insufficient history for {}m timeframe",
                        minutes
                    ))
                }
            }
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let Some(rsi) = calculate_rsi(&closes, self.config.rsi_period) else {
            return SignalDecision::none("RSI unavailable");
        };

        let threshold = self.config.move_threshold_pct;
        let summary = moves
            .iter()
            .map(|(m, pct)| format!("{}m {:+.2}%", m, pct))
            .collect::<Vec<_>>()
            .join(", ");

        if !self.rsi_in_band(rsi) {
            return SignalDecision::none(format!(
                "RSI {:.1} outside ({}, {}] ({})",
                rsi, self.config.rsi_lower, self.config.rsi_upper, summary
            ));
        }

        if moves.iter().all(|(_, pct)| *pct > threshold) {
            return SignalDecision::enter(
                Direction::Ce,
                format!("rising on all timeframes ({summary}), RSI {rsi:.1}"),
            );
        }

        if self.config.allow_short && moves.iter().all(|(_, pct)| *pct < -threshold) {
            return SignalDecision::enter(
                Direction::Pe,
                format!("falling on all timeframes ({summary}), RSI {rsi:.1}"),
            );
        }

        SignalDecision::none(format!("no multi-timeframe momentum ({summary})"))
    }
}
