use super::SignalPolicy;
use crate::indicators::{calculate_ema_series, calculate_macd, Macd};
use crate::models::{Candle, Direction, SignalDecision};
use serde::{Deserialize, Serialize};

/// Parameters for the EMA trend-alignment + MACD confirmation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaMacdConfig {
    pub fast_ema: usize,
    pub mid_ema: usize,
    pub slow_ema: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub min_samples: usize,
    /// Also take PE entries on the mirrored bearish setup
    pub allow_short: bool,
}

impl Default for EmaMacdConfig {
    fn default() -> Self {
        Self {
            fast_ema: 5,
            mid_ema: 8,
            slow_ema: 13,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            min_samples: 30,
            allow_short: true,
        }
    }
}

/// Indicator values the entry rule looks at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaMacdSnapshot {
    pub ema_fast: f64,
    pub ema_fast_prev: f64,
    pub ema_mid: f64,
    pub ema_mid_prev: f64,
    pub ema_slow: f64,
    pub macd: Macd,
}

impl EmaMacdSnapshot {
    /// Compute the snapshot from close prices. Needs at least two closes.
    pub fn from_closes(closes: &[f64], config: &EmaMacdConfig) -> Option<Self> {
        if closes.len() < 2 {
            return None;
        }

        let fast = calculate_ema_series(closes, config.fast_ema);
        let mid = calculate_ema_series(closes, config.mid_ema);
        let slow = calculate_ema_series(closes, config.slow_ema);
        let macd = calculate_macd(closes, config.macd_fast, config.macd_slow, config.macd_signal)?;

        let n = closes.len();
        Some(Self {
            ema_fast: *fast.get(n - 1)?,
            ema_fast_prev: *fast.get(n - 2)?,
            ema_mid: *mid.get(n - 1)?,
            ema_mid_prev: *mid.get(n - 2)?,
            ema_slow: *slow.get(n - 1)?,
            macd,
        })
    }

    pub fn trend_aligned_up(&self) -> bool {
        self.ema_fast > self.ema_mid && self.ema_mid > self.ema_slow
    }

    pub fn fast_rising(&self) -> bool {
        self.ema_fast > self.ema_fast_prev
    }

    pub fn mid_rising(&self) -> bool {
        self.ema_mid > self.ema_mid_prev
    }

    pub fn macd_bullish(&self) -> bool {
        self.macd.macd > self.macd.signal && self.macd.histogram > 0.0
    }

    /// CE entry: all four clauses hold
    pub fn bullish_entry(&self) -> bool {
        self.trend_aligned_up() && self.fast_rising() && self.mid_rising() && self.macd_bullish()
    }

    /// PE entry: the mirror image of the CE rule
    pub fn bearish_entry(&self) -> bool {
        self.ema_fast < self.ema_mid
            && self.ema_mid < self.ema_slow
            && self.ema_fast < self.ema_fast_prev
            && self.ema_mid < self.ema_mid_prev
            && self.macd.macd < self.macd.signal
            && self.macd.histogram < 0.0
    }
}

/// EMA 5/8/13 alignment with MACD(12, 26, 9) confirmation
#[derive(Debug, Clone, Default)]
pub struct EmaMacdPolicy {
    config: EmaMacdConfig,
}

impl EmaMacdPolicy {
    pub fn new(config: EmaMacdConfig) -> Self {
        Self { config }
    }
}

impl SignalPolicy for EmaMacdPolicy {
    fn name(&self) -> &str {
        "ema-macd"
    }

    fn min_samples(&self) -> usize {
        self.config.min_samples
    }

    fn evaluate(&self, candles: &[Candle]) -> SignalDecision {
        if candles.len() < self.min_samples() {
            return SignalDecision::none(format!(
                "insufficient data: {} closes, need {}",
                candles.len(),
                self.min_samples()
            ));
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let Some(snapshot) = EmaMacdSnapshot::from_closes(&closes, &self.config) else {
            return SignalDecision::none("indicators unavailable");
        };

        tracing::debug!(
            ema_fast = snapshot.ema_fast,
            ema_mid = snapshot.ema_mid,
            ema_slow = snapshot.ema_slow,
            macd = snapshot.macd.macd,
            signal = snapshot.macd.signal,
            "ema-macd snapshot"
        );

        if snapshot.bullish_entry() {
            return SignalDecision::enter(
                Direction::Ce,
                format!(
                    "EMA {:.2} > {:.2} > {:.2} rising, MACD {:.3} > signal {:.3}",
                    snapshot.ema_fast,
                    snapshot.ema_mid,
                    snapshot.ema_slow,
                    snapshot.macd.macd,
                    snapshot.macd.signal
                ),
            );
        }

        if self.config.allow_short && snapshot.bearish_entry() {
            return SignalDecision::enter(
                Direction::Pe,
                format!(
                    "EMA {:.2} < {:.2} < {:.2} falling, MACD {:.3} < signal {:.3}",
                    snapshot.ema_fast,
                    snapshot.ema_mid,
                    snapshot.ema_slow,
                    snapshot.macd.macd,
                    snapshot.macd.signal
                ),
            );
        }

        SignalDecision::none("no EMA/MACD setup")
    }
}
