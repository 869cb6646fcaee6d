use super::{SignalPolicy, StrategyConfig};
use crate::execution::TickStore;
use crate::models::SignalDecision;
use chrono::{DateTime, Duration, Utc};

/// Turns raw tick history into candles and runs the selected policy on them
pub struct SignalEvaluator {
    policy: Box<dyn SignalPolicy>,
    store: TickStore,
    candle_interval: Duration,
    min_samples: usize,
}

impl SignalEvaluator {
    pub fn new(
        policy: Box<dyn SignalPolicy>,
        store: TickStore,
        candle_interval: Duration,
        min_samples: usize,
    ) -> Self {
        Self {
            policy,
            store,
            candle_interval,
            min_samples,
        }
    }

    pub fn from_config(config: &StrategyConfig, store: TickStore) -> Self {
        Self::new(
            config.build_policy(),
            store,
            config.candle_interval(),
            config.min_samples,
        )
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Close prices required before evaluating
    pub fn required_samples(&self) -> usize {
        self.min_samples.max(self.policy.min_samples())
    }

    /// History window aggregated on each evaluation
    pub fn lookback(&self) -> Duration {
        let floor = self.candle_interval * (self.required_samples() as i32 * 2);
        self.policy.lookback(self.candle_interval).max(floor)
    }

    pub fn evaluate(&self, instrument: &str) -> SignalDecision {
        self.evaluate_at(instrument, Utc::now())
    }

    pub fn evaluate_at(&self, instrument: &str, now: DateTime<Utc>) -> SignalDecision {
        let lookback = self.lookback();

        let candles = match self
            .store
            .candles_at(instrument, self.candle_interval, lookback, now)
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(instrument, "Failed to read tick history: {}", e);
                return SignalDecision::none(format!("tick history unavailable: {e}"));
            }
        };

        let required = self.required_samples();
        if candles.len() < required {
            return SignalDecision::none(format!(
                "insufficient data: {} closes, need {}",
                candles.len(),
                required
            ));
        }

        let decision = self.policy.evaluate(&candles);
        tracing::debug!(
            instrument,
            policy = self.policy.name(),
            fired = decision.fired(),
            reason = %decision.reason,
            "Evaluated signal"
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use crate::strategy::{EmaMacdPolicy, PolicyKind};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn fill_minutes(store: &TickStore, prices: &[f64]) {
        let start = now() - Duration::minutes(prices.len() as i64);
        for (i, &p) in prices.iter().enumerate() {
            store
                .record("49081", start + Duration::minutes(i as i64) + Duration::seconds(5), p)
                .unwrap();
        }
    }

    fn evaluator(store: TickStore) -> SignalEvaluator {
        SignalEvaluator::new(
            Box::new(EmaMacdPolicy::default()),
            store,
            Duration::minutes(1),
            30,
        )
    }

    #[test]
    fn test_fewer_than_thirty_samples_never_signal() {
        for n in [0usize, 1, 10, 29] {
            let store = TickStore::new(1000);
            let prices: Vec<f64> = (0..n).map(|i| 100.0 * 1.02_f64.powi(i as i32)).collect();
            fill_minutes(&store, &prices);

            let decision = evaluator(store).evaluate_at("49081", now());
            assert!(!decision.fired(), "fired with {n} samples");
        }
    }

    #[test]
    fn test_uptrend_from_ticks_signals() {
        let store = TickStore::new(1000);
        let prices: Vec<f64> = (0..45).map(|i| 100.0 * 1.01_f64.powi(i)).collect();
        fill_minutes(&store, &prices);

        let decision = evaluator(store).evaluate_at("49081", now());
        assert_eq!(decision.direction, Some(Direction::Ce));
    }

    #[test]
    fn test_global_floor_applies_to_lenient_policy() {
        let config = StrategyConfig {
            policy: PolicyKind::EmaMacd,
            min_samples: 40,
            ..Default::default()
        };
        let store = TickStore::new(1000);
        let prices: Vec<f64> = (0..35).map(|i| 100.0 * 1.01_f64.powi(i)).collect();
        fill_minutes(&store, &prices);

        let evaluator = SignalEvaluator::from_config(&config, store);
        assert_eq!(evaluator.required_samples(), 40);
        assert!(!evaluator.evaluate_at("49081", now()).fired());
    }
}
