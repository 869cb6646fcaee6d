use crate::models::{Candle, Tick};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Thread-safe in-memory tick history
///
/// Keeps a fixed-capacity ring buffer of ticks per instrument. Written by the
/// feed ingest task, read by the strategy loop.
#[derive(Clone)]
pub struct TickStore {
    data: Arc<RwLock<HashMap<String, VecDeque<Tick>>>>,
    capacity: usize,
}

impl TickStore {
    /// Create a new store
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of ticks kept per instrument
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Append a tick, evicting the oldest once the buffer is full
    pub fn record(&self, instrument: &str, timestamp: DateTime<Utc>, price: f64) -> Result<(), String> {
        if !(price.is_finite() && price > 0.0) {
            return Err(format!("invalid price {price} for {instrument}"));
        }

        let mut data = self.data.write().map_err(|e| e.to_string())?;

        let ticks = data
            .entry(instrument.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(1024)));

        ticks.push_back(Tick {
            instrument: instrument.to_string(),
            timestamp,
            price,
        });

        while ticks.len() > self.capacity {
            ticks.pop_front();
        }

        Ok(())
    }

    pub fn record_tick(&self, tick: &Tick) -> Result<(), String> {
        self.record(&tick.instrument, tick.timestamp, tick.price)
    }

    /// Last recorded price
    pub fn latest(&self, instrument: &str) -> Result<Option<f64>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data
            .get(instrument)
            .and_then(|ticks| ticks.back())
            .map(|t| t.price))
    }

    /// Most recent tick, with its timestamp
    pub fn latest_tick(&self, instrument: &str) -> Result<Option<Tick>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(instrument).and_then(|ticks| ticks.back()).cloned())
    }

    /// Latest price for every instrument that has one
    pub fn latest_prices(&self) -> Result<HashMap<String, f64>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data
            .iter()
            .filter_map(|(id, ticks)| ticks.back().map(|t| (id.clone(), t.price)))
            .collect())
    }

    /// Ticks from the last `duration`, oldest first
    pub fn window(&self, instrument: &str, duration: Duration) -> Result<Vec<Tick>, String> {
        self.window_at(instrument, duration, Utc::now())
    }

    /// Ticks with `timestamp >= now - duration`, oldest first
    pub fn window_at(
        &self,
        instrument: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Tick>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        let cutoff = now - duration;

        Ok(data
            .get(instrument)
            .map(|ticks| {
                ticks
                    .iter()
                    .filter(|t| t.timestamp >= cutoff && t.timestamp <= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Aggregate the last `lookback` of ticks into candles of `interval`.
    ///
    /// Buckets are aligned to `interval` boundaries since the Unix epoch and
    /// stamped with their end time. Buckets without ticks are skipped.
    pub fn candles_at(
        &self,
        instrument: &str,
        interval: Duration,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candle>, String> {
        let interval_ms = interval.num_milliseconds();
        if interval_ms <= 0 {
            return Err("candle interval must be positive".to_string());
        }

        let ticks = self.window_at(instrument, lookback, now)?;
        let mut candles: Vec<Candle> = Vec::new();
        let mut current_bucket: Option<i64> = None;

        for tick in ticks {
            let bucket = tick.timestamp.timestamp_millis().div_euclid(interval_ms);

            match (current_bucket, candles.last_mut()) {
                (Some(b), Some(candle)) if b == bucket => {
                    candle.high = candle.high.max(tick.price);
                    candle.low = candle.low.min(tick.price);
                    candle.close = tick.price;
                }
                _ => {
                    let end_ms = (bucket + 1) * interval_ms;
                    let timestamp = DateTime::<Utc>::from_timestamp_millis(end_ms)
                        .ok_or_else(|| format!("candle timestamp out of range: {end_ms}"))?;
                    candles.push(Candle {
                        instrument: instrument.to_string(),
                        timestamp,
                        open: tick.price,
                        high: tick.price,
                        low: tick.price,
                        close: tick.price,
                    });
                    current_bucket = Some(bucket);
                }
            }
        }

        Ok(candles)
    }

    /// Number of ticks held for an instrument
    pub fn tick_count(&self, instrument: &str) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(instrument).map(|d| d.len()).unwrap_or(0))
    }

    /// All instruments with history
    pub fn instruments(&self) -> Result<Vec<String>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_record_and_latest() {
        let store = TickStore::new(100);
        assert_eq!(store.latest("49081").unwrap(), None);

        store.record("49081", at(0), 100.0).unwrap();
        store.record("49081", at(1), 101.5).unwrap();

        assert_eq!(store.latest("49081").unwrap(), Some(101.5));
        assert_eq!(store.tick_count("49081").unwrap(), 2);
    }

    #[test]
    fn test_ring_buffer_capacity() {
        let store = TickStore::new(5);

        for i in 0..10 {
            store.record("49081", at(i), 100.0 + i as f64).unwrap();
        }

        let ticks = store.window_at("49081", Duration::hours(1), at(10)).unwrap();
        assert_eq!(ticks.len(), 5);
        assert_eq!(ticks[0].price, 105.0);
        assert_eq!(ticks[4].price, 109.0);
    }

    #[test]
    fn test_window_filters_by_time() {
        let store = TickStore::new(100);

        for i in 0..10 {
            store.record("49081", at(i * 60), 100.0 + i as f64).unwrap();
        }

        // now = 540s, last 3 minutes → ticks at 360, 420, 480, 540
        let ticks = store
            .window_at("49081", Duration::minutes(3), at(540))
            .unwrap();
        assert_eq!(ticks.len(), 4);
        assert_eq!(ticks[0].price, 106.0);
        assert_eq!(ticks[3].price, 109.0);
    }

    #[test]
    fn test_invalid_price_refused() {
        let store = TickStore::new(100);
        assert!(store.record("49081", at(0), 0.0).is_err());
        assert!(store.record("49081", at(0), f64::NAN).is_err());
        assert_eq!(store.tick_count("49081").unwrap(), 0);
    }

    #[test]
    fn test_window_unknown_instrument_is_empty() {
        let store = TickStore::new(100);
        assert!(store
            .window_at("nope", Duration::minutes(5), at(0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_candles_aggregate_ohlc() {
        let store = TickStore::new(100);
        // First minute bucket: 100, 103, 99, 101
        store.record("X", at(0), 100.0).unwrap();
        store.record("X", at(10), 103.0).unwrap();
        store.record("X", at(20), 99.0).unwrap();
        store.record("X", at(30), 101.0).unwrap();
        // Third minute bucket (second one empty): 105
        store.record("X", at(130), 105.0).unwrap();

        let candles = store
            .candles_at("X", Duration::minutes(1), Duration::hours(1), at(140))
            .unwrap();

        assert_eq!(candles.len(), 2);
        let first = &candles[0];
        assert_eq!(first.open, 100.0);
        assert_eq!(first.high, 103.0);
        assert_eq!(first.low, 99.0);
        assert_eq!(first.close, 101.0);
        assert_eq!(candles[1].close, 105.0);
        assert!(candles[0].timestamp < candles[1].timestamp);
        assert_eq!(candles[0].timestamp.timestamp() % 60, 0);
    }

    #[test]
    fn test_latest_tick_carries_timestamp() {
        let store = TickStore::new(100);
        assert!(store.latest_tick("A").unwrap().is_none());

        store.record("A", at(0), 10.0).unwrap();
        store.record("A", at(30), 10.5).unwrap();

        let tick = store.latest_tick("A").unwrap().unwrap();
        assert_eq!(tick.timestamp, at(30));
        assert_eq!(tick.price, 10.5);
    }

    #[test]
    fn test_latest_prices() {
        let store = TickStore::new(100);
        store.record("A", at(0), 10.0).unwrap();
        store.record("B", at(0), 20.0).unwrap();
        store.record("A", at(1), 11.0).unwrap();

        let prices = store.latest_prices().unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices["A"], 11.0);
        assert_eq!(prices["B"], 20.0);
        assert_eq!(store.instruments().unwrap().len(), 2);
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let store = TickStore::new(100);
        let store_clone = store.clone();

        let handle = thread::spawn(move || {
            for i in 0..50 {
                store_clone.record("X", at(i), 100.0 + i as f64).unwrap();
            }
        });

        for i in 50..100 {
            store.record("X", at(i), 100.0 + i as f64).unwrap();
        }

        handle.join().unwrap();
        assert_eq!(store.tick_count("X").unwrap(), 100);
    }
}
