use super::TickStore;
use crate::api::DhanClient;
use crate::config::TradingWindow;
use crate::models::{Instrument, Tick};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Keeps the tick store populated: stream ingest, startup warm-up from the
/// chart endpoint and a REST quote fallback for instruments whose last tick
/// is missing or older than `stale_after`.
pub struct PriceFeedManager {
    client: DhanClient,
    store: TickStore,
    window: TradingWindow,
    candle_interval_minutes: u32,
    stale_after: Duration,
}

impl PriceFeedManager {
    pub fn new(
        client: DhanClient,
        store: TickStore,
        window: TradingWindow,
        candle_interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            window,
            candle_interval_minutes: candle_interval.num_minutes().max(1) as u32,
            stale_after: Duration::seconds(60),
        }
    }

    /// Age past which a stored price is refreshed from the quote endpoint
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn store(&self) -> &TickStore {
        &self.store
    }

    /// Drain stream ticks into the store until the sender side closes.
    /// Returns the number of ticks recorded.
    pub fn spawn_ingest(store: TickStore, mut ticks: mpsc::Receiver<Tick>) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut recorded = 0usize;
            while let Some(tick) = ticks.recv().await {
                match store.record_tick(&tick) {
                    Ok(()) => recorded += 1,
                    Err(e) => tracing::error!("Failed to record tick for {}: {}", tick.instrument, e),
                }
            }
            tracing::debug!("Tick ingest finished after {} ticks", recorded);
            recorded
        })
    }

    /// Seed history with intraday candles covering `lookback` before `now`.
    ///
    /// Each candle close is recorded as a tick inside its own candle window.
    /// Failures are logged and skipped. Returns the number of ticks recorded.
    pub async fn warm_up(&self, instruments: &[Instrument], lookback: Duration, now: DateTime<Utc>) -> usize {
        let to = now.with_timezone(&self.window.offset()).naive_local();
        let from = to - lookback;
        let mut total = 0;

        for instrument in instruments {
            match self
                .client
                .get_intraday_candles(instrument, self.candle_interval_minutes, from, to)
                .await
            {
                Ok(candles) => {
                    let mut recorded = 0;
                    for candle in candles.iter().filter(|c| c.timestamp <= now) {
                        let at = candle.timestamp - Duration::seconds(1);
                        match self.store.record(&instrument.security_id, at, candle.close) {
                            Ok(()) => recorded += 1,
                            Err(e) => tracing::error!("Warm-up record failed: {}", e),
                        }
                    }
                    tracing::info!(
                        "🔥 Warmed up {} with {} candles",
                        instrument.security_id,
                        recorded
                    );
                    total += recorded;
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️  Warm-up failed for {}: {} (will build history from the stream)",
                        instrument.security_id,
                        e
                    );
                }
            }
        }

        total
    }

    /// Latest price for each instrument, asking the quote endpoint for any
    /// the store has no fresh price for. Fetched quotes are recorded at `now`.
    /// If the fallback fails a stale price is still returned.
    pub async fn latest_prices(
        &self,
        instruments: &[Instrument],
        now: DateTime<Utc>,
    ) -> HashMap<String, f64> {
        let mut prices = match self.store.latest_prices() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Failed to read tick store: {}", e);
                HashMap::new()
            }
        };

        let cutoff = now - self.stale_after;
        let missing: Vec<Instrument> = instruments
            .iter()
            .filter(|i| match self.store.latest_tick(&i.security_id) {
                Ok(Some(tick)) => tick.timestamp < cutoff,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!("Failed to read tick store: {}", e);
                    true
                }
            })
            .cloned()
            .collect();

        if missing.is_empty() {
            return prices;
        }
        tracing::debug!("Refreshing {} stale or unpriced instruments", missing.len());

        match self.client.get_ltp(&missing).await {
            Ok(quotes) => {
                for (id, price) in quotes {
                    if !(price.is_finite() && price > 0.0) {
                        continue;
                    }
                    if let Err(e) = self.store.record(&id, now, price) {
                        tracing::error!("Failed to record quote for {}: {}", id, e);
                    }
                    prices.insert(id, price);
                }
            }
            Err(e) => {
                tracing::warn!("Quote fallback failed for {} instruments: {}", missing.len(), e);
            }
        }

        prices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_ingest_records_until_sender_drops() {
        let store = TickStore::new(100);
        let (tx, rx) = mpsc::channel(8);
        let handle = PriceFeedManager::spawn_ingest(store.clone(), rx);

        for i in 0..5 {
            tx.send(Tick {
                instrument: "49081".to_string(),
                timestamp: Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap(),
                price: 100.0 + i as f64,
            })
            .await
            .unwrap();
        }
        drop(tx);

        assert_eq!(handle.await.unwrap(), 5);
        assert_eq!(store.latest("49081").unwrap(), Some(104.0));
    }
}
