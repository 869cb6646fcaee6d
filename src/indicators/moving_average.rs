/// Exponential Moving Average over the whole series.
///
/// Seeded with the first price and updated recursively with
/// `alpha = 2 / (period + 1)`, so `out[i]` is the EMA as of `prices[i]`.
/// A period of 1 reproduces the input.
pub fn calculate_ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() || period == 0 {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut series = Vec::with_capacity(prices.len());
    let mut ema = prices[0];
    series.push(ema);

    for price in &prices[1..] {
        ema = (price - ema) * alpha + ema;
        series.push(ema);
    }

    series
}

/// Latest EMA value
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    calculate_ema_series(prices, period).last().copied()
}
