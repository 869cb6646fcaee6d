use super::moving_average::calculate_ema_series;

/// Latest MACD readings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD line = EMA(fast) - EMA(slow), signal = EMA(signal_period) of the MACD
/// line, histogram = MACD - signal.
pub fn calculate_macd(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<Macd> {
    if prices.is_empty() || fast == 0 || slow <= fast || signal_period == 0 {
        return None;
    }

    let fast_ema = calculate_ema_series(prices, fast);
    let slow_ema = calculate_ema_series(prices, slow);
    let macd_line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_line = calculate_ema_series(&macd_line, signal_period);

    let macd = *macd_line.last()?;
    let signal = *signal_line.last()?;

    Some(Macd {
        macd,
        signal,
        histogram: macd - signal,
    })
}
