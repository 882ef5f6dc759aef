use super::moving_average::calculate_ema_series;

/// Bars required before a MACD histogram with these periods is defined
pub fn macd_min_bars(slow: usize, signal: usize) -> usize {
    slow + signal - 1
}

/// MACD histogram: (fast EMA - slow EMA) minus its own signal EMA.
///
/// Positive values mean the MACD line sits above its signal line, i.e.
/// momentum is improving.
pub fn calculate_macd_histogram(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<f64> {
    if fast == 0 || signal == 0 || fast >= slow {
        return None;
    }

    let fast_series = calculate_ema_series(prices, fast)?;
    let slow_series = calculate_ema_series(prices, slow)?;

    // Both series end at the latest bar; align on the shorter (slow) one
    let len = slow_series.len();
    if fast_series.len() < len {
        return None;
    }
    let macd_line: Vec<f64> = fast_series[fast_series.len() - len..]
        .iter()
        .zip(slow_series.iter())
        .map(|(fast_ema, slow_ema)| fast_ema - slow_ema)
        .collect();

    let signal_series = calculate_ema_series(&macd_line, signal)?;

    let macd = macd_line.last()?;
    let signal_value = signal_series.last()?;
    Some(macd - signal_value)
}
