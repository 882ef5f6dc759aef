/// Calculate Relative Strength Index (RSI)
///
/// Uses Wilder's smoothing: the first `period` price changes seed the
/// average gain/loss, every later change is blended in with weight
/// 1/period.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    let (seed, rest) = changes.split_at(period);

    let mut avg_gain = seed.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = seed.iter().filter(|c| **c < 0.0).map(|c| c.abs()).sum::<f64>()
        / period as f64;

    for change in rest {
        let (gain, loss) = if *change > 0.0 {
            (*change, 0.0)
        } else {
            (0.0, change.abs())
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_bounded() {
        let prices = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0, 46.5,
        ];

        let rsi = calculate_rsi(&prices, 14).unwrap();
        assert!(rsi > 0.0 && rsi < 100.0);
        // Mostly gains in this series
        assert!(rsi > 50.0);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let prices = vec![100.0, 102.0, 101.0];
        assert!(calculate_rsi(&prices, 14).is_none());
    }

    #[test]
    fn test_rsi_all_gains() {
        let prices = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(100.0));
    }

    #[test]
    fn test_rsi_steady_decline_is_oversold() {
        let prices: Vec<f64> = (0..30).map(|i| 100.0 - i as f64 * 0.5).collect();
        let rsi = calculate_rsi(&prices, 14).unwrap();
        assert!(rsi < 30.0);
    }

    #[test]
    fn test_rsi_smoothing_remembers_old_moves() {
        // One huge drop, a long flat stretch, then a tiny gain. A plain
        // last-14 average would read RSI 100; Wilder's smoothing still
        // carries the drop and stays oversold.
        let mut prices = vec![100.0, 50.0];
        prices.extend(std::iter::repeat(50.0).take(40));
        prices.push(50.5);

        let rsi = calculate_rsi(&prices, 14).unwrap();
        assert!(rsi < 30.0);
    }
}
