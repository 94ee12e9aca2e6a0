//! MACD (Moving Average Convergence Divergence).
//!
//! MACD Line = EMA(fast) - EMA(slow)
//! Signal Line = EMA(signal) of MACD Line, seeded with the SMA of its first window
//! Histogram = MACD Line - Signal Line
//!
//! Warmup: max(fast, slow) - 1 + signal - 1 bars.

use crate::domain::bar::Bar;
use crate::domain::indicator::{
    IndicatorPoint, IndicatorSeries, IndicatorType, IndicatorValue, calculate_ema,
};

pub const DEFAULT_FAST: usize = 12;
pub const DEFAULT_SLOW: usize = 26;
pub const DEFAULT_SIGNAL: usize = 9;

pub fn calculate_macd(
    bars: &[Bar],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> IndicatorSeries {
    let indicator_type = IndicatorType::Macd {
        fast,
        slow,
        signal: signal_period,
    };
    if bars.is_empty() || fast == 0 || slow == 0 || signal_period == 0 {
        return IndicatorSeries {
            indicator_type,
            values: Vec::new(),
        };
    }

    let ema_fast = ema_raw_values(bars, fast);
    let ema_slow = ema_raw_values(bars, slow);
    let macd_line: Vec<f64> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| f - s)
        .collect();

    let k = 2.0 / (signal_period as f64 + 1.0);
    let mut signal_line = vec![0.0; bars.len()];
    let macd_warmup = fast.max(slow) - 1;

    if macd_warmup + signal_period <= bars.len() {
        let seed: f64 = macd_line[macd_warmup..macd_warmup + signal_period]
            .iter()
            .sum::<f64>()
            / signal_period as f64;
        let mut signal_ema = seed;
        signal_line[macd_warmup + signal_period - 1] = signal_ema;

        for i in (macd_warmup + signal_period)..bars.len() {
            signal_ema = macd_line[i] * k + signal_ema * (1.0 - k);
            signal_line[i] = signal_ema;
        }
    }

    let signal_warmup = macd_warmup + signal_period - 1;

    let values = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| IndicatorPoint {
            timestamp: bar.timestamp,
            valid: i >= signal_warmup,
            value: IndicatorValue::Macd {
                line: macd_line[i],
                signal: signal_line[i],
                histogram: macd_line[i] - signal_line[i],
            },
        })
        .collect();

    IndicatorSeries {
        indicator_type,
        values,
    }
}

/// Raw EMA values, 0.0 for warmup bars.
fn ema_raw_values(bars: &[Bar], period: usize) -> Vec<f64> {
    calculate_ema(bars, period)
        .values
        .iter()
        .map(|p| p.value.scalar())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_bars::from_closes;

    #[test]
    fn macd_warmup_default() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let series = calculate_macd(
            &from_closes(&closes),
            DEFAULT_FAST,
            DEFAULT_SLOW,
            DEFAULT_SIGNAL,
        );
        assert_eq!(series.values.len(), 40);
        assert!(!series.values[32].valid);
        assert!(series.values[33].valid);
    }

    #[test]
    fn macd_flat_prices_are_zero() {
        let closes = vec![50.0; 40];
        let series = calculate_macd(&from_closes(&closes), 3, 6, 3);
        match series.latest().unwrap() {
            IndicatorValue::Macd {
                line,
                signal,
                histogram,
            } => {
                assert!(line.abs() < 1e-12);
                assert!(signal.abs() < 1e-12);
                assert!(histogram.abs() < 1e-12);
            }
            other => panic!("expected MACD value, got {other:?}"),
        }
    }

    #[test]
    fn macd_accelerating_uptrend_has_positive_histogram() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i * i) as f64 * 0.1).collect();
        let series = calculate_macd(&from_closes(&closes), 3, 6, 3);
        assert!(series.latest().unwrap().scalar() > 0.0);
    }
}
