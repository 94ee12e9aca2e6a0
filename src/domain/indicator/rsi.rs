//! RSI (Relative Strength Index) with Wilder's smoothing.
//!
//! - First average: simple mean of gains/losses over first n changes
//! - Subsequent: avg = (prev_avg * (n-1) + current) / n
//!
//! RSI = 100 - (100 / (1 + avg_gain / avg_loss)), or 100 when avg_loss == 0.
//! A window with no price changes reads 50.
//! Warmup: first n bars are invalid.

use crate::domain::bar::Bar;
use crate::domain::indicator::{IndicatorPoint, IndicatorSeries, IndicatorType, IndicatorValue};

fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_gain == 0.0 && avg_loss == 0.0 {
        // no movement at all
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - (100.0 / (1.0 + avg_gain / avg_loss))
    }
}

pub fn calculate_rsi(bars: &[Bar], period: usize) -> IndicatorSeries {
    if period == 0 || bars.len() < 2 {
        let values = bars
            .iter()
            .map(|b| IndicatorPoint {
                timestamp: b.timestamp,
                valid: false,
                value: IndicatorValue::Simple(0.0),
            })
            .collect();

        return IndicatorSeries {
            indicator_type: IndicatorType::Rsi(period),
            values,
        };
    }

    let mut values = Vec::with_capacity(bars.len());
    values.push(IndicatorPoint {
        timestamp: bars[0].timestamp,
        valid: false,
        value: IndicatorValue::Simple(0.0),
    });

    let (gains, losses): (Vec<f64>, Vec<f64>) = bars
        .windows(2)
        .map(|w| {
            let change = w[1].close - w[0].close;
            (change.max(0.0), (-change).max(0.0))
        })
        .unzip();

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for (i, bar) in bars.iter().enumerate().skip(1) {
        let idx = i - 1;

        if idx < period - 1 {
            values.push(IndicatorPoint {
                timestamp: bar.timestamp,
                valid: false,
                value: IndicatorValue::Simple(0.0),
            });
            continue;
        }

        if idx == period - 1 {
            avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
            avg_loss = losses[..period].iter().sum::<f64>() / period as f64;
        } else {
            avg_gain = (avg_gain * (period - 1) as f64 + gains[idx]) / period as f64;
            avg_loss = (avg_loss * (period - 1) as f64 + losses[idx]) / period as f64;
        }

        values.push(IndicatorPoint {
            timestamp: bar.timestamp,
            valid: true,
            value: IndicatorValue::Simple(rsi_from(avg_gain, avg_loss)),
        });
    }

    IndicatorSeries {
        indicator_type: IndicatorType::Rsi(period),
        values,
    }
}
