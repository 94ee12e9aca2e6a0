//! ROC (Rate of Change).
//!
//! ROC(n)[i] = ((C[i] - C[i-n]) / C[i-n]) * 100, or 0 when C[i-n] == 0.
//! Warmup: first n bars invalid.

use crate::domain::bar::Bar;
use crate::domain::indicator::{IndicatorPoint, IndicatorSeries, IndicatorType, IndicatorValue};

pub fn calculate_roc(bars: &[Bar], period: usize) -> IndicatorSeries {
    let values = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            let valid = period > 0 && i >= period;
            let value = if valid {
                let prev_close = bars[i - period].close;
                if prev_close == 0.0 {
                    0.0
                } else {
                    ((bar.close - prev_close) / prev_close) * 100.0
                }
            } else {
                0.0
            };
            IndicatorPoint {
                timestamp: bar.timestamp,
                valid,
                value: IndicatorValue::Simple(value),
            }
        })
        .collect();

    IndicatorSeries {
        indicator_type: IndicatorType::Roc(period),
        values,
    }
}
