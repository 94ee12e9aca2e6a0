//! Technical indicator implementations feeding the signal engine.
//!
//! - `IndicatorPoint`: a single point in an indicator time series
//! - `IndicatorValue`: enum for different indicator output shapes
//! - `IndicatorType`: indicator identity + parameters
//! - `IndicatorSeries`: a time series of indicator values

pub mod atr;
pub mod ema;
pub mod macd;
pub mod roc;
pub mod rsi;

pub use atr::calculate_atr;
pub use ema::calculate_ema;
pub use macd::calculate_macd;
pub use roc::calculate_roc;
pub use rsi::calculate_rsi;

use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorPoint {
    pub timestamp: DateTime<Utc>,
    pub valid: bool,
    pub value: IndicatorValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorValue {
    Simple(f64),
    Macd {
        line: f64,
        signal: f64,
        histogram: f64,
    },
}

impl IndicatorValue {
    /// Scalar view: the value itself, or the histogram for MACD.
    pub fn scalar(&self) -> f64 {
        match self {
            IndicatorValue::Simple(v) => *v,
            IndicatorValue::Macd { histogram, .. } => *histogram,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndicatorType {
    Ema(usize),
    Rsi(usize),
    Roc(usize),
    Atr(usize),
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
    },
}

impl IndicatorType {
    /// Number of bars needed before the first valid point.
    pub fn lookback(&self) -> usize {
        match self {
            IndicatorType::Ema(period) | IndicatorType::Atr(period) => *period,
            IndicatorType::Rsi(period) | IndicatorType::Roc(period) => period + 1,
            IndicatorType::Macd { fast, slow, signal } => (*fast).max(*slow) + signal - 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSeries {
    pub indicator_type: IndicatorType,
    pub values: Vec<IndicatorPoint>,
}

impl IndicatorSeries {
    /// The most recent point, if it is past warmup.
    pub fn latest(&self) -> Option<IndicatorValue> {
        self.values.last().filter(|p| p.valid).map(|p| p.value)
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorType::Ema(period) => write!(f, "EMA({})", period),
            IndicatorType::Rsi(period) => write!(f, "RSI({})", period),
            IndicatorType::Roc(period) => write!(f, "ROC({})", period),
            IndicatorType::Atr(period) => write!(f, "ATR({})", period),
            IndicatorType::Macd { fast, slow, signal } => {
                write!(f, "MACD({},{},{})", fast, slow, signal)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicator_type_display_macd() {
        let macd = IndicatorType::Macd {
            fast: 12,
            slow: 26,
            signal: 9,
        };
        assert_eq!(macd.to_string(), "MACD(12,26,9)");
        assert_eq!(IndicatorType::Rsi(14).to_string(), "RSI(14)");
    }

    #[test]
    fn lookback_matches_warmup() {
        assert_eq!(IndicatorType::Ema(20).lookback(), 20);
        assert_eq!(IndicatorType::Rsi(14).lookback(), 15);
        assert_eq!(
            IndicatorType::Macd {
                fast: 12,
                slow: 26,
                signal: 9
            }
            .lookback(),
            34
        );
    }

    #[test]
    fn latest_skips_warmup() {
        let bars = test_bars::from_closes(&[1.0, 2.0]);
        let series = calculate_ema(&bars, 3);
        assert_eq!(series.latest(), None);

        let bars = test_bars::from_closes(&[1.0, 2.0, 3.0]);
        let series = calculate_ema(&bars, 3);
        assert_eq!(series.latest(), Some(IndicatorValue::Simple(2.0)));
    }

    #[test]
    fn scalar_of_macd_is_histogram() {
        let v = IndicatorValue::Macd {
            line: 1.0,
            signal: 0.25,
            histogram: 0.75,
        };
        assert_eq!(v.scalar(), 0.75);
    }
}
