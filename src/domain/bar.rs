//! OHLCV bar representation.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }

    pub fn window(&self) -> PriceWindow {
        PriceWindow {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

/// Price range observed during one evaluation window, used for stop-loss and
/// take-profit crossing checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceWindow {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl PriceWindow {
    /// A window where a single quote is the whole range.
    pub fn at(price: f64) -> Self {
        PriceWindow {
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }
}
