//! Signal engine: turns a bar window into a scored, biased snapshot.
//!
//! Four indicators vote in {-1, 0, +1}:
//! - trend: EMA(fast) above/below EMA(slow)
//! - momentum: RSI outside the `50 ± rsi_band` dead zone
//! - macd: sign of the MACD histogram
//! - rate of change: ROC beyond `± roc_threshold` percent
//!
//! `score = Σ weight × vote`. Confidence is the share of indicators whose vote
//! agrees with the sign of the score. The engine is a pure function of its input
//! window; the snapshot timestamp is taken from the last bar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::domain::bar::Bar;
use crate::domain::error::SigtraderError;
use crate::domain::indicator::{
    IndicatorType, calculate_atr, calculate_ema, calculate_macd, calculate_roc, calculate_rsi,
};

const INDICATOR_COUNT: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bias::Bullish => "bullish",
            Bias::Bearish => "bearish",
            Bias::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bias {
    type Err = SigtraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bullish" => Ok(Bias::Bullish),
            "bearish" => Ok(Bias::Bearish),
            "neutral" => Ok(Bias::Neutral),
            other => Err(SigtraderError::InvalidData {
                reason: format!("unknown bias '{other}'"),
            }),
        }
    }
}

/// Generic audit value for the name → value view of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Text(String),
}

/// Individual indicator votes, each in {-1, 0, +1}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Votes {
    pub trend: i8,
    pub momentum: i8,
    pub macd: i8,
    pub rate_of_change: i8,
}

impl Votes {
    fn as_array(&self) -> [i8; 4] {
        [self.trend, self.momentum, self.macd, self.rate_of_change]
    }
}

/// Typed readings behind a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorReadings {
    pub close: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    pub macd_histogram: f64,
    pub roc: f64,
    pub atr: f64,
    pub swing_low: f64,
    pub swing_high: f64,
    pub votes: Votes,
}

impl IndicatorReadings {
    /// Flattened view for audit logs and display.
    pub fn to_signal_map(&self) -> BTreeMap<String, SignalValue> {
        let mut map = BTreeMap::new();
        let numbers = [
            ("close", self.close),
            ("ema_fast", self.ema_fast),
            ("ema_slow", self.ema_slow),
            ("rsi", self.rsi),
            ("macd_histogram", self.macd_histogram),
            ("roc", self.roc),
            ("atr", self.atr),
            ("swing_low", self.swing_low),
            ("swing_high", self.swing_high),
        ];
        for (name, value) in numbers {
            map.insert(name.to_string(), SignalValue::Number(value));
        }
        let votes = [
            ("vote_trend", self.votes.trend),
            ("vote_momentum", self.votes.momentum),
            ("vote_macd", self.votes.macd),
            ("vote_roc", self.votes.rate_of_change),
        ];
        for (name, vote) in votes {
            map.insert(name.to_string(), SignalValue::Number(f64::from(vote)));
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub readings: Option<IndicatorReadings>,
    pub score: f64,
    pub confidence: f64,
    pub bias: Bias,
    pub should_trade: bool,
}

impl SignalSnapshot {
    /// Neutral, no-trade snapshot used when the window can't support a signal.
    pub fn neutral(symbol: &str, timestamp: DateTime<Utc>) -> Self {
        SignalSnapshot {
            symbol: symbol.to_string(),
            timestamp,
            readings: None,
            score: 0.0,
            confidence: 0.0,
            bias: Bias::Neutral,
            should_trade: false,
        }
    }

    pub fn signal_map(&self) -> BTreeMap<String, SignalValue> {
        match &self.readings {
            Some(readings) => readings.to_signal_map(),
            None => {
                let mut map = BTreeMap::new();
                map.insert(
                    "status".to_string(),
                    SignalValue::Text("insufficient_history".to_string()),
                );
                map
            }
        }
    }

    /// Swing level on the protective side of a position in the direction of the bias.
    pub fn structural_level(&self) -> Option<f64> {
        let readings = self.readings.as_ref()?;
        match self.bias {
            Bias::Bullish => Some(readings.swing_low),
            Bias::Bearish => Some(readings.swing_high),
            Bias::Neutral => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalWeights {
    pub trend: f64,
    pub momentum: f64,
    pub macd: f64,
    pub rate_of_change: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        SignalWeights {
            trend: 1.0,
            momentum: 1.0,
            macd: 1.0,
            rate_of_change: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalConfig {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    pub rsi_band: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub roc_period: usize,
    pub roc_threshold: f64,
    pub atr_period: usize,
    pub swing_lookback: usize,
    pub weights: SignalWeights,
    pub neutral_band: f64,
    pub min_score: f64,
    pub min_confidence: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            ema_fast: 12,
            ema_slow: 26,
            rsi_period: 14,
            rsi_band: 5.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            roc_period: 10,
            roc_threshold: 0.0,
            atr_period: 14,
            swing_lookback: 20,
            weights: SignalWeights::default(),
            neutral_band: 0.5,
            min_score: 2.0,
            min_confidence: 0.6,
        }
    }
}

pub struct SignalEngine {
    config: SignalConfig,
}

impl SignalEngine {
    pub fn new(config: SignalConfig) -> Self {
        SignalEngine { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Bars required before any snapshot can carry a signal.
    pub fn required_history(&self) -> usize {
        let c = &self.config;
        [
            IndicatorType::Ema(c.ema_fast),
            IndicatorType::Ema(c.ema_slow),
            IndicatorType::Rsi(c.rsi_period),
            IndicatorType::Macd {
                fast: c.macd_fast,
                slow: c.macd_slow,
                signal: c.macd_signal,
            },
            IndicatorType::Roc(c.roc_period),
            IndicatorType::Atr(c.atr_period),
        ]
        .iter()
        .map(IndicatorType::lookback)
        .chain(std::iter::once(c.swing_lookback))
        .max()
        .unwrap_or(0)
        .max(1)
    }

    pub fn compute(&self, symbol: &str, bars: &[Bar]) -> SignalSnapshot {
        let timestamp = bars.last().map(|b| b.timestamp).unwrap_or_default();

        if bars.len() < self.required_history() || !window_is_sane(bars) {
            return SignalSnapshot::neutral(symbol, timestamp);
        }

        let Some(readings) = self.read_indicators(bars) else {
            return SignalSnapshot::neutral(symbol, timestamp);
        };

        let w = &self.config.weights;
        let v = readings.votes;
        let score = w.trend * f64::from(v.trend)
            + w.momentum * f64::from(v.momentum)
            + w.macd * f64::from(v.macd)
            + w.rate_of_change * f64::from(v.rate_of_change);

        let confidence = agreement(&v, score);

        let bias = if score > self.config.neutral_band {
            Bias::Bullish
        } else if score < -self.config.neutral_band {
            Bias::Bearish
        } else {
            Bias::Neutral
        };

        let should_trade = bias != Bias::Neutral
            && score.abs() >= self.config.min_score
            && confidence >= self.config.min_confidence;

        SignalSnapshot {
            symbol: symbol.to_string(),
            timestamp,
            readings: Some(readings),
            score,
            confidence,
            bias,
            should_trade,
        }
    }

    fn read_indicators(&self, bars: &[Bar]) -> Option<IndicatorReadings> {
        let c = &self.config;
        let close = bars.last()?.close;

        let ema_fast = calculate_ema(bars, c.ema_fast).latest()?.scalar();
        let ema_slow = calculate_ema(bars, c.ema_slow).latest()?.scalar();
        let rsi = calculate_rsi(bars, c.rsi_period).latest()?.scalar();
        let macd_histogram = calculate_macd(bars, c.macd_fast, c.macd_slow, c.macd_signal)
            .latest()?
            .scalar();
        let roc = calculate_roc(bars, c.roc_period).latest()?.scalar();
        let atr = calculate_atr(bars, c.atr_period).latest()?.scalar();

        let swing = &bars[bars.len().saturating_sub(c.swing_lookback)..];
        let swing_low = swing.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let swing_high = swing.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);

        let votes = Votes {
            trend: sign_beyond(ema_fast - ema_slow, 0.0),
            momentum: sign_beyond(rsi - 50.0, c.rsi_band),
            macd: sign_beyond(macd_histogram, 0.0),
            rate_of_change: sign_beyond(roc, c.roc_threshold),
        };

        Some(IndicatorReadings {
            close,
            ema_fast,
            ema_slow,
            rsi,
            macd_histogram,
            roc,
            atr,
            swing_low,
            swing_high,
            votes,
        })
    }
}

fn sign_beyond(value: f64, band: f64) -> i8 {
    if value > band {
        1
    } else if value < -band {
        -1
    } else {
        0
    }
}

fn agreement(votes: &Votes, score: f64) -> f64 {
    if score == 0.0 {
        return 0.0;
    }
    let direction: i8 = if score > 0.0 { 1 } else { -1 };
    let agreeing = votes
        .as_array()
        .iter()
        .filter(|&&vote| vote == direction)
        .count();
    (agreeing as f64 / INDICATOR_COUNT).clamp(0.0, 1.0)
}

fn window_is_sane(bars: &[Bar]) -> bool {
    bars.iter().all(|b| {
        [b.open, b.high, b.low, b.close]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
    })
}
