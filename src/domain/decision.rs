//! Decision gate: thresholds and the single-position-per-symbol policy.

use crate::domain::bar::PriceWindow;
use crate::domain::signal::SignalSnapshot;
use crate::domain::trade::{ExitReason, Side, TieBreak, Trade};

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub min_confidence: f64,
    pub min_score: f64,
    pub max_open_positions: usize,
    pub allow_shorting: bool,
    pub close_on_reversal: bool,
    pub tie_break: TieBreak,
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            min_confidence: 0.6,
            min_score: 2.0,
            max_open_positions: 5,
            allow_shorting: false,
            close_on_reversal: true,
            tie_break: TieBreak::StopLossFirst,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    SignalNotTradeable,
    BelowConfidence,
    BelowScore,
    MaxPositions,
    ShortingDisabled,
    HoldingPosition,
    NoPrice,
    /// The latest bar was already evaluated, or is the bar the open trade
    /// entered on.
    BarAlreadyEvaluated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NoOp(NoOpReason),
    OpenCandidate { side: Side },
    CloseCandidate { reason: ExitReason, exit_price: f64 },
}

pub struct DecisionGate {
    config: GateConfig,
}

impl DecisionGate {
    pub fn new(config: GateConfig) -> Self {
        DecisionGate { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// With an open trade only exits are considered; otherwise entry thresholds
    /// and the book-wide position cap apply.
    pub fn evaluate(
        &self,
        snapshot: &SignalSnapshot,
        open_trade: Option<&Trade>,
        open_positions: usize,
        window: Option<&PriceWindow>,
    ) -> Decision {
        match open_trade {
            Some(trade) => self.evaluate_exit(snapshot, trade, window),
            None => self.evaluate_entry(snapshot, open_positions, window),
        }
    }

    fn evaluate_exit(
        &self,
        snapshot: &SignalSnapshot,
        trade: &Trade,
        window: Option<&PriceWindow>,
    ) -> Decision {
        let Some(window) = window else {
            return Decision::NoOp(NoOpReason::NoPrice);
        };

        if let Some((reason, exit_price)) = trade.exit_trigger(window, self.config.tie_break) {
            return Decision::CloseCandidate { reason, exit_price };
        }

        if self.config.close_on_reversal
            && snapshot.should_trade
            && snapshot.bias == trade.side().opposing_bias()
        {
            return Decision::CloseCandidate {
                reason: ExitReason::SignalReversal,
                exit_price: window.close,
            };
        }

        Decision::NoOp(NoOpReason::HoldingPosition)
    }

    fn evaluate_entry(
        &self,
        snapshot: &SignalSnapshot,
        open_positions: usize,
        window: Option<&PriceWindow>,
    ) -> Decision {
        if !snapshot.should_trade {
            return Decision::NoOp(NoOpReason::SignalNotTradeable);
        }
        if snapshot.confidence < self.config.min_confidence {
            return Decision::NoOp(NoOpReason::BelowConfidence);
        }
        if snapshot.score.abs() < self.config.min_score {
            return Decision::NoOp(NoOpReason::BelowScore);
        }
        if open_positions >= self.config.max_open_positions {
            return Decision::NoOp(NoOpReason::MaxPositions);
        }
        if window.is_none() {
            return Decision::NoOp(NoOpReason::NoPrice);
        }
        match Side::from_bias(snapshot.bias) {
            Some(Side::Short) if !self.config.allow_shorting => {
                Decision::NoOp(NoOpReason::ShortingDisabled)
            }
            Some(side) => Decision::OpenCandidate { side },
            None => Decision::NoOp(NoOpReason::SignalNotTradeable),
        }
    }
}
