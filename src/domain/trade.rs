//! Trade records and the open → closed state machine.
//!
//! A trade is created open with immutable stop-loss and take-profit levels. It
//! becomes closed exactly once, when a [`TradeClosure`] is attached; the closure
//! carries exit price, pnl, r-multiple and close time together, so a trade can
//! never hold some of them without the others.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::domain::bar::PriceWindow;
use crate::domain::error::SigtraderError;
use crate::domain::signal::{Bias, SignalValue};

pub const CHECKLIST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn from_bias(bias: Bias) -> Option<Side> {
        match bias {
            Bias::Bullish => Some(Side::Long),
            Bias::Bearish => Some(Side::Short),
            Bias::Neutral => None,
        }
    }

    /// The bias that argues against holding this side.
    pub fn opposing_bias(&self) -> Bias {
        match self {
            Side::Long => Bias::Bearish,
            Side::Short => Bias::Bullish,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = SigtraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(SigtraderError::InvalidData {
                reason: format!("unknown side '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = SigtraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TradeStatus::Open),
            "closed" => Ok(TradeStatus::Closed),
            other => Err(SigtraderError::InvalidData {
                reason: format!("unknown trade status '{other}'"),
            }),
        }
    }
}

/// Which level wins when stop-loss and take-profit are both crossed in one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    #[default]
    StopLossFirst,
    TakeProfitFirst,
}

impl FromStr for TieBreak {
    type Err = SigtraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(TieBreak::StopLossFirst),
            "take_profit" => Ok(TieBreak::TakeProfitFirst),
            other => Err(SigtraderError::InvalidData {
                reason: format!("unknown tie break '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    SignalReversal,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::SignalReversal => "signal_reversal",
            ExitReason::Manual => "manual",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which limit capped the position size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingConstraint {
    Risk,
    Cash,
}

/// Audit record of the inputs behind an entry decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checklist {
    pub version: u32,
    pub score: f64,
    pub confidence: f64,
    pub bias: Bias,
    pub reference_price: f64,
    pub equity: f64,
    pub cash: f64,
    pub risk_fraction: f64,
    pub reward_risk: f64,
    pub stop_distance: f64,
    pub structural_level: Option<f64>,
    pub binding: BindingConstraint,
    pub signals: BTreeMap<String, SignalValue>,
    /// Timestamp of the bar the entry was decided on. Exits are only checked
    /// on later bars.
    #[serde(default)]
    pub bar_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeClosure {
    pub exit_price: f64,
    pub pnl: f64,
    pub r_multiple: f64,
    pub closed_at: DateTime<Utc>,
}

/// Everything needed to create an open trade.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: f64,
    pub opened_at: DateTime<Utc>,
    pub checklist: Checklist,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    id: i64,
    symbol: String,
    side: Side,
    quantity: f64,
    entry_price: f64,
    stop_loss: f64,
    take_profit: f64,
    confidence: f64,
    opened_at: DateTime<Utc>,
    checklist: Checklist,
    closure: Option<TradeClosure>,
}

/// (exit - entry) × qty × side sign
pub fn realized_pnl(side: Side, entry: f64, exit: f64, quantity: f64) -> f64 {
    (exit - entry) * quantity * side.sign()
}

/// pnl / (|entry - stop| × qty); zero when the initial risk is zero.
pub fn r_multiple(pnl: f64, entry: f64, stop_loss: f64, quantity: f64) -> f64 {
    let risk = (entry - stop_loss).abs() * quantity;
    if risk == 0.0 { 0.0 } else { pnl / risk }
}

impl Trade {
    pub fn open(id: i64, new: NewTrade) -> Result<Self, SigtraderError> {
        if new.quantity.is_nan() || new.quantity <= 0.0 {
            return Err(SigtraderError::Invariant {
                reason: format!("trade quantity must be positive, got {}", new.quantity),
            });
        }
        if !(0.0..=1.0).contains(&new.confidence) {
            return Err(SigtraderError::Invariant {
                reason: format!("confidence {} outside [0, 1]", new.confidence),
            });
        }
        Ok(Trade {
            id,
            symbol: new.symbol,
            side: new.side,
            quantity: new.quantity,
            entry_price: new.entry_price,
            stop_loss: new.stop_loss,
            take_profit: new.take_profit,
            confidence: new.confidence,
            opened_at: new.opened_at,
            checklist: new.checklist,
            closure: None,
        })
    }

    /// Rebuild a trade read back from storage.
    pub fn restore(
        id: i64,
        new: NewTrade,
        closure: Option<TradeClosure>,
    ) -> Result<Self, SigtraderError> {
        let mut trade = Trade::open(id, new)?;
        trade.closure = closure;
        Ok(trade)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn entry_price(&self) -> f64 {
        self.entry_price
    }

    pub fn stop_loss(&self) -> f64 {
        self.stop_loss
    }

    pub fn take_profit(&self) -> f64 {
        self.take_profit
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn checklist(&self) -> &Checklist {
        &self.checklist
    }

    pub fn closure(&self) -> Option<&TradeClosure> {
        self.closure.as_ref()
    }

    pub fn status(&self) -> TradeStatus {
        if self.closure.is_some() {
            TradeStatus::Closed
        } else {
            TradeStatus::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.closure.is_none()
    }

    pub fn exit_price(&self) -> Option<f64> {
        self.closure.map(|c| c.exit_price)
    }

    pub fn pnl(&self) -> Option<f64> {
        self.closure.map(|c| c.pnl)
    }

    pub fn r_multiple(&self) -> Option<f64> {
        self.closure.map(|c| c.r_multiple)
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closure.map(|c| c.closed_at)
    }

    /// Dollar risk at entry: |entry - stop| × qty.
    pub fn initial_risk(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs() * self.quantity
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        realized_pnl(self.side, self.entry_price, price, self.quantity)
    }

    pub fn stop_loss_crossed(&self, window: &PriceWindow) -> bool {
        match self.side {
            Side::Long => window.low <= self.stop_loss,
            Side::Short => window.high >= self.stop_loss,
        }
    }

    pub fn take_profit_crossed(&self, window: &PriceWindow) -> bool {
        match self.side {
            Side::Long => window.high >= self.take_profit,
            Side::Short => window.low <= self.take_profit,
        }
    }

    /// Stop fill for a window: the stop level, or the open when the window
    /// opened through it.
    fn stop_fill(&self, window: &PriceWindow) -> f64 {
        match self.side {
            Side::Long => window.open.min(self.stop_loss),
            Side::Short => window.open.max(self.stop_loss),
        }
    }

    /// Level-based exit for this window. Targets fill at their level; stops
    /// fill at the level or at a worse gap open.
    pub fn exit_trigger(&self, window: &PriceWindow, tie_break: TieBreak) -> Option<(ExitReason, f64)> {
        let stop = self.stop_loss_crossed(window);
        let target = self.take_profit_crossed(window);
        match (stop, target, tie_break) {
            (true, true, TieBreak::StopLossFirst) | (true, false, _) => {
                Some((ExitReason::StopLoss, self.stop_fill(window)))
            }
            (true, true, TieBreak::TakeProfitFirst) | (false, true, _) => {
                Some((ExitReason::TakeProfit, self.take_profit))
            }
            (false, false, _) => None,
        }
    }

    /// Terminal transition. Rejects a second close without touching the first.
    pub fn close(
        &mut self,
        exit_price: f64,
        closed_at: DateTime<Utc>,
    ) -> Result<TradeClosure, SigtraderError> {
        if self.closure.is_some() {
            return Err(SigtraderError::TradeAlreadyClosed { id: self.id });
        }
        let pnl = realized_pnl(self.side, self.entry_price, exit_price, self.quantity);
        let closure = TradeClosure {
            exit_price,
            pnl,
            r_multiple: r_multiple(pnl, self.entry_price, self.stop_loss, self.quantity),
            closed_at,
        };
        self.closure = Some(closure);
        Ok(closure)
    }
}
