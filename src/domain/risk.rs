//! Position sizing: stop-loss, take-profit and quantity from a fixed
//! fraction of equity at risk.

use crate::domain::error::SizingError;
use crate::domain::trade::{BindingConstraint, Side};

/// Tolerance absorbing float error before flooring to lot size.
const LOT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    /// Stop distance as a percent of entry price.
    pub stop_loss_pct: f64,
    pub reward_risk: f64,
    pub risk_fraction: f64,
    pub lot_size: f64,
    pub use_structural_stop: bool,
    pub cap_by_cash: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            stop_loss_pct: 2.0,
            reward_risk: 2.0,
            risk_fraction: 0.01,
            lot_size: 1.0,
            use_structural_stop: false,
            cap_by_cash: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizingRequest {
    pub side: Side,
    pub price: f64,
    pub equity: f64,
    pub cash: f64,
    pub structural_level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionPlan {
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: f64,
    pub stop_distance: f64,
    pub binding: BindingConstraint,
}

pub struct RiskManager {
    config: RiskConfig,
}

/// Round down to a whole number of lots; a non-positive lot size disables rounding.
pub fn floor_to_lot(raw: f64, lot_size: f64) -> f64 {
    if lot_size <= 0.0 {
        return raw;
    }
    ((raw / lot_size) + LOT_EPSILON).floor() * lot_size
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        RiskManager { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn stop_distance(&self, req: &SizingRequest) -> f64 {
        match req.structural_level {
            Some(level) if self.config.use_structural_stop => req.side.sign() * (req.price - level),
            _ => req.price * self.config.stop_loss_pct / 100.0,
        }
    }

    pub fn size(&self, req: &SizingRequest) -> Result<PositionPlan, SizingError> {
        if req.price.is_nan() || req.price <= 0.0 {
            return Err(SizingError::NonPositivePrice { price: req.price });
        }
        if req.equity.is_nan() || req.equity <= 0.0 {
            return Err(SizingError::NonPositiveEquity { equity: req.equity });
        }

        let distance = self.stop_distance(req);
        if distance.is_nan() || distance <= 0.0 {
            return Err(SizingError::NonPositiveStopDistance { distance });
        }

        let sign = req.side.sign();
        let stop_loss = req.price - sign * distance;
        let take_profit = req.price + sign * distance * self.config.reward_risk;

        let raw = req.equity * self.config.risk_fraction / distance;
        let risk_qty = floor_to_lot(raw, self.config.lot_size);

        let (quantity, binding) = if self.config.cap_by_cash {
            let cash_qty = floor_to_lot(req.cash.max(0.0) / req.price, self.config.lot_size);
            if cash_qty < risk_qty {
                (cash_qty, BindingConstraint::Cash)
            } else {
                (risk_qty, BindingConstraint::Risk)
            }
        } else {
            (risk_qty, BindingConstraint::Risk)
        };

        if quantity <= 0.0 {
            return Err(SizingError::ZeroQuantity {
                raw,
                lot_size: self.config.lot_size,
            });
        }

        Ok(PositionPlan {
            side: req.side,
            entry_price: req.price,
            stop_loss,
            take_profit,
            quantity,
            stop_distance: distance,
            binding,
        })
    }
}
