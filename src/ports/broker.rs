//! Broker port. Order acknowledgement and execution live behind this trait;
//! the core only sees fills and close confirmations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::error::SigtraderError;
use crate::domain::trade::Side;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Client-side id the resulting trade will carry.
    pub trade_id: i64,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub reference_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub trade_id: i64,
    pub price: f64,
    pub quantity: f64,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseConfirmation {
    pub trade_id: i64,
    pub exit_price: f64,
    pub closed_at: DateTime<Utc>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_position(&self, order: &OrderRequest) -> Result<Fill, SigtraderError>;

    async fn close_position(
        &self,
        trade_id: i64,
        exit_price: f64,
    ) -> Result<CloseConfirmation, SigtraderError>;

    /// Symbols the broker currently reports as held.
    async fn open_positions(&self) -> Result<Vec<String>, SigtraderError>;

    /// Look up the fill for a client trade id. Used before resending an open
    /// whose previous attempt went unanswered.
    async fn find_fill(&self, trade_id: i64) -> Result<Option<Fill>, SigtraderError>;
}
