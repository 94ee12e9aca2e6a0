//! Persistence ports for trades, account snapshots and signal snapshots.

use crate::domain::error::SigtraderError;
use crate::domain::ledger::AccountSnapshot;
use crate::domain::signal::SignalSnapshot;
use crate::domain::trade::{Trade, TradeStatus};

pub trait TradeStore {
    fn insert_trade(&self, trade: &Trade) -> Result<(), SigtraderError>;

    /// Persist the closure of a trade that was inserted open.
    fn update_closed(&self, trade: &Trade) -> Result<(), SigtraderError>;

    fn trades(&self, status: Option<TradeStatus>) -> Result<Vec<Trade>, SigtraderError>;

    fn max_trade_id(&self) -> Result<Option<i64>, SigtraderError>;
}

pub trait AccountStore {
    fn append_snapshot(&self, snapshot: &AccountSnapshot) -> Result<i64, SigtraderError>;

    fn latest_snapshot(&self) -> Result<Option<AccountSnapshot>, SigtraderError>;

    /// Most recent snapshots, newest first.
    fn snapshots(&self, limit: usize) -> Result<Vec<AccountSnapshot>, SigtraderError>;
}

pub trait SignalStore {
    fn save_signal(&self, snapshot: &SignalSnapshot) -> Result<i64, SigtraderError>;

    /// Most recent snapshots for a symbol, newest first.
    fn recent_signals(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SignalSnapshot>, SigtraderError>;
}
