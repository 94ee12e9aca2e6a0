//! Account ledger: realized and unrealized P&L rolled into append-only
//! account snapshots.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::error::SigtraderError;
use crate::domain::trade::Trade;
use crate::ports::persistence::AccountStore;

#[derive(Debug, Clone, PartialEq)]
pub struct AccountSnapshot {
    pub cash: f64,
    pub equity: f64,
    pub day_pnl: f64,
    pub total_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct LedgerState {
    realized_total: f64,
    realized_by_day: BTreeMap<NaiveDate, f64>,
    recorded: HashSet<i64>,
    last_timestamp: Option<DateTime<Utc>>,
}

pub struct AccountLedger {
    store: Arc<dyn AccountStore + Send + Sync>,
    initial_capital: f64,
    state: Mutex<LedgerState>,
}

impl AccountLedger {
    pub fn new(store: Arc<dyn AccountStore + Send + Sync>, initial_capital: f64) -> Self {
        AccountLedger {
            store,
            initial_capital,
            state: Mutex::new(LedgerState {
                realized_total: 0.0,
                realized_by_day: BTreeMap::new(),
                recorded: HashSet::new(),
                last_timestamp: None,
            }),
        }
    }

    /// Rebuild realized P&L from closed trades already on record.
    pub fn resume(
        store: Arc<dyn AccountStore + Send + Sync>,
        initial_capital: f64,
        closed: &[Trade],
    ) -> Result<Self, SigtraderError> {
        let last_timestamp = store.latest_snapshot()?.map(|s| s.timestamp);
        let ledger = AccountLedger::new(store, initial_capital);
        {
            let mut state = ledger.state.lock();
            for trade in closed {
                apply_realized(&mut state, trade)?;
            }
            state.last_timestamp = last_timestamp;
        }
        Ok(ledger)
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn cash(&self) -> f64 {
        self.initial_capital + self.state.lock().realized_total
    }

    pub fn total_pnl(&self) -> f64 {
        self.state.lock().realized_total
    }

    /// Cash plus unrealized P&L of `open` trades at their marks. A trade without
    /// a mark counts at its entry price.
    pub fn equity(&self, open: &[Trade], marks: &HashMap<String, f64>) -> f64 {
        self.cash() + unrealized(open, marks)
    }

    /// Apply a close and append the resulting snapshot.
    pub fn record_close(
        &self,
        trade: &Trade,
        open: &[Trade],
        marks: &HashMap<String, f64>,
        at: DateTime<Utc>,
    ) -> Result<AccountSnapshot, SigtraderError> {
        let mut state = self.state.lock();
        apply_realized(&mut state, trade)?;
        self.append(&mut state, open, marks, at)
    }

    /// Interval snapshot with no close attached.
    pub fn snapshot(
        &self,
        open: &[Trade],
        marks: &HashMap<String, f64>,
        at: DateTime<Utc>,
    ) -> Result<AccountSnapshot, SigtraderError> {
        let mut state = self.state.lock();
        self.append(&mut state, open, marks, at)
    }

    fn append(
        &self,
        state: &mut LedgerState,
        open: &[Trade],
        marks: &HashMap<String, f64>,
        at: DateTime<Utc>,
    ) -> Result<AccountSnapshot, SigtraderError> {
        let timestamp = match state.last_timestamp {
            Some(last) if at < last => {
                warn!(%at, %last, "snapshot time went backwards, clamping");
                last
            }
            _ => at,
        };

        let cash = self.initial_capital + state.realized_total;
        let snapshot = AccountSnapshot {
            cash,
            equity: cash + unrealized(open, marks),
            day_pnl: state
                .realized_by_day
                .get(&timestamp.date_naive())
                .copied()
                .unwrap_or(0.0),
            total_pnl: state.realized_total,
            timestamp,
        };

        let id = self.store.append_snapshot(&snapshot)?;
        state.last_timestamp = Some(timestamp);
        debug!(id, equity = snapshot.equity, total_pnl = snapshot.total_pnl, "account snapshot");
        Ok(snapshot)
    }
}

fn apply_realized(state: &mut LedgerState, trade: &Trade) -> Result<(), SigtraderError> {
    let closure = trade.closure().ok_or_else(|| SigtraderError::Invariant {
        reason: format!("trade {} recorded in ledger while still open", trade.id()),
    })?;
    if !state.recorded.insert(trade.id()) {
        return Err(SigtraderError::Invariant {
            reason: format!("trade {} already recorded in ledger", trade.id()),
        });
    }
    state.realized_total += closure.pnl;
    *state
        .realized_by_day
        .entry(closure.closed_at.date_naive())
        .or_insert(0.0) += closure.pnl;
    Ok(())
}

fn unrealized(open: &[Trade], marks: &HashMap<String, f64>) -> f64 {
    open.iter()
        .filter(|t| t.is_open())
        .map(|t| {
            let price = marks.get(t.symbol()).copied().unwrap_or(t.entry_price());
            t.unrealized_pnl(price)
        })
        .sum()
}
