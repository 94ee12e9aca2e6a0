//! In-process store implementing every persistence port. Backs `run --dry-run`,
//! where the book lives only as long as the process.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::bar::Bar;
use crate::domain::error::SigtraderError;
use crate::domain::ledger::AccountSnapshot;
use crate::domain::signal::SignalSnapshot;
use crate::domain::trade::{Trade, TradeStatus};
use crate::ports::bar_store::BarStore;
use crate::ports::persistence::{AccountStore, SignalStore, TradeStore};

#[derive(Default)]
pub struct MemoryStore {
    bars: Mutex<BTreeMap<(String, String), Vec<Bar>>>,
    trades: Mutex<BTreeMap<i64, Trade>>,
    snapshots: Mutex<Vec<AccountSnapshot>>,
    signals: Mutex<Vec<SignalSnapshot>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail as if the database were down.
    #[cfg(test)]
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), SigtraderError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SigtraderError::Database {
                reason: "memory store writes disabled".into(),
            });
        }
        Ok(())
    }
}

impl BarStore for MemoryStore {
    fn latest(
        &self,
        symbol: &str,
        timeframe: &str,
        lookback: usize,
    ) -> Result<Vec<Bar>, SigtraderError> {
        let bars = self.bars.lock();
        let series = bars
            .get(&(symbol.to_string(), timeframe.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(series[series.len().saturating_sub(lookback)..].to_vec())
    }

    fn append(&self, new_bars: &[Bar]) -> Result<usize, SigtraderError> {
        self.check_writable()?;
        let mut bars = self.bars.lock();
        let mut added = 0;
        for bar in new_bars {
            let series = bars
                .entry((bar.symbol.clone(), bar.timeframe.clone()))
                .or_default();
            if series.iter().any(|b| b.timestamp == bar.timestamp) {
                continue;
            }
            series.push(bar.clone());
            added += 1;
        }
        for series in bars.values_mut() {
            series.sort_by_key(|b| b.timestamp);
        }
        Ok(added)
    }

    fn symbols(&self, timeframe: &str) -> Result<Vec<String>, SigtraderError> {
        Ok(self
            .bars
            .lock()
            .keys()
            .filter(|(_, tf)| tf == timeframe)
            .map(|(symbol, _)| symbol.clone())
            .collect())
    }
}

impl TradeStore for MemoryStore {
    fn insert_trade(&self, trade: &Trade) -> Result<(), SigtraderError> {
        self.check_writable()?;
        let mut trades = self.trades.lock();
        if trades.contains_key(&trade.id()) {
            return Err(SigtraderError::DatabaseQuery {
                reason: format!("duplicate trade id {}", trade.id()),
            });
        }
        trades.insert(trade.id(), trade.clone());
        Ok(())
    }

    fn update_closed(&self, trade: &Trade) -> Result<(), SigtraderError> {
        self.check_writable()?;
        match self.trades.lock().get_mut(&trade.id()) {
            Some(stored) if stored.is_open() => {
                *stored = trade.clone();
                Ok(())
            }
            Some(_) => Err(SigtraderError::TradeAlreadyClosed { id: trade.id() }),
            None => Err(SigtraderError::DatabaseQuery {
                reason: format!("unknown trade id {}", trade.id()),
            }),
        }
    }

    fn trades(&self, status: Option<TradeStatus>) -> Result<Vec<Trade>, SigtraderError> {
        Ok(self
            .trades
            .lock()
            .values()
            .filter(|t| status.is_none_or(|s| t.status() == s))
            .cloned()
            .collect())
    }

    fn max_trade_id(&self) -> Result<Option<i64>, SigtraderError> {
        Ok(self.trades.lock().keys().next_back().copied())
    }
}

impl AccountStore for MemoryStore {
    fn append_snapshot(&self, snapshot: &AccountSnapshot) -> Result<i64, SigtraderError> {
        self.check_writable()?;
        let mut snapshots = self.snapshots.lock();
        snapshots.push(snapshot.clone());
        Ok(snapshots.len() as i64)
    }

    fn latest_snapshot(&self) -> Result<Option<AccountSnapshot>, SigtraderError> {
        Ok(self.snapshots.lock().last().cloned())
    }

    fn snapshots(&self, limit: usize) -> Result<Vec<AccountSnapshot>, SigtraderError> {
        Ok(self.snapshots.lock().iter().rev().take(limit).cloned().collect())
    }
}

impl SignalStore for MemoryStore {
    fn save_signal(&self, snapshot: &SignalSnapshot) -> Result<i64, SigtraderError> {
        self.check_writable()?;
        let mut signals = self.signals.lock();
        signals.push(snapshot.clone());
        Ok(signals.len() as i64)
    }

    fn recent_signals(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SignalSnapshot>, SigtraderError> {
        Ok(self
            .signals
            .lock()
            .iter()
            .rev()
            .filter(|s| s.symbol == symbol)
            .take(limit)
            .cloned()
            .collect())
    }
}
