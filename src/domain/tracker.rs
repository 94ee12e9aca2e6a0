//! Position tracker: sole owner of trade mutation.
//!
//! Holds the open trade per symbol in memory and writes every transition
//! through the trade store. An open is only kept if it was persisted. Entry
//! slots are reserved under the tracker lock before an order is sent, so the
//! book-wide position cap and the cash budget hold across concurrent symbols.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info};

use crate::domain::error::SigtraderError;
use crate::domain::trade::{NewTrade, Trade, TradeStatus};
use crate::ports::persistence::TradeStore;

/// Drift between the tracker's open trades and the broker's open positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Held at the broker with no open trade on record.
    pub untracked_at_broker: Vec<String>,
    /// Open on record but not held at the broker.
    pub missing_at_broker: Vec<String>,
    /// Closed at the broker but still open in the store.
    pub unpersisted_closes: Vec<String>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.untracked_at_broker.is_empty()
            && self.missing_at_broker.is_empty()
            && self.unpersisted_closes.is_empty()
    }
}

/// Result of [`PositionTracker::close_trade`].
#[derive(Debug)]
pub struct ClosedTrade<R> {
    pub trade: Trade,
    /// Whatever the booking callback returned.
    pub booked: R,
    /// Set when the store update failed; the close is retried by
    /// [`PositionTracker::flush_unsaved`].
    pub store_error: Option<String>,
}

#[derive(Debug)]
struct TrackerState {
    open: HashMap<String, Trade>,
    /// Symbols with an order in flight, and the notional set aside for it.
    pending: HashMap<String, f64>,
    /// Closed trades whose store row still says open.
    unsaved: HashMap<String, Trade>,
    next_id: i64,
}

impl TrackerState {
    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn sorted_open(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.open.values().cloned().collect();
        trades.sort_by_key(Trade::id);
        trades
    }
}

/// An entry slot held while an order is in flight. Dropping it without a
/// commit releases the slot and its cash.
pub struct EntrySlot<'a> {
    tracker: &'a PositionTracker,
    symbol: String,
    id: i64,
}

impl EntrySlot<'_> {
    /// Id the trade will carry if the order fills.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn commit(self, new: NewTrade) -> Result<Trade, SigtraderError> {
        if new.symbol != self.symbol {
            return Err(SigtraderError::Invariant {
                reason: format!("slot for {} committed as {}", self.symbol, new.symbol),
            });
        }
        self.tracker.open_trade(self.id, new)
    }
}

impl Drop for EntrySlot<'_> {
    fn drop(&mut self) {
        self.tracker.state.lock().pending.remove(&self.symbol);
    }
}

pub struct PositionTracker {
    store: Arc<dyn TradeStore + Send + Sync>,
    state: Mutex<TrackerState>,
}

impl PositionTracker {
    /// Load open trades from the store and continue id allocation after the
    /// highest id on record.
    pub fn load(store: Arc<dyn TradeStore + Send + Sync>) -> Result<Self, SigtraderError> {
        let mut open = HashMap::new();
        for trade in store.trades(Some(TradeStatus::Open))? {
            if let Some(existing) = open.insert(trade.symbol().to_string(), trade) {
                return Err(SigtraderError::Invariant {
                    reason: format!(
                        "store holds more than one open trade for {}",
                        existing.symbol()
                    ),
                });
            }
        }
        let next_id = store.max_trade_id()?.unwrap_or(0) + 1;
        Ok(PositionTracker {
            store,
            state: Mutex::new(TrackerState {
                open,
                pending: HashMap::new(),
                unsaved: HashMap::new(),
                next_id,
            }),
        })
    }

    /// Allocate an id outside of an entry slot.
    pub fn reserve_id(&self) -> i64 {
        self.state.lock().allocate_id()
    }

    /// Claim an entry slot for `symbol`. `size` runs under the tracker lock
    /// with the open trades and the notional already committed (open plus in
    /// flight); it returns its result and the notional to set aside.
    pub fn reserve_entry<T>(
        &self,
        symbol: &str,
        max_open: usize,
        size: impl FnOnce(&[Trade], f64) -> Result<(T, f64), SigtraderError>,
    ) -> Result<(EntrySlot<'_>, T), SigtraderError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.open.get(symbol) {
            return Err(SigtraderError::Invariant {
                reason: format!(
                    "{symbol} already has open trade {}; refusing a second",
                    existing.id()
                ),
            });
        }
        if state.pending.contains_key(symbol) {
            return Err(SigtraderError::SymbolBusy {
                symbol: symbol.to_string(),
                reason: "an order is already in flight".into(),
            });
        }
        if let Some(unsaved) = state.unsaved.get(symbol) {
            return Err(SigtraderError::SymbolBusy {
                symbol: symbol.to_string(),
                reason: format!("close of trade {} is not yet persisted", unsaved.id()),
            });
        }
        if state.open.len() + state.pending.len() >= max_open {
            return Err(SigtraderError::PositionLimit { max: max_open });
        }

        let open = state.sorted_open();
        let committed: f64 = open
            .iter()
            .map(|t| t.entry_price() * t.quantity())
            .chain(state.pending.values().copied())
            .sum();
        let (value, notional) = size(&open, committed)?;

        state.pending.insert(symbol.to_string(), notional);
        let id = state.allocate_id();
        Ok((
            EntrySlot {
                tracker: self,
                symbol: symbol.to_string(),
                id,
            },
            value,
        ))
    }

    pub fn open_trade(&self, id: i64, new: NewTrade) -> Result<Trade, SigtraderError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.open.get(&new.symbol) {
            return Err(SigtraderError::Invariant {
                reason: format!(
                    "{} already has open trade {}; refusing a second",
                    new.symbol,
                    existing.id()
                ),
            });
        }

        let trade = Trade::open(id, new)?;
        self.store.insert_trade(&trade)?;
        info!(
            id,
            symbol = trade.symbol(),
            side = %trade.side(),
            qty = trade.quantity(),
            entry = trade.entry_price(),
            stop_loss = trade.stop_loss(),
            take_profit = trade.take_profit(),
            "trade opened"
        );
        state.pending.remove(trade.symbol());
        state.open.insert(trade.symbol().to_string(), trade.clone());
        Ok(trade)
    }

    /// Close the symbol's open trade and run `book` with the closed trade and
    /// the trades still open, all under the tracker lock.
    ///
    /// The broker side is already flat when this is called, so a failed store
    /// update does not undo the close: the trade is parked as unsaved, blocks
    /// new entries on the symbol and is written again by `flush_unsaved`.
    pub fn close_trade<R>(
        &self,
        symbol: &str,
        exit_price: f64,
        closed_at: DateTime<Utc>,
        book: impl FnOnce(&Trade, &[Trade]) -> R,
    ) -> Result<ClosedTrade<R>, SigtraderError> {
        let mut state = self.state.lock();
        let mut trade = state
            .open
            .remove(symbol)
            .ok_or_else(|| SigtraderError::NoOpenTrade {
                symbol: symbol.to_string(),
            })?;

        let closure = match trade.close(exit_price, closed_at) {
            Ok(closure) => closure,
            Err(e) => {
                state.open.insert(symbol.to_string(), trade);
                return Err(e);
            }
        };

        let store_error = match self.store.update_closed(&trade) {
            Ok(()) => None,
            Err(e) => {
                error!(id = trade.id(), symbol, error = %e, "failed to persist trade close");
                state.unsaved.insert(symbol.to_string(), trade.clone());
                Some(e.to_string())
            }
        };
        info!(
            id = trade.id(),
            symbol,
            exit = closure.exit_price,
            pnl = closure.pnl,
            r_multiple = closure.r_multiple,
            "trade closed"
        );

        let booked = book(&trade, &state.sorted_open());
        Ok(ClosedTrade {
            trade,
            booked,
            store_error,
        })
    }

    /// Write a close that previously failed to persist. Returns whether
    /// anything was pending for `symbol`.
    pub fn flush_unsaved(&self, symbol: &str) -> Result<bool, SigtraderError> {
        let mut state = self.state.lock();
        let Some(trade) = state.unsaved.get(symbol) else {
            return Ok(false);
        };
        self.store.update_closed(trade)?;
        info!(id = trade.id(), symbol, "persisted deferred trade close");
        state.unsaved.remove(symbol);
        Ok(true)
    }

    /// Run `f` with the open trades while holding the tracker lock.
    pub fn with_open<R>(&self, f: impl FnOnce(&[Trade]) -> R) -> R {
        let state = self.state.lock();
        f(&state.sorted_open())
    }

    pub fn open_trade_for(&self, symbol: &str) -> Option<Trade> {
        self.state.lock().open.get(symbol).cloned()
    }

    pub fn open_trades(&self) -> Vec<Trade> {
        self.state.lock().sorted_open()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn reconcile(&self, broker_symbols: &[String]) -> Reconciliation {
        let state = self.state.lock();
        let held: BTreeSet<&str> = broker_symbols.iter().map(String::as_str).collect();
        let tracked: BTreeSet<&str> = state.open.keys().map(String::as_str).collect();
        let mut unpersisted: Vec<String> = state.unsaved.keys().cloned().collect();
        unpersisted.sort();
        Reconciliation {
            untracked_at_broker: held.difference(&tracked).map(|s| s.to_string()).collect(),
            missing_at_broker: tracked.difference(&held).map(|s| s.to_string()).collect(),
            unpersisted_closes: unpersisted,
        }
    }
}
