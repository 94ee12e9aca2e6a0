//! Pipeline orchestrator.
//!
//! One tick per symbol: bars -> signal -> gate -> sizing -> broker -> tracker
//! -> ledger. Ticks for the same symbol are serialized by a per-symbol lock;
//! different symbols run concurrently. Each bar is evaluated once per symbol,
//! and never for exits on the bar a trade entered on.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::domain::bar::PriceWindow;
use crate::domain::decision::{Decision, DecisionGate, GateConfig, NoOpReason};
use crate::domain::error::SigtraderError;
use crate::domain::ledger::{AccountLedger, AccountSnapshot};
use crate::domain::retry::RetryPolicy;
use crate::domain::risk::{RiskConfig, RiskManager, SizingRequest};
use crate::domain::signal::{SignalConfig, SignalEngine, SignalSnapshot};
use crate::domain::tracker::{PositionTracker, Reconciliation};
use crate::domain::trade::{CHECKLIST_VERSION, Checklist, ExitReason, NewTrade, Side, Trade};
use crate::ports::bar_store::BarStore;
use crate::ports::broker::{Broker, Fill, OrderRequest};
use crate::ports::persistence::SignalStore;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Symbols to trade. Empty means every symbol with bars in `timeframe`.
    pub symbols: Vec<String>,
    pub timeframe: String,
    /// Bars fetched per tick; raised to the engine's required history if lower.
    pub lookback: usize,
    pub interval_secs: u64,
    /// Append an interval account snapshot every N cycles; 0 disables.
    pub snapshot_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            symbols: Vec::new(),
            timeframe: "1h".into(),
            lookback: 100,
            interval_secs: 60,
            snapshot_every: 0,
        }
    }
}

/// Every tunable the pipeline is built from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradingConfig {
    pub initial_capital: f64,
    pub pipeline: PipelineConfig,
    pub signal: SignalConfig,
    pub gate: GateConfig,
    pub risk: RiskConfig,
    pub retry: RetryPolicy,
}

/// Stores and services the pipeline drives.
pub struct PipelinePorts {
    pub bars: Arc<dyn BarStore + Send + Sync>,
    pub signals: Arc<dyn SignalStore + Send + Sync>,
    pub broker: Arc<dyn Broker>,
    pub tracker: Arc<PositionTracker>,
    pub ledger: Arc<AccountLedger>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    NoOp,
    Opened,
    Closed,
    Held,
}

impl TickAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickAction::NoOp => "no-op",
            TickAction::Opened => "opened",
            TickAction::Closed => "closed",
            TickAction::Held => "held",
        }
    }
}

impl std::fmt::Display for TickAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the latest tick for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub symbol: String,
    pub snapshot: SignalSnapshot,
    pub decision: Decision,
    pub action: TickAction,
    pub trade: Option<Trade>,
    pub account: Option<AccountSnapshot>,
    /// Why the decided action did not complete.
    pub failure: Option<String>,
    pub ticked_at: DateTime<Utc>,
}

struct CloseOutcome {
    trade: Trade,
    account: Option<AccountSnapshot>,
    failure: Option<String>,
}

struct Outcome {
    action: TickAction,
    trade: Option<Trade>,
    account: Option<AccountSnapshot>,
    failure: Option<String>,
}

impl Outcome {
    fn action(action: TickAction) -> Self {
        Outcome {
            action,
            trade: None,
            account: None,
            failure: None,
        }
    }

    fn failed(action: TickAction, trade: Option<Trade>, failure: String) -> Self {
        Outcome {
            action,
            trade,
            account: None,
            failure: Some(failure),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    engine: SignalEngine,
    gate: DecisionGate,
    risk: RiskManager,
    retry: RetryPolicy,
    bars: Arc<dyn BarStore + Send + Sync>,
    signals: Arc<dyn SignalStore + Send + Sync>,
    broker: Arc<dyn Broker>,
    tracker: Arc<PositionTracker>,
    ledger: Arc<AccountLedger>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    marks: Mutex<HashMap<String, f64>>,
    /// Timestamp of the last bar each symbol was evaluated on.
    evaluated: Mutex<HashMap<String, DateTime<Utc>>>,
    results: RwLock<HashMap<String, PipelineResult>>,
    cycles: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl Pipeline {
    pub fn new(ports: PipelinePorts, config: &TradingConfig, shutdown: watch::Receiver<bool>) -> Self {
        Pipeline {
            config: config.pipeline.clone(),
            engine: SignalEngine::new(config.signal.clone()),
            gate: DecisionGate::new(config.gate.clone()),
            risk: RiskManager::new(config.risk.clone()),
            retry: config.retry.clone(),
            bars: ports.bars,
            signals: ports.signals,
            broker: ports.broker,
            tracker: ports.tracker,
            ledger: ports.ledger,
            locks: Mutex::new(HashMap::new()),
            marks: Mutex::new(HashMap::new()),
            evaluated: Mutex::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            cycles: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn ledger(&self) -> &AccountLedger {
        &self.ledger
    }

    pub fn lookback(&self) -> usize {
        self.config.lookback.max(self.engine.required_history())
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    fn marks(&self) -> HashMap<String, f64> {
        self.marks.lock().clone()
    }

    /// Whether the latest bar still needs evaluating: it must be newer than
    /// the last bar this symbol was evaluated on and than the open trade's
    /// entry bar.
    fn bar_is_new(&self, symbol: &str, bar_time: Option<DateTime<Utc>>, open_trade: Option<&Trade>) -> bool {
        let Some(bar_time) = bar_time else {
            return true;
        };
        if self
            .evaluated
            .lock()
            .get(symbol)
            .is_some_and(|seen| bar_time <= *seen)
        {
            return false;
        }
        match open_trade.and_then(|t| t.checklist().bar_timestamp) {
            Some(entry_bar) => bar_time > entry_bar,
            None => true,
        }
    }

    /// Run one tick for `symbol` and record its result.
    pub async fn tick(&self, symbol: &str, now: DateTime<Utc>) -> PipelineResult {
        let lock = self.symbol_lock(symbol);
        let _guard = lock.lock().await;

        if let Err(e) = self.tracker.flush_unsaved(symbol) {
            warn!(symbol, error = %e, "deferred trade close still not persisted");
        }

        let bars = match self.bars.latest(symbol, &self.config.timeframe, self.lookback()) {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol, error = %e, "bar fetch failed, treating window as empty");
                Vec::new()
            }
        };

        let snapshot = self.engine.compute(symbol, &bars);
        if let Err(e) = self.signals.save_signal(&snapshot) {
            error!(symbol, error = %e, "failed to persist signal snapshot");
        }

        let bar_time = bars.last().map(|b| b.timestamp);
        let window = bars.last().map(|b| b.window());
        if let Some(w) = &window {
            self.marks.lock().insert(symbol.to_string(), w.close);
        }

        let open_trade = self.tracker.open_trade_for(symbol);
        let fresh = self.bar_is_new(symbol, bar_time, open_trade.as_ref());
        let decision = if fresh {
            self.gate.evaluate(
                &snapshot,
                open_trade.as_ref(),
                self.tracker.open_count(),
                window.as_ref(),
            )
        } else {
            Decision::NoOp(NoOpReason::BarAlreadyEvaluated)
        };
        debug!(symbol, score = snapshot.score, bias = %snapshot.bias, ?decision, "evaluated");

        let outcome = match (&decision, window) {
            (Decision::OpenCandidate { side }, Some(window)) => {
                self.try_open(symbol, *side, &snapshot, &window, bar_time).await
            }
            (Decision::CloseCandidate { reason, exit_price }, _) => match &open_trade {
                Some(trade) => self.try_close(trade, *reason, *exit_price).await,
                None => Outcome::action(TickAction::NoOp),
            },
            _ if open_trade.is_some() => Outcome::action(TickAction::Held),
            _ => Outcome::action(TickAction::NoOp),
        };

        // A bar is spent once it produced a decision that completed, or a
        // close that reached the broker.
        let spent = outcome.failure.is_none() || outcome.action == TickAction::Closed;
        if let (true, true, Some(bar_time)) = (fresh, spent, bar_time) {
            self.evaluated.lock().insert(symbol.to_string(), bar_time);
        }

        let result = PipelineResult {
            symbol: symbol.to_string(),
            snapshot,
            decision,
            action: outcome.action,
            trade: outcome.trade,
            account: outcome.account,
            failure: outcome.failure,
            ticked_at: now,
        };
        self.results
            .write()
            .insert(symbol.to_string(), result.clone());
        result
    }

    async fn try_open(
        &self,
        symbol: &str,
        side: Side,
        snapshot: &SignalSnapshot,
        window: &PriceWindow,
        bar_time: Option<DateTime<Utc>>,
    ) -> Outcome {
        if self.shutting_down() {
            return Outcome::failed(
                TickAction::NoOp,
                None,
                "shutdown requested before order was sent".into(),
            );
        }
        match self.open(symbol, side, snapshot, window, bar_time).await {
            Ok(trade) => Outcome {
                action: TickAction::Opened,
                trade: Some(trade),
                account: None,
                failure: None,
            },
            Err(e) => {
                log_failure(symbol, "open", &e);
                Outcome::failed(TickAction::NoOp, None, e.to_string())
            }
        }
    }

    /// Size under an entry slot, send the order, then commit the fill. The slot
    /// counts against the position cap and its notional against cash until the
    /// trade is committed or the attempt fails.
    async fn open(
        &self,
        symbol: &str,
        side: Side,
        snapshot: &SignalSnapshot,
        window: &PriceWindow,
        bar_time: Option<DateTime<Utc>>,
    ) -> Result<Trade, SigtraderError> {
        let marks = self.marks();
        let structural_level = snapshot.structural_level();
        let (slot, (plan, equity, cash)) = self.tracker.reserve_entry(
            symbol,
            self.gate.config().max_open_positions,
            |open, committed| {
                let equity = self.ledger.equity(open, &marks);
                let cash = self.ledger.cash() - committed;
                let plan = self.risk.size(&SizingRequest {
                    side,
                    price: window.close,
                    equity,
                    cash,
                    structural_level,
                })?;
                let notional = plan.entry_price * plan.quantity;
                Ok(((plan, equity, cash), notional))
            },
        )?;

        let order = OrderRequest {
            trade_id: slot.id(),
            symbol: symbol.to_string(),
            side,
            quantity: plan.quantity,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            reference_price: plan.entry_price,
        };
        let fill = self.send_open(&order).await?;

        let risk = self.risk.config();
        let checklist = Checklist {
            version: CHECKLIST_VERSION,
            score: snapshot.score,
            confidence: snapshot.confidence,
            bias: snapshot.bias,
            reference_price: plan.entry_price,
            equity,
            cash,
            risk_fraction: risk.risk_fraction,
            reward_risk: risk.reward_risk,
            stop_distance: plan.stop_distance,
            structural_level,
            binding: plan.binding,
            signals: snapshot.signal_map(),
            bar_timestamp: bar_time,
        };

        slot.commit(NewTrade {
            symbol: symbol.to_string(),
            side,
            quantity: fill.quantity,
            entry_price: fill.price,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            confidence: snapshot.confidence,
            opened_at: fill.filled_at,
            checklist,
        })
    }

    /// Send an open with retries. Before resending, ask the broker whether an
    /// earlier attempt already filled under the same trade id.
    async fn send_open(&self, order: &OrderRequest) -> Result<Fill, SigtraderError> {
        let broker = &self.broker;
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        self.retry
            .run("open_position", move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                    if let Some(fill) = broker.find_fill(order.trade_id).await? {
                        warn!(
                            trade_id = order.trade_id,
                            symbol = %order.symbol,
                            "earlier open attempt filled, not resending"
                        );
                        return Ok(fill);
                    }
                }
                broker.open_position(order).await
            })
            .await
    }

    async fn try_close(&self, trade: &Trade, reason: ExitReason, exit_price: f64) -> Outcome {
        let symbol = trade.symbol();
        if self.shutting_down() {
            return Outcome::failed(
                TickAction::Held,
                Some(trade.clone()),
                "shutdown requested before close was sent".into(),
            );
        }

        match self.close(trade, reason, exit_price).await {
            Ok(closed) => Outcome {
                action: TickAction::Closed,
                trade: Some(closed.trade),
                account: closed.account,
                failure: closed.failure,
            },
            Err(e) => {
                log_failure(symbol, "close", &e);
                Outcome::failed(TickAction::Held, self.tracker.open_trade_for(symbol), e.to_string())
            }
        }
    }

    /// Close at the broker, then close and book it under the tracker lock.
    /// A store or ledger failure after the broker confirmed leaves the close in
    /// place and is reported with it.
    async fn close(
        &self,
        trade: &Trade,
        reason: ExitReason,
        exit_price: f64,
    ) -> Result<CloseOutcome, SigtraderError> {
        let confirmation = self
            .retry
            .run("close_position", || {
                self.broker.close_position(trade.id(), exit_price)
            })
            .await?;

        let marks = self.marks();
        let closed = self.tracker.close_trade(
            trade.symbol(),
            confirmation.exit_price,
            confirmation.closed_at,
            |closed, open| {
                self.ledger
                    .record_close(closed, open, &marks, confirmation.closed_at)
            },
        )?;
        info!(id = closed.trade.id(), symbol = closed.trade.symbol(), reason = %reason, "position exited");

        let mut failure = closed.store_error;
        let account = match closed.booked {
            Ok(account) => Some(account),
            Err(e) => {
                error!(id = closed.trade.id(), error = %e, "failed to record close in ledger");
                failure.get_or_insert_with(|| e.to_string());
                None
            }
        };
        Ok(CloseOutcome {
            trade: closed.trade,
            account,
            failure,
        })
    }

    /// Close the symbol's open trade at its last mark.
    pub async fn close_manually(&self, symbol: &str) -> Result<PipelineResult, SigtraderError> {
        let lock = self.symbol_lock(symbol);
        let _guard = lock.lock().await;

        let trade = self
            .tracker
            .open_trade_for(symbol)
            .ok_or_else(|| SigtraderError::NoOpenTrade {
                symbol: symbol.to_string(),
            })?;
        let price = self
            .marks
            .lock()
            .get(symbol)
            .copied()
            .unwrap_or(trade.entry_price());

        let closed = self.close(&trade, ExitReason::Manual, price).await?;
        let result = PipelineResult {
            symbol: symbol.to_string(),
            snapshot: SignalSnapshot::neutral(symbol, closed.trade.closed_at().unwrap_or_default()),
            decision: Decision::CloseCandidate {
                reason: ExitReason::Manual,
                exit_price: price,
            },
            action: TickAction::Closed,
            trade: Some(closed.trade),
            account: closed.account,
            failure: closed.failure,
            ticked_at: Utc::now(),
        };
        self.results
            .write()
            .insert(symbol.to_string(), result.clone());
        Ok(result)
    }

    /// Tick every symbol concurrently. Results come back sorted by symbol.
    pub async fn run_cycle(self: &Arc<Self>, symbols: &[String], now: DateTime<Utc>) -> Vec<PipelineResult> {
        let mut unique: Vec<String> = symbols.to_vec();
        unique.sort();
        unique.dedup();

        let mut set = JoinSet::new();
        for symbol in unique {
            let pipeline = Arc::clone(self);
            set.spawn(async move { pipeline.tick(&symbol, now).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "tick task failed"),
            }
        }
        results.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.config.snapshot_every;
        if every > 0 && cycle % every == 0 {
            let marks = self.marks();
            if let Err(e) = self
                .tracker
                .with_open(|open| self.ledger.snapshot(open, &marks, now))
            {
                error!(cycle, error = %e, "interval account snapshot failed");
            }
        }
        results
    }

    /// Symbols to tick: the configured list, or everything with bars.
    pub fn resolve_symbols(&self) -> Result<Vec<String>, SigtraderError> {
        if !self.config.symbols.is_empty() {
            return Ok(self.config.symbols.clone());
        }
        self.bars.symbols(&self.config.timeframe)
    }

    /// Repeat cycles every `interval_secs` until shutdown is signalled.
    pub async fn run(self: &Arc<Self>) -> Result<(), SigtraderError> {
        let symbols = self.resolve_symbols()?;
        info!(?symbols, interval_secs = self.config.interval_secs, "pipeline started");

        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if self.shutting_down() {
                break;
            }
            let results = self.run_cycle(&symbols, Utc::now()).await;
            for r in results.iter().filter(|r| r.action != TickAction::NoOp || r.failure.is_some()) {
                info!(symbol = %r.symbol, action = %r.action, failure = ?r.failure, "tick");
            }
        }

        info!("pipeline stopped");
        Ok(())
    }

    /// Compare tracked open trades with what the broker holds.
    pub async fn reconcile(&self) -> Result<Reconciliation, SigtraderError> {
        let held = self
            .retry
            .run("open_positions", || self.broker.open_positions())
            .await?;
        let report = self.tracker.reconcile(&held);
        if !report.is_clean() {
            warn!(
                untracked = ?report.untracked_at_broker,
                missing = ?report.missing_at_broker,
                unpersisted = ?report.unpersisted_closes,
                "tracker and broker disagree"
            );
        }
        Ok(report)
    }

    pub fn latest_result(&self, symbol: &str) -> Option<PipelineResult> {
        self.results.read().get(symbol).cloned()
    }

    /// Latest result per symbol, sorted by symbol.
    pub fn latest_results(&self) -> Vec<PipelineResult> {
        let mut results: Vec<PipelineResult> = self.results.read().values().cloned().collect();
        results.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        results
    }
}

fn log_failure(symbol: &str, action: &str, e: &SigtraderError) {
    match e {
        SigtraderError::Sizing(_) => warn!(symbol, action, error = %e, "sizing aborted action"),
        SigtraderError::BrokerExhausted { .. } => {
            warn!(symbol, action, error = %e, "broker retries exhausted, action abandoned")
        }
        SigtraderError::PositionLimit { .. } | SigtraderError::SymbolBusy { .. } => {
            warn!(symbol, action, error = %e, "no entry slot")
        }
        SigtraderError::Invariant { .. }
        | SigtraderError::TradeAlreadyClosed { .. }
        | SigtraderError::NoOpenTrade { .. } => {
            error!(symbol, action, error = %e, "invariant violation")
        }
        _ => error!(symbol, action, error = %e, "action failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStore;
    use crate::adapters::paper_broker::PaperBroker;
    use crate::domain::bar::Bar;
    use crate::domain::indicator::test_bars::from_closes;
    use crate::domain::trade::TradeStatus;
    use crate::ports::persistence::{AccountStore, TradeStore};
    use chrono::TimeZone;

    struct Harness {
        store: Arc<MemoryStore>,
        broker: Arc<PaperBroker>,
        pipeline: Arc<Pipeline>,
        shutdown: watch::Sender<bool>,
    }

    fn config() -> TradingConfig {
        TradingConfig {
            initial_capital: 10_000.0,
            pipeline: PipelineConfig {
                lookback: 30,
                ..PipelineConfig::default()
            },
            signal: SignalConfig {
                ema_fast: 3,
                ema_slow: 6,
                rsi_period: 5,
                macd_fast: 3,
                macd_slow: 6,
                macd_signal: 3,
                roc_period: 3,
                atr_period: 3,
                swing_lookback: 5,
                ..SignalConfig::default()
            },
            gate: GateConfig::default(),
            risk: RiskConfig::default(),
            retry: RetryPolicy {
                timeout_ms: 200,
                max_attempts: 3,
                backoff_ms_initial: 1,
                backoff_multiplier: 2,
                backoff_ms_max: 4,
            },
        }
    }

    fn harness(config: TradingConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(PaperBroker::new());
        let tracker = Arc::new(PositionTracker::load(store.clone()).unwrap());
        let ledger = Arc::new(AccountLedger::new(store.clone(), config.initial_capital));
        let (shutdown, rx) = watch::channel(false);
        let pipeline = Arc::new(Pipeline::new(
            PipelinePorts {
                bars: store.clone(),
                signals: store.clone(),
                broker: broker.clone(),
                tracker,
                ledger,
            },
            &config,
            rx,
        ));
        Harness {
            store,
            broker,
            pipeline,
            shutdown,
        }
    }

    fn rising(symbol: &str, n: usize) -> Vec<Bar> {
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + (i * i) as f64 * 0.2).collect();
        from_closes(&closes)
            .into_iter()
            .map(|b| Bar {
                symbol: symbol.to_string(),
                ..b
            })
            .collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn short_history_is_a_recorded_no_op() {
        let h = harness(config());
        h.store.append(&rising("AAA", 4)).unwrap();

        let result = h.pipeline.tick("AAA", now()).await;
        assert_eq!(result.action, TickAction::NoOp);
        assert!(!result.snapshot.should_trade);
        assert_eq!(h.store.recent_signals("AAA", 10).unwrap().len(), 1);
        assert_eq!(h.broker.open_calls(), 0);
    }

    #[tokio::test]
    async fn bullish_signal_opens_then_holds() {
        let h = harness(config());
        h.store.append(&rising("AAA", 30)).unwrap();

        let first = h.pipeline.tick("AAA", now()).await;
        assert_eq!(first.action, TickAction::Opened);
        let trade = first.trade.unwrap();
        assert_eq!(trade.side(), Side::Long);
        assert_eq!(trade.quantity(), 18.0);
        assert_eq!(h.store.trades(Some(TradeStatus::Open)).unwrap().len(), 1);

        let second = h.pipeline.tick("AAA", now()).await;
        assert_eq!(second.action, TickAction::Held);
        assert_eq!(h.broker.open_calls(), 1);
        assert_eq!(h.pipeline.latest_result("AAA").unwrap().action, TickAction::Held);
    }

    #[tokio::test]
    async fn stop_loss_bar_closes_and_books_pnl() {
        let h = harness(config());
        let mut bars = rising("AAA", 30);
        h.store.append(&bars).unwrap();
        let opened = h.pipeline.tick("AAA", now()).await.trade.unwrap();

        let last = bars.pop().unwrap();
        h.store
            .append(&[Bar {
                timestamp: last.timestamp + chrono::Duration::hours(1),
                open: last.close,
                high: last.close,
                low: opened.stop_loss() - 1.0,
                close: opened.stop_loss() - 0.5,
                ..last
            }])
            .unwrap();

        let result = h.pipeline.tick("AAA", now()).await;
        assert_eq!(result.action, TickAction::Closed);
        let closed = result.trade.unwrap();
        assert_eq!(closed.exit_price(), Some(opened.stop_loss()));
        assert!(closed.pnl().unwrap() < 0.0);
        approx::assert_relative_eq!(closed.r_multiple().unwrap(), -1.0, epsilon = 1e-9);

        let account = result.account.unwrap();
        approx::assert_relative_eq!(account.total_pnl, closed.pnl().unwrap());
        assert_eq!(h.store.latest_snapshot().unwrap(), Some(account));
        assert_eq!(h.pipeline.tracker().open_count(), 0);
    }

    #[tokio::test]
    async fn transient_broker_failures_are_retried() {
        let h = harness(config());
        h.store.append(&rising("AAA", 30)).unwrap();
        h.broker.fail_next(2);

        let result = h.pipeline.tick("AAA", now()).await;
        assert_eq!(result.action, TickAction::Opened);
        assert_eq!(h.broker.open_calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_record_failure_without_trade() {
        let h = harness(config());
        h.store.append(&rising("AAA", 30)).unwrap();
        h.broker.fail_next(10);

        let result = h.pipeline.tick("AAA", now()).await;
        assert_eq!(result.action, TickAction::NoOp);
        assert!(result.failure.unwrap().contains("3 attempts"));
        assert!(h.store.trades(None).unwrap().is_empty());
        assert!(h.store.latest_snapshot().unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_blocks_new_orders() {
        let h = harness(config());
        h.store.append(&rising("AAA", 30)).unwrap();
        h.shutdown.send(true).unwrap();

        let result = h.pipeline.tick("AAA", now()).await;
        assert_eq!(result.action, TickAction::NoOp);
        assert!(result.failure.is_some());
        assert_eq!(h.broker.open_calls(), 0);
    }

    #[tokio::test]
    async fn lost_trade_write_shows_up_in_reconciliation() {
        let h = harness(config());
        h.store.append(&rising("AAA", 30)).unwrap();
        h.store.fail_writes(true);

        let result = h.pipeline.tick("AAA", now()).await;
        assert_eq!(result.action, TickAction::NoOp);
        assert!(result.failure.is_some());
        assert_eq!(h.pipeline.tracker().open_count(), 0);

        let report = h.pipeline.reconcile().await.unwrap();
        assert_eq!(report.untracked_at_broker, vec!["AAA".to_string()]);
    }

    #[tokio::test]
    async fn cycle_ticks_all_symbols_and_snapshots() {
        let mut cfg = config();
        cfg.pipeline.snapshot_every = 1;
        let h = harness(cfg);
        h.store.append(&rising("AAA", 30)).unwrap();
        h.store.append(&rising("BBB", 30)).unwrap();

        let symbols = vec!["BBB".to_string(), "AAA".to_string(), "AAA".to_string()];
        let results = h.pipeline.run_cycle(&symbols, now()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].symbol, "AAA");
        assert!(results.iter().all(|r| r.action == TickAction::Opened));
        assert_eq!(h.pipeline.tracker().open_count(), 2);
        assert_eq!(h.store.snapshots(10).unwrap().len(), 1);
        assert!(h.pipeline.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn manual_close_uses_last_mark() {
        let h = harness(config());
        h.store.append(&rising("AAA", 30)).unwrap();
        h.pipeline.tick("AAA", now()).await;

        let result = h.pipeline.close_manually("AAA").await.unwrap();
        let closed = result.trade.unwrap();
        assert_eq!(closed.exit_price(), Some(closed.entry_price()));
        assert_eq!(closed.pnl(), Some(0.0));
        assert!(matches!(
            h.pipeline.close_manually("AAA").await,
            Err(SigtraderError::NoOpenTrade { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_entries_respect_position_cap() {
        let mut cfg = config();
        cfg.gate.max_open_positions = 1;
        let h = harness(cfg);
        h.store.append(&rising("AAA", 30)).unwrap();
        h.store.append(&rising("BBB", 30)).unwrap();
        h.broker.set_latency(Some(Duration::from_millis(20)));

        let symbols = vec!["AAA".to_string(), "BBB".to_string()];
        let results = h.pipeline.run_cycle(&symbols, now()).await;
        let opened: Vec<_> = results.iter().filter(|r| r.action == TickAction::Opened).collect();
        assert_eq!(opened.len(), 1);
        assert_eq!(h.pipeline.tracker().open_count(), 1);
        assert_eq!(h.broker.open_calls(), 1);

        let blocked = results.iter().find(|r| r.action != TickAction::Opened).unwrap();
        assert_eq!(blocked.action, TickAction::NoOp);
        assert!(blocked.failure.as_ref().unwrap().contains("position limit"));
        assert!(h.pipeline.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn entry_bar_is_not_checked_for_exits() {
        let h = harness(config());
        let bars: Vec<Bar> = rising("AAA", 30)
            .into_iter()
            .map(|b| Bar {
                low: b.close * 0.97,
                ..b
            })
            .collect();
        h.store.append(&bars).unwrap();

        let first = h.pipeline.tick("AAA", now()).await;
        assert_eq!(first.action, TickAction::Opened);
        let trade = first.trade.unwrap();
        assert!(bars.last().unwrap().low < trade.stop_loss());
        assert_eq!(trade.checklist().bar_timestamp, Some(bars.last().unwrap().timestamp));

        let second = h.pipeline.tick("AAA", now()).await;
        assert_eq!(second.action, TickAction::Held);
        assert_eq!(second.decision, Decision::NoOp(NoOpReason::BarAlreadyEvaluated));
        assert_eq!(h.broker.close_calls(), 0);
        assert_eq!(h.pipeline.tracker().open_count(), 1);
    }

    #[tokio::test]
    async fn restored_trade_skips_its_entry_bar() {
        let h = harness(config());
        let bars: Vec<Bar> = rising("AAA", 30)
            .into_iter()
            .map(|b| Bar {
                low: b.close * 0.97,
                ..b
            })
            .collect();
        h.store.append(&bars).unwrap();
        h.pipeline.tick("AAA", now()).await;

        let tracker = Arc::new(PositionTracker::load(h.store.clone()).unwrap());
        let broker = Arc::new(PaperBroker::new());
        for trade in tracker.open_trades() {
            broker.adopt(&trade);
        }
        let (_tx, rx) = watch::channel(false);
        let restarted = Pipeline::new(
            PipelinePorts {
                bars: h.store.clone(),
                signals: h.store.clone(),
                broker: broker.clone(),
                tracker,
                ledger: Arc::new(AccountLedger::new(h.store.clone(), 10_000.0)),
            },
            &config(),
            rx,
        );

        let result = restarted.tick("AAA", now()).await;
        assert_eq!(result.action, TickAction::Held);
        assert_eq!(broker.close_calls(), 0);
    }

    #[tokio::test]
    async fn unpersisted_close_is_booked_and_written_later() {
        let h = harness(config());
        h.store.append(&rising("AAA", 30)).unwrap();
        h.pipeline.tick("AAA", now()).await;
        h.store.fail_writes(true);

        let result = h.pipeline.close_manually("AAA").await.unwrap();
        assert_eq!(result.action, TickAction::Closed);
        assert!(result.failure.is_some());
        let closed = result.trade.unwrap();
        approx::assert_relative_eq!(h.pipeline.ledger().total_pnl(), closed.pnl().unwrap());
        assert_eq!(h.pipeline.tracker().open_count(), 0);

        let report = h.pipeline.reconcile().await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.unpersisted_closes, vec!["AAA".to_string()]);

        let last = h.store.latest("AAA", "1h", 1).unwrap().pop().unwrap();
        h.store.fail_writes(false);
        h.store
            .append(&[Bar {
                timestamp: last.timestamp + chrono::Duration::hours(1),
                ..last
            }])
            .unwrap();
        h.store.fail_writes(true);
        let blocked = h.pipeline.tick("AAA", now()).await;
        assert_ne!(blocked.action, TickAction::Opened);
        assert_eq!(h.broker.open_calls(), 1);

        h.store.fail_writes(false);
        h.pipeline.tick("AAA", now()).await;
        let stored = h.store.trades(None).unwrap();
        let row = stored.iter().find(|t| t.id() == closed.id()).unwrap();
        assert_eq!(row.status(), TradeStatus::Closed);
        assert_eq!(row.pnl(), closed.pnl());
        assert!(h.pipeline.reconcile().await.unwrap().unpersisted_closes.is_empty());
        assert!(PositionTracker::load(h.store.clone()).is_ok());
    }

    #[tokio::test]
    async fn timed_out_open_is_not_filled_twice() {
        let h = harness(config());
        h.store.append(&rising("AAA", 30)).unwrap();
        h.broker.set_fill_delay(Some(Duration::from_millis(300)));

        let result = h.pipeline.tick("AAA", now()).await;
        assert_eq!(result.action, TickAction::Opened);
        assert_eq!(h.broker.open_calls(), 1);
        assert_eq!(h.pipeline.tracker().open_count(), 1);
        assert!(h.pipeline.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let mut cfg = config();
        cfg.pipeline.symbols = vec!["AAA".into()];
        cfg.pipeline.interval_secs = 1;
        let h = harness(cfg);
        h.store.append(&rising("AAA", 30)).unwrap();

        let pipeline = h.pipeline.clone();
        let handle = tokio::spawn(async move { pipeline.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(h.pipeline.latest_result("AAA").is_some());
    }
}
