//! SQLite persistence adapter.
//!
//! Implements the bar store and all persistence ports over an r2d2 pool.
//! Enums are stored as their lowercase names, timestamps as RFC 3339 text
//! (UTC, microseconds) so that text order is time order, and the checklist
//! and indicator readings as JSON.

use crate::domain::bar::Bar;
use crate::domain::error::SigtraderError;
use crate::domain::ledger::AccountSnapshot;
use crate::domain::signal::{IndicatorReadings, SignalSnapshot};
use crate::domain::trade::{Checklist, NewTrade, Trade, TradeClosure, TradeStatus};
use crate::ports::bar_store::BarStore;
use crate::ports::config_port::ConfigPort;
use crate::ports::persistence::{AccountStore, SignalStore, TradeStore};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    UNIQUE (symbol, timeframe, timestamp)
);
CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    qty REAL NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL,
    stop_loss REAL NOT NULL,
    take_profit REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    pnl REAL,
    r_multiple REAL,
    confidence REAL NOT NULL,
    opened_at TEXT NOT NULL,
    closed_at TEXT,
    checklist_snapshot TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_open_symbol ON trades(symbol) WHERE status = 'open';
CREATE TABLE IF NOT EXISTS account_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cash REAL NOT NULL,
    equity REAL NOT NULL,
    day_pnl REAL NOT NULL,
    total_pnl REAL NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS signal_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    signals TEXT NOT NULL,
    score REAL NOT NULL,
    confidence REAL NOT NULL,
    bias TEXT NOT NULL,
    should_trade INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signal_snapshots_symbol ON signal_snapshots(symbol, id);
";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

fn query_err(e: rusqlite::Error) -> SigtraderError {
    SigtraderError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn json_err(e: serde_json::Error) -> SigtraderError {
    SigtraderError::InvalidData {
        reason: e.to_string(),
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, SigtraderError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SigtraderError::InvalidData {
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

/// Raw `trades` row, converted to a [`Trade`] outside the row callback.
struct TradeRow {
    id: i64,
    symbol: String,
    side: String,
    qty: f64,
    entry_price: f64,
    exit_price: Option<f64>,
    stop_loss: f64,
    take_profit: f64,
    status: String,
    pnl: Option<f64>,
    r_multiple: Option<f64>,
    confidence: f64,
    opened_at: String,
    closed_at: Option<String>,
    checklist: String,
}

const TRADE_COLUMNS: &str = "id, symbol, side, qty, entry_price, exit_price, stop_loss, take_profit,
    status, pnl, r_multiple, confidence, opened_at, closed_at, checklist_snapshot";

impl TradeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(TradeRow {
            id: row.get(0)?,
            symbol: row.get(1)?,
            side: row.get(2)?,
            qty: row.get(3)?,
            entry_price: row.get(4)?,
            exit_price: row.get(5)?,
            stop_loss: row.get(6)?,
            take_profit: row.get(7)?,
            status: row.get(8)?,
            pnl: row.get(9)?,
            r_multiple: row.get(10)?,
            confidence: row.get(11)?,
            opened_at: row.get(12)?,
            closed_at: row.get(13)?,
            checklist: row.get(14)?,
        })
    }

    fn into_trade(self) -> Result<Trade, SigtraderError> {
        let checklist: Checklist = serde_json::from_str(&self.checklist).map_err(json_err)?;
        let status: TradeStatus = self.status.parse()?;

        let closure = match (status, self.exit_price, self.pnl, self.r_multiple, &self.closed_at) {
            (TradeStatus::Open, ..) => None,
            (TradeStatus::Closed, Some(exit_price), Some(pnl), Some(r_multiple), Some(closed_at)) => {
                Some(TradeClosure {
                    exit_price,
                    pnl,
                    r_multiple,
                    closed_at: parse_ts(closed_at)?,
                })
            }
            (TradeStatus::Closed, ..) => {
                return Err(SigtraderError::InvalidData {
                    reason: format!("closed trade {} is missing exit fields", self.id),
                });
            }
        };

        Trade::restore(
            self.id,
            NewTrade {
                symbol: self.symbol,
                side: self.side.parse()?,
                quantity: self.qty,
                entry_price: self.entry_price,
                stop_loss: self.stop_loss,
                take_profit: self.take_profit,
                confidence: self.confidence,
                opened_at: parse_ts(&self.opened_at)?,
                checklist,
            },
            closure,
        )
    }
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, SigtraderError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| SigtraderError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;

        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;

        let manager = SqliteConnectionManager::file(&db_path);
        let pool =
            Pool::builder()
                .max_size(pool_size)
                .build(manager)
                .map_err(|e: r2d2::Error| SigtraderError::Database {
                    reason: e.to_string(),
                })?;

        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, SigtraderError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e: r2d2::Error| SigtraderError::Database {
                reason: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, SigtraderError> {
        self.pool
            .get()
            .map_err(|e: r2d2::Error| SigtraderError::Database {
                reason: e.to_string(),
            })
    }

    pub fn initialize_schema(&self) -> Result<(), SigtraderError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_err)
    }

    fn query_trades(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Trade>, SigtraderError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(query_err)?;
        let rows = stmt
            .query_map(params, TradeRow::from_row)
            .map_err(query_err)?;

        let mut trades = Vec::new();
        for row in rows {
            trades.push(row.map_err(query_err)?.into_trade()?);
        }
        Ok(trades)
    }

    pub fn trade(&self, id: i64) -> Result<Option<Trade>, SigtraderError> {
        let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE id = ?1");
        Ok(self.query_trades(&sql, &[&id])?.into_iter().next())
    }
}

impl BarStore for SqliteAdapter {
    fn latest(
        &self,
        symbol: &str,
        timeframe: &str,
        lookback: usize,
    ) -> Result<Vec<Bar>, SigtraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT symbol, timeframe, timestamp, open, high, low, close, volume
                 FROM bars
                 WHERE symbol = ?1 AND timeframe = ?2
                 ORDER BY timestamp DESC
                 LIMIT ?3",
            )
            .map_err(query_err)?;

        let rows = stmt
            .query_map(params![symbol, timeframe, lookback as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                ))
            })
            .map_err(query_err)?;

        let mut bars = Vec::new();
        for row in rows {
            let (symbol, timeframe, ts, open, high, low, close, volume) = row.map_err(query_err)?;
            bars.push(Bar {
                symbol,
                timeframe,
                timestamp: parse_ts(&ts)?,
                open,
                high,
                low,
                close,
                volume,
            });
        }
        bars.reverse();
        Ok(bars)
    }

    fn append(&self, bars: &[Bar]) -> Result<usize, SigtraderError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;

        let mut inserted = 0;
        for bar in bars {
            inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO bars (symbol, timeframe, timestamp, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        bar.symbol,
                        bar.timeframe,
                        format_ts(&bar.timestamp),
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume
                    ],
                )
                .map_err(query_err)?;
        }

        tx.commit().map_err(query_err)?;
        Ok(inserted)
    }

    fn symbols(&self, timeframe: &str) -> Result<Vec<String>, SigtraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT symbol FROM bars WHERE timeframe = ?1 ORDER BY symbol")
            .map_err(query_err)?;

        let rows = stmt
            .query_map(params![timeframe], |row| row.get(0))
            .map_err(query_err)?;

        let mut symbols = Vec::new();
        for row in rows {
            symbols.push(row.map_err(query_err)?);
        }
        Ok(symbols)
    }
}

impl TradeStore for SqliteAdapter {
    fn insert_trade(&self, trade: &Trade) -> Result<(), SigtraderError> {
        let checklist = serde_json::to_string(trade.checklist()).map_err(json_err)?;
        self.conn()?
            .execute(
                "INSERT INTO trades (id, symbol, side, qty, entry_price, exit_price, stop_loss,
                    take_profit, status, pnl, r_multiple, confidence, opened_at, closed_at,
                    checklist_snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    trade.id(),
                    trade.symbol(),
                    trade.side().as_str(),
                    trade.quantity(),
                    trade.entry_price(),
                    trade.exit_price(),
                    trade.stop_loss(),
                    trade.take_profit(),
                    trade.status().as_str(),
                    trade.pnl(),
                    trade.r_multiple(),
                    trade.confidence(),
                    format_ts(&trade.opened_at()),
                    trade.closed_at().as_ref().map(format_ts),
                    checklist
                ],
            )
            .map_err(query_err)?;
        Ok(())
    }

    fn update_closed(&self, trade: &Trade) -> Result<(), SigtraderError> {
        let closure = trade.closure().ok_or_else(|| SigtraderError::Invariant {
            reason: format!("trade {} is still open", trade.id()),
        })?;

        let updated = self
            .conn()?
            .execute(
                "UPDATE trades
                 SET exit_price = ?2, pnl = ?3, r_multiple = ?4, closed_at = ?5, status = 'closed'
                 WHERE id = ?1 AND status = 'open'",
                params![
                    trade.id(),
                    closure.exit_price,
                    closure.pnl,
                    closure.r_multiple,
                    format_ts(&closure.closed_at)
                ],
            )
            .map_err(query_err)?;

        if updated == 0 {
            return match self.trade(trade.id())? {
                Some(_) => Err(SigtraderError::TradeAlreadyClosed { id: trade.id() }),
                None => Err(SigtraderError::DatabaseQuery {
                    reason: format!("unknown trade id {}", trade.id()),
                }),
            };
        }
        Ok(())
    }

    fn trades(&self, status: Option<TradeStatus>) -> Result<Vec<Trade>, SigtraderError> {
        match status {
            Some(status) => {
                let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE status = ?1 ORDER BY id");
                self.query_trades(&sql, &[&status.as_str()])
            }
            None => {
                let sql = format!("SELECT {TRADE_COLUMNS} FROM trades ORDER BY id");
                self.query_trades(&sql, &[])
            }
        }
    }

    fn max_trade_id(&self) -> Result<Option<i64>, SigtraderError> {
        self.conn()?
            .query_row("SELECT MAX(id) FROM trades", [], |row| row.get(0))
            .map_err(query_err)
    }
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(f64, f64, f64, f64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn build_snapshot(
    (cash, equity, day_pnl, total_pnl, ts): (f64, f64, f64, f64, String),
) -> Result<AccountSnapshot, SigtraderError> {
    Ok(AccountSnapshot {
        cash,
        equity,
        day_pnl,
        total_pnl,
        timestamp: parse_ts(&ts)?,
    })
}

impl AccountStore for SqliteAdapter {
    fn append_snapshot(&self, snapshot: &AccountSnapshot) -> Result<i64, SigtraderError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO account_snapshots (cash, equity, day_pnl, total_pnl, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.cash,
                snapshot.equity,
                snapshot.day_pnl,
                snapshot.total_pnl,
                format_ts(&snapshot.timestamp)
            ],
        )
        .map_err(query_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn latest_snapshot(&self) -> Result<Option<AccountSnapshot>, SigtraderError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT cash, equity, day_pnl, total_pnl, timestamp
                 FROM account_snapshots ORDER BY id DESC LIMIT 1",
                [],
                snapshot_from_row,
            )
            .optional()
            .map_err(query_err)?;
        row.map(build_snapshot).transpose()
    }

    fn snapshots(&self, limit: usize) -> Result<Vec<AccountSnapshot>, SigtraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT cash, equity, day_pnl, total_pnl, timestamp
                 FROM account_snapshots ORDER BY id DESC LIMIT ?1",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![limit as i64], snapshot_from_row)
            .map_err(query_err)?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(build_snapshot(row.map_err(query_err)?)?);
        }
        Ok(snapshots)
    }
}

impl SignalStore for SqliteAdapter {
    fn save_signal(&self, snapshot: &SignalSnapshot) -> Result<i64, SigtraderError> {
        let signals = match &snapshot.readings {
            Some(readings) => serde_json::to_string(readings),
            None => serde_json::to_string(&snapshot.signal_map()),
        }
        .map_err(json_err)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO signal_snapshots (symbol, timestamp, signals, score, confidence, bias, should_trade)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.symbol,
                format_ts(&snapshot.timestamp),
                signals,
                snapshot.score,
                snapshot.confidence,
                snapshot.bias.as_str(),
                snapshot.should_trade as i64
            ],
        )
        .map_err(query_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn recent_signals(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SignalSnapshot>, SigtraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT symbol, timestamp, signals, score, confidence, bias, should_trade
                 FROM signal_snapshots WHERE symbol = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![symbol, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .map_err(query_err)?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (symbol, ts, signals, score, confidence, bias, should_trade) =
                row.map_err(query_err)?;
            snapshots.push(SignalSnapshot {
                symbol,
                timestamp: parse_ts(&ts)?,
                // Snapshots without history carry a status map, not readings.
                readings: serde_json::from_str::<IndicatorReadings>(&signals).ok(),
                score,
                confidence,
                bias: bias.parse()?,
                should_trade: should_trade != 0,
            });
        }
        Ok(snapshots)
    }
}
