//! CSV bar import adapter.
//!
//! Files are named `<SYMBOL>_<TIMEFRAME>.csv` with a header row and columns
//! `timestamp,open,high,low,close,volume`. Timestamps may be RFC 3339,
//! `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date (midnight UTC).

use crate::domain::bar::Bar;
use crate::domain::error::SigtraderError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

pub struct CsvAdapter {
    base_path: PathBuf,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SigtraderError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
        .ok_or_else(|| SigtraderError::InvalidData {
            reason: format!("invalid timestamp '{raw}'"),
        })
}

fn parse_price(record: &csv::StringRecord, idx: usize, name: &str) -> Result<f64, SigtraderError> {
    record
        .get(idx)
        .ok_or_else(|| SigtraderError::InvalidData {
            reason: format!("missing {name} column"),
        })?
        .trim()
        .parse()
        .map_err(|e| SigtraderError::InvalidData {
            reason: format!("invalid {name} value: {e}"),
        })
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str, timeframe: &str) -> PathBuf {
        self.base_path.join(format!("{symbol}_{timeframe}.csv"))
    }

    pub fn fetch_bars(&self, symbol: &str, timeframe: &str) -> Result<Vec<Bar>, SigtraderError> {
        read_bars(&self.csv_path(symbol, timeframe), symbol, timeframe)
    }

    /// Symbols with a file for `timeframe`.
    pub fn list_symbols(&self, timeframe: &str) -> Result<Vec<String>, SigtraderError> {
        let entries = fs::read_dir(&self.base_path)?;

        let suffix = format!("_{timeframe}.csv");
        let mut symbols = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(symbol) = name.strip_suffix(&suffix) {
                symbols.push(symbol.to_string());
            }
        }

        symbols.sort();
        Ok(symbols)
    }
}

/// Read one file of bars for `symbol`, sorted oldest first. Rows with
/// inconsistent prices are rejected rather than skipped.
pub fn read_bars(path: &Path, symbol: &str, timeframe: &str) -> Result<Vec<Bar>, SigtraderError> {
    let content = fs::read_to_string(path).map_err(|e| SigtraderError::InvalidData {
        reason: format!("failed to read {}: {}", path.display(), e),
    })?;

    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    let mut bars = Vec::new();

    for (line, result) in rdr.records().enumerate() {
        let record = result.map_err(|e| SigtraderError::InvalidData {
            reason: format!("CSV parse error: {e}"),
        })?;

        let raw_ts = record.get(0).ok_or_else(|| SigtraderError::InvalidData {
            reason: "missing timestamp column".into(),
        })?;

        let bar = Bar {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            timestamp: parse_timestamp(raw_ts.trim())?,
            open: parse_price(&record, 1, "open")?,
            high: parse_price(&record, 2, "high")?,
            low: parse_price(&record, 3, "low")?,
            close: parse_price(&record, 4, "close")?,
            volume: parse_price(&record, 5, "volume")?,
        };

        let body_in_range = [bar.open, bar.close]
            .iter()
            .all(|p| (bar.low..=bar.high).contains(p));
        if !body_in_range {
            return Err(SigtraderError::InvalidData {
                reason: format!("row {}: prices outside the high/low range", line + 2),
            });
        }
        bars.push(bar);
    }

    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}
