#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use sigtrader::adapters::file_config_adapter::FileConfigAdapter;
use sigtrader::domain::bar::Bar;
use sigtrader::domain::pipeline::{PipelineConfig, TradingConfig};
use sigtrader::domain::retry::RetryPolicy;
use sigtrader::domain::signal::SignalConfig;
use std::io::Write;
use std::path::Path;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()
}

pub fn flat_bar(symbol: &str, hour: i64, close: f64) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        timeframe: "1h".to_string(),
        timestamp: start() + Duration::hours(hour),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1000.0,
    }
}

/// Accelerating uptrend: close = 100 + 0.2 * i^2.
pub fn rising(symbol: &str, n: usize) -> Vec<Bar> {
    (0..n)
        .map(|i| flat_bar(symbol, i as i64, 100.0 + (i * i) as f64 * 0.2))
        .collect()
}

/// A bar one hour after `last` whose low pierces `level`.
pub fn drop_through(last: &Bar, level: f64) -> Bar {
    Bar {
        timestamp: last.timestamp + Duration::hours(1),
        open: last.close,
        high: last.close,
        low: level - 1.0,
        close: level - 0.5,
        ..last.clone()
    }
}

/// Short indicator periods so a 30-bar history is enough to trade.
pub fn small_config() -> TradingConfig {
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
        retry: RetryPolicy {
            timeout_ms: 200,
            max_attempts: 3,
            backoff_ms_initial: 1,
            backoff_multiplier: 2,
            backoff_ms_max: 4,
        },
        ..TradingConfig::default()
    }
}

/// INI equivalent of [`small_config`], minus the `[sqlite]` section.
pub const SMALL_INI: &str = r#"
[account]
initial_capital = 10000

[pipeline]
timeframe = 1h
lookback = 30
snapshot_every = 1

[signal]
ema_fast = 3
ema_slow = 6
rsi_period = 5
macd_fast = 3
macd_slow = 6
macd_signal = 3
roc_period = 3
atr_period = 3
swing_lookback = 5

[broker]
timeout_ms = 200
max_attempts = 3
backoff_ms_initial = 1
backoff_ms_max = 4
"#;

pub fn small_ini_with_db(db_path: &Path) -> String {
    format!("{SMALL_INI}\n[sqlite]\npath = {}\n", db_path.display())
}

pub fn config_from(content: &str) -> FileConfigAdapter {
    FileConfigAdapter::from_string(content).unwrap()
}

pub fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

pub fn write_csv(dir: &Path, bars: &[Bar]) {
    let first = &bars[0];
    let mut content = String::from("timestamp,open,high,low,close,volume\n");
    for b in bars {
        content.push_str(&format!(
            "{},{},{},{},{},{}\n",
            b.timestamp.to_rfc3339(),
            b.open,
            b.high,
            b.low,
            b.close,
            b.volume
        ));
    }
    std::fs::write(
        dir.join(format!("{}_{}.csv", first.symbol, first.timeframe)),
        content,
    )
    .unwrap();
}
