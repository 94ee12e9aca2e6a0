//! Configuration validation.
//!
//! Reads every section through [`ConfigPort`], checks ranges, and builds the
//! typed configs the pipeline is assembled from. Missing keys fall back to
//! defaults except `[account] initial_capital`.

use crate::domain::decision::GateConfig;
use crate::domain::error::SigtraderError;
use crate::domain::pipeline::{PipelineConfig, TradingConfig};
use crate::domain::retry::RetryPolicy;
use crate::domain::risk::RiskConfig;
use crate::domain::signal::{SignalConfig, SignalWeights};
use crate::domain::trade::TieBreak;
use crate::ports::config_port::ConfigPort;

pub fn load_trading_config(config: &dyn ConfigPort) -> Result<TradingConfig, SigtraderError> {
    Ok(TradingConfig {
        initial_capital: validate_initial_capital(config)?,
        pipeline: build_pipeline_config(config)?,
        signal: build_signal_config(config)?,
        gate: build_gate_config(config)?,
        risk: build_risk_config(config)?,
        retry: build_retry_policy(config)?,
    })
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> SigtraderError {
    SigtraderError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn period(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: usize,
) -> Result<usize, SigtraderError> {
    let value = config.get_int(section, key, default as i64);
    if value < 1 {
        return Err(invalid(section, key, format!("{key} must be at least 1")));
    }
    Ok(value as usize)
}

fn non_negative(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<f64, SigtraderError> {
    let value = config.get_double(section, key, default);
    if value.is_nan() || value < 0.0 {
        return Err(invalid(section, key, format!("{key} must be non-negative")));
    }
    Ok(value)
}

fn unit_interval(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<f64, SigtraderError> {
    let value = config.get_double(section, key, default);
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(section, key, format!("{key} must be between 0 and 1")));
    }
    Ok(value)
}

fn validate_initial_capital(config: &dyn ConfigPort) -> Result<f64, SigtraderError> {
    if config.get_string("account", "initial_capital").is_none() {
        return Err(SigtraderError::ConfigMissing {
            section: "account".to_string(),
            key: "initial_capital".to_string(),
        });
    }
    let value = config.get_double("account", "initial_capital", 0.0);
    if value.is_nan() || value <= 0.0 {
        return Err(invalid(
            "account",
            "initial_capital",
            "initial_capital must be positive",
        ));
    }
    Ok(value)
}

pub fn build_pipeline_config(config: &dyn ConfigPort) -> Result<PipelineConfig, SigtraderError> {
    let defaults = PipelineConfig::default();

    let timeframe = config
        .get_string("pipeline", "timeframe")
        .unwrap_or(defaults.timeframe);
    if timeframe.trim().is_empty() {
        return Err(invalid("pipeline", "timeframe", "timeframe must not be empty"));
    }

    let snapshot_every = config.get_int("pipeline", "snapshot_every", 0);
    if snapshot_every < 0 {
        return Err(invalid(
            "pipeline",
            "snapshot_every",
            "snapshot_every must be non-negative",
        ));
    }

    Ok(PipelineConfig {
        symbols: config.get_list("pipeline", "symbols"),
        timeframe: timeframe.trim().to_string(),
        lookback: period(config, "pipeline", "lookback", defaults.lookback)?,
        interval_secs: period(config, "pipeline", "interval_secs", defaults.interval_secs as usize)?
            as u64,
        snapshot_every: snapshot_every as u64,
    })
}

pub fn build_signal_config(config: &dyn ConfigPort) -> Result<SignalConfig, SigtraderError> {
    let d = SignalConfig::default();
    let s = "signal";

    let ema_fast = period(config, s, "ema_fast", d.ema_fast)?;
    let ema_slow = period(config, s, "ema_slow", d.ema_slow)?;
    if ema_fast >= ema_slow {
        return Err(invalid(s, "ema_fast", "ema_fast must be shorter than ema_slow"));
    }

    let macd_fast = period(config, s, "macd_fast", d.macd_fast)?;
    let macd_slow = period(config, s, "macd_slow", d.macd_slow)?;
    if macd_fast >= macd_slow {
        return Err(invalid(s, "macd_fast", "macd_fast must be shorter than macd_slow"));
    }

    let rsi_band = config.get_double(s, "rsi_band", d.rsi_band);
    if !(0.0..50.0).contains(&rsi_band) {
        return Err(invalid(s, "rsi_band", "rsi_band must be in [0, 50)"));
    }

    Ok(SignalConfig {
        ema_fast,
        ema_slow,
        rsi_period: period(config, s, "rsi_period", d.rsi_period)?,
        rsi_band,
        macd_fast,
        macd_slow,
        macd_signal: period(config, s, "macd_signal", d.macd_signal)?,
        roc_period: period(config, s, "roc_period", d.roc_period)?,
        roc_threshold: non_negative(config, s, "roc_threshold", d.roc_threshold)?,
        atr_period: period(config, s, "atr_period", d.atr_period)?,
        swing_lookback: period(config, s, "swing_lookback", d.swing_lookback)?,
        weights: SignalWeights {
            trend: non_negative(config, s, "weight_trend", d.weights.trend)?,
            momentum: non_negative(config, s, "weight_momentum", d.weights.momentum)?,
            macd: non_negative(config, s, "weight_macd", d.weights.macd)?,
            rate_of_change: non_negative(config, s, "weight_roc", d.weights.rate_of_change)?,
        },
        neutral_band: non_negative(config, s, "neutral_band", d.neutral_band)?,
        min_score: non_negative(config, s, "min_score", d.min_score)?,
        min_confidence: unit_interval(config, s, "min_confidence", d.min_confidence)?,
    })
}

pub fn build_gate_config(config: &dyn ConfigPort) -> Result<GateConfig, SigtraderError> {
    let d = GateConfig::default();
    let s = "gate";

    let tie_break = match config.get_string(s, "tie_break") {
        None => d.tie_break,
        Some(raw) => raw
            .trim()
            .parse::<TieBreak>()
            .map_err(|_| invalid(s, "tie_break", "tie_break must be stop_loss or take_profit"))?,
    };

    Ok(GateConfig {
        min_confidence: unit_interval(config, s, "min_confidence", d.min_confidence)?,
        min_score: non_negative(config, s, "min_score", d.min_score)?,
        max_open_positions: period(config, s, "max_open_positions", d.max_open_positions)?,
        allow_shorting: config.get_bool(s, "allow_shorting", d.allow_shorting),
        close_on_reversal: config.get_bool(s, "close_on_reversal", d.close_on_reversal),
        tie_break,
    })
}

pub fn build_risk_config(config: &dyn ConfigPort) -> Result<RiskConfig, SigtraderError> {
    let d = RiskConfig::default();
    let s = "risk";

    let stop_loss_pct = config.get_double(s, "stop_loss_pct", d.stop_loss_pct);
    if !(stop_loss_pct > 0.0 && stop_loss_pct < 100.0) {
        return Err(invalid(s, "stop_loss_pct", "stop_loss_pct must be between 0 and 100"));
    }

    let reward_risk = config.get_double(s, "reward_risk", d.reward_risk);
    if reward_risk.is_nan() || reward_risk <= 0.0 {
        return Err(invalid(s, "reward_risk", "reward_risk must be positive"));
    }

    let risk_fraction = config.get_double(s, "risk_fraction", d.risk_fraction);
    if !(risk_fraction > 0.0 && risk_fraction <= 1.0) {
        return Err(invalid(s, "risk_fraction", "risk_fraction must be in (0, 1]"));
    }

    Ok(RiskConfig {
        stop_loss_pct,
        reward_risk,
        risk_fraction,
        lot_size: non_negative(config, s, "lot_size", d.lot_size)?,
        use_structural_stop: config.get_bool(s, "use_structural_stop", d.use_structural_stop),
        cap_by_cash: config.get_bool(s, "cap_by_cash", d.cap_by_cash),
    })
}

pub fn build_retry_policy(config: &dyn ConfigPort) -> Result<RetryPolicy, SigtraderError> {
    let d = RetryPolicy::default();
    let s = "broker";

    let backoff_ms_initial = config.get_int(s, "backoff_ms_initial", d.backoff_ms_initial as i64);
    if backoff_ms_initial < 0 {
        return Err(invalid(
            s,
            "backoff_ms_initial",
            "backoff_ms_initial must be non-negative",
        ));
    }
    let backoff_ms_max = config.get_int(s, "backoff_ms_max", d.backoff_ms_max as i64);
    if backoff_ms_max < backoff_ms_initial {
        return Err(invalid(
            s,
            "backoff_ms_max",
            "backoff_ms_max must be at least backoff_ms_initial",
        ));
    }

    Ok(RetryPolicy {
        timeout_ms: period(config, s, "timeout_ms", d.timeout_ms as usize)? as u64,
        max_attempts: period(config, s, "max_attempts", d.max_attempts as usize)? as u32,
        backoff_ms_initial: backoff_ms_initial as u64,
        backoff_multiplier: period(config, s, "backoff_multiplier", d.backoff_multiplier as usize)?
            as u32,
        backoff_ms_max: backoff_ms_max as u64,
    })
}

/// Path of the SQLite database file.
pub fn database_path(config: &dyn ConfigPort) -> Result<String, SigtraderError> {
    match config.get_string("sqlite", "path") {
        Some(path) if !path.trim().is_empty() => Ok(path.trim().to_string()),
        _ => Err(SigtraderError::ConfigMissing {
            section: "sqlite".to_string(),
            key: "path".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    fn key_of(err: SigtraderError) -> String {
        match err {
            SigtraderError::ConfigInvalid { key, .. } | SigtraderError::ConfigMissing { key, .. } => key,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn full_config_builds() {
        let config = make_config(
            r#"
[account]
initial_capital = 25000

[pipeline]
symbols = BTCUSD, ETHUSD
timeframe = 15m
lookback = 200
interval_secs = 30
snapshot_every = 4

[signal]
ema_fast = 9
ema_slow = 21
weight_macd = 0.5

[gate]
min_confidence = 0.75
max_open_positions = 3
allow_shorting = true
tie_break = take_profit

[risk]
stop_loss_pct = 1.5
reward_risk = 3
risk_fraction = 0.02
lot_size = 0.001

[broker]
timeout_ms = 2000
max_attempts = 4
backoff_ms_initial = 100
backoff_multiplier = 3
backoff_ms_max = 2000
"#,
        );
        let cfg = load_trading_config(&config).unwrap();
        assert_eq!(cfg.initial_capital, 25_000.0);
        assert_eq!(cfg.pipeline.symbols, vec!["BTCUSD", "ETHUSD"]);
        assert_eq!(cfg.pipeline.timeframe, "15m");
        assert_eq!(cfg.pipeline.snapshot_every, 4);
        assert_eq!(cfg.signal.ema_fast, 9);
        assert_eq!(cfg.signal.weights.macd, 0.5);
        assert_eq!(cfg.signal.rsi_period, 14);
        assert!(cfg.gate.allow_shorting);
        assert_eq!(cfg.gate.tie_break, TieBreak::TakeProfitFirst);
        assert_eq!(cfg.risk.reward_risk, 3.0);
        assert_eq!(cfg.retry.max_attempts, 4);
        assert_eq!(cfg.retry.backoff_multiplier, 3);
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = load_trading_config(&make_config("[account]\ninitial_capital = 1000\n")).unwrap();
        assert_eq!(cfg.signal, SignalConfig::default());
        assert_eq!(cfg.gate, GateConfig::default());
        assert_eq!(cfg.risk, RiskConfig::default());
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert!(cfg.pipeline.symbols.is_empty());
    }

    #[test]
    fn initial_capital_is_required_and_positive() {
        let err = load_trading_config(&make_config("[pipeline]\nlookback = 10\n")).unwrap_err();
        assert!(matches!(err, SigtraderError::ConfigMissing { ref key, .. } if key == "initial_capital"));

        let err = load_trading_config(&make_config("[account]\ninitial_capital = 0\n")).unwrap_err();
        assert!(matches!(err, SigtraderError::ConfigInvalid { ref key, .. } if key == "initial_capital"));
    }

    #[test]
    fn ema_periods_must_be_ordered() {
        let err = build_signal_config(&make_config("[signal]\nema_fast = 30\nema_slow = 20\n")).unwrap_err();
        assert_eq!(key_of(err), "ema_fast");
    }

    #[test]
    fn zero_period_fails() {
        let err = build_signal_config(&make_config("[signal]\nrsi_period = 0\n")).unwrap_err();
        assert_eq!(key_of(err), "rsi_period");
    }

    #[test]
    fn confidence_out_of_range_fails() {
        let err = build_gate_config(&make_config("[gate]\nmin_confidence = 1.5\n")).unwrap_err();
        assert_eq!(key_of(err), "min_confidence");
    }

    #[test]
    fn unknown_tie_break_fails() {
        let err = build_gate_config(&make_config("[gate]\ntie_break = both\n")).unwrap_err();
        assert_eq!(key_of(err), "tie_break");
    }

    #[test]
    fn risk_bounds_are_enforced() {
        let err = build_risk_config(&make_config("[risk]\nstop_loss_pct = 0\n")).unwrap_err();
        assert_eq!(key_of(err), "stop_loss_pct");
        let err = build_risk_config(&make_config("[risk]\nrisk_fraction = 2\n")).unwrap_err();
        assert_eq!(key_of(err), "risk_fraction");
        let err = build_risk_config(&make_config("[risk]\nreward_risk = -1\n")).unwrap_err();
        assert_eq!(key_of(err), "reward_risk");
    }

    #[test]
    fn backoff_cap_below_initial_fails() {
        let err = build_retry_policy(&make_config(
            "[broker]\nbackoff_ms_initial = 500\nbackoff_ms_max = 100\n",
        ))
        .unwrap_err();
        assert_eq!(key_of(err), "backoff_ms_max");
    }

    #[test]
    fn database_path_required() {
        assert!(database_path(&make_config("[sqlite]\n")).is_err());
        assert_eq!(
            database_path(&make_config("[sqlite]\npath = /tmp/trader.db\n")).unwrap(),
            "/tmp/trader.db"
        );
    }
}
