//! Domain error types.

/// Reasons a position cannot be sized. No state is mutated when sizing fails.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SizingError {
    #[error("non-positive price {price}")]
    NonPositivePrice { price: f64 },

    #[error("non-positive equity {equity}")]
    NonPositiveEquity { equity: f64 },

    #[error("stop distance {distance} is not positive")]
    NonPositiveStopDistance { distance: f64 },

    #[error("quantity rounds to zero (raw {raw}, lot size {lot_size})")]
    ZeroQuantity { raw: f64, lot_size: f64 },
}

/// Top-level error type for sigtrader.
#[derive(Debug, thiserror::Error)]
pub enum SigtraderError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Sizing(#[from] SizingError),

    #[error("broker rejected {operation}: {reason}")]
    BrokerRejected { operation: String, reason: String },

    #[error("broker unavailable during {operation}: {reason}")]
    BrokerUnavailable { operation: String, reason: String },

    #[error("broker {operation} timed out after {timeout_ms}ms")]
    BrokerTimeout { operation: String, timeout_ms: u64 },

    #[error("broker {operation} failed after {attempts} attempts: {last_error}")]
    BrokerExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("invariant violated: {reason}")]
    Invariant { reason: String },

    #[error("trade {id} is already closed")]
    TradeAlreadyClosed { id: i64 },

    #[error("no open trade for {symbol}")]
    NoOpenTrade { symbol: String },

    #[error("position limit of {max} reached")]
    PositionLimit { max: usize },

    #[error("{symbol} cannot take a new entry: {reason}")]
    SymbolBusy { symbol: String, reason: String },

    #[error("invalid data: {reason}")]
    InvalidData { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SigtraderError {
    /// Broker failures that may succeed on a later attempt.
    pub fn is_broker_error(&self) -> bool {
        matches!(
            self,
            SigtraderError::BrokerRejected { .. }
                | SigtraderError::BrokerUnavailable { .. }
                | SigtraderError::BrokerTimeout { .. }
        )
    }
}

impl From<&SigtraderError> for std::process::ExitCode {
    fn from(err: &SigtraderError) -> Self {
        let code: u8 = match err {
            SigtraderError::Io(_) => 1,
            SigtraderError::ConfigParse { .. }
            | SigtraderError::ConfigMissing { .. }
            | SigtraderError::ConfigInvalid { .. } => 2,
            SigtraderError::Database { .. } | SigtraderError::DatabaseQuery { .. } => 3,
            SigtraderError::InvalidData { .. } => 4,
            SigtraderError::BrokerRejected { .. }
            | SigtraderError::BrokerUnavailable { .. }
            | SigtraderError::BrokerTimeout { .. }
            | SigtraderError::BrokerExhausted { .. } => 5,
            SigtraderError::Sizing(_)
            | SigtraderError::Invariant { .. }
            | SigtraderError::TradeAlreadyClosed { .. }
            | SigtraderError::NoOpenTrade { .. }
            | SigtraderError::PositionLimit { .. }
            | SigtraderError::SymbolBusy { .. } => 6,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_error_is_transparent() {
        let err: SigtraderError = SizingError::NonPositiveStopDistance { distance: 0.0 }.into();
        assert_eq!(err.to_string(), "stop distance 0 is not positive");
    }

    #[test]
    fn broker_errors_are_classified() {
        let rejected = SigtraderError::BrokerRejected {
            operation: "open".into(),
            reason: "margin".into(),
        };
        let invariant = SigtraderError::Invariant {
            reason: "x".into(),
        };
        assert!(rejected.is_broker_error());
        assert!(!invariant.is_broker_error());
    }

    #[test]
    fn config_missing_message() {
        let config = SigtraderError::ConfigMissing {
            section: "sqlite".into(),
            key: "path".into(),
        };
        assert_eq!(config.to_string(), "missing config key [sqlite] path");
    }
}
