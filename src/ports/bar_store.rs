//! Bar storage port.

use crate::domain::bar::Bar;
use crate::domain::error::SigtraderError;

pub trait BarStore {
    /// Most recent `lookback` bars, oldest first. May return fewer when history is short.
    fn latest(
        &self,
        symbol: &str,
        timeframe: &str,
        lookback: usize,
    ) -> Result<Vec<Bar>, SigtraderError>;

    /// Append bars; bars already stored for the same (symbol, timeframe, timestamp)
    /// are left untouched. Returns the number of new rows.
    fn append(&self, bars: &[Bar]) -> Result<usize, SigtraderError>;

    fn symbols(&self, timeframe: &str) -> Result<Vec<String>, SigtraderError>;
}
