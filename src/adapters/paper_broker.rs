//! Paper broker: fills every order at its reference price and keeps the
//! resulting positions in memory. Failure injection covers the retry paths;
//! fill lookups are never failed.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::domain::error::SigtraderError;
use crate::domain::trade::Trade;
use crate::ports::broker::{Broker, CloseConfirmation, Fill, OrderRequest};

#[derive(Debug, Default)]
struct PaperState {
    positions: BTreeMap<i64, (String, Fill)>,
    failures_remaining: u32,
    reject: bool,
    latency: Option<Duration>,
    fill_delay: Option<Duration>,
    open_calls: u32,
    close_calls: u32,
}

#[derive(Debug, Default)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail as if the venue were unreachable.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures_remaining = n;
    }

    pub fn set_reject(&self, reject: bool) {
        self.state.lock().reject = reject;
    }

    /// Delay applied to every call before it is answered.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Delay between recording a fill and acknowledging it.
    pub fn set_fill_delay(&self, delay: Option<Duration>) {
        self.state.lock().fill_delay = delay;
    }

    /// Hold a position for a trade restored from the store.
    pub fn adopt(&self, trade: &Trade) {
        let fill = Fill {
            trade_id: trade.id(),
            price: trade.entry_price(),
            quantity: trade.quantity(),
            filled_at: trade.opened_at(),
        };
        self.state
            .lock()
            .positions
            .insert(trade.id(), (trade.symbol().to_string(), fill));
    }

    pub fn open_calls(&self) -> u32 {
        self.state.lock().open_calls
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().close_calls
    }

    async fn gate(&self, operation: &str) -> Result<(), SigtraderError> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(SigtraderError::BrokerUnavailable {
                operation: operation.to_string(),
                reason: "paper venue unavailable".into(),
            });
        }
        if state.reject {
            return Err(SigtraderError::BrokerRejected {
                operation: operation.to_string(),
                reason: "paper venue rejecting orders".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn open_position(&self, order: &OrderRequest) -> Result<Fill, SigtraderError> {
        self.state.lock().open_calls += 1;
        self.gate("open_position").await?;

        let (fill, delay) = {
            let mut state = self.state.lock();
            if state.positions.contains_key(&order.trade_id) {
                return Err(SigtraderError::BrokerRejected {
                    operation: "open_position".into(),
                    reason: format!("trade id {} already filled", order.trade_id),
                });
            }
            let fill = Fill {
                trade_id: order.trade_id,
                price: order.reference_price,
                quantity: order.quantity,
                filled_at: Utc::now(),
            };
            state
                .positions
                .insert(order.trade_id, (order.symbol.clone(), fill.clone()));
            (fill, state.fill_delay)
        };
        debug!(trade_id = order.trade_id, symbol = %order.symbol, price = order.reference_price, "paper fill");

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(fill)
    }

    async fn close_position(
        &self,
        trade_id: i64,
        exit_price: f64,
    ) -> Result<CloseConfirmation, SigtraderError> {
        self.state.lock().close_calls += 1;
        self.gate("close_position").await?;

        let mut state = self.state.lock();
        if state.positions.remove(&trade_id).is_none() {
            return Err(SigtraderError::BrokerRejected {
                operation: "close_position".into(),
                reason: format!("no position for trade id {trade_id}"),
            });
        }
        debug!(trade_id, exit_price, "paper close");
        Ok(CloseConfirmation {
            trade_id,
            exit_price,
            closed_at: Utc::now(),
        })
    }

    async fn open_positions(&self) -> Result<Vec<String>, SigtraderError> {
        let mut symbols: Vec<String> = self
            .state
            .lock()
            .positions
            .values()
            .map(|(symbol, _)| symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    async fn find_fill(&self, trade_id: i64) -> Result<Option<Fill>, SigtraderError> {
        Ok(self
            .state
            .lock()
            .positions
            .get(&trade_id)
            .map(|(_, fill)| fill.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade::Side;

    fn order(id: i64) -> OrderRequest {
        OrderRequest {
            trade_id: id,
            symbol: "AAA".into(),
            side: Side::Long,
            quantity: 10.0,
            stop_loss: 98.0,
            take_profit: 104.0,
            reference_price: 100.0,
        }
    }

    #[tokio::test]
    async fn fills_at_reference_price() {
        let broker = PaperBroker::new();
        let fill = broker.open_position(&order(1)).await.unwrap();
        assert_eq!(fill.price, 100.0);
        assert_eq!(fill.quantity, 10.0);
        assert_eq!(broker.open_positions().await.unwrap(), vec!["AAA".to_string()]);

        let close = broker.close_position(1, 104.0).await.unwrap();
        assert_eq!(close.exit_price, 104.0);
        assert!(broker.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_then_recovery() {
        let broker = PaperBroker::new();
        broker.fail_next(1);
        assert!(matches!(
            broker.open_position(&order(1)).await,
            Err(SigtraderError::BrokerUnavailable { .. })
        ));
        assert!(broker.open_position(&order(1)).await.is_ok());
        assert_eq!(broker.open_calls(), 2);
    }

    #[tokio::test]
    async fn rejects_unknown_close_and_when_told() {
        let broker = PaperBroker::new();
        assert!(matches!(
            broker.close_position(9, 1.0).await,
            Err(SigtraderError::BrokerRejected { .. })
        ));
        broker.set_reject(true);
        assert!(matches!(
            broker.open_position(&order(1)).await,
            Err(SigtraderError::BrokerRejected { .. })
        ));
    }

    #[tokio::test]
    async fn late_acknowledged_fill_can_be_found() {
        let broker = PaperBroker::new();
        broker.set_fill_delay(Some(Duration::from_millis(50)));
        let sent = tokio::time::timeout(Duration::from_millis(5), broker.open_position(&order(3))).await;
        assert!(sent.is_err());

        let fill = broker.find_fill(3).await.unwrap().unwrap();
        assert_eq!(fill.price, 100.0);
        assert_eq!(broker.find_fill(4).await.unwrap(), None);
        assert!(matches!(
            broker.open_position(&order(3)).await,
            Err(SigtraderError::BrokerRejected { .. })
        ));
    }

    #[tokio::test]
    async fn adopted_trade_is_held() {
        use crate::domain::trade::fixtures::new_trade;

        let broker = PaperBroker::new();
        let trade = Trade::open(12, new_trade("BBB", Side::Long, 50.0, 49.0, 53.0, 4.0)).unwrap();
        broker.adopt(&trade);
        assert_eq!(broker.open_positions().await.unwrap(), vec!["BBB".to_string()]);
        let fill = broker.find_fill(12).await.unwrap().unwrap();
        assert_eq!((fill.price, fill.quantity), (50.0, 4.0));
        assert!(broker.close_position(12, 51.0).await.is_ok());
    }
}
