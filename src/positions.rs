//! Position reader: current holdings for one symbol, reconciled against open short calls.

use std::sync::Arc;

use tracing::{error, info};

use crate::broker::Broker;
use crate::error::{Result, StrategyError};
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{PositionSummary, SHARES_PER_CONTRACT};
use crate::utils::sanitize_symbol;

pub struct PositionReader {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
}

impl PositionReader {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self { broker, retry }
    }

    /// Query holdings and price fresh from the broker. Nothing is cached between calls.
    pub async fn read_position(&self, symbol: &str) -> Result<PositionSummary> {
        let symbol = sanitize_symbol(symbol);
        let (raw, price) = tokio::try_join!(
            with_retry(&self.retry, "get_position", || self.broker.get_position(&symbol)),
            with_retry(&self.retry, "get_reference_price", || {
                self.broker.get_reference_price(&symbol)
            }),
        )?;

        if raw.shares == 0 {
            return Err(StrategyError::NoPositionFound { symbol });
        }
        if !(price.is_finite() && price > 0.0) {
            return Err(StrategyError::InvalidMarketData {
                symbol,
                detail: format!("reference price {price}"),
            });
        }

        let contracts: u32 = raw
            .short_calls
            .iter()
            .filter(|c| c.symbol.eq_ignore_ascii_case(&symbol))
            .map(|c| c.quantity)
            .sum();
        let covered = contracts * SHARES_PER_CONTRACT;
        let Some(available) = raw.shares.checked_sub(covered) else {
            error!(
                "Position inconsistent for {}: {} shares, {} short call contracts ({} shares)",
                symbol, raw.shares, contracts, covered
            );
            return Err(StrategyError::PositionInconsistent {
                symbol,
                shares: raw.shares,
                covered,
            });
        };

        info!(
            "Position {}: shares={}, covered={}, available={}, price={:.2}",
            symbol, raw.shares, covered, available, price
        );

        Ok(PositionSummary {
            total_cost: raw.cost_basis.map(|c| c * f64::from(raw.shares)),
            symbol,
            total_shares: raw.shares,
            available_shares: available,
            reference_price: price,
            cost_basis_per_share: raw.cost_basis,
            short_calls: raw.short_calls,
            long_options: raw.long_options,
        })
    }
}
