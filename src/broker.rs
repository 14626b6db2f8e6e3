//! Broker collaborator interface consumed by the strategy core.
//!
//! Strategy code never branches on broker identity; each service integration implements this trait.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::BrokerError;
use crate::types::{BrokerPosition, OptionQuote, OrderResult, OrderSpec};

/// Call futures are not `Send`: the Webull order builders hold non-`Send` futures across awaits.
/// Drive the engine on a current-thread runtime.
#[async_trait(?Send)]
pub trait Broker: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Shares, cost basis and option holdings for one underlying.
    async fn get_position(&self, symbol: &str) -> Result<BrokerPosition, BrokerError>;

    /// Underlyings that currently carry at least one short call.
    async fn symbols_with_short_calls(&self) -> Result<Vec<String>, BrokerError>;

    async fn get_reference_price(&self, symbol: &str) -> Result<f64, BrokerError>;

    /// All published expirations, in one bulk call.
    async fn list_expirations(&self, symbol: &str) -> Result<Vec<NaiveDate>, BrokerError>;

    async fn get_option_chain(
        &self,
        symbol: &str,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionQuote>, BrokerError>;

    async fn submit_order(&self, order: &OrderSpec) -> Result<OrderResult, BrokerError>;

    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderResult, BrokerError>;

    /// Look up an order by the client id it was submitted with.
    ///
    /// `Ok(None)` means the broker has no such order, so resubmitting cannot duplicate it.
    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderResult>, BrokerError>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;
}
