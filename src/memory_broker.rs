//! In-memory broker: seeded positions, quotes and chains, with scriptable order outcomes.
//!
//! Used for paper simulation and as the collaborator in tests. Fills happen at the order's limit
//! price, or at the chain mid for market orders.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::types::{BrokerPosition, OptionQuote, OrderResult, OrderSide, OrderSpec, OrderStatus};

/// Scripted behaviour for the next submission on one order side.
#[derive(Debug, Clone)]
pub enum SubmitScript {
    /// Accepted and filled immediately.
    Fill,
    /// Accepted, stays working; `fills_after` status queries later it fills.
    Work { fills_after: Option<u32> },
    Reject(String),
    /// Fails before reaching the broker.
    Transient(String),
    /// The call times out; if `lands`, the order was placed and fills.
    Ambiguous { lands: bool },
    /// Sleeps past any sensible call timeout before answering `Fill`.
    Hang(Duration),
}

#[derive(Debug, Clone)]
struct StoredOrder {
    spec: OrderSpec,
    result: OrderResult,
    polls_until_fill: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    positions: HashMap<String, BrokerPosition>,
    prices: HashMap<String, f64>,
    expirations: HashMap<String, Vec<NaiveDate>>,
    chains: HashMap<(String, NaiveDate), Vec<OptionQuote>>,
    chain_errors: HashMap<(String, NaiveDate), BrokerError>,
    queued_chains: HashMap<(String, NaiveDate), VecDeque<Vec<OptionQuote>>>,
    cancel_error: Option<BrokerError>,
    scripts: HashMap<OrderSide, VecDeque<SubmitScript>>,
    orders: BTreeMap<String, StoredOrder>,
    by_client_id: HashMap<String, String>,
    submit_calls: u32,
    chain_calls: u32,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut st)
    }

    // ---------- Seeding ----------

    pub fn set_position(&self, symbol: &str, position: BrokerPosition) {
        self.with_state(|s| s.positions.insert(symbol.to_string(), position));
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.with_state(|s| s.prices.insert(symbol.to_string(), price));
    }

    pub fn set_expirations(&self, symbol: &str, dates: Vec<NaiveDate>) {
        self.with_state(|s| s.expirations.insert(symbol.to_string(), dates));
    }

    pub fn set_chain(&self, symbol: &str, expiration: NaiveDate, chain: Vec<OptionQuote>) {
        self.with_state(|s| s.chains.insert((symbol.to_string(), expiration), chain));
    }

    /// Served once, ahead of the chain set with `set_chain`.
    pub fn queue_chain(&self, symbol: &str, expiration: NaiveDate, chain: Vec<OptionQuote>) {
        self.with_state(|s| {
            s.queued_chains
                .entry((symbol.to_string(), expiration))
                .or_default()
                .push_back(chain)
        });
    }

    pub fn fail_chain(&self, symbol: &str, expiration: NaiveDate, err: BrokerError) {
        self.with_state(|s| s.chain_errors.insert((symbol.to_string(), expiration), err));
    }

    /// Every later cancel fails with `err` and leaves the order as it was.
    pub fn fail_cancels(&self, err: BrokerError) {
        self.with_state(|s| s.cancel_error = Some(err));
    }

    pub fn script(&self, side: OrderSide, steps: impl IntoIterator<Item = SubmitScript>) {
        self.with_state(|s| s.scripts.entry(side).or_default().extend(steps));
    }

    // ---------- Inspection ----------

    /// Orders that actually reached the book, in submission order.
    pub fn placed_orders(&self) -> Vec<OrderSpec> {
        self.with_state(|s| {
            let mut v: Vec<_> = s.orders.values().cloned().collect();
            v.sort_by_key(|o| o.result.broker_order_id.clone());
            v.into_iter().map(|o| o.spec).collect()
        })
    }

    pub fn placed_on(&self, side: OrderSide) -> Vec<OrderSpec> {
        self.placed_orders()
            .into_iter()
            .filter(|o| o.side == side)
            .collect()
    }

    pub fn submit_calls(&self) -> u32 {
        self.with_state(|s| s.submit_calls)
    }

    pub fn chain_calls(&self) -> u32 {
        self.with_state(|s| s.chain_calls)
    }

    fn fill_price(s: &State, order: &OrderSpec) -> Option<f64> {
        order.limit_price.or_else(|| {
            s.chains
                .get(&(order.symbol.clone(), order.expiration))
                .and_then(|c| {
                    c.iter()
                        .find(|q| q.option_type == order.option_type && (q.strike - order.strike).abs() < 1e-6)
                })
                .and_then(|q| q.mid())
        })
    }

    fn place(s: &mut State, order: &OrderSpec, filled: bool, polls_until_fill: Option<u32>) -> OrderResult {
        s.next_id += 1;
        let id = format!("MB-{:06}", s.next_id);
        let mut result = OrderResult::with_status(OrderStatus::Submitted, Some(id.clone()));
        if filled {
            result.status = OrderStatus::Filled;
            result.filled_price = Self::fill_price(s, order);
            result.filled_quantity = order.quantity;
        }
        s.orders.insert(
            id.clone(),
            StoredOrder {
                spec: order.clone(),
                result: result.clone(),
                polls_until_fill,
            },
        );
        s.by_client_id.insert(order.client_order_id.clone(), id);
        result
    }
}

#[async_trait(?Send)]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_position(&self, symbol: &str) -> Result<BrokerPosition, BrokerError> {
        Ok(self.with_state(|s| s.positions.get(symbol).cloned().unwrap_or_default()))
    }

    async fn symbols_with_short_calls(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self.with_state(|s| {
            let mut v: Vec<String> = s
                .positions
                .iter()
                .filter(|(_, p)| !p.short_calls.is_empty())
                .map(|(k, _)| k.clone())
                .collect();
            v.sort();
            v
        }))
    }

    async fn get_reference_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.with_state(|s| s.prices.get(symbol).copied())
            .ok_or_else(|| BrokerError::NotFound(format!("no quote for {symbol}")))
    }

    async fn list_expirations(&self, symbol: &str) -> Result<Vec<NaiveDate>, BrokerError> {
        Ok(self.with_state(|s| s.expirations.get(symbol).cloned().unwrap_or_default()))
    }

    async fn get_option_chain(
        &self,
        symbol: &str,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionQuote>, BrokerError> {
        self.with_state(|s| {
            s.chain_calls += 1;
            let key = (symbol.to_string(), expiration);
            if let Some(e) = s.chain_errors.get(&key) {
                return Err(e.clone());
            }
            if let Some(next) = s.queued_chains.get_mut(&key).and_then(|q| q.pop_front()) {
                return Ok(next);
            }
            Ok(s.chains.get(&key).cloned().unwrap_or_default())
        })
    }

    async fn submit_order(&self, order: &OrderSpec) -> Result<OrderResult, BrokerError> {
        let step = self.with_state(|s| {
            s.submit_calls += 1;
            s.scripts
                .get_mut(&order.side)
                .and_then(|q| q.pop_front())
                .unwrap_or(SubmitScript::Fill)
        });
        match step {
            SubmitScript::Fill => Ok(self.with_state(|s| Self::place(s, order, true, None))),
            SubmitScript::Work { fills_after } => {
                Ok(self.with_state(|s| Self::place(s, order, false, fills_after)))
            }
            SubmitScript::Reject(reason) => {
                let mut r = OrderResult::with_status(OrderStatus::Rejected, None);
                r.message = Some(reason);
                Ok(r)
            }
            SubmitScript::Transient(msg) => Err(BrokerError::Transient(msg)),
            SubmitScript::Ambiguous { lands } => {
                if lands {
                    self.with_state(|s| Self::place(s, order, true, None));
                }
                Err(BrokerError::Timeout(0))
            }
            SubmitScript::Hang(d) => {
                tokio::time::sleep(d).await;
                Ok(self.with_state(|s| Self::place(s, order, true, None)))
            }
        }
    }

    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderResult, BrokerError> {
        self.with_state(|s| {
            let price = s
                .orders
                .get(broker_order_id)
                .and_then(|o| Self::fill_price(s, &o.spec));
            let o = s
                .orders
                .get_mut(broker_order_id)
                .ok_or_else(|| BrokerError::NotFound(broker_order_id.to_string()))?;
            if o.result.status == OrderStatus::Submitted {
                match o.polls_until_fill {
                    Some(0) => {
                        o.result.status = OrderStatus::Filled;
                        o.result.filled_price = price;
                        o.result.filled_quantity = o.spec.quantity;
                    }
                    Some(n) => o.polls_until_fill = Some(n - 1),
                    None => {}
                }
            }
            Ok(o.result.clone())
        })
    }

    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderResult>, BrokerError> {
        Ok(self.with_state(|s| {
            s.by_client_id
                .get(client_order_id)
                .and_then(|id| s.orders.get(id))
                .map(|o| o.result.clone())
        }))
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        self.with_state(|s| {
            if let Some(e) = &s.cancel_error {
                return Err(e.clone());
            }
            let o = s
                .orders
                .get_mut(broker_order_id)
                .ok_or_else(|| BrokerError::NotFound(broker_order_id.to_string()))?;
            if !o.result.status.is_terminal() {
                o.result.status = OrderStatus::Canceled;
            }
            Ok(())
        })
    }
}
