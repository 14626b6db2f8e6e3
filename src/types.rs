//! Core domain types for holdings, option chains, tier plans, rolls, orders and cost basis.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const SHARES_PER_CONTRACT: u32 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Accepts "C", "CALL", "P", "PUT" in any case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C" | "CALL" => Some(Self::Call),
            "P" | "PUT" => Some(Self::Put),
            _ => None,
        }
    }
}

/// One contract of an option chain as quoted by the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionQuote {
    pub strike: f64,
    pub option_type: OptionType,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

impl OptionQuote {
    pub fn call(strike: f64, bid: Option<f64>, ask: Option<f64>) -> Self {
        Self {
            strike,
            option_type: OptionType::Call,
            bid,
            ask,
        }
    }

    pub fn is_call(&self) -> bool {
        self.option_type == OptionType::Call
    }

    /// Both sides quoted with finite, positive numbers. A 0/0 quote has no market.
    pub fn has_numeric_quotes(&self) -> bool {
        self.mid().is_some()
    }

    /// Midpoint when both sides are positive.
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) if b > 0.0 && a > 0.0 && b.is_finite() && a.is_finite() => {
                Some((b + a) / 2.0)
            }
            _ => None,
        }
    }

    pub fn numeric_bid(&self) -> Option<f64> {
        self.bid.filter(|b| b.is_finite() && *b > 0.0)
    }

    pub fn numeric_ask(&self) -> Option<f64> {
        self.ask.filter(|a| a.is_finite() && *a > 0.0)
    }
}

/// An open short call written against the underlying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShortCall {
    pub symbol: String,
    pub strike: f64,
    pub expiration: NaiveDate,
    /// Contracts, always positive.
    pub quantity: u32,
    /// Premium received per share when opened, if known.
    pub avg_price: Option<f64>,
}

impl ShortCall {
    pub fn shares_covered(&self) -> u32 {
        self.quantity * SHARES_PER_CONTRACT
    }

    pub fn is_itm(&self, reference_price: f64) -> bool {
        self.strike < reference_price
    }
}

/// A long option held on the underlying (reported, never traded by this core).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LongOption {
    pub symbol: String,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub option_type: OptionType,
    pub quantity: u32,
    pub avg_cost: Option<f64>,
}

/// Raw holdings for one symbol as reported by the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerPosition {
    pub shares: u32,
    /// Average cost per share.
    pub cost_basis: Option<f64>,
    pub short_calls: Vec<ShortCall>,
    pub long_options: Vec<LongOption>,
}

/// Reconciled view of one symbol's holdings. Built fresh on every read.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PositionSummary {
    pub symbol: String,
    pub total_shares: u32,
    /// `total_shares` minus shares already encumbered by open short calls.
    pub available_shares: u32,
    pub reference_price: f64,
    pub cost_basis_per_share: Option<f64>,
    pub total_cost: Option<f64>,
    pub short_calls: Vec<ShortCall>,
    pub long_options: Vec<LongOption>,
}

/// Transient result of probing one expiration for tradable calls.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ExpirationCandidate {
    pub date: NaiveDate,
    pub has_tradable_calls: bool,
    pub call_count: usize,
}

/// One tier of the strategy: contracts at a single expiration/strike.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierGroup {
    pub expiration: NaiveDate,
    pub strike: f64,
    pub contracts: u32,
    pub shares_used: u32,
    pub estimated_premium_per_contract: f64,
    /// Limit price per share for the opening order. Falls back to the heuristic estimate when the
    /// chain has no bid; opening orders are never sent at market.
    pub limit_price: f64,
    /// The chain had no strike above the previous tier; its highest strike was used.
    pub ceiling_reached: bool,
}

impl TierGroup {
    pub fn estimated_premium(&self) -> f64 {
        self.estimated_premium_per_contract * f64::from(self.contracts)
    }
}

/// Non-fatal conditions noticed while planning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanWarning {
    StrikeCeilingReached {
        expiration: NaiveDate,
        strike: f64,
        wanted_above: f64,
    },
    ContractCapApplied {
        expiration: NaiveDate,
        requested: u32,
        capped: u32,
    },
    FewerExpirations {
        found: usize,
        wanted: usize,
    },
    CostBasisEstimated {
        used_price: f64,
    },
}

/// A validated tiered covered call plan. Consumed once by execution.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyPlan {
    pub symbol: String,
    pub reference_price: f64,
    pub total_shares: u32,
    pub available_shares: u32,
    pub groups: Vec<TierGroup>,
    pub total_contracts: u32,
    pub total_estimated_premium: f64,
    pub original_cost_basis: f64,
    /// Premium already collected before this plan.
    pub cumulative_premium_before: f64,
    pub effective_cost_basis: f64,
    pub cost_basis_reduction_per_share: f64,
    pub cost_basis_reduction_pct: f64,
    pub warnings: Vec<PlanWarning>,
    pub planned_at: DateTime<Utc>,
}

impl StrategyPlan {
    pub fn shares_allocated(&self) -> u32 {
        self.groups.iter().map(|g| g.shares_used).sum()
    }

    /// Structural invariants every executable plan must satisfy.
    ///
    /// Groups flagged `ceiling_reached` are exempt from the ordering checks.
    pub fn invariant_violation(&self) -> Option<String> {
        if self.groups.is_empty() || self.groups.len() > 3 {
            return Some(format!("plan has {} groups", self.groups.len()));
        }
        if self.shares_allocated() > self.available_shares {
            return Some(format!(
                "{} shares allocated but only {} available",
                self.shares_allocated(),
                self.available_shares
            ));
        }
        let mut last_strike: Option<f64> = None;
        let mut last_expiration: Option<NaiveDate> = None;
        for g in &self.groups {
            if g.contracts == 0 || g.contracts != g.shares_used / SHARES_PER_CONTRACT {
                return Some(format!(
                    "{}: {} contracts for {} shares",
                    g.expiration, g.contracts, g.shares_used
                ));
            }
            if let Some(prev) = last_expiration {
                if g.expiration <= prev {
                    return Some(format!("expirations out of order at {}", g.expiration));
                }
            }
            last_expiration = Some(g.expiration);
            if g.ceiling_reached {
                continue;
            }
            if g.strike <= self.reference_price {
                return Some(format!(
                    "strike {} at {} not above reference {}",
                    g.strike, g.expiration, self.reference_price
                ));
            }
            if let Some(prev) = last_strike {
                if g.strike <= prev {
                    return Some(format!(
                        "strike {} at {} not above previous {}",
                        g.strike, g.expiration, prev
                    ));
                }
            }
            last_strike = Some(g.strike);
        }
        if self.total_contracts != self.groups.iter().map(|g| g.contracts).sum::<u32>() {
            return Some("total_contracts does not match groups".to_string());
        }
        None
    }
}

/// One expiring ITM short call together with its chosen replacement.
#[derive(Debug, Clone, Serialize)]
pub struct RollOpportunity {
    pub current: ShortCall,
    pub reference_price: f64,
    pub target_expiration: NaiveDate,
    pub target_strike: f64,
    /// Per-share price expected to buy back the expiring call.
    pub close_price: f64,
    /// Per-share premium expected for the replacement call.
    pub open_price: f64,
    /// `open_price - close_price`, per share.
    pub estimated_net_credit: f64,
}

impl RollOpportunity {
    pub fn symbol(&self) -> &str {
        &self.current.symbol
    }

    /// Estimated credit in dollars across all contracts.
    pub fn estimated_total_credit(&self) -> f64 {
        self.estimated_net_credit * f64::from(self.current.quantity) * f64::from(SHARES_PER_CONTRACT)
    }
}

/// Values needed to open a ledger record for a symbol seen for the first time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BasisSeed {
    pub original_cost_basis: f64,
    pub total_shares: u32,
}

/// Rolls to execute in one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RollPlan {
    pub opportunities: Vec<RollOpportunity>,
    pub total_estimated_credit: f64,
    /// Premium collected to date per symbol, read from the ledger at plan time.
    pub cumulative_premium: BTreeMap<String, f64>,
    /// Ledger seeds per symbol, from the position read at plan time.
    pub basis_seeds: BTreeMap<String, BasisSeed>,
    pub planned_at: DateTime<Utc>,
}

impl RollPlan {
    pub fn is_empty(&self) -> bool {
        self.opportunities.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    BuyToClose,
    SellToOpen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeInForce {
    Day,
    GoodTillCancel,
}

/// A single-leg option order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSpec {
    /// Client-generated id, stable across retries of the same leg.
    pub client_order_id: String,
    pub symbol: String,
    pub expiration: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
    pub side: OrderSide,
    pub quantity: u32,
    /// Per-share limit; `None` submits a market order.
    pub limit_price: Option<f64>,
    pub time_in_force: TimeInForce,
}

impl OrderSpec {
    pub fn call(
        symbol: &str,
        expiration: NaiveDate,
        strike: f64,
        side: OrderSide,
        quantity: u32,
        limit_price: Option<f64>,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            expiration,
            strike,
            option_type: OptionType::Call,
            side,
            quantity,
            limit_price,
            time_in_force,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted and working.
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    /// The broker's answer did not tell us what happened.
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }
}

/// Per-leg broker outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResult {
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    /// Average per-share fill price, if known.
    pub filled_price: Option<f64>,
    pub filled_quantity: u32,
    pub message: Option<String>,
}

impl OrderResult {
    pub fn with_status(status: OrderStatus, broker_order_id: Option<String>) -> Self {
        Self {
            status,
            broker_order_id,
            filled_price: None,
            filled_quantity: 0,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    InitialCoveredCalls,
    Roll,
    /// Compensating entry for premium the engine did not observe itself.
    Correction,
}

/// One append-only ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyImpact {
    pub sequence: u64,
    pub execution_id: String,
    pub kind: ExecutionKind,
    pub premium_collected: f64,
    pub shares_affected: u32,
    pub contracts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Current cost-basis state for one symbol, derived from its entries.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostBasisRecord {
    pub symbol: String,
    pub original_cost_basis: f64,
    pub total_shares: u32,
    pub total_original_cost: f64,
    pub cumulative_premium: f64,
    pub effective_cost_basis: f64,
    pub reduction_per_share: f64,
    pub reduction_pct: f64,
    pub entries: Vec<StrategyImpact>,
}
