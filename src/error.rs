//! Error taxonomy: input/data errors, transient broker errors, invariant violations.
//!
//! Partial roll failures are not errors; they are outcome states on `RollTransaction`.

use chrono::NaiveDate;
use thiserror::Error;

/// Errors surfaced by a broker collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// Network-level or 5xx failure; the request may or may not have reached the broker.
    #[error("transient broker error: {0}")]
    Transient(String),
    /// The call did not answer within the configured timeout. Outcome is ambiguous.
    #[error("broker call timed out after {0}s")]
    Timeout(u64),
    /// Order explicitly refused by the broker.
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("broker error: {0}")]
    Other(String),
}

/// Message fragments that mark an adapter error as permanent.
const NON_RETRYABLE_KEYWORDS: &[&str] = &[
    "insufficient",
    "invalid strike",
    "invalid symbol",
    "not found",
    "unauthorized",
    "forbidden",
    "rejected",
];

impl BrokerError {
    /// Whether a retry (after re-querying order state) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Whether the broker may have acted on the request even though we saw a failure.
    pub fn is_ambiguous(&self) -> bool {
        self.is_retryable()
    }

    /// Classify a free-form adapter error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("rejected") {
            return Self::Rejected(message);
        }
        if lower.contains("not found") {
            return Self::NotFound(message);
        }
        if NON_RETRYABLE_KEYWORDS.iter().any(|k| lower.contains(k)) {
            return Self::Other(message);
        }
        Self::Transient(message)
    }
}

/// Errors surfaced by the strategy and execution core.
#[derive(Debug, Error)]
pub enum StrategyError {
    // ---------- input / data ----------
    #[error("no shares of {symbol} held")]
    NoPositionFound { symbol: String },

    #[error("{symbol}: {shares} shares held but open short calls cover {covered}")]
    PositionInconsistent {
        symbol: String,
        shares: u32,
        covered: u32,
    },

    #[error("{symbol}: {available} shares available, need at least 100")]
    InsufficientShares { symbol: String, available: u32 },

    #[error("{symbol}: {total} shares held, strategy requires at least {required}")]
    BelowMinimumShares {
        symbol: String,
        total: u32,
        required: u32,
    },

    #[error("no option expirations published for {symbol}")]
    NoExpirationsAvailable { symbol: String },

    #[error("{symbol}: {published} expirations published, none between {from} and {to}")]
    NoExpirationsInRange {
        symbol: String,
        published: usize,
        from: NaiveDate,
        to: NaiveDate,
    },

    #[error("{symbol}: checked {checked} expirations, none has a tradable call contract")]
    NoLiquidExpirations { symbol: String, checked: usize },

    #[error("{symbol}: invalid market data: {detail}")]
    InvalidMarketData { symbol: String, detail: String },

    #[error("no cost basis record for {symbol}")]
    NoCostBasisRecord { symbol: String },

    #[error("invalid strategy impact for {symbol}: {detail}")]
    InvalidImpact { symbol: String, detail: String },

    // ---------- broker ----------
    #[error("{op} failed: {source}")]
    Broker {
        op: String,
        #[source]
        source: BrokerError,
    },

    #[error("{op} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last_error: String,
    },

    #[error("order {client_order_id} rejected: {reason}")]
    OrderRejected {
        client_order_id: String,
        reason: String,
    },

    #[error("execution halted before submission")]
    Halted,

    // ---------- invariants ----------
    #[error("{symbol}: strike {strike} for {expiration} is not in the queried option chain")]
    SyntheticStrikeDetected {
        symbol: String,
        expiration: NaiveDate,
        strike: f64,
    },

    #[error("{symbol}: plan invariant violated: {detail}")]
    PlanInvariantViolated { symbol: String, detail: String },

    #[error("invalid roll transition {from} -> {to}")]
    InvalidRollTransition { from: String, to: String },

    // ---------- ledger / config ----------
    #[error("ledger io error at {path}: {source}")]
    LedgerIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger line {line} is corrupt: {detail}")]
    LedgerCorrupt { line: usize, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StrategyError {
    pub fn broker(op: impl Into<String>, source: BrokerError) -> Self {
        Self::Broker {
            op: op.into(),
            source,
        }
    }

    /// Invariant violations indicate a defect, never a market condition.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::SyntheticStrikeDetected { .. }
                | Self::PlanInvariantViolated { .. }
                | Self::PositionInconsistent { .. }
                | Self::InvalidRollTransition { .. }
        )
    }
}

pub type Result<T, E = StrategyError> = std::result::Result<T, E>;
