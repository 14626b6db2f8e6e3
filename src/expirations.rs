//! Expiration selector: one bulk expiration query, then bounded per-date chain validation.
//!
//! Every date returned carries the chain it was validated against, so planning never needs to
//! invent a strike.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::StrategyParams;
use crate::error::{Result, StrategyError};
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{ExpirationCandidate, OptionQuote};

/// Search parameters for one discovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationWindow {
    pub min_days: i64,
    pub max_days: i64,
    pub target_count: usize,
    pub lookahead: usize,
    pub concurrency: usize,
    pub require_quotes: bool,
}

impl ExpirationWindow {
    pub fn for_tiers(p: &StrategyParams) -> Self {
        Self {
            min_days: p.min_days_to_expiration,
            max_days: p.max_days_to_expiration,
            target_count: p.target_expirations,
            lookahead: p.expiration_lookahead,
            concurrency: p.chain_concurrency,
            require_quotes: p.require_quotes,
        }
    }

    /// Next tradable expiration strictly after today, within the roll horizon.
    pub fn for_roll(p: &StrategyParams) -> Self {
        Self {
            min_days: 1,
            max_days: p.max_roll_days_out,
            target_count: 1,
            ..Self::for_tiers(p)
        }
    }
}

/// A validated expiration together with the call contracts found on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpirationChain {
    pub date: NaiveDate,
    /// Tradable call contracts, ascending by strike.
    pub calls: Vec<OptionQuote>,
}

pub struct ExpirationSelector {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
}

impl ExpirationSelector {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self { broker, retry }
    }

    /// Chronological dates (at most `target_count`) with at least one tradable call.
    pub async fn find_valid_expirations(
        &self,
        symbol: &str,
        today: NaiveDate,
        window: ExpirationWindow,
    ) -> Result<Vec<NaiveDate>> {
        Ok(self
            .discover(symbol, today, window)
            .await?
            .into_iter()
            .map(|c| c.date)
            .collect())
    }

    /// The full listed chain for one expiration, unfiltered.
    pub async fn fetch_chain(&self, symbol: &str, date: NaiveDate) -> Result<Vec<OptionQuote>> {
        with_retry(&self.retry, "get_option_chain", || {
            self.broker.get_option_chain(symbol, date)
        })
        .await
    }

    pub async fn discover(
        &self,
        symbol: &str,
        today: NaiveDate,
        window: ExpirationWindow,
    ) -> Result<Vec<ExpirationChain>> {
        let from = today + Duration::days(window.min_days);
        let to = today + Duration::days(window.max_days);

        let mut published = with_retry(&self.retry, "list_expirations", || {
            self.broker.list_expirations(symbol)
        })
        .await?;
        if published.is_empty() {
            return Err(StrategyError::NoExpirationsAvailable {
                symbol: symbol.to_string(),
            });
        }
        published.sort();
        published.dedup();

        let in_range: Vec<NaiveDate> = published
            .iter()
            .copied()
            .filter(|d| *d >= from && *d <= to)
            .collect();
        info!(
            "{}: {} expirations published, {} within {}..={}",
            symbol,
            published.len(),
            in_range.len(),
            from,
            to
        );
        if in_range.is_empty() {
            return Err(StrategyError::NoExpirationsInRange {
                symbol: symbol.to_string(),
                published: published.len(),
                from,
                to,
            });
        }

        let probe: Vec<NaiveDate> = in_range.into_iter().take(window.lookahead.max(1)).collect();
        let checked = probe.len();

        // Chains are fetched with bounded parallelism but consumed in date order; dropping the
        // stream once enough dates validate stops further fetches.
        let mut fetches = stream::iter(probe)
            .map(|date| async move {
                let chain = with_retry(&self.retry, "get_option_chain", || {
                    self.broker.get_option_chain(symbol, date)
                })
                .await;
                (date, chain)
            })
            .buffered(window.concurrency.max(1));

        let mut valid = Vec::new();
        while let Some((date, chain)) = fetches.next().await {
            let chain = match chain {
                Ok(c) => c,
                Err(e) => {
                    warn!("{}: could not validate expiration {}: {}", symbol, date, e);
                    continue;
                }
            };
            let (candidate, calls) = tradable_calls(date, chain, window.require_quotes);
            if !candidate.has_tradable_calls {
                warn!("{}: expiration {} excluded, no tradable call contracts", symbol, date);
                continue;
            }
            info!("{}: expiration {} has {} tradable calls", symbol, date, candidate.call_count);
            valid.push(ExpirationChain { date, calls });
            if valid.len() >= window.target_count {
                break;
            }
        }

        if valid.is_empty() {
            return Err(StrategyError::NoLiquidExpirations {
                symbol: symbol.to_string(),
                checked,
            });
        }
        if valid.len() < window.target_count {
            warn!(
                "{}: found {} valid expirations, wanted {}",
                symbol,
                valid.len(),
                window.target_count
            );
        }
        Ok(valid)
    }
}

/// Keep the call contracts that count as tradable, sorted by strike.
pub fn tradable_calls(
    date: NaiveDate,
    chain: Vec<OptionQuote>,
    require_quotes: bool,
) -> (ExpirationCandidate, Vec<OptionQuote>) {
    let mut calls: Vec<OptionQuote> = chain
        .into_iter()
        .filter(|q| q.is_call() && q.strike.is_finite() && q.strike > 0.0)
        .filter(|q| !require_quotes || q.has_numeric_quotes())
        .collect();
    calls.sort_by(|a, b| a.strike.total_cmp(&b.strike));
    let candidate = ExpirationCandidate {
        date,
        has_tradable_calls: !calls.is_empty(),
        call_count: calls.len(),
    };
    (candidate, calls)
}
