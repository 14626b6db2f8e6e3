//! Strategy planner: position + expirations + allocation, validated into an immutable plan.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures::future::try_join_all;
use tracing::{error, info, warn};

use crate::allocator::allocate;
use crate::config::StrategyParams;
use crate::error::{Result, StrategyError};
use crate::expirations::{ExpirationSelector, ExpirationWindow};
use crate::ledger::{effective_cost_basis, reduction_pct, CostBasisLedger};
use crate::positions::PositionReader;
use crate::types::{
    OptionQuote, PlanWarning, PositionSummary, StrategyPlan, TierGroup, SHARES_PER_CONTRACT,
};
use crate::utils::same_strike;

pub struct StrategyPlanner {
    positions: Arc<PositionReader>,
    expirations: Arc<ExpirationSelector>,
    ledger: Arc<CostBasisLedger>,
}

impl StrategyPlanner {
    pub fn new(
        positions: Arc<PositionReader>,
        expirations: Arc<ExpirationSelector>,
        ledger: Arc<CostBasisLedger>,
    ) -> Self {
        Self {
            positions,
            expirations,
            ledger,
        }
    }

    /// Build a tiered plan for `symbol`. Nothing is submitted.
    pub async fn plan(
        &self,
        symbol: &str,
        params: &StrategyParams,
        today: NaiveDate,
    ) -> Result<StrategyPlan> {
        let position = self.positions.read_position(symbol).await?;
        let symbol = position.symbol.clone();

        if position.total_shares < params.min_shares_required {
            warn!(
                "{}: {} shares below the {} share minimum",
                symbol, position.total_shares, params.min_shares_required
            );
            return Err(StrategyError::BelowMinimumShares {
                symbol,
                total: position.total_shares,
                required: params.min_shares_required,
            });
        }
        if position.available_shares < SHARES_PER_CONTRACT {
            return Err(StrategyError::InsufficientShares {
                symbol,
                available: position.available_shares,
            });
        }

        let window = ExpirationWindow::for_tiers(params);
        let found = self.expirations.discover(&symbol, today, window).await?;
        let dates: Vec<NaiveDate> = found.iter().map(|c| c.date).collect();
        let chains: BTreeMap<NaiveDate, Vec<OptionQuote>> =
            found.into_iter().map(|c| (c.date, c.calls)).collect();

        let mut allocation = allocate(
            &symbol,
            position.available_shares,
            &dates,
            position.reference_price,
            &chains,
            params,
            today,
        )?;
        let listed = self.listed_chains(&symbol, &allocation.groups).await?;
        verify_no_synthetic_strikes(&symbol, &allocation.groups, &listed)?;

        let mut warnings = Vec::new();
        if dates.len() < window.target_count {
            warnings.push(PlanWarning::FewerExpirations {
                found: dates.len(),
                wanted: window.target_count,
            });
        }
        warnings.append(&mut allocation.warnings);

        let plan = self
            .assemble(position, allocation.groups, warnings)
            .await;
        if let Some(detail) = plan.invariant_violation() {
            error!("{}: plan invariant violated: {} ({:?})", plan.symbol, detail, plan);
            return Err(StrategyError::PlanInvariantViolated {
                symbol: plan.symbol,
                detail,
            });
        }

        info!(
            "{}: plan ready, {} groups, {} contracts, est. premium {:.2}, effective basis {:.2} -> {:.2}",
            plan.symbol,
            plan.groups.len(),
            plan.total_contracts,
            plan.total_estimated_premium,
            plan.original_cost_basis,
            plan.effective_cost_basis
        );
        Ok(plan)
    }

    /// Re-query each chosen expiration's chain as the broker lists it.
    async fn listed_chains(
        &self,
        symbol: &str,
        groups: &[TierGroup],
    ) -> Result<BTreeMap<NaiveDate, Vec<OptionQuote>>> {
        let dates: BTreeSet<NaiveDate> = groups.iter().map(|g| g.expiration).collect();
        let chains = try_join_all(dates.iter().map(|d| self.expirations.fetch_chain(symbol, *d))).await?;
        Ok(dates.into_iter().zip(chains).collect())
    }

    async fn assemble(
        &self,
        position: PositionSummary,
        groups: Vec<TierGroup>,
        mut warnings: Vec<PlanWarning>,
    ) -> StrategyPlan {
        let (original, cumulative) = match self.ledger.lookup(&position.symbol).await {
            Some(rec) => (rec.original_cost_basis, rec.cumulative_premium),
            None => match position.cost_basis_per_share {
                Some(c) if c.is_finite() && c > 0.0 => (c, 0.0),
                _ => {
                    warn!(
                        "{}: no cost basis known, using reference price {:.2}",
                        position.symbol, position.reference_price
                    );
                    warnings.push(PlanWarning::CostBasisEstimated {
                        used_price: position.reference_price,
                    });
                    (position.reference_price, 0.0)
                }
            },
        };

        let total_contracts = groups.iter().map(|g| g.contracts).sum();
        let total_estimated_premium: f64 = groups.iter().map(TierGroup::estimated_premium).sum();
        let effective = effective_cost_basis(
            original,
            cumulative + total_estimated_premium,
            position.total_shares,
        );
        let reduction = original - effective;

        StrategyPlan {
            symbol: position.symbol,
            reference_price: position.reference_price,
            total_shares: position.total_shares,
            available_shares: position.available_shares,
            groups,
            total_contracts,
            total_estimated_premium,
            original_cost_basis: original,
            cumulative_premium_before: cumulative,
            effective_cost_basis: effective,
            cost_basis_reduction_per_share: reduction,
            cost_basis_reduction_pct: reduction_pct(reduction, original),
            warnings,
            planned_at: Utc::now(),
        }
    }
}

/// Every group's strike must be present in the chain queried for its expiration.
pub fn verify_no_synthetic_strikes(
    symbol: &str,
    groups: &[TierGroup],
    chains: &BTreeMap<NaiveDate, Vec<OptionQuote>>,
) -> Result<()> {
    for g in groups {
        let present = chains
            .get(&g.expiration)
            .is_some_and(|c| c.iter().any(|q| q.is_call() && same_strike(q.strike, g.strike)));
        if !present {
            error!(
                "{}: strike {} for {} not found in the queried chain ({} chains held)",
                symbol,
                g.strike,
                g.expiration,
                chains.len()
            );
            return Err(StrategyError::SyntheticStrikeDetected {
                symbol: symbol.to_string(),
                expiration: g.expiration,
                strike: g.strike,
            });
        }
    }
    Ok(())
}
