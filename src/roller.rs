//! Roll engine: find in-the-money short calls expiring today and pair each with a net-credit
//! replacement on the next tradable expiration.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::StrategyParams;
use crate::error::{Result, StrategyError};
use crate::expirations::{ExpirationSelector, ExpirationWindow};
use crate::ledger::CostBasisLedger;
use crate::positions::PositionReader;
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{BasisSeed, OptionQuote, RollOpportunity, RollPlan, ShortCall};
use crate::utils::{same_strike, sanitize_symbol};

/// Added to intrinsic value when the expiring call has no ask to buy it back at.
const BUYBACK_SLIPPAGE: f64 = 0.05;

/// An expiring in-the-money short call, with the position context it was found in.
#[derive(Debug, Clone)]
pub struct RollCandidate {
    pub short_call: ShortCall,
    pub reference_price: f64,
    pub seed: BasisSeed,
}

/// Per-share prices for one close/open pairing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollCredit {
    pub close_price: f64,
    pub open_price: f64,
    pub net_credit: f64,
}

/// Close at the ask (or intrinsic plus slippage), open at the bid.
pub fn estimate_roll_credit(
    current_strike: f64,
    reference_price: f64,
    close_quote: Option<&OptionQuote>,
    open_quote: &OptionQuote,
) -> Option<RollCredit> {
    let open_price = open_quote.numeric_bid()?;
    let close_price = close_quote
        .and_then(OptionQuote::numeric_ask)
        .unwrap_or_else(|| (reference_price - current_strike).max(0.0) + BUYBACK_SLIPPAGE);
    Some(RollCredit {
        close_price,
        open_price,
        net_credit: open_price - close_price,
    })
}

pub struct RollEngine {
    broker: Arc<dyn Broker>,
    positions: Arc<PositionReader>,
    expirations: Arc<ExpirationSelector>,
    ledger: Arc<CostBasisLedger>,
    retry: RetryPolicy,
}

impl RollEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        positions: Arc<PositionReader>,
        expirations: Arc<ExpirationSelector>,
        ledger: Arc<CostBasisLedger>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            positions,
            expirations,
            ledger,
            retry,
        }
    }

    /// Short calls expiring `today` whose strike is below the current reference price.
    ///
    /// With no symbol, every underlying carrying a short call is scanned; symbols whose position
    /// cannot be read are skipped with a warning.
    pub async fn find_roll_candidates(
        &self,
        symbol: Option<&str>,
        today: NaiveDate,
    ) -> Result<Vec<RollCandidate>> {
        let symbols = match symbol {
            Some(s) => vec![sanitize_symbol(s)],
            None => {
                let mut v = with_retry(&self.retry, "symbols_with_short_calls", || {
                    self.broker.symbols_with_short_calls()
                })
                .await?;
                v.sort();
                v.dedup();
                v
            }
        };

        let mut out = Vec::new();
        for sym in &symbols {
            let position = match self.positions.read_position(sym).await {
                Ok(p) => p,
                Err(e) if symbol.is_none() && !e.is_invariant_violation() => {
                    warn!("{}: skipped in roll scan: {}", sym, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let seed = BasisSeed {
                original_cost_basis: position
                    .cost_basis_per_share
                    .filter(|c| c.is_finite() && *c > 0.0)
                    .unwrap_or(position.reference_price),
                total_shares: position.total_shares,
            };
            for call in &position.short_calls {
                if call.expiration != today || !call.is_itm(position.reference_price) {
                    continue;
                }
                info!(
                    "{}: roll candidate {} x{} strike {:.2} (price {:.2})",
                    sym, call.expiration, call.quantity, call.strike, position.reference_price
                );
                out.push(RollCandidate {
                    short_call: call.clone(),
                    reference_price: position.reference_price,
                    seed,
                });
            }
        }
        info!("Roll scan: {} symbols, {} candidates", symbols.len(), out.len());
        Ok(out)
    }

    /// Pair each candidate with the replacement strike nearest its current strike that clears
    /// the credit floor. Candidates with no such strike are left out.
    pub async fn build_roll_plan(
        &self,
        candidates: Vec<RollCandidate>,
        params: &StrategyParams,
        today: NaiveDate,
    ) -> Result<RollPlan> {
        let floor = params.min_roll_credit.max(0.0);
        let window = ExpirationWindow::for_roll(params);
        let mut opportunities = Vec::new();
        let mut cumulative_premium = BTreeMap::new();
        let mut basis_seeds = BTreeMap::new();

        for c in candidates {
            let symbol = c.short_call.symbol.clone();
            let target = match self.expirations.discover(&symbol, today, window).await {
                Ok(mut found) if !found.is_empty() => found.remove(0),
                Ok(_) => continue,
                Err(e) => {
                    warn!("{}: no roll target expiration: {}", symbol, e);
                    continue;
                }
            };

            let expiring = match with_retry(&self.retry, "get_option_chain", || {
                self.broker.get_option_chain(&symbol, c.short_call.expiration)
            })
            .await
            {
                Ok(chain) => chain,
                Err(e) => {
                    warn!("{}: expiring chain unavailable, estimating buyback: {}", symbol, e);
                    Vec::new()
                }
            };
            let close_quote = expiring
                .iter()
                .find(|q| q.is_call() && same_strike(q.strike, c.short_call.strike));

            let Some((quote, credit)) = choose_replacement(&c, close_quote, &target.calls, floor)
            else {
                warn!(
                    "{}: no strike on {} clears the {:.2} credit floor for the {:.2} call",
                    symbol, target.date, floor, c.short_call.strike
                );
                continue;
            };

            info!(
                "{}: roll {:.2} {} -> {:.2} {} net {:.2}/share",
                symbol,
                c.short_call.strike,
                c.short_call.expiration,
                quote.strike,
                target.date,
                credit.net_credit
            );
            if !cumulative_premium.contains_key(&symbol) {
                let before = self
                    .ledger
                    .lookup(&symbol)
                    .await
                    .map_or(0.0, |r| r.cumulative_premium);
                cumulative_premium.insert(symbol.clone(), before);
            }
            basis_seeds.entry(symbol).or_insert(c.seed);
            opportunities.push(RollOpportunity {
                target_expiration: target.date,
                target_strike: quote.strike,
                close_price: credit.close_price,
                open_price: credit.open_price,
                estimated_net_credit: credit.net_credit,
                reference_price: c.reference_price,
                current: c.short_call,
            });
        }

        let total_estimated_credit = opportunities
            .iter()
            .map(RollOpportunity::estimated_total_credit)
            .sum();
        Ok(RollPlan {
            opportunities,
            total_estimated_credit,
            cumulative_premium,
            basis_seeds,
            planned_at: Utc::now(),
        })
    }

    pub async fn find_and_plan(
        &self,
        symbol: Option<&str>,
        params: &StrategyParams,
        today: NaiveDate,
    ) -> Result<RollPlan> {
        if params.min_roll_credit < 0.0 {
            return Err(StrategyError::Config("min_roll_credit must be >= 0".into()));
        }
        let candidates = self.find_roll_candidates(symbol, today).await?;
        self.build_roll_plan(candidates, params, today).await
    }
}

/// Nearest strike to the current one among those meeting `floor`; ties go to the higher strike.
fn choose_replacement<'a>(
    c: &RollCandidate,
    close_quote: Option<&OptionQuote>,
    chain: &'a [OptionQuote],
    floor: f64,
) -> Option<(&'a OptionQuote, RollCredit)> {
    chain
        .iter()
        .filter(|q| q.is_call())
        .filter_map(|q| {
            estimate_roll_credit(c.short_call.strike, c.reference_price, close_quote, q)
                .filter(|cr| cr.net_credit >= floor)
                .map(|cr| (q, cr))
        })
        .min_by(|(a, _), (b, _)| {
            let da = (a.strike - c.short_call.strike).abs();
            let db = (b.strike - c.short_call.strike).abs();
            da.total_cmp(&db).then(b.strike.total_cmp(&a.strike))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_broker::MemoryBroker;
    use crate::types::BrokerPosition;
    use chrono::Duration;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 17).unwrap()
    }

    fn short(strike: f64, expiration: NaiveDate) -> ShortCall {
        ShortCall {
            symbol: "AAPL".into(),
            strike,
            expiration,
            quantity: 2,
            avg_price: Some(1.0),
        }
    }

    fn engine(b: Arc<MemoryBroker>) -> RollEngine {
        let retry = RetryPolicy::default();
        RollEngine::new(
            b.clone(),
            Arc::new(PositionReader::new(b.clone(), retry.clone())),
            Arc::new(ExpirationSelector::new(b, retry.clone())),
            Arc::new(CostBasisLedger::in_memory()),
            retry,
        )
    }

    fn seeded() -> Arc<MemoryBroker> {
        let b = Arc::new(MemoryBroker::new());
        b.set_price("AAPL", 100.0);
        b.set_position(
            "AAPL",
            BrokerPosition {
                shares: 600,
                cost_basis: Some(90.0),
                short_calls: vec![
                    short(95.0, today()),
                    short(105.0, today()),
                    short(90.0, today() + Duration::days(7)),
                ],
                long_options: vec![],
            },
        );
        // expiring 95 call: ask 5.20
        b.set_chain("AAPL", today(), vec![OptionQuote::call(95.0, Some(5.0), Some(5.2))]);
        let next = today() + Duration::days(7);
        b.set_expirations("AAPL", vec![today(), next]);
        b.set_chain(
            "AAPL",
            next,
            vec![
                OptionQuote::call(90.0, Some(10.6), Some(10.9)),
                OptionQuote::call(95.0, Some(5.25), Some(5.5)),
                OptionQuote::call(100.0, Some(5.40), Some(5.6)),
                OptionQuote::call(97.5, Some(5.35), Some(5.6)),
            ],
        );
        b
    }

    #[test]
    fn credit_falls_back_to_intrinsic_plus_slippage() {
        let open = OptionQuote::call(100.0, Some(6.0), Some(6.3));
        let cr = estimate_roll_credit(95.0, 100.0, None, &open).unwrap();
        assert!((cr.close_price - 5.05).abs() < 1e-9);
        assert!((cr.net_credit - 0.95).abs() < 1e-9);
        assert!(estimate_roll_credit(95.0, 100.0, None, &OptionQuote::call(100.0, None, Some(1.0))).is_none());
    }

    #[tokio::test]
    async fn only_itm_calls_expiring_today() {
        let c = engine(seeded())
            .find_roll_candidates(Some("AAPL"), today())
            .await
            .unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].short_call.strike, 95.0);
        assert_eq!(c[0].seed.original_cost_basis, 90.0);
    }

    #[tokio::test]
    async fn picks_nearest_strike_clearing_floor() {
        let e = engine(seeded());
        let params = StrategyParams::default();
        let c = e.find_roll_candidates(None, today()).await.unwrap();
        let plan = e.build_roll_plan(c, &params, today()).await.unwrap();
        assert_eq!(plan.opportunities.len(), 1);
        let o = &plan.opportunities[0];
        // 95 gives 0.05 (below the 0.10 floor); 97.5 gives 0.15 and is nearer than 100 or 90
        assert_eq!(o.target_strike, 97.5);
        assert_eq!(o.target_expiration, today() + Duration::days(7));
        assert!(o.estimated_net_credit >= params.min_roll_credit);
        assert!((plan.total_estimated_credit - 0.15 * 200.0).abs() < 1e-6);
        assert_eq!(plan.cumulative_premium.get("AAPL"), Some(&0.0));
        assert_eq!(plan.basis_seeds["AAPL"].total_shares, 600);
    }

    #[tokio::test]
    async fn no_strike_meeting_floor_excludes_candidate() {
        let e = engine(seeded());
        let params = StrategyParams {
            min_roll_credit: 10.0,
            ..StrategyParams::default()
        };
        let c = e.find_roll_candidates(Some("AAPL"), today()).await.unwrap();
        let plan = e.build_roll_plan(c, &params, today()).await.unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.total_estimated_credit, 0.0);
    }

    #[tokio::test]
    async fn roll_target_respects_horizon() {
        let b = seeded();
        b.set_expirations("AAPL", vec![today(), today() + Duration::days(60)]);
        let e = engine(b);
        let c = e.find_roll_candidates(Some("AAPL"), today()).await.unwrap();
        let plan = e.build_roll_plan(c, &StrategyParams::default(), today()).await.unwrap();
        assert!(plan.is_empty());
    }
}
