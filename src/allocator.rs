//! Tier allocator: split available shares across expirations and pick strictly increasing strikes.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::config::StrategyParams;
use crate::error::{Result, StrategyError};
use crate::types::{OptionQuote, PlanWarning, TierGroup, SHARES_PER_CONTRACT};

/// Floor of the quote-less premium estimate, per share.
const MIN_ESTIMATED_PREMIUM: f64 = 0.50;

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub groups: Vec<TierGroup>,
    pub warnings: Vec<PlanWarning>,
}

/// Split `contracts` as evenly as possible over at most `buckets` groups, remainder to the front.
///
/// Never returns an empty bucket, so fewer contracts than buckets yields fewer groups.
pub fn split_contracts(contracts: u32, buckets: usize) -> Vec<u32> {
    let n = (buckets as u32).min(contracts);
    if n == 0 {
        return Vec::new();
    }
    let base = contracts / n;
    let remainder = contracts % n;
    (0..n).map(|i| base + u32::from(i < remainder)).collect()
}

/// Build tier groups for `expirations` (chronological), using only strikes present in `chains`.
pub fn allocate(
    symbol: &str,
    available_shares: u32,
    expirations: &[NaiveDate],
    reference_price: f64,
    chains: &BTreeMap<NaiveDate, Vec<OptionQuote>>,
    params: &StrategyParams,
    today: NaiveDate,
) -> Result<Allocation> {
    if available_shares < SHARES_PER_CONTRACT {
        return Err(StrategyError::InsufficientShares {
            symbol: symbol.to_string(),
            available: available_shares,
        });
    }
    if expirations.is_empty() {
        return Err(StrategyError::NoLiquidExpirations {
            symbol: symbol.to_string(),
            checked: 0,
        });
    }

    let contracts = available_shares / SHARES_PER_CONTRACT;
    let split = split_contracts(contracts, expirations.len());
    let mut warnings = Vec::new();
    let mut groups = Vec::with_capacity(split.len());
    let mut floor = reference_price;

    for (&expiration, &wanted) in expirations.iter().zip(split.iter()) {
        let calls: Vec<&OptionQuote> = chains
            .get(&expiration)
            .map(|c| c.iter().filter(|q| q.is_call()).collect())
            .unwrap_or_default();
        if calls.is_empty() {
            return Err(StrategyError::InvalidMarketData {
                symbol: symbol.to_string(),
                detail: format!("no call contracts on the chain for {expiration}"),
            });
        }

        let (quote, ceiling_reached) = match lowest_strike_above(&calls, floor) {
            Some(q) => (q, false),
            None => {
                let top = highest_strike(&calls);
                warn!(
                    "{}: no strike above {:.2} for {}, using highest available {:.2}",
                    symbol, floor, expiration, top.strike
                );
                warnings.push(PlanWarning::StrikeCeilingReached {
                    expiration,
                    strike: top.strike,
                    wanted_above: floor,
                });
                (top, true)
            }
        };

        let capped = wanted.min(params.max_contracts_per_expiration);
        if capped < wanted {
            warn!(
                "{}: {} contracts requested for {}, capped at {}",
                symbol, wanted, expiration, capped
            );
            warnings.push(PlanWarning::ContractCapApplied {
                expiration,
                requested: wanted,
                capped,
            });
        }

        let dte = (expiration - today).num_days();
        let quoted = quote.mid().or_else(|| quote.numeric_bid());
        if quoted.is_none() {
            warn!(
                "{}: {} {:.2} has no bid, limit set from the premium estimate",
                symbol, expiration, quote.strike
            );
        }
        let per_share = quoted
            .unwrap_or_else(|| heuristic_premium(quote.strike, reference_price, dte));
        let limit_price = round_cents(per_share);
        let group = TierGroup {
            expiration,
            strike: quote.strike,
            contracts: capped,
            shares_used: capped * SHARES_PER_CONTRACT,
            estimated_premium_per_contract: limit_price * f64::from(SHARES_PER_CONTRACT),
            limit_price,
            ceiling_reached,
        };
        info!(
            "{}: tier {} strike {:.2} x{} (est. {:.2}/contract)",
            symbol, expiration, group.strike, group.contracts, group.estimated_premium_per_contract
        );
        floor = floor.max(group.strike);
        groups.push(group);
    }

    Ok(Allocation { groups, warnings })
}

fn lowest_strike_above<'a>(calls: &[&'a OptionQuote], floor: f64) -> Option<&'a OptionQuote> {
    calls
        .iter()
        .copied()
        .filter(|q| q.strike > floor)
        .min_by(|a, b| a.strike.total_cmp(&b.strike))
}

fn highest_strike<'a>(calls: &[&'a OptionQuote]) -> &'a OptionQuote {
    // callers guarantee `calls` is non-empty
    calls
        .iter()
        .copied()
        .fold(calls[0], |best, q| if q.strike > best.strike { q } else { best })
}

/// Per-share premium guess for a contract without a usable quote.
pub fn heuristic_premium(strike: f64, reference_price: f64, days_to_expiration: i64) -> f64 {
    let guess = (strike - reference_price) * 0.1 + days_to_expiration as f64 * 0.02;
    guess.max(MIN_ESTIMATED_PREMIUM)
}

pub(crate) fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()
    }

    fn chain(strikes: &[f64]) -> Vec<OptionQuote> {
        strikes
            .iter()
            .map(|s| OptionQuote::call(*s, Some(1.0), Some(1.2)))
            .collect()
    }

    fn three_dates() -> Vec<NaiveDate> {
        vec![
            today() + Duration::days(8),
            today() + Duration::days(15),
            today() + Duration::days(22),
        ]
    }

    fn chains_for(dates: &[NaiveDate], strikes: &[&[f64]]) -> BTreeMap<NaiveDate, Vec<OptionQuote>> {
        dates
            .iter()
            .zip(strikes)
            .map(|(d, s)| (*d, chain(s)))
            .collect()
    }

    #[test]
    fn split_puts_remainder_on_nearest() {
        assert_eq!(split_contracts(5, 3), vec![2, 2, 1]);
        assert_eq!(split_contracts(7, 3), vec![3, 2, 2]);
        assert_eq!(split_contracts(6, 3), vec![2, 2, 2]);
        assert_eq!(split_contracts(2, 3), vec![1, 1]);
        assert_eq!(split_contracts(4, 1), vec![4]);
        assert!(split_contracts(0, 3).is_empty());
    }

    #[test]
    fn five_hundred_shares_three_tiers() {
        let dates = three_dates();
        let chains = chains_for(
            &dates,
            &[
                &[95.0, 100.0, 102.0, 105.0],
                &[100.0, 101.0, 105.0, 110.0],
                &[100.0, 104.0, 108.0, 112.0],
            ],
        );
        let a = allocate("AAPL", 500, &dates, 100.0, &chains, &StrategyParams::default(), today())
            .unwrap();
        let strikes: Vec<f64> = a.groups.iter().map(|g| g.strike).collect();
        let contracts: Vec<u32> = a.groups.iter().map(|g| g.contracts).collect();
        let shares: Vec<u32> = a.groups.iter().map(|g| g.shares_used).collect();
        assert_eq!(strikes, vec![102.0, 105.0, 108.0]);
        assert_eq!(contracts, vec![2, 2, 1]);
        assert_eq!(shares, vec![200, 200, 100]);
        assert!(a.warnings.is_empty());
        assert_eq!(a.groups[0].limit_price, 1.1);
        assert!((a.groups[0].estimated_premium_per_contract - 110.0).abs() < 1e-9);
    }

    #[test]
    fn next_strike_must_beat_previous_not_just_price() {
        let dates = three_dates();
        // 101 is above price but not above the first tier's 102
        let chains = chains_for(&dates, &[&[102.0], &[101.0, 103.0], &[103.0, 103.5]]);
        let a = allocate("AAPL", 300, &dates, 100.0, &chains, &StrategyParams::default(), today())
            .unwrap();
        let strikes: Vec<f64> = a.groups.iter().map(|g| g.strike).collect();
        assert_eq!(strikes, vec![102.0, 103.0, 103.5]);
    }

    #[test]
    fn ceiling_uses_highest_strike_with_warning() {
        let dates = three_dates();
        let chains = chains_for(&dates, &[&[102.0, 110.0], &[100.0, 101.0], &[120.0]]);
        let a = allocate("AAPL", 300, &dates, 100.0, &chains, &StrategyParams::default(), today())
            .unwrap();
        assert_eq!(a.groups[1].strike, 101.0);
        assert!(a.groups[1].ceiling_reached);
        assert!(matches!(
            a.warnings[0],
            PlanWarning::StrikeCeilingReached { strike, wanted_above, .. }
                if strike == 101.0 && wanted_above == 102.0
        ));
        // the ceiling group does not lower the bar for the next tier
        assert_eq!(a.groups[2].strike, 120.0);
        assert!(!a.groups[2].ceiling_reached);
    }

    #[test]
    fn cap_limits_contracts_per_expiration() {
        let dates = vec![today() + Duration::days(10)];
        let chains = chains_for(&dates, &[&[105.0]]);
        let params = StrategyParams {
            max_contracts_per_expiration: 3,
            ..StrategyParams::default()
        };
        let a = allocate("AAPL", 1_000, &dates, 100.0, &chains, &params, today()).unwrap();
        assert_eq!(a.groups[0].contracts, 3);
        assert_eq!(a.groups[0].shares_used, 300);
        assert!(matches!(
            a.warnings[0],
            PlanWarning::ContractCapApplied { requested: 10, capped: 3, .. }
        ));
    }

    #[test]
    fn under_one_contract_is_insufficient() {
        let dates = three_dates();
        let err = allocate("AAPL", 99, &dates, 100.0, &BTreeMap::new(), &StrategyParams::default(), today())
            .unwrap_err();
        assert!(matches!(err, StrategyError::InsufficientShares { available: 99, .. }));
    }

    #[test]
    fn odd_lot_shares_are_left_over() {
        let dates = three_dates();
        let chains = chains_for(&dates, &[&[101.0], &[102.0], &[103.0]]);
        let a = allocate("AAPL", 450, &dates, 100.0, &chains, &StrategyParams::default(), today())
            .unwrap();
        let used: u32 = a.groups.iter().map(|g| g.shares_used).sum();
        assert_eq!(used, 400);
    }

    #[test]
    fn quoteless_contract_uses_heuristic() {
        let d = today() + Duration::days(10);
        let mut chains = BTreeMap::new();
        chains.insert(d, vec![OptionQuote::call(110.0, None, None)]);
        let params = StrategyParams {
            require_quotes: false,
            ..StrategyParams::default()
        };
        let a = allocate("AAPL", 100, &[d], 100.0, &chains, &params, today()).unwrap();
        // (110 - 100) * 0.1 + 10 * 0.02 = 1.2
        assert_eq!(a.groups[0].limit_price, 1.2);
        assert!((a.groups[0].estimated_premium_per_contract - 120.0).abs() < 1e-9);
        assert_eq!(heuristic_premium(100.5, 100.0, 1), MIN_ESTIMATED_PREMIUM);
    }
}
