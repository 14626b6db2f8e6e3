//! End-to-end scenarios against the in-memory broker.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use tiered_calls::config::{ExecParams, StrategyParams};
use tiered_calls::executor::RollState;
use tiered_calls::ledger::CostBasisLedger;
use tiered_calls::memory_broker::{MemoryBroker, SubmitScript};
use tiered_calls::types::{
    BrokerPosition, ExecutionKind, OptionQuote, OrderSide, ShortCall, SHARES_PER_CONTRACT,
};
use tiered_calls::{StrategyError, TieredCallEngine};

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 21).unwrap()
}

fn exec() -> ExecParams {
    ExecParams {
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
        call_timeout_sec: 1,
        fill_timeout_sec: 1,
        poll_interval_ms: 5,
        ..ExecParams::default()
    }
}

fn calls(strikes: &[f64]) -> Vec<OptionQuote> {
    strikes
        .iter()
        .map(|s| OptionQuote::call(*s, Some(1.0), Some(1.2)))
        .collect()
}

/// Holder of `shares` AAPL at 100 with three liquid weekly expirations.
fn tiered_market(shares: u32) -> Arc<MemoryBroker> {
    let b = Arc::new(MemoryBroker::new());
    b.set_price("AAPL", 100.0);
    b.set_position(
        "AAPL",
        BrokerPosition {
            shares,
            cost_basis: Some(92.0),
            ..Default::default()
        },
    );
    let dates: Vec<NaiveDate> = [7, 14, 21, 28]
        .iter()
        .map(|d| today() + Duration::days(*d))
        .collect();
    b.set_expirations("AAPL", dates.clone());
    b.set_chain("AAPL", dates[0], calls(&[97.5, 100.0, 102.0, 104.0]));
    b.set_chain("AAPL", dates[1], calls(&[100.0, 101.0, 105.0, 110.0]));
    b.set_chain("AAPL", dates[2], calls(&[100.0, 104.0, 108.0, 112.0]));
    b.set_chain("AAPL", dates[3], calls(&[115.0]));
    b
}

/// Holder of 300 AAPL with one 95 call expiring today and the stock at 100.
fn roll_market() -> Arc<MemoryBroker> {
    let b = Arc::new(MemoryBroker::new());
    b.set_price("AAPL", 100.0);
    b.set_position(
        "AAPL",
        BrokerPosition {
            shares: 300,
            cost_basis: Some(92.0),
            short_calls: vec![ShortCall {
                symbol: "AAPL".into(),
                strike: 95.0,
                expiration: today(),
                quantity: 1,
                avg_price: Some(1.1),
            }],
            long_options: vec![],
        },
    );
    b.set_chain("AAPL", today(), vec![OptionQuote::call(95.0, Some(5.0), Some(5.2))]);
    let next = today() + Duration::days(7);
    b.set_expirations("AAPL", vec![today(), next]);
    b.set_chain(
        "AAPL",
        next,
        vec![
            OptionQuote::call(95.0, Some(5.6), Some(5.8)),
            OptionQuote::call(100.0, Some(2.0), Some(2.2)),
        ],
    );
    b
}

#[tokio::test]
async fn below_minimum_shares_submits_nothing() {
    let b = tiered_market(250);
    let engine = TieredCallEngine::new(b.clone(), Arc::new(CostBasisLedger::in_memory()), exec());
    let err = engine
        .plan_tiered_strategy("AAPL", &StrategyParams::default(), today())
        .await
        .unwrap_err();
    assert!(matches!(err, StrategyError::BelowMinimumShares { total: 250, .. }));
    assert_eq!(b.submit_calls(), 0);
}

#[tokio::test]
async fn five_hundred_shares_tier_and_record() {
    let b = tiered_market(500);
    let ledger = Arc::new(CostBasisLedger::in_memory());
    let engine = TieredCallEngine::new(b.clone(), ledger.clone(), exec());

    let plan = engine
        .plan_tiered_strategy("AAPL", &StrategyParams::default(), today())
        .await
        .unwrap();
    let strikes: Vec<f64> = plan.groups.iter().map(|g| g.strike).collect();
    let contracts: Vec<u32> = plan.groups.iter().map(|g| g.contracts).collect();
    assert_eq!(strikes, vec![102.0, 105.0, 108.0]);
    assert_eq!(contracts, vec![2, 2, 1]);
    assert!(plan.shares_allocated() <= plan.available_shares);
    for g in &plan.groups {
        assert_eq!(g.contracts, g.shares_used / SHARES_PER_CONTRACT);
        assert!(g.strike > plan.reference_price);
    }

    let result = engine.execute_plan(plan).await.unwrap();
    assert_eq!(result.contracts_filled, 5);
    assert!((result.premium_realized - 550.0).abs() < 1e-6);
    assert_eq!(b.placed_on(OrderSide::SellToOpen).len(), 3);

    let rec = engine.get_cost_basis_summary("AAPL").await.unwrap();
    assert_eq!(rec.entries.len(), 1);
    assert_eq!(rec.entries[0].kind, ExecutionKind::InitialCoveredCalls);
    assert_eq!(rec.entries[0].shares_affected, 500);
    assert_eq!(
        rec.effective_cost_basis,
        rec.original_cost_basis - rec.cumulative_premium / f64::from(rec.total_shares)
    );
}

#[tokio::test]
async fn dry_run_plan_leaves_broker_and_ledger_untouched() {
    let b = tiered_market(500);
    let engine = TieredCallEngine::new(
        b.clone(),
        Arc::new(CostBasisLedger::in_memory()),
        ExecParams {
            dry_run: true,
            ..exec()
        },
    );
    let plan = engine
        .plan_tiered_strategy("AAPL", &StrategyParams::default(), today())
        .await
        .unwrap();
    let result = engine.execute_plan(plan).await.unwrap();
    assert!(result.dry_run);
    assert_eq!(b.submit_calls(), 0);
    assert!(engine.get_cost_basis_summary("AAPL").await.is_err());
}

#[tokio::test]
async fn close_leg_exhausted_aborts_roll() {
    let b = roll_market();
    b.script(
        OrderSide::BuyToClose,
        (0..3).map(|_| SubmitScript::Transient("connection reset".into())),
    );
    let engine = TieredCallEngine::new(b.clone(), Arc::new(CostBasisLedger::in_memory()), exec());
    let plan = engine
        .find_and_plan_rolls(Some("AAPL"), &StrategyParams::default(), today())
        .await
        .unwrap();
    assert_eq!(plan.opportunities.len(), 1);

    let res = engine.execute_roll_plan(plan).await.unwrap();
    assert_eq!(res.aborted, 1);
    assert_eq!(res.transactions[0].state, RollState::Aborted);
    assert!(b.placed_on(OrderSide::SellToOpen).is_empty());
    assert!(b.placed_orders().is_empty());
    assert!(res.unrecorded_debits.is_empty());
}

#[tokio::test]
async fn open_leg_exhausted_is_partial_failure() {
    let b = roll_market();
    b.script(
        OrderSide::SellToOpen,
        (0..3).map(|_| SubmitScript::Ambiguous { lands: false }),
    );
    let engine = TieredCallEngine::new(b.clone(), Arc::new(CostBasisLedger::in_memory()), exec());
    let plan = engine
        .find_and_plan_rolls(None, &StrategyParams::default(), today())
        .await
        .unwrap();
    let res = engine.execute_roll_plan(plan).await.unwrap();

    let tx = &res.transactions[0];
    assert_eq!(tx.state, RollState::PartialFailure);
    assert!(tx.close.as_ref().unwrap().is_fully_filled());
    assert!(!tx.open.as_ref().unwrap().is_fully_filled());
    assert_eq!(tx.uncovered_contracts(), 1);
    assert_eq!(res.partial_failures, 1);
    assert!(engine.get_cost_basis_summary("AAPL").await.is_err());
}

#[tokio::test]
async fn ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cost_basis.jsonl");
    let b = tiered_market(500);
    {
        let engine = TieredCallEngine::new(
            b.clone(),
            Arc::new(CostBasisLedger::open(&path).unwrap()),
            exec(),
        );
        let plan = engine
            .plan_tiered_strategy("AAPL", &StrategyParams::default(), today())
            .await
            .unwrap();
        engine.execute_plan(plan).await.unwrap();
    }

    let ledger = Arc::new(CostBasisLedger::open(&path).unwrap());
    let rec = ledger.summarize("AAPL").await.unwrap();
    assert_eq!(rec.original_cost_basis, 92.0);
    assert!((rec.cumulative_premium - 550.0).abs() < 1e-6);

    // the next plan starts from the recorded premium
    let engine = TieredCallEngine::new(b, ledger, exec());
    let plan = engine
        .plan_tiered_strategy("AAPL", &StrategyParams::default(), today())
        .await
        .unwrap();
    assert!((plan.cumulative_premium_before - 550.0).abs() < 1e-6);
}
