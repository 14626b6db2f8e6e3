//! Engine façade: the operations exposed to the command line and any scheduler driving it.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::{ExecParams, StrategyParams};
use crate::error::Result;
use crate::executor::{GroupExecution, RollState, RollTransaction, TransactionExecutor};
use crate::expirations::ExpirationSelector;
use crate::ledger::{CostBasisLedger, NewImpact};
use crate::planner::StrategyPlanner;
use crate::positions::PositionReader;
use crate::retry::RetryPolicy;
use crate::roller::RollEngine;
use crate::types::{
    BasisSeed, CostBasisRecord, ExecutionKind, RollOpportunity, RollPlan, StrategyPlan,
    SHARES_PER_CONTRACT,
};

#[derive(Debug, Clone, Serialize)]
pub struct PlanExecutionResult {
    pub execution_id: String,
    pub symbol: String,
    pub dry_run: bool,
    pub groups: Vec<GroupExecution>,
    pub contracts_filled: u32,
    pub premium_realized: f64,
    /// Ledger state after recording, when anything filled.
    pub cost_basis: Option<CostBasisRecord>,
    pub ledger_error: Option<String>,
}

/// A roll whose buyback cost more than the replacement brought in.
#[derive(Debug, Clone, Serialize)]
pub struct UnrecordedDebit {
    pub symbol: String,
    pub transaction_id: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollExecutionResult {
    pub dry_run: bool,
    pub transactions: Vec<RollTransaction>,
    pub completed: usize,
    pub aborted: usize,
    pub unresolved: usize,
    pub partial_failures: usize,
    /// Net credit actually recorded to the ledger, in dollars.
    pub net_credit_realized: f64,
    pub unrecorded_debits: Vec<UnrecordedDebit>,
    pub ledger_errors: Vec<String>,
    pub cost_basis: BTreeMap<String, CostBasisRecord>,
}

pub struct TieredCallEngine {
    broker: Arc<dyn Broker>,
    planner: StrategyPlanner,
    roller: RollEngine,
    executor: TransactionExecutor,
    ledger: Arc<CostBasisLedger>,
    dry_run: bool,
}

impl TieredCallEngine {
    pub fn new(broker: Arc<dyn Broker>, ledger: Arc<CostBasisLedger>, exec: ExecParams) -> Self {
        Self::with_retry_policy(broker, ledger, exec.clone(), RetryPolicy::from(&exec))
    }

    pub fn with_retry_policy(
        broker: Arc<dyn Broker>,
        ledger: Arc<CostBasisLedger>,
        exec: ExecParams,
        retry: RetryPolicy,
    ) -> Self {
        let positions = Arc::new(PositionReader::new(broker.clone(), retry.clone()));
        let expirations = Arc::new(ExpirationSelector::new(broker.clone(), retry.clone()));
        Self {
            planner: StrategyPlanner::new(positions.clone(), expirations.clone(), ledger.clone()),
            roller: RollEngine::new(
                broker.clone(),
                positions,
                expirations,
                ledger.clone(),
                retry.clone(),
            ),
            dry_run: exec.dry_run,
            executor: TransactionExecutor::new(broker.clone(), exec).with_retry_policy(retry),
            broker,
            ledger,
        }
    }

    pub fn broker_name(&self) -> &str {
        self.broker.name()
    }

    /// Setting the returned flag stops submissions that have not started yet.
    pub fn halt_handle(&self) -> Arc<AtomicBool> {
        self.executor.halt_handle()
    }

    pub async fn plan_tiered_strategy(
        &self,
        symbol: &str,
        params: &StrategyParams,
        today: NaiveDate,
    ) -> Result<StrategyPlan> {
        self.planner.plan(symbol, params, today).await
    }

    /// Open every tier group, then record what filled as one ledger entry.
    pub async fn execute_plan(&self, plan: StrategyPlan) -> Result<PlanExecutionResult> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        if self.dry_run {
            info!(
                "Dry run: {} would open {} contracts across {} tiers",
                plan.symbol,
                plan.total_contracts,
                plan.groups.len()
            );
            return Ok(PlanExecutionResult {
                execution_id,
                symbol: plan.symbol.clone(),
                dry_run: true,
                groups: plan
                    .groups
                    .iter()
                    .map(|g| GroupExecution {
                        group: g.clone(),
                        leg: None,
                        error: None,
                    })
                    .collect(),
                contracts_filled: 0,
                premium_realized: 0.0,
                cost_basis: None,
                ledger_error: None,
            });
        }

        let groups = self.executor.execute_plan(&plan).await;
        let contracts_filled: u32 = groups.iter().map(GroupExecution::contracts_filled).sum();
        let premium_realized: f64 = groups.iter().map(GroupExecution::premium_realized).sum();

        let mut cost_basis = None;
        let mut ledger_error = None;
        if contracts_filled > 0 {
            let seed = BasisSeed {
                original_cost_basis: plan.original_cost_basis,
                total_shares: plan.total_shares,
            };
            let impact = NewImpact {
                execution_id: execution_id.clone(),
                kind: ExecutionKind::InitialCoveredCalls,
                premium_collected: premium_realized,
                shares_affected: contracts_filled * SHARES_PER_CONTRACT,
                contracts: contracts_filled,
            };
            match self.ledger.record_impact(&plan.symbol, seed, impact).await {
                Ok(rec) => cost_basis = Some(rec),
                Err(e) => {
                    error!(
                        "{}: {:.2} premium filled but not recorded: {}",
                        plan.symbol, premium_realized, e
                    );
                    ledger_error = Some(e.to_string());
                }
            }
        }

        info!(
            "{}: plan executed, {}/{} contracts filled, premium {:.2}",
            plan.symbol, contracts_filled, plan.total_contracts, premium_realized
        );
        Ok(PlanExecutionResult {
            execution_id,
            symbol: plan.symbol,
            dry_run: false,
            groups,
            contracts_filled,
            premium_realized,
            cost_basis,
            ledger_error,
        })
    }

    pub async fn find_and_plan_rolls(
        &self,
        symbol: Option<&str>,
        params: &StrategyParams,
        today: NaiveDate,
    ) -> Result<RollPlan> {
        self.roller.find_and_plan(symbol, params, today).await
    }

    /// Run every roll. Symbols proceed concurrently; rolls on one symbol run one after another.
    pub async fn execute_roll_plan(&self, plan: RollPlan) -> Result<RollExecutionResult> {
        if self.dry_run {
            info!("Dry run: {} rolls planned, nothing submitted", plan.opportunities.len());
            return Ok(RollExecutionResult {
                dry_run: true,
                transactions: plan
                    .opportunities
                    .into_iter()
                    .map(RollTransaction::new)
                    .collect(),
                completed: 0,
                aborted: 0,
                unresolved: 0,
                partial_failures: 0,
                net_credit_realized: 0.0,
                unrecorded_debits: Vec::new(),
                ledger_errors: Vec::new(),
                cost_basis: BTreeMap::new(),
            });
        }

        let mut by_symbol: BTreeMap<String, Vec<RollOpportunity>> = BTreeMap::new();
        for o in plan.opportunities {
            by_symbol.entry(o.symbol().to_string()).or_default().push(o);
        }

        let seeds = &plan.basis_seeds;
        let lanes = by_symbol
            .into_iter()
            .map(|(symbol, opps)| async move {
                let seed = seeds.get(&symbol).copied();
                let mut lane = Lane::default();
                for o in &opps {
                    match self.executor.execute_roll(o).await {
                        Ok(tx) => {
                            self.settle_roll(&symbol, seed, &tx, &mut lane).await;
                            lane.transactions.push(tx);
                        }
                        Err(e) => {
                            error!("{}: roll execution stopped: {}", symbol, e);
                            lane.ledger_errors.push(format!("{symbol}: {e}"));
                            break;
                        }
                    }
                }
                lane
            });
        let lanes = join_all(lanes).await;

        let mut out = RollExecutionResult {
            dry_run: false,
            transactions: Vec::new(),
            completed: 0,
            aborted: 0,
            unresolved: 0,
            partial_failures: 0,
            net_credit_realized: 0.0,
            unrecorded_debits: Vec::new(),
            ledger_errors: Vec::new(),
            cost_basis: BTreeMap::new(),
        };
        for lane in lanes {
            out.net_credit_realized += lane.net_credit_realized;
            out.unrecorded_debits.extend(lane.unrecorded_debits);
            out.ledger_errors.extend(lane.ledger_errors);
            out.cost_basis.extend(lane.cost_basis);
            out.transactions.extend(lane.transactions);
        }
        for tx in &out.transactions {
            match tx.state {
                RollState::OpenConfirmed => out.completed += 1,
                RollState::Aborted => out.aborted += 1,
                RollState::CloseUnresolved => out.unresolved += 1,
                RollState::PartialFailure => out.partial_failures += 1,
                _ => {}
            }
        }
        info!(
            "Roll cycle: {} completed, {} aborted, {} unresolved, {} partial, net credit {:.2}",
            out.completed, out.aborted, out.unresolved, out.partial_failures, out.net_credit_realized
        );
        Ok(out)
    }

    async fn settle_roll(
        &self,
        symbol: &str,
        seed: Option<BasisSeed>,
        tx: &RollTransaction,
        lane: &mut Lane,
    ) {
        let net = tx.realized_net_credit();
        if net < 0.0 {
            warn!("{}: roll {} settled at a debit of {:.2}", symbol, tx.id, -net);
            lane.unrecorded_debits.push(UnrecordedDebit {
                symbol: symbol.to_string(),
                transaction_id: tx.id.clone(),
                amount: -net,
            });
            return;
        }
        if tx.state != RollState::OpenConfirmed || net == 0.0 {
            return;
        }
        let opened = tx.open.as_ref().map_or(0, |l| l.filled_contracts());
        let seed = seed.unwrap_or_else(|| {
            warn!("{}: no cost basis on record, seeding from reference price", symbol);
            BasisSeed {
                original_cost_basis: tx.opportunity.reference_price,
                total_shares: opened * SHARES_PER_CONTRACT,
            }
        });
        let impact = NewImpact {
            execution_id: tx.id.clone(),
            kind: ExecutionKind::Roll,
            premium_collected: net,
            shares_affected: opened * SHARES_PER_CONTRACT,
            contracts: opened,
        };
        match self.ledger.record_impact(symbol, seed, impact).await {
            Ok(rec) => {
                lane.net_credit_realized += net;
                lane.cost_basis.insert(symbol.to_string(), rec);
            }
            Err(e) => {
                error!("{}: roll {} credit {:.2} not recorded: {}", symbol, tx.id, net, e);
                lane.ledger_errors.push(format!("{symbol}: {e}"));
            }
        }
    }

    pub async fn get_cost_basis_summary(&self, symbol: &str) -> Result<CostBasisRecord> {
        self.ledger.summarize(symbol).await
    }
}

#[derive(Default)]
struct Lane {
    transactions: Vec<RollTransaction>,
    net_credit_realized: f64,
    unrecorded_debits: Vec<UnrecordedDebit>,
    ledger_errors: Vec<String>,
    cost_basis: BTreeMap<String, CostBasisRecord>,
}
