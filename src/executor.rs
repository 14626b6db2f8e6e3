//! Transaction executor: single-leg orders with duplicate-safe retries, and two-leg rolls driven
//! by an explicit state machine.
//!
//! A leg is only resubmitted after the broker confirms it has no record of the previous attempt.
//! Rolls always confirm the close before the open is sent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::ExecParams;
use crate::error::{BrokerError, Result, StrategyError};
use crate::retry::{with_timeout, Backoff, RetryPolicy};
use crate::types::{
    OrderResult, OrderSide, OrderSpec, OrderStatus, RollOpportunity, StrategyPlan, TierGroup,
    SHARES_PER_CONTRACT,
};

/// Outcome of one order leg after submission and fill monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct LegReport {
    pub order: OrderSpec,
    pub result: OrderResult,
    /// Submissions actually sent, re-queries excluded.
    pub submissions: u32,
}

impl LegReport {
    pub fn filled_contracts(&self) -> u32 {
        self.result.filled_quantity.min(self.order.quantity)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.result.status == OrderStatus::Filled && self.filled_contracts() == self.order.quantity
    }

    /// Per-share fill price, falling back to the limit price.
    pub fn fill_price(&self) -> Option<f64> {
        self.result.filled_price.or(self.order.limit_price)
    }

    /// Dollars exchanged for the filled contracts.
    pub fn filled_notional(&self) -> f64 {
        self.fill_price().unwrap_or(0.0)
            * f64::from(self.filled_contracts())
            * f64::from(SHARES_PER_CONTRACT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollState {
    Planned,
    ClosePending,
    ClosedConfirmed,
    OpenPending,
    OpenConfirmed,
    /// Close leg failed; the original short call is untouched.
    Aborted,
    /// Close leg did not reach a final status (unknown, or still working after cancel); nothing
    /// further was sent.
    CloseUnresolved,
    /// Close confirmed but the replacement was not opened; the shares are uncovered.
    PartialFailure,
}

impl RollState {
    fn can_advance_to(self, next: RollState) -> bool {
        use RollState::*;
        matches!(
            (self, next),
            (Planned, ClosePending)
                | (Planned, Aborted)
                | (ClosePending, ClosedConfirmed)
                | (ClosePending, Aborted)
                | (ClosePending, CloseUnresolved)
                | (ClosedConfirmed, OpenPending)
                | (OpenPending, OpenConfirmed)
                | (OpenPending, PartialFailure)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::OpenConfirmed | Self::Aborted | Self::CloseUnresolved | Self::PartialFailure
        )
    }
}

impl fmt::Display for RollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One roll and everything that happened to it.
#[derive(Debug, Clone, Serialize)]
pub struct RollTransaction {
    pub id: String,
    pub opportunity: RollOpportunity,
    pub state: RollState,
    pub history: Vec<RollState>,
    pub close: Option<LegReport>,
    pub open: Option<LegReport>,
    pub failure: Option<String>,
}

impl RollTransaction {
    pub fn new(opportunity: RollOpportunity) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            opportunity,
            state: RollState::Planned,
            history: vec![RollState::Planned],
            close: None,
            open: None,
            failure: None,
        }
    }

    pub fn advance(&mut self, next: RollState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            error!(
                "Roll {} ({}): invalid transition {} -> {}",
                self.id,
                self.opportunity.symbol(),
                self.state,
                next
            );
            return Err(StrategyError::InvalidRollTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        info!(
            "Roll {} ({}): {} -> {}",
            self.id,
            self.opportunity.symbol(),
            self.state,
            next
        );
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn fail(&mut self, next: RollState, reason: String) -> Result<()> {
        self.advance(next)?;
        warn!("Roll {} ({}) {}: {}", self.id, self.opportunity.symbol(), next, reason);
        self.failure = Some(reason);
        Ok(())
    }

    /// Premium received minus buyback paid, in dollars, over what actually filled.
    pub fn realized_net_credit(&self) -> f64 {
        let paid = self.close.as_ref().map_or(0.0, LegReport::filled_notional);
        let received = self.open.as_ref().map_or(0.0, LegReport::filled_notional);
        received - paid
    }

    /// Contracts closed but not replaced.
    pub fn uncovered_contracts(&self) -> u32 {
        let closed = self.close.as_ref().map_or(0, LegReport::filled_contracts);
        let opened = self.open.as_ref().map_or(0, LegReport::filled_contracts);
        closed.saturating_sub(opened)
    }
}

/// Outcome of one tier group's opening order.
#[derive(Debug, Clone, Serialize)]
pub struct GroupExecution {
    pub group: TierGroup,
    pub leg: Option<LegReport>,
    pub error: Option<String>,
}

impl GroupExecution {
    pub fn premium_realized(&self) -> f64 {
        self.leg.as_ref().map_or(0.0, LegReport::filled_notional)
    }

    pub fn contracts_filled(&self) -> u32 {
        self.leg.as_ref().map_or(0, LegReport::filled_contracts)
    }
}

pub struct TransactionExecutor {
    broker: Arc<dyn Broker>,
    exec: ExecParams,
    retry: RetryPolicy,
    halted: Arc<AtomicBool>,
}

impl TransactionExecutor {
    pub fn new(broker: Arc<dyn Broker>, exec: ExecParams) -> Self {
        Self {
            retry: RetryPolicy::from(&exec),
            broker,
            exec,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Setting the flag stops new submissions. Legs already sent are seen through.
    pub fn halt_handle(&self) -> Arc<AtomicBool> {
        self.halted.clone()
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub async fn execute_single_leg(&self, order: &OrderSpec) -> Result<LegReport> {
        if self.is_halted() {
            return Err(StrategyError::Halted);
        }
        self.run_leg(order).await
    }

    async fn run_leg(&self, order: &OrderSpec) -> Result<LegReport> {
        let (accepted, submissions) = match self.submit_once(order).await? {
            Submitted::Accepted(r, n) => (r, n),
            Submitted::Unresolved(msg, n) => {
                let mut r = OrderResult::with_status(OrderStatus::Unknown, None);
                r.message = Some(msg);
                return Ok(LegReport {
                    order: order.clone(),
                    result: r,
                    submissions: n,
                });
            }
        };
        let mut result = self.poll_until_filled(order, accepted).await;
        if order.side == OrderSide::BuyToClose && !result.status.is_terminal() {
            result = self.cancel_and_requery(order, result).await;
        }
        info!(
            "{} {} {} {:.2} x{}: {:?}, filled {} @ {:?}",
            order.client_order_id,
            side_label(order.side),
            order.symbol,
            order.strike,
            order.quantity,
            result.status,
            result.filled_quantity,
            result.filled_price
        );
        Ok(LegReport {
            order: order.clone(),
            result,
            submissions,
        })
    }

    /// Submit until the broker accepts the order, re-querying before every resubmission.
    async fn submit_once(&self, order: &OrderSpec) -> Result<Submitted> {
        let mut backoff = Backoff::new(&self.retry);
        let mut sent = 0u32;
        let mut last_error: Option<BrokerError> = None;

        while sent < self.retry.max_attempts {
            if sent > 0 {
                match self.lookup(order).await {
                    Lookup::Found(r) => {
                        info!("{}: earlier submission found at broker", order.client_order_id);
                        return self.accepted(order, r, sent);
                    }
                    Lookup::Absent => {}
                    Lookup::Indeterminate(msg) => {
                        error!(
                            "{}: cannot confirm earlier submission, not resubmitting: {}",
                            order.client_order_id, msg
                        );
                        return Ok(Submitted::Unresolved(msg, sent));
                    }
                }
                let delay = backoff.next_delay();
                warn!(
                    "{}: resubmitting in {:?} (attempt {}/{})",
                    order.client_order_id,
                    delay,
                    sent + 1,
                    self.retry.max_attempts
                );
                sleep(delay).await;
            }

            sent += 1;
            info!(
                "{}: submit {} {} {} {:.2}C x{} limit {:?}",
                order.client_order_id,
                side_label(order.side),
                order.symbol,
                order.expiration,
                order.strike,
                order.quantity,
                order.limit_price
            );
            match with_timeout(self.retry.call_timeout, self.broker.submit_order(order)).await {
                Ok(r) => return self.accepted(order, r, sent),
                Err(BrokerError::Rejected(reason)) => {
                    return Err(StrategyError::OrderRejected {
                        client_order_id: order.client_order_id.clone(),
                        reason,
                    })
                }
                Err(e) if e.is_retryable() => {
                    warn!("{}: submission outcome unknown: {}", order.client_order_id, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(StrategyError::broker("submit_order", e)),
            }
        }

        // The last attempt may still have landed.
        match self.lookup(order).await {
            Lookup::Found(r) => self.accepted(order, r, sent),
            Lookup::Indeterminate(msg) => Ok(Submitted::Unresolved(msg, sent)),
            Lookup::Absent => Err(StrategyError::RetriesExhausted {
                op: format!("submit_order {}", order.client_order_id),
                attempts: sent,
                last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
            }),
        }
    }

    fn accepted(&self, order: &OrderSpec, r: OrderResult, sent: u32) -> Result<Submitted> {
        if r.status == OrderStatus::Rejected {
            return Err(StrategyError::OrderRejected {
                client_order_id: order.client_order_id.clone(),
                reason: r.message.unwrap_or_else(|| "rejected".to_string()),
            });
        }
        Ok(Submitted::Accepted(r, sent))
    }

    async fn lookup(&self, order: &OrderSpec) -> Lookup {
        let found = match with_timeout(
            self.retry.call_timeout,
            self.broker.find_order(&order.client_order_id),
        )
        .await
        {
            Ok(found) => found,
            Err(e) => return Lookup::Indeterminate(e.to_string()),
        };
        match found {
            Some(r) if r.status != OrderStatus::Rejected => Lookup::Found(r),
            Some(_) | None => Lookup::Absent,
        }
    }

    /// Poll a working order until it reaches a terminal state or the fill timeout elapses.
    async fn poll_until_filled(&self, order: &OrderSpec, accepted: OrderResult) -> OrderResult {
        if accepted.status.is_terminal() {
            return accepted;
        }
        let Some(id) = accepted.broker_order_id.clone() else {
            return accepted;
        };
        let deadline = Instant::now() + self.exec.fill_timeout();
        let mut last = accepted;
        while Instant::now() < deadline {
            sleep(self.exec.poll_interval()).await;
            match with_timeout(self.retry.call_timeout, self.broker.get_order_status(&id)).await {
                Ok(r) => {
                    last = r;
                    if last.status.is_terminal() {
                        return last;
                    }
                }
                Err(e) => warn!("{}: status check failed: {}", order.client_order_id, e),
            }
        }
        warn!(
            "{}: not filled within {:?} (status {:?})",
            order.client_order_id,
            self.exec.fill_timeout(),
            last.status
        );
        last
    }

    async fn cancel_and_requery(&self, order: &OrderSpec, last: OrderResult) -> OrderResult {
        let Some(id) = last.broker_order_id.clone() else {
            return last;
        };
        if let Err(e) = with_timeout(self.retry.call_timeout, self.broker.cancel_order(&id)).await {
            warn!("{}: cancel failed: {}", order.client_order_id, e);
        }
        match with_timeout(self.retry.call_timeout, self.broker.get_order_status(&id)).await {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: status after cancel unknown: {}", order.client_order_id, e);
                last
            }
        }
    }

    /// Close the expiring call, then open the replacement. Never returns a partial state as an
    /// error: failed legs are recorded on the transaction.
    pub async fn execute_roll(&self, opportunity: &RollOpportunity) -> Result<RollTransaction> {
        let mut tx = RollTransaction::new(opportunity.clone());
        if self.is_halted() {
            tx.fail(RollState::Aborted, StrategyError::Halted.to_string())?;
            return Ok(tx);
        }
        let tif = self.exec.time_in_force();
        let cur = &opportunity.current;

        tx.advance(RollState::ClosePending)?;
        let close = OrderSpec::call(
            &cur.symbol,
            cur.expiration,
            cur.strike,
            OrderSide::BuyToClose,
            cur.quantity,
            Some(opportunity.close_price),
            tif,
        );
        match self.run_leg(&close).await {
            Ok(leg) if !leg.result.status.is_terminal() => {
                let msg = leg.result.message.clone().unwrap_or_else(|| {
                    format!(
                        "close leg still {:?} with {} filled; order may be live",
                        leg.result.status,
                        leg.filled_contracts()
                    )
                });
                tx.close = Some(leg);
                tx.fail(RollState::CloseUnresolved, msg)?;
                return Ok(tx);
            }
            Ok(leg) if leg.filled_contracts() == 0 => {
                let msg = format!("close leg ended {:?} with nothing filled", leg.result.status);
                tx.close = Some(leg);
                tx.fail(RollState::Aborted, msg)?;
                return Ok(tx);
            }
            Ok(leg) => {
                tx.close = Some(leg);
                tx.advance(RollState::ClosedConfirmed)?;
            }
            Err(e) => {
                tx.fail(RollState::Aborted, e.to_string())?;
                return Ok(tx);
            }
        }

        let closed = tx.close.as_ref().map_or(0, LegReport::filled_contracts);
        tx.advance(RollState::OpenPending)?;
        let open = OrderSpec::call(
            &cur.symbol,
            opportunity.target_expiration,
            opportunity.target_strike,
            OrderSide::SellToOpen,
            closed,
            Some(opportunity.open_price),
            tif,
        );
        let opened = self.run_leg(&open).await;
        match opened {
            Ok(leg) if leg.is_fully_filled() => {
                tx.open = Some(leg);
                tx.advance(RollState::OpenConfirmed)?;
            }
            Ok(leg) => {
                let msg = format!(
                    "open leg {:?}, {} of {} contracts filled; {} contracts uncovered",
                    leg.result.status,
                    leg.filled_contracts(),
                    closed,
                    closed.saturating_sub(leg.filled_contracts())
                );
                tx.open = Some(leg);
                tx.fail(RollState::PartialFailure, msg)?;
            }
            Err(e) => {
                let msg = format!("open leg failed: {e}; {closed} contracts uncovered");
                tx.open = Some(LegReport {
                    result: {
                        let mut r = OrderResult::with_status(OrderStatus::Rejected, None);
                        r.message = Some(e.to_string());
                        r
                    },
                    order: open,
                    submissions: 0,
                });
                tx.fail(RollState::PartialFailure, msg)?;
            }
        }
        Ok(tx)
    }

    /// Open every tier group in order. A failed group does not stop later ones.
    pub async fn execute_plan(&self, plan: &StrategyPlan) -> Vec<GroupExecution> {
        let tif = self.exec.time_in_force();
        let mut out = Vec::with_capacity(plan.groups.len());
        for g in &plan.groups {
            if self.is_halted() {
                out.push(GroupExecution {
                    group: g.clone(),
                    leg: None,
                    error: Some(StrategyError::Halted.to_string()),
                });
                continue;
            }
            let order = OrderSpec::call(
                &plan.symbol,
                g.expiration,
                g.strike,
                OrderSide::SellToOpen,
                g.contracts,
                Some(g.limit_price),
                tif,
            );
            let exec = match self.run_leg(&order).await {
                Ok(leg) => {
                    let error = (!leg.is_fully_filled()).then(|| {
                        format!(
                            "{:?}, {} of {} contracts filled",
                            leg.result.status,
                            leg.filled_contracts(),
                            g.contracts
                        )
                    });
                    GroupExecution {
                        group: g.clone(),
                        leg: Some(leg),
                        error,
                    }
                }
                Err(e) => {
                    error!("{}: tier {} failed: {}", plan.symbol, g.expiration, e);
                    GroupExecution {
                        group: g.clone(),
                        leg: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            out.push(exec);
        }
        out
    }
}

enum Submitted {
    Accepted(OrderResult, u32),
    Unresolved(String, u32),
}

enum Lookup {
    Found(OrderResult),
    Absent,
    Indeterminate(String),
}

fn side_label(side: OrderSide) -> &'static str {
    match side {
        OrderSide::BuyToClose => "BTC",
        OrderSide::SellToOpen => "STO",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_broker::{MemoryBroker, SubmitScript};
    use crate::types::{ShortCall, TimeInForce};
    use chrono::NaiveDate;
    use std::time::Duration;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn fast() -> ExecParams {
        ExecParams {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            call_timeout_sec: 1,
            fill_timeout_sec: 1,
            poll_interval_ms: 5,
            ..ExecParams::default()
        }
    }

    fn executor(b: Arc<MemoryBroker>) -> TransactionExecutor {
        TransactionExecutor::new(b, fast())
    }

    fn order() -> OrderSpec {
        OrderSpec::call("AAPL", d(24), 105.0, OrderSide::SellToOpen, 2, Some(1.1), TimeInForce::Day)
    }

    fn opportunity() -> RollOpportunity {
        RollOpportunity {
            current: ShortCall {
                symbol: "AAPL".into(),
                strike: 95.0,
                expiration: d(17),
                quantity: 2,
                avg_price: Some(1.0),
            },
            reference_price: 100.0,
            target_expiration: d(24),
            target_strike: 97.5,
            close_price: 5.2,
            open_price: 5.35,
            estimated_net_credit: 0.15,
        }
    }

    #[tokio::test]
    async fn transient_failure_is_requeried_then_resubmitted() {
        let b = Arc::new(MemoryBroker::new());
        b.script(OrderSide::SellToOpen, [SubmitScript::Transient("503".into())]);
        let leg = executor(b.clone()).execute_single_leg(&order()).await.unwrap();
        assert!(leg.is_fully_filled());
        assert_eq!(leg.submissions, 2);
        assert_eq!(b.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn ambiguous_submission_that_landed_is_not_duplicated() {
        let b = Arc::new(MemoryBroker::new());
        b.script(OrderSide::SellToOpen, [SubmitScript::Ambiguous { lands: true }]);
        let leg = executor(b.clone()).execute_single_leg(&order()).await.unwrap();
        assert!(leg.is_fully_filled());
        assert_eq!(b.submit_calls(), 1);
        assert_eq!(b.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn hung_call_times_out_and_is_treated_as_ambiguous() {
        let b = Arc::new(MemoryBroker::new());
        b.script(OrderSide::SellToOpen, [SubmitScript::Hang(Duration::from_secs(5))]);
        let leg = executor(b.clone()).execute_single_leg(&order()).await.unwrap();
        assert!(leg.is_fully_filled());
        assert_eq!(b.submit_calls(), 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let b = Arc::new(MemoryBroker::new());
        b.script(
            OrderSide::SellToOpen,
            (0..3).map(|_| SubmitScript::Ambiguous { lands: false }),
        );
        let err = executor(b.clone()).execute_single_leg(&order()).await.unwrap_err();
        assert!(matches!(err, StrategyError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(b.submit_calls(), 3);
        assert!(b.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let b = Arc::new(MemoryBroker::new());
        b.script(OrderSide::SellToOpen, [SubmitScript::Reject("insufficient buying power".into())]);
        let err = executor(b.clone()).execute_single_leg(&order()).await.unwrap_err();
        assert!(matches!(err, StrategyError::OrderRejected { .. }));
        assert_eq!(b.submit_calls(), 1);
    }

    #[tokio::test]
    async fn halt_is_honoured_before_submission() {
        let b = Arc::new(MemoryBroker::new());
        let ex = executor(b.clone());
        ex.halt_handle().store(true, Ordering::SeqCst);
        assert!(matches!(
            ex.execute_single_leg(&order()).await.unwrap_err(),
            StrategyError::Halted
        ));
        let tx = ex.execute_roll(&opportunity()).await.unwrap();
        assert_eq!(tx.state, RollState::Aborted);
        assert_eq!(b.submit_calls(), 0);
    }

    #[tokio::test]
    async fn working_order_is_polled_to_fill() {
        let b = Arc::new(MemoryBroker::new());
        b.script(OrderSide::SellToOpen, [SubmitScript::Work { fills_after: Some(2) }]);
        let leg = executor(b).execute_single_leg(&order()).await.unwrap();
        assert_eq!(leg.result.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn roll_happy_path_walks_every_state() {
        let b = Arc::new(MemoryBroker::new());
        let tx = executor(b.clone()).execute_roll(&opportunity()).await.unwrap();
        assert_eq!(tx.state, RollState::OpenConfirmed);
        assert_eq!(
            tx.history,
            vec![
                RollState::Planned,
                RollState::ClosePending,
                RollState::ClosedConfirmed,
                RollState::OpenPending,
                RollState::OpenConfirmed
            ]
        );
        let placed = b.placed_orders();
        assert_eq!(placed[0].side, OrderSide::BuyToClose);
        assert_eq!(placed[1].side, OrderSide::SellToOpen);
        assert!((tx.realized_net_credit() - 30.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn close_failure_aborts_without_open() {
        let b = Arc::new(MemoryBroker::new());
        b.script(
            OrderSide::BuyToClose,
            (0..3).map(|_| SubmitScript::Transient("reset".into())),
        );
        let tx = executor(b.clone()).execute_roll(&opportunity()).await.unwrap();
        assert_eq!(tx.state, RollState::Aborted);
        assert!(b.placed_on(OrderSide::SellToOpen).is_empty());
        assert_eq!(tx.realized_net_credit(), 0.0);
    }

    #[tokio::test]
    async fn open_failure_is_partial() {
        let b = Arc::new(MemoryBroker::new());
        b.script(OrderSide::SellToOpen, [SubmitScript::Reject("invalid strike".into())]);
        let tx = executor(b.clone()).execute_roll(&opportunity()).await.unwrap();
        assert_eq!(tx.state, RollState::PartialFailure);
        assert!(tx.close.as_ref().unwrap().is_fully_filled());
        assert_eq!(tx.uncovered_contracts(), 2);
        assert!(tx.realized_net_credit() < 0.0);
        assert!(tx.failure.as_deref().unwrap().contains("uncovered"));
    }

    #[tokio::test]
    async fn close_left_working_is_canceled_and_aborts() {
        let b = Arc::new(MemoryBroker::new());
        b.script(OrderSide::BuyToClose, [SubmitScript::Work { fills_after: None }]);
        let tx = executor(b.clone()).execute_roll(&opportunity()).await.unwrap();
        assert_eq!(tx.state, RollState::Aborted);
        assert_eq!(tx.close.unwrap().result.status, OrderStatus::Canceled);
        assert!(b.placed_on(OrderSide::SellToOpen).is_empty());
    }

    #[tokio::test]
    async fn close_still_working_after_failed_cancel_is_unresolved() {
        let b = Arc::new(MemoryBroker::new());
        b.script(OrderSide::BuyToClose, [SubmitScript::Work { fills_after: None }]);
        b.fail_cancels(BrokerError::Transient("503".into()));
        let tx = executor(b.clone()).execute_roll(&opportunity()).await.unwrap();
        assert_eq!(tx.state, RollState::CloseUnresolved);
        assert_eq!(tx.close.as_ref().unwrap().result.status, OrderStatus::Submitted);
        assert!(tx.failure.as_deref().unwrap().contains("may be live"));
        assert!(b.placed_on(OrderSide::SellToOpen).is_empty());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut tx = RollTransaction::new(opportunity());
        let err = tx.advance(RollState::OpenPending).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(tx.state, RollState::Planned);
        tx.advance(RollState::ClosePending).unwrap();
        assert!(tx.advance(RollState::OpenConfirmed).is_err());
        assert!(!tx.state.is_final());
    }

    #[tokio::test]
    async fn plan_groups_run_independently() {
        use chrono::Utc;
        let b = Arc::new(MemoryBroker::new());
        b.script(
            OrderSide::SellToOpen,
            [SubmitScript::Fill, SubmitScript::Reject("rejected".into())],
        );
        let group = |day, strike, contracts| TierGroup {
            expiration: d(day),
            strike,
            contracts,
            shares_used: contracts * 100,
            estimated_premium_per_contract: 110.0,
            limit_price: 1.1,
            ceiling_reached: false,
        };
        let plan = StrategyPlan {
            symbol: "AAPL".into(),
            reference_price: 100.0,
            total_shares: 300,
            available_shares: 300,
            groups: vec![group(10, 102.0, 1), group(17, 105.0, 1), group(24, 108.0, 1)],
            total_contracts: 3,
            total_estimated_premium: 330.0,
            original_cost_basis: 90.0,
            cumulative_premium_before: 0.0,
            effective_cost_basis: 88.9,
            cost_basis_reduction_per_share: 1.1,
            cost_basis_reduction_pct: 1.2,
            warnings: vec![],
            planned_at: Utc::now(),
        };
        let out = executor(b.clone()).execute_plan(&plan).await;
        assert!(b.placed_orders().iter().all(|o| o.limit_price == Some(1.1)));
        assert_eq!(out.len(), 3);
        assert!(out[0].error.is_none());
        assert!(out[1].error.is_some());
        assert_eq!(out[2].contracts_filled(), 1);
        let total: f64 = out.iter().map(GroupExecution::premium_realized).sum();
        assert!((total - 220.0).abs() < 1e-6);
    }
}
