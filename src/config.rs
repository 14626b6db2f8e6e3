//! Load and validate runtime configuration.
//!
//! Strategy and execution parameters are plain values handed to each planner/engine call.

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::error::StrategyError;
use crate::types::TimeInForce;
use crate::utils::tif_from_str;

#[derive(Debug, Deserialize, Clone)]
pub struct WebullCfg {
    pub region: Option<i32>, // e.g., 6 for US
    #[serde(default = "default_mode")]
    pub mode: String, // "paper" or "live"
}

impl Default for WebullCfg {
    fn default() -> Self {
        Self {
            region: None,
            mode: default_mode(),
        }
    }
}

/// Tiered strategy and roll parameters.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StrategyParams {
    pub min_shares_required: u32,
    pub min_days_to_expiration: i64,
    pub max_days_to_expiration: i64,
    /// Expirations to tier across (1..=3).
    pub target_expirations: usize,
    /// Filtered expirations probed for liquidity before giving up.
    pub expiration_lookahead: usize,
    /// Parallel chain fetches while probing.
    pub chain_concurrency: usize,
    pub max_contracts_per_expiration: u32,
    /// Per-share net credit floor for a roll.
    pub min_roll_credit: f64,
    pub max_roll_days_out: i64,
    /// Only count calls with numeric bid and ask as tradable.
    pub require_quotes: bool,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            min_shares_required: 300,
            min_days_to_expiration: 7,
            max_days_to_expiration: 60,
            target_expirations: 3,
            expiration_lookahead: 5,
            chain_concurrency: 3,
            max_contracts_per_expiration: 10,
            min_roll_credit: 0.10,
            max_roll_days_out: 45,
            require_quotes: true,
        }
    }
}

/// Order submission, retry and fill-monitoring parameters.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExecParams {
    pub dry_run: bool,
    pub tif: String, // "DAY" or "GTC"
    /// Submission attempts per leg, first try included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_sec: u64,
    pub fill_timeout_sec: u64,
    pub poll_interval_ms: u64,
}

impl Default for ExecParams {
    fn default() -> Self {
        Self {
            dry_run: false,
            tif: "DAY".to_string(),
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 8000,
            call_timeout_sec: 10,
            fill_timeout_sec: 60,
            poll_interval_ms: 800,
        }
    }
}

impl ExecParams {
    pub fn time_in_force(&self) -> TimeInForce {
        tif_from_str(&self.tif)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_sec)
    }

    pub fn fill_timeout(&self) -> Duration {
        Duration::from_secs(self.fill_timeout_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerCfg {
    #[serde(default = "default_ledger_path")]
    pub path: String,
}

impl Default for LedgerCfg {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub webull: WebullCfg,
    #[serde(default)]
    pub strategy: StrategyParams,
    #[serde(default)]
    pub exec: ExecParams,
    #[serde(default)]
    pub ledger: LedgerCfg,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_yaml(&s)
    }

    pub fn from_yaml(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        let s = &self.strategy;
        if s.min_days_to_expiration < 0 || s.min_days_to_expiration > s.max_days_to_expiration {
            return Err(StrategyError::Config(format!(
                "expiration window [{}, {}] is empty",
                s.min_days_to_expiration, s.max_days_to_expiration
            )));
        }
        if !(1..=3).contains(&s.target_expirations) {
            return Err(StrategyError::Config(format!(
                "target_expirations must be 1..=3, got {}",
                s.target_expirations
            )));
        }
        if s.expiration_lookahead < s.target_expirations {
            return Err(StrategyError::Config(
                "expiration_lookahead must be at least target_expirations".into(),
            ));
        }
        if s.chain_concurrency == 0 || s.max_contracts_per_expiration == 0 {
            return Err(StrategyError::Config(
                "chain_concurrency and max_contracts_per_expiration must be positive".into(),
            ));
        }
        if !(s.min_roll_credit >= 0.0) {
            return Err(StrategyError::Config("min_roll_credit must be >= 0".into()));
        }
        if s.max_roll_days_out < 1 {
            return Err(StrategyError::Config("max_roll_days_out must be >= 1".into()));
        }
        let e = &self.exec;
        if e.max_attempts == 0 || e.call_timeout_sec == 0 {
            return Err(StrategyError::Config(
                "max_attempts and call_timeout_sec must be positive".into(),
            ));
        }
        if e.initial_backoff_ms > e.max_backoff_ms {
            return Err(StrategyError::Config(
                "initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

fn default_mode() -> String {
    "paper".to_string()
}

fn default_ledger_path() -> String {
    "data/cost_basis.jsonl".to_string()
}
