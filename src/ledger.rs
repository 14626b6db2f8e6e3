//! Cost basis ledger: append-only JSON lines, one strategy impact per line.
//!
//! Each line carries the symbol's basis seed, so replaying the file from the top rebuilds every
//! record. A line is durable on disk before the in-memory state reflects it.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, StrategyError};
use crate::types::{BasisSeed, CostBasisRecord, ExecutionKind, StrategyImpact};
use crate::utils::sanitize_symbol;

/// A confirmed execution to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewImpact {
    pub execution_id: String,
    pub kind: ExecutionKind,
    /// Dollars received, never negative.
    pub premium_collected: f64,
    pub shares_affected: u32,
    pub contracts: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerLine {
    symbol: String,
    original_cost_basis: f64,
    total_shares: u32,
    impact: StrategyImpact,
}

#[derive(Debug, Clone)]
struct SymbolBasis {
    original_cost_basis: f64,
    total_shares: u32,
    entries: Vec<StrategyImpact>,
}

impl SymbolBasis {
    fn cumulative_premium(&self) -> f64 {
        self.entries.iter().map(|e| e.premium_collected).sum()
    }

    fn record(&self, symbol: &str) -> CostBasisRecord {
        let cumulative = self.cumulative_premium();
        let effective = effective_cost_basis(self.original_cost_basis, cumulative, self.total_shares);
        let reduction = self.original_cost_basis - effective;
        CostBasisRecord {
            symbol: symbol.to_string(),
            original_cost_basis: self.original_cost_basis,
            total_shares: self.total_shares,
            total_original_cost: self.original_cost_basis * f64::from(self.total_shares),
            cumulative_premium: cumulative,
            effective_cost_basis: effective,
            reduction_per_share: reduction,
            reduction_pct: reduction_pct(reduction, self.original_cost_basis),
            entries: self.entries.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    records: BTreeMap<String, SymbolBasis>,
    next_sequence: u64,
}

impl LedgerState {
    fn apply(&mut self, line: LedgerLine) {
        self.next_sequence = self.next_sequence.max(line.impact.sequence + 1);
        let rec = self
            .records
            .entry(line.symbol)
            .or_insert_with(|| SymbolBasis {
                original_cost_basis: line.original_cost_basis,
                total_shares: line.total_shares,
                entries: Vec::new(),
            });
        if line.total_shares > 0 {
            rec.total_shares = line.total_shares;
        }
        rec.entries.push(line.impact);
    }
}

/// Single-writer cost basis ledger. Appends are serialized by one lock.
#[derive(Debug)]
pub struct CostBasisLedger {
    path: Option<PathBuf>,
    state: Mutex<LedgerState>,
}

impl CostBasisLedger {
    /// Open (or create) the ledger file and replay it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| StrategyError::LedgerIo {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut state = LedgerState::default();
        if path.exists() {
            let mut text = fs::read_to_string(&path).map_err(io_err)?;
            // An interrupted append leaves a last line without its newline.
            let keep = if text.ends_with('\n') {
                text.len()
            } else {
                text.rfind('\n').map_or(0, |i| i + 1)
            };
            let torn = text.len() - keep;
            text.truncate(keep);
            for (i, raw) in text.lines().enumerate() {
                if raw.trim().is_empty() {
                    continue;
                }
                let line: LedgerLine =
                    serde_json::from_str(raw).map_err(|e| StrategyError::LedgerCorrupt {
                        line: i + 1,
                        detail: e.to_string(),
                    })?;
                state.apply(line);
            }
            if torn > 0 {
                warn!(
                    "Cost basis ledger {}: discarding {} bytes of an unfinished last line",
                    path.display(),
                    torn
                );
                let f = OpenOptions::new().write(true).open(&path).map_err(io_err)?;
                f.set_len(keep as u64).map_err(io_err)?;
                f.sync_data().map_err(io_err)?;
            }
        }
        info!(
            "Cost basis ledger {} loaded: {} symbols, {} entries",
            path.display(),
            state.records.len(),
            state.next_sequence
        );
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// A ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Append one impact entry and return the updated record.
    ///
    /// `seed` opens the record the first time a symbol is seen; afterwards only its share count is
    /// taken, the original cost basis stays fixed.
    pub async fn record_impact(
        &self,
        symbol: &str,
        seed: BasisSeed,
        impact: NewImpact,
    ) -> Result<CostBasisRecord> {
        let symbol = sanitize_symbol(symbol);
        if !(impact.premium_collected.is_finite() && impact.premium_collected >= 0.0) {
            return Err(StrategyError::InvalidImpact {
                symbol,
                detail: format!("premium {} must be a non-negative amount", impact.premium_collected),
            });
        }

        let mut st = self.state.lock().await;
        let existing = st.records.get(&symbol);
        if existing.is_none()
            && !(seed.original_cost_basis.is_finite()
                && seed.original_cost_basis > 0.0
                && seed.total_shares > 0)
        {
            return Err(StrategyError::InvalidImpact {
                symbol,
                detail: format!(
                    "cannot open a record with cost basis {} over {} shares",
                    seed.original_cost_basis, seed.total_shares
                ),
            });
        }
        let original_cost_basis = existing.map_or(seed.original_cost_basis, |r| r.original_cost_basis);

        let line = LedgerLine {
            symbol: symbol.clone(),
            original_cost_basis,
            total_shares: seed.total_shares,
            impact: StrategyImpact {
                sequence: st.next_sequence,
                execution_id: impact.execution_id,
                kind: impact.kind,
                premium_collected: impact.premium_collected,
                shares_affected: impact.shares_affected,
                contracts: impact.contracts,
                recorded_at: Utc::now(),
            },
        };
        if let Some(path) = &self.path {
            append_line(path, &line)?;
        }
        info!(
            "Ledger {}: +{:.2} premium ({:?}, {} contracts, exec {})",
            symbol,
            line.impact.premium_collected,
            line.impact.kind,
            line.impact.contracts,
            line.impact.execution_id
        );
        st.apply(line);

        st.records
            .get(&symbol)
            .map(|r| r.record(&symbol))
            .ok_or(StrategyError::NoCostBasisRecord { symbol })
    }

    pub async fn summarize(&self, symbol: &str) -> Result<CostBasisRecord> {
        let symbol = sanitize_symbol(symbol);
        self.lookup(&symbol)
            .await
            .ok_or(StrategyError::NoCostBasisRecord { symbol })
    }

    pub async fn lookup(&self, symbol: &str) -> Option<CostBasisRecord> {
        let symbol = sanitize_symbol(symbol);
        let st = self.state.lock().await;
        st.records.get(&symbol).map(|r| r.record(&symbol))
    }

    /// Every impact entry for `symbol`, in append order.
    pub async fn history(&self, symbol: &str) -> Vec<StrategyImpact> {
        let symbol = sanitize_symbol(symbol);
        let st = self.state.lock().await;
        st.records
            .get(&symbol)
            .map(|r| r.entries.clone())
            .unwrap_or_default()
    }
}

fn append_line(path: &Path, line: &LedgerLine) -> Result<()> {
    let io_err = |source| StrategyError::LedgerIo {
        path: path.display().to_string(),
        source,
    };
    let mut json = serde_json::to_string(line).map_err(|e| StrategyError::LedgerIo {
        path: path.display().to_string(),
        source: e.into(),
    })?;
    json.push('\n');
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    f.write_all(json.as_bytes()).map_err(io_err)?;
    f.sync_data().map_err(io_err)
}

/// `original - cumulative_premium / shares`. Not clamped; a basis below zero is reported as is.
pub fn effective_cost_basis(original: f64, cumulative_premium: f64, total_shares: u32) -> f64 {
    if total_shares == 0 {
        return original;
    }
    original - cumulative_premium / f64::from(total_shares)
}

pub fn reduction_pct(reduction_per_share: f64, original: f64) -> f64 {
    if original > 0.0 {
        reduction_per_share / original * 100.0
    } else {
        0.0
    }
}
