// src/pipeline/budget.rs
//! Budget ledger: per-provider and aggregate request counters against daily
//! ceilings, with a reservation-then-commit/release protocol so failed calls
//! never consume budget.
//!
//! Invariant: reserved + consumed never exceeds the ceiling, per provider and
//! in aggregate, at any observation point. The window resets after 24 hours.
//! Consumed counts survive restarts via a JSON file (atomic tmp+rename).

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

const WINDOW_SECS: u64 = 24 * 3600;

#[derive(Debug, Clone, Copy)]
pub struct BudgetCeilings {
    /// Per-provider daily request ceiling. 0 = unlimited.
    pub per_provider: u64,
    /// Aggregate daily ceiling across all providers. 0 = unlimited.
    pub aggregate: u64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ProviderUsage {
    consumed: u64,
    #[serde(skip)]
    reserved: u64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct LedgerState {
    window_started_at: u64,
    providers: HashMap<String, ProviderUsage>,
}

impl LedgerState {
    fn aggregate_held(&self) -> u64 {
        self.providers
            .values()
            .map(|u| u.consumed + u.reserved)
            .sum()
    }
}

pub struct BudgetLedger {
    ceilings: BudgetCeilings,
    state: Mutex<LedgerState>,
    /// When set, consumed counters are persisted here.
    path: Option<PathBuf>,
}

impl BudgetLedger {
    pub fn new(ceilings: BudgetCeilings) -> Self {
        Self {
            ceilings,
            state: Mutex::new(LedgerState::default()),
            path: None,
        }
    }

    /// Ledger backed by a JSON file so consumed counts survive restarts.
    pub fn with_persistence(ceilings: BudgetCeilings, path: PathBuf) -> Self {
        let state = load_state(&path).unwrap_or_default();
        Self {
            ceilings,
            state: Mutex::new(state),
            path: Some(path),
        }
    }

    /// Ask for `n` requests against `provider`. Refused (false) when the
    /// grant would push the provider or the aggregate over its ceiling.
    /// Refusal is an expected condition, not an error.
    pub fn reserve(&self, provider: &str, n: u64) -> bool {
        let now = now_unix();
        let mut g = self.lock();
        roll_window_if_expired(&mut g, now);

        let aggregate_held = g.aggregate_held();
        let usage = g.providers.entry(provider.to_string()).or_default();

        let provider_ok =
            self.ceilings.per_provider == 0 || usage.consumed + usage.reserved + n <= self.ceilings.per_provider;
        let aggregate_ok =
            self.ceilings.aggregate == 0 || aggregate_held + n <= self.ceilings.aggregate;

        if !(provider_ok && aggregate_ok) {
            tracing::info!(provider, requested = n, "budget reservation denied");
            return false;
        }
        usage.reserved += n;
        true
    }

    /// Convert a reservation into consumed budget after a successful call.
    pub fn commit(&self, provider: &str, n: u64) {
        let mut g = self.lock();
        if let Some(usage) = g.providers.get_mut(provider) {
            let n = n.min(usage.reserved);
            usage.reserved -= n;
            usage.consumed += n;
        }
        self.persist(&g);
    }

    /// Return a reservation unused after a failed call.
    pub fn release(&self, provider: &str, n: u64) {
        let mut g = self.lock();
        if let Some(usage) = g.providers.get_mut(provider) {
            usage.reserved = usage.reserved.saturating_sub(n);
        }
    }

    pub fn consumed(&self, provider: &str) -> u64 {
        let g = self.lock();
        g.providers.get(provider).map(|u| u.consumed).unwrap_or(0)
    }

    pub fn total_consumed(&self) -> u64 {
        let g = self.lock();
        g.providers.values().map(|u| u.consumed).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().expect("budget ledger mutex poisoned")
    }

    fn persist(&self, state: &LedgerState) {
        if let Some(path) = &self.path {
            if let Err(e) = save_state(path, state) {
                tracing::warn!(error = ?e, "failed to persist budget ledger");
            }
        }
    }
}

fn roll_window_if_expired(state: &mut LedgerState, now: u64) {
    if state.window_started_at == 0 {
        state.window_started_at = now;
        return;
    }
    if now.saturating_sub(state.window_started_at) >= WINDOW_SECS {
        state.window_started_at = now;
        // Consumed counts reset; in-flight reservations are kept so the
        // invariant holds for calls already issued.
        for usage in state.providers.values_mut() {
            usage.consumed = 0;
        }
    }
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn load_state(path: &Path) -> Option<LedgerState> {
    let s = fs::read_to_string(path).ok()?;
    serde_json::from_str(&s).ok()
}

fn save_state(path: &Path, state: &LedgerState) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string(state).unwrap_or_else(|_| "{}".to_string());
    let mut f = fs::File::create(&tmp)?;
    f.write_all(json.as_bytes())?;
    fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceilings(per_provider: u64, aggregate: u64) -> BudgetCeilings {
        BudgetCeilings {
            per_provider,
            aggregate,
        }
    }

    #[test]
    fn denies_when_provider_ceiling_would_be_exceeded() {
        let ledger = BudgetLedger::new(ceilings(5, 0));
        assert!(ledger.reserve("wire", 5));
        assert!(!ledger.reserve("wire", 1));
        ledger.commit("wire", 5);
        assert_eq!(ledger.consumed("wire"), 5);
        assert!(!ledger.reserve("wire", 1));
    }

    #[test]
    fn aggregate_ceiling_spans_providers() {
        let ledger = BudgetLedger::new(ceilings(0, 6));
        assert!(ledger.reserve("a", 4));
        assert!(!ledger.reserve("b", 3));
        assert!(ledger.reserve("b", 2));
    }

    #[test]
    fn release_returns_capacity() {
        let ledger = BudgetLedger::new(ceilings(3, 0));
        assert!(ledger.reserve("wire", 3));
        ledger.release("wire", 3);
        assert!(ledger.reserve("wire", 3));
        ledger.commit("wire", 3);
        assert_eq!(ledger.consumed("wire"), 3);
    }

    #[test]
    fn commit_never_exceeds_reservation() {
        let ledger = BudgetLedger::new(ceilings(10, 0));
        assert!(ledger.reserve("wire", 2));
        ledger.commit("wire", 5); // clamped to what was reserved
        assert_eq!(ledger.consumed("wire"), 2);
    }

    #[test]
    fn unlimited_ceilings_always_grant() {
        let ledger = BudgetLedger::new(ceilings(0, 0));
        assert!(ledger.reserve("wire", 1_000_000));
    }
}
