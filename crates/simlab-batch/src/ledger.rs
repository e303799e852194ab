//! Cost ledger: spend tracking, budget / per-run ceiling admission
//! control, and the durable ledger file that partners the batch
//! checkpoint.
//!
//! The struct itself is synchronous. Concurrent workers share it as
//! `Arc<tokio::sync::Mutex<CostLedger>>` and hold the lock across each
//! check-then-record sequence; cooperative suspension alone does not
//! make the two-step sequence atomic.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Advisory admission decision. Never an error: a denial is a normal
/// pause signal, not an exception.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Admission {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Result of checking one run's realized cost against the per-run
/// ceiling. The caller decides whether an over-limit run still counts
/// as a degraded success.
#[derive(Debug, Clone, PartialEq)]
pub struct CostCheck {
    pub within_limit: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCostRecord {
    pub run_id: String,
    pub variation_id: u32,
    pub cost: f64,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VariationStats {
    pub runs: u32,
    pub successes: u32,
    pub total_cost: f64,
}

impl VariationStats {
    pub fn average_cost(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.total_cost / self.runs as f64
        }
    }
}

/// Summary block embedded in the ledger file and the batch summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerSummary {
    pub total_spent: f64,
    pub budget_limit: Option<f64>,
    pub cost_per_run_limit: Option<f64>,
    pub completed_runs: u32,
    pub failed_runs: u32,
    pub cost_limit_exceeded_runs: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// On-disk shape of the ledger file.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    summary: LedgerSummary,
    run_costs: Vec<RunCostRecord>,
    variation_statistics: BTreeMap<u32, VariationStats>,
}

#[derive(Debug)]
pub struct CostLedger {
    total_spent: f64,
    budget_limit: Option<f64>,
    cost_per_run_limit: Option<f64>,
    run_costs: Vec<RunCostRecord>,
    recorded_ids: BTreeSet<String>,
    variation_stats: BTreeMap<u32, VariationStats>,
    completed_runs: u32,
    failed_runs: u32,
    cost_limit_exceeded_runs: u32,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl CostLedger {
    /// Fresh ledger for a new batch. Limits stay fixed for the life of
    /// the batch; only `rebase_limits` (resume) replaces them.
    pub fn new(budget_limit: Option<f64>, cost_per_run_limit: Option<f64>) -> Self {
        Self {
            total_spent: 0.0,
            budget_limit,
            cost_per_run_limit,
            run_costs: Vec::new(),
            recorded_ids: BTreeSet::new(),
            variation_stats: BTreeMap::new(),
            completed_runs: 0,
            failed_runs: 0,
            cost_limit_exceeded_runs: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Admission decision for starting one more run. Evaluated
    /// immediately before dispatch, never at list-build time.
    pub fn can_start_run(&self) -> Admission {
        if let Some(budget) = self.budget_limit {
            if self.total_spent >= budget {
                return Admission::deny(format!(
                    "budget limit reached: spent {:.2} of {:.2}",
                    self.total_spent, budget
                ));
            }
            if let Some(per_run) = self.cost_per_run_limit {
                if budget - self.total_spent < per_run {
                    return Admission::deny(format!(
                        "insufficient remaining budget for per-run limit: {:.2} remaining, {:.2} required",
                        budget - self.total_spent,
                        per_run
                    ));
                }
            }
        }
        Admission::allow()
    }

    /// Check one run's realized cost against the per-run ceiling.
    pub fn check_run_cost(&mut self, cost: f64) -> CostCheck {
        if let Some(limit) = self.cost_per_run_limit {
            if cost > limit {
                self.cost_limit_exceeded_runs += 1;
                return CostCheck {
                    within_limit: false,
                    reason: Some(format!(
                        "run cost {:.2} exceeded per-run limit {:.2}",
                        cost, limit
                    )),
                };
            }
        }
        CostCheck {
            within_limit: true,
            reason: None,
        }
    }

    /// Record one run's cost and outcome. A repeated record for the
    /// same id supersedes the prior one: a resumed batch re-executes
    /// runs that failed before the checkpoint, and the retry's real
    /// cost must reach `total_spent`. Recording identical values twice
    /// is therefore still a no-op in effect.
    pub fn record_run_cost(&mut self, run_id: &str, variation_id: u32, cost: f64, success: bool) {
        if !self.recorded_ids.insert(run_id.to_string()) {
            self.remove_record(run_id);
        }
        self.total_spent += cost;
        self.run_costs.push(RunCostRecord {
            run_id: run_id.to_string(),
            variation_id,
            cost,
            success,
            recorded_at: Utc::now(),
        });
        let stats = self.variation_stats.entry(variation_id).or_default();
        stats.runs += 1;
        stats.total_cost += cost;
        if success {
            stats.successes += 1;
            self.completed_runs += 1;
        } else {
            self.failed_runs += 1;
        }
    }

    /// Back out one prior record's contribution to the totals.
    fn remove_record(&mut self, run_id: &str) {
        let Some(pos) = self.run_costs.iter().position(|r| r.run_id == run_id) else {
            return;
        };
        let prior = self.run_costs.remove(pos);
        self.total_spent -= prior.cost;
        if prior.success {
            self.completed_runs -= 1;
        } else {
            self.failed_runs -= 1;
        }
        if let Some(stats) = self.variation_stats.get_mut(&prior.variation_id) {
            stats.runs -= 1;
            stats.total_cost -= prior.cost;
            if prior.success {
                stats.successes -= 1;
            }
        }
    }

    pub fn total_spent(&self) -> f64 {
        self.total_spent
    }

    /// Resume-construction only: a resumed batch keeps the recorded
    /// spend history but takes its limits from the current
    /// configuration. Within a batch the limits never change.
    pub fn rebase_limits(&mut self, budget_limit: Option<f64>, cost_per_run_limit: Option<f64>) {
        self.budget_limit = budget_limit;
        self.cost_per_run_limit = cost_per_run_limit;
    }

    pub fn remaining_budget(&self) -> Option<f64> {
        self.budget_limit.map(|b| b - self.total_spent)
    }

    /// Rough forecast of how many more runs the remaining budget
    /// covers: per-run limit first, then the observed average once at
    /// least one run is recorded.
    pub fn estimate_runs_remaining(&self) -> Option<u64> {
        let remaining = self.remaining_budget()?;
        if remaining <= 0.0 {
            return Some(0);
        }
        if let Some(per_run) = self.cost_per_run_limit {
            return Some((remaining / per_run) as u64);
        }
        if self.run_costs.is_empty() {
            return None;
        }
        let average = self.total_spent / self.run_costs.len() as f64;
        if average <= 0.0 {
            return None;
        }
        Some((remaining / average) as u64)
    }

    pub fn variation_statistics(&self) -> &BTreeMap<u32, VariationStats> {
        &self.variation_stats
    }

    pub fn mark_ended(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            total_spent: self.total_spent,
            budget_limit: self.budget_limit,
            cost_per_run_limit: self.cost_per_run_limit,
            completed_runs: self.completed_runs,
            failed_runs: self.failed_runs,
            cost_limit_exceeded_runs: self.cost_limit_exceeded_runs,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    /// Persist the full durable round-trip: summary, run-cost history,
    /// and per-variation aggregates.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = LedgerFile {
            summary: self.summary(),
            run_costs: self.run_costs.clone(),
            variation_statistics: self.variation_stats.clone(),
        };
        let value = serde_json::to_value(&file)?;
        simlab_core::atomic_write_json_pretty(path, &value)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let value = simlab_core::load_json_file(path)?;
        let file: LedgerFile = serde_json::from_value(value)
            .map_err(|e| anyhow!("ledger_parse_failed: {}: {}", path.display(), e))?;
        let recorded_ids = file.run_costs.iter().map(|r| r.run_id.clone()).collect();
        Ok(Self {
            total_spent: file.summary.total_spent,
            budget_limit: file.summary.budget_limit,
            cost_per_run_limit: file.summary.cost_per_run_limit,
            run_costs: file.run_costs,
            recorded_ids,
            variation_stats: file.variation_statistics,
            completed_runs: file.summary.completed_runs,
            failed_runs: file.summary.failed_runs,
            cost_limit_exceeded_runs: file.summary.cost_limit_exceeded_runs,
            started_at: file.summary.started_at,
            ended_at: file.summary.ended_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "simlab_ledger_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn admission_allows_without_limits() {
        let ledger = CostLedger::new(None, None);
        assert!(ledger.can_start_run().allowed);
        assert_eq!(ledger.remaining_budget(), None);
    }

    #[test]
    fn admission_denies_when_budget_exhausted_and_stays_denied() {
        let mut ledger = CostLedger::new(Some(1.0), None);
        ledger.record_run_cost("var-001-run-001", 1, 0.6, true);
        assert!(ledger.can_start_run().allowed);
        ledger.record_run_cost("var-001-run-002", 1, 0.6, true);
        let admission = ledger.can_start_run();
        assert!(!admission.allowed);
        assert!(
            admission.reason.as_deref().unwrap().contains("budget limit reached"),
            "{:?}",
            admission.reason
        );
        // Monotonic: spend never decreases, so the denial is permanent.
        ledger.record_run_cost("var-001-run-003", 1, 0.1, true);
        assert!(!ledger.can_start_run().allowed);
    }

    #[test]
    fn admission_denies_when_headroom_below_per_run_limit() {
        let mut ledger = CostLedger::new(Some(2.0), Some(1.0));
        ledger.record_run_cost("var-001-run-001", 1, 1.5, true);
        let admission = ledger.can_start_run();
        assert!(!admission.allowed);
        assert!(
            admission
                .reason
                .as_deref()
                .unwrap()
                .contains("insufficient remaining budget"),
            "{:?}",
            admission.reason
        );
    }

    #[test]
    fn check_run_cost_flags_and_counts_over_limit_runs() {
        let mut ledger = CostLedger::new(None, Some(0.5));
        let check = ledger.check_run_cost(0.4);
        assert!(check.within_limit);
        let check = ledger.check_run_cost(0.9);
        assert!(!check.within_limit);
        assert_eq!(ledger.summary().cost_limit_exceeded_runs, 1);
    }

    #[test]
    fn identical_repeat_record_changes_nothing() {
        let mut ledger = CostLedger::new(None, None);
        ledger.record_run_cost("var-001-run-001", 1, 0.3, true);
        ledger.record_run_cost("var-001-run-001", 1, 0.3, true);
        assert!((ledger.total_spent() - 0.3).abs() < f64::EPSILON);
        assert_eq!(ledger.summary().completed_runs, 1);
        assert_eq!(ledger.variation_statistics()[&1].runs, 1);
    }

    #[test]
    fn re_record_supersedes_a_prior_failed_run() {
        // A run that failed (cost 0.0) before a checkpoint is retried
        // after resume; the retry's record replaces the stale one.
        let mut ledger = CostLedger::new(Some(2.0), None);
        ledger.record_run_cost("var-001-run-001", 1, 0.0, false);
        assert_eq!(ledger.summary().failed_runs, 1);

        ledger.record_run_cost("var-001-run-001", 1, 0.5, true);
        assert!((ledger.total_spent() - 0.5).abs() < 1e-9);
        assert_eq!(ledger.summary().completed_runs, 1);
        assert_eq!(ledger.summary().failed_runs, 0);
        let stats = &ledger.variation_statistics()[&1];
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.successes, 1);
        assert!((stats.total_cost - 0.5).abs() < 1e-9);
        // The retry's spend counts against the budget.
        assert_eq!(ledger.remaining_budget(), Some(1.5));
    }

    #[test]
    fn estimate_prefers_per_run_limit_then_average() {
        let mut ledger = CostLedger::new(Some(10.0), Some(2.0));
        assert_eq!(ledger.estimate_runs_remaining(), Some(5));

        let mut ledger = CostLedger::new(Some(10.0), None);
        assert_eq!(ledger.estimate_runs_remaining(), None);
        ledger.record_run_cost("var-001-run-001", 1, 2.0, true);
        assert_eq!(ledger.estimate_runs_remaining(), Some(4));
    }

    #[test]
    fn variation_aggregates_track_runs_and_averages() {
        let mut ledger = CostLedger::new(None, None);
        ledger.record_run_cost("var-001-run-001", 1, 0.4, true);
        ledger.record_run_cost("var-001-run-002", 1, 0.6, false);
        ledger.record_run_cost("var-002-run-001", 2, 1.0, true);
        let stats = ledger.variation_statistics();
        assert_eq!(stats[&1].runs, 2);
        assert_eq!(stats[&1].successes, 1);
        assert!((stats[&1].average_cost() - 0.5).abs() < 1e-9);
        assert_eq!(stats[&2].runs, 1);
    }

    #[test]
    fn ledger_round_trips_through_file() {
        let root = temp_root("roundtrip");
        simlab_core::ensure_dir(&root).expect("root");
        let path = root.join("cost_ledger.json");

        let mut ledger = CostLedger::new(Some(5.0), Some(1.0));
        ledger.record_run_cost("var-001-run-001", 1, 0.7, true);
        ledger.record_run_cost("var-002-run-001", 2, 0.9, false);
        ledger.save(&path).expect("save");

        let restored = CostLedger::load(&path).expect("load");
        assert!((restored.total_spent() - ledger.total_spent()).abs() < 1e-9);
        assert_eq!(restored.summary().completed_runs, 1);
        assert_eq!(restored.summary().failed_runs, 1);
        assert_eq!(restored.variation_statistics(), ledger.variation_statistics());
        // An identical re-record after the round trip changes nothing.
        let mut restored = restored;
        restored.record_run_cost("var-001-run-001", 1, 0.7, true);
        assert!((restored.total_spent() - ledger.total_spent()).abs() < 1e-9);
        let _ = std::fs::remove_dir_all(root);
    }
}
