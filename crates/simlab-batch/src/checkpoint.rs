//! Durable batch progress: the checkpoint file plus its ledger
//! partner. The orchestrator is the only writer; worker tasks never
//! touch these files directly.

use crate::ledger::CostLedger;
use crate::variations::Variation;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LEDGER_FILE: &str = "cost_ledger.json";

/// One failed run as persisted in the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedRun {
    pub run_id: String,
    pub error: String,
    pub status: String,
}

/// The durable resumption contract. Resume recognizes prior completion
/// purely by membership in `completed_runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub experiment_name: String,
    pub completed_runs: BTreeSet<String>,
    pub failed_runs: Vec<FailedRun>,
    pub variations: Vec<Variation>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BatchCheckpoint {
    pub fn new(experiment_name: &str, variations: Vec<Variation>) -> Self {
        Self {
            experiment_name: experiment_name.to_string(),
            completed_runs: BTreeSet::new(),
            failed_runs: Vec::new(),
            variations,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    pub fn ledger_path_in(dir: &Path) -> PathBuf {
        dir.join(LEDGER_FILE)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let value = serde_json::to_value(self)?;
        simlab_core::atomic_write_json_pretty(&Self::path_in(dir), &value)
    }

    fn load_file(dir: &Path) -> Result<Self> {
        let value = simlab_core::load_json_file(&Self::path_in(dir))?;
        serde_json::from_value(value)
            .map_err(|e| anyhow!("checkpoint_parse_failed: {}", e))
    }
}

/// Load checkpoint and ledger for resume. A missing or unreadable
/// file means cold start: log a warning and return `None`, never fail.
pub fn load_for_resume(dir: &Path) -> Option<(BatchCheckpoint, CostLedger)> {
    let checkpoint = match BatchCheckpoint::load_file(dir) {
        Ok(cp) => cp,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "checkpoint unavailable, starting cold");
            return None;
        }
    };
    let ledger = match CostLedger::load(&BatchCheckpoint::ledger_path_in(dir)) {
        Ok(ledger) => ledger,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cost ledger unavailable, starting cold");
            return None;
        }
    };
    Some((checkpoint, ledger))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "simlab_ckpt_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn sample_variations() -> Vec<Variation> {
        vec![Variation {
            id: 1,
            description: "buyer=gpt-4o".to_string(),
            modifications: BTreeMap::from([(
                "actor_model:buyer".to_string(),
                serde_json::json!("gpt-4o"),
            )]),
        }]
    }

    #[test]
    fn checkpoint_and_ledger_round_trip() {
        let root = temp_root("roundtrip");
        simlab_core::ensure_dir(&root).expect("root");

        let mut checkpoint = BatchCheckpoint::new("sweep", sample_variations());
        checkpoint.completed_runs.insert("var-001-run-001".to_string());
        checkpoint.failed_runs.push(FailedRun {
            run_id: "var-001-run-002".to_string(),
            error: "scenario_failed (medium): boom".to_string(),
            status: "failed".to_string(),
        });
        checkpoint.save(&root).expect("save checkpoint");

        let mut ledger = CostLedger::new(Some(2.0), None);
        ledger.record_run_cost("var-001-run-001", 1, 0.5, true);
        ledger
            .save(&BatchCheckpoint::ledger_path_in(&root))
            .expect("save ledger");

        let (restored, restored_ledger) =
            load_for_resume(&root).expect("resume data present");
        assert_eq!(restored.experiment_name, "sweep");
        assert!(restored.completed_runs.contains("var-001-run-001"));
        assert_eq!(restored.failed_runs.len(), 1);
        assert_eq!(restored.variations, sample_variations());
        assert!((restored_ledger.total_spent() - 0.5).abs() < 1e-9);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn missing_checkpoint_means_cold_start() {
        let root = temp_root("missing");
        assert!(load_for_resume(&root).is_none());
    }

    #[test]
    fn corrupt_checkpoint_means_cold_start() {
        let root = temp_root("corrupt");
        simlab_core::ensure_dir(&root).expect("root");
        std::fs::write(BatchCheckpoint::path_in(&root), b"not json").expect("write");
        assert!(load_for_resume(&root).is_none());
        let _ = std::fs::remove_dir_all(root);
    }
}
