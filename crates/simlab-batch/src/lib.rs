//! simlab-batch: the batch experiment orchestrator.
//!
//! Runs many independent, expensive, failure-prone scenario executions
//! against a shared external API under a global cost budget, a shared
//! rate limit, and bounded concurrency, while staying resumable after
//! interruption.
//!
//! # Core pieces
//!
//! - [`variations`]: deterministic Cartesian sweep of parameter
//!   combinations.
//! - [`ledger`]: spend tracking and budget admission control.
//! - [`ratelimit`]: one shared backoff state per batch.
//! - [`scheduler`]: semaphore-bounded task dispatch wired to the
//!   governor.
//! - [`executor`]: the opaque scenario-execution seam.
//! - [`checkpoint`]: durable progress for resume.
//! - [`orchestrator`]: the top-level batch state machine.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod ratelimit;
pub mod scheduler;
pub mod variations;

pub use checkpoint::{BatchCheckpoint, FailedRun};
pub use config::{DimensionKind, ExperimentConfig, VariationDimension};
pub use error::{RunError, Severity};
pub use executor::{ExecutorStatus, HarnessExecutor, RunOutcome, ScenarioExecutor};
pub use ledger::{Admission, CostLedger, LedgerSummary, VariationStats};
pub use orchestrator::{
    run_id, BatchOrchestrator, BatchPlan, BatchState, BatchSummary, RunProgress, RunStatus,
    RunTask,
};
pub use ratelimit::{GovernorStatus, RateLimitGovernor};
pub use scheduler::{SchedulerStatus, TaskScheduler};
pub use variations::Variation;
