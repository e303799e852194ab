//! Bounded-concurrency task scheduler wired to the shared rate-limit
//! governor. Tasks are suspendable I/O-bound futures; the semaphore
//! caps how many are in flight at once.

use crate::error::RunError;
use crate::ratelimit::{GovernorStatus, RateLimitGovernor};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Introspection snapshot: the concurrency ceiling plus the governor's
/// current backoff state.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub max_parallel: usize,
    pub backoff_active: bool,
    pub backoff_remaining: Duration,
    pub consecutive_failures: u32,
}

/// Progress callback invoked as each task finishes, in completion
/// order. The result collection itself preserves submission order.
pub type ProgressFn<'a, T> = &'a (dyn Fn(&str, &Result<T, RunError>) + Sync);

pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    governor: Arc<RateLimitGovernor>,
    max_parallel: usize,
}

impl TaskScheduler {
    pub fn new(max_parallel: usize, governor: Arc<RateLimitGovernor>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            governor,
            max_parallel,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    /// Run one task under the concurrency bound: acquire a slot, wait
    /// out any shared cooldown, run, then feed the outcome back into
    /// the governor. The slot is an owned permit, so it is released on
    /// every exit path, panics included.
    pub async fn execute_one<T, Fut>(&self, task: Fut) -> Result<T, RunError>
    where
        Fut: Future<Output = Result<T, RunError>>,
    {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RunError::fatal("scheduler_semaphore_closed"))?;
        self.governor.check_rate_limit().await;
        let result = task.await;
        match &result {
            Ok(_) => self.governor.record_success().await,
            Err(RunError::RateLimited { retry_after }) => {
                self.governor.record_rate_limited(*retry_after).await;
            }
            Err(_) => {}
        }
        result
    }

    /// Dispatch a whole task list with bounded concurrency. Each task
    /// is `(task_id, factory)`; the factory is called when the task is
    /// dispatched, not when the list is built. Returned results are in
    /// submission order regardless of completion order.
    pub async fn execute_batch<T, F, Fut>(
        &self,
        tasks: Vec<(String, F)>,
        on_progress: Option<ProgressFn<'_, T>>,
    ) -> Vec<(String, Result<T, RunError>)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RunError>>,
    {
        let futures = tasks.into_iter().map(|(task_id, factory)| async move {
            let result = self.execute_one(factory()).await;
            if let Some(progress) = on_progress {
                progress(&task_id, &result);
            }
            (task_id, result)
        });
        join_all(futures).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        let GovernorStatus {
            backoff_active,
            backoff_remaining,
            consecutive_failures,
        } = self.governor.status().await;
        SchedulerStatus {
            max_parallel: self.max_parallel,
            backoff_active,
            backoff_remaining,
            consecutive_failures,
        }
    }
}
