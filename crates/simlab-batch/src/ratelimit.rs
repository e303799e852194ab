//! Process-wide rate-limit governor: one shared backoff state per
//! batch, so concurrent workers serve a single cooldown instead of
//! independently hammering a limited upstream.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct BackoffState {
    consecutive_failures: u32,
    current_backoff: Duration,
    backoff_until: Option<Instant>,
}

/// Introspection snapshot for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorStatus {
    pub backoff_active: bool,
    pub backoff_remaining: Duration,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct RateLimitGovernor {
    state: Mutex<BackoffState>,
    cap: Duration,
}

impl Default for RateLimitGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitGovernor {
    pub fn new() -> Self {
        Self::with_cap(BACKOFF_CAP)
    }

    pub fn with_cap(cap: Duration) -> Self {
        Self {
            state: Mutex::new(BackoffState::default()),
            cap,
        }
    }

    /// Wait out any active cooldown. The lock is released before
    /// sleeping so other workers can observe and extend the state.
    pub async fn check_rate_limit(&self) {
        let deadline = {
            let state = self.state.lock().await;
            match state.backoff_until {
                Some(until) if until > Instant::now() => Some(until),
                _ => None,
            }
        };
        if let Some(until) = deadline {
            debug!(
                remaining_ms = (until - Instant::now()).as_millis() as u64,
                "waiting out shared rate-limit cooldown"
            );
            tokio::time::sleep_until(until).await;
        }
    }

    /// Register an upstream rate-limit signal. Uses the upstream's
    /// retry-after when provided, else exponential backoff capped at
    /// `cap`.
    pub async fn record_rate_limited(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        let backoff = match retry_after {
            Some(d) => d,
            None => {
                let secs = 2u64
                    .saturating_pow(state.consecutive_failures)
                    .min(self.cap.as_secs());
                Duration::from_secs(secs)
            }
        };
        state.current_backoff = backoff;
        state.backoff_until = Some(Instant::now() + backoff);
        debug!(
            consecutive_failures = state.consecutive_failures,
            backoff_secs = backoff.as_secs_f64(),
            "rate limited, extending shared backoff"
        );
    }

    /// Clear the backoff after a successful upstream call.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
        state.current_backoff = Duration::ZERO;
        state.backoff_until = None;
    }

    pub async fn status(&self) -> GovernorStatus {
        let state = self.state.lock().await;
        let remaining = state
            .backoff_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO);
        GovernorStatus {
            backoff_active: remaining > Duration::ZERO,
            backoff_remaining: remaining,
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// Current backoff duration, for tests and status displays.
    pub async fn current_backoff(&self) -> Duration {
        self.state.lock().await.current_backoff
    }
}
