//! Retry/backoff engine wrapping detail-source calls.
//!
//! Back-off state is process-global: the timeout cool-down and the budget
//! reset deadline are shared by every worker, so parallel fetches converge on
//! the same cool-down instead of hammering the source independently.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use killfeed_store::models::DetailRecord;

use crate::coordinator::ErrorBudget;
use crate::detail::DetailError;
use crate::sources::DetailSource;

/// Tunables for the retry engine.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts when the source keeps timing out.
    pub timeout_attempts: u32,
    /// Minimum gap between any two attempts after a timeout was seen,
    /// measured from the (shared) last timeout.
    pub timeout_cooldown: Duration,
    /// Extra spacing slept after each timed-out attempt.
    pub timeout_spacing: Duration,
    /// Minimum wait imposed when the source reports the budget as exhausted.
    pub budget_floor_wait: Duration,
    /// First transport backoff step.
    pub backoff_base: Duration,
    /// Transport backoff ceiling.
    pub backoff_cap: Duration,
    /// Total elapsed bound for transport retries; the kill is skipped past it.
    pub backoff_elapsed_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_attempts: 3,
            timeout_cooldown: Duration::from_secs(15),
            timeout_spacing: Duration::from_secs(5),
            budget_floor_wait: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            backoff_elapsed_cap: Duration::from_secs(300),
        }
    }
}

/// Shared back-off state (one per engine instance).
#[derive(Debug, Default)]
pub(crate) struct RetryState {
    last_timeout_at: Mutex<Option<Instant>>,
}

impl RetryState {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_timeout_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_timeout(&self) {
        *self.lock() = Some(Instant::now());
    }

    /// How much of the cool-down window after the last timeout is still left.
    fn cooldown_remaining(&self, cooldown: Duration) -> Option<Duration> {
        let last = (*self.lock())?;
        let elapsed = last.elapsed();
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }
}

/// Fetch one detail record, absorbing retriable failures per policy.
///
/// Timeouts retry a bounded number of times, budget exhaustion retries
/// without bound (the scheduler owns giving up on the job), transport errors
/// back off exponentially under a total-elapsed cap, parse errors are
/// terminal.
pub(crate) async fn fetch_detail(
    detail: &dyn DetailSource,
    budget: &ErrorBudget,
    state: &RetryState,
    policy: &RetryPolicy,
    killmail_id: i64,
    hash: &str,
    cancel: &CancellationToken,
) -> Result<DetailRecord, DetailError> {
    let started = Instant::now();
    let mut timeout_attempts = 0u32;
    let mut transport_backoff = policy.backoff_base;

    loop {
        if cancel.is_cancelled() {
            return Err(DetailError::Cancelled);
        }

        // Honor the shared post-timeout cool-down before initiating anything.
        if let Some(wait) = state.cooldown_remaining(policy.timeout_cooldown) {
            sleep_or_cancel(wait, cancel).await?;
            continue;
        }

        match detail.killmail(killmail_id, hash, cancel).await {
            Ok(record) => return Ok(record),
            Err(DetailError::Timeout(message)) => {
                state.record_timeout();
                timeout_attempts += 1;
                if timeout_attempts >= policy.timeout_attempts {
                    return Err(DetailError::Timeout(message));
                }
                tracing::warn!(
                    killmail_id,
                    attempt = timeout_attempts,
                    "detail fetch timed out; cooling down"
                );
                sleep_or_cancel(policy.timeout_spacing, cancel).await?;
            }
            Err(DetailError::BudgetExhausted) => {
                budget.extend_reset(policy.budget_floor_wait);
                tracing::warn!(killmail_id, "error budget exhausted; waiting for reset");
                budget
                    .acquire(cancel)
                    .await
                    .map_err(|_| DetailError::Cancelled)?;
            }
            Err(err @ (DetailError::Transport { .. } | DetailError::Network(_))) => {
                if started.elapsed() + transport_backoff > policy.backoff_elapsed_cap {
                    return Err(err);
                }
                let wait = jittered(transport_backoff);
                tracing::warn!(
                    killmail_id,
                    error = %err,
                    wait_ms = wait.as_millis() as u64,
                    "detail fetch failed; backing off"
                );
                sleep_or_cancel(wait, cancel).await?;
                transport_backoff = (transport_backoff * 2).min(policy.backoff_cap);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Add up to 50% random jitter on top of the base step.
fn jittered(base: Duration) -> Duration {
    let extra_ms = base.as_millis() as u64 / 2;
    if extra_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=extra_ms))
}

async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> Result<(), DetailError> {
    tokio::select! {
        _ = tokio::time::sleep(wait) => Ok(()),
        _ = cancel.cancelled() => Err(DetailError::Cancelled),
    }
}
