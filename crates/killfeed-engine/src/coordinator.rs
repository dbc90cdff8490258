//! Process-wide error-budget coordinator for the detail source.
//!
//! The detail source advertises a sliding error budget on every response
//! (`X-Esi-Error-Limit-Remain` / `X-Esi-Error-Limit-Reset`). Exceeding it
//! draws a mandatory wait, so no request may be sent while the budget is
//! spent. This state is shared by every worker and every retry.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A request may be sent now.
    Ok,
    /// The budget is spent; wait this long and re-check.
    Wait(Duration),
}

/// The waiting caller was cancelled before the budget admitted it.
#[derive(Debug, thiserror::Error)]
#[error("cancelled while waiting for the error budget")]
pub struct Cancelled;

#[derive(Debug)]
struct BudgetState {
    remaining: u32,
    reset_deadline: Instant,
}

/// Shared error-budget state. Construct one per process and hand an `Arc` to
/// every detail-source caller.
#[derive(Debug)]
pub struct ErrorBudget {
    state: Mutex<BudgetState>,
}

impl ErrorBudget {
    /// Assumed budget before the first response has been observed.
    pub const DEFAULT_REMAINING: u32 = 60;

    /// Assumed window length before the first response has been observed.
    pub const DEFAULT_RESET: Duration = Duration::from_secs(60);

    /// New coordinator with the default assumed budget.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BudgetState {
                remaining: Self::DEFAULT_REMAINING,
                reset_deadline: Instant::now() + Self::DEFAULT_RESET,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the budget headers of a response.
    pub fn observe(&self, remaining: u32, reset_seconds: u64) {
        let mut state = self.lock();
        state.remaining = remaining;
        state.reset_deadline = Instant::now() + Duration::from_secs(reset_seconds);
    }

    /// Whether a request may be sent now. Past the reset deadline the window
    /// has rolled and the budget counts as refreshed.
    pub fn admit(&self) -> Admission {
        let state = self.lock();
        let now = Instant::now();
        if now >= state.reset_deadline || state.remaining > 0 {
            Admission::Ok
        } else {
            Admission::Wait(state.reset_deadline - now)
        }
    }

    /// Burn one unit of budget (called on every 4xx/5xx response).
    pub fn penalize(&self) {
        let mut state = self.lock();
        state.remaining = state.remaining.saturating_sub(1);
    }

    /// Raise the reset deadline to at least `min_wait` from now, without ever
    /// lowering it. Used when the source reports the budget as exhausted.
    pub fn extend_reset(&self, min_wait: Duration) {
        let mut state = self.lock();
        let floor = Instant::now() + min_wait;
        if state.reset_deadline < floor {
            state.reset_deadline = floor;
        }
    }

    /// Sleep until a request is admissible, or until `cancel` fires. The
    /// mutex is never held across an await.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            match self.admit() {
                Admission::Ok => return Ok(()),
                Admission::Wait(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(Cancelled),
                    }
                }
            }
        }
    }
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_while_budget_remains() {
        let budget = ErrorBudget::new();
        budget.observe(5, 30);
        assert_eq!(budget.admit(), Admission::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_reset_when_spent() {
        let budget = ErrorBudget::new();
        budget.observe(0, 30);

        match budget.admit() {
            Admission::Wait(wait) => assert_eq!(wait, Duration::from_secs(30)),
            Admission::Ok => panic!("expected a wait while the budget is spent"),
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(budget.admit(), Admission::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn penalize_saturates_at_zero() {
        let budget = ErrorBudget::new();
        budget.observe(1, 60);
        budget.penalize();
        budget.penalize();
        assert!(matches!(budget.admit(), Admission::Wait(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn extend_reset_never_lowers_the_deadline() {
        let budget = ErrorBudget::new();
        budget.observe(0, 120);
        budget.extend_reset(Duration::from_secs(60));

        match budget.admit() {
            Admission::Wait(wait) => assert_eq!(wait, Duration::from_secs(120)),
            Admission::Ok => panic!("expected a wait"),
        }

        budget.observe(0, 10);
        budget.extend_reset(Duration::from_secs(60));
        match budget.admit() {
            Admission::Wait(wait) => assert_eq!(wait, Duration::from_secs(60)),
            Admission::Ok => panic!("expected a wait"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_sleeps_the_requested_amount() {
        let budget = ErrorBudget::new();
        budget.observe(0, 45);

        let before = Instant::now();
        budget.acquire(&CancellationToken::new()).await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_stops_waiting_when_cancelled() {
        let budget = ErrorBudget::new();
        budget.observe(0, 3600);
        let cancel = CancellationToken::new();

        let acquire = budget.acquire(&cancel);
        tokio::pin!(acquire);
        tokio::select! {
            biased;
            _ = &mut acquire => panic!("budget should still be blocking"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        cancel.cancel();
        assert!(acquire.await.is_err());
    }
}
