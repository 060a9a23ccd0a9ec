//! Circuit breaker guarding calls to a remote service.
//!
//! ```text
//!            N consecutive failures
//!   Closed ─────────────────────────► Open
//!     ▲                                │ cool-down elapsed
//!     │ trial success                  ▼
//!     └──────────────────────────── HalfOpen ──► Open (trial failure)
//! ```
//!
//! While open, calls are rejected with [`ScanError::CircuitOpen`] without
//! running. After the cool-down a limited number of trial calls are let
//! through. In the closed state the consecutive-failure count is reset when
//! no call has started or finished for `idle_reset`.
//!
//! Every state change starts a new generation. An outcome reported for a
//! call admitted in an earlier generation is ignored.

use crate::error::ScanError;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting trial calls.
    pub open_cooldown: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Quiet period after which the closed-state failure count resets.
    pub idle_reset: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_cooldown: Duration::from_secs(20),
            half_open_max_calls: 5,
            idle_reset: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Start or end of the most recent call.
    last_activity: Option<Instant>,
    half_open_in_flight: u32,
    generation: u64,
}

/// Outcome of asking the breaker for permission to call.
enum Admission {
    Allowed(Ticket),
    Rejected,
}

/// Identifies an admitted call when its outcome is reported.
#[derive(Clone, Copy)]
struct Ticket {
    generation: u64,
    trial: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_activity: None,
                half_open_in_flight: 0,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.refresh(&mut state, Instant::now());
        state.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Runs `operation` if the breaker admits it.
    ///
    /// A fired `cancel` token returns [`ScanError::Cancelled`] straight
    /// away, whether the call is queued behind the breaker or in progress,
    /// and is not counted as a failure.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, ScanError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ScanError>>,
    {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let ticket = match self.admit() {
            Admission::Allowed(ticket) => ticket,
            Admission::Rejected => {
                return Err(ScanError::CircuitOpen {
                    name: self.name.clone(),
                })
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.release(ticket);
                return Err(ScanError::Cancelled);
            }
            result = operation() => result,
        };

        match &result {
            Ok(_) => self.on_success(ticket),
            Err(err) if err.is_cancelled() => self.release(ticket),
            Err(_) => self.on_failure(ticket),
        }
        result
    }

    /// Moves Open to HalfOpen once the cool-down has passed, and clears
    /// stale failure counts in the closed state.
    fn refresh(&self, state: &mut BreakerState, now: Instant) {
        match state.state {
            CircuitState::Open => {
                let cooled = state
                    .opened_at
                    .is_none_or(|at| now.duration_since(at) >= self.settings.open_cooldown);
                if cooled {
                    self.transition(state, CircuitState::HalfOpen);
                }
            }
            CircuitState::Closed => {
                let idle = state
                    .last_activity
                    .is_some_and(|at| now.duration_since(at) >= self.settings.idle_reset);
                if idle && state.consecutive_failures > 0 {
                    tracing::debug!(breaker = %self.name, "idle interval elapsed, clearing failure count");
                    state.consecutive_failures = 0;
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut state = self.lock();
        self.refresh(&mut state, now);
        state.last_activity = Some(now);

        let trial = match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => return Admission::Rejected,
            CircuitState::HalfOpen => {
                if state.half_open_in_flight >= self.settings.half_open_max_calls {
                    return Admission::Rejected;
                }
                state.half_open_in_flight += 1;
                true
            }
        };
        Admission::Allowed(Ticket {
            generation: state.generation,
            trial,
        })
    }

    /// Locks the state for reporting the outcome of `ticket`. Returns
    /// `None` when the breaker has changed state since the call was
    /// admitted.
    fn settle(&self, ticket: Ticket) -> Option<MutexGuard<'_, BreakerState>> {
        let now = Instant::now();
        let mut state = self.lock();
        state.last_activity = Some(now);
        self.refresh(&mut state, now);
        if state.generation != ticket.generation {
            return None;
        }
        if ticket.trial {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
        Some(state)
    }

    fn on_success(&self, ticket: Ticket) {
        let Some(mut state) = self.settle(ticket) else {
            return;
        };
        state.consecutive_failures = 0;
        if state.state == CircuitState::HalfOpen {
            self.transition(&mut state, CircuitState::Closed);
        }
    }

    fn on_failure(&self, ticket: Ticket) {
        let Some(mut state) = self.settle(ticket) else {
            return;
        };
        state.consecutive_failures += 1;

        let trip = match state.state {
            CircuitState::Closed => state.consecutive_failures >= self.settings.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            self.transition(&mut state, CircuitState::Open);
            state.opened_at = Some(Instant::now());
        }
    }

    fn release(&self, ticket: Ticket) {
        drop(self.settle(ticket));
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        if state.state == to {
            return;
        }
        let from = state.state;
        state.state = to;
        state.generation += 1;
        state.half_open_in_flight = 0;
        if to == CircuitState::Open {
            tracing::warn!(breaker = %self.name, %from, %to, failures = state.consecutive_failures, "circuit breaker state changed");
        } else {
            tracing::info!(breaker = %self.name, %from, %to, "circuit breaker state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn settings(cooldown: Duration) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 5,
            open_cooldown: cooldown,
            half_open_max_calls: 1,
            idle_reset: Duration::from_secs(60),
        }
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), ScanError> {
        let cancel = CancellationToken::new();
        breaker
            .execute(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ScanError::Transport("refused".to_string()))
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), ScanError> {
        let cancel = CancellationToken::new();
        breaker
            .execute(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn test_trips_after_five_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", settings(Duration::from_secs(60)));
        let calls = AtomicUsize::new(0);

        for _ in 0..5 {
            assert!(matches!(
                fail(&breaker, &calls).await,
                Err(ScanError::Transport(_))
            ));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let sixth = succeed(&breaker, &calls).await;
        assert!(matches!(sixth, Err(ScanError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("test", settings(Duration::from_secs(60)));
        let calls = AtomicUsize::new(0);

        for _ in 0..4 {
            let _ = fail(&breaker, &calls).await;
        }
        succeed(&breaker, &calls).await.unwrap();
        for _ in 0..4 {
            let _ = fail(&breaker, &calls).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 4);
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let breaker = CircuitBreaker::new("test", settings(Duration::from_millis(30)));
        let calls = AtomicUsize::new(0);

        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("test", settings(Duration::from_millis(30)));
        let calls = AtomicUsize::new(0);

        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(fail(&breaker, &calls).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            succeed(&breaker, &calls).await,
            Err(ScanError::CircuitOpen { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_idle_interval_resets_failures() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerSettings {
                idle_reset: Duration::from_millis(20),
                ..settings(Duration::from_secs(60))
            },
        );
        let calls = AtomicUsize::new(0);

        for _ in 0..4 {
            let _ = fail(&breaker, &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        let _ = fail(&breaker, &calls).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_slow_failures_still_trip_with_short_idle_reset() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerSettings {
                idle_reset: Duration::from_millis(30),
                ..settings(Duration::from_secs(60))
            },
        );
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();

        let mut results = Vec::new();
        for _ in 0..6 {
            let result: Result<(), ScanError> = breaker
                .execute(&cancel, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(ScanError::Transport("timeout".to_string()))
                })
                .await;
            results.push(result);
        }

        assert!(results[..5]
            .iter()
            .all(|r| matches!(r, Err(ScanError::Transport(_)))));
        assert!(matches!(results[5], Err(ScanError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_outcome_from_earlier_state_is_ignored() {
        let breaker = Arc::new(CircuitBreaker::new("test", settings(Duration::from_millis(30))));
        let calls = AtomicUsize::new(0);
        let (finish, finished) = oneshot::channel::<()>();

        // Admitted while closed, completes after the breaker went half-open.
        let straggler = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                breaker
                    .execute(&cancel, || async move {
                        let _ = finished.await;
                        Ok::<_, ScanError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        finish.send(()).unwrap();
        straggler.await.unwrap().unwrap();

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // The trial slot is still free for a real trial.
        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_call_returns_promptly_and_is_not_counted() {
        let breaker = CircuitBreaker::new("test", settings(Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<(), ScanError> = breaker
            .execute(&cancel, || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
