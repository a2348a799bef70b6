//! Circuit breaker protecting health probes and other calls into the database.
//!
//! After `failure_threshold` consecutive failures the breaker opens and
//! rejects calls without running them. Once `cooldown_ms` has elapsed a single
//! trial call is let through; its outcome either closes the breaker or
//! reopens it for another cooldown. A trial that is dropped before it
//! settles (cancelled or panicked) counts as failed.

use crate::error::MonitorError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call
    pub cooldown_ms: u64,
    /// Failures further apart than this do not count as consecutive
    pub failure_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            failure_window_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open - call rejected")]
    Open,
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open)
    }
}

impl From<CircuitBreakerError<MonitorError>> for MonitorError {
    fn from(err: CircuitBreakerError<MonitorError>) -> Self {
        match err {
            CircuitBreakerError::Open => MonitorError::CircuitOpen,
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    trial_started: Option<Instant>,
    trips: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            trial_in_flight: false,
            trial_started: None,
            trips: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }
}

impl BreakerState {
    fn abandon_trial(&mut self) {
        if self.state == CircuitState::HalfOpen && self.trial_in_flight {
            let now = Instant::now();
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            self.last_failure = Some(now);
            self.trips += 1;
            self.total_failures += 1;
        }
        self.trial_in_flight = false;
        self.trial_started = None;
    }
}

/// Whether an admitted call is the single half-open trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Reopens the breaker if an admitted trial is dropped before it settles.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            armed: admission == Admission::Trial,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Contended lock: the stale-trial expiry in `admit` recovers instead.
        if let Ok(mut inner) = self.breaker.inner.try_lock() {
            inner.abandon_trial();
            warn!("Circuit breaker trial abandoned, reopening");
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` under breaker protection. The lock is released while `f` runs.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let admission = self.admit().await.ok_or(CircuitBreakerError::Open)?;
        let mut trial = TrialGuard::new(self, admission);

        let outcome = match f().await {
            Ok(value) => {
                self.on_success(admission).await;
                Ok(value)
            }
            Err(error) => {
                debug!(error = %error, "Circuit breaker call failed");
                self.on_failure(admission).await;
                Err(CircuitBreakerError::Inner(error))
            }
        };
        trial.disarm();
        outcome
    }

    async fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown())
                    .unwrap_or(true);

                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    inner.trial_started = Some(Instant::now());
                    info!("Circuit breaker transitioned to half-open");
                    Some(Admission::Trial)
                } else {
                    inner.total_rejections += 1;
                    debug!("Circuit breaker is open, rejecting call");
                    None
                }
            }
            CircuitState::HalfOpen => {
                let stale = inner
                    .trial_started
                    .map(|at| at.elapsed() >= self.config.cooldown())
                    .unwrap_or(true);
                if inner.trial_in_flight && !stale {
                    inner.total_rejections += 1;
                    debug!("Circuit breaker trial in flight, rejecting call");
                    None
                } else {
                    if inner.trial_in_flight {
                        warn!("Previous circuit breaker trial never settled, admitting a new one");
                    }
                    inner.trial_in_flight = true;
                    inner.trial_started = Some(Instant::now());
                    Some(Admission::Trial)
                }
            }
        }
    }

    async fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock().await;
        inner.total_successes += 1;

        if admission == Admission::Trial {
            inner.trial_in_flight = false;
            inner.trial_started = None;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                info!("Circuit breaker closed after successful trial call");
            }
        }
        inner.consecutive_failures = 0;
    }

    async fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.total_failures += 1;

        if admission == Admission::Trial {
            inner.trial_in_flight = false;
            inner.trial_started = None;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.last_failure = Some(now);
                inner.trips += 1;
                warn!("Circuit breaker reopened after failed trial call");
                return;
            }
        }

        let within_window = inner
            .last_failure
            .map(|last| now.duration_since(last) <= self.config.failure_window())
            .unwrap_or(false);
        inner.consecutive_failures = if within_window {
            inner.consecutive_failures + 1
        } else {
            1
        };
        inner.last_failure = Some(now);

        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.trips += 1;
            warn!(
                failures = inner.consecutive_failures,
                cooldown_ms = self.config.cooldown_ms,
                "Circuit breaker opened"
            );
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().await;
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            trips: inner.trips,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            open_for_ms: inner.opened_at.map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Force the breaker closed and clear all counters.
    pub async fn reset(&self) {
        *self.inner.lock().await = BreakerState::closed();
        debug!("Circuit breaker manually reset");
    }

    /// Open the breaker immediately, as if the threshold had been reached.
    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        inner.trial_started = None;
        inner.trips += 1;
        warn!("Circuit breaker manually forced open");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub trips: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub open_for_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn fast_config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_ms: 50,
            failure_window_ms: 10_000,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, CircuitBreakerError<&'static str>> {
        cb.execute(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new(fast_config(3));

        for _ in 0..2 {
            assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Inner("boom"))));
        }
        assert_eq!(cb.state().await, CircuitState::Closed);

        let _ = fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "open breaker must not run the call");
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new(fast_config(3));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let cb = CircuitBreaker::new(fast_config(1));
        let _ = fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        sleep(Duration::from_millis(80)).await;
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.stats().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let cb = CircuitBreaker::new(fast_config(1));
        let _ = fail(&cb).await;

        sleep(Duration::from_millis(80)).await;
        assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Inner(_))));
        assert_eq!(cb.state().await, CircuitState::Open);
        assert_eq!(cb.stats().await.trips, 2);

        // Cooldown restarted: an immediate call is rejected.
        assert!(succeed(&cb).await.unwrap_err().is_open());
    }

    #[tokio::test]
    async fn test_single_trial_call_in_half_open() {
        let cb = Arc::new(CircuitBreaker::new(fast_config(1)));
        let _ = fail(&cb).await;
        sleep(Duration::from_millis(80)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(())
                })
                .await
        });

        // Let the trial get admitted before racing it.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        assert!(succeed(&cb).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_trial_reopens_and_recovers() {
        let cb = CircuitBreaker::new(fast_config(1));
        cb.force_open().await;
        sleep(Duration::from_millis(80)).await;

        let slow_trial = cb.execute(|| async {
            sleep(Duration::from_secs(5)).await;
            Ok::<_, &'static str>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), slow_trial)
            .await
            .is_err());

        // Abandoned trial counts as a failed one
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_open());

        sleep(Duration::from_millis(80)).await;
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unsettled_trial_expires_after_cooldown() {
        let cb = CircuitBreaker::new(fast_config(1));
        cb.force_open().await;
        sleep(Duration::from_millis(80)).await;

        // Leak a trial without running its drop handler
        let mut stuck = Box::pin(cb.execute(|| async {
            sleep(Duration::from_secs(5)).await;
            Ok::<_, &'static str>(())
        }));
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut stuck)
            .await
            .is_err());
        std::mem::forget(stuck);

        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        assert!(succeed(&cb).await.unwrap_err().is_open());

        sleep(Duration::from_millis(80)).await;
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let cb = CircuitBreaker::new(fast_config(1));
        cb.force_open().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        cb.reset().await;
        let stats = cb.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.trips, 0);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_stats_serialization() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        let json = serde_json::to_value(cb.stats().await).unwrap();
        assert_eq!(json["state"], "closed");
        assert_eq!(json["failure_threshold"], 5);
    }

    #[tokio::test]
    async fn test_monitor_error_conversion() {
        let cb = CircuitBreaker::new(fast_config(1));
        cb.force_open().await;
        let err: MonitorError = cb
            .execute(|| async { Ok::<_, MonitorError>(()) })
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, MonitorError::CircuitOpen));
    }
}
