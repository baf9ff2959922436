//! Circuit breaker for isolating failing dependencies
//!
//! Wraps any async operation with a hard per-call timeout and stops invoking
//! a dependency once it keeps failing, until a cool-down has passed.

use serde::Serialize;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use triad_core::config::BreakerConfig;
use triad_core::{Result, TriadError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Too many failures - reject requests immediately
    Open,
    /// Testing recovery - a bounded number of probes allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Snapshot of breaker counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub timeouts: u64,
    /// Calls rejected because the circuit was open or the probe budget was spent
    pub circuit_open_count: u64,
    /// Running average over completed calls
    pub average_response_ms: f64,
}

impl BreakerMetrics {
    /// Percentage of completed calls that succeeded, 100 when none completed
    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_calls + self.failed_calls;
        if completed == 0 {
            100.0
        } else {
            self.successful_calls as f64 * 100.0 / completed as f64
        }
    }

    fn record_response(&mut self, elapsed: Duration) {
        let completed = self.successful_calls + self.failed_calls;
        let ms = elapsed.as_secs_f64() * 1000.0;
        // completed already includes this call
        self.average_response_ms += (ms - self.average_response_ms) / completed.max(1) as f64;
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    metrics: BreakerMetrics,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            opened_at: None,
            last_failure: None,
            metrics: BreakerMetrics::default(),
        }
    }
}

/// Circuit breaker to prevent cascading failures
///
/// # States
///
/// - **Closed**: all calls run; `failure_threshold` consecutive failures open the circuit
/// - **Open**: calls are rejected with `CircuitOpen` without running
/// - **HalfOpen**: after `recovery_timeout`, up to `half_open_max_calls` probes run;
///   that many successes close the circuit, any failure reopens it
///
/// The breaker never hides the error of a call it ran; it only decides
/// whether to run the call at all.
///
/// # Example
///
/// ```
/// use triad_agent::CircuitBreaker;
/// use triad_core::config::BreakerConfig;
/// use triad_core::TriadError;
///
/// # async fn demo() {
/// let cb = CircuitBreaker::new("llm", BreakerConfig::default().with_failure_threshold(1));
/// let _ = cb
///     .execute(|| async { Err::<(), _>(TriadError::Other("down".into())) })
///     .await;
///
/// // Circuit is now open
/// let err = cb.execute(|| async { Ok::<_, TriadError>(1) }).await.unwrap_err();
/// assert!(matches!(err, TriadError::CircuitOpen { .. }));
/// # }
/// ```
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    ///
    /// # Arguments
    ///
    /// * `name` - Dependency name used in errors and logs
    /// * `config` - Thresholds and timeouts
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker
    ///
    /// Rejects with `CircuitOpen` or `HalfOpenLimit` without invoking the
    /// operation, or with `Timeout` when it does not finish within the
    /// configured call timeout.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        let started = Instant::now();
        let call_timeout = self.config.call_timeout();
        match tokio::time::timeout(call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success(started.elapsed());
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(started.elapsed(), false);
                Err(e)
            }
            Err(_) => {
                self.on_failure(started.elapsed(), true);
                Err(TriadError::Timeout(call_timeout.as_millis() as u64))
            }
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Snapshot of the metrics counters
    pub fn metrics(&self) -> BreakerMetrics {
        self.lock().metrics.clone()
    }

    /// Current consecutive failure count (for monitoring)
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Time until an open circuit admits probes, zero otherwise
    pub fn time_until_retry(&self) -> Duration {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        self.remaining_open(&inner)
    }

    /// Force the circuit closed and clear the counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.last_failure = None;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the counters stay usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.metrics.total_calls += 1;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                inner.metrics.circuit_open_count += 1;
                let retry_in_ms = self.remaining_open(&inner).as_millis() as u64;
                debug!(breaker = %self.name, retry_in_ms, "Rejecting call, circuit open");
                Err(TriadError::CircuitOpen {
                    name: self.name.clone(),
                    retry_in_ms,
                })
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    inner.metrics.circuit_open_count += 1;
                    return Err(TriadError::HalfOpenLimit(self.name.clone()));
                }
                inner.half_open_calls += 1;
                Ok(())
            }
        }
    }

    fn on_success(&self, elapsed: Duration) {
        let mut inner = self.lock();
        inner.metrics.successful_calls += 1;
        inner.metrics.record_response(elapsed);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            // A call admitted before the circuit opened; it does not close it.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, elapsed: Duration, timed_out: bool) {
        let mut inner = self.lock();
        inner.metrics.failed_calls += 1;
        if timed_out {
            inner.metrics.timeouts += 1;
        }
        inner.metrics.record_response(elapsed);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Probe failed, reopening circuit");
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "Failure threshold reached, opening circuit"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Promote OPEN to HALF_OPEN once the recovery timeout has elapsed
    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open && self.remaining_open(inner).is_zero() {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn remaining_open(&self, inner: &Inner) -> Duration {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => self
                .config
                .recovery_timeout()
                .saturating_sub(opened_at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        let previous = inner.state;
        inner.state = next;
        match next {
            CircuitState::Open => {
                inner.failure_count = 0;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.half_open_calls = 0;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_calls = 0;
                inner.opened_at = None;
            }
        }
        if previous != next {
            info!(breaker = %self.name, from = %previous, to = %next, "Circuit state changed");
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("default", BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32, recovery_ms: u64, probes: u32) -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_recovery_timeout(Duration::from_millis(recovery_ms))
            .with_half_open_max_calls(probes)
            .with_call_timeout(Duration::from_millis(500))
    }

    async fn fail(cb: &CircuitBreaker) -> TriadError {
        cb.execute(|| async { Err::<(), _>(TriadError::Other("boom".to_string())) })
            .await
            .unwrap_err()
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.execute(|| async { Ok::<_, TriadError>(7) }).await
    }

    #[tokio::test]
    async fn test_initial_state_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_operation() {
        let cb = CircuitBreaker::new("dep", config(3, 60_000, 1));

        for _ in 0..3 {
            let err = fail(&cb).await;
            // the underlying error is passed through untouched
            assert!(matches!(err, TriadError::Other(_)));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let err = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TriadError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TriadError::CircuitOpen { .. }));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().circuit_open_count, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = CircuitBreaker::new("dep", config(3, 60_000, 1));

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.failure_count(), 2);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.failure_count(), 0);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let cb = CircuitBreaker::new("dep", config(2, 1_000, 2));

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.time_until_retry() > Duration::ZERO);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.time_until_retry(), Duration::ZERO);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("dep", config(1, 1_000, 3));

        fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            succeed(&cb).await.unwrap_err(),
            TriadError::CircuitOpen { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limit_rejects_extra_probes() {
        let cb = std::sync::Arc::new(CircuitBreaker::new("dep", config(1, 100, 1)));

        fail(&cb).await;
        tokio::time::advance(Duration::from_millis(150)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async {
                    let _ = release_rx.await;
                    Ok::<_, TriadError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let err = succeed(&cb).await.unwrap_err();
        assert!(matches!(err, TriadError::HalfOpenLimit(_)));

        let _ = release_tx.send(());
        probe.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new("slow", config(1, 60_000, 1));

        let err = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, TriadError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TriadError::Timeout(500)));
        assert!(err.is_circuit_rejection());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_metrics_and_reset() {
        let cb = CircuitBreaker::new("dep", config(2, 60_000, 1));

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        fail(&cb).await;

        let metrics = cb.metrics();
        assert_eq!(metrics.total_calls, 4);
        assert_eq!(metrics.successful_calls, 3);
        assert_eq!(metrics.failed_calls, 1);
        assert!((metrics.success_rate() - 75.0).abs() < f64::EPSILON);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }
}
