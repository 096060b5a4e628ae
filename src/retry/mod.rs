//! C1 — Retry Executor & Circuit Breaker.
//!
//! Runs a fallible operation under a domain-specific [`RetryEnvelope`],
//! enforcing a failure budget and maintaining a per-domain [`CircuitBreakerState`].
//! Jitter is deterministic (hashed from correlation id + attempt) so a replayed
//! trace reproduces an identical delay schedule.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult, ErrorCode, FaultDomain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    None,
    Immediate,
    Exponential,
    Linear,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    None,
    DeterministicFull,
    DeterministicEqual,
}

/// Per-fault-domain retry configuration. Guardrails are enforced by
/// [`RetryEnvelope::clamp`], never by rejecting the whole config outright —
/// the spec calls for falling back to safe defaults on out-of-range values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryEnvelope {
    pub policy: RetryPolicy,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter_strategy: JitterStrategy,
    pub cooldown_ms: u64,
    pub failure_budget_ms: u64,
}

impl Default for RetryEnvelope {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Exponential,
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts: 3,
            jitter_strategy: JitterStrategy::DeterministicFull,
            cooldown_ms: 30_000,
            failure_budget_ms: 60_000,
        }
    }
}

impl RetryEnvelope {
    /// Guardrail bounds from the configuration section: `max_attempts <= 8`,
    /// `initial_delay <= 5s`, `multiplier in [1,5]`, `max_delay <= 60s`,
    /// `cooldown in [5s, 120s]`, `failure_budget in [1s, 120s]`.
    pub fn clamp(mut self) -> Self {
        self.max_attempts = self.max_attempts.clamp(1, 8);
        self.initial_delay_ms = self.initial_delay_ms.min(5_000);
        self.multiplier = self.multiplier.clamp(1.0, 5.0);
        self.max_delay_ms = self.max_delay_ms.min(60_000);
        self.cooldown_ms = self.cooldown_ms.clamp(5_000, 120_000);
        self.failure_budget_ms = self.failure_budget_ms.clamp(1_000, 120_000);

        // "policy=None forces max_attempts=1, initial_delay=0, jitter_strategy=None"
        if self.policy == RetryPolicy::None {
            self.max_attempts = 1;
            self.initial_delay_ms = 0;
            self.jitter_strategy = JitterStrategy::None;
        }
        self
    }

    /// "Envelope override with jitter=0 => jitter_strategy=None; jitter>0 => DeterministicFull"
    pub fn with_jitter_override(mut self, jitter_ms: u64) -> Self {
        self.jitter_strategy = if jitter_ms == 0 {
            JitterStrategy::None
        } else {
            JitterStrategy::DeterministicFull
        };
        self
    }

    fn base_delay_ms(&self, attempt: u32) -> u64 {
        match self.policy {
            RetryPolicy::None | RetryPolicy::Immediate => 0,
            RetryPolicy::Linear => {
                let raw = self.initial_delay_ms as f64
                    + (attempt.saturating_sub(1)) as f64 * self.multiplier;
                raw.min(self.max_delay_ms as f64) as u64
            }
            RetryPolicy::Hybrid => match attempt {
                1 => 0,
                2 => self.initial_delay_ms,
                k => {
                    let raw =
                        self.initial_delay_ms as f64 * self.multiplier.powi(k as i32 - 2);
                    raw.min(self.max_delay_ms as f64) as u64
                }
            },
            RetryPolicy::Exponential => {
                let raw =
                    self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
                raw.min(self.max_delay_ms as f64) as u64
            }
        }
    }
}

/// Fixed, versioned deterministic hash (xxh3-64, folded to 32 bits) so jitter
/// schedules survive a compiler upgrade — unlike `std::hash::DefaultHasher`,
/// whose output is explicitly unspecified across versions.
pub fn deterministic_hash(correlation_id: &str, attempt: u32) -> u32 {
    let mut buf = Vec::with_capacity(correlation_id.len() + 4);
    buf.extend_from_slice(correlation_id.as_bytes());
    buf.extend_from_slice(&attempt.to_be_bytes());
    let h = xxhash_rust::xxh3::xxh3_64(&buf);
    (h & 0xFFFF_FFFF) as u32
}

fn jitter_scalar(correlation_id: &str, attempt: u32) -> f64 {
    deterministic_hash(correlation_id, attempt) as f64 / (u32::MAX as f64 + 1.0)
}

/// Compute the jittered delay for one attempt. Exposed standalone (not just
/// via the executor) so S5-style tests can assert the exact schedule.
pub fn compute_delay(envelope: &RetryEnvelope, correlation_id: &str, attempt: u32) -> Duration {
    let base = envelope.base_delay_ms(attempt) as f64;
    let scalar = jitter_scalar(correlation_id, attempt);
    let jitter = match envelope.jitter_strategy {
        JitterStrategy::None => 0.0,
        JitterStrategy::DeterministicFull => base * scalar,
        JitterStrategy::DeterministicEqual => base * 0.5 * (2.0 * scalar - 1.0),
    };
    let total = (base + jitter).max(0.0);
    Duration::from_millis(total.round() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: BreakerState,
    pub failure_count: u32,
    pub threshold: u32,
    pub cooldown_ms: u64,
    #[serde(skip)]
    pub opened_at: Option<Instant>,
    #[serde(skip)]
    pub last_attempt_at: Option<Instant>,
}

impl CircuitBreakerState {
    fn new(envelope: &RetryEnvelope) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            threshold: (envelope.max_attempts.div_ceil(2)).max(2),
            cooldown_ms: envelope.cooldown_ms,
            opened_at: None,
            last_attempt_at: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
    }

    fn record_failure(&mut self, now: Instant, was_half_open: bool) {
        self.failure_count += 1;
        self.last_attempt_at = Some(now);
        if was_half_open || self.failure_count >= self.threshold {
            self.open(now);
        }
    }

    fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
    }
}

/// Snapshot of a single attempt's schedule, attached to the error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPlan {
    pub policy: RetryPolicy,
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub multiplier: f64,
    pub jitter_strategy: JitterStrategy,
    pub breaker_state: BreakerState,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub success: bool,
    pub attempts: u32,
    pub total_duration: Duration,
    pub circuit_breaker_opened: bool,
}

/// Observer hooks. All have a no-op default so a caller only overrides what
/// it needs — same shape as the donor plugin system's lifecycle trait.
pub trait RetryObserver: Send + Sync {
    fn on_attempt(&self, _attempt: u32, _previous_delay: Duration) {}
    fn on_retry_scheduled(&self, _plan: &RetryPlan, _error: &EngineError) {}
    /// Transform a raw failure into the structured error to surface/raise,
    /// optionally overriding whether the executor should retry.
    fn on_failure(&self, error: EngineError, _plan: &RetryPlan) -> (EngineError, Option<bool>) {
        (error, None)
    }
    fn on_complete(&self, _outcome: &RetryOutcome) {}
    /// Called when the breaker is open and the cooldown has not elapsed.
    /// Returning `None` causes the executor to synthesize `RETRY_CIRCUIT_OPEN`.
    fn on_circuit_open(&self, _domain: FaultDomain) -> Option<EngineError> {
        None
    }
}

pub struct NoopObserver;
impl RetryObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct RetryContext {
    pub correlation_id: String,
    pub session_id: Option<String>,
    pub operation_name: String,
}

/// Owns the per-domain circuit breaker map. Cheap to clone (internal `Arc`).
#[derive(Clone)]
pub struct RetryExecutor<C: Clock + 'static> {
    clock: Arc<C>,
    breakers: Arc<Mutex<HashMap<FaultDomain, CircuitBreakerState>>>,
}

impl<C: Clock + 'static> RetryExecutor<C> {
    pub fn new(clock: Arc<C>) -> Self {
        Self {
            clock,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn breaker_snapshot(&self, domain: FaultDomain) -> Option<CircuitBreakerState> {
        self.breakers.lock().get(&domain).cloned()
    }

    /// External reset, e.g. after an operator manually clears a known-bad
    /// dependency. Breaker state is otherwise read-only outside the executor.
    pub fn reset(&self, domain: FaultDomain) {
        self.breakers.lock().remove(&domain);
    }

    #[instrument(skip(self, operation, observer, envelope), fields(correlation_id = %ctx.correlation_id, domain = ?domain))]
    pub async fn execute<F, Fut, T>(
        &self,
        domain: FaultDomain,
        envelope: &RetryEnvelope,
        ctx: RetryContext,
        operation: F,
        observer: &dyn RetryObserver,
    ) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        let envelope = envelope.clamp();
        let start = self.clock.now();

        {
            let mut breakers = self.breakers.lock();
            let breaker = breakers
                .entry(domain)
                .or_insert_with(|| CircuitBreakerState::new(&envelope));
            breaker.threshold = (envelope.max_attempts.div_ceil(2)).max(2);
            breaker.cooldown_ms = envelope.cooldown_ms;

            if breaker.state == BreakerState::Open {
                let now = self.clock.now();
                let elapsed_since_open = breaker
                    .opened_at
                    .map(|opened| now.duration_since(opened))
                    .unwrap_or(Duration::ZERO);
                if elapsed_since_open <= Duration::from_millis(breaker.cooldown_ms) {
                    warn!("circuit open for domain, rejecting without invoking operation");
                    let err = observer.on_circuit_open(domain).unwrap_or_else(|| {
                        EngineError::new(
                            domain,
                            ErrorCode::RetryCircuitOpen,
                            format!("circuit open for {domain:?}"),
                        )
                    });
                    return Err(err);
                }
                breaker.state = BreakerState::HalfOpen;
                breaker.failure_count = 0;
            }
        }

        let mut previous_delay = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            // Mid-loop reopen guard: if another task already tripped the
            // breaker open while we were retrying, abort the same way.
            {
                let breakers = self.breakers.lock();
                if let Some(breaker) = breakers.get(&domain) {
                    if breaker.state == BreakerState::Open && attempt > 1 {
                        let now = self.clock.now();
                        let elapsed = breaker
                            .opened_at
                            .map(|o| now.duration_since(o))
                            .unwrap_or(Duration::ZERO);
                        if elapsed <= Duration::from_millis(breaker.cooldown_ms) {
                            let err = observer.on_circuit_open(domain).unwrap_or_else(|| {
                                EngineError::new(
                                    domain,
                                    ErrorCode::RetryCircuitOpen,
                                    format!("circuit reopened mid-retry for {domain:?}"),
                                )
                            });
                            return Err(err);
                        }
                    }
                }
            }

            observer.on_attempt(attempt, previous_delay);
            debug!(attempt, "invoking operation");

            match operation().await {
                Ok(value) => {
                    let mut breakers = self.breakers.lock();
                    if let Some(breaker) = breakers.get_mut(&domain) {
                        breaker.record_success();
                    }
                    let outcome = RetryOutcome {
                        success: true,
                        attempts: attempt,
                        total_duration: self.clock.now().duration_since(start),
                        circuit_breaker_opened: false,
                    };
                    observer.on_complete(&outcome);
                    return Ok(value);
                }
                Err(raw_error) => {
                    let elapsed = self.clock.now().duration_since(start);
                    let mut delay = compute_delay(&envelope, &ctx.correlation_id, attempt);
                    let remaining_budget =
                        Duration::from_millis(envelope.failure_budget_ms).saturating_sub(elapsed);
                    if delay > remaining_budget {
                        delay = remaining_budget;
                    }

                    let was_half_open = {
                        let breakers = self.breakers.lock();
                        breakers
                            .get(&domain)
                            .map(|b| b.state == BreakerState::HalfOpen)
                            .unwrap_or(false)
                    };

                    let (breaker_state_for_plan, opened_now) = {
                        let mut breakers = self.breakers.lock();
                        let breaker = breakers
                            .entry(domain)
                            .or_insert_with(|| CircuitBreakerState::new(&envelope));
                        let was_open_before = breaker.state == BreakerState::Open;
                        breaker.record_failure(self.clock.now(), was_half_open);
                        (breaker.state, breaker.state == BreakerState::Open && !was_open_before)
                    };

                    let plan = RetryPlan {
                        policy: envelope.policy,
                        attempt,
                        max_attempts: envelope.max_attempts,
                        delay_ms: delay.as_millis() as u64,
                        multiplier: envelope.multiplier,
                        jitter_strategy: envelope.jitter_strategy,
                        breaker_state: breaker_state_for_plan,
                    };

                    let (structured_error, should_retry_override) =
                        observer.on_failure(raw_error, &plan);

                    let budget_exhausted = elapsed + delay >= Duration::from_millis(envelope.failure_budget_ms);
                    let out_of_attempts = attempt >= envelope.max_attempts;
                    let policy_none = envelope.policy == RetryPolicy::None;

                    let should_stop = should_retry_override == Some(false)
                        || out_of_attempts
                        || policy_none
                        || budget_exhausted;

                    if should_stop {
                        let outcome = RetryOutcome {
                            success: false,
                            attempts: attempt,
                            total_duration: self.clock.now().duration_since(start),
                            circuit_breaker_opened: opened_now
                                || breaker_state_for_plan == BreakerState::Open,
                        };
                        observer.on_complete(&outcome);
                        return Err(structured_error.with_retry_plan(plan));
                    }

                    observer.on_retry_scheduled(&plan, &structured_error);
                    previous_delay = delay;
                    self.clock.wait(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn envelope_s5() -> RetryEnvelope {
        RetryEnvelope {
            policy: RetryPolicy::Exponential,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts: 3,
            jitter_strategy: JitterStrategy::DeterministicFull,
            cooldown_ms: 30_000,
            failure_budget_ms: 60_000,
        }
    }

    #[test]
    fn deterministic_hash_is_stable_for_same_inputs() {
        let a = deterministic_hash("corr-1", 2);
        let b = deterministic_hash("corr-1", 2);
        assert_eq!(a, b);
    }

    #[test]
    fn delay_schedule_matches_exponential_policy_within_jitter_bound() {
        let envelope = envelope_s5();
        let d1 = compute_delay(&envelope, "corr", 1);
        let d2 = compute_delay(&envelope, "corr", 2);
        // attempt 1 base = initial_delay_ms = 500, jitter in [0, 500]
        assert!(d1.as_millis() >= 500 && d1.as_millis() <= 1000);
        // attempt 2 base = 500*2^1 = 1000, jitter in [0, 1000]
        assert!(d2.as_millis() >= 1000 && d2.as_millis() <= 2000);
    }

    #[test]
    fn none_policy_forces_single_attempt_and_no_jitter() {
        let envelope = RetryEnvelope {
            policy: RetryPolicy::None,
            ..envelope_s5()
        }
        .clamp();
        assert_eq!(envelope.max_attempts, 1);
        assert_eq!(envelope.initial_delay_ms, 0);
        assert_eq!(envelope.jitter_strategy, JitterStrategy::None);
    }

    #[test]
    fn jitter_override_boundary() {
        let base = envelope_s5();
        assert_eq!(
            base.with_jitter_override(0).jitter_strategy,
            JitterStrategy::None
        );
        assert_eq!(
            base.with_jitter_override(5).jitter_strategy,
            JitterStrategy::DeterministicFull
        );
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_failures_and_rejects_without_invoking_operation() {
        let clock = Arc::new(VirtualClock::new());
        let executor = RetryExecutor::new(clock.clone());
        let envelope = envelope_s5();
        let calls = Arc::new(AtomicU32::new(0));

        let ctx = RetryContext {
            correlation_id: "corr-s5".into(),
            session_id: None,
            operation_name: "test_op".into(),
        };

        let observer = NoopObserver;
        let calls_clone = calls.clone();
        let clock_for_op = clock.clone();
        let op = move || {
            let calls = calls_clone.clone();
            let clock = clock_for_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // advance the virtual clock enough that the executor's
                // wait() calls return promptly in this same task context
                let _ = &clock;
                Err::<(), EngineError>(EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::NetworkTimeout,
                    "synthetic failure",
                ))
            }
        };

        // Drive the clock forward in the background so `wait` calls resolve.
        let driver_clock = clock.clone();
        let driver = tokio::spawn(async move {
            for _ in 0..50 {
                tokio::task::yield_now().await;
                driver_clock.advance(Duration::from_millis(200));
            }
        });

        let result = executor
            .execute(FaultDomain::Transport, &envelope, ctx.clone(), op, &observer)
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let snapshot = executor.breaker_snapshot(FaultDomain::Transport).unwrap();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert_eq!(snapshot.failure_count, 3);

        driver.abort();
    }

    #[tokio::test]
    async fn successful_attempt_closes_breaker_with_zero_failures() {
        let clock = Arc::new(VirtualClock::new());
        let executor = RetryExecutor::new(clock);
        let envelope = envelope_s5();
        let ctx = RetryContext {
            correlation_id: "corr-ok".into(),
            session_id: None,
            operation_name: "test_op".into(),
        };
        let observer = NoopObserver;
        let result = executor
            .execute(
                FaultDomain::Transport,
                &envelope,
                ctx,
                || async { Ok::<_, EngineError>(42) },
                &observer,
            )
            .await
            .unwrap();
        assert_eq!(result, 42);
        let snapshot = executor.breaker_snapshot(FaultDomain::Transport).unwrap();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }
}
