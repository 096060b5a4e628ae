//! C2 — Error Event Bus & Recovery Orchestrator.
//!
//! Publishes typed errors to filtered subscribers and maps terminal failures
//! into recovery plans. Layers on top of [`crate::retry::RetryExecutor`]
//! (C1) rather than duplicating its breaker/backoff logic.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, instrument, warn};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult, ErrorCode, ErrorEnvelope, FaultDomain, Severity};
use crate::retry::{RetryContext, RetryEnvelope, RetryExecutor, RetryObserver};

/// Async callback alias, matching the donor realtime client's
/// `Arc<dyn Fn(...) -> Pin<Box<dyn Future<Output=()> + Send>> + Send + Sync>`
/// shape for observer callbacks.
pub type AsyncHandler = Arc<dyn Fn(ErrorEnvelope) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub domains: Option<HashSet<FaultDomain>>,
    pub severities: Option<HashSet<Severity>>,
    pub once: bool,
}

impl SubscriptionFilter {
    fn matches(&self, envelope: &ErrorEnvelope) -> bool {
        let domain_ok = self
            .domains
            .as_ref()
            .map(|set| set.contains(&envelope.fault_domain))
            .unwrap_or(true);
        let severity_ok = self
            .severities
            .as_ref()
            .map(|set| set.contains(&envelope.severity))
            .unwrap_or(true);
        domain_ok && severity_ok
    }
}

struct Subscription {
    id: u64,
    filter: SubscriptionFilter,
    handler: AsyncHandler,
    fired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Central error bus. Broadcast channel covers "every live subscriber sees
/// every event"; the filtered subscriber list covers once/domain/severity
/// filtering the broadcast channel alone can't express.
pub struct EventBus {
    broadcast_tx: broadcast::Sender<ErrorEnvelope>,
    subscribers: Mutex<Vec<Subscription>>,
    suppression: Mutex<HashMap<(FaultDomain, ErrorCode), Instant>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            broadcast_tx,
            subscribers: Mutex::new(Vec::new()),
            suppression: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ErrorEnvelope> {
        self.broadcast_tx.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: SubscriptionFilter, handler: AsyncHandler) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push(Subscription {
            id,
            filter,
            handler,
            fired: false,
        });
        SubscriptionHandle(id)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers.lock().retain(|s| s.id != handle.0);
    }

    /// Publish an error, annotating `notification_suppressed` when a prior
    /// publication for the same (domain, code) happened within `window`.
    #[instrument(skip(self, envelope), fields(code = ?envelope.code))]
    pub async fn publish(&self, mut envelope: ErrorEnvelope, window: Duration, clock: &dyn Clock) {
        let key = (envelope.fault_domain, envelope.code);
        let now = clock.now();
        let suppressed = {
            let mut suppression = self.suppression.lock();
            let should_suppress = suppression
                .get(&key)
                .map(|last| now.duration_since(*last) < window)
                .unwrap_or(false);
            suppression.insert(key, now);
            should_suppress
        };
        envelope.notification_suppressed = suppressed;

        let _ = self.broadcast_tx.send(envelope.clone());

        let to_run: Vec<(u64, AsyncHandler)> = {
            let mut subs = self.subscribers.lock();
            subs.retain(|s| !(s.fired && s.filter.once));
            subs.iter_mut()
                .filter(|s| s.filter.matches(&envelope) && !(s.fired && s.filter.once))
                .map(|s| {
                    if s.filter.once {
                        s.fired = true;
                    }
                    (s.id, s.handler.clone())
                })
                .collect()
        };

        for (id, handler) in to_run {
            // Handler panics are caught so one bad subscriber can't abort
            // delivery to the others, matching the "logged but does not
            // abort delivery" propagation rule.
            let envelope_clone = envelope.clone();
            let fut = handler(envelope_clone);
            if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                error!(subscriber_id = id, ?panic, "event subscriber panicked");
            }
        }

    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    SafeMode,
    DegradedFeatures,
    ManualIntervention,
}

pub struct RecoveryStep {
    pub name: String,
    pub action: Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>,
    pub compensating_action:
        Option<Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>>,
}

pub struct RecoveryPlan {
    pub steps: Vec<RecoveryStep>,
    pub fallback_mode: Option<FallbackMode>,
    pub suppression_window: Duration,
}

impl Default for RecoveryPlan {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            fallback_mode: None,
            suppression_window: Duration::from_secs(10),
        }
    }
}

type FallbackHandler = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Layers a per-domain recovery plan registry on top of C1. `execute` mirrors
/// `RetryExecutor::execute` but additionally publishes to the bus and runs
/// the recovery plan on terminal failure.
pub struct RecoveryOrchestrator<C: Clock + 'static> {
    executor: RetryExecutor<C>,
    clock: Arc<C>,
    bus: Arc<EventBus>,
    envelopes: Mutex<HashMap<FaultDomain, RetryEnvelope>>,
    plans: Mutex<HashMap<FaultDomain, Arc<RecoveryPlan>>>,
    fallback_handlers: Mutex<HashMap<FallbackMode, FallbackHandler>>,
}

impl<C: Clock + 'static> RecoveryOrchestrator<C> {
    pub fn new(clock: Arc<C>, bus: Arc<EventBus>) -> Self {
        Self {
            executor: RetryExecutor::new(clock.clone()),
            clock,
            bus,
            envelopes: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            fallback_handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_envelope(&self, domain: FaultDomain, envelope: RetryEnvelope) {
        self.envelopes.lock().insert(domain, envelope.clamp());
    }

    pub fn set_recovery_plan(&self, domain: FaultDomain, plan: RecoveryPlan) {
        self.plans.lock().insert(domain, Arc::new(plan));
    }

    pub fn register_fallback_handler(&self, mode: FallbackMode, handler: FallbackHandler) {
        self.fallback_handlers.lock().insert(mode, handler);
    }

    fn resolve_envelope(&self, domain: FaultDomain, override_env: Option<RetryEnvelope>) -> RetryEnvelope {
        let registry_default = self
            .envelopes
            .lock()
            .get(&domain)
            .copied()
            .unwrap_or_default();
        match override_env {
            Some(o) => o.clamp(),
            None => registry_default,
        }
    }

    #[instrument(skip(self, operation, override_env), fields(domain = ?domain))]
    pub async fn execute<F, Fut, T>(
        &self,
        domain: FaultDomain,
        correlation_id: String,
        override_env: Option<RetryEnvelope>,
        operation: F,
    ) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let envelope = self.resolve_envelope(domain, override_env);
        let bus = self.bus.clone();
        let clock = self.clock.clone();
        let plan_registry = self.plans.lock().get(&domain).cloned();

        struct Bridge {
            bus: Arc<EventBus>,
            clock_now_fn: Arc<dyn Clock>,
            suppression_window: Duration,
        }

        impl RetryObserver for Bridge {
            fn on_failure(
                &self,
                error: EngineError,
                plan: &crate::retry::RetryPlan,
            ) -> (EngineError, Option<bool>) {
                let mut envelope = error.envelope;
                envelope.retry_plan = Some(plan.clone());
                let should_retry = if plan.policy == crate::retry::RetryPolicy::None {
                    Some(false)
                } else {
                    None
                };
                let bus = self.bus.clone();
                let clock = self.clock_now_fn.clone();
                let window = self.suppression_window;
                let publish_envelope = envelope.clone();
                tokio::spawn(async move {
                    bus.publish(publish_envelope, window, clock.as_ref()).await;
                });
                (EngineError::from_envelope(envelope), should_retry)
            }

            fn on_circuit_open(&self, domain: FaultDomain) -> Option<EngineError> {
                Some(EngineError::new(
                    domain,
                    ErrorCode::RetryCircuitOpen,
                    format!("{domain:?}_CIRCUIT_OPEN"),
                ))
            }
        }

        let suppression_window = plan_registry
            .as_ref()
            .map(|p| p.suppression_window)
            .unwrap_or(Duration::from_secs(10));

        let bridge = Bridge {
            bus: bus.clone(),
            clock_now_fn: clock.clone(),
            suppression_window,
        };

        let ctx = RetryContext {
            correlation_id: correlation_id.clone(),
            session_id: None,
            operation_name: format!("{domain:?}"),
        };

        let result = self.executor.execute(domain, &envelope, ctx, operation, &bridge).await;

        if let Err(ref err) = result {
            if let Some(plan) = plan_registry {
                self.run_recovery_plan(&plan).await;
            }
        }

        result
    }

    async fn run_recovery_plan(&self, plan: &RecoveryPlan) {
        for step in &plan.steps {
            let success = (step.action)().await;
            if !success {
                warn!(step = %step.name, "recovery step failed");
                if let Some(compensate) = &step.compensating_action {
                    compensate().await;
                }
            }
        }
        if let Some(mode) = plan.fallback_mode {
            let handler = self.fallback_handlers.lock().get(&mode).cloned();
            if let Some(handler) = handler {
                handler().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn suppression_window_annotates_repeat_publications() {
        let bus = EventBus::new();
        let clock = VirtualClock::new();
        let envelope = ErrorEnvelope::new(FaultDomain::Transport, ErrorCode::NetworkTimeout, "boom");

        bus.publish(envelope.clone(), Duration::from_secs(10), &clock).await;
        let mut rx = bus.subscribe();
        bus.publish(envelope, Duration::from_secs(10), &clock).await;
        let received = rx.recv().await.unwrap();
        assert!(received.notification_suppressed);
    }

    #[tokio::test]
    async fn once_subscriber_fires_exactly_once() {
        let bus = EventBus::new();
        let clock = VirtualClock::new();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();

        bus.subscribe_filtered(
            SubscriptionFilter {
                once: true,
                ..Default::default()
            },
            Arc::new(move |_env| {
                let count = count_clone.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        let envelope = ErrorEnvelope::new(FaultDomain::Audio, ErrorCode::AudioTrackFailed, "x");
        bus.publish(envelope.clone(), Duration::ZERO, &clock).await;
        bus.publish(envelope, Duration::ZERO, &clock).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_abort_delivery_to_others() {
        let bus = EventBus::new();
        let clock = VirtualClock::new();
        let second_ran = Arc::new(AtomicBool::new(false));
        let second_ran_clone = second_ran.clone();

        bus.subscribe_filtered(
            SubscriptionFilter::default(),
            Arc::new(|_env| Box::pin(async { panic!("synthetic subscriber panic") })),
        );
        bus.subscribe_filtered(
            SubscriptionFilter::default(),
            Arc::new(move |_env| {
                let flag = second_ran_clone.clone();
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                })
            }),
        );

        let envelope = ErrorEnvelope::new(FaultDomain::Session, ErrorCode::SessionRenewalFailed, "x");
        bus.publish(envelope, Duration::ZERO, &clock).await;

        assert!(second_ran.load(Ordering::SeqCst));
    }
}
