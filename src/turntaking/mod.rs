//! C5 — Turn-Taking & Interruption Engine (ITE).
//!
//! The authoritative conversational-state machine. Fuses server-side VAD
//! events with client heuristics, enforces the single-speaker turn token,
//! performs barge-in within a strict latency budget, and falls back when the
//! VAD source degrades.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult, ErrorCode, FaultDomain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadSource {
    AzureVad,
    ClientHint,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyProfile {
    Default,
    Assertive,
    HandsFree,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    Manual,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InterruptionPolicy {
    pub profile: PolicyProfile,
    pub allow_barge_in: bool,
    pub interruption_budget_ms: u64,
    pub completion_grace_ms: u64,
    pub speech_stop_debounce_ms: u64,
    pub fallback_mode: FallbackMode,
    pub expect_response: bool,
    /// Window enforced after >=3 interruptions within 60s before further
    /// barge-ins are permitted again; distinct from `completion_grace_ms`.
    pub cooldown_window_ms: u64,
}

impl Default for InterruptionPolicy {
    fn default() -> Self {
        Self {
            profile: PolicyProfile::Default,
            allow_barge_in: true,
            interruption_budget_ms: 250,
            completion_grace_ms: 150,
            speech_stop_debounce_ms: 200,
            fallback_mode: FallbackMode::Hybrid,
            expect_response: true,
            cooldown_window_ms: 2000,
        }
    }
}

impl InterruptionPolicy {
    /// Guardrail clamps: `interruption_budget_ms <= 750`,
    /// `speech_stop_debounce_ms >= 150`. Out-of-range configuration is
    /// clamped rather than rejected outright.
    pub fn clamp(mut self) -> Self {
        self.interruption_budget_ms = self.interruption_budget_ms.min(750);
        self.speech_stop_debounce_ms = self.speech_stop_debounce_ms.max(150);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptionInfo {
    pub kind: &'static str,
    pub detected_at: u64,
    pub latency_ms: u64,
    pub source: VadSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDescriptor {
    pub turn_id: String,
    pub role: Role,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub interruption: Option<InterruptionInfo>,
    pub policy_profile: PolicyProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechEventKind {
    UserSpeechStart,
    UserSpeechStop,
    AssistantSpeechStart,
    AssistantSpeechStop,
    VadDegraded,
}

#[derive(Debug, Clone, Copy)]
pub struct SpeechEvent {
    pub kind: SpeechEventKind,
    pub source: VadSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEventKind {
    Started,
    Ended,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDiagnostics {
    pub avg_start_latency_ms: f64,
    pub avg_stop_latency_ms: f64,
    pub missed_events: u64,
    pub fallback_active: bool,
    pub state: ConversationState,
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    StateChanged {
        previous: ConversationState,
        current: ConversationState,
    },
    TurnEnded(TurnDescriptor),
    TurnStarted(TurnDescriptor),
    Degraded,
    ResponseCreateRequested,
    AssistantYieldRequested { reason: String },
}

/// Hook into the TTS collaborator's cancellation path; invoked synchronously
/// on barge-in before the transport-level cancel events are sent.
pub trait TtsCancellationHook: Send + Sync {
    fn cancel(&self);
}

pub struct NoopCancellationHook;
impl TtsCancellationHook for NoopCancellationHook {
    fn cancel(&self) {}
}

struct Latencies {
    start_samples: VecDeque<u64>,
    stop_samples: VecDeque<u64>,
}

impl Latencies {
    fn new() -> Self {
        Self {
            start_samples: VecDeque::with_capacity(32),
            stop_samples: VecDeque::with_capacity(32),
        }
    }

    fn push_start(&mut self, ms: u64) {
        if self.start_samples.len() >= 32 {
            self.start_samples.pop_front();
        }
        self.start_samples.push_back(ms);
    }

    fn push_stop(&mut self, ms: u64) {
        if self.stop_samples.len() >= 32 {
            self.stop_samples.pop_front();
        }
        self.stop_samples.push_back(ms);
    }

    fn avg(samples: &VecDeque<u64>) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<u64>() as f64 / samples.len() as f64
    }
}

struct Interruptions {
    timestamps: VecDeque<Instant>,
}

impl Interruptions {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
        }
    }

    /// Record a barge-in and report whether cooldown should now engage
    /// (>= 3 interruptions within the trailing 60s window).
    fn record_and_check_cooldown(&mut self, now: Instant) -> bool {
        self.timestamps.push_back(now);
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.len() >= 3
    }
}

struct Inner {
    state: ConversationState,
    pre_degradation_state: Option<ConversationState>,
    current_turn: Option<TurnDescriptor>,
    pending_user_turn: bool,
    policy: InterruptionPolicy,
    last_vad_event_at: Instant,
    cooldown_until: Option<Instant>,
    fallback_active: bool,
    degraded: bool,
    missed_events: u64,
}

/// Conversational state machine plus barge-in/cooldown/degradation policy
/// enforcement. One instance owns exactly one active session's turn state.
pub struct TurnTakingEngine<C: Clock + 'static> {
    clock: Arc<C>,
    epoch: Instant,
    inner: Mutex<Inner>,
    latencies: Mutex<Latencies>,
    interruptions: Mutex<Interruptions>,
    cancellation_hook: Arc<dyn TtsCancellationHook>,
    events_tx: broadcast::Sender<TurnEvent>,
}

impl<C: Clock + 'static> TurnTakingEngine<C> {
    pub fn new(clock: Arc<C>, policy: InterruptionPolicy, cancellation_hook: Arc<dyn TtsCancellationHook>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let now = clock.now();
        Arc::new(Self {
            clock,
            epoch: now,
            inner: Mutex::new(Inner {
                state: ConversationState::Idle,
                pre_degradation_state: None,
                current_turn: None,
                pending_user_turn: false,
                policy: policy.clamp(),
                last_vad_event_at: now,
                cooldown_until: None,
                fallback_active: false,
                degraded: false,
                missed_events: 0,
            }),
            latencies: Mutex::new(Latencies::new()),
            interruptions: Mutex::new(Interruptions::new()),
            cancellation_hook,
            events_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events_tx.subscribe()
    }

    pub fn get_state(&self) -> TurnDiagnostics {
        let inner = self.inner.lock();
        let latencies = self.latencies.lock();
        TurnDiagnostics {
            avg_start_latency_ms: Latencies::avg(&latencies.start_samples),
            avg_stop_latency_ms: Latencies::avg(&latencies.stop_samples),
            missed_events: inner.missed_events,
            fallback_active: inner.fallback_active,
            state: inner.state,
        }
    }

    pub fn configure(&self, policy: InterruptionPolicy) {
        self.inner.lock().policy = policy.clamp();
    }

    /// Session start: Idle -> Listening.
    pub fn start(&self) {
        self.transition(ConversationState::Listening);
    }

    fn transition(&self, new_state: ConversationState) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = new_state;
            previous
        };
        if previous != new_state {
            let _ = self.events_tx.send(TurnEvent::StateChanged {
                previous,
                current: new_state,
            });
        }
    }

    fn now_ms(&self) -> u64 {
        // Monotonic millisecond counter relative to engine construction,
        // derived entirely from the clock abstraction so it stays
        // deterministic under `VirtualClock`.
        self.clock.now().duration_since(self.epoch).as_millis() as u64
    }

    /// Entry point for server/client speech events. Barge-in, hands-free
    /// queueing, graceful handoff, cooldown, and degradation are all decided
    /// here per the event kind and current state.
    #[instrument(skip(self))]
    pub async fn on_speech_event(self: &Arc<Self>, event: SpeechEvent) -> EngineResult<()> {
        let received_at = self.clock.now();
        {
            let mut inner = self.inner.lock();
            inner.last_vad_event_at = received_at;
            if inner.degraded && event.kind != SpeechEventKind::VadDegraded {
                inner.degraded = false;
                if let Some(pre) = inner.pre_degradation_state.take() {
                    drop(inner);
                    self.transition(pre);
                } else {
                    drop(inner);
                }
            }
        }

        match event.kind {
            SpeechEventKind::UserSpeechStart => self.handle_user_speech_start(event.source, received_at).await,
            SpeechEventKind::UserSpeechStop => self.handle_user_speech_stop().await,
            SpeechEventKind::AssistantSpeechStart => {
                self.transition(ConversationState::Speaking);
                Ok(())
            }
            SpeechEventKind::AssistantSpeechStop => Ok(()),
            SpeechEventKind::VadDegraded => {
                self.handle_vad_degraded(event.source).await;
                Ok(())
            }
        }
    }

    async fn handle_user_speech_start(self: &Arc<Self>, source: VadSource, received_at: Instant) -> EngineResult<()> {
        let state = self.inner.lock().state;
        let (allow_barge_in, in_cooldown) = {
            let inner = self.inner.lock();
            let in_cooldown = inner.cooldown_until.map(|u| self.clock.now() < u).unwrap_or(false);
            (inner.policy.allow_barge_in, in_cooldown)
        };

        if state == ConversationState::Speaking {
            if !allow_barge_in {
                self.inner.lock().pending_user_turn = true;
                return Ok(());
            }
            if in_cooldown {
                warn!("barge-in suppressed by cooldown window");
                return Ok(());
            }
            return self.execute_barge_in(source, received_at).await;
        }

        self.begin_user_turn();
        self.transition(ConversationState::Listening);
        Ok(())
    }

    /// Steps 1-3 of the barge-in rule. The interval between event receipt and
    /// cancellation-event issuance is tracked in `latency_ms` and must stay
    /// within `interruption_budget_ms` (hard cap 750ms enforced by `clamp`).
    async fn execute_barge_in(self: &Arc<Self>, source: VadSource, received_at: Instant) -> EngineResult<()> {
        self.cancellation_hook.cancel();
        let _ = self.events_tx.send(TurnEvent::AssistantYieldRequested {
            reason: "barge-in".to_string(),
        });

        let latency_ms = self.clock.now().duration_since(received_at).as_millis() as u64;
        let budget_ms = self.inner.lock().policy.interruption_budget_ms;
        if latency_ms > budget_ms.max(750) {
            warn!(latency_ms, "barge-in cancellation issued outside hard budget");
        }
        self.latencies.lock().push_stop(latency_ms);

        let ended_turn = {
            let mut inner = self.inner.lock();
            inner.current_turn.take().map(|mut turn| {
                turn.ended_at = Some(self.now_ms());
                turn.interruption = Some(InterruptionInfo {
                    kind: "barge-in",
                    detected_at: self.now_ms(),
                    latency_ms,
                    source,
                });
                turn
            })
        };
        if let Some(turn) = ended_turn {
            let _ = self.events_tx.send(TurnEvent::TurnEnded(turn));
        }

        let should_cooldown = self.interruptions.lock().record_and_check_cooldown(self.clock.now());
        if should_cooldown {
            let cooldown_window = self.inner.lock().policy.cooldown_window_ms;
            self.inner.lock().cooldown_until = Some(self.clock.now() + Duration::from_millis(cooldown_window));
        }

        self.begin_user_turn();
        self.transition(ConversationState::Listening);
        Ok(())
    }

    fn begin_user_turn(&self) {
        let profile = self.inner.lock().policy.profile;
        let turn = TurnDescriptor {
            turn_id: Uuid::new_v4().to_string(),
            role: Role::User,
            started_at: self.now_ms(),
            ended_at: None,
            interruption: None,
            policy_profile: profile,
        };
        self.inner.lock().current_turn = Some(turn.clone());
        let _ = self.events_tx.send(TurnEvent::TurnStarted(turn));
    }

    /// Graceful handoff: `Listening -> Thinking`, emitting `response.create`
    /// unless a response is already underway. Transcript finalization itself
    /// is driven by the STT collaborator and observed externally via
    /// `grant_assistant_turn`.
    async fn handle_user_speech_stop(self: &Arc<Self>) -> EngineResult<()> {
        let expect_response = self.inner.lock().policy.expect_response;
        if !expect_response {
            return Ok(());
        }
        self.transition(ConversationState::Thinking);
        let already_underway = self
            .inner
            .lock()
            .current_turn
            .as_ref()
            .map(|t| t.role == Role::Assistant && t.ended_at.is_none())
            .unwrap_or(false);
        if !already_underway {
            let _ = self.events_tx.send(TurnEvent::ResponseCreateRequested);
        }
        Ok(())
    }

    async fn handle_vad_degraded(self: &Arc<Self>, _source: VadSource) {
        let fallback_mode = self.inner.lock().policy.fallback_mode;
        let already_degraded = self.inner.lock().degraded;
        if already_degraded {
            return;
        }
        match fallback_mode {
            FallbackMode::Hybrid => {
                let pre = {
                    let mut inner = self.inner.lock();
                    inner.degraded = true;
                    inner.pre_degradation_state = Some(inner.state);
                    inner.state
                };
                let _ = pre;
                self.transition(ConversationState::Recovering);
                let _ = self.events_tx.send(TurnEvent::Degraded);
            }
            FallbackMode::Manual => {
                self.inner.lock().degraded = true;
                let _ = self.events_tx.send(TurnEvent::Degraded);
            }
        }
    }

    /// Degradation watchdog: if no server VAD event has arrived for more than
    /// 5s while in Hybrid mode, trigger the same fallback path as an explicit
    /// `vad-degraded` event. Intended to be polled periodically by the owner
    /// (e.g. alongside the session heartbeat).
    pub fn check_vad_staleness(self: &Arc<Self>) -> bool {
        let stale = {
            let inner = self.inner.lock();
            !inner.degraded && self.clock.now().duration_since(inner.last_vad_event_at) > Duration::from_secs(5)
        };
        if stale {
            let this = self.clone();
            tokio::spawn(async move {
                this.handle_vad_degraded(VadSource::ClientHint).await;
            });
        }
        stale
    }

    pub async fn on_playback_event(self: &Arc<Self>, kind: PlaybackEventKind) {
        if kind == PlaybackEventKind::Ended {
            let pending = {
                let mut inner = self.inner.lock();
                let pending = inner.pending_user_turn;
                inner.pending_user_turn = false;
                pending
            };
            if pending {
                self.begin_user_turn();
                self.transition(ConversationState::Listening);
            }
        }
    }

    /// Rejects `grant_assistant_turn` while a user turn is active and not yet
    /// ended, enforcing single-speaker mutual exclusion.
    pub fn grant_assistant_turn(&self) -> EngineResult<()> {
        let user_turn_active = self
            .inner
            .lock()
            .current_turn
            .as_ref()
            .map(|t| t.role == Role::User && t.ended_at.is_none())
            .unwrap_or(false);
        if user_turn_active {
            return Err(EngineError::new(
                FaultDomain::Session,
                ErrorCode::TurnTokenViolation,
                "cannot grant assistant turn while a user turn is active",
            ));
        }
        let turn = TurnDescriptor {
            turn_id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            started_at: self.now_ms(),
            ended_at: None,
            interruption: None,
            policy_profile: self.inner.lock().policy.profile,
        };
        self.inner.lock().current_turn = Some(turn.clone());
        let _ = self.events_tx.send(TurnEvent::TurnStarted(turn));
        self.transition(ConversationState::Speaking);
        Ok(())
    }

    pub fn request_assistant_yield(&self, reason: impl Into<String>) {
        self.cancellation_hook.cancel();
        let _ = self.events_tx.send(TurnEvent::AssistantYieldRequested { reason: reason.into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    fn engine() -> Arc<TurnTakingEngine<VirtualClock>> {
        let clock = Arc::new(VirtualClock::new());
        TurnTakingEngine::new(clock, InterruptionPolicy::default(), Arc::new(NoopCancellationHook))
    }

    #[tokio::test]
    async fn barge_in_ends_current_turn_with_interruption_info() {
        let engine = engine();
        engine.start();
        engine.grant_assistant_turn().unwrap();
        assert_eq!(engine.get_state().state, ConversationState::Speaking);

        let mut rx = engine.subscribe();
        engine
            .on_speech_event(SpeechEvent {
                kind: SpeechEventKind::UserSpeechStart,
                source: VadSource::AzureVad,
            })
            .await
            .unwrap();

        assert_eq!(engine.get_state().state, ConversationState::Listening);
        let mut saw_turn_ended_with_interruption = false;
        while let Ok(event) = rx.try_recv() {
            if let TurnEvent::TurnEnded(turn) = event {
                if turn.interruption.is_some() {
                    saw_turn_ended_with_interruption = true;
                }
            }
        }
        assert!(saw_turn_ended_with_interruption);
    }

    #[tokio::test]
    async fn hands_free_profile_queues_speech_until_playback_ends() {
        let clock = Arc::new(VirtualClock::new());
        let mut policy = InterruptionPolicy::default();
        policy.allow_barge_in = false;
        let engine = TurnTakingEngine::new(clock, policy, Arc::new(NoopCancellationHook));
        engine.start();
        engine.grant_assistant_turn().unwrap();

        engine
            .on_speech_event(SpeechEvent {
                kind: SpeechEventKind::UserSpeechStart,
                source: VadSource::AzureVad,
            })
            .await
            .unwrap();
        assert_eq!(engine.get_state().state, ConversationState::Speaking);

        engine.on_playback_event(PlaybackEventKind::Ended).await;
        assert_eq!(engine.get_state().state, ConversationState::Listening);
    }

    #[tokio::test]
    async fn grant_assistant_turn_rejected_while_user_turn_active() {
        let engine = engine();
        engine.start();
        engine
            .on_speech_event(SpeechEvent {
                kind: SpeechEventKind::UserSpeechStart,
                source: VadSource::AzureVad,
            })
            .await
            .unwrap();
        let result = engine.grant_assistant_turn();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn three_interruptions_within_60s_trigger_cooldown() {
        let engine = engine();
        engine.start();
        for _ in 0..3 {
            engine.grant_assistant_turn().unwrap();
            engine
                .on_speech_event(SpeechEvent {
                    kind: SpeechEventKind::UserSpeechStart,
                    source: VadSource::AzureVad,
                })
                .await
                .unwrap();
        }
        let in_cooldown = engine.inner.lock().cooldown_until.is_some();
        assert!(in_cooldown);
    }
}
