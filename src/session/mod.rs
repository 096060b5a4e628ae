//! C4 — Session Manager & Credential Service.
//!
//! Issues and rotates short-lived credentials, owns the single active
//! session's lifecycle (`Starting -> Active -> Renewing -> Ending`), and
//! starts/stops the heartbeat, inactivity, and renewal timers. Transport and
//! the turn-taking engine are instantiated on top of an active session by the
//! composing root (see `crate::engine`), not by this module directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult, ErrorCode, FaultDomain, Redacted};
use crate::retry::{NoopObserver, RetryContext, RetryEnvelope, RetryExecutor};
use crate::transport::types::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Ephemeral authentication material for one realtime session.
///
/// Invariant: `issued_at < refresh_at < expires_at`.
#[derive(Clone)]
pub struct EphemeralKey {
    pub key: Redacted<String>,
    pub session_id: SessionId,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub refresh_at: Instant,
    pub refresh_interval_seconds: u64,
}

impl EphemeralKey {
    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn seconds_remaining(&self, now: Instant) -> i64 {
        self.expires_at
            .checked_duration_since(now)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_else(|| -(now.duration_since(self.expires_at).as_secs() as i64))
    }

    /// A credential is safe to start/continue a session with only if at
    /// least `safety_margin` remains before expiry.
    pub fn is_safe(&self, now: Instant, safety_margin: Duration) -> bool {
        self.expires_at
            .checked_duration_since(now)
            .map(|remaining| remaining >= safety_margin)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialServiceConfig {
    pub issuance_url: String,
    pub safety_margin: Duration,
    pub renewal_margin_seconds: u64,
    pub expiry_seconds: u64,
}

impl Default for CredentialServiceConfig {
    fn default() -> Self {
        Self {
            issuance_url: String::new(),
            safety_margin: Duration::from_secs(10),
            renewal_margin_seconds: 10,
            expiry_seconds: 60,
        }
    }
}

/// Observer hooks for credential lifecycle events. Default no-ops so callers
/// only override what they need, matching `RetryObserver`'s shape.
pub trait CredentialObserver: Send + Sync {
    fn on_key_renewed(&self, _key: &EphemeralKey) {}
    fn on_key_expired(&self, _session_id: &SessionId) {}
    fn on_authentication_error(&self, _error: &EngineError) {}
}

pub struct NoopCredentialObserver;
impl CredentialObserver for NoopCredentialObserver {}

#[derive(Deserialize)]
struct IssuanceResponse {
    key: String,
    #[serde(default)]
    expires_in_seconds: Option<u64>,
}

/// Contacts the remote issuance endpoint for ephemeral keys, routed through
/// the C1 retry executor under the `Auth` fault domain — credential requests
/// never bypass the circuit breaker.
pub struct CredentialService<C: Clock + 'static> {
    config: CredentialServiceConfig,
    bearer_token: Redacted<String>,
    http: reqwest::Client,
    clock: Arc<C>,
    retry: Arc<RetryExecutor<C>>,
    retry_envelope: RetryEnvelope,
}

impl<C: Clock + 'static> CredentialService<C> {
    pub fn new(
        config: CredentialServiceConfig,
        bearer_token: Redacted<String>,
        clock: Arc<C>,
        retry: Arc<RetryExecutor<C>>,
        retry_envelope: RetryEnvelope,
    ) -> Self {
        Self {
            config,
            bearer_token,
            http: reqwest::Client::new(),
            clock,
            retry,
            retry_envelope,
        }
    }

    #[instrument(skip(self))]
    pub async fn request_ephemeral_key(&self, session_id: SessionId) -> EngineResult<EphemeralKey> {
        let http = self.http.clone();
        let url = self.config.issuance_url.clone();
        let token = self.bearer_token.expose().clone();

        let ctx = RetryContext {
            correlation_id: session_id.0.clone(),
            session_id: Some(session_id.0.clone()),
            operation_name: "request_ephemeral_key".to_string(),
        };

        let observer = NoopObserver;
        let response = self
            .retry
            .execute(
                FaultDomain::Auth,
                &self.retry_envelope,
                ctx,
                move || {
                    let http = http.clone();
                    let url = url.clone();
                    let token = token.clone();
                    async move {
                        let resp = http
                            .post(&url)
                            .bearer_auth(&token)
                            .send()
                            .await
                            .map_err(|e| {
                                EngineError::new(
                                    FaultDomain::Auth,
                                    ErrorCode::AuthenticationFailed,
                                    format!("ephemeral key request failed: {e}"),
                                )
                            })?;
                        if !resp.status().is_success() {
                            return Err(EngineError::new(
                                FaultDomain::Auth,
                                ErrorCode::AuthenticationFailed,
                                format!("issuance endpoint returned {}", resp.status()),
                            ));
                        }
                        resp.json::<IssuanceResponse>().await.map_err(|e| {
                            EngineError::new(
                                FaultDomain::Auth,
                                ErrorCode::AuthenticationFailed,
                                format!("failed to parse issuance response: {e}"),
                            )
                        })
                    }
                },
                &observer,
            )
            .await?;

        let now = self.clock.now();
        let expiry_seconds = response.expires_in_seconds.unwrap_or(self.config.expiry_seconds);
        let expires_at = now + Duration::from_secs(expiry_seconds);
        let refresh_margin = Duration::from_secs(self.config.renewal_margin_seconds);
        let refresh_at = expires_at
            .checked_sub(refresh_margin)
            .unwrap_or(now);

        Ok(EphemeralKey {
            key: Redacted(response.key),
            session_id,
            issued_at: now,
            expires_at,
            refresh_at,
            refresh_interval_seconds: expiry_seconds,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Renewing,
    Paused,
    Ending,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextScheduledEvent {
    Heartbeat,
    InactivityTimeout,
    CredentialRenewal,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDiagnostics {
    pub session_id: Option<SessionId>,
    pub state: SessionState,
    pub credential_seconds_remaining: Option<i64>,
    pub last_error: Option<String>,
    pub next_scheduled_event: NextScheduledEvent,
    pub renewals: u64,
    pub failed_renewals: u64,
    pub heartbeats: u64,
    pub inactivity_resets: u64,
    pub avg_renewal_latency_ms: f64,
    pub total_duration_ms: u64,
    pub connection_status: Option<ConnectionState>,
}

#[derive(Debug, Default)]
struct SessionStats {
    renewals: u64,
    failed_renewals: u64,
    heartbeats: u64,
    inactivity_resets: u64,
    renewal_latency_total_ms: u64,
    started_at: Option<Instant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTimersConfig {
    pub heartbeat_interval: Duration,
    pub inactivity_timeout: Duration,
}

impl Default for SessionTimersConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started { session_id: SessionId },
    Renewed { session_id: SessionId },
    Ended { session_id: SessionId },
    Error { session_id: Option<SessionId>, message: String },
    StateChanged { previous: SessionState, current: SessionState },
}

struct ActiveSession {
    session_id: SessionId,
    credential: EphemeralKey,
    timers: Vec<tokio::task::JoinHandle<()>>,
    last_activity: Arc<Mutex<Instant>>,
}

/// Owns the single active session for this engine instance. Only one session
/// may be active at a time per the data model.
pub struct SessionManager<C: Clock + 'static> {
    clock: Arc<C>,
    credential_service: CredentialService<C>,
    timers_config: SessionTimersConfig,
    state: Mutex<SessionState>,
    active: Mutex<Option<ActiveSession>>,
    last_error: Mutex<Option<String>>,
    events_tx: broadcast::Sender<SessionEvent>,
    stats: Mutex<SessionStats>,
    connection_status: Mutex<Option<ConnectionState>>,
}

impl<C: Clock + 'static> SessionManager<C> {
    pub fn new(
        clock: Arc<C>,
        credential_service: CredentialService<C>,
        timers_config: SessionTimersConfig,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(128);
        Arc::new(Self {
            clock,
            credential_service,
            timers_config,
            state: Mutex::new(SessionState::Idle),
            active: Mutex::new(None),
            last_error: Mutex::new(None),
            events_tx,
            stats: Mutex::new(SessionStats::default()),
            connection_status: Mutex::new(None),
        })
    }

    /// The active session's ephemeral credential, exposed so the composing
    /// root can authenticate `RealtimeTransport` with it. Distinct from the
    /// bearer token `CredentialService` uses to contact the issuance
    /// endpoint itself.
    pub fn current_bearer_token(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.credential.key.expose().clone())
    }

    pub fn set_connection_status(&self, state: ConnectionState) {
        *self.connection_status.lock() = Some(state);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, new_state: SessionState) {
        let previous = {
            let mut guard = self.state.lock();
            let previous = *guard;
            *guard = new_state;
            previous
        };
        if previous != new_state {
            let _ = self.events_tx.send(SessionEvent::StateChanged { previous, current: new_state });
        }
    }

    /// Observed audio/heartbeat activity resets the inactivity timer by
    /// bumping `last_activity`; the inactivity task reads it each tick.
    pub fn record_activity(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            *active.last_activity.lock() = self.clock.now();
            self.stats.lock().inactivity_resets += 1;
        }
    }

    #[instrument(skip(self))]
    pub async fn start_session(self: &Arc<Self>) -> EngineResult<SessionId> {
        if self.state() != SessionState::Idle {
            return Err(EngineError::new(
                FaultDomain::Session,
                ErrorCode::ConfigurationInvalid,
                "a session is already active; end it before starting a new one",
            ));
        }

        self.set_state(SessionState::Starting);
        let session_id = SessionId::new();

        let credential = self.credential_service.request_ephemeral_key(session_id.clone()).await?;
        if !credential.is_safe(self.clock.now(), self.credential_service.config.safety_margin) {
            self.set_state(SessionState::Failed);
            return Err(EngineError::new(
                FaultDomain::Auth,
                ErrorCode::AuthenticationFailed,
                "issued credential does not satisfy the safety margin",
            ));
        }

        let last_activity = Arc::new(Mutex::new(self.clock.now()));
        let mut timers = Vec::new();
        timers.push(self.spawn_heartbeat_timer());
        timers.push(self.spawn_inactivity_timer(last_activity.clone()));
        timers.push(self.spawn_renewal_timer(session_id.clone(), credential.refresh_at));

        *self.active.lock() = Some(ActiveSession {
            session_id: session_id.clone(),
            credential,
            timers,
            last_activity,
        });
        *self.stats.lock() = SessionStats {
            started_at: Some(self.clock.now()),
            ..SessionStats::default()
        };
        *self.connection_status.lock() = None;

        self.set_state(SessionState::Active);
        let _ = self.events_tx.send(SessionEvent::Started { session_id: session_id.clone() });
        info!(session_id = %session_id.0, "session started");
        Ok(session_id)
    }

    fn spawn_heartbeat_timer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = self.timers_config.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                this.clock.wait(interval).await;
                if this.state() != SessionState::Active && this.state() != SessionState::Renewing {
                    return;
                }
                this.stats.lock().heartbeats += 1;
                this.record_activity();
            }
        })
    }

    fn spawn_inactivity_timer(
        self: &Arc<Self>,
        last_activity: Arc<Mutex<Instant>>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let timeout = self.timers_config.inactivity_timeout;
        tokio::spawn(async move {
            loop {
                this.clock.wait(Duration::from_secs(5).min(timeout)).await;
                let state = this.state();
                if state != SessionState::Active && state != SessionState::Renewing {
                    return;
                }
                let idle_for = this.clock.now().duration_since(*last_activity.lock());
                if idle_for >= timeout {
                    warn!("session inactive beyond timeout, ending");
                    let _ = this.end_session().await;
                    return;
                }
            }
        })
    }

    fn spawn_renewal_timer(
        self: &Arc<Self>,
        session_id: SessionId,
        refresh_at: Instant,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let now = this.clock.now();
            let delay = refresh_at.checked_duration_since(now).unwrap_or(Duration::ZERO);
            this.clock.wait(delay).await;
            if this.state() != SessionState::Active {
                return;
            }
            this.renew_credential(session_id).await;
        })
    }

    #[instrument(skip(self))]
    async fn renew_credential(self: &Arc<Self>, session_id: SessionId) {
        self.set_state(SessionState::Renewing);
        let attempt_started = self.clock.now();
        match self.credential_service.request_ephemeral_key(session_id.clone()).await {
            Ok(new_credential) => {
                let next_refresh_at = new_credential.refresh_at;
                if let Some(active) = self.active.lock().as_mut() {
                    active.credential = new_credential;
                }
                let latency_ms = self.clock.now().duration_since(attempt_started).as_millis() as u64;
                {
                    let mut stats = self.stats.lock();
                    stats.renewals += 1;
                    stats.renewal_latency_total_ms += latency_ms;
                }
                self.set_state(SessionState::Active);
                let _ = self.events_tx.send(SessionEvent::Renewed { session_id: session_id.clone() });
                let renewal_timer = self.spawn_renewal_timer(session_id, next_refresh_at);
                if let Some(active) = self.active.lock().as_mut() {
                    active.timers.push(renewal_timer);
                }
            }
            Err(err) => {
                self.stats.lock().failed_renewals += 1;
                self.set_state(SessionState::Failed);
                *self.last_error.lock() = Some(err.envelope.message.clone());
                let _ = self.events_tx.send(SessionEvent::Error {
                    session_id: Some(session_id),
                    message: err.envelope.message,
                });
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn end_session(self: &Arc<Self>) -> EngineResult<()> {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return Ok(());
        };
        self.set_state(SessionState::Ending);
        for timer in active.timers {
            timer.abort();
        }
        self.set_state(SessionState::Idle);
        let _ = self
            .events_tx
            .send(SessionEvent::Ended { session_id: active.session_id.clone() });
        info!(session_id = %active.session_id.0, "session ended");
        Ok(())
    }

    pub fn get_session_diagnostics(&self) -> SessionDiagnostics {
        let active = self.active.lock();
        let next_event = match self.state() {
            SessionState::Active => NextScheduledEvent::Heartbeat,
            SessionState::Renewing => NextScheduledEvent::CredentialRenewal,
            _ => NextScheduledEvent::None,
        };
        let stats = self.stats.lock();
        let avg_renewal_latency_ms = if stats.renewals > 0 {
            stats.renewal_latency_total_ms as f64 / stats.renewals as f64
        } else {
            0.0
        };
        let total_duration_ms = stats
            .started_at
            .map(|started| self.clock.now().duration_since(started).as_millis() as u64)
            .unwrap_or(0);
        SessionDiagnostics {
            session_id: active.as_ref().map(|a| a.session_id.clone()),
            state: self.state(),
            credential_seconds_remaining: active
                .as_ref()
                .map(|a| a.credential.seconds_remaining(self.clock.now())),
            last_error: self.last_error.lock().clone(),
            next_scheduled_event: next_event,
            renewals: stats.renewals,
            failed_renewals: stats.failed_renewals,
            heartbeats: stats.heartbeats,
            inactivity_resets: stats.inactivity_resets,
            avg_renewal_latency_ms,
            total_duration_ms,
            connection_status: *self.connection_status.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    #[test]
    fn credential_is_unsafe_below_safety_margin() {
        let clock = VirtualClock::new();
        let now = clock.now();
        let key = EphemeralKey {
            key: Redacted("secret".into()),
            session_id: SessionId::new(),
            issued_at: now,
            expires_at: now + Duration::from_secs(5),
            refresh_at: now + Duration::from_secs(2),
            refresh_interval_seconds: 5,
        };
        assert!(!key.is_safe(now, Duration::from_secs(10)));
    }

    #[test]
    fn credential_is_safe_above_safety_margin() {
        let clock = VirtualClock::new();
        let now = clock.now();
        let key = EphemeralKey {
            key: Redacted("secret".into()),
            session_id: SessionId::new(),
            issued_at: now,
            expires_at: now + Duration::from_secs(30),
            refresh_at: now + Duration::from_secs(20),
            refresh_interval_seconds: 30,
        };
        assert!(key.is_safe(now, Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn diagnostics_report_idle_before_any_session_starts() {
        let clock = Arc::new(VirtualClock::new());
        let retry = Arc::new(RetryExecutor::new(clock.clone()));
        let credential_service = CredentialService::new(
            CredentialServiceConfig::default(),
            Redacted("token".into()),
            clock.clone(),
            retry,
            RetryEnvelope::default(),
        );
        let manager = SessionManager::new(clock, credential_service, SessionTimersConfig::default());
        let diagnostics = manager.get_session_diagnostics();
        assert_eq!(diagnostics.state, SessionState::Idle);
        assert!(diagnostics.session_id.is_none());
    }
}
