//! Top-level composition root.
//!
//! Wires C1 -> C2 -> C3 -> C4 -> C5 in initialization order and tears them
//! down in reverse. `Engine` itself owns no conversational logic; it only
//! holds the shared clock/config and exposes accessors for the instantiated
//! components once `initialize` has run.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::clock::{Clock, TokioClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorCode, FaultDomain, Redacted};
use crate::events::{EventBus, RecoveryOrchestrator};
use crate::retry::RetryExecutor;
use crate::session::{CredentialService, CredentialServiceConfig, SessionManager, SessionTimersConfig};
use crate::transport::protocol::OutboundDataChannelEvent;
use crate::transport::types::TransportEvent;
use crate::transport::RealtimeTransport;
use crate::turntaking::{InterruptionPolicy, NoopCancellationHook, TurnEvent, TurnTakingEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Uninitialized,
    Initialized,
    Disposed,
}

/// Composition root. Operations other than `initialize`/`dispose` are
/// rejected before `initialize` has run, per the initialize-then-dispose
/// discipline every component implements.
pub struct Engine<C: Clock + 'static = TokioClock> {
    config: EngineConfig,
    clock: Arc<C>,
    lifecycle: Mutex<LifecycleState>,
    retry_executor: Arc<RetryExecutor<C>>,
    event_bus: Arc<EventBus>,
    recovery_orchestrator: Arc<RecoveryOrchestrator<C>>,
    session_manager: Mutex<Option<Arc<SessionManager<C>>>>,
    turn_taking: Mutex<Option<Arc<TurnTakingEngine<C>>>>,
    transport: Mutex<Option<Arc<RealtimeTransport>>>,
    bridge_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<C: Clock + 'static> Engine<C> {
    pub fn new(config: EngineConfig, clock: Arc<C>) -> EngineResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| EngineError::new(FaultDomain::Infrastructure, ErrorCode::ConfigurationInvalid, e.to_string()))?;

        // C1
        let retry_executor = Arc::new(RetryExecutor::new(clock.clone()));
        // C2
        let event_bus = Arc::new(EventBus::new());
        let recovery_orchestrator = Arc::new(RecoveryOrchestrator::new(clock.clone(), event_bus.clone()));

        Ok(Arc::new(Self {
            config,
            clock,
            lifecycle: Mutex::new(LifecycleState::Uninitialized),
            retry_executor,
            event_bus,
            recovery_orchestrator,
            session_manager: Mutex::new(None),
            turn_taking: Mutex::new(None),
            transport: Mutex::new(None),
            bridge_tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn retry_executor(&self) -> Arc<RetryExecutor<C>> {
        self.retry_executor.clone()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn recovery_orchestrator(&self) -> Arc<RecoveryOrchestrator<C>> {
        self.recovery_orchestrator.clone()
    }

    pub fn session_manager(&self) -> EngineResult<Arc<SessionManager<C>>> {
        self.session_manager
            .lock()
            .clone()
            .ok_or_else(|| EngineError::new(FaultDomain::Infrastructure, ErrorCode::ConfigurationInvalid, "engine not initialized"))
    }

    pub fn turn_taking(&self) -> EngineResult<Arc<TurnTakingEngine<C>>> {
        self.turn_taking
            .lock()
            .clone()
            .ok_or_else(|| EngineError::new(FaultDomain::Infrastructure, ErrorCode::ConfigurationInvalid, "engine not initialized"))
    }

    pub fn transport(&self) -> EngineResult<Arc<RealtimeTransport>> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| EngineError::new(FaultDomain::Transport, ErrorCode::ConfigurationInvalid, "no transport for an active session"))
    }

    /// Idempotent: calling `initialize` on an already-initialized engine is a
    /// no-op, per the lifecycle rules.
    #[instrument(skip(self, bearer_token))]
    pub fn initialize(self: &Arc<Self>, bearer_token: Redacted<String>) -> EngineResult<()> {
        if *self.lifecycle.lock() == LifecycleState::Initialized {
            return Ok(());
        }

        // C4 (credential service + session manager)
        let credential_config = CredentialServiceConfig {
            issuance_url: self.config.endpoint.url.clone(),
            safety_margin: self.config.session.safety_margin(),
            renewal_margin_seconds: self.config.session.renewal_margin_seconds,
            expiry_seconds: 60,
        };
        let credential_service = CredentialService::new(
            credential_config,
            bearer_token,
            self.clock.clone(),
            self.retry_executor.clone(),
            self.config.retry_envelope_for(FaultDomain::Auth),
        );
        let timers_config = SessionTimersConfig {
            heartbeat_interval: self.config.session.heartbeat_interval(),
            inactivity_timeout: self.config.session.inactivity_timeout(),
        };
        let session_manager = SessionManager::new(self.clock.clone(), credential_service, timers_config);
        *self.session_manager.lock() = Some(session_manager);

        // C5
        let interruption_policy: InterruptionPolicy = self.config.interruption_policy;
        let turn_taking = TurnTakingEngine::new(self.clock.clone(), interruption_policy, Arc::new(NoopCancellationHook));
        *self.turn_taking.lock() = Some(turn_taking);

        *self.lifecycle.lock() = LifecycleState::Initialized;
        info!("engine initialized");
        Ok(())
    }

    fn require_initialized(&self) -> EngineResult<()> {
        if *self.lifecycle.lock() != LifecycleState::Initialized {
            return Err(EngineError::new(
                FaultDomain::Infrastructure,
                ErrorCode::ConfigurationInvalid,
                "operation rejected before initialize",
            ));
        }
        Ok(())
    }

    /// Instantiates Transport + ITE on top of the freshly-issued credential
    /// and wires them together: ITE barge-in/handoff events are forwarded to
    /// the transport's data channel, and transport connection-state changes
    /// are surfaced back through the session's diagnostics.
    pub async fn start_session(self: &Arc<Self>) -> EngineResult<crate::session::SessionId> {
        self.require_initialized()?;
        let session_manager = self.session_manager()?;
        let session_id = session_manager.start_session().await?;
        let turn_taking = self.turn_taking()?;
        turn_taking.start();

        let bearer_token = session_manager.current_bearer_token().ok_or_else(|| {
            EngineError::new(
                FaultDomain::Session,
                ErrorCode::ConfigurationInvalid,
                "session started without an ephemeral credential",
            )
        })?;
        let transport_config = self.config.transport_config(&bearer_token);
        let transport = RealtimeTransport::new(transport_config)?;
        transport.establish_connection().await?;
        *self.transport.lock() = Some(transport.clone());

        let mut tasks = Vec::new();
        tasks.push(self.spawn_turn_taking_bridge(turn_taking, transport.clone()));
        tasks.push(self.spawn_connection_status_bridge(session_manager, transport));
        *self.bridge_tasks.lock() = tasks;

        Ok(session_id)
    }

    /// Forwards barge-in/handoff decisions from C5 to the transport's data
    /// channel so `response.cancel` and `output_audio_buffer.clear` are
    /// actually sent within the interruption budget.
    fn spawn_turn_taking_bridge(
        self: &Arc<Self>,
        turn_taking: Arc<TurnTakingEngine<C>>,
        transport: Arc<RealtimeTransport>,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = turn_taking.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TurnEvent::AssistantYieldRequested { .. }) => {
                        transport.send_event(OutboundDataChannelEvent::ResponseCancel {}).await;
                        transport
                            .send_event(OutboundDataChannelEvent::OutputAudioBufferClear {})
                            .await;
                    }
                    Ok(TurnEvent::ResponseCreateRequested) => {
                        transport.send_event(OutboundDataChannelEvent::ResponseCreate {}).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    fn spawn_connection_status_bridge(
        self: &Arc<Self>,
        session_manager: Arc<SessionManager<C>>,
        transport: Arc<RealtimeTransport>,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = transport.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TransportEvent::ConnectionStateChanged { current, .. }) => {
                        session_manager.set_connection_status(current);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Releases external handles, cancels timers, clears listener
    /// registries, and transitions to a terminal state. Dispose runs the
    /// reverse of initialization order (C5 -> C4 -> C3 -> C2 -> C1); C1/C2
    /// hold no external handles so only C3/C4/C5 need explicit teardown here.
    #[instrument(skip(self))]
    pub async fn dispose(self: &Arc<Self>) -> EngineResult<()> {
        if *self.lifecycle.lock() == LifecycleState::Disposed {
            return Ok(());
        }
        for task in self.bridge_tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(transport) = self.transport.lock().take() {
            let _ = transport.close_connection().await;
        }
        if let Some(session_manager) = self.session_manager.lock().take() {
            let _ = session_manager.end_session().await;
        }
        self.turn_taking.lock().take();
        *self.lifecycle.lock() = LifecycleState::Disposed;
        info!("engine disposed");
        Ok(())
    }
}
