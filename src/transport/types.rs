//! Shared value types for the realtime transport (C3): connection/data-channel
//! state machines, the transport configuration, and the typed event set
//! published out of `establish_connection`/`restart_ice`/etc.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataChannelState {
    Unavailable,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Pcm16,
    Pcm24,
    Pcm32,
    Opus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionType {
    ServerVad,
    SemanticVad,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eagerness {
    Low,
    Auto,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    pub detection_type: TurnDetectionType,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
    pub interrupt_response: bool,
    pub eagerness: Eagerness,
}

impl TurnDetectionConfig {
    pub fn manual() -> Self {
        Self {
            detection_type: TurnDetectionType::None,
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            create_response: false,
            interrupt_response: false,
            eagerness: Eagerness::Auto,
        }
    }

    pub fn server_vad() -> Self {
        Self {
            detection_type: TurnDetectionType::ServerVad,
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            create_response: true,
            interrupt_response: true,
            eagerness: Eagerness::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub input_format: AudioFormat,
    pub output_format: AudioFormat,
    /// Order-preserving, deduplicated, frozen after the transport factory
    /// builds the first config.
    pub worklet_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfigBlock {
    pub voice: Option<String>,
    pub locale: Option<String>,
    pub transcription_model: Option<String>,
    pub turn_detection: TurnDetectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChannelConfig {
    pub name: String,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            name: "oai-events".to_string(),
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub region: String,
    pub url: String,
    pub deployment: String,
    pub api_version: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectionTuning {
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connection_timeout_ms: u64,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_delay_ms: 1000,
            connection_timeout_ms: 5000,
        }
    }
}

/// Region allow-list. Frozen for the lifetime of the transport, as the
/// invariant requires.
pub const ALLOWED_REGIONS: &[&str] = &["eastus2", "swedencentral", "westus2"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub endpoint: EndpointConfig,
    pub bearer_token: String,
    pub audio: SessionAudioConfig,
    pub session: SessionConfigBlock,
    pub data_channel: DataChannelConfig,
    pub tuning: ConnectionTuning,
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !ALLOWED_REGIONS.contains(&self.endpoint.region.as_str()) {
            anyhow::bail!("region '{}' is not in the allow-list", self.endpoint.region);
        }
        let mut seen = std::collections::HashSet::new();
        for url in &self.audio.worklet_urls {
            if !seen.insert(url) {
                anyhow::bail!("duplicate worklet url: {url}");
            }
        }
        Ok(())
    }
}

pub const SDP_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DATA_CHANNEL_RECREATE_TIMEOUT: Duration = Duration::from_secs(3);
pub const STATS_SAMPLING_INTERVAL: Duration = Duration::from_secs(5);
pub const FALLBACK_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDiagnosticsEvent {
    pub state: ConnectionState,
    pub negotiation_timed_out: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionQualityChangedEvent {
    pub previous: Option<ConnectionQuality>,
    pub current: ConnectionQuality,
    pub round_trip_time_ms: Option<f64>,
    pub packets_lost: u64,
    pub jitter_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChannelStateChangedEvent {
    pub previous: DataChannelState,
    pub current: DataChannelState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackStateChangedEvent {
    pub fallback_active: bool,
    pub queued_messages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub kind: RecoveryEventKind,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryEventKind {
    ReconnectAttempt,
    ReconnectSucceeded,
    ReconnectFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportEvent {
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    ConnectionDiagnostics(ConnectionDiagnosticsEvent),
    ConnectionQualityChanged(ConnectionQualityChangedEvent),
    DataChannelStateChanged(DataChannelStateChangedEvent),
    FallbackStateChanged(FallbackStateChangedEvent),
    Recovery(RecoveryEvent),
    /// A parsed inbound data-channel message, forwarded verbatim for C5/C4 to
    /// interpret. Kept as raw JSON here; typed parsing happens downstream
    /// (see `crate::transport::protocol`).
    DataChannelMessage(serde_json::Value),
}
