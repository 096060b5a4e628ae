//! Narrow traits for the external collaborators named in the interfaces
//! section: audio capture/playback, transcript redaction, telemetry, and
//! presentation. The crate ships only the trait and a no-op test double —
//! selecting a real implementation is left to the host application, the same
//! way the donor leaves STT/TTS provider selection to configuration while
//! owning the protocol shape.

use async_trait::async_trait;

use crate::error::ErrorEnvelope;
use crate::session::SessionDiagnostics;
use crate::turntaking::TurnDiagnostics;

/// Processed media tracks and the playback pipeline hooks. The engine calls
/// into this for cancellation (`fade_out`/`flush`) during barge-in; it never
/// touches raw audio samples itself.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn prime(&self) {}
    async fn enqueue(&self, _chunk: &[u8], _metadata: &str) {}
    async fn fade_out(&self, _ms: u64) {}
    async fn flush(&self) {}
    fn get_buffered_duration_ms(&self) -> u64 {
        0
    }
}

pub struct NoopAudioSink;
#[async_trait]
impl AudioSink for NoopAudioSink {}

/// Consumes inbound transcript deltas/finals. The core forwards events
/// verbatim and performs no redaction of transcript content itself.
pub trait TranscriptAggregator: Send + Sync {
    fn on_delta(&self, _delta: &str) {}
    fn on_final(&self, _transcript: &str) {}
}

pub struct NoopTranscriptAggregator;
impl TranscriptAggregator for NoopTranscriptAggregator {}

/// Structured events: retry attempts/outcomes, recovery events, diagnostics
/// snapshots. Sinks/exporters (the actual metrics backend) are out of scope.
pub trait TelemetrySink: Send + Sync {
    fn on_session_diagnostics(&self, _diagnostics: &SessionDiagnostics) {}
    fn on_turn_diagnostics(&self, _diagnostics: &TurnDiagnostics) {}
    fn on_error(&self, _error: &ErrorEnvelope) {}
}

pub struct NoopTelemetrySink;
impl TelemetrySink for NoopTelemetrySink {}

/// Error banners, status indicators, transcript notices. The core delivers
/// typed errors and state updates; rendering is entirely the host's concern.
pub trait PresentationAdapter: Send + Sync {
    fn show_error_banner(&self, _error: &ErrorEnvelope) {}
    fn show_degraded_notice(&self, _message: &str) {}
    fn clear_banners(&self) {}
}

pub struct NoopPresentationAdapter;
impl PresentationAdapter for NoopPresentationAdapter {}
