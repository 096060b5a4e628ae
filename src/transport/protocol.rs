//! Wire-protocol payloads exchanged over the data channel (§6 External
//! Interfaces). Outbound `session.update` serialization and the inbound
//! event vocabulary the transport recognizes.

use serde::{Deserialize, Serialize};

use super::types::{SessionConfigBlock, TurnDetectionType};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundDataChannelEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdatePayload },
    #[serde(rename = "response.cancel")]
    ResponseCancel {},
    #[serde(rename = "output_audio_buffer.clear")]
    OutputAudioBufferClear {},
    #[serde(rename = "response.create")]
    ResponseCreate {},
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdatePayload {
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionBlock>,
    pub turn_detection: TurnDetectionPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionBlock {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetectionPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
    pub interrupt_response: bool,
    pub eagerness: &'static str,
}

fn audio_format_code(format: super::types::AudioFormat) -> &'static str {
    match format {
        super::types::AudioFormat::Pcm16 => "pcm16",
        super::types::AudioFormat::Pcm24 => "pcm24",
        super::types::AudioFormat::Pcm32 => "pcm32",
        super::types::AudioFormat::Opus => "opus",
    }
}

/// Serialize the outbound `session.update` payload per §4.3: modalities are
/// always `["audio","text"]`; for `none` turn detection, `create_response`
/// and `interrupt_response` are forced false regardless of config.
pub fn build_session_update(
    audio: &super::types::SessionAudioConfig,
    session: &SessionConfigBlock,
) -> OutboundDataChannelEvent {
    let td = &session.turn_detection;
    let (create_response, interrupt_response) = if td.detection_type == TurnDetectionType::None {
        (false, false)
    } else {
        (td.create_response, td.interrupt_response)
    };

    let kind = match td.detection_type {
        TurnDetectionType::ServerVad => "server_vad",
        TurnDetectionType::SemanticVad => "semantic_vad",
        TurnDetectionType::None => "none",
    };
    let eagerness = match td.eagerness {
        super::types::Eagerness::Low => "low",
        super::types::Eagerness::Auto => "auto",
        super::types::Eagerness::High => "high",
    };

    OutboundDataChannelEvent::SessionUpdate {
        session: SessionUpdatePayload {
            modalities: vec!["audio".to_string(), "text".to_string()],
            input_audio_format: audio_format_code(audio.input_format).to_string(),
            output_audio_format: audio_format_code(audio.output_format).to_string(),
            voice: session.voice.clone(),
            locale: session.locale.clone(),
            input_audio_transcription: session
                .transcription_model
                .clone()
                .map(|model| TranscriptionBlock { model }),
            turn_detection: TurnDetectionPayload {
                kind,
                threshold: td.threshold,
                prefix_padding_ms: td.prefix_padding_ms,
                silence_duration_ms: td.silence_duration_ms,
                create_response,
                interrupt_response,
                eagerness,
            },
        },
    }
}

/// Inbound events recognized from the data channel. Unknown `type` values
/// are forwarded as raw JSON (`TransportEvent::DataChannelMessage`) rather
/// than dropped, since the protocol is expected to evolve.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundDataChannelEvent {
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.output_audio_transcript.delta")]
    OutputAudioTranscriptDelta { delta: String },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "conversation.item.audio_transcription.delta")]
    AudioTranscriptionDelta { delta: String },
    #[serde(rename = "conversation.item.audio_transcription.completed")]
    AudioTranscriptionCompleted { transcript: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::types::{
        AudioFormat, SessionAudioConfig, SessionConfigBlock, TurnDetectionConfig,
    };

    fn audio() -> SessionAudioConfig {
        SessionAudioConfig {
            sample_rate: 24000,
            channels: 1,
            input_format: AudioFormat::Pcm16,
            output_format: AudioFormat::Pcm16,
            worklet_urls: vec![],
        }
    }

    #[test]
    fn manual_turn_detection_forces_no_auto_response() {
        let session = SessionConfigBlock {
            voice: None,
            locale: None,
            transcription_model: None,
            turn_detection: TurnDetectionConfig::manual(),
        };
        let event = build_session_update(&audio(), &session);
        let OutboundDataChannelEvent::SessionUpdate { session } = event else {
            panic!("expected session update")
        };
        assert!(!session.turn_detection.create_response);
        assert!(!session.turn_detection.interrupt_response);
        assert_eq!(session.turn_detection.kind, "none");
    }

    #[test]
    fn modalities_always_audio_and_text() {
        let session = SessionConfigBlock {
            voice: Some("alloy".into()),
            locale: Some("en-US".into()),
            transcription_model: Some("whisper-1".into()),
            turn_detection: TurnDetectionConfig::server_vad(),
        };
        let event = build_session_update(&audio(), &session);
        let OutboundDataChannelEvent::SessionUpdate { session } = event else {
            panic!("expected session update")
        };
        assert_eq!(session.modalities, vec!["audio", "text"]);
        assert_eq!(session.turn_detection.kind, "server_vad");
        assert!(session.turn_detection.create_response);
    }

    #[test]
    fn serializes_with_tagged_type_field() {
        let session = SessionConfigBlock {
            voice: None,
            locale: None,
            transcription_model: None,
            turn_detection: TurnDetectionConfig::manual(),
        };
        let event = build_session_update(&audio(), &session);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session.update");
    }
}
