//! Top-level configuration aggregate.
//!
//! Layered precedence, matching the donor's pattern: `EngineConfig::from_file`
//! (YAML via `serde_yaml`) overrides `EngineConfig::from_env` (`ENGINE_*`
//! variables loaded through `dotenvy`) which overrides `Default`. Every
//! numeric guardrail from the enumerated configuration section is enforced in
//! `validate()`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FaultDomain;
use crate::retry::{JitterStrategy, RetryEnvelope, RetryPolicy};
use crate::transport::types::{
    AudioFormat, ConnectionTuning, DataChannelConfig, EndpointConfig, SessionAudioConfig,
    SessionConfigBlock, TransportConfig, TurnDetectionConfig,
};
use crate::turntaking::{FallbackMode, InterruptionPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub renewal_margin_seconds: u64,
    pub inactivity_timeout_minutes: u64,
    pub heartbeat_interval_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub enable_heartbeat: bool,
    pub enable_inactivity_timeout: bool,
    pub safety_margin_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            renewal_margin_seconds: 10,
            inactivity_timeout_minutes: 5,
            heartbeat_interval_seconds: 30,
            max_retry_attempts: 3,
            retry_backoff_ms: 1000,
            enable_heartbeat: true,
            enable_inactivity_timeout: true,
            safety_margin_seconds: 10,
        }
    }
}

impl SessionSettings {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_minutes * 60)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env-filter directive, e.g. `"info"` or
    /// `"realtime_voice_engine=debug,warn"`.
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEndpointSettings {
    pub region: String,
    pub url: String,
    pub deployment: String,
    pub api_version: String,
}

impl Default for TransportEndpointSettings {
    fn default() -> Self {
        Self {
            region: "eastus2".to_string(),
            url: String::new(),
            deployment: String::new(),
            api_version: "2025-04-01".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    pub sample_rate: u32,
    pub channels: u8,
    pub voice: Option<String>,
    pub locale: Option<String>,
    pub data_channel_name: String,
    pub data_channel_max_retransmits: Option<u16>,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connection_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            voice: None,
            locale: None,
            data_channel_name: "oai-events".to_string(),
            data_channel_max_retransmits: None,
            reconnect_attempts: 3,
            reconnect_delay_ms: 1_000,
            connection_timeout_ms: 5_000,
        }
    }
}

fn default_retry_envelopes() -> HashMap<FaultDomain, RetryEnvelope> {
    let mut map = HashMap::new();
    map.insert(
        FaultDomain::Auth,
        RetryEnvelope {
            policy: RetryPolicy::Exponential,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 8_000,
            max_attempts: 3,
            jitter_strategy: JitterStrategy::DeterministicFull,
            cooldown_ms: 30_000,
            failure_budget_ms: 30_000,
        },
    );
    map.insert(
        FaultDomain::Transport,
        RetryEnvelope {
            policy: RetryPolicy::Exponential,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts: 5,
            jitter_strategy: JitterStrategy::DeterministicFull,
            cooldown_ms: 30_000,
            failure_budget_ms: 60_000,
        },
    );
    map.insert(
        FaultDomain::Session,
        RetryEnvelope {
            policy: RetryPolicy::Linear,
            initial_delay_ms: 1_000,
            multiplier: 1.5,
            max_delay_ms: 5_000,
            max_attempts: 3,
            jitter_strategy: JitterStrategy::DeterministicEqual,
            cooldown_ms: 20_000,
            failure_budget_ms: 20_000,
        },
    );
    map.insert(
        FaultDomain::Infrastructure,
        RetryEnvelope {
            policy: RetryPolicy::Hybrid,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 15_000,
            max_attempts: 4,
            jitter_strategy: JitterStrategy::DeterministicFull,
            cooldown_ms: 60_000,
            failure_budget_ms: 90_000,
        },
    );
    map
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub session: SessionSettings,
    pub interruption_policy: InterruptionPolicy,
    pub retry_envelopes: HashMap<FaultDomain, RetryEnvelope>,
    pub endpoint: TransportEndpointSettings,
    pub transport: TransportSettings,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            interruption_policy: InterruptionPolicy::default(),
            retry_envelopes: default_retry_envelopes(),
            endpoint: TransportEndpointSettings::default(),
            transport: TransportSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads `.env` (if present) then reads `ENGINE_*`-prefixed variables over
    /// the struct defaults. Unset variables simply leave the default in
    /// place; malformed ones are reported via `anyhow` since this is a
    /// boundary-only validation path, not a typed engine error.
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(region) = std::env::var("ENGINE_REGION") {
            config.endpoint.region = region;
        }
        if let Ok(url) = std::env::var("ENGINE_ENDPOINT_URL") {
            config.endpoint.url = url;
        }
        if let Ok(deployment) = std::env::var("ENGINE_DEPLOYMENT") {
            config.endpoint.deployment = deployment;
        }
        if let Ok(value) = std::env::var("ENGINE_RENEWAL_MARGIN_SECONDS") {
            config.session.renewal_margin_seconds = value.parse()?;
        }
        if let Ok(value) = std::env::var("ENGINE_INACTIVITY_TIMEOUT_MINUTES") {
            config.session.inactivity_timeout_minutes = value.parse()?;
        }
        if let Ok(value) = std::env::var("ENGINE_HEARTBEAT_INTERVAL_SECONDS") {
            config.session.heartbeat_interval_seconds = value.parse()?;
        }
        if let Ok(value) = std::env::var("ENGINE_ALLOW_BARGE_IN") {
            config.interruption_policy.allow_barge_in = value.parse()?;
        }
        if let Ok(value) = std::env::var("ENGINE_INTERRUPTION_BUDGET_MS") {
            config.interruption_policy.interruption_budget_ms = value.parse()?;
        }
        if let Ok(value) = std::env::var("ENGINE_FALLBACK_MODE") {
            config.interruption_policy.fallback_mode = match value.to_lowercase().as_str() {
                "manual" => FallbackMode::Manual,
                _ => FallbackMode::Hybrid,
            };
        }
        if let Ok(value) = std::env::var("ENGINE_LOG_FILTER") {
            config.logging.filter = value;
        }

        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// File overrides environment which overrides defaults, matching the
    /// donor binary's `--config` flag precedence.
    pub fn load(file_path: Option<impl AsRef<Path>>) -> anyhow::Result<Self> {
        if let Some(path) = file_path {
            return Self::from_file(path);
        }
        Self::from_env()
    }

    /// Enforces every numeric guardrail from the enumerated configuration
    /// section. Mirrors the donor's `VADConfig::validate()` style.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.url.is_empty() {
            anyhow::bail!("endpoint.url must not be empty");
        }
        if self.endpoint.deployment.is_empty() {
            anyhow::bail!("endpoint.deployment must not be empty");
        }
        if self.interruption_policy.interruption_budget_ms > 750 {
            anyhow::bail!("interruption_budget_ms must be <= 750");
        }
        if self.interruption_policy.speech_stop_debounce_ms < 150 {
            anyhow::bail!("speech_stop_debounce_ms must be >= 150");
        }
        for (domain, envelope) in &self.retry_envelopes {
            if envelope.max_attempts > 8 {
                anyhow::bail!("{domain:?}: max_attempts must be <= 8");
            }
            if envelope.initial_delay_ms > 5_000 {
                anyhow::bail!("{domain:?}: initial_delay_ms must be <= 5000");
            }
            if !(1.0..=5.0).contains(&envelope.multiplier) {
                anyhow::bail!("{domain:?}: multiplier must be in [1,5]");
            }
            if envelope.max_delay_ms > 60_000 {
                anyhow::bail!("{domain:?}: max_delay_ms must be <= 60000");
            }
            if !(5_000..=120_000).contains(&envelope.cooldown_ms) {
                anyhow::bail!("{domain:?}: cooldown_ms must be in [5000,120000]");
            }
            if !(1_000..=120_000).contains(&envelope.failure_budget_ms) {
                anyhow::bail!("{domain:?}: failure_budget_ms must be in [1000,120000]");
            }
        }
        Ok(())
    }

    pub fn retry_envelope_for(&self, domain: FaultDomain) -> RetryEnvelope {
        self.retry_envelopes.get(&domain).copied().unwrap_or_default().clamp()
    }

    /// Builds the C3 transport configuration for a freshly-started session.
    /// `bearer_token` is the session's ephemeral key, never the engine's
    /// long-lived issuance credential.
    pub fn transport_config(&self, bearer_token: &str) -> TransportConfig {
        let turn_detection = if self.interruption_policy.allow_barge_in {
            TurnDetectionConfig::server_vad()
        } else {
            TurnDetectionConfig::manual()
        };

        TransportConfig {
            endpoint: EndpointConfig {
                region: self.endpoint.region.clone(),
                url: self.endpoint.url.clone(),
                deployment: self.endpoint.deployment.clone(),
                api_version: self.endpoint.api_version.clone(),
            },
            bearer_token: bearer_token.to_string(),
            audio: SessionAudioConfig {
                sample_rate: self.transport.sample_rate,
                channels: self.transport.channels,
                input_format: AudioFormat::Pcm16,
                output_format: AudioFormat::Pcm16,
                worklet_urls: Vec::new(),
            },
            session: SessionConfigBlock {
                voice: self.transport.voice.clone(),
                locale: self.transport.locale.clone(),
                transcription_model: None,
                turn_detection,
            },
            data_channel: DataChannelConfig {
                name: self.transport.data_channel_name.clone(),
                ordered: true,
                max_retransmits: self.transport.data_channel_max_retransmits,
            },
            tuning: ConnectionTuning {
                reconnect_attempts: self.transport.reconnect_attempts,
                reconnect_delay_ms: self.transport.reconnect_delay_ms,
                connection_timeout_ms: self.transport.connection_timeout_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_successfully_once_endpoint_is_set() {
        let mut config = EngineConfig::default();
        config.endpoint.url = "https://example.invalid/realtime".to_string();
        config.endpoint.deployment = "gpt-realtime".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_interruption_budget_above_hard_cap() {
        let mut config = EngineConfig::default();
        config.endpoint.url = "https://example.invalid".to_string();
        config.endpoint.deployment = "gpt-realtime".to_string();
        config.interruption_policy.interruption_budget_ms = 900;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_retry_envelope_outside_guardrails() {
        let mut config = EngineConfig::default();
        config.endpoint.url = "https://example.invalid".to_string();
        config.endpoint.deployment = "gpt-realtime".to_string();
        config.retry_envelopes.get_mut(&FaultDomain::Transport).unwrap().max_attempts = 20;
        assert!(config.validate().is_err());
    }
}
