//! Typed error envelope shared by every component (C1-C5).
//!
//! Mirrors the donor realtime client's `RealtimeError` in spirit (a `thiserror`
//! enum carrying a recoverability flag) but widens it into a structured
//! envelope so fault domain, severity, and user impact are first-class fields
//! rather than inferred from the variant name.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPlan;

/// High-level category used to select retry envelopes and default severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultDomain {
    Auth,
    Session,
    Transport,
    Audio,
    Ui,
    AssistantIntegration,
    Infrastructure,
}

impl FaultDomain {
    /// Default (severity, user_impact) pair for this domain, per the taxonomy.
    pub fn defaults(self) -> (Severity, UserImpact) {
        match self {
            FaultDomain::Auth => (Severity::Error, UserImpact::Blocked),
            FaultDomain::Session => (Severity::Error, UserImpact::Degraded),
            FaultDomain::Transport => (Severity::Error, UserImpact::Degraded),
            FaultDomain::Audio => (Severity::Warning, UserImpact::Degraded),
            FaultDomain::Ui => (Severity::Warning, UserImpact::Transparent),
            FaultDomain::AssistantIntegration => (Severity::Warning, UserImpact::Degraded),
            FaultDomain::Infrastructure => (Severity::Critical, UserImpact::Blocked),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserImpact {
    Transparent,
    Degraded,
    Blocked,
}

/// A value that must never be printed in full by `Debug`/`Display`.
///
/// Used for credentials, connection ids, and any other field the error
/// handling design requires to be redacted before logging or telemetry.
#[derive(Clone, Serialize, Deserialize)]
pub struct Redacted<T>(pub T);

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

impl<T> Redacted<T> {
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Correlates a failure back to the request/session/connection it occurred on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryContext {
    pub correlation_id: String,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    pub connection_id: Option<String>,
}

/// Machine-checkable error code. A fixed vocabulary rather than a free string
/// so callers can `match` on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    NetworkTimeout,
    IceConnectionFailed,
    DataChannelFailed,
    SdpNegotiationFailed,
    RegionNotSupported,
    ConfigurationInvalid,
    AudioTrackFailed,
    RetryCircuitOpen,
    RetryOperationFailed,
    SessionRenewalFailed,
    TurnTokenViolation,
}

impl ErrorCode {
    /// Whether this code is, in principle, worth retrying. Individual retry
    /// envelopes may still refuse a retry for other reasons (budget, attempts).
    pub fn recoverable(self) -> bool {
        !matches!(
            self,
            ErrorCode::AuthenticationFailed
                | ErrorCode::SdpNegotiationFailed
                | ErrorCode::RegionNotSupported
                | ErrorCode::ConfigurationInvalid
        )
    }
}

/// The full error envelope described in the data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub id: String,
    pub fault_domain: FaultDomain,
    pub severity: Severity,
    pub user_impact: UserImpact,
    pub code: ErrorCode,
    pub message: String,
    pub remediation: Option<String>,
    pub metadata: HashMap<String, String>,
    #[serde(with = "humantime_serde_shim")]
    pub timestamp: SystemTime,
    pub retry_plan: Option<RetryPlan>,
    pub recovery_plan_id: Option<String>,
    pub telemetry_context: Option<TelemetryContext>,
    pub notification_suppressed: bool,
}

impl ErrorEnvelope {
    pub fn new(fault_domain: FaultDomain, code: ErrorCode, message: impl Into<String>) -> Self {
        let (severity, user_impact) = fault_domain.defaults();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fault_domain,
            severity,
            user_impact,
            code,
            message: message.into(),
            remediation: None,
            metadata: HashMap::new(),
            timestamp: SystemTime::now(),
            retry_plan: None,
            recovery_plan_id: None,
            telemetry_context: None,
            notification_suppressed: false,
        }
    }

    pub fn recoverable(&self) -> bool {
        self.code.recoverable()
    }

    pub fn with_telemetry(mut self, ctx: TelemetryContext) -> Self {
        self.telemetry_context = Some(ctx);
        self
    }

    pub fn with_retry_plan(mut self, plan: RetryPlan) -> Self {
        self.retry_plan = Some(plan);
        self
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}/{:?}] {}", self.fault_domain, self.code, self.message)
    }
}

/// Top-level error type. `thiserror`-backed so it composes with `?` the way
/// the rest of the ecosystem expects, while still carrying the full envelope
/// for handlers that need the structured fields.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{envelope}")]
pub struct EngineError {
    pub envelope: ErrorEnvelope,
}

impl EngineError {
    pub fn new(fault_domain: FaultDomain, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            envelope: ErrorEnvelope::new(fault_domain, code, message),
        }
    }

    pub fn from_envelope(envelope: ErrorEnvelope) -> Self {
        Self { envelope }
    }

    pub fn code(&self) -> ErrorCode {
        self.envelope.code
    }

    pub fn recoverable(&self) -> bool {
        self.envelope.recoverable()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// `SystemTime` has no built-in serde support; this module mirrors the small
/// shim the donor crate writes inline for similar timestamp fields rather than
/// pulling in a whole date/time crate for one field.
mod humantime_serde_shim {
    use super::SystemTime;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::UNIX_EPOCH;

    pub fn serialize<S: Serializer>(value: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let secs = value
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        serializer.serialize_f64(secs)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_never_prints_inner_value() {
        let r = Redacted("super-secret-token".to_string());
        assert_eq!(format!("{:?}", r), "<redacted>");
        assert_eq!(format!("{}", r), "<redacted>");
    }

    #[test]
    fn fault_domain_defaults_match_taxonomy() {
        assert_eq!(
            FaultDomain::Auth.defaults(),
            (Severity::Error, UserImpact::Blocked)
        );
        assert_eq!(
            FaultDomain::Infrastructure.defaults(),
            (Severity::Critical, UserImpact::Blocked)
        );
        assert_eq!(
            FaultDomain::Ui.defaults(),
            (Severity::Warning, UserImpact::Transparent)
        );
    }

    #[test]
    fn non_recoverable_codes_are_fixed() {
        assert!(!ErrorCode::AuthenticationFailed.recoverable());
        assert!(!ErrorCode::SdpNegotiationFailed.recoverable());
        assert!(ErrorCode::NetworkTimeout.recoverable());
        assert!(ErrorCode::IceConnectionFailed.recoverable());
    }
}
