//! The control-plane error taxonomy (spec §7) and the envelope shape client
//! calls are translated into (spec §6, "Error envelope").

use serde::Serialize;

/// Authoritative classification table from spec §7. Not a type hierarchy —
/// one flat enum callers match on, matching the spec's own "Kinds
/// (taxonomy, not types)" framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Timeout,
    Transport,
    Protocol,
    LaunchFailed,
    CircuitOpen,
    NoHealthyMember,
    RateLimited,
    Cancelled,
    Configuration,
    Internal,
    /// Upstream tool returned a JSON-RPC error; the provider's raw message
    /// passes through unchanged and never counts against health.
    ToolError,
}

impl ErrorKind {
    /// Whether an error of this kind counts against a provider's
    /// `consecutive_failures` (spec §7 classification table).
    pub fn counts_against_health(self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Protocol | ErrorKind::Timeout)
    }

    /// Whether a batch call failing with this kind is eligible for retry
    /// (spec §7 classification table).
    pub fn retriable_in_batch(self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Protocol | ErrorKind::Timeout)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct HangarError {
    pub kind: ErrorKind,
    pub message: String,
    pub provider_id: Option<String>,
    pub recovery_hints: Vec<String>,
}

impl HangarError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider_id: None,
            recovery_hints: Vec::new(),
        }
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hints.push(hint.into());
        self
    }
}

impl From<hangar_transport::TransportError> for HangarError {
    fn from(e: hangar_transport::TransportError) -> Self {
        let kind = match &e {
            hangar_transport::TransportError::Timeout(_) => ErrorKind::Timeout,
            hangar_transport::TransportError::Transport(_) => ErrorKind::Transport,
            hangar_transport::TransportError::Protocol(_) => ErrorKind::Protocol,
            hangar_transport::TransportError::Cancelled => ErrorKind::Cancelled,
        };
        HangarError::new(kind, e.to_string())
    }
}

/// The wire-level error envelope (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: bool,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovery_hints: Vec<String>,
}

impl From<HangarError> for ErrorEnvelope {
    fn from(e: HangarError) -> Self {
        Self {
            error: true,
            kind: e.kind,
            provider_id: e.provider_id,
            operation: None,
            details: Some(e.message),
            recovery_hints: e.recovery_hints,
        }
    }
}
