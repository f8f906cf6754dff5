use chatstream_core::{EngineError, StreamId};

use crate::model::ProviderId;

/// Errors raised by a provider adapter, before the driver maps them to a
/// terminal cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Application-level failure reported by the provider (status, auth, quota).
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: ProviderId,
        message: String,
        status_code: Option<u16>,
    },
    #[error("transport error ({provider}): {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    /// Malformed event or bad sequencing.
    #[error("protocol error ({provider}): {message}")]
    Protocol {
        provider: ProviderId,
        message: String,
    },
}

impl ProviderError {
    pub fn provider(
        provider: impl Into<ProviderId>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    pub fn transport(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn protocol(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Protocol {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Why a generation ended without completing. Serializable so it can be
/// reported to viewers alongside the stream outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverFailure {
    #[error("provider failure ({provider}): {message}")]
    Provider { provider: String, message: String },
    #[error("transport failure ({provider}): {message}")]
    Transport { provider: String, message: String },
    #[error("protocol failure: {message}")]
    Protocol { message: String },
    #[error("generation cancelled")]
    Cancelled,
    #[error("generation timed out")]
    TimedOut,
    /// A newer generation took over the conversation.
    #[error("generation superseded by stream {by}")]
    Superseded { by: StreamId },
}

impl From<&ProviderError> for DriverFailure {
    fn from(err: &ProviderError) -> Self {
        match err {
            ProviderError::Provider {
                provider, message, ..
            } => Self::Provider {
                provider: provider.to_string(),
                message: message.clone(),
            },
            ProviderError::Transport { provider, message } => Self::Transport {
                provider: provider.to_string(),
                message: message.clone(),
            },
            ProviderError::Protocol { provider, message } => Self::Protocol {
                message: format!("{provider}: {message}"),
            },
        }
    }
}

/// Top-level error type for the harness API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HarnessError {
    #[error("config error: {0}")]
    Config(String),
    /// Invalid builder input.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: ProviderId },
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Terminal failure of a started generation.
    #[error(transparent)]
    Failed(#[from] DriverFailure),
    /// The driver task ended without reporting a result.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl HarnessError {
    /// Maps an engine rejection seen by the producer. Supersession and
    /// cancellation become driver failures, everything else stays an engine
    /// error.
    pub(crate) fn from_push(err: EngineError) -> Self {
        use chatstream_core::{AbortReason, StreamOutcome};
        match err {
            EngineError::SessionSuperseded { superseded_by, .. } => {
                Self::Failed(DriverFailure::Superseded { by: superseded_by })
            }
            EngineError::StreamClosed {
                outcome:
                    StreamOutcome::Aborted {
                        reason: AbortReason::Superseded { by },
                    },
                ..
            } => Self::Failed(DriverFailure::Superseded { by }),
            EngineError::StreamClosed {
                outcome:
                    StreamOutcome::Aborted {
                        reason: AbortReason::Cancelled,
                    },
                ..
            } => Self::Failed(DriverFailure::Cancelled),
            other => Self::Engine(other),
        }
    }
}
