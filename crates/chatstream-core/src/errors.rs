use crate::delta::StreamOutcome;
use crate::ids::{ArtifactId, StreamId, SuggestionId};
use crate::suggestion::SuggestionStatus;
use crate::version::{ArtifactKind, VersionStamp};

/// Errors returned by the session and versioning engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Append or producer check on a stream that already reached a terminal state.
    #[error("stream {stream_id} is closed ({outcome})")]
    StreamClosed {
        stream_id: StreamId,
        outcome: StreamOutcome,
    },
    /// A newer generation began for the same conversation; the producer must stop.
    #[error("stream {stream_id} was superseded by {superseded_by}")]
    SessionSuperseded {
        stream_id: StreamId,
        superseded_by: StreamId,
    },
    /// The anchor version is unknown or was removed by a rollback.
    #[error("artifact {artifact_id} has no version {anchor}")]
    StaleAnchor {
        artifact_id: ArtifactId,
        anchor: VersionStamp,
    },
    /// The suggestion's range no longer resolves unambiguously on the head version.
    #[error("suggestion {suggestion_id} does not apply cleanly to head {head}")]
    RebaseConflict {
        suggestion_id: SuggestionId,
        head: VersionStamp,
    },
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),
    #[error("artifact not found: {0}")]
    ArtifactNotFound(ArtifactId),
    #[error("artifact {artifact_id} has no version {stamp}")]
    VersionNotFound {
        artifact_id: ArtifactId,
        stamp: VersionStamp,
    },
    #[error("suggestion not found: {0}")]
    SuggestionNotFound(SuggestionId),
    #[error("suggestion {suggestion_id} is {status:?}")]
    SuggestionClosed {
        suggestion_id: SuggestionId,
        status: SuggestionStatus,
    },
    #[error("range {start}..{end} is outside content of length {len}")]
    InvalidRange { start: usize, end: usize, len: usize },
    #[error("suggestions are not supported for {0:?} artifacts")]
    UnsupportedKind(ArtifactKind),
    #[error("config error: {0}")]
    Config(String),
    #[error("journal error: {0}")]
    Journal(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl EngineError {
    /// Conditions the caller can recover from by re-proposing against the head.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StaleAnchor { .. } | Self::RebaseConflict { .. })
    }

    pub(crate) fn journal(err: impl std::fmt::Display) -> Self {
        Self::Journal(err.to_string())
    }

    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_anchor_conditions_are_recoverable() {
        let stamp = VersionStamp::first(chrono::Utc::now());
        assert!(
            EngineError::StaleAnchor {
                artifact_id: "doc".into(),
                anchor: stamp,
            }
            .is_recoverable()
        );
        assert!(
            !EngineError::SessionSuperseded {
                stream_id: StreamId::new(),
                superseded_by: StreamId::new(),
            }
            .is_recoverable()
        );
    }
}
