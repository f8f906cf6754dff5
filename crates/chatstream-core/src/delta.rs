use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ArtifactId, StreamId};
use crate::version::ArtifactKind;

/// One typed fragment of a generation turn.
///
/// The `type` discriminant is explicit on the wire so every consumer can
/// match exhaustively instead of sniffing an untyped blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeltaPayload {
    /// Incremental assistant text.
    TextDelta { text: String },
    /// A tool invocation emitted by the model.
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// A chunk of artifact content written while the turn is in progress.
    ArtifactPatch {
        artifact_id: ArtifactId,
        kind: ArtifactKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        delta: String,
    },
    /// The model signalled the end of the turn.
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl DeltaPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    /// Wire name of the variant, identical to the serialized `type` tag.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text-delta",
            Self::ToolCall { .. } => "tool-call",
            Self::ArtifactPatch { .. } => "artifact-patch",
            Self::Finish { .. } => "finish",
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }
}

/// A persisted fragment. `seq` starts at 0 and is gapless per stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub stream_id: StreamId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: DeltaPayload,
}

/// Why a stream was aborted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// A newer `begin` for the same conversation took over.
    Superseded { by: StreamId },
    /// No delta arrived within the idle window.
    Idle,
    /// The process stopped while the stream was live.
    Interrupted,
    /// The caller cancelled the generation.
    Cancelled,
    /// The generation driver failed.
    Driver { message: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superseded { by } => write!(f, "superseded by {by}"),
            Self::Idle => f.write_str("idle timeout"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Driver { message } => write!(f, "driver failure: {message}"),
        }
    }
}

/// Terminal state of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamOutcome {
    Completed,
    Aborted { reason: AbortReason },
}

impl StreamOutcome {
    pub fn aborted(reason: AbortReason) -> Self {
        Self::Aborted { reason }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Aborted { reason } => write!(f, "aborted: {reason}"),
        }
    }
}

/// Item yielded by a subscription: a record, then exactly one terminal marker.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedItem {
    Delta(DeltaRecord),
    End(StreamOutcome),
}

impl FeedItem {
    pub fn as_delta(&self) -> Option<&DeltaRecord> {
        match self {
            Self::Delta(record) => Some(record),
            Self::End(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_with_explicit_type_tag() {
        let payload = DeltaPayload::text("hi");
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json, serde_json::json!({"type": "text-delta", "text": "hi"}));

        let finish: DeltaPayload =
            serde_json::from_value(serde_json::json!({"type": "finish"})).expect("deserialize");
        assert_eq!(finish, DeltaPayload::Finish { reason: None });
        assert_eq!(finish.type_tag(), "finish");
    }

    #[test]
    fn abort_reason_round_trips_through_outcome() {
        let by = StreamId::new();
        let outcome = StreamOutcome::aborted(AbortReason::Superseded { by });
        let json = serde_json::to_string(&outcome).expect("serialize");
        let back: StreamOutcome = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, outcome);
        assert!(outcome.to_string().contains("superseded"));
    }
}
