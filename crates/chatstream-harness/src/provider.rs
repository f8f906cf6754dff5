use std::pin::Pin;

use chatstream_core::{ArtifactId, ArtifactKind, ConversationId};
use futures::Stream;

use crate::content::InputPart;
use crate::errors::ProviderError;
use crate::model::{DriverOptions, ModelRef, ProviderId};

/// Request handed to a provider when a generation starts.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub generation_id: uuid::Uuid,
    pub conversation_id: ConversationId,
    pub model: ModelRef,
    pub system_prompt: Option<String>,
    pub input_parts: Vec<InputPart>,
    pub options: DriverOptions,
}

/// One event from a provider's model stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// Incremental content for an artifact, committed as one version when the
    /// generation completes.
    ArtifactDelta {
        artifact_id: ArtifactId,
        kind: ArtifactKind,
        title: Option<String>,
        delta: String,
    },
    /// Terminal success.
    Completed { finish_reason: Option<String> },
}

pub type ProviderEventStream =
    Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send + 'static>>;

/// Provider response metadata captured at stream start.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderResponseMeta {
    pub request_id: Option<String>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub metadata: ProviderResponseMeta,
}

/// Black-box model stream. Implementations translate a vendor protocol into
/// [`ProviderEvent`]s.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn start_stream(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderStreamHandle, ProviderError>;
}
