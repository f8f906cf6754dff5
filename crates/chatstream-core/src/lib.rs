pub mod config;
pub mod delta;
pub mod delta_log;
pub mod engine;
pub mod errors;
pub mod ids;
pub mod journal;
pub mod observability;
pub mod rebase;
pub mod session;
pub mod sse;
pub mod suggestion;
pub mod version;

// User-facing API: Engine plus the types that flow through it.
pub use config::{EngineConfig, ObservabilityConfig};
pub use delta::{AbortReason, DeltaPayload, DeltaRecord, FeedItem, StreamOutcome};
pub use delta_log::{DeltaLog, Subscription};
pub use engine::{Engine, MaintenanceHandle, RollbackOutcome};
pub use errors::EngineError;
pub use ids::{ArtifactId, ConversationId, StreamId, SuggestionId};
pub use journal::{Journal, JournalEntry, JsonlJournal};
pub use observability::init_observability;
pub use rebase::TextRange;
pub use session::{SessionStatus, StreamSession, StreamSessionManager};
pub use sse::{SseDecoder, SseFrame};
pub use suggestion::{ReviewFlag, Suggestion, SuggestionResolver, SuggestionStatus};
pub use version::{ArtifactKind, ArtifactVersion, VersionChainStore, VersionStamp};
