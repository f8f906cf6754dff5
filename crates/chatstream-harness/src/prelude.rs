//! Common imports for driving generations.
pub use crate::{
    AbortHandle, DriverFailure, GenerationBuilder, GenerationHandle, GenerationOutput, Harness,
    HarnessBuilder, HarnessError, InputPart, ModelRef, ProviderId,
};
pub use chatstream_core::{Engine, EngineConfig, FeedItem, StreamOutcome};
