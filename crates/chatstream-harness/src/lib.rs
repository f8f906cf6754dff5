//! Generation driver for the chatstream engine.
//!
//! Provider adapters expose black-box model streams. A generation begins a
//! stream for its conversation, pushes every provider event into the engine
//! as a typed fragment, and commits artifact drafts when the provider
//! completes. Viewers attach to the stream through the engine at any point.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chatstream_harness::prelude::*;
//! # use chatstream_harness::ProviderAdapter;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), HarnessError> {
//! # let provider: Arc<dyn ProviderAdapter> = unimplemented!();
//! let harness = Harness::builder().register_provider(provider).build()?;
//!
//! let generation = harness
//!     .generate("conversation-1", ModelRef::new("local", "small"))
//!     .system_prompt("Answer briefly.")
//!     .user_text("Say hello")
//!     .start()
//!     .await?;
//!
//! let mut feed = generation.subscribe()?;
//! while let Some(item) = feed.next().await {
//!     println!("{item:?}");
//! }
//! let output = generation.finish().await?;
//! println!("{}", output.text);
//! # Ok(())
//! # }
//! ```

pub mod content;
pub mod driver;
pub mod errors;
pub mod harness;
pub mod model;
pub mod prelude;
/// Provider adapter contract.
pub mod provider;

pub use content::{CommittedArtifact, GenerationOutput, InputPart};
pub use driver::{AbortHandle, GenerationBuilder, GenerationHandle};
pub use errors::{DriverFailure, HarnessError, ProviderError};
pub use harness::{Harness, HarnessBuilder};
pub use model::{DriverOptions, ModelRef, ProviderId};
pub use provider::{
    ProviderAdapter, ProviderEvent, ProviderEventStream, ProviderRequest, ProviderResponseMeta,
    ProviderStreamHandle,
};
