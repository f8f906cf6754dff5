use std::collections::HashMap;
use std::sync::Arc;

use chatstream_core::{ConversationId, Engine, EngineConfig};

use crate::driver::GenerationBuilder;
use crate::errors::HarnessError;
use crate::model::{ModelRef, ProviderId};
use crate::provider::ProviderAdapter;

pub(crate) struct HarnessInner {
    providers: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    pub(crate) engine: Engine,
}

impl HarnessInner {
    pub(crate) fn provider(&self, id: &ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers.get(id).cloned()
    }
}

/// Entry point for starting generations against registered providers.
#[derive(Clone)]
pub struct Harness {
    pub(crate) inner: Arc<HarnessInner>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Engine receiving every generation's fragments.
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Starts building a generation for a conversation turn.
    pub fn generate(&self, conversation_id: impl Into<ConversationId>, model: ModelRef) -> GenerationBuilder {
        GenerationBuilder::new(self.inner.clone(), conversation_id.into(), model)
    }
}

#[derive(Default)]
pub struct HarnessBuilder {
    providers: Vec<Arc<dyn ProviderAdapter>>,
    engine: Option<Engine>,
}

impl HarnessBuilder {
    /// Registers a provider adapter. Ids must be unique.
    pub fn register_provider(mut self, provider: Arc<dyn ProviderAdapter>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Uses an existing engine. Without one, an in-memory engine with the
    /// default config is created.
    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Result<Harness, HarnessError> {
        let mut providers: HashMap<ProviderId, Arc<dyn ProviderAdapter>> = HashMap::new();
        for provider in self.providers {
            let id = provider.id();
            if providers.contains_key(&id) {
                return Err(HarnessError::Config(format!(
                    "duplicate provider registration: {id}"
                )));
            }
            providers.insert(id, provider);
        }
        let engine = match self.engine {
            Some(engine) => engine,
            None => Engine::new(EngineConfig::default())?,
        };
        Ok(Harness {
            inner: Arc::new(HarnessInner { providers, engine }),
        })
    }
}
