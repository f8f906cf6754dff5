use std::fmt;
use std::time::Duration;

/// Stable identifier for a provider adapter (for example `local-llm`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a provider id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Model selection for a generation.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelRef {
    pub provider: ProviderId,
    /// Provider-specific model name.
    pub model: String,
}

impl ModelRef {
    /// Creates a model reference from a provider id and model name.
    pub fn new(provider: impl Into<ProviderId>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Per-generation driver behavior.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DriverOptions {
    /// Wall-clock limit for the whole generation.
    pub timeout: Option<Duration>,
    /// The driver re-checks that its stream is still the active one after
    /// this many pushed fragments.
    pub check_every: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            check_every: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_checks_status_in_small_batches_by_default() {
        let options = DriverOptions::default();
        assert_eq!(options.check_every, 8);
        assert!(options.timeout.is_none());
    }
}
