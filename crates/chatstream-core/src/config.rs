use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Runtime knobs for the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Live sessions without delta activity for this long are aborted.
    pub idle_timeout: Duration,
    /// Tick of the background maintenance task.
    pub reap_interval: Duration,
    /// Terminal stream logs are purged once they are older than this.
    pub retention: Duration,
    /// Bounded per-subscriber live buffer. A full buffer drops the
    /// subscriber from fan-out; it catches up from the log.
    pub subscriber_buffer: usize,
    /// Upper bound on the edit distance explored when rebasing a suggestion.
    pub max_rebase_distance: usize,
    /// JSONL journal location. `None` keeps everything in memory.
    pub journal_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(15),
            retention: Duration::from_secs(3600),
            subscriber_buffer: 256,
            max_rebase_distance: 512,
            journal_path: None,
        }
    }
}

impl EngineConfig {
    /// Builds a config from `CHATSTREAM_*` environment variables, loading a
    /// `.env` file first when present. Unset variables keep their defaults.
    ///
    /// - `CHATSTREAM_IDLE_TIMEOUT_SECS`
    /// - `CHATSTREAM_REAP_INTERVAL_SECS`
    /// - `CHATSTREAM_RETENTION_SECS`
    /// - `CHATSTREAM_SUBSCRIBER_BUFFER`
    /// - `CHATSTREAM_MAX_REBASE_DISTANCE`
    /// - `CHATSTREAM_JOURNAL_PATH`
    pub fn from_env() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, EngineError> {
        let mut config = Self::default();
        if let Some(secs) = parse_var::<u64>(&lookup, "CHATSTREAM_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHATSTREAM_REAP_INTERVAL_SECS")? {
            config.reap_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHATSTREAM_RETENTION_SECS")? {
            config.retention = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<usize>(&lookup, "CHATSTREAM_SUBSCRIBER_BUFFER")? {
            config.subscriber_buffer = size;
        }
        if let Some(distance) = parse_var::<usize>(&lookup, "CHATSTREAM_MAX_REBASE_DISTANCE")? {
            config.max_rebase_distance = distance;
        }
        if let Some(path) = lookup("CHATSTREAM_JOURNAL_PATH").filter(|p| !p.trim().is_empty()) {
            config.journal_path = Some(PathBuf::from(path));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.subscriber_buffer == 0 {
            return Err(EngineError::Config(
                "subscriber_buffer must be greater than 0".into(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(EngineError::Config(
                "idle_timeout must be greater than 0".into(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(EngineError::Config(
                "reap_interval must be greater than 0".into(),
            ));
        }
        if self.max_rebase_distance == 0 {
            return Err(EngineError::Config(
                "max_rebase_distance must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    pub fn subscriber_buffer(mut self, size: usize) -> Self {
        self.subscriber_buffer = size;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Process-wide logging setup consumed by [`crate::init_observability`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub enabled: bool,
    /// `EnvFilter` directives such as `info` or `chatstream_core=debug`.
    pub filter: String,
    /// JSONL log file. `None` writes compact lines to stdout.
    pub json_log_path: Option<PathBuf>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: "info".into(),
            json_log_path: None,
        }
    }
}

impl ObservabilityConfig {
    /// Reads logging settings after loading `.env`.
    ///
    /// - `CHATSTREAM_OBSERVABILITY_ENABLED` (`true`/`false`, `on`/`off`, ...)
    /// - `CHATSTREAM_LOG_LEVEL`, falling back to `RUST_LOG`
    /// - `CHATSTREAM_JSON_LOG_PATH`
    pub fn from_env() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, EngineError> {
        let mut config = Self::default();
        if let Some(enabled) = parse_flag(&lookup, "CHATSTREAM_OBSERVABILITY_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(filter) = ["CHATSTREAM_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(|key| lookup(key))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
        {
            config.filter = filter;
        }
        if let Some(path) = lookup("CHATSTREAM_JSON_LOG_PATH").filter(|p| !p.trim().is_empty()) {
            config.json_log_path = Some(PathBuf::from(path));
        }
        Ok(config)
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn json_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.json_log_path = Some(path.into());
        self
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, EngineError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" | "enabled" => Ok(Some(true)),
        "0" | "false" | "no" | "off" | "disabled" => Ok(Some(false)),
        _ => Err(EngineError::Config(format!("invalid value for {key}: {raw:?}"))),
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, EngineError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| EngineError::Config(format!("invalid value for {key}: {raw:?}")))
}
