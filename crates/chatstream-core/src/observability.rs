//! Process-wide tracing setup.

use std::path::Path;

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::ObservabilityConfig;
use crate::errors::EngineError;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber described by `config`. Only the first
/// successful call has an effect; later calls return `Ok` without touching
/// the installed subscriber.
///
/// A JSON log path switches output to one JSON object per line in that file,
/// otherwise logs go to stdout in compact form. Another subscriber installed
/// by the host application takes precedence.
pub fn init_observability(config: &ObservabilityConfig) -> Result<(), EngineError> {
    INIT.get_or_try_init(|| install(config)).map(|_| ())
}

fn install(config: &ObservabilityConfig) -> Result<(), EngineError> {
    if !config.enabled {
        return Ok(());
    }
    let filter = env_filter(config)?;
    let installed = match &config.json_log_path {
        Some(path) => {
            let (dir, file_name) = split_log_path(path)?;
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .try_init()
        }
        None => {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stdout);
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .try_init()
        }
    };
    if installed.is_err() {
        tracing::debug!(
            event = "observability.already_installed",
            domain = "observability"
        );
    }
    Ok(())
}

fn env_filter(config: &ObservabilityConfig) -> Result<EnvFilter, EngineError> {
    EnvFilter::try_new(&config.filter)
        .map_err(|e| EngineError::Config(format!("invalid log filter {:?}: {e}", config.filter)))
}

fn split_log_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr), EngineError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| EngineError::Config(format!("log path {} has no file name", path.display())))?;
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                EngineError::Config(format!("cannot create log dir {}: {e}", dir.display()))
            })?;
            dir
        }
        None => Path::new("."),
    };
    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_filter_is_a_config_error() {
        let config = ObservabilityConfig::default().filter("chatstream_core=loud");
        assert!(matches!(env_filter(&config), Err(EngineError::Config(_))));
        assert!(env_filter(&ObservabilityConfig::default().filter("chatstream_core=debug")).is_ok());
    }

    #[test]
    fn log_path_parent_is_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("run.jsonl");
        let (parent, file_name) = split_log_path(&path).expect("split");
        assert!(parent.is_dir());
        assert_eq!(file_name, "run.jsonl");
        assert!(matches!(split_log_path(Path::new("/")), Err(EngineError::Config(_))));
    }

    #[test]
    fn disabled_config_installs_nothing_and_repeats_are_ok() {
        init_observability(&ObservabilityConfig::disabled()).expect("disabled");
        init_observability(&ObservabilityConfig::default()).expect("repeat");
    }
}
