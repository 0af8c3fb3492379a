// Tracing initialization with a configurable and reloadable log level.
use std::sync::OnceLock;

use herdcache_config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

/// Install the global subscriber for an embedding binary or test.
///
/// `RUST_LOG` wins over the configured level when set. Calling this twice is
/// harmless: the second subscriber is not installed.
pub fn init_tracing(config: &LoggingConfig) {
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(&config.level));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let json = config.json;
    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .try_init();
}

/// Apply a new logging level at runtime if the reload handle is configured.
pub fn apply_logging_level(level: &str) {
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                let _ = handle.modify(|f| *f = filter);
                tracing::info!(level, "log level changed");
            }
            Err(e) => tracing::warn!(level, error = %e, "invalid log level ignored"),
        }
    }
}
