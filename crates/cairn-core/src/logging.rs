//! Tracing subscriber setup for hosts that do not install their own.

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Builds the filter: `RUST_LOG` when set and valid, otherwise
/// `warn,cairn_core=<level>`.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let fallback = || EnvFilter::new(format!("warn,cairn_core={}", config.level));

    match std::env::var("RUST_LOG") {
        Ok(env_filter) if env_filter == "debug" || env_filter == "trace" => {
            EnvFilter::new(format!("warn,cairn_core={env_filter}"))
        }
        Ok(_) => EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| fallback()),
        Err(_) => fallback(),
    }
}

/// Installs a global subscriber with a `pretty` or `json` fmt layer.
///
/// Returns `false` if a global subscriber was already set, in which case the
/// existing one is left alone.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let registry = tracing_subscriber::registry().with(build_filter(config));

    if config.format.as_str() == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer().json();
        registry.with(fmt_layer).try_init().is_ok()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).try_init().is_ok()
    }
}
