//! Provider configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: serde defaults and `Default` implementations
//! 2. **Config file**: TOML file named by `CAIRN_CONFIG` (default `config/cairn.toml`)
//! 3. **Environment variables**: `CAIRN__SECTION__FIELD` overrides single fields
//!
//! # Configuration Sections
//!
//! - [`StoreConfig`]: statically configured replica endpoints
//! - [`DiscoveryConfig`]: runtime replica discovery
//! - [`FailoverConfig`]: parallel retry interval and endpoint backoff bounds
//! - [`RefreshConfig`]: poll interval and watched keys
//! - [`StartupConfig`]: initial load timeout and optional mode
//! - [`LoggingConfig`]: log level and format
//!
//! # Example
//!
//! ```toml
//! trim_key_prefixes = ["MyApp:"]
//!
//! [store]
//! endpoints = ["https://primary.config.example", "https://west.config.example"]
//!
//! [[selectors]]
//! key_filter = "MyApp:*"
//!
//! [[refresh.watch]]
//! key = "MyApp:Sentinel"
//! cache_expiration_seconds = 30
//! refresh_all = true
//! ```

use crate::{
    adapter::AdapterPipeline,
    refresh::LoadOptions,
    replica::{endpoint::Endpoint, executor::FailoverConfig},
    types::{KeyIdentity, SettingSelector},
    watch::{WatchRegistration, MIN_CACHE_EXPIRATION},
};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

/// Statically configured replicas, primary first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Runtime replica discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Defaults to `false`.
    #[serde(default)]
    pub enabled: bool,

    /// Endpoint to discover replicas of. Defaults to the first static endpoint.
    #[serde(default)]
    pub origin: Option<String>,

    /// Minimum seconds between discovery refreshes. Defaults to `3600`.
    #[serde(default = "default_discovery_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
}

fn default_discovery_refresh_interval_seconds() -> u64 {
    3600
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            origin: None,
            refresh_interval_seconds: default_discovery_refresh_interval_seconds(),
        }
    }
}

/// One watched key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub key: String,

    #[serde(default)]
    pub label: Option<String>,

    /// Seconds between change checks. At least `1`, defaults to `30`.
    #[serde(default = "default_cache_expiration_seconds")]
    pub cache_expiration_seconds: u64,

    /// Reload everything when this key changes.
    #[serde(default)]
    pub refresh_all: bool,
}

fn default_cache_expiration_seconds() -> u64 {
    30
}

impl WatchConfig {
    #[must_use]
    pub fn identity(&self) -> KeyIdentity {
        KeyIdentity { key: self.key.clone(), label: self.label.clone() }
    }

    #[must_use]
    pub fn registration(&self) -> WatchRegistration {
        WatchRegistration {
            identity: self.identity(),
            cache_expiration: Duration::from_secs(self.cache_expiration_seconds),
            refresh_all: self.refresh_all,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Background loop tick in milliseconds. Defaults to `1000`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub watch: Vec<WatchConfig>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self { poll_interval_ms: default_poll_interval_ms(), watch: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Seconds the initial load may spend retrying. Defaults to `100`.
    #[serde(default = "default_startup_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Start with empty configuration instead of failing. Defaults to `false`.
    #[serde(default)]
    pub optional: bool,
}

fn default_startup_timeout_seconds() -> u64 {
    100
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self { timeout_seconds: default_startup_timeout_seconds(), optional: false }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset. Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `"pretty"` or `"json"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Complete provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub replica_discovery: DiscoveryConfig,

    #[serde(default)]
    pub failover: FailoverConfig,

    /// Applied in order. Defaults to every key without a label.
    #[serde(default = "default_selectors")]
    pub selectors: Vec<SettingSelector>,

    #[serde(default)]
    pub trim_key_prefixes: Vec<String>,

    #[serde(default)]
    pub refresh: RefreshConfig,

    #[serde(default)]
    pub startup: StartupConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_selectors() -> Vec<SettingSelector> {
    vec![SettingSelector::default()]
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            replica_discovery: DiscoveryConfig::default(),
            failover: FailoverConfig::default(),
            selectors: default_selectors(),
            trim_key_prefixes: Vec::new(),
            refresh: RefreshConfig::default(),
            startup: StartupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Use `__` as a separator for nested fields
    /// (e.g. `CAIRN__FAILOVER__PARALLEL_RETRY_INTERVAL_MS=2000`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("failover.parallel_retry_interval_ms", 5000)?
            .set_default("failover.min_backoff_seconds", 30)?
            .set_default("failover.max_backoff_seconds", 600)?
            .set_default("refresh.poll_interval_ms", 1000)?
            .set_default("startup.timeout_seconds", 100)?
            .set_default("startup.optional", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("CAIRN").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/cairn.toml`, or the file named by
    /// `CAIRN_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CAIRN_CONFIG").unwrap_or_else(|_| "config/cairn.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Validates the configuration.
    ///
    /// Checks include:
    /// - At least one endpoint, or discovery enabled with an origin
    /// - Every endpoint and the origin parse as URLs with a host
    /// - Non-zero parallel retry interval and poll interval
    /// - `min_backoff_seconds` is non-zero and at most `max_backoff_seconds`
    /// - Watch expirations of at least one second, no duplicate watches
    /// - Logging format is either `"json"` or `"pretty"`
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        let has_origin = self.replica_discovery.enabled && self.replica_discovery.origin.is_some();
        if self.store.endpoints.is_empty() && !has_origin {
            return Err("No store endpoints configured".to_string());
        }

        self.endpoints()?;
        self.discovery_origin()?;

        if self.failover.parallel_retry_interval_ms == 0 {
            return Err("Parallel retry interval must be greater than 0".to_string());
        }

        if self.failover.min_backoff_seconds == 0 {
            return Err("Minimum backoff must be greater than 0".to_string());
        }

        if self.failover.min_backoff_seconds > self.failover.max_backoff_seconds {
            return Err(format!(
                "Minimum backoff ({}s) exceeds maximum backoff ({}s)",
                self.failover.min_backoff_seconds, self.failover.max_backoff_seconds
            ));
        }

        if !(0.0..=1.0).contains(&self.failover.jitter_factor) {
            return Err("Jitter factor must be between 0.0 and 1.0".to_string());
        }

        if self.refresh.poll_interval_ms == 0 {
            return Err("Refresh poll interval must be greater than 0".to_string());
        }

        if self.selectors.is_empty() {
            return Err("At least one selector is required".to_string());
        }

        let mut seen = HashSet::new();
        for watch in &self.refresh.watch {
            if Duration::from_secs(watch.cache_expiration_seconds) < MIN_CACHE_EXPIRATION {
                return Err(format!("Cache expiration for watched key {} must be at least 1s", watch.identity()));
            }
            if !seen.insert(watch.identity()) {
                return Err(format!("Watched key {} is registered more than once", watch.identity()));
            }
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }

    /// Parsed static endpoints in configuration order.
    ///
    /// # Errors
    ///
    /// Returns an error string naming the first endpoint that fails to parse.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, String> {
        self.store
            .endpoints
            .iter()
            .map(|raw| Endpoint::parse(raw).map_err(|e| format!("Invalid store endpoint {raw}: {e}")))
            .collect()
    }

    /// Parsed discovery origin, if discovery is enabled and one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error string if the origin does not parse.
    pub fn discovery_origin(&self) -> Result<Option<Endpoint>, String> {
        match (&self.replica_discovery.origin, self.replica_discovery.enabled) {
            (Some(raw), true) => Endpoint::parse(raw)
                .map(Some)
                .map_err(|e| format!("Invalid discovery origin {raw}: {e}")),
            _ => Ok(None),
        }
    }

    #[must_use]
    pub fn watch_registrations(&self) -> Vec<WatchRegistration> {
        self.refresh.watch.iter().map(WatchConfig::registration).collect()
    }

    #[must_use]
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            selectors: self.selectors.clone(),
            optional: self.startup.optional,
            startup_timeout: Duration::from_secs(self.startup.timeout_seconds),
        }
    }

    /// Adapter pipeline with the configured key-prefix trimming and no adapters.
    #[must_use]
    pub fn adapter_pipeline(&self) -> AdapterPipeline {
        AdapterPipeline::new().with_trim_prefixes(self.trim_key_prefixes.iter().cloned())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.refresh.poll_interval_ms)
    }

    #[must_use]
    pub fn discovery_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.replica_discovery.refresh_interval_seconds)
    }
}
