//! Builder pattern for constructing a [`ConfigProvider`].

use super::ConfigProvider;
use crate::{
    adapter::{AdapterPipeline, SettingAdapter},
    config::ProviderConfig,
    refresh::{LoadOptions, RefreshOrchestrator},
    replica::{
        client::ClientFactory,
        discovery::ReplicaDiscovery,
        endpoint::Endpoint,
        errors::PoolError,
        executor::{FailoverConfig, FailoverExecutor},
        pool::{ProviderContext, ReplicaClientPool, DEFAULT_DISCOVERY_INTERVAL},
    },
    snapshot::SnapshotStore,
    types::SettingSelector,
    watch::{WatchError, WatchRegistration, WatchedKeyRegistry},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::info;

/// Errors that can occur during provider construction.
#[derive(Debug, Error)]
pub enum BuilderError {
    /// No client factory was provided.
    #[error("A client factory is required but was not provided")]
    MissingClientFactory,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Builder for constructing a [`ConfigProvider`].
///
/// # Examples
///
/// ```no_run
/// # use cairn_core::{provider::ConfigProviderBuilder, replica::{ClientFactory, Endpoint}};
/// # use cairn_core::watch::WatchRegistration;
/// # use cairn_core::types::KeyIdentity;
/// # use std::{sync::Arc, time::Duration};
/// # async fn example(factory: Arc<dyn ClientFactory>) -> Result<(), Box<dyn std::error::Error>> {
/// let provider = ConfigProviderBuilder::new()
///     .client_factory(factory)
///     .endpoint(Endpoint::parse("https://primary.config.example")?)
///     .endpoint(Endpoint::parse("https://west.config.example")?)
///     .watch(
///         WatchRegistration::sentinel(KeyIdentity::new("Sentinel"))
///             .with_cache_expiration(Duration::from_secs(30)),
///     )
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ConfigProviderBuilder {
    client_factory: Option<Arc<dyn ClientFactory>>,
    discovery: Option<Arc<dyn ReplicaDiscovery>>,
    endpoints: Vec<Endpoint>,
    discovery_origin: Option<Endpoint>,
    discovery_interval: Duration,
    failover: FailoverConfig,
    watches: Vec<WatchRegistration>,
    adapters: AdapterPipeline,
    selectors: Vec<SettingSelector>,
    options: LoadOptions,
    poll_interval: Duration,
}

impl ConfigProviderBuilder {
    /// Creates a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client_factory: None,
            discovery: None,
            endpoints: Vec::new(),
            discovery_origin: None,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            failover: FailoverConfig::default(),
            watches: Vec::new(),
            adapters: AdapterPipeline::new(),
            selectors: Vec::new(),
            options: LoadOptions::default(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Starts from a loaded [`ProviderConfig`]. The client factory (and
    /// discovery, if enabled) still have to be supplied. Selectors added with
    /// [`select`](Self::select) replace the configured ones.
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError::InvalidConfig`] if the configuration does not validate.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, BuilderError> {
        config.validate().map_err(BuilderError::InvalidConfig)?;

        Ok(Self {
            endpoints: config.endpoints().map_err(BuilderError::InvalidConfig)?,
            discovery_origin: config.discovery_origin().map_err(BuilderError::InvalidConfig)?,
            discovery_interval: config.discovery_refresh_interval(),
            failover: config.failover.clone(),
            watches: config.watch_registrations(),
            adapters: config.adapter_pipeline(),
            options: config.load_options(),
            poll_interval: config.poll_interval(),
            ..Self::new()
        })
    }

    #[must_use]
    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.client_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn discovery(mut self, discovery: Arc<dyn ReplicaDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Appends a static endpoint. The first one added is the primary.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    #[must_use]
    pub fn endpoints(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        self.endpoints.extend(endpoints);
        self
    }

    /// Endpoint to discover replicas of (default: the primary).
    #[must_use]
    pub fn discovery_origin(mut self, origin: Endpoint) -> Self {
        self.discovery_origin = Some(origin);
        self
    }

    /// Minimum time between discovery refreshes (default: 1 hour).
    #[must_use]
    pub fn discovery_refresh_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    #[must_use]
    pub fn failover_config(mut self, config: FailoverConfig) -> Self {
        self.failover = config;
        self
    }

    #[must_use]
    pub fn parallel_retry_interval(mut self, interval: Duration) -> Self {
        self.failover.parallel_retry_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Selects settings to load. Without any call every unlabelled key is
    /// selected.
    #[must_use]
    pub fn select(mut self, selector: SettingSelector) -> Self {
        self.selectors.push(selector);
        self
    }

    #[must_use]
    pub fn watch(mut self, registration: WatchRegistration) -> Self {
        self.watches.push(registration);
        self
    }

    /// Appends an adapter. Adapters are consulted in the order added.
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn SettingAdapter>) -> Self {
        self.adapters = self.adapters.with_adapter(adapter);
        self
    }

    #[must_use]
    pub fn trim_key_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.adapters = self.adapters.with_trim_prefixes(prefixes);
        self
    }

    /// Start with empty configuration instead of failing when the initial
    /// load fails, and keep previous values when an adapter fails.
    #[must_use]
    pub fn optional(mut self, optional: bool) -> Self {
        self.options.optional = optional;
        self
    }

    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.options.startup_timeout = timeout;
        self
    }

    /// Tick of the background refresh loop (default: 1 second).
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builds the provider. Discovery, when configured, runs here; nothing
    /// is loaded until [`ConfigProvider::load`].
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError::MissingClientFactory`] without a client factory,
    /// [`BuilderError::Pool`] if no endpoint is available, and
    /// [`BuilderError::Watch`] for invalid watch registrations.
    pub async fn build(self) -> Result<ConfigProvider, BuilderError> {
        let factory = self.client_factory.ok_or(BuilderError::MissingClientFactory)?;
        let backoff = self.failover.backoff_policy();

        let pool = match self.discovery {
            Some(discovery) => {
                let context = ProviderContext::new(factory).with_discovery(discovery);
                ReplicaClientPool::connect(self.endpoints, self.discovery_origin, context, backoff).await?
            }
            None => ReplicaClientPool::new(self.endpoints, ProviderContext::new(factory), backoff)?,
        }
        .with_discovery_interval(self.discovery_interval);

        let registry = Arc::new(WatchedKeyRegistry::new());
        for registration in self.watches {
            registry.register(registration)?;
        }

        let mut options = self.options;
        if !self.selectors.is_empty() {
            options.selectors = self.selectors;
        }

        let members = pool.len();
        let executor = Arc::new(FailoverExecutor::new(Arc::new(pool), self.failover));
        let orchestrator = Arc::new(RefreshOrchestrator::new(
            executor,
            registry,
            self.adapters,
            Arc::new(SnapshotStore::new()),
            options,
        ));

        info!(
            replicas = members,
            watched = orchestrator.registry().len(),
            poll_interval_ms = self.poll_interval.as_millis(),
            "configuration provider built"
        );

        Ok(ConfigProvider::new(orchestrator, self.poll_interval))
    }
}

impl Default for ConfigProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
