//! The configuration provider facade.
//!
//! [`ConfigProvider`] ties the replica pool, watch registry, adapters and
//! snapshot store together behind a small API: load once, read keys, refresh
//! on demand or in the background.

pub mod builder;

pub use builder::{BuilderError, ConfigProviderBuilder};

use crate::{
    refresh::{spawn_refresh_loop, ProviderError, RefreshOrchestrator, RefreshReport},
    replica::{executor::FailoverConfig, pool::ReplicaClientPool},
    snapshot::{CachedSnapshot, SnapshotSubscriber},
    watch::{WatchError, WatchRegistration},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Replicated configuration provider.
pub struct ConfigProvider {
    orchestrator: Arc<RefreshOrchestrator>,
    poll_interval: Duration,
}

impl ConfigProvider {
    #[must_use]
    pub fn new(orchestrator: Arc<RefreshOrchestrator>, poll_interval: Duration) -> Self {
        Self { orchestrator, poll_interval }
    }

    #[must_use]
    pub fn builder() -> ConfigProviderBuilder {
        ConfigProviderBuilder::new()
    }

    /// Performs the initial load.
    ///
    /// # Errors
    ///
    /// See [`RefreshOrchestrator::load`].
    pub async fn load(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        self.orchestrator.load(cancel).await
    }

    /// Value of `key` in the current snapshot.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.orchestrator.snapshots().current().get(key).map(str::to_string)
    }

    /// The current snapshot. Holding it pins one consistent view.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CachedSnapshot> {
        self.orchestrator.snapshots().current()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<CachedSnapshot>> {
        self.orchestrator.snapshots().subscribe()
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn SnapshotSubscriber>) {
        self.orchestrator.snapshots().add_subscriber(subscriber);
    }

    /// Runs one refresh pass.
    ///
    /// # Errors
    ///
    /// See [`RefreshOrchestrator::refresh`].
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<RefreshReport, ProviderError> {
        self.orchestrator.refresh(cancel).await
    }

    pub async fn try_refresh(&self, cancel: &CancellationToken) -> bool {
        self.orchestrator.try_refresh(cancel).await
    }

    /// Schedules every watched key for a check within `max_delay`, for
    /// example after a push notification that something changed.
    pub fn set_dirty(&self, max_delay: Duration) {
        self.orchestrator.set_dirty(max_delay);
    }

    /// Adds or replaces a watched key after construction.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError`] if the registration is invalid.
    pub fn watch(&self, registration: WatchRegistration) -> Result<(), WatchError> {
        self.orchestrator.registry().register(registration).map(|_| ())
    }

    /// Spawns the background refresh loop. It stops when `shutdown` is
    /// cancelled.
    #[must_use]
    pub fn start_background_refresh(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        spawn_refresh_loop(Arc::clone(&self.orchestrator), self.poll_interval, shutdown)
    }

    pub fn update_failover_config(&self, config: FailoverConfig) {
        self.orchestrator.executor().update_config(config);
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ReplicaClientPool> {
        self.orchestrator.executor().pool()
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<RefreshOrchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
