//! Published configuration snapshots.
//!
//! A [`CachedSnapshot`] is immutable. Each publish swaps in a whole new one, so
//! a reader holding a snapshot sees one complete pass and never a mix of two.

use crate::metrics;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::watch;
use tracing::info;

/// Materialized key/value configuration at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSnapshot {
    values: HashMap<String, String>,
    version: u64,
    loaded_at: DateTime<Utc>,
}

impl CachedSnapshot {
    /// The snapshot before anything was loaded: no keys, version 0.
    #[must_use]
    pub fn empty() -> Self {
        Self { values: HashMap::new(), version: 0, loaded_at: Utc::now() }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[must_use]
    pub fn values(&self) -> &HashMap<String, String> {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Increases by one with every publish.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// Notified after a new snapshot replaces the old one.
pub trait SnapshotSubscriber: Send + Sync + 'static {
    fn on_snapshot_replaced(&self, snapshot: &Arc<CachedSnapshot>);
}

impl<F> SnapshotSubscriber for F
where
    F: Fn(&Arc<CachedSnapshot>) + Send + Sync + 'static,
{
    fn on_snapshot_replaced(&self, snapshot: &Arc<CachedSnapshot>) {
        self(snapshot);
    }
}

/// Holds the current snapshot and fans out replacements.
///
/// Readers load through `ArcSwap` without locking. Publishing is not
/// synchronized here; callers serialize publishes.
pub struct SnapshotStore {
    current: ArcSwap<CachedSnapshot>,
    sender: watch::Sender<Arc<CachedSnapshot>>,
    subscribers: RwLock<Vec<Arc<dyn SnapshotSubscriber>>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        let initial = Arc::new(CachedSnapshot::empty());
        let (sender, _) = watch::channel(Arc::clone(&initial));
        Self { current: ArcSwap::new(initial), sender, subscribers: RwLock::new(Vec::new()) }
    }

    #[must_use]
    pub fn current(&self) -> Arc<CachedSnapshot> {
        self.current.load_full()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Receiver that observes every snapshot published after this call.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<CachedSnapshot>> {
        self.sender.subscribe()
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn SnapshotSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Publishes `values` as the next version and notifies every subscriber
    /// once.
    pub fn publish(&self, values: HashMap<String, String>) -> Arc<CachedSnapshot> {
        let version = self.current.load().version + 1;
        let snapshot = Arc::new(CachedSnapshot { values, version, loaded_at: Utc::now() });

        self.current.store(Arc::clone(&snapshot));
        self.sender.send_replace(Arc::clone(&snapshot));
        metrics::record_snapshot(version, snapshot.len());

        info!(version, keys = snapshot.len(), "configuration snapshot published");

        let subscribers = self.subscribers.read().clone();
        for subscriber in &subscribers {
            subscriber.on_snapshot_replaced(&snapshot);
        }

        snapshot
    }
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("version", &self.version())
            .field("subscribers", &self.subscribers.read().len())
            .finish_non_exhaustive()
    }
}
