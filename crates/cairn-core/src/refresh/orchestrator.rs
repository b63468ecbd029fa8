//! Loading and selective refresh of the cached configuration.
//!
//! # Refresh Pass
//!
//! ```text
//! Idle ──► CheckingDue ──► for each due watched key (concurrently):
//!                             guard ─► check_changed ─┬─ unchanged ──────────► skip
//!                                                     ├─ changed, sentinel ──► full reload
//!                                                     └─ changed ────────────► fetch_one
//!                          │
//!                          ▼
//!          ┌───────────────┴────────────────┐
//!      Unchanged                      ChangeDetected
//!   (nothing published)      merge under lock, publish one snapshot
//! ```
//!
//! The state lock serializes merge and publish, so each pass replaces the
//! snapshot at most once and readers never see a half-merged pass. A full
//! reload holds the lock from its listing through its publish. A point change
//! is merged only if its entry's known token is still the one it was checked
//! against; otherwise a reload got there first and the change is dropped.

use super::errors::ProviderError;
use crate::{
    adapter::AdapterPipeline,
    metrics::{self, PassResult},
    replica::{backoff::BackoffPolicy, executor::FailoverExecutor},
    snapshot::SnapshotStore,
    types::{ChangeCheck, ChangeToken, ConfigSetting, KeyIdentity, SettingSelector},
    watch::{WatchedEntry, WatchedKeyRegistry},
};
use futures::future::join_all;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default time budget for the initial load, retries included.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(100);

const STARTUP_MIN_BACKOFF: Duration = Duration::from_secs(5);
const STARTUP_MAX_BACKOFF: Duration = Duration::from_secs(30);
const STARTUP_JITTER: f64 = 0.5;

/// What a full load reads and how it treats failures.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Applied in order; later selectors override earlier ones on the same key.
    pub selectors: Vec<SettingSelector>,
    /// Keep going with empty (or previous) configuration when loading fails,
    /// and keep previous values when an adapter fails.
    pub optional: bool,
    pub startup_timeout: Duration,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            selectors: vec![SettingSelector::default()],
            optional: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

/// Where a refresh pass ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPhase {
    /// Nothing was due.
    #[default]
    Idle,
    CheckingDue,
    /// Everything checked was unchanged; nothing was published.
    Unchanged,
    /// At least one change was merged and a snapshot published.
    ChangeDetected,
}

/// Summary of one refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub phase: RefreshPhase,
    /// Watched keys whose change check ran.
    pub checked: usize,
    /// Watched keys found changed.
    pub changed: usize,
    /// Due keys skipped because another pass was refreshing them.
    pub skipped: usize,
    /// A full reload ran.
    pub reloaded: bool,
    pub published: bool,
}

#[derive(Debug, Clone)]
struct LoadedEntry {
    setting: ConfigSetting,
    pairs: Vec<(String, String)>,
}

/// Raw settings in load order with their adapter output.
#[derive(Default)]
struct MaterializedState {
    entries: Vec<LoadedEntry>,
}

impl MaterializedState {
    fn position(&self, identity: &KeyIdentity) -> Option<usize> {
        self.entries.iter().position(|e| identity.matches(&e.setting))
    }

    fn token_of(&self, identity: &KeyIdentity) -> Option<ChangeToken> {
        self.position(identity).map(|i| self.entries[i].setting.etag.clone())
    }

    fn upsert(&mut self, entry: LoadedEntry) {
        match self.position(&entry.setting.identity()) {
            Some(i) => self.entries[i] = entry,
            None => self.entries.push(entry),
        }
    }

    fn remove(&mut self, identity: &KeyIdentity) -> bool {
        match self.position(identity) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Later entries override earlier ones on the same key.
    fn values(&self) -> HashMap<String, String> {
        let mut values = HashMap::new();
        for entry in &self.entries {
            for (key, value) in &entry.pairs {
                values.insert(key.clone(), value.clone());
            }
        }
        values
    }
}

enum PointChange {
    Upsert { entry: Arc<WatchedEntry>, checked: Option<ChangeToken>, setting: ConfigSetting },
    Remove { entry: Arc<WatchedEntry>, checked: Option<ChangeToken> },
}

impl PointChange {
    fn entry(&self) -> &Arc<WatchedEntry> {
        match self {
            Self::Upsert { entry, .. } | Self::Remove { entry, .. } => entry,
        }
    }

    /// Whether the entry still holds the token this change was detected against.
    fn is_current(&self) -> bool {
        let checked = match self {
            Self::Upsert { checked, .. } | Self::Remove { checked, .. } => checked,
        };
        self.entry().known_token() == *checked
    }
}

enum EntryOutcome {
    Skipped,
    Unchanged,
    Changed(PointChange),
    ReloadAll,
}

/// Drives loads and refresh passes and owns the materialized configuration.
pub struct RefreshOrchestrator {
    executor: Arc<FailoverExecutor>,
    registry: Arc<WatchedKeyRegistry>,
    adapters: AdapterPipeline,
    snapshots: Arc<SnapshotStore>,
    options: LoadOptions,
    state: Mutex<MaterializedState>,
    loaded: AtomicBool,
}

impl RefreshOrchestrator {
    #[must_use]
    pub fn new(
        executor: Arc<FailoverExecutor>,
        registry: Arc<WatchedKeyRegistry>,
        adapters: AdapterPipeline,
        snapshots: Arc<SnapshotStore>,
        options: LoadOptions,
    ) -> Self {
        Self {
            executor,
            registry,
            adapters,
            snapshots,
            options,
            state: Mutex::new(MaterializedState::default()),
            loaded: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<FailoverExecutor> {
        &self.executor
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<WatchedKeyRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    #[must_use]
    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Whether a full load has succeeded. Until then a refresh performs a
    /// full load instead of change checks.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Initial load.
    ///
    /// Transient failures are retried with jittered backoff until the startup
    /// timeout. In optional mode a failed load is logged and the provider
    /// starts with empty configuration.
    ///
    /// # Errors
    ///
    /// Returns the load failure (or [`ProviderError::StartupTimeout`]) unless
    /// optional mode is on. Cancellation is always returned.
    pub async fn load(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        match self.load_with_retry(cancel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) if self.options.optional => {
                warn!(error = %e, "initial configuration load failed, continuing without it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn load_with_retry(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let deadline = Instant::now() + self.options.startup_timeout;
        let backoff = BackoffPolicy::new(STARTUP_MIN_BACKOFF, STARTUP_MAX_BACKOFF).with_jitter(STARTUP_JITTER);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let err = match self.full_load(cancel).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempt, "initial configuration load succeeded after retry");
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }

            let delay = backoff.interval(attempt);
            if Instant::now() + delay >= deadline {
                warn!(attempts = attempt, error = %err, "startup timeout reached");
                return Err(ProviderError::StartupTimeout {
                    timeout: self.options.startup_timeout,
                    last: Box::new(err),
                });
            }

            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "initial configuration load failed, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Reads every selected setting plus the watched keys, runs the adapters
    /// and publishes the result.
    async fn full_load(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let (settings, replica) = self.executor.list_settings(&self.options.selectors, cancel).await?;

        let mut raw: Vec<ConfigSetting> = Vec::with_capacity(settings.len());
        let mut index: HashMap<KeyIdentity, usize> = HashMap::with_capacity(settings.len());
        for setting in settings {
            match index.get(&setting.identity()) {
                Some(&i) => raw[i] = setting,
                None => {
                    index.insert(setting.identity(), raw.len());
                    raw.push(setting);
                }
            }
        }

        let watched = self.registry.entries();
        for entry in &watched {
            if index.contains_key(entry.identity()) {
                continue;
            }
            if let Some(setting) = self.executor.fetch_one(entry.identity(), cancel).await? {
                index.insert(setting.identity(), raw.len());
                raw.push(setting);
            }
        }

        let mut previous: HashMap<KeyIdentity, LoadedEntry> = if self.options.optional {
            state.entries.iter().map(|e| (e.setting.identity(), e.clone())).collect()
        } else {
            HashMap::new()
        };

        let mut entries = Vec::with_capacity(raw.len());
        for setting in raw {
            match self.adapters.process(&setting).await {
                Ok(pairs) => entries.push(LoadedEntry { setting, pairs }),
                Err(e) if self.options.optional => {
                    warn!(key = %setting.key, error = %e, "adapter failed, keeping previous value");
                    if let Some(kept) = previous.remove(&setting.identity()) {
                        entries.push(kept);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        state.entries = entries;

        for entry in &watched {
            entry.set_known_token(state.token_of(entry.identity()));
        }

        let snapshot = self.snapshots.publish(state.values());
        self.registry.mark_all_attempted(Instant::now());
        self.loaded.store(true, Ordering::Release);

        info!(
            endpoint = %replica.endpoint(),
            settings = state.entries.len(),
            keys = snapshot.len(),
            version = snapshot.version(),
            "configuration loaded"
        );

        Ok(())
    }

    /// Runs one refresh pass over the due watched keys.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::RefreshFailed`] if any watched key could not
    /// be refreshed; changes found on the other keys are published first.
    /// Returns the load error if the provider was not loaded and the full
    /// load failed.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<RefreshReport, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        if !self.is_loaded() {
            debug!("configuration not loaded yet, refreshing with a full load");
            if let Err(e) = self.full_load(cancel).await {
                metrics::record_refresh_pass(PassResult::Failed);
                return Err(e);
            }
            metrics::record_refresh_pass(PassResult::Published);
            return Ok(RefreshReport {
                phase: RefreshPhase::ChangeDetected,
                reloaded: true,
                published: true,
                ..RefreshReport::default()
            });
        }

        let due = self.registry.due_entries(Instant::now());
        if due.is_empty() {
            return Ok(RefreshReport::default());
        }

        debug!(due = due.len(), "checking watched keys");
        let mut report = RefreshReport { phase: RefreshPhase::CheckingDue, ..RefreshReport::default() };

        let outcomes = join_all(due.iter().map(|entry| self.check_entry(entry, cancel))).await;

        let mut failures: Vec<ProviderError> = Vec::new();
        let mut changes = Vec::new();
        let mut reload = false;

        for outcome in outcomes {
            match outcome {
                Ok(EntryOutcome::Skipped) => report.skipped += 1,
                Ok(EntryOutcome::Unchanged) => report.checked += 1,
                Ok(EntryOutcome::ReloadAll) => {
                    report.checked += 1;
                    report.changed += 1;
                    reload = true;
                }
                Ok(EntryOutcome::Changed(change)) => {
                    report.checked += 1;
                    report.changed += 1;
                    changes.push(change);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    report.checked += 1;
                    failures.push(e);
                }
            }
        }

        if reload {
            info!("watched key changed, reloading all configuration");
            match self.full_load(cancel).await {
                Ok(()) => {
                    report.reloaded = true;
                    report.published = true;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => failures.push(e),
            }
        }

        if !report.reloaded && !changes.is_empty() {
            report.published = self.merge(changes, &mut failures).await;
        }

        report.phase = if report.published { RefreshPhase::ChangeDetected } else { RefreshPhase::Unchanged };

        if let Some(first) = failures.first() {
            metrics::record_refresh_pass(PassResult::Failed);
            warn!(
                failed = failures.len(),
                checked = report.checked,
                published = report.published,
                error = %first,
                "refresh pass finished with failures"
            );
            let failed = failures.len();
            let first = failures.swap_remove(0);
            return Err(ProviderError::RefreshFailed { failed, checked: report.checked, first: Box::new(first) });
        }

        metrics::record_refresh_pass(if report.published { PassResult::Published } else { PassResult::Unchanged });
        debug!(
            checked = report.checked,
            changed = report.changed,
            skipped = report.skipped,
            published = report.published,
            "refresh pass finished"
        );

        Ok(report)
    }

    /// Refreshes and swallows failures. Returns `true` if the pass succeeded.
    pub async fn try_refresh(&self, cancel: &CancellationToken) -> bool {
        match self.refresh(cancel).await {
            Ok(_) => true,
            Err(ProviderError::Cancelled) => {
                debug!("refresh cancelled");
                false
            }
            Err(e) => {
                warn!(error = %e, "configuration refresh failed");
                false
            }
        }
    }

    /// Schedules every watched key for a check within `max_delay`.
    pub fn set_dirty(&self, max_delay: Duration) {
        debug!(max_delay_ms = max_delay.as_millis(), "watched keys marked dirty");
        self.registry.set_dirty(max_delay);
    }

    async fn check_entry(
        &self,
        entry: &Arc<WatchedEntry>,
        cancel: &CancellationToken,
    ) -> Result<EntryOutcome, ProviderError> {
        let Some(_guard) = self.registry.try_begin_refresh(entry) else {
            return Ok(EntryOutcome::Skipped);
        };

        let identity = entry.identity();
        let known = entry.known_token();
        let check = self.executor.check_changed(identity, known.as_ref(), cancel).await?;

        let outcome = match (check, known.is_some()) {
            (ChangeCheck::Unchanged, _) | (ChangeCheck::Missing, false) => EntryOutcome::Unchanged,
            _ if entry.refresh_all() => EntryOutcome::ReloadAll,
            (ChangeCheck::Missing, true) => {
                EntryOutcome::Changed(PointChange::Remove { entry: Arc::clone(entry), checked: known })
            }
            (ChangeCheck::Modified, was_present) => match self.executor.fetch_one(identity, cancel).await? {
                Some(setting) if known.as_ref() == Some(&setting.etag) => EntryOutcome::Unchanged,
                Some(setting) => {
                    EntryOutcome::Changed(PointChange::Upsert { entry: Arc::clone(entry), checked: known, setting })
                }
                None if was_present => {
                    EntryOutcome::Changed(PointChange::Remove { entry: Arc::clone(entry), checked: known })
                }
                None => EntryOutcome::Unchanged,
            },
        };

        if !matches!(outcome, EntryOutcome::Unchanged) {
            debug!(identity = %identity, "watched key changed");
        }

        Ok(outcome)
    }

    /// Applies point changes and publishes once if anything was merged.
    async fn merge(&self, changes: Vec<PointChange>, failures: &mut Vec<ProviderError>) -> bool {
        let mut state = self.state.lock().await;
        let mut merged = 0usize;

        for change in changes {
            if !change.is_current() {
                debug!(identity = %change.entry().identity(), "watched key reloaded since its check, dropping change");
                continue;
            }
            match change {
                PointChange::Upsert { entry, setting, .. } => match self.adapters.process(&setting).await {
                    Ok(pairs) => {
                        entry.set_known_token(Some(setting.etag.clone()));
                        state.upsert(LoadedEntry { setting, pairs });
                        merged += 1;
                    }
                    Err(e) if self.options.optional => {
                        warn!(key = %setting.key, error = %e, "adapter failed, keeping previous value");
                    }
                    Err(e) => failures.push(e.into()),
                },
                PointChange::Remove { entry, .. } => {
                    entry.set_known_token(None);
                    if state.remove(entry.identity()) {
                        merged += 1;
                    }
                }
            }
        }

        if merged == 0 {
            return false;
        }

        self.snapshots.publish(state.values());
        true
    }
}
