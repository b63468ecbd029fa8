//! Watched keys and their refresh schedule.
//!
//! A watched key is polled with a cheap change check once its cache
//! expiration passes. The registry hands out due entries in registration
//! order and guarantees at most one in-flight refresh per identity.
//!
//! # Refresh Guard
//!
//! ```text
//! due_entries(now) ──► try_begin_refresh(entry)
//!                            │
//!                    ┌───────┴────────┐
//!                    │ permit taken?  │── yes ──► None (refresh in flight)
//!                    └───────┬────────┘
//!                            │ no
//!                    ┌───────┴────────┐
//!                    │ still due?     │── no ───► None (another pass finished it)
//!                    └───────┬────────┘
//!                            │ yes
//!                            ▼
//!                   RefreshGuard (RAII)
//!                   drop ──► expiration = now + interval
//! ```

use crate::types::{ChangeToken, KeyIdentity};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tracing::debug;

/// Shortest accepted cache expiration.
pub const MIN_CACHE_EXPIRATION: Duration = Duration::from_secs(1);

/// Cache expiration used when a registration does not set one.
pub const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("Cache expiration for {identity} is {actual:?}, minimum is 1s")]
    ExpirationTooShort { identity: String, actual: Duration },
}

/// Request to watch one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRegistration {
    pub identity: KeyIdentity,
    pub cache_expiration: Duration,
    /// Reload every selected setting when this key changes (sentinel key).
    pub refresh_all: bool,
}

impl WatchRegistration {
    #[must_use]
    pub fn new(identity: KeyIdentity) -> Self {
        Self { identity, cache_expiration: DEFAULT_CACHE_EXPIRATION, refresh_all: false }
    }

    /// Watches `identity` as a sentinel: any change reloads everything.
    #[must_use]
    pub fn sentinel(identity: KeyIdentity) -> Self {
        Self { refresh_all: true, ..Self::new(identity) }
    }

    #[must_use]
    pub fn with_cache_expiration(mut self, cache_expiration: Duration) -> Self {
        self.cache_expiration = cache_expiration;
        self
    }

    /// # Errors
    ///
    /// Returns [`WatchError::ExpirationTooShort`] below [`MIN_CACHE_EXPIRATION`].
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.cache_expiration < MIN_CACHE_EXPIRATION {
            return Err(WatchError::ExpirationTooShort {
                identity: self.identity.to_string(),
                actual: self.cache_expiration,
            });
        }
        Ok(())
    }
}

/// Registry entry for one watched identity.
///
/// Re-registering the identity updates the entry behind the same `Arc`, so
/// its refresh gate and known token carry over.
pub struct WatchedEntry {
    identity: KeyIdentity,
    interval: Mutex<Duration>,
    refresh_all: AtomicBool,
    expires_at: Mutex<Instant>,
    /// Change token of the last observed value; `None` when the key was
    /// absent (or never seen).
    known_token: Mutex<Option<ChangeToken>>,
    gate: Arc<Semaphore>,
}

impl WatchedEntry {
    fn new(registration: WatchRegistration, now: Instant, known_token: Option<ChangeToken>) -> Self {
        Self {
            identity: registration.identity,
            interval: Mutex::new(registration.cache_expiration),
            refresh_all: AtomicBool::new(registration.refresh_all),
            expires_at: Mutex::new(now + registration.cache_expiration),
            known_token: Mutex::new(known_token),
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &KeyIdentity {
        &self.identity
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        *self.interval.lock()
    }

    #[must_use]
    pub fn refresh_all(&self) -> bool {
        self.refresh_all.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn expires_at(&self) -> Instant {
        *self.expires_at.lock()
    }

    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        *self.expires_at.lock() <= now
    }

    /// Pushes the next check out by one interval from `now`.
    pub fn mark_attempted(&self, now: Instant) {
        *self.expires_at.lock() = now + self.interval();
    }

    #[must_use]
    pub fn known_token(&self) -> Option<ChangeToken> {
        self.known_token.lock().clone()
    }

    pub fn set_known_token(&self, token: Option<ChangeToken>) {
        *self.known_token.lock() = token;
    }

    fn reconfigure(&self, registration: &WatchRegistration, now: Instant) {
        *self.interval.lock() = registration.cache_expiration;
        self.refresh_all.store(registration.refresh_all, Ordering::Release);
        *self.expires_at.lock() = now + registration.cache_expiration;
    }

    fn expire_within(&self, now: Instant, delay: Duration) {
        let mut expires_at = self.expires_at.lock();
        let deadline = now + delay;
        if *expires_at > deadline {
            *expires_at = deadline;
        }
    }
}

impl fmt::Debug for WatchedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchedEntry")
            .field("identity", &self.identity)
            .field("interval", &self.interval())
            .field("refresh_all", &self.refresh_all())
            .field("expires_at", &self.expires_at())
            .finish_non_exhaustive()
    }
}

/// Exclusive right to refresh one watched entry.
///
/// Dropping the guard marks the entry attempted, so its next check is one
/// interval away however the refresh ended.
pub struct RefreshGuard {
    entry: Arc<WatchedEntry>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.entry.mark_attempted(Instant::now());
    }
}

/// Ordered set of watched entries.
#[derive(Default)]
pub struct WatchedKeyRegistry {
    entries: RwLock<Vec<Arc<WatchedEntry>>>,
}

impl WatchedKeyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a watch, or updates the existing one for the same identity in
    /// place (keeping its position, refresh gate and last known token).
    ///
    /// # Errors
    ///
    /// Returns [`WatchError`] if the registration is invalid.
    pub fn register(&self, registration: WatchRegistration) -> Result<Arc<WatchedEntry>, WatchError> {
        registration.validate()?;
        let now = Instant::now();
        let mut entries = self.entries.write();

        if let Some(existing) = entries.iter().find(|e| e.identity == registration.identity) {
            existing.reconfigure(&registration, now);
            debug!(identity = %existing.identity, "watch registration updated");
            return Ok(Arc::clone(existing));
        }

        let entry = Arc::new(WatchedEntry::new(registration, now, None));
        debug!(identity = %entry.identity, interval_ms = entry.interval().as_millis(), "key watched");
        entries.push(Arc::clone(&entry));
        Ok(entry)
    }

    /// All entries in registration order.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<WatchedEntry>> {
        self.entries.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entries whose cache expiration has passed, in registration order.
    #[must_use]
    pub fn due_entries(&self, now: Instant) -> Vec<Arc<WatchedEntry>> {
        self.entries.read().iter().filter(|e| e.is_due(now)).cloned().collect()
    }

    /// Marks every entry attempted at `now`.
    pub fn mark_all_attempted(&self, now: Instant) {
        for entry in self.entries.read().iter() {
            entry.mark_attempted(now);
        }
    }

    /// Claims `entry` for a refresh.
    ///
    /// Returns `None` if another refresh of the same identity is in flight, or
    /// if the entry stopped being due while the caller was getting here.
    #[must_use]
    pub fn try_begin_refresh(&self, entry: &Arc<WatchedEntry>) -> Option<RefreshGuard> {
        let Ok(permit) = Arc::clone(&entry.gate).try_acquire_owned() else {
            debug!(identity = %entry.identity, "refresh already in flight, skipping");
            return None;
        };

        if !entry.is_due(Instant::now()) {
            debug!(identity = %entry.identity, "entry refreshed concurrently, skipping");
            return None;
        }

        Some(RefreshGuard { entry: Arc::clone(entry), _permit: permit })
    }

    /// Brings every entry's expiration forward to a random point within
    /// `max_delay`, spreading the resulting checks over that window.
    pub fn set_dirty(&self, max_delay: Duration) {
        let now = Instant::now();
        let max_ms = u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX);
        let mut rng = rand::rng();

        for entry in self.entries.read().iter() {
            let delay = Duration::from_millis(rng.random_range(0..=max_ms));
            entry.expire_within(now, delay);
        }
    }
}
