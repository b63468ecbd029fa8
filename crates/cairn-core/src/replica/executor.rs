//! Failover execution across replicas.
//!
//! Every request to the store goes through [`FailoverExecutor::execute`]:
//!
//! ```text
//!   candidates = pool order, primary skipped while backed off,
//!                members in backoff skipped
//!
//!   t0 ──► attempt(c0) ─────────────────────────────┐
//!   t0+Δ ──────► attempt(c1) ───────────────┐       │   Δ = parallel_retry_interval
//!   t0+2Δ ─────────────► attempt(c2) ──┐    │       │
//!                                      ▼    ▼       ▼
//!                              first success wins, siblings dropped
//! ```
//!
//! The interval is a soft timeout: a slow attempt keeps running while the next
//! candidate starts. A retryable failure starts the next candidate right away.
//! When every member is backed off the primary is attempted anyway so the
//! provider never fails without touching the network.

use super::{
    backoff::{BackoffPolicy, DEFAULT_MAX_BACKOFF, DEFAULT_MIN_BACKOFF},
    endpoint::ReplicaEndpoint,
    errors::{FailoverError, FailureClass, StoreError},
    pool::ReplicaClientPool,
};
use crate::{
    metrics::{self, AttemptOutcome},
    types::{ChangeCheck, ChangeToken, ConfigSetting, KeyIdentity, SettingSelector},
};
use arc_swap::ArcSwap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failover tuning. Stored in an `ArcSwap` so it can be replaced at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Soft timeout before the next candidate is started in parallel
    /// (milliseconds, default: 5000)
    #[serde(default = "default_parallel_retry_interval_ms")]
    pub parallel_retry_interval_ms: u64,

    /// Lower bound of an endpoint backoff in seconds (default: 30)
    #[serde(default = "default_min_backoff_seconds")]
    pub min_backoff_seconds: u64,

    /// Upper bound of an endpoint backoff in seconds (default: 600)
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,

    /// Jitter applied to endpoint backoff, 0.0-1.0 (default: 0.0)
    #[serde(default)]
    pub jitter_factor: f64,
}

fn default_parallel_retry_interval_ms() -> u64 {
    5000
}

fn default_min_backoff_seconds() -> u64 {
    DEFAULT_MIN_BACKOFF.as_secs()
}

fn default_max_backoff_seconds() -> u64 {
    DEFAULT_MAX_BACKOFF.as_secs()
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            parallel_retry_interval_ms: default_parallel_retry_interval_ms(),
            min_backoff_seconds: default_min_backoff_seconds(),
            max_backoff_seconds: default_max_backoff_seconds(),
            jitter_factor: 0.0,
        }
    }
}

impl FailoverConfig {
    #[must_use]
    pub fn parallel_retry_interval(&self) -> Duration {
        Duration::from_millis(self.parallel_retry_interval_ms)
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.min_backoff_seconds),
            Duration::from_secs(self.max_backoff_seconds),
        )
        .with_jitter(self.jitter_factor)
    }
}

/// Routes store requests through the replica pool.
pub struct FailoverExecutor {
    config: ArcSwap<FailoverConfig>,
    pool: Arc<ReplicaClientPool>,
}

impl FailoverExecutor {
    /// Creates an executor over `pool`. The pool's backoff policy is replaced
    /// with the one described by `config`.
    #[must_use]
    pub fn new(pool: Arc<ReplicaClientPool>, config: FailoverConfig) -> Self {
        pool.set_backoff_policy(config.backoff_policy());
        Self { config: ArcSwap::from_pointee(config), pool }
    }

    /// Replaces the configuration. Calls already in flight keep the old one.
    pub fn update_config(&self, config: FailoverConfig) {
        self.pool.set_backoff_policy(config.backoff_policy());
        self.config.store(Arc::new(config));
        info!("failover configuration updated");
    }

    #[must_use]
    pub fn get_config(&self) -> FailoverConfig {
        (**self.config.load()).clone()
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ReplicaClientPool> {
        &self.pool
    }

    /// Returns the members to try, in order.
    ///
    /// The primary is skipped while backed off unless it is the only member.
    /// Other members in backoff are skipped too. If that leaves nothing, the
    /// primary alone is returned.
    fn candidates(members: &[Arc<ReplicaEndpoint>], now: Instant) -> Vec<Arc<ReplicaEndpoint>> {
        if members.len() == 1 {
            return members.to_vec();
        }

        let start = usize::from(!members.first().is_some_and(|primary| primary.is_available(now)));
        let available: Vec<_> = members
            .iter()
            .skip(start)
            .filter(|member| member.is_available(now))
            .cloned()
            .collect();

        if available.is_empty() {
            if let Some(primary) = members.first() {
                warn!(
                    endpoint = %primary.endpoint(),
                    members = members.len(),
                    "all replicas backed off, forcing attempt against primary"
                );
                return vec![Arc::clone(primary)];
            }
        }

        available
    }

    /// Runs `attempt` against replicas until one succeeds.
    ///
    /// Returns the value and the replica that produced it.
    ///
    /// # Errors
    ///
    /// - [`FailoverError::NotFound`] when a replica answered that the entry is absent
    /// - [`FailoverError::NonRetryable`] on the first non-retryable failure
    /// - [`FailoverError::Exhausted`] with the last failure when every candidate failed
    /// - [`FailoverError::Cancelled`] when `cancel` fires
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        attempt: F,
    ) -> Result<(T, Arc<ReplicaEndpoint>), FailoverError>
    where
        F: Fn(Arc<ReplicaEndpoint>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        if cancel.is_cancelled() {
            return Err(FailoverError::Cancelled);
        }

        let interval = self.config.load().parallel_retry_interval();
        let policy = self.pool.backoff_policy();
        let members = self.pool.endpoints();
        let mut pending: VecDeque<_> = Self::candidates(&members, Instant::now()).into();

        let launch = |replica: Arc<ReplicaEndpoint>| {
            let fut = attempt(Arc::clone(&replica));
            async move { (replica, fut.await) }
        };

        let mut in_flight = FuturesUnordered::new();
        let mut last_launch = Instant::now();
        let mut attempts = 0usize;
        let mut last_error: Option<StoreError> = None;

        loop {
            if in_flight.is_empty() {
                let Some(next) = pending.pop_front() else { break };
                debug!(operation, endpoint = %next.endpoint(), "attempting replica");
                in_flight.push(launch(next));
                attempts += 1;
                last_launch = Instant::now();
            }

            let can_fan_out = !pending.is_empty();

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!(operation, in_flight = in_flight.len(), "failover cancelled");
                    return Err(FailoverError::Cancelled);
                }

                Some((replica, result)) = in_flight.next() => {
                    let endpoint = replica.endpoint();
                    let error = match result {
                        Ok(value) => {
                            replica.record_outcome(true, Instant::now(), &policy);
                            metrics::record_attempt(endpoint, AttemptOutcome::Success);
                            if attempts > 1 {
                                debug!(operation, endpoint = %endpoint, attempts, "served after failover");
                            }
                            return Ok((value, replica));
                        }
                        Err(e) => e,
                    };

                    let class = error.classify();
                    metrics::record_attempt(endpoint, AttemptOutcome::Failed(class));

                    match class {
                        FailureClass::Retryable => {
                            replica.record_outcome(false, Instant::now(), &policy);
                            warn!(operation, endpoint = %endpoint, error = %error, "replica attempt failed");
                            last_error = Some(error);

                            if let Some(next) = pending.pop_front() {
                                debug!(operation, endpoint = %next.endpoint(), "attempting next replica");
                                in_flight.push(launch(next));
                                attempts += 1;
                                last_launch = Instant::now();
                            }
                        }
                        FailureClass::NotFound => {
                            replica.record_outcome(true, Instant::now(), &policy);
                            return Err(FailoverError::NotFound { endpoint: endpoint.to_string() });
                        }
                        FailureClass::NonRetryable => {
                            warn!(operation, endpoint = %endpoint, error = %error, "non-retryable store error");
                            return Err(FailoverError::NonRetryable {
                                endpoint: endpoint.to_string(),
                                source: error,
                            });
                        }
                        FailureClass::Cancelled => return Err(FailoverError::Cancelled),
                    }
                }

                () = tokio::time::sleep_until(last_launch + interval), if can_fan_out => {
                    if let Some(next) = pending.pop_front() {
                        debug!(
                            operation,
                            endpoint = %next.endpoint(),
                            interval_ms = interval.as_millis(),
                            in_flight = in_flight.len(),
                            "parallel retry interval elapsed, starting next replica"
                        );
                        metrics::record_parallel_fallback();
                        in_flight.push(launch(next));
                        attempts += 1;
                        last_launch = Instant::now();
                    }
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| StoreError::ConnectionFailed("no replica could be attempted".to_string()));
        warn!(operation, attempts, error = %last, "all replica attempts failed");
        Err(FailoverError::Exhausted { attempts, last })
    }

    /// Fetches one setting. `Ok(None)` when it does not exist.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute); `NotFound` is mapped to `Ok(None)`.
    pub async fn fetch_one(
        &self,
        identity: &KeyIdentity,
        cancel: &CancellationToken,
    ) -> Result<Option<ConfigSetting>, FailoverError> {
        let result = self
            .execute("fetch_one", cancel, move |replica| async move { replica.client().fetch_one(identity).await })
            .await;

        match result {
            Ok((setting, _)) => Ok(setting),
            Err(FailoverError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Compares `known` against the store's current change token.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute); `NotFound` is mapped to
    /// [`ChangeCheck::Missing`].
    pub async fn check_changed(
        &self,
        identity: &KeyIdentity,
        known: Option<&ChangeToken>,
        cancel: &CancellationToken,
    ) -> Result<ChangeCheck, FailoverError> {
        let result = self
            .execute("check_changed", cancel, move |replica| async move {
                replica.client().check_changed(identity, known).await
            })
            .await;

        match result {
            Ok((check, _)) => Ok(check),
            Err(FailoverError::NotFound { .. }) => Ok(ChangeCheck::Missing),
            Err(e) => Err(e),
        }
    }

    /// Lists every setting matching `selectors`, in selector order.
    ///
    /// All pages of all selectors are read from one replica. If that replica
    /// fails part-way, the next candidate starts over from the first page of
    /// the first selector.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn list_settings(
        &self,
        selectors: &[SettingSelector],
        cancel: &CancellationToken,
    ) -> Result<(Vec<ConfigSetting>, Arc<ReplicaEndpoint>), FailoverError> {
        self.execute("list_settings", cancel, move |replica| async move { read_all_pages(&replica, selectors).await })
            .await
    }
}

async fn read_all_pages(
    replica: &ReplicaEndpoint,
    selectors: &[SettingSelector],
) -> Result<Vec<ConfigSetting>, StoreError> {
    let mut settings = Vec::new();

    for selector in selectors {
        let mut continuation: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = replica.client().fetch_page(selector, continuation.as_deref()).await?;
            pages += 1;
            settings.extend(page.items);

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        debug!(endpoint = %replica.endpoint(), selector = %selector, pages, "selector listed");
    }

    Ok(settings)
}
