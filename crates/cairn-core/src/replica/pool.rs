use super::{
    backoff::{BackoffPolicy, EndpointState},
    client::ClientFactory,
    discovery::{resolve_or_warn, NoDiscovery, ReplicaDiscovery},
    endpoint::{Endpoint, EndpointSource, ReplicaEndpoint},
    errors::PoolError,
};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info};

/// Process-wide collaborators shared by every pool member.
///
/// Passed explicitly to the pool at construction; nothing is global.
#[derive(Clone)]
pub struct ProviderContext {
    pub client_factory: Arc<dyn ClientFactory>,
    pub discovery: Arc<dyn ReplicaDiscovery>,
}

impl ProviderContext {
    #[must_use]
    pub fn new(client_factory: Arc<dyn ClientFactory>) -> Self {
        Self { client_factory, discovery: Arc::new(NoDiscovery) }
    }

    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn ReplicaDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }
}

/// Ordered set of equivalent replicas with per-member backoff state.
///
/// The first member is the primary. Static (configured) members come first in
/// configuration order, followed by discovered replicas in discovery order.
///
/// The member list lives in an `ArcSwap`: readers take a consistent snapshot
/// without locking, and discovery refreshes swap in a new list while requests
/// against the old one finish undisturbed. Members kept across a refresh are
/// the same `Arc`, so their backoff state carries over.
pub struct ReplicaClientPool {
    replicas: ArcSwap<Vec<Arc<ReplicaEndpoint>>>,
    origin: Endpoint,
    static_endpoints: Vec<Endpoint>,
    context: ProviderContext,
    backoff: ArcSwap<BackoffPolicy>,
    discovery_interval: Duration,
    last_discovery: Mutex<Option<Instant>>,
}

/// Default minimum time between two discovery refreshes.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(3600);

impl ReplicaClientPool {
    /// Creates a pool from static endpoints only.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Empty`] if `static_endpoints` is empty, or
    /// [`PoolError::ClientInit`] if a client cannot be created.
    pub fn new(
        static_endpoints: Vec<Endpoint>,
        context: ProviderContext,
        backoff: BackoffPolicy,
    ) -> Result<Self, PoolError> {
        let origin = static_endpoints.first().cloned().ok_or(PoolError::Empty)?;
        Self::assemble(static_endpoints, Vec::new(), origin, context, backoff)
    }

    /// Creates a pool from static endpoints plus whatever discovery finds for
    /// `origin` (defaults to the first static endpoint).
    ///
    /// Discovery failures are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Empty`] if there is no origin to discover from, or
    /// if neither configuration nor discovery produced an endpoint.
    pub async fn connect(
        static_endpoints: Vec<Endpoint>,
        origin: Option<Endpoint>,
        context: ProviderContext,
        backoff: BackoffPolicy,
    ) -> Result<Self, PoolError> {
        let origin = origin.or_else(|| static_endpoints.first().cloned()).ok_or(PoolError::Empty)?;
        let discovered = resolve_or_warn(context.discovery.as_ref(), &origin).await.unwrap_or_default();
        let pool = Self::assemble(static_endpoints, discovered, origin, context, backoff)?;
        *pool.last_discovery.lock() = Some(Instant::now());
        Ok(pool)
    }

    fn assemble(
        static_endpoints: Vec<Endpoint>,
        discovered: Vec<Endpoint>,
        origin: Endpoint,
        context: ProviderContext,
        backoff: BackoffPolicy,
    ) -> Result<Self, PoolError> {
        let members = build_members(&static_endpoints, &discovered, &[], context.client_factory.as_ref())?;
        if members.is_empty() {
            return Err(PoolError::Empty);
        }

        info!(
            origin = %origin,
            static_endpoints = static_endpoints.len(),
            total = members.len(),
            "replica pool initialized"
        );

        Ok(Self {
            replicas: ArcSwap::from_pointee(members),
            origin,
            static_endpoints,
            context,
            backoff: ArcSwap::from_pointee(backoff),
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            last_discovery: Mutex::new(None),
        })
    }

    /// Sets the minimum time between discovery refreshes.
    #[must_use]
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Returns a snapshot of the current members in pool order.
    #[must_use]
    pub fn endpoints(&self) -> Arc<Vec<Arc<ReplicaEndpoint>>> {
        self.replicas.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.replicas.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replicas.load().is_empty()
    }

    /// Returns the primary member, if the pool has members.
    #[must_use]
    pub fn primary(&self) -> Option<Arc<ReplicaEndpoint>> {
        self.replicas.load().first().cloned()
    }

    #[must_use]
    pub fn is_primary(&self, endpoint: &Endpoint) -> bool {
        self.replicas.load().first().is_some_and(|primary| primary.endpoint() == endpoint)
    }

    /// Whether the next top-level call should start at the primary.
    #[must_use]
    pub fn should_try_primary(&self, now: Instant) -> bool {
        self.replicas.load().first().is_some_and(|primary| primary.is_available(now))
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        **self.backoff.load()
    }

    pub fn set_backoff_policy(&self, policy: BackoffPolicy) {
        self.backoff.store(Arc::new(policy));
    }

    /// Records the outcome of a request against `endpoint`.
    ///
    /// Returns `false` if the endpoint is no longer a member.
    pub fn record_outcome(&self, endpoint: &Endpoint, success: bool) -> bool {
        let replicas = self.replicas.load();
        let Some(replica) = replicas.iter().find(|r| r.endpoint() == endpoint) else {
            return false;
        };
        replica.record_outcome(success, Instant::now(), &self.backoff_policy());
        true
    }

    /// Returns the backoff state of `endpoint`, if it is a member.
    #[must_use]
    pub fn state_of(&self, endpoint: &Endpoint) -> Option<EndpointState> {
        self.replicas.load().iter().find(|r| r.endpoint() == endpoint).map(|r| r.state())
    }

    /// Re-runs discovery if the refresh interval has elapsed.
    ///
    /// Returns `true` if the member list was replaced.
    pub async fn refresh_discovered(&self) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last_discovery.lock();
            if last.is_some_and(|at| now.saturating_duration_since(at) < self.discovery_interval) {
                return false;
            }
            *last = Some(now);
        }

        let Some(discovered) = resolve_or_warn(self.context.discovery.as_ref(), &self.origin).await else {
            return false;
        };

        match self.replace_discovered(discovered) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!(error = %e, "failed to apply discovered replicas");
                false
            }
        }
    }

    /// Replaces the discovered members with `discovered`, keeping static
    /// members and preserving state of members present in both lists.
    ///
    /// Returns `true` if the membership changed.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ClientInit`] if a client for a new endpoint cannot be
    /// created, or [`PoolError::Empty`] if the result would have no members.
    pub fn replace_discovered(&self, discovered: Vec<Endpoint>) -> Result<bool, PoolError> {
        let current = self.replicas.load_full();
        let members = build_members(
            &self.static_endpoints,
            &discovered,
            &current,
            self.context.client_factory.as_ref(),
        )?;
        if members.is_empty() {
            return Err(PoolError::Empty);
        }

        let changed = members.len() != current.len() ||
            members.iter().zip(current.iter()).any(|(a, b)| !Arc::ptr_eq(a, b));

        if changed {
            info!(
                previous = current.len(),
                current = members.len(),
                "replica pool membership updated"
            );
            self.replicas.store(Arc::new(members));
        } else {
            debug!(members = current.len(), "replica pool membership unchanged");
        }

        Ok(changed)
    }
}

/// Builds the ordered member list, reusing members from `existing` by endpoint.
fn build_members(
    static_endpoints: &[Endpoint],
    discovered: &[Endpoint],
    existing: &[Arc<ReplicaEndpoint>],
    factory: &dyn ClientFactory,
) -> Result<Vec<Arc<ReplicaEndpoint>>, PoolError> {
    let mut members: Vec<Arc<ReplicaEndpoint>> = Vec::with_capacity(static_endpoints.len() + discovered.len());

    let wanted = static_endpoints
        .iter()
        .map(|e| (e, EndpointSource::Static))
        .chain(discovered.iter().map(|e| (e, EndpointSource::Discovered)));

    for (endpoint, source) in wanted {
        if members.iter().any(|m| m.endpoint() == endpoint) {
            continue;
        }

        if let Some(kept) = existing.iter().find(|m| m.endpoint() == endpoint && m.source() == source) {
            members.push(Arc::clone(kept));
            continue;
        }

        let client = factory
            .create_client(endpoint)
            .map_err(|source| PoolError::ClientInit { endpoint: endpoint.to_string(), source })?;
        members.push(Arc::new(ReplicaEndpoint::new(endpoint.clone(), source, client)));
    }

    Ok(members)
}
