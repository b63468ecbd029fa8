//! Replica discovery.
//!
//! Discovery supplements the statically configured endpoints with replicas
//! found at runtime (for example through DNS SRV records). A discovery failure
//! is never fatal: the pool keeps the endpoints it already has.

use super::endpoint::Endpoint;
use async_trait::async_trait;
use thiserror::Error;

/// Errors from a [`ReplicaDiscovery`] implementation.
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("Replica lookup failed: {0}")]
    Lookup(String),

    #[error("Replica lookup timed out")]
    Timeout,
}

/// Resolves the replicas of a store from its origin endpoint.
#[async_trait]
pub trait ReplicaDiscovery: Send + Sync + 'static {
    /// Returns replicas of `origin` in preference order. The origin itself may
    /// be omitted; the pool de-duplicates.
    async fn resolve_replica_endpoints(&self, origin: &Endpoint) -> Result<Vec<Endpoint>, DiscoveryError>;
}

/// Discovery that never finds anything. Used when discovery is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscovery;

#[async_trait]
impl ReplicaDiscovery for NoDiscovery {
    async fn resolve_replica_endpoints(&self, _origin: &Endpoint) -> Result<Vec<Endpoint>, DiscoveryError> {
        Ok(Vec::new())
    }
}

/// Discovery backed by a fixed list, for deployments that know their replicas
/// up front but still want them treated as discovered (removable) members.
#[derive(Debug, Default, Clone)]
pub struct FixedDiscovery {
    replicas: Vec<Endpoint>,
}

impl FixedDiscovery {
    #[must_use]
    pub fn new(replicas: Vec<Endpoint>) -> Self {
        Self { replicas }
    }
}

#[async_trait]
impl ReplicaDiscovery for FixedDiscovery {
    async fn resolve_replica_endpoints(&self, _origin: &Endpoint) -> Result<Vec<Endpoint>, DiscoveryError> {
        Ok(self.replicas.clone())
    }
}

/// Resolves replicas, logging and swallowing failures.
///
/// Returns `None` when discovery failed so callers can tell "found nothing"
/// apart from "could not look".
pub async fn resolve_or_warn(discovery: &dyn ReplicaDiscovery, origin: &Endpoint) -> Option<Vec<Endpoint>> {
    match discovery.resolve_replica_endpoints(origin).await {
        Ok(replicas) => {
            tracing::debug!(origin = %origin, replicas = replicas.len(), "resolved replica endpoints");
            Some(replicas)
        }
        Err(e) => {
            tracing::warn!(
                origin = %origin,
                error = %e,
                "replica discovery failed, keeping configured endpoints"
            );
            None
        }
    }
}
