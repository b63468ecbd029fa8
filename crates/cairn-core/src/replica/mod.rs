//! Replicated store access with failover.
//!
//! This module owns everything between "read this key" and the network:
//! - A pool of equivalent replicas, primary first, with per-member backoff
//! - Replica discovery that supplements the configured endpoints
//! - An executor that tries candidates in pool order with time-boxed parallel
//!   fallback
//! - Classification of store errors into the outcomes failover branches on
//!
//! # Replica Selection
//!
//! For each request the [`FailoverExecutor`] builds a candidate list from the
//! current [`ReplicaClientPool`] snapshot:
//!
//! ```text
//! [primary available?] ── yes ──► start at primary
//!        │
//!        └─ no ──► start at first replica
//!
//! skip members whose backoff has not expired
//!
//! [any candidate left?] ── no ──► attempt primary anyway
//! ```
//!
//! A retryable failure backs the member off for
//! `min_backoff * 2^(failures-1)`, clamped to `[min_backoff, max_backoff]`.
//! A success resets it.

pub mod backoff;
pub mod client;
pub mod discovery;
pub mod endpoint;
pub mod errors;
pub mod executor;
pub mod pool;

pub use backoff::{BackoffPolicy, EndpointState};
pub use client::{ClientFactory, ConfigStoreClient};
pub use discovery::{DiscoveryError, FixedDiscovery, NoDiscovery, ReplicaDiscovery};
pub use endpoint::{Endpoint, EndpointSource, ReplicaEndpoint};
pub use errors::{FailoverError, FailureClass, PoolError, StoreError};
pub use executor::{FailoverConfig, FailoverExecutor};
pub use pool::{ProviderContext, ReplicaClientPool};
