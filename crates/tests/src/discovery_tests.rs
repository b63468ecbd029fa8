//! Integration tests for replica discovery.
//!
//! Discovered replicas are appended after the static endpoints, refreshed at
//! most once per discovery interval, and never displace what the pool has when
//! a lookup fails.

use crate::mock_infrastructure::{
    back_off, consecutive_failures, endpoint, endpoints, failover_config, MockClientFactory, MockStore,
    MutableDiscovery, StoreOp,
};
use cairn_core::{
    replica::{EndpointSource, ReplicaClientPool, StoreError},
    ConfigProvider, ConfigProviderBuilder,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

const PRIMARY: &str = "primary.example";
const EAST: &str = "east.example";
const WEST: &str = "west.example";
const NORTH: &str = "north.example";

fn hosts(pool: &ReplicaClientPool) -> Vec<String> {
    pool.endpoints().iter().map(|r| r.endpoint().host().to_string()).collect()
}

async fn provider_with(store: &Arc<MockStore>, discovery: &Arc<MutableDiscovery>) -> ConfigProvider {
    ConfigProviderBuilder::new()
        .client_factory(MockClientFactory::new(Arc::clone(store)))
        .discovery(Arc::clone(discovery) as _)
        .endpoint(endpoint(PRIMARY))
        .failover_config(failover_config())
        .discovery_refresh_interval(Duration::from_secs(60))
        .build()
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_discovered_replicas_follow_static_endpoints() {
    let store = MockStore::new();
    let discovery = MutableDiscovery::new(endpoints(&[EAST, PRIMARY, WEST]));

    let provider = provider_with(&store, &discovery).await;
    let pool = provider.pool();

    assert_eq!(hosts(pool), [PRIMARY, EAST, WEST], "origin reported by discovery is not duplicated");
    let sources: Vec<_> = pool.endpoints().iter().map(|r| r.source()).collect();
    assert_eq!(sources, [EndpointSource::Static, EndpointSource::Discovered, EndpointSource::Discovered]);
    assert!(pool.is_primary(&endpoint(PRIMARY)));
    assert_eq!(discovery.lookups(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rediscovery_is_rate_limited_and_keeps_state() {
    let store = MockStore::new();
    let discovery = MutableDiscovery::new(endpoints(&[EAST, WEST]));
    let provider = provider_with(&store, &discovery).await;
    let pool = provider.pool();

    back_off(pool, WEST);
    discovery.set_replicas(endpoints(&[WEST, NORTH]));

    assert!(!pool.refresh_discovered().await, "interval has not elapsed");
    assert_eq!(discovery.lookups(), 1);

    tokio::time::advance(Duration::from_secs(60)).await;

    assert!(pool.refresh_discovered().await);
    assert_eq!(discovery.lookups(), 2);
    assert_eq!(hosts(pool), [PRIMARY, WEST, NORTH]);
    assert_eq!(consecutive_failures(pool, WEST), 1, "surviving replica keeps its backoff");
    assert!(pool.state_of(&endpoint(EAST)).is_none());

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(!pool.refresh_discovered().await, "same answer leaves membership alone");
    assert_eq!(discovery.lookups(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_lookup_keeps_current_members() {
    let store = MockStore::new();
    let discovery = MutableDiscovery::new(endpoints(&[EAST, WEST]));
    let provider = provider_with(&store, &discovery).await;

    discovery.set_failing(true);
    tokio::time::advance(Duration::from_secs(60)).await;

    assert!(!provider.pool().refresh_discovered().await);
    assert_eq!(hosts(provider.pool()), [PRIMARY, EAST, WEST]);
}

#[tokio::test(start_paused = true)]
async fn test_empty_lookup_drops_discovered_members_only() {
    let store = MockStore::new();
    let discovery = MutableDiscovery::new(endpoints(&[EAST]));
    let provider = provider_with(&store, &discovery).await;

    discovery.set_replicas(Vec::new());
    tokio::time::advance(Duration::from_secs(60)).await;

    assert!(provider.pool().refresh_discovered().await);
    assert_eq!(hosts(provider.pool()), [PRIMARY]);
}

#[tokio::test(start_paused = true)]
async fn test_discovered_replica_serves_when_primary_fails() {
    let store = MockStore::new();
    store.set("App:Color", "blue");
    store.fail(PRIMARY, StoreError::ConnectionFailed("connection refused".to_string()));
    let discovery = MutableDiscovery::new(endpoints(&[EAST]));

    let provider = provider_with(&store, &discovery).await;
    provider.load(&CancellationToken::new()).await.unwrap();

    assert_eq!(provider.get("App:Color").as_deref(), Some("blue"));
    assert_eq!(store.calls(PRIMARY, StoreOp::FetchPage), 1);
    assert_eq!(store.calls(EAST, StoreOp::FetchPage), 1);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_from_origin_without_static_endpoints() {
    let store = MockStore::new();
    let discovery = MutableDiscovery::new(endpoints(&[EAST, WEST]));

    let provider = ConfigProviderBuilder::new()
        .client_factory(MockClientFactory::new(Arc::clone(&store)))
        .discovery(Arc::clone(&discovery) as _)
        .discovery_origin(endpoint("origin.example"))
        .build()
        .await
        .unwrap();

    assert_eq!(hosts(provider.pool()), [EAST, WEST]);
    assert!(provider.pool().is_primary(&endpoint(EAST)));
}
