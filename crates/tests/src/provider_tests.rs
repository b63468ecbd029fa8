//! End-to-end tests for the `ConfigProvider` facade.

use crate::mock_infrastructure::{endpoint, failover_config, MockClientFactory, MockStore, StoreOp};
use cairn_core::{
    replica::{FailoverError, StoreError},
    types::{ConfigSetting, KeyIdentity, SettingSelector},
    watch::{WatchError, WatchRegistration},
    ConfigProviderBuilder, ProviderError,
};
use std::{sync::Arc, time::Duration};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

const PRIMARY: &str = "primary.example";
const EAST: &str = "east.example";

fn builder(store: &Arc<MockStore>) -> ConfigProviderBuilder {
    ConfigProviderBuilder::new()
        .client_factory(MockClientFactory::new(Arc::clone(store)))
        .endpoint(endpoint(PRIMARY))
        .failover_config(failover_config())
}

#[tokio::test(start_paused = true)]
async fn test_load_selects_and_trims_keys() {
    let store = MockStore::new();
    store.set("App:Color", "blue");
    store.set("App:Db:Host", "db-1");
    store.set("Other:Color", "red");

    let provider = builder(&store)
        .select(SettingSelector::new("App:*", None))
        .trim_key_prefixes(["App:"])
        .build()
        .await
        .unwrap();
    provider.load(&CancellationToken::new()).await.unwrap();

    let snapshot = provider.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get("Color"), Some("blue"));
    assert_eq!(snapshot.get("Db:Host"), Some("db-1"));
    assert_eq!(provider.get("Other:Color"), None);
    assert_eq!(snapshot.version(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_later_selector_overrides_earlier() {
    let store = MockStore::new();
    store.set("App:Color", "blue");
    store.put(ConfigSetting::new("App:Color", "purple", "").with_label("prod"));

    let provider = builder(&store)
        .select(SettingSelector::new("App:*", None))
        .select(SettingSelector::new("App:*", Some("prod".to_string())))
        .build()
        .await
        .unwrap();
    provider.load(&CancellationToken::new()).await.unwrap();

    assert_eq!(provider.get("App:Color").as_deref(), Some("purple"));
}

#[tokio::test(start_paused = true)]
async fn test_optional_load_starts_empty_and_recovers() {
    let store = MockStore::new();
    store.set("App:Color", "blue");
    store.fail(PRIMARY, StoreError::HttpError(503, "unavailable".to_string()));

    let provider = builder(&store).optional(true).startup_timeout(Duration::from_secs(10)).build().await.unwrap();
    let cancel = CancellationToken::new();

    provider.load(&cancel).await.unwrap();
    assert!(provider.snapshot().is_empty());
    assert_eq!(provider.snapshot().version(), 0);

    store.heal(PRIMARY);
    let report = provider.refresh(&cancel).await.unwrap();

    assert!(report.reloaded);
    assert_eq!(provider.get("App:Color").as_deref(), Some("blue"));
}

#[tokio::test(start_paused = true)]
async fn test_required_load_times_out() {
    let store = MockStore::new();
    store.fail(PRIMARY, StoreError::Timeout);

    let provider = builder(&store).startup_timeout(Duration::from_secs(20)).build().await.unwrap();

    let start = Instant::now();
    let err = provider.load(&CancellationToken::new()).await.unwrap_err();

    match err {
        ProviderError::StartupTimeout { timeout, last } => {
            assert_eq!(timeout, Duration::from_secs(20));
            assert!(last.is_transient());
        }
        other => panic!("expected startup timeout, got {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_secs(20));
    assert!(store.calls(PRIMARY, StoreOp::FetchPage) >= 2, "transient failures are retried");
}

#[tokio::test(start_paused = true)]
async fn test_load_retries_until_store_answers() {
    let store = MockStore::new();
    store.set("App:Color", "blue");
    store.fail_times(PRIMARY, StoreError::Io("connection reset".to_string()), 2);

    let provider = builder(&store).build().await.unwrap();
    provider.load(&CancellationToken::new()).await.unwrap();

    assert_eq!(provider.get("App:Color").as_deref(), Some("blue"));
    assert_eq!(store.calls(PRIMARY, StoreOp::FetchPage), 3);
}

#[tokio::test(start_paused = true)]
async fn test_forbidden_load_fails_without_retry() {
    let store = MockStore::new();
    store.fail(PRIMARY, StoreError::HttpError(403, "forbidden".to_string()));

    let provider = builder(&store).endpoint(endpoint(EAST)).build().await.unwrap();
    let err = provider.load(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ProviderError::Failover(FailoverError::NonRetryable { .. })), "got {err:?}");
    assert_eq!(store.calls(PRIMARY, StoreOp::FetchPage), 1);
    assert_eq!(store.calls(EAST, StoreOp::FetchPage), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_load_is_reported() {
    let store = MockStore::new();
    let provider = builder(&store).optional(true).build().await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = provider.load(&cancel).await.unwrap_err();
    assert!(err.is_cancelled(), "cancellation is returned even in optional mode");
    assert_eq!(store.total_calls(StoreOp::FetchPage), 0);
}

#[tokio::test(start_paused = true)]
async fn test_watched_key_outside_selectors_is_loaded() {
    let store = MockStore::new();
    store.set("App:Color", "blue");
    store.set("Sentinel", "1");

    let provider = builder(&store)
        .select(SettingSelector::new("App:*", None))
        .watch(WatchRegistration::sentinel(KeyIdentity::new("Sentinel")))
        .build()
        .await
        .unwrap();
    provider.load(&CancellationToken::new()).await.unwrap();

    assert_eq!(provider.get("Sentinel").as_deref(), Some("1"));
    assert_eq!(store.calls(PRIMARY, StoreOp::FetchOne), 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_refresh_publishes_changes() {
    let store = MockStore::new();
    store.set("App:Color", "blue");

    let provider = builder(&store)
        .poll_interval(Duration::from_secs(1))
        .watch(WatchRegistration::new(KeyIdentity::new("App:Color")).with_cache_expiration(Duration::from_secs(5)))
        .build()
        .await
        .unwrap();
    provider.load(&CancellationToken::new()).await.unwrap();

    let mut receiver = provider.subscribe();
    let shutdown = CancellationToken::new();
    let handle = provider.start_background_refresh(shutdown.clone());

    store.set("App:Color", "green");

    timeout(Duration::from_secs(10), receiver.changed()).await.unwrap().unwrap();
    assert_eq!(receiver.borrow().get("App:Color"), Some("green"));
    assert_eq!(provider.get("App:Color").as_deref(), Some("green"));

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watch_registered_after_build() {
    let store = MockStore::new();
    store.set("App:Color", "blue");

    let provider = builder(&store).build().await.unwrap();
    provider.load(&CancellationToken::new()).await.unwrap();

    provider
        .watch(WatchRegistration::new(KeyIdentity::new("App:Color")).with_cache_expiration(Duration::from_secs(2)))
        .unwrap();
    let err = provider
        .watch(WatchRegistration::new(KeyIdentity::new("App:Size")).with_cache_expiration(Duration::from_millis(500)))
        .unwrap_err();
    assert!(matches!(err, WatchError::ExpirationTooShort { .. }));

    store.set("App:Color", "green");
    tokio::time::advance(Duration::from_secs(2)).await;
    provider.refresh(&CancellationToken::new()).await.unwrap();

    assert_eq!(provider.get("App:Color").as_deref(), Some("green"));
}

#[tokio::test(start_paused = true)]
async fn test_failover_config_update_applies_to_pool() {
    let store = MockStore::new();
    let provider = builder(&store).endpoint(endpoint(EAST)).build().await.unwrap();

    let mut config = failover_config();
    config.min_backoff_seconds = 5;
    config.max_backoff_seconds = 50;
    provider.update_failover_config(config);

    let policy = provider.pool().backoff_policy();
    assert_eq!(policy.min_backoff, Duration::from_secs(5));
    assert_eq!(policy.max_backoff, Duration::from_secs(50));
}
