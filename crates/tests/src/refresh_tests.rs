//! Integration tests for change detection and refresh.
//!
//! These tests verify that:
//! - A changed sentinel key reloads every setting
//! - Unchanged passes publish nothing
//! - Concurrent refreshes check each watched key once
//! - Readers always see complete snapshots
//! - Adapter failures keep previous values when failures are ignored
//! - A point change merged during a full reload is not overwritten by it

use crate::mock_infrastructure::{
    endpoint, failover_config, json_flatten_adapter, json_setting, MockClientFactory, MockStore, StoreOp,
};
use cairn_core::{
    refresh::RefreshPhase,
    replica::StoreError,
    snapshot::CachedSnapshot,
    types::{KeyIdentity, SettingSelector},
    watch::WatchRegistration,
    ConfigProvider, ConfigProviderBuilder, ProviderError,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

const PRIMARY: &str = "primary.example";

fn builder(store: &Arc<MockStore>) -> ConfigProviderBuilder {
    ConfigProviderBuilder::new()
        .client_factory(MockClientFactory::new(Arc::clone(store)))
        .endpoint(endpoint(PRIMARY))
        .failover_config(failover_config())
}

fn watch(key: &str, secs: u64) -> WatchRegistration {
    WatchRegistration::new(KeyIdentity::new(key)).with_cache_expiration(Duration::from_secs(secs))
}

async fn loaded(builder: ConfigProviderBuilder) -> ConfigProvider {
    let provider = builder.build().await.unwrap();
    provider.load(&CancellationToken::new()).await.unwrap();
    provider
}

fn publish_counter(provider: &ConfigProvider) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&count);
    provider.add_subscriber(Arc::new(move |_snapshot: &Arc<CachedSnapshot>| {
        observed.fetch_add(1, Ordering::SeqCst);
    }));
    count
}

#[tokio::test(start_paused = true)]
async fn test_sentinel_change_reloads_all_settings() {
    let store = MockStore::new();
    store.set("App:Color", "blue");
    store.set("App:Size", "10");
    store.set("Sentinel", "1");

    let provider = loaded(
        builder(&store)
            .watch(WatchRegistration::sentinel(KeyIdentity::new("Sentinel")).with_cache_expiration(Duration::from_secs(1))),
    )
    .await;
    let cancel = CancellationToken::new();
    assert_eq!(provider.snapshot().version(), 1);

    store.set("App:Color", "green");
    store.set("App:Size", "20");

    tokio::time::advance(Duration::from_millis(500)).await;
    let report = provider.refresh(&cancel).await.unwrap();
    assert_eq!(report.checked, 0, "sentinel not due yet");
    assert_eq!(provider.get("App:Color").as_deref(), Some("blue"), "unwatched keys wait for the sentinel");

    store.set("Sentinel", "2");
    tokio::time::advance(Duration::from_millis(700)).await;

    let report = provider.refresh(&cancel).await.unwrap();
    assert!(report.reloaded);
    assert!(report.published);
    assert_eq!(report.phase, RefreshPhase::ChangeDetected);

    let snapshot = provider.snapshot();
    assert_eq!(snapshot.version(), 2);
    assert_eq!(snapshot.get("App:Color"), Some("green"));
    assert_eq!(snapshot.get("App:Size"), Some("20"));
    assert_eq!(snapshot.get("Sentinel"), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_pass_publishes_nothing() {
    let store = MockStore::new();
    store.set("App:Color", "blue");

    let provider = loaded(builder(&store).watch(watch("App:Color", 30))).await;
    let published = publish_counter(&provider);
    let receiver = provider.subscribe();

    tokio::time::advance(Duration::from_secs(31)).await;
    let report = provider.refresh(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.phase, RefreshPhase::Unchanged);
    assert_eq!(report.checked, 1);
    assert!(!report.published);
    assert_eq!(published.load(Ordering::SeqCst), 0);
    assert!(!receiver.has_changed().unwrap());
    assert_eq!(provider.snapshot().version(), 1);
    assert_eq!(store.calls(PRIMARY, StoreOp::CheckChanged), 1);
    assert_eq!(store.calls(PRIMARY, StoreOp::FetchOne), 0, "unchanged keys are not re-fetched");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_check_key_once() {
    let store = MockStore::new();
    store.set("App:Color", "blue");

    let provider = loaded(builder(&store).watch(watch("App:Color", 30))).await;
    store.delay(PRIMARY, Duration::from_millis(100));
    tokio::time::advance(Duration::from_secs(31)).await;

    let cancel = CancellationToken::new();
    let (first, second) = tokio::join!(provider.refresh(&cancel), provider.refresh(&cancel));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(store.calls(PRIMARY, StoreOp::CheckChanged), 1);
    assert_eq!(first.checked + second.checked, 1);
    assert_eq!(first.skipped + second.skipped, 1);

    // The finished check pushed the next one a full interval out.
    let again = provider.refresh(&cancel).await.unwrap();
    assert_eq!(again.checked, 0);
    assert_eq!(store.calls(PRIMARY, StoreOp::CheckChanged), 1);
}

#[tokio::test(start_paused = true)]
async fn test_readers_see_complete_snapshots() {
    let store = MockStore::new();
    store.set("Db:Host", "db-1");
    store.set("Db:Port", "5432");

    let provider = loaded(builder(&store).watch(watch("Db:Host", 1)).watch(watch("Db:Port", 1))).await;
    let published = publish_counter(&provider);
    let mut receiver = provider.subscribe();

    let before = provider.snapshot();

    store.set("Db:Host", "db-2");
    store.set("Db:Port", "6432");
    tokio::time::advance(Duration::from_secs(1)).await;

    let report = provider.refresh(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.changed, 2);

    assert_eq!(before.get("Db:Host"), Some("db-1"));
    assert_eq!(before.get("Db:Port"), Some("5432"));

    let after = provider.snapshot();
    assert_eq!(after.get("Db:Host"), Some("db-2"));
    assert_eq!(after.get("Db:Port"), Some("6432"));
    assert_eq!(after.version(), before.version() + 1, "both changes land in one snapshot");
    assert_eq!(published.load(Ordering::SeqCst), 1);

    assert!(receiver.has_changed().unwrap());
    let seen = receiver.borrow_and_update().clone();
    assert_eq!(seen.version(), after.version());
    assert_eq!(seen.get("Db:Port"), Some("6432"));
}

#[tokio::test(start_paused = true)]
async fn test_adapter_failure_keeps_previous_value_when_ignored() {
    let store = MockStore::new();
    store.put(json_setting("Feature", r#"{"enabled": true, "limit": 5}"#));
    store.set("App:Color", "blue");

    let provider = loaded(
        builder(&store)
            .adapter(json_flatten_adapter())
            .optional(true)
            .watch(watch("Feature", 1))
            .watch(watch("App:Color", 1)),
    )
    .await;
    let cancel = CancellationToken::new();
    assert_eq!(provider.get("Feature:enabled").as_deref(), Some("true"));
    assert_eq!(provider.get("Feature:limit").as_deref(), Some("5"));

    store.put(json_setting("Feature", "{not json"));
    store.set("App:Color", "green");
    tokio::time::advance(Duration::from_secs(1)).await;

    let report = provider.refresh(&cancel).await.unwrap();
    assert!(report.published);

    let snapshot = provider.snapshot();
    assert_eq!(snapshot.get("Feature:enabled"), Some("true"));
    assert_eq!(snapshot.get("Feature:limit"), Some("5"));
    assert_eq!(snapshot.get("App:Color"), Some("green"));
    assert!(!snapshot.contains_key("Feature"));

    // The failed entry keeps its old token, so a fix is picked up next pass.
    store.put(json_setting("Feature", r#"{"enabled": false}"#));
    tokio::time::advance(Duration::from_secs(1)).await;
    provider.refresh(&cancel).await.unwrap();

    assert_eq!(provider.get("Feature:enabled").as_deref(), Some("false"));
    assert_eq!(provider.get("Feature:limit"), None);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_failure_fails_refresh_when_required() {
    let store = MockStore::new();
    store.put(json_setting("Feature", r#"{"enabled": true}"#));
    store.set("App:Color", "blue");

    let provider = loaded(
        builder(&store)
            .adapter(json_flatten_adapter())
            .watch(watch("Feature", 1))
            .watch(watch("App:Color", 1)),
    )
    .await;

    store.put(json_setting("Feature", "[oops"));
    store.set("App:Color", "green");
    tokio::time::advance(Duration::from_secs(1)).await;

    let err = provider.refresh(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ProviderError::RefreshFailed { failed: 1, .. }), "got {err:?}");
    assert_eq!(provider.get("App:Color").as_deref(), Some("green"), "other changes are still published");
    assert_eq!(provider.get("Feature:enabled").as_deref(), Some("true"));
}

#[tokio::test(start_paused = true)]
async fn test_deleted_watched_key_is_removed() {
    let store = MockStore::new();
    store.set("App:Color", "blue");
    store.set("App:Size", "10");

    let provider = loaded(builder(&store).watch(watch("App:Color", 5))).await;

    store.remove("App:Color");
    tokio::time::advance(Duration::from_secs(5)).await;

    let report = provider.refresh(&CancellationToken::new()).await.unwrap();
    assert!(report.published);
    assert_eq!(provider.get("App:Color"), None);
    assert_eq!(provider.get("App:Size").as_deref(), Some("10"));

    tokio::time::advance(Duration::from_secs(5)).await;
    let report = provider.refresh(&CancellationToken::new()).await.unwrap();
    assert!(!report.published, "an absent key stays absent without a publish");
}

#[tokio::test(start_paused = true)]
async fn test_set_dirty_brings_next_check_forward() {
    let store = MockStore::new();
    store.set("App:Color", "blue");

    let provider = loaded(builder(&store).watch(watch("App:Color", 300))).await;
    store.set("App:Color", "green");

    provider.set_dirty(Duration::from_secs(2));
    tokio::time::advance(Duration::from_secs(2)).await;

    let report = provider.refresh(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(provider.get("App:Color").as_deref(), Some("green"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_check_is_retried_next_interval() {
    let store = MockStore::new();
    store.set("App:Color", "blue");

    let provider = loaded(builder(&store).watch(watch("App:Color", 10))).await;
    store.set("App:Color", "green");
    store.fail_times(PRIMARY, StoreError::Timeout, 1);
    tokio::time::advance(Duration::from_secs(10)).await;

    let cancel = CancellationToken::new();
    assert!(!provider.try_refresh(&cancel).await);
    assert_eq!(provider.get("App:Color").as_deref(), Some("blue"));

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(provider.try_refresh(&cancel).await);
    assert_eq!(provider.get("App:Color").as_deref(), Some("green"));
}

#[tokio::test(start_paused = true)]
async fn test_adapter_failure_during_reload_keeps_previous_value_when_ignored() {
    let store = MockStore::new();
    store.put(json_setting("Feature", r#"{"enabled": true, "limit": 5}"#));
    store.set("App:Color", "blue");
    store.set("Sentinel", "1");

    let provider = loaded(
        builder(&store)
            .adapter(json_flatten_adapter())
            .optional(true)
            .watch(WatchRegistration::sentinel(KeyIdentity::new("Sentinel")).with_cache_expiration(Duration::from_secs(1))),
    )
    .await;
    let cancel = CancellationToken::new();

    store.put(json_setting("Feature", "{not json"));
    store.set("App:Color", "green");
    store.set("Sentinel", "2");
    tokio::time::advance(Duration::from_secs(1)).await;

    let report = provider.refresh(&cancel).await.unwrap();
    assert!(report.reloaded);

    let snapshot = provider.snapshot();
    assert_eq!(snapshot.get("Feature:enabled"), Some("true"));
    assert_eq!(snapshot.get("Feature:limit"), Some("5"));
    assert!(!snapshot.contains_key("Feature"));
    assert_eq!(snapshot.get("App:Color"), Some("green"));
    assert_eq!(snapshot.get("Sentinel"), Some("2"));

    store.put(json_setting("Feature", r#"{"enabled": false}"#));
    store.set("Sentinel", "3");
    tokio::time::advance(Duration::from_secs(1)).await;

    let report = provider.refresh(&cancel).await.unwrap();
    assert!(report.reloaded);
    assert_eq!(provider.get("Feature:enabled").as_deref(), Some("false"));
    assert_eq!(provider.get("Feature:limit"), None);
}

#[tokio::test(start_paused = true)]
async fn test_reload_does_not_overwrite_concurrent_point_merge() {
    let store = MockStore::new();
    store.set("App:B", "v1");
    store.set("App:S", "1");
    let outside = ["Other:W1", "Other:W2", "Other:W3", "Other:W4"];
    for key in outside {
        store.set(key, "w");
    }

    let mut builder = builder(&store)
        .select(SettingSelector::new("App:*", None))
        .watch(WatchRegistration::sentinel(KeyIdentity::new("App:S")).with_cache_expiration(Duration::from_secs(2)))
        .watch(watch("App:B", 1));
    for key in outside {
        builder = builder.watch(watch(key, 300));
    }
    let provider = loaded(builder).await;
    let cancel = CancellationToken::new();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    provider.add_subscriber(Arc::new(move |snapshot: &Arc<CachedSnapshot>| {
        observed.lock().push(snapshot.get("App:B").map(str::to_string));
    }));

    // Every store call takes 300ms. Checking B at t=1s moves its next check
    // to t=2.3s, one second after the sentinel's.
    store.delay(PRIMARY, Duration::from_millis(300));
    tokio::time::advance(Duration::from_secs(1)).await;
    provider.refresh(&cancel).await.unwrap();
    tokio::time::advance(Duration::from_millis(700)).await;
    store.set("App:S", "2");

    // The reload lists B=v1 at 2.6s, then fetches the four keys outside the
    // selector until 3.8s. B changes at 2.7s and the second pass has v2 by 3.3s.
    let (reload, merge) = tokio::join!(provider.refresh(&cancel), async {
        tokio::time::sleep(Duration::from_millis(700)).await;
        store.set("App:B", "v2");
        provider.refresh(&cancel).await
    });
    let (reload, merge) = (reload.unwrap(), merge.unwrap());

    assert!(reload.reloaded);
    assert_eq!(merge.changed, 1);
    assert!(merge.published);
    assert_eq!(provider.get("App:B").as_deref(), Some("v2"));
    assert_eq!(*seen.lock(), [Some("v1".to_string()), Some("v2".to_string())]);

    // The merged token stuck, so the next check of B finds nothing new.
    tokio::time::advance(Duration::from_secs(1)).await;
    let report = provider.refresh(&cancel).await.unwrap();
    assert_eq!(report.checked, 1);
    assert!(!report.published);
    assert_eq!(provider.get("App:B").as_deref(), Some("v2"));
}
