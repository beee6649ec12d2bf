//! With the store and the push channel gone, the last value is served for the
//! configured window and refused after it.

use std::sync::Arc;
use std::time::Duration;

use config_relay::cache::{CacheError, ClientCache, ValueSource};
use config_relay::config::RelayConfig;
use config_relay::hub::DisconnectReason;
use config_relay::lifecycle::RelayRuntime;
use config_relay::model::ConfigValue;
use config_relay::storage::MemoryCluster;

mod common;
use common::{eventually, fast_config, key, meta, runtime, scope};

/// Writes `rate_limit`, waits for push, then takes the store and push down.
async fn cut_off(config: RelayConfig) -> (MemoryCluster, Arc<RelayRuntime>, ClientCache) {
    let nodes = config.storage.endpoints.len();
    let (cluster, runtime) = runtime(config);
    runtime
        .gateway()
        .put(&key("rate_limit"), ConfigValue::from(100i64), meta())
        .await
        .unwrap();
    let cache = runtime.cache(scope(), None);
    assert!(eventually(|| async { cache.is_push_connected() }).await);
    assert_eq!(
        cache.resolve("rate_limit", None).await.unwrap().source,
        ValueSource::Cache
    );

    for node in 0..nodes {
        cluster.set_reachable(node, false);
    }
    runtime.hub().disconnect_scope(&scope(), DisconnectReason::ResyncRequired);
    assert!(eventually(|| async { !cache.is_push_connected() }).await);
    (cluster, runtime, cache)
}

#[tokio::test(start_paused = true)]
async fn test_stale_window_then_refusal() {
    let mut config = fast_config(3);
    config.cache.ttl_secs = 1;
    config.cache.max_stale_secs = 30;
    let (cluster, runtime, cache) = cut_off(config).await;

    tokio::time::advance(Duration::from_secs(10)).await;
    let resolved = cache.resolve("rate_limit", None).await.unwrap();
    assert_eq!(resolved.value, ConfigValue::from(100i64));
    assert_eq!(resolved.source, ValueSource::Stale);
    assert!(cache.get_all()[0].stale);

    tokio::time::advance(Duration::from_secs(35)).await;
    assert!(matches!(
        cache.get("rate_limit", None).await,
        Err(CacheError::StaleBeyondBound { age }) if age > Duration::from_secs(30)
    ));

    for node in 0..3 {
        cluster.set_reachable(node, true);
    }
    let resolved = cache.resolve("rate_limit", None).await.unwrap();
    assert_eq!(resolved.source, ValueSource::Store);
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_outage_marks_unexpired_value_stale() {
    let (_cluster, runtime, cache) = cut_off(fast_config(3)).await;

    tokio::time::advance(Duration::from_secs(10)).await;
    let resolved = cache.resolve("rate_limit", None).await.unwrap();
    assert_eq!(resolved.value, ConfigValue::from(100i64));
    assert_eq!(resolved.source, ValueSource::Stale);
    assert!(cache.get_all()[0].stale);

    tokio::time::advance(Duration::from_secs(25)).await;
    assert!(matches!(
        cache.get("rate_limit", None).await,
        Err(CacheError::StaleBeyondBound { .. })
    ));
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_long_ttl_does_not_extend_stale_bound() {
    let mut config = fast_config(3);
    config.cache.ttl_secs = 120;
    config.cache.max_stale_secs = 30;
    let (_cluster, runtime, cache) = cut_off(config).await;

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(matches!(
        cache.get("rate_limit", None).await,
        Err(CacheError::StaleBeyondBound { age }) if age > Duration::from_secs(30)
    ));
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_default_still_applies_without_any_record() {
    let (cluster, runtime) = runtime(fast_config(2));
    let cache = runtime.cache(scope(), None);
    for node in 0..2 {
        cluster.set_reachable(node, false);
    }

    tokio::time::advance(Duration::from_secs(120)).await;
    assert_eq!(
        cache.get("unknown", Some(ConfigValue::from(true))).await.unwrap(),
        ConfigValue::from(true)
    );
    assert_eq!(cache.get("unknown", None).await, Err(CacheError::Unavailable));
    runtime.shutdown().await;
}
