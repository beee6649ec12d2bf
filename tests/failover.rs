//! Gateway and change-feed failover across the endpoint set.

use std::time::Duration;

use config_relay::model::{ChangeKind, ConfigValue};
use config_relay::storage::{GatewayError, HealthState};

mod common;
use common::{fast_config, key, meta, runtime, scope};

#[tokio::test]
async fn test_operations_survive_minority_of_endpoints_down() {
    let (cluster, runtime) = runtime(fast_config(3));
    let gateway = runtime.gateway();

    gateway.put(&key("timeout_ms"), ConfigValue::from(250i64), meta()).await.unwrap();

    for down in [0, 1] {
        cluster.set_reachable(down, false);
    }

    let version = gateway
        .put(&key("timeout_ms"), ConfigValue::from(500i64), meta())
        .await
        .expect("write should fail over to the surviving endpoint");
    let entry = gateway.get(&key("timeout_ms")).await.unwrap();
    assert_eq!(entry.value, ConfigValue::from(500i64));
    assert_eq!(entry.version, version);

    gateway.put(&key("retries"), ConfigValue::from(3i64), meta()).await.unwrap();
    let all = gateway.get_all(&scope()).await.unwrap();
    assert_eq!(all.len(), 2);

    gateway.delete(&key("retries")).await.unwrap();
    assert!(matches!(
        gateway.get(&key("retries")).await,
        Err(GatewayError::NotFound(_))
    ));

    let preferred = gateway.preferred().expect("a usable endpoint remains");
    assert_eq!(preferred.address, "memory://node-2");
}

#[tokio::test]
async fn test_every_endpoint_down_is_unavailable() {
    let (cluster, runtime) = runtime(fast_config(3));
    for node in 0..3 {
        cluster.set_reachable(node, false);
    }

    let result = runtime.gateway().get(&key("timeout_ms")).await;
    assert!(matches!(result, Err(GatewayError::Unavailable { attempts: 3 })));

    cluster.set_reachable(1, true);
    assert!(matches!(
        runtime.gateway().get(&key("timeout_ms")).await,
        Err(GatewayError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_monitor_reports_health_and_leader() {
    let config = fast_config(3);
    let threshold = config.monitor.unhealthy_threshold;
    let (cluster, runtime) = runtime(config);

    cluster.set_leader(2);
    cluster.set_reachable(0, false);
    let mut snapshot = runtime.monitor().probe_round().await;
    for _ in 1..threshold {
        snapshot = runtime.monitor().probe_round().await;
    }

    assert_eq!(snapshot.healthy_count(), 2);
    assert_eq!(snapshot.endpoints[0].health, HealthState::Unhealthy);
    assert_eq!(snapshot.leader().map(|e| e.address.as_str()), Some("memory://node-2"));
    assert_eq!(runtime.monitor().snapshot().round, snapshot.round);
}

#[tokio::test]
async fn test_change_stream_continues_after_endpoint_loss() {
    let (cluster, runtime) = runtime(fast_config(3));
    let gateway = runtime.gateway();
    let mut stream = runtime.feed().subscribe(scope(), None).await.unwrap();

    gateway.put(&key("a"), ConfigValue::from(1i64), meta()).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), stream.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.key, "a");

    cluster.set_reachable(0, false);
    let v2 = gateway.put(&key("a"), ConfigValue::from(2i64), meta()).await.unwrap();
    gateway.delete(&key("a")).await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("stream should resume on another endpoint")
        .unwrap()
        .unwrap();
    assert_eq!((second.kind, second.version), (ChangeKind::Put, v2));
    assert!(second.seq > first.seq);

    let third = tokio::time::timeout(Duration::from_secs(2), stream.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(third.kind, ChangeKind::Delete);
}
