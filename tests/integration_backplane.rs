//! Cross-instance invalidation through the backplane.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use memotier::{KeyArgs, MemoryRemoteBackend, RuntimePolicy};

#[tokio::test]
async fn tag_invalidation_reaches_peer_instances() {
    let l2 = Arc::new(MemoryRemoteBackend::new());
    let backplane = shared_backplane();
    let instance_a = peer_instance("node-a", Arc::clone(&l2), Arc::clone(&backplane));
    let instance_b = peer_instance("node-b", Arc::clone(&l2), backplane);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let method = test_method("peer_tags");

    // A caches the value with a tag; the entry lands in A's L1 and shared L2
    let _: String = instance_a
        .get_or_create_with_policy(
            &method,
            KeyArgs::new(),
            RuntimePolicy::with_duration(Duration::from_secs(300)).tags(["T"]),
            || async { Ok("v".to_string()) },
        )
        .await
        .unwrap();

    // both instances can read it
    let at_a: Option<String> = instance_a.try_get(&method, &KeyArgs::new()).await.unwrap();
    let at_b: Option<String> = instance_b.try_get(&method, &KeyArgs::new()).await.unwrap();
    assert_eq!(at_a, Some("v".to_string()));
    assert_eq!(at_b, Some("v".to_string()));

    // B invalidates the tag: shared L2 entry goes away immediately, and A's
    // L1 copy is dropped when the backplane message arrives
    instance_b.invalidate_by_tags(["T"]).await.unwrap();

    let gone_at_a = eventually(Duration::from_secs(5), || async {
        let value: Option<String> = instance_a.try_get(&method, &KeyArgs::new()).await.unwrap();
        value.is_none().then_some(())
    })
    .await;
    assert!(
        gone_at_a.is_some(),
        "peer invalidation must clear instance A within the deadline"
    );
}

#[tokio::test]
async fn key_invalidation_propagates_between_peers() {
    let l2 = Arc::new(MemoryRemoteBackend::new());
    let backplane = shared_backplane();
    let instance_a = peer_instance("key-a", Arc::clone(&l2), Arc::clone(&backplane));
    let instance_b = peer_instance("key-b", Arc::clone(&l2), backplane);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let method = test_method("peer_keys");

    let _: String = instance_a
        .get_or_create(&method, KeyArgs::new(), || async { Ok("v".to_string()) })
        .await
        .unwrap();
    // B pulls it into its own L1 via the shared L2
    let at_b: Option<String> = instance_b.try_get(&method, &KeyArgs::new()).await.unwrap();
    assert_eq!(at_b, Some("v".to_string()));

    let key = instance_a.cache_key(&method, &KeyArgs::new()).unwrap();
    instance_a.invalidate_by_keys([&key]).await.unwrap();

    let gone_at_b = eventually(Duration::from_secs(5), || async {
        let value: Option<String> = instance_b.try_get(&method, &KeyArgs::new()).await.unwrap();
        value.is_none().then_some(())
    })
    .await;
    assert!(gone_at_b.is_some());
}

#[tokio::test]
async fn clear_all_propagates_between_peers() {
    let l2 = Arc::new(MemoryRemoteBackend::new());
    let backplane = shared_backplane();
    let instance_a = peer_instance("clear-a", Arc::clone(&l2), Arc::clone(&backplane));
    let instance_b = peer_instance("clear-b", Arc::clone(&l2), backplane);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let method = test_method("peer_clear");
    let _: String = instance_b
        .get_or_create(&method, KeyArgs::new(), || async { Ok("v".to_string()) })
        .await
        .unwrap();

    instance_a.clear().await.unwrap();

    let gone = eventually(Duration::from_secs(5), || async {
        let value: Option<String> = instance_b.try_get(&method, &KeyArgs::new()).await.unwrap();
        value.is_none().then_some(())
    })
    .await;
    assert!(gone.is_some());
}

#[tokio::test]
async fn publisher_does_not_invalidate_itself_via_loopback() {
    let l2 = Arc::new(MemoryRemoteBackend::new());
    let backplane = shared_backplane();
    let instance_a = peer_instance("loop-a", Arc::clone(&l2), Arc::clone(&backplane));
    let _instance_b = peer_instance("loop-b", l2, backplane);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let method = test_method("loopback");
    let _: String = instance_a
        .get_or_create_with_policy(
            &method,
            KeyArgs::new(),
            RuntimePolicy::with_duration(Duration::from_secs(300)).tags(["other"]),
            || async { Ok("mine".to_string()) },
        )
        .await
        .unwrap();

    // publishing an unrelated tag invalidation must not disturb A's entry,
    // and A's own message is dropped by its consumer
    instance_a.invalidate_by_tags(["unrelated"]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let still: Option<String> = instance_a.try_get(&method, &KeyArgs::new()).await.unwrap();
    assert_eq!(still, Some("mine".to_string()));
    let stats = instance_a.stats().backplane.unwrap();
    assert!(stats.loopback_dropped >= 1);
}
