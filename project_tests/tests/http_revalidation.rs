//! A resource fetched over HTTP keeps its ETag between fetches, so a manual
//! refetch revalidates instead of downloading again.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use lib_sync::configs::SyncConfig;
use lib_sync::coordinator::{ResourceDescriptor, ResourceHandle, ResourceSnapshot, UpdateSource};
use lib_sync::retrieve::{http_fetcher, ApiClient};
use project_tests::{http_stub, init_logging, quiet_transport, stack};
use serde_json::json;

async fn wait_until(handle: &ResourceHandle, done: impl Fn(&ResourceSnapshot) -> bool) -> ResourceSnapshot {
    let mut changes = handle.changes();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|s| done(s)))
        .await
        .expect("resource did not settle in time")
        .unwrap()
        .clone();
    snapshot
}

#[tokio::test]
async fn refetch_revalidates_with_the_stored_etag() {
    init_logging();
    let (base_url, hits) = http_stub(json!({"items": [1, 2]}), "\"v1\"").await;
    let rig = stack(SyncConfig {
        transport: quiet_transport(),
        ..SyncConfig::default()
    });
    let client = Arc::new(ApiClient::new(&base_url, None, 0).unwrap());
    let handle = rig.coordinator.register(
        ResourceDescriptor::with_fetcher("items", http_fetcher(client, "items")).without_polling(),
    );

    let first = wait_until(&handle, |s| s.data.is_some() && !s.is_validating).await;
    assert_eq!(first.data, Some(json!({"items": [1, 2]})));
    assert_eq!(first.last_update_source, Some(UpdateSource::Poll));
    assert_eq!(hits.full.load(Ordering::SeqCst), 1);
    assert!(rig.cache.validate_etag("items", "\"v1\"").await);

    handle.refetch();
    let second = wait_until(&handle, |s| s.stats.poll_executions == 2 && !s.is_validating).await;
    assert_eq!(hits.not_modified.load(Ordering::SeqCst), 1);
    assert_eq!(hits.full.load(Ordering::SeqCst), 1);
    assert_eq!(second.data, first.data);
    assert!(second.seq > first.seq);
    assert!(second.error.is_none());
    assert!(rig.cache.validate_etag("items", "\"v1\"").await);

    // Invalidation forgets the validators: full download again.
    handle.invalidate();
    let third = wait_until(&handle, |s| s.stats.poll_executions == 3 && !s.is_validating).await;
    assert_eq!(hits.full.load(Ordering::SeqCst), 2);
    assert_eq!(third.stats.invalidations, 1);
    assert_eq!(third.data, Some(json!({"items": [1, 2]})));
}
