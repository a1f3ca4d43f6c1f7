//! Identification pipeline scenarios: dedup, timeout, failure and context
//! biasing, driven through the public manager surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use lib_tracking::{ManagerOptions, MemoryStore, TrackEvent};
use project_tests::{build_manager, detection, drain_enrichment, next_event, ScriptedBackend};

#[tokio::test]
async fn reappearance_while_lookup_pending_schedules_no_second_lookup() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(ScriptedBackend::succeeding(Duration::from_millis(300)));
    let manager = build_manager(store.clone(), backend.clone(), ManagerOptions::default()).await;
    let (_id, mut events) = manager.hub().register();
    let t0 = Utc::now();

    manager.process_detections(None, &[detection(4, "boar")], t0).await;
    // Disappears past the grace period, then the same ID comes back while
    // the first lookup is still in flight.
    manager
        .process_detections(None, &[], t0 + TimeDelta::seconds(11))
        .await;
    manager
        .process_detections(None, &[detection(4, "boar")], t0 + TimeDelta::seconds(12))
        .await;

    assert_eq!(manager.pending_count().await, 1);
    drain_enrichment(&manager).await;
    assert_eq!(backend.call_count(), 1);

    // new, removed, new, then exactly one updated.
    let mut updated = 0;
    for _ in 0..4 {
        if matches!(next_event(&mut events).await, TrackEvent::TrackUpdated { .. }) {
            updated += 1;
        }
    }
    assert_eq!(updated, 1);
}

#[tokio::test]
async fn timed_out_lookup_is_dropped_silently() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(ScriptedBackend::succeeding(Duration::from_secs(30)));
    let manager = build_manager(
        store.clone(),
        backend,
        ManagerOptions {
            enrichment_timeout: Duration::from_millis(50),
            ..ManagerOptions::default()
        },
    )
    .await;
    let (_id, mut events) = manager.hub().register();

    manager
        .process_detections(None, &[detection(9, "owl")], Utc::now())
        .await;
    assert!(matches!(
        next_event(&mut events).await,
        TrackEvent::TrackNew { track_id: 9, .. }
    ));

    drain_enrichment(&manager).await;

    // No track_updated event, enrichment stays null, dedup slot released.
    assert!(events.try_recv().is_err());
    assert!(store.get_track(9).await.expect("row").enrichment.is_none());
    assert_eq!(manager.pending_count().await, 0);
}

#[tokio::test]
async fn failed_lookup_leaves_track_unidentified_but_reusable() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(ScriptedBackend::failing());
    let manager = build_manager(store.clone(), backend.clone(), ManagerOptions::default()).await;
    let t0 = Utc::now();

    manager.process_detections(None, &[detection(2, "fox")], t0).await;
    drain_enrichment(&manager).await;

    assert!(store.get_track(2).await.expect("row").enrichment.is_none());

    // The dedup slot was released: a reappearance after removal triggers a
    // fresh lookup.
    manager
        .process_detections(None, &[], t0 + TimeDelta::seconds(11))
        .await;
    manager
        .process_detections(None, &[detection(2, "fox")], t0 + TimeDelta::seconds(12))
        .await;
    drain_enrichment(&manager).await;
    assert_eq!(backend.call_count(), 2);
}

#[tokio::test]
async fn disabled_enrichment_schedules_nothing() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(ScriptedBackend::succeeding(Duration::ZERO));
    let manager = build_manager(
        store.clone(),
        backend.clone(),
        ManagerOptions {
            enrichment_enabled: false,
            ..ManagerOptions::default()
        },
    )
    .await;

    manager
        .process_detections(None, &[detection(6, "deer")], Utc::now())
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(backend.call_count(), 0);
    assert_eq!(manager.pending_count().await, 0);
    assert!(store.get_track(6).await.expect("row").enrichment.is_none());
}
