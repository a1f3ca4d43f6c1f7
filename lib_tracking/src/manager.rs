//! The track lifecycle state machine.
//!
//! One reconciliation pass per frame: refresh last-seen for every detection,
//! create records (thumbnail, persistence, broadcast, background
//! identification) for previously-unseen IDs, then deactivate tracks that
//! have been absent longer than the grace period. Identification runs as a
//! fire-and-forget task bounded by a timeout so a slow VLM can never stall
//! frame reconciliation.

use crate::gateway::EnrichmentGateway;
use crate::hub::BroadcastHub;
use crate::model::{Detection, TrackEvent, TrackRecord};
use crate::store::TrackStore;
use crate::thumbnail;
use chrono::{DateTime, TimeDelta, Utc};
use image::RgbImage;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Tunables for the lifecycle manager.
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// How long a track survives without being detected.
    pub grace_period: Duration,
    /// Master switch for the background identification pipeline.
    pub enrichment_enabled: bool,
    /// Upper bound on one identification lookup, context fetch excluded.
    pub enrichment_timeout: Duration,
    /// How many recent identified sightings to pass along as lookup context.
    pub history_limit: usize,
    /// JPEG quality for thumbnails, 0-100.
    pub jpeg_quality: u8,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            enrichment_enabled: true,
            enrichment_timeout: Duration::from_secs(30),
            history_limit: 2,
            jpeg_quality: 85,
        }
    }
}

/// Shared-state handle over the lifecycle manager. Cheap to clone; all
/// clones operate on the same sets.
#[derive(Clone)]
pub struct TrackingManager {
    store: Arc<dyn TrackStore>,
    gateway: Arc<EnrichmentGateway>,
    hub: Arc<BroadcastHub>,
    options: ManagerOptions,
    grace: TimeDelta,
    /// IDs currently considered on-camera. `active` in the store iff in here.
    active: Arc<Mutex<HashSet<i64>>>,
    /// Last frame timestamp each active ID was observed at.
    last_seen: Arc<Mutex<HashMap<i64, DateTime<Utc>>>>,
    /// IDs with an identification lookup currently in flight (dedup set).
    pending: Arc<Mutex<HashSet<i64>>>,
    /// Serializes reconciliation passes; the sets above are not safe for
    /// two overlapping passes.
    reconcile_gate: Arc<Mutex<()>>,
}

impl TrackingManager {
    /// Build a manager, hydrating the active-ID set from the store. A store
    /// failure here degrades to an empty set.
    pub async fn new(
        store: Arc<dyn TrackStore>,
        gateway: Arc<EnrichmentGateway>,
        hub: Arc<BroadcastHub>,
        options: ManagerOptions,
    ) -> Self {
        let active: HashSet<i64> = match store.get_all_active_tracks().await {
            Ok(tracks) => tracks.iter().map(|t| t.track_id).collect(),
            Err(e) => {
                log::warn!("Failed to load active tracks from store: {}", e);
                HashSet::new()
            }
        };
        log::info!(
            "TrackingManager initialized ({} active track(s), enrichment: {})",
            active.len(),
            options.enrichment_enabled
        );

        Self {
            store,
            gateway,
            hub,
            options,
            grace: TimeDelta::from_std(options.grace_period).unwrap_or(TimeDelta::MAX),
            active: Arc::new(Mutex::new(active)),
            last_seen: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
            reconcile_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Reconcile one frame's detections against the known tracks.
    ///
    /// New-track handling always completes before disappearance handling is
    /// evaluated. A failure while handling one detection never prevents the
    /// others from being reconciled. Detections without a `track_id` are
    /// ignored.
    pub async fn process_detections(
        &self,
        frame: Option<&RgbImage>,
        detections: &[Detection],
        now: DateTime<Utc>,
    ) {
        let _gate = self.reconcile_gate.lock().await;

        let mut current_ids: HashSet<i64> = HashSet::new();
        for detection in detections {
            let Some(track_id) = detection.track_id else {
                continue;
            };
            current_ids.insert(track_id);
            self.last_seen.lock().await.insert(track_id, now);

            let is_new = !self.active.lock().await.contains(&track_id);
            if is_new {
                self.handle_new_track(track_id, detection, frame, now).await;
            } else if let Err(e) = self.store.update_last_seen(track_id, now).await {
                log::warn!("Failed to persist last_seen for track {}: {}", track_id, e);
            }
        }

        // Tracks missing from this frame; only deactivate past the grace period.
        let vanished: Vec<i64> = {
            let active = self.active.lock().await;
            active.difference(&current_ids).copied().collect()
        };
        for track_id in vanished {
            let expired = match self.last_seen.lock().await.get(&track_id) {
                None => true,
                Some(seen) => now.signed_duration_since(*seen) > self.grace,
            };
            if expired {
                self.handle_disappeared(track_id).await;
                self.last_seen.lock().await.remove(&track_id);
            }
        }
    }

    async fn handle_new_track(
        &self,
        track_id: i64,
        detection: &Detection,
        frame: Option<&RgbImage>,
        now: DateTime<Utc>,
    ) {
        let class_name = detection
            .class_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        log::info!("New track detected: id={}, class={}", track_id, class_name);

        let thumbnail = frame.and_then(|f| {
            thumbnail::extract(f, detection.bbox.as_deref(), self.options.jpeg_quality)
        });

        let record = TrackRecord {
            track_id,
            class_name: class_name.clone(),
            first_seen: now,
            last_seen: now,
            active: true,
            enrichment: None,
            thumbnail: thumbnail.clone(),
        };
        if let Err(e) = self.store.create_track(record).await {
            log::error!("Failed to persist new track {}: {}", track_id, e);
        }

        self.active.lock().await.insert(track_id);

        self.hub.broadcast(TrackEvent::TrackNew {
            track_id,
            class_name: class_name.clone(),
            first_seen: now,
            enrichment: None,
        });

        // At most one lookup in flight per ID; the pending set is the dedup.
        if self.options.enrichment_enabled && self.pending.lock().await.insert(track_id) {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_enrichment(track_id, class_name, thumbnail).await;
            });
        }
    }

    async fn handle_disappeared(&self, track_id: i64) {
        log::info!("Track disappeared: id={}", track_id);

        self.active.lock().await.remove(&track_id);

        if let Err(e) = self.store.deactivate_track(track_id).await {
            log::error!("Failed to deactivate track {}: {}", track_id, e);
        }

        self.hub.broadcast(TrackEvent::TrackRemoved { track_id });
    }

    /// Background identification for one track. Runs off the reconciliation
    /// path; an in-flight lookup is never cancelled by the track
    /// disappearing, so a `track_updated` event may legitimately arrive
    /// after the track's `track_removed`.
    async fn run_enrichment(&self, track_id: i64, class_name: String, thumbnail: Option<String>) {
        log::info!(
            "Starting identification for track {} (class: {}, thumbnail: {} bytes)",
            track_id,
            class_name,
            thumbnail.as_deref().map_or(0, str::len)
        );

        // Recent sightings bias the lookup; losing them is not fatal.
        let context = match self
            .store
            .get_recent_identified_history(self.options.history_limit)
            .await
        {
            Ok(rows) if !rows.is_empty() => {
                let joined = rows
                    .iter()
                    .map(|r| format!("{} ({})", r.common_name, r.scientific_name))
                    .collect::<Vec<_>>()
                    .join(", ");
                log::debug!("Identification context for track {}: {}", track_id, joined);
                Some(joined)
            }
            Ok(_) => None,
            Err(e) => {
                log::warn!("Failed to fetch sighting history for context: {}", e);
                None
            }
        };

        let lookup = self.gateway.route(
            &class_name,
            thumbnail.as_deref(),
            context.as_deref(),
            "image/jpeg",
        );
        match timeout(self.options.enrichment_timeout, lookup).await {
            Ok(Ok(result)) => {
                if let Err(e) = self.store.update_enrichment(track_id, &result).await {
                    log::error!("Failed to persist identification for track {}: {}", track_id, e);
                }
                log::info!(
                    "Identification complete for track {}: {}",
                    track_id,
                    result.common_name
                );
                self.hub.broadcast(TrackEvent::TrackUpdated {
                    track_id,
                    enrichment: result,
                });
            }
            Ok(Err(e)) => {
                // No retry: a failed lookup leaves the enrichment field null.
                log::error!("Identification failed for track {}: {}", track_id, e);
            }
            Err(_) => {
                log::warn!(
                    "Identification timed out for track {} after {:?}",
                    track_id,
                    self.options.enrichment_timeout
                );
            }
        }

        // Final step, on every path: release the dedup slot.
        self.pending.lock().await.remove(&track_id);
    }

    /// All tracks currently marked active in the store.
    pub async fn active_tracks(&self) -> anyhow::Result<Vec<TrackRecord>> {
        self.store.get_all_active_tracks().await
    }

    /// Number of identification lookups currently in flight.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Store statistics merged with the manager's own counters.
    pub async fn get_stats(&self) -> serde_json::Value {
        let mut stats = match self.store.get_stats().await {
            Ok(map) => map,
            Err(e) => {
                log::warn!("Failed to read store stats: {}", e);
                serde_json::Map::new()
            }
        };

        let mut active_ids: Vec<i64> = self.active.lock().await.iter().copied().collect();
        active_ids.sort_unstable();

        stats.insert("active_track_count".to_string(), json!(active_ids.len()));
        stats.insert("active_track_ids".to_string(), json!(active_ids));
        stats.insert(
            "pending_enrichment".to_string(),
            json!(self.pending.lock().await.len()),
        );
        stats.insert("subscribers".to_string(), json!(self.hub.count()));
        serde_json::Value::Object(stats)
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn gateway(&self) -> &Arc<EnrichmentGateway> {
        &self.gateway
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{EnrichmentBackend, VlmMode};
    use crate::model::EnrichmentResult;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct SlowBackend {
        delay: Duration,
    }

    #[async_trait]
    impl EnrichmentBackend for SlowBackend {
        async fn identify(
            &self,
            class_name: &str,
            _thumbnail: Option<&str>,
            _context: Option<&str>,
            _mime_type: &str,
        ) -> anyhow::Result<EnrichmentResult> {
            tokio::time::sleep(self.delay).await;
            Ok(EnrichmentResult {
                common_name: format!("Identified {}", class_name),
                scientific_name: "Testus exampulus".to_string(),
                description: String::new(),
                habitat: String::new(),
                diet: String::new(),
                conservation_status: "LC".to_string(),
            })
        }
    }

    fn gateway(delay: Duration) -> Arc<EnrichmentGateway> {
        let backend = Arc::new(SlowBackend { delay });
        Arc::new(EnrichmentGateway::new(
            backend.clone(),
            backend,
            VlmMode::Cloud,
        ))
    }

    async fn manager(options: ManagerOptions) -> (TrackingManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let m = TrackingManager::new(
            store.clone(),
            gateway(Duration::ZERO),
            Arc::new(BroadcastHub::new()),
            options,
        )
        .await;
        (m, store)
    }

    fn detection(track_id: i64, class_name: &str, bbox: Option<Vec<f32>>) -> Detection {
        Detection {
            track_id: Some(track_id),
            class_name: Some(class_name.to_string()),
            bbox,
            confidence: Some(0.9),
        }
    }

    async fn wait_for_enrichment(manager: &TrackingManager) {
        for _ in 0..200 {
            if manager.pending_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("identification task never drained");
    }

    #[tokio::test]
    async fn new_track_is_persisted_active_and_enriched() {
        let (manager, store) = manager(ManagerOptions::default()).await;
        let now = Utc::now();

        manager
            .process_detections(None, &[detection(7, "fox", None)], now)
            .await;

        let active = manager.active_tracks().await.expect("active tracks");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].track_id, 7);
        assert_eq!(active[0].class_name, "fox");
        assert!(active[0].enrichment.is_none());

        wait_for_enrichment(&manager).await;
        let row = store.get_track(7).await.expect("row exists");
        let enrichment = row.enrichment.expect("identification landed");
        assert_eq!(enrichment.common_name, "Identified fox");
    }

    #[tokio::test]
    async fn detections_without_id_are_ignored() {
        let (manager, _store) = manager(ManagerOptions::default()).await;
        let det = Detection {
            track_id: None,
            class_name: Some("fox".to_string()),
            bbox: None,
            confidence: None,
        };

        manager.process_detections(None, &[det], Utc::now()).await;
        assert!(manager.active_tracks().await.expect("tracks").is_empty());
    }

    #[tokio::test]
    async fn malformed_bbox_still_creates_track_without_thumbnail() {
        let (manager, store) = manager(ManagerOptions::default()).await;
        let frame = RgbImage::new(64, 64);

        manager
            .process_detections(
                Some(&frame),
                &[detection(3, "deer", Some(vec![1.0, 2.0, 3.0]))],
                Utc::now(),
            )
            .await;

        let row = store.get_track(3).await.expect("row exists");
        assert!(row.active);
        assert!(row.thumbnail.is_none());
    }

    #[tokio::test]
    async fn track_survives_miss_within_grace_and_expires_after() {
        let (manager, store) = manager(ManagerOptions {
            enrichment_enabled: false,
            ..ManagerOptions::default()
        })
        .await;
        let t0 = Utc::now();

        manager
            .process_detections(None, &[detection(7, "fox", None)], t0)
            .await;

        // Missing one second later: grace period masks the dropout.
        manager
            .process_detections(None, &[], t0 + TimeDelta::seconds(1))
            .await;
        assert_eq!(manager.active_tracks().await.expect("tracks").len(), 1);

        // Still missing past the 10s grace period: deactivated.
        manager
            .process_detections(None, &[], t0 + TimeDelta::seconds(11))
            .await;
        assert!(manager.active_tracks().await.expect("tracks").is_empty());
        assert!(!store.get_track(7).await.expect("row exists").active);
    }

    #[tokio::test]
    async fn enrichment_is_deduplicated_per_track() {
        let store = Arc::new(MemoryStore::new());
        let manager = TrackingManager::new(
            store.clone(),
            gateway(Duration::from_millis(200)),
            Arc::new(BroadcastHub::new()),
            ManagerOptions::default(),
        )
        .await;
        let now = Utc::now();

        // Same ID observed as "new" twice in one frame: one lookup only.
        manager
            .process_detections(
                None,
                &[detection(5, "boar", None), detection(5, "boar", None)],
                now,
            )
            .await;
        assert_eq!(manager.pending_count().await, 1);

        wait_for_enrichment(&manager).await;
        assert!(store.get_track(5).await.expect("row").enrichment.is_some());
    }

    #[tokio::test]
    async fn timed_out_enrichment_leaves_track_unidentified() {
        let store = Arc::new(MemoryStore::new());
        let manager = TrackingManager::new(
            store.clone(),
            gateway(Duration::from_secs(60)),
            Arc::new(BroadcastHub::new()),
            ManagerOptions {
                enrichment_timeout: Duration::from_millis(50),
                ..ManagerOptions::default()
            },
        )
        .await;

        manager
            .process_detections(None, &[detection(9, "lynx", None)], Utc::now())
            .await;

        wait_for_enrichment(&manager).await;
        assert!(store.get_track(9).await.expect("row").enrichment.is_none());
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn stats_merge_store_and_manager_counters() {
        let (manager, _store) = manager(ManagerOptions {
            enrichment_enabled: false,
            ..ManagerOptions::default()
        })
        .await;

        manager
            .process_detections(
                None,
                &[detection(2, "fox", None), detection(1, "deer", None)],
                Utc::now(),
            )
            .await;

        let stats = manager.get_stats().await;
        assert_eq!(stats["active_track_count"], 2);
        assert_eq!(stats["active_track_ids"], json!([1, 2]));
        assert_eq!(stats["pending_enrichment"], 0);
        assert_eq!(stats["subscribers"], 0);
        assert_eq!(stats["total_tracks"], 2);
    }
}
