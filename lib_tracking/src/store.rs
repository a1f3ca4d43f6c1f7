//! Persistence port for track records, plus an in-memory reference
//! implementation used by the tests and the demo server.
//!
//! Production deployments put a real database behind [`TrackStore`]; the
//! lifecycle manager only ever talks to the trait.

use crate::model::{EnrichmentResult, SpeciesSighting, TrackRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// The persistence operations the lifecycle manager needs.
#[async_trait]
pub trait TrackStore: Send + Sync {
    /// Insert a freshly created track record. An existing row for the same
    /// ID (a tracker-reused ID after deactivation) is replaced.
    async fn create_track(&self, record: TrackRecord) -> Result<()>;

    async fn update_last_seen(&self, track_id: i64, timestamp: DateTime<Utc>) -> Result<()>;

    async fn deactivate_track(&self, track_id: i64) -> Result<()>;

    async fn update_enrichment(&self, track_id: i64, result: &EnrichmentResult) -> Result<()>;

    async fn get_all_active_tracks(&self) -> Result<Vec<TrackRecord>>;

    /// The most recently seen identified tracks, newest first, at most
    /// `limit` rows. Used as context for new identification lookups.
    async fn get_recent_identified_history(&self, limit: usize) -> Result<Vec<SpeciesSighting>>;

    async fn get_stats(&self) -> Result<serde_json::Map<String, serde_json::Value>>;
}

/// In-memory [`TrackStore`] backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryStore {
    tracks: Mutex<HashMap<i64, TrackRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/debug helper: fetch one record by ID.
    pub async fn get_track(&self, track_id: i64) -> Option<TrackRecord> {
        self.tracks.lock().await.get(&track_id).cloned()
    }
}

#[async_trait]
impl TrackStore for MemoryStore {
    async fn create_track(&self, record: TrackRecord) -> Result<()> {
        self.tracks.lock().await.insert(record.track_id, record);
        Ok(())
    }

    async fn update_last_seen(&self, track_id: i64, timestamp: DateTime<Utc>) -> Result<()> {
        if let Some(record) = self.tracks.lock().await.get_mut(&track_id) {
            record.last_seen = timestamp;
        }
        Ok(())
    }

    async fn deactivate_track(&self, track_id: i64) -> Result<()> {
        if let Some(record) = self.tracks.lock().await.get_mut(&track_id) {
            record.active = false;
        }
        Ok(())
    }

    async fn update_enrichment(&self, track_id: i64, result: &EnrichmentResult) -> Result<()> {
        if let Some(record) = self.tracks.lock().await.get_mut(&track_id) {
            record.enrichment = Some(result.clone());
        }
        Ok(())
    }

    async fn get_all_active_tracks(&self) -> Result<Vec<TrackRecord>> {
        let tracks = self.tracks.lock().await;
        let mut active: Vec<TrackRecord> =
            tracks.values().filter(|t| t.active).cloned().collect();
        active.sort_by_key(|t| t.track_id);
        Ok(active)
    }

    async fn get_recent_identified_history(&self, limit: usize) -> Result<Vec<SpeciesSighting>> {
        let tracks = self.tracks.lock().await;
        let mut identified: Vec<&TrackRecord> =
            tracks.values().filter(|t| t.enrichment.is_some()).collect();
        identified.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        Ok(identified
            .into_iter()
            .take(limit)
            .filter_map(|t| {
                t.enrichment.as_ref().map(|e| SpeciesSighting {
                    common_name: e.common_name.clone(),
                    scientific_name: e.scientific_name.clone(),
                })
            })
            .collect())
    }

    async fn get_stats(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let tracks = self.tracks.lock().await;
        let total = tracks.len();
        let active = tracks.values().filter(|t| t.active).count();
        let identified = tracks.values().filter(|t| t.enrichment.is_some()).count();

        let mut stats = serde_json::Map::new();
        stats.insert("total_tracks".to_string(), total.into());
        stats.insert("active_tracks".to_string(), active.into());
        stats.insert("identified_tracks".to_string(), identified.into());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(track_id: i64, class_name: &str, last_seen: DateTime<Utc>) -> TrackRecord {
        TrackRecord {
            track_id,
            class_name: class_name.to_string(),
            first_seen: last_seen,
            last_seen,
            active: true,
            enrichment: None,
            thumbnail: None,
        }
    }

    fn identification(common: &str, scientific: &str) -> EnrichmentResult {
        EnrichmentResult {
            common_name: common.to_string(),
            scientific_name: scientific.to_string(),
            description: String::new(),
            habitat: String::new(),
            diet: String::new(),
            conservation_status: String::new(),
        }
    }

    #[tokio::test]
    async fn create_deactivate_roundtrip() {
        let store = MemoryStore::new();
        store
            .create_track(record(1, "fox", Utc::now()))
            .await
            .expect("create");

        assert_eq!(store.get_all_active_tracks().await.expect("read").len(), 1);

        store.deactivate_track(1).await.expect("deactivate");
        assert!(store.get_all_active_tracks().await.expect("read").is_empty());
        assert!(!store.get_track(1).await.expect("row exists").active);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for (id, name, offset) in [(1, "fox", 0), (2, "deer", 10), (3, "boar", 20)] {
            let mut rec = record(id, name, base + chrono::Duration::seconds(offset));
            rec.enrichment = Some(identification(name, &format!("{} latin", name)));
            store.create_track(rec).await.expect("create");
        }
        // An unidentified track must not show up in history.
        store
            .create_track(record(4, "bird", base + chrono::Duration::seconds(30)))
            .await
            .expect("create");

        let history = store
            .get_recent_identified_history(2)
            .await
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].common_name, "boar");
        assert_eq!(history[1].common_name, "deer");
    }

    #[tokio::test]
    async fn stats_count_total_active_identified() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.create_track(record(1, "fox", now)).await.expect("create");
        let mut rec = record(2, "deer", now);
        rec.enrichment = Some(identification("Deer", "Cervidae"));
        store.create_track(rec).await.expect("create");
        store.deactivate_track(1).await.expect("deactivate");

        let stats = store.get_stats().await.expect("stats");
        assert_eq!(stats["total_tracks"], 2);
        assert_eq!(stats["active_tracks"], 1);
        assert_eq!(stats["identified_tracks"], 1);
    }

    #[tokio::test]
    async fn reused_id_replaces_previous_row() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut old = record(5, "fox", now);
        old.active = false;
        store.create_track(old).await.expect("create");

        store
            .create_track(record(5, "deer", now + chrono::Duration::seconds(60)))
            .await
            .expect("recreate");

        let row = store.get_track(5).await.expect("row exists");
        assert!(row.active);
        assert_eq!(row.class_name, "deer");
    }
}
