//! Shared fixtures for the lifecycle integration tests: a scripted
//! identification backend, a store wrapper that fails on demand, and small
//! builders for detections and managers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use lib_tracking::model::SpeciesSighting;
use lib_tracking::{
    BroadcastHub, Detection, EnrichmentBackend, EnrichmentGateway, EnrichmentResult,
    ManagerOptions, MemoryStore, TrackEvent, TrackRecord, TrackStore, TrackingManager, VlmMode,
};

/// Identification backend with a scripted delay and outcome, counting calls.
pub struct ScriptedBackend {
    pub delay: Duration,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn succeeding(delay: Duration) -> Self {
        Self {
            delay,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            delay: Duration::ZERO,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentBackend for ScriptedBackend {
    async fn identify(
        &self,
        class_name: &str,
        _thumbnail: Option<&str>,
        _context: Option<&str>,
        _mime_type: &str,
    ) -> Result<EnrichmentResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(anyhow!("scripted backend failure"));
        }
        Ok(EnrichmentResult {
            common_name: format!("Identified {}", class_name),
            scientific_name: "Testus exampulus".to_string(),
            description: "A scripted identification.".to_string(),
            habitat: "test suite".to_string(),
            diet: "fixtures".to_string(),
            conservation_status: "LC".to_string(),
        })
    }
}

/// Store wrapper that fails `create_track` for one chosen ID and delegates
/// everything else, for failure-independence tests.
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_create_for: i64,
}

#[async_trait]
impl TrackStore for FlakyStore {
    async fn create_track(&self, record: TrackRecord) -> Result<()> {
        if record.track_id == self.fail_create_for {
            return Err(anyhow!("scripted create failure for {}", record.track_id));
        }
        self.inner.create_track(record).await
    }

    async fn update_last_seen(&self, track_id: i64, timestamp: DateTime<Utc>) -> Result<()> {
        self.inner.update_last_seen(track_id, timestamp).await
    }

    async fn deactivate_track(&self, track_id: i64) -> Result<()> {
        self.inner.deactivate_track(track_id).await
    }

    async fn update_enrichment(&self, track_id: i64, result: &EnrichmentResult) -> Result<()> {
        self.inner.update_enrichment(track_id, result).await
    }

    async fn get_all_active_tracks(&self) -> Result<Vec<TrackRecord>> {
        self.inner.get_all_active_tracks().await
    }

    async fn get_recent_identified_history(&self, limit: usize) -> Result<Vec<SpeciesSighting>> {
        self.inner.get_recent_identified_history(limit).await
    }

    async fn get_stats(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        self.inner.get_stats().await
    }
}

pub fn detection(track_id: i64, class_name: &str) -> Detection {
    Detection {
        track_id: Some(track_id),
        class_name: Some(class_name.to_string()),
        bbox: None,
        confidence: Some(0.9),
    }
}

/// A manager wired to a fresh hub and the given store/backend fixtures.
pub async fn build_manager(
    store: Arc<dyn TrackStore>,
    backend: Arc<ScriptedBackend>,
    options: ManagerOptions,
) -> TrackingManager {
    let gateway = Arc::new(EnrichmentGateway::new(
        backend.clone(),
        backend,
        VlmMode::Cloud,
    ));
    TrackingManager::new(store, gateway, Arc::new(BroadcastHub::new()), options).await
}

/// Block until no identification task is in flight any more.
pub async fn drain_enrichment(manager: &TrackingManager) {
    for _ in 0..400 {
        if manager.pending_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("identification tasks never drained");
}

/// Receive the next broadcast event, with a bounded wait.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Arc<TrackEvent>>) -> TrackEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a broadcast event")
        .expect("event channel closed")
        .as_ref()
        .clone()
}
