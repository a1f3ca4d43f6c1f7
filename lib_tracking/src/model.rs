use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single per-frame detection as produced by the external detector/tracker.
///
/// Everything is optional on the wire: a detection without a `track_id` is
/// ignored during reconciliation, a missing `class_name` falls back to
/// `"unknown"`, and a missing or malformed `bbox` simply yields no thumbnail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub track_id: Option<i64>,
    pub class_name: Option<String>,
    /// `[x1, y1, x2, y2]` in frame pixel coordinates.
    pub bbox: Option<Vec<f32>>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// The persisted state of one tracked object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRecord {
    pub track_id: i64,
    pub class_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
    /// Populated once, if and when the background identification completes.
    pub enrichment: Option<EnrichmentResult>,
    /// Base64-encoded JPEG crop captured at creation time.
    pub thumbnail: Option<String>,
}

/// Structured species identification returned by a VLM backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub common_name: String,
    pub scientific_name: String,
    pub description: String,
    pub habitat: String,
    pub diet: String,
    pub conservation_status: String,
}

/// One row of recent identification history, used to bias new lookups
/// toward species seen a moment ago.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesSighting {
    pub common_name: String,
    pub scientific_name: String,
}

/// Lifecycle event broadcast to every subscriber.
///
/// Serializes to the wire envelope `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TrackEvent {
    TrackNew {
        track_id: i64,
        class_name: String,
        first_seen: DateTime<Utc>,
        enrichment: Option<EnrichmentResult>,
    },
    TrackRemoved {
        track_id: i64,
    },
    TrackUpdated {
        track_id: i64,
        enrichment: EnrichmentResult,
    },
}

impl TrackEvent {
    /// The track this event refers to.
    pub fn track_id(&self) -> i64 {
        match self {
            TrackEvent::TrackNew { track_id, .. } => *track_id,
            TrackEvent::TrackRemoved { track_id } => *track_id,
            TrackEvent::TrackUpdated { track_id, .. } => *track_id,
        }
    }
}
