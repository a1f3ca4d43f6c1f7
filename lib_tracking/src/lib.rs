//! # Wildlife Track Lifecycle Core
//!
//! The core engine behind the wildlife camera backend. An external
//! detector/tracker hands each video frame's detections (bounding boxes with
//! tracker-assigned numeric IDs) to the [`manager::TrackingManager`], which:
//!
//! - reconciles the detections against the set of currently active tracks,
//! - creates a persisted record (with a cropped JPEG thumbnail) for every
//!   previously-unseen ID,
//! - deactivates tracks that stay absent past a grace period,
//! - schedules at most one background species-identification lookup per track
//!   through the [`gateway::EnrichmentGateway`], and
//! - fans every lifecycle transition out to live subscribers via the
//!   [`hub::BroadcastHub`].
//!
//! Detection, re-identification and the production database are external
//! collaborators; they plug in behind the [`store::TrackStore`] and
//! [`gateway::EnrichmentBackend`] ports.

// Declare the modules to re-export
pub mod backends;
pub mod gateway;
pub mod hub;
pub mod manager;
pub mod model;
pub mod store;
pub mod thumbnail;

// Re-export the commonly wired-together surface
pub use gateway::{EnrichmentBackend, EnrichmentGateway, VlmMode};
pub use hub::BroadcastHub;
pub use manager::{ManagerOptions, TrackingManager};
pub use model::{Detection, EnrichmentResult, SpeciesSighting, TrackEvent, TrackRecord};
pub use store::{MemoryStore, TrackStore};
