//! Broadcast hub: fans lifecycle events out to every live subscriber.
//!
//! Fan-out is zero-copy: each event is wrapped in an `Arc` once and every
//! subscriber receives a pointer to the same allocation through its own
//! unbounded channel. Delivery is best-effort; a subscriber whose channel is
//! gone is pruned after the sweep that discovered it.

use crate::model::TrackEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

static NEXT_SUBSCRIBER_ID: AtomicUsize = AtomicUsize::new(1);

struct Subscriber {
    id: usize,
    sender: mpsc::UnboundedSender<Arc<TrackEvent>>,
}

/// The live subscriber set. Registration and unregistration may race an
/// in-progress broadcast sweep; the interior mutex keeps that safe.
#[derive(Default)]
pub struct BroadcastHub {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Returns its ID (for `unregister`) and the
    /// receiving end it will get every broadcast event on.
    pub fn register(&self) -> (usize, mpsc::UnboundedReceiver<Arc<TrackEvent>>) {
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().expect("Hub lock poisoned");
        subscribers.push(Subscriber { id, sender: tx });
        log::info!("Subscriber {} registered", id);
        (id, rx)
    }

    /// Remove a subscriber. Unknown IDs are a no-op.
    pub fn unregister(&self, id: usize) {
        let mut subscribers = self.subscribers.lock().expect("Hub lock poisoned");
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() < before {
            log::info!("Subscriber {} unregistered", id);
        }
    }

    /// Deliver `event` to every current subscriber. Failed deliveries are
    /// logged and the dead subscribers removed once the sweep is complete;
    /// the broadcast itself never fails.
    pub fn broadcast(&self, event: TrackEvent) {
        let event = Arc::new(event);
        let mut subscribers = self.subscribers.lock().expect("Hub lock poisoned");

        let mut dead = Vec::new();
        for subscriber in subscribers.iter() {
            if subscriber.sender.send(event.clone()).is_err() {
                log::warn!("Failed to deliver event to subscriber {}", subscriber.id);
                dead.push(subscriber.id);
            }
        }

        // Prune after the sweep so the set is never mutated mid-scan.
        if !dead.is_empty() {
            subscribers.retain(|s| !dead.contains(&s.id));
            log::info!("Pruned {} dead subscriber(s)", dead.len());
        }
    }

    /// Number of currently registered subscribers.
    pub fn count(&self) -> usize {
        self.subscribers.lock().expect("Hub lock poisoned").len()
    }
}
