//! Loader Notifications
//!
//! Optional sinks for terminal load events. The UI layer plugs in through
//! `LoaderObserver` to surface fatal failures; `EventBus` fans events out
//! over a broadcast channel. The loader works the same with no observer.

use std::time::Duration;

use tokio::sync::broadcast;

use super::error::LoadError;
use super::path::CanonicalId;

/// Receives terminal load events. Every method defaults to a no-op.
///
/// Observers are never called while the registry is locked, so they may call
/// back into the loader.
pub trait LoaderObserver: Send + Sync {
    fn module_loaded(&self, _id: &CanonicalId, _elapsed: Duration) {}

    /// A load ended in failure (retries exhausted or critical dependency).
    fn module_failed(&self, _id: &CanonicalId, _error: &LoadError) {}

    fn fallback_installed(&self, _id: &CanonicalId) {}

    fn proxy_bound(&self, _id: &CanonicalId, _replayed: usize) {}
}

/// An event published on the `EventBus`.
#[derive(Clone, Debug, PartialEq)]
pub enum LoaderEvent {
    Loaded { id: CanonicalId, elapsed: Duration },
    Failed { id: CanonicalId, error: LoadError },
    FallbackInstalled { id: CanonicalId },
    ProxyBound { id: CanonicalId, replayed: usize },
}

/// Broadcasts loader events to any number of subscribers.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LoaderEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: LoaderEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl LoaderObserver for EventBus {
    fn module_loaded(&self, id: &CanonicalId, elapsed: Duration) {
        self.publish(LoaderEvent::Loaded {
            id: id.clone(),
            elapsed,
        });
    }

    fn module_failed(&self, id: &CanonicalId, error: &LoadError) {
        self.publish(LoaderEvent::Failed {
            id: id.clone(),
            error: error.clone(),
        });
    }

    fn fallback_installed(&self, id: &CanonicalId) {
        self.publish(LoaderEvent::FallbackInstalled { id: id.clone() });
    }

    fn proxy_bound(&self, id: &CanonicalId, replayed: usize) {
        self.publish(LoaderEvent::ProxyBound {
            id: id.clone(),
            replayed,
        });
    }
}
