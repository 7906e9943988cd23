//! Commit-ordered event bus.
//!
//! Every committed store action produces exactly one [`StoreEvent`].
//! Delivery uses a broadcast channel sized by the store config: a
//! subscriber that falls further behind than the channel capacity is
//! disconnected with [`WatchError::Lagged`] and must reconcile from a
//! fresh view. Commits never wait for subscribers.

use tokio::sync::broadcast;
use tracing::trace;

use crate::object::{Kind, Object};

/// A committed mutation, in commit order.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Created(Object),
    Updated(Object),
    /// Carries the object as it was just before deletion.
    Deleted(Object),
}

impl StoreEvent {
    pub fn object(&self) -> &Object {
        match self {
            StoreEvent::Created(o) | StoreEvent::Updated(o) | StoreEvent::Deleted(o) => o,
        }
    }

    pub fn kind(&self) -> Kind {
        self.object().kind()
    }

    pub fn id(&self) -> &str {
        self.object().id()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The subscriber missed events and was disconnected from the ordered
    /// stream; it must re-read from a fresh view and resubscribe.
    #[error("subscriber lagged by {0} events")]
    Lagged(u64),

    #[error("store closed")]
    Closed,
}

type Predicate = Box<dyn Fn(&StoreEvent) -> bool + Send>;

/// A filtered subscription to the store's commit stream.
pub struct EventStream {
    rx: broadcast::Receiver<StoreEvent>,
    predicate: Option<Predicate>,
}

impl EventStream {
    /// Next matching event.
    ///
    /// `Err(Lagged)` means events were dropped for this subscriber,
    /// possibly including matching ones, so the caller must resync.
    pub async fn next(&mut self) -> Result<StoreEvent, WatchError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.predicate.as_ref().is_none_or(|p| p(&event)) {
                        return Ok(event);
                    }
                    trace!(kind = %event.kind(), id = %event.id(), "event filtered");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(WatchError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(WatchError::Closed);
                }
            }
        }
    }
}

/// Publisher half owned by the store.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish one event. A send with no live subscribers is fine.
    pub fn publish(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            predicate: None,
        }
    }

    pub fn subscribe_where(
        &self,
        predicate: impl Fn(&StoreEvent) -> bool + Send + 'static,
    ) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            predicate: Some(Box::new(predicate)),
        }
    }
}
