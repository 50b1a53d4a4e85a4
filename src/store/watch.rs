//! Change-notification fan-out for the resource store.
//!
//! Each subscriber owns an independent unbounded channel; publishing never
//! awaits a subscriber, and subscribers whose receiver has been dropped are
//! pruned on the next send. New subscriptions replay the current store
//! contents as synthetic `Added` events before any live event.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::resources::{Resource, ResourceKind};

/// What happened to a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A change event carrying the post-image (for `Deleted`, the last value).
#[derive(Clone, Debug)]
pub struct ResourceEvent<R> {
    pub event_type: EventType,
    /// `<namespace>/<name>` of the affected resource
    pub key: String,
    pub resource: R,
}

/// Per-kind subscriber registry. Senders are stored type-erased; the kind
/// keyed on guarantees the downcast.
#[derive(Default)]
pub(crate) struct WatchHub {
    senders: Mutex<HashMap<ResourceKind, Vec<Box<dyn Any + Send>>>>,
}

impl WatchHub {
    /// Register a subscriber, first delivering `replay` as `Added` events.
    /// The caller holds the store write lock, so no live event can
    /// interleave with the replay.
    pub(crate) fn subscribe<R: Resource>(&self, replay: Vec<R>) -> UnboundedReceiver<ResourceEvent<R>> {
        let (tx, rx) = mpsc::unbounded_channel();
        for resource in replay {
            let _ = tx.send(ResourceEvent {
                event_type: EventType::Added,
                key: resource.key(),
                resource,
            });
        }
        self.senders
            .lock()
            .expect("watch hub lock poisoned")
            .entry(R::KIND)
            .or_default()
            .push(Box::new(tx));
        rx
    }

    /// Deliver an event to every live subscriber of the kind.
    pub(crate) fn publish<R: Resource>(&self, event: ResourceEvent<R>) {
        let mut senders = self.senders.lock().expect("watch hub lock poisoned");
        let Some(list) = senders.get_mut(&R::KIND) else {
            return;
        };
        list.retain(|any| {
            let tx = any
                .downcast_ref::<UnboundedSender<ResourceEvent<R>>>()
                .expect("subscriber channel type matches kind");
            tx.send(event.clone()).is_ok()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Devnet, DevnetSpec};

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let hub = WatchHub::default();
        let rx = hub.subscribe::<Devnet>(Vec::new());
        drop(rx);

        let devnet = Devnet::new("d1", "default", DevnetSpec::default());
        hub.publish(ResourceEvent {
            event_type: EventType::Added,
            key: devnet.key(),
            resource: devnet,
        });

        let senders = hub.senders.lock().unwrap();
        assert!(senders.get(&ResourceKind::Devnet).unwrap().is_empty());
    }
}
