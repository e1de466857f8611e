//! Inbound observer updates, queued by the host and drained once per tick.

use glam::Vec3;
use streamer_common::{ObserverId, WorldPartition};
use tokio::sync::mpsc;

/// One movement or presence change of an observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverUpdate {
    pub id: ObserverId,
    pub position: Vec3,
    pub partition: WorldPartition,
    /// `false` when the observer left; it is dropped from the index.
    pub active: bool,
}

/// Source of observer updates consumed at the start of every tick.
pub trait ObserverSource: Send {
    /// Take every update queued since the previous call, oldest first.
    fn drain(&mut self) -> Vec<ObserverUpdate>;
}

/// Sending half handed to host callbacks. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ObserverFeed {
    tx: mpsc::UnboundedSender<ObserverUpdate>,
}

impl ObserverFeed {
    /// Queue a position update. Returns `false` once the streamer is gone.
    pub fn moved(&self, id: ObserverId, position: Vec3, partition: WorldPartition) -> bool {
        self.tx
            .send(ObserverUpdate {
                id,
                position,
                partition,
                active: true,
            })
            .is_ok()
    }

    /// Queue the departure of an observer.
    pub fn left(&self, id: ObserverId) -> bool {
        self.tx
            .send(ObserverUpdate {
                id,
                position: Vec3::ZERO,
                partition: WorldPartition::MAIN,
                active: false,
            })
            .is_ok()
    }
}

/// Receiving half, owned by a streamer.
#[derive(Debug)]
pub struct ChannelObserverSource {
    rx: mpsc::UnboundedReceiver<ObserverUpdate>,
}

impl ObserverSource for ChannelObserverSource {
    fn drain(&mut self) -> Vec<ObserverUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = self.rx.try_recv() {
            updates.push(update);
        }
        updates
    }
}

/// Create a connected feed/source pair.
pub fn observer_channel() -> (ObserverFeed, ChannelObserverSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ObserverFeed { tx }, ChannelObserverSource { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_updates_in_order() {
        let (feed, mut source) = observer_channel();
        feed.moved(ObserverId(1), Vec3::X, WorldPartition::MAIN);
        feed.moved(ObserverId(1), Vec3::Y, WorldPartition::MAIN);
        feed.left(ObserverId(1));

        let updates = source.drain();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].position, Vec3::X);
        assert_eq!(updates[1].position, Vec3::Y);
        assert!(!updates[2].active);
        assert!(source.drain().is_empty());
    }

    #[test]
    fn feed_reports_closed_source() {
        let (feed, source) = observer_channel();
        drop(source);
        assert!(!feed.moved(ObserverId(1), Vec3::ZERO, WorldPartition::MAIN));
    }
}
