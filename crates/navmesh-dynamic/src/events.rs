//! Notifications sent by the navigation mesh

use std::sync::mpsc::{channel, Receiver, Sender};

use glam::{IVec2, Vec3};
use navmesh_common::BoundingBox;
use navmesh_tilecache::ObstacleRef;

#[derive(Debug, Clone, PartialEq)]
pub enum NavigationEvent {
    /// The whole mesh was allocated or rebuilt
    NavigationMeshRebuilt,
    /// The layers of one tile were rebuilt
    AreaRebuilt { bounds: BoundingBox },
    TileAdded { tile: IVec2 },
    TileRemoved { tile: IVec2 },
    AllTilesRemoved,
    ObstacleAdded {
        node_id: u32,
        obstacle: ObstacleRef,
        position: Vec3,
        radius: f32,
        height: f32,
    },
    ObstacleRemoved {
        node_id: u32,
        obstacle: ObstacleRef,
        position: Vec3,
        radius: f32,
        height: f32,
    },
}

/// Fans events out to every subscriber.
///
/// Subscribers whose receiver was dropped are forgotten on the next send.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Vec<Sender<NavigationEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<NavigationEvent> {
        let (sender, receiver) = channel();
        self.subscribers.push(sender);
        receiver
    }

    pub fn send(&mut self, event: NavigationEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives_events() {
        let mut bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.send(NavigationEvent::TileAdded {
            tile: IVec2::new(1, 2),
        });
        for receiver in [&a, &b] {
            assert_eq!(
                receiver.try_recv().unwrap(),
                NavigationEvent::TileAdded {
                    tile: IVec2::new(1, 2)
                }
            );
        }
    }

    #[test]
    fn test_disconnected_subscribers_are_dropped() {
        let mut bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);
        bus.send(NavigationEvent::AllTilesRemoved);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), NavigationEvent::AllTilesRemoved);
    }
}
