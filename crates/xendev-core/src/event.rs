//! Lifecycle notifications for external collaborators.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::device::{DeviceClass, DeviceId};

/// Console and device lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A console started listening.
    ConsoleCreated { console: u32, domid: u32, port: u16 },
    /// A terminal attached to a console.
    ConsoleConnected { console: u32, addr: SocketAddr },
    /// The attached terminal went away.
    ConsoleDisconnected { console: u32, addr: SocketAddr },
    /// A console lost its channel and was torn down.
    ConsoleClosed { console: u32 },
    /// Device descriptors were published.
    DeviceCreated {
        domid: u32,
        class: DeviceClass,
        devid: DeviceId,
    },
    /// Device descriptors were removed.
    DeviceDestroyed {
        domid: u32,
        class: DeviceClass,
        devid: DeviceId,
    },
}

/// Event bus for lifecycle notifications.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new event bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Publishes an event.
    pub fn publish(&self, event: Event) {
        tracing::trace!(?event, "publishing event");
        let _ = self.sender.send(event);
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::ConsoleClosed { console: 4 });
        assert_eq!(rx.recv().await.unwrap(), Event::ConsoleClosed { console: 4 });
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(Event::DeviceCreated {
            domid: 1,
            class: DeviceClass::Vif,
            devid: DeviceId::new(0),
        });
    }
}
