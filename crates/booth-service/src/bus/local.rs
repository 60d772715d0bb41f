//! In-process [`EventBus`] on a tokio broadcast channel.
//!
//! Registries that share one `LocalBus` (and one `MemoryStore`) see each
//! other's events exactly as separate processes sharing Redis would.

use super::{BusMessage, EventBus};
use crate::errors::BoothError;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Capacity of the fan-out channel. Slow subscribers past this lag.
pub const LOCAL_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { sender }
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BoothError> {
        // No subscribers is not an error; nobody is listening yet.
        let _ = self.sender.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::ServerAction;

    #[tokio::test]
    async fn test_every_subscriber_receives_each_message() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish_action(ServerAction::GuestCount { count: 3 })
            .await
            .unwrap();

        for rx in [&mut a, &mut b] {
            assert_eq!(
                rx.recv().await.unwrap(),
                BusMessage::Action(ServerAction::GuestCount { count: 3 })
            );
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = LocalBus::new();
        assert!(bus
            .publish_action(ServerAction::WaitlistUpdate { waitlist: vec![] })
            .await
            .is_ok());
    }
}
