use renderfarm_core::{ChangeBroadcaster, ChangeEvent};
use tokio::sync::broadcast;
use tracing::trace;

/// 基于tokio广播通道的变更广播器
///
/// 没有订阅者时事件被丢弃；订阅者落后超过通道容量时会收到 `Lagged`。
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ChangeBroadcaster for ChannelBroadcaster {
    fn broadcast(&self, event: ChangeEvent) {
        let entity_id = event.entity_id();
        if self.sender.send(event).is_err() {
            trace!(entity_id = %entity_id, "没有订阅者，丢弃变更事件");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use renderfarm_core::JobUpdate;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let broadcaster = ChannelBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        let job_id = Uuid::new_v4();
        broadcaster.broadcast(ChangeEvent::Job(JobUpdate::deleted(job_id, Utc::now())));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity_id(), job_id);
    }

    #[test]
    fn test_broadcast_without_subscribers_does_not_fail() {
        let broadcaster = ChannelBroadcaster::default();
        broadcaster.broadcast(ChangeEvent::Job(JobUpdate::deleted(Uuid::new_v4(), Utc::now())));
    }
}
