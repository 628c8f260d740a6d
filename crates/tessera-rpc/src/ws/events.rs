use serde::Serialize;
use tessera_consensus::{BlockCommittedEvent, BlockEventSink, EngineStatus};
use tokio::sync::broadcast;
use tracing::debug;

/// WebSocket event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsEvent {
    BlockCommitted {
        height: u64,
        hash: String,
        view: u64,
        proposer: String,
        tx_count: usize,
        state_root: String,
        commit_qc_view: u64,
        timestamp: u64,
    },
    /// The local engine moved to a new view
    ViewChanged {
        view: u64,
        round: u64,
        epoch: u64,
        leader: String,
        committed_height: u64,
        consecutive_timeouts: u32,
    },
}

impl WsEvent {
    pub fn block_committed(event: &BlockCommittedEvent) -> Self {
        WsEvent::BlockCommitted {
            height: event.height,
            hash: event.block_hash.to_hex(),
            view: event.view,
            proposer: event.proposer.to_hex(),
            tx_count: event.tx_count,
            state_root: event.state_root.to_hex(),
            commit_qc_view: event.commit_qc_view,
            timestamp: event.timestamp,
        }
    }

    pub fn view_changed(status: &EngineStatus) -> Self {
        WsEvent::ViewChanged {
            view: status.view,
            round: status.round,
            epoch: status.epoch,
            leader: status.leader.to_hex(),
            committed_height: status.committed_height,
            consecutive_timeouts: status.consecutive_timeouts,
        }
    }
}

/// Event broadcaster for WebSocket clients
pub struct EventBroadcaster {
    sender: broadcast::Sender<WsEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBroadcaster { sender }
    }

    /// Broadcast an event to all connected clients
    pub fn broadcast(&self, event: WsEvent) {
        match self.sender.send(event) {
            Ok(count) => {
                debug!("Broadcast event to {} clients", count);
            }
            Err(_) => {
                // No receivers
            }
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl BlockEventSink for EventBroadcaster {
    fn publish(&self, event: &BlockCommittedEvent) {
        self.broadcast(WsEvent::block_committed(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{hash_blake3, KeyPair};

    fn committed_event(height: u64) -> BlockCommittedEvent {
        BlockCommittedEvent {
            height,
            block_hash: hash_blake3(b"block"),
            view: height + 2,
            proposer: KeyPair::from_seed(1).public,
            tx_count: 5,
            state_root: hash_blake3(b"state"),
            commit_qc_view: height + 4,
            timestamp: 1000,
        }
    }

    #[tokio::test]
    async fn test_sink_publishes_to_subscribers() {
        let broadcaster = EventBroadcaster::new(100);
        let mut rx = broadcaster.subscribe();

        broadcaster.publish(&committed_event(1));

        let received = rx.recv().await.unwrap();
        match received {
            WsEvent::BlockCommitted { height, tx_count, view, .. } => {
                assert_eq!(height, 1);
                assert_eq!(tx_count, 5);
                assert_eq!(view, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let broadcaster = EventBroadcaster::new(100);
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();

        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.publish(&committed_event(7));

        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = EventBroadcaster::default();
        broadcaster.publish(&committed_event(2));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(WsEvent::block_committed(&committed_event(4))).unwrap();
        assert_eq!(json["type"], "BlockCommitted");
        assert_eq!(json["data"]["height"], 4);
        assert_eq!(json["data"]["hash"], hash_blake3(b"block").to_hex());
    }
}
