//! Best-effort fan-out of task updates to any listening websocket/SSE
//! connections. Modeled on the `broadcast::Sender` used standalone for
//! fan-out elsewhere in this workspace — failures here are never allowed to
//! fail the request that triggered them (§4.7, §7).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::model::Event;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: Uuid,
    pub event: Event,
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<TaskUpdate>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.tx.subscribe()
    }

    /// Publishes an update. No listeners, or a lagging receiver, is not an
    /// error condition for the caller: it's logged and swallowed.
    pub fn publish(&self, update: TaskUpdate) {
        if let Err(err) = self.tx.send(update) {
            warn!(error = %err, "broadcast had no active listeners, dropping");
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventCode;
    use chrono::Utc;

    #[tokio::test]
    async fn publish_without_listeners_does_not_panic() {
        let b = Broadcaster::default();
        b.publish(TaskUpdate {
            task_id: Uuid::new_v4(),
            event: Event {
                code: EventCode::Started,
                timestamp: Utc::now(),
                payload: serde_json::Value::Null,
            },
        });
    }

    #[tokio::test]
    async fn subscriber_receives_published_update() {
        let b = Broadcaster::default();
        let mut rx = b.subscribe();
        let task_id = Uuid::new_v4();
        b.publish(TaskUpdate {
            task_id,
            event: Event {
                code: EventCode::Started,
                timestamp: Utc::now(),
                payload: serde_json::Value::Null,
            },
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.task_id, task_id);
    }
}
