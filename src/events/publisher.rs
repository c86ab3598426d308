use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Broadcast publisher for batch and unit lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<LifecycleEvent>,
}

/// A lifecycle milestone of one batch, optionally scoped to one of its units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub name: String,
    pub batch_uuid: Uuid,
    pub image_unit_uuid: Option<Uuid>,
    pub context: Value,
    pub published_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn batch(name: impl Into<String>, batch_uuid: Uuid, context: Value) -> Self {
        Self {
            name: name.into(),
            batch_uuid,
            image_unit_uuid: None,
            context,
            published_at: Utc::now(),
        }
    }

    pub fn unit(
        name: impl Into<String>,
        batch_uuid: Uuid,
        image_unit_uuid: Uuid,
        context: Value,
    ) -> Self {
        Self {
            image_unit_uuid: Some(image_unit_uuid),
            ..Self::batch(name, batch_uuid, context)
        }
    }
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
