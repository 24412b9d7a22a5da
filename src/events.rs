use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Device,
    Group,
}

/// Change notification emitted after a committed graph mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub event_id: Uuid,
    pub object_id: String,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub event: EventKind,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
}

impl ChangeEvent {
    pub fn new(object_type: ObjectType, object_id: &str, event: EventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            object_id: object_id.to_string(),
            object_type,
            event,
            time: Utc::now(),
            payload: None,
            attributes: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = Some(attributes);
        self
    }
}

/// Event sink boundary. Fire-and-forget from the services' perspective.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn fire(&self, event: ChangeEvent) -> Result<()>;
}

/// Emits and swallows failures. An event sink outage must never corrupt the
/// already-committed graph mutation.
pub async fn fire_and_log(emitter: &dyn EventEmitter, event: ChangeEvent) {
    let object_id = event.object_id.clone();
    let kind = event.event;
    if let Err(err) = emitter.fire(event).await {
        tracing::warn!(object_id = %object_id, event = ?kind, error = %err.source, "event emission failed");
    }
}

/// Collects fired events in memory. Test double and embedded default.
#[derive(Default, Clone)]
pub struct CollectingEmitter {
    events: Arc<RwLock<Vec<ChangeEvent>>>,
}

impl CollectingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventEmitter for CollectingEmitter {
    async fn fire(&self, event: ChangeEvent) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}
