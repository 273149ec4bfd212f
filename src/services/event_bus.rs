use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::constants::EVENT_CHANNEL_CAPACITY;

/// Who an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EventTarget {
    User(Uuid),
    /// Everyone watching a battle.
    Room(Uuid),
    Global,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    pub name: &'static str,
    pub target: EventTarget,
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn new(name: &'static str, target: EventTarget, payload: serde_json::Value) -> Self {
        Self {
            name,
            target,
            payload,
        }
    }

    pub fn to_user(name: &'static str, user_id: Uuid, payload: serde_json::Value) -> Self {
        Self::new(name, EventTarget::User(user_id), payload)
    }

    pub fn to_room(name: &'static str, battle_id: Uuid, payload: serde_json::Value) -> Self {
        Self::new(name, EventTarget::Room(battle_id), payload)
    }

    pub fn global(name: &'static str, payload: serde_json::Value) -> Self {
        Self::new(name, EventTarget::Global, payload)
    }

    /// Whether a subscriber identified by `user_id` and watching `rooms`
    /// should receive this event.
    pub fn is_visible_to(&self, user_id: Option<Uuid>, rooms: &[Uuid]) -> bool {
        match &self.target {
            EventTarget::Global => true,
            EventTarget::User(id) => user_id == Some(*id),
            EventTarget::Room(id) => rooms.contains(id),
        }
    }
}

/// Fire-and-forget delivery of committed domain events.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, events: Vec<DomainEvent>);
}

/// Fans events out to websocket subscribers.
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastEventSink {
    fn dispatch(&self, events: Vec<DomainEvent>) {
        for event in events {
            tracing::debug!("Dispatching {} to {:?}", event.name, event.target);
            // No subscribers is not an error.
            let _ = self.sender.send(event);
        }
    }
}

#[cfg(test)]
pub use recording::RecordingEventSink;
