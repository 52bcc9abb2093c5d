use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::{dto::sse::ServerEvent, state::item::SessionId};

/// Per-session render hubs carved out from [`super::AppState`].
pub struct SseState {
    hubs: DashMap<SessionId, Arc<SseHub>>,
    capacity: usize,
}

impl SseState {
    /// Build the SSE sub-tree with the given per-hub channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            hubs: DashMap::new(),
            capacity,
        }
    }

    /// Hub of `session_id`, created on first use.
    pub fn hub(&self, session_id: &SessionId) -> Arc<SseHub> {
        self.hubs
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SseHub::new(self.capacity)))
            .clone()
    }

    /// Forget the hub of a session that is gone; live subscribers keep their receivers.
    pub fn remove(&self, session_id: &SessionId) {
        self.hubs.remove(session_id);
    }
}

/// Simple broadcast hub wrapper used by the SSE services.
pub struct SseHub {
    sender: broadcast::Sender<ServerEvent>,
}

impl SseHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}
