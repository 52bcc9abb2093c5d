use serde::Serialize;
use tracing::warn;

use crate::{
    dto::{
        session::SessionView,
        sse::{Handshake, ServerEvent, SessionClosedEvent},
    },
    state::{SseHub, item::SessionId},
};

const EVENT_SESSION: &str = "session";
const EVENT_SESSION_CLOSED: &str = "session.closed";
const EVENT_HANDSHAKE: &str = "handshake";

/// Push the latest session snapshot to every renderer of the session.
pub fn broadcast_session_view(hub: &SseHub, view: &SessionView) {
    send_session_event(hub, EVENT_SESSION, view);
}

/// Tell renderers the session runner stopped.
pub fn broadcast_session_closed(hub: &SseHub, session_id: &SessionId, reason: &str) {
    let payload = SessionClosedEvent {
        session_id: session_id.to_string(),
        reason: reason.to_string(),
    };
    send_session_event(hub, EVENT_SESSION_CLOSED, &payload);
}

/// First event of a renderer stream.
pub fn handshake_event(session_id: &SessionId) -> Option<ServerEvent> {
    let payload = Handshake {
        session_id: session_id.to_string(),
        message: "subscribed to session updates".to_string(),
    };
    build_event(EVENT_HANDSHAKE, &payload)
}

/// Snapshot event for a renderer that just connected.
pub fn session_view_event(view: &SessionView) -> Option<ServerEvent> {
    build_event(EVENT_SESSION, view)
}

fn build_event(event: &str, payload: &impl Serialize) -> Option<ServerEvent> {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(event, error = %err, "failed to serialize session SSE payload");
            None
        }
    }
}

fn send_session_event(hub: &SseHub, event: &str, payload: &impl Serialize) {
    if let Some(event) = build_event(event, payload) {
        hub.broadcast(event);
    }
}
