use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    dto::sse::ServerEvent,
    error::ServiceError,
    services::sse_events::{handshake_event, session_view_event},
    state::{SharedState, item::SessionId},
};

/// Subscribe to the render stream of a running session.
///
/// Returns the receiver together with the events a new renderer gets first:
/// the handshake and the current snapshot.
pub fn subscribe_session(
    state: &SharedState,
    session_id: &SessionId,
) -> Result<(broadcast::Receiver<ServerEvent>, Vec<ServerEvent>), ServiceError> {
    let view = state
        .sessions()
        .get(session_id)
        .filter(|handle| handle.is_alive())
        .map(|handle| handle.view.borrow().clone())
        .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))?;

    let receiver = state.session_sse(session_id).subscribe();
    let initial = handshake_event(session_id)
        .into_iter()
        .chain(session_view_event(&view))
        .collect();
    Ok((receiver, initial))
}

/// Convert a broadcast receiver into an SSE response, forwarding events until
/// the renderer disconnects or the session hub is dropped.
pub fn to_sse_stream(
    mut receiver: broadcast::Receiver<ServerEvent>,
    initial: Vec<ServerEvent>,
    session_id: SessionId,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        for payload in initial {
            if tx.send(Ok(to_event(payload))).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            if tx.send(Ok(to_event(payload))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            // The next snapshot supersedes whatever was skipped.
                            tracing::debug!(session_id = %session_id, skipped, "renderer lagged behind");
                            continue;
                        }
                    }
                }
            }
        }

        tracing::info!(session_id = %session_id, "session SSE stream disconnected");
    });

    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn to_event(payload: ServerEvent) -> Event {
    let mut event = Event::default().data(payload.data);
    if let Some(name) = payload.event {
        event = event.event(name);
    }
    event
}
