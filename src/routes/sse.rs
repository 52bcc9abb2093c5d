use std::convert::Infallible;

use axum::{
    Router,
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
};
use futures::Stream;
use tracing::info;

use crate::{
    error::AppError,
    services::sse_service,
    state::{SharedState, item::SessionId},
};

#[utoipa::path(
    get,
    path = "/sessions/{id}/events",
    tag = "sse",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session render stream", content_type = "text/event-stream", body = String),
        (status = 404, description = "Session not entered")
    )
)]
/// Stream session snapshots to a renderer.
pub async fn session_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session_id = SessionId(id);
    let (receiver, initial) = sse_service::subscribe_session(&state, &session_id)?;
    info!(session_id = %session_id, "New session SSE connection");
    Ok(sse_service::to_sse_stream(receiver, initial, session_id))
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sessions/{id}/events", get(session_stream))
}
