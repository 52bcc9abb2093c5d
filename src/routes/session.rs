use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::session::{
        AnswerRequest, BoundaryRequest, EnterSessionRequest, JumpRequest, SelectRequest,
        SessionView,
    },
    error::AppError,
    services::session_service,
    state::{
        SharedState,
        item::{ItemId, ParticipantId, SessionId},
    },
};

/// Routes driving a participant's session.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/leave", post(leave_session))
        .route("/sessions/{id}/enter", post(enter_session))
        .route("/sessions/{id}/answer", post(answer))
        .route("/sessions/{id}/select", post(select))
        .route("/sessions/{id}/submit-current", post(submit_current))
        .route("/sessions/{id}/boundary", post(boundary))
        .route("/sessions/{id}/jump", post(jump))
}

/// Enter a session, restoring its state and joining its live channel.
#[utoipa::path(
    post,
    path = "/sessions/{id}/enter",
    tag = "session",
    params(("id" = String, Path, description = "Session identifier")),
    request_body = EnterSessionRequest,
    responses(
        (status = 200, description = "Session entered", body = SessionView),
        (status = 400, description = "Invalid request")
    )
)]
pub async fn enter_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Valid(Json(payload)): Valid<Json<EnterSessionRequest>>,
) -> Result<Json<SessionView>, AppError> {
    let view = session_service::enter_session(
        &state,
        SessionId(id),
        ParticipantId(payload.participant_id),
        payload.feature,
    )
    .await?;
    Ok(Json(view))
}

/// Latest snapshot of an entered session.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    tag = "session",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Current session view", body = SessionView),
        (status = 404, description = "Session not entered")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let view = session_service::current_view(&state, &SessionId(id))?;
    Ok(Json(view))
}

/// Leave a session and release its channel subscription.
#[utoipa::path(
    post,
    path = "/sessions/{id}/leave",
    tag = "session",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 204, description = "Session left"),
        (status = 404, description = "Session not entered")
    )
)]
pub async fn leave_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    session_service::leave_session(&state, &SessionId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Record and submit an answer for an item.
#[utoipa::path(
    post,
    path = "/sessions/{id}/answer",
    tag = "session",
    params(("id" = String, Path, description = "Session identifier")),
    request_body = AnswerRequest,
    responses(
        (status = 200, description = "Answer recorded", body = SessionView),
        (status = 400, description = "Unknown item or option"),
        (status = 409, description = "Answers are locked")
    )
)]
pub async fn answer(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Valid(Json(payload)): Valid<Json<AnswerRequest>>,
) -> Result<Json<SessionView>, AppError> {
    let view = session_service::answer(
        &state,
        &SessionId(id),
        ItemId(payload.item_id),
        payload.option,
        payload.skipped,
        payload.marked_for_review,
    )
    .await?;
    Ok(Json(view))
}

/// Change the local selection of the current item without submitting it.
#[utoipa::path(
    post,
    path = "/sessions/{id}/select",
    tag = "session",
    params(("id" = String, Path, description = "Session identifier")),
    request_body = SelectRequest,
    responses(
        (status = 200, description = "Selection updated", body = SessionView),
        (status = 409, description = "Answers are locked")
    )
)]
pub async fn select(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Valid(Json(payload)): Valid<Json<SelectRequest>>,
) -> Result<Json<SessionView>, AppError> {
    let view = session_service::select(&state, &SessionId(id), payload.option).await?;
    Ok(Json(view))
}

/// Submit the current selection (or a skip) for the current item.
#[utoipa::path(
    post,
    path = "/sessions/{id}/submit-current",
    tag = "session",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Current item submitted", body = SessionView),
        (status = 409, description = "Answers are locked")
    )
)]
pub async fn submit_current(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let view = session_service::submit_current(&state, &SessionId(id)).await?;
    Ok(Json(view))
}

/// Choose between review, advance and finish at a section boundary.
#[utoipa::path(
    post,
    path = "/sessions/{id}/boundary",
    tag = "session",
    params(("id" = String, Path, description = "Session identifier")),
    request_body = BoundaryRequest,
    responses(
        (status = 200, description = "Choice applied", body = SessionView),
        (status = 409, description = "Not at a section boundary")
    )
)]
pub async fn boundary(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Valid(Json(payload)): Valid<Json<BoundaryRequest>>,
) -> Result<Json<SessionView>, AppError> {
    let view = session_service::boundary(&state, &SessionId(id), payload.choice).await?;
    Ok(Json(view))
}

/// Navigate to an item, loading its section when it is not in the current batch.
#[utoipa::path(
    post,
    path = "/sessions/{id}/jump",
    tag = "session",
    params(("id" = String, Path, description = "Session identifier")),
    request_body = JumpRequest,
    responses(
        (status = 200, description = "Navigation applied", body = SessionView),
        (status = 409, description = "A section load is in flight")
    )
)]
pub async fn jump(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Valid(Json(payload)): Valid<Json<JumpRequest>>,
) -> Result<Json<SessionView>, AppError> {
    let view = session_service::jump(&state, &SessionId(id), ItemId(payload.item_id)).await?;
    Ok(Json(view))
}
