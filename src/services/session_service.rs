//! Entry points of the render bridge: enter a session, forward participant
//! commands to its runner and leave it again.

use tokio::{
    sync::{mpsc, oneshot, watch},
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    dto::session::{BoundaryChoice, SessionView},
    error::ServiceError,
    services::session_runner::{CommandReply, RunnerChannels, SessionCommand, SessionRunner},
    state::{
        DEFAULT_TRANSITION_TIMEOUT, ExamSession, SessionHandle, SharedState,
        item::{Feature, ItemId, ParticipantId, SessionId},
    },
};

const COMMAND_BUFFER: usize = 32;

/// Enter `session_id` as `participant_id`.
///
/// A running entry for the same participant and feature is reused. Any other
/// entry is left first, so at most one runner exists per session.
pub async fn enter_session(
    state: &SharedState,
    session_id: SessionId,
    participant_id: ParticipantId,
    feature: Feature,
) -> Result<SessionView, ServiceError> {
    let existing = state.sessions().get(&session_id).map(|handle| handle.clone());
    if let Some(handle) = existing {
        if handle.is_alive()
            && handle.participant_id == participant_id
            && handle.feature == feature
        {
            info!(session_id = %session_id, generation = %handle.generation, "session already entered");
            return Ok(handle.view.borrow().clone());
        }
        leave_handle(&handle).await;
    }

    let generation = state.next_generation();
    let session = ExamSession::new(session_id.clone(), participant_id.clone(), feature, generation);
    let initial_view = SessionView::from_session(&session);

    let (delivery_tx, delivery_rx) = mpsc::channel(state.config().channel.buffer);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (view_tx, view_rx) = watch::channel(initial_view.clone());

    state.sessions().insert(
        session_id.clone(),
        SessionHandle {
            generation,
            participant_id: participant_id.clone(),
            feature,
            commands: command_tx,
            view: view_rx,
        },
    );

    // Subscribe before the restore fetch starts so no live event is missed.
    let reused = state
        .channels()
        .subscribe(&session_id.to_string(), generation, delivery_tx);

    let runner = SessionRunner::new(
        state.clone(),
        session,
        RunnerChannels {
            deliveries: delivery_rx,
            commands: command_rx,
            view: view_tx,
        },
    );
    tokio::spawn(runner.run());

    info!(
        session_id = %session_id,
        participant_id = %participant_id,
        %generation,
        ?feature,
        reused_channel = reused,
        "entered session"
    );
    Ok(initial_view)
}

/// Latest snapshot of a running session.
pub fn current_view(state: &SharedState, session_id: &SessionId) -> Result<SessionView, ServiceError> {
    state
        .sessions()
        .get(session_id)
        .filter(|handle| handle.is_alive())
        .map(|handle| handle.view.borrow().clone())
        .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))
}

/// Leave a session, stopping its runner and releasing its channel.
pub async fn leave_session(state: &SharedState, session_id: &SessionId) -> Result<(), ServiceError> {
    let handle = state
        .sessions()
        .get(session_id)
        .map(|handle| handle.clone())
        .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))?;
    leave_handle(&handle).await;
    Ok(())
}

async fn leave_handle(handle: &SessionHandle) {
    let (reply, done) = oneshot::channel();
    if handle.commands.send(SessionCommand::Leave { reply }).await.is_err() {
        return;
    }
    if timeout(DEFAULT_TRANSITION_TIMEOUT, done).await.is_err() {
        warn!(generation = %handle.generation, "session runner did not confirm leave in time");
    }
}

/// Record and submit an answer for an item.
pub async fn answer(
    state: &SharedState,
    session_id: &SessionId,
    item_id: ItemId,
    option: Option<String>,
    skipped: bool,
    marked_for_review: bool,
) -> Result<SessionView, ServiceError> {
    send(state, session_id, |reply| SessionCommand::Answer {
        item_id,
        option,
        skipped,
        marked_for_review,
        reply,
    })
    .await
}

/// Change the local selection of the current item.
pub async fn select(
    state: &SharedState,
    session_id: &SessionId,
    option: Option<String>,
) -> Result<SessionView, ServiceError> {
    send(state, session_id, |reply| SessionCommand::Select { option, reply }).await
}

/// Submit the current selection, or a skip when there is none.
pub async fn submit_current(state: &SharedState, session_id: &SessionId) -> Result<SessionView, ServiceError> {
    send(state, session_id, |reply| SessionCommand::SubmitCurrent { reply }).await
}

/// Apply a review, advance or finish choice at a section boundary.
pub async fn boundary(
    state: &SharedState,
    session_id: &SessionId,
    choice: BoundaryChoice,
) -> Result<SessionView, ServiceError> {
    send(state, session_id, |reply| SessionCommand::Boundary { choice, reply }).await
}

/// Navigate to an item, loading its section when needed.
pub async fn jump(state: &SharedState, session_id: &SessionId, item_id: ItemId) -> Result<SessionView, ServiceError> {
    send(state, session_id, |reply| SessionCommand::Jump { item_id, reply }).await
}

/// Deliver a command to the session runner and wait for its reply.
async fn send(
    state: &SharedState,
    session_id: &SessionId,
    command: impl FnOnce(CommandReply) -> SessionCommand,
) -> Result<SessionView, ServiceError> {
    let commands = state
        .sessions()
        .get(session_id)
        .map(|handle| handle.commands.clone())
        .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))?;

    let (reply, response) = oneshot::channel();
    commands
        .send(command(reply))
        .await
        .map_err(|_| ServiceError::SessionClosed)?;

    match timeout(DEFAULT_TRANSITION_TIMEOUT, response).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ServiceError::SessionClosed),
        Err(_) => Err(ServiceError::Timeout),
    }
}
