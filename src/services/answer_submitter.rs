//! Local answer bookkeeping: validation, the redundant-write guard and the optimistic update.
//!
//! Functions here never touch the network; they return the [`AnswerSubmission`]
//! the session runner must send, or `None` when nothing needs to be sent.

use tracing::debug;

use crate::{
    config::AppConfig,
    dto::submission::AnswerSubmission,
    error::ServiceError,
    services::{
        phase_controller::{Effect, Outcome},
        section_navigator,
    },
    state::{
        ExamSession,
        item::{Answer, Feature, ItemId, OptionKey},
        state_machine::{BattlePhase, MockPhase, SessionPhase},
    },
};

fn ensure_answering_phase(session: &ExamSession) -> Result<(), ServiceError> {
    match session.machine.phase() {
        SessionPhase::Battle(BattlePhase::Question) | SessionPhase::MockTest(MockPhase::InProgress) => {
            Ok(())
        }
        other => Err(ServiceError::InvalidState(format!(
            "answers are not accepted while in {other:?}"
        ))),
    }
}

/// Canonicalize a raw option reference and check it belongs to `item_id`.
pub fn resolve_option(
    session: &ExamSession,
    item_id: &ItemId,
    raw: &str,
) -> Result<OptionKey, ServiceError> {
    let item = session
        .store
        .item(item_id)
        .ok_or_else(|| ServiceError::NotFound(format!("item {item_id}")))?;
    let key = OptionKey::canonical(raw)
        .ok_or_else(|| ServiceError::InvalidInput(format!("`{raw}` is not an option key")))?;
    if !item.options.is_empty() && !item.has_option(&key) {
        return Err(ServiceError::InvalidInput(format!(
            "item {item_id} has no option {key}"
        )));
    }
    Ok(key)
}

/// Record `answer` for `item_id` and return the submission to send.
///
/// Returns `Ok(None)` when the stored answer already equals `answer`.
/// `on_expiry` lets the clock's own auto-submit through an answer lock.
pub fn record(
    session: &mut ExamSession,
    config: &AppConfig,
    item_id: &ItemId,
    mut answer: Answer,
    on_expiry: bool,
) -> Result<Option<AnswerSubmission>, ServiceError> {
    ensure_answering_phase(session)?;

    let item = session
        .store
        .item(item_id)
        .ok_or_else(|| ServiceError::NotFound(format!("item {item_id}")))?;

    let is_current = session.store.current_item().is_some_and(|current| &current.id == item_id);
    if session.feature() == Feature::Battle && !is_current {
        return Err(ServiceError::InvalidState(format!(
            "item {item_id} is no longer the current item"
        )));
    }
    if session.store.answers_locked() && is_current && !on_expiry {
        return Err(ServiceError::InvalidState("answers are locked".to_string()));
    }
    if let Some(choice) = &answer.choice
        && !item.options.is_empty()
        && !item.has_option(choice)
    {
        return Err(ServiceError::InvalidInput(format!(
            "item {item_id} has no option {choice}"
        )));
    }

    if answer.choice.is_some() {
        answer.skipped = false;
    }
    if item.answer == answer {
        debug!(
            session_id = %session.store.session_id(),
            item_id = %item_id,
            "answer unchanged; skipping submission"
        );
        return Ok(None);
    }

    let remaining = session.clock.remaining();
    let allotted = allotted_secs(session, config);
    let submission = AnswerSubmission::new(
        session.store.session_id().clone(),
        session.store.participant_id().clone(),
        item,
        &answer,
        remaining,
        allotted,
    );

    if let Some(item) = session.store.item_mut(item_id) {
        item.answer = answer.clone();
    }
    if is_current {
        session.store.selected = answer.choice;
    }

    Ok(Some(submission))
}

fn allotted_secs(session: &ExamSession, config: &AppConfig) -> Option<u32> {
    match session.feature() {
        Feature::Battle => Some(config.battle.item_duration_secs),
        Feature::MockTest => config.mock_test.item_duration_secs,
    }
}

/// Change the local selection of the current item without submitting it.
pub fn select(session: &mut ExamSession, option: Option<&str>) -> Result<(), ServiceError> {
    ensure_answering_phase(session)?;
    if session.store.answers_locked() {
        return Err(ServiceError::InvalidState("answers are locked".to_string()));
    }
    let Some(current) = session.store.current_item().map(|item| item.id.clone()) else {
        return Err(ServiceError::NotFound("no current item".to_string()));
    };
    let selected = match option {
        Some(raw) => Some(resolve_option(session, &current, raw)?),
        None => None,
    };
    session.store.selected = selected;
    Ok(())
}

/// Submit the current selection (mock test: then move to the next item or the boundary).
pub fn submit_current(
    session: &mut ExamSession,
    config: &AppConfig,
) -> Result<Outcome, ServiceError> {
    let Some(item) = session.store.current_item() else {
        return Err(ServiceError::NotFound("no current item".to_string()));
    };
    let item_id = item.id.clone();
    let mut answer = item.answer.clone();
    answer.choice = session.store.selected().cloned();
    if answer.choice.is_none() {
        answer.skipped = true;
    }

    let submission = record(session, config, &item_id, answer, false)?;
    let outcome = match session.feature() {
        Feature::Battle => Outcome::applied(),
        Feature::MockTest => section_navigator::advance_item(session, config),
    };
    Ok(outcome.with_effects(submission.map(Effect::Submit)))
}
