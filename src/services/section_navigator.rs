//! Mock-test navigation: moving through a section, the boundary choice, jumps and completion.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    config::AppConfig,
    dao::authority::{Authority, AuthorityResult},
    dto::section::{SectionBatch, SectionOutcome, SectionRequest, SectionTarget},
    error::ServiceError,
    services::{
        backoff::Backoff,
        phase_controller::{Effect, Outcome, SectionPurpose},
    },
    state::{
        ExamSession, PlanId, Resume,
        item::{Feature, ItemId, ParticipantId, SessionId},
        state_machine::{MockPhase, PhaseEvent, SessionPhase},
    },
};

fn ensure_mock(session: &ExamSession) -> Result<(), ServiceError> {
    if session.feature() == Feature::MockTest {
        Ok(())
    } else {
        Err(ServiceError::InvalidState(
            "section navigation is only available in mock tests".to_string(),
        ))
    }
}

fn ensure_no_load_in_flight(session: &ExamSession) -> Result<(), ServiceError> {
    if session.section_loading || session.machine.has_pending() {
        return Err(ServiceError::InvalidState(
            "a section load is already in progress".to_string(),
        ));
    }
    Ok(())
}

/// Build the load effect for `target` and mark a load as in flight.
pub fn load_section(
    session: &mut ExamSession,
    target: SectionTarget,
    purpose: SectionPurpose,
    plan: Option<PlanId>,
) -> Effect {
    session.section_loading = true;
    Effect::LoadSection {
        request: SectionRequest {
            participant_id: session.store.participant_id().clone(),
            target,
            remaining_secs: session.clock.remaining(),
        },
        purpose,
        plan,
    }
}

/// Move to the next item of the section, or to the section end after the last one.
pub fn advance_item(session: &mut ExamSession, config: &AppConfig) -> Outcome {
    if session.machine.phase() != SessionPhase::MockTest(MockPhase::InProgress) {
        return Outcome::dropped();
    }
    if session.store.at_last_item() {
        return reach_section_end(session);
    }

    let next = session.store.current_position().map_or(0, |position| position + 1);
    session.store.move_to(next);
    match config.mock_test.item_duration_secs {
        Some(seconds) => {
            session.clock.arm(seconds);
            session.store.answers_locked = false;
        }
        None => session.store.answers_locked = session.clock.has_expired(),
    }
    Outcome::applied()
}

/// The last item of the section was left: the boundary, or completion after the final section.
pub fn reach_section_end(session: &mut ExamSession) -> Outcome {
    if session.store.section().is_some_and(|section| section.is_last()) {
        return complete(session);
    }

    if let Err(err) = session.machine.transition(PhaseEvent::SectionEndReached) {
        debug!(
            session_id = %session.store.session_id(),
            error = ?err,
            "section end rejected by phase machine"
        );
        return Outcome::dropped();
    }
    if session.clock.has_expired() {
        session.store.answers_locked = true;
    }
    info!(
        session_id = %session.store.session_id(),
        section = ?session.store.section().map(|section| section.id.as_str()),
        "reached section boundary"
    );
    Outcome::applied()
}

/// Mark the attempt completed and request finalization, once.
pub fn complete(session: &mut ExamSession) -> Outcome {
    let event = if session.machine.phase() == SessionPhase::Awaiting {
        PhaseEvent::SessionEnd
    } else {
        PhaseEvent::Finish
    };
    if let Err(err) = session.machine.transition(event) {
        debug!(
            session_id = %session.store.session_id(),
            error = ?err,
            "completion rejected by phase machine"
        );
        return Outcome::dropped();
    }

    session.store.answers_locked = true;
    session.clock.disarm();
    info!(session_id = %session.store.session_id(), "attempt completed");

    if session.store.finalize_requested {
        return Outcome::applied();
    }
    session.store.finalize_requested = true;
    Outcome::applied().with_effect(Effect::Finalize)
}

/// Return from the boundary to the first item of the section.
pub fn review(session: &mut ExamSession) -> Result<Outcome, ServiceError> {
    ensure_mock(session)?;
    ensure_no_load_in_flight(session)?;
    session.machine.transition(PhaseEvent::ReviewSection)?;
    session.store.move_to(0);
    session.store.answers_locked = session.clock.has_expired();
    Ok(Outcome::applied())
}

/// Confirm the boundary: load the next section, or complete after the final one.
pub fn request_advance(session: &mut ExamSession) -> Result<Outcome, ServiceError> {
    ensure_mock(session)?;
    ensure_no_load_in_flight(session)?;
    let phase = session.machine.phase();
    if phase != SessionPhase::MockTest(MockPhase::SectionBoundary) {
        return Err(ServiceError::InvalidState(format!(
            "cannot advance while in {phase:?}"
        )));
    }
    if session.store.section().is_some_and(|section| section.is_last()) {
        return Ok(complete(session));
    }

    let plan = session.machine.plan(PhaseEvent::AdvanceSection)?;
    let effect = load_section(
        session,
        SectionTarget::Next,
        SectionPurpose::Advance,
        Some(plan.id),
    );
    Ok(Outcome::applied().with_effect(effect))
}

/// Finish the attempt from the section or its boundary.
pub fn finish(session: &mut ExamSession) -> Result<Outcome, ServiceError> {
    ensure_mock(session)?;
    ensure_no_load_in_flight(session)?;
    let phase = session.machine.phase();
    if !matches!(
        phase,
        SessionPhase::MockTest(MockPhase::InProgress | MockPhase::SectionBoundary)
    ) {
        return Err(ServiceError::InvalidState(format!(
            "cannot finish while in {phase:?}"
        )));
    }
    Ok(complete(session))
}

/// Show `item_id`, loading the batch that contains it when it is not in the current one.
pub fn jump(
    session: &mut ExamSession,
    config: &AppConfig,
    item_id: ItemId,
) -> Result<Outcome, ServiceError> {
    ensure_mock(session)?;
    ensure_no_load_in_flight(session)?;

    match session.machine.phase() {
        SessionPhase::MockTest(MockPhase::InProgress) => {}
        SessionPhase::MockTest(MockPhase::SectionBoundary) => {
            session.machine.transition(PhaseEvent::ReviewSection)?;
        }
        other => {
            return Err(ServiceError::InvalidState(format!(
                "cannot jump while in {other:?}"
            )));
        }
    }

    let Some(position) = session.store.position_of(&item_id) else {
        let effect = load_section(
            session,
            SectionTarget::Item(item_id),
            SectionPurpose::Jump,
            None,
        );
        return Ok(Outcome::applied().with_effect(effect));
    };

    session.store.move_to(position);
    match config.mock_test.item_duration_secs {
        Some(seconds) => {
            session.clock.arm(seconds);
            session.store.answers_locked = false;
        }
        None => session.store.answers_locked = session.clock.has_expired(),
    }
    Ok(Outcome::applied())
}

/// Apply the result of a section load issued for `request`.
pub fn on_section_loaded(
    session: &mut ExamSession,
    config: &AppConfig,
    request: &SectionRequest,
    purpose: SectionPurpose,
    plan: Option<PlanId>,
    result: AuthorityResult<Option<Value>>,
) -> Outcome {
    session.section_loading = false;

    if session.machine.phase().is_terminal() {
        debug!(
            session_id = %session.store.session_id(),
            ?purpose,
            "session already ended; dropping section result"
        );
        return Outcome::dropped();
    }

    let body = match result {
        Ok(body) => body,
        Err(err) => {
            warn!(
                session_id = %session.store.session_id(),
                ?purpose,
                error = %err,
                "section load failed; keeping the current phase"
            );
            abort_plan(session, plan);
            return Outcome::dropped();
        }
    };

    let batch = match SectionOutcome::from_body(body.as_ref(), session.store.session_id()) {
        Ok(SectionOutcome::Batch(batch)) => batch,
        Ok(SectionOutcome::NoMoreSections) => {
            info!(
                session_id = %session.store.session_id(),
                ?purpose,
                "authority has no more sections"
            );
            abort_plan(session, plan);
            return complete(session);
        }
        Err(err) => {
            warn!(
                session_id = %session.store.session_id(),
                ?purpose,
                error = %err,
                "malformed section response; keeping the current phase"
            );
            abort_plan(session, plan);
            return Outcome::dropped();
        }
    };

    let transition = match plan {
        Some(plan_id) => session.machine.apply(plan_id).map_err(ServiceError::from),
        None => session
            .machine
            .transition(PhaseEvent::SectionLoaded)
            .map_err(ServiceError::from),
    };
    if let Err(err) = transition {
        debug!(
            session_id = %session.store.session_id(),
            ?purpose,
            error = %err,
            "section batch no longer applicable; dropping"
        );
        return Outcome::dropped();
    }

    let resume = session.resume.take();
    install_batch(session, config, request, batch, resume);
    if resume.is_some_and(|resume| resume.at_boundary) {
        return_to_boundary(session);
    }
    Outcome::applied()
}

/// Re-enter the boundary a restored attempt was waiting at.
fn return_to_boundary(session: &mut ExamSession) {
    if let Err(err) = session.machine.transition(PhaseEvent::SectionEndReached) {
        debug!(
            session_id = %session.store.session_id(),
            error = %err,
            "restored boundary rejected by phase machine"
        );
        return;
    }
    session.store.answers_locked = session.clock.remaining() == 0;
    info!(
        session_id = %session.store.session_id(),
        "restored at section boundary"
    );
}

fn abort_plan(session: &mut ExamSession, plan: Option<PlanId>) {
    if let Some(plan_id) = plan
        && let Err(err) = session.machine.abort(plan_id)
    {
        debug!(
            session_id = %session.store.session_id(),
            error = ?err,
            "section plan already resolved"
        );
    }
}

fn install_batch(
    session: &mut ExamSession,
    config: &AppConfig,
    request: &SectionRequest,
    batch: SectionBatch,
    resume: Option<Resume>,
) {
    let SectionBatch {
        items,
        section,
        remaining,
        start_item,
    } = batch;

    let requested = match &request.target {
        SectionTarget::Item(id) => Some(id.clone()),
        SectionTarget::Next => None,
    };
    let position = start_item
        .iter()
        .chain(requested.iter())
        .find_map(|id| items.iter().position(|item| &item.id == id))
        .unwrap_or(0);

    info!(
        session_id = %session.store.session_id(),
        section = %section.id,
        items = items.len(),
        position,
        "section loaded"
    );
    session.store.load_batch(items, section, position);

    // A restored time has been counting down on the clock since the restore.
    let carried = resume
        .and_then(|resume| resume.remaining)
        .map(|_| i64::from(session.clock.remaining()));
    match config.mock_test.item_duration_secs {
        Some(seconds) => {
            session.clock.arm(seconds);
            if let Some(carried) = carried {
                session.clock.sync(carried);
            }
        }
        None => {
            session.clock.arm(config.mock_test.section_duration_secs);
            if let Some(remaining) = remaining.or(carried) {
                session.clock.sync(remaining);
            }
        }
    }
    session.store.answers_locked = session.clock.remaining() == 0;
}

/// Call "mark complete", retrying with backoff up to `max_attempts` times.
pub async fn finalize_with_retries(
    authority: Arc<dyn Authority>,
    session_id: SessionId,
    participant_id: ParticipantId,
    max_attempts: u32,
) -> AuthorityResult<()> {
    let mut backoff = Backoff::new();
    let mut attempt = 1;

    loop {
        match authority
            .mark_complete(session_id.clone(), participant_id.clone())
            .await
        {
            Ok(()) => {
                info!(session_id = %session_id, attempt, "attempt finalized");
                return Ok(());
            }
            Err(err) if attempt >= max_attempts => {
                error!(
                    session_id = %session_id,
                    attempt,
                    error = %err,
                    "exhausted finalize attempts; treating the attempt as ended"
                );
                return Err(err);
            }
            Err(err) => {
                warn!(session_id = %session_id, attempt, error = %err, "finalize attempt failed");
                attempt += 1;
                sleep(backoff.next_delay()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::future::BoxFuture;
    use serde_json::json;

    use super::*;
    use crate::{
        dao::authority::AuthorityError,
        dto::submission::AnswerSubmission,
        state::{Generation, item::OptionKey},
    };

    fn mock() -> ExamSession {
        ExamSession::new(
            SessionId::from("m1"),
            ParticipantId::from("p1"),
            Feature::MockTest,
            Generation(1),
        )
    }

    fn batch(prefix: &str, len: usize, section: u32, total: u32) -> Value {
        let items = (1..=len)
            .map(|n| json!({"id": format!("{prefix}{n}"), "question": "?", "options": ["x", "y"]}))
            .collect::<Vec<_>>();
        json!({
            "section_id": format!("sec-{section}"),
            "section_number": section,
            "total_sections": total,
            "items": items,
        })
    }

    fn loaded(session: &mut ExamSession, config: &AppConfig, body: Value) {
        let effect = load_section(session, SectionTarget::Next, SectionPurpose::Initial, None);
        let Effect::LoadSection { request, purpose, plan } = effect else {
            panic!("expected a section load");
        };
        let outcome = on_section_loaded(session, config, &request, purpose, plan, Ok(Some(body)));
        assert!(outcome.applied);
    }

    #[test]
    fn last_item_of_section_reaches_boundary_and_advance_rearms() {
        let config = AppConfig::default();
        let mut session = mock();
        loaded(&mut session, &config, batch("a", 40, 1, 2));
        assert_eq!(session.store.total_items(), 40);

        session.store.move_to(39);
        session.store.selected = Some(OptionKey("B".into()));
        session.clock.sync(12);
        let outcome = crate::services::answer_submitter::submit_current(&mut session, &config)
            .expect("submitted");
        assert_eq!(outcome.effects.len(), 1);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::SectionBoundary)
        );

        let advance = request_advance(&mut session).expect("advance planned");
        let Some(Effect::LoadSection { request, purpose, plan }) = advance.effects.into_iter().next()
        else {
            panic!("expected a section load");
        };
        assert_eq!(request.target, SectionTarget::Next);
        assert!(matches!(jump(&mut session, &config, ItemId::from("a1")), Err(ServiceError::InvalidState(_))));

        let applied = on_section_loaded(
            &mut session,
            &config,
            &request,
            purpose,
            plan,
            Ok(Some(batch("b", 40, 2, 2))),
        );
        assert!(applied.applied);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::InProgress)
        );
        assert_eq!(session.clock.remaining(), 1800);
        assert_eq!(session.store.item_index(), 1);
        assert_eq!(session.store.total_items(), 40);
        assert!(!session.store.answers_locked());
    }

    #[test]
    fn failed_advance_stays_on_boundary() {
        let config = AppConfig::default();
        let mut session = mock();
        loaded(&mut session, &config, batch("a", 2, 1, 3));
        session.store.move_to(1);
        advance_item(&mut session, &config);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::SectionBoundary)
        );

        let advance = request_advance(&mut session).expect("advance planned");
        let Some(Effect::LoadSection { request, purpose, plan }) = advance.effects.into_iter().next()
        else {
            panic!("expected a section load");
        };
        let outcome = on_section_loaded(
            &mut session,
            &config,
            &request,
            purpose,
            plan,
            Err(AuthorityError::unavailable("down".to_string(), std::io::Error::other("refused"))),
        );
        assert!(!outcome.applied);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::SectionBoundary)
        );
        assert!(!session.machine.has_pending());
        assert!(request_advance(&mut session).is_ok());
    }

    #[test]
    fn final_section_completes_and_finalizes_once() {
        let config = AppConfig::default();
        let mut session = mock();
        loaded(&mut session, &config, batch("z", 1, 3, 3));

        let outcome = advance_item(&mut session, &config);
        assert_eq!(outcome.effects, vec![Effect::Finalize]);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::Completed)
        );
        assert!(finish(&mut session).is_err());
    }

    #[test]
    fn no_more_sections_maps_to_completed() {
        let config = AppConfig::default();
        let mut session = mock();
        loaded(&mut session, &config, batch("a", 1, 1, 2));
        advance_item(&mut session, &config);

        let advance = request_advance(&mut session).expect("advance planned");
        let Some(Effect::LoadSection { request, purpose, plan }) = advance.effects.into_iter().next()
        else {
            panic!("expected a section load");
        };
        let outcome = on_section_loaded(&mut session, &config, &request, purpose, plan, Ok(None));
        assert_eq!(outcome.effects, vec![Effect::Finalize]);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::Completed)
        );
    }

    #[test]
    fn jump_within_batch_resyncs_selection_from_stored_answer() {
        let config = AppConfig::default();
        let mut session = mock();
        let mut body = batch("a", 3, 1, 2);
        body["items"][2]["user_answer"] = json!("option_b");
        loaded(&mut session, &config, body);

        session.store.selected = Some(OptionKey("A".into()));
        let outcome = jump(&mut session, &config, ItemId::from("a3")).expect("jumped");
        assert!(outcome.effects.is_empty());
        assert_eq!(session.store.item_index(), 3);
        assert_eq!(session.store.selected(), Some(&OptionKey("B".into())));

        let outcome = jump(&mut session, &config, ItemId::from("c7")).expect("load requested");
        assert!(matches!(
            outcome.effects.as_slice(),
            [Effect::LoadSection { purpose: SectionPurpose::Jump, .. }]
        ));
        assert!(session.section_loading);
    }

    #[test]
    fn review_returns_to_first_item() {
        let config = AppConfig::default();
        let mut session = mock();
        loaded(&mut session, &config, batch("a", 2, 1, 2));
        advance_item(&mut session, &config);
        advance_item(&mut session, &config);

        review(&mut session).expect("review");
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::InProgress)
        );
        assert_eq!(session.store.item_index(), 1);
    }

    struct FlakyAuthority {
        failures: u32,
        calls: AtomicU32,
    }

    impl Authority for FlakyAuthority {
        fn fetch_current_state(&self, _: SessionId) -> BoxFuture<'static, AuthorityResult<Option<Value>>> {
            Box::pin(async { Ok(None) })
        }

        fn submit_answer(&self, _: AnswerSubmission) -> BoxFuture<'static, AuthorityResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn load_section(
            &self,
            _: SessionId,
            _: SectionRequest,
        ) -> BoxFuture<'static, AuthorityResult<Option<Value>>> {
            Box::pin(async { Ok(None) })
        }

        fn mark_complete(&self, _: SessionId, _: ParticipantId) -> BoxFuture<'static, AuthorityResult<()>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let failures = self.failures;
            Box::pin(async move {
                if call <= failures {
                    Err(AuthorityError::Status {
                        path: "sessions/m1/complete".to_string(),
                        status: 503,
                    })
                } else {
                    Ok(())
                }
            })
        }

        fn participant_count(&self, _: SessionId) -> BoxFuture<'static, AuthorityResult<u32>> {
            Box::pin(async { Ok(0) })
        }

        fn leaderboard(&self, _: SessionId) -> BoxFuture<'static, AuthorityResult<Value>> {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_retries_until_success_or_exhaustion() {
        let flaky = Arc::new(FlakyAuthority {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let result = finalize_with_retries(
            flaky.clone(),
            SessionId::from("m1"),
            ParticipantId::from("p1"),
            3,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let down = Arc::new(FlakyAuthority {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let result =
            finalize_with_retries(down.clone(), SessionId::from("m1"), ParticipantId::from("p1"), 3)
                .await;
        assert!(result.is_err());
        assert_eq!(down.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn session_end_during_advance_wins_over_the_late_batch() {
        let config = AppConfig::default();
        let mut session = mock();
        loaded(&mut session, &config, batch("a", 40, 1, 2));
        session.store.move_to(39);
        advance_item(&mut session, &config);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::SectionBoundary)
        );

        let advance = request_advance(&mut session).expect("advance planned");
        let Some(Effect::LoadSection { request, purpose, plan }) = advance.effects.into_iter().next()
        else {
            panic!("expected a section load");
        };
        assert!(session.machine.has_pending());

        let ended = crate::services::phase_controller::apply_event(
            &mut session,
            &config,
            crate::dto::events::ChannelEvent::SessionEnd { leaderboard: None },
        );
        assert!(ended.applied);
        assert!(session.machine.phase().is_terminal());
        assert!(!session.machine.has_pending());
        assert!(!session.section_loading);
        assert!(session.store.answers_locked());

        let late = on_section_loaded(
            &mut session,
            &config,
            &request,
            purpose,
            plan,
            Ok(Some(batch("b", 40, 2, 2))),
        );
        assert!(!late.applied);
        assert!(late.effects.is_empty());
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::Completed)
        );
        assert_eq!(
            session.store.section().map(|section| section.id.as_str()),
            Some("sec-1")
        );
    }
}
