//! Applies the authority's last known state when a participant (re)enters a session.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    dao::authority::AuthorityResult,
    dto::{restore::RestoreSnapshot, section::SectionTarget},
    services::{
        phase_controller::{Outcome, SectionPurpose},
        section_navigator,
    },
    state::{
        ExamSession, Resume,
        item::{Feature, ItemId},
        state_machine::{BattlePhase, MockPhase, PhaseEvent, SessionPhase},
    },
};

/// Apply a restore fetch result.
///
/// Failures and malformed records leave the session in its neutral awaiting
/// phase. Once a live event has been applied the battle snapshot is discarded.
pub fn apply_restore(
    session: &mut ExamSession,
    config: &AppConfig,
    result: AuthorityResult<Option<Value>>,
) -> Outcome {
    let snapshot = match result {
        Ok(Some(record)) => match RestoreSnapshot::from_value(&record, session.feature()) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(
                    session_id = %session.store.session_id(),
                    error = %err,
                    "malformed restore record; awaiting live events"
                );
                None
            }
        },
        Ok(None) => {
            debug!(
                session_id = %session.store.session_id(),
                "no state recorded; fresh session"
            );
            None
        }
        Err(err) => {
            warn!(
                session_id = %session.store.session_id(),
                error = %err,
                "restore fetch failed; awaiting live events"
            );
            None
        }
    };

    match session.feature() {
        Feature::Battle => restore_battle(session, config, snapshot),
        Feature::MockTest => restore_mock(session, snapshot),
    }
}

fn restore_battle(
    session: &mut ExamSession,
    config: &AppConfig,
    snapshot: Option<RestoreSnapshot>,
) -> Outcome {
    let Some(snapshot) = snapshot else {
        return Outcome::dropped();
    };
    if session.live_seen {
        debug!(
            session_id = %session.store.session_id(),
            "live event already applied; discarding restore snapshot"
        );
        return Outcome::dropped();
    }

    let RestoreSnapshot {
        phase,
        item,
        index,
        total,
        remaining,
        counts,
        leaderboard,
    } = snapshot;

    if phase != SessionPhase::Awaiting
        && let Err(err) = session.machine.transition(PhaseEvent::Restore(phase))
    {
        warn!(
            session_id = %session.store.session_id(),
            error = %err,
            "restore phase rejected; awaiting live events"
        );
        return Outcome::dropped();
    }

    if let Some(item) = item {
        let choice = item.answer.choice.clone();
        session.store.replace_current_item(item);
        session.store.selected = choice;
    }
    if let Some(index) = index {
        session.store.item_index = index;
    }
    if let Some(total) = total {
        session.store.total_items = total;
    }
    if phase.authorizes_reveal()
        && let Some(counts) = counts
    {
        session.store.aggregates = Some(counts);
    }
    if let Some(rows) = leaderboard {
        session.store.leaderboard = rows;
    }

    match phase {
        SessionPhase::Battle(BattlePhase::Question) => {
            session.clock.arm(config.battle.item_duration_secs);
            if let Some(remaining) = remaining {
                session.clock.sync(remaining);
            }
            session.store.answers_locked = session.clock.remaining() == 0;
        }
        SessionPhase::Battle(BattlePhase::Results | BattlePhase::Leaderboard) => {
            if let Some(remaining) = remaining {
                session.clock.arm(0);
                session.clock.sync(remaining);
            }
            session.store.answers_locked = true;
        }
        SessionPhase::Battle(BattlePhase::Ended) => {
            session.clock.disarm();
            session.store.answers_locked = true;
        }
        _ => {}
    }

    info!(
        session_id = %session.store.session_id(),
        ?phase,
        index = session.store.item_index(),
        remaining = session.clock.remaining(),
        "restored session state"
    );
    Outcome::applied()
}

fn restore_mock(session: &mut ExamSession, snapshot: Option<RestoreSnapshot>) -> Outcome {
    if session.machine.phase() != SessionPhase::Awaiting {
        return Outcome::dropped();
    }

    let resume_at = match snapshot {
        Some(RestoreSnapshot {
            phase: SessionPhase::MockTest(MockPhase::Completed),
            ..
        }) => {
            if let Err(err) = session
                .machine
                .transition(PhaseEvent::Restore(SessionPhase::MockTest(MockPhase::Completed)))
            {
                warn!(
                    session_id = %session.store.session_id(),
                    error = %err,
                    "restore phase rejected"
                );
                return Outcome::dropped();
            }
            // Already completed upstream; nothing left to finalize.
            session.store.finalize_requested = true;
            session.store.answers_locked = true;
            info!(session_id = %session.store.session_id(), "attempt already completed");
            return Outcome::applied();
        }
        Some(RestoreSnapshot {
            phase,
            item,
            remaining,
            ..
        }) => {
            let at_boundary = phase == SessionPhase::MockTest(MockPhase::SectionBoundary);
            if let Some(remaining) = remaining {
                // Keeps counting down while the section loads.
                session.clock.arm(0);
                session.clock.sync(remaining);
            }
            if remaining.is_some() || at_boundary {
                session.resume = Some(Resume {
                    remaining,
                    at_boundary,
                });
            }
            info!(
                session_id = %session.store.session_id(),
                ?phase,
                remaining = ?remaining,
                "restoring mock-test attempt"
            );
            item.map(|item| item.id)
        }
        None => None,
    };

    initial_section_load(session, resume_at)
}

/// Request the first section batch, resuming at `resume_at` when known.
pub fn initial_section_load(session: &mut ExamSession, resume_at: Option<ItemId>) -> Outcome {
    if session.section_loading || session.machine.phase() != SessionPhase::Awaiting {
        return Outcome::dropped();
    }
    let target = resume_at
        .filter(|id| !id.0.is_empty())
        .map_or(SectionTarget::Next, SectionTarget::Item);
    let effect = section_navigator::load_section(session, target, SectionPurpose::Initial, None);
    Outcome::applied().with_effect(effect)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        dao::authority::AuthorityError,
        services::phase_controller::Effect,
        state::{
            Generation,
            item::{OptionKey, ParticipantId, SessionId},
        },
    };

    fn session(feature: Feature) -> ExamSession {
        ExamSession::new(
            SessionId::from("s1"),
            ParticipantId::from("p1"),
            feature,
            Generation(1),
        )
    }

    #[test]
    fn stats_phase_restores_results_with_counts_and_clock() {
        let config = AppConfig::default();
        let mut session = session(Feature::Battle);
        let record = json!({
            "phase": "stats",
            "current_question_index": 3,
            "total_mcqs": 10,
            "time_left": "00:01:10",
            "current_question": {
                "mcq_id": "Q4",
                "options": {"a": "red", "b": "blue"},
                "correct_option": "b"
            },
            "stats": {"A": 2, "B": 7}
        });

        let outcome = apply_restore(&mut session, &config, Ok(Some(record)));

        assert!(outcome.applied);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::Battle(BattlePhase::Results)
        );
        assert_eq!(session.store.item_index(), 4);
        assert_eq!(session.store.total_items(), 10);
        assert_eq!(session.clock.remaining(), 70);
        let counts = session.store.aggregates().expect("counts");
        assert_eq!(counts.count(&OptionKey("B".into())), 7);
        assert_eq!(
            session.store.current_item().and_then(|item| item.correct.clone()),
            Some(OptionKey("B".into()))
        );
        assert!(session.store.answers_locked());
    }

    #[test]
    fn question_without_time_arms_default_duration() {
        let config = AppConfig::default();
        let mut session = session(Feature::Battle);
        let record = json!({"status": "question", "current_question": {"mcq_id": "Q1"}});

        apply_restore(&mut session, &config, Ok(Some(record)));

        assert_eq!(
            session.machine.phase(),
            SessionPhase::Battle(BattlePhase::Question)
        );
        assert_eq!(session.clock.remaining(), config.battle.item_duration_secs);
        assert!(!session.store.answers_locked());
    }

    #[test]
    fn failures_leave_session_awaiting() {
        let config = AppConfig::default();
        let mut session = session(Feature::Battle);

        let failed = apply_restore(
            &mut session,
            &config,
            Err(AuthorityError::Status {
                path: "sessions/s1/state".into(),
                status: 500,
            }),
        );
        assert!(!failed.applied);
        let malformed = apply_restore(&mut session, &config, Ok(Some(json!({"phase": "???"}))));
        assert!(!malformed.applied);
        assert_eq!(session.machine.phase(), SessionPhase::Awaiting);
    }

    #[test]
    fn snapshot_after_live_event_is_discarded() {
        let config = AppConfig::default();
        let mut session = session(Feature::Battle);
        session.live_seen = true;

        let outcome = apply_restore(
            &mut session,
            &config,
            Ok(Some(json!({"phase": "leaderboard", "leaderboard": [{"id": "x"}]}))),
        );

        assert!(!outcome.applied);
        assert!(session.store.leaderboard().is_empty());
    }

    #[test]
    fn mock_restore_resumes_section_at_current_item() {
        let config = AppConfig::default();
        let mut session = session(Feature::MockTest);
        let record = json!({"phase": "in_progress", "current_mcq_id": "m17"});

        let outcome = apply_restore(&mut session, &config, Ok(Some(record)));

        match outcome.effects.as_slice() {
            [Effect::LoadSection { request, purpose: SectionPurpose::Initial, plan: None }] => {
                assert_eq!(request.target, SectionTarget::Item(ItemId::from("m17")));
            }
            other => panic!("unexpected effects: {other:?}"),
        }
        assert!(session.section_loading);
        assert!(initial_section_load(&mut session, None).effects.is_empty());
    }

    #[test]
    fn mock_restore_of_completed_attempt_does_not_finalize_again() {
        let config = AppConfig::default();
        let mut session = session(Feature::MockTest);

        let outcome = apply_restore(&mut session, &config, Ok(Some(json!({"phase": "submitted"}))));

        assert!(outcome.effects.is_empty());
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::Completed)
        );
        assert!(session.store.finalize_requested);
    }

    #[test]
    fn mock_restore_carries_remaining_time_into_the_section() {
        let config = AppConfig::default();
        let mut session = session(Feature::MockTest);
        let record = json!({"phase": "in_progress", "current_mcq_id": "a2", "time_left": "00:01:10"});

        let outcome = apply_restore(&mut session, &config, Ok(Some(record)));
        let [Effect::LoadSection { request, purpose, plan }] = outcome.effects.as_slice() else {
            panic!("unexpected effects: {:?}", outcome.effects);
        };
        assert_eq!(request.remaining_secs, 70);

        session.clock.tick();
        let body = json!({
            "section_id": "sec-1",
            "section_number": 1,
            "total_sections": 2,
            "items": [
                {"id": "a1", "question": "?", "options": ["x", "y"]},
                {"id": "a2", "question": "?", "options": ["x", "y"]},
            ],
        });
        let loaded = section_navigator::on_section_loaded(
            &mut session,
            &config,
            request,
            purpose.clone(),
            *plan,
            Ok(Some(body)),
        );

        assert!(loaded.applied);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::InProgress)
        );
        assert_eq!(session.store.item_index(), 2);
        assert_eq!(session.clock.remaining(), 69);
        assert!(session.resume.is_none());
        assert!(!session.store.answers_locked());
    }

    #[test]
    fn mock_restore_at_boundary_returns_to_the_boundary() {
        let config = AppConfig::default();
        let mut session = session(Feature::MockTest);
        let record = json!({"phase": "section_boundary", "current_mcq_id": "a2", "time_left": 0});

        let outcome = apply_restore(&mut session, &config, Ok(Some(record)));
        let [Effect::LoadSection { request, purpose, plan }] = outcome.effects.as_slice() else {
            panic!("unexpected effects: {:?}", outcome.effects);
        };
        let body = json!({
            "section_id": "sec-1",
            "section_number": 1,
            "total_sections": 2,
            "items": [
                {"id": "a1", "question": "?", "options": ["x", "y"]},
                {"id": "a2", "question": "?", "options": ["x", "y"]},
            ],
        });
        section_navigator::on_section_loaded(
            &mut session,
            &config,
            request,
            purpose.clone(),
            *plan,
            Ok(Some(body)),
        );

        assert_eq!(
            session.machine.phase(),
            SessionPhase::MockTest(MockPhase::SectionBoundary)
        );
        assert_eq!(session.clock.remaining(), 0);
        assert!(session.store.answers_locked());
        assert!(section_navigator::request_advance(&mut session).is_ok());
    }
}
