//! Applies live channel events and clock expiry to a session.
//!
//! Every function here runs on the session loop, mutates the [`ExamSession`]
//! synchronously and returns the remote work to start as [`Effect`]s.

use tracing::{debug, warn};

use crate::{
    config::{AppConfig, ExpiryPolicy},
    dto::{
        events::{ChannelEvent, LeaderboardEvent, NewItemEvent, RevealEvent},
        normalize::normalize_leaderboard,
        section::SectionRequest,
        submission::AnswerSubmission,
    },
    services::{answer_submitter, section_navigator},
    state::{
        ExamSession, PlanId,
        item::{Feature, ItemId, LeaderboardEntry},
        state_machine::{BattlePhase, MockPhase, PhaseEvent, SessionPhase},
    },
};

/// Why a section load was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionPurpose {
    /// First batch after entering the attempt.
    Initial,
    /// Next section after the participant confirmed the boundary.
    Advance,
    /// Batch containing an item outside the loaded section.
    Jump,
}

/// Remote work requested by a state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send an answer to the authority.
    Submit(AnswerSubmission),
    /// Fetch a section batch.
    LoadSection {
        /// Request body.
        request: SectionRequest,
        /// Why the load was issued.
        purpose: SectionPurpose,
        /// Pending phase transition applied on success, aborted on failure.
        plan: Option<PlanId>,
    },
    /// Mark the attempt complete, with retries.
    Finalize,
}

/// Result of processing one input on the session loop.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    /// The input was applied (as opposed to dropped as stale, duplicate or invalid).
    pub applied: bool,
    /// Remote work to start.
    pub effects: Vec<Effect>,
}

impl Outcome {
    /// The input changed nothing.
    pub fn dropped() -> Self {
        Self::default()
    }

    /// The input was applied and needs no remote work.
    pub fn applied() -> Self {
        Self {
            applied: true,
            effects: Vec::new(),
        }
    }

    /// Append one effect.
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Append several effects.
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Apply one normalized channel event.
pub fn apply_event(session: &mut ExamSession, config: &AppConfig, event: ChannelEvent) -> Outcome {
    if session.machine.phase().is_terminal() {
        debug!(
            session_id = %session.store.session_id(),
            kind = event.kind().as_str(),
            "session already ended; dropping event"
        );
        return Outcome::dropped();
    }

    match event {
        ChannelEvent::NewItem(event) => on_new_item(session, config, event),
        ChannelEvent::RevealResults(event) => on_reveal(session, event),
        ChannelEvent::UpdateLeaderboard(event) => on_leaderboard(session, event),
        ChannelEvent::TimerSync(remaining) => on_timer_sync(session, remaining),
        ChannelEvent::SessionEnd { leaderboard } => on_session_end(session, leaderboard),
        ChannelEvent::Unrecognized(kind) => {
            warn!(
                session_id = %session.store.session_id(),
                kind = %kind,
                "unrecognized channel event; dropping"
            );
            Outcome::dropped()
        }
    }
}

fn battle_only(session: &ExamSession, kind: &str) -> bool {
    if session.feature() == Feature::Battle {
        return true;
    }
    debug!(
        session_id = %session.store.session_id(),
        kind,
        "battle event on a mock-test session; dropping"
    );
    false
}

fn on_new_item(session: &mut ExamSession, config: &AppConfig, event: NewItemEvent) -> Outcome {
    if !battle_only(session, "new_item") {
        return Outcome::dropped();
    }

    let NewItemEvent {
        mut item,
        index,
        total,
        remaining,
        repeat,
    } = event;

    if item.id.0.is_empty() {
        match index {
            Some(index) => item.id = ItemId(format!("item-{index}")),
            None => {
                warn!(
                    session_id = %session.store.session_id(),
                    "new item without id or index; dropping"
                );
                return Outcome::dropped();
            }
        }
    }

    let phase = session.machine.phase();
    let current_index = session.store.item_index();
    let same_item = session
        .store
        .current_item()
        .is_some_and(|current| current.id == item.id);

    if let Some(index) = index
        && index < current_index
    {
        debug!(
            session_id = %session.store.session_id(),
            index,
            current_index,
            "stale item announcement; dropping"
        );
        return Outcome::dropped();
    }

    let event = if repeat {
        PhaseEvent::RepeatItem
    } else {
        if same_item {
            debug!(
                session_id = %session.store.session_id(),
                item_id = %item.id,
                ?phase,
                "item already presented; dropping duplicate announcement"
            );
            return Outcome::dropped();
        }
        PhaseEvent::NewItem
    };

    if let Err(err) = session.machine.transition(event) {
        debug!(
            session_id = %session.store.session_id(),
            error = ?err,
            "new item rejected by phase machine"
        );
        return Outcome::dropped();
    }

    session.store.replace_current_item(item);
    if let Some(index) = index {
        session.store.item_index = index;
    }
    if let Some(total) = total {
        session.store.total_items = total;
    }
    session.clock.arm(config.battle.item_duration_secs);
    if let Some(remaining) = remaining {
        sync_clock(session, remaining);
    }

    Outcome::applied()
}

fn on_reveal(session: &mut ExamSession, event: RevealEvent) -> Outcome {
    if !battle_only(session, "reveal_results") {
        return Outcome::dropped();
    }

    let current = session.store.current_item().map(|item| item.id.clone());
    if let (Some(revealed), Some(current)) = (&event.item_id, &current)
        && revealed != current
    {
        debug!(
            session_id = %session.store.session_id(),
            revealed = %revealed,
            current = %current,
            "reveal for another item; dropping"
        );
        return Outcome::dropped();
    }

    if let Err(err) = session.machine.transition(PhaseEvent::RevealResults) {
        debug!(
            session_id = %session.store.session_id(),
            error = ?err,
            "reveal rejected by phase machine"
        );
        return Outcome::dropped();
    }

    if let Some(item) = session.store.current_item_mut()
        && event.correct.is_some()
    {
        item.correct = event.correct;
    }
    session.store.aggregates = Some(event.counts);
    if let Some(rows) = event.leaderboard {
        session.store.leaderboard = rows;
    }
    session.store.answers_locked = true;
    session.clock.disarm();
    if let Some(remaining) = event.remaining {
        session.clock.sync(remaining);
    }

    Outcome::applied()
}

fn on_leaderboard(session: &mut ExamSession, event: LeaderboardEvent) -> Outcome {
    if !battle_only(session, "update_leaderboard") {
        return Outcome::dropped();
    }

    // Leaderboard to leaderboard is a data refresh, not a transition.
    if session.machine.phase() != SessionPhase::Battle(BattlePhase::Leaderboard)
        && let Err(err) = session.machine.transition(PhaseEvent::UpdateLeaderboard)
    {
        debug!(
            session_id = %session.store.session_id(),
            error = ?err,
            "leaderboard rejected by phase machine"
        );
        return Outcome::dropped();
    }

    session.store.leaderboard = event.rows;
    if let Some(count) = event.participant_count {
        session.store.participant_count = Some(count);
    }
    session.store.answers_locked = true;
    session.clock.disarm();
    if let Some(remaining) = event.remaining {
        session.clock.sync(remaining);
    }

    Outcome::applied()
}

fn on_timer_sync(session: &mut ExamSession, remaining: Option<i64>) -> Outcome {
    let Some(remaining) = remaining else {
        warn!(
            session_id = %session.store.session_id(),
            "timer sync without a usable value; dropping"
        );
        return Outcome::dropped();
    };

    sync_clock(session, remaining);
    Outcome::applied()
}

/// Last write wins; a value at or below zero also locks the current item.
fn sync_clock(session: &mut ExamSession, remaining: i64) {
    session.clock.sync(remaining);
    if remaining <= 0 {
        session.store.answers_locked = true;
    }
}

fn on_session_end(session: &mut ExamSession, leaderboard: Option<Vec<LeaderboardEntry>>) -> Outcome {
    // The authority's end outranks local navigation in flight.
    if let Some(plan) = session.machine.abort_pending() {
        debug!(
            session_id = %session.store.session_id(),
            event = ?plan.event,
            "session end aborts pending transition"
        );
    }
    session.section_loading = false;

    if let Err(err) = session.machine.transition(PhaseEvent::SessionEnd) {
        debug!(
            session_id = %session.store.session_id(),
            error = ?err,
            "session end rejected by phase machine"
        );
        return Outcome::dropped();
    }

    if let Some(rows) = leaderboard {
        session.store.leaderboard = rows;
    }
    session.store.answers_locked = true;
    session.clock.disarm();

    Outcome::applied()
}

/// React to the local clock reaching zero, following the feature's expiry policy.
pub fn on_expired(session: &mut ExamSession, config: &AppConfig) -> Outcome {
    let policy = config.expiry_policy(session.feature());
    let phase = session.machine.phase();

    match phase {
        SessionPhase::Battle(BattlePhase::Question) => {
            let effects = match policy {
                ExpiryPolicy::AutoAdvance => auto_submit_selection(session, config),
                ExpiryPolicy::Hold => Vec::new(),
            };
            session.store.answers_locked = true;
            Outcome::applied().with_effects(effects)
        }
        SessionPhase::MockTest(MockPhase::InProgress) => match policy {
            ExpiryPolicy::Hold => {
                session.store.answers_locked = true;
                Outcome::applied()
            }
            ExpiryPolicy::AutoAdvance => {
                let effects = auto_submit_selection(session, config);
                let next = if config.mock_test.item_duration_secs.is_some() {
                    section_navigator::advance_item(session, config)
                } else {
                    section_navigator::reach_section_end(session)
                };
                session.store.answers_locked = session.clock.has_expired();
                next.with_effects(effects)
            }
        },
        _ => {
            debug!(
                session_id = %session.store.session_id(),
                ?phase,
                "clock expired outside an answering phase"
            );
            Outcome::dropped()
        }
    }
}

/// Submit the pending selection once; an answer already submitted with the same choice is not resent.
fn auto_submit_selection(session: &mut ExamSession, config: &AppConfig) -> Vec<Effect> {
    let Some(choice) = session.store.selected().cloned() else {
        return Vec::new();
    };
    let Some(item) = session.store.current_item() else {
        return Vec::new();
    };
    let item_id = item.id.clone();
    let mut answer = item.answer.clone();
    answer.choice = Some(choice);
    answer.skipped = false;

    match answer_submitter::record(session, config, &item_id, answer, true) {
        Ok(Some(submission)) => vec![Effect::Submit(submission)],
        Ok(None) => Vec::new(),
        Err(err) => {
            debug!(
                session_id = %session.store.session_id(),
                error = %err,
                "auto-submit on expiry skipped"
            );
            Vec::new()
        }
    }
}

/// Store a polled participant count.
pub fn apply_participant_count(session: &mut ExamSession, count: u32) -> bool {
    if session.store.participant_count == Some(count) {
        return false;
    }
    session.store.participant_count = Some(count);
    true
}

/// Store polled leaderboard rows while the ranking is on screen.
pub fn apply_polled_leaderboard(session: &mut ExamSession, body: &serde_json::Value) -> bool {
    if !matches!(
        session.machine.phase(),
        SessionPhase::Battle(BattlePhase::Leaderboard | BattlePhase::Ended)
    ) {
        return false;
    }
    let rows = normalize_leaderboard(body);
    if rows.is_empty() || rows == session.store.leaderboard {
        return false;
    }
    session.store.leaderboard = rows;
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::state::{
        Generation,
        item::{Answer, Item, OptionKey, ParticipantId, SessionId},
    };

    fn battle() -> ExamSession {
        ExamSession::new(
            SessionId::from("b1"),
            ParticipantId::from("p1"),
            Feature::Battle,
            Generation(1),
        )
    }

    fn parse(raw: &str) -> ChannelEvent {
        ChannelEvent::from_json_str(raw)
    }

    fn new_question(id: &str, order: u32) -> ChannelEvent {
        parse(&json!({
            "type": "new_question",
            "data": {
                "mcq_id": id,
                "react_order": order,
                "total_mcqs": 40,
                "phase_json": {"options": ["A txt", "B txt", "C txt", "D txt"], "correct_option": "C"}
            }
        })
        .to_string())
    }

    #[test]
    fn new_question_opens_item_and_arms_clock() {
        let config = AppConfig::default();
        let mut session = battle();
        session.store.selected = Some(OptionKey("A".into()));

        let outcome = apply_event(&mut session, &config, new_question("Q9", 9));

        assert!(outcome.applied);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::Battle(BattlePhase::Question)
        );
        let item = session.store.current_item().expect("item");
        assert_eq!(item.id, ItemId::from("Q9"));
        assert_eq!(item.options.len(), 4);
        assert_eq!(item.options.get(&OptionKey("D".into())).map(String::as_str), Some("D txt"));
        assert_eq!(session.store.item_index(), 9);
        assert_eq!(session.store.total_items(), 40);
        assert_eq!(session.clock.remaining(), config.battle.item_duration_secs);
        assert!(session.store.selected().is_none());
        assert!(item.answer.is_unanswered());
    }

    #[test]
    fn stale_and_duplicate_items_are_dropped() {
        let config = AppConfig::default();
        let mut session = battle();
        assert!(apply_event(&mut session, &config, new_question("Q5", 5)).applied);
        session.clock.tick();
        let remaining = session.clock.remaining();

        assert!(!apply_event(&mut session, &config, new_question("Q5", 5)).applied);
        assert!(!apply_event(&mut session, &config, new_question("Q4", 4)).applied);
        assert_eq!(session.clock.remaining(), remaining);
        assert_eq!(session.store.item_index(), 5);
    }

    #[test]
    fn reveal_for_current_item_only() {
        let config = AppConfig::default();
        let mut session = battle();
        apply_event(&mut session, &config, new_question("Q1", 1));

        let other = parse(r#"{"type":"reveal","data":{"mcq_id":"Q0","stats":{"A":1}}}"#);
        assert!(!apply_event(&mut session, &config, other).applied);

        let reveal = parse(r#"{"type":"show_stats","data":{"mcq_id":"Q1","stats":[4,1,0,2]}}"#);
        assert!(apply_event(&mut session, &config, reveal).applied);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::Battle(BattlePhase::Results)
        );
        assert_eq!(session.store.aggregates().map(|c| c.total()), Some(7));
        assert!(session.store.answers_locked());
        assert!(!session.clock.is_running());
    }

    #[test]
    fn reveal_before_any_item_is_dropped() {
        let config = AppConfig::default();
        let mut session = battle();
        let reveal = parse(r#"{"type":"reveal_results","data":{"stats":{"A":1}}}"#);
        assert!(!apply_event(&mut session, &config, reveal).applied);
        assert_eq!(session.machine.phase(), SessionPhase::Awaiting);
    }

    #[test]
    fn repeat_requires_explicit_flag() {
        let config = AppConfig::default();
        let mut session = battle();
        apply_event(&mut session, &config, new_question("Q1", 1));
        apply_event(
            &mut session,
            &config,
            parse(r#"{"type":"reveal","data":{"mcq_id":"Q1"}}"#),
        );

        assert!(!apply_event(&mut session, &config, new_question("Q1", 1)).applied);
        let repeat = parse(r#"{"type":"new_item","data":{"mcq_id":"Q1","react_order":1,"repeat":true}}"#);
        assert!(apply_event(&mut session, &config, repeat).applied);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::Battle(BattlePhase::Question)
        );
        assert!(!session.store.answers_locked());
    }

    #[test]
    fn leaderboard_keeps_authority_order_and_refreshes_in_place() {
        let config = AppConfig::default();
        let mut session = battle();
        apply_event(&mut session, &config, new_question("Q1", 1));

        let board = parse(
            r#"{"type":"leaderboard","data":{"rows":[
                {"user_id":"low","score":1,"rank":1},
                {"user_id":"high","score":99,"rank":2}]}}"#,
        );
        assert!(apply_event(&mut session, &config, board).applied);
        let ids = session
            .store
            .leaderboard()
            .iter()
            .map(|row| row.participant_id.0.clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["low".to_string(), "high".to_string()]);
        let version = session.machine.snapshot().version;

        let refresh = parse(r#"{"type":"update_leaderboard","data":[{"user_id":"x","rank":1}]}"#);
        assert!(apply_event(&mut session, &config, refresh).applied);
        assert_eq!(session.machine.snapshot().version, version);
        assert_eq!(session.store.leaderboard().len(), 1);
    }

    #[test]
    fn timer_sync_is_pure_reconciliation() {
        let config = AppConfig::default();
        let mut session = battle();
        apply_event(&mut session, &config, new_question("Q1", 1));
        let version = session.machine.snapshot().version;

        assert!(apply_event(&mut session, &config, ChannelEvent::TimerSync(Some(4))).applied);
        assert_eq!(session.clock.remaining(), 4);
        assert!(!session.store.answers_locked());
        assert!(!apply_event(&mut session, &config, ChannelEvent::TimerSync(None)).applied);

        assert!(apply_event(&mut session, &config, ChannelEvent::TimerSync(Some(0))).applied);
        assert!(session.store.answers_locked());
        assert_eq!(session.machine.snapshot().version, version);
    }

    #[test]
    fn session_end_is_terminal() {
        let config = AppConfig::default();
        let mut session = battle();
        apply_event(&mut session, &config, new_question("Q1", 1));
        let end = parse(r#"{"type":"battle_end","data":{"leaderboard":[{"id":"p1","rank":1}]}}"#);
        assert!(apply_event(&mut session, &config, end).applied);
        assert_eq!(session.machine.phase(), SessionPhase::Battle(BattlePhase::Ended));
        assert_eq!(session.store.leaderboard().len(), 1);
        assert!(!apply_event(&mut session, &config, new_question("Q2", 2)).applied);
    }

    #[test]
    fn battle_expiry_holds_or_submits_selection_once() {
        let mut config = AppConfig::default();
        let mut session = battle();
        apply_event(&mut session, &config, new_question("Q1", 1));
        session.store.selected = Some(OptionKey("B".into()));

        let held = on_expired(&mut session, &config);
        assert!(held.effects.is_empty());
        assert!(session.store.answers_locked());

        config.battle.expiry_policy = ExpiryPolicy::AutoAdvance;
        let mut session = battle();
        apply_event(&mut session, &config, new_question("Q1", 1));
        session.store.selected = Some(OptionKey("B".into()));
        let submitted = on_expired(&mut session, &config);
        assert_eq!(submitted.effects.len(), 1);
        assert_eq!(
            session.store.current_item().map(|item| item.answer.clone()),
            Some(Answer::chosen(OptionKey("B".into())))
        );

        let again = on_expired(&mut session, &config);
        assert!(again.effects.is_empty());
    }

    #[test]
    fn polled_leaderboard_only_while_ranking_is_shown() {
        let mut session = battle();
        assert!(!apply_polled_leaderboard(&mut session, &json!([{"id": "a"}])));
        session.store.replace_current_item(Item::default());
        session
            .machine
            .transition(PhaseEvent::UpdateLeaderboard)
            .expect("leaderboard");
        assert!(apply_polled_leaderboard(&mut session, &json!([{"id": "a"}])));
        assert!(!apply_polled_leaderboard(&mut session, &json!([{"id": "a"}])));
        assert!(apply_participant_count(&mut session, 12));
        assert!(!apply_participant_count(&mut session, 12));
    }
}
