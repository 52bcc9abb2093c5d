//! Request and response bodies of the local render bridge.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dto::phase::VisiblePhase,
    state::{
        ExamSession,
        item::{Answer, AnswerStatus, Feature, Item, ItemId, LeaderboardEntry, OptionKey},
    },
};

/// Request to enter (or re-enter) a session.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct EnterSessionRequest {
    /// Participant entering the session.
    #[validate(length(min = 1, max = 128))]
    pub participant_id: String,
    /// Battle or mock test.
    pub feature: Feature,
}

/// Answer for a specific item.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct AnswerRequest {
    /// Item being answered.
    #[validate(length(min = 1, max = 128))]
    pub item_id: String,
    /// Option key in any casing (`a`, `option_b`, ...); omitted or null clears the choice.
    #[validate(length(min = 1, max = 16))]
    pub option: Option<String>,
    /// Submit as skipped.
    #[serde(default)]
    pub skipped: bool,
    /// Flag the item for later review.
    #[serde(default)]
    pub marked_for_review: bool,
}

/// Local selection of the current item (not submitted).
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct SelectRequest {
    /// Option key in any casing; null clears the selection.
    #[validate(length(min = 1, max = 16))]
    pub option: Option<String>,
}

/// Participant decision at a section boundary.
#[derive(Debug, Clone, Copy, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryChoice {
    /// Stay in the section and revisit its items.
    Review,
    /// Load the next section.
    Advance,
    /// Finalize the attempt.
    Finish,
}

/// Choice made at a section boundary.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct BoundaryRequest {
    /// Review, advance or finish.
    pub choice: BoundaryChoice,
}

/// Navigate to an item, loading its section when needed.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct JumpRequest {
    /// Item to show.
    #[validate(length(min = 1, max = 128))]
    pub item_id: String,
}

/// One answer option as rendered.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq)]
pub struct OptionView {
    /// Canonical option key.
    pub key: OptionKey,
    /// Option text.
    pub text: String,
}

/// Aggregate count for one option.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq)]
pub struct OptionCountView {
    /// Canonical option key.
    pub key: OptionKey,
    /// Participants who chose it.
    pub count: u32,
}

/// Current item as rendered.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq)]
pub struct ItemView {
    /// Item identifier.
    pub id: ItemId,
    /// Question text.
    pub prompt: String,
    /// Image URL, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Options in display order.
    pub options: Vec<OptionView>,
    /// Only present once the phase authorizes a reveal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_option: Option<OptionKey>,
    /// Participant's recorded answer.
    pub answer: Answer,
    /// Palette status derived from the answer.
    pub status: AnswerStatus,
}

impl ItemView {
    fn from_item(item: &Item, reveal: bool) -> Self {
        Self {
            id: item.id.clone(),
            prompt: item.prompt.clone(),
            image: item.image.clone(),
            options: item
                .options
                .iter()
                .map(|(key, text)| OptionView {
                    key: key.clone(),
                    text: text.clone(),
                })
                .collect(),
            correct_option: item.correct.clone().filter(|_| reveal),
            answer: item.answer.clone(),
            status: item.answer.status(),
        }
    }
}

/// Entry of the mock-test navigation palette.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq)]
pub struct ItemStatusView {
    /// Item identifier.
    pub id: ItemId,
    /// One-based position in the section.
    pub position: u32,
    /// Palette status.
    pub status: AnswerStatus,
}

/// Section metadata as rendered.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq)]
pub struct SectionView {
    /// Section identifier.
    pub id: String,
    /// One-based section number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    /// Sections in the attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_sections: Option<u32>,
    /// No section follows this one.
    pub is_last: bool,
}

/// Everything the presentation layer needs to draw a session.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq)]
pub struct SessionView {
    /// Session identifier.
    pub session_id: String,
    /// Participant identifier.
    pub participant_id: String,
    /// Battle or mock test.
    pub feature: Feature,
    /// Phase to render.
    pub phase: VisiblePhase,
    /// Increments on every applied phase transition.
    pub version: usize,
    /// Current item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<ItemView>,
    /// One-based position of the current item.
    pub item_index: u32,
    /// Items in the session or section.
    pub total_items: u32,
    /// Seconds left on the clock.
    pub remaining_secs: u32,
    /// Answers are no longer accepted for the current item.
    pub answers_locked: bool,
    /// Local selection, not yet submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_option: Option<OptionKey>,
    /// Aggregate counts, once revealed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<OptionCountView>>,
    /// Rows in authority order.
    pub leaderboard: Vec<LeaderboardEntry>,
    /// Connected participants, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_count: Option<u32>,
    /// Loaded section (mock test only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<SectionView>,
    /// Mock test only: status of every item of the loaded section.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ItemStatusView>,
    /// True while a late joiner waits for the first live event.
    pub awaiting_live: bool,
}

impl SessionView {
    /// Project the session state for rendering, hiding the correct option until a reveal.
    pub fn from_session(session: &ExamSession) -> Self {
        let store = &session.store;
        let phase = session.machine.phase();
        let reveal = phase.authorizes_reveal();

        let results = store.aggregates().filter(|_| reveal).map(|counts| {
            counts
                .per_option
                .iter()
                .map(|(key, count)| OptionCountView {
                    key: key.clone(),
                    count: *count,
                })
                .collect()
        });

        let items = match store.feature() {
            Feature::MockTest => store
                .items()
                .enumerate()
                .map(|(position, item)| ItemStatusView {
                    id: item.id.clone(),
                    position: u32::try_from(position + 1).unwrap_or(u32::MAX),
                    status: item.answer.status(),
                })
                .collect(),
            Feature::Battle => Vec::new(),
        };

        Self {
            session_id: store.session_id().to_string(),
            participant_id: store.participant_id().to_string(),
            feature: store.feature(),
            phase: VisiblePhase::from(&phase),
            version: session.machine.snapshot().version,
            item: store
                .current_item()
                .map(|item| ItemView::from_item(item, reveal)),
            item_index: store.item_index(),
            total_items: store.total_items(),
            remaining_secs: session.clock.remaining(),
            answers_locked: store.answers_locked(),
            selected_option: store.selected().cloned(),
            results,
            leaderboard: store.leaderboard().to_vec(),
            participant_count: store.participant_count(),
            section: store.section().map(|section| SectionView {
                id: section.id.clone(),
                number: section.number,
                total_sections: section.total_sections,
                is_last: section.is_last(),
            }),
            items,
            awaiting_live: !session.live_seen && !store.grace_elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        Generation,
        item::{AggregateCounts, ParticipantId, SessionId},
        state_machine::{BattlePhase, PhaseEvent, SessionPhase},
    };

    fn battle_session() -> ExamSession {
        let mut session = ExamSession::new(
            SessionId::from("s1"),
            ParticipantId::from("p1"),
            Feature::Battle,
            Generation(1),
        );
        session.store.replace_current_item(Item {
            id: ItemId::from("q1"),
            prompt: "Pick".into(),
            options: [(OptionKey("A".into()), "a".to_string()), (OptionKey("B".into()), "b".to_string())]
                .into_iter()
                .collect(),
            correct: Some(OptionKey("B".into())),
            ..Item::default()
        });
        session
    }

    #[test]
    fn correct_option_hidden_until_reveal() {
        let mut session = battle_session();
        session
            .machine
            .transition(PhaseEvent::NewItem)
            .expect("question");
        session.store.aggregates = Some(AggregateCounts::default());

        let view = SessionView::from_session(&session);
        assert_eq!(view.phase, VisiblePhase::Question);
        assert!(view.item.as_ref().is_some_and(|item| item.correct_option.is_none()));
        assert!(view.results.is_none());

        session
            .machine
            .transition(PhaseEvent::RevealResults)
            .expect("results");
        let view = SessionView::from_session(&session);
        assert_eq!(
            session.machine.phase(),
            SessionPhase::Battle(BattlePhase::Results)
        );
        assert_eq!(
            view.item.and_then(|item| item.correct_option),
            Some(OptionKey("B".into()))
        );
        assert!(view.results.is_some());
    }

    #[test]
    fn battle_view_has_no_palette() {
        let view = SessionView::from_session(&battle_session());
        assert!(view.items.is_empty());
        assert!(view.awaiting_live);
        assert_eq!(view.item.map(|item| item.options.len()), Some(2));
    }
}
