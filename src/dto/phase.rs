use serde::Serialize;
use utoipa::ToSchema;

use crate::state::state_machine::{BattlePhase, MockPhase, SessionPhase};

/// Session phase exposed to the renderer (REST/SSE).
#[derive(Debug, Serialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisiblePhase {
    /// No authoritative state received yet.
    Awaiting,
    /// Battle: an item is open for answers.
    Question,
    /// Battle: aggregate results for the current item.
    Results,
    /// Battle: ranking between items.
    Leaderboard,
    /// Battle: the session is over.
    Ended,
    /// Mock test: answering items of the current section.
    InProgress,
    /// Mock test: end of a section, waiting for review/advance/finish.
    SectionBoundary,
    /// Mock test: the attempt has been finalized.
    Completed,
}

impl From<&SessionPhase> for VisiblePhase {
    fn from(value: &SessionPhase) -> Self {
        match value {
            SessionPhase::Awaiting => VisiblePhase::Awaiting,
            SessionPhase::Battle(BattlePhase::Question) => VisiblePhase::Question,
            SessionPhase::Battle(BattlePhase::Results) => VisiblePhase::Results,
            SessionPhase::Battle(BattlePhase::Leaderboard) => VisiblePhase::Leaderboard,
            SessionPhase::Battle(BattlePhase::Ended) => VisiblePhase::Ended,
            SessionPhase::MockTest(MockPhase::InProgress) => VisiblePhase::InProgress,
            SessionPhase::MockTest(MockPhase::SectionBoundary) => VisiblePhase::SectionBoundary,
            SessionPhase::MockTest(MockPhase::Completed) => VisiblePhase::Completed,
        }
    }
}
