//! Outbound answer submission and the small authority response bodies.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_with::{DefaultOnError, DisplayFromStr, PickFirst, serde_as, skip_serializing_none};

use crate::{
    dto::format_system_time,
    state::item::{Answer, Item, ItemId, OptionKey, ParticipantId, SessionId},
};

/// Answer submission sent to the authority.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AnswerSubmission {
    /// Answering participant.
    pub participant_id: ParticipantId,
    /// Session of the item.
    pub session_id: SessionId,
    /// Item answered.
    pub item_id: ItemId,
    /// Chosen option; absent when skipped.
    pub selected_option: Option<OptionKey>,
    /// Local correctness hint; the authority decides the score of record.
    pub is_correct: bool,
    /// The item was skipped.
    pub skipped: bool,
    /// The item is flagged for review.
    pub marked_for_review: bool,
    /// Clock value when the answer was given.
    pub remaining_secs: u32,
    /// Seconds spent, when the allotted time is known.
    pub elapsed_secs: Option<u32>,
    /// RFC 3339 timestamp.
    pub answered_at: String,
}

impl AnswerSubmission {
    /// Build the submission for `answer` on `item`.
    pub fn new(
        session_id: SessionId,
        participant_id: ParticipantId,
        item: &Item,
        answer: &Answer,
        remaining_secs: u32,
        allotted_secs: Option<u32>,
    ) -> Self {
        let is_correct = match (&answer.choice, &item.correct) {
            (Some(choice), Some(correct)) => choice == correct,
            _ => false,
        };
        Self {
            participant_id,
            session_id,
            item_id: item.id.clone(),
            selected_option: answer.choice.clone(),
            is_correct,
            skipped: answer.skipped,
            marked_for_review: answer.marked_for_review,
            remaining_secs,
            elapsed_secs: allotted_secs.map(|allotted| allotted.saturating_sub(remaining_secs)),
            answered_at: format_system_time(SystemTime::now()),
        }
    }
}

/// Body of the finalize call.
#[derive(Debug, Clone, Serialize)]
pub struct CompleteRequest<'a> {
    /// Participant whose attempt is complete.
    pub participant_id: &'a ParticipantId,
}

/// Participant count, published either as a bare number or as `{count}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ParticipantCountBody {
    /// A number or numeric string.
    Bare(#[serde(deserialize_with = "count_from_any")] u32),
    /// An object with a count field.
    Wrapped(CountField),
}

/// Object form of a participant count.
#[serde_as]
#[derive(Debug, Deserialize)]
pub struct CountField {
    /// Participant count; zero when unreadable.
    #[serde(alias = "participant_count", alias = "participants", alias = "total")]
    #[serde_as(as = "DefaultOnError<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub count: u32,
}

fn count_from_any<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde_with::DeserializeAs;
    PickFirst::<(serde_with::Same, DisplayFromStr)>::deserialize_as(deserializer)
}

impl ParticipantCountBody {
    /// The count, whichever shape it came in.
    pub fn count(&self) -> u32 {
        match self {
            ParticipantCountBody::Bare(count) => *count,
            ParticipantCountBody::Wrapped(field) => field.count,
        }
    }
}
