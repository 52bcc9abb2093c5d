use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Identifier of a live battle or a mock-test attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct SessionId(pub String);

/// Identifier of the participant driving this client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

/// Stable identifier of a question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ItemId(pub String);

/// Canonical answer-option key (`A`, `B`, `C`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct OptionKey(pub String);

macro_rules! string_id {
    ($($name:ident),*) => {
        $(
            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }

            impl From<String> for $name {
                fn from(value: String) -> Self {
                    Self(value)
                }
            }
        )*
    };
}

string_id!(SessionId, ParticipantId, ItemId);

impl OptionKey {
    /// Canonicalise any key spelling (`a`, `option_b`, `optionC`, ` d `) to an upper-case letter key.
    pub fn canonical(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let lowered = trimmed.to_ascii_lowercase();
        let stripped = lowered
            .strip_prefix("option_")
            .or_else(|| lowered.strip_prefix("option"))
            .unwrap_or(&lowered)
            .trim_start_matches(['_', '-', ' ']);
        if stripped.is_empty() {
            return None;
        }
        Some(Self(stripped.to_ascii_uppercase()))
    }

    /// Key for the option at `position` in an array payload (`0 -> A`).
    pub fn from_position(position: usize) -> Self {
        let letter = u8::try_from(position)
            .ok()
            .filter(|p| *p < 26)
            .map(|p| char::from(b'A' + p).to_string())
            .unwrap_or_else(|| (position + 1).to_string());
        Self(letter)
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which flavour of assessment a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Synchronized multi-participant quiz.
    Battle,
    /// Multi-section timed examination.
    MockTest,
}

/// Participant answer state attached to an item.
///
/// Two states compare equal exactly when submitting one after the other would
/// be a redundant write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Answer {
    /// Chosen option, if any.
    pub choice: Option<OptionKey>,
    /// Explicitly skipped.
    pub skipped: bool,
    /// Flagged for later review.
    pub marked_for_review: bool,
}

/// Coarse classification of an [`Answer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    /// Nothing recorded.
    Unanswered,
    /// An option was chosen.
    Chosen,
    /// Explicitly skipped.
    Skipped,
    /// Flagged for review, with or without a choice.
    MarkedForReview,
}

impl Answer {
    /// Answer that selects `choice` without flags.
    pub fn chosen(choice: OptionKey) -> Self {
        Self {
            choice: Some(choice),
            ..Self::default()
        }
    }

    /// Classify the answer; review marking wins over the other states.
    pub fn status(&self) -> AnswerStatus {
        if self.marked_for_review {
            AnswerStatus::MarkedForReview
        } else if self.choice.is_some() {
            AnswerStatus::Chosen
        } else if self.skipped {
            AnswerStatus::Skipped
        } else {
            AnswerStatus::Unanswered
        }
    }

    /// True when nothing has been recorded.
    pub fn is_unanswered(&self) -> bool {
        self.status() == AnswerStatus::Unanswered
    }
}

/// A single question in canonical shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    /// Stable identifier.
    pub id: ItemId,
    /// Question text.
    pub prompt: String,
    /// Optional image reference.
    pub image: Option<String>,
    /// Answer options keyed by canonical option key, in display order.
    pub options: IndexMap<OptionKey, String>,
    /// Authoritative correct option; never rendered before a reveal-authorizing phase.
    pub correct: Option<OptionKey>,
    /// Participant answer state.
    pub answer: Answer,
}

impl Item {
    /// Whether `key` is one of this item's options.
    pub fn has_option(&self, key: &OptionKey) -> bool {
        self.options.contains_key(key)
    }
}

/// Per-option answer counts published with a reveal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateCounts {
    /// Count per option key, in option order.
    pub per_option: IndexMap<OptionKey, u32>,
}

impl AggregateCounts {
    /// Total number of answers across all options.
    pub fn total(&self) -> u32 {
        self.per_option.values().copied().sum()
    }

    /// Count recorded for `key`, zero when absent.
    pub fn count(&self, key: &OptionKey) -> u32 {
        self.per_option.get(key).copied().unwrap_or(0)
    }
}

/// Row of the leaderboard as ranked by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct LeaderboardEntry {
    /// Ranked participant.
    pub participant_id: ParticipantId,
    /// Name shown on the board.
    pub display_name: String,
    /// Score of record.
    pub score: f64,
    /// One-based rank.
    pub rank: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_keys_are_canonicalised() {
        assert_eq!(OptionKey::canonical("a"), Some(OptionKey("A".into())));
        assert_eq!(OptionKey::canonical("option_b"), Some(OptionKey("B".into())));
        assert_eq!(OptionKey::canonical("optionC"), Some(OptionKey("C".into())));
        assert_eq!(OptionKey::canonical(" d "), Some(OptionKey("D".into())));
        assert_eq!(OptionKey::canonical("option_"), None);
        assert_eq!(OptionKey::canonical(""), None);
    }

    #[test]
    fn option_keys_from_positions() {
        assert_eq!(OptionKey::from_position(0).as_str(), "A");
        assert_eq!(OptionKey::from_position(3).as_str(), "D");
        assert_eq!(OptionKey::from_position(30).as_str(), "31");
    }

    #[test]
    fn answer_status_priorities() {
        assert_eq!(Answer::default().status(), AnswerStatus::Unanswered);
        assert_eq!(
            Answer::chosen(OptionKey("A".into())).status(),
            AnswerStatus::Chosen
        );
        let skipped = Answer {
            skipped: true,
            ..Answer::default()
        };
        assert_eq!(skipped.status(), AnswerStatus::Skipped);
        let review = Answer {
            choice: Some(OptionKey("B".into())),
            marked_for_review: true,
            ..Answer::default()
        };
        assert_eq!(review.status(), AnswerStatus::MarkedForReview);
    }
}
