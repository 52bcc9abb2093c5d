//! Authority state record used to restore a session after a (re)join.

use serde_json::Value;
use thiserror::Error;

use crate::{
    dto::normalize::{
        CORRECT_FIELDS, COUNTS_FIELDS, LEADERBOARD_FIELDS, TIME_FIELDS, decode_embedded, field,
        field_in, item_candidates, normalize_counts, normalize_item, normalize_leaderboard,
        normalize_phase, parse_seconds, resolve_correct, text_of, u32_of,
    },
    state::{
        item::{AggregateCounts, Feature, Item, ItemId, LeaderboardEntry},
        state_machine::SessionPhase,
    },
};

const PHASE_FIELDS: &[&str] = &["phase", "current_phase", "currentPhase", "status", "state"];
/// Zero-based position of the current item.
const ZERO_BASED_INDEX_FIELDS: &[&str] = &[
    "current_question_index",
    "currentQuestionIndex",
    "question_index",
    "questionIndex",
    "current_index",
    "currentIndex",
];
const ONE_BASED_INDEX_FIELDS: &[&str] = &["react_order", "reactOrder", "question_number"];
const TOTAL_FIELDS: &[&str] = &[
    "total_questions",
    "totalQuestions",
    "total_mcqs",
    "totalMcqs",
    "total_items",
    "total",
];
const CURRENT_ITEM_ID_FIELDS: &[&str] = &[
    "current_mcq_id",
    "currentMcqId",
    "current_question_id",
    "currentQuestionId",
    "mcq_id",
    "mcqId",
    "question_id",
    "questionId",
];

/// Why an authority record could not be turned into a [`RestoreSnapshot`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedRecord {
    /// The record is not a JSON object.
    #[error("state record is not a JSON object")]
    NotAnObject,
    /// No phase field was present.
    #[error("state record has no phase")]
    MissingPhase,
    /// The phase is not one of the known names for the feature.
    #[error("unknown phase `{0}`")]
    UnknownPhase(String),
}

/// Normalized view of the authority's current session state.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreSnapshot {
    /// Phase the authority reports.
    pub phase: SessionPhase,
    /// Current item, or only its id when the record carries no payload.
    pub item: Option<Item>,
    /// One-based position of the current item.
    pub index: Option<u32>,
    /// Number of items in the session.
    pub total: Option<u32>,
    /// Seconds left, possibly negative.
    pub remaining: Option<i64>,
    /// Per-option answer counts.
    pub counts: Option<AggregateCounts>,
    /// Leaderboard rows in authority order.
    pub leaderboard: Option<Vec<LeaderboardEntry>>,
}

impl RestoreSnapshot {
    /// Normalize an authority record for `feature`.
    pub fn from_value(record: &Value, feature: Feature) -> Result<Self, MalformedRecord> {
        let record = decode_embedded(record);
        if !record.is_object() {
            return Err(MalformedRecord::NotAnObject);
        }

        let raw_phase = field(&record, PHASE_FIELDS)
            .and_then(text_of)
            .ok_or(MalformedRecord::MissingPhase)?;
        let phase = normalize_phase(&raw_phase, feature)
            .ok_or_else(|| MalformedRecord::UnknownPhase(raw_phase.clone()))?;

        // The record's own `id` is the session row, so only nested payloads count as item candidates.
        let mut candidates = item_candidates(&record);
        candidates.pop();
        let item = if candidates.is_empty() {
            field(&record, CURRENT_ITEM_ID_FIELDS)
                .and_then(text_of)
                .map(|id| Item {
                    id: ItemId(id),
                    ..Item::default()
                })
        } else {
            let mut item = normalize_item(&candidates);
            if item.id.0.is_empty() {
                if let Some(id) = field(&record, CURRENT_ITEM_ID_FIELDS).and_then(text_of) {
                    item.id = ItemId(id);
                }
            }
            if item.correct.is_none() {
                item.correct = field(&record, CORRECT_FIELDS)
                    .and_then(|value| resolve_correct(value, &item.options));
            }
            Some(item)
        };

        let index = field(&record, ZERO_BASED_INDEX_FIELDS)
            .and_then(u32_of)
            .map(|zero_based| zero_based.saturating_add(1))
            .or_else(|| field(&record, ONE_BASED_INDEX_FIELDS).and_then(u32_of));

        let remaining = field(&record, TIME_FIELDS)
            .or_else(|| field_in(&candidates, TIME_FIELDS))
            .and_then(parse_seconds);

        Ok(Self {
            phase,
            item,
            index,
            total: field(&record, TOTAL_FIELDS).and_then(u32_of),
            remaining,
            counts: field(&record, COUNTS_FIELDS)
                .or_else(|| field_in(&candidates, COUNTS_FIELDS))
                .map(normalize_counts),
            leaderboard: field(&record, LEADERBOARD_FIELDS).map(normalize_leaderboard),
        })
    }
}
