//! Typed form of the messages published on a session's broadcast channel.

use serde::Deserialize;
use serde_json::Value;

use crate::{
    dto::normalize::{
        COUNTS_FIELDS, CORRECT_FIELDS, ITEM_ID_FIELDS, LEADERBOARD_FIELDS, TIME_FIELDS, bool_of,
        decode_embedded, field, field_in, fold_kind, item_candidates, normalize_counts, normalize_item,
        normalize_leaderboard, parse_seconds, resolve_correct, text_of, u32_of,
    },
    state::item::{AggregateCounts, Item, ItemId, LeaderboardEntry, OptionKey},
};

const INDEX_FIELDS: &[&str] = &[
    "react_order",
    "reactOrder",
    "question_number",
    "questionNumber",
    "order",
    "index",
];
const TOTAL_FIELDS: &[&str] = &[
    "total_mcqs",
    "totalMcqs",
    "total_questions",
    "totalQuestions",
    "total_items",
    "total",
];
const REPEAT_FIELDS: &[&str] = &["repeat", "is_repeat", "isRepeat"];
const PARTICIPANT_COUNT_FIELDS: &[&str] = &[
    "participant_count",
    "participantCount",
    "participants",
    "players",
];

/// Raw `{type, data}` envelope as it travels on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Event type name in any supported spelling.
    #[serde(rename = "type", alias = "event")]
    pub kind: String,
    /// Loosely shaped payload.
    #[serde(default, alias = "payload")]
    pub data: Value,
}

/// Canonical event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A question or item is pushed.
    NewItem,
    /// Results of the current item are revealed.
    RevealResults,
    /// Leaderboard rows changed.
    UpdateLeaderboard,
    /// Remaining time correction.
    TimerSync,
    /// The authority ended the session.
    SessionEnd,
    /// Anything else.
    Unrecognized,
}

impl EventKind {
    /// Resolve an event name, tolerating the authority's historical aliases.
    pub fn from_name(raw: &str) -> Self {
        match fold_kind(raw).as_str() {
            "new_item" | "new_question" | "question" | "next_question" | "new_mcq" => {
                EventKind::NewItem
            }
            "reveal_results" | "show_stats" | "stats" | "results" | "reveal" => {
                EventKind::RevealResults
            }
            "update_leaderboard" | "leaderboard" | "show_leaderboard" => {
                EventKind::UpdateLeaderboard
            }
            "timer_sync" | "timer" | "time_sync" => EventKind::TimerSync,
            "session_end" | "battle_end" | "end" | "ended" | "battle_ended" => {
                EventKind::SessionEnd
            }
            _ => EventKind::Unrecognized,
        }
    }

    /// Canonical snake_case name, used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewItem => "new_item",
            EventKind::RevealResults => "reveal_results",
            EventKind::UpdateLeaderboard => "update_leaderboard",
            EventKind::TimerSync => "timer_sync",
            EventKind::SessionEnd => "session_end",
            EventKind::Unrecognized => "unrecognized",
        }
    }
}

/// A new (or explicitly repeated) item pushed by the authority.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItemEvent {
    /// Normalized item.
    pub item: Item,
    /// One-based position of the item in the session.
    pub index: Option<u32>,
    /// Number of items in the session.
    pub total: Option<u32>,
    /// Seconds left on the item.
    pub remaining: Option<i64>,
    /// The authority re-sent the current item on purpose.
    pub repeat: bool,
}

/// Authorization to reveal aggregate results for an item.
#[derive(Debug, Clone, PartialEq)]
pub struct RevealEvent {
    /// Item the reveal refers to, when the authority names it.
    pub item_id: Option<ItemId>,
    /// Correct option, when disclosed.
    pub correct: Option<OptionKey>,
    /// Per-option answer counts.
    pub counts: AggregateCounts,
    /// Rows bundled with the reveal.
    pub leaderboard: Option<Vec<LeaderboardEntry>>,
    /// Seconds the results stay on screen.
    pub remaining: Option<i64>,
}

/// Fresh leaderboard ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderboardEvent {
    /// Rows in authority order.
    pub rows: Vec<LeaderboardEntry>,
    /// Connected participants, when reported.
    pub participant_count: Option<u32>,
    /// Seconds the leaderboard stays on screen.
    pub remaining: Option<i64>,
}

/// Parsed channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// See [`NewItemEvent`].
    NewItem(NewItemEvent),
    /// See [`RevealEvent`].
    RevealResults(RevealEvent),
    /// See [`LeaderboardEvent`].
    UpdateLeaderboard(LeaderboardEvent),
    /// Authoritative remaining time; `None` when the payload carried no usable value.
    TimerSync(Option<i64>),
    /// The session is over.
    SessionEnd {
        /// Final rows, when sent with the end.
        leaderboard: Option<Vec<LeaderboardEntry>>,
    },
    /// Event name that no handler recognizes.
    Unrecognized(String),
}

impl ChannelEvent {
    /// Parse a raw channel frame. Frames that are not an envelope become [`ChannelEvent::Unrecognized`].
    pub fn from_json_str(raw: &str) -> Self {
        match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => Self::from_envelope(envelope),
            Err(_) => ChannelEvent::Unrecognized(raw.chars().take(64).collect()),
        }
    }

    /// Normalize an already decoded envelope.
    pub fn from_envelope(envelope: Envelope) -> Self {
        let data = decode_embedded(&envelope.data);
        let candidates = item_candidates(&data);
        let remaining = field_in(&candidates, TIME_FIELDS).and_then(parse_seconds);

        match EventKind::from_name(&envelope.kind) {
            EventKind::NewItem => ChannelEvent::NewItem(NewItemEvent {
                item: normalize_item(&candidates),
                index: field_in(&candidates, INDEX_FIELDS).and_then(u32_of),
                total: field_in(&candidates, TOTAL_FIELDS).and_then(u32_of),
                remaining,
                repeat: field(&data, REPEAT_FIELDS)
                    .and_then(bool_of)
                    .unwrap_or(false),
            }),
            EventKind::RevealResults => {
                let item = normalize_item(&candidates);
                let correct = item.correct.clone().or_else(|| {
                    field_in(&candidates, CORRECT_FIELDS)
                        .and_then(|value| resolve_correct(value, &item.options))
                });
                ChannelEvent::RevealResults(RevealEvent {
                    item_id: field_in(&candidates, ITEM_ID_FIELDS)
                        .and_then(text_of)
                        .map(ItemId),
                    correct,
                    counts: field_in(&candidates, COUNTS_FIELDS)
                        .map(normalize_counts)
                        .unwrap_or_default(),
                    leaderboard: field_in(&candidates, LEADERBOARD_FIELDS).map(normalize_leaderboard),
                    remaining,
                })
            }
            EventKind::UpdateLeaderboard => ChannelEvent::UpdateLeaderboard(LeaderboardEvent {
                rows: match &data {
                    Value::Array(_) => normalize_leaderboard(&data),
                    _ => field(&data, LEADERBOARD_FIELDS)
                        .map(normalize_leaderboard)
                        .unwrap_or_default(),
                },
                participant_count: field(&data, PARTICIPANT_COUNT_FIELDS).and_then(u32_of),
                remaining,
            }),
            EventKind::TimerSync => ChannelEvent::TimerSync(match &data {
                Value::Number(_) | Value::String(_) => parse_seconds(&data),
                _ => remaining,
            }),
            EventKind::SessionEnd => ChannelEvent::SessionEnd {
                leaderboard: field(&data, LEADERBOARD_FIELDS).map(normalize_leaderboard),
            },
            EventKind::Unrecognized => ChannelEvent::Unrecognized(envelope.kind),
        }
    }

    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::NewItem(_) => EventKind::NewItem,
            ChannelEvent::RevealResults(_) => EventKind::RevealResults,
            ChannelEvent::UpdateLeaderboard(_) => EventKind::UpdateLeaderboard,
            ChannelEvent::TimerSync(_) => EventKind::TimerSync,
            ChannelEvent::SessionEnd { .. } => EventKind::SessionEnd,
            ChannelEvent::Unrecognized(_) => EventKind::Unrecognized,
        }
    }
}
