//! Single normalization boundary for authority payloads.
//!
//! The authority and the broadcast channel publish the same concepts in
//! several shapes (options as arrays or keyed maps, snake or camel casing,
//! nested JSON encoded as strings, times as integers or `HH:MM:SS`). Every
//! function here accepts the loose [`serde_json::Value`] and returns the
//! canonical type, falling back to safe defaults instead of failing.

use indexmap::IndexMap;
use serde_json::Value;

use crate::state::{
    item::{AggregateCounts, Answer, Feature, Item, ItemId, LeaderboardEntry, OptionKey, ParticipantId},
    state_machine::{BattlePhase, MockPhase, SessionPhase},
};

pub(crate) const ITEM_ID_FIELDS: &[&str] = &[
    "mcq_id",
    "mcqId",
    "question_id",
    "questionId",
    "item_id",
    "itemId",
    "id",
];
const PROMPT_FIELDS: &[&str] = &[
    "question",
    "prompt",
    "mcq",
    "mcq_text",
    "mcqText",
    "question_text",
    "questionText",
    "text",
    "title",
];
const IMAGE_FIELDS: &[&str] = &[
    "image",
    "image_url",
    "imageUrl",
    "img",
    "question_image",
    "questionImage",
];
const OPTIONS_FIELDS: &[&str] = &["options", "choices", "option_map", "optionMap"];
pub(crate) const CORRECT_FIELDS: &[&str] = &[
    "correct_option",
    "correctOption",
    "correct_answer",
    "correctAnswer",
    "answer_key",
    "answerKey",
    "correct",
];
const CHOSEN_FIELDS: &[&str] = &[
    "user_answer",
    "userAnswer",
    "selected_option",
    "selectedOption",
    "chosen_option",
    "chosenOption",
];
const SKIPPED_FIELDS: &[&str] = &["skipped", "is_skipped", "isSkipped"];
const REVIEW_FIELDS: &[&str] = &[
    "marked_for_review",
    "markedForReview",
    "is_marked",
    "isMarked",
    "review",
];
const OPTION_KEY_FIELDS: &[&str] = &["key", "letter", "option_key", "optionKey", "option", "id"];
const OPTION_TEXT_FIELDS: &[&str] = &[
    "text",
    "value",
    "content",
    "option_text",
    "optionText",
    "label",
    "title",
];
pub(crate) const COUNTS_FIELDS: &[&str] = &[
    "stats",
    "counts",
    "option_counts",
    "optionCounts",
    "votes",
    "vote_counts",
    "voteCounts",
    "answer_counts",
    "answerCounts",
];
const COUNT_VALUE_FIELDS: &[&str] = &["count", "votes", "total", "value"];
pub(crate) const LEADERBOARD_FIELDS: &[&str] = &[
    "leaderboard",
    "rows",
    "entries",
    "rankings",
    "ranking",
];
const PARTICIPANT_FIELDS: &[&str] = &[
    "participant_id",
    "participantId",
    "user_id",
    "userId",
    "player_id",
    "playerId",
    "id",
];
const NAME_FIELDS: &[&str] = &[
    "display_name",
    "displayName",
    "name",
    "username",
    "user_name",
    "full_name",
    "fullName",
];
const SCORE_FIELDS: &[&str] = &["score", "points", "total_score", "totalScore"];
const RANK_FIELDS: &[&str] = &["rank", "position", "standing"];
pub(crate) const TIME_FIELDS: &[&str] = &[
    "time_left",
    "timeLeft",
    "remaining_time",
    "remainingTime",
    "remaining_seconds",
    "remainingSeconds",
    "remaining",
    "seconds",
    "time",
];
/// Keys whose value is an embedded item payload.
pub(crate) const NESTED_ITEM_FIELDS: &[&str] = &[
    "phase_json",
    "phaseJson",
    "current_question",
    "currentQuestion",
    "item",
    "question",
    "mcq",
];

/// Fold an identifier to lower snake case so `Show-Stats`, `show.stats` and `SHOW_STATS` compare equal.
pub fn fold_kind(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '-' | '.' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Decode JSON that was itself encoded as a string; other values are returned unchanged.
pub fn decode_embedded(value: &Value) -> Value {
    match value {
        Value::String(raw) => {
            let trimmed = raw.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(raw).unwrap_or(Value::Null)
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

/// First non-null value among `aliases` in a JSON object.
pub fn field<'a>(value: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    let object = value.as_object()?;
    aliases
        .iter()
        .filter_map(|alias| object.get(*alias))
        .find(|found| !found.is_null())
}

/// First non-null value among `aliases` across several candidate objects, in order.
pub fn field_in<'a>(candidates: &'a [Value], aliases: &[&str]) -> Option<&'a Value> {
    candidates
        .iter()
        .find_map(|candidate| field(candidate, aliases))
}

/// Render scalars as text; objects are searched for a text-like field.
pub fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(_) => field(value, OPTION_TEXT_FIELDS).and_then(text_of),
        _ => None,
    }
}

/// Interpret integers, floats and numeric strings as an unsigned count.
pub fn u32_of(value: &Value) -> Option<u32> {
    let wide = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.floor() as i64))?,
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.floor() as i64))?
        }
        _ => return None,
    };
    Some(u32::try_from(wide.max(0)).unwrap_or(u32::MAX))
}

/// Interpret booleans, `0`/`1` and `"true"`/`"false"` strings.
pub fn bool_of(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parse a duration in seconds from an integer, a numeric string, `MM:SS` or `HH:MM:SS`.
///
/// Negative values are preserved so callers can detect an authority clock
/// that already ran out.
pub fn parse_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        Value::String(raw) => {
            let raw = raw.trim();
            if raw.contains(':') {
                let (negative, body) = match raw.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, raw),
                };
                let parts = body
                    .split(':')
                    .map(|part| part.trim().parse::<i64>().ok().filter(|p| *p >= 0))
                    .collect::<Option<Vec<_>>>()?;
                let total = match parts.as_slice() {
                    [minutes, seconds] => minutes * 60 + seconds,
                    [hours, minutes, seconds] => hours * 3600 + minutes * 60 + seconds,
                    _ => return None,
                };
                Some(if negative { -total } else { total })
            } else {
                raw.parse::<i64>()
                    .ok()
                    .or_else(|| raw.parse::<f64>().ok().map(|f| f.floor() as i64))
            }
        }
        _ => None,
    }
}

/// Normalize any supported option shape into an ordered `A, B, C, ...` map.
pub fn normalize_options(value: &Value) -> IndexMap<OptionKey, String> {
    match decode_embedded(value) {
        Value::Array(entries) => entries
            .iter()
            .enumerate()
            .filter_map(|(position, entry)| {
                let key = match entry {
                    Value::Object(_) => field(entry, OPTION_KEY_FIELDS)
                        .and_then(text_of)
                        .and_then(|raw| OptionKey::canonical(&raw))
                        .unwrap_or_else(|| OptionKey::from_position(position)),
                    _ => OptionKey::from_position(position),
                };
                let text = match entry {
                    Value::Object(_) => field(entry, OPTION_TEXT_FIELDS).and_then(text_of),
                    other => text_of(other),
                }?;
                Some((key, text))
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(raw_key, text)| {
                Some((OptionKey::canonical(raw_key)?, text_of(text)?))
            })
            .collect(),
        _ => IndexMap::new(),
    }
}

/// Collect flat `option_a` / `optionB` columns from a row-shaped item.
fn flat_options(value: &Value) -> IndexMap<OptionKey, String> {
    let Some(object) = value.as_object() else {
        return IndexMap::new();
    };
    let mut options = object
        .iter()
        .filter(|(key, _)| {
            let lowered = key.to_ascii_lowercase();
            lowered.starts_with("option")
                && !OPTIONS_FIELDS.iter().any(|alias| alias.eq_ignore_ascii_case(key))
        })
        .filter_map(|(key, text)| {
            let canonical = OptionKey::canonical(key)?;
            (canonical.as_str().len() == 1).then_some((canonical, text_of(text)?))
        })
        .collect::<IndexMap<_, _>>();
    options.sort_keys();
    options
}

/// Resolve a correct-option reference given as a key, a zero-based index or the option text.
pub fn resolve_correct(value: &Value, options: &IndexMap<OptionKey, String>) -> Option<OptionKey> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(OptionKey::from_position),
        Value::String(raw) => {
            if let Some(key) = OptionKey::canonical(raw).filter(|key| {
                options.is_empty() || options.contains_key(key)
            }) {
                return Some(key);
            }
            options
                .iter()
                .find(|(_, text)| text.trim() == raw.trim())
                .map(|(key, _)| key.clone())
        }
        Value::Object(_) => field(value, OPTION_KEY_FIELDS)
            .and_then(|inner| resolve_correct(inner, options)),
        _ => None,
    }
}

/// Candidate objects that may carry item fields, most specific first.
///
/// Nested payloads (`phase_json`, `question`, ...) win over the envelope's own
/// fields; string-encoded JSON is decoded.
pub fn item_candidates(data: &Value) -> Vec<Value> {
    let mut candidates = NESTED_ITEM_FIELDS
        .iter()
        .filter_map(|alias| data.get(*alias))
        .map(decode_embedded)
        .filter(Value::is_object)
        .collect::<Vec<_>>();
    if data.is_object() {
        candidates.push(data.clone());
    }
    candidates
}

/// Normalize an item from a list of candidate objects (see [`item_candidates`]).
///
/// Missing fields become empty defaults so rendering never fails on a partial payload.
pub fn normalize_item(candidates: &[Value]) -> Item {
    let options = field_in(candidates, OPTIONS_FIELDS)
        .map(normalize_options)
        .filter(|options| !options.is_empty())
        .or_else(|| {
            candidates
                .iter()
                .map(flat_options)
                .find(|options| !options.is_empty())
        })
        .unwrap_or_default();

    let correct = field_in(candidates, CORRECT_FIELDS).and_then(|value| resolve_correct(value, &options));

    let answer = Answer {
        choice: field_in(candidates, CHOSEN_FIELDS)
            .and_then(text_of)
            .and_then(|raw| OptionKey::canonical(&raw)),
        skipped: field_in(candidates, SKIPPED_FIELDS)
            .and_then(bool_of)
            .unwrap_or(false),
        marked_for_review: field_in(candidates, REVIEW_FIELDS)
            .and_then(bool_of)
            .unwrap_or(false),
    };

    Item {
        id: field_in(candidates, ITEM_ID_FIELDS)
            .and_then(text_of)
            .map(ItemId)
            .unwrap_or_default(),
        prompt: candidates
            .iter()
            .filter_map(|candidate| field(candidate, PROMPT_FIELDS))
            .find_map(|value| value.as_str().map(str::to_string))
            .unwrap_or_default(),
        image: field_in(candidates, IMAGE_FIELDS)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string),
        options,
        correct,
        answer,
    }
}

/// Normalize per-option counts from a keyed map, a positional array or an array of rows.
pub fn normalize_counts(value: &Value) -> AggregateCounts {
    let value = decode_embedded(value);
    let per_option = match &value {
        Value::Object(map) => {
            if let Some(nested) = field(&value, COUNTS_FIELDS) {
                return normalize_counts(nested);
            }
            map.iter()
                .filter(|(key, _)| !matches!(fold_kind(key).as_str(), "total" | "sum"))
                .filter_map(|(key, count)| {
                    Some((OptionKey::canonical(key)?, u32_of(count).unwrap_or(0)))
                })
                .collect()
        }
        Value::Array(entries) => entries
            .iter()
            .enumerate()
            .map(|(position, entry)| match entry {
                Value::Object(_) => {
                    let key = field(entry, OPTION_KEY_FIELDS)
                        .and_then(text_of)
                        .and_then(|raw| OptionKey::canonical(&raw))
                        .unwrap_or_else(|| OptionKey::from_position(position));
                    let count = field(entry, COUNT_VALUE_FIELDS)
                        .and_then(u32_of)
                        .unwrap_or(0);
                    (key, count)
                }
                other => (OptionKey::from_position(position), u32_of(other).unwrap_or(0)),
            })
            .collect(),
        _ => IndexMap::new(),
    };
    AggregateCounts { per_option }
}

/// Normalize leaderboard rows, keeping the authority's order and rank.
///
/// Rows without a rank take their one-based position; ranks are never recomputed from scores.
pub fn normalize_leaderboard(value: &Value) -> Vec<LeaderboardEntry> {
    let value = decode_embedded(value);
    match &value {
        Value::Object(_) => field(&value, LEADERBOARD_FIELDS)
            .map(normalize_leaderboard)
            .unwrap_or_default(),
        Value::Array(rows) => rows
            .iter()
            .filter(|row| row.is_object())
            .enumerate()
            .map(|(position, row)| {
                let participant_id = field(row, PARTICIPANT_FIELDS)
                    .and_then(text_of)
                    .unwrap_or_default();
                let display_name = field(row, NAME_FIELDS)
                    .and_then(text_of)
                    .unwrap_or_else(|| participant_id.clone());
                LeaderboardEntry {
                    participant_id: ParticipantId(participant_id),
                    display_name,
                    score: field(row, SCORE_FIELDS)
                        .and_then(|score| match score {
                            Value::Number(n) => n.as_f64(),
                            Value::String(s) => s.trim().parse().ok(),
                            _ => None,
                        })
                        .unwrap_or(0.0),
                    rank: field(row, RANK_FIELDS)
                        .and_then(u32_of)
                        .unwrap_or_else(|| u32::try_from(position + 1).unwrap_or(u32::MAX)),
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Map an authority phase name onto the feature's phase set.
pub fn normalize_phase(raw: &str, feature: Feature) -> Option<SessionPhase> {
    let folded = fold_kind(raw);
    if matches!(
        folded.as_str(),
        "waiting" | "lobby" | "not_started" | "pending" | "awaiting"
    ) {
        return Some(SessionPhase::Awaiting);
    }

    let phase = match feature {
        Feature::Battle => SessionPhase::Battle(match folded.as_str() {
            "question" | "mcq" | "new_question" | "new_item" | "live" => BattlePhase::Question,
            "stats" | "results" | "result" | "reveal" | "show_stats" | "reveal_results" => {
                BattlePhase::Results
            }
            "leaderboard" | "show_leaderboard" | "update_leaderboard" | "scores" => {
                BattlePhase::Leaderboard
            }
            "ended" | "end" | "finished" | "completed" | "session_end" | "battle_end" => {
                BattlePhase::Ended
            }
            _ => return None,
        }),
        Feature::MockTest => SessionPhase::MockTest(match folded.as_str() {
            "in_progress" | "started" | "active" | "question" | "ongoing" => MockPhase::InProgress,
            "section_boundary" | "section_end" | "boundary" | "section_complete" => {
                MockPhase::SectionBoundary
            }
            "completed" | "finished" | "submitted" | "ended" => MockPhase::Completed,
            _ => return None,
        }),
    };
    Some(phase)
}
