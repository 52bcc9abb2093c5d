//! Mock-test section loading: request body and normalized response.

use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::{
    dto::normalize::{
        TIME_FIELDS, bool_of, decode_embedded, field, normalize_item, parse_seconds, text_of,
        u32_of,
    },
    state::{
        item::{Item, ItemId, ParticipantId, SessionId},
        session::SectionInfo,
    },
};

const ITEMS_FIELDS: &[&str] = &["items", "questions", "mcqs", "batch"];
const SECTION_ID_FIELDS: &[&str] = &["section_id", "sectionId", "section"];
const SECTION_NUMBER_FIELDS: &[&str] = &["section_number", "sectionNumber", "section_no"];
const TOTAL_SECTIONS_FIELDS: &[&str] = &["total_sections", "totalSections", "sections_count"];
const START_ITEM_FIELDS: &[&str] = &[
    "current_item_id",
    "currentItemId",
    "current_mcq_id",
    "currentMcqId",
    "start_item_id",
];
const EXHAUSTED_FIELDS: &[&str] = &["no_more_sections", "noMoreSections", "exhausted"];

/// Where a section load should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionTarget {
    /// The section after the current one.
    Next,
    /// The section containing this item.
    Item(ItemId),
}

impl Serialize for SectionTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SectionTarget::Next => serializer.serialize_str("next"),
            SectionTarget::Item(id) => serializer.serialize_str(&id.0),
        }
    }
}

/// Body of a section load request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SectionRequest {
    /// Participant taking the attempt.
    pub participant_id: ParticipantId,
    /// Next section, or the section holding an item.
    pub target: SectionTarget,
    /// Remaining time on the section clock when the request was issued.
    pub remaining_secs: u32,
}

/// Items of a freshly loaded section.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionBatch {
    /// Items in section order.
    pub items: Vec<Item>,
    /// Section metadata.
    pub section: SectionInfo,
    /// Seconds left on the section, when the authority sends it.
    pub remaining: Option<i64>,
    /// Item to start on; the first item when absent.
    pub start_item: Option<ItemId>,
}

/// Result of a section load.
#[derive(Debug, Clone, PartialEq)]
pub enum SectionOutcome {
    /// A section to install.
    Batch(SectionBatch),
    /// The authority has nothing left for this attempt.
    NoMoreSections,
}

/// Section response that can be neither a batch nor an explicit end.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedSection {
    /// The body is not a JSON object.
    #[error("section response is not a JSON object")]
    NotAnObject,
    /// The body has no items.
    #[error("section response carries no items")]
    Empty,
}

impl SectionOutcome {
    /// Normalize a section response body; `None` means the authority answered with no content.
    pub fn from_body(body: Option<&Value>, session_id: &SessionId) -> Result<Self, MalformedSection> {
        let Some(body) = body else {
            return Ok(SectionOutcome::NoMoreSections);
        };
        let body = decode_embedded(body);
        let (envelope, items) = match &body {
            Value::Array(items) => (Value::Null, items.clone()),
            Value::Object(_) => {
                if field(&body, EXHAUSTED_FIELDS).and_then(bool_of) == Some(true) {
                    return Ok(SectionOutcome::NoMoreSections);
                }
                let items = field(&body, ITEMS_FIELDS)
                    .map(decode_embedded)
                    .and_then(|items| items.as_array().cloned())
                    .unwrap_or_default();
                (body.clone(), items)
            }
            _ => return Err(MalformedSection::NotAnObject),
        };

        let items = items
            .into_iter()
            .filter(Value::is_object)
            .map(|row| normalize_item(&[row]))
            .filter(|item| !item.id.0.is_empty())
            .collect::<Vec<_>>();
        if items.is_empty() {
            return Err(MalformedSection::Empty);
        }

        let section = SectionInfo {
            id: field(&envelope, SECTION_ID_FIELDS)
                .and_then(text_of)
                .unwrap_or_else(|| session_id.0.clone()),
            number: field(&envelope, SECTION_NUMBER_FIELDS).and_then(u32_of),
            total_sections: field(&envelope, TOTAL_SECTIONS_FIELDS).and_then(u32_of),
        };

        Ok(SectionOutcome::Batch(SectionBatch {
            items,
            section,
            remaining: field(&envelope, TIME_FIELDS).and_then(parse_seconds),
            start_item: field(&envelope, START_ITEM_FIELDS)
                .and_then(text_of)
                .map(ItemId),
        }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn session() -> SessionId {
        SessionId::from("attempt-1")
    }

    #[test]
    fn batch_with_section_metadata() {
        let body = json!({
            "section_id": 12,
            "section_number": 2,
            "total_sections": 3,
            "remaining_time": "29:30",
            "questions": [
                {"id": "q1", "question": "one", "options": ["x", "y"]},
                {"id": "q2", "question": "two", "options": ["x", "y"], "user_answer": "b"}
            ]
        });
        let SectionOutcome::Batch(batch) = SectionOutcome::from_body(Some(&body), &session()).expect("batch") else {
            panic!("expected a batch");
        };
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.section.id, "12");
        assert_eq!(batch.section.number, Some(2));
        assert!(!batch.section.is_last());
        assert_eq!(batch.remaining, Some(1770));
        assert_eq!(batch.items[1].answer.choice.as_ref().map(|k| k.as_str()), Some("B"));
    }

    #[test]
    fn explicit_and_empty_ends() {
        assert_eq!(
            SectionOutcome::from_body(None, &session()),
            Ok(SectionOutcome::NoMoreSections)
        );
        assert_eq!(
            SectionOutcome::from_body(Some(&json!({"no_more_sections": true})), &session()),
            Ok(SectionOutcome::NoMoreSections)
        );
        assert_eq!(
            SectionOutcome::from_body(Some(&json!({"items": []})), &session()),
            Err(MalformedSection::Empty)
        );
        assert_eq!(
            SectionOutcome::from_body(Some(&json!(7)), &session()),
            Err(MalformedSection::NotAnObject)
        );
    }

    #[test]
    fn target_serializes_as_plain_string() {
        let request = SectionRequest {
            participant_id: ParticipantId::from("p1"),
            target: SectionTarget::Next,
            remaining_secs: 90,
        };
        let value = serde_json::to_value(&request).expect("serializable");
        assert_eq!(value["target"], json!("next"));

        let jump = serde_json::to_value(SectionTarget::Item(ItemId::from("q7"))).expect("serializable");
        assert_eq!(jump, json!("q7"));
    }
}
