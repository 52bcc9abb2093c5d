use std::time::SystemTime;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Live channel envelopes and events.
pub mod events;
/// Tolerant decoding of items, options, counts, leaderboards and times.
pub mod normalize;
/// Render-facing phase names.
pub mod phase;
/// Authority state records used on (re)entry.
pub mod restore;
/// Mock-test section requests and responses.
pub mod section;
/// Session view and request bodies.
pub mod session;
/// Server-Sent Events payloads.
pub mod sse;
/// Answer submissions and count bodies.
pub mod submission;

fn format_system_time(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}
