/// Answer recording, local selection and one-shot submission.
pub mod answer_submitter;
/// Reconnect delays shared by long-lived upstream work.
pub mod backoff;
/// Per-topic upstream channel subscriptions and duplicate suppression.
pub mod channel_adapter;
/// OpenAPI documentation generation.
pub mod documentation;
/// Participant count and leaderboard polling cadence.
pub mod participant_poller;
/// Channel events and clock expiry applied to the phase machine.
pub mod phase_controller;
/// Late-join state reconstruction from the authority.
pub mod restore_loader;
/// Mock test sections: boundaries, batch loads, navigation and finalize.
pub mod section_navigator;
/// Single-owner loop driving one entered session.
pub mod session_runner;
/// Enter, command and leave entry points used by the routes.
pub mod session_service;
/// Server-Sent Events message generation.
pub mod sse_events;
/// Server-Sent Events broadcasting service.
pub mod sse_service;
