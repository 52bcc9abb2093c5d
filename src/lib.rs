//! Library crate for live-exam-sync, exposing modules for binaries and integration tests.

pub mod config;
/// Authority clients and broadcast channel transports.
pub mod dao;
/// Wire shapes and the normalization boundary for authority payloads.
pub mod dto;
/// Service and HTTP error types.
pub mod error;
/// HTTP routes of the render bridge.
pub mod routes;
/// Session logic and the loops that drive it.
pub mod services;
/// Shared application state and per-session state.
pub mod state;
