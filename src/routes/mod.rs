use axum::Router;

use crate::state::SharedState;

/// Swagger UI.
pub mod docs;
/// Session commands and snapshots.
pub mod session;
/// Server-Sent Events stream.
pub mod sse;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = session::router().merge(sse::router());

    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}
