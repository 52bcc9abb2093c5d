use utoipa::OpenApi;

/// OpenAPI description of the render bridge.
#[derive(OpenApi)]
/// Aggregated OpenAPI specification of the render bridge.
#[openapi(
    paths(
        crate::routes::session::enter_session,
        crate::routes::session::get_session,
        crate::routes::session::leave_session,
        crate::routes::session::answer,
        crate::routes::session::select,
        crate::routes::session::submit_current,
        crate::routes::session::boundary,
        crate::routes::session::jump,
        crate::routes::sse::session_stream,
    ),
    components(
        schemas(
            crate::dto::session::EnterSessionRequest,
            crate::dto::session::AnswerRequest,
            crate::dto::session::SelectRequest,
            crate::dto::session::BoundaryRequest,
            crate::dto::session::BoundaryChoice,
            crate::dto::session::JumpRequest,
            crate::dto::session::SessionView,
            crate::dto::sse::Handshake,
            crate::dto::sse::SessionClosedEvent,
        )
    ),
    tags(
        (name = "session", description = "Participant session lifecycle and actions"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
pub struct ApiDoc;
