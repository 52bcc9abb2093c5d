use std::error::Error;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::{
    dto::{section::SectionRequest, submission::AnswerSubmission},
    state::item::{ParticipantId, SessionId},
};

/// Result alias for authority operations.
pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// Error raised by authority clients regardless of the transport.
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The call never produced a response.
    #[error("authority unavailable: {message}")]
    Unavailable {
        /// What was being attempted.
        message: String,
        /// Transport failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The authority answered with a non-success status.
    #[error("authority rejected `{path}` with status {status}")]
    Status {
        /// Request path.
        path: String,
        /// HTTP status code.
        status: u16,
    },
    /// The response body could not be decoded.
    #[error("authority returned an undecodable body for `{path}`")]
    Decode {
        /// Request path.
        path: String,
        /// Decoder failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl AuthorityError {
    /// Construct an unavailable error from any transport failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        AuthorityError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}

/// Remote system of record for scoring, ordering and timing.
///
/// Bodies are returned as loose JSON; the service layer owns normalization.
pub trait Authority: Send + Sync {
    /// Current state record of a session, `None` for a fresh session.
    fn fetch_current_state(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'static, AuthorityResult<Option<Value>>>;
    /// Record one answer.
    fn submit_answer(&self, submission: AnswerSubmission) -> BoxFuture<'static, AuthorityResult<()>>;
    /// Next (or targeted) section batch, `None` when the authority answered with no content.
    fn load_section(
        &self,
        session_id: SessionId,
        request: SectionRequest,
    ) -> BoxFuture<'static, AuthorityResult<Option<Value>>>;
    /// Mark the participant's attempt complete.
    fn mark_complete(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> BoxFuture<'static, AuthorityResult<()>>;
    /// Participants currently in the session.
    fn participant_count(&self, session_id: SessionId) -> BoxFuture<'static, AuthorityResult<u32>>;
    /// Raw leaderboard rows.
    fn leaderboard(&self, session_id: SessionId) -> BoxFuture<'static, AuthorityResult<Value>>;
}
