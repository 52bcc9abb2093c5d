//! Error types of the HTTP authority client.

use reqwest::StatusCode;
use thiserror::Error;

use crate::dao::authority::AuthorityError;

/// Convenient result alias returning [`HttpAuthorityError`] failures.
pub type HttpResult<T> = Result<T, HttpAuthorityError>;

/// Failures that can occur while talking to the authority.
#[derive(Debug, Error)]
pub enum HttpAuthorityError {
    /// Required environment variable is missing.
    #[error("missing authority environment variable `{var}`")]
    MissingEnvVar {
        /// Name of the variable.
        var: &'static str,
    },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build authority client")]
    ClientBuilder {
        /// Builder failure.
        #[source]
        source: reqwest::Error,
    },
    /// A request could not be sent.
    #[error("failed to send authority request to `{path}`")]
    RequestSend {
        /// Request path.
        path: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// The authority returned an unexpected status code.
    #[error("unexpected authority response status {status} for `{path}`")]
    RequestStatus {
        /// Request path.
        path: String,
        /// Status received.
        status: StatusCode,
    },
    /// Response payload could not be parsed into JSON.
    #[error("failed to decode authority response for `{path}`")]
    DecodeResponse {
        /// Request path.
        path: String,
        /// Body read or parse failure.
        #[source]
        source: reqwest::Error,
    },
    /// JSON body did not match the expected shape.
    #[error("failed to deserialize authority value for `{path}`")]
    DeserializeValue {
        /// Request path.
        path: String,
        /// Shape mismatch.
        #[source]
        source: serde_json::Error,
    },
}

impl HttpAuthorityError {
    /// Endpoint path the failure relates to, when there is one.
    pub fn path(&self) -> Option<&str> {
        match self {
            HttpAuthorityError::RequestSend { path, .. }
            | HttpAuthorityError::RequestStatus { path, .. }
            | HttpAuthorityError::DecodeResponse { path, .. }
            | HttpAuthorityError::DeserializeValue { path, .. } => Some(path),
            HttpAuthorityError::MissingEnvVar { .. } | HttpAuthorityError::ClientBuilder { .. } => {
                None
            }
        }
    }
}

impl From<HttpAuthorityError> for AuthorityError {
    fn from(err: HttpAuthorityError) -> Self {
        match err {
            HttpAuthorityError::RequestStatus { path, status } => AuthorityError::Status {
                path,
                status: status.as_u16(),
            },
            HttpAuthorityError::DecodeResponse { .. }
            | HttpAuthorityError::DeserializeValue { .. } => AuthorityError::Decode {
                path: err.path().unwrap_or_default().to_string(),
                source: Box::new(err),
            },
            other => AuthorityError::unavailable(other.to_string(), other),
        }
    }
}
