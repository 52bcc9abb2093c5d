use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::{
    dao::authority::{Authority, AuthorityResult},
    dto::{
        section::SectionRequest,
        submission::{AnswerSubmission, CompleteRequest, ParticipantCountBody},
    },
    state::item::{ParticipantId, SessionId},
};

use super::{
    config::HttpAuthorityConfig,
    error::{HttpAuthorityError, HttpResult},
};

/// [`Authority`] implementation over the authority's REST endpoints.
#[derive(Clone)]
pub struct HttpAuthority {
    client: Client,
    base_url: Arc<str>,
    api_key: Option<Arc<str>>,
}

impl HttpAuthority {
    /// Build the HTTP client for the configured authority.
    pub fn connect(config: HttpAuthorityConfig) -> HttpResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| HttpAuthorityError::ClientBuilder { source })?;

        Ok(Self {
            client,
            base_url: Arc::<str>::from(config.base_url.trim_end_matches('/')),
            api_key: config.api_key.map(Arc::<str>::from),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        let builder = self.client.request(method, url);
        if let Some(ref key) = self.api_key {
            builder.bearer_auth(key.as_ref())
        } else {
            builder
        }
    }

    /// Send a request and decode its JSON body; `404` and `204` map to `None`.
    async fn optional_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> HttpResult<Option<Value>> {
        let mut builder = self.request(method, path);
        if let Some(ref body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|source| HttpAuthorityError::RequestSend {
                path: path.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|source| HttpAuthorityError::DecodeResponse {
                        path: path.to_string(),
                        source,
                    })?;
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                serde_json::from_slice(&bytes).map(Some).map_err(|source| {
                    HttpAuthorityError::DeserializeValue {
                        path: path.to_string(),
                        source,
                    }
                })
            }
            other => Err(HttpAuthorityError::RequestStatus {
                path: path.to_string(),
                status: other,
            }),
        }
    }

    async fn post_for_json<T>(&self, path: &str, body: &T) -> HttpResult<Option<Value>>
    where
        T: Serialize,
    {
        let body = serde_json::to_value(body).map_err(|source| {
            HttpAuthorityError::DeserializeValue {
                path: path.to_string(),
                source,
            }
        })?;
        self.optional_json(Method::POST, path, Some(body)).await
    }

    /// Read a count published either bare or as `{count}`; no content counts as zero.
    async fn get_count(&self, path: &str) -> HttpResult<u32> {
        let Some(body) = self.optional_json(Method::GET, path, None).await? else {
            return Ok(0);
        };
        serde_json::from_value::<ParticipantCountBody>(body)
            .map(|body| body.count())
            .map_err(|source| HttpAuthorityError::DeserializeValue {
                path: path.to_string(),
                source,
            })
    }

    async fn post_json<T>(&self, path: &str, body: &T) -> HttpResult<()>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|source| HttpAuthorityError::RequestSend {
                path: path.to_string(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(HttpAuthorityError::RequestStatus {
                path: path.to_string(),
                status: response.status(),
            })
        }
    }
}

fn session_path(session_id: &SessionId, suffix: &str) -> String {
    format!("sessions/{}/{}", session_id, suffix)
}

impl Authority for HttpAuthority {
    fn fetch_current_state(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'static, AuthorityResult<Option<Value>>> {
        let authority = self.clone();
        Box::pin(async move {
            let path = session_path(&session_id, "state");
            authority
                .optional_json(Method::GET, &path, None)
                .await
                .map_err(Into::into)
        })
    }

    fn submit_answer(&self, submission: AnswerSubmission) -> BoxFuture<'static, AuthorityResult<()>> {
        let authority = self.clone();
        Box::pin(async move {
            let path = session_path(&submission.session_id, "answers");
            authority
                .post_json(&path, &submission)
                .await
                .map_err(Into::into)
        })
    }

    fn load_section(
        &self,
        session_id: SessionId,
        request: SectionRequest,
    ) -> BoxFuture<'static, AuthorityResult<Option<Value>>> {
        let authority = self.clone();
        Box::pin(async move {
            let path = session_path(&session_id, "sections");
            authority
                .post_for_json(&path, &request)
                .await
                .map_err(Into::into)
        })
    }

    fn mark_complete(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> BoxFuture<'static, AuthorityResult<()>> {
        let authority = self.clone();
        Box::pin(async move {
            let path = session_path(&session_id, "complete");
            let body = CompleteRequest {
                participant_id: &participant_id,
            };
            authority.post_json(&path, &body).await.map_err(Into::into)
        })
    }

    fn participant_count(&self, session_id: SessionId) -> BoxFuture<'static, AuthorityResult<u32>> {
        let authority = self.clone();
        Box::pin(async move {
            let path = session_path(&session_id, "participants/count");
            authority.get_count(&path).await.map_err(Into::into)
        })
    }

    fn leaderboard(&self, session_id: SessionId) -> BoxFuture<'static, AuthorityResult<Value>> {
        let authority = self.clone();
        Box::pin(async move {
            let path = session_path(&session_id, "leaderboard");
            authority
                .optional_json(Method::GET, &path, None)
                .await
                .map(|body| body.unwrap_or(Value::Null))
                .map_err(Into::into)
        })
    }
}
