use std::time::Duration;

use super::error::{HttpAuthorityError, HttpResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration describing how to reach the authority over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthorityConfig {
    /// Root URL of the authority API.
    pub base_url: String,
    /// Bearer token sent with every request.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl HttpAuthorityConfig {
    /// Construct a configuration from an explicit base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Attach a bearer token sent with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Build a configuration by reading the expected environment variables.
    pub fn from_env() -> HttpResult<Self> {
        let base_url = std::env::var("AUTHORITY_BASE_URL").map_err(|_| {
            HttpAuthorityError::MissingEnvVar {
                var: "AUTHORITY_BASE_URL",
            }
        })?;

        let mut config = Self::new(base_url);
        if let Some(api_key) = std::env::var("AUTHORITY_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
        {
            config = config.with_api_key(api_key);
        }

        Ok(config)
    }
}
