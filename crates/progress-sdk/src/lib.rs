//! Clients for the services that persist learner progress.
//!
//! The simulator host needs three collaborators: the map catalog (to turn a
//! map key into its id), the completion store (to record finished maps), and
//! a small local store remembering the last opened level. Each is a trait with
//! an HTTP- or file-backed adapter plus an in-memory one for tests and
//! offline wiring.

pub mod catalog;
pub mod completion;
pub mod hints;

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub use catalog::{
    CachedMapCatalog, CatalogError, HttpMapSource, MapCatalog, MapCatalogEntry, MapSource,
    StaticMapSource,
};
pub use completion::{
    CompletionError, CompletionStore, HttpCompletionStore, InMemoryCompletionStore,
};
pub use hints::{FileLevelHintStore, HintError, InMemoryLevelHintStore, LevelHintStore};

#[derive(Clone, Debug)]
pub struct ApiConfig {
    base_url: Url,
    bearer_token: Option<String>,
    retry_backoff: Duration,
}

impl ApiConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, ApiError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(ApiError::InvalidConfig("api base url cannot be empty".into()));
        }
        if !base.contains("://") {
            base = format!("http://{base}");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let parsed = Url::parse(&base)
            .map_err(|err| ApiError::InvalidConfig(format!("invalid api base url: {err}")))?;
        Ok(Self {
            base_url: parsed,
            bearer_token: None,
            retry_backoff: Duration::from_secs(1),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    /// Base delay between retries; attempt `n` waits `n * backoff`.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid api configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("authentication required")]
    Unauthorized,
    #[error("access denied")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("server error {0}")]
    Server(StatusCode),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("server rejected request: {message}")]
    Rejected {
        message: String,
        code: Option<String>,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::FORBIDDEN => ApiError::Forbidden,
            StatusCode::NOT_FOUND => ApiError::NotFound,
            status if status.is_server_error() => ApiError::Server(status),
            status => ApiError::HttpStatus(status),
        }
    }

    /// A 401 means the credentials are wrong; asking again will not help.
    fn is_retryable(&self) -> bool {
        !matches!(self, ApiError::Unauthorized | ApiError::InvalidConfig(_))
    }
}

/// Envelope every backend endpoint wraps its payload in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl<T> ApiResponse<T> {
    fn check(self) -> Result<(String, Option<T>), ApiError> {
        let has_errors = self.errors.as_ref().is_some_and(|errors| !errors.is_empty());
        if has_errors || self.error_code.is_some() {
            let message = if self.message.is_empty() {
                self.errors
                    .map(|errors| errors.join(", "))
                    .unwrap_or_else(|| "request failed".into())
            } else {
                self.message
            };
            return Err(ApiError::Rejected {
                message,
                code: self.error_code,
            });
        }
        Ok((self.message, self.data))
    }

    fn into_data(self) -> Result<T, ApiError> {
        match self.check()? {
            (_, Some(data)) => Ok(data),
            (_, None) => Err(ApiError::InvalidResponse("response carried no data".into())),
        }
    }
}

/// Thin reqwest wrapper shared by the HTTP adapters.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.config
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        max_retries: u32,
    ) -> Result<ApiResponse<T>, ApiError> {
        let endpoint = &self.endpoint(path)?;
        let (http, token) = (&self.http, self.config.bearer_token());
        self.with_retry(path, max_retries, move || async move {
            let mut builder = http.get(endpoint.clone()).query(query);
            if let Some(token) = token {
                builder = builder.bearer_auth(token);
            }
            match builder.send().await {
                Ok(response) => decode(response).await,
                Err(err) => Err(ApiError::Network(err)),
            }
        })
        .await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        max_retries: u32,
    ) -> Result<ApiResponse<T>, ApiError> {
        let endpoint = &self.endpoint(path)?;
        let (http, token) = (&self.http, self.config.bearer_token());
        self.with_retry(path, max_retries, move || async move {
            let mut builder = http.post(endpoint.clone()).json(body);
            if let Some(token) = token {
                builder = builder.bearer_auth(token);
            }
            match builder.send().await {
                Ok(response) => decode(response).await,
                Err(err) => Err(ApiError::Network(err)),
            }
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, path: &str, max_retries: u32, call: F) -> Result<T, ApiError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_retries && err.is_retryable() => {
                    attempt += 1;
                    debug!(
                        target: "sim.api",
                        path,
                        attempt,
                        max_retries,
                        error = %err,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<ApiResponse<T>, ApiError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::from_status(status));
    }
    response
        .json::<ApiResponse<T>>()
        .await
        .map_err(|err| ApiError::InvalidResponse(err.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;

    use axum::Router;
    use tokio::net::TcpListener;

    pub async fn serve(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_url_gains_scheme_and_trailing_slash() {
        let config = ApiConfig::new("api.example.test/backend").unwrap();
        assert_eq!(config.base_url().as_str(), "http://api.example.test/backend/");
        assert!(ApiConfig::new("  ").is_err());
    }

    #[test]
    fn blank_tokens_are_dropped() {
        let config = ApiConfig::new("http://localhost")
            .unwrap()
            .with_bearer_token(Some("   ".into()));
        assert_eq!(config.bearer_token(), None);
    }

    #[test]
    fn envelope_with_error_code_is_rejected() {
        let response: ApiResponse<Vec<String>> = serde_json::from_value(json!({
            "message": "Map not found",
            "data": null,
            "errors": null,
            "errorCode": "MAP_NOT_FOUND"
        }))
        .unwrap();
        match response.into_data() {
            Err(ApiError::Rejected { message, code }) => {
                assert_eq!(message, "Map not found");
                assert_eq!(code.as_deref(), Some("MAP_NOT_FOUND"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_codes_map_to_typed_errors() {
        assert!(matches!(ApiError::from_status(StatusCode::UNAUTHORIZED), ApiError::Unauthorized));
        assert!(matches!(ApiError::from_status(StatusCode::FORBIDDEN), ApiError::Forbidden));
        assert!(matches!(ApiError::from_status(StatusCode::NOT_FOUND), ApiError::NotFound));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY),
            ApiError::Server(StatusCode::BAD_GATEWAY)
        ));
        assert!(!ApiError::Unauthorized.is_retryable());
        assert!(ApiError::Server(StatusCode::BAD_GATEWAY).is_retryable());
    }
}
