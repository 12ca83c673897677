use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::{ApiClient, ApiError};

const COMPLETED_PATH: &str = "api/v1/lesson-processes/completed";
const COMPLETE_PATH: &str = "api/v1/lesson-processes/complete";
const READ_RETRIES: u32 = 2;
const WRITE_RETRIES: u32 = 1;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("completion store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait CompletionStore: Send + Sync {
    async fn completed_map_ids(&self) -> Result<HashSet<Uuid>, CompletionError>;

    /// Records a finished map. Returns the store's acknowledgement message.
    async fn mark_completed(&self, map_id: Uuid) -> Result<String, CompletionError>;
}

pub struct HttpCompletionStore {
    client: ApiClient,
}

impl HttpCompletionStore {
    pub fn new(client: ApiClient) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

#[async_trait]
impl CompletionStore for HttpCompletionStore {
    async fn completed_map_ids(&self) -> Result<HashSet<Uuid>, CompletionError> {
        let ids: Vec<Uuid> = self
            .client
            .get(COMPLETED_PATH, &[], READ_RETRIES)
            .await?
            .into_data()?;
        Ok(ids.into_iter().collect())
    }

    async fn mark_completed(&self, map_id: Uuid) -> Result<String, CompletionError> {
        // The endpoint takes the bare id as a JSON string body.
        let (message, _) = self
            .client
            .post::<_, serde_json::Value>(COMPLETE_PATH, &map_id.to_string(), WRITE_RETRIES)
            .await?
            .check()?;
        let message = if message.is_empty() {
            "Map marked as completed".to_string()
        } else {
            message
        };
        info!(target: "sim.api", map_id = %map_id, message = %message, "map marked completed");
        Ok(message)
    }
}

/// Store kept in process memory. Records every write attempt, including the
/// ones it was told to fail.
#[derive(Default)]
pub struct InMemoryCompletionStore {
    completed: Mutex<HashSet<Uuid>>,
    writes: Mutex<Vec<Uuid>>,
    fail_writes: AtomicBool,
}

impl InMemoryCompletionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_completed(ids: impl IntoIterator<Item = Uuid>) -> Arc<Self> {
        Arc::new(Self {
            completed: Mutex::new(ids.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn writes(&self) -> Vec<Uuid> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl CompletionStore for InMemoryCompletionStore {
    async fn completed_map_ids(&self) -> Result<HashSet<Uuid>, CompletionError> {
        Ok(self.completed.lock().await.clone())
    }

    async fn mark_completed(&self, map_id: Uuid) -> Result<String, CompletionError> {
        self.writes.lock().await.push(map_id);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CompletionError::Store("write rejected".into()));
        }
        let inserted = self.completed.lock().await.insert(map_id);
        Ok(if inserted {
            "Marked as completed".into()
        } else {
            "Already completed".into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use crate::ApiConfig;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Backend {
        hits: Arc<AtomicUsize>,
        bodies: Arc<parking_lot::Mutex<Vec<Value>>>,
        tokens: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    fn client(addr: std::net::SocketAddr, token: Option<&str>) -> ApiClient {
        let config = ApiConfig::new(format!("http://{addr}"))
            .unwrap()
            .with_bearer_token(token.map(str::to_string))
            .with_retry_backoff(Duration::from_millis(5));
        ApiClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn http_store_lists_completed_ids_with_bearer_token() {
        async fn completed(State(backend): State<Backend>, headers: HeaderMap) -> Json<Value> {
            if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
                backend.tokens.lock().push(auth.to_string());
            }
            Json(json!({
                "message": "ok",
                "data": ["6f1c2f3a-1111-4a4a-9c9c-000000000001"],
                "errors": null,
                "errorCode": null
            }))
        }
        let backend = Backend::default();
        let router = Router::new()
            .route("/api/v1/lesson-processes/completed", get(completed))
            .with_state(backend.clone());
        let addr = serve(router).await;
        let store = HttpCompletionStore::new(client(addr, Some("secret")));

        let ids = store.completed_map_ids().await.unwrap();

        assert_eq!(ids.len(), 1);
        assert_eq!(*backend.tokens.lock(), ["Bearer secret".to_string()]);
    }

    #[tokio::test]
    async fn http_store_posts_id_as_json_string() {
        async fn complete(State(backend): State<Backend>, Json(body): Json<Value>) -> Json<Value> {
            backend.bodies.lock().push(body);
            Json(json!({"message": "Marked as completed", "data": null}))
        }
        let backend = Backend::default();
        let router = Router::new()
            .route("/api/v1/lesson-processes/complete", post(complete))
            .with_state(backend.clone());
        let addr = serve(router).await;
        let store = HttpCompletionStore::new(client(addr, None));
        let map_id = Uuid::new_v4();

        let message = store.mark_completed(map_id).await.unwrap();

        assert_eq!(message, "Marked as completed");
        assert_eq!(*backend.bodies.lock(), [Value::String(map_id.to_string())]);
    }

    #[tokio::test]
    async fn reads_retry_server_errors_twice() {
        async fn flaky(State(backend): State<Backend>) -> StatusCode {
            backend.hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::SERVICE_UNAVAILABLE
        }
        let backend = Backend::default();
        let router = Router::new()
            .route("/api/v1/lesson-processes/completed", get(flaky))
            .with_state(backend.clone());
        let addr = serve(router).await;
        let store = HttpCompletionStore::new(client(addr, None));

        let err = store.completed_map_ids().await.unwrap_err();

        assert!(matches!(err, CompletionError::Api(ApiError::Server(_))));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unauthorized_writes_are_not_retried() {
        async fn denied(State(backend): State<Backend>) -> StatusCode {
            backend.hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::UNAUTHORIZED
        }
        let backend = Backend::default();
        let router = Router::new()
            .route("/api/v1/lesson-processes/complete", post(denied))
            .with_state(backend.clone());
        let addr = serve(router).await;
        let store = HttpCompletionStore::new(client(addr, None));

        let err = store.mark_completed(Uuid::new_v4()).await.unwrap_err();

        assert!(matches!(err, CompletionError::Api(ApiError::Unauthorized)));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_memory_store_tracks_writes() {
        let existing = Uuid::new_v4();
        let store = InMemoryCompletionStore::with_completed([existing]);
        assert_eq!(store.mark_completed(existing).await.unwrap(), "Already completed");

        store.fail_writes(true);
        let failed = Uuid::new_v4();
        assert!(store.mark_completed(failed).await.is_err());
        assert!(!store.completed_map_ids().await.unwrap().contains(&failed));
        assert_eq!(store.writes().await, vec![existing, failed]);
    }
}
