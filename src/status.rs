//! Shared scale status channel
//!
//! The web proxy and the orchestrator coordinate scale-to-zero through a
//! per-service record. The proxy publishes activity and desired replicas; the
//! orchestrator publishes ready replicas and the crash-loop flag. The record
//! is externally mutable, so callers read before acting.

use crate::routing::ServiceKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-service scale record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleState {
    pub last_activity_at: Option<DateTime<Utc>>,
    pub sleeping: bool,
    /// Set by the orchestrator; overrides any wake decision
    pub crashlooped: bool,
    pub desired_replicas: Option<u32>,
    pub ready_replicas: u32,
}

/// Fields the proxy is allowed to change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleeping: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<u32>,
}

impl ScaleUpdate {
    pub fn activity(at: DateTime<Utc>) -> Self {
        Self {
            last_activity_at: Some(at),
            ..Default::default()
        }
    }

    pub fn scale_to_zero() -> Self {
        Self {
            sleeping: Some(true),
            desired_replicas: Some(0),
            ..Default::default()
        }
    }

    pub fn wake(at: DateTime<Utc>) -> Self {
        Self {
            last_activity_at: Some(at),
            sleeping: Some(false),
            desired_replicas: Some(1),
        }
    }

    fn apply_to(&self, state: &mut ScaleState) {
        if let Some(at) = self.last_activity_at {
            state.last_activity_at = Some(at);
        }
        if let Some(sleeping) = self.sleeping {
            state.sleeping = sleeping;
        }
        if let Some(desired) = self.desired_replicas {
            state.desired_replicas = Some(desired);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("status store returned {status} for {key}")]
    Status { status: u16, key: ServiceKey },
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Current record; services never written to read as the default state
    async fn get(&self, key: &ServiceKey) -> Result<ScaleState, StatusError>;

    /// Merge `update` into the record and return the result
    async fn update(&self, key: &ServiceKey, update: ScaleUpdate) -> Result<ScaleState, StatusError>;
}

/// In-process status store
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    states: DashMap<ServiceKey, ScaleState>,
    /// Mirror desired replicas into ready replicas (no orchestrator present)
    follow_desired: bool,
    updates: AtomicU64,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store where scaling takes effect immediately
    pub fn standalone() -> Self {
        Self {
            follow_desired: true,
            ..Default::default()
        }
    }

    /// Number of updates written by the proxy
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, key: &ServiceKey) -> ScaleState {
        self.states.get(key).map(|s| s.clone()).unwrap_or_default()
    }

    /// Orchestrator side: flag or clear a crash loop
    pub fn set_crashlooped(&self, key: &ServiceKey, crashlooped: bool) {
        self.states.entry(key.clone()).or_default().crashlooped = crashlooped;
    }

    /// Orchestrator side: publish observed ready pods
    pub fn set_ready_replicas(&self, key: &ServiceKey, ready: u32) {
        self.states.entry(key.clone()).or_default().ready_replicas = ready;
    }

    /// Orchestrator side: mark a service as scaled down
    pub fn set_sleeping(&self, key: &ServiceKey, sleeping: bool) {
        self.states.entry(key.clone()).or_default().sleeping = sleeping;
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, key: &ServiceKey) -> Result<ScaleState, StatusError> {
        Ok(self.snapshot(key))
    }

    async fn update(&self, key: &ServiceKey, update: ScaleUpdate) -> Result<ScaleState, StatusError> {
        self.updates.fetch_add(1, Ordering::Relaxed);
        let mut state = self.states.entry(key.clone()).or_default();
        update.apply_to(&mut state);
        if self.follow_desired {
            if let Some(desired) = state.desired_replicas {
                state.ready_replicas = desired;
            }
        }
        Ok(state.clone())
    }
}

/// Status store reached over HTTP (`{base}/v1/services/{namespace}/{name}/scale`)
pub struct HttpStatusStore {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpStatusStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StatusError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, key: &ServiceKey) -> String {
        format!("{}/v1/services/{}/{}/scale", self.base_url, key.namespace, key.name)
    }
}

#[async_trait]
impl StatusStore for HttpStatusStore {
    async fn get(&self, key: &ServiceKey) -> Result<ScaleState, StatusError> {
        let response = self.http_client.get(self.url(key)).send().await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(ScaleState::default()),
            s if s.is_success() => Ok(response.json().await?),
            s => Err(StatusError::Status {
                status: s.as_u16(),
                key: key.clone(),
            }),
        }
    }

    async fn update(&self, key: &ServiceKey, update: ScaleUpdate) -> Result<ScaleState, StatusError> {
        let response = self.http_client.patch(self.url(key)).json(&update).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StatusError::Status {
                status: status.as_u16(),
                key: key.clone(),
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn key() -> ServiceKey {
        ServiceKey::new("tenant", "site")
    }

    type Records = Arc<Mutex<HashMap<String, ScaleState>>>;

    fn json_response(status: StatusCode, state: Option<&ScaleState>) -> Response<Full<Bytes>> {
        let body = state.map(|s| serde_json::to_vec(s).unwrap()).unwrap_or_default();
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
    }

    /// Orchestrator stand-in; namespaces named `broken` answer 500
    async fn orchestrator(req: Request<Incoming>, records: Records) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path().to_string();
        if path.starts_with("/v1/services/broken/") {
            return Ok(json_response(StatusCode::INTERNAL_SERVER_ERROR, None));
        }
        let response = match *req.method() {
            Method::GET => {
                let found = records.lock().get(&path).cloned();
                match found {
                    Some(state) => json_response(StatusCode::OK, Some(&state)),
                    None => json_response(StatusCode::NOT_FOUND, None),
                }
            }
            Method::PATCH => {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                let update: ScaleUpdate = serde_json::from_slice(&body).unwrap();
                let state = {
                    let mut records = records.lock();
                    let state = records.entry(path).or_default();
                    update.apply_to(state);
                    state.clone()
                };
                json_response(StatusCode::OK, Some(&state))
            }
            _ => json_response(StatusCode::METHOD_NOT_ALLOWED, None),
        };
        Ok(response)
    }

    async fn start_orchestrator() -> (HttpStatusStore, Records) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let records: Records = Arc::default();

        let shared = Arc::clone(&records);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let records = Arc::clone(&shared);
                tokio::spawn(async move {
                    let service = service_fn(move |req| orchestrator(req, Arc::clone(&records)));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let store = HttpStatusStore::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        (store, records)
    }

    #[tokio::test]
    async fn test_memory_store_merges_updates() {
        let store = MemoryStatusStore::new();
        store.set_ready_replicas(&key(), 2);

        let state = store.update(&key(), ScaleUpdate::scale_to_zero()).await.unwrap();
        assert!(state.sleeping);
        assert_eq!(state.desired_replicas, Some(0));
        // Orchestrator-owned fields are untouched
        assert_eq!(state.ready_replicas, 2);
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_standalone_store_follows_desired() {
        let store = MemoryStatusStore::standalone();
        let state = store.update(&key(), ScaleUpdate::wake(Utc::now())).await.unwrap();
        assert_eq!(state.ready_replicas, 1);
        assert!(!state.sleeping);
    }

    #[tokio::test]
    async fn test_unknown_service_reads_default() {
        let store = MemoryStatusStore::new();
        assert_eq!(store.get(&key()).await.unwrap(), ScaleState::default());
    }

    #[test]
    fn test_update_serializes_only_set_fields() {
        let json = serde_json::to_value(ScaleUpdate::scale_to_zero()).unwrap();
        assert_eq!(json, serde_json::json!({"sleeping": true, "desiredReplicas": 0}));
    }

    #[test]
    fn test_state_deserializes_partial_record() {
        let state: ScaleState = serde_json::from_str(r#"{"crashlooped": true, "readyReplicas": 0}"#).unwrap();
        assert!(state.crashlooped);
        assert!(!state.sleeping);
        assert!(state.last_activity_at.is_none());
    }

    #[test]
    fn test_http_store_url() {
        let store = HttpStatusStore::new("http://orchestrator:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            store.url(&key()),
            "http://orchestrator:8080/v1/services/tenant/site/scale"
        );
    }

    #[tokio::test]
    async fn test_http_store_missing_record_reads_default() {
        let (store, _records) = start_orchestrator().await;
        assert_eq!(store.get(&key()).await.unwrap(), ScaleState::default());
    }

    #[tokio::test]
    async fn test_http_store_patch_merges_remote_record() {
        let (store, records) = start_orchestrator().await;
        records.lock().insert(
            "/v1/services/tenant/site/scale".to_string(),
            ScaleState {
                ready_replicas: 2,
                ..Default::default()
            },
        );

        let state = store.update(&key(), ScaleUpdate::scale_to_zero()).await.unwrap();
        assert!(state.sleeping);
        assert_eq!(state.desired_replicas, Some(0));
        assert_eq!(state.ready_replicas, 2);

        let at = Utc::now();
        let state = store.update(&key(), ScaleUpdate::activity(at)).await.unwrap();
        assert_eq!(state.last_activity_at, Some(at));
        // Fields absent from the PATCH body are left alone
        assert!(state.sleeping);

        assert_eq!(store.get(&key()).await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_http_store_error_status() {
        let (store, _records) = start_orchestrator().await;
        let broken = ServiceKey::new("broken", "site");

        let err = store.get(&broken).await.unwrap_err();
        assert!(matches!(err, StatusError::Status { status: 500, .. }), "{:?}", err);

        let err = store.update(&broken, ScaleUpdate::scale_to_zero()).await.unwrap_err();
        assert!(matches!(err, StatusError::Status { status: 500, .. }), "{:?}", err);
    }
}
