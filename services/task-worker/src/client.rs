//! HTTP client for the dispatcher-api, grounded on
//! `common/worker.py`'s `query_api`/`authenticate` retry loop: a `401`
//! triggers exactly one token refresh and retry, never more.

use async_trait::async_trait;
use awc::Client;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::model::{RequestedTask, ResourceSpec, Task};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// Issues a fresh bearer token. Token issuance itself (the SSH-key-signing
/// grant) lives outside this crate; this trait is the seam the worker calls
/// into when a request comes back `401`.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct DispatcherClient {
    http: Client,
    base_uri: String,
    token: Arc<RwLock<Option<String>>>,
    refresher: Arc<dyn TokenRefresher>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("dispatcher returned {0}")]
    Status(u16),
    #[error("already reserved")]
    AlreadyReserved,
    #[error("unauthorized after token refresh")]
    Unauthorized,
}

impl DispatcherClient {
    pub fn new(base_uri: impl Into<String>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            http: Client::default(),
            base_uri: base_uri.into(),
            token: Arc::new(RwLock::new(None)),
            refresher,
        }
    }

    async fn bearer(&self, force: bool) -> anyhow::Result<String> {
        if !force {
            if let Some(tok) = self.token.read().await.clone() {
                return Ok(tok);
            }
        }
        let fresh = self.refresher.refresh().await?;
        *self.token.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    /// GET/PATCH/POST with one 401-triggered re-authentication retry, as
    /// `BaseWorker.query_api` does.
    async fn request<B: Serialize + Clone, R: DeserializeOwned>(
        &self,
        method: awc::http::Method,
        path: &str,
        body: Option<B>,
    ) -> Result<R, ClientError> {
        let mut attempts = 0;
        loop {
            let token = self
                .bearer(attempts > 0)
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let url = format!("{}{}", self.base_uri, path);
            let mut req = self
                .http
                .request(method.clone(), &url)
                .insert_header(("Authorization", format!("Bearer {token}")));

            let mut resp = match &body {
                Some(b) => req
                    .send_json(b)
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?,
                None => {
                    req = req.content_type("application/json");
                    req.send().await.map_err(|e| ClientError::Transport(e.to_string()))?
                }
            };

            let status = resp.status().as_u16();
            if status == 401 && attempts == 0 {
                attempts += 1;
                continue;
            }
            if status == 423 {
                return Err(ClientError::AlreadyReserved);
            }
            if status == 401 {
                return Err(ClientError::Unauthorized);
            }
            if !(200..300).contains(&status) {
                return Err(ClientError::Status(status));
            }
            return resp
                .json::<R>()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()));
        }
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task, ClientError> {
        self.request::<(), Task>(awc::http::Method::GET, &format!("/tasks/{task_id}"), None)
            .await
    }

    /// `PATCH /tasks/{id}`: event + payload. The dispatcher responds 204 with
    /// an empty body on success, so no deserialization is attempted.
    pub async fn patch_task_event(
        &self,
        task_id: Uuid,
        event: &str,
        payload: Value,
    ) -> Result<(), ClientError> {
        let body = serde_json::json!({ "event": event, "payload": payload });
        let mut attempts = 0;
        loop {
            let token = self
                .bearer(attempts > 0)
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let url = format!("{}/tasks/{}", self.base_uri, task_id);
            let resp = self
                .http
                .patch(&url)
                .insert_header(("Authorization", format!("Bearer {token}")))
                .send_json(&body)
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let status = resp.status().as_u16();
            if status == 401 && attempts == 0 {
                attempts += 1;
                continue;
            }
            if !(200..300).contains(&status) {
                if status == 409 {
                    warn!(%task_id, event, "dispatcher rejected transition as forbidden");
                }
                return Err(ClientError::Status(status));
            }
            return Ok(());
        }
    }

    /// `GET /requested-tasks/worker`, returning the dispatcher's
    /// priority-ordered candidate list. `available` is this host's advertised
    /// minus currently-claimed resources (§5) — only tasks that fit are
    /// matched.
    pub async fn poll_candidates(
        &self,
        worker: &str,
        username: &str,
        available: ResourceSpec,
        matching_offliners: &[String],
        exclude_ids: &[Uuid],
    ) -> Result<Vec<RequestedTask>, ClientError> {
        let mut qs = format!(
            "worker={worker}&username={username}&matching_cpu={}&matching_memory={}&matching_disk={}",
            available.cpu, available.memory, available.disk
        );
        if !matching_offliners.is_empty() {
            qs.push_str(&format!("&matching_offliners={}", matching_offliners.join(",")));
        }
        if !exclude_ids.is_empty() {
            let ids = exclude_ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",");
            qs.push_str(&format!("&exclude_ids={ids}"));
        }
        self.request::<(), Vec<RequestedTask>>(
            awc::http::Method::GET,
            &format!("/requested-tasks/worker?{qs}"),
            None,
        )
        .await
    }

    async fn try_reserve(&self, requested_id: Uuid, worker: &str) -> Result<Task, ClientError> {
        self.request::<(), Task>(
            awc::http::Method::POST,
            &format!("/tasks/{requested_id}?worker_name={worker}"),
            None,
        )
        .await
    }

    /// The §4.4 match-then-promote-with-retry algorithm: poll for
    /// candidates, try to promote the first, and on `AlreadyReserved`
    /// exclude it and poll again — up to `MAX_RETRIES` attempts.
    pub async fn reserve(
        &self,
        worker: &str,
        username: &str,
        available: ResourceSpec,
        matching_offliners: &[String],
    ) -> Result<Option<Task>, ClientError> {
        const MAX_RETRIES: u32 = 3;
        let mut excluded = Vec::new();

        for _ in 0..MAX_RETRIES {
            let candidates = self
                .poll_candidates(worker, username, available, matching_offliners, &excluded)
                .await?;
            let Some(candidate) = candidates.into_iter().next() else {
                return Ok(None);
            };
            match self.try_reserve(candidate.id, worker).await {
                Ok(task) => return Ok(Some(task)),
                Err(ClientError::AlreadyReserved) => {
                    excluded.push(candidate.id);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRefresher;

    #[async_trait]
    impl TokenRefresher for StaticRefresher {
        async fn refresh(&self) -> anyhow::Result<String> {
            Ok("test-token".to_string())
        }
    }

    #[tokio::test]
    async fn bearer_caches_token_until_forced() {
        let client = DispatcherClient::new("http://localhost:8000", Arc::new(StaticRefresher));
        let first = client.bearer(false).await.unwrap();
        let second = client.bearer(false).await.unwrap();
        assert_eq!(first, second);
        let forced = client.bearer(true).await.unwrap();
        assert_eq!(forced, "test-token");
    }
}
