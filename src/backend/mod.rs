//! HTTP client for a single backend inference server.
//!
//! One [`BackendClient`] per configured backend URL, all sharing the same
//! pooled [`reqwest::Client`] so the process keeps a single connection pool
//! regardless of how many backends it talks to.

pub mod error;

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::warn;

pub use error::BackendError;

/// Snapshot RPCs can move gigabytes of KV tensors; give them far more
/// headroom than an ordinary chat-completion call.
const SLOT_RPC_TIMEOUT: Duration = Duration::from_secs(600);

/// Outcome of a chat-completion dispatch in streaming mode: the raw
/// upstream response, not yet read. The caller owns draining or streaming
/// its body and must eventually drop it to release the connection.
pub struct StreamedChat {
    pub status: StatusCode,
    pub response: Response,
}

pub struct BackendClient {
    http: Client,
    base_url: String,
    model_id: OnceCell<String>,
}

impl BackendClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            model_id: OnceCell::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// The backend's canonical model id, queried from `GET /v1/models` on
    /// first use and memoized for the process's lifetime.
    pub async fn model_id(&self) -> Result<&str, BackendError> {
        self.model_id
            .get_or_try_init(|| async {
                let resp = self.http.get(self.url("/v1/models")).send().await?;
                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(BackendError::Http { status, body });
                }
                let body: Value = resp.json().await?;
                let id = body
                    .get("data")
                    .and_then(|d| d.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|entry| entry.get("id"))
                    .and_then(|id| id.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                Ok(id)
            })
            .await
            .map(String::as_str)
    }

    /// Ask the backend to load snapshot `key` into `local_slot_id`. Never
    /// propagates an error: a failed restore is a cache miss, not a request
    /// failure, so callers get a plain boolean.
    pub async fn restore_slot(&self, local_slot_id: usize, key: &str) -> bool {
        self.slot_action("restore", local_slot_id, key).await
    }

    /// Ask the backend to persist `local_slot_id`'s current KV tensors
    /// under `key`. Same no-raise discipline as [`Self::restore_slot`].
    pub async fn save_slot(&self, local_slot_id: usize, key: &str) -> bool {
        self.slot_action("save", local_slot_id, key).await
    }

    async fn slot_action(&self, action: &'static str, local_slot_id: usize, key: &str) -> bool {
        let url = format!("{}?action={action}", self.url(&format!("/slots/{local_slot_id}")));
        let result = self
            .http
            .post(&url)
            .timeout(SLOT_RPC_TIMEOUT)
            .json(&json!({ "filename": key }))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(%action, slot = local_slot_id, status = %resp.status(), "slot RPC rejected by backend");
                false
            }
            Err(err) => {
                warn!(%action, slot = local_slot_id, error = %err, "slot RPC transport failure");
                false
            }
        }
    }

    /// Dispatch a buffered (non-streaming) chat-completion request pinned
    /// to `slot_id`, returning the parsed JSON body.
    pub async fn chat_completions(
        &self,
        body: Value,
        slot_id: usize,
        timeout: Duration,
    ) -> Result<Value, BackendError> {
        let pinned = pin_slot(body, slot_id);
        let resp = self
            .http
            .post(self.url(&format!("/v1/chat/completions?slot_id={slot_id}")))
            .timeout(timeout)
            .json(&pinned)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Http { status, body });
        }
        Ok(resp.json().await?)
    }

    /// Dispatch a streaming chat-completion request pinned to `slot_id`.
    /// The caller is responsible for reading or draining the response body.
    pub async fn chat_completions_stream(
        &self,
        body: Value,
        slot_id: usize,
        timeout: Duration,
    ) -> Result<StreamedChat, BackendError> {
        let pinned = pin_slot(body, slot_id);
        let response = self
            .http
            .post(self.url(&format!("/v1/chat/completions?slot_id={slot_id}")))
            .timeout(timeout)
            .json(&pinned)
            .send()
            .await?;
        Ok(StreamedChat {
            status: response.status(),
            response,
        })
    }
}

/// Stamp `slot_id` into the outgoing body three different ways, since
/// backend implementations disagree on which spelling they read: a
/// top-level field, both spellings nested under `options`, and (handled by
/// the caller, via the request URL) a query parameter.
fn pin_slot(mut body: Value, slot_id: usize) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("slot_id".to_string(), json!(slot_id));
        let options = obj
            .entry("options".to_string())
            .or_insert_with(|| json!({}));
        if let Some(options) = options.as_object_mut() {
            options.insert("slot_id".to_string(), json!(slot_id));
            options.insert("id_slot".to_string(), json!(slot_id));
        }
    }
    body
}
