//! `GET /healthz`: a liveness probe outside the chat-completion contract.

use axum::Json;
use serde_json::{Value, json};

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
