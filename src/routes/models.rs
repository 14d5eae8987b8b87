//! `GET /v1/models`: the single configured model, advertised under the
//! client-facing `MODEL_ID`, independent of whatever id the backend itself
//! reports internally.

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::state::AppState;

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": [{ "id": state.config.model_id }]
    }))
}
