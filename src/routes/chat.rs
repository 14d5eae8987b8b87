//! `POST /v1/chat/completions`: the end-to-end cache-aware dispatch path.

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::{
    error::ApiError,
    hashing::{self, Message},
    state::AppState,
    streaming,
};

/// One chat message. `role` and `content` are named because hashing and
/// prompt reconstruction need `content` specifically; every other field the
/// client sent rides along in `extra` untouched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The client-facing request body. Unknown top-level fields are preserved
/// in `extra` and forwarded verbatim to the backend (§9 Dynamic request
/// shape): this proxy does not need to understand every sampling knob a
/// client might send, only `messages` and `stream`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[instrument(
    name = "chat.completions",
    skip(state, req),
    fields(
        is_big = tracing::field::Empty,
        cache_key = tracing::field::Empty,
        slot = tracing::field::Empty,
    )
)]
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::bad_request("messages must be a non-empty array"));
    }

    let model_id = state
        .primary_backend()
        .model_id()
        .await
        .map_err(|e| ApiError::upstream(format!("could not determine backend model id: {e}")))?
        .to_string();

    let borrowed: Vec<Message<'_>> = req
        .messages
        .iter()
        .map(|m| Message { content: &m.content })
        .collect();
    let prefix = hashing::raw_prefix(&borrowed);
    let prefix_len = prefix.len();
    let words = hashing::words(&prefix);
    let n_words = words.len();
    let block_hashes = hashing::block_hashes(&words, state.config.words_per_block);
    let key = hashing::prefix_key(&model_id, &prefix);
    let is_big = n_words > state.config.big_threshold_words;

    tracing::Span::current().record("is_big", is_big);
    tracing::Span::current().record("cache_key", &key[..16.min(key.len())]);

    let restore_key = if is_big {
        hashing::find_best_restore_candidate(
            &state.metadata,
            &model_id,
            state.config.words_per_block,
            &block_hashes,
            state.config.lcp_threshold,
        )
        .await?
        .map(|candidate| candidate.record.key)
    } else {
        None
    };

    let mut handle = match state
        .slot_manager
        .acquire_for_request(restore_key.as_deref())
        .await
    {
        Ok(handle) => handle,
        Err(_) => {
            return Err(ApiError::no_slot_available(
                "all slots busy, please retry later",
            ));
        }
    };
    tracing::Span::current().record("slot", handle.local_slot_id());

    let mut body = serde_json::to_value(&req).map_err(|e| ApiError::internal(e.to_string()))?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("cache_prompt".to_string(), Value::Bool(is_big));
        obj.insert("n_keep".to_string(), Value::Number((-1i64).into()));
    }

    if !req.stream {
        dispatch_buffered(
            state,
            handle,
            body,
            is_big,
            key,
            block_hashes,
            prefix_len,
            model_id,
        )
        .await
    } else {
        dispatch_streaming(
            state,
            handle,
            body,
            is_big,
            key,
            block_hashes,
            prefix_len,
            model_id,
        )
        .await
    }
}

async fn dispatch_buffered(
    state: AppState,
    mut handle: crate::slots::SlotHandle,
    body: Value,
    is_big: bool,
    key: String,
    block_hashes: Vec<String>,
    prefix_len: usize,
    model_id: String,
) -> Result<Response, ApiError> {
    let backend = handle.backend().clone();
    let slot_id = handle.local_slot_id();
    let result = backend
        .chat_completions(body, slot_id, state.config.request_timeout)
        .await;

    let response = match result {
        Ok(Value::Object(obj)) => Value::Object(obj),
        Ok(_) => {
            state.slot_manager.release(&mut handle);
            return Err(ApiError::upstream("provider non-JSON body"));
        }
        Err(crate::backend::BackendError::Http { status, body }) => {
            state.slot_manager.release(&mut handle);
            return Ok((
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
                body,
            )
                .into_response());
        }
        Err(err) => {
            state.slot_manager.release(&mut handle);
            return Err(err.into());
        }
    };

    if is_big {
        let _ = state.slot_manager.save_after(&handle, &key).await;
        if let Err(e) = state
            .metadata
            .write(
                &key,
                &model_id,
                state.config.words_per_block,
                block_hashes,
                prefix_len,
            )
            .await
        {
            warn!(error = %e, "failed to write cache metadata");
        }
    }
    state.slot_manager.release(&mut handle);

    Ok(Json(response).into_response())
}

async fn dispatch_streaming(
    state: AppState,
    mut handle: crate::slots::SlotHandle,
    body: Value,
    is_big: bool,
    key: String,
    block_hashes: Vec<String>,
    prefix_len: usize,
    model_id: String,
) -> Result<Response, ApiError> {
    let backend = handle.backend().clone();
    let slot_id = handle.local_slot_id();

    let streamed = backend
        .chat_completions_stream(body, slot_id, state.config.request_timeout)
        .await;

    let streamed = match streamed {
        Ok(streamed) if streamed.status.is_success() => streamed,
        Ok(streamed) => {
            let status = streamed.status;
            let text = streamed.response.text().await.unwrap_or_default();
            state.slot_manager.release(&mut handle);
            return Ok((
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
                text,
            )
                .into_response());
        }
        Err(err) => {
            state.slot_manager.release(&mut handle);
            return Err(err.into());
        }
    };

    let (tx, response_body) = streaming::channel();

    // Tracked so graceful shutdown can wait for this to finish persisting and
    // releasing its slot even after the client itself has disconnected.
    state.task_tracker.spawn(async move {
        streaming::drain_upstream(streamed.response, &tx).await;

        if is_big {
            let _ = state.slot_manager.save_after(&handle, &key).await;
            if let Err(e) = state
                .metadata
                .write(
                    &key,
                    &model_id,
                    state.config.words_per_block,
                    block_hashes,
                    prefix_len,
                )
                .await
            {
                warn!(error = %e, "failed to write cache metadata");
            }
        }
        state.slot_manager.release(&mut handle);
        info!("streaming request finished, slot released");

        let _ = tx.send(streaming::StreamEvent::End).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(response_body)
        .map_err(|e| ApiError::internal(e.to_string()))
}
