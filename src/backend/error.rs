//! Error taxonomy for calls to a backend inference server.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to backend timed out")]
    Timeout,

    #[error("backend returned {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("transport error talking to backend: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),
}
