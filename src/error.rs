//! Typed errors at the public/HTTP surface.
//!
//! Internal plumbing (background jobs, CLI commands) keeps using
//! `anyhow::Result`; these enums are for the boundaries callers need to
//! match on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

/// Errors `PreprocessService::preprocess` can surface.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unknown file or unsupported extension: {0}")]
    UnknownFile(String),
    #[error("failed to read shape: {0}")]
    ShapeRead(#[from] anyhow::Error),
}

impl PreprocessError {
    fn status(&self) -> StatusCode {
        match self {
            PreprocessError::Validation(_) => StatusCode::BAD_REQUEST,
            PreprocessError::UnknownFile(_) => StatusCode::BAD_REQUEST,
            PreprocessError::ShapeRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors the chunk HTTP handler maps to status codes.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("task not found")]
    NotFound,
    #[error("chunk already consumed")]
    AlreadyConsumed,
    #[error("background parse failed: {0}")]
    ParseFailed(String),
}

impl ChunkError {
    fn status(&self) -> StatusCode {
        match self {
            ChunkError::NotFound => StatusCode::NOT_FOUND,
            ChunkError::AlreadyConsumed => StatusCode::BAD_REQUEST,
            ChunkError::ParseFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for PreprocessError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let error = match &self {
            PreprocessError::Validation(_) => "VALIDATION_ERROR",
            PreprocessError::UnknownFile(_) => "UNKNOWN_FILE",
            PreprocessError::ShapeRead(_) => "SHAPE_READ_FAILED",
        };
        let body = Json(ErrorResponse {
            error: error.to_string(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl IntoResponse for ChunkError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: match &self {
                ChunkError::NotFound => "TASK_NOT_FOUND".to_string(),
                ChunkError::AlreadyConsumed => "CHUNK_GONE".to_string(),
                ChunkError::ParseFailed(_) => "PARSE_FAILED".to_string(),
            },
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// Client-side failure taxonomy for a `loadData` call.
///
/// Cache I/O failures deliberately have no variant here: they are always
/// swallowed (logged, never fatal) rather than propagated.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("chunk {chunk_index} not ready after {attempts} retries")]
    ChunkTimeout { chunk_index: u32, attempts: u32 },
    #[error("chunk {chunk_index} already consumed by another client")]
    ChunkGone { chunk_index: u32 },
    #[error("task expired before chunk {chunk_index} could be fetched")]
    TaskExpired { chunk_index: u32 },
    #[error("transport error fetching chunk {chunk_index}: {message}")]
    Transport { chunk_index: u32, message: String },
    #[error("merge size mismatch: expected {expected} bytes, got {actual}")]
    MergeSizeMismatch { expected: u64, actual: u64 },
    #[error("server error: {0}")]
    Server(String),
}
