//! Publish request rejections.

use crate::metrics;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Reasons a publish request is refused before it reaches the registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("File must have size")]
    EmptyFile,

    #[error("File Too Large")]
    FileTooLarge,

    #[error("Offset Too Large")]
    OffsetTooLarge,

    #[error("Chunk Too Large")]
    ChunkTooLarge,
}

impl ApiError {
    /// Metric label.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::InvalidJson => "invalid_json",
            ApiError::EmptyFile => "empty_file",
            ApiError::FileTooLarge => "file_too_large",
            ApiError::OffsetTooLarge => "offset_too_large",
            ApiError::ChunkTooLarge => "chunk_too_large",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_rejected(self.reason());
        (StatusCode::BAD_REQUEST, format!("Bad Request: {self}")).into_response()
    }
}
