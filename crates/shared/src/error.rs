use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ErrorResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    PayloadTooLarge,
    FetchFailed,
    UnsupportedImage,
    Upstream,
    Internal,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

/// Only the message crosses the wire; callers display it verbatim.
impl From<ApiError> for ErrorResponse {
    fn from(value: ApiError) -> Self {
        Self {
            error: value.message,
        }
    }
}
