use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use shared::{FailureKind, TaskFailure};
use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy for the whole pipeline. Validation and capacity errors
/// surface synchronously at submission; everything else reaches clients only
/// through a task's terminal `failed` state.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("too many concurrent tasks (limit {0}), try again later")]
    Capacity(usize),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("failed to decode video: {0}")]
    Decode(String),

    #[error("frame preprocessing failed: {0}")]
    Preprocess(String),

    #[error("model inference failed: {0}")]
    Inference(String),

    #[error("no analyzable frames: {0}")]
    EmptyResult(String),

    #[error("processing exceeded {0} seconds")]
    Timeout(u64),

    #[error("cancelled by client")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// Projection onto the wire-level failure record attached to failed tasks.
    pub fn failure(&self) -> TaskFailure {
        let kind = match self {
            AnalysisError::Decode(_) => FailureKind::Decode,
            AnalysisError::Preprocess(_) => FailureKind::Preprocess,
            AnalysisError::Inference(_) => FailureKind::Inference,
            AnalysisError::EmptyResult(_) => FailureKind::EmptyResult,
            AnalysisError::Timeout(_) => FailureKind::Timeout,
            AnalysisError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        };
        TaskFailure::new(kind, self.to_string())
    }
}

impl ResponseError for AnalysisError {
    fn status_code(&self) -> StatusCode {
        match self {
            AnalysisError::Validation(_) => StatusCode::BAD_REQUEST,
            AnalysisError::NotFound(_) => StatusCode::NOT_FOUND,
            AnalysisError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
