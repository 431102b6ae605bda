//! Upload error taxonomy.
//!
//! Every failure the orchestrator can surface is one [`UploadError`]
//! variant.  Remote-store errors arrive as `anyhow::Error` and are wrapped
//! at the point of call, so callers never see a raw transport error.  The
//! enum implements [`axum::response::IntoResponse`] so HTTP handlers can
//! return it directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Failure kinds of a multipart upload.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Malformed chunk size, empty source or empty target.  No remote call
    /// was issued.
    #[error("invalid upload request: {message}")]
    InvalidInput { message: String },

    /// The remote session could not be created.  Nothing to clean up.
    #[error("could not initiate multipart upload for {bucket}/{key}")]
    InitiationFailed {
        bucket: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// The local source could not produce the bytes of a part.
    #[error("could not read part {part_number} ({length} bytes at offset {offset}) from source")]
    SourceRead {
        part_number: u32,
        offset: u64,
        length: u64,
        #[source]
        source: std::io::Error,
    },

    /// Transmission of a part failed, or the store returned no etag for it.
    #[error("upload of part {part_number} failed")]
    PartUploadFailed {
        part_number: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Every part was uploaded but the finalize call failed.
    #[error("completion of multipart upload {upload_id} failed")]
    CompletionFailed {
        upload_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The caller cancelled the upload between two parts.
    #[error("upload cancelled before part {part_number}")]
    Cancelled { part_number: u32 },

    /// Cleanup itself failed.  The remote store still holds the uploaded
    /// parts of `upload_id`; an operator has to remove them.
    #[error("abort of multipart upload {upload_id} failed after: {original}")]
    AbortFailed {
        upload_id: String,
        original: Box<UploadError>,
        #[source]
        source: anyhow::Error,
    },

    /// The task driving the upload panicked before reaching complete or
    /// abort.
    #[error("upload task failed")]
    TaskFailed {
        #[source]
        source: tokio::task::JoinError,
    },
}

impl UploadError {
    /// Build an `InvalidInput` error from any message.
    pub fn invalid(message: impl Into<String>) -> Self {
        UploadError::InvalidInput {
            message: message.into(),
        }
    }

    /// Stable code string for logs, metrics labels and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::InvalidInput { .. } => "InvalidInput",
            UploadError::InitiationFailed { .. } => "InitiationFailed",
            UploadError::SourceRead { .. } => "SourceReadError",
            UploadError::PartUploadFailed { .. } => "PartUploadFailed",
            UploadError::CompletionFailed { .. } => "CompletionFailed",
            UploadError::Cancelled { .. } => "Cancelled",
            UploadError::AbortFailed { .. } => "AbortFailed",
            UploadError::TaskFailed { .. } => "InternalError",
        }
    }

    /// True when remote resources were leaked and this process cannot
    /// recover on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadError::AbortFailed { .. })
    }

    /// The error that triggered a failed abort, if any.
    pub fn original(&self) -> Option<&UploadError> {
        match self {
            UploadError::AbortFailed { original, .. } => Some(original),
            _ => None,
        }
    }

    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            // Over HTTP the source is the request body, so a short or broken
            // body is the client's fault.
            UploadError::SourceRead { .. } => StatusCode::BAD_REQUEST,
            UploadError::InitiationFailed { .. } => StatusCode::BAD_GATEWAY,
            UploadError::PartUploadFailed { .. } => StatusCode::BAD_GATEWAY,
            UploadError::CompletionFailed { .. } => StatusCode::BAD_GATEWAY,
            UploadError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::AbortFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::TaskFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        // Flatten the cause chain into the message.
        let mut message = self.to_string();
        let mut cause = std::error::Error::source(&self);
        while let Some(err) = cause {
            message.push_str(": ");
            message.push_str(&err.to_string());
            cause = err.source();
        }

        let body = serde_json::json!({
            "code": self.kind(),
            "message": message,
            "requestId": request_id,
        });

        (
            status,
            [
                ("content-type", "application/json".to_string()),
                ("x-request-id", request_id),
            ],
            body.to_string(),
        )
            .into_response()
    }
}
