use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use aws_smithy_types::error::operation::BuildError as SmithyBuildError;
use thiserror::Error; // Use thiserror for cleaner error definitions
use uuid::Uuid;

// --- Domain/Infrastructure Errors ---

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Meme not found with ID: {0}")]
    NotFound(Uuid),

    #[error("Duplicate meme ID: {0}")]
    Duplicate(Uuid),

    #[error("Stored data could not be parsed: {0}")]
    DataCorruption(String),

    #[error("Database backend error: {0}")]
    BackendError(#[from] anyhow::Error), // SDK and conversion failures
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File upload failed: {0}")]
    UploadFailed(String),

    #[error("File not found with key: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ActivityError {
    #[error("Activity record could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Stored activity record is malformed: {0}")]
    Malformed(String),

    #[error("Activity log backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ModerationError {
    #[error("Classifier call timed out")]
    Timeout,

    #[error("Classifier backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}

// --- Pipeline Errors ---

/// Failures reported to callers of the engagement pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Meme not found with ID: {0}")]
    NotFound(Uuid),

    #[error("Comment not found on meme {meme_id}")]
    CommentNotFound { meme_id: Uuid },

    #[error("{identity} is not allowed to modify meme {meme_id}")]
    Forbidden { meme_id: Uuid, identity: String },

    #[error("Meme ID already exists: {0}")]
    DuplicateId(Uuid),

    #[error("Meme {0} is not available for download")]
    NotAvailable(Uuid),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{backend} backend unavailable")]
    BackendUnavailable {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::BackendUnavailable { .. })
    }
}

impl From<RepoError> for PipelineError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(id) => PipelineError::NotFound(id),
            RepoError::Duplicate(id) => PipelineError::DuplicateId(id),
            e @ RepoError::DataCorruption(_) => PipelineError::BackendUnavailable {
                backend: "metadata",
                source: anyhow::Error::new(e),
            },
            RepoError::BackendError(source) => PipelineError::BackendUnavailable {
                backend: "metadata",
                source,
            },
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        PipelineError::BackendUnavailable {
            backend: "blob",
            source: anyhow::Error::new(err),
        }
    }
}

// --- Web Layer Error ---

#[derive(Error, Debug)]
pub enum AppError {
    // Input validation / request parsing errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Missing form field: {0}")]
    MissingFormField(String),
    #[error("Error processing multipart form data: {0}")]
    MultipartError(#[from] axum::extract::multipart::MultipartError),
    #[error("Invalid meme ID format: {0}")]
    InvalidUuid(#[from] uuid::Error),
    #[error("Missing caller identity")]
    Unauthenticated,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("Could not read activity log")]
    ActivityError(#[source] ActivityError),

    // Configuration / Startup errors
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Initialization error: {0}")]
    InitError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<SmithyBuildError> for AppError {
    fn from(err: SmithyBuildError) -> Self {
        AppError::InitError(format!("Failed to build AWS request: {}", err))
    }
}

impl From<ActivityError> for AppError {
    fn from(err: ActivityError) -> Self {
        AppError::ActivityError(err)
    }
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            // 4xx Client Errors
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::MissingFormField(field) => (StatusCode::BAD_REQUEST, format!("Missing form field: {}", field)),
            AppError::MultipartError(e) => (StatusCode::BAD_REQUEST, format!("Invalid multipart form data: {}", e)),
            AppError::InvalidUuid(e) => (StatusCode::BAD_REQUEST, format!("Invalid ID format: {}", e)),
            AppError::Unauthenticated => (StatusCode::UNAUTHORIZED, "Missing x-user-email header".to_string()),

            AppError::Pipeline(e) => match e {
                PipelineError::NotFound(_) | PipelineError::CommentNotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
                PipelineError::Forbidden { .. } => (StatusCode::FORBIDDEN, "Not authorized to modify this meme".to_string()),
                PipelineError::DuplicateId(_) => (StatusCode::CONFLICT, e.to_string()),
                PipelineError::NotAvailable(_) => (StatusCode::CONFLICT, "Meme not available for download".to_string()),
                PipelineError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
                PipelineError::BackendUnavailable { backend, source } => {
                    tracing::error!(backend, error.source = ?source, "Backend unavailable");
                    (StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable, please retry".to_string())
                }
            },

            // 5xx Server Errors
            AppError::ActivityError(e) => {
                tracing::error!(error.source = ?e, "Activity log error occurred");
                (StatusCode::SERVICE_UNAVAILABLE, "Activity log temporarily unavailable".to_string())
            }
            AppError::ConfigError(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error".to_string())
            }
            AppError::InitError(msg) => {
                tracing::error!("Initialization error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server initialization error".to_string())
            }
            AppError::IoError(e) => {
                tracing::error!("IO error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "An internal server error occurred".to_string())
            }
        }
    }
}

// --- Axum Response Implementation ---

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = self.status_and_message();

        if status.is_server_error() {
            tracing::error!(error.message = %error_message, error.detail = %self, "Responding with error");
        } else {
            tracing::debug!(error.message = %error_message, error.status = %status, "Responding with client error");
        }

        let body = Json(serde_json::json!({ "error": error_message }));
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return (status, [(header::RETRY_AFTER, "1")], body).into_response();
        }
        (status, body).into_response()
    }
}
