use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use aws_smithy_types::error::operation::BuildError;
use thiserror::Error;
use uuid::Uuid;

// --- Domain/Infrastructure Errors ---

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Meme not found with ID: {0}")]
    NotFound(Uuid),

    #[error("User {user_id} already flagged meme {meme_id}")]
    AlreadyFlagged { meme_id: Uuid, user_id: String },

    #[error("Gave up after repeated write conflicts: {0}")]
    Contention(String),

    #[error("Stored data could not be decoded: {0}")]
    DataCorruption(String),

    #[error("Database backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}

impl From<BuildError> for RepoError {
    fn from(err: BuildError) -> Self {
        RepoError::BackendError(anyhow::Error::new(err).context("Failed to build DynamoDB request"))
    }
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

/// Errors raised by the meme service. Every variant maps onto one HTTP status
/// at the web boundary; there is no variant for a missing identity because
/// the service only accepts an already-resolved [`crate::models::Identity`].
#[derive(Error, Debug)]
pub enum MemeError {
    #[error("Meme not found with ID: {0}")]
    NotFound(Uuid),
    #[error("Comment not found with ID: {0}")]
    CommentNotFound(Uuid),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Could not access meme data")]
    Repository(#[source] RepoError),
    #[error("Could not perform file storage operation")]
    Storage(#[source] StorageError),
}

impl From<RepoError> for MemeError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(id) => MemeError::NotFound(id),
            RepoError::AlreadyFlagged { .. } => {
                MemeError::InvalidInput("You have already flagged this meme".to_string())
            }
            e => MemeError::Repository(e),
        }
    }
}

impl From<StorageError> for MemeError {
    fn from(err: StorageError) -> Self {
        MemeError::Storage(err)
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
    #[error("Invalid ID format: {0}")]
    InvalidUuid(#[from] uuid::Error),

    // Identity / ownership
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // Lookups
    #[error("Meme not found with ID: {0}")]
    MemeNotFound(Uuid),
    #[error("Comment not found with ID: {0}")]
    CommentNotFound(Uuid),
    #[error("Image not found with key: {0}")]
    ImageNotFound(String),

    #[error("Too many concurrent updates: {0}")]
    Conflict(String),
    #[error("Could not access meme data")]
    RepositoryError(#[source] RepoError),
    #[error("Could not perform file storage operation")]
    StorageError(#[source] StorageError),

    // Configuration / Startup errors
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Initialization error: {0}")]
    InitError(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

// --- Conversions from Domain Errors to AppError ---

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(id) => AppError::MemeNotFound(id),
            RepoError::Contention(msg) => AppError::Conflict(msg),
            e => AppError::RepositoryError(e),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => AppError::ImageNotFound(key),
            e => AppError::StorageError(e),
        }
    }
}

impl From<MemeError> for AppError {
    fn from(err: MemeError) -> Self {
        match err {
            MemeError::NotFound(id) => AppError::MemeNotFound(id),
            MemeError::CommentNotFound(id) => AppError::CommentNotFound(id),
            MemeError::Forbidden(msg) => AppError::Forbidden(msg),
            MemeError::InvalidInput(msg) => AppError::InvalidInput(msg),
            MemeError::Repository(e) => e.into(),
            MemeError::Storage(e) => e.into(),
        }
    }
}

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Malformed or mistyped JSON bodies are client input errors like any other.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalServerError(format!("IO error: {}", err))
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_)
            | AppError::MissingFormField(_)
            | AppError::MultipartError(_)
            | AppError::InvalidUuid(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::MemeNotFound(_) | AppError::CommentNotFound(_) | AppError::ImageNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AppError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// --- Axum Response Implementation ---

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match &self {
            // 4xx Client Errors
            AppError::InvalidInput(msg) => msg.clone(),
            AppError::MissingFormField(field) => format!("Missing form field: {}", field),
            AppError::MultipartError(e) => format!("Invalid multipart form data: {}", e),
            AppError::InvalidUuid(e) => format!("Invalid ID format: {}", e),
            AppError::Unauthorized(msg) | AppError::Forbidden(msg) => msg.clone(),
            AppError::MemeNotFound(_) => "Meme not found".to_string(),
            AppError::CommentNotFound(_) => "Comment not found".to_string(),
            AppError::ImageNotFound(_) => "Image not found".to_string(),
            AppError::Conflict(_) => "Meme is busy, please retry".to_string(),

            // 5xx Server Errors
            AppError::RepositoryError(e) => {
                tracing::error!(error.source = ?e, "Repository error occurred");
                "Database operation failed".to_string()
            }
            AppError::StorageError(e) => {
                tracing::error!(error.source = ?e, "Storage error occurred");
                "File storage operation failed".to_string()
            }
            AppError::ConfigError(msg) => {
                tracing::error!("Configuration error: {}", msg);
                "Server configuration error".to_string()
            }
            AppError::InitError(msg) => {
                tracing::error!("Initialization error: {}", msg);
                "Server initialization error".to_string()
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal server error: {}", msg);
                "An internal server error occurred".to_string()
            }
        };

        if status.is_server_error() {
            tracing::error!(error.message = %error_message, error.detail = %self, "Responding with error");
        } else {
            tracing::debug!(error.message = %error_message, error.status = %status, "Responding with client error");
        }

        let body = Json(serde_json::json!({ "error": error_message }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_boundary_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (MemeError::NotFound(id), StatusCode::NOT_FOUND),
            (MemeError::CommentNotFound(id), StatusCode::NOT_FOUND),
            (MemeError::Forbidden("not yours".into()), StatusCode::FORBIDDEN),
            (MemeError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
        assert_eq!(AppError::Unauthorized("no token".into()).status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn repeat_flag_is_reported_as_invalid_input() {
        let err = MemeError::from(RepoError::AlreadyFlagged {
            meme_id: Uuid::new_v4(),
            user_id: "u1".into(),
        });
        assert!(matches!(err, MemeError::InvalidInput(_)));
    }

    #[test]
    fn exhausted_retries_surface_as_conflict() {
        let err = AppError::from(MemeError::from(RepoError::Contention("vote".into())));
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
