use axum::http::StatusCode;
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum LinkNestError {
    #[error("url must not be empty")]
    EmptyUrl,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("link limit reached ({limit} links), upgrade to save more")]
    QuotaExceeded { limit: usize },

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("AI backend error: {0}")]
    AiBackend(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("session closed")]
    SessionClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl LinkNestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::Database(_) | Self::Internal(_) | Self::SessionClosed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::AiBackend(_) => StatusCode::BAD_GATEWAY,
            Self::EmptyUrl | Self::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Failures caused by the request itself; everything else is
    /// persistence or transport trouble.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyUrl
                | Self::Validation(_)
                | Self::QuotaExceeded { .. }
                | Self::NotFound
                | Self::Unauthorized
        )
    }
}

impl axum::response::IntoResponse for LinkNestError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if self.is_user_error() {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        } else {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
