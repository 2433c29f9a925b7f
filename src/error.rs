use axum::http::StatusCode;
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum MaisonError {
    #[error("{0}")]
    Validation(String),

    #[error("session {0} not found")]
    SessionNotFound(i64),

    #[error("unknown maidId: {0}")]
    UnknownMaid(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("LLM not configured (set MAISON_LLM_URL)")]
    LlmNotConfigured,

    #[error("LLM backend error: {0}")]
    LlmBackend(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    EmbeddingDim { expected: usize, got: usize },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MaisonError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) | Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::LlmNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::LlmBackend(_) | Self::EmbeddingDim { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl axum::response::IntoResponse for MaisonError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
