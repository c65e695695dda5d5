use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Failures inside the session core. Converted to [`AppError`] at the HTTP edge
/// and into retries or state transitions by the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("no active session for {0}")]
    NotConnected(String),
    #[error("pairing code not issued for {number} after {attempts} attempts")]
    PairingFailed { number: String, attempts: u32 },
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("rate limited")]
    RateLimited,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidNumber(msg) => AppError::BadRequest(msg),
            SessionError::NotConnected(number) => {
                AppError::NotFound(format!("no active session for {number}"))
            }
            e @ SessionError::PairingFailed { .. } => AppError::Unavailable(e.to_string()),
            SessionError::Protocol(msg) => AppError::Unavailable(msg),
            SessionError::Store(e) => AppError::Internal(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate limited".into()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".into(),
                )
            }
        };
        (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
    }
}
