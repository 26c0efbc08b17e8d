use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Error taxonomy the core produces, mapped directly onto the HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let status = match &self {
            MonitorError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
            MonitorError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

impl From<redis::RedisError> for MonitorError {
    fn from(e: redis::RedisError) -> Self {
        MonitorError::StoreUnavailable(e.to_string())
    }
}
