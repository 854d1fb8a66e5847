pub mod config;
pub mod models;
pub mod util;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Error returned from HTTP handlers. Internal causes are logged, never sent to the client.
#[derive(Debug)]
pub enum AppError {
    Status(StatusCode),
    /// A dependency (the queue) failed; the sender should retry the delivery.
    Unavailable(anyhow::Error),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Status(status) => status,
            Self::Unavailable(err) => {
                tracing::error!("{:?}", err);
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Internal(err) => {
                tracing::error!("{:?}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = status.canonical_reason().unwrap_or("Error");
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self { Self::Internal(err.into()) }
}
