//! Crate-wide HTTP error type. Every subsystem error converts into this one
//! via `#[from]`; the `IntoResponse` impl below is the only place a status
//! code gets chosen. Subsystem errors stay transport-agnostic.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use notifyhub::confirmation::ConfirmationError;
use notifyhub::dispatcher::DispatcherError;
use notifyhub::realtime::RealtimeError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing tenant context")]
    MissingTenant,

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for NotifyError {
    fn into_response(self) -> Response {
        let status = match &self {
            NotifyError::Validation(_) => StatusCode::BAD_REQUEST,
            NotifyError::MissingTenant => StatusCode::UNAUTHORIZED,
            NotifyError::NotFound(_) => StatusCode::NOT_FOUND,
            NotifyError::Dispatcher(DispatcherError::Invalid(_)) => StatusCode::BAD_REQUEST,
            NotifyError::Dispatcher(DispatcherError::QueueFull(_) | DispatcherError::QueueClosed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            NotifyError::Confirmation(ConfirmationError::UnknownNotification(_)) => StatusCode::NOT_FOUND,
            NotifyError::Confirmation(ConfirmationError::BatchFull(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            NotifyError::Realtime(RealtimeError::ConnectionCapExceeded { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            NotifyError::Realtime(RealtimeError::Unauthorized(_) | RealtimeError::SubscriptionUnauthorized(_)) => {
                StatusCode::UNAUTHORIZED
            }
            NotifyError::Realtime(RealtimeError::UnknownConnection(_)) => StatusCode::NOT_FOUND,
            NotifyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

pub type NotifyResult<T> = Result<T, NotifyError>;
