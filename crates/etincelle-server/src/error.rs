use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use etincelle_shared::{ErrorBody, SendError};
use etincelle_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Typed rejection from the send path (validation, blocked,
    /// insufficient balance, not found). Carried verbatim to the client.
    #[error(transparent)]
    Send(#[from] SendError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ServerError::Send(err) => {
                let status = match err {
                    SendError::Validation(_) => StatusCode::BAD_REQUEST,
                    SendError::Blocked => StatusCode::FORBIDDEN,
                    SendError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
                    SendError::NotFound(_) => StatusCode::NOT_FOUND,
                    SendError::Transport(_) => StatusCode::BAD_GATEWAY,
                };
                (status, ErrorBody::from_send_error(err))
            }
            ServerError::Store(StoreError::NotFound(what)) => (
                StatusCode::NOT_FOUND,
                ErrorBody::from_send_error(&SendError::NotFound(what.clone())),
            ),
            ServerError::Store(_) | ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    error: "Internal server error".to_string(),
                    code: "INTERNAL".to_string(),
                    required: None,
                    balance: None,
                    shortfall: None,
                },
            ),
        };

        (status, axum::Json(body)).into_response()
    }
}
