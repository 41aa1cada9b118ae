//! Error kinds for the payment API surface.
//!
//! Lock conflicts and idempotency breaches are explicit variants rather
//! than exceptions so the HTTP edge can map each kind to a stable status
//! code and message.

use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;
use tracing::error;

/// Why a payment operation collided with concurrent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another session is already pending for this API key.
    PendingSessionExists,
    /// The api_keys row is locked by a concurrent operation.
    KeyLockBusy,
    /// The payment_sessions row is locked by a concurrent completion.
    SessionLockBusy,
    /// The session already stores a different completion request.
    DifferentCompletionStored,
    /// The transfer's request id already paid for another session.
    TokenAlreadyUsed,
}

impl ConflictKind {
    pub fn message(&self) -> &'static str {
        match self {
            ConflictKind::PendingSessionExists => {
                "A pending payment session already exists for this API key"
            }
            ConflictKind::KeyLockBusy => {
                "The API key is being modified by another request"
            }
            ConflictKind::SessionLockBusy => {
                "The session is being completed by another request"
            }
            ConflictKind::DifferentCompletionStored => {
                "A different completion request is already stored for this session"
            }
            ConflictKind::TokenAlreadyUsed => "Token already used",
        }
    }
}

#[derive(Debug, Error)]
pub enum PaymentError {
    /// Malformed or unsatisfiable request; nothing was persisted.
    #[error("{0}")]
    Validation(String),

    /// Concurrent state got there first.
    #[error("{}", .0.message())]
    Conflict(ConflictKind),

    /// The payment itself was rejected; the session is marked failed
    /// (or expired) before this is returned.
    #[error("{message}")]
    Rejected { message: String },

    #[error("{0} not found")]
    NotFound(&'static str),

    /// Broken server-side invariant.
    #[error("{0}")]
    Internal(String),

    /// Aggregator or SDK transport failure.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl PaymentError {
    fn status(&self) -> StatusCode {
        match self {
            PaymentError::Validation(_) => StatusCode::BAD_REQUEST,
            PaymentError::Conflict(_) => StatusCode::CONFLICT,
            PaymentError::Rejected { .. } => StatusCode::PAYMENT_REQUIRED,
            PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
            PaymentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PaymentError::Upstream(_) => StatusCode::BAD_GATEWAY,
            PaymentError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PaymentError::Validation(_) => "validation_error",
            PaymentError::Conflict(_) => "conflict",
            PaymentError::Rejected { .. } => "payment_failed",
            PaymentError::NotFound(_) => "not_found",
            PaymentError::Internal(_) => "internal_error",
            PaymentError::Upstream(_) => "upstream_error",
            PaymentError::Db(_) => "internal_error",
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> axum::response::Response {
        let message = match &self {
            // Never leak server internals to clients
            PaymentError::Db(e) => {
                error!("Database error in payment API: {}", e);
                "Internal error".to_string()
            }
            PaymentError::Internal(e) => {
                error!("Internal error in payment API: {}", e);
                "Internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(serde_json::json!({
            "error": self.kind(),
            "message": message,
        }));

        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        let err = PaymentError::Conflict(ConflictKind::TokenAlreadyUsed);
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "Token already used");
    }

    #[test]
    fn rejected_maps_to_402() {
        let err = PaymentError::Rejected {
            message: "Insufficient payment".to_string(),
        };
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn db_errors_are_opaque() {
        let err = PaymentError::Db(sqlx::Error::RowNotFound);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind(), "internal_error");
    }
}
