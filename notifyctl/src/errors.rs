use crate::queue::errors::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Missing or wrong API key on an inbound request
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Inbound request body does not match its HMAC signature
    #[error("Invalid request signature")]
    InvalidSignature,

    /// Malformed inbound payload
    #[error("{message}")]
    BadRequest { message: String },

    /// Data that must exist was absent, e.g. no recipients after a successful claim
    #[error("Failed to fetch {what}")]
    Fetch { what: String },

    /// The messaging provider answered with an unexpected status
    #[error("Messaging provider returned HTTP {status}")]
    Provider { status: u16, body: String },

    /// The external scheduler rejected or failed a request
    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Queue store operation error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Outbound HTTP transport error (connect, timeout, TLS)
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::InvalidSignature => StatusCode::FORBIDDEN,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Fetch { .. }
            | Error::Provider { .. }
            | Error::Scheduler { .. }
            | Error::Internal { .. }
            | Error::Store(_)
            | Error::Http(_)
            | Error::Json(_)
            | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a caller-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::InvalidSignature => "Invalid signature".to_string(),
            Error::BadRequest { message } => message.clone(),
            _ => "Internal server error".to_string(),
        }
    }

    /// Whether the error means the queue store could not be reached.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_connection())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Unauthenticated { .. } | Error::InvalidSignature => {
                tracing::info!("Rejected inbound request: {}", self);
            }
            Error::BadRequest { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            _ => {
                tracing::error!("Internal service error: {:#}", self);
            }
        }

        let status = self.status_code();
        (status, Json(json!({ "message": self.user_message() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
