//! Centralized error types for the Squelch core library.
//!
//! One enum covers both surfaces a relay error can reach:
//! - signalling clients, as `error{message}` text frames (the `Display`
//!   string is the message)
//! - admin HTTP callers, via `status_code()` and `IntoResponse`

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Application-wide error type for relay operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The session has not completed `register` yet.
    #[error("Not registered")]
    NotRegistered,

    /// A name or channel name was empty after trimming.
    #[error("Name cannot be empty")]
    EmptyName,

    /// Channel creation collided with an existing channel.
    #[error("Channel already exists: {0}")]
    AlreadyExists(String),

    /// The named channel does not exist.
    #[error("No such channel: {0}")]
    NoSuchChannel(String),

    /// The session's name is already taken inside the target channel.
    #[error("Name already in use in channel: {0}")]
    NameInUse(String),

    /// Only the channel owner may close it.
    #[error("Only the channel owner can close this channel")]
    NotOwner,

    /// Admin lookup found no session registered under the given name.
    #[error("No such client: {0}")]
    NoSuchClient(String),

    /// A registered name cannot change while the session is in a channel.
    #[error("Cannot change name while in a channel")]
    RenameInChannel,

    /// The `type` discriminator of a signalling message is not recognised.
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// A required request field was missing or empty (admin surface).
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A request body was present but not valid JSON for the endpoint
    /// (admin surface).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RelayError {
    /// Maps the error to an HTTP status code for the admin surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoSuchChannel(_) | Self::NoSuchClient(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) | Self::NameInUse(_) => StatusCode::CONFLICT,
            Self::NotOwner => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Convenient Result alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
