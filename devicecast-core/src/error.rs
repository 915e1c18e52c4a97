use thiserror::Error;

use crate::frame::FrameSourceError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Upstream error ({status_code}): {detail}")]
    Upstream { status_code: u16, detail: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn session_not_found(session_id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("Session {session_id} not found"))
    }

    /// Whether the error should be reported to the client verbatim
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::InvalidRequest(_) | Self::Negotiation(_)
        )
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::Negotiation(err.to_string())
    }
}

impl From<FrameSourceError> for Error {
    fn from(err: FrameSourceError) -> Self {
        Self::Upstream {
            status_code: err.status_code,
            detail: err.detail,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Background task failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
