use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("server url must use http or https: {0}")]
    InvalidServerUrl(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request ({status}): {error}")]
    Api { status: u16, error: ApiError },
    #[error("websocket failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid gateway frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("gateway did not announce a socket id in time")]
    HandshakeTimeout,
    #[error("gateway connection closed")]
    GatewayClosed,
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),
}

impl ClientError {
    /// Error code reported by the server, when the failure came from one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Api { error, .. } => Some(error.code),
            _ => None,
        }
    }
}
