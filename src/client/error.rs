use thiserror::Error;

/// Errors from talking to a runlane server or a webhook endpoint.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with its error envelope.
    #[error("{code} (status {status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Non-success response without a parsable error envelope.
    #[error("unexpected response (status {status}): {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ClientError {
    /// Stable error code, when the server supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}
