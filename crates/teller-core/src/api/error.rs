use thiserror::Error;

/// Message returned for every transport failure. The underlying error is
/// logged, never shown.
pub const NETWORK_ERROR_MESSAGE: &str =
    "Unable to reach the server. Check your connection and try again.";

/// Caller-facing failure taxonomy for a backend call.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Network(String),

    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("Session expired. Please log in again.")]
    AuthExpired,

    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl ApiError {
    /// Only transport failures are worth retrying as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }

    /// Whether the caller must leave protected content
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::AuthExpired)
    }

    /// Inline text for the UI
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Contract(_) => {
                "Unexpected response from the server. Please try again later.".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// The backend or the caller broke the wire contract. These are defects,
/// not user-recoverable conditions.
#[derive(Error, Debug)]
pub enum ContractError {
    #[error("Failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

/// Maximum length for error response bodies in log lines
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

/// Pull a human message out of a structured error body, falling back to a
/// generic one naming the status.
pub(crate) fn error_message(status: u16, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            ["message", "error"].iter().find_map(|key| {
                value
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
        })
        .unwrap_or_else(|| format!("Request failed with status {}", status))
}
