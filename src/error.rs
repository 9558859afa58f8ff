/// error.rs – Error taxonomy for the session client.
///
/// Missing parameters are raised before any I/O. HTTP failures carry the
/// server's `detail` string when one was sent, so callers can show it as-is.
use thiserror::Error;

/// Fallback message for failures without a server-provided detail.
pub const GENERIC_FAILURE: &str = "Request failed";

#[derive(Debug, Error)]
pub enum ClientError {
    /// A required identifier (session_id, user_id, ...) was empty.
    #[error("{0} is required")]
    MissingParameter(&'static str),

    /// The backend answered with a non-success status.
    #[error("HTTP {status}: {}", .detail.as_deref().unwrap_or(GENERIC_FAILURE))]
    Http { status: u16, detail: Option<String> },

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// The stream socket failed; handled as a lost connection.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Rejected locally before contacting the backend.
    #[error("invalid exit condition: {0}")]
    InvalidExitCondition(String),

    #[error("stream is not connected")]
    NotConnected,
}

impl ClientError {
    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Http {
                detail: Some(d), ..
            } if !d.trim().is_empty() => d.clone(),
            ClientError::Http { .. } | ClientError::Transport(_) | ClientError::Decode(_) => {
                GENERIC_FAILURE.to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_missing_parameter(&self) -> bool {
        matches!(self, ClientError::MissingParameter(_))
    }
}

/// Pull a human-readable detail out of an error body (`detail`, then `error`).
pub fn detail_from_body(body: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    for key in ["detail", "error"] {
        match v.get(key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            // FastAPI validation errors come back as a list of objects
            Some(serde_json::Value::Array(items)) if !items.is_empty() => {
                let msgs: Vec<&str> = items
                    .iter()
                    .filter_map(|i| i.get("msg").and_then(|m| m.as_str()))
                    .collect();
                if !msgs.is_empty() {
                    return Some(msgs.join("; "));
                }
            }
            _ => {}
        }
    }
    None
}
