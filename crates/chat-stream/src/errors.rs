/// Failures raised by a `Transport` before or while streaming a response body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent (connect, TLS, DNS, ...).
    #[error("request failed: {message}")]
    Request { message: String },
    /// The gateway answered with a non-success status before streaming began.
    #[error("gateway returned status {status}: {message}")]
    Status { status: u16, message: String },
    /// Reading the response body failed mid-stream.
    #[error("stream read failed: {message}")]
    Read { message: String },
    /// The response body could not be interpreted.
    #[error("unexpected response body: {message}")]
    Body { message: String },
}

impl TransportError {
    /// Creates a send/connect failure.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    /// Creates a non-success status failure.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Creates a mid-stream read failure.
    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }

    /// Creates an unusable-body failure.
    pub fn body(message: impl Into<String>) -> Self {
        Self::Body {
            message: message.into(),
        }
    }

    /// HTTP status code, when the failure came from a status response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Invalid configuration for a transport or processor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable or field is missing.
    #[error("missing configuration: {0}")]
    Missing(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A request rejected before anything was sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("model must not be empty")]
    EmptyModel,
    #[error("at least one message is required")]
    NoMessages,
    #[error("message {index} has empty content")]
    EmptyMessage { index: usize },
    #[error("request must have stream enabled")]
    NotStreaming,
}

/// Extracts a human-readable message from a gateway error body.
///
/// Understands `{"error":{"message":..}}`, `{"error":".."}` and
/// `{"message":..}`; anything else is returned trimmed, or a generic message
/// when empty.
pub(crate) fn error_message_from_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(message) = error_message_from_json(&value)
    {
        return message;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty error response".to_string()
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn error_message_from_json(value: &serde_json::Value) -> Option<String> {
    match value.get("error") {
        Some(serde_json::Value::String(message)) => return Some(message.clone()),
        Some(error) => {
            if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
                return Some(message.to_string());
            }
        }
        None => {}
    }
    value
        .get("message")
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned)
}
