use std::fmt;

use crate::inline_media::ResolvedMedia;
use crate::turn::Turn;

/// Lifecycle event type used to subscribe handlers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Start,
    Delta,
    Finish,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [Self::Start, Self::Delta, Self::Finish, Self::Error];

    /// Wire-style constant name (`START`, `DELTA`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Delta => "DELTA",
            Self::Finish => "FINISH",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted once the response stream is open, before any output is known.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct StartEvent {
    pub turn_id: uuid::Uuid,
    /// Generation of the `send` call that opened this stream.
    pub generation: u64,
    pub model: String,
}

/// Incremental output for the current turn.
///
/// Exactly one of `content` / `reasoning_content` is set.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "reasoning_content", skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    pub is_reasoning_content: bool,
    /// Inline media blocks completed by this delta, in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resolved_media: Vec<ResolvedMedia>,
}

impl DeltaEvent {
    /// Creates a visible-text delta.
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            reasoning_content: None,
            is_reasoning_content: false,
            resolved_media: Vec::new(),
        }
    }

    /// Creates a reasoning delta.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            content: None,
            reasoning_content: Some(text.into()),
            is_reasoning_content: true,
            resolved_media: Vec::new(),
        }
    }

    /// The delta text, whichever field carries it.
    pub fn text(&self) -> &str {
        self.content
            .as_deref()
            .or(self.reasoning_content.as_deref())
            .unwrap_or_default()
    }
}

/// Terminal success event; hands off the frozen turn.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct FinishEvent {
    pub turn: Turn,
}

/// Where a terminal failure originated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request was rejected before sending.
    Validation,
    /// Network failure or non-success response.
    Transport,
    /// The gateway reported an error in the stream or response body.
    Peer,
}

/// Terminal failure event carrying a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorEvent {
    /// Creates an error event without a status code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Attaches the HTTP status that caused the failure.
    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }
}

impl From<crate::errors::TransportError> for ErrorEvent {
    fn from(err: crate::errors::TransportError) -> Self {
        Self::new(ErrorKind::Transport, err.to_string()).with_status(err.status_code())
    }
}

impl From<crate::errors::RequestError> for ErrorEvent {
    fn from(err: crate::errors::RequestError) -> Self {
        Self::new(ErrorKind::Validation, err.to_string())
    }
}

/// Event delivered to subscribed handlers.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Start(StartEvent),
    Delta(DeltaEvent),
    Finish(FinishEvent),
    Error(ErrorEvent),
}

impl StreamEvent {
    /// Subscription kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Start(_) => EventKind::Start,
            Self::Delta(_) => EventKind::Delta,
            Self::Finish(_) => EventKind::Finish,
            Self::Error(_) => EventKind::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_serializes_with_ui_field_names() {
        let value = serde_json::to_value(DeltaEvent::reasoning("hmm")).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"reasoning_content":"hmm","isReasoningContent":true})
        );
        let value = serde_json::to_value(DeltaEvent::content("hi")).expect("serialize");
        assert_eq!(value, serde_json::json!({"content":"hi","isReasoningContent":false}));
    }

    #[test]
    fn transport_errors_keep_status() {
        let event = ErrorEvent::from(crate::errors::TransportError::status(401, "invalid token"));
        assert_eq!(event.kind, ErrorKind::Transport);
        assert_eq!(event.status, Some(401));
        assert!(event.message.contains("invalid token"));
    }

    #[test]
    fn kinds_display_as_constants() {
        let names: Vec<_> = EventKind::ALL.iter().map(EventKind::to_string).collect();
        assert_eq!(names, vec!["START", "DELTA", "FINISH", "ERROR"]);
    }
}
