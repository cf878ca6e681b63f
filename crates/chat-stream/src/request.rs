use crate::errors::RequestError;

/// Author of a chat message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output from a previous turn.
    Assistant,
}

/// Image reference carried by an `image_url` content part.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImageUrl {
    /// Remote URL or `data:` URL.
    pub url: String,
}

/// One element of a multimodal message body.
///
/// Serialized in the OpenAI-compatible wire shape
/// (`{"type":"text","text":..}` / `{"type":"image_url","image_url":{"url":..}}`).
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text segment.
    Text { text: String },
    /// Image segment.
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Creates an image part from a URL (remote or `data:`).
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }

    /// Returns the image URL when this is an image part.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::ImageUrl { image_url } => Some(&image_url.url),
            Self::Text { .. } => None,
        }
    }
}

/// Message body: either a plain string or an ordered list of parts.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text body.
    Text(String),
    /// Multimodal body.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    fn is_blank(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(value: Vec<ContentPart>) -> Self {
        Self::Parts(value)
    }
}

/// A single message in the conversation sent with a request.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    /// Creates a message with an explicit role.
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a user message.
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant message, typically from [`Turn::message`](crate::Turn::message).
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Body of a streaming chat-completion request.
///
/// Free-form sampling options (`temperature`, `max_tokens`, `group`, ...) are
/// flattened into the top-level JSON object next to the fixed fields.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl StreamRequest {
    /// Creates a streaming request for `model` with no messages yet.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            stream: true,
            user: None,
            options: serde_json::Map::new(),
        }
    }

    /// Appends a message.
    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Replaces all messages.
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Sets the end-user identifier forwarded to the gateway.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets one free-form option. Fixed fields cannot be overridden this way.
    pub fn option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let key = key.into();
        if !matches!(key.as_str(), "model" | "messages" | "stream" | "user") {
            self.options.insert(key, value);
        }
        self
    }

    pub(crate) fn validate(&self) -> Result<(), RequestError> {
        if self.model.trim().is_empty() {
            return Err(RequestError::EmptyModel);
        }
        if self.messages.is_empty() {
            return Err(RequestError::NoMessages);
        }
        if let Some(idx) = self.messages.iter().position(|m| m.content.is_blank()) {
            return Err(RequestError::EmptyMessage { index: idx });
        }
        if !self.stream {
            return Err(RequestError::NotStreaming);
        }
        Ok(())
    }
}
