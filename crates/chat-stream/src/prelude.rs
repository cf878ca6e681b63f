//! Common imports for typical processor usage.
pub use crate::{
    ChatMessage, ChatStreamProcessor, ConfigError, ContentPart, DeltaEvent, ErrorEvent, ErrorKind,
    EventKind, GatewayConfig, InFlight, StreamEvent, StreamRequest, Subscription, Turn,
    api_content, init_observability,
};
