//! Streaming chat-completion processor for LLM gateway playgrounds.
//!
//! Consumes an SSE-style chat-completion response, rebuilds the assistant
//! turn from arbitrarily fragmented chunks, and resolves inline media blocks
//! (`<inline><data>..</data><mimeType>..</mimeType></inline>`) that may be
//! split across chunks or frames.
//!
//! # Usage
//!
//! ```no_run
//! use chat_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ConfigError> {
//! init_observability();
//! let processor = ChatStreamProcessor::from_config(GatewayConfig::from_env()?)?;
//!
//! processor.on(EventKind::Delta, |event| {
//!     if let StreamEvent::Delta(delta) = event {
//!         print!("{}", delta.text());
//!     }
//! });
//! processor.on(EventKind::Finish, |event| {
//!     if let StreamEvent::Finish(finish) = event {
//!         println!("\n[has_image={}]", finish.turn.has_image);
//!     }
//! });
//!
//! let request = StreamRequest::new("gemini-2.5-flash-image")
//!     .message(ChatMessage::user("Draw a cat"));
//! processor.send(request).finished().await;
//! # Ok(())
//! # }
//! ```

/// Cancellation controller and abort handles.
pub mod cancel;
/// Gateway endpoint configuration.
pub mod config;
/// Public error types.
pub mod errors;
/// Lifecycle events delivered to handlers.
pub mod event;
/// Frame decoder for the response byte stream.
pub mod frame;
/// Inline media tag state machine and `api_content` sanitizer.
pub mod inline_media;
/// Per-processor subscriber registry.
pub mod listeners;
/// Logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// `ChatStreamProcessor`: `send`, `on`, `cancel`.
pub mod processor;
/// Outbound request types.
pub mod request;
/// Transport contract and the HTTP implementation.
pub mod transport;
/// Turn accumulator and lifecycle driver.
pub mod turn;

pub use cancel::{AbortHandle, CancellationController, StreamToken};
pub use config::GatewayConfig;
pub use errors::{ConfigError, RequestError, TransportError};
pub use event::{
    DeltaEvent, ErrorEvent, ErrorKind, EventKind, FinishEvent, StartEvent, StreamEvent,
};
pub use frame::{ChunkPayload, Frame, FrameDecoder, RawFrame};
pub use inline_media::{InlineMediaBlock, InlineMediaBuffer, InlineState, ResolvedMedia, api_content};
pub use listeners::{Handler, Listeners, Subscription};
pub use observability::init_observability;
pub use processor::{ChatStreamProcessor, InFlight};
pub use request::{ChatMessage, ContentPart, ImageUrl, MessageContent, Role, StreamRequest};
pub use transport::{ByteStream, HttpTransport, ResponseBody, Transport};
pub use turn::{Turn, TurnAccumulator, TurnDriver};
