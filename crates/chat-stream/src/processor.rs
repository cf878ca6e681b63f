use std::sync::Arc;

use futures::StreamExt as _;
use tracing::{debug, info, warn};

use crate::cancel::{AbortHandle, CancellationController, StreamToken};
use crate::config::GatewayConfig;
use crate::errors::{ConfigError, error_message_from_json};
use crate::event::{ErrorEvent, ErrorKind, EventKind, StreamEvent};
use crate::frame::{Frame, FrameDecoder, decode_completion_body};
use crate::listeners::{Listeners, Subscription};
use crate::request::StreamRequest;
use crate::transport::{ByteStream, HttpTransport, ResponseBody, Transport};
use crate::turn::TurnDriver;

struct ProcessorInner {
    transport: Arc<dyn Transport>,
    listeners: Listeners,
    cancellation: CancellationController,
}

impl ProcessorInner {
    /// Delivers `event` if `generation` is still current.
    fn emit(&self, generation: u64, event: &StreamEvent) -> bool {
        self.cancellation
            .deliver(generation, || self.listeners.emit(event))
            .is_some()
    }
}

/// Streaming chat-completion processor.
///
/// Owns one subscriber registry and at most one in-flight stream. Handlers
/// are invoked on the stream's task, in the exact order frames arrive.
///
/// ```no_run
/// use chat_stream::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), ConfigError> {
/// let processor = ChatStreamProcessor::from_config(GatewayConfig::new("http://localhost:3000"))?;
/// processor.on(EventKind::Delta, |event| {
///     if let StreamEvent::Delta(delta) = event {
///         print!("{}", delta.text());
///     }
/// });
/// processor
///     .send(StreamRequest::new("gpt-4o-mini").message(ChatMessage::user("Hello")))
///     .finished()
///     .await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChatStreamProcessor {
    inner: Arc<ProcessorInner>,
}

impl ChatStreamProcessor {
    /// Creates a processor over `transport` with no subscribers.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                transport,
                listeners: Listeners::new(),
                cancellation: CancellationController::new(),
            }),
        }
    }

    /// Creates a processor over an [`HttpTransport`] for `config`.
    pub fn from_config(config: GatewayConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(Arc::new(HttpTransport::new(config)?)))
    }

    /// Subscribes `handler` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.on(kind, handler)
    }

    /// Removes every handler of every kind.
    pub fn remove_all_listeners(&self) {
        self.inner.listeners.remove_all_listeners();
    }

    /// Subscriber registry shared by all streams of this processor.
    pub fn listeners(&self) -> &Listeners {
        &self.inner.listeners
    }

    /// Starts streaming `request`, cancelling any stream already in flight.
    ///
    /// Must be called from within a tokio runtime. Outcomes, including
    /// validation failures, are reported through events; the returned handle
    /// only allows waiting for the stream task.
    pub fn send(&self, request: StreamRequest) -> InFlight {
        let token = self.inner.cancellation.begin();
        let generation = token.generation();
        info!(generation, model = %request.model, "sending chat stream request");
        let join = tokio::spawn(run_stream(self.inner.clone(), request, token));
        InFlight { generation, join }
    }

    /// Aborts the in-flight stream, if any. No `Finish` or `Error` is emitted
    /// for it. Calling this again, or after the stream ended, does nothing.
    pub fn cancel(&self, reason: Option<&str>) {
        if !self.inner.cancellation.cancel(reason) {
            debug!("cancel requested with no stream in flight");
        }
    }

    /// True while a stream is in flight.
    pub fn is_streaming(&self) -> bool {
        self.inner.cancellation.is_live()
    }

    /// Abort handle for the in-flight stream.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.inner.cancellation.abort_handle()
    }
}

/// Handle to a stream started by [`ChatStreamProcessor::send`].
///
/// Dropping it does not cancel the stream.
pub struct InFlight {
    generation: u64,
    join: tokio::task::JoinHandle<()>,
}

impl InFlight {
    /// Generation id assigned to this stream.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Waits for the stream task to end (completed, failed or cancelled).
    pub async fn finished(self) {
        if let Err(e) = self.join.await {
            warn!(generation = self.generation, error = %e, "stream task did not finish cleanly");
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct StreamRun {
    inner: Arc<ProcessorInner>,
    generation: u64,
    driver: TurnDriver,
}

impl StreamRun {
    fn emit(&self, event: &StreamEvent) -> Flow {
        if self.inner.emit(self.generation, event) {
            Flow::Continue
        } else {
            debug!(generation = self.generation, event = %event.kind(), "dropping event of a cancelled stream");
            Flow::Stop
        }
    }

    fn emit_all(&self, events: &[StreamEvent]) -> Flow {
        for event in events {
            if let Flow::Stop = self.emit(event) {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn fail(&mut self, error: ErrorEvent) {
        warn!(generation = self.generation, kind = ?error.kind, message = %error.message, "chat stream failed");
        let event = self.driver.fail(error);
        let _ = self.emit(&event);
    }

    fn apply_frames(&mut self, frames: Vec<Frame>) -> Flow {
        for frame in frames {
            let step = self.driver.frame(frame);
            if let Flow::Stop = self.emit_all(&step.events) {
                return Flow::Stop;
            }
            if step.terminal {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn finish(&mut self) {
        if let Some(event) = self.driver.finish() {
            if let StreamEvent::Finish(finish) = &event {
                info!(
                    generation = self.generation,
                    turn_id = %finish.turn.id,
                    visible_len = finish.turn.visible_text.len(),
                    has_image = finish.turn.has_image,
                    "chat stream finished"
                );
            }
            let _ = self.emit(&event);
        }
    }

    async fn pump(&mut self, mut body: ByteStream, token: &mut StreamToken) {
        let mut decoder = FrameDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.driver.discard();
                    return;
                }
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if token.is_cancelled() {
                        self.driver.discard();
                        return;
                    }
                    let frames = decoder.push_chunk(&chunk);
                    if let Flow::Stop = self.apply_frames(frames) {
                        return;
                    }
                }
                Some(Err(e)) => {
                    self.fail(e.into());
                    return;
                }
                None => {
                    let frames = decoder.finish();
                    if let Flow::Stop = self.apply_frames(frames) {
                        return;
                    }
                    self.finish();
                    return;
                }
            }
        }
    }

    fn replay_json(&mut self, value: serde_json::Value) {
        if value.get("error").is_some() {
            let message = error_message_from_json(&value)
                .unwrap_or_else(|| "gateway returned an error".to_string());
            self.fail(ErrorEvent::new(ErrorKind::Peer, message));
            return;
        }
        let Some(payload) = decode_completion_body(value).filter(|p| p.has_text()) else {
            self.fail(ErrorEvent::new(
                ErrorKind::Transport,
                "gateway returned a non-stream response without content",
            ));
            return;
        };
        let start = self.driver.start();
        if let Flow::Stop = self.emit(&start) {
            return;
        }
        if let Flow::Stop = self.apply_frames(vec![Frame::Chunk(payload)]) {
            return;
        }
        self.finish();
    }
}

/// Releases the live-stream slot when the stream task ends, on every path.
struct CompleteOnDrop {
    inner: Arc<ProcessorInner>,
    generation: u64,
}

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        self.inner.cancellation.complete(self.generation);
    }
}

async fn run_stream(inner: Arc<ProcessorInner>, request: StreamRequest, mut token: StreamToken) {
    let generation = token.generation();
    let _complete = CompleteOnDrop {
        inner: inner.clone(),
        generation,
    };
    let mut run = StreamRun {
        inner: inner.clone(),
        generation,
        driver: TurnDriver::new(request.model.clone(), generation),
    };

    if let Err(e) = request.validate() {
        run.fail(e.into());
        return;
    }

    let opened = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!(generation, "stream cancelled before the response arrived");
            return;
        }
        opened = inner.transport.open(&request) => opened,
    };

    match opened {
        Ok(ResponseBody::Stream(body)) => {
            let start = run.driver.start();
            if let Flow::Continue = run.emit(&start) {
                run.pump(body, &mut token).await;
            }
        }
        Ok(ResponseBody::Json(value)) => run.replay_json(value),
        Err(e) => run.fail(e.into()),
    }
}
