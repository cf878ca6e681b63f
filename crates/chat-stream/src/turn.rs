//! Per-turn state and the synchronous lifecycle driver.
//!
//! `TurnDriver` turns decoded frames into lifecycle events and enforces the
//! ordering contract: one `Start`, any number of `Delta`, then exactly one of
//! `Finish` / `Error`. It performs no I/O, so the whole contract is testable
//! without a runtime.

use tracing::{debug, warn};

use crate::event::{DeltaEvent, ErrorEvent, ErrorKind, FinishEvent, StartEvent, StreamEvent};
use crate::frame::{ChunkPayload, Frame};
use crate::inline_media::InlineMediaBuffer;
use crate::request::{ChatMessage, ContentPart};

/// Mutable state of the live turn. Only the driver holds one.
#[derive(Debug)]
pub struct TurnAccumulator {
    id: uuid::Uuid,
    reasoning_text: String,
    inline: InlineMediaBuffer,
    finish_reason: Option<String>,
    usage: Option<serde_json::Value>,
}

impl TurnAccumulator {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            reasoning_text: String::new(),
            inline: InlineMediaBuffer::new(),
            finish_reason: None,
            usage: None,
        }
    }

    /// Visible text so far, pending raw tag included.
    pub fn visible_text(&self) -> &str {
        self.inline.visible_text()
    }

    /// Reasoning text so far.
    pub fn reasoning_text(&self) -> &str {
        &self.reasoning_text
    }

    /// Raw text of a pending inline tag; empty unless buffering.
    pub fn raw_inline_buffer(&self) -> &str {
        self.inline.raw_inline_buffer()
    }

    /// True while an inline tag is pending.
    pub fn is_buffering_inline_tag(&self) -> bool {
        self.inline.is_buffering()
    }

    /// True once an inline image was resolved.
    pub fn has_image(&self) -> bool {
        self.inline.has_image()
    }

    /// Applies one chunk, returning the deltas it produces (reasoning first).
    fn apply(&mut self, chunk: ChunkPayload) -> Vec<DeltaEvent> {
        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        let mut deltas = Vec::new();
        if let Some(reasoning) = chunk.reasoning_content.filter(|s| !s.is_empty()) {
            self.reasoning_text.push_str(&reasoning);
            deltas.push(DeltaEvent::reasoning(reasoning));
        }
        if let Some(content) = chunk.content.filter(|s| !s.is_empty()) {
            let resolved_media = self.inline.push(&content);
            let mut delta = DeltaEvent::content(content);
            delta.resolved_media = resolved_media;
            deltas.push(delta);
        }
        deltas
    }

    fn freeze(mut self) -> Turn {
        self.inline.finish();
        Turn {
            id: self.id,
            api_content: self.inline.api_content(),
            visible_text: self.inline.visible_text().to_string(),
            reasoning_text: self.reasoning_text,
            multimodal_parts: self.inline.parts().to_vec(),
            has_image: self.inline.has_image(),
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}

/// Read-only result of a completed turn.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Turn {
    pub id: uuid::Uuid,
    /// Text as shown to the user, with inline images rendered as markdown.
    pub visible_text: String,
    pub reasoning_text: String,
    /// Text safe to send back to the gateway; never contains media.
    pub api_content: String,
    pub multimodal_parts: Vec<ContentPart>,
    pub has_image: bool,
    pub finish_reason: Option<String>,
    pub usage: Option<serde_json::Value>,
}

impl Turn {
    /// Assistant message to append to the next request's history.
    pub fn message(&self) -> ChatMessage {
        ChatMessage::assistant(self.api_content.clone())
    }
}

/// Result of feeding one frame to the driver.
#[derive(Debug, Default)]
pub struct Step {
    pub events: Vec<StreamEvent>,
    /// True once a terminal event was produced; no further input is accepted.
    pub terminal: bool,
}

impl Step {
    fn events(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            terminal: false,
        }
    }

    fn terminal(event: StreamEvent) -> Self {
        Self {
            events: vec![event],
            terminal: true,
        }
    }
}

/// Lifecycle driver owning at most one live turn.
#[derive(Debug)]
pub struct TurnDriver {
    model: String,
    generation: u64,
    live: Option<TurnAccumulator>,
    terminated: bool,
}

impl TurnDriver {
    /// Creates a driver for one stream of `model`.
    pub fn new(model: impl Into<String>, generation: u64) -> Self {
        Self {
            model: model.into(),
            generation,
            live: None,
            terminated: false,
        }
    }

    /// The live accumulator, if a turn is in progress.
    pub fn live(&self) -> Option<&TurnAccumulator> {
        self.live.as_ref()
    }

    /// Opens a new turn.
    ///
    /// A turn that is still live is discarded without a `Finish` event; its
    /// contents are never merged into the new one.
    pub fn start(&mut self) -> StreamEvent {
        if let Some(stale) = self.live.take() {
            warn!(
                turn_id = %stale.id,
                "turn started while another was live; discarding the stale turn"
            );
        }
        self.terminated = false;
        let turn = TurnAccumulator::new();
        let event = StreamEvent::Start(StartEvent {
            turn_id: turn.id,
            generation: self.generation,
            model: self.model.clone(),
        });
        self.live = Some(turn);
        event
    }

    /// Applies one decoded frame.
    pub fn frame(&mut self, frame: Frame) -> Step {
        if self.terminated {
            return Step::default();
        }
        match frame {
            Frame::Done => {
                let events = self.finish().into_iter().collect();
                self.terminated = true;
                Step {
                    events,
                    terminal: true,
                }
            }
            Frame::PeerError(message) => {
                Step::terminal(self.fail(ErrorEvent::new(ErrorKind::Peer, message)))
            }
            Frame::Chunk(chunk) => {
                let Some(turn) = self.live.as_mut() else {
                    warn!("dropping chunk received outside of a turn");
                    return Step::default();
                };
                if !chunk.has_text() {
                    debug!(finish_reason = ?chunk.finish_reason, "metadata-only chunk");
                }
                Step::events(turn.apply(chunk).into_iter().map(StreamEvent::Delta).collect())
            }
        }
    }

    /// Completes the live turn, returning `Finish` with the frozen turn.
    ///
    /// Returns `None` when no turn is live or the driver already terminated.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.terminated {
            return None;
        }
        let turn = self.live.take()?;
        self.terminated = true;
        Some(StreamEvent::Finish(FinishEvent {
            turn: turn.freeze(),
        }))
    }

    /// Fails the stream. Any live turn is dropped.
    pub fn fail(&mut self, error: ErrorEvent) -> StreamEvent {
        self.live = None;
        self.terminated = true;
        StreamEvent::Error(error)
    }

    /// Drops the live turn without emitting anything (cancellation).
    pub fn discard(&mut self) {
        if let Some(turn) = self.live.take() {
            debug!(turn_id = %turn.id, "discarding cancelled turn");
        }
        self.terminated = true;
    }
}
