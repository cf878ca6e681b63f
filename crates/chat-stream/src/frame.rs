//! Frame decoding for `data:`-prefixed event streams.
//!
//! Bytes are buffered until a full line is available. The `data:` lines of one
//! event form one frame. Lines are split on raw `\n` bytes so multi-byte UTF-8
//! sequences cut by a chunk boundary are reassembled before any text conversion.

use tracing::{debug, warn};

use crate::errors::error_message_from_json;

/// End-of-stream sentinel payload.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One undecoded unit of the wire stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Value of the most recent `event:` field in the current event block.
    pub event: Option<String>,
    pub payload: String,
}

/// Text and metadata carried by one chat-completion chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkPayload {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<serde_json::Value>,
}

impl ChunkPayload {
    /// True when the chunk carries visible or reasoning text.
    pub fn has_text(&self) -> bool {
        self.content.as_deref().is_some_and(|s| !s.is_empty())
            || self.reasoning_content.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// A classified frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The end-of-stream sentinel was received.
    Done,
    /// A regular completion chunk (possibly metadata only).
    Chunk(ChunkPayload),
    /// The peer reported an error in-band.
    PeerError(String),
}

#[derive(serde::Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(serde::Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    message: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(serde::Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<serde_json::Value>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Incremental decoder from response body bytes to frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    scanned: usize,
    event: Option<String>,
    /// `data:` lines of the current event not yet dispatched.
    pending: Option<String>,
    done: bool,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the sentinel has been decoded; later input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds one chunk and returns every frame completed by it, in order.
    ///
    /// A trailing partial line is kept for the next call.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Frame> {
        if self.done {
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.buf[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            let line = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
            start = end + 1;
            cursor = start;
            let mut raws = Vec::new();
            self.take_line(&line, &mut raws);
            self.classify_all(raws, &mut frames);
            if self.done {
                self.buf.clear();
                self.scanned = 0;
                return frames;
            }
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        frames
    }

    /// Flushes a final unterminated line and any pending event when the body
    /// closes.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !self.done {
            let mut raws = Vec::new();
            if !self.buf.is_empty() {
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.take_line(&line, &mut raws);
            }
            self.flush(&mut raws);
            self.classify_all(raws, &mut frames);
        }
        self.buf.clear();
        self.scanned = 0;
        self.pending = None;
        frames
    }

    /// Consecutive `data:` lines of one event are joined with `\n`. A pending
    /// payload is dispatched as soon as it is complete JSON (or the sentinel),
    /// so streams that separate frames with a single newline decode the same
    /// as blank-line separated ones.
    fn take_line(&mut self, line: &str, out: &mut Vec<RawFrame>) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            self.flush(out);
            self.event = None;
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.flush(out);
            self.event = Some(rest.trim().to_string());
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            debug!(line_len = line.len(), "ignoring non-data stream line");
            return;
        };
        let data = data.strip_prefix(' ').unwrap_or(data);
        // An incomplete payload followed by a line that is a complete payload
        // on its own was never going to parse; dispatch it separately.
        if self.pending.is_some() && is_complete_payload(data) {
            self.flush(out);
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.push('\n');
            pending.push_str(data);
        } else {
            self.pending = Some(data.to_string());
        }
        if self.pending.as_deref().is_some_and(is_complete_payload) {
            self.flush(out);
        }
    }

    fn flush(&mut self, out: &mut Vec<RawFrame>) {
        if let Some(payload) = self.pending.take() {
            out.push(RawFrame {
                event: self.event.clone(),
                payload,
            });
        }
    }

    fn classify_all(&mut self, raws: Vec<RawFrame>, frames: &mut Vec<Frame>) {
        for raw in raws {
            if self.done {
                return;
            }
            let frame = decode_frame(&raw);
            if matches!(frame, Some(Frame::Done)) {
                self.done = true;
            }
            frames.extend(frame);
        }
    }
}

fn starts_value(data: &str) -> bool {
    let data = data.trim_start();
    data.starts_with('{') || data.starts_with('[')
}

fn is_complete_payload(payload: &str) -> bool {
    let payload = payload.trim();
    payload == DONE_SENTINEL
        || (starts_value(payload)
            && serde_json::from_str::<serde::de::IgnoredAny>(payload).is_ok())
}

/// Interprets one raw frame.
///
/// Returns `None` for frames that carry nothing usable: blank payloads and
/// payloads that fail to parse, which are logged and dropped.
pub fn decode_frame(raw: &RawFrame) -> Option<Frame> {
    let payload = raw.payload.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        return Some(Frame::Done);
    }

    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            if raw.event.as_deref() == Some("error") {
                return Some(Frame::PeerError(payload.to_string()));
            }
            warn!(error = %e, payload_len = payload.len(), "dropping malformed stream frame");
            return None;
        }
    };

    if raw.event.as_deref() == Some("error") || value.get("error").is_some() {
        let message = error_message_from_json(&value)
            .unwrap_or_else(|| "gateway reported a stream error".to_string());
        return Some(Frame::PeerError(message));
    }

    match serde_json::from_value::<WireChunk>(value) {
        Ok(chunk) => Some(Frame::Chunk(chunk_payload(chunk))),
        Err(e) => {
            warn!(error = %e, "dropping stream frame with unexpected shape");
            None
        }
    }
}

/// Converts a complete (non-streaming) chat-completion body into a payload.
pub(crate) fn decode_completion_body(value: serde_json::Value) -> Option<ChunkPayload> {
    serde_json::from_value::<WireChunk>(value)
        .ok()
        .map(chunk_payload)
}

fn chunk_payload(chunk: WireChunk) -> ChunkPayload {
    let mut payload = ChunkPayload {
        usage: chunk.usage.filter(|u| !u.is_null()),
        ..ChunkPayload::default()
    };
    if let Some(choice) = chunk.choices.into_iter().next() {
        payload.finish_reason = choice.finish_reason;
        if let Some(delta) = choice.delta.or(choice.message) {
            payload.content = delta.content.as_ref().and_then(content_text);
            payload.reasoning_content = delta.reasoning_content.or(delta.reasoning);
        }
    }
    payload
}

fn content_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"index":0,"delta":{"content":content}}]})
        )
    }

    fn contents(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Chunk(c) => c.content.clone(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn decoder_handles_partial_chunk_boundaries() {
        let mut decoder = FrameDecoder::new();
        let wire = delta_frame("hello");
        let (a, b) = wire.as_bytes().split_at(17);
        assert!(decoder.push_chunk(a).is_empty());
        let frames = decoder.push_chunk(b);
        assert_eq!(contents(&frames), vec!["hello".to_string()]);
    }

    #[test]
    fn many_frames_in_one_chunk_keep_order() {
        let mut decoder = FrameDecoder::new();
        let wire = format!("{}{}{}", delta_frame("a"), delta_frame("b"), delta_frame("c"));
        let frames = decoder.push_chunk(wire.as_bytes());
        assert_eq!(contents(&frames), vec!["a", "b", "c"]);
    }

    #[test]
    fn every_byte_split_yields_same_frames() {
        let wire = format!(
            "{}: keep-alive\n\n{}data: [DONE]\n\n",
            delta_frame("héllo wörld"),
            delta_frame("✓ done")
        );
        let bytes = wire.as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = decoder.push_chunk(&bytes[..split]);
            frames.extend(decoder.push_chunk(&bytes[split..]));
            frames.extend(decoder.finish());
            assert_eq!(contents(&frames), vec!["héllo wörld", "✓ done"], "split at {split}");
            assert_eq!(frames.last(), Some(&Frame::Done), "split at {split}");
        }
    }

    #[test]
    fn done_sentinel_stops_decoding() {
        let mut decoder = FrameDecoder::new();
        let wire = format!("data: [DONE]\n\n{}", delta_frame("late"));
        let frames = decoder.push_chunk(wire.as_bytes());
        assert_eq!(frames, vec![Frame::Done]);
        assert!(decoder.is_done());
        assert!(decoder.push_chunk(delta_frame("later").as_bytes()).is_empty());
    }

    #[test]
    fn malformed_frame_is_dropped_and_decoding_continues() {
        let mut decoder = FrameDecoder::new();
        let wire = format!("data: {{not json\n\n{}", delta_frame("ok"));
        let frames = decoder.push_chunk(wire.as_bytes());
        assert_eq!(contents(&frames), vec!["ok"]);
    }

    #[test]
    fn crlf_lines_and_single_newline_framing_are_accepted() {
        let mut decoder = FrameDecoder::new();
        let wire = "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"y\"}}]}\n";
        let frames = decoder.push_chunk(wire.as_bytes());
        assert_eq!(contents(&frames), vec!["x", "y"]);
    }

    #[test]
    fn multi_line_data_event_is_joined() {
        let wire = "data: {\"choices\":[{\"delta\":\ndata: {\"content\":\"joined\"}}]}\n\ndata: [DONE]\n\n";
        let bytes = wire.as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = decoder.push_chunk(&bytes[..split]);
            frames.extend(decoder.push_chunk(&bytes[split..]));
            assert_eq!(contents(&frames), vec!["joined"], "split at {split}");
            assert_eq!(frames.last(), Some(&Frame::Done), "split at {split}");
        }
    }

    #[test]
    fn broken_payload_does_not_swallow_next_frame_without_blank_line() {
        let mut decoder = FrameDecoder::new();
        let wire = "data: {\"choices\":[\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n";
        let frames = decoder.push_chunk(wire.as_bytes());
        assert_eq!(contents(&frames), vec!["ok"]);
    }

    #[test]
    fn plain_text_error_event_spans_lines() {
        let mut decoder = FrameDecoder::new();
        let wire = "event: error\ndata: upstream\ndata: unavailable\n\n";
        let frames = decoder.push_chunk(wire.as_bytes());
        assert_eq!(frames, vec![Frame::PeerError("upstream\nunavailable".into())]);
    }

    #[test]
    fn pending_event_is_flushed_on_finish() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push_chunk(b"event: error\ndata: gone\n").is_empty());
        assert_eq!(decoder.finish(), vec![Frame::PeerError("gone".into())]);
    }

    #[test]
    fn unterminated_last_line_is_flushed_on_finish() {
        let mut decoder = FrameDecoder::new();
        let wire = delta_frame("tail");
        let trimmed = wire.trim_end();
        assert!(decoder.push_chunk(trimmed.as_bytes()).is_empty());
        assert_eq!(contents(&decoder.finish()), vec!["tail"]);
    }

    #[test]
    fn reasoning_fields_and_metadata_are_extracted() {
        let raw = RawFrame {
            event: None,
            payload: r#"{"choices":[{"delta":{"reasoning":"think"}}]}"#.into(),
        };
        let Some(Frame::Chunk(chunk)) = decode_frame(&raw) else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.reasoning_content.as_deref(), Some("think"));
        assert!(chunk.has_text());

        let raw = RawFrame {
            event: None,
            payload: r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"total_tokens":9}}"#
                .into(),
        };
        let Some(Frame::Chunk(chunk)) = decode_frame(&raw) else {
            panic!("expected chunk");
        };
        assert!(!chunk.has_text());
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunk.usage, Some(serde_json::json!({"total_tokens":9})));
    }

    #[test]
    fn error_frames_become_peer_errors() {
        let raw = RawFrame {
            event: None,
            payload: r#"{"error":{"message":"upstream overloaded"}}"#.into(),
        };
        assert_eq!(
            decode_frame(&raw),
            Some(Frame::PeerError("upstream overloaded".into()))
        );

        let raw = RawFrame {
            event: Some("error".into()),
            payload: "plain failure".into(),
        };
        assert_eq!(decode_frame(&raw), Some(Frame::PeerError("plain failure".into())));
    }

    #[test]
    fn null_content_is_treated_as_absent() {
        let raw = RawFrame {
            event: None,
            payload: r#"{"choices":[{"delta":{"role":"assistant","content":null}}]}"#.into(),
        };
        let Some(Frame::Chunk(chunk)) = decode_frame(&raw) else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.content, None);
        assert!(!chunk.has_text());
    }
}
