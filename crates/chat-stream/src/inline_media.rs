//! In-band media blocks embedded in visible text deltas.
//!
//! A model may emit base64 media wrapped as
//! `<inline><data>..</data><mimeType>..</mimeType></inline>` inside ordinary
//! text deltas, split at arbitrary points. [`InlineMediaBuffer`] owns the
//! visible text of one turn, detects the wrapper incrementally, and replaces
//! every completed block with a renderable form. Scanning resumes where the
//! previous delta left off, so total work stays linear in the text length.

use base64::Engine as _;
use tracing::{debug, warn};

use crate::request::ContentPart;

/// Opening wrapper tag.
pub const INLINE_OPEN: &str = "<inline>";
/// Closing wrapper tag.
pub const INLINE_CLOSE: &str = "</inline>";
const DATA_OPEN: &str = "<data>";
const DATA_CLOSE: &str = "</data>";
const MIME_OPEN: &str = "<mimeType>";
const MIME_CLOSE: &str = "</mimeType>";
/// Prefix of the markdown produced for resolved images.
pub const IMAGE_MARKDOWN_PREFIX: &str = "![image](data:";
const UNKNOWN_MIME: &str = "unknown";

/// Media payload extracted from a complete wrapper tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineMediaBlock {
    pub mime_type: String,
    pub base64_data: String,
}

impl InlineMediaBlock {
    /// Extracts the block from a complete `<inline>..</inline>` tag.
    ///
    /// The wrapper must hold exactly one data field and one mime-type field,
    /// in either order. Whitespace inside the data field is removed.
    pub fn parse(tag: &str) -> Option<Self> {
        let inner = tag.strip_prefix(INLINE_OPEN)?.strip_suffix(INLINE_CLOSE)?;
        if inner.matches(DATA_OPEN).count() != 1 || inner.matches(MIME_OPEN).count() != 1 {
            return None;
        }
        let data = field(inner, DATA_OPEN, DATA_CLOSE)?;
        let mime_type = field(inner, MIME_OPEN, MIME_CLOSE)?.trim();
        if mime_type.is_empty() {
            return None;
        }
        let base64_data: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        Some(Self {
            mime_type: mime_type.to_string(),
            base64_data,
        })
    }

    /// `data:` URL for the payload.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64_data)
    }

    /// True when the mime type is a well-formed `image/*` type.
    pub fn is_image(&self) -> bool {
        self.mime_type
            .parse::<mime::Mime>()
            .is_ok_and(|m| m.type_() == mime::IMAGE)
    }

    fn decodes(&self) -> bool {
        !self.base64_data.is_empty()
            && base64::engine::general_purpose::STANDARD
                .decode(&self.base64_data)
                .is_ok()
    }
}

/// Textual stand-in for media that is not rendered inline.
pub fn media_placeholder(mime_type: &str) -> String {
    format!("[data of type {mime_type}]")
}

/// Outcome of resolving one complete wrapper tag.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResolvedMedia {
    /// The wrapper tag exactly as it appeared in the text.
    pub raw: String,
    /// Text that replaced `raw` in the visible text.
    pub rendered: String,
    pub mime_type: String,
    /// `data:` URL when the block was rendered as an image.
    pub image_url: Option<String>,
}

impl ResolvedMedia {
    /// True when the block was rendered as an image.
    pub fn is_image(&self) -> bool {
        self.image_url.is_some()
    }
}

fn resolve_tag(raw: &str) -> ResolvedMedia {
    let Some(block) = InlineMediaBlock::parse(raw) else {
        warn!(tag_len = raw.len(), "inline media tag is malformed; using placeholder");
        let mime_type = partial_mime(raw).unwrap_or(UNKNOWN_MIME).to_string();
        return ResolvedMedia {
            raw: raw.to_string(),
            rendered: media_placeholder(&mime_type),
            mime_type,
            image_url: None,
        };
    };

    if block.is_image() && block.decodes() {
        let url = block.data_url();
        debug!(mime_type = %block.mime_type, data_len = block.base64_data.len(), "resolved inline image");
        return ResolvedMedia {
            raw: raw.to_string(),
            rendered: format!("![image]({url})"),
            mime_type: block.mime_type,
            image_url: Some(url),
        };
    }

    if block.is_image() {
        warn!(mime_type = %block.mime_type, "inline image payload is not valid base64; using placeholder");
    } else {
        debug!(mime_type = %block.mime_type, "inline media is not an image; using placeholder");
    }
    ResolvedMedia {
        raw: raw.to_string(),
        rendered: media_placeholder(&block.mime_type),
        mime_type: block.mime_type,
        image_url: None,
    }
}

/// Buffering state of the inline detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineState {
    /// No unterminated opening tag is pending.
    Idle,
    /// An opening tag was seen and its closing tag has not arrived yet.
    Buffering,
}

/// Visible text of one turn together with its inline-media bookkeeping.
#[derive(Debug, Default)]
pub struct InlineMediaBuffer {
    visible_text: String,
    /// Text from the pending opening tag onwards; empty unless buffering.
    raw_inline_buffer: String,
    /// Offset of the pending opening tag in `visible_text`.
    tag_start: usize,
    /// Earliest offset in `visible_text` where an opening tag may still start.
    open_scan_from: usize,
    /// Earliest offset in `raw_inline_buffer` where the closing tag may start.
    close_scan_from: usize,
    /// Start of visible text not yet committed to `parts`.
    segment_start: usize,
    parts: Vec<ContentPart>,
    has_image: bool,
}

impl InlineMediaBuffer {
    /// Creates an empty buffer in the idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current detector state.
    pub fn state(&self) -> InlineState {
        if self.raw_inline_buffer.is_empty() {
            InlineState::Idle
        } else {
            InlineState::Buffering
        }
    }

    /// True while an opening tag waits for its closing tag.
    pub fn is_buffering(&self) -> bool {
        self.state() == InlineState::Buffering
    }

    /// Visible text, with resolved blocks rendered and any pending raw tag
    /// left in place.
    pub fn visible_text(&self) -> &str {
        &self.visible_text
    }

    /// Raw text buffered since the pending opening tag.
    pub fn raw_inline_buffer(&self) -> &str {
        &self.raw_inline_buffer
    }

    /// Multimodal parts committed so far.
    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    /// True once at least one image block was resolved.
    pub fn has_image(&self) -> bool {
        self.has_image
    }

    /// Sanitized text suitable for sending back to the gateway.
    pub fn api_content(&self) -> String {
        api_content(&self.visible_text)
    }

    /// Appends one visible-text delta and resolves every block it completes,
    /// in order of appearance.
    pub fn push(&mut self, delta: &str) -> Vec<ResolvedMedia> {
        if delta.is_empty() {
            return Vec::new();
        }
        self.visible_text.push_str(delta);
        if self.is_buffering() {
            self.raw_inline_buffer.push_str(delta);
        }

        let mut resolved = Vec::new();
        loop {
            if !self.is_buffering() && !self.find_open_tag() {
                break;
            }
            match self.find_close_tag() {
                Some(end) => resolved.push(self.resolve_pending(end)),
                None => break,
            }
        }
        resolved
    }

    /// End-of-turn reconciliation.
    ///
    /// A pending block gets one more resolution attempt; when its closing tag
    /// never arrived the raw text stays as it is. Trailing text is committed
    /// to the multimodal parts.
    pub fn finish(&mut self) -> Vec<ResolvedMedia> {
        let mut resolved = Vec::new();
        if self.is_buffering() {
            self.close_scan_from = 0;
            match self.find_close_tag() {
                Some(end) => resolved.push(self.resolve_pending(end)),
                None => {
                    debug!(
                        pending_len = self.raw_inline_buffer.len(),
                        "inline tag never closed; keeping raw text"
                    );
                    self.raw_inline_buffer.clear();
                }
            }
        }
        let tail = &self.visible_text[self.segment_start..];
        if !tail.is_empty() {
            self.parts.push(ContentPart::text(tail));
        }
        self.segment_start = self.visible_text.len();
        resolved
    }

    fn find_open_tag(&mut self) -> bool {
        let from = floor_char_boundary(&self.visible_text, self.open_scan_from);
        match self.visible_text[from..].find(INLINE_OPEN) {
            Some(offset) => {
                self.tag_start = from + offset;
                self.raw_inline_buffer = self.visible_text[self.tag_start..].to_string();
                self.close_scan_from = INLINE_OPEN.len();
                true
            }
            None => {
                let keep = self.visible_text.len().saturating_sub(INLINE_OPEN.len() - 1);
                self.open_scan_from = floor_char_boundary(&self.visible_text, keep.max(from));
                false
            }
        }
    }

    /// Returns the end offset (exclusive) of the closing tag in the buffer.
    fn find_close_tag(&mut self) -> Option<usize> {
        let from = floor_char_boundary(&self.raw_inline_buffer, self.close_scan_from);
        match self.raw_inline_buffer[from..].find(INLINE_CLOSE) {
            Some(offset) => Some(from + offset + INLINE_CLOSE.len()),
            None => {
                let keep = self
                    .raw_inline_buffer
                    .len()
                    .saturating_sub(INLINE_CLOSE.len() - 1);
                self.close_scan_from = floor_char_boundary(&self.raw_inline_buffer, keep.max(from));
                None
            }
        }
    }

    fn resolve_pending(&mut self, end: usize) -> ResolvedMedia {
        let media = resolve_tag(&self.raw_inline_buffer[..end]);
        let tag_start = self.tag_start;

        if let Some(url) = &media.image_url {
            let before = &self.visible_text[self.segment_start..tag_start];
            if !before.is_empty() {
                self.parts.push(ContentPart::text(before));
            }
            self.parts.push(ContentPart::image_url(url.clone()));
            self.has_image = true;
        }

        self.visible_text
            .replace_range(tag_start..tag_start + end, &media.rendered);
        let after_rendered = tag_start + media.rendered.len();
        if media.is_image() {
            self.segment_start = after_rendered;
        }
        self.open_scan_from = after_rendered;
        self.raw_inline_buffer.clear();
        self.close_scan_from = 0;
        media
    }
}

/// Strips embedded media from `text` for re-submission to the gateway.
///
/// Complete and unterminated wrapper tags as well as rendered inline images
/// are each replaced by a placeholder naming the mime type. An unterminated
/// tag or image swallows the rest of the text.
pub fn api_content(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let tag = rest.find(INLINE_OPEN);
        let image = rest.find(IMAGE_MARKDOWN_PREFIX);
        let (at, is_tag) = match (tag, image) {
            (None, None) => {
                out.push_str(rest);
                break;
            }
            (Some(t), Some(i)) if i < t => (i, false),
            (Some(t), _) => (t, true),
            (None, Some(i)) => (i, false),
        };
        out.push_str(&rest[..at]);
        let tail = &rest[at..];

        if is_tag {
            match tail.find(INLINE_CLOSE) {
                Some(close) => {
                    let end = close + INLINE_CLOSE.len();
                    let mime = partial_mime(&tail[..end]).unwrap_or(UNKNOWN_MIME);
                    out.push_str(&media_placeholder(mime));
                    rest = &tail[end..];
                }
                None => {
                    out.push_str(&media_placeholder(partial_mime(tail).unwrap_or(UNKNOWN_MIME)));
                    break;
                }
            }
        } else {
            let body = &tail[IMAGE_MARKDOWN_PREFIX.len()..];
            let mime = body
                .find(";base64,")
                .map(|end| &body[..end])
                .filter(|m| !m.is_empty() && !m.contains(')'))
                .unwrap_or(UNKNOWN_MIME);
            out.push_str(&media_placeholder(mime));
            match body.find(')') {
                Some(close) => rest = &body[close + 1..],
                None => break,
            }
        }
    }
    out
}

fn field<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let len = text[start..].find(close)?;
    Some(&text[start..start + len])
}

fn partial_mime(tag: &str) -> Option<&str> {
    field(tag, MIME_OPEN, MIME_CLOSE)
        .map(str::trim)
        .filter(|m| !m.is_empty())
}

fn floor_char_boundary(text: &str, idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    let mut idx = idx;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
