/// Event-stream line framing.
///
/// Turns an HTTP body arriving in arbitrarily split pushes into the ordered
/// sequence of `data:` payloads, stopping at the `[DONE]` sentinel, and owns
/// the upstream source so it is released exactly once however the read ends.
use bytes::Bytes;
use futures_util::Stream;
use memchr::memchr_iter;
use smallvec::SmallVec;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};

const DONE_FRAME: &str = "data: [DONE]\n\n";
const DONE_PAYLOAD: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Utf8Decoder: incremental decoding with carry-over
// ---------------------------------------------------------------------------

/// Incremental UTF-8 decoder.
///
/// An incomplete sequence at the end of a push is held back until the next
/// push completes it. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` and append the text to `out`.
    pub fn decode_into(&mut self, bytes: &[u8], out: &mut String) {
        if self.pending.is_empty() {
            self.decode_slice(bytes, out);
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(bytes);
            self.decode_slice(&joined, out);
        }
    }

    /// Whether an incomplete sequence is waiting for more bytes.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn decode_slice(&mut self, mut input: &[u8], out: &mut String) {
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    return;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&input[..valid_up_to]) {
                        out.push_str(text);
                    }
                    match err.error_len() {
                        Some(invalid_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &input[valid_up_to + invalid_len..];
                        }
                        None => {
                            self.pending.extend_from_slice(&input[valid_up_to..]);
                            return;
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LineFramer: newline splitting and `data:` extraction
// ---------------------------------------------------------------------------

/// One meaningful line of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Trimmed payload of a `data:` line.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

/// Incremental line framer.
///
/// Feed it decoded text in any split; complete lines are processed in order
/// and incomplete trailing text stays buffered. Lines other than `data:`
/// records are ignored. Once `[DONE]` is seen all further input is ignored.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: String,
    read_offset: usize,
    done: bool,
}

impl LineFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed text and append complete frames to `out`.
    pub fn feed_into(&mut self, text: &str, out: &mut Vec<Frame>) {
        if self.done {
            return;
        }
        self.buffer.push_str(text);
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            processed_up_to = line_end + 1;
            match Self::process_line(line) {
                Some(Frame::Done) => {
                    out.push(Frame::Done);
                    self.done = true;
                    self.buffer.clear();
                    self.read_offset = 0;
                    return;
                }
                Some(frame) => out.push(frame),
                None => {}
            }
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// End of input. An unterminated trailing line is discarded, never parsed.
    ///
    /// Returns the number of discarded bytes.
    pub fn finish(&mut self) -> usize {
        let leftover = &self.buffer[self.read_offset..];
        let discarded = if leftover.trim().is_empty() {
            0
        } else {
            warn!(
                bytes = leftover.len(),
                "discarding unterminated trailing event-stream line"
            );
            leftover.len()
        };
        self.buffer.clear();
        self.read_offset = 0;
        discarded
    }

    fn process_line(line: &str) -> Option<Frame> {
        let payload = line.strip_prefix("data:")?.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == DONE_PAYLOAD {
            return Some(Frame::Done);
        }
        Some(Frame::Data(payload.to_string()))
    }
}

struct PendingFrames {
    frames: SmallVec<[Frame; 8]>,
    head: usize,
}

impl PendingFrames {
    #[inline]
    fn new() -> Self {
        Self {
            frames: SmallVec::new(),
            head: 0,
        }
    }

    #[inline]
    fn pop_front(&mut self) -> Option<Frame> {
        if self.head >= self.frames.len() {
            return None;
        }
        let frame = std::mem::replace(&mut self.frames[self.head], Frame::Done);
        self.head += 1;
        if self.head == self.frames.len() {
            self.frames.clear();
            self.head = 0;
        }
        Some(frame)
    }

    #[inline]
    fn extend_from_vec(&mut self, parsed: &mut Vec<Frame>) {
        if parsed.is_empty() {
            return;
        }
        self.frames.extend(parsed.drain(..));
    }
}

// ---------------------------------------------------------------------------
// FrameReader: byte stream to payload stream
// ---------------------------------------------------------------------------

/// Why the upstream source was let go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Exhausted,
    Done,
    TransportError,
    Cancelled,
}

impl ReleaseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseReason::Exhausted => "exhausted",
            ReleaseReason::Done => "done",
            ReleaseReason::TransportError => "transport_error",
            ReleaseReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lazy sequence of `data:` payloads read from an upstream byte stream.
///
/// More bytes are pulled only once every already-framed payload has been
/// consumed. The source is dropped the moment the read ends: on `[DONE]`, on
/// exhaustion, on a transport error (yielded once, then the stream ends), or
/// when the reader itself is dropped early.
pub struct FrameReader<S> {
    source: Option<Pin<Box<S>>>,
    decoder: Utf8Decoder,
    framer: LineFramer,
    text: String,
    parsed: Vec<Frame>,
    pending: PendingFrames,
    released: Option<ReleaseReason>,
}

impl<S> FrameReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(Box::pin(source)),
            decoder: Utf8Decoder::new(),
            framer: LineFramer::new(),
            text: String::new(),
            parsed: Vec::with_capacity(8),
            pending: PendingFrames::new(),
            released: None,
        }
    }

    /// Reason the source was released, if it has been.
    #[must_use]
    pub fn released(&self) -> Option<ReleaseReason> {
        self.released
    }

    fn release(&mut self, reason: ReleaseReason) {
        if self.source.take().is_some() {
            self.released = Some(reason);
            debug!(reason = reason.as_str(), "released upstream event stream");
        }
    }
}

impl<S> Drop for FrameReader<S> {
    fn drop(&mut self) {
        self.release(ReleaseReason::Cancelled);
    }
}

impl<S, E> Stream for FrameReader<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<String, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        loop {
            match this.pending.pop_front() {
                Some(Frame::Data(payload)) => return Poll::Ready(Some(Ok(payload))),
                Some(Frame::Done) => {
                    this.release(ReleaseReason::Done);
                    return Poll::Ready(None);
                }
                None => {}
            }

            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };
            match source.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(bytes))) => {
                    this.text.clear();
                    this.decoder.decode_into(&bytes, &mut this.text);
                    this.framer.feed_into(&this.text, &mut this.parsed);
                    this.pending.extend_from_vec(&mut this.parsed);
                }
                Poll::Ready(Some(Err(err))) => {
                    this.release(ReleaseReason::TransportError);
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.framer.finish();
                    this.release(ReleaseReason::Exhausted);
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// Read `data:` payloads from an upstream byte stream.
pub fn data_frame_stream<S, E>(byte_stream: S) -> FrameReader<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    FrameReader::new(byte_stream)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Format a data-only SSE frame.
#[must_use]
pub fn openai_sse_frame(json: &str) -> String {
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

/// The terminal `[DONE]` frame.
#[must_use]
pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME.as_bytes())
}
