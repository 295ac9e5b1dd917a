//! Server-sent event decoding.
//!
//! Provides [`SseDecoder`] for line-buffered reassembly of `field: value`
//! events from an arbitrary byte stream, and [`decode_events`] to lift it
//! over any `Stream` of byte chunks. Handles TCP chunk boundary reassembly,
//! including boundaries that fall inside a multi-byte UTF-8 sequence.
//!
//! The decoder knows nothing about what the events mean; see
//! [`super::interpret`] for that.

use bytes::Bytes;
use futures::{Stream, StreamExt};

/// Lines longer than this without a terminator are dropped.
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// One decoded event: field name to value.
///
/// Fields keep the order in which they first appeared. A field repeated
/// within one event has its values joined with `\n`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    fields: Vec<(String, String)>,
}

impl RawEvent {
    /// Value of `name`, if the event carried it.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    /// Shorthand for the `data` field.
    pub fn data(&self) -> Option<&str> {
        self.get("data")
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(f, v)| (f.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn append(&mut self, field: &str, value: &str) {
        match self.fields.iter_mut().find(|(f, _)| f == field) {
            Some((_, existing)) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => self.fields.push((field.to_string(), value.to_string())),
        }
    }
}

/// Incremental event-stream decoder.
///
/// Buffers raw bytes across chunk boundaries, splits complete lines and
/// groups them into [`RawEvent`]s delimited by blank lines. Malformed lines
/// never produce errors; they degrade to best-effort field extraction.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    current: RawEvent,
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
}

impl SseDecoder {
    /// Create a new decoder with empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one complete line (without its terminator).
    ///
    /// Returns the finished event when `line` is blank and an event is in
    /// progress.
    pub fn push_line(&mut self, line: &str) -> Option<RawEvent> {
        let line = line.trim_end();

        if line.is_empty() {
            return self.take_event();
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.trim_start()),
            None => (line, ""),
        };
        self.current.append(field, value);
        None
    }

    /// Process a chunk of bytes from the stream, returning every event it completed.
    pub fn process_chunk(&mut self, bytes: &[u8]) -> Vec<RawEvent> {
        let mut events = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }

            self.buffer.extend_from_slice(line);
            if let Some(event) = self.flush_buffer() {
                events.push(event);
            }
        }

        if !self.discarding {
            self.buffer.extend_from_slice(rest);
            if self.buffer.len() > MAX_LINE_BYTES {
                tracing::warn!(
                    buffered = self.buffer.len(),
                    "Event-stream line exceeds limit, discarding it"
                );
                self.buffer.clear();
                self.discarding = true;
            }
        }

        events
    }

    /// Decode the buffered bytes as one line and feed it to [`Self::push_line`].
    fn flush_buffer(&mut self) -> Option<RawEvent> {
        let raw = std::mem::take(&mut self.buffer);
        let event = self.push_line(&String::from_utf8_lossy(&raw));
        self.buffer = raw;
        self.buffer.clear();
        event
    }

    fn take_event(&mut self) -> Option<RawEvent> {
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }

    /// Consume the decoder at end of stream.
    ///
    /// Any unterminated trailing line is processed first, then the
    /// in-progress event is returned if it has any fields.
    pub fn finish(mut self) -> Option<RawEvent> {
        if !self.buffer.is_empty() && !self.discarding {
            if let Some(event) = self.flush_buffer() {
                return Some(event);
            }
        }
        self.take_event()
    }
}

/// Lazily decode a stream of byte chunks into events.
///
/// Errors from the underlying stream are passed through and end the stream;
/// events still in progress at that point are dropped.
pub fn decode_events<S, E>(bytes: S) -> impl Stream<Item = Result<RawEvent, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        futures::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in decoder.process_chunk(&chunk) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(event) = decoder.finish() {
            yield Ok(event);
        }
    }
}
