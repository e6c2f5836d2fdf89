//! Newline-delimited JSON framing.
//!
//! One JSON object per line, UTF-8, terminated by a single `\n`. No
//! length prefix. [`JsonLineCodec`] plugs into `tokio_util`'s
//! `FramedRead`/`FramedWrite`; [`decode`] and [`encode`] are the same
//! logic without any I/O.
//!
//! A line that fails to parse becomes a [`Frame::Malformed`] item
//! rather than a stream error, so one bad line never stops the lines
//! after it.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{EncodeError, FrameError};

/// Default upper bound on a single line, terminator excluded.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

// ── Frame ────────────────────────────────────────────────────────

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A well-formed JSON object.
    Object(Value),
    /// A line that was skipped; decoding continues after it.
    Malformed(FrameError),
}

impl Frame {
    /// The object, or `None` for a malformed line.
    pub fn into_object(self) -> Option<Value> {
        match self {
            Frame::Object(v) => Some(v),
            Frame::Malformed(_) => None,
        }
    }
}

// ── JsonLineCodec ────────────────────────────────────────────────

/// `tokio_util` codec for newline-delimited JSON objects.
#[derive(Debug, Clone)]
pub struct JsonLineCodec {
    max_length: usize,
    /// Bytes of the buffer already scanned for `\n`.
    next_index: usize,
    /// Dropping the rest of an over-long line.
    discarding: bool,
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    /// Codec that rejects lines longer than `max_length` bytes.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn parse_line(line: &[u8]) -> Option<Frame> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let frame = match serde_json::from_slice::<Value>(line) {
            Ok(v @ Value::Object(_)) => Frame::Object(v),
            Ok(_) => Frame::Malformed(FrameError::new("not a JSON object", line)),
            Err(e) => Frame::Malformed(FrameError::new(e.to_string(), line)),
        };
        Some(frame)
    }
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLineCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    src.advance(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    let line = src.split_to(end + 1);
                    self.next_index = 0;
                    if end > self.max_length {
                        return Ok(Some(Frame::Malformed(FrameError::new(
                            format!("line exceeds {} bytes", self.max_length),
                            &line[..end],
                        ))));
                    }
                    if let Some(frame) = Self::parse_line(&line[..end]) {
                        return Ok(Some(frame));
                    }
                }
                (false, None) if src.len() > self.max_length => {
                    let excerpt = FrameError::new(
                        format!("line exceeds {} bytes", self.max_length),
                        &src[..],
                    );
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(Some(Frame::Malformed(excerpt)));
                }
                (false, None) => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if self.discarding || src.is_empty() {
            src.clear();
            self.discarding = false;
            return Ok(None);
        }
        let rest = src.split();
        if rest.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(Frame::Malformed(FrameError::new(
            "unterminated line at end of stream",
            &rest,
        ))))
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = encode(&item)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

// ── Free functions ───────────────────────────────────────────────

/// Serialize `message` as one frame: compact JSON plus `\n`.
///
/// Compact `serde_json` output escapes control characters, so the
/// only raw newline in the result is the terminator.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, EncodeError> {
    let mut out = serde_json::to_vec(message)?;
    out.push(b'\n');
    Ok(out)
}

/// Bytes carried between [`decode`] calls: the unterminated tail plus
/// the codec's scan position and discard state.
#[derive(Debug, Clone, Default)]
pub struct LineBuffer {
    bytes: BytesMut,
    codec: JsonLineCodec,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            bytes: BytesMut::new(),
            codec: JsonLineCodec::with_max_length(max_length),
        }
    }

    /// The fragment after the last `\n`, waiting for more bytes.
    pub fn pending(&self) -> &[u8] {
        &self.bytes
    }

    /// True while the rest of an over-long line is being dropped.
    pub fn is_discarding(&self) -> bool {
        self.codec.discarding
    }
}

/// Append `new_bytes` to `buffer` and pull out every complete line.
///
/// Returns the frames in arrival order. Whatever follows the last
/// `\n` stays in `buffer` for the next call, so lines may be split
/// across reads at any byte boundary. An over-long line is reported
/// once and dropped up to its terminator, even across calls.
pub fn decode(buffer: &mut LineBuffer, new_bytes: &[u8]) -> Vec<Frame> {
    let LineBuffer { bytes, codec } = buffer;
    bytes.extend_from_slice(new_bytes);
    let mut frames = Vec::new();
    // The codec only fails on I/O, never on content.
    while let Ok(Some(frame)) = codec.decode(bytes) {
        frames.push(frame);
    }
    frames
}

// ── Tests ────────────────────────────────────────────────────────
