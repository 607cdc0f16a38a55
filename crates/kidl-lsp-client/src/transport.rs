//! `Content-Length` framing for JSON-RPC messages over byte streams.
//!
//! LSP frames every payload with a header block:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//! Header names are matched case-insensitively and headers other than
//! `Content-Length` (such as `Content-Type`) are ignored.

use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::jsonrpc::{Message, MessageError};

/// Log target for framing diagnostics.
pub(crate) const TRANSPORT_TARGET: &str = "kidl_lsp_client::transport";

/// Largest payload accepted from a peer.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Longest header line accepted, terminator included.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

const CONTENT_LENGTH: &str = "content-length";

/// Errors raised while framing or unframing messages.
#[derive(Debug, Error, Clone)]
pub enum FramingError {
    /// Reading or writing the stream failed.
    #[error("transport I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A header block ended without a `Content-Length` header.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// A header line could not be parsed.
    #[error("invalid header line '{line}'")]
    InvalidHeader {
        /// The offending line, without its terminator.
        line: String,
    },

    /// The declared length exceeds [`MAX_CONTENT_LENGTH`].
    #[error("declared content length {length} exceeds the 64 MiB limit")]
    FrameTooLarge {
        /// Declared payload length.
        length: usize,
    },

    /// The stream ended inside a header block or payload.
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated {
        /// Bytes announced by the header (zero while reading headers).
        expected: usize,
        /// Bytes actually received.
        received: usize,
    },

    /// The payload is not a JSON-RPC 2.0 message.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// Why the payload was rejected.
        reason: MessageError,
        /// Raw payload bytes, kept for diagnosis.
        raw: Vec<u8>,
    },

    /// An outbound message could not be serialised.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl From<io::Error> for FramingError {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

/// Serialises a message and prefixes it with its `Content-Length` header.
///
/// # Errors
///
/// Returns [`FramingError::Encode`] when the message cannot be serialised.
pub fn encode(message: &Message) -> Result<Vec<u8>, FramingError> {
    let payload = message
        .to_vec()
        .map_err(|error| FramingError::Encode(error.to_string()))?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Lazily decodes framed messages from a buffered stream.
///
/// The reader yields `None` once the stream ends cleanly at a frame boundary.
/// After yielding an error it is exhausted; resuming requires a new reader on
/// a new stream.
pub struct MessageReader<R> {
    reader: R,
    failed: bool,
}

impl<R: BufRead> MessageReader<R> {
    /// Wraps a buffered stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            failed: false,
        }
    }

    /// Reads the next frame, returning `Ok(None)` on a clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] when the stream is malformed or fails.
    pub fn read_message(&mut self) -> Result<Option<Message>, FramingError> {
        let Some(length) = self.read_headers()? else {
            return Ok(None);
        };

        let mut payload = Vec::with_capacity(length);
        let received = (&mut self.reader)
            .take(length as u64)
            .read_to_end(&mut payload)?;
        if received < length {
            return Err(FramingError::Truncated {
                expected: length,
                received,
            });
        }

        Message::from_slice(&payload)
            .map(Some)
            .map_err(|reason| FramingError::InvalidPayload {
                reason,
                raw: payload,
            })
    }

    fn read_headers(&mut self) -> Result<Option<usize>, FramingError> {
        let mut content_length = None;
        let mut line = String::new();
        let mut header_bytes = 0;

        loop {
            line.clear();
            let read = (&mut self.reader)
                .take(MAX_HEADER_LINE as u64)
                .read_line(&mut line)?;
            if read == MAX_HEADER_LINE && !line.ends_with('\n') {
                return Err(FramingError::InvalidHeader {
                    line: line.chars().take(64).collect(),
                });
            }
            if read == 0 {
                if header_bytes == 0 {
                    return Ok(None);
                }
                return Err(FramingError::Truncated {
                    expected: 0,
                    received: header_bytes,
                });
            }
            header_bytes += read;

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                if header_bytes == read && content_length.is_none() {
                    // Tolerate stray blank lines between frames.
                    header_bytes = 0;
                    continue;
                }
                break;
            }

            let (name, value) = trimmed
                .split_once(':')
                .ok_or_else(|| FramingError::InvalidHeader {
                    line: trimmed.to_owned(),
                })?;
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                content_length = Some(parse_length(trimmed, value)?);
            }
        }

        content_length
            .map(Some)
            .ok_or(FramingError::MissingContentLength)
    }
}

fn parse_length(line: &str, value: &str) -> Result<usize, FramingError> {
    let length: usize = value
        .trim()
        .parse()
        .map_err(|_| FramingError::InvalidHeader {
            line: line.to_owned(),
        })?;
    if length > MAX_CONTENT_LENGTH {
        return Err(FramingError::FrameTooLarge { length });
    }
    Ok(length)
}

impl<R: BufRead> Iterator for MessageReader<R> {
    type Item = Result<Message, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_message() {
            Ok(message) => message.map(Ok),
            Err(error) => {
                self.failed = true;
                Some(Err(error))
            }
        }
    }
}

impl<R: BufRead> std::iter::FusedIterator for MessageReader<R> {}

/// Writes framed messages to a stream, flushing after each frame.
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: Write> MessageWriter<W> {
    /// Wraps a stream.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Frames and writes a message.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] when encoding or writing fails.
    pub fn write_message(&mut self, message: &Message) -> Result<(), FramingError> {
        let frame = encode(message)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
