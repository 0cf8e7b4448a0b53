//! Stream framing for the JSON wire protocol.
//!
//! Outbound: one compact JSON object per line (`{...}\n`).
//! Inbound: a streaming decoder that accepts objects back to back, with or
//! without whitespace between them, and reassembles objects split across
//! reads. Decoded frames keep their exact source text so replies can be
//! relayed byte-for-byte.

use crate::error::{McpError, McpResult};
use serde_json::value::RawValue;

/// Upper bound on buffered, not yet complete input (1 MiB).
pub const MAX_PENDING_BYTES: usize = 1_048_576;

/// Encode a serializable value as a newline-terminated JSON line.
pub fn encode_line<T: serde::Serialize>(value: &T) -> McpResult<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Encode a serializable value as compact JSON text (no terminator).
pub fn encode_text<T: serde::Serialize>(value: &T) -> McpResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Streaming decoder: accumulates bytes and yields complete JSON values.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and return every complete frame now available.
    ///
    /// A syntax error yields one `Err` entry and discards the buffered input;
    /// decoding resumes cleanly with the next chunk.
    pub fn feed(&mut self, data: &[u8]) -> Vec<McpResult<Box<RawValue>>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut consumed = 0;

        loop {
            consumed += self.buffer[consumed..]
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if consumed >= self.buffer.len() {
                break;
            }

            let mut stream =
                serde_json::Deserializer::from_slice(&self.buffer[consumed..])
                    .into_iter::<Box<RawValue>>();
            match stream.next() {
                Some(Ok(raw)) => {
                    consumed += stream.byte_offset();
                    frames.push(Ok(raw));
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    frames.push(Err(McpError::Codec(e.to_string())));
                    consumed = self.buffer.len();
                    break;
                }
                None => break,
            }
        }

        self.buffer.drain(..consumed);

        if self.buffer.len() > MAX_PENDING_BYTES {
            frames.push(Err(McpError::InvalidMessage(format!(
                "message too large: {} bytes buffered (max {MAX_PENDING_BYTES})",
                self.buffer.len()
            ))));
            self.buffer.clear();
        }

        frames
    }

    /// Number of bytes waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
