//! Newline-delimited JSON codec.
//!
//! # Line Format
//!
//! Each message is a single JSON object followed by `\n`. JSON string
//! escaping guarantees that an encoded message never contains a raw newline,
//! so a line always carries exactly one message.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Line terminator.
pub const LINE_DELIMITER: u8 = b'\n';

/// Maximum encoded line size (16 MB), including the delimiter.
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Encoder and decoder for newline-delimited JSON messages.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec {
    max_line_size: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Create a codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_line_size: MAX_LINE_SIZE,
        }
    }

    /// Create a codec with a custom size limit.
    pub fn with_max_line_size(max_line_size: usize) -> Self {
        Self { max_line_size }
    }

    /// Returns the size limit in bytes.
    pub fn max_line_size(&self) -> usize {
        self.max_line_size
    }

    /// Encode a message into a delimited line.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(message)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        line.push(LINE_DELIMITER);

        if line.len() > self.max_line_size {
            return Err(ProtocolError::LineTooLarge {
                size: line.len(),
                max: self.max_line_size,
            });
        }

        Ok(line)
    }

    /// Decode a single line. A trailing delimiter and surrounding whitespace
    /// are ignored.
    pub fn decode<T: DeserializeOwned>(&self, line: &[u8]) -> Result<T> {
        if line.len() > self.max_line_size {
            return Err(ProtocolError::LineTooLarge {
                size: line.len(),
                max: self.max_line_size,
            });
        }

        let trimmed = trim_ascii_whitespace(line);
        if trimmed.is_empty() {
            return Err(ProtocolError::EmptyLine);
        }

        serde_json::from_slice(trimmed).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
