//! Text encodings used when a stream emits strings instead of bytes.
//!
//! Supported names are `utf8` (alias `utf-8`), `hex` and `base64`.

use std::fmt;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// A byte-to-text encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[serde(alias = "utf-8")]
    Utf8,
    Hex,
    Base64,
}

impl Encoding {
    /// Canonical name of the encoding.
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Hex => "hex",
            Encoding::Base64 => "base64",
        }
    }

    /// Convert text in this encoding to raw bytes.
    pub fn encode(&self, text: &str) -> Result<Bytes, StreamError> {
        let data = match self {
            Encoding::Utf8 => return Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Hex => hex::decode(text).map_err(|e| self.invalid(e))?,
            Encoding::Base64 => general_purpose::STANDARD
                .decode(text)
                .map_err(|e| self.invalid(e))?,
        };
        Ok(Bytes::from(data))
    }

    /// Convert raw bytes to text in this encoding.
    ///
    /// Invalid UTF-8 is replaced with U+FFFD.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Hex => hex::encode(bytes),
            Encoding::Base64 => general_purpose::STANDARD.encode(bytes),
        }
    }

    fn invalid(&self, err: impl fmt::Display) -> StreamError {
        StreamError::InvalidData {
            encoding: *self,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "hex" => Ok(Encoding::Hex),
            "base64" => Ok(Encoding::Base64),
            _ => Err(StreamError::UnknownEncoding(s.to_string())),
        }
    }
}

/// Incremental decoder that never splits a character across two chunks.
///
/// UTF-8 sequences cut at a chunk boundary and base64 groups that are not a
/// multiple of three bytes are held back until the next chunk arrives.
#[derive(Debug, Clone)]
pub struct TextDecoder {
    encoding: Encoding,
    pending: Vec<u8>,
}

impl TextDecoder {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Hand back the bytes held from previous chunks without decoding them.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Decode the next chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        if self.encoding == Encoding::Hex {
            return self.encoding.decode(chunk);
        }

        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let keep = match self.encoding {
            Encoding::Utf8 => incomplete_utf8_tail(&buf),
            Encoding::Base64 => buf.len() % 3,
            Encoding::Hex => 0,
        };
        let split = buf.len() - keep;
        self.pending = buf.split_off(split);
        self.encoding.decode(&buf)
    }

    /// Flush whatever is still held back. Returns `None` when nothing is
    /// pending.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(self.encoding.decode(&rest))
    }
}

/// Length of a trailing UTF-8 sequence that is started but not complete.
fn incomplete_utf8_tail(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            // continuation byte, keep looking for the lead byte
            continue;
        }
        let needed = match byte {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
