//! Stream and pipe configuration.

use serde::{Deserialize, Serialize};

use crate::encoding::Encoding;
use crate::error::StreamError;

/// Default soft capacity of a stream, in bytes (64k).
pub const DEFAULT_MAX_SIZE: usize = 1 << 16;

/// Soft capacity threshold.
///
/// A stream is full when its buffered size is strictly greater than the
/// bound. Writes are never refused because of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxSize {
    Bounded(usize),
    Unbounded,
}

impl MaxSize {
    pub fn is_exceeded_by(&self, size: usize) -> bool {
        match self {
            MaxSize::Bounded(max) => size > *max,
            MaxSize::Unbounded => false,
        }
    }
}

impl Default for MaxSize {
    fn default() -> Self {
        MaxSize::Bounded(DEFAULT_MAX_SIZE)
    }
}

impl From<usize> for MaxSize {
    fn from(max: usize) -> Self {
        MaxSize::Bounded(max)
    }
}

/// Construction options for a [`BufferedStream`](crate::BufferedStream).
///
/// # Example
///
/// ```
/// use buffered_stream::{Encoding, MaxSize, StreamOptions};
///
/// let options = StreamOptions::new().max_size(3).encoding(Encoding::Utf8);
/// assert_eq!(options.max_size, MaxSize::Bounded(3));
///
/// let parsed = StreamOptions::from_json(r#"{"max_size": "unbounded", "paused": true}"#).unwrap();
/// assert_eq!(parsed.max_size, MaxSize::Unbounded);
/// assert!(parsed.paused);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    pub max_size: MaxSize,
    pub encoding: Option<Encoding>,
    /// Start in the paused state instead of flowing.
    pub paused: bool,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_size(mut self, max_size: impl Into<MaxSize>) -> Self {
        self.max_size = max_size.into();
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.max_size = MaxSize::Unbounded;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, StreamError> {
        serde_json::from_str(json).map_err(|e| StreamError::InvalidOptions(e.to_string()))
    }
}

/// Options for [`pipe`](crate::pipe::pipe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeOptions {
    /// End the destination when the source ends.
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

impl PipeOptions {
    pub fn keep_open() -> Self {
        Self { end: false }
    }
}
