//! FIFO of buffered chunks with a running byte count.

use bytes::Bytes;
use std::collections::VecDeque;

/// Buffered chunks in write order.
///
/// `size` always equals the summed length of the queued chunks. Once
/// [`ChunkQueue::close`] has been called the queue is gone for good, which
/// lets callers tell "drained and finished" apart from "currently empty".
#[derive(Debug)]
pub struct ChunkQueue {
    chunks: Option<VecDeque<Bytes>>,
    size: usize,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self {
            chunks: Some(VecDeque::new()),
            size: 0,
        }
    }

    /// Append a chunk. Returns `false` if the queue is already closed.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        let Some(chunks) = self.chunks.as_mut() else {
            return false;
        };
        self.size += chunk.len();
        chunks.push_back(chunk);
        true
    }

    /// Put a chunk back at the head, ahead of everything queued. Returns
    /// `false` if the queue is already closed.
    pub fn requeue(&mut self, chunk: Bytes) -> bool {
        let Some(chunks) = self.chunks.as_mut() else {
            return false;
        };
        self.size += chunk.len();
        chunks.push_front(chunk);
        true
    }

    /// Take the head chunk.
    pub fn pop(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.as_mut()?.pop_front()?;
        self.size = self.size.saturating_sub(chunk.len());
        Some(chunk)
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.chunks.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    /// True when closed or holding no chunks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes queued.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Drop the queue and anything still in it. Returns the number of bytes
    /// discarded.
    pub fn close(&mut self) -> usize {
        let dropped = self.size;
        self.chunks = None;
        self.size = 0;
        dropped
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}
