//! The buffered stream itself.
//!
//! A [`BufferedStream`] accepts chunks through [`write`](BufferedStream::write)
//! and hands them to `data` listeners on a later turn of its
//! [`Scheduler`]. Writes are never refused because the buffer is large;
//! instead `write` returns `false` once the buffered size exceeds
//! `max_size`, and a single `drain` event follows when the backlog has been
//! relieved.
//!
//! # Example
//!
//! ```
//! use buffered_stream::{BufferedStream, Emitter, EventKind, EventLoop, StreamEvent};
//! use std::sync::{Arc, Mutex};
//!
//! let event_loop = EventLoop::new();
//! let stream = BufferedStream::new(event_loop.clone());
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! stream.on(EventKind::Data, move |event| {
//!     if let StreamEvent::Data(payload) = event {
//!         sink.lock().unwrap().extend_from_slice(payload.as_bytes());
//!     }
//! });
//!
//! stream.write("He").unwrap();
//! stream.write("llo").unwrap();
//! stream.end().unwrap();
//! event_loop.run_until_idle();
//!
//! assert_eq!(&*seen.lock().unwrap(), b"Hello");
//! assert!(stream.is_destroyed());
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::encoding::{Encoding, TextDecoder};
use crate::error::StreamError;
use crate::event_loop::Scheduler;
use crate::events::{
    Callback, Emitter, EventEmitter, EventKind, Listener, StreamEvent, StreamId,
};
use crate::options::{MaxSize, PipeOptions, StreamOptions};
use crate::pipe::{self, Readable, Writable};
use crate::queue::ChunkQueue;
use crate::state::FlowState;

/// Mutable stream state. Only touched while holding `Inner::core`, and the
/// lock is never held while listeners run.
pub(crate) struct Core {
    pub(crate) queue: ChunkQueue,
    pub(crate) state: FlowState,
    pub(crate) max_size: MaxSize,
    pub(crate) decoder: Option<TextDecoder>,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// A `drain` is owed once the stream stops being full.
    pub(crate) was_full: bool,
    /// A flush task is queued on the scheduler.
    pub(crate) flushing: bool,
    pub(crate) pipe_source: Option<StreamId>,
}

impl Core {
    fn new(options: &StreamOptions) -> Self {
        Self {
            queue: ChunkQueue::new(),
            state: FlowState::initial(options.paused),
            max_size: options.max_size,
            decoder: options.encoding.map(TextDecoder::new),
            readable: true,
            writable: true,
            was_full: false,
            flushing: false,
            pipe_source: None,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.max_size.is_exceeded_by(self.queue.size())
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        if !self.writable {
            return Err(StreamError::not_writable());
        }
        if self.state.is_ended() {
            return Err(StreamError::already_ended());
        }
        Ok(())
    }
}

pub(crate) struct Inner {
    pub(crate) id: StreamId,
    pub(crate) core: Mutex<Core>,
    pub(crate) events: EventEmitter,
    pub(crate) scheduler: Arc<dyn Scheduler>,
}

/// A buffered, flow-controlled byte stream.
///
/// Cloning gives another handle to the same stream.
#[derive(Clone)]
pub struct BufferedStream {
    inner: Arc<Inner>,
}

impl BufferedStream {
    /// Create a flowing stream with the default capacity.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_options(scheduler, StreamOptions::default())
    }

    pub fn with_options(scheduler: Arc<dyn Scheduler>, options: StreamOptions) -> Self {
        let inner = Arc::new(Inner {
            id: StreamId::next(),
            core: Mutex::new(Core::new(&options)),
            events: EventEmitter::new(),
            scheduler,
        });
        tracing::trace!(stream = %inner.id, ?options, "stream created");
        Self { inner }
    }

    /// Create a stream that is fed by `source` through a pipe.
    pub fn from_source<S>(
        scheduler: Arc<dyn Scheduler>,
        options: StreamOptions,
        source: &S,
    ) -> Result<Self, StreamError>
    where
        S: Readable + Clone + 'static,
    {
        let stream = Self::with_options(scheduler, options);
        pipe::pipe(source, &stream, PipeOptions::default())
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    /// Queue a chunk for emission.
    ///
    /// Returns `Ok(false)` when the stream is now full and the caller should
    /// hold off until `drain`. The chunk is queued either way.
    pub fn write(&self, chunk: impl Into<Bytes>) -> Result<bool, StreamError> {
        self.write_bytes(chunk.into())
    }

    /// Queue text, converted to bytes with `encoding`.
    pub fn write_str(&self, text: &str, encoding: Encoding) -> Result<bool, StreamError> {
        self.inner.core.lock().check_writable()?;
        let chunk = encoding.encode(text)?;
        self.write_bytes(chunk)
    }

    fn write_bytes(&self, chunk: Bytes) -> Result<bool, StreamError> {
        let full = {
            let mut core = self.inner.core.lock();
            core.check_writable()?;
            core.queue.push(chunk);
            let full = core.is_full();
            if full {
                core.was_full = true;
            }
            full
        };
        self.inner.schedule_flush();
        Ok(!full)
    }

    /// Mark the stream as finished. `end` fires once everything buffered has
    /// been emitted.
    pub fn end(&self) -> Result<(), StreamError> {
        self.finish(None)
    }

    /// Write a final chunk, then end.
    pub fn end_with(&self, chunk: impl Into<Bytes>) -> Result<(), StreamError> {
        self.finish(Some(chunk.into()))
    }

    /// Write final text, then end.
    pub fn end_str(&self, text: &str, encoding: Encoding) -> Result<(), StreamError> {
        if self.is_ended() {
            return Err(StreamError::already_ended());
        }
        let chunk = encoding.encode(text)?;
        self.finish(Some(chunk))
    }

    fn finish(&self, chunk: Option<Bytes>) -> Result<(), StreamError> {
        if self.is_ended() {
            return Err(StreamError::already_ended());
        }
        if let Some(chunk) = chunk {
            self.write_bytes(chunk)?;
        }
        self.inner.core.lock().state.end();
        tracing::debug!(stream = %self.inner.id, "stream ended");
        self.inner.schedule_flush();
        Ok(())
    }

    /// Stop emitting `data`. Writes are still accepted.
    pub fn pause(&self) {
        if self.inner.core.lock().state.pause() {
            tracing::trace!(stream = %self.inner.id, "paused");
        }
    }

    /// Resume emitting.
    pub fn resume(&self) {
        let rearm = {
            let mut core = self.inner.core.lock();
            core.state.resume()
                && (!core.queue.is_empty()
                    || (core.state.is_ended() && !core.state.is_destroyed()))
        };
        if rearm {
            tracing::trace!(stream = %self.inner.id, "resumed");
            self.inner.schedule_flush();
        }
    }

    /// Emit decoded text from now on.
    ///
    /// Bytes the previous decoder was still holding go back to the head of
    /// the queue and are decoded with the new encoding.
    pub fn set_encoding(&self, encoding: Encoding) {
        self.replace_decoder(Some(TextDecoder::new(encoding)));
    }

    /// Parse an encoding name and apply it.
    pub fn set_encoding_name(&self, name: &str) -> Result<(), StreamError> {
        self.set_encoding(name.parse()?);
        Ok(())
    }

    /// Go back to emitting raw bytes. Held bytes are emitted raw.
    pub fn clear_encoding(&self) {
        self.replace_decoder(None);
    }

    fn replace_decoder(&self, decoder: Option<TextDecoder>) {
        let requeued = {
            let mut core = self.inner.core.lock();
            let held = std::mem::replace(&mut core.decoder, decoder)
                .map(|mut old| old.take_pending())
                .unwrap_or_default();
            !held.is_empty() && core.queue.requeue(Bytes::from(held))
        };
        if requeued {
            tracing::trace!(stream = %self.inner.id, "held bytes requeued");
            self.inner.schedule_flush();
        }
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.inner.core.lock().decoder.as_ref().map(|d| d.encoding())
    }

    pub fn set_max_size(&self, max_size: impl Into<MaxSize>) {
        self.inner.core.lock().max_size = max_size.into();
    }

    pub fn max_size(&self) -> MaxSize {
        self.inner.core.lock().max_size
    }

    /// Allow or refuse further writes.
    pub fn set_writable(&self, writable: bool) {
        self.inner.core.lock().writable = writable;
    }

    /// Tear the stream down without delivering what is buffered.
    ///
    /// Emits `close` (not `end`). Does nothing if already destroyed.
    pub fn destroy(&self) {
        let dropped = {
            let mut core = self.inner.core.lock();
            if core.state.is_destroyed() {
                return;
            }
            core.state.destroy();
            core.readable = false;
            core.writable = false;
            core.was_full = false;
            core.decoder = None;
            core.queue.close()
        };
        tracing::debug!(stream = %self.inner.id, dropped, "stream destroyed");
        self.inner.events.emit(&StreamEvent::Close);
    }

    /// Pipe this stream into `dest`, ending it when this stream ends.
    pub fn pipe<D>(&self, dest: &D) -> Result<D, StreamError>
    where
        D: Writable + Clone + 'static,
    {
        pipe::pipe(self, dest, PipeOptions::default())
    }

    pub fn pipe_with<D>(&self, dest: &D, options: PipeOptions) -> Result<D, StreamError>
    where
        D: Writable + Clone + 'static,
    {
        pipe::pipe(self, dest, options)
    }

    /// Bytes currently buffered.
    pub fn size(&self) -> usize {
        self.inner.core.lock().queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.core.lock().queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.core.lock().is_full()
    }

    /// True while another stream is piping into this one.
    pub fn is_piped(&self) -> bool {
        self.inner.core.lock().pipe_source.is_some()
    }

    pub fn pipe_source(&self) -> Option<StreamId> {
        self.inner.core.lock().pipe_source
    }

    pub fn is_paused(&self) -> bool {
        self.inner.core.lock().state.is_paused()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.core.lock().state.is_ended()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.core.lock().state.is_destroyed()
    }

    pub fn is_readable(&self) -> bool {
        self.inner.core.lock().readable
    }

    pub fn is_writable(&self) -> bool {
        self.inner.core.lock().writable
    }

    /// Record `source` as the stream piping into this one and forget it
    /// again once the source ends, closes or errors.
    fn track_source(&self, source: &dyn Readable) -> Result<(), StreamError> {
        let source_id = source.stream_id();
        {
            let mut core = self.inner.core.lock();
            if core.pipe_source.is_some() {
                return Err(StreamError::AlreadyPiped);
            }
            core.pipe_source = Some(source_id);
        }

        let dest = Arc::downgrade(&self.inner);
        let source_events = source.events().downgrade();
        let registered = Arc::new(Mutex::new(Vec::new()));

        let ids = registered.clone();
        let cleanup: Callback = Arc::new(move |_: &StreamEvent| {
            if let Some(inner) = dest.upgrade() {
                let mut core = inner.core.lock();
                if core.pipe_source == Some(source_id) {
                    core.pipe_source = None;
                }
            }
            if let Some(events) = source_events.upgrade() {
                for (kind, id) in ids.lock().drain(..) {
                    events.remove_listener(kind, id);
                }
            }
        });

        for kind in [EventKind::End, EventKind::Close, EventKind::Error] {
            let id = source.add_listener(kind, Listener::from_callback(cleanup.clone()));
            registered.lock().push((kind, id));
        }
        Ok(())
    }
}

impl Emitter for BufferedStream {
    fn events(&self) -> &EventEmitter {
        &self.inner.events
    }
}

impl Readable for BufferedStream {
    fn stream_id(&self) -> StreamId {
        self.inner.id
    }

    fn pause(&self) {
        BufferedStream::pause(self);
    }

    fn resume(&self) {
        BufferedStream::resume(self);
    }

    fn is_readable(&self) -> bool {
        BufferedStream::is_readable(self)
    }
}

impl Writable for BufferedStream {
    fn write(&self, chunk: Bytes) -> Result<bool, StreamError> {
        self.write_bytes(chunk)
    }

    fn end(&self) -> Result<(), StreamError> {
        self.finish(None)
    }

    fn is_writable(&self) -> bool {
        BufferedStream::is_writable(self)
    }

    fn accept_source(&self, source: &dyn Readable) -> Result<(), StreamError> {
        self.track_source(source)
    }
}

impl fmt::Debug for BufferedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("BufferedStream")
            .field("id", &self.inner.id)
            .field("state", &core.state)
            .field("size", &core.queue.size())
            .field("chunks", &core.queue.len())
            .field("max_size", &core.max_size)
            .field("piped", &core.pipe_source.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::events::Payload;

    fn stream_with(options: StreamOptions) -> (Arc<EventLoop>, BufferedStream) {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::with_options(event_loop.clone(), options);
        (event_loop, stream)
    }

    fn record(stream: &BufferedStream) -> Arc<Mutex<Vec<StreamEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Data, EventKind::Drain, EventKind::End, EventKind::Close] {
            let log = log.clone();
            stream.on(kind, move |event| log.lock().push(event.clone()));
        }
        log
    }

    #[test]
    fn test_new_stream() {
        let (_, stream) = stream_with(StreamOptions::default());
        assert!(stream.is_empty());
        assert!(!stream.is_full());
        assert!(!stream.is_piped());
        assert!(stream.is_readable());
        assert!(stream.is_writable());
        assert!(!stream.is_paused());
        assert!(!stream.is_ended());
        assert_eq!(stream.encoding(), None);
        assert_eq!(stream.max_size(), MaxSize::Bounded(65536));
    }

    #[test]
    fn test_start_paused_option() {
        let (event_loop, stream) = stream_with(StreamOptions::new().paused(true));
        let log = record(&stream);
        assert!(stream.is_paused());

        stream.end_with("x").unwrap();
        event_loop.run_until_idle();
        assert!(log.lock().is_empty());

        stream.resume();
        event_loop.run_until_idle();
        assert_eq!(
            *log.lock(),
            vec![
                StreamEvent::Data(Payload::Binary(Bytes::from_static(b"x"))),
                StreamEvent::End
            ]
        );
    }

    #[test]
    fn test_max_size_zero_is_not_full() {
        let (_, stream) = stream_with(StreamOptions::new().max_size(0));
        assert!(!stream.is_full());
        assert!(stream.write(Bytes::new()).unwrap());
        assert!(!stream.write("a").unwrap());
        assert!(stream.is_full());
    }

    #[test]
    fn test_full_boundary() {
        let (_, stream) = stream_with(StreamOptions::new().max_size(4));
        assert!(stream.write("abcd").unwrap());
        assert!(!stream.is_full());
        assert!(!stream.write("e").unwrap());
        assert!(stream.is_full());
        assert_eq!(stream.size(), 5);
    }

    #[test]
    fn test_unbounded_never_full() {
        let (_, stream) = stream_with(StreamOptions::new().unbounded());
        assert!(stream.write(vec![0u8; 1 << 20]).unwrap());
        assert!(!stream.is_full());
    }

    #[test]
    fn test_set_max_size() {
        let (_, stream) = stream_with(StreamOptions::default());
        stream.write("abcd").unwrap();
        stream.set_max_size(2);
        assert!(stream.is_full());
        assert_eq!(stream.max_size(), MaxSize::Bounded(2));

        stream.set_max_size(MaxSize::Unbounded);
        assert!(!stream.is_full());
    }

    #[test]
    fn test_write_not_writable() {
        let (_, stream) = stream_with(StreamOptions::default());
        stream.set_writable(false);
        assert_eq!(stream.write("test"), Err(StreamError::not_writable()));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_write_after_end() {
        let (_, stream) = stream_with(StreamOptions::default());
        stream.end().unwrap();
        assert!(stream.is_ended());
        assert_eq!(stream.write("test"), Err(StreamError::already_ended()));
        assert_eq!(stream.end(), Err(StreamError::already_ended()));
        assert_eq!(
            stream.write_str("zz", Encoding::Hex),
            Err(StreamError::already_ended())
        );
    }

    #[test]
    fn test_write_str_invalid_data_does_not_queue() {
        let (_, stream) = stream_with(StreamOptions::default());
        let err = stream.write_str("not base64!", Encoding::Base64).unwrap_err();
        assert!(matches!(err, StreamError::InvalidData { .. }));
        assert!(stream.is_empty());
        assert_eq!(stream.size(), 0);
    }

    #[test]
    fn test_set_encoding() {
        let (_, stream) = stream_with(StreamOptions::default());
        stream.set_encoding(Encoding::Utf8);
        assert_eq!(stream.encoding(), Some(Encoding::Utf8));
        stream.set_encoding_name("base64").unwrap();
        assert_eq!(stream.encoding(), Some(Encoding::Base64));
        assert!(stream.set_encoding_name("ebcdic").is_err());
        stream.clear_encoding();
        assert_eq!(stream.encoding(), None);
    }

    #[test]
    fn test_destroy_drops_data_and_emits_close() {
        let (event_loop, stream) = stream_with(StreamOptions::default());
        let log = record(&stream);
        stream.write("lost").unwrap();

        stream.destroy();
        stream.destroy();
        assert!(stream.is_destroyed());
        assert!(!stream.is_readable());
        assert!(!stream.is_writable());
        assert!(stream.is_empty());
        assert_eq!(stream.write("x"), Err(StreamError::not_writable()));

        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![StreamEvent::Close]);
    }

    #[test]
    fn test_debug_output() {
        let (_, stream) = stream_with(StreamOptions::default());
        stream.write("abc").unwrap();
        let debug = format!("{stream:?}");
        assert!(debug.contains("BufferedStream"));
        assert!(debug.contains("size: 3"));
    }
}
