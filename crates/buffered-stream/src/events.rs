//! Event registration for streams (`on`/`off`/`emit`).
//!
//! Listeners are stored per [`EventKind`] in registration order. Emitting
//! takes a snapshot of the listeners first, so callbacks may add or remove
//! listeners (including themselves) and may call back into the stream that
//! is emitting.
//!
//! # Example
//!
//! ```
//! use buffered_stream::events::{EventEmitter, EventKind, StreamEvent};
//!
//! let emitter = EventEmitter::new();
//! emitter.on(EventKind::Drain, |_| println!("drained"));
//! assert!(emitter.emit(&StreamEvent::Drain));
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::StreamError;

/// Listeners per event beyond which a possible leak is logged.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst))
}

/// Process-unique identity of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocate a fresh id. External sources and sinks use this to take part
    /// in pipes.
    pub fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle returned when a listener is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Names of the events a stream raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Drain,
    End,
    Close,
    Error,
    Pipe,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Data => "data",
            EventKind::Drain => "drain",
            EventKind::End => "end",
            EventKind::Close => "close",
            EventKind::Error => "error",
            EventKind::Pipe => "pipe",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Chunk delivered by a `data` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw bytes, emitted when no encoding is set.
    Binary(Bytes),
    /// Decoded text, emitted when an encoding is set.
    Text(String),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Binary(b) => b,
            Payload::Text(s) => s.as_bytes(),
        }
    }

    /// Bytes suitable for writing into another stream. Text is written as
    /// its UTF-8 representation.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Binary(b) => b.clone(),
            Payload::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
        }
    }
}

/// An event raised by a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(Payload),
    Drain,
    End,
    Close,
    Error(StreamError),
    /// Raised on a destination when a source is piped into it.
    Pipe(StreamId),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Data(_) => EventKind::Data,
            StreamEvent::Drain => EventKind::Drain,
            StreamEvent::End => EventKind::End,
            StreamEvent::Close => EventKind::Close,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::Pipe(_) => EventKind::Pipe,
        }
    }
}

/// Listener callback.
pub type Callback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// A registered event listener.
#[derive(Clone)]
pub struct Listener {
    /// Unique identifier for this listener.
    pub id: ListenerId,

    /// Whether this is a one-time listener (added via `once`).
    pub once: bool,

    callback: Callback,
}

impl Listener {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        Self::from_callback(Arc::new(callback))
    }

    pub fn once<F>(callback: F) -> Self
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        Self {
            once: true,
            ..Self::new(callback)
        }
    }

    /// Wrap an already shared callback, so one closure can serve several
    /// events.
    pub fn from_callback(callback: Callback) -> Self {
        Self {
            id: next_listener_id(),
            once: false,
            callback,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("once", &self.once)
            .finish_non_exhaustive()
    }
}

/// Listener table behind an [`EventEmitter`].
#[derive(Debug, Default)]
pub struct EventEmitterState {
    listeners: HashMap<EventKind, Vec<Listener>>,
}

impl EventEmitterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Returns its id and whether the per-event limit is
    /// now exceeded.
    pub fn add_listener(&mut self, event: EventKind, listener: Listener) -> (ListenerId, bool) {
        let id = listener.id;
        let listeners = self.listeners.entry(event).or_default();
        listeners.push(listener);

        let should_warn = listeners.len() > DEFAULT_MAX_LISTENERS;
        (id, should_warn)
    }

    pub fn remove_listener(&mut self, event: EventKind, id: ListenerId) -> bool {
        if let Some(listeners) = self.listeners.get_mut(&event)
            && let Some(pos) = listeners.iter().position(|l| l.id == id)
        {
            listeners.remove(pos);
            return true;
        }
        false
    }

    pub fn listener_count(&self, event: EventKind) -> usize {
        self.listeners.get(&event).map(|l| l.len()).unwrap_or(0)
    }

    /// Callbacks to run for one emit, in call order. One-time listeners are
    /// removed as part of taking the snapshot.
    fn take_for_emit(&mut self, event: EventKind) -> Vec<Callback> {
        let Some(listeners) = self.listeners.get_mut(&event) else {
            return Vec::new();
        };
        let callbacks: Vec<Callback> = listeners.iter().map(|l| l.callback.clone()).collect();
        listeners.retain(|l| !l.once);
        callbacks
    }
}

/// Shared, clonable event emitter.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    state: Arc<Mutex<EventEmitterState>>,
}

/// Non-owning handle to an [`EventEmitter`].
#[derive(Debug, Clone)]
pub struct WeakEventEmitter {
    state: Weak<Mutex<EventEmitterState>>,
}

impl WeakEventEmitter {
    pub fn upgrade(&self) -> Option<EventEmitter> {
        self.state.upgrade().map(|state| EventEmitter { state })
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakEventEmitter {
        WeakEventEmitter {
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn add_listener(&self, event: EventKind, listener: Listener) -> ListenerId {
        let (id, should_warn) = self.state.lock().add_listener(event, listener);
        if should_warn {
            tracing::warn!(
                event = %event,
                count = self.listener_count(event),
                "possible listener leak: more listeners than the configured maximum"
            );
        }
        id
    }

    pub fn on<F>(&self, event: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.add_listener(event, Listener::new(callback))
    }

    pub fn once<F>(&self, event: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.add_listener(event, Listener::once(callback))
    }

    pub fn remove_listener(&self, event: EventKind, id: ListenerId) -> bool {
        self.state.lock().remove_listener(event, id)
    }

    pub fn listener_count(&self, event: EventKind) -> usize {
        self.state.lock().listener_count(event)
    }

    /// Call every listener of the event's kind. Returns `false` when nobody
    /// was listening.
    ///
    /// The lock is released before any callback runs.
    pub fn emit(&self, event: &StreamEvent) -> bool {
        let callbacks = self.state.lock().take_for_emit(event.kind());
        if callbacks.is_empty() {
            return false;
        }
        for callback in callbacks {
            callback(event);
        }
        true
    }
}

/// Capability to register for and raise stream events.
///
/// Anything that composes an [`EventEmitter`] gets the full `on`/`off`/`emit`
/// surface by returning it from [`Emitter::events`].
pub trait Emitter {
    fn events(&self) -> &EventEmitter;

    fn add_listener(&self, event: EventKind, listener: Listener) -> ListenerId {
        self.events().add_listener(event, listener)
    }

    fn on<F>(&self, event: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
        Self: Sized,
    {
        self.events().on(event, callback)
    }

    fn once<F>(&self, event: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
        Self: Sized,
    {
        self.events().once(event, callback)
    }

    fn off(&self, event: EventKind, id: ListenerId) -> bool {
        self.events().remove_listener(event, id)
    }

    fn emit(&self, event: &StreamEvent) -> bool {
        self.events().emit(event)
    }

    fn listener_count(&self, event: EventKind) -> usize {
        self.events().listener_count(event)
    }

    /// Emit an `error` event.
    ///
    /// If no error listener remains once the event has been delivered, the
    /// error counts as unhandled and is returned as
    /// [`StreamError::Unhandled`].
    fn emit_error(&self, error: StreamError) -> Result<(), StreamError> {
        let events = self.events();
        events.emit(&StreamEvent::Error(error.clone()));
        if events.listener_count(EventKind::Error) == 0 {
            return Err(StreamError::Unhandled(Box::new(error)));
        }
        Ok(())
    }
}

impl Emitter for EventEmitter {
    fn events(&self) -> &EventEmitter {
        self
    }
}
