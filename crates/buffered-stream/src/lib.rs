//! # Buffered Stream
//!
//! In-memory byte stream with Node-style flow control:
//! - chunks are queued by `write` and delivered to `data` listeners on a
//!   later turn of a [`Scheduler`]
//! - `pause`/`resume` gate delivery without refusing writes
//! - a soft `max_size` turns `write` into a backpressure signal, with a
//!   single `drain` once the backlog clears
//! - `pipe` connects streams (or any [`Readable`]/[`Writable`]) and
//!   propagates backpressure and end-of-stream
//!
//! ## Example
//!
//! ```
//! use buffered_stream::{BufferedStream, Emitter, EventKind, EventLoop, StreamEvent};
//! use std::sync::{Arc, Mutex};
//!
//! let event_loop = EventLoop::new();
//! let source = BufferedStream::new(event_loop.clone());
//! let dest = BufferedStream::new(event_loop.clone());
//! source.pipe(&dest).unwrap();
//!
//! let ended = Arc::new(Mutex::new(false));
//! let flag = ended.clone();
//! dest.on(EventKind::End, move |_| *flag.lock().unwrap() = true);
//!
//! source.end_with("Hello world").unwrap();
//! event_loop.run_until_idle();
//! assert!(*ended.lock().unwrap());
//! ```

#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod event_loop;
pub mod events;
mod flush;
pub mod options;
pub mod pipe;
pub mod queue;
pub mod state;
pub mod stream;

pub use encoding::{Encoding, TextDecoder};
pub use error::{InvalidState, StreamError};
pub use event_loop::{EventLoop, Scheduler, Task};
pub use events::{
    Emitter, EventEmitter, EventKind, Listener, ListenerId, Payload, StreamEvent, StreamId,
};
pub use options::{DEFAULT_MAX_SIZE, MaxSize, PipeOptions, StreamOptions};
pub use pipe::{Readable, Writable, pipe};
pub use queue::ChunkQueue;
pub use state::FlowState;
pub use stream::BufferedStream;
