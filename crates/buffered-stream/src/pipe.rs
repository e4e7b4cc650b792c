//! Pipes: forwarding one stream's output into another's `write`/`end`.
//!
//! Backpressure travels the other way. When the destination's `write`
//! returns `false` the source is paused, and the destination's `drain`
//! resumes it.
//!
//! Anything can take part in a pipe by implementing [`Readable`] (a
//! producer that can be paused) or [`Writable`] (a consumer).

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::StreamError;
use crate::events::{
    Callback, Emitter, EventEmitter, EventKind, Listener, ListenerId, StreamEvent, StreamId,
    WeakEventEmitter,
};
use crate::options::PipeOptions;

/// A producer that raises `data`/`end`/`close`/`error` and can be paused.
pub trait Readable: Emitter + Send + Sync {
    fn stream_id(&self) -> StreamId;

    fn pause(&self);

    fn resume(&self);

    fn is_readable(&self) -> bool;
}

/// A consumer that accepts chunks and raises `drain`/`close`/`error`.
pub trait Writable: Emitter + Send + Sync {
    /// Accept a chunk. `Ok(false)` asks the writer to pause until `drain`.
    fn write(&self, chunk: Bytes) -> Result<bool, StreamError>;

    fn end(&self) -> Result<(), StreamError>;

    fn is_writable(&self) -> bool;

    /// Called before a pipe from `source` is wired up. Destinations that
    /// allow a single source reject the second one here.
    fn accept_source(&self, _source: &dyn Readable) -> Result<(), StreamError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Source,
    Dest,
}

/// Listeners installed by one `pipe` call, so they can all be removed
/// together.
struct PipeLinks {
    source_id: StreamId,
    source: WeakEventEmitter,
    dest: WeakEventEmitter,
    installed: Mutex<Vec<(Side, EventKind, ListenerId)>>,
    detached: AtomicBool,
}

impl PipeLinks {
    fn new(source_id: StreamId, source: &EventEmitter, dest: &EventEmitter) -> Arc<Self> {
        Arc::new(Self {
            source_id,
            source: source.downgrade(),
            dest: dest.downgrade(),
            installed: Mutex::new(Vec::new()),
            detached: AtomicBool::new(false),
        })
    }

    fn install(&self, side: Side, target: &EventEmitter, kind: EventKind, listener: Listener) {
        let id = target.add_listener(kind, listener);
        self.installed.lock().push((side, kind, id));
    }

    fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let installed = std::mem::take(&mut *self.installed.lock());
        let source = self.source.upgrade();
        let dest = self.dest.upgrade();
        for (side, kind, id) in installed {
            let target = match side {
                Side::Source => source.as_ref(),
                Side::Dest => dest.as_ref(),
            };
            if let Some(events) = target {
                events.remove_listener(kind, id);
            }
        }
        tracing::debug!(source = %self.source_id, "pipe detached");
    }
}

/// Surface an error that happened inside a listener, where there is no
/// caller to return it to.
fn report<W: Writable>(dest: &W, error: StreamError) {
    if let Err(unhandled) = dest.emit_error(error) {
        tracing::error!(error = %unhandled, "unhandled error while piping");
    }
}

/// Connect `source` to `dest` and start the flow.
///
/// Returns a handle to `dest` so pipes can be chained:
/// `a.pipe(&b)?.pipe(&c)?`.
pub fn pipe<S, D>(source: &S, dest: &D, options: PipeOptions) -> Result<D, StreamError>
where
    S: Readable + Clone + 'static,
    D: Writable + Clone + 'static,
{
    dest.accept_source(source)?;

    let source_id = source.stream_id();
    let links = PipeLinks::new(source_id, source.events(), dest.events());

    let (src, dst) = (source.clone(), dest.clone());
    links.install(
        Side::Source,
        source.events(),
        EventKind::Data,
        Listener::new(move |event| {
            let StreamEvent::Data(payload) = event else {
                return;
            };
            if !dst.is_writable() {
                return;
            }
            match dst.write(payload.to_bytes()) {
                Ok(true) => {}
                Ok(false) => src.pause(),
                Err(err) => report(&dst, err),
            }
        }),
    );

    let src = source.clone();
    links.install(
        Side::Dest,
        dest.events(),
        EventKind::Drain,
        Listener::new(move |_| {
            if src.is_readable() {
                src.resume();
            }
        }),
    );

    if options.end {
        let ended = AtomicBool::new(false);
        let dst = dest.clone();
        let on_end: Callback = Arc::new(move |_: &StreamEvent| {
            if ended.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Err(err) = dst.end() {
                report(&dst, err);
            }
        });
        for kind in [EventKind::End, EventKind::Close] {
            links.install(
                Side::Source,
                source.events(),
                kind,
                Listener::from_callback(on_end.clone()),
            );
        }
    }

    // The erroring side's emit_error decides whether the error escalates.
    let l = links.clone();
    let on_error: Callback = Arc::new(move |_: &StreamEvent| l.detach());
    links.install(
        Side::Source,
        source.events(),
        EventKind::Error,
        Listener::from_callback(on_error.clone()),
    );
    links.install(
        Side::Dest,
        dest.events(),
        EventKind::Error,
        Listener::from_callback(on_error),
    );

    let l = links.clone();
    let cleanup: Callback = Arc::new(move |_: &StreamEvent| l.detach());
    for kind in [EventKind::End, EventKind::Close] {
        links.install(
            Side::Source,
            source.events(),
            kind,
            Listener::from_callback(cleanup.clone()),
        );
    }
    links.install(
        Side::Dest,
        dest.events(),
        EventKind::Close,
        Listener::from_callback(cleanup),
    );

    tracing::debug!(source = %source_id, end = options.end, "pipe attached");
    dest.emit(&StreamEvent::Pipe(source_id));

    source.resume();
    Ok(dest.clone())
}
