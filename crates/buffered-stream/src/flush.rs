//! Deferred flushing: the scheduler side and the emission side.
//!
//! `write`, `end` and `resume` arm a flush task on the stream's scheduler.
//! At most one task is pending per stream. When it runs, it performs a
//! drain pass and re-arms itself for another turn until the queue is empty
//! or the stream is paused.

use std::sync::Arc;

use crate::events::{Payload, StreamEvent};
use crate::stream::{Core, Inner};

/// What a drain pass has to announce once the queue lock is released.
enum Settled {
    Nothing,
    Drain,
    /// Text the decoder held back, due before `end`.
    Tail(String),
    End,
}

impl Inner {
    /// Queue a flush for a later turn unless one is already pending.
    pub(crate) fn schedule_flush(self: &Arc<Self>) {
        {
            let mut core = self.core.lock();
            if core.flushing {
                return;
            }
            core.flushing = true;
        }
        self.defer_tick();
    }

    fn defer_tick(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.scheduler.defer(Box::new(move || inner.flush_tick()));
    }

    fn flush_tick(self: Arc<Self>) {
        {
            let mut core = self.core.lock();
            if core.state.is_paused() {
                // resume() arms a new flush
                core.flushing = false;
                tracing::trace!(stream = %self.id, "flush skipped, paused");
                return;
            }
        }

        self.drain_pass();

        let again = {
            let mut core = self.core.lock();
            if core.queue.is_empty() {
                core.flushing = false;
                false
            } else {
                true
            }
        };
        if again {
            tracing::trace!(stream = %self.id, "flush re-armed");
            self.defer_tick();
        }
    }

    /// Emit queued chunks until the queue is empty or a listener pauses the
    /// stream, then settle `end` or `drain`.
    fn drain_pass(&self) {
        let mut emitted = 0usize;
        loop {
            let payload = {
                let mut core = self.core.lock();
                if core.state.is_paused() || core.state.is_destroyed() {
                    break;
                }
                let Some(chunk) = core.queue.pop() else {
                    break;
                };
                match core.decoder.as_mut() {
                    // the whole chunk may be held back by the decoder
                    Some(decoder) => Some(decoder.decode(&chunk))
                        .filter(|text| !text.is_empty())
                        .map(Payload::Text),
                    None => Some(Payload::Binary(chunk)),
                }
            };
            let Some(payload) = payload else {
                continue;
            };
            emitted += 1;
            // Listeners may pause, write or end this stream from here.
            self.events.emit(&StreamEvent::Data(payload));
        }

        let settled = {
            let mut core = self.core.lock();
            if core.state.is_destroyed() {
                Settled::Nothing
            } else if core.state.is_ended() {
                if core.state.is_paused() || !core.queue.is_empty() {
                    Settled::Nothing
                } else if let Some(tail) = core.decoder.as_mut().and_then(|d| d.finish()) {
                    Settled::Tail(tail)
                } else {
                    Self::terminate(&mut core);
                    Settled::End
                }
            } else if core.was_full && !core.is_full() {
                core.was_full = false;
                Settled::Drain
            } else {
                Settled::Nothing
            }
        };
        tracing::trace!(stream = %self.id, emitted, "drain pass");

        match settled {
            Settled::Nothing => {}
            Settled::Drain => {
                tracing::debug!(stream = %self.id, "drain");
                self.events.emit(&StreamEvent::Drain);
            }
            Settled::Tail(text) => {
                self.events.emit(&StreamEvent::Data(Payload::Text(text)));
                // a listener may have paused on the last chunk
                let ended = {
                    let mut core = self.core.lock();
                    let ready = !core.state.is_paused() && !core.state.is_destroyed();
                    if ready {
                        Self::terminate(&mut core);
                    }
                    ready
                };
                if ended {
                    self.emit_end();
                }
            }
            Settled::End => self.emit_end(),
        }
    }

    fn terminate(core: &mut Core) {
        core.queue.close();
        core.state.destroy();
        core.readable = false;
        core.writable = false;
        core.was_full = false;
    }

    fn emit_end(&self) {
        tracing::debug!(stream = %self.id, "end");
        self.events.emit(&StreamEvent::End);
    }
}

#[cfg(test)]
mod tests {
    use crate::encoding::Encoding;
    use crate::event_loop::EventLoop;
    use crate::events::{Emitter, EventKind, Payload, StreamEvent};
    use crate::options::StreamOptions;
    use crate::stream::BufferedStream;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn bin(s: &'static str) -> StreamEvent {
        StreamEvent::Data(Payload::Binary(Bytes::from_static(s.as_bytes())))
    }

    fn text(s: &str) -> StreamEvent {
        StreamEvent::Data(Payload::Text(s.to_string()))
    }

    fn record(stream: &BufferedStream) -> Arc<Mutex<Vec<StreamEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Data, EventKind::Drain, EventKind::End] {
            let log = log.clone();
            stream.on(kind, move |event| log.lock().push(event.clone()));
        }
        log
    }

    #[test]
    fn test_emission_waits_for_later_turn() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());

        stream.write("He").unwrap();
        stream.write("llo").unwrap();
        stream.end().unwrap();
        // attached after the writes, still sees everything
        let log = record(&stream);
        assert!(log.lock().is_empty());
        assert_eq!(event_loop.pending(), 1);

        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![bin("He"), bin("llo"), StreamEvent::End]);
        assert!(stream.is_empty());
        assert!(!stream.is_full());
        assert!(stream.is_destroyed());
        assert!(!stream.is_readable());
        assert!(!stream.is_writable());
    }

    #[test]
    fn test_single_pending_flush() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        for _ in 0..5 {
            stream.write("x").unwrap();
        }
        assert_eq!(event_loop.pending(), 1);
    }

    #[test]
    fn test_pause_inside_data_handler() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        let log = record(&stream);

        let s = stream.clone();
        stream.once(EventKind::Data, move |_| s.pause());

        stream.write("a").unwrap();
        stream.write("b").unwrap();
        stream.write("c").unwrap();
        stream.end().unwrap();
        event_loop.run_until_idle();

        assert_eq!(*log.lock(), vec![bin("a")]);
        assert!(stream.is_paused());
        assert_eq!(stream.size(), 2);

        stream.resume();
        event_loop.run_until_idle();
        assert_eq!(
            *log.lock(),
            vec![bin("a"), bin("b"), bin("c"), StreamEvent::End]
        );
    }

    #[test]
    fn test_end_fires_once_across_pause_resume() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        stream.end_with("Hello world").unwrap();
        stream.pause();
        stream.resume();
        stream.pause();
        stream.resume();

        let ends = Arc::new(Mutex::new(0));
        let e = ends.clone();
        stream.on(EventKind::End, move |_| *e.lock() += 1);

        event_loop.run_until_idle();
        stream.resume();
        event_loop.run_until_idle();
        assert_eq!(*ends.lock(), 1);
    }

    #[test]
    fn test_end_waits_for_resume() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        let log = record(&stream);
        stream.pause();
        stream.end().unwrap();

        event_loop.run_until_idle();
        assert!(log.lock().is_empty());
        assert!(!stream.is_destroyed());

        stream.resume();
        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![StreamEvent::End]);
    }

    #[test]
    fn test_drain_once_per_overflow() {
        let event_loop = EventLoop::new();
        let stream =
            BufferedStream::with_options(event_loop.clone(), StreamOptions::new().max_size(4));
        let log = record(&stream);

        assert!(stream.write("abc").unwrap());
        assert!(!stream.write("def").unwrap());
        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![bin("abc"), bin("def"), StreamEvent::Drain]);

        // not full this time: no drain owed
        assert!(stream.write("g").unwrap());
        event_loop.run_until_idle();
        assert_eq!(
            *log.lock(),
            vec![bin("abc"), bin("def"), StreamEvent::Drain, bin("g")]
        );
    }

    #[test]
    fn test_drain_while_paused() {
        let event_loop = EventLoop::new();
        let stream =
            BufferedStream::with_options(event_loop.clone(), StreamOptions::new().max_size(4));
        let log = record(&stream);
        let s = stream.clone();
        stream.once(EventKind::Data, move |_| s.pause());

        stream.write("abc").unwrap();
        assert!(!stream.write("def").unwrap());
        event_loop.run_until_idle();

        // three bytes left, no longer over the limit
        assert!(stream.is_paused());
        assert_eq!(*log.lock(), vec![bin("abc"), StreamEvent::Drain]);

        stream.resume();
        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![bin("abc"), StreamEvent::Drain, bin("def")]);
    }

    #[test]
    fn test_no_drain_after_terminal_end() {
        let event_loop = EventLoop::new();
        let stream =
            BufferedStream::with_options(event_loop.clone(), StreamOptions::new().max_size(3));
        stream.end_with("hello").unwrap();
        assert!(stream.is_full());
        let log = record(&stream);

        let s = stream.clone();
        stream.once(EventKind::Data, move |_| s.pause());
        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![bin("hello")]);

        stream.resume();
        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![bin("hello"), StreamEvent::End]);
    }

    #[test]
    fn test_encoding_emits_text() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::with_options(
            event_loop.clone(),
            StreamOptions::new().encoding(Encoding::Utf8),
        );
        let log = record(&stream);
        stream.write("Hello").unwrap();
        stream.end_with(" world").unwrap();
        event_loop.run_until_idle();
        assert_eq!(
            *log.lock(),
            vec![text("Hello"), text(" world"), StreamEvent::End]
        );
    }

    #[test]
    fn test_split_utf8_tail_flushed_before_end() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        stream.set_encoding(Encoding::Utf8);
        let log = record(&stream);

        stream.write(Bytes::from_static(&[b'a', 0xE2, 0x82])).unwrap();
        stream.end().unwrap();
        event_loop.run_until_idle();
        assert_eq!(
            *log.lock(),
            vec![text("a"), text("\u{FFFD}"), StreamEvent::End]
        );
    }

    #[test]
    fn test_pause_on_decoder_tail_holds_end() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        stream.set_encoding(Encoding::Utf8);
        let log = record(&stream);
        let s = stream.clone();
        stream.on(EventKind::Data, move |event| {
            if matches!(event, StreamEvent::Data(Payload::Text(t)) if t == "\u{FFFD}") {
                s.pause();
            }
        });

        stream.end_with(Bytes::from_static(&[b'a', 0xE2])).unwrap();
        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![text("a"), text("\u{FFFD}")]);
        assert!(stream.is_paused());
        assert!(!stream.is_destroyed());

        stream.resume();
        event_loop.run_until_idle();
        assert_eq!(
            *log.lock(),
            vec![text("a"), text("\u{FFFD}"), StreamEvent::End]
        );
    }

    #[test]
    fn test_fully_held_chunk_emits_nothing() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::with_options(
            event_loop.clone(),
            StreamOptions::new().encoding(Encoding::Base64),
        );
        let log = record(&stream);

        stream.write("he").unwrap();
        event_loop.run_until_idle();
        assert!(log.lock().is_empty());

        stream.end().unwrap();
        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![text("aGU="), StreamEvent::End]);
    }

    #[test]
    fn test_clear_encoding_keeps_held_bytes() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        stream.set_encoding(Encoding::Utf8);
        let out = Arc::new(Mutex::new(Vec::new()));
        let o = out.clone();
        stream.on(EventKind::Data, move |event| {
            if let StreamEvent::Data(payload) = event {
                o.lock().extend_from_slice(payload.as_bytes());
            }
        });

        stream.write(Bytes::from_static(&[0x61, 0xE2])).unwrap();
        event_loop.run_until_idle();
        stream.clear_encoding();
        stream.write(Bytes::from_static(&[0x82, 0xAC])).unwrap();
        stream.end().unwrap();
        event_loop.run_until_idle();

        assert_eq!(*out.lock(), vec![0x61, 0xE2, 0x82, 0xAC]);
        assert!(stream.is_destroyed());
    }

    #[test]
    fn test_set_encoding_redecodes_held_bytes() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        stream.set_encoding(Encoding::Utf8);
        let log = record(&stream);

        // first two bytes of the euro sign
        stream.write(Bytes::from_static(&[b'a', 0xE2, 0x82])).unwrap();
        event_loop.run_until_idle();
        stream.set_encoding(Encoding::Utf8);
        assert_eq!(stream.size(), 2);

        stream.end_with(Bytes::from_static(&[0xAC])).unwrap();
        event_loop.run_until_idle();
        assert_eq!(
            *log.lock(),
            vec![text("a"), text("\u{20AC}"), StreamEvent::End]
        );
    }

    #[test]
    fn test_write_from_data_handler_is_delivered() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        let log = record(&stream);

        let s = stream.clone();
        stream.once(EventKind::Data, move |_| {
            s.write("second").unwrap();
        });
        stream.write("first").unwrap();
        event_loop.run_until_idle();
        assert_eq!(*log.lock(), vec![bin("first"), bin("second")]);
    }

    #[test]
    fn test_paused_flush_does_not_rearm() {
        let event_loop = EventLoop::new();
        let stream = BufferedStream::new(event_loop.clone());
        stream.write("x").unwrap();
        stream.pause();
        event_loop.run_until_idle();
        assert!(event_loop.is_idle());
        assert_eq!(stream.size(), 1);

        stream.resume();
        assert_eq!(event_loop.pending(), 1);
    }
}
