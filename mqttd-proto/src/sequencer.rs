use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::transport::{self, Transport};
use crate::workers::WorkerPool;

/// Invoked after a frame left the socket (`true`) or was dropped because
/// the connection died first (`false`).
pub(crate) type OnSent = Box<dyn FnOnce(bool) + Send + 'static>;

/// One encoded control packet queued for emission.
pub(crate) struct Frame {
    pub bytes: Vec<u8>,
    pub on_sent: Option<OnSent>,
}

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Frame { bytes, on_sent: None }
    }

    pub fn with_callback(bytes: Vec<u8>, on_sent: OnSent) -> Self {
        Frame {
            bytes,
            on_sent: Some(on_sent),
        }
    }
}

struct SeqState {
    queue: VecDeque<Frame>,
    draining: bool,
    closed: bool,
}

/// Per-connection outbound serializer.
///
/// Multiple workers produce replies to different packets on the same
/// connection concurrently; every write funnels through this queue so
/// frames never interleave at the TCP level. One drain task at a time
/// runs on the worker pool and owns the socket's write side.
pub(crate) struct Sequencer {
    inner: Arc<SeqInner>,
}

struct SeqInner {
    state: Mutex<SeqState>,
    drained: Condvar,
    write_window: Duration,
}

impl Sequencer {
    pub fn new(write_window: Duration) -> Self {
        Sequencer {
            inner: Arc::new(SeqInner {
                state: Mutex::new(SeqState {
                    queue: VecDeque::new(),
                    draining: false,
                    closed: false,
                }),
                drained: Condvar::new(),
                write_window,
            }),
        }
    }

    /// Enqueues a frame, taking ownership of its buffer.
    ///
    /// Returns false only when the connection is already dead; the frame's
    /// callback still fires (with `false`) in that case.
    pub fn send(
        &self,
        pool: &Arc<WorkerPool>,
        transport: Arc<dyn Transport>,
        on_dead: impl FnOnce() + Send + 'static,
        frame: Frame,
    ) -> bool {
        let schedule = {
            let mut state = self.inner.state.lock();
            if state.closed {
                drop(state);
                if let Some(on_sent) = frame.on_sent {
                    on_sent(false);
                }
                return false;
            }

            state.queue.push_back(frame);
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if schedule {
            let inner = Arc::clone(&self.inner);
            pool.execute(move || inner.drain(transport, on_dead));
        }

        true
    }

    /// Blocks until every queued frame left the socket, or the window closes.
    pub fn wait_drained(&self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        let mut state = self.inner.state.lock();

        while !state.queue.is_empty() || state.draining {
            if state.closed {
                return state.queue.is_empty();
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner
                .drained
                .wait_for(&mut state, deadline.duration_since(now));
        }

        true
    }

    /// Marks the connection dead and flushes the queue as failed.
    pub fn close(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.queue.drain(..).collect::<Vec<_>>()
        };

        for frame in dropped {
            if let Some(on_sent) = frame.on_sent {
                on_sent(false);
            }
        }

        self.inner.drained.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Arms the queue again after a reconnect swapped in a new transport.
    pub fn reopen(&self) {
        let mut state = self.inner.state.lock();
        state.closed = false;
        state.draining = false;
        state.queue.clear();
    }

    /// Queued frames not yet written.
    pub fn depth(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl SeqInner {
    fn drain(self: Arc<Self>, transport: Arc<dyn Transport>, on_dead: impl FnOnce()) {
        loop {
            let frame = {
                let mut state = self.state.lock();
                if state.closed {
                    // close() flushed whatever was still queued
                    state.draining = false;
                    drop(state);
                    self.drained.notify_all();
                    return;
                }
                match state.queue.pop_front() {
                    Some(frame) => frame,
                    None => {
                        state.draining = false;
                        drop(state);
                        self.drained.notify_all();
                        return;
                    }
                }
            };

            match transport::write_all(transport.as_ref(), &frame.bytes, self.write_window) {
                Ok(()) => {
                    trace!("sequencer wrote {} bytes", frame.bytes.len());
                    if let Some(on_sent) = frame.on_sent {
                        on_sent(true);
                    }
                }
                Err(err) => {
                    warn!("sequencer write failed: {}", err);
                    if let Some(on_sent) = frame.on_sent {
                        on_sent(false);
                    }
                    {
                        let mut state = self.state.lock();
                        state.closed = true;
                        state.draining = false;
                    }
                    self.drained.notify_all();
                    // surviving queue entries are flushed by close()
                    on_dead();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    use crate::transport::TcpTransport;

    use super::*;

    fn pair() -> (Arc<dyn Transport>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Arc::new(TcpTransport::new(client)), server)
    }

    #[test]
    fn test_frames_emitted_in_order() {
        let pool = WorkerPool::new(Default::default());
        let (transport, mut peer) = pair();
        let sequencer = Sequencer::new(Duration::from_secs(1));

        for chunk in &[&b"first."[..], b"second.", b"third."] {
            assert!(sequencer.send(
                &pool,
                Arc::clone(&transport),
                || {},
                Frame::new(chunk.to_vec()),
            ));
        }

        assert!(sequencer.wait_drained(Duration::from_secs(5)));

        let expected = b"first.second.third.";
        let mut buf = [0u8; 64];
        let mut read = 0;
        while read < expected.len() {
            read += peer.read(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf[..expected.len()], &expected[..]);
        pool.shutdown();
    }

    #[test]
    fn test_send_after_close_reports_dead() {
        let pool = WorkerPool::new(Default::default());
        let (transport, _peer) = pair();
        let sequencer = Sequencer::new(Duration::from_secs(1));

        sequencer.close();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let sent = sequencer.send(
            &pool,
            transport,
            || {},
            Frame::with_callback(b"late".to_vec(), Box::new(move |ok| {
                let _ = tx.send(ok);
            })),
        );

        assert!(!sent);
        assert_eq!(rx.recv().unwrap(), false, "callback fires with failure");
        pool.shutdown();
    }
}
