use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as channel;
use log::{debug, error, trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::conn::Conn;
use crate::context::Context;

const WAKER_TOKEN: Token = Token(0);
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Callback run inline by the reader loop when a listener socket becomes
/// readable. It must not block; the accepted socket is expected to be
/// handed off to a connection immediately.
pub type AcceptFn = Box<dyn FnMut(TcpStream, SocketAddr) + Send>;

pub(crate) enum ReaderCmd {
    Register(Arc<Conn>),
    Deregister(u64),
    RegisterListener {
        id: u64,
        listener: TcpListener,
        on_accept: AcceptFn,
    },
    Rebuild(channel::Sender<()>),
    Shutdown,
}

enum Entry {
    Conn { conn: Arc<Conn>, fd: RawFd },
    Listener {
        listener: TcpListener,
        on_accept: AcceptFn,
        fd: RawFd,
    },
}

/// Handle to the single event-loop thread owning the poll set.
///
/// All socket readiness flows through here: readable connections are
/// dispatched to the worker pool one read task at a time, master
/// listeners run their accept handler inline, and registration requests
/// from other threads arrive over a command queue serviced between wait
/// cycles. The loop itself never calls user handlers.
pub struct ReaderLoop {
    tx: channel::Sender<ReaderCmd>,
    waker: Arc<Mutex<Waker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// The pieces of a prepared loop that the thread takes ownership of.
pub(crate) struct LoopParts {
    poll: Poll,
    waker: Arc<Mutex<Waker>>,
    rx: channel::Receiver<ReaderCmd>,
}

impl ReaderLoop {
    /// Allocates the poll set and command queue. The loop thread itself
    /// is started by [`ReaderLoop::activate`] once the owning context
    /// exists, so the thread can hold it weakly from the first cycle.
    pub(crate) fn prepare() -> io::Result<(ReaderLoop, LoopParts)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Mutex::new(Waker::new(poll.registry(), WAKER_TOKEN)?));
        let (tx, rx) = channel::unbounded();

        let reader = ReaderLoop {
            tx,
            waker: Arc::clone(&waker),
            thread: Mutex::new(None),
        };

        Ok((reader, LoopParts { poll, waker, rx }))
    }

    /// Starts the loop thread. The context is held weakly; the loop
    /// exits once its context is gone or `shutdown` is called.
    pub(crate) fn activate(&self, parts: LoopParts, ctx: Weak<Context>) -> io::Result<()> {
        let LoopParts { poll, waker, rx } = parts;

        let thread = thread::Builder::new()
            .name("mqttd-reader".to_owned())
            .spawn(move || run(ctx, poll, waker, rx))?;

        *self.thread.lock() = Some(thread);
        Ok(())
    }

    pub(crate) fn register(&self, conn: Arc<Conn>) {
        self.command(ReaderCmd::Register(conn));
    }

    pub(crate) fn deregister(&self, conn_id: u64) {
        self.command(ReaderCmd::Deregister(conn_id));
    }

    pub(crate) fn register_listener(&self, id: u64, listener: TcpListener, on_accept: AcceptFn) {
        self.command(ReaderCmd::RegisterListener {
            id,
            listener,
            on_accept,
        });
    }

    /// Tears the poll set down and rebuilds it, re-registering every
    /// tracked descriptor; blocks until the loop acknowledges.
    pub fn rebuild(&self, window: Duration) -> bool {
        let (tx, rx) = channel::bounded(1);
        self.command(ReaderCmd::Rebuild(tx));
        rx.recv_timeout(window).is_ok()
    }

    pub(crate) fn shutdown(&self) {
        self.command(ReaderCmd::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    /// Stop request that does not wait for the thread, for teardown paths
    /// that may run on the loop thread itself.
    pub(crate) fn shutdown_nowait(&self) {
        self.command(ReaderCmd::Shutdown);
        self.thread.lock().take();
    }

    fn command(&self, cmd: ReaderCmd) {
        if self.tx.send(cmd).is_ok() {
            if let Err(err) = self.waker.lock().wake() {
                warn!("reader wake failed: {}", err);
            }
        }
    }
}

fn token_of(id: u64) -> Token {
    // Token(0) belongs to the waker; connection ids start at 1
    Token(id as usize)
}

fn run(
    ctx: Weak<Context>,
    mut poll: Poll,
    waker: Arc<Mutex<Waker>>,
    rx: channel::Receiver<ReaderCmd>,
) {
    let mut entries: HashMap<Token, Entry> = HashMap::new();
    let mut events = Events::with_capacity(256);

    debug!("reader loop up");

    loop {
        if let Err(err) = poll.poll(&mut events, Some(IDLE_TICK)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("reader poll failed: {}", err);
            break;
        }

        // service registration and control requests between wait cycles
        let mut shutdown = false;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                ReaderCmd::Register(conn) => {
                    let token = token_of(conn.id());
                    if let Some(fd) = conn.raw_fd() {
                        match poll
                            .registry()
                            .register(&mut SourceFd(&fd), token, Interest::READABLE)
                        {
                            Ok(()) => {
                                trace!("registered conn-id={}", conn.id());
                                entries.insert(token, Entry::Conn { conn, fd });
                            }
                            Err(err) => warn!("register conn-id={} failed: {}", conn.id(), err),
                        }
                    }
                }
                ReaderCmd::Deregister(id) => {
                    if let Some(entry) = entries.remove(&token_of(id)) {
                        let fd = match &entry {
                            Entry::Conn { fd, .. } | Entry::Listener { fd, .. } => *fd,
                        };
                        if let Err(err) = poll.registry().deregister(&mut SourceFd(&fd)) {
                            trace!("deregister conn-id={} failed: {}", id, err);
                        }
                    }
                }
                ReaderCmd::RegisterListener {
                    id,
                    listener,
                    on_accept,
                } => {
                    use std::os::unix::io::AsRawFd;

                    let fd = listener.as_raw_fd();
                    let token = token_of(id);
                    match poll
                        .registry()
                        .register(&mut SourceFd(&fd), token, Interest::READABLE)
                    {
                        Ok(()) => {
                            entries.insert(
                                token,
                                Entry::Listener {
                                    listener,
                                    on_accept,
                                    fd,
                                },
                            );
                        }
                        Err(err) => warn!("register listener failed: {}", err),
                    }
                }
                ReaderCmd::Rebuild(ack) => match rebuild_poll_set(&entries, &waker) {
                    Ok(fresh) => {
                        poll = fresh;
                        let _ = ack.send(());
                    }
                    Err(err) => error!("poll set rebuild failed: {}", err),
                },
                ReaderCmd::Shutdown => shutdown = true,
            }
        }

        if shutdown {
            break;
        }

        let ctx = match ctx.upgrade() {
            Some(ctx) => ctx,
            None => break,
        };

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }

            match entries.get_mut(&event.token()) {
                Some(Entry::Listener {
                    listener, on_accept, ..
                }) => accept_ready(listener, on_accept),
                Some(Entry::Conn { conn, .. }) => {
                    // one read task per connection at a time; a second
                    // readiness edge while the task runs is remembered
                    // and absorbed before the task finishes
                    Conn::schedule_read(&ctx, conn);
                }
                None => trace!("event for unknown token {:?}", event.token()),
            }
        }

        // per-cycle idle pass
        ctx.pool().balance();
        for entry in entries.values() {
            if let Entry::Conn { conn, .. } = entry {
                conn.check_idle(&ctx);
            }
        }
    }

    debug!("reader loop down");
}

fn accept_ready(listener: &TcpListener, on_accept: &mut AcceptFn) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                trace!("accepted connection from {}", addr);
                on_accept(stream, addr);
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("accept failed: {}", err);
                break;
            }
        }
    }
}

/// Recreates the poll set, re-registering every descriptor, and swaps in
/// a waker bound to the new registry.
fn rebuild_poll_set(entries: &HashMap<Token, Entry>, waker: &Arc<Mutex<Waker>>) -> io::Result<Poll> {
    let poll = Poll::new()?;

    for (token, entry) in entries {
        let fd = match entry {
            Entry::Conn { fd, .. } | Entry::Listener { fd, .. } => *fd,
        };
        poll.registry()
            .register(&mut SourceFd(&fd), *token, Interest::READABLE)?;
    }

    *waker.lock() = Waker::new(poll.registry(), WAKER_TOKEN)?;

    Ok(poll)
}
