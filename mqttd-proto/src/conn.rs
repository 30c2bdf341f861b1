use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use crossbeam_channel as channel;
use hexplay::HexViewBuilder;
use log::{debug, log_enabled, trace, warn, Level};
use parking_lot::{Mutex, RwLock};

use mqttd_core::{
    read_packet, Connect, ConnectAck, ConnectReturnCode, LastWill, Packet, PacketId, Protocol,
    PublishRelease, QoS, SubscribeReturnCode, Type,
};

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::handler;
use crate::inflight::{Ack, PacketIdPool, PeerReplies, Track, WaitEntry, WaitReplies};
use crate::message::Message;
use crate::sequencer::{Frame, OnSent, Sequencer};
use crate::storage::{MsgHandle, StorageFlags};
use crate::topic::{valid_topic_name, Filter};
use crate::transport::{TcpTransport, Transport};

/// How this peer entered the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We opened the socket and sent CONNECT.
    Initiator,
    /// The peer connected to one of our listeners.
    Listener,
    /// A listening socket itself, living in the reader loop's poll set.
    MasterListener,
}

/// A message the server publishes on the client's behalf on unclean close.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    pub(crate) fn to_last_will(&self) -> LastWill {
        LastWill {
            qos: self.qos,
            retain: self.retain,
            topic_name: &self.topic,
            message: &self.message,
        }
    }
}

/// Options for an initiated (client-side) connection.
#[derive(Debug, Clone)]
pub struct ConnOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    pub protocol: Protocol,
    pub connect_timeout: Duration,
    /// Re-drive the connect procedure whenever the connection drops.
    /// Enabling this keeps the password in memory.
    pub reconnect: bool,
}

impl ConnOptions {
    pub fn new<S: Into<String>>(client_id: S) -> Self {
        ConnOptions {
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
            protocol: Protocol::V311,
            connect_timeout: Duration::from_secs(10),
            reconnect: false,
        }
    }
}

#[derive(Clone)]
struct ConnectTarget {
    host: String,
    port: u16,
    opts: ConnOptions,
}

/// Per-connection view of its own subscriptions, split the way the
/// context index is: exact filters keyed by topic string, wildcard
/// filters by parsed filter.
#[derive(Default)]
pub(crate) struct SubscriptionSet {
    pub exact: HashMap<String, QoS>,
    pub wildcard: HashMap<Filter, QoS>,
}

impl SubscriptionSet {
    pub fn insert(&mut self, filter: &Filter, qos: QoS) {
        if filter.is_wildcard() {
            self.wildcard.insert(filter.clone(), qos);
        } else {
            self.exact.insert(filter.to_string(), qos);
        }
    }

    pub fn remove(&mut self, filter: &Filter) {
        if filter.is_wildcard() {
            self.wildcard.remove(filter);
        } else {
            self.exact.remove(&filter.to_string());
        }
    }

    pub fn snapshot(&self) -> Vec<(Filter, QoS)> {
        let exact = self
            .exact
            .iter()
            .filter_map(|(name, qos)| name.parse().ok().map(|filter| (filter, *qos)));
        exact
            .chain(self.wildcard.iter().map(|(filter, qos)| (filter.clone(), *qos)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.exact.clear();
        self.wildcard.clear();
    }
}

struct ConnState {
    client_id: String,
    clean_session: bool,
    keep_alive: u16,
    connected: bool,
    connect_received: bool,
    initial_accept: bool,
    is_blocked: bool,
    close_called: bool,
    last_connack: Option<ConnectReturnCode>,
    // the password is never kept here: the handshake request carries it
    // to the auth decision, and reconnect holds its own copy only when
    // the caller opted in
    username: Option<String>,
    will: Option<Will>,
    peer: Option<SocketAddr>,
    server_name: Option<String>,
}

type OnMessage = Arc<dyn Fn(&Arc<Context>, &Arc<Conn>, &Arc<Message>) + Send + Sync>;
type OnClose = Box<dyn FnOnce(&Arc<Conn>) + Send>;
type OnReconnect = Arc<dyn Fn(&Arc<Conn>) + Send + Sync>;
type OnMessageSent = Arc<dyn Fn(&Arc<Conn>, &str) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_message: Option<OnMessage>,
    on_close: Vec<OnClose>,
    on_reconnect: Option<OnReconnect>,
    on_message_sent: Option<OnMessageSent>,
}

const READ_IDLE: u8 = 0;
const READ_BUSY: u8 = 1;
const READ_PENDING: u8 = 2;

/// Window the sequencer gets to push one frame into a congested socket.
const WRITE_WINDOW: Duration = Duration::from_secs(10);
/// Window `close` gives outbound frames and pending replies to settle.
const CLOSE_WINDOW: Duration = Duration::from_secs(3);
/// Grace multiplier over the negotiated keep-alive before an idle
/// connection is deemed dead.
const KEEP_ALIVE_GRACE: u32 = 3; // halves: 1.5 x keep_alive
/// How long an accepted socket may sit without sending CONNECT.
const INITIAL_ACCEPT_WINDOW: Duration = Duration::from_secs(30);

const RECONNECT_ATTEMPTS: u32 = 5;

/// Messages buffered while no on-message handler is installed, so a
/// consumer alternating between handlers and [`Conn::get_next`] never
/// loses what arrived in between.
const PENDING_LIMIT: usize = 1024;

/// A long-lived peer session bound to one transport session.
///
/// Everything mutable is split across dedicated locks: `op` guards the
/// packet id pool, `state` the session attributes, the sequencer its own
/// queue. Cross-thread handoff goes through `Arc`; the owning side is
/// the context's connection registry, removed on close.
pub struct Conn {
    id: u64,
    role: Role,
    ctx: RwLock<Weak<Context>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    state: Mutex<ConnState>,
    read_stage: AtomicU8,
    read_buf: Mutex<BytesMut>,
    op: Mutex<PacketIdPool>,
    pub(crate) waits: WaitReplies,
    pub(crate) peer_waits: PeerReplies,
    pong_waiters: Mutex<Vec<channel::Sender<()>>>,
    sequencer: Sequencer,
    pub(crate) subs: Mutex<SubscriptionSet>,
    handlers: Mutex<Handlers>,
    pending: Mutex<VecDeque<Arc<Message>>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    target: Mutex<Option<ConnectTarget>>,
}

impl Conn {
    fn new(ctx: &Arc<Context>, role: Role, transport: Arc<dyn Transport>) -> Conn {
        let peer = transport.peer_addr();
        let server_name = transport.server_name();

        Conn {
            id: ctx.next_conn_id(),
            role,
            ctx: RwLock::new(Arc::downgrade(ctx)),
            transport: RwLock::new(Some(transport)),
            state: Mutex::new(ConnState {
                client_id: String::new(),
                clean_session: true,
                keep_alive: 0,
                connected: false,
                connect_received: false,
                initial_accept: role == Role::Listener,
                is_blocked: false,
                close_called: false,
                last_connack: None,
                username: None,
                will: None,
                peer,
                server_name,
            }),
            read_stage: AtomicU8::new(READ_IDLE),
            read_buf: Mutex::new(BytesMut::with_capacity(8 * 1024)),
            op: Mutex::new(PacketIdPool::default()),
            waits: WaitReplies::default(),
            peer_waits: PeerReplies::default(),
            pong_waiters: Mutex::new(Vec::new()),
            sequencer: Sequencer::new(WRITE_WINDOW),
            subs: Mutex::new(SubscriptionSet::default()),
            handlers: Mutex::new(Handlers::default()),
            pending: Mutex::new(VecDeque::new()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            target: Mutex::new(None),
        }
    }

    /// Wraps a socket handed over by a listener's accept handler.
    pub fn from_accepted(ctx: &Arc<Context>, stream: TcpStream) -> Result<Arc<Conn>> {
        let _ = stream.set_nodelay(true);
        stream.set_nonblocking(true)?;

        let conn = Arc::new(Conn::new(ctx, Role::Listener, Arc::new(TcpTransport::new(stream))));
        ctx.register_conn(&conn);

        debug!("accepted conn-id={} from {:?}", conn.id, conn.peer_addr());

        Ok(conn)
    }

    /// Opens a connection to a broker: resolve, connect with timeout,
    /// exchange CONNECT/CONNACK on the still-blocking socket, then hand
    /// the socket to the reader loop.
    pub fn initiate(ctx: &Arc<Context>, host: &str, port: u16, opts: ConnOptions) -> Result<Arc<Conn>> {
        let (transport, session_present) = greet(host, port, &opts)?;

        let conn = Arc::new(Conn::new(ctx, Role::Initiator, transport));
        {
            let mut state = conn.state.lock();
            state.client_id = opts.client_id.clone();
            state.clean_session = opts.clean_session;
            state.keep_alive = opts.keep_alive;
            state.connected = true;
            state.connect_received = true;
            state.last_connack = Some(ConnectReturnCode::ConnectionAccepted);
            state.username = opts.username.clone();
            state.will = opts.will.clone();
        }

        if !opts.clean_session {
            if let Some(storage) = ctx.storage() {
                storage.init(&opts.client_id, StorageFlags::ALL)?;
                let mut subs = conn.subs.lock();
                for (filter, qos) in storage.session_recover(&opts.client_id)? {
                    if let Ok(filter) = filter.parse::<Filter>() {
                        subs.insert(&filter, qos);
                    }
                }
            }
        }

        if opts.reconnect {
            *conn.target.lock() = Some(ConnectTarget {
                host: host.to_owned(),
                port,
                opts,
            });
        }

        ctx.register_conn(&conn);

        debug!(
            "conn-id={} connected to {}:{} (session_present: {})",
            conn.id, host, port, session_present
        );

        Ok(conn)
    }

    /// Non-blocking variant: the connect procedure runs on a worker and
    /// the handler receives the completed or failed connection.
    pub fn initiate_async<F>(ctx: &Arc<Context>, host: &str, port: u16, opts: ConnOptions, on_connected: F)
    where
        F: FnOnce(Result<Arc<Conn>>) + Send + 'static,
    {
        let ctx = Arc::clone(ctx);
        let host = host.to_owned();
        let pool = Arc::clone(ctx.pool());
        pool.execute(move || on_connected(Conn::initiate(&ctx, &host, port, opts)));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn client_id(&self) -> String {
        self.state.lock().client_id.clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.lock().peer
    }

    /// The server name the transport saw during session setup, if any.
    pub fn server_name(&self) -> Option<String> {
        self.state.lock().server_name.clone()
    }

    pub fn keep_alive(&self) -> u16 {
        self.state.lock().keep_alive
    }

    pub fn clean_session(&self) -> bool {
        self.state.lock().clean_session
    }

    pub fn last_connack(&self) -> Option<ConnectReturnCode> {
        self.state.lock().last_connack
    }

    pub fn username(&self) -> Option<String> {
        self.state.lock().username.clone()
    }

    /// Whether the peer was accepted but has not finished CONNECT yet.
    pub fn in_initial_accept(&self) -> bool {
        self.state.lock().initial_accept
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Liveness probe: the transport is up and the session operational.
    pub fn is_ok(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.state.lock().connected
    }

    /// Flow control: a blocked connection stays registered but its
    /// readable events are not dispatched.
    pub fn set_blocked(&self, blocked: bool) {
        self.state.lock().is_blocked = blocked;
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().is_blocked
    }

    pub(crate) fn context(&self) -> Option<Arc<Context>> {
        self.ctx.read().upgrade()
    }

    /// Re-parents the connection onto another context's indexes.
    pub(crate) fn set_context(&self, ctx: &Arc<Context>) {
        *self.ctx.write() = Arc::downgrade(ctx);
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.transport.read().as_ref().map(|transport| transport.raw_fd())
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport.read().clone().ok_or(Error::Closed)
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    // ---- user handlers -------------------------------------------------

    pub fn set_on_message<F>(&self, handler: F)
    where
        F: Fn(&Arc<Context>, &Arc<Conn>, &Arc<Message>) + Send + Sync + 'static,
    {
        self.handlers.lock().on_message = Some(Arc::new(handler));
    }

    /// Close handlers form an ordered list; each fires exactly once, on
    /// its own worker task holding a reference.
    pub fn add_on_close<F>(&self, handler: F)
    where
        F: FnOnce(&Arc<Conn>) + Send + 'static,
    {
        self.handlers.lock().on_close.push(Box::new(handler));
    }

    pub fn set_on_reconnect<F>(&self, handler: F)
    where
        F: Fn(&Arc<Conn>) + Send + Sync + 'static,
    {
        self.handlers.lock().on_reconnect = Some(Arc::new(handler));
    }

    pub fn set_on_message_sent<F>(&self, handler: F)
    where
        F: Fn(&Arc<Conn>, &str) + Send + Sync + 'static,
    {
        self.handlers.lock().on_message_sent = Some(Arc::new(handler));
    }

    // ---- session state used by the protocol handlers -------------------

    /// Marks the CONNECT as seen; returns whether one was seen before.
    pub(crate) fn mark_connect_received(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.connect_received, true)
    }

    pub(crate) fn begin_session(&self, req: &handler::ConnectRequest) {
        let mut state = self.state.lock();
        state.client_id = req.client_id.clone();
        state.clean_session = req.clean_session;
        state.keep_alive = req.keep_alive;
        state.username = req.username.clone();
        state.will = req.will.clone();
        state.initial_accept = false;
    }

    pub(crate) fn set_connected(&self, code: ConnectReturnCode) {
        let mut state = self.state.lock();
        state.connected = code == ConnectReturnCode::ConnectionAccepted;
        state.last_connack = Some(code);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub(crate) fn note_connack(&self, ack: &ConnectAck) {
        self.state.lock().last_connack = Some(ack.return_code);
    }

    pub(crate) fn suppress_will(&self) {
        self.state.lock().will = None;
    }

    /// (client_id, persistent-session) snapshot for storage decisions.
    pub(crate) fn session(&self) -> (String, bool) {
        let state = self.state.lock();
        (state.client_id.clone(), !state.clean_session)
    }

    pub(crate) fn note_pong(&self) {
        if let Some(tx) = self.pong_waiters.lock().pop() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn on_message_arrived(self: &Arc<Self>, ctx: &Arc<Context>, msg: &Arc<Message>) {
        // the handlers lock also covers the pending queue handoff so a
        // concurrent get_next() cannot reorder deliveries
        let handler = {
            let handlers = self.handlers.lock();
            match handlers.on_message.clone() {
                Some(handler) => Some(handler),
                None => {
                    let mut pending = self.pending.lock();
                    if pending.len() < PENDING_LIMIT {
                        pending.push_back(Arc::clone(msg));
                    } else {
                        warn!(
                            "conn-id={} pending queue full, dropped message on `{}`",
                            self.id, msg.topic
                        );
                    }
                    None
                }
            }
        };

        if let Some(handler) = handler {
            handler(ctx, self, msg);
        }
    }

    // ---- outbound ------------------------------------------------------

    pub(crate) fn send_packet(self: &Arc<Self>, ctx: &Arc<Context>, packet: &Packet) -> bool {
        self.send_packet_with(ctx, packet, None)
    }

    pub(crate) fn send_packet_with(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        packet: &Packet,
        on_sent: Option<OnSent>,
    ) -> bool {
        if !packet.fits_wire_limit() {
            warn!("conn-id={} refused to send oversized packet", self.id);
            if let Some(on_sent) = on_sent {
                on_sent(false);
            }
            return false;
        }

        let bytes = packet.to_vec();
        if log_enabled!(Level::Trace) {
            trace!(
                "conn-id={} sending {:?} packet, {} bytes:\n{}",
                self.id,
                packet.packet_type(),
                bytes.len(),
                HexViewBuilder::new(&bytes).finish()
            );
        }

        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(_) => {
                if let Some(on_sent) = on_sent {
                    on_sent(false);
                }
                return false;
            }
        };

        self.bytes_out.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let weak = Arc::downgrade(self);
        let on_dead = move || {
            if let Some(conn) = weak.upgrade() {
                conn.shutdown();
            }
        };

        let frame = match on_sent {
            Some(on_sent) => Frame::with_callback(bytes, on_sent),
            None => Frame::new(bytes),
        };

        self.sequencer.send(ctx.pool(), transport, on_dead, frame)
    }

    // ---- packet id allocation ------------------------------------------

    pub(crate) fn allocate_packet_id(&self, ctx: &Arc<Context>) -> Result<PacketId> {
        let (client_id, persistent) = self.session();
        let storage = if persistent { ctx.storage() } else { None };
        let pending = self.waits.pending_ids();

        let mut op = self.op.lock();
        op.allocate(&pending, |id| {
            storage
                .as_ref()
                .map_or(true, |storage| storage.lock_pkgid(&client_id, id))
        })
        .ok_or_else(|| Error::Resource("packet id space exhausted".to_owned()))
    }

    pub(crate) fn release_packet_id(&self, ctx: &Arc<Context>, id: PacketId) {
        let (client_id, persistent) = self.session();

        self.op.lock().release(id);
        if persistent {
            if let Some(storage) = ctx.storage() {
                storage.release_pkgid(&client_id, id);
            }
        }
    }

    // ---- public operations ---------------------------------------------

    /// Publishes a message, blocking for the acknowledgment flow its QoS
    /// calls for.
    pub fn publish(
        self: &Arc<Self>,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        wait: Duration,
    ) -> Result<()> {
        self.publish_opts(topic, payload, qos, retain, wait, false)
    }

    /// Like [`Conn::publish`] with the storage step made explicit.
    ///
    /// `skip_storage` is set on broker-side re-deliveries whose message
    /// is already persisted on the sender side.
    pub fn publish_opts(
        self: &Arc<Self>,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        wait: Duration,
        skip_storage: bool,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !valid_topic_name(topic) {
            return Err(Error::Protocol(format!("invalid topic name `{}`", topic)));
        }

        let ctx = self.context().ok_or(Error::Closed)?;

        if qos == QoS::AtMostOnce {
            let packet = Packet::Publish(mqttd_core::Publish {
                dup: false,
                qos,
                retain,
                topic_name: topic,
                packet_id: None,
                payload,
            });
            if !self.send_packet(&ctx, &packet) {
                return Err(Error::Closed);
            }
            self.notify_message_sent(topic);
            return Ok(());
        }

        let id = self.allocate_packet_id(&ctx)?;
        let packet = Packet::Publish(mqttd_core::Publish {
            dup: false,
            qos,
            retain,
            topic_name: topic,
            packet_id: Some(id),
            payload,
        });
        let bytes = packet.to_vec();

        let (client_id, persistent) = self.session();
        let stored = if persistent && !skip_storage {
            match ctx.storage() {
                Some(storage) => match storage.store_msg(&client_id, id, qos, &bytes) {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        self.release_packet_id(&ctx, id);
                        return Err(err);
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let rx = self.waits.begin(id);

        if !self.send_packet(&ctx, &packet) {
            self.waits.cancel(id);
            if let (Some(handle), Some(storage)) = (stored.as_ref(), ctx.storage()) {
                let _ = storage.release_msg(&client_id, handle);
            }
            self.release_packet_id(&ctx, id);
            return Err(Error::Closed);
        }

        match qos {
            QoS::AtLeastOnce => {
                self.wait_ack(&rx, id, Type::PUBACK, wait, "PUBACK")?;
                if let (Some(handle), Some(storage)) = (stored.as_ref(), ctx.storage()) {
                    let _ = storage.release_msg(&client_id, handle);
                }
                self.release_packet_id(&ctx, id);
            }
            QoS::ExactlyOnce => {
                self.wait_ack(&rx, id, Type::PUBREC, wait, "PUBREC")?;
                // the receiver has it; the local copy is no longer needed
                if let (Some(handle), Some(storage)) = (stored.as_ref(), ctx.storage()) {
                    let _ = storage.release_msg(&client_id, handle);
                }

                let rx = self.waits.begin(id);
                if !self.send_packet(&ctx, &Packet::PublishRelease(PublishRelease { packet_id: id })) {
                    self.waits.cancel(id);
                    return Err(Error::Closed);
                }
                self.wait_ack(&rx, id, Type::PUBCOMP, wait, "PUBCOMP")?;
                self.release_packet_id(&ctx, id);
            }
            QoS::AtMostOnce => unreachable!("handled above"),
        }

        self.notify_message_sent(topic);
        Ok(())
    }

    fn wait_ack(
        &self,
        rx: &channel::Receiver<Ack>,
        id: PacketId,
        expect: Type,
        wait: Duration,
        what: &'static str,
    ) -> Result<Ack> {
        match rx.recv_timeout(wait) {
            Ok(ack) if ack.packet_type == expect => Ok(ack),
            Ok(ack) => {
                self.waits.cancel(id);
                Err(Error::Protocol(format!(
                    "expected {:?} for packet id {}, got {:?}",
                    expect, id, ack.packet_type
                )))
            }
            Err(_) => {
                // a stray late reply with this id will be logged and dropped
                self.waits.cancel(id);
                Err(Error::Timeout(what))
            }
        }
    }

    /// Subscribes to one topic filter and reports the granted QoS
    /// (or the 0x80 refusal).
    pub fn subscribe(
        self: &Arc<Self>,
        topic_filter: &str,
        qos: QoS,
        wait: Duration,
    ) -> Result<SubscribeReturnCode> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let filter: Filter = topic_filter.parse()?;
        let ctx = self.context().ok_or(Error::Closed)?;

        let id = self.allocate_packet_id(&ctx)?;
        let rx = self.waits.begin(id);

        let packet = Packet::Subscribe(mqttd_core::Subscribe {
            packet_id: id,
            subscriptions: vec![(topic_filter, qos)],
        });
        if !self.send_packet(&ctx, &packet) {
            self.waits.cancel(id);
            self.release_packet_id(&ctx, id);
            return Err(Error::Closed);
        }

        let ack = self.wait_ack(&rx, id, Type::SUBACK, wait, "SUBACK")?;
        self.release_packet_id(&ctx, id);

        let granted = ack
            .granted
            .first()
            .copied()
            .ok_or_else(|| Error::Protocol("SUBACK without status".to_owned()))?;

        if let SubscribeReturnCode::Success(granted_qos) = granted {
            let (client_id, persistent) = self.session();
            if persistent {
                if let Some(storage) = ctx.storage() {
                    storage.sub(&client_id, topic_filter, granted_qos)?;
                }
            }
            self.subs.lock().insert(&filter, granted_qos);
        }

        Ok(granted)
    }

    /// Removes a subscription; waits for UNSUBACK when `wait` is non-zero.
    pub fn unsubscribe(self: &Arc<Self>, topic_filter: &str, wait: Duration) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let filter: Filter = topic_filter.parse()?;
        let ctx = self.context().ok_or(Error::Closed)?;

        let id = self.allocate_packet_id(&ctx)?;
        let rx = if wait > Duration::from_secs(0) {
            Some(self.waits.begin(id))
        } else {
            None
        };

        let packet = Packet::Unsubscribe(mqttd_core::Unsubscribe {
            packet_id: id,
            topic_filters: vec![topic_filter],
        });
        if !self.send_packet(&ctx, &packet) {
            self.waits.cancel(id);
            self.release_packet_id(&ctx, id);
            return Err(Error::Closed);
        }

        if let Some(rx) = rx {
            self.wait_ack(&rx, id, Type::UNSUBACK, wait, "UNSUBACK")?;
        }
        self.release_packet_id(&ctx, id);

        let (client_id, persistent) = self.session();
        if persistent {
            if let Some(storage) = ctx.storage() {
                storage.unsub(&client_id, topic_filter)?;
            }
        }
        self.subs.lock().remove(&filter);

        Ok(())
    }

    /// PINGREQ/PINGRESP probe over a dedicated reply queue.
    pub fn ping(self: &Arc<Self>, wait: Duration) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let ctx = self.context().ok_or(Error::Closed)?;

        let (tx, rx) = channel::bounded(1);
        self.pong_waiters.lock().push(tx);

        if !self.send_packet(&ctx, &Packet::Ping) {
            return Err(Error::Closed);
        }

        rx.recv_timeout(wait).map_err(|_| Error::Timeout("PINGRESP"))
    }

    /// Blocking next-message helper.
    ///
    /// Temporarily replaces the on-message handler with a queue pusher,
    /// restoring it on return; unblocks early when the connection dies.
    pub fn get_next(self: &Arc<Self>, timeout: Duration) -> Result<Option<Arc<Message>>> {
        let (tx, rx) = channel::unbounded::<Arc<Message>>();

        let saved = {
            let mut handlers = self.handlers.lock();

            // anything buffered before this call is consumed first
            if let Some(msg) = self.pending.lock().pop_front() {
                return Ok(Some(msg));
            }

            let saved = handlers.on_message.take();
            handlers.on_message = Some(Arc::new(move |_ctx, _conn, msg: &Arc<Message>| {
                let _ = tx.send(Arc::clone(msg));
            }));
            saved
        };

        let deadline = Instant::now() + timeout;
        let step = Duration::from_millis(50);
        let result = loop {
            match rx.recv_timeout(step.min(deadline.saturating_duration_since(Instant::now()))) {
                Ok(msg) => break Ok(Some(msg)),
                Err(channel::RecvTimeoutError::Timeout) => {
                    if self.closed.load(Ordering::SeqCst) {
                        break Err(Error::Closed);
                    }
                    if Instant::now() >= deadline {
                        break Ok(None);
                    }
                }
                Err(channel::RecvTimeoutError::Disconnected) => break Err(Error::Closed),
            }
        };

        {
            // restore the handler and park whatever the pusher still
            // holds, preserving arrival order
            let mut handlers = self.handlers.lock();
            handlers.on_message = saved;
            let mut pending = self.pending.lock();
            for msg in rx.try_iter() {
                pending.push_back(msg);
            }
        }

        result
    }

    fn notify_message_sent(self: &Arc<Self>, topic: &str) {
        let handler = self.handlers.lock().on_message_sent.clone();
        if let Some(handler) = handler {
            handler(self, topic);
        }
    }

    // ---- broker-side delivery ------------------------------------------

    /// Delivers a routed message to this subscriber at
    /// `min(msg.qos, granted)`, tracking the exchange asynchronously.
    pub(crate) fn deliver(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        msg: &Message,
        granted: QoS,
        as_retained: bool,
    ) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let qos = msg.qos.min(granted);
        if qos == QoS::AtMostOnce {
            let packet = Packet::Publish(msg.to_publish(qos, as_retained, None, false));
            self.send_packet(ctx, &packet);
            return;
        }

        let id = match self.allocate_packet_id(ctx) {
            Ok(id) => id,
            Err(err) => {
                warn!("conn-id={} dropped delivery on `{}`: {}", self.id, msg.topic, err);
                return;
            }
        };

        let packet = Packet::Publish(msg.to_publish(qos, as_retained, Some(id), false));
        let bytes = packet.to_vec();

        // the sender side already persisted a QoS 1 message; re-persisting
        // each delivery would double-store it
        let skip_storage = msg.qos == QoS::AtLeastOnce;
        let (client_id, persistent) = self.session();
        let stored = if persistent && !skip_storage {
            ctx.storage().and_then(|storage| {
                storage
                    .store_msg(&client_id, id, qos, &bytes)
                    .map_err(|err| debug!("delivery not persisted: {}", err))
                    .ok()
                    .map(|handle| (client_id.clone(), handle))
            })
        } else {
            None
        };

        self.waits.begin_track(
            id,
            Track {
                stored,
                qos,
                released: false,
            },
        );

        self.send_packet(ctx, &packet);
    }

    /// Replays one queued message recovered from storage; its handle is
    /// released once the exchange completes.
    pub(crate) fn deliver_queued(self: &Arc<Self>, ctx: &Arc<Context>, msg: &Message, handle: MsgHandle) {
        let (client_id, _) = self.session();

        if msg.qos == QoS::AtMostOnce {
            let packet = Packet::Publish(msg.to_publish(QoS::AtMostOnce, msg.retain, None, false));
            self.send_packet(ctx, &packet);
            if let Some(storage) = ctx.storage() {
                let _ = storage.release_msg(&client_id, &handle);
            }
            return;
        }

        let id = match self.allocate_packet_id(ctx) {
            Ok(id) => id,
            Err(err) => {
                warn!("conn-id={} could not replay queued message: {}", self.id, err);
                return;
            }
        };

        let packet = Packet::Publish(msg.to_publish(msg.qos, msg.retain, Some(id), true));

        self.waits.begin_track(
            id,
            Track {
                stored: Some((client_id, handle)),
                qos: msg.qos,
                released: false,
            },
        );

        self.send_packet(ctx, &packet);
    }

    /// Routes an acknowledgment to whoever tracks its packet id.
    pub(crate) fn handle_ack(self: &Arc<Self>, ctx: &Arc<Context>, ack: Ack) {
        let id = ack.packet_id;
        let packet_type = ack.packet_type;

        match self.waits.take(id) {
            Some(WaitEntry::Rendezvous(tx)) => {
                let _ = tx.send(ack);
            }
            Some(WaitEntry::Track(mut track)) => match (packet_type, track.qos) {
                (Type::PUBACK, QoS::AtLeastOnce) => {
                    self.release_tracked(ctx, &track);
                    self.release_packet_id(ctx, id);
                }
                (Type::PUBREC, QoS::ExactlyOnce) if !track.released => {
                    self.release_tracked(ctx, &track);
                    track.stored = None;
                    track.released = true;
                    self.waits.put_back(id, track);
                    self.send_packet(ctx, &Packet::PublishRelease(PublishRelease { packet_id: id }));
                }
                (Type::PUBCOMP, QoS::ExactlyOnce) => {
                    self.release_packet_id(ctx, id);
                }
                _ => {
                    warn!(
                        "conn-id={} unexpected {:?} for tracked packet id {}",
                        self.id, packet_type, id
                    );
                }
            },
            None => {
                debug!(
                    "conn-id={} stray {:?} for packet id {} dropped",
                    self.id, packet_type, id
                );
            }
        }
    }

    fn release_tracked(&self, ctx: &Arc<Context>, track: &Track) {
        if let (Some((client_id, handle)), Some(storage)) = (track.stored.as_ref(), ctx.storage()) {
            let _ = storage.release_msg(client_id, handle);
        }
    }

    // ---- reading -------------------------------------------------------

    /// Dispatches one read task for a readable connection. At most one
    /// task runs per connection; readiness arriving meanwhile is folded
    /// into the running task.
    pub(crate) fn schedule_read(ctx: &Arc<Context>, conn: &Arc<Conn>) {
        if conn.closed.load(Ordering::SeqCst) || conn.is_blocked() {
            return;
        }

        loop {
            match conn.read_stage.load(Ordering::SeqCst) {
                READ_IDLE => {
                    if conn
                        .read_stage
                        .compare_exchange(READ_IDLE, READ_BUSY, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let conn = Arc::clone(conn);
                        ctx.pool().execute(move || Conn::read_task(conn));
                        return;
                    }
                }
                READ_BUSY => {
                    if conn
                        .read_stage
                        .compare_exchange(READ_BUSY, READ_PENDING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return, // already pending
            }
        }
    }

    fn read_task(conn: Arc<Conn>) {
        loop {
            match conn.read_and_process() {
                Ok(()) => {}
                Err(Error::Closed) => {
                    conn.on_remote_close();
                    conn.read_stage.store(READ_IDLE, Ordering::SeqCst);
                    return;
                }
                Err(err) => {
                    warn!("conn-id={} read failed: {}", conn.id, err);
                    conn.shutdown();
                    conn.read_stage.store(READ_IDLE, Ordering::SeqCst);
                    return;
                }
            }

            // absorb readiness that arrived while this task ran
            if conn
                .read_stage
                .compare_exchange(READ_BUSY, READ_IDLE, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
            conn.read_stage.store(READ_BUSY, Ordering::SeqCst);
        }
    }

    /// Drains the socket and processes every complete packet buffered.
    fn read_and_process(self: &Arc<Self>) -> Result<()> {
        let transport = self.transport()?;
        let mut buf = self.read_buf.lock();
        let mut scratch = [0u8; 4096];

        loop {
            // parse everything already buffered
            loop {
                let step = {
                    let input: &[u8] = &buf;
                    match read_packet(input)? {
                        Some((packet, consumed)) => {
                            let ctx = self.context().ok_or(Error::Closed)?;
                            let result = handler::process_packet(&ctx, self, packet);
                            Some((consumed, result))
                        }
                        None => None,
                    }
                };

                match step {
                    Some((consumed, result)) => {
                        buf.advance(consumed);
                        result?;
                    }
                    None => break,
                }
            }

            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            match transport.recv(&mut scratch) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => {
                    self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                    self.touch();
                    buf.extend_from_slice(&scratch[..n]);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    // ---- lifecycle -----------------------------------------------------

    /// Per-cycle idle probe run by the reader loop: a server-side peer
    /// silent past 1.5 times its keep-alive is deemed dead, and a freshly
    /// accepted socket gets a bounded window to produce its CONNECT.
    pub(crate) fn check_idle(self: &Arc<Self>, ctx: &Arc<Context>) {
        if self.role != Role::Listener || self.closed.load(Ordering::SeqCst) {
            return;
        }

        let (connected, initial_accept, keep_alive) = {
            let state = self.state.lock();
            (state.connected, state.initial_accept, state.keep_alive)
        };

        let deadline = if initial_accept {
            Some(INITIAL_ACCEPT_WINDOW)
        } else if connected && keep_alive > 0 {
            Some(Duration::from_secs(u64::from(keep_alive)) * KEEP_ALIVE_GRACE / 2)
        } else {
            None
        };

        if let Some(deadline) = deadline {
            if self.last_activity.lock().elapsed() > deadline {
                warn!(
                    "conn-id={} idle past its window ({}), dropping",
                    self.id,
                    if initial_accept { "no CONNECT" } else { "keep-alive" }
                );
                let conn = Arc::clone(self);
                ctx.pool().clone().execute(move || conn.shutdown());
            }
        }
    }

    fn on_remote_close(self: &Arc<Self>) {
        let expected = self.state.lock().close_called;
        if expected {
            self.shutdown_with(false);
        } else {
            debug!("conn-id={} closed by peer", self.id);
            self.shutdown_with(true);
        }
    }

    /// Orderly close: drain outbound frames, await pending replies, send
    /// DISCONNECT when we initiated, then tear down.
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.close_called {
                return;
            }
            state.close_called = true;
        }

        self.sequencer.wait_drained(CLOSE_WINDOW);

        let deadline = Instant::now() + CLOSE_WINDOW;
        while self.waits.len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        if self.role == Role::Initiator && self.is_connected() {
            if let Some(ctx) = self.context() {
                self.send_packet(&ctx, &Packet::Disconnect);
                self.sequencer.wait_drained(Duration::from_millis(500));
            }
        }

        self.shutdown_with(false);
    }

    /// Immediate forced close.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutdown_with(true);
    }

    pub(crate) fn shutdown_with(self: &Arc<Self>, unexpected: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let ctx = self.context();
        let (client_id, clean_session, will, was_accepted, close_called) = {
            let mut state = self.state.lock();
            state.connected = false;
            (
                state.client_id.clone(),
                state.clean_session,
                state.will.take(),
                // a refused CONNECT must not touch the session state its
                // client id points at
                state.last_connack == Some(ConnectReturnCode::ConnectionAccepted),
                state.close_called,
            )
        };
        let unexpected = unexpected && !close_called;

        debug!(
            "conn-id={} shutting down (client `{}`, unexpected: {})",
            self.id, client_id, unexpected
        );

        self.sequencer.close();
        if let Some(transport) = self.transport.write().take() {
            transport.shutdown();
        }

        if let Some(ctx) = ctx {
            ctx.reader().deregister(self.id);

            if self.role == Role::Listener && was_accepted && !client_id.is_empty() {
                ctx.release_client_id(&client_id, self.id);

                if clean_session {
                    ctx.subscriptions().remove_conn(self.id);
                    if let Some(storage) = ctx.storage() {
                        if let Err(err) = storage.clear(&client_id, StorageFlags::ALL) {
                            warn!("failed to clear session for `{}`: {}", client_id, err);
                        }
                    }
                } else {
                    let snapshot = self.subs.lock().snapshot();
                    ctx.subscriptions()
                        .migrate_to_offline(self.id, &client_id, snapshot);
                }

                // the will is withheld for orderly DISCONNECTs, which clear
                // it before getting here
                if unexpected && !clean_session {
                    if let Some(will) = will {
                        let msg = Arc::new(Message {
                            qos: will.qos,
                            dup: false,
                            retain: will.retain,
                            topic: will.topic,
                            packet_id: None,
                            payload: will.message.into(),
                        });
                        crate::router::dispatch(&ctx, None, &msg);
                    }
                }
            } else {
                ctx.subscriptions().remove_conn(self.id);
            }

            // each close handler runs on its own worker task holding a ref
            let on_close: Vec<OnClose> = self.handlers.lock().on_close.drain(..).collect();
            for handler in on_close {
                let conn = Arc::clone(self);
                ctx.pool().clone().execute(move || handler(&conn));
            }

            if self.role == Role::Initiator && unexpected {
                let target = self.target.lock().clone();
                if let Some(target) = target {
                    let ctx2 = Arc::clone(&ctx);
                    let conn = Arc::clone(self);
                    ctx.pool()
                        .clone()
                        .execute(move || Conn::run_reconnect(ctx2, conn, target));
                }
            }

            ctx.unregister_conn(self.id);
        }

        self.waits.clear();
        self.peer_waits.clear();
    }

    /// Re-drives the connect procedure after an unexpected close.
    fn run_reconnect(ctx: Arc<Context>, conn: Arc<Conn>, target: ConnectTarget) {
        for attempt in 1..=RECONNECT_ATTEMPTS {
            if ctx.is_exiting() {
                return;
            }

            match greet(&target.host, target.port, &target.opts) {
                Ok((transport, _session_present)) => {
                    debug!("conn-id={} reconnected on attempt {}", conn.id, attempt);

                    *conn.transport.write() = Some(transport);
                    conn.sequencer.reopen();
                    conn.read_buf.lock().clear();
                    conn.waits.clear();
                    conn.peer_waits.clear();
                    conn.op.lock().clear();
                    conn.closed.store(false, Ordering::SeqCst);
                    {
                        let mut state = conn.state.lock();
                        state.connected = true;
                        state.close_called = false;
                        state.last_connack = Some(ConnectReturnCode::ConnectionAccepted);
                        state.will = target.opts.will.clone();
                    }
                    conn.touch();

                    ctx.register_conn(&conn);

                    let handler = conn.handlers.lock().on_reconnect.clone();
                    if let Some(handler) = handler {
                        handler(&conn);
                    }
                    return;
                }
                Err(err) => {
                    debug!(
                        "conn-id={} reconnect attempt {}/{} failed: {}",
                        conn.id, attempt, RECONNECT_ATTEMPTS, err
                    );
                    thread::sleep(Duration::from_millis(200) * attempt);
                }
            }
        }

        warn!("conn-id={} gave up reconnecting", conn.id);
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("client_id", &self.state.lock().client_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Publishes to a client that is not currently connected: the message is
/// queued in its session storage for delivery on the next connect.
///
/// The queue is bounded by the 16-bit packet id space; QoS > 0 messages
/// beyond 65 535 are refused.
pub fn offline_publish(
    ctx: &Arc<Context>,
    client_id: &str,
    topic: &str,
    payload: &[u8],
    qos: QoS,
    retain: bool,
) -> Result<()> {
    if !valid_topic_name(topic) {
        return Err(Error::Protocol(format!("invalid topic name `{}`", topic)));
    }

    let storage = ctx
        .storage()
        .ok_or_else(|| Error::Resource("no storage configured for offline publish".to_owned()))?;

    if qos > QoS::AtMostOnce && storage.queued_messages(client_id) >= usize::from(u16::max_value()) {
        return Err(Error::Resource(format!(
            "offline queue for `{}` exhausted the packet id space",
            client_id
        )));
    }

    let packet = Packet::Publish(mqttd_core::Publish {
        dup: false,
        qos,
        retain,
        topic_name: topic,
        packet_id: if qos > QoS::AtMostOnce { Some(0) } else { None },
        payload,
    });
    if !packet.fits_wire_limit() {
        return Err(Error::Resource("message exceeds the wire size limit".to_owned()));
    }

    storage.init(client_id, StorageFlags::MESSAGES)?;
    storage.store_msg(client_id, 0, qos, &packet.to_vec())?;

    Ok(())
}

/// The blocking CONNECT/CONNACK greetings exchange of an initiator.
fn greet(host: &str, port: u16, opts: &ConnOptions) -> Result<(Arc<dyn Transport>, bool)> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Internal(format!("no address for {}:{}", host, port)))?;

    let stream = TcpStream::connect_timeout(&addr, opts.connect_timeout)
        .map_err(|err| match err.kind() {
            io::ErrorKind::TimedOut => Error::Timeout("connect"),
            _ => Error::Transport(err),
        })?;
    let _ = stream.set_nodelay(true);

    let connect = Packet::Connect(Connect {
        protocol: opts.protocol,
        clean_session: opts.clean_session,
        keep_alive: opts.keep_alive,
        client_id: &opts.client_id,
        last_will: opts.will.as_ref().map(Will::to_last_will),
        username: opts.username.as_deref(),
        password: opts.password.as_deref(),
    });

    (&stream).write_all(&connect.to_vec())?;

    stream.set_read_timeout(Some(opts.connect_timeout))?;

    let mut buf = BytesMut::with_capacity(256);
    let mut scratch = [0u8; 256];
    let ack = loop {
        if let Some((packet, consumed)) = read_packet(&buf)? {
            let ack = match packet {
                Packet::ConnectAck(ack) => ack,
                other => {
                    return Err(Error::Protocol(format!(
                        "expected CONNACK, got {:?}",
                        other.packet_type()
                    )))
                }
            };
            buf.advance(consumed);
            break ack;
        }

        match (&stream).read(&mut scratch) {
            Ok(0) => return Err(Error::Closed),
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(Error::Timeout("CONNACK"))
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    };

    if ack.return_code != ConnectReturnCode::ConnectionAccepted {
        return Err(Error::ConnectRefused(ack.return_code));
    }

    stream.set_read_timeout(None)?;
    stream.set_nonblocking(true)?;

    Ok((Arc::new(TcpTransport::new(stream)), ack.session_present))
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;
    use tempfile::tempdir;

    use crate::storage::{FsStorage, Storage, StorageLimits};

    use super::*;

    #[test]
    fn test_offline_publish_queues_into_storage() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FsStorage::new(dir.path(), StorageLimits::default()).unwrap());
        let ctx = Context::builder("offline")
            .storage(storage.clone())
            .build()
            .unwrap();

        offline_publish(&ctx, "c1", "a/b", b"hello", QoS::AtLeastOnce, false).unwrap();
        offline_publish(&ctx, "c1", "a/b", b"again", QoS::AtMostOnce, false).unwrap();

        assert_eq!(storage.queued_messages("c1"), 2);

        // the stored frames decode straight back into deliverable publishes
        let drained = storage.queued_drain("c1").unwrap();
        match read_packet(&drained[0].1).unwrap() {
            Some((Packet::Publish(publish), _)) => {
                assert_eq!(publish.topic_name, "a/b");
                assert_eq!(publish.payload, b"hello");
                assert_eq!(publish.qos, QoS::AtLeastOnce);
            }
            other => panic!("unexpected stored frame: {:?}", other),
        }

        ctx.shutdown();
    }

    #[test]
    fn test_offline_publish_needs_storage_and_a_topic_name() {
        let ctx = Context::builder("bare").build().unwrap();

        assert_matches!(
            offline_publish(&ctx, "c1", "a/b", b"x", QoS::AtLeastOnce, false),
            Err(Error::Resource(_))
        );
        assert_matches!(
            offline_publish(&ctx, "c1", "a/+", b"x", QoS::AtLeastOnce, false),
            Err(Error::Protocol(_))
        );

        ctx.shutdown();
    }

    #[test]
    fn test_conn_options_defaults() {
        let opts = ConnOptions::new("c1");

        assert_eq!(opts.client_id, "c1");
        assert!(opts.clean_session);
        assert_eq!(opts.keep_alive, 60);
        assert_eq!(opts.protocol, Protocol::V311);
        assert!(!opts.reconnect);
    }
}
