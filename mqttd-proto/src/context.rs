use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use mqttd_core::QoS;

use crate::auth::AuthBackend;
use crate::conn::Conn;
use crate::errors::{Error, Result};
use crate::handler::{ConnAction, ConnectRequest};
use crate::message::Message;
use crate::reader::{AcceptFn, ReaderLoop};
use crate::router::{PublishDecision, SubscriptionIndex};
use crate::settings::Settings;
use crate::storage::Storage;
use crate::topic::{Filter, MatchTopic};
use crate::workers::{PoolConfig, WorkerPool};

/// Per-context policy knobs, normally filled in from a tenant's
/// settings bundle. Zero disables a numeric limit.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Publishes larger than this many bytes are silently dropped.
    pub message_size_limit: usize,
    /// Connections must present credentials the auth backend accepts.
    pub require_auth: bool,
    /// Enforce the 3.1.1 restricted client-id charset and length.
    pub restrict_ids: bool,
    /// A CONNECT for an already-active client id evicts the old
    /// connection instead of being rejected.
    pub drop_conn_same_client_id: bool,
    /// Whether subscriptions may contain `+`/`#`.
    pub wildcard_subscriptions: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            message_size_limit: 0,
            require_auth: false,
            restrict_ids: false,
            drop_conn_same_client_id: false,
            wildcard_subscriptions: true,
        }
    }
}

/// Result of claiming a client id in the context's index.
pub enum BindOutcome {
    /// The id is now bound to the caller's connection.
    Bound,
    /// Another live connection holds the id.
    InUse(Arc<Conn>),
}

type OnConnectHook =
    Box<dyn Fn(&Arc<Context>, &Arc<Conn>, &ConnectRequest) -> ConnAction + Send + Sync>;
type OnPublishHook =
    Box<dyn Fn(&Arc<Context>, Option<&Arc<Conn>>, &Message) -> PublishDecision + Send + Sync>;
type OnSubscribeHook = Box<dyn Fn(&Arc<Context>, &Arc<Conn>, &str, QoS) -> Option<QoS> + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_connect: Option<OnConnectHook>,
    on_publish: Option<OnPublishHook>,
    on_subscribe: Option<OnSubscribeHook>,
}

/// A complete broker/client instance.
///
/// Owns the reader loop, the worker pool, the connection registry, the
/// client-id index, the subscription index and the retained-message map.
/// A process may run any number of contexts side by side; there is no
/// process-wide state, and a multi-tenant broker gives each tenant its
/// own context.
pub struct Context {
    name: String,
    limits: Limits,
    storage: Option<Arc<dyn Storage>>,
    auth: Option<Arc<dyn AuthBackend>>,
    settings: Option<Arc<dyn Settings>>,
    hooks: RwLock<Hooks>,
    pool: Arc<WorkerPool>,
    reader: ReaderLoop,
    conns: Mutex<HashMap<u64, Arc<Conn>>>,
    client_index: Mutex<HashMap<String, u64>>,
    subs: SubscriptionIndex,
    retained: Mutex<HashMap<String, (QoS, Bytes)>>,
    conn_ids: Arc<AtomicU64>,
    exiting: AtomicBool,
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    name: String,
    limits: Limits,
    storage: Option<Arc<dyn Storage>>,
    auth: Option<Arc<dyn AuthBackend>>,
    settings: Option<Arc<dyn Settings>>,
    pool_config: PoolConfig,
    conn_ids: Option<Arc<AtomicU64>>,
}

impl ContextBuilder {
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthBackend>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Shares a connection id allocator with sibling contexts so ids
    /// stay process-unique across tenants.
    pub fn conn_id_allocator(mut self, allocator: Arc<AtomicU64>) -> Self {
        self.conn_ids = Some(allocator);
        self
    }

    pub fn build(self) -> Result<Arc<Context>> {
        let retained = match self.storage.as_ref() {
            Some(storage) => recover_retained(storage.as_ref())?,
            None => HashMap::new(),
        };

        let (reader, parts) = ReaderLoop::prepare().map_err(Error::Transport)?;

        let ctx = Arc::new(Context {
            name: self.name,
            limits: self.limits,
            storage: self.storage,
            auth: self.auth,
            settings: self.settings,
            hooks: RwLock::new(Hooks::default()),
            pool: WorkerPool::new(self.pool_config),
            reader,
            conns: Mutex::new(HashMap::new()),
            client_index: Mutex::new(HashMap::new()),
            subs: SubscriptionIndex::default(),
            retained: Mutex::new(retained),
            conn_ids: self.conn_ids.unwrap_or_else(|| Arc::new(AtomicU64::new(1))),
            exiting: AtomicBool::new(false),
        });

        ctx.reader
            .activate(parts, Arc::downgrade(&ctx))
            .map_err(Error::Transport)?;

        debug!("context `{}` up", ctx.name);

        Ok(ctx)
    }
}

impl Context {
    pub fn builder<S: Into<String>>(name: S) -> ContextBuilder {
        ContextBuilder {
            name: name.into(),
            limits: Limits::default(),
            storage: None,
            auth: None,
            settings: None,
            pool_config: PoolConfig::default(),
            conn_ids: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn storage(&self) -> Option<Arc<dyn Storage>> {
        self.storage.clone()
    }

    pub fn auth(&self) -> Option<Arc<dyn AuthBackend>> {
        self.auth.clone()
    }

    pub fn settings(&self) -> Option<Arc<dyn Settings>> {
        self.settings.clone()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn reader(&self) -> &ReaderLoop {
        &self.reader
    }

    pub fn subscriptions(&self) -> &SubscriptionIndex {
        &self.subs
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.conn_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// The allocator, for handing to sibling contexts.
    pub fn conn_id_allocator(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.conn_ids)
    }

    /// Cooperative cancellation flag for long-running handlers.
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    // ---- connection registry -------------------------------------------

    pub(crate) fn register_conn(&self, conn: &Arc<Conn>) {
        self.conns.lock().insert(conn.id(), Arc::clone(conn));
        self.reader.register(Arc::clone(conn));
    }

    pub(crate) fn unregister_conn(&self, conn_id: u64) {
        self.conns.lock().remove(&conn_id);
    }

    pub(crate) fn conn_by_id(&self, conn_id: u64) -> Option<Arc<Conn>> {
        self.conns.lock().get(&conn_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Detaches a connection from `from` and adopts it here: registry,
    /// reader loop and future index operations all move over. Used by the
    /// tenant layer once CONNECT resolved the target domain.
    pub fn adopt(self: &Arc<Self>, conn: &Arc<Conn>, from: &Arc<Context>) {
        from.reader.deregister(conn.id());
        from.conns.lock().remove(&conn.id());

        conn.set_context(self);
        self.conns.lock().insert(conn.id(), Arc::clone(conn));
        self.reader.register(Arc::clone(conn));
    }

    /// Adds a listening socket to this context's poll set; `on_accept`
    /// runs inline on the reader loop.
    pub fn add_listener(self: &Arc<Self>, listener: TcpListener, on_accept: AcceptFn) -> Result<()> {
        listener.set_nonblocking(true)?;
        let id = self.next_conn_id();
        self.reader.register_listener(id, listener, on_accept);
        Ok(())
    }

    // ---- client id index ------------------------------------------------

    /// Claims a client id for a connection. While a connection is in
    /// state `connected` its id is in exactly one context's index.
    pub(crate) fn bind_client_id(&self, client_id: &str, conn_id: u64) -> BindOutcome {
        let mut index = self.client_index.lock();

        if let Some(&existing) = index.get(client_id) {
            if existing != conn_id {
                if let Some(conn) = self.conn_by_id(existing) {
                    return BindOutcome::InUse(conn);
                }
                // stale entry of a connection that is already gone
            }
        }

        index.insert(client_id.to_owned(), conn_id);
        BindOutcome::Bound
    }

    /// Releases a client id, but only for its owning connection.
    pub(crate) fn release_client_id(&self, client_id: &str, conn_id: u64) {
        let mut index = self.client_index.lock();
        if index.get(client_id) == Some(&conn_id) {
            index.remove(client_id);
        }
    }

    pub fn client_connected(&self, client_id: &str) -> bool {
        self.client_index.lock().contains_key(client_id)
    }

    // ---- retained messages ----------------------------------------------

    /// Applies a retained publish: a non-empty payload replaces the
    /// topic's entry, an empty payload clears it.
    pub(crate) fn retain_update(&self, msg: &Message) {
        if msg.payload.is_empty() {
            self.retained.lock().remove(&msg.topic);
            if let Some(storage) = self.storage.as_ref() {
                if let Err(err) = storage.retain_release(&msg.topic) {
                    warn!("failed to clear retained `{}`: {}", msg.topic, err);
                }
            }
        } else {
            self.retained
                .lock()
                .insert(msg.topic.clone(), (msg.qos, msg.payload.clone()));
            if let Some(storage) = self.storage.as_ref() {
                if let Err(err) = storage.retain_set(&msg.topic, msg.qos, &msg.payload) {
                    warn!("failed to persist retained `{}`: {}", msg.topic, err);
                }
            }
        }
    }

    /// Retained messages whose topic matches the filter.
    pub(crate) fn retained_matching(&self, filter: &Filter) -> Vec<(String, QoS, Bytes)> {
        self.retained
            .lock()
            .iter()
            .filter(|(topic, _)| topic.match_topic(filter))
            .map(|(topic, (qos, payload))| (topic.clone(), *qos, payload.clone()))
            .collect()
    }

    /// The retained message for one topic, if any.
    pub fn retained(&self, topic: &str) -> Option<(QoS, Bytes)> {
        self.retained.lock().get(topic).cloned()
    }

    // ---- hooks -----------------------------------------------------------

    pub fn set_on_connect<F>(&self, hook: F)
    where
        F: Fn(&Arc<Context>, &Arc<Conn>, &ConnectRequest) -> ConnAction + Send + Sync + 'static,
    {
        self.hooks.write().on_connect = Some(Box::new(hook));
    }

    pub fn set_on_publish<F>(&self, hook: F)
    where
        F: Fn(&Arc<Context>, Option<&Arc<Conn>>, &Message) -> PublishDecision + Send + Sync + 'static,
    {
        self.hooks.write().on_publish = Some(Box::new(hook));
    }

    pub fn set_on_subscribe<F>(&self, hook: F)
    where
        F: Fn(&Arc<Context>, &Arc<Conn>, &str, QoS) -> Option<QoS> + Send + Sync + 'static,
    {
        self.hooks.write().on_subscribe = Some(Box::new(hook));
    }

    pub(crate) fn connect_decision(self: &Arc<Self>, conn: &Arc<Conn>, req: &ConnectRequest) -> ConnAction {
        if let Some(hook) = self.hooks.read().on_connect.as_ref() {
            return hook(self, conn, req);
        }

        match self.auth.as_ref() {
            Some(auth) => {
                if auth.authenticate(
                    &self.name,
                    &req.client_id,
                    req.username.as_deref(),
                    req.password.as_deref(),
                ) {
                    ConnAction::Accept
                } else {
                    ConnAction::Refuse(mqttd_core::ConnectReturnCode::BadUserNameOrPassword)
                }
            }
            None if self.limits.require_auth => {
                ConnAction::Refuse(mqttd_core::ConnectReturnCode::NotAuthorized)
            }
            None => ConnAction::Accept,
        }
    }

    pub(crate) fn subscribe_decision(
        self: &Arc<Self>,
        conn: &Arc<Conn>,
        filter: &str,
        requested: QoS,
    ) -> Option<QoS> {
        match self.hooks.read().on_subscribe.as_ref() {
            Some(hook) => hook(self, conn, filter, requested),
            None => Some(requested),
        }
    }

    pub(crate) fn on_publish_decision(
        self: &Arc<Self>,
        from: Option<&Arc<Conn>>,
        msg: &Message,
    ) -> PublishDecision {
        match self.hooks.read().on_publish.as_ref() {
            Some(hook) => hook(self, from, msg),
            None => PublishDecision::Ok,
        }
    }

    // ---- lifecycle --------------------------------------------------------

    /// Orderly teardown: mark exiting, drop every connection, stop the
    /// reader loop and the pool.
    pub fn shutdown(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("context `{}` shutting down", self.name);

        let conns: Vec<Arc<Conn>> = self.conns.lock().values().cloned().collect();
        for conn in conns {
            conn.shutdown();
        }

        self.reader.shutdown();
        self.pool.shutdown();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // the last reference may be a transient upgrade on the reader
        // thread itself, so no joining here
        self.exiting.store(true, Ordering::SeqCst);
        self.reader.shutdown_nowait();
        self.pool.shutdown();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn recover_retained(storage: &dyn Storage) -> Result<HashMap<String, (QoS, Bytes)>> {
    let mut retained = HashMap::new();

    for topic in storage.retain_topics()? {
        if let Some((qos, payload)) = storage.retain_recover(&topic)? {
            retained.insert(topic, (qos, Bytes::from(payload)));
        }
    }

    Ok(retained)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builds_and_shuts_down() {
        let ctx = Context::builder("test").build().unwrap();

        assert_eq!(ctx.name(), "test");
        assert_eq!(ctx.connection_count(), 0);
        assert!(!ctx.is_exiting());

        ctx.shutdown();
        assert!(ctx.is_exiting());
    }

    #[test]
    fn test_conn_id_allocator_shared() {
        let a = Context::builder("a").build().unwrap();
        let b = Context::builder("b")
            .conn_id_allocator(a.conn_id_allocator())
            .build()
            .unwrap();

        let first = a.next_conn_id();
        let second = b.next_conn_id();
        assert_ne!(first, second, "ids stay process-unique across contexts");

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn test_retained_map() {
        let ctx = Context::builder("retained").build().unwrap();

        let msg = Message::new("sensors/temp", &b"22.5"[..], QoS::AtLeastOnce, true);
        ctx.retain_update(&msg);
        assert_eq!(
            ctx.retained("sensors/temp"),
            Some((QoS::AtLeastOnce, Bytes::from(&b"22.5"[..])))
        );

        let matches = ctx.retained_matching(&"sensors/+".parse().unwrap());
        assert_eq!(matches.len(), 1);

        // retain with an empty payload clears the entry
        let clear = Message::new("sensors/temp", &b""[..], QoS::AtMostOnce, true);
        ctx.retain_update(&clear);
        assert_eq!(ctx.retained("sensors/temp"), None);

        ctx.shutdown();
    }
}
