use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;

use mqttd_core::ConnectReturnCode;
use mqttd_proto::{
    restricted_id_ok, ConnAction, ConnectRequest, Conn, Context, PoolConfig, Result,
};

use crate::domain::{Domain, DomainDef};

/// Builder for [`Broker`].
pub struct BrokerBuilder {
    domains: Vec<DomainDef>,
    anonymous: Option<String>,
    storage_root: Option<PathBuf>,
    global_child_limit: usize,
    pool_config: PoolConfig,
}

impl BrokerBuilder {
    /// Declares a tenant domain.
    pub fn domain(mut self, def: DomainDef) -> Self {
        self.domains.push(def);
        self
    }

    /// Names the domain that takes connections no other domain claims.
    pub fn anonymous<S: Into<String>>(mut self, name: S) -> Self {
        self.anonymous = Some(name.into());
        self
    }

    /// Base directory for per-domain session storage
    /// (`<root>/<domain-name>` unless a domain overrides it).
    pub fn storage_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Caps concurrent connections across every domain; 0 is unlimited.
    pub fn global_child_limit(mut self, limit: usize) -> Self {
        self.global_child_limit = limit;
        self
    }

    /// Worker pool sizing applied to each context the broker creates.
    pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    pub fn start(self) -> Result<Arc<Broker>> {
        let system = Context::builder("mqttd/system")
            .pool_config(self.pool_config.clone())
            .build()?;

        let storage_root_ref = self.storage_root.as_ref();
        let domains = self
            .domains
            .into_iter()
            .map(|def| Domain::new(def, storage_root_ref))
            .collect();

        let broker = Arc::new(Broker {
            system,
            domains: RwLock::new(domains),
            anonymous: RwLock::new(self.anonymous),
            storage_root: self.storage_root,
            global_child_limit: self.global_child_limit,
            child_count: Arc::new(AtomicUsize::new(0)),
            pool_config: self.pool_config,
        });

        // CONNECTs land on the system context first; this hook resolves
        // the tenant and re-parents the connection before it is accepted
        let weak = Arc::downgrade(&broker);
        broker
            .system
            .set_on_connect(move |ctx, conn, req| match weak.upgrade() {
                Some(broker) => broker.route_connect(ctx, conn, req),
                None => ConnAction::Refuse(ConnectReturnCode::ServiceUnavailable),
            });

        info!("broker up ({} domains)", broker.domains.read().len());

        Ok(broker)
    }
}

/// The turnkey multi-tenant broker.
///
/// One system context owns the listeners and every connection that has
/// not completed CONNECT yet; each tenant domain owns an isolated
/// context that connections are re-parented onto once resolved.
pub struct Broker {
    system: Arc<Context>,
    domains: RwLock<Vec<Arc<Domain>>>,
    anonymous: RwLock<Option<String>>,
    storage_root: Option<PathBuf>,
    global_child_limit: usize,
    child_count: Arc<AtomicUsize>,
    pool_config: PoolConfig,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder {
            domains: Vec::new(),
            anonymous: None,
            storage_root: None,
            global_child_limit: 0,
            pool_config: PoolConfig::default(),
        }
    }

    /// The system context (listeners and pre-CONNECT connections).
    pub fn system(&self) -> &Arc<Context> {
        &self.system
    }

    /// Opens a listener; returns the bound address, useful with port 0.
    pub fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;

        let weak = Arc::downgrade(self);
        self.system.add_listener(
            listener,
            Box::new(move |stream, peer| {
                let broker = match weak.upgrade() {
                    Some(broker) => broker,
                    None => return,
                };

                if broker.global_child_limit > 0
                    && broker.child_count.load(Ordering::SeqCst) >= broker.global_child_limit
                {
                    warn!("refusing connection from {}: global child limit", peer);
                    return; // dropping the socket closes it
                }

                match Conn::from_accepted(&broker.system, stream) {
                    Ok(conn) => {
                        broker.child_count.fetch_add(1, Ordering::SeqCst);
                        let count = Arc::clone(&broker.child_count);
                        conn.add_on_close(move |_conn| {
                            count.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(err) => warn!("failed to adopt socket from {}: {}", peer, err),
                }
            }),
        )?;

        info!("listening on {}", local);

        Ok(local)
    }

    /// Total concurrent connections across all domains.
    pub fn connection_count(&self) -> usize {
        self.child_count.load(Ordering::SeqCst)
    }

    pub fn domains(&self) -> Vec<Arc<Domain>> {
        self.domains.read().clone()
    }

    pub fn find_domain(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains
            .read()
            .iter()
            .find(|domain| domain.name() == name)
            .cloned()
    }

    /// Replays domain discovery without dropping existing connections:
    /// new domains appear, settings bundles are refreshed, and domains
    /// missing from the new set stop taking connections. An
    /// already-active context keeps its previous limits until the domain
    /// is re-activated.
    pub fn reload(&self, defs: Vec<DomainDef>) {
        let mut domains = self.domains.write();
        let mut seen: HashSet<String> = HashSet::new();

        for def in defs {
            seen.insert(def.name.clone());

            match domains.iter().find(|domain| domain.name() == def.name) {
                Some(existing) => {
                    existing.update_settings(def.settings);
                    existing.set_enabled(true);
                }
                None => {
                    info!("discovered domain `{}`", def.name);
                    domains.push(Domain::new(def, self.storage_root.as_ref()));
                }
            }
        }

        for domain in domains.iter() {
            if !seen.contains(domain.name()) {
                info!("domain `{}` disabled, existing connections kept", domain.name());
                domain.set_enabled(false);
            }
        }
    }

    /// The §4.9 selection ladder: server name, id/user suffix, backend
    /// probing, then the anonymous fallback.
    fn resolve_domain(&self, req: &ConnectRequest) -> Option<Arc<Domain>> {
        if let Some(sni) = req.server_name.as_ref() {
            if let Some(domain) = self.find_enabled(sni) {
                debug!("domain `{}` matched by server name", domain.name());
                return Some(domain);
            }
        }

        if let Some((_, suffix)) = req.client_id.rsplit_once('@') {
            if let Some(domain) = self.find_enabled(suffix) {
                debug!("domain `{}` matched by client id suffix", domain.name());
                return Some(domain);
            }
        }
        if let Some((_, suffix)) = req.username.as_deref().and_then(|user| user.rsplit_once('@')) {
            if let Some(domain) = self.find_enabled(suffix) {
                debug!("domain `{}` matched by username suffix", domain.name());
                return Some(domain);
            }
        }

        for domain in self.domains.read().iter() {
            if !domain.is_enabled() {
                continue;
            }
            if let Some(auth) = domain.auth() {
                if auth.recognize(
                    domain.name(),
                    &req.client_id,
                    req.username.as_deref(),
                    req.password.as_deref(),
                ) {
                    debug!("domain `{}` recognized the credentials", domain.name());
                    return Some(domain.clone());
                }
            }
        }

        self.anonymous
            .read()
            .as_ref()
            .and_then(|name| self.find_enabled(name))
    }

    fn find_enabled(&self, name: &str) -> Option<Arc<Domain>> {
        self.find_domain(name).filter(|domain| domain.is_enabled())
    }

    /// Runs on the system context's on-connect hook: resolves the tenant,
    /// enforces its limits, authenticates, and re-parents the connection.
    fn route_connect(
        self: &Arc<Self>,
        from: &Arc<Context>,
        conn: &Arc<Conn>,
        req: &ConnectRequest,
    ) -> ConnAction {
        let domain = match self.resolve_domain(req) {
            Some(domain) => domain,
            None => {
                info!("no domain for client `{}`", req.client_id);
                return ConnAction::Refuse(ConnectReturnCode::NotAuthorized);
            }
        };

        let settings = domain.settings();

        if settings.conn_limit > 0 && domain.connections() >= settings.conn_limit {
            info!(
                "domain `{}` at its connection limit ({})",
                domain.name(),
                settings.conn_limit
            );
            return ConnAction::Refuse(ConnectReturnCode::ServiceUnavailable);
        }

        if settings.restrict_ids && !restricted_id_ok(&req.client_id) {
            return ConnAction::Refuse(ConnectReturnCode::IdentifierRejected);
        }

        match domain.auth() {
            Some(auth) => {
                if !auth.authenticate(
                    domain.name(),
                    &req.client_id,
                    req.username.as_deref(),
                    req.password.as_deref(),
                ) {
                    return ConnAction::Refuse(ConnectReturnCode::BadUserNameOrPassword);
                }
            }
            None if settings.require_auth => {
                return ConnAction::Refuse(ConnectReturnCode::NotAuthorized);
            }
            None => {}
        }

        let allocator = self.system.conn_id_allocator();
        let ctx = match domain.context(&allocator, &self.pool_config) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!("failed to activate domain `{}`: {}", domain.name(), err);
                return ConnAction::Refuse(ConnectReturnCode::ServiceUnavailable);
            }
        };

        ctx.adopt(conn, from);

        domain.conn_attached();
        let weak = Arc::downgrade(&domain);
        conn.add_on_close(move |_conn| {
            if let Some(domain) = weak.upgrade() {
                domain.conn_detached();
            }
        });

        debug!(
            "client `{}` routed to domain `{}`",
            req.client_id,
            domain.name()
        );

        ConnAction::Accept
    }

    /// Stops the listeners and every domain context.
    pub fn shutdown(&self) {
        info!("broker shutting down");

        self.system.shutdown();
        for domain in self.domains.read().iter() {
            domain.shutdown();
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("domains", &self.domains.read().len())
            .field("connections", &self.connection_count())
            .finish()
    }
}
