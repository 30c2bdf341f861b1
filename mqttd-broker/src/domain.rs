use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use mqttd_proto::{
    AuthBackend, Context, FsStorage, Limits, PoolConfig, Result, Settings, StorageLimits,
};

/// A named bundle of per-tenant limits.
///
/// Bundles are declared once and referenced by any number of domains;
/// numeric zero disables a limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainSettings {
    /// Concurrent connections the domain accepts before replying
    /// SERVER_UNAVAILABLE.
    pub conn_limit: usize,
    /// Publishes above this many bytes are silently dropped.
    pub message_size_limit: usize,
    /// Stored messages allowed per client id.
    pub storage_messages_limit: usize,
    /// Stored bytes allowed per client id.
    pub storage_quota_limit: u64,
    /// Connections must authenticate against the domain's backend.
    pub require_auth: bool,
    /// Enforce the restricted 3.1.1 client-id charset.
    pub restrict_ids: bool,
    /// A duplicate client id evicts the previous connection instead of
    /// being rejected.
    pub drop_conn_same_client_id: bool,
    /// Whether subscriptions may use `+`/`#`.
    pub wildcard_subscriptions: bool,
}

impl Default for DomainSettings {
    fn default() -> Self {
        DomainSettings {
            conn_limit: 0,
            message_size_limit: 0,
            storage_messages_limit: 0,
            storage_quota_limit: 0,
            require_auth: false,
            restrict_ids: false,
            drop_conn_same_client_id: false,
            wildcard_subscriptions: true,
        }
    }
}

impl DomainSettings {
    /// Reads one settings bundle from an abstract settings provider, the
    /// way a config file section is consumed.
    pub fn from_settings(settings: &dyn Settings, path: &str) -> DomainSettings {
        fn number(settings: &dyn Settings, path: &str, attr: &str) -> usize {
            let value = settings.get_number(path, attr);
            if value < 0 {
                0
            } else {
                value as usize
            }
        }

        DomainSettings {
            conn_limit: number(settings, path, "conn-limit"),
            message_size_limit: number(settings, path, "message-size-limit"),
            storage_messages_limit: number(settings, path, "storage-messages-limit"),
            storage_quota_limit: number(settings, path, "storage-quota-limit") as u64,
            require_auth: settings.is_attr_positive(path, "require-auth"),
            restrict_ids: settings.is_attr_positive(path, "restrict-ids"),
            drop_conn_same_client_id: settings.is_attr_positive(path, "drop-conn-same-client-id"),
            wildcard_subscriptions: !settings.is_attr_positive(path, "disable-wildcard-support"),
        }
    }

    fn to_limits(&self) -> Limits {
        Limits {
            message_size_limit: self.message_size_limit,
            require_auth: self.require_auth,
            restrict_ids: self.restrict_ids,
            drop_conn_same_client_id: self.drop_conn_same_client_id,
            wildcard_subscriptions: self.wildcard_subscriptions,
        }
    }
}

/// Declaration of one tenant, as produced by domain discovery.
pub struct DomainDef {
    pub name: String,
    pub settings: DomainSettings,
    pub auth: Option<Arc<dyn AuthBackend>>,
    /// Storage root override; the broker default is `<root>/<name>`.
    pub storage_root: Option<PathBuf>,
}

impl DomainDef {
    pub fn new<S: Into<String>>(name: S) -> Self {
        DomainDef {
            name: name.into(),
            settings: DomainSettings::default(),
            auth: None,
            storage_root: None,
        }
    }

    pub fn settings(mut self, settings: DomainSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthBackend>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn storage_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.storage_root = Some(root.into());
        self
    }
}

/// A tenant: an isolated broker context sharing the process.
///
/// Activation is lazy; the context (with its reader loop, worker pool,
/// indexes and storage) comes up on the first connection routed here.
pub struct Domain {
    name: String,
    settings: Mutex<DomainSettings>,
    auth: Option<Arc<dyn AuthBackend>>,
    storage_root: Option<PathBuf>,
    ctx: Mutex<Option<Arc<Context>>>,
    conn_count: AtomicUsize,
    enabled: AtomicBool,
}

impl Domain {
    pub(crate) fn new(def: DomainDef, default_root: Option<&PathBuf>) -> Arc<Domain> {
        let name = def.name.clone();
        let storage_root = def
            .storage_root
            .or_else(|| default_root.map(|root| root.join(&name)));

        Arc::new(Domain {
            name: def.name,
            settings: Mutex::new(def.settings),
            auth: def.auth,
            storage_root,
            ctx: Mutex::new(None),
            conn_count: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> DomainSettings {
        self.settings.lock().clone()
    }

    pub(crate) fn update_settings(&self, settings: DomainSettings) {
        *self.settings.lock() = settings;
    }

    pub fn auth(&self) -> Option<Arc<dyn AuthBackend>> {
        self.auth.clone()
    }

    /// Live connections currently parented here.
    pub fn connections(&self) -> usize {
        self.conn_count.load(Ordering::SeqCst)
    }

    pub(crate) fn conn_attached(&self) {
        self.conn_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn conn_detached(&self) {
        self.conn_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the domain already spun its context up.
    pub fn is_active(&self) -> bool {
        self.ctx.lock().is_some()
    }

    /// The domain's context, activating it on first use.
    ///
    /// Every tenant context shares the broker-wide connection id
    /// allocator, keeping connection ids process-unique.
    pub(crate) fn context(
        &self,
        allocator: &Arc<std::sync::atomic::AtomicU64>,
        pool_config: &PoolConfig,
    ) -> Result<Arc<Context>> {
        let mut slot = self.ctx.lock();
        if let Some(ctx) = slot.as_ref() {
            return Ok(Arc::clone(ctx));
        }

        info!("activating domain `{}`", self.name);

        let settings = self.settings.lock().clone();
        let mut builder = Context::builder(self.name.clone())
            .limits(settings.to_limits())
            .pool_config(pool_config.clone())
            .conn_id_allocator(Arc::clone(allocator));

        if let Some(root) = self.storage_root.as_ref() {
            let storage = FsStorage::new(
                root,
                StorageLimits {
                    messages_limit: settings.storage_messages_limit,
                    quota_limit: settings.storage_quota_limit,
                },
            )?;
            builder = builder.storage(Arc::new(storage));
        }
        if let Some(auth) = self.auth.as_ref() {
            builder = builder.auth(Arc::clone(auth));
        }

        let ctx = builder.build()?;
        debug!("domain `{}` context up", self.name);

        *slot = Some(Arc::clone(&ctx));
        Ok(ctx)
    }

    pub(crate) fn active_context(&self) -> Option<Arc<Context>> {
        self.ctx.lock().clone()
    }

    pub(crate) fn shutdown(&self) {
        if let Some(ctx) = self.ctx.lock().take() {
            ctx.shutdown();
        }
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("connections", &self.connections())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use mqttd_proto::StaticSettings;

    use super::*;

    #[test]
    fn test_settings_from_provider() {
        let mut provider = StaticSettings::new();
        provider.set("domain-settings/basic", "conn-limit", "5");
        provider.set("domain-settings/basic", "message-size-limit", "256");
        provider.set("domain-settings/basic", "require-auth", "yes");
        provider.set("domain-settings/basic", "disable-wildcard-support", "yes");

        let settings = DomainSettings::from_settings(&provider, "domain-settings/basic");

        assert_eq!(settings.conn_limit, 5);
        assert_eq!(settings.message_size_limit, 256);
        assert!(settings.require_auth);
        assert!(!settings.wildcard_subscriptions);
        assert_eq!(settings.storage_messages_limit, 0, "missing attrs disable limits");
    }

    #[test]
    fn test_lazy_activation() {
        let domain = Domain::new(DomainDef::new("example.com"), None);
        assert!(!domain.is_active());

        let allocator = Arc::new(std::sync::atomic::AtomicU64::new(1));
        let ctx = domain.context(&allocator, &PoolConfig::default()).unwrap();
        assert!(domain.is_active());

        let again = domain.context(&allocator, &PoolConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&ctx, &again), "activation happens once");

        domain.shutdown();
    }
}
