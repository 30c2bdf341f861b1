use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use mqttd_core::{PacketId, QoS};

use crate::errors::{Error, Result};
use crate::topic::{Filter, MatchTopic};

bitflags! {
    /// Which parts of a client's persisted state an operation touches.
    pub struct StorageFlags: u8 {
        const SESSION  = 0b0000_0001;
        const MESSAGES = 0b0000_0010;
        const PKGIDS   = 0b0000_0100;
        const ALL      = Self::SESSION.bits | Self::MESSAGES.bits | Self::PKGIDS.bits;
    }
}

/// Opaque reference to one stored message, returned by `store_msg` and
/// consumed by `release_msg` once the exchange completes.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgHandle {
    path: PathBuf,
    size: u64,
}

/// Persistent storage backend.
///
/// Everything is keyed by client id so every operation is callable
/// without a live connection; the offline publish path relies on that.
/// Implementations must survive a process crash between any two calls.
pub trait Storage: Send + Sync {
    /// Creates the directory tree for a client.
    fn init(&self, client_id: &str, flags: StorageFlags) -> Result<()>;

    /// Wipes persisted state, used on clean-session connects and disconnects.
    fn clear(&self, client_id: &str, flags: StorageFlags) -> Result<()>;

    /// Whether any session state is persisted for the client.
    fn has_session(&self, client_id: &str) -> bool;

    /// Persists one subscription.
    fn sub(&self, client_id: &str, filter: &str, qos: QoS) -> Result<()>;

    /// Removes one persisted subscription.
    fn unsub(&self, client_id: &str, filter: &str) -> Result<()>;

    /// Loads the persisted subscriptions back.
    fn session_recover(&self, client_id: &str) -> Result<Vec<(String, QoS)>>;

    /// Persists a queued or in-flight message (an encoded PUBLISH frame);
    /// fails when the client's message count or byte quota is exhausted.
    fn store_msg(&self, client_id: &str, pkg_id: PacketId, qos: QoS, bytes: &[u8]) -> Result<MsgHandle>;

    /// Releases a stored message once its exchange completed.
    fn release_msg(&self, client_id: &str, handle: &MsgHandle) -> Result<()>;

    /// Number of messages currently queued for the client.
    fn queued_messages(&self, client_id: &str) -> usize;

    /// Bytes currently queued for the client.
    fn queued_messages_quota(&self, client_id: &str) -> u64;

    /// All queued messages in storage order, for replay to a now-online
    /// connection. The caller releases each handle after delivery.
    fn queued_drain(&self, client_id: &str) -> Result<Vec<(MsgHandle, Vec<u8>)>>;

    /// Reserves a packet id durably; false when it is already held.
    fn lock_pkgid(&self, client_id: &str, id: PacketId) -> bool;

    /// Releases a durably reserved packet id.
    fn release_pkgid(&self, client_id: &str, id: PacketId);

    /// Stores the retained message for a topic.
    fn retain_set(&self, topic: &str, qos: QoS, payload: &[u8]) -> Result<()>;

    /// Clears the retained message for a topic.
    fn retain_release(&self, topic: &str) -> Result<()>;

    /// Recovers the retained message for a topic.
    fn retain_recover(&self, topic: &str) -> Result<Option<(QoS, Vec<u8>)>>;

    /// All topics with a retained message.
    fn retain_topics(&self) -> Result<Vec<String>>;

    /// Retained messages whose topic matches a filter.
    fn retain_matching(&self, filter: &Filter) -> Result<Vec<(String, QoS, Vec<u8>)>> {
        let mut matching = Vec::new();
        for topic in self.retain_topics()? {
            if topic.match_topic(filter) {
                if let Some((qos, payload)) = self.retain_recover(&topic)? {
                    matching.push((topic, qos, payload));
                }
            }
        }
        Ok(matching)
    }
}

/// Byte and message-count ceilings enforced per client id; 0 disables a limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageLimits {
    pub messages_limit: usize,
    pub quota_limit: u64,
}

const DEFAULT_HASH_BASE: u32 = 4096;

/// Hash-sharded filesystem storage.
///
/// Layout under the root:
///
/// ```text
/// <root>/<shard>/<client>/subs.json
/// <root>/<shard>/<client>/msgs/<seq>-<pkgid>-<qos>.msg
/// <root>/<shard>/<client>/pkgids/<id>
/// <root>/retained/<shard>/<topic>.msg
/// ```
///
/// Shards are `hash(client_id) % hash_base`; client ids and topics are
/// percent-encoded into path-safe names.
pub struct FsStorage {
    root: PathBuf,
    hash_base: u32,
    limits: StorageLimits,
    clients: Mutex<HashMap<String, Arc<Mutex<ClientUsage>>>>,
}

#[derive(Debug, Default)]
struct ClientUsage {
    scanned: bool,
    count: usize,
    bytes: u64,
    next_seq: u64,
}

trait IoContext<T> {
    fn ctx(self, what: &'static str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn ctx(self, what: &'static str) -> Result<T> {
        self.map_err(|err| Error::Internal(format!("storage: {}: {}", what, err)))
    }
}

impl FsStorage {
    pub fn new<P: AsRef<Path>>(root: P, limits: StorageLimits) -> Result<Self> {
        Self::with_hash_base(root, limits, DEFAULT_HASH_BASE)
    }

    pub fn with_hash_base<P: AsRef<Path>>(root: P, limits: StorageLimits, hash_base: u32) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).ctx("create root")?;

        Ok(FsStorage {
            root,
            hash_base: hash_base.max(1),
            limits,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn shard(&self, name: &str) -> String {
        format!("{:04x}", fnv1a(name.as_bytes()) % self.hash_base)
    }

    fn client_dir(&self, client_id: &str) -> PathBuf {
        self.root.join(self.shard(client_id)).join(encode_name(client_id))
    }

    fn retained_path(&self, topic: &str) -> PathBuf {
        self.root
            .join("retained")
            .join(self.shard(topic))
            .join(format!("{}.msg", encode_name(topic)))
    }

    /// The per-client usage cell; all mutations of one client's tree are
    /// serialized on its lock.
    fn usage(&self, client_id: &str) -> Arc<Mutex<ClientUsage>> {
        Arc::clone(
            self.clients
                .lock()
                .entry(client_id.to_owned())
                .or_insert_with(Default::default),
        )
    }

    /// Recomputes the cached counters from disk on first touch.
    fn scan(&self, client_id: &str, usage: &mut ClientUsage) {
        if usage.scanned {
            return;
        }

        usage.count = 0;
        usage.bytes = 0;
        usage.next_seq = 1;

        if let Ok(entries) = fs::read_dir(self.client_dir(client_id).join("msgs")) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    usage.count += 1;
                    usage.bytes += meta.len();
                }
                if let Some(seq) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.split('-').next())
                    .and_then(|seq| seq.parse::<u64>().ok())
                {
                    usage.next_seq = usage.next_seq.max(seq + 1);
                }
            }
        }

        usage.scanned = true;
    }
}

impl Storage for FsStorage {
    fn init(&self, client_id: &str, flags: StorageFlags) -> Result<()> {
        let dir = self.client_dir(client_id);
        fs::create_dir_all(&dir).ctx("init client dir")?;
        if flags.contains(StorageFlags::MESSAGES) {
            fs::create_dir_all(dir.join("msgs")).ctx("init msgs dir")?;
        }
        if flags.contains(StorageFlags::PKGIDS) {
            fs::create_dir_all(dir.join("pkgids")).ctx("init pkgids dir")?;
        }
        Ok(())
    }

    fn clear(&self, client_id: &str, flags: StorageFlags) -> Result<()> {
        let cell = self.usage(client_id);
        let mut usage = cell.lock();
        let dir = self.client_dir(client_id);

        if flags.contains(StorageFlags::SESSION) {
            remove_if_exists(&dir.join("subs.json"))?;
        }
        if flags.contains(StorageFlags::MESSAGES) {
            remove_dir_if_exists(&dir.join("msgs"))?;
            usage.count = 0;
            usage.bytes = 0;
            usage.scanned = true;
        }
        if flags.contains(StorageFlags::PKGIDS) {
            remove_dir_if_exists(&dir.join("pkgids"))?;
        }

        Ok(())
    }

    fn has_session(&self, client_id: &str) -> bool {
        let dir = self.client_dir(client_id);
        dir.join("subs.json").exists()
            || fs::read_dir(dir.join("msgs")).map_or(false, |mut entries| entries.next().is_some())
    }

    fn sub(&self, client_id: &str, filter: &str, qos: QoS) -> Result<()> {
        let cell = self.usage(client_id);
        let _usage = cell.lock();

        let mut subs = read_subs(&self.client_dir(client_id))?;
        subs.insert(filter.to_owned(), qos as u8);
        write_subs(&self.client_dir(client_id), &subs)
    }

    fn unsub(&self, client_id: &str, filter: &str) -> Result<()> {
        let cell = self.usage(client_id);
        let _usage = cell.lock();

        let mut subs = read_subs(&self.client_dir(client_id))?;
        if subs.remove(filter).is_some() {
            write_subs(&self.client_dir(client_id), &subs)?;
        }
        Ok(())
    }

    fn session_recover(&self, client_id: &str) -> Result<Vec<(String, QoS)>> {
        use std::convert::TryFrom;

        let cell = self.usage(client_id);
        {
            let mut usage = cell.lock();
            self.scan(client_id, &mut usage);
        }

        let subs = read_subs(&self.client_dir(client_id))?;
        Ok(subs
            .into_iter()
            .filter_map(|(filter, qos)| QoS::try_from(qos).ok().map(|qos| (filter, qos)))
            .collect())
    }

    fn store_msg(&self, client_id: &str, pkg_id: PacketId, qos: QoS, bytes: &[u8]) -> Result<MsgHandle> {
        let cell = self.usage(client_id);
        let mut usage = cell.lock();
        self.scan(client_id, &mut usage);

        if self.limits.messages_limit > 0 && usage.count >= self.limits.messages_limit {
            return Err(Error::Resource(format!(
                "client `{}` reached {} stored messages",
                client_id, self.limits.messages_limit
            )));
        }
        if self.limits.quota_limit > 0 && usage.bytes + bytes.len() as u64 > self.limits.quota_limit {
            return Err(Error::Resource(format!(
                "client `{}` reached its {} byte storage quota",
                client_id, self.limits.quota_limit
            )));
        }

        let dir = self.client_dir(client_id).join("msgs");
        fs::create_dir_all(&dir).ctx("create msgs dir")?;

        let seq = usage.next_seq;
        let path = dir.join(format!("{:020}-{:05}-{}.msg", seq, pkg_id, qos as u8));

        let mut file = File::create(&path).ctx("create msg file")?;
        file.write_all(bytes).ctx("write msg")?;
        file.sync_all().ctx("sync msg")?;

        usage.next_seq = seq + 1;
        usage.count += 1;
        usage.bytes += bytes.len() as u64;

        debug!("stored message for `{}` at {:?}", client_id, path);

        Ok(MsgHandle {
            path,
            size: bytes.len() as u64,
        })
    }

    fn release_msg(&self, client_id: &str, handle: &MsgHandle) -> Result<()> {
        let cell = self.usage(client_id);
        let mut usage = cell.lock();

        remove_if_exists(&handle.path)?;
        if usage.scanned {
            usage.count = usage.count.saturating_sub(1);
            usage.bytes = usage.bytes.saturating_sub(handle.size);
        }
        Ok(())
    }

    fn queued_messages(&self, client_id: &str) -> usize {
        let cell = self.usage(client_id);
        let mut usage = cell.lock();
        self.scan(client_id, &mut usage);
        usage.count
    }

    fn queued_messages_quota(&self, client_id: &str) -> u64 {
        let cell = self.usage(client_id);
        let mut usage = cell.lock();
        self.scan(client_id, &mut usage);
        usage.bytes
    }

    fn queued_drain(&self, client_id: &str) -> Result<Vec<(MsgHandle, Vec<u8>)>> {
        let cell = self.usage(client_id);
        let _usage = cell.lock();

        let dir = self.client_dir(client_id).join("msgs");
        let mut names: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(entries) => entries.flatten().map(|entry| entry.path()).collect(),
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::Internal(format!("storage: list msgs: {}", err))),
        };
        names.sort();

        let mut drained = Vec::with_capacity(names.len());
        for path in names {
            let mut bytes = Vec::new();
            File::open(&path)
                .and_then(|mut file| file.read_to_end(&mut bytes))
                .ctx("read msg")?;
            let size = bytes.len() as u64;
            drained.push((MsgHandle { path, size }, bytes));
        }

        Ok(drained)
    }

    fn lock_pkgid(&self, client_id: &str, id: PacketId) -> bool {
        let dir = self.client_dir(client_id).join("pkgids");
        if fs::create_dir_all(&dir).is_err() {
            return false;
        }

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(id.to_string()))
            .is_ok()
    }

    fn release_pkgid(&self, client_id: &str, id: PacketId) {
        let path = self.client_dir(client_id).join("pkgids").join(id.to_string());
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to release pkgid {} for `{}`: {}", id, client_id, err);
            }
        }
    }

    fn retain_set(&self, topic: &str, qos: QoS, payload: &[u8]) -> Result<()> {
        let path = self.retained_path(topic);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ctx("create retained dir")?;
        }

        let mut file = File::create(&path).ctx("create retained file")?;
        file.write_all(&[qos as u8]).ctx("write retained qos")?;
        file.write_all(payload).ctx("write retained payload")?;
        file.sync_all().ctx("sync retained")
    }

    fn retain_release(&self, topic: &str) -> Result<()> {
        remove_if_exists(&self.retained_path(topic))
    }

    fn retain_recover(&self, topic: &str) -> Result<Option<(QoS, Vec<u8>)>> {
        use std::convert::TryFrom;

        let mut bytes = Vec::new();
        match File::open(self.retained_path(topic)) {
            Ok(mut file) => file.read_to_end(&mut bytes).ctx("read retained")?,
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Internal(format!("storage: open retained: {}", err))),
        };

        match bytes.split_first() {
            Some((&qos, payload)) => Ok(QoS::try_from(qos)
                .ok()
                .map(|qos| (qos, payload.to_vec()))),
            None => Ok(None),
        }
    }

    fn retain_topics(&self) -> Result<Vec<String>> {
        let retained = self.root.join("retained");
        let mut topics = Vec::new();

        let shards = match fs::read_dir(&retained) {
            Ok(shards) => shards,
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(topics),
            Err(err) => return Err(Error::Internal(format!("storage: list retained: {}", err))),
        };

        for shard in shards.flatten() {
            if let Ok(entries) = fs::read_dir(shard.path()) {
                for entry in entries.flatten() {
                    if let Some(name) = entry
                        .file_name()
                        .to_str()
                        .and_then(|name| name.strip_suffix(".msg"))
                    {
                        topics.push(decode_name(name));
                    }
                }
            }
        }

        Ok(topics)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Internal(format!("storage: remove {:?}: {}", path, err))),
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Internal(format!("storage: remove {:?}: {}", path, err))),
    }
}

fn read_subs(dir: &Path) -> Result<HashMap<String, u8>> {
    match File::open(dir.join("subs.json")) {
        Ok(file) => serde_json::from_reader(file)
            .map_err(|err| Error::Internal(format!("storage: parse subs: {}", err))),
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(Error::Internal(format!("storage: open subs: {}", err))),
    }
}

fn write_subs(dir: &Path, subs: &HashMap<String, u8>) -> Result<()> {
    fs::create_dir_all(dir).ctx("create client dir")?;

    let tmp = dir.join("subs.json.tmp");
    let mut file = File::create(&tmp).ctx("create subs")?;
    serde_json::to_writer(&mut file, subs)
        .map_err(|err| Error::Internal(format!("storage: encode subs: {}", err)))?;
    file.sync_all().ctx("sync subs")?;
    fs::rename(&tmp, dir.join("subs.json")).ctx("commit subs")
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = 0x811c_9dc5u32;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Escapes a client id or topic into a path-safe file name.
fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(b as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{:02x}", b));
            }
        }
    }
    out
}

fn decode_name(name: &str) -> String {
    let mut bytes = Vec::with_capacity(name.len());
    let mut chars = name.bytes();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next();
            let lo = chars.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                if let Ok(byte) = u8::from_str_radix(&format!("{}{}", hi as char, lo as char), 16) {
                    bytes.push(byte);
                    continue;
                }
            }
            bytes.push(b);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;
    use tempfile::tempdir;

    use super::*;

    fn storage(limits: StorageLimits) -> (tempfile::TempDir, FsStorage) {
        let dir = tempdir().unwrap();
        let storage = FsStorage::new(dir.path().join("db"), limits).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_name_round_trip() {
        for name in &["simple", "a/b/c", "weird id!@#", "ünïcode"] {
            assert_eq!(decode_name(&encode_name(name)), *name);
        }
    }

    #[test]
    fn test_subscriptions_persist() {
        let (_dir, storage) = storage(Default::default());

        storage.init("c1", StorageFlags::ALL).unwrap();
        storage.sub("c1", "a/b", QoS::AtLeastOnce).unwrap();
        storage.sub("c1", "x/#", QoS::AtMostOnce).unwrap();

        let mut subs = storage.session_recover("c1").unwrap();
        subs.sort();
        assert_eq!(
            subs,
            vec![
                ("a/b".to_owned(), QoS::AtLeastOnce),
                ("x/#".to_owned(), QoS::AtMostOnce),
            ]
        );

        storage.unsub("c1", "a/b").unwrap();
        assert_eq!(
            storage.session_recover("c1").unwrap(),
            vec![("x/#".to_owned(), QoS::AtMostOnce)]
        );

        assert!(storage.has_session("c1"));
        storage.clear("c1", StorageFlags::ALL).unwrap();
        assert!(!storage.has_session("c1"));
        assert_eq!(storage.session_recover("c1").unwrap(), vec![]);
    }

    #[test]
    fn test_store_and_drain_in_order() {
        let (_dir, storage) = storage(Default::default());
        storage.init("c1", StorageFlags::ALL).unwrap();

        for i in 0..3u8 {
            storage
                .store_msg("c1", u16::from(i) + 1, QoS::AtLeastOnce, &[i; 4])
                .unwrap();
        }

        assert_eq!(storage.queued_messages("c1"), 3);
        assert_eq!(storage.queued_messages_quota("c1"), 12);

        let drained = storage.queued_drain("c1").unwrap();
        assert_eq!(drained.len(), 3);
        for (i, (handle, bytes)) in drained.iter().enumerate() {
            assert_eq!(bytes, &vec![i as u8; 4], "messages replay in publish order");
            storage.release_msg("c1", handle).unwrap();
        }

        assert_eq!(storage.queued_messages("c1"), 0);
        assert_eq!(storage.queued_messages_quota("c1"), 0);
    }

    #[test]
    fn test_message_quota_enforced() {
        let (_dir, storage) = storage(StorageLimits {
            messages_limit: 2,
            quota_limit: 0,
        });
        storage.init("c1", StorageFlags::ALL).unwrap();

        storage.store_msg("c1", 1, QoS::AtLeastOnce, b"aa").unwrap();
        storage.store_msg("c1", 2, QoS::AtLeastOnce, b"bb").unwrap();
        assert_matches!(
            storage.store_msg("c1", 3, QoS::AtLeastOnce, b"cc"),
            Err(Error::Resource(_))
        );
    }

    #[test]
    fn test_byte_quota_enforced() {
        let (_dir, storage) = storage(StorageLimits {
            messages_limit: 0,
            quota_limit: 10,
        });
        storage.init("c1", StorageFlags::ALL).unwrap();

        storage.store_msg("c1", 1, QoS::AtLeastOnce, b"12345678").unwrap();
        assert_matches!(
            storage.store_msg("c1", 2, QoS::AtLeastOnce, b"123"),
            Err(Error::Resource(_))
        );

        // quota applies per client id
        storage.init("c2", StorageFlags::ALL).unwrap();
        storage.store_msg("c2", 1, QoS::AtLeastOnce, b"123").unwrap();
    }

    #[test]
    fn test_pkgid_locks() {
        let (_dir, storage) = storage(Default::default());
        storage.init("c1", StorageFlags::PKGIDS).unwrap();

        assert!(storage.lock_pkgid("c1", 1));
        assert!(!storage.lock_pkgid("c1", 1), "second lock fails");
        storage.release_pkgid("c1", 1);
        assert!(storage.lock_pkgid("c1", 1), "lock again after release");
    }

    #[test]
    fn test_retained_messages() {
        let (_dir, storage) = storage(Default::default());

        assert_eq!(storage.retain_recover("sensors/room/temp").unwrap(), None);

        storage
            .retain_set("sensors/room/temp", QoS::AtLeastOnce, b"22.5")
            .unwrap();
        assert_eq!(
            storage.retain_recover("sensors/room/temp").unwrap(),
            Some((QoS::AtLeastOnce, b"22.5".to_vec()))
        );

        storage.retain_set("sensors/room/hum", QoS::AtMostOnce, b"40").unwrap();
        let mut topics = storage.retain_topics().unwrap();
        topics.sort();
        assert_eq!(topics, vec!["sensors/room/hum", "sensors/room/temp"]);

        let mut matching = storage.retain_matching(&"sensors/room/+".parse().unwrap()).unwrap();
        matching.sort();
        assert_eq!(matching.len(), 2);
        assert_eq!(
            storage.retain_matching(&"other/#".parse().unwrap()).unwrap(),
            vec![]
        );

        storage.retain_release("sensors/room/temp").unwrap();
        assert_eq!(storage.retain_recover("sensors/room/temp").unwrap(), None);
    }

    #[test]
    fn test_counters_recomputed_after_reopen() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("db");

        {
            let storage = FsStorage::new(&root, Default::default()).unwrap();
            storage.init("c1", StorageFlags::ALL).unwrap();
            storage.store_msg("c1", 1, QoS::AtLeastOnce, b"hello").unwrap();
        }

        // a fresh instance over the same root recovers the usage from disk
        let storage = FsStorage::new(&root, Default::default()).unwrap();
        assert_eq!(storage.queued_messages("c1"), 1);
        assert_eq!(storage.queued_messages_quota("c1"), 5);

        let drained = storage.queued_drain("c1").unwrap();
        assert_eq!(drained[0].1, b"hello");
    }
}
