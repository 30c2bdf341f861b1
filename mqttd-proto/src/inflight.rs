use std::collections::{BTreeSet, HashMap, HashSet};

use crossbeam_channel as channel;
use log::trace;
use parking_lot::Mutex;

use mqttd_core::{PacketId, QoS, SubscribeReturnCode, Type};

use crate::storage::MsgHandle;

/// An acknowledgment routed to whoever is waiting on its packet id.
#[derive(Debug, Clone)]
pub(crate) struct Ack {
    pub packet_type: Type,
    pub packet_id: PacketId,
    /// Per-filter grant bytes, for SUBACK only.
    pub granted: Vec<SubscribeReturnCode>,
}

impl Ack {
    pub(crate) fn new(packet_type: Type, packet_id: PacketId) -> Self {
        Ack {
            packet_type,
            packet_id,
            granted: Vec::new(),
        }
    }
}

/// What an in-flight packet id is waiting for.
pub(crate) enum WaitEntry {
    /// A caller thread is parked on the channel (synchronous publish,
    /// subscribe, unsubscribe).
    Rendezvous(channel::Sender<Ack>),
    /// The exchange is tracked asynchronously: acknowledgments release
    /// the stored message and the id as they arrive (broker to
    /// subscriber deliveries, queued-message replay).
    Track(Track),
}

/// Asynchronous exchange state for one delivered message.
pub(crate) struct Track {
    /// Storage to release once delivery is assured.
    pub stored: Option<(String, MsgHandle)>,
    /// Delivery QoS; decides whether PUBACK or PUBREC/PUBCOMP finish it.
    pub qos: QoS,
    /// Set once PUBREC arrived and the stored message was released.
    pub released: bool,
}

/// Wait-reply table for exchanges this side originated.
///
/// Senders register before the packet goes out; the ack handlers complete
/// or advance entries as replies arrive. A waiter that times out removes
/// its own entry, and any ack that finds no entry is a stray to be logged
/// and dropped.
#[derive(Default)]
pub(crate) struct WaitReplies {
    entries: Mutex<HashMap<PacketId, WaitEntry>>,
}

impl WaitReplies {
    /// Registers a rendezvous and hands back the receiving side.
    pub fn begin(&self, id: PacketId) -> channel::Receiver<Ack> {
        let (tx, rx) = channel::bounded(1);
        self.entries.lock().insert(id, WaitEntry::Rendezvous(tx));
        rx
    }

    /// Registers an asynchronously tracked exchange.
    pub fn begin_track(&self, id: PacketId, track: Track) {
        self.entries.lock().insert(id, WaitEntry::Track(track));
    }

    /// Takes the entry for an arriving ack, if anyone is waiting.
    pub fn take(&self, id: PacketId) -> Option<WaitEntry> {
        self.entries.lock().remove(&id)
    }

    /// Re-installs a tracked exchange that advanced a stage.
    pub fn put_back(&self, id: PacketId, track: Track) {
        self.entries.lock().insert(id, WaitEntry::Track(track));
    }

    /// Drops the entry after a timeout.
    pub fn cancel(&self, id: PacketId) {
        if self.entries.lock().remove(&id).is_some() {
            trace!("wait-reply for packet id {} cancelled", id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Ids currently in flight; the allocator skips them.
    pub fn pending_ids(&self) -> Vec<PacketId> {
        self.entries.lock().keys().copied().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Exchanges the peer originated (inbound QoS 2 publishes).
///
/// Only PUBREL is routed through here; presence of an id means the
/// exchange is open and a re-sent PUBLISH with it is a retransmit that
/// must not be redelivered.
#[derive(Default)]
pub(crate) struct PeerReplies {
    ids: Mutex<HashSet<PacketId>>,
}

impl PeerReplies {
    /// Opens an exchange; false when the id is already open (retransmit).
    pub fn open(&self, id: PacketId) -> bool {
        self.ids.lock().insert(id)
    }

    /// Closes the exchange on PUBREL; false for an unknown id.
    pub fn close(&self, id: PacketId) -> bool {
        self.ids.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn clear(&self) {
        self.ids.lock().clear();
    }
}

/// The 16-bit packet id space of one connection.
///
/// Ids are handed out lowest-free starting at 1 and are never reused
/// while an exchange or a persisted operation still holds them; for
/// persistent sessions the durable lock table gets the final say.
#[derive(Default)]
pub(crate) struct PacketIdPool {
    in_use: BTreeSet<PacketId>,
}

impl PacketIdPool {
    /// Allocates the lowest free id, consulting `durable_lock` (the
    /// storage lock table) when present. Exhaustion of the id space
    /// reports `None`.
    pub fn allocate<F>(&mut self, skip: &[PacketId], mut durable_lock: F) -> Option<PacketId>
    where
        F: FnMut(PacketId) -> bool,
    {
        let mut id: PacketId = 1;

        loop {
            if !self.in_use.contains(&id) && !skip.contains(&id) && durable_lock(id) {
                self.in_use.insert(id);
                return Some(id);
            }
            if id == PacketId::max_value() {
                return None;
            }
            id += 1;
        }
    }

    pub fn release(&mut self, id: PacketId) {
        self.in_use.remove(&id);
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_allocation() {
        let mut pool = PacketIdPool::default();

        assert_eq!(pool.allocate(&[], |_| true), Some(1));
        assert_eq!(pool.allocate(&[], |_| true), Some(2));

        pool.release(1);
        assert_eq!(pool.allocate(&[], |_| true), Some(1), "released ids come back first");
    }

    #[test]
    fn test_allocation_skips_waiting_ids() {
        let mut pool = PacketIdPool::default();

        assert_eq!(pool.allocate(&[1, 2], |_| true), Some(3));
    }

    #[test]
    fn test_allocation_respects_durable_locks() {
        let mut pool = PacketIdPool::default();

        assert_eq!(pool.allocate(&[], |id| id > 4), Some(5));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = PacketIdPool::default();

        assert_eq!(pool.allocate(&[], |_| false), None);
    }

    #[test]
    fn test_wait_replies_rendezvous() {
        let waits = WaitReplies::default();

        let rx = waits.begin(7);
        assert_eq!(waits.len(), 1);

        match waits.take(7) {
            Some(WaitEntry::Rendezvous(tx)) => tx.send(Ack::new(Type::PUBACK, 7)).unwrap(),
            _ => panic!("expected rendezvous entry"),
        }

        let ack = rx.recv().unwrap();
        assert_eq!(ack.packet_type, Type::PUBACK);
        assert_eq!(ack.packet_id, 7);
        assert_eq!(waits.len(), 0);
    }

    #[test]
    fn test_stray_ack_finds_no_entry() {
        let waits = WaitReplies::default();
        assert!(waits.take(42).is_none());
    }

    #[test]
    fn test_peer_retransmit_detection() {
        let peers = PeerReplies::default();

        assert!(peers.open(3), "first delivery opens the exchange");
        assert!(!peers.open(3), "re-sent publish is a retransmit");
        assert!(peers.close(3));
        assert!(!peers.close(3), "stray release");
    }
}
