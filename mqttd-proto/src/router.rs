use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use mqttd_core::QoS;

use crate::conn::{offline_publish, Conn};
use crate::context::Context;
use crate::message::Message;
use crate::topic::{Filter, MatchTopic};

/// Verdict of the optional on-publish hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishDecision {
    /// Route the message normally.
    Ok,
    /// Drop the message without telling the publisher.
    Discard,
    /// Drop the message and shut the publishing connection down.
    CloseConnection,
}

/// How long a subscription mutation waits for in-progress publishes
/// before re-checking.
const QUIESCE_STEP: Duration = Duration::from_millis(100);
/// Upper bound on the quiescence wait; past this the mutation proceeds
/// rather than starving behind a publish storm.
const QUIESCE_LIMIT: Duration = Duration::from_secs(2);

struct IndexState {
    exact: HashMap<String, HashMap<u64, QoS>>,
    wildcard: HashMap<Filter, HashMap<u64, QoS>>,
    offline_exact: HashMap<String, HashMap<String, QoS>>,
    offline_wildcard: HashMap<Filter, HashMap<String, QoS>>,
    /// Publishes currently walking a snapshot of the maps.
    publishing: u32,
}

/// The context's subscription maps, online and offline.
///
/// Online entries key subscribers by connection id, offline entries by
/// client id. Publishes take a snapshot under the lock and deliver
/// outside it; mutations wait for in-flight publishes to drain first, so
/// no publish ever observes a half-applied subscription change.
pub struct SubscriptionIndex {
    state: Mutex<IndexState>,
    quiesced: Condvar,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        SubscriptionIndex {
            state: Mutex::new(IndexState {
                exact: HashMap::new(),
                wildcard: HashMap::new(),
                offline_exact: HashMap::new(),
                offline_wildcard: HashMap::new(),
                publishing: 0,
            }),
            quiesced: Condvar::new(),
        }
    }
}

impl SubscriptionIndex {
    fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut IndexState) -> R,
    {
        let mut state = self.state.lock();

        // block while publishes are in progress, up to a short limit,
        // then go ahead rather than starve
        let mut waited = Duration::from_millis(0);
        while state.publishing > 0 && waited < QUIESCE_LIMIT {
            self.quiesced.wait_for(&mut state, QUIESCE_STEP);
            waited += QUIESCE_STEP;
        }

        f(&mut state)
    }

    /// Registers an online subscription for a connection.
    pub fn subscribe(&self, conn_id: u64, filter: &Filter, qos: QoS) {
        self.mutate(|state| {
            if filter.is_wildcard() {
                state
                    .wildcard
                    .entry(filter.clone())
                    .or_insert_with(HashMap::new)
                    .insert(conn_id, qos);
            } else {
                state
                    .exact
                    .entry(filter.to_string())
                    .or_insert_with(HashMap::new)
                    .insert(conn_id, qos);
            }
        })
    }

    /// Removes one online subscription; empty filter entries are dropped.
    pub fn unsubscribe(&self, conn_id: u64, filter: &Filter) {
        self.mutate(|state| {
            if filter.is_wildcard() {
                if let Some(subs) = state.wildcard.get_mut(filter) {
                    subs.remove(&conn_id);
                    if subs.is_empty() {
                        state.wildcard.remove(filter);
                    }
                }
            } else {
                let name = filter.to_string();
                if let Some(subs) = state.exact.get_mut(&name) {
                    subs.remove(&conn_id);
                    if subs.is_empty() {
                        state.exact.remove(&name);
                    }
                }
            }
        })
    }

    /// Drops every online entry of a connection.
    pub fn remove_conn(&self, conn_id: u64) {
        self.mutate(|state| {
            state.exact.retain(|_, subs| {
                subs.remove(&conn_id);
                !subs.is_empty()
            });
            state.wildcard.retain(|_, subs| {
                subs.remove(&conn_id);
                !subs.is_empty()
            });
        })
    }

    /// Moves a disconnecting persistent session's subscriptions to the
    /// offline maps, keyed by client id.
    pub fn migrate_to_offline(&self, conn_id: u64, client_id: &str, subs: Vec<(Filter, QoS)>) {
        self.mutate(|state| {
            state.exact.retain(|_, entry| {
                entry.remove(&conn_id);
                !entry.is_empty()
            });
            state.wildcard.retain(|_, entry| {
                entry.remove(&conn_id);
                !entry.is_empty()
            });

            for (filter, qos) in subs {
                if filter.is_wildcard() {
                    state
                        .offline_wildcard
                        .entry(filter)
                        .or_insert_with(HashMap::new)
                        .insert(client_id.to_owned(), qos);
                } else {
                    state
                        .offline_exact
                        .entry(filter.to_string())
                        .or_insert_with(HashMap::new)
                        .insert(client_id.to_owned(), qos);
                }
            }
        })
    }

    /// Moves a reconnecting client's offline subscriptions back online;
    /// returns them so the connection can adopt the set.
    pub fn migrate_to_online(&self, client_id: &str, conn_id: u64) -> Vec<(Filter, QoS)> {
        self.mutate(|state| {
            let mut migrated = Vec::new();

            state.offline_exact.retain(|name, entry| {
                if let Some(qos) = entry.remove(client_id) {
                    if let Ok(filter) = name.parse::<Filter>() {
                        migrated.push((filter, qos));
                    }
                }
                !entry.is_empty()
            });
            state.offline_wildcard.retain(|filter, entry| {
                if let Some(qos) = entry.remove(client_id) {
                    migrated.push((filter.clone(), qos));
                }
                !entry.is_empty()
            });

            for (filter, qos) in &migrated {
                if filter.is_wildcard() {
                    state
                        .wildcard
                        .entry(filter.clone())
                        .or_insert_with(HashMap::new)
                        .insert(conn_id, *qos);
                } else {
                    state
                        .exact
                        .entry(filter.to_string())
                        .or_insert_with(HashMap::new)
                        .insert(conn_id, *qos);
                }
            }

            migrated
        })
    }

    /// Registers an offline subscription directly (session recovery for a
    /// client that is not connected).
    pub fn subscribe_offline(&self, client_id: &str, filter: &Filter, qos: QoS) {
        self.mutate(|state| {
            if filter.is_wildcard() {
                state
                    .offline_wildcard
                    .entry(filter.clone())
                    .or_insert_with(HashMap::new)
                    .insert(client_id.to_owned(), qos);
            } else {
                state
                    .offline_exact
                    .entry(filter.to_string())
                    .or_insert_with(HashMap::new)
                    .insert(client_id.to_owned(), qos);
            }
        })
    }

    /// Drops every offline entry of a client (clean-session connect).
    pub fn remove_offline(&self, client_id: &str) {
        self.mutate(|state| {
            state.offline_exact.retain(|_, entry| {
                entry.remove(client_id);
                !entry.is_empty()
            });
            state.offline_wildcard.retain(|_, entry| {
                entry.remove(client_id);
                !entry.is_empty()
            });
        })
    }

    /// Snapshots the delivery targets for a topic and opens a publish
    /// window; the caller MUST pair this with [`SubscriptionIndex::end_publish`].
    fn begin_publish(&self, topic: &str) -> (Vec<(u64, QoS)>, Vec<(String, QoS)>) {
        let mut state = self.state.lock();
        state.publishing += 1;

        let mut online: Vec<(u64, QoS)> = Vec::new();
        let mut offline: Vec<(String, QoS)> = Vec::new();

        if let Some(subs) = state.exact.get(topic) {
            online.extend(subs.iter().map(|(conn_id, qos)| (*conn_id, *qos)));
        }
        for (filter, subs) in &state.wildcard {
            if topic.match_topic(filter) {
                online.extend(subs.iter().map(|(conn_id, qos)| (*conn_id, *qos)));
            }
        }

        if let Some(subs) = state.offline_exact.get(topic) {
            offline.extend(subs.iter().map(|(client_id, qos)| (client_id.clone(), *qos)));
        }
        for (filter, subs) in &state.offline_wildcard {
            if topic.match_topic(filter) {
                offline.extend(subs.iter().map(|(client_id, qos)| (client_id.clone(), *qos)));
            }
        }

        (online, offline)
    }

    fn end_publish(&self) {
        let mut state = self.state.lock();
        state.publishing = state.publishing.saturating_sub(1);
        if state.publishing == 0 {
            drop(state);
            self.quiesced.notify_all();
        }
    }

    /// Online subscription count, for diagnostics.
    pub fn online_len(&self) -> usize {
        let state = self.state.lock();
        state.exact.values().map(HashMap::len).sum::<usize>()
            + state.wildcard.values().map(HashMap::len).sum::<usize>()
    }

    /// Offline subscription count, for diagnostics.
    pub fn offline_len(&self) -> usize {
        let state = self.state.lock();
        state.offline_exact.values().map(HashMap::len).sum::<usize>()
            + state.offline_wildcard.values().map(HashMap::len).sum::<usize>()
    }
}

/// Routes one published message to every matching subscriber.
///
/// A subscriber appears once per matching filter entry; per-delivery QoS
/// is `min(publish qos, granted qos)`. Matching offline sessions get the
/// message queued through the offline publish path.
pub fn dispatch(ctx: &Arc<Context>, from: Option<&Arc<Conn>>, msg: &Arc<Message>) -> PublishDecision {
    let decision = ctx.on_publish_decision(from, msg.as_ref());
    match decision {
        PublishDecision::Ok => {}
        PublishDecision::Discard => {
            trace!("publish on `{}` discarded by hook", msg.topic);
            return decision;
        }
        PublishDecision::CloseConnection => {
            warn!("publish on `{}` closed the publishing connection", msg.topic);
            return decision;
        }
    }

    if msg.retain {
        ctx.retain_update(msg.as_ref());
    }

    let index = ctx.subscriptions();
    let (online, offline) = index.begin_publish(&msg.topic);

    for (conn_id, granted) in online {
        // self-delivery is fine; MQTT v3 has no no-local option
        if let Some(subscriber) = ctx.conn_by_id(conn_id) {
            subscriber.deliver(ctx, msg.as_ref(), granted, false);
        }
    }

    for (client_id, granted) in offline {
        let qos = msg.qos.min(granted);
        if let Err(err) = offline_publish(ctx, &client_id, &msg.topic, &msg.payload, qos, false) {
            debug!("offline publish to `{}` failed: {}", client_id, err);
        }
    }

    index.end_publish();

    PublishDecision::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> Filter {
        s.parse().unwrap()
    }

    #[test]
    fn test_exact_and_wildcard_targets() {
        let index = SubscriptionIndex::default();

        index.subscribe(1, &filter("a/b"), QoS::AtLeastOnce);
        index.subscribe(2, &filter("a/+"), QoS::AtMostOnce);
        index.subscribe(3, &filter("x/y"), QoS::AtMostOnce);

        let (mut online, offline) = index.begin_publish("a/b");
        index.end_publish();
        online.sort();

        assert_eq!(online, vec![(1, QoS::AtLeastOnce), (2, QoS::AtMostOnce)]);
        assert!(offline.is_empty());
    }

    #[test]
    fn test_unsubscribe_drops_empty_entries() {
        let index = SubscriptionIndex::default();

        index.subscribe(1, &filter("a/b"), QoS::AtMostOnce);
        index.unsubscribe(1, &filter("a/b"));

        let (online, _) = index.begin_publish("a/b");
        index.end_publish();
        assert!(online.is_empty());
        assert_eq!(index.online_len(), 0);
    }

    #[test]
    fn test_offline_migration_round_trip() {
        let index = SubscriptionIndex::default();

        index.subscribe(1, &filter("a/b"), QoS::AtLeastOnce);
        index.subscribe(1, &filter("s/+"), QoS::ExactlyOnce);

        index.migrate_to_offline(
            1,
            "c1",
            vec![
                (filter("a/b"), QoS::AtLeastOnce),
                (filter("s/+"), QoS::ExactlyOnce),
            ],
        );

        let (online, mut offline) = index.begin_publish("a/b");
        index.end_publish();
        assert!(online.is_empty());
        offline.sort();
        assert_eq!(offline, vec![("c1".to_owned(), QoS::AtLeastOnce)]);

        let mut migrated = index.migrate_to_online("c1", 7);
        migrated.sort_by_key(|(filter, _)| filter.to_string());
        assert_eq!(
            migrated,
            vec![
                (filter("a/b"), QoS::AtLeastOnce),
                (filter("s/+"), QoS::ExactlyOnce),
            ]
        );

        let (online, offline) = index.begin_publish("s/x");
        index.end_publish();
        assert_eq!(online, vec![(7, QoS::ExactlyOnce)]);
        assert!(offline.is_empty());
        assert_eq!(index.offline_len(), 0);
    }

    #[test]
    fn test_same_subscriber_multiple_filters() {
        let index = SubscriptionIndex::default();

        index.subscribe(1, &filter("a/b"), QoS::AtMostOnce);
        index.subscribe(1, &filter("a/#"), QoS::AtMostOnce);

        let (online, _) = index.begin_publish("a/b");
        index.end_publish();

        // one copy per matching subscription entry
        assert_eq!(online.len(), 2);
    }
}
