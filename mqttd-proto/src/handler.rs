use std::sync::Arc;

use log::{debug, trace, warn};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use mqttd_core::{
    read_packet, Connect, ConnectAck, ConnectReturnCode, Packet, Protocol, PublishAck,
    PublishComplete, PublishReceived, Subscribe, SubscribeAck, SubscribeReturnCode, Type,
    Unsubscribe, UnsubscribeAck,
};

use crate::conn::{Conn, Role, Will};
use crate::context::{BindOutcome, Context};
use crate::errors::{Error, Result};
use crate::inflight::Ack;
use crate::message::Message;
use crate::router::{self, PublishDecision};
use crate::storage::StorageFlags;
use crate::topic::Filter;

/// The CONNECT request as seen by the on-connect hook, after client-id
/// synthesis and before any CONNACK went out.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub protocol: Protocol,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    /// The client sent an empty id and this one was synthesized.
    pub generated_id: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    /// SNI/Host hint the transport captured, if any.
    pub server_name: Option<String>,
}

/// Verdict of the on-connect hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    /// Finish the handshake with CONNACK 0.
    Accept,
    /// Finish the handshake with the given refusal code and drop the peer.
    Refuse(ConnectReturnCode),
    /// Another code path (typically asynchronous auth) will finish the
    /// handshake later through [`complete_connect`].
    Defer,
}

/// Dispatches one parsed control packet to its handler.
///
/// Called from a worker's read task; an `Err` here means the connection
/// must be shut down. Everything recoverable is absorbed and logged
/// inside the individual handlers, so errors on one connection never
/// reach another.
pub(crate) fn process_packet(ctx: &Arc<Context>, conn: &Arc<Conn>, packet: Packet) -> Result<()> {
    trace!("conn-id={} handling {:?}", conn.id(), packet.packet_type());

    match packet {
        Packet::Connect(connect) => on_connect(ctx, conn, connect),
        Packet::ConnectAck(ack) => on_connect_ack(conn, ack),
        Packet::Publish(publish) => on_publish(ctx, conn, &publish),
        Packet::PublishAck(PublishAck { packet_id }) => {
            conn.handle_ack(ctx, Ack::new(Type::PUBACK, packet_id));
            Ok(())
        }
        Packet::PublishReceived(PublishReceived { packet_id }) => {
            conn.handle_ack(ctx, Ack::new(Type::PUBREC, packet_id));
            Ok(())
        }
        Packet::PublishRelease(release) => on_publish_release(ctx, conn, release.packet_id),
        Packet::PublishComplete(PublishComplete { packet_id }) => {
            conn.handle_ack(ctx, Ack::new(Type::PUBCOMP, packet_id));
            Ok(())
        }
        Packet::Subscribe(subscribe) => on_subscribe(ctx, conn, subscribe),
        Packet::SubscribeAck(ack) => on_subscribe_ack(ctx, conn, ack),
        Packet::Unsubscribe(unsubscribe) => on_unsubscribe(ctx, conn, unsubscribe),
        Packet::UnsubscribeAck(UnsubscribeAck { packet_id }) => {
            conn.handle_ack(ctx, Ack::new(Type::UNSUBACK, packet_id));
            Ok(())
        }
        Packet::Ping => on_ping(ctx, conn),
        Packet::Pong => {
            conn.note_pong();
            Ok(())
        }
        Packet::Disconnect => on_disconnect(conn),
    }
}

// ---- CONNECT ----------------------------------------------------------

fn on_connect(ctx: &Arc<Context>, conn: &Arc<Conn>, connect: Connect) -> Result<()> {
    if conn.role() != Role::Listener {
        return Err(Error::Protocol("unexpected CONNECT".to_owned()));
    }
    // A second CONNECT on a connection is a protocol violation [MQTT-3.1.0-2].
    if conn.mark_connect_received() {
        return Err(Error::Protocol("second CONNECT on connection".to_owned()));
    }

    let mut client_id = connect.client_id.to_owned();
    let mut generated_id = false;

    if client_id.is_empty() {
        // A zero-byte client id requires a clean session [MQTT-3.1.3-7].
        if !connect.clean_session {
            refuse(ctx, conn, ConnectReturnCode::IdentifierRejected);
            return Ok(());
        }
        client_id = synthesize_client_id();
        generated_id = true;
        debug!("conn-id={} assigned client id `{}`", conn.id(), client_id);
    }

    if ctx.limits().restrict_ids && !restricted_id_ok(&client_id) {
        refuse(ctx, conn, ConnectReturnCode::IdentifierRejected);
        return Ok(());
    }

    let request = ConnectRequest {
        protocol: connect.protocol,
        clean_session: connect.clean_session,
        keep_alive: connect.keep_alive,
        client_id,
        generated_id,
        username: connect.username.map(str::to_owned),
        password: connect.password.map(<[u8]>::to_owned),
        will: connect.last_will.as_ref().map(|will| Will {
            topic: will.topic_name.to_owned(),
            message: will.message.to_owned(),
            qos: will.qos,
            retain: will.retain,
        }),
        server_name: conn.server_name(),
    };

    if let Some(ref will) = request.will {
        if !crate::topic::valid_topic_name(&will.topic) {
            return Err(Error::Protocol(format!("invalid will topic `{}`", will.topic)));
        }
    }

    conn.begin_session(&request);

    match ctx.connect_decision(conn, &request) {
        ConnAction::Accept => complete_connect(conn, ConnectReturnCode::ConnectionAccepted),
        ConnAction::Refuse(code) => {
            refuse(ctx, conn, code);
            Ok(())
        }
        ConnAction::Defer => Ok(()),
    }
}

/// Finishes a CONNECT handshake.
///
/// Public so deferred (asynchronous) authentication can complete the
/// reply once its verdict is in. The connection may have been re-parented
/// onto another context by the on-connect hook; the current one is used.
pub fn complete_connect(conn: &Arc<Conn>, code: ConnectReturnCode) -> Result<()> {
    let ctx = conn.context().ok_or(Error::Closed)?;

    if code != ConnectReturnCode::ConnectionAccepted {
        refuse(&ctx, conn, code);
        return Ok(());
    }

    let (client_id, persistent) = conn.session();

    match ctx.bind_client_id(&client_id, conn.id()) {
        BindOutcome::Bound => {}
        BindOutcome::InUse(existing) => {
            if ctx.limits().drop_conn_same_client_id {
                debug!("evicting conn-id={} for client id `{}`", existing.id(), client_id);
                existing.shutdown();
                if let BindOutcome::InUse(_) = ctx.bind_client_id(&client_id, conn.id()) {
                    refuse(&ctx, conn, ConnectReturnCode::ServiceUnavailable);
                    return Ok(());
                }
            } else {
                refuse(&ctx, conn, ConnectReturnCode::IdentifierRejected);
                return Ok(());
            }
        }
    }

    let mut session_present = false;

    if persistent {
        if let Some(storage) = ctx.storage() {
            storage.init(&client_id, StorageFlags::ALL)?;
            session_present = storage.has_session(&client_id);

            for (filter, qos) in storage.session_recover(&client_id)? {
                if let Ok(filter) = filter.parse::<Filter>() {
                    ctx.subscriptions().subscribe(conn.id(), &filter, qos);
                    conn.subs.lock().insert(&filter, qos);
                }
            }
        }

        for (filter, qos) in ctx.subscriptions().migrate_to_online(&client_id, conn.id()) {
            conn.subs.lock().insert(&filter, qos);
            session_present = true;
        }
    } else {
        // a clean session discards whatever the previous incarnation left
        ctx.subscriptions().remove_offline(&client_id);
        if let Some(storage) = ctx.storage() {
            storage.clear(&client_id, StorageFlags::ALL)?;
        }
    }

    conn.set_connected(ConnectReturnCode::ConnectionAccepted);
    conn.touch();

    let ack = Packet::ConnectAck(ConnectAck {
        session_present,
        return_code: ConnectReturnCode::ConnectionAccepted,
    });
    if !conn.send_packet(&ctx, &ack) {
        return Err(Error::Closed);
    }

    // replay whatever queued up while the client was away, in stored order
    if persistent {
        if let Some(storage) = ctx.storage() {
            for (handle, bytes) in storage.queued_drain(&client_id)? {
                match read_packet(&bytes) {
                    Ok(Some((Packet::Publish(publish), _))) => {
                        let msg = Message::from(&publish);
                        conn.deliver_queued(&ctx, &msg, handle);
                    }
                    _ => {
                        warn!("dropping undecodable queued message for `{}`", client_id);
                        let _ = storage.release_msg(&client_id, &handle);
                    }
                }
            }
        }
    }

    debug!(
        "conn-id={} connected as `{}` (session_present: {})",
        conn.id(),
        client_id,
        session_present
    );

    Ok(())
}

fn refuse(ctx: &Arc<Context>, conn: &Arc<Conn>, code: ConnectReturnCode) {
    debug!("conn-id={} refused: {}", conn.id(), code);

    conn.set_connected(code);

    let ack = Packet::ConnectAck(ConnectAck {
        session_present: false,
        return_code: code,
    });

    // tear down only after the refusal actually left the socket
    let closer = Arc::clone(conn);
    conn.send_packet_with(ctx, &ack, Some(Box::new(move |_| closer.shutdown())));
}

fn on_connect_ack(conn: &Arc<Conn>, ack: ConnectAck) -> Result<()> {
    // the greetings exchange normally consumes CONNACK before the socket
    // joins the reader loop; anything arriving here is bookkeeping
    conn.note_connack(&ack);
    Ok(())
}

// ---- PUBLISH flows ----------------------------------------------------

fn on_publish(ctx: &Arc<Context>, conn: &Arc<Conn>, publish: &mqttd_core::Publish) -> Result<()> {
    if conn.role() == Role::Listener && !conn.is_connected() {
        return Err(Error::Protocol("PUBLISH before CONNECT".to_owned()));
    }

    let msg = Arc::new(Message::from(publish));

    // oversized messages vanish without dropping the connection; the
    // packet-id flow still completes so the sender's session stays usable
    let limit = ctx.limits().message_size_limit;
    let oversized = limit > 0 && msg.size() > limit;
    if oversized {
        debug!(
            "conn-id={} dropped oversized publish on `{}` ({} > {})",
            conn.id(),
            msg.topic,
            msg.size(),
            limit
        );
    }

    match publish.qos {
        mqttd_core::QoS::AtMostOnce => {
            if !oversized {
                inbound(ctx, conn, &msg)?;
            }
            Ok(())
        }
        mqttd_core::QoS::AtLeastOnce => {
            let packet_id = publish
                .packet_id
                .ok_or_else(|| Error::Protocol("QoS 1 PUBLISH without packet id".to_owned()))?;

            if !oversized {
                inbound(ctx, conn, &msg)?;
            }

            conn.send_packet(ctx, &Packet::PublishAck(PublishAck { packet_id }));
            Ok(())
        }
        mqttd_core::QoS::ExactlyOnce => {
            let packet_id = publish
                .packet_id
                .ok_or_else(|| Error::Protocol("QoS 2 PUBLISH without packet id".to_owned()))?;

            // an id already open in the peer table marks a retransmit;
            // the message must not reach subscribers twice
            if conn.peer_waits.open(packet_id) {
                if !oversized {
                    inbound(ctx, conn, &msg)?;
                }
            } else {
                debug!(
                    "conn-id={} retransmitted QoS 2 publish id {} suppressed",
                    conn.id(),
                    packet_id
                );
            }

            conn.send_packet(ctx, &Packet::PublishReceived(PublishReceived { packet_id }));
            Ok(())
        }
    }
}

fn inbound(ctx: &Arc<Context>, conn: &Arc<Conn>, msg: &Arc<Message>) -> Result<()> {
    if conn.role() != Role::Listener {
        conn.on_message_arrived(ctx, msg);
        return Ok(());
    }

    if let Some(auth) = ctx.auth() {
        let (client_id, _) = conn.session();
        if !auth.authorize_publish(ctx.name(), &client_id, &msg.topic) {
            debug!(
                "client `{}` not authorized to publish on `{}`",
                client_id, msg.topic
            );
            return Ok(());
        }
    }

    match router::dispatch(ctx, Some(conn), msg) {
        PublishDecision::CloseConnection => {
            Err(Error::NotAuthorized(format!("publish on `{}` rejected", msg.topic)))
        }
        _ => Ok(()),
    }
}

fn on_publish_release(ctx: &Arc<Context>, conn: &Arc<Conn>, packet_id: u16) -> Result<()> {
    // PUBREL is the one ack routed through the peer-ids table
    if !conn.peer_waits.close(packet_id) {
        debug!("conn-id={} stray PUBREL for packet id {}", conn.id(), packet_id);
    }
    conn.send_packet(ctx, &Packet::PublishComplete(PublishComplete { packet_id }));
    Ok(())
}

// ---- SUBSCRIBE / UNSUBSCRIBE ------------------------------------------

fn on_subscribe(ctx: &Arc<Context>, conn: &Arc<Conn>, subscribe: Subscribe) -> Result<()> {
    if conn.role() != Role::Listener {
        return Err(Error::Protocol("unexpected SUBSCRIBE".to_owned()));
    }
    if !conn.is_connected() {
        return Err(Error::Protocol("SUBSCRIBE before CONNECT".to_owned()));
    }

    let (client_id, persistent) = conn.session();
    let mut status = Vec::with_capacity(subscribe.subscriptions.len());
    let mut accepted: Vec<(Filter, mqttd_core::QoS)> = Vec::new();

    for (filter_name, requested) in &subscribe.subscriptions {
        let code = grant(ctx, conn, &client_id, filter_name, *requested);
        if let SubscribeReturnCode::Success(qos) = code {
            if let Ok(filter) = filter_name.parse::<Filter>() {
                accepted.push((filter, qos));
            }
        }
        status.push(code);
    }

    for (filter, qos) in &accepted {
        if persistent {
            if let Some(storage) = ctx.storage() {
                if let Err(err) = storage.sub(&client_id, &filter.to_string(), *qos) {
                    warn!("failed to persist subscription for `{}`: {}", client_id, err);
                }
            }
        }
        ctx.subscriptions().subscribe(conn.id(), filter, *qos);
        conn.subs.lock().insert(filter, *qos);
    }

    let ack = Packet::SubscribeAck(SubscribeAck {
        packet_id: subscribe.packet_id,
        status,
    });
    if !conn.send_packet(ctx, &ack) {
        return Err(Error::Closed);
    }

    // retained messages for freshly granted filters, delivered at
    // min(retained qos, granted qos) with the retain flag kept
    for (filter, granted) in accepted {
        for (topic, qos, payload) in ctx.retained_matching(&filter) {
            let msg = Message {
                qos,
                dup: false,
                retain: true,
                topic,
                packet_id: None,
                payload: payload.into(),
            };
            conn.deliver(ctx, &msg, granted, true);
        }
    }

    Ok(())
}

fn grant(
    ctx: &Arc<Context>,
    conn: &Arc<Conn>,
    client_id: &str,
    filter_name: &str,
    requested: mqttd_core::QoS,
) -> SubscribeReturnCode {
    let filter: Filter = match filter_name.parse() {
        Ok(filter) => filter,
        Err(_) => {
            debug!("client `{}` sent invalid filter `{}`", client_id, filter_name);
            return SubscribeReturnCode::Failure;
        }
    };

    if filter.is_wildcard() && !ctx.limits().wildcard_subscriptions {
        debug!("wildcard subscription `{}` denied for `{}`", filter_name, client_id);
        return SubscribeReturnCode::Failure;
    }

    if let Some(auth) = ctx.auth() {
        if !auth.authorize_subscribe(ctx.name(), client_id, filter_name) {
            return SubscribeReturnCode::Failure;
        }
    }

    match ctx.subscribe_decision(conn, filter_name, requested) {
        Some(qos) => SubscribeReturnCode::Success(qos),
        None => SubscribeReturnCode::Failure,
    }
}

fn on_subscribe_ack(ctx: &Arc<Context>, conn: &Arc<Conn>, ack: SubscribeAck) -> Result<()> {
    let mut routed = Ack::new(Type::SUBACK, ack.packet_id);
    routed.granted = ack.status;
    conn.handle_ack(ctx, routed);
    Ok(())
}

fn on_unsubscribe(ctx: &Arc<Context>, conn: &Arc<Conn>, unsubscribe: Unsubscribe) -> Result<()> {
    if conn.role() != Role::Listener {
        return Err(Error::Protocol("unexpected UNSUBSCRIBE".to_owned()));
    }
    if !conn.is_connected() {
        return Err(Error::Protocol("UNSUBSCRIBE before CONNECT".to_owned()));
    }

    let (client_id, persistent) = conn.session();

    for filter_name in &unsubscribe.topic_filters {
        if let Ok(filter) = filter_name.parse::<Filter>() {
            if persistent {
                if let Some(storage) = ctx.storage() {
                    if let Err(err) = storage.unsub(&client_id, filter_name) {
                        warn!("failed to remove persisted subscription: {}", err);
                    }
                }
            }
            ctx.subscriptions().unsubscribe(conn.id(), &filter);
            conn.subs.lock().remove(&filter);
        }
    }

    let ack = Packet::UnsubscribeAck(UnsubscribeAck {
        packet_id: unsubscribe.packet_id,
    });
    conn.send_packet(ctx, &ack);

    Ok(())
}

// ---- the rest ---------------------------------------------------------

fn on_ping(ctx: &Arc<Context>, conn: &Arc<Conn>) -> Result<()> {
    if conn.role() == Role::Listener && !conn.is_connected() {
        return Err(Error::Protocol("PINGREQ before CONNECT".to_owned()));
    }
    conn.send_packet(ctx, &Packet::Pong);
    Ok(())
}

fn on_disconnect(conn: &Arc<Conn>) -> Result<()> {
    if conn.role() != Role::Listener {
        return Err(Error::Protocol("unexpected DISCONNECT".to_owned()));
    }

    debug!("conn-id={} disconnecting cleanly", conn.id());

    // an orderly disconnect withholds the will [MQTT-3.14.4-3]
    conn.suppress_will();
    conn.shutdown_with(false);

    Ok(())
}

/// Broker-assigned id for clients connecting with an empty one.
fn synthesize_client_id() -> String {
    let suffix: String = thread_rng().sample_iter(&Alphanumeric).take(16).collect();
    format!("mqttd-{}", suffix)
}

/// The 3.1.1 restricted charset rule, applied when a domain opts in.
///
/// The Server MUST allow ClientIds which are between 1 and 23 UTF-8
/// encoded bytes in length, and that contain only the characters
/// "0-9a-zA-Z" [MQTT-3.1.3-5]; longer or richer ids are an
/// implementation liberty this flag turns off.
pub fn restricted_id_ok(client_id: &str) -> bool {
    !client_id.is_empty()
        && client_id.len() <= 23
        && client_id.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_ids() {
        assert!(restricted_id_ok("abc123"));
        assert!(restricted_id_ok("A"));
        assert!(!restricted_id_ok(""));
        assert!(!restricted_id_ok("has-dash"));
        assert!(!restricted_id_ok("waytoolongforanidentifier"));
    }

    #[test]
    fn test_synthesized_ids_are_unique_enough() {
        let a = synthesize_client_id();
        let b = synthesize_client_id();
        assert_ne!(a, b);
        assert!(a.starts_with("mqttd-"));
    }
}
