//! End-to-end broker/client scenarios over localhost TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mqttd_broker::{Broker, DomainDef, DomainSettings, MemoryAuth};
use mqttd_client::{Client, ClientOptions, QoS, SubscribeReturnCode};

const RECV_WINDOW: Duration = Duration::from_secs(5);

fn open_broker() -> (Arc<Broker>, SocketAddr) {
    broker_with(DomainDef::new("default"))
}

fn broker_with(def: DomainDef) -> (Arc<Broker>, SocketAddr) {
    let name = def.name.clone();
    let broker = Broker::builder().domain(def).anonymous(name).start().unwrap();
    let addr = broker.listen("127.0.0.1:0").unwrap();
    (broker, addr)
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + RECV_WINDOW;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn simple_round_trip() {
    let (broker, addr) = open_broker();

    let client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::new("t")).unwrap();

    assert_eq!(
        client.subscribe("myqtt/test", QoS::AtMostOnce).unwrap(),
        SubscribeReturnCode::Success(QoS::AtMostOnce)
    );

    client
        .publish("myqtt/test", b"payload", QoS::AtMostOnce, false)
        .unwrap();

    let msg = client.recv(RECV_WINDOW).unwrap().expect("one publish back");
    assert_eq!(msg.topic, "myqtt/test");
    assert_eq!(&msg.payload[..], b"payload");
    assert_eq!(msg.qos, QoS::AtMostOnce);

    client.disconnect().unwrap();
    broker.shutdown();
}

#[test]
fn retained_delivery_downgraded() {
    let (broker, addr) = open_broker();
    let host = addr.ip().to_string();

    let publisher = Client::connect(&host, addr.port(), ClientOptions::new("pub")).unwrap();
    publisher
        .publish("sensors/room/temp", b"22.5", QoS::AtLeastOnce, true)
        .unwrap();
    publisher.disconnect().unwrap();

    let subscriber = Client::connect(&host, addr.port(), ClientOptions::new("sub")).unwrap();
    assert_eq!(
        subscriber.subscribe("sensors/room/+", QoS::AtMostOnce).unwrap(),
        SubscribeReturnCode::Success(QoS::AtMostOnce)
    );

    let msg = subscriber.recv(RECV_WINDOW).unwrap().expect("retained message");
    assert_eq!(msg.topic, "sensors/room/temp");
    assert_eq!(&msg.payload[..], b"22.5");
    assert_eq!(msg.qos, QoS::AtMostOnce, "downgraded to the granted qos");
    assert!(msg.retain);

    subscriber.disconnect().unwrap();
    broker.shutdown();
}

#[test]
fn qos2_exchange_delivers_exactly_once() {
    let (broker, addr) = open_broker();

    let client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::new("q2")).unwrap();

    assert_eq!(
        client.subscribe("t", QoS::ExactlyOnce).unwrap(),
        SubscribeReturnCode::Success(QoS::ExactlyOnce)
    );

    // publish() blocks through the full PUBREC/PUBREL/PUBCOMP handshake
    client.publish("t", b"x", QoS::ExactlyOnce, false).unwrap();

    let msg = client.recv(RECV_WINDOW).unwrap().expect("exactly one copy");
    assert_eq!(msg.topic, "t");
    assert_eq!(&msg.payload[..], b"x");
    assert_eq!(msg.qos, QoS::ExactlyOnce);

    // no duplicate afterwards
    assert!(client.recv(Duration::from_millis(300)).unwrap().is_none());

    client.disconnect().unwrap();
    broker.shutdown();
}

#[test]
fn offline_session_queues_in_publish_order() {
    let storage = tempfile::tempdir().unwrap();
    let name = "default";
    let broker = Broker::builder()
        .domain(DomainDef::new(name))
        .anonymous(name)
        .storage_root(storage.path())
        .start()
        .unwrap();
    let addr = broker.listen("127.0.0.1:0").unwrap();
    let host = addr.ip().to_string();

    let c1 = Client::connect(
        &host,
        addr.port(),
        ClientOptions::new("c1").clean_session(false),
    )
    .unwrap();
    assert_eq!(
        c1.subscribe("a/b", QoS::AtLeastOnce).unwrap(),
        SubscribeReturnCode::Success(QoS::AtLeastOnce)
    );
    c1.disconnect().unwrap();

    let publisher = Client::connect(&host, addr.port(), ClientOptions::new("pub")).unwrap();
    for i in 0..3 {
        publisher
            .publish("a/b", format!("hello-{}", i).as_bytes(), QoS::AtLeastOnce, false)
            .unwrap();
    }
    publisher.disconnect().unwrap();

    let c1 = Client::connect(
        &host,
        addr.port(),
        ClientOptions::new("c1").clean_session(false),
    )
    .unwrap();

    for i in 0..3 {
        let msg = c1.recv(RECV_WINDOW).unwrap().expect("queued message");
        assert_eq!(msg.topic, "a/b");
        assert_eq!(msg.payload, format!("hello-{}", i).as_bytes());
    }

    c1.disconnect().unwrap();
    broker.shutdown();
}

#[test]
fn wildcard_subscribe_denied_by_domain() {
    let mut settings = DomainSettings::default();
    settings.wildcard_subscriptions = false;
    let (broker, addr) = broker_with(DomainDef::new("nowild").settings(settings));

    let client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::new("w")).unwrap();

    assert_eq!(
        client.subscribe("a/#", QoS::AtMostOnce).unwrap(),
        SubscribeReturnCode::Failure,
        "SUBACK carries 0x80 for the denied filter"
    );

    // exact subscriptions keep working
    assert_eq!(
        client.subscribe("a/b", QoS::AtMostOnce).unwrap(),
        SubscribeReturnCode::Success(QoS::AtMostOnce)
    );

    client.disconnect().unwrap();
    broker.shutdown();
}

#[test]
fn duplicate_client_id_evicts_when_configured() {
    let mut settings = DomainSettings::default();
    settings.drop_conn_same_client_id = true;
    let (broker, addr) = broker_with(DomainDef::new("evict").settings(settings));
    let host = addr.ip().to_string();

    let first = Client::connect(&host, addr.port(), ClientOptions::new("c1")).unwrap();
    assert!(first.is_ok());

    // the second CONNECT with the same id wins
    let second = Client::connect(&host, addr.port(), ClientOptions::new("c1")).unwrap();
    assert!(second.is_ok());

    wait_until("the first connection to observe its eviction", || !first.is_ok());

    second.disconnect().unwrap();
    broker.shutdown();
}

#[test]
fn duplicate_client_id_rejected_by_default() {
    let (broker, addr) = open_broker();
    let host = addr.ip().to_string();

    let first = Client::connect(&host, addr.port(), ClientOptions::new("c1")).unwrap();

    let err = Client::connect(&host, addr.port(), ClientOptions::new("c1"))
        .err()
        .expect("second connect refused");
    assert!(
        matches!(err, mqttd_client::Error::ConnectRefused(_)),
        "got {:?}",
        err
    );
    assert!(first.is_ok(), "the original connection survives");

    first.disconnect().unwrap();
    broker.shutdown();
}

#[test]
fn oversized_publish_silently_dropped() {
    let mut settings = DomainSettings::default();
    settings.message_size_limit = 32;
    let (broker, addr) = broker_with(DomainDef::new("small").settings(settings));

    let client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::new("s")).unwrap();
    client.subscribe("big", QoS::AtMostOnce).unwrap();

    // over the limit: acknowledged but never routed
    client
        .publish("big", &[0u8; 128], QoS::AtLeastOnce, false)
        .unwrap();
    assert!(client.recv(Duration::from_millis(300)).unwrap().is_none());

    // the connection survives and small messages still flow
    client.publish("big", b"ok", QoS::AtMostOnce, false).unwrap();
    let msg = client.recv(RECV_WINDOW).unwrap().expect("small message");
    assert_eq!(&msg.payload[..], b"ok");

    client.disconnect().unwrap();
    broker.shutdown();
}

#[test]
fn domain_selection_by_username_suffix_and_isolation() {
    let tenant_auth = Arc::new(MemoryAuth::new());
    tenant_auth.add_user("alice@tenant.example", &b"secret"[..]);

    let broker = Broker::builder()
        .domain(DomainDef::new("tenant.example").auth(tenant_auth))
        .domain(DomainDef::new("open"))
        .anonymous("open")
        .start()
        .unwrap();
    let addr = broker.listen("127.0.0.1:0").unwrap();
    let host = addr.ip().to_string();

    let tenant = Client::connect(
        &host,
        addr.port(),
        ClientOptions::new("alice").credentials("alice@tenant.example", &b"secret"[..]),
    )
    .unwrap();

    let open = Client::connect(&host, addr.port(), ClientOptions::new("bob")).unwrap();

    assert_eq!(broker.find_domain("tenant.example").unwrap().connections(), 1);
    assert_eq!(broker.find_domain("open").unwrap().connections(), 1);

    // a tenant's messages never cross into another domain
    open.subscribe("news", QoS::AtMostOnce).unwrap();
    tenant.subscribe("news", QoS::AtMostOnce).unwrap();
    tenant.publish("news", b"tenant-only", QoS::AtMostOnce, false).unwrap();

    let msg = tenant.recv(RECV_WINDOW).unwrap().expect("tenant copy");
    assert_eq!(&msg.payload[..], b"tenant-only");
    assert!(open.recv(Duration::from_millis(300)).unwrap().is_none());

    tenant.disconnect().unwrap();
    open.disconnect().unwrap();
    broker.shutdown();
}

#[test]
fn bad_credentials_refused() {
    let auth = Arc::new(MemoryAuth::new());
    auth.add_user("user", &b"right"[..]);

    let (broker, addr) = broker_with(DomainDef::new("secure").auth(auth));

    let err = Client::connect(
        &addr.ip().to_string(),
        addr.port(),
        ClientOptions::new("c").credentials("user", &b"wrong"[..]),
    )
    .err()
    .expect("refused");
    assert!(matches!(err, mqttd_client::Error::ConnectRefused(_)));

    broker.shutdown();
}

#[test]
fn empty_client_id_requires_clean_session() {
    let (broker, addr) = open_broker();
    let host = addr.ip().to_string();

    let err = Client::connect(
        &host,
        addr.port(),
        ClientOptions::new("").clean_session(false),
    )
    .err()
    .expect("refused");
    assert!(matches!(err, mqttd_client::Error::ConnectRefused(_)));

    // with a clean session the broker synthesizes an id instead
    let anonymous = Client::connect(&host, addr.port(), ClientOptions::new("")).unwrap();
    assert!(anonymous.is_ok());
    anonymous.disconnect().unwrap();

    broker.shutdown();
}

#[test]
fn ping_and_unsubscribe() {
    let (broker, addr) = open_broker();

    let client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::new("p")).unwrap();

    client.ping().unwrap();

    client.subscribe("x/y", QoS::AtMostOnce).unwrap();
    client.unsubscribe("x/y").unwrap();

    client.publish("x/y", b"gone", QoS::AtMostOnce, false).unwrap();
    assert!(
        client.recv(Duration::from_millis(300)).unwrap().is_none(),
        "no delivery after unsubscribe"
    );

    client.disconnect().unwrap();
    broker.shutdown();
}
