use bytes::Bytes;

use mqttd_core::{PacketId, Publish, QoS};

/// An immutable application message.
///
/// Produced by the codec, consumed by handlers and the router; wrapped in
/// an `Arc` whenever it crosses a thread boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The level of assurance for delivery.
    pub qos: QoS,
    /// Whether this might be a re-delivery of an earlier attempt.
    pub dup: bool,
    /// Whether the server is asked to retain the message for future subscribers.
    pub retain: bool,
    /// The topic the message was published to.
    pub topic: String,
    /// The identifier the sender allocated, for QoS > 0.
    pub packet_id: Option<PacketId>,
    /// The application payload.
    pub payload: Bytes,
}

impl Message {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P, qos: QoS, retain: bool) -> Self {
        Message {
            qos,
            dup: false,
            retain,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    /// The wire size of the PUBLISH body carrying this message.
    pub fn size(&self) -> usize {
        2 + self.topic.len()
            + if self.qos > QoS::AtMostOnce { 2 } else { 0 }
            + self.payload.len()
    }

    /// Re-frames the message for delivery to one subscriber.
    ///
    /// QoS, retain flag and packet id are per-delivery attributes, not
    /// properties of the message itself.
    pub fn to_publish(&self, qos: QoS, retain: bool, packet_id: Option<PacketId>, dup: bool) -> Publish {
        Publish {
            dup,
            qos,
            retain,
            topic_name: &self.topic,
            packet_id,
            payload: &self.payload,
        }
    }
}

impl From<&Publish<'_>> for Message {
    fn from(publish: &Publish) -> Self {
        Message {
            qos: publish.qos,
            dup: publish.dup,
            retain: publish.retain,
            topic: publish.topic_name.to_owned(),
            packet_id: publish.packet_id,
            payload: Bytes::copy_from_slice(publish.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_publish() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic_name: "sensors/room/temp",
            packet_id: Some(7),
            payload: b"22.5",
        };

        let message = Message::from(&publish);

        assert_eq!(message.topic, "sensors/room/temp");
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert!(message.retain);
        assert_eq!(&message.payload[..], b"22.5");
        assert_eq!(message.size(), 2 + 17 + 2 + 4);
    }

    #[test]
    fn test_per_delivery_reframe() {
        let message = Message::new("a/b", &b"x"[..], QoS::ExactlyOnce, false);
        let publish = message.to_publish(QoS::AtMostOnce, false, None, false);

        assert_eq!(publish.qos, QoS::AtMostOnce);
        assert_eq!(publish.packet_id, None);
        assert_eq!(publish.topic_name, "a/b");
    }
}
