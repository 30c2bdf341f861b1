use core::convert::TryFrom;
use core::str;

use nom::{
    combinator::{map, map_res},
    multi::{length_data, many1},
    number::complete::{be_u16, be_u8},
    sequence::tuple,
    IResult,
};
use thiserror::Error;

use crate::packet::*;

/// Why a buffer could not be decoded into a control packet.
///
/// Incomplete input is not an error; [`read_packet`] reports it as `Ok(None)`
/// so a caller can resume once more bytes arrive.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    /// The packet body violates the grammar of its control type.
    ///
    /// Covers string fields that are not well-formed UTF-8 or contain U+0000.
    #[error("malformed {0} packet")]
    Malformed(&'static str),
    /// The first fixed-header nibble is 0 or 15.
    #[error("reserved control packet type {0}")]
    ReservedType(u8),
    /// The Remaining Length field used more than four bytes.
    #[error("remaining length exceeds protocol maximum")]
    OversizedPacket,
    /// CONNECT carried a protocol name/level pair this implementation does not speak.
    ///
    /// Surfaced separately so a server can reply with CONNACK return code 1
    /// instead of dropping the connection outright.
    #[error("unsupported protocol {name:?} level {level}")]
    UnsupportedProtocol {
        /// The Protocol Name string from the wire.
        name: String,
        /// The Protocol Level byte from the wire.
        level: u8,
    },
}

type Input<'a> = &'a [u8];
type NomError<'a> = (Input<'a>, nom::error::ErrorKind);
type Parsed<'a, T> = IResult<Input<'a>, T, NomError<'a>>;

const CONTINUATION_BIT: u8 = 0x80;

/// Decodes a Remaining Length field.
///
/// Returns `Ok(None)` when the continuation chain runs past the available
/// bytes, and the decoded value plus the number of bytes it occupied
/// otherwise. A fifth continuation byte is a protocol violation.
pub fn decode_variable_length(input: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let mut value = 0usize;
    for (i, b) in input.iter().enumerate() {
        if i == 4 {
            return Err(DecodeError::OversizedPacket);
        }
        value += usize::from(b & !CONTINUATION_BIT) << (7 * i);
        if b & CONTINUATION_BIT == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if input.len() >= 4 {
        return Err(DecodeError::OversizedPacket);
    }
    Ok(None)
}

/// Reads the next control packet from `input`.
///
/// Returns `Ok(None)` when the buffer holds only part of a packet; the
/// caller keeps the bytes and retries after the next read. On success the
/// second tuple element is the total number of bytes consumed, fixed
/// header included.
pub fn read_packet(input: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
    if input.len() < 2 {
        return Ok(None);
    }

    let type_value = (input[0] >> 4) & 0x0F;
    let packet_type = Type::try_from(type_value).map_err(|_| DecodeError::ReservedType(type_value))?;
    let packet_flags = input[0] & 0x0F;

    let (remaining_length, length_bytes) = match decode_variable_length(&input[1..])? {
        Some(decoded) => decoded,
        None => return Ok(None),
    };

    let body_start = 1 + length_bytes;
    let total = body_start + remaining_length;
    if input.len() < total {
        return Ok(None);
    }

    let body = &input[body_start..total];
    let packet = parse_body(packet_type, packet_flags, body)?;
    Ok(Some((packet, total)))
}

fn parse_body(packet_type: Type, packet_flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    match packet_type {
        Type::CONNECT => parse_connect(body),
        Type::CONNACK => exact(body, "CONNACK", connect_ack).map(Packet::ConnectAck),
        Type::PUBLISH => parse_publish(packet_flags, body),
        Type::PUBACK => {
            exact(body, "PUBACK", packet_id).map(|packet_id| Packet::PublishAck(PublishAck { packet_id }))
        }
        Type::PUBREC => exact(body, "PUBREC", packet_id)
            .map(|packet_id| Packet::PublishReceived(PublishReceived { packet_id })),
        Type::PUBREL => {
            // The fixed-header flags of PUBREL are reserved as 0b0010 [MQTT-3.6.1-1].
            if packet_flags != 0x02 {
                return Err(DecodeError::Malformed("PUBREL"));
            }
            exact(body, "PUBREL", packet_id)
                .map(|packet_id| Packet::PublishRelease(PublishRelease { packet_id }))
        }
        Type::PUBCOMP => exact(body, "PUBCOMP", packet_id)
            .map(|packet_id| Packet::PublishComplete(PublishComplete { packet_id })),
        Type::SUBSCRIBE => {
            if packet_flags != 0x02 {
                return Err(DecodeError::Malformed("SUBSCRIBE"));
            }
            exact(body, "SUBSCRIBE", subscribe).map(Packet::Subscribe)
        }
        Type::SUBACK => exact(body, "SUBACK", subscribe_ack).map(Packet::SubscribeAck),
        Type::UNSUBSCRIBE => {
            if packet_flags != 0x02 {
                return Err(DecodeError::Malformed("UNSUBSCRIBE"));
            }
            exact(body, "UNSUBSCRIBE", unsubscribe).map(Packet::Unsubscribe)
        }
        Type::UNSUBACK => exact(body, "UNSUBACK", packet_id)
            .map(|packet_id| Packet::UnsubscribeAck(UnsubscribeAck { packet_id })),
        Type::PINGREQ if body.is_empty() => Ok(Packet::Ping),
        Type::PINGRESP if body.is_empty() => Ok(Packet::Pong),
        Type::DISCONNECT if body.is_empty() => Ok(Packet::Disconnect),
        Type::PINGREQ => Err(DecodeError::Malformed("PINGREQ")),
        Type::PINGRESP => Err(DecodeError::Malformed("PINGRESP")),
        Type::DISCONNECT => Err(DecodeError::Malformed("DISCONNECT")),
    }
}

/// Runs a body parser and requires it to consume every byte.
fn exact<'a, T, F>(body: Input<'a>, what: &'static str, f: F) -> Result<T, DecodeError>
where
    F: Fn(Input<'a>) -> Parsed<'a, T>,
{
    match f(body) {
        Ok((remaining, value)) if remaining.is_empty() => Ok(value),
        _ => Err(DecodeError::Malformed(what)),
    }
}

/// Text fields in the Control Packets described later are encoded as UTF-8 strings.
///
/// A UTF-8 encoded string MUST NOT include an encoding of the null
/// character U+0000 [MQTT-1.5.3-2]; surrogates cannot survive
/// `str::from_utf8` in the first place.
fn utf8_str(input: Input) -> Parsed<&str> {
    map_res(length_data(be_u16), |s: &[u8]| {
        let s = str::from_utf8(s)?;
        if s.contains('\u{0}') {
            return Err(Utf8Rejected);
        }
        Ok(s)
    })(input)
}

#[derive(Debug)]
struct Utf8Rejected;

impl From<str::Utf8Error> for Utf8Rejected {
    fn from(_: str::Utf8Error) -> Self {
        Utf8Rejected
    }
}

fn packet_id(input: Input) -> Parsed<PacketId> {
    be_u16(input)
}

fn parse_connect<'a>(body: &'a [u8]) -> Result<Packet<'a>, DecodeError> {
    // Protocol name and level are peeled off first so an unknown revision can
    // be reported distinctly; the rest of the body is only meaningful once
    // the revision is known.
    let (rest, (name, level)) = tuple((utf8_str, be_u8))(body)
        .map_err(|_: nom::Err<NomError>| DecodeError::Malformed("CONNECT"))?;
    let protocol = Protocol::from_parts(name, level).ok_or_else(|| DecodeError::UnsupportedProtocol {
        name: name.to_owned(),
        level,
    })?;

    let parse = |input: Input<'a>| -> Parsed<'a, Connect<'a>> {
        // Bit 0 of the Connect Flags is reserved and MUST be zero [MQTT-3.1.2-3];
        // it is the only bit `ConnectFlags` leaves undefined.
        let (input, flags) = map_res(be_u8, |b| ConnectFlags::from_bits(b).ok_or(()))(input)?;
        let (input, keep_alive) = be_u16(input)?;
        let (input, client_id) = utf8_str(input)?;
        let (input, last_will) = if flags.contains(ConnectFlags::LAST_WILL) {
            let (input, (topic_name, message)) = tuple((utf8_str, length_data(be_u16)))(input)?;
            (
                input,
                Some(LastWill {
                    qos: flags.qos(),
                    retain: flags.contains(ConnectFlags::WILL_RETAIN),
                    topic_name,
                    message,
                }),
            )
        } else {
            (input, None)
        };
        let (input, username) = if flags.contains(ConnectFlags::USERNAME) {
            map(utf8_str, Some)(input)?
        } else {
            (input, None)
        };
        let (input, password) = if flags.contains(ConnectFlags::PASSWORD) {
            map(length_data(be_u16), Some)(input)?
        } else {
            (input, None)
        };

        Ok((
            input,
            Connect {
                protocol,
                clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
                keep_alive,
                client_id,
                last_will,
                username,
                password,
            },
        ))
    };

    exact(rest, "CONNECT", parse).map(Packet::Connect)
}

fn connect_ack(input: Input) -> Parsed<ConnectAck> {
    map(
        tuple((
            map_res(be_u8, |b| ConnectAckFlags::from_bits(b).ok_or(())),
            map_res(be_u8, ConnectReturnCode::try_from),
        )),
        |(flags, return_code)| ConnectAck {
            session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
            return_code,
        },
    )(input)
}

fn parse_publish<'a>(packet_flags: u8, body: &'a [u8]) -> Result<Packet<'a>, DecodeError> {
    let flags = PublishFlags::from_bits_truncate(packet_flags);
    let qos = match flags.qos() {
        Some(qos) => qos,
        // A PUBLISH Packet MUST NOT have both QoS bits set to 1 [MQTT-3.3.1-4].
        None => return Err(DecodeError::Malformed("PUBLISH")),
    };

    let parse = |input: Input<'a>| -> Parsed<'a, Publish<'a>> {
        let (input, topic_name) = utf8_str(input)?;
        let (payload, packet_id) = if qos > QoS::AtMostOnce {
            map(packet_id, Some)(input)?
        } else {
            (input, None)
        };

        Ok((
            &[][..],
            Publish {
                dup: flags.contains(PublishFlags::DUP),
                qos,
                retain: flags.contains(PublishFlags::RETAIN),
                topic_name,
                packet_id,
                payload,
            },
        ))
    };

    let publish = exact(body, "PUBLISH", parse)?;

    // The Topic Name in the PUBLISH Packet MUST NOT contain wildcard
    // characters [MQTT-3.3.2-2].
    if publish.topic_name.contains(|c| c == '+' || c == '#') {
        return Err(DecodeError::Malformed("PUBLISH"));
    }

    Ok(Packet::Publish(publish))
}

fn subscription(input: Input) -> Parsed<(&str, QoS)> {
    tuple((utf8_str, map_res(be_u8, QoS::try_from)))(input)
}

fn subscribe(input: Input) -> Parsed<Subscribe> {
    map(
        tuple((packet_id, many1(subscription))),
        |(packet_id, subscriptions)| Subscribe {
            packet_id,
            subscriptions,
        },
    )(input)
}

fn subscribe_ack(input: Input) -> Parsed<SubscribeAck> {
    map(
        tuple((
            packet_id,
            many1(map_res(be_u8, |b| {
                if b == SubscribeReturnCode::FAILURE {
                    Ok(SubscribeReturnCode::Failure)
                } else {
                    QoS::try_from(b)
                        .map(SubscribeReturnCode::Success)
                        .map_err(|_| ())
                }
            })),
        )),
        |(packet_id, status)| SubscribeAck { packet_id, status },
    )(input)
}

fn unsubscribe(input: Input) -> Parsed<Unsubscribe> {
    map(
        tuple((packet_id, many1(utf8_str))),
        |(packet_id, topic_filters)| Unsubscribe {
            packet_id,
            topic_filters,
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;

    #[test]
    fn test_variable_length() {
        assert_eq!(decode_variable_length(b"\x00"), Ok(Some((0, 1))));
        assert_eq!(decode_variable_length(b"\x7f"), Ok(Some((127, 1))));
        assert_eq!(decode_variable_length(b"\x80\x01"), Ok(Some((128, 2))));
        assert_eq!(decode_variable_length(b"\xff\x7f"), Ok(Some((16_383, 2))));
        assert_eq!(decode_variable_length(b"\x80\x80\x01"), Ok(Some((16_384, 3))));
        assert_eq!(decode_variable_length(b"\xff\xff\x7f"), Ok(Some((2_097_151, 3))));
        assert_eq!(
            decode_variable_length(b"\x80\x80\x80\x01"),
            Ok(Some((2_097_152, 4)))
        );
        assert_eq!(
            decode_variable_length(b"\xff\xff\xff\x7f"),
            Ok(Some((MAX_REMAINING_LENGTH, 4)))
        );

        // trailing bytes are left alone
        assert_eq!(decode_variable_length(b"\x7f\x7f"), Ok(Some((127, 1))));

        // incomplete continuation chains ask for more input
        assert_eq!(decode_variable_length(b""), Ok(None));
        assert_eq!(decode_variable_length(b"\xff\xff\xff"), Ok(None));

        // a fifth length byte is a violation
        assert_eq!(
            decode_variable_length(b"\xff\xff\xff\xff\x7f"),
            Err(DecodeError::OversizedPacket)
        );
        assert_eq!(
            decode_variable_length(b"\xff\xff\xff\xff"),
            Err(DecodeError::OversizedPacket)
        );
    }

    #[test]
    fn test_incomplete_packets() {
        assert_eq!(read_packet(b""), Ok(None));
        assert_eq!(read_packet(b"\x20"), Ok(None));
        assert_eq!(read_packet(b"\x20\x02"), Ok(None));
        assert_eq!(read_packet(b"\x20\x02\x00"), Ok(None));
        assert_eq!(read_packet(b"\x3C\x82\x7f"), Ok(None), "body not yet arrived");
    }

    #[test]
    fn test_reserved_type() {
        assert_eq!(read_packet(b"\x00\x00"), Err(DecodeError::ReservedType(0)));
        assert_eq!(read_packet(b"\xf0\x00"), Err(DecodeError::ReservedType(15)));
    }

    #[test]
    fn test_connect() {
        assert_eq!(
            read_packet(b"\x10\x1D\x00\x04MQTT\x04\xC0\x00\x3C\x00\x0512345\x00\x04user\x00\x04pass"),
            Ok(Some((
                Packet::Connect(Connect {
                    protocol: Protocol::V311,
                    clean_session: false,
                    keep_alive: 60,
                    client_id: "12345",
                    last_will: None,
                    username: Some("user"),
                    password: Some(b"pass"),
                }),
                31,
            )))
        );

        assert_eq!(
            read_packet(b"\x10\x21\x00\x04MQTT\x04\x14\x00\x3C\x00\x0512345\x00\x05topic\x00\x07message"),
            Ok(Some((
                Packet::Connect(Connect {
                    protocol: Protocol::V311,
                    clean_session: false,
                    keep_alive: 60,
                    client_id: "12345",
                    last_will: Some(LastWill {
                        qos: QoS::ExactlyOnce,
                        retain: false,
                        topic_name: "topic",
                        message: b"message",
                    }),
                    username: None,
                    password: None,
                }),
                35,
            )))
        );

        // the 3.1 dialect is accepted as well
        assert_matches!(
            read_packet(b"\x10\x12\x00\x06MQIsdp\x03\x02\x00\x3C\x00\x04test"),
            Ok(Some((Packet::Connect(Connect { protocol: Protocol::V31, .. }), _)))
        );

        assert_eq!(
            read_packet(b"\x10\x0E\x00\x04MQTT\x05\x02\x00\x3C\x00\x02ab"),
            Err(DecodeError::UnsupportedProtocol {
                name: "MQTT".to_owned(),
                level: 5,
            })
        );
        assert_eq!(
            read_packet(b"\x10\x0C\x00\x02MQ\x04\x02\x00\x3C\x00\x02ab"),
            Err(DecodeError::UnsupportedProtocol {
                name: "MQ".to_owned(),
                level: 4,
            })
        );

        // reserved connect flag bit must be zero
        assert_eq!(
            read_packet(b"\x10\x0E\x00\x04MQTT\x04\x03\x00\x3C\x00\x02ab"),
            Err(DecodeError::Malformed("CONNECT"))
        );
    }

    #[test]
    fn test_connect_ack() {
        assert_eq!(
            read_packet(b"\x20\x02\x01\x04"),
            Ok(Some((
                Packet::ConnectAck(ConnectAck {
                    session_present: true,
                    return_code: ConnectReturnCode::BadUserNameOrPassword,
                }),
                4,
            )))
        );

        assert_eq!(
            read_packet(b"\x20\x02\x03\x04"),
            Err(DecodeError::Malformed("CONNACK")),
            "invalid flags"
        );
    }

    #[test]
    fn test_publish() {
        assert_eq!(
            read_packet(b"\x3d\x0D\x00\x05topic\x43\x21data"),
            Ok(Some((
                Packet::Publish(Publish {
                    dup: true,
                    retain: true,
                    qos: QoS::ExactlyOnce,
                    topic_name: "topic",
                    packet_id: Some(0x4321),
                    payload: b"data",
                }),
                15,
            )))
        );
        assert_eq!(
            read_packet(b"\x30\x0b\x00\x05topicdata"),
            Ok(Some((
                Packet::Publish(Publish {
                    dup: false,
                    retain: false,
                    qos: QoS::AtMostOnce,
                    topic_name: "topic",
                    packet_id: None,
                    payload: b"data",
                }),
                13,
            )))
        );

        // wildcards are not topic names
        assert_eq!(
            read_packet(b"\x30\x0b\x00\x05top+cdata"),
            Err(DecodeError::Malformed("PUBLISH"))
        );
        assert_eq!(
            read_packet(b"\x30\x0b\x00\x05topi#data"),
            Err(DecodeError::Malformed("PUBLISH"))
        );

        // both QoS bits set
        assert_eq!(
            read_packet(b"\x36\x0b\x00\x05topicdata"),
            Err(DecodeError::Malformed("PUBLISH"))
        );
    }

    #[test]
    fn test_publish_acks() {
        assert_eq!(
            read_packet(b"\x40\x02\x43\x21"),
            Ok(Some((Packet::PublishAck(PublishAck { packet_id: 0x4321 }), 4)))
        );
        assert_eq!(
            read_packet(b"\x50\x02\x43\x21"),
            Ok(Some((
                Packet::PublishReceived(PublishReceived { packet_id: 0x4321 }),
                4,
            )))
        );
        assert_eq!(
            read_packet(b"\x62\x02\x43\x21"),
            Ok(Some((
                Packet::PublishRelease(PublishRelease { packet_id: 0x4321 }),
                4,
            )))
        );
        assert_eq!(
            read_packet(b"\x70\x02\x43\x21"),
            Ok(Some((
                Packet::PublishComplete(PublishComplete { packet_id: 0x4321 }),
                4,
            )))
        );

        // wrong-size ack bodies shut the connection down
        assert_eq!(
            read_packet(b"\x40\x03\x43\x21\x00"),
            Err(DecodeError::Malformed("PUBACK"))
        );
        // PUBREL without its reserved flag bits
        assert_eq!(
            read_packet(b"\x60\x02\x43\x21"),
            Err(DecodeError::Malformed("PUBREL"))
        );
    }

    #[test]
    fn test_subscribe() {
        assert_eq!(
            read_packet(b"\x82\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02"),
            Ok(Some((
                Packet::Subscribe(Subscribe {
                    packet_id: 0x1234,
                    subscriptions: vec![("test", QoS::AtLeastOnce), ("filter", QoS::ExactlyOnce)],
                }),
                20,
            )))
        );

        assert_eq!(
            read_packet(b"\x90\x05\x12\x34\x01\x80\x02"),
            Ok(Some((
                Packet::SubscribeAck(SubscribeAck {
                    packet_id: 0x1234,
                    status: vec![
                        SubscribeReturnCode::Success(QoS::AtLeastOnce),
                        SubscribeReturnCode::Failure,
                        SubscribeReturnCode::Success(QoS::ExactlyOnce),
                    ],
                }),
                7,
            )))
        );

        assert_eq!(
            read_packet(b"\xa2\x10\x12\x34\x00\x04test\x00\x06filter"),
            Ok(Some((
                Packet::Unsubscribe(Unsubscribe {
                    packet_id: 0x1234,
                    topic_filters: vec!["test", "filter"],
                }),
                18,
            )))
        );

        assert_eq!(
            read_packet(b"\xb0\x02\x43\x21"),
            Ok(Some((
                Packet::UnsubscribeAck(UnsubscribeAck { packet_id: 0x4321 }),
                4,
            )))
        );

        // a subscribe without any subscription is a protocol violation
        assert_eq!(
            read_packet(b"\x82\x02\x42\x42"),
            Err(DecodeError::Malformed("SUBSCRIBE"))
        );
        // missing QoS byte after the topic filter
        assert_eq!(
            read_packet(b"\x82\x08\x42\x42\x00\x04test"),
            Err(DecodeError::Malformed("SUBSCRIBE"))
        );
        // truncated string length prefix
        assert_eq!(
            read_packet(b"\xa2\x03\x42\x42\x00"),
            Err(DecodeError::Malformed("UNSUBSCRIBE"))
        );
        // reserved flag nibble
        assert_eq!(
            read_packet(b"\x80\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02"),
            Err(DecodeError::Malformed("SUBSCRIBE"))
        );
    }

    #[test]
    fn test_ping_pong_disconnect() {
        assert_eq!(read_packet(b"\xc0\x00"), Ok(Some((Packet::Ping, 2))));
        assert_eq!(read_packet(b"\xd0\x00"), Ok(Some((Packet::Pong, 2))));
        assert_eq!(read_packet(b"\xe0\x00"), Ok(Some((Packet::Disconnect, 2))));
        assert_eq!(
            read_packet(b"\xc0\x01\x00"),
            Err(DecodeError::Malformed("PINGREQ"))
        );
    }

    #[test]
    fn test_embedded_nul_rejected() {
        assert_eq!(
            read_packet(b"\x30\x0b\x00\x05top\x00cdata"),
            Err(DecodeError::Malformed("PUBLISH")),
        );
    }

    #[test]
    fn test_pipelined_packets() {
        let wire = b"\xc0\x00\xd0\x00";
        let (first, consumed) = read_packet(wire).unwrap().unwrap();
        assert_eq!(first, Packet::Ping);
        let (second, _) = read_packet(&wire[consumed..]).unwrap().unwrap();
        assert_eq!(second, Packet::Pong);
    }
}
