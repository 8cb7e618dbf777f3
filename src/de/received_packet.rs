use crate::{
    codec::frame_length,
    error::DecodeError,
    message_types::MessageType,
    packets::{
        ConnAck, Connect, Packet, Pub, PubAck, PubComp, PubRec, PubRel, SubAck, Subscribe,
        TopicList, UnsubAck, Unsubscribe, WillMessage, PROTOCOL_LEVEL, PROTOCOL_NAME,
    },
    reason_codes::SubscribeReturnCode,
    subscriptions::{valid_topic_name, TopicFilter},
    types::{BinaryData, Utf8String},
    varint::Varint,
    QoS, Retain,
};

use super::deserializer::{Error, MqttDeserializer};

use bit_field::BitField;
use serde::de::{Deserialize, SeqAccess};

impl From<Error> for DecodeError {
    fn from(_: Error) -> Self {
        DecodeError::MalformedPacket
    }
}

impl<'a> Packet<'a> {
    /// Parse a buffer holding exactly one control packet.
    pub fn from_buffer(buf: &'a [u8]) -> Result<Self, DecodeError> {
        let length = frame_length(buf)?;
        if length > buf.len() {
            return Err(DecodeError::Incomplete);
        } else if length < buf.len() {
            return Err(DecodeError::MalformedPacket);
        }

        let mut deserializer = MqttDeserializer::new(buf);
        let mut packet = Packet::deserialize(&mut deserializer)?;

        let remaining_payload = deserializer.remainder();

        // Only packets with a trailing payload or list may carry remaining data.
        match &mut packet {
            Packet::Publish(publish) => {
                publish.payload = remaining_payload;
            }
            Packet::Subscribe(subscribe) => {
                if !TopicList::<TopicFilter>::validate(remaining_payload) {
                    return Err(DecodeError::MalformedPacket);
                }
                subscribe.topics = TopicList::Encoded(remaining_payload);
            }
            Packet::Unsubscribe(unsubscribe) => {
                if !TopicList::<Utf8String>::validate(remaining_payload) {
                    return Err(DecodeError::MalformedPacket);
                }
                unsubscribe.topics = TopicList::Encoded(remaining_payload);
            }
            Packet::SubAck(suback) => {
                if remaining_payload.is_empty()
                    || remaining_payload
                        .iter()
                        .any(|code| SubscribeReturnCode::parse(*code).is_none())
                {
                    return Err(DecodeError::MalformedPacket);
                }
                suback.return_codes = remaining_payload;
            }
            _ => {
                if !remaining_payload.is_empty() {
                    return Err(DecodeError::MalformedPacket);
                }
            }
        }

        Ok(packet)
    }
}

fn next<'de, T: Deserialize<'de>, A: SeqAccess<'de>>(seq: &mut A) -> Result<T, A::Error> {
    use serde::de::Error;
    seq.next_element()?
        .ok_or_else(|| A::Error::custom("Missing packet field"))
}

fn packet_id<'de, A: SeqAccess<'de>>(seq: &mut A) -> Result<u16, A::Error> {
    use serde::de::Error;
    match next(seq)? {
        0 => Err(A::Error::custom("Packet identifier of zero")),
        id => Ok(id),
    }
}

fn retain(bit: bool) -> Retain {
    if bit {
        Retain::Retained
    } else {
        Retain::NotRetained
    }
}

struct ControlPacketVisitor;

impl ControlPacketVisitor {
    fn connect<'de, A: SeqAccess<'de>>(seq: &mut A) -> Result<Connect<'de>, A::Error> {
        use serde::de::Error;

        let name: Utf8String = next(seq)?;
        let level: u8 = next(seq)?;
        if name.0 != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
            return Err(A::Error::custom("Unsupported protocol"));
        }

        let flags: u8 = next(seq)?;
        if flags.get_bit(0) {
            return Err(A::Error::custom("Reserved CONNECT flag set"));
        }

        let keep_alive = next(seq)?;
        let client_id: Utf8String = next(seq)?;

        let will = if flags.get_bit(2) {
            let topic: Utf8String = next(seq)?;
            let payload: BinaryData = next(seq)?;
            let qos = QoS::try_from(flags.get_bits(3..=4))
                .map_err(|_| A::Error::custom("Bad will QoS"))?;
            Some(WillMessage {
                topic: topic.0,
                payload: payload.0,
                qos,
                retain: retain(flags.get_bit(5)),
            })
        } else {
            if flags.get_bits(3..=5) != 0 {
                return Err(A::Error::custom("Will flags without a will"));
            }
            None
        };

        if flags.get_bit(6) && !flags.get_bit(7) {
            return Err(A::Error::custom("Password without a user name"));
        }

        let username = if flags.get_bit(7) {
            let username: Utf8String = next(seq)?;
            Some(username.0)
        } else {
            None
        };

        let password = if flags.get_bit(6) {
            let password: BinaryData = next(seq)?;
            Some(password.0)
        } else {
            None
        };

        Ok(Connect {
            keep_alive,
            client_id: client_id.0,
            clean_session: flags.get_bit(1),
            will,
            username,
            password,
        })
    }

    fn publish<'de, A: SeqAccess<'de>>(seq: &mut A, flags: u8) -> Result<Pub<'de>, A::Error> {
        use serde::de::Error;

        let qos =
            QoS::try_from(flags.get_bits(1..=2)).map_err(|_| A::Error::custom("Bad QoS field"))?;
        let dup = flags.get_bit(3);
        if dup && qos == QoS::AtMostOnce {
            return Err(A::Error::custom("DUP set at QoS 0"));
        }

        let topic: Utf8String = next(seq)?;
        if !valid_topic_name(topic.0) {
            return Err(A::Error::custom("Invalid topic name"));
        }

        let packet_id = if qos > QoS::AtMostOnce {
            Some(packet_id(seq)?)
        } else {
            None
        };

        Ok(Pub {
            topic: topic.0,
            packet_id,
            payload: &[],
            retain: retain(flags.get_bit(0)),
            qos,
            dup,
        })
    }
}

impl<'de> serde::de::Visitor<'de> for ControlPacketVisitor {
    type Value = Packet<'de>;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(formatter, "MQTT Control Packet")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        use serde::de::Error;

        let fixed_header: u8 = next(&mut seq)?;
        let _length: Varint = next(&mut seq)?;
        let packet_type = MessageType::try_from(fixed_header.get_bits(4..=7))
            .map_err(|_| A::Error::custom("Invalid MQTT control packet type"))?;

        let flags = fixed_header.get_bits(0..=3);
        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(A::Error::custom("Invalid fixed header flags"));
            }
        }

        let packet = match packet_type {
            MessageType::Connect => Packet::Connect(Self::connect(&mut seq)?),
            MessageType::ConnAck => Packet::ConnAck(next::<ConnAck, _>(&mut seq)?),
            MessageType::Publish => Packet::Publish(Self::publish(&mut seq, flags)?),
            MessageType::PubAck => Packet::PubAck(PubAck {
                packet_id: packet_id(&mut seq)?,
            }),
            MessageType::PubRec => Packet::PubRec(PubRec {
                packet_id: packet_id(&mut seq)?,
            }),
            MessageType::PubRel => Packet::PubRel(PubRel {
                packet_id: packet_id(&mut seq)?,
            }),
            MessageType::PubComp => Packet::PubComp(PubComp {
                packet_id: packet_id(&mut seq)?,
            }),
            MessageType::Subscribe => Packet::Subscribe(Subscribe {
                packet_id: packet_id(&mut seq)?,
                topics: TopicList::Encoded(&[]),
            }),
            MessageType::SubAck => Packet::SubAck(SubAck {
                packet_id: packet_id(&mut seq)?,
                return_codes: &[],
            }),
            MessageType::Unsubscribe => Packet::Unsubscribe(Unsubscribe {
                packet_id: packet_id(&mut seq)?,
                topics: TopicList::Encoded(&[]),
            }),
            MessageType::UnsubAck => Packet::UnsubAck(UnsubAck {
                packet_id: packet_id(&mut seq)?,
            }),
            MessageType::PingReq => Packet::PingReq,
            MessageType::PingResp => Packet::PingResp,
            MessageType::Disconnect => Packet::Disconnect,
        };

        Ok(packet)
    }
}

impl<'de> Deserialize<'de> for Packet<'de> {
    fn deserialize<D: serde::de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // The fixed header, remaining length and at most nine CONNECT fields.
        deserializer.deserialize_tuple(16, ControlPacketVisitor)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reason_codes::ConnectReturnCode;

    #[test]
    fn deserialize_good_connack() {
        let serialized_connack: [u8; 4] = [
            0x20, 0x02, // Remaining length = 2 bytes
            0x01, // Connect acknowledge flags - session present
            0x00, // Connect return code - 0 (Accepted)
        ];

        let packet = Packet::from_buffer(&serialized_connack).unwrap();
        assert_eq!(
            packet,
            Packet::ConnAck(ConnAck {
                session_present: true,
                code: ConnectReturnCode::Accepted,
            })
        );
    }

    #[test]
    fn deserialize_refused_connack() {
        let packet = Packet::from_buffer(&[0x20, 0x02, 0x00, 0x05]).unwrap();
        assert_eq!(
            packet,
            Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::NotAuthorized,
            })
        );
    }

    #[test]
    fn connack_reserved_flags() {
        assert_eq!(
            Packet::from_buffer(&[0x20, 0x02, 0x02, 0x00]),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn deserialize_good_publish() {
        let serialized_publish: [u8; 6] = [
            0x30, // Publish, no QoS
            0x04, // Remaining length
            0x00, 0x01, // Topic length (1)
            0x41, // Topic name: 'A'
            0x05, // Payload
        ];

        let packet = Packet::from_buffer(&serialized_publish).unwrap();
        match packet {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, "A");
                assert_eq!(publish.payload, [0x05]);
                assert_eq!(publish.packet_id, None);
            }
            _ => panic!("Invalid message"),
        }
    }

    #[test]
    fn deserialize_duplicate_qos2_publish() {
        let serialized_publish = [0x3D, 0x06, 0x00, 0x01, 0x41, 0x00, 0x07, 0xEE];

        match Packet::from_buffer(&serialized_publish).unwrap() {
            Packet::Publish(publish) => {
                assert_eq!(publish.qos, QoS::ExactlyOnce);
                assert_eq!(publish.packet_id, Some(7));
                assert!(publish.dup);
                assert_eq!(publish.retain, Retain::Retained);
                assert_eq!(publish.payload, [0xEE]);
            }
            _ => panic!("Invalid message"),
        }
    }

    #[test]
    fn publish_with_invalid_qos() {
        assert_eq!(
            Packet::from_buffer(&[0x36, 0x05, 0x00, 0x01, 0x41, 0x00, 0x01]),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn publish_with_zero_identifier() {
        assert_eq!(
            Packet::from_buffer(&[0x32, 0x05, 0x00, 0x01, 0x41, 0x00, 0x00]),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn deserialize_acks() {
        assert_eq!(
            Packet::from_buffer(&[0x40, 0x02, 0x00, 0x05]).unwrap(),
            Packet::PubAck(PubAck { packet_id: 5 })
        );
        assert_eq!(
            Packet::from_buffer(&[0x50, 0x02, 0x00, 0x05]).unwrap(),
            Packet::PubRec(PubRec { packet_id: 5 })
        );
        assert_eq!(
            Packet::from_buffer(&[0x62, 0x02, 0x00, 0x05]).unwrap(),
            Packet::PubRel(PubRel { packet_id: 5 })
        );
        assert_eq!(
            Packet::from_buffer(&[0x70, 0x02, 0x00, 0x05]).unwrap(),
            Packet::PubComp(PubComp { packet_id: 5 })
        );
        assert_eq!(
            Packet::from_buffer(&[0xB0, 0x02, 0x00, 0x05]).unwrap(),
            Packet::UnsubAck(UnsubAck { packet_id: 5 })
        );
    }

    #[test]
    fn pubrel_requires_flags() {
        assert_eq!(
            Packet::from_buffer(&[0x60, 0x02, 0x00, 0x05]),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn ack_with_trailing_data() {
        assert_eq!(
            Packet::from_buffer(&[0x40, 0x03, 0x00, 0x05, 0x00]),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn deserialize_good_suback() {
        let serialized_suback: [u8; 6] = [
            0x90, // SubAck
            0x04, // Remaining length
            0x00, 0x05, // Identifier
            0x02, // Granted QoS 2
            0x80, // Failure
        ];

        match Packet::from_buffer(&serialized_suback).unwrap() {
            Packet::SubAck(suback) => {
                assert_eq!(suback.packet_id, 5);
                let mut codes = suback.codes();
                assert_eq!(
                    codes.next(),
                    Some(SubscribeReturnCode::Granted(QoS::ExactlyOnce))
                );
                assert_eq!(codes.next(), Some(SubscribeReturnCode::Failure));
                assert_eq!(codes.next(), None);
            }
            _ => panic!("Invalid message"),
        }
    }

    #[test]
    fn suback_with_invalid_code() {
        assert_eq!(
            Packet::from_buffer(&[0x90, 0x03, 0x00, 0x05, 0x03]),
            Err(DecodeError::MalformedPacket)
        );
        assert_eq!(
            Packet::from_buffer(&[0x90, 0x02, 0x00, 0x05]),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn deserialize_subscribe() {
        let serialized = [0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'#', 0x01];
        match Packet::from_buffer(&serialized).unwrap() {
            Packet::Subscribe(subscribe) => {
                assert_eq!(subscribe.packet_id, 1);
                let mut topics = subscribe.topics.iter();
                assert_eq!(
                    topics.next(),
                    Some(TopicFilter::new("a/#").qos(QoS::AtLeastOnce))
                );
                assert_eq!(topics.next(), None);
            }
            _ => panic!("Invalid message"),
        }
    }

    #[test]
    fn subscribe_with_invalid_filter() {
        let serialized = [0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'#', b'b', 0x01];
        assert_eq!(
            Packet::from_buffer(&serialized),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn deserialize_connect() {
        #[rustfmt::skip]
        let serialized: [u8; 24] = [
            0x10, 22,
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04,
            0b1000_0010, // User name, clean session
            0x00, 0x3C,
            0x00, 0x03, b'a', b'b', b'c',
            0x00, 0x03, b'u', b's', b'r',
            // Trailing bytes belong to no field.
            0x00, 0x00,
        ];

        // Trailing bytes are malformed.
        assert_eq!(
            Packet::from_buffer(&serialized),
            Err(DecodeError::MalformedPacket)
        );

        let mut fixed = [0u8; 22];
        fixed.copy_from_slice(&serialized[..22]);
        fixed[1] = 20;
        match Packet::from_buffer(&fixed).unwrap() {
            Packet::Connect(connect) => {
                assert_eq!(connect.client_id, "abc");
                assert_eq!(connect.keep_alive, 60);
                assert!(connect.clean_session);
                assert_eq!(connect.username, Some("usr"));
                assert_eq!(connect.password, None);
                assert_eq!(connect.will, None);
            }
            _ => panic!("Invalid message"),
        }
    }

    #[test]
    fn connect_with_wrong_protocol() {
        let serialized = [
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ];
        assert_eq!(
            Packet::from_buffer(&serialized),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn deserialize_good_ping_resp() {
        assert_eq!(
            Packet::from_buffer(&[0xd0, 0x00]).unwrap(),
            Packet::PingResp
        );
    }

    #[test]
    fn unknown_packet_type() {
        assert_eq!(
            Packet::from_buffer(&[0xF0, 0x00]),
            Err(DecodeError::MalformedPacket)
        );
        assert_eq!(
            Packet::from_buffer(&[0x00, 0x00]),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn length_mismatch() {
        assert_eq!(
            Packet::from_buffer(&[0x40, 0x02, 0x00]),
            Err(DecodeError::Incomplete)
        );
        assert_eq!(
            Packet::from_buffer(&[0xd0, 0x00, 0x00]),
            Err(DecodeError::MalformedPacket)
        );
    }
}
