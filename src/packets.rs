//! MQTT 3.1.1 control packets.
use crate::{
    reason_codes::{ConnectReturnCode, SubscribeReturnCode},
    subscriptions::{valid_topic_filter, valid_topic_name, TopicFilter},
    types::{BinaryData, Utf8String},
    QoS, Retain,
};
use bit_field::BitField;
use serde::{ser::SerializeStruct, Deserialize, Serialize};

/// The protocol level of MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// The protocol name carried in every CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// A will message as carried in a CONNECT.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WillMessage<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: Retain,
}

/// An MQTT CONNECT packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Connect<'a> {
    /// Specifies the keep-alive interval of the connection in seconds.
    pub keep_alive: u16,

    /// The ID of the client that is connecting. May be empty to have the broker assign one.
    pub client_id: &'a str,

    /// Specified true if the broker should discard any previous session state.
    pub clean_session: bool,

    /// An optional will message to be published if the connection is lost.
    pub will: Option<WillMessage<'a>>,

    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

impl<'a> Connect<'a> {
    pub(crate) fn flags(&self) -> u8 {
        let mut flags: u8 = 0;
        flags.set_bit(1, self.clean_session);

        if let Some(will) = &self.will {
            flags.set_bit(2, true);
            flags.set_bits(3..=4, will.qos as u8);
            flags.set_bit(5, will.retain == Retain::Retained);
        }

        flags.set_bit(6, self.password.is_some());
        flags.set_bit(7, self.username.is_some());
        flags
    }
}

impl<'a> serde::Serialize for Connect<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;

        // A password may only be sent along with a user name.
        if self.password.is_some() && self.username.is_none() {
            return Err(S::Error::custom("Password requires a user name"));
        }

        let mut item = serializer.serialize_struct("Connect", 0)?;
        item.serialize_field("protocol_name", &Utf8String(PROTOCOL_NAME))?;
        item.serialize_field("protocol_level", &PROTOCOL_LEVEL)?;
        item.serialize_field("flags", &self.flags())?;
        item.serialize_field("keep_alive", &self.keep_alive)?;
        item.serialize_field("client_id", &Utf8String(self.client_id))?;

        if let Some(will) = &self.will {
            if !valid_topic_name(will.topic) {
                return Err(S::Error::custom("Invalid will topic"));
            }
            item.serialize_field("will_topic", &Utf8String(will.topic))?;
            item.serialize_field("will_payload", &BinaryData(will.payload))?;
        }

        if let Some(username) = self.username {
            item.serialize_field("username", &Utf8String(username))?;
        }

        if let Some(password) = self.password {
            item.serialize_field("password", &BinaryData(password))?;
        }

        item.end()
    }
}

/// An MQTT CONNACK packet, representing a connection acknowledgement from a broker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnAck {
    /// Indicates true if session state is being maintained by the broker.
    pub session_present: bool,

    /// A status code indicating the success status of the connection.
    pub code: ConnectReturnCode,
}

/// An MQTT PUBLISH packet, containing data to be sent or received.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pub<'a> {
    /// The topic that the message was published on.
    pub topic: &'a str,

    /// The packet identifier. Present if and only if QoS is above [QoS::AtMostOnce].
    pub packet_id: Option<u16>,

    /// The message to be transmitted.
    pub payload: &'a [u8],

    /// Specifies whether or not the message should be retained on the broker.
    pub retain: Retain,

    /// Specifies the quality-of-service of the transmission.
    pub qos: QoS,

    /// Specified true if this message is a retransmission.
    pub dup: bool,
}

impl<'a> serde::Serialize for Pub<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;

        if !valid_topic_name(self.topic) {
            return Err(S::Error::custom("Invalid topic name"));
        }

        let mut item = serializer.serialize_struct("Publish", 0)?;
        item.serialize_field("topic", &Utf8String(self.topic))?;

        // Packet identifiers are absent unless a QoS requiring IDs is specified.
        match (self.qos, self.packet_id) {
            (QoS::AtMostOnce, None) => {}
            (QoS::AtMostOnce, Some(_)) => {
                return Err(S::Error::custom("Packet identifier at QoS 0"));
            }
            (_, Some(0)) | (_, None) => {
                return Err(S::Error::custom("Missing packet identifier"));
            }
            (_, Some(id)) => item.serialize_field("packet_identifier", &id)?,
        }

        item.serialize_field("payload", &BinaryPayload(self.payload))?;

        item.end()
    }
}

/// Raw bytes written without a length prefix.
struct BinaryPayload<'a>(&'a [u8]);

impl<'a> serde::Serialize for BinaryPayload<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

macro_rules! identified_packet {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            pub packet_id: u16,
        }
    };
}

identified_packet!(
    /// An MQTT PUBACK control packet, completing a QoS 1 publication.
    PubAck
);

identified_packet!(
    /// An MQTT PUBREC control packet, the first acknowledgement of a QoS 2 publication.
    PubRec
);

identified_packet!(
    /// An MQTT PUBREL control packet, releasing a received QoS 2 publication.
    PubRel
);

identified_packet!(
    /// An MQTT PUBCOMP control packet, completing a QoS 2 publication.
    PubComp
);

identified_packet!(
    /// An MQTT UNSUBACK control packet.
    UnsubAck
);

/// An entry of a SUBSCRIBE or UNSUBSCRIBE topic list.
pub trait TopicEntry<'a>: Sized + Copy + Serialize {
    /// Parse one entry from the head of `data`, returning it and its encoded size.
    fn parse(data: &'a [u8]) -> Option<(Self, usize)>;
}

fn parse_string(data: &[u8]) -> Option<(&str, usize)> {
    let len = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
    let string = core::str::from_utf8(data.get(2..2 + len)?).ok()?;
    Some((string, 2 + len))
}

impl<'a> TopicEntry<'a> for TopicFilter<'a> {
    fn parse(data: &'a [u8]) -> Option<(Self, usize)> {
        let (topic, len) = parse_string(data)?;
        let options = *data.get(len)?;

        // The upper six bits of the requested QoS byte are reserved.
        let qos = QoS::try_from(options).ok()?;
        if !valid_topic_filter(topic) {
            return None;
        }
        Some((TopicFilter::new(topic).qos(qos), len + 1))
    }
}

impl<'a> TopicEntry<'a> for Utf8String<'a> {
    fn parse(data: &'a [u8]) -> Option<(Self, usize)> {
        let (topic, len) = parse_string(data)?;
        if !valid_topic_filter(topic) {
            return None;
        }
        Some((Utf8String(topic), len))
    }
}

/// The topic list of a SUBSCRIBE or UNSUBSCRIBE.
///
/// Outgoing packets refer to caller-provided entries. Parsed packets refer to the encoded bytes,
/// which were validated while decoding.
#[derive(Copy, Clone, Debug)]
pub enum TopicList<'a, T> {
    Entries(&'a [T]),
    Encoded(&'a [u8]),
}

impl<'a, T: TopicEntry<'a>> TopicList<'a, T> {
    pub fn iter(&self) -> TopicIter<'a, T> {
        TopicIter {
            list: *self,
            index: 0,
        }
    }

    /// Check that `data` is a non-empty sequence of valid entries.
    pub(crate) fn validate(data: &'a [u8]) -> bool {
        let mut index = 0;
        while index < data.len() {
            match T::parse(&data[index..]) {
                Some((_, len)) => index += len,
                None => return false,
            }
        }

        index > 0
    }
}

impl<'a, T: TopicEntry<'a> + PartialEq> PartialEq for TopicList<'a, T> {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl<'a, T: TopicEntry<'a>> Serialize for TopicList<'a, T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::{Error, SerializeSeq};
        match self {
            TopicList::Entries(entries) => {
                if entries.is_empty() {
                    return Err(S::Error::custom("Empty topic list"));
                }
                let mut seq = serializer.serialize_seq(Some(entries.len()))?;
                for entry in entries.iter() {
                    seq.serialize_element(entry)?;
                }
                seq.end()
            }
            TopicList::Encoded(data) => serializer.serialize_bytes(data),
        }
    }
}

pub struct TopicIter<'a, T> {
    list: TopicList<'a, T>,
    index: usize,
}

impl<'a, T: TopicEntry<'a>> Iterator for TopicIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self.list {
            TopicList::Entries(entries) => {
                let entry = entries.get(self.index).copied();
                self.index += 1;
                entry
            }
            TopicList::Encoded(data) => {
                let (entry, len) = T::parse(data.get(self.index..)?)?;
                self.index += len;
                Some(entry)
            }
        }
    }
}

/// An MQTT SUBSCRIBE control packet
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Subscribe<'a> {
    /// Specifies the ID of this subscription request.
    pub packet_id: u16,

    /// The requested topic filters.
    pub topics: TopicList<'a, TopicFilter<'a>>,
}

/// An MQTT SUBACK control packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubAck<'a> {
    /// The identifier that the acknowledge is associated with.
    pub packet_id: u16,

    /// One return code per requested filter, in request order.
    pub return_codes: &'a [u8],
}

impl<'a> SubAck<'a> {
    pub fn codes(&self) -> impl Iterator<Item = SubscribeReturnCode> + 'a {
        self.return_codes
            .iter()
            .map(|code| SubscribeReturnCode::parse(*code).unwrap_or(SubscribeReturnCode::Failure))
    }
}

impl<'a> serde::Serialize for SubAck<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut item = serializer.serialize_struct("SubAck", 0)?;
        item.serialize_field("packet_identifier", &self.packet_id)?;
        item.serialize_field("return_codes", &BinaryPayload(self.return_codes))?;
        item.end()
    }
}

/// An MQTT UNSUBSCRIBE control packet.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Unsubscribe<'a> {
    pub packet_id: u16,

    /// The topic filters to remove.
    pub topics: TopicList<'a, Utf8String<'a>>,
}

/// An MQTT PINGREQ control packet
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReq;

/// An MQTT PINGRESP control packet
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResp;

/// An MQTT DISCONNECT control packet
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect;

/// Any MQTT 3.1.1 control packet.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Packet<'a> {
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    Publish(Pub<'a>),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe<'a>),
    SubAck(SubAck<'a>),
    Unsubscribe(Unsubscribe<'a>),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl<'a> Packet<'a> {
    pub fn message_type(&self) -> crate::MessageType {
        use crate::MessageType;
        match self {
            Packet::Connect(_) => MessageType::Connect,
            Packet::ConnAck(_) => MessageType::ConnAck,
            Packet::Publish(_) => MessageType::Publish,
            Packet::PubAck(_) => MessageType::PubAck,
            Packet::PubRec(_) => MessageType::PubRec,
            Packet::PubRel(_) => MessageType::PubRel,
            Packet::PubComp(_) => MessageType::PubComp,
            Packet::Subscribe(_) => MessageType::Subscribe,
            Packet::SubAck(_) => MessageType::SubAck,
            Packet::Unsubscribe(_) => MessageType::Unsubscribe,
            Packet::UnsubAck(_) => MessageType::UnsubAck,
            Packet::PingReq => MessageType::PingReq,
            Packet::PingResp => MessageType::PingResp,
            Packet::Disconnect => MessageType::Disconnect,
        }
    }

    /// The packet identifier carried by the packet, if any.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(publish) => publish.packet_id,
            Packet::PubAck(PubAck { packet_id })
            | Packet::PubRec(PubRec { packet_id })
            | Packet::PubRel(PubRel { packet_id })
            | Packet::PubComp(PubComp { packet_id })
            | Packet::UnsubAck(UnsubAck { packet_id })
            | Packet::Subscribe(Subscribe { packet_id, .. })
            | Packet::SubAck(SubAck { packet_id, .. })
            | Packet::Unsubscribe(Unsubscribe { packet_id, .. }) => Some(*packet_id),
            _ => None,
        }
    }
}
