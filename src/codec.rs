//! The packet codec.
//!
//! Encoding and decoding are pure functions of their arguments and may be called from anywhere
//! as long as every caller provides its own buffer. The engine reaches the codec through the
//! [WireFormat] trait so alternative wire formats can be substituted.
use crate::{
    error::{DecodeError, EncodeError},
    packets::{Disconnect, Packet, PingReq, PingResp},
    ser::MqttSerializer,
    varint,
};

/// Serialization and parsing of control packets.
pub trait WireFormat {
    /// Encode a packet into `buf`, returning the slice holding the complete packet.
    fn encode<'b>(&self, packet: &Packet<'_>, buf: &'b mut [u8]) -> Result<&'b [u8], EncodeError>;

    /// Parse the packet at the head of `buf`.
    ///
    /// # Returns
    /// The packet and the number of bytes it occupied. [DecodeError::Incomplete] indicates more
    /// bytes are needed.
    fn decode<'b>(&self, buf: &'b [u8]) -> Result<(Packet<'b>, usize), DecodeError>;
}

/// The MQTT 3.1.1 wire format.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Mqtt311;

impl WireFormat for Mqtt311 {
    fn encode<'b>(&self, packet: &Packet<'_>, buf: &'b mut [u8]) -> Result<&'b [u8], EncodeError> {
        encode(packet, buf)
    }

    fn decode<'b>(&self, buf: &'b [u8]) -> Result<(Packet<'b>, usize), DecodeError> {
        decode(buf)
    }
}

/// Encode an MQTT 3.1.1 control packet.
pub fn encode<'b>(packet: &Packet<'_>, buf: &'b mut [u8]) -> Result<&'b [u8], EncodeError> {
    match packet {
        Packet::Connect(connect) => MqttSerializer::to_buffer(buf, connect),
        Packet::ConnAck(connack) => MqttSerializer::to_buffer(buf, connack),
        Packet::Publish(publish) => MqttSerializer::to_buffer(buf, publish),
        Packet::PubAck(puback) => MqttSerializer::to_buffer(buf, puback),
        Packet::PubRec(pubrec) => MqttSerializer::to_buffer(buf, pubrec),
        Packet::PubRel(pubrel) => MqttSerializer::to_buffer(buf, pubrel),
        Packet::PubComp(pubcomp) => MqttSerializer::to_buffer(buf, pubcomp),
        Packet::Subscribe(subscribe) => MqttSerializer::to_buffer(buf, subscribe),
        Packet::SubAck(suback) => MqttSerializer::to_buffer(buf, suback),
        Packet::Unsubscribe(unsubscribe) => MqttSerializer::to_buffer(buf, unsubscribe),
        Packet::UnsubAck(unsuback) => MqttSerializer::to_buffer(buf, unsuback),
        Packet::PingReq => MqttSerializer::to_buffer(buf, &PingReq),
        Packet::PingResp => MqttSerializer::to_buffer(buf, &PingResp),
        Packet::Disconnect => MqttSerializer::to_buffer(buf, &Disconnect),
    }
}

/// Decode the MQTT 3.1.1 control packet at the head of `buf`.
pub fn decode(buf: &[u8]) -> Result<(Packet<'_>, usize), DecodeError> {
    let length = frame_length(buf)?;
    let packet = buf.get(..length).ok_or(DecodeError::Incomplete)?;
    Ok((Packet::from_buffer(packet)?, length))
}

/// Determine the total size of the packet starting at the head of `buf` from its fixed header.
///
/// The returned length may exceed the number of buffered bytes.
pub fn frame_length(buf: &[u8]) -> Result<usize, DecodeError> {
    let remaining = buf.get(1..).ok_or(DecodeError::Incomplete)?;
    match varint::probe(remaining) {
        Ok(Some((length, size))) => Ok(1 + size + length),
        Ok(None) => Err(DecodeError::Incomplete),
        Err(()) => Err(DecodeError::MalformedPacket),
    }
}
