use crate::{
    packets::{
        ConnAck, Connect, Disconnect, PingReq, PingResp, Pub, PubAck, PubComp, PubRec, PubRel,
        SubAck, Subscribe, UnsubAck, Unsubscribe,
    },
    Retain,
};
use bit_field::BitField;
use num_enum::TryFromPrimitive;

/// The control packet type carried in the upper nibble of the fixed header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl MessageType {
    /// The lower header nibble every packet of this type must carry. PUBLISH flags are variable
    /// and are not described here.
    pub fn required_flags(&self) -> Option<u8> {
        match self {
            MessageType::Publish => None,
            MessageType::PubRel | MessageType::Subscribe | MessageType::Unsubscribe => {
                Some(0b0010)
            }
            _ => Some(0),
        }
    }
}

pub trait ControlPacket {
    const MESSAGE_TYPE: MessageType;
    fn fixed_header_flags(&self) -> u8 {
        0u8
    }
}

impl<'a> ControlPacket for Connect<'a> {
    const MESSAGE_TYPE: MessageType = MessageType::Connect;
}

impl ControlPacket for ConnAck {
    const MESSAGE_TYPE: MessageType = MessageType::ConnAck;
}

impl<'a> ControlPacket for Pub<'a> {
    const MESSAGE_TYPE: MessageType = MessageType::Publish;
    fn fixed_header_flags(&self) -> u8 {
        *0u8.set_bit(3, self.dup)
            .set_bits(1..=2, self.qos as u8)
            .set_bit(0, self.retain == Retain::Retained)
    }
}

impl ControlPacket for PubAck {
    const MESSAGE_TYPE: MessageType = MessageType::PubAck;
}

impl ControlPacket for PubRec {
    const MESSAGE_TYPE: MessageType = MessageType::PubRec;
}

impl ControlPacket for PubRel {
    const MESSAGE_TYPE: MessageType = MessageType::PubRel;
    fn fixed_header_flags(&self) -> u8 {
        0b0010
    }
}

impl ControlPacket for PubComp {
    const MESSAGE_TYPE: MessageType = MessageType::PubComp;
}

impl<'a> ControlPacket for Subscribe<'a> {
    const MESSAGE_TYPE: MessageType = MessageType::Subscribe;
    fn fixed_header_flags(&self) -> u8 {
        0b0010
    }
}

impl<'a> ControlPacket for SubAck<'a> {
    const MESSAGE_TYPE: MessageType = MessageType::SubAck;
}

impl<'a> ControlPacket for Unsubscribe<'a> {
    const MESSAGE_TYPE: MessageType = MessageType::Unsubscribe;
    fn fixed_header_flags(&self) -> u8 {
        0b0010
    }
}

impl ControlPacket for UnsubAck {
    const MESSAGE_TYPE: MessageType = MessageType::UnsubAck;
}

impl ControlPacket for PingReq {
    const MESSAGE_TYPE: MessageType = MessageType::PingReq;
}

impl ControlPacket for PingResp {
    const MESSAGE_TYPE: MessageType = MessageType::PingResp;
}

impl ControlPacket for Disconnect {
    const MESSAGE_TYPE: MessageType = MessageType::Disconnect;
}
