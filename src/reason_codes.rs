use num_enum::{FromPrimitive, IntoPrimitive};

/// Return codes a server may place in a CONNACK.
#[derive(PartialEq, Eq, Copy, Clone, Debug, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0x00,
    UnacceptableProtocolVersion = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadUsernameOrPassword = 0x04,
    NotAuthorized = 0x05,

    /// The code is not one of the return codes defined by MQTT 3.1.1.
    #[num_enum(default)]
    Unknown = 0xFF,
}

impl ConnectReturnCode {
    pub fn accepted(&self) -> bool {
        *self == ConnectReturnCode::Accepted
    }
}

impl serde::Serialize for ConnectReturnCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8((*self).into())
    }
}

struct ConnectReturnCodeVisitor;

impl serde::de::Visitor<'_> for ConnectReturnCodeVisitor {
    type Value = ConnectReturnCode;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(formatter, "ConnectReturnCode")
    }

    fn visit_u8<E: serde::de::Error>(self, data: u8) -> Result<Self::Value, E> {
        Ok(ConnectReturnCode::from(data))
    }
}

impl<'de> serde::de::Deserialize<'de> for ConnectReturnCode {
    fn deserialize<D: serde::de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_u8(ConnectReturnCodeVisitor)
    }
}

/// Per-filter return codes of a SUBACK.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum SubscribeReturnCode {
    /// The subscription was accepted at the contained maximum QoS.
    Granted(crate::QoS),

    /// The subscription was refused.
    Failure,
}

impl SubscribeReturnCode {
    pub const FAILURE: u8 = 0x80;

    /// Parse a return code byte, rejecting values MQTT 3.1.1 does not define.
    pub fn parse(code: u8) -> Option<Self> {
        match code {
            Self::FAILURE => Some(SubscribeReturnCode::Failure),
            qos => crate::QoS::try_from(qos)
                .ok()
                .map(SubscribeReturnCode::Granted),
        }
    }

    pub fn success(&self) -> bool {
        *self != SubscribeReturnCode::Failure
    }
}

impl From<SubscribeReturnCode> for u8 {
    fn from(code: SubscribeReturnCode) -> u8 {
        match code {
            SubscribeReturnCode::Granted(qos) => qos as u8,
            SubscribeReturnCode::Failure => SubscribeReturnCode::FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QoS;

    #[test]
    fn connect_codes() {
        assert_eq!(ConnectReturnCode::from(0), ConnectReturnCode::Accepted);
        assert_eq!(ConnectReturnCode::from(5), ConnectReturnCode::NotAuthorized);
        assert_eq!(ConnectReturnCode::from(6), ConnectReturnCode::Unknown);
        assert!(!ConnectReturnCode::BadUsernameOrPassword.accepted());
    }

    #[test]
    fn subscribe_codes() {
        assert_eq!(
            SubscribeReturnCode::parse(0x01),
            Some(SubscribeReturnCode::Granted(QoS::AtLeastOnce))
        );
        assert_eq!(
            SubscribeReturnCode::parse(0x80),
            Some(SubscribeReturnCode::Failure)
        );
        assert_eq!(SubscribeReturnCode::parse(0x03), None);
        assert_eq!(u8::from(SubscribeReturnCode::Failure), 0x80);
    }
}
