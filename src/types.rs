//! Length-prefixed MQTT data types.
use serde::ser::SerializeStruct;

/// MQTT "Binary Data": a blob prefixed by its 16-bit big-endian length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BinaryData<'a>(pub &'a [u8]);

impl<'a> serde::Serialize for BinaryData<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;
        let len = u16::try_from(self.0.len())
            .map_err(|_| S::Error::custom("Binary data exceeds 65535 bytes"))?;
        let mut item = serializer.serialize_struct("_BinaryData", 0)?;
        item.serialize_field("_len", &len)?;
        item.serialize_field("_data", self.0)?;
        item.end()
    }
}

struct BinaryDataVisitor;

impl<'de> serde::de::Visitor<'de> for BinaryDataVisitor {
    type Value = BinaryData<'de>;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(formatter, "BinaryData")
    }

    fn visit_borrowed_bytes<E: serde::de::Error>(self, data: &'de [u8]) -> Result<Self::Value, E> {
        Ok(BinaryData(data))
    }
}

impl<'de> serde::de::Deserialize<'de> for BinaryData<'de> {
    fn deserialize<D: serde::de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(BinaryDataVisitor)
    }
}

/// MQTT "UTF-8 Encoded String": a string prefixed by its 16-bit big-endian length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Utf8String<'a>(pub &'a str);

impl<'a> serde::Serialize for Utf8String<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;
        let len = u16::try_from(self.0.len())
            .map_err(|_| S::Error::custom("String exceeds 65535 bytes"))?;
        let mut item = serializer.serialize_struct("_Utf8String", 0)?;
        item.serialize_field("_len", &len)?;
        item.serialize_field("_string", self.0)?;
        item.end()
    }
}

struct Utf8StringVisitor<'a> {
    _data: core::marker::PhantomData<&'a ()>,
}

impl<'a, 'de: 'a> serde::de::Visitor<'de> for Utf8StringVisitor<'a> {
    type Value = Utf8String<'a>;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(formatter, "Utf8String")
    }

    fn visit_borrowed_str<E: serde::de::Error>(self, data: &'de str) -> Result<Self::Value, E> {
        Ok(Utf8String(data))
    }
}

impl<'a, 'de: 'a> serde::de::Deserialize<'de> for Utf8String<'a> {
    fn deserialize<D: serde::de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(Utf8StringVisitor {
            _data: core::marker::PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ser::MqttSerializer;
    use serde::Serialize;

    #[test]
    fn strings_are_length_prefixed() {
        let mut buffer = [0u8; 16];
        let mut serializer = MqttSerializer::new_without_header(&mut buffer);
        Utf8String("a/b").serialize(&mut serializer).unwrap();
        assert_eq!(serializer.finish(), [0x00, 0x03, b'a', b'/', b'b']);
    }

    #[test]
    fn binary_data_is_length_prefixed() {
        let mut buffer = [0u8; 16];
        let mut serializer = MqttSerializer::new_without_header(&mut buffer);
        BinaryData(&[0xAB, 0xCD]).serialize(&mut serializer).unwrap();
        assert_eq!(serializer.finish(), [0x00, 0x02, 0xAB, 0xCD]);
    }
}
