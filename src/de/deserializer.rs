//! MQTT control packet deserializer
//!
//! # Design
//! The deserializer walks a single contiguous buffer that holds exactly one control packet.
//!
//! ### Integers
//! All unsigned integers are transmitted in a fixed-width, big-endian notation.
//!
//! ### Binary data and strings
//! Binary data and strings are prefixed with a 16-bit integer denoting their size. Strings must
//! be valid UTF-8.
//!
//! ### Tuples and structs
//! Tuples read at most N consecutive elements. Structs are mapped to tuples of their fields.
//!
//! Other types are rejected with [Error::Unsupported].
use serde::de::{DeserializeSeed, Visitor};

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Error {
    /// A custom deserialization error occurred.
    Custom,

    /// An invalid string was encountered, where UTF-8 decoding failed.
    BadString,

    /// An invalid boolean was encountered, which did not use "0" or "1" to encode its value.
    BadBool,

    /// There was not sufficient data to deserialize the required datatype.
    InsufficientData,

    /// The requested data type has no MQTT representation.
    Unsupported,
}

impl serde::ser::StdError for Error {}

impl serde::de::Error for Error {
    fn custom<T: core::fmt::Display>(_msg: T) -> Self {
        error!("{}", _msg);
        Error::Custom
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Error::Custom => "Custom deserialization error",
                Error::BadString => "Improper UTF-8 string encountered",
                Error::BadBool => "Bad boolean encountered",
                Error::InsufficientData => "Not enough data in the packet",
                Error::Unsupported => "Unsupported data type",
            }
        )
    }
}

/// Deserializes a byte buffer into an MQTT control packet.
pub struct MqttDeserializer<'a> {
    buf: &'a [u8],
    index: usize,
}

impl<'a> MqttDeserializer<'a> {
    /// Construct a deserializer from a provided data buffer.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, index: 0 }
    }

    /// Attempt to take N bytes from the buffer.
    pub fn try_take_n(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.len() < n {
            return Err(Error::InsufficientData);
        }

        let data = &self.buf[self.index..][..n];
        self.index += n;
        Ok(data)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut data = [0u8; N];
        data.copy_from_slice(self.try_take_n(N)?);
        Ok(data)
    }

    /// Pop a single byte from the data buffer.
    pub fn pop(&mut self) -> Result<u8, Error> {
        let [byte] = self.take_array::<1>()?;
        Ok(byte)
    }

    /// Read a 16-bit integer from the data buffer.
    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    /// The number of bytes that have not been deserialized yet.
    pub fn len(&self) -> usize {
        self.buf.len() - self.index
    }

    /// Extract any remaining data from the buffer.
    ///
    /// # Note
    /// This is intended to be used after deserialization has completed.
    pub fn remainder(&self) -> &'a [u8] {
        &self.buf[self.index..]
    }
}

impl<'a> varint_rs::VarintReader for MqttDeserializer<'a> {
    type Error = Error;

    fn read(&mut self) -> Result<u8, Error> {
        self.pop()
    }
}

impl<'de, 'a> serde::de::Deserializer<'de> for &'a mut MqttDeserializer<'de> {
    type Error = Error;

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        let val = match self.pop()? {
            0 => false,
            1 => true,
            _ => return Err(Error::BadBool),
        };
        visitor.visit_bool(val)
    }

    fn deserialize_i8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_i8(self.pop()? as i8)
    }

    fn deserialize_i16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_i16(i16::from_be_bytes(self.take_array()?))
    }

    fn deserialize_i32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_i32(i32::from_be_bytes(self.take_array()?))
    }

    fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_u8(self.pop()?)
    }

    fn deserialize_u16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_u16(self.read_u16()?)
    }

    fn deserialize_u32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_u32(u32::from_be_bytes(self.take_array()?))
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        let length = self.read_u16()?;
        let bytes: &'de [u8] = self.try_take_n(length as usize)?;
        let string = core::str::from_utf8(bytes).map_err(|_| Error::BadString)?;
        visitor.visit_borrowed_str(string)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        let length = self.read_u16()?;
        let bytes: &'de [u8] = self.try_take_n(length as usize)?;
        visitor.visit_borrowed_bytes(bytes)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        // An option is present if there is remaining data.
        if self.len() == 0 {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_seq(ElementAccess {
            deserializer: self,
            count: len,
        })
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_tuple(fields.len(), visitor)
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Self::Error> {
        Err(Error::Unsupported)
    }

    serde::forward_to_deserialize_any! {
        i64 u64 f32 f64 char unit seq map enum newtype_struct identifier ignored_any
    }
}

/// Structure used to access a specified number of elements.
struct ElementAccess<'a, 'de: 'a> {
    deserializer: &'a mut MqttDeserializer<'de>,
    count: usize,
}

impl<'a, 'de: 'a> serde::de::SeqAccess<'de> for ElementAccess<'a, 'de> {
    type Error = Error;

    fn next_element_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> Result<Option<V::Value>, Error> {
        if self.count > 0 {
            self.count -= 1;
            let data = DeserializeSeed::deserialize(seed, &mut *self.deserializer)?;
            Ok(Some(data))
        } else {
            Ok(None)
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BinaryData, Utf8String};
    use serde::Deserialize;

    #[test]
    fn integers_are_big_endian() {
        let mut de = MqttDeserializer::new(&[0x12, 0x34, 0xFF]);
        assert_eq!(u16::deserialize(&mut de).unwrap(), 0x1234);
        assert_eq!(u8::deserialize(&mut de).unwrap(), 0xFF);
        assert_eq!(u8::deserialize(&mut de), Err(Error::InsufficientData));
    }

    #[test]
    fn prefixed_data() {
        let data = [0x00, 0x01, b'a', 0x00, 0x02, 0xAB, 0xCD, 0x55];
        let mut de = MqttDeserializer::new(&data);
        assert_eq!(Utf8String::deserialize(&mut de).unwrap(), Utf8String("a"));
        assert_eq!(
            BinaryData::deserialize(&mut de).unwrap(),
            BinaryData(&[0xAB, 0xCD])
        );
        assert_eq!(de.remainder(), [0x55]);
    }

    #[test]
    fn invalid_utf8() {
        let mut de = MqttDeserializer::new(&[0x00, 0x02, 0xC3, 0x28]);
        assert_eq!(Utf8String::deserialize(&mut de), Err(Error::BadString));
    }

    #[test]
    fn truncated_string() {
        let mut de = MqttDeserializer::new(&[0x00, 0x05, b'a']);
        assert_eq!(
            Utf8String::deserialize(&mut de),
            Err(Error::InsufficientData)
        );
    }
}
