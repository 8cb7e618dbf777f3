//! MQTT control packet serializer
//!
//! # Design
//! Data is encoded linearly into a caller-provided buffer with every integer in big-endian byte
//! order. The serializer knows nothing about MQTT data types: length prefixes for strings and
//! binary data are emitted by the [crate::types] wrappers.
//!
//! The first bytes of the buffer are reserved for the fixed header, which is written once the size
//! of the rest of the packet is known.
//!
//! # Supported Data Types
//! * Unsigned and signed integers
//! * Booleans, encoded as a single byte
//! * Strings and bytes, encoded without any prefix
//! * Options, where `None` encodes nothing
//! * Sequences, tuples and structs, encoded as their concatenated members
//!
//! Every other data type fails with [EncodeError::InvalidField].
use crate::error::EncodeError;
use crate::message_types::{ControlPacket, MessageType};
use crate::varint::{VarintBuffer, MAX_VARINT};
use bit_field::BitField;
use serde::{ser::Impossible, Serialize};
use varint_rs::VarintWriter;

/// The maximum size of the MQTT fixed header in bytes: the header byte and a four byte remaining
/// length.
pub const MAX_FIXED_HEADER_SIZE: usize = 5;

/// Serializes MQTT data into a buffer.
pub struct MqttSerializer<'a> {
    buf: &'a mut [u8],
    index: usize,
    with_header: bool,
}

impl<'a> MqttSerializer<'a> {
    /// Construct a serializer that reserves space for the fixed header.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            index: MAX_FIXED_HEADER_SIZE,
            with_header: true,
        }
    }

    /// Construct a serializer for bare data without a fixed header.
    pub fn new_without_header(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            index: 0,
            with_header: false,
        }
    }

    /// Return the data serialized so far, without any header.
    pub fn finish(self) -> &'a [u8] {
        debug_assert!(!self.with_header);
        &self.buf[..self.index]
    }

    /// Encode an MQTT control packet into a buffer.
    ///
    /// # Args
    /// * `buf` - The buffer to encode data into.
    /// * `packet` - The packet to encode.
    ///
    /// # Returns
    /// The slice of `buf` holding the complete packet.
    pub fn to_buffer<T: Serialize + ControlPacket>(
        buf: &'a mut [u8],
        packet: &T,
    ) -> Result<&'a [u8], EncodeError> {
        let mut serializer = Self::new(buf);
        packet.serialize(&mut serializer)?;
        serializer.finalize(T::MESSAGE_TYPE, packet.fixed_header_flags())
    }

    /// Finalize the packet, prepending the MQTT fixed header.
    ///
    /// # Args
    /// * `typ` - The MQTT message type of the encoded packet.
    /// * `flags` - The lower nibble of the fixed header.
    pub fn finalize(self, typ: MessageType, flags: u8) -> Result<&'a [u8], EncodeError> {
        if self.buf.len() < MAX_FIXED_HEADER_SIZE {
            return Err(EncodeError::BufferTooSmall);
        }

        let len = self.index - MAX_FIXED_HEADER_SIZE;
        if len > MAX_VARINT as usize {
            return Err(EncodeError::InvalidField);
        }

        let mut buffer = VarintBuffer::new();
        buffer
            .write_u32_varint(len as u32)
            .map_err(|_| EncodeError::InvalidField)?;

        let offset = MAX_FIXED_HEADER_SIZE - buffer.data.len() - 1;
        self.buf[offset + 1..MAX_FIXED_HEADER_SIZE].copy_from_slice(&buffer.data);
        self.buf[offset] = *0u8.set_bits(4..8, typ as u8).set_bits(0..4, flags);

        Ok(&self.buf[offset..self.index])
    }

    /// Append data to the packet.
    pub fn push_bytes(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        trace!("Pushing {:?}", data);
        if self.buf.len().saturating_sub(self.index) < data.len() {
            return Err(EncodeError::BufferTooSmall);
        }

        self.buf[self.index..][..data.len()].copy_from_slice(data);
        self.index += data.len();

        Ok(())
    }

    /// Append a single byte to the packet.
    pub fn push(&mut self, byte: u8) -> Result<(), EncodeError> {
        if self.index >= self.buf.len() {
            return Err(EncodeError::BufferTooSmall);
        }
        self.buf[self.index] = byte;
        self.index += 1;

        Ok(())
    }
}

impl<'a> serde::Serializer for &mut MqttSerializer<'a> {
    type Ok = ();
    type Error = EncodeError;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeStruct = Self;
    type SerializeTupleStruct = Impossible<(), EncodeError>;
    type SerializeTupleVariant = Impossible<(), EncodeError>;
    type SerializeMap = Impossible<(), EncodeError>;
    type SerializeStructVariant = Impossible<(), EncodeError>;

    fn serialize_bool(self, v: bool) -> Result<Self::Ok, Self::Error> {
        self.push(v as u8)
    }

    fn serialize_i8(self, v: i8) -> Result<Self::Ok, Self::Error> {
        self.push(v as u8)
    }

    fn serialize_i16(self, v: i16) -> Result<Self::Ok, Self::Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_i32(self, v: i32) -> Result<Self::Ok, Self::Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_i64(self, v: i64) -> Result<Self::Ok, Self::Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_u8(self, v: u8) -> Result<Self::Ok, Self::Error> {
        self.push(v)
    }

    fn serialize_u16(self, v: u16) -> Result<Self::Ok, Self::Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_u32(self, v: u32) -> Result<Self::Ok, Self::Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_u64(self, v: u64) -> Result<Self::Ok, Self::Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_str(self, v: &str) -> Result<Self::Ok, Self::Error> {
        self.serialize_bytes(v.as_bytes())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Self::Ok, Self::Error> {
        self.push_bytes(v)
    }

    fn serialize_none(self) -> Result<(), EncodeError> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), EncodeError> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        value.serialize(self)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), EncodeError> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, EncodeError> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, EncodeError> {
        Ok(self)
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, EncodeError> {
        Ok(self)
    }

    fn serialize_char(self, _v: char) -> Result<Self::Ok, Self::Error> {
        Err(EncodeError::InvalidField)
    }

    fn serialize_unit(self) -> Result<(), EncodeError> {
        Err(EncodeError::InvalidField)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<(), EncodeError> {
        Err(EncodeError::InvalidField)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<(), EncodeError> {
        Err(EncodeError::InvalidField)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, EncodeError> {
        Err(EncodeError::InvalidField)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, EncodeError> {
        Err(EncodeError::InvalidField)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, EncodeError> {
        Err(EncodeError::InvalidField)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, EncodeError> {
        Err(EncodeError::InvalidField)
    }

    fn collect_str<T: ?Sized>(self, _value: &T) -> Result<Self::Ok, EncodeError> {
        Err(EncodeError::InvalidField)
    }

    fn serialize_f32(self, _v: f32) -> Result<Self::Ok, Self::Error> {
        Err(EncodeError::InvalidField)
    }

    fn serialize_f64(self, _v: f64) -> Result<Self::Ok, Self::Error> {
        Err(EncodeError::InvalidField)
    }
}

impl<'a> serde::ser::SerializeStruct for &'a mut MqttSerializer<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}

impl<'a> serde::ser::SerializeSeq for &'a mut MqttSerializer<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}

impl<'a> serde::ser::SerializeTuple for &'a mut MqttSerializer<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}
