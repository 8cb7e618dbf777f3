//! MQTT "Variable Byte Integer" support.
//!
//! Seven bits of value per byte, least significant group first, with the top bit of every byte
//! except the last set as a continuation marker. At most four bytes are permitted.
use heapless::Vec;
use varint_rs::{VarintReader, VarintWriter};

/// The largest value representable with a four byte variable integer.
pub const MAX_VARINT: u32 = 268_435_455;

/// The largest number of bytes a variable integer may occupy.
pub const MAX_VARINT_SIZE: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Varint(pub u32);

impl From<u32> for Varint {
    fn from(val: u32) -> Varint {
        Varint(val)
    }
}

/// Scratch storage for an encoded variable integer.
pub struct VarintBuffer {
    pub data: Vec<u8, MAX_VARINT_SIZE>,
}

impl VarintBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }
}

impl VarintWriter for VarintBuffer {
    type Error = ();
    fn write(&mut self, byte: u8) -> Result<(), ()> {
        self.data.push(byte).map_err(|_| ())
    }
}

/// Probe a buffer for a complete variable integer.
///
/// # Returns
/// * `Ok(Some((value, size)))` if a complete integer was found.
/// * `Ok(None)` if more bytes are required.
/// * `Err(())` if the integer exceeds four bytes.
pub fn probe(data: &[u8]) -> Result<Option<(usize, usize)>, ()> {
    let mut value = 0usize;
    for (index, byte) in data.iter().enumerate() {
        if index >= MAX_VARINT_SIZE {
            return Err(());
        }

        value |= ((byte & 0x7F) as usize) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }

    if data.len() >= MAX_VARINT_SIZE {
        Err(())
    } else {
        Ok(None)
    }
}

struct VarintVisitor;

struct VarintParser<'de, T: serde::de::SeqAccess<'de>> {
    seq: T,
    _data: core::marker::PhantomData<&'de ()>,
}

impl<'de, T: serde::de::SeqAccess<'de>> VarintReader for VarintParser<'de, T> {
    type Error = T::Error;

    fn read(&mut self) -> Result<u8, T::Error> {
        use serde::de::Error;
        let next = self.seq.next_element()?;
        next.ok_or_else(|| T::Error::custom("Invalid varint"))
    }
}

impl<'de> serde::de::Visitor<'de> for VarintVisitor {
    type Value = Varint;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(formatter, "Varint")
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, seq: A) -> Result<Self::Value, A::Error> {
        let mut reader = VarintParser {
            seq,
            _data: core::marker::PhantomData,
        };
        Ok(Varint(reader.read_u32_varint()?))
    }
}

impl<'de> serde::de::Deserialize<'de> for Varint {
    fn deserialize<D: serde::de::Deserializer<'de>>(deserializer: D) -> Result<Varint, D::Error> {
        deserializer.deserialize_tuple(MAX_VARINT_SIZE, VarintVisitor)
    }
}
