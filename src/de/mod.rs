pub(crate) mod deserializer;
mod packet_reader;
mod received_packet;
pub(crate) use packet_reader::PacketReader;
