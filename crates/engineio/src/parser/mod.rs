//! Packet and payload codec.

mod packet;
mod payload;

pub use packet::{decode_packet, encode_packet, Packet, PacketKind};
pub use payload::{decode_payload, decode_payload_as_binary, encode_payload, encode_payload_as_binary};
