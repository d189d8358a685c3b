//! Single packet type and its wire encoding.
//!
//! A packet on the wire is one kind byte followed by the raw payload. Text
//! packets lead with the ASCII digit `'0' + kind`; binary packets lead with the
//! raw kind number. Transports that cannot carry raw bytes get binary packets
//! wrapped in a base64 envelope: `'b'`, the kind digit, then base64 payload.

use base64::Engine;
use bytes::Bytes;
use std::fmt;

const ERROR_DATA: &[u8] = b"parser error";
const BASE64_MARKER: u8 = b'b';

/// Packet kinds with their fixed wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
    /// Decoder sentinel for malformed input. Never produced by a socket.
    Error,
}

impl PacketKind {
    /// Kinds that may appear on the wire, indexed by code.
    pub const WIRE: [PacketKind; 7] = [
        PacketKind::Open,
        PacketKind::Close,
        PacketKind::Ping,
        PacketKind::Pong,
        PacketKind::Message,
        PacketKind::Upgrade,
        PacketKind::Noop,
    ];

    /// Numeric code. `Error` maps to the first out-of-range code so that it
    /// decodes back into the sentinel.
    pub const fn code(self) -> u8 {
        match self {
            PacketKind::Open => 0,
            PacketKind::Close => 1,
            PacketKind::Ping => 2,
            PacketKind::Pong => 3,
            PacketKind::Message => 4,
            PacketKind::Upgrade => 5,
            PacketKind::Noop => 6,
            PacketKind::Error => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::WIRE.get(usize::from(code)).copied()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PacketKind::Open => "open",
            PacketKind::Close => "close",
            PacketKind::Ping => "ping",
            PacketKind::Pong => "pong",
            PacketKind::Message => "message",
            PacketKind::Upgrade => "upgrade",
            PacketKind::Noop => "noop",
            PacketKind::Error => "error",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed unit of protocol data. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    data: Bytes,
    binary: bool,
}

impl Packet {
    /// Packet with no payload.
    pub fn new(kind: PacketKind) -> Self {
        Self::text(kind, Bytes::new())
    }

    /// Packet whose payload is text (UTF-8 for anything sent by a socket).
    pub fn text(kind: PacketKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
            binary: false,
        }
    }

    /// Packet whose payload is raw bytes.
    pub fn binary(kind: PacketKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
            binary: true,
        }
    }

    /// The sentinel the decoder yields for any malformed input.
    pub fn error() -> Self {
        Self::text(PacketKind::Error, Bytes::from_static(ERROR_DATA))
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn is_error(&self) -> bool {
        self.kind == PacketKind::Error
    }
}

/// Encode one packet. Binary packets fall back to the base64 envelope when the
/// transport cannot carry raw bytes.
pub fn encode_packet(packet: &Packet, supports_binary: bool) -> Vec<u8> {
    if packet.binary && !supports_binary {
        return encode_base64_packet(packet);
    }
    let mut buf = Vec::with_capacity(1 + packet.data.len());
    if packet.binary {
        buf.push(packet.kind.code());
    } else {
        buf.push(b'0' + packet.kind.code());
    }
    buf.extend_from_slice(&packet.data);
    buf
}

fn encode_base64_packet(packet: &Packet) -> Vec<u8> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(&packet.data);
    let mut buf = Vec::with_capacity(2 + encoded.len());
    buf.push(BASE64_MARKER);
    buf.push(b'0' + packet.kind.code());
    buf.extend_from_slice(encoded.as_bytes());
    buf
}

/// Decode one packet. Malformed input yields [`Packet::error`], never a panic.
pub fn decode_packet(data: &[u8]) -> Packet {
    let Some((&first, rest)) = data.split_first() else {
        return Packet::error();
    };
    if first == BASE64_MARKER {
        return decode_base64_packet(rest);
    }
    let (code, binary) = if first >= b'0' {
        (first - b'0', false)
    } else {
        (first, true)
    };
    match PacketKind::from_code(code) {
        Some(kind) => Packet {
            kind,
            data: Bytes::copy_from_slice(rest),
            binary,
        },
        None => Packet::error(),
    }
}

fn decode_base64_packet(data: &[u8]) -> Packet {
    let Some((&digit, encoded)) = data.split_first() else {
        return Packet::error();
    };
    if !digit.is_ascii_digit() {
        return Packet::error();
    }
    let Some(kind) = PacketKind::from_code(digit - b'0') else {
        return Packet::error();
    };
    match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(decoded) => Packet::binary(kind, decoded),
        Err(_) => Packet::error(),
    }
}
