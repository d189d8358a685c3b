//! Payloads: several packets batched into one transmission.
//!
//! Text framing repeats `<len>:<packet>` with the length in ASCII decimal.
//! Binary framing repeats `<marker><digits>255<packet>`. The encoder always
//! writes marker `1`; the decoder also accepts `0`. The length digits are
//! single bytes 0..=9, most significant first.
//!
//! Decoding is all-or-nothing: a payload with any corrupt record produces a
//! single callback carrying [`Packet::error`].

use super::packet::{decode_packet, encode_packet, Packet};

const SEPARATOR: u8 = 255;
const MAX_LENGTH_DIGITS: usize = 10;

/// Encode a batch for one transmission. Binary framing is used only when the
/// transport supports it and some packet actually carries binary data.
pub fn encode_payload(packets: &[Packet], supports_binary: bool) -> Vec<u8> {
    if supports_binary && packets.iter().any(Packet::is_binary) {
        return encode_payload_as_binary(packets);
    }
    if packets.is_empty() {
        return b"0:".to_vec();
    }

    let estimated: usize = packets.iter().map(|p| 6 + p.data().len() * 2).sum();
    let mut buf = Vec::with_capacity(estimated);
    for packet in packets {
        let encoded = encode_packet(packet, false);
        buf.extend_from_slice(encoded.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(&encoded);
    }
    buf
}

/// Binary framing for a batch. An empty batch encodes to an empty buffer.
pub fn encode_payload_as_binary(packets: &[Packet]) -> Vec<u8> {
    let estimated: usize = packets.iter().map(|p| 6 + p.data().len()).sum();
    let mut buf = Vec::with_capacity(estimated);
    for packet in packets {
        let encoded = encode_packet(packet, true);
        buf.push(1);
        push_length_digits(&mut buf, encoded.len());
        buf.push(SEPARATOR);
        buf.extend_from_slice(&encoded);
    }
    buf
}

fn push_length_digits(buf: &mut Vec<u8>, mut length: usize) {
    let mut digits = Vec::with_capacity(MAX_LENGTH_DIGITS);
    loop {
        digits.push((length % 10) as u8);
        length /= 10;
        if length == 0 {
            break;
        }
    }
    buf.extend(digits.iter().rev());
}

/// Decode a payload, calling `callback(packet, index, total)` once per packet
/// in order. Input starting with a byte below `0x20` is binary framing.
pub fn decode_payload<F>(data: &[u8], callback: F)
where
    F: FnMut(Packet, usize, usize),
{
    match data.first() {
        None => deliver(None, callback),
        Some(&first) if first < 0x20 => decode_payload_as_binary(data, callback),
        Some(_) => deliver(parse_text_records(data), callback),
    }
}

/// Decode binary framing with the same callback contract as [`decode_payload`].
pub fn decode_payload_as_binary<F>(data: &[u8], callback: F)
where
    F: FnMut(Packet, usize, usize),
{
    deliver(parse_binary_records(data), callback)
}

fn deliver<F>(records: Option<Vec<Packet>>, mut callback: F)
where
    F: FnMut(Packet, usize, usize),
{
    match records {
        Some(packets) => {
            let total = packets.len();
            for (index, packet) in packets.into_iter().enumerate() {
                callback(packet, index, total);
            }
        }
        None => callback(Packet::error(), 0, 1),
    }
}

fn parse_text_records(data: &[u8]) -> Option<Vec<Packet>> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let colon = rest.iter().position(|&b| b == b':')?;
        let length: usize = std::str::from_utf8(&rest[..colon]).ok()?.parse().ok()?;
        let body = &rest[colon + 1..];
        if length > body.len() {
            return None;
        }
        if length > 0 {
            let packet = decode_packet(&body[..length]);
            if packet.is_error() {
                return None;
            }
            packets.push(packet);
        }
        rest = &body[length..];
    }
    Some(packets)
}

fn parse_binary_records(data: &[u8]) -> Option<Vec<Packet>> {
    let mut packets = Vec::new();
    let mut rest = data;
    while let Some((&marker, work)) = rest.split_first() {
        if marker > 1 {
            return None;
        }
        let separator = work.iter().position(|&b| b == SEPARATOR)?;
        let length = parse_length_digits(&work[..separator])?;
        let body = &work[separator + 1..];
        if length == 0 || length > body.len() as u64 {
            return None;
        }
        let length = length as usize;
        let packet = decode_packet(&body[..length]);
        if packet.is_error() {
            return None;
        }
        packets.push(packet);
        rest = &body[length..];
    }
    Some(packets)
}

fn parse_length_digits(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > MAX_LENGTH_DIGITS {
        return None;
    }
    digits.iter().try_fold(0u64, |acc, &d| {
        (d <= 9).then(|| acc * 10 + u64::from(d))
    })
}
