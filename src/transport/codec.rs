//! Wire frame codec
//!
//! Every frame is `[control byte][remaining length][body]`. The high nibble
//! of the control byte selects the operation. The remaining length uses the
//! MQTT variable-length encoding, which is a single byte for bodies shorter
//! than 128 bytes.
//!
//! | type | nibble | body |
//! |------|--------|------|
//! | CONNECT | 1 | ignored by the broker |
//! | CONNACK | 2 | `[0x00, return code]` |
//! | PUBLISH | 3 | `[topic len u16][topic][payload]` |
//! | SUBSCRIBE | 8 | `[packet id u16][topic len u16][topic][qos]` |
//! | SUBACK | 9 | `[packet id u16][granted qos]` |
//! | PINGREQ / PINGRESP | 12 / 13 | empty |
//! | DISCONNECT | 14 | empty |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::utils::error::{BrokerError, DecodeError};

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const SUBSCRIBE: u8 = 8;
pub const SUBACK: u8 = 9;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

pub const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
pub const PINGREQ_FRAME: [u8; 2] = [0xC0, 0x00];
pub const PINGRESP_FRAME: [u8; 2] = [0xD0, 0x00];
pub const DISCONNECT_FRAME: [u8; 2] = [0xE0, 0x00];

const RETAIN_FLAG: u8 = 0x01;
const MAX_REMAINING_LENGTH: usize = 268_435_455;
const READ_CHUNK: usize = 1024;

/// One undecoded frame. `raw` holds the exact bytes received, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub control: u8,
    pub body: Bytes,
    pub raw: Bytes,
}

impl Frame {
    pub fn packet_type(&self) -> u8 {
        self.control >> 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect,
    ConnAck { return_code: u8 },
    Publish {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    Subscribe { packet_id: u16, filter: String },
    SubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
    /// Recognised framing, unsupported operation.
    Unsupported(u8),
}

pub fn encode_remaining_length(mut len: usize, buf: &mut BytesMut) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decodes a remaining length starting at `buf[0]`. Returns the value and the
/// number of bytes it occupied, or `None` when more bytes are needed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(DecodeError::LengthOverflow);
        }
        value += (*byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        return Err(DecodeError::LengthOverflow);
    }
    Ok(None)
}

/// Splits one complete frame off the front of `buf`, leaving any following
/// bytes in place. Returns `None` until a whole frame has arrived.
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let Some((remaining, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };
    let header = 1 + len_bytes;
    if buf.len() < header + remaining {
        return Ok(None);
    }

    let raw = buf.split_to(header + remaining).freeze();
    Ok(Some(Frame {
        control: raw[0],
        body: raw.slice(header..),
        raw,
    }))
}

/// Reads the next whole frame from `reader`, buffering partial input in `buf`.
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>, BrokerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = split_frame(buf)? {
            return Ok(Some(frame));
        }
        buf.reserve(READ_CHUNK);
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(DecodeError::Truncated {
                needed: buf.len() + 1,
                available: buf.len(),
            }
            .into());
        }
    }
}

pub fn decode_packet(frame: &Frame) -> Result<Packet, DecodeError> {
    let mut body = frame.body.clone();
    match frame.packet_type() {
        CONNECT => Ok(Packet::Connect),
        CONNACK => {
            ensure(&body, 2)?;
            Ok(Packet::ConnAck {
                return_code: body[1],
            })
        }
        PUBLISH => {
            let topic = take_string(&mut body)?;
            // QoS > 0 carries a packet id between topic and payload
            if (frame.control >> 1) & 0x03 > 0 {
                ensure(&body, 2)?;
                body.advance(2);
            }
            Ok(Packet::Publish {
                topic,
                payload: body,
                retain: frame.control & RETAIN_FLAG != 0,
            })
        }
        SUBSCRIBE => {
            ensure(&body, 2)?;
            let packet_id = body.get_u16();
            let filter = take_string(&mut body)?;
            Ok(Packet::Subscribe { packet_id, filter })
        }
        SUBACK => {
            ensure(&body, 2)?;
            Ok(Packet::SubAck {
                packet_id: body.get_u16(),
            })
        }
        PINGREQ => Ok(Packet::PingReq),
        PINGRESP => Ok(Packet::PingResp),
        DISCONNECT => Ok(Packet::Disconnect),
        other => Ok(Packet::Unsupported(other)),
    }
}

pub fn encode_publish(topic: &str, payload: &[u8], retain: bool) -> Bytes {
    let remaining = 2 + topic.len() + payload.len();
    let flags = if retain { RETAIN_FLAG } else { 0 };
    let mut buf = BytesMut::with_capacity(remaining + 5);
    buf.put_u8((PUBLISH << 4) | flags);
    encode_remaining_length(remaining, &mut buf);
    buf.put_u16(topic.len() as u16);
    buf.put_slice(topic.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// SUBSCRIBE with the reserved flag bits set and a QoS 0 request.
pub fn encode_subscribe(packet_id: u16, filter: &str) -> Bytes {
    let remaining = 2 + 2 + filter.len() + 1;
    let mut buf = BytesMut::with_capacity(remaining + 5);
    buf.put_u8((SUBSCRIBE << 4) | 0x02);
    encode_remaining_length(remaining, &mut buf);
    buf.put_u16(packet_id);
    buf.put_u16(filter.len() as u16);
    buf.put_slice(filter.as_bytes());
    buf.put_u8(0x00);
    buf.freeze()
}

pub fn encode_suback(packet_id: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(SUBACK << 4);
    buf.put_u8(0x03);
    buf.put_u16(packet_id);
    buf.put_u8(0x00);
    buf.freeze()
}

/// MQTT 3.1.1 CONNECT with a clean session, so external brokers accept it.
pub fn encode_connect(client_id: &str, keep_alive_secs: u16) -> Bytes {
    let remaining = 10 + 2 + client_id.len();
    let mut buf = BytesMut::with_capacity(remaining + 5);
    buf.put_u8(CONNECT << 4);
    encode_remaining_length(remaining, &mut buf);
    buf.put_u16(4);
    buf.put_slice(b"MQTT");
    buf.put_u8(4);
    buf.put_u8(0x02);
    buf.put_u16(keep_alive_secs);
    buf.put_u16(client_id.len() as u16);
    buf.put_slice(client_id.as_bytes());
    buf.freeze()
}

/// Rejects frames whose encoded body would not fit the length field.
pub fn check_frame_size(topic: &str, payload: &[u8]) -> Result<(), DecodeError> {
    check_string_len(topic)?;
    if 2 + topic.len() + payload.len() > MAX_REMAINING_LENGTH {
        return Err(DecodeError::LengthOverflow);
    }
    Ok(())
}

/// Topics, filters and client ids carry a two-byte length prefix.
pub fn check_string_len(value: &str) -> Result<(), DecodeError> {
    if value.len() > u16::MAX as usize {
        return Err(DecodeError::LengthOverflow);
    }
    Ok(())
}

fn ensure(body: &Bytes, needed: usize) -> Result<(), DecodeError> {
    if body.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: body.len(),
        });
    }
    Ok(())
}

fn take_string(body: &mut Bytes) -> Result<String, DecodeError> {
    ensure(body, 2)?;
    let len = body.get_u16() as usize;
    ensure(body, len)?;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}
