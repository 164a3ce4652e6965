//! Frame codec for the radio link
//!
//! Every frame on the wire has the layout (all integers big-endian):
//!
//! ```text
//! +------+------+--------+-----------------+--------+
//! | 0x94 | 0xC3 | len:u16| payload[len]    | crc:u16|
//! +------+------+--------+-----------------+--------+
//! payload = tag:u8 | body
//! ```
//!
//! The checksum is CRC-16/CCITT-FALSE over the payload. Mesh packet bodies
//! (text, node info, position, telemetry) start with a fixed
//! [`PacketHeader`]. Strings are length-prefixed UTF-8.
//!
//! [`FrameDecoder`] accumulates raw link bytes and yields decoded messages.
//! A frame with a bad checksum, an oversized length or a truncated body
//! yields a codec error; the decoder then skips the delimiter and scans
//! forward for the next one, so one corrupt frame never costs the frames
//! behind it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::config::{BROADCAST_ADDR, MAX_FRAME_PAYLOAD, MESHTASTIC_MAGIC};
use crate::error::{MeshError, Result};

/// Delimiter + length field
const FRAME_HEADER_LEN: usize = 4;

/// Trailing checksum
const FRAME_CRC_LEN: usize = 2;

/// Encoded size of [`PacketHeader`]
const PACKET_HEADER_LEN: usize = 22;

/// Payload type tags
pub mod tag {
    /// UTF-8 text message
    pub const TEXT: u8 = 1;
    /// Node identity announcement
    pub const NODE_INFO: u8 = 2;
    /// Position report
    pub const POSITION: u8 = 3;
    /// Device telemetry
    pub const TELEMETRY: u8 = 4;
    /// Routing acknowledgment for a packet we sent
    pub const ACK: u8 = 5;
    /// The radio's own node number
    pub const MY_INFO: u8 = 6;
}

/// Routing metadata carried by every mesh packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Source node number
    pub from: u32,
    /// Destination node number (`BROADCAST_ADDR` for channel broadcast)
    pub to: u32,
    /// Packet identifier, unique per sender
    pub packet_id: u32,
    /// Channel index (0-7)
    pub channel: u8,
    /// Remaining hops
    pub hop_limit: u8,
    /// Receive SNR in quarter dB
    pub snr_x4: i16,
    /// Receive RSSI in dBm
    pub rssi: i16,
    /// Receive time, seconds since the epoch (0 when unknown)
    pub rx_time: u32,
}

impl PacketHeader {
    /// Header for a packet we originate
    pub fn outgoing(from: u32, to: u32, channel: u8, hop_limit: u8) -> Self {
        Self {
            from,
            to,
            packet_id: rand::random::<u32>() | 1,
            channel,
            hop_limit,
            snr_x4: 0,
            rssi: 0,
            rx_time: 0,
        }
    }

    /// Check if this packet was a channel broadcast
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDR
    }

    /// Receive SNR in dB
    pub fn snr(&self) -> f32 {
        self.snr_x4 as f32 / 4.0
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.from);
        out.put_u32(self.to);
        out.put_u32(self.packet_id);
        out.put_u8(self.channel);
        out.put_u8(self.hop_limit);
        out.put_i16(self.snr_x4);
        out.put_i16(self.rssi);
        out.put_u32(self.rx_time);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        need(buf, PACKET_HEADER_LEN, "packet header")?;
        Ok(Self {
            from: buf.get_u32(),
            to: buf.get_u32(),
            packet_id: buf.get_u32(),
            channel: buf.get_u8(),
            hop_limit: buf.get_u8(),
            snr_x4: buf.get_i16(),
            rssi: buf.get_i16(),
            rx_time: buf.get_u32(),
        })
    }
}

/// Position report (degrees scaled by 1e7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude * 1e7
    pub latitude_i: i32,
    /// Longitude * 1e7
    pub longitude_i: i32,
    /// Altitude in meters
    pub altitude: i32,
    /// Fix time, seconds since the epoch
    pub time: u32,
}

impl Position {
    /// Latitude in degrees
    pub fn latitude(&self) -> f64 {
        self.latitude_i as f64 * 1e-7
    }

    /// Longitude in degrees
    pub fn longitude(&self) -> f64 {
        self.longitude_i as f64 * 1e-7
    }
}

/// Device telemetry snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Battery level percent (101 = powered)
    pub battery_level: u8,
    /// Battery voltage in millivolts
    pub voltage_mv: u16,
    /// Channel utilization in hundredths of a percent
    pub channel_utilization_x100: u16,
    /// Transmit airtime utilization in hundredths of a percent
    pub air_util_tx_x100: u16,
    /// Seconds since boot
    pub uptime_seconds: u32,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// Text message on a channel or to a node
    Text {
        /// Routing metadata
        header: PacketHeader,
        /// Message text
        text: String,
    },
    /// Node identity
    NodeInfo {
        /// Routing metadata
        header: PacketHeader,
        /// Long display name
        long_name: String,
        /// Short (4 character) name
        short_name: String,
        /// Hardware model code
        hw_model: u8,
    },
    /// Position report
    Position {
        /// Routing metadata
        header: PacketHeader,
        /// Reported position
        position: Position,
    },
    /// Telemetry report
    Telemetry {
        /// Routing metadata
        header: PacketHeader,
        /// Reported metrics
        telemetry: TelemetrySnapshot,
    },
    /// Delivery acknowledgment for a packet we sent
    Ack {
        /// Packet id being acknowledged
        request_id: u32,
        /// Routing error code (0 = delivered)
        error_code: u8,
    },
    /// The connected radio's own node number
    MyInfo {
        /// Local node number
        node_num: u32,
    },
    /// Frame with a tag this codec does not understand
    Unknown {
        /// Payload tag
        tag: u8,
        /// Raw body after the tag
        body: Bytes,
    },
}

impl ProtocolMessage {
    /// Payload tag of this message
    pub fn tag(&self) -> u8 {
        match self {
            ProtocolMessage::Text { .. } => tag::TEXT,
            ProtocolMessage::NodeInfo { .. } => tag::NODE_INFO,
            ProtocolMessage::Position { .. } => tag::POSITION,
            ProtocolMessage::Telemetry { .. } => tag::TELEMETRY,
            ProtocolMessage::Ack { .. } => tag::ACK,
            ProtocolMessage::MyInfo { .. } => tag::MY_INFO,
            ProtocolMessage::Unknown { tag, .. } => *tag,
        }
    }

    /// Routing header, for mesh packets
    pub fn header(&self) -> Option<&PacketHeader> {
        match self {
            ProtocolMessage::Text { header, .. }
            | ProtocolMessage::NodeInfo { header, .. }
            | ProtocolMessage::Position { header, .. }
            | ProtocolMessage::Telemetry { header, .. } => Some(header),
            _ => None,
        }
    }
}

/// Encode a message into a complete frame
pub fn encode(message: &ProtocolMessage) -> Result<Bytes> {
    let mut payload = BytesMut::with_capacity(64);
    payload.put_u8(message.tag());

    match message {
        ProtocolMessage::Text { header, text } => {
            header.encode(&mut payload);
            put_str16(&mut payload, text)?;
        }
        ProtocolMessage::NodeInfo {
            header,
            long_name,
            short_name,
            hw_model,
        } => {
            header.encode(&mut payload);
            put_str8(&mut payload, long_name)?;
            put_str8(&mut payload, short_name)?;
            payload.put_u8(*hw_model);
        }
        ProtocolMessage::Position { header, position } => {
            header.encode(&mut payload);
            payload.put_i32(position.latitude_i);
            payload.put_i32(position.longitude_i);
            payload.put_i32(position.altitude);
            payload.put_u32(position.time);
        }
        ProtocolMessage::Telemetry { header, telemetry } => {
            header.encode(&mut payload);
            payload.put_u8(telemetry.battery_level);
            payload.put_u16(telemetry.voltage_mv);
            payload.put_u16(telemetry.channel_utilization_x100);
            payload.put_u16(telemetry.air_util_tx_x100);
            payload.put_u32(telemetry.uptime_seconds);
        }
        ProtocolMessage::Ack {
            request_id,
            error_code,
        } => {
            payload.put_u32(*request_id);
            payload.put_u8(*error_code);
        }
        ProtocolMessage::MyInfo { node_num } => {
            payload.put_u32(*node_num);
        }
        ProtocolMessage::Unknown { body, .. } => {
            payload.put_slice(body);
        }
    }

    frame_payload(&payload)
}

/// Decode exactly one complete frame
pub fn decode(raw: &[u8]) -> Result<ProtocolMessage> {
    if raw.len() < FRAME_HEADER_LEN + FRAME_CRC_LEN {
        return Err(MeshError::Malformed(format!(
            "frame of {} bytes is shorter than the minimum",
            raw.len()
        )));
    }

    let magic = u16::from_be_bytes([raw[0], raw[1]]);
    if magic != MESHTASTIC_MAGIC {
        return Err(MeshError::Malformed(format!(
            "bad delimiter 0x{:04X}",
            magic
        )));
    }

    let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    if length > MAX_FRAME_PAYLOAD {
        return Err(MeshError::MessageTooLarge {
            size: length,
            max: MAX_FRAME_PAYLOAD,
        });
    }
    let expected_len = FRAME_HEADER_LEN + length + FRAME_CRC_LEN;
    if raw.len() != expected_len {
        return Err(MeshError::Malformed(format!(
            "length field says {} bytes, frame has {}",
            expected_len,
            raw.len()
        )));
    }

    let payload = &raw[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length];
    let carried = u16::from_be_bytes([raw[expected_len - 2], raw[expected_len - 1]]);
    let computed = crc16(payload);
    if carried != computed {
        return Err(MeshError::ChecksumMismatch {
            expected: carried,
            got: computed,
        });
    }

    decode_payload(payload)
}

fn decode_payload(payload: &[u8]) -> Result<ProtocolMessage> {
    let mut buf = payload;
    need(&buf, 1, "tag")?;
    let tag = buf.get_u8();

    let message = match tag {
        tag::TEXT => {
            let header = PacketHeader::decode(&mut buf)?;
            let text = get_str16(&mut buf)?;
            ProtocolMessage::Text { header, text }
        }
        tag::NODE_INFO => {
            let header = PacketHeader::decode(&mut buf)?;
            let long_name = get_str8(&mut buf)?;
            let short_name = get_str8(&mut buf)?;
            need(&buf, 1, "hw model")?;
            let hw_model = buf.get_u8();
            ProtocolMessage::NodeInfo {
                header,
                long_name,
                short_name,
                hw_model,
            }
        }
        tag::POSITION => {
            let header = PacketHeader::decode(&mut buf)?;
            need(&buf, 16, "position")?;
            let position = Position {
                latitude_i: buf.get_i32(),
                longitude_i: buf.get_i32(),
                altitude: buf.get_i32(),
                time: buf.get_u32(),
            };
            ProtocolMessage::Position { header, position }
        }
        tag::TELEMETRY => {
            let header = PacketHeader::decode(&mut buf)?;
            need(&buf, 11, "telemetry")?;
            let telemetry = TelemetrySnapshot {
                battery_level: buf.get_u8(),
                voltage_mv: buf.get_u16(),
                channel_utilization_x100: buf.get_u16(),
                air_util_tx_x100: buf.get_u16(),
                uptime_seconds: buf.get_u32(),
            };
            ProtocolMessage::Telemetry { header, telemetry }
        }
        tag::ACK => {
            need(&buf, 5, "ack")?;
            ProtocolMessage::Ack {
                request_id: buf.get_u32(),
                error_code: buf.get_u8(),
            }
        }
        tag::MY_INFO => {
            need(&buf, 4, "my info")?;
            ProtocolMessage::MyInfo {
                node_num: buf.get_u32(),
            }
        }
        other => {
            trace!(tag = other, "Unknown payload tag");
            let body = Bytes::copy_from_slice(buf);
            buf = &[];
            ProtocolMessage::Unknown { tag: other, body }
        }
    };

    if !buf.is_empty() {
        return Err(MeshError::Malformed(format!(
            "{} trailing bytes after tag {} body",
            buf.len(),
            tag
        )));
    }

    Ok(message)
}

/// Wrap a payload with delimiter, length and checksum
fn frame_payload(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(MeshError::MessageTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len() + FRAME_CRC_LEN);
    frame.put_u16(MESHTASTIC_MAGIC);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    frame.put_u16(crc16(payload));
    Ok(frame.freeze())
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.len() < n {
        return Err(MeshError::Malformed(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            buf.len()
        )));
    }
    Ok(())
}

fn put_str8(out: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u8::MAX as usize {
        return Err(MeshError::MessageTooLarge {
            size: s.len(),
            max: u8::MAX as usize,
        });
    }
    out.put_u8(s.len() as u8);
    out.put_slice(s.as_bytes());
    Ok(())
}

fn put_str16(out: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > MAX_FRAME_PAYLOAD {
        return Err(MeshError::MessageTooLarge {
            size: s.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
    Ok(())
}

fn get_str8(buf: &mut &[u8]) -> Result<String> {
    need(buf, 1, "string length")?;
    let len = buf.get_u8() as usize;
    take_str(buf, len)
}

fn get_str16(buf: &mut &[u8]) -> Result<String> {
    need(buf, 2, "string length")?;
    let len = buf.get_u16() as usize;
    take_str(buf, len)
}

fn take_str(buf: &mut &[u8], len: usize) -> Result<String> {
    need(buf, len, "string")?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| MeshError::Malformed(format!("invalid utf-8: {}", e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

/// Streaming decoder with resynchronization
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_PAYLOAD * 2),
        }
    }

    /// Append raw link bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes waiting for a complete frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame (used after a reconnect)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Decode the next frame, if a complete one is buffered
    ///
    /// `Some(Err(_))` reports a malformed frame; decoding may continue with
    /// the next call.
    pub fn next_frame(&mut self) -> Option<Result<ProtocolMessage>> {
        if !self.sync_to_magic() {
            return None;
        }
        if self.buffer.len() < FRAME_HEADER_LEN {
            return None;
        }

        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if length > MAX_FRAME_PAYLOAD {
            warn!(length, "Frame length too large, likely corrupt");
            self.buffer.advance(2);
            return Some(Err(MeshError::MessageTooLarge {
                size: length,
                max: MAX_FRAME_PAYLOAD,
            }));
        }

        let total = FRAME_HEADER_LEN + length + FRAME_CRC_LEN;
        if self.buffer.len() < total {
            // A corrupt length can claim bytes that belong to later frames
            if let Some(pos) = self.later_valid_frame() {
                warn!(
                    claimed = total,
                    skipped = pos,
                    "Frame stalled behind a valid frame, resynchronizing"
                );
                self.buffer.advance(pos);
                return Some(Err(MeshError::Malformed(format!(
                    "length field claims {} bytes but a valid frame starts at offset {}",
                    total, pos
                ))));
            }
            trace!(
                have = self.buffer.len(),
                need = total,
                "Waiting for complete frame"
            );
            return None;
        }

        match decode(&self.buffer[..total]) {
            Ok(message) => {
                self.buffer.advance(total);
                Some(Ok(message))
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame, resynchronizing");
                // Skip only the delimiter; the length may be the corrupt part
                self.buffer.advance(2);
                Some(Err(e))
            }
        }
    }

    /// Decode every complete frame currently buffered
    pub fn drain(&mut self) -> Vec<Result<ProtocolMessage>> {
        let mut out = Vec::new();
        while let Some(item) = self.next_frame() {
            out.push(item);
        }
        out
    }

    /// Advance to the next delimiter; false when more bytes are needed
    fn sync_to_magic(&mut self) -> bool {
        if self.buffer.len() < 2 {
            return false;
        }
        if u16::from_be_bytes([self.buffer[0], self.buffer[1]]) == MESHTASTIC_MAGIC {
            return true;
        }

        match self.find_magic() {
            Some(pos) => {
                trace!(discarded = pos, "Discarding bytes before delimiter");
                self.buffer.advance(pos);
                true
            }
            None => {
                // Keep a trailing first delimiter byte, it may be half of one
                let keep = usize::from(self.buffer.last() == Some(&0x94));
                let discard = self.buffer.len() - keep;
                if discard > 0 {
                    trace!(discarded = discard, "Discarding buffer without delimiter");
                    self.buffer.advance(discard);
                }
                false
            }
        }
    }

    /// Offset of the first later delimiter that starts a complete, valid frame
    fn later_valid_frame(&self) -> Option<usize> {
        let mut from = 2;
        while let Some(rel) = self.buffer[from..]
            .windows(2)
            .position(|w| w[0] == 0x94 && w[1] == 0xC3)
        {
            let pos = from + rel;
            let rest = &self.buffer[pos..];
            if rest.len() >= FRAME_HEADER_LEN {
                let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
                let total = FRAME_HEADER_LEN + length + FRAME_CRC_LEN;
                if length <= MAX_FRAME_PAYLOAD
                    && rest.len() >= total
                    && decode(&rest[..total]).is_ok()
                {
                    return Some(pos);
                }
            }
            from = pos + 1;
        }
        None
    }

    fn find_magic(&self) -> Option<usize> {
        self.buffer
            .windows(2)
            .position(|w| w[0] == 0x94 && w[1] == 0xC3)
    }
}
