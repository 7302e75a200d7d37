//! Tuya wire protocol implementation.
//! Handles 55AA packet framing, header parsing, CRC/HMAC verification and
//! splitting a read buffer into packets.

use crate::crypto::{HMAC_LEN, hmac_sha256, verify_hmac_sha256};
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use serde_json::Value;
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const SUFFIX_55AA: u32 = 0x0000AA55;

const PREFIX_BYTES: [u8; 4] = PREFIX_55AA.to_be_bytes();
const SUFFIX_BYTES: [u8; 4] = SUFFIX_55AA.to_be_bytes();

/// Prefix(4) + Seq(4) + Cmd(4) + Len(4)
pub const HEADER_SIZE: usize = 16;
/// Header plus CRC(4) and suffix(4) with an empty body.
pub const MIN_PACKET_LEN: usize = 24;
pub const RETCODE_LEN: usize = 4;
/// CRC(4) + suffix(4)
pub const CRC_TRAILER_LEN: usize = 8;
/// HMAC(32) + suffix(4)
pub const HMAC_TRAILER_LEN: usize = HMAC_LEN + 4;
/// `"3.x"` followed by 12 zero bytes.
pub const VERSION_HEADER_LEN: usize = 15;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

define_command_type! {
    Udp = 0x00,
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
    DpQueryNew = 0x10,
    UpdateDps = 0x12,
    UdpNew = 0x13,
    BroadcastLpv34 = 0x23,
}

define_version! {
    V3_1 = ("3.1", 3.1),
    V3_2 = ("3.2", 3.2),
    V3_3 = ("3.3", 3.3),
    V3_4 = ("3.4", 3.4),
}

impl Default for Version {
    fn default() -> Self {
        Version::V3_3
    }
}

impl CommandType {
    /// Commands that never carry the 15-byte version header.
    pub const UNVERSIONED: &'static [CommandType] = &[
        CommandType::HeartBeat,
        CommandType::DpQuery,
        CommandType::DpQueryNew,
        CommandType::SessKeyNegStart,
        CommandType::SessKeyNegResp,
        CommandType::SessKeyNegFinish,
        CommandType::UpdateDps,
    ];

    /// LAN broadcasts, CRC-framed at every revision.
    pub const DISCOVERY: &'static [CommandType] = &[
        CommandType::Udp,
        CommandType::UdpNew,
        CommandType::BroadcastLpv34,
    ];

    pub fn is_versioned_code(cmd: u32) -> bool {
        !Self::UNVERSIONED.iter().any(|c| *c as u32 == cmd)
    }

    pub fn is_discovery_code(cmd: u32) -> bool {
        Self::DISCOVERY.iter().any(|c| *c as u32 == cmd)
    }
}

/// Tuya protocol message structure (a logical frame).
///
/// `payload` is plaintext from the caller's side; the codec applies and removes
/// encryption.
#[derive(Debug, Clone, PartialEq)]
pub struct TuyaMessage {
    /// Protocol revision the frame belongs to
    pub version: Version,
    /// Sequence number, written as 0 when absent
    pub seqno: Option<u32>,
    /// Command code
    pub cmd: u32,
    /// Return code, only present on device-originated frames
    pub retcode: Option<u32>,
    pub payload: Vec<u8>,
}

impl TuyaMessage {
    pub fn new(version: Version, cmd: impl Into<u32>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            seqno: None,
            cmd: cmd.into(),
            retcode: None,
            payload: payload.into(),
        }
    }

    pub fn with_seqno(mut self, seqno: u32) -> Self {
        self.seqno = Some(seqno);
        self
    }

    pub fn with_retcode(mut self, retcode: u32) -> Self {
        self.retcode = Some(retcode);
        self
    }

    pub fn command(&self) -> Option<CommandType> {
        CommandType::from_u32(self.cmd)
    }

    /// Payload parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Tuya protocol header structure
#[derive(Debug, Clone, PartialEq)]
pub struct TuyaHeader {
    pub seqno: u32,
    pub cmd: u32,
    /// Declared length: everything after the header, trailer included
    pub payload_len: u32,
    /// Header plus declared length
    pub total_length: usize,
}

/// Pack a message whose payload is already in wire form.
/// If hmac_key is provided, uses HMAC-SHA256; otherwise, uses CRC32.
pub fn pack_message(msg: &TuyaMessage, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let trailer_len = if hmac_key.is_some() {
        HMAC_TRAILER_LEN
    } else {
        CRC_TRAILER_LEN
    };
    let retcode_len = if msg.retcode.is_some() { RETCODE_LEN } else { 0 };
    let payload_len = retcode_len + msg.payload.len() + trailer_len;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload_len);
    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(msg.seqno.unwrap_or(0))?;
    data.write_u32::<BigEndian>(msg.cmd)?;
    data.write_u32::<BigEndian>(payload_len as u32)?;
    if let Some(rc) = msg.retcode {
        data.write_u32::<BigEndian>(rc)?;
    }
    data.extend_from_slice(&msg.payload);

    match hmac_key {
        Some(key) => {
            let tag = hmac_sha256(key, &data)?;
            data.extend_from_slice(&tag);
        }
        None => {
            let crc_val = CRC32.checksum(&data);
            data.write_u32::<BigEndian>(crc_val)?;
        }
    }
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;

    Ok(data)
}

/// Parse a 55AA header from binary data.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_SIZE {
        return Err(TuyaError::framing("header too short", data));
    }

    let mut cursor = Cursor::new(data);
    let prefix = cursor.read_u32::<BigEndian>()?;
    if prefix != PREFIX_55AA {
        return Err(TuyaError::framing(
            format!("bad prefix {:#010x}", prefix),
            data,
        ));
    }
    let seqno = cursor.read_u32::<BigEndian>()?;
    let cmd = cursor.read_u32::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;

    Ok(TuyaHeader {
        seqno,
        cmd,
        payload_len,
        total_length: payload_len as usize + HEADER_SIZE,
    })
}

/// Unpack exactly one packet. The payload is returned in wire form (still
/// encrypted); only framing, integrity and the return code are handled here.
///
/// Integrity is checked over the packet's real boundaries before the declared
/// length is trusted, so a damaged length field reports as an integrity error.
pub fn unpack_message(
    data: &[u8],
    version: Version,
    hmac_key: Option<&[u8]>,
) -> Result<TuyaMessage> {
    if data.len() < MIN_PACKET_LEN {
        return Err(TuyaError::framing(
            format!("packet of {} bytes is shorter than {}", data.len(), MIN_PACKET_LEN),
            data,
        ));
    }
    if data[data.len() - 4..] != SUFFIX_BYTES {
        return Err(TuyaError::framing("missing 0000AA55 suffix", data));
    }
    let header = parse_header(data)?;

    let trailer_len = if hmac_key.is_some() {
        HMAC_TRAILER_LEN
    } else {
        CRC_TRAILER_LEN
    };
    if data.len() < HEADER_SIZE + trailer_len {
        return Err(TuyaError::framing("packet too short for its trailer", data));
    }
    let payload_end = data.len() - trailer_len;
    let signed = &data[..payload_end];

    match hmac_key {
        Some(key) => {
            let tag = &data[payload_end..payload_end + HMAC_LEN];
            if !verify_hmac_sha256(key, signed, tag)? {
                return Err(TuyaError::HmacMismatch {
                    cmd: header.cmd,
                    seqno: header.seqno,
                    raw: data.to_vec(),
                });
            }
        }
        None => {
            let expected = BigEndian::read_u32(&data[payload_end..payload_end + 4]);
            let actual = CRC32.checksum(signed);
            if expected != actual {
                return Err(TuyaError::CrcMismatch {
                    cmd: header.cmd,
                    seqno: header.seqno,
                    expected,
                    actual,
                    raw: data.to_vec(),
                });
            }
        }
    }

    if header.total_length != data.len() {
        return Err(TuyaError::framing(
            format!(
                "declared length {} does not match packet size {}",
                header.total_length,
                data.len()
            ),
            data,
        ));
    }

    // A leading u32 with its upper 24 bits clear is taken as a return code.
    // Devices never send it reliably, so this is a guess by shape.
    let mut payload_start = HEADER_SIZE;
    let mut retcode = None;
    if payload_end - payload_start >= RETCODE_LEN {
        let candidate = BigEndian::read_u32(&data[payload_start..payload_start + RETCODE_LEN]);
        if candidate & 0xFFFF_FF00 == 0 {
            retcode = Some(candidate);
            payload_start += RETCODE_LEN;
        }
    }

    Ok(TuyaMessage {
        version,
        seqno: Some(header.seqno),
        cmd: header.cmd,
        retcode,
        payload: data[payload_start..payload_end].to_vec(),
    })
}

fn find_marker(buf: &[u8], from: usize, marker: &[u8; 4]) -> Option<usize> {
    buf.get(from..)?
        .windows(marker.len())
        .position(|w| w == marker)
        .map(|i| i + from)
}

/// Split a read buffer into candidate packets, in order.
///
/// Each packet starts at a `000055AA` prefix. Its end is the declared length
/// when that lands on a `0000AA55` suffix, otherwise the next suffix marker.
/// Bytes before a prefix and any trailing partial packet are dropped.
pub fn split_packets(buf: &[u8]) -> Vec<&[u8]> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while let Some(start) = find_marker(buf, pos, &PREFIX_BYTES) {
        let rest = &buf[start..];
        if rest.len() < MIN_PACKET_LEN {
            break;
        }

        let declared = BigEndian::read_u32(&rest[12..HEADER_SIZE]) as usize + HEADER_SIZE;
        let end = if declared >= MIN_PACKET_LEN
            && declared <= rest.len()
            && rest[declared - 4..declared] == SUFFIX_BYTES
        {
            declared
        } else {
            match find_marker(rest, MIN_PACKET_LEN - 4, &SUFFIX_BYTES) {
                Some(i) => i + 4,
                None => break,
            }
        };

        packets.push(&rest[..end]);
        pos = start + end;
    }

    packets
}
